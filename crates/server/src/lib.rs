//! # Sandpit Server Library
//!
//! Session orchestration and terminal multiplexing for a browser IDE.
//!
//! ## Overview
//!
//! Browsers connect over WebSocket, one connection per open project tab.
//! The server binds every connection of a project to a shared
//! [`ProjectSession`], which owns:
//!
//! - **Sandbox**: the isolated environment the project runs in, reused,
//!   reconnected or created on demand
//! - **Terminals**: any number of shells multiplexed by caller-chosen ids
//! - **Files**: file operations on the sandbox tree, plus change pushes
//! - **Deployment**: packaging the tree and pushing it to a remote service
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Server Orchestrator                         │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  WebSocket Transport  (handshake, per-connection tasks)    │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐  │
//! │  │    Router    │  │  Admission   │  │   Project Registry   │  │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │  Project Session  (keyed lock, sandbox reconciliation)     │ │
//! │  │   ├─ Terminal Multiplexer ── Process Sessions              │ │
//! │  │   ├─ File Store + Watcher                                  │ │
//! │  │   └─ Deployment Client                                     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use server::{Config, ServerOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let orchestrator = ServerOrchestrator::new(config)?;
//!     orchestrator.start().await?;
//!
//!     // Serving until a shutdown signal arrives...
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`lock`]: Per-key async mutual exclusion
//! - [`sandbox`]: Sandbox provider abstraction and the local provider
//! - [`terminal`]: Process sessions, the multiplexer and preview detection
//! - [`files`]: File store and change watcher
//! - [`project`]: Project sessions and the registry that shares them
//! - [`deploy`]: Deployment service client
//! - [`store`]: Project records and access control
//! - [`admission`]: Rate limiting of mutating operations
//! - [`router`]: Request dispatch
//! - [`transport`]: WebSocket handshake and connection handling
//! - [`orchestrator`]: Main server coordinator

pub mod admission;
pub mod config;
pub mod deploy;
pub mod files;
pub mod lock;
pub mod orchestrator;
pub mod project;
pub mod router;
pub mod sandbox;
pub mod store;
pub mod terminal;
pub mod transport;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use lock::KeyedMutex;
pub use orchestrator::{OrchestratorEvent, OrchestratorState, ServerOrchestrator};
pub use project::{ProjectRegistry, ProjectSession, SessionError, SessionPhase};
pub use router::{Router, RouterError};
pub use sandbox::{LocalSandboxProvider, Sandbox, SandboxError, SandboxProvider};
pub use store::{JsonProjectStore, ProjectRecord};
pub use terminal::TerminalMultiplexer;
pub use transport::{Transport, TransportError, TransportSettings};
