//! Per-project session management.
//!
//! A [`ProjectSession`] owns everything bound to one project: its sandbox
//! handle, terminal multiplexer, file adapter and file watcher. The
//! [`ProjectRegistry`] shares one session between all connections of a
//! project and tears it down when the last one leaves.

pub mod registry;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::deploy::{DeployError, DeploymentClient};
use crate::files::FileError;
use crate::lock::KeyedMutex;
use crate::sandbox::{SandboxError, SandboxProvider, ShellOptions};
use crate::store::{ProjectRecordStore, StoreError};

pub use registry::ProjectRegistry;
pub use session::{ProjectSession, PushSender};

/// Errors surfaced by project sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// No running sandbox could be reused, reconnected or created.
    #[error("sandbox provisioning failed: {0}")]
    Provisioning(String),

    /// A collaborator the operation needs is missing or not ready.
    #[error("{0} is not available")]
    CollaboratorUnavailable(&'static str),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error(transparent)]
    File(#[from] FileError),

    #[error(transparent)]
    Deploy(#[from] DeployError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Lifecycle phase of a project session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No components are bound.
    Uninitialized,
    /// Sandbox reconciliation is in progress.
    Reconciling,
    /// Sandbox and components are bound.
    Ready,
}

/// Tunables shared by all sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Idle deadline applied on initialize and owner heartbeats.
    pub idle_timeout: Duration,
    /// How terminals are spawned.
    pub shell: ShellOptions,
    /// Watch the tree and push `loaded` refreshes.
    pub watch_files: bool,
    pub watch_debounce: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            shell: ShellOptions::default(),
            watch_files: true,
            watch_debounce: crate::files::watcher::DEFAULT_DEBOUNCE,
        }
    }
}

/// Collaborators injected into every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub provider: Arc<dyn SandboxProvider>,
    pub records: Arc<dyn ProjectRecordStore>,
    /// Shared by every session so that one project id maps to one lock.
    pub locks: Arc<KeyedMutex>,
    pub deploy: Option<Arc<dyn DeploymentClient>>,
    pub settings: SessionSettings,
}
