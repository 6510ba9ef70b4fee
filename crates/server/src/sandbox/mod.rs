//! Isolated execution environments.
//!
//! A [`SandboxProvider`] creates sandboxes from templates and reconnects to
//! existing ones by id. A [`Sandbox`] handle reports liveness, extends its
//! idle deadline, maps ports to externally reachable hosts, spawns shells
//! and exposes the working tree as a [`FileStore`].

pub mod local;
pub mod pty;
pub mod templates;

#[cfg(test)]
pub mod fake;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::Dimensions;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::files::FileStore;

pub use local::LocalSandboxProvider;
pub use pty::PtyProcess;
pub use templates::template_for;

/// Capacity of a shell's output channel, in chunks.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

/// Raw output of a shell. The channel closes when the process exits.
pub type OutputStream = mpsc::Receiver<Vec<u8>>;

/// Errors reported by sandbox providers and handles.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No sandbox with this id exists.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// The provider could not create a sandbox.
    #[error("failed to create sandbox from template {template}: {reason}")]
    CreateFailed { template: String, reason: String },

    /// The idle deadline could not be changed.
    #[error("failed to set sandbox timeout: {0}")]
    TimeoutFailed(String),

    /// Failed to spawn a shell.
    #[error("failed to spawn shell: {0}")]
    SpawnFailed(String),

    /// Failed to write to a shell.
    #[error("failed to write to shell: {0}")]
    WriteFailed(String),

    /// Failed to resize a shell.
    #[error("failed to resize shell: {0}")]
    ResizeFailed(String),

    /// Failed to kill a shell.
    #[error("failed to kill shell: {0}")]
    KillFailed(String),

    /// Sandbox metadata is unreadable.
    #[error("invalid sandbox metadata: {0}")]
    Metadata(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// How to start a shell inside a sandbox.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOptions {
    /// Shell command; the sandbox default when `None`.
    pub shell: Option<String>,
    /// Working directory relative to the sandbox tree root.
    pub cwd: Option<String>,
    pub dimensions: Dimensions,
    pub env: Vec<(String, String)>,
}

impl Default for ShellOptions {
    fn default() -> Self {
        Self {
            shell: None,
            cwd: None,
            dimensions: Dimensions::default(),
            env: vec![("TERM".to_string(), "xterm-256color".to_string())],
        }
    }
}

/// A running shell process inside a sandbox.
#[async_trait]
pub trait ShellProcess: Send + Sync {
    /// Process id, when the backend exposes one.
    fn pid(&self) -> Option<u32>;

    /// Forwards input bytes to the process.
    async fn write(&self, data: &[u8]) -> Result<(), SandboxError>;

    /// Changes the terminal size.
    async fn resize(&self, dimensions: Dimensions) -> Result<(), SandboxError>;

    /// Terminates the process. Calling it again is a no-op.
    async fn kill(&self) -> Result<(), SandboxError>;
}

/// Handle to one sandbox.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn id(&self) -> &str;

    /// Whether the sandbox can currently run processes.
    async fn is_running(&self) -> bool;

    /// Moves the idle deadline to `timeout` from now.
    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError>;

    /// Externally reachable host (no scheme) for a port inside the sandbox.
    fn host(&self, port: u16) -> String;

    /// Starts a shell and returns it with its output stream.
    async fn spawn_shell(
        &self,
        options: ShellOptions,
    ) -> Result<(Box<dyn ShellProcess>, OutputStream), SandboxError>;

    /// File access to the sandbox tree.
    fn files(&self) -> Arc<dyn FileStore>;
}

/// Source of sandboxes.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    /// Creates a sandbox from `template` with an initial idle deadline.
    async fn create(
        &self,
        template: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Sandbox>, SandboxError>;

    /// Reattaches to an existing sandbox. The handle may report not running.
    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError>;
}
