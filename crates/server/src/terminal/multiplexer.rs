//! Terminals of one project, keyed by caller-chosen ids.

use std::sync::Arc;

use dashmap::DashMap;
use protocol::Dimensions;

use super::process::{OutputSink, ProcessSession};
use crate::sandbox::{Sandbox, SandboxError, ShellOptions};

/// Registry of shell processes running in one sandbox.
///
/// Each logical id maps to at most one live process. Operations addressed
/// to an id with no process report `false` instead of failing.
pub struct TerminalMultiplexer {
    sandbox: Arc<dyn Sandbox>,
    shell: ShellOptions,
    sessions: DashMap<String, Arc<ProcessSession>>,
}

impl TerminalMultiplexer {
    /// Creates an empty multiplexer spawning shells with `shell`.
    pub fn new(sandbox: Arc<dyn Sandbox>, shell: ShellOptions) -> Self {
        Self {
            sandbox,
            shell,
            sessions: DashMap::new(),
        }
    }

    /// Id of the sandbox the shells run in.
    pub fn sandbox_id(&self) -> &str {
        self.sandbox.id()
    }

    /// Spawns a shell under `id`, replacing (and closing) any previous one.
    pub async fn create_terminal(&self, id: &str, sink: OutputSink) -> Result<(), SandboxError> {
        if let Some((_, previous)) = self.sessions.remove(id) {
            tracing::debug!(terminal_id = %id, "Replacing existing terminal");
            close_logged(&previous).await;
        }

        let (process, output) = self.sandbox.spawn_shell(self.shell.clone()).await?;
        let session = Arc::new(ProcessSession::start(id, process, output, sink));

        // A concurrent create for the same id may have landed meanwhile.
        if let Some(raced) = self.sessions.insert(id.to_string(), session) {
            close_logged(&raced).await;
        }

        tracing::info!(
            sandbox_id = %self.sandbox.id(),
            terminal_id = %id,
            "Created terminal"
        );
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Arc<ProcessSession>> {
        self.sessions.get(id).map(|s| Arc::clone(s.value()))
    }

    /// Forwards input to terminal `id`. Returns whether it exists.
    pub async fn send_terminal_data(&self, id: &str, data: &str) -> Result<bool, SandboxError> {
        match self.get(id) {
            Some(session) => {
                session.write(data.as_bytes()).await?;
                Ok(true)
            }
            None => {
                tracing::debug!(terminal_id = %id, "Input for unknown terminal ignored");
                Ok(false)
            }
        }
    }

    /// Resizes terminal `id`. Returns whether it exists.
    pub async fn resize_terminal(&self, id: &str, dimensions: Dimensions) -> Result<bool, SandboxError> {
        match self.get(id) {
            Some(session) => {
                session.resize(dimensions).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Resizes every terminal and returns how many accepted the new size.
    ///
    /// A failure on one terminal does not stop the others.
    pub async fn resize_all(&self, dimensions: Dimensions) -> usize {
        let mut resized = 0;
        for session in self.snapshot() {
            match session.resize(dimensions).await {
                Ok(()) => resized += 1,
                Err(e) => {
                    tracing::warn!(terminal_id = %session.id(), error = %e, "Failed to resize terminal")
                }
            }
        }
        resized
    }

    /// Closes terminal `id`. Returns whether it existed.
    pub async fn close_terminal(&self, id: &str) -> Result<bool, SandboxError> {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.close().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Closes every terminal and empties the registry. Returns how many
    /// were closed.
    pub async fn close_all_terminals(&self) -> usize {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut closed = 0;
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                close_logged(&session).await;
                closed += 1;
            }
        }
        closed
    }

    /// Ids of live terminals, sorted.
    pub fn terminal_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<ProcessSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

async fn close_logged(session: &ProcessSession) {
    if let Err(e) = session.close().await {
        tracing::warn!(terminal_id = %session.id(), error = %e, "Failed to close terminal");
    }
}
