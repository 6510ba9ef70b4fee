//! Shell processes on a local pseudo-terminal.

use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use protocol::Dimensions;
use tokio::sync::{mpsc, Mutex};

use super::{OutputStream, SandboxError, ShellOptions, ShellProcess, OUTPUT_CHANNEL_CAPACITY};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// A shell attached to a PTY.
pub struct PtyProcess {
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    /// Cleared when the output reaches EOF or the process is killed.
    running: Arc<AtomicBool>,
    killed: AtomicBool,
    pid: Option<u32>,
}

impl PtyProcess {
    /// Spawns a shell in `cwd` and starts pumping its output.
    ///
    /// Output chunks are delivered in order on the returned stream, which
    /// closes when the shell exits. A full stream applies backpressure to
    /// the reader instead of dropping output.
    pub fn spawn(options: &ShellOptions, cwd: &Path) -> Result<(Self, OutputStream), SandboxError> {
        let shell_cmd = detect_shell(options.shell.clone());

        let pair = native_pty_system()
            .openpty(PtySize {
                rows: options.dimensions.rows,
                cols: options.dimensions.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_cmd);
        cmd.cwd(cwd);
        for (key, value) in &options.env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        // The slave must be closed here or the reader never sees EOF.
        drop(pair.slave);

        let pid = child.process_id();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SandboxError::SpawnFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        start_read_loop(reader, output_tx, Arc::clone(&running), pid);

        tracing::debug!(pid = ?pid, shell = %shell_cmd, cwd = %cwd.display(), "Spawned PTY shell");

        Ok((
            Self {
                master: Arc::new(Mutex::new(pair.master)),
                writer: Arc::new(Mutex::new(writer)),
                child: Arc::new(Mutex::new(child)),
                running,
                killed: AtomicBool::new(false),
                pid,
            },
            output_rx,
        ))
    }

    /// Returns whether the shell is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// Reads the PTY on a blocking thread until EOF, an error, or until the
/// consumer drops the stream.
fn start_read_loop(
    mut reader: Box<dyn Read + Send>,
    output_tx: mpsc::Sender<Vec<u8>>,
    running: Arc<AtomicBool>,
    pid: Option<u32>,
) {
    tokio::task::spawn_blocking(move || {
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buffer) {
                Ok(0) => {
                    tracing::debug!(pid = ?pid, "PTY EOF - process exited");
                    break;
                }
                Ok(n) => {
                    if output_tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        tracing::trace!(pid = ?pid, "Output stream dropped");
                        break;
                    }
                }
                Err(e) => {
                    // EIO is the normal end of a PTY whose child has exited.
                    if running.load(Ordering::SeqCst) {
                        tracing::debug!(pid = ?pid, error = %e, "PTY read ended");
                    }
                    break;
                }
            }
        }
        running.store(false, Ordering::SeqCst);
    });
}

#[async_trait]
impl ShellProcess for PtyProcess {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        if self.killed.load(Ordering::SeqCst) {
            return Err(SandboxError::WriteFailed("process was killed".to_string()));
        }

        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SandboxError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SandboxError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    async fn resize(&self, dimensions: Dimensions) -> Result<(), SandboxError> {
        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows: dimensions.rows,
                cols: dimensions.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SandboxError::ResizeFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, cols = dimensions.cols, rows = dimensions.rows, "Resized PTY");
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        if self.killed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.running.store(false, Ordering::SeqCst);

        let child = Arc::clone(&self.child);
        let status = tokio::task::spawn_blocking(move || {
            let mut child = child.blocking_lock();
            if let Ok(Some(status)) = child.try_wait() {
                return Ok(status);
            }
            child.kill()?;
            child.wait()
        })
        .await
        .map_err(|e| SandboxError::KillFailed(e.to_string()))?
        .map_err(|e| SandboxError::KillFailed(e.to_string()))?;

        tracing::debug!(pid = ?self.pid, exit_code = status.exit_code(), "Killed PTY shell");
        Ok(())
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if !self.killed.load(Ordering::SeqCst) {
            if let Ok(mut child) = self.child.try_lock() {
                let _ = child.kill();
            }
        }
    }
}

/// Picks the shell: the configured one, then `$SHELL`, then `/bin/sh`.
fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell {
        return s;
    }

    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}
