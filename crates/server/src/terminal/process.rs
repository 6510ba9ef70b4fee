//! One shell process and its output bridge.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use protocol::Dimensions;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::sandbox::{OutputStream, SandboxError, ShellProcess};

/// Receives decoded output chunks of one terminal.
pub type OutputSink = Arc<dyn Fn(String) + Send + Sync>;

/// A shell process bridged to an output sink.
///
/// Output is decoded as UTF-8 and handed to the sink in the order the
/// process emitted it. Once [`close`](Self::close) runs the sink is never
/// invoked again.
pub struct ProcessSession {
    id: String,
    process: Box<dyn ShellProcess>,
    sink: Arc<Mutex<Option<OutputSink>>>,
    forwarder: JoinHandle<()>,
    closed: AtomicBool,
}

impl ProcessSession {
    /// Starts forwarding `output` to `sink`.
    pub fn start(
        id: impl Into<String>,
        process: Box<dyn ShellProcess>,
        output: OutputStream,
        sink: OutputSink,
    ) -> Self {
        let id = id.into();
        let sink = Arc::new(Mutex::new(Some(sink)));
        let forwarder = tokio::spawn(forward_output(id.clone(), output, Arc::clone(&sink)));
        Self {
            id,
            process,
            sink,
            forwarder,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sends input to the process.
    pub async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        self.process.write(data).await
    }

    pub async fn resize(&self, dimensions: Dimensions) -> Result<(), SandboxError> {
        self.process.resize(dimensions).await
    }

    /// Detaches the sink and terminates the process.
    ///
    /// Only the first call has any effect.
    pub async fn close(&self) -> Result<(), SandboxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Taking the sink under its lock waits out an in-flight delivery.
        self.sink.lock().await.take();
        self.forwarder.abort();

        let result = self.process.kill().await;
        tracing::debug!(terminal_id = %self.id, ok = result.is_ok(), "Closed terminal");
        result
    }
}

impl Drop for ProcessSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_output(id: String, mut output: OutputStream, sink: Arc<Mutex<Option<OutputSink>>>) {
    let mut decoder = Utf8Decoder::default();
    while let Some(chunk) = output.recv().await {
        let text = decoder.decode(&chunk);
        if text.is_empty() {
            continue;
        }
        let guard = sink.lock().await;
        match guard.as_ref() {
            Some(deliver) => deliver(text),
            None => break,
        }
    }
    tracing::debug!(terminal_id = %id, "Terminal output ended");
}

/// Incremental UTF-8 decoder.
///
/// A multi-byte character split across chunks is held back until the rest
/// arrives. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        // Incomplete sequence at the end; keep it for later.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }
}
