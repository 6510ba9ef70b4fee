//! In-memory sandbox doubles for tests.
//!
//! Shells are loopbacks: whatever is written comes back as output. Every
//! call the session layer makes is counted so tests can assert on exactly
//! how often a provider was asked to create, connect or extend.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use protocol::Dimensions;
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::{
    OutputStream, Sandbox, SandboxError, SandboxProvider, ShellOptions, ShellProcess,
    OUTPUT_CHANNEL_CAPACITY,
};
use crate::files::{FileStore, LocalFileStore};

/// Provider double.
pub struct FakeProvider {
    dir: TempDir,
    sandboxes: DashMap<String, Arc<FakeSandbox>>,
    next_id: AtomicUsize,
    pub creates: AtomicUsize,
    pub connects: AtomicUsize,
    pub created_templates: Mutex<Vec<String>>,
    /// Whether newly created sandboxes report running.
    pub create_running: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_connect: AtomicBool,
    /// Delay inside `create`, to widen race windows.
    pub create_delay: Mutex<Duration>,
}

impl FakeProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            dir: TempDir::new().expect("temp dir"),
            sandboxes: DashMap::new(),
            next_id: AtomicUsize::new(1),
            creates: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            created_templates: Mutex::new(Vec::new()),
            create_running: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            create_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// Registers a sandbox that `connect` can find.
    pub fn insert(&self, id: &str, running: bool) -> Arc<FakeSandbox> {
        let sandbox = Arc::new(FakeSandbox::new(id, self.dir.path().join(id), running));
        self.sandboxes.insert(id.to_string(), Arc::clone(&sandbox));
        sandbox
    }

    pub fn sandbox(&self, id: &str) -> Option<Arc<FakeSandbox>> {
        self.sandboxes.get(id).map(|s| Arc::clone(s.value()))
    }

    pub fn create_count(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxProvider for FakeProvider {
    async fn create(
        &self,
        template: &str,
        _timeout: Duration,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.created_templates
            .lock()
            .unwrap()
            .push(template.to_string());

        let delay = *self.create_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(SandboxError::CreateFailed {
                template: template.to_string(),
                reason: "quota exceeded".to_string(),
            });
        }

        let id = format!("sbx-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let sandbox = self.insert(&id, self.create_running.load(Ordering::SeqCst));
        Ok(sandbox)
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        match self.sandbox(id) {
            Some(sandbox) => Ok(sandbox),
            None => Err(SandboxError::NotFound(id.to_string())),
        }
    }
}

/// Sandbox double.
pub struct FakeSandbox {
    id: String,
    files: Arc<LocalFileStore>,
    pub running: AtomicBool,
    pub fail_timeout: AtomicBool,
    pub fail_spawn: AtomicBool,
    pub timeout_calls: AtomicUsize,
    pub processes: Mutex<Vec<Arc<FakeProcessState>>>,
}

impl FakeSandbox {
    fn new(id: &str, root: std::path::PathBuf, running: bool) -> Self {
        Self {
            id: id.to_string(),
            files: Arc::new(LocalFileStore::new(root).expect("sandbox root")),
            running: AtomicBool::new(running),
            fail_timeout: AtomicBool::new(false),
            fail_spawn: AtomicBool::new(false),
            timeout_calls: AtomicUsize::new(0),
            processes: Mutex::new(Vec::new()),
        }
    }

    pub fn timeout_count(&self) -> usize {
        self.timeout_calls.load(Ordering::SeqCst)
    }

    /// State of every process spawned so far, in spawn order.
    pub fn spawned(&self) -> Vec<Arc<FakeProcessState>> {
        self.processes.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn set_timeout(&self, _timeout: Duration) -> Result<(), SandboxError> {
        self.timeout_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_timeout.load(Ordering::SeqCst) {
            return Err(SandboxError::TimeoutFailed("sandbox is paused".to_string()));
        }
        Ok(())
    }

    fn host(&self, port: u16) -> String {
        format!("{port}-{}.fake.test", self.id)
    }

    async fn spawn_shell(
        &self,
        options: ShellOptions,
    ) -> Result<(Box<dyn ShellProcess>, OutputStream), SandboxError> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(SandboxError::SpawnFailed("no capacity".to_string()));
        }
        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let state = Arc::new(FakeProcessState {
            output: Mutex::new(Some(tx)),
            kills: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
            resizes: Mutex::new(vec![options.dimensions]),
        });
        self.processes.lock().unwrap().push(Arc::clone(&state));
        Ok((Box::new(FakeProcess { state }), rx))
    }

    fn files(&self) -> Arc<dyn FileStore> {
        self.files.clone()
    }
}

/// Observable state of a loopback process.
pub struct FakeProcessState {
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    pub kills: AtomicUsize,
    pub writes: Mutex<Vec<u8>>,
    /// Initial size followed by every resize.
    pub resizes: Mutex<Vec<Dimensions>>,
}

impl FakeProcessState {
    /// Emits output as if the process printed it.
    pub async fn emit(&self, data: &str) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(data.as_bytes().to_vec()).await;
        }
    }

    /// Emits raw bytes, which may be partial UTF-8.
    pub async fn emit_bytes(&self, data: &[u8]) {
        let tx = self.output.lock().unwrap().clone();
        if let Some(tx) = tx {
            let _ = tx.send(data.to_vec()).await;
        }
    }

    pub fn kill_count(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn last_size(&self) -> Option<Dimensions> {
        self.resizes.lock().unwrap().last().copied()
    }
}

struct FakeProcess {
    state: Arc<FakeProcessState>,
}

#[async_trait]
impl ShellProcess for FakeProcess {
    fn pid(&self) -> Option<u32> {
        None
    }

    async fn write(&self, data: &[u8]) -> Result<(), SandboxError> {
        self.state.writes.lock().unwrap().extend_from_slice(data);
        let tx = self.state.output.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(data.to_vec())
                .await
                .map_err(|e| SandboxError::WriteFailed(e.to_string())),
            None => Err(SandboxError::WriteFailed("process was killed".to_string())),
        }
    }

    async fn resize(&self, dimensions: Dimensions) -> Result<(), SandboxError> {
        self.state.resizes.lock().unwrap().push(dimensions);
        Ok(())
    }

    async fn kill(&self) -> Result<(), SandboxError> {
        self.state.kills.fetch_add(1, Ordering::SeqCst);
        self.state.output.lock().unwrap().take();
        Ok(())
    }
}
