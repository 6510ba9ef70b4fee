//! The session bound to one project.

use std::sync::Arc;

use base64::Engine;
use protocol::messages::AppInfo;
use protocol::{Dimensions, FileNode, ServerEvent};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use super::{SessionDeps, SessionError, SessionPhase};
use crate::deploy::{DeployError, DeploymentClient};
use crate::files::{FileStore, FileWatcher};
use crate::sandbox::{template_for, Sandbox};
use crate::store::ProjectRecord;
use crate::terminal::{preview, OutputSink, TerminalMultiplexer};

/// Per-connection channel for server pushes.
pub type PushSender = mpsc::UnboundedSender<ServerEvent>;

/// Capacity of the project-wide event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Outcome of an app existence query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppExistence {
    /// `false` when no connected deployment client could be asked.
    pub success: bool,
    pub exists: Option<bool>,
}

/// A running file watch and the task turning its signals into `loaded`
/// pushes.
struct TreeWatch {
    _watcher: FileWatcher,
    refresher: JoinHandle<()>,
}

impl Drop for TreeWatch {
    fn drop(&mut self) {
        self.refresher.abort();
    }
}

struct SessionState {
    phase: SessionPhase,
    /// Last sandbox this project was bound to.
    sandbox_id: Option<String>,
    /// Set between creating a sandbox and recording its id.
    pending_persist: bool,
    sandbox: Option<Arc<dyn Sandbox>>,
    terminals: Option<Arc<TerminalMultiplexer>>,
    files: Option<Arc<dyn FileStore>>,
    watch: Option<TreeWatch>,
}

/// Façade over one project's sandbox and the components bound to it.
///
/// Provisioning and terminal creation run under the project's keyed lock,
/// so concurrent connections of the same project never race to create a
/// second sandbox. Everything else goes straight to the bound component.
pub struct ProjectSession {
    project_id: String,
    project_type: String,
    deps: SessionDeps,
    state: RwLock<SessionState>,
    events: broadcast::Sender<ServerEvent>,
}

impl ProjectSession {
    pub fn new(record: &ProjectRecord, deps: SessionDeps) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            project_id: record.id.clone(),
            project_type: record.project_type.clone(),
            deps,
            state: RwLock::new(SessionState {
                phase: SessionPhase::Uninitialized,
                sandbox_id: record.sandbox_id.clone(),
                pending_persist: false,
                sandbox: None,
                terminals: None,
                files: None,
                watch: None,
            }),
            events,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_type(&self) -> &str {
        &self.project_type
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.read().await.phase
    }

    /// Last-known sandbox id.
    pub async fn sandbox_id(&self) -> Option<String> {
        self.state.read().await.sandbox_id.clone()
    }

    /// Project-wide pushes, such as file tree refreshes.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Provisioning
    // ------------------------------------------------------------------

    /// Binds the session to a running sandbox and builds its components.
    ///
    /// Safe to call repeatedly and concurrently; callers for the same
    /// project are serialized and later ones reuse the sandbox found by
    /// the first.
    pub async fn initialize(&self) -> Result<(), SessionError> {
        self.deps
            .locks
            .acquire(&self.project_id, self.initialize_locked())
            .await
    }

    async fn initialize_locked(&self) -> Result<(), SessionError> {
        self.state.write().await.phase = SessionPhase::Reconciling;

        let sandbox = match self.reconcile().await {
            Ok(sandbox) => sandbox,
            Err(e) => {
                tracing::error!(project_id = %self.project_id, error = %e, "Sandbox reconciliation failed");
                self.reset().await;
                return Err(e);
            }
        };

        if let Err(e) = sandbox.set_timeout(self.deps.settings.idle_timeout).await {
            tracing::warn!(
                project_id = %self.project_id,
                sandbox_id = %sandbox.id(),
                error = %e,
                "Failed to apply idle timeout"
            );
        }

        self.bind_components(sandbox).await;
        Ok(())
    }

    /// Finds a running sandbox: the held handle, then the persisted (or
    /// last-known) id, then a fresh one from the project's template.
    async fn reconcile(&self) -> Result<Arc<dyn Sandbox>, SessionError> {
        let (held, mut known_id, pending) = {
            let state = self.state.read().await;
            (
                state.sandbox.clone(),
                state.sandbox_id.clone(),
                state.pending_persist,
            )
        };

        if let Some(sandbox) = held {
            if sandbox.is_running().await {
                tracing::debug!(project_id = %self.project_id, sandbox_id = %sandbox.id(), "Reusing sandbox");
                self.persist_pending(sandbox.id()).await?;
                return Ok(sandbox);
            }
            tracing::info!(project_id = %self.project_id, sandbox_id = %sandbox.id(), "Held sandbox stopped running");
        }

        // The store wins over the in-memory id, which may be stale, unless
        // that id is a fresh sandbox the store has not recorded yet.
        if !pending {
            match self.deps.records.record(&self.project_id) {
                Ok(Some(record)) => {
                    if let Some(persisted) = record.sandbox_id {
                        if known_id.as_deref() != Some(persisted.as_str()) {
                            tracing::debug!(project_id = %self.project_id, sandbox_id = %persisted, "Using persisted sandbox id");
                        }
                        known_id = Some(persisted);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(project_id = %self.project_id, error = %e, "Failed to read project record")
                }
            }
        }

        if let Some(id) = known_id {
            match self.deps.provider.connect(&id).await {
                Ok(sandbox) => {
                    if sandbox.is_running().await {
                        tracing::info!(project_id = %self.project_id, sandbox_id = %id, "Reconnected to sandbox");
                        self.persist_pending(&id).await?;
                        self.state.write().await.sandbox_id = Some(id);
                        return Ok(sandbox);
                    }
                    tracing::info!(project_id = %self.project_id, sandbox_id = %id, "Last-known sandbox is not running");
                }
                Err(e) => {
                    tracing::warn!(project_id = %self.project_id, sandbox_id = %id, error = %e, "Failed to connect to sandbox");
                }
            }
        }

        let template = template_for(&self.project_type);
        let sandbox = self
            .deps
            .provider
            .create(template, self.deps.settings.idle_timeout)
            .await
            .map_err(|e| SessionError::Provisioning(e.to_string()))?;
        if !sandbox.is_running().await {
            return Err(SessionError::Provisioning(format!(
                "sandbox {} created from {template} is not running",
                sandbox.id()
            )));
        }

        tracing::info!(
            project_id = %self.project_id,
            sandbox_id = %sandbox.id(),
            template = %template,
            "Created sandbox"
        );
        {
            let mut state = self.state.write().await;
            state.sandbox_id = Some(sandbox.id().to_string());
            state.pending_persist = true;
        }
        self.persist_pending(sandbox.id()).await?;
        Ok(sandbox)
    }

    /// Records a freshly created sandbox id if that has not happened yet.
    async fn persist_pending(&self, sandbox_id: &str) -> Result<(), SessionError> {
        if !self.state.read().await.pending_persist {
            return Ok(());
        }
        self.deps.records.save_sandbox_id(&self.project_id, sandbox_id)?;
        self.state.write().await.pending_persist = false;
        Ok(())
    }

    /// Drops the handle and every component after a failed reconciliation.
    /// The last-known id is kept.
    async fn reset(&self) {
        let mut state = self.state.write().await;
        if let Some(terminals) = state.terminals.take() {
            terminals.close_all_terminals().await;
        }
        state.watch = None;
        state.files = None;
        state.sandbox = None;
        state.phase = SessionPhase::Uninitialized;
    }

    async fn bind_components(&self, sandbox: Arc<dyn Sandbox>) {
        let settings = &self.deps.settings;
        let mut state = self.state.write().await;

        let rebound = state
            .sandbox
            .as_ref()
            .is_some_and(|held| held.id() != sandbox.id())
            || state
                .terminals
                .as_ref()
                .is_some_and(|t| t.sandbox_id() != sandbox.id());
        if rebound {
            tracing::info!(project_id = %self.project_id, sandbox_id = %sandbox.id(), "Rebinding components to new sandbox");
            if let Some(terminals) = state.terminals.take() {
                terminals.close_all_terminals().await;
            }
            state.watch = None;
            state.files = None;
        }
        state.sandbox = Some(Arc::clone(&sandbox));

        if state.terminals.is_none() {
            state.terminals = Some(Arc::new(TerminalMultiplexer::new(
                Arc::clone(&sandbox),
                settings.shell.clone(),
            )));
        }
        if state.files.is_none() {
            state.files = Some(sandbox.files());
        }
        if state.watch.is_none() && settings.watch_files {
            if let Some(files) = state.files.clone() {
                state.watch = self.start_watch(files);
            }
        }

        state.phase = SessionPhase::Ready;
        tracing::info!(project_id = %self.project_id, sandbox_id = %sandbox.id(), "Project session ready");
    }

    fn start_watch(&self, files: Arc<dyn FileStore>) -> Option<TreeWatch> {
        let root = files.root();
        match FileWatcher::start(&root, self.deps.settings.watch_debounce) {
            Ok((watcher, mut changes)) => {
                let events = self.events.clone();
                let project_id = self.project_id.clone();
                let refresher = tokio::spawn(async move {
                    while changes.recv().await.is_some() {
                        match files.file_tree().await {
                            Ok(tree) => {
                                // Nobody listening is fine.
                                let _ = events.send(ServerEvent::Loaded { tree });
                            }
                            Err(e) => {
                                tracing::warn!(project_id = %project_id, error = %e, "Failed to refresh file tree")
                            }
                        }
                    }
                });
                Some(TreeWatch {
                    _watcher: watcher,
                    refresher,
                })
            }
            Err(e) => {
                tracing::warn!(project_id = %self.project_id, root = %root.display(), error = %e, "File watching unavailable");
                None
            }
        }
    }

    /// Releases terminals, the file adapter and the watcher.
    ///
    /// The sandbox handle and last-known id are kept; the sandbox itself
    /// keeps running until its idle timeout pauses it. Returns how many
    /// terminals were closed.
    pub async fn disconnect(&self) -> usize {
        self.deps
            .locks
            .acquire(&self.project_id, async {
                let mut state = self.state.write().await;
                let closed = match state.terminals.take() {
                    Some(terminals) => terminals.close_all_terminals().await,
                    None => 0,
                };
                state.watch = None;
                state.files = None;
                state.phase = SessionPhase::Uninitialized;
                tracing::info!(project_id = %self.project_id, terminals = closed, "Project session disconnected");
                closed
            })
            .await
    }

    // ------------------------------------------------------------------
    // Keep-alive
    // ------------------------------------------------------------------

    /// Extends the sandbox idle deadline for owners.
    ///
    /// Collaborators never keep a sandbox alive, so their heartbeat is a
    /// successful no-op. Returns `false` when the extension failed.
    pub async fn heartbeat(&self, is_owner: bool) -> bool {
        if !is_owner {
            return true;
        }
        let sandbox = self.state.read().await.sandbox.clone();
        let Some(sandbox) = sandbox else {
            tracing::warn!(project_id = %self.project_id, "Heartbeat before a sandbox was bound");
            return false;
        };
        match sandbox.set_timeout(self.deps.settings.idle_timeout).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(project_id = %self.project_id, sandbox_id = %sandbox.id(), error = %e, "Failed to extend sandbox timeout");
                false
            }
        }
    }

    // ------------------------------------------------------------------
    // Terminals
    // ------------------------------------------------------------------

    /// Spawns a terminal whose output is pushed to `push`.
    ///
    /// Besides `terminalResponse` chunks, a dev-server URL seen in the
    /// output is pushed as `previewURL` with the sandbox's public host.
    pub async fn create_terminal(&self, terminal_id: &str, push: PushSender) -> Result<(), SessionError> {
        self.deps
            .locks
            .acquire(&self.project_id, async {
                let (terminals, sandbox) = self.terminals_for_create().await?;
                let sink = terminal_sink(terminal_id.to_string(), sandbox, push);
                terminals.create_terminal(terminal_id, sink).await?;
                Ok(())
            })
            .await
    }

    /// The multiplexer to create in, built on demand for a session that was
    /// disconnected but still holds its sandbox.
    async fn terminals_for_create(
        &self,
    ) -> Result<(Arc<TerminalMultiplexer>, Arc<dyn Sandbox>), SessionError> {
        let mut state = self.state.write().await;
        let sandbox = state
            .sandbox
            .clone()
            .ok_or(SessionError::CollaboratorUnavailable("sandbox"))?;
        let terminals = match &state.terminals {
            Some(terminals) => Arc::clone(terminals),
            None => {
                let terminals = Arc::new(TerminalMultiplexer::new(
                    Arc::clone(&sandbox),
                    self.deps.settings.shell.clone(),
                ));
                state.terminals = Some(Arc::clone(&terminals));
                terminals
            }
        };
        Ok((terminals, sandbox))
    }

    async fn terminals(&self) -> Option<Arc<TerminalMultiplexer>> {
        self.state.read().await.terminals.clone()
    }

    /// Forwards input to a terminal. Returns whether it exists.
    pub async fn send_terminal_data(&self, terminal_id: &str, data: &str) -> Result<bool, SessionError> {
        match self.terminals().await {
            Some(terminals) => Ok(terminals.send_terminal_data(terminal_id, data).await?),
            None => Ok(false),
        }
    }

    /// Resizes every terminal of the project. Returns how many were resized.
    pub async fn resize_terminal(&self, dimensions: Dimensions) -> usize {
        match self.terminals().await {
            Some(terminals) => terminals.resize_all(dimensions).await,
            None => 0,
        }
    }

    /// Resizes one terminal. Returns whether it exists.
    pub async fn resize_terminal_by_id(
        &self,
        terminal_id: &str,
        dimensions: Dimensions,
    ) -> Result<bool, SessionError> {
        match self.terminals().await {
            Some(terminals) => Ok(terminals.resize_terminal(terminal_id, dimensions).await?),
            None => Ok(false),
        }
    }

    /// Closes one terminal. Returns whether it existed.
    pub async fn close_terminal(&self, terminal_id: &str) -> Result<bool, SessionError> {
        match self.terminals().await {
            Some(terminals) => Ok(terminals.close_terminal(terminal_id).await?),
            None => Ok(false),
        }
    }

    pub async fn terminal_ids(&self) -> Vec<String> {
        match self.terminals().await {
            Some(terminals) => terminals.terminal_ids(),
            None => Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    async fn files(&self) -> Result<Arc<dyn FileStore>, SessionError> {
        self.state
            .read()
            .await
            .files
            .clone()
            .ok_or(SessionError::CollaboratorUnavailable("file store"))
    }

    pub async fn file_tree(&self) -> Result<Vec<FileNode>, SessionError> {
        Ok(self.files().await?.file_tree().await?)
    }

    pub async fn get_file(&self, id: &str) -> Result<String, SessionError> {
        Ok(self.files().await?.get_file(id).await?)
    }

    pub async fn get_folder(&self, id: &str) -> Result<Vec<String>, SessionError> {
        Ok(self.files().await?.get_folder(id).await?)
    }

    pub async fn save_file(&self, id: &str, body: &str) -> Result<(), SessionError> {
        Ok(self.files().await?.save_file(id, body).await?)
    }

    pub async fn create_file(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.files().await?.create_file(name).await?)
    }

    pub async fn create_folder(&self, name: &str) -> Result<bool, SessionError> {
        Ok(self.files().await?.create_folder(name).await?)
    }

    pub async fn rename_file(&self, id: &str, new_name: &str) -> Result<(), SessionError> {
        Ok(self.files().await?.rename_file(id, new_name).await?)
    }

    pub async fn move_file(&self, id: &str, folder_id: &str) -> Result<Vec<FileNode>, SessionError> {
        Ok(self.files().await?.move_file(id, folder_id).await?)
    }

    pub async fn delete_file(&self, id: &str) -> Result<Vec<FileNode>, SessionError> {
        Ok(self.files().await?.delete_file(id).await?)
    }

    pub async fn delete_folder(&self, id: &str) -> Result<Vec<FileNode>, SessionError> {
        Ok(self.files().await?.delete_folder(id).await?)
    }

    /// The project tree as a base64-encoded tar archive.
    pub async fn download_files(&self) -> Result<String, SessionError> {
        let archive = self.files().await?.archive().await?;
        Ok(base64::engine::general_purpose::STANDARD.encode(archive))
    }

    // ------------------------------------------------------------------
    // Deployment
    // ------------------------------------------------------------------

    fn deploy_client(&self) -> Result<&Arc<dyn DeploymentClient>, SessionError> {
        self.deps
            .deploy
            .as_ref()
            .ok_or(SessionError::CollaboratorUnavailable("deployment client"))
    }

    /// Pushes every project file to the deployment service under the
    /// project id.
    pub async fn deploy(&self) -> Result<(), SessionError> {
        let client = self.deploy_client()?;
        let files = self.files().await?;
        let exported = files.export_files().await?;
        tracing::info!(project_id = %self.project_id, files = exported.len(), "Deploying project");
        client.push_files(&self.project_id, exported).await?;
        Ok(())
    }

    pub async fn list_apps(&self) -> Result<Vec<AppInfo>, SessionError> {
        Ok(self.deploy_client()?.list_apps().await?)
    }

    pub async fn get_app_created_at(&self, app_name: &str) -> Result<Option<String>, SessionError> {
        Ok(self.deploy_client()?.app_created_at(app_name).await?)
    }

    /// Asks whether `app_name` is deployed. Reports `success: false`
    /// instead of failing when the deployment service cannot be reached.
    pub async fn app_exists(&self, app_name: &str) -> Result<AppExistence, SessionError> {
        let unavailable = AppExistence {
            success: false,
            exists: None,
        };
        let Some(client) = self.deps.deploy.as_ref() else {
            return Ok(unavailable);
        };
        match client.app_exists(app_name).await {
            Ok(exists) => Ok(AppExistence {
                success: true,
                exists: Some(exists),
            }),
            Err(DeployError::NotConnected) => Ok(unavailable),
            Err(e) => Err(e.into()),
        }
    }
}

/// Output sink for one terminal: forwards every chunk and announces
/// dev-server URLs.
fn terminal_sink(terminal_id: String, sandbox: Arc<dyn Sandbox>, push: PushSender) -> OutputSink {
    Arc::new(move |data: String| {
        let preview = preview::find_localhost_port(&data)
            .map(|port| preview::preview_url(&sandbox.host(port)));
        let _ = push.send(ServerEvent::TerminalResponse {
            id: terminal_id.clone(),
            data,
        });
        if let Some(url) = preview {
            tracing::debug!(terminal_id = %terminal_id, url = %url, "Detected preview URL");
            let _ = push.send(ServerEvent::PreviewUrl { url });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::fake::FakeDeploymentClient;
    use crate::lock::KeyedMutex;
    use crate::project::SessionSettings;
    use crate::sandbox::fake::FakeProvider;
    use crate::store::{JsonProjectStore, ProjectRecordStore, StoreError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// Record store whose writes can be made to fail.
    struct FlakyStore {
        inner: JsonProjectStore,
        fail: AtomicBool,
    }

    impl ProjectRecordStore for FlakyStore {
        fn record(&self, project_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
            self.inner.record(project_id)
        }

        fn save_sandbox_id(&self, project_id: &str, sandbox_id: &str) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(StoreError::Persist("disk full".to_string()));
            }
            self.inner.save_sandbox_id(project_id, sandbox_id)
        }
    }

    struct Harness {
        _dir: TempDir,
        provider: Arc<FakeProvider>,
        store: Arc<FlakyStore>,
        locks: Arc<KeyedMutex>,
        record: ProjectRecord,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_record(ProjectRecord::new("p1", "nextjs", "alice"))
        }

        fn with_record(record: ProjectRecord) -> Self {
            let dir = TempDir::new().unwrap();
            let inner = JsonProjectStore::new(dir.path().join("projects.json"));
            inner.upsert(record.clone()).unwrap();
            Self {
                _dir: dir,
                provider: FakeProvider::new(),
                store: Arc::new(FlakyStore {
                    inner,
                    fail: AtomicBool::new(false),
                }),
                locks: Arc::new(KeyedMutex::new()),
                record,
            }
        }

        fn deps(&self, deploy: Option<Arc<dyn DeploymentClient>>, watch_files: bool) -> SessionDeps {
            SessionDeps {
                provider: self.provider.clone(),
                records: self.store.clone(),
                locks: Arc::clone(&self.locks),
                deploy,
                settings: SessionSettings {
                    watch_files,
                    watch_debounce: Duration::from_millis(50),
                    ..SessionSettings::default()
                },
            }
        }

        fn session(&self) -> Arc<ProjectSession> {
            Arc::new(ProjectSession::new(&self.record, self.deps(None, false)))
        }

        fn persisted_id(&self) -> Option<String> {
            self.store.record("p1").unwrap().unwrap().sandbox_id
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("event in time")
            .expect("channel open")
    }

    #[tokio::test]
    async fn test_concurrent_initialize_creates_once() {
        let harness = Harness::new();
        *harness.provider.create_delay.lock().unwrap() = Duration::from_millis(50);
        let session = harness.session();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            handles.push(tokio::spawn(async move { session.initialize().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(harness.provider.create_count(), 1);
        assert_eq!(session.phase().await, SessionPhase::Ready);
        assert_eq!(harness.persisted_id().as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_separate_sessions_share_the_project_lock() {
        let harness = Harness::new();
        *harness.provider.create_delay.lock().unwrap() = Duration::from_millis(50);
        let first = harness.session();
        let second = harness.session();

        let (a, b) = tokio::join!(first.initialize(), second.initialize());
        a.unwrap();
        b.unwrap();

        assert_eq!(harness.provider.create_count(), 1);
        assert_eq!(second.sandbox_id().await.as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_initialize_uses_template_for_project_type() {
        let harness = Harness::with_record(ProjectRecord::new("p1", "streamlit", "alice"));
        harness.session().initialize().await.unwrap();
        assert_eq!(
            *harness.provider.created_templates.lock().unwrap(),
            vec!["sandpit-streamlit".to_string()]
        );
    }

    #[tokio::test]
    async fn test_reinitialize_reuses_running_sandbox() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        session.initialize().await.unwrap();

        assert_eq!(harness.provider.create_count(), 1);
        assert_eq!(harness.provider.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_to_running_last_known_sandbox() {
        let mut record = ProjectRecord::new("p1", "php", "alice");
        record.sandbox_id = Some("sbx-live".to_string());
        let harness = Harness::with_record(record);
        harness.provider.insert("sbx-live", true);

        let session = harness.session();
        session.initialize().await.unwrap();

        assert_eq!(harness.provider.connect_count(), 1);
        assert_eq!(harness.provider.create_count(), 0);
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-live"));
    }

    #[tokio::test]
    async fn test_stale_sandbox_is_replaced_and_persisted() {
        let mut record = ProjectRecord::new("p1", "nextjs", "alice");
        record.sandbox_id = Some("sbx-stale".to_string());
        let harness = Harness::with_record(record);
        harness.provider.insert("sbx-stale", false);

        let session = harness.session();
        session.initialize().await.unwrap();

        assert_eq!(harness.provider.create_count(), 1);
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-1"));
        assert_eq!(harness.persisted_id().as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_persisted_id_wins_over_stale_seed() {
        let mut record = ProjectRecord::new("p1", "nextjs", "alice");
        record.sandbox_id = Some("sbx-old".to_string());
        let harness = Harness::with_record(record);
        harness.provider.insert("sbx-old", false);
        harness.provider.insert("sbx-new", true);

        // Built from the record as read at handshake time.
        let session = harness.session();
        // Another session recorded a newer sandbox in the meantime.
        harness.store.inner.save_sandbox_id("p1", "sbx-new").unwrap();

        session.initialize().await.unwrap();

        assert_eq!(harness.provider.create_count(), 0);
        assert_eq!(harness.provider.connect_count(), 1);
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-new"));
        assert_eq!(harness.persisted_id().as_deref(), Some("sbx-new"));
    }

    #[tokio::test]
    async fn test_connect_failure_is_tolerated() {
        let mut record = ProjectRecord::new("p1", "nextjs", "alice");
        record.sandbox_id = Some("sbx-gone".to_string());
        let harness = Harness::with_record(record);
        harness.provider.fail_connect.store(true, Ordering::SeqCst);

        harness.session().initialize().await.unwrap();
        assert_eq!(harness.provider.create_count(), 1);
    }

    #[tokio::test]
    async fn test_created_but_not_running_is_provisioning_failure() {
        let harness = Harness::new();
        harness.provider.create_running.store(false, Ordering::SeqCst);
        let session = harness.session();

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, SessionError::Provisioning(_)));
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);
        assert_eq!(harness.persisted_id(), None);
        assert!(matches!(
            session.file_tree().await,
            Err(SessionError::CollaboratorUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_create_failure_is_provisioning_failure() {
        let harness = Harness::new();
        harness.provider.fail_create.store(true, Ordering::SeqCst);
        let session = harness.session();

        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, SessionError::Provisioning(_)));
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);
    }

    #[tokio::test]
    async fn test_persist_failure_is_retried_without_second_create() {
        let harness = Harness::new();
        harness.store.fail.store(true, Ordering::SeqCst);
        let session = harness.session();

        assert!(matches!(
            session.initialize().await,
            Err(SessionError::Store(_))
        ));
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-1"));

        harness.store.fail.store(false, Ordering::SeqCst);
        session.initialize().await.unwrap();

        assert_eq!(harness.provider.create_count(), 1);
        assert_eq!(harness.provider.connect_count(), 1);
        assert_eq!(harness.persisted_id().as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_timeout_failure_on_initialize_is_not_fatal() {
        let mut record = ProjectRecord::new("p1", "nextjs", "alice");
        record.sandbox_id = Some("sbx-live".to_string());
        let harness = Harness::with_record(record);
        let sandbox = harness.provider.insert("sbx-live", true);
        sandbox.fail_timeout.store(true, Ordering::SeqCst);

        let session = harness.session();
        session.initialize().await.unwrap();
        assert_eq!(session.phase().await, SessionPhase::Ready);
        assert_eq!(sandbox.timeout_count(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_is_owner_gated() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        let sandbox = harness.provider.sandbox("sbx-1").unwrap();
        let baseline = sandbox.timeout_count();

        assert!(session.heartbeat(false).await);
        assert_eq!(sandbox.timeout_count(), baseline);

        assert!(session.heartbeat(true).await);
        assert_eq!(sandbox.timeout_count(), baseline + 1);

        sandbox.fail_timeout.store(true, Ordering::SeqCst);
        assert!(!session.heartbeat(true).await);
        assert!(session.heartbeat(false).await);
    }

    #[tokio::test]
    async fn test_create_terminal_requires_sandbox() {
        let harness = Harness::new();
        let session = harness.session();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            session.create_terminal("main", tx).await,
            Err(SessionError::CollaboratorUnavailable("sandbox"))
        ));
    }

    #[tokio::test]
    async fn test_terminal_output_and_preview_url() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.create_terminal("main", tx).await.unwrap();
        let process = harness.provider.sandbox("sbx-1").unwrap().spawned().pop().unwrap();

        process.emit("\x1b[32mready\x1b[0m on http://localhost:3001/\r\n").await;

        match next_event(&mut rx).await {
            ServerEvent::TerminalResponse { id, data } => {
                assert_eq!(id, "main");
                assert!(data.contains("http://localhost:3001/"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(
            next_event(&mut rx).await,
            ServerEvent::PreviewUrl {
                url: "https://3001-sbx-1.fake.test".to_string()
            }
        );

        process.emit("no urls here").await;
        assert!(matches!(
            next_event(&mut rx).await,
            ServerEvent::TerminalResponse { .. }
        ));
        assert!(timeout(Duration::from_millis(100), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_terminals_are_isolated() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();

        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        session.create_terminal("a", tx_a).await.unwrap();
        session.create_terminal("b", tx_b).await.unwrap();

        assert!(session.send_terminal_data("b", "for-b").await.unwrap());
        assert_eq!(
            next_event(&mut rx_b).await,
            ServerEvent::TerminalResponse {
                id: "b".to_string(),
                data: "for-b".to_string()
            }
        );
        assert!(timeout(Duration::from_millis(100), rx_a.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_unknown_terminal_ids_are_noops() {
        let harness = Harness::new();
        let session = harness.session();

        // Before initialize there is no multiplexer at all.
        assert!(!session.send_terminal_data("x", "y").await.unwrap());
        assert!(!session.close_terminal("x").await.unwrap());
        assert_eq!(session.resize_terminal(Dimensions::default()).await, 0);

        session.initialize().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.create_terminal("real", tx).await.unwrap();

        assert!(!session.send_terminal_data("ghost", "y").await.unwrap());
        assert!(!session
            .resize_terminal_by_id("ghost", Dimensions::default())
            .await
            .unwrap());
        assert!(!session.close_terminal("ghost").await.unwrap());
        assert_eq!(session.terminal_ids().await, vec!["real".to_string()]);

        let process = harness.provider.sandbox("sbx-1").unwrap().spawned().pop().unwrap();
        assert_eq!(process.kill_count(), 0);
    }

    #[tokio::test]
    async fn test_resize_without_id_resizes_all() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        for id in ["a", "b"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            session.create_terminal(id, tx).await.unwrap();
        }

        let dims = Dimensions { cols: 200, rows: 50 };
        assert_eq!(session.resize_terminal(dims).await, 2);
        let spawned = harness.provider.sandbox("sbx-1").unwrap().spawned();
        assert!(spawned.iter().all(|p| p.last_size() == Some(dims)));
    }

    #[tokio::test]
    async fn test_disconnect_closes_each_terminal_once_and_allows_recreate() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        for id in ["a", "b", "c"] {
            let (tx, _rx) = mpsc::unbounded_channel();
            session.create_terminal(id, tx).await.unwrap();
        }

        assert_eq!(session.disconnect().await, 3);
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-1"));

        let sandbox = harness.provider.sandbox("sbx-1").unwrap();
        assert!(sandbox.spawned().iter().all(|p| p.kill_count() == 1));

        let (tx, _rx) = mpsc::unbounded_channel();
        session.create_terminal("a", tx).await.unwrap();
        assert_eq!(session.terminal_ids().await, vec!["a".to_string()]);
        // Earlier processes were not closed a second time.
        let spawned = sandbox.spawned();
        assert_eq!(spawned.len(), 4);
        assert!(spawned[..3].iter().all(|p| p.kill_count() == 1));
        assert_eq!(spawned[3].kill_count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_sandbox_rebinds_components() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.create_terminal("main", tx).await.unwrap();

        let first = harness.provider.sandbox("sbx-1").unwrap();
        first.running.store(false, Ordering::SeqCst);
        session.initialize().await.unwrap();

        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-2"));
        assert_eq!(first.spawned()[0].kill_count(), 1);
        assert!(session.terminal_ids().await.is_empty());
        assert_eq!(harness.persisted_id().as_deref(), Some("sbx-2"));
    }

    #[tokio::test]
    async fn test_file_operations_delegate() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();

        assert!(session.create_file("index.html").await.unwrap());
        session.save_file("index.html", "<h1>hi</h1>").await.unwrap();
        assert_eq!(session.get_file("index.html").await.unwrap(), "<h1>hi</h1>");
        assert!(session.create_folder("public").await.unwrap());

        let tree = session.move_file("index.html", "public").await.unwrap();
        assert_eq!(tree[0].children[0].id, "public/index.html");

        let archive = session.download_files().await.unwrap();
        assert!(!archive.is_empty());
        let tree = session.delete_folder("public").await.unwrap();
        assert!(tree.is_empty());
    }

    #[tokio::test]
    async fn test_deploy_requires_client() {
        let harness = Harness::new();
        let session = harness.session();
        session.initialize().await.unwrap();
        assert!(matches!(
            session.deploy().await,
            Err(SessionError::CollaboratorUnavailable("deployment client"))
        ));
        assert!(matches!(
            session.list_apps().await,
            Err(SessionError::CollaboratorUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_deploy_pushes_exported_files() {
        let harness = Harness::new();
        let client = Arc::new(FakeDeploymentClient::connected());
        let session = ProjectSession::new(&harness.record, harness.deps(Some(client.clone()), false));
        session.initialize().await.unwrap();
        session.create_file("app.py").await.unwrap();

        session.deploy().await.unwrap();

        let pushes = client.pushes.lock().unwrap();
        assert_eq!(pushes.len(), 1);
        assert_eq!(pushes[0].0, "p1");
        assert_eq!(pushes[0].1[0].path, "app.py");
    }

    #[tokio::test]
    async fn test_app_exists_reports_unavailable_client() {
        let harness = Harness::new();
        let session = harness.session();
        assert_eq!(
            session.app_exists("shop").await.unwrap(),
            AppExistence {
                success: false,
                exists: None
            }
        );

        let client = Arc::new(FakeDeploymentClient::default());
        client.apps.lock().unwrap().insert("shop".to_string(), None);
        let session = ProjectSession::new(&harness.record, harness.deps(Some(client.clone()), false));
        assert!(!session.app_exists("shop").await.unwrap().success);

        client.connected.store(true, Ordering::SeqCst);
        assert_eq!(
            session.app_exists("shop").await.unwrap(),
            AppExistence {
                success: true,
                exists: Some(true)
            }
        );
        assert_eq!(
            session.app_exists("other").await.unwrap().exists,
            Some(false)
        );
    }

    #[tokio::test]
    async fn test_file_changes_push_loaded() {
        let harness = Harness::new();
        let session = ProjectSession::new(&harness.record, harness.deps(None, true));
        session.initialize().await.unwrap();
        let mut events = session.subscribe();
        // Let the watcher settle before touching the tree.
        tokio::time::sleep(Duration::from_millis(100)).await;

        session.create_file("new.txt").await.unwrap();

        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("refresh in time")
            .unwrap();
        match event {
            ServerEvent::Loaded { tree } => assert!(tree.iter().any(|n| n.id == "new.txt")),
            other => panic!("unexpected event: {other:?}"),
        }

        session.disconnect().await;
    }
}
