//! Sharing of project sessions between connections.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;

use super::{ProjectSession, SessionDeps};
use crate::store::ProjectRecord;

struct Entry {
    session: Arc<ProjectSession>,
    /// Attached connections and whether each belongs to the owner.
    connections: HashMap<u64, bool>,
}

/// Live project sessions keyed by project id.
///
/// All connections of a project share one session. When the last one
/// detaches the session is removed and disconnected, which closes its
/// terminals exactly once.
pub struct ProjectRegistry {
    deps: SessionDeps,
    sessions: DashMap<String, Entry>,
}

impl ProjectRegistry {
    pub fn new(deps: SessionDeps) -> Self {
        Self {
            deps,
            sessions: DashMap::new(),
        }
    }

    pub fn deps(&self) -> &SessionDeps {
        &self.deps
    }

    /// Attaches a connection, creating the project's session on first use.
    pub fn attach(&self, record: &ProjectRecord, connection_id: u64, is_owner: bool) -> Arc<ProjectSession> {
        let mut entry = self.sessions.entry(record.id.clone()).or_insert_with(|| {
            tracing::debug!(project_id = %record.id, "Creating project session");
            Entry {
                session: Arc::new(ProjectSession::new(record, self.deps.clone())),
                connections: HashMap::new(),
            }
        });
        entry.connections.insert(connection_id, is_owner);
        tracing::debug!(
            project_id = %record.id,
            connection_id,
            is_owner,
            connections = entry.connections.len(),
            "Connection attached"
        );
        Arc::clone(&entry.session)
    }

    /// Detaches a connection. Returns `true` if it was the last one and the
    /// session was torn down.
    pub async fn detach(&self, project_id: &str, connection_id: u64) -> bool {
        let emptied = {
            let Some(mut entry) = self.sessions.get_mut(project_id) else {
                return false;
            };
            entry.connections.remove(&connection_id);
            entry.connections.is_empty()
        };
        if !emptied {
            return false;
        }

        // Someone may have attached between the two map accesses.
        let Some((_, entry)) = self
            .sessions
            .remove_if(project_id, |_, entry| entry.connections.is_empty())
        else {
            return false;
        };
        let closed = entry.session.disconnect().await;
        tracing::info!(project_id = %project_id, terminals = closed, "Last connection left, session torn down");
        true
    }

    pub fn session(&self, project_id: &str) -> Option<Arc<ProjectSession>> {
        self.sessions.get(project_id).map(|e| Arc::clone(&e.session))
    }

    /// Whether any attached connection of the project belongs to its owner.
    pub fn owner_connected(&self, project_id: &str) -> bool {
        self.sessions
            .get(project_id)
            .is_some_and(|e| e.connections.values().any(|&is_owner| is_owner))
    }

    pub fn connection_count(&self, project_id: &str) -> usize {
        self.sessions
            .get(project_id)
            .map(|e| e.connections.len())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnects every session. Returns how many were torn down.
    pub async fn shutdown(&self) -> usize {
        let project_ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        let mut count = 0;
        for project_id in project_ids {
            if let Some((_, entry)) = self.sessions.remove(&project_id) {
                entry.session.disconnect().await;
                count += 1;
            }
        }
        tracing::info!(sessions = count, "Project sessions shut down");
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::KeyedMutex;
    use crate::project::{SessionPhase, SessionSettings};
    use crate::sandbox::fake::FakeProvider;
    use crate::store::JsonProjectStore;
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    fn registry() -> (TempDir, Arc<FakeProvider>, ProjectRegistry, ProjectRecord) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(JsonProjectStore::new(dir.path().join("projects.json")));
        let record = ProjectRecord::new("p1", "nextjs", "alice");
        store.upsert(record.clone()).unwrap();
        let provider = FakeProvider::new();
        let registry = ProjectRegistry::new(SessionDeps {
            provider: provider.clone(),
            records: store,
            locks: Arc::new(KeyedMutex::new()),
            deploy: None,
            settings: SessionSettings {
                watch_files: false,
                ..SessionSettings::default()
            },
        });
        (dir, provider, registry, record)
    }

    #[tokio::test]
    async fn test_connections_share_one_session() {
        let (_dir, _provider, registry, record) = registry();
        let a = registry.attach(&record, 1, true);
        let b = registry.attach(&record, 2, false);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.connection_count("p1"), 2);
    }

    #[tokio::test]
    async fn test_owner_presence() {
        let (_dir, _provider, registry, record) = registry();
        registry.attach(&record, 1, false);
        assert!(!registry.owner_connected("p1"));
        registry.attach(&record, 2, true);
        assert!(registry.owner_connected("p1"));
        assert!(!registry.detach("p1", 2).await);
        assert!(!registry.owner_connected("p1"));
    }

    #[tokio::test]
    async fn test_last_detach_tears_down_once() {
        let (_dir, provider, registry, record) = registry();
        let session = registry.attach(&record, 1, true);
        registry.attach(&record, 2, false);
        session.initialize().await.unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.create_terminal("main", tx).await.unwrap();

        assert!(!registry.detach("p1", 1).await);
        assert_eq!(session.phase().await, SessionPhase::Ready);

        assert!(registry.detach("p1", 2).await);
        assert!(registry.is_empty());
        assert_eq!(session.phase().await, SessionPhase::Uninitialized);
        let process = provider.sandbox("sbx-1").unwrap().spawned().pop().unwrap();
        assert_eq!(process.kill_count(), 1);

        // A stale detach is a no-op.
        assert!(!registry.detach("p1", 2).await);
        assert_eq!(process.kill_count(), 1);
    }

    #[tokio::test]
    async fn test_reattach_reuses_persisted_sandbox() {
        let (_dir, provider, registry, record) = registry();
        registry.attach(&record, 1, true).initialize().await.unwrap();
        registry.detach("p1", 1).await;

        let session = registry.attach(&record, 2, true);
        session.initialize().await.unwrap();
        assert_eq!(provider.create_count(), 1);
        assert_eq!(provider.connect_count(), 1);
        assert_eq!(session.sandbox_id().await.as_deref(), Some("sbx-1"));
    }

    #[tokio::test]
    async fn test_shutdown() {
        let (_dir, _provider, registry, record) = registry();
        registry.attach(&record, 1, true);
        registry.attach(&ProjectRecord::new("p2", "php", "bob"), 2, true);
        assert_eq!(registry.shutdown().await, 2);
        assert!(registry.is_empty());
    }
}
