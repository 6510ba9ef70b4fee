//! Project records and access control.
//!
//! [`ProjectRecordStore`] remembers which sandbox belongs to a project;
//! [`UserDirectory`] decides who may open a project. [`JsonProjectStore`]
//! implements both on top of a JSON file.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by record stores.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The project is unknown to the store.
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    /// A change could not be persisted.
    #[error("failed to persist project records: {0}")]
    Persist(String),

    /// The in-memory table is unusable.
    #[error("project store lock poisoned")]
    Poisoned,
}

/// A project as known to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    /// Template tag, e.g. `nextjs`.
    pub project_type: String,
    pub owner_id: String,
    #[serde(default)]
    pub collaborators: Vec<String>,
    /// Last sandbox provisioned for this project.
    #[serde(default)]
    pub sandbox_id: Option<String>,
}

impl ProjectRecord {
    pub fn new(id: impl Into<String>, project_type: impl Into<String>, owner_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_type: project_type.into(),
            owner_id: owner_id.into(),
            collaborators: Vec::new(),
            sandbox_id: None,
        }
    }

    pub fn is_owner(&self, user_id: &str) -> bool {
        self.owner_id == user_id
    }

    /// Owners and collaborators may open the project.
    pub fn has_access(&self, user_id: &str) -> bool {
        self.is_owner(user_id) || self.collaborators.iter().any(|c| c == user_id)
    }
}

/// Persistence of the project to sandbox binding.
pub trait ProjectRecordStore: Send + Sync {
    fn record(&self, project_id: &str) -> Result<Option<ProjectRecord>, StoreError>;

    /// Records `sandbox_id` as the project's sandbox.
    fn save_sandbox_id(&self, project_id: &str, sandbox_id: &str) -> Result<(), StoreError>;
}

/// Access control for opening projects.
pub trait UserDirectory: Send + Sync {
    /// Returns the project if `user_id` may open it.
    fn authorize(&self, user_id: &str, project_id: &str) -> Result<Option<ProjectRecord>, StoreError>;
}

/// On-disk layout of the store.
#[derive(Debug, Serialize, Deserialize)]
struct ProjectStoreData {
    /// Version of the store format.
    version: u32,
    projects: Vec<ProjectRecord>,
}

/// Thread-safe project table persisted to JSON.
pub struct JsonProjectStore {
    path: PathBuf,
    projects: RwLock<HashMap<String, ProjectRecord>>,
}

impl JsonProjectStore {
    /// Creates a store that will persist to `path`.
    ///
    /// This does not load the file; call `load()` to read existing data.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            projects: RwLock::new(HashMap::new()),
        }
    }

    /// Creates a store at the default path.
    pub fn with_default_path() -> Self {
        Self::new(default_store_path())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads records from the JSON file. A missing file leaves the store empty.
    pub fn load(&self) -> Result<()> {
        if !self.path.exists() {
            tracing::debug!(path = %self.path.display(), "Project store not found, starting empty");
            return Ok(());
        }

        let contents = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read project store: {}", self.path.display()))?;
        let data: ProjectStoreData = serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse project store: {}", self.path.display()))?;

        let mut projects = self
            .projects
            .write()
            .map_err(|_| anyhow::anyhow!("Failed to acquire write lock on project store"))?;
        projects.clear();
        for project in data.projects {
            projects.insert(project.id.clone(), project);
        }

        tracing::info!(count = projects.len(), path = %self.path.display(), "Loaded project records");
        Ok(())
    }

    /// Writes all records through a temp file and rename.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create project store directory: {}", parent.display())
            })?;
        }

        let data = {
            let projects = self
                .projects
                .read()
                .map_err(|_| anyhow::anyhow!("Failed to acquire read lock on project store"))?;
            let mut list: Vec<ProjectRecord> = projects.values().cloned().collect();
            list.sort_by(|a, b| a.id.cmp(&b.id));
            ProjectStoreData {
                version: 1,
                projects: list,
            }
        };
        let contents =
            serde_json::to_string_pretty(&data).context("Failed to serialize project store")?;

        let temp_path = self.path.with_extension("json.tmp");
        fs::write(&temp_path, &contents)
            .with_context(|| format!("Failed to write temp project store: {}", temp_path.display()))?;
        fs::rename(&temp_path, &self.path).with_context(|| {
            format!(
                "Failed to rename temp project store {} to {}",
                temp_path.display(),
                self.path.display()
            )
        })?;

        tracing::debug!(count = data.projects.len(), path = %self.path.display(), "Saved project records");
        Ok(())
    }

    /// Inserts or replaces a record. Does not save.
    pub fn upsert(&self, record: ProjectRecord) -> Result<(), StoreError> {
        let mut projects = self.projects.write().map_err(|_| StoreError::Poisoned)?;
        tracing::info!(project_id = %record.id, owner_id = %record.owner_id, "Upserting project record");
        projects.insert(record.id.clone(), record);
        Ok(())
    }

    /// Removes a record. Does not save.
    pub fn remove(&self, project_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let mut projects = self.projects.write().map_err(|_| StoreError::Poisoned)?;
        Ok(projects.remove(project_id))
    }

    /// All records, sorted by id.
    pub fn list(&self) -> Result<Vec<ProjectRecord>, StoreError> {
        let projects = self.projects.read().map_err(|_| StoreError::Poisoned)?;
        let mut list: Vec<ProjectRecord> = projects.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    pub fn len(&self) -> usize {
        self.projects.read().map(|p| p.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ProjectRecordStore for JsonProjectStore {
    fn record(&self, project_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        let projects = self.projects.read().map_err(|_| StoreError::Poisoned)?;
        Ok(projects.get(project_id).cloned())
    }

    fn save_sandbox_id(&self, project_id: &str, sandbox_id: &str) -> Result<(), StoreError> {
        {
            let mut projects = self.projects.write().map_err(|_| StoreError::Poisoned)?;
            let record = projects
                .get_mut(project_id)
                .ok_or_else(|| StoreError::ProjectNotFound(project_id.to_string()))?;
            record.sandbox_id = Some(sandbox_id.to_string());
        }
        self.save().map_err(|e| StoreError::Persist(format!("{e:#}")))?;
        tracing::info!(project_id = %project_id, sandbox_id = %sandbox_id, "Recorded project sandbox");
        Ok(())
    }
}

impl UserDirectory for JsonProjectStore {
    fn authorize(&self, user_id: &str, project_id: &str) -> Result<Option<ProjectRecord>, StoreError> {
        Ok(self.record(project_id)?.filter(|r| r.has_access(user_id)))
    }
}

/// Default location of the project store.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sandpit")
        .join("projects.json")
}
