//! Sandboxes as directories on the local machine.
//!
//! Each sandbox lives in `<root>/<id>/` with a `sandbox.json` metadata file
//! and a `project/` working tree. A sandbox counts as running until its
//! idle deadline passes; an expired sandbox can be reconnected to but
//! reports not running, which makes the session provision a new one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::pty::PtyProcess;
use super::{OutputStream, Sandbox, SandboxError, SandboxProvider, ShellOptions, ShellProcess};
use crate::files::{FileStore, LocalFileStore};

const META_FILE: &str = "sandbox.json";
const TREE_DIR: &str = "project";

/// Persisted sandbox metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxMeta {
    pub id: String,
    pub template: String,
    /// Unix time in milliseconds.
    pub created_at: u64,
    /// Idle deadline, unix time in milliseconds.
    pub expires_at: u64,
}

impl SandboxMeta {
    fn is_live(&self) -> bool {
        now_millis() < self.expires_at
    }
}

/// Creates and reconnects [`LocalSandbox`]es under one root directory.
#[derive(Debug, Clone)]
pub struct LocalSandboxProvider {
    root: PathBuf,
    templates_dir: Option<PathBuf>,
    preview_host: String,
    default_shell: Option<String>,
}

impl LocalSandboxProvider {
    /// Creates a provider storing sandboxes under `root`.
    ///
    /// `preview_host` is a pattern where `{port}` and `{sandbox}` are
    /// replaced by the port and sandbox id.
    pub fn new(
        root: impl Into<PathBuf>,
        templates_dir: Option<PathBuf>,
        preview_host: impl Into<String>,
    ) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            templates_dir,
            preview_host: preview_host.into(),
            default_shell: None,
        })
    }

    /// Sets the shell used when a spawn request does not name one.
    pub fn with_default_shell(mut self, shell: Option<String>) -> Self {
        self.default_shell = shell;
        self
    }

    fn sandbox_dir(&self, id: &str) -> Result<PathBuf, SandboxError> {
        let valid = !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        Ok(self.root.join(id))
    }

    fn open(&self, dir: PathBuf, meta: SandboxMeta) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let files = LocalFileStore::new(dir.join(TREE_DIR))?;
        Ok(Arc::new(LocalSandbox {
            id: meta.id.clone(),
            dir,
            files: Arc::new(files),
            meta: Mutex::new(meta),
            preview_host: self.preview_host.clone(),
            default_shell: self.default_shell.clone(),
        }))
    }

    /// Metadata of every sandbox on disk. Unreadable entries are skipped.
    pub async fn list(&self) -> Result<Vec<SandboxMeta>, SandboxError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<SandboxMeta>, SandboxError> {
            let mut sandboxes = Vec::new();
            for entry in fs::read_dir(&root)? {
                let entry = entry?;
                if let Ok(meta) = read_meta(&entry.path()) {
                    sandboxes.push(meta);
                }
            }
            sandboxes.sort_by_key(|m| m.created_at);
            Ok(sandboxes)
        })
        .await
        .map_err(|e| SandboxError::Io(io::Error::other(e)))?
    }

    /// Deletes sandboxes whose deadline passed more than `retention` ago.
    pub async fn prune_expired(&self, retention: Duration) -> Result<usize, SandboxError> {
        let cutoff = now_millis().saturating_sub(retention.as_millis() as u64);
        let mut removed = 0;
        for meta in self.list().await? {
            if meta.expires_at >= cutoff {
                continue;
            }
            let dir = self.sandbox_dir(&meta.id)?;
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => {
                    removed += 1;
                    tracing::info!(sandbox_id = %meta.id, "Pruned expired sandbox");
                }
                Err(e) => {
                    tracing::warn!(sandbox_id = %meta.id, error = %e, "Failed to prune sandbox")
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl SandboxProvider for LocalSandboxProvider {
    async fn create(
        &self,
        template: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let id = Uuid::new_v4().simple().to_string();
        let dir = self.sandbox_dir(&id)?;
        let now = now_millis();
        let meta = SandboxMeta {
            id: id.clone(),
            template: template.to_string(),
            created_at: now,
            expires_at: now.saturating_add(timeout.as_millis() as u64),
        };

        let template_src = self
            .templates_dir
            .as_ref()
            .map(|d| d.join(template))
            .filter(|d| d.is_dir());
        let seed_dir = dir.clone();
        let seed_meta = meta.clone();
        tokio::task::spawn_blocking(move || -> Result<(), SandboxError> {
            let tree = seed_dir.join(TREE_DIR);
            fs::create_dir_all(&tree)?;
            if let Some(src) = template_src {
                copy_dir_recursive(&src, &tree)?;
            }
            write_meta(&seed_dir, &seed_meta)
        })
        .await
        .map_err(|e| SandboxError::CreateFailed {
            template: template.to_string(),
            reason: e.to_string(),
        })??;

        tracing::info!(sandbox_id = %id, template = %template, "Created sandbox");
        self.open(dir, meta)
    }

    async fn connect(&self, id: &str) -> Result<Arc<dyn Sandbox>, SandboxError> {
        let dir = self.sandbox_dir(id)?;
        if !is_dir(&dir).await {
            return Err(SandboxError::NotFound(id.to_string()));
        }
        let meta = load_meta(&dir).await?;
        tracing::debug!(sandbox_id = %id, live = meta.is_live(), "Connected to sandbox");
        self.open(dir, meta)
    }
}

/// A sandbox directory on the local machine.
pub struct LocalSandbox {
    id: String,
    dir: PathBuf,
    files: Arc<LocalFileStore>,
    meta: Mutex<SandboxMeta>,
    preview_host: String,
    default_shell: Option<String>,
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn is_running(&self) -> bool {
        let live = self.meta.lock().await.is_live();
        live && is_dir(&self.dir).await
    }

    async fn set_timeout(&self, timeout: Duration) -> Result<(), SandboxError> {
        let mut meta = self.meta.lock().await;
        let mut updated = meta.clone();
        updated.expires_at = now_millis().saturating_add(timeout.as_millis() as u64);
        store_meta(&self.dir, &updated)
            .await
            .map_err(|e| SandboxError::TimeoutFailed(e.to_string()))?;
        *meta = updated;
        Ok(())
    }

    fn host(&self, port: u16) -> String {
        self.preview_host
            .replace("{port}", &port.to_string())
            .replace("{sandbox}", &self.id)
    }

    async fn spawn_shell(
        &self,
        mut options: ShellOptions,
    ) -> Result<(Box<dyn ShellProcess>, OutputStream), SandboxError> {
        let mut cwd = self.files.root();
        if let Some(relative) = options.cwd.as_deref() {
            for component in Path::new(relative.trim_start_matches('/')).components() {
                match component {
                    std::path::Component::Normal(part) => cwd.push(part),
                    std::path::Component::CurDir => {}
                    _ => {
                        return Err(SandboxError::SpawnFailed(format!(
                            "working directory escapes sandbox: {relative}"
                        )))
                    }
                }
            }
        }
        if options.shell.is_none() {
            options.shell = self.default_shell.clone();
        }

        let (process, output) = PtyProcess::spawn(&options, &cwd)?;
        Ok((Box::new(process), output))
    }

    fn files(&self) -> Arc<dyn FileStore> {
        self.files.clone()
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn read_meta(dir: &Path) -> Result<SandboxMeta, SandboxError> {
    let contents = fs::read_to_string(dir.join(META_FILE))?;
    serde_json::from_str(&contents).map_err(|e| SandboxError::Metadata(e.to_string()))
}

/// Writes metadata through a temp file and rename so readers never see a
/// partial file.
fn write_meta(dir: &Path, meta: &SandboxMeta) -> Result<(), SandboxError> {
    let contents =
        serde_json::to_string_pretty(meta).map_err(|e| SandboxError::Metadata(e.to_string()))?;
    let temp = dir.join(format!("{META_FILE}.tmp"));
    fs::write(&temp, contents)?;
    fs::rename(&temp, dir.join(META_FILE))?;
    Ok(())
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

async fn load_meta(dir: &Path) -> Result<SandboxMeta, SandboxError> {
    let contents = tokio::fs::read_to_string(dir.join(META_FILE)).await?;
    serde_json::from_str(&contents).map_err(|e| SandboxError::Metadata(e.to_string()))
}

async fn store_meta(dir: &Path, meta: &SandboxMeta) -> Result<(), SandboxError> {
    let contents =
        serde_json::to_string_pretty(meta).map_err(|e| SandboxError::Metadata(e.to_string()))?;
    let temp = dir.join(format!("{META_FILE}.tmp"));
    tokio::fs::write(&temp, contents).await?;
    tokio::fs::rename(&temp, dir.join(META_FILE)).await?;
    Ok(())
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
