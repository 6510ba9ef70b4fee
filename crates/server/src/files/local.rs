//! File store backed by a local directory.

use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use protocol::{FileKind, FileNode};

use super::{ExportedFile, FileError, FileStore, IGNORED_DIRS};

/// [`FileStore`] over a directory on the local filesystem.
#[derive(Debug, Clone)]
pub struct LocalFileStore {
    root: PathBuf,
}

impl LocalFileStore {
    /// Opens (creating if needed) the tree rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        let root = fs::canonicalize(&root)?;
        Ok(Self { root })
    }

    /// Maps an id onto a path under the root without touching the disk.
    ///
    /// Rejects parent components and prefixes; a leading `/` is read as the
    /// project root.
    fn resolve(&self, id: &str) -> Result<PathBuf, FileError> {
        let mut path = self.root.clone();
        for component in Path::new(id.trim_start_matches('/')).components() {
            match component {
                Component::Normal(part) => path.push(part),
                Component::CurDir => {}
                _ => return Err(FileError::InvalidPath(id.to_string())),
            }
        }
        Ok(path)
    }

    /// Resolves an id that must exist, following symlinks only if they stay
    /// inside the root.
    fn resolve_existing(&self, id: &str) -> Result<PathBuf, FileError> {
        let path = self.resolve(id)?;
        let canonical = fs::canonicalize(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FileError::NotFound(id.to_string()),
            _ => FileError::Io(e),
        })?;
        if !canonical.starts_with(&self.root) {
            return Err(FileError::InvalidPath(id.to_string()));
        }
        Ok(path)
    }

    fn resolve_file(&self, id: &str) -> Result<PathBuf, FileError> {
        let path = self.resolve_existing(id)?;
        if !path.is_file() {
            return Err(FileError::WrongKind {
                id: id.to_string(),
                expected: "file",
            });
        }
        Ok(path)
    }

    fn resolve_folder(&self, id: &str) -> Result<PathBuf, FileError> {
        let path = self.resolve_existing(id)?;
        if !path.is_dir() {
            return Err(FileError::WrongKind {
                id: id.to_string(),
                expected: "folder",
            });
        }
        Ok(path)
    }

    async fn tree_after(&self) -> Result<Vec<FileNode>, FileError> {
        self.file_tree().await
    }
}

/// Checks that `name` is a single plain path component.
fn validate_name(name: &str) -> Result<(), FileError> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0');
    if invalid {
        return Err(FileError::InvalidPath(name.to_string()));
    }
    Ok(())
}

fn relative_id(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_ignored(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

fn build_tree(root: &Path, dir: &Path) -> io::Result<Vec<FileNode>> {
    let mut nodes = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = match entry {
            Ok(e) => e,
            Err(_) => continue,
        };
        let file_type = match entry.file_type() {
            Ok(t) => t,
            Err(_) => continue,
        };
        let name = entry.file_name().to_string_lossy().to_string();
        let path = entry.path();

        if file_type.is_dir() {
            if is_ignored(&name) {
                continue;
            }
            nodes.push(FileNode {
                id: relative_id(root, &path),
                name,
                kind: FileKind::Folder,
                children: build_tree(root, &path)?,
            });
        } else if file_type.is_file() {
            nodes.push(FileNode {
                id: relative_id(root, &path),
                name,
                kind: FileKind::File,
                children: Vec::new(),
            });
        }
        // Symlinks are left out of the tree.
    }

    nodes.sort_by(|a, b| {
        let rank = |n: &FileNode| matches!(n.kind, FileKind::File);
        rank(a).cmp(&rank(b)).then_with(|| a.name.cmp(&b.name))
    });
    Ok(nodes)
}

/// Regular files below `dir` as `(absolute path, id)` pairs, sorted by id.
fn walk_files(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, String)>) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        let path = entry.path();
        if file_type.is_dir() {
            if !is_ignored(&entry.file_name().to_string_lossy()) {
                walk_files(root, &path, out)?;
            }
        } else if file_type.is_file() {
            let id = relative_id(root, &path);
            out.push((path, id));
        }
    }
    Ok(())
}

fn collect_files(root: &Path) -> io::Result<Vec<(PathBuf, String)>> {
    let mut files = Vec::new();
    walk_files(root, root, &mut files)?;
    files.sort_by(|a, b| a.1.cmp(&b.1));
    Ok(files)
}

fn build_archive(root: &Path) -> Result<Vec<u8>, FileError> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, id) in collect_files(root)? {
        builder
            .append_path_with_name(&path, &id)
            .map_err(|e| FileError::Archive(format!("{id}: {e}")))?;
    }
    builder
        .into_inner()
        .map_err(|e| FileError::Archive(e.to_string()))
}

async fn blocking<T, F>(f: F) -> Result<T, FileError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, FileError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FileError::Io(io::Error::other(e)))?
}

#[async_trait]
impl FileStore for LocalFileStore {
    fn root(&self) -> PathBuf {
        self.root.clone()
    }

    async fn get_file(&self, id: &str) -> Result<String, FileError> {
        let path = self.resolve_file(id)?;
        let bytes = tokio::fs::read(&path).await?;
        String::from_utf8(bytes).map_err(|_| FileError::NotText(id.to_string()))
    }

    async fn get_folder(&self, id: &str) -> Result<Vec<String>, FileError> {
        let path = self.resolve_folder(id)?;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&path).await?;
        while let Some(entry) = dir.next_entry().await? {
            entries.push(entry.file_name().to_string_lossy().to_string());
        }
        entries.sort();
        Ok(entries)
    }

    async fn save_file(&self, id: &str, body: &str) -> Result<(), FileError> {
        let path = self.resolve_file(id)?;
        tokio::fs::write(&path, body).await?;
        tracing::debug!(file_id = %id, bytes = body.len(), "Saved file");
        Ok(())
    }

    async fn create_file(&self, name: &str) -> Result<bool, FileError> {
        validate_name(name)?;
        let path = self.root.join(name);
        match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_folder(&self, name: &str) -> Result<bool, FileError> {
        validate_name(name)?;
        let path = self.root.join(name);
        match tokio::fs::create_dir(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn rename_file(&self, id: &str, new_name: &str) -> Result<(), FileError> {
        validate_name(new_name)?;
        let source = self.resolve_file(id)?;
        let parent = source
            .parent()
            .ok_or_else(|| FileError::InvalidPath(id.to_string()))?;
        let target = parent.join(new_name);
        if tokio::fs::try_exists(&target).await? {
            return Err(FileError::AlreadyExists(relative_id(&self.root, &target)));
        }
        tokio::fs::rename(&source, &target).await?;
        Ok(())
    }

    async fn move_file(&self, id: &str, folder_id: &str) -> Result<Vec<FileNode>, FileError> {
        let source = self.resolve_file(id)?;
        let folder = self.resolve_folder(folder_id)?;
        let name = source
            .file_name()
            .ok_or_else(|| FileError::InvalidPath(id.to_string()))?;
        let target = folder.join(name);
        if target != source {
            if tokio::fs::try_exists(&target).await? {
                return Err(FileError::AlreadyExists(relative_id(&self.root, &target)));
            }
            tokio::fs::rename(&source, &target).await?;
        }
        self.tree_after().await
    }

    async fn delete_file(&self, id: &str) -> Result<Vec<FileNode>, FileError> {
        let path = self.resolve_file(id)?;
        tokio::fs::remove_file(&path).await?;
        self.tree_after().await
    }

    async fn delete_folder(&self, id: &str) -> Result<Vec<FileNode>, FileError> {
        let path = self.resolve_folder(id)?;
        if path == self.root {
            return Err(FileError::InvalidPath(id.to_string()));
        }
        tokio::fs::remove_dir_all(&path).await?;
        self.tree_after().await
    }

    async fn file_tree(&self) -> Result<Vec<FileNode>, FileError> {
        let root = self.root.clone();
        blocking(move || Ok(build_tree(&root, &root)?)).await
    }

    async fn export_files(&self) -> Result<Vec<ExportedFile>, FileError> {
        let root = self.root.clone();
        blocking(move || {
            collect_files(&root)?
                .into_iter()
                .map(|(path, id)| -> Result<ExportedFile, FileError> {
                    Ok(ExportedFile {
                        path: id,
                        content: fs::read(&path)?,
                    })
                })
                .collect()
        })
        .await
    }

    async fn archive(&self) -> Result<Vec<u8>, FileError> {
        let root = self.root.clone();
        blocking(move || build_archive(&root)).await
    }
}
