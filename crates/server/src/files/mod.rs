//! Project file access.
//!
//! Every sandbox exposes its working tree through a [`FileStore`]. File and
//! folder ids are paths relative to the tree root, `/`-separated, and are
//! validated so no operation can reach outside the root.

pub mod local;
pub mod watcher;

use std::path::PathBuf;

use async_trait::async_trait;
use protocol::FileNode;
use thiserror::Error;

pub use local::LocalFileStore;
pub use watcher::FileWatcher;

/// Directory names skipped by tree listings, exports and the watcher.
pub const IGNORED_DIRS: &[&str] = &["node_modules", ".git"];

/// Errors that can occur during file operations.
#[derive(Debug, Error)]
pub enum FileError {
    /// The id escapes the project root or is otherwise malformed.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The addressed file or folder does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The target name is already taken.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The addressed entry exists but has the wrong kind.
    #[error("{id} is not a {expected}")]
    WrongKind { id: String, expected: &'static str },

    /// File content is not valid UTF-8.
    #[error("file is not valid UTF-8: {0}")]
    NotText(String),

    /// Archive construction failed.
    #[error("archive failed: {0}")]
    Archive(String),

    /// Change notifications could not be set up.
    #[error("watch failed: {0}")]
    Watch(#[from] notify::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A file exported for deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportedFile {
    /// Path relative to the project root, `/`-separated.
    pub path: String,
    pub content: Vec<u8>,
}

/// File operations over one sandbox's working tree.
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Absolute root of the tree, used for watching.
    fn root(&self) -> PathBuf;

    /// Reads a text file.
    async fn get_file(&self, id: &str) -> Result<String, FileError>;

    /// Lists the names of a folder's direct children, sorted.
    async fn get_folder(&self, id: &str) -> Result<Vec<String>, FileError>;

    /// Overwrites an existing file.
    async fn save_file(&self, id: &str, body: &str) -> Result<(), FileError>;

    /// Creates an empty file. Returns `false` if the name is taken.
    async fn create_file(&self, name: &str) -> Result<bool, FileError>;

    /// Creates a folder. Returns `false` if the name is taken.
    async fn create_folder(&self, name: &str) -> Result<bool, FileError>;

    /// Renames a file within its folder.
    async fn rename_file(&self, id: &str, new_name: &str) -> Result<(), FileError>;

    /// Moves a file into `folder_id` and returns the refreshed tree.
    async fn move_file(&self, id: &str, folder_id: &str) -> Result<Vec<FileNode>, FileError>;

    /// Deletes a file and returns the refreshed tree.
    async fn delete_file(&self, id: &str) -> Result<Vec<FileNode>, FileError>;

    /// Deletes a folder recursively and returns the refreshed tree.
    async fn delete_folder(&self, id: &str) -> Result<Vec<FileNode>, FileError>;

    /// Full tree, folders first then by name.
    async fn file_tree(&self) -> Result<Vec<FileNode>, FileError>;

    /// Every regular file with its content.
    async fn export_files(&self) -> Result<Vec<ExportedFile>, FileError>;

    /// Tar archive of the tree.
    async fn archive(&self) -> Result<Vec<u8>, FileError>;
}
