//! Change notifications for a project tree.
//!
//! Raw `notify` events arrive on a blocking callback thread. They are
//! forwarded to a debounce task which emits one signal per burst, so a
//! `npm install` produces a single tree refresh rather than thousands.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{FileError, IGNORED_DIRS};

/// Quiet period before a burst of changes is reported.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Live watch on a directory tree. Dropping it stops the watch.
pub struct FileWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
    debounce_task: JoinHandle<()>,
}

impl FileWatcher {
    /// Starts watching `root` recursively.
    ///
    /// The returned receiver yields `()` once per debounced burst of
    /// changes and closes when the watcher is dropped.
    pub fn start(root: &Path, debounce: Duration) -> Result<(Self, mpsc::Receiver<()>), FileError> {
        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<()>();
        let (signal_tx, signal_rx) = mpsc::channel::<()>(1);

        let watch_root = root.to_path_buf();
        let mut watcher = notify::recommended_watcher(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    if is_relevant(&watch_root, &event) {
                        let _ = raw_tx.send(());
                    }
                }
                Err(err) => warn!(%err, "file watcher error"),
            },
        )?;
        watcher.watch(root, RecursiveMode::Recursive)?;

        let debounce_task = tokio::spawn(async move {
            while raw_rx.recv().await.is_some() {
                // Swallow everything that arrives within the quiet period.
                loop {
                    match tokio::time::timeout(debounce, raw_rx.recv()).await {
                        Ok(Some(())) => continue,
                        Ok(None) => return,
                        Err(_) => break,
                    }
                }
                // A pending signal already covers this burst.
                let _ = signal_tx.try_send(());
            }
        });

        debug!(root = %root.display(), "Started file watcher");
        Ok((
            Self {
                root: root.to_path_buf(),
                _watcher: watcher,
                debounce_task,
            },
            signal_rx,
        ))
    }

    /// Watched directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.debounce_task.abort();
        debug!(root = %self.root.display(), "Stopped file watcher");
    }
}

fn is_relevant(root: &Path, event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    ) && event.paths.iter().any(|path| !is_ignored_path(root, path))
}

fn is_ignored_path(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .any(|c| IGNORED_DIRS.iter().any(|d| c.as_os_str() == *d))
}
