//! Recursive discovery of model files under one root directory.
//!
//! The watcher seeds its path set with a full scan, then installs one
//! non-recursive OS watch per directory, adding watches as directories
//! appear. Every structural change re-emits the full sorted path list.

use std::collections::BTreeSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::ModifyKind;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Notifications emitted by a [`DirectoryWatcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Added(PathBuf),
    Removed(PathBuf),
    /// Content of a tracked file changed.
    Changed(PathBuf),
    /// Full sorted list of tracked files.
    ListChanged(Vec<PathBuf>),
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Model directory {path} is not accessible: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Model directory {0} is not a directory")]
    NotADirectory(PathBuf),

    #[error("Scanning {path} failed: {source}")]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Watching {path} failed: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

/// How an OS event relates to a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FsChange {
    /// Something appeared or vanished; existence decides which.
    Renamed,
    /// Content changed in place.
    Modified,
}

fn classify(kind: &EventKind) -> Option<FsChange> {
    match kind {
        EventKind::Create(_) | EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => {
            Some(FsChange::Renamed)
        }
        EventKind::Modify(_) => Some(FsChange::Modified),
        _ => None,
    }
}

/// Normalize a configured extension: no leading dot, lowercase.
fn normalize_extension(extension: &str) -> String {
    extension.trim_start_matches('.').to_ascii_lowercase()
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(extension))
        .unwrap_or(false)
}

#[derive(Default)]
struct Scan {
    files: Vec<PathBuf>,
    dirs: Vec<PathBuf>,
}

/// Walk `root` without following directory symlinks.
async fn scan_tree(root: &Path, extension: &str) -> Result<Scan, WatchError> {
    let scan_error = |path: &Path| {
        let path = path.to_path_buf();
        move |source| WatchError::Scan { path, source }
    };

    let mut scan = Scan::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(scan_error(&dir))?;
        while let Some(entry) = entries.next_entry().await.map_err(scan_error(&dir))? {
            let path = entry.path();
            let file_type = entry.file_type().await.map_err(scan_error(&path))?;
            if file_type.is_dir() {
                pending.push(path);
            } else if has_extension(&path, extension) {
                let is_file = if file_type.is_symlink() {
                    tokio::fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false)
                } else {
                    file_type.is_file()
                };
                if is_file {
                    scan.files.push(path);
                }
            }
        }
        scan.dirs.push(dir);
    }
    Ok(scan)
}

struct WatchState {
    root: PathBuf,
    extension: String,
    models: Mutex<BTreeSet<PathBuf>>,
    dirs: Mutex<BTreeSet<PathBuf>>,
    os: Mutex<Option<RecommendedWatcher>>,
    events: mpsc::UnboundedSender<WatchEvent>,
}

impl WatchState {
    fn list(&self) -> Vec<PathBuf> {
        self.models.lock().iter().cloned().collect()
    }

    fn emit(&self, event: WatchEvent) {
        // Nobody listening is not an error; the set stays current.
        let _ = self.events.send(event);
    }

    fn emit_list(&self) {
        self.emit(WatchEvent::ListChanged(self.list()));
    }

    fn watch_dir(&self, dir: &Path) -> Result<(), WatchError> {
        if !self.dirs.lock().insert(dir.to_path_buf()) {
            return Ok(());
        }
        let mut os = self.os.lock();
        let Some(watcher) = os.as_mut() else {
            return Ok(());
        };
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|source| WatchError::Watch {
                path: dir.to_path_buf(),
                source,
            })
    }

    fn release_watches(&self) {
        self.os.lock().take();
        self.dirs.lock().clear();
    }

    /// Insert files, emitting `Added` for new ones. Returns whether any were new.
    fn add_files(&self, files: impl IntoIterator<Item = PathBuf>) -> bool {
        let mut added = Vec::new();
        {
            let mut models = self.models.lock();
            for file in files {
                if models.insert(file.clone()) {
                    added.push(file);
                }
            }
        }
        let changed = !added.is_empty();
        for file in added {
            debug!(path = %file.display(), "model file added");
            self.emit(WatchEvent::Added(file));
        }
        changed
    }

    /// Drop `path` and anything beneath it. Returns whether the set changed.
    fn remove_path(&self, path: &Path) -> bool {
        let removed: Vec<PathBuf> = {
            let mut models = self.models.lock();
            let gone: Vec<PathBuf> = models.iter().filter(|m| m.starts_with(path)).cloned().collect();
            for file in &gone {
                models.remove(file);
            }
            gone
        };

        let stale_dirs: Vec<PathBuf> = {
            let mut dirs = self.dirs.lock();
            let gone: Vec<PathBuf> = dirs.iter().filter(|d| d.starts_with(path)).cloned().collect();
            for dir in &gone {
                dirs.remove(dir);
            }
            gone
        };
        if let Some(watcher) = self.os.lock().as_mut() {
            for dir in &stale_dirs {
                // The OS usually drops these watches itself.
                let _ = watcher.unwatch(dir);
            }
        }

        let changed = !removed.is_empty();
        for file in removed {
            debug!(path = %file.display(), "model file removed");
            self.emit(WatchEvent::Removed(file));
        }
        changed
    }

    async fn on_renamed(&self, path: PathBuf) {
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => match scan_tree(&path, &self.extension).await {
                Ok(scan) => {
                    for dir in &scan.dirs {
                        if let Err(error) = self.watch_dir(dir) {
                            warn!(%error, "failed to watch new directory");
                        }
                    }
                    if self.add_files(scan.files) {
                        self.emit_list();
                    }
                }
                Err(error) => warn!(%error, "failed to scan new directory"),
            },
            Ok(meta) if meta.is_file() && has_extension(&path, &self.extension) => {
                if self.add_files([path]) {
                    self.emit_list();
                }
            }
            Ok(_) => {}
            Err(_) => {
                if self.remove_path(&path) {
                    self.emit_list();
                }
            }
        }
    }

    fn on_modified(&self, path: PathBuf) {
        if self.models.lock().contains(&path) {
            self.emit(WatchEvent::Changed(path));
            self.emit_list();
        }
    }

    async fn handle(&self, event: notify::Event) {
        let Some(change) = classify(&event.kind) else {
            return;
        };
        for path in event.paths {
            match change {
                FsChange::Renamed => self.on_renamed(path).await,
                FsChange::Modified => self.on_modified(path),
            }
        }
    }
}

/// Live set of model files under one root.
pub struct DirectoryWatcher {
    state: Arc<WatchState>,
    task: Option<JoinHandle<()>>,
}

impl DirectoryWatcher {
    /// Scan `root`, install watches, and start forwarding events.
    ///
    /// The first event on the returned channel is the seeded `ListChanged`.
    /// If the scan or any watch fails, installed watches are released and
    /// the error is returned.
    pub async fn start(
        root: impl AsRef<Path>,
        extension: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<WatchEvent>), WatchError> {
        let requested = root.as_ref();
        let root = tokio::fs::canonicalize(requested)
            .await
            .map_err(|source| WatchError::Root {
                path: requested.to_path_buf(),
                source,
            })?;
        let is_dir = tokio::fs::metadata(&root)
            .await
            .map(|m| m.is_dir())
            .map_err(|source| WatchError::Root {
                path: root.clone(),
                source,
            })?;
        if !is_dir {
            return Err(WatchError::NotADirectory(root));
        }

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let os = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
            let _ = raw_tx.send(result);
        })
        .map_err(|source| WatchError::Watch {
            path: root.clone(),
            source,
        })?;

        let (events, receiver) = mpsc::unbounded_channel();
        let state = Arc::new(WatchState {
            root: root.clone(),
            extension: normalize_extension(extension),
            models: Mutex::new(BTreeSet::new()),
            dirs: Mutex::new(BTreeSet::new()),
            os: Mutex::new(Some(os)),
            events,
        });

        let seeded = async {
            let scan = scan_tree(&root, &state.extension).await?;
            for dir in &scan.dirs {
                state.watch_dir(dir)?;
            }
            Ok::<_, WatchError>(scan.files)
        }
        .await;
        let files = match seeded {
            Ok(files) => files,
            Err(error) => {
                state.release_watches();
                return Err(error);
            }
        };
        state.models.lock().extend(files);
        state.emit_list();

        let worker = state.clone();
        let task = tokio::spawn(async move {
            while let Some(result) = raw_rx.recv().await {
                match result {
                    Ok(event) => worker.handle(event).await,
                    Err(error) => warn!(root = %worker.root.display(), %error, "watch error"),
                }
            }
        });

        info!(
            root = %root.display(),
            models = state.models.lock().len(),
            directories = state.dirs.lock().len(),
            "watching model directory"
        );
        Ok((
            Self {
                state,
                task: Some(task),
            },
            receiver,
        ))
    }

    /// Canonical root directory.
    pub fn root(&self) -> &Path {
        &self.state.root
    }

    /// Current sorted set of model files.
    pub fn model_list(&self) -> Vec<PathBuf> {
        self.state.list()
    }

    pub fn watched_directories(&self) -> usize {
        self.state.dirs.lock().len()
    }

    /// Release every OS watch and stop forwarding events.
    pub fn stop(&mut self) {
        self.state.release_watches();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for DirectoryWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn next_list(
        events: &mut mpsc::UnboundedReceiver<WatchEvent>,
        accept: impl Fn(&[PathBuf]) -> bool,
    ) -> Vec<PathBuf> {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(WatchEvent::ListChanged(list)) if accept(&list) => return list,
                    Some(_) => continue,
                    None => panic!("watcher closed its channel"),
                }
            }
        })
        .await
        .expect("no matching list event")
    }

    #[test]
    fn extension_match_ignores_case_and_dot() {
        let ext = normalize_extension(".GGUF");
        assert_eq!(ext, "gguf");
        assert!(has_extension(Path::new("/m/a.GgUf"), &ext));
        assert!(!has_extension(Path::new("/m/a.bin"), &ext));
        assert!(!has_extension(Path::new("/m/gguf"), &ext));
    }

    #[tokio::test]
    async fn start_seeds_sorted_list_recursively() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("b/nested")).unwrap();
        std::fs::write(dir.path().join("b/nested/z.gguf"), b"x").unwrap();
        std::fs::write(dir.path().join("a.GGUF"), b"x").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let (watcher, mut events) = DirectoryWatcher::start(dir.path(), "gguf").await.unwrap();
        let root = watcher.root().to_path_buf();
        let expected = vec![root.join("a.GGUF"), root.join("b/nested/z.gguf")];

        assert_eq!(events.recv().await, Some(WatchEvent::ListChanged(expected.clone())));
        assert_eq!(watcher.model_list(), expected);
        assert_eq!(watcher.watched_directories(), 3);
    }

    #[tokio::test]
    async fn added_and_removed_files_re_emit_the_list() {
        let dir = TempDir::new().unwrap();
        let (watcher, mut events) = DirectoryWatcher::start(dir.path(), "gguf").await.unwrap();
        let path = watcher.root().join("new.gguf");
        assert_eq!(events.recv().await, Some(WatchEvent::ListChanged(vec![])));

        std::fs::write(&path, b"weights").unwrap();
        let list = next_list(&mut events, |l| !l.is_empty()).await;
        assert_eq!(list, vec![path.clone()]);

        std::fs::remove_file(&path).unwrap();
        let list = next_list(&mut events, |l| l.is_empty()).await;
        assert!(list.is_empty());
        assert!(watcher.model_list().is_empty());
    }

    #[tokio::test]
    async fn directories_created_later_are_watched() {
        let dir = TempDir::new().unwrap();
        let (watcher, mut events) = DirectoryWatcher::start(dir.path(), "gguf").await.unwrap();
        let _ = events.recv().await;

        let sub = watcher.root().join("family");
        std::fs::create_dir(&sub).unwrap();
        std::fs::write(sub.join("first.gguf"), b"x").unwrap();
        let first = sub.join("first.gguf");
        next_list(&mut events, |l| l.contains(&first)).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = sub.join("second.gguf");
        std::fs::write(&second, b"x").unwrap();
        let list = next_list(&mut events, |l| l.contains(&second)).await;
        assert_eq!(list, vec![first, second]);
    }

    #[tokio::test]
    async fn missing_root_fails_to_start() {
        let dir = TempDir::new().unwrap();
        let result = DirectoryWatcher::start(dir.path().join("absent"), "gguf").await;
        assert!(matches!(result, Err(WatchError::Root { .. })));
    }

    #[tokio::test]
    async fn file_root_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("model.gguf");
        std::fs::write(&file, b"x").unwrap();
        let result = DirectoryWatcher::start(&file, "gguf").await;
        assert!(matches!(result, Err(WatchError::NotADirectory(_))));
    }
}
