//! File watcher for module libraries
//!
//! Reports that a watched file finished being written. The OS backend runs
//! on its own thread and only queues raw events; callbacks fire from
//! [`FileWatcher::poll`] on the caller's thread.

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Callback invoked with the watched path when it changed
pub type WatchCallback = Box<dyn FnMut(&Path) + Send>;

/// Handle of a registered watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchId(u64);

impl fmt::Display for WatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "watch#{}", self.0)
    }
}

/// Watcher error types
#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("Failed to create file watcher: {0}")]
    Init(#[source] notify::Error),

    #[error("Invalid watch path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("Failed to watch {}: {source}", .path.display())]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

struct WatchEntry {
    /// Canonical directory holding the file
    dir: PathBuf,
    file_name: OsString,
    /// Path as given by the caller, handed back to the callback
    target: PathBuf,
    callback: WatchCallback,
}

/// Close-after-write watcher
pub struct FileWatcher {
    watcher: RecommendedWatcher,
    event_tx: mpsc::UnboundedSender<notify::Result<Event>>,
    event_rx: mpsc::UnboundedReceiver<notify::Result<Event>>,
    watches: BTreeMap<WatchId, WatchEntry>,
    /// Watched directories and how many watches use each
    dirs: HashMap<PathBuf, usize>,
    next_id: u64,
}

impl FileWatcher {
    /// Create a watcher with no watches
    pub fn new() -> Result<Self, WatchError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let tx = event_tx.clone();
        let watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| {
                // The receiver only goes away together with the watcher.
                let _ = tx.send(result);
            },
            Config::default(),
        )
        .map_err(WatchError::Init)?;

        Ok(Self {
            watcher,
            event_tx,
            event_rx,
            watches: BTreeMap::new(),
            dirs: HashMap::new(),
            next_id: 1,
        })
    }

    /// Watch `path` for completed writes.
    ///
    /// The file itself need not exist yet, its directory must. The directory
    /// is what the OS watches, so replacing the file by rename keeps being
    /// observed.
    pub fn add_watch(
        &mut self,
        path: impl AsRef<Path>,
        callback: impl FnMut(&Path) + Send + 'static,
    ) -> Result<WatchId, WatchError> {
        let target = path.as_ref().to_path_buf();
        let file_name = target
            .file_name()
            .ok_or_else(|| WatchError::InvalidPath(target.clone()))?
            .to_os_string();
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dir = parent.canonicalize()?;

        let users = self.dirs.get(&dir).copied().unwrap_or(0);
        if users == 0 {
            self.watcher
                .watch(&dir, RecursiveMode::NonRecursive)
                .map_err(|source| WatchError::Watch {
                    path: dir.clone(),
                    source,
                })?;
            debug!(dir = %dir.display(), "Watching directory");
        }
        self.dirs.insert(dir.clone(), users + 1);

        let id = WatchId(self.next_id);
        self.next_id += 1;
        self.watches.insert(
            id,
            WatchEntry {
                dir,
                file_name,
                target: target.clone(),
                callback: Box::new(callback),
            },
        );

        info!(path = %target.display(), %id, "Added watch");
        Ok(id)
    }

    /// Remove a watch. Returns `false` if the id is unknown.
    pub fn remove_watch(&mut self, id: WatchId) -> bool {
        let Some(entry) = self.watches.remove(&id) else {
            return false;
        };

        match self.dirs.get_mut(&entry.dir) {
            Some(users) if *users > 1 => *users -= 1,
            _ => {
                self.dirs.remove(&entry.dir);
                if let Err(e) = self.watcher.unwatch(&entry.dir) {
                    warn!(dir = %entry.dir.display(), error = %e, "Failed to unwatch directory");
                }
            }
        }

        info!(path = %entry.target.display(), %id, "Removed watch");
        true
    }

    /// Drain pending events and fire callbacks.
    ///
    /// Never blocks. Each watch fires at most once per call, however many
    /// raw records the OS produced for its file. Returns the number of
    /// callbacks fired.
    pub fn poll(&mut self) -> usize {
        let mut due: Vec<WatchId> = Vec::new();

        while let Ok(result) = self.event_rx.try_recv() {
            match result {
                Ok(event) => self.collect(&event, &mut due),
                Err(e) => warn!(error = %e, "File watcher reported an error"),
            }
        }

        for id in &due {
            if let Some(entry) = self.watches.get_mut(id) {
                debug!(path = %entry.target.display(), %id, "File changed");
                (entry.callback)(&entry.target);
            }
        }

        due.len()
    }

    /// Number of registered watches
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether no watches are registered
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Paths currently watched
    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.watches.values().map(|w| w.target.clone()).collect()
    }

    /// Queue a raw event as if the OS backend had delivered it
    pub(crate) fn inject(&self, event: Event) {
        let _ = self.event_tx.send(Ok(event));
    }

    fn collect(&self, event: &Event, due: &mut Vec<WatchId>) {
        if !is_completion(&event.kind) {
            trace!(kind = ?event.kind, "Ignoring event");
            return;
        }

        for path in &event.paths {
            let (Some(dir), Some(name)) = (path.parent(), path.file_name()) else {
                continue;
            };

            for (id, entry) in &self.watches {
                if entry.file_name.as_os_str() == name && entry.dir.as_path() == dir && !due.contains(id) {
                    due.push(*id);
                }
            }
        }
    }
}

impl fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileWatcher")
            .field("watches", &self.watches.len())
            .field("dirs", &self.dirs.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(target_os = "linux")]
fn is_completion(kind: &EventKind) -> bool {
    use notify::event::{AccessKind, AccessMode};

    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

// No close events outside inotify; any data change or creation counts.
#[cfg(not(target_os = "linux"))]
fn is_completion(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_))
            | EventKind::Modify(ModifyKind::Any)
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[cfg(target_os = "linux")]
    fn completion_event(path: &Path) -> Event {
        use notify::event::{AccessKind, AccessMode};
        Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write))).add_path(path.to_path_buf())
    }

    #[cfg(not(target_os = "linux"))]
    fn completion_event(path: &Path) -> Event {
        use notify::event::DataChange;
        Event::new(EventKind::Modify(ModifyKind::Data(DataChange::Content))).add_path(path.to_path_buf())
    }

    fn counter() -> (Arc<AtomicUsize>, impl FnMut(&Path) + Send + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let hits = count.clone();
        (count, move |_: &Path| {
            hits.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_poll_without_events_returns_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::new().unwrap();
        let (count, callback) = counter();
        watcher.add_watch(dir.path().join("libidle.so"), callback).unwrap();

        assert_eq!(watcher.poll(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_duplicate_records_coalesce() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libgreeter.so");
        let canonical = dir.path().canonicalize().unwrap().join("libgreeter.so");

        let mut watcher = FileWatcher::new().unwrap();
        let (count, callback) = counter();
        watcher.add_watch(&target, callback).unwrap();

        for _ in 0..3 {
            watcher.inject(completion_event(&canonical));
        }

        assert_eq!(watcher.poll(), 1);
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.poll(), 0);
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let canonical = dir.path().canonicalize().unwrap();

        let mut watcher = FileWatcher::new().unwrap();
        let (count, callback) = counter();
        watcher.add_watch(dir.path().join("libgreeter.so"), callback).unwrap();

        watcher.inject(completion_event(&canonical.join("libother.so")));
        watcher.inject(Event::new(EventKind::Remove(notify::event::RemoveKind::File)).add_path(canonical.join("libgreeter.so")));

        assert_eq!(watcher.poll(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_every_watch_on_a_path_fires() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libshared.so");

        let mut watcher = FileWatcher::new().unwrap();
        let (first, first_cb) = counter();
        let (second, second_cb) = counter();
        watcher.add_watch(&target, first_cb).unwrap();
        watcher.add_watch(&target, second_cb).unwrap();
        assert_eq!(watcher.len(), 2);

        watcher.inject(completion_event(&dir.path().canonicalize().unwrap().join("libshared.so")));
        assert_eq!(watcher.poll(), 2);
        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_watch() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libgone.so");

        let mut watcher = FileWatcher::new().unwrap();
        let (count, callback) = counter();
        let id = watcher.add_watch(&target, callback).unwrap();

        assert!(watcher.remove_watch(id));
        assert!(!watcher.remove_watch(id));
        assert!(watcher.is_empty());

        watcher.inject(completion_event(&dir.path().canonicalize().unwrap().join("libgone.so")));
        assert_eq!(watcher.poll(), 0);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut watcher = FileWatcher::new().unwrap();

        let result = watcher.add_watch(dir.path().join("nope").join("libx.so"), |_: &Path| {});
        assert!(matches!(result, Err(WatchError::Io(_))));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_real_write_fires_once() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("libwritten.so");

        let mut watcher = FileWatcher::new().unwrap();
        let (count, callback) = counter();
        watcher.add_watch(&target, callback).unwrap();

        {
            let mut file = std::fs::File::create(&target).unwrap();
            for chunk in 0..16u8 {
                file.write_all(&[chunk; 4096]).unwrap();
                file.flush().unwrap();
            }
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while count.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            watcher.poll();
            std::thread::sleep(Duration::from_millis(20));
        }
        std::thread::sleep(Duration::from_millis(100));
        watcher.poll();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
