//! Blocklist file loading and live reload.
//!
//! [`FileFetcher`] reads a text file of IPs/CIDRs (one per line, `#`
//! comments and blank lines ignored), keeps the parsed list behind a
//! read/write lock, and watches the file for changes. On every write or
//! create event the file is re-read in full; on success the in-memory
//! list is replaced and the change callback is invoked with a fresh
//! copy. A failed reload keeps the prior list.
//!
//! Rename and remove events are not followed to the new inode: an
//! operator replacing the file by atomic rename should touch it
//! afterwards, or rely on the create event the rename produces on the
//! watched path.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{DefenderError, Result};
use crate::matcher::parse_ip_or_cidr;

/// Callback invoked with a defensive copy of the new list after a
/// successful reload.
pub type OnChange = Box<dyn Fn(Vec<String>) + Send + Sync>;

/// Loads, validates, and watches a blocklist file.
pub struct FileFetcher {
    path: PathBuf,
    ranges: RwLock<Vec<String>>,
    watcher: Mutex<Option<RecommendedWatcher>>,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl FileFetcher {
    /// Load the file and return the fetcher.
    ///
    /// Fails with [`DefenderError::EmptyPath`] on an empty path and
    /// [`DefenderError::OpenFailed`] / [`DefenderError::ReadFailed`] when
    /// the file cannot be read. A file with no usable entries loads
    /// successfully and yields an empty list; only
    /// [`FileFetcher::fetch_ip_ranges`] reports that as an error.
    pub fn new(path: impl Into<PathBuf>) -> Result<Arc<FileFetcher>> {
        let path = path.into();
        if path.as_os_str().is_empty() {
            return Err(DefenderError::EmptyPath);
        }
        let fetcher = Arc::new(FileFetcher {
            path,
            ranges: RwLock::new(Vec::new()),
            watcher: Mutex::new(None),
            watch_task: Mutex::new(None),
        });
        fetcher.load_ranges()?;
        Ok(fetcher)
    }

    /// Start watching the file for changes. Must be called from within a
    /// tokio runtime; the watch loop runs as a single background task
    /// until [`FileFetcher::close`].
    pub fn start_watching(self: &Arc<Self>, on_change: OnChange) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Event>(64);

        let mut watcher =
            notify::recommended_watcher(move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    // Best-effort send; if the loop lags we still reload on
                    // the next event.
                    let _ = tx.try_send(event);
                }
                Err(e) => {
                    warn!(error = %e, "blocklist file watcher error");
                }
            })?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;

        let fetcher = Arc::clone(self);
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    continue;
                }
                info!(file = %fetcher.path.display(), "blocklist file changed, reloading");
                match fetcher.load_ranges() {
                    Ok(()) => {
                        let snapshot = fetcher.snapshot();
                        on_change(snapshot);
                    }
                    Err(e) => {
                        error!(file = %fetcher.path.display(), error = %e,
                            "failed to reload blocklist file, keeping previous ranges");
                    }
                }
            }
        });

        *self.watcher.lock().expect("watcher lock poisoned") = Some(watcher);
        *self.watch_task.lock().expect("watch task lock poisoned") = Some(task);
        info!(file = %self.path.display(), "watching blocklist file for changes");
        Ok(())
    }

    /// Current ranges as a defensive copy.
    ///
    /// Fails with [`DefenderError::EmptyBlocklist`] when no usable
    /// entries are loaded.
    pub fn fetch_ip_ranges(&self) -> Result<Vec<String>> {
        let ranges = self.ranges.read().expect("ranges lock poisoned");
        if ranges.is_empty() {
            return Err(DefenderError::EmptyBlocklist(self.path.clone()));
        }
        Ok(ranges.clone())
    }

    /// Current ranges as a defensive copy, empty list included. Used by
    /// the composer, which treats an empty file as contributing nothing.
    pub fn snapshot(&self) -> Vec<String> {
        self.ranges.read().expect("ranges lock poisoned").clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop watching. Dropping the watcher closes the event channel,
    /// which ends the watch task.
    pub fn close(&self) {
        self.watcher.lock().expect("watcher lock poisoned").take();
        self.watch_task
            .lock()
            .expect("watch task lock poisoned")
            .take();
    }

    fn load_ranges(&self) -> Result<()> {
        let mut file = File::open(&self.path).map_err(|source| DefenderError::OpenFailed {
            path: self.path.clone(),
            source,
        })?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|source| DefenderError::ReadFailed {
                path: self.path.clone(),
                source,
            })?;

        let mut ranges = Vec::new();
        for (idx, raw) in contents.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Err(err) = parse_ip_or_cidr(line) {
                warn!(
                    file = %self.path.display(),
                    line = idx + 1,
                    value = line,
                    reason = %err.reason,
                    "invalid IP/CIDR in blocklist file"
                );
                continue;
            }
            ranges.push(line.to_string());
        }

        let count = ranges.len();
        *self.ranges.write().expect("ranges lock poisoned") = ranges;
        info!(file = %self.path.display(), count, "loaded IP ranges from blocklist file");
        Ok(())
    }
}

impl Drop for FileFetcher {
    fn drop(&mut self) {
        self.close();
    }
}
