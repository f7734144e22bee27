//! Bounded file watcher with per-path debouncing and diff summarization.
//!
//! ```text
//! notify (OS events) ──► event task ──► per-path debounce timer (300 ms)
//!                                              │ stability wait (200 ms still)
//!                                              ▼
//!                                     read + classify + diff
//!                                              │
//!                                              ▼
//!                                   FileChange ──► agent client
//! ```
//!
//! The initial recursive scan fills the content cache and completes before
//! [`FileWatcher::start`] returns; events raised during the scan are not
//! reported. Each filesystem event replaces any pending timer for the same
//! absolute path; distinct paths never coalesce. The watcher never blocks
//! its caller: read failures are logged and the event is skipped.

pub mod diff;

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};

use crate::ids::now_ms;
use crate::protocol::{ChangeKind, FileChange};
use diff::diff_lines;

/// Default per-path debounce.
pub const DEBOUNCE_MS: u64 = 300;
/// A file is "stable" after this much stillness…
const STABILITY_WINDOW_MS: u64 = 200;
/// …checked at this poll interval.
const STABILITY_POLL_MS: u64 = 50;
/// Upper bound on the stability wait, so a hot file cannot stall a timer.
const STABILITY_MAX_MS: u64 = 2_000;
/// Content cache capacity (entries, evicted in insertion order).
pub const CONTENT_CACHE_CAPACITY: usize = 500;
/// Files larger than this are never cached for diffing.
const CACHE_MAX_FILE_BYTES: u64 = 1024 * 1024;

/// Directory names that are never watched.
const IGNORE_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "dist",
    "build",
    "out",
    "coverage",
    "__pycache__",
    "venv",
    "vendor",
];

/// Lockfiles and per-ecosystem metadata that only generate noise.
const IGNORE_FILES: &[&str] = &[
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "Cargo.lock",
    "poetry.lock",
    "Pipfile.lock",
    "Gemfile.lock",
    "composer.lock",
    "go.sum",
];

/// Extensions treated as binary: stat sizes, never diff.
const BINARY_EXTENSIONS: &[&str] = &[
    // images
    "png", "jpg", "jpeg", "gif", "bmp", "ico", "webp", "tiff",
    // audio / video
    "mp3", "wav", "ogg", "flac", "mp4", "avi", "mov", "mkv", "webm",
    // archives
    "zip", "tar", "gz", "bz2", "xz", "7z", "rar",
    // documents
    "pdf", "doc", "docx", "xls", "xlsx", "ppt", "pptx",
    // fonts
    "ttf", "otf", "woff", "woff2", "eot",
    // executables and libraries
    "exe", "dll", "so", "dylib", "bin", "class", "pyc", "wasm",
    // databases
    "sqlite", "sqlite3", "db",
];

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("watch setup failed: {0}")]
    Notify(#[from] notify::Error),
    #[error("scan failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Watcher configuration.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Project directory to watch recursively.
    pub root: PathBuf,
    pub debounce_ms: u64,
    /// Author stamped on every emitted change.
    pub author: String,
    pub device_id: String,
}

impl WatcherConfig {
    pub fn new(root: impl Into<PathBuf>, author: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            debounce_ms: DEBOUNCE_MS,
            author: author.into(),
            device_id: device_id.into(),
        }
    }
}

/// Insertion-order bounded content cache.
struct ContentCache {
    map: HashMap<PathBuf, String>,
    order: VecDeque<PathBuf>,
    capacity: usize,
}

impl ContentCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn insert(&mut self, path: PathBuf, content: String) {
        if self.map.insert(path.clone(), content).is_none() {
            self.order.push_back(path);
            while self.map.len() > self.capacity {
                if let Some(oldest) = self.order.pop_front() {
                    self.map.remove(&oldest);
                }
            }
        }
    }

    fn get(&self, path: &Path) -> Option<&String> {
        self.map.get(path)
    }

    fn remove(&mut self, path: &Path) -> Option<String> {
        self.order.retain(|p| p != path);
        self.map.remove(path)
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

struct Shared {
    config: WatcherConfig,
    cache: Mutex<ContentCache>,
    pending: Mutex<HashMap<PathBuf, JoinHandle<()>>>,
    out: mpsc::UnboundedSender<FileChange>,
}

/// Recursive watcher over one project directory.
pub struct FileWatcher {
    // Dropping the notify watcher stops event delivery.
    _watcher: RecommendedWatcher,
    shared: Arc<Shared>,
    event_task: JoinHandle<()>,
}

impl FileWatcher {
    /// Scan the tree, then attach the OS watcher. Returns the watcher and
    /// the change stream. The returned future resolves only after the
    /// initial scan completed.
    pub async fn start(
        config: WatcherConfig,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FileChange>), WatcherError> {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            cache: Mutex::new(ContentCache::new(CONTENT_CACHE_CAPACITY)),
            pending: Mutex::new(HashMap::new()),
            out: out_tx,
            config,
        });

        // Initial scan: prime the cache off the async threads. Nothing is
        // emitted for files found here.
        let scan_root = shared.config.root.clone();
        let preloaded = tokio::task::spawn_blocking(move || scan_tree(&scan_root))
            .await
            .map_err(|e| WatcherError::Io(std::io::Error::other(e)))??;
        {
            let mut cache = shared.cache.lock().expect("cache lock");
            for (path, content) in preloaded {
                cache.insert(path, content);
            }
            log::info!("Initial scan cached {} text files", cache.len());
        }

        // Attach the OS watcher only after the scan so scan-time events
        // are never reported.
        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let _ = raw_tx.send(event);
                }
                Err(e) => log::warn!("watch error: {e}"),
            }
        })?;
        watcher.watch(&shared.config.root, RecursiveMode::Recursive)?;

        let event_task = tokio::spawn(run_event_loop(shared.clone(), raw_rx));
        Ok((
            Self {
                _watcher: watcher,
                shared,
                event_task,
            },
            out_rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.shared.config.root
    }

    /// Stop delivering events and cancel all pending debounce timers.
    pub fn stop(&self) {
        self.event_task.abort();
        let mut pending = self.shared.pending.lock().expect("pending lock");
        for (_, handle) in pending.drain() {
            handle.abort();
        }
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_event_loop(shared: Arc<Shared>, mut raw_rx: mpsc::UnboundedReceiver<notify::Event>) {
    while let Some(event) = raw_rx.recv().await {
        let kind = match event.kind {
            notify::EventKind::Create(_) => ChangeKind::Add,
            notify::EventKind::Modify(_) => ChangeKind::Change,
            notify::EventKind::Remove(_) => ChangeKind::Unlink,
            _ => continue,
        };
        for path in event.paths {
            if path.is_dir() {
                continue;
            }
            let Ok(rel) = path.strip_prefix(&shared.config.root) else {
                continue;
            };
            if is_ignored(rel) {
                continue;
            }
            schedule(shared.clone(), path, kind);
        }
    }
}

/// Replace any pending timer for this absolute path with a fresh one.
fn schedule(shared: Arc<Shared>, path: PathBuf, kind: ChangeKind) {
    let debounce = shared.config.debounce_ms;
    let task_shared = shared.clone();
    let task_path = path.clone();
    let handle = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(debounce)).await;
        task_shared
            .pending
            .lock()
            .expect("pending lock")
            .remove(&task_path);
        if kind != ChangeKind::Unlink {
            wait_until_stable(&task_path).await;
        }
        if let Some(change) = process_event(&task_shared, &task_path, kind).await {
            let _ = task_shared.out.send(change);
        }
    });
    if let Some(previous) = shared
        .pending
        .lock()
        .expect("pending lock")
        .insert(path, handle)
    {
        previous.abort();
    }
}

/// Poll size+mtime until 200 ms of stillness (or the file vanishes).
async fn wait_until_stable(path: &Path) {
    let needed = (STABILITY_WINDOW_MS / STABILITY_POLL_MS).max(1);
    let mut still = 0u64;
    let mut last: Option<(u64, Option<std::time::SystemTime>)> = None;
    let mut waited = 0u64;
    while waited < STABILITY_MAX_MS {
        let Ok(meta) = tokio::fs::metadata(path).await else {
            return;
        };
        let sig = (meta.len(), meta.modified().ok());
        if last.as_ref() == Some(&sig) {
            still += 1;
            if still >= needed {
                return;
            }
        } else {
            still = 0;
            last = Some(sig);
        }
        tokio::time::sleep(Duration::from_millis(STABILITY_POLL_MS)).await;
        waited += STABILITY_POLL_MS;
    }
}

async fn process_event(shared: &Arc<Shared>, path: &Path, kind: ChangeKind) -> Option<FileChange> {
    let rel = path
        .strip_prefix(&shared.config.root)
        .ok()?
        .to_string_lossy()
        .replace('\\', "/");
    let base = FileChange {
        path: rel,
        kind,
        author: shared.config.author.clone(),
        device_id: shared.config.device_id.clone(),
        timestamp: now_ms(),
        diff: None,
        lines_added: 0,
        lines_removed: 0,
        size_before: None,
        size_after: None,
    };

    if is_binary_path(path) {
        return match kind {
            ChangeKind::Add | ChangeKind::Change => {
                let meta = tokio::fs::metadata(path).await.ok()?;
                Some(FileChange {
                    size_after: Some(meta.len()),
                    ..base
                })
            }
            ChangeKind::Unlink => Some(base),
        };
    }

    match kind {
        ChangeKind::Unlink => {
            let removed = shared
                .cache
                .lock()
                .expect("cache lock")
                .remove(path)
                .map(|content| content.split('\n').count() as u32)
                .unwrap_or(0);
            Some(FileChange {
                lines_removed: removed,
                ..base
            })
        }
        ChangeKind::Add | ChangeKind::Change => {
            let raw = match tokio::fs::read(path).await {
                Ok(raw) => raw,
                Err(e) => {
                    log::warn!("Skipping unreadable {}: {e}", path.display());
                    return None;
                }
            };
            let content = match String::from_utf8(raw) {
                Ok(content) => content,
                Err(_) => {
                    log::debug!("Skipping non-UTF-8 file {}", path.display());
                    return None;
                }
            };
            let mut cache = shared.cache.lock().expect("cache lock");
            let change = match cache.get(path) {
                Some(previous) => {
                    let summary = diff_lines(previous, &content);
                    FileChange {
                        diff: Some(summary.diff),
                        lines_added: summary.lines_added,
                        lines_removed: summary.lines_removed,
                        ..base
                    }
                }
                None => FileChange {
                    lines_added: content.split('\n').count() as u32,
                    ..base
                },
            };
            cache.insert(path.to_path_buf(), content);
            Some(change)
        }
    }
}

/// Walk the tree, returning the text files worth caching.
fn scan_tree(root: &Path) -> std::io::Result<Vec<(PathBuf, String)>> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("Skipping unreadable directory {}: {e}", dir.display());
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            if is_ignored(rel) {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            if !file_type.is_file() || is_binary_path(&path) {
                continue;
            }
            if entry.metadata().map(|m| m.len() > CACHE_MAX_FILE_BYTES).unwrap_or(true) {
                continue;
            }
            if let Ok(content) = std::fs::read_to_string(&path) {
                out.push((path, content));
            }
        }
    }
    Ok(out)
}

/// Ignore rule applied to the path relative to the watch root: dotfiles,
/// well-known build and dependency directories, and lockfiles.
fn is_ignored(rel: &Path) -> bool {
    for component in rel.components() {
        let name = component.as_os_str().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        if IGNORE_DIRS.contains(&name.as_ref()) {
            return true;
        }
    }
    if let Some(file_name) = rel.file_name() {
        let name = file_name.to_string_lossy();
        if IGNORE_FILES.contains(&name.as_ref()) {
            return true;
        }
    }
    false
}

fn is_binary_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            BINARY_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}
