//! Watcher tests against a real filesystem tree.

use codehive::protocol::ChangeKind;
use codehive::watcher::{FileWatcher, WatcherConfig};
use std::path::Path;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

const EVENT_WAIT: Duration = Duration::from_secs(5);

fn fast_config(root: &Path) -> WatcherConfig {
    let mut config = WatcherConfig::new(root, "Zeus", "AbCdEfGh12345678");
    config.debounce_ms = 100;
    config
}

async fn next_for(
    rx: &mut mpsc::UnboundedReceiver<codehive::protocol::FileChange>,
    path: &str,
) -> codehive::protocol::FileChange {
    timeout(EVENT_WAIT, async {
        loop {
            let change = rx.recv().await.expect("watcher stream open");
            if change.path == path {
                return change;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no event for {path}"))
}

#[tokio::test]
async fn test_add_text_file_counts_lines() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();

    tokio::fs::write(dir.path().join("notes.txt"), "one\ntwo\nthree")
        .await
        .unwrap();

    let change = next_for(&mut rx, "notes.txt").await;
    assert!(matches!(change.kind, ChangeKind::Add | ChangeKind::Change));
    assert_eq!(change.lines_added, 3);
    assert_eq!(change.lines_removed, 0);
    assert_eq!(change.author, "Zeus");
    assert_eq!(change.device_id, "AbCdEfGh12345678");
}

#[tokio::test]
async fn test_change_produces_diff_against_initial_scan() {
    let dir = tempfile::tempdir().unwrap();
    // Present before the watcher starts: primed by the initial scan, and
    // the scan itself must emit nothing.
    std::fs::write(dir.path().join("main.rs"), "fn main() {\n    old();\n}\n").unwrap();

    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();
    assert!(
        timeout(Duration::from_millis(400), rx.recv()).await.is_err(),
        "initial scan must not be reported"
    );

    tokio::fs::write(dir.path().join("main.rs"), "fn main() {\n    new();\n}\n")
        .await
        .unwrap();

    let change = next_for(&mut rx, "main.rs").await;
    assert_eq!(change.kind, ChangeKind::Change);
    assert_eq!(change.lines_added, 1);
    assert_eq!(change.lines_removed, 1);
    let diff = change.diff.expect("text change carries a diff");
    assert!(diff.contains("-     old();"), "{diff}");
    assert!(diff.contains("+     new();"), "{diff}");
}

#[tokio::test]
async fn test_unlink_counts_cached_lines() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("gone.txt"), "a\nb\nc\nd").unwrap();

    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();
    tokio::fs::remove_file(dir.path().join("gone.txt")).await.unwrap();

    let change = next_for(&mut rx, "gone.txt").await;
    assert_eq!(change.kind, ChangeKind::Unlink);
    assert_eq!(change.lines_removed, 4);
    assert_eq!(change.diff, None);
}

#[tokio::test]
async fn test_binary_file_reports_size_only() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();

    tokio::fs::write(dir.path().join("logo.png"), vec![0u8; 2048])
        .await
        .unwrap();

    let change = next_for(&mut rx, "logo.png").await;
    assert_eq!(change.diff, None);
    assert_eq!(change.lines_added, 0);
    assert_eq!(change.size_after, Some(2048));
    assert_eq!(change.size_before, None);
}

#[tokio::test]
async fn test_ignored_paths_stay_silent() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();

    tokio::fs::write(dir.path().join("node_modules/pkg/index.js"), "x")
        .await
        .unwrap();
    tokio::fs::write(dir.path().join(".env"), "SECRET=1").await.unwrap();
    tokio::fs::write(dir.path().join("package-lock.json"), "{}")
        .await
        .unwrap();
    // A watched file proves the pipeline is alive.
    tokio::fs::write(dir.path().join("kept.txt"), "hello").await.unwrap();

    let change = next_for(&mut rx, "kept.txt").await;
    assert_eq!(change.path, "kept.txt");
    // Nothing else surfaced alongside it.
    assert!(timeout(Duration::from_millis(400), rx.recv()).await.is_err());
}

#[tokio::test]
async fn test_rapid_writes_coalesce_per_path() {
    let dir = tempfile::tempdir().unwrap();
    let (_watcher, mut rx) = FileWatcher::start(fast_config(dir.path())).await.unwrap();

    // Bursts inside the debounce window collapse into one report.
    for i in 0..5 {
        tokio::fs::write(dir.path().join("burst.txt"), format!("v{i}"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let first = next_for(&mut rx, "burst.txt").await;
    assert!(matches!(first.kind, ChangeKind::Add | ChangeKind::Change));
    assert!(
        timeout(Duration::from_millis(300), rx.recv()).await.is_err(),
        "burst must coalesce into a single event"
    );
}
