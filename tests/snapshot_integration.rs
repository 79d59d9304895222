//! Snapshot engine tests against a real filesystem.

use std::sync::Arc;

use claude_conductor::session::ChangeKind;
use claude_conductor::snapshot::{NoBuffers, SnapshotError, SnapshotManager};

fn manager() -> SnapshotManager {
    SnapshotManager::new(Arc::new(NoBuffers))
}

#[tokio::test]
async fn revert_restores_byte_identical_content() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("lib.rs");
    let original = "fn main() {}\n// trailing\n";
    tokio::fs::write(&file, original).await.unwrap();

    let mut snapshots = manager();
    snapshots.begin_command();
    snapshots.capture_before(&file).await;
    tokio::fs::write(&file, "fn main() { changed(); }\n")
        .await
        .unwrap();
    snapshots.capture_after(&file).await;

    let changes = snapshots.changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Modified);

    snapshots.revert_file(&file).await.unwrap();
    let restored = tokio::fs::read_to_string(&file).await.unwrap();
    assert_eq!(restored, original);

    // The snapshot is consumed by the revert.
    assert!(snapshots.changes().is_empty());
}

#[tokio::test]
async fn reverting_a_created_file_deletes_it() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("new_module.rs");

    let mut snapshots = manager();
    snapshots.begin_command();
    snapshots.capture_before(&file).await;
    tokio::fs::write(&file, "pub fn fresh() {}\n").await.unwrap();
    snapshots.capture_after(&file).await;

    let changes = snapshots.changes();
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].kind, ChangeKind::Created);

    snapshots.revert_file(&file).await.unwrap();
    assert!(!tokio::fs::try_exists(&file).await.unwrap());
}

#[tokio::test]
async fn revert_all_continues_past_untracked_paths() {
    let dir = tempfile::tempdir().unwrap();
    let a = dir.path().join("a.txt");
    let b = dir.path().join("b.txt");
    tokio::fs::write(&a, "a original").await.unwrap();
    tokio::fs::write(&b, "b original").await.unwrap();

    let mut snapshots = manager();
    snapshots.begin_command();
    for path in [&a, &b] {
        snapshots.capture_before(path).await;
    }
    tokio::fs::write(&a, "a edited").await.unwrap();
    tokio::fs::write(&b, "b edited").await.unwrap();
    for path in [&a, &b] {
        snapshots.capture_after(path).await;
    }

    let failures = snapshots.revert_all().await;
    assert!(failures.is_empty());
    assert_eq!(tokio::fs::read_to_string(&a).await.unwrap(), "a original");
    assert_eq!(tokio::fs::read_to_string(&b).await.unwrap(), "b original");
}

#[tokio::test]
async fn accept_drops_tracking_without_touching_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("kept.txt");
    tokio::fs::write(&file, "before").await.unwrap();

    let mut snapshots = manager();
    snapshots.begin_command();
    snapshots.capture_before(&file).await;
    tokio::fs::write(&file, "after").await.unwrap();
    snapshots.capture_after(&file).await;

    assert!(snapshots.accept_file(&file));
    assert_eq!(tokio::fs::read_to_string(&file).await.unwrap(), "after");
    assert!(snapshots.changes().is_empty());

    // Reverting an accepted file is an error, not a no-op.
    assert!(matches!(
        snapshots.revert_file(&file).await,
        Err(SnapshotError::NotTracked(_))
    ));
}

#[tokio::test]
async fn new_command_clears_previous_snapshots() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("x.txt");
    tokio::fs::write(&file, "v1").await.unwrap();

    let mut snapshots = manager();
    snapshots.begin_command();
    snapshots.capture_before(&file).await;
    tokio::fs::write(&file, "v2").await.unwrap();
    snapshots.capture_after(&file).await;
    assert_eq!(snapshots.changes().len(), 1);

    snapshots.begin_command();
    assert!(snapshots.changes().is_empty());
}
