//! Tests for the advisory file lock

use chefsolo::FileLock;

#[test]
fn test_second_acquire_fails_while_held() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chef-solo.lock");

    let held = FileLock::try_acquire(&path).unwrap().expect("first acquire");
    assert!(FileLock::try_acquire(&path).unwrap().is_none());

    held.release();
    let again = FileLock::try_acquire(&path).unwrap();
    assert!(again.is_some());
}

#[test]
fn test_drop_releases_lock_and_keeps_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nodes.lock");

    {
        let _lock = FileLock::try_acquire(&path).unwrap().unwrap();
    }

    assert!(path.exists());
    assert!(FileLock::try_acquire(&path).unwrap().is_some());
}

#[test]
fn test_acquire_creates_missing_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out").join("nodes").join("nodes.lock");

    let lock = FileLock::try_acquire(&path).unwrap().unwrap();

    assert_eq!(lock.path(), path.as_path());
    assert!(path.exists());
}
