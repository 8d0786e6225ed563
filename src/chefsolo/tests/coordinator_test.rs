//! Tests for the bundle coordinator and the output layout
//!
//! Concurrent runs are simulated with tasks; each takes the locks through its own
//! file description, exactly like separate processes do.

mod common;

use chefsolo::{
    bundle_commands, write_if_absent, Backoff, BundleCoordinator, BundleRole, FileLock,
    NodeDescriptor, OutputLayout, ProvisionError, ProvisionRequest, RecordingSink, WriteOutcome,
};
use common::{CountingBuilder, Fixture};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn node(raw: &str) -> NodeDescriptor {
    NodeDescriptor::parse(raw).unwrap()
}

fn coordinator(root: &std::path::Path, builder: Arc<CountingBuilder>) -> BundleCoordinator {
    BundleCoordinator::new(
        OutputLayout::new(root),
        builder,
        Arc::new(RecordingSink::new()),
    )
}

#[tokio::test]
async fn test_dna_file_contains_target_node_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Arc::new(CountingBuilder::new());
    let coordinator = coordinator(dir.path(), builder.clone());

    let dna = coordinator
        .prepare(
            "toto",
            &[node(r#"{"id":"toto"}"#)],
            r#"{"id":"toto"}"#,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(dna, dir.path().join("dna").join("toto.json"));
    assert_eq!(std::fs::read_to_string(&dna).unwrap(), r#"{"id":"toto"}"#);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("nodes").join("toto.json")).unwrap(),
        r#"{"id":"toto"}"#
    );
    assert!(dir.path().join("bundle-done").exists());
    assert_eq!(builder.builds(), 1);
}

#[tokio::test]
async fn test_concurrent_runs_build_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Arc::new(CountingBuilder::slow(Duration::from_millis(100)));

    let mut handles = Vec::new();
    for i in 0..16 {
        let coordinator = coordinator(dir.path(), builder.clone()).with_backoff(Backoff {
            initial: Duration::from_millis(20),
            ceiling: Duration::from_secs(5),
        });
        handles.push(tokio::spawn(async move {
            let instance = format!("node-{}", i);
            let raw = format!(r#"{{"id":"{}"}}"#, instance);
            coordinator
                .prepare(&instance, &[node(&raw)], &raw, &CancellationToken::new())
                .await
        }));
    }

    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(builder.builds(), 1);
    for i in 0..16 {
        assert!(dir.path().join("dna").join(format!("node-{}.json", i)).exists());
    }
}

#[tokio::test]
async fn test_waiter_times_out_when_build_is_stuck() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let _held = FileLock::try_acquire(&layout.build_lock()).unwrap().unwrap();

    let builder = Arc::new(CountingBuilder::new());
    let coordinator = coordinator(dir.path(), builder.clone()).with_backoff(Backoff {
        initial: Duration::from_millis(20),
        ceiling: Duration::from_millis(100),
    });

    let started = std::time::Instant::now();
    let err = coordinator
        .prepare("toto", &[], r#"{"id":"toto"}"#, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        ProvisionError::CoordinationTimeout { marker, waited } => {
            assert_eq!(marker, layout.marker());
            assert_eq!(waited, Duration::from_millis(100));
        }
        other => panic!("expected a coordination timeout, got {}", other),
    }
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert_eq!(builder.builds(), 0);
    assert!(!layout.dna_file("toto").exists());
}

#[tokio::test]
async fn test_every_waiter_times_out_when_build_is_stuck() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let _held = FileLock::try_acquire(&layout.build_lock()).unwrap().unwrap();
    let builder = Arc::new(CountingBuilder::new());

    let mut handles = Vec::new();
    for i in 0..8 {
        let coordinator = coordinator(dir.path(), builder.clone()).with_backoff(Backoff {
            initial: Duration::from_millis(10),
            ceiling: Duration::from_millis(80),
        });
        handles.push(tokio::spawn(async move {
            let instance = format!("node-{}", i);
            let raw = format!(r#"{{"id":"{}"}}"#, instance);
            coordinator
                .prepare(&instance, &[node(&raw)], &raw, &CancellationToken::new())
                .await
        }));
    }

    for handle in handles {
        let err = handle.await.unwrap().unwrap_err();
        assert!(matches!(err, ProvisionError::CoordinationTimeout { .. }));
    }
    assert_eq!(builder.builds(), 0);
    assert!(!layout.dna_dir().exists());
}

#[tokio::test]
async fn test_waiter_proceeds_once_marker_appears() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let held = FileLock::try_acquire(&layout.build_lock()).unwrap().unwrap();

    let finisher = {
        let layout = layout.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            layout.mark_built().unwrap();
            held.release();
        })
    };

    let builder = Arc::new(CountingBuilder::new());
    let coordinator = coordinator(dir.path(), builder.clone()).with_backoff(Backoff {
        initial: Duration::from_millis(20),
        ceiling: Duration::from_secs(2),
    });
    let role = coordinator
        .ensure_bundle(&[], &CancellationToken::new())
        .await
        .unwrap();
    finisher.await.unwrap();

    assert_eq!(role, BundleRole::Waited);
    assert_eq!(builder.builds(), 0);
}

#[tokio::test]
async fn test_waiter_stops_on_cancellation() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let _held = FileLock::try_acquire(&layout.build_lock()).unwrap().unwrap();

    let coordinator = coordinator(dir.path(), Arc::new(CountingBuilder::new())).with_backoff(
        Backoff {
            initial: Duration::from_secs(2),
            ceiling: Duration::from_secs(60),
        },
    );
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = coordinator.ensure_bundle(&[], &cancel).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Cancelled(_)));
}

#[tokio::test]
async fn test_failed_build_releases_lock_without_marker() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let builder = Arc::new(CountingBuilder::failing());
    let coordinator = coordinator(dir.path(), builder.clone());

    let err = coordinator
        .prepare("toto", &[], r#"{"id":"toto"}"#, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisionError::LocalCommand { .. }));
    assert!(!layout.is_built());
    assert!(FileLock::try_acquire(&layout.build_lock()).unwrap().is_some());
}

#[tokio::test]
async fn test_rerun_keeps_existing_node_files() {
    let dir = tempfile::tempdir().unwrap();
    let builder = Arc::new(CountingBuilder::new());
    let coordinator = coordinator(dir.path(), builder.clone());
    let cancel = CancellationToken::new();

    coordinator
        .prepare("web", &[node(r#"{"id":"web","v":1}"#)], r#"{"id":"web"}"#, &cancel)
        .await
        .unwrap();
    let node_file = dir.path().join("nodes").join("web.json");
    let before = std::fs::read(&node_file).unwrap();

    let role = coordinator
        .ensure_bundle(&[node(r#"{"id":"web","v":2}"#)], &cancel)
        .await
        .unwrap();
    coordinator
        .prepare("web", &[node(r#"{"id":"web","v":2}"#)], r#"{"id":"web","v":2}"#, &cancel)
        .await
        .unwrap();

    assert_eq!(role, BundleRole::AlreadyBuilt);
    assert_eq!(builder.builds(), 1);
    assert_eq!(std::fs::read(&node_file).unwrap(), before);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("dna").join("web.json")).unwrap(),
        r#"{"id":"web"}"#
    );
}

#[tokio::test]
async fn test_late_run_contributes_its_node_files() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = coordinator(dir.path(), Arc::new(CountingBuilder::new()));
    let cancel = CancellationToken::new();

    coordinator
        .prepare("a", &[node(r#"{"id":"a"}"#)], r#"{"id":"a"}"#, &cancel)
        .await
        .unwrap();
    coordinator
        .prepare("b", &[node(r#"{"id":"b"}"#)], r#"{"id":"b"}"#, &cancel)
        .await
        .unwrap();

    assert!(dir.path().join("nodes").join("a.json").exists());
    assert!(dir.path().join("nodes").join("b.json").exists());
}

#[test]
fn test_node_files_skipped_while_node_lock_held() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let _held = FileLock::try_acquire(&layout.nodes_lock()).unwrap().unwrap();

    let sink = Arc::new(RecordingSink::new());
    let coordinator =
        BundleCoordinator::new(layout.clone(), Arc::new(CountingBuilder::new()), sink.clone());
    let written = coordinator
        .write_node_files(&[node(r#"{"id":"web"}"#)])
        .unwrap();

    assert_eq!(written, 0);
    assert!(!layout.node_file("web").exists());
    assert!(sink.lines().iter().any(|l| l.contains("locked")));
}

#[test]
fn test_write_if_absent_keeps_first_content_and_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("web.json");
    let sink = RecordingSink::new();

    let first = write_if_absent(&path, r#"{"id":"web","v":1}"#, &sink).unwrap();
    let second = write_if_absent(&path, r#"{"id":"web","v":2}"#, &sink).unwrap();

    assert_eq!(first, WriteOutcome::Written);
    assert_eq!(second, WriteOutcome::AlreadyPresent);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"id":"web","v":1}"#);
    let entries: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .collect();
    assert_eq!(entries, vec![std::ffi::OsString::from("web.json")]);
    assert!(sink
        .lines()
        .iter()
        .any(|l| l.ends_with("already exists, not writing it again")));
}

#[test]
fn test_write_if_absent_ignores_stale_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("web.json");
    std::fs::write(dir.path().join(".web.json.0.0.tmp"), "{\"id\":").unwrap();

    let outcome = write_if_absent(&path, r#"{"id":"web"}"#, &RecordingSink::new()).unwrap();

    assert_eq!(outcome, WriteOutcome::Written);
    assert_eq!(std::fs::read_to_string(&path).unwrap(), r#"{"id":"web"}"#);
}

#[test]
fn test_prepare_clears_unfinished_output() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("bundle");
    std::fs::create_dir_all(root.join("cookbooks")).unwrap();
    std::fs::write(root.join("cookbooks").join("stale.rb"), "old").unwrap();

    OutputLayout::new(&root).prepare().unwrap();

    assert!(root.exists());
    assert!(!root.join("cookbooks").exists());
}

#[test]
fn test_prepare_keeps_completed_bundle() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("bundle");
    let layout = OutputLayout::new(&root);
    std::fs::create_dir_all(layout.nodes_dir()).unwrap();
    std::fs::write(layout.node_file("web"), r#"{"id":"web"}"#).unwrap();
    layout.mark_built().unwrap();

    layout.prepare().unwrap();

    assert!(layout.is_built());
    assert!(layout.node_file("web").exists());
}

#[test]
fn test_prepare_leaves_dir_alone_while_build_lock_held() {
    let dir = tempfile::tempdir().unwrap();
    let layout = OutputLayout::new(dir.path());
    let _held = FileLock::try_acquire(&layout.build_lock()).unwrap().unwrap();
    std::fs::write(dir.path().join("in-progress"), "x").unwrap();

    layout.prepare().unwrap();

    assert!(dir.path().join("in-progress").exists());
}

#[test]
fn test_prepare_creates_missing_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("a").join("b");

    OutputLayout::new(&root).prepare().unwrap();

    assert!(root.is_dir());
}

#[test]
fn test_bundle_commands_cookbook_mode() {
    let fixture = Fixture::new();
    let request = ProvisionRequest::resolve(&fixture.config("toto")).unwrap();

    assert_eq!(
        bundle_commands(&request),
        vec![format!(
            "bundle exec berks vendor -b=\"{}/Berksfile\" {}/cookbooks",
            fixture.module.display(),
            fixture.output.display()
        )]
    );
}

#[test]
fn test_bundle_commands_policy_mode() {
    let fixture = Fixture::new();
    let mut config = fixture.config("toto");
    config.use_policyfile = true;
    config.bundle_prefix = "chruby-exec 2.6 --".to_string();
    let request = ProvisionRequest::resolve(&config).unwrap();

    assert_eq!(
        bundle_commands(&request),
        vec![
            format!(
                "chruby-exec 2.6 -- chef install {}/Policyfile.rb",
                fixture.module.display()
            ),
            format!(
                "chruby-exec 2.6 -- chef export --force {}/Policyfile.rb {}",
                fixture.module.display(),
                fixture.output.display()
            ),
        ]
    );
}
