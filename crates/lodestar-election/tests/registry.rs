//! Registry strategy driven by a real registry file on disk.

use std::path::Path;
use std::time::Duration;

use lodestar_election::{
    BackoffPolicy, ElectionEvent, Elector, ElectorConfig, FileIdentitySource, FileRegistry,
    FileRegistryConfig, Identity, MemberFilter, RegistryConfig, RegistryStrategy, Role,
};
use tokio::sync::mpsc;

fn registry(path: &Path) -> FileRegistry {
    FileRegistry::new(
        path,
        FileRegistryConfig {
            poll_interval: Duration::from_millis(20),
            wait_timeout: Duration::from_secs(30),
        },
    )
}

fn registry_config() -> RegistryConfig {
    RegistryConfig {
        filter: MemberFilter::group("web"),
        identity_attempts: 3,
        identity_retry_delay: Duration::from_millis(10),
        recheck_interval: Duration::from_millis(50),
        backoff: fast_backoff(),
    }
}

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy {
        throttled: Duration::from_millis(20),
        transient: Duration::from_millis(40),
    }
}

fn elector_config() -> ElectorConfig {
    ElectorConfig {
        backoff: fast_backoff(),
        ..ElectorConfig::default()
    }
}

fn spawn_instance(
    path: &Path,
    me: &str,
) -> (
    Elector<RegistryStrategy<FileRegistry, Identity>>,
    mpsc::Receiver<ElectionEvent>,
) {
    let strategy = RegistryStrategy::new(registry(path), Identity::new(me), registry_config());
    let (mut elector, rx) = Elector::new(strategy, elector_config());
    elector.start();
    (elector, rx)
}

/// Replaces the registry in one rename so a poll never sees a partial file.
fn rewrite(path: &Path, contents: &str) {
    let staged = path.with_extension("next");
    std::fs::write(&staged, contents).unwrap();
    std::fs::rename(&staged, path).unwrap();
}

async fn next_event(rx: &mut mpsc::Receiver<ElectionEvent>) -> ElectionEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

#[tokio::test]
async fn smallest_of_three_leads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web task-3\nweb task-1\nweb task-2\n").unwrap();

    let (_one, mut one_rx) = spawn_instance(&path, "task-1");
    let (_two, mut two_rx) = spawn_instance(&path, "task-2");
    let (_three, mut three_rx) = spawn_instance(&path, "task-3");

    assert!(matches!(next_event(&mut one_rx).await, ElectionEvent::Leader));
    assert!(matches!(next_event(&mut two_rx).await, ElectionEvent::Follower));
    assert!(matches!(next_event(&mut three_rx).await, ElectionEvent::Follower));
}

#[tokio::test]
async fn follower_reelects_once_when_leader_leaves() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web a\nweb b\n").unwrap();

    let (b, mut rx) = spawn_instance(&path, "b");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Follower));
    assert_eq!(b.role(), Role::Follower);

    std::fs::write(&path, "web b\n").unwrap();

    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Reelection));
    // the new detection sees the fresh listing
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));
    assert_eq!(b.role(), Role::Leader);

    // nothing else happens while membership is stable
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn unregistered_instance_waits_for_its_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web b\n").unwrap();

    let (_a, mut rx) = spawn_instance(&path, "a");

    // not listed yet: retried quietly, no event
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(rx.try_recv().is_err());

    std::fs::write(&path, "web b\nweb a\n").unwrap();
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));
}

#[tokio::test]
async fn leader_hands_over_to_smaller_newcomer() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web m\nweb z\n").unwrap();

    let (_m, mut rx) = spawn_instance(&path, "m");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));

    // a newcomer that sorts first takes over on the next recheck
    std::fs::write(&path, "web m\nweb z\nweb a\n").unwrap();
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Reelection));
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Follower));
}

#[tokio::test]
async fn leader_ignores_unrelated_membership_churn() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web a\nweb b\n").unwrap();

    let (_a, mut rx) = spawn_instance(&path, "a");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));

    std::fs::write(&path, "web a\nweb c\nbatch 0\n").unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "unchanged role must not be re-announced");
}

#[tokio::test]
async fn leader_steps_down_when_its_entry_is_removed() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web a\nweb b\n").unwrap();

    let (a, mut rx) = spawn_instance(&path, "a");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));

    rewrite(&path, "web b\n");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Reelection));
    assert_ne!(a.role(), Role::Leader);

    // unlisted now: detection is retried without announcing a role
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err());
    assert_eq!(a.role(), Role::Undetermined);
}

#[tokio::test]
async fn follower_ignores_departure_of_another_follower() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web a\nweb b\nweb c\n").unwrap();

    let (c, mut rx) = spawn_instance(&path, "c");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Follower));

    rewrite(&path, "web a\nweb c\n");
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(rx.try_recv().is_err(), "leader a is still registered");
    assert_eq!(c.role(), Role::Follower);

    // the leader itself leaving still triggers one re-election
    rewrite(&path, "web c\n");
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Reelection));
    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Leader));
}

#[tokio::test]
async fn missing_identity_halts_with_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    std::fs::write(&path, "web a\n").unwrap();

    let strategy = RegistryStrategy::new(
        registry(&path),
        FileIdentitySource::plain(dir.path().join("identity")),
        registry_config(),
    );
    let (mut elector, mut rx) = Elector::new(strategy, elector_config());
    elector.start();

    match next_event(&mut rx).await {
        ElectionEvent::Error(e) => assert!(e.is_fatal(), "{e}"),
        other => panic!("expected Error, got {other:?}"),
    }
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn identity_file_appearing_late_is_picked_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("registry");
    let id_path = dir.path().join("metadata.json");
    std::fs::write(&path, "web arn:task/1\nweb arn:task/2\n").unwrap();
    std::fs::write(&id_path, r#"{"MetadataFileStatus":"PENDING"}"#).unwrap();

    let config = RegistryConfig {
        identity_attempts: 100,
        ..registry_config()
    };
    let strategy = RegistryStrategy::new(
        registry(&path),
        FileIdentitySource::json_field(&id_path, "TaskARN"),
        config,
    );
    let (mut elector, mut rx) = Elector::new(strategy, elector_config());
    elector.start();

    tokio::time::sleep(Duration::from_millis(50)).await;
    std::fs::write(
        &id_path,
        r#"{"MetadataFileStatus":"READY","TaskARN":"arn:task/2"}"#,
    )
    .unwrap();

    assert!(matches!(next_event(&mut rx).await, ElectionEvent::Follower));
}
