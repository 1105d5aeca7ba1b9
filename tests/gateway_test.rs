//! Cooldown, self-interaction and duplicate guards

use openmolt::{
    ActionGateway, ActionKind, ActionPolicy, Error, FailureKind, GatewayConfig, InMemoryStore, ManualClock,
    SqliteStore, StateStore,
};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const MINUTE: Duration = Duration::from_secs(60);

fn gateway(config: GatewayConfig) -> (ActionGateway, Arc<ManualClock>, Arc<InMemoryStore>) {
    let clock = Arc::new(ManualClock::fixed());
    let store = Arc::new(InMemoryStore::new());
    let gateway = ActionGateway::open(config, store.clone(), clock.clone()).unwrap();
    (gateway, clock, store)
}

#[test]
fn test_post_cooldown_thirty_minutes() {
    let (mut gateway, clock, _) = gateway(GatewayConfig::default());

    let first = gateway.authorize(ActionKind::Post, None, Some("hello")).unwrap();
    gateway.confirm(first, Some("p1")).unwrap();

    clock.advance(10 * MINUTE);
    match gateway.authorize(ActionKind::Post, None, Some("second")) {
        Err(Error::RateLimited { kind, retry_after }) => {
            assert_eq!(kind, ActionKind::Post);
            assert!(retry_after >= 20 * MINUTE);
        }
        other => panic!("expected rate limit, got {:?}", other),
    }

    clock.advance(20 * MINUTE);
    assert_ok!(gateway.authorize(ActionKind::Post, None, Some("second")));
}

#[test]
fn test_comment_on_own_post_rejected() {
    let (mut gateway, clock, _) = gateway(GatewayConfig::default());

    let post = gateway.authorize(ActionKind::Post, None, Some("mine")).unwrap();
    gateway.confirm(post, Some("X")).unwrap();

    let err = gateway.authorize(ActionKind::Comment, Some("X"), Some("nice")).unwrap_err();
    assert!(matches!(err, Error::SelfInteraction { .. }));

    clock.advance(MINUTE);
    assert_ok!(gateway.authorize(ActionKind::Comment, Some("Y"), Some("nice")));

    // deleting our own post is exempt
    assert_ok!(gateway.authorize(ActionKind::DeletePost, Some("X"), None));
}

#[test]
fn test_duplicate_inside_window() {
    let config = GatewayConfig {
        dedup_window: 60 * MINUTE,
        ..GatewayConfig::default()
    }
    .with_policy(ActionKind::Vote, ActionPolicy::interval(Duration::ZERO));
    let (mut gateway, clock, _) = gateway(config);

    let vote = gateway.authorize(ActionKind::Vote, Some("p9"), None).unwrap();
    gateway.confirm(vote, None).unwrap();

    clock.advance(30 * MINUTE);
    assert!(matches!(
        gateway.authorize(ActionKind::Vote, Some("p9"), None),
        Err(Error::DuplicateAction { kind: ActionKind::Vote })
    ));
    assert_ok!(gateway.authorize(ActionKind::Vote, Some("p10"), None));

    clock.advance(31 * MINUTE);
    assert_ok!(gateway.authorize(ActionKind::Vote, Some("p9"), None));
}

#[test]
fn test_rolling_window_quota() {
    let config = GatewayConfig::default().with_policy(
        ActionKind::Comment,
        ActionPolicy::interval(Duration::from_secs(20))
            .with_quota(3, 24 * 60 * MINUTE)
            .creating_content(),
    );
    let (mut gateway, clock, _) = gateway(config);

    for i in 0..3 {
        let content = format!("comment {}", i);
        let reservation = gateway.authorize(ActionKind::Comment, Some("p1"), Some(&content)).unwrap();
        gateway.confirm(reservation, Some(&format!("c{}", i))).unwrap();
        clock.advance(MINUTE);
    }

    let err = gateway.authorize(ActionKind::Comment, Some("p1"), Some("comment 4")).unwrap_err();
    match err {
        Error::RateLimited { retry_after, .. } => assert!(retry_after > 20 * 60 * MINUTE),
        other => panic!("expected quota exhaustion, got {:?}", other),
    }

    clock.advance(24 * 60 * MINUTE);
    assert_ok!(gateway.authorize(ActionKind::Comment, Some("p1"), Some("comment 4")));
}

#[test]
fn test_release_transient_vs_permanent() {
    let (mut gateway, _, _) = gateway(GatewayConfig::default());

    let attempt = gateway.authorize(ActionKind::DirectMessage, Some("crab"), Some("hi")).unwrap();
    gateway.release_on_failure(attempt, FailureKind::Transient).unwrap();
    assert_eq!(gateway.retry_after(ActionKind::DirectMessage), Duration::ZERO);

    // the cooldown is back but the same message is still a duplicate
    assert!(matches!(
        gateway.authorize(ActionKind::DirectMessage, Some("crab"), Some("hi")),
        Err(Error::DuplicateAction { .. })
    ));

    let attempt = gateway
        .authorize(ActionKind::DirectMessage, Some("crab"), Some("hi again"))
        .unwrap();
    gateway.release_on_failure(attempt, FailureKind::Permanent).unwrap();
    assert!(gateway.retry_after(ActionKind::DirectMessage) > Duration::ZERO);
    assert_err!(gateway.authorize(ActionKind::DirectMessage, Some("lobster"), Some("hello")));
}

#[test]
fn test_failed_persist_rolls_back_reservation() {
    let (mut gateway, _, store) = gateway(GatewayConfig::default());

    store.set_fail_writes(true);
    let err = gateway.authorize(ActionKind::Post, None, Some("hello")).unwrap_err();
    assert!(matches!(err, Error::Persistence(_)));
    assert_eq!(gateway.retry_after(ActionKind::Post), Duration::ZERO);

    store.set_fail_writes(false);
    assert_ok!(gateway.authorize(ActionKind::Post, None, Some("hello")));
}

#[test]
fn test_state_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("gateway.db");
    let clock = Arc::new(ManualClock::fixed());

    {
        let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
        let mut gateway = ActionGateway::open(GatewayConfig::default(), store, clock.clone()).unwrap();
        let post = gateway.authorize(ActionKind::Post, None, Some("hello")).unwrap();
        gateway.confirm(post, Some("p-restart")).unwrap();
    }

    clock.advance(5 * MINUTE);
    let store: Arc<dyn StateStore> = Arc::new(SqliteStore::open(&db_path).unwrap());
    let mut gateway = ActionGateway::open(GatewayConfig::default(), store, clock).unwrap();

    assert!(gateway.is_own("p-restart"));
    assert!(matches!(
        gateway.authorize(ActionKind::Comment, Some("p-restart"), Some("self five")),
        Err(Error::SelfInteraction { .. })
    ));
    assert!(matches!(
        gateway.authorize(ActionKind::Post, None, Some("again")),
        Err(Error::RateLimited { .. })
    ));
}
