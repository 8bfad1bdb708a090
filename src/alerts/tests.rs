use super::*;
use crate::db::memory::MemoryPersistence;
use crate::geo::GeoIndex;
use crate::models::alert::{AlertLocation, AlertType, Severity};
use crate::notify::ExternalNotifier;
use crate::presence::tests::{connect, drain_events};
use crate::presence::PresenceRegistry;
use crate::rewards::tests::RecordingLedger;

struct Harness {
    store: Arc<MemoryPersistence>,
    presence: Arc<PresenceRegistry>,
    ledger: Arc<RecordingLedger>,
    lifecycle: Arc<AlertLifecycle>,
}

fn harness() -> Harness {
    let store = Arc::new(MemoryPersistence::new());
    let presence = Arc::new(PresenceRegistry::new());
    let ledger = Arc::new(RecordingLedger::default());
    let notifier = Arc::new(ExternalNotifier::new(None, None, Duration::from_secs(5)));
    let policy = AlertPolicy::default();
    let dispatcher = NotificationDispatcher::new(
        GeoIndex::new(store.clone(), presence.clone()),
        presence.clone(),
        store.clone(),
        notifier,
        policy.dispatch_radius_meters,
    );
    let lifecycle = AlertLifecycle::new(
        store.clone(),
        dispatcher,
        RewardTrigger::new(ledger.clone()),
        policy,
    );
    Harness {
        store,
        presence,
        ledger,
        lifecycle,
    }
}

fn request(alert_type: AlertType) -> NewAlert {
    NewAlert {
        alert_type,
        severity: Severity::High,
        location: AlertLocation {
            lat: 12.97,
            lon: 77.59,
            address: None,
        },
        description: None,
    }
}

async fn create(h: &Harness, reporter: &str) -> EmergencyAlert {
    h.lifecycle
        .create(reporter, request(AlertType::Breakdown))
        .await
        .unwrap()
        .alert
}

async fn stored(h: &Harness, id: Uuid) -> EmergencyAlert {
    h.store.load_alert(id).await.unwrap().unwrap()
}

fn response_grants(calls: &[crate::rewards::RewardGrant]) -> usize {
    calls
        .iter()
        .filter(|g| g.kind == RewardKind::EmergencyResponse)
        .count()
}

#[tokio::test]
async fn test_create_persists_active_alert_with_timer() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    assert_eq!(alert.status, AlertStatus::Active);
    assert!(alert.responders.is_empty());
    assert!(!alert.auto_resolved);
    assert_eq!(stored(&h, alert.id).await, alert);
    assert!(h.lifecycle.timers.is_scheduled(alert.id));
}

#[tokio::test]
async fn test_second_active_alert_within_window_is_rejected() {
    let h = harness();
    create(&h, "ravi").await;

    let second = h.lifecycle.create("ravi", request(AlertType::Medical)).await;
    assert!(matches!(second, Err(AlertError::DuplicateActiveAlert)));

    // Other reporters are unaffected.
    create(&h, "meera").await;
}

#[tokio::test]
async fn test_active_alert_older_than_window_does_not_block() {
    let h = harness();
    let mut old = EmergencyAlert::new(
        "ravi".to_string(),
        AlertType::Battery,
        Severity::Low,
        request(AlertType::Battery).location,
        None,
    );
    old.created_at = Utc::now() - chrono::Duration::minutes(6);
    h.store.save_alert(&old).await.unwrap();

    assert!(h.lifecycle.create("ravi", request(AlertType::Battery)).await.is_ok());
}

#[tokio::test]
async fn test_responded_alert_does_not_block_new_report() {
    let h = harness();
    let first = create(&h, "ravi").await;
    h.lifecycle.respond(first.id, "anil", None, None).await.unwrap();

    assert!(h.lifecycle.create("ravi", request(AlertType::Theft)).await.is_ok());
}

#[tokio::test]
async fn test_invalid_location_is_rejected_before_persisting() {
    let h = harness();
    let mut bad = request(AlertType::Accident);
    bad.location.lat = 123.0;

    let result = h.lifecycle.create("ravi", bad).await;
    assert!(matches!(result, Err(AlertError::InvalidLocation)));
    assert!(h.lifecycle.open_alerts_for("ravi").await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_creates_yield_one_alert() {
    let h = harness();
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let lifecycle = Arc::clone(&h.lifecycle);
        tasks.push(tokio::spawn(async move {
            lifecycle.create("ravi", request(AlertType::Accident)).await.map(|c| c.alert.id)
        }));
    }

    let mut created = 0;
    let mut duplicates = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(_) => created += 1,
            Err(AlertError::DuplicateActiveAlert) => duplicates += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!((created, duplicates), (1, 7));
}

#[tokio::test]
async fn test_first_responder_transitions_and_is_rewarded_once() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    let after_a = h
        .lifecycle
        .respond(alert.id, "anil", Some("on my way".to_string()), Some(4))
        .await
        .unwrap();
    assert_eq!(after_a.status, AlertStatus::Responded);

    let after_b = h.lifecycle.respond(alert.id, "bina", None, None).await.unwrap();
    assert_eq!(after_b.status, AlertStatus::Responded);
    assert_eq!(after_b.responders.len(), 2);
    assert_eq!(after_b.responders[0].responder_id, "anil");
    assert_eq!(after_b.responders[0].eta_minutes, Some(4));
    assert_eq!(after_b.responders[1].responder_id, "bina");

    let calls = h.ledger.settled_calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].user_id, "anil");
    assert_eq!(calls[0].kind, RewardKind::EmergencyResponse);
    assert_eq!(calls[0].points, 50);
    assert_eq!(calls[0].related_alert_id, alert.id);
}

#[tokio::test]
async fn test_respond_rejections() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    assert!(matches!(
        h.lifecycle.respond(alert.id, "ravi", None, None).await,
        Err(AlertError::SelfResponseNotAllowed)
    ));

    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();
    assert!(matches!(
        h.lifecycle.respond(alert.id, "anil", None, None).await,
        Err(AlertError::DuplicateResponse)
    ));
    assert_eq!(stored(&h, alert.id).await.responders.len(), 1);

    assert!(matches!(
        h.lifecycle.respond(Uuid::new_v4(), "anil", None, None).await,
        Err(AlertError::AlertNotFound)
    ));

    h.lifecycle.resolve(alert.id, "ravi").await.unwrap();
    assert!(matches!(
        h.lifecycle.respond(alert.id, "bina", None, None).await,
        Err(AlertError::AlertNotActive)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_responders_grant_one_first_response() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    let mut tasks = Vec::new();
    for i in 0..10 {
        let lifecycle = Arc::clone(&h.lifecycle);
        tasks.push(tokio::spawn(async move {
            lifecycle
                .respond(alert.id, &format!("rider-{}", i), None, None)
                .await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let final_alert = stored(&h, alert.id).await;
    assert_eq!(final_alert.status, AlertStatus::Responded);
    assert_eq!(final_alert.responders.len(), 10);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(response_grants(&h.ledger.calls()), 1);
}

#[tokio::test]
async fn test_resolve_authorization() {
    let h = harness();
    let alert = create(&h, "ravi").await;
    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();

    assert!(matches!(
        h.lifecycle.resolve(alert.id, "stranger").await,
        Err(AlertError::NotAuthorizedToResolve)
    ));

    let resolved = h.lifecycle.resolve(alert.id, "anil").await.unwrap();
    assert_eq!(resolved.status, AlertStatus::Resolved);
    assert_eq!(resolved.resolved_by.as_deref(), Some("anil"));
    assert!(resolved.resolved_at.is_some());
    assert!(!resolved.auto_resolved);
    assert!(!h.lifecycle.timers.is_scheduled(alert.id));

    assert!(matches!(
        h.lifecycle.resolve(alert.id, "ravi").await,
        Err(AlertError::AlreadyResolved)
    ));
    assert!(matches!(
        h.lifecycle.resolve(Uuid::new_v4(), "ravi").await,
        Err(AlertError::AlertNotFound)
    ));
}

#[tokio::test]
async fn test_manual_resolution_rewards_each_responder_once() {
    let h = harness();
    let alert = create(&h, "ravi").await;
    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();
    h.lifecycle.respond(alert.id, "bina", None, None).await.unwrap();

    h.lifecycle.resolve(alert.id, "ravi").await.unwrap();

    let calls = h.ledger.settled_calls().await;
    let mut resolved: Vec<&str> = calls
        .iter()
        .filter(|g| g.kind == RewardKind::EmergencyResolved)
        .map(|g| g.user_id.as_str())
        .collect();
    resolved.sort_unstable();
    assert_eq!(resolved, vec!["anil", "bina"]);
    assert_eq!(response_grants(&calls), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unattended_alert_auto_resolves_after_thirty_minutes() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    tokio::time::sleep(Duration::from_secs(29 * 60)).await;
    assert_eq!(stored(&h, alert.id).await.status, AlertStatus::Active);

    tokio::time::sleep(Duration::from_secs(2 * 60)).await;
    let closed = stored(&h, alert.id).await;
    assert_eq!(closed.status, AlertStatus::Resolved);
    assert!(closed.auto_resolved);
    assert!(closed.resolved_by.is_none());
    assert_eq!(h.lifecycle.timers.len(), 0);
    assert!(h.ledger.settled_calls().await.is_empty());

    assert!(matches!(
        h.lifecycle.resolve(alert.id, "ravi").await,
        Err(AlertError::AlreadyResolved)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_manual_resolve_makes_later_timer_a_no_op() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    h.lifecycle.resolve(alert.id, "ravi").await.unwrap();
    let at_resolve = stored(&h, alert.id).await;

    tokio::time::sleep(Duration::from_secs(25 * 60)).await;
    let later = stored(&h, alert.id).await;
    assert_eq!(later, at_resolve);
    assert_eq!(later.resolved_by.as_deref(), Some("ravi"));
    assert!(!later.auto_resolved);
    assert_eq!(h.lifecycle.timers.len(), 0);

    // A stray late firing is equally harmless.
    assert!(h.lifecycle.auto_resolve_fired(alert.id).await.unwrap().is_none());
    assert_eq!(stored(&h, alert.id).await, at_resolve);
}

#[tokio::test(start_paused = true)]
async fn test_response_does_not_reset_timer_and_responded_alert_is_left_open() {
    let h = harness();
    let alert = create(&h, "ravi").await;

    tokio::time::sleep(Duration::from_secs(20 * 60)).await;
    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();

    // Timer still fires at minute 30, not 50; it finds the alert responded.
    tokio::time::sleep(Duration::from_secs(11 * 60)).await;
    assert_eq!(h.lifecycle.timers.len(), 0);
    let after = stored(&h, alert.id).await;
    assert_eq!(after.status, AlertStatus::Responded);
    assert!(!after.auto_resolved);
}

#[tokio::test(start_paused = true)]
async fn test_responded_alert_releases_keys_when_timer_passes() {
    let h = harness();
    h.store.put_rider_at("anil", 12.975, 77.59).await;
    let (_a, _anil_rx) = connect(&h.presence, "anil");

    let created = h.lifecycle.create("ravi", request(AlertType::Breakdown)).await.unwrap();
    assert_eq!(created.dispatch.pushed, vec!["anil".to_string()]);
    h.lifecycle.respond(created.alert.id, "anil", None, None).await.unwrap();
    assert_eq!(h.lifecycle.dispatcher.delivered_len(), 1);
    assert_eq!(h.lifecycle.rewards.claimed_len(), 1);

    tokio::time::sleep(Duration::from_secs(31 * 60)).await;

    assert_eq!(stored(&h, created.alert.id).await.status, AlertStatus::Responded);
    assert_eq!(h.lifecycle.dispatcher.delivered_len(), 0);
    assert_eq!(h.lifecycle.rewards.claimed_len(), 0);
}

#[tokio::test]
async fn test_manual_resolve_releases_keys() {
    let h = harness();
    h.store.put_rider_at("anil", 12.975, 77.59).await;
    let (_a, _anil_rx) = connect(&h.presence, "anil");

    let alert = create(&h, "ravi").await;
    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();
    h.lifecycle.resolve(alert.id, "anil").await.unwrap();

    assert_eq!(h.lifecycle.dispatcher.delivered_len(), 0);
    assert_eq!(h.lifecycle.rewards.claimed_len(), 0);
    // Grants issued before the release still reach the ledger.
    assert_eq!(h.ledger.settled_calls().await.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_resolve_racing_timer_leaves_one_outcome() {
    let h = harness();

    for i in 0..20 {
        let reporter = format!("reporter-{}", i);
        let alert = create(&h, &reporter).await;

        let lifecycle = Arc::clone(&h.lifecycle);
        let by = reporter.clone();
        let manual = tokio::spawn(async move { lifecycle.resolve(alert.id, &by).await });
        let lifecycle = Arc::clone(&h.lifecycle);
        let timer = tokio::spawn(async move { lifecycle.auto_resolve_fired(alert.id).await });

        let manual = manual.await.unwrap();
        let timer = timer.await.unwrap().unwrap();
        let closed = stored(&h, alert.id).await;
        assert_eq!(closed.status, AlertStatus::Resolved);

        match (manual, timer) {
            (Ok(resolved), None) => {
                assert_eq!(closed, resolved);
                assert_eq!(closed.resolved_by.as_deref(), Some(reporter.as_str()));
                assert!(!closed.auto_resolved);
            }
            (Err(AlertError::AlreadyResolved), Some(auto)) => {
                assert_eq!(closed, auto);
                assert!(closed.auto_resolved);
                assert!(closed.resolved_by.is_none());
            }
            (manual, timer) => panic!("two outcomes: {:?} / {:?}", manual, timer),
        }
        assert!(!h.lifecycle.timers.is_scheduled(alert.id));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolvers_and_timer_have_one_winner() {
    let h = harness();

    for i in 0..20 {
        let reporter = format!("reporter-{}", i);
        let alert = create(&h, &reporter).await;
        h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();

        let mut resolvers = Vec::new();
        for user in [reporter.clone(), "anil".to_string()] {
            let lifecycle = Arc::clone(&h.lifecycle);
            resolvers.push(tokio::spawn(async move {
                let result = lifecycle.resolve(alert.id, &user).await;
                (user, result)
            }));
        }
        let lifecycle = Arc::clone(&h.lifecycle);
        let timer = tokio::spawn(async move { lifecycle.auto_resolve_fired(alert.id).await });

        let mut winners = Vec::new();
        for resolver in resolvers {
            match resolver.await.unwrap() {
                (user, Ok(_)) => winners.push(user),
                (_, Err(AlertError::AlreadyResolved)) => {}
                (user, Err(e)) => panic!("{} got {}", user, e),
            }
        }
        assert!(timer.await.unwrap().unwrap().is_none());
        assert_eq!(winners.len(), 1);

        let closed = stored(&h, alert.id).await;
        assert_eq!(closed.status, AlertStatus::Resolved);
        assert_eq!(closed.resolved_by.as_deref(), Some(winners[0].as_str()));
        assert!(!closed.auto_resolved);
    }
}

#[tokio::test]
async fn test_cancel_by_reporter_only() {
    let h = harness();
    let alert = create(&h, "ravi").await;
    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();

    assert!(matches!(
        h.lifecycle.cancel(alert.id, "anil").await,
        Err(AlertError::NotAuthorizedToResolve)
    ));

    let cancelled = h.lifecycle.cancel(alert.id, "ravi").await.unwrap();
    assert_eq!(cancelled.status, AlertStatus::Cancelled);
    assert!(!h.lifecycle.timers.is_scheduled(alert.id));

    assert!(matches!(
        h.lifecycle.resolve(alert.id, "ravi").await,
        Err(AlertError::AlreadyResolved)
    ));
    assert!(h.lifecycle.open_alerts_for("ravi").await.unwrap().is_empty());

    let calls = h.ledger.settled_calls().await;
    assert!(calls.iter().all(|g| g.kind == RewardKind::EmergencyResponse));
}

#[tokio::test]
async fn test_lifecycle_events_reach_participants() {
    let h = harness();
    let (_r, mut reporter_rx) = connect(&h.presence, "ravi");
    let (_a, mut anil_rx) = connect(&h.presence, "anil");
    let alert = create(&h, "ravi").await;
    drain_events(&mut reporter_rx);
    drain_events(&mut anil_rx);

    h.lifecycle.respond(alert.id, "anil", None, None).await.unwrap();
    let events = drain_events(&mut reporter_rx);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_type, EVENT_ALERT_RESPONSE);
    assert!(drain_events(&mut anil_rx).is_empty());

    h.lifecycle.resolve(alert.id, "ravi").await.unwrap();
    assert!(drain_events(&mut reporter_rx).is_empty());
    let events = drain_events(&mut anil_rx);
    assert_eq!(events[0].message_type, EVENT_ALERT_RESOLVED);
    assert_eq!(events[0].payload["alert"]["status"], "resolved");
}

#[tokio::test]
async fn test_created_alert_is_pushed_to_nearby_online_riders() {
    let h = harness();
    h.store.put_rider_at("anil", 12.975, 77.59).await;
    h.store.put_rider_at("bina", 12.99, 77.59).await;
    let (_a, mut anil_rx) = connect(&h.presence, "anil");
    drain_events(&mut anil_rx);

    let created = h.lifecycle.create("ravi", request(AlertType::Medical)).await.unwrap();

    assert_eq!(created.dispatch.pushed, vec!["anil".to_string()]);
    assert_eq!(drain_events(&mut anil_rx).len(), 1);
    assert!(created.dispatch.external.is_some());
}

#[tokio::test]
async fn test_query_nearby_alerts_excludes_own_and_closed() {
    let h = harness();
    let near = h
        .lifecycle
        .create("anil", {
            let mut r = request(AlertType::Breakdown);
            r.location.lat = 12.975;
            r
        })
        .await
        .unwrap()
        .alert;
    let nearer = create(&h, "bina").await;
    let own = create(&h, "ravi").await;
    let closed = create(&h, "meera").await;
    h.lifecycle.resolve(closed.id, "meera").await.unwrap();
    let _far = h
        .lifecycle
        .create("dev", {
            let mut r = request(AlertType::Breakdown);
            r.location.lat = 13.2;
            r
        })
        .await
        .unwrap();

    let found = h
        .lifecycle
        .query_nearby_alerts(GeoPoint { lat: 12.97, lon: 77.59 }, 5_000.0, "ravi")
        .await
        .unwrap();

    let ids: Vec<Uuid> = found.iter().map(|n| n.alert.id).collect();
    assert_eq!(ids, vec![nearer.id, near.id]);
    assert!(!ids.contains(&own.id));

    let invalid = h
        .lifecycle
        .query_nearby_alerts(GeoPoint { lat: -95.0, lon: 0.0 }, 5_000.0, "ravi")
        .await;
    assert!(matches!(invalid, Err(AlertError::InvalidLocation)));
}
