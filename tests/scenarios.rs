//! End-to-end scenarios through the service contract

use pairing_core::{
    ActorId, BucketConfig, ChannelDispatcher, Clock, Delivery, IdempotencyKey, ManualClock, NoOpObserver,
    OperationClass, PairingConfig, PairingError, PairingNotice, PairingService, RateScope,
    RequestId, RequestStatus, ResolveAction, ResourceRef,
};
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing_subscriber::EnvFilter;

const T0: u64 = 1_700_000_000_000;
const MINUTE: u64 = 60_000;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pairing_core=debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn service_with(config: PairingConfig) -> (Arc<ManualClock>, Arc<PairingService>, UnboundedReceiver<PairingNotice>) {
    init_tracing();
    let clock = Arc::new(ManualClock::new(T0));
    let (dispatcher, notices) = ChannelDispatcher::new();
    let service = PairingService::in_memory(config, clock.clone(), Arc::new(dispatcher), Arc::new(NoOpObserver))
        .expect("default config is valid");
    (clock, Arc::new(service), notices)
}

fn service() -> (Arc<ManualClock>, Arc<PairingService>, UnboundedReceiver<PairingNotice>) {
    service_with(PairingConfig::default())
}

fn actor(name: &str) -> ActorId {
    ActorId::new(name)
}

async fn open(service: &PairingService, ttl_secs: u64) -> RequestId {
    service
        .create_request(&actor("A"), &actor("B"), ResourceRef::new("chat"), Some(ttl_secs), None)
        .await
        .unwrap()
        .request
        .id
}

#[tokio::test]
async fn accept_then_late_cancel_sees_accepted() {
    let (clock, service, _notices) = service();
    let id = open(&service, 60).await;

    clock.advance_secs(30);
    let accepted = service
        .resolve_request(id, &actor("B"), ResolveAction::Accept, None)
        .await
        .unwrap();
    assert_eq!(accepted.outcome.status, RequestStatus::Accepted);
    assert_eq!(accepted.outcome.version, 2);

    clock.advance_secs(1);
    let err = service
        .resolve_request(id, &actor("A"), ResolveAction::Cancel { reason: None }, None)
        .await
        .unwrap_err();
    match err {
        PairingError::AlreadyResolved { status, resolved_by, .. } => {
            assert_eq!(status, RequestStatus::Accepted);
            assert_eq!(resolved_by, Some(actor("B")));
        }
        other => panic!("expected AlreadyResolved, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_cancels_agree() {
    let (_clock, service, _notices) = service();
    let id = open(&service, 60).await;

    let handles: Vec<_> = ["A", "B"]
        .into_iter()
        .map(|name| {
            let service = service.clone();
            tokio::spawn(async move {
                service
                    .resolve_request(id, &actor(name), ResolveAction::Cancel { reason: Some("busy".into()) }, None)
                    .await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap().unwrap().outcome);
    }
    assert_eq!(outcomes[0], outcomes[1]);
    assert_eq!(outcomes[0].status, RequestStatus::Cancelled);
    assert_eq!(outcomes[0].version, 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_workers_commit_exactly_once() {
    for round in 0..10 {
        let (clock, service, _notices) = service();
        let id = open(&service, 60).await;
        // Odd rounds race against the deadline as well
        if round % 2 == 1 {
            clock.advance_secs(60);
        }

        let mut handles = Vec::new();
        for worker in 0..16 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                match worker % 4 {
                    0 => service
                        .resolve_request(id, &actor("B"), ResolveAction::Accept, None)
                        .await
                        .map(|r| Some(r.outcome.status)),
                    1 => service
                        .resolve_request(id, &actor("B"), ResolveAction::Decline, None)
                        .await
                        .map(|r| Some(r.outcome.status)),
                    2 => service
                        .resolve_request(id, &actor("A"), ResolveAction::Cancel { reason: None }, None)
                        .await
                        .map(|r| Some(r.outcome.status)),
                    _ => service.run_maintenance().map(|_| None),
                }
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Some(status)) => seen.push(status),
                Ok(None) => {}
                Err(PairingError::AlreadyResolved { status, .. }) => seen.push(status),
                Err(PairingError::Expired { .. }) => seen.push(RequestStatus::Expired),
                Err(other) => panic!("unexpected error {other:?}"),
            }
        }

        let record = service.get_request(&actor("A"), id).unwrap();
        assert_eq!(record.version, 2);
        assert!(record.status.is_terminal());
        assert!(seen.iter().all(|status| *status == record.status));
    }
}

#[tokio::test]
async fn keyed_resolve_replays_identically() {
    let (_clock, service, mut notices) = service();
    let id = open(&service, 60).await;
    while notices.try_recv().is_ok() {}

    let key = IdempotencyKey::for_resolve(id, &actor("B"), "decline", 0);
    let first = service
        .resolve_request(id, &actor("B"), ResolveAction::Decline, Some(&key))
        .await
        .unwrap();
    let second = service
        .resolve_request(id, &actor("B"), ResolveAction::Decline, Some(&key))
        .await
        .unwrap();

    assert_eq!(first.outcome, second.outcome);
    assert_eq!(first.delivery, Delivery::Sent);
    assert_eq!(second.delivery, Delivery::Skipped);

    let mut delivered = 0;
    while notices.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 1);
}

#[tokio::test]
async fn global_bucket_denies_past_capacity() {
    let mut config = PairingConfig::default();
    config.rate_limit.global = BucketConfig {
        capacity: 5.0,
        refill_rate: 1.0,
    };
    config.rate_limit.per_actor = BucketConfig {
        capacity: 100.0,
        refill_rate: 10.0,
    };
    let (_clock, service, _notices) = service_with(config);

    let caller = actor("A");
    for _ in 0..5 {
        assert!(service.check_rate(&caller, OperationClass::Read).unwrap().allowed);
    }
    let denied = service.check_rate(&caller, OperationClass::Read).unwrap();
    assert!(!denied.allowed);
    assert_eq!(denied.denied_by, Some(RateScope::Global));
    assert!(denied.retry_after_secs > 0);
}

#[tokio::test]
async fn sustained_throughput_is_bounded() {
    let mut config = PairingConfig::default();
    config.rate_limit.per_actor = BucketConfig {
        capacity: 4.0,
        refill_rate: 2.0,
    };
    let (clock, service, _notices) = service_with(config);

    let caller = actor("A");
    let seconds = 30u64;
    let mut spent = 0u64;
    for _ in 0..seconds * 10 {
        for _ in 0..3 {
            if service.check_rate(&caller, OperationClass::Read).unwrap().allowed {
                spent += 1;
            }
        }
        clock.advance_millis(100);
    }
    assert!(spent <= 2 * seconds + 4, "spent {spent}");
    assert!(spent >= 2 * seconds);
}

#[tokio::test]
async fn three_reporters_mute_and_fourth_is_ignored() {
    let (clock, service, _notices) = service();
    let x = actor("X");

    let mut last = None;
    for (i, reporter) in ["r1", "r2", "r3"].into_iter().enumerate() {
        clock.advance_millis(MINUTE);
        let outcome = service.report_actor(&actor(reporter), &x).unwrap();
        assert_eq!(outcome.muted, i == 2);
        last = Some(outcome);
    }
    let muted_until = last.and_then(|o| o.muted_until_millis).unwrap();
    assert_eq!(muted_until, clock.now_millis() + 30 * MINUTE);

    clock.advance_millis(MINUTE);
    let fourth = service.report_actor(&actor("r4"), &x).unwrap();
    assert!(fourth.muted);
    assert_eq!(fourth.muted_until_millis, Some(muted_until));

    let err = service
        .create_request(&x, &actor("Y"), ResourceRef::new("chat"), None, None)
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PairingError::Muted {
            actor: x.clone(),
            muted_until_millis: muted_until
        }
    );

    clock.set_millis(muted_until);
    assert!(service
        .create_request(&x, &actor("Y"), ResourceRef::new("chat"), None, None)
        .await
        .is_ok());
}

#[tokio::test]
async fn sweep_is_idempotent_for_same_instant() {
    let (clock, service, _notices) = service();
    open(&service, 10).await;
    service
        .create_request(&actor("C"), &actor("B"), ResourceRef::new("chat"), Some(10), None)
        .await
        .unwrap();

    clock.advance_secs(10);
    assert_eq!(service.run_maintenance().unwrap().expired, 2);
    assert_eq!(service.run_maintenance().unwrap().expired, 0);
    assert!(service.list_incoming(&actor("B")).unwrap().is_empty());
}

#[tokio::test]
async fn violations_escalate() {
    let (clock, service, _notices) = service();
    let x = actor("X");
    let steps: Vec<_> = (0..3).map(|_| service.record_violation(&x).unwrap()).collect();
    assert_eq!(steps[0].action, pairing_core::ViolationAction::Warning);
    assert_eq!(
        steps[1].action,
        pairing_core::ViolationAction::Muted {
            until_millis: clock.now_millis() + 10 * MINUTE
        }
    );
    assert_eq!(
        steps[2].action,
        pairing_core::ViolationAction::Muted {
            until_millis: clock.now_millis() + 60 * MINUTE
        }
    );
    assert_eq!(service.violation_counter(&x).unwrap().violation_count, 3);
}
