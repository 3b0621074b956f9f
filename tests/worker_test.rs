//! Integration tests for long-running handlers executed under heartbeat.

use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use workpool::clock::ManualClock;
use workpool::config::ConfigOverride;
use workpool::handler::{Completion, HandlerError, HandlerRegistry};
use workpool::model::*;
use workpool::retry::{RetryBehavior, RetryPolicy};
use workpool::scheduler::ManualScheduler;
use workpool::storage::Storage;
use workpool::Engine;

const START: i64 = 1_700_000_000_000;

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
}

fn harness(registry: HandlerRegistry, item_lease_ms: i64) -> Harness {
    let clock = Arc::new(ManualClock::from_millis(START));
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let overrides = ConfigOverride {
        item_lease_ms: Some(item_lease_ms),
        ..Default::default()
    };
    let engine = Engine::builder(Storage::in_memory().expect("in-memory storage"))
        .registry(registry)
        .clock(clock.clone())
        .scheduler(scheduler)
        .overrides(overrides)
        .build();
    Harness { engine, clock }
}

/// A handler that announces it started, then runs for `runtime`.
fn slow_handler(
    started: Arc<Notify>,
    finished: Arc<AtomicBool>,
    runtime: Duration,
) -> HandlerRegistry {
    HandlerRegistry::new().non_transactional("slow", move |payload| {
        let started = Arc::clone(&started);
        let finished = Arc::clone(&finished);
        async move {
            started.notify_one();
            tokio::time::sleep(runtime).await;
            finished.store(true, Ordering::SeqCst);
            Ok(payload)
        }
    })
}

fn claim(h: &Harness, lease_ms: i64) -> (ItemId, LeaseId) {
    let mut claimed = h.engine.dequeue("q", 1, lease_ms, OrderBy::Vesting).unwrap();
    assert_eq!(claimed.len(), 1);
    let (item, lease) = claimed.remove(0);
    (item.id, lease)
}

#[tokio::test]
async fn heartbeat_keeps_lease_alive() {
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let h = harness(
        slow_handler(started.clone(), finished.clone(), Duration::from_millis(200)),
        40,
    );
    h.engine
        .enqueue(NewItem::new("q", "slow", HandlerKind::NonTransactional))
        .unwrap();
    let (id, lease) = claim(&h, 40);

    let observe = async {
        started.notified().await;
        h.clock.advance_ms(30);
        tokio::time::sleep(Duration::from_millis(100)).await;
        h.engine.get_item(id).unwrap().unwrap()
    };
    let (outcome, during) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(h.engine.dispatch_worker(id, lease), observe)
    })
    .await
    .expect("worker should finish");

    // Heartbeats pushed both the lease and the vesting time out from the
    // advanced clock.
    let during_lease = during.lease.unwrap();
    assert_eq!(during_lease.id, lease);
    assert_eq!(during_lease.expiry, START + 70);
    assert_eq!(during.vesting_time, START + 70);

    assert!(outcome.unwrap().done);
    assert!(finished.load(Ordering::SeqCst));
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[tokio::test]
async fn lost_lease_discards_handler_result() {
    let started = Arc::new(Notify::new());
    let finished = Arc::new(AtomicBool::new(false));
    let h = harness(
        slow_handler(started.clone(), finished.clone(), Duration::from_secs(10)),
        40,
    );
    h.engine
        .enqueue(NewItem::new("q", "slow", HandlerKind::NonTransactional))
        .unwrap();
    let (id, lease) = claim(&h, 40);

    // The lease lapses before the first heartbeat and another worker
    // claims the item.
    let steal = async {
        started.notified().await;
        h.clock.advance_ms(100);
        h.engine.obtain_item_lease(id, 60_000).unwrap().unwrap()
    };
    let (outcome, thief) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(h.engine.dispatch_worker(id, lease), steal)
    })
    .await
    .expect("heartbeat should notice the lost lease");

    assert_eq!(outcome.unwrap(), FinalizeOutcome::default());
    assert!(!finished.load(Ordering::SeqCst));

    let item = h.engine.get_item(id).unwrap().unwrap();
    assert_eq!(item.phase, Phase::Run);
    assert_eq!(item.lease.unwrap().id, thief);
    assert_eq!(item.error_count, 0);
}

#[tokio::test]
async fn long_running_success_reaches_callback() {
    let seen = Arc::new(Mutex::new(Vec::<Completion>::new()));
    let sink = Arc::clone(&seen);
    let registry = HandlerRegistry::new()
        .non_transactional("fetch", |payload| async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(json!({ "fetched": payload }))
        })
        .on_complete("record", move |_, completion| {
            sink.lock().unwrap().push(completion.clone());
            Ok(())
        });
    let h = harness(registry, 60_000);
    h.engine
        .enqueue(
            NewItem::new("q", "fetch", HandlerKind::NonTransactional)
                .payload(json!("page-1"))
                .on_complete("record", Some(json!({ "job": 7 }))),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.done);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, CompletionStatus::Success);
    assert_eq!(seen[0].result, Some(json!({ "fetched": "page-1" })));
    assert_eq!(seen[0].context, Some(json!({ "job": 7 })));
}

#[tokio::test]
async fn long_running_failure_is_retried_with_backoff() {
    let registry = HandlerRegistry::new().non_transactional("flaky", |_| async {
        Err(HandlerError::new("upstream refused").with_cause("connection reset"))
    });
    let h = harness(registry, 60_000);
    let behavior = RetryBehavior {
        max_attempts: 3,
        initial_backoff_ms: 100,
        base: 2.0,
    };
    h.engine
        .enqueue(
            NewItem::new("q", "flaky", HandlerKind::NonTransactional)
                .retry(RetryPolicy::with_behavior(behavior)),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.retried_work);

    let item = h.engine.get_item(id).unwrap().unwrap();
    assert_eq!(item.error_count, 1);
    assert!(item.lease.is_none());
    assert_eq!(item.vesting_time, START + 100);
    assert_eq!(item.phase, Phase::Run);

    // Not ready until the backoff has elapsed.
    assert!(h.engine.dequeue("q", 1, 60_000, OrderBy::Vesting).unwrap().is_empty());
    h.clock.advance_ms(100);
    let (_, lease) = claim(&h, 60_000);
    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.retried_work);
    assert_eq!(
        h.engine.get_item(id).unwrap().unwrap().vesting_time,
        START + 100 + 200
    );
}

#[tokio::test]
async fn panicking_handler_counts_as_failure() {
    let registry = HandlerRegistry::new().non_transactional("explode", |_| async {
        if true {
            panic!("handler bug");
        }
        Ok(json!(null))
    });
    let h = harness(registry, 60_000);
    h.engine
        .enqueue(
            NewItem::new("q", "explode", HandlerKind::NonTransactional)
                .retry(RetryPolicy::disabled()),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.done);
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[tokio::test]
async fn panicking_transactional_handler_rolls_back_and_reaches_callback() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let seen = Arc::new(Mutex::new(Vec::<Completion>::new()));
    let sink = Arc::clone(&seen);
    let registry = HandlerRegistry::new()
        .transactional("explode", move |ctx, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            ctx.enqueue(NewItem::new("side", "explode", HandlerKind::Transactional))?;
            panic!("bad state")
        })
        .on_complete("record", move |_, completion| {
            sink.lock().unwrap().push(completion.clone());
            Ok(())
        });
    let h = harness(registry, 60_000);
    h.engine
        .enqueue(
            NewItem::new("q", "explode", HandlerKind::Transactional)
                .retry(RetryPolicy::disabled())
                .on_complete("record", None),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.done);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.engine.get_item(id).unwrap().is_none());
    // The handler's own writes were rolled back with it.
    assert_eq!(h.engine.get_queue_stats("side").unwrap().item_count, 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, CompletionStatus::Failure);
    let result = seen[0].result.as_ref().expect("failure result");
    assert_eq!(result["message"], json!("handler panicked"));
    assert_eq!(result["cause"], json!("bad state"));
}

#[tokio::test]
async fn panicking_transactional_handler_uses_retry_budget() {
    let registry = HandlerRegistry::new().transactional("explode", |_, _| panic!("bad state"));
    let h = harness(registry, 60_000);
    h.engine
        .enqueue(
            NewItem::new("q", "explode", HandlerKind::Transactional).retry(RetryPolicy::with_behavior(
                RetryBehavior {
                    max_attempts: 3,
                    initial_backoff_ms: 100,
                    base: 2.0,
                },
            )),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.retried_work);
    let item = h.engine.get_item(id).unwrap().unwrap();
    assert_eq!(item.phase, Phase::Run);
    assert_eq!(item.error_count, 1);
    assert!(item.lease.is_none());
    assert_eq!(item.vesting_time, START + 100);
}

#[tokio::test]
async fn panicking_completion_callback_drops_the_item() {
    let registry = HandlerRegistry::new()
        .transactional("ok", |_, payload| Ok(payload.clone()))
        .on_complete("explode", |_, _| panic!("callback bug"));
    let h = harness(registry, 60_000);
    h.engine
        .enqueue(
            NewItem::new("q", "ok", HandlerKind::Transactional).on_complete("explode", None),
        )
        .unwrap();
    let (id, lease) = claim(&h, 60_000);

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.done);
    assert!(!outcome.retried_on_complete);
    assert!(h.engine.get_item(id).unwrap().is_none());
    assert_eq!(h.engine.get_queue_stats("q").unwrap().item_count, 0);
}
