//! Integration tests for enqueue, dequeue, leasing and the completion/retry
//! state machine.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use workpool::clock::{Clock, ManualClock};
use workpool::config::ConfigOverride;
use workpool::handler::{Completion, HandlerError, HandlerRegistry};
use workpool::model::*;
use workpool::retry::{RetryBehavior, RetryPolicy};
use workpool::scheduler::ManualScheduler;
use workpool::storage::Storage;
use workpool::{Engine, Error};

const START: i64 = 1_700_000_000_000;

struct Harness {
    engine: Engine,
    clock: Arc<ManualClock>,
}

fn harness(registry: HandlerRegistry) -> Harness {
    harness_with(registry, ConfigOverride::default())
}

fn harness_with(registry: HandlerRegistry, overrides: ConfigOverride) -> Harness {
    let clock = Arc::new(ManualClock::from_millis(START));
    // Continuations are collected but never run: these tests drive the
    // engine through its direct operations.
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let engine = Engine::builder(Storage::in_memory().expect("in-memory storage"))
        .registry(registry)
        .clock(clock.clone())
        .scheduler(scheduler)
        .overrides(overrides)
        .build();
    Harness { engine, clock }
}

fn recorder() -> (Arc<Mutex<Vec<Completion>>>, HandlerRegistry) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let registry = HandlerRegistry::new().on_complete("record", move |_, completion| {
        sink.lock().unwrap().push(completion.clone());
        Ok(())
    });
    (seen, registry)
}

fn ids(claimed: &[(QueueItem, LeaseId)]) -> Vec<ItemId> {
    claimed.iter().map(|(item, _)| item.id).collect()
}

fn claim_one(h: &Harness, queue: &str) -> LeaseId {
    let mut claimed = h.engine.dequeue(queue, 1, 1_000, OrderBy::Vesting).unwrap();
    assert_eq!(claimed.len(), 1, "expected a ready item in {queue}");
    claimed.remove(0).1
}

// ---------------------------------------------------------------------------
// Lease fencing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_lease_token_leaves_rows_unchanged() {
    let h = harness(HandlerRegistry::new().transactional("work", |_, _| Ok(json!("ok"))));
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    let lease = claim_one(&h, "q");

    let before = h.engine.get_item(id).unwrap();
    let pointer_before = h.engine.get_pointer("q").unwrap();
    let stale = LeaseId::new();

    assert!(!h.engine.extend_item_lease(id, stale, 5_000).unwrap());
    assert_eq!(
        h.engine
            .finalize_worker(id, stale, Some(WorkOutcome::Success(json!(1))))
            .unwrap(),
        FinalizeOutcome::default()
    );
    assert_eq!(
        h.engine.dispatch_worker(id, stale).await.unwrap(),
        FinalizeOutcome::default()
    );
    assert!(!h.engine.release_pointer_lease("q", stale, START).unwrap());

    assert_eq!(h.engine.get_item(id).unwrap(), before);
    assert_eq!(h.engine.get_pointer("q").unwrap(), pointer_before);

    // The real token still works.
    assert!(h.engine.extend_item_lease(id, lease, 5_000).unwrap());
}

#[test]
fn leased_item_cannot_be_obtained_until_expiry() {
    let h = harness(HandlerRegistry::new());
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    let first = h.engine.obtain_item_lease(id, 1_000).unwrap().unwrap();

    assert!(h.engine.obtain_item_lease(id, 1_000).unwrap().is_none());
    let item = h.engine.get_item(id).unwrap().unwrap();
    assert_eq!(item.vesting_time, START + 1_000);

    h.clock.advance_ms(1_000);
    let second = h.engine.obtain_item_lease(id, 1_000).unwrap().unwrap();
    assert_ne!(first, second);
}

// ---------------------------------------------------------------------------
// Ordering
// ---------------------------------------------------------------------------

#[test]
fn fifo_head_blocks_the_queue() {
    let h = harness(HandlerRegistry::new());
    let a = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).order_by(OrderBy::Fifo))
        .unwrap();
    let _b = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).order_by(OrderBy::Fifo))
        .unwrap();

    let first = h.engine.dequeue("q", 10, 1_000, OrderBy::Fifo).unwrap();
    assert_eq!(ids(&first), vec![a]);
    assert!(h.engine.dequeue("q", 1, 1_000, OrderBy::Fifo).unwrap().is_empty());
    assert!(h.engine.dequeue("q", 10, 1_000, OrderBy::Fifo).unwrap().is_empty());

    // Once the head's lease lapses it is handed out again, still ahead of B.
    h.clock.advance_ms(1_000);
    let again = h.engine.dequeue("q", 10, 1_000, OrderBy::Fifo).unwrap();
    assert_eq!(ids(&again), vec![a]);
}

#[test]
fn unready_head_blocks_fifo_but_not_vesting() {
    let h = harness(HandlerRegistry::new());
    h.engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).run_after(500))
        .unwrap();
    let b = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();

    assert!(h.engine.dequeue("q", 10, 1_000, OrderBy::Fifo).unwrap().is_empty());
    let claimed = h.engine.dequeue("q", 10, 1_000, OrderBy::Vesting).unwrap();
    assert_eq!(ids(&claimed), vec![b]);
}

#[test]
fn vesting_order_skips_leased_items() {
    let h = harness(HandlerRegistry::new());
    let a = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    let b = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();

    assert_eq!(ids(&h.engine.dequeue("q", 1, 1_000, OrderBy::Vesting).unwrap()), vec![a]);
    assert_eq!(ids(&h.engine.dequeue("q", 1, 1_000, OrderBy::Vesting).unwrap()), vec![b]);
}

#[test]
fn failed_item_does_not_block_vesting_queue() {
    let h = harness(HandlerRegistry::new());
    let a = h
        .engine
        .enqueue(
            NewItem::new("q", "fails", HandlerKind::Transactional).retry(RetryPolicy::disabled()),
        )
        .unwrap();
    let b = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();

    let lease = claim_one(&h, "q");
    let outcome = h
        .engine
        .finalize_worker(a, lease, Some(WorkOutcome::Failure(json!("boom"))))
        .unwrap();
    assert!(outcome.done);

    let next = h.engine.dequeue("q", 1, 1_000, OrderBy::Vesting).unwrap();
    assert_eq!(ids(&next), vec![b]);
}

#[test]
fn dequeue_scan_is_bounded() {
    let overrides = ConfigOverride {
        max_scan_rows: Some(3),
        ..Default::default()
    };
    let h = harness_with(HandlerRegistry::new(), overrides);
    for _ in 0..6 {
        h.engine
            .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
            .unwrap();
    }
    // Only `max_scan_rows` rows are examined per call, so a larger request
    // comes back short instead of failing.
    assert_eq!(h.engine.dequeue("q", 5, 1_000, OrderBy::Vesting).unwrap().len(), 3);
    assert_eq!(h.engine.dequeue("q", 5, 1_000, OrderBy::Vesting).unwrap().len(), 3);
    assert!(h.engine.dequeue("q", 5, 1_000, OrderBy::Vesting).unwrap().is_empty());
}

// ---------------------------------------------------------------------------
// Retry and backoff
// ---------------------------------------------------------------------------

#[test]
fn retry_backoff_doubles_then_gives_up() {
    let (seen, registry) = recorder();
    let h = harness(registry);
    let behavior = RetryBehavior {
        max_attempts: 5,
        initial_backoff_ms: 250,
        base: 2.0,
    };
    let id = h
        .engine
        .enqueue(
            NewItem::new("q", "fails", HandlerKind::Transactional)
                .retry(RetryPolicy::with_behavior(behavior))
                .on_complete("record", None),
        )
        .unwrap();

    for (attempt, expected_delay) in [250, 500, 1_000, 2_000].into_iter().enumerate() {
        let lease = claim_one(&h, "q");
        let outcome = h
            .engine
            .finalize_worker(id, lease, Some(WorkOutcome::Failure(json!("boom"))))
            .unwrap();
        assert!(outcome.retried_work);

        let item = h.engine.get_item(id).unwrap().unwrap();
        assert_eq!(item.error_count, attempt as u32 + 1);
        assert_eq!(item.vesting_time - h.clock.now_ms(), expected_delay);
        assert!(item.lease.is_none());
        assert_eq!(item.phase, Phase::Run);
        assert!(h.engine.dequeue("q", 1, 1_000, OrderBy::Vesting).unwrap().is_empty());

        h.clock.advance_ms(expected_delay);
    }

    let lease = claim_one(&h, "q");
    let outcome = h
        .engine
        .finalize_worker(id, lease, Some(WorkOutcome::Failure(json!("boom"))))
        .unwrap();
    assert_eq!(
        outcome,
        FinalizeOutcome {
            done: true,
            ..Default::default()
        }
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, CompletionStatus::Failure);
    assert_eq!(seen[0].result, Some(json!("boom")));
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[test]
fn retry_pointer_tracks_backoff() {
    let h = harness(HandlerRegistry::new());
    let id = h
        .engine
        .enqueue(NewItem::new("q", "fails", HandlerKind::Transactional).retry(RetryPolicy::enabled()))
        .unwrap();
    let lease = claim_one(&h, "q");

    // Push the pointer out as a manager would after dispatching.
    h.engine
        .transact(|ctx| {
            let lease = ctx.obtain_pointer_lease("q", 10_000)?.expect("pointer free");
            ctx.release_pointer_lease("q", lease, START + 60_000)
        })
        .unwrap();

    h.engine
        .finalize_worker(id, lease, Some(WorkOutcome::Failure(json!("boom"))))
        .unwrap();
    let pointer = h.engine.get_pointer("q").unwrap().unwrap();
    assert_eq!(pointer.vesting_time, START + 250);
}

#[test]
fn engine_default_enables_retry() {
    let overrides = ConfigOverride {
        retry_by_default: Some(true),
        default_retry: Some(RetryBehavior {
            max_attempts: 2,
            initial_backoff_ms: 100,
            base: 3.0,
        }),
        ..Default::default()
    };
    let h = harness_with(HandlerRegistry::new(), overrides);
    let id = h
        .engine
        .enqueue(NewItem::new("q", "fails", HandlerKind::Transactional))
        .unwrap();

    let item = h.engine.get_item(id).unwrap().unwrap();
    assert!(item.retry_enabled);
    assert_eq!(item.retry_behavior.max_attempts, 2);

    let lease = claim_one(&h, "q");
    let first = h
        .engine
        .finalize_worker(id, lease, Some(WorkOutcome::Failure(json!("x"))))
        .unwrap();
    assert!(first.retried_work);

    h.clock.advance_ms(100);
    let lease = claim_one(&h, "q");
    let second = h
        .engine
        .finalize_worker(id, lease, Some(WorkOutcome::Failure(json!("x"))))
        .unwrap();
    assert!(second.done);
}

// ---------------------------------------------------------------------------
// Completion delivery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn crash_after_phase_write_resumes_at_completion() {
    let runs = Arc::new(AtomicUsize::new(0));
    let (seen, registry) = recorder();
    let counter = Arc::clone(&runs);
    let registry = registry.transactional("work", move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(json!("ran"))
    });
    let h = harness(registry);
    let id = h
        .engine
        .enqueue(
            NewItem::new("q", "work", HandlerKind::Transactional)
                .on_complete("record", Some(json!({ "caller": "test" }))),
        )
        .unwrap();
    let lease = claim_one(&h, "q");

    // The outcome was persisted but the worker died before delivering it.
    h.engine
        .transact(|ctx| {
            ctx.connection().execute(
                "UPDATE queue_items
                 SET phase = 'on_complete', completion_status = 'success', completion_result = '\"saved\"'
                 WHERE id = ?1",
                [id.to_string()],
            )?;
            Ok(())
        })
        .unwrap();

    let outcome = h.engine.dispatch_worker(id, lease).await.unwrap();
    assert!(outcome.done);
    assert_eq!(runs.load(Ordering::SeqCst), 0);

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, CompletionStatus::Success);
    assert_eq!(seen[0].result, Some(json!("saved")));
    assert_eq!(seen[0].context, Some(json!({ "caller": "test" })));
    assert!(h.engine.get_item(id).unwrap().is_none());
}

fn flaky_callback(failures: usize, message: &'static str) -> (Arc<AtomicUsize>, HandlerRegistry) {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let registry = HandlerRegistry::new()
        .transactional("work", |_, _| Ok(json!(null)))
        .on_complete("flaky", move |_, _| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            if call < failures {
                Err(HandlerError::new(message))
            } else {
                Ok(())
            }
        });
    (calls, registry)
}

async fn dispatch_next(h: &Harness) -> FinalizeOutcome {
    let mut claimed = h.engine.dequeue("q", 1, 1_000, OrderBy::Vesting).unwrap();
    let (item, lease) = claimed.pop().expect("an item should be ready");
    h.engine.dispatch_worker(item.id, lease).await.unwrap()
}

#[tokio::test]
async fn completion_timeout_is_retried_then_delivered() {
    let (calls, registry) = flaky_callback(2, "upstream request timed out");
    let h = harness(registry);
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).on_complete("flaky", None))
        .unwrap();

    for (retries, delay) in [(1, 250), (2, 500)] {
        let outcome = dispatch_next(&h).await;
        assert!(outcome.retried_on_complete);

        let item = h.engine.get_item(id).unwrap().unwrap();
        assert_eq!(item.phase, Phase::OnComplete);
        assert_eq!(item.on_complete_timeout_retries, retries);
        assert_eq!(item.vesting_time, h.clock.now_ms() + delay);
        h.clock.advance_ms(delay);
    }

    let outcome = dispatch_next(&h).await;
    assert!(outcome.done);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[tokio::test]
async fn completion_timeouts_are_bounded() {
    let (calls, registry) = flaky_callback(usize::MAX, "Timeout");
    let h = harness(registry);
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).on_complete("flaky", None))
        .unwrap();

    assert!(dispatch_next(&h).await.retried_on_complete);
    h.clock.advance_ms(250);
    assert!(dispatch_next(&h).await.retried_on_complete);
    h.clock.advance_ms(500);
    assert!(dispatch_next(&h).await.done);

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[tokio::test]
async fn non_timeout_completion_error_drops_item() {
    let (calls, registry) = flaky_callback(usize::MAX, "validation failed");
    let h = harness(registry);
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).on_complete("flaky", None))
        .unwrap();

    let outcome = dispatch_next(&h).await;
    assert!(outcome.done);
    assert!(!outcome.retried_on_complete);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(h.engine.get_item(id).unwrap().is_none());
}

#[tokio::test]
async fn missing_handler_is_a_failure_not_an_error() {
    let (seen, registry) = recorder();
    let h = harness(registry);
    h.engine
        .enqueue(NewItem::new("q", "nobody", HandlerKind::NonTransactional).on_complete("record", None))
        .unwrap();

    let outcome = dispatch_next(&h).await;
    assert!(outcome.done);

    let seen = seen.lock().unwrap();
    assert_eq!(seen[0].status, CompletionStatus::Failure);
    let message = seen[0].result.as_ref().unwrap()["message"].as_str().unwrap().to_string();
    assert!(message.contains("no handler registered"), "{message}");
}

#[tokio::test]
async fn handler_kind_mismatch_is_a_failure() {
    let (seen, registry) = recorder();
    let registry = registry.transactional("work", |_, _| Ok(json!(null)));
    let h = harness(registry);
    h.engine
        .enqueue(NewItem::new("q", "work", HandlerKind::NonTransactional).on_complete("record", None))
        .unwrap();

    assert!(dispatch_next(&h).await.done);
    assert_eq!(seen.lock().unwrap()[0].status, CompletionStatus::Failure);
}

// ---------------------------------------------------------------------------
// Transactional handlers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn transactional_handler_enqueues_atomically() {
    let registry = HandlerRegistry::new()
        .transactional("fanout", |ctx, payload| {
            ctx.enqueue(
                NewItem::new("children", "child", HandlerKind::Transactional).payload(payload.clone()),
            )?;
            Ok(json!("spawned"))
        })
        .transactional("fanout_then_fail", |ctx, payload| {
            ctx.enqueue(
                NewItem::new("orphans", "child", HandlerKind::Transactional).payload(payload.clone()),
            )?;
            Err(HandlerError::new("changed my mind"))
        });
    let h = harness(registry);

    h.engine
        .enqueue(NewItem::new("q", "fanout", HandlerKind::Transactional).payload(json!(7)))
        .unwrap();
    assert!(dispatch_next(&h).await.done);
    assert_eq!(h.engine.get_queue_stats("children").unwrap().item_count, 1);
    assert!(h.engine.get_pointer("children").unwrap().is_some());

    h.engine
        .enqueue(
            NewItem::new("q", "fanout_then_fail", HandlerKind::Transactional)
                .retry(RetryPolicy::disabled()),
        )
        .unwrap();
    assert!(dispatch_next(&h).await.done);
    assert_eq!(h.engine.get_queue_stats("orphans").unwrap().item_count, 0);
    assert!(h.engine.get_pointer("orphans").unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Enqueue
// ---------------------------------------------------------------------------

#[test]
fn delay_and_instant_together_are_rejected() {
    let h = harness(HandlerRegistry::new());
    let result = h.engine.enqueue(
        NewItem::new("q", "work", HandlerKind::Transactional)
            .run_after(10)
            .run_at(START + 10),
    );
    assert!(matches!(result, Err(Error::InvalidSchedule(_))));
    assert_eq!(h.engine.get_queue_stats("q").unwrap().item_count, 0);
    assert!(h.engine.get_pointer("q").unwrap().is_none());
}

#[test]
fn pointer_only_moves_earlier() {
    let h = harness(HandlerRegistry::new());
    let at = |ms: i64| NewItem::new("q", "work", HandlerKind::Transactional).run_at(START + ms);

    h.engine.enqueue(at(10_000)).unwrap();
    assert_eq!(h.engine.get_pointer("q").unwrap().unwrap().vesting_time, START + 10_000);

    h.engine.enqueue(at(5_000)).unwrap();
    assert_eq!(h.engine.get_pointer("q").unwrap().unwrap().vesting_time, START + 5_000);

    h.engine.enqueue(at(8_000)).unwrap();
    assert_eq!(h.engine.get_pointer("q").unwrap().unwrap().vesting_time, START + 5_000);
}

#[test]
fn leased_pointer_is_left_to_its_manager() {
    let h = harness(HandlerRegistry::new());
    h.engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional).run_after(10_000))
        .unwrap();
    let lease = h
        .engine
        .transact(|ctx| ctx.obtain_pointer_lease("q", 30_000))
        .unwrap()
        .unwrap();

    h.engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    let pointer = h.engine.get_pointer("q").unwrap().unwrap();
    assert_eq!(pointer.vesting_time, START + 30_000);
    assert_eq!(pointer.lease.map(|l| l.id), Some(lease));
}

#[test]
fn batch_enqueue_coalesces_pointers() {
    let h = harness(HandlerRegistry::new());
    let ids = h
        .engine
        .enqueue_batch(vec![
            NewItem::new("a", "work", HandlerKind::Transactional).run_after(300),
            NewItem::new("a", "work", HandlerKind::Transactional).run_after(100),
            NewItem::new("b", "work", HandlerKind::Transactional)
                .run_after(200)
                .order_by(OrderBy::Fifo),
        ])
        .unwrap();
    assert_eq!(ids.len(), 3);

    let a = h.engine.get_pointer("a").unwrap().unwrap();
    let b = h.engine.get_pointer("b").unwrap().unwrap();
    assert_eq!(a.vesting_time, START + 100);
    assert_eq!(b.vesting_time, START + 200);
    assert_eq!(b.order_by, Some(OrderBy::Fifo));
    assert_eq!(h.engine.get_queue_stats("a").unwrap().item_count, 2);
}

#[test]
fn batch_enqueue_is_all_or_nothing() {
    let h = harness(HandlerRegistry::new());
    let result = h.engine.enqueue_batch(vec![
        NewItem::new("a", "work", HandlerKind::Transactional),
        NewItem::new("a", "work", HandlerKind::Transactional)
            .run_after(1)
            .run_at(START),
    ]);
    assert!(matches!(result, Err(Error::InvalidSchedule(_))));
    assert_eq!(h.engine.get_queue_stats("a").unwrap().item_count, 0);
}

#[test]
fn queue_stats_split_leased_and_pending() {
    let h = harness(HandlerRegistry::new());
    for _ in 0..3 {
        h.engine
            .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
            .unwrap();
    }
    claim_one(&h, "q");

    let stats = h.engine.get_queue_stats("q").unwrap();
    assert_eq!(
        stats,
        QueueStats {
            item_count: 3,
            pending_count: 2,
            leased_count: 1,
        }
    );

    // An expired lease counts as pending again.
    h.clock.advance_ms(1_000);
    assert_eq!(h.engine.get_queue_stats("q").unwrap().leased_count, 0);
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancelled_item_reports_through_its_callback() {
    let (seen, registry) = recorder();
    let h = harness(registry);
    let id = h
        .engine
        .enqueue(
            NewItem::new("q", "work", HandlerKind::Transactional)
                .run_after(60_000)
                .on_complete("record", None),
        )
        .unwrap();

    assert!(h.engine.cancel(id).unwrap());
    let item = h.engine.get_item(id).unwrap().unwrap();
    assert_eq!(item.phase, Phase::OnComplete);
    assert_eq!(item.completion_status, Some(CompletionStatus::Cancelled));
    assert_eq!(h.engine.get_pointer("q").unwrap().unwrap().vesting_time, START);

    // A second cancel is refused: the item is no longer waiting to run.
    assert!(!h.engine.cancel(id).unwrap());

    assert!(dispatch_next(&h).await.done);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, CompletionStatus::Cancelled);
}

#[test]
fn in_flight_item_cannot_be_cancelled() {
    let h = harness(HandlerRegistry::new());
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    claim_one(&h, "q");

    assert!(!h.engine.cancel(id).unwrap());
    assert!(matches!(
        h.engine.cancel(ItemId::new()),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn cancel_without_callback_deletes() {
    let h = harness(HandlerRegistry::new());
    let id = h
        .engine
        .enqueue(NewItem::new("q", "work", HandlerKind::Transactional))
        .unwrap();
    assert!(h.engine.cancel(id).unwrap());
    assert!(h.engine.get_item(id).unwrap().is_none());
}
