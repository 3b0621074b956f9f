//! Worker dispatch and the per-item completion/retry state machine.
//!
//! ```text
//! run ──success──────────────────────────► on_complete(success)
//! run ──failure, retries left────────────► run (backoff)
//! run ──failure, no retries left─────────► on_complete(failure)
//! on_complete ──callback ok──────────────► deleted
//! on_complete ──timeout, retries left────► on_complete (backoff)
//! on_complete ──any other error──────────► deleted
//! ```
//!
//! The on_complete phase is written before the callback runs, so a worker
//! that dies in between leaves an item the next lease holder resumes at
//! delivery instead of re-running the handler.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::KeyValue;
use tracing::{Instrument, Span, debug, error, info, warn};

use super::Engine;
use super::lease;
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::handler::{ActionFn, Completion, Handler, HandlerError, TransactionalFn};
use crate::model::*;
use crate::storage::TxContext;
use crate::telemetry::item::{record_phase_transition, start_item_span};
use crate::telemetry::metrics;

/// How many times a completion callback failing with a timeout is retried.
const ON_COMPLETE_TIMEOUT_RETRY_LIMIT: u32 = 2;

/// What a committed state-machine transition leaves for the worker to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    /// The lease was lost; nothing was written.
    Stale,
    RetriedWork,
    /// The outcome is persisted and a callback is waiting.
    Deliver,
    /// The item reached its end and was deleted.
    Done,
}

impl TxContext<'_> {
    fn apply_outcome(&mut self, mut item: QueueItem, lease_id: LeaseId, outcome: WorkOutcome) -> Result<Step> {
        if !item.holds_lease(lease_id) {
            lease::record_conflict("item", "finalize");
            return Ok(Step::Stale);
        }
        match outcome {
            WorkOutcome::Success(result) => {
                self.enter_on_complete(item, CompletionStatus::Success, Some(result))
            }
            WorkOutcome::Failure(failure) => {
                item.error_count = item.error_count.saturating_add(1);
                if item.retry_enabled && item.retry_behavior.allows_retry(item.error_count) {
                    let delay_ms = item.retry_behavior.delay_ms(item.error_count);
                    let vesting_time = self.now().saturating_add(delay_ms);
                    info!(
                        item_id = %item.id,
                        attempt = item.error_count,
                        delay_ms,
                        "handler failed, retrying"
                    );
                    if !self.requeue(item, lease_id, vesting_time)? {
                        return Ok(Step::Stale);
                    }
                    Ok(Step::RetriedWork)
                } else {
                    self.enter_on_complete(item, CompletionStatus::Failure, Some(failure))
                }
            }
        }
    }

    fn enter_on_complete(
        &mut self,
        mut item: QueueItem,
        status: CompletionStatus,
        result: Option<serde_json::Value>,
    ) -> Result<Step> {
        item.phase = Phase::OnComplete;
        item.completion_status = Some(status);
        item.completion_result = result;

        if item.on_complete.is_none() {
            self.delete_item(item.id)?;
            self.settle_queue(&item.queue_id)?;
            record_phase_transition(&Span::current(), "run", "deleted");
            return Ok(Step::Done);
        }
        self.update_item(&item)?;
        record_phase_transition(&Span::current(), "run", "on_complete");
        Ok(Step::Deliver)
    }
}

impl Engine {
    pub(crate) fn spawn_worker(&self, item_id: ItemId, lease_id: LeaseId) {
        let engine = self.clone();
        self.scheduler().schedule(
            Duration::ZERO,
            "worker",
            Box::pin(async move {
                if let Err(e) = engine.dispatch_worker(item_id, lease_id).await {
                    warn!(%item_id, error = %e, "worker failed");
                }
            }),
        );
    }

    /// Execute a leased item: its handler if it is still in the run phase,
    /// otherwise only its completion callback.
    ///
    /// A lease that no longer matches makes this a no-op.
    pub async fn dispatch_worker(&self, item_id: ItemId, lease_id: LeaseId) -> Result<FinalizeOutcome> {
        let loaded = self.transact(|ctx| {
            let item = ctx.get_item(item_id)?.filter(|item| item.holds_lease(lease_id));
            Ok(item.map(|item| (item, ctx.config().clone())))
        })?;
        let Some((item, config)) = loaded else {
            debug!(%item_id, "worker lease stale, skipping");
            return Ok(FinalizeOutcome::default());
        };

        let span = start_item_span(&item.queue_id, &item.id, item.phase);
        self.execute(item, lease_id, config).instrument(span).await
    }

    async fn execute(&self, item: QueueItem, lease_id: LeaseId, config: EngineConfig) -> Result<FinalizeOutcome> {
        if item.phase == Phase::OnComplete {
            debug!("resuming at completion delivery");
            return self.deliver_completion(item.id, lease_id);
        }

        let handler = match self.registry().handler(&item.handler) {
            Some(handler) if handler.kind() == item.handler_kind => handler.clone(),
            Some(handler) => {
                let failure = HandlerError::new(format!(
                    "handler {} is {}, item expects {}",
                    item.handler,
                    handler.kind(),
                    item.handler_kind
                ));
                warn!(error = %failure, "handler kind mismatch");
                return self.finalize_worker(item.id, lease_id, Some(WorkOutcome::Failure(failure.to_value())));
            }
            None => {
                let failure = HandlerError::new(format!("no handler registered as {}", item.handler));
                warn!(error = %failure, "unknown handler");
                return self.finalize_worker(item.id, lease_id, Some(WorkOutcome::Failure(failure.to_value())));
            }
        };

        match handler {
            Handler::Transactional(f) => self.run_transactional(item.id, lease_id, f),
            Handler::NonTransactional(action) => {
                match self.run_with_heartbeat(&item, lease_id, action, &config).await {
                    Some(outcome) => self.finalize_worker(item.id, lease_id, Some(outcome)),
                    None => Ok(FinalizeOutcome::default()),
                }
            }
        }
    }

    /// Run the handler and apply its success in one transaction. A handler
    /// error rolls its writes back and is recorded in a second transaction.
    fn run_transactional(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        f: Arc<TransactionalFn>,
    ) -> Result<FinalizeOutcome> {
        let started = Instant::now();
        let result = self.transact(|ctx| {
            let Some(item) = ctx
                .get_item(item_id)?
                .filter(|item| item.holds_lease(lease_id) && item.phase == Phase::Run)
            else {
                return Ok(Step::Stale);
            };
            let value = catch_panic("handler", || f(&mut *ctx, &item.payload))
                .map_err(Error::Handler)?;
            ctx.apply_outcome(item, lease_id, WorkOutcome::Success(value))
        });

        match result {
            Ok(step) => {
                record_duration(started, HandlerKind::Transactional, "success");
                self.follow(item_id, lease_id, step)
            }
            Err(Error::Handler(failure)) => {
                record_duration(started, HandlerKind::Transactional, "failure");
                warn!(error = %failure, "handler failed");
                self.finalize_worker(item_id, lease_id, Some(WorkOutcome::Failure(failure.to_value())))
            }
            Err(e) => Err(e),
        }
    }

    /// Race the handler against a heartbeat that keeps the item lease alive.
    ///
    /// Returns `None` if the lease was lost; the handler is aborted and its
    /// result, if any, is discarded.
    async fn run_with_heartbeat(
        &self,
        item: &QueueItem,
        lease_id: LeaseId,
        action: Arc<ActionFn>,
        config: &EngineConfig,
    ) -> Option<WorkOutcome> {
        let heartbeat = Duration::from_millis(config.heartbeat_interval_ms().max(1) as u64);
        let started = Instant::now();
        let mut task = tokio::spawn(action(item.payload.clone()));

        loop {
            tokio::select! {
                joined = &mut task => {
                    let (outcome, label) = match joined {
                        Ok(Ok(value)) => (WorkOutcome::Success(value), "success"),
                        Ok(Err(failure)) => {
                            warn!(error = %failure, "handler failed");
                            (WorkOutcome::Failure(failure.to_value()), "failure")
                        }
                        Err(e) => {
                            error!(error = %e, "handler task did not complete");
                            let failure = HandlerError::new("handler task did not complete")
                                .with_cause(e.to_string());
                            (WorkOutcome::Failure(failure.to_value()), "failure")
                        }
                    };
                    record_duration(started, HandlerKind::NonTransactional, label);
                    return Some(outcome);
                }
                _ = tokio::time::sleep(heartbeat) => {
                    match self.extend_item_lease(item.id, lease_id, config.item_lease_ms) {
                        Ok(true) => debug!("item lease extended"),
                        Ok(false) => {
                            warn!("item lease lost, discarding handler result");
                            task.abort();
                            record_duration(started, HandlerKind::NonTransactional, "lease_lost");
                            return None;
                        }
                        Err(e) => warn!(error = %e, "heartbeat failed, will retry"),
                    }
                }
            }
        }
    }

    /// Record the handler's outcome for a leased item and continue to
    /// completion delivery when one is due.
    ///
    /// `None` reports no outcome: an item already in the on_complete phase
    /// proceeds to delivery, one still in the run phase is treated as a
    /// failure. A stale lease makes this a no-op.
    pub fn finalize_worker(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        outcome: Option<WorkOutcome>,
    ) -> Result<FinalizeOutcome> {
        let step = self.transact(|ctx| {
            let Some(item) = ctx.get_item(item_id)? else {
                return Ok(Step::Stale);
            };
            if !item.holds_lease(lease_id) {
                lease::record_conflict("item", "finalize");
                return Ok(Step::Stale);
            }
            match (item.phase, outcome) {
                (Phase::OnComplete, _) => Ok(Step::Deliver),
                (Phase::Run, Some(outcome)) => ctx.apply_outcome(item, lease_id, outcome),
                (Phase::Run, None) => {
                    let failure = HandlerError::new("worker finished without an outcome");
                    ctx.apply_outcome(item, lease_id, WorkOutcome::Failure(failure.to_value()))
                }
            }
        })?;
        self.follow(item_id, lease_id, step)
    }

    fn follow(&self, item_id: ItemId, lease_id: LeaseId, step: Step) -> Result<FinalizeOutcome> {
        match step {
            Step::Stale => Ok(FinalizeOutcome::default()),
            Step::RetriedWork => Ok(FinalizeOutcome {
                retried_work: true,
                ..Default::default()
            }),
            Step::Done => Ok(FinalizeOutcome {
                done: true,
                ..Default::default()
            }),
            Step::Deliver => self.deliver_completion(item_id, lease_id),
        }
    }

    /// Invoke the completion callback and delete the item, atomically.
    fn deliver_completion(&self, item_id: ItemId, lease_id: LeaseId) -> Result<FinalizeOutcome> {
        let delivered = self.transact(|ctx| {
            let Some(item) = ctx
                .get_item(item_id)?
                .filter(|item| item.holds_lease(lease_id) && item.phase == Phase::OnComplete)
            else {
                return Ok(false);
            };

            if let Some(callback_ref) = &item.on_complete {
                let Some(callback) = self.registry().callback(callback_ref) else {
                    return Err(Error::Handler(HandlerError::new(format!(
                        "no completion callback registered as {callback_ref}"
                    ))));
                };
                let completion = Completion {
                    item_id: item.id,
                    queue_id: item.queue_id.clone(),
                    status: item.completion_status.unwrap_or(CompletionStatus::Failure),
                    result: item.completion_result.clone(),
                    context: item.context.clone(),
                };
                catch_panic("completion callback", || callback(&mut *ctx, &completion))
                    .map_err(Error::Handler)?;
            }

            ctx.delete_item(item.id)?;
            ctx.settle_queue(&item.queue_id)?;
            Ok(true)
        });

        match delivered {
            Ok(true) => {
                record_phase_transition(&Span::current(), "on_complete", "deleted");
                record_delivery("delivered");
                Ok(FinalizeOutcome {
                    done: true,
                    ..Default::default()
                })
            }
            Ok(false) => Ok(FinalizeOutcome::default()),
            Err(Error::Handler(failure)) => self.completion_failed(item_id, lease_id, &failure),
            Err(e) => Err(e),
        }
    }

    /// Timeouts are retried a bounded number of times; every other callback
    /// error, and a timeout past the bound, drops the item.
    fn completion_failed(
        &self,
        item_id: ItemId,
        lease_id: LeaseId,
        failure: &HandlerError,
    ) -> Result<FinalizeOutcome> {
        let retried = self.transact(|ctx| {
            let Some(mut item) = ctx
                .get_item(item_id)?
                .filter(|item| item.holds_lease(lease_id) && item.phase == Phase::OnComplete)
            else {
                return Ok(None);
            };

            if failure.is_timeout() && item.on_complete_timeout_retries < ON_COMPLETE_TIMEOUT_RETRY_LIMIT {
                item.on_complete_timeout_retries += 1;
                let delay_ms = item.retry_behavior.delay_ms(item.on_complete_timeout_retries);
                let vesting_time = ctx.now().saturating_add(delay_ms);
                let retries = item.on_complete_timeout_retries;
                if !ctx.requeue(item, lease_id, vesting_time)? {
                    return Ok(None);
                }
                warn!(%item_id, retries, delay_ms, error = %failure, "completion callback timed out, retrying");
                return Ok(Some(true));
            }

            let queue_id = item.queue_id.clone();
            ctx.delete_item(item.id)?;
            ctx.settle_queue(&queue_id)?;
            Ok(Some(false))
        })?;

        match retried {
            Some(true) => {
                record_delivery("timeout_retry");
                Ok(FinalizeOutcome {
                    retried_on_complete: true,
                    ..Default::default()
                })
            }
            Some(false) => {
                error!(%item_id, error = %failure, "completion callback failed, dropping item");
                record_phase_transition(&Span::current(), "on_complete", "deleted");
                record_delivery("dropped");
                Ok(FinalizeOutcome {
                    done: true,
                    ..Default::default()
                })
            }
            None => Ok(FinalizeOutcome::default()),
        }
    }

    /// Cancel an item that is waiting to run.
    ///
    /// Only an unleased item in the run phase can be cancelled; it moves to
    /// on_complete with status `cancelled`, so its callback still fires once.
    /// Returns `false` for an in-flight or already-finished item.
    pub fn cancel(&self, item_id: ItemId) -> Result<bool> {
        self.transact(|ctx| {
            let Some(mut item) = ctx.get_item(item_id)? else {
                return Err(Error::NotFound(format!("queue item {item_id}")));
            };
            let now = ctx.now();
            if item.phase != Phase::Run || item.is_leased(now) {
                return Ok(false);
            }

            item.phase = Phase::OnComplete;
            item.completion_status = Some(CompletionStatus::Cancelled);
            item.completion_result = None;
            item.lease = None;
            item.vesting_time = now;

            if item.on_complete.is_some() {
                ctx.update_item(&item)?;
                ctx.note_ready(&item.queue_id, now, None)?;
            } else {
                ctx.delete_item(item.id)?;
                ctx.settle_queue(&item.queue_id)?;
            }
            info!(%item_id, queue = %item.queue_id, "item cancelled");
            Ok(true)
        })
    }
}

/// Run user code inside a transaction, turning a panic into a handler
/// failure so the transaction rolls back and the failure path applies.
fn catch_panic<T>(
    what: &str,
    f: impl FnOnce() -> std::result::Result<T, HandlerError>,
) -> std::result::Result<T, HandlerError> {
    std::panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(what, panic = %message, "user code panicked");
        Err(HandlerError::new(format!("{what} panicked")).with_cause(message))
    })
}

fn record_duration(started: Instant, kind: HandlerKind, outcome: &'static str) {
    metrics::handler_duration_ms().record(
        started.elapsed().as_secs_f64() * 1000.0,
        &[
            KeyValue::new("kind", kind.as_str()),
            KeyValue::new("outcome", outcome),
        ],
    );
}

fn record_delivery(result: &'static str) {
    metrics::completion_deliveries().add(1, &[KeyValue::new("result", result)]);
}
