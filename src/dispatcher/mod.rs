//! # Rate-Limited Dispatcher
//!
//! One priority queue and one worker per external system. The worker takes the queue
//! head, asks the [`RateBudget`] for permission, counts the call in the shared windows,
//! executes it and then waits out the system's minimum spacing. Failed calls are
//! retried on a timer under the configured policy; terminal failures are handed to the
//! recovery engine.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use metrics::{counter, gauge, histogram};
use tokio::sync::{Notify, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::IntegrationError;
use crate::recovery::{FailureReport, RecoveryEngine};
use crate::systems::{ExternalSystemType, RateLimit};
use crate::webhooks::SubscriptionCache;

mod queue;
pub mod rate_budget;
pub mod retry;

use queue::{ActionJob, CallQueue, QueuedCall};
pub use rate_budget::{Permit, RateBudget, RateMetrics};
pub use retry::{retry_delay, should_retry};

struct Lane {
    system: ExternalSystemType,
    limit: RateLimit,
    queue: Mutex<CallQueue>,
    notify: Notify,
}

impl Lane {
    fn queue(&self) -> MutexGuard<'_, CallQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Id and tenant of the next call, unless the lane is paused or empty.
    fn head(&self) -> Option<(Uuid, Option<Uuid>)> {
        let queue = self.queue();
        if queue.paused {
            return None;
        }
        queue.peek().map(|call| (call.id, call.tenant_id))
    }

    /// Pops the head only if it is still `id`; a higher-priority arrival wins otherwise.
    fn pop_if(&self, id: Uuid) -> Option<QueuedCall> {
        let mut queue = self.queue();
        if queue.paused || queue.peek().map(|call| call.id) != Some(id) {
            return None;
        }
        let call = queue.pop();
        self.report_depth(queue.len());
        call
    }

    fn push(&self, call: QueuedCall) -> Result<(), QueuedCall> {
        let depth = {
            let mut queue = self.queue();
            queue.push(call)?;
            queue.len()
        };
        self.report_depth(depth);
        self.notify.notify_one();
        Ok(())
    }

    fn report_depth(&self, depth: usize) {
        gauge!("gateway_queue_depth", "system" => self.system.as_str()).set(depth as f64);
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    rate_limits: BTreeMap<ExternalSystemType, RateLimit>,
    budget: RateBudget,
    subscriptions: SubscriptionCache,
    recovery: RecoveryEngine,
    lanes: Mutex<HashMap<ExternalSystemType, Arc<Lane>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        rate_limits: BTreeMap<ExternalSystemType, RateLimit>,
        budget: RateBudget,
        subscriptions: SubscriptionCache,
        recovery: RecoveryEngine,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                rate_limits,
                budget,
                subscriptions,
                recovery,
                lanes: Mutex::new(HashMap::new()),
                workers: Mutex::new(Vec::new()),
                seq: AtomicU64::new(0),
                shutdown,
            }),
        }
    }

    pub fn rate_limit(&self, system: ExternalSystemType) -> RateLimit {
        self.inner
            .rate_limits
            .get(&system)
            .copied()
            .unwrap_or_else(|| system.default_rate_limit())
    }

    /// Runs `action` against `system` under its rate budget and retry policy, resolving
    /// with the action's value or the final classified error.
    ///
    /// Higher `priority` values run first; equal priorities run in arrival order.
    /// Calls for a pair whose subscription is inactive are rejected with
    /// `INTEGRATION_DISABLED` without being queued.
    pub async fn dispatch<T, F, Fut>(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        priority: i32,
        action: F,
    ) -> Result<T, IntegrationError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, IntegrationError>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(IntegrationError::queue_unavailable());
        }

        if let Some(tenant_id) = tenant_id {
            match self.inner.subscriptions.get(tenant_id, system).await {
                Ok(Some(subscription)) if !subscription.active => {
                    counter!("gateway_dispatch_total", "system" => system.as_str(), "outcome" => "rejected")
                        .increment(1);
                    return Err(IntegrationError::integration_disabled(tenant_id, system));
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(system = %system, error = %err, "Subscription check failed, dispatching anyway");
                }
            }
        }

        self.submit(system, tenant_id, priority, action).await
    }

    /// Queues a call without consulting the pair's subscription; onboarding uses this
    /// to reach a system before any subscription exists or while one is disabled.
    pub(crate) async fn submit<T, F, Fut>(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        priority: i32,
        action: F,
    ) -> Result<T, IntegrationError>
    where
        T: Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, IntegrationError>> + Send + 'static,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(IntegrationError::queue_unavailable());
        }

        let (reply, resolved) = oneshot::channel();
        let seq = self.inner.seq.fetch_add(1, Ordering::Relaxed);
        let call = QueuedCall::new(
            seq,
            priority,
            tenant_id,
            Box::new(ActionJob::new(action, reply)),
        );
        debug!(call_id = %call.id, system = %system, priority, "Call enqueued");

        if let Err(call) = self.lane(system).push(call) {
            call.job.fail(IntegrationError::queue_unavailable());
        }
        resolved
            .await
            .unwrap_or_else(|_| Err(IntegrationError::queue_unavailable()))
    }

    /// Returns the lane for `system`, spawning its worker on first use.
    fn lane(&self, system: ExternalSystemType) -> Arc<Lane> {
        let mut lanes = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(lane) = lanes.get(&system) {
            return lane.clone();
        }

        let lane = Arc::new(Lane {
            system,
            limit: self.rate_limit(system),
            queue: Mutex::new(CallQueue::default()),
            notify: Notify::new(),
        });
        lanes.insert(system, lane.clone());
        drop(lanes);

        let handle = tokio::spawn(self.clone().work(lane.clone()));
        self.inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
        lane
    }

    fn existing_lane(&self, system: ExternalSystemType) -> Option<Arc<Lane>> {
        self.inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&system)
            .cloned()
    }

    async fn work(self, lane: Arc<Lane>) {
        let inner = &self.inner;
        let system = lane.system;
        let limit = lane.limit;
        let spacing = limit.min_spacing();
        let idle = inner.config.idle_poll_interval();
        let max_wait = inner.config.max_permission_wait();
        info!(system = %system, rps = limit.requests_per_second, "Dispatcher worker started");

        loop {
            if inner.shutdown.is_cancelled() {
                break;
            }
            let Some((call_id, tenant_id)) = lane.head() else {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = lane.notify.notified() => {}
                    _ = sleep(idle) => {}
                }
                continue;
            };

            if let Permit::Wait(wait) = inner.budget.check(system, tenant_id, &limit).await {
                let wait = wait.min(max_wait);
                histogram!("gateway_rate_limit_wait_ms", "system" => system.as_str())
                    .record(wait.as_millis() as f64);
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = sleep(wait) => {}
                }
                continue;
            }

            let Some(call) = lane.pop_if(call_id) else {
                continue;
            };
            inner.budget.record_request(system, tenant_id, &limit).await;
            let started = Instant::now();
            self.execute(&lane, call).await;

            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = sleep_until(started + spacing) => {}
            }
        }

        let abandoned = lane.queue().close();
        lane.report_depth(0);
        if !abandoned.is_empty() {
            info!(system = %system, abandoned = abandoned.len(), "Resolving queued calls on shutdown");
        }
        for call in abandoned {
            call.job.fail(IntegrationError::queue_unavailable());
        }
        info!(system = %system, "Dispatcher worker stopped");
    }

    async fn execute(&self, lane: &Arc<Lane>, mut call: QueuedCall) {
        let inner = &self.inner;
        let system = lane.system;
        call.attempts += 1;

        let err = match call.job.attempt().await {
            Ok(()) => {
                inner.budget.record_success(system, call.tenant_id).await;
                inner.recovery.record_success(call.tenant_id, system).await;
                counter!("gateway_dispatch_total", "system" => system.as_str(), "outcome" => "success")
                    .increment(1);
                debug!(call_id = %call.id, attempts = call.attempts, "Call succeeded");
                return;
            }
            Err(err) => err,
        };

        inner.budget.record_error(system, call.tenant_id, &err).await;
        let policy = &inner.config.retry;
        if should_retry(&err, call.attempts, policy.max_attempts) {
            let delay = retry_delay(policy, call.attempts - 1, err.retry_after);
            counter!("gateway_dispatch_retries_total", "system" => system.as_str()).increment(1);
            warn!(
                call_id = %call.id,
                system = %system,
                attempts = call.attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Call failed, retrying"
            );
            self.schedule_retry(lane.clone(), call, delay);
            return;
        }

        counter!("gateway_dispatch_total", "system" => system.as_str(), "outcome" => "failure")
            .increment(1);
        warn!(
            call_id = %call.id,
            system = %system,
            attempts = call.attempts,
            code = %err.code,
            "Call failed"
        );
        call.job.fail(err.clone());
        inner
            .recovery
            .handle_failure(FailureReport::dispatch(system, call.tenant_id, err))
            .await;
    }

    fn schedule_retry(&self, lane: Arc<Lane>, call: QueuedCall, delay: std::time::Duration) {
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    call.job.fail(IntegrationError::queue_unavailable());
                }
                _ = sleep(delay) => {
                    if let Err(call) = lane.push(call) {
                        call.job.fail(IntegrationError::queue_unavailable());
                    }
                }
            }
        });
    }

    /// Stops dispatching for `system`; queued calls stay queued.
    pub fn pause(&self, system: ExternalSystemType) {
        self.lane(system).queue().paused = true;
        info!(system = %system, "Dispatch queue paused");
    }

    pub fn resume(&self, system: ExternalSystemType) {
        let lane = self.lane(system);
        lane.queue().paused = false;
        lane.notify.notify_one();
        info!(system = %system, "Dispatch queue resumed");
    }

    pub fn is_paused(&self, system: ExternalSystemType) -> bool {
        self.existing_lane(system)
            .is_some_and(|lane| lane.queue().paused)
    }

    pub fn queue_depth(&self, system: ExternalSystemType) -> usize {
        self.existing_lane(system)
            .map_or(0, |lane| lane.queue().len())
    }

    pub fn queue_depths(&self) -> BTreeMap<ExternalSystemType, usize> {
        let lanes: Vec<_> = self
            .inner
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        lanes
            .into_iter()
            .map(|lane| (lane.system, lane.queue().len()))
            .collect()
    }

    pub async fn rate_metrics(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
    ) -> Result<RateMetrics, IntegrationError> {
        let limit = self.rate_limit(system);
        Ok(self.inner.budget.metrics(system, tenant_id, &limit).await?)
    }

    /// Cancels every worker and waits for them to resolve their queued calls.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let workers: Vec<_> = self
            .inner
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "Dispatcher worker ended abnormally");
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("queue_depths", &self.queue_depths())
            .finish_non_exhaustive()
    }
}
