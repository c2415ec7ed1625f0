//! # Recovery Engine
//!
//! Receives every terminal dispatch and webhook failure, records it, updates pair
//! health, enforces the subscription failure ceiling and schedules bounded remediation.
//! A background loop executes due actions and recomputes health on a fixed cadence.
//!
//! The engine never returns errors to its callers: remediation failures are logged and
//! the action is re-attempted until its own ceiling.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use metrics::{counter, histogram};
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::clock::SharedClock;
use crate::config::RecoveryConfig;
use crate::error::{ErrorCode, IntegrationError};
use crate::events::{EventBus, GatewayEvent};
use crate::repositories::RecordStore;
use crate::store::{MetricsStore, keys};
use crate::systems::ExternalSystemType;
use crate::webhooks::SubscriptionCache;

pub mod action;
pub mod classification;
pub mod health;
pub mod report;

pub use action::{RecoveryAction, RecoveryKind, UnknownRecoveryKind};
pub use classification::{RecoveryPlan, classify, delay_for};
pub use health::{ConnectionStatus, HealthSnapshot, HealthTracker};
pub use report::{ErrorRecord, FailureReport, FailureSource};

const DISABLE_MAX_ATTEMPTS: u32 = 3;

/// Outcome counts of one sweep over due actions.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub due: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub exhausted: u64,
}

#[derive(Clone)]
pub struct RecoveryEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: RecoveryConfig,
    records: Arc<dyn RecordStore>,
    metrics: Arc<dyn MetricsStore>,
    subscriptions: SubscriptionCache,
    adapters: AdapterRegistry,
    events: EventBus,
    health: HealthTracker,
    clock: SharedClock,
    executing: Mutex<HashSet<Uuid>>,
}

impl EngineInner {
    /// Returns false when the action is already executing.
    fn claim(&self, id: Uuid) -> bool {
        match self.executing.lock() {
            Ok(mut executing) => executing.insert(id),
            Err(poisoned) => poisoned.into_inner().insert(id),
        }
    }

    fn release(&self, id: Uuid) {
        match self.executing.lock() {
            Ok(mut executing) => executing.remove(&id),
            Err(poisoned) => poisoned.into_inner().remove(&id),
        };
    }
}

fn after(now: DateTime<Utc>, delay: std::time::Duration) -> DateTime<Utc> {
    now + TimeDelta::from_std(delay).unwrap_or(TimeDelta::zero())
}

fn store_failure(err: anyhow::Error) -> IntegrationError {
    IntegrationError::connection_refused(format!("record store unavailable: {err}"))
}

impl RecoveryEngine {
    pub fn new(
        config: RecoveryConfig,
        records: Arc<dyn RecordStore>,
        metrics: Arc<dyn MetricsStore>,
        subscriptions: SubscriptionCache,
        adapters: AdapterRegistry,
        events: EventBus,
        clock: SharedClock,
    ) -> Self {
        let health = HealthTracker::new(metrics.clone(), clock.clone(), config.health_window());
        Self {
            inner: Arc::new(EngineInner {
                config,
                records,
                metrics,
                subscriptions,
                adapters,
                events,
                health,
                clock,
                executing: Mutex::new(HashSet::new()),
            }),
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.inner.config
    }

    /// Records a terminal failure and decides on remediation.
    #[instrument(skip_all, fields(system = %report.system, tenant_id = ?report.tenant_id, code = %report.error.code))]
    pub async fn handle_failure(&self, report: FailureReport) {
        let inner = &self.inner;
        if matches!(
            report.error.code,
            ErrorCode::IntegrationDisabled | ErrorCode::QueueUnavailable
        ) {
            debug!("Ignoring failure raised by the gateway itself");
            return;
        }
        let now = inner.clock.now();

        let record = ErrorRecord::from_report(&report, now);
        if let Err(err) = inner.records.append_error(&record).await {
            error!(error = %err, "Failed to append integration error");
        }

        let snapshot = inner
            .health
            .record(report.tenant_id, report.system, Err(&report.error))
            .await;
        inner.events.publish(GatewayEvent::HealthUpdated {
            tenant_id: report.tenant_id,
            system: report.system,
            snapshot,
        });

        if let Some(tenant_id) = report.tenant_id {
            self.count_subscription_failure(tenant_id, report.system, &report.error, now)
                .await;
        }

        match classify(&report.error) {
            Some(plan) => {
                self.schedule(report.tenant_id, report.system, plan, report.error.code, now)
                    .await
            }
            None => info!(
                error = %report.error.message,
                "Failure is not recoverable, surfaced only"
            ),
        }
    }

    /// Feeds a successful call into the pair's health window.
    pub async fn record_success(&self, tenant_id: Option<Uuid>, system: ExternalSystemType) {
        self.inner.health.record(tenant_id, system, Ok(())).await;
    }

    pub async fn health_snapshot(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
    ) -> Option<HealthSnapshot> {
        self.inner.health.snapshot(tenant_id, system).await
    }

    async fn count_subscription_failure(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        error: &IntegrationError,
        now: DateTime<Utc>,
    ) {
        let inner = &self.inner;
        let count = match inner
            .records
            .increment_failure_count(tenant_id, system, now)
            .await
        {
            Ok(Some(count)) => count,
            Ok(None) => return,
            Err(err) => {
                error!(error = %err, "Failed to increment subscription failure count");
                return;
            }
        };

        if count >= inner.config.max_subscription_failures {
            let reason = format!(
                "failure count reached {}: {}",
                inner.config.max_subscription_failures, error
            );
            self.disable(tenant_id, system, reason, now).await;
        } else {
            debug!(failure_count = count, "Subscription failure counted");
        }
    }

    /// Deactivates an active subscription and announces it. Returns false when there was
    /// nothing to disable.
    async fn disable(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        reason: String,
        now: DateTime<Utc>,
    ) -> bool {
        let inner = &self.inner;
        let subscription = match inner.records.find_subscription(tenant_id, system).await {
            Ok(Some(subscription)) if subscription.active => subscription,
            Ok(_) => return false,
            Err(err) => {
                error!(error = %err, "Failed to load subscription before disabling");
                return false;
            }
        };

        if let Err(err) = inner
            .records
            .set_subscription_active(tenant_id, system, false, now)
            .await
        {
            error!(error = %err, "Failed to disable integration");
            return false;
        }
        inner.subscriptions.invalidate(tenant_id, system).await;

        warn!(
            tenant_id = %tenant_id,
            system = %system,
            failure_count = subscription.failure_count,
            reason = %reason,
            "Integration disabled"
        );
        counter!("gateway_integrations_disabled_total", "system" => system.as_str()).increment(1);
        inner.events.publish(GatewayEvent::WebhookDisabled {
            tenant_id,
            system,
            reason,
            failure_count: subscription.failure_count,
        });
        true
    }

    async fn schedule(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        plan: RecoveryPlan,
        code: ErrorCode,
        now: DateTime<Utc>,
    ) {
        let inner = &self.inner;
        match inner
            .records
            .find_open_recovery_action(tenant_id, system, plan.kind)
            .await
        {
            Ok(Some(existing)) if existing.is_pending() => {
                if plan.kind == RecoveryKind::Retry {
                    self.record_recurrence(existing, code, now).await;
                } else {
                    debug!(action_id = %existing.id, kind = %plan.kind, "Recovery action already pending");
                }
                return;
            }
            Ok(Some(existing)) => {
                info!(
                    action_id = %existing.id,
                    kind = %plan.kind,
                    attempts = existing.attempts,
                    "Equivalent recovery action exhausted, not rescheduling"
                );
                if plan.kind == RecoveryKind::RefreshToken {
                    self.escalate_to_disable(tenant_id, system, now).await;
                }
                return;
            }
            Ok(None) => {}
            Err(err) => {
                error!(error = %err, "Failed to look up open recovery actions");
                return;
            }
        }
        self.insert_action(tenant_id, system, plan, code, now).await;
    }

    /// A retry marker counts each recurrence of its failure as an attempt, so the
    /// next firing moves along the delay schedule.
    async fn record_recurrence(
        &self,
        mut action: RecoveryAction,
        code: ErrorCode,
        now: DateTime<Utc>,
    ) {
        action.attempts += 1;
        action.error_code = Some(code);
        action.last_error = Some(format!("{code} recurred before retry"));

        let exhausted = action.is_exhausted();
        if exhausted {
            warn!(action_id = %action.id, attempts = action.attempts, "Retry exhausted by recurring failures");
        } else {
            action.scheduled_at = after(now, delay_for(action.kind, action.attempts));
            debug!(
                action_id = %action.id,
                attempts = action.attempts,
                next_attempt_at = %action.scheduled_at,
                "Retry pushed back after recurring failure"
            );
        }

        if let Err(err) = self.inner.records.update_recovery_action(&action).await {
            error!(error = %err, "Failed to persist recovery action recurrence");
            return;
        }
        if exhausted {
            counter!("gateway_recovery_actions_total", "kind" => action.kind.as_str(), "outcome" => "exhausted")
                .increment(1);
            self.inner.events.publish(GatewayEvent::RecoveryFailed(action));
        }
    }

    async fn insert_action(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        plan: RecoveryPlan,
        code: ErrorCode,
        now: DateTime<Utc>,
    ) {
        let action = RecoveryAction::new(
            plan.kind,
            tenant_id,
            system,
            plan.max_attempts,
            after(now, delay_for(plan.kind, 0)),
            now,
        )
        .with_error_code(code);

        match self.inner.records.insert_recovery_action(&action).await {
            Ok(()) => {
                info!(
                    action_id = %action.id,
                    kind = %action.kind,
                    scheduled_at = %action.scheduled_at,
                    "Recovery action scheduled"
                );
                counter!("gateway_recovery_actions_total", "kind" => action.kind.as_str(), "outcome" => "scheduled")
                    .increment(1);
            }
            Err(err) => error!(error = %err, "Failed to persist recovery action"),
        }
    }

    async fn escalate_to_disable(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) {
        if tenant_id.is_none() {
            return;
        }
        let plan = RecoveryPlan {
            kind: RecoveryKind::DisableIntegration,
            max_attempts: DISABLE_MAX_ATTEMPTS,
        };
        match self
            .inner
            .records
            .find_open_recovery_action(tenant_id, system, plan.kind)
            .await
        {
            Ok(Some(existing)) if existing.is_pending() => {}
            Ok(_) => {
                self.insert_action(tenant_id, system, plan, ErrorCode::AuthError, now)
                    .await
            }
            Err(err) => error!(error = %err, "Failed to look up disable actions"),
        }
    }

    /// Background loop: executes due actions every poll interval and recomputes health
    /// on its own cadence, until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Starting recovery engine");
        let mut poll = interval(self.inner.config.poll_interval());
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut health = interval(self.inner.config.health_check_interval());
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Recovery engine shutdown requested");
                    break;
                }
                _ = poll.tick() => {
                    let start = Instant::now();
                    let stats = self.sweep().await;
                    if stats.due > 0 {
                        debug!(?stats, "Recovery sweep finished");
                    }
                    histogram!("gateway_recovery_tick_duration_ms")
                        .record(start.elapsed().as_millis() as f64);
                }
                _ = health.tick() => {
                    self.check_health().await;
                }
            }
        }
        info!("Recovery engine stopped");
    }

    /// Executes every due action now instead of waiting for the next tick.
    pub async fn force_sweep(&self) -> SweepStats {
        info!("Manual recovery sweep requested");
        self.sweep().await
    }

    async fn sweep(&self) -> SweepStats {
        let inner = &self.inner;
        let now = inner.clock.now();
        let due = match inner
            .records
            .due_recovery_actions(now, inner.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(err) => {
                error!(error = %err, "Failed to load due recovery actions");
                return SweepStats::default();
            }
        };

        let mut stats = SweepStats {
            due: due.len() as u64,
            ..SweepStats::default()
        };
        for action in due {
            match self.execute(action).await {
                Some(Execution::Succeeded) => stats.succeeded += 1,
                Some(Execution::Failed) => stats.failed += 1,
                Some(Execution::Exhausted) => {
                    stats.failed += 1;
                    stats.exhausted += 1;
                }
                None => {}
            }
        }
        stats
    }

    async fn check_health(&self) {
        for snapshot in self.inner.health.refresh_all().await {
            self.inner.events.publish(GatewayEvent::HealthUpdated {
                tenant_id: snapshot.tenant_id,
                system: snapshot.system,
                snapshot,
            });
        }
    }

    #[instrument(skip_all, fields(action_id = %action.id, kind = %action.kind, system = %action.system))]
    async fn execute(&self, mut action: RecoveryAction) -> Option<Execution> {
        let inner = &self.inner;
        let now = inner.clock.now();
        if !action.is_due(now) {
            return None;
        }
        if !inner.claim(action.id) {
            debug!("Recovery action already executing");
            return None;
        }
        let releaser = self.inner.clone();
        let id = action.id;
        let _release = scopeguard::guard((), move |_| releaser.release(id));

        let outcome = self.perform(&action).await;
        let now = inner.clock.now();
        action.attempts += 1;
        action.last_attempt_at = Some(now);

        let execution = match outcome {
            Ok(()) => {
                action.success = true;
                action.last_error = None;
                info!(attempts = action.attempts, "Recovery action succeeded");
                Execution::Succeeded
            }
            Err(err) => {
                action.last_error = Some(err.to_string());
                if action.is_exhausted() {
                    warn!(attempts = action.attempts, error = %err, "Recovery action exhausted");
                    Execution::Exhausted
                } else {
                    action.scheduled_at = after(now, delay_for(action.kind, action.attempts));
                    warn!(
                        attempts = action.attempts,
                        next_attempt_at = %action.scheduled_at,
                        error = %err,
                        "Recovery action failed, rescheduled"
                    );
                    Execution::Failed
                }
            }
        };

        if let Err(err) = inner.records.update_recovery_action(&action).await {
            error!(error = %err, "Failed to persist recovery action outcome");
        }
        counter!(
            "gateway_recovery_actions_total",
            "kind" => action.kind.as_str(),
            "outcome" => execution.as_str()
        )
        .increment(1);

        match execution {
            Execution::Succeeded => inner.events.publish(GatewayEvent::RecoverySuccess(action)),
            Execution::Exhausted => {
                let escalate = action.kind == RecoveryKind::RefreshToken;
                let (tenant_id, system) = (action.tenant_id, action.system);
                inner.events.publish(GatewayEvent::RecoveryFailed(action));
                if escalate {
                    self.escalate_to_disable(tenant_id, system, now).await;
                }
            }
            Execution::Failed => {}
        }
        Some(execution)
    }

    async fn perform(&self, action: &RecoveryAction) -> Result<(), IntegrationError> {
        match action.kind {
            RecoveryKind::Retry => Ok(()),
            RecoveryKind::RefreshToken => self.refresh_credentials(action).await,
            RecoveryKind::ResetConnection => self.reset_connection(action).await,
            RecoveryKind::DisableIntegration => {
                let tenant_id = action.tenant_id.ok_or_else(|| {
                    IntegrationError::validation("disabling an integration requires a tenant")
                })?;
                let reason = match action.error_code {
                    Some(code) => format!("recovery exhausted after {code}"),
                    None => "recovery exhausted".to_string(),
                };
                let now = self.inner.clock.now();
                if !self.disable(tenant_id, action.system, reason, now).await {
                    // Already inactive or missing: make sure the cache agrees.
                    self.inner.subscriptions.invalidate(tenant_id, action.system).await;
                }
                Ok(())
            }
        }
    }

    async fn refresh_credentials(&self, action: &RecoveryAction) -> Result<(), IntegrationError> {
        let inner = &self.inner;
        let tenant_id = action.tenant_id.ok_or_else(|| {
            IntegrationError::validation("credential refresh requires a tenant")
        })?;
        let credentials = inner
            .records
            .load_credentials(tenant_id, action.system)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| IntegrationError::invalid_credentials("no stored credentials"))?;

        let adapter = inner.adapters.get(action.system)?;
        let renewed = adapter.authenticate(&credentials).await?;
        inner
            .records
            .save_credentials(tenant_id, action.system, &renewed, inner.clock.now())
            .await
            .map_err(store_failure)?;
        info!(tenant_id = %tenant_id, "Credentials refreshed");
        Ok(())
    }

    async fn reset_connection(&self, action: &RecoveryAction) -> Result<(), IntegrationError> {
        let inner = &self.inner;
        let pattern = keys::rate_pattern(action.system, action.tenant_id);
        let stale = inner.metrics.keys_matching(&pattern).await?;
        if !stale.is_empty() {
            inner.metrics.delete(&stale).await?;
        }
        if let Some(tenant_id) = action.tenant_id {
            inner.subscriptions.invalidate(tenant_id, action.system).await;
        }
        info!(cleared_keys = stale.len(), "Connection state reset");
        Ok(())
    }

    /// Re-activates a disabled integration, resets its failure count and retires the
    /// pair's open recovery actions so remediation starts from a clean slate.
    pub async fn reenable_integration(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<bool, IntegrationError> {
        let inner = &self.inner;
        let now = inner.clock.now();
        let changed = inner
            .records
            .set_subscription_active(tenant_id, system, true, now)
            .await
            .map_err(store_failure)?;
        inner.subscriptions.invalidate(tenant_id, system).await;
        if changed {
            let retired = inner
                .records
                .retire_recovery_actions(tenant_id, system, now)
                .await
                .map_err(store_failure)?;
            info!(
                tenant_id = %tenant_id,
                system = %system,
                retired_actions = retired,
                "Integration re-enabled"
            );
        }
        Ok(changed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Execution {
    Succeeded,
    Failed,
    Exhausted,
}

impl Execution {
    fn as_str(&self) -> &'static str {
        match self {
            Execution::Succeeded => "success",
            Execution::Failed => "failure",
            Execution::Exhausted => "exhausted",
        }
    }
}

impl std::fmt::Debug for RecoveryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryEngine")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}
