//! Distributed rate accounting shared by every gateway instance.
//!
//! Counters live in the [`MetricsStore`] under `rate:{system}:{tenant}:{window}` with a
//! TTL equal to the window length. A consecutive-error counter plus the last error's
//! timestamp open an exponential backoff window that the permission check honours.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::IntegrationError;
use crate::store::{MetricsStore, StoreError, get_json, keys, set_json_with_ttl};
use crate::systems::{ExternalSystemType, RateLimit};

const SECOND: Duration = Duration::from_secs(1);
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3_600);
const DAY: Duration = Duration::from_secs(86_400);

/// Answer to "can this system dispatch now?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    Granted,
    Wait(Duration),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct LastError {
    at_ms: i64,
    retry_after_ms: Option<u64>,
}

/// Point-in-time view of one (system, tenant) budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateMetrics {
    pub system: ExternalSystemType,
    pub tenant_id: Option<Uuid>,
    pub second: u64,
    pub minute: u64,
    pub hour: u64,
    pub day: Option<u64>,
    pub consecutive_errors: u64,
    pub last_error_at: Option<DateTime<Utc>>,
    pub retry_after_ms: Option<u64>,
}

struct Window {
    name: &'static str,
    ceiling: u32,
    length: Duration,
}

fn windows(limit: &RateLimit) -> Vec<Window> {
    let mut windows = vec![Window {
        name: "second",
        ceiling: limit.second_ceiling(),
        length: SECOND,
    }];
    let optional = [
        ("minute", limit.requests_per_minute, MINUTE),
        ("hour", limit.requests_per_hour, HOUR),
        ("day", limit.requests_per_day, DAY),
    ];
    for (name, ceiling, length) in optional {
        if let Some(ceiling) = ceiling {
            windows.push(Window {
                name,
                ceiling,
                length,
            });
        }
    }
    windows
}

#[derive(Clone)]
pub struct RateBudget {
    store: Arc<dyn MetricsStore>,
    clock: SharedClock,
    error_backoff_base: Duration,
    error_backoff_cap: Duration,
}

impl RateBudget {
    pub fn new(
        store: Arc<dyn MetricsStore>,
        clock: SharedClock,
        error_backoff_base: Duration,
        error_backoff_cap: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            error_backoff_base,
            error_backoff_cap,
        }
    }

    /// Checks the error backoff window and every configured counter.
    ///
    /// Store failures grant permission: an unreachable store must not stall dispatch.
    pub async fn check(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        limit: &RateLimit,
    ) -> Permit {
        match self.try_check(system, tenant_id, limit).await {
            Ok(permit) => permit,
            Err(err) => {
                warn!(system = %system, error = %err, "Rate budget check failed, allowing call");
                Permit::Granted
            }
        }
    }

    async fn try_check(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        limit: &RateLimit,
    ) -> Result<Permit, StoreError> {
        if let Some(wait) = self.error_backoff_remaining(system, tenant_id).await? {
            debug!(system = %system, wait_ms = wait.as_millis() as u64, "Error backoff active");
            return Ok(Permit::Wait(wait));
        }

        for window in windows(limit) {
            let key = keys::rate_window(system, tenant_id, window.name);
            let count = self.read_count(&key).await?;
            if count >= i64::from(window.ceiling) {
                let wait = self
                    .store
                    .ttl(&key)
                    .await?
                    .unwrap_or(window.length)
                    .max(Duration::from_millis(1));
                debug!(
                    system = %system,
                    window = window.name,
                    count,
                    ceiling = window.ceiling,
                    "Rate ceiling reached"
                );
                return Ok(Permit::Wait(wait));
            }
        }
        Ok(Permit::Granted)
    }

    async fn error_backoff_remaining(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
    ) -> Result<Option<Duration>, StoreError> {
        let errors = self.read_count(&keys::rate_errors(system, tenant_id)).await?;
        if errors <= 0 {
            return Ok(None);
        }
        let last_key = keys::rate_window(system, tenant_id, "last_error");
        let Some(last) = get_json::<LastError>(self.store.as_ref(), &last_key).await? else {
            return Ok(None);
        };

        let window = self.backoff_window(errors as u32, last.retry_after_ms);
        let elapsed_ms = (self.clock.now().timestamp_millis() - last.at_ms).max(0) as u64;
        let elapsed = Duration::from_millis(elapsed_ms);
        Ok((elapsed < window).then(|| window - elapsed))
    }

    /// `min(base * 2^(n-1), cap)`, stretched to any server-provided retry-after.
    pub fn backoff_window(&self, consecutive_errors: u32, retry_after_ms: Option<u64>) -> Duration {
        let exponent = consecutive_errors.saturating_sub(1).min(30);
        let raw = self.error_backoff_base.saturating_mul(1u32 << exponent);
        let window = raw.min(self.error_backoff_cap);
        match retry_after_ms {
            Some(ms) => window.max(Duration::from_millis(ms)),
            None => window,
        }
    }

    /// Counts one permitted call in every configured window.
    pub async fn record_request(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        limit: &RateLimit,
    ) {
        for window in windows(limit) {
            let key = keys::rate_window(system, tenant_id, window.name);
            if let Err(err) = self.store.incr_with_ttl(&key, window.length).await {
                warn!(system = %system, key = %key, error = %err, "Rate counter increment failed");
            }
        }
    }

    /// A single success closes the error backoff window.
    pub async fn record_success(&self, system: ExternalSystemType, tenant_id: Option<Uuid>) {
        let doomed = [
            keys::rate_errors(system, tenant_id),
            keys::rate_window(system, tenant_id, "last_error"),
        ];
        if let Err(err) = self.store.delete(&doomed).await {
            warn!(system = %system, error = %err, "Failed to reset error backoff");
        }
    }

    pub async fn record_error(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        error: &IntegrationError,
    ) {
        // Both keys outlive the longest possible window so the count survives until a success.
        let retention = self.error_backoff_cap.saturating_mul(2);
        let errors_key = keys::rate_errors(system, tenant_id);
        if let Err(err) = self.store.incr_with_ttl(&errors_key, retention).await {
            warn!(system = %system, error = %err, "Failed to count consecutive error");
            return;
        }

        let last = LastError {
            at_ms: self.clock.now().timestamp_millis(),
            retry_after_ms: error.retry_after.map(|d| d.as_millis() as u64),
        };
        let last_key = keys::rate_window(system, tenant_id, "last_error");
        if let Err(err) =
            set_json_with_ttl(self.store.as_ref(), &last_key, &last, retention).await
        {
            warn!(system = %system, error = %err, "Failed to record last error");
        }
    }

    pub async fn metrics(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
        limit: &RateLimit,
    ) -> Result<RateMetrics, StoreError> {
        let count = |window: &str| keys::rate_window(system, tenant_id, window);
        let day = match limit.requests_per_day {
            Some(_) => Some(self.read_count(&count("day")).await?.max(0) as u64),
            None => None,
        };
        let last = get_json::<LastError>(self.store.as_ref(), &count("last_error")).await?;

        Ok(RateMetrics {
            system,
            tenant_id,
            second: self.read_count(&count("second")).await?.max(0) as u64,
            minute: self.read_count(&count("minute")).await?.max(0) as u64,
            hour: self.read_count(&count("hour")).await?.max(0) as u64,
            day,
            consecutive_errors: self
                .read_count(&keys::rate_errors(system, tenant_id))
                .await?
                .max(0) as u64,
            last_error_at: last.and_then(|l| DateTime::from_timestamp_millis(l.at_ms)),
            retry_after_ms: last.and_then(|l| l.retry_after_ms),
        })
    }

    async fn read_count(&self, key: &str) -> Result<i64, StoreError> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|raw| raw.trim().parse::<i64>().ok())
            .unwrap_or(0))
    }
}

impl std::fmt::Debug for RateBudget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateBudget")
            .field("error_backoff_base", &self.error_backoff_base)
            .field("error_backoff_cap", &self.error_backoff_cap)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::store::InMemoryMetricsStore;

    fn budget() -> RateBudget {
        RateBudget::new(
            Arc::new(InMemoryMetricsStore::new()),
            Arc::new(TokioClock::new()),
            Duration::from_secs(1),
            Duration::from_secs(300),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn second_window_blocks_until_expiry() {
        let budget = budget();
        let limit = RateLimit::per_second(2);
        let system = ExternalSystemType::Square;

        for _ in 0..2 {
            assert_eq!(budget.check(system, None, &limit).await, Permit::Granted);
            budget.record_request(system, None, &limit).await;
        }
        let Permit::Wait(wait) = budget.check(system, None, &limit).await else {
            panic!("third call in the same second must wait");
        };
        assert!(wait <= Duration::from_secs(1));

        tokio::time::advance(wait).await;
        assert_eq!(budget.check(system, None, &limit).await, Permit::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn minute_ceiling_applies_when_configured() {
        let budget = budget();
        let limit = RateLimit::per_second(10).with_per_minute(3);
        let tenant = Some(Uuid::new_v4());

        for _ in 0..3 {
            budget.record_request(ExternalSystemType::Toast, tenant, &limit).await;
            tokio::time::advance(Duration::from_secs(2)).await;
        }
        match budget.check(ExternalSystemType::Toast, tenant, &limit).await {
            Permit::Wait(wait) => assert!(wait > Duration::from_secs(50)),
            Permit::Granted => panic!("minute ceiling ignored"),
        }
        // Other tenants keep their own budget.
        assert_eq!(
            budget.check(ExternalSystemType::Toast, None, &limit).await,
            Permit::Granted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn consecutive_errors_open_backoff_and_success_resets() {
        let budget = budget();
        let limit = RateLimit::per_second(5);
        let system = ExternalSystemType::Clover;
        let err = IntegrationError::connection_refused("refused");

        budget.record_error(system, None, &err).await;
        budget.record_error(system, None, &err).await;
        match budget.check(system, None, &limit).await {
            Permit::Wait(wait) => assert_eq!(wait, Duration::from_secs(2)),
            Permit::Granted => panic!("backoff window ignored"),
        }

        budget.record_success(system, None).await;
        assert_eq!(budget.check(system, None, &limit).await, Permit::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_widens_backoff() {
        let budget = budget();
        let err = IntegrationError::rate_limited(Some(Duration::from_secs(20)));
        budget.record_error(ExternalSystemType::Shopify, None, &err).await;

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            budget
                .check(ExternalSystemType::Shopify, None, &RateLimit::per_second(2))
                .await,
            Permit::Wait(Duration::from_secs(15))
        );

        let metrics = budget
            .metrics(ExternalSystemType::Shopify, None, &RateLimit::per_second(2))
            .await
            .unwrap();
        assert_eq!(metrics.consecutive_errors, 1);
        assert_eq!(metrics.retry_after_ms, Some(20_000));
    }

    #[test]
    fn backoff_window_is_capped() {
        let budget = budget();
        assert_eq!(budget.backoff_window(1, None), Duration::from_secs(1));
        assert_eq!(budget.backoff_window(4, None), Duration::from_secs(8));
        assert_eq!(budget.backoff_window(20, None), Duration::from_secs(300));
    }
}
