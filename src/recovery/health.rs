//! Rolling per-pair health used for advisory status.
//!
//! Samples older than the configured window are discarded on every read. Snapshots are
//! mirrored to the metrics store so other processes can read them.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use lru::LruCache;
use metrics::gauge;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::IntegrationError;
use crate::store::{MetricsStore, get_json, keys, set_json_with_ttl};
use crate::systems::ExternalSystemType;

const TRACKED_PAIRS: usize = 10_000;
const DEGRADED_ABOVE: f64 = 0.25;
const UNHEALTHY_ABOVE: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub tenant_id: Option<Uuid>,
    pub system: ExternalSystemType,
    pub success_rate: f64,
    pub error_rate: f64,
    pub total_requests: u64,
    pub last_error: Option<String>,
    pub status: ConnectionStatus,
    pub last_check: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PairHealth {
    samples: VecDeque<(DateTime<Utc>, bool)>,
    last_error: Option<String>,
    forced_disconnect: bool,
}

impl PairHealth {
    fn prune(&mut self, cutoff: DateTime<Utc>) {
        while self.samples.front().is_some_and(|(at, _)| *at < cutoff) {
            self.samples.pop_front();
        }
    }

    fn snapshot(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> HealthSnapshot {
        let total = self.samples.len() as u64;
        let errors = self.samples.iter().filter(|(_, ok)| !ok).count() as u64;
        let error_rate = if total == 0 {
            0.0
        } else {
            errors as f64 / total as f64
        };

        let status = if self.forced_disconnect {
            ConnectionStatus::Disconnected
        } else if error_rate > UNHEALTHY_ABOVE {
            ConnectionStatus::Unhealthy
        } else if error_rate > DEGRADED_ABOVE {
            ConnectionStatus::Degraded
        } else {
            ConnectionStatus::Healthy
        };

        HealthSnapshot {
            tenant_id,
            system,
            success_rate: if total == 0 { 1.0 } else { 1.0 - error_rate },
            error_rate,
            total_requests: total,
            last_error: self.last_error.clone(),
            status,
            last_check: now,
        }
    }
}

type PairKey = (Option<Uuid>, ExternalSystemType);

pub struct HealthTracker {
    pairs: Mutex<LruCache<PairKey, PairHealth>>,
    store: Arc<dyn MetricsStore>,
    clock: SharedClock,
    window: Duration,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn MetricsStore>, clock: SharedClock, window: Duration) -> Self {
        let capacity = NonZeroUsize::new(TRACKED_PAIRS).unwrap_or(NonZeroUsize::MIN);
        Self {
            pairs: Mutex::new(LruCache::new(capacity)),
            store,
            clock,
            window,
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - TimeDelta::from_std(self.window).unwrap_or(TimeDelta::hours(1))
    }

    /// Records one terminal outcome. Auth and connection-class errors force
    /// `Disconnected` until the next success.
    pub async fn record(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        outcome: Result<(), &IntegrationError>,
    ) -> HealthSnapshot {
        let now = self.clock.now();
        let snapshot = {
            let mut pairs = self.pairs.lock().await;
            let pair = pairs.get_or_insert_mut((tenant_id, system), PairHealth::default);
            pair.prune(self.cutoff(now));
            match outcome {
                Ok(()) => {
                    pair.samples.push_back((now, true));
                    pair.forced_disconnect = false;
                }
                Err(err) => {
                    pair.samples.push_back((now, false));
                    pair.last_error = Some(err.to_string());
                    if err.code.forces_disconnect() {
                        pair.forced_disconnect = true;
                    }
                }
            }
            pair.snapshot(tenant_id, system, now)
        };

        self.mirror(&snapshot).await;
        snapshot
    }

    /// Current snapshot for a pair, falling back to the mirrored copy in the store.
    pub async fn snapshot(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
    ) -> Option<HealthSnapshot> {
        let now = self.clock.now();
        {
            let mut pairs = self.pairs.lock().await;
            if let Some(pair) = pairs.get_mut(&(tenant_id, system)) {
                pair.prune(self.cutoff(now));
                return Some(pair.snapshot(tenant_id, system, now));
            }
        }

        match get_json(self.store.as_ref(), &keys::health(tenant_id, system)).await {
            Ok(found) => found,
            Err(err) => {
                warn!(system = %system, error = %err, "Failed to read mirrored health snapshot");
                None
            }
        }
    }

    /// Recomputes every tracked pair; run on the health-check cadence.
    pub async fn refresh_all(&self) -> Vec<HealthSnapshot> {
        let now = self.clock.now();
        let cutoff = self.cutoff(now);
        let snapshots: Vec<_> = {
            let mut pairs = self.pairs.lock().await;
            pairs
                .iter_mut()
                .map(|((tenant_id, system), pair)| {
                    pair.prune(cutoff);
                    pair.snapshot(*tenant_id, *system, now)
                })
                .collect()
        };

        for snapshot in &snapshots {
            self.mirror(snapshot).await;
        }
        snapshots
    }

    async fn mirror(&self, snapshot: &HealthSnapshot) {
        gauge!("gateway_health_error_rate", "system" => snapshot.system.as_str())
            .set(snapshot.error_rate);

        let key = keys::health(snapshot.tenant_id, snapshot.system);
        if let Err(err) = set_json_with_ttl(self.store.as_ref(), &key, snapshot, self.window).await
        {
            warn!(system = %snapshot.system, error = %err, "Failed to mirror health snapshot");
            return;
        }
        let member = keys::health_member(snapshot.tenant_id, snapshot.system);
        if let Err(err) = self.store.set_add(keys::HEALTH_INDEX, &member).await {
            warn!(system = %snapshot.system, error = %err, "Failed to index health snapshot");
        }
    }
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("window", &self.window)
            .finish_non_exhaustive()
    }
}
