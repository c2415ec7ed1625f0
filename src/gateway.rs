//! Composition root: wires the stores, adapters, dispatcher, webhook pipeline and
//! recovery engine into one explicitly constructed [`Gateway`], and exposes onboarding,
//! transaction sync and the admin controls.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};
use url::Url;
use uuid::Uuid;

use crate::adapters::{AdapterMetadata, AdapterRegistry, Credentials, PosAdapter};
use crate::clock::{SharedClock, SystemClock};
use crate::config::AppConfig;
use crate::dispatcher::{Dispatcher, RateBudget, RateMetrics};
use crate::error::IntegrationError;
use crate::events::{EventBus, GatewayEvent};
use crate::normalization::StandardizedTransaction;
use crate::recovery::{HealthSnapshot, RecoveryEngine, SweepStats};
use crate::repositories::{InMemoryRecordStore, RecordStore};
use crate::store::{InMemoryMetricsStore, MetricsStore};
use crate::systems::ExternalSystemType;
use crate::webhooks::{
    HandlerRegistry, NewSubscription, StandardEventType, SubscriptionCache, WebhookEventHandler,
    WebhookPipeline, WebhookSubscription,
};

/// Onboarding calls jump ahead of routine sync traffic.
pub const ONBOARDING_PRIORITY: i32 = 10;
pub const SYNC_PRIORITY: i32 = 0;

fn store_failure(err: anyhow::Error) -> IntegrationError {
    IntegrationError::connection_refused(format!("record store unavailable: {err}"))
}

pub struct GatewayBuilder {
    config: AppConfig,
    metrics: Option<Arc<dyn MetricsStore>>,
    records: Option<Arc<dyn RecordStore>>,
    clock: Option<SharedClock>,
    adapters: AdapterRegistry,
    handlers: HandlerRegistry,
    events: Option<EventBus>,
}

impl GatewayBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            metrics: None,
            records: None,
            clock: None,
            adapters: AdapterRegistry::new(),
            handlers: HandlerRegistry::new(),
            events: None,
        }
    }

    pub fn metrics_store(mut self, store: Arc<dyn MetricsStore>) -> Self {
        self.metrics = Some(store);
        self
    }

    pub fn record_store(mut self, store: Arc<dyn RecordStore>) -> Self {
        self.records = Some(store);
        self
    }

    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn adapter(mut self, adapter: Arc<dyn PosAdapter>, metadata: AdapterMetadata) -> Self {
        self.adapters.register(adapter, metadata);
        self
    }

    pub fn adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn handler(
        mut self,
        event_type: StandardEventType,
        handler: Arc<dyn WebhookEventHandler>,
    ) -> Self {
        self.handlers.register(event_type, handler);
        self
    }

    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Missing stores default to their in-memory implementations and the clock to the
    /// system clock.
    pub fn build(self) -> Gateway {
        let config = Arc::new(self.config);
        let metrics = self
            .metrics
            .unwrap_or_else(|| Arc::new(InMemoryMetricsStore::new()));
        let records = self
            .records
            .unwrap_or_else(|| Arc::new(InMemoryRecordStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let events = self.events.unwrap_or_default();
        let shutdown = CancellationToken::new();

        let subscriptions = SubscriptionCache::new(
            records.clone(),
            metrics.clone(),
            config.webhooks.subscription_cache_ttl(),
        );
        let recovery = RecoveryEngine::new(
            config.recovery.clone(),
            records.clone(),
            metrics.clone(),
            subscriptions.clone(),
            self.adapters.clone(),
            events.clone(),
            clock.clone(),
        );
        let budget = RateBudget::new(
            metrics,
            clock.clone(),
            config.dispatcher.error_backoff_base(),
            config.dispatcher.error_backoff_cap(),
        );
        let dispatcher = Dispatcher::new(
            config.dispatcher.clone(),
            config.rate_limits.clone(),
            budget,
            subscriptions.clone(),
            recovery.clone(),
            shutdown.clone(),
        );
        let webhooks = WebhookPipeline::new(
            config.webhooks.clone(),
            subscriptions.clone(),
            self.adapters.clone(),
            self.handlers,
            recovery.clone(),
            events.clone(),
            clock.clone(),
            shutdown.clone(),
        );

        Gateway {
            config,
            records,
            clock,
            adapters: self.adapters,
            events,
            subscriptions,
            dispatcher,
            webhooks,
            recovery,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }
}

pub struct Gateway {
    config: Arc<AppConfig>,
    records: Arc<dyn RecordStore>,
    clock: SharedClock,
    adapters: AdapterRegistry,
    events: EventBus,
    subscriptions: SubscriptionCache,
    dispatcher: Dispatcher,
    webhooks: WebhookPipeline,
    recovery: RecoveryEngine,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn builder(config: AppConfig) -> GatewayBuilder {
        GatewayBuilder::new(config)
    }

    /// Spawns the webhook workers and the recovery loop. Dispatcher workers start
    /// lazily with the first call for each system.
    pub async fn start(&self) {
        let mut handles = self.webhooks.start().await;
        handles.push(tokio::spawn(
            self.recovery.clone().run(self.shutdown.clone()),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(handles);
        info!(
            systems = ?self.adapters.systems(),
            profile = %self.config.profile,
            "Gateway started"
        );
    }

    /// Stops every background task. Queued dispatcher calls resolve with
    /// `QUEUE_UNAVAILABLE`.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.shutdown.cancel();
        self.dispatcher.shutdown().await;
        let tasks: Vec<_> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Background task ended abnormally");
            }
        }
        info!("Gateway stopped");
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn recovery(&self) -> &RecoveryEngine {
        &self.recovery
    }

    pub fn records(&self) -> &Arc<dyn RecordStore> {
        &self.records
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

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
        self.dispatcher
            .dispatch(system, tenant_id, priority, action)
            .await
    }

    pub fn receive_webhook(
        &self,
        system: ExternalSystemType,
        event_name: impl Into<String>,
        payload: Vec<u8>,
        signature: Option<String>,
        tenant_id: Option<Uuid>,
    ) -> Result<Uuid, IntegrationError> {
        self.webhooks
            .receive(system, event_name, payload, signature, tenant_id)
    }

    /// Connects a tenant to a system: verifies the credentials, registers webhooks,
    /// stores the credentials encrypted and (re)activates the subscription.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, system = %system))]
    pub async fn onboard(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        credentials: Credentials,
        webhook_url: Url,
    ) -> Result<WebhookSubscription, IntegrationError> {
        let adapter = self.adapters.get(system)?;

        let connected = {
            let adapter = adapter.clone();
            let credentials = credentials.clone();
            self.dispatcher
                .submit(system, Some(tenant_id), ONBOARDING_PRIORITY, move || {
                    let adapter = adapter.clone();
                    let credentials = credentials.clone();
                    async move { adapter.test_connection(&credentials).await }
                })
                .await?
        };
        if !connected {
            return Err(IntegrationError::invalid_credentials(format!(
                "connection test to {system} failed"
            )));
        }

        let setup = {
            let credentials = credentials.clone();
            self.dispatcher
                .submit(system, Some(tenant_id), ONBOARDING_PRIORITY, move || {
                    let adapter = adapter.clone();
                    let credentials = credentials.clone();
                    let webhook_url = webhook_url.clone();
                    async move { adapter.setup_webhooks(&credentials, &webhook_url).await }
                })
                .await?
        };

        let now = self.clock.now();
        self.records
            .save_credentials(tenant_id, system, &credentials, now)
            .await
            .map_err(store_failure)?;
        let subscription = self
            .records
            .upsert_subscription(
                NewSubscription {
                    tenant_id,
                    system,
                    webhook_url: setup.endpoint.to_string(),
                    events: setup.events,
                    secret_key: setup.secret_key,
                },
                now,
            )
            .await
            .map_err(store_failure)?;
        self.subscriptions.invalidate(tenant_id, system).await;

        info!(events = ?subscription.events, "Tenant onboarded");
        Ok(subscription)
    }

    /// Pulls transactions for one location through the dispatcher.
    #[instrument(skip_all, fields(tenant_id = %tenant_id, system = %system, location_id = %location_id))]
    pub async fn sync_transactions(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        location_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<StandardizedTransaction>, IntegrationError> {
        let credentials = self
            .records
            .load_credentials(tenant_id, system)
            .await
            .map_err(store_failure)?
            .ok_or_else(|| {
                IntegrationError::invalid_credentials(format!(
                    "no credentials stored for {system}"
                ))
            })?;
        let adapter = self.adapters.get(system)?;
        let location_id = location_id.to_string();

        let transactions = self
            .dispatcher
            .dispatch(system, Some(tenant_id), SYNC_PRIORITY, move || {
                let adapter = adapter.clone();
                let credentials = credentials.clone();
                let location_id = location_id.clone();
                async move {
                    adapter
                        .get_transactions(&credentials, &location_id, start, end)
                        .await
                }
            })
            .await?;
        info!(count = transactions.len(), "Transactions synced");
        Ok(transactions)
    }

    pub fn pause(&self, system: ExternalSystemType) {
        self.dispatcher.pause(system);
    }

    pub fn resume(&self, system: ExternalSystemType) {
        self.dispatcher.resume(system);
    }

    pub fn queue_depth(&self, system: ExternalSystemType) -> usize {
        self.dispatcher.queue_depth(system)
    }

    pub fn queue_depths(&self) -> BTreeMap<ExternalSystemType, usize> {
        self.dispatcher.queue_depths()
    }

    pub fn webhook_backlog(&self) -> usize {
        self.webhooks.backlog()
    }

    pub async fn force_sweep(&self) -> SweepStats {
        self.recovery.force_sweep().await
    }

    pub async fn reenable_integration(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<bool, IntegrationError> {
        self.recovery.reenable_integration(tenant_id, system).await
    }

    pub async fn health_snapshot(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
    ) -> Option<HealthSnapshot> {
        self.recovery.health_snapshot(tenant_id, system).await
    }

    pub async fn rate_metrics(
        &self,
        system: ExternalSystemType,
        tenant_id: Option<Uuid>,
    ) -> Result<RateMetrics, IntegrationError> {
        self.dispatcher.rate_metrics(system, tenant_id).await
    }
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("adapters", &self.adapters)
            .field("dispatcher", &self.dispatcher)
            .field("webhooks", &self.webhooks)
            .finish_non_exhaustive()
    }
}
