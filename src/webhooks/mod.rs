//! # Webhook Ingestion Pipeline
//!
//! `receive` only enqueues; a fixed pool of workers drains the bounded queue. Each event
//! moves through validation, normalization (for transaction events), handler fan-out and
//! acknowledgement. Retryable processing failures are re-queued after a delay; terminal
//! ones are handed to the recovery engine.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{AdapterRegistry, PosAdapter};
use crate::clock::SharedClock;
use crate::config::WebhookConfig;
use crate::error::{ErrorCode, IntegrationError};
use crate::events::{EventBus, GatewayEvent, WebhookPayload};
use crate::recovery::{FailureReport, RecoveryEngine};
use crate::systems::ExternalSystemType;

pub mod handlers;
pub mod subscription;

pub use handlers::{
    FanOut, HandlerRegistry, StandardEvent, StandardEventType, WebhookEventHandler,
    is_transaction_relevant, standard_event_type,
};
pub use subscription::{NewSubscription, SubscriptionCache, WebhookSubscription};

/// One received event awaiting processing.
#[derive(Clone)]
pub struct IncomingWebhook {
    pub id: Uuid,
    pub system: ExternalSystemType,
    pub event_name: String,
    pub payload: Vec<u8>,
    pub signature: Option<String>,
    pub tenant_id: Option<Uuid>,
    pub received_at: DateTime<Utc>,
    pub attempts: u32,
}

impl std::fmt::Debug for IncomingWebhook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingWebhook")
            .field("id", &self.id)
            .field("system", &self.system)
            .field("event_name", &self.event_name)
            .field("payload_len", &self.payload.len())
            .field("tenant_id", &self.tenant_id)
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct WebhookPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    config: WebhookConfig,
    sender: mpsc::Sender<IncomingWebhook>,
    receiver: Mutex<Option<mpsc::Receiver<IncomingWebhook>>>,
    subscriptions: SubscriptionCache,
    adapters: AdapterRegistry,
    handlers: HandlerRegistry,
    recovery: RecoveryEngine,
    events: EventBus,
    clock: SharedClock,
    shutdown: CancellationToken,
}

enum Disposition {
    Processed,
    Rejected,
    Requeued,
    Failed,
}

impl Disposition {
    fn as_str(&self) -> &'static str {
        match self {
            Disposition::Processed => "processed",
            Disposition::Rejected => "rejected",
            Disposition::Requeued => "requeued",
            Disposition::Failed => "failed",
        }
    }
}

impl WebhookPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: WebhookConfig,
        subscriptions: SubscriptionCache,
        adapters: AdapterRegistry,
        handlers: HandlerRegistry,
        recovery: RecoveryEngine,
        events: EventBus,
        clock: SharedClock,
        shutdown: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity.max(1));
        Self {
            inner: Arc::new(PipelineInner {
                config,
                sender,
                receiver: Mutex::new(Some(receiver)),
                subscriptions,
                adapters,
                handlers,
                recovery,
                events,
                clock,
                shutdown,
            }),
        }
    }

    /// Accepts an event for asynchronous processing and returns its id.
    pub fn receive(
        &self,
        system: ExternalSystemType,
        event_name: impl Into<String>,
        payload: Vec<u8>,
        signature: Option<String>,
        tenant_id: Option<Uuid>,
    ) -> Result<Uuid, IntegrationError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(IntegrationError::queue_unavailable());
        }

        let webhook = IncomingWebhook {
            id: Uuid::new_v4(),
            system,
            event_name: event_name.into(),
            payload,
            signature,
            tenant_id,
            received_at: self.inner.clock.now(),
            attempts: 0,
        };
        let id = webhook.id;

        match self.inner.sender.try_send(webhook) {
            Ok(()) => {
                counter!("gateway_webhooks_total", "system" => system.as_str(), "outcome" => "accepted")
                    .increment(1);
                debug!(webhook_id = %id, system = %system, "Webhook accepted");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                counter!("gateway_webhooks_total", "system" => system.as_str(), "outcome" => "dropped")
                    .increment(1);
                warn!(system = %system, "Webhook queue full");
                Err(IntegrationError::new(ErrorCode::QueueUnavailable, "webhook queue is full")
                    .with_retryable(true))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(IntegrationError::queue_unavailable()),
        }
    }

    /// Spawns the worker pool. Calling it a second time spawns nothing.
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let Some(receiver) = self.inner.receiver.lock().await.take() else {
            warn!("Webhook workers already started");
            return Vec::new();
        };
        let receiver = Arc::new(Mutex::new(receiver));

        info!(workers = self.inner.config.workers, "Starting webhook workers");
        (0..self.inner.config.workers.max(1))
            .map(|worker| {
                let pipeline = self.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { pipeline.work(worker, receiver).await })
            })
            .collect()
    }

    async fn work(self, worker: usize, receiver: Arc<Mutex<mpsc::Receiver<IncomingWebhook>>>) {
        let shutdown = self.inner.shutdown.clone();
        loop {
            let next = tokio::select! {
                _ = shutdown.cancelled() => break,
                next = async { receiver.lock().await.recv().await } => next,
            };
            match next {
                Some(webhook) => self.process(webhook).await,
                None => break,
            }
        }
        debug!(worker, "Webhook worker stopped");
    }

    #[instrument(skip_all, fields(webhook_id = %webhook.id, system = %webhook.system, event = %webhook.event_name))]
    async fn process(&self, mut webhook: IncomingWebhook) {
        webhook.attempts += 1;
        let disposition = match self.process_once(&webhook).await {
            Ok(()) => Disposition::Processed,
            Err(err) if err.code == ErrorCode::IntegrationDisabled => {
                info!(tenant_id = ?webhook.tenant_id, "Webhook rejected, integration disabled");
                Disposition::Rejected
            }
            Err(err) if err.retryable && webhook.attempts < self.inner.config.max_attempts => {
                warn!(attempts = webhook.attempts, error = %err, "Webhook processing failed, requeueing");
                self.requeue(webhook.clone());
                Disposition::Requeued
            }
            Err(err) => {
                warn!(attempts = webhook.attempts, error = %err, "Webhook processing failed");
                self.inner
                    .recovery
                    .handle_failure(FailureReport::webhook(webhook.system, webhook.tenant_id, err))
                    .await;
                Disposition::Failed
            }
        };
        counter!(
            "gateway_webhooks_total",
            "system" => webhook.system.as_str(),
            "outcome" => disposition.as_str()
        )
        .increment(1);
    }

    fn requeue(&self, webhook: IncomingWebhook) {
        let sender = self.inner.sender.clone();
        let shutdown = self.inner.shutdown.clone();
        let delay = self.inner.config.retry_delay();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(webhook_id = %webhook.id, "Dropping requeued webhook on shutdown");
                }
                _ = sleep(delay) => {
                    if sender.send(webhook).await.is_err() {
                        debug!("Webhook queue closed before requeue");
                    }
                }
            }
        });
    }

    async fn process_once(&self, webhook: &IncomingWebhook) -> Result<(), IntegrationError> {
        let inner = &self.inner;
        let system = webhook.system;

        let subscription = match webhook.tenant_id {
            Some(tenant_id) => inner.subscriptions.get(tenant_id, system).await?,
            None => None,
        };
        let adapter = inner.adapters.get(system).ok();

        // No subscription on record means an onboarding or test event: signature checks
        // are skipped.
        if let Some(subscription) = &subscription {
            if !subscription.active {
                return Err(IntegrationError::integration_disabled(
                    subscription.tenant_id,
                    system,
                ));
            }
            let adapter = inner.adapters.get(system)?;
            let signature = webhook.signature.as_deref().unwrap_or_default();
            if !adapter.validate_webhook(&webhook.payload, signature, &subscription.secret_key) {
                return Err(IntegrationError::invalid_signature(system));
            }
        }

        let raw: Value = serde_json::from_slice(&webhook.payload).map_err(|e| {
            IntegrationError::validation(format!("webhook payload is not valid JSON: {e}"))
        })?;
        let payload = self.normalize(adapter.as_deref(), &webhook.event_name, raw);

        if let Some(event_type) = standard_event_type(&webhook.event_name) {
            let fan_out = inner
                .handlers
                .dispatch(StandardEvent {
                    id: webhook.id,
                    event_type,
                    tenant_id: webhook.tenant_id,
                    system,
                    event_name: webhook.event_name.clone(),
                    payload: payload.clone(),
                    received_at: webhook.received_at,
                })
                .await;
            debug!(
                event_type = %event_type,
                delivered = fan_out.delivered,
                failed = fan_out.failed,
                "Webhook fanned out"
            );
        }

        inner.events.publish(GatewayEvent::WebhookReceived {
            tenant_id: webhook.tenant_id,
            system,
            event_name: webhook.event_name.clone(),
            payload,
        });

        if let (Some(tenant_id), Some(_)) = (webhook.tenant_id, &subscription) {
            if let Err(err) = inner
                .subscriptions
                .records()
                .mark_processed(tenant_id, system, inner.clock.now())
                .await
            {
                warn!(error = %err, "Failed to mark subscription processed");
            }
        }
        Ok(())
    }

    /// Normalization failures fall back to the raw payload.
    fn normalize(
        &self,
        adapter: Option<&dyn PosAdapter>,
        event_name: &str,
        raw: Value,
    ) -> WebhookPayload {
        if !is_transaction_relevant(event_name) {
            return WebhookPayload::Raw(raw);
        }
        let Some(adapter) = adapter else {
            debug!("No adapter registered, delivering raw payload");
            return WebhookPayload::Raw(raw);
        };
        match adapter.transform_raw_data(&raw) {
            Ok(transaction) => WebhookPayload::Transaction(Box::new(transaction)),
            Err(err) => {
                warn!(error = %err, "Webhook normalization failed, delivering raw payload");
                WebhookPayload::Raw(raw)
            }
        }
    }

    pub fn queue_capacity(&self) -> usize {
        self.inner.sender.max_capacity()
    }

    /// Events waiting in the ingestion queue.
    pub fn backlog(&self) -> usize {
        self.inner.sender.max_capacity() - self.inner.sender.capacity()
    }
}

impl std::fmt::Debug for WebhookPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookPipeline")
            .field("config", &self.inner.config)
            .field("handlers", &self.inner.handlers)
            .finish_non_exhaustive()
    }
}
