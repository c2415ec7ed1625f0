//! Typed notifications published by the gateway for downstream collaborators.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

use crate::normalization::StandardizedTransaction;
use crate::recovery::{HealthSnapshot, RecoveryAction};
use crate::systems::ExternalSystemType;

const DEFAULT_CAPACITY: usize = 1024;

/// Payload of a processed webhook: the normalized transaction when normalization
/// succeeded, otherwise the raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum WebhookPayload {
    Transaction(Box<StandardizedTransaction>),
    Raw(Value),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    WebhookReceived {
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        event_name: String,
        payload: WebhookPayload,
    },
    WebhookDisabled {
        tenant_id: Uuid,
        system: ExternalSystemType,
        reason: String,
        failure_count: u32,
    },
    RecoverySuccess(RecoveryAction),
    RecoveryFailed(RecoveryAction),
    HealthUpdated {
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        snapshot: HealthSnapshot,
    },
}

impl GatewayEvent {
    /// Wire name, e.g. `webhook:disabled`.
    pub fn name(&self) -> &'static str {
        match self {
            GatewayEvent::WebhookReceived { .. } => "webhook:received",
            GatewayEvent::WebhookDisabled { .. } => "webhook:disabled",
            GatewayEvent::RecoverySuccess(_) => "recovery:success",
            GatewayEvent::RecoveryFailed(_) => "recovery:failed",
            GatewayEvent::HealthUpdated { .. } => "health:updated",
        }
    }
}

/// Broadcast channel for [`GatewayEvent`]s. Publishing never blocks; subscribers that
/// fall behind observe `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<GatewayEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: GatewayEvent) {
        let name = event.name();
        // No receivers is not an error for the publisher.
        if self.sender.send(event).is_err() {
            trace!(event = name, "Gateway event dropped, no subscribers");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
