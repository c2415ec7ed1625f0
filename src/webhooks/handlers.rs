//! Standardized webhook events and the typed handler registry they fan out to.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::events::WebhookPayload;
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum StandardEventType {
    #[serde(rename = "transaction.created")]
    TransactionCreated,
    #[serde(rename = "transaction.updated")]
    TransactionUpdated,
    #[serde(rename = "transaction.refunded")]
    TransactionRefunded,
    #[serde(rename = "sync.completed")]
    SyncCompleted,
}

impl StandardEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StandardEventType::TransactionCreated => "transaction.created",
            StandardEventType::TransactionUpdated => "transaction.updated",
            StandardEventType::TransactionRefunded => "transaction.refunded",
            StandardEventType::SyncCompleted => "sync.completed",
        }
    }
}

impl fmt::Display for StandardEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vendor event names, compared case-insensitively.
const EVENT_NAMES: &[(&str, StandardEventType)] = &[
    ("order.created", StandardEventType::TransactionCreated),
    ("orders/create", StandardEventType::TransactionCreated),
    ("payment.created", StandardEventType::TransactionCreated),
    ("transaction.created", StandardEventType::TransactionCreated),
    ("order.updated", StandardEventType::TransactionUpdated),
    ("orders/updated", StandardEventType::TransactionUpdated),
    ("orders/paid", StandardEventType::TransactionUpdated),
    ("order.paid", StandardEventType::TransactionUpdated),
    ("payment.updated", StandardEventType::TransactionUpdated),
    ("transaction.updated", StandardEventType::TransactionUpdated),
    ("refund.created", StandardEventType::TransactionRefunded),
    ("refunds/create", StandardEventType::TransactionRefunded),
    ("order.refunded", StandardEventType::TransactionRefunded),
    ("payment.refunded", StandardEventType::TransactionRefunded),
    ("transaction.refunded", StandardEventType::TransactionRefunded),
    ("sync.completed", StandardEventType::SyncCompleted),
];

pub fn standard_event_type(event_name: &str) -> Option<StandardEventType> {
    let name = event_name.trim();
    EVENT_NAMES
        .iter()
        .find(|(raw, _)| raw.eq_ignore_ascii_case(name))
        .map(|(_, event_type)| *event_type)
}

/// Order or payment creation, update or payment events carry a transaction body.
pub fn is_transaction_relevant(event_name: &str) -> bool {
    let name = event_name.to_ascii_lowercase();
    let subject = name.contains("order") || name.contains("payment");
    let verb = name.contains("create") || name.contains("update") || name.contains("paid");
    subject && verb
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StandardEvent {
    pub id: Uuid,
    pub event_type: StandardEventType,
    pub tenant_id: Option<Uuid>,
    pub system: ExternalSystemType,
    pub event_name: String,
    pub payload: WebhookPayload,
    pub received_at: DateTime<Utc>,
}

#[async_trait]
pub trait WebhookEventHandler: Send + Sync {
    async fn handle(&self, event: &StandardEvent) -> anyhow::Result<()>;
}

/// Delivery counts for one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FanOut {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<StandardEventType, Vec<Arc<dyn WebhookEventHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, event_type: StandardEventType, handler: Arc<dyn WebhookEventHandler>) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    pub fn handler_count(&self, event_type: StandardEventType) -> usize {
        self.handlers.get(&event_type).map_or(0, Vec::len)
    }

    /// Runs every handler for the event's type concurrently. A failing or panicking
    /// handler is logged and does not affect the others.
    pub async fn dispatch(&self, event: StandardEvent) -> FanOut {
        let Some(handlers) = self.handlers.get(&event.event_type) else {
            debug!(event_type = %event.event_type, "No handlers registered");
            return FanOut::default();
        };

        let event = Arc::new(event);
        let mut tasks = JoinSet::new();
        for handler in handlers {
            let handler = handler.clone();
            let event = event.clone();
            tasks.spawn(async move { handler.handle(&event).await });
        }

        let mut fan_out = FanOut::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => fan_out.delivered += 1,
                Ok(Err(err)) => {
                    fan_out.failed += 1;
                    warn!(event_type = %event.event_type, error = %err, "Webhook handler failed");
                }
                Err(err) => {
                    fan_out.failed += 1;
                    error!(event_type = %event.event_type, error = %err, "Webhook handler panicked");
                }
            }
        }
        fan_out
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: HashMap<_, _> = self
            .handlers
            .iter()
            .map(|(event_type, handlers)| (event_type.as_str(), handlers.len()))
            .collect();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &counts)
            .finish()
    }
}
