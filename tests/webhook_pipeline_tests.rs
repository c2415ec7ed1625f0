//! Webhook ingestion: validation, normalization, fan-out and failure disabling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeDelta, Utc};
use pos_gateway::events::{GatewayEvent, WebhookPayload};
use pos_gateway::webhooks::{StandardEvent, StandardEventType, WebhookEventHandler};
use pos_gateway::{ErrorCode, ExternalSystemType, IntegrationError};
use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use uuid::Uuid;

mod test_utils;
use test_utils::{ScriptedAdapter, build_gateway_with, signed_body, subscribe, test_config};

const SYSTEM: ExternalSystemType = ExternalSystemType::Shopify;
const WAIT: Duration = Duration::from_secs(60);

struct RecordingHandler {
    seen: mpsc::UnboundedSender<StandardEvent>,
}

#[async_trait]
impl WebhookEventHandler for RecordingHandler {
    async fn handle(&self, event: &StandardEvent) -> anyhow::Result<()> {
        let _ = self.seen.send(event.clone());
        Ok(())
    }
}

struct FailingHandler;

#[async_trait]
impl WebhookEventHandler for FailingHandler {
    async fn handle(&self, _event: &StandardEvent) -> anyhow::Result<()> {
        anyhow::bail!("downstream ledger unavailable")
    }
}

fn recorder() -> (Arc<RecordingHandler>, mpsc::UnboundedReceiver<StandardEvent>) {
    let (seen, rx) = mpsc::unbounded_channel();
    (Arc::new(RecordingHandler { seen }), rx)
}

fn shopify_order() -> serde_json::Value {
    json!({
        "id": 820982911946154508u64,
        "created_at": "2024-05-01T10:00:00-05:00",
        "total_price": "108.25",
        "total_tax": "8.25",
        "currency": "usd",
        "financial_status": "paid",
        "tax_lines": [
            { "title": "TX State Tax", "rate": 0.0625, "price": "6.25" },
            { "title": "Austin City Tax", "rate": 2.0, "price": "2.00" }
        ],
        "line_items": [
            { "id": 1, "title": "Espresso Beans", "quantity": 2, "price": "50.00" }
        ]
    })
}

async fn next_matching<F>(events: &mut broadcast::Receiver<GatewayEvent>, mut wanted: F) -> GatewayEvent
where
    F: FnMut(&GatewayEvent) -> bool,
{
    timeout(WAIT, async {
        loop {
            let event = events.recv().await.expect("event bus open");
            if wanted(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected gateway event")
}

#[tokio::test(start_paused = true)]
async fn signed_order_reaches_each_handler_once() {
    let (first, mut first_rx) = recorder();
    let (second, mut second_rx) = recorder();
    let (refunds, mut refunds_rx) = recorder();
    let tg = build_gateway_with(test_config(), ScriptedAdapter::new(SYSTEM), |builder| {
        builder
            .handler(StandardEventType::TransactionCreated, first)
            .handler(StandardEventType::TransactionCreated, second)
            .handler(StandardEventType::TransactionRefunded, refunds)
    });
    let tenant = Uuid::new_v4();
    subscribe(tg.records.as_ref(), tenant, SYSTEM).await.unwrap();
    let mut events = tg.gateway.subscribe_events();
    tg.gateway.start().await;

    let (body, signature) = signed_body(SYSTEM, &shopify_order());
    tg.gateway
        .receive_webhook(SYSTEM, "order.created", body, Some(signature), Some(tenant))
        .expect("accepted");

    for rx in [&mut first_rx, &mut second_rx] {
        let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(event.event_type, StandardEventType::TransactionCreated);
        assert_eq!(event.tenant_id, Some(tenant));
        match &event.payload {
            WebhookPayload::Transaction(transaction) => {
                assert_eq!(transaction.transaction_id, "820982911946154508");
                assert_eq!(transaction.total_amount, 108.25);
                assert_eq!(transaction.currency, "USD");
                assert_eq!(transaction.tax_lines.len(), 2);
                assert_eq!(transaction.tax_lines[1].rate, Some(0.02));
            }
            other => panic!("expected a normalized transaction, got {other:?}"),
        }
    }

    let received = next_matching(&mut events, |event| {
        matches!(event, GatewayEvent::WebhookReceived { .. })
    })
    .await;
    assert_eq!(received.name(), "webhook:received");

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(first_rx.try_recv().is_err(), "delivered twice");
    assert!(second_rx.try_recv().is_err(), "delivered twice");
    assert!(refunds_rx.try_recv().is_err(), "wrong handler type");

    let subscription = tg
        .gateway
        .records()
        .find_subscription(tenant, SYSTEM)
        .await
        .unwrap()
        .expect("subscription exists");
    assert!(subscription.last_processed_at.is_some());
    assert_eq!(subscription.failure_count, 0);

    tg.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn invalid_signature_is_logged_and_not_delivered() {
    let (handler, mut rx) = recorder();
    let tg = build_gateway_with(test_config(), ScriptedAdapter::new(SYSTEM), |builder| {
        builder.handler(StandardEventType::TransactionCreated, handler)
    });
    let tenant = Uuid::new_v4();
    subscribe(tg.records.as_ref(), tenant, SYSTEM).await.unwrap();
    let mut events = tg.gateway.subscribe_events();
    tg.gateway.start().await;

    let body = shopify_order().to_string().into_bytes();
    tg.gateway
        .receive_webhook(
            SYSTEM,
            "order.created",
            body,
            Some("sha256=deadbeef".to_string()),
            Some(tenant),
        )
        .expect("accepted for processing");

    next_matching(&mut events, |event| {
        matches!(event, GatewayEvent::HealthUpdated { .. })
    })
    .await;

    let now = Utc::now();
    let errors = tg
        .gateway
        .records()
        .errors_between(now - TimeDelta::hours(1), now + TimeDelta::hours(1))
        .await
        .unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, ErrorCode::WebhookInvalidSignature);
    assert_eq!(errors[0].tenant_id, Some(tenant));
    assert!(rx.try_recv().is_err());

    tg.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ten_failures_disable_the_integration_until_reenabled() {
    let (handler, mut rx) = recorder();
    let tg = build_gateway_with(test_config(), ScriptedAdapter::new(SYSTEM), |builder| {
        builder.handler(StandardEventType::TransactionCreated, handler)
    });
    let tenant = Uuid::new_v4();
    subscribe(tg.records.as_ref(), tenant, SYSTEM).await.unwrap();
    let mut events = tg.gateway.subscribe_events();
    tg.gateway.start().await;

    for _ in 0..10 {
        tg.gateway
            .receive_webhook(
                SYSTEM,
                "order.created",
                shopify_order().to_string().into_bytes(),
                Some("forged".to_string()),
                Some(tenant),
            )
            .unwrap();
    }

    let disabled = next_matching(&mut events, |event| {
        matches!(event, GatewayEvent::WebhookDisabled { .. })
    })
    .await;
    match disabled {
        GatewayEvent::WebhookDisabled {
            tenant_id,
            system,
            failure_count,
            ..
        } => {
            assert_eq!(tenant_id, tenant);
            assert_eq!(system, SYSTEM);
            assert_eq!(failure_count, 10);
        }
        other => panic!("unexpected event {other:?}"),
    }

    let rejected = tg
        .gateway
        .dispatch(SYSTEM, Some(tenant), 0, || async {
            Ok::<_, IntegrationError>(())
        })
        .await
        .expect_err("disabled pair rejects dispatch");
    assert_eq!(rejected.code, ErrorCode::IntegrationDisabled);

    // Correctly signed events are dropped while disabled.
    let (body, signature) = signed_body(SYSTEM, &shopify_order());
    tg.gateway
        .receive_webhook(SYSTEM, "order.created", body, Some(signature), Some(tenant))
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(rx.try_recv().is_err());

    assert!(tg.gateway.reenable_integration(tenant, SYSTEM).await.unwrap());
    let subscription = tg
        .gateway
        .records()
        .find_subscription(tenant, SYSTEM)
        .await
        .unwrap()
        .expect("subscription exists");
    assert!(subscription.active);
    assert_eq!(subscription.failure_count, 0);

    tg.gateway
        .dispatch(SYSTEM, Some(tenant), 0, || async {
            Ok::<_, IntegrationError>(())
        })
        .await
        .expect("re-enabled pair dispatches");

    tg.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unsubscribed_events_skip_signatures_and_keep_raw_payloads() {
    let (handler, mut rx) = recorder();
    let tg = build_gateway_with(test_config(), ScriptedAdapter::new(SYSTEM), |builder| {
        builder.handler(StandardEventType::SyncCompleted, handler)
    });
    tg.gateway.start().await;

    let body = json!({ "locations": 3, "orders": 118 });
    tg.gateway
        .receive_webhook(SYSTEM, "sync.completed", body.to_string().into_bytes(), None, None)
        .unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, StandardEventType::SyncCompleted);
    assert_eq!(event.payload, WebhookPayload::Raw(body));

    tg.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn unparseable_transactions_fall_back_to_raw() {
    let (handler, mut rx) = recorder();
    let tg = build_gateway_with(test_config(), ScriptedAdapter::new(SYSTEM), |builder| {
        builder
            .handler(StandardEventType::TransactionUpdated, Arc::new(FailingHandler))
            .handler(StandardEventType::TransactionUpdated, handler)
    });
    let tenant = Uuid::new_v4();
    subscribe(tg.records.as_ref(), tenant, SYSTEM).await.unwrap();
    tg.gateway.start().await;

    let order = json!({ "created_at": "2024-05-01T10:00:00Z", "total_price": "5.00" });
    let (body, signature) = signed_body(SYSTEM, &order);
    tg.gateway
        .receive_webhook(SYSTEM, "orders/updated", body, Some(signature), Some(tenant))
        .unwrap();

    let event = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.event_type, StandardEventType::TransactionUpdated);
    assert_eq!(event.payload, WebhookPayload::Raw(order));

    tg.gateway.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_with_retryable_error() {
    let mut config = test_config();
    config.webhooks.queue_capacity = 2;
    let tg = build_gateway_with(config, ScriptedAdapter::new(SYSTEM), |builder| builder);

    // Workers are not started, so nothing drains the queue.
    for _ in 0..2 {
        tg.gateway
            .receive_webhook(SYSTEM, "order.created", b"{}".to_vec(), None, None)
            .unwrap();
    }
    assert_eq!(tg.gateway.webhook_backlog(), 2);

    let err = tg
        .gateway
        .receive_webhook(SYSTEM, "order.created", b"{}".to_vec(), None, None)
        .expect_err("queue is full");
    assert_eq!(err.code, ErrorCode::QueueUnavailable);
    assert!(err.retryable);
}
