//! SeaORM-backed record store against an in-memory SQLite database.

use chrono::{TimeDelta, Utc};
use pos_gateway::adapters::Credentials;
use pos_gateway::crypto::{CryptoKey, is_sealed};
use pos_gateway::models::IntegrationCredential;
use pos_gateway::recovery::{
    ErrorRecord, FailureReport, RecoveryAction, RecoveryKind,
};
use pos_gateway::repositories::{RecordStore, SeaOrmRecordStore};
use pos_gateway::webhooks::NewSubscription;
use pos_gateway::{ErrorCode, ExternalSystemType, IntegrationError};
use sea_orm::EntityTrait;
use serde_json::json;
use uuid::Uuid;

mod test_utils;
use test_utils::{WEBHOOK_SECRET, setup_test_db_arc, subscribe};

async fn store() -> (SeaOrmRecordStore, std::sync::Arc<sea_orm::DatabaseConnection>) {
    let db = setup_test_db_arc().await.expect("sqlite");
    let key = CryptoKey::new(vec![7u8; 32]).expect("32 byte key");
    (SeaOrmRecordStore::new(db.clone(), key), db)
}

#[tokio::test]
async fn subscription_lifecycle() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Clover;

    let created = subscribe(&store, tenant, system).await.unwrap();
    assert!(created.active);
    assert_eq!(created.failure_count, 0);
    assert_eq!(created.secret_key, WEBHOOK_SECRET);
    assert_eq!(created.events, vec!["order.created".to_string()]);

    for expected in 1..=3 {
        let count = store
            .increment_failure_count(tenant, system, Utc::now())
            .await
            .unwrap();
        assert_eq!(count, Some(expected));
    }

    assert!(
        store
            .set_subscription_active(tenant, system, false, Utc::now())
            .await
            .unwrap()
    );
    // Inactive subscriptions are not marked as processed.
    assert!(!store.mark_processed(tenant, system, Utc::now()).await.unwrap());
    let disabled = store.find_subscription(tenant, system).await.unwrap().unwrap();
    assert!(!disabled.active);
    assert_eq!(disabled.failure_count, 3);
    assert!(disabled.last_processed_at.is_none());

    // Re-onboarding replaces the row and clears the failure history.
    let replaced = store
        .upsert_subscription(
            NewSubscription {
                tenant_id: tenant,
                system,
                webhook_url: "https://gateway.test/hooks/clover".to_string(),
                events: vec!["order.created".to_string(), "order.updated".to_string()],
                secret_key: "rotated".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(replaced.id, created.id);
    assert!(replaced.active);
    assert_eq!(replaced.failure_count, 0);
    assert_eq!(replaced.secret_key, "rotated");
    assert_eq!(replaced.events.len(), 2);

    assert!(store.mark_processed(tenant, system, Utc::now()).await.unwrap());
    let processed = store.find_subscription(tenant, system).await.unwrap().unwrap();
    assert!(processed.last_processed_at.is_some());
}

#[tokio::test]
async fn reactivation_clears_failures() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Toast;
    subscribe(&store, tenant, system).await.unwrap();

    store
        .increment_failure_count(tenant, system, Utc::now())
        .await
        .unwrap();
    store
        .set_subscription_active(tenant, system, false, Utc::now())
        .await
        .unwrap();
    store
        .set_subscription_active(tenant, system, true, Utc::now())
        .await
        .unwrap();

    let subscription = store.find_subscription(tenant, system).await.unwrap().unwrap();
    assert!(subscription.active);
    assert_eq!(subscription.failure_count, 0);
}

#[tokio::test]
async fn missing_subscriptions_are_reported_as_absent() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Lightspeed;

    assert!(store.find_subscription(tenant, system).await.unwrap().is_none());
    assert_eq!(
        store
            .increment_failure_count(tenant, system, Utc::now())
            .await
            .unwrap(),
        None
    );
    assert!(
        !store
            .set_subscription_active(tenant, system, true, Utc::now())
            .await
            .unwrap()
    );
    assert!(!store.mark_processed(tenant, system, Utc::now()).await.unwrap());
}

#[tokio::test]
async fn errors_are_queried_by_time_window() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let now = Utc::now();

    let old = ErrorRecord::from_report(
        &FailureReport::dispatch(
            ExternalSystemType::Square,
            Some(tenant),
            IntegrationError::from_http_status(503, "unavailable", None),
        ),
        now - TimeDelta::hours(3),
    );
    let recent = ErrorRecord::from_report(
        &FailureReport::webhook(
            ExternalSystemType::Shopify,
            None,
            IntegrationError::validation("missing id").with_details(json!({ "field": "id" })),
        ),
        now - TimeDelta::minutes(5),
    );
    store.append_error(&old).await.unwrap();
    store.append_error(&recent).await.unwrap();

    let last_hour = store
        .errors_between(now - TimeDelta::hours(1), now)
        .await
        .unwrap();
    assert_eq!(last_hour.len(), 1);
    let found = &last_hour[0];
    assert_eq!(found.id, recent.id);
    assert_eq!(found.system, ExternalSystemType::Shopify);
    assert_eq!(found.code, ErrorCode::ValidationError);
    assert_eq!(found.tenant_id, None);
    assert!(!found.retryable);
    assert_eq!(found.details, Some(json!({ "field": "id" })));

    let all = store
        .errors_between(now - TimeDelta::days(1), now)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].id, old.id, "oldest first");
    assert_eq!(all[0].http_status, Some(503));
}

#[tokio::test]
async fn recovery_actions_track_open_and_due_work() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Square;
    let now = Utc::now();

    let late = RecoveryAction::new(
        RecoveryKind::Retry,
        Some(tenant),
        system,
        5,
        now - TimeDelta::seconds(10),
        now - TimeDelta::seconds(30),
    );
    let early = RecoveryAction::new(
        RecoveryKind::ResetConnection,
        None,
        system,
        2,
        now - TimeDelta::seconds(60),
        now - TimeDelta::seconds(60),
    )
    .with_error_code(ErrorCode::ServerError);
    let future = RecoveryAction::new(
        RecoveryKind::RefreshToken,
        Some(tenant),
        system,
        3,
        now + TimeDelta::minutes(2),
        now,
    );
    for action in [&late, &early, &future] {
        store.insert_recovery_action(action).await.unwrap();
    }

    let due = store.due_recovery_actions(now, 10).await.unwrap();
    let ids: Vec<_> = due.iter().map(|action| action.id).collect();
    assert_eq!(ids, vec![early.id, late.id]);
    assert_eq!(due[0].error_code, Some(ErrorCode::ServerError));
    assert_eq!(due[0].tenant_id, None);

    let limited = store.due_recovery_actions(now, 1).await.unwrap();
    assert_eq!(limited.len(), 1);
    assert_eq!(limited[0].id, early.id);

    let open = store
        .find_open_recovery_action(None, system, RecoveryKind::ResetConnection)
        .await
        .unwrap()
        .expect("tenantless action found");
    assert_eq!(open.id, early.id);
    assert!(
        store
            .find_open_recovery_action(Some(tenant), system, RecoveryKind::ResetConnection)
            .await
            .unwrap()
            .is_none()
    );

    // Exhausted actions stay open but are no longer due.
    let mut exhausted = early.clone();
    exhausted.attempts = exhausted.max_attempts;
    exhausted.last_attempt_at = Some(now);
    exhausted.last_error = Some("connection reset".to_string());
    store.update_recovery_action(&exhausted).await.unwrap();
    let due = store.due_recovery_actions(now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, late.id);
    let still_open = store
        .find_open_recovery_action(None, system, RecoveryKind::ResetConnection)
        .await
        .unwrap()
        .expect("exhausted action still open");
    assert!(still_open.is_exhausted());
    assert_eq!(still_open.last_error.as_deref(), Some("connection reset"));

    let mut succeeded = late.clone();
    succeeded.attempts = 1;
    succeeded.success = true;
    store.update_recovery_action(&succeeded).await.unwrap();
    assert!(
        store
            .find_open_recovery_action(Some(tenant), system, RecoveryKind::Retry)
            .await
            .unwrap()
            .is_none()
    );
    assert!(store.due_recovery_actions(now, 10).await.unwrap().is_empty());

    let created = store
        .recovery_actions_between(now - TimeDelta::seconds(45), now + TimeDelta::seconds(1))
        .await
        .unwrap();
    let mut created_ids: Vec<_> = created.iter().map(|action| action.id).collect();
    created_ids.sort();
    let mut expected = vec![late.id, future.id];
    expected.sort();
    assert_eq!(created_ids, expected);
}

#[tokio::test]
async fn credentials_are_sealed_at_rest() {
    let (store, db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Shopify;
    let credentials = Credentials {
        refresh_token: Some("shpat_refresh".to_string()),
        merchant_id: Some("coffee-co.myshopify.com".to_string()),
        ..Credentials::with_access_token("shpat_access")
    };

    assert!(store.load_credentials(tenant, system).await.unwrap().is_none());
    store
        .save_credentials(tenant, system, &credentials, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        store.load_credentials(tenant, system).await.unwrap(),
        Some(credentials.clone())
    );

    let rows = IntegrationCredential::find().all(&*db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(is_sealed(&rows[0].sealed));
    let raw = String::from_utf8_lossy(&rows[0].sealed);
    assert!(!raw.contains("shpat_access"));

    let rotated = Credentials {
        access_token: Some("shpat_rotated".to_string()),
        ..credentials
    };
    store
        .save_credentials(tenant, system, &rotated, Utc::now())
        .await
        .unwrap();
    assert_eq!(
        store.load_credentials(tenant, system).await.unwrap(),
        Some(rotated)
    );
    assert_eq!(IntegrationCredential::find().all(&*db).await.unwrap().len(), 1);

    // Another tenant's row is never returned.
    assert!(
        store
            .load_credentials(Uuid::new_v4(), system)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn retiring_closes_open_actions_for_the_pair() {
    let (store, _db) = store().await;
    let tenant = Uuid::new_v4();
    let system = ExternalSystemType::Square;
    let now = Utc::now();

    let mut exhausted = RecoveryAction::new(RecoveryKind::RefreshToken, Some(tenant), system, 3, now, now);
    exhausted.attempts = 3;
    let pending = RecoveryAction::new(RecoveryKind::Retry, Some(tenant), system, 5, now, now);
    let other_tenant = RecoveryAction::new(RecoveryKind::Retry, Some(Uuid::new_v4()), system, 5, now, now);
    let mut done = RecoveryAction::new(RecoveryKind::ResetConnection, Some(tenant), system, 2, now, now);
    done.success = true;
    for action in [&exhausted, &pending, &other_tenant, &done] {
        store.insert_recovery_action(action).await.unwrap();
    }

    let retired = store
        .retire_recovery_actions(tenant, system, now)
        .await
        .unwrap();
    assert_eq!(retired, 2);

    for kind in [RecoveryKind::RefreshToken, RecoveryKind::Retry] {
        assert!(
            store
                .find_open_recovery_action(Some(tenant), system, kind)
                .await
                .unwrap()
                .is_none()
        );
    }
    let due = store.due_recovery_actions(now, 10).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, other_tenant.id);

    let all = store
        .recovery_actions_between(now - TimeDelta::seconds(1), now + TimeDelta::seconds(1))
        .await
        .unwrap();
    let closed = all.iter().find(|action| action.id == exhausted.id).unwrap();
    assert!(closed.retired_at.is_some());
    assert!(!closed.is_open());
    let succeeded = all.iter().find(|action| action.id == done.id).unwrap();
    assert!(succeeded.retired_at.is_none());
}
