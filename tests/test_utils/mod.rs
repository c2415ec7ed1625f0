//! Test utilities for gateway integration tests.
//!
//! Provides an in-memory SQLite database with migrations applied, a scriptable POS
//! adapter and builders for gateways running over the in-memory stores. Gateways use a
//! [`TokioClock`] so tests on a paused runtime drive every timer themselves.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use migration::{Migrator, MigratorTrait};
use pos_gateway::adapters::{
    AdapterMetadata, AuthType, Credentials, PosAdapter, WebhookSetup, signing,
};
use pos_gateway::clock::TokioClock;
use pos_gateway::config::AppConfig;
use pos_gateway::normalization::{
    LocationInfo, StandardizedTransaction, TransformSchema, transform,
};
use pos_gateway::repositories::{InMemoryRecordStore, RecordStore};
use pos_gateway::store::InMemoryMetricsStore;
use pos_gateway::webhooks::{NewSubscription, WebhookSubscription};
use pos_gateway::{ExternalSystemType, Gateway, GatewayBuilder, IntegrationError};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, Statement};
use serde_json::Value;
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

/// Sets up an in-memory SQLite database with all migrations applied.
pub async fn setup_test_db() -> Result<DatabaseConnection> {
    let db = Database::connect("sqlite::memory:").await?;

    Migrator::up(&db, None).await?;

    // SQLite does not enforce our Postgres foreign key semantics; disable FK checks to
    // allow inserting fixture rows independently.
    db.execute(Statement::from_string(
        db.get_database_backend(),
        "PRAGMA foreign_keys = OFF".to_string(),
    ))
    .await?;

    Ok(db)
}

#[allow(dead_code)]
pub async fn setup_test_db_arc() -> Result<Arc<DatabaseConnection>> {
    Ok(Arc::new(setup_test_db().await?))
}

/// Default configuration with a crypto key and deterministic retry delays.
#[allow(dead_code)]
pub fn test_config() -> AppConfig {
    let mut config = AppConfig {
        crypto_key: Some(vec![7u8; 32]),
        ..AppConfig::default()
    };
    config.dispatcher.retry.jitter_factor = 0.0;
    config
}

/// Adapter whose behaviour is scripted per test.
#[derive(Debug)]
pub struct ScriptedAdapter {
    system: ExternalSystemType,
    schema: TransformSchema,
    connection_ok: bool,
    auth_failures: AtomicU32,
    auth_calls: Mutex<Vec<Instant>>,
    transactions: Vec<StandardizedTransaction>,
}

#[allow(dead_code)]
impl ScriptedAdapter {
    pub fn new(system: ExternalSystemType) -> Self {
        Self {
            system,
            schema: TransformSchema::default_for(system, system.default_amount_convention()),
            connection_ok: true,
            auth_failures: AtomicU32::new(0),
            auth_calls: Mutex::new(Vec::new()),
            transactions: Vec::new(),
        }
    }

    /// The next `times` credential refreshes are rejected.
    pub fn failing_auth(self, times: u32) -> Self {
        self.auth_failures.store(times, Ordering::SeqCst);
        self
    }

    pub fn rejecting_connection(mut self) -> Self {
        self.connection_ok = false;
        self
    }

    pub fn with_transactions(mut self, transactions: Vec<StandardizedTransaction>) -> Self {
        self.transactions = transactions;
        self
    }

    pub fn metadata(&self) -> AdapterMetadata {
        AdapterMetadata::new(self.system, AuthType::OAuth2)
    }

    /// Instants at which `authenticate` was invoked.
    pub fn auth_calls(&self) -> Vec<Instant> {
        self.auth_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl PosAdapter for ScriptedAdapter {
    fn system(&self) -> ExternalSystemType {
        self.system
    }

    async fn test_connection(&self, _credentials: &Credentials) -> Result<bool, IntegrationError> {
        Ok(self.connection_ok)
    }

    async fn authenticate(
        &self,
        credentials: &Credentials,
    ) -> Result<Credentials, IntegrationError> {
        self.auth_calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Instant::now());
        let reject = self
            .auth_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if reject {
            return Err(IntegrationError::auth("refresh token rejected"));
        }
        Ok(Credentials {
            access_token: Some("renewed-access-token".to_string()),
            ..credentials.clone()
        })
    }

    async fn get_locations(
        &self,
        _credentials: &Credentials,
    ) -> Result<Vec<LocationInfo>, IntegrationError> {
        Ok(Vec::new())
    }

    async fn get_transactions(
        &self,
        _credentials: &Credentials,
        _location_id: &str,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
    ) -> Result<Vec<StandardizedTransaction>, IntegrationError> {
        Ok(self.transactions.clone())
    }

    async fn setup_webhooks(
        &self,
        _credentials: &Credentials,
        url: &Url,
    ) -> Result<WebhookSetup, IntegrationError> {
        Ok(WebhookSetup {
            endpoint: url.clone(),
            events: vec!["order.created".to_string(), "order.updated".to_string()],
            secret_key: WEBHOOK_SECRET.to_string(),
        })
    }

    fn validate_webhook(&self, payload: &[u8], signature: &str, secret: &str) -> bool {
        signing::is_valid(self.system.signature_scheme(), payload, signature, secret)
    }

    fn transform_raw_data(
        &self,
        payload: &Value,
    ) -> Result<StandardizedTransaction, IntegrationError> {
        transform(payload, &self.schema)
    }
}

/// A gateway plus handles on the pieces tests inspect directly.
pub struct TestGateway {
    pub gateway: Gateway,
    pub adapter: Arc<ScriptedAdapter>,
    pub metrics: Arc<InMemoryMetricsStore>,
    pub records: Arc<InMemoryRecordStore>,
}

#[allow(dead_code)]
pub fn build_gateway(config: AppConfig, adapter: ScriptedAdapter) -> TestGateway {
    build_gateway_with(config, adapter, |builder| builder)
}

/// Like [`build_gateway`], letting the caller register handlers or swap parts first.
#[allow(dead_code)]
pub fn build_gateway_with(
    config: AppConfig,
    adapter: ScriptedAdapter,
    customize: impl FnOnce(GatewayBuilder) -> GatewayBuilder,
) -> TestGateway {
    let adapter = Arc::new(adapter);
    let metrics = Arc::new(InMemoryMetricsStore::new());
    let records = Arc::new(InMemoryRecordStore::new());

    let builder = Gateway::builder(config)
        .metrics_store(metrics.clone())
        .record_store(records.clone())
        .clock(Arc::new(TokioClock::new()))
        .adapter(adapter.clone(), adapter.metadata());

    TestGateway {
        gateway: customize(builder).build(),
        adapter,
        metrics,
        records,
    }
}

/// Stores an active subscription signed with [`WEBHOOK_SECRET`].
#[allow(dead_code)]
pub async fn subscribe(
    records: &dyn RecordStore,
    tenant_id: Uuid,
    system: ExternalSystemType,
) -> Result<WebhookSubscription> {
    records
        .upsert_subscription(
            NewSubscription {
                tenant_id,
                system,
                webhook_url: "https://gateway.test/webhooks".to_string(),
                events: vec!["order.created".to_string()],
                secret_key: WEBHOOK_SECRET.to_string(),
            },
            Utc::now(),
        )
        .await
}

/// Serializes `body` and signs it the way `system` would.
#[allow(dead_code)]
pub fn signed_body(system: ExternalSystemType, body: &Value) -> (Vec<u8>, String) {
    let bytes = body.to_string().into_bytes();
    let signature = signing::sign(system.signature_scheme(), &bytes, WEBHOOK_SECRET);
    (bytes, signature)
}
