//! # Repository Layer
//!
//! Durable state behind the [`RecordStore`] trait: webhook subscriptions, the error
//! log, recovery actions and sealed credentials. [`SeaOrmRecordStore`] composes the
//! per-table repositories; [`InMemoryRecordStore`] backs single-process tests.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::DatabaseConnection;
use uuid::Uuid;

use crate::adapters::Credentials;
use crate::crypto::CryptoKey;
use crate::recovery::{ErrorRecord, RecoveryAction, RecoveryKind};
use crate::systems::ExternalSystemType;
use crate::webhooks::{NewSubscription, WebhookSubscription};

pub mod credential;
pub mod integration_error;
pub mod memory;
pub mod recovery_action;
pub mod subscription;

pub use credential::CredentialRepository;
pub use integration_error::IntegrationErrorRepository;
pub use memory::InMemoryRecordStore;
pub use recovery_action::RecoveryActionRepository;
pub use subscription::SubscriptionRepository;

#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Creates or replaces the subscription for (tenant, system), leaving it active
    /// with no recorded failures.
    async fn upsert_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription>;

    async fn find_subscription(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<WebhookSubscription>>;

    /// Returns the new failure count, or `None` when no subscription exists.
    async fn increment_failure_count(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>>;

    async fn set_subscription_active(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn mark_processed(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn append_error(&self, record: &ErrorRecord) -> Result<()>;

    async fn errors_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorRecord>>;

    async fn insert_recovery_action(&self, action: &RecoveryAction) -> Result<()>;

    async fn update_recovery_action(&self, action: &RecoveryAction) -> Result<()>;

    async fn find_open_recovery_action(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        kind: RecoveryKind,
    ) -> Result<Option<RecoveryAction>>;

    /// Retires every open action for the pair.
    async fn retire_recovery_actions(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<u64>;

    /// Pending actions scheduled at or before `now`, earliest first.
    async fn due_recovery_actions(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<RecoveryAction>>;

    async fn recovery_actions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecoveryAction>>;

    async fn load_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<Credentials>>;

    async fn save_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SeaOrmRecordStore {
    subscriptions: SubscriptionRepository,
    errors: IntegrationErrorRepository,
    actions: RecoveryActionRepository,
    credentials: CredentialRepository,
}

impl SeaOrmRecordStore {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self {
            subscriptions: SubscriptionRepository::new(db.clone()),
            errors: IntegrationErrorRepository::new(db.clone()),
            actions: RecoveryActionRepository::new(db.clone()),
            credentials: CredentialRepository::new(db, crypto_key),
        }
    }
}

#[async_trait]
impl RecordStore for SeaOrmRecordStore {
    async fn upsert_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription> {
        self.subscriptions.upsert(new, now).await
    }

    async fn find_subscription(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<WebhookSubscription>> {
        self.subscriptions.find(tenant_id, system).await
    }

    async fn increment_failure_count(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        self.subscriptions
            .increment_failure_count(tenant_id, system, now)
            .await
    }

    async fn set_subscription_active(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.subscriptions
            .set_active(tenant_id, system, active, now)
            .await
    }

    async fn mark_processed(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        self.subscriptions
            .mark_processed(tenant_id, system, now)
            .await
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<()> {
        self.errors.append(record).await
    }

    async fn errors_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorRecord>> {
        self.errors.between(start, end).await
    }

    async fn insert_recovery_action(&self, action: &RecoveryAction) -> Result<()> {
        self.actions.insert(action).await
    }

    async fn update_recovery_action(&self, action: &RecoveryAction) -> Result<()> {
        self.actions.update(action).await
    }

    async fn find_open_recovery_action(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        kind: RecoveryKind,
    ) -> Result<Option<RecoveryAction>> {
        self.actions.find_open(tenant_id, system, kind).await
    }

    async fn retire_recovery_actions(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        self.actions.retire_open(tenant_id, system, now).await
    }

    async fn due_recovery_actions(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<RecoveryAction>> {
        self.actions.due(now, limit).await
    }

    async fn recovery_actions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecoveryAction>> {
        self.actions.created_between(start, end).await
    }

    async fn load_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<Credentials>> {
        self.credentials.load(tenant_id, system).await
    }

    async fn save_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.credentials
            .save(tenant_id, system, credentials, now)
            .await
    }
}
