//! Process-local [`RecordStore`] used by tests and single-node development runs.

use std::collections::HashMap;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::RecordStore;
use crate::adapters::Credentials;
use crate::recovery::{ErrorRecord, RecoveryAction, RecoveryKind};
use crate::systems::ExternalSystemType;
use crate::webhooks::{NewSubscription, WebhookSubscription};

type PairKey = (Uuid, ExternalSystemType);

#[derive(Debug, Default)]
struct Tables {
    subscriptions: HashMap<PairKey, WebhookSubscription>,
    errors: Vec<ErrorRecord>,
    actions: Vec<RecoveryAction>,
    credentials: HashMap<PairKey, Credentials>,
}

#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    tables: Mutex<Tables>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn upsert_subscription(
        &self,
        new: NewSubscription,
        now: DateTime<Utc>,
    ) -> Result<WebhookSubscription> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .subscriptions
            .entry((new.tenant_id, new.system))
            .or_insert_with(|| WebhookSubscription {
                id: Uuid::new_v4(),
                tenant_id: new.tenant_id,
                system: new.system,
                webhook_url: String::new(),
                events: Vec::new(),
                secret_key: String::new(),
                active: true,
                failure_count: 0,
                last_processed_at: None,
                created_at: now,
                updated_at: now,
            });

        entry.webhook_url = new.webhook_url;
        entry.events = new.events;
        entry.secret_key = new.secret_key;
        entry.active = true;
        entry.failure_count = 0;
        entry.updated_at = now;
        Ok(entry.clone())
    }

    async fn find_subscription(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<WebhookSubscription>> {
        let tables = self.tables.lock().await;
        Ok(tables.subscriptions.get(&(tenant_id, system)).cloned())
    }

    async fn increment_failure_count(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let mut tables = self.tables.lock().await;
        Ok(tables
            .subscriptions
            .get_mut(&(tenant_id, system))
            .map(|subscription| {
                subscription.failure_count += 1;
                subscription.updated_at = now;
                subscription.failure_count
            }))
    }

    async fn set_subscription_active(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        active: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        let Some(subscription) = tables.subscriptions.get_mut(&(tenant_id, system)) else {
            return Ok(false);
        };
        subscription.active = active;
        if active {
            subscription.failure_count = 0;
        }
        subscription.updated_at = now;
        Ok(true)
    }

    async fn mark_processed(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.subscriptions.get_mut(&(tenant_id, system)) {
            Some(subscription) if subscription.active => {
                subscription.last_processed_at = Some(now);
                subscription.failure_count = 0;
                subscription.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_error(&self, record: &ErrorRecord) -> Result<()> {
        self.tables.lock().await.errors.push(record.clone());
        Ok(())
    }

    async fn errors_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<ErrorRecord>> {
        let tables = self.tables.lock().await;
        let mut found: Vec<_> = tables
            .errors
            .iter()
            .filter(|record| record.occurred_at >= start && record.occurred_at < end)
            .cloned()
            .collect();
        found.sort_by_key(|record| record.occurred_at);
        Ok(found)
    }

    async fn insert_recovery_action(&self, action: &RecoveryAction) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.actions.iter().any(|existing| existing.id == action.id) {
            return Err(anyhow!("recovery action {} already exists", action.id));
        }
        tables.actions.push(action.clone());
        Ok(())
    }

    async fn update_recovery_action(&self, action: &RecoveryAction) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let existing = tables
            .actions
            .iter_mut()
            .find(|existing| existing.id == action.id)
            .ok_or_else(|| anyhow!("recovery action {} not found", action.id))?;
        *existing = action.clone();
        Ok(())
    }

    async fn find_open_recovery_action(
        &self,
        tenant_id: Option<Uuid>,
        system: ExternalSystemType,
        kind: RecoveryKind,
    ) -> Result<Option<RecoveryAction>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .actions
            .iter()
            .filter(|action| {
                action.tenant_id == tenant_id
                    && action.system == system
                    && action.kind == kind
                    && action.is_open()
            })
            .max_by_key(|action| action.created_at)
            .cloned())
    }

    async fn retire_recovery_actions(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let mut tables = self.tables.lock().await;
        let mut retired = 0;
        for action in tables.actions.iter_mut().filter(|action| {
            action.tenant_id == Some(tenant_id) && action.system == system && action.is_open()
        }) {
            action.retire(now);
            retired += 1;
        }
        Ok(retired)
    }

    async fn due_recovery_actions(
        &self,
        now: DateTime<Utc>,
        limit: u64,
    ) -> Result<Vec<RecoveryAction>> {
        let tables = self.tables.lock().await;
        let mut due: Vec<_> = tables
            .actions
            .iter()
            .filter(|action| action.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|action| action.scheduled_at);
        due.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(due)
    }

    async fn recovery_actions_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<RecoveryAction>> {
        let tables = self.tables.lock().await;
        let mut found: Vec<_> = tables
            .actions
            .iter()
            .filter(|action| action.created_at >= start && action.created_at < end)
            .cloned()
            .collect();
        found.sort_by_key(|action| action.created_at);
        Ok(found)
    }

    async fn load_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<Credentials>> {
        let tables = self.tables.lock().await;
        Ok(tables.credentials.get(&(tenant_id, system)).cloned())
    }

    async fn save_credentials(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        credentials: &Credentials,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        self.tables
            .lock()
            .await
            .credentials
            .insert((tenant_id, system), credentials.clone());
        Ok(())
    }
}
