//! Sealed credential repository

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, IntoActiveModel, QueryFilter,
    Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::adapters::Credentials;
use crate::crypto::{CryptoKey, is_sealed, open_credentials, seal_credentials};
use crate::models::integration_credential::{self, Column, Entity as IntegrationCredentials};
use crate::systems::ExternalSystemType;

#[derive(Debug, Clone)]
pub struct CredentialRepository {
    pub db: Arc<DatabaseConnection>,
    pub crypto_key: CryptoKey,
}

impl CredentialRepository {
    pub fn new(db: Arc<DatabaseConnection>, crypto_key: CryptoKey) -> Self {
        Self { db, crypto_key }
    }

    async fn find_model(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<integration_credential::Model>> {
        Ok(IntegrationCredentials::find()
            .filter(Column::TenantId.eq(tenant_id))
            .filter(Column::System.eq(system.as_str()))
            .one(&*self.db)
            .await?)
    }

    pub async fn load(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
    ) -> Result<Option<Credentials>> {
        let Some(model) = self.find_model(tenant_id, system).await? else {
            return Ok(None);
        };

        if !is_sealed(&model.sealed) {
            tracing::warn!(
                tenant_id = %tenant_id,
                system = %system,
                "Plaintext credentials found, they will be sealed on next save"
            );
        }

        open_credentials(&self.crypto_key, tenant_id, system, &model.sealed)
            .map(Some)
            .map_err(|e| {
                tracing::error!(tenant_id = %tenant_id, system = %system, "Credential decryption failed");
                anyhow!("credential decryption failed: {e}")
            })
    }

    pub async fn save(
        &self,
        tenant_id: Uuid,
        system: ExternalSystemType,
        credentials: &Credentials,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let sealed = seal_credentials(&self.crypto_key, tenant_id, system, credentials)
            .map_err(|e| anyhow!("credential encryption failed: {e}"))?;
        let now = now.fixed_offset();

        match self.find_model(tenant_id, system).await? {
            Some(existing) => {
                let mut active = existing.into_active_model();
                active.sealed = Set(sealed);
                active.updated_at = Set(now);
                active.update(&*self.db).await?;
            }
            None => {
                integration_credential::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    tenant_id: Set(tenant_id),
                    system: Set(system.as_str().to_string()),
                    sealed: Set(sealed),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(&*self.db)
                .await?;
            }
        }
        Ok(())
    }
}
