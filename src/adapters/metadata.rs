//! Adapter metadata.

use serde::{Deserialize, Serialize};

use crate::adapters::signing::SignatureScheme;
use crate::systems::ExternalSystemType;

/// Authentication type used by a system's API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    OAuth2,
    ApiKey,
    Basic,
    Bearer,
    Custom(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterMetadata {
    pub system: ExternalSystemType,
    pub auth_type: AuthType,
    pub signature_scheme: SignatureScheme,
    /// Whether the system pushes events to the gateway.
    pub webhooks: bool,
}

impl AdapterMetadata {
    pub fn new(system: ExternalSystemType, auth_type: AuthType) -> Self {
        Self {
            system,
            auth_type,
            signature_scheme: system.signature_scheme(),
            webhooks: true,
        }
    }

    pub fn without_webhooks(mut self) -> Self {
        self.webhooks = false;
        self
    }
}
