//! # POS Integration Gateway
//!
//! Mediates between the platform and third-party point-of-sale back-ends: a
//! rate-limited dispatcher for outbound calls, a webhook ingestion pipeline, a recovery
//! engine for classified failures and a normalizer producing standardized transactions.

pub mod adapters;
pub mod clock;
pub mod config;
pub mod crypto;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod models;
pub mod normalization;
pub mod recovery;
pub mod repositories;
pub mod store;
pub mod systems;
pub mod telemetry;
pub mod webhooks;
pub use migration;

pub use error::{ErrorCode, IntegrationError};
pub use gateway::{Gateway, GatewayBuilder};
pub use systems::{ExternalSystemType, RateLimit};
