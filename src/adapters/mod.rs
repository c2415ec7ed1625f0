//! POS adapters.
//!
//! Each system is reached through a [`PosAdapter`] held in an [`AdapterRegistry`].

pub mod credentials;
pub mod metadata;
pub mod registry;
pub mod signing;
pub mod trait_;
pub mod webhook_only;

pub use credentials::Credentials;
pub use metadata::{AdapterMetadata, AuthType};
pub use registry::{AdapterRegistry, RegistryError};
pub use signing::{SignatureError, SignatureScheme};
pub use trait_::{AdapterFailure, PosAdapter, WebhookSetup};
pub use webhook_only::{WebhookOnlyAdapter, register_webhook_only_adapters};
