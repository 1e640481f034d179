//! # gatehouse
//!
//! Multi-tenant service gateway engine. Every consumer request to
//! `ANY /api/v1/gw/{connector}/{path...}` is authenticated, resolved
//! against the connector catalog, policy-checked (rate limits, quotas,
//! IP allowlists, endpoint scoping, size caps), validated, optionally
//! served from the response cache, enriched with tenant-owned upstream
//! credentials, transformed, and proxied to the upstream service with
//! bounded retries and SSE passthrough. Every request produces exactly
//! one usage record, flushed in batches by a background writer.
//!
//! ## Example
//!
//! ```rust,no_run
//! use gatehouse::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     init_tracing(&config);
//!
//!     let sink = Arc::new(JsonlUsageSink::new(config.usage.log_path.clone()));
//!     let state = AppState::from_config(config)?;
//!
//!     Server::new(state).serve(sink).await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod body;
pub mod cache;
pub mod catalog;
pub mod client_ip;
pub mod config;
pub mod error;
pub mod health;
pub mod observability;
pub mod pipeline;
pub mod policy;
pub mod resolver;
pub mod respond;
pub mod secrets;
pub mod server;
pub mod state;
pub mod transform;
pub mod upstream;
pub mod usage;
pub mod validate;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::auth::{AuthPrincipalStore, CallerType, Principal, StaticAuthStore};
    pub use crate::catalog::{Connector, ConnectorCatalog, Endpoint, StaticCatalog};
    pub use crate::config::Config;
    pub use crate::error::{Error, Result};
    pub use crate::observability::init_tracing;
    pub use crate::secrets::{EnvSecretStore, SecretStore};
    pub use crate::server::{build_router, Server};
    pub use crate::state::AppState;
    pub use crate::usage::{JsonlUsageSink, UsageRecord, UsageSink};
}
