//! Application state shared across handlers
//!
//! All stateful components are process singletons created once at boot:
//! the resolver (over the connector catalog), the auth and secret stores,
//! the response cache, the policy engine, the upstream client, and the
//! usage buffer. Handlers receive a cheap clone per request.

use std::sync::Arc;

use crate::auth::{AuthPrincipalStore, StaticAuthStore};
use crate::cache::ResponseCache;
use crate::catalog::{ConnectorCatalog, StaticCatalog};
use crate::config::Config;
use crate::error::Result;
use crate::policy::PolicyEngine;
use crate::resolver::Resolver;
use crate::secrets::{EnvSecretStore, SecretStore};
use crate::upstream::UpstreamClient;
use crate::usage::UsageBuffer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    resolver: Arc<Resolver>,
    auth: Arc<dyn AuthPrincipalStore>,
    secrets: Arc<dyn SecretStore>,
    cache: Arc<ResponseCache>,
    policy: Arc<PolicyEngine>,
    upstream: Arc<UpstreamClient>,
    usage: UsageBuffer,
}

impl AppState {
    /// Build state with the built-in collaborators: static catalog and
    /// auth store from config, environment-backed secrets
    pub fn from_config(config: Config) -> Result<Self> {
        let catalog = Arc::new(StaticCatalog::new(config.connectors.clone())?);
        let auth = Arc::new(StaticAuthStore::new(
            config.auth.api_keys.clone(),
            config.auth.jwt_secret.as_deref(),
        )?);
        Self::with_collaborators(config, catalog, auth, Arc::new(EnvSecretStore))
    }

    /// Build state around externally provided collaborator
    /// implementations
    pub fn with_collaborators(
        config: Config,
        catalog: Arc<dyn ConnectorCatalog>,
        auth: Arc<dyn AuthPrincipalStore>,
        secrets: Arc<dyn SecretStore>,
    ) -> Result<Self> {
        let upstream = UpstreamClient::new(
            config.upstream.backoff_base(),
            config.upstream.backoff_cap(),
        )?;
        let usage = UsageBuffer::new(&config.usage.buffer_config());

        Ok(Self {
            resolver: Arc::new(Resolver::new(catalog)),
            cache: Arc::new(ResponseCache::new(config.cache.max_entries)),
            policy: Arc::new(PolicyEngine::new()),
            upstream: Arc::new(upstream),
            usage,
            auth,
            secrets,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn auth(&self) -> &dyn AuthPrincipalStore {
        self.auth.as_ref()
    }

    pub fn secrets(&self) -> &dyn SecretStore {
        self.secrets.as_ref()
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    pub fn policy(&self) -> &PolicyEngine {
        &self.policy
    }

    pub fn upstream(&self) -> &UpstreamClient {
        &self.upstream
    }

    pub fn usage(&self) -> &UsageBuffer {
        &self.usage
    }
}
