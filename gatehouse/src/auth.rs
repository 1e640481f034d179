//! Authentication and connector visibility
//!
//! Maps bearer credentials to a [`Principal`] and decides which connectors
//! a principal may see. Two credential forms are supported: session JWTs
//! (user callers) and API keys (machine callers with optional endpoint
//! scoping, IP allowlists, and size caps).
//!
//! Visibility failures are surfaced as `NOT_FOUND` by the pipeline so
//! connector slugs cannot be enumerated.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::catalog::{Connector, Visibility};
use crate::client_ip::validate_allowlist;
use crate::error::{Error, Result};

/// What kind of credential authenticated the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallerType {
    /// Session token (JWT)
    User,
    /// API key
    ApiKey,
}

impl CallerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallerType::User => "user",
            CallerType::ApiKey => "apiKey",
        }
    }
}

/// The authenticated actor for one request
///
/// Immutable for the lifetime of the request. `scope_id` is the tenancy
/// boundary: a team id or `personal:<userId>`.
#[derive(Debug, Clone)]
pub struct Principal {
    pub caller_type: CallerType,
    pub caller_id: String,
    pub scope_id: String,
    pub api_key_id: Option<String>,
    /// When set, only endpoints whose id or name is listed are reachable
    pub allowed_endpoints: Option<HashSet<String>>,
    /// When set, the client IP must match one of these (exact or CIDR)
    pub allowed_ips: Option<Vec<String>>,
    pub max_request_size: Option<u64>,
}

impl Principal {
    /// Convenience constructor for a user session principal
    pub fn user(caller_id: impl Into<String>, scope_id: impl Into<String>) -> Self {
        Self {
            caller_type: CallerType::User,
            caller_id: caller_id.into(),
            scope_id: scope_id.into(),
            api_key_id: None,
            allowed_endpoints: None,
            allowed_ips: None,
            max_request_size: None,
        }
    }

    /// True when the principal restricts which endpoints it may call and
    /// this endpoint is not among them
    pub fn endpoint_blocked(&self, endpoint_id: &str, endpoint_name: &str) -> bool {
        match &self.allowed_endpoints {
            Some(allowed) if !allowed.is_empty() => {
                !allowed.contains(endpoint_id) && !allowed.contains(endpoint_name)
            }
            _ => false,
        }
    }
}

/// Resolves a bearer credential to a principal, or `None` when invalid
#[async_trait]
pub trait AuthPrincipalStore: Send + Sync {
    async fn resolve(&self, credential: &str) -> Option<Principal>;
}

/// Extract the bearer token from the Authorization header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Whether a connector is visible to a principal
///
/// Rules, first match wins: public connectors are visible to everyone
/// authenticated; team-scoped connectors to principals of that team;
/// personally-owned connectors to their owner's personal scope.
pub fn verify_connector_access(principal: &Principal, connector: &Connector) -> bool {
    if connector.visibility == Visibility::Public {
        return true;
    }
    if let Some(team_id) = &connector.team_id {
        if *team_id == principal.scope_id {
            return true;
        }
    }
    if let Some(owner) = &connector.owner_user_id {
        if format!("personal:{owner}") == principal.scope_id {
            return true;
        }
    }
    false
}

// ---------------------------------------------------------------------------
// Built-in store: config-declared API keys + HS256 session tokens
// ---------------------------------------------------------------------------

/// API key declaration in the gateway config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyDefinition {
    /// The literal bearer token value
    pub key: String,
    pub caller_id: String,
    pub scope_id: String,
    #[serde(default)]
    pub api_key_id: Option<String>,
    #[serde(default)]
    pub allowed_endpoints: Option<Vec<String>>,
    #[serde(default)]
    pub allowed_ips: Option<Vec<String>>,
    #[serde(default)]
    pub max_request_size: Option<u64>,
}

/// Session token claims
///
/// `scope` overrides the tenancy scope; otherwise `team_id`, otherwise the
/// personal scope of `sub`.
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    pub exp: usize,
}

impl SessionClaims {
    pub fn scope_id(&self) -> String {
        self.scope
            .clone()
            .or_else(|| self.team_id.clone())
            .unwrap_or_else(|| format!("personal:{}", self.sub))
    }
}

/// Auth store backed by config-declared API keys and an optional HS256
/// session-token secret
#[derive(Debug)]
pub struct StaticAuthStore {
    api_keys: HashMap<String, Arc<Principal>>,
    jwt: Option<(DecodingKey, Validation)>,
}

impl StaticAuthStore {
    /// Build the store, validating every declared key definition
    ///
    /// `allowed_ips` entries must parse as CIDR blocks or exact IP
    /// addresses; a typo fails startup with a descriptive error (naming
    /// the caller, never the key itself) rather than silently denying
    /// that credential at request time.
    pub fn new(api_keys: Vec<ApiKeyDefinition>, jwt_secret: Option<&str>) -> Result<Self> {
        let mut keys = HashMap::new();
        for def in api_keys {
            if let Some(allowlist) = &def.allowed_ips {
                validate_allowlist(allowlist).map_err(|e| {
                    Error::Definition(format!("api key for caller {}: {}", def.caller_id, e))
                })?;
            }
            let principal = Principal {
                caller_type: CallerType::ApiKey,
                caller_id: def.caller_id,
                scope_id: def.scope_id,
                api_key_id: def.api_key_id,
                allowed_endpoints: def
                    .allowed_endpoints
                    .map(|list| list.into_iter().collect()),
                allowed_ips: def.allowed_ips,
                max_request_size: def.max_request_size,
            };
            keys.insert(def.key, Arc::new(principal));
        }

        let jwt = jwt_secret.map(|secret| {
            (
                DecodingKey::from_secret(secret.as_bytes()),
                Validation::new(Algorithm::HS256),
            )
        });

        Ok(Self {
            api_keys: keys,
            jwt,
        })
    }
}

#[async_trait]
impl AuthPrincipalStore for StaticAuthStore {
    async fn resolve(&self, credential: &str) -> Option<Principal> {
        if let Some(principal) = self.api_keys.get(credential) {
            return Some(principal.as_ref().clone());
        }

        let (key, validation) = self.jwt.as_ref()?;
        match decode::<SessionClaims>(credential, key, validation) {
            Ok(token) => {
                let claims = token.claims;
                Some(Principal::user(claims.sub.clone(), claims.scope_id()))
            }
            Err(e) => {
                tracing::debug!(error = %e, "session token rejected");
                None
            }
        }
    }
}
