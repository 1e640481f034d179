//! Secret resolution for upstream credential injection
//!
//! Connectors declare `secret_refs` (alias -> store reference); the
//! resolver materializes the aliases the transformer substitutes into
//! URLs, headers, and bodies. For a `public` connector with an owner, the
//! lookup scope is the owner's personal scope so shared connectors use
//! the owner's credentials rather than the caller's.
//!
//! Secret values never appear in logs or `Debug` output; unresolvable
//! references are skipped and the transformer drops whatever depended on
//! them.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::catalog::{Connector, Visibility};

/// Read-side interface to the secret store
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Resolve a reference within a scope to the plaintext secret bytes
    async fn get(&self, scope_id: &str, reference: &str) -> Option<Vec<u8>>;
}

/// Resolved alias -> plaintext map
///
/// `Debug` shows only the aliases.
#[derive(Clone, Default)]
pub struct Secrets(HashMap<String, String>);

impl Secrets {
    pub fn get(&self, alias: &str) -> Option<&str> {
        self.0.get(alias).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl fmt::Debug for Secrets {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secrets")
            .field("aliases", &self.0.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// The scope secrets are looked up under for this connector
pub fn effective_scope(caller_scope: &str, connector: &Connector) -> String {
    if connector.visibility == Visibility::Public {
        if let Some(owner) = &connector.owner_user_id {
            return format!("personal:{owner}");
        }
    }
    caller_scope.to_string()
}

/// Resolve every declared secret reference for a request
///
/// Missing or non-UTF-8 secrets are skipped with a warning naming only
/// the alias.
pub async fn resolve_secrets(
    store: &dyn SecretStore,
    caller_scope: &str,
    connector: &Connector,
) -> Secrets {
    let scope = effective_scope(caller_scope, connector);
    let mut resolved = HashMap::new();

    for (alias, reference) in &connector.secret_refs {
        match store.get(&scope, reference).await {
            Some(bytes) => match String::from_utf8(bytes) {
                Ok(value) => {
                    resolved.insert(alias.clone(), value);
                }
                Err(_) => {
                    tracing::warn!(alias = %alias, "secret is not valid UTF-8; skipping");
                }
            },
            None => {
                tracing::warn!(
                    alias = %alias,
                    connector = %connector.slug,
                    "secret reference could not be resolved"
                );
            }
        }
    }

    Secrets(resolved)
}

/// Secret store backed by process environment variables
///
/// A reference `api_key` in scope `team-A` resolves from
/// `GW_SECRET_TEAM_A_API_KEY`, falling back to `GW_SECRET_API_KEY`.
pub struct EnvSecretStore;

impl EnvSecretStore {
    fn sanitize(part: &str) -> String {
        part.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect()
    }
}

#[async_trait]
impl SecretStore for EnvSecretStore {
    async fn get(&self, scope_id: &str, reference: &str) -> Option<Vec<u8>> {
        let scoped = format!(
            "GW_SECRET_{}_{}",
            Self::sanitize(scope_id),
            Self::sanitize(reference)
        );
        if let Ok(value) = std::env::var(&scoped) {
            return Some(value.into_bytes());
        }
        let global = format!("GW_SECRET_{}", Self::sanitize(reference));
        std::env::var(&global).ok().map(String::into_bytes)
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::MapSecretStore;
    use super::*;
    use crate::catalog::test_support::connector;

    #[tokio::test]
    async fn resolves_declared_aliases() {
        let mut c = connector("weather", vec![]);
        c.secret_refs
            .insert("api_key".to_string(), "weather/key".to_string());

        let store = MapSecretStore::new(&[("team-A", "weather/key", "s3cr3t")]);
        let secrets = resolve_secrets(&store, "team-A", &c).await;
        assert_eq!(secrets.get("api_key"), Some("s3cr3t"));
    }

    #[tokio::test]
    async fn missing_references_are_skipped() {
        let mut c = connector("weather", vec![]);
        c.secret_refs
            .insert("api_key".to_string(), "weather/key".to_string());
        c.secret_refs
            .insert("other".to_string(), "weather/other".to_string());

        let store = MapSecretStore::new(&[("team-A", "weather/key", "s3cr3t")]);
        let secrets = resolve_secrets(&store, "team-A", &c).await;
        assert_eq!(secrets.len(), 1);
        assert_eq!(secrets.get("other"), None);
    }

    #[tokio::test]
    async fn public_connector_uses_owner_scope() {
        let mut c = connector("shared", vec![]);
        c.visibility = Visibility::Public;
        c.owner_user_id = Some("owner-1".to_string());
        c.secret_refs
            .insert("api_key".to_string(), "shared/key".to_string());

        // The secret exists only in the owner's personal scope
        let store = MapSecretStore::new(&[("personal:owner-1", "shared/key", "owner-secret")]);
        let secrets = resolve_secrets(&store, "team-Z", &c).await;
        assert_eq!(secrets.get("api_key"), Some("owner-secret"));
    }

    #[test]
    fn effective_scope_rules() {
        let mut c = connector("shared", vec![]);
        assert_eq!(effective_scope("team-A", &c), "team-A");

        c.visibility = Visibility::Public;
        c.owner_user_id = Some("owner-1".to_string());
        assert_eq!(effective_scope("team-A", &c), "personal:owner-1");

        c.owner_user_id = None;
        assert_eq!(effective_scope("team-A", &c), "team-A");
    }

    #[test]
    fn debug_output_redacts_values() {
        let secrets = Secrets::from_pairs(&[("api_key", "super-secret-value")]);
        let rendered = format!("{secrets:?}");
        assert!(rendered.contains("api_key"));
        assert!(!rendered.contains("super-secret-value"));
    }

    #[test]
    fn env_store_sanitizes_names() {
        assert_eq!(EnvSecretStore::sanitize("team-A"), "TEAM_A");
        assert_eq!(EnvSecretStore::sanitize("weather/key"), "WEATHER_KEY");
        assert_eq!(EnvSecretStore::sanitize("personal:u1"), "PERSONAL_U1");
    }
}
