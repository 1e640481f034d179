//! Connector and endpoint catalog
//!
//! The catalog is the read-only source of routing configuration: which
//! connectors exist, which endpoints they expose, and how requests to them
//! are transformed, validated, limited, and cached. The gateway core only
//! ever reads it; lifecycle management (CRUD, UI) lives outside this
//! repository and is reached through the [`ConnectorCatalog`] trait.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::resolver::PathPattern;

/// Who can see (and therefore call) a connector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    /// Visible only to the owning team or user
    #[default]
    Private,
    /// Visible to every authenticated principal
    Public,
}

/// How the consumer body is carried to the upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyTransform {
    /// Forward the body unchanged
    #[default]
    Passthrough,
    /// Forward the raw byte buffer without text handling
    Binary,
    /// Render `body_template` against the parsed consumer body and secrets
    Template,
}

/// Token-bucket rate limit: `capacity` tokens, refilled at
/// `refill_per_second`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSpec {
    pub capacity: u32,
    pub refill_per_second: f64,
}

/// Fixed-window quotas; each configured window must be under its limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct QuotaSpec {
    #[serde(default)]
    pub per_hour: Option<u64>,
    #[serde(default)]
    pub per_day: Option<u64>,
    #[serde(default)]
    pub per_month: Option<u64>,
}

impl QuotaSpec {
    pub fn is_empty(&self) -> bool {
        self.per_hour.is_none() && self.per_day.is_none() && self.per_month.is_none()
    }
}

/// Header handling for the outbound request
///
/// `pass` names consumer headers to forward (case-insensitive), `add`
/// injects headers (values may reference `{secret.alias}`), `remove`
/// strips headers after the pass/add steps. The consumer `Authorization`
/// header is never forwarded unless explicitly listed in `pass`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HeaderRules {
    #[serde(default)]
    pub pass: Vec<String>,
    #[serde(default)]
    pub add: BTreeMap<String, String>,
    #[serde(default)]
    pub remove: Vec<String>,
}

/// Request validation rules, checked in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ValidationRules {
    /// Expected Content-Type prefix (e.g. `application/json`)
    #[serde(default)]
    pub content_type: Option<String>,
    /// Headers that must be present
    #[serde(default)]
    pub required_headers: Vec<String>,
    /// Headers that must be absent
    #[serde(default)]
    pub forbidden_headers: Vec<String>,
    /// Regex the text body must match
    #[serde(default)]
    pub body_pattern: Option<String>,
    /// Structural JSON schema the body must satisfy
    #[serde(default)]
    pub body_schema: Option<serde_json::Value>,
}

impl ValidationRules {
    pub fn is_empty(&self) -> bool {
        self.content_type.is_none()
            && self.required_headers.is_empty()
            && self.forbidden_headers.is_empty()
            && self.body_pattern.is_none()
            && self.body_schema.is_none()
    }
}

/// A single routed operation within a connector
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub name: String,
    /// HTTP method, uppercase (GET, POST, PUT, PATCH, DELETE, HEAD)
    pub method: String,
    /// Consumer-facing pattern, e.g. `/v1/forecast` or `/users/:id`
    pub consumer_path_pattern: String,
    /// Upstream URL template with `{param}` and `{secret.alias}` slots
    pub upstream_url_template: String,
    #[serde(default)]
    pub header_rules: HeaderRules,
    #[serde(default)]
    pub body_transform: BodyTransform,
    #[serde(default)]
    pub body_template: Option<String>,
    #[serde(default)]
    pub validation: ValidationRules,
    /// Per-attempt upstream timeout; falls back to the connector default
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// Extra attempts for idempotent methods on transient failures
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub max_request_size: Option<u64>,
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    #[serde(default)]
    pub quota: Option<QuotaSpec>,
    /// Positive TTL enables response caching for GET
    #[serde(default)]
    pub cache_ttl_ms: Option<u64>,
}

/// An upstream integration owned by a user or team
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Connector {
    pub id: String,
    pub slug: String,
    #[serde(default)]
    pub owner_user_id: Option<String>,
    #[serde(default)]
    pub team_id: Option<String>,
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default = "default_connector_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Host suffixes the upstream URL must match (e.g. `api.example.com`)
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// alias -> secret store reference
    #[serde(default)]
    pub secret_refs: BTreeMap<String, String>,
    #[serde(default)]
    pub streaming_enabled: bool,
    /// Connector-wide rate limit, keyed by caller scope
    #[serde(default)]
    pub rate_limit: Option<RateLimitSpec>,
    pub endpoints: Vec<Endpoint>,
}

fn default_connector_timeout_ms() -> u64 {
    30_000
}

const ALLOWED_METHODS: &[&str] = &["GET", "POST", "PUT", "PATCH", "DELETE", "HEAD"];

impl RateLimitSpec {
    /// Reject buckets that could never admit a request or never refill
    fn validate(&self, context: &str) -> Result<()> {
        if self.capacity == 0 {
            return Err(Error::Definition(format!(
                "{context} declares a rate limit with zero capacity"
            )));
        }
        if !self.refill_per_second.is_finite() || self.refill_per_second <= 0.0 {
            return Err(Error::Definition(format!(
                "{context} declares a rate limit with refill rate {}",
                self.refill_per_second
            )));
        }
        Ok(())
    }
}

impl QuotaSpec {
    /// Reject zero-sized quota windows; they would deny every request
    fn validate(&self, context: &str) -> Result<()> {
        let windows = [
            ("hourly", self.per_hour),
            ("daily", self.per_day),
            ("monthly", self.per_month),
        ];
        for (label, limit) in windows {
            if limit == Some(0) {
                return Err(Error::Definition(format!(
                    "{context} declares a zero {label} quota"
                )));
            }
        }
        Ok(())
    }
}

impl Connector {
    /// Validate the definition; called once at boot so bad config fails
    /// fast instead of surfacing per-request.
    pub fn validate(&self) -> Result<()> {
        if self.slug.trim().is_empty() {
            return Err(Error::Definition(format!(
                "connector {} has an empty slug",
                self.id
            )));
        }
        if self.endpoints.is_empty() {
            return Err(Error::Definition(format!(
                "connector {} declares no endpoints",
                self.slug
            )));
        }
        if self.default_timeout_ms == 0 {
            return Err(Error::Definition(format!(
                "connector {} has a zero default timeout",
                self.slug
            )));
        }
        if let Some(spec) = &self.rate_limit {
            spec.validate(&format!("connector {}", self.slug))?;
        }
        for endpoint in &self.endpoints {
            let context = format!("endpoint {} on connector {}", endpoint.name, self.slug);
            let method = endpoint.method.to_ascii_uppercase();
            if !ALLOWED_METHODS.contains(&method.as_str()) {
                return Err(Error::Definition(format!(
                    "{context} uses unsupported method {}",
                    endpoint.method
                )));
            }
            PathPattern::parse(&endpoint.consumer_path_pattern)
                .map_err(|e| Error::Definition(format!("{context}: {e}")))?;
            if endpoint.upstream_url_template.trim().is_empty() {
                return Err(Error::Definition(format!(
                    "{context} has an empty upstream URL template"
                )));
            }
            if endpoint.body_transform == BodyTransform::Template
                && endpoint.body_template.is_none()
            {
                return Err(Error::Definition(format!(
                    "{context} uses a template body without a template"
                )));
            }
            if let Some(pattern) = &endpoint.validation.body_pattern {
                regex::Regex::new(pattern).map_err(|e| {
                    Error::Definition(format!("{context} has an invalid body pattern: {e}"))
                })?;
            }
            if endpoint.timeout_ms == Some(0) {
                return Err(Error::Definition(format!("{context} has a zero timeout")));
            }
            if endpoint.max_request_size == Some(0) {
                return Err(Error::Definition(format!(
                    "{context} has a zero request size cap"
                )));
            }
            if let Some(spec) = &endpoint.rate_limit {
                spec.validate(&context)?;
            }
            if let Some(quota) = &endpoint.quota {
                quota.validate(&context)?;
            }
        }
        Ok(())
    }
}

/// Read-side interface to the connector catalog
///
/// Implementations return the connector and all of its endpoints for a
/// slug; endpoint matching and visibility checks belong to the resolver
/// and the pipeline respectively.
#[async_trait]
pub trait ConnectorCatalog: Send + Sync {
    async fn lookup(&self, slug: &str) -> Option<Arc<Connector>>;
}

/// Catalog backed by definitions in the gateway config file
#[derive(Debug)]
pub struct StaticCatalog {
    connectors: BTreeMap<String, Arc<Connector>>,
}

impl StaticCatalog {
    /// Build from config-declared connectors, validating every definition
    pub fn new(connectors: Vec<Connector>) -> Result<Self> {
        let mut map = BTreeMap::new();
        for connector in connectors {
            connector.validate()?;
            if map.contains_key(&connector.slug) {
                return Err(Error::Definition(format!(
                    "duplicate connector slug {}",
                    connector.slug
                )));
            }
            map.insert(connector.slug.clone(), Arc::new(connector));
        }
        Ok(Self { connectors: map })
    }

    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }
}

#[async_trait]
impl ConnectorCatalog for StaticCatalog {
    async fn lookup(&self, slug: &str) -> Option<Arc<Connector>> {
        self.connectors.get(slug).cloned()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Minimal endpoint for tests; callers override what they need.
    pub fn endpoint(id: &str, method: &str, pattern: &str, url: &str) -> Endpoint {
        Endpoint {
            id: id.to_string(),
            name: id.to_string(),
            method: method.to_string(),
            consumer_path_pattern: pattern.to_string(),
            upstream_url_template: url.to_string(),
            header_rules: HeaderRules::default(),
            body_transform: BodyTransform::Passthrough,
            body_template: None,
            validation: ValidationRules::default(),
            timeout_ms: None,
            retries: 0,
            max_request_size: None,
            rate_limit: None,
            quota: None,
            cache_ttl_ms: None,
        }
    }

    pub fn connector(slug: &str, endpoints: Vec<Endpoint>) -> Connector {
        Connector {
            id: format!("conn-{slug}"),
            slug: slug.to_string(),
            owner_user_id: Some("owner-1".to_string()),
            team_id: None,
            visibility: Visibility::Private,
            default_timeout_ms: 30_000,
            allowed_hosts: vec![],
            secret_refs: BTreeMap::new(),
            streaming_enabled: false,
            rate_limit: None,
            endpoints,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{connector, endpoint};
    use super::*;

    #[tokio::test]
    async fn lookup_returns_connector_by_slug() {
        let catalog = StaticCatalog::new(vec![connector(
            "weather",
            vec![endpoint("fc", "GET", "/v1/forecast", "https://api.weather.example.com/v1")],
        )])
        .unwrap();

        assert!(catalog.lookup("weather").await.is_some());
        assert!(catalog.lookup("missing").await.is_none());
    }

    #[test]
    fn validation_rejects_empty_slug() {
        let mut bad = connector("weather", vec![endpoint("fc", "GET", "/x", "https://h/x")]);
        bad.slug = " ".to_string();
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_unknown_method() {
        let bad = connector("weather", vec![endpoint("fc", "TRACE", "/x", "https://h/x")]);
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_template_body_without_template() {
        let mut ep = endpoint("fc", "POST", "/x", "https://h/x");
        ep.body_transform = BodyTransform::Template;
        let bad = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_bad_body_regex() {
        let mut ep = endpoint("fc", "POST", "/x", "https://h/x");
        ep.validation.body_pattern = Some("([unclosed".to_string());
        let bad = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_zero_capacity_rate_limit() {
        let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
        ep.rate_limit = Some(RateLimitSpec {
            capacity: 0,
            refill_per_second: 1.0,
        });
        let bad = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_non_positive_refill_rate() {
        for refill in [0.0, -1.0, f64::NAN, f64::INFINITY] {
            let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
            ep.rate_limit = Some(RateLimitSpec {
                capacity: 10,
                refill_per_second: refill,
            });
            let bad = connector("weather", vec![ep]);
            assert!(
                StaticCatalog::new(vec![bad]).is_err(),
                "refill rate {refill} should be rejected"
            );
        }
    }

    #[test]
    fn validation_rejects_connector_level_rate_limit_too() {
        let mut bad = connector(
            "weather",
            vec![endpoint("fc", "GET", "/x", "https://h/x")],
        );
        bad.rate_limit = Some(RateLimitSpec {
            capacity: 0,
            refill_per_second: 1.0,
        });
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_rejects_zero_quota_window() {
        let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
        ep.quota = Some(QuotaSpec {
            per_hour: None,
            per_day: Some(0),
            per_month: None,
        });
        let bad = connector("weather", vec![ep]);
        let err = StaticCatalog::new(vec![bad]).unwrap_err();
        assert!(err.to_string().contains("daily"));
    }

    #[test]
    fn validation_rejects_zero_timeouts_and_size_caps() {
        let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
        ep.timeout_ms = Some(0);
        let bad = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![bad]).is_err());

        let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
        ep.max_request_size = Some(0);
        let bad = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![bad]).is_err());

        let mut bad = connector("weather", vec![endpoint("fc", "GET", "/x", "https://h/x")]);
        bad.default_timeout_ms = 0;
        assert!(StaticCatalog::new(vec![bad]).is_err());
    }

    #[test]
    fn validation_accepts_sane_limits() {
        let mut ep = endpoint("fc", "GET", "/x", "https://h/x");
        ep.rate_limit = Some(RateLimitSpec {
            capacity: 10,
            refill_per_second: 0.5,
        });
        ep.quota = Some(QuotaSpec {
            per_hour: Some(100),
            per_day: Some(1000),
            per_month: None,
        });
        ep.timeout_ms = Some(5_000);
        ep.max_request_size = Some(1024);
        let good = connector("weather", vec![ep]);
        assert!(StaticCatalog::new(vec![good]).is_ok());
    }

    #[test]
    fn connector_config_deserializes_with_defaults() {
        let connector: Connector = serde_json::from_value(serde_json::json!({
            "id": "c1",
            "slug": "weather",
            "endpoints": [{
                "id": "e1",
                "name": "forecast",
                "method": "GET",
                "consumer_path_pattern": "/v1/forecast",
                "upstream_url_template": "https://api.weather.example.com/v1/forecast"
            }]
        }))
        .unwrap();

        assert_eq!(connector.visibility, Visibility::Private);
        assert_eq!(connector.default_timeout_ms, 30_000);
        assert!(!connector.streaming_enabled);
        assert_eq!(connector.endpoints[0].retries, 0);
        assert_eq!(connector.endpoints[0].body_transform, BodyTransform::Passthrough);
        connector.validate().unwrap();
    }
}
