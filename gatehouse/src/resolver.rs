//! Config resolver: consumer path -> (connector, endpoint)
//!
//! Endpoints declare a `consumer_path_pattern` that is either a literal
//! path or a path with `:name` parameter segments. The resolver matches
//! the consumer path (everything after `/api/v1/gw/:connector/`) against
//! every endpoint of the slug's connector and picks the most specific
//! match: more literal segments win; ties are broken by the
//! lexicographically smaller pattern string, then the smaller endpoint id.

use std::collections::HashMap;
use std::sync::Arc;

use crate::catalog::{Connector, ConnectorCatalog, Endpoint};

/// One segment of a parsed path pattern
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Param(String),
}

/// A parsed consumer path pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    raw: String,
    segments: Vec<Segment>,
    literal_count: usize,
}

impl PathPattern {
    /// Parse a pattern such as `/users/:id/posts`
    ///
    /// Leading and trailing slashes are insignificant; empty segments are
    /// dropped, so `/a//b/` parses the same as `a/b`.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        let mut literal_count = 0;
        for part in split_segments(raw) {
            if let Some(name) = part.strip_prefix(':') {
                if name.is_empty() {
                    return Err(format!("pattern {raw:?} has an unnamed parameter segment"));
                }
                segments.push(Segment::Param(name.to_string()));
            } else {
                literal_count += 1;
                segments.push(Segment::Literal(part.to_string()));
            }
        }
        Ok(Self {
            raw: raw.to_string(),
            segments,
            literal_count,
        })
    }

    /// Match a consumer path, returning captured parameters on success
    pub fn matches(&self, path: &str) -> Option<HashMap<String, String>> {
        let parts: Vec<&str> = split_segments(path).collect();
        if parts.len() != self.segments.len() {
            return None;
        }

        let mut params = HashMap::new();
        for (segment, part) in self.segments.iter().zip(parts) {
            match segment {
                Segment::Literal(lit) if lit == part => {}
                Segment::Literal(_) => return None,
                Segment::Param(name) => {
                    params.insert(name.clone(), part.to_string());
                }
            }
        }
        Some(params)
    }

    pub fn literal_count(&self) -> usize {
        self.literal_count
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Split a path into non-empty segments, ignoring leading/trailing slashes
fn split_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

/// Specificity order: more literal segments, then smaller pattern string,
/// then smaller endpoint id
fn is_more_specific(candidate: (usize, &str, &str), best: (usize, &str, &str)) -> bool {
    match candidate.0.cmp(&best.0) {
        std::cmp::Ordering::Greater => true,
        std::cmp::Ordering::Less => false,
        std::cmp::Ordering::Equal => (candidate.1, candidate.2) < (best.1, best.2),
    }
}

/// A resolved route for one request
#[derive(Clone)]
pub struct RouteMatch {
    connector: Arc<Connector>,
    endpoint_index: usize,
    path_params: HashMap<String, String>,
}

impl RouteMatch {
    pub fn connector(&self) -> &Connector {
        &self.connector
    }

    pub fn connector_arc(&self) -> Arc<Connector> {
        self.connector.clone()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.connector.endpoints[self.endpoint_index]
    }

    pub fn path_params(&self) -> &HashMap<String, String> {
        &self.path_params
    }
}

/// Resolves (slug, method, path) to a connector/endpoint pair via the
/// catalog
pub struct Resolver {
    catalog: Arc<dyn ConnectorCatalog>,
}

impl Resolver {
    pub fn new(catalog: Arc<dyn ConnectorCatalog>) -> Self {
        Self { catalog }
    }

    /// Find the most specific endpoint of `slug` matching the method and
    /// consumer path. Returns `None` when the slug is unknown or nothing
    /// matches; the pipeline maps both to `NOT_FOUND`.
    pub async fn resolve(&self, slug: &str, method: &str, path: &str) -> Option<RouteMatch> {
        let connector = self.catalog.lookup(slug).await?;
        let method = method.to_ascii_uppercase();

        // (literal_count, pattern, endpoint id) ordering: highest literal
        // count wins, then smaller pattern string, then smaller id.
        let mut best: Option<(usize, String, String, usize, HashMap<String, String>)> = None;

        for (index, endpoint) in connector.endpoints.iter().enumerate() {
            if !endpoint.method.eq_ignore_ascii_case(&method) {
                continue;
            }
            let Ok(pattern) = PathPattern::parse(&endpoint.consumer_path_pattern) else {
                // Definitions are validated at boot; an unparsable pattern
                // from a non-static catalog is skipped rather than fatal.
                tracing::warn!(
                    slug,
                    endpoint = %endpoint.name,
                    pattern = %endpoint.consumer_path_pattern,
                    "skipping endpoint with unparsable pattern"
                );
                continue;
            };
            let Some(params) = pattern.matches(path) else {
                continue;
            };

            let candidate = (
                pattern.literal_count(),
                pattern.raw().to_string(),
                endpoint.id.clone(),
                index,
                params,
            );
            let better = match &best {
                None => true,
                Some((count, raw, id, _, _)) => is_more_specific(
                    (candidate.0, candidate.1.as_str(), candidate.2.as_str()),
                    (*count, raw.as_str(), id.as_str()),
                ),
            };
            if better {
                best = Some(candidate);
            }
        }

        best.map(|(_, _, _, index, params)| RouteMatch {
            connector,
            endpoint_index: index,
            path_params: params,
        })
    }
}
