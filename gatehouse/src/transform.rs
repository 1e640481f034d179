//! Request transformer: consumer request -> upstream request
//!
//! Builds the outbound URL, headers, and body from the endpoint
//! definition, the matched path parameters, and the resolved secrets.
//! Placeholders use `{name}` syntax:
//!
//! - `{param}`: a path parameter captured by the resolver
//! - `{secret.alias}`: a resolved secret value
//! - `{body}` / `{body.path.to.field}`: the parsed consumer JSON body
//!   (body templates only)
//!
//! A header template referencing an unresolved secret is dropped rather
//! than emitted half-rendered; in URLs and bodies an unresolved secret
//! renders as the empty string. The consumer `Authorization` header is
//! forwarded only when explicitly listed in the endpoint's pass rules.

use std::collections::HashMap;

use axum::http::{header::CONTENT_TYPE, HeaderMap};
use bytes::Bytes;
use serde_json::Value;

use crate::body::RequestBody;
use crate::catalog::{BodyTransform, Endpoint};
use crate::secrets::Secrets;

/// The fully built outbound request
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
}

/// Build the upstream request for a matched endpoint
pub fn build_upstream_request(
    endpoint: &Endpoint,
    path_params: &HashMap<String, String>,
    consumer_headers: &HeaderMap,
    consumer_query: Option<&str>,
    body: &RequestBody,
    secrets: &Secrets,
) -> UpstreamRequest {
    let url = build_url(endpoint, path_params, consumer_query, secrets);
    let headers = build_headers(endpoint, path_params, consumer_headers, body, secrets);
    let out_body = build_body(endpoint, path_params, body, secrets);

    UpstreamRequest {
        method: endpoint.method.to_ascii_uppercase(),
        url,
        headers,
        body: out_body,
    }
}

fn build_url(
    endpoint: &Endpoint,
    path_params: &HashMap<String, String>,
    consumer_query: Option<&str>,
    secrets: &Secrets,
) -> String {
    let rendered = render(&endpoint.upstream_url_template, |name| {
        resolve_placeholder(name, path_params, secrets, None)
    });

    let mut url = rendered.text;
    // A template that carries its own query string overrides the
    // consumer's.
    if let Some(query) = consumer_query {
        if !query.is_empty() && !url.contains('?') {
            url.push('?');
            url.push_str(query);
        }
    }
    url
}

fn build_headers(
    endpoint: &Endpoint,
    path_params: &HashMap<String, String>,
    consumer_headers: &HeaderMap,
    body: &RequestBody,
    secrets: &Secrets,
) -> Vec<(String, String)> {
    let rules = &endpoint.header_rules;
    let mut headers: Vec<(String, String)> = Vec::new();

    for name in &rules.pass {
        if let Some(value) = consumer_headers
            .get(name.as_str())
            .and_then(|v| v.to_str().ok())
        {
            headers.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }

    // Forward the consumer content type alongside a body unless the
    // endpoint overrides or strips it.
    let content_type_handled = rules
        .pass
        .iter()
        .chain(rules.add.keys())
        .any(|name| name.eq_ignore_ascii_case("content-type"));
    if !body.is_empty() && !content_type_handled {
        if let Some(value) = consumer_headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
        {
            headers.push(("content-type".to_string(), value.to_string()));
        }
    }

    for (name, template) in &rules.add {
        let rendered = render(template, |placeholder| {
            resolve_placeholder(placeholder, path_params, secrets, None)
        });
        if rendered.missing_secret {
            tracing::debug!(header = %name, "dropping header with unresolved secret");
            continue;
        }
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        headers.push((name.to_ascii_lowercase(), rendered.text));
    }

    for name in &rules.remove {
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
    }

    headers
}

fn build_body(
    endpoint: &Endpoint,
    path_params: &HashMap<String, String>,
    body: &RequestBody,
    secrets: &Secrets,
) -> Option<Bytes> {
    match endpoint.body_transform {
        BodyTransform::Passthrough | BodyTransform::Binary => {
            if body.is_empty() {
                None
            } else {
                Some(body.to_bytes())
            }
        }
        BodyTransform::Template => {
            let template = endpoint.body_template.as_deref()?;
            let parsed: Value = body
                .as_text()
                .and_then(|text| serde_json::from_str(text).ok())
                .unwrap_or(Value::Null);
            let rendered = render(template, |name| {
                resolve_placeholder(name, path_params, secrets, Some(&parsed))
            });
            Some(Bytes::from(rendered.text))
        }
    }
}

// ---------------------------------------------------------------------------
// Placeholder rendering
// ---------------------------------------------------------------------------

enum Resolution {
    Value(String),
    MissingSecret,
    /// Unknown placeholder; left verbatim
    Keep,
}

struct Rendered {
    text: String,
    missing_secret: bool,
}

/// Substitute `{name}` placeholders via the resolver callback
fn render(template: &str, resolve: impl Fn(&str) -> Resolution) -> Rendered {
    let mut text = String::with_capacity(template.len());
    let mut missing_secret = false;
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        text.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('}') {
            Some(end) if is_placeholder_name(&after[..end]) => {
                let name = &after[..end];
                match resolve(name) {
                    Resolution::Value(value) => text.push_str(&value),
                    Resolution::MissingSecret => missing_secret = true,
                    Resolution::Keep => {
                        text.push('{');
                        text.push_str(name);
                        text.push('}');
                    }
                }
                rest = &after[end + 1..];
            }
            _ => {
                text.push('{');
                rest = after;
            }
        }
    }
    text.push_str(rest);

    Rendered {
        text,
        missing_secret,
    }
}

fn is_placeholder_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn resolve_placeholder(
    name: &str,
    path_params: &HashMap<String, String>,
    secrets: &Secrets,
    body: Option<&Value>,
) -> Resolution {
    if let Some(alias) = name.strip_prefix("secret.") {
        return match secrets.get(alias) {
            Some(value) => Resolution::Value(value.to_string()),
            None => Resolution::MissingSecret,
        };
    }

    if let Some(body) = body {
        if name == "body" {
            return Resolution::Value(json_to_text(body));
        }
        if let Some(path) = name.strip_prefix("body.") {
            let mut current = body;
            for part in path.split('.') {
                match current.get(part) {
                    Some(child) => current = child,
                    None => return Resolution::Value(String::new()),
                }
            }
            return Resolution::Value(json_to_text(current));
        }
    }

    match path_params.get(name) {
        Some(value) => Resolution::Value(value.clone()),
        None => Resolution::Keep,
    }
}

/// Strings render bare; everything else as compact JSON
fn json_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::endpoint;

    fn params(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                name.parse::<axum::http::HeaderName>().unwrap(),
                value.parse().unwrap(),
            );
        }
        map
    }

    #[test]
    fn url_substitutes_params_and_secrets() {
        let mut ep = endpoint("e", "GET", "/cities/:city", "https://up.example.com/v2/{city}?key={secret.api_key}");
        ep.header_rules.pass = vec![];
        let secrets = Secrets::from_pairs(&[("api_key", "k123")]);

        let request = build_upstream_request(
            &ep,
            &params(&[("city", "nyc")]),
            &HeaderMap::new(),
            Some("units=f"),
            &RequestBody::Empty,
            &secrets,
        );

        // Template query overrides the consumer query
        assert_eq!(request.url, "https://up.example.com/v2/nyc?key=k123");
        assert_eq!(request.method, "GET");
    }

    #[test]
    fn consumer_query_is_preserved_without_override() {
        let ep = endpoint("e", "GET", "/fc", "https://up.example.com/forecast");
        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &HeaderMap::new(),
            Some("city=NYC&days=3"),
            &RequestBody::Empty,
            &Secrets::default(),
        );
        assert_eq!(request.url, "https://up.example.com/forecast?city=NYC&days=3");
    }

    #[test]
    fn missing_secret_in_url_renders_empty() {
        let ep = endpoint("e", "GET", "/fc", "https://up.example.com/fc?key={secret.nope}");
        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &HeaderMap::new(),
            None,
            &RequestBody::Empty,
            &Secrets::default(),
        );
        assert_eq!(request.url, "https://up.example.com/fc?key=");
    }

    #[test]
    fn authorization_is_not_forwarded_by_default() {
        let ep = endpoint("e", "GET", "/fc", "https://up.example.com/fc");
        let consumer = headers(&[("authorization", "Bearer caller-token"), ("x-client", "web")]);

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &consumer,
            None,
            &RequestBody::Empty,
            &Secrets::default(),
        );
        assert!(request.headers.is_empty());
    }

    #[test]
    fn pass_add_remove_header_rules() {
        let mut ep = endpoint("e", "POST", "/fc", "https://up.example.com/fc");
        ep.header_rules.pass = vec!["x-client".to_string(), "authorization".to_string()];
        ep.header_rules
            .add
            .insert("x-api-key".to_string(), "{secret.api_key}".to_string());
        ep.header_rules.remove = vec!["x-client".to_string()];

        let consumer = headers(&[("authorization", "Bearer t"), ("x-client", "web")]);
        let secrets = Secrets::from_pairs(&[("api_key", "k123")]);

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &consumer,
            None,
            &RequestBody::Empty,
            &secrets,
        );

        let names: Vec<&str> = request.headers.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"authorization"));
        assert!(names.contains(&"x-api-key"));
        assert!(!names.contains(&"x-client"));
    }

    #[test]
    fn added_header_with_missing_secret_is_dropped() {
        let mut ep = endpoint("e", "GET", "/fc", "https://up.example.com/fc");
        ep.header_rules
            .add
            .insert("x-api-key".to_string(), "Key {secret.gone}".to_string());

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &HeaderMap::new(),
            None,
            &RequestBody::Empty,
            &Secrets::default(),
        );
        assert!(request.headers.is_empty());
    }

    #[test]
    fn content_type_accompanies_passthrough_body() {
        let ep = endpoint("e", "POST", "/fc", "https://up.example.com/fc");
        let consumer = headers(&[("content-type", "application/json")]);

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &consumer,
            None,
            &RequestBody::Text("{}".to_string()),
            &Secrets::default(),
        );
        assert_eq!(
            request.headers,
            vec![("content-type".to_string(), "application/json".to_string())]
        );
        assert_eq!(request.body.as_deref(), Some(b"{}".as_ref()));
    }

    #[test]
    fn binary_body_passes_raw_bytes() {
        let mut ep = endpoint("e", "POST", "/up", "https://up.example.com/up");
        ep.body_transform = BodyTransform::Binary;

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &HeaderMap::new(),
            None,
            &RequestBody::Binary(Bytes::from_static(b"\x00\x01\x02")),
            &Secrets::default(),
        );
        assert_eq!(request.body.as_deref(), Some(b"\x00\x01\x02".as_ref()));
    }

    #[test]
    fn template_body_renders_fields_and_secrets() {
        let mut ep = endpoint("e", "POST", "/chat", "https://up.example.com/chat");
        ep.body_transform = BodyTransform::Template;
        ep.body_template = Some(
            r#"{"model":"m-1","prompt":"{body.prompt}","max_tokens":{body.limits.tokens},"key":"{secret.api_key}"}"#
                .to_string(),
        );

        let consumer_body = RequestBody::Text(
            serde_json::json!({"prompt": "hello", "limits": {"tokens": 128}}).to_string(),
        );
        let secrets = Secrets::from_pairs(&[("api_key", "k9")]);

        let request = build_upstream_request(
            &ep,
            &HashMap::new(),
            &HeaderMap::new(),
            None,
            &consumer_body,
            &secrets,
        );
        assert_eq!(
            request.body.as_deref(),
            Some(br#"{"model":"m-1","prompt":"hello","max_tokens":128,"key":"k9"}"#.as_ref())
        );
    }

    #[test]
    fn unknown_placeholders_stay_verbatim() {
        let rendered = render("/x/{unknown}/{weird space}", |name| {
            resolve_placeholder(name, &HashMap::new(), &Secrets::default(), None)
        });
        assert_eq!(rendered.text, "/x/{unknown}/{weird space}");
        assert!(!rendered.missing_secret);
    }
}
