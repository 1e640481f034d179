//! Pipeline executor
//!
//! One request, sequential stages: correlation, authentication, config
//! resolution, body read, visibility and scoping checks, size cap,
//! policy, validation, cache lookup, secret resolution, transform,
//! upstream call, response build, cache store. Every stage may
//! short-circuit with a mapped error response; success and failure alike
//! produce exactly one usage record, enqueued after the response body has
//! been emitted (or the consumer disconnects).

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, Method, Uri};
use axum::response::Response;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Limited};
use uuid::Uuid;

use crate::auth::{bearer_token, verify_connector_access, Principal};
use crate::body::RequestBody;
use crate::cache::{cache_key, CacheKey, CachedResponse};
use crate::catalog::BodyTransform;
use crate::client_ip::{derive_client_ip, ip_allowed};
use crate::error::Error;
use crate::respond::{
    attach_usage, buffered_response, cache_hit_response, filter_headers, streaming_response,
    Correlation, ResponseDecoration,
};
use crate::secrets::resolve_secrets;
use crate::state::AppState;
use crate::transform::build_upstream_request;
use crate::upstream::{CallOptions, UpstreamReply};
use crate::usage::{UsageGuard, UsageRecord};
use crate::validate::validate_request;

/// Handler for `/api/v1/gw/{connector}` (empty consumer path)
pub async fn gateway_root(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path(slug): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    run(state, method, uri, headers, Some(remote), slug, String::new(), body).await
}

/// Handler for `/api/v1/gw/{connector}/{*path}`
pub async fn gateway_path(
    State(state): State<AppState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Path((slug, path)): Path<(String, String)>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    run(state, method, uri, headers, Some(remote), slug, path, body).await
}

#[allow(clippy::too_many_arguments)]
async fn run(
    state: AppState,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    remote: Option<SocketAddr>,
    slug: String,
    consumer_path: String,
    body: Body,
) -> Response {
    let correlation = extract_correlation(&headers);

    let record = UsageRecord {
        scope_id: "anonymous".to_string(),
        connector_id: None,
        endpoint_name: None,
        api_key_id: None,
        caller_type: "anonymous".to_string(),
        caller_id: "anonymous".to_string(),
        method: method.to_string(),
        path: uri.path().to_string(),
        status_code: 0,
        latency_ms: 0,
        upstream_latency_ms: 0,
        request_bytes: 0,
        response_bytes: 0,
        cached: false,
        error: None,
        region: state.config().usage.region.clone(),
        timestamp: Utc::now(),
    };
    let mut guard = UsageGuard::new(state.usage().clone(), record);

    let outcome = execute(
        &state,
        &method,
        &uri,
        &headers,
        remote,
        &slug,
        &consumer_path,
        body,
        &correlation,
        &mut guard,
    )
    .await;

    let response = match outcome {
        Ok(response) => response,
        Err(error) => {
            let message = error.consumer_message();
            if let Some(record) = guard.record_mut() {
                record.error = Some(message);
            }
            tracing::info!(
                request_id = %correlation.request_id,
                code = error.code(),
                status = error.status().as_u16(),
                connector = %slug,
                "gateway request rejected"
            );
            error.into_envelope(&correlation.request_id, &correlation.trace_id)
        }
    };

    attach_usage(response, guard)
}

fn extract_correlation(headers: &HeaderMap) -> Correlation {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };

    let request_id = header_value("x-request-id").unwrap_or_else(|| Uuid::new_v4().to_string());
    let trace_id = header_value("x-trace-id").unwrap_or_else(|| request_id.clone());
    Correlation {
        request_id,
        trace_id,
    }
}

#[allow(clippy::too_many_arguments)]
async fn execute(
    state: &AppState,
    method: &Method,
    uri: &Uri,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
    slug: &str,
    consumer_path: &str,
    body: Body,
    correlation: &Correlation,
    guard: &mut UsageGuard,
) -> Result<Response, Error> {
    // Authenticate
    let credential = bearer_token(headers)
        .ok_or_else(|| Error::Unauthorized("missing bearer credential".to_string()))?;
    let principal = state
        .auth()
        .resolve(credential)
        .await
        .ok_or_else(|| Error::Unauthorized("invalid credential".to_string()))?;
    if let Some(record) = guard.record_mut() {
        record.scope_id = principal.scope_id.clone();
        record.caller_type = principal.caller_type.as_str().to_string();
        record.caller_id = principal.caller_id.clone();
        record.api_key_id = principal.api_key_id.clone();
    }

    // Resolve routing config
    let route = state
        .resolver()
        .resolve(slug, method.as_str(), consumer_path)
        .await
        .ok_or_else(|| Error::NotFound(format!("no route for {slug}")))?;
    let connector = route.connector();
    let endpoint = route.endpoint();
    if let Some(record) = guard.record_mut() {
        record.connector_id = Some(connector.id.clone());
        record.endpoint_name = Some(endpoint.name.clone());
    }

    // Read the consumer body, bounded by the effective cap
    let effective_cap = effective_size_cap(
        endpoint.max_request_size,
        principal.max_request_size,
        state.config().upstream.max_body_bytes,
    );
    let (consumer_body, oversized) =
        read_body(method, body, endpoint.body_transform, effective_cap).await;
    let request_bytes = consumer_body.len();
    if let Some(record) = guard.record_mut() {
        record.request_bytes = request_bytes;
    }

    // Connector visibility; failures are indistinguishable from a
    // missing route
    if !verify_connector_access(&principal, connector) {
        return Err(Error::NotFound(format!("no route for {slug}")));
    }

    // Endpoint scoping
    if principal.endpoint_blocked(&endpoint.id, &endpoint.name) {
        return Err(Error::Forbidden(
            "credential is not permitted to call this endpoint".to_string(),
        ));
    }

    // IP allowlist; a set allowlist with no derivable client IP denies
    check_ip_allowlist(&principal, headers, remote)?;

    // Size cap
    if oversized || request_bytes > effective_cap {
        return Err(Error::PayloadTooLarge(format!(
            "request body exceeds the {effective_cap} byte limit"
        )));
    }

    // Policy
    let decision = state.policy().evaluate(connector, endpoint, &principal);
    if !decision.allowed {
        return Err(Error::RateLimited {
            headers: decision.headers,
        });
    }

    // Validation
    validate_request(&endpoint.validation, headers, &consumer_body).map_err(Error::Validation)?;

    // Cache lookup
    let cache_ttl = endpoint.cache_ttl_ms.filter(|ttl| *ttl > 0);
    let is_get = *method == Method::GET;
    let cache_key = if is_get && cache_ttl.is_some() {
        Some(request_cache_key(
            &principal,
            slug,
            method,
            consumer_path,
            uri,
            &consumer_body,
        ))
    } else {
        None
    };

    if let Some(key) = &cache_key {
        if let Some(cached) = state.cache().get(key) {
            if let Some(record) = guard.record_mut() {
                record.cached = true;
                record.upstream_latency_ms = 0;
            }
            let decoration = ResponseDecoration {
                correlation,
                cache_state: Some("HIT"),
                policy_headers: &decision.headers,
            };
            return Ok(cache_hit_response(&cached, &decoration));
        }
    }

    // Secrets and transform
    let secrets = resolve_secrets(state.secrets(), &principal.scope_id, connector).await;
    let upstream_request = build_upstream_request(
        endpoint,
        route.path_params(),
        headers,
        uri.query(),
        &consumer_body,
        &secrets,
    );

    // Upstream call
    let options = CallOptions {
        timeout: Duration::from_millis(
            endpoint.timeout_ms.unwrap_or(connector.default_timeout_ms).max(1),
        ),
        retries: endpoint.retries,
        allowed_hosts: connector.allowed_hosts.clone(),
        streaming: connector.streaming_enabled,
    };
    let proxy_started = Instant::now();
    let reply = match state.upstream().call(&upstream_request, &options).await {
        Ok(reply) => reply,
        Err(error) => {
            if let Some(record) = guard.record_mut() {
                record.upstream_latency_ms = proxy_started.elapsed().as_millis() as u64;
            }
            return Err(error);
        }
    };
    if let Some(record) = guard.record_mut() {
        record.upstream_latency_ms = reply.upstream_latency_ms();
    }

    // Build the consumer response; store cacheable results
    let whitelist = &state.config().upstream.passthrough_headers;
    let decoration = ResponseDecoration {
        correlation,
        cache_state: is_get.then_some("MISS"),
        policy_headers: &decision.headers,
    };

    let response = match reply {
        UpstreamReply::Buffered {
            status,
            headers: upstream_headers,
            body,
            ..
        } => {
            let consumer_headers = filter_headers(&upstream_headers, whitelist);
            if let (Some(key), Some(ttl)) = (cache_key, cache_ttl) {
                if (200..300).contains(&status) {
                    state.cache().insert(
                        key,
                        CachedResponse {
                            status,
                            headers: consumer_headers.clone(),
                            body: body.clone(),
                        },
                        Duration::from_millis(ttl),
                    );
                }
            }
            buffered_response(status, &consumer_headers, body, &decoration)
        }
        UpstreamReply::Stream { response, .. } => {
            streaming_response(response, whitelist, &decoration)
        }
    };

    tracing::info!(
        request_id = %correlation.request_id,
        connector = %slug,
        endpoint = %endpoint.name,
        status = response.status().as_u16(),
        "gateway request proxied"
    );

    Ok(response)
}

fn effective_size_cap(endpoint_cap: Option<u64>, principal_cap: Option<u64>, ceiling: u64) -> u64 {
    [endpoint_cap, principal_cap]
        .into_iter()
        .flatten()
        .fold(ceiling, u64::min)
}

/// Read the consumer body into memory, bounded by `cap`
///
/// Returns the body and whether the read was cut short by the limit.
/// Other read failures degrade to an empty body.
async fn read_body(
    method: &Method,
    body: Body,
    transform: BodyTransform,
    cap: u64,
) -> (RequestBody, bool) {
    if *method == Method::GET || *method == Method::HEAD {
        return (RequestBody::Empty, false);
    }

    let limit = (cap as usize).saturating_add(1);
    let collected = Limited::new(body, limit).collect().await;
    let bytes: Bytes = match collected {
        Ok(collected) => collected.to_bytes(),
        Err(error) => {
            if error.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                return (RequestBody::Empty, true);
            }
            tracing::warn!(error = %error, "failed to read consumer body; treating as empty");
            return (RequestBody::Empty, false);
        }
    };

    if bytes.is_empty() {
        return (RequestBody::Empty, false);
    }

    let body = match transform {
        BodyTransform::Binary => RequestBody::Binary(bytes),
        _ => RequestBody::Text(String::from_utf8_lossy(&bytes).into_owned()),
    };
    (body, false)
}

fn check_ip_allowlist(
    principal: &Principal,
    headers: &HeaderMap,
    remote: Option<SocketAddr>,
) -> Result<(), Error> {
    let Some(allowlist) = principal
        .allowed_ips
        .as_ref()
        .filter(|list| !list.is_empty())
    else {
        return Ok(());
    };

    let denied = Error::Forbidden("client address not permitted".to_string());
    match derive_client_ip(headers, remote) {
        Some(ip) if ip_allowed(ip, allowlist) => Ok(()),
        Some(_) => Err(denied),
        None => Err(denied),
    }
}

fn request_cache_key(
    principal: &Principal,
    slug: &str,
    method: &Method,
    consumer_path: &str,
    uri: &Uri,
    body: &RequestBody,
) -> CacheKey {
    let path_and_query = match uri.query() {
        Some(query) => format!("{consumer_path}?{query}"),
        None => consumer_path.to_string(),
    };
    cache_key(
        &principal.scope_id,
        slug,
        method.as_str(),
        &path_and_query,
        &body.to_bytes(),
    )
}
