//! Response builder: upstream reply -> consumer response
//!
//! Maps buffered and streaming upstream replies onto consumer responses,
//! preserving status and a whitelisted set of upstream headers and always
//! attaching the correlation IDs, the `X-Gateway-Cache` marker (GET
//! only), and any policy headers. Streaming bodies are forwarded chunk by
//! chunk with no buffering.
//!
//! Every response body is wrapped so the request's [`UsageGuard`] fires
//! after the last byte is emitted; a consumer disconnect drops the wrapper
//! and the guard records the abort instead.

use std::pin::Pin;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::{header::CONTENT_LENGTH, HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use crate::cache::CachedResponse;
use crate::usage::UsageGuard;

/// Upstream headers forwarded to the consumer unless overridden in config
pub const DEFAULT_PASSTHROUGH_HEADERS: &[&str] = &[
    "content-type",
    "cache-control",
    "etag",
    "last-modified",
    "content-disposition",
    "content-language",
];

/// Correlation IDs for one request
#[derive(Debug, Clone)]
pub struct Correlation {
    pub request_id: String,
    pub trace_id: String,
}

/// Decoration applied to every consumer response
pub struct ResponseDecoration<'a> {
    pub correlation: &'a Correlation,
    /// `Some("HIT")` / `Some("MISS")` for GET requests, `None` otherwise
    pub cache_state: Option<&'a str>,
    pub policy_headers: &'a [(String, String)],
}

/// Select the upstream headers the consumer is allowed to see
pub fn filter_headers(upstream: &HeaderMap, whitelist: &[String]) -> Vec<(String, String)> {
    let mut selected = Vec::new();
    for name in whitelist {
        if let Some(value) = upstream.get(name.as_str()).and_then(|v| v.to_str().ok()) {
            selected.push((name.to_ascii_lowercase(), value.to_string()));
        }
    }
    selected
}

/// Build a consumer response from a fully buffered upstream reply
pub fn buffered_response(
    status: u16,
    headers: &[(String, String)],
    body: Bytes,
    decoration: &ResponseDecoration<'_>,
) -> Response {
    let mut response = Response::new(Body::from(body.clone()));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
    insert_pairs(response.headers_mut(), headers);
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));
    decorate(&mut response, decoration);
    response
}

/// Build a consumer response that forwards an upstream SSE stream
///
/// Chunks are relayed as they arrive; the transfer ends when either side
/// closes.
pub fn streaming_response(
    upstream: reqwest::Response,
    whitelist: &[String],
    decoration: &ResponseDecoration<'_>,
) -> Response {
    let status = upstream.status().as_u16();
    let headers = filter_headers(upstream.headers(), whitelist);

    let stream = upstream
        .bytes_stream()
        .map(|chunk| chunk.map_err(axum::Error::new));
    let mut response = Response::new(Body::from_stream(stream));
    *response.status_mut() = StatusCode::from_u16(status).unwrap_or(StatusCode::OK);
    insert_pairs(response.headers_mut(), &headers);
    decorate(&mut response, decoration);
    response
}

/// Build a consumer response from a cache entry
pub fn cache_hit_response(cached: &CachedResponse, decoration: &ResponseDecoration<'_>) -> Response {
    buffered_response(cached.status, &cached.headers, cached.body.clone(), decoration)
}

fn insert_pairs(target: &mut HeaderMap, pairs: &[(String, String)]) {
    for (name, value) in pairs {
        if let (Ok(name), Ok(value)) =
            (name.parse::<HeaderName>(), HeaderValue::from_str(value))
        {
            target.insert(name, value);
        }
    }
}

fn decorate(response: &mut Response, decoration: &ResponseDecoration<'_>) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&decoration.correlation.request_id) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    if let Ok(value) = HeaderValue::from_str(&decoration.correlation.trace_id) {
        headers.insert(HeaderName::from_static("x-trace-id"), value);
    }
    if let Some(state) = decoration.cache_state {
        if let Ok(value) = HeaderValue::from_str(state) {
            headers.insert(HeaderName::from_static("x-gateway-cache"), value);
        }
    }
    insert_pairs(headers, decoration.policy_headers);
}

// ---------------------------------------------------------------------------
// Usage accounting body wrapper
// ---------------------------------------------------------------------------

/// Wrap the response body so the usage record is enqueued after the last
/// byte reaches the consumer
pub fn attach_usage(response: Response, guard: UsageGuard) -> Response {
    let status = response.status().as_u16();
    let (parts, body) = response.into_parts();
    let wrapped = UsageBody {
        inner: body.into_data_stream().boxed(),
        guard: Some(guard),
        status,
        bytes_sent: 0,
    };
    Response::from_parts(parts, Body::from_stream(wrapped))
}

struct UsageBody {
    inner: BoxStream<'static, Result<Bytes, axum::Error>>,
    guard: Option<UsageGuard>,
    status: u16,
    bytes_sent: u64,
}

impl Stream for UsageBody {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Mid-stream failure still produces the usage record with
                // the bytes that made it out.
                if let Some(guard) = self.guard.take() {
                    guard.finish(self.status, self.bytes_sent);
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if let Some(guard) = self.guard.take() {
                    guard.finish(self.status, self.bytes_sent);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::usage::test_support::record;
    use crate::usage::{UsageBuffer, UsageBufferConfig};

    fn correlation() -> Correlation {
        Correlation {
            request_id: "req-1".to_string(),
            trace_id: "trace-1".to_string(),
        }
    }

    fn whitelist() -> Vec<String> {
        DEFAULT_PASSTHROUGH_HEADERS
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn filter_headers_keeps_only_whitelisted() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", "application/json".parse().unwrap());
        upstream.insert("x-internal-debug", "1".parse().unwrap());
        upstream.insert("etag", "\"abc\"".parse().unwrap());

        let filtered = filter_headers(&upstream, &whitelist());
        let names: Vec<&str> = filtered.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"content-type"));
        assert!(names.contains(&"etag"));
        assert!(!names.contains(&"x-internal-debug"));
    }

    #[test]
    fn buffered_response_carries_decorations() {
        let correlation = correlation();
        let policy = vec![("X-RateLimit-Remaining".to_string(), "9".to_string())];
        let decoration = ResponseDecoration {
            correlation: &correlation,
            cache_state: Some("MISS"),
            policy_headers: &policy,
        };

        let response = buffered_response(
            200,
            &[("content-type".to_string(), "application/json".to_string())],
            Bytes::from_static(b"{\"temp\":72}"),
            &decoration,
        );

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers.get("x-request-id").unwrap(), "req-1");
        assert_eq!(headers.get("x-trace-id").unwrap(), "trace-1");
        assert_eq!(headers.get("x-gateway-cache").unwrap(), "MISS");
        assert_eq!(headers.get("x-ratelimit-remaining").unwrap(), "9");
        assert_eq!(headers.get("content-length").unwrap(), "11");
    }

    #[test]
    fn non_get_omits_cache_marker() {
        let correlation = correlation();
        let decoration = ResponseDecoration {
            correlation: &correlation,
            cache_state: None,
            policy_headers: &[],
        };
        let response = buffered_response(201, &[], Bytes::new(), &decoration);
        assert!(response.headers().get("x-gateway-cache").is_none());
    }

    #[tokio::test]
    async fn attach_usage_fires_after_body_is_consumed() {
        let buffer = UsageBuffer::new(&UsageBufferConfig::default());
        let guard = crate::usage::UsageGuard::new(buffer.clone(), record(0));

        let correlation = correlation();
        let decoration = ResponseDecoration {
            correlation: &correlation,
            cache_state: None,
            policy_headers: &[],
        };
        let response = buffered_response(200, &[], Bytes::from_static(b"hello"), &decoration);
        let response = attach_usage(response, guard);

        // Not recorded until the body is drained
        assert_eq!(buffer.queued(), 0);

        let collected = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(collected.as_ref(), b"hello");
        assert_eq!(buffer.queued(), 1);
    }

    #[tokio::test]
    async fn dropping_wrapped_response_records_client_closed() {
        let buffer = UsageBuffer::new(&UsageBufferConfig::default());
        let guard = crate::usage::UsageGuard::new(buffer.clone(), record(0));

        let correlation = correlation();
        let decoration = ResponseDecoration {
            correlation: &correlation,
            cache_state: None,
            policy_headers: &[],
        };
        let response = buffered_response(200, &[], Bytes::from_static(b"hello"), &decoration);
        let response = attach_usage(response, guard);
        drop(response);

        assert_eq!(buffer.queued(), 1);
    }
}
