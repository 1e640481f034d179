//! Upstream proxy client
//!
//! Opens the outbound call with a per-attempt timeout, a static host
//! allowlist check before any dial, bounded retries with exponential
//! back-off for idempotent methods, and SSE detection. Replies are either
//! fully buffered or a streaming handle the response builder forwards
//! chunk by chunk.
//!
//! Failure mapping is total: every proxy failure becomes one of the
//! `BLOCKED_HOST`, `UPSTREAM_TIMEOUT`, `UPSTREAM_UNREACHABLE`,
//! `UPSTREAM_ERROR`, or `UPSTREAM_BAD_STATUS` error kinds.

use std::time::{Duration, Instant};

use bytes::Bytes;
use http::HeaderMap;

use crate::error::Error;
use crate::transform::UpstreamRequest;

/// Methods eligible for retry
const IDEMPOTENT_METHODS: &[&str] = &["GET", "HEAD", "PUT", "DELETE"];

/// Statuses treated as transient upstream failures
const RETRYABLE_STATUSES: &[u16] = &[502, 503, 504];

/// Per-call options derived from the connector and endpoint
#[derive(Debug, Clone)]
pub struct CallOptions {
    /// Per-attempt timeout
    pub timeout: Duration,
    /// Extra attempts beyond the first (idempotent methods only)
    pub retries: u32,
    /// Host suffixes the upstream may resolve to; empty permits any host
    pub allowed_hosts: Vec<String>,
    /// Whether `text/event-stream` responses are passed through unbuffered
    pub streaming: bool,
}

/// The upstream reply handed to the response builder
#[derive(Debug)]
pub enum UpstreamReply {
    /// Fully buffered response
    Buffered {
        status: u16,
        headers: HeaderMap,
        body: Bytes,
        upstream_latency_ms: u64,
    },
    /// Streaming (SSE) response; latency is time-to-first-byte
    Stream {
        response: reqwest::Response,
        upstream_latency_ms: u64,
    },
}

impl UpstreamReply {
    pub fn upstream_latency_ms(&self) -> u64 {
        match self {
            UpstreamReply::Buffered {
                upstream_latency_ms,
                ..
            }
            | UpstreamReply::Stream {
                upstream_latency_ms,
                ..
            } => *upstream_latency_ms,
        }
    }
}

/// Whether a host matches the allowlist by suffix
///
/// `api.example.com` matches the entries `api.example.com`,
/// `example.com`, and `.example.com`; an empty allowlist permits any
/// host.
pub fn host_allowed(host: &str, allowed_hosts: &[String]) -> bool {
    if allowed_hosts.is_empty() {
        return true;
    }
    let host = host.to_ascii_lowercase();
    allowed_hosts.iter().any(|entry| {
        let entry = entry.trim().trim_start_matches('.').to_ascii_lowercase();
        if entry.is_empty() {
            return false;
        }
        host == entry || host.ends_with(&format!(".{entry}"))
    })
}

/// Reusable upstream HTTP client
pub struct UpstreamClient {
    client: reqwest::Client,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl UpstreamClient {
    /// Build the shared client; redirects are passed through to the
    /// consumer rather than followed.
    pub fn new(backoff_base: Duration, backoff_cap: Duration) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Internal(format!("failed to build upstream client: {e}")))?;
        Ok(Self {
            client,
            backoff_base,
            backoff_cap,
        })
    }

    /// Execute the upstream call
    pub async fn call(
        &self,
        request: &UpstreamRequest,
        options: &CallOptions,
    ) -> Result<UpstreamReply, Error> {
        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| Error::Upstream(format!("invalid upstream url: {e}")))?;
        let host = url
            .host_str()
            .ok_or_else(|| Error::Upstream("upstream url has no host".to_string()))?;
        if !host_allowed(host, &options.allowed_hosts) {
            return Err(Error::BlockedHost(host.to_string()));
        }

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| Error::Upstream(format!("invalid method: {e}")))?;
        let idempotent = IDEMPOTENT_METHODS.contains(&request.method.as_str());
        let max_attempts = if idempotent {
            options.retries as u64 + 1
        } else {
            1
        };

        let mut delay = self.backoff_base;
        let mut attempt: u64 = 0;

        loop {
            attempt += 1;
            let started = Instant::now();

            let mut builder = self
                .client
                .request(method.clone(), url.clone())
                .timeout(options.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let failure = match builder.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let ttfb_ms = started.elapsed().as_millis() as u64;

                    let retryable =
                        RETRYABLE_STATUSES.contains(&status) && attempt < max_attempts;
                    if retryable {
                        tracing::debug!(status, attempt, "retrying upstream after bad status");
                        Error::UpstreamBadStatus {
                            status,
                            message: format!("upstream returned status {status}"),
                        }
                    } else if status >= 400 {
                        return Err(Error::UpstreamBadStatus {
                            status,
                            message: format!("upstream returned status {status}"),
                        });
                    } else if options.streaming && is_event_stream(response.headers()) {
                        return Ok(UpstreamReply::Stream {
                            response,
                            upstream_latency_ms: ttfb_ms,
                        });
                    } else {
                        let headers = response.headers().clone();
                        match response.bytes().await {
                            Ok(body) => {
                                return Ok(UpstreamReply::Buffered {
                                    status,
                                    headers,
                                    body,
                                    upstream_latency_ms: started.elapsed().as_millis() as u64,
                                })
                            }
                            Err(e) => classify_transport_error(&e),
                        }
                    }
                }
                Err(e) => classify_transport_error(&e),
            };

            if attempt >= max_attempts || !is_retryable(&failure) {
                return Err(failure);
            }

            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "upstream retry back-off");
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(self.backoff_cap);
        }
    }
}

fn is_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim_start().to_ascii_lowercase().starts_with("text/event-stream"))
        .unwrap_or(false)
}

fn classify_transport_error(error: &reqwest::Error) -> Error {
    if error.is_timeout() {
        Error::UpstreamTimeout(format!("upstream attempt timed out: {error}"))
    } else if error.is_connect() {
        Error::UpstreamUnreachable(format!("could not reach upstream: {error}"))
    } else {
        Error::Upstream(format!("upstream transport error: {error}"))
    }
}

fn is_retryable(error: &Error) -> bool {
    matches!(
        error,
        Error::UpstreamTimeout(_)
            | Error::UpstreamUnreachable(_)
            | Error::Upstream(_)
            | Error::UpstreamBadStatus { .. }
    )
}
