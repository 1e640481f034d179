//! Policy engine: token-bucket rate limits and fixed-window quotas
//!
//! Buckets are keyed by `(endpointId, callerId)` for endpoint limits and
//! `(connectorId, scopeId)` for connector-wide limits; quotas count
//! against `(endpointId, scopeId)` per hour/day/month window. All state is
//! process-local, held in sharded concurrent maps. The decision carries
//! the `X-RateLimit-*` headers for both allow and deny outcomes; denials
//! additionally carry `Retry-After`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use chrono::{Datelike, TimeZone, Timelike, Utc};
use dashmap::DashMap;

use crate::auth::Principal;
use crate::catalog::{Connector, Endpoint, QuotaSpec, RateLimitSpec};

/// Outcome of policy evaluation for one request
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub allowed: bool,
    /// HTTP status to answer with on deny
    pub status_code: u16,
    pub reason: Option<String>,
    /// Policy headers; merged into the response on both allow and deny
    pub headers: Vec<(String, String)>,
}

impl PolicyDecision {
    fn allow(headers: Vec<(String, String)>) -> Self {
        Self {
            allowed: true,
            status_code: 0,
            reason: None,
            headers,
        }
    }

    fn deny(reason: impl Into<String>, headers: Vec<(String, String)>) -> Self {
        Self {
            allowed: false,
            status_code: 429,
            reason: Some(reason.into()),
            headers,
        }
    }
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

struct WindowCounter {
    count: u64,
    window_end_epoch: i64,
}

/// State snapshot of one constraint after evaluation, used to pick the
/// most restrictive headers
struct ConstraintState {
    limit: u64,
    remaining: u64,
    reset_epoch: i64,
}

impl ConstraintState {
    fn headers(&self) -> Vec<(String, String)> {
        vec![
            ("X-RateLimit-Limit".to_string(), self.limit.to_string()),
            ("X-RateLimit-Remaining".to_string(), self.remaining.to_string()),
            ("X-RateLimit-Reset".to_string(), self.reset_epoch.to_string()),
        ]
    }
}

/// Process-local policy engine
pub struct PolicyEngine {
    buckets: DashMap<String, Bucket>,
    windows: DashMap<String, WindowCounter>,
    sweep_tick: AtomicU64,
}

const WINDOW_SWEEP_INTERVAL: u64 = 4096;

impl PolicyEngine {
    pub fn new() -> Self {
        Self {
            buckets: DashMap::new(),
            windows: DashMap::new(),
            sweep_tick: AtomicU64::new(0),
        }
    }

    /// Evaluate every configured constraint for this request
    ///
    /// The first denying constraint short-circuits. When all allow, the
    /// reported headers reflect the constraint with the fewest remaining
    /// requests.
    pub fn evaluate(
        &self,
        connector: &Connector,
        endpoint: &Endpoint,
        principal: &Principal,
    ) -> PolicyDecision {
        let mut states: Vec<ConstraintState> = Vec::new();

        if let Some(spec) = &endpoint.rate_limit {
            let key = format!("ep:{}:{}", endpoint.id, principal.caller_id);
            match self.take_token(&key, spec) {
                Ok(state) => states.push(state),
                Err(decision) => return decision,
            }
        }

        if let Some(spec) = &connector.rate_limit {
            let key = format!("conn:{}:{}", connector.id, principal.scope_id);
            match self.take_token(&key, spec) {
                Ok(state) => states.push(state),
                Err(decision) => return decision,
            }
        }

        if let Some(quota) = &endpoint.quota {
            if !quota.is_empty() {
                match self.count_windows(endpoint, &principal.scope_id, quota) {
                    Ok(mut quota_states) => states.append(&mut quota_states),
                    Err(decision) => return decision,
                }
            }
        }

        let headers = states
            .into_iter()
            .min_by_key(|s| s.remaining)
            .map(|s| s.headers())
            .unwrap_or_default();

        PolicyDecision::allow(headers)
    }

    /// Refill and consume one token; `Err` carries the deny decision
    fn take_token(
        &self,
        key: &str,
        spec: &RateLimitSpec,
    ) -> Result<ConstraintState, PolicyDecision> {
        let capacity = spec.capacity as f64;
        let mut entry = self.buckets.entry(key.to_string()).or_insert_with(|| Bucket {
            tokens: capacity,
            last_refill: Instant::now(),
        });
        let bucket = entry.value_mut();

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * spec.refill_per_second).min(capacity);
        bucket.last_refill = now;

        let epoch_now = Utc::now().timestamp();
        let secs_to_full = if spec.refill_per_second > 0.0 {
            ((capacity - bucket.tokens) / spec.refill_per_second).ceil() as i64
        } else {
            0
        };
        let reset_epoch = epoch_now + secs_to_full;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(ConstraintState {
                limit: spec.capacity as u64,
                remaining: bucket.tokens.floor() as u64,
                reset_epoch,
            })
        } else {
            let retry_after = if spec.refill_per_second > 0.0 {
                ((1.0 - bucket.tokens) / spec.refill_per_second).ceil() as i64
            } else {
                secs_to_full
            };
            let state = ConstraintState {
                limit: spec.capacity as u64,
                remaining: 0,
                reset_epoch,
            };
            let mut headers = state.headers();
            headers.push(("Retry-After".to_string(), retry_after.max(1).to_string()));
            Err(PolicyDecision::deny("rate limit exceeded", headers))
        }
    }

    /// Check and increment every configured quota window
    fn count_windows(
        &self,
        endpoint: &Endpoint,
        scope_id: &str,
        quota: &QuotaSpec,
    ) -> Result<Vec<ConstraintState>, PolicyDecision> {
        self.maybe_sweep_windows();

        let now = Utc::now();
        let windows: [(&str, Option<u64>, i64); 3] = [
            ("hour", quota.per_hour, hour_end_epoch(now)),
            ("day", quota.per_day, day_end_epoch(now)),
            ("month", quota.per_month, month_end_epoch(now)),
        ];

        let mut states = Vec::new();
        for (label, limit, window_end) in windows {
            let Some(limit) = limit else { continue };
            let key = format!(
                "q:{}:{}:{}:{}",
                endpoint.id, scope_id, label, window_end
            );
            let mut entry = self
                .windows
                .entry(key)
                .or_insert_with(|| WindowCounter {
                    count: 0,
                    window_end_epoch: window_end,
                });
            let counter = entry.value_mut();

            if counter.count >= limit {
                let retry_after = (window_end - now.timestamp()).max(1);
                let state = ConstraintState {
                    limit,
                    remaining: 0,
                    reset_epoch: window_end,
                };
                let mut headers = state.headers();
                headers.push(("Retry-After".to_string(), retry_after.to_string()));
                return Err(PolicyDecision::deny(
                    format!("{label} quota exceeded"),
                    headers,
                ));
            }

            counter.count += 1;
            states.push(ConstraintState {
                limit,
                remaining: limit - counter.count,
                reset_epoch: window_end,
            });
        }
        Ok(states)
    }

    /// Drop counters for windows that already ended; runs every
    /// `WINDOW_SWEEP_INTERVAL` quota evaluations
    fn maybe_sweep_windows(&self) {
        let tick = self.sweep_tick.fetch_add(1, Ordering::Relaxed);
        if tick % WINDOW_SWEEP_INTERVAL != WINDOW_SWEEP_INTERVAL - 1 {
            return;
        }
        let now = Utc::now().timestamp();
        self.windows.retain(|_, counter| counter.window_end_epoch > now);
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new()
    }
}

fn hour_end_epoch(now: chrono::DateTime<Utc>) -> i64 {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), now.hour(), 0, 0)
        .single()
        .unwrap_or(now);
    start.timestamp() + 3600
}

fn day_end_epoch(now: chrono::DateTime<Utc>) -> i64 {
    let start = Utc
        .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
        .single()
        .unwrap_or(now);
    start.timestamp() + 86_400
}

fn month_end_epoch(now: chrono::DateTime<Utc>) -> i64 {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|t| t.timestamp())
        .unwrap_or_else(|| now.timestamp() + 86_400)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_support::{connector, endpoint};

    fn header<'a>(decision: &'a PolicyDecision, name: &str) -> Option<&'a str> {
        decision
            .headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn no_constraints_allows_with_no_headers() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let e = endpoint("ep", "GET", "/x", "https://up/x");
        let p = Principal::user("u1", "team-A");

        let decision = engine.evaluate(&c, &e, &p);
        assert!(decision.allowed);
        assert!(decision.headers.is_empty());
    }

    #[test]
    fn bucket_denies_when_exhausted() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let mut e = endpoint("ep", "GET", "/x", "https://up/x");
        e.rate_limit = Some(RateLimitSpec {
            capacity: 2,
            refill_per_second: 0.001,
        });
        let p = Principal::user("u1", "team-A");

        assert!(engine.evaluate(&c, &e, &p).allowed);
        assert!(engine.evaluate(&c, &e, &p).allowed);

        let denied = engine.evaluate(&c, &e, &p);
        assert!(!denied.allowed);
        assert_eq!(denied.status_code, 429);
        assert_eq!(header(&denied, "X-RateLimit-Remaining"), Some("0"));
        assert_eq!(header(&denied, "X-RateLimit-Limit"), Some("2"));
        assert!(header(&denied, "Retry-After").is_some());
        assert!(header(&denied, "X-RateLimit-Reset").is_some());
    }

    #[test]
    fn bucket_refills_over_time() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let mut e = endpoint("ep", "GET", "/x", "https://up/x");
        e.rate_limit = Some(RateLimitSpec {
            capacity: 1,
            refill_per_second: 200.0,
        });
        let p = Principal::user("u1", "team-A");

        assert!(engine.evaluate(&c, &e, &p).allowed);
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(engine.evaluate(&c, &e, &p).allowed);
    }

    #[test]
    fn buckets_are_isolated_per_caller() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let mut e = endpoint("ep", "GET", "/x", "https://up/x");
        e.rate_limit = Some(RateLimitSpec {
            capacity: 1,
            refill_per_second: 0.001,
        });

        assert!(engine.evaluate(&c, &e, &Principal::user("u1", "team-A")).allowed);
        assert!(!engine.evaluate(&c, &e, &Principal::user("u1", "team-A")).allowed);
        // A different caller gets a fresh bucket
        assert!(engine.evaluate(&c, &e, &Principal::user("u2", "team-A")).allowed);
    }

    #[test]
    fn connector_bucket_is_keyed_by_scope() {
        let engine = PolicyEngine::new();
        let mut c = connector("svc", vec![]);
        c.rate_limit = Some(RateLimitSpec {
            capacity: 1,
            refill_per_second: 0.001,
        });
        let e = endpoint("ep", "GET", "/x", "https://up/x");

        // Two callers in the same scope share the connector bucket
        assert!(engine.evaluate(&c, &e, &Principal::user("u1", "team-A")).allowed);
        assert!(!engine.evaluate(&c, &e, &Principal::user("u2", "team-A")).allowed);
        // A different scope is unaffected
        assert!(engine.evaluate(&c, &e, &Principal::user("u3", "team-B")).allowed);
    }

    #[test]
    fn quota_denies_at_limit_with_retry_after() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let mut e = endpoint("ep", "GET", "/x", "https://up/x");
        e.quota = Some(QuotaSpec {
            per_hour: Some(2),
            per_day: None,
            per_month: None,
        });
        let p = Principal::user("u1", "team-A");

        assert!(engine.evaluate(&c, &e, &p).allowed);
        let second = engine.evaluate(&c, &e, &p);
        assert!(second.allowed);
        assert_eq!(header(&second, "X-RateLimit-Remaining"), Some("0"));

        let denied = engine.evaluate(&c, &e, &p);
        assert!(!denied.allowed);
        assert!(denied.reason.as_deref().unwrap().contains("hour"));
        let retry_after: i64 = header(&denied, "Retry-After").unwrap().parse().unwrap();
        assert!(retry_after >= 1 && retry_after <= 3600);
    }

    #[test]
    fn allow_reports_most_restrictive_remaining() {
        let engine = PolicyEngine::new();
        let c = connector("svc", vec![]);
        let mut e = endpoint("ep", "GET", "/x", "https://up/x");
        e.rate_limit = Some(RateLimitSpec {
            capacity: 100,
            refill_per_second: 1.0,
        });
        e.quota = Some(QuotaSpec {
            per_hour: Some(5),
            per_day: None,
            per_month: None,
        });
        let p = Principal::user("u1", "team-A");

        let decision = engine.evaluate(&c, &e, &p);
        assert!(decision.allowed);
        // Quota (5/hour) is tighter than the bucket (100)
        assert_eq!(header(&decision, "X-RateLimit-Limit"), Some("5"));
        assert_eq!(header(&decision, "X-RateLimit-Remaining"), Some("4"));
    }

    #[test]
    fn window_boundaries_are_sane() {
        let now = Utc::now();
        let hour = hour_end_epoch(now);
        let day = day_end_epoch(now);
        let month = month_end_epoch(now);
        assert!(hour > now.timestamp());
        assert!(hour <= now.timestamp() + 3600);
        assert!(day > now.timestamp());
        assert!(day <= now.timestamp() + 86_400);
        assert!(month > now.timestamp());
    }
}
