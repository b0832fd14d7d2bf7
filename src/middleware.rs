//! HTTP front end for the limiter.
//!
//! Maps each request to an identifier, rejects with 429 when the limiter
//! says no, and fails open when the limiter errors.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::warn;

use crate::{
    algorithms::Decision,
    limiter::RateLimiter,
    metrics::Metrics,
    utils::{SystemTimeSource, TimeSource},
};

/// Maps a request to the identifier its quota is tracked under
pub type KeyExtractor = Arc<dyn Fn(&Request) -> Option<String> + Send + Sync>;

const UNKNOWN_IDENTIFIER: &str = "unknown";

/// Remote socket address, when the server was started with connect info
pub fn remote_addr_key(request: &Request) -> Option<String> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

/// State shared by every request passing through one limited route
#[derive(Clone)]
pub struct RateLimitState {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
    key_extractor: KeyExtractor,
    time_source: Arc<dyn TimeSource>,
}

impl RateLimitState {
    pub fn new(limiter: Arc<RateLimiter>, metrics: Arc<Metrics>) -> Self {
        Self {
            limiter,
            metrics,
            key_extractor: Arc::new(remote_addr_key),
            time_source: Arc::new(SystemTimeSource),
        }
    }

    pub fn with_key_extractor<F>(mut self, extractor: F) -> Self
    where
        F: Fn(&Request) -> Option<String> + Send + Sync + 'static,
    {
        self.key_extractor = Arc::new(extractor);
        self
    }

    /// Clock used to turn `reset_time` into a retry hint
    pub fn with_time_source(mut self, time_source: Arc<dyn TimeSource>) -> Self {
        self.time_source = time_source;
        self
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: impl ToString) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

fn apply_quota_headers(headers: &mut HeaderMap, limit: u64, decision: &Decision) {
    insert_header(headers, "x-ratelimit-limit", limit);
    insert_header(headers, "x-ratelimit-remaining", decision.remaining);
    insert_header(headers, "x-ratelimit-reset", decision.reset_time.div_euclid(1000));
}

fn too_many_requests(retry_after: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "message": "Too many requests",
            "retryAfter": retry_after,
        })),
    )
        .into_response();
    insert_header(response.headers_mut(), "retry-after", retry_after);
    response
}

/// axum middleware enforcing the limiter held in `state`
pub async fn rate_limit(
    State(state): State<RateLimitState>,
    request: Request,
    next: Next,
) -> Response {
    let algorithm = state.limiter.algorithm().name();
    let identifier =
        (state.key_extractor)(&request).unwrap_or_else(|| UNKNOWN_IDENTIFIER.to_string());

    let result = {
        let _timer = state.metrics.start_decision_timer(algorithm);
        state.limiter.check_limit(&identifier).await
    };

    match result {
        Ok(decision) => {
            state.metrics.record_decision(algorithm, decision.allowed);
            let limit = state.limiter.options().limit;

            let mut response = if decision.allowed {
                next.run(request).await
            } else {
                let now = state.time_source.now_millis();
                too_many_requests(decision.retry_after_secs(now))
            };
            apply_quota_headers(response.headers_mut(), limit, &decision);
            response
        }
        Err(e) => {
            if e.is_store_error() {
                state.metrics.record_store_error(algorithm);
            }
            state.metrics.record_fail_open(algorithm);
            warn!(algorithm, identifier = %identifier, error = %e, "Rate limiting error, admitting request");
            next.run(request).await
        }
    }
}
