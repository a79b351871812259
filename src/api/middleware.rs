//! API Middleware
//!
//! Request context, rate limiting and request logging.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, HeaderValue, Method, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::IpAddr;
use uuid::Uuid;

use crate::domain::OperationContext;
use crate::error::AppError;
use crate::rate_limit::RateLimitPolicy;

use super::AppState;

pub const CORRELATION_HEADER: &str = "x-correlation-id";

// =========================================================================
// Operation context
// =========================================================================

/// First address of `X-Forwarded-For`, else `X-Real-IP`
pub fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .and_then(|ip| ip.trim().parse().ok())
}

/// Build the `OperationContext` of the request and echo its correlation id
pub async fn context_middleware(mut request: Request<Body>, next: Next) -> Response {
    let headers = request.headers();

    // Extract correlation ID or generate new one
    let correlation_id = headers
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap_or_else(Uuid::new_v4);

    let mut context = OperationContext::new()
        .with_correlation_id(correlation_id)
        .with_source("api");
    if let Some(ip) = client_ip(headers) {
        context = context.with_client_ip(ip);
    }

    request.extensions_mut().insert(context);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&correlation_id.to_string()) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

// =========================================================================
// Rate limiting
// =========================================================================

/// Endpoint class and policy of a request
fn classify(state: &AppState, method: &Method, path: &str) -> (&'static str, RateLimitPolicy) {
    if path.contains("/webhooks/") {
        return (
            "webhook",
            RateLimitPolicy::webhook(state.config.webhook_rate_limit_per_minute),
        );
    }
    let money_path = path.ends_with("/purchases") || path.ends_with("/withdrawals");
    if method == Method::POST && money_path {
        return ("payment", RateLimitPolicy::payment());
    }
    (
        "standard",
        RateLimitPolicy::standard(state.config.rate_limit_per_minute),
    )
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let identifier = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.client_ip)
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (endpoint, policy) = classify(&state, request.method(), request.uri().path());
    let decision = state.limiter.check(&identifier, endpoint, policy);

    if !decision.allowed {
        tracing::warn!(
            client = %identifier,
            endpoint = endpoint,
            blocked = decision.blocked,
            "Rate limit exceeded"
        );
        return AppError::RateLimitExceeded {
            retry_after: decision.retry_after,
        }
        .into_response();
    }

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&decision.remaining.to_string()) {
        response.headers_mut().insert("x-ratelimit-remaining", value);
    }
    response
}

// =========================================================================
// Logging
// =========================================================================

/// Headers that should be masked in logs
const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "cookie",
    "set-cookie",
    "x-api-key",
    "paypal-transmission-sig",
    "toss-signature",
];

/// Mask sensitive headers for logging
pub fn mask_headers_for_logging(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let name_lower = name.as_str().to_lowercase();
            let masked_value = if SENSITIVE_HEADERS.contains(&name_lower.as_str()) {
                "[REDACTED]".to_string()
            } else {
                value.to_str().unwrap_or("[invalid utf8]").to_string()
            };
            (name.to_string(), masked_value)
        })
        .collect()
}

/// Request logging middleware
pub async fn logging_middleware(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = mask_headers_for_logging(request.headers());
    let correlation_id = request
        .extensions()
        .get::<OperationContext>()
        .and_then(|ctx| ctx.correlation_id);

    let start = std::time::Instant::now();

    tracing::info!(
        method = %method,
        uri = %uri,
        correlation_id = ?correlation_id,
        headers = ?headers,
        "Incoming request"
    );

    let response = next.run(request).await;

    tracing::info!(
        method = %method,
        uri = %uri,
        status = %response.status(),
        duration_ms = %start.elapsed().as_millis(),
        correlation_id = ?correlation_id,
        "Request completed"
    );

    response
}
