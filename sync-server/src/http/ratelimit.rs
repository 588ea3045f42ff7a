//! Rate limiting middleware for the `/v1` routes.

use super::principal::rate_limit_subject;
use crate::limits::RateLimitDecision;
use crate::server::SyncServer;
use axum::extract::Request;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use std::sync::atomic::Ordering;
use std::sync::Arc;

/// Requests allowed per window.
pub const LIMIT_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Requests left in the current window.
pub const REMAINING_HEADER: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

fn apply_headers(headers: &mut HeaderMap, decision: &RateLimitDecision) {
    headers.insert(LIMIT_HEADER, HeaderValue::from(decision.limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(decision.remaining));
    if let Some(retry_after) = decision.retry_after {
        headers.insert(RETRY_AFTER, HeaderValue::from(retry_after));
    }
}

/// Check the caller against the limiter before running the handler.
pub async fn rate_limit_middleware(
    Extension(server): Extension<Arc<SyncServer>>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let subject = rate_limit_subject(&parts);
    let decision = server.limiter().check(&subject).await;

    let mut response = if decision.allowed {
        next.run(Request::from_parts(parts, body)).await
    } else {
        server.metrics().rate_limit_hits.fetch_add(1, Ordering::Relaxed);
        let retry_after = decision.retry_after.unwrap_or(1);
        (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "code": "rate_limit_exceeded",
                "message": "too many requests",
                "retry_after": retry_after,
            })),
        )
            .into_response()
    };

    apply_headers(response.headers_mut(), &decision);
    response
}
