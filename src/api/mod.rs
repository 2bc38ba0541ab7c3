//! HTTP surface: guest authorization pipeline and admin route contracts.
//!
//! Mirrors the teacher's own bootstrap shape — one router assembled from
//! sub-routers, `State<Arc<Services>>` threaded through every handler, a
//! `ServiceBuilder` stack applying sensitive-header masking and tracing as
//! outer layers.

pub mod admin;
pub mod csrf;
pub mod guest;
pub mod ip;
pub mod redirect;

use std::sync::Arc;

use axum::response::Response;
use axum::Router;
use http::header::{self, HeaderName, CONTENT_SECURITY_POLICY};
use http::HeaderMap;
use http::HeaderValue;
use tower::ServiceBuilder;
use tower_http::{trace::TraceLayer, ServiceBuilderExt as _};
use uuid::Uuid;

use crate::service::Services;

pub type AppState = Arc<Services>;

pub fn router(services: AppState) -> Router {
    let middlewares = ServiceBuilder::new()
        .sensitive_headers([header::AUTHORIZATION, header::COOKIE])
        .layer(TraceLayer::new_for_http());

    Router::new()
        .merge(guest::router())
        .merge(admin::router())
        .layer(middlewares)
        .with_state(services)
}

/// Reads a caller-supplied correlation id, or mints one. Propagated to every
/// audit entry and log line the request produces.
pub fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get("x-correlation-id")
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Applies the fixed security header set required on every guest-facing
/// response.
pub fn apply_security_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(CONTENT_SECURITY_POLICY, HeaderValue::from_static("default-src 'self'"));
    headers.insert(HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY"));
    headers.insert(HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff"));
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}
