//! Admin HTTP surface: session login/logout and the management routes that
//! sit behind it. Every state-changing route writes exactly one audit entry,
//! success or denial, before returning.

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use http::HeaderMap;
use serde::{Deserialize, Serialize};

use crate::service::admin::AuthenticatedAdmin;
use crate::service::grant::AccessGrant;
use crate::service::portal_config::{PortalSettings, PortalSettingsUpdate};
use crate::service::rbac::audit::AuditOutcome;
use crate::service::reservation::IntegrationConfig;
use crate::service::voucher::Voucher;
use crate::utils::error::Error;
use crate::Result;

use super::{correlation_id, AppState};

const ADMIN_SESSION_COOKIE: &str = "admin_session";
const ADMIN_CSRF_HEADER: &str = "x-csrf-token";
const DEFAULT_GRANT_LIST_LIMIT: i64 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/admin/login", post(login))
        .route("/admin/logout", post(logout))
        .route("/admin/portal-config", get(get_portal_config).put(put_portal_config))
        .route("/admin/integrations", get(list_integrations).post(create_integration))
        .route("/admin/integrations/:integration_id", put(update_integration).delete(delete_integration))
        .route("/admin/grants", get(list_grants))
        .route("/admin/grants/:grant_id/extend", post(extend_grant))
        .route("/admin/grants/:grant_id/revoke", post(revoke_grant))
        .route("/admin/vouchers", post(create_voucher))
}

/// Resolves the session cookie + double-submit CSRF header into an
/// authenticated caller. Every admin route needs this regardless of RBAC
/// outcome, since RBAC denials are themselves audited against an actor.
async fn authenticate_request(services: &AppState, jar: &CookieJar, headers: &HeaderMap) -> Result<AuthenticatedAdmin> {
    let token = jar
        .get(ADMIN_SESSION_COOKIE)
        .map(Cookie::value)
        .ok_or(Error::Unauthorized("no admin session"))?;
    let csrf = headers
        .get(ADMIN_CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Unauthorized("missing csrf token"))?;
    services.admin.authenticate(token, csrf)
}

/// Enforces the deny-by-default RBAC matrix for `action`, auditing a denial
/// before returning it so a rejected attempt is never silent.
fn authorize(
    services: &AppState,
    admin: &AuthenticatedAdmin,
    action: &'static str,
    target_type: &str,
    target_id: &str,
    correlation_id: &str,
) -> Result<()> {
    if crate::service::rbac::is_allowed(admin.role, action) {
        return Ok(());
    }
    let _ = services.audit.record_as(
        &admin.username,
        admin.role,
        action,
        target_type,
        target_id,
        AuditOutcome::Denied,
        correlation_id,
        None,
    );
    Err(Error::RbacForbidden("caller's role may not perform this action"))
}

#[derive(Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Serialize)]
struct LoginResponse {
    csrf_token: String,
}

async fn login(State(services): State<AppState>, jar: CookieJar, Json(body): Json<LoginRequest>) -> Result<Response> {
    let (token, csrf_token) = services.admin.login(&body.username, &body.password)?;
    let cookie = Cookie::build(ADMIN_SESSION_COOKIE, token)
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(services.config.tls_enabled())
        .path("/admin")
        .finish();
    Ok((jar.add(cookie), Json(LoginResponse { csrf_token })).into_response())
}

async fn logout(State(services): State<AppState>, jar: CookieJar) -> Result<Response> {
    if let Some(token) = jar.get(ADMIN_SESSION_COOKIE).map(Cookie::value) {
        services.admin.logout(token)?;
    }
    let jar = jar.remove(Cookie::from(ADMIN_SESSION_COOKIE));
    Ok((jar, http::StatusCode::NO_CONTENT).into_response())
}

async fn get_portal_config(State(services): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Json<PortalSettings>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "portal_config.view", "portal_config", "singleton", &correlation_id)?;
    Ok(Json(services.portal_config.get()?))
}

async fn put_portal_config(
    State(services): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(update): Json<PortalSettingsUpdate>,
) -> Result<Json<PortalSettings>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "portal_config.manage", "portal_config", "singleton", &correlation_id)?;

    let settings = services.portal_config.update(update)?;
    services.rate_limiter.set_config(
        settings.rate_limit_attempts,
        std::time::Duration::from_secs(settings.rate_limit_window_seconds),
    );

    services.audit.record_as(
        &admin.username,
        admin.role,
        "portal_config.manage",
        "portal_config",
        "singleton",
        AuditOutcome::Success,
        &correlation_id,
        None,
    )?;

    Ok(Json(settings))
}

async fn list_integrations(State(services): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Json<Vec<IntegrationConfig>>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "integrations.view", "integration", "*", &correlation_id)?;
    Ok(Json(services.reservation.list_all_integrations()?))
}

async fn create_integration(
    State(services): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<IntegrationConfig>,
) -> Result<Json<IntegrationConfig>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "integrations.manage", "integration", &body.integration_id, &correlation_id)?;
    Ok(Json(
        services.reservation.upsert_integration(body, &admin.username, admin.role, &correlation_id)?,
    ))
}

async fn update_integration(
    State(services): State<AppState>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(mut body): Json<IntegrationConfig>,
) -> Result<Json<IntegrationConfig>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "integrations.manage", "integration", &integration_id, &correlation_id)?;
    body.integration_id = integration_id;
    Ok(Json(
        services.reservation.upsert_integration(body, &admin.username, admin.role, &correlation_id)?,
    ))
}

async fn delete_integration(
    State(services): State<AppState>,
    Path(integration_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Response> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "integrations.manage", "integration", &integration_id, &correlation_id)?;
    services.reservation.delete_integration(&integration_id, &admin.username, admin.role, &correlation_id)?;
    Ok(http::StatusCode::NO_CONTENT.into_response())
}

async fn list_grants(State(services): State<AppState>, headers: HeaderMap, jar: CookieJar) -> Result<Json<Vec<AccessGrant>>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "grants.view", "grant", "*", &correlation_id)?;
    Ok(Json(services.grant.list(DEFAULT_GRANT_LIST_LIMIT)?))
}

#[derive(Deserialize)]
struct ExtendRequest {
    minutes: i64,
}

async fn extend_grant(
    State(services): State<AppState>,
    Path(grant_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<ExtendRequest>,
) -> Result<Json<AccessGrant>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "grants.extend", "grant", &grant_id, &correlation_id)?;
    Ok(Json(
        services.grant.extend(&grant_id, body.minutes, &admin.username, admin.role, &correlation_id).await?,
    ))
}

async fn revoke_grant(
    State(services): State<AppState>,
    Path(grant_id): Path<String>,
    headers: HeaderMap,
    jar: CookieJar,
) -> Result<Json<AccessGrant>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "grants.revoke", "grant", &grant_id, &correlation_id)?;
    Ok(Json(
        services.grant.revoke(&grant_id, &admin.username, admin.role, &correlation_id).await?,
    ))
}

#[derive(Deserialize)]
struct CreateVoucherRequest {
    length: Option<usize>,
    duration_minutes: i64,
    up_kbps: Option<i64>,
    down_kbps: Option<i64>,
    booking_ref: Option<String>,
}

async fn create_voucher(
    State(services): State<AppState>,
    headers: HeaderMap,
    jar: CookieJar,
    Json(body): Json<CreateVoucherRequest>,
) -> Result<Json<Voucher>> {
    let correlation_id = correlation_id(&headers);
    let admin = authenticate_request(&services, &jar, &headers).await?;
    authorize(&services, &admin, "vouchers.create", "voucher", "new", &correlation_id)?;

    let portal_settings = services.portal_config.get()?;
    let length = body.length.unwrap_or(portal_settings.voucher_length_default);
    let voucher = services
        .voucher
        .create(length, body.duration_minutes, body.up_kbps, body.down_kbps, body.booking_ref)
        .await?;

    services.audit.record_as(
        &admin.username,
        admin.role,
        "vouchers.create",
        "voucher",
        &voucher.code,
        AuditOutcome::Success,
        &correlation_id,
        None,
    )?;

    Ok(Json(voucher))
}
