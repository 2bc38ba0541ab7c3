//! The guest-facing authorization pipeline: captive-portal detection routes
//! plus the `GET`/`POST /guest/authorize` form that actually redeems a code.

use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration as StdDuration;

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode, Uri};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::{Form, Router};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use tracing::{info, warn};
use url::form_urlencoded;
use uuid::Uuid;

use crate::domain::{ceil_minute, floor_minute};
use crate::service::grant::{AccessGrant, CreateGrant};
use crate::service::reservation::RentalEvent;
use crate::service::voucher::Voucher;
use crate::utils::error::Error;
use crate::utils::{mac, HtmlEscape};
use crate::Result;

use super::{apply_security_headers, correlation_id, csrf, ip, redirect, AppState};

/// Request headers an access point might use to carry the client's MAC.
const MAC_HEADERS: &[&str] = &["x-mac-address", "x-client-mac", "client-mac"];

/// Window during which a grant created without a known MAC (session-token
/// fallback) waits for reconciliation before being revoked.
const SESSION_RECONCILE_SECS: u64 = 30;

const DETECTION_ROUTES: &[&str] = &[
    "/generate_204",
    "/gen_204",
    "/connecttest.txt",
    "/ncsi.txt",
    "/hotspot-detect.html",
    "/library/test/success.html",
    "/success.txt",
];

pub fn router() -> Router<AppState> {
    let mut router = Router::new().route("/guest/authorize", get(show_form).post(submit));
    for path in DETECTION_ROUTES {
        router = router.route(path, get(detect));
    }
    router
}

fn voucher_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new("^[A-Z0-9]{4,24}$").expect("static voucher pattern is valid"))
}

/// Redirects a captive-portal detection probe to the authorization form,
/// preserving the probed path as the `continue` destination.
async fn detect(uri: Uri) -> Response {
    let original = uri.to_string();
    let encoded: String = form_urlencoded::byte_serialize(original.as_bytes()).collect();
    let location = format!("/guest/authorize?continue={encoded}");
    (StatusCode::FOUND, [(axum::http::header::LOCATION, location)]).into_response()
}

#[derive(Deserialize)]
struct ContinueQuery {
    #[serde(rename = "continue")]
    continue_to: Option<String>,
}

async fn show_form(State(services): State<AppState>, Query(q): Query<ContinueQuery>, jar: CookieJar) -> Response {
    let (token, cookie) = csrf::issue(services.config.security.csrf_token_bytes, services.config.tls_enabled());
    let continue_to = q.continue_to.unwrap_or_default();

    let body = format!(
        "<!doctype html>\n\
         <html><head><meta charset=\"utf-8\"><title>Network access</title></head>\n\
         <body>\n\
         <form method=\"post\" action=\"/guest/authorize\">\n\
         <input type=\"hidden\" name=\"csrf_token\" value=\"{token}\">\n\
         <input type=\"hidden\" name=\"continue\" value=\"{continue_to}\">\n\
         <label>Access code <input type=\"text\" name=\"code\" autocomplete=\"off\" required></label>\n\
         <button type=\"submit\">Connect</button>\n\
         </form>\n\
         </body></html>",
        token = HtmlEscape(&token),
        continue_to = HtmlEscape(&continue_to),
    );

    let jar = jar.add(cookie);
    let mut response = (jar, Html(body)).into_response();
    apply_security_headers(&mut response);
    response
}

#[derive(Deserialize)]
struct GuestForm {
    code: String,
    csrf_token: String,
    #[serde(rename = "continue")]
    continue_to: Option<String>,
}

async fn submit(
    State(services): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    jar: CookieJar,
    Form(form): Form<GuestForm>,
) -> Result<Response> {
    let correlation_id = correlation_id(&headers);

    let trusted = ip::parse_trusted_cidrs(&services.config.portal.trusted_proxy_cidrs);
    let client_ip = ip::derive_client_ip(peer.ip(), &headers, &trusted);

    match services.rate_limiter.check(client_ip) {
        crate::service::rate_limit::Verdict::Allowed => {}
        crate::service::rate_limit::Verdict::Limited { retry_after } => {
            return Err(Error::RateLimited { retry_after_secs: retry_after.as_secs() });
        }
    }

    csrf::verify(
        jar.get(csrf::GUEST_CSRF_COOKIE).map(Cookie::value),
        Some(form.csrf_token.as_str()),
    )?;

    let now = Utc::now();
    let code = form.code.trim();
    let grant = authorize_code(&services, code, &headers, now, &correlation_id).await?;

    let portal_settings = services.portal_config.get()?;
    let destination = redirect::validate_redirect(
        form.continue_to.as_deref(),
        &services.config.portal.redirect_allowlist_hosts,
        &portal_settings.success_redirect_url,
    );

    let grant_cookie = Cookie::build("grant_id", grant.id.clone())
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(services.config.tls_enabled())
        .path("/")
        .finish();

    let mut response = (jar.add(grant_cookie), Redirect::to(&destination)).into_response();
    apply_security_headers(&mut response);
    Ok(response)
}

/// Runs the unified code dispatch (stage 4), MAC capture (stage 5), and grant
/// creation (stage 6) in one place, since booking and voucher paths only
/// differ in which fields they populate on the same [`CreateGrant`].
async fn authorize_code(
    services: &AppState,
    code: &str,
    headers: &HeaderMap,
    now: DateTime<Utc>,
    correlation_id: &str,
) -> Result<AccessGrant> {
    let upper = code.to_uppercase();

    let booking = find_booking_match(services, code, now);
    let voucher = if voucher_pattern().is_match(&upper) {
        find_voucher_match(services, &upper, now).await
    } else {
        None
    };

    let (mac_address, session_token) = capture_mac(headers);

    let grant = match (booking, voucher) {
        (Some((event, integration_id, identifier)), maybe_voucher) => {
            if maybe_voucher.is_some() {
                info!(code, "code matched both a voucher and a booking; booking takes precedence");
            }
            services
                .grant
                .create(
                    CreateGrant {
                        voucher_code: None,
                        booking_ref: Some(identifier),
                        integration_id: Some(integration_id),
                        user_input_code: Some(code.to_owned()),
                        mac: mac_address,
                        session_token,
                        start_utc: floor_minute(now),
                        end_utc: ceil_minute(event.end_utc),
                    },
                    correlation_id,
                )
                .await?
                .0
        }
        (None, Some(voucher)) => {
            let window = services.voucher.window_for(now, voucher.duration_minutes);
            let (grant, is_new) = services
                .grant
                .create(
                    CreateGrant {
                        voucher_code: Some(voucher.code.clone()),
                        booking_ref: None,
                        integration_id: None,
                        user_input_code: Some(code.to_owned()),
                        mac: mac_address,
                        session_token,
                        start_utc: window.start_utc,
                        end_utc: window.end_utc,
                    },
                    correlation_id,
                )
                .await?;
            // Only the request that actually inserted the grant bumps
            // `redeemed_count` — concurrent duplicates converge on the same
            // grant above and must not double-count the redemption.
            if is_new {
                services.voucher.mark_redeemed(&voucher.code, now)?;
            }
            grant
        }
        (None, None) => return Err(Error::NotFound("invalid authorization code")),
    };

    if let Some(token) = grant.session_token.clone() {
        spawn_reconciliation_timeout(services.clone(), grant.id.clone(), token, correlation_id.to_owned());
    }

    Ok(grant)
}

fn find_booking_match(services: &AppState, code: &str, now: DateTime<Utc>) -> Option<(RentalEvent, String, String)> {
    let integrations = services.reservation.list_enabled_integrations().ok()?;
    for integration in integrations {
        if let Ok(event) = services.reservation.validate(code, &integration.integration_id, now) {
            let identifier = event.identifier_for(&integration.auth_attribute).unwrap_or(code).to_owned();
            return Some((event, integration.integration_id, identifier));
        }
    }
    None
}

async fn find_voucher_match(services: &AppState, code: &str, now: DateTime<Utc>) -> Option<Voucher> {
    let voucher = services.voucher.find_by_code_ci(code).await.ok().flatten()?;
    services.voucher.check_redeemable(&voucher, now).ok()?;
    Some(voucher)
}

/// Reads the first recognized MAC header, normalizing to uppercase colon
/// form. Absent a usable header, mints a transient session token instead so
/// the grant can still be created pending MAC reconciliation.
fn capture_mac(headers: &HeaderMap) -> (String, Option<String>) {
    for name in MAC_HEADERS {
        if let Some(normalized) = headers.get(*name).and_then(|v| v.to_str().ok()).and_then(mac::normalize) {
            return (normalized, None);
        }
    }
    let token = Uuid::new_v4().to_string();
    (format!("PENDING:{token}"), Some(token))
}

fn spawn_reconciliation_timeout(services: AppState, grant_id: String, session_token: String, correlation_id: String) {
    tokio::spawn(async move {
        tokio::time::sleep(StdDuration::from_secs(SESSION_RECONCILE_SECS)).await;
        if let Err(e) = services.grant.revoke_if_unreconciled(&grant_id, &session_token, &correlation_id).await {
            warn!(grant_id, error = %e, "failed to revoke unreconciled grant");
        }
    });
}
