//! Double-submit CSRF cookie for the guest form.
//!
//! The admin session's own CSRF token (issued by `service::admin`) is
//! verified the same way a request arrives, but the guest flow has no
//! session to hang a token off, so it gets its own short-lived cookie that's
//! minted on the `GET` that renders the form and checked back on the `POST`.

use axum_extra::extract::cookie::{Cookie, SameSite};

use crate::utils::error::Error;
use crate::utils::random_string;
use crate::Result;

pub const GUEST_CSRF_COOKIE: &str = "guest_csrf";

/// Builds a fresh CSRF token and the cookie that carries it.
///
/// `secure` should mirror whether the listener is terminating TLS itself;
/// marking the cookie `Secure` over plain HTTP would make browsers drop it.
pub fn issue(token_bytes: usize, secure: bool) -> (String, Cookie<'static>) {
    let token = random_string(token_bytes);
    let cookie = Cookie::build(GUEST_CSRF_COOKIE, token.clone())
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(secure)
        .path("/")
        .finish();
    (token, cookie)
}

/// Validates a submitted token against the cookie's value.
pub fn verify(cookie_value: Option<&str>, submitted: Option<&str>) -> Result<()> {
    match (cookie_value, submitted) {
        (Some(cookie), Some(submitted)) if !cookie.is_empty() && cookie == submitted => Ok(()),
        _ => Err(Error::Unauthorized("csrf token mismatch")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_cookie_round_trips() {
        let (token, cookie) = issue(32, true);
        assert_eq!(cookie.value(), token);
        assert_eq!(cookie.same_site(), Some(SameSite::Lax));
        assert_eq!(cookie.http_only(), Some(true));
    }

    #[test]
    fn mismatched_tokens_are_rejected() {
        assert!(verify(Some("abc"), Some("abc")).is_ok());
        assert!(verify(Some("abc"), Some("xyz")).is_err());
        assert!(verify(None, Some("abc")).is_err());
        assert!(verify(Some("abc"), None).is_err());
    }
}
