//! Post-authorization redirect validation.
//!
//! Only a relative path beginning with a single `/` is trusted by default;
//! an absolute `http(s)` URL is accepted only if its host appears in the
//! configured allowlist. Everything else (protocol-relative, triple-slash,
//! backslash tricks, other schemes) falls back to the configured success URL.

/// Validates `raw` against the redirect policy, returning either it (idempotent
/// on a second pass) or `fallback`.
pub fn validate_redirect(raw: Option<&str>, allowlist_hosts: &[String], fallback: &str) -> String {
    let Some(raw) = raw else { return fallback.to_owned() };

    if is_safe_relative(raw) {
        return raw.to_owned();
    }

    if let Ok(url) = url::Url::parse(raw) {
        if matches!(url.scheme(), "http" | "https") {
            if let Some(host) = url.host_str() {
                if allowlist_hosts.iter().any(|h| h.eq_ignore_ascii_case(host)) {
                    return raw.to_owned();
                }
            }
        }
    }

    fallback.to_owned()
}

/// A single-slash relative path: not `//host` (protocol-relative), not
/// `///x` (triple-slash), and free of backslashes that some browsers still
/// treat as path separators.
fn is_safe_relative(raw: &str) -> bool {
    raw.starts_with('/') && !raw.starts_with("//") && !raw.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;

    const FALLBACK: &str = "/welcome";

    #[test]
    fn relative_path_passes_through() {
        assert_eq!(validate_redirect(Some("/account"), &[], FALLBACK), "/account");
    }

    #[test]
    fn rejects_protocol_relative_and_friends() {
        assert_eq!(validate_redirect(Some("//evil.example/x"), &[], FALLBACK), FALLBACK);
        assert_eq!(validate_redirect(Some("///x"), &[], FALLBACK), FALLBACK);
        assert_eq!(validate_redirect(Some("\\\\evil.example\\x"), &[], FALLBACK), FALLBACK);
        assert_eq!(validate_redirect(Some("javascript:alert(1)"), &[], FALLBACK), FALLBACK);
        assert_eq!(validate_redirect(Some("file:///etc/passwd"), &[], FALLBACK), FALLBACK);
    }

    #[test]
    fn absolute_url_requires_allowlisted_host() {
        let allowlist = vec!["portal.example".to_owned()];
        assert_eq!(validate_redirect(Some("https://portal.example/ok"), &allowlist, FALLBACK), "https://portal.example/ok");
        assert_eq!(validate_redirect(Some("https://evil.example/ok"), &allowlist, FALLBACK), FALLBACK);
    }

    #[test]
    fn validator_is_idempotent() {
        let once = validate_redirect(Some("//evil.example/x"), &[], FALLBACK);
        let twice = validate_redirect(Some(&once), &[], FALLBACK);
        assert_eq!(once, twice);
    }

    #[test]
    fn missing_continue_falls_back() {
        assert_eq!(validate_redirect(None, &[], FALLBACK), FALLBACK);
    }
}
