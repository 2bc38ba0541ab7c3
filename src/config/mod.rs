use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    pub database_path: String,
    #[serde(default = "default_log")]
    pub log: String,

    pub controller: ControllerConfig,
    pub reservation: ReservationConfig,
    #[serde(default)]
    pub portal: PortalConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ControllerConfig {
    pub base_url: Url,
    pub controller_id: String,
    pub operator_username: String,
    pub operator_password: String,
    #[serde(default)]
    pub allow_self_signed: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ReservationConfig {
    pub base_url: Url,
    pub token: String,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct PortalConfig {
    #[serde(default = "default_rate_limit_attempts")]
    pub rate_limit_attempts: u32,
    #[serde(default = "default_rate_limit_window_seconds")]
    pub rate_limit_window_seconds: u64,
    #[serde(default = "default_success_redirect_url")]
    pub success_redirect_url: String,
    #[serde(default = "default_trusted_proxy_cidrs")]
    pub trusted_proxy_cidrs: Vec<String>,
    /// Hosts an absolute `continue=` redirect is allowed to target. Empty by
    /// default, since the captive-portal flow normally only ever redirects to
    /// a relative path on the portal itself.
    #[serde(default)]
    pub redirect_allowlist_hosts: Vec<String>,
    #[serde(default = "default_voucher_length_default")]
    pub voucher_length_default: usize,
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            rate_limit_attempts: default_rate_limit_attempts(),
            rate_limit_window_seconds: default_rate_limit_window_seconds(),
            success_redirect_url: default_success_redirect_url(),
            trusted_proxy_cidrs: default_trusted_proxy_cidrs(),
            redirect_allowlist_hosts: Vec::new(),
            voucher_length_default: default_voucher_length_default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_session_idle_minutes")]
    pub session_idle_minutes: u64,
    #[serde(default = "default_session_max_hours")]
    pub session_max_hours: u64,
    #[serde(default = "default_csrf_token_bytes")]
    pub csrf_token_bytes: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            session_idle_minutes: default_session_idle_minutes(),
            session_max_hours: default_session_max_hours(),
            csrf_token_bytes: default_csrf_token_bytes(),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct CleanupConfig {
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
    #[serde(default = "default_cleanup_hour_local")]
    pub cleanup_hour_local: u32,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            event_retention_days: default_event_retention_days(),
            cleanup_hour_local: default_cleanup_hour_local(),
        }
    }
}

const DEPRECATED_KEYS: &[&str] = &["rate_limit_burst"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Check the documentation for the current set of recognized configuration keys");
        }
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("Database path", self.database_path.clone()),
            ("Controller base URL", self.controller.base_url.to_string()),
            ("Controller id", self.controller.controller_id.clone()),
            (
                "Controller allow self-signed",
                self.controller.allow_self_signed.to_string(),
            ),
            ("Reservation base URL", self.reservation.base_url.to_string()),
            (
                "Reservation poll interval (s)",
                self.reservation.poll_interval_seconds.to_string(),
            ),
            (
                "Rate limit",
                format!(
                    "{} attempts / {}s",
                    self.portal.rate_limit_attempts, self.portal.rate_limit_window_seconds
                ),
            ),
            (
                "Trusted proxy CIDRs",
                self.portal.trusted_proxy_cidrs.join(", "),
            ),
            (
                "Session idle / max",
                format!(
                    "{}m / {}h",
                    self.security.session_idle_minutes, self.security.session_max_hours
                ),
            ),
            (
                "Event retention",
                format!("{} days", self.cleanup.event_retention_days),
            ),
            ("TLS", self.tls_enabled().to_string()),
        ];

        let mut msg = "Active config values:\n\n".to_owned();
        for (name, value) in lines {
            msg += &format!("{name}: {value}\n");
        }
        write!(f, "{msg}")
    }
}

fn default_address() -> IpAddr {
    Ipv4Addr::UNSPECIFIED.into()
}

fn default_port() -> u16 {
    8080
}

fn default_log() -> String {
    "info".to_owned()
}

fn default_poll_interval_seconds() -> u64 {
    60
}

fn default_rate_limit_attempts() -> u32 {
    5
}

fn default_rate_limit_window_seconds() -> u64 {
    60
}

fn default_success_redirect_url() -> String {
    "/welcome".to_owned()
}

fn default_trusted_proxy_cidrs() -> Vec<String> {
    vec![
        "10.0.0.0/8".to_owned(),
        "172.16.0.0/12".to_owned(),
        "192.168.0.0/16".to_owned(),
        "127.0.0.1/32".to_owned(),
        "::1/128".to_owned(),
    ]
}

fn default_session_idle_minutes() -> u64 {
    30
}

fn default_session_max_hours() -> u64 {
    8
}

fn default_csrf_token_bytes() -> usize {
    32
}

fn default_voucher_length_default() -> usize {
    10
}

fn default_event_retention_days() -> i64 {
    7
}

fn default_cleanup_hour_local() -> u32 {
    3
}
