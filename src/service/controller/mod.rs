pub mod retry_queue;

use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::config::ControllerConfig;
use crate::utils::error::Error;
use crate::Result;

const RETRY_BACKOFFS_SECS: [u64; 4] = [1, 2, 4, 8];
const REQUEST_TIMEOUT: StdDuration = StdDuration::from_secs(30);

/// One interface, multiple Wi-Fi controller implementations — selected by
/// configuration rather than compiled in, so a future controller vendor only
/// needs a new impl of this trait.
#[async_trait]
pub trait Controller: Send + Sync {
    async fn authorize(&self, mac: &str, end_utc: DateTime<Utc>) -> Result<()>;
    async fn revoke(&self, identity: &str) -> Result<()>;
    async fn extend(&self, identity: &str, new_end_utc: DateTime<Utc>) -> Result<()>;
    async fn health(&self) -> bool;
}

#[derive(Default)]
struct Session {
    cookie: Option<String>,
    csrf_token: Option<String>,
}

/// TP-Link Omada external-portal adapter.
///
/// Maintains one live session per controller: logs in on startup and
/// re-logs-in whenever a call comes back `401` or with a missing/invalid CSRF
/// token, caching the cookie and CSRF token in between.
pub struct OmadaController {
    client: Client,
    config: ControllerConfig,
    session: RwLock<Session>,
}

impl OmadaController {
    pub fn new(config: ControllerConfig) -> Result<Self> {
        let client = Client::builder()
            .danger_accept_invalid_certs(config.allow_self_signed)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            client,
            config,
            session: RwLock::new(Session::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}{path}",
            self.config.base_url.as_str().trim_end_matches('/'),
            self.config.controller_id
        )
    }

    async fn login(&self) -> Result<()> {
        let body = json!({
            "name": self.config.operator_username,
            "password": self.config.operator_password,
        });

        let mut request = self.client.post(self.url("/api/v2/hotspot/login")).json(&body);
        request = request.timeout(REQUEST_TIMEOUT);

        let response = request.send().await?;
        if response.status() != StatusCode::OK {
            return Err(Error::bad_controller_response("controller login rejected"));
        }

        let cookie = response
            .headers()
            .get(reqwest::header::SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        #[derive(Deserialize)]
        struct LoginResult {
            #[serde(rename = "csrfToken")]
            csrf_token: Option<String>,
        }

        let csrf_token = response
            .json::<LoginResult>()
            .await
            .ok()
            .and_then(|r| r.csrf_token);

        let mut session = self.session.write().await;
        session.cookie = cookie;
        session.csrf_token = csrf_token;

        info!("controller session refreshed");
        Ok(())
    }

    async fn ensure_session(&self) -> Result<()> {
        let needs_login = {
            let session = self.session.read().await;
            session.cookie.is_none() || session.csrf_token.is_none()
        };
        if needs_login {
            self.login().await?;
        }
        Ok(())
    }

    async fn call(&self, path: &str, body: serde_json::Value) -> Result<()> {
        self.ensure_session().await?;

        let mut attempt = 0usize;
        loop {
            let (cookie, csrf_token) = {
                let session = self.session.read().await;
                (session.cookie.clone(), session.csrf_token.clone())
            };

            let mut request = self.client.post(self.url(path)).json(&body).timeout(REQUEST_TIMEOUT);
            if let Some(cookie) = &cookie {
                request = request.header(reqwest::header::COOKIE, cookie);
            }
            if let Some(csrf_token) = &csrf_token {
                request = request.header("Csrf-Token", csrf_token);
            }

            match request.send().await {
                Ok(response) if response.status() == StatusCode::OK => return Ok(()),
                Ok(response) if response.status() == StatusCode::UNAUTHORIZED => {
                    warn!("controller session expired, forcing re-login");
                    self.login().await?;
                }
                Ok(response) => {
                    warn!(status = %response.status(), "controller call returned an error status");
                }
                Err(e) => {
                    warn!(error = %e, "controller call failed");
                }
            }

            if attempt >= RETRY_BACKOFFS_SECS.len() - 1 {
                return Err(Error::RetryExhausted);
            }
            tokio::time::sleep(StdDuration::from_secs(RETRY_BACKOFFS_SECS[attempt])).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl Controller for OmadaController {
    async fn authorize(&self, mac: &str, end_utc: DateTime<Utc>) -> Result<()> {
        let time_micros = end_utc.timestamp_micros();
        let body = json!({
            "clientMac": mac,
            "site": self.config.controller_id,
            "time": time_micros,
            "authType": 4,
        });
        self.call("/api/v2/hotspot/extPortal/auth", body).await
    }

    async fn revoke(&self, identity: &str) -> Result<()> {
        let body = json!({ "clientMac": identity, "site": self.config.controller_id, "time": 0, "authType": 4 });
        self.call("/api/v2/hotspot/extPortal/auth", body).await
    }

    async fn extend(&self, identity: &str, new_end_utc: DateTime<Utc>) -> Result<()> {
        self.authorize(identity, new_end_utc).await
    }

    async fn health(&self) -> bool {
        self.ensure_session().await.is_ok()
    }
}

/// Test/offline double used when no controller is configured.
#[derive(Default)]
pub struct NullController;

#[async_trait]
impl Controller for NullController {
    async fn authorize(&self, _mac: &str, _end_utc: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn revoke(&self, _identity: &str) -> Result<()> {
        Ok(())
    }

    async fn extend(&self, _identity: &str, _new_end_utc: DateTime<Utc>) -> Result<()> {
        Ok(())
    }

    async fn health(&self) -> bool {
        true
    }
}
