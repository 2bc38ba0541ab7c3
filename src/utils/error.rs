use axum::response::{IntoResponse, Response};
use http::StatusCode;
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The crate-wide error type.
///
/// Variants that wrap another error carry `#[from]` so call sites can use `?` freely;
/// the HTTP mapping in [`Error::status_code`] is the only place that inspects variants.
#[derive(Error, Debug)]
pub enum Error {
    #[error("database error: {source}")]
    Sqlite {
        #[from]
        source: rusqlite::Error,
    },
    #[error("could not reach controller: {source}")]
    Reqwest { source: reqwest::Error },
    #[error("invalid regular expression: {source}")]
    Regex {
        #[from]
        source: regex::Error,
    },
    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    BadConfig(&'static str),
    #[error("database is in an inconsistent state: {0}")]
    BadDatabase(&'static str),
    #[error("could not parse controller response: {0}")]
    BadControllerResponse(&'static str),
    #[error("controller call timed out")]
    ControllerTimeout,
    #[error("controller operation exhausted its retry budget")]
    RetryExhausted,
    #[error("voucher code collided too many times")]
    VoucherCollision,
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    BadRequest(&'static str),
    /// RBAC deny-by-default: an unknown action, or an action the caller's role
    /// has no entry for. Distinct from [`Self::Unauthorized`] (no/expired session).
    #[error("{0}")]
    RbacForbidden(&'static str),
    #[error("{0}")]
    Unauthorized(&'static str),
    #[error("rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },
    #[error("{0}")]
    Conflict(&'static str),
    #[error("booking code is outside its access window")]
    OutsideWindow,
    #[error("a non-revoked grant already exists for this device and code")]
    DuplicateRedemption,
    #[error("the reservation integration is unavailable")]
    IntegrationUnavailable,
    #[error("{0}")]
    Admin(&'static str),
}

/// Distinguishes a request timeout (its own error code) from every other
/// network failure, since `thiserror`'s `#[from]` can't inspect the source.
impl From<reqwest::Error> for Error {
    fn from(source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::ControllerTimeout
        } else {
            Self::Reqwest { source }
        }
    }
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("bad database state: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("bad config: {}", message);
        Self::BadConfig(message)
    }

    pub fn bad_controller_response(message: &'static str) -> Self {
        info!("bad controller response: {}", message);
        Self::BadControllerResponse(message)
    }

    /// Drawn from the fixed error-code enum in the external interface contract.
    fn code(&self) -> &'static str {
        match self {
            Self::Sqlite { .. } | Self::BadDatabase(_) | Self::Io { .. } | Self::Regex { .. } | Self::BadConfig(_) => {
                "INTERNAL_ERROR"
            }
            Self::Reqwest { .. } | Self::BadControllerResponse(_) => "CONTROLLER_UNAVAILABLE",
            Self::ControllerTimeout => "CONTROLLER_TIMEOUT",
            Self::RetryExhausted => "RETRY_EXHAUSTED",
            Self::VoucherCollision => "INTERNAL_ERROR",
            Self::NotFound(_) => "NOT_FOUND",
            Self::BadRequest(_) | Self::Admin(_) => "INVALID_INPUT",
            Self::RbacForbidden(_) => "RBAC_FORBIDDEN",
            Self::Unauthorized(_) => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Conflict(_) => "CONFLICT",
            Self::DuplicateRedemption => "DUPLICATE_REDEMPTION",
            Self::OutsideWindow => "OUTSIDE_WINDOW",
            Self::IntegrationUnavailable => "INTEGRATION_UNAVAILABLE",
        }
    }

    fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) | Self::Admin(_) => StatusCode::BAD_REQUEST,
            Self::RbacForbidden(_) => StatusCode::FORBIDDEN,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Conflict(_) | Self::DuplicateRedemption => StatusCode::CONFLICT,
            Self::OutsideWindow => StatusCode::GONE,
            Self::IntegrationUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            Self::Reqwest { .. } | Self::BadControllerResponse(_) | Self::ControllerTimeout | Self::RetryExhausted => {
                StatusCode::BAD_GATEWAY
            }
            Self::Sqlite { .. }
            | Self::BadDatabase(_)
            | Self::BadConfig(_)
            | Self::Regex { .. }
            | Self::Io { .. }
            | Self::VoucherCollision => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Masks errors that could leak internal state before they reach a client.
    /// Guest-visible messages are deliberately generic; specifics live in audit only.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Sqlite { .. } | Self::BadDatabase(_) | Self::Io { .. } | Self::VoucherCollision => {
                "an internal error occurred".to_owned()
            }
            Self::Reqwest { .. } | Self::BadControllerResponse(_) | Self::ControllerTimeout | Self::RetryExhausted => {
                "the wireless controller is temporarily unavailable".to_owned()
            }
            Self::NotFound(_) | Self::Conflict(_) | Self::DuplicateRedemption => {
                "invalid authorization code".to_owned()
            }
            _ => self.to_string(),
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
    code: &'static str,
    correlation_id: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let correlation_id = uuid::Uuid::new_v4().to_string();

        if status.is_server_error() {
            error!(correlation_id, "{}", self);
        } else {
            warn!(correlation_id, "{}", self);
        }

        let body = ErrorEnvelope {
            error: &self.sanitized_message(),
            code: self.code(),
            correlation_id,
        };

        let mut response = (status, axum::Json(body)).into_response();
        if let Self::RateLimited { retry_after_secs } = self {
            if let Ok(value) = http::HeaderValue::from_str(&retry_after_secs.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}
