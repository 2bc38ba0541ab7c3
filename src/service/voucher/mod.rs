pub mod data;

use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::database::Database;
use crate::domain::{ceil_minute, floor_minute};
use crate::utils::error::Error;
use crate::utils::random_code;
use crate::Result;

use self::data::Data;

const CODE_ALPHABET_PATTERN: &str = "A-Z0-9";
const MAX_COLLISION_ATTEMPTS: u32 = 5;
const COLLISION_BACKOFF_MS: [u64; MAX_COLLISION_ATTEMPTS as usize] = [50, 100, 200, 400, 800];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VoucherStatus {
    Unused,
    Active,
    Expired,
    Revoked,
}

impl VoucherStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unused => "UNUSED",
            Self::Active => "ACTIVE",
            Self::Expired => "EXPIRED",
            Self::Revoked => "REVOKED",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "ACTIVE" => Self::Active,
            "EXPIRED" => Self::Expired,
            "REVOKED" => Self::Revoked,
            _ => Self::Unused,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Voucher {
    pub code: String,
    pub created_utc: DateTime<Utc>,
    pub duration_minutes: i64,
    pub expires_utc: DateTime<Utc>,
    pub up_kbps: Option<i64>,
    pub down_kbps: Option<i64>,
    pub status: VoucherStatus,
    pub booking_ref: Option<String>,
    pub redeemed_count: i64,
    pub last_redeemed_utc: Option<DateTime<Utc>>,
}

/// Parameters accepted for a freshly-generated grant window. Voucher redemption
/// always produces both; the grant service only needs to know the result.
pub struct RedeemedWindow {
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

pub struct Service {
    data: Data,
}

impl Service {
    pub fn build(db: Database) -> Self {
        Self { data: Data::new(db) }
    }

    /// Generates and inserts a new voucher, retrying on code collision with the
    /// fixed backoff schedule `[50, 100, 200, 400, 800]`ms up to 5 attempts.
    pub async fn create(
        &self,
        length: usize,
        duration_minutes: i64,
        up_kbps: Option<i64>,
        down_kbps: Option<i64>,
        booking_ref: Option<String>,
    ) -> Result<Voucher> {
        if !(4..=24).contains(&length) {
            return Err(Error::BadRequest("voucher length must be between 4 and 24"));
        }

        let now = Utc::now();
        let expires_utc = now + Duration::minutes(duration_minutes);

        for attempt in 0..MAX_COLLISION_ATTEMPTS {
            let code = random_code(length);
            let voucher = Voucher {
                code: code.clone(),
                created_utc: now,
                duration_minutes,
                expires_utc,
                up_kbps,
                down_kbps,
                status: VoucherStatus::Unused,
                booking_ref: booking_ref.clone(),
                redeemed_count: 0,
                last_redeemed_utc: None,
            };

            match self.data.insert(&voucher) {
                Ok(()) => return Ok(voucher),
                Err(Error::Conflict(_)) => {
                    warn!(attempt, code, "voucher code collision (alphabet {})", CODE_ALPHABET_PATTERN);
                    tokio::time::sleep(StdDuration::from_millis(COLLISION_BACKOFF_MS[attempt as usize])).await;
                }
                Err(other) => return Err(other),
            }
        }

        Err(Error::VoucherCollision)
    }

    pub async fn find_by_code_ci(&self, code: &str) -> Result<Option<Voucher>> {
        self.data.find_by_code_ci(code)
    }

    /// Validates that `code` can be redeemed right now, without mutating state.
    /// Actual grant creation + increment happens in the grant service so the two
    /// stay inside one serialized section per `(code, mac)`.
    pub fn check_redeemable(&self, voucher: &Voucher, now: DateTime<Utc>) -> Result<()> {
        // Guest-visible outcome is generic either way; a revoked voucher looks
        // like no voucher at all, an expired one looks like a window miss.
        if voucher.status == VoucherStatus::Revoked {
            return Err(Error::NotFound("voucher has been revoked"));
        }
        if now >= voucher.expires_utc {
            return Err(Error::OutsideWindow);
        }
        Ok(())
    }

    pub fn window_for(&self, now: DateTime<Utc>, duration_minutes: i64) -> RedeemedWindow {
        RedeemedWindow {
            start_utc: floor_minute(now),
            end_utc: ceil_minute(now + Duration::minutes(duration_minutes)),
        }
    }

    pub fn mark_redeemed(&self, code: &str, now: DateTime<Utc>) -> Result<()> {
        info!(code, "voucher redeemed");
        self.data.mark_redeemed(code, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_rejects_invalid_length() {
        let db = Database::open_in_memory().unwrap();
        let service = Service::build(db);
        let err = service.create(3, 60, None, None, None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));

        let err = service.create(25, 60, None, None, None).await.unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[tokio::test]
    async fn create_succeeds_and_is_findable_case_insensitively() {
        let db = Database::open_in_memory().unwrap();
        let service = Service::build(db);
        let voucher = service.create(10, 120, None, None, None).await.unwrap();

        let found = service
            .find_by_code_ci(&voucher.code.to_lowercase())
            .await
            .unwrap()
            .expect("voucher should be found case-insensitively");
        assert_eq!(found.code, voucher.code);
    }

    #[tokio::test]
    async fn expired_voucher_is_not_redeemable() {
        let db = Database::open_in_memory().unwrap();
        let service = Service::build(db);
        let voucher = service.create(10, 60, None, None, None).await.unwrap();

        let far_future = voucher.expires_utc + Duration::days(1);
        let err = service.check_redeemable(&voucher, far_future).unwrap_err();
        assert!(matches!(err, Error::OutsideWindow));
    }
}
