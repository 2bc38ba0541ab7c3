use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::utils::error::Error;
use crate::Result;

use super::{Voucher, VoucherStatus};

fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

pub struct Data {
    db: Database,
}

impl Data {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts a freshly generated voucher. Returns `Error::Conflict` on a
    /// unique-key collision so the service layer can retry with a new code.
    pub fn insert(&self, voucher: &Voucher) -> Result<()> {
        let result = self.db.write(|conn| {
            conn.execute(
                "INSERT INTO vouchers
                    (code, created_utc, duration_minutes, expires_utc, up_kbps, down_kbps,
                     status, booking_ref, redeemed_count, last_redeemed_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, NULL)",
                params![
                    voucher.code,
                    to_rfc3339(voucher.created_utc),
                    voucher.duration_minutes,
                    to_rfc3339(voucher.expires_utc),
                    voucher.up_kbps,
                    voucher.down_kbps,
                    voucher.status.as_str(),
                    voucher.booking_ref,
                ],
            )?;
            Ok(())
        });

        match result {
            Err(Error::Sqlite {
                source:
                    rusqlite::Error::SqliteFailure(
                        rusqlite::ffi::Error {
                            code: rusqlite::ErrorCode::ConstraintViolation,
                            ..
                        },
                        _,
                    ),
            }) => Err(Error::Conflict("voucher code already exists")),
            other => other,
        }
    }

    pub fn find_by_code_ci(&self, code: &str) -> Result<Option<Voucher>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT code, created_utc, duration_minutes, expires_utc, up_kbps, down_kbps,
                        status, booking_ref, redeemed_count, last_redeemed_utc
                 FROM vouchers WHERE UPPER(code) = UPPER(?1)",
                params![code],
                row_to_voucher,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    /// Transitions a voucher UNUSED→ACTIVE and bumps its redemption counters
    /// in a single statement so concurrent redeemers serialize on the row.
    pub fn mark_redeemed(&self, code: &str, now: chrono::DateTime<chrono::Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE vouchers
                 SET status = CASE WHEN status = 'UNUSED' THEN 'ACTIVE' ELSE status END,
                     redeemed_count = redeemed_count + 1,
                     last_redeemed_utc = ?2
                 WHERE code = ?1",
                params![code, to_rfc3339(now)],
            )?;
            Ok(())
        })
    }

    pub fn set_status(&self, code: &str, status: VoucherStatus) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE vouchers SET status = ?2 WHERE code = ?1",
                params![code, status.as_str()],
            )?;
            Ok(())
        })
    }
}

fn row_to_voucher(row: &rusqlite::Row<'_>) -> rusqlite::Result<Voucher> {
    let created_utc: String = row.get(1)?;
    let expires_utc: String = row.get(3)?;
    let last_redeemed_utc: Option<String> = row.get(9)?;
    let status: String = row.get(6)?;

    Ok(Voucher {
        code: row.get(0)?,
        created_utc: parse_dt(&created_utc)?,
        duration_minutes: row.get(2)?,
        expires_utc: parse_dt(&expires_utc)?,
        up_kbps: row.get(4)?,
        down_kbps: row.get(5)?,
        status: VoucherStatus::from_str(&status),
        booking_ref: row.get(7)?,
        redeemed_count: row.get(8)?,
        last_redeemed_utc: last_redeemed_utc.map(|s| parse_dt(&s)).transpose()?,
    })
}
