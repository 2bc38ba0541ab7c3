use rusqlite::params;

use crate::database::Database;
use crate::Result;

use super::{PortalSettings, PortalSettingsUpdate};

pub struct Data {
    db: Database,
}

impl Data {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn get(&self) -> Result<PortalSettings> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT rate_limit_attempts, rate_limit_window_seconds, success_redirect_url, voucher_length_default
                 FROM portal_config WHERE id = 1",
                [],
                |row| {
                    let rate_limit_attempts: i64 = row.get(0)?;
                    let rate_limit_window_seconds: i64 = row.get(1)?;
                    let voucher_length_default: i64 = row.get(3)?;
                    Ok(PortalSettings {
                        rate_limit_attempts: rate_limit_attempts as u32,
                        rate_limit_window_seconds: rate_limit_window_seconds as u64,
                        success_redirect_url: row.get(2)?,
                        voucher_length_default: voucher_length_default as usize,
                    })
                },
            )
            .map_err(Into::into)
        })
    }

    pub fn update(&self, update: &PortalSettingsUpdate) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE portal_config SET
                    rate_limit_attempts = COALESCE(?1, rate_limit_attempts),
                    rate_limit_window_seconds = COALESCE(?2, rate_limit_window_seconds),
                    success_redirect_url = COALESCE(?3, success_redirect_url),
                    voucher_length_default = COALESCE(?4, voucher_length_default)
                 WHERE id = 1",
                params![
                    update.rate_limit_attempts,
                    update.rate_limit_window_seconds.map(|n| n as i64),
                    update.success_redirect_url,
                    update.voucher_length_default.map(|n| n as i64),
                ],
            )?;
            Ok(())
        })
    }
}
