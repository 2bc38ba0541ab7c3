pub mod data;

use serde::Serialize;

use crate::database::Database;
use crate::utils::error::Error;
use crate::Result;

use self::data::Data;

/// The runtime-editable subset of portal behavior (§3 `PortalConfig`). The
/// controller/reservation credentials stay in the file-based `Config`; this
/// is only the slice an admin can change without a restart.
#[derive(Debug, Clone, Serialize)]
pub struct PortalSettings {
    pub rate_limit_attempts: u32,
    pub rate_limit_window_seconds: u64,
    pub success_redirect_url: String,
    pub voucher_length_default: usize,
}

/// Partial update: `None` leaves the field unchanged.
#[derive(Debug, Default, serde::Deserialize)]
pub struct PortalSettingsUpdate {
    pub rate_limit_attempts: Option<u32>,
    pub rate_limit_window_seconds: Option<u64>,
    pub success_redirect_url: Option<String>,
    pub voucher_length_default: Option<usize>,
}

pub struct Service {
    data: Data,
}

impl Service {
    pub fn build(db: Database) -> Self {
        Self { data: Data::new(db) }
    }

    pub fn get(&self) -> Result<PortalSettings> {
        self.data.get()
    }

    pub fn update(&self, update: PortalSettingsUpdate) -> Result<PortalSettings> {
        if let Some(n) = update.rate_limit_attempts {
            if !(1..=100).contains(&n) {
                return Err(Error::BadRequest("rate_limit_attempts must be between 1 and 100"));
            }
        }
        if let Some(s) = update.rate_limit_window_seconds {
            if !(10..=3600).contains(&s) {
                return Err(Error::BadRequest("rate_limit_window_seconds must be between 10 and 3600"));
            }
        }
        if let Some(n) = update.voucher_length_default {
            if !(4..=24).contains(&n) {
                return Err(Error::BadRequest("voucher_length_default must be between 4 and 24"));
            }
        }

        self.data.update(&update)?;
        self.data.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_rejects_out_of_range_values() {
        let db = Database::open_in_memory().unwrap();
        let service = Service::build(db);

        let err = service
            .update(PortalSettingsUpdate { rate_limit_attempts: Some(0), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn update_persists_changed_fields() {
        let db = Database::open_in_memory().unwrap();
        let service = Service::build(db);

        let updated = service
            .update(PortalSettingsUpdate { success_redirect_url: Some("/thanks".to_owned()), ..Default::default() })
            .unwrap();
        assert_eq!(updated.success_redirect_url, "/thanks");
        assert_eq!(updated.rate_limit_attempts, 5);
    }
}
