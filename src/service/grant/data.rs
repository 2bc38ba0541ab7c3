use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::Result;

use super::{AccessGrant, GrantStatus};

pub struct Data {
    db: Database,
}

impl Data {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn insert(&self, grant: &AccessGrant) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO access_grants
                    (id, voucher_code, booking_ref, integration_id, user_input_code, mac,
                     session_token, start_utc, end_utc, controller_grant_id, status,
                     created_utc, updated_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    grant.id,
                    grant.voucher_code,
                    grant.booking_ref,
                    grant.integration_id,
                    grant.user_input_code,
                    grant.mac,
                    grant.session_token,
                    to_rfc3339(grant.start_utc),
                    to_rfc3339(grant.end_utc),
                    grant.controller_grant_id,
                    grant.status.as_str(),
                    to_rfc3339(grant.created_utc),
                    to_rfc3339(grant.updated_utc),
                ],
            )?;
            Ok(())
        })
    }

    pub fn find_by_id(&self, id: &str) -> Result<Option<AccessGrant>> {
        self.db.read(|conn| {
            conn.query_row(&format!("{SELECT} WHERE id = ?1"), params![id], row_to_grant)
                .optional()
                .map_err(Into::into)
        })
    }

    /// Finds a non-REVOKED grant for the same device + identity, used both for
    /// duplicate detection and for the adapter's idempotent-authorize check.
    pub fn find_active_by_identity(
        &self,
        mac: &str,
        voucher_code: Option<&str>,
        booking_ref: Option<&str>,
    ) -> Result<Option<AccessGrant>> {
        self.db.read(|conn| {
            conn.query_row(
                &format!(
                    "{SELECT} WHERE mac = ?1
                        AND status != 'REVOKED'
                        AND ((?2 IS NOT NULL AND voucher_code = ?2) OR (?3 IS NOT NULL AND booking_ref = ?3))"
                ),
                params![mac, voucher_code, booking_ref],
                row_to_grant,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn update_status(&self, id: &str, status: GrantStatus, updated_utc: DateTime<Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE access_grants SET status = ?2, updated_utc = ?3 WHERE id = ?1",
                params![id, status.as_str(), to_rfc3339(updated_utc)],
            )?;
            Ok(())
        })
    }

    pub fn update_end(&self, id: &str, end_utc: DateTime<Utc>, status: GrantStatus, updated_utc: DateTime<Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE access_grants SET end_utc = ?2, status = ?3, updated_utc = ?4 WHERE id = ?1",
                params![id, to_rfc3339(end_utc), status.as_str(), to_rfc3339(updated_utc)],
            )?;
            Ok(())
        })
    }

    /// Reconciles a placeholder session-token MAC to the real address once
    /// it's known; also clears `session_token` since it's no longer needed.
    pub fn update_mac(&self, id: &str, mac: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE access_grants SET mac = ?2, session_token = NULL WHERE id = ?1",
                params![id, mac],
            )?;
            Ok(())
        })
    }

    /// Moves a grant PENDING -> ACTIVE once the controller has acknowledged
    /// the authorize call. A no-op if the grant has since moved on (e.g. an
    /// admin revoked it while the controller call was still in flight).
    pub fn activate_if_pending(&self, id: &str, updated_utc: DateTime<Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE access_grants SET status = 'ACTIVE', updated_utc = ?2 WHERE id = ?1 AND status = 'PENDING'",
                params![id, to_rfc3339(updated_utc)],
            )?;
            Ok(())
        })
    }

    pub fn set_controller_grant_id(&self, id: &str, controller_grant_id: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE access_grants SET controller_grant_id = ?2 WHERE id = ?1",
                params![id, controller_grant_id],
            )?;
            Ok(())
        })
    }

    /// Sweeps ACTIVE grants whose `end_utc` has passed into EXPIRED. Returns the
    /// number of rows changed, for the sweeper's heartbeat log.
    pub fn expire_due(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.write(|conn| {
            let changed = conn.execute(
                "UPDATE access_grants SET status = 'EXPIRED', updated_utc = ?1
                 WHERE status = 'ACTIVE' AND end_utc <= ?1",
                params![to_rfc3339(now)],
            )?;
            Ok(changed)
        })
    }

    pub fn list(&self, limit: i64) -> Result<Vec<AccessGrant>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(&format!("{SELECT} ORDER BY created_utc DESC LIMIT ?1"))?;
            let rows = stmt.query_map(params![limit], row_to_grant)?;
            rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
        })
    }
}

const SELECT: &str = "SELECT id, voucher_code, booking_ref, integration_id, user_input_code, mac,
        session_token, start_utc, end_utc, controller_grant_id, status, created_utc, updated_utc
    FROM access_grants";

fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

fn row_to_grant(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccessGrant> {
    let start_utc: String = row.get(7)?;
    let end_utc: String = row.get(8)?;
    let created_utc: String = row.get(11)?;
    let updated_utc: String = row.get(12)?;
    let status: String = row.get(10)?;

    Ok(AccessGrant {
        id: row.get(0)?,
        voucher_code: row.get(1)?,
        booking_ref: row.get(2)?,
        integration_id: row.get(3)?,
        user_input_code: row.get(4)?,
        mac: row.get(5)?,
        session_token: row.get(6)?,
        start_utc: parse_dt(&start_utc)?,
        end_utc: parse_dt(&end_utc)?,
        controller_grant_id: row.get(9)?,
        status: GrantStatus::from_str(&status),
        created_utc: parse_dt(&created_utc)?,
        updated_utc: parse_dt(&updated_utc)?,
    })
}
