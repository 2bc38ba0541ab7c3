use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::Result;

use super::{IntegrationConfig, RentalEvent};

pub struct Data {
    db: Database,
}

fn parse_dt(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))
}

impl Data {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn list_enabled_integrations(&self) -> Result<Vec<IntegrationConfig>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT integration_id, enabled, auth_attribute, checkout_grace_minutes, last_sync_utc, stale_count
                 FROM integration_configs WHERE enabled = 1",
            )?;
            let rows = stmt
                .query_map([], row_to_integration)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn find_integration(&self, integration_id: &str) -> Result<Option<IntegrationConfig>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT integration_id, enabled, auth_attribute, checkout_grace_minutes, last_sync_utc, stale_count
                 FROM integration_configs WHERE integration_id = ?1",
                params![integration_id],
                row_to_integration,
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn list_all_integrations(&self) -> Result<Vec<IntegrationConfig>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT integration_id, enabled, auth_attribute, checkout_grace_minutes, last_sync_utc, stale_count
                 FROM integration_configs ORDER BY integration_id",
            )?;
            let rows = stmt
                .query_map([], row_to_integration)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Creates or fully replaces an integration's settings. Polling state
    /// (`last_sync_utc`, `stale_count`) is preserved on an update and starts
    /// at zero/NULL on first insert.
    pub fn upsert_integration(&self, config: &IntegrationConfig) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO integration_configs (integration_id, enabled, auth_attribute, checkout_grace_minutes)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(integration_id) DO UPDATE SET
                    enabled = excluded.enabled,
                    auth_attribute = excluded.auth_attribute,
                    checkout_grace_minutes = excluded.checkout_grace_minutes",
                params![
                    config.integration_id,
                    config.enabled,
                    config.auth_attribute,
                    config.checkout_grace_minutes,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_integration(&self, integration_id: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute("DELETE FROM integration_configs WHERE integration_id = ?1", params![integration_id])?;
            Ok(())
        })
    }

    pub fn mark_poll_success(&self, integration_id: &str, now: DateTime<Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE integration_configs SET last_sync_utc = ?2, stale_count = 0 WHERE integration_id = ?1",
                params![integration_id, to_rfc3339(now)],
            )?;
            Ok(())
        })
    }

    pub fn mark_poll_failure(&self, integration_id: &str) -> Result<i64> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE integration_configs SET stale_count = stale_count + 1 WHERE integration_id = ?1",
                params![integration_id],
            )?;
            conn.query_row(
                "SELECT stale_count FROM integration_configs WHERE integration_id = ?1",
                params![integration_id],
                |row| row.get(0),
            )
            .map_err(Into::into)
        })
    }

    pub fn upsert_event(&self, event: &RentalEvent) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO rental_events
                    (integration_id, event_index, slot_name, slot_code, last_four,
                     start_utc, end_utc, raw_attributes, created_utc, updated_utc)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 ON CONFLICT(integration_id, event_index) DO UPDATE SET
                    slot_name = excluded.slot_name,
                    slot_code = excluded.slot_code,
                    last_four = excluded.last_four,
                    start_utc = excluded.start_utc,
                    end_utc = excluded.end_utc,
                    raw_attributes = excluded.raw_attributes,
                    updated_utc = excluded.updated_utc",
                params![
                    event.integration_id,
                    event.event_index,
                    event.slot_name,
                    event.slot_code,
                    event.last_four,
                    to_rfc3339(event.start_utc),
                    to_rfc3339(event.end_utc),
                    event.raw_attributes,
                    to_rfc3339(event.updated_utc),
                ],
            )?;
            Ok(())
        })
    }

    pub fn events_for_integration(&self, integration_id: &str) -> Result<Vec<RentalEvent>> {
        self.db.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT integration_id, event_index, slot_name, slot_code, last_four,
                        start_utc, end_utc, raw_attributes, created_utc, updated_utc
                 FROM rental_events WHERE integration_id = ?1 ORDER BY event_index",
            )?;
            let rows = stmt
                .query_map(params![integration_id], row_to_event)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Deletes events whose `end_utc` is before `cutoff`. Returns the count
    /// deleted, for the daily cleanup audit entry.
    pub fn delete_where_end_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.db.write(|conn| {
            let deleted = conn.execute("DELETE FROM rental_events WHERE end_utc < ?1", params![to_rfc3339(cutoff)])?;
            Ok(deleted)
        })
    }
}

fn row_to_integration(row: &rusqlite::Row<'_>) -> rusqlite::Result<IntegrationConfig> {
    let last_sync_utc: Option<String> = row.get(4)?;
    Ok(IntegrationConfig {
        integration_id: row.get(0)?,
        enabled: row.get(1)?,
        auth_attribute: row.get(2)?,
        checkout_grace_minutes: row.get(3)?,
        last_sync_utc: last_sync_utc.map(|s| parse_dt(&s)).transpose()?,
        stale_count: row.get(5)?,
    })
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<RentalEvent> {
    let start_utc: String = row.get(5)?;
    let end_utc: String = row.get(6)?;
    let created_utc: String = row.get(8)?;
    let updated_utc: String = row.get(9)?;

    Ok(RentalEvent {
        integration_id: row.get(0)?,
        event_index: row.get(1)?,
        slot_name: row.get(2)?,
        slot_code: row.get(3)?,
        last_four: row.get(4)?,
        start_utc: parse_dt(&start_utc)?,
        end_utc: parse_dt(&end_utc)?,
        raw_attributes: row.get(7)?,
        created_utc: parse_dt(&created_utc)?,
        updated_utc: parse_dt(&updated_utc)?,
    })
}
