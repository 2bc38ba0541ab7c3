use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::service::rbac::Role;
use crate::Result;

use super::AdminAccount;

pub struct SessionRow {
    pub admin_id: String,
    pub username: String,
    pub role: Role,
    pub csrf_token: String,
    pub last_seen_utc: DateTime<Utc>,
    pub expires_utc: DateTime<Utc>,
}

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

    pub fn find_by_username(&self, username: &str) -> Result<Option<AdminAccount>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT id, username, password_hash, role, created_utc FROM admin_accounts WHERE username = ?1",
                params![username],
                |row| {
                    let created_utc: String = row.get(4)?;
                    let role: String = row.get(3)?;
                    Ok(AdminAccount {
                        id: row.get(0)?,
                        username: row.get(1)?,
                        password_hash: row.get(2)?,
                        role: Role::from_str(&role).unwrap_or(Role::Viewer),
                        created_utc: parse_dt(&created_utc)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn insert_session(
        &self,
        token: &str,
        admin_id: &str,
        csrf_token: &str,
        now: DateTime<Utc>,
        expires_utc: DateTime<Utc>,
    ) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO admin_sessions (token, admin_id, csrf_token, created_utc, last_seen_utc, expires_utc)
                 VALUES (?1, ?2, ?3, ?4, ?4, ?5)",
                params![token, admin_id, csrf_token, to_rfc3339(now), to_rfc3339(expires_utc)],
            )?;
            Ok(())
        })
    }

    pub fn find_session(&self, token: &str) -> Result<Option<SessionRow>> {
        self.db.read(|conn| {
            conn.query_row(
                "SELECT s.admin_id, a.username, a.role, s.csrf_token, s.last_seen_utc, s.expires_utc
                 FROM admin_sessions s JOIN admin_accounts a ON a.id = s.admin_id
                 WHERE s.token = ?1",
                params![token],
                |row| {
                    let role: String = row.get(2)?;
                    let last_seen_utc: String = row.get(4)?;
                    let expires_utc: String = row.get(5)?;
                    Ok(SessionRow {
                        admin_id: row.get(0)?,
                        username: row.get(1)?,
                        role: Role::from_str(&role).unwrap_or(Role::Viewer),
                        csrf_token: row.get(3)?,
                        last_seen_utc: parse_dt(&last_seen_utc)?,
                        expires_utc: parse_dt(&expires_utc)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
        })
    }

    pub fn touch_session(&self, token: &str, now: DateTime<Utc>) -> Result<()> {
        self.db.write(|conn| {
            conn.execute(
                "UPDATE admin_sessions SET last_seen_utc = ?2 WHERE token = ?1",
                params![token, to_rfc3339(now)],
            )?;
            Ok(())
        })
    }

    pub fn delete_session(&self, token: &str) -> Result<()> {
        self.db.write(|conn| {
            conn.execute("DELETE FROM admin_sessions WHERE token = ?1", params![token])?;
            Ok(())
        })
    }
}
