use chrono::Utc;
use rusqlite::params;
use serde::Serialize;
use uuid::Uuid;

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::Result;

use super::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuditOutcome {
    Success,
    Denied,
    Error,
}

impl AuditOutcome {
    fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Denied => "denied",
            Self::Error => "error",
        }
    }
}

/// Append-only audit log. No method here exposes update or delete — the
/// invariant that every state-changing operation writes exactly one entry is
/// upheld by callers (grant/voucher/rbac services), not by this type.
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn build(db: Database) -> Self {
        Self { db }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record_as(
        &self,
        actor: &str,
        role: Role,
        action: &str,
        target_type: &str,
        target_id: &str,
        outcome: AuditOutcome,
        correlation_id: &str,
        meta: Option<&str>,
    ) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO audit_log
                    (id, timestamp_utc, actor, role_snapshot, action, target_type, target_id,
                     outcome, correlation_id, meta)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    to_rfc3339(now),
                    actor,
                    role.as_str(),
                    action,
                    target_type,
                    target_id,
                    outcome.as_str(),
                    correlation_id,
                    meta,
                ],
            )?;
            Ok(())
        })
    }

    /// Convenience for system-initiated operations (pollers, sweepers) that
    /// have no authenticated actor or role of their own.
    pub fn record(
        &self,
        action: &str,
        target_type: &str,
        target_id: &str,
        outcome: AuditOutcome,
        correlation_id: &str,
        meta: Option<&str>,
    ) -> Result<()> {
        self.record_as("system", Role::Admin, action, target_type, target_id, outcome, correlation_id, meta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_writes_one_row() {
        let db = Database::open_in_memory().unwrap();
        let log = AuditLog::build(db.clone());
        log.record("grants.revoke", "grant", "abc", AuditOutcome::Success, "corr-1", None)
            .unwrap();

        let count: i64 = db
            .read(|conn| conn.query_row("SELECT COUNT(*) FROM audit_log", [], |r| r.get(0)).map_err(Into::into))
            .unwrap();
        assert_eq!(count, 1);
    }
}
