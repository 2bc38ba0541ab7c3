pub mod data;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::config::SecurityConfig;
use crate::database::Database;
use crate::service::rbac::Role;
use crate::utils::error::Error;
use crate::utils::{random_string, verify_password_hash};
use crate::Result;

use self::data::Data;

pub struct AdminAccount {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub role: Role,
    pub created_utc: DateTime<Utc>,
}

/// An authenticated admin session: just enough to drive the RBAC gate and the
/// audit `actor`/`role_snapshot` fields. Session mechanics beyond this contract
/// (password UX, cookie attributes) belong to the collaborator that owns login.
pub struct AuthenticatedAdmin {
    pub admin_id: String,
    pub username: String,
    pub role: Role,
}

pub struct Service {
    data: Data,
    security: SecurityConfig,
}

impl Service {
    pub fn build(db: Database, security: SecurityConfig) -> Self {
        Self { data: Data::new(db), security }
    }

    /// Verifies credentials and, on success, opens a session. Returns the raw
    /// session token and its paired CSRF token (double-submit cookie companion).
    pub fn login(&self, username: &str, password: &str) -> Result<(String, String)> {
        let account = self
            .data
            .find_by_username(username)?
            .ok_or(Error::Unauthorized("invalid credentials"))?;

        if !verify_password_hash(&account.password_hash, password) {
            return Err(Error::Unauthorized("invalid credentials"));
        }

        let token = Uuid::new_v4().to_string();
        let csrf_token = random_string(self.security.csrf_token_bytes);
        let now = Utc::now();
        let expires_utc = now + Duration::hours(self.security.session_max_hours as i64);

        self.data.insert_session(&token, &account.id, &csrf_token, now, expires_utc)?;
        Ok((token, csrf_token))
    }

    pub fn logout(&self, token: &str) -> Result<()> {
        self.data.delete_session(token)
    }

    /// Validates a session token, enforcing both the idle timeout (refreshed on
    /// every call) and the hard session-max ceiling (never extended).
    pub fn authenticate(&self, token: &str, csrf_token: &str) -> Result<AuthenticatedAdmin> {
        let session = self.data.find_session(token)?.ok_or(Error::Unauthorized("no such session"))?;
        if csrf_token != session.csrf_token {
            return Err(Error::Unauthorized("csrf token mismatch"));
        }

        let now = Utc::now();
        if now >= session.expires_utc {
            self.data.delete_session(token)?;
            return Err(Error::Unauthorized("session expired"));
        }
        let idle_cutoff = session.last_seen_utc + Duration::minutes(self.security.session_idle_minutes as i64);
        if now >= idle_cutoff {
            self.data.delete_session(token)?;
            return Err(Error::Unauthorized("session idle timeout"));
        }

        self.data.touch_session(token, now)?;

        Ok(AuthenticatedAdmin {
            admin_id: session.admin_id,
            username: session.username,
            role: session.role,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SecurityConfig;
    use crate::utils::calculate_password_hash;

    fn build_service() -> (Service, Database) {
        let db = Database::open_in_memory().unwrap();
        let security = SecurityConfig {
            session_idle_minutes: 30,
            session_max_hours: 8,
            csrf_token_bytes: 32,
        };
        (Service::build(db.clone(), security), db)
    }

    fn seed_account(db: &Database, role: &str) {
        let hash = calculate_password_hash("correct horse battery staple").unwrap();
        db.write(|conn| {
            conn.execute(
                "INSERT INTO admin_accounts (id, username, password_hash, role, created_utc)
                 VALUES ('admin-1', 'alice', ?1, ?2, datetime('now'))",
                rusqlite::params![hash, role],
            )?;
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn login_rejects_wrong_password() {
        let (service, db) = build_service();
        seed_account(&db, "admin");
        let err = service.login("alice", "wrong").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[test]
    fn login_then_authenticate_round_trips() {
        let (service, db) = build_service();
        seed_account(&db, "operator");
        let (token, csrf) = service.login("alice", "correct horse battery staple").unwrap();
        let authed = service.authenticate(&token, &csrf).unwrap();
        assert_eq!(authed.username, "alice");
        assert_eq!(authed.role, Role::Operator);
    }

    #[test]
    fn authenticate_rejects_mismatched_csrf() {
        let (service, db) = build_service();
        seed_account(&db, "admin");
        let (token, _csrf) = service.login("alice", "correct horse battery staple").unwrap();
        let err = service.authenticate(&token, "not-the-token").unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }
}
