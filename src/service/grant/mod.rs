pub mod data;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;
use uuid::Uuid;

use crate::database::Database;
use crate::domain::ceil_minute;
use crate::service::controller::retry_queue::{Queue as RetryQueue, RetryOp};
use crate::service::rbac::audit::{AuditLog, AuditOutcome};
use crate::service::rbac::Role;
use crate::utils::error::Error;
use crate::Result;

use self::data::Data;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum GrantStatus {
    Pending,
    Active,
    Expired,
    Revoked,
}

impl GrantStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
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
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AccessGrant {
    pub id: String,
    pub voucher_code: Option<String>,
    pub booking_ref: Option<String>,
    pub integration_id: Option<String>,
    pub user_input_code: Option<String>,
    pub mac: String,
    pub session_token: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub controller_grant_id: Option<String>,
    pub status: GrantStatus,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

/// Parameters for creating a grant, shared by voucher redemption and booking
/// validation — the two only differ in which identity field is populated.
pub struct CreateGrant {
    pub voucher_code: Option<String>,
    pub booking_ref: Option<String>,
    pub integration_id: Option<String>,
    pub user_input_code: Option<String>,
    pub mac: String,
    /// Set when the guest pipeline couldn't read a MAC header yet and is
    /// holding the grant open for the 30s reconciliation window.
    pub session_token: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
}

/// Per-identity lock registry. A `(mac, identifier)` pair is serialized across
/// concurrent create/extend/revoke calls so that races on the same device never
/// produce more than one grant — the in-process analogue of the unique DB
/// constraint on active grants.
#[derive(Default)]
struct IdentityLocks {
    locks: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl IdentityLocks {
    async fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_owned()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }
}

pub struct Service {
    data: Data,
    identity_locks: IdentityLocks,
    retry_queue: Arc<RetryQueue>,
    audit: Arc<AuditLog>,
}

impl Service {
    pub fn build(db: Database, retry_queue: Arc<RetryQueue>, audit: Arc<AuditLog>) -> Self {
        Self {
            data: Data::new(db),
            identity_locks: IdentityLocks::default(),
            retry_queue,
            audit,
        }
    }

    fn identity_key(mac: &str, voucher_code: Option<&str>, booking_ref: Option<&str>) -> String {
        format!("{mac}|{}", voucher_code.or(booking_ref).unwrap_or_default())
    }

    /// Creates a grant for the given identity, unless one already exists for
    /// this `(mac, identifier)` — in which case the existing grant is returned
    /// so that concurrent redemptions converge on a single row. The returned
    /// `bool` is `true` only for the caller that actually inserted the row, so
    /// a voucher's `redeemed_count` is bumped exactly once per identity even
    /// when many concurrent requests race on the same `(mac, code)`.
    pub async fn create(&self, params: CreateGrant, correlation_id: &str) -> Result<(AccessGrant, bool)> {
        let key = Self::identity_key(&params.mac, params.voucher_code.as_deref(), params.booking_ref.as_deref());
        let lock = self.identity_locks.lock_for(&key).await;
        let _guard = lock.lock().await;

        if let Some(existing) = self.data.find_active_by_identity(
            &params.mac,
            params.voucher_code.as_deref(),
            params.booking_ref.as_deref(),
        )? {
            return Ok((existing, false));
        }

        let now = Utc::now();
        let grant = AccessGrant {
            id: Uuid::new_v4().to_string(),
            voucher_code: params.voucher_code,
            booking_ref: params.booking_ref,
            integration_id: params.integration_id,
            user_input_code: params.user_input_code,
            mac: params.mac,
            session_token: params.session_token,
            start_utc: params.start_utc,
            end_utc: params.end_utc,
            controller_grant_id: None,
            status: GrantStatus::Pending,
            created_utc: now,
            updated_utc: now,
        };

        self.data.insert(&grant)?;

        // Enqueue happens-after the grant commit: a visible grant always implies
        // an enqueued controller operation.
        self.retry_queue.enqueue(RetryOp::Authorize {
            grant_id: grant.id.clone(),
            mac: grant.mac.clone(),
            end_utc: grant.end_utc,
        })?;

        self.audit.record(
            "grants.create",
            "grant",
            &grant.id,
            AuditOutcome::Success,
            correlation_id,
            None,
        )?;

        info!(grant_id = grant.id, "grant created");
        Ok((grant, true))
    }

    pub async fn find(&self, id: &str) -> Result<AccessGrant> {
        self.data.find_by_id(id)?.ok_or(Error::NotFound("grant not found"))
    }

    /// Extends a grant. EXPIRED grants reactivate (forward motion on `end_utc`
    /// from `max(end, now)`); REVOKED grants cannot be extended. Only reached
    /// from the admin surface, so the audit entry carries the calling admin's
    /// identity rather than the generic `system` actor.
    pub async fn extend(&self, grant_id: &str, minutes: i64, actor: &str, role: Role, correlation_id: &str) -> Result<AccessGrant> {
        let grant = self.find(grant_id).await?;
        if grant.status == GrantStatus::Revoked {
            return Err(Error::Conflict("cannot extend a revoked grant"));
        }

        let now = Utc::now();
        let base = if grant.status == GrantStatus::Expired {
            grant.end_utc.max(now)
        } else {
            grant.end_utc
        };
        let new_end = ceil_minute(base + Duration::minutes(minutes));

        self.data.update_end(grant_id, new_end, GrantStatus::Active, now)?;

        self.retry_queue.enqueue(RetryOp::Extend {
            grant_id: grant_id.to_owned(),
            mac: grant.mac.clone(),
            end_utc: new_end,
        })?;

        self.audit.record_as(
            actor,
            role,
            "grants.extend",
            "grant",
            grant_id,
            AuditOutcome::Success,
            correlation_id,
            None,
        )?;

        self.find(grant_id).await
    }

    /// Idempotent: revoking an already-REVOKED grant is a no-op success.
    /// `actor`/`role` is `"system"`/[`Role::Admin`] for the unattended
    /// reconciliation sweep, or the calling admin's identity otherwise.
    pub async fn revoke(&self, grant_id: &str, actor: &str, role: Role, correlation_id: &str) -> Result<AccessGrant> {
        let grant = self.find(grant_id).await?;
        if grant.status != GrantStatus::Revoked {
            let now = Utc::now();
            self.data.update_status(grant_id, GrantStatus::Revoked, now)?;
            self.retry_queue.enqueue(RetryOp::Revoke {
                grant_id: grant_id.to_owned(),
                mac: grant.mac.clone(),
            })?;
        }

        self.audit.record_as(
            actor,
            role,
            "grants.revoke",
            "grant",
            grant_id,
            AuditOutcome::Success,
            correlation_id,
            None,
        )?;

        self.find(grant_id).await
    }

    pub fn record_controller_grant_id(&self, grant_id: &str, controller_grant_id: &str) -> Result<()> {
        self.data.set_controller_grant_id(grant_id, controller_grant_id)
    }

    /// Replaces a grant's placeholder session-token MAC with the reconciled
    /// address, once the client's real MAC becomes known.
    pub async fn reconcile_mac(&self, grant_id: &str, mac: &str) -> Result<()> {
        self.data.update_mac(grant_id, mac)
    }

    /// Revokes the grant if it is still waiting on MAC reconciliation after
    /// the 30s window; a no-op if the MAC was reconciled in time.
    pub async fn revoke_if_unreconciled(&self, grant_id: &str, session_token: &str, correlation_id: &str) -> Result<()> {
        let grant = self.find(grant_id).await?;
        if grant.session_token.as_deref() == Some(session_token) {
            self.revoke(grant_id, "system", Role::Admin, correlation_id).await?;
        }
        Ok(())
    }

    /// Background sweep: ACTIVE grants past `end_utc` become EXPIRED locally.
    /// No controller call is needed — the controller already enforces the
    /// `time` parameter sent at authorize.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        self.data.expire_due(now)
    }

    pub async fn find_active_by_identity(
        &self,
        mac: &str,
        voucher_code: Option<&str>,
        booking_ref: Option<&str>,
    ) -> Result<Option<AccessGrant>> {
        self.data.find_active_by_identity(mac, voucher_code, booking_ref)
    }

    /// Lists the most recently created grants, newest first, for the admin
    /// listing view.
    pub fn list(&self, limit: i64) -> Result<Vec<AccessGrant>> {
        self.data.list(limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::controller::retry_queue;
    use crate::service::controller::NullController;
    use crate::service::rbac::audit::AuditLog;

    fn build_service(db: Database) -> Service {
        let audit = Arc::new(AuditLog::build(db.clone()));
        let retry_queue = retry_queue::spawn(db.clone(), Arc::new(NullController), audit.clone());
        Service::build(db, retry_queue, audit)
    }

    #[tokio::test]
    async fn create_is_idempotent_per_identity() {
        let db = Database::open_in_memory().unwrap();
        let service = build_service(db);

        let now = Utc::now();
        let params = || CreateGrant {
            voucher_code: Some("ABCD123456".to_owned()),
            booking_ref: None,
            integration_id: None,
            user_input_code: Some("abcd123456".to_owned()),
            mac: "aa:bb:cc:dd:ee:ff".to_owned(),
            session_token: None,
            start_utc: now,
            end_utc: now + Duration::hours(2),
        };

        let (first, first_is_new) = service.create(params(), "corr-1").await.unwrap();
        let (second, second_is_new) = service.create(params(), "corr-2").await.unwrap();
        assert_eq!(first.id, second.id);
        assert!(first_is_new);
        assert!(!second_is_new);
    }

    #[tokio::test]
    async fn revoke_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        let service = build_service(db);
        let now = Utc::now();
        let (grant, _) = service
            .create(
                CreateGrant {
                    voucher_code: Some("XYZ".to_owned()),
                    booking_ref: None,
                    integration_id: None,
                    user_input_code: None,
                    mac: "11:22:33:44:55:66".to_owned(),
                    session_token: None,
                    start_utc: now,
                    end_utc: now + Duration::hours(1),
                },
                "corr",
            )
            .await
            .unwrap();

        let revoked_once = service.revoke(&grant.id, "alice", Role::Admin, "corr").await.unwrap();
        assert_eq!(revoked_once.status, GrantStatus::Revoked);
        let revoked_twice = service.revoke(&grant.id, "alice", Role::Admin, "corr").await.unwrap();
        assert_eq!(revoked_twice.status, GrantStatus::Revoked);

        let err = service.extend(&grant.id, 10, "alice", Role::Admin, "corr").await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }
}
