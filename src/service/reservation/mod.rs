pub mod data;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{CleanupConfig, ReservationConfig};
use crate::database::Database;
use crate::domain::parse_rfc3339;
use crate::service::rbac::audit::{AuditLog, AuditOutcome};
use crate::utils::error::Error;
use crate::Result;

use self::data::Data;

/// Grants are refused for an integration once it has missed this many
/// consecutive polls (3 to flag stale, 3 more — 6 total — to refuse).
const STALE_WARN_THRESHOLD: i64 = 3;
const STALE_REFUSE_THRESHOLD: i64 = 6;
const EARLY_CHECKIN_WINDOW_MINUTES: i64 = 60;

/// How often the poll loop wakes to check whether any integration's own
/// schedule is due. Independent of `poll_interval_seconds`, which only sets
/// the normal per-integration cadence once a poll succeeds.
const SCHEDULE_TICK_SECS: u64 = 5;
/// Base of the error backoff: `min(60 * 2^consecutive_errors, 300)` seconds.
const ERROR_BACKOFF_BASE_SECS: u64 = 60;
const ERROR_BACKOFF_CAP_SECS: u64 = 300;

/// Per-integration poll scheduling state, kept in memory only — it governs
/// when the *next* poll attempt happens, which is a process-local concern
/// distinct from the persisted `stale_count` (used for the warn/refuse
/// thresholds an admin or the booking validator can observe).
struct IntegrationSchedule {
    consecutive_errors: u32,
    next_attempt_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RentalEvent {
    pub integration_id: String,
    pub event_index: i64,
    pub slot_name: Option<String>,
    pub slot_code: Option<String>,
    pub last_four: Option<String>,
    pub start_utc: DateTime<Utc>,
    pub end_utc: DateTime<Utc>,
    pub raw_attributes: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl RentalEvent {
    pub(crate) fn identifier_for(&self, auth_attribute: &str) -> Option<&str> {
        match auth_attribute {
            "slot_name" => self.slot_name.as_deref().or(self.slot_code.as_deref()),
            "last_four" => self.last_four.as_deref(),
            _ => self
                .slot_code
                .as_deref()
                .or(self.slot_name.as_deref())
                .or(self.last_four.as_deref()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrationConfig {
    pub integration_id: String,
    pub enabled: bool,
    pub auth_attribute: String,
    pub checkout_grace_minutes: i64,
    #[serde(default)]
    pub last_sync_utc: Option<DateTime<Utc>>,
    #[serde(default)]
    pub stale_count: i64,
}

#[derive(Debug, Deserialize)]
struct SourceAttributes {
    slot_code: Option<String>,
    slot_name: Option<String>,
    last_four: Option<String>,
    start: String,
    end: String,
    #[serde(flatten)]
    extra: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct SourceEvent {
    attributes: SourceAttributes,
}

pub struct Service {
    data: Data,
    client: reqwest::Client,
    config: ReservationConfig,
    cleanup: CleanupConfig,
    audit: Arc<AuditLog>,
    schedule: Mutex<HashMap<String, IntegrationSchedule>>,
}

impl Service {
    pub fn build(db: Database, config: ReservationConfig, cleanup: CleanupConfig, audit: Arc<AuditLog>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .map_err(Error::from)?;
        Ok(Self {
            data: Data::new(db),
            client,
            config,
            cleanup,
            audit,
            schedule: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the periodic poller and the daily retention cleaner as
    /// independent cooperative loops.
    pub fn spawn(self: Arc<Self>) {
        let poller = self.clone();
        tokio::spawn(async move { poller.poll_loop().await });

        let cleaner = self;
        tokio::spawn(async move { cleaner.retention_loop().await });
    }

    /// Wakes on a short fixed tick and polls only the integrations whose own
    /// schedule is due — a fresh integration polls immediately, a healthy one
    /// resumes the normal `poll_interval_seconds` cadence, and one with
    /// consecutive errors backs off per integration without slowing down
    /// every other integration in the batch.
    async fn poll_loop(&self) {
        let mut interval = tokio::time::interval(StdDuration::from_secs(SCHEDULE_TICK_SECS));
        loop {
            interval.tick().await;
            self.poll_due_integrations().await;
        }
    }

    fn is_due(&self, integration_id: &str, now: DateTime<Utc>) -> bool {
        let schedule = self.schedule.lock();
        schedule.get(integration_id).map_or(true, |s| now >= s.next_attempt_utc)
    }

    async fn poll_due_integrations(&self) {
        let integrations = match self.data.list_enabled_integrations() {
            Ok(i) => i,
            Err(e) => {
                warn!("failed to list integrations for poll: {}", e);
                return;
            }
        };

        let now = Utc::now();
        let mut polled_any = false;
        for integration in integrations {
            if !self.is_due(&integration.integration_id, now) {
                continue;
            }
            polled_any = true;
            self.poll_and_reschedule(&integration, now).await;
        }

        if polled_any {
            info!("reservation poll cycle complete");
        }
    }

    /// Polls one integration and updates both its in-memory schedule (next
    /// attempt + consecutive-error count) and its persisted `stale_count`.
    async fn poll_and_reschedule(&self, integration: &IntegrationConfig, now: DateTime<Utc>) {
        match self.poll_integration(integration).await {
            Ok(()) => {
                let _ = self.data.mark_poll_success(&integration.integration_id, now);
                self.schedule.lock().insert(
                    integration.integration_id.clone(),
                    IntegrationSchedule {
                        consecutive_errors: 0,
                        next_attempt_utc: now + Duration::seconds(self.config.poll_interval_seconds as i64),
                    },
                );
            }
            Err(e) => {
                warn!(integration_id = integration.integration_id, error = %e, "reservation poll failed");

                let consecutive_errors = {
                    let mut schedule = self.schedule.lock();
                    let entry = schedule.entry(integration.integration_id.clone()).or_insert(IntegrationSchedule {
                        consecutive_errors: 0,
                        next_attempt_utc: now,
                    });
                    entry.consecutive_errors += 1;
                    let delay_secs = ERROR_BACKOFF_BASE_SECS
                        .saturating_mul(1u64 << entry.consecutive_errors.min(32))
                        .min(ERROR_BACKOFF_CAP_SECS);
                    entry.next_attempt_utc = now + Duration::seconds(delay_secs as i64);
                    entry.consecutive_errors
                };
                warn!(
                    integration_id = integration.integration_id,
                    consecutive_errors, "integration poll backing off"
                );

                match self.data.mark_poll_failure(&integration.integration_id) {
                    Ok(stale_count) if stale_count == STALE_WARN_THRESHOLD => {
                        warn!(integration_id = integration.integration_id, "integration is now stale");
                    }
                    Ok(stale_count) if stale_count >= STALE_REFUSE_THRESHOLD => {
                        warn!(integration_id = integration.integration_id, "integration beyond tolerance, refusing new booking grants");
                    }
                    _ => {}
                }
            }
        }
    }

    async fn poll_integration(&self, integration: &IntegrationConfig) -> Result<()> {
        let url = format!(
            "{}/{}",
            self.config.base_url.as_str().trim_end_matches('/'),
            integration.integration_id
        );

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?
            .error_for_status()?;

        let events: Vec<SourceEvent> = response.json().await?;
        let now = Utc::now();

        for (index, event) in events.into_iter().enumerate() {
            let start_utc = parse_rfc3339(&event.attributes.start)?;
            let end_utc = parse_rfc3339(&event.attributes.end)?;
            let raw_attributes = serde_json::to_string(&event.attributes.extra).unwrap_or_default();

            self.data.upsert_event(&RentalEvent {
                integration_id: integration.integration_id.clone(),
                event_index: index as i64,
                slot_name: event.attributes.slot_name,
                slot_code: event.attributes.slot_code,
                last_four: event.attributes.last_four,
                start_utc,
                end_utc,
                raw_attributes,
                created_utc: now,
                updated_utc: now,
            })?;
        }

        Ok(())
    }

    async fn retention_loop(&self) {
        loop {
            let now = Utc::now();
            let next_run = next_cleanup_hour(now, self.cleanup.cleanup_hour_local);
            let wait = (next_run - now).to_std().unwrap_or(StdDuration::from_secs(60));
            tokio::time::sleep(wait).await;
            self.run_retention().await;
        }
    }

    async fn run_retention(&self) {
        let cutoff = Utc::now() - Duration::days(self.cleanup.event_retention_days);
        match self.data.delete_where_end_before(cutoff) {
            Ok(deleted) => {
                info!(deleted, "reservation event retention cleanup ran");
                let _ = self.audit.record(
                    "reservation.retention_cleanup",
                    "rental_event",
                    "batch",
                    AuditOutcome::Success,
                    "system",
                    Some(&deleted.to_string()),
                );
            }
            Err(e) => warn!("retention cleanup failed: {}", e),
        }
    }

    pub fn find_integration(&self, integration_id: &str) -> Result<Option<IntegrationConfig>> {
        self.data.find_integration(integration_id)
    }

    pub fn list_enabled_integrations(&self) -> Result<Vec<IntegrationConfig>> {
        self.data.list_enabled_integrations()
    }

    pub fn list_all_integrations(&self) -> Result<Vec<IntegrationConfig>> {
        self.data.list_all_integrations()
    }

    pub fn upsert_integration(
        &self,
        config: IntegrationConfig,
        actor: &str,
        role: crate::service::rbac::Role,
        correlation_id: &str,
    ) -> Result<IntegrationConfig> {
        self.data.upsert_integration(&config)?;
        self.audit.record_as(
            actor,
            role,
            "integrations.manage",
            "integration",
            &config.integration_id,
            AuditOutcome::Success,
            correlation_id,
            None,
        )?;
        self.data
            .find_integration(&config.integration_id)?
            .ok_or(Error::NotFound("integration not found after write"))
    }

    pub fn delete_integration(
        &self,
        integration_id: &str,
        actor: &str,
        role: crate::service::rbac::Role,
        correlation_id: &str,
    ) -> Result<()> {
        self.data.delete_integration(integration_id)?;
        self.audit.record_as(
            actor,
            role,
            "integrations.manage",
            "integration",
            integration_id,
            AuditOutcome::Success,
            correlation_id,
            None,
        )?;
        Ok(())
    }

    /// Validates a booking code against the cached events for `integration_id`.
    pub fn validate(&self, user_input: &str, integration_id: &str, now: DateTime<Utc>) -> Result<RentalEvent> {
        let integration = self
            .data
            .find_integration(integration_id)?
            .ok_or(Error::NotFound("unknown integration"))?;

        if integration.stale_count >= STALE_REFUSE_THRESHOLD {
            return Err(Error::IntegrationUnavailable);
        }

        let trimmed = user_input.trim();
        let events = self.data.events_for_integration(integration_id)?;

        let matched = events
            .into_iter()
            .find(|event| {
                event
                    .identifier_for(&integration.auth_attribute)
                    .is_some_and(|id| id.eq_ignore_ascii_case(trimmed))
            })
            .ok_or(Error::NotFound("no matching booking"))?;

        let grace = Duration::minutes(integration.checkout_grace_minutes);
        let early = Duration::minutes(EARLY_CHECKIN_WINDOW_MINUTES);
        if now < matched.start_utc - early || now > matched.end_utc + grace {
            return Err(Error::OutsideWindow);
        }

        Ok(matched)
    }
}

/// Computes the next occurrence of `hour` in the *local* timezone (§4.E:
/// "daily at a configured hour (default 03:00 local)"), returned as a UTC
/// instant for the sleep duration in `retention_loop`.
fn next_cleanup_hour(now: DateTime<Utc>, hour: u32) -> DateTime<Utc> {
    use chrono::{Local, Timelike};

    let local_now = now.with_timezone(&Local);
    let today_at_hour = local_now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .expect("valid hour")
        .and_local_timezone(Local)
        .single()
        .unwrap_or(local_now);

    let target = if local_now.hour() < hour {
        today_at_hour
    } else {
        today_at_hour + Duration::days(1)
    };
    target.with_timezone(&Utc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(slot_code: &str, start: DateTime<Utc>, end: DateTime<Utc>) -> RentalEvent {
        RentalEvent {
            integration_id: "integ-1".to_owned(),
            event_index: 0,
            slot_name: None,
            slot_code: Some(slot_code.to_owned()),
            last_four: None,
            start_utc: start,
            end_utc: end,
            raw_attributes: "{}".to_owned(),
            created_utc: start,
            updated_utc: start,
        }
    }

    #[test]
    fn identifier_falls_back_through_attributes() {
        let e = event("4821", Utc::now(), Utc::now());
        assert_eq!(e.identifier_for("slot_code"), Some("4821"));
        assert_eq!(e.identifier_for("slot_name"), Some("4821"));
    }

    #[test]
    fn grace_window_boundary() {
        let db = Database::open_in_memory().unwrap();
        db.write(|conn| {
            conn.execute(
                "INSERT INTO integration_configs (integration_id, enabled, auth_attribute, checkout_grace_minutes)
                 VALUES ('integ-1', 1, 'slot_code', 15)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let end = Utc::now();
        let data = Data::new(db.clone());
        data.upsert_event(&event("4821", end - Duration::hours(2), end)).unwrap();

        let audit = Arc::new(AuditLog::build(db.clone()));
        let service = Service::build(
            db,
            ReservationConfig {
                base_url: "https://example.invalid".parse().unwrap(),
                token: "tok".to_owned(),
                poll_interval_seconds: 60,
            },
            CleanupConfig {
                event_retention_days: 7,
                cleanup_hour_local: 3,
            },
            audit,
        )
        .unwrap();

        let within_grace = end + Duration::minutes(10);
        assert!(service.validate("4821", "integ-1", within_grace).is_ok());

        let beyond_grace = end + Duration::minutes(16);
        assert!(service.validate("4821", "integ-1", beyond_grace).is_err());
    }
}
