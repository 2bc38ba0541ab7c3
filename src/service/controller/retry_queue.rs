//! Durable queue of pending controller operations.
//!
//! Modeled directly on the teacher's outgoing-transaction handler: a background
//! task owns a `FuturesUnordered` of in-flight operations, fed both by a
//! `mpsc` channel for freshly enqueued work and by a replay of durable,
//! not-yet-dead rows from the database at startup. Each identity (here, grant
//! id) gets its own attempt counter so one stuck item never blocks the others.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{error, warn};
use uuid::Uuid;

use crate::database::Database;
use crate::domain::to_rfc3339;
use crate::service::controller::Controller;
use crate::service::grant::data::Data as GrantData;
use crate::service::rbac::audit::{AuditLog, AuditOutcome};
use crate::utils::error::Error;
use crate::Result;

const MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RetryOp {
    Authorize {
        grant_id: String,
        mac: String,
        end_utc: DateTime<Utc>,
    },
    Extend {
        grant_id: String,
        mac: String,
        end_utc: DateTime<Utc>,
    },
    Revoke {
        grant_id: String,
        mac: String,
    },
}

impl RetryOp {
    fn op_type(&self) -> &'static str {
        match self {
            Self::Authorize { .. } => "authorize",
            Self::Extend { .. } => "extend",
            Self::Revoke { .. } => "revoke",
        }
    }

    fn grant_id(&self) -> &str {
        match self {
            Self::Authorize { grant_id, .. } | Self::Extend { grant_id, .. } | Self::Revoke { grant_id, .. } => grant_id,
        }
    }
}

struct QueuedItem {
    id: String,
    op: RetryOp,
    attempts: u32,
}

/// Backoff with jitter: `min(2^attempts, 60)` seconds, +/-20%.
fn backoff_for(attempts: u32) -> StdDuration {
    let base = 2u64.saturating_pow(attempts).min(60);
    let jitter = (rand::random::<f64>() * 0.4 - 0.2) * base as f64;
    StdDuration::from_secs_f64((base as f64 + jitter).max(0.1))
}

/// Handle used by the grant service to durably enqueue controller operations.
/// The queue row is written synchronously with the caller's grant mutation;
/// the background worker (spawned by [`spawn`]) picks it up over the channel
/// or, after a restart, by replaying `pending` rows.
pub struct Queue {
    db: Database,
    sender: mpsc::UnboundedSender<QueuedItem>,
}

impl Queue {
    pub fn enqueue(&self, op: RetryOp) -> Result<()> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let payload = serde_json::to_string(&op).map_err(|_| Error::bad_database("retry op did not serialize"))?;

        self.db.write(|conn| {
            conn.execute(
                "INSERT INTO retry_queue (id, op_type, payload, attempts, next_attempt_utc, status, created_utc)
                 VALUES (?1, ?2, ?3, 0, ?4, 'pending', ?4)",
                params![id, op.op_type(), payload, to_rfc3339(now)],
            )?;
            Ok(())
        })?;

        // The worker may already have shut down during a graceful drain; that's
        // fine, the row survives in the `retry_queue` table for the next replay.
        let _ = self.sender.send(QueuedItem { id, op, attempts: 0 });
        Ok(())
    }
}

/// Builds the queue and spawns its background worker against `controller`.
pub fn spawn(db: Database, controller: Arc<dyn Controller>, audit: Arc<AuditLog>) -> Arc<Queue> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let queue = Arc::new(Queue { db: db.clone(), sender });

    tokio::spawn(worker(db, controller, audit, receiver));

    queue
}

async fn worker(
    db: Database,
    controller: Arc<dyn Controller>,
    audit: Arc<AuditLog>,
    mut receiver: mpsc::UnboundedReceiver<QueuedItem>,
) {
    let mut initial = match replay_pending(&db) {
        Ok(items) => items,
        Err(e) => {
            error!("failed to replay retry queue: {}", e);
            Vec::new()
        }
    };
    if initial.len() > 30 {
        warn!(count = initial.len(), "retry queue backlog is deep, dropping oldest entries");
        initial.truncate(30);
    }

    let mut futures = FuturesUnordered::new();
    for item in initial {
        futures.push(run_item(controller.clone(), item));
    }

    loop {
        tokio::select! {
            Some(outcome) = futures.next(), if !futures.is_empty() => {
                if let Some(item) = handle_outcome(&db, &audit, outcome) {
                    futures.push(run_item(controller.clone(), item));
                }
            }
            item = receiver.recv() => {
                match item {
                    Some(item) => futures.push(run_item(controller.clone(), item)),
                    None if futures.is_empty() => break,
                    None => continue,
                }
            }
        }
    }
}

fn replay_pending(db: &Database) -> Result<Vec<QueuedItem>> {
    db.read(|conn| {
        let mut stmt = conn.prepare(
            "SELECT id, payload, attempts FROM retry_queue WHERE status = 'pending' ORDER BY next_attempt_utc",
        )?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let payload: String = row.get(1)?;
                let attempts: u32 = row.get(2)?;
                Ok((id, payload, attempts))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, payload, attempts)| {
                serde_json::from_str::<RetryOp>(&payload).ok().map(|op| QueuedItem { id, op, attempts })
            })
            .collect())
    })
}

enum Outcome {
    Done(String, RetryOp),
    Retry(QueuedItem, DateTime<Utc>),
    Dead(String, RetryOp),
}

async fn run_item(controller: Arc<dyn Controller>, mut item: QueuedItem) -> Outcome {
    if item.attempts > 0 {
        tokio::time::sleep(backoff_for(item.attempts)).await;
    }

    let result = match &item.op {
        RetryOp::Authorize { mac, end_utc, .. } => controller.authorize(mac, *end_utc).await,
        RetryOp::Extend { mac, end_utc, .. } => controller.extend(mac, *end_utc).await,
        RetryOp::Revoke { mac, .. } => controller.revoke(mac).await,
    };

    match result {
        Ok(()) => Outcome::Done(item.id, item.op),
        Err(e) => {
            item.attempts += 1;
            warn!(grant_id = item.op.grant_id(), attempts = item.attempts, error = %e, "controller operation failed, will retry");
            if item.attempts >= MAX_ATTEMPTS {
                Outcome::Dead(item.id, item.op)
            } else {
                let next_attempt = Utc::now() + chrono::Duration::seconds(backoff_for(item.attempts).as_secs() as i64);
                Outcome::Retry(item, next_attempt)
            }
        }
    }
}

/// Persists the outcome of one attempt. A successful `authorize` also moves
/// its grant PENDING -> ACTIVE here, since that's the controller's ack that
/// the device is really admitted; a dead item is audited so the exhaustion
/// is visible to an admin even though the grant itself stays in whatever
/// state it was already in. Returns the item to re-drive through `run_item`
/// when the outcome is a retry, so the worker loop pushes it back onto
/// `futures` rather than dropping it until the next process restart.
fn handle_outcome(db: &Database, audit: &AuditLog, outcome: Outcome) -> Option<QueuedItem> {
    match outcome {
        Outcome::Done(id, op) => {
            let result = db
                .write(|conn| {
                    conn.execute("UPDATE retry_queue SET status = 'done' WHERE id = ?1", params![id])?;
                    Ok(())
                })
                .and_then(|()| {
                    if let RetryOp::Authorize { grant_id, .. } = &op {
                        GrantData::new(db.clone()).activate_if_pending(grant_id, Utc::now())?;
                    }
                    Ok(())
                });
            if let Err(e) = result {
                error!("failed to persist retry queue outcome: {}", e);
            }
            None
        }
        Outcome::Retry(item, next_attempt) => {
            let result = db.write(|conn| {
                conn.execute(
                    "UPDATE retry_queue SET attempts = ?2, next_attempt_utc = ?3 WHERE id = ?1",
                    params![item.id, item.attempts, to_rfc3339(next_attempt)],
                )?;
                Ok(())
            });
            if let Err(e) = result {
                error!("failed to persist retry queue outcome: {}", e);
                return None;
            }
            Some(item)
        }
        Outcome::Dead(id, op) => {
            warn!(id, "retry queue item exhausted attempts and is now dead");
            let result = db.write(|conn| {
                conn.execute("UPDATE retry_queue SET status = 'dead' WHERE id = ?1", params![id])?;
                Ok(())
            });
            let _ = audit.record(
                "controller.retry_exhausted",
                "grant",
                op.grant_id(),
                AuditOutcome::Error,
                "system",
                Some(op.op_type()),
            );
            if let Err(e) = result {
                error!("failed to persist retry queue outcome: {}", e);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded() {
        for attempts in 0..20 {
            let d = backoff_for(attempts);
            assert!(d.as_secs() <= 72); // 60s cap plus jitter headroom
        }
    }
}
