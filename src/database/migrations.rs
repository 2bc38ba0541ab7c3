//! Forward-only schema migrations, tracked by a `schema_migrations` table.
//!
//! Each migration is a plain SQL batch applied once, in order. There is no
//! down-migration support; fixing a bad migration means writing a new one.

use rusqlite::Connection;

use crate::Result;

const MIGRATIONS: &[(&i64, &str)] = &[(&1, MIGRATION_1)];

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_utc TEXT NOT NULL
        );",
    )?;

    for (version, sql) in MIGRATIONS {
        let already_applied: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM schema_migrations WHERE version = ?1)",
            [version],
            |row| row.get(0),
        )?;
        if already_applied {
            continue;
        }

        conn.execute_batch(sql)?;
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_utc) VALUES (?1, datetime('now'))",
            rusqlite::params![version],
        )?;
    }

    Ok(())
}

const MIGRATION_1: &str = r#"
CREATE TABLE vouchers (
    code TEXT PRIMARY KEY,
    created_utc TEXT NOT NULL,
    duration_minutes INTEGER NOT NULL,
    expires_utc TEXT NOT NULL,
    up_kbps INTEGER,
    down_kbps INTEGER,
    status TEXT NOT NULL,
    booking_ref TEXT,
    redeemed_count INTEGER NOT NULL DEFAULT 0,
    last_redeemed_utc TEXT
);
CREATE INDEX idx_vouchers_code_ci ON vouchers (UPPER(code));

CREATE TABLE access_grants (
    id TEXT PRIMARY KEY,
    voucher_code TEXT,
    booking_ref TEXT,
    integration_id TEXT,
    user_input_code TEXT,
    mac TEXT NOT NULL,
    session_token TEXT,
    start_utc TEXT NOT NULL,
    end_utc TEXT NOT NULL,
    controller_grant_id TEXT,
    status TEXT NOT NULL,
    created_utc TEXT NOT NULL,
    updated_utc TEXT NOT NULL
);
CREATE INDEX idx_grants_mac ON access_grants (mac);
CREATE INDEX idx_grants_identity ON access_grants (mac, voucher_code, booking_ref, status);

CREATE TABLE rental_events (
    integration_id TEXT NOT NULL,
    event_index INTEGER NOT NULL,
    slot_name TEXT,
    slot_code TEXT,
    last_four TEXT,
    start_utc TEXT NOT NULL,
    end_utc TEXT NOT NULL,
    raw_attributes TEXT NOT NULL,
    created_utc TEXT NOT NULL,
    updated_utc TEXT NOT NULL,
    PRIMARY KEY (integration_id, event_index)
);
CREATE INDEX idx_rental_events_end ON rental_events (end_utc);

CREATE TABLE integration_configs (
    integration_id TEXT PRIMARY KEY,
    enabled INTEGER NOT NULL DEFAULT 1,
    auth_attribute TEXT NOT NULL DEFAULT 'slot_code',
    checkout_grace_minutes INTEGER NOT NULL DEFAULT 15,
    last_sync_utc TEXT,
    stale_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE portal_config (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    rate_limit_attempts INTEGER NOT NULL DEFAULT 5,
    rate_limit_window_seconds INTEGER NOT NULL DEFAULT 60,
    success_redirect_url TEXT NOT NULL DEFAULT '/welcome',
    voucher_length_default INTEGER NOT NULL DEFAULT 10
);
INSERT INTO portal_config (id) VALUES (1);

CREATE TABLE admin_accounts (
    id TEXT PRIMARY KEY,
    username TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    role TEXT NOT NULL,
    created_utc TEXT NOT NULL
);

CREATE TABLE admin_sessions (
    token TEXT PRIMARY KEY,
    admin_id TEXT NOT NULL REFERENCES admin_accounts(id),
    csrf_token TEXT NOT NULL,
    created_utc TEXT NOT NULL,
    last_seen_utc TEXT NOT NULL,
    expires_utc TEXT NOT NULL
);

CREATE TABLE audit_log (
    id TEXT PRIMARY KEY,
    timestamp_utc TEXT NOT NULL,
    actor TEXT NOT NULL,
    role_snapshot TEXT NOT NULL,
    action TEXT NOT NULL,
    target_type TEXT NOT NULL,
    target_id TEXT NOT NULL,
    outcome TEXT NOT NULL,
    correlation_id TEXT NOT NULL,
    meta TEXT
);
CREATE INDEX idx_audit_log_correlation ON audit_log (correlation_id);

CREATE TABLE retry_queue (
    id TEXT PRIMARY KEY,
    op_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    next_attempt_utc TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_utc TEXT NOT NULL
);
CREATE INDEX idx_retry_queue_status ON retry_queue (status, next_attempt_utc);
"#;
