//! Connection pooling and schema management for the relational store.
//!
//! Modeled on the writer/readers split of a bundled-sqlite pool: one serialized
//! writer connection and a small pool of reader connections, all WAL-mode. Unlike
//! a key-value tree abstraction, tables here are genuinely relational — each
//! domain module owns its own repository built on top of [`Database`].

pub mod migrations;

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;

use crate::Result;

/// A cloneable handle to the connection pool. Every domain repository holds one.
#[derive(Clone)]
pub struct Database {
    inner: Arc<Pool>,
}

struct Pool {
    writer: Mutex<Connection>,
    readers: Vec<Mutex<Connection>>,
}

impl Database {
    /// Opens (creating if absent) the sqlite database at `path` and runs pending migrations.
    pub fn open(path: &str, reader_count: usize) -> Result<Self> {
        let writer = Connection::open(path)?;
        prepare_conn(&writer)?;

        let reader_count = reader_count.max(1);
        let mut readers = Vec::with_capacity(reader_count);
        for _ in 0..reader_count {
            let conn = Connection::open(path)?;
            prepare_conn(&conn)?;
            readers.push(Mutex::new(conn));
        }

        let db = Self {
            inner: Arc::new(Pool {
                writer: Mutex::new(writer),
                readers,
            }),
        };

        db.write(migrations::run)?;

        Ok(db)
    }

    /// Opens an in-memory database for tests. Uses a single shared connection
    /// for both reads and writes since `:memory:` databases are not shared
    /// across connections.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            inner: Arc::new(Pool {
                writer: Mutex::new(conn),
                readers: Vec::new(),
            }),
        };
        db.write(migrations::run)?;
        Ok(db)
    }

    /// Runs `f` against the single writer connection, holding its lock for the
    /// duration. Callers on the async side should wrap this in `spawn_blocking`.
    pub fn write<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.inner.writer.lock();
        f(&conn)
    }

    /// Runs `f` against an available reader connection, falling back to the
    /// writer connection (and its lock) if every reader is currently busy.
    pub fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        for reader in &self.inner.readers {
            if let Some(conn) = reader.try_lock() {
                return f(&conn);
            }
        }
        let conn = self.inner.writer.lock();
        f(&conn)
    }
}

fn prepare_conn(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}
