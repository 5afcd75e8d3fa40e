use std::path::Path;
use std::sync::{Mutex, PoisonError};

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};
use crate::migrate::{ensure_db_parent, migrate_connection, open_connection};
use crate::store::{CacheStore, Clock, SystemClock, expires_at};

/// Persistent cache backed by a single sqlite file.
///
/// Every key lives in a row tagged with its namespace, which is what makes
/// [`CacheStore::purge_namespace`] possible here.
pub struct SqliteStore<C: Clock = SystemClock> {
    connection: Mutex<Connection>,
    clock: C,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqliteStoreStats {
    pub entries: usize,
    pub expired: usize,
}

impl SqliteStore<SystemClock> {
    /// Open (creating if needed) and migrate the cache database at `db_path`.
    pub fn open(db_path: &Path) -> Result<Self> {
        Self::open_with_clock(db_path, SystemClock)
    }
}

impl<C: Clock> SqliteStore<C> {
    pub fn open_with_clock(db_path: &Path, clock: C) -> Result<Self> {
        let connection = ensure_db_parent(db_path)
            .and_then(|()| open_connection(db_path))
            .map_err(|error| Error::CacheUnavailable(format!("{error:#}")))?;
        Self::from_connection(connection, clock)
    }

    pub fn in_memory_with_clock(clock: C) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, clock)
    }

    fn from_connection(connection: Connection, clock: C) -> Result<Self> {
        migrate_connection(&connection)
            .map_err(|error| Error::CacheUnavailable(format!("{error:#}")))?;
        Ok(Self {
            connection: Mutex::new(connection),
            clock,
        })
    }

    pub fn stats(&self) -> Result<SqliteStoreStats> {
        let now = to_sql_time(self.clock.now_unix());
        let connection = self.connection();
        let entries: i64 =
            connection.query_row("SELECT COUNT(*) FROM lrmi_cache", [], |row| row.get(0))?;
        let expired: i64 = connection.query_row(
            "SELECT COUNT(*) FROM lrmi_cache
             WHERE expires_at_unix IS NOT NULL AND expires_at_unix <= ?1",
            [now],
            |row| row.get(0),
        )?;
        Ok(SqliteStoreStats {
            entries: usize::try_from(entries).unwrap_or(usize::MAX),
            expired: usize::try_from(expired).unwrap_or(usize::MAX),
        })
    }

    /// Drop rows whose TTL has elapsed. Returns the number removed.
    pub fn prune_expired(&self) -> Result<usize> {
        let now = to_sql_time(self.clock.now_unix());
        let removed = self.connection().execute(
            "DELETE FROM lrmi_cache WHERE expires_at_unix IS NOT NULL AND expires_at_unix <= ?1",
            [now],
        )?;
        debug!(removed, "pruned expired cache rows");
        Ok(removed)
    }

    fn connection(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.connection.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: Clock> CacheStore for SqliteStore<C> {
    fn get(&self, key: &str) -> Result<Option<Value>> {
        let now = self.clock.now_unix();
        let connection = self.connection();
        let row = connection
            .query_row(
                "SELECT payload_json, expires_at_unix FROM lrmi_cache WHERE cache_key = ?1",
                [key],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Option<i64>>(1)?)),
            )
            .optional()?;

        let Some((payload_json, expires_at_unix)) = row else {
            return Ok(None);
        };
        if let Some(deadline) = expires_at_unix
            && deadline <= to_sql_time(now)
        {
            connection.execute("DELETE FROM lrmi_cache WHERE cache_key = ?1", [key])?;
            return Ok(None);
        }
        let value = serde_json::from_str(&payload_json)
            .map_err(|error| Error::CacheUnavailable(format!("corrupt cache row {key}: {error}")))?;
        Ok(Some(value))
    }

    fn set(&self, key: &str, value: &Value, ttl_seconds: u64) -> Result<()> {
        let now = self.clock.now_unix();
        let payload_json = serde_json::to_string(value)
            .map_err(|error| Error::CacheUnavailable(error.to_string()))?;
        let namespace = key.split_once(':').map(|(ns, _)| ns).unwrap_or_default();
        self.connection().execute(
            "INSERT INTO lrmi_cache (cache_key, namespace, payload_json, stored_at_unix, expires_at_unix)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET
                namespace = excluded.namespace,
                payload_json = excluded.payload_json,
                stored_at_unix = excluded.stored_at_unix,
                expires_at_unix = excluded.expires_at_unix",
            params![
                key,
                namespace,
                payload_json,
                to_sql_time(now),
                expires_at(now, ttl_seconds).map(to_sql_time),
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let removed = self
            .connection()
            .execute("DELETE FROM lrmi_cache WHERE cache_key = ?1", [key])?;
        Ok(removed > 0)
    }

    fn purge_namespace(&self, namespace: &str) -> Result<usize> {
        let removed = self
            .connection()
            .execute("DELETE FROM lrmi_cache WHERE namespace = ?1", [namespace])?;
        Ok(removed)
    }
}

fn to_sql_time(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}
