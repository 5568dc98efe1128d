//! Cache tiers for the authorization store.
//!
//! L1 is an in-memory TTL map that always exists. L2 is an optional
//! persistent sqlite row store; `None` is the no-persistence configuration.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};
use tracing::warn;

/// A cached value plus the time it has left to live. The residual TTL is
/// what an upper tier uses when backfilling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedValue {
    pub value: String,
    pub remaining: Duration,
}

/// Common interface over both cache tiers.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<CachedValue>;
    fn put(&self, key: &str, value: &str, ttl: Duration);
    fn remove(&self, key: &str);
}

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-memory TTL cache with a capacity bound. Expired entries are swept
/// on insert; the oldest-expiring entry is evicted when full.
pub struct MemoryCache {
    capacity: usize,
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<CachedValue> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at > now => Some(CachedValue {
                value: entry.value.clone(),
                remaining: entry.expires_at - now,
            }),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) {
        if ttl.is_zero() || self.capacity == 0 {
            return;
        }
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, e| e.expires_at > now);
        while entries.len() >= self.capacity && !entries.contains_key(key) {
            let soonest = entries
                .iter()
                .min_by_key(|(_, e)| e.expires_at)
                .map(|(k, _)| k.clone());
            match soonest {
                Some(k) => entries.remove(&k),
                None => break,
            };
        }
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
    }

    fn remove(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

/// Persistent sqlite tier: one row per key with absolute unix expiry.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key        TEXT PRIMARY KEY,
    value      TEXT NOT NULL,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS kv_expires_at ON kv (expires_at);
";

impl SqliteStore {
    pub fn open(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA).unwrap();
        Self {
            conn: Mutex::new(conn),
        }
    }
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Cache for SqliteStore {
    fn get(&self, key: &str) -> Option<CachedValue> {
        let now = now_unix();
        let conn = self.conn.lock().unwrap();
        let row: (String, i64) = conn
            .query_row(
                "SELECT value, expires_at FROM kv WHERE key = ?1 AND expires_at > ?2",
                params![key, now],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!(error = %e, key, "cache read failed");
                None
            })?;
        Some(CachedValue {
            value: row.0,
            remaining: Duration::from_secs((row.1 - now).max(0) as u64),
        })
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) {
        let now = now_unix();
        let conn = self.conn.lock().unwrap();
        let result = conn.execute(
            "INSERT OR REPLACE INTO kv (key, value, expires_at, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![key, value, now + ttl.as_secs() as i64, now],
        );
        if let Err(e) = result {
            warn!(error = %e, key, "cache write failed");
            return;
        }
        // Expired rows accumulate otherwise; the expires_at index keeps
        // this sweep cheap.
        let _ = conn.execute("DELETE FROM kv WHERE expires_at <= ?1", params![now]);
    }

    fn remove(&self, key: &str) {
        let conn = self.conn.lock().unwrap();
        if let Err(e) = conn.execute("DELETE FROM kv WHERE key = ?1", params![key]) {
            warn!(error = %e, key, "cache delete failed");
        }
    }
}
