//! Key-value store adapter over pooled SQLite connections
//!
//! Exposes the small slice of a key/value store the broker relies on:
//! strings with optional expiry, sets, hashes and cursor scans. Every
//! operation borrows a connection from a bounded pool and always returns it.
//!
//! The pool handle itself sits behind a lock so [`Store::reconnect`] can
//! build a complete replacement pool before swapping it in. Borrowers never
//! see a pool mid-replacement, and connections borrowed from the old pool go
//! back to it when released.

use std::collections::{BTreeSet, HashMap};
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use thiserror::Error;
use tracing::{debug, error, info};

use peerbook_core::{Clock, PeerbookError, StoreConfig};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS strings (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        expires_at INTEGER
    );

    CREATE TABLE IF NOT EXISTS sets (
        key TEXT NOT NULL,
        member TEXT NOT NULL,
        PRIMARY KEY (key, member)
    );

    CREATE TABLE IF NOT EXISTS hashes (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, field)
    );
"#;

/// Live (non-expired) keys of every kind
const ALL_KEYS: &str = "SELECT key FROM strings WHERE expires_at IS NULL OR expires_at > ?1
     UNION SELECT key FROM sets
     UNION SELECT key FROM hashes";

static MEMORY_DB_SEQ: AtomicU64 = AtomicU64::new(0);

/// Store errors, always carrying the key that failed
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {key:?} not found")]
    NotFound { key: String },

    #[error("store error at key {key:?}: {source}")]
    Backend {
        key: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("connection pool error at key {key:?}: {reason}")]
    Pool { key: String, reason: String },
}

impl StoreError {
    fn backend(key: &str, source: rusqlite::Error) -> Self {
        error!("Store error at {:?}: {}", key, source);
        StoreError::Backend {
            key: key.to_string(),
            source,
        }
    }

    fn not_found(key: &str) -> Self {
        StoreError::NotFound {
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl From<StoreError> for PeerbookError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { key } => PeerbookError::NotFound(key),
            StoreError::Backend { key, source } => PeerbookError::StoreUnavailable {
                key,
                reason: source.to_string(),
            },
            StoreError::Pool { key, reason } => PeerbookError::StoreUnavailable { key, reason },
        }
    }
}

/// Outcome of [`Store::set_add_capped`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetAdd {
    /// The member was added
    Added,
    /// The member was already in the set
    Present,
    /// The set is at its cap; nothing was written
    Full,
}

/// Where connections point
#[derive(Debug, Clone)]
enum Backend {
    File(PathBuf),
    /// Shared-cache in-memory database, alive while any connection is open
    Memory(String),
}

impl Backend {
    fn open(&self, busy_timeout: Duration) -> rusqlite::Result<Connection> {
        let conn = match self {
            Backend::File(path) => {
                let conn = Connection::open(path)?;
                conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
                    row.get::<_, String>(0)
                })?;
                conn
            }
            Backend::Memory(uri) => Connection::open(uri)?,
        };
        conn.busy_timeout(busy_timeout)?;
        Ok(conn)
    }
}

enum AcquireError {
    Timeout,
    Open(rusqlite::Error),
}

struct PoolState {
    idle: Vec<Connection>,
    open: usize,
}

/// A bounded set of connections to one backend
struct ConnectionPool {
    backend: Backend,
    max_size: usize,
    busy_timeout: Duration,
    acquire_timeout: Duration,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl ConnectionPool {
    /// Open the first connection eagerly so schema errors surface here
    fn new(backend: Backend, config: &StoreConfig) -> rusqlite::Result<Self> {
        let first = backend.open(config.busy_timeout())?;
        first.execute_batch(SCHEMA)?;

        // Shared-cache memory databases fail with SQLITE_LOCKED instead of
        // waiting on busy_timeout, so they get exactly one connection
        let max_size = match backend {
            Backend::File(_) => config.pool_size.max(1),
            Backend::Memory(_) => 1,
        };

        Ok(Self {
            backend,
            max_size,
            busy_timeout: config.busy_timeout(),
            acquire_timeout: config.acquire_timeout(),
            state: Mutex::new(PoolState {
                idle: vec![first],
                open: 1,
            }),
            available: Condvar::new(),
        })
    }

    fn acquire(self: &Arc<Self>) -> Result<PooledConnection, AcquireError> {
        let mut state = self.state.lock();
        loop {
            if let Some(conn) = state.idle.pop() {
                return Ok(PooledConnection::new(self, conn));
            }

            if state.open < self.max_size {
                state.open += 1;
                drop(state);
                return match self.backend.open(self.busy_timeout) {
                    Ok(conn) => Ok(PooledConnection::new(self, conn)),
                    Err(e) => {
                        self.state.lock().open -= 1;
                        self.available.notify_one();
                        Err(AcquireError::Open(e))
                    }
                };
            }

            if self
                .available
                .wait_for(&mut state, self.acquire_timeout)
                .timed_out()
                && state.idle.is_empty()
            {
                return Err(AcquireError::Timeout);
            }
        }
    }

    fn release(&self, conn: Connection) {
        self.state.lock().idle.push(conn);
        self.available.notify_one();
    }

    fn open_count(&self) -> usize {
        self.state.lock().open
    }
}

/// A borrowed connection, returned to its own pool on drop
struct PooledConnection {
    pool: Arc<ConnectionPool>,
    conn: Option<Connection>,
}

impl PooledConnection {
    fn new(pool: &Arc<ConnectionPool>, conn: Connection) -> Self {
        Self {
            pool: Arc::clone(pool),
            conn: Some(conn),
        }
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        // Only taken in drop
        self.conn.as_ref().expect("connection present until drop")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection present until drop")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

/// Pooled key-value store
pub struct Store {
    pool: RwLock<Arc<ConnectionPool>>,
    config: StoreConfig,
    clock: Arc<dyn Clock>,
}

impl Store {
    /// Open the store described by `config` (in-memory when no path is set)
    pub fn open(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        match &config.db_path {
            Some(path) => Self::open_file(path, config, clock),
            None => Self::in_memory(config, clock),
        }
    }

    /// Open or create a database file
    pub fn open_file<P: AsRef<Path>>(
        path: P,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let backend = Backend::File(path.as_ref().to_path_buf());
        info!("Opening store at {:?}", path.as_ref());
        Self::with_backend(backend, config, clock)
    }

    /// Create a private in-memory database (for testing)
    pub fn in_memory(config: &StoreConfig, clock: Arc<dyn Clock>) -> Result<Self, StoreError> {
        let uri = format!(
            "file:peerbook-mem-{}-{}?mode=memory&cache=shared",
            std::process::id(),
            MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        Self::with_backend(Backend::Memory(uri), config, clock)
    }

    fn with_backend(
        backend: Backend,
        config: &StoreConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, StoreError> {
        let pool = ConnectionPool::new(backend, config).map_err(|e| StoreError::backend("", e))?;
        Ok(Self {
            pool: RwLock::new(Arc::new(pool)),
            config: config.clone(),
            clock,
        })
    }

    /// Replace the connection pool with a freshly opened one
    ///
    /// The new pool is fully built before the swap; in-flight borrows finish
    /// on the old pool, which closes once its last connection comes back.
    pub fn reconnect(&self) -> Result<(), StoreError> {
        let backend = self.pool.read().backend.clone();
        let fresh = ConnectionPool::new(backend, &self.config)
            .map_err(|e| StoreError::backend("", e))?;
        *self.pool.write() = Arc::new(fresh);
        info!("Store connection pool replaced");
        Ok(())
    }

    /// Number of connections the current pool has open
    pub fn open_connections(&self) -> usize {
        self.pool.read().open_count()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn conn(&self, key: &str) -> Result<PooledConnection, StoreError> {
        let pool = Arc::clone(&self.pool.read());
        pool.acquire().map_err(|e| match e {
            AcquireError::Timeout => StoreError::Pool {
                key: key.to_string(),
                reason: "timed out waiting for a connection".to_string(),
            },
            AcquireError::Open(source) => StoreError::backend(key, source),
        })
    }

    /// Read a string value; expired values read as absent
    pub fn get_string(&self, key: &str) -> Result<String, StoreError> {
        let conn = self.conn(key)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM strings WHERE key = ?1
                 AND (expires_at IS NULL OR expires_at > ?2)",
                params![key, self.clock.now()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::backend(key, e))?;

        value.ok_or_else(|| StoreError::not_found(key))
    }

    /// Write a string value without expiry
    pub fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.put_string(key, value, None)
    }

    /// Write a string value that reads as absent after `ttl_secs`
    pub fn set_with_expiry(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), StoreError> {
        let expires_at = self.clock.now() + ttl_secs as i64;
        self.put_string(key, value, Some(expires_at))
    }

    fn put_string(&self, key: &str, value: &str, expires_at: Option<i64>) -> Result<(), StoreError> {
        let conn = self.conn(key)?;
        conn.execute(
            "INSERT INTO strings (key, value, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
            params![key, value, expires_at],
        )
        .map_err(|e| StoreError::backend(key, e))?;

        debug!("SET {} (expires_at {:?})", key, expires_at);
        Ok(())
    }

    /// Write a string only if no live value exists; returns whether it was written
    pub fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl_secs: Option<u64>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let expires_at = ttl_secs.map(|ttl| now + ttl as i64);

        let mut conn = self.conn(key)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::backend(key, e))?;

        tx.execute(
            "DELETE FROM strings WHERE key = ?1 AND expires_at IS NOT NULL AND expires_at <= ?2",
            params![key, now],
        )
        .map_err(|e| StoreError::backend(key, e))?;

        let written = tx
            .execute(
                "INSERT INTO strings (key, value, expires_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO NOTHING",
                params![key, value, expires_at],
            )
            .map_err(|e| StoreError::backend(key, e))?;

        tx.commit().map_err(|e| StoreError::backend(key, e))?;
        Ok(written == 1)
    }

    /// Whether any live value of any kind exists at `key`
    pub fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let conn = self.conn(key)?;
        conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM strings WHERE key = ?1
                           AND (expires_at IS NULL OR expires_at > ?2))
                 OR EXISTS(SELECT 1 FROM sets WHERE key = ?1)
                 OR EXISTS(SELECT 1 FROM hashes WHERE key = ?1)",
            params![key, self.clock.now()],
            |row| row.get(0),
        )
        .map_err(|e| StoreError::backend(key, e))
    }

    /// Remove a key of any kind; returns whether anything was removed
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut conn = self.conn(key)?;
        let tx = conn.transaction().map_err(|e| StoreError::backend(key, e))?;

        let mut removed = 0;
        for sql in [
            "DELETE FROM strings WHERE key = ?1",
            "DELETE FROM sets WHERE key = ?1",
            "DELETE FROM hashes WHERE key = ?1",
        ] {
            removed += tx
                .execute(sql, params![key])
                .map_err(|e| StoreError::backend(key, e))?;
        }

        tx.commit().map_err(|e| StoreError::backend(key, e))?;
        debug!("DEL {} ({} rows)", key, removed);
        Ok(removed > 0)
    }

    /// Add a member to a set; returns whether it was newly added
    pub fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let conn = self.conn(key)?;
        let added = conn
            .execute(
                "INSERT OR IGNORE INTO sets (key, member) VALUES (?1, ?2)",
                params![key, member],
            )
            .map_err(|e| StoreError::backend(key, e))?;
        Ok(added == 1)
    }

    /// Add a member unless the set already holds `cap` members, atomically
    ///
    /// A full set reports [`SetAdd::Full`] even for a member it contains.
    pub fn set_add_capped(&self, key: &str, member: &str, cap: usize) -> Result<SetAdd, StoreError> {
        let mut conn = self.conn(key)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| StoreError::backend(key, e))?;

        let size: i64 = tx
            .query_row(
                "SELECT COUNT(*) FROM sets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::backend(key, e))?;
        if size as usize >= cap {
            return Ok(SetAdd::Full);
        }

        let present: bool = tx
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sets WHERE key = ?1 AND member = ?2)",
                params![key, member],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::backend(key, e))?;
        if present {
            return Ok(SetAdd::Present);
        }

        tx.execute(
            "INSERT INTO sets (key, member) VALUES (?1, ?2)",
            params![key, member],
        )
        .map_err(|e| StoreError::backend(key, e))?;
        tx.commit().map_err(|e| StoreError::backend(key, e))?;
        Ok(SetAdd::Added)
    }

    /// Remove a member from a set; returns whether it was present
    pub fn set_remove(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let conn = self.conn(key)?;
        let removed = conn
            .execute(
                "DELETE FROM sets WHERE key = ?1 AND member = ?2",
                params![key, member],
            )
            .map_err(|e| StoreError::backend(key, e))?;
        Ok(removed == 1)
    }

    /// All members of a set (empty for a missing key)
    pub fn set_members(&self, key: &str) -> Result<BTreeSet<String>, StoreError> {
        let conn = self.conn(key)?;
        let mut stmt = conn
            .prepare("SELECT member FROM sets WHERE key = ?1")
            .map_err(|e| StoreError::backend(key, e))?;
        let members = stmt
            .query_map(params![key], |row| row.get(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<BTreeSet<String>>>())
            .map_err(|e| StoreError::backend(key, e))?;
        Ok(members)
    }

    /// Number of members in a set
    pub fn set_len(&self, key: &str) -> Result<usize, StoreError> {
        let conn = self.conn(key)?;
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sets WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .map_err(|e| StoreError::backend(key, e))?;
        Ok(count as usize)
    }

    /// Write hash fields, overwriting existing values
    pub fn hash_set(&self, key: &str, fields: &[(&str, String)]) -> Result<(), StoreError> {
        let mut conn = self.conn(key)?;
        let tx = conn.transaction().map_err(|e| StoreError::backend(key, e))?;
        for (field, value) in fields {
            tx.execute(
                "INSERT INTO hashes (key, field, value) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                params![key, field, value],
            )
            .map_err(|e| StoreError::backend(key, e))?;
        }
        tx.commit().map_err(|e| StoreError::backend(key, e))?;

        debug!("HSET {} ({} fields)", key, fields.len());
        Ok(())
    }

    /// Read one hash field
    pub fn hash_get_field(&self, key: &str, field: &str) -> Result<String, StoreError> {
        let conn = self.conn(key)?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM hashes WHERE key = ?1 AND field = ?2",
                params![key, field],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StoreError::backend(key, e))?;

        value.ok_or_else(|| StoreError::not_found(&format!("{key}#{field}")))
    }

    /// Read a whole hash (empty for a missing key)
    pub fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError> {
        let conn = self.conn(key)?;
        let mut stmt = conn
            .prepare("SELECT field, value FROM hashes WHERE key = ?1")
            .map_err(|e| StoreError::backend(key, e))?;
        let fields = stmt
            .query_map(params![key], |row| Ok((row.get(0)?, row.get(1)?)))
            .and_then(|rows| rows.collect::<rusqlite::Result<HashMap<String, String>>>())
            .map_err(|e| StoreError::backend(key, e))?;
        Ok(fields)
    }

    /// One page of keys matching a glob `pattern`, strictly after `cursor`
    ///
    /// Returns the cursor for the next page, or `None` once the key space is
    /// exhausted. Start with an empty cursor.
    pub fn scan(
        &self,
        cursor: &str,
        pattern: &str,
        count: usize,
    ) -> Result<(Option<String>, Vec<String>), StoreError> {
        let conn = self.conn(pattern)?;
        let sql = format!(
            "SELECT key FROM ({ALL_KEYS}) WHERE key > ?2 AND key GLOB ?3 ORDER BY key LIMIT ?4"
        );
        let mut stmt = conn
            .prepare(&sql)
            .map_err(|e| StoreError::backend(pattern, e))?;
        let keys = stmt
            .query_map(
                params![self.clock.now(), cursor, pattern, count.max(1) as i64],
                |row| row.get(0),
            )
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<String>>>())
            .map_err(|e| StoreError::backend(pattern, e))?;

        let next = if keys.len() >= count.max(1) {
            keys.last().cloned()
        } else {
            None
        };
        Ok((next, keys))
    }

    /// Every key matching `pattern`, draining the scan to the end
    pub fn scan_keys_matching(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut all = Vec::new();
        let mut cursor = String::new();
        let mut pages = 0;
        loop {
            let (next, keys) = self.scan(&cursor, pattern, self.config.scan_page_size)?;
            pages += 1;
            all.extend(keys);
            match next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        debug!("SCAN {} -> {} keys in {} pages", pattern, all.len(), pages);
        Ok(all)
    }

    /// Drop expired strings; returns how many were removed
    pub fn purge_expired(&self) -> Result<usize, StoreError> {
        let conn = self.conn("strings")?;
        let removed = conn
            .execute(
                "DELETE FROM strings WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                params![self.clock.now()],
            )
            .map_err(|e| StoreError::backend("strings", e))?;
        if removed > 0 {
            info!("Purged {} expired keys", removed);
        }
        Ok(removed)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use peerbook_core::ManualClock;

    pub(crate) fn test_store() -> (Arc<Store>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let store = Store::in_memory(&StoreConfig::default(), clock.clone()).unwrap();
        (Arc::new(store), clock)
    }

    #[test]
    fn test_string_operations() {
        let (store, _) = test_store();

        assert!(store.get_string("token:abc").unwrap_err().is_not_found());
        store.set("token:abc", "a@b.com").unwrap();
        assert_eq!(store.get_string("token:abc").unwrap(), "a@b.com");
        assert!(store.exists("token:abc").unwrap());

        assert!(store.delete("token:abc").unwrap());
        assert!(!store.exists("token:abc").unwrap());
        assert!(!store.delete("token:abc").unwrap());
    }

    #[test]
    fn test_expiry() {
        let (store, clock) = test_store();

        store.set_with_expiry("dontsend:a@b.com", "1", 60).unwrap();
        clock.advance(59);
        assert!(store.exists("dontsend:a@b.com").unwrap());
        clock.advance(1);
        assert!(!store.exists("dontsend:a@b.com").unwrap());
        assert!(store.get_string("dontsend:a@b.com").is_err());
    }

    #[test]
    fn test_set_if_absent() {
        let (store, clock) = test_store();

        assert!(store.set_if_absent("k", "1", Some(10)).unwrap());
        assert!(!store.set_if_absent("k", "2", Some(10)).unwrap());
        assert_eq!(store.get_string("k").unwrap(), "1");

        // An expired value does not block a new write
        clock.advance(10);
        assert!(store.set_if_absent("k", "3", None).unwrap());
        assert_eq!(store.get_string("k").unwrap(), "3");
    }

    #[test]
    fn test_set_operations() {
        let (store, _) = test_store();

        assert!(store.set_add("user-peerset:u1", "fp1").unwrap());
        assert!(!store.set_add("user-peerset:u1", "fp1").unwrap());
        assert!(store.set_add("user-peerset:u1", "fp2").unwrap());

        let members = store.set_members("user-peerset:u1").unwrap();
        assert_eq!(members.len(), 2);
        assert!(members.contains("fp1"));
        assert_eq!(store.set_len("user-peerset:u1").unwrap(), 2);

        assert!(store.set_remove("user-peerset:u1", "fp1").unwrap());
        assert!(!store.set_remove("user-peerset:u1", "fp1").unwrap());
        assert!(store.set_members("user-peerset:nobody").unwrap().is_empty());
    }

    #[test]
    fn test_set_add_capped() {
        let (store, _) = test_store();

        assert_eq!(store.set_add_capped("s", "a", 2).unwrap(), SetAdd::Added);
        assert_eq!(store.set_add_capped("s", "b", 2).unwrap(), SetAdd::Added);
        assert_eq!(store.set_add_capped("s", "c", 2).unwrap(), SetAdd::Full);
        // At the cap even a member is refused
        assert_eq!(store.set_add_capped("s", "a", 2).unwrap(), SetAdd::Full);
        assert_eq!(store.set_add_capped("s", "a", 3).unwrap(), SetAdd::Present);
        assert_eq!(store.set_len("s").unwrap(), 2);
    }

    #[test]
    fn test_hash_operations() {
        let (store, _) = test_store();

        store
            .hash_set("peer:fp1", &[("name", "laptop".into()), ("online", "0".into())])
            .unwrap();
        store.hash_set("peer:fp1", &[("online", "1".into())]).unwrap();

        assert_eq!(store.hash_get_field("peer:fp1", "online").unwrap(), "1");
        assert!(store
            .hash_get_field("peer:fp1", "user")
            .unwrap_err()
            .is_not_found());

        let all = store.hash_get_all("peer:fp1").unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["name"], "laptop");
        assert!(store.hash_get_all("peer:missing").unwrap().is_empty());
    }

    #[test]
    fn test_scan_drains_every_page() {
        let clock = Arc::new(ManualClock::default());
        let config = StoreConfig {
            scan_page_size: 3,
            ..StoreConfig::default()
        };
        let store = Store::in_memory(&config, clock).unwrap();

        for i in 0..10 {
            store
                .hash_set(&format!("peer:fp{i:02}"), &[("online", "1".into())])
                .unwrap();
        }
        store.set("token:x", "a@b.com").unwrap();

        let (next, first) = store.scan("", "peer:*", 3).unwrap();
        assert_eq!(first.len(), 3);
        assert!(next.is_some());

        let keys = store.scan_keys_matching("peer:*").unwrap();
        assert_eq!(keys.len(), 10);
        assert!(keys.iter().all(|k| k.starts_with("peer:")));
    }

    #[test]
    fn test_scan_skips_expired_strings() {
        let (store, clock) = test_store();
        store.set_with_expiry("token:a", "x", 5).unwrap();
        store.set("token:b", "y").unwrap();
        clock.advance(5);
        assert_eq!(store.scan_keys_matching("token:*").unwrap(), vec!["token:b"]);
    }

    #[test]
    fn test_purge_expired() {
        let (store, clock) = test_store();
        store.set_with_expiry("token:a", "x", 5).unwrap();
        store.set("QRVerified:a@b.com", "1").unwrap();
        clock.advance(6);
        assert_eq!(store.purge_expired().unwrap(), 1);
        assert!(store.exists("QRVerified:a@b.com").unwrap());
    }

    #[test]
    fn test_error_conversion_keeps_key() {
        let err: PeerbookError = StoreError::not_found("peer:fp1").into();
        assert_eq!(err, PeerbookError::NotFound("peer:fp1".into()));

        let err: PeerbookError = StoreError::Pool {
            key: "peer:fp1".into(),
            reason: "timed out".into(),
        }
        .into();
        assert!(matches!(err, PeerbookError::StoreUnavailable { ref key, .. } if key == "peer:fp1"));
    }

    #[test]
    fn test_reconnect_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store =
            Store::open_file(dir.path().join("peerbook.db"), &StoreConfig::default(), clock)
                .unwrap();

        store.set("user:a@b.com", "id1").unwrap();
        store.reconnect().unwrap();
        assert_eq!(store.get_string("user:a@b.com").unwrap(), "id1");
    }

    #[test]
    fn test_reconnect_in_memory_keeps_data() {
        let (store, _) = test_store();
        store.set_add("user-peerset:u1", "fp1").unwrap();
        store.reconnect().unwrap();
        assert!(store.set_members("user-peerset:u1").unwrap().contains("fp1"));
    }

    #[test]
    fn test_pool_is_bounded_under_concurrency() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let config = StoreConfig {
            pool_size: 3,
            ..StoreConfig::default()
        };
        let store = Arc::new(
            Store::open_file(dir.path().join("peerbook.db"), &config, clock).unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..20 {
                        store.set_add("s", &format!("m{t}-{i}")).unwrap();
                        if i == 10 && t == 0 {
                            store.reconnect().unwrap();
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(store.set_len("s").unwrap(), 160);
        assert!(store.open_connections() <= 3);
    }

    #[test]
    fn test_in_memory_store_under_concurrency() {
        let (store, _) = test_store();

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for i in 0..50 {
                        let member = format!("m{i}");
                        store.set_add_capped(&format!("s{t}"), &member, 100).unwrap();
                        store
                            .hash_set(&format!("peer:{t}-{i}"), &[("online", "1".to_string())])
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..8 {
            assert_eq!(store.set_len(&format!("s{t}")).unwrap(), 50);
        }
        assert_eq!(store.scan_keys_matching("peer:*").unwrap().len(), 400);
        assert_eq!(store.open_connections(), 1);
    }
}
