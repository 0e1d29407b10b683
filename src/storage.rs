//! SQLite storage layer.
//!
//! A transactional [`Store`] for JSON records plus an `events` outbox table.
//! The [`OutboxPublisher`] writes each committed batch into the outbox inside
//! the same transaction as the record writes, so state and events land
//! together or not at all.
//!
//! Every store keeps two connections to one WAL database: a writer that
//! carries all writes and the open transaction, and a reader that only ever
//! sees committed data.

use std::any::Any;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, ffi, params};
use serde_json::Value;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::{DataEvent, EventBatch, EventPublisher};
use crate::model::{StoreId, TxId, WorkKey};
use crate::serializer::{JsonSerializer, Serializer};
use crate::store::{Store, TransactionHandle, TransactionalStore};

/// How long a writer waits for another operation's transaction to end.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS records (
        key         TEXT PRIMARY KEY,
        value       TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS events (
        seq         INTEGER PRIMARY KEY AUTOINCREMENT,
        event_id    TEXT NOT NULL,
        kind        TEXT NOT NULL,
        subject     TEXT NOT NULL,
        timestamp   TEXT NOT NULL,
        payload     TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_subject ON events(subject, seq);
";

/// Connections plus the slot recording which transaction, if any, is open.
///
/// Lock order is always `active_tx` before `writer`.
struct Shared {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    active_tx: Mutex<Option<TxId>>,
    released: Condvar,
    // Dropped after both connections.
    _scratch: Option<TempDir>,
}

impl Shared {
    fn writer(&self) -> Result<MutexGuard<'_, Connection>> {
        self.writer
            .lock()
            .map_err(|_| Error::Other("sqlite writer lock poisoned".to_string()))
    }

    fn reader(&self) -> Result<MutexGuard<'_, Connection>> {
        self.reader
            .lock()
            .map_err(|_| Error::Other("sqlite reader lock poisoned".to_string()))
    }

    /// Wait up to `timeout` until no transaction is open. The returned guard
    /// keeps new transactions out while it is held.
    ///
    /// Fails with `SQLITE_BUSY` when the slot is still taken, so two
    /// operations waiting on each other's stores both get to give up.
    fn wait_idle(&self, timeout: Duration) -> Result<MutexGuard<'_, Option<TxId>>> {
        let slot = self
            .active_tx
            .lock()
            .map_err(|_| Error::Other("sqlite transaction slot poisoned".to_string()))?;
        let (slot, _) = self
            .released
            .wait_timeout_while(slot, timeout, |active| active.is_some())
            .map_err(|_| Error::Other("sqlite transaction slot poisoned".to_string()))?;

        if let Some(active) = *slot {
            return Err(busy(active, timeout));
        }
        Ok(slot)
    }

    fn release(&self, id: TxId) {
        if let Ok(mut slot) = self.active_tx.lock() {
            if *slot == Some(id) {
                *slot = None;
            }
        }
        self.released.notify_all();
    }
}

fn busy(active: TxId, waited: Duration) -> Error {
    Error::Storage(rusqlite::Error::SqliteFailure(
        ffi::Error::new(ffi::SQLITE_BUSY),
        Some(format!(
            "transaction {active} still open after waiting {}ms",
            waited.as_millis()
        )),
    ))
}

/// Storage backend over one SQLite database file.
///
/// One transaction is open at a time. Writers from other operations wait for
/// it up to the busy timeout and then fail; readers never wait and never see
/// uncommitted writes.
pub struct SqliteStore {
    id: StoreId,
    name: String,
    busy_timeout: Duration,
    shared: Arc<Shared>,
}

/// Transaction handle opened by [`SqliteStore`].
///
/// Rolls back on drop unless committed.
pub struct SqliteTx {
    id: TxId,
    store_id: StoreId,
    shared: Arc<Shared>,
    finished: bool,
}

impl SqliteTx {
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        if self.finished {
            return Err(Error::Other(format!("transaction {} already finished", self.id)));
        }
        let conn = self.shared.writer()?;
        f(&conn)
    }
}

impl TransactionHandle for SqliteTx {
    fn id(&self) -> TxId {
        self.id
    }

    fn store_id(&self) -> StoreId {
        self.store_id
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl Drop for SqliteTx {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match self.shared.writer() {
            Ok(conn) => match conn.execute_batch("ROLLBACK") {
                Ok(()) => debug!(tx = %self.id, "transaction rolled back"),
                Err(e) => warn!(tx = %self.id, "rollback failed: {e}"),
            },
            Err(e) => warn!(tx = %self.id, "rollback skipped: {e}"),
        }
        self.shared.release(self.id);
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::init(path.as_ref(), "sqlite", None)
    }

    /// Create a scratch database in a temporary directory that is removed
    /// when the store is dropped.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::tempdir()
            .map_err(|e| Error::Other(format!("failed to create scratch directory: {e}")))?;
        let path = dir.path().join("uow.db");
        Self::init(&path, "sqlite-temp", Some(dir))
    }

    fn init(path: &Path, name: &str, scratch: Option<TempDir>) -> Result<Self> {
        let writer = Connection::open(path)?;
        writer.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
        // WAL lets the reader see the last committed state while a write
        // transaction is open.
        writer.execute_batch("PRAGMA journal_mode=WAL;")?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open(path)?;
        reader.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;

        Ok(Self {
            id: StoreId::new(),
            name: name.to_string(),
            busy_timeout: DEFAULT_BUSY_TIMEOUT,
            shared: Arc::new(Shared {
                writer: Mutex::new(writer),
                reader: Mutex::new(reader),
                active_tx: Mutex::new(None),
                released: Condvar::new(),
                _scratch: scratch,
            }),
        })
    }

    /// Rename the store (shows up in record events and logs).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// How long to wait for another operation's transaction before failing
    /// with `SQLITE_BUSY`.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// All committed records, ordered by key.
    pub fn records(&self) -> Result<Vec<(WorkKey, Value)>> {
        let conn = self.shared.reader()?;
        let mut stmt = conn.prepare("SELECT key, value FROM records ORDER BY key ASC")?;

        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(key, value)| -> Result<(WorkKey, Value)> {
                Ok((WorkKey::new(key), serde_json::from_str(&value)?))
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Append encoded events to the outbox, inside `tx` when it is ours,
    /// otherwise in a transaction of their own.
    pub fn append_events(
        &self,
        tx: Option<&mut dyn TransactionHandle>,
        events: &[(DataEvent, Value)],
    ) -> Result<()> {
        match self.own_tx(tx) {
            Some(tx) => tx.with_conn(|conn| append_events_on(conn, events)),
            None => {
                let _idle = self.shared.wait_idle(self.busy_timeout)?;
                let mut conn = self.shared.writer()?;
                let tx = conn.transaction()?;
                append_events_on(&tx, events)?;
                tx.commit()?;
                Ok(())
            }
        }
    }

    /// Committed outbox events after a sequence number.
    pub fn events_since(&self, since_seq: u64) -> Result<Vec<StoredEvent>> {
        let conn = self.shared.reader()?;
        let mut stmt = conn.prepare(
            "SELECT seq, event_id, kind, subject, timestamp, payload
             FROM events WHERE seq > ?1 ORDER BY seq ASC",
        )?;

        let since = i64::try_from(since_seq).unwrap_or(i64::MAX);
        let events = stmt
            .query_map(params![since], |row| {
                let seq = row.get::<_, i64>(0)? as u64;
                let timestamp: String = row.get(4)?;
                let payload: String = row.get(5)?;
                let recorded_at = match timestamp.parse::<DateTime<Utc>>() {
                    Ok(at) => at,
                    Err(e) => {
                        warn!(seq, %timestamp, "unparseable outbox timestamp, using now: {e}");
                        Utc::now()
                    }
                };
                Ok(StoredEvent {
                    seq,
                    event_id: row.get(1)?,
                    kind: row.get(2)?,
                    subject: WorkKey::new(row.get::<_, String>(3)?),
                    recorded_at,
                    payload: serde_json::from_str(&payload).unwrap_or(Value::String(payload)),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// The handle as one of ours, if it was opened by this store.
    fn own_tx<'h>(&self, tx: Option<&'h mut dyn TransactionHandle>) -> Option<&'h mut SqliteTx> {
        let tx = tx?;
        if tx.store_id() != self.id {
            return None;
        }
        tx.as_any_mut().downcast_mut::<SqliteTx>()
    }

    /// Run a write outside any transaction, waiting a bounded time for an
    /// open one to end.
    fn autocommit<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let _idle = self.shared.wait_idle(self.busy_timeout)?;
        let conn = self.shared.writer()?;
        f(&conn)
    }
}

impl Store for SqliteStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn put(
        &self,
        tx: Option<&mut dyn TransactionHandle>,
        key: &WorkKey,
        value: &Value,
    ) -> Result<()> {
        match self.own_tx(tx) {
            Some(tx) => tx.with_conn(|conn| put_record_on(conn, key, value)),
            None => self.autocommit(|conn| put_record_on(conn, key, value)),
        }
    }

    fn remove(&self, tx: Option<&mut dyn TransactionHandle>, key: &WorkKey) -> Result<()> {
        match self.own_tx(tx) {
            Some(tx) => tx.with_conn(|conn| remove_record_on(conn, key)),
            None => self.autocommit(|conn| remove_record_on(conn, key)),
        }
    }

    /// Committed value only; writes of an open transaction are not visible.
    fn get(&self, key: &WorkKey) -> Result<Option<Value>> {
        let conn = self.shared.reader()?;
        get_record_on(&conn, key)
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        Some(self)
    }
}

impl TransactionalStore for SqliteStore {
    fn start_transaction(&self) -> Result<Box<dyn TransactionHandle>> {
        let mut slot = self.shared.wait_idle(self.busy_timeout)?;
        let id = TxId::new();
        self.shared.writer()?.execute_batch("BEGIN IMMEDIATE")?;
        *slot = Some(id);

        Ok(Box::new(SqliteTx {
            id,
            store_id: self.id,
            shared: Arc::clone(&self.shared),
            finished: false,
        }))
    }

    fn commit_transaction(&self, handle: &mut dyn TransactionHandle) -> Result<()> {
        let handle_id = handle.id();
        let tx = self.own_tx(Some(handle)).ok_or_else(|| {
            Error::Other(format!(
                "transaction {handle_id} was not opened by store {}",
                self.name
            ))
        })?;

        tx.with_conn(|conn| Ok(conn.execute_batch("COMMIT")?))?;
        tx.finished = true;
        self.shared.release(tx.id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Outbox publisher
// ---------------------------------------------------------------------------

/// An event read back from the outbox.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub seq: u64,
    pub event_id: String,
    pub kind: String,
    pub subject: WorkKey,
    pub recorded_at: DateTime<Utc>,
    /// Encoded event as written by the serializer.
    pub payload: Value,
}

/// Publishes batches into a [`SqliteStore`]'s `events` table.
pub struct OutboxPublisher<S = JsonSerializer<DataEvent>> {
    store: Arc<SqliteStore>,
    serializer: S,
}

impl OutboxPublisher {
    pub fn new(store: Arc<SqliteStore>) -> Self {
        Self::with_serializer(store, JsonSerializer::new())
    }
}

impl<S: Serializer<DataEvent>> OutboxPublisher<S> {
    pub fn with_serializer(store: Arc<SqliteStore>, serializer: S) -> Self {
        Self { store, serializer }
    }

    /// Outbox events after `since_seq`, decoded where the serializer can.
    ///
    /// Rows the serializer cannot or will not decode come back as `None`.
    pub fn replay(&self, since_seq: u64) -> Result<Vec<(StoredEvent, Option<DataEvent>)>> {
        let stored = self.store.events_since(since_seq)?;
        Ok(stored
            .into_iter()
            .map(|event| {
                let decoded = match self.serializer.decode(&event.payload) {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!(seq = event.seq, "undecodable outbox event: {e}");
                        None
                    }
                };
                (event, decoded)
            })
            .collect())
    }
}

impl<S: Serializer<DataEvent>> EventPublisher for OutboxPublisher<S> {
    fn publish(&self, batch: EventBatch, tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        let encoded = batch
            .into_iter()
            .map(|event| -> Result<(DataEvent, Value)> {
                let repr = self.serializer.encode(&event)?;
                Ok((event, repr))
            })
            .collect::<Result<Vec<_>>>()?;

        if encoded.is_empty() {
            return Ok(());
        }
        self.store.append_events(tx, &encoded)
    }
}

// ---------------------------------------------------------------------------
// Inner functions: accept &Connection so they work with both
// Connection (auto-commit) and an open transaction.
// ---------------------------------------------------------------------------

fn put_record_on(conn: &Connection, key: &WorkKey, value: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO records (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key.as_str(), serde_json::to_string(value)?, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn remove_record_on(conn: &Connection, key: &WorkKey) -> Result<()> {
    conn.execute("DELETE FROM records WHERE key = ?1", params![key.as_str()])?;
    Ok(())
}

fn get_record_on(conn: &Connection, key: &WorkKey) -> Result<Option<Value>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM records WHERE key = ?1",
            params![key.as_str()],
            |row| row.get(0),
        )
        .optional()?;

    raw.map(|s| serde_json::from_str(&s).map_err(Error::from))
        .transpose()
}

fn append_events_on(conn: &Connection, events: &[(DataEvent, Value)]) -> Result<()> {
    let mut stmt = conn.prepare(
        "INSERT INTO events (event_id, kind, subject, timestamp, payload)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;

    for (event, repr) in events {
        stmt.execute(params![
            event.id.to_string(),
            event.kind,
            event.subject.as_str(),
            event.time.to_rfc3339(),
            serde_json::to_string(repr)?,
        ])?;
    }
    Ok(())
}
