//! Store abstraction and the optional transactional capability.
//!
//! A store-backed work unit points at the store that owns its entity. The
//! unit of work asks that store whether it supports transactions; if it
//! does, the store opens one [`TransactionHandle`] that every work unit and
//! the event publisher run inside.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::model::{StoreId, TxId, WorkKey};

/// An open transaction on some store.
///
/// Dropping a handle that was never committed must leave the store as if
/// nothing happened (rollback).
pub trait TransactionHandle: Send {
    fn id(&self) -> TxId;

    /// The store that opened this handle.
    fn store_id(&self) -> StoreId;

    /// Lets the owning store recover its concrete handle type.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// Capability of a store that can scope writes in a transaction.
pub trait TransactionalStore: Send + Sync {
    fn start_transaction(&self) -> Result<Box<dyn TransactionHandle>>;

    fn commit_transaction(&self, handle: &mut dyn TransactionHandle) -> Result<()>;
}

/// Keyed JSON record store owning the entities that work units change.
pub trait Store: Send + Sync {
    fn id(&self) -> StoreId;

    fn name(&self) -> &str;

    /// Insert or replace a record, inside `tx` when it belongs to this store.
    fn put(&self, tx: Option<&mut dyn TransactionHandle>, key: &WorkKey, value: &Value)
    -> Result<()>;

    /// Remove a record, inside `tx` when it belongs to this store.
    fn remove(&self, tx: Option<&mut dyn TransactionHandle>, key: &WorkKey) -> Result<()>;

    fn get(&self, key: &WorkKey) -> Result<Option<Value>>;

    /// Capability query: `Some` if this store supports transactions.
    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        None
    }
}

// ---------------------------------------------------------------------------
// Guard
// ---------------------------------------------------------------------------

/// Scoped transaction handle. Released on drop, committed or not.
///
/// Only the unit of work opens handles; work units only ever borrow one.
pub struct TxGuard<'s> {
    store: &'s dyn TransactionalStore,
    handle: Box<dyn TransactionHandle>,
    committed: bool,
}

impl<'s> TxGuard<'s> {
    pub fn begin(store: &'s dyn TransactionalStore) -> Result<Self> {
        let handle = store.start_transaction()?;
        debug!(tx = %handle.id(), "transaction opened");
        Ok(Self {
            store,
            handle,
            committed: false,
        })
    }

    pub fn id(&self) -> TxId {
        self.handle.id()
    }

    pub fn handle(&mut self) -> &mut dyn TransactionHandle {
        self.handle.as_mut()
    }

    /// Commit the handle. It is released when the guard drops.
    pub fn commit(mut self) -> Result<()> {
        self.store.commit_transaction(self.handle.as_mut())?;
        self.committed = true;
        debug!(tx = %self.handle.id(), "transaction committed");
        Ok(())
    }
}

impl Drop for TxGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            warn!(tx = %self.handle.id(), "releasing transaction without commit");
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Non-transactional in-memory store. Writes are visible immediately and
/// any handle passed in is ignored.
#[derive(Debug)]
pub struct MemoryStore {
    id: StoreId,
    name: String,
    records: Mutex<BTreeMap<WorkKey, Value>>,
}

impl MemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: StoreId::new(),
            name: name.into(),
            records: Mutex::new(BTreeMap::new()),
        }
    }

    /// Snapshot of every record, ordered by key.
    pub fn records(&self) -> Result<Vec<(WorkKey, Value)>> {
        let records = self.lock()?;
        Ok(records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<WorkKey, Value>>> {
        self.records
            .lock()
            .map_err(|_| Error::Other(format!("store {} lock poisoned", self.name)))
    }
}

impl Store for MemoryStore {
    fn id(&self) -> StoreId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn put(
        &self,
        _tx: Option<&mut dyn TransactionHandle>,
        key: &WorkKey,
        value: &Value,
    ) -> Result<()> {
        self.lock()?.insert(key.clone(), value.clone());
        Ok(())
    }

    fn remove(&self, _tx: Option<&mut dyn TransactionHandle>, key: &WorkKey) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn get(&self, key: &WorkKey) -> Result<Option<Value>> {
        Ok(self.lock()?.get(key).cloned())
    }
}
