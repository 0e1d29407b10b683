//! Work units: pending changes collected by a unit of work.
//!
//! A work unit is something that will be applied when the unit of work
//! commits. It has identity (the entity it affects), a priority, an event
//! describing it, and apply/undo actions.

use std::sync::Arc;

use serde_json::{Value, json};
use tracing::debug;

use crate::error::Result;
use crate::event::DataEvent;
use crate::model::{Priority, WorkKey};
use crate::store::{Store, TransactionHandle};

/// One pending change.
///
/// Units are owned by the unit of work from registration until drained.
/// `perform` and `abort` either succeed or fail fatally.
pub trait WorkUnit: Send {
    /// Identity. A later unit with the same key replaces this one.
    fn key(&self) -> &WorkKey;

    /// Ascending: lower priorities run first.
    fn priority(&self) -> Priority {
        0
    }

    /// Event appended to the batch when this unit is applied.
    fn data(&self) -> DataEvent;

    /// Apply the change, scoped to `tx` if one is supplied.
    fn perform(&mut self, tx: Option<&mut dyn TransactionHandle>) -> Result<()>;

    /// Discard the change without applying it.
    fn abort(&mut self) -> Result<()>;

    /// Owning store, for store-backed work. `None` for plain work.
    fn store(&self) -> Option<Arc<dyn Store>> {
        None
    }
}

// ---------------------------------------------------------------------------
// Plain work
// ---------------------------------------------------------------------------

type Action = Box<dyn FnMut() -> Result<()> + Send>;

/// Plain work built from closures, with no owning store.
pub struct BaseWorkUnit {
    key: WorkKey,
    priority: Priority,
    event: DataEvent,
    action: Action,
    compensation: Option<Action>,
}

impl BaseWorkUnit {
    /// `kind` and `data` describe the event this unit contributes.
    pub fn new(
        key: impl Into<WorkKey>,
        kind: impl Into<String>,
        data: Value,
        action: impl FnMut() -> Result<()> + Send + 'static,
    ) -> Self {
        let key = key.into();
        Self {
            event: DataEvent::new(kind, key.clone(), data),
            key,
            priority: 0,
            action: Box::new(action),
            compensation: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Action run on abort. Without one, abort only discards the unit.
    pub fn with_compensation(
        mut self,
        compensation: impl FnMut() -> Result<()> + Send + 'static,
    ) -> Self {
        self.compensation = Some(Box::new(compensation));
        self
    }
}

impl std::fmt::Debug for BaseWorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseWorkUnit")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("kind", &self.event.kind)
            .finish_non_exhaustive()
    }
}

impl WorkUnit for BaseWorkUnit {
    fn key(&self) -> &WorkKey {
        &self.key
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn data(&self) -> DataEvent {
        self.event.clone()
    }

    fn perform(&mut self, _tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        (self.action)()
    }

    fn abort(&mut self) -> Result<()> {
        match self.compensation.as_mut() {
            Some(compensation) => compensation(),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Store-backed work
// ---------------------------------------------------------------------------

/// The change a [`RecordWorkUnit`] applies to its record.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordChange {
    Upsert(Value),
    Remove,
}

/// Store-backed work: upserts or removes one record in its owning store.
///
/// Writes join the transaction when the handle belongs to the owning store,
/// and go straight to the store otherwise.
pub struct RecordWorkUnit {
    key: WorkKey,
    priority: Priority,
    kind: String,
    change: RecordChange,
    store: Arc<dyn Store>,
}

impl RecordWorkUnit {
    pub fn upsert(store: Arc<dyn Store>, key: impl Into<WorkKey>, value: Value) -> Self {
        Self {
            key: key.into(),
            priority: 0,
            kind: "record.upserted".to_string(),
            change: RecordChange::Upsert(value),
            store,
        }
    }

    pub fn remove(store: Arc<dyn Store>, key: impl Into<WorkKey>) -> Self {
        Self {
            key: key.into(),
            priority: 0,
            kind: "record.removed".to_string(),
            change: RecordChange::Remove,
            store,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Override the event kind (defaults to `record.upserted`/`record.removed`).
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = kind.into();
        self
    }

    pub fn change(&self) -> &RecordChange {
        &self.change
    }
}

impl std::fmt::Debug for RecordWorkUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordWorkUnit")
            .field("key", &self.key)
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .field("store", &self.store.name())
            .finish_non_exhaustive()
    }
}

impl WorkUnit for RecordWorkUnit {
    fn key(&self) -> &WorkKey {
        &self.key
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn data(&self) -> DataEvent {
        let value = match &self.change {
            RecordChange::Upsert(value) => value.clone(),
            RecordChange::Remove => Value::Null,
        };
        DataEvent::new(
            self.kind.clone(),
            self.key.clone(),
            json!({ "store": self.store.name(), "value": value }),
        )
    }

    fn perform(&mut self, tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        match &self.change {
            RecordChange::Upsert(value) => self.store.put(tx, &self.key, value),
            RecordChange::Remove => self.store.remove(tx, &self.key),
        }
    }

    fn abort(&mut self) -> Result<()> {
        debug!(key = %self.key, store = self.store.name(), "discarding record change");
        Ok(())
    }

    fn store(&self) -> Option<Arc<dyn Store>> {
        Some(Arc::clone(&self.store))
    }
}
