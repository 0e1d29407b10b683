//! Domain events produced by a committed unit of work.
//!
//! Every work unit contributes one [`DataEvent`] to an [`EventBatch`]; the
//! batch is handed to an [`EventPublisher`] exactly once per commit, even
//! when it is empty.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::WorkKey;
use crate::store::TransactionHandle;

/// An event emitted for one applied work unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataEvent {
    /// Unique event identifier.
    pub id: Uuid,
    /// What happened (e.g. `"order.placed"`).
    pub kind: String,
    /// The entity the event is about.
    pub subject: WorkKey,
    /// When the event was produced.
    pub time: DateTime<Utc>,
    /// Event body. Opaque to the coordinator.
    pub data: serde_json::Value,
}

impl DataEvent {
    pub fn new(
        kind: impl Into<String>,
        subject: impl Into<WorkKey>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            subject: subject.into(),
            time: Utc::now(),
            data,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch
// ---------------------------------------------------------------------------

/// Ordered, append-only set of events from one committed unit of work.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventBatch {
    events: Vec<DataEvent>,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an event. No dedup, no validation.
    pub fn append(&mut self, event: DataEvent) {
        self.events.push(event);
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, DataEvent> {
        self.events.iter()
    }

    pub fn events(&self) -> &[DataEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<DataEvent> {
        self.events
    }
}

impl IntoIterator for EventBatch {
    type Item = DataEvent;
    type IntoIter = std::vec::IntoIter<DataEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}

impl<'a> IntoIterator for &'a EventBatch {
    type Item = &'a DataEvent;
    type IntoIter = std::slice::Iter<'a, DataEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

/// Sink that delivers a whole batch as one logical unit.
///
/// When the unit of work runs inside a transaction, the handle is passed
/// along so publication can join the same transactional scope.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, batch: EventBatch, tx: Option<&mut dyn TransactionHandle>) -> Result<()>;
}

/// Sends each batch as one message on an unbounded tokio channel.
///
/// `send` never blocks, so this works from synchronous commit paths.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    sender: mpsc::UnboundedSender<EventBatch>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<EventBatch>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, batch: EventBatch, _tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        self.sender
            .send(batch)
            .map_err(|_| Error::Other("event channel closed".to_string()))
    }
}

type Listener = Box<dyn Fn(&EventBatch) -> Result<()> + Send + Sync>;

/// In-process listener set that also keeps every published batch.
#[derive(Default)]
pub struct CollectingPublisher {
    listeners: Mutex<Vec<Listener>>,
    published: Mutex<Vec<EventBatch>>,
}

impl CollectingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Listeners run in registration order; the first
    /// failure stops delivery and fails the publish.
    pub fn subscribe(&self, listener: impl Fn(&EventBatch) -> Result<()> + Send + Sync + 'static) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.push(Box::new(listener));
        }
    }

    /// Every batch published so far, oldest first.
    pub fn published(&self) -> Vec<EventBatch> {
        self.published
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    pub fn publish_count(&self) -> usize {
        self.published.lock().map(|p| p.len()).unwrap_or_default()
    }
}

impl std::fmt::Debug for CollectingPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectingPublisher")
            .field("published", &self.publish_count())
            .finish_non_exhaustive()
    }
}

impl EventPublisher for CollectingPublisher {
    fn publish(&self, batch: EventBatch, _tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        let listeners = self
            .listeners
            .lock()
            .map_err(|_| Error::Other("listener set lock poisoned".to_string()))?;
        for listener in listeners.iter() {
            listener(&batch)?;
        }
        drop(listeners);

        self.published
            .lock()
            .map_err(|_| Error::Other("published history lock poisoned".to_string()))?
            .push(batch);
        Ok(())
    }
}

/// Publishes each batch to several publishers in order, sharing the handle.
pub struct FanoutPublisher {
    publishers: Vec<Arc<dyn EventPublisher>>,
}

impl FanoutPublisher {
    pub fn new(publishers: Vec<Arc<dyn EventPublisher>>) -> Self {
        Self { publishers }
    }
}

impl EventPublisher for FanoutPublisher {
    fn publish(&self, batch: EventBatch, mut tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        for publisher in &self.publishers {
            // Fresh reborrow per publisher; the cast shortens the object lifetime.
            let handle = tx
                .as_mut()
                .map(|t| &mut **t as &mut dyn TransactionHandle);
            publisher.publish(batch.clone(), handle)?;
        }
        Ok(())
    }
}
