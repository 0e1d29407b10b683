//! Unit of work: collects work units for one logical operation and either
//! applies them all (commit) or discards them all (abort).
//!
//! On commit, units run in ascending priority order. If any unit's owning
//! store is transactional, every unit and the event publication run inside
//! one transaction on that store, and the transaction is committed only
//! after publication succeeded.

pub mod manager;
mod pending;

pub use manager::UnitOfWorkManager;

use std::sync::Arc;
use std::time::Instant;

use opentelemetry::KeyValue;
use tracing::{debug, info, warn};

use crate::error::{Error, Result, Stage};
use crate::event::{EventBatch, EventPublisher};
use crate::model::{Phase, UowId, WorkKey};
use crate::store::{Store, TxGuard};
use crate::telemetry::{metrics, uow as spans};
use crate::work::WorkUnit;

use pending::PendingSet;

/// Per-operation coordinator. One-shot: once completed it cannot restart.
///
/// Not meant to be shared across threads; each logical operation owns its
/// own instance.
pub struct UnitOfWork {
    id: UowId,
    phase: Phase,
    /// `Some` iff `phase == Active`.
    pending: Option<PendingSet>,
    publisher: Arc<dyn EventPublisher>,
}

impl UnitOfWork {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self {
            id: UowId::new(),
            phase: Phase::Idle,
            pending: None,
            publisher,
        }
    }

    pub fn id(&self) -> UowId {
        self.id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Number of pending units; zero unless active.
    pub fn pending_len(&self) -> usize {
        self.pending.as_ref().map_or(0, PendingSet::len)
    }

    pub fn is_pending(&self, key: &WorkKey) -> bool {
        self.pending.as_ref().is_some_and(|p| p.contains(key))
    }

    /// Begin collecting work. No-op if already active.
    pub fn start(&mut self) -> Result<()> {
        match self.phase {
            Phase::Completed => Err(Error::AlreadyCompleted),
            Phase::Active => Ok(()),
            Phase::Idle => {
                self.phase = Phase::Active;
                self.pending = Some(PendingSet::new());
                debug!(uow = %self.id, "unit of work started");
                Ok(())
            }
        }
    }

    /// Register a work unit. A pending unit with the same key is replaced
    /// and the replacement moves to the end of the registration order.
    pub fn register(&mut self, unit: impl WorkUnit + 'static) -> Result<()> {
        self.register_boxed(Box::new(unit))
    }

    pub fn register_boxed(&mut self, unit: Box<dyn WorkUnit>) -> Result<()> {
        let Some(pending) = self.pending.as_mut() else {
            return Err(Error::NotStarted { phase: self.phase });
        };
        if unit.key().is_empty() {
            return Err(Error::InvalidArgument(
                "work unit must have a non-empty key".to_string(),
            ));
        }

        let key = unit.key().clone();
        let priority = unit.priority();
        match pending.upsert(unit) {
            Some(_) => {
                debug!(uow = %self.id, %key, priority, "work unit replaced");
                metrics::units_replaced().add(1, &[]);
            }
            None => {
                debug!(uow = %self.id, %key, priority, "work unit registered");
                metrics::units_registered().add(1, &[]);
            }
        }
        Ok(())
    }

    /// Apply every pending unit, publish one event batch, and commit the
    /// participating transaction if there is one. Completes the unit of work.
    ///
    /// On failure the remaining steps are skipped, an open transaction is
    /// released without commit, and the error comes back as
    /// [`Error::WorkFailure`]. The unit of work stays active with its pending
    /// units, so the caller can still [`abort`](Self::abort). Plain units
    /// already performed are not undone.
    pub fn commit(&mut self) -> Result<()> {
        let id = self.id;
        let Some(pending) = self.pending.as_mut() else {
            return Err(Error::NotStarted { phase: self.phase });
        };
        let span = spans::start_commit_span(&id.0, pending.len());
        let _entered = span.enter();
        let started = Instant::now();

        let result = drain(
            id,
            self.publisher.as_ref(),
            pending.in_execution_order(),
            &span,
        );

        let outcome = if result.is_ok() { "committed" } else { "failed" };
        spans::record_outcome(&span, outcome);
        metrics::commit_duration_ms().record(
            started.elapsed().as_secs_f64() * 1000.0,
            &[KeyValue::new("outcome", outcome)],
        );

        match result {
            Ok(published) => {
                self.complete();
                metrics::completed().add(1, &[KeyValue::new("outcome", outcome)]);
                info!(uow = %id, published, "unit of work committed");
                Ok(())
            }
            Err(e) => {
                record_failure(&e);
                warn!(uow = %id, "commit failed, unit of work still active: {e}");
                Err(e)
            }
        }
    }

    /// Discard every pending unit, calling each unit's `abort` in execution
    /// order. Nothing is performed or published.
    ///
    /// If a unit's `abort` fails, the units already aborted are dropped, the
    /// failing unit and the rest stay pending, and the unit of work stays
    /// active.
    pub fn abort(&mut self) -> Result<()> {
        let id = self.id;
        let Some(pending) = self.pending.as_mut() else {
            return Err(Error::NotStarted { phase: self.phase });
        };
        let span = spans::start_abort_span(&id.0, pending.len());
        let _entered = span.enter();

        let result = pending.drain_each(|unit| {
            debug!(key = %unit.key(), priority = unit.priority(), "aborting work unit");
            unit.abort()
        });
        if let Err(e) = result {
            let e = Error::work_failure(Stage::Abort, e);
            spans::record_outcome(&span, "failed");
            record_failure(&e);
            warn!(uow = %id, remaining = pending.len(), "abort failed: {e}");
            return Err(e);
        }

        self.complete();
        spans::record_outcome(&span, "aborted");
        metrics::completed().add(1, &[KeyValue::new("outcome", "aborted")]);
        info!(uow = %id, "unit of work aborted");
        Ok(())
    }

    fn complete(&mut self) {
        debug_assert!(self.phase.can_transition_to(Phase::Completed));
        self.pending = None;
        self.phase = Phase::Completed;
    }
}

fn record_failure(e: &Error) {
    let stage = e.stage().map_or_else(|| "unknown".to_string(), |s| s.to_string());
    metrics::failures().add(1, &[KeyValue::new("stage", stage)]);
}

/// Run units and publish. Returns the number of published events.
fn drain(
    id: UowId,
    publisher: &dyn EventPublisher,
    units: &mut [Box<dyn WorkUnit>],
    span: &tracing::Span,
) -> Result<usize> {
    let mut batch = EventBatch::new();

    // First transactional store in execution order participates.
    let participant: Option<Arc<dyn Store>> = units
        .iter()
        .filter_map(|unit| unit.store())
        .find(|store| store.as_transactional().is_some());
    let transactional = participant.as_deref().and_then(|store| store.as_transactional());
    spans::record_transactional(span, transactional.is_some());

    let Some(tx_store) = transactional else {
        for unit in units.iter_mut() {
            debug!(key = %unit.key(), priority = unit.priority(), "performing work unit");
            batch.append(unit.data());
            unit.perform(None)
                .map_err(|e| Error::work_failure(Stage::Perform, e))?;
        }
        let published = batch.len();
        publisher
            .publish(batch, None)
            .map_err(|e| Error::work_failure(Stage::Publish, e))?;
        metrics::events_published().add(published as u64, &[]);
        return Ok(published);
    };

    let mut guard = TxGuard::begin(tx_store).map_err(|e| Error::work_failure(Stage::Begin, e))?;
    debug!(uow = %id, tx = %guard.id(), "running inside transaction");

    for unit in units.iter_mut() {
        debug!(key = %unit.key(), priority = unit.priority(), "performing work unit");
        batch.append(unit.data());
        unit.perform(Some(guard.handle()))
            .map_err(|e| Error::work_failure(Stage::Perform, e))?;
    }
    let published = batch.len();
    publisher
        .publish(batch, Some(guard.handle()))
        .map_err(|e| Error::work_failure(Stage::Publish, e))?;
    guard
        .commit()
        .map_err(|e| Error::work_failure(Stage::Commit, e))?;
    metrics::events_published().add(published as u64, &[]);
    Ok(published)
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("id", &self.id)
            .field("phase", &self.phase)
            .field("pending", &self.pending_len())
            .finish_non_exhaustive()
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        if self.phase == Phase::Active {
            warn!(
                uow = %self.id,
                pending = self.pending_len(),
                "unit of work dropped while active, pending work discarded"
            );
        }
    }
}
