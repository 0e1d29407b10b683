//! Hands out units of work bound to a shared event publisher.

use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::event::EventPublisher;
use crate::model::Phase;

use super::UnitOfWork;

/// Factory for units of work. Cheap to clone; every clone shares the
/// publisher.
#[derive(Clone)]
pub struct UnitOfWorkManager {
    publisher: Arc<dyn EventPublisher>,
}

impl UnitOfWorkManager {
    pub fn new(publisher: Arc<dyn EventPublisher>) -> Self {
        Self { publisher }
    }

    /// A fresh, idle unit of work.
    pub fn new_unit_of_work(&self) -> UnitOfWork {
        UnitOfWork::new(Arc::clone(&self.publisher))
    }

    /// Run one operation inside a started unit of work.
    ///
    /// Commits when `operation` returns `Ok` and aborts when it returns
    /// `Err` or when the commit itself fails. If `operation` already
    /// completed the unit itself, nothing more happens.
    pub fn run<T>(&self, operation: impl FnOnce(&mut UnitOfWork) -> Result<T>) -> Result<T> {
        let mut uow = self.new_unit_of_work();
        uow.start()?;

        let result = operation(&mut uow).and_then(|value| {
            if uow.phase() == Phase::Active {
                uow.commit()?;
            }
            Ok(value)
        });

        if result.is_err() && uow.phase() == Phase::Active {
            if let Err(abort_err) = uow.abort() {
                warn!(uow = %uow.id(), "abort after failed operation also failed: {abort_err}");
            }
        }
        result
    }
}

impl std::fmt::Debug for UnitOfWorkManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWorkManager").finish_non_exhaustive()
    }
}
