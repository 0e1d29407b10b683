//! # uow-rs
//!
//! Transactional unit of work for command handling.
//!
//! Collects the work units produced while handling one operation, then
//! applies them in priority order and publishes one event batch (commit),
//! or discards them all (abort). When a unit's owning store supports
//! transactions, state changes and event publication share one transaction.

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod serializer;
pub mod storage;
pub mod store;
pub mod telemetry;
pub mod uow;
pub mod work;

pub use error::{Error, Result, Stage};
pub use event::{DataEvent, EventBatch, EventPublisher};
pub use model::{Phase, Priority, WorkKey};
pub use store::{Store, TransactionHandle, TransactionalStore};
pub use uow::{UnitOfWork, UnitOfWorkManager};
pub use work::{BaseWorkUnit, RecordWorkUnit, WorkUnit};
