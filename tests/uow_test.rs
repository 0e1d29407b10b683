//! Integration tests for the unit of work coordinator.

use std::any::Any;
use std::sync::{Arc, Mutex};

use serde_json::{Value, json};
use uow_rs::event::{CollectingPublisher, DataEvent, EventBatch, EventPublisher};
use uow_rs::model::{Phase, Priority, StoreId, TxId, WorkKey};
use uow_rs::store::{MemoryStore, Store, TransactionHandle, TransactionalStore};
use uow_rs::{
    BaseWorkUnit, Error, RecordWorkUnit, Result, Stage, UnitOfWork, UnitOfWorkManager, WorkUnit,
};

// ---------------------------------------------------------------------------
// Fixtures: everything writes into one shared journal so tests can assert
// on the exact interleaving of perform / publish / commit / release.
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    fn push(&self, entry: impl Into<String>) {
        self.0.lock().unwrap().push(entry.into());
    }

    fn entries(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn count(&self, prefix: &str) -> usize {
        self.entries()
            .iter()
            .filter(|e| e.starts_with(prefix))
            .count()
    }
}

struct JournalStore {
    id: StoreId,
    name: String,
    journal: Journal,
    transactional: bool,
    fail_at: Option<Stage>,
}

impl JournalStore {
    fn new(name: &str, journal: &Journal, transactional: bool) -> Arc<Self> {
        Arc::new(Self {
            id: StoreId::new(),
            name: name.to_string(),
            journal: journal.clone(),
            transactional,
            fail_at: None,
        })
    }

    /// Transactional store whose `Begin` or `Commit` step fails.
    fn failing_at(name: &str, journal: &Journal, stage: Stage) -> Arc<Self> {
        Arc::new(Self {
            id: StoreId::new(),
            name: name.to_string(),
            journal: journal.clone(),
            transactional: true,
            fail_at: Some(stage),
        })
    }
}

struct JournalTx {
    id: TxId,
    store_id: StoreId,
    store_name: String,
    journal: Journal,
    committed: bool,
}

impl TransactionHandle for JournalTx {
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

impl Drop for JournalTx {
    fn drop(&mut self) {
        let state = if self.committed { "committed" } else { "uncommitted" };
        self.journal
            .push(format!("release {} ({state})", self.store_name));
    }
}

impl Store for JournalStore {
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
        _value: &Value,
    ) -> Result<()> {
        let scoped = tx.is_some_and(|t| t.store_id() == self.id);
        self.journal
            .push(format!("put {}:{key} scoped={scoped}", self.name));
        Ok(())
    }

    fn remove(&self, _tx: Option<&mut dyn TransactionHandle>, key: &WorkKey) -> Result<()> {
        self.journal.push(format!("remove {}:{key}", self.name));
        Ok(())
    }

    fn get(&self, _key: &WorkKey) -> Result<Option<Value>> {
        Ok(None)
    }

    fn as_transactional(&self) -> Option<&dyn TransactionalStore> {
        if self.transactional { Some(self) } else { None }
    }
}

impl TransactionalStore for JournalStore {
    fn start_transaction(&self) -> Result<Box<dyn TransactionHandle>> {
        if self.fail_at == Some(Stage::Begin) {
            self.journal.push(format!("begin {} (failed)", self.name));
            return Err(Error::Other("connection refused".into()));
        }
        self.journal.push(format!("begin {}", self.name));
        Ok(Box::new(JournalTx {
            id: TxId::new(),
            store_id: self.id,
            store_name: self.name.clone(),
            journal: self.journal.clone(),
            committed: false,
        }))
    }

    fn commit_transaction(&self, handle: &mut dyn TransactionHandle) -> Result<()> {
        let tx = handle
            .as_any_mut()
            .downcast_mut::<JournalTx>()
            .ok_or_else(|| Error::Other("foreign handle".into()))?;
        if self.fail_at == Some(Stage::Commit) {
            self.journal.push(format!("commit {} (failed)", self.name));
            return Err(Error::Other("disk full".into()));
        }
        tx.committed = true;
        self.journal.push(format!("commit {}", self.name));
        Ok(())
    }
}

/// Plain or store-backed unit that journals its calls.
struct TestUnit {
    key: WorkKey,
    tag: String,
    priority: Priority,
    journal: Journal,
    store: Option<Arc<dyn Store>>,
    fail_perform: bool,
    fail_abort: bool,
}

impl TestUnit {
    fn new(journal: &Journal, key: &str, tag: &str, priority: Priority) -> Self {
        Self {
            key: WorkKey::from(key),
            tag: tag.to_string(),
            priority,
            journal: journal.clone(),
            store: None,
            fail_perform: false,
            fail_abort: false,
        }
    }

    fn backed_by(mut self, store: Arc<dyn Store>) -> Self {
        self.store = Some(store);
        self
    }

    fn failing(mut self) -> Self {
        self.fail_perform = true;
        self
    }

    fn failing_abort(mut self) -> Self {
        self.fail_abort = true;
        self
    }
}

impl WorkUnit for TestUnit {
    fn key(&self) -> &WorkKey {
        &self.key
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn data(&self) -> DataEvent {
        DataEvent::new(self.tag.clone(), self.key.clone(), json!({ "tag": self.tag }))
    }

    fn perform(&mut self, tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        self.journal
            .push(format!("perform {} tx={}", self.tag, tx.is_some()));
        if self.fail_perform {
            return Err(Error::Other(format!("{} failed", self.tag)));
        }
        Ok(())
    }

    fn abort(&mut self) -> Result<()> {
        self.journal.push(format!("abort {}", self.tag));
        if self.fail_abort {
            return Err(Error::Other(format!("{} abort failed", self.tag)));
        }
        Ok(())
    }

    fn store(&self) -> Option<Arc<dyn Store>> {
        self.store.clone()
    }
}

struct JournalPublisher {
    journal: Journal,
    batches: Mutex<Vec<EventBatch>>,
    fail: bool,
}

impl JournalPublisher {
    fn new(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            batches: Mutex::new(Vec::new()),
            fail: false,
        })
    }

    fn failing(journal: &Journal) -> Arc<Self> {
        Arc::new(Self {
            journal: journal.clone(),
            batches: Mutex::new(Vec::new()),
            fail: true,
        })
    }

    fn batches(&self) -> Vec<EventBatch> {
        self.batches.lock().unwrap().clone()
    }
}

impl EventPublisher for JournalPublisher {
    fn publish(&self, batch: EventBatch, tx: Option<&mut dyn TransactionHandle>) -> Result<()> {
        self.journal
            .push(format!("publish {} tx={}", batch.len(), tx.is_some()));
        if self.fail {
            return Err(Error::Other("broker unavailable".into()));
        }
        self.batches.lock().unwrap().push(batch);
        Ok(())
    }
}

fn started(publisher: Arc<dyn EventPublisher>) -> UnitOfWork {
    let mut uow = UnitOfWork::new(publisher);
    uow.start().unwrap();
    uow
}

fn tags(batch: &EventBatch) -> Vec<String> {
    batch.iter().map(|e| e.kind.clone()).collect()
}

// ---------------------------------------------------------------------------
// Ordering and dedup
// ---------------------------------------------------------------------------

#[test]
fn commit_applies_units_in_ascending_priority() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "p5", 5)).unwrap();
    uow.register(TestUnit::new(&journal, "b", "p1", 1)).unwrap();
    uow.register(TestUnit::new(&journal, "c", "p3", 3)).unwrap();
    uow.commit().unwrap();

    assert_eq!(
        journal.entries(),
        vec![
            "perform p1 tx=false",
            "perform p3 tx=false",
            "perform p5 tx=false",
            "publish 3 tx=false",
        ]
    );
    let batches = publisher.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(tags(&batches[0]), vec!["p1", "p3", "p5"]);
}

#[test]
fn same_identity_keeps_only_latest_registration() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "X", "u1", 2)).unwrap();
    uow.register(TestUnit::new(&journal, "X", "u2", 2)).unwrap();
    assert_eq!(uow.pending_len(), 1);
    uow.commit().unwrap();

    assert_eq!(journal.count("perform u1"), 0);
    assert_eq!(journal.count("perform u2"), 1);
    assert_eq!(tags(&publisher.batches()[0]), vec!["u2"]);
}

#[test]
fn equal_priorities_run_in_last_registered_order() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "a1", 1)).unwrap();
    uow.register(TestUnit::new(&journal, "b", "b1", 1)).unwrap();
    uow.register(TestUnit::new(&journal, "c", "c1", 1)).unwrap();
    // Re-registering "a" moves it behind "b" and "c".
    uow.register(TestUnit::new(&journal, "a", "a2", 1)).unwrap();
    uow.commit().unwrap();

    assert_eq!(tags(&publisher.batches()[0]), vec!["b1", "c1", "a2"]);
}

#[test]
fn re_registration_takes_new_priority() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "a-late", 9)).unwrap();
    uow.register(TestUnit::new(&journal, "b", "b", 5)).unwrap();
    uow.register(TestUnit::new(&journal, "a", "a-early", 0)).unwrap();
    uow.commit().unwrap();

    assert_eq!(tags(&publisher.batches()[0]), vec!["a-early", "b"]);
}

// ---------------------------------------------------------------------------
// Publication
// ---------------------------------------------------------------------------

#[test]
fn empty_commit_still_publishes_once() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.commit().unwrap();

    assert_eq!(journal.entries(), vec!["publish 0 tx=false"]);
    assert_eq!(publisher.batches().len(), 1);
    assert!(publisher.batches()[0].is_empty());
}

#[test]
fn publish_failure_on_plain_path_is_reported() {
    let journal = Journal::default();
    let mut uow = started(JournalPublisher::failing(&journal));

    uow.register(TestUnit::new(&journal, "a", "a", 0)).unwrap();
    let err = uow.commit().unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Publish));
    // Plain work already performed stays performed.
    assert_eq!(journal.count("perform a"), 1);
}

// ---------------------------------------------------------------------------
// Transactions
// ---------------------------------------------------------------------------

#[test]
fn transactional_store_wraps_all_units_and_commits_after_publish() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::new("db", &journal, true);
    let mut uow = started(publisher.clone());

    uow.register(
        RecordWorkUnit::upsert(store.clone(), "order/1", json!({"qty": 1})).with_priority(1),
    )
    .unwrap();
    uow.register(TestUnit::new(&journal, "audit", "plain", 2))
        .unwrap();
    uow.commit().unwrap();

    assert_eq!(
        journal.entries(),
        vec![
            "begin db",
            "put db:order/1 scoped=true",
            "perform plain tx=true",
            "publish 2 tx=true",
            "commit db",
            "release db (committed)",
        ]
    );
    assert_eq!(publisher.batches()[0].len(), 2);
}

#[test]
fn perform_failure_releases_transaction_without_commit() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::new("db", &journal, true);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "ok", 1).backed_by(store.clone()))
        .unwrap();
    uow.register(TestUnit::new(&journal, "b", "bad", 2).failing())
        .unwrap();
    uow.register(TestUnit::new(&journal, "c", "never", 3))
        .unwrap();

    let err = uow.commit().unwrap_err();
    assert!(matches!(
        err,
        Error::WorkFailure {
            stage: Stage::Perform,
            ..
        }
    ));

    assert_eq!(
        journal.entries(),
        vec![
            "begin db",
            "perform ok tx=true",
            "perform bad tx=true",
            "release db (uncommitted)",
        ]
    );
    assert!(publisher.batches().is_empty());
    assert_eq!(uow.phase(), Phase::Active);
    assert_eq!(uow.pending_len(), 3);
}

#[test]
fn commit_failure_is_reported_after_publish() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::failing_at("db", &journal, Stage::Commit);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "a", 0).backed_by(store))
        .unwrap();
    let err = uow.commit().unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Commit));
    assert_eq!(
        journal.entries(),
        vec![
            "begin db",
            "perform a tx=true",
            "publish 1 tx=true",
            "commit db (failed)",
            "release db (uncommitted)",
        ]
    );
    assert_eq!(publisher.batches().len(), 1);
    assert_eq!(uow.phase(), Phase::Active);
}

#[test]
fn begin_failure_performs_nothing() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::failing_at("db", &journal, Stage::Begin);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "a", 0).backed_by(store))
        .unwrap();
    uow.register(TestUnit::new(&journal, "b", "b", 1)).unwrap();
    let err = uow.commit().unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Begin));
    assert_eq!(journal.entries(), vec!["begin db (failed)"]);
    assert!(publisher.batches().is_empty());

    // Still active: the caller decides to abort.
    uow.abort().unwrap();
    assert_eq!(
        journal.entries(),
        vec!["begin db (failed)", "abort a", "abort b"]
    );
    assert_eq!(uow.phase(), Phase::Completed);
}

#[test]
fn failed_commit_can_be_aborted() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "ok", 1)).unwrap();
    uow.register(TestUnit::new(&journal, "b", "bad", 2).failing())
        .unwrap();

    assert!(uow.commit().is_err());
    uow.abort().unwrap();

    assert_eq!(
        journal.entries(),
        vec![
            "perform ok tx=false",
            "perform bad tx=false",
            "abort ok",
            "abort bad",
        ]
    );
    assert!(publisher.batches().is_empty());
    assert!(matches!(uow.start(), Err(Error::AlreadyCompleted)));
}

#[test]
fn publish_failure_releases_transaction_without_commit() {
    let journal = Journal::default();
    let store = JournalStore::new("db", &journal, true);
    let mut uow = started(JournalPublisher::failing(&journal));

    uow.register(TestUnit::new(&journal, "a", "a", 0).backed_by(store.clone()))
        .unwrap();
    let err = uow.commit().unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Publish));
    assert_eq!(journal.count("commit"), 0);
    assert_eq!(
        journal.entries().last().map(String::as_str),
        Some("release db (uncommitted)")
    );
}

#[test]
fn non_transactional_store_runs_without_handle() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::new("plain-db", &journal, false);
    let mut uow = started(publisher);

    uow.register(RecordWorkUnit::upsert(store, "k", json!(1)))
        .unwrap();
    uow.commit().unwrap();

    assert_eq!(journal.count("begin"), 0);
    assert_eq!(
        journal.entries(),
        vec!["put plain-db:k scoped=false", "publish 1 tx=false"]
    );
}

#[test]
fn only_first_transactional_store_participates() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let first = JournalStore::new("first", &journal, true);
    let second = JournalStore::new("second", &journal, true);
    let mut uow = started(publisher);

    // Registered first but runs second.
    uow.register(RecordWorkUnit::upsert(second, "s", json!(1)).with_priority(2))
        .unwrap();
    uow.register(RecordWorkUnit::upsert(first, "f", json!(1)).with_priority(1))
        .unwrap();
    uow.commit().unwrap();

    assert_eq!(journal.count("begin"), 1);
    assert_eq!(
        journal.entries(),
        vec![
            "begin first",
            "put first:f scoped=true",
            "put second:s scoped=false",
            "publish 2 tx=true",
            "commit first",
            "release first (committed)",
        ]
    );
}

#[test]
fn plain_path_failure_leaves_earlier_effects_in_place() {
    let journal = Journal::default();
    let store = Arc::new(MemoryStore::new("mem"));
    let mut uow = started(JournalPublisher::new(&journal));

    uow.register(RecordWorkUnit::upsert(store.clone(), "first", json!(1)).with_priority(1))
        .unwrap();
    uow.register(TestUnit::new(&journal, "second", "bad", 2).failing())
        .unwrap();

    assert!(uow.commit().is_err());
    assert_eq!(store.get(&WorkKey::from("first")).unwrap(), Some(json!(1)));
    assert_eq!(journal.count("publish"), 0);
}

// ---------------------------------------------------------------------------
// Abort
// ---------------------------------------------------------------------------

#[test]
fn abort_calls_unit_aborts_in_priority_order_and_never_publishes() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let store = JournalStore::new("db", &journal, true);
    let mut uow = started(publisher.clone());

    uow.register(TestUnit::new(&journal, "a", "late", 7).backed_by(store))
        .unwrap();
    uow.register(TestUnit::new(&journal, "b", "early", 2))
        .unwrap();
    uow.abort().unwrap();

    assert_eq!(journal.entries(), vec!["abort early", "abort late"]);
    assert!(publisher.batches().is_empty());
    assert_eq!(uow.phase(), Phase::Completed);
}

#[test]
fn abort_failure_stops_remaining_aborts() {
    let journal = Journal::default();
    let mut uow = started(JournalPublisher::new(&journal));

    uow.register(TestUnit::new(&journal, "a", "first", 1))
        .unwrap();
    uow.register(TestUnit::new(&journal, "b", "second", 2).failing_abort())
        .unwrap();
    uow.register(TestUnit::new(&journal, "c", "third", 3))
        .unwrap();

    let err = uow.abort().unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Abort));
    assert_eq!(journal.entries(), vec!["abort first", "abort second"]);

    // Already-aborted units are gone; the rest stay pending.
    assert_eq!(uow.phase(), Phase::Active);
    assert_eq!(uow.pending_len(), 2);
    assert!(!uow.is_pending(&WorkKey::from("a")));
}

// ---------------------------------------------------------------------------
// Lifecycle contract
// ---------------------------------------------------------------------------

#[test]
fn operations_before_start_fail_with_not_started() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = UnitOfWork::new(publisher.clone());

    assert!(matches!(
        uow.register(TestUnit::new(&journal, "a", "a", 0)),
        Err(Error::NotStarted { phase: Phase::Idle })
    ));
    assert!(matches!(uow.commit(), Err(Error::NotStarted { .. })));
    assert!(matches!(uow.abort(), Err(Error::NotStarted { .. })));

    assert_eq!(uow.pending_len(), 0);
    assert!(journal.entries().is_empty());
    assert_eq!(uow.phase(), Phase::Idle);
}

#[test]
fn completed_unit_cannot_be_reused() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let mut uow = started(publisher.clone());
    uow.commit().unwrap();

    assert!(matches!(uow.start(), Err(Error::AlreadyCompleted)));
    assert!(matches!(
        uow.register(TestUnit::new(&journal, "a", "a", 0)),
        Err(Error::NotStarted {
            phase: Phase::Completed
        })
    ));
    assert!(matches!(uow.commit(), Err(Error::NotStarted { .. })));
    assert!(matches!(uow.abort(), Err(Error::NotStarted { .. })));
    assert_eq!(uow.pending_len(), 0);
    assert_eq!(publisher.batches().len(), 1);
}

#[test]
fn aborted_unit_cannot_be_restarted() {
    let mut uow = started(Arc::new(CollectingPublisher::new()));
    uow.abort().unwrap();
    assert!(matches!(uow.start(), Err(Error::AlreadyCompleted)));
}

#[test]
fn is_pending_tracks_registered_keys() {
    let mut uow = started(Arc::new(CollectingPublisher::new()));
    uow.register(BaseWorkUnit::new("order/1", "k", json!(null), || Ok(())))
        .unwrap();
    assert!(uow.is_pending(&WorkKey::from("order/1")));
    assert!(!uow.is_pending(&WorkKey::from("order/2")));
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

#[test]
fn manager_run_commits_on_success() {
    let publisher = Arc::new(CollectingPublisher::new());
    let manager = UnitOfWorkManager::new(publisher.clone());

    let registered = manager
        .run(|uow| {
            uow.register(BaseWorkUnit::new("a", "a.done", json!(1), || Ok(())))?;
            uow.register(BaseWorkUnit::new("b", "b.done", json!(2), || Ok(())))?;
            Ok(uow.pending_len())
        })
        .unwrap();

    assert_eq!(registered, 2);
    assert_eq!(publisher.publish_count(), 1);
    assert_eq!(publisher.published()[0].len(), 2);
}

#[test]
fn manager_run_aborts_on_error() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let manager = UnitOfWorkManager::new(publisher.clone());

    let result: Result<()> = manager.run(|uow| {
        uow.register(TestUnit::new(&journal, "a", "a", 0))?;
        Err(Error::Other("validation failed".into()))
    });

    assert!(matches!(result, Err(Error::Other(_))));
    assert_eq!(journal.entries(), vec!["abort a"]);
    assert!(publisher.batches().is_empty());
}

#[test]
fn manager_run_aborts_when_commit_fails() {
    let journal = Journal::default();
    let publisher = JournalPublisher::new(&journal);
    let manager = UnitOfWorkManager::new(publisher.clone());

    let err = manager
        .run(|uow| {
            uow.register(TestUnit::new(&journal, "a", "ok", 1))?;
            uow.register(TestUnit::new(&journal, "b", "bad", 2).failing())
        })
        .unwrap_err();

    assert_eq!(err.stage(), Some(Stage::Perform));
    assert_eq!(
        journal.entries(),
        vec![
            "perform ok tx=false",
            "perform bad tx=false",
            "abort ok",
            "abort bad",
        ]
    );
    assert!(publisher.batches().is_empty());
}

#[test]
fn manager_run_respects_explicit_completion() {
    let publisher = Arc::new(CollectingPublisher::new());
    let manager = UnitOfWorkManager::new(publisher.clone());

    manager
        .run(|uow| {
            uow.register(BaseWorkUnit::new("a", "a", json!(1), || Ok(())))?;
            uow.abort()
        })
        .unwrap();

    assert_eq!(publisher.publish_count(), 0);
}
