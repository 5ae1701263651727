//! In-memory transactional store.
//!
//! [`InMemoryStore`] implements every store contract of `relay-core` with the
//! same observable semantics as the Postgres store:
//!
//! - writes are buffered in the transaction and applied on commit; dropping
//!   the transaction discards them
//! - `acquire_batch` / `fetch_due` claim rows until the transaction ends and
//!   concurrent transactions skip claimed rows
//! - unique keys (inbox event id, outbox dedup key, job key, idempotency key)
//!   are locked for the rest of the transaction, so a concurrent writer of the
//!   same key waits and then observes the committed row
//! - savepoints truncate the buffered writes
//!
//! Faults can be injected per operation with [`InMemoryStore::inject_fault`].

#![allow(clippy::missing_panics_doc)] // Poisoned locks are recovered, nothing panics

use chrono::{DateTime, Utc};
use relay_core::environment::{Clock, SystemClock};
use relay_core::idempotency::{IdempotencyRecord, IdempotencyStore, LockedKey, StoredResponse};
use relay_core::inbox::{InboxRecord, InboxStore};
use relay_core::jobs::{JobFailure, JobStatus, JobStore, NewScheduledJob, ScheduledJob};
use relay_core::outbox::{NewOutboxEvent, OutboxRecord, OutboxStore};
use relay_core::store::{Admission, StoreError, Transactional};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

/// Store operations that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Fault {
    /// `Transactional::begin`
    Begin,
    /// `Transactional::commit` (the transaction is rolled back)
    Commit,
    /// `OutboxStore::insert_event`
    OutboxInsert,
    /// `OutboxStore::mark_published`
    MarkPublished,
    /// `InboxStore::record`
    InboxRecord,
    /// `JobStore::fetch_due`
    FetchDue,
    /// `JobStore::record_failure`
    RecordFailure,
}

#[derive(Debug, Clone, Default)]
struct State {
    outbox: BTreeMap<i64, OutboxRecord>,
    inbox: HashMap<String, InboxRecord>,
    idempotency: HashMap<(String, String), IdempotencyRecord>,
    jobs: BTreeMap<i64, ScheduledJob>,
    records: BTreeMap<String, BTreeMap<String, Value>>,
}

#[derive(Debug, Clone)]
enum Op {
    InsertOutbox(OutboxRecord),
    MarkPublished(Vec<i64>, DateTime<Utc>),
    InsertInbox(InboxRecord),
    ReserveKey(IdempotencyRecord),
    FinalizeKey {
        business_id: String,
        key: String,
        response: StoredResponse,
        at: DateTime<Utc>,
    },
    InsertJob(ScheduledJob),
    MarkProcessed(Vec<i64>, DateTime<Utc>),
    RecordFailure(JobFailure, DateTime<Utc>),
    PutRecord {
        collection: String,
        id: String,
        value: Value,
    },
}

impl Op {
    fn apply(&self, state: &mut State) {
        match self {
            Self::InsertOutbox(record) => {
                state.outbox.insert(record.id, record.clone());
            }
            Self::MarkPublished(ids, at) => {
                for id in ids {
                    if let Some(row) = state.outbox.get_mut(id) {
                        row.published_at.get_or_insert(*at);
                    }
                }
            }
            Self::InsertInbox(record) => {
                state
                    .inbox
                    .entry(record.event_id.clone())
                    .or_insert_with(|| record.clone());
            }
            Self::ReserveKey(record) => {
                state
                    .idempotency
                    .entry((record.business_id.clone(), record.idempotency_key.clone()))
                    .or_insert_with(|| record.clone());
            }
            Self::FinalizeKey {
                business_id,
                key,
                response,
                at,
            } => {
                if let Some(row) = state
                    .idempotency
                    .get_mut(&(business_id.clone(), key.clone()))
                {
                    row.resource_id.clone_from(&response.resource_id);
                    row.status_code = Some(response.status_code);
                    row.response_body = Some(response.body.clone());
                    row.updated_at = *at;
                }
            }
            Self::InsertJob(job) => {
                state.jobs.insert(job.id, job.clone());
            }
            Self::MarkProcessed(ids, at) => {
                for id in ids {
                    if let Some(job) = state.jobs.get_mut(id) {
                        job.status = JobStatus::Processed;
                        job.updated_at = *at;
                    }
                }
            }
            Self::RecordFailure(failure, at) => {
                if let Some(job) = state.jobs.get_mut(&failure.job_id) {
                    job.apply_failure(failure, *at);
                }
            }
            Self::PutRecord {
                collection,
                id,
                value,
            } => {
                state
                    .records
                    .entry(collection.clone())
                    .or_default()
                    .insert(id.clone(), value.clone());
            }
        }
    }
}

#[derive(Debug, Default)]
struct Claims {
    outbox: HashSet<i64>,
    jobs: HashSet<i64>,
}

struct Shared {
    state: Mutex<State>,
    claims: Mutex<Claims>,
    key_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<HashMap<Fault, u32>>,
    next_outbox_id: AtomicI64,
    next_job_id: AtomicI64,
    clock: Arc<dyn Clock>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn take_fault(&self, fault: Fault) -> Result<(), StoreError> {
        let mut faults = lock(&self.faults);
        match faults.get_mut(&fault) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(StoreError::FaultInjected(format!("{fault:?}")))
            }
            _ => Ok(()),
        }
    }

    fn key_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            lock(&self.key_locks)
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Forget the lock of `name` once nobody holds or waits for it.
    fn release_key_lock(&self, name: &str) {
        let mut key_locks = lock(&self.key_locks);
        if key_locks
            .get(name)
            .is_some_and(|mutex| Arc::strong_count(mutex) == 1)
        {
            key_locks.remove(name);
        }
    }
}

/// In-memory implementation of every store trait.
///
/// Cloning shares the underlying tables.
///
/// # Example
///
/// ```
/// use relay_core::outbox::{NewOutboxEvent, OutboxStore};
/// use relay_core::store::Transactional;
/// use relay_testing::InMemoryStore;
///
/// # async fn example() -> Result<(), relay_core::StoreError> {
/// let store = InMemoryStore::new();
/// let mut tx = store.begin().await?;
/// let event = NewOutboxEvent::new("appointment", "A1", "booking.appointment.booked.v1", b"{}".to_vec());
/// store.insert_event(&mut tx, &event).await?;
/// store.commit(tx).await?;
///
/// assert_eq!(store.unpublished().len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct InMemoryStore {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").finish_non_exhaustive()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// Create an empty store using the system clock for timestamps.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store using `clock` for timestamps.
    #[must_use]
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                claims: Mutex::new(Claims::default()),
                key_locks: Mutex::new(HashMap::new()),
                faults: Mutex::new(HashMap::new()),
                next_outbox_id: AtomicI64::new(1),
                next_job_id: AtomicI64::new(1),
                clock,
            }),
        }
    }

    /// Make the next `times` calls of `fault` fail with
    /// [`StoreError::FaultInjected`].
    pub fn inject_fault(&self, fault: Fault, times: u32) {
        *lock(&self.shared.faults).entry(fault).or_insert(0) += times;
    }

    /// Remove every pending fault.
    pub fn clear_faults(&self) {
        lock(&self.shared.faults).clear();
    }

    /// Write a domain record inside `tx`, standing in for the business
    /// mutation guarded by the outbox, inbox or an idempotency key.
    pub fn put_record(
        &self,
        tx: &mut InMemoryTx,
        collection: impl Into<String>,
        id: impl Into<String>,
        value: Value,
    ) {
        tx.ops.push(Op::PutRecord {
            collection: collection.into(),
            id: id.into(),
            value,
        });
    }

    /// Committed domain records of a collection, ordered by id.
    #[must_use]
    pub fn records(&self, collection: &str) -> Vec<(String, Value)> {
        lock(&self.shared.state)
            .records
            .get(collection)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    /// Every committed outbox row, ordered by id.
    #[must_use]
    pub fn outbox(&self) -> Vec<OutboxRecord> {
        lock(&self.shared.state).outbox.values().cloned().collect()
    }

    /// Committed outbox rows not yet published.
    #[must_use]
    pub fn unpublished(&self) -> Vec<OutboxRecord> {
        lock(&self.shared.state)
            .outbox
            .values()
            .filter(|r| !r.is_published())
            .cloned()
            .collect()
    }

    /// Committed outbox rows of one event type.
    #[must_use]
    pub fn outbox_of_type(&self, event_type: &str) -> Vec<OutboxRecord> {
        lock(&self.shared.state)
            .outbox
            .values()
            .filter(|r| r.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Every committed inbox entry.
    #[must_use]
    pub fn inbox(&self) -> Vec<InboxRecord> {
        let mut rows: Vec<_> = lock(&self.shared.state).inbox.values().cloned().collect();
        rows.sort_by(|a, b| a.event_id.cmp(&b.event_id));
        rows
    }

    /// Committed idempotency row for `(business_id, key)`.
    #[must_use]
    pub fn idempotency_record(&self, business_id: &str, key: &str) -> Option<IdempotencyRecord> {
        lock(&self.shared.state)
            .idempotency
            .get(&(business_id.to_string(), key.to_string()))
            .cloned()
    }

    /// Every committed job, ordered by id.
    #[must_use]
    pub fn jobs(&self) -> Vec<ScheduledJob> {
        lock(&self.shared.state).jobs.values().cloned().collect()
    }

    /// Committed job by id.
    #[must_use]
    pub fn job(&self, id: i64) -> Option<ScheduledJob> {
        lock(&self.shared.state).jobs.get(&id).cloned()
    }

    fn now(&self) -> DateTime<Utc> {
        self.shared.clock.now()
    }

    /// Number of unique-key locks currently tracked.
    ///
    /// A lock is tracked while a transaction holds it or waits for it.
    #[must_use]
    pub fn tracked_key_locks(&self) -> usize {
        lock(&self.shared.key_locks).len()
    }

    /// Committed state with the transaction's own writes applied.
    fn view(&self, tx: &InMemoryTx) -> State {
        let mut state = lock(&self.shared.state).clone();
        for op in &tx.ops {
            op.apply(&mut state);
        }
        state
    }

    async fn lock_unique(&self, tx: &mut InMemoryTx, name: String) {
        if tx.held_keys.contains(&name) {
            return;
        }
        let guard = self.shared.key_lock(&name).lock_owned().await;
        tx.key_guards.push(guard);
        tx.held_keys.insert(name);
    }
}

/// Transaction handle of [`InMemoryStore`].
///
/// Dropping it without commit discards its writes and releases its claims
/// and key locks.
pub struct InMemoryTx {
    shared: Arc<Shared>,
    ops: Vec<Op>,
    savepoints: Vec<(&'static str, usize)>,
    claimed_outbox: HashSet<i64>,
    claimed_jobs: HashSet<i64>,
    key_guards: Vec<OwnedMutexGuard<()>>,
    held_keys: HashSet<String>,
}

impl std::fmt::Debug for InMemoryTx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTx")
            .field("pending_writes", &self.ops.len())
            .field("claimed_outbox", &self.claimed_outbox)
            .field("claimed_jobs", &self.claimed_jobs)
            .field("held_keys", &self.held_keys)
            .finish_non_exhaustive()
    }
}

impl Drop for InMemoryTx {
    fn drop(&mut self) {
        let mut claims = lock(&self.shared.claims);
        for id in &self.claimed_outbox {
            claims.outbox.remove(id);
        }
        for id in &self.claimed_jobs {
            claims.jobs.remove(id);
        }
        drop(claims);

        self.key_guards.clear();
        for name in &self.held_keys {
            self.shared.release_key_lock(name);
        }
    }
}

impl Transactional for InMemoryStore {
    type Tx = InMemoryTx;

    async fn begin(&self) -> Result<InMemoryTx, StoreError> {
        self.shared.take_fault(Fault::Begin)?;
        Ok(InMemoryTx {
            shared: Arc::clone(&self.shared),
            ops: Vec::new(),
            savepoints: Vec::new(),
            claimed_outbox: HashSet::new(),
            claimed_jobs: HashSet::new(),
            key_guards: Vec::new(),
            held_keys: HashSet::new(),
        })
    }

    async fn commit(&self, tx: InMemoryTx) -> Result<(), StoreError> {
        self.shared.take_fault(Fault::Commit)?;
        let mut state = lock(&self.shared.state);
        for op in &tx.ops {
            op.apply(&mut state);
        }
        drop(state);
        drop(tx);
        Ok(())
    }

    async fn rollback(&self, tx: InMemoryTx) -> Result<(), StoreError> {
        drop(tx);
        Ok(())
    }

    async fn savepoint(&self, tx: &mut InMemoryTx, name: &'static str) -> Result<(), StoreError> {
        tx.savepoints.push((name, tx.ops.len()));
        Ok(())
    }

    async fn rollback_to_savepoint(
        &self,
        tx: &mut InMemoryTx,
        name: &'static str,
    ) -> Result<(), StoreError> {
        let position = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| *n == name)
            .ok_or_else(|| StoreError::Database(format!("savepoint \"{name}\" does not exist")))?;
        let (_, mark) = tx.savepoints[position];
        tx.savepoints.truncate(position + 1);
        tx.ops.truncate(mark);
        Ok(())
    }

    async fn release_savepoint(
        &self,
        tx: &mut InMemoryTx,
        name: &'static str,
    ) -> Result<(), StoreError> {
        let position = tx
            .savepoints
            .iter()
            .rposition(|(n, _)| *n == name)
            .ok_or_else(|| StoreError::Database(format!("savepoint \"{name}\" does not exist")))?;
        tx.savepoints.truncate(position);
        Ok(())
    }
}

impl OutboxStore for InMemoryStore {
    async fn insert_event(
        &self,
        tx: &mut InMemoryTx,
        event: &NewOutboxEvent,
    ) -> Result<Admission<(i64, Uuid)>, StoreError> {
        self.shared.take_fault(Fault::OutboxInsert)?;

        if let Some(dedup_key) = &event.dedup_key {
            self.lock_unique(tx, format!("outbox:{dedup_key}")).await;
            let exists = self
                .view(tx)
                .outbox
                .values()
                .any(|r| r.dedup_key.as_deref() == Some(dedup_key.as_str()));
            if exists {
                return Ok(Admission::Duplicate);
            }
        }

        let id = self.shared.next_outbox_id.fetch_add(1, Ordering::SeqCst);
        let event_id = Uuid::new_v4();
        tx.ops.push(Op::InsertOutbox(OutboxRecord {
            id,
            event_id,
            aggregate_type: event.aggregate_type.clone(),
            aggregate_id: event.aggregate_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            trace: event.trace.clone(),
            dedup_key: event.dedup_key.clone(),
            created_at: self.now(),
            published_at: None,
        }));
        Ok(Admission::Admitted((id, event_id)))
    }

    async fn acquire_batch(
        &self,
        tx: &mut InMemoryTx,
        limit: usize,
    ) -> Result<Vec<OutboxRecord>, StoreError> {
        let mut claims = lock(&self.shared.claims);
        let view = self.view(tx);
        let batch: Vec<OutboxRecord> = view
            .outbox
            .into_values()
            .filter(|r| !r.is_published())
            .filter(|r| !claims.outbox.contains(&r.id) || tx.claimed_outbox.contains(&r.id))
            .take(limit)
            .collect();
        for row in &batch {
            claims.outbox.insert(row.id);
            tx.claimed_outbox.insert(row.id);
        }
        Ok(batch)
    }

    async fn mark_published(
        &self,
        tx: &mut InMemoryTx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.shared.take_fault(Fault::MarkPublished)?;
        tx.ops.push(Op::MarkPublished(ids.to_vec(), at));
        Ok(())
    }
}

impl InboxStore for InMemoryStore {
    async fn record(
        &self,
        tx: &mut InMemoryTx,
        event_id: &str,
        event_type: &str,
    ) -> Result<Admission<()>, StoreError> {
        self.shared.take_fault(Fault::InboxRecord)?;
        self.lock_unique(tx, format!("inbox:{event_id}")).await;

        if self.view(tx).inbox.contains_key(event_id) {
            return Ok(Admission::Duplicate);
        }
        tx.ops.push(Op::InsertInbox(InboxRecord {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            recorded_at: self.now(),
        }));
        Ok(Admission::Admitted(()))
    }
}

impl IdempotencyStore for InMemoryStore {
    async fn lock_key(
        &self,
        tx: &mut InMemoryTx,
        business_id: &str,
        key: &str,
    ) -> Result<LockedKey, StoreError> {
        self.lock_unique(tx, format!("idempotency:{business_id}:{key}"))
            .await;

        let existing = self
            .view(tx)
            .idempotency
            .get(&(business_id.to_string(), key.to_string()))
            .cloned();
        if let Some(record) = existing {
            return Ok(LockedKey::Existing(record));
        }

        let record = IdempotencyRecord::reservation(business_id, key, self.now());
        tx.ops.push(Op::ReserveKey(record.clone()));
        Ok(LockedKey::Reserved(record))
    }

    async fn finalize_key(
        &self,
        tx: &mut InMemoryTx,
        business_id: &str,
        key: &str,
        response: &StoredResponse,
    ) -> Result<(), StoreError> {
        let exists = self
            .view(tx)
            .idempotency
            .contains_key(&(business_id.to_string(), key.to_string()));
        if !exists {
            return Err(StoreError::InvalidData(format!(
                "idempotency key {business_id}/{key} is not reserved"
            )));
        }
        tx.ops.push(Op::FinalizeKey {
            business_id: business_id.to_string(),
            key: key.to_string(),
            response: response.clone(),
            at: self.now(),
        });
        Ok(())
    }
}

impl JobStore for InMemoryStore {
    async fn insert_job(
        &self,
        tx: &mut InMemoryTx,
        job: &NewScheduledJob,
    ) -> Result<Admission<i64>, StoreError> {
        self.lock_unique(tx, format!("job:{}", job.idempotency_key))
            .await;

        let exists = self
            .view(tx)
            .jobs
            .values()
            .any(|j| j.idempotency_key == job.idempotency_key);
        if exists {
            return Ok(Admission::Duplicate);
        }

        let id = self.shared.next_job_id.fetch_add(1, Ordering::SeqCst);
        let now = self.now();
        tx.ops.push(Op::InsertJob(ScheduledJob {
            id,
            idempotency_key: job.idempotency_key.clone(),
            payload: job.payload.clone(),
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: job.max_attempts,
            next_run_at: job.run_at,
            last_error: None,
            trace: job.trace.clone(),
            created_at: now,
            updated_at: now,
        }));
        Ok(Admission::Admitted(id))
    }

    async fn fetch_due(
        &self,
        tx: &mut InMemoryTx,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledJob>, StoreError> {
        self.shared.take_fault(Fault::FetchDue)?;

        let mut claims = lock(&self.shared.claims);
        let mut due: Vec<ScheduledJob> = self
            .view(tx)
            .jobs
            .into_values()
            .filter(|j| j.is_due(now))
            .filter(|j| !claims.jobs.contains(&j.id) || tx.claimed_jobs.contains(&j.id))
            .collect();
        due.sort_by_key(|j| (j.next_run_at, j.id));
        due.truncate(limit);
        for job in &due {
            claims.jobs.insert(job.id);
            tx.claimed_jobs.insert(job.id);
        }
        Ok(due)
    }

    async fn mark_processed(
        &self,
        tx: &mut InMemoryTx,
        ids: &[i64],
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        tx.ops.push(Op::MarkProcessed(ids.to_vec(), at));
        Ok(())
    }

    async fn record_failure(
        &self,
        tx: &mut InMemoryTx,
        failure: &JobFailure,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.shared.take_fault(Fault::RecordFailure)?;
        tx.ops.push(Op::RecordFailure(failure.clone(), at));
        Ok(())
    }
}
