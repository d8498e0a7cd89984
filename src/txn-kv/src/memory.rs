// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! An in-memory implementation of [`Db`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;
use tracing::trace;

use crate::{
    Batch, BatchOp, Db, KeyValue, KvError, NowFn, Priority, Span, Timestamp, Txn, WaitPolicy,
};

type TxnId = u64;

#[derive(Debug, Clone)]
struct Versioned {
    /// `None` is a tombstone, kept so that deletions invalidate readers.
    value: Option<Bytes>,
    version: u64,
    timestamp: Timestamp,
}

#[derive(Debug)]
struct TxnRecord {
    priority: Priority,
    aborted: bool,
    read_version: u64,
}

#[derive(Debug, Default)]
struct State {
    data: BTreeMap<Bytes, Versioned>,
    /// Keys of `data` that are tombstones.
    tombstones: BTreeSet<Bytes>,
    /// Incremented by every commit.
    version: u64,
    last_commit: Timestamp,
    locks: BTreeMap<Bytes, TxnId>,
    txns: BTreeMap<TxnId, TxnRecord>,
    next_txn_id: TxnId,
}

impl State {
    fn check_live(&self, id: TxnId) -> Result<(), KvError> {
        match self.txns.get(&id) {
            Some(record) if !record.aborted => Ok(()),
            _ => Err(KvError::Aborted),
        }
    }

    fn priority(&self, id: TxnId) -> Priority {
        self.txns
            .get(&id)
            .map_or(Priority::Low, |record| record.priority)
    }

    fn release(&mut self, id: TxnId) {
        self.locks.retain(|_, holder| *holder != id);
    }

    fn push(&mut self, id: TxnId) {
        trace!("pushing transaction {id}");
        if let Some(record) = self.txns.get_mut(&id) {
            record.aborted = true;
        }
        self.release(id);
    }

    fn finish(&mut self, id: TxnId) {
        self.release(id);
        self.txns.remove(&id);
        self.prune_tombstones();
    }

    /// Drops the tombstones that every live transaction already observes.
    fn prune_tombstones(&mut self) {
        let horizon = self
            .txns
            .values()
            .map(|record| record.read_version)
            .min()
            .unwrap_or(self.version);
        let data = &mut self.data;
        self.tombstones.retain(|key| match data.get(key) {
            Some(versioned) if versioned.version <= horizon => {
                data.remove(key);
                false
            }
            Some(_) => true,
            None => false,
        });
    }
}

#[derive(Debug)]
struct Inner {
    state: Mutex<State>,
    /// Signalled whenever locks are released.
    released: Notify,
    now: NowFn,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("lock poisoned")
    }
}

/// An in-memory transactional key-value store.
///
/// Cheaply clonable; all clones share the same data.
#[derive(Debug, Clone)]
pub struct MemDb {
    inner: Arc<Inner>,
}

impl Default for MemDb {
    fn default() -> Self {
        MemDb::new(NowFn::system())
    }
}

impl MemDb {
    /// Returns an empty store whose commit timestamps are drawn from `now`.
    pub fn new(now: NowFn) -> Self {
        MemDb {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                released: Notify::new(),
                now,
            }),
        }
    }

    /// Returns the committed values in `span`, outside of any transaction.
    pub fn snapshot(&self, span: &Span) -> Vec<KeyValue> {
        let state = self.inner.lock();
        state
            .data
            .range(span.start.clone()..span.end.clone())
            .filter_map(|(key, versioned)| {
                versioned.value.as_ref().map(|value| KeyValue {
                    key: key.clone(),
                    value: value.clone(),
                    timestamp: versioned.timestamp,
                })
            })
            .collect()
    }
}

impl Db for MemDb {
    type Txn = MemTxn;

    fn begin(&self) -> MemTxn {
        let mut state = self.inner.lock();
        let id = state.next_txn_id;
        state.next_txn_id += 1;
        let read_version = state.version;
        state.txns.insert(
            id,
            TxnRecord {
                priority: Priority::Normal,
                aborted: false,
                read_version,
            },
        );
        MemTxn {
            db: Arc::clone(&self.inner),
            id,
            read_version,
            priority: Priority::Normal,
            deadline: None,
            reads: Vec::new(),
            intents: BTreeMap::new(),
            finished: false,
        }
    }
}

#[derive(Debug)]
enum Read {
    Span(Span),
    Key(Bytes),
}

/// A transaction against a [`MemDb`].
#[derive(Debug)]
pub struct MemTxn {
    db: Arc<Inner>,
    id: TxnId,
    read_version: u64,
    priority: Priority,
    deadline: Option<Timestamp>,
    reads: Vec<Read>,
    intents: BTreeMap<Bytes, Option<Bytes>>,
    finished: bool,
}

/// The outcome of one attempt at a blocking scan.
enum ScanAttempt {
    Done(Vec<KeyValue>),
    /// A lock held by a transaction we may not push is in the way.
    Blocked,
}

impl MemTxn {
    /// Takes the lock on `key`, pushing a lower-priority holder if necessary.
    ///
    /// Returns whether another transaction was pushed.
    fn acquire(&self, state: &mut State, key: &Bytes) -> Result<bool, KvError> {
        match state.locks.get(key).copied() {
            Some(holder) if holder == self.id => Ok(false),
            Some(holder) if self.priority > state.priority(holder) => {
                state.push(holder);
                state.locks.insert(key.clone(), self.id);
                Ok(true)
            }
            Some(_) => Err(KvError::WriteConflict { key: key.clone() }),
            None => {
                state.locks.insert(key.clone(), self.id);
                Ok(false)
            }
        }
    }

    fn try_scan(&mut self, state: &mut State, span: &Span, policy: WaitPolicy) -> ScanAttempt {
        if policy == WaitPolicy::Block {
            let holders: Vec<TxnId> = state
                .locks
                .range(span.start.clone()..span.end.clone())
                .map(|(_, holder)| *holder)
                .filter(|holder| *holder != self.id)
                .collect();
            for holder in holders {
                if self.priority > state.priority(holder) {
                    state.push(holder);
                } else {
                    return ScanAttempt::Blocked;
                }
            }
        }

        let mut out = BTreeMap::new();
        for (key, versioned) in state.data.range(span.start.clone()..span.end.clone()) {
            let foreign_lock = state
                .locks
                .get(key)
                .is_some_and(|holder| *holder != self.id);
            if policy == WaitPolicy::SkipLocked && foreign_lock {
                continue;
            }
            if let Some(value) = &versioned.value {
                out.insert(
                    key.clone(),
                    KeyValue {
                        key: key.clone(),
                        value: value.clone(),
                        timestamp: versioned.timestamp,
                    },
                );
            }
        }

        match policy {
            WaitPolicy::Block => self.reads.push(Read::Span(span.clone())),
            WaitPolicy::SkipLocked => self
                .reads
                .extend(out.keys().map(|key| Read::Key(key.clone()))),
        }

        let provisional = state.last_commit.step_forward();
        for (key, intent) in self.intents.range(span.start.clone()..span.end.clone()) {
            match intent {
                Some(value) => {
                    out.insert(
                        key.clone(),
                        KeyValue {
                            key: key.clone(),
                            value: value.clone(),
                            timestamp: provisional,
                        },
                    );
                }
                None => {
                    out.remove(key);
                }
            }
        }

        ScanAttempt::Done(out.into_values().collect())
    }

    fn write_intent(&mut self, key: Bytes, value: Option<Bytes>) -> Result<(), KvError> {
        let db = Arc::clone(&self.db);
        let pushed = {
            let mut state = db.lock();
            state.check_live(self.id)?;
            self.acquire(&mut state, &key)?
        };
        if pushed {
            db.released.notify_waiters();
        }
        self.intents.insert(key, value);
        Ok(())
    }

    fn validate(&self, state: &State) -> Result<(), KvError> {
        let changed = |versioned: &Versioned| versioned.version > self.read_version;
        for read in &self.reads {
            match read {
                Read::Span(span) => {
                    if let Some((key, _)) = state
                        .data
                        .range(span.start.clone()..span.end.clone())
                        .find(|(_, versioned)| changed(versioned))
                    {
                        return Err(KvError::ReadConflict { key: key.clone() });
                    }
                }
                Read::Key(key) => {
                    if state.data.get(key).is_some_and(changed) {
                        return Err(KvError::ReadConflict { key: key.clone() });
                    }
                }
            }
        }
        Ok(())
    }

    fn try_commit(&mut self, state: &mut State, batch: Batch) -> Result<Timestamp, KvError> {
        state.check_live(self.id)?;

        let commit_ts = std::cmp::max(self.db.now.now(), state.last_commit.step_forward());
        if let Some(deadline) = self.deadline {
            if commit_ts > deadline {
                return Err(KvError::DeadlineExceeded {
                    deadline,
                    now: commit_ts,
                });
            }
        }

        for op in batch.ops() {
            self.acquire(state, op.key())?;
        }
        self.validate(state)?;

        state.version += 1;
        state.last_commit = commit_ts;
        let version = state.version;
        let batch_writes = batch.ops.into_iter().map(|op| match op {
            BatchOp::Put(key, value) => (key, Some(value)),
            BatchOp::Del(key) => (key, None),
        });
        let writes = std::mem::take(&mut self.intents)
            .into_iter()
            .chain(batch_writes);
        for (key, value) in writes {
            if value.is_some() {
                state.tombstones.remove(&key);
            } else {
                state.tombstones.insert(key.clone());
            }
            state.data.insert(
                key,
                Versioned {
                    value,
                    version,
                    timestamp: commit_ts,
                },
            );
        }
        Ok(commit_ts)
    }
}

#[async_trait]
impl Txn for MemTxn {
    fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
        let mut state = self.db.lock();
        if let Some(record) = state.txns.get_mut(&self.id) {
            record.priority = priority;
        }
    }

    fn update_deadline(&mut self, deadline: Timestamp) {
        self.deadline = Some(match self.deadline {
            Some(current) => std::cmp::min(current, deadline),
            None => deadline,
        });
    }

    async fn scan(&mut self, span: Span, policy: WaitPolicy) -> Result<Vec<KeyValue>, KvError> {
        let db = Arc::clone(&self.db);
        loop {
            let released = {
                let mut state = db.lock();
                state.check_live(self.id)?;
                match self.try_scan(&mut state, &span, policy) {
                    ScanAttempt::Done(kvs) => {
                        drop(state);
                        // We may have pushed someone; wake anyone waiting on
                        // their locks.
                        db.released.notify_waiters();
                        return Ok(kvs);
                    }
                    // Registered before the state lock is dropped, so a
                    // release in between is not missed.
                    ScanAttempt::Blocked => db.released.notified(),
                }
            };
            released.await;
        }
    }

    async fn put(&mut self, key: Bytes, value: Bytes) -> Result<(), KvError> {
        self.write_intent(key, Some(value))
    }

    async fn del(&mut self, key: Bytes) -> Result<(), KvError> {
        self.write_intent(key, None)
    }

    async fn commit_in_batch(mut self, batch: Batch) -> Result<Timestamp, KvError> {
        let db = Arc::clone(&self.db);
        let res = {
            let mut state = db.lock();
            let res = self.try_commit(&mut state, batch);
            state.finish(self.id);
            res
        };
        self.finished = true;
        db.released.notify_waiters();
        res
    }
}

impl Drop for MemTxn {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Ok(mut state) = self.db.state.lock() {
            state.finish(self.id);
        }
        self.db.released.notify_waiters();
    }
}
