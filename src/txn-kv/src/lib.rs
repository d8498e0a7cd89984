// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! A transactional key-value store interface.
//!
//! Callers open a [`Txn`] with [`Db::begin`], read with [`Txn::scan`] under a
//! [`WaitPolicy`], and atomically apply their writes with
//! [`Txn::commit_in_batch`]. A transaction that is dropped without committing
//! has no effect.
//!
//! [`MemDb`] is an in-memory implementation with optimistic read validation
//! and key locking, suitable for tests and single-process deployments.

use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;

mod error;
mod memory;

pub use crate::error::KvError;
pub use crate::memory::{MemDb, MemTxn};

/// A commit timestamp, in milliseconds since the Unix epoch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(u64);

impl Timestamp {
    /// The smallest representable timestamp.
    pub const MIN: Timestamp = Timestamp(0);
    /// The largest representable timestamp.
    pub const MAX: Timestamp = Timestamp(u64::MAX);

    /// Constructs a timestamp from milliseconds since the Unix epoch.
    pub const fn new(millis: u64) -> Self {
        Timestamp(millis)
    }

    /// Returns the timestamp immediately after this one, saturating at
    /// [`Timestamp::MAX`].
    pub fn step_forward(&self) -> Self {
        Timestamp(self.0.saturating_add(1))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A clock that reports the current [`Timestamp`].
///
/// Cheaply clonable; all clones share the same underlying function.
#[derive(Clone)]
pub struct NowFn(Arc<dyn Fn() -> Timestamp + Send + Sync>);

impl NowFn {
    /// Returns the current time according to this clock.
    pub fn now(&self) -> Timestamp {
        (self.0)()
    }

    /// A clock backed by the system wall clock.
    pub fn system() -> Self {
        NowFn::from(|| {
            let millis = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));
            Timestamp(millis)
        })
    }
}

impl<F> From<F> for NowFn
where
    F: Fn() -> Timestamp + Send + Sync + 'static,
{
    fn from(f: F) -> Self {
        NowFn(Arc::new(f))
    }
}

impl fmt::Debug for NowFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<now_fn>")
    }
}

/// A committed key-value pair, as returned by reads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,
    /// The value.
    pub value: Bytes,
    /// The commit timestamp of the write that produced this value.
    pub timestamp: Timestamp,
}

/// A half-open key range `[start, end)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Inclusive lower bound.
    pub start: Bytes,
    /// Exclusive upper bound.
    pub end: Bytes,
}

impl Span {
    /// The span covering every key that begins with `prefix`.
    pub fn prefix(prefix: Bytes) -> Self {
        let end = prefix_end(&prefix);
        Span { start: prefix, end }
    }

    /// The span containing exactly `key`.
    pub fn key(key: Bytes) -> Self {
        let mut end = Vec::with_capacity(key.len() + 1);
        end.extend_from_slice(&key);
        end.push(0);
        Span {
            start: key,
            end: Bytes::from(end),
        }
    }

    /// Reports whether `key` falls inside this span.
    pub fn contains(&self, key: &[u8]) -> bool {
        self.start.as_ref() <= key && key < self.end.as_ref()
    }
}

/// Returns the smallest key that is greater than every key prefixed by
/// `prefix`.
///
/// An empty prefix, or one made entirely of `0xff` bytes, has no such key; the
/// returned span end is then the maximal single-byte-longer key.
pub fn prefix_end(prefix: &[u8]) -> Bytes {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Bytes::from(end);
        }
    }
    let mut end = prefix.to_vec();
    end.push(u8::MAX);
    Bytes::from(end)
}

/// How a read treats keys locked by other in-flight transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitPolicy {
    /// Wait for the lock holder to finish (or push it aside, if this
    /// transaction has a higher priority).
    Block,
    /// Skip locked keys. The read observes only unlocked keys.
    SkipLocked,
}

/// The priority of a transaction when contending for locks.
///
/// A transaction that meets a lock held by a transaction of strictly lower
/// priority aborts the holder instead of waiting for it.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    /// Yields to everything else.
    Low,
    /// The default.
    #[default]
    Normal,
    /// Never waits behind lower-priority transactions.
    Max,
}

/// A single write in a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Sets `key` to `value`.
    Put(Bytes, Bytes),
    /// Removes `key`.
    Del(Bytes),
}

impl BatchOp {
    /// The key this operation writes.
    pub fn key(&self) -> &Bytes {
        match self {
            BatchOp::Put(key, _) | BatchOp::Del(key) => key,
        }
    }
}

/// A set of writes applied atomically by [`Txn::commit_in_batch`].
#[derive(Debug, Default, Clone)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Adds a write of `value` to `key`.
    pub fn put(&mut self, key: impl Into<Bytes>, value: impl Into<Bytes>) {
        self.ops.push(BatchOp::Put(key.into(), value.into()));
    }

    /// Adds a deletion of `key`.
    pub fn del(&mut self, key: impl Into<Bytes>) {
        self.ops.push(BatchOp::Del(key.into()));
    }

    /// The writes in this batch, in insertion order.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Reports whether the batch contains no writes.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Returns the number of writes in the batch.
    pub fn len(&self) -> usize {
        self.ops.len()
    }
}

/// A handle to a transactional key-value store.
pub trait Db: fmt::Debug + Send + Sync + 'static {
    /// The transaction type of this store.
    type Txn: Txn;

    /// Opens a new transaction.
    fn begin(&self) -> Self::Txn;
}

/// An open transaction.
///
/// Writes issued with [`Txn::put`] and [`Txn::del`] take locks immediately and
/// become visible to other transactions only on commit. Dropping the
/// transaction without committing releases its locks and discards its writes.
#[async_trait]
pub trait Txn: fmt::Debug + Send {
    /// Sets the lock contention priority of the transaction.
    fn set_priority(&mut self, priority: Priority);

    /// Lowers the commit deadline of the transaction to `deadline`.
    ///
    /// A deadline later than the current one is ignored. Committing after the
    /// deadline fails with [`KvError::DeadlineExceeded`].
    fn update_deadline(&mut self, deadline: Timestamp);

    /// Returns all committed values in `span`, in key order, overlaid with the
    /// transaction's own uncommitted writes.
    async fn scan(&mut self, span: Span, policy: WaitPolicy) -> Result<Vec<KeyValue>, KvError>;

    /// Returns the committed value of `key`, if any.
    async fn get(&mut self, key: Bytes) -> Result<Option<KeyValue>, KvError> {
        let mut kvs = self.scan(Span::key(key.clone()), WaitPolicy::Block).await?;
        Ok(kvs.pop().filter(|kv| kv.key == key))
    }

    /// Writes `value` to `key`, locking it until the transaction finishes.
    async fn put(&mut self, key: Bytes, value: Bytes) -> Result<(), KvError>;

    /// Deletes `key`, locking it until the transaction finishes.
    async fn del(&mut self, key: Bytes) -> Result<(), KvError>;

    /// Atomically applies the transaction's writes plus `batch` and commits.
    ///
    /// Returns the commit timestamp.
    async fn commit_in_batch(self, batch: Batch) -> Result<Timestamp, KvError>;
}
