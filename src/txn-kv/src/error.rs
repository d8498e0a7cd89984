// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use bytes::Bytes;

use crate::Timestamp;

/// An error returned by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    /// The key is locked by another transaction that could not be pushed.
    #[error("write conflict on key {key:?}: locked by another transaction")]
    WriteConflict { key: Bytes },
    /// A key read by the transaction changed before it could commit.
    #[error("read conflict on key {key:?}: value changed since it was read")]
    ReadConflict { key: Bytes },
    /// The transaction was aborted by a higher-priority transaction.
    #[error("transaction aborted by a higher priority transaction")]
    Aborted,
    /// The transaction tried to commit after its deadline.
    #[error("transaction deadline {deadline} exceeded at {now}")]
    DeadlineExceeded { deadline: Timestamp, now: Timestamp },
}

impl KvError {
    /// Reports whether running the transaction again may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            KvError::WriteConflict { .. } | KvError::ReadConflict { .. } | KvError::Aborted => true,
            KvError::DeadlineExceeded { .. } => false,
        }
    }
}
