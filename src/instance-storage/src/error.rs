// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use mz_txn_kv::KvError;

use crate::codec::MalformedRowError;
use crate::retry::Cancelled;
use crate::sqlliveness::SessionIdError;
use crate::InstanceId;

/// An error from the instance storage.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("unable to decode region from session id: {0}")]
    RegionDecode(#[from] SessionIdError),
    /// Every row of the region is claimed by a live session.
    #[error("no preallocated instance rows available")]
    NoPreallocatedRows,
    #[error(transparent)]
    MalformedRow(#[from] MalformedRowError),
    #[error(transparent)]
    Kv(#[from] KvError),
    #[error("checking session liveness: {0:#}")]
    Liveness(anyhow::Error),
    #[error("loading regions: {0:#}")]
    Regions(anyhow::Error),
    #[error("instance {0} not found")]
    NotFound(InstanceId),
    #[error("operation cancelled")]
    Cancelled,
}

impl InstanceError {
    /// Reports whether retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            InstanceError::Kv(err) => err.is_retryable(),
            _ => false,
        }
    }
}

impl From<Cancelled> for InstanceError {
    fn from(_: Cancelled) -> Self {
        InstanceError::Cancelled
    }
}
