// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Cluster version gates for the regional-by-row migration of the instances
//! table.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use mz_txn_kv::{Batch, KvError, Txn};
use tracing::warn;

/// The key under which the active cluster version is persisted.
const VERSION_KEY: &[u8] = b"\x00\x00\x00\x06/settings/version";

/// A step of the migration of the instances table to the regional-by-row
/// layout. Later stages imply earlier ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MigrationStage {
    /// Writes go to both layouts; reads use the old one.
    RbrDualWrite,
    /// Writes go to both layouts; reads use the new one.
    RbrReadNew,
    /// Only the new layout is written.
    RbrSingleWrite,
    /// The old layout may be dropped.
    RbrCleanup,
}

impl MigrationStage {
    fn ordinal(&self) -> u8 {
        match self {
            MigrationStage::RbrDualWrite => 1,
            MigrationStage::RbrReadNew => 2,
            MigrationStage::RbrSingleWrite => 3,
            MigrationStage::RbrCleanup => 4,
        }
    }
}

/// The active cluster version, i.e. the latest [`MigrationStage`] reached.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterVersion(u8);

impl ClusterVersion {
    /// The version before the migration started.
    pub const BASE: ClusterVersion = ClusterVersion(0);
    /// The version at which every stage is active.
    pub const LATEST: ClusterVersion = ClusterVersion(4);

    /// The version at which `stage` was reached.
    pub fn at(stage: MigrationStage) -> Self {
        ClusterVersion(stage.ordinal())
    }

    pub fn is_active(&self, stage: MigrationStage) -> bool {
        self.0 >= stage.ordinal()
    }

    fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.0])
    }

    fn decode(b: &[u8]) -> Option<Self> {
        match b {
            [v] if *v <= Self::LATEST.0 => Some(ClusterVersion(*v)),
            _ => None,
        }
    }
}

impl fmt::Display for ClusterVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// An immutable snapshot of the cluster version, taken once per transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VersionGuard {
    version: ClusterVersion,
}

impl VersionGuard {
    pub fn new(version: ClusterVersion) -> Self {
        VersionGuard { version }
    }

    pub fn version(&self) -> ClusterVersion {
        self.version
    }

    pub fn is_active(&self, stage: MigrationStage) -> bool {
        self.version.is_active(stage)
    }
}

/// Tracks the active cluster version.
///
/// Clones share the same version.
#[derive(Debug, Clone)]
pub struct SettingsWatcher {
    active: Arc<AtomicU8>,
}

impl SettingsWatcher {
    pub fn new(version: ClusterVersion) -> Self {
        SettingsWatcher {
            active: Arc::new(AtomicU8::new(version.0)),
        }
    }

    /// The last version this process observed.
    pub fn active_version(&self) -> ClusterVersion {
        ClusterVersion(self.active.load(Ordering::SeqCst))
    }

    /// Advances the in-memory version. Versions never move backwards.
    pub fn set_active_version(&self, version: ClusterVersion) {
        self.active.fetch_max(version.0, Ordering::SeqCst);
    }

    /// Adds a write of the in-memory version to `batch`.
    pub fn persist_active_version(&self, batch: &mut Batch) {
        batch.put(Bytes::from_static(VERSION_KEY), self.active_version().encode());
    }

    /// Returns a guard for the version `txn` executes at.
    ///
    /// If the in-memory version already activates `max_gate`, no later version
    /// could change the caller's behavior and it is used as is. Otherwise the
    /// persisted version is read inside `txn`, so the guard agrees with the
    /// transaction's other reads.
    pub async fn make_version_guard<T: Txn>(
        &self,
        txn: &mut T,
        max_gate: MigrationStage,
    ) -> Result<VersionGuard, KvError> {
        let active = self.active_version();
        if active.is_active(max_gate) {
            return Ok(VersionGuard::new(active));
        }
        let Some(kv) = txn.get(Bytes::from_static(VERSION_KEY)).await? else {
            return Ok(VersionGuard::new(active));
        };
        match ClusterVersion::decode(&kv.value) {
            Some(persisted) => {
                self.set_active_version(persisted);
                Ok(VersionGuard::new(persisted))
            }
            None => {
                warn!(value = ?kv.value, "ignoring undecodable persisted cluster version");
                Ok(VersionGuard::new(active))
            }
        }
    }
}
