// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Test helpers.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use mz_dyncfg::ConfigSet;
use mz_txn_kv::MemDb;
use uuid::Uuid;

use crate::codec::InstancesTable;
use crate::sqlliveness::{LivenessReader, Region, SessionId};
use crate::storage::Storage;
use crate::version::{ClusterVersion, SettingsWatcher};
use crate::{all_dyncfgs, PREALLOCATED_COUNT};

#[derive(Debug, Default)]
struct FakeLivenessState {
    dead: BTreeSet<SessionId>,
    failing: BTreeSet<SessionId>,
}

/// A [`LivenessReader`] that reports every session alive until it is killed.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeLiveness {
    state: Arc<Mutex<FakeLivenessState>>,
}

impl FakeLiveness {
    /// Marks `session` dead. Sessions never come back to life.
    pub fn kill(&self, session: &SessionId) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.dead.insert(session.clone());
    }

    /// Makes liveness checks of `session` fail, or succeed again.
    pub fn set_failing(&self, session: &SessionId, failing: bool) {
        let mut state = self.state.lock().expect("lock poisoned");
        if failing {
            state.failing.insert(session.clone());
        } else {
            state.failing.remove(session);
        }
    }
}

#[async_trait]
impl LivenessReader for FakeLiveness {
    async fn is_alive(&self, session: &SessionId) -> Result<bool, anyhow::Error> {
        let state = self.state.lock().expect("lock poisoned");
        if state.failing.contains(session) {
            anyhow::bail!("liveness of session {session} is unavailable");
        }
        Ok(!state.dead.contains(session))
    }
}

/// A fresh session id in `region`.
pub fn new_session(region: &Region) -> SessionId {
    SessionId::make(region, Uuid::new_v4()).expect("valid region")
}

/// Shorthand for a region from a string.
pub fn region(name: &'static str) -> Region {
    Region::new(Bytes::from_static(name.as_bytes()))
}

/// A [`Storage`] over an empty [`MemDb`] at `version`, keeping
/// `preallocated` available rows per region.
pub fn storage(
    version: ClusterVersion,
    preallocated: i64,
) -> (Storage<MemDb>, MemDb, FakeLiveness) {
    let db = MemDb::default();
    let liveness = FakeLiveness::default();
    let configs = all_dyncfgs(ConfigSet::default());
    PREALLOCATED_COUNT
        .set(&configs, preallocated)
        .expect("valid preallocated count");
    let storage = Storage::new(
        db.clone(),
        &InstancesTable::SYSTEM,
        Arc::new(liveness.clone()),
        configs,
        SettingsWatcher::new(version),
    );
    (storage, db, liveness)
}
