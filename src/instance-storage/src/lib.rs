// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Allocation of SQL instance ids.
//!
//! Every SQL server process claims a small integer id, unique across the
//! cluster, for as long as its liveness session is alive. Ids live as rows in
//! the instances table of a transactional key-value store. Each region keeps
//! a pool of available (preallocated) rows so that starting a process only
//! needs to claim one of them in a single transaction. A background loop
//! ([`Storage::run_instance_id_reclaim_loop`]) returns the rows of dead
//! sessions to the pool, trims surplus rows and tops the pool back up.
//!
//! While the table migrates to its regional-by-row layout, every mutation is
//! written under both layouts. Which layout is read is decided per
//! transaction by the active cluster version; see [`version`].

use std::fmt;
use std::time::Duration;

use mz_dyncfg::{Config, ConfigSet};

pub mod alloc;
pub mod codec;
pub mod error;
pub mod locality;
pub mod reclaim;
pub mod retry;
pub mod sqlliveness;
pub mod storage;
pub mod testing;
pub mod version;

pub use crate::codec::{InstanceRow, InstancesTable, RowCodec, RowLayout};
pub use crate::error::InstanceError;
pub use crate::locality::{Locality, Tier};
pub use crate::reclaim::{jittered_interval, RegionSource, StaticRegions};
pub use crate::sqlliveness::{LivenessReader, Region, SessionId};
pub use crate::storage::Storage;

/// The id of a SQL instance. Valid ids are positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InstanceId(pub u32);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id of a KV node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// A claimed instance id and what the claiming process advertised with it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceInfo {
    pub region: Region,
    pub instance_id: InstanceId,
    pub rpc_addr: String,
    pub sql_addr: String,
    pub session_id: SessionId,
    pub locality: Locality,
}

impl From<InstanceRow> for InstanceInfo {
    fn from(row: InstanceRow) -> Self {
        let InstanceRow {
            region,
            instance_id,
            sql_addr,
            rpc_addr,
            session_id,
            locality,
            timestamp: _,
        } = row;
        InstanceInfo {
            region,
            instance_id,
            rpc_addr,
            sql_addr,
            session_id,
            locality,
        }
    }
}

/// How often the reclaim loop runs, before jitter.
pub const RECLAIM_LOOP_INTERVAL: Config<Duration> = Config::new_validated(
    "server.instance_id.reclaim_interval",
    Duration::from_secs(10 * 60),
    "How often to reclaim the ids of dead SQL instances and top up the \
     preallocated ids of each region.",
    |interval| {
        if interval.is_zero() {
            return Err("must be positive".into());
        }
        Ok(())
    },
);

/// The number of available instance rows kept per region.
pub const PREALLOCATED_COUNT: Config<i64> = Config::new_validated(
    "server.instance_id.preallocated_count",
    10,
    "The number of preallocated instance ids kept available in each region.",
    |count| {
        if !(1..=i64::from(i32::MAX)).contains(count) {
            return Err(format!("must be within [1, {}], got {count}", i32::MAX));
        }
        Ok(())
    },
);

/// Adds the full set of all instance storage `Config`s.
pub fn all_dyncfgs(configs: ConfigSet) -> ConfigSet {
    configs.add(&RECLAIM_LOOP_INTERVAL).add(&PREALLOCATED_COUNT)
}
