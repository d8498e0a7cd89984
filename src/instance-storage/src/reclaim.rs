// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The background loop that keeps each region's pool of instance ids healthy.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mz_txn_kv::{Db, Timestamp};
use rand::Rng;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::InstanceError;
use crate::sqlliveness::Region;
use crate::storage::Storage;
use crate::RECLAIM_LOOP_INTERVAL;

/// Provides the regions of the cluster.
#[async_trait]
pub trait RegionSource: Send + Sync {
    async fn regions(&self) -> Result<Vec<Region>, anyhow::Error>;
}

/// A fixed list of regions.
#[derive(Debug, Clone, Default)]
pub struct StaticRegions(pub Vec<Region>);

#[async_trait]
impl RegionSource for StaticRegions {
    async fn regions(&self) -> Result<Vec<Region>, anyhow::Error> {
        Ok(self.0.clone())
    }
}

/// Scales `interval` by a random factor in `[0.85, 1.15)`, so that the loops
/// of different processes drift apart.
pub fn jittered_interval(interval: Duration) -> Duration {
    let factor = 0.85 + 0.3 * rand::thread_rng().gen::<f64>();
    Duration::try_from_secs_f64(interval.as_secs_f64() * factor).unwrap_or(interval)
}

impl<D: Db> Storage<D> {
    /// Spawns a task that periodically reclaims the ids of dead sessions,
    /// deletes surplus available rows, and generates missing ones, in every
    /// region reported by `regions`.
    ///
    /// Failures are logged and retried on the next tick. The task exits once
    /// `shutdown` is cancelled.
    pub fn run_instance_id_reclaim_loop<F>(
        self: &Arc<Self>,
        shutdown: CancellationToken,
        regions: Arc<dyn RegionSource>,
        session_expiration_fn: F,
    ) -> JoinHandle<()>
    where
        F: Fn() -> Timestamp + Send + Sync + 'static,
    {
        let storage = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let interval = (storage.jitter)(RECLAIM_LOOP_INTERVAL.get(&storage.configs));
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = tokio::time::sleep(interval) => {}
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    () = storage.reclaim_tick(&*regions, &session_expiration_fn) => {}
                }
            }
            debug!("instance id reclaim loop shut down");
        })
    }

    async fn reclaim_tick(
        &self,
        regions: &dyn RegionSource,
        session_expiration_fn: &(dyn Fn() -> Timestamp + Send + Sync),
    ) {
        let mut regions = match regions.regions().await {
            Ok(regions) => regions,
            Err(err) => {
                warn!("failed to get regions: {}", InstanceError::Regions(err));
                return;
            }
        };
        if regions.is_empty() {
            regions.push(Region::DEFAULT);
        }
        debug!(?regions, "reclaiming instance ids");

        for region in &regions {
            if let Err(err) = self.reclaim_region(region).await {
                warn!(%region, "failed to reclaim instance ids: {err}");
            }
        }

        if let Err(err) = self
            .generate_available_instance_rows(&regions, session_expiration_fn())
            .await
        {
            warn!("failed to generate available instance rows: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jitter_bounds() {
        let interval = Duration::from_secs(100);
        for _ in 0..1000 {
            let jittered = jittered_interval(interval);
            assert!(jittered >= Duration::from_millis(84_999), "{jittered:?}");
            assert!(jittered <= Duration::from_millis(115_001), "{jittered:?}");
        }
    }
}
