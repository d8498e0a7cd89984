// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Transactional access to the instances table.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use mz_dyncfg::ConfigSet;
use mz_txn_kv::{Batch, Db, Priority, Span, Timestamp, Txn, WaitPolicy};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::alloc::{ids_to_allocate, ids_to_reclaim};
use crate::codec::{InstanceRow, InstancesTable, RowCodec, RowLayout};
use crate::error::InstanceError;
use crate::locality::Locality;
use crate::reclaim::jittered_interval;
use crate::retry::{Retry, RetryResult};
use crate::sqlliveness::{LivenessReader, Region, SessionId};
use crate::version::{MigrationStage, SettingsWatcher, VersionGuard};
use crate::{InstanceId, InstanceInfo, NodeId, PREALLOCATED_COUNT};

#[cfg(test)]
mod tests;

/// Scales the reclaim loop interval before each wait.
pub type JitterFn = Arc<dyn Fn(Duration) -> Duration + Send + Sync>;

/// The storage of SQL instance ids.
pub struct Storage<D: Db> {
    db: D,
    liveness: Arc<dyn LivenessReader>,
    old_codec: RowCodec,
    new_codec: RowCodec,
    pub(crate) configs: ConfigSet,
    settings_watch: SettingsWatcher,
    retry: Retry,
    pub(crate) jitter: JitterFn,
}

impl<D: Db> fmt::Debug for Storage<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("db", &self.db)
            .field("liveness", &self.liveness)
            .field("configs", &self.configs)
            .field("version", &self.settings_watch.active_version())
            .finish_non_exhaustive()
    }
}

impl<D: Db> Storage<D> {
    pub fn new(
        db: D,
        table: &InstancesTable,
        liveness: Arc<dyn LivenessReader>,
        configs: ConfigSet,
        settings_watch: SettingsWatcher,
    ) -> Self {
        Storage {
            db,
            liveness,
            old_codec: RowCodec::new(table, RowLayout::Old),
            new_codec: RowCodec::new(table, RowLayout::New),
            configs,
            settings_watch,
            retry: Retry::instance_defaults(SystemTime::now()),
            jitter: Arc::new(jittered_interval),
        }
    }

    /// Replaces the function that jitters the reclaim loop interval.
    pub fn with_jitter(mut self, jitter: impl Fn(Duration) -> Duration + Send + Sync + 'static) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Replaces the backoff used while claiming an instance id.
    pub fn with_retry(mut self, retry: Retry) -> Self {
        self.retry = retry;
        self
    }

    pub fn configs(&self) -> &ConfigSet {
        &self.configs
    }

    pub fn settings_watch(&self) -> &SettingsWatcher {
        &self.settings_watch
    }

    /// The codec whose layout is authoritative for reads.
    pub fn read_codec(&self, guard: &VersionGuard) -> &RowCodec {
        if guard.is_active(MigrationStage::RbrReadNew) {
            &self.new_codec
        } else {
            &self.old_codec
        }
    }

    /// The codec every write must additionally be applied with, if any.
    pub fn dual_write_codec(&self, guard: &VersionGuard) -> Option<&RowCodec> {
        if guard.is_active(MigrationStage::RbrSingleWrite) {
            None
        } else if guard.is_active(MigrationStage::RbrReadNew) {
            Some(&self.old_codec)
        } else if guard.is_active(MigrationStage::RbrDualWrite) {
            Some(&self.new_codec)
        } else {
            None
        }
    }

    fn write_codecs<'a>(&'a self, guard: &VersionGuard) -> impl Iterator<Item = &'a RowCodec> {
        std::iter::once(self.read_codec(guard)).chain(self.dual_write_codec(guard))
    }

    async fn begin(&self) -> Result<(D::Txn, VersionGuard), InstanceError> {
        let mut txn = self.db.begin();
        let guard = self
            .settings_watch
            .make_version_guard(&mut txn, MigrationStage::RbrCleanup)
            .await?;
        Ok((txn, guard))
    }

    fn preallocated_count(&self) -> usize {
        usize::try_from(PREALLOCATED_COUNT.get(&self.configs))
            .expect("preallocated count validated to be positive")
    }

    /// Claims an instance id for `session_id`.
    ///
    /// Prefers an available row of the session's region, then a row owned by
    /// a dead session. If there is neither, rows are generated for the region
    /// and the claim is retried. Retries continue until the claim succeeds,
    /// fails with a non retryable error, or `cancel` fires.
    pub async fn create_instance(
        &self,
        cancel: &CancellationToken,
        session_id: &SessionId,
        session_expiration: Timestamp,
        rpc_addr: &str,
        sql_addr: &str,
        locality: &Locality,
    ) -> Result<InstanceInfo, InstanceError> {
        self.create_instance_inner(
            cancel,
            session_id,
            session_expiration,
            rpc_addr,
            sql_addr,
            locality,
            None,
        )
        .await
    }

    /// Like [`Self::create_instance`], but claims the id equal to `node_id`.
    ///
    /// The table is not consulted for the id, which is only sound when every
    /// SQL instance runs alongside exactly one KV node. Node ids start at 1.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_node_instance(
        &self,
        cancel: &CancellationToken,
        session_id: &SessionId,
        session_expiration: Timestamp,
        rpc_addr: &str,
        sql_addr: &str,
        locality: &Locality,
        node_id: NodeId,
    ) -> Result<InstanceInfo, InstanceError> {
        self.create_instance_inner(
            cancel,
            session_id,
            session_expiration,
            rpc_addr,
            sql_addr,
            locality,
            Some(node_id),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn create_instance_inner(
        &self,
        cancel: &CancellationToken,
        session_id: &SessionId,
        session_expiration: Timestamp,
        rpc_addr: &str,
        sql_addr: &str,
        locality: &Locality,
        node_id: Option<NodeId>,
    ) -> Result<InstanceInfo, InstanceError> {
        if sql_addr.is_empty() {
            return Err(InstanceError::InvalidArgument("no SQL address to map"));
        }
        if rpc_addr.is_empty() {
            return Err(InstanceError::InvalidArgument("no RPC address to map"));
        }
        if session_id.is_empty() {
            return Err(InstanceError::InvalidArgument("no session to map"));
        }
        if node_id == Some(NodeId(0)) {
            return Err(InstanceError::InvalidArgument("node id must be positive"));
        }
        let region = &session_id.decode_region()?;

        self.retry
            .clone()
            .retry_async_cancelable(cancel, move |attempt| async move {
                let res = self
                    .claim(
                        region,
                        session_id,
                        session_expiration,
                        rpc_addr,
                        sql_addr,
                        locality,
                        node_id,
                    )
                    .await;
                match res {
                    Ok(info) => RetryResult::Ok(info),
                    Err(InstanceError::NoPreallocatedRows) => {
                        // Generate rows for the local region only. Other
                        // regions are the reclaim loop's business.
                        let regions = std::slice::from_ref(region);
                        if let Err(err) = self
                            .generate_available_instance_rows(regions, session_expiration)
                            .await
                        {
                            warn!(%region, "failed to generate available instance rows: {err}");
                        }
                        RetryResult::RetryableErr(InstanceError::NoPreallocatedRows)
                    }
                    Err(err) if err.is_retryable() => {
                        debug!(attempt, "retrying instance id claim: {err}");
                        RetryResult::RetryableErr(err)
                    }
                    Err(err) => RetryResult::FatalErr(err),
                }
            })
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn claim(
        &self,
        region: &Region,
        session_id: &SessionId,
        session_expiration: Timestamp,
        rpc_addr: &str,
        sql_addr: &str,
        locality: &Locality,
        node_id: Option<NodeId>,
    ) -> Result<InstanceInfo, InstanceError> {
        let (mut txn, guard) = self.begin().await?;
        txn.set_priority(Priority::Max);
        txn.update_deadline(session_expiration);

        let read_codec = self.read_codec(&guard);
        let instance_id = match node_id {
            Some(node_id) => InstanceId(node_id.0),
            None => {
                self.get_available_instance_id_for_region(&mut txn, read_codec, region)
                    .await?
            }
        };

        let mut batch = Batch::default();
        for codec in self.write_codecs(&guard) {
            batch.put(
                codec.encode_key(region, instance_id),
                codec.encode_value(region, rpc_addr, sql_addr, session_id, locality),
            );
        }
        txn.commit_in_batch(batch).await?;

        info!(
            %instance_id,
            %region,
            %session_id,
            %rpc_addr,
            %sql_addr,
            %locality,
            "assigned SQL instance id"
        );
        Ok(InstanceInfo {
            region: region.clone(),
            instance_id,
            rpc_addr: rpc_addr.to_owned(),
            sql_addr: sql_addr.to_owned(),
            session_id: session_id.clone(),
            locality: locality.clone(),
        })
    }

    /// Picks an instance id of `region` to claim within `txn`.
    ///
    /// Rows locked by concurrent claims are skipped. The first available row
    /// wins; failing that, the first row whose session is dead.
    pub async fn get_available_instance_id_for_region(
        &self,
        txn: &mut D::Txn,
        codec: &RowCodec,
        region: &Region,
    ) -> Result<InstanceId, InstanceError> {
        let rows = scan_rows(txn, codec, Some(region), WaitPolicy::SkipLocked).await?;

        if let Some(row) = rows.iter().find(|row| row.is_available()) {
            return Ok(row.instance_id);
        }

        // Every row is claimed. Look for one whose session has expired.
        for row in &rows {
            match self.liveness.is_alive(&row.session_id).await {
                Ok(true) => {}
                Ok(false) => return Ok(row.instance_id),
                Err(err) => {
                    warn!(
                        instance_id = %row.instance_id,
                        session_id = %row.session_id,
                        "unable to check session liveness, treating instance as in use: {err:#}"
                    );
                }
            }
        }
        Err(InstanceError::NoPreallocatedRows)
    }

    /// Returns the ids of dead sessions in `region` to the pool, and deletes
    /// available rows in excess of the preallocated count.
    ///
    /// Liveness is checked between two transactions so that no transaction
    /// stays open across the round trips.
    pub async fn reclaim_region(&self, region: &Region) -> Result<(), InstanceError> {
        let target = self.preallocated_count();

        let rows = {
            let (mut txn, guard) = self.begin().await?;
            let codec = self.read_codec(&guard);
            scan_rows(&mut txn, codec, Some(region), WaitPolicy::Block).await?
        };

        let mut is_expired = BTreeMap::new();
        for row in &rows {
            if row.is_available() || is_expired.contains_key(&row.session_id) {
                continue;
            }
            let alive = self
                .liveness
                .is_alive(&row.session_id)
                .await
                .map_err(InstanceError::Liveness)?;
            is_expired.insert(row.session_id.clone(), !alive);
        }

        let (mut txn, guard) = self.begin().await?;
        let read_codec = self.read_codec(&guard);
        let rows = scan_rows(&mut txn, read_codec, Some(region), WaitPolicy::Block).await?;
        let (to_reclaim, to_delete) = ids_to_reclaim(target, &rows, &is_expired);
        if to_reclaim.is_empty() && to_delete.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::default();
        for codec in self.write_codecs(&guard) {
            for id in &to_reclaim {
                batch.put(codec.encode_key(region, *id), codec.encode_available_value(region));
            }
            for id in &to_delete {
                batch.del(codec.encode_key(region, *id));
            }
        }
        txn.commit_in_batch(batch).await?;

        debug!(
            %region,
            reclaimed = ?to_reclaim,
            deleted = ?to_delete,
            "reclaimed instance ids"
        );
        Ok(())
    }

    /// Tops up every region in `regions` to the preallocated count of
    /// available rows, in a single transaction.
    pub async fn generate_available_instance_rows(
        &self,
        regions: &[Region],
        session_expiration: Timestamp,
    ) -> Result<(), InstanceError> {
        let target = self.preallocated_count();

        let (mut txn, guard) = self.begin().await?;
        txn.update_deadline(session_expiration);
        let read_codec = self.read_codec(&guard);

        let mut unique: Vec<Region> = Vec::with_capacity(regions.len());
        for region in regions {
            if !unique.contains(region) {
                unique.push(region.clone());
            }
        }

        let rows = scan_rows(&mut txn, read_codec, None, WaitPolicy::Block).await?;
        let to_allocate = ids_to_allocate(target, &unique, &rows);
        if to_allocate.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::default();
        for codec in self.write_codecs(&guard) {
            for (region, id) in &to_allocate {
                batch.put(codec.encode_key(region, *id), codec.encode_available_value(region));
            }
        }
        txn.commit_in_batch(batch).await?;

        debug!(allocated = to_allocate.len(), "generated available instance rows");
        Ok(())
    }

    /// Returns the rows of `region`, or of every region if `None`.
    pub async fn get_instance_rows(
        &self,
        region: Option<&Region>,
    ) -> Result<Vec<InstanceRow>, InstanceError> {
        let (mut txn, guard) = self.begin().await?;
        let codec = self.read_codec(&guard);
        scan_rows(&mut txn, codec, region, WaitPolicy::Block).await
    }

    /// Returns the instance claimed under `instance_id`.
    pub async fn get_instance(&self, instance_id: InstanceId) -> Result<InstanceInfo, InstanceError> {
        self.get_instance_rows(None)
            .await?
            .into_iter()
            .find(|row| row.instance_id == instance_id && !row.is_available())
            .map(InstanceInfo::from)
            .ok_or(InstanceError::NotFound(instance_id))
    }

    /// Returns every claimed instance, ordered by id.
    pub async fn get_all_instances(&self) -> Result<Vec<InstanceInfo>, InstanceError> {
        let mut instances: Vec<_> = self
            .get_instance_rows(None)
            .await?
            .into_iter()
            .filter(|row| !row.is_available())
            .map(InstanceInfo::from)
            .collect();
        instances.sort_by_key(|instance| instance.instance_id);
        Ok(instances)
    }

    /// Returns `instance_id` to the pool, if it is still claimed by
    /// `session_id`.
    pub async fn release_instance(
        &self,
        session_id: &SessionId,
        instance_id: InstanceId,
    ) -> Result<(), InstanceError> {
        let (mut txn, guard) = self.begin().await?;
        let read_codec = self.read_codec(&guard);
        let rows = scan_rows(&mut txn, read_codec, None, WaitPolicy::Block).await?;
        let Some(row) = rows
            .into_iter()
            .find(|row| row.instance_id == instance_id && row.session_id == *session_id)
        else {
            debug!(%instance_id, %session_id, "instance not owned by session, not releasing");
            return Ok(());
        };

        let mut batch = Batch::default();
        for codec in self.write_codecs(&guard) {
            batch.put(
                codec.encode_key(&row.region, instance_id),
                codec.encode_available_value(&row.region),
            );
        }
        txn.commit_in_batch(batch).await?;
        info!(%instance_id, %session_id, "released SQL instance id");
        Ok(())
    }
}

/// Reads and decodes the rows of `region`, or of the whole index if `None`.
async fn scan_rows<T: Txn>(
    txn: &mut T,
    codec: &RowCodec,
    region: Option<&Region>,
    policy: WaitPolicy,
) -> Result<Vec<InstanceRow>, InstanceError> {
    let prefix = match region {
        Some(region) => codec.make_region_prefix(region),
        None => codec.make_index_prefix(),
    };
    let kvs = txn.scan(Span::prefix(prefix), policy).await?;
    let mut rows = Vec::with_capacity(kvs.len());
    for kv in &kvs {
        let row = codec.decode_row(kv)?;
        // The old layout's region prefix covers every region.
        if region.map_or(true, |region| row.region == *region) {
            rows.push(row);
        }
    }
    Ok(rows)
}
