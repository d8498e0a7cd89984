// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

use std::collections::BTreeSet;

use mz_txn_kv::{KvError, MemDb};
use tracing_subscriber::EnvFilter;

use super::*;
use crate::testing::{new_session, region, storage, FakeLiveness};
use crate::version::ClusterVersion;
use crate::{all_dyncfgs, InstanceId};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn storage_on(db: &MemDb, version: ClusterVersion, liveness: &FakeLiveness) -> Storage<MemDb> {
    let configs = all_dyncfgs(ConfigSet::default());
    PREALLOCATED_COUNT.set(&configs, 2).unwrap();
    Storage::new(
        db.clone(),
        &InstancesTable::SYSTEM,
        Arc::new(liveness.clone()),
        configs,
        SettingsWatcher::new(version),
    )
}

fn layout_rows(db: &MemDb, layout: RowLayout) -> Vec<InstanceRow> {
    let codec = RowCodec::new(&InstancesTable::SYSTEM, layout);
    db.snapshot(&Span::prefix(codec.make_index_prefix()))
        .iter()
        .map(|kv| codec.decode_row(kv).unwrap())
        .collect()
}

fn ids(rows: &[InstanceRow]) -> Vec<u32> {
    rows.iter().map(|row| row.instance_id.0).collect()
}

async fn claim(storage: &Storage<MemDb>, session: &SessionId) -> Result<InstanceInfo, InstanceError> {
    storage
        .create_instance(
            &CancellationToken::new(),
            session,
            Timestamp::MAX,
            "rpc:26257",
            "sql:26257",
            &"region=east".parse().unwrap(),
        )
        .await
}

#[tokio::test]
async fn generate_fills_every_region() {
    init_logging();
    let (storage, _, _) = storage(ClusterVersion::LATEST, 3);
    let regions = [region("east"), region("west")];
    storage
        .generate_available_instance_rows(&regions, Timestamp::MAX)
        .await
        .unwrap();

    let rows = storage.get_instance_rows(None).await.unwrap();
    assert_eq!(rows.len(), 6);
    assert!(rows.iter().all(|row| row.is_available()));
    let unique: BTreeSet<_> = rows.iter().map(|row| row.instance_id).collect();
    assert_eq!(unique.len(), 6);
    for r in &regions {
        let rows = storage.get_instance_rows(Some(r)).await.unwrap();
        assert_eq!(rows.len(), 3, "{r}");
        assert!(rows.iter().all(|row| &row.region == r));
    }

    // Generating again changes nothing.
    storage
        .generate_available_instance_rows(&regions, Timestamp::MAX)
        .await
        .unwrap();
    assert_eq!(storage.get_instance_rows(None).await.unwrap(), rows);
}

#[tokio::test]
async fn claim_on_empty_region_generates_once() {
    init_logging();
    let (storage, _, _) = storage(ClusterVersion::LATEST, 2);
    let east = region("east");
    let session = new_session(&east);

    let info = claim(&storage, &session).await.unwrap();
    assert_eq!(info.instance_id, InstanceId(1));
    assert_eq!(info.region, east);
    assert_eq!(info.session_id, session);
    assert_eq!(info.locality.find("region"), Some("east"));

    let rows = storage.get_instance_rows(Some(&east)).await.unwrap();
    assert_eq!(ids(&rows), vec![1, 2]);
    assert!(!rows[0].is_available());
    assert_eq!(rows[0].sql_addr, "sql:26257");
    assert!(rows[1].is_available());
}

#[tokio::test]
async fn sequential_claims_are_unique() {
    let (storage, _, _) = storage(ClusterVersion::LATEST, 2);
    let east = region("east");
    let mut seen = BTreeSet::new();
    for _ in 0..7 {
        let info = claim(&storage, &new_session(&east)).await.unwrap();
        assert!(seen.insert(info.instance_id), "{:?} handed out twice", info.instance_id);
    }
    assert_eq!(seen, (1..=7).map(InstanceId).collect());
    assert_eq!(storage.get_all_instances().await.unwrap().len(), 7);
}

#[tokio::test]
async fn invalid_arguments_write_nothing() {
    let (storage, db, _) = storage(ClusterVersion::LATEST, 2);
    let session = new_session(&Region::DEFAULT);
    let cancel = CancellationToken::new();
    let locality = Locality::default();

    for (session, rpc, sql) in [
        (&session, "rpc", ""),
        (&session, "", "sql"),
        (&SessionId::EMPTY, "rpc", "sql"),
    ] {
        let err = storage
            .create_instance(&cancel, session, Timestamp::MAX, rpc, sql, &locality)
            .await
            .unwrap_err();
        assert!(matches!(err, InstanceError::InvalidArgument(_)), "{err}");
    }

    let garbage = SessionId::from(bytes::Bytes::from_static(b"garbage"));
    let err = storage
        .create_instance(&cancel, &garbage, Timestamp::MAX, "rpc", "sql", &locality)
        .await
        .unwrap_err();
    assert!(matches!(err, InstanceError::RegionDecode(_)), "{err}");

    assert!(db.snapshot(&Span::prefix(bytes::Bytes::new())).is_empty());
}

#[tokio::test]
async fn claim_reuses_rows_of_dead_sessions() {
    let (storage, _, liveness) = storage(ClusterVersion::LATEST, 1);
    let east = region("east");
    let a = new_session(&east);
    let b = new_session(&east);
    let c = new_session(&east);

    assert_eq!(claim(&storage, &a).await.unwrap().instance_id, InstanceId(1));
    assert_eq!(claim(&storage, &b).await.unwrap().instance_id, InstanceId(2));

    liveness.kill(&a);
    assert_eq!(claim(&storage, &c).await.unwrap().instance_id, InstanceId(1));
    let info = storage.get_instance(InstanceId(1)).await.unwrap();
    assert_eq!(info.session_id, c);
}

#[tokio::test]
async fn liveness_errors_keep_rows_in_use() {
    init_logging();
    let (storage, _, liveness) = storage(ClusterVersion::LATEST, 1);
    let a = new_session(&Region::DEFAULT);
    assert_eq!(claim(&storage, &a).await.unwrap().instance_id, InstanceId(1));

    liveness.kill(&a);
    liveness.set_failing(&a, true);
    let b = new_session(&Region::DEFAULT);
    assert_eq!(claim(&storage, &b).await.unwrap().instance_id, InstanceId(2));

    // Reclamation needs every answer.
    let err = storage.reclaim_region(&Region::DEFAULT).await.unwrap_err();
    assert!(matches!(err, InstanceError::Liveness(_)), "{err}");
}

#[tokio::test]
async fn reclaim_dead_rows_down_to_target() {
    init_logging();
    let (storage, _, liveness) = storage(ClusterVersion::LATEST, 5);
    let east = region("east");
    let sessions: Vec<_> = (0..5).map(|_| new_session(&east)).collect();
    for session in &sessions {
        claim(&storage, session).await.unwrap();
    }
    let rows = storage.get_instance_rows(Some(&east)).await.unwrap();
    assert_eq!(rows.len(), 5);
    assert!(rows.iter().all(|row| !row.is_available()));

    for session in &sessions {
        liveness.kill(session);
    }
    PREALLOCATED_COUNT.set(storage.configs(), 3).unwrap();
    storage.reclaim_region(&east).await.unwrap();

    let rows = storage.get_instance_rows(Some(&east)).await.unwrap();
    assert_eq!(ids(&rows), vec![1, 2, 3]);
    assert!(rows.iter().all(|row| row.is_available()));
    assert!(storage.get_all_instances().await.unwrap().is_empty());
}

#[tokio::test]
async fn reclaim_leaves_live_sessions_alone() {
    let (storage, _, liveness) = storage(ClusterVersion::LATEST, 2);
    let east = region("east");
    let live = new_session(&east);
    let dead = new_session(&east);
    claim(&storage, &live).await.unwrap();
    claim(&storage, &dead).await.unwrap();
    liveness.kill(&dead);

    storage.reclaim_region(&east).await.unwrap();
    let instances = storage.get_all_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].session_id, live);
    assert_eq!(instances[0].instance_id, InstanceId(1));
}

#[tokio::test]
async fn release_requires_ownership() {
    let (storage, _, _) = storage(ClusterVersion::LATEST, 1);
    let owner = new_session(&Region::DEFAULT);
    let other = new_session(&Region::DEFAULT);
    let id = claim(&storage, &owner).await.unwrap().instance_id;

    storage.release_instance(&other, id).await.unwrap();
    assert_eq!(storage.get_instance(id).await.unwrap().session_id, owner);

    storage.release_instance(&owner, id).await.unwrap();
    assert!(matches!(
        storage.get_instance(id).await,
        Err(InstanceError::NotFound(got)) if got == id
    ));
    let rows = storage.get_instance_rows(None).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].is_available());

    // The released id is claimed again before a new one is generated.
    assert_eq!(claim(&storage, &other).await.unwrap().instance_id, id);
}

#[tokio::test]
async fn node_instance_uses_node_id() {
    let (storage, _, _) = storage(ClusterVersion::LATEST, 2);
    let session = new_session(&Region::DEFAULT);
    let info = storage
        .create_node_instance(
            &CancellationToken::new(),
            &session,
            Timestamp::MAX,
            "rpc",
            "sql",
            &Locality::default(),
            NodeId(7),
        )
        .await
        .unwrap();
    assert_eq!(info.instance_id, InstanceId(7));
    assert_eq!(ids(&storage.get_instance_rows(None).await.unwrap()), vec![7]);
}

#[tokio::test]
async fn node_id_zero_is_rejected() {
    let (storage, db, _) = storage(ClusterVersion::LATEST, 2);
    let session = new_session(&Region::DEFAULT);
    let err = storage
        .create_node_instance(
            &CancellationToken::new(),
            &session,
            Timestamp::MAX,
            "rpc",
            "sql",
            &Locality::default(),
            NodeId(0),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InstanceError::InvalidArgument(_)), "{err}");
    assert!(db.snapshot(&Span::prefix(bytes::Bytes::new())).is_empty());

    // The table is still usable.
    assert_eq!(claim(&storage, &session).await.unwrap().instance_id, InstanceId(1));
}

#[tokio::test]
async fn cancelled_claims_return_cancelled() {
    let (storage, _, _) = storage(ClusterVersion::LATEST, 2);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = storage
        .create_instance(
            &cancel,
            &new_session(&Region::DEFAULT),
            Timestamp::MAX,
            "rpc",
            "sql",
            &Locality::default(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, InstanceError::Cancelled), "{err}");
}

#[tokio::test]
async fn expired_session_cannot_claim() {
    let (storage, _, _) = storage(ClusterVersion::LATEST, 2);
    storage
        .generate_available_instance_rows(&[Region::DEFAULT], Timestamp::MAX)
        .await
        .unwrap();
    let err = storage
        .create_instance(
            &CancellationToken::new(),
            &new_session(&Region::DEFAULT),
            Timestamp::new(1),
            "rpc",
            "sql",
            &Locality::default(),
        )
        .await
        .unwrap_err();
    assert!(
        matches!(err, InstanceError::Kv(KvError::DeadlineExceeded { .. })),
        "{err}"
    );
    assert!(storage.get_all_instances().await.unwrap().is_empty());
}

fn region_rows(db: &MemDb, layout: RowLayout, region: &Region) -> Vec<InstanceRow> {
    let codec = RowCodec::new(&InstancesTable::SYSTEM, layout);
    db.snapshot(&Span::prefix(codec.make_region_prefix(region)))
        .iter()
        .map(|kv| codec.decode_row(kv).unwrap())
        .filter(|row| row.region == *region)
        .collect()
}

#[tokio::test]
async fn dual_write_writes_both_layouts() {
    let (storage, db, _) = storage(ClusterVersion::at(MigrationStage::RbrDualWrite), 2);
    let east = region("east");
    let session = new_session(&east);
    let info = claim(&storage, &session).await.unwrap();
    assert_eq!(info.region, east);

    let old = layout_rows(&db, RowLayout::Old);
    let new = layout_rows(&db, RowLayout::New);
    assert_eq!(ids(&old), vec![1, 2]);
    // Both layouts are written by the same commits.
    assert_eq!(old, new);
    assert_eq!(old[0].session_id, session);

    let new_east = region_rows(&db, RowLayout::New, &east);
    assert_eq!(ids(&new_east), vec![1, 2]);
    assert_eq!(new_east[0].session_id, session);
    assert!(region_rows(&db, RowLayout::New, &Region::DEFAULT).is_empty());
}

#[tokio::test]
async fn dual_write_keeps_regions_through_reclaim() {
    init_logging();
    let db = MemDb::default();
    let liveness = FakeLiveness::default();
    let east = region("east");
    let west = region("west");
    let dual = storage_on(&db, ClusterVersion::at(MigrationStage::RbrDualWrite), &liveness);

    dual.generate_available_instance_rows(&[east.clone(), west.clone()], Timestamp::MAX)
        .await
        .unwrap();
    let dead = new_session(&west);
    let live = new_session(&west);
    assert_eq!(claim(&dual, &dead).await.unwrap().region, west);
    assert_eq!(claim(&dual, &live).await.unwrap().region, west);
    liveness.kill(&dead);
    dual.reclaim_region(&west).await.unwrap();
    dual.release_instance(&live, InstanceId(4)).await.unwrap();

    for layout in [RowLayout::Old, RowLayout::New] {
        assert_eq!(ids(&region_rows(&db, layout, &east)), vec![1, 2], "{layout}");
        let west_rows = region_rows(&db, layout, &west);
        assert_eq!(ids(&west_rows), vec![3, 4], "{layout}");
        assert!(west_rows.iter().all(|row| row.is_available()), "{layout}");
    }

    // Once reads switch over, the regions are intact.
    let read_new = storage_on(&db, ClusterVersion::at(MigrationStage::RbrReadNew), &liveness);
    let rows = read_new.get_instance_rows(Some(&west)).await.unwrap();
    assert_eq!(ids(&rows), vec![3, 4]);
    let info = claim(&read_new, &new_session(&east)).await.unwrap();
    assert_eq!((info.region, info.instance_id), (east, InstanceId(1)));
}

#[tokio::test]
async fn read_new_reads_new_layout() {
    let db = MemDb::default();
    let liveness = FakeLiveness::default();
    let east = region("east");

    let single = storage_on(&db, ClusterVersion::at(MigrationStage::RbrSingleWrite), &liveness);
    single
        .generate_available_instance_rows(&[east.clone()], Timestamp::MAX)
        .await
        .unwrap();
    assert!(layout_rows(&db, RowLayout::Old).is_empty());

    let base = storage_on(&db, ClusterVersion::BASE, &liveness);
    assert!(base.get_instance_rows(None).await.unwrap().is_empty());

    let read_new = storage_on(&db, ClusterVersion::at(MigrationStage::RbrReadNew), &liveness);
    assert_eq!(read_new.get_instance_rows(Some(&east)).await.unwrap().len(), 2);

    let info = claim(&read_new, &new_session(&east)).await.unwrap();
    assert_eq!(info.region, east);
    assert_eq!(info.instance_id, InstanceId(1));
    // The claim is mirrored into the old layout.
    let old = layout_rows(&db, RowLayout::Old);
    assert_eq!(ids(&old), vec![1]);
    assert_eq!(old[0].session_id, info.session_id);
}

#[tokio::test]
async fn old_layout_scopes_rows_by_region() {
    let (storage, _, _) = storage(ClusterVersion::BASE, 2);
    let east = region("east");
    let west = region("west");
    storage
        .generate_available_instance_rows(&[east.clone(), west.clone(), east.clone()], Timestamp::MAX)
        .await
        .unwrap();
    assert_eq!(ids(&storage.get_instance_rows(None).await.unwrap()), vec![1, 2, 3, 4]);
    assert_eq!(ids(&storage.get_instance_rows(Some(&west)).await.unwrap()), vec![3, 4]);

    let info = claim(&storage, &new_session(&west)).await.unwrap();
    assert_eq!((info.region, info.instance_id), (west, InstanceId(3)));
}

#[tokio::test]
async fn version_is_read_until_cleanup() {
    let db = MemDb::default();
    let liveness = FakeLiveness::default();
    let storage = storage_on(&db, ClusterVersion::at(MigrationStage::RbrSingleWrite), &liveness);

    let mut batch = Batch::default();
    SettingsWatcher::new(ClusterVersion::LATEST).persist_active_version(&mut batch);
    db.begin().commit_in_batch(batch).await.unwrap();

    storage.get_instance_rows(None).await.unwrap();
    assert_eq!(storage.settings_watch().active_version(), ClusterVersion::LATEST);
}

#[tokio::test]
async fn codec_selection_by_stage() {
    let (storage, _, _) = storage(ClusterVersion::BASE, 1);
    let layouts = |version| {
        let guard = VersionGuard::new(version);
        (
            storage.read_codec(&guard).layout(),
            storage.dual_write_codec(&guard).map(|codec| codec.layout()),
        )
    };
    assert_eq!(layouts(ClusterVersion::BASE), (RowLayout::Old, None));
    assert_eq!(
        layouts(ClusterVersion::at(MigrationStage::RbrDualWrite)),
        (RowLayout::Old, Some(RowLayout::New))
    );
    assert_eq!(
        layouts(ClusterVersion::at(MigrationStage::RbrReadNew)),
        (RowLayout::New, Some(RowLayout::Old))
    );
    assert_eq!(
        layouts(ClusterVersion::at(MigrationStage::RbrSingleWrite)),
        (RowLayout::New, None)
    );
    assert_eq!(layouts(ClusterVersion::LATEST), (RowLayout::New, None));
}
