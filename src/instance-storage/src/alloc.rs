// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Pure selection of the instance ids to reclaim, delete and allocate.

use std::collections::{BTreeMap, BTreeSet};

use crate::codec::InstanceRow;
use crate::sqlliveness::{Region, SessionId};
use crate::InstanceId;

/// Picks which rows of one region to reclaim and which to delete.
///
/// Rows are visited in order. Free rows (available, or owned by an expired
/// session) are kept until `target` of them have been seen; expired rows
/// among those are returned for reclamation, and every free row past the
/// target is returned for deletion. Sessions missing from `is_expired` are
/// assumed alive.
pub fn ids_to_reclaim(
    target: usize,
    rows: &[InstanceRow],
    is_expired: &BTreeMap<SessionId, bool>,
) -> (Vec<InstanceId>, Vec<InstanceId>) {
    let mut to_reclaim = Vec::new();
    let mut to_delete = Vec::new();
    let mut available = 0;
    for row in rows {
        let expired = is_expired.get(&row.session_id).copied().unwrap_or(false);
        if !row.is_available() && !expired {
            continue;
        }
        if available < target {
            available += 1;
            if !row.is_available() {
                to_reclaim.push(row.instance_id);
            }
        } else {
            to_delete.push(row.instance_id);
        }
    }
    (to_reclaim, to_delete)
}

/// Picks new instance ids so that every region in `regions` has `target`
/// available rows.
///
/// Ids are the smallest positive integers unused by `rows`, handed out in
/// ascending order across all regions.
pub fn ids_to_allocate(
    target: usize,
    regions: &[Region],
    rows: &[InstanceRow],
) -> Vec<(Region, InstanceId)> {
    let existing: BTreeSet<_> = rows.iter().map(|row| row.instance_id).collect();
    let mut available_per_region: BTreeMap<&Region, usize> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.is_available()) {
        *available_per_region.entry(&row.region).or_default() += 1;
    }

    let mut to_allocate = Vec::new();
    let mut last = 0u32;
    for region in regions {
        let available = available_per_region.get(region).copied().unwrap_or(0);
        for _ in available..target {
            let next = loop {
                // The id space is exhausted.
                let Some(next) = last.checked_add(1) else {
                    return to_allocate;
                };
                last = next;
                if !existing.contains(&InstanceId(next)) {
                    break next;
                }
            };
            to_allocate.push((region.clone(), InstanceId(next)));
        }
    }
    to_allocate
}
