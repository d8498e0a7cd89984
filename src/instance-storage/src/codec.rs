// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Encoding of instance rows as key-value pairs.
//!
//! The instances table has two physical layouts. The [`RowLayout::Old`]
//! primary index is keyed by instance id alone and keeps the region in the
//! value; rows written before regions existed have none and belong to
//! [`Region::DEFAULT`]. The [`RowLayout::New`] index is regional-by-row,
//! keyed by `(region, id)`.
//!
//! Keys are `[table id][index id]`, then for the new layout the region in
//! an order preserving escaped encoding, then the instance id; all integers are
//! big endian. Values are a layout tag byte followed by a protobuf message.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use mz_txn_kv::{KeyValue, Timestamp};
use prost::Message;

use crate::locality::{Locality, Tier};
use crate::sqlliveness::{Region, SessionId};
use crate::InstanceId;

const BYTES_MARKER: u8 = 0x12;
const ESCAPE: u8 = 0x00;
const ESCAPED_00: u8 = 0xff;
const ESCAPED_TERM: u8 = 0x01;

/// Identifies the instances table in the key space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstancesTable {
    pub table_id: u32,
}

impl InstancesTable {
    /// The system instances table.
    pub const SYSTEM: InstancesTable = InstancesTable { table_id: 46 };
}

/// A physical layout of the instances table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowLayout {
    /// Primary index keyed by instance id only.
    Old,
    /// Regional-by-row index keyed by region and instance id.
    New,
}

impl RowLayout {
    fn index_id(&self) -> u32 {
        match self {
            RowLayout::Old => 1,
            RowLayout::New => 2,
        }
    }

    fn value_tag(&self) -> u8 {
        match self {
            RowLayout::Old => 1,
            RowLayout::New => 2,
        }
    }
}

impl fmt::Display for RowLayout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowLayout::Old => f.write_str("old"),
            RowLayout::New => f.write_str("new"),
        }
    }
}

/// A stored row did not match the layout it was read with.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed {layout} instance row at key {key:?}: {detail}")]
pub struct MalformedRowError {
    pub layout: RowLayout,
    pub key: Bytes,
    pub detail: String,
}

/// One row of the instances table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceRow {
    pub region: Region,
    pub instance_id: InstanceId,
    pub sql_addr: String,
    pub rpc_addr: String,
    pub session_id: SessionId,
    pub locality: Locality,
    /// Commit timestamp of the row. Descriptive only.
    pub timestamp: Timestamp,
}

impl InstanceRow {
    /// Reports whether the row has not been claimed by a SQL instance.
    pub fn is_available(&self) -> bool {
        self.session_id.is_empty()
    }
}

#[derive(Clone, PartialEq, Message)]
struct ProtoInstanceValue {
    #[prost(string, optional, tag = "1")]
    sql_addr: Option<String>,
    #[prost(string, optional, tag = "2")]
    rpc_addr: Option<String>,
    #[prost(bytes = "bytes", optional, tag = "3")]
    session_id: Option<Bytes>,
    #[prost(message, repeated, tag = "4")]
    locality: Vec<ProtoTier>,
    /// Only set in the old layout, whose key has no region.
    #[prost(bytes = "bytes", optional, tag = "5")]
    region: Option<Bytes>,
}

#[derive(Clone, PartialEq, Message)]
struct ProtoTier {
    #[prost(string, tag = "1")]
    key: String,
    #[prost(string, tag = "2")]
    value: String,
}

/// Encodes and decodes instance rows under one [`RowLayout`].
///
/// Stateless beyond the key prefix; cheap to clone.
#[derive(Debug, Clone)]
pub struct RowCodec {
    layout: RowLayout,
    index_prefix: Bytes,
}

impl RowCodec {
    pub fn new(table: &InstancesTable, layout: RowLayout) -> Self {
        let mut prefix = BytesMut::with_capacity(8);
        prefix.put_u32(table.table_id);
        prefix.put_u32(layout.index_id());
        RowCodec {
            layout,
            index_prefix: prefix.freeze(),
        }
    }

    pub fn layout(&self) -> RowLayout {
        self.layout
    }

    /// The prefix of every row in the index, regardless of region.
    pub fn make_index_prefix(&self) -> Bytes {
        self.index_prefix.clone()
    }

    /// The prefix of every row stored for `region`.
    ///
    /// The old layout cannot scan by region, so this is the index prefix and
    /// callers filter on [`InstanceRow::region`].
    pub fn make_region_prefix(&self, region: &Region) -> Bytes {
        match self.layout {
            RowLayout::Old => self.make_index_prefix(),
            RowLayout::New => {
                let mut key = Vec::with_capacity(self.index_prefix.len() + region.as_bytes().len() + 3);
                key.extend_from_slice(&self.index_prefix);
                encode_bytes_ascending(&mut key, region.as_bytes());
                Bytes::from(key)
            }
        }
    }

    pub fn encode_key(&self, region: &Region, id: InstanceId) -> Bytes {
        let mut key = BytesMut::from(&self.make_region_prefix(region)[..]);
        key.put_u32(id.0);
        key.freeze()
    }

    /// Encodes the value of a row claimed by `session_id`.
    pub fn encode_value(
        &self,
        region: &Region,
        rpc_addr: &str,
        sql_addr: &str,
        session_id: &SessionId,
        locality: &Locality,
    ) -> Bytes {
        let proto = ProtoInstanceValue {
            sql_addr: Some(sql_addr.to_owned()),
            rpc_addr: Some(rpc_addr.to_owned()),
            session_id: Some(session_id.as_bytes().clone()),
            locality: locality
                .tiers
                .iter()
                .map(|tier| ProtoTier {
                    key: tier.key.clone(),
                    value: tier.value.clone(),
                })
                .collect(),
            region: None,
        };
        self.tagged(region, proto)
    }

    /// Encodes the value of a row of `region` that no instance owns.
    pub fn encode_available_value(&self, region: &Region) -> Bytes {
        self.tagged(region, ProtoInstanceValue::default())
    }

    fn tagged(&self, region: &Region, mut proto: ProtoInstanceValue) -> Bytes {
        if self.layout == RowLayout::Old {
            proto.region = Some(region.as_bytes().clone());
        }
        let mut buf = Vec::with_capacity(1 + proto.encoded_len());
        buf.push(self.layout.value_tag());
        proto
            .encode(&mut buf)
            .expect("Vec<u8> provides sufficient capacity");
        Bytes::from(buf)
    }

    pub fn decode_row(&self, kv: &KeyValue) -> Result<InstanceRow, MalformedRowError> {
        let malformed = |detail: String| MalformedRowError {
            layout: self.layout,
            key: kv.key.clone(),
            detail,
        };

        let rest = kv
            .key
            .strip_prefix(&self.index_prefix[..])
            .ok_or_else(|| malformed("key is outside of the index".into()))?;
        let (key_region, rest) = match self.layout {
            RowLayout::Old => (None, rest),
            RowLayout::New => {
                let (region, rest) = decode_bytes_ascending(rest)
                    .ok_or_else(|| malformed("undecodable region".into()))?;
                (Some(Region::new(region)), rest)
            }
        };
        let id: [u8; 4] = rest
            .try_into()
            .map_err(|_| malformed(format!("expected 4 id bytes, found {}", rest.len())))?;
        let instance_id = InstanceId(u32::from_be_bytes(id));
        if instance_id.0 == 0 {
            return Err(malformed("instance id must be positive".into()));
        }

        let (tag, value) = kv
            .value
            .split_first()
            .ok_or_else(|| malformed("empty value".into()))?;
        if *tag != self.layout.value_tag() {
            return Err(malformed(format!("unexpected value tag {tag}")));
        }
        let proto = ProtoInstanceValue::decode(value)
            .map_err(|err| malformed(format!("undecodable value: {err}")))?;
        let region = match (key_region, proto.region) {
            (Some(region), _) => region,
            (None, Some(region)) => Region::new(region),
            (None, None) => Region::DEFAULT,
        };

        Ok(InstanceRow {
            region,
            instance_id,
            sql_addr: proto.sql_addr.unwrap_or_default(),
            rpc_addr: proto.rpc_addr.unwrap_or_default(),
            session_id: proto.session_id.map(SessionId::from).unwrap_or_default(),
            locality: Locality {
                tiers: proto
                    .locality
                    .into_iter()
                    .map(|ProtoTier { key, value }| Tier { key, value })
                    .collect(),
            },
            timestamp: kv.timestamp,
        })
    }
}

fn encode_bytes_ascending(buf: &mut Vec<u8>, b: &[u8]) {
    buf.push(BYTES_MARKER);
    for byte in b {
        buf.push(*byte);
        if *byte == ESCAPE {
            buf.push(ESCAPED_00);
        }
    }
    buf.push(ESCAPE);
    buf.push(ESCAPED_TERM);
}

/// Returns the decoded bytes and the remainder of the input.
fn decode_bytes_ascending(b: &[u8]) -> Option<(Vec<u8>, &[u8])> {
    let rest = b.strip_prefix(&[BYTES_MARKER])?;
    let mut out = Vec::new();
    let mut i = 0;
    loop {
        let byte = *rest.get(i)?;
        if byte != ESCAPE {
            out.push(byte);
            i += 1;
            continue;
        }
        match *rest.get(i + 1)? {
            ESCAPED_00 => {
                out.push(ESCAPE);
                i += 2;
            }
            ESCAPED_TERM => return Some((out, &rest[i + 2..])),
            _ => return None,
        }
    }
}
