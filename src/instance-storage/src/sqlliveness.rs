// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Liveness sessions and the regions they are encoded with.
//!
//! A session id is either a bare 16 byte UUID (the legacy format, implicitly
//! in [`Region::DEFAULT`]) or
//!
//! ```text
//! [version = 1][region length][region bytes ...][16 byte uuid]
//! ```

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use uuid::Uuid;

const SESSION_ID_VERSION: u8 = 1;
const UUID_LEN: usize = 16;
const MIN_REGION_LEN: usize = 1;
const LEGACY_LEN: usize = UUID_LEN;
const MIN_REGIONAL_LEN: usize = 2 + MIN_REGION_LEN + UUID_LEN;

/// The home region of an instance row, as opaque bytes.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Region(Bytes);

impl Region {
    /// The single implicit region of a cluster that is not multi-region.
    pub const DEFAULT: Region = Region(Bytes::from_static(&[0x80]));

    /// Wraps raw region bytes.
    pub fn new(region: impl Into<Bytes>) -> Self {
        Region(region.into())
    }

    /// The raw bytes of the region.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_bytes(&self.0, f)
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Region({})", self)
    }
}

/// Prints valid UTF-8 as is, and anything else as escaped bytes.
fn fmt_bytes(b: &[u8], f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match std::str::from_utf8(b) {
        Ok(s) => f.write_str(s),
        Err(_) => write!(f, "{}", b.escape_ascii()),
    }
}

/// An error decoding a [`SessionId`] or building one from its parts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionIdError {
    #[error("session id requires a non-empty region")]
    EmptyRegion,
    #[error("region is too long: {0} bytes")]
    RegionTooLong(usize),
    #[error("session id is too short: {0} bytes")]
    TooShort(usize),
    #[error("invalid session id version: {0}")]
    InvalidVersion(u8),
    #[error("session id with length {len} is the wrong size to include a region with length {region_len}")]
    WrongSize { len: usize, region_len: usize },
}

/// The identifier of a liveness session.
///
/// The empty session id never identifies a session; instance rows use it to
/// mark themselves available.
#[derive(Default, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId(Bytes);

impl SessionId {
    /// The empty session id.
    pub const EMPTY: SessionId = SessionId(Bytes::new());

    /// Builds a session id for a session in `region`.
    pub fn make(region: &Region, id: Uuid) -> Result<Self, SessionIdError> {
        let region = region.as_bytes();
        if region.len() < MIN_REGION_LEN {
            return Err(SessionIdError::EmptyRegion);
        }
        let region_len =
            u8::try_from(region.len()).map_err(|_| SessionIdError::RegionTooLong(region.len()))?;
        let mut b = Vec::with_capacity(2 + region.len() + UUID_LEN);
        b.push(SESSION_ID_VERSION);
        b.push(region_len);
        b.extend_from_slice(region);
        b.extend_from_slice(id.as_bytes());
        Ok(SessionId(Bytes::from(b)))
    }

    /// Builds a session id in the legacy format, which carries no region.
    pub fn legacy(id: Uuid) -> Self {
        SessionId(Bytes::copy_from_slice(id.as_bytes()))
    }

    /// The raw bytes of the session id.
    pub fn as_bytes(&self) -> &Bytes {
        &self.0
    }

    /// Reports whether this is the empty session id.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the region the session was created in.
    pub fn decode_region(&self) -> Result<Region, SessionIdError> {
        let b = &self.0;
        if b.len() == LEGACY_LEN {
            return Ok(Region::DEFAULT);
        }
        if b.len() < MIN_REGIONAL_LEN {
            return Err(SessionIdError::TooShort(b.len()));
        }
        if b[0] != SESSION_ID_VERSION {
            return Err(SessionIdError::InvalidVersion(b[0]));
        }
        let region_len = usize::from(b[1]);
        let rest = b.slice(2..);
        if rest.len() != region_len + UUID_LEN {
            return Err(SessionIdError::WrongSize {
                len: b.len(),
                region_len,
            });
        }
        Ok(Region(rest.slice(..region_len)))
    }
}

impl From<Bytes> for SessionId {
    fn from(b: Bytes) -> Self {
        SessionId(b)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self)
    }
}

/// Reports whether liveness sessions are still alive.
///
/// Sessions only ever transition from alive to dead, so a `false` answer may
/// be cached indefinitely.
#[async_trait]
pub trait LivenessReader: fmt::Debug + Send + Sync {
    /// Reports whether `session` is alive.
    async fn is_alive(&self, session: &SessionId) -> Result<bool, anyhow::Error>;
}
