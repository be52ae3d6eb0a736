//! Core addressing and identity types shared by every component of the
//! write path: cluster addressing, physical SCO locations, content hashes
//! and the small set of identifiers (namespace, owner tag, scrub id) that
//! flow through TLogs, snapshots and the backend layout.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Logical index into a volume's address space. Max valid value is
/// `u32::MAX`, giving a 16 TiB volume at the default 4 KiB cluster size.
pub type ClusterAddress = u32;

/// Size, in bytes, of a single cluster. Always a power-of-two multiple of
/// `LBA_SIZE`.
pub const LBA_SIZE: u32 = 512;

/// Default cluster size used when a `VolumeConfig` does not override it.
pub const DEFAULT_CLUSTER_SIZE: u32 = 4096;

/// Default number of clusters packed into a single SCO (4 MiB at the
/// default cluster size).
pub const DEFAULT_CLUSTERS_PER_SCO: u32 = 1024;

/// Default number of SCOs a TLog covers before it is rolled.
pub const DEFAULT_SCOS_PER_TLOG: u32 = 20;

/// `clone_id` of `0` always means "this volume's own SCOs". Ancestor SCOs
/// reached across a clone boundary carry `clone_id >= 1`.
pub type CloneId = u8;

/// Monotonic SCO sequence number, unique within `(namespace, clone_id)`.
pub type ScoNumber = u32;

/// Physical location of a cluster: which SCO, at which offset, belonging
/// to which ancestor (`clone_id`), and which on-disk layout `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterLocation {
    pub sco_number: ScoNumber,
    pub sco_offset: u16,
    pub clone_id: CloneId,
    pub version: u8,
}

impl ClusterLocation {
    pub fn new(sco_number: ScoNumber, sco_offset: u16) -> Self {
        Self {
            sco_number,
            sco_offset,
            clone_id: 0,
            version: 1,
        }
    }

    /// True for the volume's own writes (as opposed to data inherited from
    /// an ancestor across a clone).
    pub fn is_own(&self) -> bool {
        self.clone_id == 0
    }

    pub fn with_clone(mut self, clone_id: CloneId) -> Self {
        self.clone_id = clone_id;
        self
    }

    /// Packs the location into the `u64` wire/on-disk representation used
    /// by `TLog` entries: `sco_number:32 | sco_offset:16 | clone_id:8 | version:8`.
    pub fn to_bits(self) -> u64 {
        (self.sco_number as u64) << 32
            | (self.sco_offset as u64) << 16
            | (self.clone_id as u64) << 8
            | self.version as u64
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            sco_number: (bits >> 32) as u32,
            sco_offset: (bits >> 16) as u16,
            clone_id: (bits >> 8) as u8,
            version: bits as u8,
        }
    }
}

impl fmt::Display for ClusterLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}@{}",
            self.sco_number, self.version, self.clone_id, self.sco_offset
        )
    }
}

/// MD5-width content digest of a cluster's bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub [u8; 16]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        Self(md5::compute(bytes).0)
    }

    pub const fn zero() -> Self {
        Self([0u8; 16])
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Namespace identifying a volume's artifacts in the `ObjectStore`/`KvStore`
/// (roughly `namespace-<uuid>`, but callers should treat it as opaque).
pub type NamespaceId = String;

/// Stable identifier of a volume, independent of its current namespace.
pub type VolumeId = Uuid;

/// Identifier for a single TLog file, also used as its backend object name
/// suffix (`tlog_<uuid>`).
pub type TLogId = Uuid;

/// Monotonically increasing fencing token, minted on every successful
/// `VolumeEngine::open`. Any backend write carries the tag; the backend
/// rejects writes from a stale tag via a conditional write.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct OwnerTag(pub u64);

impl OwnerTag {
    pub const ZERO: OwnerTag = OwnerTag(0);

    pub fn next(self) -> Self {
        OwnerTag(self.0 + 1)
    }
}

impl fmt::Display for OwnerTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner-{}", self.0)
    }
}

/// Stamped into metadata once a scrub result has been applied; guards
/// `MetaDataStore::apply_relocs` against double-application.
pub type ScrubId = Uuid;

/// Fixed-capacity unit of `MetaDataStore` caching/persistence.
pub type PageId = u32;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cluster_location_bit_roundtrip() {
        let cl = ClusterLocation {
            sco_number: 0xDEAD_BEEF,
            sco_offset: 0x1234,
            clone_id: 7,
            version: 3,
        };
        assert_eq!(ClusterLocation::from_bits(cl.to_bits()), cl);
    }

    #[test]
    fn content_hash_matches_md5() {
        let h = ContentHash::of(b"hello world");
        assert_eq!(h, ContentHash(md5::compute(b"hello world").0));
    }

    #[test]
    fn owner_tag_orders_monotonically() {
        let t0 = OwnerTag::ZERO;
        let t1 = t0.next();
        assert!(t1 > t0);
    }
}
