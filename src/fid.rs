//! File identifiers.
//!
//! A FID names an object for its whole life: a 64-bit sequence, a 32-bit
//! object id within the sequence, and a 32-bit version. Sequence ranges are
//! carved up between legacy encodings (IGIF for pre-FID inodes, IDIF for
//! pre-FID OST objects), reserved local files, and the normal range handed
//! out by the sequence controller. The comparisons here define the canonical
//! total order used by checkpoints and the tracing file.

use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::errno::{Errno, Result};

/// Legacy OST objects created before FIDs existed, addressed by `(id, 0)`.
pub const FID_SEQ_OST_MDT0: u64 = 0;
/// Unnamed log objects.
pub const FID_SEQ_LLOG: u64 = 1;
pub const FID_SEQ_ECHO: u64 = 2;
pub const FID_SEQ_UNUSED_START: u64 = 3;
pub const FID_SEQ_UNUSED_END: u64 = 9;
/// Named log objects.
pub const FID_SEQ_LLOG_NAME: u64 = 10;
pub const FID_SEQ_RSVD: u64 = 11;
/// Inode/generation pairs from pre-FID metadata servers.
pub const FID_SEQ_IGIF: u64 = 12;
pub const FID_SEQ_IGIF_MAX: u64 = 0xffff_ffff;
/// Legacy OST object ids re-packed with the OST index in seq bits [16, 32).
pub const FID_SEQ_IDIF: u64 = 0x1_0000_0000;
pub const FID_SEQ_IDIF_MAX: u64 = 0x1_ffff_ffff;
/// First sequence controlled by the sequence manager.
pub const FID_SEQ_START: u64 = 0x2_0000_0000;
pub const FID_SEQ_LOCAL_FILE: u64 = 0x2_0000_0001;
pub const FID_SEQ_DOT: u64 = 0x2_0000_0002;
pub const FID_SEQ_LOCAL_NAME: u64 = 0x2_0000_0003;
pub const FID_SEQ_ROOT: u64 = 0x2_0000_0007;
/// First sequence for ordinary user-visible objects.
pub const FID_SEQ_NORMAL: u64 = 0x2_0000_0400;

/// Object id 0 in an OST-capable sequence is the LAST_ID counter, not an
/// object.
pub const LAST_ID_OID: u32 = 0;

/// Immutable 128-bit object identifier.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
)]
pub struct Fid {
    /// Sequence the object was allocated in.
    pub seq: u64,
    /// Object id within the sequence.
    pub oid: u32,
    /// Version; 0 for all live objects. Some xattrs repurpose it.
    pub ver: u32,
}

impl Fid {
    pub const ZERO: Fid = Fid {
        seq: 0,
        oid: 0,
        ver: 0,
    };

    /// The global namespace root, `/ROOT` on MDT0.
    pub const ROOT: Fid = Fid {
        seq: FID_SEQ_ROOT,
        oid: 1,
        ver: 0,
    };

    pub const fn new(seq: u64, oid: u32, ver: u32) -> Fid {
        Fid { seq, oid, ver }
    }

    pub fn is_zero(&self) -> bool {
        self.seq == 0 && self.oid == 0 && self.ver == 0
    }

    pub fn is_igif(&self) -> bool {
        self.seq >= FID_SEQ_IGIF && self.seq <= FID_SEQ_IGIF_MAX
    }

    pub fn is_idif(&self) -> bool {
        self.seq >= FID_SEQ_IDIF && self.seq <= FID_SEQ_IDIF_MAX
    }

    pub fn is_norm(&self) -> bool {
        self.seq >= FID_SEQ_NORMAL
    }

    pub fn is_mdt0(&self) -> bool {
        self.seq == FID_SEQ_OST_MDT0
    }

    pub fn is_root(&self) -> bool {
        self.seq == FID_SEQ_ROOT
    }

    pub fn is_dot(&self) -> bool {
        self.seq == FID_SEQ_DOT
    }

    /// Reserved sequences that never hold user-visible objects: logs, echo,
    /// local files and the other slots below the normal range (the global
    /// root and the `.lustre` subtree excepted, which the scan must visit).
    pub fn is_reserved_local(&self) -> bool {
        if self.seq > FID_SEQ_OST_MDT0 && self.seq <= FID_SEQ_RSVD {
            return true;
        }
        self.seq >= FID_SEQ_START
            && self.seq < FID_SEQ_NORMAL
            && !self.is_root()
            && !self.is_dot()
    }

    /// True when this FID names a per-sequence LAST_ID counter rather than
    /// an object.
    pub fn is_last_id(&self) -> bool {
        self.oid == LAST_ID_OID && (self.is_mdt0() || self.is_idif() || self.is_norm())
    }

    /// A FID an on-disk record may legitimately carry.
    pub fn is_sane(&self) -> bool {
        if self.is_mdt0() || self.is_igif() {
            return self.oid != 0;
        }
        if self.is_idif() {
            return true;
        }
        if self.seq >= FID_SEQ_START {
            return self.oid != 0;
        }
        // Reserved log/echo sequences carry oid-addressed records.
        self.oid != 0
    }

    /// Build an IDIF FID from a legacy OST object id and the owning OST
    /// index.
    pub fn idif(id: u64, ost_idx: u16) -> Fid {
        Fid {
            seq: FID_SEQ_IDIF | ((ost_idx as u64) << 16) | ((id >> 32) & 0xffff),
            oid: id as u32,
            ver: 0,
        }
    }

    /// OST index packed into an IDIF sequence.
    pub fn idif_ost_idx(&self) -> u16 {
        ((self.seq >> 16) & 0xffff) as u16
    }

    /// Legacy object id packed into an IDIF FID.
    pub fn idif_id(&self) -> u64 {
        ((self.seq & 0xffff) << 32) | self.oid as u64
    }

    /// Canonical big-endian image. Indexes keyed by this sort in the same
    /// order as the FIDs themselves on every node.
    pub fn to_be_bytes(&self) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[0..8].copy_from_slice(&self.seq.to_be_bytes());
        key[8..12].copy_from_slice(&self.oid.to_be_bytes());
        key[12..16].copy_from_slice(&self.ver.to_be_bytes());
        key
    }

    pub fn from_be_bytes(key: &[u8; 16]) -> Fid {
        Fid {
            seq: u64::from_be_bytes(key[0..8].try_into().unwrap()),
            oid: u32::from_be_bytes(key[8..12].try_into().unwrap()),
            ver: u32::from_be_bytes(key[12..16].try_into().unwrap()),
        }
    }
}

impl std::fmt::Debug for Fid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{:#x}:{:#x}:{:#x}]", self.seq, self.oid, self.ver)
    }
}

impl std::fmt::Display for Fid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Over-the-wire OST object identifier. Legacy objects use `(id, seq == 0)`;
/// modern objects embed the FID.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug)]
pub struct OstId {
    pub id: u64,
    pub seq: u64,
}

impl OstId {
    pub fn is_zero(&self) -> bool {
        self.id == 0 && self.seq == 0
    }

    pub fn from_fid(fid: Fid) -> OstId {
        if fid.is_idif() {
            OstId {
                id: fid.idif_id(),
                seq: FID_SEQ_OST_MDT0,
            }
        } else {
            OstId {
                id: ((fid.ver as u64) << 32) | fid.oid as u64,
                seq: fid.seq,
            }
        }
    }

    /// Map to a FID, packing legacy ids into the IDIF range using the
    /// caller's OST index.
    pub fn to_fid(self, ost_idx: u16) -> Result<Fid> {
        if self.seq == FID_SEQ_OST_MDT0 {
            // Legacy ids are limited to 48 bits; anything wider cannot be
            // packed into an IDIF sequence.
            if self.id >> 48 != 0 {
                return Err(Errno::EINVAL);
            }
            Ok(Fid::idif(self.id, ost_idx))
        } else {
            Ok(Fid {
                seq: self.seq,
                oid: self.id as u32,
                ver: (self.id >> 32) as u32,
            })
        }
    }
}

/// Lock resource name derived from a FID.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ResId(pub [u64; 4]);

impl ResId {
    pub fn from_fid(fid: Fid) -> ResId {
        ResId([fid.seq, ((fid.oid as u64) << 32) | fid.ver as u64, 0, 0])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_is_lexicographic() {
        let a = Fid::new(1, 5, 0);
        let b = Fid::new(1, 6, 0);
        let c = Fid::new(2, 0, 0);
        assert!(a < b && b < c);
        assert!(Fid::new(1, 5, 1) > a);
    }

    #[test]
    fn be_key_order_matches_fid_order() {
        let fids = [
            Fid::new(0, 1, 0),
            Fid::new(0, 0x100, 0),
            Fid::new(FID_SEQ_IDIF, 7, 0),
            Fid::new(FID_SEQ_NORMAL, 1, 0),
            Fid::new(FID_SEQ_NORMAL, 2, 0),
        ];
        for w in fids.windows(2) {
            assert!(w[0].to_be_bytes() < w[1].to_be_bytes());
            assert_eq!(Fid::from_be_bytes(&w[0].to_be_bytes()), w[0]);
        }
    }

    #[test]
    fn idif_packs_index_and_id() {
        let fid = Fid::idif(0x0001_2345_6789, 3);
        assert!(fid.is_idif());
        assert_eq!(fid.idif_ost_idx(), 3);
        assert_eq!(fid.idif_id(), 0x0001_2345_6789);
    }

    #[test]
    fn ostid_round_trip_legacy() {
        let ostid = OstId {
            id: 0x42,
            seq: FID_SEQ_OST_MDT0,
        };
        let fid = ostid.to_fid(1).unwrap();
        assert!(fid.is_idif());
        assert_eq!(OstId::from_fid(fid), ostid);
    }

    #[test]
    fn ostid_round_trip_normal() {
        let fid = Fid::new(FID_SEQ_NORMAL + 3, 0x1234, 0);
        assert_eq!(OstId::from_fid(fid).to_fid(0).unwrap(), fid);
    }

    #[test]
    fn ostid_rejects_wide_legacy_id() {
        let ostid = OstId {
            id: 1 << 55,
            seq: FID_SEQ_OST_MDT0,
        };
        assert_eq!(ostid.to_fid(0), Err(Errno::EINVAL));
    }

    #[test]
    fn classification() {
        assert!(Fid::new(FID_SEQ_IGIF, 1, 1).is_igif());
        assert!(Fid::ROOT.is_root());
        assert!(!Fid::ROOT.is_reserved_local());
        assert!(Fid::new(FID_SEQ_LOCAL_FILE, 1, 0).is_reserved_local());
        assert!(Fid::new(FID_SEQ_LLOG, 1, 0).is_reserved_local());
        assert!(Fid::new(FID_SEQ_OST_MDT0, 0, 0).is_last_id());
        assert!(Fid::new(FID_SEQ_NORMAL, LAST_ID_OID, 0).is_last_id());
        assert!(!Fid::new(FID_SEQ_NORMAL, 1, 0).is_last_id());
        assert!(!Fid::ZERO.is_sane());
    }
}
