//! Persistent record images.
//!
//! Everything the checker reads from or writes to the object store lives
//! here: the xattr images stamped on objects (lma, filter-fid, layout,
//! striped-directory, link), the per-checker status records, the instance
//! bookmark, and the tracing-file flag byte. All multi-byte fields are
//! little-endian on disk except where noted; the link xattr's record length
//! and the tracing-file key are big-endian so that their byte order is
//! canonical across nodes.

#![allow(missing_docs)]

use bitflags::bitflags;
use zerocopy::byteorder::big_endian::U16 as Be16;
use zerocopy::byteorder::little_endian::{U16 as Le16, U32 as Le32, U64 as Le64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::fid::{Fid, OstId};

// Xattr names. The `trusted` prefix keeps them out of reach of ordinary
// clients.
pub const XATTR_LMA: &str = "trusted.lma";
pub const XATTR_LOV: &str = "trusted.lov";
pub const XATTR_LMV: &str = "trusted.lmv";
pub const XATTR_LINK: &str = "trusted.link";
pub const XATTR_FILTER_FID: &str = "trusted.fid";

pub const LINKEA_MAGIC: u32 = 0x11EA_F1DF;
pub const LOV_MAGIC_V1: u32 = 0x0BD1_0BD0;
pub const LOV_MAGIC_V3: u32 = 0x0BD3_0BD0;
pub const LOV_PATTERN_RAID0: u32 = 0x001;
pub const LMV_MAGIC_MASTER: u32 = 0x0CD2_0CD0;
pub const LMV_MAGIC_STRIPE: u32 = 0x0CD4_0CD0;

pub const LAYOUT_MAGIC: u32 = 0xB173_AE14;
pub const NAMESPACE_MAGIC: u32 = 0xA062_9D03;
pub const BOOKMARK_MAGIC: u32 = 0x2013_0C1D;
pub const BOOKMARK_VERSION: u16 = 2;

/// Hard ceiling on stripe counts accepted from a layout xattr.
pub const LOV_MAX_STRIPE_COUNT: u16 = 2000;

pub const POOL_NAME_LEN: usize = 16;
pub const NAME_MAX: usize = 255;

/// lma compat flag: the OST object's index mapping embeds a real FID.
pub const LMA_COMPAT_FID_ON_OST: u32 = 0x0000_0008;

/// A FID as embedded in little-endian records.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Debug,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct FidLe {
    pub seq: Le64,
    pub oid: Le32,
    pub ver: Le32,
}

impl From<Fid> for FidLe {
    fn from(fid: Fid) -> FidLe {
        FidLe {
            seq: Le64::new(fid.seq),
            oid: Le32::new(fid.oid),
            ver: Le32::new(fid.ver),
        }
    }
}

impl From<FidLe> for Fid {
    fn from(fid: FidLe) -> Fid {
        Fid {
            seq: fid.seq.get(),
            oid: fid.oid.get(),
            ver: fid.ver.get(),
        }
    }
}

/// An OST object id as embedded in layout stripe slots.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Debug,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct OstIdLe {
    pub id: Le64,
    pub seq: Le64,
}

impl From<OstId> for OstIdLe {
    fn from(oi: OstId) -> OstIdLe {
        OstIdLe {
            id: Le64::new(oi.id),
            seq: Le64::new(oi.seq),
        }
    }
}

impl From<OstIdLe> for OstId {
    fn from(oi: OstIdLe) -> OstId {
        OstId {
            id: oi.id.get(),
            seq: oi.seq.get(),
        }
    }
}

/// Self-identification xattr present on every object.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct LmaAttrs {
    pub compat: Le32,
    pub incompat: Le32,
    pub self_fid: FidLe,
}

/// Back-pointer xattr on an OST object. `parent.ver` is repurposed to carry
/// the stripe slot index within the parent's layout.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct FilterFid {
    pub parent: FidLe,
}

impl FilterFid {
    /// Back-pointer to `parent`, with the stripe slot packed into the
    /// FID's version field.
    pub fn new(parent: Fid, slot: u32) -> FilterFid {
        FilterFid {
            parent: Fid {
                seq: parent.seq,
                oid: parent.oid,
                ver: slot,
            }
            .into(),
        }
    }

    pub fn parse(buf: &[u8]) -> Option<FilterFid> {
        let (ff, _) = FilterFid::read_from_prefix(buf).ok()?;
        Some(ff)
    }

    /// The owning inode, version field cleared.
    pub fn parent_fid(&self) -> Fid {
        let fid: Fid = self.parent.into();
        Fid {
            seq: fid.seq,
            oid: fid.oid,
            ver: 0,
        }
    }

    /// The stripe slot within the owner's layout.
    pub fn slot(&self) -> u32 {
        self.parent.ver.get()
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Pre-FID variant of [`FilterFid`], trailing the legacy object id. Still
/// found on objects written by old servers.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct FilterFidOld {
    pub parent: FidLe,
    pub objid: Le64,
    pub seq: Le64,
}

/// Fixed header of the layout xattr, common to V1 and V3.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct LovHeader {
    pub magic: Le32,
    pub pattern: Le32,
    pub oi: OstIdLe,
    pub stripe_size: Le32,
    pub stripe_count: Le16,
    pub layout_gen: Le16,
}

/// One stripe slot in a layout xattr. An all-zero slot is a dummy reserved
/// for a later repair write.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Debug,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct LovOstData {
    pub oi: OstIdLe,
    pub r#gen: Le32,
    pub idx: Le32,
}

impl LovOstData {
    pub fn is_dummy(&self) -> bool {
        self.oi.id.get() == 0 && self.oi.seq.get() == 0 && self.r#gen.get() == 0 && self.idx.get() == 0
    }
}

/// Header of the striped-directory xattr. Followed by `stripe_count` shard
/// FIDs in the master image; the per-shard image carries no FID array.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct LmvHeader {
    pub magic: Le32,
    pub stripe_count: Le32,
    pub master_mdt_index: Le32,
    pub hash_type: Le32,
    pub layout_version: Le32,
    pub padding: Le32,
    pub pool_name: [u8; POOL_NAME_LEN],
}

pub const LMV_HASH_TYPE_MASK: u32 = 0x0000_ffff;
pub const LMV_HASH_TYPE_UNKNOWN: u32 = 0;
pub const LMV_HASH_TYPE_ALL_CHARS: u32 = 1;
pub const LMV_HASH_TYPE_FNV_1A_64: u32 = 2;

bitflags! {
    /// Flag half of the striped-directory hash field.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LmvHashFlags: u32 {
        const MIGRATION = 0x8000_0000;
        const DEAD      = 0x4000_0000;
        const BAD_TYPE  = 0x2000_0000;
        const LOST_LMV  = 0x1000_0000;
    }
}

/// Header of the link xattr: a packed array of `(parent, name)` records.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct LinkEaHeader {
    pub magic: Le32,
    pub reccount: Le32,
    pub len: Le64,
}

/// Fixed prefix of one link record. The name follows inline; `reclen`
/// covers prefix plus name and is big-endian and unaligned by design, so
/// records may be walked without copying on any host.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LinkEaEntryHead {
    pub reclen: Be16,
    pub parent: [u8; 16],
}

pub const LINKEA_ENTRY_MIN: usize = size_of::<LinkEaEntryHead>() + 1;

bitflags! {
    /// Per-run parameter flags, persisted in the bookmark.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParamFlags: u16 {
        /// Re-start from the beginning, discarding the checkpoint.
        const RESET         = 0x0001;
        /// Abort on the first per-object corruption instead of counting it.
        const FAILOUT       = 0x0002;
        /// Detect and report, never modify.
        const DRYRUN        = 0x0004;
        /// Fan phase-1 start out to every registered target.
        const ALL_TARGETS   = 0x0008;
        /// Forward start/stop to peer MDTs as well.
        const BROADCAST     = 0x0010;
        /// Scan OSTs for orphan objects in phase-2.
        const ORPHAN        = 0x0020;
        /// Allowed to fabricate objects to cover dangling references.
        const CREATE_MDTOBJ = 0x0040;
    }
}

bitflags! {
    /// Run-level condition flags in a checker's status record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RunFlags: u32 {
        /// At least one full first-cycle scan has been made.
        const SCANNED_ONCE   = 0x0000_0001;
        /// Some inconsistency was found (or, under dryrun, would be fixed).
        const INCONSISTENT   = 0x0000_0002;
        /// The device carries objects upgraded from the pre-FID format.
        const UPGRADE        = 0x0000_0004;
        /// Some peer was unreachable; the result under-reports.
        const INCOMPLETE     = 0x0000_0008;
        /// An on-disk LAST_ID was behind the objects actually present.
        const CRASHED_LASTID = 0x0000_0010;
    }
}

bitflags! {
    /// Flag byte stored in the tracing file for deferred phase-2 work.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TraceFlags: u8 {
        const CHECK_LINKEA    = 0x01;
        const CHECK_PARENT    = 0x02;
        const UNCERTAIN_LMV   = 0x04;
        const RECHECK_NAMEHASH = 0x08;
    }
}

/// Scan position, persisted inside status records.
#[repr(C)]
#[derive(
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Debug,
    FromBytes,
    IntoBytes,
    KnownLayout,
    Immutable,
    Unaligned,
)]
pub struct PositionRecord {
    pub oit_cookie: Le64,
    pub dir_parent: FidLe,
    pub dir_cookie: Le64,
}

/// Per-instance bookmark, stored in a dedicated local object.
#[repr(C)]
#[derive(
    Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned,
)]
pub struct BookmarkRecord {
    pub magic: Le32,
    pub version: Le16,
    pub param: Le16,
    pub speed_limit: Le32,
    pub async_windows: Le16,
    pub padding: Le16,
    /// Lost+found directory for this node, zero until first created.
    pub lf_fid: FidLe,
    /// Highest FID handed out for repair-created objects.
    pub last_fid: FidLe,
    pub reserved: [Le64; 4],
}

/// Status record of the namespace checker.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct NamespaceRecord {
    pub magic: Le32,
    pub status: Le32,
    pub flags: Le32,
    pub success_count: Le32,
    pub run_time_phase1: Le32,
    pub run_time_phase2: Le32,
    pub time_last_complete: Le64,
    pub time_latest_start: Le64,
    pub time_last_checkpoint: Le64,
    pub pos_latest_start: PositionRecord,
    pub pos_last_checkpoint: PositionRecord,
    pub pos_first_inconsistent: PositionRecord,
    pub items_checked: Le64,
    pub items_repaired: Le64,
    pub items_failed: Le64,
    pub items_skipped: Le64,
    pub dirs_checked: Le64,
    pub mul_linked_checked: Le64,
    pub objs_checked_phase2: Le64,
    pub objs_repaired_phase2: Le64,
    pub objs_failed_phase2: Le64,
    pub objs_nlink_repaired: Le64,
    pub objs_lost_found: Le64,
    pub linkea_repaired: Le64,
    pub dirent_repaired: Le64,
    pub mul_linked_repaired: Le64,
    pub unmatched_pairs_repaired: Le64,
    pub dangling_repaired: Le64,
    pub bad_type_repaired: Le64,
    pub lost_dirent_repaired: Le64,
    pub striped_dirs_scanned: Le64,
    pub striped_dirs_repaired: Le64,
    pub striped_shards_scanned: Le64,
    pub striped_shards_repaired: Le64,
    pub name_hash_repaired: Le64,
    pub fid_latest_scanned_phase2: FidLe,
    pub reserved: [Le64; 2],
}

/// Status record of the layout checker (master and slave share the image).
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LayoutRecord {
    pub magic: Le32,
    pub status: Le32,
    pub flags: Le32,
    pub success_count: Le32,
    pub run_time_phase1: Le32,
    pub run_time_phase2: Le32,
    pub time_last_complete: Le64,
    pub time_latest_start: Le64,
    pub time_last_checkpoint: Le64,
    /// Layout scanning never descends into directories, so positions are
    /// bare object-table cookies.
    pub pos_latest_start: Le64,
    pub pos_last_checkpoint: Le64,
    pub pos_first_inconsistent: Le64,
    pub objs_checked_phase1: Le64,
    pub objs_failed_phase1: Le64,
    pub objs_skipped: Le64,
    pub objs_checked_phase2: Le64,
    pub objs_failed_phase2: Le64,
    pub repaired_dangling: Le64,
    pub repaired_unmatched_pair: Le64,
    pub repaired_multiple_referenced: Le64,
    pub repaired_orphan: Le64,
    pub repaired_inconsistent_owner: Le64,
    pub repaired_others: Le64,
    pub fid_latest_scanned_phase2: FidLe,
    pub reserved: [Le64; 2],
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes_are_stable() {
        assert_eq!(size_of::<FidLe>(), 16);
        assert_eq!(size_of::<LmaAttrs>(), 24);
        assert_eq!(size_of::<FilterFid>(), 16);
        assert_eq!(size_of::<FilterFidOld>(), 32);
        assert_eq!(size_of::<LovHeader>(), 32);
        assert_eq!(size_of::<LovOstData>(), 24);
        assert_eq!(size_of::<LinkEaHeader>(), 16);
        assert_eq!(size_of::<LinkEaEntryHead>(), 18);
        assert_eq!(size_of::<PositionRecord>(), 32);
    }

    #[test]
    fn fid_le_round_trip() {
        let fid = Fid::new(0x2_0000_0400, 7, 0);
        assert_eq!(Fid::from(FidLe::from(fid)), fid);
    }

    #[test]
    fn dummy_slot_detection() {
        let mut slot = LovOstData::default();
        assert!(slot.is_dummy());
        slot.idx = Le32::new(3);
        assert!(!slot.is_dummy());
    }

    #[test]
    fn trace_flags_fit_one_byte() {
        let all = TraceFlags::all();
        assert_eq!(all.bits(), 0x0f);
    }
}
