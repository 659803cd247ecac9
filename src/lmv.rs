//! Striped-directory xattr codec and name hashing.
//!
//! A directory striped across MDTs stores a master image on the primary
//! inode (shard count, hash policy, shard FIDs) and a slave image on each
//! shard. Names map to shards through one of two hash functions; the hash
//! field's high bits carry condition flags rather than hash selection.

use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::ondisk::{
    FidLe, LMV_HASH_TYPE_ALL_CHARS, LMV_HASH_TYPE_FNV_1A_64, LMV_HASH_TYPE_MASK,
    LMV_HASH_TYPE_UNKNOWN, LMV_MAGIC_MASTER, LMV_MAGIC_STRIPE, LmvHashFlags, LmvHeader,
    POOL_NAME_LEN,
};

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Decoded striped-directory xattr, master or per-shard.
#[derive(Clone, Debug, PartialEq)]
pub struct LmvLayout {
    pub magic: u32,
    pub stripe_count: u32,
    pub master_mdt_index: u32,
    /// Raw hash field: low 16 bits select the function, high bits flag.
    pub hash_type: u32,
    pub layout_version: u32,
    pub pool_name: [u8; POOL_NAME_LEN],
    /// Shard FIDs; populated only in the master image.
    pub stripe_fids: SmallVec<[Fid; 4]>,
}

impl LmvLayout {
    pub fn new_master(stripe_count: u32, master_mdt_index: u32, hash_type: u32) -> LmvLayout {
        LmvLayout {
            magic: LMV_MAGIC_MASTER,
            stripe_count,
            master_mdt_index,
            hash_type,
            layout_version: 0,
            pool_name: [0; POOL_NAME_LEN],
            stripe_fids: SmallVec::new(),
        }
    }

    pub fn new_stripe(stripe_count: u32, master_mdt_index: u32, hash_type: u32) -> LmvLayout {
        LmvLayout {
            magic: LMV_MAGIC_STRIPE,
            ..LmvLayout::new_master(stripe_count, master_mdt_index, hash_type)
        }
    }

    pub fn is_master(&self) -> bool {
        self.magic == LMV_MAGIC_MASTER
    }

    pub fn hash_fn(&self) -> u32 {
        self.hash_type & LMV_HASH_TYPE_MASK
    }

    pub fn hash_flags(&self) -> LmvHashFlags {
        LmvHashFlags::from_bits_truncate(self.hash_type)
    }

    pub fn has_known_hash(&self) -> bool {
        matches!(
            self.hash_fn(),
            LMV_HASH_TYPE_ALL_CHARS | LMV_HASH_TYPE_FNV_1A_64
        )
    }

    /// A deliberately unusable hash: some checker found a name entry that
    /// did not hash to its shard and fenced the directory off from new
    /// insertions. Distinct from a merely corrupted hash field, which
    /// lacks the marker flag.
    pub fn hash_quarantined(&self) -> bool {
        self.hash_fn() == LMV_HASH_TYPE_UNKNOWN
            && self.hash_flags().contains(LmvHashFlags::BAD_TYPE)
    }

    pub fn parse(data: &[u8]) -> Result<LmvLayout> {
        let (header, mut rest) = LmvHeader::read_from_prefix(data).map_err(|_| Errno::EINVAL)?;
        let magic = header.magic.get();
        if magic != LMV_MAGIC_MASTER && magic != LMV_MAGIC_STRIPE {
            return Err(Errno::EINVAL);
        }
        let stripe_count = header.stripe_count.get();
        let mut stripe_fids = SmallVec::new();
        if magic == LMV_MAGIC_MASTER {
            for _ in 0..stripe_count {
                let (fid, tail) = FidLe::read_from_prefix(rest).map_err(|_| Errno::EINVAL)?;
                stripe_fids.push(fid.into());
                rest = tail;
            }
        }
        Ok(LmvLayout {
            magic,
            stripe_count,
            master_mdt_index: header.master_mdt_index.get(),
            hash_type: header.hash_type.get(),
            layout_version: header.layout_version.get(),
            pool_name: header.pool_name,
            stripe_fids,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = LmvHeader {
            magic: self.magic.into(),
            stripe_count: self.stripe_count.into(),
            master_mdt_index: self.master_mdt_index.into(),
            hash_type: self.hash_type.into(),
            layout_version: self.layout_version.into(),
            padding: 0.into(),
            pool_name: self.pool_name,
        };
        let mut out = header.as_bytes().to_vec();
        if self.is_master() {
            for fid in &self.stripe_fids {
                out.extend_from_slice(FidLe::from(*fid).as_bytes());
            }
        }
        out
    }

    /// Check a shard's slave image against the master it should belong to.
    pub fn shard_matches(&self, master: &LmvLayout) -> bool {
        self.magic == LMV_MAGIC_STRIPE
            && self.stripe_count == master.stripe_count
            && self.hash_fn() == master.hash_fn()
            && self.master_mdt_index == master.master_mdt_index
    }

    /// Re-materialize a lost master image from the first valid shard's
    /// fields and the shard FIDs collected during the scan.
    pub fn master_from_shard(shard: &LmvLayout, stripe_fids: &[Fid]) -> LmvLayout {
        LmvLayout {
            magic: LMV_MAGIC_MASTER,
            stripe_count: shard.stripe_count,
            master_mdt_index: shard.master_mdt_index,
            hash_type: shard.hash_fn() | LmvHashFlags::LOST_LMV.bits(),
            layout_version: shard.layout_version,
            pool_name: shard.pool_name,
            stripe_fids: stripe_fids.iter().copied().collect(),
        }
    }
}

pub fn hash_all_chars(name: &[u8]) -> u64 {
    name.iter().map(|&c| c as u64).sum()
}

pub fn hash_fnv_1a_64(name: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &c in name {
        hash ^= c as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Map a name onto a shard index under the given hash policy. `EINVAL` for
/// an unknown hash function or a zero shard count.
pub fn name_to_stripe_index(hash_type: u32, stripe_count: u32, name: &[u8]) -> Result<u32> {
    if stripe_count == 0 {
        return Err(Errno::EINVAL);
    }
    let hash = match hash_type & LMV_HASH_TYPE_MASK {
        LMV_HASH_TYPE_ALL_CHARS => hash_all_chars(name),
        LMV_HASH_TYPE_FNV_1A_64 => hash_fnv_1a_64(name),
        _ => return Err(Errno::EINVAL),
    };
    Ok((hash % stripe_count as u64) as u32)
}

/// Dirent name a master directory uses for shard `idx` backed by `fid`.
pub fn shard_name(fid: Fid, idx: u32) -> Vec<u8> {
    format!("{fid}:{idx}").into_bytes()
}

/// Parse a shard dirent name back into `(shard fid, shard index)`.
pub fn parse_shard_name(name: &[u8]) -> Option<(Fid, u32)> {
    let text = std::str::from_utf8(name).ok()?;
    let body = text.strip_prefix("[0x")?;
    let (seq, rest) = body.split_once(":0x")?;
    let (oid, rest) = rest.split_once(":0x")?;
    let (ver, idx) = rest.split_once("]:")?;
    let fid = Fid::new(
        u64::from_str_radix(seq, 16).ok()?,
        u32::from_str_radix(oid, 16).ok()?,
        u32::from_str_radix(ver, 16).ok()?,
    );
    Some((fid, idx.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_NORMAL;

    #[test]
    fn master_round_trip() {
        let mut lmv = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_FNV_1A_64);
        lmv.stripe_fids.push(Fid::new(FID_SEQ_NORMAL, 10, 0));
        lmv.stripe_fids.push(Fid::new(FID_SEQ_NORMAL + 1, 11, 0));
        let parsed = LmvLayout::parse(&lmv.to_bytes()).unwrap();
        assert_eq!(parsed, lmv);
    }

    #[test]
    fn stripe_image_has_no_fid_array() {
        let lmv = LmvLayout::new_stripe(4, 1, LMV_HASH_TYPE_ALL_CHARS);
        let parsed = LmvLayout::parse(&lmv.to_bytes()).unwrap();
        assert!(parsed.stripe_fids.is_empty());
        assert_eq!(parsed.stripe_count, 4);
    }

    #[test]
    fn hash_selection_and_flags() {
        let lmv = LmvLayout::new_master(
            2,
            0,
            LMV_HASH_TYPE_FNV_1A_64 | LmvHashFlags::MIGRATION.bits(),
        );
        assert_eq!(lmv.hash_fn(), LMV_HASH_TYPE_FNV_1A_64);
        assert!(lmv.hash_flags().contains(LmvHashFlags::MIGRATION));
        assert!(lmv.has_known_hash());
        let unknown = LmvLayout::new_master(2, 0, 0x7777);
        assert!(!unknown.has_known_hash());
    }

    #[test]
    fn quarantine_marker_is_distinct_from_corruption() {
        let fenced = LmvLayout::new_master(
            2,
            0,
            LMV_HASH_TYPE_UNKNOWN | LmvHashFlags::BAD_TYPE.bits(),
        );
        assert!(fenced.hash_quarantined());
        assert!(!fenced.has_known_hash());
        // UNKNOWN without the marker is plain corruption, not quarantine.
        let corrupted = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_UNKNOWN);
        assert!(!corrupted.hash_quarantined());
        let valid = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_FNV_1A_64);
        assert!(!valid.hash_quarantined());
    }

    #[test]
    fn name_mapping_is_stable() {
        let a = name_to_stripe_index(LMV_HASH_TYPE_FNV_1A_64, 4, b"some-name").unwrap();
        let b = name_to_stripe_index(LMV_HASH_TYPE_FNV_1A_64, 4, b"some-name").unwrap();
        assert_eq!(a, b);
        assert!(a < 4);
        assert_eq!(
            name_to_stripe_index(LMV_HASH_TYPE_ALL_CHARS, 3, b"ab").unwrap(),
            (b'a' as u64 + b'b' as u64) as u32 % 3
        );
        assert_eq!(
            name_to_stripe_index(0x1234, 3, b"x"),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn shard_name_round_trip() {
        let fid = Fid::new(FID_SEQ_NORMAL, 0x42, 0);
        let name = shard_name(fid, 3);
        assert_eq!(parse_shard_name(&name), Some((fid, 3)));
        assert_eq!(parse_shard_name(b"plainfile"), None);
    }

    #[test]
    fn shard_validation() {
        let master = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_FNV_1A_64);
        let good = LmvLayout::new_stripe(2, 0, LMV_HASH_TYPE_FNV_1A_64);
        let bad = LmvLayout::new_stripe(3, 0, LMV_HASH_TYPE_FNV_1A_64);
        assert!(good.shard_matches(&master));
        assert!(!bad.shard_matches(&master));
    }

    #[test]
    fn lost_master_synthesis() {
        let shard = LmvLayout::new_stripe(2, 1, LMV_HASH_TYPE_ALL_CHARS);
        let fids = [Fid::new(FID_SEQ_NORMAL, 1, 0), Fid::new(FID_SEQ_NORMAL, 2, 0)];
        let master = LmvLayout::master_from_shard(&shard, &fids);
        assert!(master.is_master());
        assert!(master.hash_flags().contains(LmvHashFlags::LOST_LMV));
        assert_eq!(master.hash_fn(), LMV_HASH_TYPE_ALL_CHARS);
        assert_eq!(&master.stripe_fids[..], &fids[..]);
    }
}
