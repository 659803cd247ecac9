//! Striped-file layout xattr codec.
//!
//! The layout xattr on a metadata inode maps the file body onto OST
//! objects: a V1 or V3 header (V3 adds a pool name) followed by one slot
//! per stripe. Repair paths need to grow layouts with dummy slots and
//! rewrite individual slots in place, so the decoded form is mutable and
//! re-encodes exactly.

use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::errno::{Errno, Result};
use crate::fid::{Fid, OstId};
use crate::ondisk::{
    LOV_MAGIC_V1, LOV_MAGIC_V3, LOV_MAX_STRIPE_COUNT, LOV_PATTERN_RAID0, LovHeader, LovOstData,
    OstIdLe, POOL_NAME_LEN,
};

pub const DEFAULT_STRIPE_SIZE: u32 = 1 << 20;

/// Decoded layout xattr.
#[derive(Clone, Debug, PartialEq)]
pub struct LovLayout {
    pub magic: u32,
    pub pattern: u32,
    pub oi: OstId,
    pub stripe_size: u32,
    pub layout_gen: u16,
    /// Present iff `magic == LOV_MAGIC_V3`.
    pub pool_name: Option<[u8; POOL_NAME_LEN]>,
    pub stripes: SmallVec<[LovOstData; 4]>,
}

impl LovLayout {
    /// A fresh single-version layout self-identified by `self_fid`, with no
    /// stripes yet.
    pub fn new_v1(self_fid: Fid) -> LovLayout {
        LovLayout {
            magic: LOV_MAGIC_V1,
            pattern: LOV_PATTERN_RAID0,
            oi: OstId::from_fid(self_fid),
            stripe_size: DEFAULT_STRIPE_SIZE,
            layout_gen: 0,
            pool_name: None,
            stripes: SmallVec::new(),
        }
    }

    pub fn parse(data: &[u8]) -> Result<LovLayout> {
        let (header, rest) = LovHeader::read_from_prefix(data).map_err(|_| Errno::EINVAL)?;
        let magic = header.magic.get();
        let (pool_name, mut rest) = match magic {
            LOV_MAGIC_V1 => (None, rest),
            LOV_MAGIC_V3 => {
                let (pool, rest) =
                    <[u8; POOL_NAME_LEN]>::read_from_prefix(rest).map_err(|_| Errno::EINVAL)?;
                (Some(pool), rest)
            }
            _ => return Err(Errno::EINVAL),
        };
        let stripe_count = header.stripe_count.get();
        if stripe_count > LOV_MAX_STRIPE_COUNT {
            return Err(Errno::EINVAL);
        }
        let mut stripes = SmallVec::with_capacity(stripe_count as usize);
        for _ in 0..stripe_count {
            let (slot, tail) = LovOstData::read_from_prefix(rest).map_err(|_| Errno::EINVAL)?;
            stripes.push(slot);
            rest = tail;
        }
        Ok(LovLayout {
            magic,
            pattern: header.pattern.get(),
            oi: header.oi.into(),
            stripe_size: header.stripe_size.get(),
            layout_gen: header.layout_gen.get(),
            pool_name,
            stripes,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let header = LovHeader {
            magic: self.magic.into(),
            pattern: self.pattern.into(),
            oi: OstIdLe::from(self.oi),
            stripe_size: self.stripe_size.into(),
            stripe_count: (self.stripes.len() as u16).into(),
            layout_gen: self.layout_gen.into(),
        };
        let mut out = header.as_bytes().to_vec();
        if let Some(pool) = self.pool_name {
            out.extend_from_slice(&pool);
        }
        for slot in &self.stripes {
            out.extend_from_slice(slot.as_bytes());
        }
        out
    }

    pub fn stripe_count(&self) -> u16 {
        self.stripes.len() as u16
    }

    pub fn stripe(&self, idx: usize) -> Option<&LovOstData> {
        self.stripes.get(idx)
    }

    /// Resolve the OST object FID a slot points at. `None` for dummy slots.
    pub fn stripe_fid(&self, idx: usize) -> Option<Fid> {
        let slot = self.stripes.get(idx)?;
        if slot.is_dummy() {
            return None;
        }
        OstId::from(slot.oi).to_fid(slot.idx.get() as u16).ok()
    }

    /// Index of the slot referencing `child` on OST `ost_idx`, if any.
    pub fn find_stripe(&self, child: Fid, ost_idx: u16) -> Option<usize> {
        (0..self.stripes.len()).find(|&i| {
            self.stripes[i].idx.get() as u16 == ost_idx && self.stripe_fid(i) == Some(child)
        })
    }

    /// Grow the stripe array with dummy slots so `slot_idx` exists.
    pub fn extend_to(&mut self, slot_idx: usize) -> Result<()> {
        if slot_idx >= LOV_MAX_STRIPE_COUNT as usize {
            return Err(Errno::EINVAL);
        }
        while self.stripes.len() <= slot_idx {
            self.stripes.push(LovOstData::default());
        }
        Ok(())
    }

    /// Point `slot_idx` at `child` on OST `ost_idx`, growing with dummies
    /// as needed, and bump the layout generation.
    pub fn set_slot(&mut self, slot_idx: usize, child: Fid, ost_idx: u16) -> Result<()> {
        self.extend_to(slot_idx)?;
        self.stripes[slot_idx] = LovOstData {
            oi: OstIdLe::from(OstId::from_fid(child)),
            r#gen: 0.into(),
            idx: (ost_idx as u32).into(),
        };
        self.layout_gen = self.layout_gen.wrapping_add(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_NORMAL;

    fn mfid(oid: u32) -> Fid {
        Fid::new(FID_SEQ_NORMAL, oid, 0)
    }

    #[test]
    fn round_trip_v1() {
        let mut lov = LovLayout::new_v1(mfid(9));
        lov.set_slot(0, Fid::idif(11, 0), 0).unwrap();
        lov.set_slot(2, Fid::idif(12, 1), 1).unwrap();
        let parsed = LovLayout::parse(&lov.to_bytes()).unwrap();
        assert_eq!(parsed, lov);
        assert_eq!(parsed.stripe_count(), 3);
        assert!(parsed.stripe(1).unwrap().is_dummy());
        assert_eq!(parsed.stripe_fid(1), None);
        assert_eq!(parsed.stripe_fid(2), Some(Fid::idif(12, 1)));
    }

    #[test]
    fn round_trip_v3_pool() {
        let mut lov = LovLayout::new_v1(mfid(9));
        lov.magic = LOV_MAGIC_V3;
        let mut pool = [0u8; POOL_NAME_LEN];
        pool[..4].copy_from_slice(b"fast");
        lov.pool_name = Some(pool);
        lov.set_slot(0, Fid::idif(5, 0), 0).unwrap();
        let parsed = LovLayout::parse(&lov.to_bytes()).unwrap();
        assert_eq!(parsed.pool_name, Some(pool));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert_eq!(LovLayout::parse(&[0u8; 8]), Err(Errno::EINVAL));
        let mut lov = LovLayout::new_v1(mfid(1));
        lov.set_slot(0, Fid::idif(5, 0), 0).unwrap();
        let mut bytes = lov.to_bytes();
        bytes[0] ^= 0xff; // magic
        assert_eq!(LovLayout::parse(&bytes), Err(Errno::EINVAL));
        let bytes = lov.to_bytes();
        assert_eq!(
            LovLayout::parse(&bytes[..bytes.len() - 1]),
            Err(Errno::EINVAL)
        );
    }

    #[test]
    fn find_stripe_matches_ost_and_fid() {
        let mut lov = LovLayout::new_v1(mfid(1));
        let child = Fid::idif(7, 2);
        lov.set_slot(1, child, 2).unwrap();
        assert_eq!(lov.find_stripe(child, 2), Some(1));
        assert_eq!(lov.find_stripe(child, 3), None);
    }

    #[test]
    fn generation_bumps_on_rewrite() {
        let mut lov = LovLayout::new_v1(mfid(1));
        assert_eq!(lov.layout_gen, 0);
        lov.set_slot(0, Fid::idif(5, 0), 0).unwrap();
        lov.set_slot(0, Fid::idif(6, 0), 0).unwrap();
        assert_eq!(lov.layout_gen, 2);
    }

    #[test]
    fn slot_limit_enforced() {
        let mut lov = LovLayout::new_v1(mfid(1));
        assert_eq!(
            lov.extend_to(LOV_MAX_STRIPE_COUNT as usize),
            Err(Errno::EINVAL)
        );
    }
}
