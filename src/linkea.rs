//! Link xattr codec.
//!
//! Every object records the `(parent FID, name)` pairs through which it is
//! reachable in a packed xattr: a fixed header followed by variable-length
//! records. Record lengths are big-endian and unaligned, and the parent FID
//! is stored in its canonical big-endian image, so a buffer written on one
//! node walks identically on every other.

use smallvec::SmallVec;
use zerocopy::{FromBytes, IntoBytes};

use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::ondisk::{LINKEA_ENTRY_MIN, LINKEA_MAGIC, LinkEaEntryHead, LinkEaHeader, NAME_MAX};

/// A validated, owned link xattr image.
///
/// Construction via [`LinkEa::parse`] checks every structural invariant, so
/// iteration and mutation never fail on malformed input afterwards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkEa {
    data: Vec<u8>,
}

/// One decoded link record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkEntry<'a> {
    pub parent: Fid,
    pub name: &'a [u8],
}

impl LinkEa {
    /// An image with zero records.
    pub fn empty() -> LinkEa {
        let header = LinkEaHeader {
            magic: LINKEA_MAGIC.into(),
            reccount: 0.into(),
            len: (size_of::<LinkEaHeader>() as u64).into(),
        };
        LinkEa {
            data: header.as_bytes().to_vec(),
        }
    }

    /// An image holding exactly one record.
    pub fn with_entry(parent: Fid, name: &[u8]) -> Result<LinkEa> {
        let mut ea = LinkEa::empty();
        ea.add(parent, name)?;
        Ok(ea)
    }

    /// Validate a raw xattr image. Returns `EINVAL` on any structural
    /// corruption: bad magic, impossible lengths, truncated records, or an
    /// insane parent FID.
    pub fn parse(data: &[u8]) -> Result<LinkEa> {
        let (header, mut rest) =
            LinkEaHeader::read_from_prefix(data).map_err(|_| Errno::EINVAL)?;
        if header.magic.get() != LINKEA_MAGIC {
            return Err(Errno::EINVAL);
        }
        if header.len.get() != data.len() as u64 {
            return Err(Errno::EINVAL);
        }
        let mut count = 0u32;
        while !rest.is_empty() {
            let (head, _) = LinkEaEntryHead::read_from_prefix(rest).map_err(|_| Errno::EINVAL)?;
            let reclen = head.reclen.get() as usize;
            if reclen < LINKEA_ENTRY_MIN || reclen > rest.len() {
                return Err(Errno::EINVAL);
            }
            if !Fid::from_be_bytes(&head.parent).is_sane() {
                return Err(Errno::EINVAL);
            }
            rest = &rest[reclen..];
            count += 1;
        }
        if count != header.reccount.get() {
            return Err(Errno::EINVAL);
        }
        Ok(LinkEa {
            data: data.to_vec(),
        })
    }

    pub fn reccount(&self) -> u32 {
        let (header, _) = LinkEaHeader::read_from_prefix(&self.data).unwrap();
        header.reccount.get()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn entries(&self) -> LinkEaIter<'_> {
        LinkEaIter {
            rest: &self.data[size_of::<LinkEaHeader>()..],
        }
    }

    pub fn first(&self) -> Option<LinkEntry<'_>> {
        self.entries().next()
    }

    pub fn contains(&self, parent: Fid, name: &[u8]) -> bool {
        self.entries()
            .any(|e| e.parent == parent && e.name == name)
    }

    /// Append a record unless an identical one is already present.
    pub fn add(&mut self, parent: Fid, name: &[u8]) -> Result<()> {
        if name.is_empty() || memchr::memchr(0, name).is_some() {
            return Err(Errno::EINVAL);
        }
        if name.len() > NAME_MAX {
            return Err(Errno::ENAMETOOLONG);
        }
        if self.contains(parent, name) {
            return Ok(());
        }
        let head = LinkEaEntryHead {
            reclen: ((size_of::<LinkEaEntryHead>() + name.len()) as u16).into(),
            parent: parent.to_be_bytes(),
        };
        self.data.extend_from_slice(head.as_bytes());
        self.data.extend_from_slice(name);
        self.bump(1);
        Ok(())
    }

    /// Remove the record matching `(parent, name)`. Returns whether one was
    /// removed.
    pub fn remove(&mut self, parent: Fid, name: &[u8]) -> bool {
        self.retain(|e| !(e.parent == parent && e.name == name)) > 0
    }

    /// Keep only records the predicate accepts; returns how many were
    /// dropped. Used to prune repeated or invalid records in place.
    pub fn retain(&mut self, mut keep: impl FnMut(LinkEntry<'_>) -> bool) -> usize {
        let mut kept: SmallVec<[(Fid, Vec<u8>); 4]> = SmallVec::new();
        let mut dropped = 0;
        for e in self.entries() {
            if keep(e) {
                kept.push((e.parent, e.name.to_vec()));
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            let mut fresh = LinkEa::empty();
            for (parent, name) in kept {
                // Names were validated when first added.
                let _ = fresh.add(parent, &name);
            }
            *self = fresh;
        }
        dropped
    }

    fn bump(&mut self, added: u32) {
        let (mut header, _) = LinkEaHeader::read_from_prefix(&self.data).unwrap();
        header.reccount = (header.reccount.get() + added).into();
        header.len = (self.data.len() as u64).into();
        self.data[..size_of::<LinkEaHeader>()].copy_from_slice(header.as_bytes());
    }
}

pub struct LinkEaIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for LinkEaIter<'a> {
    type Item = LinkEntry<'a>;

    fn next(&mut self) -> Option<LinkEntry<'a>> {
        if self.rest.is_empty() {
            return None;
        }
        // The buffer was validated at parse time.
        let (head, _) = LinkEaEntryHead::read_from_prefix(self.rest).ok()?;
        let reclen = head.reclen.get() as usize;
        let name = &self.rest[size_of::<LinkEaEntryHead>()..reclen];
        self.rest = &self.rest[reclen..];
        Some(LinkEntry {
            parent: Fid::from_be_bytes(&head.parent),
            name,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_NORMAL;

    fn pfid(oid: u32) -> Fid {
        Fid::new(FID_SEQ_NORMAL, oid, 0)
    }

    #[test]
    fn add_then_remove_restores_buffer() {
        let mut ea = LinkEa::with_entry(pfid(1), b"alpha").unwrap();
        let before = ea.as_bytes().to_vec();
        ea.add(pfid(2), b"beta").unwrap();
        assert_eq!(ea.reccount(), 2);
        assert!(ea.remove(pfid(2), b"beta"));
        assert_eq!(ea.as_bytes(), &before[..]);
    }

    #[test]
    fn parse_round_trip() {
        let mut ea = LinkEa::empty();
        ea.add(pfid(1), b"a").unwrap();
        ea.add(pfid(2), b"longer-name").unwrap();
        let parsed = LinkEa::parse(ea.as_bytes()).unwrap();
        let entries: Vec<_> = parsed.entries().collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].parent, pfid(1));
        assert_eq!(entries[0].name, b"a");
        assert_eq!(entries[1].name, b"longer-name");
    }

    #[test]
    fn parse_rejects_corruption() {
        let ea = LinkEa::with_entry(pfid(1), b"x").unwrap();
        let good = ea.as_bytes();

        // Bad magic.
        let mut bad = good.to_vec();
        bad[0] ^= 0xff;
        assert_eq!(LinkEa::parse(&bad), Err(Errno::EINVAL));

        // Truncated record.
        assert_eq!(LinkEa::parse(&good[..good.len() - 1]), Err(Errno::EINVAL));

        // Zero parent FID.
        let mut bad = good.to_vec();
        let off = size_of::<LinkEaHeader>() + 2;
        bad[off..off + 16].fill(0);
        assert_eq!(LinkEa::parse(&bad), Err(Errno::EINVAL));
    }

    #[test]
    fn single_entry_exact_reclen() {
        let ea = LinkEa::with_entry(pfid(1), b"x").unwrap();
        let expect = size_of::<LinkEaHeader>() + size_of::<LinkEaEntryHead>() + 1;
        assert_eq!(ea.as_bytes().len(), expect);
        assert_eq!(ea.first().unwrap().name, b"x");
    }

    #[test]
    fn retain_prunes_duplicates() {
        let mut ea = LinkEa::empty();
        ea.add(pfid(1), b"a").unwrap();
        ea.add(pfid(2), b"b").unwrap();
        ea.add(pfid(3), b"c").unwrap();
        let dropped = ea.retain(|e| e.parent == pfid(2));
        assert_eq!(dropped, 2);
        assert_eq!(ea.reccount(), 1);
        assert!(ea.contains(pfid(2), b"b"));
    }

    #[test]
    fn rejects_bad_names() {
        let mut ea = LinkEa::empty();
        assert_eq!(ea.add(pfid(1), b""), Err(Errno::EINVAL));
        assert_eq!(ea.add(pfid(1), b"a\0b"), Err(Errno::EINVAL));
        assert_eq!(ea.add(pfid(1), &[b'n'; 300]), Err(Errno::ENAMETOOLONG));
    }
}
