//! Known/accessed object bitmaps.
//!
//! During a layout run every OST keeps, per FID sequence, two bitmaps over
//! the object-id space: which objects the local scan has seen (*known*) and
//! which objects some metadata inode has claimed (*accessed*). After both
//! sides finish phase-1, `known & !accessed` is exactly the orphan set.
//! The tree grows under a write lock; bit updates take the read lock and
//! use atomic word operations, so the scan and incoming peer notifications
//! never serialize against each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::fid::Fid;

/// Object ids covered by one node: 4096 bytes of bitmap.
pub const NODE_OIDS: u32 = 4096 * 8;
const NODE_WORDS: usize = (NODE_OIDS / 64) as usize;

struct BitSet {
    words: Box<[AtomicU64; NODE_WORDS]>,
    count: AtomicU32,
}

impl BitSet {
    fn new() -> BitSet {
        BitSet {
            words: Box::new([const { AtomicU64::new(0) }; NODE_WORDS]),
            count: AtomicU32::new(0),
        }
    }

    /// Returns true when the bit was newly set.
    fn set(&self, bit: u32) -> bool {
        let mask = 1u64 << (bit % 64);
        let prev = self.words[(bit / 64) as usize].fetch_or(mask, Ordering::AcqRel);
        if prev & mask == 0 {
            self.count.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    fn get(&self, bit: u32) -> bool {
        let mask = 1u64 << (bit % 64);
        self.words[(bit / 64) as usize].load(Ordering::Acquire) & mask != 0
    }

    fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

struct BitmapNode {
    known: BitSet,
    accessed: BitSet,
}

impl BitmapNode {
    fn new() -> BitmapNode {
        BitmapNode {
            known: BitSet::new(),
            accessed: BitSet::new(),
        }
    }
}

/// Per-sequence two-bitmap tree. Keyed by `(seq, first_oid)` where
/// `first_oid` is the object id rounded down to the node size.
#[derive(Default)]
pub struct FidBitmap {
    tree: RwLock<BTreeMap<(u64, u32), Arc<BitmapNode>>>,
}

impl FidBitmap {
    pub fn new() -> FidBitmap {
        FidBitmap::default()
    }

    fn node(&self, fid: Fid) -> (Arc<BitmapNode>, u32) {
        let key = (fid.seq, fid.oid - fid.oid % NODE_OIDS);
        let bit = fid.oid % NODE_OIDS;
        if let Some(node) = self.tree.read().get(&key) {
            return (node.clone(), bit);
        }
        let mut tree = self.tree.write();
        let node = tree.entry(key).or_insert_with(|| Arc::new(BitmapNode::new()));
        (node.clone(), bit)
    }

    pub fn set_known(&self, fid: Fid) {
        let (node, bit) = self.node(fid);
        node.known.set(bit);
    }

    /// Mark an object claimed by a metadata inode. Implies *known*, so the
    /// accessed population can never exceed the known population.
    pub fn set_accessed(&self, fid: Fid) {
        let (node, bit) = self.node(fid);
        node.known.set(bit);
        node.accessed.set(bit);
    }

    pub fn is_known(&self, fid: Fid) -> bool {
        let key = (fid.seq, fid.oid - fid.oid % NODE_OIDS);
        match self.tree.read().get(&key) {
            Some(node) => node.known.get(fid.oid % NODE_OIDS),
            None => false,
        }
    }

    pub fn is_accessed(&self, fid: Fid) -> bool {
        let key = (fid.seq, fid.oid - fid.oid % NODE_OIDS);
        match self.tree.read().get(&key) {
            Some(node) => node.accessed.get(fid.oid % NODE_OIDS),
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.tree.read().len()
    }

    pub fn known_total(&self) -> u64 {
        self.tree
            .read()
            .values()
            .map(|n| n.known.count() as u64)
            .sum()
    }

    pub fn accessed_total(&self) -> u64 {
        self.tree
            .read()
            .values()
            .map(|n| n.accessed.count() as u64)
            .sum()
    }

    /// Drop nodes with nothing left to report. Returns how many were
    /// removed.
    pub fn prune(&self) -> usize {
        let mut tree = self.tree.write();
        let before = tree.len();
        tree.retain(|_, node| node.known.count() > node.accessed.count());
        before - tree.len()
    }

    /// Every known-but-never-accessed object, in FID order.
    pub fn orphans(&self) -> Vec<Fid> {
        let tree = self.tree.read();
        let mut out = Vec::new();
        for (&(seq, first_oid), node) in tree.iter() {
            for word in 0..NODE_WORDS {
                let known = node.known.words[word].load(Ordering::Acquire);
                let accessed = node.accessed.words[word].load(Ordering::Acquire);
                let mut orphan = known & !accessed;
                while orphan != 0 {
                    let bit = orphan.trailing_zeros();
                    orphan &= orphan - 1;
                    let oid = first_oid + word as u32 * 64 + bit;
                    out.push(Fid::new(seq, oid, 0));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_IDIF;

    fn ofid(oid: u32) -> Fid {
        Fid::new(FID_SEQ_IDIF, oid, 0)
    }

    #[test]
    fn known_never_below_accessed() {
        let map = FidBitmap::new();
        map.set_accessed(ofid(5));
        assert!(map.is_known(ofid(5)));
        map.set_known(ofid(9));
        assert!(map.known_total() >= map.accessed_total());
        assert_eq!(map.known_total(), 2);
        assert_eq!(map.accessed_total(), 1);
    }

    #[test]
    fn nodes_split_on_oid_ranges() {
        let map = FidBitmap::new();
        map.set_known(ofid(1));
        map.set_known(ofid(NODE_OIDS + 1));
        map.set_known(Fid::new(FID_SEQ_IDIF + 1, 1, 0));
        assert_eq!(map.node_count(), 3);
    }

    #[test]
    fn prune_keeps_only_reportable_nodes() {
        let map = FidBitmap::new();
        map.set_accessed(ofid(1));
        map.set_known(Fid::new(FID_SEQ_IDIF + 1, 2, 0));
        assert_eq!(map.prune(), 1);
        assert_eq!(map.node_count(), 1);
        assert_eq!(map.orphans(), vec![Fid::new(FID_SEQ_IDIF + 1, 2, 0)]);
    }

    #[test]
    fn orphans_in_fid_order() {
        let map = FidBitmap::new();
        map.set_known(ofid(70));
        map.set_known(ofid(3));
        map.set_known(ofid(NODE_OIDS + 4));
        map.set_accessed(ofid(70));
        assert_eq!(map.orphans(), vec![ofid(3), ofid(NODE_OIDS + 4)]);
    }

    #[test]
    fn double_set_counts_once() {
        let map = FidBitmap::new();
        map.set_known(ofid(8));
        map.set_known(ofid(8));
        assert_eq!(map.known_total(), 1);
    }
}
