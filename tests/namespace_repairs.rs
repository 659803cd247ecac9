//! End-to-end namespace repair scenarios on a single MDT.

mod common;

use common::cluster;
use lfsck::linkea::LinkEa;
use lfsck::lmv::{self, LmvLayout};
use lfsck::ondisk::{
    LMV_HASH_TYPE_ALL_CHARS, LMV_HASH_TYPE_FNV_1A_64, LMV_HASH_TYPE_UNKNOWN, LmvHashFlags,
    XATTR_LINK, XATTR_LMV,
};
use lfsck::{
    Attr, CheckerKind, Components, DirentType, Fid, ParamFlags, StartParams, Status, Store,
};

const SEQ: u64 = 0x2_0000_0400;

fn namespace_only() -> StartParams {
    StartParams {
        components: Components::NAMESPACE,
        flags: ParamFlags::empty(),
        ..StartParams::default()
    }
}

fn read_linkea(store: &lfsck::MemStore, fid: Fid) -> LinkEa {
    let buf = lfsck::read_xattr(store, fid, XATTR_LINK).unwrap();
    LinkEa::parse(&buf).unwrap()
}

#[test]
fn lost_name_entry_is_restored() {
    let c = cluster(0);
    let d = Fid::new(SEQ, 10, 0);
    let f = Fid::new(SEQ, 11, 0);
    c.mkdir(Fid::ROOT, b"d", d);
    // The file remembers being `d/x`, but `d` has no such entry.
    c.mdt_store.put_object(f, Attr::regular(0o644, 0, 0));
    let ea = LinkEa::with_entry(d, b"x").unwrap();
    c.mdt_store.put_xattr(f, XATTR_LINK, ea.as_bytes());

    c.run(namespace_only());

    assert_eq!(c.mdt_store.lookup(d, b"x"), Ok(f));
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.linkea_repaired.get(), 1);
    assert_eq!(c.mdt.query(CheckerKind::Namespace), Status::Completed);
}

#[test]
fn multiple_linkea_records_reconciled_against_namespace() {
    let c = cluster(0);
    let p1 = Fid::new(SEQ, 20, 0);
    let p2 = Fid::new(SEQ, 21, 0);
    let p3 = Fid::new(SEQ, 99, 0); // never created
    let d = Fid::new(SEQ, 23, 0);
    c.mkdir(Fid::ROOT, b"p1", p1);
    c.mkdir(Fid::ROOT, b"p2", p2);

    // `..` says p1, the linkEA offers p2 and p3; only p2 actually holds a
    // name entry for the directory.
    c.mdt_store.put_object(d, Attr::directory(0o755, 0, 0));
    c.mdt_store.put_entry(d, b".", d, DirentType::Dir);
    c.mdt_store.put_entry(d, b"..", p1, DirentType::Dir);
    c.mdt_store.put_entry(p2, b"a", d, DirentType::Dir);
    let mut ea = LinkEa::with_entry(p2, b"a").unwrap();
    ea.add(p3, b"b").unwrap();
    c.mdt_store.put_xattr(d, XATTR_LINK, ea.as_bytes());

    c.run(namespace_only());

    assert_eq!(c.mdt_store.lookup(d, b".."), Ok(p2));
    let ea = read_linkea(&c.mdt_store, d);
    assert_eq!(ea.reccount(), 1);
    assert!(ea.contains(p2, b"a"));
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.unmatched_pairs_repaired.get(), 1);
    assert_eq!(rec.mul_linked_checked.get(), 1);
}

#[test]
fn corrupted_linkea_is_rebuilt_from_the_name_entry() {
    let c = cluster(0);
    let f = Fid::new(SEQ, 50, 0);
    c.mdt_store.put_object(f, Attr::regular(0o644, 0, 0));
    c.mdt_store.put_entry(Fid::ROOT, b"f", f, DirentType::Reg);
    c.mdt_store.put_xattr(f, XATTR_LINK, b"not a link xattr");

    c.run(namespace_only());

    let ea = read_linkea(&c.mdt_store, f);
    assert!(ea.contains(Fid::ROOT, b"f"));
    assert_eq!(ea.reccount(), 1);
    let rec = c.mdt.namespace_record().unwrap();
    assert!(rec.linkea_repaired.get() >= 1);
}

#[test]
fn dangling_name_entry_fabricates_object_when_allowed() {
    let c = cluster(0);
    let ghost = Fid::new(SEQ, 60, 0);
    c.mdt_store
        .put_entry(Fid::ROOT, b"ghost", ghost, DirentType::Reg);

    // Default policy leaves the entry alone.
    c.run(namespace_only());
    assert!(!c.mdt_store.exists(ghost).unwrap());
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.dangling_repaired.get(), 0);

    // With creation allowed, a placeholder backs the entry.
    c.run(StartParams {
        components: Components::NAMESPACE,
        flags: ParamFlags::CREATE_MDTOBJ,
        ..StartParams::default()
    });
    assert!(c.mdt_store.exists(ghost).unwrap());
    let attr = c.mdt_store.attr_get(ghost).unwrap();
    assert!(attr.is_reg());
    assert_eq!(attr.mode & 0o777, 0o600);
    assert_eq!(attr.ctime, 0);
    let ea = read_linkea(&c.mdt_store, ghost);
    assert!(ea.contains(Fid::ROOT, b"ghost"));
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.dangling_repaired.get(), 1);
}

#[test]
fn mismatched_shard_metadata_is_rewritten() {
    let c = cluster(0);
    let s = Fid::new(SEQ, 30, 0);
    let sh0 = Fid::new(SEQ, 31, 0);
    let sh1 = Fid::new(SEQ, 32, 0);
    c.mkdir(Fid::ROOT, b"s", s);
    let mut master = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_FNV_1A_64);
    master.stripe_fids.push(sh0);
    master.stripe_fids.push(sh1);
    c.mdt_store.put_xattr(s, XATTR_LMV, &master.to_bytes());

    for (idx, shard, count) in [(0u32, sh0, 2u32), (1, sh1, 3)] {
        c.mdt_store.put_object(shard, Attr::directory(0o755, 0, 0));
        c.mdt_store.put_entry(shard, b".", shard, DirentType::Dir);
        c.mdt_store.put_entry(shard, b"..", s, DirentType::Dir);
        c.mdt_store
            .put_entry(s, &lmv::shard_name(shard, idx), shard, DirentType::Dir);
        let slave = LmvLayout::new_stripe(count, 0, LMV_HASH_TYPE_FNV_1A_64);
        c.mdt_store.put_xattr(shard, XATTR_LMV, &slave.to_bytes());
    }

    c.run(namespace_only());

    let buf = lfsck::read_xattr(&c.mdt_store, sh1, XATTR_LMV).unwrap();
    let slave = LmvLayout::parse(&buf).unwrap();
    assert_eq!(slave.stripe_count, 2, "shard metadata realigned to master");
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.striped_shards_scanned.get(), 2);
    assert!(rec.striped_shards_repaired.get() >= 1);
}

#[test]
fn lost_master_lmv_is_rematerialized_from_shards() {
    let c = cluster(0);
    let s = Fid::new(SEQ, 40, 0);
    let sh0 = Fid::new(SEQ, 41, 0);
    let sh1 = Fid::new(SEQ, 42, 0);
    c.mkdir(Fid::ROOT, b"s2", s);

    for (idx, shard) in [(0u32, sh0), (1, sh1)] {
        c.mdt_store.put_object(shard, Attr::directory(0o755, 0, 0));
        c.mdt_store.put_entry(shard, b".", shard, DirentType::Dir);
        c.mdt_store.put_entry(shard, b"..", s, DirentType::Dir);
        c.mdt_store
            .put_entry(s, &lmv::shard_name(shard, idx), shard, DirentType::Dir);
        let slave = LmvLayout::new_stripe(2, 0, LMV_HASH_TYPE_ALL_CHARS);
        c.mdt_store.put_xattr(shard, XATTR_LMV, &slave.to_bytes());
    }

    c.run(namespace_only());

    let buf = lfsck::read_xattr(&c.mdt_store, s, XATTR_LMV).unwrap();
    let master = LmvLayout::parse(&buf).unwrap();
    assert!(master.is_master());
    assert_eq!(master.stripe_count, 2);
    assert_eq!(master.hash_fn(), LMV_HASH_TYPE_ALL_CHARS);
    assert!(master.hash_flags().contains(LmvHashFlags::LOST_LMV));
    assert_eq!(&master.stripe_fids[..], &[sh0, sh1]);
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.striped_dirs_repaired.get(), 1);
}

#[test]
fn misplaced_name_quarantines_the_hash() {
    let c = cluster(0);
    let s = Fid::new(SEQ, 80, 0);
    let sh0 = Fid::new(SEQ, 81, 0);
    let sh1 = Fid::new(SEQ, 82, 0);
    c.mkdir(Fid::ROOT, b"s3", s);
    let mut master = LmvLayout::new_master(2, 0, LMV_HASH_TYPE_FNV_1A_64);
    master.stripe_fids.push(sh0);
    master.stripe_fids.push(sh1);
    c.mdt_store.put_xattr(s, XATTR_LMV, &master.to_bytes());

    for (idx, shard) in [(0u32, sh0), (1, sh1)] {
        let shard_name = lmv::shard_name(shard, idx);
        c.mdt_store.put_object(shard, Attr::directory(0o755, 0, 0));
        c.mdt_store.put_entry(shard, b".", shard, DirentType::Dir);
        c.mdt_store.put_entry(shard, b"..", s, DirentType::Dir);
        c.mdt_store.put_entry(s, &shard_name, shard, DirentType::Dir);
        let slave = LmvLayout::new_stripe(2, 0, LMV_HASH_TYPE_FNV_1A_64);
        c.mdt_store.put_xattr(shard, XATTR_LMV, &slave.to_bytes());
        let ea = LinkEa::with_entry(s, &shard_name).unwrap();
        c.mdt_store.put_xattr(shard, XATTR_LINK, ea.as_bytes());
    }

    // A name that hashes to shard 1, filed under shard 0.
    let name = (0u32..)
        .map(|i| format!("entry{i}").into_bytes())
        .find(|n| lmv::hash_fnv_1a_64(n) % 2 == 1)
        .unwrap();
    let misplaced = Fid::new(SEQ, 90, 0);
    c.mdt_store.put_object(misplaced, Attr::regular(0o644, 0, 0));
    c.mdt_store.put_entry(sh0, &name, misplaced, DirentType::Reg);
    let ea = LinkEa::with_entry(sh0, &name).unwrap();
    c.mdt_store.put_xattr(misplaced, XATTR_LINK, ea.as_bytes());

    c.run(namespace_only());

    // The entry is not migrated; the master's hash is fenced off instead.
    let buf = lfsck::read_xattr(&c.mdt_store, s, XATTR_LMV).unwrap();
    let master = LmvLayout::parse(&buf).unwrap();
    assert_eq!(master.hash_fn(), LMV_HASH_TYPE_UNKNOWN);
    assert!(master.hash_flags().contains(LmvHashFlags::BAD_TYPE));
    assert!(master.hash_quarantined());
    assert_eq!(c.mdt_store.lookup(sh0, &name), Ok(misplaced));
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.name_hash_repaired.get(), 1);

    // A second run recognizes the marker and leaves the verdict alone.
    c.run(namespace_only());
    let buf = lfsck::read_xattr(&c.mdt_store, s, XATTR_LMV).unwrap();
    assert!(LmvLayout::parse(&buf).unwrap().hash_quarantined());
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.name_hash_repaired.get(), 0);
}

#[test]
fn invalid_master_hash_is_settled_from_shards() {
    let c = cluster(0);
    let s = Fid::new(SEQ, 85, 0);
    let sh0 = Fid::new(SEQ, 86, 0);
    let sh1 = Fid::new(SEQ, 87, 0);
    c.mkdir(Fid::ROOT, b"s4", s);
    // The master claims a hash function that does not exist.
    let mut master = LmvLayout::new_master(2, 0, 0x7777);
    master.stripe_fids.push(sh0);
    master.stripe_fids.push(sh1);
    c.mdt_store.put_xattr(s, XATTR_LMV, &master.to_bytes());

    for (idx, shard) in [(0u32, sh0), (1, sh1)] {
        c.mdt_store.put_object(shard, Attr::directory(0o755, 0, 0));
        c.mdt_store.put_entry(shard, b".", shard, DirentType::Dir);
        c.mdt_store.put_entry(shard, b"..", s, DirentType::Dir);
        c.mdt_store
            .put_entry(s, &lmv::shard_name(shard, idx), shard, DirentType::Dir);
        let slave = LmvLayout::new_stripe(2, 0, LMV_HASH_TYPE_ALL_CHARS);
        c.mdt_store.put_xattr(shard, XATTR_LMV, &slave.to_bytes());
    }

    c.run(namespace_only());

    // The first shard with a valid hash type speaks for the directory.
    let buf = lfsck::read_xattr(&c.mdt_store, s, XATTR_LMV).unwrap();
    let master = LmvLayout::parse(&buf).unwrap();
    assert_eq!(master.hash_fn(), LMV_HASH_TYPE_ALL_CHARS);
    assert!(!master.hash_quarantined());
    let rec = c.mdt.namespace_record().unwrap();
    assert!(rec.bad_type_repaired.get() >= 1);
    // The shard images were left alone while the master was unusable.
    let buf = lfsck::read_xattr(&c.mdt_store, sh0, XATTR_LMV).unwrap();
    assert_eq!(
        LmvLayout::parse(&buf).unwrap().hash_fn(),
        LMV_HASH_TYPE_ALL_CHARS
    );
}

#[test]
fn dump_reports_counters_and_status() {
    let c = cluster(0);
    let d = Fid::new(SEQ, 70, 0);
    c.mkdir(Fid::ROOT, b"plain", d);
    c.run(namespace_only());
    // The checkers are torn down with the run; the record answers from
    // disk.
    assert_eq!(c.mdt.query(CheckerKind::Namespace), Status::Completed);
    let rec = c.mdt.namespace_record().unwrap();
    assert_eq!(rec.items_failed.get(), 0);
    assert!(rec.dirs_checked.get() >= 2);
    assert!(rec.items_checked.get() >= 2);
}
