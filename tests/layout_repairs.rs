//! End-to-end layout repair scenarios on a one-MDT, one-OST cluster.

mod common;

use common::cluster;
use lfsck::lov::LovLayout;
use lfsck::{CheckerKind, Components, Fid, ParamFlags, RunFlags, StartParams, Status, Store};

const SEQ: u64 = 0x2_0000_0400;

fn layout_only(flags: ParamFlags) -> StartParams {
    StartParams {
        components: Components::LAYOUT,
        flags,
        ..StartParams::default()
    }
}

#[test]
fn dangling_reference_requires_create_permission() {
    let c = cluster(1);
    let m = Fid::new(SEQ, 1, 0);
    let o = Fid::idif(1, 0);
    c.mkfile(Fid::ROOT, b"victim", m, 500, 500);
    let mut lov = LovLayout::new_v1(m);
    lov.set_slot(0, o, 0).unwrap();
    c.set_lov(m, &lov);
    c.set_last_id(0, o.seq, 100);

    // Without object creation the inconsistency is only recorded.
    c.run(layout_only(ParamFlags::empty()));
    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_dangling.get(), 0);
    assert!(RunFlags::from_bits_truncate(rec.flags.get()).contains(RunFlags::INCONSISTENT));
    assert!(!c.ost_store(0).exists(o).unwrap());

    // With it, the missing object is fabricated and linked back.
    c.run(layout_only(ParamFlags::CREATE_MDTOBJ));
    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_dangling.get(), 1);
    assert_eq!(c.mdt.query(CheckerKind::Layout), Status::Completed);

    let attr = c.ost_store(0).attr_get(o).unwrap();
    assert_eq!(attr.mode & 0o777, 0o660 | 0o001, "cover-object marker bit");
    assert_eq!((attr.uid, attr.gid), (500, 500));
    assert_eq!(attr.ctime, 0);
    let ff = c.read_filter_fid(0, o);
    assert_eq!(ff.parent_fid(), m);
    assert_eq!(ff.slot(), 0);
}

#[test]
fn unmatched_pair_is_reclaimed() {
    let c = cluster(1);
    let m = Fid::new(SEQ, 1, 0);
    let o = Fid::idif(2, 0);
    let stranger = Fid::new(SEQ, 99, 0);
    c.mkfile(Fid::ROOT, b"owner", m, 1000, 1000);
    let mut lov = LovLayout::new_v1(m);
    lov.set_slot(0, o, 0).unwrap();
    c.set_lov(m, &lov);
    // The object exists but its back pointer names an inode that does not.
    c.mk_ost_object(0, o, Some((stranger, 0)), 0, 0);
    c.set_last_id(0, o.seq, 100);

    c.run(layout_only(ParamFlags::empty()));

    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_unmatched_pair.get(), 1);
    let ff = c.read_filter_fid(0, o);
    assert_eq!(ff.parent_fid(), m);
    assert_eq!(ff.slot(), 0);
    let attr = c.ost_store(0).attr_get(o).unwrap();
    assert_eq!((attr.uid, attr.gid), (1000, 1000), "owner synced from inode");
}

#[test]
fn multiple_referenced_stripe_gets_fresh_object() {
    let c = cluster(1);
    let m = Fid::new(SEQ, 1, 0);
    let m2 = Fid::new(SEQ, 2, 0);
    let o = Fid::idif(3, 0);
    c.mkfile(Fid::ROOT, b"first", m, 0, 0);
    c.mkfile(Fid::ROOT, b"second", m2, 0, 0);
    for fid in [m, m2] {
        let mut lov = LovLayout::new_v1(fid);
        lov.set_slot(0, o, 0).unwrap();
        c.set_lov(fid, &lov);
    }
    // The object itself answers to the first inode.
    c.mk_ost_object(0, o, Some((m, 0)), 0, 0);
    c.set_last_id(0, o.seq, 100);

    c.run(layout_only(ParamFlags::empty()));

    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_multiple_referenced.get(), 1);
    // The claimed owner keeps the shared object untouched.
    assert_eq!(c.read_lov(m).stripe_fid(0), Some(o));
    assert_eq!(c.read_filter_fid(0, o).parent_fid(), m);
    // The other inode was re-striped onto a fresh object.
    let fresh = c.read_lov(m2).stripe_fid(0).unwrap();
    assert_ne!(fresh, o);
    assert!(c.ost_store(0).exists(fresh).unwrap());
    let ff = c.read_filter_fid(0, fresh);
    assert_eq!(ff.parent_fid(), m2);
    assert_eq!(ff.slot(), 0);
}

#[test]
fn orphan_object_rehomed_under_lost_found() {
    let c = cluster(1);
    let o = Fid::idif(7, 0);
    let missing_parent = Fid::new(SEQ, 500, 0);
    // An OST object whose claimed parent never existed, stripe slot 3.
    c.mk_ost_object(0, o, Some((missing_parent, 3)), 42, 43);
    c.set_last_id(0, o.seq, 100);

    c.run(layout_only(ParamFlags::empty()));

    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_orphan.get(), 1);
    assert_eq!(rec.objs_checked_phase2.get(), 1);

    // The claimed parent was recreated under lost+found with the orphan at
    // slot 3 and dummy slots below it.
    let lf = c.lost_found();
    let name = format!("R-{o}-0");
    let parent = c.mdt_store.lookup(lf, name.as_bytes()).unwrap();
    assert_eq!(parent, missing_parent);
    let attr = c.mdt_store.attr_get(parent).unwrap();
    assert!(attr.is_reg());
    assert_eq!((attr.uid, attr.gid), (42, 43));
    let lov = c.read_lov(parent);
    assert_eq!(lov.stripe_count(), 4);
    for slot in 0..3 {
        assert!(lov.stripe(slot).unwrap().is_dummy());
    }
    assert_eq!(lov.stripe_fid(3), Some(o));
}

#[test]
fn referenced_objects_are_not_reported_as_orphans() {
    let c = cluster(1);
    let m = Fid::new(SEQ, 1, 0);
    let o = Fid::idif(9, 0);
    c.mkfile(Fid::ROOT, b"fine", m, 0, 0);
    let mut lov = LovLayout::new_v1(m);
    lov.set_slot(0, o, 0).unwrap();
    c.set_lov(m, &lov);
    c.mk_ost_object(0, o, Some((m, 0)), 0, 0);
    c.set_last_id(0, o.seq, 100);

    c.run(layout_only(ParamFlags::empty()));

    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.repaired_orphan.get(), 0);
    assert_eq!(rec.repaired_unmatched_pair.get(), 0);
    assert_eq!(rec.objs_checked_phase1.get(), 1);
    assert_eq!(c.mdt.query(CheckerKind::Layout), Status::Completed);
    assert!(
        !RunFlags::from_bits_truncate(rec.flags.get()).contains(RunFlags::INCONSISTENT)
    );

    // The slave saw the object and the master claimed it.
    let slave = c.osts[0].0.layout_record().unwrap();
    assert_eq!(slave.objs_checked_phase1.get(), 1);
    assert_eq!(c.osts[0].0.query(CheckerKind::Layout), Status::Completed);
}

#[test]
fn last_id_rebuilt_when_counter_lags() {
    let c = cluster(1);
    let m = Fid::new(SEQ, 1, 0);
    let o = Fid::idif(50, 0);
    c.mkfile(Fid::ROOT, b"ahead", m, 0, 0);
    let mut lov = LovLayout::new_v1(m);
    lov.set_slot(0, o, 0).unwrap();
    c.set_lov(m, &lov);
    c.mk_ost_object(0, o, Some((m, 0)), 0, 0);
    // The counter claims object ids stop at 10, but oid 50 is on disk.
    c.set_last_id(0, o.seq, 10);

    c.run(layout_only(ParamFlags::empty()));

    let slave = c.osts[0].0.layout_record().unwrap();
    assert!(
        RunFlags::from_bits_truncate(slave.flags.get()).contains(RunFlags::CRASHED_LASTID)
    );
    let mut buf = [0u8; 8];
    c.ost_store(0)
        .record_read(Fid::new(o.seq, 0, 0), 0, &mut buf)
        .unwrap();
    assert_eq!(u64::from_le_bytes(buf), 50);
}

#[test]
fn success_count_survives_repeat_runs() {
    let c = cluster(1);
    c.run(layout_only(ParamFlags::empty()));
    c.run(layout_only(ParamFlags::empty()));
    let rec = c.mdt.layout_record().unwrap();
    assert_eq!(rec.success_count.get(), 2);
    assert!(RunFlags::from_bits_truncate(rec.flags.get()).contains(RunFlags::SCANNED_ONCE));
}
