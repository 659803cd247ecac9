//! Striped-file layout checking.
//!
//! The layout component verifies the two-way references between metadata
//! inodes and the OST objects their layouts point at. The master half runs
//! on each MDT and walks layouts; the slave half runs on each OST, builds
//! the known/accessed bitmaps, and serves the orphan index for phase-2.

mod master;
mod slave;

pub(crate) use master::LayoutMaster;
pub(crate) use slave::LayoutSlave;

use std::time::Duration;

use zerocopy::FromBytes;

use crate::controller::dump_time;
use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::lov::LovLayout;
use crate::ondisk::{
    FilterFid, FilterFidOld, LAYOUT_MAGIC, LayoutRecord, RunFlags, XATTR_FILTER_FID, XATTR_LOV,
};
use crate::store::{Store, read_xattr};

/// One stripe reference prefetched for the assistant.
#[derive(Clone, Copy, Debug)]
pub(crate) struct LayoutReq {
    pub parent: Fid,
    pub child: Fid,
    pub ost_idx: u16,
    pub slot: u16,
}

/// Verdict on a `(parent, child)` pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum LayoutInconsistency {
    Dangling,
    UnmatchedPair,
    MultipleReferenced,
    InconsistentOwner,
}

/// What the child's filter-fid xattr had to say.
pub(crate) enum FfState {
    Absent,
    BadSize,
    /// Parent reference; `ver` carries the stripe slot.
    Parent(Fid),
}

pub(crate) fn read_filter_fid(store: &dyn Store, fid: Fid) -> Result<FfState> {
    let buf = match read_xattr(store, fid, XATTR_FILTER_FID) {
        Ok(buf) => buf,
        Err(Errno::ENODATA) => return Ok(FfState::Absent),
        Err(e) => return Err(e),
    };
    if buf.len() == size_of::<FilterFid>() {
        let (ff, _) = FilterFid::read_from_prefix(&buf).map_err(|_| Errno::EINVAL)?;
        Ok(FfState::Parent(ff.parent.into()))
    } else if buf.len() == size_of::<FilterFidOld>() {
        let (ff, _) = FilterFidOld::read_from_prefix(&buf).map_err(|_| Errno::EINVAL)?;
        Ok(FfState::Parent(ff.parent.into()))
    } else {
        Ok(FfState::BadSize)
    }
}

/// Read and parse an inode's layout xattr. `None` when there is none.
pub(crate) fn read_lov(store: &dyn Store, fid: Fid) -> Result<Option<LovLayout>> {
    match read_xattr(store, fid, XATTR_LOV) {
        Ok(buf) => Ok(Some(LovLayout::parse(&buf)?)),
        Err(Errno::ENODATA) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Objects fabricated to cover a dangling reference carry this marker in
/// their mode so a later orphan pass can tell them from real data.
pub(crate) const CREATED_MODE_MARK: u32 = libc::S_IXOTH;

pub(crate) const LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// A pristine record, carrying the longitudinal fields over from the
/// previous incarnation unless `init` discards them.
pub(crate) fn fresh_record(prev: &LayoutRecord, init: bool) -> LayoutRecord {
    let mut rec = LayoutRecord {
        magic: LAYOUT_MAGIC.into(),
        ..LayoutRecord::default()
    };
    if !init {
        rec.success_count = prev.success_count;
        rec.time_last_complete = prev.time_last_complete;
    }
    rec
}

pub(crate) fn dump_record(out: &mut String, rec: &LayoutRecord, name: &str) {
    let status =
        crate::checker::Status::try_from(rec.status.get()).unwrap_or(crate::checker::Status::Init);
    out.push_str(&format!("name: {name}\n"));
    out.push_str(&format!("magic: {:#x}\n", rec.magic.get()));
    out.push_str(&format!("status: {}\n", status.name()));
    out.push_str(&format!(
        "flags: {:?}\n",
        RunFlags::from_bits_truncate(rec.flags.get())
    ));
    dump_time(out, "time_since_last_completed", rec.time_last_complete.get());
    dump_time(out, "time_since_latest_start", rec.time_latest_start.get());
    dump_time(out, "time_since_last_checkpoint", rec.time_last_checkpoint.get());
    out.push_str(&format!(
        "latest_start_position: {}\n",
        rec.pos_latest_start.get()
    ));
    out.push_str(&format!(
        "last_checkpoint_position: {}\n",
        rec.pos_last_checkpoint.get()
    ));
    out.push_str(&format!(
        "first_failure_position: {}\n",
        rec.pos_first_inconsistent.get()
    ));
    out.push_str(&format!("success_count: {}\n", rec.success_count.get()));
    out.push_str(&format!("run_time_phase1: {} seconds\n", rec.run_time_phase1.get()));
    out.push_str(&format!("run_time_phase2: {} seconds\n", rec.run_time_phase2.get()));
    out.push_str(&format!("checked_phase1: {}\n", rec.objs_checked_phase1.get()));
    out.push_str(&format!("checked_phase2: {}\n", rec.objs_checked_phase2.get()));
    out.push_str(&format!("repaired_dangling: {}\n", rec.repaired_dangling.get()));
    out.push_str(&format!(
        "repaired_unmatched_pair: {}\n",
        rec.repaired_unmatched_pair.get()
    ));
    out.push_str(&format!(
        "repaired_multiple_referenced: {}\n",
        rec.repaired_multiple_referenced.get()
    ));
    out.push_str(&format!("repaired_orphan: {}\n", rec.repaired_orphan.get()));
    out.push_str(&format!(
        "repaired_inconsistent_owner: {}\n",
        rec.repaired_inconsistent_owner.get()
    ));
    out.push_str(&format!("repaired_others: {}\n", rec.repaired_others.get()));
    out.push_str(&format!("failed_phase1: {}\n", rec.objs_failed_phase1.get()));
    out.push_str(&format!("failed_phase2: {}\n", rec.objs_failed_phase2.get()));
    out.push_str(&format!("skipped: {}\n", rec.objs_skipped.get()));
}
