//! Layout checking, MDT side.
//!
//! Phase-1 walks every regular inode's layout and prefetches one request
//! per stripe; the assistant verifies that the referenced OST object
//! exists, points back at this inode and slot, and carries the owner the
//! inode says. Phase-2 consumes each OST's orphan index and re-attaches
//! what can be re-attached, parking the rest under lost+found.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;
use zerocopy::IntoBytes;

use crate::checker::{Checker, CheckerKind, Position, StartParams, Status};
use crate::checkpoint::{CheckFile, now_secs};
use crate::controller::{Instance, LAYOUT_FILE_FID};
use crate::errno::{Errno, Result};
use crate::fid::{Fid, ResId};
use crate::lockmgr::{LockBits, LockMode};
use crate::lov::LovLayout;
use crate::notify::{Event, LfsckRequest, OrphanRec};
use crate::ondisk::{LAYOUT_MAGIC, LOV_PATTERN_RAID0, LayoutRecord, RunFlags, XATTR_LOV};
use crate::pipeline::{AssistantHandler, Pipeline, assistant_loop};
use crate::registry::TgtDesc;
use crate::store::{Attr, AttrMask, DirentType, XattrFlags};

use super::{
    CREATED_MODE_MARK, FfState, LOCK_TIMEOUT, LayoutInconsistency, LayoutReq, dump_record,
    fresh_record, read_filter_fid, read_lov,
};

pub(crate) struct LayoutMaster {
    inst: Arc<Instance>,
    file: Arc<CheckFile<LayoutRecord>>,
    pipeline: Arc<Pipeline<LayoutReq>>,
    assistant: Mutex<Option<JoinHandle<()>>>,
}

impl LayoutMaster {
    pub fn new(inst: Arc<Instance>) -> LayoutMaster {
        let file = Arc::new(CheckFile::new(
            inst.store.clone(),
            LAYOUT_FILE_FID,
            LayoutRecord {
                magic: LAYOUT_MAGIC.into(),
                ..LayoutRecord::default()
            },
        ));
        let windows = inst.params().async_windows.max(2) as u32;
        LayoutMaster {
            inst,
            file,
            pipeline: Arc::new(Pipeline::new(windows)),
            assistant: Mutex::new(None),
        }
    }

    fn note_inconsistency(&self) {
        note_inconsistency(&self.file, &self.inst);
    }

    /// The embedded object id of the layout must name the inode itself.
    fn repair_bad_oi(&self, fid: Fid, mut lov: LovLayout) -> Result<()> {
        self.note_inconsistency();
        if self.inst.dryrun() {
            return Ok(());
        }
        let res = ResId::from_fid(fid);
        let lock = self.inst.lockmgr.enqueue(
            res,
            LockBits::LAYOUT | LockBits::XATTR,
            LockMode::Ex,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            // Somebody may have rewritten the layout while we waited.
            let Some(cur) = read_lov(self.inst.store.as_ref(), fid)? else {
                return Ok(());
            };
            if cur.oi == crate::fid::OstId::from_fid(fid) {
                return Ok(());
            }
            lov.oi = crate::fid::OstId::from_fid(fid);
            let bytes = lov.to_bytes();
            let mut tx = self.inst.store.tx_create();
            tx.declare_xattr_set(fid, XATTR_LOV, bytes.len())?;
            tx.start()?;
            tx.xattr_set(fid, XATTR_LOV, &bytes, XattrFlags::REPLACE)?;
            tx.commit()?;
            self.file.update(|rec| {
                rec.repaired_others = (rec.repaired_others.get() + 1).into();
            });
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }
}

impl Checker for LayoutMaster {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Layout
    }

    fn reset(&self, init: bool) -> Result<()> {
        let prev = self.file.read();
        self.file.update(|rec| *rec = fresh_record(&prev, init));
        self.file.flush()
    }

    fn fail(&self, _new_checked: bool) {
        self.file.update(|rec| {
            rec.objs_failed_phase1 = (rec.objs_failed_phase1.get() + 1).into();
        });
    }

    fn checkpoint(&self, init: bool) -> Result<()> {
        // The record must not claim a position the assistant has not
        // caught up to yet.
        self.pipeline.wait_drained();
        let pos = self.inst.pos_current.lock().oit_cookie;
        self.file.update(|rec| {
            let now = now_secs();
            if init {
                rec.pos_latest_start = pos.into();
                rec.time_latest_start = now.into();
            } else {
                rec.pos_last_checkpoint = pos.into();
                rec.time_last_checkpoint = now.into();
                rec.run_time_phase1 =
                    (now.saturating_sub(rec.time_latest_start.get()) as u32).into();
            }
        });
        self.file.flush()
    }

    fn prep(&self, params: &StartParams) -> Result<Position> {
        let loaded = self.file.load()?;
        let rec = self.file.read();
        let status = Status::try_from(rec.status.get()).unwrap_or(Status::Init);
        let reset = !loaded
            || rec.magic.get() != LAYOUT_MAGIC
            || params.flags.contains(crate::ondisk::ParamFlags::RESET)
            || matches!(status, Status::Completed | Status::Partial);
        if reset {
            self.reset(false)?;
        }

        let rec = self.file.read();
        let mut start = rec.pos_last_checkpoint.get();
        if self
            .inst
            .drop_dryrun
            .load(std::sync::atomic::Ordering::Acquire)
        {
            let first = rec.pos_first_inconsistent.get();
            if first != 0 {
                start = start.min(first);
            }
        }
        self.file.update(|rec| {
            rec.status = u32::from(Status::ScanningPhase1).into();
            rec.time_latest_start = now_secs().into();
            rec.pos_latest_start = start.into();
        });
        self.file.flush()?;

        let handler = MasterHandler {
            inst: self.inst.clone(),
            file: self.file.clone(),
            processed: BTreeSet::new(),
        };
        let pipeline = self.pipeline.clone();
        let handle = std::thread::Builder::new()
            .name("lfsck_layout".into())
            .spawn(move || assistant_loop(pipeline, handler))
            .map_err(|_| Errno::ENOMEM)?;
        *self.assistant.lock() = Some(handle);

        Ok(Position {
            oit_cookie: start,
            ..Position::ZERO
        })
    }

    fn exec_oit(&self, fid: Fid) -> Result<()> {
        let attr = match self.inst.store.attr_get(fid) {
            Ok(attr) => attr,
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(e),
        };
        if !attr.is_reg() {
            return Ok(());
        }
        let lov = match read_lov(self.inst.store.as_ref(), fid) {
            Ok(None) => return Ok(()),
            Ok(Some(lov)) => {
                self.file.update(|rec| {
                    rec.objs_checked_phase1 = (rec.objs_checked_phase1.get() + 1).into();
                });
                lov
            }
            Err(Errno::EINVAL) => {
                self.file.update(|rec| {
                    rec.objs_checked_phase1 = (rec.objs_checked_phase1.get() + 1).into();
                    rec.objs_failed_phase1 = (rec.objs_failed_phase1.get() + 1).into();
                });
                self.note_inconsistency();
                if self.inst.failout() {
                    return Err(Errno::EINVAL);
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if lov.pattern != LOV_PATTERN_RAID0 {
            // Other patterns are outside this checker's reach.
            self.file.update(|rec| {
                rec.objs_skipped = (rec.objs_skipped.get() + 1).into();
            });
            return Ok(());
        }
        if lov.oi != crate::fid::OstId::from_fid(fid) {
            self.repair_bad_oi(fid, lov.clone())?;
        }
        for i in 0..lov.stripes.len() {
            let Some(child) = lov.stripe_fid(i) else {
                continue;
            };
            let ost_idx = lov.stripes[i].idx.get() as u16;
            if self.inst.registry.ost(ost_idx).is_none() {
                self.file.update(|rec| {
                    rec.objs_skipped = (rec.objs_skipped.get() + 1).into();
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
                continue;
            }
            self.pipeline.push(LayoutReq {
                parent: fid,
                child,
                ost_idx,
                slot: i as u16,
            })?;
        }
        Ok(())
    }

    fn exec_dir(&self, _dir: Fid, _ent: &crate::store::Dirent) -> Result<()> {
        Ok(())
    }

    fn post(&self, result: i32) -> Result<()> {
        self.pipeline.post(result)
    }

    fn double_scan(&self) -> Result<()> {
        self.pipeline.double_scan()
    }

    fn dump(&self, out: &mut String) -> Result<()> {
        let rec = self.file.read();
        dump_record(out, &rec, self.kind().name());
        out.push_str(&format!("prefetched: {}\n", self.pipeline.prefetched()));
        Ok(())
    }

    fn in_notify(&self, req: &LfsckRequest) -> Result<()> {
        match req.event {
            Event::Phase1Done => {
                if let Some(tgt) = self.inst.registry.ost(req.index) {
                    tgt.set_layout_done(true);
                    tgt.layout_gen
                        .fetch_add(1, std::sync::atomic::Ordering::AcqRel);
                }
                self.pipeline.poke();
                Ok(())
            }
            Event::PeerExit => {
                if let Some(tgt) = self.inst.registry.ost(req.index) {
                    tgt.set_layout_done(true);
                }
                self.file.update(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
                self.pipeline.poke();
                Ok(())
            }
            Event::LastIdRebuilding => {
                warn!("lfsck_layout: OST{:04x} is rebuilding its LAST_ID files", req.index);
                self.file.update(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::CRASHED_LASTID.bits()).into();
                });
                Ok(())
            }
            Event::LastIdRebuilt => {
                info!("lfsck_layout: OST{:04x} rebuilt its LAST_ID files", req.index);
                Ok(())
            }
            Event::Stop => {
                self.file.update(|rec| {
                    rec.status = u32::from(Status::CoStopped).into();
                });
                let _ = self.file.flush();
                self.pipeline.request_exit();
                Ok(())
            }
            _ => Err(Errno::ENOTSUP),
        }
    }

    fn query(&self) -> Status {
        Status::try_from(self.file.read().status.get()).unwrap_or(Status::Init)
    }

    fn quit(&self) {
        self.pipeline.request_exit();
        if let Some(handle) = self.assistant.lock().take() {
            let _ = handle.join();
        }
    }
}

fn note_inconsistency(file: &CheckFile<LayoutRecord>, inst: &Instance) {
    let pos = inst.pos_current.lock().oit_cookie;
    file.update(|rec| {
        rec.flags = (rec.flags.get() | RunFlags::INCONSISTENT.bits()).into();
        if rec.pos_first_inconsistent.get() == 0 {
            rec.pos_first_inconsistent = pos.into();
        }
    });
}

/// The assistant half of the master checker.
struct MasterHandler {
    inst: Arc<Instance>,
    file: Arc<CheckFile<LayoutRecord>>,
    /// OSTs whose orphan index has been consumed this run.
    processed: BTreeSet<u16>,
}

impl MasterHandler {
    fn bump(&self, f: impl FnOnce(&mut LayoutRecord)) {
        self.file.update(f);
    }

    fn mark_incomplete(&self) {
        self.bump(|rec| {
            rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
            rec.objs_skipped = (rec.objs_skipped.get() + 1).into();
        });
    }

    fn broadcast(&self, event: Event, status: i32) {
        let mut req = LfsckRequest::new(event, CheckerKind::Layout, self.inst.node_index);
        req.status = status;
        for tgt in self.inst.registry.osts() {
            if let Err(e) = tgt.link.notify(&req) {
                warn!(
                    "lfsck_layout: cannot notify OST{:04x} of {:?}: {}",
                    tgt.index, event, e
                );
                self.bump(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
            }
        }
    }

    /// Classify one `(parent, child)` pair by reading both sides.
    fn classify(
        &self,
        req: &LayoutReq,
        tgt: &TgtDesc,
        parent_attr: &Attr,
    ) -> Result<Option<LayoutInconsistency>> {
        let child_attr = match tgt.store.attr_get(req.child) {
            Ok(attr) => attr,
            Err(Errno::ENOENT) => return Ok(Some(LayoutInconsistency::Dangling)),
            Err(e) => return Err(e),
        };
        let owner_differs =
            child_attr.uid != parent_attr.uid || child_attr.gid != parent_attr.gid;
        match read_filter_fid(tgt.store.as_ref(), req.child)? {
            FfState::Absent => {
                if child_attr.size == 0 && child_attr.blocks == 0 {
                    // Pre-created and never written; only the owner can be
                    // wrong.
                    if owner_differs {
                        Ok(Some(LayoutInconsistency::InconsistentOwner))
                    } else {
                        Ok(None)
                    }
                } else {
                    Ok(Some(LayoutInconsistency::UnmatchedPair))
                }
            }
            FfState::BadSize => Ok(Some(LayoutInconsistency::UnmatchedPair)),
            FfState::Parent(claimed) => {
                let claimed_parent = Fid::new(claimed.seq, claimed.oid, 0);
                let claimed_slot = claimed.ver;
                if claimed_parent.is_zero() || !claimed_parent.is_sane() {
                    return Ok(Some(LayoutInconsistency::UnmatchedPair));
                }
                if claimed_parent == req.parent && claimed_slot == req.slot as u32 {
                    if owner_differs {
                        return Ok(Some(LayoutInconsistency::InconsistentOwner));
                    }
                    return Ok(None);
                }
                // Somebody else claims this object. If that somebody's
                // layout really references it, both inodes share the
                // stripe.
                if !self.inst.store.exists(claimed_parent)? {
                    return Ok(Some(LayoutInconsistency::UnmatchedPair));
                }
                match read_lov(self.inst.store.as_ref(), claimed_parent) {
                    Ok(Some(lov)) if lov.find_stripe(req.child, req.ost_idx).is_some() => {
                        Ok(Some(LayoutInconsistency::MultipleReferenced))
                    }
                    Ok(_) | Err(Errno::EINVAL) => Ok(Some(LayoutInconsistency::UnmatchedPair)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// The parent's layout still references `child` at `slot`?
    fn slot_still_references(&self, req: &LayoutReq) -> Result<bool> {
        match read_lov(self.inst.store.as_ref(), req.parent) {
            Ok(Some(lov)) => Ok(lov.stripe_fid(req.slot as usize) == Some(req.child)),
            _ => Ok(false),
        }
    }

    fn repair_dangling(&self, req: &LayoutReq, tgt: &TgtDesc, parent_attr: &Attr) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() || !self.inst.create_allowed() {
            return Ok(());
        }
        let lock = self.inst.lockmgr.enqueue(
            ResId::from_fid(req.parent),
            LockBits::LAYOUT | LockBits::XATTR,
            LockMode::Pr,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            if !self.slot_still_references(req)? {
                return Ok(());
            }
            let attr = Attr {
                mode: libc::S_IFREG | 0o660 | CREATED_MODE_MARK,
                nlink: 1,
                uid: parent_attr.uid,
                gid: parent_attr.gid,
                size: 0,
                blocks: 0,
                ctime: 0,
            };
            let ff = crate::ondisk::FilterFid::new(req.parent, req.slot as u32);
            let mut tx = tgt.store.tx_create();
            tx.declare_create(req.child)?;
            tx.declare_xattr_set(req.child, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
            tx.start()?;
            tx.create(req.child, &attr)?;
            tx.xattr_set(
                req.child,
                crate::ondisk::XATTR_FILTER_FID,
                ff.as_bytes(),
                XattrFlags::empty(),
            )?;
            tx.commit()?;
            self.bump(|rec| {
                rec.repaired_dangling = (rec.repaired_dangling.get() + 1).into();
            });
            info!(
                "lfsck_layout: created OST{:04x} object {} to cover dangling stripe {} of {}",
                req.ost_idx, req.child, req.slot, req.parent
            );
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    fn repair_unmatched(&self, req: &LayoutReq, tgt: &TgtDesc, parent_attr: &Attr) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(());
        }
        let lock = self.inst.lockmgr.enqueue(
            ResId::from_fid(req.child),
            LockBits::XATTR,
            LockMode::Ex,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            if !self.slot_still_references(req)? {
                return Ok(());
            }
            if !self.inst.store.exists(req.parent)? {
                return Ok(());
            }
            let ff = crate::ondisk::FilterFid::new(req.parent, req.slot as u32);
            let owner = Attr {
                uid: parent_attr.uid,
                gid: parent_attr.gid,
                ..Attr::default()
            };
            let mut tx = tgt.store.tx_create();
            tx.declare_xattr_set(req.child, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
            tx.declare_attr_set(req.child)?;
            tx.start()?;
            tx.xattr_set(
                req.child,
                crate::ondisk::XATTR_FILTER_FID,
                ff.as_bytes(),
                XattrFlags::empty(),
            )?;
            tx.attr_set(req.child, &owner, AttrMask::UID | AttrMask::GID)?;
            tx.commit()?;
            self.bump(|rec| {
                rec.repaired_unmatched_pair = (rec.repaired_unmatched_pair.get() + 1).into();
            });
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    /// Two inodes reference the same OST object: keep it with the claimed
    /// owner, allocate a fresh object for this inode's slot.
    fn repair_multiple_referenced(
        &self,
        req: &LayoutReq,
        tgt: &TgtDesc,
        parent_attr: &Attr,
    ) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(());
        }
        let lock = self.inst.lockmgr.enqueue(
            ResId::from_fid(req.parent),
            LockBits::LAYOUT | LockBits::XATTR,
            LockMode::Ex,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            let Some(mut lov) = read_lov(self.inst.store.as_ref(), req.parent)? else {
                return Ok(());
            };
            if lov.stripe_fid(req.slot as usize) != Some(req.child) {
                return Ok(());
            }
            let fresh = tgt.store.alloc_fid()?;
            let attr = Attr {
                mode: libc::S_IFREG | 0o660 | CREATED_MODE_MARK,
                nlink: 1,
                uid: parent_attr.uid,
                gid: parent_attr.gid,
                size: 0,
                blocks: 0,
                ctime: 0,
            };
            let ff = crate::ondisk::FilterFid::new(req.parent, req.slot as u32);
            let mut tx = tgt.store.tx_create();
            tx.declare_create(fresh)?;
            tx.declare_xattr_set(fresh, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
            tx.start()?;
            tx.create(fresh, &attr)?;
            tx.xattr_set(
                fresh,
                crate::ondisk::XATTR_FILTER_FID,
                ff.as_bytes(),
                XattrFlags::empty(),
            )?;
            tx.commit()?;

            lov.set_slot(req.slot as usize, fresh, req.ost_idx)?;
            let bytes = lov.to_bytes();
            let mut tx = self.inst.store.tx_create();
            tx.declare_xattr_set(req.parent, XATTR_LOV, bytes.len())?;
            tx.start()?;
            tx.xattr_set(req.parent, XATTR_LOV, &bytes, XattrFlags::REPLACE)?;
            tx.commit()?;
            self.bump(|rec| {
                rec.repaired_multiple_referenced =
                    (rec.repaired_multiple_referenced.get() + 1).into();
            });
            info!(
                "lfsck_layout: re-striped slot {} of {} to fresh object {}",
                req.slot, req.parent, fresh
            );
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    fn repair_owner(&self, req: &LayoutReq, tgt: &TgtDesc, parent_attr: &Attr) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(());
        }
        let lock = self.inst.lockmgr.enqueue(
            ResId::from_fid(req.parent),
            LockBits::UPDATE,
            LockMode::Pr,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            // The owner may have been synced by a concurrent setattr.
            let parent_now = match self.inst.store.attr_get(req.parent) {
                Ok(attr) => attr,
                Err(Errno::ENOENT) => return Ok(()),
                Err(e) => return Err(e),
            };
            let child_now = match tgt.store.attr_get(req.child) {
                Ok(attr) => attr,
                Err(Errno::ENOENT) => return Ok(()),
                Err(e) => return Err(e),
            };
            if child_now.uid == parent_now.uid && child_now.gid == parent_now.gid {
                return Ok(());
            }
            let owner = Attr {
                uid: parent_now.uid,
                gid: parent_now.gid,
                ..Attr::default()
            };
            let mut tx = tgt.store.tx_create();
            tx.declare_attr_set(req.child)?;
            tx.start()?;
            tx.attr_set(req.child, &owner, AttrMask::UID | AttrMask::GID)?;
            tx.commit()?;
            self.bump(|rec| {
                rec.repaired_inconsistent_owner =
                    (rec.repaired_inconsistent_owner.get() + 1).into();
            });
            let _ = parent_attr;
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    // Phase-2: orphan handling.

    /// Pick a free lost+found name with the given prefix.
    fn free_name(&self, lf: Fid, prefix: &str, tag: Fid) -> Result<Vec<u8>> {
        for k in 0..0x10000 {
            let name = format!("{prefix}-{tag}-{k}").into_bytes();
            match self.inst.store.lookup(lf, &name) {
                Err(Errno::ENOENT) => return Ok(name),
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(Errno::ENOSPC)
    }

    /// Create a lost+found inode whose layout points at the orphan, and
    /// re-point the orphan's filter-fid at it.
    fn lost_found_create(
        &self,
        prefix: &str,
        rec: &OrphanRec,
        tgt: &TgtDesc,
        slot: u16,
        explicit_fid: Option<Fid>,
    ) -> Result<()> {
        let lf = self.inst.lost_found_dir()?;
        let name = self.free_name(lf, prefix, rec.fid)?;
        let parent = match explicit_fid {
            Some(fid) => fid,
            None => self.inst.store.alloc_fid()?,
        };
        let mut lov = LovLayout::new_v1(parent);
        lov.set_slot(slot as usize, rec.fid, tgt.index)?;
        let bytes = lov.to_bytes();
        let attr = Attr {
            mode: libc::S_IFREG | 0o600,
            nlink: 1,
            uid: rec.uid,
            gid: rec.gid,
            size: 0,
            blocks: 0,
            ctime: 0,
        };
        let mut tx = self.inst.store.tx_create();
        tx.declare_create(parent)?;
        tx.declare_insert(lf, &name)?;
        tx.declare_xattr_set(parent, XATTR_LOV, bytes.len())?;
        tx.start()?;
        tx.create(parent, &attr)?;
        tx.insert(lf, &name, parent, DirentType::Reg)?;
        tx.xattr_set(parent, XATTR_LOV, &bytes, XattrFlags::empty())?;
        tx.commit()?;

        let ff = crate::ondisk::FilterFid::new(parent, slot as u32);
        let mut tx = tgt.store.tx_create();
        tx.declare_xattr_set(rec.fid, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
        tx.start()?;
        tx.xattr_set(
            rec.fid,
            crate::ondisk::XATTR_FILTER_FID,
            ff.as_bytes(),
            XattrFlags::empty(),
        )?;
        tx.commit()?;

        self.bump(|rec| {
            rec.repaired_orphan = (rec.repaired_orphan.get() + 1).into();
        });
        info!(
            "lfsck_layout: re-homed orphan {} as {}/{}",
            rec.fid,
            lf,
            String::from_utf8_lossy(&name)
        );
        Ok(())
    }

    /// The conflicting occupant of the slot was LFSCK-created: hand it to a
    /// fresh lost+found inode and give the slot to the real orphan.
    fn exchange_create(
        &self,
        parent: Fid,
        mut lov: LovLayout,
        slot: u16,
        rec: &OrphanRec,
        conflicting: Fid,
        tgt: &TgtDesc,
    ) -> Result<()> {
        let lf = self.inst.lost_found_dir()?;
        let fresh = self.inst.store.alloc_fid()?;
        let name = {
            let mut base = format!("E-{fresh}-x{slot:x}").into_bytes();
            if self.inst.store.lookup(lf, &base).is_ok() {
                base = self.free_name(lf, "E", fresh)?;
            }
            base
        };

        let mut cover_lov = LovLayout::new_v1(fresh);
        cover_lov.set_slot(slot as usize, conflicting, tgt.index)?;
        let cover_bytes = cover_lov.to_bytes();
        lov.set_slot(slot as usize, rec.fid, tgt.index)?;
        let parent_bytes = lov.to_bytes();
        let attr = Attr {
            mode: libc::S_IFREG | 0o600,
            nlink: 1,
            uid: rec.uid,
            gid: rec.gid,
            size: 0,
            blocks: 0,
            ctime: 0,
        };

        // One transaction, two layout writes: the new cover inode and the
        // re-pointed parent slot.
        let mut tx = self.inst.store.tx_create();
        tx.declare_create(fresh)?;
        tx.declare_insert(lf, &name)?;
        tx.declare_xattr_set(fresh, XATTR_LOV, cover_bytes.len())?;
        tx.declare_xattr_set(parent, XATTR_LOV, parent_bytes.len())?;
        tx.start()?;
        tx.create(fresh, &attr)?;
        tx.insert(lf, &name, fresh, DirentType::Reg)?;
        tx.xattr_set(fresh, XATTR_LOV, &cover_bytes, XattrFlags::empty())?;
        tx.xattr_set(parent, XATTR_LOV, &parent_bytes, XattrFlags::REPLACE)?;
        tx.commit()?;

        // The displaced object now belongs to the cover inode.
        let ff = crate::ondisk::FilterFid::new(fresh, slot as u32);
        let mut tx = tgt.store.tx_create();
        tx.declare_xattr_set(conflicting, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
        tx.start()?;
        tx.xattr_set(
            conflicting,
            crate::ondisk::XATTR_FILTER_FID,
            ff.as_bytes(),
            XattrFlags::empty(),
        )?;
        tx.commit()?;

        let ff = crate::ondisk::FilterFid::new(parent, slot as u32);
        let mut tx = tgt.store.tx_create();
        tx.declare_xattr_set(rec.fid, crate::ondisk::XATTR_FILTER_FID, size_of_val(&ff))?;
        tx.start()?;
        tx.xattr_set(
            rec.fid,
            crate::ondisk::XATTR_FILTER_FID,
            ff.as_bytes(),
            XattrFlags::empty(),
        )?;
        tx.commit()?;

        self.bump(|rec| {
            rec.repaired_orphan = (rec.repaired_orphan.get() + 1).into();
        });
        Ok(())
    }

    /// Put the orphan back into its claimed parent's layout.
    fn recreate_lovea(&self, parent: Fid, rec: &OrphanRec, tgt: &TgtDesc, slot: u16) -> Result<()> {
        let lock = self.inst.lockmgr.enqueue(
            ResId::from_fid(parent),
            LockBits::LAYOUT | LockBits::XATTR,
            LockMode::Ex,
            LOCK_TIMEOUT,
        )?;
        let rc = (|| {
            let mut lov = match read_lov(self.inst.store.as_ref(), parent)? {
                Some(lov) => lov,
                None => LovLayout::new_v1(parent),
            };
            lov.extend_to(slot as usize)?;
            if let Some(existing) = lov.stripe_fid(slot as usize) {
                if existing == rec.fid {
                    // A previous pass already re-attached it.
                    return Ok(());
                }
                let cover = match tgt.store.attr_get(existing) {
                    Ok(attr) => attr.mode & CREATED_MODE_MARK != 0,
                    Err(Errno::ENOENT) => false,
                    Err(e) => return Err(e),
                };
                if cover {
                    return self.exchange_create(parent, lov, slot, rec, existing, tgt);
                }
                // The slot is genuinely taken; park the orphan instead.
                return self.lost_found_create("C", rec, tgt, slot, None);
            }
            lov.set_slot(slot as usize, rec.fid, tgt.index)?;
            let bytes = lov.to_bytes();
            let mut tx = self.inst.store.tx_create();
            tx.declare_xattr_set(parent, XATTR_LOV, bytes.len())?;
            tx.start()?;
            tx.xattr_set(parent, XATTR_LOV, &bytes, XattrFlags::empty())?;
            tx.commit()?;
            self.bump(|rec| {
                rec.repaired_orphan = (rec.repaired_orphan.get() + 1).into();
            });
            Ok(())
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    fn handle_orphan(&self, rec: &OrphanRec, tgt: &TgtDesc) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(());
        }
        let slot = rec.parent.ver as u16;
        let parent = Fid::new(rec.parent.seq, rec.parent.oid, 0);
        if parent.is_zero() {
            return self.lost_found_create("N", rec, tgt, 0, None);
        }
        if !self.inst.store.exists(parent)? {
            return self.lost_found_create("R", rec, tgt, slot, Some(parent));
        }
        let attr = self.inst.store.attr_get(parent)?;
        if !attr.is_reg() {
            // The claimed parent cannot carry a layout; nothing sane to do.
            return Err(Errno::EINVAL);
        }
        self.recreate_lovea(parent, rec, tgt, slot)
    }

    fn scan_orphans(&mut self, tgt: &Arc<TgtDesc>) -> Result<()> {
        let recs = match tgt.link.pull_orphans() {
            Ok(recs) => recs,
            Err(e) if e.is_transient() => {
                self.mark_incomplete();
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        info!(
            "lfsck_layout: OST{:04x} reported {} orphan object(s)",
            tgt.index,
            recs.len()
        );
        for rec in &recs {
            if self.inst.is_stopping() {
                return Err(Errno::ESHUTDOWN);
            }
            self.bump(|r| {
                r.objs_checked_phase2 = (r.objs_checked_phase2.get() + 1).into();
                r.fid_latest_scanned_phase2 = rec.fid.into();
            });
            if let Err(e) = self.handle_orphan(rec, tgt) {
                warn!("lfsck_layout: orphan {} not handled: {}", rec.fid, e);
                self.bump(|r| {
                    r.objs_failed_phase2 = (r.objs_failed_phase2.get() + 1).into();
                });
                if self.inst.failout() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl AssistantHandler for MasterHandler {
    type Req = LayoutReq;

    fn name(&self) -> &'static str {
        "lfsck_layout_master"
    }

    fn prep(&mut self) -> Result<()> {
        // Kick phase-1 off on every OST.
        let params = self.inst.params();
        let mut req = LfsckRequest::new(Event::Start, CheckerKind::Layout, self.inst.node_index);
        req.param = params.flags;
        req.speed_limit = params.speed_limit;
        req.async_windows = params.async_windows;
        for tgt in self.inst.registry.osts() {
            if let Err(e) = tgt.link.notify(&req) {
                warn!(
                    "lfsck_layout: cannot start OST{:04x}: {}; its objects will not be verified",
                    tgt.index, e
                );
                // Do not wait for a peer that never started.
                tgt.set_layout_done(true);
                self.bump(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
            }
        }
        Ok(())
    }

    fn handle_req(&mut self, req: LayoutReq) -> Result<()> {
        let Some(tgt) = self.inst.registry.ost(req.ost_idx) else {
            self.mark_incomplete();
            return Ok(());
        };
        let parent_attr = match self.inst.store.attr_get(req.parent) {
            Ok(attr) => attr,
            // The inode went away mid-flight; its stripes die with it.
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(e),
        };
        let rc = self
            .classify(&req, &tgt, &parent_attr)
            .and_then(|verdict| match verdict {
                None => Ok(()),
                Some(LayoutInconsistency::Dangling) => {
                    self.repair_dangling(&req, &tgt, &parent_attr)
                }
                Some(LayoutInconsistency::UnmatchedPair) => {
                    self.repair_unmatched(&req, &tgt, &parent_attr)
                }
                Some(LayoutInconsistency::MultipleReferenced) => {
                    self.repair_multiple_referenced(&req, &tgt, &parent_attr)
                }
                Some(LayoutInconsistency::InconsistentOwner) => {
                    self.repair_owner(&req, &tgt, &parent_attr)
                }
            });
        match rc {
            Ok(()) => {}
            Err(e) if e.is_transient() => self.mark_incomplete(),
            Err(e) => {
                self.bump(|rec| {
                    rec.objs_failed_phase1 = (rec.objs_failed_phase1.get() + 1).into();
                });
                if self.inst.failout() {
                    return Err(e);
                }
            }
        }
        // Whatever the verdict, an object that exists now is spoken for.
        if tgt.store.exists(req.child).unwrap_or(false) {
            let mut accessed =
                LfsckRequest::new(Event::FidAccessed, CheckerKind::Layout, self.inst.node_index);
            accessed.fid = req.child;
            if tgt.link.notify(&accessed).is_err() {
                self.bump(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
            }
        }
        Ok(())
    }

    fn phase1_done(&mut self, result: i32) -> Result<()> {
        if result > 0 {
            self.file.update(|rec| {
                rec.status = u32::from(Status::ScanningPhase2).into();
                rec.flags = (rec.flags.get() | RunFlags::SCANNED_ONCE.bits()).into();
                let now = now_secs();
                rec.run_time_phase1 =
                    (now.saturating_sub(rec.time_latest_start.get()) as u32).into();
            });
            self.file.flush()
        } else {
            let status = self.inst.exit_status();
            self.file.update(|rec| {
                rec.status = u32::from(status).into();
            });
            self.file.flush()?;
            self.broadcast(Event::Stop, status as u32 as i32);
            Ok(())
        }
    }

    fn phase2_try(&mut self) -> Result<i32> {
        if self.inst.is_stopping() {
            return Err(Errno::ESHUTDOWN);
        }
        let tgts = self.inst.registry.osts();
        // Every OST must have finished phase-1 before its orphan index
        // means anything.
        let mut waiting = false;
        for tgt in &tgts {
            if tgt.layout_done() {
                continue;
            }
            match tgt.link.query(CheckerKind::Layout) {
                Ok(Status::ScanningPhase2)
                | Ok(Status::Completed)
                | Ok(Status::Partial)
                | Ok(Status::Stopped)
                | Ok(Status::Failed) => tgt.set_layout_done(true),
                Ok(_) => waiting = true,
                Err(e) if e.is_transient() => {
                    tgt.set_layout_done(true);
                    self.bump(|rec| {
                        rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                    });
                }
                Err(e) => return Err(e),
            }
        }
        if waiting {
            return Ok(0);
        }

        for tgt in &tgts {
            if self.processed.contains(&tgt.index) {
                continue;
            }
            self.scan_orphans(tgt)?;
            self.processed.insert(tgt.index);
        }

        let flags = RunFlags::from_bits_truncate(self.file.read().flags.get());
        let status = if flags.contains(RunFlags::INCOMPLETE) {
            Status::Partial
        } else {
            Status::Completed
        };
        self.file.update(|rec| {
            let now = now_secs();
            rec.status = u32::from(status).into();
            rec.success_count = (rec.success_count.get() + 1).into();
            rec.time_last_complete = now.into();
            rec.run_time_phase2 =
                (now.saturating_sub(rec.time_last_checkpoint.get()) as u32).into();
        });
        self.file.flush()?;
        self.broadcast(Event::Phase2Done, 0);
        info!("lfsck_layout: master phase-2 done ({})", status.name());
        Ok(1)
    }

    fn drain_req(&mut self, _req: LayoutReq) {
        self.bump(|rec| {
            rec.objs_skipped = (rec.objs_skipped.get() + 1).into();
        });
    }

    fn on_exit(&mut self) {
        let rec = self.file.read();
        let status = Status::try_from(rec.status.get()).unwrap_or(Status::Init);
        if matches!(status, Status::Completed | Status::Partial) {
            return;
        }
        let exit = self.inst.exit_status();
        self.file.update(|rec| {
            rec.status = u32::from(exit).into();
        });
        let _ = self.file.flush();
        self.broadcast(Event::Stop, exit as u32 as i32);
    }
}
