//! Namespace checking.
//!
//! The namespace component verifies that directory entries and the link
//! xattrs on their targets agree: every name points at an object whose
//! linkEA records that name, and every linkEA record corresponds to a
//! live name entry. Phase-1 triages objects into the tracing file and
//! verifies entries through the assistant; phase-2 walks the flagged FIDs
//! and settles directories (`..`, orphans, striped metadata) that phase-1
//! could not decide in place.

mod striped;

use std::collections::HashSet;
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use parking_lot::Mutex;

use crate::checker::{Checker, CheckerKind, Position, StartParams, Status};
use crate::checkpoint::{CheckFile, now_secs};
use crate::controller::{Instance, NAMESPACE_FILE_FID, TRACE_FILE_FID, dump_time};
use crate::errno::{Errno, Result};
use crate::fid::{Fid, ResId};
use crate::linkea::LinkEa;
use crate::lockmgr::{LockBits, LockHandle, LockMode};
use crate::lmv::parse_shard_name;
use crate::notify::{Event, LfsckRequest};
use crate::ondisk::{
    NAMESPACE_MAGIC, NamespaceRecord, ParamFlags, RunFlags, TraceFlags, XATTR_LINK,
};
use crate::pipeline::{AssistantHandler, Pipeline, assistant_loop};
use crate::store::{Attr, AttrMask, Dirent, DirentType, XattrFlags, read_xattr};
use crate::tracefile::TracingFile;

use super::layout::LOCK_TIMEOUT;

/// One directory entry prefetched for verification.
#[derive(Clone, Debug)]
pub(crate) struct NamespaceReq {
    pub parent: Fid,
    pub child: Fid,
    pub name: Vec<u8>,
    pub typ: DirentType,
    #[allow(dead_code)]
    pub cookie: u64,
}

pub(crate) struct NamespaceChecker {
    inst: Arc<Instance>,
    file: Arc<CheckFile<NamespaceRecord>>,
    trace: Arc<TracingFile>,
    pipeline: Arc<Pipeline<NamespaceReq>>,
    assistant: Mutex<Option<JoinHandle<()>>>,
}

impl NamespaceChecker {
    pub fn new(inst: Arc<Instance>) -> Result<NamespaceChecker> {
        let file = Arc::new(CheckFile::new(
            inst.store.clone(),
            NAMESPACE_FILE_FID,
            NamespaceRecord {
                magic: NAMESPACE_MAGIC.into(),
                ..NamespaceRecord::default()
            },
        ));
        let trace = Arc::new(TracingFile::open(inst.store.clone(), TRACE_FILE_FID)?);
        let windows = inst.params().async_windows.max(2) as u32;
        Ok(NamespaceChecker {
            inst,
            file,
            trace,
            pipeline: Arc::new(Pipeline::new(windows)),
            assistant: Mutex::new(None),
        })
    }

    fn note_inconsistency(&self) {
        note_inconsistency(&self.file, &self.inst);
    }
}

fn note_inconsistency(file: &CheckFile<NamespaceRecord>, inst: &Instance) {
    let pos = *inst.pos_current.lock();
    file.update(|rec| {
        rec.flags = (rec.flags.get() | RunFlags::INCONSISTENT.bits()).into();
        let first: Position = rec.pos_first_inconsistent.into();
        if first.is_zero() {
            rec.pos_first_inconsistent = pos.into();
        }
    });
}

fn fresh_record(prev: &NamespaceRecord, init: bool) -> NamespaceRecord {
    let mut rec = NamespaceRecord {
        magic: NAMESPACE_MAGIC.into(),
        ..NamespaceRecord::default()
    };
    if !init {
        rec.success_count = prev.success_count;
        rec.time_last_complete = prev.time_last_complete;
    }
    rec
}

impl Checker for NamespaceChecker {
    fn kind(&self) -> CheckerKind {
        CheckerKind::Namespace
    }

    fn reset(&self, init: bool) -> Result<()> {
        let prev = self.file.read();
        self.file.update(|rec| *rec = fresh_record(&prev, init));
        self.file.flush()
    }

    fn fail(&self, _new_checked: bool) {
        self.file.update(|rec| {
            rec.items_failed = (rec.items_failed.get() + 1).into();
        });
    }

    fn checkpoint(&self, init: bool) -> Result<()> {
        self.pipeline.wait_drained();
        let pos = *self.inst.pos_current.lock();
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
            || rec.magic.get() != NAMESPACE_MAGIC
            || params.flags.contains(ParamFlags::RESET)
            || matches!(status, Status::Completed | Status::Partial);
        if reset {
            self.reset(false)?;
        }

        let rec = self.file.read();
        let mut start: Position = rec.pos_last_checkpoint.into();
        if self
            .inst
            .drop_dryrun
            .load(std::sync::atomic::Ordering::Acquire)
        {
            let first: Position = rec.pos_first_inconsistent.into();
            if !first.is_zero() {
                start = start.min(first);
            }
        }
        self.file.update(|rec| {
            rec.status = u32::from(Status::ScanningPhase1).into();
            rec.time_latest_start = now_secs().into();
            rec.pos_latest_start = start.into();
        });
        self.file.flush()?;

        let handler = NsHandler {
            inst: self.inst.clone(),
            file: self.file.clone(),
            trace: self.trace.clone(),
        };
        let pipeline = self.pipeline.clone();
        let handle = std::thread::Builder::new()
            .name("lfsck_namespace".into())
            .spawn(move || assistant_loop(pipeline, handler))
            .map_err(|_| Errno::ENOMEM)?;
        *self.assistant.lock() = Some(handle);

        Ok(start)
    }

    fn exec_oit(&self, fid: Fid) -> Result<()> {
        let attr = match self.inst.store.attr_get(fid) {
            Ok(attr) => attr,
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(e),
        };
        self.file.update(|rec| {
            rec.items_checked = (rec.items_checked.get() + 1).into();
            if attr.is_dir() {
                rec.dirs_checked = (rec.dirs_checked.get() + 1).into();
            }
        });

        let buf = match read_xattr(self.inst.store.as_ref(), fid, XATTR_LINK) {
            Ok(buf) => buf,
            Err(Errno::ENODATA) => {
                // Directories are reconstructed from `..`; a multiply
                // linked file without a linkEA needs phase-2 attention.
                if !attr.is_dir() && attr.nlink > 1 {
                    self.trace.add(fid, TraceFlags::CHECK_LINKEA)?;
                }
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        let ea = match LinkEa::parse(&buf) {
            Ok(ea) => ea,
            Err(_) => {
                // Unsalvageable image: drop it so phase-2 can rebuild from
                // the live name entries.
                self.note_inconsistency();
                self.trace.add(fid, TraceFlags::CHECK_LINKEA)?;
                if !self.inst.dryrun() {
                    let lock = self.inst.lockmgr.enqueue(
                        ResId::from_fid(fid),
                        LockBits::UPDATE | LockBits::XATTR,
                        LockMode::Ex,
                        LOCK_TIMEOUT,
                    )?;
                    let rc = (|| {
                        let mut tx = self.inst.store.tx_create();
                        tx.declare_xattr_del(fid, XATTR_LINK)?;
                        tx.start()?;
                        tx.xattr_del(fid, XATTR_LINK)?;
                        tx.commit()
                    })();
                    self.inst.lockmgr.decref(lock);
                    rc?;
                    self.file.update(|rec| {
                        rec.items_repaired = (rec.items_repaired.get() + 1).into();
                    });
                }
                return Ok(());
            }
        };

        if ea.reccount() > 1 {
            self.file.update(|rec| {
                rec.mul_linked_checked = (rec.mul_linked_checked.get() + 1).into();
            });
            self.trace.add(fid, TraceFlags::CHECK_LINKEA)?;
        } else if let Some(entry) = ea.first() {
            if !entry.parent.is_sane() {
                self.trace.add(fid, TraceFlags::CHECK_PARENT)?;
            } else if self.inst.fld.mdt_index(entry.parent.seq)? != self.inst.node_index as u32 {
                // Remote parent: leave for a run that can reach it.
                self.trace.add(fid, TraceFlags::CHECK_LINKEA)?;
            } else {
                match self.inst.store.lookup(entry.parent, entry.name) {
                    Ok(found) if found == fid => {}
                    _ => {
                        // The recorded name does not resolve back here.
                        self.trace.add(fid, TraceFlags::CHECK_LINKEA)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn exec_dir(&self, dir: Fid, ent: &Dirent) -> Result<()> {
        if ent.name == b".." {
            if ent.fid.is_zero() {
                self.trace.add(dir, TraceFlags::CHECK_PARENT)?;
            }
            return Ok(());
        }
        if ent.name == b"." {
            return Ok(());
        }
        if self.inst.fld.mdt_index(ent.fid.seq)? != self.inst.node_index as u32 {
            // The child lives on another MDT; its assistant would verify
            // this entry. Flag it for a run that can reach it and move on.
            self.trace.add(ent.fid, TraceFlags::CHECK_LINKEA)?;
            self.file.update(|rec| {
                rec.items_skipped = (rec.items_skipped.get() + 1).into();
                rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
            });
            return Ok(());
        }
        self.pipeline.push(NamespaceReq {
            parent: dir,
            child: ent.fid,
            name: ent.name.clone(),
            typ: ent.typ,
            cookie: ent.cookie,
        })
    }

    fn post(&self, result: i32) -> Result<()> {
        self.pipeline.post(result)
    }

    fn double_scan(&self) -> Result<()> {
        self.pipeline.double_scan()
    }

    fn dump(&self, out: &mut String) -> Result<()> {
        let rec = self.file.read();
        let status = Status::try_from(rec.status.get()).unwrap_or(Status::Init);
        out.push_str(&format!("name: {}\n", self.kind().name()));
        out.push_str(&format!("magic: {:#x}\n", rec.magic.get()));
        out.push_str(&format!("status: {}\n", status.name()));
        out.push_str(&format!(
            "flags: {:?}\n",
            RunFlags::from_bits_truncate(rec.flags.get())
        ));
        dump_time(out, "time_since_last_completed", rec.time_last_complete.get());
        dump_time(out, "time_since_latest_start", rec.time_latest_start.get());
        dump_time(out, "time_since_last_checkpoint", rec.time_last_checkpoint.get());
        out.push_str(&format!("success_count: {}\n", rec.success_count.get()));
        out.push_str(&format!("checked_phase1: {}\n", rec.items_checked.get()));
        out.push_str(&format!("checked_phase2: {}\n", rec.objs_checked_phase2.get()));
        out.push_str(&format!("directories: {}\n", rec.dirs_checked.get()));
        out.push_str(&format!("multi_linked: {}\n", rec.mul_linked_checked.get()));
        out.push_str(&format!("linkea_repaired: {}\n", rec.linkea_repaired.get()));
        out.push_str(&format!("dirent_repaired: {}\n", rec.dirent_repaired.get()));
        out.push_str(&format!(
            "unmatched_pairs_repaired: {}\n",
            rec.unmatched_pairs_repaired.get()
        ));
        out.push_str(&format!("dangling_repaired: {}\n", rec.dangling_repaired.get()));
        out.push_str(&format!(
            "lost_dirent_repaired: {}\n",
            rec.lost_dirent_repaired.get()
        ));
        out.push_str(&format!("nlink_repaired: {}\n", rec.objs_nlink_repaired.get()));
        out.push_str(&format!("lost_found: {}\n", rec.objs_lost_found.get()));
        out.push_str(&format!(
            "striped_dirs_scanned: {}\n",
            rec.striped_dirs_scanned.get()
        ));
        out.push_str(&format!(
            "striped_dirs_repaired: {}\n",
            rec.striped_dirs_repaired.get()
        ));
        out.push_str(&format!(
            "striped_shards_scanned: {}\n",
            rec.striped_shards_scanned.get()
        ));
        out.push_str(&format!(
            "striped_shards_repaired: {}\n",
            rec.striped_shards_repaired.get()
        ));
        out.push_str(&format!(
            "name_hash_repaired: {}\n",
            rec.name_hash_repaired.get()
        ));
        out.push_str(&format!("failed_phase1: {}\n", rec.items_failed.get()));
        out.push_str(&format!("failed_phase2: {}\n", rec.objs_failed_phase2.get()));
        out.push_str(&format!("skipped: {}\n", rec.items_skipped.get()));
        out.push_str(&format!("prefetched: {}\n", self.pipeline.prefetched()));
        Ok(())
    }

    fn in_notify(&self, req: &LfsckRequest) -> Result<()> {
        match req.event {
            Event::Phase1Done => {
                if let Some(tgt) = self.inst.registry.mdt(req.index) {
                    tgt.set_namespace_done(true);
                }
                self.pipeline.poke();
                Ok(())
            }
            Event::Stop | Event::PeerExit => {
                self.file.update(|rec| {
                    rec.status = u32::from(Status::CoStopped).into();
                });
                let _ = self.file.flush();
                self.pipeline.request_exit();
                Ok(())
            }
            Event::SetLmvMaster | Event::SetLmvSlave => {
                striped::install_lmv(&self.inst, req)
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

/// The assistant half of the namespace checker.
pub(crate) struct NsHandler {
    pub(crate) inst: Arc<Instance>,
    pub(crate) file: Arc<CheckFile<NamespaceRecord>>,
    pub(crate) trace: Arc<TracingFile>,
}

impl NsHandler {
    pub(crate) fn bump(&self, f: impl FnOnce(&mut NamespaceRecord)) {
        self.file.update(f);
    }

    fn lock_fid(&self, fid: Fid, bits: LockBits, mode: LockMode) -> Result<LockHandle> {
        self.inst
            .lockmgr
            .enqueue(ResId::from_fid(fid), bits, mode, LOCK_TIMEOUT)
    }

    /// The name entry points at nothing. Default policy records it; with
    /// object creation allowed, a placeholder of the right type is
    /// fabricated and linked back.
    fn dangling_entry(&self, req: &NamespaceReq) -> Result<()> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() || !self.inst.create_allowed() {
            warn!(
                "lfsck_namespace: dangling name entry {:?} under {} -> {}; not repairing",
                String::from_utf8_lossy(&req.name),
                req.parent,
                req.child
            );
            self.bump(|rec| {
                rec.items_skipped = (rec.items_skipped.get() + 1).into();
            });
            return Ok(());
        }
        let parent_attr = match self.inst.store.attr_get(req.parent) {
            Ok(attr) => attr,
            Err(Errno::ENOENT) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mode = match req.typ {
            DirentType::Dir => libc::S_IFDIR | 0o600,
            DirentType::Lnk => libc::S_IFLNK | 0o600,
            _ => libc::S_IFREG | 0o600,
        };
        let attr = Attr {
            mode,
            nlink: if req.typ == DirentType::Dir { 2 } else { 1 },
            uid: parent_attr.uid,
            gid: parent_attr.gid,
            size: 0,
            blocks: 0,
            ctime: 0,
        };
        let ea = LinkEa::with_entry(req.parent, &req.name)?;
        let mut tx = self.inst.store.tx_create();
        tx.declare_create(req.child)?;
        tx.declare_xattr_set(req.child, XATTR_LINK, ea.as_bytes().len())?;
        if req.typ == DirentType::Dir {
            tx.declare_insert(req.child, b".")?;
            tx.declare_insert(req.child, b"..")?;
        }
        tx.start()?;
        tx.create(req.child, &attr)?;
        tx.xattr_set(req.child, XATTR_LINK, ea.as_bytes(), XattrFlags::empty())?;
        if req.typ == DirentType::Dir {
            tx.insert(req.child, b".", req.child, DirentType::Dir)?;
            tx.insert(req.child, b"..", req.parent, DirentType::Dir)?;
        }
        tx.commit()?;
        self.bump(|rec| {
            rec.dangling_repaired = (rec.dangling_repaired.get() + 1).into();
        });
        info!(
            "lfsck_namespace: created {} to back dangling entry {:?} in {}",
            req.child,
            String::from_utf8_lossy(&req.name),
            req.parent
        );
        Ok(())
    }

    /// Verify one name entry against the child's linkEA.
    fn check_entry(&self, req: &NamespaceReq) -> Result<()> {
        if !self.inst.store.exists(req.child)? {
            return self.dangling_entry(req);
        }
        if let Some((shard_fid, shard_idx)) = parse_shard_name(&req.name) {
            if shard_fid == req.child {
                return self.check_shard(req, shard_idx);
            }
        }
        // If the entry lives inside a shard of a striped directory, the
        // name must hash to that shard.
        self.verify_name_placement(req)?;

        let lock = self.lock_fid(req.child, LockBits::UPDATE | LockBits::XATTR, LockMode::Ex)?;
        let rc = (|| {
            // Re-confirm under lock; a concurrent unlink may have raced us.
            if !self.inst.store.exists(req.child)? {
                return Ok(());
            }
            let attr = self.inst.store.attr_get(req.child)?;
            let buf = match read_xattr(self.inst.store.as_ref(), req.child, XATTR_LINK) {
                Ok(buf) => Some(buf),
                Err(Errno::ENODATA) => None,
                Err(e) => return Err(e),
            };
            let parsed = buf.as_deref().map(LinkEa::parse);
            match parsed {
                None => {
                    note_inconsistency(&self.file, &self.inst);
                    if self.inst.dryrun() {
                        return Ok(());
                    }
                    if attr.nlink == 0 || self.inst.store.is_dead(req.child)? {
                        // Object on its way out: the stale name entry goes.
                        let mut tx = self.inst.store.tx_create();
                        tx.declare_delete(req.parent, &req.name)?;
                        tx.start()?;
                        tx.delete(req.parent, &req.name)?;
                        tx.commit()?;
                        self.bump(|rec| {
                            rec.dirent_repaired = (rec.dirent_repaired.get() + 1).into();
                        });
                    } else {
                        let ea = LinkEa::with_entry(req.parent, &req.name)?;
                        self.write_linkea(req.child, &ea)?;
                        self.bump(|rec| {
                            rec.linkea_repaired = (rec.linkea_repaired.get() + 1).into();
                        });
                    }
                    Ok(())
                }
                Some(Err(_)) => {
                    note_inconsistency(&self.file, &self.inst);
                    if self.inst.dryrun() {
                        return Ok(());
                    }
                    let ea = LinkEa::with_entry(req.parent, &req.name)?;
                    self.write_linkea(req.child, &ea)?;
                    self.bump(|rec| {
                        rec.linkea_repaired = (rec.linkea_repaired.get() + 1).into();
                    });
                    Ok(())
                }
                Some(Ok(mut ea)) => {
                    let mut changed = false;
                    let mut seen: HashSet<(Fid, Vec<u8>)> = HashSet::new();
                    if ea.retain(|e| {
                        e.parent.is_sane() && seen.insert((e.parent, e.name.to_vec()))
                    }) > 0
                    {
                        changed = true;
                    }
                    if !ea.contains(req.parent, &req.name) {
                        ea.add(req.parent, &req.name)?;
                        changed = true;
                    }
                    if changed {
                        note_inconsistency(&self.file, &self.inst);
                        if !self.inst.dryrun() {
                            self.write_linkea(req.child, &ea)?;
                            self.bump(|rec| {
                                rec.linkea_repaired = (rec.linkea_repaired.get() + 1).into();
                            });
                        }
                    }
                    Ok(())
                }
            }
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }

    pub(crate) fn write_linkea(&self, fid: Fid, ea: &LinkEa) -> Result<()> {
        let mut tx = self.inst.store.tx_create();
        tx.declare_xattr_set(fid, XATTR_LINK, ea.as_bytes().len())?;
        tx.start()?;
        tx.xattr_set(fid, XATTR_LINK, ea.as_bytes(), XattrFlags::empty())?;
        tx.commit()
    }

    fn read_linkea(&self, fid: Fid) -> Result<Option<LinkEa>> {
        match read_xattr(self.inst.store.as_ref(), fid, XATTR_LINK) {
            Ok(buf) => Ok(LinkEa::parse(&buf).ok()),
            Err(Errno::ENODATA) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Re-point a directory's `..` entry.
    fn rewrite_dotdot(&self, dir: Fid, new_parent: Fid) -> Result<()> {
        let had = self.inst.store.lookup(dir, b"..").is_ok();
        let mut tx = self.inst.store.tx_create();
        if had {
            tx.declare_delete(dir, b"..")?;
        }
        tx.declare_insert(dir, b"..")?;
        tx.start()?;
        if had {
            tx.delete(dir, b"..")?;
        }
        tx.insert(dir, b"..", new_parent, DirentType::Dir)?;
        tx.commit()
    }

    /// Move an unreferenced directory under lost+found.
    fn orphan_dir(&self, dir: Fid, old_parent: Option<Fid>) -> Result<bool> {
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(false);
        }
        let lf = self.inst.lost_found_dir()?;
        let pfid = old_parent.unwrap_or(Fid::ZERO);
        let mut picked = None;
        for k in 0..0x10000 {
            let name = format!("{dir}-{pfid}-D-{k}").into_bytes();
            match self.inst.store.lookup(lf, &name) {
                Err(Errno::ENOENT) => {
                    picked = Some(name);
                    break;
                }
                Ok(_) => continue,
                Err(e) => return Err(e),
            }
        }
        let name = picked.ok_or(Errno::ENOSPC)?;
        let ea = LinkEa::with_entry(lf, &name)?;
        let had_dotdot = self.inst.store.lookup(dir, b"..").is_ok();
        let mut tx = self.inst.store.tx_create();
        tx.declare_insert(lf, &name)?;
        tx.declare_ref_add(lf)?;
        if had_dotdot {
            tx.declare_delete(dir, b"..")?;
        }
        tx.declare_insert(dir, b"..")?;
        tx.declare_xattr_set(dir, XATTR_LINK, ea.as_bytes().len())?;
        tx.start()?;
        tx.insert(lf, &name, dir, DirentType::Dir)?;
        tx.ref_add(lf)?;
        if had_dotdot {
            tx.delete(dir, b"..")?;
        }
        tx.insert(dir, b"..", lf, DirentType::Dir)?;
        tx.xattr_set(dir, XATTR_LINK, ea.as_bytes(), XattrFlags::empty())?;
        tx.commit()?;
        self.bump(|rec| {
            rec.objs_lost_found = (rec.objs_lost_found.get() + 1).into();
        });
        info!(
            "lfsck_namespace: moved orphan directory {} to lost+found as {:?}",
            dir,
            String::from_utf8_lossy(&name)
        );
        Ok(true)
    }

    /// Phase-2 settlement of a directory: reconcile `..`, the linkEA, and
    /// the parent's name entry.
    fn double_scan_dir(&self, dir: Fid, flags: TraceFlags) -> Result<bool> {
        let mut repaired = false;
        if flags.intersects(TraceFlags::UNCERTAIN_LMV | TraceFlags::RECHECK_NAMEHASH) {
            repaired |= self.dsd_striped(dir, flags)?;
        }

        let dotdot = match self.inst.store.lookup(dir, b"..") {
            Ok(fid) if !fid.is_zero() => Some(fid),
            _ => None,
        };
        let entries: Vec<(Fid, Vec<u8>)> = match self.read_linkea(dir)? {
            Some(ea) => ea
                .entries()
                .map(|e| (e.parent, e.name.to_vec()))
                .collect(),
            None => Vec::new(),
        };

        if entries.is_empty() {
            return Ok(self.orphan_dir(dir, dotdot)? || repaired);
        }

        let resolves = |p: Fid, n: &[u8]| self.inst.store.lookup(p, n) == Ok(dir);

        if entries.len() == 1 {
            let (p, name) = &entries[0];
            if Some(*p) == dotdot {
                match self.inst.store.lookup(*p, name) {
                    Ok(found) if found == dir => {}
                    Err(Errno::ENOENT) if self.inst.store.exists(*p)? => {
                        // The child remembers a name its parent lost.
                        note_inconsistency(&self.file, &self.inst);
                        if !self.inst.dryrun() {
                            let mut tx = self.inst.store.tx_create();
                            tx.declare_insert(*p, name)?;
                            tx.declare_ref_add(*p)?;
                            tx.start()?;
                            tx.insert(*p, name, dir, DirentType::Dir)?;
                            tx.ref_add(*p)?;
                            tx.commit()?;
                            self.bump(|rec| {
                                rec.lost_dirent_repaired =
                                    (rec.lost_dirent_repaired.get() + 1).into();
                            });
                            repaired = true;
                        }
                    }
                    _ => {
                        repaired |= self.orphan_dir(dir, dotdot)?;
                    }
                }
            } else if self.inst.store.exists(*p)? && resolves(*p, name) {
                // `..` disagrees with a live name entry: trust the name.
                note_inconsistency(&self.file, &self.inst);
                if !self.inst.dryrun() {
                    self.rewrite_dotdot(dir, *p)?;
                    self.bump(|rec| {
                        rec.unmatched_pairs_repaired =
                            (rec.unmatched_pairs_repaired.get() + 1).into();
                    });
                    repaired = true;
                }
            } else {
                repaired |= self.orphan_dir(dir, dotdot)?;
            }
            return Ok(repaired);
        }

        // Multiple records: the first whose parent actually holds a name
        // entry for this directory wins; the rest are noise.
        let auth = entries.iter().find(|(p, n)| resolves(*p, n));
        match auth {
            Some((p, name)) => {
                note_inconsistency(&self.file, &self.inst);
                if !self.inst.dryrun() {
                    let ea = LinkEa::with_entry(*p, name)?;
                    self.write_linkea(dir, &ea)?;
                    if dotdot != Some(*p) {
                        self.rewrite_dotdot(dir, *p)?;
                        self.bump(|rec| {
                            rec.unmatched_pairs_repaired =
                                (rec.unmatched_pairs_repaired.get() + 1).into();
                        });
                    } else {
                        self.bump(|rec| {
                            rec.linkea_repaired = (rec.linkea_repaired.get() + 1).into();
                        });
                    }
                    repaired = true;
                }
                Ok(repaired)
            }
            None => Ok(self.orphan_dir(dir, dotdot)? || repaired),
        }
    }

    /// Phase-2 settlement of a non-directory: validate every linkEA record
    /// against the namespace and fix nlink.
    fn double_scan_file(&self, fid: Fid, attr: &Attr) -> Result<bool> {
        let lock = self.lock_fid(fid, LockBits::UPDATE | LockBits::XATTR, LockMode::Ex)?;
        let rc = (|| {
            let Some(ea) = self.read_linkea(fid)? else {
                return Ok(false);
            };
            let mut kept: Vec<(Fid, Vec<u8>)> = Vec::new();
            let mut inserted = 0u64;
            let mut dropped = 0u64;
            for e in ea.entries() {
                if !e.parent.is_sane() {
                    dropped += 1;
                    continue;
                }
                match self.inst.store.lookup(e.parent, e.name) {
                    Ok(found) if found == fid => kept.push((e.parent, e.name.to_vec())),
                    Ok(_) => dropped += 1,
                    Err(Errno::ENOENT) => {
                        match self.inst.store.attr_get(e.parent) {
                            Ok(pattr) if pattr.is_dir() => {}
                            _ => {
                                dropped += 1;
                                continue;
                            }
                        }
                        // The name vanished but the parent is alive:
                        // restore the entry.
                        note_inconsistency(&self.file, &self.inst);
                        if self.inst.dryrun() {
                            kept.push((e.parent, e.name.to_vec()));
                            continue;
                        }
                        let mut tx = self.inst.store.tx_create();
                        tx.declare_insert(e.parent, e.name)?;
                        tx.start()?;
                        tx.insert(
                            e.parent,
                            e.name,
                            fid,
                            DirentType::from_mode(attr.mode),
                        )?;
                        tx.commit()?;
                        inserted += 1;
                        kept.push((e.parent, e.name.to_vec()));
                    }
                    Err(e) => return Err(e),
                }
            }
            let mut repaired = inserted > 0;
            if dropped > 0 {
                note_inconsistency(&self.file, &self.inst);
            }
            if dropped > 0 && !self.inst.dryrun() {
                let mut fresh = LinkEa::empty();
                for (p, n) in &kept {
                    fresh.add(*p, n)?;
                }
                self.write_linkea(fid, &fresh)?;
                repaired = true;
            }
            if repaired {
                self.bump(|rec| {
                    rec.linkea_repaired = (rec.linkea_repaired.get() + inserted.max(1)).into();
                });
            }
            // nlink must agree with the verified name count.
            let n = kept.len() as u32;
            if n > 0 && attr.nlink != n && !self.inst.dryrun() {
                let fixed = Attr {
                    nlink: n,
                    ..Attr::default()
                };
                let mut tx = self.inst.store.tx_create();
                tx.declare_attr_set(fid)?;
                tx.start()?;
                tx.attr_set(fid, &fixed, AttrMask::NLINK)?;
                tx.commit()?;
                self.bump(|rec| {
                    rec.objs_nlink_repaired = (rec.objs_nlink_repaired.get() + 1).into();
                });
                repaired = true;
            }
            Ok(repaired)
        })();
        self.inst.lockmgr.decref(lock);
        rc
    }
}

impl AssistantHandler for NsHandler {
    type Req = NamespaceReq;

    fn name(&self) -> &'static str {
        "lfsck_namespace"
    }

    fn prep(&mut self) -> Result<()> {
        // Fan the start out to the other metadata servers when asked to.
        if !self.inst.params().flags.contains(ParamFlags::BROADCAST) {
            return Ok(());
        }
        let params = self.inst.params();
        let mut req = LfsckRequest::new(Event::Start, CheckerKind::Namespace, self.inst.node_index);
        req.param = params.flags;
        req.speed_limit = params.speed_limit;
        req.async_windows = params.async_windows;
        for tgt in self.inst.registry.mdts() {
            if let Err(e) = tgt.link.notify(&req) {
                warn!(
                    "lfsck_namespace: cannot start MDT{:04x}: {}",
                    tgt.index, e
                );
                tgt.set_namespace_done(true);
                self.bump(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
            }
        }
        Ok(())
    }

    fn handle_req(&mut self, req: NamespaceReq) -> Result<()> {
        match self.check_entry(&req) {
            Ok(()) => Ok(()),
            Err(e) if e.is_transient() => {
                self.bump(|rec| {
                    rec.items_skipped = (rec.items_skipped.get() + 1).into();
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
                Ok(())
            }
            Err(e) => {
                self.bump(|rec| {
                    rec.items_failed = (rec.items_failed.get() + 1).into();
                });
                if self.inst.failout() { Err(e) } else { Ok(()) }
            }
        }
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
            self.file.flush()?;
            if self.inst.params().flags.contains(ParamFlags::BROADCAST) {
                let req = LfsckRequest::new(
                    Event::Phase1Done,
                    CheckerKind::Namespace,
                    self.inst.node_index,
                );
                for tgt in self.inst.registry.mdts() {
                    let _ = tgt.link.notify(&req);
                }
            }
            Ok(())
        } else {
            let status = self.inst.exit_status();
            self.file.update(|rec| {
                rec.status = u32::from(status).into();
            });
            self.file.flush()
        }
    }

    fn phase2_try(&mut self) -> Result<i32> {
        if self.inst.is_stopping() {
            return Err(Errno::ESHUTDOWN);
        }
        // With broadcast on, every peer MDT must clear phase-1 first so
        // cross-MDT renames have settled their linkEAs.
        if self.inst.params().flags.contains(ParamFlags::BROADCAST) {
            let mut waiting = false;
            for tgt in self.inst.registry.mdts() {
                if tgt.namespace_done() {
                    continue;
                }
                match tgt.link.query(CheckerKind::Namespace) {
                    Ok(Status::ScanningPhase2)
                    | Ok(Status::Completed)
                    | Ok(Status::Partial)
                    | Ok(Status::Stopped)
                    | Ok(Status::Failed) => tgt.set_namespace_done(true),
                    Ok(_) => waiting = true,
                    Err(e) if e.is_transient() => {
                        tgt.set_namespace_done(true);
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
        }

        let mut it = self.trace.iter()?;
        while let Some((fid, flags)) = it.next()? {
            if self.inst.is_stopping() {
                return Err(Errno::ESHUTDOWN);
            }
            if self.inst.fld.mdt_index(fid.seq)? != self.inst.node_index as u32 {
                // Remote object: its flag stays for a run that can reach
                // the owning server.
                continue;
            }
            self.bump(|rec| {
                rec.objs_checked_phase2 = (rec.objs_checked_phase2.get() + 1).into();
                rec.fid_latest_scanned_phase2 = fid.into();
            });
            let rc = (|| -> Result<bool> {
                if !self.inst.store.exists(fid)? {
                    return Ok(false);
                }
                let attr = self.inst.store.attr_get(fid)?;
                if attr.is_dir() {
                    self.double_scan_dir(fid, flags)
                } else {
                    self.double_scan_file(fid, &attr)
                }
            })();
            match rc {
                Ok(repaired) => {
                    if repaired {
                        self.bump(|rec| {
                            rec.objs_repaired_phase2 =
                                (rec.objs_repaired_phase2.get() + 1).into();
                        });
                    }
                    self.trace.remove(fid, flags)?;
                }
                Err(e) if e.is_transient() => {
                    self.bump(|rec| {
                        rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                    });
                    self.trace.remove(fid, flags)?;
                }
                Err(e) => {
                    warn!("lfsck_namespace: phase-2 failed on {}: {}", fid, e);
                    self.bump(|rec| {
                        rec.objs_failed_phase2 = (rec.objs_failed_phase2.get() + 1).into();
                    });
                    self.trace.remove(fid, flags)?;
                    if self.inst.failout() {
                        return Err(e);
                    }
                }
            }
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
        info!("lfsck_namespace: phase-2 done ({})", status.name());
        Ok(1)
    }

    fn drain_req(&mut self, _req: NamespaceReq) {
        self.bump(|rec| {
            rec.items_skipped = (rec.items_skipped.get() + 1).into();
        });
    }

    fn on_exit(&mut self) {
        let rec = self.file.read();
        let status = Status::try_from(rec.status.get()).unwrap_or(Status::Init);
        if matches!(
            status,
            Status::Completed | Status::Partial | Status::CoStopped | Status::CoFailed
        ) {
            return;
        }
        let exit = self.inst.exit_status();
        self.file.update(|rec| {
            rec.status = u32::from(exit).into();
        });
        let _ = self.file.flush();
    }
}
