//! Layout checking, OST side.
//!
//! The slave's phase-1 is bookkeeping: every local object becomes a
//! *known* bit, every reference claimed by a master becomes an *accessed*
//! bit, and the per-sequence LAST_ID counters are checked against the
//! object ids actually on disk. Phase-2 prunes the bitmaps and serves what
//! remains as the orphan index until the master reports the run over.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use log::{error, info, warn};
use parking_lot::Mutex;

use crate::bitmap::FidBitmap;
use crate::checker::{Checker, CheckerKind, Position, StartParams, Status};
use crate::checkpoint::{CheckFile, now_secs};
use crate::controller::{Instance, LAYOUT_FILE_FID};
use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::notify::{Event, LfsckRequest, OrphanRec};
use crate::ondisk::{LAYOUT_MAGIC, LayoutRecord, RunFlags};
use crate::pipeline::{AssistantHandler, Pipeline, assistant_loop};
use crate::store::Attr;

use super::{FfState, dump_record, fresh_record, read_filter_fid};

pub(crate) struct LayoutSlave {
    inst: Arc<Instance>,
    file: Arc<CheckFile<LayoutRecord>>,
    bitmap: Arc<FidBitmap>,
    pipeline: Arc<Pipeline<Fid>>,
    assistant: Mutex<Option<JoinHandle<()>>>,
    /// The coordinating master told us the run is over.
    master_done: Arc<AtomicBool>,
}

impl LayoutSlave {
    pub fn new(inst: Arc<Instance>) -> LayoutSlave {
        let file = Arc::new(CheckFile::new(
            inst.store.clone(),
            LAYOUT_FILE_FID,
            LayoutRecord {
                magic: LAYOUT_MAGIC.into(),
                ..LayoutRecord::default()
            },
        ));
        let windows = inst.params().async_windows.max(2) as u32;
        LayoutSlave {
            inst,
            file,
            bitmap: Arc::new(FidBitmap::new()),
            pipeline: Arc::new(Pipeline::new(windows)),
            assistant: Mutex::new(None),
            master_done: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Checker for LayoutSlave {
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
        // The bitmap does not survive restarts, so a slave always rescans
        // from the start unless it crashed mid-run with a usable
        // checkpoint.
        let reset = !loaded
            || rec.magic.get() != LAYOUT_MAGIC
            || params.flags.contains(crate::ondisk::ParamFlags::RESET)
            || status != Status::Crashed;
        if reset {
            self.reset(false)?;
        }
        self.master_done.store(false, Ordering::Release);

        self.file.update(|rec| {
            rec.status = u32::from(Status::ScanningPhase1).into();
            rec.time_latest_start = now_secs().into();
        });
        self.file.flush()?;

        let handler = SlaveHandler {
            inst: self.inst.clone(),
            file: self.file.clone(),
            bitmap: self.bitmap.clone(),
            master_done: self.master_done.clone(),
            last_ids: HashMap::new(),
            pruned: false,
        };
        let pipeline = self.pipeline.clone();
        let handle = std::thread::Builder::new()
            .name("lfsck_layout_slave".into())
            .spawn(move || assistant_loop(pipeline, handler))
            .map_err(|_| Errno::ENOMEM)?;
        *self.assistant.lock() = Some(handle);

        Ok(Position::ZERO)
    }

    fn exec_oit(&self, fid: Fid) -> Result<()> {
        // Only object-carrying sequences matter on an OST.
        if !(fid.is_mdt0() || fid.is_idif() || fid.is_norm()) {
            return Ok(());
        }
        self.pipeline.push(fid)
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
        dump_record(out, &rec, "lfsck_layout_slave");
        out.push_str(&format!("bitmap_nodes: {}\n", self.bitmap.node_count()));
        out.push_str(&format!("known_objects: {}\n", self.bitmap.known_total()));
        out.push_str(&format!(
            "accessed_objects: {}\n",
            self.bitmap.accessed_total()
        ));
        Ok(())
    }

    fn in_notify(&self, req: &LfsckRequest) -> Result<()> {
        match req.event {
            Event::FidAccessed => {
                self.bitmap.set_accessed(req.fid);
                Ok(())
            }
            Event::Phase2Done => {
                self.master_done.store(true, Ordering::Release);
                self.pipeline.poke();
                Ok(())
            }
            Event::Stop | Event::PeerExit => {
                let status = if req.status < 0 {
                    Status::CoStopped
                } else {
                    Status::try_from(req.status as u32).unwrap_or(Status::CoStopped)
                };
                self.file.update(|rec| {
                    rec.status = u32::from(status).into();
                });
                let _ = self.file.flush();
                self.master_done.store(true, Ordering::Release);
                self.pipeline.poke();
                self.pipeline.request_exit();
                Ok(())
            }
            _ => Err(Errno::ENOTSUP),
        }
    }

    fn query(&self) -> Status {
        Status::try_from(self.file.read().status.get()).unwrap_or(Status::Init)
    }

    fn pull_orphans(&self) -> Result<Vec<OrphanRec>> {
        self.bitmap.prune();
        let mut out = Vec::new();
        for fid in self.bitmap.orphans() {
            let attr = match self.inst.store.attr_get(fid) {
                Ok(attr) => attr,
                Err(Errno::ENOENT) => continue,
                Err(e) => return Err(e),
            };
            let parent = match read_filter_fid(self.inst.store.as_ref(), fid)? {
                FfState::Parent(parent) => parent,
                FfState::Absent | FfState::BadSize => Fid::ZERO,
            };
            out.push(OrphanRec {
                fid,
                parent,
                uid: attr.uid,
                gid: attr.gid,
            });
        }
        Ok(out)
    }

    fn quit(&self) {
        self.pipeline.request_exit();
        if let Some(handle) = self.assistant.lock().take() {
            let _ = handle.join();
        }
    }
}

struct SlaveHandler {
    inst: Arc<Instance>,
    file: Arc<CheckFile<LayoutRecord>>,
    bitmap: Arc<FidBitmap>,
    master_done: Arc<AtomicBool>,
    /// Per-sequence `(disk LAST_ID, highest oid seen)`.
    last_ids: HashMap<u64, (u64, u64)>,
    pruned: bool,
}

impl SlaveHandler {
    fn last_id_fid(seq: u64) -> Fid {
        Fid::new(seq, crate::fid::LAST_ID_OID, 0)
    }

    fn read_last_id(&self, seq: u64) -> u64 {
        let mut buf = [0u8; 8];
        match self.inst.store.record_read(Self::last_id_fid(seq), 0, &mut buf) {
            Ok(8) => u64::from_le_bytes(buf),
            _ => 0,
        }
    }

    fn track(&mut self, fid: Fid) {
        let disk = match self.last_ids.get(&fid.seq) {
            Some(&(disk, _)) => disk,
            None => self.read_last_id(fid.seq),
        };
        let entry = self.last_ids.entry(fid.seq).or_insert((disk, 0));
        entry.1 = entry.1.max(fid.oid as u64);
        if entry.1 > entry.0 {
            // Objects exist beyond the persisted counter: the server died
            // before the counter made it to disk.
            let flags = RunFlags::from_bits_truncate(self.file.read().flags.get());
            if !flags.contains(RunFlags::CRASHED_LASTID) {
                error!(
                    "lfsck_layout: sequence {:#x} has objects past LAST_ID {} (seen {})",
                    fid.seq, entry.0, entry.1
                );
                self.file.update(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::CRASHED_LASTID.bits()).into();
                });
            }
        }
    }

    fn notify_masters(&self, event: Event) {
        let mut req = LfsckRequest::new(event, CheckerKind::Layout, self.inst.node_index);
        req.flags = self.file.read().flags.get();
        for tgt in self.inst.registry.mdts() {
            if let Err(e) = tgt.link.notify(&req) {
                warn!(
                    "lfsck_layout: cannot notify MDT{:04x} of {:?}: {}",
                    tgt.index, event, e
                );
                self.file.update(|rec| {
                    rec.flags = (rec.flags.get() | RunFlags::INCOMPLETE.bits()).into();
                });
            }
        }
    }

    fn rebuild_last_ids(&mut self) -> Result<()> {
        self.notify_masters(Event::LastIdRebuilding);
        for (&seq, &(disk, seen)) in self.last_ids.iter() {
            if seen <= disk {
                continue;
            }
            let obj = Self::last_id_fid(seq);
            let bytes = seen.to_le_bytes();
            let mut tx = self.inst.store.tx_create();
            let fresh = !self.inst.store.exists(obj)?;
            if fresh {
                tx.declare_create(obj)?;
            }
            tx.declare_record_write(obj, bytes.len())?;
            tx.start()?;
            if fresh {
                tx.create(obj, &Attr::regular(0o600, 0, 0))?;
            }
            tx.record_write(obj, 0, &bytes)?;
            tx.commit()?;
            info!(
                "lfsck_layout: rebuilt LAST_ID of sequence {:#x} to {}",
                seq, seen
            );
        }
        self.notify_masters(Event::LastIdRebuilt);
        Ok(())
    }
}

impl AssistantHandler for SlaveHandler {
    type Req = Fid;

    fn name(&self) -> &'static str {
        "lfsck_layout_slave"
    }

    fn prep(&mut self) -> Result<()> {
        Ok(())
    }

    fn handle_req(&mut self, fid: Fid) -> Result<()> {
        self.bitmap.set_known(fid);
        self.track(fid);
        self.file.update(|rec| {
            rec.objs_checked_phase1 = (rec.objs_checked_phase1.get() + 1).into();
        });
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
            self.file.flush()?;
            self.notify_masters(Event::Phase1Done);
            Ok(())
        } else {
            let status = self.inst.exit_status();
            self.file.update(|rec| {
                rec.status = u32::from(status).into();
            });
            self.file.flush()?;
            self.notify_masters(Event::PeerExit);
            Ok(())
        }
    }

    fn phase2_try(&mut self) -> Result<i32> {
        if !self.pruned {
            let dropped = self.bitmap.prune();
            info!(
                "lfsck_layout: slave pruned {} fully-accessed bitmap node(s)",
                dropped
            );
            let crashed = RunFlags::from_bits_truncate(self.file.read().flags.get())
                .contains(RunFlags::CRASHED_LASTID);
            if crashed && !self.inst.dryrun() {
                self.rebuild_last_ids()?;
            }
            self.pruned = true;
        }
        if self.master_done.load(Ordering::Acquire) || self.inst.registry.mdts().is_empty() {
            self.file.update(|rec| {
                let now = now_secs();
                let status = Status::try_from(rec.status.get()).unwrap_or(Status::Init);
                if status == Status::ScanningPhase2 {
                    rec.status = u32::from(Status::Completed).into();
                    rec.success_count = (rec.success_count.get() + 1).into();
                    rec.time_last_complete = now.into();
                }
            });
            self.file.flush()?;
            return Ok(1);
        }
        Ok(0)
    }

    fn drain_req(&mut self, _req: Fid) {
        self.file.update(|rec| {
            rec.objs_skipped = (rec.objs_skipped.get() + 1).into();
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
