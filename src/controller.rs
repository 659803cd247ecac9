//! The owning controller.
//!
//! One `Controller` per server instance owns the store handle, the lock
//! manager, the peer registry, the bookmark, and the set of checkers wired
//! for this node's role. All daemon-level state flows through it; there
//! are no module globals. The `Instance` behind it is shared with the
//! engine thread and the checkers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::checker::{Checker, CheckerKind, Components, Position, StartParams, Status};
use crate::checkpoint::{CheckFile, now_secs};
use crate::engine;
use crate::errno::{Errno, Result};
use crate::fid::{FID_SEQ_DOT, FID_SEQ_LOCAL_FILE, Fid};
use crate::layout::{LayoutMaster, LayoutSlave};
use crate::lockmgr::LockMgr;
use crate::namespace::NamespaceChecker;
use crate::notify::{Event, LfsckRequest, OrphanRec};
use crate::ondisk::{
    BOOKMARK_MAGIC, BOOKMARK_VERSION, BookmarkRecord, LayoutRecord, NamespaceRecord, ParamFlags,
    XATTR_LINK,
};
use crate::registry::{TgtDesc, TgtRegistry};
use crate::store::{Attr, DirentType, Store};

/// Reserved local objects holding persistent engine state.
pub const BOOKMARK_FID: Fid = Fid::new(FID_SEQ_LOCAL_FILE, 0x10, 0);
pub const NAMESPACE_FILE_FID: Fid = Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0);
pub const LAYOUT_FILE_FID: Fid = Fid::new(FID_SEQ_LOCAL_FILE, 0x12, 0);
pub const TRACE_FILE_FID: Fid = Fid::new(FID_SEQ_LOCAL_FILE, 0x13, 0);

/// `.lustre` and its lost+found child.
pub const DOT_FID: Fid = Fid::new(FID_SEQ_DOT, 1, 0);
pub const LPF_FID: Fid = Fid::new(FID_SEQ_DOT, 2, 0);

/// Which side of the filesystem this node serves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeRole {
    Mdt,
    Ost,
}

/// FID-location database: which MDT owns a sequence.
pub trait FidLocator: Send + Sync {
    fn mdt_index(&self, seq: u64) -> Result<u32>;
}

/// Single-MDT deployment: every sequence is local.
pub struct LocalFld {
    pub index: u32,
}

impl FidLocator for LocalFld {
    fn mdt_index(&self, _seq: u64) -> Result<u32> {
        Ok(self.index)
    }
}

/// Wiring for one node.
pub struct NodeConfig {
    pub node_index: u16,
    pub role: NodeRole,
    pub store: Arc<dyn Store>,
    pub lock_mgr: Arc<dyn LockMgr>,
    pub fld: Arc<dyn FidLocator>,
    pub root_fid: Fid,
}

/// Scan speed throttle state.
pub(crate) struct Speed {
    pub limit: u32,
    pub sleep_rate: u32,
    pub sleep_ms: u64,
    pub new_scanned: u32,
}

const SPEED_TICKS_PER_SEC: u32 = 10;

impl Speed {
    fn new() -> Speed {
        let mut speed = Speed {
            limit: 0,
            sleep_rate: 0,
            sleep_ms: 0,
            new_scanned: 0,
        };
        speed.set_limit(0);
        speed
    }

    pub fn set_limit(&mut self, limit: u32) {
        self.limit = limit;
        if limit == 0 {
            self.sleep_rate = 0;
            self.sleep_ms = 0;
        } else if limit > SPEED_TICKS_PER_SEC {
            self.sleep_rate = limit / SPEED_TICKS_PER_SEC;
            self.sleep_ms = (1000 / SPEED_TICKS_PER_SEC) as u64;
        } else {
            self.sleep_rate = 1;
            self.sleep_ms = (1000 / limit) as u64;
        }
    }
}

/// Checker list membership. A checker in `dir` is always in `scan` too.
#[derive(Default)]
pub(crate) struct Lists {
    pub scan: Vec<Arc<dyn Checker>>,
    pub dir: Vec<Arc<dyn Checker>>,
    pub double_scan: Vec<Arc<dyn Checker>>,
    pub idle: Vec<Arc<dyn Checker>>,
}

impl Lists {
    pub fn all(&self) -> Vec<Arc<dyn Checker>> {
        let mut out = Vec::new();
        for com in self
            .scan
            .iter()
            .chain(self.double_scan.iter())
            .chain(self.idle.iter())
        {
            if !out.iter().any(|c: &Arc<dyn Checker>| Arc::ptr_eq(c, com)) {
                out.push(com.clone());
            }
        }
        out
    }

    pub fn find(&self, kind: CheckerKind) -> Option<Arc<dyn Checker>> {
        self.all().into_iter().find(|c| c.kind() == kind)
    }
}

pub(crate) struct RunState {
    pub running: bool,
}

/// Shared state of one running (or idle) engine instance.
pub(crate) struct Instance {
    pub node_index: u16,
    pub role: NodeRole,
    pub root_fid: Fid,
    pub store: Arc<dyn Store>,
    pub lockmgr: Arc<dyn LockMgr>,
    pub fld: Arc<dyn FidLocator>,
    pub registry: TgtRegistry,
    pub bookmark: CheckFile<BookmarkRecord>,
    pub params: RwLock<StartParams>,
    pub lists: Mutex<Lists>,
    pub pos_current: Mutex<Position>,
    pub speed: Mutex<Speed>,
    pub stopping: AtomicBool,
    /// Operator status installed before a stop, read by assistants on the
    /// way out.
    pub stop_status: Mutex<Option<Status>>,
    pub run: Mutex<RunState>,
    pub run_cv: Condvar,
    pub oit_over: AtomicBool,
    pub drop_dryrun: AtomicBool,
}

impl Instance {
    pub fn params(&self) -> StartParams {
        *self.params.read()
    }

    pub fn dryrun(&self) -> bool {
        self.params.read().flags.contains(ParamFlags::DRYRUN)
    }

    pub fn failout(&self) -> bool {
        self.params.read().flags.contains(ParamFlags::FAILOUT)
    }

    pub fn create_allowed(&self) -> bool {
        self.params.read().flags.contains(ParamFlags::CREATE_MDTOBJ)
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    pub fn exit_status(&self) -> Status {
        (*self.stop_status.lock()).unwrap_or(Status::Crashed)
    }

    pub fn find_checker(&self, kind: CheckerKind) -> Option<Arc<dyn Checker>> {
        self.lists.lock().find(kind)
    }

    /// Interruptible sleep used by the speed throttle.
    pub fn snooze(&self, ms: u64) {
        let mut run = self.run.lock();
        if self.is_stopping() {
            return;
        }
        let _ = self
            .run_cv
            .wait_for(&mut run, Duration::from_millis(ms));
    }

    /// A directory is swept iff it is the global root, carries a link
    /// xattr, or its `..` chain reaches the root without crossing a remote
    /// MDT or the `.lustre` subtree.
    pub fn dir_worth_scanning(&self, fid: Fid) -> Result<bool> {
        if fid == self.root_fid {
            return Ok(true);
        }
        match self.store.xattr_get(fid, XATTR_LINK, &mut []) {
            Ok(_) => return Ok(true),
            Err(Errno::ENODATA) => {}
            Err(e) => return Err(e),
        }
        let mut cur = fid;
        for _ in 0..64 {
            let parent = match self.store.lookup(cur, b"..") {
                Ok(parent) => parent,
                Err(Errno::ENOENT) => return Ok(false),
                Err(e) => return Err(e),
            };
            if parent == self.root_fid {
                return Ok(true);
            }
            if parent.is_dot() || parent == cur || parent.is_zero() {
                return Ok(false);
            }
            if self.fld.mdt_index(parent.seq)? != self.node_index as u32 {
                return Ok(false);
            }
            cur = parent;
        }
        Ok(false)
    }

    /// Resolve this node's lost+found directory, creating the
    /// `.lustre/lost+found/MDT<idx>` chain on demand. The resolved FID is
    /// cached in the bookmark.
    pub fn lost_found_dir(&self) -> Result<Fid> {
        let cached: Fid = self.bookmark.read().lf_fid.into();
        if !cached.is_zero() && self.store.exists(cached)? {
            return Ok(cached);
        }

        self.ensure_dir(DOT_FID, self.root_fid, b".lustre")?;
        self.ensure_dir(LPF_FID, DOT_FID, b"lost+found")?;
        let name = format!("MDT{:04x}", self.node_index).into_bytes();
        let mdt_dir = match self.store.lookup(LPF_FID, &name) {
            Ok(fid) => fid,
            Err(Errno::ENOENT) => {
                let fid = self.store.alloc_fid()?;
                self.ensure_dir(fid, LPF_FID, &name)?;
                fid
            }
            Err(e) => return Err(e),
        };
        self.bookmark.update(|rec| rec.lf_fid = mdt_dir.into());
        self.bookmark.flush()?;
        Ok(mdt_dir)
    }

    fn ensure_dir(&self, fid: Fid, parent: Fid, name: &[u8]) -> Result<()> {
        if self.store.exists(fid)? {
            return Ok(());
        }
        let attr = Attr::directory(0o700, 0, 0);
        let mut tx = self.store.tx_create();
        tx.declare_create(fid)?;
        tx.declare_insert(fid, b".")?;
        tx.declare_insert(fid, b"..")?;
        tx.declare_insert(parent, name)?;
        tx.declare_ref_add(parent)?;
        tx.start()?;
        tx.create(fid, &attr)?;
        tx.insert(fid, b".", fid, DirentType::Dir)?;
        tx.insert(fid, b"..", parent, DirentType::Dir)?;
        tx.insert(parent, name, fid, DirentType::Dir)?;
        tx.ref_add(parent)?;
        tx.commit()
    }
}

/// The public control surface of one LFSCK instance.
pub struct Controller {
    inst: Arc<Instance>,
    engine_thread: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Controller {
    pub fn new(config: NodeConfig) -> Result<Controller> {
        let bookmark = CheckFile::new(
            config.store.clone(),
            BOOKMARK_FID,
            BookmarkRecord::default(),
        );
        // A bad or missing bookmark is rebuilt, not an error.
        let loaded = bookmark.load()?;
        let magic_ok = bookmark.read().magic.get() == BOOKMARK_MAGIC;
        if !loaded || !magic_ok {
            bookmark.update(|rec| {
                *rec = BookmarkRecord::default();
                rec.magic = BOOKMARK_MAGIC.into();
                rec.version = BOOKMARK_VERSION.into();
                rec.async_windows = 1024.into();
            });
            bookmark.flush()?;
        }
        let inst = Arc::new(Instance {
            node_index: config.node_index,
            role: config.role,
            root_fid: config.root_fid,
            store: config.store,
            lockmgr: config.lock_mgr,
            fld: config.fld,
            registry: TgtRegistry::new(),
            bookmark,
            params: RwLock::new(StartParams::default()),
            lists: Mutex::new(Lists::default()),
            pos_current: Mutex::new(Position::ZERO),
            speed: Mutex::new(Speed::new()),
            stopping: AtomicBool::new(false),
            stop_status: Mutex::new(None),
            run: Mutex::new(RunState { running: false }),
            run_cv: Condvar::new(),
            oit_over: AtomicBool::new(false),
            drop_dryrun: AtomicBool::new(false),
        });
        Ok(Controller {
            inst,
            engine_thread: Mutex::new(None),
        })
    }

    pub fn node_index(&self) -> u16 {
        self.inst.node_index
    }

    pub fn is_running(&self) -> bool {
        self.inst.run.lock().running
    }

    /// Register a peer target.
    pub fn add_target(
        &self,
        index: u16,
        store: Arc<dyn Store>,
        link: Arc<dyn crate::notify::PeerLink>,
        is_ost: bool,
    ) -> Result<()> {
        self.inst
            .registry
            .add(TgtDesc::new(index, store, link), is_ost)
    }

    pub fn del_target(&self, index: u16, is_ost: bool) -> Result<()> {
        self.inst.registry.del(index, is_ost)
    }

    /// Start a run. Builds the checkers for this node's role, prepares
    /// them, and spawns the engine thread.
    pub fn start(&self, params: StartParams) -> Result<()> {
        {
            let run = self.inst.run.lock();
            if run.running {
                return Err(Errno::EALREADY);
            }
        }
        info!(
            "lfsck: starting on node {} with flags {:?}",
            self.inst.node_index, params.flags
        );

        self.inst.stopping.store(false, Ordering::Release);
        self.inst.oit_over.store(false, Ordering::Release);
        *self.inst.stop_status.lock() = None;
        self.inst.registry.reset_run_state();

        // The previous run's dryrun setting decides whether this run
        // revisits the recorded first-inconsistency position.
        let prev_dryrun = ParamFlags::from_bits_truncate(self.inst.bookmark.read().param.get())
            .contains(ParamFlags::DRYRUN);
        self.inst.drop_dryrun.store(
            prev_dryrun && !params.flags.contains(ParamFlags::DRYRUN),
            Ordering::Release,
        );

        *self.inst.params.write() = params;
        self.inst.speed.lock().set_limit(params.speed_limit);
        self.inst.bookmark.update(|rec| {
            rec.param = params.flags.bits().into();
            rec.speed_limit = params.speed_limit.into();
            rec.async_windows = params.async_windows.into();
        });
        self.inst.bookmark.flush()?;

        // Build the role's checkers fresh for this run.
        let mut scan: Vec<Arc<dyn Checker>> = Vec::new();
        let mut dir: Vec<Arc<dyn Checker>> = Vec::new();
        match self.inst.role {
            NodeRole::Mdt => {
                if params.components.contains(Components::NAMESPACE) {
                    let namespace: Arc<dyn Checker> =
                        Arc::new(NamespaceChecker::new(self.inst.clone())?);
                    dir.push(namespace.clone());
                    scan.push(namespace);
                }
                if params.components.contains(Components::LAYOUT) {
                    scan.push(Arc::new(LayoutMaster::new(self.inst.clone())));
                }
            }
            NodeRole::Ost => {
                if params.components.contains(Components::LAYOUT) {
                    scan.push(Arc::new(LayoutSlave::new(self.inst.clone())));
                }
            }
        }
        if scan.is_empty() {
            return Err(Errno::EINVAL);
        }

        // Peer notifications may start arriving as soon as the assistants
        // spawn in prep, so the checkers must be findable first.
        {
            let mut lists = self.inst.lists.lock();
            lists.scan = scan.clone();
            lists.dir = dir;
            lists.double_scan.clear();
            lists.idle.clear();
        }

        let mut start_pos: Option<Position> = None;
        for com in &scan {
            let pos = com.prep(&params)?;
            start_pos = Some(match start_pos {
                None => pos,
                Some(cur) => cur.min(pos),
            });
        }
        if let Some(cookie) = params.start_pos {
            start_pos = Some(Position {
                oit_cookie: cookie,
                ..Position::ZERO
            });
        }
        *self.inst.pos_current.lock() = start_pos.unwrap_or(Position::ZERO);

        let handle = engine::spawn(self.inst.clone())?;
        *self.engine_thread.lock() = Some(handle);
        Ok(())
    }

    /// Stop the run (or record a pause). Blocks until every thread has
    /// exited.
    pub fn stop(&self, status: Status) -> Result<()> {
        info!(
            "lfsck: stop requested on node {} ({})",
            self.inst.node_index,
            status.name()
        );
        *self.inst.stop_status.lock() = Some(status);
        self.inst.stopping.store(true, Ordering::Release);
        self.inst.run_cv.notify_all();

        let checkers = self.inst.lists.lock().all();
        for com in &checkers {
            com.quit();
        }
        if let Some(handle) = self.engine_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    /// Wait for the run to finish on its own, polling the engine state.
    pub fn wait_done(&self, timeout: Duration) -> Result<()> {
        let deadline = std::time::Instant::now() + timeout;
        {
            let mut run = self.inst.run.lock();
            while run.running {
                if self
                    .inst
                    .run_cv
                    .wait_until(&mut run, deadline)
                    .timed_out()
                {
                    return Err(Errno::ETIMEDOUT);
                }
            }
        }
        if let Some(handle) = self.engine_thread.lock().take() {
            let _ = handle.join();
        }
        Ok(())
    }

    pub fn query(&self, kind: CheckerKind) -> Status {
        if let Some(com) = self.inst.find_checker(kind) {
            return com.query();
        }
        // No live checker: report from the last flushed record.
        let raw = match kind {
            CheckerKind::Layout => self
                .layout_record()
                .map(|rec| rec.status.get())
                .unwrap_or(0),
            CheckerKind::Namespace => self
                .namespace_record()
                .map(|rec| rec.status.get())
                .unwrap_or(0),
        };
        Status::try_from(raw).unwrap_or(Status::Init)
    }

    pub fn dump(&self, kind: CheckerKind) -> Result<String> {
        let mut out = String::new();
        match self.inst.find_checker(kind) {
            Some(com) => com.dump(&mut out)?,
            None => out.push_str("status: init\n"),
        }
        Ok(out)
    }

    pub fn get_speed(&self) -> u32 {
        self.inst.speed.lock().limit
    }

    pub fn set_speed(&self, limit: u32) -> Result<()> {
        self.inst.speed.lock().set_limit(limit);
        self.inst.bookmark.update(|rec| {
            rec.speed_limit = limit.into();
        });
        self.inst.bookmark.flush()
    }

    /// Entry point for peer notifications.
    pub fn in_notify(&self, req: &LfsckRequest) -> Result<()> {
        match req.event {
            Event::Start => {
                let params = StartParams {
                    components: req.kind.into(),
                    flags: req.param,
                    speed_limit: req.speed_limit,
                    async_windows: if req.async_windows == 0 {
                        1024
                    } else {
                        req.async_windows
                    },
                    start_pos: None,
                };
                match self.start(params) {
                    Ok(()) | Err(Errno::EALREADY) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            _ => match self.inst.find_checker(req.kind) {
                Some(com) => com.in_notify(req),
                None => {
                    warn!(
                        "lfsck: notification {:?} for inactive component {:?}",
                        req.event, req.kind
                    );
                    Err(Errno::ENODEV)
                }
            },
        }
    }

    /// Serve an orphan-index pull from the layout master.
    pub fn pull_orphans(&self) -> Result<Vec<OrphanRec>> {
        match self.inst.find_checker(CheckerKind::Layout) {
            Some(com) => com.pull_orphans(),
            None => Err(Errno::ENODEV),
        }
    }

    /// Last flushed layout record, if any run ever wrote one.
    pub fn layout_record(&self) -> Option<LayoutRecord> {
        crate::checkpoint::read_record(self.inst.store.as_ref(), LAYOUT_FILE_FID).ok()?
    }

    /// Last flushed namespace record, if any run ever wrote one.
    pub fn namespace_record(&self) -> Option<NamespaceRecord> {
        crate::checkpoint::read_record(self.inst.store.as_ref(), NAMESPACE_FILE_FID).ok()?
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        if self.is_running() {
            let _ = self.stop(Status::Paused);
        }
    }
}

/// Convenience formatter for dump output.
pub(crate) fn dump_time(out: &mut String, key: &str, secs: u64) {
    if secs == 0 {
        out.push_str(&format!("{key}: N/A\n"));
    } else {
        let now = now_secs();
        let ago = now.saturating_sub(secs);
        out.push_str(&format!("{key}: {ago} seconds ago\n"));
    }
}
