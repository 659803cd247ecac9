//! Miniature cluster harness: one MDT controller plus any number of OST
//! controllers, all backed by in-memory stores, sharing one lock manager,
//! with peer notifications wired back-to-back in process.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use lfsck::linkea::LinkEa;
use lfsck::lov::LovLayout;
use lfsck::ondisk::{XATTR_FILTER_FID, XATTR_LINK, XATTR_LOV};
use lfsck::{
    Attr, CheckerKind, Controller, DirentType, Fid, LfsckRequest, LocalFld, LocalLockMgr, LockMgr,
    MemStore, NodeConfig, NodeRole, OrphanRec, PeerLink, Result, StartParams, Status, Store,
    ondisk,
};

/// Delivers notifications by calling straight into the peer controller.
pub struct Loopback(pub Arc<Controller>);

impl PeerLink for Loopback {
    fn notify(&self, req: &LfsckRequest) -> Result<()> {
        self.0.in_notify(req)
    }

    fn query(&self, kind: CheckerKind) -> Result<Status> {
        Ok(self.0.query(kind))
    }

    fn pull_orphans(&self) -> Result<Vec<OrphanRec>> {
        self.0.pull_orphans()
    }
}

pub struct Cluster {
    pub mdt: Arc<Controller>,
    pub mdt_store: MemStore,
    pub osts: Vec<(Arc<Controller>, MemStore)>,
}

pub fn cluster(n_osts: u16) -> Cluster {
    let _ = env_logger::builder().is_test(true).try_init();
    let lock_mgr: Arc<dyn LockMgr> = Arc::new(LocalLockMgr::new());

    let mdt_store = MemStore::new(0);
    mdt_store.put_object(Fid::ROOT, Attr::directory(0o755, 0, 0));
    mdt_store.put_entry(Fid::ROOT, b".", Fid::ROOT, DirentType::Dir);
    mdt_store.put_entry(Fid::ROOT, b"..", Fid::ROOT, DirentType::Dir);

    let mdt = Arc::new(
        Controller::new(NodeConfig {
            node_index: 0,
            role: NodeRole::Mdt,
            store: Arc::new(mdt_store.clone()),
            lock_mgr: lock_mgr.clone(),
            fld: Arc::new(LocalFld { index: 0 }),
            root_fid: Fid::ROOT,
        })
        .unwrap(),
    );

    let mut osts = Vec::new();
    for i in 0..n_osts {
        let store = MemStore::new(100 + i);
        let ost = Arc::new(
            Controller::new(NodeConfig {
                node_index: i,
                role: NodeRole::Ost,
                store: Arc::new(store.clone()),
                lock_mgr: lock_mgr.clone(),
                fld: Arc::new(LocalFld { index: 0 }),
                root_fid: Fid::ROOT,
            })
            .unwrap(),
        );
        mdt.add_target(i, Arc::new(store.clone()), Arc::new(Loopback(ost.clone())), true)
            .unwrap();
        ost.add_target(
            0,
            Arc::new(mdt_store.clone()),
            Arc::new(Loopback(mdt.clone())),
            false,
        )
        .unwrap();
        osts.push((ost, store));
    }

    Cluster {
        mdt,
        mdt_store,
        osts,
    }
}

impl Cluster {
    pub fn ost_store(&self, i: usize) -> &MemStore {
        &self.osts[i].1
    }

    /// Start a run on the MDT and wait until every node has finished.
    pub fn run(&self, params: StartParams) {
        self.mdt.start(params).unwrap();
        self.mdt.wait_done(Duration::from_secs(60)).unwrap();
        for (ost, _) in &self.osts {
            ost.wait_done(Duration::from_secs(60)).unwrap();
        }
    }

    /// A directory under `parent`, wired with `.`/`..` and a link xattr.
    pub fn mkdir(&self, parent: Fid, name: &[u8], fid: Fid) {
        self.mdt_store.put_object(fid, Attr::directory(0o755, 0, 0));
        self.mdt_store.put_entry(fid, b".", fid, DirentType::Dir);
        self.mdt_store.put_entry(fid, b"..", parent, DirentType::Dir);
        self.mdt_store.put_entry(parent, name, fid, DirentType::Dir);
        let ea = LinkEa::with_entry(parent, name).unwrap();
        self.mdt_store.put_xattr(fid, XATTR_LINK, ea.as_bytes());
    }

    /// A regular file under `parent` with a matching link xattr.
    pub fn mkfile(&self, parent: Fid, name: &[u8], fid: Fid, uid: u32, gid: u32) {
        self.mdt_store.put_object(fid, Attr::regular(0o644, uid, gid));
        self.mdt_store.put_entry(parent, name, fid, DirentType::Reg);
        let ea = LinkEa::with_entry(parent, name).unwrap();
        self.mdt_store.put_xattr(fid, XATTR_LINK, ea.as_bytes());
    }

    pub fn set_lov(&self, fid: Fid, lov: &LovLayout) {
        self.mdt_store.put_xattr(fid, XATTR_LOV, &lov.to_bytes());
    }

    pub fn read_lov(&self, fid: Fid) -> LovLayout {
        let buf = lfsck::read_xattr(&self.mdt_store, fid, XATTR_LOV).unwrap();
        LovLayout::parse(&buf).unwrap()
    }

    /// An object on OST `i`, optionally carrying a filter-fid back
    /// pointer.
    pub fn mk_ost_object(
        &self,
        i: usize,
        fid: Fid,
        backref: Option<(Fid, u32)>,
        uid: u32,
        gid: u32,
    ) {
        let store = self.ost_store(i);
        store.put_object(
            fid,
            Attr {
                mode: libc::S_IFREG | 0o666,
                nlink: 1,
                uid,
                gid,
                size: 4096,
                blocks: 8,
                ctime: 1,
            },
        );
        if let Some((parent, slot)) = backref {
            let ff = ondisk::FilterFid::new(parent, slot);
            store.put_xattr(fid, XATTR_FILTER_FID, &ff.to_bytes());
        }
    }

    pub fn read_filter_fid(&self, i: usize, fid: Fid) -> ondisk::FilterFid {
        let buf = lfsck::read_xattr(self.ost_store(i), fid, XATTR_FILTER_FID).unwrap();
        ondisk::FilterFid::parse(&buf).unwrap()
    }

    /// Seed the per-sequence LAST_ID counter on an OST.
    pub fn set_last_id(&self, i: usize, seq: u64, value: u64) {
        self.ost_store(i)
            .put_record(Fid::new(seq, 0, 0), &value.to_le_bytes());
    }

    /// Resolve this MDT's lost+found directory after a run created it.
    pub fn lost_found(&self) -> Fid {
        let dot = self.mdt_store.lookup(Fid::ROOT, b".lustre").unwrap();
        let lpf = self.mdt_store.lookup(dot, b"lost+found").unwrap();
        self.mdt_store.lookup(lpf, b"MDT0000").unwrap()
    }
}
