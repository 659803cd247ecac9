//! Peer target registry.
//!
//! Each node keeps a descriptor per registered peer: the store façade the
//! host provides for reaching the peer's objects, the notification link,
//! and per-run phase state. Descriptors are reference counted through
//! `Arc`, so a reader may drop the registry lock and keep using a
//! descriptor that is concurrently deregistered; deregistration only marks
//! it dead and unlinks it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::RwLock;

use crate::errno::{Errno, Result};
use crate::notify::PeerLink;
use crate::store::Store;

/// One registered peer target.
pub struct TgtDesc {
    pub index: u16,
    /// Store façade for the peer's objects (the host's object proxy).
    pub store: Arc<dyn Store>,
    /// Notification channel to the peer.
    pub link: Arc<dyn PeerLink>,
    dead: AtomicBool,
    /// Peer reported its layout phase-1 complete this run.
    layout_done: AtomicBool,
    /// Peer reported its namespace phase-1 complete this run.
    namespace_done: AtomicBool,
    /// Generation stamps bumped on every touch, used to decide which peers
    /// to re-query while waiting.
    pub layout_gen: AtomicU32,
    pub namespace_gen: AtomicU32,
}

impl TgtDesc {
    pub fn new(index: u16, store: Arc<dyn Store>, link: Arc<dyn PeerLink>) -> TgtDesc {
        TgtDesc {
            index,
            store,
            link,
            dead: AtomicBool::new(false),
            layout_done: AtomicBool::new(false),
            namespace_done: AtomicBool::new(false),
            layout_gen: AtomicU32::new(0),
            namespace_gen: AtomicU32::new(0),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    pub fn layout_done(&self) -> bool {
        self.layout_done.load(Ordering::Acquire)
    }

    pub fn set_layout_done(&self, done: bool) {
        self.layout_done.store(done, Ordering::Release);
    }

    pub fn namespace_done(&self) -> bool {
        self.namespace_done.load(Ordering::Acquire)
    }

    pub fn set_namespace_done(&self, done: bool) {
        self.namespace_done.store(done, Ordering::Release);
    }
}

#[derive(Default)]
struct Tables {
    osts: BTreeMap<u16, Arc<TgtDesc>>,
    mdts: BTreeMap<u16, Arc<TgtDesc>>,
}

/// Registry of peer OSTs and MDTs, read-mostly.
#[derive(Default)]
pub struct TgtRegistry {
    tables: RwLock<Tables>,
}

impl TgtRegistry {
    pub fn new() -> TgtRegistry {
        TgtRegistry::default()
    }

    pub fn add(&self, desc: TgtDesc, is_ost: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let table = if is_ost {
            &mut tables.osts
        } else {
            &mut tables.mdts
        };
        if table.contains_key(&desc.index) {
            return Err(Errno::EEXIST);
        }
        table.insert(desc.index, Arc::new(desc));
        Ok(())
    }

    pub fn del(&self, index: u16, is_ost: bool) -> Result<()> {
        let mut tables = self.tables.write();
        let table = if is_ost {
            &mut tables.osts
        } else {
            &mut tables.mdts
        };
        match table.remove(&index) {
            Some(desc) => {
                desc.dead.store(true, Ordering::Release);
                Ok(())
            }
            None => Err(Errno::ENOENT),
        }
    }

    pub fn ost(&self, index: u16) -> Option<Arc<TgtDesc>> {
        self.tables
            .read()
            .osts
            .get(&index)
            .filter(|d| !d.is_dead())
            .cloned()
    }

    pub fn mdt(&self, index: u16) -> Option<Arc<TgtDesc>> {
        self.tables
            .read()
            .mdts
            .get(&index)
            .filter(|d| !d.is_dead())
            .cloned()
    }

    pub fn osts(&self) -> Vec<Arc<TgtDesc>> {
        self.tables
            .read()
            .osts
            .values()
            .filter(|d| !d.is_dead())
            .cloned()
            .collect()
    }

    pub fn mdts(&self) -> Vec<Arc<TgtDesc>> {
        self.tables
            .read()
            .mdts
            .values()
            .filter(|d| !d.is_dead())
            .cloned()
            .collect()
    }

    /// Clear per-run phase state on every live descriptor.
    pub fn reset_run_state(&self) {
        let tables = self.tables.read();
        for desc in tables.osts.values().chain(tables.mdts.values()) {
            desc.set_layout_done(false);
            desc.set_namespace_done(false);
            desc.layout_gen.store(0, Ordering::Release);
            desc.namespace_gen.store(0, Ordering::Release);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checker::{CheckerKind, Status};
    use crate::memstore::MemStore;
    use crate::notify::{LfsckRequest, OrphanRec};

    struct NullLink;

    impl PeerLink for NullLink {
        fn notify(&self, _req: &LfsckRequest) -> Result<()> {
            Ok(())
        }

        fn query(&self, _kind: CheckerKind) -> Result<Status> {
            Ok(Status::Init)
        }

        fn pull_orphans(&self) -> Result<Vec<OrphanRec>> {
            Ok(Vec::new())
        }
    }

    fn desc(index: u16) -> TgtDesc {
        TgtDesc::new(index, Arc::new(MemStore::new(index)), Arc::new(NullLink))
    }

    #[test]
    fn add_lookup_del() {
        let reg = TgtRegistry::new();
        reg.add(desc(0), true).unwrap();
        reg.add(desc(1), true).unwrap();
        reg.add(desc(0), false).unwrap();
        assert_eq!(reg.add(desc(0), true), Err(Errno::EEXIST));

        assert_eq!(reg.osts().len(), 2);
        assert_eq!(reg.mdts().len(), 1);

        // Keep a reference across deregistration.
        let held = reg.ost(1).unwrap();
        reg.del(1, true).unwrap();
        assert!(held.is_dead());
        assert!(reg.ost(1).is_none());
        assert_eq!(reg.del(1, true), Err(Errno::ENOENT));
    }

    #[test]
    fn run_state_resets() {
        let reg = TgtRegistry::new();
        reg.add(desc(0), true).unwrap();
        let tgt = reg.ost(0).unwrap();
        tgt.set_layout_done(true);
        reg.reset_run_state();
        assert!(!tgt.layout_done());
    }
}
