//! Distributed lock manager interface.
//!
//! Repairs serialize against live clients through inode-bits locks: a
//! resource name derived from the FID, a set of capability bits, and a
//! mode. Only the semantics the checkers need are modelled here; the wire
//! protocol belongs to the host. `LocalLockMgr` is a process-local
//! implementation with real blocking and timeout behavior, used by the
//! test-suite.

use std::collections::HashMap;
use std::time::Duration;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex};

use crate::errno::{Errno, Result};
use crate::fid::ResId;

bitflags! {
    /// Inode capability bits a lock covers. Locks on the same resource
    /// conflict only when their bit sets intersect.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockBits: u64 {
        const LOOKUP = 0x01;
        const UPDATE = 0x02;
        const OPEN   = 0x04;
        const LAYOUT = 0x08;
        const PERM   = 0x10;
        const XATTR  = 0x20;
    }
}

/// Lock compatibility modes, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Ex,
    Pw,
    Pr,
    Cw,
    Cr,
}

impl LockMode {
    /// Standard DLM compatibility matrix.
    pub fn compatible(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (Ex, _) | (_, Ex) => false,
            (Pw, Cr) | (Cr, Pw) => true,
            (Pw, _) | (_, Pw) => false,
            (Pr, Pr) | (Pr, Cr) | (Cr, Pr) => true,
            (Pr, Cw) | (Cw, Pr) => false,
            (Cw, Cw) | (Cw, Cr) | (Cr, Cw) => true,
            (Cr, Cr) => true,
        }
    }
}

/// Opaque handle to a granted lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockHandle(u64);

pub trait LockMgr: Send + Sync {
    /// Block until the lock is granted or the timeout expires
    /// (`ETIMEDOUT`).
    fn enqueue(
        &self,
        res: ResId,
        bits: LockBits,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockHandle>;

    fn decref(&self, handle: LockHandle);
}

#[derive(Clone, Copy)]
struct Grant {
    res: ResId,
    bits: LockBits,
    mode: LockMode,
}

#[derive(Default)]
struct LockState {
    granted: HashMap<u64, Grant>,
    next_handle: u64,
}

/// Process-local lock manager with real contention semantics.
#[derive(Default)]
pub struct LocalLockMgr {
    state: Mutex<LockState>,
    released: Condvar,
}

impl LocalLockMgr {
    pub fn new() -> LocalLockMgr {
        LocalLockMgr::default()
    }

    fn conflicts(state: &LockState, res: ResId, bits: LockBits, mode: LockMode) -> bool {
        state.granted.values().any(|g| {
            g.res == res && g.bits.intersects(bits) && !g.mode.compatible(mode)
        })
    }
}

impl LockMgr for LocalLockMgr {
    fn enqueue(
        &self,
        res: ResId,
        bits: LockBits,
        mode: LockMode,
        timeout: Duration,
    ) -> Result<LockHandle> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.state.lock();
        while Self::conflicts(&state, res, bits, mode) {
            if self.released.wait_until(&mut state, deadline).timed_out() {
                return Err(Errno::ETIMEDOUT);
            }
        }
        state.next_handle += 1;
        let handle = state.next_handle;
        state.granted.insert(handle, Grant { res, bits, mode });
        Ok(LockHandle(handle))
    }

    fn decref(&self, handle: LockHandle) {
        let mut state = self.state.lock();
        if state.granted.remove(&handle.0).is_some() {
            self.released.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::Fid;
    use std::sync::Arc;

    fn res() -> ResId {
        ResId::from_fid(Fid::new(0x2_0000_0400, 1, 0))
    }

    #[test]
    fn readers_share_writers_exclude() {
        let mgr = LocalLockMgr::new();
        let short = Duration::from_millis(10);
        let r1 = mgr
            .enqueue(res(), LockBits::UPDATE, LockMode::Pr, short)
            .unwrap();
        let r2 = mgr
            .enqueue(res(), LockBits::UPDATE, LockMode::Pr, short)
            .unwrap();
        assert_eq!(
            mgr.enqueue(res(), LockBits::UPDATE, LockMode::Pw, short),
            Err(Errno::ETIMEDOUT)
        );
        mgr.decref(r1);
        mgr.decref(r2);
        mgr.enqueue(res(), LockBits::UPDATE, LockMode::Pw, short)
            .unwrap();
    }

    #[test]
    fn disjoint_bits_do_not_conflict() {
        let mgr = LocalLockMgr::new();
        let short = Duration::from_millis(10);
        let _w = mgr
            .enqueue(res(), LockBits::LAYOUT, LockMode::Ex, short)
            .unwrap();
        mgr.enqueue(res(), LockBits::LOOKUP, LockMode::Ex, short)
            .unwrap();
    }

    #[test]
    fn release_wakes_waiter() {
        let mgr = Arc::new(LocalLockMgr::new());
        let held = mgr
            .enqueue(res(), LockBits::XATTR, LockMode::Ex, Duration::from_secs(5))
            .unwrap();
        let mgr2 = mgr.clone();
        let waiter = std::thread::spawn(move || {
            mgr2.enqueue(res(), LockBits::XATTR, LockMode::Ex, Duration::from_secs(5))
        });
        std::thread::sleep(Duration::from_millis(20));
        mgr.decref(held);
        assert!(waiter.join().unwrap().is_ok());
    }
}
