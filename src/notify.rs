//! Peer coordination events.
//!
//! State changes that matter across servers travel as small request
//! records over an asynchronous notification channel supplied by the host;
//! this crate only defines the records and the delivery trait. A failed
//! delivery marks the peer's checker incomplete on the sender side and the
//! run carries on.

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::checker::{CheckerKind, Status};
use crate::errno::Result;
use crate::fid::Fid;
use crate::ondisk::ParamFlags;

/// Cross-server event codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Event {
    /// Coordinator tells a peer to begin phase-1.
    Start = 1,
    /// Coordinator tells a peer to cease work with the given status.
    Stop = 2,
    /// Poll a peer's phase.
    Query = 3,
    /// A peer finished its phase-1 sweep.
    Phase1Done = 4,
    /// A peer finished phase-2.
    Phase2Done = 5,
    /// A peer crashed or was stopped locally.
    PeerExit = 6,
    /// Layout master marks an OST object as referenced by some inode.
    FidAccessed = 7,
    /// An OST found its LAST_ID behind reality and is rebuilding it.
    LastIdRebuilding = 8,
    LastIdRebuilt = 9,
    /// Install a repaired striped-directory master image.
    SetLmvMaster = 10,
    /// Install a repaired striped-directory shard image.
    SetLmvSlave = 11,
}

/// One notification. Fields beyond `event`/`kind`/`index` are meaningful
/// only for the events that use them.
#[derive(Clone, Copy, Debug)]
pub struct LfsckRequest {
    pub event: Event,
    pub kind: CheckerKind,
    /// Sender's node index.
    pub index: u16,
    /// Wire status (negative errno) for Stop/PeerExit, phase for replies.
    pub status: i32,
    /// Sender's run flags.
    pub flags: u32,
    /// Run parameters, for Start.
    pub param: ParamFlags,
    pub speed_limit: u32,
    pub async_windows: u16,
    /// Object the event refers to (FidAccessed, SetLmv*).
    pub fid: Fid,
    /// Secondary object (SetLmv* master directory).
    pub fid2: Fid,
    pub stripe_count: u32,
    pub hash_type: u32,
}

impl LfsckRequest {
    pub fn new(event: Event, kind: CheckerKind, index: u16) -> LfsckRequest {
        LfsckRequest {
            event,
            kind,
            index,
            status: 0,
            flags: 0,
            param: ParamFlags::empty(),
            speed_limit: 0,
            async_windows: 0,
            fid: Fid::ZERO,
            fid2: Fid::ZERO,
            stripe_count: 0,
            hash_type: 0,
        }
    }
}

/// One record from an OST's orphan pseudo-index: an object the scan found
/// that no inode ever claimed. The claimed parent's `ver` field carries the
/// stripe slot, exactly as the filter-fid stores it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OrphanRec {
    pub fid: Fid,
    pub parent: Fid,
    pub uid: u32,
    pub gid: u32,
}

/// Delivery channel to one peer. Implemented over the host's RPC layer; the
/// test-suite wires controllers back to back.
pub trait PeerLink: Send + Sync {
    /// Asynchronous notification with a replied status.
    fn notify(&self, req: &LfsckRequest) -> Result<()>;

    /// Poll the peer's phase for the given component.
    fn query(&self, kind: CheckerKind) -> Result<Status>;

    /// Drain the peer's orphan pseudo-index (layout slave peers only).
    fn pull_orphans(&self) -> Result<Vec<OrphanRec>>;
}
