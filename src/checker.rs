//! The checker capability surface.
//!
//! Each consistency component (namespace, layout master, layout slave)
//! implements [`Checker`]: the engine drives `exec_oit`/`exec_dir` during
//! phase-1, `post` at the end of the sweep and `double_scan` for phase-2,
//! while the controller routes peer notifications and operator queries.

use bitflags::bitflags;
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::errno::Result;
use crate::fid::Fid;
use crate::notify::{LfsckRequest, OrphanRec};
use crate::ondisk::{ParamFlags, PositionRecord};
use crate::store::Dirent;

/// Run state of a checker, persisted in its status record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum Status {
    /// Freshly created record; nothing has run yet.
    Init = 0,
    ScanningPhase1 = 1,
    ScanningPhase2 = 2,
    Completed = 3,
    /// Stopped on an internal failure; will not restart by itself.
    Failed = 4,
    /// Stopped by the operator; will not restart by itself.
    Stopped = 5,
    /// Paused with the device; resumes on the next setup.
    Paused = 6,
    /// The server went down mid-run; resumes from the checkpoint.
    Crashed = 7,
    /// Phase-1 completed but some targets could not participate.
    Partial = 8,
    /// A peer told us it failed.
    CoFailed = 9,
    /// A peer told us to stop.
    CoStopped = 10,
    /// A peer paused.
    CoPaused = 11,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Stopped)
    }

    pub fn name(self) -> &'static str {
        match self {
            Status::Init => "init",
            Status::ScanningPhase1 => "scanning-phase1",
            Status::ScanningPhase2 => "scanning-phase2",
            Status::Completed => "completed",
            Status::Failed => "failed",
            Status::Stopped => "stopped",
            Status::Paused => "paused",
            Status::Crashed => "crashed",
            Status::Partial => "partial",
            Status::CoFailed => "co-failed",
            Status::CoStopped => "co-stopped",
            Status::CoPaused => "co-paused",
        }
    }
}

/// The consistency components.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckerKind {
    Layout,
    Namespace,
}

impl CheckerKind {
    pub fn name(self) -> &'static str {
        match self {
            CheckerKind::Layout => "lfsck_layout",
            CheckerKind::Namespace => "lfsck_namespace",
        }
    }
}

bitflags! {
    /// Component mask of a start request.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Components: u16 {
        const LAYOUT    = 0x01;
        const NAMESPACE = 0x02;
    }
}

impl From<CheckerKind> for Components {
    fn from(kind: CheckerKind) -> Components {
        match kind {
            CheckerKind::Layout => Components::LAYOUT,
            CheckerKind::Namespace => Components::NAMESPACE,
        }
    }
}

/// Scan position. The object-table cookie dominates; a position inside a
/// directory sub-scan orders after the bare object-table position of the
/// same object.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub oit_cookie: u64,
    pub dir_parent: Fid,
    pub dir_cookie: u64,
}

impl Position {
    pub const ZERO: Position = Position {
        oit_cookie: 0,
        dir_parent: Fid::ZERO,
        dir_cookie: 0,
    };

    pub fn is_zero(&self) -> bool {
        self.oit_cookie == 0 && self.dir_parent.is_zero()
    }
}

impl Ord for Position {
    fn cmp(&self, other: &Position) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        self.oit_cookie.cmp(&other.oit_cookie).then_with(|| {
            match (self.dir_parent.is_zero(), other.dir_parent.is_zero()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => self
                    .dir_parent
                    .cmp(&other.dir_parent)
                    .then(self.dir_cookie.cmp(&other.dir_cookie)),
            }
        })
    }
}

impl PartialOrd for Position {
    fn partial_cmp(&self, other: &Position) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl From<PositionRecord> for Position {
    fn from(rec: PositionRecord) -> Position {
        Position {
            oit_cookie: rec.oit_cookie.get(),
            dir_parent: rec.dir_parent.into(),
            dir_cookie: rec.dir_cookie.get(),
        }
    }
}

impl From<Position> for PositionRecord {
    fn from(pos: Position) -> PositionRecord {
        PositionRecord {
            oit_cookie: pos.oit_cookie.into(),
            dir_parent: pos.dir_parent.into(),
            dir_cookie: pos.dir_cookie.into(),
        }
    }
}

/// Operator parameters for one run.
#[derive(Clone, Copy, Debug)]
pub struct StartParams {
    /// Which components this run covers.
    pub components: Components,
    pub flags: ParamFlags,
    /// Items per second; 0 means unthrottled.
    pub speed_limit: u32,
    /// Flow-control window between the scan producer and each assistant.
    pub async_windows: u16,
    /// Explicit object-table start position, overriding the checkpoint.
    pub start_pos: Option<u64>,
}

impl Default for StartParams {
    fn default() -> StartParams {
        StartParams {
            components: Components::all(),
            flags: ParamFlags::empty(),
            speed_limit: 0,
            async_windows: 1024,
            start_pos: None,
        }
    }
}

/// One consistency component plugged into the scan engine.
pub trait Checker: Send + Sync {
    fn kind(&self) -> CheckerKind;

    /// Reset the persistent record to a pristine state. `init` discards the
    /// longitudinal fields as well; otherwise `success_count` and
    /// `time_last_complete` survive.
    fn reset(&self, init: bool) -> Result<()>;

    /// Account a failure the engine hit on this checker's behalf.
    fn fail(&self, new_checked: bool);

    fn checkpoint(&self, init: bool) -> Result<()>;

    /// Prepare for a run. Returns the position this checker wants the
    /// engine to start from.
    fn prep(&self, params: &StartParams) -> Result<Position>;

    fn exec_oit(&self, fid: Fid) -> Result<()>;

    fn exec_dir(&self, dir: Fid, ent: &Dirent) -> Result<()>;

    /// Phase-1 is over; `result > 0` means the sweep was complete. Blocks
    /// until the assistant has acknowledged and notified peers.
    fn post(&self, result: i32) -> Result<()>;

    /// Run phase-2. Blocks until it completes, fails, or the run stops.
    fn double_scan(&self) -> Result<()>;

    /// Render the full status record as `key: value` text.
    fn dump(&self, out: &mut String) -> Result<()>;

    /// Peer notification routed from the controller.
    fn in_notify(&self, req: &LfsckRequest) -> Result<()>;

    fn query(&self) -> Status;

    /// Serve the orphan pseudo-index (layout slave only).
    fn pull_orphans(&self) -> Result<Vec<OrphanRec>> {
        Err(crate::errno::Errno::ENOTSUP)
    }

    /// Tear the assistant down and release run resources.
    fn quit(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_u32() {
        for raw in 0..=11u32 {
            let st = Status::try_from(raw).unwrap();
            assert_eq!(u32::from(st), raw);
        }
        assert!(Status::try_from(99u32).is_err());
    }

    #[test]
    fn position_order() {
        let oit = |c| Position {
            oit_cookie: c,
            ..Position::ZERO
        };
        let dir = |c, d| Position {
            oit_cookie: c,
            dir_parent: Fid::new(0x2_0000_0400, 1, 0),
            dir_cookie: d,
        };
        assert!(oit(1) < oit(2));
        // A bare position sorts before a sub-scan of the same object.
        assert!(oit(5) < dir(5, 0));
        assert!(dir(5, 3) < dir(5, 9));
        assert!(dir(5, 9) < oit(6));
    }
}
