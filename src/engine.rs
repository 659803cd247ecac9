//! The master scan engine.
//!
//! A dedicated thread sweeps the object table from the prepared position,
//! dispatching every live object to the enabled checkers; directories worth
//! scanning get a nested sub-sweep over their entries in hash order. The
//! loop owns checkpoint timing, the speed throttle, and the orderly
//! phase-1 → phase-2 handoff.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use zerocopy::{FromBytes, IntoBytes};

use crate::checker::Position;
use crate::controller::{Instance, NodeRole};
use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::ondisk::{LMA_COMPAT_FID_ON_OST, LmaAttrs, XATTR_LMA};
use crate::store::XattrFlags;

pub(crate) const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn the engine thread and wait until it is up (or has failed to
/// start).
pub(crate) fn spawn(inst: Arc<Instance>) -> Result<std::thread::JoinHandle<()>> {
    {
        let mut run = inst.run.lock();
        run.running = true;
    }
    let inst2 = inst.clone();
    let handle = std::thread::Builder::new()
        .name("lfsck".into())
        .spawn(move || engine_main(inst2))
        .map_err(|e| {
            error!("lfsck: cannot start engine thread: {e}");
            inst.run.lock().running = false;
            Errno::ENOMEM
        })?;
    Ok(handle)
}

fn engine_main(inst: Arc<Instance>) {
    info!(
        "lfsck: engine starts from {:?} on node {}",
        *inst.pos_current.lock(),
        inst.node_index
    );

    if let Err(e) = oit_engine(&inst) {
        error!("lfsck: engine failed: {e}");
        let mut status = inst.stop_status.lock();
        if status.is_none() {
            *status = Some(crate::checker::Status::Failed);
        }
    }
    let swept = inst.oit_over.load(Ordering::Acquire);
    let result = if swept && !inst.is_stopping() { 1 } else { 0 };

    // Phase-1 is over one way or the other; let every checker settle its
    // record and notify peers.
    let scan = inst.lists.lock().scan.clone();
    for com in &scan {
        if let Err(e) = com.post(result) {
            warn!("lfsck: {:?} post failed: {}", com.kind(), e);
        }
    }

    if result > 0 {
        {
            let mut lists = inst.lists.lock();
            let moved = std::mem::take(&mut lists.scan);
            lists.dir.clear();
            lists.double_scan = moved;
        }
        let doubles = inst.lists.lock().double_scan.clone();
        for com in &doubles {
            if let Err(e) = com.double_scan() {
                warn!("lfsck: {:?} double scan failed: {}", com.kind(), e);
            }
        }
    }

    let _ = inst.bookmark.flush();
    info!("lfsck: engine exits on node {}", inst.node_index);
    let mut run = inst.run.lock();
    run.running = false;
    inst.run_cv.notify_all();
}

/// The object-table sweep. Sets `oit_over` when the whole table was
/// covered.
fn oit_engine(inst: &Arc<Instance>) -> Result<()> {
    let start = *inst.pos_current.lock();
    // A checkpoint taken inside a directory sub-scan resumes there first;
    // the directory object itself was already dispatched before the
    // checkpoint, so the object sweep continues past it.
    let mut pending_dir: Option<(Fid, u64)> = if start.dir_parent.is_zero() {
        None
    } else {
        Some((start.dir_parent, start.dir_cookie))
    };
    let oit_start = start.oit_cookie + u64::from(pending_dir.is_some());
    let mut it = inst.store.oit_iter(oit_start)?;
    let mut last_checkpoint = Instant::now();

    loop {
        if let Some((dir, cookie)) = pending_dir.take() {
            if !dir_engine(inst, dir, cookie, &mut last_checkpoint)? {
                return Ok(());
            }
        }
        if inst.is_stopping() {
            return Ok(());
        }

        let Some((cookie, fid)) = it.next()? else {
            inst.oit_over.store(true, Ordering::Release);
            break;
        };
        {
            let mut pos = inst.pos_current.lock();
            *pos = Position {
                oit_cookie: cookie,
                ..Position::ZERO
            };
        }
        maybe_checkpoint(inst, &mut last_checkpoint)?;
        control_speed(inst);

        if fid.is_last_id() {
            // Object id 0 is the LAST_ID counter in these sequences; it is
            // not an object and there is nothing to repair about it here.
            debug!("lfsck: skip LAST_ID marker {fid}");
            continue;
        }
        if fid.is_reserved_local() || fid.is_dot() {
            continue;
        }
        if inst.role == NodeRole::Ost
            && fid.is_idif()
            && fid.idif_ost_idx() != inst.node_index
        {
            if let Err(e) = update_lma(inst, fid) {
                warn!("lfsck: cannot upgrade lma of {fid}: {e}");
            }
        }

        if !inst.store.exists(fid)? || inst.store.is_dead(fid)? {
            continue;
        }
        if inst.role == NodeRole::Mdt
            && inst.fld.mdt_index(fid.seq).map(|i| i != inst.node_index as u32) == Ok(true)
        {
            // Remote object: phase-3 territory, not scanned here.
            continue;
        }

        let scan = inst.lists.lock().scan.clone();
        for com in &scan {
            if let Err(e) = com.exec_oit(fid) {
                com.fail(true);
                if inst.failout() {
                    return Err(e);
                }
            }
        }

        let attr = match inst.store.attr_get(fid) {
            Ok(attr) => attr,
            Err(Errno::ENOENT) => continue,
            Err(e) => return Err(e),
        };
        if attr.is_dir() && !inst.lists.lock().dir.is_empty() {
            match inst.dir_worth_scanning(fid) {
                Ok(true) => pending_dir = Some((fid, 0)),
                Ok(false) => {}
                Err(e) => {
                    if inst.failout() {
                        return Err(e);
                    }
                }
            }
        }
    }
    Ok(())
}

/// Sub-sweep over one directory's entries. Returns false when the run was
/// stopped mid-directory.
fn dir_engine(
    inst: &Arc<Instance>,
    dir: Fid,
    start_cookie: u64,
    last_checkpoint: &mut Instant,
) -> Result<bool> {
    let mut it = match inst.store.dir_iter(dir, start_cookie) {
        Ok(it) => it,
        // The directory went away since the object sweep saw it.
        Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => return Ok(true),
        Err(e) => return Err(e),
    };
    loop {
        let Some(ent) = it.next()? else { break };
        {
            let mut pos = inst.pos_current.lock();
            pos.dir_parent = dir;
            // Resume restarts with the entry after this one.
            pos.dir_cookie = ent.cookie + 1;
        }
        if !ent.flags.contains(crate::store::DirentFlags::IGNORE) {
            let coms = inst.lists.lock().dir.clone();
            for com in &coms {
                if let Err(e) = com.exec_dir(dir, &ent) {
                    com.fail(true);
                    if inst.failout() {
                        return Err(e);
                    }
                }
            }
        }
        control_speed(inst);
        maybe_checkpoint(inst, last_checkpoint)?;
        if inst.is_stopping() {
            return Ok(false);
        }
    }
    let mut pos = inst.pos_current.lock();
    pos.dir_parent = Fid::ZERO;
    pos.dir_cookie = 0;
    Ok(true)
}

fn maybe_checkpoint(inst: &Arc<Instance>, last: &mut Instant) -> Result<()> {
    if last.elapsed() < CHECKPOINT_INTERVAL {
        return Ok(());
    }
    checkpoint_all(inst)?;
    *last = Instant::now();
    Ok(())
}

pub(crate) fn checkpoint_all(inst: &Arc<Instance>) -> Result<()> {
    let scan = inst.lists.lock().scan.clone();
    for com in &scan {
        com.checkpoint(false)?;
    }
    Ok(())
}

/// Throttle: after `sleep_rate` objects, sleep `sleep_ms` interruptibly.
fn control_speed(inst: &Arc<Instance>) {
    let sleep_ms = {
        let mut speed = inst.speed.lock();
        if speed.sleep_rate == 0 {
            return;
        }
        speed.new_scanned += 1;
        if speed.new_scanned < speed.sleep_rate {
            return;
        }
        speed.new_scanned = 0;
        speed.sleep_ms
    };
    inst.snooze(sleep_ms);
}

/// An IDIF object whose embedded OST index disagrees with this server: the
/// self-FID in its lma is rewritten with the local index and the
/// FID-on-OST compat bit.
fn update_lma(inst: &Arc<Instance>, fid: Fid) -> Result<()> {
    let corrected = Fid::idif(fid.idif_id(), inst.node_index);
    let mut lma = match crate::store::read_xattr(inst.store.as_ref(), fid, XATTR_LMA) {
        Ok(buf) => match LmaAttrs::read_from_prefix(&buf) {
            Ok((lma, _)) => lma,
            Err(_) => LmaAttrs::default(),
        },
        Err(Errno::ENODATA) => LmaAttrs::default(),
        Err(e) => return Err(e),
    };
    if Fid::from(lma.self_fid) == corrected
        && lma.compat.get() & LMA_COMPAT_FID_ON_OST != 0
    {
        return Ok(());
    }
    lma.compat = (lma.compat.get() | LMA_COMPAT_FID_ON_OST).into();
    lma.self_fid = corrected.into();

    let mut tx = inst.store.tx_create();
    tx.declare_xattr_set(fid, XATTR_LMA, size_of::<LmaAttrs>())?;
    tx.start()?;
    tx.xattr_set(fid, XATTR_LMA, lma.as_bytes(), XattrFlags::empty())?;
    tx.commit()
}
