//! Striped-directory reconciliation.
//!
//! A striped directory's master image and its shards' slave images must
//! tell the same story: shard count, hash policy, master index, and one
//! shard FID per slot. Phase-1 validates each shard entry against the
//! master as it streams past, and checks that every name inside a shard
//! hashes to that shard; a directory whose master image is missing or
//! whose hash policy is unusable is deferred to phase-2, which can see
//! all shards at once.
//!
//! A name that does not hash to the shard it lives in is never migrated.
//! The master's hash field is rewritten to `UNKNOWN` with the `BAD_TYPE`
//! marker instead: the directory stays usable for lookup, readdir and
//! unlink, refuses new entries, and later runs recognize the marker and
//! leave the master alone. The marker also distinguishes that state from
//! plain corruption of the hash field, which is settled from the first
//! shard still carrying a valid hash type.

use log::{info, warn};

use crate::controller::Instance;
use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::linkea::LinkEa;
use crate::lmv::{LmvLayout, name_to_stripe_index, parse_shard_name};
use crate::notify::{Event, LfsckRequest};
use crate::ondisk::{
    LMV_HASH_TYPE_UNKNOWN, LMV_MAGIC_STRIPE, LmvHashFlags, TraceFlags, XATTR_LINK, XATTR_LMV,
};
use crate::store::{XattrFlags, read_xattr};

use super::{NamespaceReq, NsHandler, note_inconsistency};

pub(super) fn read_lmv(inst: &Instance, fid: Fid) -> Result<Option<LmvLayout>> {
    match read_xattr(inst.store.as_ref(), fid, XATTR_LMV) {
        Ok(buf) => Ok(LmvLayout::parse(&buf).ok()),
        Err(Errno::ENODATA) => Ok(None),
        Err(e) => Err(e),
    }
}

pub(super) fn write_lmv(inst: &Instance, fid: Fid, lmv: &LmvLayout) -> Result<()> {
    let bytes = lmv.to_bytes();
    let mut tx = inst.store.tx_create();
    tx.declare_xattr_set(fid, XATTR_LMV, bytes.len())?;
    tx.start()?;
    tx.xattr_set(fid, XATTR_LMV, &bytes, XattrFlags::empty())?;
    tx.commit()
}

/// Apply a SET_LMV_* notification: a coordinator decided what this node's
/// copy of a striped directory's metadata must look like.
pub(super) fn install_lmv(inst: &std::sync::Arc<Instance>, req: &LfsckRequest) -> Result<()> {
    let lmv = match req.event {
        Event::SetLmvMaster => {
            let mut lmv = match read_lmv(inst, req.fid)? {
                Some(cur) if cur.is_master() => cur,
                _ => LmvLayout::new_master(req.stripe_count, req.index as u32, req.hash_type),
            };
            lmv.stripe_count = req.stripe_count;
            lmv.hash_type = req.hash_type;
            lmv
        }
        Event::SetLmvSlave => {
            let mut lmv = LmvLayout::new_stripe(req.stripe_count, req.index as u32, req.hash_type);
            lmv.master_mdt_index = req.index as u32;
            lmv
        }
        _ => return Err(Errno::EINVAL),
    };
    write_lmv(inst, req.fid, &lmv)
}

impl NsHandler {
    /// Phase-1 look at one shard entry of a (possibly) striped directory.
    pub(super) fn check_shard(&self, req: &NamespaceReq, shard_idx: u32) -> Result<()> {
        self.bump(|rec| {
            rec.striped_shards_scanned = (rec.striped_shards_scanned.get() + 1).into();
        });
        let master = match read_lmv(&self.inst, req.parent)? {
            Some(master) if master.is_master() => master,
            // No usable master image; phase-2 sees all shards together
            // and can re-materialize it.
            _ => {
                self.trace.add(req.parent, TraceFlags::UNCERTAIN_LMV)?;
                return Ok(());
            }
        };
        // A quarantined hash is a settled verdict; a merely unusable one
        // is for phase-2 to sort out against the shard set.
        if !master.hash_quarantined() && !master.has_known_hash() {
            self.trace.add(req.parent, TraceFlags::RECHECK_NAMEHASH)?;
        }
        if shard_idx >= master.stripe_count {
            self.trace.add(req.parent, TraceFlags::UNCERTAIN_LMV)?;
            return Ok(());
        }

        match read_lmv(&self.inst, req.child)? {
            // Without a trustworthy master hash the slave's hash is not
            // compared; the slave may be the donor phase-2 settles from.
            Some(slave)
                if slave.magic == LMV_MAGIC_STRIPE
                    && slave.stripe_count == master.stripe_count
                    && slave.master_mdt_index == master.master_mdt_index
                    && (!master.has_known_hash() || slave.hash_fn() == master.hash_fn()) => {}
            slave => {
                note_inconsistency(&self.file, &self.inst);
                if !self.inst.dryrun() {
                    if let Some(old) = &slave {
                        if master.has_known_hash() && old.hash_fn() != master.hash_fn() {
                            self.bump(|rec| {
                                rec.bad_type_repaired = (rec.bad_type_repaired.get() + 1).into();
                            });
                        }
                    }
                    let fresh = LmvLayout::new_stripe(
                        master.stripe_count,
                        master.master_mdt_index,
                        master.hash_fn(),
                    );
                    write_lmv(&self.inst, req.child, &fresh)?;
                    self.bump(|rec| {
                        rec.striped_shards_repaired =
                            (rec.striped_shards_repaired.get() + 1).into();
                    });
                    info!(
                        "lfsck_namespace: rewrote shard metadata of {} (shard {} of {})",
                        req.child, shard_idx, req.parent
                    );
                }
            }
        }

        // The master's slot table must name this shard.
        if !master.stripe_fids.is_empty()
            && master.stripe_fids.get(shard_idx as usize) != Some(&req.child)
        {
            note_inconsistency(&self.file, &self.inst);
            if !self.inst.dryrun() {
                let mut fixed = master.clone();
                while fixed.stripe_fids.len() <= shard_idx as usize {
                    fixed.stripe_fids.push(Fid::ZERO);
                }
                fixed.stripe_fids[shard_idx as usize] = req.child;
                write_lmv(&self.inst, req.parent, &fixed)?;
                self.bump(|rec| {
                    rec.striped_dirs_repaired = (rec.striped_dirs_repaired.get() + 1).into();
                });
            }
        }
        Ok(())
    }

    /// Phase-1 check of an ordinary entry that lives inside a shard: its
    /// name must hash to that shard. A mismatch quarantines the master's
    /// hash; the entry itself is left where it is.
    pub(super) fn verify_name_placement(&self, req: &NamespaceReq) -> Result<()> {
        let Some(slave) = read_lmv(&self.inst, req.parent)? else {
            return Ok(());
        };
        if slave.is_master() {
            // Entries directly under the master are the shard names,
            // handled by check_shard.
            return Ok(());
        }
        let Some(shard_idx) = self.shard_index(req.parent)? else {
            return Ok(());
        };
        if !slave.has_known_hash() || slave.stripe_count == 0 {
            // Placement cannot be judged here; have phase-2 settle the
            // hash from the master side first.
            if let Ok(master_dir) = self.inst.store.lookup(req.parent, b"..") {
                if master_dir.is_sane() {
                    self.trace.add(master_dir, TraceFlags::RECHECK_NAMEHASH)?;
                }
            }
            return Ok(());
        }
        let expected = name_to_stripe_index(slave.hash_fn(), slave.stripe_count, &req.name)?;
        if expected == shard_idx {
            return Ok(());
        }
        let master_dir = match self.inst.store.lookup(req.parent, b"..") {
            Ok(fid) if fid.is_sane() => fid,
            _ => return Ok(()),
        };
        warn!(
            "lfsck_namespace: name {:?} in shard {} of {} hashes to shard {}",
            String::from_utf8_lossy(&req.name),
            shard_idx,
            master_dir,
            expected
        );
        self.quarantine_bad_hash(master_dir)?;
        Ok(())
    }

    /// The shard's stripe index, recovered from its own linkEA name
    /// (`<fid>:<index>` under the master).
    fn shard_index(&self, shard: Fid) -> Result<Option<u32>> {
        let ea = match read_xattr(self.inst.store.as_ref(), shard, XATTR_LINK) {
            Ok(buf) => match LinkEa::parse(&buf) {
                Ok(ea) => ea,
                Err(_) => return Ok(None),
            },
            Err(Errno::ENODATA) => return Ok(None),
            Err(e) => return Err(e),
        };
        Ok(ea.first().and_then(|entry| {
            parse_shard_name(entry.name)
                .filter(|&(fid, _)| fid == shard)
                .map(|(_, idx)| idx)
        }))
    }

    /// Fence a striped directory's hash off: rewrite the master's hash
    /// field to `UNKNOWN | BAD_TYPE`. Idempotent; returns whether a write
    /// happened.
    pub(super) fn quarantine_bad_hash(&self, master_dir: Fid) -> Result<bool> {
        let Some(master) = read_lmv(&self.inst, master_dir)? else {
            return Ok(false);
        };
        if !master.is_master() || master.hash_quarantined() {
            return Ok(false);
        }
        note_inconsistency(&self.file, &self.inst);
        if self.inst.dryrun() {
            return Ok(false);
        }
        let mut fixed = master;
        fixed.hash_type = LMV_HASH_TYPE_UNKNOWN | LmvHashFlags::BAD_TYPE.bits();
        write_lmv(&self.inst, master_dir, &fixed)?;
        self.bump(|rec| {
            rec.name_hash_repaired = (rec.name_hash_repaired.get() + 1).into();
        });
        info!(
            "lfsck_namespace: quarantined the name hash of striped directory {}",
            master_dir
        );
        Ok(true)
    }

    /// Phase-2 pass over a striped directory flagged during the sweep.
    pub(super) fn dsd_striped(&self, dir: Fid, flags: TraceFlags) -> Result<bool> {
        self.bump(|rec| {
            rec.striped_dirs_scanned = (rec.striped_dirs_scanned.get() + 1).into();
        });
        let shards = self.collect_shards(dir)?;
        if shards.is_empty() {
            return Ok(false);
        }
        let mut repaired = false;

        let master = match read_lmv(&self.inst, dir)? {
            Some(master) if master.is_master() => Some(master),
            _ => None,
        };
        let master = match master {
            Some(master) => master,
            None => {
                // Lost master image: rebuild it from the first shard whose
                // slave image is intact, if the shards agree.
                let Some((_, _, Some(first))) =
                    shards.iter().find(|(_, _, slave)| slave.is_some())
                else {
                    warn!(
                        "lfsck_namespace: {} has shards but no usable metadata on any side",
                        dir
                    );
                    return Ok(false);
                };
                note_inconsistency(&self.file, &self.inst);
                if self.inst.dryrun() {
                    return Ok(false);
                }
                let mut fids: Vec<Fid> = vec![Fid::ZERO; first.stripe_count as usize];
                for (idx, fid, _) in &shards {
                    if (*idx as usize) < fids.len() {
                        fids[*idx as usize] = *fid;
                    }
                }
                let rebuilt = LmvLayout::master_from_shard(first, &fids);
                write_lmv(&self.inst, dir, &rebuilt)?;
                self.bump(|rec| {
                    rec.striped_dirs_repaired = (rec.striped_dirs_repaired.get() + 1).into();
                });
                info!(
                    "lfsck_namespace: re-materialized master metadata of {} from {} shard(s)",
                    dir,
                    shards.len()
                );
                repaired = true;
                rebuilt
            }
        };

        if flags.contains(TraceFlags::RECHECK_NAMEHASH) {
            repaired |= self.settle_hash_type(dir, &master, &shards)?;
        }
        Ok(repaired)
    }

    /// All shard entries of `dir`, with each shard's slave image.
    fn collect_shards(&self, dir: Fid) -> Result<Vec<(u32, Fid, Option<LmvLayout>)>> {
        let mut out = Vec::new();
        let mut it = self.inst.store.dir_iter(dir, 0)?;
        while let Some(ent) = it.next()? {
            let Some((shard_fid, idx)) = parse_shard_name(&ent.name) else {
                continue;
            };
            if shard_fid != ent.fid {
                continue;
            }
            let slave = match read_lmv(&self.inst, shard_fid)? {
                Some(lmv) if !lmv.is_master() => Some(lmv),
                _ => None,
            };
            out.push((idx, shard_fid, slave));
        }
        out.sort_by_key(|&(idx, _, _)| idx);
        Ok(out)
    }

    /// Phase-2 resolution of an unusable master hash type. A quarantined
    /// master is a settled verdict and stays; anything else unusable is
    /// settled from the first shard with a valid hash type, then every
    /// shard's entries are verified against the settled hash. One
    /// misplaced name makes the hash untrustworthy for the whole
    /// directory, so it is quarantined rather than patched around.
    fn settle_hash_type(
        &self,
        dir: Fid,
        master: &LmvLayout,
        shards: &[(u32, Fid, Option<LmvLayout>)],
    ) -> Result<bool> {
        if master.hash_quarantined() {
            return Ok(false);
        }
        let mut master = master.clone();
        let mut repaired = false;
        if !master.has_known_hash() {
            note_inconsistency(&self.file, &self.inst);
            if self.inst.dryrun() {
                return Ok(false);
            }
            let donor = shards
                .iter()
                .find_map(|(_, _, slave)| slave.as_ref().filter(|s| s.has_known_hash()));
            match donor {
                Some(donor) => {
                    master.hash_type = donor.hash_fn();
                    write_lmv(&self.inst, dir, &master)?;
                    self.bump(|rec| {
                        rec.bad_type_repaired = (rec.bad_type_repaired.get() + 1).into();
                    });
                    info!(
                        "lfsck_namespace: settled hash type of {} from its shards",
                        dir
                    );
                    repaired = true;
                }
                None => {
                    // No side remembers a usable hash.
                    return self.quarantine_bad_hash(dir);
                }
            }
        }
        if master.stripe_count == 0 {
            return Ok(repaired);
        }
        for &(shard_idx, shard_fid, _) in shards {
            let mut it = self.inst.store.dir_iter(shard_fid, 0)?;
            while let Some(ent) = it.next()? {
                if ent.name == b"." || ent.name == b".." || parse_shard_name(&ent.name).is_some() {
                    continue;
                }
                let expected =
                    name_to_stripe_index(master.hash_fn(), master.stripe_count, &ent.name)?;
                if expected != shard_idx {
                    return Ok(self.quarantine_bad_hash(dir)? || repaired);
                }
            }
        }
        Ok(repaired)
    }
}
