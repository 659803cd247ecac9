//! Deferred-work tracing file.
//!
//! Phase-1 never repairs what it cannot decide locally; it files the object
//! for phase-2 instead. The tracing file is a byte-keyed index on a
//! dedicated store object: the key is the FID's big-endian image (so the
//! phase-2 walk visits objects in canonical FID order on every node) and
//! the value is one flag byte. Flag updates are read-modify-write; a record
//! whose flags drop to zero is deleted outright.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::errno::{Errno, Result};
use crate::fid::Fid;
use crate::ondisk::TraceFlags;
use crate::store::Store;

pub struct TracingFile {
    store: Arc<dyn Store>,
    obj: Fid,
    /// Serializes read-modify-write cycles on individual records.
    update: Mutex<()>,
}

impl TracingFile {
    /// Open the tracing file, creating the backing object if this is the
    /// first run on the device.
    pub fn open(store: Arc<dyn Store>, obj: Fid) -> Result<TracingFile> {
        if !store.exists(obj)? {
            let mut tx = store.tx_create();
            tx.declare_create(obj)?;
            tx.start()?;
            tx.create(obj, &crate::store::Attr::regular(0o600, 0, 0))?;
            tx.commit()?;
        }
        Ok(TracingFile {
            store,
            obj,
            update: Mutex::new(()),
        })
    }

    pub fn get(&self, fid: Fid) -> Result<TraceFlags> {
        match self.store.index_lookup(self.obj, &fid.to_be_bytes()) {
            Ok(val) => Ok(TraceFlags::from_bits_truncate(
                val.first().copied().unwrap_or(0),
            )),
            Err(Errno::ENOENT) => Ok(TraceFlags::empty()),
            Err(e) => Err(e),
        }
    }

    /// OR `flags` into the object's record.
    pub fn add(&self, fid: Fid, flags: TraceFlags) -> Result<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let _guard = self.update.lock();
        let old = self.get(fid)?;
        let new = old | flags;
        if new == old {
            return Ok(());
        }
        self.write(fid, old, new)
    }

    /// Clear `flags` from the object's record; an all-clear record is
    /// removed.
    pub fn remove(&self, fid: Fid, flags: TraceFlags) -> Result<()> {
        let _guard = self.update.lock();
        let old = self.get(fid)?;
        let new = old - flags;
        if new == old {
            return Ok(());
        }
        self.write(fid, old, new)
    }

    fn write(&self, fid: Fid, old: TraceFlags, new: TraceFlags) -> Result<()> {
        let key = fid.to_be_bytes();
        let mut tx = self.store.tx_create();
        if new.is_empty() {
            tx.declare_index_delete(self.obj, &key)?;
            tx.start()?;
            tx.index_delete(self.obj, &key)?;
        } else {
            if !old.is_empty() {
                tx.declare_index_delete(self.obj, &key)?;
            }
            tx.declare_index_insert(self.obj, &key, 1)?;
            tx.start()?;
            if !old.is_empty() {
                tx.index_delete(self.obj, &key)?;
            }
            tx.index_insert(self.obj, &key, &[new.bits()])?;
        }
        tx.commit()
    }

    /// Walk every record in FID order.
    pub fn iter(&self) -> Result<TraceIter> {
        Ok(TraceIter {
            inner: self.store.index_iter(self.obj, &[])?,
        })
    }
}

pub struct TraceIter {
    inner: Box<dyn crate::store::IndexIter>,
}

impl TraceIter {
    pub fn next(&mut self) -> Result<Option<(Fid, TraceFlags)>> {
        loop {
            match self.inner.next()? {
                None => return Ok(None),
                Some((key, val)) => {
                    let Ok(key) = <[u8; 16]>::try_from(key.as_slice()) else {
                        continue;
                    };
                    let flags = TraceFlags::from_bits_truncate(val.first().copied().unwrap_or(0));
                    return Ok(Some((Fid::from_be_bytes(&key), flags)));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_NORMAL;
    use crate::memstore::MemStore;

    fn tracing() -> TracingFile {
        let store = Arc::new(MemStore::new(0));
        TracingFile::open(store, Fid::new(crate::fid::FID_SEQ_LOCAL_FILE, 0x13, 0)).unwrap()
    }

    fn tfid(oid: u32) -> Fid {
        Fid::new(FID_SEQ_NORMAL, oid, 0)
    }

    #[test]
    fn flags_accumulate_and_clear() {
        let trace = tracing();
        trace.add(tfid(1), TraceFlags::CHECK_LINKEA).unwrap();
        trace.add(tfid(1), TraceFlags::CHECK_PARENT).unwrap();
        assert_eq!(
            trace.get(tfid(1)).unwrap(),
            TraceFlags::CHECK_LINKEA | TraceFlags::CHECK_PARENT
        );
        trace.remove(tfid(1), TraceFlags::CHECK_LINKEA).unwrap();
        assert_eq!(trace.get(tfid(1)).unwrap(), TraceFlags::CHECK_PARENT);
    }

    #[test]
    fn zero_result_deletes_record() {
        let trace = tracing();
        trace.add(tfid(1), TraceFlags::CHECK_LINKEA).unwrap();
        trace.remove(tfid(1), TraceFlags::CHECK_LINKEA).unwrap();
        let mut it = trace.iter().unwrap();
        assert_eq!(it.next().unwrap(), None);
    }

    #[test]
    fn iteration_is_fid_ordered() {
        let trace = tracing();
        trace.add(tfid(0x300), TraceFlags::CHECK_LINKEA).unwrap();
        trace.add(tfid(2), TraceFlags::CHECK_PARENT).unwrap();
        trace
            .add(Fid::new(FID_SEQ_NORMAL + 1, 1, 0), TraceFlags::UNCERTAIN_LMV)
            .unwrap();
        let mut it = trace.iter().unwrap();
        assert_eq!(it.next().unwrap().unwrap().0, tfid(2));
        assert_eq!(it.next().unwrap().unwrap().0, tfid(0x300));
        assert_eq!(
            it.next().unwrap().unwrap().0,
            Fid::new(FID_SEQ_NORMAL + 1, 1, 0)
        );
    }
}
