//! Persistent record plumbing.
//!
//! Every checker keeps its status record twice: the RAM copy counters are
//! bumped against, and the disk copy refreshed on each checkpoint. Records
//! are fixed-layout little-endian images written in one transaction as the
//! whole content of a dedicated object. A record that fails validation on
//! load asks for a reset rather than an error: a half-written or
//! foreign-version record just means the run starts over.

use std::sync::Arc;
use std::time::SystemTime;

use zerocopy::{FromBytes, Immutable, IntoBytes};

use crate::errno::Result;
use crate::fid::Fid;
use crate::store::{Attr, Store};

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Read a whole record back. `Ok(None)` means "reset needed": the object
/// is missing or the stored size does not match the expected image.
pub fn read_record<T>(store: &dyn Store, obj: Fid) -> Result<Option<T>>
where
    T: FromBytes,
{
    if !store.exists(obj)? {
        return Ok(None);
    }
    let mut buf = vec![0u8; size_of::<T>()];
    let n = store.record_read(obj, 0, &mut buf)?;
    if n != size_of::<T>() {
        return Ok(None);
    }
    Ok(T::read_from_bytes(&buf).ok())
}

/// Replace the record in a single transaction, creating the backing object
/// on first use.
pub fn write_record<T>(store: &dyn Store, obj: Fid, rec: &T) -> Result<()>
where
    T: IntoBytes + Immutable,
{
    let bytes = rec.as_bytes();
    let mut tx = store.tx_create();
    let fresh = !store.exists(obj)?;
    if fresh {
        tx.declare_create(obj)?;
    }
    tx.declare_record_write(obj, bytes.len())?;
    tx.start()?;
    if fresh {
        tx.create(obj, &Attr::regular(0o600, 0, 0))?;
    }
    tx.record_write(obj, 0, bytes)?;
    tx.commit()
}

/// A checker's persistent record: the backing object plus the RAM copy.
pub struct CheckFile<T> {
    store: Arc<dyn Store>,
    obj: Fid,
    pub ram: parking_lot::RwLock<T>,
}

impl<T> CheckFile<T>
where
    T: FromBytes + IntoBytes + Immutable + Copy,
{
    pub fn new(store: Arc<dyn Store>, obj: Fid, initial: T) -> CheckFile<T> {
        CheckFile {
            store,
            obj,
            ram: parking_lot::RwLock::new(initial),
        }
    }

    /// Load the disk copy into RAM. Returns false when a reset is needed.
    pub fn load(&self) -> Result<bool> {
        match read_record::<T>(self.store.as_ref(), self.obj)? {
            Some(rec) => {
                *self.ram.write() = rec;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Flush the RAM copy to disk.
    pub fn flush(&self) -> Result<()> {
        let rec = *self.ram.read();
        write_record(self.store.as_ref(), self.obj, &rec)
    }

    /// Mutate the RAM copy under the record lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        f(&mut self.ram.write())
    }

    pub fn read(&self) -> T {
        *self.ram.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fid::FID_SEQ_LOCAL_FILE;
    use crate::memstore::MemStore;
    use crate::ondisk::{BOOKMARK_MAGIC, BookmarkRecord};

    #[test]
    fn record_round_trip_and_reset_detection() {
        let store = MemStore::new(0);
        let obj = Fid::new(FID_SEQ_LOCAL_FILE, 0x10, 0);

        // Nothing on disk yet.
        assert!(read_record::<BookmarkRecord>(&store, obj).unwrap().is_none());

        let mut rec = BookmarkRecord::default();
        rec.magic = BOOKMARK_MAGIC.into();
        rec.speed_limit = 500.into();
        write_record(&store, obj, &rec).unwrap();

        let back = read_record::<BookmarkRecord>(&store, obj).unwrap().unwrap();
        assert_eq!(back.speed_limit.get(), 500);

        // A short record asks for a reset instead of failing.
        let mut tx = store.tx_create();
        tx.declare_create(Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0)).unwrap();
        tx.declare_record_write(Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0), 4)
            .unwrap();
        tx.start().unwrap();
        tx.create(
            Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0),
            &Attr::regular(0o600, 0, 0),
        )
        .unwrap();
        tx.record_write(Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0), 0, &[1, 2, 3, 4])
            .unwrap();
        tx.commit().unwrap();
        assert!(
            read_record::<BookmarkRecord>(&store, Fid::new(FID_SEQ_LOCAL_FILE, 0x11, 0))
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn checkfile_flush_and_reload() {
        let store: Arc<dyn Store> = Arc::new(MemStore::new(0));
        let obj = Fid::new(FID_SEQ_LOCAL_FILE, 0x10, 0);
        let file = CheckFile::new(store.clone(), obj, BookmarkRecord::default());
        assert!(!file.load().unwrap());
        file.update(|rec| {
            rec.magic = BOOKMARK_MAGIC.into();
            rec.async_windows = 64.into();
        });
        file.flush().unwrap();

        let other = CheckFile::new(store, obj, BookmarkRecord::default());
        assert!(other.load().unwrap());
        assert_eq!(other.read().async_windows.get(), 64);
    }
}
