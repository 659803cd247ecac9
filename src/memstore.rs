//! In-memory object store.
//!
//! A complete [`Store`] implementation backed by maps, used by the
//! test-suite and by repair-scenario harnesses to stand up a miniature
//! cluster in-process. Directory cookies come from the same FNV hash the
//! striped-directory code uses, so hash-order iteration and cookie resume
//! behave like a real backend. Transactions buffer their operations and
//! apply them to a copy of the state on commit, giving real all-or-nothing
//! semantics.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::errno::{Errno, Result};
use crate::fid::{FID_SEQ_NORMAL, Fid};
use crate::lmv::hash_fnv_1a_64;
use crate::store::{
    Attr, AttrMask, Dirent, DirentFlags, DirentType, DirIter, IndexIter, OitIter, Store,
    Transaction, XattrFlags,
};

#[derive(Clone, Debug)]
struct DirentRec {
    name: Vec<u8>,
    fid: Fid,
    typ: DirentType,
    flags: DirentFlags,
}

#[derive(Clone, Debug, Default)]
struct MemObject {
    attr: Attr,
    xattrs: BTreeMap<String, Vec<u8>>,
    entries: BTreeMap<u64, DirentRec>,
    names: HashMap<Vec<u8>, u64>,
    index: BTreeMap<Vec<u8>, Vec<u8>>,
    body: Vec<u8>,
    dead: bool,
}

#[derive(Clone, Default)]
struct MemState {
    objects: HashMap<Fid, MemObject>,
    oit: BTreeMap<u64, Fid>,
    oit_of: HashMap<Fid, u64>,
    next_oit: u64,
}

impl MemState {
    fn object(&self, fid: Fid) -> Result<&MemObject> {
        self.objects.get(&fid).ok_or(Errno::ENOENT)
    }

    fn object_mut(&mut self, fid: Fid) -> Result<&mut MemObject> {
        self.objects.get_mut(&fid).ok_or(Errno::ENOENT)
    }

    fn dirent_cookie(&self, dir: &MemObject, name: &[u8]) -> u64 {
        let mut cookie = (hash_fnv_1a_64(name) & 0x7fff_ffff_ffff_ffff).max(1);
        while dir.entries.contains_key(&cookie) {
            cookie += 1;
        }
        cookie
    }

    fn apply(&mut self, op: &Op) -> Result<()> {
        match op {
            Op::Create { fid, attr } => {
                if self.objects.contains_key(fid) {
                    return Err(Errno::EEXIST);
                }
                self.objects.insert(
                    *fid,
                    MemObject {
                        attr: *attr,
                        ..MemObject::default()
                    },
                );
                let cookie = self.next_oit;
                self.next_oit += 1;
                self.oit.insert(cookie, *fid);
                self.oit_of.insert(*fid, cookie);
                Ok(())
            }
            Op::Destroy { fid } => {
                self.objects.remove(fid).ok_or(Errno::ENOENT)?;
                if let Some(cookie) = self.oit_of.remove(fid) {
                    self.oit.remove(&cookie);
                }
                Ok(())
            }
            Op::AttrSet { fid, attr, valid } => {
                let obj = self.object_mut(*fid)?;
                if valid.contains(AttrMask::MODE) {
                    obj.attr.mode = attr.mode;
                }
                if valid.contains(AttrMask::UID) {
                    obj.attr.uid = attr.uid;
                }
                if valid.contains(AttrMask::GID) {
                    obj.attr.gid = attr.gid;
                }
                if valid.contains(AttrMask::SIZE) {
                    obj.attr.size = attr.size;
                }
                if valid.contains(AttrMask::CTIME) {
                    obj.attr.ctime = attr.ctime;
                }
                if valid.contains(AttrMask::NLINK) {
                    obj.attr.nlink = attr.nlink;
                }
                Ok(())
            }
            Op::XattrSet {
                fid,
                name,
                value,
                flags,
            } => {
                let obj = self.object_mut(*fid)?;
                let present = obj.xattrs.contains_key(name);
                if flags.contains(XattrFlags::CREATE) && present {
                    return Err(Errno::EEXIST);
                }
                if flags.contains(XattrFlags::REPLACE) && !present {
                    return Err(Errno::ENODATA);
                }
                obj.xattrs.insert(name.clone(), value.clone());
                Ok(())
            }
            Op::XattrDel { fid, name } => {
                self.object_mut(*fid)?
                    .xattrs
                    .remove(name)
                    .map(|_| ())
                    .ok_or(Errno::ENODATA)
            }
            Op::Insert {
                dir,
                name,
                fid,
                typ,
            } => {
                let dirent = {
                    let dobj = self.object(*dir)?;
                    if dobj.names.contains_key(name) {
                        return Err(Errno::EEXIST);
                    }
                    DirentRec {
                        name: name.clone(),
                        fid: *fid,
                        typ: *typ,
                        flags: DirentFlags::empty(),
                    }
                };
                let cookie = {
                    let dobj = self.object(*dir)?;
                    self.dirent_cookie(dobj, name)
                };
                let dobj = self.object_mut(*dir)?;
                dobj.names.insert(name.clone(), cookie);
                dobj.entries.insert(cookie, dirent);
                Ok(())
            }
            Op::Delete { dir, name } => {
                let dobj = self.object_mut(*dir)?;
                let cookie = dobj.names.remove(name).ok_or(Errno::ENOENT)?;
                dobj.entries.remove(&cookie);
                Ok(())
            }
            Op::RefAdd { fid } => {
                let obj = self.object_mut(*fid)?;
                obj.attr.nlink = obj.attr.nlink.saturating_add(1);
                Ok(())
            }
            Op::RefDel { fid } => {
                let obj = self.object_mut(*fid)?;
                obj.attr.nlink = obj.attr.nlink.saturating_sub(1);
                Ok(())
            }
            Op::RecordWrite { fid, offset, data } => {
                let obj = self.object_mut(*fid)?;
                let end = *offset as usize + data.len();
                if obj.body.len() < end {
                    obj.body.resize(end, 0);
                }
                obj.body[*offset as usize..end].copy_from_slice(data);
                obj.attr.size = obj.attr.size.max(end as u64);
                Ok(())
            }
            Op::IndexInsert { obj, key, val } => {
                self.object_mut(*obj)?.index.insert(key.clone(), val.clone());
                Ok(())
            }
            Op::IndexDelete { obj, key } => {
                self.object_mut(*obj)?
                    .index
                    .remove(key)
                    .map(|_| ())
                    .ok_or(Errno::ENOENT)
            }
        }
    }
}

/// In-memory store instance.
#[derive(Clone)]
pub struct MemStore {
    state: Arc<Mutex<MemState>>,
    alloc_seq: u64,
    next_oid: Arc<AtomicU32>,
}

impl MemStore {
    /// `node_index` keeps repair-allocated FIDs from colliding across the
    /// stores of a simulated cluster.
    pub fn new(node_index: u16) -> MemStore {
        MemStore {
            state: Arc::new(Mutex::new(MemState::default())),
            alloc_seq: FID_SEQ_NORMAL + 0x8000 + node_index as u64,
            next_oid: Arc::new(AtomicU32::new(1)),
        }
    }

    // Fixture helpers: direct state edits used when arranging test
    // scenarios, bypassing the transaction protocol.

    pub fn put_object(&self, fid: Fid, attr: Attr) {
        let mut state = self.state.lock();
        let op = Op::Create { fid, attr };
        state.apply(&op).expect("fixture object already present");
    }

    pub fn put_xattr(&self, fid: Fid, name: &str, value: &[u8]) {
        let mut state = self.state.lock();
        state
            .object_mut(fid)
            .expect("fixture object missing")
            .xattrs
            .insert(name.to_string(), value.to_vec());
    }

    pub fn put_entry(&self, dir: Fid, name: &[u8], fid: Fid, typ: DirentType) {
        let mut state = self.state.lock();
        let op = Op::Insert {
            dir,
            name: name.to_vec(),
            fid,
            typ,
        };
        state.apply(&op).expect("fixture entry already present");
    }

    pub fn put_record(&self, fid: Fid, data: &[u8]) {
        let mut state = self.state.lock();
        if !state.objects.contains_key(&fid) {
            let op = Op::Create {
                fid,
                attr: Attr::regular(0o600, 0, 0),
            };
            state.apply(&op).expect("fixture object already present");
        }
        state
            .object_mut(fid)
            .expect("fixture object missing")
            .body = data.to_vec();
    }

    pub fn set_dead(&self, fid: Fid) {
        let mut state = self.state.lock();
        if let Ok(obj) = state.object_mut(fid) {
            obj.dead = true;
        }
    }
}

impl Store for MemStore {
    fn exists(&self, fid: Fid) -> Result<bool> {
        Ok(self.state.lock().objects.contains_key(&fid))
    }

    fn is_dead(&self, fid: Fid) -> Result<bool> {
        Ok(self.state.lock().object(fid)?.dead)
    }

    fn attr_get(&self, fid: Fid) -> Result<Attr> {
        Ok(self.state.lock().object(fid)?.attr)
    }

    fn xattr_get(&self, fid: Fid, name: &str, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let value = state.object(fid)?.xattrs.get(name).ok_or(Errno::ENODATA)?;
        if buf.is_empty() {
            return Ok(value.len());
        }
        if buf.len() < value.len() {
            return Err(Errno::ERANGE);
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn lookup(&self, dir: Fid, name: &[u8]) -> Result<Fid> {
        let state = self.state.lock();
        let dobj = state.object(dir)?;
        let cookie = dobj.names.get(name).ok_or(Errno::ENOENT)?;
        Ok(dobj.entries[cookie].fid)
    }

    fn index_lookup(&self, obj: Fid, key: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state.object(obj)?.index.get(key).cloned().ok_or(Errno::ENOENT)
    }

    fn record_read(&self, fid: Fid, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.lock();
        let body = &state.object(fid)?.body;
        let offset = offset as usize;
        if offset >= body.len() {
            return Ok(0);
        }
        let n = buf.len().min(body.len() - offset);
        buf[..n].copy_from_slice(&body[offset..offset + n]);
        Ok(n)
    }

    fn oit_iter(&self, start_cookie: u64) -> Result<Box<dyn OitIter>> {
        Ok(Box::new(MemOitIter {
            state: self.state.clone(),
            next: start_cookie,
        }))
    }

    fn dir_iter(&self, dir: Fid, start_cookie: u64) -> Result<Box<dyn DirIter>> {
        if !self.state.lock().object(dir)?.attr.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        Ok(Box::new(MemDirIter {
            state: self.state.clone(),
            dir,
            next: start_cookie,
        }))
    }

    fn index_iter(&self, obj: Fid, start_key: &[u8]) -> Result<Box<dyn IndexIter>> {
        self.state.lock().object(obj)?;
        Ok(Box::new(MemIndexIter {
            state: self.state.clone(),
            obj,
            next: start_key.to_vec(),
            primed: false,
        }))
    }

    fn tx_create(&self) -> Box<dyn Transaction> {
        Box::new(MemTx {
            state: self.state.clone(),
            declared: Vec::new(),
            ops: Vec::new(),
            started: false,
        })
    }

    fn alloc_fid(&self) -> Result<Fid> {
        Ok(Fid::new(
            self.alloc_seq,
            self.next_oid.fetch_add(1, Ordering::Relaxed),
            0,
        ))
    }
}

struct MemOitIter {
    state: Arc<Mutex<MemState>>,
    next: u64,
}

impl OitIter for MemOitIter {
    fn next(&mut self) -> Result<Option<(u64, Fid)>> {
        let state = self.state.lock();
        match state.oit.range(self.next..).next() {
            Some((&cookie, &fid)) => {
                self.next = cookie + 1;
                Ok(Some((cookie, fid)))
            }
            None => Ok(None),
        }
    }
}

struct MemDirIter {
    state: Arc<Mutex<MemState>>,
    dir: Fid,
    next: u64,
}

impl DirIter for MemDirIter {
    fn next(&mut self) -> Result<Option<Dirent>> {
        let state = self.state.lock();
        let dobj = state.object(self.dir)?;
        match dobj.entries.range(self.next..).next() {
            Some((&cookie, rec)) => {
                self.next = cookie + 1;
                Ok(Some(Dirent {
                    fid: rec.fid,
                    name: rec.name.clone(),
                    typ: rec.typ,
                    flags: rec.flags,
                    cookie,
                }))
            }
            None => Ok(None),
        }
    }
}

struct MemIndexIter {
    state: Arc<Mutex<MemState>>,
    obj: Fid,
    next: Vec<u8>,
    primed: bool,
}

impl IndexIter for MemIndexIter {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let state = self.state.lock();
        let index = &state.object(self.obj)?.index;
        let primed = self.primed;
        let entry = index
            .range(self.next.clone()..)
            .find(|&(k, _)| !primed || *k != self.next);
        match entry {
            Some((k, v)) => {
                self.next = k.clone();
                self.primed = true;
                Ok(Some((k.clone(), v.clone())))
            }
            None => Ok(None),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum DeclKey {
    Create(Fid),
    Destroy(Fid),
    AttrSet(Fid),
    XattrSet(Fid, String),
    XattrDel(Fid, String),
    Insert(Fid),
    Delete(Fid),
    RefAdd(Fid),
    RefDel(Fid),
    RecordWrite(Fid),
    IndexInsert(Fid),
    IndexDelete(Fid),
}

#[derive(Clone, Debug)]
enum Op {
    Create {
        fid: Fid,
        attr: Attr,
    },
    Destroy {
        fid: Fid,
    },
    AttrSet {
        fid: Fid,
        attr: Attr,
        valid: AttrMask,
    },
    XattrSet {
        fid: Fid,
        name: String,
        value: Vec<u8>,
        flags: XattrFlags,
    },
    XattrDel {
        fid: Fid,
        name: String,
    },
    Insert {
        dir: Fid,
        name: Vec<u8>,
        fid: Fid,
        typ: DirentType,
    },
    Delete {
        dir: Fid,
        name: Vec<u8>,
    },
    RefAdd {
        fid: Fid,
    },
    RefDel {
        fid: Fid,
    },
    RecordWrite {
        fid: Fid,
        offset: u64,
        data: Vec<u8>,
    },
    IndexInsert {
        obj: Fid,
        key: Vec<u8>,
        val: Vec<u8>,
    },
    IndexDelete {
        obj: Fid,
        key: Vec<u8>,
    },
}

struct MemTx {
    state: Arc<Mutex<MemState>>,
    declared: Vec<DeclKey>,
    ops: Vec<Op>,
    started: bool,
}

impl MemTx {
    fn declare(&mut self, key: DeclKey) -> Result<()> {
        if self.started {
            return Err(Errno::EPROTO);
        }
        self.declared.push(key);
        Ok(())
    }

    fn record(&mut self, key: DeclKey, op: Op) -> Result<()> {
        if !self.started {
            return Err(Errno::EPROTO);
        }
        if !self.declared.contains(&key) {
            return Err(Errno::EPROTO);
        }
        self.ops.push(op);
        Ok(())
    }
}

impl Transaction for MemTx {
    fn declare_create(&mut self, fid: Fid) -> Result<()> {
        self.declare(DeclKey::Create(fid))
    }

    fn declare_destroy(&mut self, fid: Fid) -> Result<()> {
        self.declare(DeclKey::Destroy(fid))
    }

    fn declare_attr_set(&mut self, fid: Fid) -> Result<()> {
        self.declare(DeclKey::AttrSet(fid))
    }

    fn declare_xattr_set(&mut self, fid: Fid, name: &str, _len: usize) -> Result<()> {
        self.declare(DeclKey::XattrSet(fid, name.to_string()))
    }

    fn declare_xattr_del(&mut self, fid: Fid, name: &str) -> Result<()> {
        self.declare(DeclKey::XattrDel(fid, name.to_string()))
    }

    fn declare_insert(&mut self, dir: Fid, _name: &[u8]) -> Result<()> {
        self.declare(DeclKey::Insert(dir))
    }

    fn declare_delete(&mut self, dir: Fid, _name: &[u8]) -> Result<()> {
        self.declare(DeclKey::Delete(dir))
    }

    fn declare_ref_add(&mut self, fid: Fid) -> Result<()> {
        self.declare(DeclKey::RefAdd(fid))
    }

    fn declare_ref_del(&mut self, fid: Fid) -> Result<()> {
        self.declare(DeclKey::RefDel(fid))
    }

    fn declare_record_write(&mut self, fid: Fid, _len: usize) -> Result<()> {
        self.declare(DeclKey::RecordWrite(fid))
    }

    fn declare_index_insert(&mut self, obj: Fid, _key: &[u8], _val_len: usize) -> Result<()> {
        self.declare(DeclKey::IndexInsert(obj))
    }

    fn declare_index_delete(&mut self, obj: Fid, _key: &[u8]) -> Result<()> {
        self.declare(DeclKey::IndexDelete(obj))
    }

    fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Errno::EPROTO);
        }
        self.started = true;
        Ok(())
    }

    fn create(&mut self, fid: Fid, attr: &Attr) -> Result<()> {
        self.record(DeclKey::Create(fid), Op::Create { fid, attr: *attr })
    }

    fn destroy(&mut self, fid: Fid) -> Result<()> {
        self.record(DeclKey::Destroy(fid), Op::Destroy { fid })
    }

    fn attr_set(&mut self, fid: Fid, attr: &Attr, valid: AttrMask) -> Result<()> {
        self.record(
            DeclKey::AttrSet(fid),
            Op::AttrSet {
                fid,
                attr: *attr,
                valid,
            },
        )
    }

    fn xattr_set(&mut self, fid: Fid, name: &str, value: &[u8], flags: XattrFlags) -> Result<()> {
        self.record(
            DeclKey::XattrSet(fid, name.to_string()),
            Op::XattrSet {
                fid,
                name: name.to_string(),
                value: value.to_vec(),
                flags,
            },
        )
    }

    fn xattr_del(&mut self, fid: Fid, name: &str) -> Result<()> {
        self.record(
            DeclKey::XattrDel(fid, name.to_string()),
            Op::XattrDel {
                fid,
                name: name.to_string(),
            },
        )
    }

    fn insert(&mut self, dir: Fid, name: &[u8], fid: Fid, typ: DirentType) -> Result<()> {
        self.record(
            DeclKey::Insert(dir),
            Op::Insert {
                dir,
                name: name.to_vec(),
                fid,
                typ,
            },
        )
    }

    fn delete(&mut self, dir: Fid, name: &[u8]) -> Result<()> {
        self.record(
            DeclKey::Delete(dir),
            Op::Delete {
                dir,
                name: name.to_vec(),
            },
        )
    }

    fn ref_add(&mut self, fid: Fid) -> Result<()> {
        self.record(DeclKey::RefAdd(fid), Op::RefAdd { fid })
    }

    fn ref_del(&mut self, fid: Fid) -> Result<()> {
        self.record(DeclKey::RefDel(fid), Op::RefDel { fid })
    }

    fn record_write(&mut self, fid: Fid, offset: u64, data: &[u8]) -> Result<()> {
        self.record(
            DeclKey::RecordWrite(fid),
            Op::RecordWrite {
                fid,
                offset,
                data: data.to_vec(),
            },
        )
    }

    fn index_insert(&mut self, obj: Fid, key: &[u8], val: &[u8]) -> Result<()> {
        self.record(
            DeclKey::IndexInsert(obj),
            Op::IndexInsert {
                obj,
                key: key.to_vec(),
                val: val.to_vec(),
            },
        )
    }

    fn index_delete(&mut self, obj: Fid, key: &[u8]) -> Result<()> {
        self.record(
            DeclKey::IndexDelete(obj),
            Op::IndexDelete {
                obj,
                key: key.to_vec(),
            },
        )
    }

    fn commit(self: Box<Self>) -> Result<()> {
        if !self.started {
            return Err(Errno::EPROTO);
        }
        let mut state = self.state.lock();
        // Apply against a copy so a failing operation rolls the whole
        // transaction back.
        let mut staged = state.clone();
        for op in &self.ops {
            staged.apply(op)?;
        }
        *state = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::read_xattr;

    fn fid(oid: u32) -> Fid {
        Fid::new(FID_SEQ_NORMAL, oid, 0)
    }

    #[test]
    fn transaction_protocol_enforced() {
        let store = MemStore::new(0);
        let mut tx = store.tx_create();
        // Operation before start.
        assert_eq!(
            tx.create(fid(1), &Attr::regular(0o644, 0, 0)),
            Err(Errno::EPROTO)
        );
        tx.start().unwrap();
        // Undeclared operation after start.
        assert_eq!(
            tx.create(fid(1), &Attr::regular(0o644, 0, 0)),
            Err(Errno::EPROTO)
        );
    }

    #[test]
    fn commit_is_atomic() {
        let store = MemStore::new(0);
        store.put_object(fid(1), Attr::regular(0o644, 0, 0));

        let mut tx = store.tx_create();
        tx.declare_create(fid(2)).unwrap();
        tx.declare_create(fid(1)).unwrap();
        tx.start().unwrap();
        tx.create(fid(2), &Attr::regular(0o644, 0, 0)).unwrap();
        tx.create(fid(1), &Attr::regular(0o644, 0, 0)).unwrap();
        // Second create collides, so the first must not stick either.
        assert_eq!(tx.commit(), Err(Errno::EEXIST));
        assert!(!store.exists(fid(2)).unwrap());
    }

    #[test]
    fn rollback_on_drop() {
        let store = MemStore::new(0);
        let mut tx = store.tx_create();
        tx.declare_create(fid(1)).unwrap();
        tx.start().unwrap();
        tx.create(fid(1), &Attr::regular(0o644, 0, 0)).unwrap();
        drop(tx);
        assert!(!store.exists(fid(1)).unwrap());
    }

    #[test]
    fn xattr_size_probe_and_range() {
        let store = MemStore::new(0);
        store.put_object(fid(1), Attr::regular(0o644, 0, 0));
        store.put_xattr(fid(1), "trusted.test", &[7u8; 300]);

        assert_eq!(store.xattr_get(fid(1), "trusted.test", &mut []), Ok(300));
        let mut small = [0u8; 16];
        assert_eq!(
            store.xattr_get(fid(1), "trusted.test", &mut small),
            Err(Errno::ERANGE)
        );
        assert_eq!(read_xattr(&store, fid(1), "trusted.test").unwrap().len(), 300);
        assert_eq!(
            store.xattr_get(fid(1), "trusted.none", &mut []),
            Err(Errno::ENODATA)
        );
    }

    #[test]
    fn oit_iterates_in_creation_order_and_resumes() {
        let store = MemStore::new(0);
        for oid in 1..=5 {
            store.put_object(fid(oid), Attr::regular(0o644, 0, 0));
        }
        let mut it = store.oit_iter(0).unwrap();
        let mut seen = Vec::new();
        while let Some((cookie, f)) = it.next().unwrap() {
            seen.push((cookie, f));
        }
        assert_eq!(seen.len(), 5);
        // Resume from the third cookie revisits it.
        let mut it = store.oit_iter(seen[2].0).unwrap();
        assert_eq!(it.next().unwrap(), Some(seen[2]));
    }

    #[test]
    fn dir_cookie_resume_skips_dispatched_entries() {
        let store = MemStore::new(0);
        store.put_object(fid(1), Attr::directory(0o755, 0, 0));
        for name in [b"aa".as_ref(), b"bb", b"cc", b"dd"] {
            let child = fid(10 + name[0] as u32);
            store.put_object(child, Attr::regular(0o644, 0, 0));
            store.put_entry(fid(1), name, child, DirentType::Reg);
        }
        let mut it = store.dir_iter(fid(1), 0).unwrap();
        let first = it.next().unwrap().unwrap();
        let mut resumed = store.dir_iter(fid(1), first.cookie + 1).unwrap();
        let second = resumed.next().unwrap().unwrap();
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn index_is_key_ordered() {
        let store = MemStore::new(0);
        store.put_object(fid(1), Attr::regular(0o644, 0, 0));
        let mut tx = store.tx_create();
        tx.declare_index_insert(fid(1), b"b", 1).unwrap();
        tx.declare_index_insert(fid(1), b"a", 1).unwrap();
        tx.start().unwrap();
        tx.index_insert(fid(1), b"b", &[2]).unwrap();
        tx.index_insert(fid(1), b"a", &[1]).unwrap();
        tx.commit().unwrap();

        let mut it = store.index_iter(fid(1), b"").unwrap();
        assert_eq!(it.next().unwrap().unwrap().0, b"a".to_vec());
        assert_eq!(it.next().unwrap().unwrap().0, b"b".to_vec());
        assert_eq!(it.next().unwrap(), None);
    }
}
