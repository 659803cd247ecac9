//! The object store consumed by the checkers.
//!
//! The engine never touches disk formats directly: it drives an abstract
//! transactional object store supplied by the host server. Objects are
//! addressed by FID; mutations are grouped into transactions that follow
//! the store's declare-before-start protocol: every write is declared on
//! the handle, the handle is started, the writes are applied, and `commit`
//! makes them durable atomically. Dropping an uncommitted transaction
//! rolls it back.

use bitflags::bitflags;

use crate::errno::{Errno, Result};
use crate::fid::Fid;

/// Object attributes as the store reports them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Attr {
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blocks: u64,
    pub ctime: i64,
}

impl Attr {
    pub fn is_dir(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFDIR
    }

    pub fn is_reg(&self) -> bool {
        self.mode & libc::S_IFMT == libc::S_IFREG
    }

    pub fn regular(perm: u32, uid: u32, gid: u32) -> Attr {
        Attr {
            mode: libc::S_IFREG | perm,
            nlink: 1,
            uid,
            gid,
            ..Attr::default()
        }
    }

    pub fn directory(perm: u32, uid: u32, gid: u32) -> Attr {
        Attr {
            mode: libc::S_IFDIR | perm,
            nlink: 2,
            uid,
            gid,
            ..Attr::default()
        }
    }
}

bitflags! {
    /// Which [`Attr`] fields an `attr_set` applies.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttrMask: u32 {
        const MODE  = 0x01;
        const UID   = 0x02;
        const GID   = 0x04;
        const SIZE  = 0x08;
        const CTIME = 0x10;
        const NLINK = 0x20;
    }
}

bitflags! {
    /// Creation semantics of an `xattr_set`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct XattrFlags: u32 {
        /// Fail with `EEXIST` if the xattr is already present.
        const CREATE  = 0x1;
        /// Fail with `ENODATA` if the xattr is absent.
        const REPLACE = 0x2;
    }
}

/// Directory entry type, mirroring the `DT_*` constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum DirentType {
    Unknown = 0,
    Fifo = 1,
    Chr = 2,
    Dir = 4,
    Blk = 6,
    Reg = 8,
    Lnk = 10,
    Sock = 12,
}

impl DirentType {
    pub fn from_mode(mode: u32) -> DirentType {
        match mode & libc::S_IFMT {
            libc::S_IFIFO => DirentType::Fifo,
            libc::S_IFCHR => DirentType::Chr,
            libc::S_IFDIR => DirentType::Dir,
            libc::S_IFBLK => DirentType::Blk,
            libc::S_IFREG => DirentType::Reg,
            libc::S_IFLNK => DirentType::Lnk,
            libc::S_IFSOCK => DirentType::Sock,
            _ => DirentType::Unknown,
        }
    }
}

bitflags! {
    /// Per-entry flags reported by the directory iterator.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DirentFlags: u32 {
        /// The entry must not be dispatched to checkers.
        const IGNORE = 0x1;
    }
}

/// One directory entry as yielded by a [`DirIter`]. The name has been
/// unpacked to host order and NUL-stripped by the iterator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dirent {
    pub fid: Fid,
    pub name: Vec<u8>,
    pub typ: DirentType,
    pub flags: DirentFlags,
    /// Hash cookie; iteration resumed at `cookie + 1` yields the next
    /// entry.
    pub cookie: u64,
}

/// Object-table iterator: every locally stored object in cookie order.
pub trait OitIter: Send {
    /// Next `(cookie, fid)` at or after the seek position.
    fn next(&mut self) -> Result<Option<(u64, Fid)>>;
}

/// Directory entry iterator in hash order.
pub trait DirIter: Send {
    fn next(&mut self) -> Result<Option<Dirent>>;
}

/// Byte-keyed index iterator in key order.
pub trait IndexIter: Send {
    fn next(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>>;
}

/// A store transaction. Declarations must cover every subsequent
/// operation; operations are only legal between `start` and `commit`.
pub trait Transaction: Send {
    fn declare_create(&mut self, fid: Fid) -> Result<()>;
    fn declare_destroy(&mut self, fid: Fid) -> Result<()>;
    fn declare_attr_set(&mut self, fid: Fid) -> Result<()>;
    fn declare_xattr_set(&mut self, fid: Fid, name: &str, len: usize) -> Result<()>;
    fn declare_xattr_del(&mut self, fid: Fid, name: &str) -> Result<()>;
    fn declare_insert(&mut self, dir: Fid, name: &[u8]) -> Result<()>;
    fn declare_delete(&mut self, dir: Fid, name: &[u8]) -> Result<()>;
    fn declare_ref_add(&mut self, fid: Fid) -> Result<()>;
    fn declare_ref_del(&mut self, fid: Fid) -> Result<()>;
    fn declare_record_write(&mut self, fid: Fid, len: usize) -> Result<()>;
    fn declare_index_insert(&mut self, obj: Fid, key: &[u8], val_len: usize) -> Result<()>;
    fn declare_index_delete(&mut self, obj: Fid, key: &[u8]) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    fn create(&mut self, fid: Fid, attr: &Attr) -> Result<()>;
    fn destroy(&mut self, fid: Fid) -> Result<()>;
    fn attr_set(&mut self, fid: Fid, attr: &Attr, valid: AttrMask) -> Result<()>;
    fn xattr_set(&mut self, fid: Fid, name: &str, value: &[u8], flags: XattrFlags) -> Result<()>;
    fn xattr_del(&mut self, fid: Fid, name: &str) -> Result<()>;
    fn insert(&mut self, dir: Fid, name: &[u8], fid: Fid, typ: DirentType) -> Result<()>;
    fn delete(&mut self, dir: Fid, name: &[u8]) -> Result<()>;
    fn ref_add(&mut self, fid: Fid) -> Result<()>;
    fn ref_del(&mut self, fid: Fid) -> Result<()>;
    fn record_write(&mut self, fid: Fid, offset: u64, data: &[u8]) -> Result<()>;
    fn index_insert(&mut self, obj: Fid, key: &[u8], val: &[u8]) -> Result<()>;
    fn index_delete(&mut self, obj: Fid, key: &[u8]) -> Result<()>;

    fn commit(self: Box<Self>) -> Result<()>;
}

/// The transactional object store.
pub trait Store: Send + Sync {
    fn exists(&self, fid: Fid) -> Result<bool>;

    /// Whether the object is present but already unlinked and awaiting
    /// destruction.
    fn is_dead(&self, fid: Fid) -> Result<bool>;

    fn attr_get(&self, fid: Fid) -> Result<Attr>;

    /// Read an xattr into `buf`. An empty `buf` queries the stored size;
    /// a too-small `buf` fails with `ERANGE`; an absent xattr fails with
    /// `ENODATA`.
    fn xattr_get(&self, fid: Fid, name: &str, buf: &mut [u8]) -> Result<usize>;

    fn lookup(&self, dir: Fid, name: &[u8]) -> Result<Fid>;

    fn index_lookup(&self, obj: Fid, key: &[u8]) -> Result<Vec<u8>>;

    fn record_read(&self, fid: Fid, offset: u64, buf: &mut [u8]) -> Result<usize>;

    fn oit_iter(&self, start_cookie: u64) -> Result<Box<dyn OitIter>>;

    fn dir_iter(&self, dir: Fid, start_cookie: u64) -> Result<Box<dyn DirIter>>;

    fn index_iter(&self, obj: Fid, start_key: &[u8]) -> Result<Box<dyn IndexIter>>;

    fn tx_create(&self) -> Box<dyn Transaction>;

    /// Hand out a fresh FID for a repair-created object, standing in for
    /// the external sequence controller.
    fn alloc_fid(&self) -> Result<Fid>;
}

/// Read a whole xattr, growing the buffer on `ERANGE` until the store and
/// the read agree on the size.
pub fn read_xattr(store: &dyn Store, fid: Fid, name: &str) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; 128];
    loop {
        match store.xattr_get(fid, name, &mut buf) {
            Ok(size) => {
                buf.truncate(size);
                return Ok(buf);
            }
            Err(Errno::ERANGE) => {
                let need = store.xattr_get(fid, name, &mut [])?;
                buf.resize(need.max(buf.len() * 2), 0);
            }
            Err(e) => return Err(e),
        }
    }
}
