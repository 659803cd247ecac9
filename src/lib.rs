//! Online distributed filesystem consistency check and repair engine.
//!
//! This crate implements the core of an online LFSCK: a resumable,
//! checkpointing scan over a server's object table with per-component
//! verification pipelines, peer coordination across metadata and object
//! servers, and in-place repair of cross-server reference inconsistencies
//! (layouts vs. OST objects, directory entries vs. link xattrs, striped
//! directory metadata).
//!
//! The crate deliberately stops at two seams: the transactional object
//! store underneath ([`Store`]) and the peer notification transport
//! ([`PeerLink`]). A host server supplies both; the bundled [`MemStore`]
//! and an in-process loopback are enough to run a whole miniature cluster
//! for tests.
//!
//! Wiring order on a node: build a [`Controller`] from a [`NodeConfig`],
//! register peer targets with [`Controller::add_target`], then
//! [`Controller::start`] a run. The controller spawns the scan engine and
//! one assistant thread per checker; phase transitions and peer events
//! flow through [`Controller::in_notify`].

#![warn(rust_2018_idioms)]

pub use crate::checker::{Checker, CheckerKind, Components, Position, StartParams, Status};
pub use crate::controller::{
    BOOKMARK_FID, Controller, DOT_FID, FidLocator, LAYOUT_FILE_FID, LPF_FID, LocalFld,
    NAMESPACE_FILE_FID, NodeConfig, NodeRole, TRACE_FILE_FID,
};
pub use crate::errno::{Errno, Result};
pub use crate::fid::{Fid, OstId, ResId};
pub use crate::lockmgr::{LocalLockMgr, LockBits, LockHandle, LockMgr, LockMode};
pub use crate::memstore::MemStore;
pub use crate::notify::{Event, LfsckRequest, OrphanRec, PeerLink};
pub use crate::ondisk::{
    BookmarkRecord, LayoutRecord, NamespaceRecord, ParamFlags, RunFlags, TraceFlags,
};
pub use crate::registry::{TgtDesc, TgtRegistry};
pub use crate::store::{
    Attr, AttrMask, DirIter, Dirent, DirentFlags, DirentType, IndexIter, OitIter, Store,
    Transaction, XattrFlags, read_xattr,
};

pub mod bitmap;
mod checker;
mod checkpoint;
mod controller;
mod engine;
mod errno;
pub mod fid;
mod layout;
pub mod linkea;
mod lockmgr;
pub mod lmv;
pub mod lov;
mod memstore;
mod namespace;
mod notify;
pub mod ondisk;
mod pipeline;
mod registry;
mod store;
pub mod tracefile;
