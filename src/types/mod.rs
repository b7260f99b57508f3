#![forbid(unsafe_code)]

//! Identifier types, relation file handles and the crate-wide error type.

use std::fmt;

use serde::Serialize;

/// Checksum helpers used by the record log.
pub mod checksum;

pub use checksum::{Checksum, Crc32Fast};

/// Transaction identifier as assigned by the transaction manager.
///
/// Ids below [`Xid::FIRST_NORMAL`] are permanent and compare with a plain
/// integer order; normal ids compare modulo 2^32.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Xid(pub u32);

impl Xid {
    /// The null transaction id.
    pub const INVALID: Xid = Xid(0);
    /// Id used while bootstrapping the catalog.
    pub const BOOTSTRAP: Xid = Xid(1);
    /// Id carried by frozen tuples.
    pub const FROZEN: Xid = Xid(2);
    /// First id handed out to ordinary transactions.
    pub const FIRST_NORMAL: Xid = Xid(3);

    /// Returns `true` for every id except [`Xid::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns `true` when the id belongs to an ordinary transaction.
    pub const fn is_normal(self) -> bool {
        self.0 >= Self::FIRST_NORMAL.0
    }

    /// Returns `true` when `self` is logically older than `other`.
    pub fn precedes(self, other: Xid) -> bool {
        if !self.is_normal() || !other.is_normal() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Xid {
    fn from(value: u32) -> Self {
        Xid(value)
    }
}

/// Slot index of a backend process in the shared registry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Serialize)]
#[serde(transparent)]
pub struct BackendId(pub u32);

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record in the log.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
#[serde(transparent)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical identity of a relation's storage: tablespace, database, relfile.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, Serialize)]
pub struct RelFileNode {
    /// Tablespace oid.
    pub spc: u32,
    /// Database oid.
    pub db: u32,
    /// Relation file number.
    pub rel: u32,
}

impl RelFileNode {
    /// Creates a relation file identity.
    pub const fn new(spc: u32, db: u32, rel: u32) -> Self {
        Self { spc, db, rel }
    }
}

impl fmt::Display for RelFileNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.spc, self.db, self.rel)
    }
}

/// Storage unit that may need to be removed if its creating transaction never
/// commits.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize)]
pub struct RelFileNodePendingDelete {
    /// Relation file identity.
    pub node: RelFileNode,
    /// Whether the file belongs to a temporary relation.
    pub is_temp: bool,
}

impl RelFileNodePendingDelete {
    /// Creates a handle for a permanent relation file.
    pub const fn new(spc: u32, db: u32, rel: u32) -> Self {
        Self {
            node: RelFileNode::new(spc, db, rel),
            is_temp: false,
        }
    }

    /// Creates a handle for a temporary relation file.
    pub const fn temp(spc: u32, db: u32, rel: u32) -> Self {
        Self {
            node: RelFileNode::new(spc, db, rel),
            is_temp: true,
        }
    }
}

impl fmt::Display for RelFileNodePendingDelete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_temp {
            write!(f, "{} (temp)", self.node)
        } else {
            write!(f, "{}", self.node)
        }
    }
}

/// A pending relation file linked to the transaction that created it.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default, Serialize)]
pub struct PendingRelXactDelete {
    /// File that would be orphaned if `xid` never commits.
    pub relnode: RelFileNodePendingDelete,
    /// Creating transaction.
    pub xid: Xid,
}

impl PendingRelXactDelete {
    /// Pairs a file handle with its creating transaction.
    pub const fn new(relnode: RelFileNodePendingDelete, xid: Xid) -> Self {
        Self { relnode, xid }
    }
}

/// Errors raised by the pending-delete subsystem.
#[derive(thiserror::Error, Debug)]
pub enum PendelError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// Persisted data failed validation.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// Caller supplied an unusable argument.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Caller supplied an unusable argument (owned message).
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The shared arena has no free node left.
    #[error("not enough memory to add pending delete node (backend {backend}, capacity {capacity})")]
    OutOfMemory {
        /// Backend that attempted the allocation.
        backend: BackendId,
        /// Total node capacity of the arena.
        capacity: usize,
    },
    /// A snapshot buffer could not be grown.
    #[error("not enough memory to grow pending delete snapshot to {entries} entries")]
    BufferExhausted {
        /// Entry capacity that was requested.
        entries: usize,
    },
    /// Configuration could not be loaded or failed validation.
    #[error("config: {0}")]
    Config(String),
    /// The storage layer refused to drop the files of a transaction.
    #[error("failed to drop files for xid {xid}: {source}")]
    DropFailed {
        /// Transaction whose files were being dropped.
        xid: Xid,
        /// Underlying failure.
        #[source]
        source: Box<PendelError>,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, PendelError>;
