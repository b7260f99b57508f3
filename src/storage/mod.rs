//! Pending-delete tracking and the collaborators it runs against.
//!
//! The registry and redo table live in [`pending`]; transaction outcomes come
//! from [`xact`], files are removed through [`smgr`], and [`recovery`] ties
//! them to the record log.

/// Per-backend registry, snapshot records and redo reconciliation.
pub mod pending;

/// Log replay and end-of-recovery cleanup.
pub mod recovery;

/// Relation file removal.
pub mod smgr;

/// Transaction status ledger and commit/abort record bodies.
pub mod xact;

pub use pending::{
    persist_snapshot, Backend, FinalizeReport, PendingDeleteRedo, PendingRelXactDeleteArray,
    PendingToken, Registry,
};
pub use recovery::{checkpoint, recover, replay, CheckpointReport, RecoveryReport, ReplayStats};
pub use smgr::{FileDropper, FsFileDropper};
pub use xact::{StatusLedger, TransactionStatus, XactRecord, XidStatus};
