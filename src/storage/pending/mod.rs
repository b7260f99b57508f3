//! Pending-delete tracking: the shared registry, its persisted snapshot and
//! the recovery-time reconciliation table.

pub mod dump;
pub mod redo;
pub mod registry;
pub mod xlog;

pub use dump::PendingRelXactDeleteArray;
pub use redo::{AdmitCounts, DropFailure, FinalizeReport, PendingDeleteRedo, SkippedXid};
pub use registry::{Backend, PendingToken, Registry};
pub use xlog::persist_snapshot;
