//! Crash-safe tracking of relation files created by unfinished transactions.
//!
//! Backends register every file they create in a shared [`storage::Registry`].
//! At checkpoint time the registry is written to the log as one snapshot
//! record; during recovery the snapshot is replayed into a
//! [`storage::PendingDeleteRedo`] table, pruned by commit and abort records,
//! and whatever remains is dropped at the end of recovery.

#![warn(missing_docs)]

pub mod admin;
pub mod config;
pub mod primitives;
pub mod storage;
pub mod types;

pub use config::PendelConfig;
pub use types::{PendelError, Result};
