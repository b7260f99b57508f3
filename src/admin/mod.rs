#![forbid(unsafe_code)]

//! Operator tooling over pending-delete logs.
//!
//! Inspection of log files and offline recovery against a data directory,
//! both returning serializable reports for the command line tool.

mod error;
mod inspect;
mod recover;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Read-only description of a log file.
pub use inspect::{inspect, InspectReport, RecordDetail, RecordSummary};

/// Offline recovery of a data directory.
pub use recover::{recover_data_dir, RecoverOptions};
