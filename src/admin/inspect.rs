use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use crate::admin::{AdminError, Result};
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::wal::{RecordKind, WalIterator, WalRecord};
use crate::storage::pending::PendingRelXactDeleteArray;
use crate::storage::xact::XactRecord;
use crate::types::{Lsn, PendingRelXactDelete, Xid};

/// Decoded body of one log record.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordDetail {
    /// Registry snapshot.
    PendingDelete {
        /// Entries in the snapshot.
        entries: Vec<PendingRelXactDelete>,
    },
    /// Commit or abort of a transaction tree.
    Xact {
        /// Top-level transaction.
        xid: Xid,
        /// Sub-transactions.
        sub_xids: Vec<Xid>,
    },
    /// Checkpoint marker.
    Checkpoint,
    /// Body failed to decode.
    Undecodable {
        /// Decode error.
        error: String,
    },
}

/// One record of an [`InspectReport`].
#[derive(Debug, Clone, Serialize)]
pub struct RecordSummary {
    /// Position of the record.
    pub lsn: Lsn,
    /// Record type.
    pub kind: RecordKind,
    /// Payload size in bytes.
    pub payload_bytes: usize,
    /// Decoded payload.
    pub detail: RecordDetail,
}

/// Description of a log file.
#[derive(Debug, Clone, Serialize)]
pub struct InspectReport {
    /// Inspected path.
    pub path: String,
    /// File size in bytes.
    pub size_bytes: u64,
    /// Salt stored in the header.
    pub wal_salt: u64,
    /// Starting position stored in the header.
    pub start_lsn: Lsn,
    /// Every intact record in log order.
    pub records: Vec<RecordSummary>,
    /// Offset up to which records were validated.
    pub valid_up_to: u64,
    /// Bytes past the last intact record.
    pub trailing_bytes: u64,
}

impl InspectReport {
    /// Number of entries across all snapshot records.
    pub fn pending_entries(&self) -> usize {
        self.records
            .iter()
            .map(|record| match &record.detail {
                RecordDetail::PendingDelete { entries } => entries.len(),
                _ => 0,
            })
            .sum()
    }
}

fn describe(record: &WalRecord) -> RecordDetail {
    let decoded = match record.kind {
        RecordKind::PendingDelete => PendingRelXactDeleteArray::decode(&record.payload)
            .map(|array| RecordDetail::PendingDelete {
                entries: array.entries().to_vec(),
            }),
        RecordKind::XactCommit | RecordKind::XactAbort => XactRecord::decode(&record.payload)
            .map(|body| RecordDetail::Xact {
                xid: body.xid,
                sub_xids: body.sub_xids,
            }),
        RecordKind::Checkpoint => Ok(RecordDetail::Checkpoint),
    };
    decoded.unwrap_or_else(|err| RecordDetail::Undecodable {
        error: err.to_string(),
    })
}

/// Walks a log file read-only and describes every intact record.
///
/// # Errors
///
/// Returns an error if the file is missing, its header is invalid, or a
/// record with an unknown kind is found.
pub fn inspect(path: impl AsRef<Path>) -> Result<InspectReport> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(AdminError::missing_log(path));
    }
    let io: Arc<dyn FileIo> = Arc::new(StdFileIo::open_read_only(path)?);
    let size_bytes = io.len()?;
    let mut iter = WalIterator::open(Arc::clone(&io))?;
    let mut records = Vec::new();
    while let Some(record) = iter.next_record()? {
        records.push(RecordSummary {
            lsn: record.lsn,
            kind: record.kind,
            payload_bytes: record.payload.len(),
            detail: describe(&record),
        });
    }
    let valid_up_to = iter.valid_up_to();
    Ok(InspectReport {
        path: path.display().to_string(),
        size_bytes,
        wal_salt: iter.wal_salt(),
        start_lsn: iter.start_lsn(),
        records,
        valid_up_to,
        trailing_bytes: size_bytes.saturating_sub(valid_up_to),
    })
}
