#![forbid(unsafe_code)]

//! Transaction status lookups and the commit/abort record body.

use std::fmt;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::types::{PendelError, Result, Xid};

/// Outcome of a transaction as seen by the status ledger.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum XidStatus {
    /// Still running, or never finished before a crash.
    InProgress,
    /// Committed.
    Committed,
    /// Aborted.
    Aborted,
    /// Sub-transaction committed into a parent whose outcome is pending.
    SubCommitted,
}

impl fmt::Display for XidStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            XidStatus::InProgress => "in_progress",
            XidStatus::Committed => "committed",
            XidStatus::Aborted => "aborted",
            XidStatus::SubCommitted => "sub_committed",
        })
    }
}

/// Read access to transaction outcomes and the freeze horizon.
pub trait TransactionStatus {
    /// Status recorded for `xid`.
    fn status_of(&self, xid: Xid) -> XidStatus;

    /// Oldest transaction whose status is still reliably known.
    fn oldest_xid(&self) -> Xid;

    /// Called for every commit or abort record replayed from the log.
    ///
    /// Ledgers that rebuild their state from the log override this; the
    /// default ignores it.
    fn record_completion(&self, _xid: Xid, _sub_xids: &[Xid], _status: XidStatus) {}
}

/// In-memory, thread-safe status ledger.
///
/// Ids that were never recorded report [`XidStatus::InProgress`].
#[derive(Debug)]
pub struct StatusLedger {
    statuses: RwLock<FxHashMap<Xid, XidStatus>>,
    oldest: RwLock<Xid>,
}

impl Default for StatusLedger {
    fn default() -> Self {
        Self::new(Xid::FIRST_NORMAL)
    }
}

impl StatusLedger {
    /// Creates an empty ledger with the given horizon.
    pub fn new(oldest_xid: Xid) -> Self {
        Self {
            statuses: RwLock::new(FxHashMap::default()),
            oldest: RwLock::new(oldest_xid),
        }
    }

    /// Records the status of one transaction.
    pub fn set_status(&self, xid: Xid, status: XidStatus) {
        self.statuses.write().insert(xid, status);
    }

    /// Marks a transaction tree committed.
    pub fn commit(&self, xid: Xid, sub_xids: &[Xid]) {
        self.set_tree(xid, sub_xids, XidStatus::Committed);
    }

    /// Marks a transaction tree aborted.
    pub fn abort(&self, xid: Xid, sub_xids: &[Xid]) {
        self.set_tree(xid, sub_xids, XidStatus::Aborted);
    }

    /// Moves the freeze horizon.
    pub fn set_oldest_xid(&self, xid: Xid) {
        *self.oldest.write() = xid;
    }

    fn set_tree(&self, xid: Xid, sub_xids: &[Xid], status: XidStatus) {
        let mut statuses = self.statuses.write();
        for sub in sub_xids {
            statuses.insert(*sub, status);
        }
        statuses.insert(xid, status);
    }
}

impl TransactionStatus for StatusLedger {
    fn status_of(&self, xid: Xid) -> XidStatus {
        self.statuses
            .read()
            .get(&xid)
            .copied()
            .unwrap_or(XidStatus::InProgress)
    }

    fn oldest_xid(&self) -> Xid {
        *self.oldest.read()
    }

    fn record_completion(&self, xid: Xid, sub_xids: &[Xid], status: XidStatus) {
        self.set_tree(xid, sub_xids, status);
    }
}

/// Body of a commit or abort record: the top-level xid and its sub-xids.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct XactRecord {
    /// Top-level transaction.
    pub xid: Xid,
    /// Sub-transactions finished together with `xid`.
    pub sub_xids: Vec<Xid>,
}

impl XactRecord {
    /// Creates a record body.
    pub fn new(xid: Xid, sub_xids: Vec<Xid>) -> Self {
        Self { xid, sub_xids }
    }

    /// Encodes as `xid u32 | count u32 | count * u32`, big-endian.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.sub_xids.len() * 4);
        buf.extend_from_slice(&self.xid.0.to_be_bytes());
        buf.extend_from_slice(&(self.sub_xids.len() as u32).to_be_bytes());
        for sub in &self.sub_xids {
            buf.extend_from_slice(&sub.0.to_be_bytes());
        }
        buf
    }

    /// Decodes a record body, rejecting any length mismatch.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < 8 {
            return Err(PendelError::Corruption("xact record truncated"));
        }
        let xid = Xid(u32::from_be_bytes(src[0..4].try_into().unwrap()));
        let count = u32::from_be_bytes(src[4..8].try_into().unwrap()) as usize;
        let body = &src[8..];
        if body.len() != count.saturating_mul(4) {
            return Err(PendelError::Corruption("xact record length mismatch"));
        }
        let sub_xids = body
            .chunks_exact(4)
            .map(|chunk| Xid(u32::from_be_bytes(chunk.try_into().unwrap())))
            .collect();
        Ok(Self { xid, sub_xids })
    }
}
