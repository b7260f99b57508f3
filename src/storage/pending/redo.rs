//! Recovery-time reconciliation of pending deletes.
//!
//! A [`PendingDeleteRedo`] lives for one recovery pass. Snapshot records add
//! entries for transactions that were still running, commit and abort records
//! prune them, and [`PendingDeleteRedo::finalize_and_drop_all`] removes the
//! files of whatever is left.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PendelConfig;
use crate::storage::pending::dump::PendingRelXactDeleteArray;
use crate::storage::smgr::FileDropper;
use crate::storage::xact::{TransactionStatus, XidStatus};
use crate::types::{PendelError, RelFileNodePendingDelete, Result, Xid};

/// Why an xid was excluded from admission or dropping.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Verdict {
    Eligible,
    BeforeHorizon(Xid),
    NotInProgress(XidStatus),
}

fn judge(xid: Xid, status: &dyn TransactionStatus) -> Verdict {
    let oldest = status.oldest_xid();
    if xid.precedes(oldest) {
        return Verdict::BeforeHorizon(oldest);
    }
    match status.status_of(xid) {
        XidStatus::InProgress => Verdict::Eligible,
        other => Verdict::NotInProgress(other),
    }
}

/// Outcome of replaying one snapshot record.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct AdmitCounts {
    /// Entries added to the table.
    pub admitted: usize,
    /// Entries whose xid precedes the oldest horizon.
    pub skipped_horizon: usize,
    /// Entries whose transaction was no longer in progress.
    pub skipped_status: usize,
}

/// A transaction excluded at finalize time because of its status.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct SkippedXid {
    /// Transaction id.
    pub xid: Xid,
    /// Status reported by the ledger.
    pub status: XidStatus,
}

/// A transaction whose files could not be dropped.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct DropFailure {
    /// Transaction id.
    pub xid: Xid,
    /// Handles passed to the dropper; some may have been removed before the
    /// failure.
    pub handles: usize,
    /// Rendered error.
    pub error: String,
}

/// Summary of [`PendingDeleteRedo::finalize_and_drop_all`].
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct FinalizeReport {
    /// Transactions whose files were dropped.
    pub dropped_xids: Vec<Xid>,
    /// Relation handles dropped for the transactions in `dropped_xids`.
    pub files_dropped: usize,
    /// Transactions excluded because they precede the oldest horizon.
    pub skipped_horizon: Vec<Xid>,
    /// Transactions excluded because they are no longer in progress.
    pub skipped_status: Vec<SkippedXid>,
    /// Transactions whose drop request failed.
    pub failures: Vec<DropFailure>,
    /// Duplicate handles collapsed before dropping.
    pub duplicates_collapsed: usize,
}

/// Recovery-only table of `xid -> handles` still waiting for a verdict.
#[derive(Debug)]
pub struct PendingDeleteRedo {
    enabled: bool,
    table: Option<FxHashMap<Xid, Vec<RelFileNodePendingDelete>>>,
}

impl PendingDeleteRedo {
    /// Creates the state for one recovery pass.
    pub fn new(config: &PendelConfig) -> Self {
        Self {
            enabled: config.tracking_enabled(),
            table: None,
        }
    }

    /// Returns `true` once the first entry has been admitted and until
    /// finalize.
    pub fn is_active(&self) -> bool {
        self.table.is_some()
    }

    /// Number of transactions with admitted entries.
    pub fn len(&self) -> usize {
        self.table.as_ref().map_or(0, FxHashMap::len)
    }

    /// Returns true if no transaction has admitted entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Handles admitted for `xid`.
    pub fn handles(&self, xid: Xid) -> &[RelFileNodePendingDelete] {
        self.table
            .as_ref()
            .and_then(|table| table.get(&xid))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Records that `handle` may be orphaned if `xid` never finishes.
    pub fn admit_entry(&mut self, handle: RelFileNodePendingDelete, xid: Xid) {
        if !self.enabled || !xid.is_valid() {
            return;
        }
        self.table
            .get_or_insert_with(FxHashMap::default)
            .entry(xid)
            .or_default()
            .push(handle);
    }

    /// Replays one snapshot record body.
    ///
    /// Entries are admitted only if their xid does not precede the oldest
    /// horizon and the ledger still reports it in progress.
    pub fn replay_log_record(
        &mut self,
        payload: &[u8],
        status: &dyn TransactionStatus,
    ) -> Result<AdmitCounts> {
        let mut counts = AdmitCounts::default();
        if !self.enabled {
            return Ok(counts);
        }
        let snapshot = PendingRelXactDeleteArray::decode(payload)?;
        for entry in &snapshot {
            match judge(entry.xid, status) {
                Verdict::Eligible => {
                    self.admit_entry(entry.relnode, entry.xid);
                    counts.admitted += 1;
                }
                Verdict::BeforeHorizon(oldest) => {
                    info!(
                        xid = entry.xid.0,
                        oldest_xid = oldest.0,
                        "pending.redo.skip_horizon"
                    );
                    counts.skipped_horizon += 1;
                }
                Verdict::NotInProgress(xid_status) => {
                    info!(
                        xid = entry.xid.0,
                        status = %xid_status,
                        "pending.redo.skip_status"
                    );
                    counts.skipped_status += 1;
                }
            }
        }
        debug!(
            entries = snapshot.len(),
            admitted = counts.admitted,
            "pending.redo.replay"
        );
        Ok(counts)
    }

    /// Forgets `xid` and its sub-transactions once their outcome is logged.
    ///
    /// Returns the number of transactions that had entries.
    pub fn prune_transaction_tree(&mut self, xid: Xid, sub_xids: &[Xid]) -> usize {
        if !self.enabled {
            return 0;
        }
        let Some(table) = self.table.as_mut() else {
            return 0;
        };
        let mut removed = 0;
        for id in sub_xids.iter().chain(std::iter::once(&xid)) {
            if id.is_valid() && table.remove(id).is_some() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(xid = xid.0, subxacts = sub_xids.len(), removed, "pending.redo.prune");
        }
        removed
    }

    /// Drops the files of every transaction still in the table, then
    /// discards the table.
    ///
    /// Each transaction is re-validated against the horizon and the ledger
    /// first. A failed drop is logged and recorded; the remaining
    /// transactions are still processed.
    pub fn finalize_and_drop_all(
        &mut self,
        status: &dyn TransactionStatus,
        dropper: &dyn FileDropper,
    ) -> FinalizeReport {
        let mut report = FinalizeReport::default();
        if !self.enabled {
            return report;
        }
        let Some(table) = self.table.take() else {
            return report;
        };
        let mut entries: Vec<_> = table.into_iter().collect();
        entries.sort_unstable_by_key(|(xid, _)| xid.0);

        for (xid, handles) in entries {
            match judge(xid, status) {
                Verdict::Eligible => {}
                Verdict::BeforeHorizon(oldest) => {
                    warn!(
                        xid = xid.0,
                        oldest_xid = oldest.0,
                        "pending.finalize.skip_horizon"
                    );
                    report.skipped_horizon.push(xid);
                    continue;
                }
                Verdict::NotInProgress(xid_status) => {
                    warn!(
                        xid = xid.0,
                        status = %xid_status,
                        "pending.finalize.skip_status"
                    );
                    report.skipped_status.push(SkippedXid {
                        xid,
                        status: xid_status,
                    });
                    continue;
                }
            }
            if handles.is_empty() {
                warn!(xid = xid.0, "pending.finalize.empty_list");
                continue;
            }

            let mut seen = FxHashSet::default();
            let mut unique = Vec::with_capacity(handles.len());
            for handle in handles {
                if seen.insert(handle.node) {
                    info!(
                        xid = xid.0,
                        spc = handle.node.spc,
                        db = handle.node.db,
                        rel = handle.node.rel,
                        temp = handle.is_temp,
                        "pending.finalize.prepare_drop"
                    );
                    unique.push(handle);
                } else {
                    debug!(xid = xid.0, node = %handle.node, "pending.finalize.duplicate");
                    report.duplicates_collapsed += 1;
                }
            }

            match dropper.drop_files(&unique, true) {
                Ok(()) => {
                    info!(xid = xid.0, count = unique.len(), "pending.finalize.dropped");
                    report.files_dropped += unique.len();
                    report.dropped_xids.push(xid);
                }
                Err(source) => {
                    let err = PendelError::DropFailed {
                        xid,
                        source: Box::new(source),
                    };
                    warn!(xid = xid.0, error = %err, "pending.finalize.drop_failed");
                    report.failures.push(DropFailure {
                        xid,
                        handles: unique.len(),
                        error: err.to_string(),
                    });
                }
            }
        }
        report
    }
}
