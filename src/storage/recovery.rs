#![forbid(unsafe_code)]

//! Log replay for pending deletes and the checkpoint hook that feeds it.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::PendelConfig;
use crate::primitives::wal::{RecordKind, RecordLog, Wal, WalRecord};
use crate::storage::pending::{persist_snapshot, FinalizeReport, PendingDeleteRedo, Registry};
use crate::storage::smgr::FileDropper;
use crate::storage::xact::{TransactionStatus, XactRecord, XidStatus};
use crate::types::{Lsn, Result};

/// Counters collected while replaying the log.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct ReplayStats {
    /// Records read.
    pub records: u64,
    /// Pending-delete snapshot records replayed.
    pub snapshots: u64,
    /// Entries admitted to the redo table.
    pub entries_admitted: u64,
    /// Entries discarded because their xid precedes the oldest horizon.
    pub skipped_horizon: u64,
    /// Entries discarded because their transaction was no longer running.
    pub skipped_status: u64,
    /// Commit records replayed.
    pub commits: u64,
    /// Abort records replayed.
    pub aborts: u64,
    /// Transactions pruned from the redo table.
    pub pruned: u64,
    /// Checkpoint markers seen.
    pub checkpoints: u64,
    /// Records whose body could not be decoded and were skipped.
    pub undecodable: u64,
    /// Position of the last record read.
    pub last_lsn: Option<Lsn>,
}

/// Everything one recovery pass did.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RecoveryReport {
    /// Replay counters.
    pub replay: ReplayStats,
    /// End-of-recovery cleanup.
    pub finalize: FinalizeReport,
}

/// Outcome of [`checkpoint`].
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct CheckpointReport {
    /// Position of the snapshot record, if one was written.
    pub snapshot_lsn: Option<Lsn>,
    /// Position of the checkpoint marker.
    pub checkpoint_lsn: Lsn,
}

/// Feeds log records to the redo table in log order.
///
/// Snapshot records are admitted through the horizon and status filter;
/// commit and abort records are reported to the ledger and prune their
/// transaction tree. Other kinds are counted and skipped, as are records
/// whose body fails to decode. Read errors from `records` end the replay.
pub fn replay<I>(
    records: I,
    redo: &mut PendingDeleteRedo,
    status: &dyn TransactionStatus,
) -> Result<ReplayStats>
where
    I: IntoIterator<Item = Result<WalRecord>>,
{
    let mut stats = ReplayStats::default();
    for record in records {
        let record = record?;
        stats.records += 1;
        stats.last_lsn = Some(record.lsn);
        match record.kind {
            RecordKind::PendingDelete => {
                let counts = match redo.replay_log_record(&record.payload, status) {
                    Ok(counts) => counts,
                    Err(err) => {
                        warn!(
                            lsn = record.lsn.0,
                            kind = %record.kind,
                            error = %err,
                            "pending.recovery.undecodable"
                        );
                        stats.undecodable += 1;
                        continue;
                    }
                };
                stats.snapshots += 1;
                stats.entries_admitted += counts.admitted as u64;
                stats.skipped_horizon += counts.skipped_horizon as u64;
                stats.skipped_status += counts.skipped_status as u64;
            }
            RecordKind::XactCommit | RecordKind::XactAbort => {
                let body = match XactRecord::decode(&record.payload) {
                    Ok(body) => body,
                    Err(err) => {
                        warn!(
                            lsn = record.lsn.0,
                            kind = %record.kind,
                            error = %err,
                            "pending.recovery.undecodable"
                        );
                        stats.undecodable += 1;
                        continue;
                    }
                };
                let outcome = if record.kind == RecordKind::XactCommit {
                    stats.commits += 1;
                    XidStatus::Committed
                } else {
                    stats.aborts += 1;
                    XidStatus::Aborted
                };
                status.record_completion(body.xid, &body.sub_xids, outcome);
                stats.pruned += redo.prune_transaction_tree(body.xid, &body.sub_xids) as u64;
            }
            RecordKind::Checkpoint => stats.checkpoints += 1,
        }
    }
    debug!(
        records = stats.records,
        snapshots = stats.snapshots,
        admitted = stats.entries_admitted,
        "pending.recovery.replayed"
    );
    Ok(stats)
}

/// Runs one full recovery pass over `wal`: replay, then drop the files of
/// every transaction that never finished.
pub fn recover(
    wal: &Wal,
    config: &PendelConfig,
    status: &dyn TransactionStatus,
    dropper: &dyn FileDropper,
) -> Result<RecoveryReport> {
    let mut redo = PendingDeleteRedo::new(config);
    let replay = replay(wal.iter()?, &mut redo, status)?;
    let finalize = redo.finalize_and_drop_all(status, dropper);
    info!(
        records = replay.records,
        dropped_xids = finalize.dropped_xids.len(),
        files = finalize.files_dropped,
        failures = finalize.failures.len(),
        "pending.recovery.done"
    );
    Ok(RecoveryReport { replay, finalize })
}

/// Checkpoint hook: persists the registry snapshot, then appends and flushes
/// a checkpoint marker.
pub fn checkpoint(registry: &Registry, log: &dyn RecordLog) -> Result<CheckpointReport> {
    let snapshot_lsn = persist_snapshot(registry, log)?;
    let checkpoint_lsn = log.insert(RecordKind::Checkpoint, &[])?;
    log.flush(checkpoint_lsn)?;
    debug!(
        snapshot = snapshot_lsn.map(|lsn| lsn.0),
        lsn = checkpoint_lsn.0,
        "pending.recovery.checkpoint"
    );
    Ok(CheckpointReport {
        snapshot_lsn,
        checkpoint_lsn,
    })
}
