#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::{Arc, Once};

use parking_lot::Mutex;
use pendel::config::PendelConfig;
use pendel::primitives::io::StdFileIo;
use pendel::primitives::wal::{RecordKind, RecordLog, Wal, WalOptions};
use pendel::storage::{
    checkpoint, recover, FileDropper, FsFileDropper, PendingDeleteRedo, PendingRelXactDeleteArray,
    Registry, StatusLedger, XactRecord,
};
use pendel::types::{BackendId, Lsn, RelFileNodePendingDelete, Result, Xid};
use tempfile::tempdir;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("pendel=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

#[derive(Default)]
struct RecordingDropper {
    calls: Mutex<Vec<Vec<RelFileNodePendingDelete>>>,
}

impl FileDropper for RecordingDropper {
    fn drop_files(&self, handles: &[RelFileNodePendingDelete], is_redo: bool) -> Result<()> {
        assert!(is_redo, "finalize must drop in recovery mode");
        self.calls.lock().push(handles.to_vec());
        Ok(())
    }
}

fn touch(root: &Path, handle: &RelFileNodePendingDelete) {
    let path = FsFileDropper::new(root).relation_path(handle);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, b"relation").unwrap();
}

fn exists(root: &Path, handle: &RelFileNodePendingDelete) -> bool {
    FsFileDropper::new(root).relation_path(handle).exists()
}

#[test]
fn add_dump_remove_roundtrip() -> Result<()> {
    init_tracing();
    let registry = Registry::new(&PendelConfig::compact(4, 16))?;
    let backend = registry.attach(BackendId(0))?;
    let handle = RelFileNodePendingDelete::new(1, 1, 100);

    let token = backend.add(handle, Xid(1))?;
    let snapshot = registry.dump()?.expect("one entry");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot.entries()[0].xid, Xid(1));
    assert_eq!(snapshot.entries()[0].relnode, handle);

    backend.remove(token);
    assert!(registry.dump()?.is_none());
    Ok(())
}

#[test]
fn finalize_respects_horizon() {
    init_tracing();
    let ledger = StatusLedger::new(Xid(5));
    let dropper = RecordingDropper::default();
    let mut redo = PendingDeleteRedo::new(&PendelConfig::default());
    for xid in 1..=19u32 {
        redo.admit_entry(RelFileNodePendingDelete::new(1, 1, 1000 + xid), Xid(xid));
    }

    let report = redo.finalize_and_drop_all(&ledger, &dropper);
    assert_eq!(report.files_dropped, 15);
    assert_eq!(report.dropped_xids, (5..=19).map(Xid).collect::<Vec<_>>());
    assert_eq!(report.skipped_horizon.len(), 4);
    assert_eq!(dropper.calls.lock().len(), 15);
}

#[test]
fn finalize_collapses_duplicate_handles() {
    init_tracing();
    let ledger = StatusLedger::new(Xid::INVALID);
    let dropper = RecordingDropper::default();
    let mut redo = PendingDeleteRedo::new(&PendelConfig::default());
    let dup = RelFileNodePendingDelete::new(1, 1, 100);
    let other = RelFileNodePendingDelete::new(1, 1, 101);
    redo.admit_entry(dup, Xid(1));
    redo.admit_entry(dup, Xid(1));
    redo.admit_entry(other, Xid(1));

    let report = redo.finalize_and_drop_all(&ledger, &dropper);
    let calls = dropper.calls.lock();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].len(), 2);
    assert!(calls[0].contains(&dup) && calls[0].contains(&other));
    assert_eq!(report.duplicates_collapsed, 1);
}

#[test]
fn pruned_tree_is_never_dropped() {
    init_tracing();
    let ledger = StatusLedger::new(Xid(3));
    let dropper = RecordingDropper::default();
    let mut redo = PendingDeleteRedo::new(&PendelConfig::default());
    for (xid, rel) in [(5u32, 1u32), (10, 2), (11, 3)] {
        redo.admit_entry(RelFileNodePendingDelete::new(1, 1, rel), Xid(xid));
    }

    assert_eq!(redo.prune_transaction_tree(Xid(5), &[Xid(10), Xid(11)]), 3);
    let report = redo.finalize_and_drop_all(&ledger, &dropper);
    assert!(report.dropped_xids.is_empty());
    assert!(dropper.calls.lock().is_empty());
}

#[test]
fn empty_snapshot_leaves_table_uncreated() -> Result<()> {
    init_tracing();
    let ledger = StatusLedger::default();
    let mut redo = PendingDeleteRedo::new(&PendelConfig::default());
    let payload = PendingRelXactDeleteArray::default().encode();
    let counts = redo.replay_log_record(&payload, &ledger)?;
    assert_eq!(counts.admitted, 0);
    assert!(!redo.is_active());
    Ok(())
}

#[test]
fn checkpoint_then_crash_drops_only_unfinished_files() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(4, 64);

    let committed = RelFileNodePendingDelete::new(1663, 5, 16384);
    let aborted = RelFileNodePendingDelete::new(1663, 5, 16385);
    let orphan = RelFileNodePendingDelete::new(1663, 5, 16386);
    let orphan_temp = RelFileNodePendingDelete::temp(1663, 5, 16387);
    let late = RelFileNodePendingDelete::new(1663, 5, 16388);
    for handle in [&committed, &aborted, &orphan, &orphan_temp, &late] {
        touch(&data, handle);
    }

    {
        let wal = Wal::open(Arc::new(StdFileIo::open(&wal_path)?), WalOptions::new(11, Lsn(1)))?;
        let registry = Registry::new(&config)?;
        let b1 = registry.attach(BackendId(1))?;
        let b2 = registry.attach(BackendId(2))?;

        let t_committed = b1.add(committed, Xid(100))?;
        b2.add(aborted, Xid(101))?;
        b2.add(orphan, Xid(102))?;
        b2.add(orphan_temp, Xid(102))?;

        let report = checkpoint(&registry, &wal)?;
        assert!(report.snapshot_lsn.is_some());

        // Created after the checkpoint: never reaches the log.
        b1.add(late, Xid(103))?;

        b1.remove(t_committed);
        let lsn = wal.insert(
            RecordKind::XactCommit,
            &XactRecord::new(Xid(100), vec![]).encode(),
        )?;
        let lsn2 = wal.insert(
            RecordKind::XactAbort,
            &XactRecord::new(Xid(101), vec![]).encode(),
        )?;
        wal.flush(lsn.max(lsn2))?;

        // Crash: shared memory is lost without running backend shutdown.
        std::mem::forget(b1);
        std::mem::forget(b2);
    }

    let wal = Wal::open(Arc::new(StdFileIo::open(&wal_path)?), WalOptions::new(11, Lsn(1)))?;
    let ledger = StatusLedger::new(Xid(3));
    let dropper = FsFileDropper::new(&data);
    let report = recover(&wal, &config, &ledger, &dropper)?;

    assert_eq!(report.replay.snapshots, 1);
    assert_eq!(report.replay.entries_admitted, 4);
    assert_eq!(report.replay.pruned, 2);
    assert_eq!(report.finalize.dropped_xids, vec![Xid(102)]);
    assert_eq!(report.finalize.files_dropped, 2);

    assert!(exists(&data, &committed));
    assert!(exists(&data, &late));
    // Aborted transactions clean up their own files; recovery leaves them be.
    assert!(exists(&data, &aborted));
    assert!(!exists(&data, &orphan));
    assert!(!exists(&data, &orphan_temp));
    Ok(())
}

#[test]
fn empty_registry_checkpoint_writes_marker_only() -> Result<()> {
    init_tracing();
    let dir = tempdir().unwrap();
    let wal = Wal::open(
        Arc::new(StdFileIo::open(dir.path().join("pendel.wal"))?),
        WalOptions::default(),
    )?;
    let registry = Registry::new(&PendelConfig::compact(2, 8))?;
    let report = checkpoint(&registry, &wal)?;
    assert_eq!(report.snapshot_lsn, None);

    let kinds: Vec<RecordKind> = wal
        .iter()?
        .map(|record| record.map(|r| r.kind))
        .collect::<Result<_>>()?;
    assert_eq!(kinds, vec![RecordKind::Checkpoint]);
    Ok(())
}

#[test]
fn disabled_tracking_is_fully_inert() -> Result<()> {
    init_tracing();
    let config = PendelConfig::disabled();
    let registry = Registry::new(&config)?;
    let backend = registry.attach(BackendId(0))?;
    let token = backend.add(RelFileNodePendingDelete::new(1, 1, 1), Xid(10))?;
    assert!(!token.is_valid());
    assert!(registry.dump()?.is_none());
    assert_eq!(registry.nodes_in_use(), 0);

    let ledger = StatusLedger::default();
    let dropper = RecordingDropper::default();
    let mut redo = PendingDeleteRedo::new(&config);
    redo.admit_entry(RelFileNodePendingDelete::new(1, 1, 1), Xid(10));
    let report = redo.finalize_and_drop_all(&ledger, &dropper);
    assert!(report.dropped_xids.is_empty());
    assert!(dropper.calls.lock().is_empty());
    Ok(())
}
