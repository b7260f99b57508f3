#![allow(missing_docs)]

use std::fs;
use std::path::Path;
use std::sync::Arc;

use pendel::config::PendelConfig;
use pendel::primitives::io::{FileIo, StdFileIo};
use pendel::primitives::wal::{RecordKind, RecordLog, Wal, WalOptions};
use pendel::storage::{
    checkpoint, persist_snapshot, recover, FsFileDropper, Registry, StatusLedger,
    TransactionStatus, XactRecord, XidStatus,
};
use pendel::types::{BackendId, Lsn, RelFileNodePendingDelete, Result, Xid};
use tempfile::tempdir;

const SALT: u64 = 0x5eed;

fn open_wal(path: &Path) -> Result<Wal> {
    Wal::open(Arc::new(StdFileIo::open(path)?), WalOptions::new(SALT, Lsn(1)))
}

fn create_relation(root: &Path, handle: &RelFileNodePendingDelete, segments: u32) {
    let base = FsFileDropper::new(root).relation_path(handle);
    fs::create_dir_all(base.parent().unwrap()).unwrap();
    fs::write(&base, b"seg0").unwrap();
    for seg in 1..=segments {
        fs::write(base.with_extension(seg.to_string()), b"segN").unwrap();
    }
}

fn relation_exists(root: &Path, handle: &RelFileNodePendingDelete) -> bool {
    FsFileDropper::new(root).relation_path(handle).exists()
}

#[test]
fn torn_commit_record_leaves_transaction_unfinished() -> Result<()> {
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(2, 16);
    let handle = RelFileNodePendingDelete::new(1663, 5, 20000);
    create_relation(&data, &handle, 2);

    {
        let wal = open_wal(&wal_path)?;
        let registry = Registry::new(&config)?;
        let backend = registry.attach(BackendId(0))?;
        backend.add(handle, Xid(500))?;
        checkpoint(&registry, &wal)?;
        let lsn = wal.insert(
            RecordKind::XactCommit,
            &XactRecord::new(Xid(500), vec![]).encode(),
        )?;
        wal.flush(lsn)?;
        std::mem::forget(backend);
    }

    // Tear the commit record: it never became durable.
    let io = StdFileIo::open(&wal_path)?;
    let len = io.len()?;
    io.truncate(len - 3)?;

    let wal = open_wal(&wal_path)?;
    assert!(wal.stats().truncated_tail_bytes > 0);
    let ledger = StatusLedger::new(Xid(3));
    let report = recover(&wal, &config, &ledger, &FsFileDropper::new(&data))?;
    assert_eq!(report.replay.commits, 0);
    assert_eq!(report.finalize.dropped_xids, vec![Xid(500)]);
    assert_eq!(ledger.status_of(Xid(500)), XidStatus::InProgress);
    assert!(!relation_exists(&data, &handle));
    assert!(!data.join("1663/5/20000.1").exists());
    assert!(!data.join("1663/5/20000.2").exists());
    Ok(())
}

#[test]
fn durable_commit_keeps_files() -> Result<()> {
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(2, 16);
    let handle = RelFileNodePendingDelete::new(1663, 5, 20001);
    create_relation(&data, &handle, 0);

    {
        let wal = open_wal(&wal_path)?;
        let registry = Registry::new(&config)?;
        let backend = registry.attach(BackendId(1))?;
        let token = backend.add(handle, Xid(600))?;
        checkpoint(&registry, &wal)?;
        backend.remove(token);
        let lsn = wal.insert(
            RecordKind::XactCommit,
            &XactRecord::new(Xid(600), vec![Xid(601)]).encode(),
        )?;
        wal.flush(lsn)?;
    }

    let wal = open_wal(&wal_path)?;
    let ledger = StatusLedger::new(Xid(3));
    let report = recover(&wal, &config, &ledger, &FsFileDropper::new(&data))?;
    assert_eq!(report.replay.commits, 1);
    assert!(report.finalize.dropped_xids.is_empty());
    assert_eq!(ledger.status_of(Xid(601)), XidStatus::Committed);
    assert!(relation_exists(&data, &handle));
    Ok(())
}

#[test]
fn torn_snapshot_admits_nothing() -> Result<()> {
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(2, 16);
    let handle = RelFileNodePendingDelete::new(1663, 5, 20002);
    create_relation(&data, &handle, 0);

    {
        let wal = open_wal(&wal_path)?;
        let registry = Registry::new(&config)?;
        let backend = registry.attach(BackendId(0))?;
        backend.add(handle, Xid(700))?;
        persist_snapshot(&registry, &wal)?;
        std::mem::forget(backend);
    }
    let io = StdFileIo::open(&wal_path)?;
    let len = io.len()?;
    io.truncate(len - 1)?;

    let wal = open_wal(&wal_path)?;
    let ledger = StatusLedger::new(Xid(3));
    let report = recover(&wal, &config, &ledger, &FsFileDropper::new(&data))?;
    assert_eq!(report.replay.records, 0);
    assert!(report.finalize.dropped_xids.is_empty());
    assert!(relation_exists(&data, &handle));
    Ok(())
}

#[test]
fn repeated_checkpoints_collapse_to_one_drop() -> Result<()> {
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(2, 16);
    let handle = RelFileNodePendingDelete::new(1663, 5, 20003);
    create_relation(&data, &handle, 0);

    {
        let wal = open_wal(&wal_path)?;
        let registry = Registry::new(&config)?;
        let backend = registry.attach(BackendId(0))?;
        backend.add(handle, Xid(800))?;
        checkpoint(&registry, &wal)?;
        checkpoint(&registry, &wal)?;
        std::mem::forget(backend);
    }

    let wal = open_wal(&wal_path)?;
    let ledger = StatusLedger::new(Xid(3));
    let report = recover(&wal, &config, &ledger, &FsFileDropper::new(&data))?;
    assert_eq!(report.replay.snapshots, 2);
    assert_eq!(report.replay.checkpoints, 2);
    assert_eq!(report.finalize.duplicates_collapsed, 1);
    assert_eq!(report.finalize.files_dropped, 1);
    assert!(!relation_exists(&data, &handle));
    Ok(())
}

#[test]
fn stale_snapshot_entries_are_kept_after_horizon_moves() -> Result<()> {
    let dir = tempdir().unwrap();
    let data = dir.path().join("base");
    let wal_path = dir.path().join("pendel.wal");
    let config = PendelConfig::compact(2, 16);
    let old = RelFileNodePendingDelete::new(1663, 5, 20004);
    create_relation(&data, &old, 0);

    {
        let wal = open_wal(&wal_path)?;
        let registry = Registry::new(&config)?;
        let backend = registry.attach(BackendId(0))?;
        backend.add(old, Xid(900))?;
        checkpoint(&registry, &wal)?;
        std::mem::forget(backend);
    }

    let wal = open_wal(&wal_path)?;
    let ledger = StatusLedger::new(Xid(950));
    let report = recover(&wal, &config, &ledger, &FsFileDropper::new(&data))?;
    assert_eq!(report.replay.skipped_horizon, 1);
    assert!(report.finalize.dropped_xids.is_empty());
    assert!(relation_exists(&data, &old));
    Ok(())
}
