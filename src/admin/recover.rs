use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::admin::{AdminError, Result};
use crate::config::PendelConfig;
use crate::primitives::io::{FileIo, StdFileIo};
use crate::primitives::wal::{Wal, WalIterator, WalOptions};
use crate::storage::recovery::{recover, RecoveryReport};
use crate::storage::smgr::FsFileDropper;
use crate::storage::xact::StatusLedger;
use crate::types::Xid;

/// Inputs for an offline recovery run.
#[derive(Debug, Clone)]
pub struct RecoverOptions {
    /// Directory holding relation files as `<spc>/<db>/<rel>`.
    pub data_dir: PathBuf,
    /// Freeze horizon to recover with.
    pub oldest_xid: Xid,
    /// Transactions known to have committed.
    pub committed: Vec<Xid>,
    /// Transactions known to have aborted.
    pub aborted: Vec<Xid>,
    /// Tracking configuration.
    pub config: PendelConfig,
}

impl RecoverOptions {
    /// Options with the default horizon, no known outcomes and the default
    /// configuration.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            oldest_xid: Xid::FIRST_NORMAL,
            committed: Vec::new(),
            aborted: Vec::new(),
            config: PendelConfig::default(),
        }
    }

    fn ledger(&self) -> StatusLedger {
        let ledger = StatusLedger::new(self.oldest_xid);
        for xid in &self.committed {
            ledger.commit(*xid, &[]);
        }
        for xid in &self.aborted {
            ledger.abort(*xid, &[]);
        }
        ledger
    }
}

/// Replays the log at `wal_path` and removes orphaned relation files under
/// `opts.data_dir`.
///
/// The log is opened read-write, so a torn tail is truncated exactly as it
/// would be at engine startup.
///
/// # Errors
///
/// Returns an error if the log or data directory is missing, the log header
/// is invalid, or a record fails to decode.
pub fn recover_data_dir(wal_path: impl AsRef<Path>, opts: &RecoverOptions) -> Result<RecoveryReport> {
    let wal_path = wal_path.as_ref();
    if !wal_path.exists() {
        return Err(AdminError::missing_log(wal_path));
    }
    if !opts.data_dir.is_dir() {
        return Err(AdminError::missing_data_dir(&opts.data_dir));
    }
    opts.config.validate()?;

    let probe: Arc<dyn FileIo> = Arc::new(StdFileIo::open_read_only(wal_path)?);
    let header = WalIterator::open(probe)?;
    let wal = Wal::open(
        Arc::new(StdFileIo::open(wal_path)?),
        WalOptions::new(header.wal_salt(), header.start_lsn()),
    )?;
    let ledger = opts.ledger();
    let dropper = FsFileDropper::new(&opts.data_dir);
    Ok(recover(&wal, &opts.config, &ledger, &dropper)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::wal::{RecordKind, RecordLog};
    use crate::storage::pending::PendingRelXactDeleteArray;
    use crate::types::{Lsn, PendingRelXactDelete, RelFileNodePendingDelete};
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn committed_flag_protects_files() -> Result<()> {
        let dir = tempdir()?;
        let data = dir.path().join("data");
        let rel_dir = data.join("1663").join("5");
        fs::create_dir_all(&rel_dir)?;
        fs::write(rel_dir.join("100"), b"orphan")?;
        fs::write(rel_dir.join("200"), b"kept")?;

        let wal_path = dir.path().join("pendel.wal");
        let wal = Wal::open(
            Arc::new(StdFileIo::open(&wal_path)?),
            WalOptions::new(3, Lsn(1)),
        )?;
        let snapshot = PendingRelXactDeleteArray::from_entries(vec![
            PendingRelXactDelete::new(RelFileNodePendingDelete::new(1663, 5, 100), Xid(10)),
            PendingRelXactDelete::new(RelFileNodePendingDelete::new(1663, 5, 200), Xid(20)),
        ]);
        let lsn = wal.insert(RecordKind::PendingDelete, &snapshot.encode())?;
        wal.flush(lsn)?;
        drop(wal);

        let mut opts = RecoverOptions::new(&data);
        opts.committed.push(Xid(20));
        let report = recover_data_dir(&wal_path, &opts)?;
        assert_eq!(report.finalize.dropped_xids, vec![Xid(10)]);
        assert!(!rel_dir.join("100").exists());
        assert!(rel_dir.join("200").exists());
        Ok(())
    }

    #[test]
    fn missing_data_dir_is_reported() -> Result<()> {
        let dir = tempdir()?;
        let wal_path = dir.path().join("pendel.wal");
        Wal::open(
            Arc::new(StdFileIo::open(&wal_path)?),
            WalOptions::default(),
        )?;
        let err = recover_data_dir(&wal_path, &RecoverOptions::new(dir.path().join("nope")))
            .unwrap_err();
        assert!(matches!(err, AdminError::MissingDataDir(_)));
        Ok(())
    }
}
