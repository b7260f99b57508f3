//! Writing registry snapshots to the record log at checkpoint time.

use tracing::debug;

use crate::primitives::wal::{RecordKind, RecordLog};
use crate::storage::pending::registry::Registry;
use crate::types::{Lsn, Result};

/// Writes the current registry contents as one flushed log record.
///
/// Nothing is written when the registry is empty. Returns the position of
/// the record otherwise.
pub fn persist_snapshot(registry: &Registry, log: &dyn RecordLog) -> Result<Option<Lsn>> {
    let Some(snapshot) = registry.dump()? else {
        debug!("pending.xlog.skip_empty");
        return Ok(None);
    };
    let payload = snapshot.encode();
    let lsn = log.insert(RecordKind::PendingDelete, &payload)?;
    log.flush(lsn)?;
    debug!(
        lsn = lsn.0,
        count = snapshot.len(),
        bytes = payload.len(),
        "pending.xlog.insert"
    );
    Ok(Some(lsn))
}
