#![forbid(unsafe_code)]

//! Relation file removal.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::types::{PendelError, RelFileNodePendingDelete, Result};

/// Removes the physical files of relations.
pub trait FileDropper {
    /// Unlinks every file belonging to `handles`.
    ///
    /// `is_redo` is set when called from crash recovery, where files that are
    /// already gone are expected and tolerated.
    fn drop_files(&self, handles: &[RelFileNodePendingDelete], is_redo: bool) -> Result<()>;
}

/// [`FileDropper`] over a directory tree laid out as `<root>/<spc>/<db>/<rel>`.
///
/// Large relations are split into segment files `<rel>.1`, `<rel>.2`, ...;
/// temporary relations use the name `t_<rel>`.
#[derive(Debug, Clone)]
pub struct FsFileDropper {
    root: PathBuf,
}

impl FsFileDropper {
    /// Creates a dropper rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Data directory root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the first segment of `handle`.
    pub fn relation_path(&self, handle: &RelFileNodePendingDelete) -> PathBuf {
        let node = handle.node;
        let name = if handle.is_temp {
            format!("t_{}", node.rel)
        } else {
            node.rel.to_string()
        };
        self.root
            .join(node.spc.to_string())
            .join(node.db.to_string())
            .join(name)
    }

    fn unlink_relation(&self, handle: &RelFileNodePendingDelete, is_redo: bool) -> Result<usize> {
        let base = self.relation_path(handle);
        let mut removed = 0usize;
        match fs::remove_file(&base) {
            Ok(()) => removed += 1,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                if !is_redo {
                    debug!(path = %base.display(), "smgr.unlink.missing");
                }
            }
            Err(err) => return Err(PendelError::Io(err)),
        }
        let mut segment = 1u32;
        loop {
            let mut name = base.clone().into_os_string();
            name.push(format!(".{segment}"));
            match fs::remove_file(PathBuf::from(name)) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) => return Err(PendelError::Io(err)),
            }
            segment += 1;
        }
        Ok(removed)
    }
}

impl FileDropper for FsFileDropper {
    /// Every handle is attempted; the first failure is returned once the
    /// rest have been processed.
    fn drop_files(&self, handles: &[RelFileNodePendingDelete], is_redo: bool) -> Result<()> {
        let mut first_err = None;
        for handle in handles {
            match self.unlink_relation(handle, is_redo) {
                Ok(removed) => debug!(
                    spc = handle.node.spc,
                    db = handle.node.db,
                    rel = handle.node.rel,
                    temp = handle.is_temp,
                    files = removed,
                    "smgr.unlink"
                ),
                Err(err) => {
                    warn!(relation = %handle, error = %err, "smgr.unlink_failed");
                    first_err.get_or_insert(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
