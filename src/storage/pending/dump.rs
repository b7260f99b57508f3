//! Flat snapshot of the registry and its persisted byte layout.
//!
//! ```text
//! count: u64
//! count x { spc: u32 | db: u32 | rel: u32 | temp: u8 | pad: [u8; 3] | xid: u32 }
//! ```
//!
//! All integers are big-endian.

use crate::types::{
    PendelError, PendingRelXactDelete, RelFileNode, RelFileNodePendingDelete, Result, Xid,
};

/// Encoded size of the leading entry count.
pub const COUNT_LEN: usize = 8;
/// Encoded size of one entry.
pub const ENTRY_LEN: usize = 20;

/// Contiguous list of pending-delete entries, the only persisted form of the
/// registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRelXactDeleteArray {
    entries: Vec<PendingRelXactDelete>,
    step: usize,
}

impl PendingRelXactDeleteArray {
    /// Creates an empty array whose first growth reserves `initial_step`
    /// entries. Every later growth doubles the step and adds it.
    pub fn with_growth_step(initial_step: usize) -> Self {
        Self {
            entries: Vec::new(),
            step: initial_step.max(1),
        }
    }

    /// Wraps already collected entries.
    pub fn from_entries(entries: Vec<PendingRelXactDelete>) -> Self {
        let step = entries.len().max(1);
        Self { entries, step }
    }

    /// Appends one entry, growing the buffer when full.
    pub fn push(&mut self, entry: PendingRelXactDelete) -> Result<()> {
        if self.entries.len() == self.entries.capacity() {
            self.grow()?;
        }
        self.entries.push(entry);
        Ok(())
    }

    fn grow(&mut self) -> Result<()> {
        let additional = if self.entries.capacity() == 0 {
            self.step
        } else {
            self.step = self.step.saturating_mul(2);
            self.step
        };
        let entries = self.entries.capacity().saturating_add(additional);
        self.entries
            .try_reserve_exact(additional)
            .map_err(|_| PendelError::BufferExhausted { entries })
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the array holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reserved entry capacity.
    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    /// Entries in collection order.
    pub fn entries(&self) -> &[PendingRelXactDelete] {
        &self.entries
    }

    /// Iterates over the entries.
    pub fn iter(&self) -> std::slice::Iter<'_, PendingRelXactDelete> {
        self.entries.iter()
    }

    /// Number of bytes [`encode`](Self::encode) produces for `count` entries.
    pub fn encoded_len(count: usize) -> usize {
        COUNT_LEN + count * ENTRY_LEN
    }

    /// Serializes the array into its persisted layout.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::encoded_len(self.entries.len()));
        buf.extend_from_slice(&(self.entries.len() as u64).to_be_bytes());
        for entry in &self.entries {
            let node = entry.relnode.node;
            buf.extend_from_slice(&node.spc.to_be_bytes());
            buf.extend_from_slice(&node.db.to_be_bytes());
            buf.extend_from_slice(&node.rel.to_be_bytes());
            buf.push(u8::from(entry.relnode.is_temp));
            buf.extend_from_slice(&[0u8; 3]);
            buf.extend_from_slice(&entry.xid.0.to_be_bytes());
        }
        buf
    }

    /// Parses a persisted array, rejecting any length or flag mismatch.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < COUNT_LEN {
            return Err(PendelError::Corruption("pending delete record truncated"));
        }
        let count = u64::from_be_bytes(src[0..COUNT_LEN].try_into().unwrap());
        let body = &src[COUNT_LEN..];
        let expected = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(ENTRY_LEN));
        if expected != Some(body.len()) {
            return Err(PendelError::Corruption(
                "pending delete record length mismatch",
            ));
        }
        let mut entries = Vec::with_capacity(body.len() / ENTRY_LEN);
        for chunk in body.chunks_exact(ENTRY_LEN) {
            let is_temp = match chunk[12] {
                0 => false,
                1 => true,
                _ => return Err(PendelError::Corruption("pending delete temp flag invalid")),
            };
            if chunk[13..16] != [0, 0, 0] {
                return Err(PendelError::Corruption(
                    "pending delete padding non-zero",
                ));
            }
            let node = RelFileNode::new(
                u32::from_be_bytes(chunk[0..4].try_into().unwrap()),
                u32::from_be_bytes(chunk[4..8].try_into().unwrap()),
                u32::from_be_bytes(chunk[8..12].try_into().unwrap()),
            );
            let xid = Xid(u32::from_be_bytes(chunk[16..20].try_into().unwrap()));
            entries.push(PendingRelXactDelete::new(
                RelFileNodePendingDelete { node, is_temp },
                xid,
            ));
        }
        Ok(Self::from_entries(entries))
    }
}

impl<'a> IntoIterator for &'a PendingRelXactDeleteArray {
    type Item = &'a PendingRelXactDelete;
    type IntoIter = std::slice::Iter<'a, PendingRelXactDelete>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
