//! Shared, per-backend lists of files created by unfinished transactions.
//!
//! Each backend slot owns one doubly linked list threaded through a shared
//! [`ShmemArena`]. Only the owning backend links and unlinks nodes, under the
//! list's exclusive lock; [`Registry::dump`] walks every list under its shared
//! lock, one list at a time.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::PendelConfig;
use crate::primitives::arena::{ArenaPtr, ShmemArena};
use crate::storage::pending::dump::PendingRelXactDeleteArray;
use crate::types::{
    BackendId, PendelError, PendingRelXactDelete, RelFileNodePendingDelete, Result, Xid,
};

#[derive(Copy, Clone, Debug)]
struct ListNode {
    entry: PendingRelXactDelete,
    owner: BackendId,
    serial: u64,
    prev: ArenaPtr,
    next: ArenaPtr,
}

/// Handle returned by [`Backend::add`], needed to remove the entry again.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct PendingToken {
    ptr: ArenaPtr,
    serial: u64,
}

impl PendingToken {
    /// Token returned when nothing was registered.
    pub const INVALID: PendingToken = PendingToken {
        ptr: ArenaPtr::INVALID,
        serial: 0,
    };

    /// Returns `true` if the token refers to a registered entry.
    pub fn is_valid(&self) -> bool {
        self.ptr.is_valid()
    }
}

impl Default for PendingToken {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Registry of pending deletes shared by all backends.
#[derive(Debug)]
pub struct Registry {
    enabled: bool,
    dump_initial_entries: usize,
    heads: Box<[RwLock<ArenaPtr>]>,
    attached: Box<[AtomicBool]>,
    arena: ShmemArena<ListNode>,
    next_serial: AtomicU64,
}

impl Registry {
    /// Builds the registry for `config`.
    ///
    /// With tracking disabled no lists or arena are allocated and every entry
    /// point becomes a no-op.
    pub fn new(config: &PendelConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let enabled = config.tracking_enabled();
        let (lists, nodes) = if enabled {
            (config.max_backends, config.arena_nodes)
        } else {
            (0, 0)
        };
        let registry = Self {
            enabled,
            dump_initial_entries: config.dump_initial_entries,
            heads: (0..lists).map(|_| RwLock::new(ArenaPtr::INVALID)).collect(),
            attached: (0..config.max_backends)
                .map(|_| AtomicBool::new(false))
                .collect(),
            arena: ShmemArena::with_capacity(nodes),
            next_serial: AtomicU64::new(1),
        };
        debug!(
            enabled,
            backends = config.max_backends,
            arena_nodes = nodes,
            "pending.registry.init"
        );
        Ok(Arc::new(registry))
    }

    /// Shared memory to reserve at startup for `config`; zero when the
    /// subsystem is switched off.
    pub fn shmem_size(config: &PendelConfig) -> usize {
        if !config.track_pending_deletes {
            return 0;
        }
        let lists = config
            .max_backends
            .saturating_mul(std::mem::size_of::<RwLock<ArenaPtr>>());
        lists.saturating_add(ShmemArena::<ListNode>::bytes_for(config.arena_nodes))
    }

    /// Returns `true` when entry points do any work.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Attaches the calling process to its backend slot.
    ///
    /// A slot can be attached by one handle at a time; dropping the handle
    /// runs the shutdown check and releases the slot.
    pub fn attach(self: &Arc<Self>, id: BackendId) -> Result<Backend> {
        let flag = self
            .attached
            .get(id.0 as usize)
            .ok_or(PendelError::Invalid("backend id out of range"))?;
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(PendelError::InvalidOwned(format!(
                "backend {id} already attached"
            )));
        }
        debug!(backend = id.0, "pending.registry.attach");
        Ok(Backend {
            registry: Arc::clone(self),
            slot: Some(id),
        })
    }

    /// Attaches a process that has no backend slot, such as the
    /// checkpointer. Its `add` and `remove` calls are no-ops.
    pub fn attach_auxiliary(self: &Arc<Self>) -> Backend {
        Backend {
            registry: Arc::clone(self),
            slot: None,
        }
    }

    /// Copies every registered entry of every backend into one array.
    ///
    /// Returns `None` when tracking is off or no entry exists.
    pub fn dump(&self) -> Result<Option<PendingRelXactDeleteArray>> {
        if !self.enabled {
            return Ok(None);
        }
        let mut out = PendingRelXactDeleteArray::with_growth_step(self.dump_initial_entries);
        for head in self.heads.iter() {
            let head = head.read();
            let mut cursor = *head;
            while cursor.is_valid() {
                let Some(node) = self.arena.get(cursor) else {
                    break;
                };
                out.push(node.entry)?;
                cursor = node.next;
            }
        }
        debug!(count = out.len(), "pending.registry.dump");
        if out.is_empty() {
            Ok(None)
        } else {
            Ok(Some(out))
        }
    }

    /// Nodes currently allocated from the arena.
    pub fn nodes_in_use(&self) -> usize {
        self.arena.in_use()
    }

    /// Node capacity of the arena.
    pub fn node_capacity(&self) -> usize {
        self.arena.capacity()
    }

    fn list_len(&self, slot: BackendId) -> usize {
        let Some(head) = self.heads.get(slot.0 as usize) else {
            return 0;
        };
        let head = head.read();
        let mut cursor = *head;
        let mut len = 0;
        while let Some(node) = self.arena.get(cursor) {
            len += 1;
            cursor = node.next;
        }
        len
    }

    fn add(
        &self,
        slot: BackendId,
        relnode: RelFileNodePendingDelete,
        xid: Xid,
    ) -> Result<PendingToken> {
        let serial = self.next_serial.fetch_add(1, Ordering::Relaxed);
        let node = ListNode {
            entry: PendingRelXactDelete::new(relnode, xid),
            owner: slot,
            serial,
            prev: ArenaPtr::INVALID,
            next: ArenaPtr::INVALID,
        };
        let ptr = self
            .arena
            .allocate(node)
            .ok_or(PendelError::OutOfMemory {
                backend: slot,
                capacity: self.arena.capacity(),
            })?;

        let mut head = self.heads[slot.0 as usize].write();
        let old = *head;
        self.arena.with_mut(ptr, |n| n.next = old);
        if old.is_valid() {
            self.arena.with_mut(old, |n| n.prev = ptr);
        }
        *head = ptr;
        drop(head);

        debug!(
            backend = slot.0,
            xid = xid.0,
            spc = relnode.node.spc,
            db = relnode.node.db,
            rel = relnode.node.rel,
            "pending.registry.add"
        );
        Ok(PendingToken { ptr, serial })
    }

    fn remove(&self, slot: BackendId, token: PendingToken) {
        let mut head = self.heads[slot.0 as usize].write();
        let node = match self.arena.get(token.ptr) {
            Some(node) if node.serial == token.serial && node.owner == slot => node,
            _ => {
                drop(head);
                warn!(backend = slot.0, token = ?token, "pending.registry.remove_stale");
                return;
            }
        };
        if node.next.is_valid() {
            self.arena.with_mut(node.next, |n| n.prev = node.prev);
        }
        if node.prev.is_valid() {
            self.arena.with_mut(node.prev, |n| n.next = node.next);
        } else {
            *head = node.next;
        }
        drop(head);
        self.arena.free(token.ptr);
        debug!(backend = slot.0, xid = node.entry.xid.0, "pending.registry.remove");
    }

    /// Empties the list of `slot`, returning how many entries it held.
    fn clear(&self, slot: BackendId) -> usize {
        let Some(head) = self.heads.get(slot.0 as usize) else {
            return 0;
        };
        let mut head = head.write();
        let mut cursor = std::mem::replace(&mut *head, ArenaPtr::INVALID);
        drop(head);
        let mut freed = 0;
        while let Some(node) = self.arena.free(cursor) {
            freed += 1;
            cursor = node.next;
        }
        freed
    }

    /// Shutdown path of a backend slot: empties its list and releases the
    /// slot for the next attach. Returns how many entries were still listed.
    fn detach(&self, slot: BackendId) -> usize {
        let leaked = if self.enabled { self.clear(slot) } else { 0 };
        if let Some(flag) = self.attached.get(slot.0 as usize) {
            flag.store(false, Ordering::Release);
        }
        leaked
    }
}

/// A process's attachment to the registry.
///
/// Dropping the handle is the process shutdown hook.
#[derive(Debug)]
pub struct Backend {
    registry: Arc<Registry>,
    slot: Option<BackendId>,
}

impl Backend {
    /// Backend slot of this process, if it has one.
    pub fn id(&self) -> Option<BackendId> {
        self.slot
    }

    /// Registry this handle is attached to.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Records that `relnode` was created by `xid`.
    ///
    /// Returns [`PendingToken::INVALID`] without registering anything when
    /// tracking is off, `xid` is invalid or the process has no backend slot.
    /// Fails with [`PendelError::OutOfMemory`] when the arena is exhausted.
    pub fn add(&self, relnode: RelFileNodePendingDelete, xid: Xid) -> Result<PendingToken> {
        match self.slot {
            Some(slot) if self.registry.enabled && xid.is_valid() => {
                self.registry.add(slot, relnode, xid)
            }
            _ => Ok(PendingToken::INVALID),
        }
    }

    /// Forgets an entry registered by [`Backend::add`].
    pub fn remove(&self, token: PendingToken) {
        if !token.is_valid() || !self.registry.enabled {
            return;
        }
        if let Some(slot) = self.slot {
            self.registry.remove(slot, token);
        }
    }

    /// Number of entries in this process's own list.
    pub fn pending_len(&self) -> usize {
        match self.slot {
            Some(slot) if self.registry.enabled => self.registry.list_len(slot),
            _ => 0,
        }
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        let Some(slot) = self.slot else {
            return;
        };
        let leaked = self.registry.detach(slot);
        if leaked > 0 {
            warn!(
                backend = slot.0,
                pid = std::process::id(),
                entries = leaked,
                "pending.registry.shutdown_not_empty"
            );
            if !std::thread::panicking() {
                debug_assert!(leaked == 0, "pending deletes list is not empty");
            }
        }
    }
}
