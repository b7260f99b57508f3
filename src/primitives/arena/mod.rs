#![forbid(unsafe_code)]

//! Fixed-capacity node arena addressed by position-independent handles.
//!
//! The pool is sized once at startup and never grows. Every slot carries its
//! own small lock so that readers and writers holding a list-level lock can
//! touch nodes without sharing raw pointers; the free list is guarded by the
//! arena's internal lock, which is the only contention point between backends
//! that allocate at the same time.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// Handle to a slot in a [`ShmemArena`].
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct ArenaPtr(u32);

impl ArenaPtr {
    /// Handle that never refers to a slot.
    pub const INVALID: ArenaPtr = ArenaPtr(u32::MAX);

    /// Returns `true` unless this is [`ArenaPtr::INVALID`].
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }

    /// Returns the raw slot index.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Rebuilds a handle from its raw representation.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl Default for ArenaPtr {
    fn default() -> Self {
        Self::INVALID
    }
}

impl fmt::Debug for ArenaPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "ArenaPtr({})", self.0)
        } else {
            f.write_str("ArenaPtr(INVALID)")
        }
    }
}

/// Fixed pool of `T` slots with an internal free list.
pub struct ShmemArena<T> {
    slots: Box<[Mutex<Option<T>>]>,
    free: Mutex<Vec<u32>>,
    in_use: AtomicUsize,
}

impl<T> ShmemArena<T> {
    /// Creates an arena able to hold `capacity` values.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.min(u32::MAX as usize - 1);
        let slots = (0..capacity).map(|_| Mutex::new(None)).collect();
        // Reverse order so that allocation hands out low indices first.
        let free = (0..capacity as u32).rev().collect();
        Self {
            slots,
            free: Mutex::new(free),
            in_use: AtomicUsize::new(0),
        }
    }

    /// Bytes reserved by an arena of `capacity` slots.
    pub fn bytes_for(capacity: usize) -> usize {
        capacity
            .saturating_mul(mem::size_of::<Mutex<Option<T>>>() + mem::size_of::<u32>())
            .saturating_add(mem::size_of::<Self>())
    }

    /// Total slot count.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Slots currently allocated.
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    /// Stores `value` in a free slot, or returns `None` when the pool is full.
    pub fn allocate(&self, value: T) -> Option<ArenaPtr> {
        let index = self.free.lock().pop()?;
        *self.slots[index as usize].lock() = Some(value);
        self.in_use.fetch_add(1, Ordering::AcqRel);
        Some(ArenaPtr(index))
    }

    /// Releases a slot and returns its value. Unknown or already free handles
    /// yield `None` and leave the free list untouched.
    pub fn free(&self, ptr: ArenaPtr) -> Option<T> {
        let slot = self.slots.get(ptr.0 as usize)?;
        let value = slot.lock().take()?;
        self.free.lock().push(ptr.0);
        self.in_use.fetch_sub(1, Ordering::AcqRel);
        Some(value)
    }

    /// Runs `f` against the value stored at `ptr`.
    pub fn with<R>(&self, ptr: ArenaPtr, f: impl FnOnce(&T) -> R) -> Option<R> {
        let slot = self.slots.get(ptr.0 as usize)?;
        let guard = slot.lock();
        guard.as_ref().map(f)
    }

    /// Runs `f` against the value stored at `ptr`, allowing mutation.
    pub fn with_mut<R>(&self, ptr: ArenaPtr, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let slot = self.slots.get(ptr.0 as usize)?;
        let mut guard = slot.lock();
        guard.as_mut().map(f)
    }
}

impl<T: Copy> ShmemArena<T> {
    /// Copies the value stored at `ptr`.
    pub fn get(&self, ptr: ArenaPtr) -> Option<T> {
        self.with(ptr, |value| *value)
    }
}

impl<T> fmt::Debug for ShmemArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShmemArena")
            .field("capacity", &self.capacity())
            .field("in_use", &self.in_use())
            .finish()
    }
}
