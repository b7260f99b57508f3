//! Low-level building blocks: the shared node arena, positioned file I/O and
//! the record log.

/// Fixed-capacity node arena with position-independent handles.
pub mod arena;

/// I/O abstractions and utilities.
///
/// Interfaces for positioned reads and writes against log files.
pub mod io;

/// Write-ahead record log.
///
/// Durable, checksummed, ordered storage for typed records.
pub mod wal;
