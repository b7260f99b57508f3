//! Runtime configuration for pending-delete tracking.

use std::fs;
use std::path::Path;

use serde::Deserialize;

use crate::types::{PendelError, Result};

/// Settings that control whether and how pending deletes are tracked.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PendelConfig {
    /// Administrative switch for the whole subsystem.
    pub track_pending_deletes: bool,
    /// Bootstrap processing mode; tracking is always off while set.
    pub bootstrap: bool,
    /// Number of backend slots, one registry list each.
    pub max_backends: usize,
    /// Node capacity of the shared arena.
    pub arena_nodes: usize,
    /// Entries reserved by the first growth step of a dump buffer.
    pub dump_initial_entries: usize,
}

impl Default for PendelConfig {
    fn default() -> Self {
        Self {
            track_pending_deletes: true,
            bootstrap: false,
            max_backends: 128,
            arena_nodes: 8192,
            dump_initial_entries: 32,
        }
    }
}

impl PendelConfig {
    /// Configuration with tracking switched off.
    pub fn disabled() -> Self {
        Self {
            track_pending_deletes: false,
            ..Self::default()
        }
    }

    /// Small footprint used by tests and tools.
    pub fn compact(max_backends: usize, arena_nodes: usize) -> Self {
        Self {
            max_backends,
            arena_nodes,
            ..Self::default()
        }
    }

    /// Returns `true` when entry points should do any work.
    pub fn tracking_enabled(&self) -> bool {
        self.track_pending_deletes && !self.bootstrap
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(src: &str) -> Result<Self> {
        let config: Self = toml::from_str(src).map_err(|err| PendelError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = fs::read_to_string(path)
            .map_err(|err| PendelError::Config(format!("{}: {err}", path.display())))?;
        Self::from_toml_str(&src)
    }

    /// Rejects settings the registry cannot be built with.
    pub fn validate(&self) -> Result<()> {
        if self.max_backends == 0 {
            return Err(PendelError::Config("max_backends must be non-zero".into()));
        }
        if self.max_backends > u32::MAX as usize {
            return Err(PendelError::Config("max_backends exceeds u32 range".into()));
        }
        if self.arena_nodes == 0 {
            return Err(PendelError::Config("arena_nodes must be non-zero".into()));
        }
        if self.arena_nodes >= u32::MAX as usize {
            return Err(PendelError::Config("arena_nodes exceeds u32 range".into()));
        }
        if self.dump_initial_entries == 0 {
            return Err(PendelError::Config(
                "dump_initial_entries must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
