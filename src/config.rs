//! Centralized configuration and builder for the paprika store.
//!
//! Goals:
//! - Single place to collect tunables instead of scattering env lookups.
//! - PaprikaConfig::from_env() reads PK_* variables; fluent setters override.
//! - Blockchain and PagedDb both consume the same config value.

use std::fmt;

use crate::consts::{MAX_HISTORY_DEPTH, MIN_HISTORY_DEPTH, PAGE_SIZE};

/// Top-level configuration (store + blockchain pipeline).
#[derive(Clone, Debug)]
pub struct PaprikaConfig {
    /// Arena size in bytes, rounded down to whole pages.
    /// Env: PK_ARENA_BYTES (default 256 MiB)
    pub arena_bytes: u64,

    /// Number of retained root pages (ring in the first pages of the arena).
    /// Lower bound on reorg capability, upper bound on reuse latency.
    /// Env: PK_HISTORY_DEPTH (default 2, clamped to 2..=32)
    pub history_depth: u32,

    /// Whether commits msync data pages (besides the root page policy).
    /// Env: PK_DATA_FSYNC (default true; "0|false|off|no" => false)
    pub data_fsync: bool,

    /// Byte budget of the per-batch merkle record cache (0 disables).
    /// Env: PK_CACHE_BUDGET_BYTES (default 4 MiB)
    pub cache_budget_bytes: usize,

    /// Depth of the pending-blocks queue; start_new blocks when full.
    /// Env: PK_PENDING_BLOCKS (default 64)
    pub max_pending_blocks: usize,

    /// Finalized blocks younger than this stay out of the paged store.
    /// Env: PK_REORG_WINDOW (default 0, must be <= history_depth)
    pub reorg_window: u32,
}

impl Default for PaprikaConfig {
    fn default() -> Self {
        Self {
            arena_bytes: 256 * 1024 * 1024,
            history_depth: MIN_HISTORY_DEPTH,
            data_fsync: true,
            cache_budget_bytes: 4 * 1024 * 1024,
            max_pending_blocks: 64,
            reorg_window: 0,
        }
    }
}

impl PaprikaConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("PK_ARENA_BYTES") {
            if let Ok(n) = v.trim().parse::<u64>() {
                cfg.arena_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("PK_HISTORY_DEPTH") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.history_depth = n;
            }
        }
        if let Ok(v) = std::env::var("PK_DATA_FSYNC") {
            let s = v.trim().to_ascii_lowercase();
            cfg.data_fsync = !(s == "0" || s == "false" || s == "off" || s == "no");
        }
        if let Ok(v) = std::env::var("PK_CACHE_BUDGET_BYTES") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.cache_budget_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("PK_PENDING_BLOCKS") {
            if let Ok(n) = v.trim().parse::<usize>() {
                cfg.max_pending_blocks = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("PK_REORG_WINDOW") {
            if let Ok(n) = v.trim().parse::<u32>() {
                cfg.reorg_window = n;
            }
        }

        cfg.normalize()
    }

    /// Clamp interdependent fields to their valid ranges.
    pub fn normalize(mut self) -> Self {
        self.history_depth = self.history_depth.clamp(MIN_HISTORY_DEPTH, MAX_HISTORY_DEPTH);
        self.reorg_window = self.reorg_window.min(self.history_depth);
        let min_bytes = (self.history_depth as u64 + 2) * PAGE_SIZE as u64;
        if self.arena_bytes < min_bytes {
            self.arena_bytes = min_bytes;
        }
        self
    }

    /// Fluent setters (builder-style) to override specific fields.

    pub fn with_arena_bytes(mut self, bytes: u64) -> Self {
        self.arena_bytes = bytes;
        self
    }

    pub fn with_history_depth(mut self, depth: u32) -> Self {
        self.history_depth = depth;
        self
    }

    pub fn with_data_fsync(mut self, on: bool) -> Self {
        self.data_fsync = on;
        self
    }

    pub fn with_cache_budget_bytes(mut self, bytes: usize) -> Self {
        self.cache_budget_bytes = bytes;
        self
    }

    pub fn with_max_pending_blocks(mut self, depth: usize) -> Self {
        self.max_pending_blocks = depth.max(1);
        self
    }

    pub fn with_reorg_window(mut self, window: u32) -> Self {
        self.reorg_window = window;
        self
    }
}

impl fmt::Display for PaprikaConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PaprikaConfig {{ arena_bytes: {}, history_depth: {}, data_fsync: {}, \
             cache_budget_bytes: {}, max_pending_blocks: {}, reorg_window: {} }}",
            self.arena_bytes,
            self.history_depth,
            self.data_fsync,
            self.cache_budget_bytes,
            self.max_pending_blocks,
            self.reorg_window
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_clamps() {
        let cfg = PaprikaConfig::default()
            .with_history_depth(1000)
            .with_reorg_window(1000)
            .normalize();
        assert_eq!(cfg.history_depth, MAX_HISTORY_DEPTH);
        assert_eq!(cfg.reorg_window, cfg.history_depth);
    }
}
