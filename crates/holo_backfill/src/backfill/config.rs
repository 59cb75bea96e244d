//! Tuning knobs shared by both protocol roles.

use std::{env, str::FromStr};

/// Default maximum number of entries in one transfer sub-piece.
const CHUNK_MAX_ENTRIES: usize = 512;
/// Default maximum payload bytes (keys plus values) in one transfer sub-piece.
const CHUNK_MAX_BYTES: usize = 1 << 20;
/// Default page size when reading a snapshot.
const READ_PAGE_LIMIT: usize = 256;
/// Default frame buffer between a session and its transport.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackfillConfig {
    /// Entries per sub-piece. A sub-piece is buffered whole by the backfillee
    /// before it is applied, so this bounds its memory.
    pub chunk_max_entries: usize,
    pub chunk_max_bytes: usize,
    pub read_page_limit: usize,
    pub channel_capacity: usize,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_max_entries: CHUNK_MAX_ENTRIES,
            chunk_max_bytes: CHUNK_MAX_BYTES,
            read_page_limit: READ_PAGE_LIMIT,
            channel_capacity: CHANNEL_CAPACITY,
        }
    }
}

impl BackfillConfig {
    /// Defaults overridden by `HOLO_BACKFILL_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            chunk_max_entries: read_env_usize("HOLO_BACKFILL_CHUNK_MAX_ENTRIES", CHUNK_MAX_ENTRIES),
            chunk_max_bytes: read_env_usize("HOLO_BACKFILL_CHUNK_MAX_BYTES", CHUNK_MAX_BYTES),
            read_page_limit: read_env_usize("HOLO_BACKFILL_READ_PAGE_LIMIT", READ_PAGE_LIMIT),
            channel_capacity: read_env_usize("HOLO_BACKFILL_CHANNEL_CAPACITY", CHANNEL_CAPACITY),
        }
        .sanitized()
    }

    /// Clamp every knob to at least one.
    pub fn sanitized(mut self) -> Self {
        self.chunk_max_entries = self.chunk_max_entries.max(1);
        self.chunk_max_bytes = self.chunk_max_bytes.max(1);
        self.read_page_limit = self.read_page_limit.max(1);
        self.channel_capacity = self.channel_capacity.max(1);
        self
    }
}

/// Read an env var as usize with a default.
fn read_env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| usize::from_str(&v).ok())
        .unwrap_or(default)
}
