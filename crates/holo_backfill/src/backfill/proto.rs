//! Wire messages exchanged by the two protocol roles.
//!
//! Frames are plain serde types; the transport decides the encoding.

use serde::{Deserialize, Serialize};

use super::region_map::Metainfo;
use super::types::{Branch, BranchId, Entry, Region, SessionId, StateTimestamp};

/// Bumped whenever a frame changes shape.
pub const PROTOCOL_VERSION: u32 = 1;

/// Opening message of a session, sent by the backfillee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct BackfillRequest<R: Region> {
    pub session_id: SessionId,
    pub region: R,
    pub metainfo: Metainfo<R>,
    /// Branch records explaining `metainfo`, parents first.
    pub lineage: Vec<Branch<R>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum ToBackfiller<R: Region> {
    Request(BackfillRequest<R>),
    /// Best-effort notice that the backfillee gave up on the session.
    Cancel { session_id: SessionId },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Chunk<R: Region> {
    /// Lineage records a later `MetaChunk` may reference.
    Branches { branches: Vec<Branch<R>> },
    /// Stored keys in `sub_region` with `after < ts <= up_to` belong to a
    /// lineage the backfiller does not share and must go.
    DeleteRange {
        sub_region: R,
        after: StateTimestamp,
        up_to: StateTimestamp,
    },
    DataChunk {
        sub_region: R,
        entries: Vec<Entry<R::Key>>,
    },
    /// Closes `sub_region`: everything sent for it since the previous meta is
    /// now complete up to `timestamp` on `branch_id`.
    MetaChunk {
        sub_region: R,
        branch_id: BranchId,
        timestamp: StateTimestamp,
    },
    EndOfStream,
    Failed { reason: String },
    /// The backfiller is shutting down. Pieces already closed stay applied.
    Cancel,
}

impl<R: Region> Chunk<R> {
    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::Branches { .. } => "branches",
            Chunk::DeleteRange { .. } => "delete_range",
            Chunk::DataChunk { .. } => "data",
            Chunk::MetaChunk { .. } => "meta",
            Chunk::EndOfStream => "end_of_stream",
            Chunk::Failed { .. } => "failed",
            Chunk::Cancel => "cancel",
        }
    }
}

/// Sequenced chunk. `seq` starts at zero and grows by one per frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct ChunkFrame<R: Region> {
    pub seq: u64,
    pub chunk: Chunk<R>,
}
