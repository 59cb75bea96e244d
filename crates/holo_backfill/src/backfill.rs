//! Backfill module wiring.
//!
//! `types`, `region_map` and `history` model keys, metainfo and lineage;
//! `store`, `connector` and `discovery` are the collaborator seams; the two
//! roles live in `backfiller` and `backfillee`.

mod backfillee;
mod backfiller;
mod config;
mod connector;
mod discovery;
mod error;
mod history;
mod proto;
mod region_map;
mod session;
mod store;
mod types;

pub use backfillee::{BackfillSummary, BackfilleeOrchestrator};
pub use backfiller::{
    plan_transfer, Backfiller, ResponderSummary, TransferKind, TransferPiece, TransferPlan,
};
pub use config::BackfillConfig;
pub use connector::{connection_pair, Accepted, Connection, Connector, LocalNetwork};
pub use discovery::{BackfillerDescriptor, DescriptorPublisher, DescriptorWatch};
pub use error::{BackfillError, BoxError, HistoryError, StoreError};
pub use history::{BranchArena, BranchHistory, MemoryBranchHistory};
pub use proto::{BackfillRequest, Chunk, ChunkFrame, ToBackfiller, PROTOCOL_VERSION};
pub use region_map::{Metainfo, RegionMap};
pub use session::{
    BackfilleeState, BackfillerState, Role, SessionProgress, SessionRegistry, SessionState,
};
pub use store::{
    ApplyOutcome, ClearSpan, MemoryStoreView, RangeReader, StoreChunk, StoreSnapshot, StoreView,
    VecRangeReader,
};
pub use types::{
    Branch, BranchId, Entry, KeyRange, Region, SessionId, StateTimestamp, TimestampInterval,
    Version,
};
