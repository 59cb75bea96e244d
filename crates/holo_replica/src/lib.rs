//! Replica node hosting the backfill protocol.
//!
//! `store` persists data and metainfo in fjall, `branch_log` keeps the
//! branch history on disk, `transport` carries sessions over TCP and `node`
//! wires them into one process.

pub mod branch_log;
pub mod node;
pub mod store;
pub mod transport;

pub use node::{NodeConfig, NodeReport, ReplicaNode};
