//! Backfill protocol crate.
//!
//! This crate moves authoritative data for a region from one replica to
//! another. Callers supply a `StoreView`, a `BranchHistory` and a
//! `Connector`, then run a `Backfiller` on the authoritative replica and a
//! `BackfilleeOrchestrator` on the catching-up one.

pub mod backfill;
