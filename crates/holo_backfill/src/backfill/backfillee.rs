//! Backfillee: the requesting side of a session.
//!
//! The orchestrator resolves a backfiller, negotiates with its current
//! metainfo and then applies the chunk stream one sub-piece at a time. Chunks
//! for the open sub-piece are buffered and handed to the store together with
//! the closing meta, so the store never sees data without its metainfo.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::connector::{Connection, Connector};
use super::discovery::DescriptorWatch;
use super::error::{BackfillError, StoreError};
use super::history::BranchHistory;
use super::proto::{BackfillRequest, Chunk, ChunkFrame, ToBackfiller};
use super::region_map::Metainfo;
use super::session::{BackfilleeState, Role, SessionRegistry, SessionState};
use super::store::{ClearSpan, StoreChunk, StoreView};
use super::types::{BranchId, Entry, Region, SessionId, Version};

/// Counters reported by a finalized session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub sub_pieces: usize,
    pub data_chunks: usize,
    pub entries_written: usize,
    pub entries_skipped: usize,
    pub deleted: usize,
    pub metainfo_refused: usize,
    pub branches_imported: usize,
}

/// The sub-piece currently being received.
struct OpenPiece<R: Region> {
    sub_region: R,
    clear: Option<ClearSpan>,
    entries: Vec<Entry<R::Key>>,
}

/// Per-session receive state.
struct Inbound<R: Region> {
    session_id: SessionId,
    region: R,
    negotiated: Metainfo<R>,
    next_seq: u64,
    open: Option<OpenPiece<R>>,
    finalized: Vec<R>,
    summary: BackfillSummary,
}

impl<R: Region> Inbound<R> {
    fn check_seq(&mut self, frame: &ChunkFrame<R>) -> Result<(), BackfillError> {
        if frame.seq != self.next_seq {
            return Err(BackfillError::ChunkOrderViolation(format!(
                "expected frame {} but received {} ({})",
                self.next_seq,
                frame.seq,
                frame.chunk.kind()
            )));
        }
        self.next_seq += 1;
        Ok(())
    }

    fn check_bounds(&self, sub_region: &R) -> Result<(), BackfillError> {
        if sub_region.is_empty() || !self.region.is_superset(sub_region) {
            return Err(BackfillError::OutOfBoundsWrite(format!(
                "sub-region {sub_region} outside session region {}",
                self.region
            )));
        }
        Ok(())
    }

    /// Open a sub-piece, or continue the open one if it is for `sub_region`.
    fn open_piece(&mut self, sub_region: &R) -> Result<&mut OpenPiece<R>, BackfillError> {
        self.check_bounds(sub_region)?;
        if let Some(open) = &self.open {
            if open.sub_region != *sub_region {
                return Err(BackfillError::ChunkOrderViolation(format!(
                    "chunk for {sub_region} while {} is still open",
                    open.sub_region
                )));
            }
        } else {
            if let Some(done) = self.finalized.iter().find(|done| done.overlaps(sub_region)) {
                return Err(BackfillError::ChunkOrderViolation(format!(
                    "chunk for {sub_region} overlaps finalized {done}"
                )));
            }
            self.open = Some(OpenPiece {
                sub_region: sub_region.clone(),
                clear: None,
                entries: Vec::new(),
            });
        }
        self.open
            .as_mut()
            .ok_or_else(|| BackfillError::ChunkOrderViolation("no open sub-piece".into()))
    }

    /// Version the backfillee reported for `sub_region` during negotiation.
    fn base_version(&self, sub_region: &R) -> Result<Version, BackfillError> {
        let masked = self.negotiated.mask(sub_region);
        let mut versions = masked.iter().map(|(_, version)| *version);
        let first = versions.next();
        match first {
            Some(base) if versions.all(|version| version == base) => Ok(base),
            _ => Err(BackfillError::ChunkOrderViolation(format!(
                "{sub_region} does not lie inside one negotiated piece"
            ))),
        }
    }
}

pub struct BackfilleeOrchestrator<R: Region> {
    store: Arc<dyn StoreView<R>>,
    history: Arc<dyn BranchHistory<R>>,
    connector: Arc<dyn Connector<R>>,
    sessions: Arc<SessionRegistry<R>>,
}

impl<R: Region> BackfilleeOrchestrator<R> {
    pub fn new(
        store: Arc<dyn StoreView<R>>,
        history: Arc<dyn BranchHistory<R>>,
        connector: Arc<dyn Connector<R>>,
        sessions: Arc<SessionRegistry<R>>,
    ) -> Self {
        Self {
            store,
            history,
            connector,
            sessions,
        }
    }

    /// Backfill `region` from the backfiller published on `descriptors`.
    ///
    /// On `Interrupted` or `ResourceLost` every sub-piece applied so far stays
    /// valid and the rest of the region keeps its prior metainfo; retry with a
    /// fresh session id.
    pub async fn backfill(
        &self,
        session_id: SessionId,
        region: &R,
        descriptors: DescriptorWatch<R>,
        token: &CancellationToken,
    ) -> Result<BackfillSummary, BackfillError> {
        self.sessions.begin(
            session_id,
            region.clone(),
            SessionState::Backfillee(BackfilleeState::Init),
        )?;
        tracing::info!(session_id = %session_id, region = %region, "backfill starting");

        match self.run(session_id, region, descriptors, token).await {
            Ok(summary) => {
                self.sessions
                    .transition(session_id, SessionState::Backfillee(BackfilleeState::Finalized));
                tracing::info!(
                    session_id = %session_id,
                    sub_pieces = summary.sub_pieces,
                    written = summary.entries_written,
                    skipped = summary.entries_skipped,
                    deleted = summary.deleted,
                    "backfill finalized"
                );
                Ok(summary)
            }
            Err(err) => {
                self.sessions
                    .transition(session_id, SessionState::Backfillee(BackfilleeState::Aborted));
                if err.is_contract_violation() {
                    tracing::error!(session_id = %session_id, error = %err, "backfill aborted");
                } else {
                    tracing::warn!(session_id = %session_id, error = %err, "backfill aborted");
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        session_id: SessionId,
        region: &R,
        mut descriptors: DescriptorWatch<R>,
        token: &CancellationToken,
    ) -> Result<BackfillSummary, BackfillError> {
        if token.is_cancelled() {
            return Err(BackfillError::Interrupted);
        }
        let descriptor = descriptors.current().ok_or_else(|| {
            BackfillError::BackfillerUnavailable("no backfiller descriptor published".into())
        })?;
        if !descriptor.is_compatible() {
            return Err(BackfillError::BackfillerUnavailable(format!(
                "backfiller at {} speaks protocol {}",
                descriptor.address, descriptor.protocol_version
            )));
        }
        if !descriptor.region_hint.is_superset(region) {
            return Err(BackfillError::BackfillerUnavailable(format!(
                "backfiller at {} serves {}, not {region}",
                descriptor.address, descriptor.region_hint
            )));
        }

        let mut conn = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BackfillError::Interrupted),
            conn = self.connector.connect(&descriptor.address) => conn?,
        };

        self.sessions
            .transition(session_id, SessionState::Backfillee(BackfilleeState::Negotiating));
        let negotiated = self.store.snapshot_metainfo(region).await?;
        if !negotiated.covers(region) {
            return Err(BackfillError::OutOfBoundsWrite(format!(
                "{region} is not inside this replica's responsibility"
            )));
        }
        let ids: Vec<BranchId> = negotiated.iter().map(|(_, version)| version.branch).collect();
        let request = BackfillRequest {
            session_id,
            region: region.clone(),
            metainfo: negotiated.clone(),
            lineage: self.history.export_lineage(&ids)?,
        };
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BackfillError::Interrupted),
            sent = conn.tx.send(ToBackfiller::Request(request)) => {
                sent.map_err(|_| BackfillError::ResourceLost(format!("{} closed during negotiation", descriptor.address)))?;
            }
        }

        self.sessions
            .transition(session_id, SessionState::Backfillee(BackfilleeState::Streaming));
        let mut stream = Inbound {
            session_id,
            region: region.clone(),
            negotiated,
            next_seq: 0,
            open: None,
            finalized: Vec::new(),
            summary: BackfillSummary::default(),
        };

        loop {
            let frame = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    notify_cancel(&conn, session_id);
                    return Err(BackfillError::Interrupted);
                }
                changed = descriptors.changed() => {
                    match changed {
                        Some(next) if next.address == descriptor.address => continue,
                        Some(next) => {
                            notify_cancel(&conn, session_id);
                            return Err(BackfillError::ResourceLost(format!(
                                "backfiller moved from {} to {}",
                                descriptor.address, next.address
                            )));
                        }
                        None => {
                            notify_cancel(&conn, session_id);
                            return Err(BackfillError::ResourceLost(format!(
                                "backfiller descriptor for {} retracted",
                                descriptor.address
                            )));
                        }
                    }
                }
                frame = conn.rx.recv() => frame.ok_or_else(|| {
                    BackfillError::ResourceLost(format!("{} closed the stream", descriptor.address))
                })?,
            };
            stream.check_seq(&frame)?;
            if self.handle_chunk(&mut stream, frame.chunk).await? {
                break;
            }
        }
        Ok(stream.summary)
    }

    /// Process one chunk. Returns `true` at end of stream.
    async fn handle_chunk(
        &self,
        stream: &mut Inbound<R>,
        chunk: Chunk<R>,
    ) -> Result<bool, BackfillError> {
        match chunk {
            Chunk::Branches { branches } => {
                for branch in branches {
                    self.history.record_branch(branch)?;
                    stream.summary.branches_imported += 1;
                }
            }
            Chunk::DeleteRange {
                sub_region,
                after,
                up_to,
            } => {
                if stream.open.is_some() {
                    return Err(BackfillError::ChunkOrderViolation(format!(
                        "delete for {sub_region} inside an open sub-piece"
                    )));
                }
                let open = stream.open_piece(&sub_region)?;
                open.clear = Some(ClearSpan { after, up_to });
            }
            Chunk::DataChunk {
                sub_region,
                entries,
            } => {
                if let Some(entry) = entries.iter().find(|e| !sub_region.contains_key(&e.key)) {
                    return Err(BackfillError::OutOfBoundsWrite(format!(
                        "key {:?} outside {sub_region}",
                        entry.key
                    )));
                }
                let open = stream.open_piece(&sub_region)?;
                open.entries.extend(entries);
                stream.summary.data_chunks += 1;
            }
            Chunk::MetaChunk {
                sub_region,
                branch_id,
                timestamp,
            } => {
                self.apply_piece(stream, sub_region, Version::new(branch_id, timestamp))
                    .await?;
            }
            Chunk::EndOfStream => {
                if let Some(open) = &stream.open {
                    return Err(BackfillError::ChunkOrderViolation(format!(
                        "end of stream while {} is still open",
                        open.sub_region
                    )));
                }
                let metainfo = self.store.snapshot_metainfo(&stream.region).await?;
                if let Err(detail) = metainfo.validate_partition(&stream.region) {
                    return Err(BackfillError::Store(StoreError::Corrupt(format!(
                        "metainfo after backfill: {detail}"
                    ))));
                }
                self.sessions.set_total(
                    stream.session_id,
                    Role::Backfillee,
                    stream.summary.sub_pieces as u64,
                );
                return Ok(true);
            }
            Chunk::Failed { reason } => return Err(BackfillError::ResponderFailed(reason)),
            Chunk::Cancel => {
                return Err(BackfillError::ResourceLost(
                    "backfiller cancelled the session".into(),
                ))
            }
        }
        Ok(false)
    }

    /// Close the open sub-piece (or an empty one) and apply it atomically.
    /// The apply is not raced against cancellation.
    async fn apply_piece(
        &self,
        stream: &mut Inbound<R>,
        sub_region: R,
        version: Version,
    ) -> Result<(), BackfillError> {
        stream.open_piece(&sub_region)?;
        let open = stream
            .open
            .take()
            .ok_or_else(|| BackfillError::ChunkOrderViolation("no open sub-piece".into()))?;
        if let Some(newest) = open.entries.iter().map(|e| e.timestamp).max() {
            if newest > version.timestamp {
                return Err(BackfillError::TimestampBeyondMeta {
                    chunk: newest,
                    meta: version.timestamp,
                });
            }
        }
        if !self.history.contains(version.branch) {
            return Err(BackfillError::UnknownBranch(version.branch));
        }
        let base = stream.base_version(&sub_region)?;
        let chunk = StoreChunk {
            sub_region: sub_region.clone(),
            clear: open.clear,
            entries: open.entries,
            version,
            base,
        };
        let outcome = self.store.apply_chunk(&stream.region, chunk).await?;
        stream.summary.sub_pieces += 1;
        stream.summary.entries_written += outcome.written;
        stream.summary.entries_skipped += outcome.skipped_stale;
        stream.summary.deleted += outcome.deleted;
        stream.summary.metainfo_refused += outcome.metainfo_refused;
        if outcome.metainfo_refused > 0 {
            tracing::debug!(
                session_id = %stream.session_id,
                sub_region = %sub_region,
                refused = outcome.metainfo_refused,
                "newer local writes kept their metainfo"
            );
        }
        stream.finalized.push(sub_region);
        self.sessions.record_done(stream.session_id, Role::Backfillee);
        Ok(())
    }
}

fn notify_cancel<R: Region>(conn: &Connection<R>, session_id: SessionId) {
    if let Err(err) = conn.tx.try_send(ToBackfiller::Cancel { session_id }) {
        tracing::debug!(session_id = %session_id, error = %err, "cancel notice not delivered");
    }
}
