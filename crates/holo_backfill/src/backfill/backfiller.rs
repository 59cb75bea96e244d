//! Backfiller: the authoritative side of a session.
//!
//! One task per accepted connection walks `AwaitingRequest -> Diffing ->
//! Streaming -> Finished`. The diff is computed against a single store
//! snapshot, so every chunk of the session describes the same instant.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::config::BackfillConfig;
use super::connector::Accepted;
use super::error::BackfillError;
use super::history::BranchHistory;
use super::proto::{BackfillRequest, Chunk, ChunkFrame, ToBackfiller};
use super::region_map::Metainfo;
use super::session::{BackfillerState, Role, SessionRegistry, SessionState};
use super::store::{StoreSnapshot, StoreView};
use super::types::{Entry, Region, SessionId, StateTimestamp, Version};

const SHUTDOWN_NOTICE_GRACE: Duration = Duration::from_millis(500);

/// How a transfer piece relates to the peer's lineage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    /// The peer's version is an ancestor of ours: send keys newer than `since`.
    Forward { since: StateTimestamp },
    /// The lineages forked: clear the peer's writes after `common` (up to
    /// `peer`), then resend the whole piece, since the peer may have
    /// overwritten keys both lineages shared.
    Diverged { common: Version, peer: Version },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPiece<R: Region> {
    pub region: R,
    /// Our version for `region`; the piece's metas advance the peer to it.
    pub local: Version,
    pub kind: TransferKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TransferPlan<R: Region> {
    pub pieces: Vec<TransferPiece<R>>,
    /// Pieces where the peer is already current.
    pub skipped: usize,
}

/// Diff two metainfos over `region`.
///
/// Both maps must cover `region`. A peer version ahead of ours means the
/// lineage reversed, which no failover sequence can produce; the session is
/// aborted rather than risk rolling the peer back.
pub fn plan_transfer<R: Region>(
    history: &dyn BranchHistory<R>,
    region: &R,
    local: &Metainfo<R>,
    peer: &Metainfo<R>,
) -> Result<TransferPlan<R>, BackfillError> {
    if !local.covers(region) {
        return Err(BackfillError::ResponderFailed(format!(
            "local metainfo does not cover {region}"
        )));
    }
    if !peer.covers(region) {
        return Err(BackfillError::LineageAnomaly(format!(
            "peer metainfo does not cover {region}"
        )));
    }

    let local = local.mask(region);
    let peer = peer.mask(region);
    let mut plan = TransferPlan {
        pieces: Vec::new(),
        skipped: 0,
    };
    for (local_region, local_version) in local.iter() {
        for (peer_region, peer_version) in peer.iter() {
            let piece = local_region.intersection(peer_region);
            if piece.is_empty() {
                continue;
            }
            if local_version == peer_version {
                plan.skipped += 1;
                continue;
            }
            let kind = if history.version_is_ancestor(*peer_version, *local_version)? {
                TransferKind::Forward {
                    since: peer_version.timestamp,
                }
            } else if history.version_is_ancestor(*local_version, *peer_version)? {
                tracing::warn!(
                    region = %piece,
                    local = %local_version,
                    peer = %peer_version,
                    "peer lineage is ahead of backfiller"
                );
                return Err(BackfillError::LineageAnomaly(format!(
                    "peer {peer_version} is ahead of local {local_version} on {piece}"
                )));
            } else {
                TransferKind::Diverged {
                    common: history.common_ancestor(*peer_version, *local_version)?,
                    peer: *peer_version,
                }
            };
            plan.pieces.push(TransferPiece {
                region: piece,
                local: *local_version,
                kind,
            });
        }
    }
    Ok(plan)
}

/// Counters reported by a finished responder session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ResponderSummary {
    pub pieces: usize,
    pub skipped: usize,
    pub sub_pieces: usize,
    pub data_chunks: usize,
    pub entries: usize,
    pub frames: u64,
}

/// Sequenced sender that observes cancellation before every frame.
struct ChunkSink<'a, R: Region> {
    tx: &'a mpsc::Sender<ChunkFrame<R>>,
    token: &'a CancellationToken,
    seq: u64,
}

impl<'a, R: Region> ChunkSink<'a, R> {
    async fn send(&mut self, chunk: Chunk<R>) -> Result<(), BackfillError> {
        if self.token.is_cancelled() {
            return Err(BackfillError::Interrupted);
        }
        let frame = ChunkFrame {
            seq: self.seq,
            chunk,
        };
        tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(BackfillError::Interrupted),
            sent = self.tx.send(frame) => {
                sent.map_err(|_| BackfillError::ResourceLost("backfillee hung up".into()))?;
            }
        }
        self.seq += 1;
        Ok(())
    }
}

#[derive(Clone)]
pub struct Backfiller<R: Region> {
    store: Arc<dyn StoreView<R>>,
    history: Arc<dyn BranchHistory<R>>,
    sessions: Arc<SessionRegistry<R>>,
    config: BackfillConfig,
}

impl<R: Region> Backfiller<R> {
    pub fn new(
        store: Arc<dyn StoreView<R>>,
        history: Arc<dyn BranchHistory<R>>,
        sessions: Arc<SessionRegistry<R>>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            store,
            history,
            sessions,
            config: config.sanitized(),
        }
    }

    /// Accept sessions until `shutdown` fires or the acceptor closes. Each
    /// session runs on its own task and observes a child of `shutdown`.
    pub async fn serve(
        &self,
        mut acceptor: mpsc::Receiver<Accepted<R>>,
        shutdown: CancellationToken,
    ) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = acceptor.recv() => match next {
                    Some(accepted) => accepted,
                    None => break,
                },
            };
            let backfiller = self.clone();
            let token = shutdown.child_token();
            tokio::spawn(async move {
                let peer = accepted.peer.clone();
                match backfiller.handle(accepted, token).await {
                    Ok(summary) => {
                        tracing::debug!(peer = %peer, frames = summary.frames, "backfill session served");
                    }
                    Err(err) => {
                        tracing::debug!(peer = %peer, error = ?err, "backfill session closed");
                    }
                }
            });
        }
        tracing::info!("backfiller stopped accepting sessions");
    }

    /// Run one responder session to completion.
    pub async fn handle(
        &self,
        accepted: Accepted<R>,
        token: CancellationToken,
    ) -> Result<ResponderSummary, BackfillError> {
        let Accepted { peer, mut rx, tx } = accepted;
        let request = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(BackfillError::Interrupted),
            msg = rx.recv() => match msg {
                Some(ToBackfiller::Request(request)) => request,
                Some(ToBackfiller::Cancel { .. }) => return Err(BackfillError::Interrupted),
                None => return Err(BackfillError::ResourceLost(format!("{peer} closed before requesting"))),
            },
        };
        let session_id = request.session_id;
        if let Err(err) = self.sessions.begin(
            session_id,
            request.region.clone(),
            SessionState::Backfiller(BackfillerState::AwaitingRequest),
        ) {
            send_failure(&tx, &token, 0, &err).await;
            return Err(err);
        }
        tracing::info!(session_id = %session_id, peer = %peer, region = %request.region, "backfill request");

        // A cancel notice or a vanished peer stops the session at its next
        // chunk boundary.
        let session_token = token.child_token();
        let watcher = tokio::spawn(watch_peer(rx, session_id, session_token.clone()));

        let mut sink = ChunkSink {
            tx: &tx,
            token: &session_token,
            seq: 0,
        };
        let result = self.respond(request, &mut sink).await;
        watcher.abort();

        match result {
            Ok(mut summary) => {
                summary.frames = sink.seq;
                self.sessions
                    .transition(session_id, SessionState::Backfiller(BackfillerState::Finished));
                tracing::info!(
                    session_id = %session_id,
                    pieces = summary.pieces,
                    skipped = summary.skipped,
                    entries = summary.entries,
                    "backfill session finished"
                );
                Ok(summary)
            }
            Err(err) => {
                self.sessions
                    .transition(session_id, SessionState::Backfiller(BackfillerState::Aborted));
                if token.is_cancelled() {
                    notify_shutdown(&tx, session_id, sink.seq).await;
                } else if !matches!(err, BackfillError::Interrupted | BackfillError::ResourceLost(_)) {
                    send_failure(&tx, &session_token, sink.seq, &err).await;
                }
                if err.is_contract_violation() {
                    tracing::error!(session_id = %session_id, error = %err, "backfill session aborted");
                } else {
                    tracing::warn!(session_id = %session_id, error = %err, "backfill session aborted");
                }
                Err(err)
            }
        }
    }

    async fn respond(
        &self,
        request: BackfillRequest<R>,
        sink: &mut ChunkSink<'_, R>,
    ) -> Result<ResponderSummary, BackfillError> {
        let BackfillRequest {
            session_id,
            region,
            metainfo: peer_metainfo,
            lineage,
        } = request;
        self.sessions
            .transition(session_id, SessionState::Backfiller(BackfillerState::Diffing));

        let known: HashSet<_> = lineage.iter().map(|branch| branch.id).collect();
        for branch in lineage {
            self.history.record_branch(branch)?;
        }

        let snapshot = self
            .store
            .snapshot(&region)
            .await
            .map_err(|err| BackfillError::ResponderFailed(err.to_string()))?;
        let plan = plan_transfer(
            self.history.as_ref(),
            &region,
            snapshot.metainfo(),
            &peer_metainfo,
        )?;
        self.sessions
            .set_total(session_id, Role::Backfiller, plan.pieces.len() as u64);
        tracing::debug!(
            session_id = %session_id,
            pieces = plan.pieces.len(),
            skipped = plan.skipped,
            "backfill diff computed"
        );

        self.sessions
            .transition(session_id, SessionState::Backfiller(BackfillerState::Streaming));
        let mut summary = ResponderSummary {
            pieces: plan.pieces.len(),
            skipped: plan.skipped,
            ..ResponderSummary::default()
        };

        let ids: Vec<_> = plan.pieces.iter().map(|piece| piece.local.branch).collect();
        let branches: Vec<_> = self
            .history
            .export_lineage(&ids)?
            .into_iter()
            .filter(|branch| !known.contains(&branch.id))
            .collect();
        if !branches.is_empty() {
            sink.send(Chunk::Branches { branches }).await?;
        }

        for piece in &plan.pieces {
            self.stream_piece(snapshot.as_ref(), piece, sink, &mut summary)
                .await?;
            self.sessions.record_done(session_id, Role::Backfiller);
        }
        sink.send(Chunk::EndOfStream).await?;
        Ok(summary)
    }

    /// Stream one transfer piece as a run of sub-pieces, each closed by its
    /// own meta so the peer never buffers more than one.
    async fn stream_piece(
        &self,
        snapshot: &dyn StoreSnapshot<R>,
        piece: &TransferPiece<R>,
        sink: &mut ChunkSink<'_, R>,
        summary: &mut ResponderSummary,
    ) -> Result<(), BackfillError> {
        let since = match piece.kind {
            TransferKind::Forward { since } => since,
            TransferKind::Diverged { .. } => StateTimestamp::zero(),
        };
        let mut reader = snapshot
            .reader(&piece.region)
            .map_err(|err| BackfillError::ResponderFailed(err.to_string()))?;
        let mut remaining = piece.region.clone();
        let mut buffer: Vec<Entry<R::Key>> = Vec::new();
        let mut buffered_bytes = 0usize;

        loop {
            if sink.token.is_cancelled() {
                return Err(BackfillError::Interrupted);
            }
            let page = reader
                .next_page(self.config.read_page_limit)
                .map_err(|err| BackfillError::ResponderFailed(err.to_string()))?;
            if page.is_empty() {
                break;
            }
            for entry in page.into_iter().filter(|entry| entry.timestamp > since) {
                let size = entry_size(&entry);
                let full = buffer.len() >= self.config.chunk_max_entries
                    || buffered_bytes + size > self.config.chunk_max_bytes;
                if full && !buffer.is_empty() {
                    let (done, rest) = remaining.split_at(&entry.key);
                    self.emit_sub_piece(done, piece, std::mem::take(&mut buffer), sink, summary)
                        .await?;
                    remaining = rest;
                    buffered_bytes = 0;
                }
                buffered_bytes += size;
                buffer.push(entry);
            }
        }
        self.emit_sub_piece(remaining, piece, buffer, sink, summary)
            .await
    }

    async fn emit_sub_piece(
        &self,
        sub_region: R,
        piece: &TransferPiece<R>,
        entries: Vec<Entry<R::Key>>,
        sink: &mut ChunkSink<'_, R>,
        summary: &mut ResponderSummary,
    ) -> Result<(), BackfillError> {
        if sub_region.is_empty() {
            return Ok(());
        }
        if let TransferKind::Diverged { common, peer } = piece.kind {
            sink.send(Chunk::DeleteRange {
                sub_region: sub_region.clone(),
                after: common.timestamp,
                up_to: peer.timestamp,
            })
            .await?;
        }
        if !entries.is_empty() {
            summary.entries += entries.len();
            summary.data_chunks += 1;
            sink.send(Chunk::DataChunk {
                sub_region: sub_region.clone(),
                entries,
            })
            .await?;
        }
        sink.send(Chunk::MetaChunk {
            sub_region,
            branch_id: piece.local.branch,
            timestamp: piece.local.timestamp,
        })
        .await?;
        summary.sub_pieces += 1;
        Ok(())
    }
}

/// Value bytes plus a flat allowance for the key and framing.
fn entry_size<K>(entry: &Entry<K>) -> usize {
    entry.value.len() + 64
}

async fn watch_peer<R: Region>(
    mut rx: mpsc::Receiver<ToBackfiller<R>>,
    session_id: SessionId,
    token: CancellationToken,
) {
    while let Some(msg) = rx.recv().await {
        match msg {
            ToBackfiller::Cancel { session_id: id } if id == session_id => {
                tracing::debug!(session_id = %session_id, "peer cancelled backfill");
                break;
            }
            other => {
                tracing::warn!(session_id = %session_id, message = ?other, "unexpected message mid-session");
            }
        }
    }
    token.cancel();
}

/// Best effort: tell the peer this side is going away so it does not wait
/// for the connection to drop. Gives up after `SHUTDOWN_NOTICE_GRACE`.
async fn notify_shutdown<R: Region>(
    tx: &mpsc::Sender<ChunkFrame<R>>,
    session_id: SessionId,
    seq: u64,
) {
    let frame = ChunkFrame {
        seq,
        chunk: Chunk::Cancel,
    };
    if !matches!(
        tokio::time::timeout(SHUTDOWN_NOTICE_GRACE, tx.send(frame)).await,
        Ok(Ok(()))
    ) {
        tracing::debug!(session_id = %session_id, "shutdown notice not delivered");
    }
}

/// Best effort: tell the peer why the session died. Gives up if the session
/// is cancelled while the channel is full.
async fn send_failure<R: Region>(
    tx: &mpsc::Sender<ChunkFrame<R>>,
    token: &CancellationToken,
    seq: u64,
    err: &BackfillError,
) {
    let frame = ChunkFrame {
        seq,
        chunk: Chunk::Failed {
            reason: err.to_string(),
        },
    };
    tokio::select! {
        biased;
        _ = token.cancelled() => {}
        _ = tx.send(frame) => {}
    }
}
