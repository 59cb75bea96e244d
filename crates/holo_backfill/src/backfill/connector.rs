//! Transport seam between the two roles.
//!
//! A session runs over a pair of ordered channels. Real transports (TCP in
//! the node crate) bridge those channels to the wire; [`LocalNetwork`] wires
//! them directly for single-process clusters and tests.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::BackfillError;
use super::proto::{ChunkFrame, ToBackfiller};
use super::types::Region;

/// Backfillee end of a session transport.
pub struct Connection<R: Region> {
    pub tx: mpsc::Sender<ToBackfiller<R>>,
    pub rx: mpsc::Receiver<ChunkFrame<R>>,
}

/// Backfiller end of a session transport.
pub struct Accepted<R: Region> {
    pub peer: String,
    pub rx: mpsc::Receiver<ToBackfiller<R>>,
    pub tx: mpsc::Sender<ChunkFrame<R>>,
}

/// Two directly connected ends.
pub fn connection_pair<R: Region>(
    capacity: usize,
    peer: impl Into<String>,
) -> (Connection<R>, Accepted<R>) {
    let (req_tx, req_rx) = mpsc::channel(capacity.max(1));
    let (chunk_tx, chunk_rx) = mpsc::channel(capacity.max(1));
    (
        Connection {
            tx: req_tx,
            rx: chunk_rx,
        },
        Accepted {
            peer: peer.into(),
            rx: req_rx,
            tx: chunk_tx,
        },
    )
}

/// Opens session transports to a backfiller address.
#[async_trait]
pub trait Connector<R: Region>: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Connection<R>, BackfillError>;
}

/// In-process address book mapping addresses to backfiller accept queues.
pub struct LocalNetwork<R: Region> {
    listeners: RwLock<HashMap<String, mpsc::Sender<Accepted<R>>>>,
    capacity: usize,
}

impl<R: Region> LocalNetwork<R> {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            listeners: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
        })
    }

    /// Start accepting sessions on `address`. The returned receiver feeds
    /// [`Backfiller::serve`](super::backfiller::Backfiller::serve).
    pub fn listen(&self, address: impl Into<String>) -> mpsc::Receiver<Accepted<R>> {
        let (tx, rx) = mpsc::channel(self.capacity);
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.insert(address.into(), tx);
        }
        rx
    }

    pub fn unlisten(&self, address: &str) {
        if let Ok(mut listeners) = self.listeners.write() {
            listeners.remove(address);
        }
    }
}

#[async_trait]
impl<R: Region> Connector<R> for LocalNetwork<R> {
    async fn connect(&self, address: &str) -> Result<Connection<R>, BackfillError> {
        let acceptor = self
            .listeners
            .read()
            .map_err(|_| BackfillError::ResourceLost("local network poisoned".into()))?
            .get(address)
            .cloned()
            .ok_or_else(|| BackfillError::ResourceLost(format!("no listener at {address}")))?;
        let (conn, accepted) = connection_pair(self.capacity, format!("local:{address}"));
        acceptor
            .send(accepted)
            .await
            .map_err(|_| BackfillError::ResourceLost(format!("listener at {address} closed")))?;
        Ok(conn)
    }
}
