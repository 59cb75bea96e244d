//! TCP transport for backfill sessions.
//!
//! Each session owns one TCP connection carrying length-delimited JSON
//! frames. Two bridge tasks per connection move frames between the socket
//! and the channel pair the protocol crate expects, so the orchestrator and
//! responder never see the socket.

use std::net::SocketAddr;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use holo_backfill::backfill::{
    connection_pair, Accepted, BackfillError, Connection, Connector, Region,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;

/// Default upper bound for one encoded frame.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 << 20;

type FrameSink = SplitSink<Framed<TcpStream, LengthDelimitedCodec>, Bytes>;
type FrameStream = SplitStream<Framed<TcpStream, LengthDelimitedCodec>>;

#[derive(Clone, Copy, Debug)]
pub struct TransportConfig {
    pub max_frame_bytes: usize,
    /// Per-direction channel capacity between socket and session.
    pub channel_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            channel_capacity: 64,
        }
    }
}

fn length_delimited_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_bytes)
        .new_codec()
}

fn split(socket: TcpStream, config: TransportConfig) -> (FrameSink, FrameStream) {
    if let Err(err) = socket.set_nodelay(true) {
        tracing::debug!(error = ?err, "set_nodelay failed");
    }
    Framed::new(socket, length_delimited_codec(config.max_frame_bytes)).split()
}

/// Connector dialing backfillers over TCP.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    config: TransportConfig,
}

impl TcpConnector {
    pub fn new(config: TransportConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<R: Region> Connector<R> for TcpConnector {
    async fn connect(&self, address: &str) -> Result<Connection<R>, BackfillError> {
        let socket = TcpStream::connect(address)
            .await
            .map_err(|err| BackfillError::ResourceLost(format!("connect {address}: {err}")))?;
        let (sink, stream) = split(socket, self.config);
        let (conn, local) = connection_pair(self.config.channel_capacity, address.to_string());
        let Accepted { peer, rx, tx } = local;
        spawn_bridge(peer, rx, sink, stream, tx);
        Ok(conn)
    }
}

/// Accept backfill connections on `listener` until `shutdown` fires. Each
/// connection is handed to the returned acceptor as an [`Accepted`] session.
pub fn spawn_listener<R: Region>(
    listener: TcpListener,
    config: TransportConfig,
    shutdown: CancellationToken,
) -> mpsc::Receiver<Accepted<R>> {
    let (acceptor_tx, acceptor_rx) = mpsc::channel(config.channel_capacity.max(1));
    tokio::spawn(async move {
        loop {
            let (socket, peer) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(error = ?err, "backfill accept failed");
                        continue;
                    }
                },
            };
            let (sink, stream) = split(socket, config);
            let (conn, accepted) = connection_pair(config.channel_capacity, peer.to_string());
            let Connection { tx, rx } = conn;
            spawn_bridge(peer.to_string(), rx, sink, stream, tx);
            if acceptor_tx.send(accepted).await.is_err() {
                break;
            }
        }
        tracing::debug!("backfill listener stopped");
    });
    acceptor_rx
}

/// Bind a listener, logging the address actually bound.
pub async fn bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind backfill listener on {addr}"))?;
    tracing::info!(addr = %listener.local_addr().context("listener address")?, "backfill listener bound");
    Ok(listener)
}

/// Pump `outbound` into the socket and the socket into `inbound`. Either side
/// closing tears the whole connection down.
fn spawn_bridge<Out, In>(
    peer: String,
    outbound: mpsc::Receiver<Out>,
    sink: FrameSink,
    stream: FrameStream,
    inbound: mpsc::Sender<In>,
) where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
{
    let writer_peer = peer.clone();
    tokio::spawn(async move {
        if let Err(err) = pump_to_socket(outbound, sink).await {
            tracing::debug!(peer = %writer_peer, error = ?err, "backfill writer closed");
        }
    });
    tokio::spawn(async move {
        if let Err(err) = pump_from_socket(stream, inbound).await {
            tracing::debug!(peer = %peer, error = ?err, "backfill reader closed");
        }
    });
}

async fn pump_to_socket<T: Serialize>(
    mut outbound: mpsc::Receiver<T>,
    mut sink: FrameSink,
) -> anyhow::Result<()> {
    while let Some(msg) = outbound.recv().await {
        let payload = serde_json::to_vec(&msg).context("encode frame")?;
        sink.send(Bytes::from(payload)).await.context("write frame")?;
    }
    sink.close().await.context("close socket")?;
    Ok(())
}

async fn pump_from_socket<T: DeserializeOwned>(
    mut stream: FrameStream,
    inbound: mpsc::Sender<T>,
) -> anyhow::Result<()> {
    while let Some(frame) = stream.next().await {
        let frame = frame.context("read frame")?;
        let msg = serde_json::from_slice(&frame).context("decode frame")?;
        if inbound.send(msg).await.is_err() {
            break;
        }
    }
    Ok(())
}
