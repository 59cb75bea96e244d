// holo-replica binary entry point.
//
// Opens one replica (fjall store, branch log, identity file) and runs a
// single command against it: serve backfill sessions, pull a region from a
// peer, apply a foreground write or print the replica's state.

use std::io::IsTerminal;
use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_backfill::backfill::{BackfillConfig, KeyRange};
use holo_replica::transport::{bind, DEFAULT_MAX_FRAME_BYTES};
use holo_replica::{NodeConfig, ReplicaNode};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "holo-replica")]
struct Cli {
    #[arg(long, env = "HOLO_REPLICA_DATA_DIR", default_value = "./holo-replica-data")]
    data_dir: PathBuf,

    /// Fsync every applied chunk and branch record.
    #[arg(long, env = "HOLO_REPLICA_FSYNC", default_value_t = true)]
    fsync: bool,

    /// Inclusive start of the key range this replica is responsible for.
    #[arg(long, env = "HOLO_REPLICA_RANGE_START", default_value = "")]
    range_start: String,

    /// Exclusive end of the responsibility range; empty means unbounded.
    #[arg(long, env = "HOLO_REPLICA_RANGE_END", default_value = "")]
    range_end: String,

    #[arg(long, env = "HOLO_REPLICA_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve backfill sessions until interrupted.
    Serve {
        #[arg(long, env = "HOLO_REPLICA_LISTEN", default_value = "127.0.0.1:7700")]
        listen: SocketAddr,
    },
    /// Backfill a region from a peer replica.
    Pull {
        #[arg(long, env = "HOLO_REPLICA_BACKFILLER")]
        from: String,
        /// Region start; defaults to the responsibility range.
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
    },
    /// Apply one foreground write.
    Put { key: String, value: String },
    /// Read one key.
    Get { key: String },
    /// Print node id, metainfo and counts as JSON.
    Inspect,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();
    let responsibility = KeyRange::new(cli.range_start.as_bytes(), cli.range_end.as_bytes());
    let mut config = NodeConfig::new(&cli.data_dir, responsibility.clone());
    config.fsync = cli.fsync;
    config.backfill = BackfillConfig::from_env();
    config.max_frame_bytes = cli.max_frame_bytes.max(1);
    let node = ReplicaNode::open(config)?;

    match cli.cmd {
        Command::Serve { listen } => {
            let listener = bind(listen).await?;
            let shutdown = cancel_on_ctrl_c();
            node.serve(listener, shutdown).await;
        }
        Command::Pull { from, start, end } => {
            let region = match (start, end) {
                (None, None) => responsibility,
                (start, end) => KeyRange::new(
                    start.unwrap_or_default().into_bytes(),
                    end.unwrap_or_default().into_bytes(),
                ),
            };
            let token = cancel_on_ctrl_c();
            let summary = node.pull(&from, &region, &token).await?;
            println!(
                "backfilled {region}: {} sub-pieces, {} written, {} skipped, {} deleted",
                summary.sub_pieces, summary.entries_written, summary.entries_skipped, summary.deleted
            );
        }
        Command::Put { key, value } => {
            let version = node.put(key.as_bytes(), value.as_bytes()).await?;
            println!("{version}");
        }
        Command::Get { key } => match node.get(key.as_bytes())? {
            Some(value) => println!("{}", String::from_utf8_lossy(&value)),
            None => println!("(nil)"),
        },
        Command::Inspect => {
            let report = node.inspect().await?;
            let out = serde_json::to_string_pretty(&report).context("encode report")?;
            println!("{out}");
        }
    }
    Ok(())
}

/// Token cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
        }
        cancel.cancel();
    });
    token
}
