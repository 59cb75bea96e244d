//! One replica process: durable store, branch log, session registry and the
//! TCP endpoints for both protocol roles.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use fjall::PersistMode;
use holo_backfill::backfill::{
    BackfillConfig, BackfillSummary, BackfilleeOrchestrator, Backfiller, BackfillerDescriptor,
    Branch, BranchHistory, BranchId, DescriptorWatch, KeyRange, Metainfo, Region, SessionId,
    SessionProgress, SessionRegistry, StoreChunk, StoreView, Version,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::branch_log::{FileBranchLog, BRANCH_LOG_FILE};
use crate::store::FjallStoreView;
use crate::transport::{spawn_listener, TcpConnector, TransportConfig};

const IDENTITY_FILE: &str = "node.json";
const STORAGE_DIR: &str = "storage";
const PUT_ATTEMPTS: usize = 8;

#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub data_dir: PathBuf,
    /// Region this replica keeps metainfo for. Fixed at first open.
    pub responsibility: KeyRange,
    /// Fsync every store apply and branch append.
    pub fsync: bool,
    pub backfill: BackfillConfig,
    pub max_frame_bytes: usize,
}

impl NodeConfig {
    pub fn new(data_dir: impl Into<PathBuf>, responsibility: KeyRange) -> Self {
        Self {
            data_dir: data_dir.into(),
            responsibility,
            fsync: true,
            backfill: BackfillConfig::default(),
            max_frame_bytes: TransportConfig::default().max_frame_bytes,
        }
    }

    fn transport(&self) -> TransportConfig {
        TransportConfig {
            max_frame_bytes: self.max_frame_bytes,
            channel_capacity: self.backfill.channel_capacity.max(1),
        }
    }
}

/// Persisted identity: who this node is, what it serves and which branches
/// it created for its own foreground writes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct NodeIdentity {
    node_id: Uuid,
    responsibility: KeyRange,
    owned_branches: BTreeSet<BranchId>,
}

impl NodeIdentity {
    fn load_or_init(path: &Path, responsibility: &KeyRange) -> anyhow::Result<Self> {
        match fs::read(path) {
            Ok(data) => {
                let identity: NodeIdentity =
                    serde_json::from_slice(&data).context("decode node identity")?;
                anyhow::ensure!(
                    identity.responsibility == *responsibility,
                    "node was created for {}, not {responsibility}",
                    identity.responsibility
                );
                Ok(identity)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                let identity = NodeIdentity {
                    node_id: Uuid::new_v4(),
                    responsibility: responsibility.clone(),
                    owned_branches: BTreeSet::new(),
                };
                identity.persist(path)?;
                Ok(identity)
            }
            Err(err) => Err(err).context("read node identity"),
        }
    }

    fn persist(&self, path: &Path) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(self).context("serialize node identity")?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).context("write node identity")?;
        fs::rename(&tmp, path).context("install node identity")?;
        Ok(())
    }
}

/// Summary printed by `inspect`.
#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
    pub node_id: Uuid,
    pub responsibility: String,
    pub metainfo: Vec<(String, String)>,
    pub keys: usize,
    pub branches: usize,
}

pub struct ReplicaNode {
    config: NodeConfig,
    identity: Mutex<NodeIdentity>,
    store: Arc<FjallStoreView>,
    history: Arc<FileBranchLog<KeyRange>>,
    sessions: Arc<SessionRegistry<KeyRange>>,
}

impl ReplicaNode {
    pub fn open(config: NodeConfig) -> anyhow::Result<Self> {
        fs::create_dir_all(&config.data_dir).context("create data dir")?;
        let identity =
            NodeIdentity::load_or_init(&config.data_dir.join(IDENTITY_FILE), &config.responsibility)?;

        let storage_dir = config.data_dir.join(STORAGE_DIR);
        fs::create_dir_all(&storage_dir).context("create storage dir")?;
        let keyspace = Arc::new(
            fjall::Config::new(&storage_dir)
                .open()
                .context("open fjall keyspace")?,
        );
        let persist = config.fsync.then_some(PersistMode::SyncAll);
        let store = Arc::new(FjallStoreView::open(
            keyspace,
            config.responsibility.clone(),
            persist,
        )?);
        let history = Arc::new(FileBranchLog::open(
            config.data_dir.join(BRANCH_LOG_FILE),
            config.fsync,
        )?);

        tracing::info!(
            node_id = %identity.node_id,
            data_dir = %config.data_dir.display(),
            responsibility = %config.responsibility,
            branches = history.len(),
            "replica opened"
        );
        Ok(Self {
            config,
            identity: Mutex::new(identity),
            store,
            history,
            sessions: Arc::new(SessionRegistry::new()),
        })
    }

    pub async fn node_id(&self) -> Uuid {
        self.identity.lock().await.node_id
    }

    pub fn store(&self) -> &Arc<FjallStoreView> {
        &self.store
    }

    pub fn history(&self) -> &Arc<FileBranchLog<KeyRange>> {
        &self.history
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry<KeyRange>> {
        &self.sessions
    }

    /// Foreground client write. The metainfo piece holding `key` moves onto
    /// a branch this node owns, forked from the piece's current version when
    /// it does not own that one yet. A pull that advances the piece between
    /// the metainfo read and the apply makes the attempt start over.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> anyhow::Result<Version> {
        let mut identity = self.identity.lock().await;
        anyhow::ensure!(
            self.config.responsibility.contains_key(&key.to_vec()),
            "key outside {}",
            self.config.responsibility
        );
        for attempt in 1..=PUT_ATTEMPTS {
            let metainfo = self.store.metainfo()?;
            if let Some(version) = self.try_put(&mut identity, &metainfo, key, value).await? {
                return Ok(version);
            }
            tracing::debug!(attempt, "write lost its piece to a concurrent backfill");
        }
        anyhow::bail!("write lost to concurrent backfills {PUT_ATTEMPTS} times")
    }

    /// One write against `metainfo` as read beforehand. `None` when the store
    /// no longer agreed with it and the write did not land cleanly.
    async fn try_put(
        &self,
        identity: &mut NodeIdentity,
        metainfo: &Metainfo<KeyRange>,
        key: &[u8],
        value: &[u8],
    ) -> anyhow::Result<Option<Version>> {
        let key = key.to_vec();
        let (piece, base) = metainfo
            .iter()
            .find(|(region, _)| region.contains_key(&key))
            .map(|(region, version)| (region.clone(), *version))
            .context("metainfo has no piece for key")?;
        let next = metainfo
            .iter()
            .map(|(_, version)| version.timestamp)
            .max()
            .unwrap_or_default()
            .next();

        let branch = if identity.owned_branches.contains(&base.branch) {
            base.branch
        } else {
            let id = BranchId::generate();
            self.history
                .record_branch(Branch::fork(id, base, piece.clone()))
                .context("record fork")?;
            identity.owned_branches.insert(id);
            identity.persist(&self.config.data_dir.join(IDENTITY_FILE))?;
            tracing::info!(branch = %id, origin = %base, region = %piece, "forked write branch");
            id
        };

        let version = Version::new(branch, next);
        let outcome = self
            .store
            .apply_chunk(
                &piece,
                StoreChunk::single_write(piece.clone(), base, key, value.to_vec(), version),
            )
            .await
            .context("apply write")?;
        if outcome.written == 0 || outcome.metainfo_refused > 0 {
            return Ok(None);
        }
        Ok(Some(version))
    }

    pub fn get(&self, key: &[u8]) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.store.get(key)?.map(|(value, _)| value))
    }

    fn backfiller(&self) -> Backfiller<KeyRange> {
        Backfiller::new(
            self.store.clone(),
            self.history.clone(),
            self.sessions.clone(),
            self.config.backfill.clone(),
        )
    }

    /// Serve backfill sessions on `listener` until `shutdown` fires.
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) {
        let acceptor = spawn_listener(listener, self.config.transport(), shutdown.clone());
        self.backfiller().serve(acceptor, shutdown).await;
    }

    /// Backfill `region` from the backfiller at `address`.
    pub async fn pull(
        &self,
        address: &str,
        region: &KeyRange,
        token: &CancellationToken,
    ) -> anyhow::Result<BackfillSummary> {
        let orchestrator = BackfilleeOrchestrator::new(
            self.store.clone() as Arc<dyn StoreView<KeyRange>>,
            self.history.clone(),
            Arc::new(TcpConnector::new(self.config.transport())),
            self.sessions.clone(),
        );
        let descriptors = DescriptorWatch::fixed(BackfillerDescriptor::new(address, region.clone()));
        let summary = orchestrator
            .backfill(SessionId::generate(), region, descriptors, token)
            .await
            .with_context(|| format!("backfill {region} from {address}"))?;
        Ok(summary)
    }

    pub fn progress(&self, session_id: SessionId) -> Option<SessionProgress> {
        self.sessions.progress(session_id)
    }

    pub async fn inspect(&self) -> anyhow::Result<NodeReport> {
        let metainfo = self.store.metainfo()?;
        Ok(NodeReport {
            node_id: self.node_id().await,
            responsibility: self.config.responsibility.to_string(),
            metainfo: metainfo
                .iter()
                .map(|(region, version)| (region.to_string(), version.to_string()))
                .collect(),
            keys: self.store.scan(&self.config.responsibility)?.len(),
            branches: self.history.len(),
        })
    }
}
