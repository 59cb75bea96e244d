//! Shared helpers for backfill integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use holo_backfill::backfill::{
    ApplyOutcome, BackfillConfig, BackfilleeOrchestrator, Backfiller, BackfillerDescriptor, Branch,
    BranchHistory, BranchId, DescriptorPublisher, Entry, KeyRange, LocalNetwork,
    MemoryBranchHistory, MemoryStoreView, Metainfo, Region, SessionRegistry, StateTimestamp,
    StoreChunk, StoreError, StoreSnapshot, StoreView, Version,
};
use tokio_util::sync::CancellationToken;

/// Upper bound for any single awaited step.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub fn r(start: &str, end: &str) -> KeyRange {
    KeyRange::new(start.as_bytes(), end.as_bytes())
}

pub fn ts(v: u64) -> StateTimestamp {
    StateTimestamp(v)
}

/// One in-process replica: memory store, its own branch history and a
/// session registry.
pub struct Replica {
    pub store: Arc<MemoryStoreView<KeyRange>>,
    pub history: Arc<MemoryBranchHistory<KeyRange>>,
    pub sessions: Arc<SessionRegistry<KeyRange>>,
    owned: Mutex<HashSet<BranchId>>,
}

impl Replica {
    pub fn new(responsibility: KeyRange) -> Self {
        Self {
            store: Arc::new(MemoryStoreView::new(responsibility)),
            history: Arc::new(MemoryBranchHistory::new()),
            sessions: Arc::new(SessionRegistry::new()),
            owned: Mutex::new(HashSet::new()),
        }
    }

    pub fn backfiller(&self, config: BackfillConfig) -> Backfiller<KeyRange> {
        Backfiller::new(
            self.store.clone(),
            self.history.clone(),
            self.sessions.clone(),
            config,
        )
    }

    pub fn orchestrator(
        &self,
        net: Arc<LocalNetwork<KeyRange>>,
    ) -> BackfilleeOrchestrator<KeyRange> {
        self.orchestrator_with_store(net, self.store.clone())
    }

    pub fn orchestrator_with_store(
        &self,
        net: Arc<LocalNetwork<KeyRange>>,
        store: Arc<dyn StoreView<KeyRange>>,
    ) -> BackfilleeOrchestrator<KeyRange> {
        BackfilleeOrchestrator::new(store, self.history.clone(), net, self.sessions.clone())
    }

    /// Foreground client write. The piece holding `key` moves to a branch
    /// this replica owns, forking one off the piece's current version if
    /// needed; the timestamp is one past anything in the metainfo.
    pub async fn write(&self, key: &str, value: &str) -> Version {
        let key = key.as_bytes().to_vec();
        let metainfo = self.store.metainfo();
        let (piece, base) = metainfo
            .iter()
            .find(|(region, _)| region.contains_key(&key))
            .map(|(region, version)| (region.clone(), *version))
            .expect("key inside responsibility");
        let next = metainfo
            .iter()
            .map(|(_, version)| version.timestamp)
            .max()
            .unwrap_or_default()
            .next();
        let branch = {
            let mut owned = self.owned.lock().expect("owned lock");
            if owned.contains(&base.branch) {
                base.branch
            } else {
                let id = BranchId::generate();
                self.history
                    .record_branch(Branch::fork(id, base, piece.clone()))
                    .expect("record fork");
                owned.insert(id);
                id
            }
        };
        let version = Version::new(branch, next);
        self.store
            .apply_chunk(
                &piece,
                StoreChunk::single_write(piece.clone(), base, key, value.as_bytes().to_vec(), version),
            )
            .await
            .expect("foreground write");
        version
    }

    pub fn value(&self, key: &str) -> Option<String> {
        self.store
            .get(&key.as_bytes().to_vec())
            .map(|(value, _)| String::from_utf8_lossy(&value).into_owned())
    }

    /// Key/value pairs inside `region`, in key order.
    pub fn dump(&self, region: &KeyRange) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.store
            .entries()
            .into_iter()
            .filter(|entry| region.contains_key(&entry.key))
            .map(|entry| (entry.key, entry.value))
            .collect()
    }
}

/// In-process network plus one published backfiller.
pub struct Cluster {
    pub net: Arc<LocalNetwork<KeyRange>>,
    pub publisher: DescriptorPublisher<KeyRange>,
    pub shutdown: CancellationToken,
}

impl Cluster {
    pub fn new() -> Self {
        Self {
            net: LocalNetwork::new(16),
            publisher: DescriptorPublisher::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve `replica` at `address` and publish it for `region_hint`.
    pub fn serve(
        &self,
        replica: &Replica,
        address: &str,
        region_hint: KeyRange,
        config: BackfillConfig,
    ) {
        let acceptor = self.net.listen(address);
        let backfiller = replica.backfiller(config);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move { backfiller.serve(acceptor, shutdown).await });
        self.publisher
            .publish(BackfillerDescriptor::new(address, region_hint));
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Small chunks so even tiny data sets produce several sub-pieces.
pub fn tiny_chunks() -> BackfillConfig {
    BackfillConfig {
        chunk_max_entries: 2,
        chunk_max_bytes: 4096,
        read_page_limit: 3,
        channel_capacity: 4,
    }
}

/// Store wrapper that cancels `token` once `limit` chunks were applied.
pub struct CancelAfterApplies {
    pub inner: Arc<MemoryStoreView<KeyRange>>,
    pub token: CancellationToken,
    pub limit: usize,
    pub applied: AtomicUsize,
}

#[async_trait]
impl StoreView<KeyRange> for CancelAfterApplies {
    fn responsibility(&self) -> KeyRange {
        self.inner.responsibility()
    }

    async fn snapshot_metainfo(&self, region: &KeyRange) -> Result<Metainfo<KeyRange>, StoreError> {
        self.inner.snapshot_metainfo(region).await
    }

    async fn snapshot(
        &self,
        region: &KeyRange,
    ) -> Result<Box<dyn StoreSnapshot<KeyRange>>, StoreError> {
        self.inner.snapshot(region).await
    }

    async fn apply_chunk(
        &self,
        authorized: &KeyRange,
        chunk: StoreChunk<KeyRange>,
    ) -> Result<ApplyOutcome, StoreError> {
        let outcome = self.inner.apply_chunk(authorized, chunk).await?;
        if self.applied.fetch_add(1, Ordering::SeqCst) + 1 >= self.limit {
            self.token.cancel();
        }
        Ok(outcome)
    }
}

/// Every metainfo piece of `backfillee` must explain its stored data: pieces
/// still at `prior` hold exactly the prior data, pieces at a version of the
/// backfiller hold exactly the backfiller's data.
pub fn assert_metainfo_explains_data(
    backfillee: &Replica,
    backfiller: &Replica,
    region: &KeyRange,
    prior: &[Entry<Vec<u8>>],
) {
    let source = backfiller.store.metainfo();
    let metainfo = backfillee.store.metainfo().mask(region);
    metainfo
        .validate_partition(region)
        .expect("metainfo partitions region");
    for (piece, version) in metainfo.iter() {
        let ours = backfillee.dump(piece);
        let expected: Vec<(Vec<u8>, Vec<u8>)> = if source
            .mask(piece)
            .iter()
            .all(|(_, theirs)| theirs == version)
        {
            backfiller.dump(piece)
        } else {
            prior
                .iter()
                .filter(|entry| piece.contains_key(&entry.key))
                .map(|entry| (entry.key.clone(), entry.value.clone()))
                .collect()
        };
        assert_eq!(ours, expected, "piece {piece} at {version} does not match its data");
    }
}
