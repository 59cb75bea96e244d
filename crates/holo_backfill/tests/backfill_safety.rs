//! Safety properties of backfill sessions.
//!
//! Failure model covered:
//! - A foreground write racing a backfill chunk for the same key.
//! - Sessions cancelled at arbitrary chunk boundaries.
//! - Backfill of a random sub-region next to unrelated local data.
//! - A backfillee whose lineage forked away from the backfiller's.
//!
//! Verification:
//! - Newer timestamps always win; metainfo never regresses.
//! - Metainfo explains the stored data after every abort.
//! - Nothing outside the requested region changes.

mod common;

use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use async_trait::async_trait;
use common::{assert_metainfo_explains_data, r, tiny_chunks, CancelAfterApplies, Cluster, Replica};
use holo_backfill::backfill::{
    ApplyOutcome, BackfillConfig, BackfillError, BackfilleeState, BackfillerState, BranchHistory,
    BranchId, Entry, KeyRange, MemoryStoreView, Metainfo, Region, Role, SessionId, SessionState,
    StateTimestamp, StoreChunk, StoreError, StoreSnapshot, StoreView, Version,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Store wrapper that lands one foreground write right before the first
/// backfill chunk is applied.
struct ForegroundRace {
    inner: Arc<MemoryStoreView<KeyRange>>,
    pending: Mutex<Option<(Vec<u8>, Vec<u8>, Version)>>,
}

#[async_trait]
impl StoreView<KeyRange> for ForegroundRace {
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
        if let Some((key, value, version)) = self.pending.lock().await.take() {
            let responsibility = self.inner.responsibility();
            let base = self.inner.metainfo().get(&key).copied().unwrap_or(Version::zero());
            self.inner
                .apply_chunk(
                    &responsibility,
                    StoreChunk::single_write(responsibility.clone(), base, key, value, version),
                )
                .await?;
        }
        self.inner.apply_chunk(authorized, chunk).await
    }
}

#[tokio::test]
async fn foreground_write_beats_older_backfill_chunk() {
    let source = Replica::new(r("a", "z"));
    source.write("k", "from-backfill").await;
    source.write("m", "other").await;

    let target = Replica::new(r("a", "z"));
    let foreground = Version::new(BranchId::generate(), StateTimestamp(50));
    let race = Arc::new(ForegroundRace {
        inner: target.store.clone(),
        pending: Mutex::new(Some((b"k".to_vec(), b"from-client".to_vec(), foreground))),
    });

    let cluster = Cluster::new();
    cluster.serve(&source, "source", r("a", "z"), BackfillConfig::default());
    let token = CancellationToken::new();
    let summary = target
        .orchestrator_with_store(cluster.net.clone(), race)
        .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &token)
        .await
        .expect("backfill");

    // The foreground write advanced the whole piece, so none of the chunk lands.
    assert_eq!(summary.entries_written, 0);
    assert_eq!(summary.entries_skipped, 2);
    assert_eq!(summary.metainfo_refused, 1);
    assert_eq!(target.value("k").as_deref(), Some("from-client"));
    assert_eq!(target.value("m"), None);
    assert_eq!(target.store.metainfo().get(&b"m".to_vec()), Some(&foreground));
    assert_metainfo_explains_data(
        &target,
        &source,
        &r("a", "z"),
        &[Entry::new(b"k".to_vec(), b"from-client".to_vec(), StateTimestamp(50))],
    );
}

#[tokio::test]
async fn cancellation_at_every_chunk_boundary_keeps_metainfo_consistent() {
    let source = Replica::new(r("a", "z"));
    for key in ["b", "c", "e", "g", "h", "j", "l", "n", "p", "s", "u", "w"] {
        source.write(key, &key.repeat(3)).await;
    }
    let cluster = Cluster::new();
    cluster.serve(&source, "source", r("a", "z"), tiny_chunks());

    for limit in 1..=6 {
        let target = Replica::new(r("a", "z"));
        let token = CancellationToken::new();
        let cutting = Arc::new(CancelAfterApplies {
            inner: target.store.clone(),
            token: token.clone(),
            limit,
            applied: AtomicUsize::new(0),
        });
        let session_id = SessionId::generate();
        let result = target
            .orchestrator_with_store(cluster.net.clone(), cutting)
            .backfill(session_id, &r("a", "z"), cluster.publisher.subscribe(), &token)
            .await;

        match result {
            Err(BackfillError::Interrupted) => {
                assert_eq!(
                    target.sessions.state(session_id, Role::Backfillee),
                    Some(SessionState::Backfillee(BackfilleeState::Aborted))
                );
                let progress = target.sessions.progress(session_id).expect("progress");
                assert_eq!(progress.sub_regions_done, limit as u64);
            }
            Ok(_) => {}
            Err(other) => panic!("limit {limit}: unexpected error {other:?}"),
        }
        assert_metainfo_explains_data(&target, &source, &r("a", "z"), &[]);

        let retry = CancellationToken::new();
        target
            .orchestrator(cluster.net.clone())
            .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &retry)
            .await
            .expect("retry completes");
        assert_eq!(target.dump(&r("a", "z")), source.dump(&r("a", "z")));
    }
}

#[tokio::test]
async fn random_regions_never_overshoot() {
    let mut rng = StdRng::seed_from_u64(0x5eed_ba11);
    let alphabet: Vec<char> = ('a'..='z').collect();
    let random_key = |rng: &mut StdRng| -> String {
        let len = rng.gen_range(1..=2);
        (0..len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect()
    };

    for round in 0..16 {
        let source = Replica::new(KeyRange::full());
        let target = Replica::new(KeyRange::full());
        for _ in 0..24 {
            let key = random_key(&mut rng);
            source.write(&key, &format!("s{round}-{key}")).await;
        }
        for _ in 0..12 {
            let key = random_key(&mut rng);
            target.write(&key, &format!("t{round}-{key}")).await;
        }
        let (lo, hi) = loop {
            let a = random_key(&mut rng);
            let b = random_key(&mut rng);
            if a != b {
                break if a < b { (a, b) } else { (b, a) };
            }
        };
        let region = r(&lo, &hi);

        let outside_before: Vec<_> = target
            .dump(&KeyRange::full())
            .into_iter()
            .filter(|(key, _)| !region.contains_key(key))
            .collect();
        let metainfo_before = target.store.metainfo();

        let cluster = Cluster::new();
        cluster.serve(&source, "source", KeyRange::full(), tiny_chunks());
        let token = CancellationToken::new();
        target
            .orchestrator(cluster.net.clone())
            .backfill(SessionId::generate(), &region, cluster.publisher.subscribe(), &token)
            .await
            .unwrap_or_else(|err| panic!("round {round} region {region}: {err}"));

        let outside_after: Vec<_> = target
            .dump(&KeyRange::full())
            .into_iter()
            .filter(|(key, _)| !region.contains_key(key))
            .collect();
        assert_eq!(outside_before, outside_after, "round {round} region {region}");
        assert_eq!(target.dump(&region), source.dump(&region), "round {round} region {region}");

        let metainfo_after = target.store.metainfo();
        for outside in KeyRange::full().subtract(&region) {
            assert_eq!(
                metainfo_after.mask(&outside).into_pieces(),
                metainfo_before.mask(&outside).into_pieces(),
                "round {round}: metainfo outside {region} moved"
            );
        }
        metainfo_after
            .validate_partition(&KeyRange::full())
            .expect("partition");
    }
}

#[tokio::test]
async fn diverged_lineage_is_rolled_onto_backfiller() {
    let source = Replica::new(r("a", "z"));
    source.write("a", "1").await;
    source.write("b", "2").await;

    let target = Replica::new(r("a", "z"));
    let cluster = Cluster::new();
    cluster.serve(&source, "source", r("a", "z"), BackfillConfig::default());
    let orchestrator = target.orchestrator(cluster.net.clone());
    let token = CancellationToken::new();
    orchestrator
        .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &token)
        .await
        .expect("initial sync");

    // Both sides keep writing on their own lineage.
    let ours = source.write("c", "3").await;
    target.write("d", "stray").await;
    let theirs = target.write("a", "overwritten").await;
    assert!(!source.history.contains(theirs.branch));

    let summary = orchestrator
        .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &token)
        .await
        .expect("diverged sync");

    assert_eq!(summary.deleted, 2);
    assert_eq!(target.value("a").as_deref(), Some("1"));
    assert_eq!(target.value("b").as_deref(), Some("2"));
    assert_eq!(target.value("c").as_deref(), Some("3"));
    assert_eq!(target.value("d"), None);
    assert_eq!(target.store.metainfo().get(&b"d".to_vec()), Some(&ours));
    // The backfiller learned the forked branch from the request lineage.
    assert!(source.history.contains(theirs.branch));
}

#[tokio::test]
async fn peer_ahead_of_backfiller_aborts_both_sides() {
    let source = Replica::new(r("a", "z"));
    source.write("a", "1").await;
    let cluster = Cluster::new();
    cluster.serve(&source, "source", r("a", "z"), BackfillConfig::default());
    let token = CancellationToken::new();

    // `stale` stops following the lineage after the first write.
    let stale = Replica::new(r("a", "z"));
    stale
        .orchestrator(cluster.net.clone())
        .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &token)
        .await
        .expect("stale sync");

    source.write("b", "2").await;
    let target = Replica::new(r("a", "z"));
    target
        .orchestrator(cluster.net.clone())
        .backfill(SessionId::generate(), &r("a", "z"), cluster.publisher.subscribe(), &token)
        .await
        .expect("target sync");

    let lagging = Cluster::new();
    lagging.serve(&stale, "stale", r("a", "z"), BackfillConfig::default());
    let session_id = SessionId::generate();
    let err = target
        .orchestrator(lagging.net.clone())
        .backfill(session_id, &r("a", "z"), lagging.publisher.subscribe(), &token)
        .await
        .unwrap_err();

    assert!(
        matches!(err, BackfillError::ResponderFailed(ref reason) if reason.contains("lineage anomaly")),
        "{err:?}"
    );
    assert_eq!(target.value("b").as_deref(), Some("2"));
    assert_eq!(target.store.metainfo(), source.store.metainfo());
    assert_eq!(
        target.sessions.state(session_id, Role::Backfillee),
        Some(SessionState::Backfillee(BackfilleeState::Aborted))
    );
    assert_eq!(
        stale.sessions.state(session_id, Role::Backfiller),
        Some(SessionState::Backfiller(BackfillerState::Aborted))
    );
}
