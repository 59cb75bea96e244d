use std::path::Path;
use std::time::Duration;

use holo_backfill::backfill::{BackfillConfig, BranchHistory, KeyRange};
use holo_replica::transport::bind;
use holo_replica::{NodeConfig, ReplicaNode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const STEP_TIMEOUT: Duration = Duration::from_secs(20);

fn open(dir: &Path) -> ReplicaNode {
    let mut config = NodeConfig::new(dir, KeyRange::full());
    config.backfill = BackfillConfig {
        chunk_max_entries: 3,
        chunk_max_bytes: 4096,
        read_page_limit: 4,
        channel_capacity: 4,
    };
    ReplicaNode::open(config).expect("open replica")
}

/// Serve `node` on an ephemeral port; returns the address and the server task.
async fn serve(
    node: std::sync::Arc<ReplicaNode>,
    shutdown: &CancellationToken,
) -> (String, JoinHandle<()>) {
    let listener = bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("local addr").to_string();
    let shutdown = shutdown.clone();
    let task = tokio::spawn(async move { node.serve(listener, shutdown).await });
    (addr, task)
}

fn value(node: &ReplicaNode, key: &str) -> Option<String> {
    node.get(key.as_bytes())
        .expect("get")
        .map(|v| String::from_utf8_lossy(&v).into_owned())
}

#[tokio::test]
async fn backfill_between_two_nodes_over_tcp() {
    let source_dir = tempfile::tempdir().expect("tempdir");
    let target_dir = tempfile::tempdir().expect("tempdir");
    let source = std::sync::Arc::new(open(source_dir.path()));
    let mut last = None;
    for i in 0..20 {
        let version = source
            .put(format!("key{i:02}").as_bytes(), format!("v{i}").as_bytes())
            .await
            .expect("put");
        last = Some(version);
    }
    let last = last.expect("writes");

    let shutdown = CancellationToken::new();
    let (addr, server) = serve(source.clone(), &shutdown).await;

    {
        let target = open(target_dir.path());
        let token = CancellationToken::new();
        let summary = tokio::time::timeout(
            STEP_TIMEOUT,
            target.pull(&addr, &KeyRange::full(), &token),
        )
        .await
        .expect("pull timed out")
        .expect("pull");
        assert_eq!(summary.entries_written, 20);
        assert!(summary.sub_pieces >= 7);
        assert_eq!(
            target.store().metainfo().expect("metainfo"),
            source.store().metainfo().expect("metainfo")
        );
    }

    // Everything the pull wrote is durable across a reopen.
    let target = open(target_dir.path());
    for i in 0..20 {
        assert_eq!(value(&target, &format!("key{i:02}")), Some(format!("v{i}")));
    }
    assert!(target.history().contains(last.branch));
    let report = target.inspect().await.expect("inspect");
    assert_eq!(report.keys, 20);
    assert_eq!(report.metainfo.len(), 1);

    // A second pull finds nothing to move.
    let summary = tokio::time::timeout(
        STEP_TIMEOUT,
        target.pull(&addr, &KeyRange::full(), &CancellationToken::new()),
    )
    .await
    .expect("pull timed out")
    .expect("pull");
    assert_eq!(summary.entries_written, 0);

    shutdown.cancel();
    tokio::time::timeout(STEP_TIMEOUT, server)
        .await
        .expect("server stops")
        .expect("server task");
}

#[tokio::test]
async fn divergent_write_is_rolled_back_over_tcp() {
    let source_dir = tempfile::tempdir().expect("tempdir");
    let target_dir = tempfile::tempdir().expect("tempdir");
    let source = std::sync::Arc::new(open(source_dir.path()));
    source.put(b"a", b"1").await.expect("put");
    source.put(b"b", b"2").await.expect("put");

    let shutdown = CancellationToken::new();
    let (addr, _server) = serve(source.clone(), &shutdown).await;
    let target = open(target_dir.path());
    let region = KeyRange::full();
    tokio::time::timeout(STEP_TIMEOUT, target.pull(&addr, &region, &CancellationToken::new()))
        .await
        .expect("pull timed out")
        .expect("first pull");

    // Both sides now write independently.
    let diverged = target.put(b"c", b"local").await.expect("target put");
    source.put(b"d", b"4").await.expect("source put");

    let summary = tokio::time::timeout(
        STEP_TIMEOUT,
        target.pull(&addr, &region, &CancellationToken::new()),
    )
    .await
    .expect("pull timed out")
    .expect("second pull");
    assert_eq!(summary.deleted, 1);
    assert_eq!(value(&target, "a").as_deref(), Some("1"));
    assert_eq!(value(&target, "b").as_deref(), Some("2"));
    assert_eq!(value(&target, "c"), None);
    assert_eq!(value(&target, "d").as_deref(), Some("4"));
    assert_eq!(
        target.store().metainfo().expect("metainfo"),
        source.store().metainfo().expect("metainfo")
    );
    // The request carried the target's lineage to the source.
    assert!(source.history().contains(diverged.branch));
    shutdown.cancel();
}

#[tokio::test]
async fn pull_from_dead_peer_leaves_target_untouched() {
    let target_dir = tempfile::tempdir().expect("tempdir");
    let target = open(target_dir.path());
    target.put(b"k", b"v").await.expect("put");
    let before = target.store().metainfo().expect("metainfo");

    let listener = bind("127.0.0.1:0".parse().expect("addr"))
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr").to_string();
    drop(listener);

    let result = tokio::time::timeout(
        STEP_TIMEOUT,
        target.pull(&addr, &KeyRange::full(), &CancellationToken::new()),
    )
    .await
    .expect("pull timed out");
    assert!(result.is_err());
    assert_eq!(target.store().metainfo().expect("metainfo"), before);
    assert_eq!(value(&target, "k").as_deref(), Some("v"));
}
