use gluster_tests::{wait_until, TestCluster, SETTLE_TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_removal_reaches_every_follower() {
    let mut cluster = TestCluster::connected(3).await;
    let leader = cluster.wait_for_leader().await;
    let gone = (0..3).find(|i| *i != leader).unwrap();
    let gone_id = cluster.nodes[gone].id.clone();
    let gone_addr = cluster.nodes[gone].raft_addr().to_string();

    cluster.stop(gone).await;
    let removed = cluster.node(leader).remove_peers(vec![gone_addr]).await.unwrap();
    assert_eq!(removed, 1);

    let c = &cluster;
    let gone_id = gone_id.as_str();
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            for (_, node) in c.running() {
                if node.manager.list_peers().await.iter().any(|p| p.id == gone_id) {
                    return false;
                }
            }
            true
        })
        .await,
        "removed peer is still listed somewhere"
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unreachable_address_is_kept_for_later() {
    let cluster = TestCluster::connected(1).await;
    cluster.wait_for_leader().await;

    let reached = cluster
        .node(0)
        .add_peers(vec!["127.0.0.1:9".to_string()])
        .await
        .unwrap();
    assert_eq!(reached, 0);

    let peers = cluster.node(0).list_peers().await;
    let placeholder = peers.iter().find(|p| p.id == "127.0.0.1:9").unwrap();
    assert!(!placeholder.is_alive());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn invalid_addresses_are_rejected() {
    let cluster = TestCluster::connected(1).await;

    let result = cluster.node(0).add_peers(vec!["not-an-address".to_string()]).await;
    assert!(matches!(result, Err(consensus::ConsensusError::InvalidAddress(_))));

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn other_groups_are_ignored() {
    let cluster = TestCluster::connected(1).await;
    let dir = tempfile::tempdir().unwrap();
    let stranger = consensus::ConsensusManager::new(consensus::Config {
        group: "elsewhere".to_string(),
        ..gluster_tests::node_config("stranger", dir.path())
    })
    .await
    .unwrap();

    let reached = stranger
        .add_peers(vec![cluster.nodes[0].raft_addr().to_string()])
        .await
        .unwrap();
    assert_eq!(reached, 0);
    assert!(!cluster
        .node(0)
        .list_peers()
        .await
        .iter()
        .any(|p| p.id == "stranger"));

    cluster.shutdown().await;
}
