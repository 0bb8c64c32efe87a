use gluster_tests::{node_config, wait_until, TestCluster, SETTLE_TIMEOUT};
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_nodes_agree_on_one_leader() {
    let cluster = TestCluster::connected(3).await;

    let leader = cluster.wait_for_leader().await;
    let leader_id = cluster.nodes[leader].id.clone();

    for (_, node) in cluster.running() {
        let peers = node.manager.list_peers().await;
        assert_eq!(peers.len(), 2, "{} should know both other nodes", node.id);
        assert_eq!(
            node.manager.get_leader().await.map(|l| l.id).as_deref(),
            Some(leader_id.as_str())
        );
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn losing_the_leader_elects_a_new_one() {
    let mut cluster = TestCluster::connected(3).await;
    let old_leader = cluster.wait_for_leader().await;

    cluster.stop(old_leader).await;

    let new_leader = cluster.wait_for_leader().await;
    assert_ne!(new_leader, old_leader);

    let c = &cluster;
    let old_id = cluster.nodes[old_leader].id.clone();
    let marked_dead = wait_until(SETTLE_TIMEOUT, || {
        let old_id = old_id.clone();
        async move {
            match c.node(new_leader).list_peers().await.into_iter().find(|p| p.id == old_id) {
                Some(peer) => !peer.is_alive(),
                None => true,
            }
        }
    })
    .await;
    assert!(marked_dead);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn survivors_elect_within_two_election_timeouts() {
    let mut cluster = TestCluster::connected(3).await;
    let old_leader = cluster.wait_for_leader().await;
    let bound = Duration::from_millis(2 * node_config("bound", cluster.path()).election_timeout_max_ms);

    cluster.stop(old_leader).await;

    let c = &cluster;
    let elected = wait_until(bound, || async move {
        matches!(c.agreed_leader().await, Some(l) if l != old_leader)
    })
    .await;
    assert!(elected, "no new leader within {:?}", bound);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn min_nodes_holds_back_a_lonely_node() {
    let dir = tempfile::tempdir().unwrap();
    let config = consensus::Config {
        min_nodes: 2,
        ..gluster_tests::node_config("lonely", dir.path())
    };
    let manager = std::sync::Arc::new(consensus::ConsensusManager::new(config).await.unwrap());
    let runner = manager.clone();
    let handle = tokio::spawn(async move { runner.start().await });

    tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
    assert!(!manager.is_leader().await);
    assert!(manager.get_leader().await.is_none());

    manager.shutdown();
    handle.await.unwrap().unwrap();
}
