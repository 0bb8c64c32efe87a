use std::collections::HashMap;

use gluster_tests::{wait_until, TestCluster, SETTLE_TIMEOUT};

async fn wait_solo_leader(cluster: &TestCluster, i: usize) {
    let c = cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move { c.node(i).is_leader().await }).await,
        "isolated node {} never led itself",
        i
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn healed_partition_keeps_the_longer_history() {
    let cluster = TestCluster::isolated(2).await;
    wait_solo_leader(&cluster, 0).await;
    wait_solo_leader(&cluster, 1).await;

    for i in 0..3 {
        cluster
            .node(0)
            .set(HashMap::from([(format!("a-{}", i), "left".to_string())]))
            .await
            .unwrap();
    }
    cluster
        .node(1)
        .set(HashMap::from([("b-0".to_string(), "right".to_string())]))
        .await
        .unwrap();

    cluster
        .node(1)
        .add_peers(vec![cluster.nodes[0].raft_addr().to_string()])
        .await
        .unwrap();

    let leader = cluster.wait_for_leader().await;
    assert_eq!(leader, 0, "the side with more log entries must win");

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            c.all_have("a-0", "left").await
                && c.all_have("a-2", "left").await
                && c.none_have("b-0").await
        })
        .await,
        "losing side was not resynchronised from the winner"
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_clusters_merge_into_one() {
    let cluster = TestCluster::isolated(4).await;
    cluster
        .node(0)
        .add_peers(vec![cluster.nodes[1].raft_addr().to_string()])
        .await
        .unwrap();
    cluster
        .node(2)
        .add_peers(vec![cluster.nodes[3].raft_addr().to_string()])
        .await
        .unwrap();

    cluster
        .node(1)
        .add_peers(vec![cluster.nodes[2].raft_addr().to_string()])
        .await
        .unwrap();

    let leader = cluster.wait_for_leader().await;

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            for (_, node) in c.running() {
                if node.manager.list_peers().await.iter().filter(|p| p.is_alive()).count() < 3 {
                    return false;
                }
            }
            true
        })
        .await,
        "peer lists never converged"
    );

    cluster
        .node(leader)
        .set(HashMap::from([("merged".to_string(), "true".to_string())]))
        .await
        .unwrap();
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move { c.all_have("merged", "true").await }).await
    );

    cluster.shutdown().await;
}
