use std::collections::HashMap;

use gluster_tests::{wait_until, TestCluster, TestNode, SETTLE_TIMEOUT};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restart_comes_back_with_table_and_watermark() {
    let mut cluster = TestCluster::connected(1).await;
    cluster.wait_for_leader().await;

    cluster
        .node(0)
        .set(HashMap::from([
            ("a".to_string(), "1".to_string()),
            ("b".to_string(), "2".to_string()),
        ]))
        .await
        .unwrap();
    cluster.node(0).remove(vec!["a".to_string()]).await.unwrap();
    let before = cluster.node(0).local_info().await;

    cluster.stop(0).await;
    let data_dir = cluster.nodes[0].data_dir.clone();
    assert!(data_dir.join("127.0.0.1.gluster.db").exists());

    cluster.nodes[0] = TestNode::launch("node-0", data_dir).await;
    let after = cluster.node(0).local_info().await;
    assert_eq!(after.last_log_id, before.last_log_id);
    assert_eq!(after.log_count, 2);
    assert_eq!(cluster.node(0).get("b").await.as_deref(), Some("2"));
    assert!(cluster.node(0).get("a").await.is_none());

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn restarted_node_remembers_its_peers() {
    let mut cluster = TestCluster::connected(2).await;
    cluster.wait_for_leader().await;

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            c.nodes[0].data_dir.join("127.0.0.1.gluster.db").exists()
        })
        .await
    );
    // Give autosave a tick to capture the directory.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;

    cluster.stop(0).await;
    let data_dir = cluster.nodes[0].data_dir.clone();
    cluster.nodes[0] = TestNode::launch("node-0", data_dir).await;

    let peers = cluster.node(0).list_peers().await;
    assert!(peers.iter().any(|p| p.id == "node-1"));

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            c.node(0)
                .list_peers()
                .await
                .iter()
                .any(|p| p.id == "node-1" && p.is_alive())
        })
        .await,
        "restored peer was never re-greeted"
    );

    cluster.shutdown().await;
}
