use std::collections::HashMap;

use gluster_tests::{wait_until, TestCluster, SETTLE_TIMEOUT};

fn items(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_write_reaches_every_follower_before_returning() {
    let cluster = TestCluster::connected(3).await;
    let leader = cluster.wait_for_leader().await;

    cluster
        .node(leader)
        .set(items(&[("color", "blue"), ("size", "xl")]))
        .await
        .unwrap();

    assert!(cluster.all_have("color", "blue").await);
    assert!(cluster.all_have("size", "xl").await);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn follower_writes_are_forwarded_to_the_leader() {
    let cluster = TestCluster::connected(3).await;
    let follower = cluster.follower().await;

    cluster
        .node(follower)
        .set(items(&[("forwarded", "yes")]))
        .await
        .unwrap();
    let c = &cluster;
    assert!(wait_until(SETTLE_TIMEOUT, || async move { c.all_have("forwarded", "yes").await }).await);

    cluster
        .node(follower)
        .remove(vec!["forwarded".to_string()])
        .await
        .unwrap();
    assert!(wait_until(SETTLE_TIMEOUT, || async move { c.none_have("forwarded").await }).await);

    let leader = cluster.wait_for_leader().await;
    let leader_info = cluster.node(leader).local_info().await;
    assert_eq!(leader_info.log_count, 2);
    for (_, node) in cluster.running() {
        assert_eq!(node.manager.local_info().await.last_log_id, leader_info.last_log_id);
    }

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn late_joiner_catches_up() {
    let mut cluster = TestCluster::connected(3).await;
    let leader = cluster.wait_for_leader().await;
    let late = (0..3).find(|i| *i != leader).unwrap();

    cluster.stop(late).await;
    for i in 0..5 {
        cluster
            .node(leader)
            .set(items(&[(&format!("key-{}", i), "v")]))
            .await
            .unwrap();
    }

    cluster.restart(late).await;

    let c = &cluster;
    let caught_up = wait_until(SETTLE_TIMEOUT, || async move {
        for i in 0..5 {
            if c.node(late).get(&format!("key-{}", i)).await.is_none() {
                return false;
            }
        }
        true
    })
    .await;
    assert!(caught_up, "restarted node never received the missed writes");

    let leader = cluster.wait_for_leader().await;
    assert_eq!(
        cluster.node(late).local_info().await.last_log_id,
        cluster.node(leader).local_info().await.last_log_id
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn brand_new_node_receives_the_full_table() {
    let mut cluster = TestCluster::connected(2).await;
    let leader = cluster.wait_for_leader().await;
    cluster
        .node(leader)
        .set(items(&[("a", "1"), ("b", "2")]))
        .await
        .unwrap();

    let data_dir = cluster.path().join("node-2");
    cluster
        .nodes
        .push(gluster_tests::TestNode::launch("node-2", data_dir).await);
    cluster.introduce(2).await;

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            c.node(2).get("a").await.as_deref() == Some("1")
                && c.node(2).get("b").await.as_deref() == Some("2")
        })
        .await
    );

    cluster.shutdown().await;
}
