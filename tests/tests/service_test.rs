use std::collections::BTreeMap;

use consensus::{ConsensusError, Endpoint, Service};
use gluster_tests::{wait_until, TestCluster, SETTLE_TIMEOUT};

fn endpoint(host: &str, priority: u32) -> Endpoint {
    Endpoint::new(
        BTreeMap::from([
            ("host".to_string(), host.to_string()),
            ("port".to_string(), "1".to_string()),
        ]),
        priority,
    )
}

fn service(name: &str, kind: &str, endpoints: Vec<Endpoint>) -> Service {
    Service {
        name: name.to_string(),
        kind: kind.to_string(),
        endpoints,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn services_set_on_a_follower_reach_everyone() {
    let cluster = TestCluster::connected(3).await;
    let follower = cluster.follower().await;

    cluster
        .node(follower)
        .set_service(service("cache", "custom", vec![endpoint("10.0.0.1", 1), endpoint("10.0.0.2", 3)]))
        .await
        .unwrap();

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            for (_, node) in c.running() {
                if node.manager.get_service("cache").await.is_none() {
                    return false;
                }
            }
            true
        })
        .await
    );

    for (_, node) in cluster.running() {
        let picked = node.manager.select_service_endpoint("cache").await.unwrap();
        assert!(matches!(picked.attr("host"), Some("10.0.0.1") | Some("10.0.0.2")));
    }

    cluster.node(follower).remove_service("cache").await.unwrap();
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            for (_, node) in c.running() {
                if node.manager.get_service("cache").await.is_some() {
                    return false;
                }
            }
            true
        })
        .await
    );

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn leader_marks_dead_backends_unhealthy() {
    let cluster = TestCluster::connected(2).await;
    let leader = cluster.wait_for_leader().await;

    let live = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let live_port = live.local_addr().unwrap().port().to_string();
    let healthy = Endpoint::new(
        BTreeMap::from([
            ("host".to_string(), "127.0.0.1".to_string()),
            ("port".to_string(), live_port),
        ]),
        1,
    );
    let dead = endpoint("127.0.0.1", 1);

    cluster
        .node(leader)
        .set_service(service("db", "tcp", vec![healthy, dead]))
        .await
        .unwrap();

    let c = &cluster;
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            for (_, node) in c.running() {
                let Some(db) = node.manager.get_service("db").await else {
                    return false;
                };
                let statuses: Vec<u32> = db.endpoints.iter().map(|e| e.status).collect();
                if statuses != vec![1, 0] {
                    return false;
                }
            }
            true
        })
        .await,
        "health status never replicated"
    );

    for _ in 0..20 {
        let picked = cluster.node(leader).select_service_endpoint("db").await.unwrap();
        assert_ne!(picked.attr("port"), Some("1"));
    }

    drop(live);
    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_service_is_reported() {
    let cluster = TestCluster::connected(1).await;
    cluster.wait_for_leader().await;

    assert!(matches!(
        cluster.node(0).select_service_endpoint("nope").await,
        Err(ConsensusError::ServiceNotFound(_))
    ));
    assert!(matches!(
        cluster.node(0).remove_service("nope").await,
        Err(ConsensusError::ServiceNotFound(_))
    ));
    assert!(cluster.node(0).services().await.is_empty());

    cluster.shutdown().await;
}
