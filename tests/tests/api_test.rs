use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::TcpListener;

use gluster_tests::{wait_until, TestCluster, SETTLE_TIMEOUT};

/// Serves the HTTP API of every node on an ephemeral port.
async fn serve_api(cluster: &TestCluster) -> Vec<String> {
    let mut urls = Vec::new();
    for node in &cluster.nodes {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        urls.push(format!("http://{}", listener.local_addr().unwrap()));

        let server = Arc::new(api::Server::new(api::Config::default(), node.manager.clone()));
        tokio::spawn(async move { server.serve(listener).await });
    }
    urls
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_writes_on_any_node_are_readable_everywhere() {
    let cluster = TestCluster::connected(3).await;
    let follower = cluster.follower().await;
    let urls = serve_api(&cluster).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/kv", urls[follower]))
        .json(&json!({"name": "gluster", "lang": "rust"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    for url in &urls {
        let client = &client;
        let ok = wait_until(SETTLE_TIMEOUT, || async move {
            let Ok(response) = client.get(format!("{}/kv?k=name", url)).send().await else {
                return false;
            };
            let Ok(body) = response.json::<Value>().await else {
                return false;
            };
            body["value"] == "gluster"
        })
        .await;
        assert!(ok, "{} never served the value", url);
    }

    let all: Value = client
        .get(format!("{}/kv", urls[0]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(all["lang"], "rust");

    let response = client
        .delete(format!("{}/kv?k=name,lang", urls[follower]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let c = &cluster;
    assert!(wait_until(SETTLE_TIMEOUT, || async move { c.none_have("name").await }).await);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_node_and_health_views() {
    let cluster = TestCluster::connected(2).await;
    let leader = cluster.wait_for_leader().await;
    let urls = serve_api(&cluster).await;
    let client = reqwest::Client::new();

    let nodes: Value = client
        .get(format!("{}/node", urls[0]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(nodes["local"]["id"], "node-0");
    assert_eq!(nodes["peers"].as_array().unwrap().len(), 1);
    assert_eq!(nodes["leader"]["id"], cluster.nodes[leader].id.as_str());

    let health: Value = client
        .get(format!("{}/health", urls[1]))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["leader"], cluster.nodes[leader].id.as_str());

    let response = client
        .post(format!("{}/node", urls[0]))
        .json(&json!(["not an address"]))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);

    cluster.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn http_service_balance() {
    let cluster = TestCluster::connected(2).await;
    let follower = cluster.follower().await;
    let urls = serve_api(&cluster).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/service", urls[follower]))
        .json(&json!({
            "name": "search",
            "type": "custom",
            "endpoints": [
                {"attributes": {"url": "http://10.0.0.1"}, "priority": 1},
                {"attributes": {"url": "http://10.0.0.2"}, "priority": 2}
            ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 204);

    let client = &client;
    let url = &urls[follower];
    assert!(
        wait_until(SETTLE_TIMEOUT, || async move {
            match client.get(format!("{}/balance?name=search", url)).send().await {
                Ok(response) => response.status() == 200,
                Err(_) => false,
            }
        })
        .await
    );

    let missing = client
        .get(format!("{}/balance?name=unknown", urls[0]))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);

    cluster.shutdown().await;
}
