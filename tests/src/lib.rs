//! In-process cluster harness: every node runs on loopback with ephemeral
//! ports and its own scratch directory, with timings short enough for tests.

use std::future::Future;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use consensus::{ConsensusManager, NodeInfo};
use tempfile::TempDir;
use tokio::task::JoinHandle;

pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(15);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

pub fn node_config(id: &str, data_dir: &Path) -> consensus::Config {
    consensus::Config {
        group: "it".to_string(),
        node_id: Some(id.to_string()),
        node_name: id.to_string(),
        node_ip: "127.0.0.1".parse().unwrap(),
        raft_port: 0,
        repl_port: 0,
        data_dir: data_dir.to_path_buf(),
        election_timeout_min_ms: 300,
        election_timeout_max_ms: 600,
        heartbeat_interval_ms: 50,
        repl_heartbeat_interval_ms: 100,
        autosave_interval_ms: 100,
        log_clean_interval_ms: 500,
        peers_sync_interval_ms: 300,
        discovery_interval_ms: 1000,
        service_check_interval_ms: 200,
        tcp_timeout_ms: 300,
        tcp_retry_count: 1,
        tcp_retry_backoff_ms: 20,
        ..consensus::Config::default()
    }
}

/// Polls `check` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

pub struct TestNode {
    pub id: String,
    pub data_dir: PathBuf,
    pub manager: Arc<ConsensusManager>,
    handle: Option<JoinHandle<consensus::Result<()>>>,
}

impl TestNode {
    pub async fn launch(id: &str, data_dir: PathBuf) -> Self {
        std::fs::create_dir_all(&data_dir).unwrap();
        let manager = Arc::new(
            ConsensusManager::new(node_config(id, &data_dir))
                .await
                .unwrap(),
        );
        let runner = manager.clone();
        let handle = tokio::spawn(async move { runner.start().await });

        Self {
            id: id.to_string(),
            data_dir,
            manager,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn raft_addr(&self) -> SocketAddr {
        self.manager.raft_addr()
    }

    pub async fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.manager.shutdown();
            handle.await.unwrap().unwrap();
        }
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    dir: TempDir,
}

impl TestCluster {
    /// `size` nodes that do not know about each other yet.
    pub async fn isolated(size: usize) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let mut nodes = Vec::with_capacity(size);
        for i in 0..size {
            let id = format!("node-{}", i);
            let data_dir = dir.path().join(&id);
            nodes.push(TestNode::launch(&id, data_dir).await);
        }
        Self { nodes, dir }
    }

    /// `size` nodes introduced to each other.
    pub async fn connected(size: usize) -> Self {
        let cluster = Self::isolated(size).await;
        for i in 0..size {
            cluster.introduce(i).await;
        }
        cluster
    }

    /// Adds every other running node to node `i`.
    pub async fn introduce(&self, i: usize) {
        let others: Vec<String> = self
            .nodes
            .iter()
            .enumerate()
            .filter(|(j, n)| *j != i && n.is_running())
            .map(|(_, n)| n.raft_addr().to_string())
            .collect();
        if !others.is_empty() {
            self.node(i).add_peers(others).await.unwrap();
        }
    }

    pub fn node(&self, i: usize) -> &Arc<ConsensusManager> {
        &self.nodes[i].manager
    }

    pub fn running(&self) -> impl Iterator<Item = (usize, &TestNode)> {
        self.nodes.iter().enumerate().filter(|(_, n)| n.is_running())
    }

    /// The leader every running node agrees on, if there is exactly one.
    pub async fn agreed_leader(&self) -> Option<usize> {
        let mut leaders = Vec::new();
        let mut views = Vec::new();
        for (i, node) in self.running() {
            if node.manager.is_leader().await {
                leaders.push(i);
            }
            views.push(node.manager.get_leader().await.map(|l: NodeInfo| l.id));
        }

        let [leader] = leaders[..] else {
            return None;
        };
        let leader_id = &self.nodes[leader].id;
        views
            .iter()
            .all(|v| v.as_deref() == Some(leader_id.as_str()))
            .then_some(leader)
    }

    pub async fn wait_for_leader(&self) -> usize {
        let deadline = tokio::time::Instant::now() + SETTLE_TIMEOUT;
        loop {
            if let Some(leader) = self.agreed_leader().await {
                return leader;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "cluster never agreed on a single leader"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// A running node other than the current leader.
    pub async fn follower(&self) -> usize {
        let leader = self.wait_for_leader().await;
        self.running()
            .map(|(i, _)| i)
            .find(|i| *i != leader)
            .expect("cluster has no follower")
    }

    pub async fn stop(&mut self, i: usize) {
        self.nodes[i].stop().await;
    }

    /// Starts node `i` again from its snapshot and reintroduces it.
    pub async fn restart(&mut self, i: usize) {
        self.nodes[i].stop().await;
        let id = self.nodes[i].id.clone();
        let data_dir = self.nodes[i].data_dir.clone();
        self.nodes[i] = TestNode::launch(&id, data_dir).await;
        self.introduce(i).await;
    }

    /// True once every running node holds `key = value`.
    pub async fn all_have(&self, key: &str, value: &str) -> bool {
        for (_, node) in self.running() {
            if node.manager.get(key).await.as_deref() != Some(value) {
                return false;
            }
        }
        true
    }

    pub async fn none_have(&self, key: &str) -> bool {
        for (_, node) in self.running() {
            if node.manager.get(key).await.is_some() {
                return false;
            }
        }
        true
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub async fn shutdown(mut self) {
        for node in &mut self.nodes {
            node.stop().await;
        }
    }
}
