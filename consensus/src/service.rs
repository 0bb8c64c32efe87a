use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval, timeout, Instant};

use network::{Endpoint, Message, Opcode, Payload, Service};

use crate::raft::RaftNode;
use crate::{ConsensusError, Result};

const SELECTION_CACHE_TTL: Duration = Duration::from_secs(1);

/// Picks an endpoint at random, weighted by `priority`. Unhealthy endpoints
/// are never picked.
pub fn pick_weighted<'a, R: Rng + ?Sized>(endpoints: &'a [Endpoint], rng: &mut R) -> Option<&'a Endpoint> {
    let total: u64 = endpoints
        .iter()
        .filter(|e| e.is_healthy())
        .map(|e| e.priority as u64 * 100)
        .sum();
    if total == 0 {
        return None;
    }

    let target = rng.gen_range(0..total);
    let mut min = 0;
    for endpoint in endpoints.iter().filter(|e| e.is_healthy()) {
        let max = min + endpoint.priority as u64 * 100;
        if target >= min && target < max {
            return Some(endpoint);
        }
        min = max;
    }
    None
}

/// Registered services, replicated from the leader.
#[derive(Debug, Clone, Default)]
pub struct ServiceRegistry {
    services: Arc<RwLock<HashMap<String, Service>>>,
    candidates: Arc<Mutex<HashMap<String, (Instant, Vec<Endpoint>)>>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, name: &str) -> Option<Service> {
        self.services.read().await.get(name).cloned()
    }

    pub async fn all(&self) -> HashMap<String, Service> {
        self.services.read().await.clone()
    }

    pub async fn set(&self, service: Service) {
        self.candidates.lock().await.remove(&service.name);
        self.services.write().await.insert(service.name.clone(), service);
    }

    pub async fn remove(&self, name: &str) -> bool {
        self.candidates.lock().await.remove(name);
        self.services.write().await.remove(name).is_some()
    }

    pub async fn replace(&self, services: HashMap<String, Service>) {
        self.candidates.lock().await.clear();
        *self.services.write().await = services;
    }

    /// Adds services whose names are not registered yet.
    pub async fn merge_missing(&self, services: HashMap<String, Service>) -> usize {
        let mut current = self.services.write().await;
        let mut added = 0;
        for (name, service) in services {
            if !current.contains_key(&name) {
                current.insert(name, service);
                added += 1;
            }
        }
        added
    }

    /// Writes health check results back. `results` holds one status per
    /// endpoint, in endpoint order. Returns true if any status changed.
    pub async fn update_statuses(&self, results: HashMap<String, Vec<u32>>) -> bool {
        let mut services = self.services.write().await;
        let mut changed = false;

        for (name, statuses) in results {
            let Some(service) = services.get_mut(&name) else {
                continue;
            };
            for (endpoint, status) in service.endpoints.iter_mut().zip(statuses) {
                if endpoint.status != status {
                    tracing::info!(
                        "Service {} endpoint {:?} status {} -> {}",
                        name,
                        endpoint.attributes,
                        endpoint.status,
                        status
                    );
                    endpoint.status = status;
                    changed = true;
                }
            }
        }
        drop(services);

        if changed {
            self.candidates.lock().await.clear();
        }
        changed
    }

    /// Healthy endpoints of `name`, cached briefly to absorb bursts.
    async fn candidates(&self, name: &str) -> Result<Vec<Endpoint>> {
        let mut cache = self.candidates.lock().await;
        if let Some((at, endpoints)) = cache.get(name) {
            if at.elapsed() < SELECTION_CACHE_TTL {
                return Ok(endpoints.clone());
            }
        }

        let service = self
            .get(name)
            .await
            .ok_or_else(|| ConsensusError::ServiceNotFound(name.to_string()))?;
        let healthy: Vec<Endpoint> = service
            .endpoints
            .into_iter()
            .filter(|e| e.is_healthy())
            .collect();
        cache.insert(name.to_string(), (Instant::now(), healthy.clone()));
        Ok(healthy)
    }

    pub async fn select(&self, name: &str) -> Result<Endpoint> {
        let candidates = self.candidates(name).await?;
        pick_weighted(&candidates, &mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| ConsensusError::NoHealthyEndpoint(name.to_string()))
    }
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, endpoint: &Endpoint) -> bool;
}

/// `host:port` of an endpoint, if both attributes are set.
fn socket_target(endpoint: &Endpoint) -> Option<String> {
    let host = endpoint.attr("host")?;
    let port = endpoint.attr("port")?;
    Some(format!("{}:{}", host, port))
}

/// Connects, writes `request` (if any) and returns the first bytes the
/// server sends back.
async fn exchange(addr: &str, request: &[u8], limit: Duration) -> Option<Vec<u8>> {
    let round_trip = async {
        let mut stream = TcpStream::connect(addr).await?;
        if !request.is_empty() {
            stream.write_all(request).await?;
        }
        let mut buf = vec![0u8; 128];
        let n = stream.read(&mut buf).await?;
        buf.truncate(n);
        Ok::<_, std::io::Error>(buf)
    };

    match timeout(limit, round_trip).await {
        Ok(Ok(reply)) if !reply.is_empty() => Some(reply),
        Ok(Err(e)) => {
            tracing::debug!("Health check of {} failed: {}", addr, e);
            None
        }
        _ => None,
    }
}

/// GETs the endpoint's `check` url, falling back to `url`. Healthy on 200.
pub struct HttpCheck {
    client: reqwest::Client,
}

impl HttpCheck {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

#[async_trait]
impl HealthCheck for HttpCheck {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let Some(url) = endpoint.attr("check").or_else(|| endpoint.attr("url")) else {
            return false;
        };
        match self.client.get(url).send().await {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(e) => {
                tracing::debug!("Health check of {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Healthy if `host:port` accepts a TCP connection.
pub struct TcpCheck {
    timeout: Duration,
}

impl TcpCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthCheck for TcpCheck {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let Some(addr) = socket_target(endpoint) else {
            return false;
        };
        matches!(timeout(self.timeout, TcpStream::connect(&addr)).await, Ok(Ok(_)))
    }
}

/// Sends `PING`; any `+PONG`, or an auth error, means the server is up.
pub struct RedisCheck {
    timeout: Duration,
}

impl RedisCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthCheck for RedisCheck {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let Some(addr) = socket_target(endpoint) else {
            return false;
        };
        match exchange(&addr, b"PING\r\n", self.timeout).await {
            Some(reply) => reply.starts_with(b"+PONG") || reply.starts_with(b"-NOAUTH"),
            None => false,
        }
    }
}

/// Sends an `SSLRequest`; a postgres server answers with a single `S` or `N`.
pub struct PostgresCheck {
    timeout: Duration,
}

impl PostgresCheck {
    const SSL_REQUEST: [u8; 8] = [0, 0, 0, 8, 0x04, 0xd2, 0x16, 0x2f];

    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthCheck for PostgresCheck {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let Some(addr) = socket_target(endpoint) else {
            return false;
        };
        matches!(
            exchange(&addr, &Self::SSL_REQUEST, self.timeout).await.as_deref(),
            Some([b'S', ..]) | Some([b'N', ..])
        )
    }
}

/// Reads the initial handshake packet. Byte 4 is the protocol version (10),
/// or 0xff when the server refuses us, which still means it is up.
pub struct MysqlCheck {
    timeout: Duration,
}

impl MysqlCheck {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HealthCheck for MysqlCheck {
    async fn check(&self, endpoint: &Endpoint) -> bool {
        let Some(addr) = socket_target(endpoint) else {
            return false;
        };
        match exchange(&addr, &[], self.timeout).await {
            Some(reply) => reply.len() > 4 && matches!(reply[4], 10 | 0xff),
            None => false,
        }
    }
}

/// Health check strategies keyed by service type.
pub struct HealthChecker {
    checks: RwLock<HashMap<String, Arc<dyn HealthCheck>>>,
}

impl HealthChecker {
    pub fn new(timeout: Duration) -> Self {
        let http: Arc<dyn HealthCheck> = Arc::new(HttpCheck::new(timeout));
        let postgres: Arc<dyn HealthCheck> = Arc::new(PostgresCheck::new(timeout));

        let mut checks: HashMap<String, Arc<dyn HealthCheck>> = HashMap::new();
        for kind in ["web", "http", "https"] {
            checks.insert(kind.to_string(), http.clone());
        }
        for kind in ["pgsql", "postgres"] {
            checks.insert(kind.to_string(), postgres.clone());
        }
        checks.insert("mysql".to_string(), Arc::new(MysqlCheck::new(timeout)));
        checks.insert("redis".to_string(), Arc::new(RedisCheck::new(timeout)));
        checks.insert("tcp".to_string(), Arc::new(TcpCheck::new(timeout)));

        Self {
            checks: RwLock::new(checks),
        }
    }

    /// Installs or replaces the check used for services of type `kind`.
    pub async fn register(&self, kind: &str, check: Arc<dyn HealthCheck>) {
        self.checks.write().await.insert(kind.to_string(), check);
    }

    /// `None` for types we do not know how to check; their status is left
    /// alone.
    pub async fn check(&self, kind: &str, endpoint: &Endpoint) -> Option<bool> {
        let check = self.checks.read().await.get(kind).cloned()?;
        Some(check.check(endpoint).await)
    }
}

impl RaftNode {
    /// Leader only: checks every endpoint and replicates status changes.
    pub(crate) async fn service_check_loop(&self) -> Result<()> {
        let mut ticker = interval(Duration::from_millis(self.config.service_check_interval_ms));

        loop {
            ticker.tick().await;
            if !self.is_running() {
                return Ok(());
            }
            if !self.is_leader().await {
                continue;
            }

            if self.check_services().await {
                self.bump_service_log_id().await;
                self.publish_services().await;
            }
        }
    }

    async fn check_services(&self) -> bool {
        let services = self.services.all().await;

        let checks = services.values().map(|service| async move {
            let statuses = join_all(service.endpoints.iter().map(|endpoint| async move {
                match self.checker.check(&service.kind, endpoint).await {
                    Some(true) => 1,
                    Some(false) => 0,
                    None => endpoint.status,
                }
            }))
            .await;
            (service.name.clone(), statuses)
        });
        let results: HashMap<String, Vec<u32>> = join_all(checks).await.into_iter().collect();

        self.services.update_statuses(results).await
    }

    pub(crate) async fn set_service_local(&self, service: Service) -> Result<()> {
        self.ensure_leader().await?;
        tracing::info!("Registering service {} ({})", service.name, service.kind);
        self.services.set(service).await;
        self.bump_service_log_id().await;
        self.publish_services().await;
        Ok(())
    }

    pub(crate) async fn remove_service_local(&self, names: &[String]) -> Result<usize> {
        self.ensure_leader().await?;
        let mut removed = 0;
        for name in names {
            if self.services.remove(name).await {
                tracing::info!("Removed service {}", name);
                removed += 1;
            }
        }
        if removed > 0 {
            self.bump_service_log_id().await;
            self.publish_services().await;
        }
        Ok(removed)
    }

    async fn ensure_leader(&self) -> Result<()> {
        let state = self.state.read().await;
        if state.is_leader() {
            Ok(())
        } else {
            Err(ConsensusError::NotLeader(state.leader_id()))
        }
    }

    /// SERVICE_SET / SERVICE_REMOVE forwarded by a follower.
    pub(crate) async fn handle_service_change(&self, message: Message) -> Message {
        let result = match (message.head, message.body) {
            (Opcode::ServiceSet, Payload::Service(service)) => self.set_service_local(service).await,
            (Opcode::ServiceRemove, Payload::Names(names)) => {
                self.remove_service_local(&names).await.map(|_| ())
            }
            _ => return self.error_reply("unexpected service payload").await,
        };

        match result {
            Ok(()) => Message::empty(Opcode::Response, self.local_info().await),
            Err(e) => self.error_reply(&e.to_string()).await,
        }
    }

    /// Service ids are microsecond timestamps, kept strictly increasing.
    pub(crate) async fn bump_service_log_id(&self) -> u64 {
        let mut state = self.state.write().await;
        let now = chrono::Utc::now().timestamp_micros().max(0) as u64;
        state.last_service_log_id = (state.last_service_log_id + 1).max(now);
        self.save_signal.notify_one();
        state.last_service_log_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    fn endpoint(name: &str, priority: u32) -> Endpoint {
        Endpoint::new(BTreeMap::from([("host".to_string(), name.to_string())]), priority)
    }

    #[test]
    fn weighted_selection_follows_priorities() {
        let endpoints = vec![endpoint("a", 1), endpoint("b", 1), endpoint("c", 2)];
        let mut rng = StdRng::seed_from_u64(2024);
        let mut counts: HashMap<String, usize> = HashMap::new();

        for _ in 0..10_000 {
            let picked = pick_weighted(&endpoints, &mut rng).unwrap();
            *counts.entry(picked.attr("host").unwrap().to_string()).or_default() += 1;
        }

        let share = |name: &str| counts[name] as f64 / 10_000.0;
        assert!((share("a") - 0.25).abs() < 0.05);
        assert!((share("b") - 0.25).abs() < 0.05);
        assert!((share("c") - 0.50).abs() < 0.05);
    }

    #[test]
    fn unhealthy_endpoints_are_skipped() {
        let mut down = endpoint("down", 5);
        down.status = 0;
        let endpoints = vec![down, endpoint("up", 1)];
        let mut rng = StdRng::seed_from_u64(1);

        for _ in 0..100 {
            assert_eq!(pick_weighted(&endpoints, &mut rng).unwrap().attr("host"), Some("up"));
        }

        let mut all_down = endpoint("x", 1);
        all_down.status = 0;
        assert!(pick_weighted(&[all_down], &mut rng).is_none());
    }

    #[tokio::test]
    async fn select_reports_missing_and_unhealthy_services() {
        let registry = ServiceRegistry::new();
        assert!(matches!(
            registry.select("nope").await,
            Err(ConsensusError::ServiceNotFound(_))
        ));

        let mut down = endpoint("a", 1);
        down.status = 0;
        registry
            .set(Service {
                name: "db".to_string(),
                kind: "mysql".to_string(),
                endpoints: vec![down],
            })
            .await;
        assert!(matches!(
            registry.select("db").await,
            Err(ConsensusError::NoHealthyEndpoint(_))
        ));
    }

    #[tokio::test]
    async fn status_updates_report_changes_and_reset_the_cache() {
        let registry = ServiceRegistry::new();
        registry
            .set(Service {
                name: "db".to_string(),
                kind: "mysql".to_string(),
                endpoints: vec![endpoint("a", 1), endpoint("b", 1)],
            })
            .await;
        assert!(registry.select("db").await.is_ok());

        assert!(!registry.update_statuses(HashMap::from([("db".to_string(), vec![1, 1])])).await);
        assert!(registry.update_statuses(HashMap::from([("db".to_string(), vec![0, 0])])).await);
        assert!(registry.select("db").await.is_err());
    }

    #[tokio::test]
    async fn tcp_check_sees_a_listening_port() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let check = TcpCheck::new(Duration::from_millis(500));

        let live = Endpoint::new(
            BTreeMap::from([
                ("host".to_string(), "127.0.0.1".to_string()),
                ("port".to_string(), port.to_string()),
            ]),
            1,
        );
        assert!(check.check(&live).await);

        drop(listener);
        assert!(!check.check(&endpoint("127.0.0.1", 1)).await);
    }

    #[tokio::test]
    async fn unknown_types_keep_their_status() {
        let checker = HealthChecker::new(Duration::from_millis(100));
        assert_eq!(checker.check("smtp", &endpoint("a", 1)).await, None);
    }

    fn local_endpoint(port: u16) -> Endpoint {
        Endpoint::new(
            BTreeMap::from([
                ("host".to_string(), "127.0.0.1".to_string()),
                ("port".to_string(), port.to_string()),
            ]),
            1,
        )
    }

    /// Answers every connection with `reply`, either right away (`greet`)
    /// or after the first read.
    async fn fake_server(reply: &'static [u8], greet: bool) -> Endpoint {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                if !greet {
                    let mut buf = [0u8; 64];
                    let _ = stream.read(&mut buf).await;
                }
                let _ = stream.write_all(reply).await;
            }
        });
        local_endpoint(port)
    }

    #[tokio::test]
    async fn redis_check_expects_a_pong() {
        let check = RedisCheck::new(Duration::from_millis(500));
        assert!(check.check(&fake_server(b"+PONG\r\n", false).await).await);
        assert!(!check.check(&fake_server(b"HTTP/1.1 400 Bad Request\r\n", false).await).await);
    }

    #[tokio::test]
    async fn postgres_check_reads_the_ssl_answer() {
        let check = PostgresCheck::new(Duration::from_millis(500));
        assert!(check.check(&fake_server(b"N", false).await).await);
        assert!(!check.check(&fake_server(b"+PONG\r\n", false).await).await);
    }

    #[tokio::test]
    async fn mysql_check_reads_the_handshake() {
        let check = MysqlCheck::new(Duration::from_millis(300));
        let greeting: &'static [u8] = &[0x0a, 0, 0, 0, 10, b'8', b'.', b'0', 0];
        assert!(check.check(&fake_server(greeting, true).await).await);

        // Accepts connections but never speaks.
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        assert!(!check.check(&local_endpoint(port)).await);
    }

    struct AlwaysDown;

    #[async_trait]
    impl HealthCheck for AlwaysDown {
        async fn check(&self, _endpoint: &Endpoint) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn registered_checks_override_by_type() {
        let checker = HealthChecker::new(Duration::from_millis(100));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live = local_endpoint(listener.local_addr().unwrap().port());
        assert_eq!(checker.check("tcp", &live).await, Some(true));

        checker.register("tcp", Arc::new(AlwaysDown)).await;
        checker.register("smtp", Arc::new(AlwaysDown)).await;
        assert_eq!(checker.check("tcp", &live).await, Some(false));
        assert_eq!(checker.check("smtp", &live).await, Some(false));
    }
}
