//! The cluster facade: owns the topology snapshot, the key-value session
//! set, the HTTP pool and the reporters; routes typed requests; adopts new
//! configurations and reconciles sessions against them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::analytics::{execute_analytics, AnalyticsRequest, AnalyticsResponse};
use crate::config::ClusterOptions;
use crate::diag::{
    duration_us, DiagnosticsResult, EndpointDiagInfo, EndpointPingInfo, EndpointState,
    PingResult, PingState,
};
use crate::http::pool::HttpSessionPool;
use crate::http::{ChunkSink, HttpRequest, HttpResponse};
use crate::kv::dispatch::{self, KvRouter};
use crate::kv::operations::{KvRequest, KvResponse};
use crate::kv::session::{KvSession, SessionState};
use crate::query::{execute_query, QueryRequest, QueryResponse};
use crate::reporter::ThresholdLoggingTracer;
use crate::service::ServiceType;
use crate::topology::{ClusterConfig, ConfigVersion, DEFAULT_NETWORK};

const DEFAULT_KV_PORT: u16 = 11210;
const DEFAULT_KV_TLS_PORT: u16 = 11207;

struct ClusterInner {
    client_id: String,
    options: Arc<ClusterOptions>,
    network: RwLock<String>,
    config: RwLock<Option<Arc<ClusterConfig>>>,
    config_installed: Notify,
    /// Sessions keyed by `host:port` endpoint; revalidated against the
    /// current snapshot on every dispatch.
    sessions: Mutex<HashMap<String, KvSession>>,
    draining: Mutex<Vec<KvSession>>,
    bucket: RwLock<Option<String>>,
    http_pool: Arc<HttpSessionPool>,
    reporter: Arc<ThresholdLoggingTracer>,
    config_tx: mpsc::UnboundedSender<ClusterConfig>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

/// Entry point of the client: one instance per cluster.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<ClusterInner>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("client_id", &self.inner.client_id)
            .field("bucket", &*self.inner.bucket.read())
            .finish()
    }
}

impl ClusterInner {
    fn current_config(&self) -> Option<Arc<ClusterConfig>> {
        self.config.read().clone()
    }

    fn ensure_open(&self) -> ShoalResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ShoalError::with_message(
                ErrorKind::RequestCanceled,
                "cluster is closed",
            ));
        }
        Ok(())
    }

    fn endpoint_of(&self, config: &ClusterConfig, node_index: usize) -> Option<String> {
        let network = self.network.read().clone();
        let tls = self.options.security.enabled;
        let node = config.nodes.get(node_index)?;
        let port = node.port(&network, ServiceType::KeyValue, tls);
        if port == 0 {
            return None;
        }
        Some(format!("{}:{port}", node.hostname_for(&network)))
    }

    /// Adopt `config` iff it strictly supersedes the current snapshot.
    fn try_adopt(&self, config: ClusterConfig) -> bool {
        let mut slot = self.config.write();
        let current = slot.as_ref().map(|c| c.version);
        if let Some(current) = current {
            if config.version <= current {
                debug!(
                    proposed = %config.version,
                    current = %current,
                    "ignoring stale or equal configuration"
                );
                return false;
            }
        }
        let config = Arc::new(config);
        info!(version = %config.version, nodes = config.nodes.len(), "adopting configuration");
        *slot = Some(Arc::clone(&config));
        drop(slot);
        let network = self.network.read().clone();
        self.http_pool.set_configuration(config, &network);
        self.config_installed.notify_waiters();
        true
    }

    /// Bring the session set in line with the current snapshot: open
    /// sessions to new nodes, start draining sessions to removed ones.
    async fn reconcile_sessions(self: &Arc<Self>) {
        let Some(config) = self.current_config() else { return };
        let bucket = self.bucket.read().clone();
        let wanted: HashMap<String, usize> = config
            .nodes
            .iter()
            .filter_map(|node| self.endpoint_of(&config, node.index).map(|ep| (ep, node.index)))
            .collect();

        let stale: Vec<(String, KvSession)> = {
            let mut sessions = self.sessions.lock();
            let stale_keys: Vec<String> = sessions
                .keys()
                .filter(|endpoint| !wanted.contains_key(*endpoint))
                .cloned()
                .collect();
            stale_keys
                .into_iter()
                .filter_map(|key| sessions.remove_entry(&key))
                .collect()
        };
        for (endpoint, session) in stale {
            session.start_draining();
            if session.has_pending() {
                debug!(%endpoint, "session drains out before close");
                self.draining.lock().push(session);
            } else {
                session.close().await;
            }
        }

        for (endpoint, node_index) in wanted {
            let exists = {
                let sessions = self.sessions.lock();
                sessions
                    .get(&endpoint)
                    .is_some_and(|s| !s.is_stopped())
            };
            if exists {
                continue;
            }
            let node = &config.nodes[node_index];
            let network = self.network.read().clone();
            let hostname = node.hostname_for(&network).to_string();
            let port = node.port(
                &network,
                ServiceType::KeyValue,
                self.options.security.enabled,
            );
            match KvSession::connect(
                &hostname,
                port,
                bucket.clone(),
                &self.client_id,
                &self.options,
                self.config_tx.clone(),
            )
            .await
            {
                Ok(session) => {
                    // A concurrent reconcile may have raced us; keep the
                    // live one. A dead entry is simply replaced.
                    let duplicate = {
                        let mut sessions = self.sessions.lock();
                        match sessions.get(&endpoint) {
                            Some(existing) if !existing.is_stopped() => true,
                            _ => {
                                sessions.insert(endpoint, session.clone());
                                false
                            }
                        }
                    };
                    if duplicate {
                        session.close().await;
                    }
                }
                Err(e) => {
                    warn!(%endpoint, error = %e, "failed to open session to node");
                }
            }
        }

        // Close drained sessions that have gone quiet.
        let quiet: Vec<KvSession> = {
            let mut draining = self.draining.lock();
            let mut quiet = Vec::new();
            draining.retain(|session| {
                if session.has_pending() && !session.is_stopped() {
                    true
                } else {
                    quiet.push(session.clone());
                    false
                }
            });
            quiet
        };
        for session in quiet {
            session.close().await;
        }
    }

    fn any_ready_session(&self) -> Option<KvSession> {
        let sessions = self.sessions.lock();
        sessions
            .values()
            .find(|s| s.state() == SessionState::Ready)
            .cloned()
    }
}

impl KvRouter for ClusterInner {
    fn route(&self, request: &KvRequest) -> ShoalResult<(u16, KvSession)> {
        let config = self.current_config().ok_or_else(|| {
            ShoalError::with_message(ErrorKind::ServiceNotAvailable, "no configuration yet")
        })?;
        let (partition, node_index) = config.map_key(request.id.key(), request.replica)?;
        let node_index = node_index.ok_or_else(|| {
            ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                format!("partition {partition} has no node for this request"),
            )
        })?;
        let endpoint = self.endpoint_of(&config, node_index).ok_or_else(|| {
            ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                format!("node {node_index} does not serve the key-value service"),
            )
        })?;
        let session = {
            let sessions = self.sessions.lock();
            sessions
                .get(&endpoint)
                .filter(|s| s.state() == SessionState::Ready)
                .cloned()
        };
        session
            .map(|session| (partition, session))
            .ok_or_else(|| {
                ShoalError::with_message(
                    ErrorKind::ServiceNotAvailable,
                    format!("no ready session for {endpoint}"),
                )
            })
    }
}

impl Cluster {
    /// Bootstrap against the configured seed hosts. Completes once an
    /// initial configuration is installed and at least one session is ready.
    pub async fn connect(options: ClusterOptions) -> ShoalResult<Cluster> {
        if options.seed_hosts.is_empty() {
            return Err(ShoalError::with_message(
                ErrorKind::InvalidArgument,
                "no seed hosts configured",
            ));
        }
        let options = Arc::new(options);
        let client_id = Uuid::new_v4().to_string();
        let reporter = ThresholdLoggingTracer::new(
            options.orphan.clone(),
            options.threshold.clone(),
        );
        let (config_tx, config_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(ClusterInner {
            client_id: client_id.clone(),
            options: Arc::clone(&options),
            network: RwLock::new(DEFAULT_NETWORK.to_string()),
            config: RwLock::new(None),
            config_installed: Notify::new(),
            sessions: Mutex::new(HashMap::new()),
            draining: Mutex::new(Vec::new()),
            bucket: RwLock::new(None),
            http_pool: HttpSessionPool::new(client_id, Arc::clone(&options)),
            reporter,
            config_tx,
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        inner.reporter.start();

        // Config adoption loop: sessions (bootstrap, NMVB payloads, pushes,
        // polls) publish snapshots; only strictly newer ones are adopted.
        let adoption = tokio::spawn({
            let weak = Arc::downgrade(&inner);
            let mut config_rx = config_rx;
            async move {
                while let Some(config) = config_rx.recv().await {
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.try_adopt(config) {
                        inner.reconcile_sessions().await;
                    }
                }
            }
        });
        inner.tasks.lock().push(adoption);

        let cluster = Cluster { inner };
        cluster.bootstrap().await?;

        // Periodic config poll, in case pushes and NMVB payloads dry up.
        let poll = tokio::spawn({
            let weak = Arc::downgrade(&cluster.inner);
            async move {
                let mut ticker =
                    tokio::time::interval(weak.upgrade().map_or(Duration::from_millis(2_500), |i| {
                        i.options.config_poll_interval
                    }));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    let Some(inner) = weak.upgrade() else { return };
                    if inner.closed.load(Ordering::SeqCst) {
                        return;
                    }
                    if let Some(session) = inner.any_ready_session() {
                        let poll = session.fetch_config();
                        let timeout = inner.options.timeouts.key_value_timeout;
                        if tokio::time::timeout(timeout, poll).await.is_err() {
                            debug!("config poll timed out");
                        }
                    }
                }
            }
        });
        cluster.inner.tasks.lock().push(poll);

        Ok(cluster)
    }

    async fn bootstrap(&self) -> ShoalResult<()> {
        let inner = &self.inner;
        let deadline =
            tokio::time::Instant::now() + inner.options.timeouts.bootstrap_timeout;
        let mut last_error: Option<ShoalError> = None;

        for seed in &inner.options.seed_hosts {
            let (hostname, port) = split_seed(seed, inner.options.security.enabled);
            let connect = KvSession::connect(
                &hostname,
                port,
                None,
                &inner.client_id,
                &inner.options,
                inner.config_tx.clone(),
            );
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            let session = match tokio::time::timeout(remaining, connect).await {
                Ok(Ok(session)) => session,
                Ok(Err(e)) => {
                    warn!(seed = %seed, error = %e, "seed bootstrap failed");
                    last_error = Some(e);
                    continue;
                }
                Err(_) => {
                    last_error = Some(ShoalError::with_message(
                        ErrorKind::UnambiguousTimeout,
                        "bootstrap timeout",
                    ));
                    break;
                }
            };

            // Wait for the adoption loop to install the snapshot this
            // session published during its bootstrap.
            let installed = async {
                loop {
                    let notified = inner.config_installed.notified();
                    if inner.current_config().is_some() {
                        break;
                    }
                    notified.await;
                }
            };
            let remaining = deadline
                .checked_duration_since(tokio::time::Instant::now())
                .unwrap_or_default();
            if tokio::time::timeout(remaining, installed).await.is_err() {
                session.close().await;
                last_error = Some(ShoalError::with_message(
                    ErrorKind::UnambiguousTimeout,
                    "no configuration from seed",
                ));
                continue;
            }

            // Pick the network once, from the bootstrap host's vantage.
            if let Some(config) = inner.current_config() {
                let network = inner
                    .options
                    .network
                    .clone()
                    .unwrap_or_else(|| config.select_network(&hostname));
                *inner.network.write() = network.clone();
                inner.http_pool.set_configuration(config.clone(), &network);
                let endpoint = config
                    .nodes
                    .iter()
                    .find(|n| n.this_node)
                    .and_then(|n| inner.endpoint_of(&config, n.index))
                    .unwrap_or_else(|| format!("{hostname}:{port}"));
                // The adoption loop may have raced us to this endpoint.
                let duplicate = {
                    let mut sessions = inner.sessions.lock();
                    if sessions.contains_key(&endpoint) {
                        true
                    } else {
                        sessions.insert(endpoint, session.clone());
                        false
                    }
                };
                if duplicate {
                    session.close().await;
                }
            }
            inner.reconcile_sessions().await;
            info!(client_id = %inner.client_id, "cluster bootstrap complete");
            return Ok(());
        }

        Err(last_error.unwrap_or_else(|| {
            ShoalError::with_message(ErrorKind::ServiceNotAvailable, "all seed hosts failed")
        }))
    }

    /// Ensure a session per node is selected into `name`, and fetch the
    /// bucket's configuration (with its vbucket map).
    pub async fn open_bucket(&self, name: &str) -> ShoalResult<()> {
        self.inner.ensure_open()?;
        *self.inner.bucket.write() = Some(name.to_string());

        let sessions: Vec<KvSession> = {
            let sessions = self.inner.sessions.lock();
            sessions.values().cloned().collect()
        };
        let mut selected = false;
        for session in sessions {
            if session.bucket().as_deref() == Some(name) {
                selected = true;
                continue;
            }
            let select = session.select_bucket(name);
            let timeout = self.inner.options.timeouts.key_value_timeout;
            match tokio::time::timeout(timeout, select).await {
                Ok(Ok(())) => selected = true,
                Ok(Err(e)) => {
                    if e.kind() == ErrorKind::BucketNotFound
                        || e.kind() == ErrorKind::AuthenticationFailure
                    {
                        return Err(e);
                    }
                    warn!(session_id = %session.id(), error = %e, "select bucket failed");
                }
                Err(_) => warn!(session_id = %session.id(), "select bucket timed out"),
            }
        }
        if !selected {
            return Err(ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                "no session available to select the bucket",
            ));
        }

        // The bucket's own config carries the vbucket map.
        if let Some(session) = self.inner.any_ready_session() {
            let timeout = self.inner.options.timeouts.key_value_timeout;
            let _ = tokio::time::timeout(timeout, session.fetch_config()).await;
        }
        Ok(())
    }

    /// Dispatch one typed key-value request.
    pub async fn execute(&self, request: KvRequest) -> ShoalResult<KvResponse> {
        self.inner.ensure_open()?;
        dispatch::execute(
            &*self.inner,
            &self.inner.options,
            &*self.inner.reporter,
            request,
        )
        .await
    }

    /// Dispatch one raw HTTP-service request.
    pub async fn execute_http(&self, request: HttpRequest) -> ShoalResult<HttpResponse> {
        self.inner.ensure_open()?;
        self.inner.http_pool.execute(request).await
    }

    /// Dispatch one raw HTTP-service request, streaming body chunks.
    pub async fn execute_http_streaming(
        &self,
        request: HttpRequest,
        sink: ChunkSink,
    ) -> ShoalResult<HttpResponse> {
        self.inner.ensure_open()?;
        self.inner.http_pool.execute_streaming(request, sink).await
    }

    /// Run a query, consulting the prepared-statement cache for non-adhoc
    /// statements.
    pub async fn query(&self, request: QueryRequest) -> ShoalResult<QueryResponse> {
        self.inner.ensure_open()?;
        execute_query(
            &self.inner.http_pool,
            self.inner.current_config(),
            request,
        )
        .await
    }

    /// Run an analytics statement.
    pub async fn analytics(&self, request: AnalyticsRequest) -> ShoalResult<AnalyticsResponse> {
        self.inner.ensure_open()?;
        execute_analytics(&self.inner.http_pool, request).await
    }

    /// Probe the requested services on every node that hosts them.
    pub async fn ping(
        &self,
        services: Option<Vec<ServiceType>>,
        report_id: Option<String>,
    ) -> ShoalResult<PingResult> {
        self.inner.ensure_open()?;
        let services = services.unwrap_or_else(|| {
            let mut all = vec![ServiceType::KeyValue];
            all.extend(ServiceType::HTTP);
            all
        });
        let mut result =
            PingResult::new(report_id.unwrap_or_else(|| self.inner.client_id.clone()));

        if services.contains(&ServiceType::KeyValue) {
            let sessions: Vec<KvSession> = {
                let sessions = self.inner.sessions.lock();
                sessions.values().cloned().collect()
            };
            let timeout = self.inner.options.timeouts.key_value_timeout;
            for session in sessions {
                let info = match tokio::time::timeout(timeout, session.ping()).await {
                    Ok(Ok(latency)) => EndpointPingInfo {
                        id: session.id().to_string(),
                        latency_us: duration_us(latency),
                        remote: session.remote_addr().to_string(),
                        local: session.local_addr().to_string(),
                        state: PingState::Ok,
                        namespace: session.bucket(),
                        error: None,
                    },
                    Ok(Err(e)) => EndpointPingInfo {
                        id: session.id().to_string(),
                        latency_us: 0,
                        remote: session.remote_addr().to_string(),
                        local: session.local_addr().to_string(),
                        state: PingState::Error,
                        namespace: session.bucket(),
                        error: Some(e.to_string()),
                    },
                    Err(_) => EndpointPingInfo {
                        id: session.id().to_string(),
                        latency_us: duration_us(timeout),
                        remote: session.remote_addr().to_string(),
                        local: session.local_addr().to_string(),
                        state: PingState::Timeout,
                        namespace: session.bucket(),
                        error: None,
                    },
                };
                result.record(ServiceType::KeyValue, info);
            }
        }

        self.inner.http_pool.ping(&services, &mut result).await;
        Ok(result)
    }

    /// Snapshot the state of every session without touching the network.
    pub fn diagnostics(&self, report_id: Option<String>) -> DiagnosticsResult {
        let mut result =
            DiagnosticsResult::new(report_id.unwrap_or_else(|| self.inner.client_id.clone()));
        {
            let sessions = self.inner.sessions.lock();
            for session in sessions.values() {
                result.record(
                    ServiceType::KeyValue,
                    EndpointDiagInfo {
                        id: session.id().to_string(),
                        last_activity_us: duration_us(session.last_activity().elapsed()),
                        remote: session.remote_addr().to_string(),
                        local: session.local_addr().to_string(),
                        state: match session.state() {
                            SessionState::Connecting => EndpointState::Connecting,
                            SessionState::Ready => EndpointState::Connected,
                            SessionState::Draining => EndpointState::Disconnecting,
                            SessionState::Disconnected => EndpointState::Disconnected,
                        },
                        namespace: session.bucket(),
                        details: None,
                    },
                );
            }
        }
        self.inner.http_pool.export_diag_info(&mut result);
        result
    }

    /// Current topology snapshot, if one has been installed.
    pub fn configuration(&self) -> Option<Arc<ClusterConfig>> {
        self.inner.current_config()
    }

    /// Version of the current snapshot.
    pub fn configuration_version(&self) -> Option<ConfigVersion> {
        self.inner.current_config().map(|c| c.version)
    }

    /// Shut everything down: background tasks, reporters (with a final
    /// flush), HTTP sessions, and key-value sessions (completing their
    /// pending requests with `request_canceled`).
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        self.inner.http_pool.close();
        let sessions: Vec<KvSession> = {
            let mut sessions = self.inner.sessions.lock();
            sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close().await;
        }
        let draining: Vec<KvSession> = std::mem::take(&mut *self.inner.draining.lock());
        for session in draining {
            session.close().await;
        }
        self.inner.reporter.close();
        info!(client_id = %self.inner.client_id, "cluster closed");
    }
}

fn split_seed(seed: &str, tls: bool) -> (String, u16) {
    let default_port = if tls {
        DEFAULT_KV_TLS_PORT
    } else {
        DEFAULT_KV_PORT
    };
    match seed.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (seed.to_string(), default_port),
        },
        None => (seed.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seed_splitting() {
        assert_eq!(split_seed("db1.example", false), ("db1.example".into(), 11210));
        assert_eq!(split_seed("db1.example", true), ("db1.example".into(), 11207));
        assert_eq!(
            split_seed("db1.example:12000", false),
            ("db1.example".into(), 12000)
        );
    }

    #[tokio::test]
    async fn connect_requires_seeds() {
        let err = Cluster::connect(ClusterOptions::default()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
