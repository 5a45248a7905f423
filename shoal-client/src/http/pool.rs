//! Per-service pool of keep-alive HTTP sessions.
//!
//! Each service keeps a busy list and an idle list under one mutex.
//! Check-out reuses an idle session when one exists, otherwise connects to
//! the next node offering the service (round-robin from a randomized start).
//! Check-in either parks the session with an idle deadline or drops it; a
//! reaper task closes idle sessions whose deadline passed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use rand::Rng;
use shoal_errors::{ErrorKind, HttpErrorContext, ShoalError, ShoalResult};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::config::ClusterOptions;
use crate::diag::{duration_us, DiagnosticsResult, EndpointPingInfo, PingState};
use crate::prepared::PreparedCache;
use crate::service::ServiceType;
use crate::topology::{ClusterConfig, DEFAULT_NETWORK};

use super::session::HttpSession;
use super::{ChunkSink, HttpRequest, HttpResponse};

#[derive(Default)]
struct ServiceSessions {
    busy: Vec<Arc<HttpSession>>,
    idle: Vec<Arc<HttpSession>>,
}

pub struct HttpSessionPool {
    client_id: String,
    options: Arc<ClusterOptions>,
    config: RwLock<Option<Arc<ClusterConfig>>>,
    network: RwLock<String>,
    next_index: AtomicUsize,
    sessions: Mutex<HashMap<ServiceType, ServiceSessions>>,
    prepared: Arc<PreparedCache>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl HttpSessionPool {
    pub fn new(client_id: String, options: Arc<ClusterOptions>) -> Arc<HttpSessionPool> {
        let pool = Arc::new(HttpSessionPool {
            client_id,
            options,
            config: RwLock::new(None),
            network: RwLock::new(DEFAULT_NETWORK.to_string()),
            next_index: AtomicUsize::new(0),
            sessions: Mutex::new(HashMap::new()),
            prepared: Arc::new(PreparedCache::default()),
            reaper: Mutex::new(None),
        });
        let weak = Arc::downgrade(&pool);
        let reaper = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let Some(pool) = weak.upgrade() else { return };
                pool.evict_expired_idle();
            }
        });
        *pool.reaper.lock() = Some(reaper);
        pool
    }

    /// The prepared-statement cache shared by everything dispatched through
    /// this pool.
    pub fn prepared_cache(&self) -> Arc<PreparedCache> {
        Arc::clone(&self.prepared)
    }

    /// Configured operation timeout for `service`.
    pub fn default_timeout(&self, service: ServiceType) -> std::time::Duration {
        self.options.timeouts.for_service(service)
    }

    /// Install a new topology snapshot; resets round-robin to a random node
    /// so pools across clients do not gang up on the first node.
    pub fn set_configuration(&self, config: Arc<ClusterConfig>, network: &str) {
        let start = if config.nodes.len() > 1 {
            rand::rng().random_range(0..config.nodes.len())
        } else {
            0
        };
        self.next_index.store(start, Ordering::Relaxed);
        *self.network.write() = network.to_string();
        *self.config.write() = Some(config);
    }

    fn next_node(&self, service: ServiceType) -> Option<(String, u16)> {
        let config = self.config.read().clone()?;
        let network = self.network.read().clone();
        let tls = self.options.security.enabled;
        let mut candidates = config.nodes.len();
        while candidates > 0 {
            candidates -= 1;
            let index = self.next_index.fetch_add(1, Ordering::Relaxed) % config.nodes.len();
            let node = &config.nodes[index];
            let port = node.port(&network, service, tls);
            if port != 0 {
                return Some((node.hostname_for(&network).to_string(), port));
            }
        }
        None
    }

    /// Borrow a session for `service`, connecting a new one when the idle
    /// list is empty.
    pub async fn check_out(&self, service: ServiceType) -> ShoalResult<Arc<HttpSession>> {
        loop {
            let reused = {
                let mut sessions = self.sessions.lock();
                let entry = sessions.entry(service).or_default();
                entry.busy.retain(|s| !s.is_stopped());
                entry.idle.pop()
            };
            match reused {
                Some(session) if session.is_stopped() => continue,
                Some(session) => {
                    session.reset_idle();
                    trace!(session_id = %session.id(), %service, "reusing idle http session");
                    self.sessions
                        .lock()
                        .entry(service)
                        .or_default()
                        .busy
                        .push(Arc::clone(&session));
                    return Ok(session);
                }
                None => break,
            }
        }

        let (hostname, port) = self.next_node(service).ok_or_else(|| {
            ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                format!("no node hosts the {service} service"),
            )
        })?;
        let session =
            HttpSession::connect(service, &self.client_id, &hostname, port, &self.options).await?;
        self.sessions
            .lock()
            .entry(service)
            .or_default()
            .busy
            .push(Arc::clone(&session));
        Ok(session)
    }

    /// Return a borrowed session. Dead or keep-alive-less sessions are
    /// dropped; the rest go onto the idle list with an eviction deadline.
    pub fn check_in(&self, service: ServiceType, session: Arc<HttpSession>) {
        let mut sessions = self.sessions.lock();
        let entry = sessions.entry(service).or_default();
        entry.busy.retain(|s| s.id() != session.id());
        if !session.keep_alive() || session.is_stopped() {
            session.stop();
            return;
        }
        session.set_idle(self.options.idle_http_connection_timeout);
        trace!(session_id = %session.id(), %service, "parking http session as idle");
        entry.idle.push(session);
    }

    fn evict_expired_idle(&self) {
        let now = Instant::now();
        let mut sessions = self.sessions.lock();
        for (service, entry) in sessions.iter_mut() {
            entry.idle.retain(|session| {
                if session.is_stopped() || session.idle_expired(now) {
                    debug!(session_id = %session.id(), %service, "evicting idle http session");
                    session.stop();
                    false
                } else {
                    true
                }
            });
        }
    }

    /// Execute one request through a pooled session.
    pub async fn execute(&self, request: HttpRequest) -> ShoalResult<HttpResponse> {
        self.execute_inner(request, None).await
    }

    pub async fn execute_streaming(
        &self,
        request: HttpRequest,
        sink: ChunkSink,
    ) -> ShoalResult<HttpResponse> {
        self.execute_inner(request, Some(sink)).await
    }

    async fn execute_inner(
        &self,
        request: HttpRequest,
        sink: Option<ChunkSink>,
    ) -> ShoalResult<HttpResponse> {
        let service = request.service;
        let session = self.check_out(service).await?;
        let context = HttpErrorContext {
            client_context_id: request.client_context_id.clone().unwrap_or_default(),
            method: request.method.to_string(),
            path: request.path.clone(),
            last_dispatched_to: Some(session.remote_addr().to_string()),
            last_dispatched_from: Some(session.local_addr().to_string()),
            ..Default::default()
        };
        let result = match sink {
            Some(sink) => session.execute_streaming(request, sink).await,
            None => session.execute(request).await,
        };
        self.check_in(service, session);
        result.map_err(|e| {
            let kind = e.kind();
            ShoalError::with_message(kind, e.to_string()).set_http_context(context)
        })
    }

    /// Probe every node hosting each requested HTTP service.
    pub async fn ping(
        &self,
        services: &[ServiceType],
        collector: &mut crate::diag::PingResult,
    ) {
        let Some(config) = self.config.read().clone() else {
            return;
        };
        let network = self.network.read().clone();
        let tls = self.options.security.enabled;
        for service in services {
            if !ServiceType::HTTP.contains(service) {
                continue;
            }
            for node in &config.nodes {
                let port = node.port(&network, *service, tls);
                if port == 0 {
                    continue;
                }
                let hostname = node.hostname_for(&network).to_string();
                let start = Instant::now();
                let info = match HttpSession::connect(
                    *service,
                    &self.client_id,
                    &hostname,
                    port,
                    &self.options,
                )
                .await
                {
                    Ok(session) => {
                        let request =
                            HttpRequest::new(*service, "GET", service.noop_path().to_string());
                        let outcome = session.execute(request).await;
                        let latency = duration_us(start.elapsed());
                        let info = match outcome {
                            Ok(_) => EndpointPingInfo {
                                id: session.id().to_string(),
                                latency_us: latency,
                                remote: session.remote_addr().to_string(),
                                local: session.local_addr().to_string(),
                                state: PingState::Ok,
                                namespace: None,
                                error: None,
                            },
                            Err(e) => EndpointPingInfo {
                                id: session.id().to_string(),
                                latency_us: latency,
                                remote: session.remote_addr().to_string(),
                                local: session.local_addr().to_string(),
                                state: if e.is_timeout() {
                                    PingState::Timeout
                                } else {
                                    PingState::Error
                                },
                                namespace: None,
                                error: Some(e.to_string()),
                            },
                        };
                        self.check_in(*service, session);
                        info
                    }
                    Err(e) => EndpointPingInfo {
                        id: String::new(),
                        latency_us: duration_us(start.elapsed()),
                        remote: format!("{hostname}:{port}"),
                        local: String::new(),
                        state: if e.is_timeout() {
                            PingState::Timeout
                        } else {
                            PingState::Error
                        },
                        namespace: None,
                        error: Some(e.to_string()),
                    },
                };
                collector.record(*service, info);
            }
        }
    }

    /// Add every live session to a diagnostics report.
    pub fn export_diag_info(&self, result: &mut DiagnosticsResult) {
        let sessions = self.sessions.lock();
        for (service, entry) in sessions.iter() {
            for session in entry.busy.iter().chain(entry.idle.iter()) {
                result.record(*service, session.diag_info(None));
            }
        }
    }

    /// Counts of (busy, idle) sessions for `service`.
    pub fn session_counts(&self, service: ServiceType) -> (usize, usize) {
        let sessions = self.sessions.lock();
        match sessions.get(&service) {
            Some(entry) => (entry.busy.len(), entry.idle.len()),
            None => (0, 0),
        }
    }

    /// Stop every session and the reaper.
    pub fn close(&self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        let mut sessions = self.sessions.lock();
        for entry in sessions.values_mut() {
            for session in entry.busy.drain(..).chain(entry.idle.drain(..)) {
                session.stop();
            }
        }
        self.prepared.clear();
    }
}

impl std::fmt::Debug for HttpSessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("HttpSessionPool")
    }
}
