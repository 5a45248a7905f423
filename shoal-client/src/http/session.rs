//! One keep-alive HTTP/1.1 session to one node for one service.
//!
//! A session carries at most one in-flight request; the pool enforces this
//! by only ever lending a session to one caller at a time. Socket closure
//! fails the in-flight request with `ambiguous_timeout`, since the server
//! may or may not have processed it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::{Body, Request};
use parking_lot::Mutex;
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};
use tokio::net::TcpStream;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::{ClusterOptions, Credentials};
use crate::diag::{duration_us, EndpointDiagInfo, EndpointState};
use crate::service::ServiceType;
use crate::stream::MaybeTlsStream;

use super::{ChunkSink, HttpRequest, HttpResponse};

pub struct HttpSession {
    service: ServiceType,
    id: String,
    hostname: String,
    local_addr: String,
    remote_addr: String,
    credentials: Credentials,
    user_agent: String,
    default_timeout: Duration,
    sender: tokio::sync::Mutex<hyper::client::conn::SendRequest<Body>>,
    stopped: AtomicBool,
    keep_alive: AtomicBool,
    idle_deadline: Mutex<Option<Instant>>,
    last_activity: Mutex<Instant>,
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("service", &self.service)
            .field("id", &self.id)
            .field("remote", &self.remote_addr)
            .finish()
    }
}

impl HttpSession {
    pub async fn connect(
        service: ServiceType,
        client_id: &str,
        hostname: &str,
        port: u16,
        options: &ClusterOptions,
    ) -> ShoalResult<Arc<HttpSession>> {
        let stream = tokio::time::timeout(
            options.timeouts.connect_timeout,
            TcpStream::connect((hostname, port)),
        )
        .await
        .map_err(|_| ShoalError::with_message(ErrorKind::UnambiguousTimeout, "connect timeout"))?
        .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;
        let _ = stream.set_nodelay(true);
        let stream = MaybeTlsStream::wrap(stream, hostname, &options.security).await?;
        let local_addr = stream
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let remote_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();

        let (sender, connection) = hyper::client::conn::Builder::new()
            .handshake::<_, Body>(stream)
            .await
            .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;

        let user_agent = match &options.user_agent_extra {
            Some(extra) => format!("{}; {}; {}", crate::sdk_id(), client_id, extra),
            None => format!("{}; {}", crate::sdk_id(), client_id),
        };

        let session = Arc::new(HttpSession {
            service,
            id: Uuid::new_v4().to_string(),
            hostname: hostname.to_string(),
            local_addr,
            remote_addr,
            credentials: options.credentials.clone(),
            user_agent,
            default_timeout: options.timeouts.for_service(service),
            sender: tokio::sync::Mutex::new(sender),
            stopped: AtomicBool::new(false),
            keep_alive: AtomicBool::new(true),
            idle_deadline: Mutex::new(None),
            last_activity: Mutex::new(Instant::now()),
        });

        let driver = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                trace!(session_id = %driver.id, error = %e, "http connection ended");
            }
            driver.stopped.store(true, Ordering::SeqCst);
        });

        debug!(
            session_id = %session.id,
            service = %service,
            remote = %session.remote_addr,
            "http session connected"
        );
        Ok(session)
    }

    pub fn service(&self) -> ServiceType {
        self.service
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.remote_addr
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive.load(Ordering::SeqCst)
    }

    pub fn set_idle(&self, timeout: Duration) {
        *self.idle_deadline.lock() = Some(Instant::now() + timeout);
    }

    pub fn reset_idle(&self) {
        *self.idle_deadline.lock() = None;
    }

    pub fn idle_expired(&self, now: Instant) -> bool {
        matches!(*self.idle_deadline.lock(), Some(deadline) if deadline <= now)
    }

    pub fn diag_info(&self, bucket: Option<String>) -> EndpointDiagInfo {
        EndpointDiagInfo {
            id: self.id.clone(),
            last_activity_us: duration_us(self.last_activity.lock().elapsed()),
            remote: self.remote_addr.clone(),
            local: self.local_addr.clone(),
            state: if self.is_stopped() {
                EndpointState::Disconnected
            } else {
                EndpointState::Connected
            },
            namespace: bucket,
            details: None,
        }
    }

    /// Issue `request` and buffer the whole response body.
    pub async fn execute(&self, request: HttpRequest) -> ShoalResult<HttpResponse> {
        self.execute_inner(request, None).await
    }

    /// Issue `request`, pushing body chunks into `sink` as they arrive.
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
        mut sink: Option<ChunkSink>,
    ) -> ShoalResult<HttpResponse> {
        let timeout = request.timeout.unwrap_or(self.default_timeout);
        let deadline = tokio::time::Instant::now() + timeout;
        *self.last_activity.lock() = Instant::now();

        let mut builder = Request::builder()
            .method(request.method)
            .uri(request.path.as_str())
            .header(hyper::header::HOST, &self.hostname)
            .header(hyper::header::USER_AGENT, &self.user_agent)
            .header(
                hyper::header::AUTHORIZATION,
                format!(
                    "Basic {}",
                    BASE64.encode(format!(
                        "{}:{}",
                        self.credentials.username, self.credentials.password
                    ))
                ),
            );
        if let Some(content_type) = request.content_type {
            builder = builder.header(hyper::header::CONTENT_TYPE, content_type);
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let body = if request.body.is_empty() {
            Body::empty()
        } else {
            Body::from(request.body)
        };
        let outgoing = builder
            .body(body)
            .map_err(|e| ShoalError::with_source(ErrorKind::InvalidArgument, e))?;

        let run = async {
            let mut sender = self.sender.lock().await;
            std::future::poll_fn(|cx| sender.poll_ready(cx))
                .await
                .map_err(|e| self.transport_error(e))?;
            sender
                .send_request(outgoing)
                .await
                .map_err(|e| self.transport_error(e))
        };
        let response = tokio::select! {
            response = run => response?,
            _ = tokio::time::sleep_until(deadline) => {
                // A response may still be queued behind the socket; the
                // session cannot be reused.
                self.stop();
                return Err(ShoalError::with_message(
                    ErrorKind::AmbiguousTimeout,
                    format!("{} {} timed out", request.method, request.path),
                ));
            }
        };

        let status = response.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                headers.insert(name.as_str().to_string(), value.to_string());
            }
        }
        if headers
            .get("connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
        {
            self.keep_alive.store(false, Ordering::SeqCst);
        }

        let mut body = response.into_body();
        let collected = async {
            let mut buffered = Vec::new();
            while let Some(chunk) = body.data().await {
                let chunk = chunk.map_err(|e| self.transport_error(e))?;
                match &mut sink {
                    Some(sink) => sink(chunk),
                    None => buffered.extend_from_slice(&chunk),
                }
            }
            Ok::<Vec<u8>, ShoalError>(buffered)
        };
        let buffered = tokio::select! {
            buffered = collected => buffered?,
            _ = tokio::time::sleep_until(deadline) => {
                self.stop();
                return Err(ShoalError::with_message(
                    ErrorKind::AmbiguousTimeout,
                    format!("{} {} timed out reading body", request.method, request.path),
                ));
            }
        };

        *self.last_activity.lock() = Instant::now();
        Ok(HttpResponse {
            status,
            headers,
            body: Bytes::from(buffered),
        })
    }

    fn transport_error(&self, error: hyper::Error) -> ShoalError {
        self.stopped.store(true, Ordering::SeqCst);
        // The request may have reached the server before the socket died.
        ShoalError::with_source(ErrorKind::AmbiguousTimeout, error)
    }
}
