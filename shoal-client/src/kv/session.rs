//! One binary-protocol session: a TCP (optionally TLS) connection to one
//! node's key-value port, bootstrapped through HELLO, SASL and
//! SELECT_BUCKET, then demultiplexing responses by opaque.
//!
//! The socket is owned by a reader and a writer task; everything else
//! reaches the session through the pending table and the write channel, so
//! per-session state never needs a lock across an await point.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use parking_lot::Mutex;
use shoal_errors::{ErrorKind, RetryReason, ShoalError, ShoalResult};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::config::{ClusterOptions, IpProtocol, SaslMechanism};
use crate::protocol::{
    ErrorMap, HelloFeature, Magic, Opcode, RequestFrame, ResponseFrame, Status, HEADER_SIZE,
};
use crate::stream::MaybeTlsStream;
use crate::topology::ClusterConfig;

use super::auth::{plain_payload, ScramExchange};

/// Opcode of unsolicited config pushes on duplex sessions.
const SERVER_PUSH_CLUSTERMAP: u8 = 0xb4;

/// Observable session lifecycle, reported through diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Ready,
    Draining,
    Disconnected,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Draining => "draining",
            SessionState::Disconnected => "disconnected",
        }
    }
}

/// What a subscriber receives for its opaque.
#[derive(Debug)]
pub enum SessionResponse {
    Frame(ResponseFrame),
    /// The request will never be answered; the reason says whether the
    /// dispatcher may re-route it.
    Canceled(RetryReason),
}

type PendingTable = Mutex<HashMap<u32, oneshot::Sender<SessionResponse>>>;

struct SessionInner {
    id: String,
    bucket: Mutex<Option<String>>,
    features: Vec<HelloFeature>,
    error_map: Option<ErrorMap>,
    endpoint_hostname: String,
    local_addr: String,
    remote_addr: String,
    opaque: AtomicU32,
    pending: PendingTable,
    collection_cache: Mutex<HashMap<String, u32>>,
    write_tx: mpsc::UnboundedSender<Bytes>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    config_tx: mpsc::UnboundedSender<ClusterConfig>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to one live key-value session.
#[derive(Clone)]
pub struct KvSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for KvSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSession")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote_addr)
            .field("state", &self.state().as_str())
            .finish()
    }
}

impl KvSession {
    /// Resolve, connect and bootstrap a session. On return the session is
    /// `Ready` and its feature set is frozen.
    pub async fn connect(
        hostname: &str,
        port: u16,
        bucket: Option<String>,
        client_id: &str,
        options: &ClusterOptions,
        config_tx: mpsc::UnboundedSender<ClusterConfig>,
    ) -> ShoalResult<KvSession> {
        let session_id = Uuid::new_v4().to_string();
        let addrs = resolve(hostname, port, options).await?;

        let mut last_error: Option<ShoalError> = None;
        let mut connected: Option<TcpStream> = None;
        for addr in addrs {
            match tokio::time::timeout(options.timeouts.connect_timeout, TcpStream::connect(addr))
                .await
            {
                Ok(Ok(stream)) => {
                    connected = Some(stream);
                    break;
                }
                Ok(Err(e)) => {
                    debug!(session_id = %session_id, %addr, error = %e, "connect attempt failed");
                    last_error = Some(ShoalError::with_source(ErrorKind::ServiceNotAvailable, e));
                }
                Err(_) => {
                    debug!(session_id = %session_id, %addr, "connect attempt timed out");
                    last_error = Some(ShoalError::with_message(
                        ErrorKind::UnambiguousTimeout,
                        "connect timeout",
                    ));
                }
            }
        }
        let stream = connected.ok_or_else(|| {
            last_error.unwrap_or_else(|| {
                ShoalError::with_message(ErrorKind::ServiceNotAvailable, "no endpoints resolved")
            })
        })?;
        let _ = stream.set_nodelay(true);

        let mut stream = MaybeTlsStream::wrap(stream, hostname, &options.security).await?;
        let local_addr = format_addr(stream.local_addr());
        let remote_addr = format_addr(stream.peer_addr());

        let mut bootstrap = Bootstrap {
            stream: &mut stream,
            session_id: &session_id,
            client_id,
            hostname,
            opaque: 1,
        };
        let features = bootstrap.hello().await?;
        let error_map = bootstrap.fetch_error_map().await.unwrap_or_else(|e| {
            debug!(session_id = %session_id, error = %e, "error map unavailable");
            None
        });
        bootstrap
            .authenticate(options, options.security.enabled)
            .await?;
        if let Some(bucket) = &bucket {
            bootstrap.select_bucket(bucket).await?;
        }
        let initial_config = bootstrap.fetch_config().await?;
        let next_opaque = bootstrap.opaque;

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SessionInner {
            id: session_id,
            bucket: Mutex::new(bucket),
            features,
            error_map,
            endpoint_hostname: hostname.to_string(),
            local_addr,
            remote_addr,
            opaque: AtomicU32::new(next_opaque),
            pending: Mutex::new(HashMap::new()),
            collection_cache: Mutex::new(HashMap::new()),
            write_tx,
            state: Mutex::new(SessionState::Ready),
            last_activity: Mutex::new(Instant::now()),
            config_tx,
            tasks: Mutex::new(Vec::new()),
        });
        let session = KvSession { inner };

        if let Some(config) = initial_config {
            session.publish_config(config);
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let reader = tokio::spawn(read_loop(Arc::clone(&session.inner), read_half));
        let writer = tokio::spawn(write_loop(Arc::clone(&session.inner), write_half, write_rx));
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(&session.inner),
            options.tcp_keepalive_interval,
        ));
        {
            let mut tasks = session.inner.tasks.lock();
            tasks.push(reader);
            tasks.push(writer);
            tasks.push(keepalive);
        }
        debug!(
            session_id = %session.inner.id,
            remote = %session.inner.remote_addr,
            "key-value session ready"
        );
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn bucket(&self) -> Option<String> {
        self.inner.bucket.lock().clone()
    }

    pub fn local_addr(&self) -> &str {
        &self.inner.local_addr
    }

    pub fn remote_addr(&self) -> &str {
        &self.inner.remote_addr
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.lock()
    }

    pub fn last_activity(&self) -> Instant {
        *self.inner.last_activity.lock()
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self.state(), SessionState::Disconnected)
    }

    pub fn supports_feature(&self, feature: HelloFeature) -> bool {
        self.inner.features.contains(&feature)
    }

    pub fn next_opaque(&self) -> u32 {
        self.inner.opaque.fetch_add(1, Ordering::Relaxed)
    }

    /// Mark the session as draining: in-flight work finishes, new work goes
    /// elsewhere.
    pub fn start_draining(&self) {
        let mut state = self.inner.state.lock();
        if *state == SessionState::Ready {
            *state = SessionState::Draining;
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.inner.pending.lock().is_empty()
    }

    /// Queue `frame` for writing and subscribe to its response. The frame's
    /// opaque must come from [`KvSession::next_opaque`].
    pub fn write_and_subscribe(
        &self,
        frame: &RequestFrame,
    ) -> oneshot::Receiver<SessionResponse> {
        let (tx, rx) = oneshot::channel();
        if self.is_stopped() {
            let _ = tx.send(SessionResponse::Canceled(RetryReason::NodeNotAvailable));
            return rx;
        }
        self.inner.pending.lock().insert(frame.opaque, tx);
        if self.inner.write_tx.send(frame.encode()).is_err() {
            if let Some(tx) = self.inner.pending.lock().remove(&frame.opaque) {
                let _ = tx.send(SessionResponse::Canceled(
                    RetryReason::SocketClosedWhileInFlight,
                ));
            }
        }
        *self.inner.last_activity.lock() = Instant::now();
        rx
    }

    /// Drop the subscription for `opaque`. Returns true when the request was
    /// still pending.
    pub fn cancel(&self, opaque: u32) -> bool {
        self.inner.pending.lock().remove(&opaque).is_some()
    }

    pub fn cached_collection_id(&self, path: &str) -> Option<u32> {
        self.inner.collection_cache.lock().get(path).copied()
    }

    pub fn update_collection_id(&self, path: String, cid: u32) {
        self.inner.collection_cache.lock().insert(path, cid);
    }

    pub fn invalidate_collection_id(&self, path: &str) {
        self.inner.collection_cache.lock().remove(path);
    }

    /// Resolve a status the static set does not know through the session's
    /// error map.
    pub fn decode_error_map_reason(&self, raw_status: u16) -> Option<RetryReason> {
        let entry = self.inner.error_map.as_ref()?.entry(raw_status)?;
        if entry.has_retry_attribute() {
            Some(RetryReason::KvErrorMapRetryIndicated)
        } else {
            None
        }
    }

    /// Parse and publish the config payload of a not-my-vbucket response.
    pub fn handle_not_my_vbucket(&self, frame: &ResponseFrame) {
        if frame.value.is_empty() {
            return;
        }
        match std::str::from_utf8(&frame.value)
            .map_err(|e| ShoalError::with_message(ErrorKind::ParsingFailure, e.to_string()))
            .and_then(|raw| ClusterConfig::parse(raw, &self.inner.endpoint_hostname))
        {
            Ok(config) => {
                trace!(
                    session_id = %self.inner.id,
                    version = %config.version,
                    "config piggybacked on not_my_vbucket"
                );
                self.publish_config(config);
            }
            Err(e) => {
                debug!(session_id = %self.inner.id, error = %e, "ignoring unparsable embedded config");
            }
        }
    }

    pub(crate) fn publish_config(&self, config: ClusterConfig) {
        let _ = self.inner.config_tx.send(config);
    }

    /// Round-trip a NOOP, returning the observed latency.
    pub async fn ping(&self) -> ShoalResult<Duration> {
        let mut frame = RequestFrame::new(Opcode::Noop);
        frame.opaque = self.next_opaque();
        let start = Instant::now();
        match self.write_and_subscribe(&frame).await {
            Ok(SessionResponse::Frame(_)) => Ok(start.elapsed()),
            _ => Err(ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                "session closed during ping",
            )),
        }
    }

    /// Re-select the bucket on an already-bootstrapped session.
    pub async fn select_bucket(&self, bucket: &str) -> ShoalResult<()> {
        let mut frame = RequestFrame::new(Opcode::SelectBucket);
        frame.key = bucket.as_bytes().to_vec();
        frame.opaque = self.next_opaque();
        match self.write_and_subscribe(&frame).await {
            Ok(SessionResponse::Frame(response)) => match response.status() {
                Some(Status::Success) => {
                    *self.inner.bucket.lock() = Some(bucket.to_string());
                    Ok(())
                }
                Some(Status::NoAccess) | Some(Status::AuthError) => {
                    Err(ShoalError::with_message(
                        ErrorKind::AuthenticationFailure,
                        format!("access denied to bucket {bucket}"),
                    ))
                }
                _ => Err(ShoalError::with_message(
                    ErrorKind::BucketNotFound,
                    format!("bucket {bucket} not found"),
                )),
            },
            _ => Err(ShoalError::new(ErrorKind::RequestCanceled)),
        }
    }

    /// Ask the node for its current cluster map and publish it to the
    /// facade. Used by the periodic config poll.
    pub async fn fetch_config(&self) -> ShoalResult<()> {
        let mut frame = RequestFrame::new(Opcode::GetClusterConfig);
        frame.opaque = self.next_opaque();
        match self.write_and_subscribe(&frame).await {
            Ok(SessionResponse::Frame(response)) => {
                if response.status() != Some(Status::Success) || response.value.is_empty() {
                    return Ok(());
                }
                let raw = std::str::from_utf8(&response.value).map_err(|e| {
                    ShoalError::with_message(ErrorKind::ParsingFailure, e.to_string())
                })?;
                let config = ClusterConfig::parse(raw, &self.inner.endpoint_hostname)?;
                self.publish_config(config);
                Ok(())
            }
            _ => Err(ShoalError::new(ErrorKind::RequestCanceled)),
        }
    }

    /// Stop the session: cancel the socket tasks and complete every pending
    /// request exactly once with `request_canceled`.
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == SessionState::Disconnected {
                return;
            }
            *state = SessionState::Disconnected;
        }
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.tasks.lock());
        for task in &tasks {
            task.abort();
        }
        drain_pending(&self.inner, RetryReason::DoNotRetry);
        debug!(session_id = %self.inner.id, "key-value session closed");
    }
}

fn format_addr(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_default()
}

async fn resolve(
    hostname: &str,
    port: u16,
    options: &ClusterOptions,
) -> ShoalResult<Vec<SocketAddr>> {
    let lookup = tokio::net::lookup_host((hostname, port));
    let resolved = tokio::time::timeout(options.timeouts.resolve_timeout, lookup)
        .await
        .map_err(|_| ShoalError::with_message(ErrorKind::UnambiguousTimeout, "resolve timeout"))?
        .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;
    let addrs: Vec<SocketAddr> = resolved
        .filter(|addr| match options.ip_protocol {
            IpProtocol::Any => true,
            IpProtocol::ForceIpv4 => addr.is_ipv4(),
            IpProtocol::ForceIpv6 => addr.is_ipv6(),
        })
        .collect();
    if addrs.is_empty() {
        return Err(ShoalError::with_message(
            ErrorKind::ServiceNotAvailable,
            format!("no usable addresses for {hostname}"),
        ));
    }
    Ok(addrs)
}

fn drain_pending(inner: &SessionInner, reason: RetryReason) {
    let pending: Vec<_> = {
        let mut table = inner.pending.lock();
        table.drain().collect()
    };
    for (_, tx) in pending {
        let _ = tx.send(SessionResponse::Canceled(reason));
    }
}

/// Sequential request/response exchange over the raw stream, used only
/// before the reader task exists.
struct Bootstrap<'a> {
    stream: &'a mut MaybeTlsStream,
    session_id: &'a str,
    client_id: &'a str,
    hostname: &'a str,
    opaque: u32,
}

impl Bootstrap<'_> {
    async fn round_trip(&mut self, mut frame: RequestFrame) -> ShoalResult<ResponseFrame> {
        frame.opaque = self.opaque;
        self.opaque += 1;
        let encoded = frame.encode();
        self.stream
            .write_all(&encoded)
            .await
            .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;

        loop {
            let mut header = [0u8; HEADER_SIZE];
            self.stream
                .read_exact(&mut header)
                .await
                .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;
            let body_len = BigEndian::read_u32(&header[8..12]) as usize;
            let mut body = vec![0u8; body_len];
            self.stream
                .read_exact(&mut body)
                .await
                .map_err(|e| ShoalError::with_source(ErrorKind::ServiceNotAvailable, e))?;
            // Unsolicited pushes can interleave even during bootstrap once
            // duplex is on the table; skip anything that is not our answer.
            if matches!(
                Magic::parse(header[0]),
                Some(Magic::Request | Magic::FlexibleRequest)
            ) {
                continue;
            }
            let frame = ResponseFrame::decode(&header, Bytes::from(body))?;
            if frame.opaque != self.opaque - 1 {
                continue;
            }
            return Ok(frame);
        }
    }

    async fn hello(&mut self) -> ShoalResult<Vec<HelloFeature>> {
        let requested = HelloFeature::requested();
        let mut frame = RequestFrame::new(Opcode::Hello);
        frame.key = serde_json::to_vec(&serde_json::json!({
            "a": crate::sdk_id(),
            "i": format!("{}/{}", self.client_id, self.session_id),
        }))
        .unwrap_or_default();
        let mut value = Vec::with_capacity(requested.len() * 2);
        for feature in &requested {
            value.extend_from_slice(&(*feature as u16).to_be_bytes());
        }
        frame.value = value;

        let response = self.round_trip(frame).await?;
        expect_success(&response, "HELLO")?;
        let mut negotiated = Vec::new();
        for chunk in response.value.chunks_exact(2) {
            if let Some(feature) = HelloFeature::parse(BigEndian::read_u16(chunk)) {
                if requested.contains(&feature) {
                    negotiated.push(feature);
                }
            }
        }
        trace!(session_id = %self.session_id, features = ?negotiated, "negotiated features");
        Ok(negotiated)
    }

    async fn fetch_error_map(&mut self) -> ShoalResult<Option<ErrorMap>> {
        let mut frame = RequestFrame::new(Opcode::GetErrorMap);
        frame.value = 2u16.to_be_bytes().to_vec();
        let response = self.round_trip(frame).await?;
        if response.status() != Some(Status::Success) {
            return Ok(None);
        }
        Ok(Some(ErrorMap::parse(&response.value)?))
    }

    async fn authenticate(&mut self, options: &ClusterOptions, tls: bool) -> ShoalResult<()> {
        let offered = options.effective_sasl_mechanisms(tls);

        let list = self.round_trip(RequestFrame::new(Opcode::SaslListMechs)).await?;
        expect_success(&list, "SASL_LIST_MECHS")?;
        let server_mechs = String::from_utf8_lossy(&list.value).to_string();

        let mechanism = offered
            .into_iter()
            .find(|m| server_mechs.contains(m.as_str()))
            .ok_or_else(|| {
                ShoalError::with_message(
                    ErrorKind::AuthenticationFailure,
                    format!("no shared SASL mechanism in [{server_mechs}]"),
                )
            })?;

        let credentials = &options.credentials;
        match mechanism {
            SaslMechanism::Plain => {
                let mut frame = RequestFrame::new(Opcode::SaslAuth);
                frame.key = mechanism.as_str().as_bytes().to_vec();
                frame.value = plain_payload(&credentials.username, &credentials.password);
                let response = self.round_trip(frame).await?;
                if response.status() != Some(Status::Success) {
                    return Err(auth_failed(&response));
                }
            }
            _ => {
                let mut exchange =
                    ScramExchange::new(mechanism, &credentials.username, &credentials.password)?;
                let mut frame = RequestFrame::new(Opcode::SaslAuth);
                frame.key = mechanism.as_str().as_bytes().to_vec();
                frame.value = exchange.client_first().into_bytes();
                let response = self.round_trip(frame).await?;
                match response.status() {
                    Some(Status::AuthContinue) => {}
                    Some(Status::Success) => return Ok(()),
                    _ => return Err(auth_failed(&response)),
                }

                let client_final = exchange.client_final(&response.value)?;
                let mut frame = RequestFrame::new(Opcode::SaslStep);
                frame.key = mechanism.as_str().as_bytes().to_vec();
                frame.value = client_final.into_bytes();
                let response = self.round_trip(frame).await?;
                if response.status() != Some(Status::Success) {
                    return Err(auth_failed(&response));
                }
                exchange.verify_server_final(&response.value)?;
            }
        }
        debug!(session_id = %self.session_id, mechanism = mechanism.as_str(), "authenticated");
        Ok(())
    }

    async fn select_bucket(&mut self, bucket: &str) -> ShoalResult<()> {
        let mut frame = RequestFrame::new(Opcode::SelectBucket);
        frame.key = bucket.as_bytes().to_vec();
        let response = self.round_trip(frame).await?;
        match response.status() {
            Some(Status::Success) => Ok(()),
            Some(Status::NoAccess) | Some(Status::AuthError) => Err(ShoalError::with_message(
                ErrorKind::AuthenticationFailure,
                format!("access denied to bucket {bucket}"),
            )),
            _ => Err(ShoalError::with_message(
                ErrorKind::BucketNotFound,
                format!("bucket {bucket} not found"),
            )),
        }
    }

    async fn fetch_config(&mut self) -> ShoalResult<Option<ClusterConfig>> {
        let response = self
            .round_trip(RequestFrame::new(Opcode::GetClusterConfig))
            .await?;
        if response.status() != Some(Status::Success) || response.value.is_empty() {
            return Ok(None);
        }
        let raw = std::str::from_utf8(&response.value)
            .map_err(|e| ShoalError::with_message(ErrorKind::ParsingFailure, e.to_string()))?;
        Ok(Some(ClusterConfig::parse(raw, self.hostname)?))
    }
}

fn expect_success(frame: &ResponseFrame, what: &str) -> ShoalResult<()> {
    if frame.status() == Some(Status::Success) {
        return Ok(());
    }
    Err(ShoalError::with_message(
        ErrorKind::ServiceNotAvailable,
        format!("{what} failed with status 0x{:04x}", frame.raw_status),
    ))
}

fn auth_failed(frame: &ResponseFrame) -> ShoalError {
    ShoalError::with_message(
        ErrorKind::AuthenticationFailure,
        format!("authentication failed with status 0x{:04x}", frame.raw_status),
    )
}

async fn read_loop(inner: Arc<SessionInner>, mut read_half: ReadHalf<MaybeTlsStream>) {
    loop {
        let mut header = [0u8; HEADER_SIZE];
        if read_half.read_exact(&mut header).await.is_err() {
            break;
        }
        let body_len = BigEndian::read_u32(&header[8..12]) as usize;
        let mut body = vec![0u8; body_len];
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        *inner.last_activity.lock() = Instant::now();

        match Magic::parse(header[0]) {
            Some(Magic::Request | Magic::FlexibleRequest) => {
                // Out-of-band push from the server (duplex). The only one we
                // act on is a cluster map change.
                if header[1] == SERVER_PUSH_CLUSTERMAP {
                    handle_pushed_config(&inner, &header, &body);
                }
                continue;
            }
            Some(_) => {}
            None => {
                warn!(session_id = %inner.id, magic = header[0], "bad magic, dropping session");
                break;
            }
        }

        let frame = match ResponseFrame::decode(&header, Bytes::from(body)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(session_id = %inner.id, error = %e, "undecodable frame, dropping session");
                break;
            }
        };
        let subscriber = inner.pending.lock().remove(&frame.opaque);
        match subscriber {
            Some(tx) => {
                let _ = tx.send(SessionResponse::Frame(frame));
            }
            None => {
                trace!(
                    session_id = %inner.id,
                    opaque = frame.opaque,
                    "response with no subscriber (raced a cancel)"
                );
            }
        }
    }

    let was_open = {
        let mut state = inner.state.lock();
        let open = !matches!(*state, SessionState::Disconnected);
        *state = SessionState::Disconnected;
        open
    };
    if was_open {
        debug!(session_id = %inner.id, "socket closed, failing in-flight requests");
        drain_pending(&inner, RetryReason::SocketClosedWhileInFlight);
    }
}

fn handle_pushed_config(inner: &Arc<SessionInner>, header: &[u8], body: &[u8]) {
    let extras_len = header[4] as usize;
    let key_len = if header[0] == Magic::FlexibleRequest as u8 {
        header[3] as usize
    } else {
        BigEndian::read_u16(&header[2..4]) as usize
    };
    let framing_len = if header[0] == Magic::FlexibleRequest as u8 {
        header[2] as usize
    } else {
        0
    };
    let offset = framing_len + extras_len + key_len;
    if body.len() <= offset {
        return;
    }
    if let Ok(raw) = std::str::from_utf8(&body[offset..]) {
        if let Ok(config) = ClusterConfig::parse(raw, &inner.endpoint_hostname) {
            trace!(session_id = %inner.id, version = %config.version, "server pushed config");
            let _ = inner.config_tx.send(config);
        }
    }
}

async fn write_loop(
    inner: Arc<SessionInner>,
    mut write_half: WriteHalf<MaybeTlsStream>,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = write_rx.recv().await {
        if write_half.write_all(&frame).await.is_err() {
            break;
        }
    }
    let _ = write_half.shutdown().await;
    let was_open = {
        let mut state = inner.state.lock();
        let open = !matches!(*state, SessionState::Disconnected);
        *state = SessionState::Disconnected;
        open
    };
    if was_open {
        drain_pending(&inner, RetryReason::SocketClosedWhileInFlight);
    }
}

async fn keepalive_loop(inner: std::sync::Weak<SessionInner>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut previous: Option<u32> = None;
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if matches!(*inner.state.lock(), SessionState::Disconnected) {
            return;
        }
        if let Some(opaque) = previous.take() {
            inner.pending.lock().remove(&opaque);
        }
        let session = KvSession { inner };
        let mut frame = RequestFrame::new(Opcode::Noop);
        frame.opaque = session.next_opaque();
        previous = Some(frame.opaque);
        // The receiver is dropped on purpose; the reader clears the entry
        // when the NOOP answer arrives.
        let _ = session.write_and_subscribe(&frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_state_names() {
        assert_eq!(SessionState::Ready.as_str(), "ready");
        assert_eq!(SessionState::Draining.as_str(), "draining");
    }
}
