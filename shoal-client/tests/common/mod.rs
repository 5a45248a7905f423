//! In-process mock cluster used by the integration tests: a minimal
//! key-value node speaking the binary protocol, and a minimal query service
//! speaking just enough HTTP/1.1 for the client's pooled sessions.

// Each test binary uses a different slice of this module.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const USERNAME: &str = "app";
pub const PASSWORD: &str = "secret";

const HEADER_SIZE: usize = 24;

// Opcodes the mock understands.
const OP_GET: u8 = 0x00;
const OP_SET: u8 = 0x01;
const OP_ADD: u8 = 0x02;
const OP_REPLACE: u8 = 0x03;
const OP_DELETE: u8 = 0x04;
const OP_NOOP: u8 = 0x0a;
const OP_HELLO: u8 = 0x1f;
const OP_SASL_LIST: u8 = 0x20;
const OP_SASL_AUTH: u8 = 0x21;
const OP_SELECT_BUCKET: u8 = 0x89;
const OP_GET_CLUSTER_CONFIG: u8 = 0xb5;
const OP_SUBDOC_MULTI_MUTATION: u8 = 0xd1;
const OP_GET_ERROR_MAP: u8 = 0xfe;

const STATUS_SUCCESS: u16 = 0x00;
const STATUS_NOT_FOUND: u16 = 0x01;
const STATUS_EXISTS: u16 = 0x02;
const STATUS_NOT_MY_VBUCKET: u16 = 0x07;
const STATUS_AUTH_ERROR: u16 = 0x20;
const STATUS_INVALID: u16 = 0x04;

#[derive(Debug, Clone)]
pub struct StoredDocument {
    pub value: Vec<u8>,
    pub flags: u32,
    pub cas: u64,
}

/// State shared by every node of the mock cluster.
#[derive(Default)]
pub struct ClusterState {
    pub documents: Mutex<HashMap<Vec<u8>, StoredDocument>>,
    cas_counter: AtomicU64,
    /// Durability framing extras captured from mutations: (level, timeout_ms).
    pub durability_frames: Mutex<Vec<(u8, u16)>>,
    /// While > 0, document ops on node 0 answer not-my-vbucket carrying the
    /// two-node config.
    pub nmvb_remaining: AtomicUsize,
}

impl ClusterState {
    pub fn next_cas(&self) -> u64 {
        self.cas_counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

pub struct MockNode {
    pub port: u16,
    pub index: usize,
    pub state: Arc<ClusterState>,
    config: Arc<Mutex<String>>,
}

struct ParsedRequest {
    opcode: u8,
    opaque: u32,
    cas: u64,
    framing: Vec<u8>,
    extras: Vec<u8>,
    key: Vec<u8>,
    value: Vec<u8>,
}

fn encode_response(
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    value: &[u8],
) -> Vec<u8> {
    let body_len = extras.len() + value.len();
    let mut out = vec![0u8; HEADER_SIZE];
    out[0] = 0x81;
    out[1] = opcode;
    out[4] = extras.len() as u8;
    BigEndian::write_u16(&mut out[6..8], status);
    BigEndian::write_u32(&mut out[8..12], body_len as u32);
    BigEndian::write_u32(&mut out[12..16], opaque);
    BigEndian::write_u64(&mut out[16..24], cas);
    out.extend_from_slice(extras);
    out.extend_from_slice(value);
    out
}

fn mutation_token_extras(seq: u64) -> Vec<u8> {
    let mut extras = vec![0u8; 16];
    BigEndian::write_u64(&mut extras[0..8], 0x0102_0304_0506_0708);
    BigEndian::write_u64(&mut extras[8..16], seq);
    extras
}

async fn read_request(stream: &mut TcpStream) -> Option<ParsedRequest> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header).await.ok()?;
    let body_len = BigEndian::read_u32(&header[8..12]) as usize;
    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body).await.ok()?;

    let (framing_len, key_len) = match header[0] {
        0x08 => (header[2] as usize, header[3] as usize),
        _ => (0, BigEndian::read_u16(&header[2..4]) as usize),
    };
    let extras_len = header[4] as usize;
    let framing = body[..framing_len].to_vec();
    let extras = body[framing_len..framing_len + extras_len].to_vec();
    let key = body[framing_len + extras_len..framing_len + extras_len + key_len].to_vec();
    let value = body[framing_len + extras_len + key_len..].to_vec();
    Some(ParsedRequest {
        opcode: header[1],
        opaque: BigEndian::read_u32(&header[12..16]),
        cas: BigEndian::read_u64(&header[16..24]),
        framing,
        extras,
        key,
        value,
    })
}

fn capture_durability(state: &ClusterState, framing: &[u8]) {
    let mut rest = framing;
    while !rest.is_empty() {
        let id = rest[0] >> 4;
        let len = (rest[0] & 0x0f) as usize;
        if rest.len() < 1 + len {
            return;
        }
        if id == 0x01 && len >= 1 {
            let level = rest[1];
            let timeout = if len >= 3 {
                BigEndian::read_u16(&rest[2..4])
            } else {
                0
            };
            state.durability_frames.lock().push((level, timeout));
        }
        rest = &rest[1 + len..];
    }
}

fn apply_dict_upserts(document: &mut Vec<u8>, specs: &[u8]) -> bool {
    let mut root: Value = match serde_json::from_slice(document) {
        Ok(value) => value,
        Err(_) => return false,
    };
    let mut rest = specs;
    while rest.len() >= 8 {
        let opcode = rest[0];
        let path_len = BigEndian::read_u16(&rest[2..4]) as usize;
        let value_len = BigEndian::read_u32(&rest[4..8]) as usize;
        if rest.len() < 8 + path_len + value_len {
            return false;
        }
        let path = String::from_utf8_lossy(&rest[8..8 + path_len]).into_owned();
        let value = &rest[8 + path_len..8 + path_len + value_len];
        // The mock supports top-level dict_upsert (0xc8) only.
        if opcode == 0xc8 {
            let Ok(parsed) = serde_json::from_slice::<Value>(value) else {
                return false;
            };
            if let Some(object) = root.as_object_mut() {
                object.insert(path, parsed);
            }
        }
        rest = &rest[8 + path_len + value_len..];
    }
    match serde_json::to_vec(&root) {
        Ok(serialized) => {
            *document = serialized;
            true
        }
        Err(_) => false,
    }
}

impl MockNode {
    /// Bind a node; `configure` is called once the port is known so the test
    /// can install the cluster config document this node serves.
    pub async fn start(index: usize, state: Arc<ClusterState>) -> MockNode {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = Arc::new(Mutex::new(String::new()));
        let node = MockNode {
            port,
            index,
            state: Arc::clone(&state),
            config: Arc::clone(&config),
        };
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                let state = Arc::clone(&state);
                let config = Arc::clone(&config);
                tokio::spawn(serve_connection(stream, index, state, config));
            }
        });
        node
    }

    pub fn set_config(&self, config: String) {
        *self.config.lock() = config;
    }
}

async fn serve_connection(
    mut stream: TcpStream,
    node_index: usize,
    state: Arc<ClusterState>,
    config: Arc<Mutex<String>>,
) {
    while let Some(request) = read_request(&mut stream).await {
        let response = handle_request(&request, node_index, &state, &config);
        if stream.write_all(&response).await.is_err() {
            return;
        }
    }
}

fn handle_request(
    request: &ParsedRequest,
    node_index: usize,
    state: &ClusterState,
    config: &Mutex<String>,
) -> Vec<u8> {
    let opcode = request.opcode;
    match opcode {
        OP_HELLO => {
            // mutation_seqno, select_bucket, alt_request, sync_replication
            let mut features = Vec::new();
            for feature in [0x04u16, 0x08, 0x10, 0x11] {
                features.extend_from_slice(&feature.to_be_bytes());
            }
            encode_response(opcode, STATUS_SUCCESS, request.opaque, 0, &[], &features)
        }
        OP_SASL_LIST => {
            encode_response(opcode, STATUS_SUCCESS, request.opaque, 0, &[], b"PLAIN")
        }
        OP_SASL_AUTH => {
            let expected = format!("\0{USERNAME}\0{PASSWORD}");
            if request.value == expected.as_bytes() {
                encode_response(opcode, STATUS_SUCCESS, request.opaque, 0, &[], b"")
            } else {
                encode_response(opcode, STATUS_AUTH_ERROR, request.opaque, 0, &[], b"")
            }
        }
        OP_SELECT_BUCKET | OP_NOOP => {
            encode_response(opcode, STATUS_SUCCESS, request.opaque, 0, &[], b"")
        }
        OP_GET_ERROR_MAP => {
            let map = br#"{"version":2,"revision":1,"errors":{}}"#;
            encode_response(opcode, STATUS_SUCCESS, request.opaque, 0, &[], map)
        }
        OP_GET_CLUSTER_CONFIG => {
            let document = config.lock().clone();
            encode_response(
                opcode,
                STATUS_SUCCESS,
                request.opaque,
                0,
                &[],
                document.as_bytes(),
            )
        }
        OP_GET | OP_SET | OP_ADD | OP_REPLACE | OP_DELETE | OP_SUBDOC_MULTI_MUTATION => {
            if node_index == 0 && state.nmvb_remaining.load(Ordering::SeqCst) > 0 {
                state.nmvb_remaining.fetch_sub(1, Ordering::SeqCst);
                let document = config.lock().clone();
                return encode_response(
                    opcode,
                    STATUS_NOT_MY_VBUCKET,
                    request.opaque,
                    0,
                    &[],
                    document.as_bytes(),
                );
            }
            capture_durability(state, &request.framing);
            handle_document_op(request, state)
        }
        _ => encode_response(opcode, STATUS_INVALID, request.opaque, 0, &[], b""),
    }
}

fn handle_document_op(request: &ParsedRequest, state: &ClusterState) -> Vec<u8> {
    let mut documents = state.documents.lock();
    match request.opcode {
        OP_GET => match documents.get(&request.key) {
            Some(document) => {
                let mut extras = vec![0u8; 4];
                BigEndian::write_u32(&mut extras, document.flags);
                encode_response(
                    request.opcode,
                    STATUS_SUCCESS,
                    request.opaque,
                    document.cas,
                    &extras,
                    &document.value,
                )
            }
            None => encode_response(request.opcode, STATUS_NOT_FOUND, request.opaque, 0, &[], b""),
        },
        OP_SET | OP_ADD | OP_REPLACE => {
            let flags = if request.extras.len() >= 4 {
                BigEndian::read_u32(&request.extras[0..4])
            } else {
                0
            };
            let existing = documents.get(&request.key);
            match request.opcode {
                OP_ADD if existing.is_some() => {
                    return encode_response(
                        request.opcode,
                        STATUS_EXISTS,
                        request.opaque,
                        0,
                        &[],
                        b"",
                    )
                }
                OP_REPLACE if existing.is_none() => {
                    return encode_response(
                        request.opcode,
                        STATUS_NOT_FOUND,
                        request.opaque,
                        0,
                        &[],
                        b"",
                    )
                }
                _ => {}
            }
            if request.cas != 0 {
                match existing {
                    Some(document) if document.cas != request.cas => {
                        return encode_response(
                            request.opcode,
                            STATUS_EXISTS,
                            request.opaque,
                            0,
                            &[],
                            b"",
                        )
                    }
                    _ => {}
                }
            }
            let cas = state.next_cas();
            documents.insert(
                request.key.clone(),
                StoredDocument {
                    value: request.value.clone(),
                    flags,
                    cas,
                },
            );
            encode_response(
                request.opcode,
                STATUS_SUCCESS,
                request.opaque,
                cas,
                &mutation_token_extras(cas),
                b"",
            )
        }
        OP_DELETE => match documents.remove(&request.key) {
            Some(_) => {
                let cas = state.next_cas();
                encode_response(
                    request.opcode,
                    STATUS_SUCCESS,
                    request.opaque,
                    cas,
                    &mutation_token_extras(cas),
                    b"",
                )
            }
            None => encode_response(request.opcode, STATUS_NOT_FOUND, request.opaque, 0, &[], b""),
        },
        OP_SUBDOC_MULTI_MUTATION => {
            let Some(document) = documents.get_mut(&request.key) else {
                return encode_response(
                    request.opcode,
                    STATUS_NOT_FOUND,
                    request.opaque,
                    0,
                    &[],
                    b"",
                );
            };
            if !apply_dict_upserts(&mut document.value, &request.value) {
                return encode_response(request.opcode, STATUS_INVALID, request.opaque, 0, &[], b"");
            }
            let cas = state.next_cas();
            document.cas = cas;
            encode_response(
                request.opcode,
                STATUS_SUCCESS,
                request.opaque,
                cas,
                &mutation_token_extras(cas),
                b"",
            )
        }
        _ => encode_response(request.opcode, STATUS_INVALID, request.opaque, 0, &[], b""),
    }
}

/// Cluster-config document as served by the mock nodes. `active` selects
/// which node every partition maps to.
pub fn config_document(
    rev: i64,
    epoch: i64,
    nodes: &[(&str, u16, Option<u16>)],
    active: i16,
) -> String {
    let nodes_ext: Vec<Value> = nodes
        .iter()
        .enumerate()
        .map(|(index, (hostname, kv_port, query_port))| {
            let mut services = json!({ "kv": kv_port });
            if let Some(query_port) = query_port {
                services["n1ql"] = json!(query_port);
            }
            let mut node = json!({
                "services": services,
                "hostname": hostname,
            });
            if index == 0 {
                node["thisNode"] = json!(true);
            }
            node
        })
        .collect();
    let vbmap: Vec<Vec<i16>> = (0..8).map(|_| vec![active]).collect();
    json!({
        "rev": rev,
        "revEpoch": epoch,
        "name": "default",
        "uuid": "a5a0694e6d8315b9c7998a189d60adb3",
        "nodeLocator": "vbucket",
        "nodesExt": nodes_ext,
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 0,
            "vBucketMap": vbmap,
        },
        "bucketCapabilities": ["durableWrite", "xattr"],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]},
    })
    .to_string()
}

/// A minimal query service: HTTP/1.1, keep-alive, JSON request and response.
pub struct MockQueryService {
    pub port: u16,
    pub prepare_count: Arc<AtomicUsize>,
}

impl MockQueryService {
    pub async fn start() -> MockQueryService {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prepare_count = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&prepare_count);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_query_connection(stream, Arc::clone(&count)));
            }
        });
        MockQueryService {
            port,
            prepare_count,
        }
    }
}

async fn serve_query_connection(mut stream: TcpStream, prepare_count: Arc<AtomicUsize>) {
    let mut buffer = Vec::new();
    loop {
        // Read one request: headers, then Content-Length bytes of body.
        let header_end = loop {
            if let Some(position) = find_subslice(&buffer, b"\r\n\r\n") {
                break position + 4;
            }
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        };
        let headers = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
        let content_length = headers
            .lines()
            .find_map(|line| {
                let (name, value) = line.split_once(':')?;
                if name.eq_ignore_ascii_case("content-length") {
                    value.trim().parse::<usize>().ok()
                } else {
                    None
                }
            })
            .unwrap_or(0);
        while buffer.len() < header_end + content_length {
            let mut chunk = [0u8; 4096];
            match stream.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
        let body: Value =
            serde_json::from_slice(&buffer[header_end..header_end + content_length])
                .unwrap_or(Value::Null);
        buffer.drain(..header_end + content_length);

        let response_body = query_response_for(&body, &prepare_count);
        let response = format!(
            "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\n\r\n{}",
            response_body.len(),
            response_body
        );
        if stream.write_all(response.as_bytes()).await.is_err() {
            return;
        }
    }
}

fn query_response_for(body: &Value, prepare_count: &AtomicUsize) -> String {
    let statement = body["statement"].as_str().unwrap_or_default();
    let prepared = body["prepared"].as_str();
    let row = json!({ "greeting": "ruby rules" });
    let client_context_id = body["client_context_id"].as_str().unwrap_or_default();

    let payload = if let Some(name) = prepared {
        assert_eq!(name, "p_4242");
        json!({
            "requestID": "req-2",
            "clientContextID": client_context_id,
            "status": "success",
            "results": [row],
            "metrics": {"resultCount": 1, "resultSize": 24, "elapsedTime": "1ms", "executionTime": "1ms"},
        })
    } else if statement.starts_with("PREPARE ") {
        prepare_count.fetch_add(1, Ordering::SeqCst);
        assert_eq!(body["auto_execute"], json!(true));
        json!({
            "requestID": "req-1",
            "clientContextID": client_context_id,
            "status": "success",
            "prepared": "p_4242",
            "results": [row],
            "metrics": {"resultCount": 1, "resultSize": 24, "elapsedTime": "1ms", "executionTime": "1ms"},
        })
    } else {
        json!({
            "requestID": "req-0",
            "clientContextID": client_context_id,
            "status": "success",
            "results": [row],
        })
    };
    payload.to_string()
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
