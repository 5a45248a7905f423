//! HTTP transport for the non-KV services: the request/response envelope the
//! per-service encoders plug into, keep-alive sessions, and the per-service
//! pool.

pub mod pool;
pub mod session;

use std::collections::HashMap;
use std::time::Duration;

use bytes::Bytes;

use crate::service::ServiceType;

/// The envelope every HTTP-service request reduces to.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub service: ServiceType,
    pub method: &'static str,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub content_type: Option<&'static str>,
    pub timeout: Option<Duration>,
    /// Correlates the request with service-side logs and the error context.
    pub client_context_id: Option<String>,
}

impl HttpRequest {
    pub fn new(service: ServiceType, method: &'static str, path: impl Into<String>) -> Self {
        HttpRequest {
            service,
            method,
            path: path.into(),
            headers: Vec::new(),
            body: Vec::new(),
            content_type: None,
            timeout: None,
            client_context_id: None,
        }
    }

    pub fn json(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self.content_type = Some("application/json");
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The envelope every HTTP-service response starts from.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Full body; empty when the caller consumed it through a chunk sink.
    pub body: Bytes,
}

/// Consumes streamed body chunks for row-oriented responses.
pub type ChunkSink = Box<dyn FnMut(Bytes) + Send>;

/// Map the rate/quota responses management endpoints emit on HTTP 429.
pub fn limit_error_kind(status: u16, body: &[u8]) -> Option<shoal_errors::ErrorKind> {
    if status != 429 {
        return None;
    }
    let body = String::from_utf8_lossy(body);
    if body.contains("Limit(s) exceeded") {
        return Some(shoal_errors::ErrorKind::RateLimited);
    }
    if body.contains("Maximum number of collections has been reached for scope") {
        return Some(shoal_errors::ErrorKind::QuotaLimited);
    }
    Some(shoal_errors::ErrorKind::RateLimited)
}

#[cfg(test)]
mod tests {
    use super::*;
    use shoal_errors::ErrorKind;

    #[test]
    fn http_429_body_sniffing() {
        assert_eq!(
            limit_error_kind(429, b"Limit(s) exceeded for bucket"),
            Some(ErrorKind::RateLimited)
        );
        assert_eq!(
            limit_error_kind(
                429,
                b"Maximum number of collections has been reached for scope \"s\""
            ),
            Some(ErrorKind::QuotaLimited)
        );
        assert_eq!(limit_error_kind(200, b"Limit(s) exceeded"), None);
    }
}
