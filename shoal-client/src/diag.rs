//! Diagnostics and ping result documents (report format version 2).

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::service::ServiceType;

/// Liveness of one endpoint as seen by `ping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PingState {
    Ok,
    Timeout,
    Error,
}

/// Connectivity of one endpoint as seen by `diagnostics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

/// One `ping` probe result.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointPingInfo {
    pub id: String,
    pub latency_us: u64,
    pub remote: String,
    pub local: String,
    pub state: PingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One endpoint snapshot in a `diagnostics` report.
#[derive(Debug, Clone, Serialize)]
pub struct EndpointDiagInfo {
    pub id: String,
    pub last_activity_us: u64,
    pub remote: String,
    pub local: String,
    pub state: EndpointState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Result of [`Cluster::ping`](crate::cluster::Cluster::ping).
#[derive(Debug, Clone, Serialize)]
pub struct PingResult {
    pub version: u16,
    pub id: String,
    pub sdk: String,
    pub services: HashMap<ServiceType, Vec<EndpointPingInfo>>,
}

impl PingResult {
    pub fn new(id: String) -> Self {
        PingResult {
            version: 2,
            id,
            sdk: crate::sdk_id(),
            services: HashMap::new(),
        }
    }

    pub fn record(&mut self, service: ServiceType, info: EndpointPingInfo) {
        self.services.entry(service).or_default().push(info);
    }
}

/// Result of [`Cluster::diagnostics`](crate::cluster::Cluster::diagnostics).
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsResult {
    pub version: u16,
    pub id: String,
    pub sdk: String,
    pub services: HashMap<ServiceType, Vec<EndpointDiagInfo>>,
}

impl DiagnosticsResult {
    pub fn new(id: String) -> Self {
        DiagnosticsResult {
            version: 2,
            id,
            sdk: crate::sdk_id(),
            services: HashMap::new(),
        }
    }

    pub fn record(&mut self, service: ServiceType, info: EndpointDiagInfo) {
        self.services.entry(service).or_default().push(info);
    }
}

pub(crate) fn duration_us(duration: Duration) -> u64 {
    duration.as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_result_serializes_v2_shape() {
        let mut result = PingResult::new("client-1".into());
        result.record(
            ServiceType::KeyValue,
            EndpointPingInfo {
                id: "s1".into(),
                latency_us: 120,
                remote: "10.0.0.1:11210".into(),
                local: "10.0.0.9:51234".into(),
                state: PingState::Ok,
                namespace: Some("default".into()),
                error: None,
            },
        );
        let doc = serde_json::to_value(&result).unwrap();
        assert_eq!(doc["version"], 2);
        assert_eq!(doc["id"], "client-1");
        assert_eq!(doc["services"]["kv"][0]["state"], "ok");
        assert!(doc["services"]["kv"][0].get("error").is_none());
    }
}
