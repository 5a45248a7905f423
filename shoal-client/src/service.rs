//! Service taxonomy of a Shoal cluster.

use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// One of the services a cluster node may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceType {
    #[serde(rename = "kv")]
    KeyValue,
    Query,
    Search,
    Analytics,
    #[serde(rename = "views")]
    Views,
    Eventing,
    #[serde(rename = "mgmt")]
    Management,
}

impl ServiceType {
    /// All services reached over HTTP (everything except key-value).
    pub const HTTP: [ServiceType; 6] = [
        ServiceType::Query,
        ServiceType::Search,
        ServiceType::Analytics,
        ServiceType::Views,
        ServiceType::Eventing,
        ServiceType::Management,
    ];

    /// Short name used in reports, spans and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "kv",
            ServiceType::Query => "query",
            ServiceType::Search => "search",
            ServiceType::Analytics => "analytics",
            ServiceType::Views => "views",
            ServiceType::Eventing => "eventing",
            ServiceType::Management => "mgmt",
        }
    }

    /// Path of the lightweight request used by `ping` for this service.
    pub fn noop_path(&self) -> &'static str {
        match self {
            ServiceType::KeyValue => "",
            ServiceType::Query => "/admin/ping",
            ServiceType::Analytics => "/admin/ping",
            ServiceType::Search => "/api/ping",
            ServiceType::Views | ServiceType::Eventing | ServiceType::Management => "/",
        }
    }
}

impl Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
