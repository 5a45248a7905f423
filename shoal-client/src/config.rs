//! Caller-supplied configuration for a cluster connection.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::retry::{BestEffortRetryStrategy, RetryStrategy};
use crate::service::ServiceType;

/// Credentials presented during SASL (key-value) and Basic (HTTP) auth.
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print the password, even at trace level.
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// SASL mechanisms the key-value session may offer, strongest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    ScramSha512,
    ScramSha256,
    ScramSha1,
    Plain,
}

impl SaslMechanism {
    pub fn as_str(&self) -> &'static str {
        match self {
            SaslMechanism::ScramSha512 => "SCRAM-SHA512",
            SaslMechanism::ScramSha256 => "SCRAM-SHA256",
            SaslMechanism::ScramSha1 => "SCRAM-SHA1",
            SaslMechanism::Plain => "PLAIN",
        }
    }
}

/// IP protocol preference applied when resolving bootstrap and node names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpProtocol {
    #[default]
    Any,
    ForceIpv4,
    ForceIpv6,
}

/// Operation and connection deadlines.
#[derive(Debug, Clone)]
pub struct TimeoutOptions {
    pub bootstrap_timeout: Duration,
    pub resolve_timeout: Duration,
    pub connect_timeout: Duration,
    pub key_value_timeout: Duration,
    pub key_value_durable_timeout: Duration,
    pub query_timeout: Duration,
    pub analytics_timeout: Duration,
    pub search_timeout: Duration,
    pub view_timeout: Duration,
    pub management_timeout: Duration,
}

impl Default for TimeoutOptions {
    fn default() -> Self {
        TimeoutOptions {
            bootstrap_timeout: Duration::from_secs(10),
            resolve_timeout: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(10),
            key_value_timeout: Duration::from_millis(2_500),
            key_value_durable_timeout: Duration::from_secs(10),
            query_timeout: Duration::from_secs(75),
            analytics_timeout: Duration::from_secs(75),
            search_timeout: Duration::from_secs(75),
            view_timeout: Duration::from_secs(75),
            management_timeout: Duration::from_secs(75),
        }
    }
}

impl TimeoutOptions {
    pub fn for_service(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::KeyValue => self.key_value_timeout,
            ServiceType::Query => self.query_timeout,
            ServiceType::Analytics => self.analytics_timeout,
            ServiceType::Search => self.search_timeout,
            ServiceType::Views => self.view_timeout,
            ServiceType::Eventing | ServiceType::Management => self.management_timeout,
        }
    }
}

/// TLS settings; certificates themselves are handled by `native-tls`.
#[derive(Debug, Clone, Default)]
pub struct SecurityOptions {
    pub enabled: bool,
    /// Trust anything. Only for test rigs.
    pub accept_all_certificates: bool,
    /// Allow PLAIN SASL on non-TLS transports.
    pub allow_plain_without_tls: bool,
}

/// Snappy compression of outgoing values on sessions that negotiated it.
#[derive(Debug, Clone)]
pub struct CompressionOptions {
    pub enabled: bool,
    /// Values smaller than this are never compressed.
    pub min_size: usize,
    /// Compressed form must be at most this fraction of the original.
    pub min_ratio: f64,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        CompressionOptions {
            enabled: true,
            min_size: 32,
            min_ratio: 0.83,
        }
    }
}

/// Orphan-response reporting knobs.
#[derive(Debug, Clone)]
pub struct OrphanOptions {
    pub emit_interval: Duration,
    pub sample_size: usize,
}

impl Default for OrphanOptions {
    fn default() -> Self {
        OrphanOptions {
            emit_interval: Duration::from_secs(10),
            sample_size: 64,
        }
    }
}

/// Slow-operation (threshold) reporting knobs.
#[derive(Debug, Clone)]
pub struct ThresholdOptions {
    pub emit_interval: Duration,
    pub sample_size: usize,
    pub key_value_threshold: Duration,
    pub query_threshold: Duration,
    pub view_threshold: Duration,
    pub search_threshold: Duration,
    pub analytics_threshold: Duration,
    pub eventing_threshold: Duration,
    pub management_threshold: Duration,
}

impl Default for ThresholdOptions {
    fn default() -> Self {
        ThresholdOptions {
            emit_interval: Duration::from_secs(10),
            sample_size: 64,
            key_value_threshold: Duration::from_millis(500),
            query_threshold: Duration::from_secs(1),
            view_threshold: Duration::from_secs(1),
            search_threshold: Duration::from_secs(1),
            analytics_threshold: Duration::from_secs(1),
            eventing_threshold: Duration::from_secs(1),
            management_threshold: Duration::from_secs(1),
        }
    }
}

impl ThresholdOptions {
    pub fn threshold_for(&self, service: ServiceType) -> Duration {
        match service {
            ServiceType::KeyValue => self.key_value_threshold,
            ServiceType::Query => self.query_threshold,
            ServiceType::Views => self.view_threshold,
            ServiceType::Search => self.search_threshold,
            ServiceType::Analytics => self.analytics_threshold,
            ServiceType::Eventing => self.eventing_threshold,
            ServiceType::Management => self.management_threshold,
        }
    }
}

/// Everything the cluster facade needs to bootstrap and run.
#[derive(Debug, Clone)]
pub struct ClusterOptions {
    /// Bootstrap hosts, `host` or `host:port`.
    pub seed_hosts: Vec<String>,
    pub credentials: Credentials,
    pub security: SecurityOptions,
    pub timeouts: TimeoutOptions,
    pub compression: CompressionOptions,
    pub orphan: OrphanOptions,
    pub threshold: ThresholdOptions,
    /// Preferred network name; `None` selects one from the bootstrap host.
    pub network: Option<String>,
    pub ip_protocol: IpProtocol,
    pub sasl_mechanisms: Vec<SaslMechanism>,
    pub retry_strategy: Arc<dyn RetryStrategy>,
    pub config_poll_interval: Duration,
    pub idle_http_connection_timeout: Duration,
    pub tcp_keepalive_interval: Duration,
    /// Appended to the generated `User-Agent` header.
    pub user_agent_extra: Option<String>,
}

impl Default for ClusterOptions {
    fn default() -> Self {
        ClusterOptions {
            seed_hosts: Vec::new(),
            credentials: Credentials::default(),
            security: SecurityOptions::default(),
            timeouts: TimeoutOptions::default(),
            compression: CompressionOptions::default(),
            orphan: OrphanOptions::default(),
            threshold: ThresholdOptions::default(),
            network: None,
            ip_protocol: IpProtocol::default(),
            sasl_mechanisms: vec![
                SaslMechanism::ScramSha512,
                SaslMechanism::ScramSha256,
                SaslMechanism::ScramSha1,
            ],
            retry_strategy: Arc::new(BestEffortRetryStrategy::default()),
            config_poll_interval: Duration::from_millis(2_500),
            idle_http_connection_timeout: Duration::from_millis(4_500),
            tcp_keepalive_interval: Duration::from_secs(60),
            user_agent_extra: None,
        }
    }
}

impl ClusterOptions {
    /// Mechanisms actually offered on a transport, applying the PLAIN
    /// restriction from [`SecurityOptions`].
    pub fn effective_sasl_mechanisms(&self, tls: bool) -> Vec<SaslMechanism> {
        let mut mechanisms = self.sasl_mechanisms.clone();
        if (tls || self.security.allow_plain_without_tls)
            && !mechanisms.contains(&SaslMechanism::Plain)
        {
            mechanisms.push(SaslMechanism::Plain);
        }
        if !tls && !self.security.allow_plain_without_tls {
            mechanisms.retain(|m| *m != SaslMechanism::Plain);
        }
        mechanisms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_is_withheld_without_tls() {
        let mut options = ClusterOptions::default();
        options.sasl_mechanisms.push(SaslMechanism::Plain);
        let offered = options.effective_sasl_mechanisms(false);
        assert!(!offered.contains(&SaslMechanism::Plain));
        let offered = options.effective_sasl_mechanisms(true);
        assert!(offered.contains(&SaslMechanism::Plain));
    }

    #[test]
    fn debug_never_leaks_password() {
        let credentials = Credentials {
            username: "app".into(),
            password: "hunter2".into(),
        };
        let rendered = format!("{credentials:?}");
        assert!(!rendered.contains("hunter2"));
    }
}
