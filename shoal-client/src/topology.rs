//! Cluster topology model: an immutable snapshot of nodes, service ports,
//! the vbucket map, and capability sets, plus the routing math over it.
//!
//! Snapshots are totally ordered by `(epoch, rev)`; the facade only ever
//! adopts a strictly greater snapshot, so readers can treat a snapshot as
//! consistent for the lifetime of one request attempt.

use std::collections::{HashMap, HashSet};
use std::fmt::{self, Display};

use serde::Deserialize;
use shoal_errors::{ErrorKind, ShoalError, ShoalResult};

use crate::service::ServiceType;

/// The default network name; everything else is an alternate address set.
pub const DEFAULT_NETWORK: &str = "default";

/// Snapshot ordering key. Lexicographic on `(epoch, rev)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Hash)]
pub struct ConfigVersion {
    pub epoch: i64,
    pub rev: i64,
}

impl Display for ConfigVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.rev)
    }
}

/// Ports a node exposes for each service, one map for plain and one for TLS.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortMap {
    pub key_value: Option<u16>,
    pub management: Option<u16>,
    pub analytics: Option<u16>,
    pub search: Option<u16>,
    pub views: Option<u16>,
    pub query: Option<u16>,
    pub eventing: Option<u16>,
}

impl PortMap {
    pub fn get(&self, service: ServiceType) -> Option<u16> {
        match service {
            ServiceType::KeyValue => self.key_value,
            ServiceType::Management => self.management,
            ServiceType::Analytics => self.analytics,
            ServiceType::Search => self.search,
            ServiceType::Views => self.views,
            ServiceType::Query => self.query,
            ServiceType::Eventing => self.eventing,
        }
    }
}

/// A named secondary address set for reaching the node across NAT.
#[derive(Debug, Clone, Default)]
pub struct AlternateAddress {
    pub name: String,
    pub hostname: String,
    pub services_plain: PortMap,
    pub services_tls: PortMap,
}

/// One cluster node as seen by the topology snapshot.
#[derive(Debug, Clone, Default)]
pub struct Node {
    pub this_node: bool,
    pub index: usize,
    pub hostname: String,
    pub services_plain: PortMap,
    pub services_tls: PortMap,
    pub alt: HashMap<String, AlternateAddress>,
}

impl Node {
    /// Port for `service` on `network`, or 0 when the node does not host it.
    pub fn port(&self, network: &str, service: ServiceType, tls: bool) -> u16 {
        if network != DEFAULT_NETWORK {
            let Some(alt) = self.alt.get(network) else {
                return 0;
            };
            let ports = if tls {
                &alt.services_tls
            } else {
                &alt.services_plain
            };
            return ports.get(service).unwrap_or(0);
        }
        let ports = if tls {
            &self.services_tls
        } else {
            &self.services_plain
        };
        ports.get(service).unwrap_or(0)
    }

    /// Hostname to dial on `network`; falls back to the default hostname when
    /// the alternate set does not carry one.
    pub fn hostname_for(&self, network: &str) -> &str {
        if network != DEFAULT_NETWORK {
            if let Some(alt) = self.alt.get(network) {
                if !alt.hostname.is_empty() {
                    return &alt.hostname;
                }
            }
        }
        &self.hostname
    }
}

/// How keys are mapped onto nodes for this bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeLocator {
    #[default]
    Unknown,
    Vbucket,
    Ketama,
}

/// Bucket-level feature advertisements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum BucketCapability {
    DurableWrite,
    Collections,
    Xattr,
    RangeScan,
    Dcp,
    Cccp,
    Touch,
    CouchApi,
    NodesExt,
    SubdocReplaceBodyWithXattr,
    SubdocDocumentMacroSupport,
}

impl BucketCapability {
    fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "durableWrite" => BucketCapability::DurableWrite,
            "collections" => BucketCapability::Collections,
            "xattr" => BucketCapability::Xattr,
            "rangeScan" => BucketCapability::RangeScan,
            "dcp" => BucketCapability::Dcp,
            "cccp" => BucketCapability::Cccp,
            "touch" => BucketCapability::Touch,
            "couchapi" => BucketCapability::CouchApi,
            "nodesExt" => BucketCapability::NodesExt,
            "subdoc.ReplaceBodyWithXattr" => BucketCapability::SubdocReplaceBodyWithXattr,
            "subdoc.DocumentMacroSupport" => BucketCapability::SubdocDocumentMacroSupport,
            _ => return None,
        })
    }
}

/// Cluster-level feature advertisements, keyed by owning service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ClusterCapability {
    QueryEnhancedPreparedStatements,
    QueryReadFromReplica,
}

impl ClusterCapability {
    fn parse(group: &str, raw: &str) -> Option<Self> {
        match (group, raw) {
            ("n1ql", "enhancedPreparedStatements") => {
                Some(ClusterCapability::QueryEnhancedPreparedStatements)
            }
            ("n1ql", "readFromReplica") => Some(ClusterCapability::QueryReadFromReplica),
            _ => None,
        }
    }
}

/// `vbmap[partition] = [active_node_index, replica_indices...]`, -1 = none.
pub type VbucketMap = Vec<Vec<i16>>;

/// An immutable topology snapshot.
#[derive(Debug, Clone, Default)]
pub struct ClusterConfig {
    pub version: ConfigVersion,
    pub cluster_uuid: Option<String>,
    pub bucket: Option<String>,
    pub bucket_uuid: Option<String>,
    pub num_replicas: Option<u32>,
    pub nodes: Vec<Node>,
    pub vbmap: Option<VbucketMap>,
    pub node_locator: NodeLocator,
    pub bucket_capabilities: HashSet<BucketCapability>,
    pub cluster_capabilities: HashSet<ClusterCapability>,
}

impl PartialEq for ClusterConfig {
    fn eq(&self, other: &Self) -> bool {
        self.version == other.version
    }
}

impl ClusterConfig {
    /// Pick the network name for this client: "external" when the bootstrap
    /// host matches any node's external alternate address, "default"
    /// otherwise. Decided once per bootstrap.
    pub fn select_network(&self, bootstrap_hostname: &str) -> String {
        for node in &self.nodes {
            if node.hostname == bootstrap_hostname {
                return DEFAULT_NETWORK.to_string();
            }
            if let Some(alt) = node.alt.get("external") {
                if alt.hostname == bootstrap_hostname {
                    return "external".to_string();
                }
            }
        }
        DEFAULT_NETWORK.to_string()
    }

    pub fn supports_enhanced_prepared_statements(&self) -> bool {
        self.cluster_capabilities
            .contains(&ClusterCapability::QueryEnhancedPreparedStatements)
    }

    pub fn supports_query_read_from_replica(&self) -> bool {
        self.cluster_capabilities
            .contains(&ClusterCapability::QueryReadFromReplica)
    }

    pub fn supports_collections(&self) -> bool {
        self.bucket_capabilities
            .contains(&BucketCapability::Collections)
    }

    pub fn supports_durable_writes(&self) -> bool {
        self.bucket_capabilities
            .contains(&BucketCapability::DurableWrite)
    }

    pub fn supports_range_scan(&self) -> bool {
        self.bucket_capabilities
            .contains(&BucketCapability::RangeScan)
    }

    /// Number of vbuckets in the map, 0 when the bucket has no map yet.
    pub fn num_vbuckets(&self) -> u16 {
        self.vbmap.as_ref().map(|m| m.len() as u16).unwrap_or(0)
    }

    /// Map a key to its partition.
    pub fn partition_for_key(&self, key: &[u8]) -> ShoalResult<u16> {
        let num = self.num_vbuckets();
        if num == 0 {
            return Err(ShoalError::with_message(
                ErrorKind::ServiceNotAvailable,
                "bucket has no vbucket map",
            ));
        }
        let crc = crc32fast::hash(key);
        Ok((((crc >> 16) & 0x7fff) % u32::from(num)) as u16)
    }

    /// Node index serving `partition`: the active when `replica_index` is
    /// `None`, or the given replica. -1 entries mean "no node".
    pub fn server_by_partition(&self, partition: u16, replica_index: Option<usize>) -> Option<usize> {
        let map = self.vbmap.as_ref()?;
        let chain = map.get(partition as usize)?;
        let slot = replica_index.map(|r| r + 1).unwrap_or(0);
        match chain.get(slot) {
            Some(index) if *index >= 0 => Some(*index as usize),
            _ => None,
        }
    }

    /// Map a key straight to `(partition, node index)`.
    pub fn map_key(&self, key: &[u8], replica_index: Option<usize>) -> ShoalResult<(u16, Option<usize>)> {
        let partition = self.partition_for_key(key)?;
        Ok((partition, self.server_by_partition(partition, replica_index)))
    }

    /// Indices of all nodes hosting `service` on `network`.
    pub fn nodes_with_service(&self, network: &str, service: ServiceType, tls: bool) -> Vec<usize> {
        self.nodes
            .iter()
            .filter(|node| node.port(network, service, tls) != 0)
            .map(|node| node.index)
            .collect()
    }

    /// Parse a topology document as served by the cluster, substituting
    /// `$HOST` placeholders with the origin hostname.
    pub fn parse(raw: &str, origin_hostname: &str) -> ShoalResult<ClusterConfig> {
        let substituted = raw.replace("$HOST", origin_hostname);
        let terse: TerseConfig = serde_json::from_str(&substituted)
            .map_err(|e| ShoalError::with_source(ErrorKind::ParsingFailure, e))?;
        Ok(terse.into_config(origin_hostname))
    }
}

// Wire shape of the server's terse configuration document.

#[derive(Debug, Deserialize)]
struct TerseConfig {
    rev: i64,
    #[serde(rename = "revEpoch", default)]
    rev_epoch: i64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(rename = "clusterUUID", default)]
    cluster_uuid: Option<String>,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<TerseNodeExt>,
    #[serde(rename = "nodeLocator", default)]
    node_locator: Option<String>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<TerseVbucketServerMap>,
    #[serde(rename = "bucketCapabilities", default)]
    bucket_capabilities: Vec<String>,
    #[serde(rename = "clusterCapabilities", default)]
    cluster_capabilities: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct TerseNodeExt {
    #[serde(default)]
    services: HashMap<String, u16>,
    #[serde(rename = "thisNode", default)]
    this_node: bool,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(rename = "alternateAddresses", default)]
    alternate_addresses: HashMap<String, TerseAlternateAddress>,
}

#[derive(Debug, Deserialize)]
struct TerseAlternateAddress {
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default)]
    ports: HashMap<String, u16>,
}

#[derive(Debug, Deserialize)]
struct TerseVbucketServerMap {
    #[serde(rename = "numReplicas", default)]
    num_replicas: u32,
    #[serde(rename = "vBucketMap", default)]
    vbucket_map: Vec<Vec<i16>>,
}

fn split_ports(ports: &HashMap<String, u16>) -> (PortMap, PortMap) {
    let mut plain = PortMap::default();
    let mut tls = PortMap::default();
    for (name, port) in ports {
        match name.as_str() {
            "kv" => plain.key_value = Some(*port),
            "kvSSL" => tls.key_value = Some(*port),
            "mgmt" => plain.management = Some(*port),
            "mgmtSSL" => tls.management = Some(*port),
            "capi" => plain.views = Some(*port),
            "capiSSL" => tls.views = Some(*port),
            "n1ql" => plain.query = Some(*port),
            "n1qlSSL" => tls.query = Some(*port),
            "fts" => plain.search = Some(*port),
            "ftsSSL" => tls.search = Some(*port),
            "cbas" => plain.analytics = Some(*port),
            "cbasSSL" => tls.analytics = Some(*port),
            "eventingAdminPort" => plain.eventing = Some(*port),
            "eventingSSL" => tls.eventing = Some(*port),
            _ => {}
        }
    }
    (plain, tls)
}

impl TerseConfig {
    fn into_config(self, origin_hostname: &str) -> ClusterConfig {
        let nodes = self
            .nodes_ext
            .into_iter()
            .enumerate()
            .map(|(index, ext)| {
                let (services_plain, services_tls) = split_ports(&ext.services);
                let alt = ext
                    .alternate_addresses
                    .into_iter()
                    .map(|(name, alt)| {
                        let (plain, tls) = split_ports(&alt.ports);
                        (
                            name.clone(),
                            AlternateAddress {
                                name,
                                hostname: alt.hostname.unwrap_or_default(),
                                services_plain: plain,
                                services_tls: tls,
                            },
                        )
                    })
                    .collect();
                Node {
                    this_node: ext.this_node,
                    index,
                    hostname: ext
                        .hostname
                        .unwrap_or_else(|| origin_hostname.to_string()),
                    services_plain,
                    services_tls,
                    alt,
                }
            })
            .collect();

        let node_locator = match self.node_locator.as_deref() {
            Some("vbucket") => NodeLocator::Vbucket,
            Some("ketama") => NodeLocator::Ketama,
            _ => NodeLocator::Unknown,
        };

        let bucket_capabilities = self
            .bucket_capabilities
            .iter()
            .filter_map(|raw| BucketCapability::parse(raw))
            .collect();
        let cluster_capabilities = self
            .cluster_capabilities
            .iter()
            .flat_map(|(group, values)| {
                values
                    .iter()
                    .filter_map(move |raw| ClusterCapability::parse(group, raw))
            })
            .collect();

        let (num_replicas, vbmap) = match self.vbucket_server_map {
            Some(map) => (Some(map.num_replicas), Some(map.vbucket_map)),
            None => (None, None),
        };

        ClusterConfig {
            version: ConfigVersion {
                epoch: self.rev_epoch,
                rev: self.rev,
            },
            cluster_uuid: self.cluster_uuid,
            bucket: self.name,
            bucket_uuid: self.uuid,
            num_replicas,
            nodes,
            vbmap,
            node_locator,
            bucket_capabilities,
            cluster_capabilities,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "rev": 1073,
        "revEpoch": 2,
        "name": "default",
        "uuid": "6e1a4f2054f692d6bb292f1bce8efcc0",
        "nodeLocator": "vbucket",
        "nodesExt": [
            {
                "services": {"kv": 11210, "kvSSL": 11207, "mgmt": 8091, "mgmtSSL": 18091, "n1ql": 8093, "n1qlSSL": 18093},
                "thisNode": true,
                "alternateAddresses": {
                    "external": {
                        "hostname": "203.0.113.10",
                        "ports": {"kv": 31210, "kvSSL": 31207, "n1ql": 38093}
                    }
                }
            },
            {
                "services": {"kv": 11210, "fts": 8094},
                "hostname": "node2.internal"
            }
        ],
        "vBucketServerMap": {
            "hashAlgorithm": "CRC",
            "numReplicas": 1,
            "serverList": ["$HOST:11210", "node2.internal:11210"],
            "vBucketMap": [[0, 1], [1, 0], [0, -1], [1, -1]]
        },
        "bucketCapabilities": ["durableWrite", "collections", "xattr", "rangeScan"],
        "clusterCapabilities": {"n1ql": ["enhancedPreparedStatements"]}
    }"#;

    fn sample() -> ClusterConfig {
        ClusterConfig::parse(SAMPLE, "node1.internal").unwrap()
    }

    #[test]
    fn parses_terse_document() {
        let config = sample();
        assert_eq!(config.version, ConfigVersion { epoch: 2, rev: 1073 });
        assert_eq!(config.bucket.as_deref(), Some("default"));
        assert_eq!(config.nodes.len(), 2);
        assert!(config.nodes[0].this_node);
        assert_eq!(config.nodes[0].hostname, "node1.internal");
        assert_eq!(config.nodes[1].hostname, "node2.internal");
        assert_eq!(config.num_replicas, Some(1));
        assert_eq!(config.node_locator, NodeLocator::Vbucket);
        assert!(config.supports_collections());
        assert!(config.supports_durable_writes());
        assert!(config.supports_enhanced_prepared_statements());
        assert!(!config.supports_query_read_from_replica());
    }

    #[test]
    fn port_selection_prefers_alternate_network() {
        let config = sample();
        let node = &config.nodes[0];
        assert_eq!(node.port(DEFAULT_NETWORK, ServiceType::KeyValue, false), 11210);
        assert_eq!(node.port(DEFAULT_NETWORK, ServiceType::KeyValue, true), 11207);
        assert_eq!(node.port("external", ServiceType::KeyValue, false), 31210);
        assert_eq!(node.port("external", ServiceType::Query, false), 38093);
        // Not advertised on the external network.
        assert_eq!(node.port("external", ServiceType::Management, false), 0);
        // Service not hosted at all.
        assert_eq!(config.nodes[1].port(DEFAULT_NETWORK, ServiceType::Query, false), 0);
        assert_eq!(node.hostname_for("external"), "203.0.113.10");
        assert_eq!(config.nodes[1].hostname_for("external"), "node2.internal");
    }

    #[test]
    fn network_selection_matches_bootstrap_host() {
        let config = sample();
        assert_eq!(config.select_network("node1.internal"), "default");
        assert_eq!(config.select_network("203.0.113.10"), "external");
        assert_eq!(config.select_network("unrelated.example"), "default");
    }

    #[test]
    fn version_ordering_is_lexicographic() {
        let v = |epoch, rev| ConfigVersion { epoch, rev };
        assert!(v(1, 5) < v(2, 1));
        assert!(v(2, 1) < v(2, 2));
        assert_eq!(v(2, 2), v(2, 2));
        assert!(v(2, 2) > v(1, 100));
    }

    #[test]
    fn vbucket_mapping_uses_crc32_fold() {
        let config = sample();
        // 4 partitions in the sample map.
        let (partition, active) = config.map_key(b"foo", None).unwrap();
        let crc = crc32fast::hash(b"foo");
        assert_eq!(partition, (((crc >> 16) & 0x7fff) % 4) as u16);
        let chain = &config.vbmap.as_ref().unwrap()[partition as usize];
        assert_eq!(active, Some(chain[0] as usize));
    }

    #[test]
    fn missing_replica_maps_to_none() {
        let config = sample();
        assert_eq!(config.server_by_partition(2, Some(0)), None);
        assert_eq!(config.server_by_partition(2, None), Some(0));
        assert_eq!(config.server_by_partition(0, Some(0)), Some(1));
    }

    #[test]
    fn nodes_with_service_filters_by_port() {
        let config = sample();
        assert_eq!(
            config.nodes_with_service(DEFAULT_NETWORK, ServiceType::KeyValue, false),
            vec![0, 1]
        );
        assert_eq!(
            config.nodes_with_service(DEFAULT_NETWORK, ServiceType::Search, false),
            vec![1]
        );
        assert_eq!(
            config.nodes_with_service(DEFAULT_NETWORK, ServiceType::Analytics, false),
            Vec::<usize>::new()
        );
    }
}
