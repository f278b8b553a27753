// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cluster topology model.
//!
//! A [`ClusterConfig`] is the immutable, parsed form of one bucket-config
//! document as served over CCCP or the HTTP streaming endpoint. Configs are
//! shared by `Arc` between the monitor, the providers, and the command
//! queue, and compared by `(rev, compare_clock)` — see [`ClusterConfig::is_newer_than`].

pub mod ketama;
pub mod vbucket;

pub use ketama::KetamaRing;
pub use vbucket::{ConfigDiff, VbucketMap};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Deserialize;

use crate::error::{CouchError, Result};

/// Placeholder the server emits for "the address you contacted me on".
pub const HOST_PLACEHOLDER: &str = "$HOST";

// Monotonic stamp attached to each parsed config, for ordering configs
// that carry no usable revision.
static COMPARE_CLOCK: AtomicU64 = AtomicU64::new(1);

/// Which provider produced a config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigOrigin {
    Cccp,
    HttpStream,
    File,
    Static,
    /// Pushed from a NOT_MY_VBUCKET payload.
    Nmv,
}

/// Key distribution algorithm for the bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Distribution {
    #[default]
    Vbucket,
    Ketama,
}

/// Per-node service ports, from `nodesExt`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServicePorts {
    pub kv: Option<u16>,
    #[serde(rename = "kvSSL")]
    pub kv_ssl: Option<u16>,
    pub mgmt: Option<u16>,
    #[serde(rename = "mgmtSSL")]
    pub mgmt_ssl: Option<u16>,
    pub capi: Option<u16>,
    #[serde(rename = "capiSSL")]
    pub capi_ssl: Option<u16>,
    pub n1ql: Option<u16>,
    #[serde(rename = "n1qlSSL")]
    pub n1ql_ssl: Option<u16>,
    pub fts: Option<u16>,
    #[serde(rename = "ftsSSL")]
    pub fts_ssl: Option<u16>,
    pub cbas: Option<u16>,
    #[serde(rename = "cbasSSL")]
    pub cbas_ssl: Option<u16>,
    #[serde(rename = "eventingAdminPort")]
    pub eventing: Option<u16>,
    #[serde(rename = "eventingSSL")]
    pub eventing_ssl: Option<u16>,
}

/// A service a request can target. Used by HTTP node selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    Kv,
    Mgmt,
    Views,
    Query,
    Search,
    Analytics,
    Eventing,
}

#[derive(Debug, Clone, Deserialize)]
struct RawNodeExt {
    #[serde(default)]
    services: ServicePorts,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default, rename = "thisNode")]
    this_node: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct RawVbucketServerMap {
    #[serde(rename = "hashAlgorithm", default)]
    hash_algorithm: String,
    #[serde(rename = "numReplicas")]
    num_replicas: u16,
    #[serde(rename = "serverList")]
    server_list: Vec<String>,
    #[serde(rename = "vBucketMap")]
    vbucket_map: Vec<Vec<i32>>,
    #[serde(rename = "vBucketMapForward", default)]
    vbucket_map_forward: Option<Vec<Vec<i32>>>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    #[serde(default)]
    rev: Option<i64>,
    #[serde(rename = "revEpoch", default)]
    rev_epoch: Option<i64>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    uuid: Option<String>,
    #[serde(rename = "nodeLocator", default)]
    node_locator: Option<String>,
    #[serde(rename = "nodesExt", default)]
    nodes_ext: Vec<RawNodeExt>,
    #[serde(rename = "vBucketServerMap", default)]
    vbucket_server_map: Option<RawVbucketServerMap>,
    #[serde(rename = "bucketCapabilities", default)]
    bucket_capabilities: Vec<String>,
}

/// One cluster node with resolved hostname and service ports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeEntry {
    pub hostname: String,
    pub services: ServicePorts,
    pub this_node: bool,
}

impl NodeEntry {
    /// Address for a service, honouring the TLS flavour.
    #[must_use]
    pub fn service_address(&self, service: ServiceType, tls: bool) -> Option<(String, u16)> {
        let port = match (service, tls) {
            (ServiceType::Kv, false) => self.services.kv,
            (ServiceType::Kv, true) => self.services.kv_ssl,
            (ServiceType::Mgmt, false) => self.services.mgmt,
            (ServiceType::Mgmt, true) => self.services.mgmt_ssl,
            (ServiceType::Views, false) => self.services.capi,
            (ServiceType::Views, true) => self.services.capi_ssl,
            (ServiceType::Query, false) => self.services.n1ql,
            (ServiceType::Query, true) => self.services.n1ql_ssl,
            (ServiceType::Search, false) => self.services.fts,
            (ServiceType::Search, true) => self.services.fts_ssl,
            (ServiceType::Analytics, false) => self.services.cbas,
            (ServiceType::Analytics, true) => self.services.cbas_ssl,
            (ServiceType::Eventing, false) => self.services.eventing,
            (ServiceType::Eventing, true) => self.services.eventing_ssl,
        }?;
        Some((self.hostname.clone(), port))
    }

    #[must_use]
    pub fn kv_address(&self, tls: bool) -> Option<(String, u16)> {
        self.service_address(ServiceType::Kv, tls)
    }
}

/// Immutable parsed topology.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub rev: Option<i64>,
    pub rev_epoch: i64,
    pub bucket_name: Option<String>,
    pub uuid: Option<String>,
    pub distribution: Distribution,
    pub nodes: Vec<NodeEntry>,
    pub vbmap: Option<VbucketMap>,
    pub ketama: Option<KetamaRing>,
    pub bucket_capabilities: Vec<String>,
    pub origin: ConfigOrigin,
    pub compare_clock: u64,
    /// The source document, kept for the config-cache write-back path.
    pub raw: bytes::Bytes,
}

pub type SharedConfig = Arc<ClusterConfig>;

impl ClusterConfig {
    /// Parse a config document. `origin_host` replaces the `$HOST`
    /// placeholder the server uses for its own address.
    pub fn parse(raw: &[u8], origin_host: &str, origin: ConfigOrigin) -> Result<Self> {
        let doc: RawConfig = serde_json::from_slice(raw)
            .map_err(|e| CouchError::Protocol(format!("config parse: {e}")))?;

        let distribution = match doc.node_locator.as_deref() {
            Some("ketama") => Distribution::Ketama,
            _ => Distribution::Vbucket,
        };

        let mut nodes = Vec::with_capacity(doc.nodes_ext.len());
        for raw_node in &doc.nodes_ext {
            let hostname = match raw_node.hostname.as_deref() {
                None | Some("") => origin_host.to_string(),
                Some(h) => h.replace(HOST_PLACEHOLDER, origin_host),
            };
            nodes.push(NodeEntry {
                hostname,
                services: raw_node.services.clone(),
                this_node: raw_node.this_node,
            });
        }

        let mut vbmap = None;
        let mut ketama = None;
        match distribution {
            Distribution::Vbucket => {
                if let Some(raw_map) = doc.vbucket_server_map {
                    let server_list: Vec<String> = raw_map
                        .server_list
                        .iter()
                        .map(|s| s.replace(HOST_PLACEHOLDER, origin_host))
                        .collect();
                    vbmap = Some(VbucketMap::new(
                        server_list,
                        raw_map.num_replicas,
                        raw_map.vbucket_map,
                        raw_map.vbucket_map_forward,
                        &raw_map.hash_algorithm,
                    )?);
                }
            }
            Distribution::Ketama => {
                let servers: Vec<String> = nodes
                    .iter()
                    .filter_map(|n| n.kv_address(false))
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect();
                ketama = Some(KetamaRing::new(&servers));
            }
        }

        Ok(Self {
            rev: doc.rev,
            rev_epoch: doc.rev_epoch.unwrap_or(0),
            bucket_name: doc.name,
            uuid: doc.uuid,
            distribution,
            nodes,
            vbmap,
            ketama,
            bucket_capabilities: doc.bucket_capabilities,
            origin,
            compare_clock: COMPARE_CLOCK.fetch_add(1, Ordering::Relaxed),
            raw: bytes::Bytes::copy_from_slice(raw),
        })
    }

    /// Synthesise a config from a plain host list (raw-memcached and
    /// cluster-admin bootstrap modes).
    #[must_use]
    pub fn synthesize(hosts: &[(String, u16)], distribution: Distribution) -> Self {
        let nodes: Vec<NodeEntry> = hosts
            .iter()
            .map(|(h, p)| NodeEntry {
                hostname: h.clone(),
                services: ServicePorts {
                    kv: Some(*p),
                    mgmt: Some(DEFAULT_MGMT_PORT),
                    ..ServicePorts::default()
                },
                this_node: false,
            })
            .collect();
        let ketama = match distribution {
            Distribution::Ketama => Some(KetamaRing::new(
                &hosts
                    .iter()
                    .map(|(h, p)| format!("{h}:{p}"))
                    .collect::<Vec<_>>(),
            )),
            Distribution::Vbucket => None,
        };
        Self {
            rev: None,
            rev_epoch: 0,
            bucket_name: None,
            uuid: None,
            distribution,
            nodes,
            vbmap: None,
            ketama,
            bucket_capabilities: Vec::new(),
            origin: ConfigOrigin::Static,
            compare_clock: COMPARE_CLOCK.fetch_add(1, Ordering::Relaxed),
            raw: bytes::Bytes::new(),
        }
    }

    /// Ordering rule: epoch first, then revision when both sides carry one,
    /// otherwise the parse-time compare clock.
    #[must_use]
    pub fn is_newer_than(&self, other: &ClusterConfig) -> bool {
        if self.rev_epoch != other.rev_epoch {
            return self.rev_epoch > other.rev_epoch;
        }
        match (self.rev, other.rev) {
            (Some(a), Some(b)) if a != b => a > b,
            (Some(a), Some(b)) => {
                debug_assert_eq!(a, b);
                false
            }
            _ => self.compare_clock > other.compare_clock,
        }
    }

    /// Index of the node whose kv address matches `(host, port)`.
    #[must_use]
    pub fn find_kv_node(&self, host: &str, port: u16, tls: bool) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| n.kv_address(tls) == Some((host.to_string(), port)))
    }

    /// Nodes providing a given service.
    #[must_use]
    pub fn service_nodes(&self, service: ServiceType, tls: bool) -> Vec<(usize, String, u16)> {
        self.nodes
            .iter()
            .enumerate()
            .filter_map(|(i, n)| {
                n.service_address(service, tls)
                    .map(|(h, p)| (i, h, p))
            })
            .collect()
    }

    /// Diff against a previous config; drives the monitor's decision to
    /// publish or merely acknowledge.
    #[must_use]
    pub fn diff(&self, older: &ClusterConfig) -> ConfigDiff {
        vbucket::diff_configs(self, older)
    }
}

const DEFAULT_MGMT_PORT: u16 = 8091;

#[cfg(test)]
pub(crate) mod test_fixtures {
    /// A two-node vbucket config with 8 vbuckets, as the terse endpoint
    /// would serve it.
    pub fn two_node_config(rev: i64) -> String {
        format!(
            r#"{{
                "rev": {rev},
                "name": "default",
                "nodeLocator": "vbucket",
                "nodesExt": [
                    {{"services": {{"kv": 11210, "mgmt": 8091, "capi": 8092, "n1ql": 8093}},
                      "hostname": "$HOST", "thisNode": true}},
                    {{"services": {{"kv": 11210, "mgmt": 8091, "capi": 8092}},
                      "hostname": "nodeb.example.com"}}
                ],
                "vBucketServerMap": {{
                    "hashAlgorithm": "CRC",
                    "numReplicas": 1,
                    "serverList": ["$HOST:11210", "nodeb.example.com:11210"],
                    "vBucketMap": [[0,1],[0,1],[1,0],[1,0],[0,1],[1,0],[0,1],[1,0]]
                }},
                "bucketCapabilities": ["cbhello", "xattr"]
            }}"#
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_two_node_config() {
        let raw = test_fixtures::two_node_config(7);
        let cfg = ClusterConfig::parse(raw.as_bytes(), "nodea.example.com", ConfigOrigin::Cccp)
            .unwrap();
        assert_eq!(cfg.rev, Some(7));
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.nodes[0].hostname, "nodea.example.com");
        assert_eq!(cfg.nodes[1].hostname, "nodeb.example.com");
        assert_eq!(cfg.distribution, Distribution::Vbucket);

        let map = cfg.vbmap.as_ref().unwrap();
        assert_eq!(map.num_vbuckets(), 8);
        assert_eq!(map.server_list()[0], "nodea.example.com:11210");
    }

    #[test]
    fn test_newer_by_rev() {
        let a = ClusterConfig::parse(
            test_fixtures::two_node_config(3).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        let b = ClusterConfig::parse(
            test_fixtures::two_node_config(4).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        assert!(b.is_newer_than(&a));
        assert!(!a.is_newer_than(&b));
        // Same rev: not newer in either direction.
        let c = ClusterConfig::parse(
            test_fixtures::two_node_config(4).as_bytes(),
            "h",
            ConfigOrigin::Cccp,
        )
        .unwrap();
        assert!(!c.is_newer_than(&b));
        assert!(!b.is_newer_than(&c));
    }

    #[test]
    fn test_newer_by_clock_without_rev() {
        let hosts = vec![("a".to_string(), 11210)];
        let first = ClusterConfig::synthesize(&hosts, Distribution::Vbucket);
        let second = ClusterConfig::synthesize(&hosts, Distribution::Vbucket);
        assert!(second.is_newer_than(&first));
        assert!(!first.is_newer_than(&second));
    }

    #[test]
    fn test_service_nodes() {
        let raw = test_fixtures::two_node_config(1);
        let cfg = ClusterConfig::parse(raw.as_bytes(), "a", ConfigOrigin::HttpStream).unwrap();
        let query = cfg.service_nodes(ServiceType::Query, false);
        assert_eq!(query.len(), 1);
        assert_eq!(query[0].2, 8093);
        let views = cfg.service_nodes(ServiceType::Views, false);
        assert_eq!(views.len(), 2);
    }

    #[test]
    fn test_synthesized_static_config() {
        let hosts = vec![("x".to_string(), 11210), ("y".to_string(), 11210)];
        let cfg = ClusterConfig::synthesize(&hosts, Distribution::Ketama);
        assert_eq!(cfg.distribution, Distribution::Ketama);
        assert!(cfg.ketama.is_some());
        assert_eq!(cfg.nodes.len(), 2);
        assert_eq!(cfg.origin, ConfigOrigin::Static);
    }
}
