// SPDX-License-Identifier: MIT OR Apache-2.0

//! Static provider: synthesised configs from a user-supplied host list.
//!
//! Used when the caller bypasses discovery entirely — raw memcached
//! buckets (ketama distribution over the seed hosts) and cluster-level
//! admin instances (no bucket, management traffic only).

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::config::HostEntry;
use crate::confmon::{Provider, ProviderKind};
use crate::error::{CouchError, Result};
use crate::topology::{ClusterConfig, Distribution, SharedConfig};

pub struct StaticProvider {
    distribution: Distribution,
    nodes: Mutex<Vec<HostEntry>>,
    cached: Mutex<Option<SharedConfig>>,
}

impl StaticProvider {
    /// Raw-memcached flavour: seed hosts become a ketama ring.
    #[must_use]
    pub fn raw_memcached(nodes: &[HostEntry]) -> Arc<Self> {
        Self::with_distribution(nodes, Distribution::Ketama)
    }

    /// Cluster-admin flavour: seed hosts, no key distribution.
    #[must_use]
    pub fn cluster_admin(nodes: &[HostEntry]) -> Arc<Self> {
        Self::with_distribution(nodes, Distribution::Vbucket)
    }

    fn with_distribution(nodes: &[HostEntry], distribution: Distribution) -> Arc<Self> {
        Arc::new(Self {
            distribution,
            nodes: Mutex::new(nodes.to_vec()),
            cached: Mutex::new(None),
        })
    }

    fn synthesize(&self) -> Result<SharedConfig> {
        let nodes = self.nodes.lock().expect("static provider lock");
        if nodes.is_empty() {
            return Err(CouchError::NoMatchingServer);
        }
        let hosts: Vec<(String, u16)> = nodes
            .iter()
            .map(|n| (n.host.clone(), n.port))
            .collect();
        drop(nodes);
        let config = Arc::new(ClusterConfig::synthesize(&hosts, self.distribution));
        *self.cached.lock().expect("static provider lock") = Some(Arc::clone(&config));
        Ok(config)
    }
}

#[async_trait]
impl Provider for StaticProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Static
    }

    async fn refresh(&self) -> Result<SharedConfig> {
        self.synthesize()
    }

    fn get_cached(&self) -> Option<SharedConfig> {
        self.cached.lock().expect("static provider lock").clone()
    }

    fn configure_nodes(&self, nodes: &[HostEntry]) {
        *self.nodes.lock().expect("static provider lock") = nodes.to_vec();
        // The synthesised config is a pure function of the node list.
        *self.cached.lock().expect("static provider lock") = None;
    }

    fn get_nodes(&self) -> Vec<HostEntry> {
        self.nodes.lock().expect("static provider lock").clone()
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "static: nodes={} distribution={:?}\n",
            self.nodes.lock().expect("static provider lock").len(),
            self.distribution
        ));
    }
}
