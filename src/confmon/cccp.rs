// SPDX-License-Identifier: MIT OR Apache-2.0

//! CCCP provider: cluster configs over the memcached protocol.
//!
//! A refresh issues GET_CLUSTER_CONFIG, preferring to piggyback on an
//! existing pipeline to the candidate node; without one it dials a
//! dedicated pooled connection and negotiates a session first. A node
//! answering NOT_SUPPORTED / UNKNOWN_COMMAND is remembered as
//! CCCP-incapable and skipped on later passes.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use crate::client::pool::SocketPool;
use crate::config::{ClientSettings, HostEntry, HostList};
use crate::confmon::{Provider, ProviderKind};
use crate::dispatch::op::PendingOp;
use crate::dispatch::CommandQueue;
use crate::error::{CouchError, Result};
use crate::pipeline::negotiate;
use crate::protocol::{Opcode, RequestPacket, Status};
use crate::topology::{ClusterConfig, ConfigOrigin, SharedConfig};

pub struct CccpProvider {
    nodes: Mutex<HostList>,
    cached: Mutex<Option<SharedConfig>>,
    /// Nodes that answered "I don't speak CCCP".
    incapable: Mutex<HashSet<(String, u16)>>,
    pool: Arc<SocketPool>,
    cmdq: Arc<CommandQueue>,
    settings: ClientSettings,
}

impl CccpProvider {
    #[must_use]
    pub fn new(
        pool: Arc<SocketPool>,
        cmdq: Arc<CommandQueue>,
        settings: ClientSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HostList::new()),
            cached: Mutex::new(None),
            incapable: Mutex::new(HashSet::new()),
            pool,
            cmdq,
            settings,
        })
    }

    fn next_candidate(&self) -> Option<HostEntry> {
        let incapable = self.incapable.lock().expect("cccp lock");
        let mut nodes = self.nodes.lock().expect("cccp lock");
        let len = nodes.len();
        for _ in 0..len {
            if let Some(entry) = nodes.next_host() {
                if !incapable.contains(&(entry.host.clone(), entry.port)) {
                    return Some(entry.clone());
                }
            }
        }
        None
    }

    fn mark_incapable(&self, host: &str, port: u16) {
        warn!(host, port, "node does not support CCCP, disabling for it");
        self.incapable
            .lock()
            .expect("cccp lock")
            .insert((host.to_string(), port));
    }

    fn parse_and_cache(&self, raw: &[u8], origin_host: &str) -> Result<SharedConfig> {
        let config = Arc::new(ClusterConfig::parse(raw, origin_host, ConfigOrigin::Cccp)?);
        *self.cached.lock().expect("cccp lock") = Some(Arc::clone(&config));
        Ok(config)
    }

    /// Ask for the config through an already-connected pipeline.
    async fn fetch_piggyback(&self, index: usize, host: &str) -> Result<SharedConfig> {
        trace!(host, index, "CCCP via existing pipeline");
        let packet = RequestPacket::new(Opcode::GetClusterConfig);
        let (op, rx) = PendingOp::new(packet, self.settings.config_node_timeout);
        self.cmdq.dispatch_to(index, op);
        let response = rx
            .await
            .map_err(|_| CouchError::Network("pipeline dropped CCCP request".into()))?;
        match response {
            Ok(kv) => self.parse_and_cache(&kv.value, host),
            Err(CouchError::ServerError { status, .. })
                if Status::from_u16(status).is_unsupported() =>
            {
                Err(CouchError::ServerError {
                    status,
                    message: "CCCP unsupported".into(),
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Ask for the config over a dedicated pooled connection.
    async fn fetch_dedicated(&self, host: &str, port: u16) -> Result<SharedConfig> {
        trace!(host, port, "CCCP via dedicated connection");
        let mut sock = self.pool.acquire(host, port).await?;
        if sock.session.is_none() {
            let session = negotiate::negotiate(
                &mut sock.conn,
                &self.settings,
                self.settings.bucket.as_deref(),
                self.settings.ssl_enabled,
                0,
            )
            .await?;
            sock.session = Some(session);
        }

        let mut packet = RequestPacket::new(Opcode::GetClusterConfig);
        packet.opaque = 0xcccb_0001;
        let resp = negotiate::roundtrip(&mut sock.conn, &packet).await?;
        match resp.status() {
            Status::Success => {
                let config = self.parse_and_cache(&resp.value(), host)?;
                self.pool.release(sock, true);
                Ok(config)
            }
            s if s.is_unsupported() => {
                self.pool.release(sock, true);
                Err(CouchError::ServerError {
                    status: s.as_u16(),
                    message: "CCCP unsupported".into(),
                })
            }
            s => {
                self.pool.release(sock, false);
                Err(CouchError::from_status(s, 0))
            }
        }
    }
}

#[async_trait]
impl Provider for CccpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Cccp
    }

    async fn refresh(&self) -> Result<SharedConfig> {
        let attempts = self.nodes.lock().expect("cccp lock").len().max(1);
        let mut last_err = CouchError::NoMatchingServer;

        for _ in 0..attempts {
            let Some(entry) = self.next_candidate() else {
                break;
            };

            let pipeline = self
                .cmdq
                .pipeline_addresses()
                .into_iter()
                .find(|(_, host, port)| *host == entry.host && *port == entry.port);

            let result = match pipeline {
                Some((index, _, _)) => self.fetch_piggyback(index, &entry.host).await,
                None => self.fetch_dedicated(&entry.host, entry.port).await,
            };

            match result {
                Ok(config) => return Ok(config),
                Err(CouchError::ServerError { status, .. })
                    if Status::from_u16(status).is_unsupported() =>
                {
                    self.mark_incapable(&entry.host, entry.port);
                    last_err = CouchError::ServerError {
                        status,
                        message: "CCCP unsupported".into(),
                    };
                }
                Err(err) => {
                    debug!(host = %entry.host, %err, "CCCP fetch failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn get_cached(&self) -> Option<SharedConfig> {
        self.cached.lock().expect("cccp lock").clone()
    }

    fn config_updated(&self, config: &SharedConfig) {
        // Track the accepted topology's kv nodes for future refreshes.
        let tls = self.settings.ssl_enabled;
        let entries: Vec<HostEntry> = config
            .nodes
            .iter()
            .filter_map(|n| n.kv_address(tls))
            .map(|(host, port)| HostEntry::new(host, port))
            .collect();
        if !entries.is_empty() {
            self.nodes.lock().expect("cccp lock").assign(entries);
        }
        *self.cached.lock().expect("cccp lock") = Some(Arc::clone(config));
    }

    fn configure_nodes(&self, nodes: &[HostEntry]) {
        self.nodes
            .lock()
            .expect("cccp lock")
            .assign(nodes.iter().cloned());
        self.incapable.lock().expect("cccp lock").clear();
    }

    fn get_nodes(&self) -> Vec<HostEntry> {
        self.nodes.lock().expect("cccp lock").as_slice().to_vec()
    }

    fn dump(&self, out: &mut String) {
        let nodes = self.nodes.lock().expect("cccp lock");
        let incapable = self.incapable.lock().expect("cccp lock");
        out.push_str(&format!(
            "cccp: nodes={} incapable={} cached={}\n",
            nodes.len(),
            incapable.len(),
            self.cached.lock().expect("cccp lock").is_some()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pool::{Connector, PoolOptions};
    use crate::dispatch::vbguess::VbGuess;
    use std::time::Duration;
    use crate::testkit::MockNode;
    use crate::topology::test_fixtures;

    fn provider_for(port: u16) -> Arc<CccpProvider> {
        let mut settings = ClientSettings::default();
        settings.username = Some("user".into());
        settings.password = Some("pass".into());
        settings.sasl_mech_force = Some("PLAIN".into());
        settings.config_node_timeout = Duration::from_secs(2);
        let connector = Arc::new(Connector::from_settings(&settings).unwrap());
        let pool = Arc::new(SocketPool::new(connector, PoolOptions::default()));
        let cmdq = Arc::new(CommandQueue::new(Arc::new(VbGuess::new())));
        let provider = CccpProvider::new(pool, cmdq, settings);
        provider.configure_nodes(&[HostEntry::new("127.0.0.1", port)]);
        provider
    }

    #[tokio::test]
    async fn test_dedicated_fetch() {
        let node = MockNode::start().await;
        node.set_cluster_config(test_fixtures::two_node_config(11).into_bytes())
            .await;

        let provider = provider_for(node.port());
        let config = provider.refresh().await.unwrap();
        assert_eq!(config.rev, Some(11));
        assert_eq!(config.nodes[0].hostname, "127.0.0.1");
        assert!(provider.get_cached().is_some());
    }

    #[tokio::test]
    async fn test_unsupported_node_disabled() {
        let node = MockNode::start().await;
        node.set_cccp_unsupported(true).await;

        let provider = provider_for(node.port());
        let err = provider.refresh().await.unwrap_err();
        assert!(matches!(err, CouchError::ServerError { .. }));
        // The node is now marked incapable; a second refresh has no
        // candidates left.
        let err = provider.refresh().await.unwrap_err();
        assert_eq!(err, CouchError::NoMatchingServer);
    }

    #[tokio::test]
    async fn test_config_updated_rewrites_nodes() {
        let node = MockNode::start().await;
        let provider = provider_for(node.port());

        let config = Arc::new(
            ClusterConfig::parse(
                test_fixtures::two_node_config(2).as_bytes(),
                "nodea.example.com",
                ConfigOrigin::Cccp,
            )
            .unwrap(),
        );
        provider.config_updated(&config);
        let nodes = provider.get_nodes();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].host, "nodea.example.com");
        assert_eq!(provider.get_cached().unwrap().rev, Some(2));
    }
}
