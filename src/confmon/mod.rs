// SPDX-License-Identifier: MIT OR Apache-2.0

//! The cluster-configuration monitor: a sequenced provider chain with
//! listener fan-out.
//!
//! The monitor owns the currently accepted config and arbitrates
//! replacement. One refresh cycle walks the active providers in order,
//! trying each one's cache before asking it to fetch; the first success
//! ends the cycle. When every provider has failed, the monitor announces
//! the wrapped cursor and waits out a grace interval before the next pass.
//!
//! Providers:
//! - [`cccp`] — GET_CLUSTER_CONFIG over memcached
//! - [`http`] — streaming `/pools` endpoint
//! - [`file`] — on-disk config cache
//! - [`static_`] — synthesised configs for raw-memcached / cluster-admin

pub mod cccp;
pub mod file;
pub mod http;
pub mod static_;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientSettings, HostEntry};
use crate::dispatch::CommandQueue;
use crate::error::{CouchError, Result};
use crate::topology::{ClusterConfig, ConfigOrigin, SharedConfig};

/// Provider identity, for ordering and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderKind {
    File,
    Cccp,
    Http,
    Static,
}

/// A topology source. The monitor drives these polymorphically.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Fetch a fresh config. The provider owns its internal timeouts and
    /// node rotation.
    async fn refresh(&self) -> Result<SharedConfig>;

    /// Most recent config this provider has seen, if any.
    fn get_cached(&self) -> Option<SharedConfig>;

    /// Stop any active work (streams, pending fetches).
    async fn pause(&self) {}

    /// An accepted topology; update internal node lists, caches, files.
    fn config_updated(&self, _config: &SharedConfig) {}

    /// Replace the provider's bootstrap node list.
    fn configure_nodes(&self, nodes: &[HostEntry]);

    fn get_nodes(&self) -> Vec<HostEntry>;

    async fn shutdown(&self) {}

    /// Debug snapshot for diagnostics dumps.
    fn dump(&self, out: &mut String) {
        out.push_str(&format!("{:?}: <no details>\n", self.kind()));
    }
}

/// Events fanned out to listeners.
#[derive(Debug, Clone)]
pub enum ConfigEvent {
    /// A strictly newer (or topologically different) config was accepted.
    GotNewConfig(SharedConfig),
    /// A provider produced a config that did not replace the current one.
    GotAnyConfig(SharedConfig),
    /// Every provider was tried without success this pass.
    ProvidersCycled,
    /// The refresh cycle ended.
    MonitorStopped,
}

/// Out-of-band config documents (NOT_MY_VBUCKET payloads, streaming
/// updates) pushed at the monitor by other subsystems.
pub type ConfigInbox = mpsc::UnboundedSender<(Bytes, String, ConfigOrigin)>;

#[derive(Debug, Default)]
struct MonitorShared {
    current: Option<SharedConfig>,
    cursor: usize,
    /// Refresh in progress (ACTIVE); grace wait adds ITERGRACE.
    active: bool,
    itergrace: bool,
    last_stop: Option<Instant>,
    /// Bumped when a cycle completes; lets queued callers reuse its result.
    cycle_epoch: u64,
}

/// The monitor. One per instance.
pub struct ConfigMonitor {
    providers: Vec<Arc<dyn Provider>>,
    shared: Mutex<MonitorShared>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<ConfigEvent>>>,
    refresh_gate: tokio::sync::Mutex<()>,
    settings: ClientSettings,
    cmdq: Arc<CommandQueue>,
}

impl std::fmt::Debug for ConfigMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.lock().expect("monitor lock");
        f.debug_struct("ConfigMonitor")
            .field("providers", &self.providers.len())
            .field("active", &shared.active)
            .field("has_config", &shared.current.is_some())
            .finish()
    }
}

impl ConfigMonitor {
    /// Build the monitor over an ordered provider chain and start the
    /// inbox forwarder for externally pushed configs.
    #[must_use]
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        settings: ClientSettings,
        cmdq: Arc<CommandQueue>,
    ) -> (Arc<Self>, ConfigInbox) {
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let monitor = Self::with_inbox(providers, settings, cmdq, inbox_rx);
        (monitor, inbox_tx)
    }

    /// Like [`ConfigMonitor::new`] but consuming an inbox created by the
    /// caller, when the sender must exist before the provider chain does.
    #[must_use]
    pub fn with_inbox(
        providers: Vec<Arc<dyn Provider>>,
        settings: ClientSettings,
        cmdq: Arc<CommandQueue>,
        mut inbox_rx: mpsc::UnboundedReceiver<(Bytes, String, ConfigOrigin)>,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            providers,
            shared: Mutex::new(MonitorShared::default()),
            listeners: Mutex::new(Vec::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            settings,
            cmdq,
        });

        let weak = Arc::downgrade(&monitor);
        tokio::spawn(async move {
            while let Some((raw, origin_host, origin)) = inbox_rx.recv().await {
                let Some(monitor) = weak.upgrade() else { break };
                monitor.push_external(&raw, &origin_host, origin);
            }
        });

        monitor
    }

    /// Register a listener. Dropped receivers are pruned on the next emit.
    #[must_use]
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ConfigEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.lock().expect("monitor lock").push(tx);
        rx
    }

    #[must_use]
    pub fn current_config(&self) -> Option<SharedConfig> {
        self.shared.lock().expect("monitor lock").current.clone()
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.shared.lock().expect("monitor lock").active
    }

    #[must_use]
    pub fn providers(&self) -> &[Arc<dyn Provider>] {
        &self.providers
    }

    fn emit(&self, event: &ConfigEvent) {
        let mut listeners = self.listeners.lock().expect("monitor lock");
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Parse and consider an externally supplied config document.
    pub fn push_external(&self, raw: &[u8], origin_host: &str, origin: ConfigOrigin) {
        match ClusterConfig::parse(raw, origin_host, origin) {
            Ok(config) => {
                trace!(?origin, "considering pushed config");
                self.accept(Arc::new(config));
            }
            Err(err) => warn!(?origin, %err, "discarding unparseable pushed config"),
        }
    }

    /// Arbitration: swap when the candidate is strictly newer or changes
    /// the server set; acknowledge without swapping otherwise. Returns
    /// whether the config was accepted as current.
    pub fn accept(&self, candidate: SharedConfig) -> bool {
        let decision = {
            let shared = self.shared.lock().expect("monitor lock");
            match shared.current.as_deref() {
                None => AcceptDecision::Swap,
                Some(current) => {
                    let diff = candidate.diff(current);
                    if candidate.is_newer_than(current) || diff.has_server_changes() {
                        AcceptDecision::Swap
                    } else {
                        AcceptDecision::AcknowledgeOnly
                    }
                }
            }
        };

        match decision {
            AcceptDecision::AcknowledgeOnly => {
                trace!("config not newer, acknowledging only");
                self.emit(&ConfigEvent::GotAnyConfig(candidate));
                false
            }
            AcceptDecision::Swap => {
                info!(
                    rev = ?candidate.rev,
                    nodes = candidate.nodes.len(),
                    origin = ?candidate.origin,
                    "accepting new cluster config"
                );
                // Providers first: every provider hears about the topology
                // before any command can be routed with it.
                for provider in &self.providers {
                    provider.config_updated(&candidate);
                }
                self.cmdq.apply_config(Arc::clone(&candidate));
                {
                    let mut shared = self.shared.lock().expect("monitor lock");
                    shared.current = Some(Arc::clone(&candidate));
                }
                self.emit(&ConfigEvent::GotNewConfig(candidate));
                true
            }
        }
    }

    /// One full refresh cycle through the provider chain. Concurrent
    /// callers coalesce on the same cycle.
    pub async fn refresh(&self) -> Result<SharedConfig> {
        let epoch_before = self.shared.lock().expect("monitor lock").cycle_epoch;
        let _gate = self.refresh_gate.lock().await;

        // A parallel caller may have finished a cycle while we waited.
        {
            let shared = self.shared.lock().expect("monitor lock");
            if shared.cycle_epoch != epoch_before {
                if let Some(config) = shared.current.clone() {
                    return Ok(config);
                }
            }
        }

        {
            let mut shared = self.shared.lock().expect("monitor lock");
            shared.active = true;
            shared.itergrace = false;
        }
        self.cmdq.set_refreshing(true);

        let deadline = Instant::now() + self.settings.config_total_timeout;
        let result = self.refresh_cycle(deadline).await;

        {
            let mut shared = self.shared.lock().expect("monitor lock");
            shared.active = false;
            shared.itergrace = false;
            shared.last_stop = Some(Instant::now());
            shared.cycle_epoch += 1;
        }
        self.cmdq.set_refreshing(false);
        self.emit(&ConfigEvent::MonitorStopped);
        result
    }

    async fn refresh_cycle(&self, deadline: Instant) -> Result<SharedConfig> {
        if self.providers.is_empty() {
            return Err(CouchError::Internal("no active config providers".into()));
        }
        let mut last_err = CouchError::Timeout;

        loop {
            for step in 0..self.providers.len() {
                let index = {
                    let shared = self.shared.lock().expect("monitor lock");
                    (shared.cursor + step) % self.providers.len()
                };
                let provider = &self.providers[index];

                // Cache fast path: a provider may already hold something
                // newer than the current config.
                if let Some(cached) = provider.get_cached() {
                    let newer = self
                        .current_config()
                        .map_or(true, |cur| cached.is_newer_than(&cur));
                    if newer {
                        debug!(kind = ?provider.kind(), "publishing cached config");
                        self.accept(Arc::clone(&cached));
                        self.set_cursor(index);
                        return Ok(cached);
                    }
                }

                match tokio::time::timeout(self.settings.config_node_timeout, provider.refresh())
                    .await
                {
                    Ok(Ok(config)) => {
                        debug!(kind = ?provider.kind(), rev = ?config.rev, "provider produced config");
                        self.accept(Arc::clone(&config));
                        self.set_cursor(index);
                        return Ok(config);
                    }
                    Ok(Err(err)) => {
                        if err.kind() == crate::error::ErrorKind::Auth {
                            // Bad credentials or a missing bucket will not
                            // improve with another provider.
                            debug!(kind = ?provider.kind(), %err, "fatal bootstrap error");
                            return Err(err);
                        }
                        debug!(kind = ?provider.kind(), %err, "provider refresh failed");
                        last_err = err;
                    }
                    Err(_) => {
                        debug!(kind = ?provider.kind(), "provider refresh timed out");
                        // A timeout never hides a more specific earlier error.
                        if last_err.is_downgrade() {
                            last_err = CouchError::Timeout;
                        }
                    }
                }
            }

            // Cursor wrapped without success.
            self.emit(&ConfigEvent::ProvidersCycled);
            {
                let mut shared = self.shared.lock().expect("monitor lock");
                shared.itergrace = true;
            }
            let grace = self.settings.grace_next_provider;
            if Instant::now() + grace >= deadline {
                return Err(last_err);
            }
            tokio::time::sleep(grace).await;
        }
    }

    fn set_cursor(&self, index: usize) {
        self.shared.lock().expect("monitor lock").cursor = index;
    }

    /// Stop providers and drop listeners. Terminal.
    pub async fn shutdown(&self) {
        for provider in &self.providers {
            provider.pause().await;
            provider.shutdown().await;
        }
        self.listeners.lock().expect("monitor lock").clear();
    }

    /// Diagnostics snapshot of the whole chain.
    #[must_use]
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let shared = self.shared.lock().expect("monitor lock");
        out.push_str(&format!(
            "monitor: active={} itergrace={} cursor={}\n",
            shared.active, shared.itergrace, shared.cursor
        ));
        drop(shared);
        for provider in &self.providers {
            provider.dump(&mut out);
        }
        out
    }
}

enum AcceptDecision {
    Swap,
    AcknowledgeOnly,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::vbguess::VbGuess;
    use crate::topology::test_fixtures;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedProvider {
        kind: ProviderKind,
        results: Mutex<Vec<Result<SharedConfig>>>,
        refreshes: AtomicUsize,
        updates: AtomicUsize,
        nodes: Mutex<Vec<HostEntry>>,
    }

    impl ScriptedProvider {
        fn new(kind: ProviderKind, results: Vec<Result<SharedConfig>>) -> Arc<Self> {
            Arc::new(Self {
                kind,
                results: Mutex::new(results),
                refreshes: AtomicUsize::new(0),
                updates: AtomicUsize::new(0),
                nodes: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        fn kind(&self) -> ProviderKind {
            self.kind
        }

        async fn refresh(&self) -> Result<SharedConfig> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            let mut results = self.results.lock().unwrap();
            if results.is_empty() {
                Err(CouchError::Network("exhausted".into()))
            } else {
                results.remove(0)
            }
        }

        fn get_cached(&self) -> Option<SharedConfig> {
            None
        }

        fn config_updated(&self, _config: &SharedConfig) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }

        fn configure_nodes(&self, nodes: &[HostEntry]) {
            *self.nodes.lock().unwrap() = nodes.to_vec();
        }

        fn get_nodes(&self) -> Vec<HostEntry> {
            self.nodes.lock().unwrap().clone()
        }
    }

    fn config(rev: i64) -> SharedConfig {
        Arc::new(
            ClusterConfig::parse(
                test_fixtures::two_node_config(rev).as_bytes(),
                "nodea.example.com",
                ConfigOrigin::Cccp,
            )
            .unwrap(),
        )
    }

    fn wired_cmdq() -> Arc<CommandQueue> {
        let cmdq = Arc::new(CommandQueue::new(Arc::new(VbGuess::new())));
        let settings = ClientSettings::default();
        let connector =
            Arc::new(crate::client::pool::Connector::from_settings(&settings).unwrap());
        let pool = Arc::new(crate::client::pool::SocketPool::new(
            connector,
            crate::client::pool::PoolOptions::default(),
        ));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        // Keep the receivers alive for the test duration so sends from
        // spawned pipelines do not error; nothing here reads them.
        std::mem::forget(retry_rx);
        std::mem::forget(events_rx);
        let ctx = crate::pipeline::PipelineContext {
            settings,
            pool,
            retry_tx: retry_tx.clone(),
            events_tx,
            vbguess: Arc::new(VbGuess::new()),
            opaque_counter: Arc::new(std::sync::atomic::AtomicU32::new(1)),
            bucket: None,
            is_tls: false,
        };
        cmdq.wire(retry_tx, ctx);
        cmdq
    }

    #[tokio::test]
    async fn test_first_provider_success_publishes_once() {
        let provider = ScriptedProvider::new(ProviderKind::Cccp, vec![Ok(config(1))]);
        let (monitor, _inbox) = ConfigMonitor::new(
            vec![provider.clone()],
            ClientSettings::default(),
            wired_cmdq(),
        );
        let mut events = monitor.subscribe();

        let published = monitor.refresh().await.unwrap();
        assert_eq!(published.rev, Some(1));
        assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
        // config_updated reached the provider before listeners could route.
        assert_eq!(provider.updates.load(Ordering::SeqCst), 1);

        assert!(matches!(
            events.recv().await.unwrap(),
            ConfigEvent::GotNewConfig(_)
        ));
        assert!(matches!(
            events.recv().await.unwrap(),
            ConfigEvent::MonitorStopped
        ));
    }

    #[tokio::test]
    async fn test_failure_advances_to_next_provider() {
        let first = ScriptedProvider::new(
            ProviderKind::Cccp,
            vec![Err(CouchError::Network("down".into()))],
        );
        let second = ScriptedProvider::new(ProviderKind::Http, vec![Ok(config(3))]);
        let (monitor, _inbox) = ConfigMonitor::new(
            vec![first.clone(), second.clone()],
            ClientSettings::default(),
            wired_cmdq(),
        );

        let published = monitor.refresh().await.unwrap();
        assert_eq!(published.rev, Some(3));
        assert_eq!(first.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(second.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_same_rev_is_acknowledge_only() {
        let provider = ScriptedProvider::new(ProviderKind::Cccp, vec![Ok(config(5))]);
        let (monitor, _inbox) = ConfigMonitor::new(
            vec![provider.clone()],
            ClientSettings::default(),
            wired_cmdq(),
        );
        monitor.refresh().await.unwrap();

        let mut events = monitor.subscribe();
        // Re-applying an identical revision must not republish.
        let accepted = monitor.accept(config(5));
        assert!(!accepted);
        assert!(matches!(
            events.recv().await.unwrap(),
            ConfigEvent::GotAnyConfig(_)
        ));
        // Only the original apply counted.
        assert_eq!(provider.updates.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_never_publishes_older_rev() {
        let provider = ScriptedProvider::new(ProviderKind::Cccp, vec![Ok(config(9))]);
        let (monitor, _inbox) = ConfigMonitor::new(
            vec![provider],
            ClientSettings::default(),
            wired_cmdq(),
        );
        monitor.refresh().await.unwrap();

        assert!(!monitor.accept(config(4)));
        assert_eq!(monitor.current_config().unwrap().rev, Some(9));
    }

    #[tokio::test]
    async fn test_all_fail_emits_cycled_and_times_out() {
        let mut settings = ClientSettings::default();
        settings.config_total_timeout = std::time::Duration::from_millis(200);
        settings.grace_next_provider = std::time::Duration::from_millis(50);

        let provider = ScriptedProvider::new(ProviderKind::Cccp, vec![]);
        let (monitor, _inbox) =
            ConfigMonitor::new(vec![provider], settings, wired_cmdq());
        let mut events = monitor.subscribe();

        let err = monitor.refresh().await.unwrap_err();
        assert!(err.is_transient());

        let mut saw_cycled = false;
        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            match event {
                ConfigEvent::ProvidersCycled => saw_cycled = true,
                ConfigEvent::MonitorStopped => saw_stopped = true,
                _ => {}
            }
        }
        assert!(saw_cycled);
        assert!(saw_stopped);
    }

    #[tokio::test]
    async fn test_pushed_nmv_config_accepted() {
        let provider = ScriptedProvider::new(ProviderKind::Cccp, vec![Ok(config(1))]);
        let (monitor, inbox) = ConfigMonitor::new(
            vec![provider],
            ClientSettings::default(),
            wired_cmdq(),
        );
        monitor.refresh().await.unwrap();

        inbox
            .send((
                Bytes::from(test_fixtures::two_node_config(8)),
                "nodea.example.com".to_string(),
                ConfigOrigin::Nmv,
            ))
            .unwrap();

        // Let the inbox forwarder run.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(monitor.current_config().unwrap().rev, Some(8));
    }
}
