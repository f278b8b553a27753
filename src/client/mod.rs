// SPDX-License-Identifier: MIT OR Apache-2.0

//! The top-level client: ties the configuration monitor, the command
//! queue, the retry queue, the socket pools, and the HTTP sub-client
//! together behind a typed operation surface.
//!
//! # Example
//!
//! ```rust,ignore
//! use couchbase_client::{CouchClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = CouchClient::new(
//!     "couchbase://10.0.0.1,10.0.0.2/travel?operation_timeout=2.5",
//! )
//! .await?;
//! client.connect().await?;
//!
//! client.upsert("airline_10", br#"{"name":"Example Air"}"#.to_vec()).await?;
//! let doc = client.get("airline_10").await?;
//! println!("{} bytes", doc.value.len());
//!
//! client.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod pool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{
    BootstrapTransport, ClientSettings, ConnectionString, HostEntry, SharedSettings,
};
use crate::confmon::{
    cccp::CccpProvider, file::FileProvider, http::HttpProvider, static_::StaticProvider,
    ConfigMonitor, Provider,
};
use crate::dispatch::op::{KvResponse, PendingOp};
use crate::dispatch::vbguess::VbGuess;
use crate::dispatch::CommandQueue;
use crate::error::{CouchError, Result};
use crate::http::{HttpClient, HttpRequest, HttpResponse, RequestType};
use crate::pipeline::{PipelineContext, PipelineEvent};
use crate::protocol::{Opcode, RequestPacket};
use crate::runtime::retry::RetryQueue;
use crate::runtime::{OperationSpan, Redactor};
use crate::topology::{ConfigOrigin, SharedConfig};
use pool::{Connector, PoolOptions, SocketPool};

use crate::config::connstr::{DEFAULT_HTTP_PORT, DEFAULT_HTTP_TLS_PORT};

/// Categories tracked by the pending-operations registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingCategory {
    Timer,
    Http,
    Durability,
    Counter,
}

/// Counters for operations in flight, consulted at teardown.
#[derive(Debug, Default)]
pub struct PendingOps {
    timer: AtomicUsize,
    http: AtomicUsize,
    durability: AtomicUsize,
    counter: AtomicUsize,
}

impl PendingOps {
    fn cell(&self, category: PendingCategory) -> &AtomicUsize {
        match category {
            PendingCategory::Timer => &self.timer,
            PendingCategory::Http => &self.http,
            PendingCategory::Durability => &self.durability,
            PendingCategory::Counter => &self.counter,
        }
    }

    /// RAII increment; decremented when the guard drops.
    #[must_use]
    pub fn track(self: &Arc<Self>, category: PendingCategory) -> PendingGuard {
        self.cell(category).fetch_add(1, Ordering::Relaxed);
        PendingGuard {
            registry: Arc::clone(self),
            category,
        }
    }

    #[must_use]
    pub fn count(&self, category: PendingCategory) -> usize {
        self.cell(category).load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.timer.load(Ordering::Relaxed)
            + self.http.load(Ordering::Relaxed)
            + self.durability.load(Ordering::Relaxed)
            + self.counter.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct PendingGuard {
    registry: Arc<PendingOps>,
    category: PendingCategory,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.registry
            .cell(self.category)
            .fetch_sub(1, Ordering::Relaxed);
    }
}

/// Mutation flavour for [`CouchClient::store`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Upsert,
    Insert,
    Replace,
    Append,
    Prepend,
}

impl StoreMode {
    fn opcode(self) -> Opcode {
        match self {
            StoreMode::Upsert => Opcode::Set,
            StoreMode::Insert => Opcode::Add,
            StoreMode::Replace => Opcode::Replace,
            StoreMode::Append => Opcode::Append,
            StoreMode::Prepend => Opcode::Prepend,
        }
    }

    fn has_extras(self) -> bool {
        !matches!(self, StoreMode::Append | StoreMode::Prepend)
    }
}

/// The client instance.
pub struct CouchClient {
    settings: SharedSettings,
    connstr: ConnectionString,
    cmdq: Arc<CommandQueue>,
    monitor: Arc<ConfigMonitor>,
    retry_queue: Arc<RetryQueue>,
    mc_pool: Arc<SocketPool>,
    http_pool: Arc<SocketPool>,
    http: HttpClient,
    pending: Arc<PendingOps>,
    redactor: Redactor,
    shutdown: AtomicBool,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for CouchClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CouchClient")
            .field("connstr", &self.connstr.to_uri())
            .field("pipelines", &self.cmdq.pipeline_count())
            .finish()
    }
}

impl CouchClient {
    /// Parse a connection string and build an unconnected instance.
    ///
    /// Recognised environment overrides (`LCB_OPTIONS`, `LCB_SSL_MODE`,
    /// `LCB_SSL_CACERT`, `LCB_SSL_KEY`, `LCB_NO_CCCP`, `LCB_NO_HTTP`,
    /// `LCB_LOGLEVEL`) are applied on top of the query options.
    pub async fn new(connstr: &str) -> Result<Self> {
        let env: HashMap<String, String> = std::env::vars().collect();
        Self::with_env(connstr, &env).await
    }

    /// Like [`CouchClient::new`] with an explicit environment, for tests.
    pub async fn with_env(connstr: &str, env: &HashMap<String, String>) -> Result<Self> {
        let mut connstr = ConnectionString::parse(connstr)?;

        let mut bag = ClientSettings::default();
        bag.ssl_enabled = connstr.tls;
        bag.bucket = connstr.bucket.clone();
        for (name, value) in &connstr.options {
            bag.set_option(name, value)?;
        }
        bag.apply_env_overrides(env)?;
        let no_cccp = env.contains_key("LCB_NO_CCCP");
        let no_http = env.contains_key("LCB_NO_HTTP");
        if no_cccp && no_http {
            return Err(CouchError::InvalidArgument(
                "both CCCP and HTTP bootstrap disabled".into(),
            ));
        }

        if bag.randomize_nodes {
            use rand::seq::SliceRandom;
            connstr.hosts.shuffle(&mut rand::rng());
        }

        let settings = SharedSettings::new(bag.clone());
        let redactor = Redactor::new(bag.log_redaction);

        let connector = Arc::new(Connector::from_settings(&bag)?);
        let mc_pool = Arc::new(SocketPool::new(
            Arc::clone(&connector),
            PoolOptions {
                maxidle: bag.mc_poolsize,
                tmoidle: bag.mc_pool_timeout,
            },
        ));
        let http_pool = Arc::new(SocketPool::new(
            connector,
            PoolOptions {
                maxidle: bag.http_poolsize,
                tmoidle: bag.http_pool_timeout,
            },
        ));

        let vbguess = Arc::new(VbGuess::new());
        let cmdq = Arc::new(CommandQueue::new(Arc::clone(&vbguess)));
        let http = HttpClient::new(
            Arc::clone(&http_pool),
            Arc::clone(&cmdq),
            bag.clone(),
            connstr.tls,
        );

        let (retry_queue, retry_tx) = RetryQueue::spawn(Arc::clone(&cmdq), bag.clone());
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let pipeline_ctx = PipelineContext {
            settings: bag.clone(),
            pool: Arc::clone(&mc_pool),
            retry_tx: retry_tx.clone(),
            events_tx,
            vbguess,
            opaque_counter: Arc::new(AtomicU32::new(1)),
            bucket: bag.bucket.clone(),
            is_tls: connstr.tls,
        };
        cmdq.wire(retry_tx, pipeline_ctx);

        // The inbox exists before the providers so the HTTP provider can
        // stream updates into it; the monitor consumes the receiver.
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let providers = Self::build_providers(
            &connstr,
            &bag,
            &mc_pool,
            &cmdq,
            &http,
            &inbox_tx,
            no_cccp,
            no_http,
        );
        let monitor = ConfigMonitor::with_inbox(providers, bag.clone(), Arc::clone(&cmdq), inbox_rx);

        let client = Self {
            settings,
            connstr,
            cmdq,
            monitor,
            retry_queue,
            mc_pool,
            http_pool,
            http,
            pending: Arc::new(PendingOps::default()),
            redactor,
            shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        };
        client.spawn_event_forwarder(events_rx, inbox_tx);
        Ok(client)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_providers(
        connstr: &ConnectionString,
        bag: &ClientSettings,
        mc_pool: &Arc<SocketPool>,
        cmdq: &Arc<CommandQueue>,
        http: &HttpClient,
        inbox: &crate::confmon::ConfigInbox,
        no_cccp: bool,
        no_http: bool,
    ) -> Vec<Arc<dyn Provider>> {
        let mut providers: Vec<Arc<dyn Provider>> = Vec::new();

        // Config cache first: cheapest possible bootstrap.
        if let Some(path) = &bag.config_cache_path {
            providers.push(FileProvider::new(path, bag.config_cache_ro));
        }

        let kv_seeds: Vec<HostEntry> = connstr
            .hosts
            .iter()
            .filter(|h| h.transport != BootstrapTransport::HttpOnly)
            .map(|h| {
                // An http:// seed names the management port; the kv side
                // starts from the default memcached port.
                if connstr.scheme == "http" && h.transport == BootstrapTransport::Any {
                    HostEntry::new(h.host.clone(), crate::config::connstr::DEFAULT_KV_PORT)
                } else {
                    h.clone()
                }
            })
            .collect();
        let http_seeds: Vec<HostEntry> = connstr
            .hosts
            .iter()
            .filter(|h| h.transport != BootstrapTransport::CccpOnly)
            .map(|h| {
                let port = match h.transport {
                    BootstrapTransport::HttpOnly => h.port,
                    _ if connstr.scheme == "http" => h.port,
                    _ if connstr.tls => DEFAULT_HTTP_TLS_PORT,
                    _ => DEFAULT_HTTP_PORT,
                };
                HostEntry::new(h.host.clone(), port)
            })
            .collect();

        if !no_cccp && !kv_seeds.is_empty() {
            let cccp = CccpProvider::new(Arc::clone(mc_pool), Arc::clone(cmdq), bag.clone());
            cccp.configure_nodes(&kv_seeds);
            providers.push(cccp);
        }

        if !no_http && !http_seeds.is_empty() {
            // Streaming updates share the inbox with NMV config pushes.
            let provider = HttpProvider::new(http.clone(), bag.clone(), inbox.clone());
            provider.configure_nodes(&http_seeds);
            providers.push(provider);
        }

        if bag.unsafe_optimize && providers.is_empty() {
            // Discovery fully disabled: run off the seed list.
            providers.push(StaticProvider::cluster_admin(&kv_seeds));
        }

        providers
    }

    fn spawn_event_forwarder(
        &self,
        mut events_rx: mpsc::UnboundedReceiver<PipelineEvent>,
        inbox: crate::confmon::ConfigInbox,
    ) {
        let monitor = Arc::downgrade(&self.monitor);
        let handle = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                match event {
                    PipelineEvent::ConfigFromNmv { raw, origin_host } => {
                        let _ = inbox.send((raw, origin_host, ConfigOrigin::Nmv));
                    }
                    PipelineEvent::SocketError { index, error } => {
                        debug!(index, %error, "socket error, requesting config refresh");
                        if let Some(monitor) = monitor.upgrade() {
                            tokio::spawn(async move {
                                let _ = monitor.refresh().await;
                            });
                        }
                    }
                }
            }
        });
        self.tasks.lock().expect("client lock").push(handle);
    }

    /// Bootstrap: run the provider chain until a config is accepted, then
    /// start background polling when `config_poll_interval` is non-zero.
    pub async fn connect(&self) -> Result<()> {
        let bag = self.settings.snapshot();
        info!(connstr = %self.connstr.to_uri(), "bootstrapping");

        let result = self.monitor.refresh().await;
        match (&result, bag.wait_for_config) {
            (Err(err), true) => return Err(err.clone()),
            (Err(err), false) => {
                warn!(%err, "initial bootstrap failed, continuing unconfigured")
            }
            (Ok(config), _) => {
                info!(rev = ?config.rev, nodes = config.nodes.len(), "bootstrapped");
            }
        }

        if !bag.config_poll_interval.is_zero() {
            let monitor = Arc::downgrade(&self.monitor);
            let interval = bag.config_poll_interval;
            let handle = tokio::spawn(async move {
                loop {
                    tokio::time::sleep(interval).await;
                    let Some(monitor) = monitor.upgrade() else { break };
                    let _ = monitor.refresh().await;
                }
            });
            self.tasks.lock().expect("client lock").push(handle);
        }
        Ok(())
    }

    /// Associate a bucket post-connect. Pipelines that already carry a
    /// session without this bucket issue SELECT_BUCKET.
    pub async fn open(&self, bucket: &str) -> Result<()> {
        self.settings
            .update(|s| s.bucket = Some(bucket.to_string()));
        for index in 0..self.cmdq.pipeline_count() {
            if let Some(pipeline) = self.cmdq.pipeline_at(index) {
                pipeline.set_bucket(bucket.to_string());
            }
        }
        Ok(())
    }

    #[must_use]
    pub fn current_config(&self) -> Option<SharedConfig> {
        self.cmdq.current_config()
    }

    #[must_use]
    pub fn monitor(&self) -> &Arc<ConfigMonitor> {
        &self.monitor
    }

    #[must_use]
    pub fn pending_ops(&self) -> &Arc<PendingOps> {
        &self.pending
    }

    /// Set an option by name at runtime.
    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        self.settings.set_option(name, value)
    }

    /// Read an option by name.
    pub fn get_option(&self, name: &str) -> Result<String> {
        self.settings.get_option(name)
    }

    fn ensure_live(&self) -> Result<()> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(CouchError::ShuttingDown);
        }
        Ok(())
    }

    async fn submit(&self, packet: RequestPacket, replica: usize) -> Result<KvResponse> {
        self.ensure_live()?;
        let bag = self.settings.snapshot();
        let threshold = bag
            .enable_tracing
            .then_some(bag.tracing_threshold_kv);
        let span = OperationSpan::start("kv", threshold)
            .with_detail(self.redactor.key(&packet.key));

        let (op, rx) = PendingOp::new(packet, bag.operation_timeout);
        self.cmdq.dispatch(op, replica);
        let result = rx
            .await
            .map_err(|_| CouchError::Internal("operation dropped without completion".into()))?;
        span.finish();
        result
    }

    /// Fetch a document.
    pub async fn get(&self, key: impl AsRef<[u8]>) -> Result<KvResponse> {
        let packet =
            RequestPacket::new(Opcode::Get).with_key(Bytes::copy_from_slice(key.as_ref()));
        self.submit(packet, 0).await
    }

    /// Fetch and lock a document for `lock_time`.
    pub async fn get_and_lock(
        &self,
        key: impl AsRef<[u8]>,
        lock_time: Duration,
    ) -> Result<KvResponse> {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(lock_time.as_secs() as u32);
        let packet = RequestPacket::new(Opcode::GetLocked)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_extras(extras.freeze());
        self.submit(packet, 0).await
    }

    /// Fetch and refresh the expiry.
    pub async fn get_and_touch(
        &self,
        key: impl AsRef<[u8]>,
        expiry: Duration,
    ) -> Result<KvResponse> {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry.as_secs() as u32);
        let packet = RequestPacket::new(Opcode::Gat)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_extras(extras.freeze());
        self.submit(packet, 0).await
    }

    /// Fetch from a replica (1-based replica index).
    pub async fn get_replica(&self, key: impl AsRef<[u8]>, replica: usize) -> Result<KvResponse> {
        if replica == 0 {
            return Err(CouchError::InvalidArgument(
                "replica index is 1-based".into(),
            ));
        }
        let packet =
            RequestPacket::new(Opcode::GetReplica).with_key(Bytes::copy_from_slice(key.as_ref()));
        self.submit(packet, replica).await
    }

    /// Store a document.
    pub async fn store(
        &self,
        mode: StoreMode,
        key: impl AsRef<[u8]>,
        value: impl Into<Bytes>,
        item_flags: u32,
        expiry: Duration,
        cas: u64,
    ) -> Result<KvResponse> {
        let mut packet = RequestPacket::new(mode.opcode())
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_value(value.into())
            .with_cas(cas);
        if mode.has_extras() {
            let mut extras = BytesMut::with_capacity(8);
            extras.put_u32(item_flags);
            extras.put_u32(expiry.as_secs() as u32);
            packet = packet.with_extras(extras.freeze());
        }
        self.submit(packet, 0).await
    }

    /// Set, creating or replacing.
    pub async fn upsert(&self, key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> Result<KvResponse> {
        self.store(StoreMode::Upsert, key, value, 0, Duration::ZERO, 0)
            .await
    }

    /// Create; fails with `KeyExists` when present.
    pub async fn insert(&self, key: impl AsRef<[u8]>, value: impl Into<Bytes>) -> Result<KvResponse> {
        self.store(StoreMode::Insert, key, value, 0, Duration::ZERO, 0)
            .await
    }

    /// Replace; fails with `KeyNotFound` when absent.
    pub async fn replace(
        &self,
        key: impl AsRef<[u8]>,
        value: impl Into<Bytes>,
        cas: u64,
    ) -> Result<KvResponse> {
        self.store(StoreMode::Replace, key, value, 0, Duration::ZERO, cas)
            .await
    }

    /// Delete a document.
    pub async fn remove(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<KvResponse> {
        let packet = RequestPacket::new(Opcode::Delete)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_cas(cas);
        self.submit(packet, 0).await
    }

    /// Refresh a document's expiry.
    pub async fn touch(&self, key: impl AsRef<[u8]>, expiry: Duration) -> Result<KvResponse> {
        let mut extras = BytesMut::with_capacity(4);
        extras.put_u32(expiry.as_secs() as u32);
        let packet = RequestPacket::new(Opcode::Touch)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_extras(extras.freeze());
        self.submit(packet, 0).await
    }

    /// Release a lock taken by [`CouchClient::get_and_lock`].
    pub async fn unlock(&self, key: impl AsRef<[u8]>, cas: u64) -> Result<KvResponse> {
        let packet = RequestPacket::new(Opcode::UnlockKey)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_cas(cas);
        self.submit(packet, 0).await
    }

    /// Atomic counter; `delta` may be negative.
    pub async fn counter(
        &self,
        key: impl AsRef<[u8]>,
        delta: i64,
        initial: u64,
        expiry: Duration,
    ) -> Result<KvResponse> {
        let _guard = self.pending.track(PendingCategory::Counter);
        let opcode = if delta >= 0 {
            Opcode::Increment
        } else {
            Opcode::Decrement
        };
        let mut extras = BytesMut::with_capacity(20);
        extras.put_u64(delta.unsigned_abs());
        extras.put_u64(initial);
        extras.put_u32(expiry.as_secs() as u32);
        let packet = RequestPacket::new(opcode)
            .with_key(Bytes::copy_from_slice(key.as_ref()))
            .with_extras(extras.freeze());
        self.submit(packet, 0).await
    }

    /// Observe the persistence/replication state of a key.
    pub async fn observe(&self, key: impl AsRef<[u8]>) -> Result<KvResponse> {
        let _guard = self.pending.track(PendingCategory::Durability);
        let key = key.as_ref();
        let config = self.current_config().ok_or(CouchError::NoMatchingServer)?;
        let vbucket = config
            .vbmap
            .as_ref()
            .map_or(0, |m| m.vbucket_for_key(key));
        let mut value = BytesMut::with_capacity(4 + key.len());
        value.put_u16(vbucket);
        value.put_u16(key.len() as u16);
        value.put_slice(key);
        let mut packet = RequestPacket::new(Opcode::Observe).with_value(value.freeze());
        packet.vbucket = vbucket;
        // Observe routes like the key it interrogates.
        packet.key = Bytes::copy_from_slice(key);
        self.submit(packet, 0).await
    }

    /// STAT from every connected node.
    pub async fn stats(&self, group: Option<&str>) -> Result<Vec<(usize, KvResponse)>> {
        self.ensure_live()?;
        let bag = self.settings.snapshot();
        let mut receivers = Vec::new();
        for index in 0..self.cmdq.pipeline_count() {
            let mut packet = RequestPacket::new(Opcode::Stat);
            if let Some(group) = group {
                packet = packet.with_key(Bytes::copy_from_slice(group.as_bytes()));
            }
            let (op, rx) = PendingOp::new(packet, bag.operation_timeout);
            self.cmdq.dispatch_to(index, op);
            receivers.push((index, rx));
        }
        let mut out = Vec::with_capacity(receivers.len());
        for (index, rx) in receivers {
            match rx.await {
                Ok(Ok(resp)) => out.push((index, resp)),
                Ok(Err(err)) => warn!(index, %err, "stats request failed"),
                Err(_) => {}
            }
        }
        Ok(out)
    }

    /// NOOP a specific pipeline (liveness probe).
    pub async fn noop(&self, index: usize) -> Result<KvResponse> {
        self.ensure_live()?;
        let bag = self.settings.snapshot();
        let (op, rx) = PendingOp::new(RequestPacket::new(Opcode::Noop), bag.operation_timeout);
        self.cmdq.dispatch_to(index, op);
        rx.await
            .map_err(|_| CouchError::Internal("operation dropped without completion".into()))?
    }

    /// Server version string from a specific pipeline.
    pub async fn version(&self, index: usize) -> Result<String> {
        self.ensure_live()?;
        let bag = self.settings.snapshot();
        let (op, rx) = PendingOp::new(RequestPacket::new(Opcode::Version), bag.operation_timeout);
        self.cmdq.dispatch_to(index, op);
        let resp = rx
            .await
            .map_err(|_| CouchError::Internal("operation dropped without completion".into()))??;
        Ok(String::from_utf8_lossy(&resp.value).into_owned())
    }

    /// Run an arbitrary HTTP request against the cluster.
    pub async fn http_request(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.ensure_live()?;
        let _guard = self.pending.track(PendingCategory::Http);
        self.http.execute(request).await
    }

    /// Execute a N1QL statement, returning the raw response body.
    pub async fn query(&self, statement: &str) -> Result<HttpResponse> {
        let body = serde_json::json!({ "statement": statement }).to_string();
        let request = HttpRequest::new(RequestType::Query, http::Method::POST, "/query/service")
            .with_body(body, "application/json");
        self.service_request("query", request).await
    }

    /// Query a view, returning the raw response body.
    pub async fn view_query(&self, ddoc: &str, view: &str, options: &str) -> Result<HttpResponse> {
        let bag = self.settings.snapshot();
        let bucket = bag
            .bucket
            .clone()
            .ok_or_else(|| CouchError::InvalidArgument("view query requires a bucket".into()))?;
        let mut path = format!("/{bucket}/_design/{ddoc}/_view/{view}");
        if !options.is_empty() {
            path.push('?');
            path.push_str(options);
        }
        let request = HttpRequest::new(RequestType::View, http::Method::GET, path);
        self.service_request("view", request).await
    }

    /// Full-text search, returning the raw response body.
    pub async fn search(&self, index: &str, query_json: &str) -> Result<HttpResponse> {
        let request = HttpRequest::new(
            RequestType::Search,
            http::Method::POST,
            format!("/api/index/{index}/query"),
        )
        .with_body(query_json.to_string(), "application/json");
        self.service_request("search", request).await
    }

    /// Analytics statement, returning the raw response body.
    pub async fn analytics(&self, statement: &str) -> Result<HttpResponse> {
        let body = serde_json::json!({ "statement": statement }).to_string();
        let request = HttpRequest::new(
            RequestType::Analytics,
            http::Method::POST,
            "/analytics/service",
        )
        .with_body(body, "application/json");
        self.service_request("analytics", request).await
    }

    async fn service_request(
        &self,
        name: &'static str,
        request: HttpRequest,
    ) -> Result<HttpResponse> {
        self.ensure_live()?;
        let _guard = self.pending.track(PendingCategory::Http);
        let bag = self.settings.snapshot();
        let threshold = bag.enable_tracing.then(|| match request.req_type {
            RequestType::Query => bag.tracing_threshold_query,
            RequestType::View => bag.tracing_threshold_view,
            RequestType::Search => bag.tracing_threshold_search,
            RequestType::Analytics => bag.tracing_threshold_analytics,
            _ => bag.tracing_threshold_query,
        });
        let span = OperationSpan::start(name, threshold);
        let result = self.http.execute(request).await;
        span.finish();
        result
    }

    /// Diagnostics dump of the monitor and provider chain.
    #[must_use]
    pub fn dump(&self) -> String {
        self.monitor.dump()
    }

    /// Tear the instance down: no new operations are accepted, pipelines
    /// close (failing their in-flight packets), the retry queue drains,
    /// the monitor stops, and both socket pools empty.
    pub async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let outstanding = self.pending.total();
        if outstanding > 0 {
            debug!(outstanding, "shutting down with operations in flight");
        }

        for task in self.tasks.lock().expect("client lock").drain(..) {
            task.abort();
        }
        self.retry_queue.drain_all();
        self.cmdq.close_all();
        self.monitor.shutdown().await;
        self.mc_pool.shutdown();
        self.http_pool.shutdown();
        info!("client shut down");
    }
}
