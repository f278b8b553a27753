// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client settings and the string control interface.
//!
//! [`ClientSettings`] is the shared configuration bag read throughout the
//! runtime. It is wrapped in [`SharedSettings`] so every long-lived
//! component can hold a cheap handle; mutation happens only through the
//! control interface ([`SharedSettings::set_option`]), which validates
//! names and value ranges the same way the connection-string query options
//! do.
//!
//! # Example
//!
//! ```
//! use couchbase_client::config::SharedSettings;
//!
//! let settings = SharedSettings::default();
//! settings.set_option("operation_timeout", "2.5").unwrap();
//! assert_eq!(settings.get_option("operation_timeout").unwrap(), "2.500000");
//! ```

pub mod connstr;

pub use connstr::{BootstrapTransport, ConnectionString, HostEntry};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::{CouchError, Result};

/// Hard floor for `persistence_timeout_floor`.
pub const PERSISTENCE_TIMEOUT_FLOOR: Duration = Duration::from_millis(1750);
/// Floor for a non-zero `config_poll_interval`.
pub const CONFIG_POLL_INTERVAL_FLOOR: Duration = Duration::from_millis(50);
/// Smallest accepted `compression_min_size`.
pub const COMPRESS_MIN_SIZE_FLOOR: usize = 32;

/// Failure classes a retry policy can be configured for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryMode {
    /// The topology changed underneath the request.
    TopoChange,
    /// The socket to the target node failed.
    SockErr,
    /// The vbucket map produced no usable target.
    VbMapErr,
    /// The target node is missing from the current map.
    MissingNode,
}

impl RetryMode {
    pub const ALL: [RetryMode; 4] = [
        RetryMode::TopoChange,
        RetryMode::SockErr,
        RetryMode::VbMapErr,
        RetryMode::MissingNode,
    ];

    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "topochange" => RetryMode::TopoChange,
            "sockerr" => RetryMode::SockErr,
            "maperr" | "vbmaperr" => RetryMode::VbMapErr,
            "missingnode" => RetryMode::MissingNode,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            RetryMode::TopoChange => "topochange",
            RetryMode::SockErr => "sockerr",
            RetryMode::VbMapErr => "maperr",
            RetryMode::MissingNode => "missingnode",
        }
    }
}

/// Which command classes are eligible for automatic retry under a mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryCmdClass {
    /// Retry everything.
    All,
    /// Retry idempotent reads only.
    Get,
    /// Retry reads plus mutations that carry a CAS (safe to replay).
    Safe,
    /// Never retry.
    #[default]
    None,
}

impl RetryCmdClass {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "all" => RetryCmdClass::All,
            "get" => RetryCmdClass::Get,
            "safe" => RetryCmdClass::Safe,
            "none" => RetryCmdClass::None,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            RetryCmdClass::All => "all",
            RetryCmdClass::Get => "get",
            RetryCmdClass::Safe => "safe",
            RetryCmdClass::None => "none",
        }
    }
}

/// Per-mode retry policy table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicyTable {
    pub topo_change: RetryCmdClass,
    pub sock_err: RetryCmdClass,
    pub vbmap_err: RetryCmdClass,
    pub missing_node: RetryCmdClass,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        Self {
            topo_change: RetryCmdClass::All,
            sock_err: RetryCmdClass::Safe,
            vbmap_err: RetryCmdClass::None,
            missing_node: RetryCmdClass::None,
        }
    }
}

impl RetryPolicyTable {
    #[must_use]
    pub fn class_for(&self, mode: RetryMode) -> RetryCmdClass {
        match mode {
            RetryMode::TopoChange => self.topo_change,
            RetryMode::SockErr => self.sock_err,
            RetryMode::VbMapErr => self.vbmap_err,
            RetryMode::MissingNode => self.missing_node,
        }
    }

    pub fn set_class(&mut self, mode: RetryMode, class: RetryCmdClass) {
        match mode {
            RetryMode::TopoChange => self.topo_change = class,
            RetryMode::SockErr => self.sock_err = class,
            RetryMode::VbMapErr => self.vbmap_err = class,
            RetryMode::MissingNode => self.missing_node = class,
        }
    }

    /// Parse the `mode:class` form used by the `retry_policy` option.
    pub fn apply_spec(&mut self, spec: &str) -> Result<()> {
        let (mode, class) = spec
            .split_once(':')
            .ok_or_else(|| CouchError::InvalidArgument(format!("retry_policy {spec:?}")))?;
        let mode = RetryMode::parse(mode)
            .ok_or_else(|| CouchError::InvalidArgument(format!("retry mode {mode:?}")))?;
        let class = RetryCmdClass::parse(class)
            .ok_or_else(|| CouchError::InvalidArgument(format!("retry class {class:?}")))?;
        self.set_class(mode, class);
        Ok(())
    }

    #[must_use]
    pub fn to_spec(&self) -> String {
        RetryMode::ALL
            .iter()
            .map(|m| format!("{}:{}", m.name(), self.class_for(*m).name()))
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Compression negotiation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionMode {
    Off,
    #[default]
    On,
    InflateOnly,
    DeflateOnly,
    Force,
}

impl CompressionMode {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "off" | "false" => CompressionMode::Off,
            "on" | "true" => CompressionMode::On,
            "inflate_only" => CompressionMode::InflateOnly,
            "deflate_only" => CompressionMode::DeflateOnly,
            "force" => CompressionMode::Force,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            CompressionMode::Off => "off",
            CompressionMode::On => "on",
            CompressionMode::InflateOnly => "inflate_only",
            CompressionMode::DeflateOnly => "deflate_only",
            CompressionMode::Force => "force",
        }
    }
}

/// IPv6 handling for bootstrap and data connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ipv6Mode {
    #[default]
    Disabled,
    Only,
    Allow,
}

impl Ipv6Mode {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "disabled" => Ipv6Mode::Disabled,
            "only" => Ipv6Mode::Only,
            "allow" => Ipv6Mode::Allow,
            _ => return None,
        })
    }

    fn name(self) -> &'static str {
        match self {
            Ipv6Mode::Disabled => "disabled",
            Ipv6Mode::Only => "only",
            Ipv6Mode::Allow => "allow",
        }
    }
}

/// HTTP config-stream URL preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HttpUrlMode {
    /// Try the terse URI, fall back to compat on 404.
    #[default]
    TerseThenCompat,
    /// Terse only.
    Terse,
    /// Compat only.
    Compat,
}

/// The configuration bag. Field-by-field mirror of the recognised options.
#[derive(Debug, Clone)]
pub struct ClientSettings {
    // Timeouts
    pub operation_timeout: Duration,
    pub views_timeout: Duration,
    pub query_timeout: Duration,
    pub analytics_timeout: Duration,
    pub search_timeout: Duration,
    pub http_timeout: Duration,
    pub durability_timeout: Duration,
    pub durability_interval: Duration,
    pub persistence_timeout_floor: Duration,
    pub config_total_timeout: Duration,
    pub config_node_timeout: Duration,
    pub config_poll_interval: Duration,

    // Retry machinery
    pub retry_policy: RetryPolicyTable,
    pub retry_interval: Duration,
    pub retry_backoff_factor: f64,
    pub retry_nmv_interval: Duration,
    pub nmv_retry_imm: bool,

    // Config monitor
    pub grace_next_provider: Duration,
    pub grace_next_cycle: Duration,
    pub bc_http_stream_time: Duration,
    pub http_urlmode: HttpUrlMode,
    pub config_cache_path: Option<String>,
    pub config_cache_ro: bool,

    // Pools
    pub http_poolsize: usize,
    pub http_pool_timeout: Duration,
    pub mc_poolsize: usize,
    pub mc_pool_timeout: Duration,

    // Networking
    pub randomize_nodes: bool,
    pub ipv6: Ipv6Mode,
    pub tcp_nodelay: bool,
    pub tcp_keepalive: bool,
    pub network: Option<String>,
    pub max_redirects: i32,

    // TLS
    pub ssl_enabled: bool,
    pub ssl_cacert: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_no_verify: bool,

    // Credentials
    pub username: Option<String>,
    pub password: Option<String>,
    pub bucket: Option<String>,
    pub sasl_mech_force: Option<String>,

    // Features
    pub select_bucket: bool,
    pub enable_mutation_tokens: bool,
    pub enable_collections: bool,
    pub enable_durable_write: bool,
    pub enable_unordered_execution: bool,
    pub enable_errmap: bool,
    pub enable_tracing: bool,
    pub tracing_threshold_kv: Duration,
    pub tracing_threshold_query: Duration,
    pub tracing_threshold_view: Duration,
    pub tracing_threshold_search: Duration,
    pub tracing_threshold_analytics: Duration,

    // Compression
    pub compression: CompressionMode,
    pub compression_min_size: usize,
    pub compression_min_ratio: f64,

    // Logging
    pub log_redaction: bool,
    pub console_log_level: i32,
    pub console_log_file: Option<String>,

    // Behaviour toggles
    pub vb_noremap: bool,
    pub wait_for_config: bool,
    pub unsafe_optimize: bool,
    pub client_string: Option<String>,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_micros(2_500_000),
            views_timeout: Duration::from_secs(75),
            query_timeout: Duration::from_secs(75),
            analytics_timeout: Duration::from_secs(75),
            search_timeout: Duration::from_secs(75),
            http_timeout: Duration::from_secs(75),
            durability_timeout: Duration::from_secs(5),
            durability_interval: Duration::from_millis(100),
            persistence_timeout_floor: PERSISTENCE_TIMEOUT_FLOOR,
            config_total_timeout: Duration::from_secs(5),
            config_node_timeout: Duration::from_secs(2),
            config_poll_interval: Duration::from_micros(2_500_000),
            retry_policy: RetryPolicyTable::default(),
            retry_interval: Duration::from_millis(100),
            retry_backoff_factor: 1.0,
            retry_nmv_interval: Duration::from_millis(100),
            nmv_retry_imm: true,
            grace_next_provider: Duration::from_millis(100),
            grace_next_cycle: Duration::from_secs(10),
            bc_http_stream_time: Duration::from_secs(10),
            http_urlmode: HttpUrlMode::default(),
            config_cache_path: None,
            config_cache_ro: false,
            http_poolsize: 10,
            http_pool_timeout: Duration::from_secs(10),
            mc_poolsize: 10,
            mc_pool_timeout: Duration::from_secs(10),
            randomize_nodes: false,
            ipv6: Ipv6Mode::default(),
            tcp_nodelay: true,
            tcp_keepalive: true,
            network: None,
            max_redirects: -1,
            ssl_enabled: false,
            ssl_cacert: None,
            ssl_cert: None,
            ssl_key: None,
            ssl_no_verify: false,
            username: None,
            password: None,
            bucket: None,
            sasl_mech_force: None,
            select_bucket: true,
            enable_mutation_tokens: true,
            enable_collections: true,
            enable_durable_write: true,
            enable_unordered_execution: true,
            enable_errmap: true,
            enable_tracing: true,
            tracing_threshold_kv: Duration::from_millis(500),
            tracing_threshold_query: Duration::from_secs(1),
            tracing_threshold_view: Duration::from_secs(1),
            tracing_threshold_search: Duration::from_secs(1),
            tracing_threshold_analytics: Duration::from_secs(1),
            compression: CompressionMode::default(),
            compression_min_size: COMPRESS_MIN_SIZE_FLOOR,
            compression_min_ratio: 0.83,
            log_redaction: false,
            console_log_level: 2,
            console_log_file: None,
            vb_noremap: false,
            wait_for_config: true,
            unsafe_optimize: false,
            client_string: None,
        }
    }
}

fn parse_duration_secs(value: &str) -> Result<Duration> {
    let secs: f64 = value
        .parse()
        .map_err(|_| CouchError::InvalidArgument(format!("bad time value {value:?}")))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(CouchError::InvalidArgument(format!(
            "bad time value {value:?}"
        )));
    }
    Ok(Duration::from_micros((secs * 1_000_000.0) as u64))
}

fn fmt_duration_secs(d: Duration) -> String {
    format!("{:.6}", d.as_secs_f64())
}

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "1" | "true" | "on" | "yes" => Ok(true),
        "0" | "false" | "off" | "no" => Ok(false),
        _ => Err(CouchError::InvalidArgument(format!(
            "bad boolean {value:?}"
        ))),
    }
}

impl ClientSettings {
    /// Set a single option by its string name. This is the one mutation
    /// path shared by the control interface, connection-string query
    /// options, and the `LCB_OPTIONS` environment override.
    pub fn set_option(&mut self, name: &str, value: &str) -> Result<()> {
        match name {
            "operation_timeout" | "timeout" => self.operation_timeout = parse_duration_secs(value)?,
            "views_timeout" => self.views_timeout = parse_duration_secs(value)?,
            "query_timeout" | "n1ql_timeout" => self.query_timeout = parse_duration_secs(value)?,
            "analytics_timeout" => self.analytics_timeout = parse_duration_secs(value)?,
            "search_timeout" | "fts_timeout" => self.search_timeout = parse_duration_secs(value)?,
            "http_timeout" => self.http_timeout = parse_duration_secs(value)?,
            "durability_timeout" => self.durability_timeout = parse_duration_secs(value)?,
            "durability_interval" => self.durability_interval = parse_duration_secs(value)?,
            "persistence_timeout_floor" => {
                let d = parse_duration_secs(value)?;
                if d < PERSISTENCE_TIMEOUT_FLOOR {
                    return Err(CouchError::InvalidArgument(format!(
                        "persistence_timeout_floor below hard floor of {}ms",
                        PERSISTENCE_TIMEOUT_FLOOR.as_millis()
                    )));
                }
                self.persistence_timeout_floor = d;
            }
            "config_total_timeout" => self.config_total_timeout = parse_duration_secs(value)?,
            "config_node_timeout" => self.config_node_timeout = parse_duration_secs(value)?,
            "config_poll_interval" => {
                let d = parse_duration_secs(value)?;
                if !d.is_zero() && d < CONFIG_POLL_INTERVAL_FLOOR {
                    return Err(CouchError::InvalidArgument(format!(
                        "config_poll_interval below floor of {}ms",
                        CONFIG_POLL_INTERVAL_FLOOR.as_millis()
                    )));
                }
                self.config_poll_interval = d;
            }
            "retry_policy" => self.retry_policy.apply_spec(value)?,
            "retry_interval" => self.retry_interval = parse_duration_secs(value)?,
            "retry_backoff_factor" => {
                self.retry_backoff_factor = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad backoff factor {value:?}"))
                })?;
            }
            "retry_nmv_interval" => self.retry_nmv_interval = parse_duration_secs(value)?,
            "nmv_retry_imm" => self.nmv_retry_imm = parse_bool(value)?,
            "bc_http_stream_time" => self.bc_http_stream_time = parse_duration_secs(value)?,
            "http_urlmode" => {
                self.http_urlmode = match value {
                    "terse" => HttpUrlMode::Terse,
                    "compat" => HttpUrlMode::Compat,
                    "both" => HttpUrlMode::TerseThenCompat,
                    _ => {
                        return Err(CouchError::InvalidArgument(format!(
                            "bad http_urlmode {value:?}"
                        )))
                    }
                }
            }
            "configcache" => self.config_cache_path = Some(value.to_string()),
            "configcache_ro" => self.config_cache_ro = parse_bool(value)?,
            "http_poolsize" => {
                self.http_poolsize = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad pool size {value:?}"))
                })?;
            }
            "http_pool_timeout" => self.http_pool_timeout = parse_duration_secs(value)?,
            "randomize_nodes" => self.randomize_nodes = parse_bool(value)?,
            "ipv6" => {
                self.ipv6 = Ipv6Mode::parse(value).ok_or_else(|| {
                    CouchError::InvalidArgument(format!("bad ipv6 mode {value:?}"))
                })?;
            }
            "tcp_nodelay" => self.tcp_nodelay = parse_bool(value)?,
            "tcp_keepalive" => self.tcp_keepalive = parse_bool(value)?,
            "network" => self.network = Some(value.to_string()),
            "max_redirects" => {
                self.max_redirects = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad max_redirects {value:?}"))
                })?;
            }
            "ssl" => {
                self.ssl_enabled = match value {
                    "on" | "true" | "1" => true,
                    "off" | "false" | "0" => false,
                    "no_verify" => {
                        self.ssl_no_verify = true;
                        true
                    }
                    _ => {
                        return Err(CouchError::InvalidArgument(format!(
                            "bad ssl mode {value:?}"
                        )))
                    }
                }
            }
            "ssl_cacert" | "certpath" => self.ssl_cacert = Some(value.to_string()),
            "ssl_cert" => self.ssl_cert = Some(value.to_string()),
            "ssl_key" | "keypath" => self.ssl_key = Some(value.to_string()),
            "bucket_cred" => {
                let pair: Vec<String> = serde_json::from_str(value).map_err(|_| {
                    CouchError::InvalidArgument("bucket_cred expects a JSON [user,pass]".into())
                })?;
                if pair.len() != 2 {
                    return Err(CouchError::InvalidArgument(
                        "bucket_cred expects a JSON [user,pass]".into(),
                    ));
                }
                self.username = Some(pair[0].clone());
                self.password = Some(pair[1].clone());
            }
            "sasl_mech_force" => self.sasl_mech_force = Some(value.to_string()),
            "select_bucket" => self.select_bucket = parse_bool(value)?,
            "enable_mutation_tokens" | "mutation_tokens" => {
                self.enable_mutation_tokens = parse_bool(value)?;
            }
            "enable_collections" => self.enable_collections = parse_bool(value)?,
            "enable_durable_write" => self.enable_durable_write = parse_bool(value)?,
            "enable_unordered_execution" => self.enable_unordered_execution = parse_bool(value)?,
            "enable_errmap" => self.enable_errmap = parse_bool(value)?,
            "enable_tracing" => self.enable_tracing = parse_bool(value)?,
            "tracing_threshold_kv" => self.tracing_threshold_kv = parse_duration_secs(value)?,
            "tracing_threshold_query" => self.tracing_threshold_query = parse_duration_secs(value)?,
            "tracing_threshold_view" => self.tracing_threshold_view = parse_duration_secs(value)?,
            "tracing_threshold_search" => {
                self.tracing_threshold_search = parse_duration_secs(value)?;
            }
            "tracing_threshold_analytics" => {
                self.tracing_threshold_analytics = parse_duration_secs(value)?;
            }
            "compression" => {
                self.compression = CompressionMode::parse(value).ok_or_else(|| {
                    CouchError::InvalidArgument(format!("bad compression mode {value:?}"))
                })?;
            }
            "compression_min_size" => {
                let n: usize = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad compression_min_size {value:?}"))
                })?;
                self.compression_min_size = n.max(COMPRESS_MIN_SIZE_FLOOR);
            }
            "compression_min_ratio" => {
                let r: f64 = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad compression_min_ratio {value:?}"))
                })?;
                if !(0.0..=1.0).contains(&r) {
                    return Err(CouchError::InvalidArgument(
                        "compression_min_ratio must be within 0.0..=1.0".into(),
                    ));
                }
                self.compression_min_ratio = r;
            }
            "log_redaction" => self.log_redaction = parse_bool(value)?,
            "console_log_level" => {
                self.console_log_level = value.parse().map_err(|_| {
                    CouchError::InvalidArgument(format!("bad console_log_level {value:?}"))
                })?;
            }
            "console_log_file" => self.console_log_file = Some(value.to_string()),
            "vb_noremap" => self.vb_noremap = parse_bool(value)?,
            "wait_for_config" => self.wait_for_config = parse_bool(value)?,
            "unsafe_optimize" => self.unsafe_optimize = parse_bool(value)?,
            "client_string" => self.client_string = Some(value.to_string()),
            _ => return Err(CouchError::UnknownOption(name.to_string())),
        }
        Ok(())
    }

    /// Read an option back in its string form.
    pub fn get_option(&self, name: &str) -> Result<String> {
        Ok(match name {
            "operation_timeout" | "timeout" => fmt_duration_secs(self.operation_timeout),
            "views_timeout" => fmt_duration_secs(self.views_timeout),
            "query_timeout" | "n1ql_timeout" => fmt_duration_secs(self.query_timeout),
            "analytics_timeout" => fmt_duration_secs(self.analytics_timeout),
            "search_timeout" | "fts_timeout" => fmt_duration_secs(self.search_timeout),
            "http_timeout" => fmt_duration_secs(self.http_timeout),
            "durability_timeout" => fmt_duration_secs(self.durability_timeout),
            "durability_interval" => fmt_duration_secs(self.durability_interval),
            "persistence_timeout_floor" => fmt_duration_secs(self.persistence_timeout_floor),
            "config_total_timeout" => fmt_duration_secs(self.config_total_timeout),
            "config_node_timeout" => fmt_duration_secs(self.config_node_timeout),
            "config_poll_interval" => fmt_duration_secs(self.config_poll_interval),
            "retry_policy" => self.retry_policy.to_spec(),
            "retry_interval" => fmt_duration_secs(self.retry_interval),
            "retry_backoff_factor" => format!("{}", self.retry_backoff_factor),
            "retry_nmv_interval" => fmt_duration_secs(self.retry_nmv_interval),
            "nmv_retry_imm" => (self.nmv_retry_imm as u8).to_string(),
            "bc_http_stream_time" => fmt_duration_secs(self.bc_http_stream_time),
            "http_poolsize" => self.http_poolsize.to_string(),
            "http_pool_timeout" => fmt_duration_secs(self.http_pool_timeout),
            "randomize_nodes" => (self.randomize_nodes as u8).to_string(),
            "ipv6" => self.ipv6.name().to_string(),
            "tcp_nodelay" => (self.tcp_nodelay as u8).to_string(),
            "tcp_keepalive" => (self.tcp_keepalive as u8).to_string(),
            "max_redirects" => self.max_redirects.to_string(),
            "ssl" => if self.ssl_enabled { "on" } else { "off" }.to_string(),
            "compression" => self.compression.name().to_string(),
            "compression_min_size" => self.compression_min_size.to_string(),
            "compression_min_ratio" => format!("{}", self.compression_min_ratio),
            "log_redaction" => (self.log_redaction as u8).to_string(),
            "console_log_level" => self.console_log_level.to_string(),
            "select_bucket" => (self.select_bucket as u8).to_string(),
            "enable_mutation_tokens" | "mutation_tokens" => {
                (self.enable_mutation_tokens as u8).to_string()
            }
            "enable_collections" => (self.enable_collections as u8).to_string(),
            "enable_durable_write" => (self.enable_durable_write as u8).to_string(),
            "enable_unordered_execution" => (self.enable_unordered_execution as u8).to_string(),
            "enable_tracing" => (self.enable_tracing as u8).to_string(),
            "vb_noremap" => (self.vb_noremap as u8).to_string(),
            "wait_for_config" => (self.wait_for_config as u8).to_string(),
            "unsafe_optimize" => (self.unsafe_optimize as u8).to_string(),
            "client_string" => self.client_string.clone().unwrap_or_default(),
            "network" => self.network.clone().unwrap_or_default(),
            _ => return Err(CouchError::UnknownOption(name.to_string())),
        })
    }

    /// Apply the `LCB_*` environment overrides in documented order.
    pub fn apply_env_overrides(&mut self, env: &HashMap<String, String>) -> Result<()> {
        if let Some(opts) = env.get("LCB_OPTIONS") {
            for pair in opts.split('&').filter(|s| !s.is_empty()) {
                if let Some((k, v)) = pair.split_once('=') {
                    self.set_option(k, v)?;
                }
            }
        }
        if let Some(mode) = env.get("LCB_SSL_MODE") {
            self.set_option("ssl", mode)?;
        }
        if let Some(path) = env.get("LCB_SSL_CACERT") {
            self.ssl_cacert = Some(path.clone());
        }
        if let Some(path) = env.get("LCB_SSL_KEY") {
            self.ssl_key = Some(path.clone());
        }
        if let Some(level) = env.get("LCB_LOGLEVEL") {
            self.console_log_level = level
                .parse()
                .map_err(|_| CouchError::InvalidArgument("bad LCB_LOGLEVEL".into()))?;
        }
        Ok(())
    }
}

/// Cheap, shared, interior-mutable handle to the settings bag.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<ClientSettings>>,
}

impl SharedSettings {
    #[must_use]
    pub fn new(settings: ClientSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    /// Snapshot the current settings. Cloning the bag is cheap relative to
    /// holding a lock across awaits.
    #[must_use]
    pub fn snapshot(&self) -> ClientSettings {
        self.inner.read().expect("settings lock poisoned").clone()
    }

    pub fn set_option(&self, name: &str, value: &str) -> Result<()> {
        self.inner
            .write()
            .expect("settings lock poisoned")
            .set_option(name, value)
    }

    pub fn get_option(&self, name: &str) -> Result<String> {
        self.inner
            .read()
            .expect("settings lock poisoned")
            .get_option(name)
    }

    pub fn update<F: FnOnce(&mut ClientSettings)>(&self, f: F) {
        f(&mut self.inner.write().expect("settings lock poisoned"));
    }
}

/// Ordered, deduplicating list of `(host, port)` bootstrap candidates with
/// a rotating cursor.
#[derive(Debug, Clone, Default)]
pub struct HostList {
    hosts: Vec<HostEntry>,
    cursor: usize,
}

impl HostList {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a host unless an identical entry is already present.
    pub fn add(&mut self, entry: HostEntry) {
        if !self.hosts.iter().any(|h| h == &entry) {
            self.hosts.push(entry);
        }
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = HostEntry>) {
        for e in entries {
            self.add(e);
        }
    }

    /// Replace the contents, keeping the cursor position modulo the new
    /// length.
    pub fn assign(&mut self, entries: impl IntoIterator<Item = HostEntry>) {
        self.hosts.clear();
        self.extend(entries);
        if !self.hosts.is_empty() {
            self.cursor %= self.hosts.len();
        } else {
            self.cursor = 0;
        }
    }

    /// Next candidate in rotation.
    pub fn next_host(&mut self) -> Option<&HostEntry> {
        if self.hosts.is_empty() {
            return None;
        }
        let idx = self.cursor;
        self.cursor = (self.cursor + 1) % self.hosts.len();
        self.hosts.get(idx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }

    #[must_use]
    pub fn as_slice(&self) -> &[HostEntry] {
        &self.hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = ClientSettings::default();
        assert_eq!(s.operation_timeout, Duration::from_micros(2_500_000));
        assert_eq!(s.retry_policy.topo_change, RetryCmdClass::All);
        assert_eq!(s.retry_policy.missing_node, RetryCmdClass::None);
        assert!(s.nmv_retry_imm);
        assert_eq!(s.max_redirects, -1);
    }

    #[test]
    fn test_set_get_roundtrip() {
        let mut s = ClientSettings::default();
        s.set_option("operation_timeout", "1.25").unwrap();
        assert_eq!(s.operation_timeout, Duration::from_micros(1_250_000));
        assert_eq!(s.get_option("operation_timeout").unwrap(), "1.250000");

        s.set_option("retry_policy", "sockerr:get").unwrap();
        assert_eq!(s.retry_policy.sock_err, RetryCmdClass::Get);

        s.set_option("compression", "inflate_only").unwrap();
        assert_eq!(s.compression, CompressionMode::InflateOnly);
    }

    #[test]
    fn test_unknown_option_rejected() {
        let mut s = ClientSettings::default();
        assert!(matches!(
            s.set_option("definitely_not_an_option", "1"),
            Err(CouchError::UnknownOption(_))
        ));
    }

    #[test]
    fn test_poll_interval_floor() {
        let mut s = ClientSettings::default();
        // Below floor: rejected.
        assert!(s.set_option("config_poll_interval", "0.01").is_err());
        // Zero disables polling.
        s.set_option("config_poll_interval", "0").unwrap();
        assert!(s.config_poll_interval.is_zero());
        // At/above floor: accepted.
        s.set_option("config_poll_interval", "0.05").unwrap();
    }

    #[test]
    fn test_persistence_floor_is_hard() {
        let mut s = ClientSettings::default();
        assert!(s.set_option("persistence_timeout_floor", "0.5").is_err());
        s.set_option("persistence_timeout_floor", "2.0").unwrap();
        assert_eq!(s.persistence_timeout_floor, Duration::from_secs(2));
    }

    #[test]
    fn test_bucket_cred_json() {
        let mut s = ClientSettings::default();
        s.set_option("bucket_cred", r#"["user","pass"]"#).unwrap();
        assert_eq!(s.username.as_deref(), Some("user"));
        assert_eq!(s.password.as_deref(), Some("pass"));
        assert!(s.set_option("bucket_cred", r#"["only-one"]"#).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut s = ClientSettings::default();
        let mut env = HashMap::new();
        env.insert(
            "LCB_OPTIONS".to_string(),
            "operation_timeout=4&tcp_nodelay=0".to_string(),
        );
        env.insert("LCB_SSL_MODE".to_string(), "on".to_string());
        env.insert("LCB_LOGLEVEL".to_string(), "5".to_string());
        s.apply_env_overrides(&env).unwrap();
        assert_eq!(s.operation_timeout, Duration::from_secs(4));
        assert!(!s.tcp_nodelay);
        assert!(s.ssl_enabled);
        assert_eq!(s.console_log_level, 5);
    }

    #[test]
    fn test_compression_ratio_bounds() {
        let mut s = ClientSettings::default();
        assert!(s.set_option("compression_min_ratio", "1.5").is_err());
        s.set_option("compression_min_ratio", "0.5").unwrap();
        assert!((s.compression_min_ratio - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_host_list_dedup_and_rotation() {
        let mut hl = HostList::new();
        hl.add(HostEntry::new("a", 11210));
        hl.add(HostEntry::new("b", 11210));
        hl.add(HostEntry::new("a", 11210));
        assert_eq!(hl.len(), 2);

        let first = hl.next_host().unwrap().host.clone();
        let second = hl.next_host().unwrap().host.clone();
        let third = hl.next_host().unwrap().host.clone();
        assert_eq!(first, "a");
        assert_eq!(second, "b");
        assert_eq!(third, "a"); // wrapped
    }

    #[test]
    fn test_shared_settings_control() {
        let shared = SharedSettings::default();
        shared.set_option("randomize_nodes", "1").unwrap();
        assert!(shared.snapshot().randomize_nodes);
        assert_eq!(shared.get_option("randomize_nodes").unwrap(), "1");
    }
}
