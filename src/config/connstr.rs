// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection string parsing.
//!
//! Grammar: `scheme://host[:port][,host[:port]]*[/bucket]?opt=val&opt=val`.
//! The scheme selects TLS and the default ports; a per-host `=http` or
//! `=mcd` suffix after the port restricts which bootstrap transport that
//! host is used for.
//!
//! ```
//! use couchbase_client::config::ConnectionString;
//!
//! let cs = ConnectionString::parse(
//!     "couchbases://a.example.com,b.example.com:11208/travel?operation_timeout=5",
//! )
//! .unwrap();
//! assert!(cs.tls);
//! assert_eq!(cs.bucket.as_deref(), Some("travel"));
//! assert_eq!(cs.hosts.len(), 2);
//! ```

use std::fmt;

use crate::error::{CouchError, Result};

/// Default memcached port for `couchbase://`.
pub const DEFAULT_KV_PORT: u16 = 11210;
/// Default memcached TLS port for `couchbases://`.
pub const DEFAULT_KV_TLS_PORT: u16 = 11207;
/// Default management port.
pub const DEFAULT_HTTP_PORT: u16 = 8091;
/// Default management TLS port.
pub const DEFAULT_HTTP_TLS_PORT: u16 = 18091;

/// Which bootstrap transport a seed host may be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapTransport {
    /// Either CCCP or HTTP, as the provider chain decides.
    #[default]
    Any,
    /// HTTP streaming config only.
    HttpOnly,
    /// CCCP (memcached) only.
    CccpOnly,
}

/// One seed host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host: String,
    pub port: u16,
    pub transport: BootstrapTransport,
}

impl HostEntry {
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            transport: BootstrapTransport::Any,
        }
    }

    #[must_use]
    pub fn with_transport(mut self, transport: BootstrapTransport) -> Self {
        self.transport = transport;
        self
    }
}

impl fmt::Display for HostEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)?;
        match self.transport {
            BootstrapTransport::Any => Ok(()),
            BootstrapTransport::HttpOnly => write!(f, "=http"),
            BootstrapTransport::CccpOnly => write!(f, "=mcd"),
        }
    }
}

/// Parsed connection string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub scheme: String,
    pub hosts: Vec<HostEntry>,
    pub bucket: Option<String>,
    /// `opt=val` pairs in source order, applied to the settings bag after
    /// parse.
    pub options: Vec<(String, String)>,
    pub tls: bool,
    /// The scheme demanded an explicit DNS-SRV lookup of the single seed.
    pub srv_explicit: bool,
}

impl ConnectionString {
    pub fn parse(input: &str) -> Result<Self> {
        let (scheme, rest) = input
            .split_once("://")
            .ok_or_else(|| CouchError::InvalidArgument(format!("missing scheme in {input:?}")))?;

        let (tls, default_port, srv_explicit) = match scheme {
            "couchbase" => (false, DEFAULT_KV_PORT, false),
            "couchbases" => (true, DEFAULT_KV_TLS_PORT, false),
            "http" => (false, DEFAULT_HTTP_PORT, false),
            "couchbase+explicit_srv" => (false, DEFAULT_KV_PORT, true),
            other => {
                return Err(CouchError::InvalidArgument(format!(
                    "unrecognized scheme {other:?}"
                )))
            }
        };

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };
        let (hostpart, bucket) = match rest.split_once('/') {
            Some((h, b)) if !b.is_empty() => (h, Some(b.to_string())),
            Some((h, _)) => (h, None),
            None => (rest, None),
        };

        if hostpart.is_empty() {
            return Err(CouchError::InvalidArgument(
                "connection string has no hosts".into(),
            ));
        }

        let mut hosts = Vec::new();
        for spec in hostpart.split(',').filter(|s| !s.is_empty()) {
            hosts.push(Self::parse_host(spec, default_port)?);
        }

        if srv_explicit && hosts.len() != 1 {
            return Err(CouchError::InvalidArgument(
                "explicit DNS-SRV requires exactly one seed host".into(),
            ));
        }

        let mut options = Vec::new();
        if let Some(query) = query {
            for pair in query.split('&').filter(|s| !s.is_empty()) {
                let (k, v) = pair.split_once('=').ok_or_else(|| {
                    CouchError::InvalidArgument(format!("bad query pair {pair:?}"))
                })?;
                options.push((k.to_string(), v.to_string()));
            }
        }

        Ok(Self {
            scheme: scheme.to_string(),
            hosts,
            bucket,
            options,
            tls,
            srv_explicit,
        })
    }

    fn parse_host(spec: &str, default_port: u16) -> Result<HostEntry> {
        // Bracketed IPv6 literal, optionally followed by :port.
        let (host, tail) = if let Some(stripped) = spec.strip_prefix('[') {
            let end = stripped
                .find(']')
                .ok_or_else(|| CouchError::InvalidArgument(format!("bad host {spec:?}")))?;
            (&stripped[..end], &stripped[end + 1..])
        } else {
            match spec.find(':') {
                Some(idx) => (&spec[..idx], &spec[idx..]),
                None => (spec, ""),
            }
        };

        if host.is_empty() {
            return Err(CouchError::InvalidArgument(format!("bad host {spec:?}")));
        }

        let mut port = default_port;
        let mut transport = BootstrapTransport::Any;
        if let Some(porttail) = tail.strip_prefix(':') {
            let (portstr, typestr) = match porttail.split_once('=') {
                Some((p, t)) => (p, Some(t)),
                None => (porttail, None),
            };
            port = portstr
                .parse()
                .map_err(|_| CouchError::InvalidArgument(format!("bad port in {spec:?}")))?;
            if let Some(typestr) = typestr {
                transport = match typestr {
                    "http" => BootstrapTransport::HttpOnly,
                    "mcd" => BootstrapTransport::CccpOnly,
                    other => {
                        return Err(CouchError::InvalidArgument(format!(
                            "bad host type {other:?}"
                        )))
                    }
                };
            }
        } else if !tail.is_empty() {
            return Err(CouchError::InvalidArgument(format!("bad host {spec:?}")));
        }

        Ok(HostEntry {
            host: host.to_string(),
            port,
            transport,
        })
    }

    /// Serialise back into the grammar. Parsing the output yields an
    /// equivalent spec.
    #[must_use]
    pub fn to_uri(&self) -> String {
        let mut out = format!("{}://", self.scheme);
        let hosts: Vec<String> = self.hosts.iter().map(ToString::to_string).collect();
        out.push_str(&hosts.join(","));
        if let Some(bucket) = &self.bucket {
            out.push('/');
            out.push_str(bucket);
        }
        if !self.options.is_empty() {
            out.push('?');
            let opts: Vec<String> = self
                .options
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            out.push_str(&opts.join("&"));
        }
        out
    }
}

impl fmt::Display for ConnectionString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_uri())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic() {
        let cs = ConnectionString::parse("couchbase://localhost").unwrap();
        assert!(!cs.tls);
        assert_eq!(cs.hosts.len(), 1);
        assert_eq!(cs.hosts[0].host, "localhost");
        assert_eq!(cs.hosts[0].port, DEFAULT_KV_PORT);
        assert!(cs.bucket.is_none());
    }

    #[test]
    fn test_parse_multi_host_bucket_options() {
        let cs = ConnectionString::parse(
            "couchbase://a:11210,b,c:9999/default?operation_timeout=2.5&tcp_nodelay=1",
        )
        .unwrap();
        assert_eq!(cs.hosts.len(), 3);
        assert_eq!(cs.hosts[1].port, DEFAULT_KV_PORT);
        assert_eq!(cs.hosts[2].port, 9999);
        assert_eq!(cs.bucket.as_deref(), Some("default"));
        assert_eq!(cs.options.len(), 2);
        assert_eq!(cs.options[0], ("operation_timeout".into(), "2.5".into()));
    }

    #[test]
    fn test_tls_scheme_ports() {
        let cs = ConnectionString::parse("couchbases://secure.example.com").unwrap();
        assert!(cs.tls);
        assert_eq!(cs.hosts[0].port, DEFAULT_KV_TLS_PORT);

        let cs = ConnectionString::parse("http://mgmt.example.com").unwrap();
        assert_eq!(cs.hosts[0].port, DEFAULT_HTTP_PORT);
    }

    #[test]
    fn test_host_transport_suffix() {
        let cs = ConnectionString::parse("couchbase://a:8091=http,b:11210=mcd").unwrap();
        assert_eq!(cs.hosts[0].transport, BootstrapTransport::HttpOnly);
        assert_eq!(cs.hosts[1].transport, BootstrapTransport::CccpOnly);
    }

    #[test]
    fn test_srv_scheme_single_host_only() {
        let cs = ConnectionString::parse("couchbase+explicit_srv://cluster.example.com").unwrap();
        assert!(cs.srv_explicit);
        assert!(ConnectionString::parse("couchbase+explicit_srv://a,b").is_err());
    }

    #[test]
    fn test_ipv6_literal() {
        let cs = ConnectionString::parse("couchbase://[::1]:12000/b").unwrap();
        assert_eq!(cs.hosts[0].host, "::1");
        assert_eq!(cs.hosts[0].port, 12000);
    }

    #[test]
    fn test_rejects() {
        assert!(ConnectionString::parse("gopher://x").is_err());
        assert!(ConnectionString::parse("no-scheme-here").is_err());
        assert!(ConnectionString::parse("couchbase://").is_err());
        assert!(ConnectionString::parse("couchbase://a:notaport").is_err());
    }

    #[test]
    fn test_roundtrip() {
        let src = "couchbases://a:11207,b:11208=mcd/travel?operation_timeout=2.5&ipv6=allow";
        let cs = ConnectionString::parse(src).unwrap();
        let reparsed = ConnectionString::parse(&cs.to_uri()).unwrap();
        assert_eq!(cs, reparsed);
    }
}
