// SPDX-License-Identifier: MIT OR Apache-2.0

//! Socket pooling and connection establishment.
//!
//! This module provides:
//! - [`Connector`]: plain-TCP or rustls-TLS dialing per the `ssl_*` settings
//! - [`SocketPool`]: idle sockets keyed by `(host, port)` with `maxidle` /
//!   `tmoidle` semantics
//! - [`SessionInfo`]: the negotiated state that travels with a pooled
//!   socket so reuse skips renegotiation
//!
//! A socket released with `reusable = false` is discarded, never handed
//! out again. Idle sockets past their idle timeout are discarded lazily on
//! the next acquire.

use std::collections::{HashMap, HashSet, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, trace, warn};

use crate::config::ClientSettings;
use crate::error::{CouchError, Result};
use crate::protocol::{ErrorMap, HelloFeature};

/// Negotiated per-connection state, preserved across pool reuse.
#[derive(Debug, Clone, Default)]
pub struct SessionInfo {
    /// SASL mechanism that authenticated this connection.
    pub mechanism: String,
    /// Features the server agreed to in HELLO.
    pub features: HashSet<HelloFeature>,
    /// Bucket selected on this connection, if any.
    pub bucket: Option<String>,
    /// Error map fetched during negotiation.
    pub error_map: Option<Arc<ErrorMap>>,
}

impl SessionInfo {
    #[must_use]
    pub fn has_feature(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }
}

/// A plain or TLS stream behind one type so the pipeline and the HTTP
/// client do not care which they got.
pub enum Connection {
    Plain(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Plain(_) => f.write_str("Connection::Plain"),
            Connection::Tls(_) => f.write_str("Connection::Tls"),
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_flush(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[std::io::IoSlice<'_>],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Connection::Plain(s) => Pin::new(s).poll_write_vectored(cx, bufs),
            Connection::Tls(s) => Pin::new(s.as_mut()).poll_write_vectored(cx, bufs),
        }
    }

    fn is_write_vectored(&self) -> bool {
        match self {
            Connection::Plain(s) => s.is_write_vectored(),
            Connection::Tls(s) => s.is_write_vectored(),
        }
    }
}

/// Dials plain or TLS connections according to the settings bag.
pub struct Connector {
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
    tcp_nodelay: bool,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("tls", &self.tls.is_some())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

fn load_pem_certs(pem: &[u8]) -> Result<Vec<rustls::pki_types::CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| CouchError::InvalidArgument(format!("Failed to parse PEM certs: {e}")))
}

fn load_pem_key(pem: &[u8]) -> Result<rustls::pki_types::PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &pem[..])
        .map_err(|e| CouchError::InvalidArgument(format!("Failed to parse PEM key: {e}")))?
        .ok_or_else(|| CouchError::InvalidArgument("No private key found in PEM".into()))
}

impl Connector {
    /// Build from the TLS-relevant settings. When `ssl_enabled` is off the
    /// connector only ever dials plain TCP.
    pub fn from_settings(settings: &ClientSettings) -> Result<Self> {
        let tls = if settings.ssl_enabled {
            let _ = rustls::crypto::ring::default_provider().install_default();

            let root_store = if let Some(ca_path) = &settings.ssl_cacert {
                let ca_pem = std::fs::read(ca_path).map_err(|e| {
                    CouchError::InvalidArgument(format!("Failed to read CA cert: {e}"))
                })?;
                let mut root_store = rustls::RootCertStore::empty();
                for cert in load_pem_certs(&ca_pem)? {
                    root_store.add(cert).map_err(|e| {
                        CouchError::InvalidArgument(format!("Failed to add CA cert: {e}"))
                    })?;
                }
                root_store
            } else {
                let mut root_store = rustls::RootCertStore::empty();
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                root_store
            };

            let mut tls_config = if let (Some(cert_path), Some(key_path)) =
                (&settings.ssl_cert, &settings.ssl_key)
            {
                let cert_pem = std::fs::read(cert_path).map_err(|e| {
                    CouchError::InvalidArgument(format!("Failed to read client cert: {e}"))
                })?;
                let key_pem = std::fs::read(key_path).map_err(|e| {
                    CouchError::InvalidArgument(format!("Failed to read client key: {e}"))
                })?;
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_client_auth_cert(load_pem_certs(&cert_pem)?, load_pem_key(&key_pem)?)
                    .map_err(|e| {
                        CouchError::InvalidArgument(format!(
                            "Failed to configure client auth: {e}"
                        ))
                    })?
            } else {
                rustls::ClientConfig::builder()
                    .with_root_certificates(root_store)
                    .with_no_client_auth()
            };

            if settings.ssl_no_verify {
                tls_config
                    .dangerous()
                    .set_certificate_verifier(Arc::new(NoVerifier));
            }

            Some(TlsConnector::from(Arc::new(tls_config)))
        } else {
            None
        };

        Ok(Self {
            tls,
            connect_timeout: settings.config_node_timeout,
            tcp_nodelay: settings.tcp_nodelay,
        })
    }

    pub async fn connect(&self, host: &str, port: u16) -> Result<Connection> {
        let addr = format!("{host}:{port}");
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| CouchError::ConnectError(format!("connect to {addr} timed out")))?
            .map_err(|e| CouchError::ConnectError(format!("{addr}: {e}")))?;
        if self.tcp_nodelay {
            let _ = stream.set_nodelay(true);
        }

        match &self.tls {
            None => Ok(Connection::Plain(stream)),
            Some(connector) => {
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|e| CouchError::InvalidArgument(format!("bad SNI host: {e}")))?;
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| CouchError::ConnectError(format!("TLS to {addr}: {e}")))?;
                Ok(Connection::Tls(Box::new(tls)))
            }
        }
    }
}

#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Pool tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    /// Idle sockets retained per `(host, port)` key.
    pub maxidle: usize,
    /// How long an idle socket stays eligible for reuse.
    pub tmoidle: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            maxidle: 10,
            tmoidle: Duration::from_secs(10),
        }
    }
}

/// A socket checked out of the pool.
#[derive(Debug)]
pub struct PooledSocket {
    pub conn: Connection,
    pub session: Option<SessionInfo>,
    key: (String, u16),
    /// Whether the socket came from the idle list rather than a fresh dial.
    pub reused: bool,
}

impl PooledSocket {
    #[must_use]
    pub fn key(&self) -> &(String, u16) {
        &self.key
    }
}

struct IdleSocket {
    conn: Connection,
    session: Option<SessionInfo>,
    released_at: Instant,
}

/// Socket pool keyed by `(host, port)`.
pub struct SocketPool {
    connector: Arc<Connector>,
    options: Mutex<PoolOptions>,
    idle: Mutex<HashMap<(String, u16), VecDeque<IdleSocket>>>,
    shutdown: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for SocketPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketPool")
            .field("options", &*self.options.lock().expect("pool lock"))
            .finish()
    }
}

impl SocketPool {
    #[must_use]
    pub fn new(connector: Arc<Connector>, options: PoolOptions) -> Self {
        Self {
            connector,
            options: Mutex::new(options),
            idle: Mutex::new(HashMap::new()),
            shutdown: std::sync::atomic::AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<Connector> {
        &self.connector
    }

    pub fn set_options(&self, options: PoolOptions) {
        *self.options.lock().expect("pool lock") = options;
    }

    #[must_use]
    pub fn options(&self) -> PoolOptions {
        *self.options.lock().expect("pool lock")
    }

    /// Take an idle socket for the key or dial a new one.
    pub async fn acquire(&self, host: &str, port: u16) -> Result<PooledSocket> {
        if self.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return Err(CouchError::ShuttingDown);
        }
        let key = (host.to_string(), port);
        let tmoidle = self.options().tmoidle;

        if let Some(idle) = self.pop_idle(&key, tmoidle) {
            trace!(host, port, "reusing pooled socket");
            return Ok(PooledSocket {
                conn: idle.conn,
                session: idle.session,
                key,
                reused: true,
            });
        }

        debug!(host, port, "dialing new socket");
        let conn = self.connector.connect(host, port).await?;
        Ok(PooledSocket {
            conn,
            session: None,
            key,
            reused: false,
        })
    }

    fn pop_idle(&self, key: &(String, u16), tmoidle: Duration) -> Option<IdleSocket> {
        let mut idle = self.idle.lock().expect("pool lock");
        let queue = idle.get_mut(key)?;
        while let Some(sock) = queue.pop_front() {
            if sock.released_at.elapsed() <= tmoidle {
                return Some(sock);
            }
            trace!(?key, "discarding idle socket past tmoidle");
        }
        None
    }

    /// Return a socket. `reusable = false` (or a shut-down pool, or a full
    /// idle list) discards it.
    pub fn release(&self, sock: PooledSocket, reusable: bool) {
        if !reusable || self.shutdown.load(std::sync::atomic::Ordering::Acquire) {
            return;
        }
        let maxidle = self.options().maxidle;
        let mut idle = self.idle.lock().expect("pool lock");
        let queue = idle.entry(sock.key).or_default();
        if queue.len() >= maxidle {
            warn!("idle list full, discarding released socket");
            return;
        }
        queue.push_back(IdleSocket {
            conn: sock.conn,
            session: sock.session,
            released_at: Instant::now(),
        });
    }

    /// Drop every idle socket and refuse further acquires.
    pub fn shutdown(&self) {
        self.shutdown
            .store(true, std::sync::atomic::Ordering::Release);
        self.idle.lock().expect("pool lock").clear();
    }

    #[must_use]
    pub fn idle_count(&self, host: &str, port: u16) -> usize {
        self.idle
            .lock()
            .expect("pool lock")
            .get(&(host.to_string(), port))
            .map_or(0, VecDeque::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn listener() -> (TcpListener, u16) {
        let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = l.local_addr().unwrap().port();
        (l, port)
    }

    fn plain_pool() -> SocketPool {
        let settings = ClientSettings::default();
        let connector = Arc::new(Connector::from_settings(&settings).unwrap());
        SocketPool::new(connector, PoolOptions::default())
    }

    #[tokio::test]
    async fn test_acquire_dials_fresh() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        let pool = plain_pool();
        let sock = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(!sock.reused);
        assert!(sock.session.is_none());
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((s, _)) = listener.accept().await else {
                    break;
                };
                // Hold sockets open.
                tokio::spawn(async move {
                    let _s = s;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let pool = plain_pool();
        let mut sock = pool.acquire("127.0.0.1", port).await.unwrap();
        sock.session = Some(SessionInfo {
            mechanism: "SCRAM-SHA256".into(),
            ..SessionInfo::default()
        });
        pool.release(sock, true);
        assert_eq!(pool.idle_count("127.0.0.1", port), 1);

        let again = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(again.reused);
        // Negotiated state survived pooling.
        assert_eq!(again.session.as_ref().unwrap().mechanism, "SCRAM-SHA256");
    }

    #[tokio::test]
    async fn test_discard_is_not_reused() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((s, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _s = s;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let pool = plain_pool();
        let sock = pool.acquire("127.0.0.1", port).await.unwrap();
        pool.release(sock, false);
        assert_eq!(pool.idle_count("127.0.0.1", port), 0);

        let again = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(!again.reused);
    }

    #[tokio::test]
    async fn test_idle_timeout_discards() {
        let (listener, port) = listener().await;
        tokio::spawn(async move {
            loop {
                let Ok((s, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _s = s;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                });
            }
        });

        let settings = ClientSettings::default();
        let connector = Arc::new(Connector::from_settings(&settings).unwrap());
        let pool = SocketPool::new(
            connector,
            PoolOptions {
                maxidle: 4,
                tmoidle: Duration::from_millis(10),
            },
        );

        let sock = pool.acquire("127.0.0.1", port).await.unwrap();
        pool.release(sock, true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let again = pool.acquire("127.0.0.1", port).await.unwrap();
        assert!(!again.reused, "expired idle socket must not be reused");
    }

    #[tokio::test]
    async fn test_shutdown_refuses_acquire() {
        let pool = plain_pool();
        pool.shutdown();
        let err = pool.acquire("127.0.0.1", 1).await.unwrap_err();
        assert_eq!(err, CouchError::ShuttingDown);
    }
}
