// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP streaming provider: configs from the `/pools` REST endpoint.
//!
//! A refresh opens a streaming GET against a management node and reads
//! `\n\n\n\n`-delimited JSON documents. The first intact document answers
//! the refresh; the stream is then left open in the background, feeding
//! later documents into the monitor's inbox, until the configured stream
//! lifetime elapses. A 404 rotates between the terse and compat URL
//! styles; the preference learned this way sticks for the provider's
//! lifetime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::BytesMut;
use http::Method;
use tracing::{debug, trace, warn};

use crate::config::{ClientSettings, HostEntry, HostList, HttpUrlMode};
use crate::confmon::{ConfigInbox, Provider, ProviderKind};
use crate::error::{CouchError, Result};
use crate::http::{HttpChunk, HttpClient, HttpHandle, HttpRequest, RequestType};
use crate::topology::{ClusterConfig, ConfigOrigin, SharedConfig};

/// Documents on the stream are separated by four newlines.
const STREAM_DELIMITER: &[u8] = b"\n\n\n\n";

pub struct HttpProvider {
    nodes: Mutex<HostList>,
    cached: Mutex<Option<SharedConfig>>,
    http: HttpClient,
    settings: ClientSettings,
    inbox: ConfigInbox,
    /// Learned 404 fallback; persists across stream restarts.
    prefer_compat: AtomicBool,
    /// Keeps the background stream alive between refreshes.
    active_stream: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

fn terse_path(bucket: &str) -> String {
    format!("/pools/default/bs/{bucket}")
}

fn compat_path(bucket: &str) -> String {
    format!("/pools/default/bucketsStreaming/{bucket}")
}

/// Pull one `\n\n\n\n`-delimited document out of the buffer, if complete.
fn extract_document(buffer: &mut BytesMut) -> Option<BytesMut> {
    let pos = buffer
        .windows(STREAM_DELIMITER.len())
        .position(|w| w == STREAM_DELIMITER)?;
    let doc = buffer.split_to(pos);
    let _ = buffer.split_to(STREAM_DELIMITER.len());
    Some(doc)
}

impl HttpProvider {
    #[must_use]
    pub fn new(http: HttpClient, settings: ClientSettings, inbox: ConfigInbox) -> Arc<Self> {
        let prefer_compat = matches!(settings.http_urlmode, HttpUrlMode::Compat);
        Arc::new(Self {
            nodes: Mutex::new(HostList::new()),
            cached: Mutex::new(None),
            http,
            settings,
            inbox,
            prefer_compat: AtomicBool::new(prefer_compat),
            active_stream: Mutex::new(None),
        })
    }

    fn bucket(&self) -> String {
        self.settings
            .bucket
            .clone()
            .unwrap_or_else(|| "default".to_string())
    }

    fn path_for(&self, compat: bool) -> String {
        if compat {
            compat_path(&self.bucket())
        } else {
            terse_path(&self.bucket())
        }
    }

    fn may_flip_to(&self, compat: bool) -> bool {
        match self.settings.http_urlmode {
            HttpUrlMode::TerseThenCompat => true,
            HttpUrlMode::Terse => !compat,
            HttpUrlMode::Compat => compat,
        }
    }

    fn open_stream(&self, host: &str, port: u16, compat: bool) -> HttpHandle {
        let request = HttpRequest::new(RequestType::Raw, Method::GET, self.path_for(compat))
            .with_host(host, port)
            .streaming()
            .with_timeout(self.settings.bc_http_stream_time);
        self.http.submit(request)
    }

    /// Read the stream until the first intact document, then hand the
    /// still-open stream to a background drain task.
    async fn stream_first_doc(
        &self,
        mut handle: HttpHandle,
        host: String,
    ) -> Result<SharedConfig> {
        let mut buffer = BytesMut::new();
        let deadline = tokio::time::Instant::now() + self.settings.config_node_timeout;

        loop {
            let chunk = tokio::time::timeout_at(deadline, handle.chunks.recv())
                .await
                .map_err(|_| CouchError::Timeout)?;
            match chunk {
                Some(HttpChunk::Header { status, .. }) => {
                    if status.as_u16() == 404 {
                        return Err(CouchError::BucketNotFound(self.bucket()));
                    }
                    if !status.is_success() {
                        return Err(CouchError::Network(format!(
                            "config stream returned {status}"
                        )));
                    }
                }
                Some(HttpChunk::Row(fragment)) => {
                    buffer.extend_from_slice(&fragment);
                    if let Some(doc) = extract_document(&mut buffer) {
                        let config = Arc::new(ClusterConfig::parse(
                            &doc,
                            &host,
                            ConfigOrigin::HttpStream,
                        )?);
                        *self.cached.lock().expect("http provider lock") =
                            Some(Arc::clone(&config));
                        self.spawn_drain(handle, host, buffer);
                        return Ok(config);
                    }
                }
                Some(HttpChunk::Final(Ok(_))) | None => {
                    return Err(CouchError::Network(
                        "config stream ended without a document".into(),
                    ));
                }
                Some(HttpChunk::Final(Err(err))) => return Err(err),
            }
        }
    }

    /// Keep consuming the stream; later documents go through the inbox.
    fn spawn_drain(&self, mut handle: HttpHandle, host: String, mut buffer: BytesMut) {
        let inbox = self.inbox.clone();
        let drain = tokio::spawn(async move {
            while let Some(chunk) = handle.chunks.recv().await {
                match chunk {
                    HttpChunk::Row(fragment) => {
                        buffer.extend_from_slice(&fragment);
                        while let Some(doc) = extract_document(&mut buffer) {
                            trace!("streaming config update");
                            let _ = inbox.send((
                                doc.freeze(),
                                host.clone(),
                                ConfigOrigin::HttpStream,
                            ));
                        }
                    }
                    HttpChunk::Final(_) => break,
                    HttpChunk::Header { .. } => {}
                }
            }
            debug!("config stream closed");
        });

        let mut active = self.active_stream.lock().expect("http provider lock");
        if let Some(previous) = active.replace(drain) {
            previous.abort();
        }
    }
}

#[async_trait]
impl Provider for HttpProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Http
    }

    async fn refresh(&self) -> Result<SharedConfig> {
        let entry = {
            let mut nodes = self.nodes.lock().expect("http provider lock");
            nodes.next_host().cloned()
        }
        .ok_or(CouchError::NoMatchingServer)?;

        let mut compat = self.prefer_compat.load(Ordering::Acquire);
        let mut flipped = false;

        loop {
            let handle = self.open_stream(&entry.host, entry.port, compat);
            match self.stream_first_doc(handle, entry.host.clone()).await {
                Ok(config) => {
                    self.prefer_compat.store(compat, Ordering::Release);
                    return Ok(config);
                }
                Err(CouchError::BucketNotFound(bucket)) => {
                    if !flipped && self.may_flip_to(!compat) {
                        warn!(
                            compat,
                            "got 404 on config stream, rotating URL style"
                        );
                        compat = !compat;
                        flipped = true;
                        continue;
                    }
                    return Err(CouchError::BucketNotFound(bucket));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn get_cached(&self) -> Option<SharedConfig> {
        self.cached.lock().expect("http provider lock").clone()
    }

    async fn pause(&self) {
        if let Some(stream) = self
            .active_stream
            .lock()
            .expect("http provider lock")
            .take()
        {
            stream.abort();
        }
    }

    fn config_updated(&self, config: &SharedConfig) {
        let tls = self.settings.ssl_enabled;
        let entries: Vec<HostEntry> = config
            .nodes
            .iter()
            .filter_map(|n| n.service_address(crate::topology::ServiceType::Mgmt, tls))
            .map(|(host, port)| HostEntry::new(host, port))
            .collect();
        if !entries.is_empty() {
            self.nodes.lock().expect("http provider lock").assign(entries);
        }
        *self.cached.lock().expect("http provider lock") = Some(Arc::clone(config));
    }

    fn configure_nodes(&self, nodes: &[HostEntry]) {
        self.nodes
            .lock()
            .expect("http provider lock")
            .assign(nodes.iter().cloned());
    }

    fn get_nodes(&self) -> Vec<HostEntry> {
        self.nodes
            .lock()
            .expect("http provider lock")
            .as_slice()
            .to_vec()
    }

    async fn shutdown(&self) {
        self.pause().await;
    }

    fn dump(&self, out: &mut String) {
        out.push_str(&format!(
            "http: nodes={} compat={} cached={}\n",
            self.nodes.lock().expect("http provider lock").len(),
            self.prefer_compat.load(Ordering::Relaxed),
            self.cached.lock().expect("http provider lock").is_some()
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::pool::{Connector, PoolOptions, SocketPool};
    use crate::dispatch::vbguess::VbGuess;
    use crate::dispatch::CommandQueue;
    use crate::topology::test_fixtures;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn provider(port: u16) -> (Arc<HttpProvider>, mpsc::UnboundedReceiver<(bytes::Bytes, String, ConfigOrigin)>) {
        let mut settings = ClientSettings::default();
        settings.bucket = Some("default".into());
        settings.config_node_timeout = std::time::Duration::from_secs(2);
        let connector = Arc::new(Connector::from_settings(&settings).unwrap());
        let pool = Arc::new(SocketPool::new(connector, PoolOptions::default()));
        let cmdq = Arc::new(CommandQueue::new(Arc::new(VbGuess::new())));
        let http = HttpClient::new(pool, cmdq, settings.clone(), false);
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let p = HttpProvider::new(http, settings, inbox_tx);
        p.configure_nodes(&[HostEntry::new("127.0.0.1", port)]);
        (p, inbox_rx)
    }

    async fn chunked_stream_server(docs: Vec<String>, not_found_first: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut first = true;
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    return;
                };
                let docs = docs.clone();
                let send_404 = not_found_first && first;
                first = false;
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = sock.read(&mut buf).await;
                    if send_404 {
                        let _ = sock
                            .write_all(
                                b"HTTP/1.1 404 Object Not Found\r\nContent-Length: 0\r\n\r\n",
                            )
                            .await;
                        return;
                    }
                    let _ = sock
                        .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                        .await;
                    for doc in docs {
                        let payload = format!("{doc}\n\n\n\n");
                        let chunk =
                            format!("{:x}\r\n{payload}\r\n", payload.len());
                        let _ = sock.write_all(chunk.as_bytes()).await;
                    }
                    // Hold the stream open like a real server.
                    tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                });
            }
        });
        port
    }

    #[test]
    fn test_extract_document() {
        let mut buf = BytesMut::from(&b"{\"rev\":1}\n\n\n\n{\"rev\":2}\n\n"[..]);
        let doc = extract_document(&mut buf).unwrap();
        assert_eq!(&doc[..], b"{\"rev\":1}");
        // Second document incomplete.
        assert!(extract_document(&mut buf).is_none());
        buf.extend_from_slice(b"\n\n");
        let doc = extract_document(&mut buf).unwrap();
        assert_eq!(&doc[..], b"{\"rev\":2}");
    }

    #[tokio::test]
    async fn test_refresh_reads_first_document() {
        let port =
            chunked_stream_server(vec![test_fixtures::two_node_config(7)], false).await;
        let (provider, _inbox) = provider(port);

        let config = provider.refresh().await.unwrap();
        assert_eq!(config.rev, Some(7));
        assert!(provider.get_cached().is_some());
        provider.pause().await;
    }

    #[tokio::test]
    async fn test_later_documents_flow_to_inbox() {
        let port = chunked_stream_server(
            vec![
                test_fixtures::two_node_config(1),
                test_fixtures::two_node_config(2),
            ],
            false,
        )
        .await;
        let (provider, mut inbox) = provider(port);

        let config = provider.refresh().await.unwrap();
        assert_eq!(config.rev, Some(1));

        let (raw, _host, origin) = inbox.recv().await.unwrap();
        assert_eq!(origin, ConfigOrigin::HttpStream);
        assert!(raw.windows(8).any(|w| w == b"\"rev\": 2"));
        provider.pause().await;
    }

    #[tokio::test]
    async fn test_404_rotates_url_style() {
        let port =
            chunked_stream_server(vec![test_fixtures::two_node_config(3)], true).await;
        let (provider, _inbox) = provider(port);

        let config = provider.refresh().await.unwrap();
        assert_eq!(config.rev, Some(3));
        // The compat preference persisted.
        assert!(provider.prefer_compat.load(Ordering::Relaxed));
        provider.pause().await;
    }

    #[tokio::test]
    async fn test_no_nodes_errors() {
        let (provider, _inbox) = {
            let mut settings = ClientSettings::default();
            settings.bucket = Some("default".into());
            let connector = Arc::new(Connector::from_settings(&settings).unwrap());
            let pool = Arc::new(SocketPool::new(connector, PoolOptions::default()));
            let cmdq = Arc::new(CommandQueue::new(Arc::new(VbGuess::new())));
            let http = HttpClient::new(pool, cmdq, settings.clone(), false);
            let (tx, rx) = mpsc::unbounded_channel();
            (HttpProvider::new(http, settings, tx), rx)
        };
        assert_eq!(
            provider.refresh().await.unwrap_err(),
            CouchError::NoMatchingServer
        );
    }
}
