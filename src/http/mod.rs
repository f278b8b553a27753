// SPDX-License-Identifier: MIT OR Apache-2.0

//! Streaming HTTP/1.1 sub-client for view, query, search, analytics,
//! eventing, and management traffic.
//!
//! Each request picks a service-capable node from the current config at
//! random, excluding nodes already tried for this request; the exclusion
//! set is invalidated when the config revision changes. Responses are
//! parsed incrementally ([`parser`]); callers either accumulate the body
//! or consume a chunk stream. Exactly one [`HttpChunk::Final`] is
//! delivered per request, whatever happens.

pub mod parser;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use base64::prelude::*;
use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode};
use rand::seq::IteratorRandom;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::client::pool::SocketPool;
use crate::config::ClientSettings;
use crate::dispatch::CommandQueue;
use crate::error::{CouchError, Result};
use crate::topology::ServiceType;
use parser::{ParseEvent, ResponseParser};

/// Classifies a request for node selection and timeout defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    View,
    Query,
    Search,
    Analytics,
    Eventing,
    Management,
    /// Caller supplies the exact host and port.
    Raw,
}

impl RequestType {
    fn service(self) -> Option<ServiceType> {
        match self {
            RequestType::View => Some(ServiceType::Views),
            RequestType::Query => Some(ServiceType::Query),
            RequestType::Search => Some(ServiceType::Search),
            RequestType::Analytics => Some(ServiceType::Analytics),
            RequestType::Eventing => Some(ServiceType::Eventing),
            RequestType::Management => Some(ServiceType::Mgmt),
            RequestType::Raw => None,
        }
    }

    fn default_timeout(self, settings: &ClientSettings) -> Duration {
        match self {
            RequestType::View => settings.views_timeout,
            RequestType::Query => settings.query_timeout,
            RequestType::Search => settings.search_timeout,
            RequestType::Analytics => settings.analytics_timeout,
            RequestType::Eventing | RequestType::Management | RequestType::Raw => {
                settings.http_timeout
            }
        }
    }
}

/// One HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub req_type: RequestType,
    pub method: Method,
    pub path: String,
    pub body: Bytes,
    pub content_type: Option<String>,
    /// Credential override; `None` falls back to the settings bag.
    pub username: Option<String>,
    pub password: Option<String>,
    /// Suppress credentials entirely.
    pub no_credentials: bool,
    /// Deliver body fragments as they decode instead of accumulating.
    pub streaming: bool,
    /// Per-request timeout override.
    pub timeout: Option<Duration>,
    /// Target for `RequestType::Raw`.
    pub host: Option<(String, u16)>,
}

impl HttpRequest {
    #[must_use]
    pub fn new(req_type: RequestType, method: Method, path: impl Into<String>) -> Self {
        Self {
            req_type,
            method,
            path: path.into(),
            body: Bytes::new(),
            content_type: None,
            username: None,
            password: None,
            no_credentials: false,
            streaming: false,
            timeout: None,
            host: None,
        }
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>, content_type: impl Into<String>) -> Self {
        self.body = body.into();
        self.content_type = Some(content_type.into());
        self
    }

    #[must_use]
    pub fn with_credentials(mut self, user: impl Into<String>, pass: impl Into<String>) -> Self {
        self.username = Some(user.into());
        self.password = Some(pass.into());
        self
    }

    #[must_use]
    pub fn without_credentials(mut self) -> Self {
        self.no_credentials = true;
        self
    }

    #[must_use]
    pub fn streaming(mut self) -> Self {
        self.streaming = true;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.host = Some((host.into(), port));
        self
    }
}

/// Stream items delivered to the consumer.
#[derive(Debug)]
pub enum HttpChunk {
    /// Headers complete.
    Header { status: StatusCode, headers: HeaderMap },
    /// One decoded body fragment (streaming requests only).
    Row(Bytes),
    /// Terminal event; exactly one per request.
    Final(Result<HttpResponse>),
}

/// Accumulated response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Handle to an in-flight streaming request.
#[derive(Debug)]
pub struct HttpHandle {
    pub chunks: mpsc::UnboundedReceiver<HttpChunk>,
    cancel: Option<oneshot::Sender<()>>,
}

impl HttpHandle {
    /// Cancel the request. The stream still delivers its final event
    /// (`RequestCanceled`) and nothing after it.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

/// The sub-client. Cheap to clone.
#[derive(Clone)]
pub struct HttpClient {
    pool: Arc<SocketPool>,
    cmdq: Arc<CommandQueue>,
    settings: ClientSettings,
    tls: bool,
}

impl HttpClient {
    #[must_use]
    pub fn new(
        pool: Arc<SocketPool>,
        cmdq: Arc<CommandQueue>,
        settings: ClientSettings,
        tls: bool,
    ) -> Self {
        Self {
            pool,
            cmdq,
            settings,
            tls,
        }
    }

    /// Run a request to completion, accumulating the body.
    pub async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut handle = self.submit(request);
        loop {
            match handle.chunks.recv().await {
                Some(HttpChunk::Final(result)) => return result,
                Some(_) => continue,
                None => return Err(CouchError::Internal("http stream dropped".into())),
            }
        }
    }

    /// Submit a request; the caller consumes the chunk stream.
    #[must_use]
    pub fn submit(&self, request: HttpRequest) -> HttpHandle {
        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let client = self.clone();
        tokio::spawn(async move {
            client.drive(request, chunk_tx, cancel_rx).await;
        });
        HttpHandle {
            chunks: chunk_rx,
            cancel: Some(cancel_tx),
        }
    }

    async fn drive(
        self,
        request: HttpRequest,
        chunk_tx: mpsc::UnboundedSender<HttpChunk>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let timeout = request
            .timeout
            .unwrap_or_else(|| request.req_type.default_timeout(&self.settings));

        let work = self.run_with_retries(&request, &chunk_tx);
        let result = tokio::select! {
            res = work => res,
            _ = &mut cancel_rx => Err(CouchError::RequestCanceled),
            () = tokio::time::sleep(timeout) => Err(CouchError::Timeout),
        };
        // Exactly one FINAL, whatever path got us here.
        let _ = chunk_tx.send(HttpChunk::Final(result));
    }

    async fn run_with_retries(
        &self,
        request: &HttpRequest,
        chunk_tx: &mpsc::UnboundedSender<HttpChunk>,
    ) -> Result<HttpResponse> {
        let mut used_nodes: HashSet<usize> = HashSet::new();
        let mut used_rev = self.config_rev();
        let mut redirects = 0i32;
        let mut target_override: Option<(String, u16)> = None;

        loop {
            // used_nodes is only meaningful against the config it was
            // built from.
            let rev = self.config_rev();
            if rev != used_rev {
                used_nodes.clear();
                used_rev = rev;
            }

            let (node_index, host, port) = match &target_override {
                Some((h, p)) => (None, h.clone(), *p),
                None => {
                    let (idx, h, p) = self.pick_node(request, &used_nodes)?;
                    (idx, h, p)
                }
            };

            match self
                .attempt(request, &host, port, chunk_tx)
                .await
            {
                Ok(AttemptOutcome::Complete(response)) => return Ok(response),
                Ok(AttemptOutcome::Redirect(location)) => {
                    redirects += 1;
                    let max = self.settings.max_redirects;
                    if max >= 0 && redirects > max {
                        return Err(CouchError::TooManyRedirects(max));
                    }
                    let url = url::Url::parse(&location).map_err(|e| {
                        CouchError::Protocol(format!("bad redirect location: {e}"))
                    })?;
                    let new_host = url
                        .host_str()
                        .ok_or_else(|| {
                            CouchError::Protocol("redirect location has no host".into())
                        })?
                        .to_string();
                    let new_port = url.port_or_known_default().unwrap_or(port);
                    debug!(%location, "following redirect");
                    target_override = Some((new_host, new_port));
                }
                Err(err) if err.kind() == crate::error::ErrorKind::Network => {
                    // Try another service node if the config offers one.
                    if let Some(idx) = node_index {
                        used_nodes.insert(idx);
                        warn!(%host, port, %err, "service node failed, excluding");
                        target_override = None;
                        if self.has_untried_node(request, &used_nodes) {
                            continue;
                        }
                    }
                    return Err(err);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn config_rev(&self) -> u64 {
        self.cmdq
            .current_config()
            .map_or(0, |c| c.compare_clock)
    }

    fn pick_node(
        &self,
        request: &HttpRequest,
        used: &HashSet<usize>,
    ) -> Result<(Option<usize>, String, u16)> {
        if let Some((host, port)) = &request.host {
            return Ok((None, host.clone(), *port));
        }
        let service = request.req_type.service().ok_or_else(|| {
            CouchError::InvalidArgument("raw request without a host".into())
        })?;
        let config = self
            .cmdq
            .current_config()
            .ok_or(CouchError::NoMatchingServer)?;
        let candidates = config.service_nodes(service, self.tls);
        let pick = candidates
            .iter()
            .filter(|(idx, _, _)| !used.contains(idx))
            .choose(&mut rand::rng())
            .cloned();
        match pick {
            Some((idx, host, port)) => Ok((Some(idx), host, port)),
            None => Err(CouchError::NoMatchingServer),
        }
    }

    fn has_untried_node(&self, request: &HttpRequest, used: &HashSet<usize>) -> bool {
        let Some(service) = request.req_type.service() else {
            return false;
        };
        let Some(config) = self.cmdq.current_config() else {
            return false;
        };
        config
            .service_nodes(service, self.tls)
            .iter()
            .any(|(idx, _, _)| !used.contains(idx))
    }

    fn preamble(&self, request: &HttpRequest, host: &str, port: u16) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(256 + request.body.len());
        out.extend_from_slice(
            format!("{} {} HTTP/1.1\r\n", request.method, request.path).as_bytes(),
        );
        out.extend_from_slice(format!("Host: {host}:{port}\r\n").as_bytes());
        out.extend_from_slice(b"Accept: */*\r\n");
        if let Some(ct) = &request.content_type {
            out.extend_from_slice(format!("Content-Type: {ct}\r\n").as_bytes());
        }
        if !request.body.is_empty() {
            out.extend_from_slice(
                format!("Content-Length: {}\r\n", request.body.len()).as_bytes(),
            );
        }
        if !request.no_credentials {
            let user = request
                .username
                .clone()
                .or_else(|| self.settings.username.clone());
            let pass = request
                .password
                .clone()
                .or_else(|| self.settings.password.clone());
            if let (Some(user), Some(pass)) = (user, pass) {
                let token = BASE64_STANDARD.encode(format!("{user}:{pass}"));
                out.extend_from_slice(format!("Authorization: Basic {token}\r\n").as_bytes());
            }
        }
        out.extend_from_slice(b"\r\n");
        out.extend_from_slice(&request.body);
        out.to_vec()
    }

    async fn attempt(
        &self,
        request: &HttpRequest,
        host: &str,
        port: u16,
        chunk_tx: &mpsc::UnboundedSender<HttpChunk>,
    ) -> Result<AttemptOutcome> {
        let mut sock = self.pool.acquire(host, port).await?;
        let preamble = self.preamble(request, host, port);
        trace!(%host, port, bytes = preamble.len(), "sending http request");
        sock.conn
            .write_all(&preamble)
            .await
            .map_err(|e| CouchError::Network(format!("http write: {e}")))?;
        sock.conn
            .flush()
            .await
            .map_err(|e| CouchError::Network(format!("http flush: {e}")))?;

        let head = request.method == Method::HEAD;
        let mut response_parser = ResponseParser::new(head);
        let mut accumulated = BytesMut::new();
        let mut header_sent = false;
        let mut read_buf = [0u8; 8 * 1024];

        loop {
            let n = sock
                .conn
                .read(&mut read_buf)
                .await
                .map_err(|e| CouchError::Network(format!("http read: {e}")))?;

            let events = if n == 0 {
                vec![response_parser.finish()?]
            } else {
                response_parser.push(&read_buf[..n])?
            };

            for event in events {
                match event {
                    ParseEvent::Header => {
                        let status = response_parser.status();
                        if status.is_redirection() {
                            // Swallow the redirect body; caller recomposes.
                            continue;
                        }
                        header_sent = true;
                        let _ = chunk_tx.send(HttpChunk::Header {
                            status,
                            headers: response_parser.headers().clone(),
                        });
                    }
                    ParseEvent::Body(fragment) => {
                        if response_parser.status().is_redirection() {
                            continue;
                        }
                        if request.streaming {
                            let _ = chunk_tx.send(HttpChunk::Row(fragment));
                        } else {
                            accumulated.extend_from_slice(&fragment);
                        }
                    }
                    ParseEvent::Done { keep_alive } => {
                        let status = response_parser.status();
                        if status.is_redirection() {
                            let location = response_parser
                                .headers()
                                .get(http::header::LOCATION)
                                .and_then(|v| v.to_str().ok())
                                .map(ToString::to_string)
                                .ok_or_else(|| {
                                    CouchError::Protocol(
                                        "redirect without Location header".into(),
                                    )
                                })?;
                            self.pool.release(sock, keep_alive);
                            return Ok(AttemptOutcome::Redirect(location));
                        }
                        debug_assert!(header_sent || !request.streaming);
                        self.pool.release(sock, keep_alive);
                        return Ok(AttemptOutcome::Complete(HttpResponse {
                            status,
                            headers: response_parser.headers().clone(),
                            body: accumulated.freeze(),
                        }));
                    }
                }
            }
        }
    }
}

enum AttemptOutcome {
    Complete(HttpResponse),
    Redirect(String),
}
