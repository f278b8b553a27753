// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-node command pipeline and server connection.
//!
//! Each cluster node gets one [`Pipeline`]: a handle to a task that owns
//! the socket, the in-flight packet log, the pending output queue, and the
//! session state. The task's life cycle follows the CLEAN → ERRDRAIN →
//! CLOSED state machine: a healthy connection flushes and reads; any
//! socket, negotiation, or timeout failure fails the chain (completing or
//! re-queueing every logged packet) and drops the connection; a close is
//! terminal.
//!
//! - [`log`] — the opaque-keyed FIFO of in-flight requests
//! - [`negotiate`] — the pre-traffic session dialog
//! - [`sasl`] — SASL mechanism selection and exchanges

pub mod log;
pub mod negotiate;
pub mod sasl;

use std::collections::HashMap;
use std::io::IoSlice;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::client::pool::{Connection, PooledSocket, SessionInfo, SocketPool};
use crate::config::ClientSettings;
use crate::dispatch::op::{KvResponse, PendingOp};
use crate::dispatch::vbguess::VbGuess;
use crate::error::{CouchError, Result};
use crate::protocol::{
    HelloFeature, Opcode, ResponseHeader, Status, HEADER_LEN, MAX_IOV,
};
use crate::runtime::retry::{admit, RetryReason, RetryRequest, RetrySink};
use log::PacketLog;

/// Pipeline → instance notifications.
#[derive(Debug)]
pub enum PipelineEvent {
    /// A NOT_MY_VBUCKET response carried a config document.
    ConfigFromNmv {
        raw: Bytes,
        origin_host: String,
    },
    /// The connection failed; a config refresh is warranted.
    SocketError {
        index: usize,
        error: CouchError,
    },
}

/// Messages accepted by the pipeline task.
#[derive(Debug)]
pub enum PipelineMsg {
    Dispatch(PendingOp),
    /// Associate a bucket post-connect; issues SELECT_BUCKET if the
    /// connection is already negotiated without one.
    SetBucket(String),
    /// The node left the topology: in-flight packets are requeued as
    /// topology casualties rather than failed outright.
    Retire,
    Close,
}

/// Connection state per the server state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Clean,
    ErrDrain,
    Closed,
}

/// Shared dependencies handed to every pipeline.
#[derive(Clone)]
pub struct PipelineContext {
    pub settings: ClientSettings,
    pub pool: Arc<SocketPool>,
    pub retry_tx: RetrySink,
    pub events_tx: mpsc::UnboundedSender<PipelineEvent>,
    pub vbguess: Arc<VbGuess>,
    /// Instance-wide opaque counter; assignment happens at encode time so
    /// each pipeline log sees strictly increasing opaques.
    pub opaque_counter: Arc<AtomicU32>,
    pub bucket: Option<String>,
    pub is_tls: bool,
}

/// Handle to one per-node pipeline.
#[derive(Debug, Clone)]
pub struct Pipeline {
    index: usize,
    host: String,
    port: u16,
    tx: mpsc::UnboundedSender<PipelineMsg>,
}

impl Pipeline {
    /// Spawn the server task for a node.
    #[must_use]
    pub fn spawn(index: usize, host: String, port: u16, ctx: PipelineContext) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let server = ServerIo::new(index, host.clone(), port, ctx, rx);
        tokio::spawn(server.run());
        Self {
            index,
            host,
            port,
            tx,
        }
    }

    #[must_use]
    pub fn index(&self) -> usize {
        self.index
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Hand an op to this pipeline. On a closed pipeline the op fails with
    /// `ShuttingDown`.
    pub fn dispatch(&self, op: PendingOp) {
        if let Err(mpsc::error::SendError(PipelineMsg::Dispatch(op))) =
            self.tx.send(PipelineMsg::Dispatch(op))
        {
            op.fail(CouchError::ShuttingDown);
        }
    }

    pub fn set_bucket(&self, bucket: String) {
        let _ = self.tx.send(PipelineMsg::SetBucket(bucket));
    }

    /// The node vanished from the topology; in-flight work is requeued.
    pub fn retire(&self) {
        let _ = self.tx.send(PipelineMsg::Retire);
    }

    /// Request a terminal close. Idempotent.
    pub fn close(&self) {
        let _ = self.tx.send(PipelineMsg::Close);
    }
}

struct ServerIo {
    index: usize,
    host: String,
    port: u16,
    ctx: PipelineContext,
    rx: mpsc::UnboundedReceiver<PipelineMsg>,

    state: ServerState,
    log: PacketLog,
    outq: std::collections::VecDeque<Bytes>,
    out_offset: usize,
    rope: BytesMut,
    session: Option<SessionInfo>,
    /// Accumulated rows for in-flight STAT requests.
    stat_rows: HashMap<u32, serde_json::Map<String, serde_json::Value>>,
    conn_seq: u64,
}

impl ServerIo {
    fn new(
        index: usize,
        host: String,
        port: u16,
        ctx: PipelineContext,
        rx: mpsc::UnboundedReceiver<PipelineMsg>,
    ) -> Self {
        Self {
            index,
            host,
            port,
            ctx,
            rx,
            state: ServerState::Clean,
            log: PacketLog::new(),
            outq: std::collections::VecDeque::new(),
            out_offset: 0,
            rope: BytesMut::with_capacity(16 * 1024),
            session: None,
            stat_rows: HashMap::new(),
            conn_seq: 0,
        }
    }

    async fn run(mut self) {
        let mut backlog: Vec<PendingOp> = Vec::new();
        let mut retired = false;

        'outer: loop {
            // Disconnected: wait for work before dialing.
            if backlog.is_empty() {
                match self.rx.recv().await {
                    Some(PipelineMsg::Dispatch(op)) => backlog.push(op),
                    Some(PipelineMsg::SetBucket(bucket)) => {
                        self.ctx.bucket = Some(bucket);
                        continue;
                    }
                    Some(PipelineMsg::Retire) => {
                        retired = true;
                        break 'outer;
                    }
                    Some(PipelineMsg::Close) | None => break 'outer,
                }
            }

            if self.state == ServerState::Closed {
                break;
            }

            let (reader, writer) = match self.connect().await {
                Ok(halves) => halves,
                Err(err) => {
                    debug!(host = %self.host, %err, "connect failed");
                    self.emit_socket_error(err.clone());
                    for op in backlog.drain(..) {
                        self.dispose(op, err.clone(), RetryReason::SockErr);
                    }
                    self.state = ServerState::ErrDrain;
                    continue;
                }
            };
            self.state = ServerState::Clean;

            for op in backlog.drain(..) {
                self.enqueue(op);
            }

            match self.connection_loop(reader, writer).await {
                LoopExit::Close => break 'outer,
                LoopExit::Retire => {
                    retired = true;
                    break 'outer;
                }
                LoopExit::Reconnect => continue 'outer,
            }
        }

        self.state = ServerState::Closed;
        if retired {
            // Packets stranded by a topology change get another chance
            // through the retry queue.
            self.fail_chain(CouchError::MapChanged, RetryReason::TopoChange);
        } else {
            self.fail_chain(CouchError::ShuttingDown, RetryReason::SockErr);
        }
        while let Ok(msg) = self.rx.try_recv() {
            if let PipelineMsg::Dispatch(op) = msg {
                op.fail(CouchError::ShuttingDown);
            }
        }
    }

    async fn connect(&mut self) -> Result<(ReadHalf<Connection>, WriteHalf<Connection>)> {
        self.conn_seq += 1;
        let PooledSocket {
            mut conn,
            session,
            ..
        } = self.ctx.pool.acquire(&self.host, self.port).await?;

        // A pooled socket may already carry a negotiated session.
        let session = match session {
            Some(session) => session,
            None => {
                negotiate::negotiate(
                    &mut conn,
                    &self.ctx.settings,
                    self.ctx.bucket.as_deref(),
                    self.ctx.is_tls,
                    self.conn_seq,
                )
                .await?
            }
        };
        debug!(host = %self.host, mechanism = %session.mechanism, "pipeline connected");
        self.session = Some(session);
        Ok(tokio::io::split(conn))
    }

    async fn connection_loop(
        &mut self,
        mut reader: ReadHalf<Connection>,
        mut writer: WriteHalf<Connection>,
    ) -> LoopExit {
        let mut read_since_timer = false;

        loop {
            let io_deadline = self.log.oldest_deadline();
            let timer = async {
                match io_deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
                    None => std::future::pending().await,
                }
            };
            let have_output = !self.outq.is_empty();
            let out_offset = self.out_offset;

            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(PipelineMsg::Dispatch(op)) => self.enqueue(op),
                    Some(PipelineMsg::SetBucket(bucket)) => self.select_bucket(bucket),
                    Some(PipelineMsg::Retire) => return LoopExit::Retire,
                    Some(PipelineMsg::Close) | None => return LoopExit::Close,
                },

                written = write_some(&mut writer, &self.outq, out_offset), if have_output => {
                    match written {
                        Ok(n) => self.consume_written(n),
                        Err(e) => {
                            let err = CouchError::Network(format!("write: {e}"));
                            self.connection_failed(err);
                            return LoopExit::Reconnect;
                        }
                    }
                }

                read = reader.read_buf(&mut self.rope) => {
                    match read {
                        Ok(0) => {
                            self.connection_failed(CouchError::Network(
                                "connection closed by server".into(),
                            ));
                            return LoopExit::Reconnect;
                        }
                        Ok(_) => {
                            read_since_timer = true;
                            if let Err(err) = self.parse_responses() {
                                // Framing errors poison the connection.
                                self.connection_failed(err);
                                return LoopExit::Reconnect;
                            }
                        }
                        Err(e) => {
                            self.connection_failed(CouchError::Network(format!("read: {e}")));
                            return LoopExit::Reconnect;
                        }
                    }
                }

                () = timer => {
                    let expired = self.log.take_expired(Instant::now());
                    if !expired.is_empty() && !read_since_timer {
                        // Nothing arrived the whole window: the socket
                        // itself is considered dead.
                        for op in expired {
                            op.fail(CouchError::Timeout);
                        }
                        self.connection_failed(CouchError::Timeout);
                        return LoopExit::Reconnect;
                    }
                    for op in expired {
                        op.fail(CouchError::Timeout);
                    }
                    read_since_timer = false;
                }
            }
        }
    }

    /// Encode an op, append to the log and output queue.
    fn enqueue(&mut self, mut op: PendingOp) {
        use crate::protocol::PacketFlags;

        op.packet.opaque = self.ctx.opaque_counter.fetch_add(1, Ordering::Relaxed);
        op.packet.flags.set(PacketFlags::FLUSHED);
        let mut frame = BytesMut::with_capacity(op.packet.frame_len());
        op.packet.encode(&mut frame);
        self.outq.push_back(frame.freeze());
        self.log.push(op);
    }

    fn select_bucket(&mut self, bucket: String) {
        self.ctx.bucket = Some(bucket.clone());
        let already = self
            .session
            .as_ref()
            .and_then(|s| s.bucket.as_deref())
            == Some(bucket.as_str());
        if already {
            return;
        }
        let packet = crate::protocol::RequestPacket::new(Opcode::SelectBucket)
            .with_key(Bytes::from(bucket.clone()));
        let (op, rx) = PendingOp::new(packet, self.ctx.settings.operation_timeout);
        let bucket_for_log = bucket.clone();
        tokio::spawn(async move {
            match rx.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(bucket = %bucket_for_log, "deferred SELECT_BUCKET failed: {e}"),
                Err(_) => {}
            }
        });
        if let Some(session) = &mut self.session {
            session.bucket = Some(bucket);
        }
        self.enqueue(op);
    }

    fn consume_written(&mut self, mut n: usize) {
        n += self.out_offset;
        self.out_offset = 0;
        while n > 0 {
            match self.outq.front() {
                Some(front) if n >= front.len() => {
                    n -= front.len();
                    self.outq.pop_front();
                }
                Some(_) => {
                    self.out_offset = n;
                    break;
                }
                None => break,
            }
        }
    }

    /// Parse every complete response currently buffered. One response per
    /// iteration; a partial body stays in the rope untouched.
    fn parse_responses(&mut self) -> Result<()> {
        loop {
            if self.rope.len() < HEADER_LEN {
                return Ok(());
            }
            let header = ResponseHeader::decode(&self.rope[..HEADER_LEN])?;
            let total = HEADER_LEN + header.bodylen as usize;
            if self.rope.len() < total {
                // Body straddles a read boundary; wait for the rest.
                return Ok(());
            }
            let frame = self.rope.split_to(total).freeze();
            let resp = crate::protocol::ResponsePacket::new(header, frame.slice(HEADER_LEN..))?;
            self.handle_response(resp);
        }
    }

    fn handle_response(&mut self, resp: crate::protocol::ResponsePacket) {
        let opaque = resp.opaque();
        let Some(in_log) = self.log.find(opaque) else {
            trace!(opaque, "response for stale opaque, dropping");
            return;
        };
        let opcode = in_log.packet.opcode;

        if resp.status() == Status::NotMyVbucket {
            if let Some(op) = self.log.remove(opaque) {
                self.handle_nmv(op, &resp);
            }
            return;
        }

        // Streaming STAT: non-empty key means more rows follow.
        if opcode == Opcode::Stat && resp.status() == Status::Success && !resp.key().is_empty() {
            let entry = self.stat_rows.entry(opaque).or_default();
            let key = String::from_utf8_lossy(&resp.key()).into_owned();
            let value = String::from_utf8_lossy(&resp.value()).into_owned();
            entry.insert(key, serde_json::Value::String(value));
            return;
        }

        let Some(op) = self.log.remove(opaque) else {
            return;
        };

        if resp.status() == Status::Success {
            let mutation_tokens = self
                .session
                .as_ref()
                .is_some_and(|s| s.has_feature(HelloFeature::MutationSeqno));
            let mut kv = KvResponse::from_packet(opcode, &resp, mutation_tokens);
            if let Some(token) = &mut kv.mutation_token {
                token.vbucket = op.packet.vbucket;
            }
            if opcode == Opcode::Stat {
                if let Some(rows) = self.stat_rows.remove(&opaque) {
                    kv.value = Bytes::from(
                        serde_json::to_vec(&serde_json::Value::Object(rows))
                            .unwrap_or_default(),
                    );
                }
            }
            op.succeed(kv);
            return;
        }

        // Error path: map, consult the error map for retry guidance.
        let err = CouchError::from_status(resp.status(), op.packet.vbucket);
        let errmap_spec = self.session.as_ref().and_then(|s| {
            let map = s.error_map.as_ref()?;
            let entry = map.get(resp.status().as_u16())?;
            if entry.is_auto_retry() {
                entry.retry.clone()
            } else {
                None
            }
        });

        match errmap_spec {
            Some(spec) if admit(&op.packet, &err, RetryReason::TopoChange, &self.ctx.settings) => {
                let mut op = op;
                if let Some(max) = spec.max_duration() {
                    op.cap_deadline(max);
                }
                op.retry_spec = Some(spec);
                op.remember_error(&err);
                self.send_to_retry(op, RetryReason::TopoChange, false);
            }
            _ => op.fail(err),
        }
    }

    fn handle_nmv(&mut self, mut op: PendingOp, resp: &crate::protocol::ResponsePacket) {
        let vbucket = op.packet.vbucket;
        let err = CouchError::NotMyVbucket { vbucket };
        debug!(vbucket, host = %self.host, "NOT_MY_VBUCKET");

        // A body may carry a fresher config document.
        let body = resp.value();
        if !body.is_empty() {
            let _ = self.ctx.events_tx.send(PipelineEvent::ConfigFromNmv {
                raw: body.clone(),
                origin_host: self.host.clone(),
            });
        }

        // Heuristic remap hint: this node rejected the vbucket, steer
        // follow-up traffic elsewhere until an authoritative config lands.
        if !self.ctx.settings.vb_noremap {
            self.ctx.vbguess.record_reject(vbucket, self.index);
        }

        op.remember_error(&err);
        let schedule_now = self.ctx.settings.nmv_retry_imm;
        self.dispose_nmv(op, err, schedule_now);
    }

    fn dispose_nmv(&mut self, op: PendingOp, err: CouchError, schedule_now: bool) {
        if admit(&op.packet, &err, RetryReason::NotMyVbucket, &self.ctx.settings) {
            self.send_to_retry(op, RetryReason::NotMyVbucket, schedule_now);
        } else {
            op.fail(err);
        }
    }

    /// Fail or re-queue a single op per admission rules.
    fn dispose(&mut self, mut op: PendingOp, err: CouchError, reason: RetryReason) {
        op.remember_error(&err);
        if admit(&op.packet, &err, reason, &self.ctx.settings) {
            self.send_to_retry(op, reason, false);
        } else {
            op.fail(err);
        }
    }

    fn send_to_retry(&mut self, mut op: PendingOp, reason: RetryReason, schedule_now: bool) {
        op.detach();
        op.retries = op.retries.saturating_add(1);
        let request = RetryRequest {
            op,
            reason,
            schedule_immediately: schedule_now,
        };
        if let Err(mpsc::error::SendError(request)) = self.ctx.retry_tx.send(request) {
            request.op.fail(CouchError::ShuttingDown);
        }
    }

    /// Tear down the connection and fail every in-flight packet.
    fn connection_failed(&mut self, err: CouchError) {
        self.emit_socket_error(err.clone());
        self.fail_chain(err, RetryReason::SockErr);
        self.state = ServerState::ErrDrain;
        self.session = None;
    }

    fn fail_chain(&mut self, err: CouchError, reason: RetryReason) {
        self.outq.clear();
        self.out_offset = 0;
        self.rope.clear();
        self.stat_rows.clear();
        for op in self.log.drain() {
            self.dispose(op, err.clone(), reason);
        }
    }

    fn emit_socket_error(&self, error: CouchError) {
        let _ = self.ctx.events_tx.send(PipelineEvent::SocketError {
            index: self.index,
            error,
        });
    }
}

enum LoopExit {
    Close,
    Retire,
    Reconnect,
}

/// Write up to [`MAX_IOV`] buffered frames in one vectored call.
async fn write_some(
    writer: &mut WriteHalf<Connection>,
    outq: &std::collections::VecDeque<Bytes>,
    offset: usize,
) -> std::io::Result<usize> {
    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(MAX_IOV.min(outq.len()));
    for (i, frame) in outq.iter().take(MAX_IOV).enumerate() {
        if i == 0 && offset > 0 {
            slices.push(IoSlice::new(&frame[offset..]));
        } else {
            slices.push(IoSlice::new(frame));
        }
    }
    writer.write_vectored(&slices).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::op::PendingOp;
    use crate::protocol::RequestPacket;
    use crate::testkit::MockNode;
    use std::time::Duration;

    fn test_ctx(settings: ClientSettings) -> (PipelineContext, mpsc::UnboundedReceiver<PipelineEvent>, mpsc::UnboundedReceiver<RetryRequest>) {
        let connector = Arc::new(
            crate::client::pool::Connector::from_settings(&settings).unwrap(),
        );
        let pool = Arc::new(SocketPool::new(
            connector,
            crate::client::pool::PoolOptions::default(),
        ));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let ctx = PipelineContext {
            settings,
            pool,
            retry_tx,
            events_tx,
            vbguess: Arc::new(VbGuess::new()),
            opaque_counter: Arc::new(AtomicU32::new(1)),
            bucket: None,
            is_tls: false,
        };
        (ctx, events_rx, retry_rx)
    }

    fn plain_settings() -> ClientSettings {
        let mut settings = ClientSettings::default();
        settings.username = Some("user".into());
        settings.password = Some("pass".into());
        settings.sasl_mech_force = Some("PLAIN".into());
        settings
    }

    #[tokio::test]
    async fn test_get_roundtrip() {
        let node = MockNode::start().await;
        node.put(b"answer", b"42").await;

        let (ctx, _ev, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), node.port(), ctx);

        let packet = RequestPacket::new(Opcode::Get).with_key(&b"answer"[..]);
        let (op, rx) = PendingOp::new(packet, Duration::from_secs(2));
        pipeline.dispatch(op);

        let resp = rx.await.unwrap().unwrap();
        assert_eq!(resp.status, Status::Success);
        assert_eq!(&resp.value[..], b"42");
    }

    #[tokio::test]
    async fn test_miss_maps_to_key_not_found() {
        let node = MockNode::start().await;
        let (ctx, _ev, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), node.port(), ctx);

        let packet = RequestPacket::new(Opcode::Get).with_key(&b"missing"[..]);
        let (op, rx) = PendingOp::new(packet, Duration::from_secs(2));
        pipeline.dispatch(op);

        assert_eq!(rx.await.unwrap().unwrap_err(), CouchError::KeyNotFound);
    }

    #[tokio::test]
    async fn test_pipelined_ops_demux_by_opaque() {
        let node = MockNode::start().await;
        node.put(b"a", b"1").await;
        node.put(b"b", b"2").await;

        let (ctx, _ev, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), node.port(), ctx);

        let mut rxs = Vec::new();
        for key in [&b"a"[..], &b"b"[..], &b"a"[..]] {
            let packet = RequestPacket::new(Opcode::Get).with_key(key);
            let (op, rx) = PendingOp::new(packet, Duration::from_secs(2));
            pipeline.dispatch(op);
            rxs.push(rx);
        }

        let first = rxs.remove(0).await.unwrap().unwrap();
        let second = rxs.remove(0).await.unwrap().unwrap();
        let third = rxs.remove(0).await.unwrap().unwrap();
        assert_eq!(&first.value[..], b"1");
        assert_eq!(&second.value[..], b"2");
        assert_eq!(&third.value[..], b"1");
    }

    #[tokio::test]
    async fn test_nmv_goes_to_retry_queue_with_config_event() {
        let node = MockNode::start().await;
        node.script_nmv(b"wandering", Some(br#"{"rev": 9, "nodesExt": []}"#.to_vec()))
            .await;

        let (ctx, mut events_rx, mut retry_rx) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(3, "127.0.0.1".into(), node.port(), ctx);

        let mut packet = RequestPacket::new(Opcode::Get).with_key(&b"wandering"[..]);
        packet.vbucket = 17;
        let (op, _rx) = PendingOp::new(packet, Duration::from_secs(2));
        pipeline.dispatch(op);

        // The packet lands in the retry queue, detached and marked NMV.
        let req = retry_rx.recv().await.unwrap();
        assert_eq!(req.reason, RetryReason::NotMyVbucket);
        assert!(req
            .op
            .packet
            .flags
            .contains(crate::protocol::PacketFlags::DETACHED));
        assert_eq!(
            req.op.orig_err,
            Some(CouchError::NotMyVbucket { vbucket: 17 })
        );

        // The config body is pushed toward the providers.
        match events_rx.recv().await.unwrap() {
            PipelineEvent::ConfigFromNmv { raw, .. } => {
                assert!(raw.starts_with(br#"{"rev": 9"#));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_connect_failure_disposes_ops() {
        // Port 1 on localhost: nothing listens.
        let (ctx, mut events_rx, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), 1, ctx);

        let packet = RequestPacket::new(Opcode::Observe).with_key(&b"k"[..]);
        let (op, rx) = PendingOp::new(packet, Duration::from_secs(2));
        pipeline.dispatch(op);

        // OBSERVE is never retry-eligible, so the op fails outright.
        let err = rx.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Network);
        assert!(matches!(
            events_rx.recv().await.unwrap(),
            PipelineEvent::SocketError { .. }
        ));
    }

    #[tokio::test]
    async fn test_close_fails_pending() {
        let node = MockNode::start().await;
        node.set_stall(true).await;

        let (ctx, _ev, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), node.port(), ctx);

        let packet = RequestPacket::new(Opcode::Observe).with_key(&b"k"[..]);
        let (op, rx) = PendingOp::new(packet, Duration::from_secs(30));
        pipeline.dispatch(op);
        tokio::time::sleep(Duration::from_millis(50)).await;
        pipeline.close();

        assert_eq!(rx.await.unwrap().unwrap_err(), CouchError::ShuttingDown);
    }

    #[tokio::test]
    async fn test_op_timeout_fires() {
        let node = MockNode::start().await;
        node.set_stall(true).await;

        let (ctx, _ev, _rt) = test_ctx(plain_settings());
        let pipeline = Pipeline::spawn(0, "127.0.0.1".into(), node.port(), ctx);

        let packet = RequestPacket::new(Opcode::Observe).with_key(&b"k"[..]);
        let (op, rx) = PendingOp::new(packet, Duration::from_millis(100));
        pipeline.dispatch(op);

        let err = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert_eq!(err, CouchError::Timeout);
    }
}
