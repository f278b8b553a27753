// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities: an in-process mock memcached node.
//!
//! [`MockNode`] binds a local listener and speaks enough of the binary
//! protocol to drive the client through negotiation and data traffic:
//! HELLO, SASL (PLAIN), SELECT_BUCKET, GET_CLUSTER_CONFIG, the GET/SET
//! family, STAT streaming, and scripted NOT_MY_VBUCKET responses with or
//! without an embedded config document. Behaviour toggles (stalling,
//! dropping connections) let tests exercise the failure paths.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use crate::protocol::{Opcode, HEADER_LEN, MAGIC_RESPONSE};

#[derive(Debug)]
struct MockState {
    data: HashMap<Vec<u8>, Bytes>,
    nmv_scripts: HashMap<Vec<u8>, Option<Vec<u8>>>,
    cluster_config: Option<Vec<u8>>,
    cccp_unsupported: bool,
    /// Swallow data requests (negotiation still answers).
    stall: bool,
    /// Close the connection upon the next data request.
    drop_next: bool,
    cas_counter: u64,
    mechs: String,
    auth_attempts: usize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            data: HashMap::new(),
            nmv_scripts: HashMap::new(),
            cluster_config: None,
            cccp_unsupported: false,
            stall: false,
            drop_next: false,
            cas_counter: 0,
            mechs: "PLAIN SCRAM-SHA256".to_string(),
            auth_attempts: 0,
        }
    }
}

/// A scripted memcached server on a local port.
pub struct MockNode {
    port: u16,
    state: Arc<Mutex<MockState>>,
}

impl MockNode {
    /// Bind and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind mock node");
        let port = listener.local_addr().expect("local addr").port();
        let state = Arc::new(Mutex::new(MockState::default()));

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let Ok((sock, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve_connection(sock, Arc::clone(&accept_state)));
            }
        });

        Self { port, state }
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub async fn put(&self, key: &[u8], value: &[u8]) {
        self.state
            .lock()
            .await
            .data
            .insert(key.to_vec(), Bytes::copy_from_slice(value));
    }

    /// Make the next GETs of `key` answer NOT_MY_VBUCKET, optionally with
    /// a config document body.
    pub async fn script_nmv(&self, key: &[u8], config: Option<Vec<u8>>) {
        self.state
            .lock()
            .await
            .nmv_scripts
            .insert(key.to_vec(), config);
    }

    pub async fn set_cluster_config(&self, raw: Vec<u8>) {
        self.state.lock().await.cluster_config = Some(raw);
    }

    pub async fn set_cccp_unsupported(&self, unsupported: bool) {
        self.state.lock().await.cccp_unsupported = unsupported;
    }

    pub async fn set_stall(&self, stall: bool) {
        self.state.lock().await.stall = stall;
    }

    pub async fn drop_next_request(&self) {
        self.state.lock().await.drop_next = true;
    }

    /// Override the advertised SASL mechanism list.
    pub async fn set_mechs(&self, mechs: &str) {
        self.state.lock().await.mechs = mechs.to_string();
    }

    /// How many SASL_AUTH frames this node has seen.
    pub async fn auth_attempts(&self) -> usize {
        self.state.lock().await.auth_attempts
    }
}

fn build_response(
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    key: &[u8],
    value: &[u8],
) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + extras.len() + key.len() + value.len());
    out.put_u8(MAGIC_RESPONSE);
    out.put_u8(opcode);
    out.put_u16(key.len() as u16);
    out.put_u8(extras.len() as u8);
    out.put_u8(0);
    out.put_u16(status);
    out.put_u32((extras.len() + key.len() + value.len()) as u32);
    out.put_u32_ne(opaque);
    out.put_u64(cas);
    out.put_slice(extras);
    out.put_slice(key);
    out.put_slice(value);
    out.freeze()
}

struct ParsedRequest {
    opcode: u8,
    opaque: u32,
    cas: u64,
    extras: Bytes,
    key: Bytes,
    value: Bytes,
}

async fn read_request(sock: &mut tokio::net::TcpStream) -> Option<ParsedRequest> {
    let mut header = [0u8; HEADER_LEN];
    sock.read_exact(&mut header).await.ok()?;
    let mut h = &header[..];
    let _magic = h.get_u8();
    let opcode = h.get_u8();
    let keylen = h.get_u16() as usize;
    let extlen = h.get_u8() as usize;
    let _datatype = h.get_u8();
    let _vbucket = h.get_u16();
    let bodylen = h.get_u32() as usize;
    let opaque = h.get_u32_ne();
    let cas = h.get_u64();

    let mut body = vec![0u8; bodylen];
    if bodylen > 0 {
        sock.read_exact(&mut body).await.ok()?;
    }
    let body = Bytes::from(body);
    Some(ParsedRequest {
        opcode,
        opaque,
        cas,
        extras: body.slice(..extlen),
        key: body.slice(extlen..extlen + keylen),
        value: body.slice(extlen + keylen..),
    })
}

fn is_negotiation(opcode: u8) -> bool {
    matches!(
        Opcode::from_u8(opcode),
        Some(
            Opcode::Hello
                | Opcode::SaslListMechs
                | Opcode::SaslAuth
                | Opcode::SaslStep
                | Opcode::SelectBucket
                | Opcode::GetErrorMap
        )
    )
}

async fn serve_connection(mut sock: tokio::net::TcpStream, state: Arc<Mutex<MockState>>) {
    while let Some(req) = read_request(&mut sock).await {
        let response = {
            let mut state = state.lock().await;

            if !is_negotiation(req.opcode) {
                if state.stall {
                    continue;
                }
                if state.drop_next {
                    state.drop_next = false;
                    return;
                }
            }

            handle_request(&req, &mut state)
        };
        for frame in response {
            if sock.write_all(&frame).await.is_err() {
                return;
            }
        }
    }
}

fn handle_request(req: &ParsedRequest, state: &mut MockState) -> Vec<Bytes> {
    let opcode = req.opcode;
    match Opcode::from_u8(opcode) {
        Some(Opcode::Hello) => {
            // Echo the requested features, minus XERROR so negotiation
            // skips the error-map stage unless a test opts in.
            let mut agreed = BytesMut::new();
            for chunk in req.value.chunks_exact(2) {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                if id != crate::protocol::HelloFeature::Xerror.as_u16() {
                    agreed.put_u16(id);
                }
            }
            vec![build_response(opcode, 0, req.opaque, 0, &[], &[], &agreed)]
        }
        Some(Opcode::SaslListMechs) => {
            let mechs = state.mechs.clone();
            vec![build_response(
                opcode,
                0,
                req.opaque,
                0,
                &[],
                &[],
                mechs.as_bytes(),
            )]
        }
        Some(Opcode::SaslAuth) => {
            state.auth_attempts += 1;
            // PLAIN arrives complete; accept anything non-empty.
            let status = if req.value.is_empty() { 0x20 } else { 0 };
            vec![build_response(opcode, status, req.opaque, 0, &[], &[], &[])]
        }
        Some(Opcode::SaslStep) => vec![build_response(opcode, 0, req.opaque, 0, &[], &[], &[])],
        Some(Opcode::SelectBucket) => {
            vec![build_response(opcode, 0, req.opaque, 0, &[], &[], &[])]
        }
        Some(Opcode::GetErrorMap) => {
            vec![build_response(opcode, 0x83, req.opaque, 0, &[], &[], &[])]
        }
        Some(Opcode::GetClusterConfig) => {
            if state.cccp_unsupported {
                vec![build_response(opcode, 0x83, req.opaque, 0, &[], &[], &[])]
            } else if let Some(config) = &state.cluster_config {
                vec![build_response(opcode, 0, req.opaque, 0, &[], &[], config)]
            } else {
                vec![build_response(opcode, 0x83, req.opaque, 0, &[], &[], &[])]
            }
        }
        Some(Opcode::Get | Opcode::GetK | Opcode::GetLocked | Opcode::Gat | Opcode::GetReplica) => {
            if let Some(config) = state.nmv_scripts.get(&req.key[..]) {
                let body = config.clone().unwrap_or_default();
                return vec![build_response(opcode, 0x07, req.opaque, 0, &[], &[], &body)];
            }
            match state.data.get(&req.key[..]) {
                Some(value) => {
                    let flags = [0u8; 4];
                    state.cas_counter += 1;
                    vec![build_response(
                        opcode,
                        0,
                        req.opaque,
                        state.cas_counter,
                        &flags,
                        &[],
                        value,
                    )]
                }
                None => vec![build_response(opcode, 0x01, req.opaque, 0, &[], &[], &[])],
            }
        }
        Some(Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend) => {
            if let Some(config) = state.nmv_scripts.get(&req.key[..]) {
                let body = config.clone().unwrap_or_default();
                return vec![build_response(opcode, 0x07, req.opaque, 0, &[], &[], &body)];
            }
            let exists = state.data.contains_key(&req.key[..]);
            let status = match Opcode::from_u8(opcode) {
                Some(Opcode::Add) if exists => 0x02,
                Some(Opcode::Replace) if !exists => 0x01,
                _ => 0,
            };
            if status == 0 {
                state.data.insert(req.key.to_vec(), req.value.clone());
                state.cas_counter += 1;
            }
            // Mutation-token extras when the client negotiated them.
            let mut extras = BytesMut::new();
            extras.put_u64(0x1111_2222_3333_4444);
            extras.put_u64(state.cas_counter);
            vec![build_response(
                opcode,
                status,
                req.opaque,
                state.cas_counter,
                &extras,
                &[],
                &[],
            )]
        }
        Some(Opcode::Delete) => {
            let status = if state.data.remove(&req.key[..]).is_some() {
                0
            } else {
                0x01
            };
            vec![build_response(opcode, status, req.opaque, 0, &[], &[], &[])]
        }
        Some(Opcode::Increment | Opcode::Decrement) => {
            let mut extras = &req.extras[..];
            let delta = if extras.len() >= 8 { extras.get_u64() } else { 1 };
            let initial = if extras.len() >= 8 { extras.get_u64() } else { 0 };
            let current = state
                .data
                .get(&req.key[..])
                .and_then(|v| std::str::from_utf8(v).ok())
                .and_then(|v| v.parse::<u64>().ok());
            let next = match (current, Opcode::from_u8(opcode)) {
                (Some(n), Some(Opcode::Increment)) => n.saturating_add(delta),
                (Some(n), Some(Opcode::Decrement)) => n.saturating_sub(delta),
                _ => initial,
            };
            state
                .data
                .insert(req.key.to_vec(), Bytes::from(next.to_string()));
            state.cas_counter += 1;
            let mut value = BytesMut::new();
            value.put_u64(next);
            vec![build_response(
                opcode,
                0,
                req.opaque,
                state.cas_counter,
                &[],
                &[],
                &value,
            )]
        }
        Some(Opcode::Touch | Opcode::UnlockKey) => {
            let status = if state.data.contains_key(&req.key[..]) {
                0
            } else {
                0x01
            };
            let _ = req.cas;
            vec![build_response(opcode, status, req.opaque, 0, &[], &[], &[])]
        }
        Some(Opcode::Stat) => {
            // Two rows then the empty terminator.
            vec![
                build_response(opcode, 0, req.opaque, 0, &[], b"pid", b"1234"),
                build_response(opcode, 0, req.opaque, 0, &[], b"version", b"7.0.0-mock"),
                build_response(opcode, 0, req.opaque, 0, &[], &[], &[]),
            ]
        }
        Some(Opcode::Version) => {
            vec![build_response(opcode, 0, req.opaque, 0, &[], &[], b"7.0.0-mock")]
        }
        Some(Opcode::Noop | Opcode::Observe | Opcode::ObserveSeqno | Opcode::Verbosity) => {
            vec![build_response(opcode, 0, req.opaque, 0, &[], &[], &[])]
        }
        _ => vec![build_response(opcode, 0x81, req.opaque, 0, &[], &[], &[])],
    }
}
