// SPDX-License-Identifier: MIT OR Apache-2.0

//! Session negotiation: the one-shot dialog run on every new connection
//! before any user packets are written.
//!
//! Sequence: HELLO with the supported-feature list, GET_ERROR_MAP when
//! enabled, SASL_LIST_MECHS (skipped under TLS client-certificate auth),
//! the SASL exchange, and finally SELECT_BUCKET when a bucket is
//! configured and the server negotiated the feature. The resulting
//! [`SessionInfo`] is attached to the socket so pool reuse preserves the
//! negotiated state.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace, warn};

use crate::client::pool::SessionInfo;
use crate::config::ClientSettings;
use crate::error::{CouchError, Result};
use crate::pipeline::sasl::{choose_mechanism, SaslClient};
use crate::protocol::{
    ErrorMap, HelloFeature, Opcode, RequestPacket, ResponseHeader, ResponsePacket, Status,
    HEADER_LEN,
};

/// Default agent name advertised in HELLO.
pub const DEFAULT_AGENT: &str = concat!("couchbase-client-rs/", env!("CARGO_PKG_VERSION"));

pub(crate) async fn send_packet<S: AsyncWrite + Unpin>(stream: &mut S, packet: &RequestPacket) -> Result<()> {
    let mut buf = BytesMut::with_capacity(packet.frame_len());
    packet.encode(&mut buf);
    stream
        .write_all(&buf)
        .await
        .map_err(|e| CouchError::Network(format!("negotiation write: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| CouchError::Network(format!("negotiation flush: {e}")))?;
    Ok(())
}

pub(crate) async fn read_packet<S: AsyncRead + Unpin>(stream: &mut S) -> Result<ResponsePacket> {
    let mut header = [0u8; HEADER_LEN];
    stream
        .read_exact(&mut header)
        .await
        .map_err(|e| CouchError::Network(format!("negotiation read: {e}")))?;
    let header = ResponseHeader::decode(&header)?;
    let mut body = vec![0u8; header.bodylen as usize];
    if !body.is_empty() {
        stream
            .read_exact(&mut body)
            .await
            .map_err(|e| CouchError::Network(format!("negotiation read body: {e}")))?;
    }
    ResponsePacket::new(header, Bytes::from(body))
}

pub(crate) async fn roundtrip<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    packet: &RequestPacket,
) -> Result<ResponsePacket> {
    send_packet(stream, packet).await?;
    let resp = read_packet(stream).await?;
    if resp.opaque() != packet.opaque {
        return Err(CouchError::Protocol(format!(
            "negotiation response opaque {} does not match request {}",
            resp.opaque(),
            packet.opaque
        )));
    }
    Ok(resp)
}

fn feature_list(settings: &ClientSettings, is_tls: bool) -> Vec<HelloFeature> {
    let mut features = vec![
        HelloFeature::Datatype,
        HelloFeature::Xattr,
        HelloFeature::Json,
        HelloFeature::Xerror,
        HelloFeature::AltRequestSupport,
        HelloFeature::CreateAsDeleted,
        HelloFeature::PreserveTtl,
    ];
    if is_tls {
        features.push(HelloFeature::Tls);
    }
    if settings.select_bucket {
        features.push(HelloFeature::SelectBucket);
    }
    if settings.tcp_nodelay {
        features.push(HelloFeature::TcpNodelay);
    }
    if settings.compression != crate::config::CompressionMode::Off {
        features.push(HelloFeature::Snappy);
    }
    if settings.enable_mutation_tokens {
        features.push(HelloFeature::MutationSeqno);
    }
    if settings.enable_tracing {
        features.push(HelloFeature::Tracing);
    }
    if settings.enable_collections {
        features.push(HelloFeature::Collections);
    }
    if settings.enable_durable_write {
        features.push(HelloFeature::SyncReplication);
    }
    if settings.enable_unordered_execution {
        features.push(HelloFeature::UnorderedExecution);
    }
    features
}

fn agent_json(settings: &ClientSettings, seq: u64) -> String {
    let agent = settings.client_string.as_deref().unwrap_or(DEFAULT_AGENT);
    format!(r#"{{"a":"{agent}","i":"{seq:016x}"}}"#)
}

/// Run the full negotiation on a fresh connection.
///
/// `conn_seq` distinguishes connections in the agent string; `is_tls`
/// drives the feature list and the PLAIN-downgrade guard.
pub async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    settings: &ClientSettings,
    bucket: Option<&str>,
    is_tls: bool,
    conn_seq: u64,
) -> Result<SessionInfo> {
    let mut opaque = 0xff00_0000u32;
    let mut next_opaque = || {
        opaque = opaque.wrapping_add(1);
        opaque
    };

    // HELLO
    let features = feature_list(settings, is_tls);
    let mut value = BytesMut::with_capacity(features.len() * 2);
    for f in &features {
        value.put_u16(f.as_u16());
    }
    let mut hello = RequestPacket::new(Opcode::Hello)
        .with_key(Bytes::from(agent_json(settings, conn_seq)))
        .with_value(value.freeze());
    hello.opaque = next_opaque();

    let mut negotiated: HashSet<HelloFeature> = HashSet::new();
    let resp = roundtrip(stream, &hello).await?;
    match resp.status() {
        Status::Success => {
            let value = resp.value();
            for chunk in value.chunks_exact(2) {
                let id = u16::from_be_bytes([chunk[0], chunk[1]]);
                if let Some(feature) = HelloFeature::from_u16(id) {
                    negotiated.insert(feature);
                }
            }
            trace!(?negotiated, "HELLO negotiated");
        }
        s if s.is_unsupported() => {
            debug!("server does not speak HELLO, continuing without features");
        }
        s => return Err(map_negotiation_error(s, "HELLO")),
    }

    // GET_ERROR_MAP (version 1)
    let mut error_map = None;
    if settings.enable_errmap && negotiated.contains(&HelloFeature::Xerror) {
        let mut version = BytesMut::with_capacity(2);
        version.put_u16(1);
        let mut req = RequestPacket::new(Opcode::GetErrorMap).with_value(version.freeze());
        req.opaque = next_opaque();
        let resp = roundtrip(stream, &req).await?;
        match resp.status() {
            Status::Success => match ErrorMap::parse(&resp.value()) {
                Ok(map) => error_map = Some(Arc::new(map)),
                Err(e) => warn!("discarding unparseable error map: {e}"),
            },
            s if s.is_unsupported() => {
                debug!("server does not serve an error map");
            }
            s => return Err(map_negotiation_error(s, "GET_ERROR_MAP")),
        }
    }

    // SASL, unless TLS client-certificate auth carries the identity.
    let client_cert_auth =
        is_tls && settings.ssl_cert.is_some() && settings.ssl_key.is_some();
    let mut mechanism = String::new();
    if !client_cert_auth {
        let mut req = RequestPacket::new(Opcode::SaslListMechs);
        req.opaque = next_opaque();
        let resp = roundtrip(stream, &req).await?;
        if resp.status() != Status::Success {
            return Err(map_negotiation_error(resp.status(), "SASL_LIST_MECHS"));
        }
        let mechs_raw = resp.value();
        let mechs_str = std::str::from_utf8(&mechs_raw)
            .map_err(|_| CouchError::Protocol("mechanism list not UTF-8".into()))?;
        let advertised: Vec<&str> = mechs_str.split_whitespace().collect();

        mechanism = choose_mechanism(
            &advertised,
            settings.sasl_mech_force.as_deref(),
            is_tls,
        )?;
        debug!(mechanism, "authenticating");

        let username = settings.username.clone().unwrap_or_default();
        let password = settings.password.clone().unwrap_or_default();
        let mut sasl = SaslClient::new(&mechanism, &username, &password)?;

        let mut req = RequestPacket::new(Opcode::SaslAuth)
            .with_key(Bytes::from(mechanism.clone()))
            .with_value(Bytes::from(sasl.initial_response()));
        req.opaque = next_opaque();
        let mut resp = roundtrip(stream, &req).await?;

        while resp.status() == Status::AuthContinue {
            let payload = sasl.step(&resp.value())?;
            let mut step = RequestPacket::new(Opcode::SaslStep)
                .with_key(Bytes::from(mechanism.clone()))
                .with_value(Bytes::from(payload));
            step.opaque = next_opaque();
            resp = roundtrip(stream, &step).await?;
        }

        match resp.status() {
            Status::Success => sasl.verify_server_final(&resp.value())?,
            Status::AuthError | Status::AuthStale => {
                return Err(CouchError::AuthFailed(format!(
                    "SASL {mechanism} rejected"
                )))
            }
            s => return Err(map_negotiation_error(s, "SASL_AUTH")),
        }
    }

    // SELECT_BUCKET
    let mut selected_bucket = None;
    if let Some(bucket) = bucket {
        if settings.select_bucket && negotiated.contains(&HelloFeature::SelectBucket) {
            let mut req =
                RequestPacket::new(Opcode::SelectBucket).with_key(Bytes::from(bucket.to_string()));
            req.opaque = next_opaque();
            let resp = roundtrip(stream, &req).await?;
            match resp.status() {
                Status::Success => selected_bucket = Some(bucket.to_string()),
                Status::AccessError | Status::KeyNotFound => {
                    return Err(CouchError::BucketNotFound(bucket.to_string()))
                }
                s => return Err(map_negotiation_error(s, "SELECT_BUCKET")),
            }
        }
    }

    Ok(SessionInfo {
        mechanism,
        features: negotiated,
        bucket: selected_bucket,
        error_map,
    })
}

fn map_negotiation_error(status: Status, stage: &str) -> CouchError {
    match status {
        Status::RateLimitedNetworkIngress
        | Status::RateLimitedNetworkEgress
        | Status::RateLimitedMaxConnections
        | Status::RateLimitedMaxCommands => CouchError::RateLimited,
        Status::QuotaLimitedScope | Status::QuotaLimitedBucket => CouchError::QuotaLimited,
        Status::AuthError | Status::AuthStale => {
            CouchError::AuthFailed(format!("{stage} rejected"))
        }
        other => CouchError::Protocol(format!("{stage} failed with status {:#06x}", other.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_list_respects_settings() {
        let mut settings = ClientSettings::default();
        let features = feature_list(&settings, false);
        assert!(features.contains(&HelloFeature::SelectBucket));
        assert!(features.contains(&HelloFeature::MutationSeqno));
        assert!(!features.contains(&HelloFeature::Tls));

        settings.enable_mutation_tokens = false;
        settings.compression = crate::config::CompressionMode::Off;
        let features = feature_list(&settings, true);
        assert!(features.contains(&HelloFeature::Tls));
        assert!(!features.contains(&HelloFeature::MutationSeqno));
        assert!(!features.contains(&HelloFeature::Snappy));
    }

    #[test]
    fn test_agent_json_uses_client_string() {
        let mut settings = ClientSettings::default();
        settings.client_string = Some("myapp/9.9".into());
        let json = agent_json(&settings, 7);
        assert!(json.contains(r#""a":"myapp/9.9""#));
        assert!(json.contains("0000000000000007"));
    }

    #[test]
    fn test_negotiation_error_mapping() {
        assert_eq!(
            map_negotiation_error(Status::RateLimitedMaxConnections, "HELLO"),
            CouchError::RateLimited
        );
        assert_eq!(
            map_negotiation_error(Status::QuotaLimitedBucket, "HELLO"),
            CouchError::QuotaLimited
        );
        assert!(matches!(
            map_negotiation_error(Status::AuthError, "SASL_AUTH"),
            CouchError::AuthFailed(_)
        ));
    }
}
