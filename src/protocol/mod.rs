// SPDX-License-Identifier: MIT OR Apache-2.0

//! Memcached binary protocol definitions.
//!
//! The wire unit is a fixed 24-byte header followed by
//! `extras || key || value`. All multi-byte integer fields are network byte
//! order except `opaque` (echoed verbatim by the server) and `cas` (treated
//! as an 8-byte opaque token).
//!
//! - [`packet`] — request/response framing and the header codec
//! - [`errmap`] — the server-provided error map and its retry specs

pub mod errmap;
pub mod packet;

pub use errmap::{ErrorMap, ErrorMapEntry, RetrySpec, RetryStrategy};
pub use packet::{PacketFlags, RequestPacket, ResponseHeader, ResponsePacket, HEADER_LEN};

/// Request frame magic.
pub const MAGIC_REQUEST: u8 = 0x80;
/// Response frame magic.
pub const MAGIC_RESPONSE: u8 = 0x81;

/// Maximum scatter-gather segments assembled into a single socket write.
pub const MAX_IOV: usize = 32;

/// Binary protocol opcodes used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Get = 0x00,
    Set = 0x01,
    Add = 0x02,
    Replace = 0x03,
    Delete = 0x04,
    Increment = 0x05,
    Decrement = 0x06,
    Flush = 0x08,
    GetQ = 0x09,
    Noop = 0x0a,
    Version = 0x0b,
    GetK = 0x0c,
    GetKQ = 0x0d,
    Append = 0x0e,
    Prepend = 0x0f,
    Stat = 0x10,
    Verbosity = 0x1b,
    Touch = 0x1c,
    Gat = 0x1d,
    GatQ = 0x1e,
    Hello = 0x1f,
    SaslListMechs = 0x20,
    SaslAuth = 0x21,
    SaslStep = 0x22,
    GetReplica = 0x83,
    SelectBucket = 0x89,
    ObserveSeqno = 0x91,
    Observe = 0x92,
    GetLocked = 0x94,
    UnlockKey = 0x95,
    GetClusterConfig = 0xb5,
    GetErrorMap = 0xfe,
}

impl Opcode {
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode a wire opcode. Unknown values are protocol errors upstream.
    #[must_use]
    pub fn from_u8(v: u8) -> Option<Self> {
        use Opcode::*;
        Some(match v {
            0x00 => Get,
            0x01 => Set,
            0x02 => Add,
            0x03 => Replace,
            0x04 => Delete,
            0x05 => Increment,
            0x06 => Decrement,
            0x08 => Flush,
            0x09 => GetQ,
            0x0a => Noop,
            0x0b => Version,
            0x0c => GetK,
            0x0d => GetKQ,
            0x0e => Append,
            0x0f => Prepend,
            0x10 => Stat,
            0x1b => Verbosity,
            0x1c => Touch,
            0x1d => Gat,
            0x1e => GatQ,
            0x1f => Hello,
            0x20 => SaslListMechs,
            0x21 => SaslAuth,
            0x22 => SaslStep,
            0x83 => GetReplica,
            0x89 => SelectBucket,
            0x91 => ObserveSeqno,
            0x92 => Observe,
            0x94 => GetLocked,
            0x95 => UnlockKey,
            0xb5 => GetClusterConfig,
            0xfe => GetErrorMap,
            _ => return None,
        })
    }

    /// Whether the opcode reads rather than mutates.
    #[must_use]
    pub fn is_read(self) -> bool {
        matches!(
            self,
            Opcode::Get
                | Opcode::GetQ
                | Opcode::GetK
                | Opcode::GetKQ
                | Opcode::Gat
                | Opcode::GatQ
                | Opcode::Touch
                | Opcode::GetReplica
                | Opcode::GetLocked
                | Opcode::Stat
                | Opcode::Version
                | Opcode::Noop
        )
    }

    /// Whether the retry queue may ever accept this opcode. STAT and
    /// OBSERVE responses are connection-scoped; SELECT_BUCKET and
    /// GET_CLUSTER_CONFIG belong to session/bootstrap machinery.
    #[must_use]
    pub fn is_retry_capable(self) -> bool {
        !matches!(
            self,
            Opcode::Stat
                | Opcode::Observe
                | Opcode::ObserveSeqno
                | Opcode::SelectBucket
                | Opcode::GetClusterConfig
        )
    }
}

/// Binary protocol response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Status {
    Success = 0x00,
    KeyNotFound = 0x01,
    KeyExists = 0x02,
    TooBig = 0x03,
    InvalidArguments = 0x04,
    NotStored = 0x05,
    DeltaBadval = 0x06,
    NotMyVbucket = 0x07,
    NoBucket = 0x08,
    Locked = 0x09,
    AuthStale = 0x1f,
    AuthError = 0x20,
    AuthContinue = 0x21,
    RangeError = 0x22,
    Rollback = 0x23,
    AccessError = 0x24,
    NotInitialized = 0x25,
    RateLimitedNetworkIngress = 0x30,
    RateLimitedNetworkEgress = 0x31,
    RateLimitedMaxConnections = 0x32,
    RateLimitedMaxCommands = 0x33,
    QuotaLimitedScope = 0x34,
    QuotaLimitedBucket = 0x35,
    UnknownCommand = 0x81,
    OutOfMemory = 0x82,
    NotSupported = 0x83,
    InternalError = 0x84,
    Busy = 0x85,
    TemporaryFailure = 0x86,
    Unknown = 0xffff,
}

impl Status {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_u16(v: u16) -> Self {
        use Status::*;
        match v {
            0x00 => Success,
            0x01 => KeyNotFound,
            0x02 => KeyExists,
            0x03 => TooBig,
            0x04 => InvalidArguments,
            0x05 => NotStored,
            0x06 => DeltaBadval,
            0x07 => NotMyVbucket,
            0x08 => NoBucket,
            0x09 => Locked,
            0x1f => AuthStale,
            0x20 => AuthError,
            0x21 => AuthContinue,
            0x22 => RangeError,
            0x23 => Rollback,
            0x24 => AccessError,
            0x25 => NotInitialized,
            0x30 => RateLimitedNetworkIngress,
            0x31 => RateLimitedNetworkEgress,
            0x32 => RateLimitedMaxConnections,
            0x33 => RateLimitedMaxCommands,
            0x34 => QuotaLimitedScope,
            0x35 => QuotaLimitedBucket,
            0x81 => UnknownCommand,
            0x82 => OutOfMemory,
            0x83 => NotSupported,
            0x84 => InternalError,
            0x85 => Busy,
            0x86 => TemporaryFailure,
            _ => Unknown,
        }
    }

    /// "The server does not speak this command" — used to degrade optional
    /// features (HELLO, GET_ERROR_MAP, CCCP) instead of failing.
    #[must_use]
    pub fn is_unsupported(self) -> bool {
        matches!(self, Status::NotSupported | Status::UnknownCommand)
    }
}

/// HELLO feature identifiers offered during session negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum HelloFeature {
    Datatype = 0x01,
    Tls = 0x02,
    TcpNodelay = 0x03,
    MutationSeqno = 0x04,
    Xattr = 0x06,
    Xerror = 0x07,
    SelectBucket = 0x08,
    Snappy = 0x0a,
    Json = 0x0b,
    UnorderedExecution = 0x0e,
    Tracing = 0x0f,
    AltRequestSupport = 0x10,
    SyncReplication = 0x11,
    Collections = 0x12,
    PreserveTtl = 0x14,
    CreateAsDeleted = 0x17,
}

impl HelloFeature {
    #[must_use]
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    #[must_use]
    pub fn from_u16(v: u16) -> Option<Self> {
        use HelloFeature::*;
        Some(match v {
            0x01 => Datatype,
            0x02 => Tls,
            0x03 => TcpNodelay,
            0x04 => MutationSeqno,
            0x06 => Xattr,
            0x07 => Xerror,
            0x08 => SelectBucket,
            0x0a => Snappy,
            0x0b => Json,
            0x0e => UnorderedExecution,
            0x0f => Tracing,
            0x10 => AltRequestSupport,
            0x11 => SyncReplication,
            0x12 => Collections,
            0x14 => PreserveTtl,
            0x17 => CreateAsDeleted,
            _ => return None,
        })
    }
}

/// Datatype field bits.
pub mod datatype {
    pub const RAW: u8 = 0x00;
    pub const JSON: u8 = 0x01;
    pub const SNAPPY: u8 = 0x02;
    pub const XATTR: u8 = 0x04;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_roundtrip() {
        for op in [
            Opcode::Get,
            Opcode::Set,
            Opcode::Stat,
            Opcode::Hello,
            Opcode::SelectBucket,
            Opcode::GetClusterConfig,
            Opcode::GetErrorMap,
        ] {
            assert_eq!(Opcode::from_u8(op.as_u8()), Some(op));
        }
        assert_eq!(Opcode::from_u8(0x7f), None);
    }

    #[test]
    fn test_status_roundtrip() {
        assert_eq!(Status::from_u16(0x07), Status::NotMyVbucket);
        assert_eq!(Status::from_u16(0x21), Status::AuthContinue);
        assert_eq!(Status::from_u16(0x9999), Status::Unknown);
    }

    #[test]
    fn test_retry_capability() {
        assert!(Opcode::Get.is_retry_capable());
        assert!(Opcode::Set.is_retry_capable());
        assert!(!Opcode::Stat.is_retry_capable());
        assert!(!Opcode::Observe.is_retry_capable());
        assert!(!Opcode::SelectBucket.is_retry_capable());
        assert!(!Opcode::GetClusterConfig.is_retry_capable());
    }

    #[test]
    fn test_unsupported_statuses() {
        assert!(Status::NotSupported.is_unsupported());
        assert!(Status::UnknownCommand.is_unsupported());
        assert!(!Status::KeyNotFound.is_unsupported());
    }

    #[test]
    fn test_hello_feature_values() {
        assert_eq!(HelloFeature::SelectBucket.as_u16(), 0x08);
        assert_eq!(HelloFeature::Xerror.as_u16(), 0x07);
        assert_eq!(HelloFeature::from_u16(0x12), Some(HelloFeature::Collections));
        assert_eq!(HelloFeature::from_u16(0x05), None);
    }
}
