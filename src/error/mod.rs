// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error types and the retry taxonomy.
//!
//! Every fallible path in the crate returns [`CouchError`]. Errors are
//! grouped into kinds ([`ErrorKind`]) that drive two decisions elsewhere in
//! the runtime: whether a failed packet may enter the retry queue, and
//! whether a later, less specific error (a timeout) is allowed to replace an
//! earlier one when a retried operation finally gives up.

use thiserror::Error;

use crate::protocol::Status;

#[allow(clippy::result_large_err)]
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CouchError {
    #[error("Connect failed: {0}")]
    ConnectError(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("DNS resolution failed: {0}")]
    DnsFailure(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Not my vbucket (vb {vbucket} rerouted by server)")]
    NotMyVbucket { vbucket: u16 },

    #[error("No server maps to the requested key")]
    NoMatchingServer,

    #[error("Cluster map changed during the operation")]
    MapChanged,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Bucket not found: {0}")]
    BucketNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("No usable SASL mechanism: {0}")]
    SaslMechUnavailable(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Rate limited by the server")]
    RateLimited,

    #[error("Quota limited by the server")]
    QuotaLimited,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Unknown or unsupported option: {0}")]
    UnknownOption(String),

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(i32),

    #[error("Request canceled")]
    RequestCanceled,

    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already exists (or CAS mismatch)")]
    KeyExists,

    #[error("Document is locked")]
    DocumentLocked,

    #[error("Value too large")]
    TooBig,

    #[error("Item not stored")]
    NotStored,

    #[error("Invalid delta for counter operation")]
    DeltaBadval,

    #[error("Temporary failure from server")]
    TemporaryFailure,

    #[error("Server error (status {status:#06x}): {message}")]
    ServerError { status: u16, message: String },

    #[error("Client is shutting down")]
    ShuttingDown,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CouchError>;

/// Broad classification used by the dispatch and retry machinery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connect failures, resets, DNS problems. Retryable, triggers a
    /// config refresh.
    Network,
    /// Deadline expiry. Never masks a previously recorded error.
    Timeout,
    /// NOT_MY_VBUCKET, no-matching-server, map-changed. Retryable,
    /// triggers a config refresh.
    Topology,
    /// Auth failures, bucket-not-found, access denied. Fatal to the packet.
    Auth,
    /// Wire-format violations. Fatal to the connection.
    Protocol,
    /// Rate/quota limiting. Surfaced distinctly, not auto-retried.
    Throttling,
    /// Caller mistakes. Never touch the retry machinery.
    Usage,
    /// Data-level outcomes (miss, exists, locked...). Final.
    Data,
    /// Everything else.
    Internal,
}

impl CouchError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            CouchError::ConnectError(_) | CouchError::Network(_) | CouchError::DnsFailure(_) => {
                ErrorKind::Network
            }
            CouchError::Timeout => ErrorKind::Timeout,
            CouchError::NotMyVbucket { .. }
            | CouchError::NoMatchingServer
            | CouchError::MapChanged => ErrorKind::Topology,
            CouchError::AuthFailed(_)
            | CouchError::BucketNotFound(_)
            | CouchError::AccessDenied(_)
            | CouchError::SaslMechUnavailable(_) => ErrorKind::Auth,
            CouchError::Protocol(_) => ErrorKind::Protocol,
            CouchError::RateLimited | CouchError::QuotaLimited => ErrorKind::Throttling,
            CouchError::InvalidArgument(_)
            | CouchError::UnknownOption(_)
            | CouchError::TooManyRedirects(_)
            | CouchError::RequestCanceled => ErrorKind::Usage,
            CouchError::KeyNotFound
            | CouchError::KeyExists
            | CouchError::DocumentLocked
            | CouchError::TooBig
            | CouchError::NotStored
            | CouchError::DeltaBadval
            | CouchError::TemporaryFailure
            | CouchError::ServerError { .. } => ErrorKind::Data,
            CouchError::ShuttingDown | CouchError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a packet failing with this error is a candidate for the
    /// retry queue (user policy and per-opcode rules still apply).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Network | ErrorKind::Topology | ErrorKind::Timeout
        )
    }

    /// Whether this error may be overwritten by a more specific one in the
    /// retry queue's preserved-error slot. Only generic timeouts yield.
    #[must_use]
    pub fn is_downgrade(&self) -> bool {
        matches!(self, CouchError::Timeout)
    }

    /// Map a non-success memcached status to the matching error.
    #[must_use]
    pub fn from_status(status: Status, vbucket: u16) -> Self {
        match status {
            Status::KeyNotFound => CouchError::KeyNotFound,
            Status::KeyExists => CouchError::KeyExists,
            Status::TooBig => CouchError::TooBig,
            Status::InvalidArguments => {
                CouchError::InvalidArgument("rejected by server".to_string())
            }
            Status::NotStored => CouchError::NotStored,
            Status::DeltaBadval => CouchError::DeltaBadval,
            Status::NotMyVbucket => CouchError::NotMyVbucket { vbucket },
            Status::NoBucket => CouchError::BucketNotFound("no bucket selected".to_string()),
            Status::Locked => CouchError::DocumentLocked,
            Status::AuthStale | Status::AuthError => {
                CouchError::AuthFailed("authentication rejected".to_string())
            }
            Status::AccessError => CouchError::AccessDenied("access denied".to_string()),
            Status::RateLimitedNetworkIngress
            | Status::RateLimitedNetworkEgress
            | Status::RateLimitedMaxConnections
            | Status::RateLimitedMaxCommands => CouchError::RateLimited,
            Status::QuotaLimitedScope | Status::QuotaLimitedBucket => CouchError::QuotaLimited,
            Status::TemporaryFailure | Status::Busy => CouchError::TemporaryFailure,
            Status::OutOfMemory => CouchError::ServerError {
                status: status.as_u16(),
                message: "server out of memory".to_string(),
            },
            other => CouchError::ServerError {
                status: other.as_u16(),
                message: format!("{other:?}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        assert_eq!(
            CouchError::ConnectError("x".into()).kind(),
            ErrorKind::Network
        );
        assert_eq!(CouchError::Timeout.kind(), ErrorKind::Timeout);
        assert_eq!(
            CouchError::NotMyVbucket { vbucket: 12 }.kind(),
            ErrorKind::Topology
        );
        assert_eq!(CouchError::RateLimited.kind(), ErrorKind::Throttling);
        assert_eq!(
            CouchError::UnknownOption("nope".into()).kind(),
            ErrorKind::Usage
        );
    }

    #[test]
    fn test_transient() {
        assert!(CouchError::Network("reset".into()).is_transient());
        assert!(CouchError::NoMatchingServer.is_transient());
        assert!(CouchError::Timeout.is_transient());
        assert!(!CouchError::AuthFailed("no".into()).is_transient());
        assert!(!CouchError::InvalidArgument("bad".into()).is_transient());
    }

    #[test]
    fn test_timeout_is_only_downgrade() {
        assert!(CouchError::Timeout.is_downgrade());
        assert!(!CouchError::Network("reset".into()).is_downgrade());
        assert!(!CouchError::NoMatchingServer.is_downgrade());
    }

    #[test]
    fn test_from_status() {
        assert_eq!(
            CouchError::from_status(Status::KeyNotFound, 0),
            CouchError::KeyNotFound
        );
        assert_eq!(
            CouchError::from_status(Status::NotMyVbucket, 99),
            CouchError::NotMyVbucket { vbucket: 99 }
        );
        assert_eq!(
            CouchError::from_status(Status::RateLimitedMaxCommands, 0),
            CouchError::RateLimited
        );
    }
}
