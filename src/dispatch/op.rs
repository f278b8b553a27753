// SPDX-License-Identifier: MIT OR Apache-2.0

//! The in-flight operation record.
//!
//! A [`PendingOp`] couples an encoded request packet with its completion
//! channel and timing state. It is the unit that moves between the command
//! queue, a pipeline's packet log, and the retry queue; the completion
//! channel travels with it, which is what makes the "exactly one final
//! callback" property hold across detach/re-dispatch cycles.

use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};
use tokio::sync::oneshot;

use crate::error::{CouchError, Result};
use crate::protocol::{Opcode, RequestPacket, ResponsePacket, RetrySpec, Status};

/// Sequence-number token for a mutation, when the server sent one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationToken {
    pub vbucket: u16,
    pub vbucket_uuid: u64,
    pub seqno: u64,
}

/// Decoded operation outcome handed to the caller.
#[derive(Debug, Clone)]
pub struct KvResponse {
    pub opcode: Opcode,
    pub status: Status,
    pub cas: u64,
    pub key: Bytes,
    pub value: Bytes,
    /// Document flags from GET-family extras.
    pub item_flags: u32,
    pub mutation_token: Option<MutationToken>,
}

impl KvResponse {
    /// Build from a wire response. `mutation_tokens` says whether mutation
    /// extras carry a token on this connection.
    #[must_use]
    pub fn from_packet(opcode: Opcode, resp: &ResponsePacket, mutation_tokens: bool) -> Self {
        let mut item_flags = 0;
        let mut mutation_token = None;
        let extras = resp.extras();
        if opcode.is_read() && extras.len() >= 4 {
            item_flags = (&extras[..4]).get_u32();
        } else if mutation_tokens && extras.len() >= 16 {
            let mut e = &extras[..16];
            mutation_token = Some(MutationToken {
                vbucket: 0, // caller fills the routed vbucket in
                vbucket_uuid: e.get_u64(),
                seqno: e.get_u64(),
            });
        }
        Self {
            opcode,
            status: resp.status(),
            cas: resp.cas(),
            key: resp.key(),
            value: resp.value(),
            item_flags,
            mutation_token,
        }
    }

    /// Counter responses carry the new value as a big-endian u64 body.
    #[must_use]
    pub fn counter_value(&self) -> Option<u64> {
        if self.value.len() == 8 {
            Some((&self.value[..]).get_u64())
        } else {
            None
        }
    }
}

/// One-shot completion side of an operation. Completing twice is a no-op;
/// the first result wins.
#[derive(Debug)]
pub struct CompletionHandle {
    tx: Option<oneshot::Sender<Result<KvResponse>>>,
}

impl CompletionHandle {
    #[must_use]
    pub fn channel() -> (Self, oneshot::Receiver<Result<KvResponse>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver the final result. Returns `false` when the op was already
    /// completed (or the caller went away).
    pub fn complete(&mut self, result: Result<KvResponse>) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }
}

/// A routed request awaiting its final result.
#[derive(Debug)]
pub struct PendingOp {
    pub packet: RequestPacket,
    pub completion: CompletionHandle,
    /// Original submission time.
    pub start: Instant,
    /// Absolute deadline; preserved across retries.
    pub deadline: Instant,
    /// Attempts made so far (0 on first dispatch).
    pub retries: u32,
    /// First non-downgrade error observed.
    pub orig_err: Option<CouchError>,
    /// Error-map schedule attached by a mapped status, if any.
    pub retry_spec: Option<RetrySpec>,
}

impl PendingOp {
    #[must_use]
    pub fn new(packet: RequestPacket, timeout: Duration) -> (Self, oneshot::Receiver<Result<KvResponse>>) {
        let (completion, rx) = CompletionHandle::channel();
        let now = Instant::now();
        (
            Self {
                packet,
                completion,
                start: now,
                deadline: now + timeout,
                retries: 0,
                orig_err: None,
                retry_spec: None,
            },
            rx,
        )
    }

    /// Record an error without completing. A timeout never displaces a
    /// more specific earlier error; anything specific displaces a timeout.
    pub fn remember_error(&mut self, err: &CouchError) {
        match &self.orig_err {
            None => self.orig_err = Some(err.clone()),
            Some(existing) if existing.is_downgrade() && !err.is_downgrade() => {
                self.orig_err = Some(err.clone());
            }
            Some(_) => {}
        }
    }

    /// The error this op should surface if it gives up now.
    #[must_use]
    pub fn surfaced_error(&self, fallback: CouchError) -> CouchError {
        match &self.orig_err {
            Some(e) if !e.is_downgrade() => e.clone(),
            _ => fallback,
        }
    }

    /// Fail terminally, preferring the preserved original error.
    pub fn fail(mut self, err: CouchError) {
        let surfaced = self.surfaced_error(err);
        self.completion.complete(Err(surfaced));
    }

    /// Succeed with a decoded response.
    pub fn succeed(mut self, resp: KvResponse) {
        self.completion.complete(Ok(resp));
    }

    /// Detach the packet buffers and clear pipeline-transient flags so the
    /// op can be re-dispatched later.
    pub fn detach(&mut self) {
        self.packet = self.packet.detach();
    }

    #[must_use]
    pub fn time_left(&self, now: Instant) -> Duration {
        self.deadline.saturating_duration_since(now)
    }

    /// Tighten the deadline per an error-map `max-duration`.
    pub fn cap_deadline(&mut self, max_duration: Duration) {
        let cap = self.start + max_duration;
        if cap < self.deadline {
            self.deadline = cap;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestPacket;

    fn op() -> (PendingOp, oneshot::Receiver<Result<KvResponse>>) {
        PendingOp::new(
            RequestPacket::new(Opcode::Get).with_key(&b"k"[..]),
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_completion_fires_once() {
        let (mut handle, mut rx) = CompletionHandle::channel();
        assert!(handle.complete(Err(CouchError::Timeout)));
        assert!(!handle.complete(Err(CouchError::KeyNotFound)));
        assert!(handle.is_completed());
        assert_eq!(rx.try_recv().unwrap().unwrap_err(), CouchError::Timeout);
    }

    #[test]
    fn test_orig_err_preservation() {
        let (mut op, _rx) = op();
        op.remember_error(&CouchError::Timeout);
        op.remember_error(&CouchError::Network("reset".into()));
        // Specific error displaced the timeout.
        assert_eq!(
            op.surfaced_error(CouchError::Timeout),
            CouchError::Network("reset".into())
        );
        // A later timeout does not win it back.
        op.remember_error(&CouchError::Timeout);
        assert_eq!(
            op.surfaced_error(CouchError::Timeout),
            CouchError::Network("reset".into())
        );
    }

    #[test]
    fn test_fail_surfaces_original() {
        let (mut op, mut rx) = op();
        op.remember_error(&CouchError::NoMatchingServer);
        op.fail(CouchError::Timeout);
        assert_eq!(
            rx.try_recv().unwrap().unwrap_err(),
            CouchError::NoMatchingServer
        );
    }

    #[test]
    fn test_cap_deadline_only_shrinks() {
        let (mut op, _rx) = op();
        let original = op.deadline;
        op.cap_deadline(Duration::from_secs(30));
        assert_eq!(op.deadline, original);
        op.cap_deadline(Duration::from_millis(10));
        assert!(op.deadline < original);
    }

    #[test]
    fn test_invariant_start_before_deadline() {
        let (op, _rx) = op();
        assert!(op.start <= op.deadline);
    }
}
