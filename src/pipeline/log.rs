// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-pipeline packet log: the FIFO of in-flight requests.
//!
//! Entries are keyed by opaque for O(1) response matching, while a
//! separate order list preserves submission order (opaques are strictly
//! increasing per pipeline, so order-list order equals opaque order).
//! Removal from the middle leaves a tombstone in the order list that is
//! skipped lazily.

use std::collections::{HashMap, VecDeque};
use std::time::Instant;

use crate::dispatch::op::PendingOp;

#[derive(Debug, Default)]
pub struct PacketLog {
    by_opaque: HashMap<u32, PendingOp>,
    order: VecDeque<u32>,
    last_opaque: Option<u32>,
}

impl PacketLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an op that has just been written toward the socket.
    ///
    /// Panics in debug builds if opaques are not strictly increasing,
    /// which would break response matching.
    pub fn push(&mut self, op: PendingOp) {
        let opaque = op.packet.opaque;
        if let Some(last) = self.last_opaque {
            debug_assert!(
                opaque > last || opaque < last / 2, // wrap tolerance
                "opaque {opaque} not increasing after {last}"
            );
        }
        self.last_opaque = Some(opaque);
        self.order.push_back(opaque);
        self.by_opaque.insert(opaque, op);
    }

    /// Locate an in-flight op without removing it (streaming responses).
    #[must_use]
    pub fn find(&self, opaque: u32) -> Option<&PendingOp> {
        self.by_opaque.get(&opaque)
    }

    /// Detach an op from the log.
    pub fn remove(&mut self, opaque: u32) -> Option<PendingOp> {
        let op = self.by_opaque.remove(&opaque);
        self.compact_front();
        op
    }

    fn compact_front(&mut self) {
        while let Some(front) = self.order.front() {
            if self.by_opaque.contains_key(front) {
                break;
            }
            self.order.pop_front();
        }
    }

    /// Oldest still-in-flight op's deadline, for io-timer extension.
    #[must_use]
    pub fn oldest_deadline(&self) -> Option<Instant> {
        self.order
            .iter()
            .find_map(|o| self.by_opaque.get(o))
            .map(|op| op.deadline)
    }

    /// Remove and return every op whose deadline has passed.
    pub fn take_expired(&mut self, now: Instant) -> Vec<PendingOp> {
        let expired: Vec<u32> = self
            .by_opaque
            .iter()
            .filter(|(_, op)| op.deadline <= now)
            .map(|(o, _)| *o)
            .collect();
        let mut out = Vec::with_capacity(expired.len());
        for opaque in expired {
            if let Some(op) = self.by_opaque.remove(&opaque) {
                out.push(op);
            }
        }
        self.compact_front();
        out
    }

    /// Drain every op in submission order; used by `fail_chain`.
    pub fn drain(&mut self) -> Vec<PendingOp> {
        let mut out = Vec::with_capacity(self.by_opaque.len());
        while let Some(opaque) = self.order.pop_front() {
            if let Some(op) = self.by_opaque.remove(&opaque) {
                out.push(op);
            }
        }
        self.last_opaque = None;
        out
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_opaque.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_opaque.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Opcode, RequestPacket};
    use std::time::Duration;

    fn op_with_opaque(opaque: u32, timeout: Duration) -> PendingOp {
        let mut packet = RequestPacket::new(Opcode::Get).with_key(&b"k"[..]);
        packet.opaque = opaque;
        let (op, _rx) = PendingOp::new(packet, timeout);
        // The receiver is dropped; completion results go nowhere, which is
        // fine for log bookkeeping tests.
        op
    }

    #[test]
    fn test_push_find_remove() {
        let mut log = PacketLog::new();
        log.push(op_with_opaque(1, Duration::from_secs(1)));
        log.push(op_with_opaque(2, Duration::from_secs(1)));
        log.push(op_with_opaque(3, Duration::from_secs(1)));

        assert_eq!(log.len(), 3);
        assert!(log.find(2).is_some());
        assert!(log.find(9).is_none());

        let removed = log.remove(2).unwrap();
        assert_eq!(removed.packet.opaque, 2);
        assert_eq!(log.len(), 2);
        assert!(log.find(2).is_none());
    }

    #[test]
    fn test_fifo_drain_order() {
        let mut log = PacketLog::new();
        for opaque in [5, 6, 7, 8] {
            log.push(op_with_opaque(opaque, Duration::from_secs(1)));
        }
        log.remove(6);
        let drained = log.drain();
        let opaques: Vec<u32> = drained.iter().map(|o| o.packet.opaque).collect();
        assert_eq!(opaques, vec![5, 7, 8]);
        assert!(log.is_empty());
    }

    #[test]
    fn test_oldest_deadline_skips_removed() {
        let mut log = PacketLog::new();
        log.push(op_with_opaque(1, Duration::from_millis(100)));
        log.push(op_with_opaque(2, Duration::from_secs(10)));
        let first = log.oldest_deadline().unwrap();
        log.remove(1);
        let second = log.oldest_deadline().unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_take_expired() {
        let mut log = PacketLog::new();
        log.push(op_with_opaque(1, Duration::from_millis(0)));
        log.push(op_with_opaque(2, Duration::from_secs(60)));

        let expired = log.take_expired(Instant::now() + Duration::from_millis(5));
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].packet.opaque, 1);
        assert_eq!(log.len(), 1);
    }
}
