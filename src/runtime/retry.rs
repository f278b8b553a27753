// SPDX-License-Identifier: MIT OR Apache-2.0

//! The retry queue: detached packets awaiting re-dispatch.
//!
//! Every queued op is indexed twice — by next-attempt time and by absolute
//! deadline — and a single timer fires at whichever head comes first. A
//! tick first fails everything past its deadline (surfacing the preserved
//! original error, never letting a bare timeout mask it), then re-routes
//! everything whose attempt time has come, and finally re-arms.
//!
//! # Example
//!
//! ```ignore
//! let (queue, sink) = RetryQueue::spawn(cmdq, settings);
//! sink.send(RetryRequest { op, reason: RetryReason::SockErr, schedule_immediately: false })?;
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::config::{ClientSettings, RetryCmdClass};
use crate::dispatch::op::PendingOp;
use crate::dispatch::{class_allows, opcode_allows_retry, policy_class, CommandQueue, RouteOutcome};
use crate::error::CouchError;
use crate::protocol::RequestPacket;

/// Why an op entered the retry queue. Maps onto the user policy classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryReason {
    TopoChange,
    SockErr,
    VbMapErr,
    MissingNode,
    NotMyVbucket,
}

/// A request to queue an op for retry.
#[derive(Debug)]
pub struct RetryRequest {
    pub op: PendingOp,
    pub reason: RetryReason,
    /// Skip the backoff interval (immediate NMV retries, fallback ops).
    pub schedule_immediately: bool,
}

/// Cheap handle pipelines use to hand ops over.
pub type RetrySink = mpsc::UnboundedSender<RetryRequest>;

/// Admission check: transient error, policy class not NONE for the
/// reason, and the opcode itself retry-capable.
#[must_use]
pub fn admit(
    packet: &RequestPacket,
    err: &CouchError,
    reason: RetryReason,
    settings: &ClientSettings,
) -> bool {
    if !err.is_transient() {
        return false;
    }
    if !opcode_allows_retry(packet.opcode) {
        return false;
    }
    let class = policy_class(&settings.retry_policy, reason);
    class_allows(class, packet)
}

/// Computes the pause before attempt `n` (1-based).
pub trait BackoffStrategy: Send + Sync + 'static {
    fn delay(&self, attempt: u32) -> Duration;
}

/// No pause between attempts. Test instrumentation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBackoff;

impl BackoffStrategy for NoBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        Duration::ZERO
    }
}

/// The queue's native schedule: `base_interval × attempt × factor`.
#[derive(Debug, Clone, Copy)]
pub struct ProportionalBackoff {
    pub base: Duration,
    pub factor: f64,
}

impl BackoffStrategy for ProportionalBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.base.mul_f64(f64::from(attempt.max(1)) * self.factor)
    }
}

#[derive(Debug)]
struct RetryOp {
    op: PendingOp,
    trytime: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    ops: HashMap<u64, RetryOp>,
    by_trytime: BTreeMap<(Instant, u64), ()>,
    by_deadline: BTreeMap<(Instant, u64), ()>,
    next_id: u64,
}

impl Inner {
    fn insert(&mut self, op: PendingOp, trytime: Instant) {
        let id = self.next_id;
        self.next_id += 1;
        self.by_trytime.insert((trytime, id), ());
        self.by_deadline.insert((op.deadline, id), ());
        self.ops.insert(id, RetryOp { op, trytime });
    }

    fn remove(&mut self, id: u64) -> Option<RetryOp> {
        let entry = self.ops.remove(&id)?;
        self.by_trytime.remove(&(entry.trytime, id));
        self.by_deadline.remove(&(entry.op.deadline, id));
        Some(entry)
    }

    fn next_wake(&self) -> Option<Instant> {
        let trytime = self.by_trytime.keys().next().map(|(t, _)| *t);
        let deadline = self.by_deadline.keys().next().map(|(t, _)| *t);
        match (trytime, deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn len(&self) -> usize {
        self.ops.len()
    }
}

/// The per-instance retry queue.
pub struct RetryQueue {
    inner: Mutex<Inner>,
    cmdq: Arc<CommandQueue>,
    settings: ClientSettings,
    backoff: Box<dyn BackoffStrategy>,
    closed: std::sync::atomic::AtomicBool,
}

impl std::fmt::Debug for RetryQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryQueue")
            .field("len", &self.len())
            .finish()
    }
}

impl RetryQueue {
    /// Create the queue and spawn its driver task. The returned sink is
    /// what pipelines and the command queue feed.
    #[must_use]
    pub fn spawn(cmdq: Arc<CommandQueue>, settings: ClientSettings) -> (Arc<Self>, RetrySink) {
        Self::spawn_with_backoff(
            cmdq,
            settings.clone(),
            Box::new(ProportionalBackoff {
                base: settings.retry_interval,
                factor: settings.retry_backoff_factor,
            }),
        )
    }

    #[must_use]
    pub fn spawn_with_backoff(
        cmdq: Arc<CommandQueue>,
        settings: ClientSettings,
        backoff: Box<dyn BackoffStrategy>,
    ) -> (Arc<Self>, RetrySink) {
        let queue = Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            cmdq,
            settings,
            backoff,
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Arc::clone(&queue).run(rx));
        (queue, tx)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().expect("retry lock").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Shift every deadline by `delta`; preserves relative durations when
    /// the clock notion changes under test hooks.
    pub fn rebase_deadlines(&self, delta: Duration, forward: bool) {
        let mut inner = self.inner.lock().expect("retry lock");
        let ids: Vec<u64> = inner.ops.keys().copied().collect();
        for id in ids {
            if let Some(mut entry) = inner.remove(id) {
                entry.op.deadline = if forward {
                    entry.op.deadline + delta
                } else {
                    entry.op.deadline.checked_sub(delta).unwrap_or(entry.op.deadline)
                };
                let trytime = entry.trytime.min(entry.op.deadline);
                inner.insert(entry.op, trytime);
            }
        }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<RetryRequest>) {
        loop {
            let next_wake = self.inner.lock().expect("retry lock").next_wake();
            let sleeper = async {
                match next_wake {
                    Some(at) => tokio::time::sleep_until(at.into()).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                req = rx.recv() => match req {
                    Some(req) => self.schedule(req),
                    None => break,
                },
                () = sleeper => self.tick(Instant::now()),
            }
        }

        // Instance is going away: fail whatever is still queued.
        let mut inner = self.inner.lock().expect("retry lock");
        let ids: Vec<u64> = inner.ops.keys().copied().collect();
        for id in ids {
            if let Some(entry) = inner.remove(id) {
                entry.op.fail(CouchError::ShuttingDown);
            }
        }
    }

    /// Fail everything queued and refuse further admissions. Called at
    /// instance teardown.
    pub fn drain_all(&self) {
        self.closed
            .store(true, std::sync::atomic::Ordering::Release);
        let mut inner = self.inner.lock().expect("retry lock");
        let ids: Vec<u64> = inner.ops.keys().copied().collect();
        for id in ids {
            if let Some(entry) = inner.remove(id) {
                entry.op.fail(CouchError::ShuttingDown);
            }
        }
    }

    fn schedule(&self, req: RetryRequest) {
        let RetryRequest {
            mut op,
            reason,
            schedule_immediately,
        } = req;
        if self.closed.load(std::sync::atomic::Ordering::Acquire) {
            op.fail(CouchError::ShuttingDown);
            return;
        }
        let now = Instant::now();

        let interval = if schedule_immediately {
            Duration::ZERO
        } else if reason == RetryReason::NotMyVbucket {
            if self.settings.nmv_retry_imm {
                Duration::ZERO
            } else {
                self.settings.retry_nmv_interval
            }
        } else if let Some(spec) = &op.retry_spec {
            // An error-map schedule overrides the client's own backoff.
            spec.next_interval(op.retries.max(1))
        } else {
            self.backoff.delay(op.retries.max(1))
        };

        if let Some(spec) = &op.retry_spec {
            if let Some(max) = spec.max_duration() {
                op.cap_deadline(max);
            }
        }

        // start ≤ trytime ≤ deadline.
        let trytime = (now + interval).min(op.deadline);
        trace!(
            ?reason,
            retries = op.retries,
            ?interval,
            "scheduling retry"
        );
        self.inner.lock().expect("retry lock").insert(op, trytime);
    }

    /// One timer pass: deadline sweep, then attempt sweep, then the caller
    /// re-arms from `next_wake`.
    fn tick(&self, now: Instant) {
        // Phase 1: deadlines.
        loop {
            let expired = {
                let inner = self.inner.lock().expect("retry lock");
                inner
                    .by_deadline
                    .keys()
                    .next()
                    .filter(|(deadline, _)| *deadline <= now)
                    .map(|(_, id)| *id)
            };
            let Some(id) = expired else { break };
            if let Some(entry) = self.inner.lock().expect("retry lock").remove(id) {
                debug!(retries = entry.op.retries, "retry op reached deadline");
                entry.op.fail(CouchError::Timeout);
            }
        }

        // Phase 2: attempts due now.
        loop {
            let due = {
                let inner = self.inner.lock().expect("retry lock");
                inner
                    .by_trytime
                    .keys()
                    .next()
                    .filter(|(trytime, _)| *trytime <= now)
                    .map(|(_, id)| *id)
            };
            let Some(id) = due else { break };
            let Some(entry) = self.inner.lock().expect("retry lock").remove(id) else {
                continue;
            };

            match self.cmdq.try_dispatch(entry.op) {
                RouteOutcome::Dispatched => {}
                RouteOutcome::NoMaster(op) => {
                    let wait_allowed = self.cmdq.is_refreshing()
                        || self.settings.retry_policy.missing_node != RetryCmdClass::None;
                    if wait_allowed {
                        let trytime = (now + self.settings.retry_interval).min(op.deadline);
                        self.inner.lock().expect("retry lock").insert(op, trytime);
                    } else {
                        op.fail(CouchError::NoMatchingServer);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::op::PendingOp;
    use crate::dispatch::vbguess::VbGuess;
    use crate::protocol::{Opcode, RequestPacket};

    fn settings() -> ClientSettings {
        ClientSettings::default()
    }

    fn bare_cmdq() -> Arc<CommandQueue> {
        Arc::new(CommandQueue::new(Arc::new(VbGuess::new())))
    }

    fn pending(opcode: Opcode, timeout: Duration) -> (PendingOp, tokio::sync::oneshot::Receiver<crate::error::Result<crate::dispatch::op::KvResponse>>) {
        PendingOp::new(RequestPacket::new(opcode).with_key(&b"k"[..]), timeout)
    }

    #[test]
    fn test_admit_matrix() {
        let s = settings();
        let get = RequestPacket::new(Opcode::Get).with_key(&b"k"[..]);
        let set = RequestPacket::new(Opcode::Set).with_key(&b"k"[..]);
        let stat = RequestPacket::new(Opcode::Stat);
        let nmv = CouchError::NotMyVbucket { vbucket: 1 };
        let net = CouchError::Network("reset".into());

        // Topo change: ALL by default.
        assert!(admit(&get, &nmv, RetryReason::NotMyVbucket, &s));
        assert!(admit(&set, &nmv, RetryReason::NotMyVbucket, &s));
        // Sock err: SAFE by default — plain SET (no CAS) refused.
        assert!(admit(&get, &net, RetryReason::SockErr, &s));
        assert!(!admit(&set, &net, RetryReason::SockErr, &s));
        // Never for STAT.
        assert!(!admit(&stat, &nmv, RetryReason::NotMyVbucket, &s));
        // Non-transient errors never admit.
        assert!(!admit(
            &get,
            &CouchError::AuthFailed("no".into()),
            RetryReason::SockErr,
            &s
        ));
    }

    #[test]
    fn test_proportional_backoff() {
        let backoff = ProportionalBackoff {
            base: Duration::from_millis(100),
            factor: 1.0,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        let scaled = ProportionalBackoff {
            base: Duration::from_millis(100),
            factor: 0.5,
        };
        assert_eq!(scaled.delay(2), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_failure_surfaces_original_error() {
        let cmdq = bare_cmdq();
        // A refresh is "in flight" forever, so the masterless op keeps
        // rescheduling until its deadline passes.
        cmdq.set_refreshing(true);
        let (_queue, sink) =
            RetryQueue::spawn_with_backoff(cmdq, settings(), Box::new(NoBackoff));

        let (mut op, rx) = pending(Opcode::Get, Duration::from_millis(200));
        op.remember_error(&CouchError::Network("reset by peer".into()));
        op.retries = 1;
        sink.send(RetryRequest {
            op,
            reason: RetryReason::SockErr,
            schedule_immediately: false,
        })
        .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        let err = rx.await.unwrap().unwrap_err();
        // The network error is preserved; TIMEOUT did not overwrite it.
        assert_eq!(err, CouchError::Network("reset by peer".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_masterless_op_waits_while_refreshing() {
        let cmdq = bare_cmdq();
        cmdq.set_refreshing(true);
        let (queue, sink) =
            RetryQueue::spawn_with_backoff(Arc::clone(&cmdq), settings(), Box::new(NoBackoff));

        let (op, mut rx) = pending(Opcode::Get, Duration::from_secs(10));
        sink.send(RetryRequest {
            op,
            reason: RetryReason::VbMapErr,
            schedule_immediately: true,
        })
        .unwrap();

        tokio::time::advance(Duration::from_millis(500)).await;
        // Still queued, not failed.
        assert!(rx.try_recv().is_err());
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_masterless_op_fails_without_refresh_or_policy() {
        let cmdq = bare_cmdq();
        let (_queue, sink) =
            RetryQueue::spawn_with_backoff(Arc::clone(&cmdq), settings(), Box::new(NoBackoff));

        let (op, rx) = pending(Opcode::Get, Duration::from_secs(10));
        sink.send(RetryRequest {
            op,
            reason: RetryReason::VbMapErr,
            schedule_immediately: true,
        })
        .unwrap();

        tokio::time::advance(Duration::from_millis(200)).await;
        assert_eq!(rx.await.unwrap().unwrap_err(), CouchError::NoMatchingServer);
    }

    #[tokio::test(start_paused = true)]
    async fn test_errmap_spec_shortens_deadline() {
        let cmdq = bare_cmdq();
        cmdq.set_refreshing(true);
        let (_queue, sink) =
            RetryQueue::spawn_with_backoff(cmdq, settings(), Box::new(NoBackoff));

        let (mut op, rx) = pending(Opcode::Get, Duration::from_secs(60));
        op.retries = 1;
        op.retry_spec = Some(
            serde_json::from_str(
                r#"{"strategy":"constant","interval":50,"max-duration":300}"#,
            )
            .unwrap(),
        );
        sink.send(RetryRequest {
            op,
            reason: RetryReason::TopoChange,
            schedule_immediately: false,
        })
        .unwrap();

        // Without the cap this would sit for a minute; max-duration shrinks
        // it to ~300ms.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rx.await.unwrap().unwrap_err(), CouchError::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_failure_drains_on_shutdown() {
        let cmdq = bare_cmdq();
        cmdq.set_refreshing(true);
        let (queue, sink) =
            RetryQueue::spawn_with_backoff(cmdq, settings(), Box::new(NoBackoff));
        let (op, rx) = pending(Opcode::Get, Duration::from_secs(60));
        sink.send(RetryRequest {
            op,
            reason: RetryReason::SockErr,
            schedule_immediately: false,
        })
        .unwrap();
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(queue.len(), 1);

        drop(sink);
        tokio::time::advance(Duration::from_millis(10)).await;
        assert_eq!(rx.await.unwrap().unwrap_err(), CouchError::ShuttingDown);
    }
}
