// SPDX-License-Identifier: MIT OR Apache-2.0

//! Command fan-out: mapping each operation to the pipeline that owns its
//! key, with a fallback into the retry queue when no mapping exists.
//!
//! - [`op`] — the in-flight operation record and completion contract
//! - [`vbguess`] — heuristic NOT_MY_VBUCKET remap hints
//!
//! Routing consults, in order: an explicit forwarding index (`UFWD`
//! packets), the vbguess hint table, then the authoritative vbucket map or
//! ketama ring from the current config.

pub mod op;
pub mod vbguess;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

use tracing::{debug, trace};

use crate::config::{RetryCmdClass, RetryPolicyTable};
use crate::dispatch::op::PendingOp;
use crate::dispatch::vbguess::VbGuess;
use crate::error::CouchError;
use crate::pipeline::{Pipeline, PipelineContext};
use crate::protocol::{Opcode, PacketFlags, RequestPacket};
use crate::runtime::retry::{RetryReason, RetryRequest, RetrySink};
use crate::topology::{Distribution, SharedConfig};

/// Outcome of a routing attempt, for callers that need to know (the retry
/// queue's tick).
#[derive(Debug)]
pub enum RouteOutcome {
    Dispatched,
    /// No pipeline currently owns the key. The op is returned untouched.
    NoMaster(PendingOp),
}

#[derive(Default)]
struct RouteState {
    config: Option<SharedConfig>,
    pipelines: Vec<Pipeline>,
}

/// The per-instance command queue.
pub struct CommandQueue {
    state: RwLock<RouteState>,
    vbguess: Arc<VbGuess>,
    retry_tx: OnceLock<RetrySink>,
    pipeline_ctx: OnceLock<PipelineContext>,
    /// Set by the monitor while a refresh is in flight; consulted by the
    /// retry tick to decide whether masterless ops should wait.
    refreshing: AtomicBool,
}

impl std::fmt::Debug for CommandQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read().expect("route lock");
        f.debug_struct("CommandQueue")
            .field("pipelines", &state.pipelines.len())
            .field("has_config", &state.config.is_some())
            .finish()
    }
}

impl CommandQueue {
    #[must_use]
    pub fn new(vbguess: Arc<VbGuess>) -> Self {
        Self {
            state: RwLock::new(RouteState::default()),
            vbguess,
            retry_tx: OnceLock::new(),
            pipeline_ctx: OnceLock::new(),
            refreshing: AtomicBool::new(false),
        }
    }

    /// Late-bound wiring, called once during instance construction.
    pub fn wire(&self, retry_tx: RetrySink, pipeline_ctx: PipelineContext) {
        let _ = self.retry_tx.set(retry_tx);
        let _ = self.pipeline_ctx.set(pipeline_ctx);
    }

    #[must_use]
    pub fn vbguess(&self) -> &Arc<VbGuess> {
        &self.vbguess
    }

    pub fn set_refreshing(&self, refreshing: bool) {
        self.refreshing.store(refreshing, Ordering::Release);
    }

    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn current_config(&self) -> Option<SharedConfig> {
        self.state.read().expect("route lock").config.clone()
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.state.read().expect("route lock").pipelines.len()
    }

    #[must_use]
    pub fn pipeline_at(&self, index: usize) -> Option<Pipeline> {
        self.state
            .read()
            .expect("route lock")
            .pipelines
            .get(index)
            .cloned()
    }

    /// Address list of the live pipelines, for providers piggybacking on
    /// existing connections.
    #[must_use]
    pub fn pipeline_addresses(&self) -> Vec<(usize, String, u16)> {
        self.state
            .read()
            .expect("route lock")
            .pipelines
            .iter()
            .map(|p| (p.index(), p.host().to_string(), p.port()))
            .collect()
    }

    /// Rebuild the pipeline set for a newly accepted config. Pipelines
    /// whose `(host, port)` survive are kept with their connections and
    /// in-flight traffic; removed nodes are closed; new nodes are spawned.
    pub fn apply_config(&self, config: SharedConfig) {
        let ctx = self
            .pipeline_ctx
            .get()
            .expect("command queue used before wiring");
        let tls = ctx.is_tls;

        let addresses: Vec<(String, u16)> = match &config.vbmap {
            Some(map) => map
                .server_list()
                .iter()
                .filter_map(|s| {
                    let (host, port) = s.rsplit_once(':')?;
                    Some((host.to_string(), port.parse().ok()?))
                })
                .collect(),
            None => config
                .nodes
                .iter()
                .filter_map(|n| n.kv_address(tls))
                .collect(),
        };

        let mut state = self.state.write().expect("route lock");
        let old = std::mem::take(&mut state.pipelines);
        let mut kept = 0usize;
        let mut pipelines = Vec::with_capacity(addresses.len());
        let mut reusable: Vec<Option<Pipeline>> = old.into_iter().map(Some).collect();

        for (index, (host, port)) in addresses.iter().enumerate() {
            let found = reusable.iter_mut().find_map(|slot| {
                let matches = slot.as_ref().is_some_and(|p| {
                    p.host() == host.as_str() && p.port() == *port && p.index() == index
                });
                if matches {
                    slot.take()
                } else {
                    None
                }
            });
            match found {
                Some(p) => {
                    kept += 1;
                    pipelines.push(p);
                }
                None => {
                    let mut node_ctx = ctx.clone();
                    node_ctx.bucket = config
                        .bucket_name
                        .clone()
                        .or_else(|| node_ctx.bucket.clone());
                    pipelines.push(Pipeline::spawn(index, host.clone(), *port, node_ctx));
                }
            }
        }
        for leftover in reusable.into_iter().flatten() {
            leftover.retire();
        }
        debug!(
            total = pipelines.len(),
            kept, "pipelines rebuilt for new config"
        );
        state.pipelines = pipelines;
        state.config = Some(config);
        drop(state);

        // Hints predate the authoritative map; drop them.
        self.vbguess.clear();
    }

    /// Route an op by its key and send it to the owning pipeline. `replica`
    /// 0 targets the master.
    pub fn dispatch(&self, mut op: PendingOp, replica: usize) {
        let state = self.state.read().expect("route lock");
        let npipelines = state.pipelines.len();

        let index = match state.config.as_deref() {
            Some(config) => match config.distribution {
                Distribution::Vbucket => config.vbmap.as_ref().and_then(|map| {
                    let (vbucket, master) = map.master_for_key(&op.packet.key);
                    op.packet.vbucket = vbucket;
                    if replica == 0 {
                        self.vbguess
                            .lookup(vbucket, master, npipelines)
                            .or(master)
                    } else {
                        map.server_for(vbucket, replica)
                    }
                }),
                Distribution::Ketama => config
                    .ketama
                    .as_ref()
                    .and_then(|ring| ring.lookup(&op.packet.key)),
            },
            None => None,
        };

        match index.and_then(|i| state.pipelines.get(i)) {
            Some(pipeline) => {
                trace!(
                    opcode = ?op.packet.opcode,
                    index = pipeline.index(),
                    vbucket = op.packet.vbucket,
                    "routed"
                );
                pipeline.dispatch(op);
            }
            None => {
                drop(state);
                self.fallback(op);
            }
        }
    }

    /// Forward an op straight to a pipeline index, bypassing the map.
    /// Used by providers piggybacking protocol requests on existing
    /// connections.
    pub fn dispatch_to(&self, index: usize, mut op: PendingOp) {
        op.packet.flags.set(PacketFlags::UFWD);
        match self.pipeline_at(index) {
            Some(pipeline) => pipeline.dispatch(op),
            None => op.fail(CouchError::NoMatchingServer),
        }
    }

    /// Route without falling back; used by the retry tick, which applies
    /// its own masterless policy.
    pub fn try_dispatch(&self, mut op: PendingOp) -> RouteOutcome {
        let state = self.state.read().expect("route lock");
        let index = match state.config.as_deref() {
            Some(config) => match config.distribution {
                Distribution::Vbucket => config.vbmap.as_ref().and_then(|map| {
                    let (vbucket, master) = map.master_for_key(&op.packet.key);
                    op.packet.vbucket = vbucket;
                    self.vbguess
                        .lookup(vbucket, master, state.pipelines.len())
                        .or(master)
                }),
                Distribution::Ketama => config
                    .ketama
                    .as_ref()
                    .and_then(|ring| ring.lookup(&op.packet.key)),
            },
            None => None,
        };
        match index.and_then(|i| state.pipelines.get(i)) {
            Some(pipeline) => {
                pipeline.dispatch(op);
                RouteOutcome::Dispatched
            }
            None => RouteOutcome::NoMaster(op),
        }
    }

    /// No mappable node: detach the op into the retry queue marked
    /// `NoMatchingServer`; the tick decides whether to wait for a config
    /// or give up.
    pub fn fallback(&self, mut op: PendingOp) {
        debug!(opcode = ?op.packet.opcode, "no mappable node, deferring to retry queue");
        op.remember_error(&CouchError::NoMatchingServer);
        op.detach();
        op.retries = op.retries.saturating_add(1);
        let Some(retry_tx) = self.retry_tx.get() else {
            op.fail(CouchError::NoMatchingServer);
            return;
        };
        let request = RetryRequest {
            op,
            reason: RetryReason::VbMapErr,
            schedule_immediately: true,
        };
        if let Err(tokio::sync::mpsc::error::SendError(request)) = retry_tx.send(request) {
            request.op.fail(CouchError::ShuttingDown);
        }
    }

    /// Close every pipeline; used at instance teardown.
    pub fn close_all(&self) {
        let mut state = self.state.write().expect("route lock");
        for pipeline in state.pipelines.drain(..) {
            pipeline.close();
        }
        state.config = None;
    }
}

/// Whether a command class permits retrying this packet.
#[must_use]
pub fn class_allows(class: RetryCmdClass, packet: &RequestPacket) -> bool {
    match class {
        RetryCmdClass::All => true,
        RetryCmdClass::Get => packet.opcode.is_read(),
        // "Safe": reads, plus mutations pinned by a CAS (replay cannot
        // clobber a concurrent write).
        RetryCmdClass::Safe => packet.opcode.is_read() || packet.cas != 0,
        RetryCmdClass::None => false,
    }
}

/// Map a retry reason to the policy class configured for it.
#[must_use]
pub fn policy_class(policy: &RetryPolicyTable, reason: RetryReason) -> RetryCmdClass {
    use crate::config::RetryMode;
    let mode = match reason {
        RetryReason::TopoChange | RetryReason::NotMyVbucket => RetryMode::TopoChange,
        RetryReason::SockErr => RetryMode::SockErr,
        RetryReason::VbMapErr => RetryMode::VbMapErr,
        RetryReason::MissingNode => RetryMode::MissingNode,
    };
    policy.class_for(mode)
}

/// Per-opcode override of the class check: some opcodes never enter the
/// retry queue regardless of policy.
#[must_use]
pub fn opcode_allows_retry(opcode: Opcode) -> bool {
    opcode.is_retry_capable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryCmdClass;
    use crate::protocol::Opcode;

    fn packet(opcode: Opcode, cas: u64) -> RequestPacket {
        let mut p = RequestPacket::new(opcode).with_key(&b"k"[..]);
        p.cas = cas;
        p
    }

    #[test]
    fn test_class_allows() {
        assert!(class_allows(RetryCmdClass::All, &packet(Opcode::Set, 0)));
        assert!(class_allows(RetryCmdClass::Get, &packet(Opcode::Get, 0)));
        assert!(!class_allows(RetryCmdClass::Get, &packet(Opcode::Set, 0)));
        assert!(class_allows(RetryCmdClass::Safe, &packet(Opcode::Set, 42)));
        assert!(!class_allows(RetryCmdClass::Safe, &packet(Opcode::Set, 0)));
        assert!(!class_allows(RetryCmdClass::None, &packet(Opcode::Get, 0)));
    }

    #[test]
    fn test_opcode_retry_exclusions() {
        assert!(!opcode_allows_retry(Opcode::Stat));
        assert!(!opcode_allows_retry(Opcode::Observe));
        assert!(!opcode_allows_retry(Opcode::SelectBucket));
        assert!(!opcode_allows_retry(Opcode::GetClusterConfig));
        assert!(opcode_allows_retry(Opcode::Get));
        assert!(opcode_allows_retry(Opcode::Delete));
    }

    #[test]
    fn test_policy_class_mapping() {
        let policy = RetryPolicyTable::default();
        assert_eq!(
            policy_class(&policy, RetryReason::NotMyVbucket),
            RetryCmdClass::All
        );
        assert_eq!(
            policy_class(&policy, RetryReason::SockErr),
            RetryCmdClass::Safe
        );
        assert_eq!(
            policy_class(&policy, RetryReason::MissingNode),
            RetryCmdClass::None
        );
    }
}
