//! One node of the broadcast tree as a pure state machine.
//!
//! A request enters the root carrying the engines it targets. Each node
//! forwards a copy to the children whose subtree holds a target (or, at a
//! leaf, straight to the engines) and routes replies back up. Coalescing
//! requests are answered with a single `broadcast_reply` per node holding the
//! per-target results of its subtree.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::{Duration, Instant};

use kluster_core::{EngineId, KlusterError};
use kluster_wire::messages::{
    meta, msg_types, topics, BroadcastResults, ErrorContent, FailureReason, TargetResult, STATUS_ERROR,
    STATUS_OK,
};
use kluster_wire::{Message, Routed};
use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::broadcast::tree::{BroadcastTree, TreeNode};

#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastAction {
    /// Back toward the client, through this node's inbound ROUTER.
    Up(Routed),
    /// To child 0 or 1 through its DEALER.
    Child { index: usize, routed: Routed },
    /// To an engine through the leaf's engine ROUTER.
    Engine(Routed),
    /// Copy to the hub monitor (root only).
    Monitor { topic: &'static str, routed: Routed },
}

struct PendingBroadcast {
    upstream: Vec<Vec<u8>>,
    request: Message,
    coalescing: bool,
    outstanding: BTreeSet<EngineId>,
    results: Vec<TargetResult>,
    /// Replies already sent up in non-coalescing mode.
    sent: usize,
    deadline: Instant,
}

pub struct BroadcastNode {
    tree: BroadcastTree,
    node: TreeNode,
    timeout: Duration,
    engines: BTreeMap<EngineId, String>,
    by_ident: HashMap<String, EngineId>,
    pending: HashMap<Uuid, PendingBroadcast>,
}

impl BroadcastNode {
    pub fn new(tree: BroadcastTree, id: u32, timeout: Duration) -> Result<Self, KlusterError> {
        let node = tree
            .node(id)
            .cloned()
            .ok_or_else(|| KlusterError::Config(format!("broadcast node {id} is outside the tree")))?;
        Ok(Self {
            tree,
            node,
            timeout,
            engines: BTreeMap::new(),
            by_ident: HashMap::new(),
            pending: HashMap::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.node.id
    }

    pub fn is_root(&self) -> bool {
        self.node.id == 0
    }

    pub fn is_leaf(&self) -> bool {
        self.node.is_leaf()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn engine_registered(&mut self, id: EngineId, ident: String) {
        self.by_ident.insert(ident.clone(), id);
        self.engines.insert(id, ident);
    }

    pub fn engine_unregistered(&mut self, id: EngineId) -> Vec<BroadcastAction> {
        let Some(ident) = self.engines.remove(&id) else {
            return Vec::new();
        };
        self.by_ident.remove(&ident);
        if !self.is_leaf() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        let affected: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.outstanding.contains(&id))
            .map(|(msg_id, _)| *msg_id)
            .collect();
        for msg_id in affected {
            warn!(node = self.node.id, engine_id = %id, msg_id = %msg_id, "engine lost during broadcast");
            let result = failed_result(ident.clone(), Some(id), FailureReason::EngineLost, "engine unregistered");
            self.record(msg_id, id, result, &mut actions);
        }
        actions
    }

    /// A request arriving on the inbound ROUTER.
    pub fn request(&mut self, routed: Routed, now: Instant) -> Vec<BroadcastAction> {
        let mut actions = Vec::new();
        let msg_id = routed.message.msg_id;
        if self.is_root() {
            actions.push(BroadcastAction::Monitor {
                topic: topics::BROADCAST_IN,
                routed: routed.clone(),
            });
        }
        if self.pending.contains_key(&msg_id) {
            warn!(node = self.node.id, msg_id = %msg_id, "duplicate broadcast id dropped");
            return actions;
        }

        let coalescing = routed
            .message
            .meta(meta::IS_COALESCING)
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let (targets, unknown) = self.resolve_targets(routed.message.meta(meta::TARGETS));
        let targets: BTreeSet<EngineId> = targets
            .into_iter()
            .filter(|e| self.tree.covers(self.node.id, *e))
            .collect();
        debug!(
            node = self.node.id,
            msg_id = %msg_id,
            targets = targets.len(),
            unknown = unknown.len(),
            coalescing,
            "broadcast request"
        );

        self.pending.insert(
            msg_id,
            PendingBroadcast {
                upstream: routed.idents,
                request: routed.message,
                coalescing,
                outstanding: targets.clone(),
                results: Vec::new(),
                sent: 0,
                deadline: now + self.timeout,
            },
        );

        for (name, id) in unknown {
            let result = failed_result(name, id, FailureReason::UnknownEngine, "no such engine");
            self.emit(msg_id, result, &mut actions);
        }
        self.forward(msg_id, &targets, &mut actions);
        self.finish_if_done(msg_id, &mut actions);
        actions
    }

    /// A reply from an engine on the leaf's engine ROUTER, ident already popped.
    pub fn engine_reply(&mut self, engine_ident: &[u8], reply: Routed) -> Vec<BroadcastAction> {
        let ident = String::from_utf8_lossy(engine_ident).into_owned();
        let Some(&engine_id) = self.by_ident.get(&ident) else {
            warn!(node = self.node.id, ident = %ident, "broadcast reply from unknown engine dropped");
            return Vec::new();
        };
        let Some(parent) = reply.message.parent_id else {
            warn!(node = self.node.id, engine_id = %engine_id, "broadcast reply without parent id dropped");
            return Vec::new();
        };
        let ok = reply.message.meta_str(meta::STATUS) == Some(STATUS_OK);
        let result = TargetResult {
            engine: ident,
            engine_id: Some(engine_id),
            status: if ok { STATUS_OK } else { STATUS_ERROR }.to_string(),
            reason: None,
            payload: reply.message.payload.clone(),
        };

        let mut actions = Vec::new();
        let coalescing = match self.pending.get(&parent) {
            Some(p) if p.outstanding.contains(&engine_id) => p.coalescing,
            _ => {
                debug!(node = self.node.id, engine_id = %engine_id, msg_id = %parent, "late broadcast reply dropped");
                return actions;
            }
        };
        if coalescing {
            self.record(parent, engine_id, result, &mut actions);
        } else {
            self.take_outstanding(parent, engine_id);
            self.forward_reply(parent, reply.message, &result, &mut actions);
            self.finish_if_done(parent, &mut actions);
        }
        actions
    }

    /// A reply from child `index` on its DEALER.
    pub fn child_reply(&mut self, index: usize, reply: Routed) -> Vec<BroadcastAction> {
        let mut actions = Vec::new();
        let Some(parent) = reply.message.parent_id else {
            warn!(node = self.node.id, child = index, "child reply without parent id dropped");
            return actions;
        };
        let Some(pending) = self.pending.get(&parent) else {
            debug!(node = self.node.id, child = index, msg_id = %parent, "late child reply dropped");
            return actions;
        };

        if pending.coalescing {
            let results = match reply.message.decode::<BroadcastResults>() {
                Ok(r) => r.results,
                Err(e) => {
                    warn!(node = self.node.id, child = index, error = %e, "bad coalesced reply dropped");
                    return actions;
                }
            };
            for result in results {
                match result.engine_id {
                    Some(id) => self.record(parent, id, result, &mut actions),
                    None => self.emit(parent, result, &mut actions),
                }
            }
        } else {
            let engine_id = reply
                .message
                .meta(meta::ENGINE_ID)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .map(EngineId);
            if let Some(id) = engine_id {
                self.take_outstanding(parent, id);
            }
            self.up(parent, reply.message, &mut actions);
            self.finish_if_done(parent, &mut actions);
        }
        actions
    }

    /// Expire broadcasts whose deadline passed. Only the root answers for
    /// the targets still outstanding; other nodes forget them.
    pub fn tick(&mut self, now: Instant) -> Vec<BroadcastAction> {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        let mut actions = Vec::new();
        for msg_id in expired {
            if !self.is_root() {
                debug!(node = self.node.id, msg_id = %msg_id, "broadcast expired");
                self.pending.remove(&msg_id);
                continue;
            }
            let outstanding: Vec<EngineId> = self
                .pending
                .get(&msg_id)
                .map(|p| p.outstanding.iter().copied().collect())
                .unwrap_or_default();
            warn!(msg_id = %msg_id, outstanding = outstanding.len(), "broadcast timed out");
            for id in outstanding {
                let name = self.engines.get(&id).cloned().unwrap_or_else(|| id.to_string());
                let result = failed_result(name, Some(id), FailureReason::Timeout, "broadcast deadline passed");
                self.record(msg_id, id, result, &mut actions);
            }
        }
        actions
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Targets this node can reach, plus the ones it cannot resolve.
    fn resolve_targets(&self, value: Option<&Value>) -> (BTreeSet<EngineId>, Vec<(String, Option<EngineId>)>) {
        let items: Vec<&Value> = match value {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(single) => vec![single],
        };
        if items.is_empty() {
            return (self.engines.keys().copied().collect(), Vec::new());
        }

        let mut found = BTreeSet::new();
        let mut unknown = Vec::new();
        for item in items {
            match item {
                Value::String(ident) => match self.by_ident.get(ident) {
                    Some(id) => {
                        found.insert(*id);
                    }
                    None => unknown.push((ident.clone(), None)),
                },
                other => match other.as_u64().and_then(|n| u32::try_from(n).ok()).map(EngineId) {
                    Some(id) if self.engines.contains_key(&id) => {
                        found.insert(id);
                    }
                    Some(id) => unknown.push((id.to_string(), Some(id))),
                    None => unknown.push((other.to_string(), None)),
                },
            }
        }
        (found, unknown)
    }

    fn forward(&mut self, msg_id: Uuid, targets: &BTreeSet<EngineId>, actions: &mut Vec<BroadcastAction>) {
        let Some(pending) = self.pending.get(&msg_id) else {
            return;
        };
        match self.node.children {
            Some(children) => {
                for (index, child) in children.into_iter().enumerate() {
                    let subset: Vec<u32> = targets
                        .iter()
                        .filter(|e| self.tree.covers(child, **e))
                        .map(|e| e.0)
                        .collect();
                    if subset.is_empty() {
                        continue;
                    }
                    let message = pending.request.clone().with_meta(meta::TARGETS, subset);
                    actions.push(BroadcastAction::Child {
                        index,
                        routed: Routed::bare(message),
                    });
                }
            }
            None => {
                for id in targets {
                    let Some(ident) = self.engines.get(id) else {
                        continue;
                    };
                    actions.push(BroadcastAction::Engine(Routed::new(
                        vec![ident.clone().into_bytes()],
                        pending.request.clone(),
                    )));
                }
            }
        }
    }

    fn take_outstanding(&mut self, msg_id: Uuid, engine: EngineId) -> bool {
        self.pending
            .get_mut(&msg_id)
            .is_some_and(|p| p.outstanding.remove(&engine))
    }

    /// Account for `engine`'s result, whichever mode the broadcast is in.
    fn record(&mut self, msg_id: Uuid, engine: EngineId, result: TargetResult, actions: &mut Vec<BroadcastAction>) {
        if !self.take_outstanding(msg_id, engine) {
            return;
        }
        self.emit(msg_id, result, actions);
        self.finish_if_done(msg_id, actions);
    }

    /// Deliver one target result: keep it for the aggregate, or send it up.
    fn emit(&mut self, msg_id: Uuid, result: TargetResult, actions: &mut Vec<BroadcastAction>) {
        let Some(pending) = self.pending.get_mut(&msg_id) else {
            return;
        };
        if pending.coalescing {
            pending.results.push(result);
            return;
        }
        let Some(reason) = result.reason else {
            return;
        };
        let content = ErrorContent::new(reason, format!("{}: {}", result.engine, reason));
        let message = match Message::reply_to(&pending.request, msg_types::APPLY_REPLY, &content) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast error");
                return;
            }
        };
        let mut message = message
            .with_meta(meta::STATUS, STATUS_ERROR)
            .with_meta(meta::REASON, reason.as_str())
            .with_meta(meta::BROADCAST_TARGET, result.engine.clone());
        if let Some(id) = result.engine_id {
            message = message.with_meta(meta::ENGINE_ID, id.0);
        }
        self.up(msg_id, message, actions);
    }

    fn forward_reply(&mut self, msg_id: Uuid, message: Message, result: &TargetResult, actions: &mut Vec<BroadcastAction>) {
        let mut message = message.with_meta(meta::BROADCAST_TARGET, result.engine.clone());
        if let Some(id) = result.engine_id {
            message = message.with_meta(meta::ENGINE_ID, id.0);
        }
        self.up(msg_id, message, actions);
    }

    fn up(&mut self, msg_id: Uuid, message: Message, actions: &mut Vec<BroadcastAction>) {
        let Some(pending) = self.pending.get_mut(&msg_id) else {
            return;
        };
        pending.sent += 1;
        let routed = Routed::new(pending.upstream.clone(), message);
        if self.is_root() {
            actions.push(BroadcastAction::Monitor {
                topic: topics::BROADCAST_OUT,
                routed: routed.clone(),
            });
        }
        actions.push(BroadcastAction::Up(routed));
    }

    fn finish_if_done(&mut self, msg_id: Uuid, actions: &mut Vec<BroadcastAction>) {
        let done = self.pending.get(&msg_id).is_some_and(|p| p.outstanding.is_empty());
        if !done {
            return;
        }
        let Some(pending) = self.pending.remove(&msg_id) else {
            return;
        };
        // non-coalescing replies went up one by one; only an empty broadcast still needs an answer
        if !pending.coalescing && pending.sent > 0 {
            return;
        }

        let aggregate = BroadcastResults {
            results: pending.results,
        };
        let status = if aggregate.all_ok() { STATUS_OK } else { STATUS_ERROR };
        let message = match Message::reply_to(&pending.request, msg_types::BROADCAST_REPLY, &aggregate) {
            Ok(m) => m.with_meta(meta::STATUS, status),
            Err(e) => {
                warn!(error = %e, "failed to encode broadcast reply");
                return;
            }
        };
        debug!(node = self.node.id, msg_id = %msg_id, results = aggregate.results.len(), status, "broadcast complete");
        let routed = Routed::new(pending.upstream, message);
        if self.is_root() {
            actions.push(BroadcastAction::Monitor {
                topic: topics::BROADCAST_OUT,
                routed: routed.clone(),
            });
        }
        actions.push(BroadcastAction::Up(routed));
    }
}

fn failed_result(engine: String, engine_id: Option<EngineId>, reason: FailureReason, evalue: &str) -> TargetResult {
    let payload = rmp_serde::to_vec(&ErrorContent::new(reason, evalue)).unwrap_or_default();
    TargetResult {
        engine,
        engine_id,
        status: STATUS_ERROR.to_string(),
        reason: Some(reason),
        payload,
    }
}
