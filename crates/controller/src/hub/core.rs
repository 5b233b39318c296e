//! Hub state machine: engine registration, heartbeats, the monitor tap and
//! client queries.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

use chrono::Utc;
use kluster_core::{ControllerConfig, EngineId};
use kluster_wire::messages::{
    meta, msg_types, topics, ConnectionReply, EngineNotification, EngineQueueStatus, ErrorContent, FailureReason,
    HistoryReply, PurgeRequest, QueueReply, QueueRequest, RegistrationReply, RegistrationRequest, ReplyStatus,
    ResultReply, ResultRequest, StatusReply, TaskRecord, UnregistrationRequest, STATUS_ERROR, STATUS_OK,
};
use kluster_wire::{Message, Routed};
use serde::Serialize;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::broadcast::BroadcastTree;
use crate::db::{RecordUpdate, TaskDb};
use crate::hub::heartbeat::{HeartMonitor, Pong};
use crate::hub::registry::{EngineRegistry, EngineStateFile, Liveness};

/// Side effects requested by the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum HubAction {
    /// Answer on the registration/query ROUTER.
    Reply(Routed),
    /// Publish on the heartbeat ping socket.
    Ping(Vec<u8>),
    /// Publish on the notification socket.
    Notify { topic: &'static str, message: Message },
    /// Write the engine table to disk.
    PersistEngines(EngineStateFile),
    /// Stop the whole controller.
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct HubSettings {
    pub heartbeat_period: Duration,
    pub heartbeat_max_missed: u32,
    pub registration_timeout: Duration,
    pub broadcast_depth: u32,
    pub broadcast_slots: u32,
    pub persist_engines: bool,
}

impl HubSettings {
    pub fn from_config(config: &ControllerConfig) -> Self {
        Self {
            heartbeat_period: config.heartbeat_period(),
            heartbeat_max_missed: config.heartbeat_max_missed,
            registration_timeout: config.registration_timeout(),
            broadcast_depth: config.broadcast_depth,
            broadcast_slots: u32::try_from(config.broadcast_slots).unwrap_or(u32::MAX),
            persist_engines: config.restore_engines,
        }
    }
}

pub struct Hub {
    settings: HubSettings,
    registry: EngineRegistry,
    heart: HeartMonitor,
    tree: BroadcastTree,
    db: Box<dyn TaskDb>,
    /// Submitted to the task scheduler, not yet dispatched.
    unassigned: BTreeSet<Uuid>,
    /// Every request seen and not yet answered.
    pending: HashSet<Uuid>,
}

impl Hub {
    pub fn new(settings: HubSettings, registry: EngineRegistry, db: Box<dyn TaskDb>) -> Self {
        Self {
            heart: HeartMonitor::new(settings.heartbeat_max_missed),
            tree: BroadcastTree::build(settings.broadcast_depth, settings.broadcast_slots),
            settings,
            registry,
            db,
            unassigned: BTreeSet::new(),
            pending: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &EngineRegistry {
        &self.registry
    }

    pub fn unassigned_count(&self) -> usize {
        self.unassigned.len()
    }

    pub fn is_pending(&self, msg_id: &Uuid) -> bool {
        self.pending.contains(msg_id)
    }

    // ── Heartbeat ────────────────────────────────────────────────────

    /// One heartbeat period elapsed.
    pub fn beat(&mut self, now: Instant) -> Vec<HubAction> {
        let mut actions = Vec::new();
        let (ping, failed) = self.heart.beat();
        for ident in failed {
            let ident = String::from_utf8_lossy(&ident).into_owned();
            if let Some(id) = self.registry.id_of(&ident) {
                warn!(engine_id = %id, ident = %ident, "engine missed too many heartbeats");
                self.drop_engine(id, &mut actions);
            }
        }
        for id in self.registry.expired_unknown(now, self.settings.registration_timeout) {
            warn!(engine_id = %id, "engine never sent a heartbeat, purging registration");
            self.drop_engine(id, &mut actions);
        }
        actions.push(HubAction::Ping(ping));
        actions
    }

    /// A pong arrived from `ident`.
    pub fn pong(&mut self, ident: &[u8], payload: &[u8]) -> Vec<HubAction> {
        let ident = String::from_utf8_lossy(ident).into_owned();
        if self.registry.id_of(&ident).is_none() {
            trace!(ident = %ident, "pong from unregistered heart ignored");
            return Vec::new();
        }
        if self.heart.pong(ident.as_bytes(), payload) == Pong::Stale {
            return Vec::new();
        }
        let Some(id) = self.registry.mark_alive(&ident) else {
            return Vec::new();
        };
        info!(engine_id = %id, ident = %ident, "engine registered");
        notification(topics::REGISTRATION_NOTIFICATION, id, &ident)
            .map(|message| {
                vec![HubAction::Notify {
                    topic: topics::REGISTRATION_NOTIFICATION,
                    message,
                }]
            })
            .unwrap_or_default()
    }

    /// Remove an engine, fail its direct requests and tell the schedulers.
    fn drop_engine(&mut self, id: EngineId, actions: &mut Vec<HubAction>) {
        let Ok(entry) = self.registry.unregister(id) else {
            return;
        };
        self.heart.forget(entry.ident.as_bytes());

        let now = Utc::now();
        for msg_id in &entry.queue {
            self.pending.remove(msg_id);
            let payload = rmp_serde::to_vec(&ErrorContent::new(FailureReason::EngineLost, "engine went away")).ok();
            self.update(
                *msg_id,
                RecordUpdate {
                    completed: Some(now),
                    status: Some(STATUS_ERROR.into()),
                    result_payload: payload,
                    ..Default::default()
                },
            );
        }
        if !entry.queue.is_empty() {
            warn!(engine_id = %id, stranded = entry.queue.len(), "direct requests stranded on lost engine");
        }

        if entry.liveness == Liveness::Alive {
            info!(engine_id = %id, ident = %entry.ident, "engine unregistered");
            if let Some(message) = notification(topics::UNREGISTRATION_NOTIFICATION, id, &entry.ident) {
                actions.push(HubAction::Notify {
                    topic: topics::UNREGISTRATION_NOTIFICATION,
                    message,
                });
            }
        }
        self.persist(actions);
    }

    fn persist(&self, actions: &mut Vec<HubAction>) {
        if self.settings.persist_engines {
            actions.push(HubAction::PersistEngines(self.registry.state()));
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// A request on the registration/query ROUTER.
    pub fn query(&mut self, request: Routed, now: Instant) -> Vec<HubAction> {
        let msg_type = request.message.msg_type.clone();
        debug!(msg_type = %msg_type, "hub query");
        match msg_type.as_str() {
            msg_types::REGISTRATION_REQUEST => self.register(&request, now),
            msg_types::UNREGISTRATION_REQUEST => self.unregister(&request),
            msg_types::CONNECTION_REQUEST => self.connections(&request),
            msg_types::QUEUE_REQUEST => self.queue_status(&request),
            msg_types::RESULT_REQUEST => self.results(&request),
            msg_types::HISTORY_REQUEST => self.history(&request),
            msg_types::PURGE_REQUEST => self.purge(&request),
            msg_types::SHUTDOWN_REQUEST => {
                info!("shutdown requested");
                let mut actions: Vec<HubAction> = reply(&request, &StatusReply::ok(), true).into_iter().collect();
                actions.push(HubAction::Shutdown);
                actions
            }
            other => {
                warn!(msg_type = %other, "unknown hub request");
                error_reply(&request, format!("unknown request type '{other}'"))
            }
        }
    }

    fn register(&mut self, request: &Routed, now: Instant) -> Vec<HubAction> {
        let req: RegistrationRequest = match request.message.decode() {
            Ok(r) => r,
            Err(e) => return error_reply(request, format!("bad registration request: {e}")),
        };
        let (payload, ok) = match self.registry.register(&req.ident, now) {
            Ok(id) => {
                let leaf = self.tree.leaf_for_engine(id);
                info!(engine_id = %id, ident = %req.ident, leaf, "registration pending first heartbeat");
                (
                    RegistrationReply {
                        status: ReplyStatus::Ok,
                        engine_id: Some(id),
                        broadcast_leaf: Some(leaf),
                        heartbeat_period_ms: self.settings.heartbeat_period.as_millis() as u64,
                        reason: None,
                    },
                    true,
                )
            }
            Err(e) => {
                warn!(ident = %req.ident, error = %e, "registration refused");
                (
                    RegistrationReply {
                        status: ReplyStatus::Error,
                        engine_id: None,
                        broadcast_leaf: None,
                        heartbeat_period_ms: self.settings.heartbeat_period.as_millis() as u64,
                        reason: Some(e.to_string()),
                    },
                    false,
                )
            }
        };
        let mut actions: Vec<HubAction> = reply(request, &payload, ok).into_iter().collect();
        if ok {
            self.persist(&mut actions);
        }
        actions
    }

    fn unregister(&mut self, request: &Routed) -> Vec<HubAction> {
        let req: UnregistrationRequest = match request.message.decode() {
            Ok(r) => r,
            Err(e) => return error_reply(request, format!("bad unregistration request: {e}")),
        };
        if self.registry.get(req.engine_id).is_none() {
            return error_reply(request, format!("unknown engine {}", req.engine_id));
        }
        let mut actions = Vec::new();
        self.drop_engine(req.engine_id, &mut actions);
        actions.extend(reply(request, &StatusReply::ok(), true));
        actions
    }

    fn connections(&self, request: &Routed) -> Vec<HubAction> {
        let engines = self.registry.alive().map(|e| (e.id, e.ident.clone())).collect();
        reply(request, &ConnectionReply { engines }, true).into_iter().collect()
    }

    fn queue_status(&self, request: &Routed) -> Vec<HubAction> {
        let req: QueueRequest = if request.message.payload.is_empty() {
            QueueRequest::default()
        } else {
            match request.message.decode() {
                Ok(r) => r,
                Err(e) => return error_reply(request, format!("bad queue request: {e}")),
            }
        };
        let ids: Vec<EngineId> = match req.targets {
            Some(targets) => {
                if let Some(missing) = targets.iter().find(|id| self.registry.get(**id).is_none()) {
                    return error_reply(request, format!("unknown engine {missing}"));
                }
                targets
            }
            None => self.registry.alive().map(|e| e.id).collect(),
        };

        let mut engines = BTreeMap::new();
        for id in ids {
            let Some(e) = self.registry.get(id) else {
                continue;
            };
            let ids_of = |set: &BTreeSet<Uuid>| req.verbose.then(|| set.iter().copied().collect());
            engines.insert(
                id,
                EngineQueueStatus {
                    queue: e.queue.len(),
                    completed: e.completed.len(),
                    tasks: e.tasks.len(),
                    queue_ids: ids_of(&e.queue),
                    completed_ids: ids_of(&e.completed),
                },
            );
        }
        let payload = QueueReply {
            engines,
            unassigned: self.unassigned.len(),
        };
        reply(request, &payload, true).into_iter().collect()
    }

    fn results(&self, request: &Routed) -> Vec<HubAction> {
        if !self.db.keeps_history() {
            return error_reply(request, "task history is disabled (db = nodb)");
        }
        let req: ResultRequest = match request.message.decode() {
            Ok(r) => r,
            Err(e) => return error_reply(request, format!("bad result request: {e}")),
        };
        let mut payload = ResultReply::default();
        for msg_id in req.msg_ids {
            match self.db.get_record(&msg_id) {
                Ok(Some(record)) => {
                    if record.is_finished() {
                        payload.completed.push(msg_id);
                    } else {
                        payload.pending.push(msg_id);
                    }
                    payload.records.insert(msg_id, record);
                }
                Ok(None) => payload.unknown.push(msg_id),
                Err(e) => return error_reply(request, format!("task db error: {e}")),
            }
        }
        reply(request, &payload, true).into_iter().collect()
    }

    fn history(&self, request: &Routed) -> Vec<HubAction> {
        if !self.db.keeps_history() {
            return error_reply(request, "task history is disabled (db = nodb)");
        }
        match self.db.record_ids() {
            Ok(msg_ids) => reply(request, &HistoryReply { msg_ids }, true).into_iter().collect(),
            Err(e) => error_reply(request, format!("task db error: {e}")),
        }
    }

    fn purge(&mut self, request: &Routed) -> Vec<HubAction> {
        let req: PurgeRequest = match request.message.decode() {
            Ok(r) => r,
            Err(e) => return error_reply(request, format!("bad purge request: {e}")),
        };
        if let Some(busy) = req.msg_ids.iter().find(|id| self.pending.contains(id)) {
            return error_reply(request, format!("cannot purge pending task {busy}"));
        }

        let mut doomed: BTreeSet<Uuid> = req.msg_ids.iter().copied().collect();
        if req.all || !req.engine_ids.is_empty() {
            let engines: HashSet<EngineId> = req.engine_ids.iter().copied().collect();
            let ids = match self.db.record_ids() {
                Ok(ids) => ids,
                Err(e) => return error_reply(request, format!("task db error: {e}")),
            };
            for msg_id in ids {
                let Ok(Some(record)) = self.db.get_record(&msg_id) else {
                    continue;
                };
                let matches = req.all || record.engine_id.is_some_and(|e| engines.contains(&e));
                if matches && record.is_finished() {
                    doomed.insert(msg_id);
                }
            }
        }

        for msg_id in &doomed {
            if let Err(e) = self.db.drop_record(msg_id) {
                warn!(msg_id = %msg_id, error = %e, "failed to drop task record");
            }
        }
        for engine in self.registry.engines_mut() {
            if req.all || req.engine_ids.contains(&engine.id) {
                engine.completed.clear();
            } else {
                engine.completed.retain(|id| !doomed.contains(id));
            }
        }
        info!(purged = doomed.len(), all = req.all, "purged task results");
        reply(request, &StatusReply::ok(), true).into_iter().collect()
    }

    // ── Monitor tap ──────────────────────────────────────────────────

    /// A copy of traffic published by a relay or scheduler.
    pub fn monitor(&mut self, topic: &str, routed: Routed) {
        match topic {
            topics::MUX_IN => self.direct_request(routed, "mux", true),
            topics::CONTROL_IN => self.direct_request(routed, "control", false),
            topics::MUX_OUT | topics::CONTROL_OUT => self.direct_result(routed),
            topics::TASK_IN => self.task_request(routed),
            topics::TASK_TRACK => self.task_destination(routed),
            topics::TASK_OUT => self.task_result(routed),
            topics::BROADCAST_IN => self.broadcast_request(routed),
            topics::BROADCAST_OUT => self.broadcast_result(routed),
            topics::IOPUB => {
                trace!(msg_type = %routed.message.msg_type, parent = ?routed.message.parent_id, "iopub");
            }
            other => debug!(topic = %other, "unhandled monitor topic"),
        }
    }

    fn ident_str(ident: Option<&Vec<u8>>) -> Option<String> {
        ident.map(|i| String::from_utf8_lossy(i).into_owned())
    }

    fn add(&mut self, routed: &Routed, queue: &str, client: Option<String>, engine_id: Option<EngineId>) {
        let msg = &routed.message;
        let mut record = TaskRecord::new(msg.msg_id, &msg.msg_type, queue, msg.timestamp);
        record.client_ident = client;
        record.engine_id = engine_id;
        if engine_id.is_some() {
            record.started = Some(Utc::now());
        }
        self.pending.insert(msg.msg_id);
        if let Err(e) = self.db.add_record(record) {
            warn!(msg_id = %msg.msg_id, error = %e, "failed to add task record");
        }
    }

    fn update(&mut self, msg_id: Uuid, update: RecordUpdate) {
        if !self.db.keeps_history() {
            return;
        }
        if let Err(e) = self.db.update_record(msg_id, update) {
            debug!(msg_id = %msg_id, error = %e, "task record not updated");
        }
    }

    fn finish(&mut self, reply: &Routed, parent: Uuid, engine_id: Option<EngineId>) {
        self.pending.remove(&parent);
        self.unassigned.remove(&parent);
        if let Some(entry) = engine_id.and_then(|id| self.registry.get_mut(id)) {
            entry.finish(parent);
        }
        let status = reply.message.meta_str(meta::STATUS).unwrap_or(STATUS_OK).to_string();
        self.update(
            parent,
            RecordUpdate {
                engine_id,
                completed: Some(Utc::now()),
                status: Some(status),
                result_msg_id: Some(reply.message.msg_id),
                result_payload: Some(reply.message.payload.clone()),
                ..Default::default()
            },
        );
    }

    /// `[client, engine]` as seen by the client-facing ROUTER.
    fn direct_request(&mut self, routed: Routed, queue: &str, track: bool) {
        let client = Self::ident_str(routed.idents.first());
        let engine = Self::ident_str(routed.idents.get(1)).and_then(|i| self.registry.id_of(&i));
        if track {
            if let Some(entry) = engine.and_then(|id| self.registry.get_mut(id)) {
                entry.queue.insert(routed.message.msg_id);
            }
        }
        self.add(&routed, queue, client, engine);
    }

    /// `[engine, client]` as seen by the engine-facing ROUTER.
    fn direct_result(&mut self, routed: Routed) {
        let Some(parent) = routed.message.parent_id else {
            return;
        };
        let engine = Self::ident_str(routed.idents.first()).and_then(|i| self.registry.id_of(&i));
        self.finish(&routed, parent, engine);
    }

    /// `[client]`
    fn task_request(&mut self, routed: Routed) {
        let client = Self::ident_str(routed.idents.first());
        self.unassigned.insert(routed.message.msg_id);
        self.add(&routed, "task", client, None);
    }

    /// `[engine, client]`
    fn task_destination(&mut self, routed: Routed) {
        let msg_id = routed.message.msg_id;
        let Some(engine) = Self::ident_str(routed.idents.first()).and_then(|i| self.registry.id_of(&i)) else {
            debug!(msg_id = %msg_id, "task tracked to unknown engine");
            return;
        };
        self.unassigned.remove(&msg_id);
        if let Some(entry) = self.registry.get_mut(engine) {
            entry.tasks.insert(msg_id);
        }
        self.update(
            msg_id,
            RecordUpdate {
                engine_id: Some(engine),
                started: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    /// The scheduler stamps `engine_id` on every reply it relays; its own
    /// error replies carry it as null.
    fn task_result(&mut self, routed: Routed) {
        let Some(parent) = routed.message.parent_id else {
            return;
        };
        let engine = routed
            .message
            .meta(meta::ENGINE_ID)
            .and_then(|v| v.as_u64())
            .and_then(|v| u32::try_from(v).ok())
            .map(EngineId);
        // earlier attempts may have been tracked to other engines
        for entry in self.registry.engines_mut() {
            entry.tasks.remove(&parent);
        }
        self.finish(&routed, parent, engine);
    }

    fn broadcast_request(&mut self, routed: Routed) {
        let client = Self::ident_str(routed.idents.first());
        self.add(&routed, "broadcast", client, None);
    }

    fn broadcast_result(&mut self, routed: Routed) {
        let Some(parent) = routed.message.parent_id else {
            return;
        };
        self.pending.remove(&parent);
        let status = routed.message.meta_str(meta::STATUS).unwrap_or(STATUS_OK).to_string();
        self.update(
            parent,
            RecordUpdate {
                completed: Some(Utc::now()),
                status: Some(status),
                result_msg_id: Some(routed.message.msg_id),
                result_payload: Some(routed.message.payload),
                ..Default::default()
            },
        );
    }
}

fn notification(topic: &str, id: EngineId, ident: &str) -> Option<Message> {
    let payload = EngineNotification {
        engine_id: id,
        ident: ident.to_string(),
    };
    match Message::new(msg_types::ENGINE_NOTIFICATION, &payload) {
        Ok(m) => Some(m),
        Err(e) => {
            warn!(topic = %topic, error = %e, "failed to encode engine notification");
            None
        }
    }
}

fn reply<T: Serialize>(request: &Routed, payload: &T, ok: bool) -> Option<HubAction> {
    let reply_type = msg_types::reply_type(&request.message.msg_type);
    match Message::reply_to(&request.message, reply_type, payload) {
        Ok(m) => Some(HubAction::Reply(
            request.reply(m.with_meta(meta::STATUS, if ok { STATUS_OK } else { STATUS_ERROR })),
        )),
        Err(e) => {
            warn!(error = %e, "failed to encode hub reply");
            None
        }
    }
}

fn error_reply(request: &Routed, reason: impl Into<String>) -> Vec<HubAction> {
    let reason = reason.into();
    reply(request, &StatusReply::error(reason.clone()), false)
        .map(|action| match action {
            HubAction::Reply(mut routed) => {
                routed.message = routed.message.with_meta(meta::REASON, reason);
                HubAction::Reply(routed)
            }
            other => other,
        })
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryDb, NoDb};
    use kluster_wire::messages::RegistrationReply;

    const PEER: &[u8] = b"peer";

    fn settings() -> HubSettings {
        HubSettings {
            heartbeat_period: Duration::from_millis(100),
            heartbeat_max_missed: 2,
            registration_timeout: Duration::from_secs(5),
            broadcast_depth: 1,
            broadcast_slots: 4,
            persist_engines: false,
        }
    }

    fn hub() -> Hub {
        Hub::new(settings(), EngineRegistry::new(), Box::new(MemoryDb::new()))
    }

    fn query<T: Serialize>(msg_type: &str, payload: &T) -> Routed {
        Routed::new(vec![PEER.to_vec()], Message::new(msg_type, payload).unwrap())
    }

    fn replies(actions: &[HubAction]) -> Vec<&Message> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Reply(r) => Some(&r.message),
                _ => None,
            })
            .collect()
    }

    fn notifies(actions: &[HubAction]) -> Vec<(&'static str, EngineNotification)> {
        actions
            .iter()
            .filter_map(|a| match a {
                HubAction::Notify { topic, message } => Some((*topic, message.decode().unwrap())),
                _ => None,
            })
            .collect()
    }

    /// Register `ident` and answer the next ping so it becomes alive.
    fn bring_up(hub: &mut Hub, ident: &str, now: Instant) -> EngineId {
        let actions = hub.query(
            query(msg_types::REGISTRATION_REQUEST, &RegistrationRequest { ident: ident.into() }),
            now,
        );
        let reply: RegistrationReply = replies(&actions)[0].decode().unwrap();
        let id = reply.engine_id.unwrap();
        let ping = match hub.beat(now).pop() {
            Some(HubAction::Ping(p)) => p,
            other => panic!("expected ping, got {other:?}"),
        };
        hub.pong(ident.as_bytes(), &ping);
        id
    }

    fn routed(idents: &[&[u8]], message: Message) -> Routed {
        Routed::new(idents.iter().map(|i| i.to_vec()).collect(), message)
    }

    fn answer(request: &Message, status: &str) -> Message {
        let mut reply = Message::raw(msg_types::APPLY_REPLY, vec![5]).with_meta(meta::STATUS, status);
        reply.parent_id = Some(request.msg_id);
        reply
    }

    #[test]
    fn registration_waits_for_first_heartbeat() {
        let mut hub = hub();
        let now = Instant::now();
        let actions = hub.query(
            query(msg_types::REGISTRATION_REQUEST, &RegistrationRequest { ident: "e-a".into() }),
            now,
        );
        let msg = replies(&actions)[0];
        assert_eq!(msg.msg_type, msg_types::REGISTRATION_REPLY);
        assert_eq!(msg.meta_str(meta::STATUS), Some(STATUS_OK));
        let reply: RegistrationReply = msg.decode().unwrap();
        assert_eq!(reply.engine_id, Some(EngineId(0)));
        assert_eq!(reply.broadcast_leaf, Some(0));
        assert_eq!(reply.heartbeat_period_ms, 100);
        assert!(notifies(&actions).is_empty());

        let ping = match hub.beat(now).pop() {
            Some(HubAction::Ping(p)) => p,
            other => panic!("expected ping, got {other:?}"),
        };
        let actions = hub.pong(b"e-a", &ping);
        let notes = notifies(&actions);
        assert_eq!(notes.len(), 1);
        assert_eq!(notes[0].0, topics::REGISTRATION_NOTIFICATION);
        assert_eq!(notes[0].1.engine_id, EngineId(0));
        assert!(hub.pong(b"e-a", &ping).is_empty());
        assert!(hub.pong(b"stranger", &ping).is_empty());
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let mut hub = hub();
        let now = Instant::now();
        bring_up(&mut hub, "e-a", now);
        let actions = hub.query(
            query(msg_types::REGISTRATION_REQUEST, &RegistrationRequest { ident: "e-a".into() }),
            now,
        );
        let msg = replies(&actions)[0];
        assert_eq!(msg.meta_str(meta::STATUS), Some(STATUS_ERROR));
        let reply: RegistrationReply = msg.decode().unwrap();
        assert_eq!(reply.status, ReplyStatus::Error);
        assert!(reply.engine_id.is_none());
    }

    #[test]
    fn dead_heart_unregisters_and_notifies() {
        let mut hub = hub();
        let now = Instant::now();
        let a = bring_up(&mut hub, "e-a", now);
        let b = bring_up(&mut hub, "e-b", now);

        // only e-b keeps answering
        let mut lost = Vec::new();
        for _ in 0..3 {
            let actions = hub.beat(now);
            lost.extend(notifies(&actions));
            if let Some(HubAction::Ping(ping)) = actions.last() {
                hub.pong(b"e-b", ping);
            }
        }
        assert_eq!(lost.len(), 1);
        assert_eq!(lost[0].0, topics::UNREGISTRATION_NOTIFICATION);
        assert_eq!(lost[0].1.engine_id, a);
        assert!(hub.registry().get(a).is_none());
        assert!(hub.registry().get(b).is_some());
    }

    #[test]
    fn silent_registration_is_purged_without_notification() {
        let mut hub = hub();
        let t0 = Instant::now();
        hub.query(
            query(msg_types::REGISTRATION_REQUEST, &RegistrationRequest { ident: "mute".into() }),
            t0,
        );
        let actions = hub.beat(t0 + Duration::from_secs(6));
        assert!(notifies(&actions).is_empty());
        assert!(hub.registry().is_empty());
    }

    #[test]
    fn explicit_unregistration_notifies_schedulers() {
        let mut hub = hub();
        let now = Instant::now();
        let id = bring_up(&mut hub, "e-a", now);
        let actions = hub.query(
            query(msg_types::UNREGISTRATION_REQUEST, &UnregistrationRequest { engine_id: id }),
            now,
        );
        assert_eq!(notifies(&actions)[0].0, topics::UNREGISTRATION_NOTIFICATION);
        assert_eq!(replies(&actions)[0].meta_str(meta::STATUS), Some(STATUS_OK));

        let again = hub.query(
            query(msg_types::UNREGISTRATION_REQUEST, &UnregistrationRequest { engine_id: id }),
            now,
        );
        assert_eq!(replies(&again)[0].meta_str(meta::STATUS), Some(STATUS_ERROR));
    }

    #[test]
    fn monitor_tracks_load_balanced_tasks() {
        let mut hub = hub();
        let now = Instant::now();
        let id = bring_up(&mut hub, "e-a", now);

        let request = Message::raw(msg_types::APPLY_REQUEST, vec![1]);
        hub.monitor(topics::TASK_IN, routed(&[b"client"], request.clone()));
        assert_eq!(hub.unassigned_count(), 1);

        hub.monitor(topics::TASK_TRACK, routed(&[b"e-a", b"client"], request.clone()));
        assert_eq!(hub.unassigned_count(), 0);
        assert!(hub.registry().get(id).unwrap().tasks.contains(&request.msg_id));

        let actions = hub.query(query(msg_types::QUEUE_REQUEST, &QueueRequest::default()), now);
        let status: QueueReply = replies(&actions)[0].decode().unwrap();
        assert_eq!(status.engines[&id].tasks, 1);

        let result = answer(&request, STATUS_OK).with_meta(meta::ENGINE_ID, id.0);
        hub.monitor(topics::TASK_OUT, routed(&[b"e-a", b"client"], result));
        assert!(!hub.is_pending(&request.msg_id));
        let entry = hub.registry().get(id).unwrap();
        assert!(entry.tasks.is_empty());
        assert!(entry.completed.contains(&request.msg_id));

        let actions = hub.query(
            query(msg_types::RESULT_REQUEST, &ResultRequest { msg_ids: vec![request.msg_id, Uuid::new_v4()] }),
            now,
        );
        let results: ResultReply = replies(&actions)[0].decode().unwrap();
        assert_eq!(results.completed, vec![request.msg_id]);
        assert_eq!(results.unknown.len(), 1);
        let record = &results.records[&request.msg_id];
        assert_eq!(record.queue, "task");
        assert_eq!(record.engine_id, Some(id));
        assert_eq!(record.client_ident.as_deref(), Some("client"));
        assert_eq!(record.status.as_deref(), Some(STATUS_OK));
    }

    #[test]
    fn scheduler_errors_finish_unassigned_tasks() {
        let mut hub = hub();
        let request = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        hub.monitor(topics::TASK_IN, routed(&[b"client"], request.clone()));
        hub.monitor(topics::TASK_OUT, routed(&[b"client"], answer(&request, STATUS_ERROR)));
        assert_eq!(hub.unassigned_count(), 0);
        assert!(!hub.is_pending(&request.msg_id));
    }

    #[test]
    fn task_results_are_attributed_by_engine_id_not_route_depth() {
        let mut hub = hub();
        let now = Instant::now();
        let id = bring_up(&mut hub, "e-a", now);

        // a scheduler error sent back through a two-hop client route
        let request = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        hub.monitor(topics::TASK_IN, routed(&[b"e-a", b"client"], request.clone()));
        let error = answer(&request, STATUS_ERROR).with_meta(meta::ENGINE_ID, serde_json::Value::Null);
        hub.monitor(topics::TASK_OUT, routed(&[b"e-a", b"client"], error));
        assert!(!hub.is_pending(&request.msg_id));
        let entry = hub.registry().get(id).unwrap();
        assert!(!entry.completed.contains(&request.msg_id));

        // an engine reply is credited even when the route is a single ident
        let request = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        hub.monitor(topics::TASK_IN, routed(&[b"client"], request.clone()));
        hub.monitor(topics::TASK_TRACK, routed(&[b"e-a", b"client"], request.clone()));
        let result = answer(&request, STATUS_OK).with_meta(meta::ENGINE_ID, id.0);
        hub.monitor(topics::TASK_OUT, routed(&[b"client"], result));
        assert!(hub.registry().get(id).unwrap().completed.contains(&request.msg_id));
    }

    #[test]
    fn direct_requests_count_in_engine_queue_and_strand_on_loss() {
        let mut hub = hub();
        let now = Instant::now();
        let id = bring_up(&mut hub, "e-a", now);
        let first = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        let second = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        hub.monitor(topics::MUX_IN, routed(&[b"client", b"e-a"], first.clone()));
        hub.monitor(topics::MUX_IN, routed(&[b"client", b"e-a"], second.clone()));
        hub.monitor(topics::MUX_OUT, routed(&[b"e-a", b"client"], answer(&first, STATUS_OK)));
        let entry = hub.registry().get(id).unwrap();
        assert_eq!(entry.queue.len(), 1);
        assert_eq!(entry.completed.len(), 1);

        hub.query(query(msg_types::UNREGISTRATION_REQUEST, &UnregistrationRequest { engine_id: id }), now);
        assert!(!hub.is_pending(&second.msg_id));
        let actions = hub.query(
            query(msg_types::RESULT_REQUEST, &ResultRequest { msg_ids: vec![second.msg_id] }),
            now,
        );
        let results: ResultReply = replies(&actions)[0].decode().unwrap();
        assert_eq!(results.records[&second.msg_id].status.as_deref(), Some(STATUS_ERROR));
    }

    #[test]
    fn history_and_purge() {
        let mut hub = hub();
        let now = Instant::now();
        bring_up(&mut hub, "e-a", now);
        let done = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        let running = Message::raw(msg_types::APPLY_REQUEST, vec![]);
        hub.monitor(topics::MUX_IN, routed(&[b"client", b"e-a"], done.clone()));
        hub.monitor(topics::MUX_IN, routed(&[b"client", b"e-a"], running.clone()));
        hub.monitor(topics::MUX_OUT, routed(&[b"e-a", b"client"], answer(&done, STATUS_OK)));

        let actions = hub.query(query(msg_types::HISTORY_REQUEST, &()), now);
        let history: HistoryReply = replies(&actions)[0].decode().unwrap();
        assert_eq!(history.msg_ids.len(), 2);

        let refused = hub.query(
            query(msg_types::PURGE_REQUEST, &PurgeRequest { msg_ids: vec![running.msg_id], ..Default::default() }),
            now,
        );
        assert_eq!(replies(&refused)[0].meta_str(meta::STATUS), Some(STATUS_ERROR));

        let purged = hub.query(query(msg_types::PURGE_REQUEST, &PurgeRequest { all: true, ..Default::default() }), now);
        assert_eq!(replies(&purged)[0].meta_str(meta::STATUS), Some(STATUS_OK));
        let actions = hub.query(query(msg_types::HISTORY_REQUEST, &()), now);
        let history: HistoryReply = replies(&actions)[0].decode().unwrap();
        assert_eq!(history.msg_ids, vec![running.msg_id]);
    }

    #[test]
    fn nodb_refuses_history_queries() {
        let mut hub = Hub::new(settings(), EngineRegistry::new(), Box::new(NoDb));
        let actions = hub.query(query(msg_types::HISTORY_REQUEST, &()), Instant::now());
        let msg = replies(&actions)[0];
        assert_eq!(msg.meta_str(meta::STATUS), Some(STATUS_ERROR));
        assert!(msg.meta_str(meta::REASON).unwrap().contains("nodb"));
    }

    #[test]
    fn shutdown_and_unknown_requests() {
        let mut hub = hub();
        let actions = hub.query(query(msg_types::SHUTDOWN_REQUEST, &()), Instant::now());
        assert_eq!(replies(&actions)[0].msg_type, msg_types::SHUTDOWN_REPLY);
        assert_eq!(actions.last(), Some(&HubAction::Shutdown));

        let actions = hub.query(query("frobnicate_request", &()), Instant::now());
        assert_eq!(replies(&actions)[0].meta_str(meta::STATUS), Some(STATUS_ERROR));
        assert!(!actions.contains(&HubAction::Shutdown));
    }

    #[test]
    fn registry_changes_are_persisted_when_enabled() {
        let mut settings = settings();
        settings.persist_engines = true;
        let mut hub = Hub::new(settings, EngineRegistry::new(), Box::new(MemoryDb::new()));
        let actions = hub.query(
            query(msg_types::REGISTRATION_REQUEST, &RegistrationRequest { ident: "e-a".into() }),
            Instant::now(),
        );
        let persisted = actions.iter().find_map(|a| match a {
            HubAction::PersistEngines(state) => Some(state.clone()),
            _ => None,
        });
        let state = persisted.unwrap();
        assert_eq!(state.next_id, 1);
        assert_eq!(state.engines[&EngineId(0)], "e-a");
    }
}
