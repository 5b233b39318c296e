//! The task scheduler as a pure state machine.
//!
//! Inputs are submits, engine joins and departures, engine replies and
//! clock ticks; every call returns the [`SchedulerAction`]s the socket
//! runner must perform. Nothing here touches a socket or reads the clock,
//! so every scheduling decision is unit-testable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use kluster_core::EngineId;
use kluster_wire::messages::{meta, msg_types, topics, ErrorContent, FailureReason, STATUS_ERROR, STATUS_OK};
use kluster_wire::{Message, Routed};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SchedulerError;
use crate::scheduler::scheme::{Candidate, LoadScheme};
use crate::scheduler::task::{Task, TaskOptions, TaskState};

/// Side effects requested by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerAction {
    /// Send to the engine-facing ROUTER; the first ident is the engine.
    Dispatch { engine: EngineId, routed: Routed },
    /// Send to the client-facing ROUTER.
    Reply(Routed),
    /// Copy to the hub monitor.
    Monitor { topic: &'static str, routed: Routed },
}

#[derive(Debug, Default)]
struct EngineState {
    ident: Vec<u8>,
    assigned: BTreeSet<Uuid>,
    completed: HashSet<Uuid>,
    failed: HashSet<Uuid>,
    last_dispatch: u64,
}

pub struct TaskScheduler {
    scheme: Box<dyn LoadScheme>,
    /// Outstanding tasks per engine before it stops receiving more (0 = unlimited).
    hwm: u32,
    engines: BTreeMap<EngineId, EngineState>,
    by_ident: HashMap<Vec<u8>, EngineId>,
    tasks: HashMap<Uuid, Task>,
    /// arrival -> msg_id, scanned in order on every pass.
    pending: BTreeMap<u64, Uuid>,
    /// Finished and known task ids are never forgotten, so a later `after`
    /// or `follow` can name any task submitted since this scheduler started.
    /// They grow for the controller's lifetime; hub purges drop stored
    /// results only.
    completed: HashSet<Uuid>,
    failed: HashSet<Uuid>,
    all_ids: HashSet<Uuid>,
    arrivals: u64,
    dispatches: u64,
}

impl TaskScheduler {
    pub fn new(scheme: Box<dyn LoadScheme>, hwm: u32) -> Self {
        Self {
            scheme,
            hwm,
            engines: BTreeMap::new(),
            by_ident: HashMap::new(),
            tasks: HashMap::new(),
            pending: BTreeMap::new(),
            completed: HashSet::new(),
            failed: HashSet::new(),
            all_ids: HashSet::new(),
            arrivals: 0,
            dispatches: 0,
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    pub fn engine_count(&self) -> usize {
        self.engines.len()
    }

    /// Outstanding tasks on `engine`.
    pub fn load(&self, engine: EngineId) -> Option<usize> {
        self.engines.get(&engine).map(|e| e.assigned.len())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn task_state(&self, msg_id: &Uuid) -> Option<TaskState> {
        self.tasks.get(msg_id).map(|t| t.state)
    }

    pub fn attempts(&self, msg_id: &Uuid) -> Option<u32> {
        self.tasks.get(msg_id).map(|t| t.attempts)
    }

    pub fn is_completed(&self, msg_id: &Uuid) -> bool {
        self.completed.contains(msg_id)
    }

    pub fn is_failed(&self, msg_id: &Uuid) -> bool {
        self.failed.contains(msg_id)
    }

    // ── Inputs ───────────────────────────────────────────────────────

    /// A client request arrived on the task channel.
    pub fn submit(&mut self, request: Routed, now: Instant) -> Vec<SchedulerAction> {
        let msg_id = request.message.msg_id;
        let mut actions = vec![SchedulerAction::Monitor {
            topic: topics::TASK_IN,
            routed: request.clone(),
        }];

        if self.all_ids.contains(&msg_id) {
            warn!(msg_id = %msg_id, "duplicate task id");
            self.push_error(&request, FailureReason::InvalidRequest, "duplicate task id", &mut actions);
            return actions;
        }
        self.all_ids.insert(msg_id);

        let options = match TaskOptions::from_message(&request.message) {
            Ok(options) => options,
            Err(e) => {
                let reason = match e {
                    SchedulerError::InvalidDependency(_) => FailureReason::InvalidDependency,
                    SchedulerError::InvalidRequest(_) => FailureReason::InvalidRequest,
                };
                info!(msg_id = %msg_id, error = %e, "rejecting task");
                self.failed.insert(msg_id);
                self.push_error(&request, reason, &e.to_string(), &mut actions);
                return actions;
            }
        };

        for dep in [&options.after, &options.follow] {
            if dep.is_empty() {
                continue;
            }
            if dep.contains(&msg_id) || dep.ids.iter().any(|id| !self.all_ids.contains(id)) {
                self.failed.insert(msg_id);
                self.push_error(
                    &request,
                    FailureReason::InvalidDependency,
                    "task depends on itself or on a task the scheduler has never seen",
                    &mut actions,
                );
                return actions;
            }
            if dep.unreachable(&self.completed, &self.failed) {
                self.failed.insert(msg_id);
                self.push_error(
                    &request,
                    FailureReason::UnreachableDependency,
                    "dependency can no longer be met",
                    &mut actions,
                );
                return actions;
            }
        }

        let mut options = options;
        if options.after.check(&self.completed, &self.failed) {
            options.after = Default::default();
        }

        let arrival = self.arrivals;
        self.arrivals += 1;
        debug!(msg_id = %msg_id, arrival, "task pending");
        self.tasks.insert(msg_id, Task::new(request, options, arrival, now));
        self.pending.insert(arrival, msg_id);

        actions.extend(self.schedule(now));
        actions
    }

    /// An engine became available for work.
    pub fn engine_registered(&mut self, id: EngineId, ident: Vec<u8>, now: Instant) -> Vec<SchedulerAction> {
        if self.engines.contains_key(&id) {
            debug!(engine_id = %id, "engine already known");
            return Vec::new();
        }
        info!(engine_id = %id, "engine joined task scheduler");
        self.by_ident.insert(ident.clone(), id);
        self.engines.insert(
            id,
            EngineState {
                ident,
                ..EngineState::default()
            },
        );
        self.schedule(now)
    }

    /// An engine unregistered or its heart stopped: release its tasks.
    pub fn engine_unregistered(&mut self, id: EngineId, now: Instant) -> Vec<SchedulerAction> {
        let Some(engine) = self.engines.remove(&id) else {
            debug!(engine_id = %id, "unregistration for unknown engine");
            return Vec::new();
        };
        self.by_ident.remove(&engine.ident);
        info!(engine_id = %id, released = engine.assigned.len(), "engine left task scheduler");

        let mut actions = Vec::new();
        for msg_id in engine.assigned {
            self.release(msg_id, FailureReason::EngineLost, now, &mut actions);
        }
        actions.extend(self.schedule(now));
        actions
    }

    /// A reply arrived from the engine with routing identity `engine_ident`.
    ///
    /// `reply.idents` is the client stack the request carried.
    pub fn engine_reply(&mut self, engine_ident: &[u8], reply: Routed, now: Instant) -> Vec<SchedulerAction> {
        let Some(&engine_id) = self.by_ident.get(engine_ident) else {
            warn!(ident = %String::from_utf8_lossy(engine_ident), "reply from unknown engine dropped");
            return Vec::new();
        };
        let Some(parent) = reply.message.parent_id else {
            warn!(engine_id = %engine_id, "reply without parent id dropped");
            return Vec::new();
        };
        match self.tasks.get(&parent).map(|t| t.state) {
            Some(TaskState::Assigned(e)) if e == engine_id => {}
            _ => {
                warn!(engine_id = %engine_id, msg_id = %parent, "late or unexpected reply dropped");
                return Vec::new();
            }
        }
        self.tasks.remove(&parent);

        let ok = reply.message.meta_str(meta::STATUS) == Some(STATUS_OK);
        if let Some(engine) = self.engines.get_mut(&engine_id) {
            engine.assigned.remove(&parent);
            if ok {
                engine.completed.insert(parent);
            } else {
                engine.failed.insert(parent);
            }
        }
        if ok {
            self.completed.insert(parent);
        } else {
            self.failed.insert(parent);
        }
        debug!(engine_id = %engine_id, msg_id = %parent, ok, "task finished");

        let message = reply.message.with_meta(meta::ENGINE_ID, engine_id.0);
        let to_client = Routed::new(reply.idents, message);
        let mut monitored = to_client.clone();
        monitored.push_front_ident(engine_ident.to_vec());

        let mut actions = vec![
            SchedulerAction::Reply(to_client),
            SchedulerAction::Monitor {
                topic: topics::TASK_OUT,
                routed: monitored,
            },
        ];
        actions.extend(self.schedule(now));
        actions
    }

    /// Expire task deadlines that passed by `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<SchedulerAction> {
        let expired: Vec<Uuid> = self
            .tasks
            .values()
            .filter(|t| t.deadline.is_some_and(|d| d <= now))
            .map(|t| t.msg_id)
            .collect();
        if expired.is_empty() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        for msg_id in expired {
            let Some(task) = self.tasks.get_mut(&msg_id) else {
                continue;
            };
            let state = task.state;
            match state {
                TaskState::Assigned(engine_id) => {
                    info!(msg_id = %msg_id, engine_id = %engine_id, "task timed out on engine");
                    task.blacklist.insert(engine_id);
                    if let Some(engine) = self.engines.get_mut(&engine_id) {
                        engine.assigned.remove(&msg_id);
                    }
                    self.release(msg_id, FailureReason::Timeout, now, &mut actions);
                }
                TaskState::Pending => {
                    if task.options.retries > 0 {
                        task.options.retries -= 1;
                        task.restart_clock(now);
                        debug!(msg_id = %msg_id, retries = task.options.retries, "pending task timed out, retrying");
                    } else {
                        self.fail(msg_id, FailureReason::Timeout, "task timed out while pending", &mut actions);
                    }
                }
            }
        }
        actions.extend(self.schedule(now));
        actions
    }

    // ── Internals ────────────────────────────────────────────────────

    /// Take an assigned task back: retry if budget remains, else fail it.
    /// The caller has already removed it from the engine's assigned set.
    fn release(&mut self, msg_id: Uuid, reason: FailureReason, now: Instant, actions: &mut Vec<SchedulerAction>) {
        let Some(task) = self.tasks.get_mut(&msg_id) else {
            return;
        };
        if task.options.retries > 0 {
            task.options.retries -= 1;
            task.state = TaskState::Pending;
            task.restart_clock(now);
            self.pending.insert(task.arrival, msg_id);
            info!(msg_id = %msg_id, reason = %reason, retries = task.options.retries, "task returned to pending");
        } else {
            let evalue = match reason {
                FailureReason::Timeout => "task timed out and has no retries left",
                _ => "engine died while running task",
            };
            self.fail(msg_id, reason, evalue, actions);
        }
    }

    fn fail(&mut self, msg_id: Uuid, reason: FailureReason, evalue: &str, actions: &mut Vec<SchedulerAction>) {
        let Some(task) = self.tasks.remove(&msg_id) else {
            return;
        };
        self.pending.remove(&task.arrival);
        if let Some(engine_id) = task.assigned_to() {
            if let Some(engine) = self.engines.get_mut(&engine_id) {
                engine.assigned.remove(&msg_id);
            }
        }
        self.failed.insert(msg_id);
        info!(msg_id = %msg_id, reason = %reason, attempts = task.attempts, "task failed");
        self.push_error(&task.request, reason, evalue, actions);
    }

    fn push_error(&self, request: &Routed, reason: FailureReason, evalue: &str, actions: &mut Vec<SchedulerAction>) {
        let content = ErrorContent::new(reason, evalue);
        let message = match Message::reply_to(&request.message, msg_types::APPLY_REPLY, &content) {
            Ok(m) => m
                .with_meta(meta::STATUS, STATUS_ERROR)
                .with_meta(meta::REASON, reason.as_str())
                .with_meta(meta::ENGINE_ID, serde_json::Value::Null),
            Err(e) => {
                warn!(error = %e, "failed to encode error reply");
                return;
            }
        };
        let reply = request.reply(message);
        actions.push(SchedulerAction::Reply(reply.clone()));
        actions.push(SchedulerAction::Monitor {
            topic: topics::TASK_OUT,
            routed: reply,
        });
    }

    /// Scan pending tasks in arrival order, failing the impossible ones and
    /// dispatching the runnable ones. Repeats while failures may unblock or
    /// doom other tasks.
    fn schedule(&mut self, now: Instant) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        loop {
            let mut failed_any = false;
            let order: Vec<Uuid> = self.pending.values().copied().collect();
            for msg_id in order {
                match self.evaluate(&msg_id) {
                    Placement::Wait => {}
                    Placement::Fail(reason, evalue) => {
                        self.fail(msg_id, reason, evalue, &mut actions);
                        failed_any = true;
                    }
                    Placement::Run(engine_id) => self.dispatch(msg_id, engine_id, now, &mut actions),
                }
            }
            if !failed_any {
                break;
            }
        }
        actions
    }

    fn evaluate(&mut self, msg_id: &Uuid) -> Placement {
        let Some(task) = self.tasks.get_mut(msg_id) else {
            return Placement::Wait;
        };
        let opts = &task.options;

        if let Some(targets) = &opts.targets {
            if !targets.iter().any(|t| self.engines.contains_key(t)) {
                return Placement::Fail(FailureReason::UnavailableTarget, "no target engine is registered");
            }
        }

        if opts.after.unreachable(&self.completed, &self.failed) {
            return Placement::Fail(FailureReason::UnreachableDependency, "time dependency can no longer be met");
        }
        if !opts.after.check(&self.completed, &self.failed) {
            return Placement::Wait;
        }

        if opts.follow.unreachable(&self.completed, &self.failed) {
            return Placement::Fail(FailureReason::UnreachableDependency, "location dependency can no longer be met");
        }

        let eligible: Vec<EngineId> = self
            .engines
            .iter()
            .filter(|(id, _)| opts.targets.as_ref().map_or(true, |t| t.contains(*id)))
            .filter(|(_, e)| opts.follow.check(&e.completed, &e.failed))
            .map(|(id, _)| *id)
            .collect();
        if eligible.is_empty() {
            if !opts.follow.is_empty() && opts.follow.all_finished(&self.completed, &self.failed) {
                return Placement::Fail(
                    FailureReason::ImpossibleDependency,
                    "no live engine satisfies the location dependency",
                );
            }
            return Placement::Wait;
        }

        if eligible.iter().all(|e| task.blacklist.contains(e)) {
            task.blacklist.clear();
        }
        let candidates: Vec<Candidate> = eligible
            .into_iter()
            .filter(|id| !task.blacklist.contains(id))
            .filter_map(|id| {
                let e = self.engines.get(&id)?;
                let load = e.assigned.len();
                (self.hwm == 0 || load < self.hwm as usize).then_some(Candidate {
                    id,
                    load,
                    last_dispatch: e.last_dispatch,
                })
            })
            .collect();
        if candidates.is_empty() {
            return Placement::Wait;
        }
        match self.scheme.choose(&candidates) {
            Some(id) => Placement::Run(id),
            None => Placement::Wait,
        }
    }

    fn dispatch(&mut self, msg_id: Uuid, engine_id: EngineId, now: Instant, actions: &mut Vec<SchedulerAction>) {
        let (Some(task), Some(engine)) = (self.tasks.get_mut(&msg_id), self.engines.get_mut(&engine_id)) else {
            return;
        };
        self.dispatches += 1;
        engine.assigned.insert(msg_id);
        engine.last_dispatch = self.dispatches;
        task.state = TaskState::Assigned(engine_id);
        task.attempts += 1;
        task.restart_clock(now);
        self.pending.remove(&task.arrival);

        let mut routed = task.request.clone();
        routed.push_front_ident(engine.ident.clone());
        debug!(msg_id = %msg_id, engine_id = %engine_id, attempt = task.attempts, "dispatching task");
        actions.push(SchedulerAction::Monitor {
            topic: topics::TASK_TRACK,
            routed: routed.clone(),
        });
        actions.push(SchedulerAction::Dispatch {
            engine: engine_id,
            routed,
        });
    }
}

enum Placement {
    Wait,
    Fail(FailureReason, &'static str),
    Run(EngineId),
}
