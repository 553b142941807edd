//! PoolState - the synchronous core of the scheduler.
//!
//! Owns the slots, the free list and the FIFO queue. Every method runs to
//! completion without awaiting; work that needs the runtime (terminating a
//! worker, spawning a replacement) is recorded as an [`Effect`] and carried
//! out by the actor afterwards.
//!
//! Invariants:
//! - `slots.len()` equals the configured size for the pool's lifetime
//! - a live worker holds at most one `TaskInfo`
//! - `free` holds exactly the live workers with no current task
//! - events from a worker that is no longer in a slot are ignored
//!
//! # Dispatch
//! A free worker takes the oldest queued task it can run. Tasks its
//! capabilities exclude stay where they are, so a specialised slot never
//! blocks the queue for the others. A task type that no live or restarting
//! slot accepts is rejected with `TaskError::Unsupported`, both on submission
//! and when the last capable slot goes down with crash recovery disabled.
//!
//! # Cancellation
//! A cooperative cancel settles the task as `Cancelled` at once, but the
//! worker stays busy until it answers; its late outcome is discarded. A
//! forced cancel retires the worker and schedules a replacement.
//!
//! # Crashes
//! A worker error or exit fails its current task with `WorkerFault`. With
//! `restart_on_crash` the slot goes to `Starting` and respawns after the
//! configured backoff; otherwise it stays `Down`.

use std::collections::VecDeque;
use std::mem;

use tracing::{debug, info, warn};

use super::info::TaskInfo;
use super::stats::PoolStats;
use crate::domain::{
    Capabilities, PoolError, ProgressKind, TaskError, TaskId, TaskType, WorkerId, accepts,
};
use crate::protocol::{WorkerRequest, WorkerResponse};
use crate::worker::{WorkerEvent, WorkerEventKind, WorkerHandle};

/// Side effect requested by the state for the actor to perform.
pub(crate) enum Effect<H> {
    Terminate { worker: WorkerId, handle: H },
    /// `attempt` counts consecutive failed spawns for the slot.
    Respawn { slot: usize, attempt: u32 },
}

struct WorkerEntry<H> {
    id: WorkerId,
    handle: H,
    current: Option<TaskInfo>,
    tasks_completed: u64,
}

impl<H> WorkerEntry<H> {
    fn new(id: WorkerId, handle: H) -> Self {
        Self {
            id,
            handle,
            current: None,
            tasks_completed: 0,
        }
    }
}

enum Slot<H> {
    Live(WorkerEntry<H>),
    /// Replacement spawn in progress.
    Starting { attempt: u32 },
    /// No worker and none coming (closed, or crash restart disabled).
    Down,
}

#[derive(Debug, Default)]
struct Counters {
    completed: u64,
    failed: u64,
    cancelled: u64,
    respawns: u64,
}

pub(crate) struct PoolState<H> {
    slots: Vec<Slot<H>>,
    capabilities: Vec<Option<Capabilities>>,
    free: VecDeque<usize>,
    queue: VecDeque<TaskInfo>,
    closing: bool,
    restart_on_crash: bool,
    counters: Counters,
    effects: Vec<Effect<H>>,
}

impl<H: WorkerHandle> PoolState<H> {
    /// `workers[n]` and `capabilities[n]` describe slot `n`.
    pub(crate) fn new(
        workers: Vec<(WorkerId, H)>,
        capabilities: Vec<Option<Capabilities>>,
        restart_on_crash: bool,
    ) -> Self {
        let slots: Vec<Slot<H>> = workers
            .into_iter()
            .map(|(id, handle)| Slot::Live(WorkerEntry::new(id, handle)))
            .collect();
        let free = (0..slots.len()).collect();
        Self {
            slots,
            capabilities,
            free,
            queue: VecDeque::new(),
            closing: false,
            restart_on_crash,
            counters: Counters::default(),
            effects: Vec::new(),
        }
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    /// Could a live or restarting slot ever run this type? Slots that went
    /// down for good do not count.
    pub(crate) fn can_ever_run(&self, task_type: &TaskType) -> bool {
        (0..self.slots.len()).any(|slot| {
            matches!(self.slots[slot], Slot::Live(_) | Slot::Starting { .. })
                && self.slot_accepts(slot, task_type)
        })
    }

    /// Fail queued tasks that no remaining slot can run.
    fn reject_stranded(&mut self) {
        let queued = mem::take(&mut self.queue);
        for info in queued {
            if self.can_ever_run(info.task_type()) {
                self.queue.push_back(info);
                continue;
            }
            let task_type = info.task_type().clone();
            warn!(task_id = %info.id(), %task_type, "no worker left for queued task");
            self.counters.failed += 1;
            info.reject(TaskError::Unsupported(task_type));
        }
    }

    fn slot_accepts(&self, slot: usize, task_type: &TaskType) -> bool {
        self.capabilities
            .get(slot)
            .is_some_and(|caps| accepts(caps.as_ref(), task_type))
    }

    pub(crate) fn take_effects(&mut self) -> Vec<Effect<H>> {
        mem::take(&mut self.effects)
    }

    pub(crate) fn add_task(&mut self, info: TaskInfo) {
        if self.closing {
            self.counters.failed += 1;
            info.reject(TaskError::PoolClosed);
            return;
        }
        if !self.can_ever_run(info.task_type()) {
            let task_type = info.task_type().clone();
            self.counters.failed += 1;
            info.reject(TaskError::Unsupported(task_type));
            return;
        }
        debug!(
            task_id = %info.id(),
            task_type = %info.task_type(),
            queued = self.queue.len() + 1,
            "task queued"
        );
        info.notify(ProgressKind::Queued);
        self.queue.push_back(info);
    }

    pub(crate) fn has_tasks(&self) -> bool {
        !self.queue.is_empty() || self.live().any(|entry| entry.current.is_some())
    }

    pub(crate) fn needs_dispatch(&self) -> bool {
        !self.free.is_empty() && !self.queue.is_empty()
    }

    /// Hand queued tasks to free workers until no pair matches.
    ///
    /// Scans the queue front to back for the first task some free worker
    /// accepts, so a head task nobody free can run does not block the rest.
    pub(crate) fn dispatch(&mut self) -> usize {
        let mut assigned = 0;
        while let Some((queue_pos, free_pos)) = self.next_assignment() {
            if let (Some(info), Some(slot)) = (self.queue.remove(queue_pos), self.free.remove(free_pos))
            {
                self.assign(slot, info);
                assigned += 1;
            }
        }
        assigned
    }

    fn next_assignment(&self) -> Option<(usize, usize)> {
        if self.free.is_empty() {
            return None;
        }
        self.queue.iter().enumerate().find_map(|(queue_pos, info)| {
            self.free
                .iter()
                .position(|&slot| self.slot_accepts(slot, info.task_type()))
                .map(|free_pos| (queue_pos, free_pos))
        })
    }

    fn assign(&mut self, slot: usize, mut info: TaskInfo) {
        let Some(Slot::Live(entry)) = self.slots.get_mut(slot) else {
            warn!(slot, "free list pointed at a slot without a worker");
            self.queue.push_front(info);
            return;
        };
        info.mark_processing();
        debug!(
            task_id = %info.id(),
            task_type = %info.task_type(),
            worker_id = %entry.id,
            slot,
            "task dispatched"
        );
        match entry.handle.send(info.request()) {
            Ok(()) => entry.current = Some(info),
            Err(e) => {
                warn!(worker_id = %entry.id, slot, error = %e, "failed to send task");
                self.counters.failed += 1;
                info.complete(Err(TaskError::WorkerFault(e.to_string())));
                self.retire(slot);
            }
        }
    }

    pub(crate) fn cancel_pending(&mut self, id: TaskId) -> bool {
        let Some(pos) = self.queue.iter().position(|info| info.id() == id) else {
            return false;
        };
        let Some(mut info) = self.queue.remove(pos) else {
            return false;
        };
        debug!(task_id = %id, "pending task cancelled");
        self.counters.cancelled += 1;
        info.cancel();
        true
    }

    /// Cancel a queued or running task.
    ///
    /// A running task is reported cancelled right away. With `force_restart`
    /// its worker is terminated and replaced; otherwise the worker gets a
    /// cooperative cancel and stays busy until it answers. Forcing a task
    /// that was already cancelled cooperatively escalates to a restart.
    pub(crate) fn cancel_task(&mut self, id: TaskId, force_restart: bool) -> bool {
        if self.cancel_pending(id) {
            return true;
        }
        let Some(slot) = self.slot_running(id) else {
            return false;
        };
        let Some(Slot::Live(entry)) = self.slots.get_mut(slot) else {
            return false;
        };
        let Some(info) = entry.current.as_mut() else {
            return false;
        };

        if !info.is_cancelled() {
            info.notify(ProgressKind::Cancelling);
            info.cancel();
            self.counters.cancelled += 1;
        } else if !force_restart {
            return false;
        }

        if force_restart {
            info!(task_id = %id, worker_id = %entry.id, slot, "restarting worker to cancel task");
            self.retire(slot);
        } else {
            debug!(task_id = %id, worker_id = %entry.id, slot, "cooperative cancel sent");
            if let Err(e) = entry.handle.send(WorkerRequest::Cancel { id }) {
                warn!(worker_id = %entry.id, slot, error = %e, "failed to send cancel");
                self.retire(slot);
            }
        }
        true
    }

    pub(crate) fn on_event(&mut self, event: WorkerEvent) {
        let Some(slot) = self.slot_of(event.worker) else {
            debug!(worker_id = %event.worker, kind = ?event.kind, "ignoring event from retired worker");
            return;
        };
        match event.kind {
            WorkerEventKind::Message(msg) => self.on_message(slot, msg),
            WorkerEventKind::Error(reason) => self.on_fault(slot, reason),
            WorkerEventKind::Exit(Some(code)) => {
                self.on_fault(slot, format!("worker exited with code {code}"))
            }
            WorkerEventKind::Exit(None) => self.on_fault(slot, "worker exited".to_string()),
        }
    }

    fn on_message(&mut self, slot: usize, msg: WorkerResponse) {
        let Some(Slot::Live(entry)) = self.slots.get_mut(slot) else {
            return;
        };
        let (id, outcome) = match msg {
            WorkerResponse::Ready { .. } => {
                debug!(worker_id = %entry.id, "duplicate ready message");
                return;
            }
            WorkerResponse::Status {
                id,
                message,
                completion_percentage,
            } => {
                match entry.current.as_ref() {
                    Some(info) if info.id() == id && !info.is_cancelled() => {
                        info.notify(ProgressKind::Status {
                            message,
                            completion_percentage,
                        })
                    }
                    _ => debug!(task_id = %id, worker_id = %entry.id, "dropping stale status"),
                }
                return;
            }
            WorkerResponse::Result { id, result } => (id, Ok(result)),
            WorkerResponse::Error { id, error } => (id, Err(TaskError::Failed(error))),
            WorkerResponse::Cancelled { id } => (id, Err(TaskError::Cancelled)),
        };

        let Some(mut info) = entry.current.take_if(|info| info.id() == id) else {
            warn!(task_id = %id, worker_id = %entry.id, "terminal message for a task the worker is not running");
            return;
        };
        entry.tasks_completed += 1;
        self.free.push_back(slot);

        if info.is_cancelled() {
            debug!(task_id = %id, "discarding outcome of cancelled task");
            return;
        }
        match &outcome {
            Ok(_) => self.counters.completed += 1,
            Err(TaskError::Cancelled) => self.counters.cancelled += 1,
            Err(_) => self.counters.failed += 1,
        }
        debug!(task_id = %id, slot, ok = outcome.is_ok(), "task finished");
        info.complete(outcome);
    }

    fn on_fault(&mut self, slot: usize, reason: String) {
        let Some(Slot::Live(entry)) = self.slots.get(slot) else {
            return;
        };
        warn!(worker_id = %entry.id, slot, %reason, "worker fault");
        if let Some(mut info) = self.retire(slot)
            && !info.is_cancelled()
        {
            self.counters.failed += 1;
            info.complete(Err(TaskError::WorkerFault(reason)));
        }
    }

    /// Take the worker out of its slot and schedule its termination (and a
    /// replacement, unless closing). Returns the task it was running.
    fn retire(&mut self, slot: usize) -> Option<TaskInfo> {
        if !matches!(self.slots.get(slot), Some(Slot::Live(_))) {
            return None;
        }
        let respawn = self.restart_on_crash && !self.closing;
        let next = if respawn {
            Slot::Starting { attempt: 0 }
        } else {
            Slot::Down
        };
        let Slot::Live(entry) = mem::replace(&mut self.slots[slot], next) else {
            return None;
        };
        let WorkerEntry {
            id,
            handle,
            current,
            tasks_completed,
        } = entry;

        self.free.retain(|&s| s != slot);
        debug!(worker_id = %id, slot, tasks_completed, respawn, "retiring worker");
        self.effects.push(Effect::Terminate { worker: id, handle });
        if respawn {
            self.effects.push(Effect::Respawn { slot, attempt: 0 });
        } else if !self.closing {
            self.reject_stranded();
        }
        current
    }

    /// A replacement spawn for `slot` finished.
    pub(crate) fn on_spawned(&mut self, slot: usize, result: Result<(WorkerId, H), PoolError>) {
        let attempt = match self.slots.get(slot) {
            Some(Slot::Starting { attempt }) if !self.closing => *attempt,
            _ => {
                if let Ok((worker, handle)) = result {
                    debug!(worker_id = %worker, slot, "discarding unneeded replacement");
                    self.effects.push(Effect::Terminate { worker, handle });
                }
                return;
            }
        };
        match result {
            Ok((id, handle)) => {
                info!(worker_id = %id, slot, attempt, "replacement worker ready");
                self.slots[slot] = Slot::Live(WorkerEntry::new(id, handle));
                self.free.push_back(slot);
                self.counters.respawns += 1;
            }
            Err(e) => {
                let attempt = attempt + 1;
                warn!(slot, attempt, error = %e, "failed to start replacement worker");
                self.slots[slot] = Slot::Starting { attempt };
                self.effects.push(Effect::Respawn { slot, attempt });
            }
        }
    }

    /// Stop accepting work. Queued and running tasks are dropped without
    /// their callbacks; every live worker is terminated.
    pub(crate) fn close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        let dropped = self.queue.len();
        self.queue.clear();
        self.free.clear();

        let mut in_flight = 0;
        for slot in self.slots.iter_mut() {
            if let Slot::Live(entry) = mem::replace(slot, Slot::Down) {
                if entry.current.is_some() {
                    in_flight += 1;
                }
                self.effects.push(Effect::Terminate {
                    worker: entry.id,
                    handle: entry.handle,
                });
            }
        }
        info!(dropped, in_flight, "pool closing");
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            size: self.slots.len(),
            queued: self.queue.len(),
            completed: self.counters.completed,
            failed: self.counters.failed,
            cancelled: self.counters.cancelled,
            respawns: self.counters.respawns,
            ..PoolStats::default()
        };
        for slot in &self.slots {
            match slot {
                Slot::Live(entry) => {
                    stats.live += 1;
                    if entry.current.is_some() {
                        stats.busy += 1;
                    } else {
                        stats.idle += 1;
                    }
                }
                Slot::Starting { .. } => stats.starting += 1,
                Slot::Down => {}
            }
        }
        stats
    }

    fn live(&self) -> impl Iterator<Item = &WorkerEntry<H>> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Live(entry) => Some(entry),
            _ => None,
        })
    }

    fn slot_of(&self, worker: WorkerId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Live(entry) if entry.id == worker))
    }

    fn slot_running(&self, id: TaskId) -> Option<usize> {
        self.slots.iter().position(|slot| {
            matches!(slot, Slot::Live(entry) if entry.current.as_ref().is_some_and(|info| info.id() == id))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ProgressEvent;
    use crate::pool::info::fixtures::Outcomes;
    use crate::ports::ChannelProgressSink;
    use async_trait::async_trait;
    use std::sync::{Arc, Mutex};

    type SentLog = Arc<Mutex<Vec<(usize, WorkerRequest)>>>;

    /// Records what the pool sends; never runs anything.
    struct ManualHandle {
        id: WorkerId,
        slot: usize,
        sent: SentLog,
        broken: bool,
    }

    #[async_trait]
    impl WorkerHandle for ManualHandle {
        fn send(&mut self, request: WorkerRequest) -> Result<(), PoolError> {
            if self.broken {
                return Err(PoolError::Disconnected(self.id));
            }
            self.sent.lock().unwrap().push((self.slot, request));
            Ok(())
        }

        async fn terminate(self) -> Result<(), PoolError> {
            Ok(())
        }
    }

    struct Harness {
        state: PoolState<ManualHandle>,
        sent: SentLog,
        outcomes: Outcomes,
    }

    impl Harness {
        fn new(capabilities: Vec<Option<Capabilities>>) -> Self {
            let sent = SentLog::default();
            let workers = (0..capabilities.len())
                .map(|slot| {
                    let id = WorkerId::generate();
                    (id, Self::handle(&sent, id, slot))
                })
                .collect();
            Self {
                state: PoolState::new(workers, capabilities, true),
                sent,
                outcomes: Outcomes::default(),
            }
        }

        fn unrestricted(size: usize) -> Self {
            Self::new(vec![None; size])
        }

        fn handle(sent: &SentLog, id: WorkerId, slot: usize) -> ManualHandle {
            ManualHandle {
                id,
                slot,
                sent: sent.clone(),
                broken: false,
            }
        }

        fn submit(&mut self, task_type: &str) -> TaskId {
            let info = self.outcomes.info(task_type);
            let id = info.id();
            self.state.add_task(info);
            self.state.dispatch();
            id
        }

        fn worker(&self, slot: usize) -> WorkerId {
            match &self.state.slots[slot] {
                Slot::Live(entry) => entry.id,
                _ => panic!("slot {slot} has no live worker"),
            }
        }

        /// (slot, task id) of every task sent so far.
        fn dispatched(&self) -> Vec<(usize, TaskId)> {
            self.sent
                .lock()
                .unwrap()
                .iter()
                .filter_map(|(slot, req)| match req {
                    WorkerRequest::Task { id, .. } => Some((*slot, *id)),
                    _ => None,
                })
                .collect()
        }

        fn reply(&mut self, slot: usize, msg: WorkerResponse) {
            let worker = self.worker(slot);
            self.event(worker, WorkerEventKind::Message(msg));
        }

        fn event(&mut self, worker: WorkerId, kind: WorkerEventKind) {
            self.state.on_event(WorkerEvent { worker, kind });
            self.state.dispatch();
        }

        fn finish(&mut self, slot: usize, id: TaskId) {
            self.reply(
                slot,
                WorkerResponse::Result {
                    id,
                    result: serde_json::json!("done"),
                },
            );
        }

        /// Play the actor: replace every worker the state asked to respawn.
        fn respawn_all(&mut self) -> Vec<WorkerId> {
            let mut terminated = Vec::new();
            for effect in self.state.take_effects() {
                match effect {
                    Effect::Terminate { worker, .. } => terminated.push(worker),
                    Effect::Respawn { slot, .. } => {
                        let id = WorkerId::generate();
                        let handle = Self::handle(&self.sent, id, slot);
                        self.state.on_spawned(slot, Ok((id, handle)));
                    }
                }
            }
            self.state.dispatch();
            terminated
        }

        fn assert_invariants(&self) {
            let state = &self.state;
            for (slot, s) in state.slots.iter().enumerate() {
                let listed = state.free.iter().filter(|&&f| f == slot).count();
                match s {
                    Slot::Live(entry) if entry.current.is_none() && !state.closing => {
                        assert_eq!(listed, 1, "idle slot {slot} must be free exactly once")
                    }
                    _ => assert_eq!(listed, 0, "slot {slot} must not be free"),
                }
            }
        }
    }

    fn caps(types: &[&str]) -> Option<Capabilities> {
        Some(Capabilities::new(types.iter().copied()))
    }

    #[test]
    fn two_workers_three_tasks() {
        let mut h = Harness::unrestricted(2);
        let a = h.submit("render");
        let b = h.submit("render");
        let c = h.submit("render");

        assert_eq!(h.dispatched(), vec![(0, a), (1, b)]);
        assert_eq!(h.state.stats().queued, 1);
        assert!(h.state.has_tasks());

        h.finish(1, b);
        assert_eq!(h.dispatched().last(), Some(&(1, c)));
        assert!(h.state.has_tasks());

        h.finish(0, a);
        assert!(h.state.has_tasks());
        h.finish(1, c);
        assert!(!h.state.has_tasks());

        for id in [a, b, c] {
            assert_eq!(h.outcomes.for_task(id).len(), 1);
        }
        assert_eq!(h.state.stats().completed, 3);
        h.assert_invariants();
    }

    #[test]
    fn pending_cancel_never_reaches_a_worker() {
        let mut h = Harness::unrestricted(1);
        let running = h.submit("render");
        let pending = h.submit("render");

        assert!(h.state.cancel_pending(pending));
        assert!(!h.state.cancel_pending(pending));
        assert_eq!(h.outcomes.for_task(pending), vec![Err(TaskError::Cancelled)]);
        assert_eq!(*h.outcomes.cancel_calls.lock().unwrap(), vec![pending]);

        h.finish(0, running);
        assert!(!h.state.has_tasks());
        assert!(h.dispatched().iter().all(|(_, id)| *id != pending));
        h.assert_invariants();
    }

    #[test]
    fn forced_cancel_replaces_the_worker() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        let original = h.worker(0);

        assert!(h.state.cancel_task(task, true));
        assert_eq!(h.outcomes.for_task(task), vec![Err(TaskError::Cancelled)]);

        let stats = h.state.stats();
        assert_eq!((stats.size, stats.live, stats.starting), (1, 0, 1));
        assert!(!h.state.has_tasks());

        let terminated = h.respawn_all();
        assert_eq!(terminated, vec![original]);
        assert_ne!(h.worker(0), original);
        let stats = h.state.stats();
        assert_eq!((stats.size, stats.live, stats.idle, stats.respawns), (1, 1, 1, 1));

        // the old worker's late answer is ignored
        h.event(
            original,
            WorkerEventKind::Message(WorkerResponse::Result {
                id: task,
                result: serde_json::json!("late"),
            }),
        );
        assert_eq!(h.outcomes.count(), 1);
        h.assert_invariants();
    }

    #[test]
    fn incapable_head_task_does_not_block_the_queue() {
        let mut h = Harness::new(vec![caps(&["render"]), caps(&["process"])]);
        let blocker = h.submit("process");
        assert_eq!(h.dispatched(), vec![(1, blocker)]);

        // slot 1 is busy: "process" waits while "render" overtakes it
        let process = h.submit("process");
        let render = h.submit("render");
        assert_eq!(h.dispatched(), vec![(1, blocker), (0, render)]);
        assert_eq!(h.state.stats().queued, 1);

        h.finish(1, blocker);
        assert_eq!(h.dispatched().last(), Some(&(1, process)));
        h.assert_invariants();
    }

    #[test]
    fn capability_matching_assigns_each_task_to_its_worker() {
        let mut h = Harness::new(vec![caps(&["render"]), caps(&["process"])]);
        let process = h.submit("process");
        let render = h.submit("render");
        assert_eq!(h.dispatched(), vec![(1, process), (0, render)]);
    }

    #[test]
    fn single_worker_starts_tasks_in_submission_order() {
        let mut h = Harness::unrestricted(1);
        let ids: Vec<TaskId> = (0..4).map(|_| h.submit("render")).collect();
        for &id in &ids {
            h.finish(0, id);
        }
        let started: Vec<TaskId> = h.dispatched().into_iter().map(|(_, id)| id).collect();
        assert_eq!(started, ids);
    }

    #[test]
    fn cooperative_cancel_keeps_worker_busy_until_it_answers() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        let queued = h.submit("render");

        assert!(h.state.cancel_task(task, false));
        assert_eq!(h.outcomes.for_task(task), vec![Err(TaskError::Cancelled)]);
        assert!(matches!(
            h.sent.lock().unwrap().last(),
            Some((0, WorkerRequest::Cancel { id })) if *id == task
        ));
        assert_eq!(h.state.stats().busy, 1);
        assert!(!h.state.cancel_task(task, false));

        h.reply(0, WorkerResponse::Cancelled { id: task });
        assert_eq!(h.outcomes.for_task(task).len(), 1);
        assert_eq!(h.dispatched().last(), Some(&(0, queued)));
        assert!(h.state.take_effects().is_empty());
        h.assert_invariants();
    }

    #[test]
    fn result_racing_a_cooperative_cancel_is_discarded() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        h.state.cancel_task(task, false);

        h.finish(0, task);
        assert_eq!(h.outcomes.for_task(task), vec![Err(TaskError::Cancelled)]);
        assert_eq!(h.state.stats().completed, 0);
        assert!(!h.state.has_tasks());
    }

    #[test]
    fn forcing_after_cooperative_cancel_escalates() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        h.state.cancel_task(task, false);

        assert!(h.state.cancel_task(task, true));
        assert_eq!(h.outcomes.count(), 1);
        assert_eq!(h.state.stats().starting, 1);
    }

    #[test]
    fn cancel_of_unknown_or_finished_task_is_a_no_op() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        h.finish(0, task);

        assert!(!h.state.cancel_task(task, true));
        assert!(!h.state.cancel_task(TaskId::generate(), false));
        assert_eq!(h.outcomes.for_task(task), vec![Ok(serde_json::json!("done"))]);
        assert!(h.state.take_effects().is_empty());
    }

    #[test]
    fn handler_error_keeps_worker_in_service() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        let worker = h.worker(0);
        h.reply(0, WorkerResponse::error(task, "corrupt tile"));

        assert_eq!(
            h.outcomes.for_task(task),
            vec![Err(TaskError::Failed("corrupt tile".into()))]
        );
        assert_eq!(h.worker(0), worker);
        assert!(h.state.take_effects().is_empty());
    }

    #[test]
    fn crash_fails_running_task_and_restores_size() {
        let mut h = Harness::unrestricted(2);
        let a = h.submit("render");
        let b = h.submit("render");
        let queued = h.submit("render");
        let crashed = h.worker(0);

        h.event(crashed, WorkerEventKind::Exit(Some(137)));
        match h.outcomes.for_task(a).as_slice() {
            [Err(TaskError::WorkerFault(reason))] => assert!(reason.contains("137")),
            other => panic!("Expected one WorkerFault, got {other:?}"),
        }
        assert_eq!(h.state.stats().queued, 1);

        assert_eq!(h.respawn_all(), vec![crashed]);
        assert_eq!(h.state.stats().live, 2);
        assert_eq!(h.dispatched().last(), Some(&(0, queued)));

        h.finish(1, b);
        h.finish(0, queued);
        assert!(!h.state.has_tasks());
        h.assert_invariants();
    }

    #[test]
    fn error_then_exit_replaces_worker_once() {
        let mut h = Harness::unrestricted(1);
        let worker = h.worker(0);
        h.event(worker, WorkerEventKind::Error("pipe closed".into()));
        h.event(worker, WorkerEventKind::Exit(None));

        let effects = h.state.take_effects();
        let respawns = effects
            .iter()
            .filter(|e| matches!(e, Effect::Respawn { .. }))
            .count();
        assert_eq!(respawns, 1);
        assert_eq!(h.outcomes.count(), 0);
    }

    #[test]
    fn failed_respawn_is_retried_with_growing_attempt() {
        let mut h = Harness::unrestricted(1);
        let worker = h.worker(0);
        h.event(worker, WorkerEventKind::Exit(Some(1)));
        h.state.take_effects();

        h.state.on_spawned(
            0,
            Err(PoolError::Spawn {
                slot: 0,
                reason: "fork failed".into(),
            }),
        );
        assert!(matches!(
            h.state.take_effects().as_slice(),
            [Effect::Respawn { slot: 0, attempt: 1 }]
        ));
        assert_eq!(h.state.stats().starting, 1);
    }

    #[test]
    fn tasks_queue_while_slot_is_restarting() {
        let mut h = Harness::unrestricted(1);
        let worker = h.worker(0);
        h.event(worker, WorkerEventKind::Exit(Some(1)));

        let waiting = h.submit("render");
        assert!(h.dispatched().is_empty());
        assert!(h.state.has_tasks());

        h.respawn_all();
        assert_eq!(h.dispatched(), vec![(0, waiting)]);
    }

    #[test]
    fn crash_without_restart_leaves_slot_down() {
        let sent = SentLog::default();
        let id = WorkerId::generate();
        let mut state = PoolState::new(vec![(id, Harness::handle(&sent, id, 0))], vec![None], false);
        state.on_event(WorkerEvent {
            worker: id,
            kind: WorkerEventKind::Exit(Some(1)),
        });

        assert!(matches!(
            state.take_effects().as_slice(),
            [Effect::Terminate { .. }]
        ));
        let stats = state.stats();
        assert_eq!((stats.size, stats.live, stats.starting), (1, 0, 0));
    }

    #[test]
    fn submission_after_last_slot_went_down_is_rejected() {
        let sent = SentLog::default();
        let id = WorkerId::generate();
        let mut state = PoolState::new(vec![(id, Harness::handle(&sent, id, 0))], vec![None], false);
        let outcomes = Outcomes::default();
        state.on_event(WorkerEvent {
            worker: id,
            kind: WorkerEventKind::Exit(Some(1)),
        });

        let info = outcomes.info("render");
        let task = info.id();
        state.add_task(info);
        state.dispatch();

        assert_eq!(
            outcomes.for_task(task),
            vec![Err(TaskError::Unsupported(TaskType::new("render")))]
        );
        assert!(!state.has_tasks());
        assert_eq!(state.stats().queued, 0);
    }

    #[test]
    fn queued_tasks_fail_when_their_only_capable_slot_goes_down() {
        let sent = SentLog::default();
        let (render, process) = (WorkerId::generate(), WorkerId::generate());
        let mut state = PoolState::new(
            vec![
                (render, Harness::handle(&sent, render, 0)),
                (process, Harness::handle(&sent, process, 1)),
            ],
            vec![caps(&["render"]), caps(&["process"])],
            false,
        );
        let outcomes = Outcomes::default();

        // occupy the render worker, then queue one more of each type
        let running = outcomes.info("render");
        let running_id = running.id();
        state.add_task(running);
        state.dispatch();
        let stranded = outcomes.info("render");
        let stranded_id = stranded.id();
        state.add_task(stranded);
        state.dispatch();

        state.on_event(WorkerEvent {
            worker: render,
            kind: WorkerEventKind::Exit(Some(1)),
        });

        assert!(matches!(
            outcomes.for_task(running_id).as_slice(),
            [Err(TaskError::WorkerFault(_))]
        ));
        assert_eq!(
            outcomes.for_task(stranded_id),
            vec![Err(TaskError::Unsupported(TaskType::new("render")))]
        );
        assert!(!state.has_tasks());

        // the other slot still takes its own type
        let other = outcomes.info("process");
        let other_id = other.id();
        state.add_task(other);
        state.dispatch();
        assert!(outcomes.for_task(other_id).is_empty());
        assert!(state.has_tasks());
    }

    #[test]
    fn send_failure_is_a_worker_fault() {
        let sent = SentLog::default();
        let id = WorkerId::generate();
        let mut handle = Harness::handle(&sent, id, 0);
        handle.broken = true;
        let mut state = PoolState::new(vec![(id, handle)], vec![None], true);
        let outcomes = Outcomes::default();

        let info = outcomes.info("render");
        let task = info.id();
        state.add_task(info);
        state.dispatch();

        assert!(matches!(
            outcomes.for_task(task).as_slice(),
            [Err(TaskError::WorkerFault(_))]
        ));
        assert_eq!(state.stats().starting, 1);
    }

    #[test]
    fn unsupported_task_type_is_rejected_at_submission() {
        let mut h = Harness::new(vec![caps(&["render"])]);
        let task = h.submit("process");

        assert_eq!(
            h.outcomes.for_task(task),
            vec![Err(TaskError::Unsupported(TaskType::new("process")))]
        );
        assert!(!h.state.has_tasks());
        assert!(h.dispatched().is_empty());
    }

    #[test]
    fn close_drops_work_without_callbacks() {
        let mut h = Harness::unrestricted(1);
        h.submit("render");
        h.submit("render");

        h.state.close();
        assert_eq!(h.outcomes.count(), 0);
        assert!(!h.state.has_tasks());
        assert!(matches!(
            h.state.take_effects().as_slice(),
            [Effect::Terminate { .. }]
        ));

        let late = h.submit("render");
        assert_eq!(h.outcomes.for_task(late), vec![Err(TaskError::PoolClosed)]);
        h.assert_invariants();
    }

    #[test]
    fn replacement_arriving_after_close_is_terminated() {
        let mut h = Harness::unrestricted(1);
        let worker = h.worker(0);
        h.event(worker, WorkerEventKind::Exit(None));
        h.state.take_effects();
        h.state.close();

        let id = WorkerId::generate();
        let handle = Harness::handle(&h.sent, id, 0);
        h.state.on_spawned(0, Ok((id, handle)));
        assert!(matches!(
            h.state.take_effects().as_slice(),
            [Effect::Terminate { worker, .. }] if *worker == id
        ));
        assert_eq!(h.state.stats().live, 0);
    }

    #[test]
    fn progress_follows_the_task_lifecycle() {
        let mut h = Harness::unrestricted(1);
        let (sink, mut rx) = ChannelProgressSink::channel();
        let info = h.outcomes.info_with_sink("render", Some(Arc::new(sink)));
        let task = info.id();
        h.state.add_task(info);
        h.state.dispatch();
        h.reply(
            0,
            WorkerResponse::Status {
                id: task,
                message: "warping".into(),
                completion_percentage: Some(30.0),
            },
        );
        h.state.cancel_task(task, false);
        // after cancel, status updates stop
        h.reply(
            0,
            WorkerResponse::Status {
                id: task,
                message: "still warping".into(),
                completion_percentage: Some(60.0),
            },
        );

        let mut kinds = Vec::new();
        while let Ok(ProgressEvent { kind, .. }) = rx.try_recv() {
            kinds.push(kind);
        }
        assert_eq!(
            kinds,
            vec![
                ProgressKind::Queued,
                ProgressKind::Processing,
                ProgressKind::Status {
                    message: "warping".into(),
                    completion_percentage: Some(30.0),
                },
                ProgressKind::Cancelling,
            ]
        );
    }

    #[test]
    fn terminal_message_for_another_task_is_ignored() {
        let mut h = Harness::unrestricted(1);
        let task = h.submit("render");
        h.finish(0, TaskId::generate());

        assert_eq!(h.outcomes.count(), 0);
        assert_eq!(h.state.stats().busy, 1);
        h.finish(0, task);
        assert_eq!(h.outcomes.count(), 1);
    }
}
