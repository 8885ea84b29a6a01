//! Long running operations driven by responses and the periodic wake sweep.

pub(crate) mod handshake;
pub(crate) mod piece;
pub(crate) mod ping;
pub(crate) mod touch;

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::PeerInfo;
use crate::protocol::Package;
use crate::ResultCode;

use super::config::Config;
use super::network::Network;

use handshake::{AgencyTask, HandshakeTask};
use piece::PieceSendTask;
use ping::PingTask;
use touch::{TouchKind, TouchNodeTask};

/// Bound on tasks started from within other tasks in one pass.
const MAX_SPAWN_ROUNDS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of [crate::Dht::find_peer].
pub struct FindPeerResult {
    pub result: ResultCode,
    /// Peers seen during the lookup, closest to the target first.
    pub peers: Vec<PeerInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of [crate::Dht::get_value].
pub struct GetValueResult {
    pub result: ResultCode,
    pub values: BTreeMap<String, String>,
    /// Peerids that processed the request.
    pub reached: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// Result of [crate::Dht::save_value] and [crate::Dht::emit_broadcast_event].
pub struct TouchResult {
    pub result: ResultCode,
    /// Peerids that processed the request.
    pub reached: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct TaskState {
    pub id: u32,
    deadline: Instant,
    last_active: Instant,
    retry_interval: Duration,
}

impl TaskState {
    pub fn new(id: u32, config: &Config, now: Instant) -> Self {
        Self {
            id,
            deadline: now + config.task_timeout,
            last_active: now,
            retry_interval: config.task_retry_interval,
        }
    }

    pub fn touch(&mut self, now: Instant) {
        self.last_active = now;
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    pub fn is_idle(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.last_active) >= self.retry_interval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Progress {
    Running,
    Done(ResultCode),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
/// Identity of an in-flight request, identical requests join the running task.
pub(crate) enum TaskKey {
    FindPeer {
        service: Option<String>,
        peerid: String,
    },
    GetValue {
        table: String,
        keys: Vec<String>,
        fuzzy: bool,
    },
    SaveValue {
        table: String,
    },
    Ping(String),
    Handshake(String),
    Agency {
        source: String,
        taskid: u32,
    },
}

#[derive(Debug)]
pub(crate) enum Task {
    Touch(TouchNodeTask),
    Ping(PingTask),
    PieceSend(PieceSendTask),
    Handshake(HandshakeTask),
    Agency(AgencyTask),
}

impl Task {
    fn state(&self) -> &TaskState {
        match self {
            Task::Touch(task) => task.state(),
            Task::Ping(task) => task.state(),
            Task::PieceSend(task) => task.state(),
            Task::Handshake(task) => task.state(),
            Task::Agency(task) => task.state(),
        }
    }

    pub fn id(&self) -> u32 {
        self.state().id
    }

    fn key(&self) -> Option<TaskKey> {
        match self {
            Task::Touch(task) => task.key(),
            Task::Ping(task) => Some(TaskKey::Ping(task.peerid().to_string())),
            Task::PieceSend(_) => None,
            Task::Handshake(task) => Some(TaskKey::Handshake(task.peerid().to_string())),
            Task::Agency(task) => Some(task.key()),
        }
    }

    fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        match self {
            Task::Touch(task) => task.start(net, now),
            Task::Ping(task) => task.start(net, now),
            Task::PieceSend(task) => task.start(net, now),
            Task::Handshake(task) => task.start(net, now),
            Task::Agency(task) => task.start(net, now),
        }
    }

    fn on_response(&mut self, net: &mut Network, package: &Package, now: Instant) -> Progress {
        match self {
            Task::Touch(task) => task.on_response(net, package, now),
            Task::Ping(task) => task.on_response(package, now),
            Task::PieceSend(task) => task.on_response(net, package, now),
            Task::Handshake(task) => task.on_response(net, package, now),
            Task::Agency(task) => task.on_response(package, now),
        }
    }

    fn on_idle(&mut self, net: &mut Network, now: Instant) -> Progress {
        match self {
            Task::Touch(task) => task.on_idle(net, now),
            Task::Ping(task) => task.on_idle(net, now),
            Task::PieceSend(task) => task.on_idle(net, now),
            Task::Handshake(task) => task.on_idle(net, now),
            Task::Agency(task) => task.on_idle(net, now),
        }
    }

    /// Deliver the final result to every waiter.
    fn finish(self, code: ResultCode) {
        match self {
            Task::Touch(task) => task.finish(code),
            Task::Ping(task) => task.finish(code),
            Task::PieceSend(task) => task.finish(code),
            Task::Handshake(task) => task.finish(code),
            Task::Agency(_) => {}
        }
    }
}

#[derive(Debug, Default)]
/// Running tasks by id, plus the index used to coalesce identical requests.
pub(crate) struct TaskMgr {
    tasks: HashMap<u32, Task>,
    keys: HashMap<TaskKey, u32>,
}

impl TaskMgr {
    pub fn new() -> Self {
        Self::default()
    }

    // === Getters ===

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn find(&self, key: &TaskKey) -> Option<u32> {
        self.keys.get(key).copied()
    }

    /// The running lookup for `key`, to attach another waiter or merge values.
    pub fn touch_mut(&mut self, key: &TaskKey) -> Option<&mut TouchNodeTask> {
        let id = self.keys.get(key)?;
        match self.tasks.get_mut(id) {
            Some(Task::Touch(task)) => Some(task),
            _ => None,
        }
    }

    pub fn ping_mut(&mut self, peerid: &str) -> Option<&mut PingTask> {
        let id = self.keys.get(&TaskKey::Ping(peerid.to_string()))?;
        match self.tasks.get_mut(id) {
            Some(Task::Ping(task)) => Some(task),
            _ => None,
        }
    }

    // === Public Methods ===

    /// Start a task and keep it running unless it completed right away.
    pub fn add(&mut self, net: &mut Network, task: Task, now: Instant) {
        net.spawn(task);
        self.adopt_spawned(net, now);
    }

    /// Route a response to the task that sent the request.
    pub fn on_response(&mut self, id: u32, net: &mut Network, package: &Package, now: Instant) {
        let Some(task) = self.tasks.get_mut(&id) else {
            trace!(context = "tasks", id, "Response for a finished or unknown task");
            return;
        };

        if let Progress::Done(code) = task.on_response(net, package, now) {
            self.complete(id, code);
        }

        self.adopt_spawned(net, now);
    }

    pub fn on_ping_response(&mut self, net: &mut Network, package: &Package, now: Instant) {
        let Some(src) = package.src_peerid() else {
            return;
        };
        if let Some(id) = self.find(&TaskKey::Ping(src.to_string())) {
            self.on_response(id, net, package, now);
        }
    }

    /// Complete a running task from outside, ignoring unknown keys.
    pub fn complete_key(&mut self, key: &TaskKey, code: ResultCode) {
        if let Some(id) = self.find(key) {
            self.complete(id, code);
        }
    }

    /// Time out expired tasks and let idle ones retry.
    pub fn wake(&mut self, net: &mut Network, now: Instant) {
        let ids: Vec<u32> = self.tasks.keys().copied().collect();

        for id in ids {
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };

            if task.state().is_expired(now) {
                debug!(context = "tasks", id, "Task timed out");
                self.complete(id, ResultCode::Timeout);
                continue;
            }

            if task.state().is_idle(now) {
                if let Progress::Done(code) = task.on_idle(net, now) {
                    self.complete(id, code);
                }
            }
        }

        self.adopt_spawned(net, now);
    }

    /// Complete every task with [ResultCode::Stopped].
    pub fn stop_all(&mut self) {
        self.keys.clear();
        for (_, task) in self.tasks.drain() {
            task.finish(ResultCode::Stopped);
        }
    }

    /// Waiters attach to a running FindPeer or GetValue, values merge into a running SaveValue.
    ///
    /// Returns the task back if there is nothing to join.
    pub fn join(&mut self, net: &mut Network, task: TouchNodeTask, now: Instant) -> Option<TouchNodeTask> {
        let Some(key) = task.key() else {
            return Some(task);
        };

        match self.touch_mut(&key) {
            Some(running) => {
                running.absorb(net, task, now);
                None
            }
            None => Some(task),
        }
    }

    /// Start tasks spawned by other tasks, like fragment sends and handshakes.
    pub fn adopt_spawned(&mut self, net: &mut Network, now: Instant) {
        for _ in 0..MAX_SPAWN_ROUNDS {
            let spawned = net.take_spawned();
            if spawned.is_empty() {
                return;
            }

            for mut task in spawned {
                if let Some(key) = task.key() {
                    if let Some(&running) = self.keys.get(&key) {
                        self.merge_duplicate(net, running, task, now);
                        continue;
                    }
                }

                match task.start(net, now) {
                    Progress::Done(code) => task.finish(code),
                    Progress::Running => {
                        if let Some(key) = task.key() {
                            self.keys.insert(key, task.id());
                        }
                        self.tasks.insert(task.id(), task);
                    }
                }
            }
        }
    }

    // === Private Methods ===

    /// A spawned task identical to a running one: its waiters join the running
    /// task where the kinds allow it, otherwise they learn it is still pending.
    fn merge_duplicate(&mut self, net: &mut Network, running: u32, task: Task, now: Instant) {
        match (self.tasks.get_mut(&running), task) {
            (Some(Task::Touch(running)), Task::Touch(task)) => running.absorb(net, task, now),
            (Some(Task::Ping(running)), Task::Ping(task)) => running.absorb(task),
            (_, task) => {
                trace!(context = "tasks", id = task.id(), "Duplicate of a running task");
                task.finish(ResultCode::Pending);
            }
        }
    }

    fn complete(&mut self, id: u32, code: ResultCode) {
        let Some(task) = self.tasks.remove(&id) else {
            return;
        };

        if let Some(key) = task.key() {
            if self.keys.get(&key) == Some(&id) {
                self.keys.remove(&key);
            }
        }

        trace!(context = "tasks", id, ?code, "Task complete");
        task.finish(code);
    }
}

/// Internal lookups started without a caller.
pub(crate) fn internal_find_peer(net: &mut Network, peerid: String, now: Instant) -> Task {
    let id = net.next_task_id();
    Task::Touch(TouchNodeTask::new(
        id,
        TouchKind::find_peer(peerid, Vec::new()),
        None,
        &net.config,
        now,
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::actor::sender::{PackageSender, Target};
    use crate::actor::transport::MemoryNetwork;
    use crate::common::{LocalPeer, Protocol};

    fn network(memory: &MemoryNetwork) -> Network {
        let config = Config::default();
        let transport = memory.transport(Protocol::Udp);
        let info = PeerInfo::new("node").with_endpoint(transport.endpoint());
        let local = LocalPeer::new(&info, config.local_peer_settings(), Instant::now());
        let sender = PackageSender::new(Box::new(transport), &config);

        Network::new(local, sender, config)
    }

    #[test]
    fn spawned_duplicate_joins_the_running_task() {
        let memory = MemoryNetwork::new();
        let mut net = network(&memory);
        let mut tasks = TaskMgr::new();
        let now = Instant::now();

        let bob = memory.transport(Protocol::Udp);
        let target = Target::from_info(&PeerInfo::new("bob").with_endpoint(bob.endpoint()), None);

        let (first, first_receiver) = flume::bounded(1);
        let (second, second_receiver) = flume::bounded(1);

        for waiter in [first, second] {
            let id = net.next_task_id();
            let task = PingTask::new(id, target.clone(), Some(waiter), &net.config, now);
            net.spawn(Task::Ping(task));
        }
        tasks.adopt_spawned(&mut net, now);

        assert_eq!(tasks.len(), 1);
        assert!(second_receiver.is_empty());

        tasks.stop_all();

        assert_eq!(first_receiver.try_recv(), Ok(ResultCode::Stopped));
        assert_eq!(second_receiver.try_recv(), Ok(ResultCode::Stopped));
    }

    #[test]
    fn spawned_duplicate_handshake_is_not_started_twice() {
        let memory = MemoryNetwork::new();
        let mut net = network(&memory);
        let mut tasks = TaskMgr::new();
        let now = Instant::now();

        let bob = memory.transport(Protocol::Udp);
        let target = Target::from_info(&PeerInfo::new("bob").with_endpoint(bob.endpoint()), None);

        for _ in 0..2 {
            let id = net.next_task_id();
            let task = HandshakeTask::source(id, target.clone(), None, &net.config, now);
            net.spawn(Task::Handshake(task));
        }
        tasks.adopt_spawned(&mut net, now);

        assert_eq!(tasks.len(), 1);
    }
}
