use std::time::Instant;

use flume::Sender;
use tracing::debug;

use crate::actor::config::Config;
use crate::actor::network::Network;
use crate::actor::sender::Target;
use crate::protocol::{Body, Command, Package, PingBody};
use crate::ResultCode;

use super::{Progress, TaskState};

#[derive(Debug)]
/// Ping a peer until it answers or the task times out.
pub(crate) struct PingTask {
    state: TaskState,
    target: Target,
    tries: u32,
    max_try: u32,
    waiters: Vec<Sender<ResultCode>>,
}

impl PingTask {
    pub fn new(
        id: u32,
        target: Target,
        waiter: Option<Sender<ResultCode>>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            state: TaskState::new(id, config, now),
            target,
            tries: 0,
            max_try: config.task_max_try,
            waiters: waiter.into_iter().collect(),
        }
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn peerid(&self) -> &str {
        &self.target.peerid
    }

    pub fn add_waiter(&mut self, waiter: Sender<ResultCode>) {
        self.waiters.push(waiter);
    }

    /// Move the waiters of an identical ping over to this one.
    pub fn absorb(&mut self, other: PingTask) {
        self.waiters.extend(other.waiters);
    }

    pub fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        if self.send(net, now) {
            Progress::Running
        } else {
            Progress::Done(ResultCode::Failed)
        }
    }

    pub fn on_response(&mut self, package: &Package, _now: Instant) -> Progress {
        if package.command() == Command::Ping {
            Progress::Done(ResultCode::Success)
        } else {
            Progress::Running
        }
    }

    /// Resend until the tries run out, then wait for the deadline.
    pub fn on_idle(&mut self, net: &mut Network, now: Instant) -> Progress {
        self.state.touch(now);

        if self.tries < self.max_try {
            self.send(net, now);
        }

        Progress::Running
    }

    pub fn finish(self, code: ResultCode) {
        for waiter in self.waiters {
            let _ = waiter.send(code);
        }
    }

    fn send(&mut self, net: &mut Network, now: Instant) -> bool {
        self.tries += 1;

        match net.request(&self.target, Body::Ping(PingBody {}), 0, now) {
            Ok(_) => true,
            Err(error) => {
                debug!(context = "ping", ?error, peerid = %self.target.peerid, "Ping failed");
                false
            }
        }
    }
}
