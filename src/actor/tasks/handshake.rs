//! Hole punching over `HOLE_CALL`, `HOLE_CALLED` and `HANDSHAKE`.
//!
//! The source asks an agency connected to the target to introduce it. The
//! agency answers with the endpoints it knows for the target and tells the
//! target to expect the source. Both ends then send handshakes to each other's
//! candidate endpoints until one of them gets through.

use std::time::Instant;

use tracing::{debug, trace};

use crate::actor::config::Config;
use crate::actor::network::Network;
use crate::actor::sender::Target;
use crate::common::Endpoint;
use crate::protocol::{parse_eplist, Body, HandshakeBody, HoleCallBody, HoleCalledBody, Package};
use crate::ResultCode;

use super::{Progress, TaskKey, TaskState};

#[derive(Debug)]
enum Role {
    /// We want to reach the peer.
    Source { agency: Option<String> },
    /// An agency told us the peer wants to reach us.
    Target,
}

#[derive(Debug)]
pub(crate) struct HandshakeTask {
    state: TaskState,
    role: Role,
    peer: Target,
    started: Instant,
    tries: u32,
    max_try: u32,
}

impl HandshakeTask {
    pub fn source(
        id: u32,
        peer: Target,
        agency: Option<String>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self::new(id, Role::Source { agency }, peer, config, now)
    }

    pub fn target(id: u32, peer: Target, config: &Config, now: Instant) -> Self {
        Self::new(id, Role::Target, peer, config, now)
    }

    fn new(id: u32, role: Role, peer: Target, config: &Config, now: Instant) -> Self {
        Self {
            state: TaskState::new(id, config, now),
            role,
            peer,
            started: now,
            tries: 0,
            max_try: config.task_max_try,
        }
    }

    // === Getters ===

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn peerid(&self) -> &str {
        &self.peer.peerid
    }

    // === Public Methods ===

    pub fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        let mut attempted = self.send_handshakes(net, &self.peer.candidates.clone(), now);

        if let Role::Source {
            agency: Some(agency),
        } = &self.role
        {
            match net.target(agency) {
                Some(agency_target) => {
                    let body = Body::HoleCall(HoleCallBody {
                        taskid: self.state.id,
                        target: self.peer.peerid.clone(),
                        eplist: net.local.eplist().iter().map(|ep| ep.to_string()).collect(),
                    });

                    match net.request(&agency_target, body, 0, now) {
                        Ok(_) => attempted = true,
                        Err(error) => {
                            debug!(context = "handshake", ?error, %agency, "Failed to ask agency")
                        }
                    }
                }
                None => trace!(context = "handshake", %agency, "Agency is not in the routing table"),
            }
        }

        if attempted {
            Progress::Running
        } else {
            Progress::Done(ResultCode::Failed)
        }
    }

    pub fn on_response(&mut self, net: &mut Network, package: &Package, now: Instant) -> Progress {
        match &package.body {
            Body::Handshake(_) => Progress::Done(ResultCode::Success),
            Body::HoleCall(body) => {
                // The agency's view of the peer's endpoints.
                let learned: Vec<Endpoint> = parse_eplist(&body.eplist)
                    .into_iter()
                    .filter(|ep| !self.peer.candidates.contains(ep))
                    .collect();

                if let Some(peer) = net.bucket.get_peer_mut(&self.peer.peerid) {
                    peer.union_eplist(&learned);
                }
                self.peer.candidates.extend(learned.iter().copied());
                self.state.touch(now);

                self.send_handshakes(net, &learned, now);
                Progress::Running
            }
            _ => Progress::Running,
        }
    }

    pub fn on_idle(&mut self, net: &mut Network, now: Instant) -> Progress {
        self.state.touch(now);

        let connected = net
            .bucket
            .get_peer(&self.peer.peerid)
            .and_then(|peer| peer.last_recv())
            .is_some_and(|recv| recv > self.started);
        if connected {
            return Progress::Done(ResultCode::Success);
        }

        if self.tries < self.max_try {
            self.tries += 1;
            self.send_handshakes(net, &self.peer.candidates.clone(), now);
        }

        Progress::Running
    }

    pub fn finish(self, code: ResultCode) {
        trace!(
            context = "handshake",
            id = self.state.id,
            peerid = %self.peer.peerid,
            ?code,
            "Handshake finished"
        );
    }

    // === Private Methods ===

    /// One handshake per candidate, each one may open a different NAT mapping.
    fn send_handshakes(&self, net: &mut Network, candidates: &[Endpoint], now: Instant) -> bool {
        let mut sent = false;

        for endpoint in candidates {
            let body = Body::Handshake(HandshakeBody {
                taskid: self.state.id,
            });
            match net.request(&self.peer.via(*endpoint), body, 0, now) {
                Ok(_) => sent = true,
                Err(error) => trace!(context = "handshake", ?error, %endpoint, "Handshake not sent"),
            }
        }

        sent
    }
}

#[derive(Debug)]
/// Tells a target behind a NAT to expect a handshake from the source.
pub(crate) struct AgencyTask {
    state: TaskState,
    source: String,
    source_taskid: u32,
    source_eplist: Vec<Endpoint>,
    target: Target,
    tries: u32,
    max_try: u32,
}

impl AgencyTask {
    pub fn new(
        id: u32,
        source: String,
        source_taskid: u32,
        source_eplist: Vec<Endpoint>,
        target: Target,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            state: TaskState::new(id, config, now),
            source,
            source_taskid,
            source_eplist,
            target,
            tries: 0,
            max_try: config.task_max_try,
        }
    }

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::Agency {
            source: self.source.clone(),
            taskid: self.source_taskid,
        }
    }

    pub fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        if self.send(net, now) {
            Progress::Running
        } else {
            Progress::Done(ResultCode::Failed)
        }
    }

    pub fn on_response(&mut self, package: &Package, _now: Instant) -> Progress {
        match package.body {
            Body::HoleCalled(_) => Progress::Done(ResultCode::Success),
            _ => Progress::Running,
        }
    }

    pub fn on_idle(&mut self, net: &mut Network, now: Instant) -> Progress {
        self.state.touch(now);

        if self.tries < self.max_try {
            self.send(net, now);
        }

        Progress::Running
    }

    fn send(&mut self, net: &mut Network, now: Instant) -> bool {
        self.tries += 1;

        let body = Body::HoleCalled(HoleCalledBody {
            taskid: self.state.id,
            source: self.source.clone(),
            eplist: self.source_eplist.iter().map(|ep| ep.to_string()).collect(),
        });

        match net.request(&self.target, body, 0, now) {
            Ok(_) => true,
            Err(error) => {
                debug!(context = "agency", ?error, target = %self.target.peerid, "Failed to call target");
                false
            }
        }
    }
}
