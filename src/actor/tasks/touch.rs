//! Iterative lookups: FindPeer, GetValue, SaveValue and broadcasts.
//!
//! Every kind sends the same request to an initial set of peers, merges the
//! reached set from responses and fans out to referred peers. Convergent kinds
//! only follow referrals that make it into the K closest to the target, a
//! broadcast follows referrals until it reached enough peers.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Instant;

use flume::Sender;
use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::actor::config::Config;
use crate::actor::network::Network;
use crate::actor::sender::{SendError, Target};
use crate::common::{Closest, Hash, Hashed, PeerInfo};
use crate::protocol::{
    Body, BroadcastEventBody, FindPeerBody, GetValueBody, Package, SaveValueBody,
};
use crate::ResultCode;

use super::handshake::HandshakeTask;
use super::{FindPeerResult, GetValueResult, Progress, Task, TaskKey, TaskState, TouchResult};

#[derive(Debug, Clone)]
struct Seen {
    info: PeerInfo,
    hash: Hash,
}

impl Hashed for Seen {
    fn hash(&self) -> Hash {
        self.hash
    }
}

#[derive(Debug)]
pub(crate) enum TouchKind {
    FindPeer {
        peerid: String,
        waiters: Vec<Sender<FindPeerResult>>,
    },
    GetValue {
        table: String,
        keys: Vec<String>,
        fuzzy: bool,
        values: BTreeMap<String, String>,
        waiters: Vec<Sender<GetValueResult>>,
    },
    SaveValue {
        table: String,
        values: BTreeMap<String, String>,
        waiters: Vec<Sender<TouchResult>>,
    },
    Broadcast {
        source: String,
        event_id: u32,
        event: Vec<u8>,
        target_count: usize,
        waiters: Vec<Sender<TouchResult>>,
    },
}

impl TouchKind {
    pub fn find_peer(peerid: String, waiters: Vec<Sender<FindPeerResult>>) -> Self {
        TouchKind::FindPeer { peerid, waiters }
    }

    pub fn get_value(
        table: String,
        keys: Vec<String>,
        fuzzy: bool,
        waiter: Option<Sender<GetValueResult>>,
    ) -> Self {
        TouchKind::GetValue {
            table,
            keys,
            fuzzy,
            values: BTreeMap::new(),
            waiters: waiter.into_iter().collect(),
        }
    }

    pub fn save_value(
        table: String,
        values: BTreeMap<String, String>,
        waiter: Option<Sender<TouchResult>>,
    ) -> Self {
        TouchKind::SaveValue {
            table,
            values,
            waiters: waiter.into_iter().collect(),
        }
    }

    pub fn broadcast(
        source: String,
        event_id: u32,
        event: Vec<u8>,
        target_count: usize,
        waiter: Option<Sender<TouchResult>>,
    ) -> Self {
        TouchKind::Broadcast {
            source,
            event_id,
            event,
            target_count,
            waiters: waiter.into_iter().collect(),
        }
    }

    fn target_hash(&self) -> Hash {
        match self {
            TouchKind::FindPeer { peerid, .. } => Hash::of(peerid),
            TouchKind::GetValue { table, .. } | TouchKind::SaveValue { table, .. } => {
                Hash::of(table)
            }
            TouchKind::Broadcast { source, .. } => Hash::of(source),
        }
    }

    fn is_convergent(&self) -> bool {
        !matches!(self, TouchKind::Broadcast { .. })
    }

    /// Result when there was nobody to ask.
    fn unreachable_code(&self) -> ResultCode {
        match self {
            // Held locally and republished later.
            TouchKind::SaveValue { .. } => ResultCode::Success,
            _ => ResultCode::Failed,
        }
    }
}

#[derive(Debug)]
struct Outstanding {
    target: Target,
    tries: u32,
    /// Seq of the latest request, its resends stop once we retry or give up.
    seq: Option<u32>,
    /// Peer that referred this one, the agency for a handshake.
    referrer: Option<String>,
}

#[derive(Debug)]
pub(crate) struct TouchNodeTask {
    state: TaskState,
    kind: TouchKind,
    service: Option<String>,
    ttl: u8,
    max_try: u32,
    /// Peers known to have processed the request, ourselves included.
    reached: BTreeSet<String>,
    /// Everyone a request was ever sent to.
    requested: HashSet<String>,
    pending: HashMap<String, Outstanding>,
    seen: Closest<Seen>,
}

impl TouchNodeTask {
    pub fn new(
        id: u32,
        kind: TouchKind,
        service: Option<String>,
        config: &Config,
        now: Instant,
    ) -> Self {
        Self {
            state: TaskState::new(id, config, now),
            seen: Closest::new(kind.target_hash(), config.bucket_size),
            kind,
            service,
            ttl: config.default_ttl,
            max_try: config.task_max_try,
            reached: BTreeSet::new(),
            requested: HashSet::new(),
            pending: HashMap::new(),
        }
    }

    pub fn with_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Peers excluded from the start, a relayed broadcast knows who has it already.
    pub fn with_reached(mut self, reached: impl IntoIterator<Item = String>) -> Self {
        self.reached.extend(reached);
        self
    }

    // === Getters ===

    pub fn state(&self) -> &TaskState {
        &self.state
    }

    pub fn key(&self) -> Option<TaskKey> {
        match &self.kind {
            TouchKind::FindPeer { peerid, .. } => Some(TaskKey::FindPeer {
                service: self.service.clone(),
                peerid: peerid.clone(),
            }),
            TouchKind::GetValue {
                table, keys, fuzzy, ..
            } => Some(TaskKey::GetValue {
                table: table.clone(),
                keys: keys.clone(),
                fuzzy: *fuzzy,
            }),
            TouchKind::SaveValue { table, .. } => Some(TaskKey::SaveValue {
                table: table.clone(),
            }),
            TouchKind::Broadcast { .. } => None,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    // === Public Methods ===

    pub fn start(&mut self, net: &mut Network, now: Instant) -> Progress {
        self.reached.insert(net.local.peerid().to_string());

        let exclude: HashSet<String> = self.reached.iter().cloned().collect();
        let target = self.kind.target_hash();
        let service = self.service.clone();

        let initial = if self.kind.is_convergent() {
            net.closest_infos(&target, &exclude, service.as_deref())
        } else {
            net.random_infos(net.config.bucket_size, &exclude, service.as_deref())
        };

        for info in initial {
            self.consider(net, info, None, now);
        }

        if self.pending.is_empty() {
            debug!(
                context = "touch",
                id = self.state.id,
                ?target,
                "No initial peers"
            );
            return Progress::Done(self.kind.unreachable_code());
        }

        Progress::Running
    }

    pub fn on_response(&mut self, net: &mut Network, package: &Package, now: Instant) -> Progress {
        let Some(common) = &package.common else {
            return Progress::Running;
        };
        let from = common.src.peerid.as_str();

        if self.pending.remove(from).is_none() && !self.requested.contains(from) {
            trace!(context = "touch", id = self.state.id, from, "Unsolicited response");
            return Progress::Running;
        }
        self.state.touch(now);
        self.reached.insert(from.to_string());

        let (reached, found) = match (&mut self.kind, &package.body) {
            (TouchKind::FindPeer { peerid, .. }, Body::FindPeer(body)) => {
                (&body.reached, peerid.as_str() == from)
            }
            (TouchKind::GetValue { values, .. }, Body::GetValue(body)) => {
                values.extend(body.values.iter().map(|(k, v)| (k.clone(), v.clone())));
                (&body.reached, !body.values.is_empty())
            }
            (TouchKind::SaveValue { .. }, Body::SaveValue(body)) => (&body.reached, false),
            (TouchKind::Broadcast { .. }, Body::BroadcastEvent(body)) => (&body.reached, false),
            _ => {
                debug!(
                    context = "touch",
                    id = self.state.id,
                    command = ?package.command(),
                    "Response of the wrong kind"
                );
                return Progress::Running;
            }
        };
        self.reached.extend(reached.iter().cloned());

        if self.kind.is_convergent() && !self.seen.items().iter().any(|s| s.info.peerid == from) {
            self.seen.add(Seen {
                hash: Hash::of(from),
                info: common.src.clone(),
            });
        }

        if found {
            return Progress::Done(ResultCode::Success);
        }

        if let TouchKind::Broadcast { target_count, .. } = &self.kind {
            if self.reached.len() >= *target_count {
                return Progress::Done(ResultCode::Success);
            }
            // Someone else delivered it already.
            let reached = &self.reached;
            self.pending.retain(|peerid, _| !reached.contains(peerid));
        }

        for node in &common.nodes {
            self.consider(net, node.clone(), Some(from.to_string()), now);
        }

        self.progress()
    }

    /// Retry outstanding peers, dropping the exhausted ones.
    pub fn on_idle(&mut self, net: &mut Network, now: Instant) -> Progress {
        self.state.touch(now);

        let peerids: Vec<String> = self.pending.keys().cloned().collect();
        for peerid in peerids {
            let Some(mut outstanding) = self.pending.remove(&peerid) else {
                continue;
            };

            if outstanding.tries >= self.max_try {
                trace!(context = "touch", id = self.state.id, %peerid, "Peer exhausted");
                if let Some(seq) = outstanding.seq {
                    net.sender.cancel_resend(&peerid, seq);
                }
                continue;
            }

            if let Some(target) = net.target(&peerid) {
                if !target.candidates.is_empty() {
                    outstanding.target = target;
                }
            }

            // Silent so far, maybe behind a NAT that only the referrer can open.
            if !net.bucket.is_online(&peerid, now) {
                if let Some(agency) = &outstanding.referrer {
                    let id = net.next_task_id();
                    let handshake = HandshakeTask::source(
                        id,
                        outstanding.target.clone(),
                        Some(agency.clone()),
                        &net.config,
                        now,
                    );
                    net.spawn(Task::Handshake(handshake));
                }
            }

            self.send(net, outstanding, now);
        }

        self.progress()
    }

    /// Join another caller's identical request.
    pub fn absorb(&mut self, net: &mut Network, other: TouchNodeTask, now: Instant) {
        let mut resend = false;

        match (&mut self.kind, other.kind) {
            (
                TouchKind::FindPeer { waiters, .. },
                TouchKind::FindPeer {
                    waiters: joining, ..
                },
            ) => waiters.extend(joining),
            (
                TouchKind::GetValue { waiters, .. },
                TouchKind::GetValue {
                    waiters: joining, ..
                },
            ) => waiters.extend(joining),
            (
                TouchKind::SaveValue {
                    values, waiters, ..
                },
                TouchKind::SaveValue {
                    values: merged,
                    waiters: joining,
                    ..
                },
            ) => {
                values.extend(merged);
                waiters.extend(joining);
                resend = true;
            }
            _ => {}
        }

        if !resend {
            return;
        }

        // Peers that stored the old values need the merged ones too, pending
        // peers get them with their next retry.
        let local = net.local.peerid().to_string();
        let reached: Vec<String> = self
            .reached
            .iter()
            .filter(|peerid| **peerid != local && !self.pending.contains_key(*peerid))
            .cloned()
            .collect();

        for peerid in reached {
            if let Some(target) = net.target(&peerid) {
                self.send(
                    net,
                    Outstanding {
                        target,
                        tries: 0,
                        seq: None,
                        referrer: None,
                    },
                    now,
                );
            }
        }
    }

    /// Deliver the result to every waiter.
    pub fn finish(self, code: ResultCode) {
        let reached: Vec<String> = self.reached.into_iter().collect();

        match self.kind {
            TouchKind::FindPeer { waiters, .. } => {
                let peers: Vec<PeerInfo> = self.seen.into_iter().map(|s| s.info).collect();
                for waiter in waiters {
                    let _ = waiter.send(FindPeerResult {
                        result: code,
                        peers: peers.clone(),
                    });
                }
            }
            TouchKind::GetValue {
                values, waiters, ..
            } => {
                for waiter in waiters {
                    let _ = waiter.send(GetValueResult {
                        result: code,
                        values: values.clone(),
                        reached: reached.clone(),
                    });
                }
            }
            TouchKind::SaveValue { waiters, .. } | TouchKind::Broadcast { waiters, .. } => {
                for waiter in waiters {
                    let _ = waiter.send(TouchResult {
                        result: code,
                        reached: reached.clone(),
                    });
                }
            }
        }
    }

    // === Private Methods ===

    /// Request `info` if it is new and, for convergent lookups, among the closest.
    fn consider(&mut self, net: &mut Network, info: PeerInfo, referrer: Option<String>, now: Instant) {
        if info.peerid == net.local.peerid()
            || self.requested.contains(&info.peerid)
            || self.reached.contains(&info.peerid)
        {
            return;
        }

        match &self.kind {
            TouchKind::Broadcast { target_count, .. } => {
                if self.reached.len() + self.pending.len() >= *target_count {
                    return;
                }
            }
            _ => {
                let made_the_cut = self.seen.add(Seen {
                    hash: Hash::of(&info.peerid),
                    info: info.clone(),
                });
                if !made_the_cut {
                    return;
                }
            }
        }

        self.requested.insert(info.peerid.clone());

        let target = match net.target(&info.peerid) {
            Some(target) if !target.candidates.is_empty() => target,
            _ => Target::from_info(&info, None),
        };

        self.send(
            net,
            Outstanding {
                target,
                tries: 0,
                seq: None,
                referrer,
            },
            now,
        );
    }

    fn send(&mut self, net: &mut Network, mut outstanding: Outstanding, now: Instant) {
        outstanding.tries += 1;

        if let Some(seq) = outstanding.seq.take() {
            net.sender.cancel_resend(&outstanding.target.peerid, seq);
        }

        match net.request(&outstanding.target, self.body(), self.ttl, now) {
            Ok(seq) => outstanding.seq = Some(seq),
            Err(SendError::NoRoute(peerid)) => {
                if outstanding.referrer.is_none() {
                    trace!(context = "touch", id = self.state.id, %peerid, "No route");
                    return;
                }
                // Kept pending, retried once the handshake opened a path.
            }
            Err(error) => {
                debug!(context = "touch", id = self.state.id, ?error, "Failed to send request");
                return;
            }
        }

        self.pending
            .insert(outstanding.target.peerid.clone(), outstanding);
    }

    fn body(&self) -> Body {
        let taskid = self.state.id;
        let service = self.service.clone();
        let reached: Vec<String> = self.reached.iter().cloned().collect();

        match &self.kind {
            TouchKind::FindPeer { peerid, .. } => Body::FindPeer(FindPeerBody {
                taskid,
                target: peerid.clone(),
                service,
                reached,
            }),
            TouchKind::GetValue {
                table, keys, fuzzy, ..
            } => Body::GetValue(GetValueBody {
                taskid,
                table: table.clone(),
                keys: keys.clone(),
                fuzzy: u8::from(*fuzzy),
                service,
                reached,
                values: BTreeMap::new(),
            }),
            TouchKind::SaveValue { table, values, .. } => Body::SaveValue(SaveValueBody {
                taskid,
                table: table.clone(),
                values: values.clone(),
                service,
                reached,
            }),
            TouchKind::Broadcast {
                source,
                event_id,
                event,
                ..
            } => Body::BroadcastEvent(BroadcastEventBody {
                taskid,
                source: source.clone(),
                event_id: *event_id,
                event: ByteBuf::from(event.clone()),
                service,
                reached,
            }),
        }
    }

    fn progress(&self) -> Progress {
        if !self.pending.is_empty() {
            return Progress::Running;
        }

        // Ourselves plus at least one responder.
        let anyone_reached = self.reached.len() > 1;
        let code = match &self.kind {
            TouchKind::FindPeer { .. } | TouchKind::GetValue { .. } => ResultCode::Failed,
            TouchKind::SaveValue { .. } | TouchKind::Broadcast { .. } if anyone_reached => {
                ResultCode::Success
            }
            _ => ResultCode::Failed,
        };

        Progress::Done(code)
    }
}
