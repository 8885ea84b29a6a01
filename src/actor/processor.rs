//! Inbound package processing: learn about the sender, then answer requests
//! or hand responses to the task waiting for them.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::common::{ActiveFlags, Endpoint, Hash, PeerInfo};
use crate::protocol::piece::PieceOutcome;
use crate::protocol::{
    parse_eplist, Body, BroadcastEventBody, FindPeerBody, GetValueBody, HandshakeBody,
    HoleCallBody, HoleCalledBody, Package, PieceBody, PingBody, SaveValueBody,
};
use crate::ResultCode;

use super::sender::Target;
use super::tasks::handshake::{AgencyTask, HandshakeTask};
use super::tasks::touch::{TouchKind, TouchNodeTask};
use super::tasks::{Task, TaskKey};
use super::{Actor, BroadcastEvent};

/// Context of the request being answered.
struct Request {
    reply: Target,
    src: PeerInfo,
    seq: u32,
    ttl: u8,
}

impl Actor {
    /// Handle one inbound package, `from` is None for loopback.
    pub(super) fn process(&mut self, bytes: &[u8], from: Option<Endpoint>, now: Instant) {
        let package = match Package::from_bytes(bytes, self.net.config.max_ttl) {
            Ok(package) => package,
            Err(error) => {
                debug!(context = "processor", ?error, ?from, "Dropping undecodable package");
                return;
            }
        };

        if package.header.appid != self.net.sender.appid() {
            trace!(
                context = "processor",
                appid = package.header.appid,
                "Dropping package of another application"
            );
            return;
        }

        if let Body::Piece(piece) = &package.body {
            self.process_piece(&package, piece, from, now);
            self.tasks.adopt_spawned(&mut self.net, now);
            return;
        }

        let Some(common) = &package.common else {
            return;
        };
        if !common.dest_peerid.is_empty() && common.dest_peerid != self.net.local.peerid() {
            debug!(
                context = "processor",
                dest = %common.dest_peerid,
                src = %common.src.peerid,
                "Dropping package addressed to another peer"
            );
            return;
        }

        if from.is_some() {
            self.learn(&package, from, now);
        }

        if package.is_response() {
            self.process_response(&package, now);
        } else {
            let request = Request {
                reply: Target::from_info(&common.src, from),
                src: common.src.clone(),
                seq: package.header.seq,
                ttl: package.header.ttl,
            };
            self.process_request(request, package.body, now);
        }

        self.tasks.adopt_spawned(&mut self.net, now);
    }

    // === Private Methods ===

    fn process_piece(
        &mut self,
        package: &Package,
        piece: &PieceBody,
        from: Option<Endpoint>,
        now: Instant,
    ) {
        if package.is_response() {
            self.tasks
                .on_response(piece.taskid, &mut self.net, package, now);
            return;
        }

        let Some(from) = from else {
            return;
        };

        if let Err(error) =
            self.net
                .sender
                .ack_piece(&self.net.local, from, &package.header, piece, now)
        {
            debug!(context = "processor", ?error, %from, "Failed to acknowledge piece");
        }

        match self.rebuilder.push(piece, now) {
            PieceOutcome::Complete(bytes) => {
                trace!(
                    context = "processor",
                    taskid = piece.taskid,
                    sender = %piece.sender,
                    size = bytes.len(),
                    "Rebuilt fragmented package"
                );
                self.process(&bytes, Some(from), now);
            }
            PieceOutcome::Rejected => {
                debug!(context = "processor", taskid = piece.taskid, "Rejected piece");
            }
            PieceOutcome::Pending | PieceOutcome::Duplicate => {}
        }
    }

    /// Update our own endpoints and the routing table from a package.
    fn learn(&mut self, package: &Package, from: Option<Endpoint>, now: Instant) {
        let Some(common) = &package.common else {
            return;
        };

        if let (Some(observed), Some(from)) = (common.dest_ep, from) {
            let via = self
                .net
                .sender
                .listen_endpoints()
                .into_iter()
                .find(|ep| ep.protocol == from.protocol);
            self.net.local.union_eplist(observed, via, now);
        }
        self.net
            .local
            .on_received_from(package.header.src_nat_type, now);

        let src = &common.src;
        if src.peerid.is_empty() || src.peerid == self.net.local.peerid() {
            return;
        }

        let result = self
            .net
            .bucket
            .active_peer(src, from, ActiveFlags::received(), now);
        self.on_evicted(&result);

        if let Some(peer) = self.net.bucket.get_peer_mut(&src.peerid) {
            peer.set_reported_state(
                package.header.src_nat_type,
                Duration::from_secs(u64::from(package.header.src_online_duration)),
                now,
            );
        }

        for node in &common.nodes {
            if node.peerid == self.net.local.peerid() {
                continue;
            }
            let result = self
                .net
                .bucket
                .active_peer(node, None, ActiveFlags::referral(), now);
            self.on_evicted(&result);
        }
    }

    fn process_response(&mut self, package: &Package, now: Instant) {
        let Some(src) = package.src_peerid() else {
            return;
        };
        let src = src.to_string();

        self.net.sender.ack(&src, package.header.ack_seq);

        match &package.body {
            Body::Ping(_) => self.tasks.on_ping_response(&mut self.net, package, now),
            body => {
                if let Some(taskid) = body.taskid() {
                    self.tasks.on_response(taskid, &mut self.net, package, now);
                }
            }
        }
    }

    fn process_request(&mut self, request: Request, body: Body, now: Instant) {
        trace!(
            context = "processor",
            command = ?body.command(),
            from = %request.src.peerid,
            "Request"
        );

        match body {
            Body::Ping(_) => self.respond(&request, Body::Ping(PingBody {}), None, now),
            Body::FindPeer(body) => self.on_find_peer(request, body, now),
            Body::GetValue(body) => self.on_get_value(request, body, now),
            Body::SaveValue(body) => self.on_save_value(request, body, now),
            Body::BroadcastEvent(body) => self.on_broadcast_event(request, body, now),
            Body::HoleCall(body) => self.on_hole_call(request, body, now),
            Body::HoleCalled(body) => self.on_hole_called(request, body, now),
            Body::Handshake(body) => {
                self.net.local.on_handshake_request(&request.src.peerid);
                self.respond(
                    &request,
                    Body::Handshake(HandshakeBody {
                        taskid: body.taskid,
                    }),
                    None,
                    now,
                );
                // The other side got through first.
                self.tasks.complete_key(
                    &TaskKey::Handshake(request.src.peerid.clone()),
                    ResultCode::Success,
                );
            }
            Body::Piece(_) => {}
        }
    }

    fn on_find_peer(&mut self, request: Request, body: FindPeerBody, now: Instant) {
        let exclude = self.exclude(&request, &body.reached);
        let referrals = self.net.closest_infos(
            &Hash::of(&body.target),
            &exclude,
            body.service.as_deref(),
        );

        let response = FindPeerBody {
            reached: self.reached(body.reached),
            ..body
        };
        self.respond(&request, Body::FindPeer(response), Some(referrals), now);
    }

    fn on_get_value(&mut self, request: Request, body: GetValueBody, now: Instant) {
        let values = self.find_values(&body.table, &body.keys, body.fuzzy != 0);

        let exclude = self.exclude(&request, &body.reached);
        let referrals = self.net.closest_infos(
            &Hash::of(&body.table),
            &exclude,
            body.service.as_deref(),
        );

        let response = GetValueBody {
            reached: self.reached(body.reached),
            values,
            ..body
        };
        self.respond(&request, Body::GetValue(response), Some(referrals), now);
    }

    fn on_save_value(&mut self, request: Request, body: SaveValueBody, now: Instant) {
        let stored = self.values.update_values(&body.table, &body.values, now);
        trace!(
            context = "processor",
            table = %body.table,
            stored,
            from = %request.src.peerid,
            "Stored values"
        );

        let exclude = self.exclude(&request, &body.reached);
        let referrals = self.net.closest_infos(
            &Hash::of(&body.table),
            &exclude,
            body.service.as_deref(),
        );

        let response = SaveValueBody {
            reached: self.reached(body.reached),
            values: Default::default(),
            ..body
        };
        self.respond(&request, Body::SaveValue(response), Some(referrals), now);
    }

    fn on_broadcast_event(&mut self, request: Request, body: BroadcastEventBody, now: Instant) {
        let first = self
            .delivered
            .put((body.source.clone(), body.event_id), ())
            .is_none();

        if first {
            let event = BroadcastEvent {
                source: body.source.clone(),
                event_id: body.event_id,
                service: body.service.clone(),
                data: body.event.to_vec(),
            };
            self.listeners
                .retain(|listener| listener.send(event.clone()).is_ok());
        }

        let exclude = self.exclude(&request, &body.reached);
        let referrals = self.net.random_infos(
            self.net.config.bucket_size,
            &exclude,
            body.service.as_deref(),
        );

        let reached = self.reached(body.reached.clone());
        self.respond(
            &request,
            Body::BroadcastEvent(BroadcastEventBody {
                taskid: body.taskid,
                source: body.source.clone(),
                event_id: body.event_id,
                event: ByteBuf::new(),
                service: body.service.clone(),
                reached: reached.clone(),
            }),
            Some(referrals),
            now,
        );

        if !first || request.ttl == 0 {
            return;
        }

        let id = self.net.next_task_id();
        let relay = TouchNodeTask::new(
            id,
            TouchKind::broadcast(
                body.source,
                body.event_id,
                body.event.into_vec(),
                self.net.config.broadcast_target,
                None,
            ),
            body.service,
            &self.net.config,
            now,
        )
        .with_ttl(request.ttl - 1)
        .with_reached(reached.into_iter().chain([request.src.peerid]));

        self.net.spawn(Task::Touch(relay));
    }

    /// We are the agency: hand out what we know of the target and tell it to
    /// expect the caller.
    fn on_hole_call(&mut self, request: Request, body: HoleCallBody, now: Instant) {
        let target = self
            .net
            .bucket
            .get_peer(&body.target)
            .map(Target::from_peer);
        let eplist = target
            .as_ref()
            .map(|target| target.candidates.clone())
            .unwrap_or_default();

        let mut source_eplist = parse_eplist(&body.eplist);
        for endpoint in request.reply.candidates.iter() {
            if !source_eplist.contains(endpoint) {
                source_eplist.push(*endpoint);
            }
        }

        self.respond(
            &request,
            Body::HoleCall(HoleCallBody {
                taskid: body.taskid,
                target: body.target.clone(),
                eplist: eplist.iter().map(|ep| ep.to_string()).collect(),
            }),
            None,
            now,
        );

        match target {
            Some(target) if !target.candidates.is_empty() && !source_eplist.is_empty() => {
                let id = self.net.next_task_id();
                self.net.spawn(Task::Agency(AgencyTask::new(
                    id,
                    request.src.peerid,
                    body.taskid,
                    source_eplist,
                    target,
                    &self.net.config,
                    now,
                )));
            }
            _ => {
                debug!(
                    context = "processor",
                    target = %body.target,
                    "Hole call for an unknown or unreachable peer"
                );
            }
        }
    }

    /// We are the target: the agency says `source` is coming, punch toward it.
    fn on_hole_called(&mut self, request: Request, body: HoleCalledBody, now: Instant) {
        self.net.local.on_hole_called(&body.source);

        self.respond(
            &request,
            Body::HoleCalled(HoleCalledBody {
                taskid: body.taskid,
                source: body.source.clone(),
                eplist: Vec::new(),
            }),
            None,
            now,
        );

        let eplist = parse_eplist(&body.eplist);
        if body.source.is_empty() || eplist.is_empty() || body.source == self.net.local.peerid() {
            return;
        }

        let info = PeerInfo {
            peerid: body.source,
            eplist,
            ..Default::default()
        };
        let id = self.net.next_task_id();
        self.net.spawn(Task::Handshake(HandshakeTask::target(
            id,
            Target::from_info(&info, None),
            &self.net.config,
            now,
        )));
    }

    fn respond(&mut self, request: &Request, body: Body, referrals: Option<Vec<PeerInfo>>, now: Instant) {
        self.net
            .respond(&request.reply, body, request.seq, referrals, now);
    }

    /// Peers a referral list should skip: already reached, and the asker.
    fn exclude(&self, request: &Request, reached: &[String]) -> HashSet<String> {
        reached
            .iter()
            .cloned()
            .chain([request.src.peerid.clone()])
            .collect()
    }

    /// The reached list with ourselves appended.
    fn reached(&self, mut reached: Vec<String>) -> Vec<String> {
        let local = self.net.local.peerid();
        if !reached.iter().any(|peerid| peerid == local) {
            reached.push(local.to_string());
        }
        reached
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::actor::{Config, MemoryNetwork, Transport};
    use crate::common::Protocol;
    use crate::protocol::{Command, Common, Header};
    use crate::common::NatType;

    fn actor(network: &MemoryNetwork, peerid: &str) -> Actor {
        Actor::new(
            peerid,
            Box::new(network.transport(Protocol::Udp)),
            Config::default(),
        )
        .unwrap()
    }

    fn request(actor: &Actor, src: &PeerInfo, body: Body, seq: u32) -> Vec<u8> {
        Package {
            header: Header {
                command: body.command(),
                is_response: false,
                appid: actor.config().appid,
                src_hash: Hash::of(&src.peerid).as_u32(),
                src_online_duration: 30,
                src_nat_type: NatType::Internet,
                dest_hash: actor.local_peer().hash().as_u32(),
                seq,
                ack_seq: 0,
                ttl: 2,
            },
            body,
            common: Some(Common {
                src: src.clone(),
                dest_peerid: actor.peerid().to_string(),
                dest_ep: None,
                nodes: Vec::new(),
            }),
        }
        .to_bytes()
        .unwrap()
    }

    fn udp(port: u16) -> Endpoint {
        Endpoint::udp(SocketAddr::from(([10, 0, 0, 9], port)))
    }

    #[test]
    fn request_adds_sender_to_bucket() {
        let network = MemoryNetwork::new();
        let mut node = actor(&network, "node");
        let src = PeerInfo::new("alice").with_endpoint(udp(1000));

        let bytes = request(&node, &src, Body::Ping(PingBody {}), 7);
        node.process(&bytes, Some(udp(1000)), Instant::now());

        let peer = node.bucket().get_peer("alice").unwrap();
        assert_eq!(peer.address(), Some(udp(1000)));
        assert_eq!(peer.nat_type(), NatType::Internet);
    }

    #[test]
    fn foreign_appid_is_dropped() {
        let network = MemoryNetwork::new();
        let mut node = actor(&network, "node");
        let src = PeerInfo::new("alice").with_endpoint(udp(1000));

        let mut package = Package::from_bytes(
            &request(&node, &src, Body::Ping(PingBody {}), 7),
            Config::default().max_ttl,
        )
        .unwrap();
        package.header.appid += 1;

        node.process(&package.to_bytes().unwrap(), Some(udp(1000)), Instant::now());

        assert!(!node.bucket().contains("alice"));
    }

    #[test]
    fn package_for_another_peer_is_dropped() {
        let network = MemoryNetwork::new();
        let mut node = actor(&network, "node");
        let src = PeerInfo::new("alice").with_endpoint(udp(1000));

        let mut package = Package::from_bytes(
            &request(&node, &src, Body::Ping(PingBody {}), 7),
            Config::default().max_ttl,
        )
        .unwrap();
        if let Some(common) = package.common.as_mut() {
            common.dest_peerid = "somebody-else".to_string();
        }

        node.process(&package.to_bytes().unwrap(), Some(udp(1000)), Instant::now());

        assert!(!node.bucket().contains("alice"));
    }

    #[test]
    fn saved_values_are_served() {
        let network = MemoryNetwork::new();
        let mut node = actor(&network, "node");
        let mut alice = network.transport(Protocol::Udp);
        let src = PeerInfo::new("alice").with_endpoint(alice.endpoint());
        let now = Instant::now();

        let save = SaveValueBody {
            taskid: 3,
            table: "colors".to_string(),
            values: [("sky".to_string(), "blue".to_string())].into(),
            service: None,
            reached: Vec::new(),
        };
        let bytes = request(&node, &src, Body::SaveValue(save), 1);
        node.process(&bytes, Some(alice.endpoint()), now);

        assert_eq!(node.info().value_count(), 1);

        let (bytes, _) = alice.recv_from().unwrap();
        let response = Package::from_bytes(&bytes, 5).unwrap();
        assert!(response.is_response());
        assert_eq!(response.command(), Command::SaveValue);
        assert_eq!(response.header.ack_seq, 1);
        match response.body {
            Body::SaveValue(body) => assert_eq!(body.reached, vec!["node".to_string()]),
            body => panic!("unexpected body {body:?}"),
        }

        let get = GetValueBody {
            taskid: 4,
            table: "colors".to_string(),
            keys: vec!["sky".to_string()],
            ..Default::default()
        };
        let bytes = request(&node, &src, Body::GetValue(get), 2);
        node.process(&bytes, Some(alice.endpoint()), now);

        let (bytes, _) = alice.recv_from().unwrap();
        match Package::from_bytes(&bytes, 5).unwrap().body {
            Body::GetValue(body) => {
                assert_eq!(body.taskid, 4);
                assert_eq!(body.values.get("sky"), Some(&"blue".to_string()));
            }
            body => panic!("unexpected body {body:?}"),
        }
    }

    #[test]
    fn broadcast_is_delivered_once() {
        let network = MemoryNetwork::new();
        let mut node = actor(&network, "node");
        let alice = network.transport(Protocol::Udp);
        let src = PeerInfo::new("alice").with_endpoint(alice.endpoint());
        let now = Instant::now();

        let (tx, rx) = flume::unbounded();
        node.attach_broadcast_listener(tx);

        let event = BroadcastEventBody {
            taskid: 9,
            source: "alice".to_string(),
            event_id: 42,
            event: ByteBuf::from(b"hello".to_vec()),
            service: None,
            reached: vec!["alice".to_string()],
        };

        for seq in 1..=2 {
            let bytes = request(&node, &src, Body::BroadcastEvent(event.clone()), seq);
            node.process(&bytes, Some(alice.endpoint()), now);
        }

        let delivered = rx.drain().collect::<Vec<_>>();
        assert_eq!(
            delivered,
            vec![BroadcastEvent {
                source: "alice".to_string(),
                event_id: 42,
                service: None,
                data: b"hello".to_vec(),
            }]
        );
    }
}
