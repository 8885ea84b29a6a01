//! Dht node.

use std::net::SocketAddr;
use std::thread;
use std::time::Duration;

use flume::{Receiver, RecvTimeoutError, Sender};
use tracing::{debug, error};

use crate::actor::{
    Actor, BroadcastEvent, Config, FindPeerResult, GetValueResult, Info, MemoryNetwork,
    TouchResult, Transport, UdpTransport,
};
use crate::common::{ActiveResult, PeerInfo, Protocol, ServiceRole};
use crate::{Error, Result, ResultCode};

/// How long the actor thread waits for an API message before ticking anyway.
const TICK_INTERVAL: Duration = Duration::from_millis(1);

#[derive(Debug)]
/// Build and start a [Dht] node.
pub struct DhtBuilder {
    peerid: String,
    config: Config,
    transport: Option<Box<dyn Transport>>,
}

impl DhtBuilder {
    pub fn new(peerid: impl Into<String>) -> Self {
        Self {
            peerid: peerid.into(),
            config: Config::default(),
            transport: None,
        }
    }

    /// Replace the whole configuration, settings applied before are lost.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Application id, packages of other applications are dropped.
    pub fn appid(mut self, appid: u32) -> Self {
        self.config.appid = appid;
        self
    }

    /// UDP port to bind, ignored when a [DhtBuilder::transport] is set.
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = Some(port);
        self
    }

    /// Peers to join the network through.
    pub fn bootstrap(mut self, bootstrap: &[PeerInfo]) -> Self {
        self.config.bootstrap = bootstrap.to_vec();
        self
    }

    /// Free form information announced along with our peerid.
    pub fn additional_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config
            .additional_info
            .insert(key.into(), value.into());
        self
    }

    pub fn transport(mut self, transport: Box<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Create the node and spawn its actor thread.
    pub fn build(self) -> Result<Dht> {
        Dht::spawn(self.peerid, self.transport, self.config)
    }
}

#[derive(thiserror::Error, Debug)]
#[error("The Dht was shutdown")]
/// The actor thread is gone, either after [Dht::stop] or a panic.
pub struct DhtWasShutdown;

impl From<DhtWasShutdown> for Error {
    fn from(_: DhtWasShutdown) -> Self {
        Error::DhtWasShutdown
    }
}

#[derive(Debug, Clone)]
/// Meshdht node, a cheap handle to the actor thread.
pub struct Dht(pub(crate) Sender<ActorMessage>);

impl Dht {
    /// Returns a builder to configure a node.
    pub fn builder(peerid: impl Into<String>) -> DhtBuilder {
        DhtBuilder::new(peerid)
    }

    fn spawn(peerid: String, transport: Option<Box<dyn Transport>>, config: Config) -> Result<Self> {
        let transport = match transport {
            Some(transport) => transport,
            None => Box::new(UdpTransport::new(config.port)?),
        };

        let actor = Actor::new(peerid, transport, config)?;

        let (sender, receiver) = flume::unbounded();

        thread::Builder::new()
            .name("meshdht".to_string())
            .spawn(move || run(actor, receiver))?;

        Ok(Dht(sender))
    }

    // === Getters ===

    /// Information and statistics about this node.
    pub fn info(&self) -> Result<Info, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Info>(1);

        self.0
            .send(ActorMessage::Info(sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Peers heard from recently.
    pub fn online_peers(&self) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.0
            .send(ActorMessage::OnlinePeers(None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Up to `count` peers from the routing table, spread over its buckets.
    pub fn random_peers(&self, count: usize) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.0
            .send(ActorMessage::RandomPeers(count, None, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    /// Stop every running task with [ResultCode::Stopped] and end the actor thread.
    pub fn stop(&self) {
        let (sender, receiver) = flume::bounded::<()>(1);

        let _ = self.0.send(ActorMessage::Stop(sender));
        let _ = receiver.recv();
    }

    /// Find a peer by its peerid.
    ///
    /// Concurrent lookups of the same peerid share one task and one result.
    pub fn find_peer(&self, peerid: &str) -> Result<FindPeerResult, DhtWasShutdown> {
        self.find_peer_in(peerid, None)
    }

    /// Publish a value, republished periodically until [Dht::delete_value].
    pub fn save_value(&self, table: &str, key: &str, value: &str) -> Result<TouchResult, DhtWasShutdown> {
        self.save_value_in(table, key, value, None)
    }

    /// Read a value, `*` reads the whole table.
    pub fn get_value(&self, table: &str, key: &str) -> Result<GetValueResult, DhtWasShutdown> {
        self.get_value_in(table, key, false, None)
    }

    /// Read the values whose keys hash closest to `key`.
    pub fn get_closest_values(&self, table: &str, key: &str) -> Result<GetValueResult, DhtWasShutdown> {
        self.get_value_in(table, key, true, None)
    }

    /// Stop publishing a value, `*` stops the whole table.
    pub fn delete_value(&self, table: &str, key: &str) -> Result<ResultCode, DhtWasShutdown> {
        self.delete_value_in(table, key, None)
    }

    /// Spread `data` to the network, returns once enough peers got it.
    pub fn emit_broadcast_event(&self, data: &[u8]) -> Result<TouchResult, DhtWasShutdown> {
        self.emit_broadcast_event_in(data, None)
    }

    /// Every broadcast event delivered to this node from now on.
    pub fn broadcast_events(&self) -> Result<Receiver<BroadcastEvent>, DhtWasShutdown> {
        let (sender, receiver) = flume::unbounded::<BroadcastEvent>();

        self.0
            .send(ActorMessage::AttachBroadcastListener(sender))
            .map_err(|_| DhtWasShutdown)?;

        Ok(receiver)
    }

    /// Tell the routing table about a peer.
    ///
    /// `is_received` means the information comes from the peer itself.
    pub fn active_peer(
        &self,
        info: PeerInfo,
        address: Option<SocketAddr>,
        is_sent: bool,
        is_received: bool,
    ) -> Result<ActiveResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ActiveResult>(1);

        self.0
            .send(ActorMessage::ActivePeer(
                info,
                address,
                is_sent,
                is_received,
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Ping a peer, [ResultCode::Success] once it answers.
    pub fn ping(&self, info: PeerInfo) -> Result<ResultCode, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ResultCode>(1);

        self.0
            .send(ActorMessage::Ping(info, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    /// Scope operations to the service sub-network at `path`.
    pub fn service(&self, path: &str) -> ServiceDht {
        ServiceDht {
            dht: self.clone(),
            path: path.to_string(),
        }
    }

    // === Private Methods ===

    fn find_peer_in(&self, peerid: &str, service: Option<&str>) -> Result<FindPeerResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<FindPeerResult>(1);

        self.0
            .send(ActorMessage::FindPeer(
                peerid.to_string(),
                service.map(String::from),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn save_value_in(
        &self,
        table: &str,
        key: &str,
        value: &str,
        service: Option<&str>,
    ) -> Result<TouchResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<TouchResult>(1);

        self.0
            .send(ActorMessage::SaveValue(
                ValueRequest::new(table, key, service),
                value.to_string(),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn get_value_in(
        &self,
        table: &str,
        key: &str,
        fuzzy: bool,
        service: Option<&str>,
    ) -> Result<GetValueResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<GetValueResult>(1);

        self.0
            .send(ActorMessage::GetValue(
                ValueRequest::new(table, key, service),
                fuzzy,
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn delete_value_in(&self, table: &str, key: &str, service: Option<&str>) -> Result<ResultCode, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<ResultCode>(1);

        self.0
            .send(ActorMessage::DeleteValue(
                ValueRequest::new(table, key, service),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn emit_broadcast_event_in(&self, data: &[u8], service: Option<&str>) -> Result<TouchResult, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<TouchResult>(1);

        self.0
            .send(ActorMessage::EmitBroadcastEvent(
                data.to_vec(),
                service.map(String::from),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    fn sign(&self, path: &str, change: SignChange) -> Result<bool, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<bool>(1);

        self.0
            .send(ActorMessage::Sign(path.to_string(), change, sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }
}

#[derive(Debug, Clone)]
/// A [Dht] scoped to one service sub-network.
///
/// Lookups only consider peers signed in as servers of the service, and values
/// live in tables separate from the main network's.
pub struct ServiceDht {
    dht: Dht,
    path: String,
}

impl ServiceDht {
    // === Getters ===

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dht(&self) -> &Dht {
        &self.dht
    }

    /// Known peers serving this service, heard from recently.
    pub fn online_peers(&self) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.dht
            .0
            .send(ActorMessage::OnlinePeers(Some(self.path.clone()), sender))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    pub fn random_peers(&self, count: usize) -> Result<Vec<PeerInfo>, DhtWasShutdown> {
        let (sender, receiver) = flume::bounded::<Vec<PeerInfo>>(1);

        self.dht
            .0
            .send(ActorMessage::RandomPeers(
                count,
                Some(self.path.clone()),
                sender,
            ))
            .map_err(|_| DhtWasShutdown)?;

        receiver.recv().map_err(|_| DhtWasShutdown)
    }

    // === Public Methods ===

    pub fn find_peer(&self, peerid: &str) -> Result<FindPeerResult, DhtWasShutdown> {
        self.dht.find_peer_in(peerid, Some(&self.path))
    }

    pub fn save_value(&self, table: &str, key: &str, value: &str) -> Result<TouchResult, DhtWasShutdown> {
        self.dht.save_value_in(table, key, value, Some(&self.path))
    }

    pub fn get_value(&self, table: &str, key: &str) -> Result<GetValueResult, DhtWasShutdown> {
        self.dht.get_value_in(table, key, false, Some(&self.path))
    }

    pub fn get_closest_values(&self, table: &str, key: &str) -> Result<GetValueResult, DhtWasShutdown> {
        self.dht.get_value_in(table, key, true, Some(&self.path))
    }

    pub fn delete_value(&self, table: &str, key: &str) -> Result<ResultCode, DhtWasShutdown> {
        self.dht.delete_value_in(table, key, Some(&self.path))
    }

    pub fn emit_broadcast_event(&self, data: &[u8]) -> Result<TouchResult, DhtWasShutdown> {
        self.dht.emit_broadcast_event_in(data, Some(&self.path))
    }

    /// Serve this service, other peers find us through it.
    pub fn signin_server(&self) -> Result<bool, DhtWasShutdown> {
        self.dht
            .sign(&self.path, SignChange::Signin(ServiceRole::Server))
    }

    /// Use this service without serving it.
    pub fn signin_visitor(&self) -> Result<bool, DhtWasShutdown> {
        self.dht
            .sign(&self.path, SignChange::Signin(ServiceRole::Visitor))
    }

    pub fn signout_server(&self) -> Result<bool, DhtWasShutdown> {
        self.dht
            .sign(&self.path, SignChange::Signout(Some(ServiceRole::Server)))
    }

    pub fn signout_visitor(&self) -> Result<bool, DhtWasShutdown> {
        self.dht
            .sign(&self.path, SignChange::Signout(Some(ServiceRole::Visitor)))
    }

    /// Sign out of every role.
    pub fn signout(&self) -> Result<bool, DhtWasShutdown> {
        self.dht.sign(&self.path, SignChange::Signout(None))
    }
}

#[derive(Debug)]
/// A local network of nodes over a [MemoryNetwork], every node bootstrapped
/// from the first one.
pub struct Testnet {
    pub network: MemoryNetwork,
    pub bootstrap: Vec<PeerInfo>,
    pub nodes: Vec<Dht>,
    config: Config,
}

impl Testnet {
    pub fn new(count: usize) -> Result<Testnet> {
        Testnet::with_config(count, Config::default())
    }

    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let network = MemoryNetwork::new();
        let mut bootstrap = Vec::new();
        let mut nodes = Vec::with_capacity(count);

        for i in 0..count {
            let peerid = format!("testnet-{i}");
            let transport = network.transport(Protocol::Udp);
            let info = PeerInfo::new(peerid.clone()).with_endpoint(transport.endpoint());

            let node = Dht::builder(peerid)
                .config(config.clone())
                .bootstrap(&bootstrap)
                .transport(Box::new(transport))
                .build()?;

            if i == 0 {
                bootstrap.push(info);
            }
            nodes.push(node);
        }

        Ok(Testnet {
            network,
            bootstrap,
            nodes,
            config,
        })
    }

    /// A node outside the testnet, bootstrapped from it.
    pub fn join(&self, peerid: &str) -> Result<Dht> {
        Dht::builder(peerid)
            .config(self.config.clone())
            .bootstrap(&self.bootstrap)
            .transport(Box::new(self.network.transport(Protocol::Udp)))
            .build()
    }
}

#[derive(Debug)]
pub(crate) struct ValueRequest {
    pub table: String,
    pub key: String,
    pub service: Option<String>,
}

impl ValueRequest {
    pub(crate) fn new(table: &str, key: &str, service: Option<&str>) -> Self {
        Self {
            table: table.to_string(),
            key: key.to_string(),
            service: service.map(String::from),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum SignChange {
    Signin(ServiceRole),
    Signout(Option<ServiceRole>),
}

#[derive(Debug)]
pub(crate) enum ActorMessage {
    Info(Sender<Info>),
    Stop(Sender<()>),
    FindPeer(String, Option<String>, Sender<FindPeerResult>),
    SaveValue(ValueRequest, String, Sender<TouchResult>),
    GetValue(ValueRequest, bool, Sender<GetValueResult>),
    DeleteValue(ValueRequest, Sender<ResultCode>),
    EmitBroadcastEvent(Vec<u8>, Option<String>, Sender<TouchResult>),
    AttachBroadcastListener(Sender<BroadcastEvent>),
    ActivePeer(
        PeerInfo,
        Option<SocketAddr>,
        bool,
        bool,
        Sender<ActiveResult>,
    ),
    Ping(PeerInfo, Sender<ResultCode>),
    OnlinePeers(Option<String>, Sender<Vec<PeerInfo>>),
    RandomPeers(usize, Option<String>, Sender<Vec<PeerInfo>>),
    Sign(String, SignChange, Sender<bool>),
}

fn run(mut actor: Actor, receiver: Receiver<ActorMessage>) {
    loop {
        match receiver.recv_timeout(TICK_INTERVAL) {
            Ok(ActorMessage::Stop(sender)) => {
                actor.stop();
                debug!(peerid = %actor.peerid(), "Meshdht actor thread stopped");

                let _ = sender.send(());
                break;
            }
            Ok(message) => handle(&mut actor, message),
            Err(RecvTimeoutError::Disconnected) => {
                // Every Dht handle was dropped, kill this thread.
                actor.stop();
                debug!("Meshdht actor thread was shutdown after Drop.");
                break;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        actor.tick();
    }
}

fn handle(actor: &mut Actor, message: ActorMessage) {
    match message {
        ActorMessage::Info(sender) => {
            let _ = sender.send(actor.info());
        }
        ActorMessage::Stop(sender) => {
            error!("Stop must be handled by the run loop");
            let _ = sender.send(());
        }
        ActorMessage::FindPeer(peerid, service, sender) => {
            actor.find_peer(&peerid, service.as_deref(), sender);
        }
        ActorMessage::SaveValue(request, value, sender) => {
            actor.save_value(
                &request.table,
                &request.key,
                &value,
                request.service.as_deref(),
                Some(sender),
            );
        }
        ActorMessage::GetValue(request, fuzzy, sender) => {
            actor.get_value(
                &request.table,
                &request.key,
                fuzzy,
                request.service.as_deref(),
                sender,
            );
        }
        ActorMessage::DeleteValue(request, sender) => {
            let _ = sender.send(actor.delete_value(
                &request.table,
                &request.key,
                request.service.as_deref(),
            ));
        }
        ActorMessage::EmitBroadcastEvent(data, service, sender) => {
            actor.emit_broadcast_event(data, service.as_deref(), Some(sender));
        }
        ActorMessage::AttachBroadcastListener(sender) => {
            actor.attach_broadcast_listener(sender);
        }
        ActorMessage::ActivePeer(info, address, is_sent, is_received, sender) => {
            let _ = sender.send(actor.active_peer(&info, address, is_sent, is_received));
        }
        ActorMessage::Ping(info, sender) => {
            actor.ping(&info, sender);
        }
        ActorMessage::OnlinePeers(service, sender) => {
            let _ = sender.send(actor.online_peers(service.as_deref()));
        }
        ActorMessage::RandomPeers(count, service, sender) => {
            let _ = sender.send(actor.random_peers(count, service.as_deref()));
        }
        ActorMessage::Sign(path, change, sender) => {
            let changed = match change {
                SignChange::Signin(role) => actor.signin(&path, role),
                SignChange::Signout(role) => actor.signout(&path, role),
            };
            let _ = sender.send(changed);
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;
    use crate::common::Endpoint;

    fn node(network: &MemoryNetwork, peerid: &str) -> Dht {
        Dht::builder(peerid)
            .transport(Box::new(network.transport(Protocol::Udp)))
            .build()
            .unwrap()
    }

    #[test]
    fn stop() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        let clone = dht.clone();
        dht.stop();

        assert!(matches!(clone.info(), Err(DhtWasShutdown)));
        assert!(matches!(clone.find_peer("bob"), Err(DhtWasShutdown)));
    }

    #[test]
    fn empty_peerid_is_rejected() {
        let network = MemoryNetwork::new();
        let result = Dht::builder("")
            .transport(Box::new(network.transport(Protocol::Udp)))
            .build();

        assert!(matches!(result, Err(Error::InvalidArgs(_))));
    }

    #[test]
    fn find_self() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        let found = dht.find_peer("alice").unwrap();

        assert_eq!(found.result, ResultCode::Success);
        assert_eq!(found.peers[0].peerid, "alice");
    }

    #[test]
    fn active_peer_then_find_peer() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        let address = SocketAddr::from(([10, 0, 0, 2], 4660));
        let info = PeerInfo::new("bob").with_endpoint(Endpoint::udp(address));

        dht.active_peer(info, Some(address), false, true).unwrap();

        let found = dht.find_peer("bob").unwrap();
        assert_eq!(found.result, ResultCode::Success);
        assert_eq!(found.peers.len(), 1);
        assert_eq!(found.peers[0].peerid, "bob");
        assert_eq!(found.peers[0].eplist, vec![Endpoint::udp(address)]);
    }

    #[test]
    fn save_then_get_locally() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        let saved = dht.save_value("t", "k", "v").unwrap();
        assert_eq!(saved.result, ResultCode::Success);

        let got = dht.get_value("t", "k").unwrap();
        assert_eq!(got.result, ResultCode::Success);
        assert_eq!(got.values.get("k"), Some(&"v".to_string()));

        let all = dht.get_value("t", "*").unwrap();
        assert_eq!(all.values.len(), 1);
    }

    #[test]
    fn whole_table_key_is_not_writable() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        let saved = dht.save_value("t", "*", "v").unwrap();
        assert_eq!(saved.result, ResultCode::InvalidArgs);
    }

    #[test]
    fn delete_value() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");

        dht.save_value("t", "k", "v").unwrap();
        assert_eq!(dht.delete_value("t", "k").unwrap(), ResultCode::Success);
        assert_eq!(dht.delete_value("t", "k").unwrap(), ResultCode::Failed);
    }

    #[test]
    fn service_values_are_scoped() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");
        let chat = dht.service("chat");

        chat.save_value("t", "k", "v").unwrap();

        assert_eq!(chat.get_value("t", "k").unwrap().values.len(), 1);
        assert!(dht.get_value("t", "k").unwrap().values.is_empty());
    }

    #[test]
    fn signin_signout() {
        let network = MemoryNetwork::new();
        let dht = node(&network, "alice");
        let chat = dht.service("chat");

        assert!(chat.signin_server().unwrap());
        assert!(chat.signin_visitor().unwrap());
        assert!(chat.signout_server().unwrap());
        assert!(chat.signout().unwrap());
        assert!(!chat.signout().unwrap());
    }
}
