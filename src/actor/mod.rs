//! Actor implementation, the single threaded executor that owns the routing
//! table, the running tasks and the value tables.

pub(crate) mod config;
mod info;
pub(crate) mod network;
mod processor;
pub(crate) mod resend;
mod route_table;
pub(crate) mod sender;
pub(crate) mod tasks;
pub(crate) mod transport;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::time::Instant;

use flume::Sender;
use lru::LruCache;
use tracing::{debug, info};

use crate::common::{
    closest_values, ActiveFlags, ActiveResult, Bucket, DistributedValueTableMgr, Endpoint,
    LocalPeer, LocalValueMgr, PeerFilter, PeerInfo, ServiceDescriptor, ServiceRole,
    MAX_ENDPOINT_STRING_LEN, WHOLE_TABLE_KEY,
};
use crate::protocol::piece::PiecePackageRebuilder;
use crate::protocol::{
    Body, BroadcastEventBody, Package, PingBody, SaveValueBody, MAX_PACKAGE_SIZE,
};
use crate::{Error, Result, ResultCode};

use network::Network;
use route_table::RouteTable;
use sender::{PackageSender, Target};
use tasks::handshake::HandshakeTask;
use tasks::ping::PingTask;
use tasks::touch::{TouchKind, TouchNodeTask};
use tasks::{internal_find_peer, Task, TaskMgr};

pub use config::{Config, DEFAULT_PORT};
pub use info::Info;
pub use tasks::{FindPeerResult, GetValueResult, TouchResult};
pub use transport::{MemoryNetwork, MemoryTransport, Transport, UdpTransport};

/// Broadcast events remembered to deliver each one once.
const DELIVERED_EVENTS: usize = 4096;
/// Inbound packages handled per tick before moving on to timers.
const MAX_RECV_PER_TICK: usize = 1024;
/// Joins a service path and a table name, so table names can't contain it.
pub const TABLE_SCOPE_SEPARATOR: char = ':';

#[derive(Debug, Clone, PartialEq, Eq)]
/// An event emitted by some peer with [crate::Dht::emit_broadcast_event].
pub struct BroadcastEvent {
    pub source: String,
    pub event_id: u32,
    /// Service sub-network the event was emitted in.
    pub service: Option<String>,
    pub data: Vec<u8>,
}

#[derive(Debug)]
/// Internal Actor called in the Dht thread loop, useful to drive a node yourself
/// or to run many nodes in one thread over a [MemoryNetwork].
pub struct Actor {
    net: Network,
    tasks: TaskMgr,

    /// Values stored on behalf of other peers.
    values: DistributedValueTableMgr,
    /// Values we published, republished periodically.
    local_values: LocalValueMgr,
    /// Service of every service scoped table we published to.
    local_value_services: HashMap<String, String>,

    route_table: RouteTable,
    rebuilder: PiecePackageRebuilder,

    listeners: Vec<Sender<BroadcastEvent>>,
    delivered: LruCache<(String, u32), ()>,
    next_event_id: u32,

    last_fast_tick: Instant,
    last_slow_tick: Instant,
}

impl Actor {
    /// Creates a new Actor. Does not perform network I/O, call [Actor::tick] to
    /// bootstrap and run scheduled maintenance.
    pub fn new(peerid: impl Into<String>, transport: Box<dyn Transport>, config: Config) -> Result<Self> {
        let peerid = peerid.into();
        if peerid.is_empty() {
            return Err(Error::InvalidArgs("empty peerid"));
        }

        let now = Instant::now();

        let sender = PackageSender::new(transport, &config);
        let info = PeerInfo {
            peerid,
            eplist: sender.listen_endpoints(),
            services: ServiceDescriptor::new(),
            additional_info: config.additional_info.clone(),
        };
        info!(peerid = %info.peerid, eplist = ?info.eplist, "Meshdht node listening");

        let local = LocalPeer::new(&info, config.local_peer_settings(), now);
        let mut net = Network::new(local, sender, config.clone());

        for peer in &config.bootstrap {
            if peer.peerid != info.peerid {
                net.bucket
                    .active_peer(peer, None, ActiveFlags::referral(), now);
            }
        }

        Ok(Self {
            tasks: TaskMgr::new(),
            values: DistributedValueTableMgr::new(config.value_settings()),
            local_values: LocalValueMgr::new(config.value_update_interval),
            local_value_services: HashMap::new(),
            route_table: RouteTable::new(&config, now),
            rebuilder: PiecePackageRebuilder::new(config.piece_rebuild_idle),
            listeners: Vec::new(),
            delivered: LruCache::new(
                NonZeroUsize::new(DELIVERED_EVENTS).unwrap_or(NonZeroUsize::MIN),
            ),
            next_event_id: rand::random(),
            last_fast_tick: now,
            last_slow_tick: now,
            net,
        })
    }

    // === Getters ===

    /// Returns the node's peerid.
    pub fn peerid(&self) -> &str {
        self.net.local.peerid()
    }

    pub fn config(&self) -> &Config {
        &self.net.config
    }

    pub fn bucket(&self) -> &Bucket {
        &self.net.bucket
    }

    pub fn local_peer(&self) -> &LocalPeer {
        &self.net.local
    }

    /// Returns a thread safe and lightweight summary of this node.
    pub fn info(&self) -> Info {
        Info::from(self)
    }

    // === Public Methods ===

    /// Handle inbound packages, then resends and task timers on the fast
    /// cadence, then housekeeping on the slow cadence.
    pub fn tick(&mut self) {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) {
        for _ in 0..MAX_RECV_PER_TICK {
            let Some((bytes, from)) = self.net.sender.recv() else {
                break;
            };
            self.process(&bytes, Some(from), now);
        }

        for _ in 0..MAX_RECV_PER_TICK {
            let Some(bytes) = self.net.sender.pop_loopback() else {
                break;
            };
            self.process(&bytes, None, now);
        }

        if now.saturating_duration_since(self.last_fast_tick) >= self.net.config.fast_tick {
            self.last_fast_tick = now;

            self.net.sender.resend_due(now);
            self.tasks.wake(&mut self.net, now);
        }

        if now.saturating_duration_since(self.last_slow_tick) >= self.net.config.slow_tick {
            self.last_slow_tick = now;

            self.housekeeping(now);
        }
    }

    /// Look a peer up, answering right away if it is already in the routing table.
    pub fn find_peer(&mut self, peerid: &str, service: Option<&str>, sender: Sender<FindPeerResult>) {
        let now = Instant::now();

        if peerid.is_empty() {
            let _ = sender.send(FindPeerResult {
                result: ResultCode::InvalidArgs,
                peers: Vec::new(),
            });
            return;
        }

        let known = if peerid == self.net.local.peerid() {
            Some(self.net.local.info())
        } else {
            self.net
                .bucket
                .get_peer(peerid)
                .filter(|peer| service.map_or(true, |path| peer.services().is_server(path)))
                .map(|peer| peer.info())
        };
        if let Some(info) = known {
            let _ = sender.send(FindPeerResult {
                result: ResultCode::Success,
                peers: vec![info],
            });
            return;
        }

        let id = self.net.next_task_id();
        let task = TouchNodeTask::new(
            id,
            TouchKind::find_peer(peerid.to_string(), vec![sender]),
            service.map(String::from),
            &self.net.config,
            now,
        );
        self.start_touch(task, now);
    }

    /// Publish a value, held locally and republished until deleted.
    pub fn save_value(
        &mut self,
        table: &str,
        key: &str,
        value: &str,
        service: Option<&str>,
        sender: Option<Sender<TouchResult>>,
    ) {
        let now = Instant::now();

        let invalid = !is_valid_table(table) || key.is_empty() || key == WHOLE_TABLE_KEY;
        let table = scoped_table(service, table);
        let values = BTreeMap::from([(key.to_string(), value.to_string())]);

        if invalid
            || !self.fits_package(&Body::SaveValue(SaveValueBody {
                taskid: u32::MAX,
                table: table.clone(),
                values: values.clone(),
                service: service.map(String::from),
                ..Default::default()
            }))
        {
            if let Some(sender) = sender {
                let _ = sender.send(TouchResult {
                    result: ResultCode::InvalidArgs,
                    reached: Vec::new(),
                });
            }
            return;
        }

        self.local_values.save(&table, key, value, now);
        if let Some(service) = service {
            self.local_value_services
                .insert(table.clone(), service.to_string());
        }

        self.start_save(table, values, service.map(String::from), sender, now);
    }

    /// Read a value, from our own published values and replicas first.
    pub fn get_value(
        &mut self,
        table: &str,
        key: &str,
        fuzzy: bool,
        service: Option<&str>,
        sender: Sender<GetValueResult>,
    ) {
        let now = Instant::now();

        if !is_valid_table(table) || key.is_empty() {
            let _ = sender.send(GetValueResult {
                result: ResultCode::InvalidArgs,
                values: BTreeMap::new(),
                reached: Vec::new(),
            });
            return;
        }

        let table = scoped_table(service, table);
        let values = self.find_values(&table, &[key.to_string()], fuzzy);
        if !values.is_empty() {
            let _ = sender.send(GetValueResult {
                result: ResultCode::Success,
                values,
                reached: vec![self.net.local.peerid().to_string()],
            });
            return;
        }

        let id = self.net.next_task_id();
        let task = TouchNodeTask::new(
            id,
            TouchKind::get_value(table, vec![key.to_string()], fuzzy, Some(sender)),
            service.map(String::from),
            &self.net.config,
            now,
        );
        self.start_touch(task, now);
    }

    /// Stop publishing a value, [WHOLE_TABLE_KEY] stops the whole table.
    ///
    /// Replicas on other peers expire on their own.
    pub fn delete_value(&mut self, table: &str, key: &str, service: Option<&str>) -> ResultCode {
        if !is_valid_table(table) || key.is_empty() {
            return ResultCode::InvalidArgs;
        }

        let table = scoped_table(service, table);
        if !self.local_values.delete(&table, key) {
            return ResultCode::Failed;
        }
        if self.local_values.get(&table, WHOLE_TABLE_KEY).is_empty() {
            self.local_value_services.remove(&table);
        }

        ResultCode::Success
    }

    /// Spread an event to up to [Config::broadcast_target] peers.
    pub fn emit_broadcast_event(
        &mut self,
        data: Vec<u8>,
        service: Option<&str>,
        sender: Option<Sender<TouchResult>>,
    ) {
        let now = Instant::now();

        let source = self.net.local.peerid().to_string();
        let event_id = self.next_event_id;

        let fits = self.fits_package(&Body::BroadcastEvent(BroadcastEventBody {
            taskid: u32::MAX,
            source: source.clone(),
            event_id,
            event: serde_bytes::ByteBuf::from(data.clone()),
            service: service.map(String::from),
            ..Default::default()
        }));
        if !fits {
            if let Some(sender) = sender {
                let _ = sender.send(TouchResult {
                    result: ResultCode::InvalidArgs,
                    reached: Vec::new(),
                });
            }
            return;
        }

        self.next_event_id = self.next_event_id.wrapping_add(1);

        // Our own event relayed back to us is not delivered.
        self.delivered.put((source.clone(), event_id), ());

        let id = self.net.next_task_id();
        let task = TouchNodeTask::new(
            id,
            TouchKind::broadcast(
                source,
                event_id,
                data,
                self.net.config.broadcast_target,
                sender,
            ),
            service.map(String::from),
            &self.net.config,
            now,
        );
        self.tasks.add(&mut self.net, Task::Touch(task), now);
    }

    /// Receive every broadcast event delivered to this node from now on.
    pub fn attach_broadcast_listener(&mut self, sender: Sender<BroadcastEvent>) {
        self.listeners.push(sender);
    }

    /// Tell the routing table about a peer.
    ///
    /// `is_received` means the information came from the peer itself.
    pub fn active_peer(
        &mut self,
        info: &PeerInfo,
        address: Option<SocketAddr>,
        is_sent: bool,
        is_received: bool,
    ) -> ActiveResult {
        if info.peerid.is_empty() || info.peerid == self.net.local.peerid() {
            return ActiveResult::Ignored;
        }

        let flags = ActiveFlags {
            sent: is_sent,
            received: is_received,
            trust: is_received,
        };

        let result = self.net.bucket.active_peer(
            info,
            address.map(Endpoint::udp),
            flags,
            Instant::now(),
        );
        self.on_evicted(&result);

        result
    }

    /// Ping a peer, resolving [ResultCode::Success] on its answer.
    pub fn ping(&mut self, info: &PeerInfo, sender: Sender<ResultCode>) {
        let now = Instant::now();

        if info.peerid.is_empty() {
            let _ = sender.send(ResultCode::InvalidArgs);
            return;
        }

        if let Some(task) = self.tasks.ping_mut(&info.peerid) {
            task.add_waiter(sender);
            return;
        }

        let target = match self.net.target(&info.peerid) {
            Some(target) if !target.candidates.is_empty() => target,
            _ => Target::from_info(info, None),
        };

        let id = self.net.next_task_id();
        let task = PingTask::new(id, target, Some(sender), &self.net.config, now);
        self.tasks.add(&mut self.net, Task::Ping(task), now);
    }

    /// Ask `agency` to introduce us to `info`, for peers behind a NAT.
    pub fn handshake(&mut self, info: &PeerInfo, agency: Option<&str>) {
        let now = Instant::now();

        let target = match self.net.target(&info.peerid) {
            Some(target) if !target.candidates.is_empty() => target,
            _ => Target::from_info(info, None),
        };

        let id = self.net.next_task_id();
        let task = HandshakeTask::source(
            id,
            target,
            agency.map(String::from),
            &self.net.config,
            now,
        );
        self.tasks.add(&mut self.net, Task::Handshake(task), now);
    }

    /// Peers heard from within [Config::peer_online_limit].
    pub fn online_peers(&self, service: Option<&str>) -> Vec<PeerInfo> {
        self.net
            .bucket
            .online_peers(Instant::now())
            .filter(|peer| service.map_or(true, |path| peer.services().is_server(path)))
            .map(|peer| peer.info())
            .collect()
    }

    pub fn random_peers(&self, count: usize, service: Option<&str>) -> Vec<PeerInfo> {
        self.net
            .bucket
            .random_peers(&PeerFilter::count(count).service(service))
            .into_iter()
            .map(|peer| peer.info())
            .collect()
    }

    /// Sign in to a service sub-network, announced in every package we send.
    pub fn signin(&mut self, path: &str, role: ServiceRole) -> bool {
        self.net.local.peer_mut().services_mut().signin(path, role)
    }

    /// Sign out of a service for `role`, or for every role.
    pub fn signout(&mut self, path: &str, role: Option<ServiceRole>) -> bool {
        self.net.local.peer_mut().services_mut().signout(path, role)
    }

    /// Complete every running task with [ResultCode::Stopped].
    pub fn stop(&mut self) {
        self.tasks.stop_all();
    }

    // === Private Methods ===

    fn start_touch(&mut self, task: TouchNodeTask, now: Instant) {
        if let Some(task) = self.tasks.join(&mut self.net, task, now) {
            self.tasks.add(&mut self.net, Task::Touch(task), now);
        }
    }

    fn start_save(
        &mut self,
        table: String,
        values: BTreeMap<String, String>,
        service: Option<String>,
        sender: Option<Sender<TouchResult>>,
        now: Instant,
    ) {
        let id = self.net.next_task_id();
        let task = TouchNodeTask::new(
            id,
            TouchKind::save_value(table, values, sender),
            service,
            &self.net.config,
            now,
        );
        self.start_touch(task, now);
    }

    /// Values we hold for `table`, ours and replicas.
    fn find_values(&self, table: &str, keys: &[String], fuzzy: bool) -> BTreeMap<String, String> {
        let mut found = BTreeMap::new();

        let count = self.net.config.bucket_size;

        for key in keys {
            if fuzzy {
                let mut candidates = self.values.find_closest_values(table, key, count);
                candidates.extend(self.local_values.find_closest_values(table, key, count));
                found.extend(closest_values(candidates, key, count));
            } else {
                found.extend(self.values.find_value(table, key));
                found.extend(self.local_values.get(table, key));
            }
        }

        found
    }

    /// Whether a request with `body` fits the u16 length fields, with room
    /// left for the destination peerid and endpoint.
    fn fits_package(&self, body: &Body) -> bool {
        let local = self.net.local.info();

        Package::request_len(body, &local, &local.peerid)
            .is_ok_and(|len| len + MAX_ENDPOINT_STRING_LEN <= MAX_PACKAGE_SIZE)
    }

    fn on_evicted(&mut self, result: &ActiveResult) {
        if let ActiveResult::Replaced(evicted) = result {
            for peerid in evicted {
                self.net.sender.cancel_resends(peerid);
            }
        }
    }

    fn housekeeping(&mut self, now: Instant) {
        self.values.sweep(now);
        self.rebuilder.sweep(now);
        self.net.local.expire_endpoints(now);

        for (table, values) in self.local_values.take_due(now) {
            let service = self.local_value_services.get(&table).cloned();
            self.start_save(table, values, service, None, now);
        }

        let maintenance =
            self.route_table
                .maintain_at(&self.net.bucket, &self.net.local, &self.net.config, now);

        for peerid in &maintenance.drop {
            debug!(context = "route_table", %peerid, "Dropping silent peer");
            self.net.bucket.remove_peer(peerid);
            self.net.sender.cancel_resends(peerid);
        }

        for peerid in &maintenance.ping {
            let Some(target) = self.net.target(peerid) else {
                continue;
            };
            if let Err(error) = self.net.request(&target, Body::Ping(PingBody {}), 0, now) {
                debug!(context = "route_table", ?error, %peerid, "Keepalive ping failed");
            }
        }

        if maintenance.expand {
            let target = format!("{:016x}", rand::random::<u64>());
            let task = internal_find_peer(&mut self.net, target, now);
            self.tasks.add(&mut self.net, task, now);
        }
    }
}

/// Values of a service sub-network live in their own tables.
fn scoped_table(service: Option<&str>, table: &str) -> String {
    match service {
        Some(service) => format!("{service}{TABLE_SCOPE_SEPARATOR}{table}"),
        None => table.to_string(),
    }
}

fn is_valid_table(table: &str) -> bool {
    !table.is_empty() && !table.contains(TABLE_SCOPE_SEPARATOR)
}
