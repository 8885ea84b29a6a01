use std::collections::BTreeMap;
use std::time::Duration;

use crate::common::{
    BucketSettings, LocalPeerSettings, PeerInfo, ValueSettings, DEFAULT_BUCKET_COUNT,
    DEFAULT_BUCKET_SIZE, DEFAULT_TABLE_COUNT, DEFAULT_TABLE_SIZE, DEFAULT_VALUE_TIMEOUT,
    DEFAULT_VALUE_UPDATE_INTERVAL,
};
use crate::protocol::piece::{DEFAULT_PIECE_BUDGET_TTL, DEFAULT_PIECE_REBUILD_IDLE};
use crate::protocol::{DEFAULT_MAX_TTL, DEFAULT_PACKAGE_LIMIT};

use super::resend::{
    DEFAULT_RESEND_IDLE_TIMEOUT, DEFAULT_RESEND_INTERVAL, DEFAULT_RESEND_LIMIT,
    DEFAULT_RESEND_REGISTRY_HIGH_WATER,
};

/// Default UDP port tried before falling back to a random one.
pub const DEFAULT_PORT: u16 = 4660;

#[derive(Debug, Clone)]
/// Dht Configurations
pub struct Config {
    /// Application id, packages of other applications are dropped.
    ///
    /// Defaults to `0`
    pub appid: u32,
    /// Explicit port for the default [crate::UdpTransport] to listen on.
    ///
    /// Defaults to None, trying [DEFAULT_PORT] then a random port.
    pub port: Option<u16>,
    /// Peers to add to the routing table on start.
    pub bootstrap: Vec<PeerInfo>,
    /// Announced in the common section of every package.
    pub additional_info: BTreeMap<String, String>,

    /// Maximum peers per bucket item (K).
    pub bucket_size: usize,
    /// Maximum number of bucket items.
    pub bucket_count: usize,
    /// Largest package sent in one datagram before fragmenting.
    pub package_limit: usize,
    /// Inbound ttl clamp.
    pub max_ttl: u8,
    /// Hop budget of lookups and broadcasts.
    pub default_ttl: u8,

    /// Learned endpoints recorded beyond the init endpoints.
    pub max_ep_count: usize,
    pub ep_timeout: Duration,
    /// Online time after which an unresolved NAT classification becomes unknown.
    pub nat_type_time: Duration,
    /// A peer is online if it was heard from within this duration.
    pub peer_online_limit: Duration,

    pub task_timeout: Duration,
    /// Idle time after which a task retries its outstanding peers.
    pub task_retry_interval: Duration,
    /// Attempts per peer inside a lookup, independent of resends.
    pub task_max_try: u32,

    pub resend_interval: Duration,
    pub resend_limit: u32,
    pub resend_registry_high_water: usize,
    pub resend_idle_timeout: Duration,

    pub piece_budget_ttl: Duration,
    pub piece_rebuild_idle: Duration,

    pub table_count: usize,
    pub table_size: usize,
    pub value_timeout: Duration,
    /// Republish interval of our own values.
    pub value_update_interval: Duration,

    /// Task wake cadence.
    pub fast_tick: Duration,
    /// Housekeeping cadence.
    pub slow_tick: Duration,

    pub expand_min: Duration,
    pub expand_max: Duration,
    pub ping_min: Duration,
    pub ping_max: Duration,
    pub ping_retry_grace: Duration,
    /// Peers silent for this long are removed from the routing table.
    pub peer_drop_time: Duration,

    /// Reached peers a broadcast aims for.
    pub broadcast_target: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            appid: 0,
            port: None,
            bootstrap: Vec::new(),
            additional_info: BTreeMap::new(),

            bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            package_limit: DEFAULT_PACKAGE_LIMIT,
            max_ttl: DEFAULT_MAX_TTL,
            default_ttl: 3,

            max_ep_count: 8,
            ep_timeout: Duration::from_secs(10 * 60),
            nat_type_time: Duration::from_secs(30 * 60),
            peer_online_limit: Duration::from_secs(60),

            task_timeout: Duration::from_secs(30),
            task_retry_interval: Duration::from_secs(1),
            task_max_try: 3,

            resend_interval: DEFAULT_RESEND_INTERVAL,
            resend_limit: DEFAULT_RESEND_LIMIT,
            resend_registry_high_water: DEFAULT_RESEND_REGISTRY_HIGH_WATER,
            resend_idle_timeout: DEFAULT_RESEND_IDLE_TIMEOUT,

            piece_budget_ttl: DEFAULT_PIECE_BUDGET_TTL,
            piece_rebuild_idle: DEFAULT_PIECE_REBUILD_IDLE,

            table_count: DEFAULT_TABLE_COUNT,
            table_size: DEFAULT_TABLE_SIZE,
            value_timeout: DEFAULT_VALUE_TIMEOUT,
            value_update_interval: DEFAULT_VALUE_UPDATE_INTERVAL,

            fast_tick: Duration::from_millis(100),
            slow_tick: Duration::from_secs(1),

            expand_min: Duration::from_secs(5),
            expand_max: Duration::from_secs(10 * 60),
            ping_min: Duration::from_secs(15),
            ping_max: Duration::from_secs(5 * 60),
            ping_retry_grace: Duration::from_secs(5),
            peer_drop_time: Duration::from_secs(30 * 60),

            broadcast_target: 32,
        }
    }
}

impl Config {
    pub(crate) fn bucket_settings(&self) -> BucketSettings {
        BucketSettings {
            bucket_size: self.bucket_size,
            bucket_count: self.bucket_count,
            online_limit: self.peer_online_limit,
        }
    }

    pub(crate) fn local_peer_settings(&self) -> LocalPeerSettings {
        LocalPeerSettings {
            max_ep_count: self.max_ep_count,
            ep_timeout: self.ep_timeout,
            nat_type_time: self.nat_type_time,
        }
    }

    pub(crate) fn value_settings(&self) -> ValueSettings {
        ValueSettings {
            table_count: self.table_count,
            table_size: self.table_size,
            value_timeout: self.value_timeout,
        }
    }
}
