//! This node's own peer record: endpoints it was started with, endpoints other
//! peers observed, and the NAT classification inferred from them.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::common::{Endpoint, Hash, NatType, Peer, PeerInfo};

/// Passive discoveries needed before judging the incoming ratio.
const RESTRICTED_NAT_MIN_DISCOVERIES: u32 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointInfo {
    /// Supplied at startup, never expires.
    Init,
    /// Reported back to us by another peer.
    Learned {
        update_time: Instant,
        /// The NAT kept our listening port for this mapping.
        reuse_listener: bool,
        /// The local listener the observation arrived on.
        sender_ep: Option<Endpoint>,
    },
}

#[derive(Debug, Clone)]
pub struct LocalPeerSettings {
    pub max_ep_count: usize,
    pub ep_timeout: Duration,
    pub nat_type_time: Duration,
}

#[derive(Debug)]
pub struct LocalPeer {
    peer: Peer,
    endpoints: HashMap<Endpoint, EndpointInfo>,
    settings: LocalPeerSettings,

    /// Observations dropped because the learned list was already full.
    overflowed: usize,

    passive_discoveries: u32,
    incoming_connections: u32,
    awaiting_incoming: HashSet<String>,

    last_recv_from_public: Option<Instant>,
}

impl LocalPeer {
    pub fn new(info: &PeerInfo, settings: LocalPeerSettings, now: Instant) -> Self {
        let mut peer = Peer::from_info(info);
        peer.set_reported_state(NatType::Unknown, Duration::ZERO, now);

        let endpoints = info
            .eplist
            .iter()
            .map(|ep| (*ep, EndpointInfo::Init))
            .collect();

        Self {
            peer,
            endpoints,
            settings,
            overflowed: 0,
            passive_discoveries: 0,
            incoming_connections: 0,
            awaiting_incoming: HashSet::new(),
            last_recv_from_public: None,
        }
    }

    // === Getters ===

    pub fn peerid(&self) -> &str {
        self.peer.peerid()
    }

    pub fn hash(&self) -> Hash {
        self.peer.hash()
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn peer_mut(&mut self) -> &mut Peer {
        &mut self.peer
    }

    pub fn online_duration(&self, now: Instant) -> Duration {
        self.peer.online_duration(now)
    }

    pub fn init_count(&self) -> usize {
        self.endpoints
            .values()
            .filter(|info| matches!(info, EndpointInfo::Init))
            .count()
    }

    pub fn learned_count(&self) -> usize {
        self.endpoints.len() - self.init_count()
    }

    pub fn endpoint_info(&self, endpoint: &Endpoint) -> Option<&EndpointInfo> {
        self.endpoints.get(endpoint)
    }

    pub fn last_recv_from_public(&self) -> Option<Instant> {
        self.last_recv_from_public
    }

    /// Announceable endpoints: everything known except wildcard or zero addresses.
    pub fn eplist(&self) -> Vec<Endpoint> {
        let mut eplist: Vec<Endpoint> = self
            .endpoints
            .keys()
            .filter(|ep| !ep.is_zero())
            .copied()
            .collect();
        eplist.sort();
        eplist
    }

    /// Description sent in the common section of every package.
    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            eplist: self.eplist(),
            ..self.peer.info()
        }
    }

    // === Endpoint learning ===

    /// Record an endpoint another peer saw us at (`dest.ep` of an inbound package),
    /// `via` being the local listener the package arrived on.
    ///
    /// Returns the NAT-corrected TCP endpoints synthesized from this observation.
    pub fn union_eplist(
        &mut self,
        observed: Endpoint,
        via: Option<Endpoint>,
        now: Instant,
    ) -> Vec<Endpoint> {
        if observed.is_zero() {
            return Vec::new();
        }

        let reuse_listener = via.is_some_and(|via| via.address.port() == observed.address.port());

        match self.endpoints.get_mut(&observed) {
            Some(EndpointInfo::Init) => {}
            Some(EndpointInfo::Learned {
                update_time,
                reuse_listener: reuse,
                sender_ep,
            }) => {
                *update_time = now;
                *reuse = reuse_listener;
                *sender_ep = via;
            }
            None => {
                if !self.record_learned(observed, reuse_listener, via, now) {
                    return Vec::new();
                }
            }
        }

        if !reuse_listener || observed.is_private() {
            return Vec::new();
        }

        // The router kept our port, so a private TCP listener on that same port is
        // probably reachable at the public ip too.
        let synthesized: Vec<Endpoint> = self
            .endpoints
            .keys()
            .filter(|ep| {
                !ep.is_udp() && ep.is_private() && ep.address.port() == observed.address.port()
            })
            .map(|ep| {
                Endpoint::tcp(std::net::SocketAddr::new(
                    observed.address.ip(),
                    ep.address.port(),
                ))
            })
            .filter(|ep| !self.endpoints.contains_key(ep))
            .collect();

        for ep in &synthesized {
            self.record_learned(*ep, true, None, now);
        }

        synthesized
    }

    fn record_learned(
        &mut self,
        endpoint: Endpoint,
        reuse_listener: bool,
        sender_ep: Option<Endpoint>,
        now: Instant,
    ) -> bool {
        if self.learned_count() >= self.init_count() + self.settings.max_ep_count {
            // Symmetric NAT hands out a new mapping per destination, stop recording.
            self.overflowed += 1;
            return false;
        }

        self.endpoints.insert(
            endpoint,
            EndpointInfo::Learned {
                update_time: now,
                reuse_listener,
                sender_ep,
            },
        );
        true
    }

    /// Drop learned endpoints not refreshed within the endpoint timeout.
    pub fn expire_endpoints(&mut self, now: Instant) {
        let timeout = self.settings.ep_timeout;

        self.endpoints.retain(|_, info| match info {
            EndpointInfo::Init => true,
            EndpointInfo::Learned { update_time, .. } => {
                now.saturating_duration_since(*update_time) < timeout
            }
        });

        if self.learned_count() < self.init_count() + self.settings.max_ep_count {
            self.overflowed = 0;
        }
    }

    // === NAT evidence ===

    /// Someone asked an agency to reach us.
    pub fn on_hole_called(&mut self, source: &str) {
        self.passive_discoveries = self.passive_discoveries.saturating_add(1);
        self.awaiting_incoming.insert(source.to_string());
    }

    /// A peer reached us directly with a handshake.
    pub fn on_handshake_request(&mut self, source: &str) {
        if self.awaiting_incoming.remove(source) {
            self.incoming_connections = self.incoming_connections.saturating_add(1);
        }
    }

    /// Note a package arriving from a peer of the given class.
    pub fn on_received_from(&mut self, nat_type: NatType, now: Instant) {
        if nat_type == NatType::Internet {
            self.last_recv_from_public = Some(now);
        }
    }

    /// Derived NAT classification, recomputed on every read.
    pub fn nat_type(&self, now: Instant) -> NatType {
        if self.is_internet(now) {
            return NatType::Internet;
        }

        let limit = self.init_count() + self.settings.max_ep_count;
        if self.learned_count() + self.overflowed > limit * 2 {
            return NatType::SymmetricNat;
        }

        if self.passive_discoveries >= RESTRICTED_NAT_MIN_DISCOVERIES
            && self.incoming_connections * 10 < self.passive_discoveries
        {
            return NatType::RestrictedNat;
        }

        if self.online_duration(now) > self.settings.nat_type_time {
            return NatType::Unknown;
        }

        NatType::Nat
    }

    fn is_internet(&self, now: Instant) -> bool {
        self.endpoints.iter().any(|(ep, info)| match info {
            EndpointInfo::Learned {
                update_time,
                sender_ep: Some(sender_ep),
                ..
            } => {
                now.saturating_duration_since(*update_time) < self.settings.ep_timeout
                    && sender_ep.matches(ep)
            }
            _ => false,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn udp(s: &str) -> Endpoint {
        Endpoint::udp(s.parse().unwrap())
    }

    fn tcp(s: &str) -> Endpoint {
        Endpoint::tcp(s.parse().unwrap())
    }

    fn settings() -> LocalPeerSettings {
        LocalPeerSettings {
            max_ep_count: 4,
            ep_timeout: Duration::from_secs(600),
            nat_type_time: Duration::from_secs(1800),
        }
    }

    fn local(eplist: Vec<Endpoint>, now: Instant) -> LocalPeer {
        let info = PeerInfo {
            peerid: "me".to_string(),
            eplist,
            ..Default::default()
        };
        LocalPeer::new(&info, settings(), now)
    }

    #[test]
    fn wildcard_listener_is_not_announced() {
        let now = Instant::now();
        let me = local(vec![udp("0.0.0.0:4000"), udp("192.168.1.2:4000")], now);

        assert_eq!(me.eplist(), vec![udp("192.168.1.2:4000")]);
    }

    #[test]
    fn internet_when_seen_at_listener() {
        let now = Instant::now();
        let mut me = local(vec![udp("0.0.0.0:4000")], now);

        assert_eq!(me.nat_type(now), NatType::Nat);

        me.union_eplist(udp("8.8.4.4:4000"), Some(udp("0.0.0.0:4000")), now);
        assert_eq!(me.nat_type(now), NatType::Internet);

        // Evidence expires.
        let later = now + Duration::from_secs(601);
        assert_ne!(me.nat_type(later), NatType::Internet);
    }

    #[test]
    fn nat_when_mapping_differs() {
        let now = Instant::now();
        let mut me = local(vec![udp("192.168.1.2:4000")], now);

        me.union_eplist(udp("8.8.4.4:62000"), Some(udp("192.168.1.2:4000")), now);
        assert_eq!(me.nat_type(now), NatType::Nat);
        assert_eq!(me.learned_count(), 1);
    }

    #[test]
    fn symmetric_nat_stops_recording() {
        let now = Instant::now();
        let mut me = local(vec![udp("192.168.1.2:4000")], now);

        for port in 0..20u16 {
            let observed = Endpoint::udp(std::net::SocketAddr::from(([8, 8, 4, 4], 60000 + port)));
            me.union_eplist(observed, Some(udp("192.168.1.2:4000")), now);
        }

        // init + max_ep_count learned at most.
        assert_eq!(me.learned_count(), 1 + 4);
        assert_eq!(me.nat_type(now), NatType::SymmetricNat);

        me.expire_endpoints(now + Duration::from_secs(601));
        assert_eq!(me.learned_count(), 0);
        assert_eq!(me.nat_type(now), NatType::Nat);
    }

    #[test]
    fn restricted_nat() {
        let now = Instant::now();
        let mut me = local(vec![udp("192.168.1.2:4000")], now);

        for i in 0..64 {
            me.on_hole_called(&format!("caller-{i}"));
        }
        for i in 0..5 {
            me.on_handshake_request(&format!("caller-{i}"));
        }
        assert_eq!(me.nat_type(now), NatType::RestrictedNat);

        for i in 5..7 {
            me.on_handshake_request(&format!("caller-{i}"));
        }
        assert_eq!(me.nat_type(now), NatType::Nat);
    }

    #[test]
    fn unknown_after_nat_type_time() {
        let now = Instant::now();
        let me = local(vec![udp("192.168.1.2:4000")], now);

        assert_eq!(
            me.nat_type(now + Duration::from_secs(1801)),
            NatType::Unknown
        );
    }

    #[test]
    fn synthesizes_public_tcp_endpoint() {
        let now = Instant::now();
        let mut me = local(vec![udp("192.168.1.2:4000"), tcp("192.168.1.2:4000")], now);

        let synthesized = me.union_eplist(udp("8.8.4.4:4000"), Some(udp("192.168.1.2:4000")), now);

        assert_eq!(synthesized, vec![tcp("8.8.4.4:4000")]);
        assert!(me.eplist().contains(&tcp("8.8.4.4:4000")));

        // Port not preserved, nothing to synthesize.
        let synthesized = me.union_eplist(udp("8.8.4.4:5000"), Some(udp("192.168.1.2:4000")), now);
        assert!(synthesized.is_empty());
    }
}
