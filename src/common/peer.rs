//! Struct and implementation of a remote Peer entry in the routing table.
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use crate::common::{Endpoint, Hash, ServiceDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
/// NAT classification, as reported in the `src.natType` header byte.
pub enum NatType {
    #[default]
    Unknown = 0,
    Internet = 1,
    Nat = 2,
    RestrictedNat = 3,
    SymmetricNat = 4,
}

impl NatType {
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => NatType::Internet,
            2 => NatType::Nat,
            3 => NatType::RestrictedNat,
            4 => NatType::SymmetricNat,
            _ => NatType::Unknown,
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// Classes that need frequent pings to keep their NAT holes open.
    pub fn needs_hole_maintenance(&self) -> bool {
        matches!(
            self,
            NatType::RestrictedNat | NatType::SymmetricNat | NatType::Unknown
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
/// Transferable description of a peer.
pub struct PeerInfo {
    pub peerid: String,
    pub eplist: Vec<Endpoint>,
    pub services: ServiceDescriptor,
    pub additional_info: BTreeMap<String, String>,
}

impl PeerInfo {
    pub fn new(peerid: impl Into<String>) -> Self {
        Self {
            peerid: peerid.into(),
            ..Default::default()
        }
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.eplist.push(endpoint);
        self
    }
}

#[derive(Debug, Clone)]
/// Peer entry in the routing table.
pub struct Peer {
    peerid: String,
    hash: Hash,
    eplist: BTreeSet<Endpoint>,
    address: Option<Endpoint>,
    nat_type: NatType,
    online_since: Instant,
    last_send: Option<Instant>,
    last_recv: Option<Instant>,
    additional_info: BTreeMap<String, String>,
    services: ServiceDescriptor,
    /// Whether our initial batch of referrals was already sent to this peer.
    pub(crate) referral_sent: bool,
}

impl Peer {
    pub fn new(peerid: impl Into<String>) -> Peer {
        let peerid = peerid.into();

        Peer {
            hash: Hash::of(&peerid),
            peerid,
            eplist: BTreeSet::new(),
            address: None,
            nat_type: NatType::Unknown,
            online_since: Instant::now(),
            last_send: None,
            last_recv: None,
            additional_info: BTreeMap::new(),
            services: ServiceDescriptor::new(),
            referral_sent: false,
        }
    }

    pub fn from_info(info: &PeerInfo) -> Peer {
        let mut peer = Peer::new(info.peerid.clone());
        peer.replace_info(info);
        peer
    }

    #[cfg(test)]
    pub fn random() -> Peer {
        let mut peer = Peer::new(format!("peer-{:08x}", rand::random::<u64>()));
        peer.eplist.insert(Endpoint::udp(std::net::SocketAddr::from((
            rand::random::<[u8; 4]>(),
            rand::random::<u16>().max(1),
        ))));
        peer
    }

    // === Getters ===

    pub fn peerid(&self) -> &str {
        &self.peerid
    }

    pub fn hash(&self) -> Hash {
        self.hash
    }

    pub fn eplist(&self) -> impl Iterator<Item = &Endpoint> {
        self.eplist.iter()
    }

    pub fn address(&self) -> Option<Endpoint> {
        self.address
    }

    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }

    pub fn services(&self) -> &ServiceDescriptor {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceDescriptor {
        &mut self.services
    }

    pub fn additional_info(&self) -> &BTreeMap<String, String> {
        &self.additional_info
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.last_send
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.last_recv
    }

    /// Time since this peer came online, as far as we know.
    pub fn online_duration(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.online_since)
    }

    pub fn info(&self) -> PeerInfo {
        PeerInfo {
            peerid: self.peerid.clone(),
            eplist: self.eplist.iter().copied().collect(),
            services: self.services.clone(),
            additional_info: self.additional_info.clone(),
        }
    }

    /// True if there is at least one endpoint to send to.
    pub fn is_reachable(&self) -> bool {
        !self.eplist.is_empty() || self.address.is_some()
    }

    /// Endpoints to hand to the transport: the eplist, or the last address if the
    /// list is empty, plus the live TCP address.
    pub fn candidate_endpoints(&self) -> Vec<Endpoint> {
        let mut candidates: Vec<Endpoint> = self.eplist.iter().copied().collect();

        match self.address {
            Some(address) if candidates.is_empty() => candidates.push(address),
            Some(address) if !address.is_udp() && !candidates.contains(&address) => {
                candidates.push(address)
            }
            _ => {}
        }

        candidates
    }

    // === Liveness ===

    /// Received something within `limit`.
    pub fn is_online(&self, now: Instant, limit: Duration) -> bool {
        self.last_recv
            .is_some_and(|recv| now.saturating_duration_since(recv) < limit)
    }

    /// Last send happened more than `limit` after the last receive.
    pub fn is_timeout(&self, limit: Duration) -> bool {
        match (self.last_send, self.last_recv) {
            (Some(send), Some(recv)) => send.saturating_duration_since(recv) > limit,
            _ => false,
        }
    }

    pub fn mark_sent(&mut self, now: Instant) {
        if self.last_recv.is_none() {
            // No round trip yet, don't look timed out right away.
            self.last_recv = Some(now);
        }
        self.last_send = Some(now);
    }

    pub fn mark_received(&mut self, now: Instant) {
        self.last_recv = Some(now);
    }

    // === Updates ===

    /// Set the current communication address.
    ///
    /// UDP addresses are announceable and join the eplist, TCP source ports are
    /// ephemeral and only replace a missing address or one of an offline peer.
    pub fn set_address(&mut self, address: Endpoint, now: Instant, online_limit: Duration) {
        if address.is_udp() {
            if address.is_zero() {
                return;
            }
            self.eplist.insert(address);
            self.address = Some(address);
        } else if self.address.is_none() || !self.is_online(now, online_limit) {
            self.address = Some(address);
        }
    }

    /// Merge endpoints learned from a relayed, partially trusted source.
    pub fn union_eplist<'a>(&mut self, eplist: impl IntoIterator<Item = &'a Endpoint>) {
        for endpoint in eplist {
            if endpoint.is_udp() && endpoint.is_zero() {
                continue;
            }
            self.eplist.insert(*endpoint);
        }
    }

    /// Replace everything the peer announces about itself, from a verified source.
    pub fn replace_info(&mut self, info: &PeerInfo) {
        self.eplist = info
            .eplist
            .iter()
            .filter(|ep| !(ep.is_udp() && ep.is_zero()))
            .copied()
            .collect();
        self.services = info.services.clone();
        self.additional_info = info.additional_info.clone();
    }

    /// Update what the peer reports in the package header.
    pub fn set_reported_state(&mut self, nat_type: NatType, online_duration: Duration, now: Instant) {
        self.nat_type = nat_type;
        self.online_since = now.checked_sub(online_duration).unwrap_or(now);
    }

    /// Fold state from a newer sighting of the same peer.
    pub(crate) fn merge_liveness(&mut self, other: &Peer) {
        self.last_send = self.last_send.max(other.last_send);
        self.last_recv = self.last_recv.max(other.last_recv);
        if other.address.is_some() {
            self.address = other.address;
        }
    }
}
