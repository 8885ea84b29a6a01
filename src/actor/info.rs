use crate::common::{Endpoint, Hash, NatType};

use super::Actor;

/// Information and statistics about this node.
#[derive(Debug, Clone)]
pub struct Info {
    peerid: String,
    hash: Hash,
    nat_type: NatType,
    listen_endpoints: Vec<Endpoint>,
    eplist: Vec<Endpoint>,
    peer_count: usize,
    task_count: usize,
    value_count: usize,
}

impl Info {
    /// This node's peerid.
    pub fn peerid(&self) -> &str {
        &self.peerid
    }
    /// Position of this node in the key space.
    pub fn hash(&self) -> Hash {
        self.hash
    }
    /// NAT classification inferred from what other peers report back.
    pub fn nat_type(&self) -> NatType {
        self.nat_type
    }
    /// Endpoints the transport listens on.
    pub fn listen_endpoints(&self) -> &[Endpoint] {
        &self.listen_endpoints
    }
    /// Endpoints announced to other peers, learned ones included.
    pub fn eplist(&self) -> &[Endpoint] {
        &self.eplist
    }
    /// Peers in the routing table.
    pub fn peer_count(&self) -> usize {
        self.peer_count
    }
    pub fn task_count(&self) -> usize {
        self.task_count
    }
    /// Values stored for other peers.
    pub fn value_count(&self) -> usize {
        self.value_count
    }
}

impl From<&Actor> for Info {
    fn from(actor: &Actor) -> Self {
        let now = std::time::Instant::now();

        Self {
            peerid: actor.net.local.peerid().to_string(),
            hash: actor.net.local.hash(),
            nat_type: actor.net.local.nat_type(now),
            listen_endpoints: actor.net.sender.listen_endpoints(),
            eplist: actor.net.local.eplist(),
            peer_count: actor.net.bucket.peer_count(),
            task_count: actor.tasks.len(),
            value_count: actor.values.value_count(),
        }
    }
}
