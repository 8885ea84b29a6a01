//! Outbound pipeline: fills headers and common sections, routes, encodes,
//! sends and registers resends.

use std::collections::VecDeque;
use std::time::Instant;

use rand::{thread_rng, Rng};
use tracing::{debug, trace};

use crate::common::{Bucket, Endpoint, Hash, LocalPeer, Peer, PeerFilter, PeerInfo};
use crate::protocol::piece::PieceBudgetCache;
use crate::protocol::{Body, Command, Common, EncodeError, Header, Package, PieceBody};

use super::config::Config;
use super::resend::{ResendRegistry, ResendSettings};
use super::transport::Transport;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Where a package goes: a peerid and the endpoints to try.
pub struct Target {
    pub peerid: String,
    pub hash: Hash,
    pub candidates: Vec<Endpoint>,
}

impl Target {
    pub fn from_peer(peer: &Peer) -> Self {
        Self {
            peerid: peer.peerid().to_string(),
            hash: peer.hash(),
            candidates: peer.candidate_endpoints(),
        }
    }

    pub fn from_info(info: &PeerInfo, address: Option<Endpoint>) -> Self {
        let mut candidates = Vec::with_capacity(info.eplist.len() + 1);
        if let Some(address) = address {
            candidates.push(address);
        }
        candidates.extend(info.eplist.iter().filter(|ep| Some(**ep) != address));

        Self {
            peerid: info.peerid.clone(),
            hash: Hash::of(&info.peerid),
            candidates,
        }
    }

    /// Same peer, one endpoint only.
    pub fn via(&self, endpoint: Endpoint) -> Self {
        Self {
            peerid: self.peerid.clone(),
            hash: self.hash,
            candidates: vec![endpoint],
        }
    }
}

#[derive(Debug, Clone)]
/// A package to send, before the pipeline fills in the rest.
pub struct Outgoing {
    pub body: Body,
    /// Seq of the request being answered, requests use 0.
    pub ack_seq: u32,
    pub ttl: u8,
    /// Lookup responses carry their own referrals, everything else carries a
    /// batch of our closest peers once per newly seen peer.
    pub referrals: Option<Vec<PeerInfo>>,
    pub ignore_route_cache: bool,
}

impl Outgoing {
    pub fn request(body: Body, ttl: u8) -> Self {
        Self {
            body,
            ack_seq: 0,
            ttl,
            referrals: None,
            ignore_route_cache: false,
        }
    }

    pub fn response(body: Body, ack_seq: u32) -> Self {
        Self {
            body,
            ack_seq,
            ttl: 0,
            referrals: None,
            ignore_route_cache: true,
        }
    }

    pub fn with_referrals(mut self, referrals: Vec<PeerInfo>) -> Self {
        self.referrals = Some(referrals);
        self
    }

    pub fn is_response(&self) -> bool {
        self.ack_seq != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Sent { seq: u32, endpoint: Endpoint },
    /// Addressed to ourselves, processed on the next tick.
    Loopback { seq: u32 },
    /// Too large for a datagram, these bytes need fragmenting toward `endpoint`.
    Oversized {
        seq: u32,
        endpoint: Endpoint,
        bytes: Vec<u8>,
    },
}

#[derive(thiserror::Error, Debug)]
pub enum SendError {
    #[error("No usable endpoint for {0}")]
    NoRoute(String),

    #[error("Failed to encode package: {0}")]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    IO(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct PackageSender {
    transport: Box<dyn Transport>,
    appid: u32,
    package_limit: usize,
    bucket_size: usize,
    next_seq: u32,
    resends: ResendRegistry,
    budgets: PieceBudgetCache,
    loopback: VecDeque<Vec<u8>>,
}

impl PackageSender {
    pub fn new(transport: Box<dyn Transport>, config: &Config) -> Self {
        Self {
            transport,
            appid: config.appid,
            package_limit: config.package_limit,
            bucket_size: config.bucket_size,
            next_seq: 1,
            resends: ResendRegistry::new(ResendSettings {
                interval: config.resend_interval,
                limit: config.resend_limit,
                high_water: config.resend_registry_high_water,
                idle_timeout: config.resend_idle_timeout,
            }),
            budgets: PieceBudgetCache::new(config.piece_budget_ttl),
            loopback: VecDeque::new(),
        }
    }

    // === Getters ===

    pub fn appid(&self) -> u32 {
        self.appid
    }

    pub fn listen_endpoints(&self) -> Vec<Endpoint> {
        self.transport.listen_endpoints()
    }

    pub fn resends(&self) -> &ResendRegistry {
        &self.resends
    }

    // === Public Methods ===

    /// Fill, route, encode and send a package.
    pub fn send(
        &mut self,
        local: &LocalPeer,
        bucket: &mut Bucket,
        target: &Target,
        outgoing: Outgoing,
        now: Instant,
    ) -> Result<SendOutcome, SendError> {
        let seq = self.seq();
        let is_loopback = target.peerid == local.peerid();

        let referrals = match outgoing.referrals {
            Some(referrals) => referrals,
            None if !is_loopback => self.initial_referrals(bucket, &target.peerid),
            None => Vec::new(),
        };

        let mut package = Package {
            header: Header {
                command: outgoing.body.command(),
                is_response: outgoing.ack_seq != 0,
                appid: self.appid,
                src_hash: local.hash().as_u32(),
                src_online_duration: u32::try_from(local.online_duration(now).as_secs())
                    .unwrap_or(u32::MAX),
                src_nat_type: local.nat_type(now),
                dest_hash: target.hash.as_u32(),
                seq,
                ack_seq: outgoing.ack_seq,
                ttl: outgoing.ttl,
            },
            body: outgoing.body,
            common: Some(Common {
                src: local.info(),
                dest_peerid: target.peerid.clone(),
                dest_ep: None,
                nodes: referrals,
            }),
        };

        if is_loopback {
            self.loopback.push_back(package.to_bytes()?);
            return Ok(SendOutcome::Loopback { seq });
        }

        let endpoint = self
            .transport
            .route(&target.candidates, outgoing.ignore_route_cache)
            .ok_or_else(|| SendError::NoRoute(target.peerid.clone()))?;

        if let Some(common) = package.common.as_mut() {
            common.dest_ep = Some(endpoint);
        }

        let bytes = package.to_bytes_within(self.package_limit)?;

        if bytes.len() > self.package_limit && !endpoint.protocol.is_stream() {
            return Ok(SendOutcome::Oversized {
                seq,
                endpoint,
                bytes,
            });
        }

        self.transport.send_to(&endpoint, &bytes)?;
        trace!(
            context = "sender",
            command = ?package.header.command,
            is_response = package.header.is_response,
            seq,
            to = %target.peerid,
            %endpoint,
            "Sent package"
        );

        if !package.header.is_response {
            self.resends.insert(&target.peerid, seq, endpoint, bytes, now);
        }
        if let Some(peer) = bucket.get_peer_mut(&target.peerid) {
            peer.mark_sent(now);
        }

        Ok(SendOutcome::Sent { seq, endpoint })
    }

    /// Send one fragment of a fragmented package, returns its seq.
    pub fn send_piece(
        &mut self,
        local: &LocalPeer,
        target: &Target,
        endpoint: Endpoint,
        piece: PieceBody,
        now: Instant,
    ) -> Result<u32, SendError> {
        let seq = self.seq();
        let package = Package {
            header: Header {
                command: Command::PackagePiece,
                is_response: false,
                appid: self.appid,
                src_hash: local.hash().as_u32(),
                src_online_duration: u32::try_from(local.online_duration(now).as_secs())
                    .unwrap_or(u32::MAX),
                src_nat_type: local.nat_type(now),
                dest_hash: target.hash.as_u32(),
                seq,
                ack_seq: 0,
                ttl: 0,
            },
            body: Body::Piece(piece),
            common: None,
        };

        let bytes = package.to_bytes()?;
        self.transport.send_to(&endpoint, &bytes)?;
        self.resends.insert(&target.peerid, seq, endpoint, bytes, now);

        Ok(seq)
    }

    /// Acknowledge a fragment straight back to where it came from.
    pub fn ack_piece(
        &mut self,
        local: &LocalPeer,
        from: Endpoint,
        request: &Header,
        piece: &PieceBody,
        now: Instant,
    ) -> Result<(), SendError> {
        let seq = self.seq();
        let package = Package {
            header: Header {
                command: Command::PackagePiece,
                is_response: true,
                appid: self.appid,
                src_hash: local.hash().as_u32(),
                src_online_duration: u32::try_from(local.online_duration(now).as_secs())
                    .unwrap_or(u32::MAX),
                src_nat_type: local.nat_type(now),
                dest_hash: request.src_hash,
                seq,
                ack_seq: request.seq,
                ttl: 0,
            },
            body: Body::Piece(PieceBody {
                taskid: piece.taskid,
                sender: piece.sender.clone(),
                max: piece.max,
                no: piece.no,
                buf: Default::default(),
            }),
            common: None,
        };

        self.transport.send_to(&from, &package.to_bytes()?)?;
        Ok(())
    }

    /// Payload bytes a fragment toward `dest_peerid` can carry.
    pub fn piece_budget(&mut self, local: &LocalPeer, dest_peerid: &str, now: Instant) -> usize {
        self.budgets
            .budget(dest_peerid, local.peerid(), self.package_limit, now)
    }

    pub fn ack(&mut self, peerid: &str, ack_seq: u32) -> bool {
        self.resends.ack(peerid, ack_seq)
    }

    /// Stop resending one request, superseded by a newer one.
    pub fn cancel_resend(&mut self, peerid: &str, seq: u32) -> bool {
        self.resends.ack(peerid, seq)
    }

    pub fn cancel_resends(&mut self, peerid: &str) {
        self.resends.cancel_peer(peerid);
    }

    /// Resend every package whose controller is due.
    pub fn resend_due(&mut self, now: Instant) {
        for (endpoint, bytes) in self.resends.due(now) {
            if let Err(error) = self.transport.send_to(&endpoint, &bytes) {
                debug!(context = "sender", ?error, %endpoint, "Resend failed");
            }
        }
    }

    pub fn recv(&mut self) -> Option<(Vec<u8>, Endpoint)> {
        self.transport.recv_from()
    }

    pub fn pop_loopback(&mut self) -> Option<Vec<u8>> {
        self.loopback.pop_front()
    }

    // === Private Methods ===

    /// Increments the seq, skipping 0 which marks requests in `ackSeq`.
    fn seq(&mut self) -> u32 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1).max(1);
        seq
    }

    /// Our closest peers, rotated to a random start so that shrinking the list
    /// to fit keeps a random cyclic window. Sent once per peer.
    fn initial_referrals(&self, bucket: &mut Bucket, peerid: &str) -> Vec<PeerInfo> {
        match bucket.get_peer_mut(peerid) {
            Some(peer) if !peer.referral_sent => peer.referral_sent = true,
            Some(_) => return Vec::new(),
            // Unknown peers always get a batch.
            None => {}
        }

        let exclude = [peerid.to_string()].into();
        let mut referrals: Vec<PeerInfo> = bucket
            .find_closest_peers(
                &bucket.local_hash(),
                &PeerFilter::count(self.bucket_size).exclude(&exclude),
            )
            .into_iter()
            .filter(|peer| peer.is_reachable())
            .map(|peer| PeerInfo {
                peerid: peer.peerid().to_string(),
                eplist: peer.candidate_endpoints(),
                ..Default::default()
            })
            .collect();

        if !referrals.is_empty() {
            let start = thread_rng().gen_range(0..referrals.len());
            referrals.rotate_left(start);
        }

        referrals
    }
}
