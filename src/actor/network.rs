//! State every task touches: our own peer, the routing table and the send pipeline.

use std::collections::HashSet;
use std::time::Instant;

use serde_bytes::ByteBuf;
use tracing::{debug, trace};

use crate::common::{Bucket, Hash, LocalPeer, Peer, PeerFilter, PeerInfo};
use crate::protocol::piece::split;
use crate::protocol::{Body, PieceBody};

use super::config::Config;
use super::sender::{Outgoing, PackageSender, SendError, SendOutcome, Target};
use super::tasks::piece::PieceSendTask;
use super::tasks::Task;

#[derive(Debug)]
pub(crate) struct Network {
    pub local: LocalPeer,
    pub bucket: Bucket,
    pub sender: PackageSender,
    pub config: Config,
    next_task_id: u32,
    /// Tasks created while another task was running, started by the task manager.
    spawned: Vec<Task>,
}

impl Network {
    pub fn new(local: LocalPeer, sender: PackageSender, config: Config) -> Self {
        Self {
            bucket: Bucket::new(local.peerid(), config.bucket_settings()),
            local,
            sender,
            config,
            next_task_id: 1,
            spawned: Vec::new(),
        }
    }

    // === Getters ===

    /// Target for a peer in the routing table.
    pub fn target(&self, peerid: &str) -> Option<Target> {
        self.bucket.get_peer(peerid).map(Target::from_peer)
    }

    /// Closest known peers to `target` as referrals.
    pub fn closest_infos(
        &self,
        target: &Hash,
        exclude: &HashSet<String>,
        service: Option<&str>,
    ) -> Vec<PeerInfo> {
        self.bucket
            .find_closest_peers(
                target,
                &PeerFilter::count(self.config.bucket_size)
                    .exclude(exclude)
                    .service(service),
            )
            .into_iter()
            .filter_map(referral)
            .collect()
    }

    /// A random sample of known peers as referrals.
    pub fn random_infos(
        &self,
        count: usize,
        exclude: &HashSet<String>,
        service: Option<&str>,
    ) -> Vec<PeerInfo> {
        self.bucket
            .random_peers(&PeerFilter::count(count).exclude(exclude).service(service))
            .into_iter()
            .filter_map(referral)
            .collect()
    }

    // === Public Methods ===

    pub fn next_task_id(&mut self) -> u32 {
        let id = self.next_task_id;
        self.next_task_id = self.next_task_id.wrapping_add(1).max(1);
        id
    }

    /// Send a request, returns its seq.
    pub fn request(
        &mut self,
        target: &Target,
        body: Body,
        ttl: u8,
        now: Instant,
    ) -> Result<u32, SendError> {
        self.send(target, Outgoing::request(body, ttl), now)
    }

    /// Answer a request, errors are only logged since nobody waits on a response.
    pub fn respond(
        &mut self,
        target: &Target,
        body: Body,
        ack_seq: u32,
        referrals: Option<Vec<PeerInfo>>,
        now: Instant,
    ) {
        let mut outgoing = Outgoing::response(body, ack_seq);
        outgoing.referrals = referrals;

        if let Err(error) = self.send(target, outgoing, now) {
            debug!(context = "network", ?error, to = %target.peerid, "Failed to respond");
        }
    }

    pub fn send(
        &mut self,
        target: &Target,
        outgoing: Outgoing,
        now: Instant,
    ) -> Result<u32, SendError> {
        match self
            .sender
            .send(&self.local, &mut self.bucket, target, outgoing, now)?
        {
            SendOutcome::Sent { seq, .. } | SendOutcome::Loopback { seq } => Ok(seq),
            SendOutcome::Oversized {
                seq,
                endpoint,
                bytes,
            } => {
                let taskid = self.next_task_id();
                let budget = self.sender.piece_budget(&self.local, &target.peerid, now);
                let sender = self.local.peerid().to_string();

                let chunks = split(&bytes, budget);
                let max = chunks.len().saturating_sub(1) as u32;
                let pieces = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(no, buf)| PieceBody {
                        taskid,
                        sender: sender.clone(),
                        max,
                        no: no as u32,
                        buf: ByteBuf::from(buf),
                    })
                    .collect::<Vec<_>>();

                trace!(
                    context = "network",
                    taskid,
                    size = bytes.len(),
                    budget,
                    pieces = pieces.len(),
                    to = %target.peerid,
                    "Fragmenting oversized package"
                );

                self.spawn(Task::PieceSend(PieceSendTask::new(
                    taskid,
                    target.clone(),
                    endpoint,
                    pieces,
                    &self.config,
                    now,
                )));

                Ok(seq)
            }
        }
    }

    pub fn spawn(&mut self, task: Task) {
        self.spawned.push(task);
    }

    pub fn take_spawned(&mut self) -> Vec<Task> {
        std::mem::take(&mut self.spawned)
    }
}

/// A peer as a referral, None without a usable endpoint since empty referrals
/// invalidate the whole package.
fn referral(peer: &Peer) -> Option<PeerInfo> {
    let eplist = peer.candidate_endpoints();
    if eplist.is_empty() {
        return None;
    }

    Some(PeerInfo {
        eplist,
        ..peer.info()
    })
}
