//! Routing table upkeep: expanding lookups and rank based keepalive pings.

use std::time::{Duration, Instant};

use crate::common::{Bucket, LocalPeer, NatType, Peer};

use super::config::Config;

#[derive(Debug, Default, PartialEq, Eq)]
/// What a maintenance pass decided.
pub(crate) struct Maintenance {
    /// Run a lookup for a random peerid.
    pub expand: bool,
    pub ping: Vec<String>,
    /// Silent for too long, to be removed from the bucket.
    pub drop: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct RouteTable {
    next_expand: Instant,
    expand_interval: Duration,
    peers_at_last_expand: usize,
}

impl RouteTable {
    /// The first expand fires right away.
    pub fn new(config: &Config, now: Instant) -> Self {
        Self {
            next_expand: now,
            expand_interval: config.expand_min,
            peers_at_last_expand: 0,
        }
    }

    pub fn next_expand(&self) -> Instant {
        self.next_expand
    }

    pub fn maintain_at(
        &mut self,
        bucket: &Bucket,
        local: &LocalPeer,
        config: &Config,
        now: Instant,
    ) -> Maintenance {
        let (ping, drop) = keepalive_at(bucket, local, config, now);

        Maintenance {
            expand: self.should_expand_at(bucket.peer_count(), config, now),
            ping,
            drop,
        }
    }

    /// Short intervals while the table is small or growing fast, doubling up
    /// to the max once it stabilizes.
    fn should_expand_at(&mut self, peer_count: usize, config: &Config, now: Instant) -> bool {
        if self.next_expand > now + config.expand_max {
            self.next_expand = now;
        }
        if now < self.next_expand {
            return false;
        }

        let grew = peer_count >= self.peers_at_last_expand + config.bucket_size;
        self.expand_interval = if peer_count < config.bucket_size || grew {
            config.expand_min
        } else {
            self.expand_interval.saturating_mul(2).min(config.expand_max)
        };

        self.peers_at_last_expand = peer_count;
        self.next_expand = now + self.expand_interval;

        true
    }
}

/// Walk bucket items from the closest (rank 0) outward, returning the peers to
/// ping and the peers to drop.
fn keepalive_at(
    bucket: &Bucket,
    local: &LocalPeer,
    config: &Config,
    now: Instant,
) -> (Vec<String>, Vec<String>) {
    let mut ping = Vec::new();
    let mut drop = Vec::new();

    let nat_type = local.nat_type(now);
    let quiet_public = local
        .last_recv_from_public()
        .map_or(true, |recv| elapsed(now, Some(recv)) >= config.ping_min * 2);
    let always_min = nat_type.needs_hole_maintenance() || (nat_type == NatType::Nat && quiet_public);

    let online_limit = bucket.settings().online_limit;

    for (rank, item) in bucket.items().iter().rev().enumerate() {
        let base = if always_min {
            config.ping_min
        } else {
            config
                .ping_min
                .saturating_mul(1 << rank.min(16))
                .min(config.ping_max)
        };

        let mut rank_pinged = false;

        for peer in item.peers() {
            let silent = elapsed(now, peer.last_recv());
            if peer.last_recv().is_some() && silent >= config.peer_drop_time {
                drop.push(peer.peerid().to_string());
                continue;
            }

            let interval = if is_overdue(peer, config.ping_retry_grace, now)
                || (!peer.is_online(now, online_limit) && silent < online_limit * 2)
            {
                config.ping_min
            } else {
                base
            };

            if elapsed(now, peer.last_send()) >= interval {
                ping.push(peer.peerid().to_string());
                rank_pinged = true;
            }
        }

        if rank_pinged {
            continue;
        }
        if let Some(peer) = item.most_recent() {
            if elapsed(now, peer.last_send()) >= config.ping_min
                && !drop.iter().any(|id| id == peer.peerid())
            {
                ping.push(peer.peerid().to_string());
            }
        }
    }

    (ping, drop)
}

/// We sent something the peer hasn't answered within the grace window.
fn is_overdue(peer: &Peer, grace: Duration, now: Instant) -> bool {
    match (peer.last_send(), peer.last_recv()) {
        (Some(send), Some(recv)) => send > recv && now.saturating_duration_since(send) >= grace,
        _ => false,
    }
}

fn elapsed(now: Instant, since: Option<Instant>) -> Duration {
    since.map_or(Duration::MAX, |since| now.saturating_duration_since(since))
}
