//! XOR-distance routing table with splitting and knockout.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use rand::{seq::SliceRandom, thread_rng, Rng};

use crate::common::{Closest, Endpoint, Hash, Hashed, Peer, PeerInfo};

/// K = the default maximum number of peers in one bucket item.
pub const DEFAULT_BUCKET_SIZE: usize = 8;
/// Maximum number of bucket items.
pub const DEFAULT_BUCKET_COUNT: usize = 16;

impl Hashed for Peer {
    fn hash(&self) -> Hash {
        Peer::hash(self)
    }
}

#[derive(Debug, Clone)]
pub struct BucketSettings {
    pub bucket_size: usize,
    pub bucket_count: usize,
    /// Silence after which a peer is offline, and send/receive gap after which it timed out.
    pub online_limit: Duration,
}

impl Default for BucketSettings {
    fn default() -> Self {
        Self {
            bucket_size: DEFAULT_BUCKET_SIZE,
            bucket_count: DEFAULT_BUCKET_COUNT,
            online_limit: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveFlags {
    /// We just sent to this peer.
    pub sent: bool,
    /// We just received from this peer.
    pub received: bool,
    /// The information comes from the peer itself, not relayed by someone else.
    pub trust: bool,
}

impl ActiveFlags {
    /// Direct, verified receipt from the peer.
    pub fn received() -> Self {
        Self {
            sent: false,
            received: true,
            trust: true,
        }
    }

    /// Learned about from a referral.
    pub fn referral() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveResult {
    Added,
    Updated,
    /// Added, evicting the listed peers.
    Replaced(Vec<String>),
    /// The peer could not be placed.
    Discarded,
    /// Self or an empty peerid.
    Ignored,
}

impl ActiveResult {
    /// The peer is now in the table.
    pub fn is_placed(&self) -> bool {
        matches!(
            self,
            ActiveResult::Added | ActiveResult::Updated | ActiveResult::Replaced(_)
        )
    }
}

#[derive(Debug, Default)]
/// Selection options for [Bucket::find_closest_peers] and [Bucket::random_peers].
pub struct PeerFilter<'a> {
    pub count: usize,
    pub max_distance: Option<u32>,
    pub exclude: Option<&'a HashSet<String>>,
    /// Only peers signed in as servers of this service path.
    pub service: Option<&'a str>,
}

impl<'a> PeerFilter<'a> {
    pub fn count(count: usize) -> Self {
        Self {
            count,
            ..Default::default()
        }
    }

    pub fn exclude(mut self, exclude: &'a HashSet<String>) -> Self {
        self.exclude = Some(exclude);
        self
    }

    pub fn service(mut self, service: Option<&'a str>) -> Self {
        self.service = service;
        self
    }

    fn accepts(&self, peer: &Peer) -> bool {
        if self
            .exclude
            .is_some_and(|exclude| exclude.contains(peer.peerid()))
        {
            return false;
        }

        match self.service {
            Some(path) => peer.services().is_server(path),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default)]
/// Peers sharing the same first differing bit with the local hash (or more, for the last item).
pub struct BucketItem {
    peers: Vec<Peer>,
}

impl BucketItem {
    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn position(&self, peerid: &str) -> Option<usize> {
        self.peers.iter().position(|p| p.peerid() == peerid)
    }

    /// Peer with the most recent receive.
    pub fn most_recent(&self) -> Option<&Peer> {
        self.peers.iter().max_by_key(|p| p.last_recv())
    }
}

#[derive(Debug)]
/// Kademlia routing table, ordered from the farthest item (0) to the closest (last).
pub struct Bucket {
    local: Hash,
    local_peerid: String,
    items: Vec<BucketItem>,
    settings: BucketSettings,
}

impl Bucket {
    pub fn new(local_peerid: &str, settings: BucketSettings) -> Self {
        Self {
            local: Hash::of(local_peerid),
            local_peerid: local_peerid.to_string(),
            items: vec![BucketItem::default()],
            settings,
        }
    }

    // === Getters ===

    pub fn local_hash(&self) -> Hash {
        self.local
    }

    pub fn settings(&self) -> &BucketSettings {
        &self.settings
    }

    pub fn items(&self) -> &[BucketItem] {
        &self.items
    }

    pub fn peer_count(&self) -> usize {
        self.items.iter().map(|item| item.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.items.iter().all(|item| item.is_empty())
    }

    pub fn peers(&self) -> impl Iterator<Item = &Peer> {
        self.items.iter().flat_map(|item| item.peers.iter())
    }

    /// Index of the item a hash belongs in, clipped to the last item.
    pub fn item_index(&self, hash: &Hash) -> usize {
        let bit = self.local.first_different_bit(hash) as usize;
        bit.min(self.items.len() - 1)
    }

    pub fn get_peer(&self, peerid: &str) -> Option<&Peer> {
        let index = self.item_index(&Hash::of(peerid));
        let item = &self.items[index];

        item.position(peerid).map(|position| &item.peers[position])
    }

    pub fn get_peer_mut(&mut self, peerid: &str) -> Option<&mut Peer> {
        let index = self.item_index(&Hash::of(peerid));
        let item = &mut self.items[index];

        item.position(peerid)
            .map(move |position| &mut item.peers[position])
    }

    pub fn contains(&self, peerid: &str) -> bool {
        self.get_peer(peerid).is_some()
    }

    pub fn is_online(&self, peerid: &str, now: Instant) -> bool {
        self.get_peer(peerid)
            .is_some_and(|peer| peer.is_online(now, self.settings.online_limit))
    }

    pub fn online_peers(&self, now: Instant) -> impl Iterator<Item = &Peer> {
        let limit = self.settings.online_limit;
        self.peers().filter(move |peer| peer.is_online(now, limit))
    }

    // === Public Methods ===

    /// Insert or refresh a peer.
    ///
    /// Trusted updates replace what the peer announces, untrusted ones only add endpoints.
    pub fn active_peer(
        &mut self,
        info: &PeerInfo,
        address: Option<Endpoint>,
        flags: ActiveFlags,
        now: Instant,
    ) -> ActiveResult {
        if info.peerid.is_empty() || info.peerid == self.local_peerid {
            return ActiveResult::Ignored;
        }

        let online_limit = self.settings.online_limit;
        let apply = |peer: &mut Peer| {
            if let Some(address) = address {
                peer.set_address(address, now, online_limit);
            }
            if flags.sent {
                peer.mark_sent(now);
            }
            if flags.received {
                peer.mark_received(now);
            }
        };

        if let Some(peer) = self.get_peer_mut(&info.peerid) {
            if flags.trust {
                peer.replace_info(info);
            } else {
                peer.union_eplist(&info.eplist);
            }
            apply(peer);

            return ActiveResult::Updated;
        }

        let mut peer = Peer::new(info.peerid.clone());
        if flags.trust {
            peer.replace_info(info);
        } else {
            peer.union_eplist(&info.eplist);
        }
        apply(&mut peer);

        let hash = peer.hash();
        let mut index = self.item_index(&hash);
        self.items[index].peers.push(peer);

        if self.items[index].len() <= self.settings.bucket_size {
            return ActiveResult::Added;
        }

        let mut evicted = Vec::new();

        while index == self.items.len() - 1
            && self.items.len() < self.settings.bucket_count
            && self.items[index].len() > self.settings.bucket_size
        {
            evicted.extend(self.split(index as u8));
            index = self.item_index(&hash);
        }

        if self.items[index].len() > self.settings.bucket_size {
            evicted.extend(self.knockout(index, true));
        }

        if evicted.iter().any(|id| id == &info.peerid) {
            ActiveResult::Discarded
        } else if evicted.is_empty() {
            ActiveResult::Added
        } else {
            ActiveResult::Replaced(evicted)
        }
    }

    /// Remove a peer from the table.
    pub fn remove_peer(&mut self, peerid: &str) -> Option<Peer> {
        let index = self.item_index(&Hash::of(peerid));
        let item = &mut self.items[index];

        item.position(peerid)
            .map(|position| item.peers.remove(position))
    }

    /// Whether adding this peer would grow the table instead of evicting someone.
    pub fn is_expandable(&self, peerid: &str) -> bool {
        if peerid == self.local_peerid || self.contains(peerid) {
            return false;
        }

        let index = self.item_index(&Hash::of(peerid));
        let is_last = index == self.items.len() - 1;

        (is_last && self.items.len() < self.settings.bucket_count)
            || self.items[index].len() < self.settings.bucket_size
    }

    /// Closest peers to the target, ascending by distance.
    ///
    /// Starts from the target's own item, then the items closer to us (they all
    /// differ from the target at the same bit), then farther and farther items.
    pub fn find_closest_peers(&self, target: &Hash, filter: &PeerFilter) -> Vec<&Peer> {
        if filter.count == 0 {
            return Vec::new();
        }

        let mut closest =
            Closest::new(*target, filter.count).with_max_distance(filter.max_distance);
        let own = self.item_index(target);

        for item in &self.items[own..] {
            add_item(&mut closest, item, filter);
        }

        for item in self.items[..own].iter().rev() {
            if closest.is_full() {
                break;
            }
            add_item(&mut closest, item, filter);
        }

        closest.into_iter().collect()
    }

    /// Random sample spread across distance classes.
    ///
    /// Takes one peer per item per pass. If the last pass overshoots, a random
    /// contiguous window of the result is kept, which is biased and not a
    /// uniform sample.
    pub fn random_peers(&self, filter: &PeerFilter) -> Vec<&Peer> {
        let mut rng = thread_rng();

        let mut columns: Vec<Vec<&Peer>> = self
            .items
            .iter()
            .map(|item| {
                let mut peers: Vec<&Peer> =
                    item.peers.iter().filter(|p| filter.accepts(p)).collect();
                peers.shuffle(&mut rng);
                peers
            })
            .filter(|peers| !peers.is_empty())
            .collect();

        let mut selected = Vec::new();
        let mut pass = 0;
        while selected.len() < filter.count && !columns.is_empty() {
            for column in &columns {
                if let Some(peer) = column.get(pass) {
                    selected.push(*peer);
                }
            }
            pass += 1;
            columns.retain(|column| column.len() > pass);
        }

        if selected.len() > filter.count {
            let start = rng.gen_range(0..=selected.len() - filter.count);
            selected = selected[start..start + filter.count].to_vec();
        }

        selected
    }

    // === Private Methods ===

    /// Split the last item by the bit at `bit_pos`: peers still matching the local
    /// hash at that bit move to a new last item.
    fn split(&mut self, bit_pos: u8) -> Vec<String> {
        let index = bit_pos as usize;
        debug_assert_eq!(index, self.items.len() - 1, "only the last item splits");

        let mut evicted = self.knockout(index, false);

        let local_bit = self.local.bit(bit_pos);
        let (closer, stay): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut self.items[index].peers)
            .into_iter()
            .partition(|peer| peer.hash().bit(bit_pos) == local_bit);

        self.items[index].peers = stay;
        self.items.push(BucketItem { peers: closer });

        tracing::trace!(
            context = "bucket",
            items = self.items.len(),
            "Split the closest bucket item"
        );

        // The new last item may split again, only the settled side is forced down.
        evicted.extend(self.knockout(index, true));

        evicted
    }

    /// Evict timed out peers while over the limit, then, if forced, the least
    /// recently heard from.
    fn knockout(&mut self, index: usize, force: bool) -> Vec<String> {
        let limit = self.settings.bucket_size;
        let online_limit = self.settings.online_limit;
        let item = &mut self.items[index];
        let mut evicted = Vec::new();

        while item.len() > limit {
            match item.peers.iter().position(|p| p.is_timeout(online_limit)) {
                Some(position) => evicted.push(item.peers.remove(position).peerid().to_string()),
                None => break,
            }
        }

        if force {
            while item.len() > limit {
                let Some(position) = item
                    .peers
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, p)| p.last_recv())
                    .map(|(position, _)| position)
                else {
                    break;
                };
                evicted.push(item.peers.remove(position).peerid().to_string());
            }
        }

        evicted
    }
}

fn add_item<'a>(closest: &mut Closest<&'a Peer>, item: &'a BucketItem, filter: &PeerFilter) {
    for peer in item.peers.iter().filter(|p| filter.accepts(p)) {
        closest.add(peer);
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;
    use std::net::SocketAddr;

    use super::*;

    fn info(peerid: &str) -> PeerInfo {
        PeerInfo::new(peerid).with_endpoint(Endpoint::udp(SocketAddr::from((
            [10, 0, 0, 1],
            4000,
        ))))
    }

    fn bucket() -> Bucket {
        Bucket::new("local", BucketSettings::default())
    }

    #[test]
    fn table_is_empty() {
        let mut table = bucket();
        assert!(table.is_empty());

        table.active_peer(&info("a"), None, ActiveFlags::received(), Instant::now());
        assert!(!table.is_empty());
    }

    #[test]
    fn should_not_add_self() {
        let mut table = bucket();

        assert_eq!(
            table.active_peer(&info("local"), None, ActiveFlags::received(), Instant::now()),
            ActiveResult::Ignored
        );
        assert!(table.is_empty());
    }

    #[test]
    fn buckets_are_sets() {
        let mut table = bucket();
        let now = Instant::now();

        assert_eq!(
            table.active_peer(&info("a"), None, ActiveFlags::received(), now),
            ActiveResult::Added
        );
        assert_eq!(
            table.active_peer(&info("a"), None, ActiveFlags::received(), now),
            ActiveResult::Updated
        );
        assert_eq!(table.peer_count(), 1);
    }

    #[test]
    fn remove() {
        let mut table = bucket();
        table.active_peer(&info("a"), None, ActiveFlags::received(), Instant::now());

        assert!(table.contains("a"));
        assert!(table.remove_peer("a").is_some());
        assert!(!table.contains("a"));
    }

    #[test]
    fn untrusted_update_only_adds_endpoints() {
        let mut table = bucket();
        let now = Instant::now();

        let mut trusted = info("a");
        trusted
            .additional_info
            .insert("k".to_string(), "v".to_string());
        table.active_peer(&trusted, None, ActiveFlags::received(), now);

        let relayed = PeerInfo::new("a").with_endpoint(Endpoint::udp(SocketAddr::from((
            [10, 0, 0, 2],
            4000,
        ))));
        table.active_peer(&relayed, None, ActiveFlags::referral(), now);

        let peer = table.get_peer("a").unwrap();
        assert_eq!(peer.eplist().count(), 2);
        assert_eq!(peer.additional_info().get("k").map(String::as_str), Some("v"));

        // A trusted update replaces wholesale.
        table.active_peer(&PeerInfo::new("a"), None, ActiveFlags::received(), now);
        let peer = table.get_peer("a").unwrap();
        assert_eq!(peer.eplist().count(), 0);
        assert!(peer.additional_info().is_empty());
    }

    #[test]
    fn never_more_than_bucket_size_live_peers() {
        let mut table = bucket();
        let now = Instant::now();
        let settings = table.settings().clone();

        for i in 0..1000 {
            table.active_peer(&info(&format!("peer-{i}")), None, ActiveFlags::received(), now);

            for item in table.items() {
                assert!(item.len() <= settings.bucket_size);
            }
        }

        assert!(table.items().len() > 1);
        assert!(table.items().len() <= settings.bucket_count);

        // Every peer sits in the item its hash maps to.
        for (index, item) in table.items().iter().enumerate() {
            for peer in item.peers() {
                assert_eq!(table.item_index(&peer.hash()), index);
            }
        }
    }

    #[test]
    fn full_item_discards_uncontacted_referral() {
        let settings = BucketSettings {
            bucket_size: 2,
            bucket_count: 1,
            ..Default::default()
        };
        let mut table = Bucket::new("local", settings);
        let now = Instant::now();

        table.active_peer(&info("a"), None, ActiveFlags::received(), now);
        table.active_peer(&info("b"), None, ActiveFlags::received(), now);

        assert_eq!(
            table.active_peer(&info("c"), None, ActiveFlags::referral(), now),
            ActiveResult::Discarded
        );
        assert!(!table.contains("c"));
        assert!(!table.is_expandable("c"));

        // A peer we just heard from replaces the least recently heard one.
        let later = now + Duration::from_secs(1);
        let result = table.active_peer(&info("d"), None, ActiveFlags::received(), later);
        assert!(matches!(result, ActiveResult::Replaced(ref evicted) if evicted.len() == 1));
        assert!(table.contains("d"));
        assert_eq!(table.peer_count(), 2);
    }

    #[test]
    fn timed_out_peers_go_first() {
        let settings = BucketSettings {
            bucket_size: 2,
            bucket_count: 1,
            online_limit: Duration::from_secs(60),
        };
        let mut table = Bucket::new("local", settings);
        let now = Instant::now();

        table.active_peer(&info("a"), None, ActiveFlags::received(), now);
        table.active_peer(&info("b"), None, ActiveFlags::received(), now);

        // "b" stopped answering.
        let later = now + Duration::from_secs(120);
        table.active_peer(
            &info("b"),
            None,
            ActiveFlags {
                sent: true,
                ..Default::default()
            },
            later,
        );
        // "a" is older, but alive.
        let result = table.active_peer(&info("c"), None, ActiveFlags::received(), later);

        assert_eq!(result, ActiveResult::Replaced(vec!["b".to_string()]));
        assert!(table.contains("a"));
    }

    #[test]
    fn closest() {
        let mut table = bucket();
        let now = Instant::now();

        for i in 0..500 {
            table.active_peer(&info(&format!("peer-{i}")), None, ActiveFlags::received(), now);
        }

        let all: Vec<&Peer> = table.peers().collect();

        for _ in 0..20 {
            let target = Hash::random();
            let exclude: HashSet<String> = all
                .iter()
                .take(5)
                .map(|p| p.peerid().to_string())
                .collect();

            let closest = table.find_closest_peers(&target, &PeerFilter::count(10).exclude(&exclude));

            assert!(closest.len() <= 10);
            assert!(closest.iter().all(|p| !exclude.contains(p.peerid())));

            let distances: Vec<u32> = closest.iter().map(|p| p.hash().distance(&target)).collect();
            let mut sorted = distances.clone();
            sorted.sort();
            assert_eq!(distances, sorted);

            let unique: HashSet<&str> = closest.iter().map(|p| p.peerid()).collect();
            assert_eq!(unique.len(), closest.len());

            // Exact against a brute force scan.
            let mut expected: Vec<u32> = all
                .iter()
                .filter(|p| !exclude.contains(p.peerid()))
                .map(|p| p.hash().distance(&target))
                .collect();
            expected.sort();
            expected.truncate(10);
            assert_eq!(distances, expected);
        }
    }

    #[test]
    fn random_peers() {
        let mut table = bucket();
        let now = Instant::now();

        for i in 0..100 {
            table.active_peer(&info(&format!("peer-{i}")), None, ActiveFlags::received(), now);
        }

        let exclude: HashSet<String> = ["peer-1".to_string()].into();
        let sample = table.random_peers(&PeerFilter::count(7).exclude(&exclude));

        assert_eq!(sample.len(), 7);
        assert!(sample.iter().all(|p| p.peerid() != "peer-1"));

        let unique: HashSet<&str> = sample.iter().map(|p| p.peerid()).collect();
        assert_eq!(unique.len(), 7);

        let everyone = table.random_peers(&PeerFilter::count(1000));
        assert_eq!(everyone.len(), table.peer_count());
    }

    #[test]
    fn service_filter() {
        let mut table = bucket();
        let now = Instant::now();

        let mut server = info("server");
        server
            .services
            .signin("chat", crate::common::ServiceRole::Server);
        let mut visitor = info("visitor");
        visitor
            .services
            .signin("chat", crate::common::ServiceRole::Visitor);

        table.active_peer(&server, None, ActiveFlags::received(), now);
        table.active_peer(&visitor, None, ActiveFlags::received(), now);
        table.active_peer(&info("other"), None, ActiveFlags::received(), now);

        let found = table.find_closest_peers(&Hash::random(), &PeerFilter::count(10).service(Some("chat")));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].peerid(), "server");
    }

    #[test]
    fn expandable() {
        let mut table = bucket();
        assert!(table.is_expandable("a"));
        assert!(!table.is_expandable("local"));

        table.active_peer(&info("a"), None, ActiveFlags::received(), Instant::now());
        assert!(!table.is_expandable("a"));
    }
}
