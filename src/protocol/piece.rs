//! Splitting oversized packages into `PACKAGE_PIECE` fragments and putting
//! them back together.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_bytes::ByteBuf;

use crate::common::{NatType, MAX_ENDPOINT_STRING_LEN};

use super::{Body, Command, Header, Package, PieceBody, MAX_PACKAGE_SIZE};

pub const DEFAULT_PIECE_BUDGET_TTL: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_PIECE_REBUILD_IDLE: Duration = Duration::from_secs(60);

/// Smallest fragment payload, even under a tiny package limit.
pub const MIN_PIECE_BUDGET: usize = 64;
/// Fragments of a largest package cut at [MIN_PIECE_BUDGET], more is never legitimate.
pub const MAX_PIECE_COUNT: usize = MAX_PACKAGE_SIZE.div_ceil(MIN_PIECE_BUDGET);
/// Packages being rebuilt at once, across every sender.
pub const MAX_PENDING_REBUILDS: usize = 1024;

const BUDGET_CACHE_SIZE: usize = 256;
/// Room for the bencoded length prefix of the piece buffer (`"1450:"`).
const BUF_PREFIX_HEADROOM: usize = 6;

/// Split `bytes` into chunks of at most `budget` bytes.
pub fn split(bytes: &[u8], budget: usize) -> Vec<Vec<u8>> {
    bytes.chunks(budget.max(1)).map(|c| c.to_vec()).collect()
}

#[derive(Debug)]
/// Per destination payload budget of a single fragment, recomputed after `ttl`.
pub struct PieceBudgetCache {
    cache: LruCache<String, (usize, Instant)>,
    ttl: Duration,
}

impl PieceBudgetCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cache: LruCache::new(
                NonZeroUsize::new(BUDGET_CACHE_SIZE).unwrap_or(NonZeroUsize::MIN),
            ),
            ttl,
        }
    }

    /// Payload bytes a fragment to `dest_peerid` can carry within `limit`.
    pub fn budget(&mut self, dest_peerid: &str, sender_peerid: &str, limit: usize, now: Instant) -> usize {
        if let Some((budget, computed)) = self.cache.get(dest_peerid) {
            if now.saturating_duration_since(*computed) < self.ttl {
                return *budget;
            }
        }

        let budget = compute_budget(sender_peerid, limit);
        self.cache.put(dest_peerid.to_string(), (budget, now));

        budget
    }
}

/// Encode a fragment with every numeric field at its widest, then subtract
/// it from the limit along with endpoint and length prefix headroom.
fn compute_budget(sender_peerid: &str, limit: usize) -> usize {
    let dummy = Package {
        header: Header {
            command: Command::PackagePiece,
            is_response: false,
            appid: u32::MAX,
            src_hash: u32::MAX,
            src_online_duration: u32::MAX,
            src_nat_type: NatType::Unknown,
            dest_hash: u32::MAX,
            seq: u32::MAX,
            ack_seq: u32::MAX,
            ttl: u8::MAX,
        },
        body: Body::Piece(PieceBody {
            taskid: u32::MAX,
            sender: sender_peerid.to_string(),
            max: u32::MAX,
            no: u32::MAX,
            buf: ByteBuf::from(vec![0]),
        }),
        common: None,
    };

    let overhead = dummy.to_bytes().map(|b| b.len()).unwrap_or(limit);

    limit
        .saturating_sub(overhead + MAX_ENDPOINT_STRING_LEN + BUF_PREFIX_HEADROOM)
        .max(MIN_PIECE_BUDGET)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PieceOutcome {
    /// Stored, more pieces missing.
    Pending,
    /// Last missing piece, the original package bytes.
    Complete(Vec<u8>),
    /// Already had this piece, or the package was already rebuilt.
    Duplicate,
    /// Inconsistent `no`/`max`, or more pieces or bytes than any package can have.
    Rejected,
}

#[derive(Debug)]
struct RebuildTask {
    slots: Vec<Option<Vec<u8>>>,
    filled: usize,
    size: usize,
    last_active: Instant,
}

#[derive(Debug)]
/// Reassembly state, keyed by sender peerid then task id.
pub struct PiecePackageRebuilder {
    tasks: HashMap<String, HashMap<u32, RebuildTask>>,
    /// Rebuilt packages, remembered until idle so late duplicates don't rebuild twice.
    completed: HashMap<(String, u32), Instant>,
    idle: Duration,
}

impl PiecePackageRebuilder {
    pub fn new(idle: Duration) -> Self {
        Self {
            tasks: HashMap::new(),
            completed: HashMap::new(),
            idle,
        }
    }

    pub fn pending_count(&self) -> usize {
        self.tasks.values().map(|t| t.len()).sum()
    }

    pub fn push(&mut self, piece: &PieceBody, now: Instant) -> PieceOutcome {
        let count = piece.max as usize + 1;
        if piece.no > piece.max || count > MAX_PIECE_COUNT {
            return PieceOutcome::Rejected;
        }

        let key = (piece.sender.clone(), piece.taskid);
        if let Some(seen) = self.completed.get_mut(&key) {
            *seen = now;
            return PieceOutcome::Duplicate;
        }

        let is_new = self
            .tasks
            .get(&piece.sender)
            .map_or(true, |tasks| !tasks.contains_key(&piece.taskid));
        if is_new && self.pending_count() >= MAX_PENDING_REBUILDS {
            return PieceOutcome::Rejected;
        }

        let tasks = self.tasks.entry(piece.sender.clone()).or_default();
        let task = tasks.entry(piece.taskid).or_insert_with(|| RebuildTask {
            slots: vec![None; count],
            filled: 0,
            size: 0,
            last_active: now,
        });

        if task.slots.len() != count || task.size + piece.buf.len() > MAX_PACKAGE_SIZE {
            return PieceOutcome::Rejected;
        }

        task.last_active = now;
        let slot = &mut task.slots[piece.no as usize];
        if slot.is_some() {
            return PieceOutcome::Duplicate;
        }
        *slot = Some(piece.buf.to_vec());
        task.filled += 1;
        task.size += piece.buf.len();

        if task.filled < count {
            return PieceOutcome::Pending;
        }

        let Some(task) = tasks.remove(&piece.taskid) else {
            return PieceOutcome::Pending;
        };
        if tasks.is_empty() {
            self.tasks.remove(&piece.sender);
        }
        self.completed.insert(key, now);

        PieceOutcome::Complete(task.slots.into_iter().flatten().flatten().collect())
    }

    /// Purge reassembly tasks that saw no piece within the idle timeout.
    pub fn sweep(&mut self, now: Instant) {
        let idle = self.idle;

        for tasks in self.tasks.values_mut() {
            tasks.retain(|_, task| now.saturating_duration_since(task.last_active) < idle);
        }
        self.tasks.retain(|_, tasks| !tasks.is_empty());
        self.completed
            .retain(|_, seen| now.saturating_duration_since(*seen) < idle);
    }
}

#[cfg(test)]
mod test {
    use rand::seq::SliceRandom;

    use super::*;
    use crate::protocol::DEFAULT_PACKAGE_LIMIT;

    fn pieces(bytes: &[u8], budget: usize) -> Vec<PieceBody> {
        let chunks = split(bytes, budget);
        let max = chunks.len() as u32 - 1;

        chunks
            .into_iter()
            .enumerate()
            .map(|(no, buf)| PieceBody {
                taskid: 1,
                sender: "alice".to_string(),
                max,
                no: no as u32,
                buf: ByteBuf::from(buf),
            })
            .collect()
    }

    #[test]
    fn budget_fits_the_limit() {
        let mut cache = PieceBudgetCache::new(DEFAULT_PIECE_BUDGET_TTL);
        let now = Instant::now();

        let budget = cache.budget("bob", "alice", DEFAULT_PACKAGE_LIMIT, now);
        assert!(budget > 1000 && budget < DEFAULT_PACKAGE_LIMIT);

        let piece = Package {
            header: Header {
                command: Command::PackagePiece,
                is_response: false,
                appid: u32::MAX,
                src_hash: u32::MAX,
                src_online_duration: u32::MAX,
                src_nat_type: NatType::Unknown,
                dest_hash: u32::MAX,
                seq: u32::MAX,
                ack_seq: u32::MAX,
                ttl: u8::MAX,
            },
            body: Body::Piece(PieceBody {
                taskid: u32::MAX,
                sender: "alice".to_string(),
                max: u32::MAX,
                no: u32::MAX,
                buf: ByteBuf::from(vec![0xff; budget]),
            }),
            common: None,
        };
        assert!(piece.to_bytes().unwrap().len() <= DEFAULT_PACKAGE_LIMIT);

        // Cached.
        assert_eq!(cache.budget("bob", "alice", 100, now), budget);
        // Expired.
        let later = now + DEFAULT_PIECE_BUDGET_TTL;
        assert!(cache.budget("bob", "alice", 100, later) < budget);
    }

    #[test]
    fn rebuild_in_any_order_with_duplicates() {
        let original: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let budget = 1300;
        let mut pieces = pieces(&original, budget);
        assert_eq!(pieces.len(), original.len().div_ceil(budget));

        let duplicates: Vec<PieceBody> = pieces.iter().step_by(3).cloned().collect();
        pieces.extend(duplicates);
        pieces.shuffle(&mut rand::thread_rng());
        // And a late duplicate after completion.
        pieces.push(pieces[0].clone());

        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        let rebuilt: Vec<Vec<u8>> = pieces
            .iter()
            .filter_map(|piece| match rebuilder.push(piece, now) {
                PieceOutcome::Complete(bytes) => Some(bytes),
                _ => None,
            })
            .collect();

        assert_eq!(rebuilt, vec![original]);
        assert_eq!(rebuilder.pending_count(), 0);
    }

    #[test]
    fn missing_piece_never_completes() {
        let original = vec![7u8; 5000];
        let mut pieces = pieces(&original, 1000);
        pieces.remove(2);

        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        for piece in &pieces {
            assert!(!matches!(
                rebuilder.push(piece, now),
                PieceOutcome::Complete(_)
            ));
        }
        assert_eq!(rebuilder.pending_count(), 1);

        rebuilder.sweep(now + DEFAULT_PIECE_REBUILD_IDLE);
        assert_eq!(rebuilder.pending_count(), 0);
    }

    #[test]
    fn inconsistent_pieces_are_rejected() {
        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        let mut piece = PieceBody {
            taskid: 1,
            sender: "alice".to_string(),
            max: 2,
            no: 3,
            buf: ByteBuf::from(vec![1]),
        };
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);

        piece.no = 0;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Pending);

        piece.no = 1;
        piece.max = 5;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);
    }

    #[test]
    fn piece_count_is_bounded() {
        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        let mut piece = PieceBody {
            taskid: 1,
            sender: "mallory".to_string(),
            max: 20_000_000,
            no: 0,
            buf: ByteBuf::from(vec![1]),
        };
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);

        piece.max = u32::MAX;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);
        assert_eq!(rebuilder.pending_count(), 0);

        // A largest package cut at the smallest budget is still accepted.
        piece.max = MAX_PIECE_COUNT as u32 - 1;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Pending);
    }

    #[test]
    fn rebuilt_size_is_bounded() {
        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        let mut piece = PieceBody {
            taskid: 1,
            sender: "mallory".to_string(),
            max: 2,
            no: 0,
            buf: ByteBuf::from(vec![0; MAX_PACKAGE_SIZE / 2 + 1]),
        };
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Pending);

        piece.no = 1;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);
    }

    #[test]
    fn concurrent_rebuilds_are_bounded() {
        let mut rebuilder = PiecePackageRebuilder::new(DEFAULT_PIECE_REBUILD_IDLE);
        let now = Instant::now();

        let mut piece = PieceBody {
            taskid: 0,
            sender: "mallory".to_string(),
            max: 1,
            no: 0,
            buf: ByteBuf::from(vec![1]),
        };
        for taskid in 0..MAX_PENDING_REBUILDS as u32 {
            piece.taskid = taskid;
            assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Pending);
        }

        piece.taskid = MAX_PENDING_REBUILDS as u32;
        assert_eq!(rebuilder.push(&piece, now), PieceOutcome::Rejected);

        // Pieces of a package already being rebuilt still land.
        piece.taskid = 0;
        piece.no = 1;
        assert!(matches!(rebuilder.push(&piece, now), PieceOutcome::Complete(_)));
    }
}
