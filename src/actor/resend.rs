//! Per package retry state and the registry that bounds it.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::common::Endpoint;

pub const DEFAULT_RESEND_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_RESEND_LIMIT: u32 = 4;
pub const DEFAULT_RESEND_REGISTRY_HIGH_WATER: usize = 4096;
pub const DEFAULT_RESEND_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Limit every controller is forced down to when the registry stays over its high water.
const FORCED_LIMIT: u32 = 2;

#[derive(Debug, Clone)]
pub struct ResendController {
    try_times: u32,
    interval: Duration,
    limit: u32,
    last_send: Instant,
    created: Instant,
}

impl ResendController {
    /// State right after the first send.
    pub fn new(interval: Duration, limit: u32, now: Instant) -> Self {
        Self {
            try_times: 1,
            interval,
            limit,
            last_send: now,
            created: now,
        }
    }

    pub fn try_times(&self) -> u32 {
        self.try_times
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Wait before the next send, doubling from the second retry on.
    pub fn current_interval(&self) -> Duration {
        let doublings = self.try_times.saturating_sub(1).min(16);
        self.interval.saturating_mul(1 << doublings)
    }

    pub fn is_exhausted(&self) -> bool {
        self.try_times >= self.limit
    }

    pub fn need_resend(&self, now: Instant) -> bool {
        !self.is_exhausted()
            && now.saturating_duration_since(self.last_send) >= self.current_interval()
    }

    pub fn on_resend(&mut self, now: Instant) {
        self.try_times += 1;
        self.last_send = now;
    }

    /// Lower the limit, never raising it.
    pub fn tighten_limit(&mut self, limit: u32) {
        self.limit = self.limit.min(limit);
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        now.saturating_duration_since(self.created) > idle_timeout
    }
}

#[derive(Debug)]
struct PendingResend {
    controller: ResendController,
    endpoint: Endpoint,
    bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ResendSettings {
    pub interval: Duration,
    pub limit: u32,
    pub high_water: usize,
    pub idle_timeout: Duration,
}

impl Default for ResendSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_RESEND_INTERVAL,
            limit: DEFAULT_RESEND_LIMIT,
            high_water: DEFAULT_RESEND_REGISTRY_HIGH_WATER,
            idle_timeout: DEFAULT_RESEND_IDLE_TIMEOUT,
        }
    }
}

#[derive(Debug)]
/// Requests awaiting an ack, keyed by destination peerid and seq.
pub struct ResendRegistry {
    pending: HashMap<(String, u32), PendingResend>,
    settings: ResendSettings,
}

impl ResendRegistry {
    pub fn new(settings: ResendSettings) -> Self {
        Self {
            pending: HashMap::new(),
            settings,
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn contains(&self, peerid: &str, seq: u32) -> bool {
        self.pending.contains_key(&(peerid.to_string(), seq))
    }

    /// Track a request that was just sent.
    pub fn insert(&mut self, peerid: &str, seq: u32, endpoint: Endpoint, bytes: Vec<u8>, now: Instant) {
        self.pending.insert(
            (peerid.to_string(), seq),
            PendingResend {
                controller: ResendController::new(self.settings.interval, self.settings.limit, now),
                endpoint,
                bytes,
            },
        );

        if self.pending.len() > self.settings.high_water {
            self.apply_backpressure(now);
        }
    }

    /// The response to `seq` arrived.
    pub fn ack(&mut self, peerid: &str, seq: u32) -> bool {
        self.pending.remove(&(peerid.to_string(), seq)).is_some()
    }

    /// Stop resending everything destined to a peer.
    pub fn cancel_peer(&mut self, peerid: &str) {
        self.pending.retain(|(id, _), _| id != peerid);
    }

    /// Packages due for a resend, dropping exhausted controllers.
    pub fn due(&mut self, now: Instant) -> Vec<(Endpoint, Vec<u8>)> {
        let mut due = Vec::new();

        self.pending.retain(|_, pending| {
            if pending.controller.need_resend(now) {
                pending.controller.on_resend(now);
                due.push((pending.endpoint, pending.bytes.clone()));
            }

            // Keep the last attempt around for one more interval so a late ack still lands.
            !(pending.controller.is_exhausted()
                && now.saturating_duration_since(pending.controller.last_send)
                    >= pending.controller.current_interval())
        });

        due
    }

    fn apply_backpressure(&mut self, now: Instant) {
        let idle_timeout = self.settings.idle_timeout;
        self.pending.retain(|_, pending| {
            !(pending.controller.is_exhausted() || pending.controller.is_idle(now, idle_timeout))
        });

        if self.pending.len() > self.settings.high_water {
            debug!(
                context = "resend",
                pending = self.pending.len(),
                "Resend registry over high water, tightening every limit"
            );
            for pending in self.pending.values_mut() {
                pending.controller.tighten_limit(FORCED_LIMIT);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    fn endpoint() -> Endpoint {
        Endpoint::udp(SocketAddr::from(([127, 0, 0, 1], 4000)))
    }

    #[test]
    fn never_resends_early_and_backs_off() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        let mut controller = ResendController::new(interval, 4, now);

        assert!(!controller.need_resend(now));
        assert!(!controller.need_resend(now + Duration::from_millis(499)));
        assert!(controller.need_resend(now + interval));

        let t1 = now + interval;
        controller.on_resend(t1);
        assert_eq!(controller.current_interval(), interval * 2);
        assert!(!controller.need_resend(t1 + interval));
        assert!(controller.need_resend(t1 + interval * 2));

        let t2 = t1 + interval * 2;
        controller.on_resend(t2);
        assert_eq!(controller.current_interval(), interval * 4);

        let t3 = t2 + interval * 4;
        controller.on_resend(t3);
        assert!(controller.is_exhausted());
        assert!(!controller.need_resend(t3 + Duration::from_secs(3600)));
    }

    #[test]
    fn forced_limit_stops_resending() {
        let now = Instant::now();
        let interval = Duration::from_millis(500);
        let mut controller = ResendController::new(interval, 4, now);

        controller.tighten_limit(2);
        controller.tighten_limit(10);
        assert_eq!(controller.limit(), 2);

        controller.on_resend(now + interval);
        assert!(controller.is_exhausted());
        assert!(!controller.need_resend(now + Duration::from_secs(3600)));
    }

    #[test]
    fn registry_resends_until_acked() {
        let now = Instant::now();
        let mut registry = ResendRegistry::new(ResendSettings::default());

        registry.insert("bob", 1, endpoint(), vec![1, 2, 3], now);

        assert!(registry.due(now).is_empty());
        let due = registry.due(now + DEFAULT_RESEND_INTERVAL);
        assert_eq!(due, vec![(endpoint(), vec![1, 2, 3])]);

        assert!(registry.ack("bob", 1));
        assert!(registry.is_empty());
        assert!(registry.due(now + Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn registry_drops_exhausted() {
        let now = Instant::now();
        let mut registry = ResendRegistry::new(ResendSettings::default());
        registry.insert("bob", 1, endpoint(), vec![1], now);

        let mut sent = 0;
        let mut time = now;
        for _ in 0..100 {
            time += Duration::from_millis(100);
            sent += registry.due(time).len();
        }

        // Limit counts the first send.
        assert_eq!(sent as u32, DEFAULT_RESEND_LIMIT - 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn backpressure_tightens_limits() {
        let now = Instant::now();
        let mut registry = ResendRegistry::new(ResendSettings {
            high_water: 4,
            ..Default::default()
        });

        for seq in 0..6 {
            registry.insert("bob", seq, endpoint(), vec![], now);
        }

        assert_eq!(registry.len(), 6);
        assert!(registry
            .pending
            .values()
            .all(|p| p.controller.limit() == FORCED_LIMIT));
    }
}
