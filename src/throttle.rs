use std::time::{Duration, Instant};

use cached::{Cached, SizedCache};

use crate::vector::{GridKey, Vec3};

/// Limits how often some expensive piece of work runs for each object in the world. Objects are
/// identified by their position, so an object that is rebuilt in the same place keeps its entry.
///
/// The table holds at most `capacity` objects, dropping the least recently used beyond that.
/// Entries older than the TTL count as absent.
pub struct Throttle {
    last_run: SizedCache<GridKey, Instant>,
    interval: Duration,
    ttl: Duration,
}

impl Throttle {
    /// No interval is ever shorter than this.
    pub const FLOOR: Duration = Duration::from_millis(100);

    /// Positions are snapped to a millimetre grid.
    const KEY_SCALE: f32 = 1000.0;

    pub fn new(capacity: usize, interval: Duration, ttl: Duration) -> Throttle {
        Throttle {
            last_run: SizedCache::with_size(capacity.max(1)),
            interval: interval.max(Self::FLOOR),
            ttl,
        }
    }

    pub fn key(position: Vec3) -> GridKey {
        GridKey::new(position, Self::KEY_SCALE)
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Returns whether the work for `key` may run at `now`, and if so records that it ran.
    pub fn ready(&mut self, key: GridKey, now: Instant) -> bool {
        if let Some(last) = self.last_run.cache_get(&key) {
            let elapsed = now.saturating_duration_since(*last);

            if elapsed < self.interval && elapsed < self.ttl {
                return false;
            }
        }

        self.last_run.cache_set(key, now);
        true
    }

    /// Drops the entry for an object that no longer exists.
    pub fn forget(&mut self, key: GridKey) {
        self.last_run.cache_remove(&key);
    }

    pub fn len(&self) -> usize {
        self.last_run.cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(x: f32) -> GridKey {
        Throttle::key(Vec3::new(x, 0.0, 0.0))
    }

    #[test]
    fn runs_at_most_once_per_interval() {
        let mut throttle = Throttle::new(8, Duration::from_secs(1), Duration::from_secs(60));
        let start = Instant::now();

        assert!(throttle.ready(key(1.0), start));
        assert!(!throttle.ready(key(1.0), start + Duration::from_millis(999)));
        assert!(throttle.ready(key(1.0), start + Duration::from_millis(1000)));

        // Other objects are independent.
        assert!(throttle.ready(key(2.0), start));
    }

    #[test]
    fn interval_has_a_floor() {
        let mut throttle = Throttle::new(8, Duration::ZERO, Duration::from_secs(60));
        assert_eq!(throttle.interval(), Throttle::FLOOR);

        let start = Instant::now();
        assert!(throttle.ready(key(1.0), start));
        assert!(!throttle.ready(key(1.0), start));
    }

    #[test]
    fn capacity_is_bounded() {
        let mut throttle = Throttle::new(2, Duration::from_secs(10), Duration::from_secs(60));
        let now = Instant::now();

        throttle.ready(key(1.0), now);
        throttle.ready(key(2.0), now);
        throttle.ready(key(3.0), now);

        assert_eq!(throttle.len(), 2);

        // The oldest entry was evicted, so it may run again straight away.
        assert!(throttle.ready(key(1.0), now));
    }

    #[test]
    fn forgotten_and_expired_entries_are_absent() {
        let mut throttle = Throttle::new(8, Duration::from_secs(10), Duration::from_secs(2));
        let start = Instant::now();

        throttle.ready(key(1.0), start);
        throttle.forget(key(1.0));
        assert!(throttle.is_empty());
        assert!(throttle.ready(key(1.0), start));

        assert!(throttle.ready(key(1.0), start + Duration::from_secs(2)));
    }
}
