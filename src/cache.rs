//! Server snapshot cache (spec §3): the last successful listing for sites
//! or uploads, plus its wall-clock timestamp. Fresh for 30s; reconcile
//! force-refreshes at the start of every run.

use std::time::{Duration, Instant};

const FRESH_FOR: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SnapshotCache<T> {
    entry: Option<(T, Instant)>,
}

impl<T: Clone> SnapshotCache<T> {
    pub fn new() -> Self {
        Self { entry: None }
    }

    /// Returns the cached value if it's still fresh (within 30s of the
    /// last successful fetch), without forcing a refresh.
    pub fn get_fresh(&self, now: Instant) -> Option<&T> {
        self.entry
            .as_ref()
            .filter(|(_, at)| now.duration_since(*at) < FRESH_FOR)
            .map(|(v, _)| v)
    }

    /// Replaces the cache atomically with a freshly-fetched value.
    pub fn set(&mut self, value: T, at: Instant) {
        self.entry = Some((value, at));
    }

    pub fn invalidate(&mut self) {
        self.entry = None;
    }
}

impl<T: Clone> Default for SnapshotCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_value_is_returned_within_window() {
        let mut cache = SnapshotCache::new();
        let now = Instant::now();
        cache.set(vec![1, 2, 3], now);
        assert_eq!(cache.get_fresh(now).unwrap(), &vec![1, 2, 3]);
    }

    #[test]
    fn stale_value_is_not_returned() {
        let mut cache = SnapshotCache::new();
        let t0 = Instant::now();
        cache.set(vec![1], t0);
        let later = t0 + FRESH_FOR + Duration::from_secs(1);
        assert!(cache.get_fresh(later).is_none());
    }

    #[test]
    fn invalidate_clears_the_cache() {
        let mut cache = SnapshotCache::new();
        let now = Instant::now();
        cache.set(42, now);
        cache.invalidate();
        assert!(cache.get_fresh(now).is_none());
    }
}
