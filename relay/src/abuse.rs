//! Keyed rate windows, expiry tables and strike counters
//!
//! These are the building blocks of both admission profiles. Every method
//! takes the current `Instant` so behaviour over time can be driven directly
//! from tests.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Fixed packet-counting window for one key.
#[derive(Debug, Clone, Copy)]
pub struct RateWindow {
    pub started: Instant,
    pub count: u32,
    /// Set once the window has produced its breach
    pub struck: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowVerdict {
    Allowed,
    /// The packet exceeded the ceiling. `first_breach` is true only for the
    /// first such packet in the current window.
    OverLimit { first_breach: bool },
}

pub struct WindowTable<K> {
    windows: HashMap<K, RateWindow>,
    window: Duration,
    limit: u32,
}

impl<K: Eq + Hash + Clone> WindowTable<K> {
    pub fn new(window: Duration, limit: u32) -> Self {
        Self {
            windows: HashMap::new(),
            window,
            limit,
        }
    }

    /// Counts one packet for `key`.
    pub fn record(&mut self, key: K, now: Instant) -> WindowVerdict {
        let entry = self.windows.entry(key).or_insert(RateWindow {
            started: now,
            count: 0,
            struck: false,
        });

        // Reset counter if window expired
        if now.saturating_duration_since(entry.started) >= self.window {
            *entry = RateWindow {
                started: now,
                count: 0,
                struck: false,
            };
        }

        entry.count = entry.count.saturating_add(1);
        if entry.count <= self.limit {
            return WindowVerdict::Allowed;
        }

        let first_breach = !entry.struck;
        entry.struck = true;
        WindowVerdict::OverLimit { first_breach }
    }

    /// Drops windows idle for more than two window lengths.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let horizon = self.window * 2;
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < horizon);
        before - self.windows.len()
    }

    pub fn trim(&mut self, target: usize) -> usize {
        trim_oldest(&mut self.windows, target, |w| w.started)
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Keys that are blocked (or granted) until an expiry instant.
pub struct ExpiryTable<K> {
    entries: HashMap<K, Instant>,
}

impl<K: Eq + Hash + Clone> Default for ExpiryTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> ExpiryTable<K> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Activates `key` for `duration`. An existing later expiry is kept.
    pub fn insert(&mut self, key: K, now: Instant, duration: Duration) {
        let expiry = now + duration;
        let entry = self.entries.entry(key).or_insert(expiry);
        if *entry < expiry {
            *entry = expiry;
        }
    }

    pub fn is_active(&self, key: &K, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|expiry| *expiry > now)
    }

    pub fn remove(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expiry| *expiry > now);
        before - self.entries.len()
    }

    /// Evicts the entries closest to expiry first.
    pub fn trim(&mut self, target: usize) -> usize {
        trim_oldest(&mut self.entries, target, |expiry| *expiry)
    }

    pub fn active_count(&self, now: Instant) -> usize {
        self.entries.values().filter(|expiry| **expiry > now).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StrikeCounter {
    pub count: u32,
    pub last_strike: Instant,
}

pub struct StrikeTable<K> {
    strikes: HashMap<K, StrikeCounter>,
}

impl<K: Eq + Hash + Clone> Default for StrikeTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> StrikeTable<K> {
    pub fn new() -> Self {
        Self {
            strikes: HashMap::new(),
        }
    }

    /// Records a strike and returns the new total for `key`.
    pub fn strike(&mut self, key: K, now: Instant) -> u32 {
        let counter = self.strikes.entry(key).or_insert(StrikeCounter {
            count: 0,
            last_strike: now,
        });
        counter.count = counter.count.saturating_add(1);
        counter.last_strike = now;
        counter.count
    }

    pub fn count(&self, key: &K) -> u32 {
        self.strikes.get(key).map_or(0, |c| c.count)
    }

    pub fn clear(&mut self, key: &K) {
        self.strikes.remove(key);
    }

    /// Forgets counters whose last strike is older than `ttl`.
    pub fn sweep(&mut self, now: Instant, ttl: Duration) -> usize {
        let before = self.strikes.len();
        self.strikes
            .retain(|_, c| now.saturating_duration_since(c.last_strike) < ttl);
        before - self.strikes.len()
    }

    pub fn trim(&mut self, target: usize) -> usize {
        trim_oldest(&mut self.strikes, target, |c| c.last_strike)
    }

    pub fn len(&self) -> usize {
        self.strikes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strikes.is_empty()
    }
}

/// Removes entries with the smallest `age_key` until `map.len() <= target`.
pub fn trim_oldest<K, V, F>(map: &mut HashMap<K, V>, target: usize, age_key: F) -> usize
where
    K: Eq + Hash + Clone,
    F: Fn(&V) -> Instant,
{
    if map.len() <= target {
        return 0;
    }

    let mut by_age: Vec<(Instant, K)> = map.iter().map(|(k, v)| (age_key(v), k.clone())).collect();
    by_age.sort_by_key(|(age, _)| *age);

    let excess = map.len() - target;
    for (_, key) in by_age.into_iter().take(excess) {
        map.remove(&key);
    }
    excess
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};

    fn test_addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), port)
    }

    #[test]
    fn test_window_allows_up_to_limit() {
        let mut table = WindowTable::new(Duration::from_secs(1), 3);
        let now = Instant::now();

        for _ in 0..3 {
            assert_eq!(table.record(test_addr(1), now), WindowVerdict::Allowed);
        }
        assert_eq!(
            table.record(test_addr(1), now),
            WindowVerdict::OverLimit { first_breach: true }
        );
        assert_eq!(
            table.record(test_addr(1), now),
            WindowVerdict::OverLimit { first_breach: false }
        );
    }

    #[test]
    fn test_window_resets_after_window_length() {
        let mut table = WindowTable::new(Duration::from_secs(1), 1);
        let start = Instant::now();

        assert_eq!(table.record(test_addr(1), start), WindowVerdict::Allowed);
        assert!(matches!(
            table.record(test_addr(1), start),
            WindowVerdict::OverLimit { .. }
        ));

        let later = start + Duration::from_secs(1);
        assert_eq!(table.record(test_addr(1), later), WindowVerdict::Allowed);
        assert_eq!(
            table.record(test_addr(1), later),
            WindowVerdict::OverLimit { first_breach: true }
        );
    }

    #[test]
    fn test_windows_are_per_key() {
        let mut table = WindowTable::new(Duration::from_secs(1), 1);
        let now = Instant::now();

        assert_eq!(table.record(test_addr(1), now), WindowVerdict::Allowed);
        assert_eq!(table.record(test_addr(2), now), WindowVerdict::Allowed);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_window_sweep() {
        let mut table = WindowTable::new(Duration::from_secs(1), 10);
        let start = Instant::now();
        table.record(test_addr(1), start);
        table.record(test_addr(2), start + Duration::from_millis(1500));

        assert_eq!(table.sweep(start + Duration::from_millis(2100)), 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expiry_table() {
        let mut table = ExpiryTable::new();
        let now = Instant::now();
        let ip = test_addr(1).ip();

        table.insert(ip, now, Duration::from_secs(5));
        assert!(table.is_active(&ip, now));
        assert!(table.is_active(&ip, now + Duration::from_millis(4999)));
        assert!(!table.is_active(&ip, now + Duration::from_secs(5)));

        assert_eq!(table.sweep(now + Duration::from_secs(6)), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_expiry_insert_keeps_later_expiry() {
        let mut table = ExpiryTable::new();
        let now = Instant::now();

        table.insert("k", now, Duration::from_secs(60));
        table.insert("k", now, Duration::from_secs(1));
        assert!(table.is_active(&"k", now + Duration::from_secs(30)));
    }

    #[test]
    fn test_strikes_accumulate_and_clear() {
        let mut table = StrikeTable::new();
        let now = Instant::now();
        let ip = test_addr(1).ip();

        assert_eq!(table.strike(ip, now), 1);
        assert_eq!(table.strike(ip, now), 2);
        assert_eq!(table.count(&ip), 2);

        table.clear(&ip);
        assert_eq!(table.count(&ip), 0);
    }

    #[test]
    fn test_stale_strikes_are_forgotten() {
        let mut table = StrikeTable::new();
        let now = Instant::now();
        table.strike("old", now);
        table.strike("new", now + Duration::from_secs(50));

        assert_eq!(table.sweep(now + Duration::from_secs(60), Duration::from_secs(30)), 1);
        assert_eq!(table.count(&"old"), 0);
        assert_eq!(table.count(&"new"), 1);
    }

    #[test]
    fn test_trim_removes_oldest_first() {
        let mut table = StrikeTable::new();
        let now = Instant::now();
        for i in 0..10u64 {
            table.strike(i, now + Duration::from_secs(i));
        }

        assert_eq!(table.trim(4), 6);
        assert_eq!(table.len(), 4);
        for i in 0..6u64 {
            assert_eq!(table.count(&i), 0);
        }
        for i in 6..10u64 {
            assert_eq!(table.count(&i), 1);
        }
    }

    #[test]
    fn test_trim_below_target_is_noop() {
        let mut table = ExpiryTable::new();
        table.insert(1u8, Instant::now(), Duration::from_secs(1));
        assert_eq!(table.trim(10), 0);
        assert_eq!(table.len(), 1);
    }
}
