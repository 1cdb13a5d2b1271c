//! Tag Cache (spec.md §3/§4.I): last-seen UID + timestamp, with `has_changed`
//! firing exactly once per *transition* to a new UID and presence keyed on a
//! 1-second freshness window.

use std::time::Duration;

use crate::clock::{Clock, Moment};

const PRESENCE_WINDOW: Duration = Duration::from_secs(1);

pub struct TagCache {
    last_uid: Option<String>,
    last_seen: Option<Moment>,
}

impl TagCache {
    pub fn new() -> Self {
        Self { last_uid: None, last_seen: None }
    }

    /// Records that `uid` was observed at `now`, advancing `last_seen_time`.
    /// Returns `true` exactly once per transition to a new UID (invariant
    /// (c) of spec.md §3's `TagCache`).
    pub fn observe(&mut self, uid: &str, now: Moment) -> bool {
        let changed = self.last_uid.as_deref() != Some(uid);
        if changed {
            self.last_uid = Some(uid.to_string());
        }
        // last_seen_time is monotonically non-decreasing while a card is present.
        self.last_seen = Some(match self.last_seen {
            Some(prev) if prev > now => prev,
            _ => now,
        });
        changed
    }

    pub fn clear(&mut self) {
        self.last_uid = None;
        self.last_seen = None;
    }

    /// `true` iff a UID has been observed within the last second of clock time.
    pub fn is_present(&self, clock: &dyn Clock) -> bool {
        match self.last_seen {
            Some(last) => match clock.now().checked_duration_since(last) {
                Some(elapsed) => elapsed < PRESENCE_WINDOW,
                None => true, // clock went backwards relative to last_seen: treat as still fresh
            },
            None => false,
        }
    }

    pub fn last_uid(&self) -> Option<&str> {
        self.last_uid.as_deref()
    }
}

impl Default for TagCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use std::time::Duration;

    #[test]
    fn first_observation_is_a_change() {
        let clock = VirtualClock::new();
        let mut cache = TagCache::new();
        assert!(cache.observe("04aabb", clock.now()));
    }

    #[test]
    fn repeated_uid_is_not_a_change() {
        let clock = VirtualClock::new();
        let mut cache = TagCache::new();
        assert!(cache.observe("04aabb", clock.now()));
        assert!(!cache.observe("04aabb", clock.now()));
    }

    #[test]
    fn new_uid_after_old_one_is_a_change() {
        let clock = VirtualClock::new();
        let mut cache = TagCache::new();
        cache.observe("04aabb", clock.now());
        assert!(cache.observe("04ccdd", clock.now()));
    }

    #[test]
    fn presence_expires_after_one_second() {
        let clock = VirtualClock::new();
        let mut cache = TagCache::new();
        cache.observe("04aabb", clock.now());
        assert!(cache.is_present(&clock));
        clock.advance(Duration::from_millis(999));
        assert!(cache.is_present(&clock));
        clock.advance(Duration::from_millis(2));
        assert!(!cache.is_present(&clock));
    }

    #[test]
    fn never_observed_is_never_present() {
        let clock = VirtualClock::new();
        let cache = TagCache::new();
        assert!(!cache.is_present(&clock));
    }

    #[test]
    fn clearing_resets_change_detection() {
        let clock = VirtualClock::new();
        let mut cache = TagCache::new();
        cache.observe("04aabb", clock.now());
        cache.clear();
        assert!(cache.observe("04aabb", clock.now()));
    }
}
