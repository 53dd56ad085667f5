use std::{
    num::NonZeroUsize,
    time::{Duration, Instant},
};

use lru::LruCache;
use parking_lot::Mutex;
use regex::Regex;

struct LocalEntry {
    value: Vec<u8>,
    tags: Vec<String>,
    created_at: Instant,
    ttl: Duration,
    accesses: u64,
}

impl LocalEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Bounded in-process LRU tier.
///
/// Reads reorder the LRU list, so reads and writes go through the same lock.
pub struct LocalTier {
    entries: Mutex<LruCache<String, LocalEntry>>,
}

impl LocalTier {
    pub fn new(max_items: usize) -> Self {
        let capacity = NonZeroUsize::new(max_items).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Value for `key` if present and not expired. Expired entries are dropped.
    pub fn get(&self, key: &str, now: Instant) -> Option<Vec<u8>> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => {
                entry.accesses += 1;
                return Some(entry.value.clone());
            }
            Some(_) => {}
        }
        entries.pop(key);
        None
    }

    /// Insert or replace. Returns true when another entry was evicted to make room.
    pub fn set(
        &self,
        key: String,
        value: Vec<u8>,
        ttl: Duration,
        tags: Vec<String>,
        now: Instant,
    ) -> bool {
        let entry = LocalEntry {
            value,
            tags,
            created_at: now,
            ttl,
            accesses: 0,
        };
        let mut entries = self.entries.lock();
        match entries.push(key.clone(), entry) {
            Some((displaced, _)) => displaced != key,
            None => false,
        }
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.lock().pop(key).is_some()
    }

    /// Remove entries whose tags intersect `tags`, returning their keys.
    pub fn remove_tagged(&self, tags: &[&str]) -> Vec<String> {
        self.remove_where(|_, entry| entry.tags.iter().any(|t| tags.contains(&t.as_str())))
    }

    pub fn remove_matching(&self, pattern: &Regex) -> usize {
        self.remove_where(|key, _| pattern.is_match(key)).len()
    }

    /// Drop every expired entry.
    pub fn sweep(&self, now: Instant) -> usize {
        self.remove_where(|_, entry| entry.is_expired(now)).len()
    }

    /// Access count of a live entry, without touching LRU order.
    pub fn accesses(&self, key: &str) -> Option<u64> {
        self.entries.lock().peek(key).map(|entry| entry.accesses)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    fn remove_where(&self, mut doomed: impl FnMut(&str, &LocalEntry) -> bool) -> Vec<String> {
        let mut entries = self.entries.lock();
        let keys: Vec<String> = entries
            .iter()
            .filter(|(key, entry)| doomed(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            entries.pop(key);
        }
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_lru_eviction_order() {
        let tier = LocalTier::new(2);
        let now = Instant::now();
        assert!(!tier.set("a".into(), b"1".to_vec(), MINUTE, vec![], now));
        assert!(!tier.set("b".into(), b"2".to_vec(), MINUTE, vec![], now));

        // touch "a" so "b" becomes least recently used
        assert!(tier.get("a", now).is_some());
        assert!(tier.set("c".into(), b"3".to_vec(), MINUTE, vec![], now));

        assert!(tier.get("b", now).is_none());
        assert_eq!(tier.get("a", now), Some(b"1".to_vec()));
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_replacing_a_key_is_not_an_eviction() {
        let tier = LocalTier::new(1);
        let now = Instant::now();
        tier.set("a".into(), b"1".to_vec(), MINUTE, vec![], now);
        assert!(!tier.set("a".into(), b"2".to_vec(), MINUTE, vec![], now));
        assert_eq!(tier.get("a", now), Some(b"2".to_vec()));
    }

    #[test]
    fn test_expiry_is_exact() {
        let tier = LocalTier::new(4);
        let start = Instant::now();
        tier.set("k".into(), b"v".to_vec(), Duration::from_secs(1), vec![], start);

        assert!(tier.get("k", start + Duration::from_millis(500)).is_some());
        assert!(tier.get("k", start + Duration::from_secs(1)).is_none());
        assert!(tier.is_empty());
    }

    #[test]
    fn test_tag_and_pattern_removal() {
        let tier = LocalTier::new(8);
        let now = Instant::now();
        tier.set("ab".into(), vec![], MINUTE, vec!["a".into(), "b".into()], now);
        tier.set("b".into(), vec![], MINUTE, vec!["b".into()], now);
        tier.set("a".into(), vec![], MINUTE, vec!["a".into()], now);

        let mut removed = tier.remove_tagged(&["b"]);
        removed.sort();
        assert_eq!(removed, vec!["ab".to_string(), "b".to_string()]);
        assert!(tier.get("a", now).is_some());

        tier.set("gen:GET:/x".into(), vec![], MINUTE, vec![], now);
        let pattern = crate::utils::pattern::key_glob("gen:*").unwrap();
        assert_eq!(tier.remove_matching(&pattern), 1);
    }

    #[test]
    fn test_sweep_and_access_counts() {
        let tier = LocalTier::new(8);
        let now = Instant::now();
        tier.set("short".into(), vec![], Duration::from_millis(10), vec![], now);
        tier.set("long".into(), vec![], MINUTE, vec![], now);
        tier.get("long", now);
        tier.get("long", now);

        assert_eq!(tier.sweep(now + Duration::from_secs(1)), 1);
        assert_eq!(tier.accesses("long"), Some(2));
        assert_eq!(tier.accesses("short"), None);
    }
}
