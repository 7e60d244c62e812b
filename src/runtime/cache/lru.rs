//! Bounded local cache tier
//!
//! Entries live in an arena (`Vec<Option<Entry>>`) threaded by an explicit
//! doubly-linked recency list, giving O(1) lookup, promotion, and eviction
//! without ordered-map semantics. The structure is not synchronized; the
//! tiered facade wraps it in a mutex.

use std::collections::HashMap;
use std::time::{Duration, Instant};

struct Entry {
    key: String,
    value: Vec<u8>,
    expires_at: Option<Instant>,
    prev: Option<usize>,
    next: Option<usize>,
}

pub struct LruTier {
    capacity: usize,
    arena: Vec<Option<Entry>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    /// Most recently used
    head: Option<usize>,
    /// Least recently used, evicted first
    tail: Option<usize>,
}

impl LruTier {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be at least 1");
        Self {
            capacity,
            arena: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Fetch a live entry and promote it to most-recently-used. Expired
    /// entries are dropped and reported as absent.
    pub fn get(&mut self, key: &str) -> Option<Vec<u8>> {
        let idx = *self.index.get(key)?;
        if self.is_expired(idx) {
            self.remove_index(idx);
            return None;
        }
        self.unlink(idx);
        self.push_front(idx);
        self.arena[idx].as_ref().map(|e| e.value.clone())
    }

    /// Non-promoting presence check
    pub fn contains(&mut self, key: &str) -> bool {
        match self.index.get(key).copied() {
            Some(idx) if self.is_expired(idx) => {
                self.remove_index(idx);
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Insert or replace an entry, evicting the least-recently-used entry on
    /// capacity overflow.
    pub fn insert(&mut self, key: String, value: Vec<u8>, ttl: Option<Duration>) {
        let expires_at = ttl.map(|t| Instant::now() + t);

        if let Some(&idx) = self.index.get(&key) {
            let entry = self.arena[idx].as_mut().unwrap_or_else(|| unreachable!());
            entry.value = value;
            entry.expires_at = expires_at;
            self.unlink(idx);
            self.push_front(idx);
            return;
        }

        if self.index.len() >= self.capacity {
            if let Some(tail) = self.tail {
                self.remove_index(tail);
            }
        }

        let entry = Entry {
            key: key.clone(),
            value,
            expires_at,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.arena[idx] = Some(entry);
                idx
            }
            None => {
                self.arena.push(Some(entry));
                self.arena.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        match self.index.get(key).copied() {
            Some(idx) => {
                self.remove_index(idx);
                true
            }
            None => false,
        }
    }

    /// Remove every entry whose key matches the pattern (`prefix*` or exact
    /// match), returning the number removed.
    pub fn remove_matching(&mut self, pattern: &str) -> usize {
        let keys: Vec<String> = self
            .index
            .keys()
            .filter(|k| matches_pattern(k, pattern))
            .cloned()
            .collect();
        for key in &keys {
            self.remove(key);
        }
        keys.len()
    }

    pub fn clear(&mut self) -> usize {
        let count = self.index.len();
        self.arena.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        count
    }

    fn is_expired(&self, idx: usize) -> bool {
        self.arena[idx]
            .as_ref()
            .and_then(|e| e.expires_at)
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    fn remove_index(&mut self, idx: usize) {
        self.unlink(idx);
        if let Some(entry) = self.arena[idx].take() {
            self.index.remove(&entry.key);
            self.free.push(idx);
        }
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.arena[idx].as_ref() {
            Some(e) => (e.prev, e.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(e) = self.arena[p].as_mut() {
                    e.next = next;
                }
            }
            None if self.head == Some(idx) => self.head = next,
            None => {}
        }
        match next {
            Some(n) => {
                if let Some(e) = self.arena[n].as_mut() {
                    e.prev = prev;
                }
            }
            None if self.tail == Some(idx) => self.tail = prev,
            None => {}
        }
        if let Some(e) = self.arena[idx].as_mut() {
            e.prev = None;
            e.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(e) = self.arena[idx].as_mut() {
            e.prev = None;
            e.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(e) = self.arena[h].as_mut() {
                e.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(s: &str) -> Vec<u8> {
        s.as_bytes().to_vec()
    }

    #[test]
    fn test_insert_and_get() {
        let mut lru = LruTier::new(4);
        lru.insert("a".to_string(), value("1"), None);
        assert_eq!(lru.get("a"), Some(value("1")));
        assert_eq!(lru.get("missing"), None);
    }

    #[test]
    fn test_eviction_order_is_least_recently_used() {
        let mut lru = LruTier::new(2);
        lru.insert("a".to_string(), value("1"), None);
        lru.insert("b".to_string(), value("2"), None);
        // Touch "a" so "b" becomes least recently used
        assert!(lru.get("a").is_some());
        lru.insert("c".to_string(), value("3"), None);

        assert!(lru.get("b").is_none());
        assert!(lru.get("a").is_some());
        assert!(lru.get("c").is_some());
        assert_eq!(lru.len(), 2);
    }

    #[test]
    fn test_reinsert_updates_value_and_recency() {
        let mut lru = LruTier::new(2);
        lru.insert("a".to_string(), value("1"), None);
        lru.insert("b".to_string(), value("2"), None);
        lru.insert("a".to_string(), value("new"), None);
        lru.insert("c".to_string(), value("3"), None);

        assert_eq!(lru.get("a"), Some(value("new")));
        assert!(lru.get("b").is_none());
    }

    #[test]
    fn test_expired_entries_read_as_absent() {
        let mut lru = LruTier::new(4);
        lru.insert("a".to_string(), value("1"), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(lru.get("a"), None);
        assert_eq!(lru.len(), 0);
    }

    #[test]
    fn test_contains_does_not_promote() {
        let mut lru = LruTier::new(2);
        lru.insert("a".to_string(), value("1"), None);
        lru.insert("b".to_string(), value("2"), None);
        assert!(lru.contains("a"));
        // "a" was not promoted, so it is still least recently used
        lru.insert("c".to_string(), value("3"), None);
        assert!(!lru.contains("a"));
        assert!(lru.contains("b"));
    }

    #[test]
    fn test_remove_matching_prefix() {
        let mut lru = LruTier::new(8);
        lru.insert("talos:review:1".to_string(), value("1"), None);
        lru.insert("talos:review:2".to_string(), value("2"), None);
        lru.insert("talos:other".to_string(), value("3"), None);

        assert_eq!(lru.remove_matching("talos:review:*"), 2);
        assert_eq!(lru.len(), 1);
        assert!(lru.contains("talos:other"));
    }

    #[test]
    fn test_arena_slot_reuse() {
        let mut lru = LruTier::new(2);
        for i in 0..20 {
            lru.insert(format!("k{}", i), value("v"), None);
        }
        assert_eq!(lru.len(), 2);
        // Arena never grows past capacity plus transient churn
        assert!(lru.arena.len() <= 3);
    }
}
