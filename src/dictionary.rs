//! The per-stream intern dictionary: an insertion-ordered list of strings
//! with dense indices that re-base to 0 on every clear, plus the bounded
//! admission cache the encoder uses to decide which strings earn an entry.

use std::collections::HashMap;

use crate::errparse;
use crate::error::Result;

/// Insertion-ordered interned strings.
///
/// Also carries the back-chain bookkeeping both sides of the codec need: the
/// absolute stream position of the last applied dict-add or dict-clear frame
/// (the "anchor") and of the last clear. A frame is applied only if its
/// position is beyond the anchor, which makes re-walking frames (e.g. during
/// grep context replay) a no-op instead of a duplicate insertion.
#[derive(Debug, Default)]
pub struct Dictionary {
    entries: Vec<String>,
    anchor: Option<u64>,
    last_clear: Option<u64>,
}

impl Dictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `s` and returns its index.
    pub fn add(&mut self, s: String) -> u64 {
        self.entries.push(s);
        (self.entries.len() - 1) as u64
    }

    /// Looks up an entry by absolute index. Out-of-range references are a
    /// parse error: the stream referenced an entry it never announced.
    pub fn get(&self, index: u64) -> Result<&str> {
        match self.entries.get(index as usize) {
            Some(s) => Ok(s),
            None => errparse!(
                "dictionary reference {index} out of range (dictionary has {} entries)",
                self.entries.len()
            ),
        }
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Empties the entries and re-bases indices to 0.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Drops the most recent `n` entries. Used by the encoder to roll back
    /// admissions from an aborted record.
    pub fn truncate_last(&mut self, n: usize) {
        let keep = self.entries.len().saturating_sub(n);
        self.entries.truncate(keep);
    }

    pub fn anchor(&self) -> Option<u64> {
        self.anchor
    }

    pub fn set_anchor(&mut self, pos: u64) {
        self.anchor = Some(pos);
    }

    pub fn last_clear(&self) -> Option<u64> {
        self.last_clear
    }

    /// Records a clear frame at `pos`: empties the entries and anchors the
    /// back-chain there.
    pub fn note_clear(&mut self, pos: u64) {
        self.clear();
        self.anchor = Some(pos);
        self.last_clear = Some(pos);
    }

    /// Forgets entries and chain state entirely, as if freshly constructed.
    /// Used when re-synchronizing at an arbitrary stream position.
    pub fn reset(&mut self) {
        self.entries.clear();
        self.anchor = None;
        self.last_clear = None;
    }
}

/// How one occurrence of a string should be encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringMode {
    /// Inline string bytes.
    Inline,
    /// Reference to an already-admitted dictionary entry.
    Ref(u64),
    /// Newly admitted: the caller must announce the entry (a dict-add frame)
    /// before the value frame that references it.
    Admit(u64),
}

#[derive(Debug)]
struct CacheEntry {
    count: u64,
    index: Option<u64>,
    last_use: u64,
}

/// Bounded string → (hits, index) map implementing the admission policy: a
/// string is promoted to the dictionary once its hit counter crosses the
/// threshold and it is at least `min_len` bytes. Non-admitted entries are
/// evicted by lowest (count, recency) once the map is full; admitted entries
/// stay until the next clear.
#[derive(Debug)]
pub struct InternCache {
    map: HashMap<String, CacheEntry>,
    threshold: u64,
    min_len: usize,
    cap: usize,
    tick: u64,
}

impl InternCache {
    pub fn new(threshold: u64, min_len: usize, cap: usize) -> Self {
        Self {
            map: HashMap::new(),
            threshold,
            min_len,
            cap: cap.max(1),
            tick: 0,
        }
    }

    /// Notes one occurrence of `s` and decides how to encode it.
    ///
    /// `intern` is the caller's hint: `Some(false)` forces inline without
    /// counting, `Some(true)` admits immediately, `None` applies the
    /// frequency and length gates.
    pub fn observe(&mut self, s: &str, intern: Option<bool>, dict: &mut Dictionary) -> StringMode {
        if intern == Some(false) {
            return StringMode::Inline;
        }
        self.tick += 1;

        if !self.map.contains_key(s) && self.map.len() >= self.cap && !self.evict_one() {
            // Every slot is pinned by an admitted entry; stop tracking new
            // candidates until the next clear.
            return if intern == Some(true) {
                StringMode::Admit(dict.add(s.to_string()))
            } else {
                StringMode::Inline
            };
        }

        let tick = self.tick;
        let entry = self.map.entry(s.to_string()).or_insert(CacheEntry {
            count: 0,
            index: None,
            last_use: tick,
        });
        entry.count += 1;
        entry.last_use = tick;

        if let Some(index) = entry.index {
            return StringMode::Ref(index);
        }
        let forced = intern == Some(true);
        if forced || (entry.count > self.threshold && s.len() >= self.min_len) {
            let index = dict.add(s.to_string());
            entry.index = Some(index);
            return StringMode::Admit(index);
        }
        StringMode::Inline
    }

    /// Rolls back the admission of `s` after an aborted record: the entry
    /// reverts to candidate status so a later record can re-admit it.
    pub fn demote(&mut self, s: &str) {
        if let Some(entry) = self.map.get_mut(s) {
            entry.index = None;
        }
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.map.capacity()
    }

    /// Total bytes of cached string keys.
    pub fn cached_bytes(&self) -> usize {
        self.map.keys().map(String::len).sum()
    }

    /// Removes the least useful non-admitted entry. Returns false if every
    /// entry is admitted and therefore unevictable.
    fn evict_one(&mut self) -> bool {
        let victim = self
            .map
            .iter()
            .filter(|(_, e)| e.index.is_none())
            .min_by_key(|(_, e)| (e.count, e.last_use))
            .map(|(k, _)| k.clone());
        match victim {
            Some(key) => {
                self.map.remove(&key);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_lookup_clear() {
        let mut dict = Dictionary::new();
        assert_eq!(dict.add("alpha".to_string()), 0);
        assert_eq!(dict.add("beta".to_string()), 1);
        assert_eq!(dict.get(0).expect("lookup failed"), "alpha");
        assert_eq!(dict.get(1).expect("lookup failed"), "beta");
        assert_eq!(dict.size(), 2);

        dict.clear();
        assert!(dict.is_empty());
        assert_eq!(dict.add("gamma".to_string()), 0, "indices re-base after clear");
    }

    #[test]
    fn out_of_range_reference_is_parse_error() {
        let dict = Dictionary::new();
        assert!(dict.get(0).is_err());
    }

    #[test]
    fn clear_and_reset_bookkeeping() {
        let mut dict = Dictionary::new();
        dict.add("stale".to_string());
        dict.note_clear(5);
        assert!(dict.is_empty());
        assert_eq!(dict.anchor(), Some(5));
        assert_eq!(dict.last_clear(), Some(5));

        dict.set_anchor(100);
        assert_eq!(dict.anchor(), Some(100));
        assert_eq!(dict.last_clear(), Some(5));

        dict.reset();
        assert_eq!(dict.anchor(), None);
        assert_eq!(dict.last_clear(), None);
    }

    #[test]
    fn admission_crosses_threshold() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(10, 4, 1024);
        for _ in 0..10 {
            assert_eq!(cache.observe("foobar", None, &mut dict), StringMode::Inline);
        }
        assert_eq!(cache.observe("foobar", None, &mut dict), StringMode::Admit(0));
        assert_eq!(cache.observe("foobar", None, &mut dict), StringMode::Ref(0));
        assert_eq!(dict.size(), 1);
    }

    #[test]
    fn short_strings_are_never_admitted() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(10, 4, 1024);
        for _ in 0..100 {
            assert_eq!(cache.observe("abc", None, &mut dict), StringMode::Inline);
        }
        assert!(dict.is_empty());
    }

    #[test]
    fn forced_intern_bypasses_gates() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(10, 4, 1024);
        assert_eq!(cache.observe("ts", Some(true), &mut dict), StringMode::Admit(0));
        assert_eq!(cache.observe("ts", Some(true), &mut dict), StringMode::Ref(0));
        assert_eq!(cache.observe("ts", None, &mut dict), StringMode::Ref(0));
    }

    #[test]
    fn forced_inline_is_never_counted() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(1, 1, 1024);
        for _ in 0..10 {
            assert_eq!(cache.observe("secret", Some(false), &mut dict), StringMode::Inline);
        }
        assert!(dict.is_empty());
        assert!(cache.is_empty());
    }

    #[test]
    fn cache_stays_bounded() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(10, 4, 8);
        for i in 0..100 {
            cache.observe(&format!("candidate-{i}"), None, &mut dict);
        }
        assert!(cache.len() <= 8, "cache grew to {}", cache.len());
    }

    #[test]
    fn eviction_spares_admitted_entries() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(1, 1, 4);
        // threshold 1: the second occurrence admits.
        assert_eq!(cache.observe("keep", None, &mut dict), StringMode::Inline);
        assert_eq!(cache.observe("keep", None, &mut dict), StringMode::Admit(0));
        for i in 0..50 {
            cache.observe(&format!("churn-{i}"), None, &mut dict);
        }
        assert_eq!(cache.observe("keep", None, &mut dict), StringMode::Ref(0));
    }

    #[test]
    fn demote_reverts_admission() {
        let mut dict = Dictionary::new();
        let mut cache = InternCache::new(1, 1, 16);
        cache.observe("once", None, &mut dict);
        assert_eq!(cache.observe("once", None, &mut dict), StringMode::Admit(0));
        dict.truncate_last(1);
        cache.demote("once");
        assert_eq!(cache.observe("once", None, &mut dict), StringMode::Admit(0));
    }
}
