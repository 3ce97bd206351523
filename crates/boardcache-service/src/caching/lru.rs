use std::hash::Hash;

use lru::LruCache;

/// A least-recently-used store bounded by the total weight of its entries.
///
/// The weight of an entry is supplied on insertion, usually the size of the decoded payload
/// in bytes. After every insertion the least recently used entries are evicted until the
/// total weight fits the capacity again, with one exception: the entry that was just inserted
/// is never evicted by its own insertion. An entry heavier than the whole capacity is thus
/// admitted, and is the first to go on the next insertion.
pub struct WeightedLru<K, V> {
    entries: LruCache<K, (V, u64)>,
    weight: u64,
    capacity: u64,
}

impl<K: Hash + Eq, V> WeightedLru<K, V> {
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: LruCache::unbounded(),
            weight: 0,
            capacity,
        }
    }

    /// Inserts `value`, replacing any previous value for `key`.
    ///
    /// Returns the entries evicted to make room, least recently used first.
    pub fn insert(&mut self, key: K, value: V, weight: u64) -> Vec<(K, V)> {
        if let Some((_, old_weight)) = self.entries.pop(&key) {
            self.weight -= old_weight;
        }
        self.entries.push(key, (value, weight));
        self.weight += weight;

        let mut evicted = Vec::new();
        while self.weight > self.capacity && self.entries.len() > 1 {
            match self.entries.pop_lru() {
                Some((key, (value, weight))) => {
                    self.weight -= weight;
                    evicted.push((key, value));
                }
                None => break,
            }
        }
        evicted
    }

    /// Looks up `key`, marking it as most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|(value, _)| value)
    }

    /// Looks up `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key).map(|(value, _)| value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, weight) = self.entries.pop(key)?;
        self.weight -= weight;
        Some(value)
    }

    /// Evicts least recently used entries until the total weight is at most `target`.
    ///
    /// Returns the number of evicted entries.
    pub fn trim_to(&mut self, target: u64) -> usize {
        let mut evicted = 0;
        while self.weight > target {
            let Some((_, (_, weight))) = self.entries.pop_lru() else {
                break;
            };
            self.weight -= weight;
            evicted += 1;
        }
        evicted
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.weight = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The total weight of all entries.
    pub fn weight(&self) -> u64 {
        self.weight
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }
}

impl<K: Hash + Eq, V> std::fmt::Debug for WeightedLru<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightedLru")
            .field("entries", &self.entries.len())
            .field("weight", &self.weight)
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(lru: &WeightedLru<&'static str, u32>) -> Vec<&'static str> {
        let mut keys: Vec<_> = ["a", "b", "c", "d", "huge"]
            .into_iter()
            .filter(|k| lru.contains(k))
            .collect();
        keys.sort();
        keys
    }

    #[test]
    fn test_evicts_least_recently_used() {
        let mut lru = WeightedLru::new(100);
        assert!(lru.insert("a", 1, 40).is_empty());
        assert!(lru.insert("b", 2, 40).is_empty());

        let evicted = lru.insert("c", 3, 40);
        assert_eq!(evicted, vec![("a", 1)]);

        assert_eq!(keys(&lru), ["b", "c"]);
        assert_eq!(lru.weight(), 80);
    }

    #[test]
    fn test_get_refreshes_recency() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 40);
        lru.insert("b", 2, 40);
        assert_eq!(lru.get(&"a"), Some(&1));

        lru.insert("c", 3, 40);
        assert_eq!(keys(&lru), ["a", "c"]);
    }

    #[test]
    fn test_peek_keeps_recency() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 40);
        lru.insert("b", 2, 40);
        assert_eq!(lru.peek(&"a"), Some(&1));

        lru.insert("c", 3, 40);
        assert_eq!(keys(&lru), ["b", "c"]);
    }

    #[test]
    fn test_oversized_entry_is_admitted() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 40);

        let evicted = lru.insert("huge", 2, 150);
        assert_eq!(evicted, vec![("a", 1)]);
        assert_eq!(keys(&lru), ["huge"]);
        assert_eq!(lru.weight(), 150);

        // and it is the first one to go
        let evicted = lru.insert("b", 3, 10);
        assert_eq!(evicted, vec![("huge", 2)]);
        assert_eq!(lru.weight(), 10);
    }

    #[test]
    fn test_weight_never_exceeds_capacity() {
        let mut lru = WeightedLru::new(100);
        for (i, weight) in [10, 70, 30, 55, 1, 99, 100, 20, 45, 5].into_iter().enumerate() {
            lru.insert(i, weight, weight as u64);
            assert!(lru.weight() <= lru.capacity());
        }
    }

    #[test]
    fn test_replace_updates_weight() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 40);
        lru.insert("a", 2, 10);

        assert_eq!(lru.len(), 1);
        assert_eq!(lru.weight(), 10);
        assert_eq!(lru.peek(&"a"), Some(&2));
    }

    #[test]
    fn test_trim_and_clear() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 30);
        lru.insert("b", 2, 30);
        lru.insert("c", 3, 30);

        assert_eq!(lru.trim_to(50), 2);
        assert_eq!(keys(&lru), ["c"]);

        assert_eq!(lru.remove(&"c"), Some(3));
        assert_eq!(lru.weight(), 0);

        lru.insert("d", 4, 30);
        lru.clear();
        assert!(lru.is_empty());
        assert_eq!(lru.weight(), 0);
    }

    #[test]
    fn test_debug() {
        let mut lru = WeightedLru::new(100);
        lru.insert("a", 1, 30);

        assert_eq!(
            format!("{lru:?}"),
            "WeightedLru { entries: 1, weight: 30, capacity: 100 }"
        );
    }
}
