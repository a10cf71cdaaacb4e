//! Small reader/writer-locked map shared between segment tasks.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;

/// Concurrent key→value container. One lives per running download and maps
/// each segment's original initial offset to its segment id.
#[derive(Debug, Default)]
pub struct SharedMap<K, V> {
    inner: RwLock<HashMap<K, V>>,
}

impl<K, V> SharedMap<K, V>
where
    K: Eq + Hash + Copy + Ord,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert(&self, key: K, value: V) {
        self.inner.write().insert(key, value);
    }

    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Snapshot of all keys, sorted ascending.
    pub fn keys(&self) -> Vec<K> {
        let mut keys: Vec<K> = self.inner.read().keys().copied().collect();
        keys.sort_unstable();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_and_sorted_keys() {
        let map: SharedMap<i64, String> = SharedMap::new();
        assert!(map.is_empty());
        map.insert(500, "b".into());
        map.insert(0, "a".into());
        map.insert(1000, "c".into());
        assert_eq!(map.len(), 3);
        assert_eq!(map.get(&500), Some("b".into()));
        assert_eq!(map.get(&7), None);
        assert_eq!(map.keys(), vec![0, 500, 1000]);
    }

    #[test]
    fn insert_overwrites() {
        let map: SharedMap<i64, u8> = SharedMap::new();
        map.insert(1, 1);
        map.insert(1, 2);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get(&1), Some(2));
    }
}
