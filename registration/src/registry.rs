use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;
use tracing::debug;

/// A keyed table whose entries go stale: every upsert stamps the entry with
///  the current time, and any read first sweeps out entries whose stamp is
///  older than the timeout.
///
/// Staleness is enforced lazily at query time on purpose - the tables are
///  read rarely compared to how often they are written, and this way no
///  background reaper thread is needed per table.
pub struct ExpiringRegistry<K, V> {
    timeout: Duration,
    entries: Mutex<FxHashMap<K, (V, Instant)>>,
}

impl<K: Eq + Hash, V: Clone> ExpiringRegistry<K, V> {
    pub fn new(timeout: Duration) -> ExpiringRegistry<K, V> {
        ExpiringRegistry {
            timeout,
            entries: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn upsert(&self, key: K, value: V) {
        self.upsert_at(key, value, Instant::now());
    }

    pub(crate) fn upsert_at(&self, key: K, value: V, now: Instant) {
        self.entries.lock().unwrap()
            .insert(key, (value, now));
    }

    /// immediate removal, the fast path when an explicit unregistration arrives
    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.lock().unwrap()
            .remove(key)
            .map(|(value, _)| value)
    }

    pub fn matching(&self, predicate: impl Fn(&K, &V) -> bool) -> Vec<V> {
        self.matching_at(predicate, Instant::now())
    }

    pub(crate) fn matching_at(&self, predicate: impl Fn(&K, &V) -> bool, now: Instant) -> Vec<V> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries, now, self.timeout);

        entries.iter()
            .filter(|(k, (v, _))| predicate(k, v))
            .map(|(_, (v, _))| v.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len_at(Instant::now())
    }

    pub(crate) fn len_at(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries, now, self.timeout);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn sweep(entries: &mut FxHashMap<K, (V, Instant)>, now: Instant, timeout: Duration) {
        entries.retain(|_, (_, last_seen)| {
            let expired = now.duration_since(*last_seen) > timeout;
            if expired {
                debug!("evicting stale registry entry");
            }
            !expired
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> ExpiringRegistry<&'static str, u32> {
        ExpiringRegistry::new(Duration::from_secs(60))
    }

    #[test]
    fn test_upsert_and_match() {
        let registry = registry();
        registry.upsert("a", 1);
        registry.upsert("b", 2);
        registry.upsert("a", 3);

        let mut all = registry.matching(|_, _| true);
        all.sort();
        assert_eq!(all, vec![2, 3]);
        assert_eq!(registry.matching(|&k, _| k == "b"), vec![2]);
    }

    #[test]
    fn test_stale_entries_are_not_returned() {
        let registry = registry();
        let start = Instant::now();

        registry.upsert_at("a", 1, start);

        // just within the timeout: still visible
        let almost = start + Duration::from_secs(60);
        assert_eq!(registry.matching_at(|_, _| true, almost), vec![1]);

        // beyond the timeout: swept before the read returns
        let late = start + Duration::from_secs(61);
        assert!(registry.matching_at(|_, _| true, late).is_empty());
        assert_eq!(registry.len_at(late), 0);
    }

    #[test]
    fn test_refresh_keeps_an_entry_alive() {
        let registry = registry();
        let start = Instant::now();

        registry.upsert_at("a", 1, start);
        registry.upsert_at("a", 1, start + Duration::from_secs(50));

        let now = start + Duration::from_secs(90);
        assert_eq!(registry.matching_at(|_, _| true, now), vec![1]);
    }

    #[test]
    fn test_explicit_removal() {
        let registry = registry();
        registry.upsert("a", 1);

        assert_eq!(registry.remove(&"a"), Some(1));
        assert_eq!(registry.remove(&"a"), None);
        assert!(registry.is_empty());
    }
}
