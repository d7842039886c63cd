// Copyright 2024 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! A TTL cache which can be used to time out repeated operations that might
//! experience intermittent failures.

use std::{
    borrow::Borrow,
    collections::HashMap,
    hash::Hash,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::time::Instant;

const MAX_DELAY: Duration = Duration::from_secs(15 * 60);
const BASE_DELAY: Duration = Duration::from_secs(15);

/// A cache of items that failed recently, each of them is kept for a
/// duration that grows exponentially with the number of recorded failures,
/// capped at a maximum delay.
///
/// Setting the base delay and the maximum delay to the same value turns the
/// cache into a fixed backoff window.
#[derive(Debug, Clone)]
pub struct FailuresCache<T: Eq + Hash> {
    inner: Arc<InnerCache<T>>,
}

#[derive(Debug)]
struct InnerCache<T: Eq + Hash> {
    max_delay: Duration,
    base_delay: Duration,
    items: RwLock<HashMap<T, FailuresItem>>,
}

#[derive(Debug, Clone, Copy)]
struct FailuresItem {
    insertion_time: Instant,
    duration: Duration,
    failure_count: u8,
}

impl FailuresItem {
    /// Has the item expired.
    fn expired(&self) -> bool {
        self.insertion_time.elapsed() >= self.duration
    }

    /// Force the expiry of this item.
    fn expire(&mut self) {
        self.duration = Duration::ZERO;
    }
}

impl<T> FailuresCache<T>
where
    T: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_settings(MAX_DELAY, BASE_DELAY)
    }

    pub fn with_settings(max_delay: Duration, base_delay: Duration) -> Self {
        let inner =
            InnerCache { max_delay, base_delay, items: RwLock::new(HashMap::new()) };

        Self { inner: inner.into() }
    }

    /// A cache which keeps every item for the same, fixed, window.
    pub fn with_fixed_backoff(window: Duration) -> Self {
        Self::with_settings(window, window)
    }

    /// Is the given key non-expired and part of the cache.
    pub fn contains<Q>(&self, key: &Q) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let lock = self.inner.items.read().unwrap();

        lock.get(key).is_some_and(|item| !item.expired())
    }

    /// Get the failure count for a given key.
    ///
    /// Returns `None` if the key is not part of the cache or if it expired.
    pub fn failure_count<Q>(&self, key: &Q) -> Option<u8>
    where
        T: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let lock = self.inner.items.read().unwrap();

        lock.get(key).filter(|item| !item.expired()).map(|item| item.failure_count)
    }

    fn calculate_delay(&self, failure_count: u8) -> Duration {
        let multiplier = 2u32.saturating_pow(u32::from(failure_count));
        let delay = self.inner.base_delay.saturating_mul(multiplier);

        delay.clamp(self.inner.base_delay, self.inner.max_delay)
    }

    /// Add a single item to the cache.
    pub fn insert(&self, item: T) {
        self.extend([item]);
    }

    /// Extend the cache with the given iterator of items.
    ///
    /// Items that are already part of the cache, whether they are expired or
    /// not, will have their failure count bumped.
    pub fn extend(&self, iterator: impl IntoIterator<Item = T>) {
        let mut lock = self.inner.items.write().unwrap();
        let now = Instant::now();

        for key in iterator {
            let failure_count = match lock.get(&key) {
                Some(value) => value.failure_count.saturating_add(1),
                None => 0,
            };

            let duration = self.calculate_delay(failure_count);
            lock.insert(key, FailuresItem { insertion_time: now, duration, failure_count });
        }
    }

    /// Force the expiry of the given item, if it is present in the cache.
    ///
    /// This doesn't remove the item, it just marks it as expired so the
    /// failure count is kept for the next insertion.
    pub fn expire(&self, item: &T) {
        let mut lock = self.inner.items.write().unwrap();
        if let Some(value) = lock.get_mut(item) {
            value.expire();
        }
    }

    /// Remove every item from the cache.
    pub fn clear(&self) {
        self.inner.items.write().unwrap().clear();
    }
}

impl<T: Eq + Hash> Default for FailuresCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use proptest::prelude::*;

    use super::FailuresCache;

    #[tokio::test(start_paused = true)]
    async fn test_failures_cache() {
        let cache = FailuresCache::new();

        assert!(!cache.contains(&1u8));
        cache.extend([1u8]);
        assert!(cache.contains(&1u8));

        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(!cache.contains(&1u8), "the item should have expired after the base delay");

        // A second failure doubles the window.
        cache.insert(1);
        assert_eq!(cache.failure_count(&1u8), Some(1));
        tokio::time::advance(Duration::from_secs(16)).await;
        assert!(cache.contains(&1u8));
        tokio::time::advance(Duration::from_secs(15)).await;
        assert!(!cache.contains(&1u8));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_backoff_window() {
        let cache = FailuresCache::with_fixed_backoff(Duration::from_millis(5000));

        cache.insert("session");
        cache.insert("session");
        cache.insert("session");

        tokio::time::advance(Duration::from_millis(4999)).await;
        assert!(cache.contains("session"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!cache.contains("session"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expire_and_clear() {
        let cache = FailuresCache::new();
        cache.extend(["a", "b"]);

        cache.expire(&"a");
        assert!(!cache.contains("a"));
        assert!(cache.contains("b"));

        cache.clear();
        assert!(!cache.contains("b"));
        assert_eq!(cache.failure_count("b"), None);
    }

    proptest! {
        #[test]
        fn test_delay_is_bounded(failure_count in 0u8..=u8::MAX) {
            let cache: FailuresCache<u8> =
                FailuresCache::with_settings(Duration::from_secs(900), Duration::from_secs(15));
            let delay = cache.calculate_delay(failure_count);

            prop_assert!(delay >= Duration::from_secs(15));
            prop_assert!(delay <= Duration::from_secs(900));
        }
    }
}
