//! Tiered cache of recently observed messages.
//!
//! New entries land in the cold tier. An entry read often enough is promoted
//! into the hot tier, which has a smaller capacity and a longer TTL. The
//! protocol layer reads this cache to answer message-retrieval requests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default cold tier capacity.
pub const DEFAULT_COLD_CAPACITY: usize = 5000;
/// Default cold tier TTL (5 minutes).
pub const DEFAULT_COLD_TTL: Duration = Duration::from_secs(5 * 60);
/// Default hot tier capacity.
pub const DEFAULT_HOT_CAPACITY: usize = 1000;
/// Default hot tier TTL (30 minutes).
pub const DEFAULT_HOT_TTL: Duration = Duration::from_secs(30 * 60);
/// Cold reads before an entry is promoted.
pub const DEFAULT_PROMOTE_AFTER: u32 = 3;
/// Default interval between sweeps (30 minutes).
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);
/// Default sweep horizon (24 hours).
pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

// ============================================================================
// Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub cold_capacity: usize,
    pub cold_ttl: Duration,
    pub hot_capacity: usize,
    pub hot_ttl: Duration,
    pub promote_after: u32,
    pub sweep_interval: Duration,
    pub max_age: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cold_capacity: DEFAULT_COLD_CAPACITY,
            cold_ttl: DEFAULT_COLD_TTL,
            hot_capacity: DEFAULT_HOT_CAPACITY,
            hot_ttl: DEFAULT_HOT_TTL,
            promote_after: DEFAULT_PROMOTE_AFTER,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheTier {
    Cold,
    Hot,
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub message_id: String,
    /// Serialized message, opaque to the cache.
    pub payload: String,
    pub cached_at: Instant,
    pub access_count: u32,
    pub tier: CacheTier,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub cold_hits: u64,
    pub misses: u64,
    pub promotions: u64,
    pub evictions: u64,
    pub hot_entries: usize,
    pub cold_entries: usize,
}

// ============================================================================
// Tier
// ============================================================================

struct Tier {
    entries: HashMap<String, CacheEntry>,
    capacity: usize,
    ttl: Duration,
}

impl Tier {
    fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            ttl,
        }
    }

    fn is_expired(&self, entry: &CacheEntry, now: Instant) -> bool {
        now.duration_since(entry.cached_at) > self.ttl
    }

    /// Make room for one entry. Expired entries go first, then the oldest.
    ///
    /// Returns the number of entries evicted.
    fn make_room(&mut self, now: Instant) -> u64 {
        if self.entries.len() < self.capacity {
            return 0;
        }

        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.cached_at) <= ttl);
        let mut evicted = (before - self.entries.len()) as u64;

        while self.capacity > 0 && self.entries.len() >= self.capacity {
            let Some(oldest) = self
                .entries
                .values()
                .min_by_key(|entry| entry.cached_at)
                .map(|entry| entry.message_id.clone())
            else {
                break;
            };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    fn insert(&mut self, entry: CacheEntry, now: Instant) -> u64 {
        let evicted = self.make_room(now);
        if self.capacity > 0 {
            self.entries.insert(entry.message_id.clone(), entry);
        }
        evicted
    }
}

struct CacheInner {
    cold: Tier,
    hot: Tier,
    stats: CacheStats,
}

// ============================================================================
// MessageCache
// ============================================================================

/// Two-tier message cache shared by every session.
///
/// Cloning shares the underlying storage.
#[derive(Clone)]
pub struct MessageCache {
    inner: Arc<Mutex<CacheInner>>,
    config: CacheConfig,
}

impl Default for MessageCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

impl MessageCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(CacheInner {
                cold: Tier::new(config.cold_capacity, config.cold_ttl),
                hot: Tier::new(config.hot_capacity, config.hot_ttl),
                stats: CacheStats::default(),
            })),
            config,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Store a payload in the cold tier, replacing any entry with the same id.
    pub async fn save(&self, message_id: &str, payload: impl Into<String>) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        inner.hot.entries.remove(message_id);
        inner.cold.entries.remove(message_id);

        let entry = CacheEntry {
            message_id: message_id.to_string(),
            payload: payload.into(),
            cached_at: now,
            access_count: 0,
            tier: CacheTier::Cold,
        };
        let evicted = inner.cold.insert(entry, now);
        inner.stats.evictions += evicted;
    }

    /// Serialize `value` as JSON and store it.
    pub async fn save_json<T: Serialize>(
        &self,
        message_id: &str,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let payload = serde_json::to_string(value)?;
        self.save(message_id, payload).await;
        Ok(())
    }

    /// Look up a payload, hot tier first.
    ///
    /// Cold hits count towards promotion. Expired entries are dropped and
    /// count as misses.
    pub async fn get(&self, message_id: &str) -> Option<String> {
        let now = Instant::now();
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        if let Some(entry) = inner.hot.entries.get(message_id) {
            if !inner.hot.is_expired(entry, now) {
                let payload = entry.payload.clone();
                if let Some(entry) = inner.hot.entries.get_mut(message_id) {
                    entry.access_count = entry.access_count.saturating_add(1);
                }
                inner.stats.hot_hits += 1;
                return Some(payload);
            }
            inner.hot.entries.remove(message_id);
            inner.stats.evictions += 1;
        }

        let Some(mut entry) = inner.cold.entries.remove(message_id) else {
            inner.stats.misses += 1;
            return None;
        };
        if inner.cold.is_expired(&entry, now) {
            inner.stats.evictions += 1;
            inner.stats.misses += 1;
            return None;
        }

        inner.stats.cold_hits += 1;
        entry.access_count = entry.access_count.saturating_add(1);
        let payload = entry.payload.clone();

        if entry.access_count >= self.config.promote_after && self.config.hot_capacity > 0 {
            entry.tier = CacheTier::Hot;
            entry.cached_at = now;
            let evicted = inner.hot.insert(entry, now);
            inner.stats.evictions += evicted;
            inner.stats.promotions += 1;
            debug!(message_id = %message_id, "Promoted message to hot tier");
        } else {
            inner.cold.entries.insert(message_id.to_string(), entry);
        }

        Some(payload)
    }

    /// Look up a payload and parse it as JSON.
    pub async fn get_json<T: DeserializeOwned>(&self, message_id: &str) -> Option<T> {
        let payload = self.get(message_id).await?;
        match serde_json::from_str(&payload) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(message_id = %message_id, error = %e, "Cached payload is not valid JSON");
                None
            }
        }
    }

    /// Which tier currently holds `message_id`, without counting an access.
    pub async fn tier_of(&self, message_id: &str) -> Option<CacheTier> {
        let inner = self.inner.lock().await;
        if inner.hot.entries.contains_key(message_id) {
            Some(CacheTier::Hot)
        } else if inner.cold.entries.contains_key(message_id) {
            Some(CacheTier::Cold)
        } else {
            None
        }
    }

    pub async fn delete(&self, message_id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let hot = inner.hot.entries.remove(message_id).is_some();
        let cold = inner.cold.entries.remove(message_id).is_some();
        hot || cold
    }

    pub async fn clear(&self) {
        let mut inner = self.inner.lock().await;
        inner.hot.entries.clear();
        inner.cold.entries.clear();
    }

    /// Evict cold entries older than the configured horizon or whose payload
    /// no longer parses as JSON. Expired entries of either tier go too.
    ///
    /// Returns the number of entries evicted.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let max_age = self.config.max_age;
        let mut guard = self.inner.lock().await;
        let inner = &mut *guard;

        let before = inner.cold.entries.len() + inner.hot.entries.len();
        let cold_ttl = inner.cold.ttl;
        inner.cold.entries.retain(|_, entry| {
            let age = now.duration_since(entry.cached_at);
            age <= max_age
                && age <= cold_ttl
                && serde_json::from_str::<serde_json::Value>(&entry.payload).is_ok()
        });
        let hot_ttl = inner.hot.ttl;
        inner
            .hot
            .entries
            .retain(|_, entry| now.duration_since(entry.cached_at) <= hot_ttl);

        let evicted = before - (inner.cold.entries.len() + inner.hot.entries.len());
        inner.stats.evictions += evicted as u64;
        evicted
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            hot_entries: inner.hot.entries.len(),
            cold_entries: inner.cold.entries.len(),
            ..inner.stats
        }
    }

    pub async fn len(&self) -> usize {
        let inner = self.inner.lock().await;
        inner.hot.entries.len() + inner.cold.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Spawn a task that sweeps on the configured interval.
    ///
    /// The task stops once `shutdown` flips to `true`.
    pub fn spawn_sweep_task(
        self,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let evicted = self.sweep().await;
                        if evicted > 0 {
                            let remaining = self.len().await;
                            debug!(evicted, remaining, "Swept message cache");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}
