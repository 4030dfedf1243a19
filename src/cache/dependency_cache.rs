//! In-process query cache with table-level invalidation.
//!
//! Entries carry a category-derived TTL and the set of tables they were read
//! from. A reverse index maps each table to the keys that depend on it so a
//! committed write can drop exactly the affected entries.
//!
//! Values live in a `moka` cache with a per-entry expiry and a capacity bound.
//! The reverse index, table generations and fill epoch sit behind one mutex,
//! and every insert or removal in the store happens while that mutex is held.
//! Registration in the reverse index therefore precedes visibility of the
//! value, and an invalidation either sees the entry and removes it or runs
//! before the entry exists.
//!
//! Reads check `now - created_at < ttl` themselves on the tokio clock; moka's
//! own expiry only reclaims memory. Entries moka evicts on its own (expiry or
//! capacity) are reported by the eviction listener into a pending queue that
//! the next locked operation folds back into the reverse index.
//!
//! Fills that load from the database outside the lock use a [`FillTicket`] so
//! a load that started before an invalidation cannot store its stale result
//! afterwards.

use crate::cache::errors::CacheResult;
use crate::config::QueryCacheConfig;
use crate::logging::log_cache_operation;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// One cached query result
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub value: Value,
    pub created_at: Instant,
    pub ttl: Duration,
    pub category: String,
    pub depends_on: HashSet<String>,
}

impl CacheEntry {
    /// Valid while `now - created_at < ttl`
    pub fn is_expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) >= self.ttl
    }
}

/// Point-in-time cache counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_items: usize,
    pub hits: u64,
    pub misses: u64,
    /// Percentage of lookups served from the cache, 0.0 to 100.0
    pub hit_rate: f64,
    pub invalidations: u64,
    /// Tables with at least one dependent entry
    pub tracked_tables: usize,
}

/// Snapshot of dependency generations taken before loading a value.
///
/// Obtained from [`DependencyCache::begin_fill`] and consumed by
/// [`DependencyCache::set_with_ticket`].
#[derive(Debug, Clone)]
pub struct FillTicket {
    depends_on: Vec<String>,
    generations: Vec<u64>,
    epoch: u64,
}

impl FillTicket {
    pub fn depends_on(&self) -> &[String] {
        &self.depends_on
    }
}

type EntryStore = Cache<String, Arc<CacheEntry>>;
type Evicted = Arc<Mutex<Vec<(Arc<String>, Arc<CacheEntry>)>>>;

/// Each entry lives for its own category TTL, restarted on overwrite
struct CategoryExpiry;

impl Expiry<String, Arc<CacheEntry>> for CategoryExpiry {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _created_at: std::time::Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &Arc<CacheEntry>,
        _updated_at: std::time::Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

#[derive(Debug, Default)]
struct CacheState {
    reverse_index: HashMap<String, HashSet<String>>,
    /// Bumped on every invalidation of a table
    generations: HashMap<String, u64>,
    /// Bumped by coarse operations that may hit any table
    epoch: u64,
}

impl CacheState {
    fn generation(&self, table: &str) -> u64 {
        self.generations.get(table).copied().unwrap_or(0)
    }

    fn ticket_is_current(&self, ticket: &FillTicket) -> bool {
        ticket.epoch == self.epoch
            && ticket
                .depends_on
                .iter()
                .zip(&ticket.generations)
                .all(|(table, generation)| self.generation(table) == *generation)
    }

    fn register(&mut self, key: &str, depends_on: &HashSet<String>) {
        for table in depends_on {
            self.reverse_index
                .entry(table.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unregister<'a>(&mut self, key: &str, tables: impl Iterator<Item = &'a String>) {
        for table in tables {
            if let Some(bucket) = self.reverse_index.get_mut(table) {
                bucket.remove(key);
                if bucket.is_empty() {
                    self.reverse_index.remove(table);
                }
            }
        }
    }
}

/// Dependency-aware query cache shared by every request handler
pub struct DependencyCache {
    config: QueryCacheConfig,
    store: EntryStore,
    evicted: Evicted,
    state: Mutex<CacheState>,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl fmt::Debug for DependencyCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DependencyCache")
            .field("enabled", &self.config.enabled)
            .field("max_capacity", &self.store.policy().max_capacity())
            .field("entry_count", &self.store.entry_count())
            .field("default_ttl", &self.config.default_ttl())
            .finish()
    }
}

impl DependencyCache {
    pub fn new(config: QueryCacheConfig) -> Self {
        let evicted: Evicted = Arc::default();
        let listener_queue = Arc::clone(&evicted);
        let store = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(CategoryExpiry)
            .eviction_listener(move |key, entry, cause| {
                // Explicit removals and overwrites are unregistered by the caller
                if matches!(cause, RemovalCause::Expired | RemovalCause::Size) {
                    listener_queue.lock().push((key, entry));
                }
            })
            .build();

        debug!(
            max_entries = config.max_entries,
            default_ttl_seconds = config.default_ttl_seconds,
            "Dependency cache created"
        );

        Self {
            config,
            store,
            evicted,
            state: Mutex::new(CacheState::default()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &QueryCacheConfig {
        &self.config
    }

    /// Look up a live entry, evicting it if its TTL has passed
    pub fn get(&self, key: &str) -> Option<Value> {
        let found = if self.config.is_enabled() {
            match self.store.get(key) {
                Some(entry) if !entry.is_expired(Instant::now()) => Some(entry.value.clone()),
                Some(entry) => {
                    let mut state = self.state.lock();
                    // Only drop the entry that was seen expired, not a fresh overwrite
                    if self
                        .store
                        .get(key)
                        .is_some_and(|current| Arc::ptr_eq(&current, &entry))
                    {
                        self.remove_entry(&mut state, key);
                    }
                    debug!(key = key, "Cache entry expired");
                    None
                }
                None => None,
            }
        } else {
            None
        };

        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = key, "Cache HIT");
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key = key, "Cache MISS");
        }
        found
    }

    /// Store a value with the TTL of `category`, registering `key` under every
    /// table in `depends_on`.
    ///
    /// Only call this with data read after the last committed write to those
    /// tables; use [`get_or_load`](Self::get_or_load) when the load races
    /// with writers.
    pub fn set(&self, key: &str, value: Value, category: &str, depends_on: &[&str]) {
        if !self.config.is_enabled() {
            return;
        }
        let entry = self.build_entry(value, category, depends_on.iter().map(|t| t.to_string()));
        let ttl = entry.ttl;
        let mut state = self.state.lock();
        self.insert(&mut state, key, entry);
        drop(state);
        debug!(key = key, category = category, ttl_seconds = ttl.as_secs(), "Cache SET");
    }

    /// Snapshot the current generation of each dependency before loading
    pub fn begin_fill(&self, depends_on: &[&str]) -> FillTicket {
        let state = self.state.lock();
        FillTicket {
            depends_on: depends_on.iter().map(|t| t.to_string()).collect(),
            generations: depends_on.iter().map(|t| state.generation(t)).collect(),
            epoch: state.epoch,
        }
    }

    /// Store a loaded value unless a dependency was invalidated since the
    /// ticket was issued. Returns whether the value was stored.
    pub fn set_with_ticket(&self, key: &str, value: Value, category: &str, ticket: FillTicket) -> bool {
        if !self.config.is_enabled() {
            return false;
        }
        let mut state = self.state.lock();
        if !state.ticket_is_current(&ticket) {
            drop(state);
            debug!(key = key, "Discarding fill that raced with an invalidation");
            return false;
        }
        let entry = self.build_entry(value, category, ticket.depends_on.into_iter());
        self.insert(&mut state, key, entry);
        true
    }

    /// Read-through helper: serve from cache or run `loader` and cache its
    /// result under the fill-ticket protocol.
    pub async fn get_or_load<F, Fut, E>(
        &self,
        key: &str,
        category: &str,
        depends_on: &[&str],
        loader: F,
    ) -> Result<Value, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let ticket = self.begin_fill(depends_on);
        let value = loader().await?;
        self.set_with_ticket(key, value.clone(), category, ticket);
        Ok(value)
    }

    /// Typed lookup through `serde_json`
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        self.get(key)
            .map(|value| serde_json::from_value(value).map_err(Into::into))
            .transpose()
    }

    /// Typed store through `serde_json`
    pub fn set_as<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        category: &str,
        depends_on: &[&str],
    ) -> CacheResult<()> {
        let value = serde_json::to_value(value)?;
        self.set(key, value, category, depends_on);
        Ok(())
    }

    /// Drop every entry registered against `table`. Call only after the write
    /// to `table` has committed.
    pub fn invalidate_table(&self, table: &str) -> usize {
        let removed = {
            let mut state = self.state.lock();
            *state.generations.entry(table.to_string()).or_insert(0) += 1;
            let keys = state.reverse_index.remove(table).unwrap_or_default();
            keys.iter()
                .filter(|key| self.remove_entry(&mut state, key))
                .count()
        };
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        log_cache_operation("invalidate_table", table, removed, None);
        removed
    }

    /// Drop every entry whose key contains `substring`
    pub fn invalidate_pattern(&self, substring: &str) -> usize {
        let removed = {
            let mut state = self.state.lock();
            state.epoch += 1;
            let keys: Vec<Arc<String>> = self
                .store
                .iter()
                .filter(|(key, _)| key.contains(substring))
                .map(|(key, _)| key)
                .collect();
            keys.iter()
                .filter(|key| self.remove_entry(&mut state, key))
                .count()
        };
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        log_cache_operation("invalidate_pattern", substring, removed, None);
        removed
    }

    /// Drop a single entry
    pub fn invalidate_key(&self, key: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            self.remove_entry(&mut state, key)
        };
        if removed {
            self.invalidations.fetch_add(1, Ordering::Relaxed);
            debug!(key = key, "Cache DEL");
        }
        removed
    }

    /// Sweep every expired entry. Reads already evict lazily; this bounds
    /// memory for keys that are never read again.
    pub fn purge_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let expired: Vec<Arc<String>> = self
            .store
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key)
            .collect();
        for key in &expired {
            self.remove_entry(&mut state, key);
        }
        self.absorb_evictions(&mut state);
        if !expired.is_empty() {
            debug!(purged = expired.len(), "Purged expired cache entries");
        }
        expired.len()
    }

    /// Drop everything. Counters are kept.
    pub fn clear(&self) {
        let removed = {
            let mut state = self.state.lock();
            let count = self.store.iter().count();
            self.store.invalidate_all();
            state.reverse_index.clear();
            state.epoch += 1;
            self.evicted.lock().clear();
            count
        };
        log_cache_operation("clear", "*", removed, None);
    }

    /// Keys currently registered against `table`
    pub fn dependents_of(&self, table: &str) -> Vec<String> {
        let mut state = self.state.lock();
        self.absorb_evictions(&mut state);
        state
            .reverse_index
            .get(table)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> CacheStats {
        self.store.run_pending_tasks();
        let (total_items, tracked_tables) = {
            let mut state = self.state.lock();
            self.absorb_evictions(&mut state);
            (self.store.entry_count() as usize, state.reverse_index.len())
        };
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups > 0 {
            (hits as f64 / lookups as f64) * 100.0
        } else {
            0.0
        };

        CacheStats {
            total_items,
            hits,
            misses,
            hit_rate,
            invalidations: self.invalidations.load(Ordering::Relaxed),
            tracked_tables,
        }
    }

    /// Register first, then publish; both under the state lock
    fn insert(&self, state: &mut CacheState, key: &str, entry: CacheEntry) {
        self.remove_entry(state, key);
        state.register(key, &entry.depends_on);
        self.store.insert(key.to_string(), Arc::new(entry));
        self.absorb_evictions(state);
    }

    /// Remove an entry and every reverse-index registration pointing at it
    fn remove_entry(&self, state: &mut CacheState, key: &str) -> bool {
        match self.store.remove(key) {
            Some(entry) => {
                state.unregister(key, entry.depends_on.iter());
                true
            }
            None => false,
        }
    }

    /// Fold entries moka evicted on its own back into the reverse index
    fn absorb_evictions(&self, state: &mut CacheState) {
        let evicted = std::mem::take(&mut *self.evicted.lock());
        for (key, entry) in evicted {
            match self.store.get(key.as_str()) {
                // Re-inserted since; keep the tables the live entry still needs
                Some(current) => state.unregister(
                    &key,
                    entry
                        .depends_on
                        .iter()
                        .filter(|table| !current.depends_on.contains(*table)),
                ),
                None => state.unregister(&key, entry.depends_on.iter()),
            }
        }
    }

    fn build_entry(
        &self,
        value: Value,
        category: &str,
        depends_on: impl Iterator<Item = String>,
    ) -> CacheEntry {
        CacheEntry {
            value,
            created_at: Instant::now(),
            ttl: self.config.ttl_for(category),
            category: category.to_string(),
            depends_on: depends_on.collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Arc;

    fn cache() -> DependencyCache {
        DependencyCache::new(QueryCacheConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_orders_entry_expires_after_ten_seconds() {
        let cache = cache();
        cache.set("orders_open", json!([1, 2]), "orders", &["orders"]);

        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("orders_open"), Some(json!([1, 2])));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get("orders_open"), None);

        // Lazy eviction also cleans the reverse index
        assert!(cache.dependents_of("orders").is_empty());
        assert_eq!(cache.stats().total_items, 0);
    }

    #[test]
    fn test_invalidate_table_drops_entry_and_bucket() {
        let cache = cache();
        cache.set("products_1", json!({"id": 1}), "products", &["products"]);

        let removed = cache.invalidate_table("products");

        assert_eq!(removed, 1);
        assert_eq!(cache.get("products_1"), None);
        assert!(cache.dependents_of("products").is_empty());
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_invalidation_is_isolated_per_table() {
        let cache = cache();
        cache.set("products_1", json!({"id": 1}), "products", &["products"]);
        cache.set("orders_7", json!({"id": 7}), "orders", &["orders"]);

        cache.invalidate_table("orders");

        assert_eq!(cache.get("products_1"), Some(json!({"id": 1})));
        assert_eq!(cache.get("orders_7"), None);
    }

    #[test]
    fn test_multi_table_entry_leaves_no_dangling_keys() {
        let cache = cache();
        cache.set("menu_full", json!([]), "menu", &["products", "categories"]);

        cache.invalidate_table("categories");

        assert!(cache.dependents_of("products").is_empty());
        assert_eq!(cache.stats().tracked_tables, 0);
    }

    #[test]
    fn test_overwrite_replaces_dependencies() {
        let cache = cache();
        cache.set("report", json!(1), "menu", &["products"]);
        cache.set("report", json!(2), "menu", &["orders"]);

        assert_eq!(cache.invalidate_table("products"), 0);
        assert_eq!(cache.get("report"), Some(json!(2)));
    }

    #[test]
    fn test_invalidate_pattern() {
        let cache = cache();
        cache.set("table_1_status", json!("free"), "tables", &["tables"]);
        cache.set("table_2_status", json!("busy"), "tables", &["tables"]);
        cache.set("menu_all", json!([]), "menu", &["products"]);

        assert_eq!(cache.invalidate_pattern("table_"), 2);
        assert_eq!(cache.stats().total_items, 1);
        assert!(cache.dependents_of("tables").is_empty());
    }

    #[test]
    fn test_hit_rate_and_counters() {
        let cache = cache();
        cache.set("categories", json!(["drinks"]), "categories", &["categories"]);

        cache.get("categories");
        cache.get("categories");
        cache.get("categories");
        cache.get("missing");

        let stats = cache.stats();
        assert_eq!(stats.hits, 3);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 75.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_stale_fill_is_discarded() {
        let cache = cache();
        let ticket = cache.begin_fill(&["products"]);

        // A write commits while the load is in flight
        cache.invalidate_table("products");

        assert!(!cache.set_with_ticket("products_1", json!("old"), "products", ticket));
        assert_eq!(cache.get("products_1"), None);

        let fresh = cache.begin_fill(&["products"]);
        assert!(cache.set_with_ticket("products_1", json!("new"), "products", fresh));
        assert_eq!(cache.get("products_1"), Some(json!("new")));
    }

    #[test]
    fn test_clear_invalidates_outstanding_tickets() {
        let cache = cache();
        let ticket = cache.begin_fill(&["orders"]);
        cache.clear();
        assert!(!cache.set_with_ticket("orders_1", json!(1), "orders", ticket));
    }

    #[tokio::test]
    async fn test_get_or_load_reads_through_once() {
        let cache = Arc::new(cache());
        let loads = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let loads = Arc::clone(&loads);
            let value = cache
                .get_or_load("categories_all", "categories", &["categories"], || async move {
                    loads.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, String>(json!(["starters", "mains"]))
                })
                .await
                .unwrap();
            assert_eq!(value, json!(["starters", "mains"]));
        }

        assert_eq!(loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_get_or_load_propagates_loader_error() {
        let cache = cache();
        let result = cache
            .get_or_load("orders_1", "orders", &["orders"], || async {
                Err::<Value, _>("Lost connection to MySQL server".to_string())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(cache.stats().total_items, 0);
    }

    #[test]
    fn test_typed_helpers() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct MenuItem {
            id: u32,
            name: String,
        }

        let cache = cache();
        let item = MenuItem {
            id: 4,
            name: "Margherita".to_string(),
        };
        cache.set_as("product_4", &item, "products", &["products"]).unwrap();

        let cached: Option<MenuItem> = cache.get_as("product_4").unwrap();
        assert_eq!(cached, Some(item));

        cache.set("bad", json!("not an item"), "products", &[]);
        assert!(cache.get_as::<MenuItem>("bad").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let cache = cache();
        cache.set("orders_1", json!(1), "orders", &["orders"]);
        cache.set("categories", json!([]), "categories", &["categories"]);

        tokio::time::advance(Duration::from_secs(11)).await;

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.stats().total_items, 1);
        assert!(cache.dependents_of("orders").is_empty());
    }

    #[test]
    fn test_capacity_eviction_cleans_reverse_index() {
        let cache = DependencyCache::new(QueryCacheConfig {
            max_entries: 4,
            ..Default::default()
        });
        for i in 0..50 {
            let key = format!("table_{i}");
            cache.set(&key, json!(i), "tables", &[key.as_str()]);
        }

        let stats = cache.stats();
        assert!(stats.total_items <= 4);
        assert_eq!(stats.tracked_tables, stats.total_items);
        for i in 0..50 {
            let key = format!("table_{i}");
            let registered = cache.dependents_of(&key).contains(&key);
            assert_eq!(registered, cache.get(&key).is_some(), "{key}");
        }
    }

    #[test]
    fn test_visible_entry_is_always_registered() {
        let cache = Arc::new(cache());
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..500 {
                    cache.set(&format!("order_{i}"), json!(i), "orders", &["orders", "tables"]);
                }
            })
        };

        let mut seen = 0;
        while seen < 500 {
            let key = format!("order_{seen}");
            if cache.get(&key).is_some() {
                assert!(cache.dependents_of("orders").contains(&key));
                assert!(cache.dependents_of("tables").contains(&key));
                seen += 1;
            } else if writer.is_finished() && cache.get(&key).is_none() {
                panic!("{key} was never stored");
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_disabled_cache_stores_nothing() {
        let cache = DependencyCache::new(QueryCacheConfig {
            enabled: false,
            ..Default::default()
        });
        cache.set("products_1", json!(1), "products", &["products"]);
        assert_eq!(cache.get("products_1"), None);
        assert_eq!(cache.stats().misses, 1);
    }
}
