//! Cache storage.
//!
//! `CacheStore` is the contract the middleware speaks; `MemoryStore` is the
//! bundled LRU+TTL backend with per-key single-flight on misses.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use dashmap::DashMap;
use futures::future::BoxFuture;
use lru::LruCache;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::lock::{rw_read, rw_write};
use crate::telemetry::{METRIC_CACHE_EVICT, METRIC_CACHE_STORE, METRIC_CACHE_STORE_ERROR};

const SOURCE: &str = "store";

// Fallback expiry for TTLs beyond Instant's range.
const MAX_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Stored snapshot of a rendered page.
#[derive(Clone)]
pub struct CachedPage {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl CachedPage {
    /// Snapshot response parts, keeping only headers with UTF-8 values.
    pub fn new(status: StatusCode, headers: &HeaderMap, body: Bytes) -> Self {
        Self {
            status: status.as_u16(),
            headers: headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|text| (name.to_string(), text.to_string()))
                })
                .collect(),
            body,
        }
    }
}

/// Outcome of executing the handler for a cache miss.
pub enum Computed {
    /// The response may be cached; `page` is the snapshot to store.
    Cacheable { page: CachedPage, response: Response },
    /// The response must be served without storing anything.
    Uncacheable(Response),
}

/// Result of a [`CacheStore::compute_if_absent`] round trip.
pub enum Fetched {
    /// Page served from the store; the handler never ran.
    Hit(CachedPage),
    /// Response computed by the handler on this request.
    Fresh(Response),
}

/// Deferred handler execution handed to the store on a miss.
pub type PageSupplier = BoxFuture<'static, Computed>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cache backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend(message.into())
    }
}

/// Storage backend for cached pages.
///
/// Implementations provide `get` and `put`; the provided `compute_if_absent`
/// composes them with the cache's failure policy. Backends with a native
/// single-flight or get-or-set primitive should override it.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<CachedPage>, StoreError>;

    async fn put(&self, key: &str, page: CachedPage, ttl: Duration) -> Result<(), StoreError>;

    /// Serve `key` from the store or run `supplier` and store its result.
    ///
    /// Read failures are logged and treated as a miss; write failures are
    /// logged and the computed response is served anyway. Concurrent misses
    /// for one key may each run their supplier; the last write wins.
    async fn compute_if_absent(&self, key: &str, ttl: Duration, supplier: PageSupplier) -> Fetched {
        match self.get(key).await {
            Ok(Some(page)) => return Fetched::Hit(page),
            Ok(None) => {}
            Err(error) => {
                warn!(key, error = %error, "cache read failed, treating as miss");
                counter!(METRIC_CACHE_STORE_ERROR).increment(1);
            }
        }

        match supplier.await {
            Computed::Cacheable { page, response } => {
                store_page(self, key, page, ttl).await;
                Fetched::Fresh(response)
            }
            Computed::Uncacheable(response) => Fetched::Fresh(response),
        }
    }
}

/// Write a computed page, logging instead of failing when the backend errors.
async fn store_page<S: CacheStore + ?Sized>(store: &S, key: &str, page: CachedPage, ttl: Duration) {
    match store.put(key, page, ttl).await {
        Ok(()) => {
            counter!(METRIC_CACHE_STORE).increment(1);
        }
        Err(error) => {
            warn!(key, error = %error, "cache write failed, serving uncached response");
            counter!(METRIC_CACHE_STORE_ERROR).increment(1);
        }
    }
}

struct StoredEntry {
    page: CachedPage,
    expires_at: Instant,
}

/// In-memory page store with LRU eviction and lazy TTL expiry.
///
/// `compute_if_absent` serializes concurrent misses for the same key, so the
/// handler runs at most once per key per TTL window in a single process.
pub struct MemoryStore {
    pages: RwLock<LruCache<String, StoredEntry>>,
    flights: DashMap<String, Arc<Mutex<()>>>,
}

impl MemoryStore {
    /// Create a store sized by the configured capacity.
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            pages: RwLock::new(LruCache::new(config.capacity_non_zero())),
            flights: DashMap::new(),
        }
    }

    /// Number of stored pages, counting entries that expired but were not
    /// read since.
    pub fn len(&self) -> usize {
        rw_read(&self.pages, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-key entry in the flight map, removed on drop so a panicking supplier
/// cannot strand the key's mutex.
struct FlightGuard<'a> {
    flights: &'a DashMap<String, Arc<Mutex<()>>>,
    key: &'a str,
    flight: Arc<Mutex<()>>,
}

impl<'a> FlightGuard<'a> {
    fn enter(flights: &'a DashMap<String, Arc<Mutex<()>>>, key: &'a str) -> Self {
        let flight = {
            let entry = flights
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            Arc::clone(entry.value())
        };
        Self { flights, key, flight }
    }

    async fn lock(&self) -> MutexGuard<'_, ()> {
        self.flight.lock().await
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        // Two references are always live here: the map's and this guard's
        self.flights
            .remove_if(self.key, |_, flight| Arc::strong_count(flight) <= 2);
    }
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<CachedPage>, StoreError> {
        let mut pages = rw_write(&self.pages, SOURCE, "get");

        let page = match pages.get(key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.page.clone()),
            Some(_) => None,
            None => return Ok(None),
        };

        if page.is_none() {
            // Expired entries surface as misses and are dropped on read
            pages.pop(key);
        }

        Ok(page)
    }

    async fn put(&self, key: &str, page: CachedPage, ttl: Duration) -> Result<(), StoreError> {
        let now = Instant::now();
        let entry = StoredEntry {
            page,
            expires_at: now.checked_add(ttl).unwrap_or_else(|| now + MAX_TTL),
        };

        let evicted = rw_write(&self.pages, SOURCE, "put")
            .push(key.to_string(), entry)
            .map(|(evicted_key, _)| evicted_key);

        if let Some(evicted_key) = evicted {
            // push also returns the old pair when replacing the same key
            if evicted_key != key {
                debug!(key = %evicted_key, "evicted cached page at capacity");
                counter!(METRIC_CACHE_EVICT).increment(1);
            }
        }

        Ok(())
    }

    async fn compute_if_absent(&self, key: &str, ttl: Duration, supplier: PageSupplier) -> Fetched {
        if let Ok(Some(page)) = self.get(key).await {
            return Fetched::Hit(page);
        }

        let flight = FlightGuard::enter(&self.flights, key);
        let _permit = flight.lock().await;

        // Another flight may have stored the page while we waited
        if let Ok(Some(page)) = self.get(key).await {
            return Fetched::Hit(page);
        }

        match supplier.await {
            Computed::Cacheable { page, response } => {
                store_page(self, key, page, ttl).await;
                Fetched::Fresh(response)
            }
            Computed::Uncacheable(response) => Fetched::Fresh(response),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn sample_page(body: &str) -> CachedPage {
        CachedPage {
            status: 200,
            headers: vec![("content-type".to_string(), "text/html".to_string())],
            body: Bytes::from(body.to_string()),
        }
    }

    fn store_with_capacity(capacity: usize) -> MemoryStore {
        MemoryStore::new(&CacheConfig {
            capacity,
            ..Default::default()
        })
    }

    fn supplier_counting(calls: Arc<AtomicUsize>, body: &'static str) -> PageSupplier {
        Box::pin(async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Computed::Cacheable {
                page: sample_page(body),
                response: Response::new(axum::body::Body::from(body)),
            }
        })
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = store_with_capacity(10);

        assert!(store.get("html_example_en").await.unwrap().is_none());

        store
            .put("html_example_en", sample_page("Hello"), Duration::from_secs(60))
            .await
            .unwrap();

        let cached = store.get("html_example_en").await.unwrap().expect("cached page");
        assert_eq!(cached.status, 200);
        assert_eq!(cached.body, Bytes::from("Hello"));
    }

    #[tokio::test]
    async fn expired_pages_read_as_misses() {
        let store = store_with_capacity(10);

        store
            .put("html_example_en", sample_page("Hello"), Duration::from_millis(10))
            .await
            .unwrap();
        assert!(store.get("html_example_en").await.unwrap().is_some());

        tokio::time::sleep(Duration::from_millis(30)).await;

        assert!(store.get("html_example_en").await.unwrap().is_none());
        // The read dropped the expired entry
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn absurd_ttls_store_without_overflow() {
        let store = store_with_capacity(10);

        store
            .put(
                "html_example_en",
                sample_page("Hello"),
                Duration::from_secs(u64::MAX),
            )
            .await
            .unwrap();

        assert!(store.get("html_example_en").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn capacity_overflow_evicts_the_oldest_page() {
        let store = store_with_capacity(2);
        let ttl = Duration::from_secs(60);

        store.put("html_one_en", sample_page("1"), ttl).await.unwrap();
        store.put("html_two_en", sample_page("2"), ttl).await.unwrap();
        store.put("html_three_en", sample_page("3"), ttl).await.unwrap();

        assert!(store.get("html_one_en").await.unwrap().is_none());
        assert!(store.get("html_two_en").await.unwrap().is_some());
        assert!(store.get("html_three_en").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn replacing_a_key_keeps_a_single_entry() {
        let store = store_with_capacity(10);
        let ttl = Duration::from_secs(60);

        store.put("html_example_en", sample_page("old"), ttl).await.unwrap();
        store.put("html_example_en", sample_page("new"), ttl).await.unwrap();

        assert_eq!(store.len(), 1);
        let cached = store.get("html_example_en").await.unwrap().expect("cached page");
        assert_eq!(cached.body, Bytes::from("new"));
    }

    #[tokio::test]
    async fn compute_if_absent_serves_hits_without_the_supplier() {
        let store = store_with_capacity(10);
        let ttl = Duration::from_secs(60);
        store.put("html_example_en", sample_page("Hello"), ttl).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = store
            .compute_if_absent("html_example_en", ttl, supplier_counting(Arc::clone(&calls), "x"))
            .await;

        assert!(matches!(fetched, Fetched::Hit(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn compute_if_absent_stores_cacheable_results() {
        let store = store_with_capacity(10);
        let calls = Arc::new(AtomicUsize::new(0));

        let fetched = store
            .compute_if_absent(
                "html_example_en",
                Duration::from_secs(60),
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;

        assert!(matches!(fetched, Fetched::Fresh(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let cached = store.get("html_example_en").await.unwrap().expect("stored page");
        assert_eq!(cached.body, Bytes::from("Hello"));
    }

    #[tokio::test]
    async fn compute_if_absent_skips_storage_for_uncacheable_results() {
        let store = store_with_capacity(10);

        let fetched = store
            .compute_if_absent(
                "html_example_en",
                Duration::from_secs(60),
                Box::pin(async {
                    Computed::Uncacheable(Response::new(axum::body::Body::from("nope")))
                }),
            )
            .await;

        assert!(matches!(fetched, Fetched::Fresh(_)));
        assert!(store.get("html_example_en").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_misses_run_the_supplier_once() {
        let store = Arc::new(store_with_capacity(10));
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let slow_supplier = || -> PageSupplier {
            let calls = Arc::clone(&calls);
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Computed::Cacheable {
                    page: sample_page("Hello"),
                    response: Response::new(axum::body::Body::from("Hello")),
                }
            })
        };

        let first = store.compute_if_absent("html_example_en", ttl, slow_supplier());
        let second = store.compute_if_absent("html_example_en", ttl, slow_supplier());
        let (first, second) = tokio::join!(first, second);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let hits = [first, second]
            .iter()
            .filter(|fetched| matches!(fetched, Fetched::Hit(_)))
            .count();
        assert_eq!(hits, 1);
    }

    #[tokio::test]
    async fn finished_flights_release_their_locks() {
        let store = store_with_capacity(10);
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .compute_if_absent(
                "html_example_en",
                Duration::from_secs(60),
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;

        assert!(store.flights.is_empty());
    }

    #[tokio::test]
    async fn panicking_suppliers_release_their_flight_entry() {
        let store = Arc::new(store_with_capacity(10));

        let crashing = Arc::clone(&store);
        let crashed = tokio::spawn(async move {
            crashing
                .compute_if_absent(
                    "html_example_en",
                    Duration::from_secs(60),
                    Box::pin(async { panic!("supplier blew up") }),
                )
                .await
        })
        .await;
        assert!(crashed.is_err());

        // The flight entry did not outlive the panic
        assert!(store.flights.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let fetched = store
            .compute_if_absent(
                "html_example_en",
                Duration::from_secs(60),
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;

        assert!(matches!(fetched, Fetched::Fresh(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = store_with_capacity(10);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.pages.write().expect("pages lock should be acquired");
            panic!("poison pages lock");
        }));

        assert_eq!(store.len(), 0);
    }

    // Minimal backend that leaves compute_if_absent to the trait default.
    struct MapStore {
        pages: std::sync::Mutex<HashMap<String, CachedPage>>,
    }

    #[async_trait]
    impl CacheStore for MapStore {
        async fn get(&self, key: &str) -> Result<Option<CachedPage>, StoreError> {
            Ok(self.pages.lock().unwrap().get(key).cloned())
        }

        async fn put(&self, key: &str, page: CachedPage, _ttl: Duration) -> Result<(), StoreError> {
            self.pages.lock().unwrap().insert(key.to_string(), page);
            Ok(())
        }
    }

    #[tokio::test]
    async fn default_compute_if_absent_composes_get_and_put() {
        let store = MapStore {
            pages: std::sync::Mutex::new(HashMap::new()),
        };
        let calls = Arc::new(AtomicUsize::new(0));
        let ttl = Duration::from_secs(60);

        let first = store
            .compute_if_absent(
                "html_example_en",
                ttl,
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;
        let second = store
            .compute_if_absent(
                "html_example_en",
                ttl,
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;

        assert!(matches!(first, Fetched::Fresh(_)));
        assert!(matches!(second, Fetched::Hit(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    // Backend whose reads and writes always fail.
    struct FailingStore;

    #[async_trait]
    impl CacheStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<CachedPage>, StoreError> {
            Err(StoreError::backend("read refused"))
        }

        async fn put(
            &self,
            _key: &str,
            _page: CachedPage,
            _ttl: Duration,
        ) -> Result<(), StoreError> {
            Err(StoreError::backend("write refused"))
        }
    }

    #[tokio::test]
    async fn backend_failures_still_serve_the_computed_response() {
        let calls = Arc::new(AtomicUsize::new(0));

        let fetched = FailingStore
            .compute_if_absent(
                "html_example_en",
                Duration::from_secs(60),
                supplier_counting(Arc::clone(&calls), "Hello"),
            )
            .await;

        assert!(matches!(fetched, Fetched::Fresh(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
