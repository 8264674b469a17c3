//! Result caching with single-flight deduplication.
//!
//! SELECT-class results are memoised by fingerprint in an LRU store with
//! TTL expiry (lazy on read plus a periodic sweep). `get_or_build`
//! guarantees at most one concurrent build per fingerprint: concurrent
//! callers wait on the in-flight build, bounded by a wait timeout, and
//! fall through to unsupervised execution when the wait expires. Error
//! results and non-SELECT statements are never cached.

mod key;

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use sqlgate_error::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use key::{canonical_query, fingerprint};

use crate::config::CacheSettings;

/// A cached, already-masked result payload.
#[derive(Debug, Clone)]
pub struct CachedResult {
    /// Result column names.
    pub columns: Vec<String>,
    /// Masked result rows.
    pub rows: Vec<Vec<JsonValue>>,
    /// Row count reported to the client.
    pub rowcount: u64,
    /// Whether masking modified the result.
    pub masked: bool,
    /// Columns that were masked.
    pub masked_columns: Vec<String>,
}

struct Entry {
    value:      Arc<CachedResult>,
    expires_at: Instant,
}

/// Cache counters for observability.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    /// Lookups that returned a live entry.
    pub hits: AtomicU64,
    /// Lookups that found nothing (or an expired entry).
    pub misses: AtomicU64,
    /// Entries stored.
    pub insertions: AtomicU64,
    /// Entries removed by lazy expiry or the sweeper.
    pub evictions: AtomicU64,
    /// Callers that waited on another caller's in-flight build.
    pub flight_waits: AtomicU64,
}

struct Flight {
    done: Notify,
}

/// Fingerprint-keyed result cache with single-flight builds.
pub struct ResultCache {
    settings: CacheSettings,
    store:    Mutex<LruCache<String, Entry>>,
    flights:  DashMap<String, Arc<Flight>>,
    metrics:  CacheMetrics,
}

impl ResultCache {
    /// Cache with the given settings.
    ///
    /// # Panics
    ///
    /// Panics if `max_entries` is zero.
    #[must_use]
    pub fn new(settings: CacheSettings) -> Self {
        let capacity = NonZeroUsize::new(settings.max_entries.max(1))
            .expect("max(1) keeps capacity non-zero");
        Self {
            settings,
            store: Mutex::new(LruCache::new(capacity)),
            flights: DashMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Look up a fingerprint, evicting the entry lazily when expired.
    #[must_use]
    pub fn get(&self, fp: &str) -> Option<Arc<CachedResult>> {
        if !self.settings.enabled {
            return None;
        }
        let mut store = self.store.lock();
        match store.get(fp) {
            Some(entry) if entry.expires_at > Instant::now() => {
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.value))
            },
            Some(_) => {
                store.pop(fp);
                self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
            None => {
                self.metrics.misses.fetch_add(1, Ordering::Relaxed);
                None
            },
        }
    }

    /// Store a value under a fingerprint.
    pub fn put(&self, fp: &str, value: Arc<CachedResult>, ttl: Option<Duration>) {
        if !self.settings.enabled {
            return;
        }
        let ttl = ttl.unwrap_or(Duration::from_secs(self.settings.ttl_seconds));
        self.store.lock().put(
            fp.to_string(),
            Entry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        self.metrics.insertions.fetch_add(1, Ordering::Relaxed);
    }

    /// Return the cached value for `fp`, building it at most once across
    /// concurrent callers.
    ///
    /// The winning caller runs `build` and stores its result; the others
    /// wait (up to the configured wait timeout) and read the stored value.
    /// A failed build wakes the waiters, and the next one retries. Wait
    /// timeouts fall through to unsupervised execution.
    ///
    /// # Errors
    ///
    /// Propagates the build error to the caller whose build failed.
    pub async fn get_or_build<F, Fut>(&self, fp: &str, build: F) -> Result<(Arc<CachedResult>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<CachedResult>>,
    {
        if !self.settings.enabled {
            let value = build().await?;
            return Ok((Arc::new(value), true));
        }

        let wait_timeout = Duration::from_secs(self.settings.wait_timeout_seconds);
        let mut build = Some(build);

        loop {
            if let Some(value) = self.get(fp) {
                return Ok((value, false));
            }

            let flight = match self.flights.entry(fp.to_string()) {
                dashmap::mapref::entry::Entry::Vacant(slot) => {
                    let flight = Arc::new(Flight { done: Notify::new() });
                    slot.insert(Arc::clone(&flight));
                    None
                },
                dashmap::mapref::entry::Entry::Occupied(slot) => Some(Arc::clone(slot.get())),
            };

            match flight {
                // This caller owns the build.
                None => {
                    let builder = build.take().expect("builder consumed at most once");
                    let result = builder().await;
                    // Store before waking waiters so a woken caller always
                    // finds the value instead of rebuilding.
                    let stored = result.map(|v| {
                        let value = Arc::new(v);
                        self.put(fp, Arc::clone(&value), None);
                        value
                    });
                    if let Some((_, flight)) = self.flights.remove(fp) {
                        flight.done.notify_waiters();
                    }
                    return stored.map(|value| (value, true));
                },
                // Another caller is building; wait for it.
                Some(flight) => {
                    self.metrics.flight_waits.fetch_add(1, Ordering::Relaxed);
                    let notified = flight.done.notified();
                    tokio::pin!(notified);
                    notified.as_mut().enable();

                    // The build may have completed between lookup and
                    // registration.
                    if let Some(value) = self.get(fp) {
                        return Ok((value, false));
                    }

                    if tokio::time::timeout(wait_timeout, notified).await.is_err() {
                        tracing::warn!(fp, "single-flight wait timed out; executing unsupervised");
                        let builder = build.take().expect("builder consumed at most once");
                        let value = Arc::new(builder().await?);
                        self.put(fp, Arc::clone(&value), None);
                        return Ok((value, true));
                    }
                    // Woken: the builder finished (or failed). Loop to read
                    // the cache or take over the build.
                },
            }
        }
    }

    /// Remove expired entries.
    pub fn sweep(&self) {
        let mut store = self.store.lock();
        let now = Instant::now();
        let expired: Vec<String> = store
            .iter()
            .filter(|(_, entry)| entry.expires_at <= now)
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in &expired {
            store.pop(fp);
        }
        if !expired.is_empty() {
            self.metrics
                .evictions
                .fetch_add(expired.len() as u64, Ordering::Relaxed);
            tracing::debug!(count = expired.len(), "cache sweep evicted expired entries");
        }
    }

    /// Current entry count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }

    /// Cache counters.
    #[must_use]
    pub const fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Spawn the periodic sweeper; it stops when the shutdown token fires.
    #[must_use]
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let interval = Duration::from_secs(self.settings.sweep_interval_seconds.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => {
                        tracing::debug!("cache sweeper stopping");
                        return;
                    }
                    _ = ticker.tick() => self.sweep(),
                }
            }
        })
    }
}
