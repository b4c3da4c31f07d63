//! Single-flight cache with background refresh and expiry.
//!
//! Concurrent `get` calls for the same key share one invocation of the
//! loader. Entries older than the refresh interval are reloaded in place by
//! a background sweep while readers keep seeing the previous value; entries
//! not used for longer than the expiry duration are purged.
//!
//! The entry table is a `DashMap` (map-level locking for structural changes);
//! each entry carries its own async gate, so a slow load for one key never
//! blocks operations on another.

use dashmap::DashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// Error type accepted from loaders.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed future returned by a loader.
pub type LoadFuture<V> = Pin<Box<dyn Future<Output = Result<V, BoxError>> + Send>>;

type Loader<K, V> = Arc<dyn Fn(K) -> LoadFuture<V> + Send + Sync>;

/// Failure of a load, shared by every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    #[error("loading cache entry failed: {0}")]
    Load(Arc<dyn std::error::Error + Send + Sync>),
}

/// How the background refresher is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshMode {
    /// A tokio task sweeps at the configured interval, started on first use.
    #[default]
    Background,
    /// No task is started automatically; the owner calls [`SingleFlightCache::sweep`].
    Manual,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    /// Reload entries whose last load is older than this.
    pub refresh_after: Option<Duration>,
    /// Purge entries whose last use is older than this.
    pub expire_after: Option<Duration>,
    /// Delay between two background sweeps.
    pub sweep_interval: Duration,
    pub mode: RefreshMode,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            refresh_after: Some(Duration::from_secs(300)),
            expire_after: Some(Duration::from_secs(600)),
            sweep_interval: Duration::from_secs(1),
            mode: RefreshMode::Background,
        }
    }
}

/// Hooks for exporting cache statistics.
pub trait CacheObserver: Send + Sync {
    fn on_size(&self, _cache: &str, _size: usize) {}
    fn on_expiry(&self, _cache: &str) {}
    fn on_refresh(&self, _cache: &str, _success: bool) {}
}

struct EntryState<V> {
    value: Option<V>,
    loaded_at: Instant,
    used_at: Instant,
    /// Bumped on every failed load so waiters can detect a shared failure.
    generation: u64,
    last_error: Option<CacheError>,
}

struct Entry<V> {
    gate: tokio::sync::Mutex<()>,
    state: RwLock<EntryState<V>>,
}

impl<V: Clone> Entry<V> {
    fn vacant() -> Self {
        let now = Instant::now();
        Self {
            gate: tokio::sync::Mutex::new(()),
            state: RwLock::new(EntryState {
                value: None,
                loaded_at: now,
                used_at: now,
                generation: 0,
                last_error: None,
            }),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, EntryState<V>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, EntryState<V>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the value, recording the access.
    fn touch(&self) -> Option<V> {
        let mut state = self.write();
        let value = state.value.clone()?;
        state.used_at = Instant::now();
        Some(value)
    }

    fn value(&self) -> Option<V> {
        self.read().value.clone()
    }

    fn has_value(&self) -> bool {
        self.read().value.is_some()
    }

    fn generation(&self) -> u64 {
        self.read().generation
    }

    fn last_error(&self) -> Option<CacheError> {
        self.read().last_error.clone()
    }

    /// `(loaded_at, used_at)` of an entry holding a value.
    fn timestamps(&self) -> Option<(Instant, Instant)> {
        let state = self.read();
        state.value.as_ref().map(|_| (state.loaded_at, state.used_at))
    }

    /// Stores a freshly loaded value. `used` marks the install as a use of
    /// the key; a background refresh leaves the last use untouched.
    fn install(&self, value: V, used: bool) {
        let now = Instant::now();
        let mut state = self.write();
        if used || state.value.is_none() {
            state.used_at = now;
        }
        state.value = Some(value);
        state.loaded_at = now;
        state.last_error = None;
    }

    fn clear(&self) {
        self.write().value = None;
    }

    fn fail(&self, error: CacheError) {
        let mut state = self.write();
        state.last_error = Some(error);
        state.generation += 1;
    }
}

struct Inner<K, V> {
    name: String,
    entries: DashMap<K, Arc<Entry<V>>>,
    loader: Loader<K, V>,
    settings: CacheSettings,
    observer: OnceLock<Arc<dyn CacheObserver>>,
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn entry(&self, key: &K) -> Arc<Entry<V>> {
        self.entries
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Entry::vacant()))
            .value()
            .clone()
    }

    /// Whether `entry` is still the table's entry for `key`.
    fn is_current(&self, key: &K, entry: &Arc<Entry<V>>) -> bool {
        self.entries
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.value().has_value()).count()
    }

    fn report_size(&self) {
        if let Some(observer) = self.observer.get() {
            observer.on_size(&self.name, self.len());
        }
    }

    /// Loads `key` into `entry`. The caller holds the entry's gate.
    async fn load_into(&self, key: &K, entry: &Arc<Entry<V>>) -> Result<V, CacheError> {
        debug!(cache = %self.name, key = ?key, "Loading cache entry");
        match (self.loader)(key.clone()).await {
            Ok(value) => {
                entry.install(value.clone(), true);
                self.report_size();
                Ok(value)
            }
            Err(e) => {
                let error = CacheError::Load(Arc::from(e));
                entry.fail(error.clone());
                // Nothing is stored on failure; the next get retries.
                self.entries
                    .remove_if(key, |_, current| Arc::ptr_eq(current, entry) && !current.has_value());
                debug!(cache = %self.name, key = ?key, "Loading cache entry failed: {}", error);
                Err(error)
            }
        }
    }

    async fn sweep(&self) {
        let now = Instant::now();
        let snapshot: Vec<(K, Arc<Entry<V>>)> = self
            .entries
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (key, entry) in snapshot {
            let Some((loaded_at, used_at)) = entry.timestamps() else {
                continue;
            };

            if let Some(expire_after) = self.settings.expire_after {
                if now.saturating_duration_since(used_at) > expire_after {
                    // An entry with a load in flight is never purged.
                    if let Ok(_gate) = entry.gate.try_lock() {
                        if self
                            .entries
                            .remove_if(&key, |_, current| Arc::ptr_eq(current, &entry))
                            .is_some()
                        {
                            debug!(cache = %self.name, key = ?key, "Cache entry expired");
                            if let Some(observer) = self.observer.get() {
                                observer.on_expiry(&self.name);
                            }
                        }
                    }
                    continue;
                }
            }

            if let Some(refresh_after) = self.settings.refresh_after {
                if now.saturating_duration_since(loaded_at) > refresh_after {
                    let Ok(_gate) = entry.gate.try_lock() else {
                        continue;
                    };
                    self.refresh(&key, &entry).await;
                }
            }
        }

        self.report_size();
    }

    /// Reloads an entry in place; readers keep the old value meanwhile.
    async fn refresh(&self, key: &K, entry: &Arc<Entry<V>>) {
        debug!(cache = %self.name, key = ?key, "Refreshing cache entry");
        let success = match (self.loader)(key.clone()).await {
            Ok(value) => {
                entry.install(value, false);
                true
            }
            Err(e) => {
                warn!(
                    cache = %self.name,
                    key = ?key,
                    "Refreshing cache entry failed, keeping previous value: {}",
                    e
                );
                false
            }
        };
        if let Some(observer) = self.observer.get() {
            observer.on_refresh(&self.name, success);
        }
    }
}

/// Concurrent cache loading values on demand with single-flight semantics.
pub struct SingleFlightCache<K, V> {
    inner: Arc<Inner<K, V>>,
    refresher: Mutex<Option<JoinHandle<()>>>,
}

impl<K, V> SingleFlightCache<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new<F, Fut, E>(name: impl Into<String>, settings: CacheSettings, loader: F) -> Self
    where
        F: Fn(K) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let loader: Loader<K, V> = Arc::new(move |key: K| -> LoadFuture<V> {
            let fut = loader(key);
            Box::pin(async move { fut.await.map_err(Into::into) })
        });

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                entries: DashMap::new(),
                loader,
                settings,
                observer: OnceLock::new(),
            }),
            refresher: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn settings(&self) -> &CacheSettings {
        &self.inner.settings
    }

    /// Installs the statistics observer. Only the first call has an effect.
    pub fn set_observer(&self, observer: Arc<dyn CacheObserver>) {
        if self.inner.observer.set(observer).is_err() {
            warn!(cache = %self.inner.name, "Cache observer already set");
        }
    }

    /// Returns the cached value for `key`, loading it if absent.
    ///
    /// Concurrent callers for an absent key wait for a single loader call and
    /// all observe its outcome, including a failure.
    pub async fn get(&self, key: &K) -> Result<V, CacheError> {
        self.ensure_refresher();

        loop {
            let entry = self.inner.entry(key);
            if let Some(value) = entry.touch() {
                return Ok(value);
            }

            let generation = entry.generation();
            if let Some(result) = self.wait_or_load(key, &entry, generation).await {
                return result;
            }
        }
    }

    /// Takes the gate of `entry` and either reuses the outcome of the load
    /// that held it or runs the loader. Returns `None` when the entry was
    /// detached from the table meanwhile and the caller has to start over.
    async fn wait_or_load(
        &self,
        key: &K,
        entry: &Arc<Entry<V>>,
        generation: u64,
    ) -> Option<Result<V, CacheError>> {
        let _gate = entry.gate.lock().await;

        if let Some(value) = entry.touch() {
            return Some(Ok(value));
        }
        if entry.generation() != generation {
            if let Some(error) = entry.last_error() {
                return Some(Err(error));
            }
        }
        if !self.inner.is_current(key, entry) {
            return None;
        }

        Some(self.inner.load_into(key, entry).await)
    }

    /// Installs a value without calling the loader.
    pub fn put(&self, key: K, value: V) {
        self.ensure_refresher();
        self.inner.entry(&key).install(value, true);
        self.inner.report_size();
    }

    /// Removes `key`, waiting for an in-flight load of it to finish first.
    pub async fn remove(&self, key: &K) -> Option<V> {
        let entry = self.inner.entries.get(key).map(|e| e.value().clone())?;
        let _gate = entry.gate.lock().await;
        self.inner
            .entries
            .remove_if(key, |_, current| Arc::ptr_eq(current, &entry));
        self.inner.report_size();
        entry.value()
    }

    /// Whether a loaded value exists for `key`. Does not count as a use.
    pub fn contains_key(&self, key: &K) -> bool {
        self.inner
            .entries
            .get(key)
            .is_some_and(|e| e.value().has_value())
    }

    /// Number of keys holding a value.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every entry. An entry with a load in flight stays in place
    /// without a value, so later callers join that load instead of starting
    /// another one.
    pub fn invalidate_all(&self) {
        self.inner.entries.retain(|_, entry| match entry.gate.try_lock() {
            Ok(_gate) => false,
            Err(_) => {
                entry.clear();
                true
            }
        });
        self.inner.report_size();
        debug!(cache = %self.inner.name, "Cache invalidated");
    }

    /// Runs one expiry and refresh pass over all entries.
    pub async fn sweep(&self) {
        self.inner.sweep().await;
    }

    /// Starts the background refresher if it is not running yet.
    pub fn start_refresher(&self) {
        let mut slot = self.refresher.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(cache = %self.inner.name, "No tokio runtime, cache refresher not started");
            return;
        }
        *slot = Some(spawn_refresher(Arc::downgrade(&self.inner), self.inner.settings.sweep_interval));
        debug!(cache = %self.inner.name, "Cache refresher started");
    }

    /// Stops the background refresher.
    pub fn shutdown(&self) {
        let handle = self
            .refresher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
            debug!(cache = %self.inner.name, "Cache refresher stopped");
        }
    }

    fn ensure_refresher(&self) {
        if self.inner.settings.mode == RefreshMode::Background {
            self.start_refresher();
        }
    }
}

impl<K, V> Drop for SingleFlightCache<K, V> {
    fn drop(&mut self) {
        let handle = self
            .refresher
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn spawn_refresher<K, V>(inner: Weak<Inner<K, V>>, period: Duration) -> JoinHandle<()>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.sweep().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manual() -> CacheSettings {
        CacheSettings {
            mode: RefreshMode::Manual,
            ..CacheSettings::default()
        }
    }

    #[tokio::test]
    async fn test_put_bypasses_loader() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = SingleFlightCache::new("test", manual(), move |_key: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, BoxError>("loaded".to_string()) }
        });

        cache.put(1, "put".to_string());
        assert!(cache.contains_key(&1));
        assert_eq!(cache.get(&1).await.unwrap(), "put");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_load_is_not_stored() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = SingleFlightCache::new("test", manual(), move |_key: u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("boom".into())
                } else {
                    Ok::<_, BoxError>(n)
                }
            }
        });

        assert!(cache.get(&7).await.is_err());
        assert!(!cache.contains_key(&7));
        assert_eq!(cache.get(&7).await.unwrap(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_remove_and_invalidate() {
        let cache = SingleFlightCache::new("test", manual(), |key: u32| async move {
            Ok::<_, BoxError>(key * 2)
        });

        assert_eq!(cache.get(&2).await.unwrap(), 4);
        assert_eq!(cache.get(&3).await.unwrap(), 6);
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.remove(&2).await, Some(4));
        assert!(!cache.contains_key(&2));
        assert_eq!(cache.remove(&2).await, None);

        cache.invalidate_all();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_detached_entry_is_not_loaded() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let cache = SingleFlightCache::new("test", manual(), move |_key: u32| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("boom".into())
                } else {
                    Ok::<_, BoxError>(n)
                }
            }
        });

        // A caller holding the entry while the failed load drops it from the
        // table reads the already bumped generation.
        let stale = cache.inner.entry(&1);
        assert!(cache.get(&1).await.is_err());
        assert!(!cache.inner.is_current(&1, &stale));

        let generation = stale.generation();
        assert!(cache.wait_or_load(&1, &stale, generation).await.is_none());
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        assert_eq!(cache.get(&1).await.unwrap(), 1);
        assert!(cache.contains_key(&1));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
