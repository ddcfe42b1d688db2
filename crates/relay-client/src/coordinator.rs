//! Keyed request de-duplication with a short-lived result cache.
//!
//! Concurrent callers asking for the same key share one in-flight request.
//! A successful result is served from cache for `cache_ttl`; failures are
//! never cached. An in-flight request older than `pending_stale` is no
//! longer joined, and the next caller starts a fresh one.
//!
//! A shared request caches its result if any of its callers asked for
//! caching, not only the one that started it. Callers that must observe
//! state newer than some instant use
//! [`deduplicate_since`](RequestCoordinator::deduplicate_since), which skips
//! cached values and in-flight requests from before it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::CoordinatorConfig;

type SharedRequest<T, E> = Shared<BoxFuture<'static, Result<T, E>>>;

struct Pending<T, E> {
    request: SharedRequest<T, E>,
    started: Instant,
    generation: u64,
    /// Set by any caller that wants the result cached.
    cache_requested: Arc<AtomicBool>,
}

struct CacheEntry<T> {
    value: T,
    stored: Instant,
    generation: u64,
}

struct State<T, E> {
    pending: HashMap<String, Pending<T, E>>,
    cache: HashMap<String, CacheEntry<T>>,
    next_generation: u64,
}

pub struct RequestCoordinator<T, E> {
    state: Arc<Mutex<State<T, E>>>,
    config: CoordinatorConfig,
}

impl<T, E> RequestCoordinator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                pending: HashMap::new(),
                cache: HashMap::new(),
                next_generation: 0,
            })),
            config,
        }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Run `request` for `key` unless an equivalent request can be reused.
    ///
    /// With `use_cache`, a fresh cached value is returned without calling
    /// `request`, and a successful result is cached. Without it the cache is
    /// neither read nor written, but a live in-flight request is still
    /// joined.
    ///
    /// `request` is only called to build the future, and is called while the
    /// coordinator's lock is held.
    pub async fn deduplicate<F, Fut>(&self, key: &str, request: F, use_cache: bool) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.dispatch(key, request, use_cache, None).await
    }

    /// Like [`deduplicate`](Self::deduplicate), but only reuses a cached
    /// value stored, or an in-flight request started, at or after
    /// `not_before`.
    pub async fn deduplicate_since<F, Fut>(
        &self,
        key: &str,
        request: F,
        use_cache: bool,
        not_before: Instant,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.dispatch(key, request, use_cache, Some(not_before)).await
    }

    async fn dispatch<F, Fut>(
        &self,
        key: &str,
        request: F,
        use_cache: bool,
        not_before: Option<Instant>,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let recent_enough = |at: Instant| not_before.map_or(true, |floor| at >= floor);
        let shared = {
            let mut state = self.state.lock();
            let now = Instant::now();

            if use_cache {
                if let Some(entry) = state.cache.get(key) {
                    if now.duration_since(entry.stored) < self.config.cache_ttl
                        && recent_enough(entry.stored)
                    {
                        trace!(key, "cache hit");
                        return Ok(entry.value.clone());
                    }
                }
            }

            match state.pending.get(key) {
                Some(p)
                    if now.duration_since(p.started) < self.config.pending_stale
                        && recent_enough(p.started) =>
                {
                    trace!(key, generation = p.generation, "joining in-flight request");
                    if use_cache {
                        p.cache_requested.store(true, Ordering::Release);
                    }
                    p.request.clone()
                }
                superseded => {
                    if let Some(p) = superseded {
                        debug!(key, generation = p.generation, "replacing in-flight request");
                    }
                    state.next_generation += 1;
                    let generation = state.next_generation;
                    let cache_requested = Arc::new(AtomicBool::new(use_cache));
                    let request = settle(
                        Arc::clone(&self.state),
                        key.to_string(),
                        generation,
                        Arc::clone(&cache_requested),
                        request(),
                    )
                    .boxed()
                    .shared();
                    let _ = state.pending.insert(
                        key.to_string(),
                        Pending {
                            request: request.clone(),
                            started: now,
                            generation,
                            cache_requested,
                        },
                    );
                    request
                }
            }
        };

        shared.await
    }

    /// Drop the cached value for `key`. An in-flight request is left alone.
    pub fn invalidate(&self, key: &str) {
        let _ = self.state.lock().cache.remove(key);
    }

    /// Forget every cached value and in-flight request.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.cache.clear();
        state.pending.clear();
    }

    /// Remove expired cache entries and stale in-flight requests. Returns how
    /// many entries were removed.
    pub fn prune_expired(&self) -> usize {
        let mut state = self.state.lock();
        let now = Instant::now();
        let (ttl, stale) = (self.config.cache_ttl, self.config.pending_stale);
        let before = state.cache.len() + state.pending.len();
        state.cache.retain(|_, e| now.duration_since(e.stored) < ttl);
        state.pending.retain(|_, p| now.duration_since(p.started) < stale);
        before - (state.cache.len() + state.pending.len())
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn cached_count(&self) -> usize {
        self.state.lock().cache.len()
    }
}

impl<T, E> Default for RequestCoordinator<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

/// Await the request, then retire its pending entry and cache a success.
///
/// Runs inside the shared future, so it completes once no matter which
/// caller drives it.
async fn settle<T, E, Fut>(
    state: Arc<Mutex<State<T, E>>>,
    key: String,
    generation: u64,
    cache_requested: Arc<AtomicBool>,
    request: Fut,
) -> Result<T, E>
where
    T: Clone,
    Fut: Future<Output = Result<T, E>>,
{
    let result = request.await;

    let mut state = state.lock();
    if state.pending.get(&key).is_some_and(|p| p.generation == generation) {
        let _ = state.pending.remove(&key);
    }
    let use_cache = cache_requested.load(Ordering::Acquire);
    if let (true, Ok(value)) = (use_cache, &result) {
        let newer_cached = state
            .cache
            .get(&key)
            .is_some_and(|e| e.generation > generation);
        if !newer_cached {
            let _ = state.cache.insert(
                key,
                CacheEntry {
                    value: value.clone(),
                    stored: Instant::now(),
                    generation,
                },
            );
        }
    }
    result
}
