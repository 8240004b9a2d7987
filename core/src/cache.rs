//! Read-through cache with request de-duplication.
//!
//! # Design
//! Each key maps to a slot that is either a resolved entry or an in-flight
//! fetch. The first caller for a missing key takes a [`Lease`] and runs the
//! fetch; callers arriving while it runs wait on the same shared result,
//! success or failure, so there is at most one fetch in flight per key. A
//! failed fetch removes the slot once its waiters have been answered, and
//! the next `get` fetches again.
//!
//! A lease dropped without completing (its caller was cancelled) removes
//! the slot; waiters notice and race for a new lease.
//!
//! Invalidation removes the slot from the map. A fetch that was already
//! running still answers its waiters but its result is not stored.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{FutureExt, Shared};
use tokio::time::Instant;

use crate::config::CachePolicy;
use crate::error::ApiResult;

/// A resolved cache value and when it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub fetched_at: Instant,
}

enum Slot<V> {
    Ready(CacheEntry<V>),
    InFlight {
        lease: u64,
        result: Shared<oneshot::Receiver<ApiResult<V>>>,
    },
}

struct State<K, V> {
    slots: HashMap<K, Slot<V>>,
    next_lease: u64,
}

/// Keyed cache collapsing concurrent identical reads into one fetch.
pub struct QueryCache<K, V> {
    state: Mutex<State<K, V>>,
    max_age: Option<Duration>,
}

impl<K, V> std::fmt::Debug for QueryCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("max_age", &self.max_age)
            .finish_non_exhaustive()
    }
}

/// What a caller has to do to obtain the value of a key.
pub enum Claim<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// A fresh value is cached.
    Cached(V),
    /// Another caller is fetching it.
    Waiting(Pending<V>),
    /// Nobody is; the caller must fetch and complete the lease.
    Fetch(Lease<'a, K, V>),
}

/// The shared result of another caller's fetch.
pub struct Pending<V>(Shared<oneshot::Receiver<ApiResult<V>>>);

impl<V: Clone> Pending<V> {
    /// The fetch result, or `None` if the fetching caller went away without
    /// producing one.
    pub async fn wait(self) -> Option<ApiResult<V>> {
        self.0.await.ok()
    }
}

/// The right, and obligation, to fetch one key.
pub struct Lease<'a, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    cache: &'a QueryCache<K, V>,
    key: K,
    id: u64,
    tx: Option<oneshot::Sender<ApiResult<V>>>,
}

impl<K, V> Lease<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Publish the fetch result to every waiter. Successes are stored unless
    /// the key was invalidated meanwhile; failures leave the key empty.
    pub fn complete(mut self, result: ApiResult<V>) {
        {
            let mut state = self.cache.lock();
            if self.is_current(&state) {
                match &result {
                    Ok(value) => {
                        let entry = CacheEntry {
                            value: value.clone(),
                            fetched_at: Instant::now(),
                        };
                        state.slots.insert(self.key.clone(), Slot::Ready(entry));
                    }
                    Err(_) => {
                        state.slots.remove(&self.key);
                    }
                }
            }
        }
        if let Some(tx) = self.tx.take() {
            // Nobody waiting is fine.
            let _ = tx.send(result);
        }
    }

    fn is_current(&self, state: &State<K, V>) -> bool {
        matches!(
            state.slots.get(&self.key),
            Some(Slot::InFlight { lease, .. }) if *lease == self.id
        )
    }
}

impl<K, V> Drop for Lease<'_, K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn drop(&mut self) {
        if self.tx.is_none() {
            return;
        }
        let mut state = self.cache.lock();
        if self.is_current(&state) {
            state.slots.remove(&self.key);
        }
    }
}

impl<K, V> QueryCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new(policy: &CachePolicy) -> Self {
        Self {
            state: Mutex::new(State {
                slots: HashMap::new(),
                next_lease: 0,
            }),
            max_age: policy.max_age(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_stale(&self, entry: &CacheEntry<V>) -> bool {
        self.max_age
            .is_some_and(|max_age| entry.fetched_at.elapsed() > max_age)
    }

    /// Look `key` up, taking a lease on it if it is neither cached nor
    /// being fetched.
    pub fn claim(&self, key: K) -> Claim<'_, K, V> {
        let mut state = self.lock();
        match state.slots.get(&key) {
            Some(Slot::Ready(entry)) if !self.is_stale(entry) => {
                return Claim::Cached(entry.value.clone())
            }
            Some(Slot::InFlight { result, .. }) => return Claim::Waiting(Pending(result.clone())),
            _ => {}
        }
        let (tx, rx) = oneshot::channel();
        state.next_lease += 1;
        let id = state.next_lease;
        state.slots.insert(
            key.clone(),
            Slot::InFlight {
                lease: id,
                result: rx.shared(),
            },
        );
        Claim::Fetch(Lease {
            cache: self,
            key,
            id,
            tx: Some(tx),
        })
    }

    /// Return the cached value for `key`, running `fetch` if there is none.
    ///
    /// Concurrent calls for the same key share one running `fetch` and all
    /// receive its result, including its error.
    pub async fn get<F, Fut>(&self, key: K, fetch: F) -> ApiResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ApiResult<V>>,
    {
        let lease = loop {
            match self.claim(key.clone()) {
                Claim::Cached(value) => return Ok(value),
                Claim::Waiting(pending) => {
                    if let Some(result) = pending.wait().await {
                        return result;
                    }
                }
                Claim::Fetch(lease) => break lease,
            }
        };
        let result = fetch().await;
        lease.complete(result.clone());
        result
    }

    /// The cached value for `key`, if resolved and fresh. Never fetches.
    pub fn peek(&self, key: &K) -> Option<V> {
        let state = self.lock();
        match state.slots.get(key)? {
            Slot::Ready(entry) if !self.is_stale(entry) => Some(entry.value.clone()),
            _ => None,
        }
    }

    /// Drop the entry for `key`. Returns whether one existed.
    pub fn invalidate(&self, key: &K) -> bool {
        self.lock().slots.remove(key).is_some()
    }

    /// Drop every entry whose key matches. Returns how many were dropped.
    pub fn invalidate_where(&self, mut matches: impl FnMut(&K) -> bool) -> usize {
        let mut state = self.lock();
        let before = state.slots.len();
        state.slots.retain(|k, _| !matches(k));
        before - state.slots.len()
    }

    pub fn clear(&self) {
        self.lock().slots.clear();
    }

    /// Number of keys with a resolved or in-flight entry.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
