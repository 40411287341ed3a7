use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared};
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use super::{LoadError, LoadOutcome};
use crate::utils::futures::CallOnDrop;

/// Computes the values of a [`LoadingCache`].
pub trait Loader: Send + Sync + 'static {
    /// Per-call data handed to [`load`](Self::load), such as the span of the request that
    /// triggered the computation. Only the context of the caller that starts a computation is
    /// used; coalesced callers' contexts are dropped.
    type Context: Send + 'static;

    /// The cached value. Cloned out to every caller.
    type Value: Clone + Send + Sync + 'static;

    /// Computes the value for `key`.
    ///
    /// The returned future runs on its own task, so it must not borrow from `self`.
    fn load(
        &self,
        key: &str,
        context: Self::Context,
    ) -> BoxFuture<'static, LoadOutcome<Self::Value>>;
}

type ComputationChannel<V> = Shared<oneshot::Receiver<Result<V, LoadError>>>;

/// One keyed entry of a [`LoadingCache`].
enum Slot<V> {
    /// A computation is in flight. Everyone asking for the key waits on `channel`.
    Pending {
        /// Distinguishes this computation from any later one for the same key.
        id: u64,
        channel: ComputationChannel<V>,
    },
    /// A computed value. Treated as absent from `expires_at` on.
    Ready { value: V, expires_at: Instant },
}

enum Lookup<V> {
    Hit(V),
    Wait(ComputationChannel<V>),
}

struct Inner<L: Loader> {
    name: String,
    loader: L,
    default_ttl: Duration,
    slots: Mutex<HashMap<String, Slot<L::Value>>>,
    next_id: AtomicU64,
}

impl<L: Loader> Inner<L> {
    /// Stores the outcome of computation `id` and turns it into the result for its waiters.
    fn complete(
        &self,
        key: &str,
        id: u64,
        outcome: LoadOutcome<L::Value>,
    ) -> Result<L::Value, LoadError> {
        metric!(
            counter("caches.computation") += 1,
            "cache" => &self.name,
            "status" => outcome.status(),
        );

        let ttl = outcome.ttl().unwrap_or(self.default_ttl);
        let mut slots = self.slots.lock().unwrap();
        let is_current = is_pending(&slots, key, id);

        match outcome {
            LoadOutcome::Found { value, .. } | LoadOutcome::Negative { value, .. } => {
                if is_current {
                    let expires_at = expiry(Instant::now(), ttl);
                    slots.insert(
                        key.to_owned(),
                        Slot::Ready {
                            value: value.clone(),
                            expires_at,
                        },
                    );
                }
                Ok(value)
            }
            LoadOutcome::Failed(err) => {
                if is_current {
                    slots.remove(key);
                }
                drop(slots);

                tracing::error!(
                    cache = %self.name,
                    key,
                    error = &*err as &dyn std::error::Error,
                    "Cache computation failed",
                );
                Err(LoadError::Failed(format!("{err:#}")))
            }
        }
    }

    /// Removes the pending slot of computation `id`, if it is still there.
    fn abandon(&self, key: &str, id: u64) {
        let mut slots = self.slots.lock().unwrap();
        if is_pending(&slots, key, id) {
            slots.remove(key);
        }
    }
}

fn is_pending<V>(slots: &HashMap<String, Slot<V>>, key: &str, id: u64) -> bool {
    matches!(slots.get(key), Some(Slot::Pending { id: pending, .. }) if *pending == id)
}

/// `now + ttl`, saturating at a point so far in the future that it is never reached.
fn expiry(now: Instant, ttl: Duration) -> Instant {
    now.checked_add(ttl)
        .unwrap_or_else(|| now + Duration::from_secs(100 * 365 * 24 * 60 * 60))
}

/// An in-memory cache that computes missing values with a [`Loader`].
///
/// Concurrent [`get`](Self::get) calls for the same key share a single computation. Values stay
/// valid for the time-to-live requested by the loader, or the cache's default one. Expired
/// values are not swept; they stay in memory until the key is requested again.
///
/// Cloning the cache is cheap and every clone shares the same entries.
pub struct LoadingCache<L: Loader> {
    inner: Arc<Inner<L>>,
}

impl<L: Loader> Clone for LoadingCache<L> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<L: Loader> fmt::Debug for LoadingCache<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingCache")
            .field("name", &self.inner.name)
            .field("default_ttl", &self.inner.default_ttl)
            .field("entries", &self.len())
            .finish()
    }
}

impl<L: Loader> LoadingCache<L> {
    /// Creates an empty cache. `name` only shows up in logs and metrics.
    pub fn new(name: impl Into<String>, loader: L, default_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                loader,
                default_ttl,
                slots: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The number of entries, including expired and pending ones.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the value for `key`, computing it if it is missing or expired.
    ///
    /// If a computation for `key` is already running, this waits for it instead of starting
    /// another one, and `context` is dropped. The computation runs on its own task: dropping the
    /// returned future does not cancel it for the other callers.
    pub async fn get(&self, key: &str, context: L::Context) -> Result<L::Value, LoadError> {
        metric!(counter("caches.access") += 1, "cache" => self.name());

        let channel = match self.lookup(key, context) {
            Lookup::Hit(value) => return Ok(value),
            Lookup::Wait(channel) => channel,
        };

        channel.await.unwrap_or(Err(LoadError::Aborted))
    }

    /// Checks the entry for `key` and starts a computation if there is no usable one.
    fn lookup(&self, key: &str, context: L::Context) -> Lookup<L::Value> {
        let mut slots = self.inner.slots.lock().unwrap();

        match slots.get(key) {
            Some(Slot::Ready { value, expires_at }) if Instant::now() < *expires_at => {
                metric!(counter("caches.memory.hit") += 1, "cache" => self.name());
                return Lookup::Hit(value.clone());
            }
            Some(Slot::Pending { channel, .. }) => {
                metric!(counter("caches.channel.hit") += 1, "cache" => self.name());
                return Lookup::Wait(channel.clone());
            }
            _ => {}
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (computation, channel) = self.create_computation(key.to_owned(), id, context);
        slots.insert(
            key.to_owned(),
            Slot::Pending {
                id,
                channel: channel.clone(),
            },
        );
        drop(slots);

        // The computation removes its slot when dropped unfinished, so it is spawned only after
        // the lock is released.
        tokio::spawn(computation);

        Lookup::Wait(channel)
    }

    /// Creates the computation running the loader for `key`, and the channel it reports to.
    ///
    /// If the computation goes away without completing, because the loader panicked or the
    /// runtime shut down, the pending slot is removed and all waiters receive
    /// [`LoadError::Aborted`].
    fn create_computation(
        &self,
        key: String,
        id: u64,
        context: L::Context,
    ) -> (BoxFuture<'static, ()>, ComputationChannel<L::Value>) {
        let (sender, receiver) = oneshot::channel();

        let abandon_token = {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            CallOnDrop::new(move || inner.abandon(&key, id))
        };

        let inner = Arc::clone(&self.inner);
        let computation = async move {
            let outcome = inner.loader.load(&key, context).await;
            let result = inner.complete(&key, id, outcome);
            abandon_token.defuse();
            sender.send(result).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        (computation.boxed(), receiver.shared())
    }
}
