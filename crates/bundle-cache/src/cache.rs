use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use futures::FutureExt;
use futures::future::BoxFuture;
use sentry::{Hub, SentryFutureExt};

use crate::entry::BorrowGuard;
use crate::metrics::MetricsHandle;
use crate::{CacheEntry, CacheError, EvictionPolicy, OpenResult, RequestContext};

/// An expensive to construct handle, owned by the [`ResourceCache`].
pub trait Resource: Send + Sync + 'static {
    /// The error returned when closing fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Releases all the underlying resources.
    ///
    /// This is called at most once per handle, after the last borrower released it. Errors are
    /// only logged, as nobody is listening at that point anymore.
    fn close(&self) -> Result<(), Self::Error>;
}

impl Resource for () {
    type Error = std::convert::Infallible;

    fn close(&self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Opens new [`Resource`]s on behalf of the [`ResourceCache`].
pub trait ResourceOpener: Send + Sync + 'static {
    /// Identifies a resource.
    type Key: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// The resource being cached.
    type Resource: Resource;

    /// Opens the resource identified by `key`.
    ///
    /// This may be slow. It is invoked exactly once per cache entry, no matter how many callers
    /// are waiting for the entry.
    fn open(&self, key: Self::Key) -> BoxFuture<'_, OpenResult<Self::Resource>>;

    /// The cost of keeping this resource open, used by capacity bound policies.
    fn weight(&self, _resource: &Self::Resource) -> u32 {
        1
    }
}

type Entry<O> = CacheEntry<<O as ResourceOpener>::Key, <O as ResourceOpener>::Resource>;

/// Deduplicates and reference-counts access to expensive [`Resource`]s.
///
/// All callers asking for the same key at the same time share a single resource, which is opened
/// exactly once by the [`ResourceOpener`]. Each cache entry is owned by a background disposal
/// worker, which opens the resource, hands the entry to the [`EvictionPolicy`], and once the policy
/// marked the entry for disposal, waits for all borrowers to release it before closing the
/// resource and removing the entry.
///
/// Cloning the cache is cheap, all clones share the same entries.
pub struct ResourceCache<O: ResourceOpener> {
    inner: Arc<Inner<O>>,
}

struct Inner<O: ResourceOpener> {
    name: String,
    opener: O,
    policy: Box<dyn EvictionPolicy<O::Key, O::Resource>>,
    entries: Mutex<HashMap<O::Key, Arc<Entry<O>>>>,
    metrics: MetricsHandle,
}

impl<O: ResourceOpener> Clone for ResourceCache<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<O: ResourceOpener> fmt::Debug for ResourceCache<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy.name())
            .field("entries", &self.len())
            .finish()
    }
}

impl<O: ResourceOpener> ResourceCache<O> {
    /// Creates a new cache, opening resources using `opener`.
    pub fn new<P>(name: impl Into<String>, opener: O, policy: P, metrics: MetricsHandle) -> Self
    where
        P: EvictionPolicy<O::Key, O::Resource>,
    {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                opener,
                policy: Box::new(policy),
                entries: Default::default(),
                metrics,
            }),
        }
    }

    /// The name of this cache, used for logging and metrics.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The opener used to construct resources.
    pub fn opener(&self) -> &O {
        &self.inner.opener
    }

    /// The number of entries that are not yet removed, including the ones being opened or closed.
    pub fn len(&self) -> usize {
        self.inner.lock_entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether an entry for `key` exists right now.
    pub fn contains_key(&self, key: &O::Key) -> bool {
        self.inner.lock_entries().contains_key(key)
    }

    /// Borrows the resource for `key` for the duration of `handler`.
    ///
    /// This reuses the live entry for `key` or creates a new one, in which case the resource is
    /// opened in the background. The wait for the resource is bounded by `ctx`, but the handler
    /// itself is not.
    ///
    /// The caller observes exactly one of:
    /// - the result of `handler`,
    /// - the error that happened while opening the resource, shared with every other caller of the
    ///   same entry,
    /// - its own [`CacheError::DeadlineExceeded`] or [`CacheError::Canceled`].
    ///
    /// The borrow is released on every exit path, including this future being dropped.
    pub async fn with_resource<F, T, E>(
        &self,
        ctx: &RequestContext,
        key: O::Key,
        handler: F,
    ) -> Result<T, E>
    where
        F: for<'r> FnOnce(&'r O::Resource) -> BoxFuture<'r, Result<T, E>>,
        E: From<CacheError>,
    {
        let name = self.name();
        metric!(self.inner.metrics, counter("caches.access") += 1, "cache" => name);

        let guard = loop {
            let (entry, created) = self.inner.get_or_create(&key);
            if created {
                self.spawn_disposal_worker(Arc::clone(&entry));
                break BorrowGuard::adopt(entry);
            }
            if entry.acquire() {
                metric!(self.inner.metrics, counter("caches.memory.hit") += 1, "cache" => name);
                break BorrowGuard::adopt(entry);
            }

            // The entry is disposed, but its resource is not yet closed. Wait for it to be gone
            // so that we never have two resources open for the same key.
            tracing::trace!(?key, "Waiting for disposed entry to be removed");
            if let Err(err) = entry.await_removed(ctx).await {
                self.inner.record_wait_error(&err);
                return Err(err.into());
            }
        };

        let resource = match guard.entry().await_initialized(ctx).await {
            Ok(resource) => resource,
            Err(err) => {
                self.inner.record_wait_error(&err);
                return Err(err.into());
            }
        };
        self.inner.policy.touch(guard.entry());

        let result = handler(resource).await;
        drop(guard);
        result
    }

    /// Marks every entry for disposal.
    ///
    /// Entries are closed as soon as their current borrowers are done. Requests made after this
    /// will open their resources again.
    pub fn clear(&self) {
        self.inner.policy.evict_all();
        for entry in self.inner.lock_entries().values() {
            entry.mark_for_disposal();
        }
    }

    fn spawn_disposal_worker(&self, entry: Arc<Entry<O>>) {
        let inner = Arc::clone(&self.inner);
        let worker = async move { inner.run_disposal_worker(entry).await };
        tokio::spawn(worker.bind_hub(Hub::new_from_top(Hub::current())));
    }
}

impl<O: ResourceOpener> Inner<O> {
    fn lock_entries(&self) -> MutexGuard<'_, HashMap<O::Key, Arc<Entry<O>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the live entry for `key`, or inserts a new one borrowed by the caller.
    ///
    /// The returned flag is `true` if the entry was created.
    fn get_or_create(&self, key: &O::Key) -> (Arc<Entry<O>>, bool) {
        let mut entries = self.lock_entries();
        if let Some(entry) = entries.get(key) {
            return (Arc::clone(entry), false);
        }

        let entry = Arc::new(CacheEntry::new(key.clone()));
        entries.insert(key.clone(), Arc::clone(&entry));
        metric!(self.metrics, gauge("caches.entries") = entries.len() as u64, "cache" => &self.name);
        (entry, true)
    }

    fn remove(&self, entry: &Arc<Entry<O>>) {
        let mut entries = self.lock_entries();
        if entries
            .get(entry.key())
            .is_some_and(|current| Arc::ptr_eq(current, entry))
        {
            entries.remove(entry.key());
        }
        metric!(self.metrics, gauge("caches.entries") = entries.len() as u64, "cache" => &self.name);
    }

    fn record_wait_error(&self, err: &CacheError) {
        if !err.is_construction_error() {
            metric!(
                self.metrics,
                counter("caches.wait.aborted") += 1,
                "cache" => &self.name,
                "reason" => err.metrics_tag(),
            );
        }
    }

    /// Opens the resource of `entry`, and disposes of it once the policy asks for it.
    ///
    /// This is the only place that closes resources and removes entries.
    async fn run_disposal_worker(&self, entry: Arc<Entry<O>>) {
        let name = &self.name;
        let policy = self.policy.name();

        metric!(self.metrics, counter("caches.open") += 1, "cache" => name);
        let start = Instant::now();
        let outcome = AssertUnwindSafe(self.opener.open(entry.key().clone()))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                tracing::error!(key = ?entry.key(), "Opening a resource panicked");
                Err(CacheError::InternalError)
            });
        metric!(self.metrics, timer("caches.open.duration") = start.elapsed(), "cache" => name);

        let weight = match &outcome {
            Ok(resource) => self.opener.weight(resource),
            Err(err) => {
                tracing::debug!(key = ?entry.key(), %err, "Failed to open resource");
                metric!(
                    self.metrics,
                    counter("caches.open.error") += 1,
                    "cache" => name,
                    "reason" => err.metrics_tag(),
                );
                0
            }
        };
        entry.complete(outcome, weight);

        match entry.outcome() {
            // Somebody already requested a disposal while we were opening, e.g. a `clear`.
            Some(Ok(_)) if entry.is_marked() => {}
            Some(Ok(_)) => self.policy.admit(&entry),
            // Failed entries are dropped as soon as everybody saw the error, so that the next
            // request retries from scratch.
            _ => entry.mark_for_disposal(),
        }

        entry.disposal_requested().await;
        tracing::trace!(key = ?entry.key(), policy, "Disposing entry once unused");

        match entry.dispose_when_unused().await {
            Some(Ok(())) => {
                metric!(self.metrics, counter("caches.close") += 1, "cache" => name, "policy" => policy);
            }
            Some(Err(err)) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    key = ?entry.key(),
                    "Failed to close resource",
                );
                metric!(self.metrics, counter("caches.close.error") += 1, "cache" => name, "policy" => policy);
            }
            None => {}
        }

        self.remove(&entry);
        entry.set_removed();
    }
}
