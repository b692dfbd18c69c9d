use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use moka::notification::RemovalCause;

use crate::CacheEntry;

/// Decides when a [`CacheEntry`] is marked for disposal.
///
/// A policy never closes anything itself. It only calls [`CacheEntry::mark_for_disposal`], and the
/// entry's disposal worker takes care of waiting for the last borrower and closing the resource.
pub trait EvictionPolicy<K, R>: Send + Sync + 'static {
    /// A short name of this policy, used for logging and metrics.
    fn name(&self) -> &'static str;

    /// Called once the resource of `entry` was opened successfully.
    ///
    /// Entries whose construction failed are marked for disposal by the cache right away and are
    /// never admitted.
    fn admit(&self, entry: &Arc<CacheEntry<K, R>>);

    /// Called whenever a caller borrows an entry.
    fn touch(&self, _entry: &CacheEntry<K, R>) {}

    /// Marks every admitted entry for disposal.
    fn evict_all(&self) {}
}

/// Keeps resources open for as long as they are borrowed, and not a moment longer.
///
/// This policy has no capacity bound. Every entry is marked for disposal as soon as its resource
/// is opened, so it gets closed when the last of the overlapping requests releases it. It only
/// deduplicates concurrent opens of the same key and orders the close after all uses. A later
/// request for the same key always pays the full cost of opening the resource again.
#[derive(Debug, Default, Clone, Copy)]
pub struct DrainPolicy;

impl<K: Send + Sync + 'static, R: Send + Sync + 'static> EvictionPolicy<K, R> for DrainPolicy {
    fn name(&self) -> &'static str {
        "drain"
    }

    fn admit(&self, entry: &Arc<CacheEntry<K, R>>) {
        entry.mark_for_disposal();
    }
}

/// Keeps up to `capacity` worth of resources open, evicting the least recently used ones.
///
/// The weight of each entry is declared by the
/// [`ResourceOpener::weight`](crate::ResourceOpener::weight), and defaults to `1` per handle.
/// Evicted entries are only marked for disposal, so an entry that is still borrowed stays open
/// until it is drained. The capacity bound is therefore applied to idle resources, and is exceeded
/// temporarily by evicted resources that are still in use.
pub struct LruPolicy<K, R> {
    index: moka::sync::Cache<K, Arc<CacheEntry<K, R>>>,
}

impl<K, R> fmt::Debug for LruPolicy<K, R>
where
    K: Hash + Eq + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LruPolicy")
            .field("capacity", &self.index.policy().max_capacity())
            .field("entries", &self.index.entry_count())
            .field("weighted_size", &self.index.weighted_size())
            .finish()
    }
}

impl<K, R> LruPolicy<K, R>
where
    K: Hash + Eq + fmt::Debug + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    pub fn new(capacity: u64) -> Self {
        let index = moka::sync::Cache::builder()
            .max_capacity(capacity)
            .eviction_policy(moka::policy::EvictionPolicy::lru())
            .weigher(|_key, entry: &Arc<CacheEntry<K, R>>| entry.weight())
            .eviction_listener(|key, entry: Arc<CacheEntry<K, R>>, cause| {
                if cause == RemovalCause::Size {
                    tracing::trace!(?key, "Evicting least recently used entry");
                }
                entry.mark_for_disposal();
            })
            .build();

        Self { index }
    }

    /// The total weight of the admitted entries.
    pub fn weighted_size(&self) -> u64 {
        self.index.run_pending_tasks();
        self.index.weighted_size()
    }
}

impl<K, R> EvictionPolicy<K, R> for LruPolicy<K, R>
where
    K: Clone + Hash + Eq + fmt::Debug + Send + Sync + 'static,
    R: Send + Sync + 'static,
{
    fn name(&self) -> &'static str {
        "lru"
    }

    fn admit(&self, entry: &Arc<CacheEntry<K, R>>) {
        self.index.insert(entry.key().clone(), Arc::clone(entry));
        // Apply the capacity bound right away instead of on some later access.
        self.index.run_pending_tasks();
    }

    fn touch(&self, entry: &CacheEntry<K, R>) {
        // Only record the access, an entry that was already evicted stays evicted.
        let _ = self.index.get(entry.key());
    }

    fn evict_all(&self) {
        for (_key, entry) in self.index.iter() {
            entry.mark_for_disposal();
        }
        self.index.invalidate_all();
    }
}
