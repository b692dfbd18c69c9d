//! A shared cache for expensive to open resources.
//!
//! The [`ResourceCache`] mediates access to handles which are costly to construct, like index
//! files that need disk I/O and a schema migration before they can be queried. It is responsible
//! for three things:
//!
//! - **Request coalescing**: Concurrent requests for the same key share a single resource, which
//!   is opened exactly once by the [`ResourceOpener`].
//! - **Close safety**: A resource is lent to callers only for the duration of one handler call,
//!   and it is closed only after the last borrower released it.
//! - **Deadline-aware waiting**: Callers bound the time they wait for a resource with a
//!   [`RequestContext`]. A caller giving up never disturbs the construction that other callers are
//!   waiting for.
//!
//! ## Entry lifecycle
//!
//! Each key maps to at most one live [`CacheEntry`], which goes through the phases
//! `pending → ready(ok | err) → disposing → removed`. An entry enters `disposing` once it
//! was marked for disposal and its last borrower released it.
//!
//! The entry is owned by a background disposal worker which is spawned together with it. The
//! worker opens the resource, hands the entry to the [`EvictionPolicy`], waits until the policy
//! marks the entry for disposal, waits for all borrowers to release the entry, and finally
//! closes the resource and removes the entry. A request that races with a disposal waits for the
//! removal and then creates a fresh entry. Disposed entries are never revived.
//!
//! Entries whose construction failed are disposed as soon as all waiting callers have seen the
//! error, so that a later request tries again.
//!
//! ## Policies
//!
//! - [`LruPolicy`] keeps a bounded weight of resources open and evicts the least recently used
//!   ones.
//! - [`DrainPolicy`] keeps resources open only for the overlapping span of requests using them.
//!
//! ## Metrics
//!
//! All metrics are sent through the [`MetricsHandle`](metrics::MetricsHandle) given to the
//! cache, and are tagged with the `cache` name:
//!
//! - `caches.access`: All accesses.
//! - `caches.memory.hit`: Accesses served by an existing entry.
//! - `caches.open`, `caches.open.duration`, `caches.open.error`: Resources being opened.
//! - `caches.wait.aborted`: Callers that gave up waiting, tagged with the `reason`.
//! - `caches.close`, `caches.close.error`: Resources being closed, tagged with the `policy`.
//! - `caches.entries`: A gauge of the number of entries.

#[macro_use]
pub mod metrics;

mod cache;
mod context;
mod entry;
mod error;
mod policy;

pub use cache::*;
pub use context::*;
pub use entry::CacheEntry;
pub use error::*;
pub use policy::*;
pub use tokio_util::sync::CancellationToken;
