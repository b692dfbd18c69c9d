use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use tokio::sync::{Notify, watch};

use crate::{CacheError, OpenResult, RequestContext, Resource};

/// The externally observable phase of a [`CacheEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Phase {
    /// The opener is still running.
    Pending,
    /// The construction outcome is recorded.
    Ready,
    /// The last borrower is gone and the resource is being closed. No new borrowers are accepted.
    Disposing,
    /// The entry was disposed and is gone from the cache.
    Removed,
}

#[derive(Debug, Default)]
struct EntryState {
    ref_count: usize,
    disposed: bool,
}

/// The bookkeeping record for one key's in-flight or live resource.
///
/// Callers only ever see a [`CacheEntry`] through an
/// [`EvictionPolicy`](crate::EvictionPolicy), which may [mark it for
/// disposal](Self::mark_for_disposal). Everything else is driven by the cache and by the entry's
/// own disposal worker.
pub struct CacheEntry<K, R> {
    key: K,
    /// Reference count and disposal flag, guarded together so that no borrower can sneak in
    /// between the drain check and disposal.
    state: Mutex<EntryState>,
    /// Woken whenever the reference count drops to zero.
    released: Notify,
    /// Holds a permit once a disposal was requested.
    dispose_requested: Notify,
    marked: AtomicBool,
    outcome: OnceLock<OpenResult<R>>,
    weight: AtomicU32,
    phase: watch::Sender<Phase>,
}

impl<K: fmt::Debug, R> fmt::Debug for CacheEntry<K, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("phase", &self.phase())
            .field("ref_count", &state.ref_count)
            .field("disposed", &state.disposed)
            .field("marked", &self.is_marked())
            .finish()
    }
}

impl<K, R> CacheEntry<K, R> {
    /// Creates a pending entry, already borrowed once by its creator.
    pub(crate) fn new(key: K) -> Self {
        Self {
            key,
            state: Mutex::new(EntryState {
                ref_count: 1,
                disposed: false,
            }),
            released: Notify::new(),
            dispose_requested: Notify::new(),
            marked: AtomicBool::new(false),
            outcome: OnceLock::new(),
            weight: AtomicU32::new(1),
            phase: watch::Sender::new(Phase::Pending),
        }
    }

    /// The key this entry was created for.
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The cost of keeping this entry, as declared by the opener.
    pub fn weight(&self) -> u32 {
        self.weight.load(Ordering::Relaxed)
    }

    /// Requests the disposal of this entry.
    ///
    /// The resource stays open until the last borrower releases it. Calling this more than once
    /// has no further effect.
    pub fn mark_for_disposal(&self) {
        if !self.marked.swap(true, Ordering::AcqRel) {
            self.dispose_requested.notify_one();
        }
    }

    /// Whether a disposal was requested for this entry.
    pub fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Acquire)
    }

    /// Number of active borrowers.
    pub fn ref_count(&self) -> usize {
        self.lock_state().ref_count
    }

    /// Whether this entry is disposed and no longer accepts borrowers.
    pub fn is_disposed(&self) -> bool {
        self.lock_state().disposed
    }

    fn lock_state(&self) -> MutexGuard<'_, EntryState> {
        // The critical sections never panic while holding the lock, but stay usable if they did.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a borrower, unless the entry is already disposed.
    ///
    /// Returns `false` if the caller has to retry against a fresh entry.
    pub(crate) fn acquire(&self) -> bool {
        let mut state = self.lock_state();
        if state.disposed {
            return false;
        }
        state.ref_count += 1;
        true
    }

    /// Removes a borrower, waking up the drain waiter if it was the last one.
    pub(crate) fn release(&self) {
        let mut state = self.lock_state();
        debug_assert!(state.ref_count > 0, "released an entry that was never acquired");
        state.ref_count = state.ref_count.saturating_sub(1);
        if state.ref_count == 0 {
            self.released.notify_waiters();
        }
    }

    /// Records the construction outcome and wakes up everybody waiting for it.
    pub(crate) fn complete(&self, outcome: OpenResult<R>, weight: u32) {
        self.weight.store(weight, Ordering::Relaxed);
        if self.outcome.set(outcome).is_err() {
            tracing::error!("A cache entry was completed twice");
        }
        self.phase.send_replace(Phase::Ready);
    }

    /// The recorded construction outcome, if the entry is initialized.
    pub(crate) fn outcome(&self) -> Option<&OpenResult<R>> {
        self.outcome.get()
    }

    /// Waits until the construction outcome is recorded, or `ctx` is done.
    ///
    /// When `ctx` fires first, the entry is left untouched.
    /// A construction error is handed out as a clone of the recorded one.
    pub(crate) async fn await_initialized(&self, ctx: &RequestContext) -> Result<&R, CacheError> {
        self.wait_for_phase(ctx, Phase::Ready).await?;
        match self.outcome.get() {
            Some(Ok(resource)) => Ok(resource),
            Some(Err(err)) => Err(err.clone()),
            // `Ready` is only published after the outcome was set.
            None => Err(CacheError::InternalError),
        }
    }

    /// Waits until the entry is removed from the cache, or `ctx` is done.
    pub(crate) async fn await_removed(&self, ctx: &RequestContext) -> Result<(), CacheError> {
        self.wait_for_phase(ctx, Phase::Removed).await
    }

    async fn wait_for_phase(&self, ctx: &RequestContext, phase: Phase) -> Result<(), CacheError> {
        let mut rx = self.phase.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail here.
        ctx.run(async move {
            let _ = rx.wait_for(|current| *current >= phase).await;
        })
        .await
    }

    /// Waits until some policy requested the disposal of this entry.
    pub(crate) async fn disposal_requested(&self) {
        if self.is_marked() {
            return;
        }
        self.dispose_requested.notified().await;
    }

    /// The phase this entry is in right now.
    pub(crate) fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Marks the entry as removed from the cache, releasing everybody waiting to retry.
    pub(crate) fn set_removed(&self) {
        self.phase.send_replace(Phase::Removed);
    }
}

impl<K, R: Resource> CacheEntry<K, R> {
    /// Waits until all borrowers are gone, then disposes the entry and closes its resource.
    ///
    /// Returns the result of closing the resource, or `None` if construction had failed and there
    /// was nothing to close.
    pub(crate) async fn dispose_when_unused(&self) -> Option<Result<(), R::Error>> {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            // Register for wakeups before checking, so a concurrent `release` is not lost.
            released.as_mut().enable();

            {
                let mut state = self.lock_state();
                if state.ref_count == 0 {
                    state.disposed = true;
                    break;
                }
            }

            released.await;
        }
        self.phase.send_replace(Phase::Disposing);

        match self.outcome.get() {
            Some(Ok(resource)) => Some(resource.close()),
            _ => None,
        }
    }
}

/// Releases a borrowed [`CacheEntry`] when dropped.
///
/// This guarantees the release on every exit path of a borrower, including its future being
/// dropped while waiting.
pub(crate) struct BorrowGuard<K, R> {
    entry: Arc<CacheEntry<K, R>>,
}

impl<K, R> BorrowGuard<K, R> {
    /// Takes over a hold that was already counted for `entry`.
    pub(crate) fn adopt(entry: Arc<CacheEntry<K, R>>) -> Self {
        Self { entry }
    }

    pub(crate) fn entry(&self) -> &CacheEntry<K, R> {
        &self.entry
    }
}

impl<K, R> Drop for BorrowGuard<K, R> {
    fn drop(&mut self) {
        self.entry.release();
    }
}
