use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use crate::decode::{DecodeHints, Decoder};
use crate::download::{Progress, ProgressReporter, Transport};
use crate::utils::defer::{DeferGuard, defer};

use super::{CacheEntry, CacheError, CacheKey, CacheName, CacheSettings, Dispatch, WeightedLru};

/// The continuation of a single caller, invoked with the outcome of its request.
pub type Listener<P> = Box<dyn FnOnce(CacheEntry<Arc<P>>) + Send + 'static>;

/// Receives download progress of the fetch a listener is attached to.
pub type ProgressListener = Arc<dyn Fn(Progress) + Send + Sync + 'static>;

const WAITING: u8 = 0;
const DELIVERED: u8 = 1;
const CANCELLED: u8 = 2;

/// Decides the race between delivering a result and cancelling a listener.
///
/// A ticket moves out of [`WAITING`] exactly once, so a listener either runs or is
/// cancelled, never both.
#[derive(Debug, Default)]
struct Ticket {
    state: AtomicU8,
}

impl Ticket {
    fn settle(&self, to: u8) -> bool {
        self.state
            .compare_exchange(WAITING, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn is_waiting(&self) -> bool {
        self.state.load(Ordering::Acquire) == WAITING
    }
}

/// The handle of a single [`request`](RequestCoalescingCache::request).
///
/// Requests served from memory return an inert handle, as their listener has already
/// been handed to the dispatcher.
#[derive(Debug, Clone, Default)]
pub struct RequestHandle {
    registration: Option<(CacheKey, Arc<Ticket>)>,
}

impl RequestHandle {
    /// The key of the pending fetch this handle is attached to.
    pub fn key(&self) -> Option<&CacheKey> {
        self.registration.as_ref().map(|(key, _)| key)
    }

    /// Whether the request was served from memory right away.
    pub fn is_inert(&self) -> bool {
        self.registration.is_none()
    }
}

struct Slot<P> {
    ticket: Arc<Ticket>,
    listener: Listener<P>,
    progress: Option<ProgressListener>,
}

/// The listeners waiting on an in-flight fetch, in attachment order.
struct Pending<P> {
    generation: u64,
    slots: Vec<Slot<P>>,
    /// Set right after spawning, outside of the lock.
    task: Option<AbortHandle>,
}

/// Counters describing the activity of a [`RequestCoalescingCache`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// All requests.
    pub accesses: u64,
    /// Requests served by the in-memory LRU.
    pub hits: u64,
    /// Requests that attached to an already running fetch.
    pub coalesced: u64,
    /// Fetches started.
    pub computations: u64,
    /// Entries removed from the LRU, by eviction, trimming or `evict_all`.
    pub evicted: u64,
    /// Listeners cancelled before they were notified.
    pub cancelled: u64,

    /// Entries currently held in memory.
    pub entries: usize,
    /// The current total weight of all entries.
    pub weight: u64,
    /// Fetches currently in flight.
    pub pending: usize,
}

struct State<P> {
    lru: WeightedLru<CacheKey, Arc<P>>,
    pending: HashMap<CacheKey, Pending<P>>,
    next_generation: u64,
    stats: CacheStats,
}

struct Inner<D: Decoder> {
    name: CacheName,
    transport: Arc<dyn Transport>,
    decoder: D,
    dispatch: Arc<dyn Dispatch>,
    runtime: Handle,
    /// Guards both the LRU and the pending fetches. Listeners never run while it is held.
    state: Mutex<State<D::Payload>>,
}

/// Deduplicates concurrent fetches of the same resource and keeps a bounded, weighted LRU of
/// decoded results.
///
/// For each [`CacheKey`], at most one fetch is in flight at any time. Every listener that
/// requests a key while its fetch is running gets attached to it, and all of them are
/// notified in attachment order once the fetch completes. Successful results are inserted
/// into the LRU *before* any listener runs. Failures are never cached: the next request for
/// the same key starts over.
///
/// Listeners are invoked through the configured [`Dispatch`], never while internal locks are
/// held, so a listener may call back into the cache.
pub struct RequestCoalescingCache<D: Decoder> {
    inner: Arc<Inner<D>>,
}

impl<D: Decoder> Clone for RequestCoalescingCache<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Decoder> fmt::Debug for RequestCoalescingCache<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("RequestCoalescingCache")
            .field("name", &self.inner.name)
            .field("lru", &state.lru)
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl<D: Decoder> RequestCoalescingCache<D> {
    /// Creates a new cache.
    ///
    /// Fetches and decoding run on `runtime`, listeners on `dispatch`.
    pub fn new(
        settings: CacheSettings,
        transport: Arc<dyn Transport>,
        decoder: D,
        dispatch: Arc<dyn Dispatch>,
        runtime: Handle,
    ) -> Self {
        let state = State {
            lru: WeightedLru::new(settings.capacity),
            pending: HashMap::new(),
            next_generation: 0,
            stats: CacheStats::default(),
        };

        Self {
            inner: Arc::new(Inner {
                name: settings.name,
                transport,
                decoder,
                dispatch,
                runtime,
                state: Mutex::new(state),
            }),
        }
    }

    pub fn name(&self) -> CacheName {
        self.inner.name
    }

    /// Requests the resource behind `key`, invoking `listener` exactly once with the outcome.
    ///
    /// This never blocks. The `hints` are passed to the decoder, but only those of the
    /// request that starts a fetch take effect.
    pub fn request<F>(&self, key: CacheKey, hints: DecodeHints, listener: F) -> RequestHandle
    where
        F: FnOnce(CacheEntry<Arc<D::Payload>>) + Send + 'static,
    {
        self.register(key, hints, Box::new(listener), None)
    }

    /// Like [`request`](Self::request), but also reports download progress to `progress`.
    pub fn request_with_progress<F, G>(
        &self,
        key: CacheKey,
        hints: DecodeHints,
        listener: F,
        progress: G,
    ) -> RequestHandle
    where
        F: FnOnce(CacheEntry<Arc<D::Payload>>) + Send + 'static,
        G: Fn(Progress) + Send + Sync + 'static,
    {
        self.register(key, hints, Box::new(listener), Some(Arc::new(progress)))
    }

    /// Requests the resource behind `key` and waits for the outcome.
    ///
    /// Dropping the returned future cancels the underlying request. Note that the outcome
    /// is delivered through the configured [`Dispatch`], so a queue-based dispatcher has to be
    /// drained for this future to resolve.
    pub async fn fetch(&self, key: CacheKey, hints: DecodeHints) -> CacheEntry<Arc<D::Payload>> {
        let (sender, receiver) = oneshot::channel();
        let handle = self.request(key, hints, move |result| {
            let _ = sender.send(result);
        });

        let guard = defer(|| {
            self.cancel(&handle);
        });
        let result = receiver.await;
        guard.disarm();

        result.unwrap_or_else(|_| {
            tracing::error!("Listener was dropped without being notified");
            Err(CacheError::InternalError)
        })
    }

    /// Detaches the listener of `handle`.
    ///
    /// Returns `true` if the cancellation was acknowledged, in which case the listener is
    /// guaranteed to never run. Returns `false` if the listener already ran or is running,
    /// or if the handle is inert.
    ///
    /// Cancelling the last listener of a fetch aborts the fetch. A result that still
    /// arrives is discarded.
    pub fn cancel(&self, handle: &RequestHandle) -> bool {
        let Some((key, ticket)) = &handle.registration else {
            return false;
        };
        if !ticket.settle(CANCELLED) {
            return false;
        }

        let name = self.inner.name;
        let mut state = self.inner.state.lock();
        state.stats.cancelled += 1;

        let mut detached = None;
        let mut aborted = None;
        if let Some(pending) = state.pending.get_mut(key) {
            if let Some(idx) = pending
                .slots
                .iter()
                .position(|slot| Arc::ptr_eq(&slot.ticket, ticket))
            {
                detached = Some(pending.slots.remove(idx));
            }
            if pending.slots.is_empty() {
                aborted = state.pending.remove(key);
            }
        }
        drop(state);

        metric!(counter("caches.cancelled") += 1, "cache" => name.as_ref());
        if let Some(pending) = aborted {
            tracing::debug!("Aborting fetch of `{}` without listeners", key);
            if let Some(task) = pending.task {
                task.abort();
            }
        }
        // listeners are user code, drop them outside of the lock
        drop(detached);

        true
    }

    /// Clears the in-memory LRU.
    ///
    /// Fetches that are in flight are not affected, and their results are cached as usual.
    pub fn evict_all(&self) {
        let mut state = self.inner.state.lock();
        let evicted = state.lru.len();
        state.lru.clear();
        state.stats.evicted += evicted as u64;
        drop(state);

        tracing::debug!("Evicted {} entries from `{}` cache", evicted, self.inner.name);
        metric!(counter("caches.memory.evicted") += evicted as i64, "cache" => self.inner.name.as_ref());
    }

    /// Returns the cached payload for `key`, marking it as recently used.
    pub fn get_cached(&self, key: &CacheKey) -> Option<Arc<D::Payload>> {
        self.inner.state.lock().lru.get(key).map(Arc::clone)
    }

    /// Whether a fetch for `key` is currently in flight.
    pub fn is_pending(&self, key: &CacheKey) -> bool {
        self.inner.state.lock().pending.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.inner.state.lock();
        CacheStats {
            entries: state.lru.len(),
            weight: state.lru.weight(),
            pending: state.pending.len(),
            ..state.stats
        }
    }

    fn register(
        &self,
        key: CacheKey,
        hints: DecodeHints,
        listener: Listener<D::Payload>,
        progress: Option<ProgressListener>,
    ) -> RequestHandle {
        let name = self.inner.name;
        metric!(counter("caches.access") += 1, "cache" => name.as_ref());

        let mut state = self.inner.state.lock();
        state.stats.accesses += 1;

        if let Some(payload) = state.lru.get(&key).map(Arc::clone) {
            state.stats.hits += 1;
            drop(state);

            metric!(counter("caches.memory.hit") += 1, "cache" => name.as_ref());
            self.inner
                .dispatch
                .dispatch(Box::new(move || listener(Ok(payload))));
            return RequestHandle::default();
        }

        let ticket = Arc::new(Ticket::default());
        let slot = Slot {
            ticket: Arc::clone(&ticket),
            listener,
            progress,
        };

        if let Some(pending) = state.pending.get_mut(&key) {
            pending.slots.push(slot);
            state.stats.coalesced += 1;
            drop(state);

            tracing::trace!("Attached to running fetch of `{}`", key);
            metric!(counter("caches.coalesced") += 1, "cache" => name.as_ref());
            return RequestHandle {
                registration: Some((key, ticket)),
            };
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        state.stats.computations += 1;

        state.pending.insert(
            key.clone(),
            Pending {
                generation,
                slots: vec![slot],
                task: None,
            },
        );
        drop(state);

        tracing::trace!("Started fetch of `{}`", key);
        metric!(counter("caches.computation") += 1, "cache" => name.as_ref());

        // Fails all listeners if the computation is dropped before it completes. This covers
        // panics, and runtimes that are shut down and drop the future without ever polling it.
        // After an abort, the pending entry is already gone and this is a no-op.
        let guard = {
            let cache = self.clone();
            let key = key.clone();
            defer(move || cache.complete(&key, generation, Err(CacheError::InternalError)))
        };
        let computation = self
            .clone()
            .compute(key.clone(), generation, hints, guard)
            .bind_hub(Hub::new_from_top(Hub::current()));
        let task = self.inner.runtime.spawn(computation).abort_handle();

        let mut state = self.inner.state.lock();
        match state.pending.get_mut(&key) {
            Some(pending) if pending.generation == generation => pending.task = Some(task),
            // cancelled or completed while the lock was released
            _ => task.abort(),
        }
        drop(state);

        RequestHandle {
            registration: Some((key, ticket)),
        }
    }

    async fn compute<F>(
        self,
        key: CacheKey,
        generation: u64,
        hints: DecodeHints,
        guard: DeferGuard<F>,
    ) where
        F: FnOnce() + Send + 'static,
    {
        let progress = self.progress_reporter(key.clone(), generation);
        let result = match self.inner.transport.fetch(&key, &progress).await {
            Ok(data) => self.decode(data, hints).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &result {
            tracing::debug!(error = %err, "Fetching `{}` failed", key);
        }

        guard.disarm();
        self.complete(&key, generation, result);
    }

    async fn decode(
        &self,
        data: Bytes,
        hints: DecodeHints,
    ) -> CacheEntry<(Arc<D::Payload>, u64)> {
        let inner = Arc::clone(&self.inner);
        let decoded = self.inner.runtime.spawn_blocking(
            move || -> CacheEntry<(Arc<D::Payload>, u64)> {
                let payload = inner.decoder.decode(data, &hints)?;
                let weight = D::weight(&payload);
                Ok((Arc::new(payload), weight))
            },
        );

        decoded
            .await
            .unwrap_or_else(|err| Err(CacheError::from_std_error(err)))
    }

    fn progress_reporter(&self, key: CacheKey, generation: u64) -> ProgressReporter {
        let inner = Arc::clone(&self.inner);
        ProgressReporter::new(move |progress| {
            let sinks: Vec<_> = {
                let state = inner.state.lock();
                match state.pending.get(&key) {
                    Some(pending) if pending.generation == generation => pending
                        .slots
                        .iter()
                        .filter_map(|slot| {
                            let sink = slot.progress.as_ref()?;
                            Some((Arc::clone(&slot.ticket), Arc::clone(sink)))
                        })
                        .collect(),
                    _ => return,
                }
            };
            if sinks.is_empty() {
                return;
            }

            inner.dispatch.dispatch(Box::new(move || {
                for (ticket, sink) in sinks {
                    if ticket.is_waiting() {
                        sink(progress);
                    }
                }
            }));
        })
    }

    /// Stores the outcome of fetch `generation` and notifies its listeners.
    fn complete(
        &self,
        key: &CacheKey,
        generation: u64,
        result: CacheEntry<(Arc<D::Payload>, u64)>,
    ) {
        let name = self.inner.name;
        let mut state = self.inner.state.lock();

        let is_current = state
            .pending
            .get(key)
            .is_some_and(|pending| pending.generation == generation);
        if !is_current {
            drop(state);
            tracing::trace!("Discarding result of abandoned fetch of `{}`", key);
            return;
        }
        let Some(pending) = state.pending.remove(key) else {
            return;
        };

        let mut evicted = Vec::new();
        let result = match result {
            Ok((payload, weight)) => {
                evicted = state.lru.insert(key.clone(), Arc::clone(&payload), weight);
                Ok(payload)
            }
            Err(err @ CacheError::ResourceExhausted(_)) => {
                let target = state.lru.capacity() / 2;
                let trimmed = state.lru.trim_to(target);
                state.stats.evicted += trimmed as u64;
                tracing::warn!(
                    "Decoding `{}` exhausted its memory, trimmed {} entries from `{}` cache",
                    key,
                    trimmed,
                    name,
                );
                if trimmed > 0 {
                    metric!(counter("caches.memory.evicted") += trimmed as i64, "cache" => name.as_ref());
                }
                Err(err)
            }
            Err(err) => Err(err),
        };
        state.stats.evicted += evicted.len() as u64;
        drop(state);

        if !evicted.is_empty() {
            metric!(counter("caches.memory.evicted") += evicted.len() as i64, "cache" => name.as_ref());
        }
        drop(evicted);

        let slots = pending.slots;
        self.inner.dispatch.dispatch(Box::new(move || {
            for slot in slots {
                if slot.ticket.settle(DELIVERED) {
                    (slot.listener)(result.clone());
                }
            }
        }));
    }
}
