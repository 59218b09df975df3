//! Lazily initialized, per-key singletons.
//!
//! `LazyRegistry` is the explicit replacement for `static INSTANCE` style
//! singletons: the application owns one registry and passes it by reference
//! to whoever needs shared instances.
//!
//! Lookups follow double-checked locking. The memoized value sits behind an
//! `RwLock` that is only ever read on the fast path; on a miss the caller
//! takes the key's own mutex, re-checks, and either becomes the initializer
//! or parks on the key's condition variable until the running attempt
//! settles.

use std::error::Error as StdError;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use dashmap::DashMap;

use crate::config::RegistryConfig;
use crate::context::Context;
use crate::error::{RegistryError, SharedError};

/// Snapshot of an entry's lifecycle, see [`LazyRegistry::state`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Uninitialized,
    Initializing,
    Ready,
    /// The last attempt failed; the next caller retries.
    Failed,
}

type Outcome<V> = Result<Arc<V>, RegistryError>;

/// One run of an initializer. Waiters that joined it receive its outcome even
/// if a later attempt has already started by the time they wake up.
struct Attempt<V> {
    number: u64,
    owner: ThreadId,
    outcome: OnceLock<Outcome<V>>,
}

enum Phase<V> {
    Uninitialized,
    Initializing(Arc<Attempt<V>>),
    Ready(Arc<V>),
    Failed(RegistryError),
}

struct SlotState<V> {
    phase: Phase<V>,
    attempts: u64,
}

struct Slot<V> {
    ready: RwLock<Option<Arc<V>>>,
    state: Mutex<SlotState<V>>,
    settled: Condvar,
}

impl<V> Slot<V> {
    fn new() -> Self {
        Slot {
            ready: RwLock::new(None),
            state: Mutex::new(SlotState {
                phase: Phase::Uninitialized,
                attempts: 0,
            }),
            settled: Condvar::new(),
        }
    }

    fn cached(&self) -> Option<Arc<V>> {
        self.ready
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_cached(&self, value: Option<Arc<V>>) {
        *self.ready.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    fn lock(&self) -> MutexGuard<'_, SlotState<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wake_all(&self) {
        // Taking the lock orders this wakeup after any waiter's last check.
        drop(self.lock());
        self.settled.notify_all();
    }

    /// Publish the outcome of `attempt` and wake everyone parked on it.
    fn settle(&self, attempt: &Arc<Attempt<V>>, outcome: Outcome<V>) {
        let mut state = self.lock();
        debug_assert!(
            matches!(&state.phase, Phase::Initializing(running) if Arc::ptr_eq(running, attempt)),
            "only the running attempt can settle"
        );
        match &outcome {
            Ok(value) => {
                self.set_cached(Some(Arc::clone(value)));
                state.phase = Phase::Ready(Arc::clone(value));
            }
            Err(err) => state.phase = Phase::Failed(err.clone()),
        }
        // Only the owning thread settles an attempt, so the cell is empty here.
        let _ = attempt.outcome.set(outcome);
        drop(state);
        self.settled.notify_all();
    }
}

/// Settles the attempt as panicked if the initializer unwinds.
struct SettleOnUnwind<'a, V> {
    slot: &'a Slot<V>,
    key: &'a str,
    attempt: Option<Arc<Attempt<V>>>,
}

impl<V> SettleOnUnwind<'_, V> {
    fn disarm(mut self) {
        self.attempt = None;
    }
}

impl<V> Drop for SettleOnUnwind<'_, V> {
    fn drop(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            tracing::error!(key = self.key, attempt = attempt.number, "initializer panicked");
            let err = RegistryError::InitializerPanicked {
                key: self.key.to_owned(),
            };
            self.slot.settle(&attempt, Err(err));
        }
    }
}

/// Registry of named singletons, each built at most once.
pub struct LazyRegistry<V> {
    slots: DashMap<String, Arc<Slot<V>>>,
}

impl<V> Default for LazyRegistry<V> {
    fn default() -> Self {
        LazyRegistry {
            slots: DashMap::new(),
        }
    }
}

impl<V> LazyRegistry<V>
where
    V: Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        LazyRegistry {
            slots: DashMap::with_capacity(capacity),
        }
    }

    pub fn from_config(config: &RegistryConfig) -> Self {
        Self::with_capacity(config.initial_capacity)
    }

    /// Return the value for `key`, running `init` if nobody has built it yet.
    ///
    /// Concurrent callers for the same key block until the running attempt
    /// settles and all receive the same `Arc` or the same error. A failed
    /// attempt leaves the key retryable.
    ///
    /// # Panics
    ///
    /// Panics if `init` itself calls back into the registry for the same key.
    /// Re-entrant calls for *other* keys are fine. If `init` panics, waiters
    /// are released with `InitializerPanicked` and the panic propagates.
    pub fn get_or_create<F, E>(&self, key: &str, init: F) -> Result<Arc<V>, RegistryError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.get_or_create_within(key, &Context::background(), init)
    }

    /// Like [`get_or_create`](Self::get_or_create), but a caller that has to
    /// wait for another thread's initializer gives up once `ctx` fires.
    ///
    /// An initializer run by the calling thread is never interrupted.
    pub fn get_or_create_within<F, E>(
        &self,
        key: &str,
        ctx: &Context,
        init: F,
    ) -> Result<Arc<V>, RegistryError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        let slot = self.slot(key);

        // First check: shared read only.
        if let Some(value) = slot.cached() {
            return Ok(value);
        }

        // Second check, under the key's own lock.
        let mut state = slot.lock();
        let running = match &state.phase {
            Phase::Ready(value) => return Ok(Arc::clone(value)),
            Phase::Initializing(running) => Some(Arc::clone(running)),
            Phase::Uninitialized | Phase::Failed(_) => None,
        };

        if let Some(running) = running {
            if running.owner == thread::current().id() {
                drop(state);
                panic!("re-entrant initialization of registry key '{key}'");
            }
            return Self::await_attempt(key, &slot, state, &running, ctx);
        }

        state.attempts += 1;
        let attempt = Arc::new(Attempt {
            number: state.attempts,
            owner: thread::current().id(),
            outcome: OnceLock::new(),
        });
        state.phase = Phase::Initializing(Arc::clone(&attempt));
        drop(state);
        Self::run_initializer(key, &slot, attempt, init)
    }

    fn run_initializer<F, E>(
        key: &str,
        slot: &Slot<V>,
        attempt: Arc<Attempt<V>>,
        init: F,
    ) -> Result<Arc<V>, RegistryError>
    where
        F: FnOnce() -> Result<V, E>,
        E: Into<Box<dyn StdError + Send + Sync>>,
    {
        tracing::debug!(key, attempt = attempt.number, "running initializer");
        let guard = SettleOnUnwind {
            slot,
            key,
            attempt: Some(Arc::clone(&attempt)),
        };
        let result = init();
        guard.disarm();

        let outcome = match result {
            Ok(value) => {
                tracing::debug!(key, attempt = attempt.number, "initializer finished");
                Ok(Arc::new(value))
            }
            Err(err) => {
                let boxed: Box<dyn StdError + Send + Sync> = err.into();
                let source: SharedError = Arc::from(boxed);
                tracing::warn!(
                    key,
                    attempt = attempt.number,
                    error = %source,
                    "initializer failed"
                );
                Err(RegistryError::InitializationFailed {
                    key: key.to_owned(),
                    source,
                })
            }
        };
        slot.settle(&attempt, outcome.clone());
        outcome
    }

    fn await_attempt(
        key: &str,
        slot: &Arc<Slot<V>>,
        mut state: MutexGuard<'_, SlotState<V>>,
        attempt: &Arc<Attempt<V>>,
        ctx: &Context,
    ) -> Result<Arc<V>, RegistryError> {
        let _watch = {
            let slot = Arc::clone(slot);
            ctx.on_cancel(move || slot.wake_all())
        };

        loop {
            if let Some(outcome) = attempt.outcome.get() {
                return outcome.clone();
            }
            if let Err(reason) = ctx.check() {
                tracing::debug!(
                    key,
                    attempt = attempt.number,
                    %reason,
                    "stopped waiting for initializer"
                );
                return Err(RegistryError::Cancelled {
                    key: key.to_owned(),
                    reason,
                });
            }
            state = ctx.wait_on(&slot.settled, state);
        }
    }

    /// The memoized value for `key`, without initializing anything.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.slots.get(key).and_then(|slot| slot.cached())
    }

    pub fn state(&self, key: &str) -> EntryState {
        let Some(slot) = self.existing(key) else {
            return EntryState::Uninitialized;
        };
        let state = slot.lock();
        match &state.phase {
            Phase::Uninitialized => EntryState::Uninitialized,
            Phase::Initializing(_) => EntryState::Initializing,
            Phase::Ready(_) => EntryState::Ready,
            Phase::Failed(_) => EntryState::Failed,
        }
    }

    /// The error left behind by the last failed attempt, if the entry is `Failed`.
    pub fn last_error(&self, key: &str) -> Option<RegistryError> {
        let slot = self.existing(key)?;
        let state = slot.lock();
        match &state.phase {
            Phase::Failed(err) => Some(err.clone()),
            _ => None,
        }
    }

    /// Force `key` back to `Uninitialized`, dropping the registry's reference
    /// to its value. Returns whether a value or a failure was discarded.
    ///
    /// An entry that is currently initializing is left alone and `false` is
    /// returned, so two initializers never run for one key at the same time.
    /// Callers that already hold the old `Arc` keep it.
    pub fn reset(&self, key: &str) -> bool {
        let Some(slot) = self.existing(key) else {
            return false;
        };
        let mut state = slot.lock();
        match &state.phase {
            Phase::Uninitialized => return false,
            Phase::Initializing(_) => {
                tracing::debug!(key, "reset ignored while initializing");
                return false;
            }
            Phase::Ready(_) | Phase::Failed(_) => {}
        }
        state.phase = Phase::Uninitialized;
        slot.set_cached(None);
        tracing::debug!(key, "entry reset");
        true
    }

    /// True once `key` has a memoized value.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Number of keys ever requested, in any state.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.slots.iter().map(|entry| entry.key().clone()).collect();
        keys.sort();
        keys
    }

    fn existing(&self, key: &str) -> Option<Arc<Slot<V>>> {
        self.slots.get(key).map(|slot| Arc::clone(slot.value()))
    }

    // No shard guard outlives this call, so initializers may touch other keys.
    fn slot(&self, key: &str) -> Arc<Slot<V>> {
        if let Some(slot) = self.existing(key) {
            return slot;
        }
        let entry = self
            .slots
            .entry(key.to_owned())
            .or_insert_with(|| Arc::new(Slot::new()));
        Arc::clone(entry.value())
    }
}
