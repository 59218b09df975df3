//! Cancellation contexts for blocking operations.
//!
//! A [`Context`] bundles an optional [`CancelToken`] with an optional
//! deadline. Blocking calls in this crate take a `&Context` and give up with
//! a [`CancelReason`] once either fires.
//!
//! Explicit cancellation does not rely on polling: a blocked call registers a
//! wake callback with the token, and `cancel()` runs every registered
//! callback after flipping the flag.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::error::CancelReason;

type WakeFn = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Watchers {
    next_id: u64,
    callbacks: HashMap<u64, WakeFn>,
}

#[derive(Default)]
struct TokenInner {
    cancelled: AtomicBool,
    watchers: Mutex<Watchers>,
}

impl TokenInner {
    fn watchers(&self) -> MutexGuard<'_, Watchers> {
        self.watchers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared cancellation flag. Clones observe the same flag.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the token and wake every operation blocked on it.
    ///
    /// Returns `true` only for the call that actually flipped the flag.
    pub fn cancel(&self) -> bool {
        if self.inner.cancelled.swap(true, Ordering::SeqCst) {
            return false;
        }

        // Snapshot so callbacks run without the watcher lock held.
        let callbacks: Vec<WakeFn> = self.inner.watchers().callbacks.values().cloned().collect();
        tracing::debug!(waiters = callbacks.len(), "cancel token fired");
        for wake in callbacks {
            wake();
        }
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// A context that fires when this token is cancelled.
    pub fn context(&self) -> Context {
        Context::with_cancel(self)
    }

    fn watch(&self, wake: WakeFn) -> CancelWatch {
        let mut watchers = self.inner.watchers();
        let id = watchers.next_id;
        watchers.next_id += 1;
        watchers.callbacks.insert(id, wake);
        CancelWatch {
            token: Arc::downgrade(&self.inner),
            id,
        }
    }

    #[cfg(test)]
    fn watcher_count(&self) -> usize {
        self.inner.watchers().callbacks.len()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Registration of a wake callback; deregisters on drop.
#[must_use = "the wake callback is removed as soon as the watch is dropped"]
pub(crate) struct CancelWatch {
    token: Weak<TokenInner>,
    id: u64,
}

impl Drop for CancelWatch {
    fn drop(&mut self) {
        if let Some(inner) = self.token.upgrade() {
            inner.watchers().callbacks.remove(&self.id);
        }
    }
}

/// Cancellation scope handed to blocking operations.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: Option<CancelToken>,
    deadline: Option<Instant>,
}

impl Context {
    /// A context that never fires.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Context {
            token: None,
            deadline: Some(deadline),
        }
    }

    pub fn with_cancel(token: &CancelToken) -> Self {
        Self::background().cancel_token(token)
    }

    /// Tighten the deadline to at most `timeout` from now.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        // An unrepresentable deadline is as good as none.
        if let Some(deadline) = Instant::now().checked_add(timeout) {
            self.deadline = Some(match self.deadline {
                Some(existing) => existing.min(deadline),
                None => deadline,
            });
        }
        self
    }

    pub fn cancel_token(mut self, token: &CancelToken) -> Self {
        self.token = Some(token.clone());
        self
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// `Err` once the token is cancelled or the deadline has passed.
    pub fn check(&self) -> Result<(), CancelReason> {
        if self.token.as_ref().is_some_and(CancelToken::is_cancelled) {
            return Err(CancelReason::Cancelled);
        }
        if self.deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            return Err(CancelReason::DeadlineExceeded);
        }
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        self.check().is_err()
    }

    /// Register `wake` to run when the token fires.
    ///
    /// Callers must register before their final `check()` under the same lock
    /// `wake` acquires, otherwise a cancellation can slip in between.
    pub(crate) fn on_cancel<F>(&self, wake: F) -> Option<CancelWatch>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.token.as_ref().map(|token| token.watch(Arc::new(wake)))
    }

    /// Block on `cond` until notified or until the deadline.
    ///
    /// Spurious wakeups are possible; callers re-check their condition and
    /// then `check()` in a loop.
    pub(crate) fn wait_on<'a, T>(
        &self,
        cond: &Condvar,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        match self.remaining() {
            None => cond.wait(guard).unwrap_or_else(PoisonError::into_inner),
            Some(remaining) => {
                let (guard, _) = cond
                    .wait_timeout(guard, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                guard
            }
        }
    }
}
