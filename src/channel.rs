//! Fixed-capacity FIFO channel for producer-consumer pipelines.
//!
//! A `Mutex<VecDeque<T>>` guarded by two condition variables: producers park
//! on `not_full`, consumers on `not_empty`. Closing is one-way; after it,
//! `put` fails at once and `take` drains what is left before reporting
//! [`ChannelError::Closed`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, Weak};

use crate::config::ChannelConfig;
use crate::context::Context;
use crate::error::{ChannelError, PutError};

struct State<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    capacity: usize,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Bounded blocking queue. Clones are handles to the same channel.
pub struct BoundedChannel<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BoundedChannel<T> {
    fn clone(&self) -> Self {
        BoundedChannel {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for BoundedChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("BoundedChannel")
            .field("len", &state.buffer.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .finish()
    }
}

impl<T: Send + 'static> BoundedChannel<T> {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "channel capacity must be at least 1");

        BoundedChannel {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    buffer: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_full: Condvar::new(),
                not_empty: Condvar::new(),
                capacity,
            }),
        }
    }

    /// Build from a validated [`ChannelConfig`].
    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.capacity)
    }

    /// Append `item`, blocking while the buffer is full.
    ///
    /// Fails with `Closed` if the channel is or becomes closed, or with
    /// `Cancelled` if `ctx` fires while waiting. The item comes back inside
    /// the error either way.
    pub fn put(&self, item: T, ctx: &Context) -> Result<(), PutError<T>> {
        let mut state = self.shared.lock();
        let mut watch = None;

        loop {
            if state.closed {
                return Err(PutError::new(item, ChannelError::Closed));
            }
            if state.buffer.len() < self.shared.capacity {
                state.buffer.push_back(item);
                drop(state);
                self.shared.not_empty.notify_one();
                return Ok(());
            }

            if watch.is_none() {
                watch = ctx.on_cancel(self.waker());
            }
            if let Err(reason) = ctx.check() {
                drop(state);
                self.shared.not_full.notify_one();
                tracing::debug!(%reason, "put cancelled");
                return Err(PutError::new(item, ChannelError::Cancelled(reason)));
            }
            state = ctx.wait_on(&self.shared.not_full, state);
        }
    }

    /// Remove the oldest item, blocking while the buffer is empty.
    ///
    /// Once closed, keeps returning buffered items in order and then fails
    /// with `Closed`.
    pub fn take(&self, ctx: &Context) -> Result<T, ChannelError> {
        let mut state = self.shared.lock();
        let mut watch = None;

        loop {
            if let Some(item) = state.buffer.pop_front() {
                drop(state);
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(ChannelError::Closed);
            }

            if watch.is_none() {
                watch = ctx.on_cancel(self.waker());
            }
            if let Err(reason) = ctx.check() {
                // A notification meant for us may have landed just now; pass it on.
                drop(state);
                self.shared.not_empty.notify_one();
                tracing::debug!(%reason, "take cancelled");
                return Err(ChannelError::Cancelled(reason));
            }
            state = ctx.wait_on(&self.shared.not_empty, state);
        }
    }

    /// Non-blocking `put`; fails with `Full` instead of waiting.
    pub fn try_put(&self, item: T) -> Result<(), PutError<T>> {
        let mut state = self.shared.lock();
        if state.closed {
            return Err(PutError::new(item, ChannelError::Closed));
        }
        if state.buffer.len() >= self.shared.capacity {
            return Err(PutError::new(item, ChannelError::Full));
        }
        state.buffer.push_back(item);
        drop(state);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking `take`; fails with `Empty` while open and empty.
    pub fn try_take(&self) -> Result<T, ChannelError> {
        let mut state = self.shared.lock();
        match state.buffer.pop_front() {
            Some(item) => {
                drop(state);
                self.shared.not_full.notify_one();
                Ok(item)
            }
            None if state.closed => Err(ChannelError::Closed),
            None => Err(ChannelError::Empty),
        }
    }

    /// Close the channel and wake every blocked producer and consumer.
    ///
    /// Idempotent; returns `true` only for the call that closed it.
    pub fn close(&self) -> bool {
        let mut state = self.shared.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        let remaining = state.buffer.len();
        drop(state);

        tracing::debug!(remaining, capacity = self.shared.capacity, "channel closed");
        self.shared.not_full.notify_all();
        self.shared.not_empty.notify_all();
        true
    }

    /// Iterate over items until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { channel: self }
    }

    // Wakes every waiter when a cancel token fires. Holds only a weak
    // reference so a registered watch never keeps the channel alive.
    fn waker(&self) -> impl Fn() + Send + Sync + 'static {
        let shared: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        move || {
            if let Some(shared) = shared.upgrade() {
                drop(shared.lock());
                shared.not_full.notify_all();
                shared.not_empty.notify_all();
            }
        }
    }
}

impl<T> BoundedChannel<T> {
    /// Buffered items right now. A snapshot: it may be stale on return.
    pub fn len(&self) -> usize {
        self.shared.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed
    }
}

/// Blocking iterator returned by [`BoundedChannel::iter`].
pub struct Iter<'a, T> {
    channel: &'a BoundedChannel<T>,
}

impl<T: Send + 'static> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.channel.take(&Context::background()).ok()
    }
}

impl<'a, T: Send + 'static> IntoIterator for &'a BoundedChannel<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::CancelToken;
    use crate::error::CancelReason;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    fn bg() -> Context {
        Context::background()
    }

    #[test]
    fn test_capacity_two_scenario() {
        let channel = BoundedChannel::new(2);
        channel.put(1, &bg()).unwrap();
        channel.put(2, &bg()).unwrap();
        assert_eq!(channel.len(), 2);

        let done = Arc::new(AtomicBool::new(false));
        let producer = {
            let channel = channel.clone();
            let done = Arc::clone(&done);
            thread::spawn(move || {
                channel.put(3, &Context::background()).unwrap();
                done.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!done.load(Ordering::SeqCst), "third put must block while full");

        assert_eq!(channel.take(&bg()).unwrap(), 1);
        producer.join().unwrap();
        assert!(done.load(Ordering::SeqCst));

        assert_eq!(channel.take(&bg()).unwrap(), 2);
        assert_eq!(channel.take(&bg()).unwrap(), 3);
        assert!(channel.is_empty());
    }

    #[test]
    fn test_close_drains_then_reports_closed() {
        let channel = BoundedChannel::new(4);
        for i in 0..3 {
            channel.put(i, &bg()).unwrap();
        }
        assert!(channel.close());
        assert!(!channel.close());
        assert!(channel.is_closed());

        let err = channel.put(99, &bg()).unwrap_err();
        assert_eq!(err.error(), ChannelError::Closed);
        assert_eq!(err.into_inner(), 99);

        assert_eq!(channel.take(&bg()).unwrap(), 0);
        assert_eq!(channel.take(&bg()).unwrap(), 1);
        assert_eq!(channel.take(&bg()).unwrap(), 2);
        assert_eq!(channel.take(&bg()), Err(ChannelError::Closed));
        assert_eq!(channel.try_take(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_close_wakes_blocked_producer() {
        let channel = BoundedChannel::new(1);
        channel.put("first", &bg()).unwrap();

        let producer = {
            let channel = channel.clone();
            thread::spawn(move || channel.put("second", &Context::background()))
        };
        thread::sleep(Duration::from_millis(50));
        channel.close();

        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.into_parts(), ("second", ChannelError::Closed));
        assert_eq!(channel.take(&bg()), Ok("first"));
    }

    #[test]
    fn test_close_wakes_blocked_consumer() {
        let channel: BoundedChannel<u8> = BoundedChannel::new(1);
        let consumer = {
            let channel = channel.clone();
            thread::spawn(move || channel.take(&Context::background()))
        };
        thread::sleep(Duration::from_millis(50));
        channel.close();
        assert_eq!(consumer.join().unwrap(), Err(ChannelError::Closed));
    }

    #[test]
    fn test_take_times_out() {
        let channel: BoundedChannel<u8> = BoundedChannel::new(1);
        let start = Instant::now();
        let result = channel.take(&Context::with_timeout(Duration::from_millis(50)));

        assert_eq!(result, Err(ChannelError::Cancelled(CancelReason::DeadlineExceeded)));
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_put_times_out_and_keeps_state() {
        let channel = BoundedChannel::new(1);
        channel.put(String::from("kept"), &bg()).unwrap();

        let err = channel
            .put(String::from("rejected"), &Context::with_timeout(Duration::from_millis(30)))
            .unwrap_err();
        assert_eq!(err.error(), ChannelError::Cancelled(CancelReason::DeadlineExceeded));
        assert_eq!(err.into_inner(), "rejected");

        assert_eq!(channel.len(), 1);
        assert_eq!(channel.take(&bg()).unwrap(), "kept");
    }

    #[test]
    fn test_explicit_cancel_wakes_blocked_take() {
        let channel: BoundedChannel<u8> = BoundedChannel::new(1);
        let token = CancelToken::new();

        let consumer = {
            let channel = channel.clone();
            let ctx = token.context();
            thread::spawn(move || {
                let start = Instant::now();
                (channel.take(&ctx), start.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        token.cancel();

        let (result, waited) = consumer.join().unwrap();
        assert_eq!(result, Err(ChannelError::Cancelled(CancelReason::Cancelled)));
        assert!(waited < Duration::from_secs(5));
    }

    #[test]
    fn test_explicit_cancel_wakes_blocked_put() {
        let channel = BoundedChannel::new(1);
        channel.put(1u8, &bg()).unwrap();
        let token = CancelToken::new();

        let producer = {
            let channel = channel.clone();
            let ctx = token.context();
            thread::spawn(move || channel.put(2, &ctx))
        };
        thread::sleep(Duration::from_millis(50));
        token.cancel();

        let err = producer.join().unwrap().unwrap_err();
        assert_eq!(err.into_parts(), (2, ChannelError::Cancelled(CancelReason::Cancelled)));
        assert_eq!(channel.len(), 1);
    }

    #[test]
    fn test_fired_context_does_not_block_ready_operations() {
        let channel = BoundedChannel::new(1);
        let token = CancelToken::new();
        token.cancel();
        let ctx = token.context();

        channel.put(5, &ctx).unwrap();
        assert_eq!(channel.take(&ctx), Ok(5));
        assert_eq!(channel.take(&ctx), Err(ChannelError::Cancelled(CancelReason::Cancelled)));
    }

    #[test]
    fn test_try_variants() {
        let channel = BoundedChannel::new(1);
        assert_eq!(channel.try_take(), Err(ChannelError::Empty));

        channel.try_put('a').unwrap();
        let err = channel.try_put('b').unwrap_err();
        assert_eq!(err.into_parts(), ('b', ChannelError::Full));

        assert_eq!(channel.try_take(), Ok('a'));
        channel.close();
        assert_eq!(channel.try_put('c').unwrap_err().error(), ChannelError::Closed);
    }

    #[test]
    fn test_iter_stops_after_close() {
        let channel = BoundedChannel::new(2);
        let producer = {
            let channel = channel.clone();
            thread::spawn(move || {
                for i in 0..10 {
                    channel.put(i, &Context::background()).unwrap();
                }
                channel.close();
            })
        };

        let received: Vec<i32> = channel.iter().collect();
        producer.join().unwrap();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_multiple_producers_multiple_consumers() {
        let channel = BoundedChannel::new(3);
        let producers: Vec<_> = (0..4)
            .map(|id| {
                let channel = channel.clone();
                thread::spawn(move || {
                    for seq in 0..25 {
                        channel.put((id, seq), &Context::background()).unwrap();
                    }
                })
            })
            .collect();
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let channel = channel.clone();
                thread::spawn(move || channel.iter().collect::<Vec<(i32, i32)>>())
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        channel.close();

        let mut per_producer: Vec<Vec<i32>> = vec![Vec::new(); 4];
        let mut total = 0;
        for consumer in consumers {
            let items = consumer.join().unwrap();
            total += items.len();
            // Each consumer sees any single producer's items in put order.
            for id in 0..4 {
                let seqs: Vec<i32> = items
                    .iter()
                    .filter(|(p, _)| *p == id)
                    .map(|(_, s)| *s)
                    .collect();
                assert!(seqs.windows(2).all(|w| w[0] < w[1]));
                per_producer[id as usize].extend(seqs);
            }
        }
        assert_eq!(total, 100);
        for mut seqs in per_producer {
            seqs.sort();
            assert_eq!(seqs, (0..25).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_from_config() {
        let config = ChannelConfig {
            capacity: 8,
            ..ChannelConfig::default()
        };
        let channel: BoundedChannel<u8> = BoundedChannel::from_config(&config);
        assert_eq!(channel.capacity(), 8);
    }

    #[test]
    #[should_panic(expected = "capacity must be at least 1")]
    fn test_zero_capacity_panics() {
        let _ = BoundedChannel::<u8>::new(0);
    }

    proptest! {
        #[test]
        fn test_fifo_order_across_threads(
            items in prop::collection::vec(any::<u16>(), 0..200),
            capacity in 1usize..8,
        ) {
            let channel = BoundedChannel::new(capacity);
            let producer = {
                let channel = channel.clone();
                let items = items.clone();
                thread::spawn(move || {
                    for item in items {
                        channel.put(item, &Context::background()).unwrap();
                    }
                    channel.close();
                })
            };

            let mut received = Vec::with_capacity(items.len());
            while let Ok(item) = channel.take(&Context::background()) {
                prop_assert!(channel.len() <= capacity);
                received.push(item);
            }
            producer.join().unwrap();
            prop_assert_eq!(received, items);
        }

        #[test]
        fn test_len_never_exceeds_capacity(
            ops in prop::collection::vec(any::<bool>(), 1..100),
            capacity in 1usize..6,
        ) {
            let channel = BoundedChannel::new(capacity);
            let mut expected = std::collections::VecDeque::new();
            let mut next = 0u32;
            for is_put in ops {
                if is_put {
                    match channel.try_put(next) {
                        Ok(()) => expected.push_back(next),
                        Err(err) => prop_assert_eq!(err.error(), ChannelError::Full),
                    }
                    next += 1;
                } else {
                    prop_assert_eq!(channel.try_take().ok(), expected.pop_front());
                }
                prop_assert!(channel.len() <= capacity);
                prop_assert_eq!(channel.len(), expected.len());
            }
        }
    }
}
