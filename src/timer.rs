//! Connection deadlines.
//!
//! A deadline closes its connection when it expires unless it is cancelled
//! first. Each connection holds at most one live deadline: the handshake
//! deadline, then the rolling heartbeat deadline.
//!
//! ## Lazy renewal
//!
//! Fast connections heartbeat far more often than their deadline expires.
//! Rescheduling on every heartbeat would churn the heap, so a deadline whose
//! renewed expiry would move by less than the lazy delay is left alone.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use slab::Slab;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::closer::Closer;

/// Default lazy renewal tolerance.
pub const DEFAULT_LAZY_DELAY: Duration = Duration::from_millis(300);

/// Deadline scheduling errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TimerError {
    /// The timer already tracks its maximum number of deadlines.
    #[error("timer full ({0} live deadlines)")]
    Full(usize),
}

/// A scheduled, cancellable deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineHandle {
    key: usize,
    id: u64,
    expire: Instant,
}

impl DeadlineHandle {
    /// Build a handle directly. Meant for `Timer` implementations.
    pub fn new(key: usize, id: u64, expire: Instant) -> Self {
        Self { key, id, expire }
    }

    /// Process-unique identity of this deadline.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the deadline fires.
    pub fn expire(&self) -> Instant {
        self.expire
    }
}

/// Deadline facility consumed by the connection tasks.
pub trait Timer: Send + Sync {
    /// Close `target` once `after` has elapsed unless cancelled.
    fn schedule(&self, after: Duration, target: Closer) -> Result<DeadlineHandle, TimerError>;

    /// Cancel a deadline. Cancelling a fired or cancelled deadline is a no-op.
    fn cancel(&self, handle: &DeadlineHandle);

    /// Whether rescheduling `handle` for `after` from now would move its
    /// expiry by less than the lazy delay.
    fn is_within_lazy_window(&self, handle: &DeadlineHandle, after: Duration) -> bool;
}

static NEXT_DEADLINE_ID: AtomicU64 = AtomicU64::new(1);

struct Entry {
    id: u64,
    target: Closer,
}

struct State {
    entries: Slab<Entry>,
    /// Min-heap by expiry. May hold stale entries for cancelled deadlines.
    heap: BinaryHeap<Reverse<(Instant, usize, u64)>>,
}

impl State {
    fn is_live(&self, key: usize, id: u64) -> bool {
        self.entries.get(key).is_some_and(|e| e.id == id)
    }

    /// Drop stale heap entries once they outnumber live ones.
    fn compact(&mut self) {
        if self.heap.len() <= 2 * self.entries.len() + 64 {
            return;
        }
        let entries = &self.entries;
        self.heap
            .retain(|Reverse((_, key, id))| entries.get(*key).is_some_and(|e| e.id == *id));
    }
}

/// Heap-backed timer driven by one background task.
///
/// The driver only holds a weak reference, so it stops once the last
/// `Arc<HeapTimer>` is dropped.
pub struct HeapTimer {
    state: Mutex<State>,
    wake: Arc<Notify>,
    max_entries: usize,
    lazy_delay: Duration,
}

impl HeapTimer {
    /// Create a timer tracking at most `max_entries` live deadlines.
    pub fn new(max_entries: usize, lazy_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(State {
                entries: Slab::with_capacity(max_entries.min(1024)),
                heap: BinaryHeap::new(),
            }),
            wake: Arc::new(Notify::new()),
            max_entries,
            lazy_delay,
        })
    }

    /// Create a timer and start its driver task on the current runtime.
    pub fn start(max_entries: usize, lazy_delay: Duration) -> Arc<Self> {
        let timer = Self::new(max_entries, lazy_delay);
        timer.spawn();
        timer
    }

    /// Spawn the task that fires expired deadlines.
    ///
    /// The task exits after the timer is dropped.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(drive(Arc::downgrade(self), Arc::clone(&self.wake)))
    }

    /// Number of live deadlines.
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Close every target due at `now` and return the next pending expiry.
    fn fire(&self, now: Instant) -> Option<Instant> {
        let (fired, next) = self.expire(now);
        for target in fired {
            if target.close() {
                debug!("deadline expired, connection closed");
            }
        }
        next
    }

    /// Remove every deadline due at `now`, returning their targets and the
    /// next expiry still pending.
    fn expire(&self, now: Instant) -> (Vec<Closer>, Option<Instant>) {
        let mut state = self.lock();
        let mut fired = Vec::new();

        while let Some(Reverse((expire, key, id))) = state.heap.peek().copied() {
            if expire > now {
                return (fired, Some(expire));
            }
            state.heap.pop();
            if state.is_live(key, id) {
                fired.push(state.entries.remove(key).target);
            }
        }
        (fired, None)
    }
}

impl Drop for HeapTimer {
    fn drop(&mut self) {
        // Lets a parked driver observe the dropped timer.
        self.wake.notify_one();
    }
}

async fn drive(timer: Weak<HeapTimer>, wake: Arc<Notify>) {
    loop {
        let next = match timer.upgrade() {
            Some(timer) => timer.fire(Instant::now()),
            None => break,
        };

        match next {
            Some(at) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(at) => {}
                    _ = wake.notified() => {}
                }
            }
            None => wake.notified().await,
        }
    }
    trace!("timer dropped, driver stopped");
}

impl Timer for HeapTimer {
    fn schedule(&self, after: Duration, target: Closer) -> Result<DeadlineHandle, TimerError> {
        let expire = Instant::now() + after;
        let id = NEXT_DEADLINE_ID.fetch_add(1, Ordering::Relaxed);

        let mut state = self.lock();
        if state.entries.len() >= self.max_entries {
            return Err(TimerError::Full(state.entries.len()));
        }
        let key = state.entries.insert(Entry { id, target });
        let earliest = state
            .heap
            .peek()
            .map_or(true, |Reverse((next, _, _))| expire < *next);
        state.heap.push(Reverse((expire, key, id)));
        drop(state);

        if earliest {
            self.wake.notify_one();
        }
        trace!(key, id, ?after, "deadline scheduled");
        Ok(DeadlineHandle { key, id, expire })
    }

    fn cancel(&self, handle: &DeadlineHandle) {
        let mut state = self.lock();
        if state.is_live(handle.key, handle.id) {
            state.entries.remove(handle.key);
            state.compact();
            trace!(key = handle.key, id = handle.id, "deadline cancelled");
        }
    }

    fn is_within_lazy_window(&self, handle: &DeadlineHandle, after: Duration) -> bool {
        let renewed = Instant::now() + after;
        renewed.saturating_duration_since(handle.expire) < self.lazy_delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires_and_closes_target() {
        let timer = HeapTimer::start(16, DEFAULT_LAZY_DELAY);
        let closer = Closer::new();

        timer.schedule(Duration::from_secs(5), closer.clone()).unwrap();
        assert_eq!(timer.len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        settle().await;
        assert!(!closer.is_closed());

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(closer.is_closed());
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_deadline_never_fires() {
        let timer = HeapTimer::start(16, DEFAULT_LAZY_DELAY);
        let closer = Closer::new();

        let handle = timer.schedule(Duration::from_secs(1), closer.clone()).unwrap();
        timer.cancel(&handle);
        timer.cancel(&handle);

        tokio::time::sleep(Duration::from_secs(3)).await;
        settle().await;
        assert!(!closer.is_closed());
        assert!(timer.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_rearms_driver() {
        let timer = HeapTimer::start(16, DEFAULT_LAZY_DELAY);
        let late = Closer::new();
        let early = Closer::new();

        timer.schedule(Duration::from_secs(60), late.clone()).unwrap();
        settle().await;
        timer.schedule(Duration::from_secs(1), early.clone()).unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(early.is_closed());
        assert!(!late.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_key_does_not_cancel_reused_slot() {
        let timer = HeapTimer::start(16, DEFAULT_LAZY_DELAY);
        let first = timer.schedule(Duration::from_secs(1), Closer::new()).unwrap();
        timer.cancel(&first);

        let closer = Closer::new();
        let second = timer.schedule(Duration::from_secs(1), closer.clone()).unwrap();
        assert_ne!(first.id(), second.id());

        timer.cancel(&first);
        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert!(closer.is_closed());
    }

    #[tokio::test]
    async fn test_full_timer_rejects_schedule() {
        let timer = HeapTimer::new(1, DEFAULT_LAZY_DELAY);
        timer.schedule(Duration::from_secs(1), Closer::new()).unwrap();
        let err = timer
            .schedule(Duration::from_secs(1), Closer::new())
            .unwrap_err();
        assert_eq!(err, TimerError::Full(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lazy_window() {
        let timer = HeapTimer::new(16, DEFAULT_LAZY_DELAY);
        let hb = Duration::from_secs(10);
        let handle = timer.schedule(hb, Closer::new()).unwrap();

        assert!(timer.is_within_lazy_window(&handle, hb));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(timer.is_within_lazy_window(&handle, hb));

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!timer.is_within_lazy_window(&handle, hb));
    }

    #[tokio::test]
    async fn test_driver_stops_when_timer_dropped() {
        let timer = HeapTimer::new(16, DEFAULT_LAZY_DELAY);
        let driver = timer.spawn();
        settle().await;
        assert!(!driver.is_finished());

        drop(timer);
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_stops_with_pending_deadline() {
        let timer = HeapTimer::new(16, DEFAULT_LAZY_DELAY);
        let closer = Closer::new();
        timer.schedule(Duration::from_secs(60), closer.clone()).unwrap();
        let driver = timer.spawn();
        settle().await;

        drop(timer);
        tokio::time::timeout(Duration::from_secs(1), driver)
            .await
            .unwrap()
            .unwrap();
        assert!(!closer.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_compacts_heap() {
        let timer = HeapTimer::new(1024, DEFAULT_LAZY_DELAY);
        for _ in 0..200 {
            let h = timer.schedule(Duration::from_secs(30), Closer::new()).unwrap();
            timer.cancel(&h);
        }
        assert!(timer.lock().heap.len() <= 64);
    }
}
