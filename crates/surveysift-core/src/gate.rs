//! Admission control for outbound model calls.
//!
//! A [`ConcurrencyGate`] of capacity C lets at most C calls hold a slot at
//! once. A slot is taken before the optional pacing delay, held across the
//! call, and released when the call returns. Capacity 1 is sequential
//! execution; a zero delay disables pacing. The gate never reorders work.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Semaphore;

/// Returned when the gate was closed before a slot could be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("concurrency gate closed")]
pub struct GateClosed;

/// Fixed-capacity semaphore gate with pacing and peak instrumentation.
#[derive(Debug)]
pub struct ConcurrencyGate {
    semaphore: Semaphore,
    capacity: usize,
    delay: Duration,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGate {
    /// Create a gate. A capacity of zero is treated as one.
    pub fn new(capacity: usize, delay: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
            delay,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Run `call` while holding a slot.
    ///
    /// Waits for a slot, sleeps the pacing delay, awaits the call, then
    /// releases. Fails only if the gate was closed first.
    pub async fn run<F, Fut, T>(&self, call: F) -> Result<T, GateClosed>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _permit = self.semaphore.acquire().await.map_err(|_| GateClosed)?;
        let _holder = Holder::enter(self);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(call().await)
    }

    /// Reject every waiting and future acquisition. Held slots are unaffected.
    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Slots held right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of slots ever held simultaneously.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Tracks one held slot; decrements on drop so cancellation is counted too.
struct Holder<'a> {
    gate: &'a ConcurrencyGate,
}

impl<'a> Holder<'a> {
    fn enter(gate: &'a ConcurrencyGate) -> Self {
        let now = gate.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        gate.peak.fetch_max(now, Ordering::SeqCst);
        Self { gate }
    }
}

impl Drop for Holder<'_> {
    fn drop(&mut self) {
        self.gate.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}
