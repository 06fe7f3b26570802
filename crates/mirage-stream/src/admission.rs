//! Admission counters shared across the decode and present paths.
//!
//! [`AdmissionGate`] bounds concurrent work (decoder submissions, in-flight
//! draws) with a dynamically adjustable limit. [`SequenceGate`] keeps a
//! concurrent present path from re-showing a frame older than one already
//! on screen.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use tokio::sync::Notify;

use crate::error::StreamError;

/// Counting gate with a runtime-adjustable limit.
///
/// `try_acquire` is the non-blocking form used by the render tick;
/// `acquire` suspends and is used by decoder submissions. Raising the limit
/// drains as many waiters as now fit; closing cancels them all.
pub struct AdmissionGate {
    limit: AtomicU32,
    in_flight: AtomicU32,
    closed: AtomicBool,
    notify: Notify,
}

impl AdmissionGate {
    pub fn new(limit: u32) -> Self {
        Self {
            limit: AtomicU32::new(limit),
            in_flight: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self) -> bool {
        let limit = self.limit.load(Ordering::Acquire);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < limit).then_some(n + 1)
            })
            .is_ok()
    }

    /// Wait for a slot. Returns `Err(Cancelled)` if the gate is closed
    /// while waiting.
    pub async fn acquire(&self) -> Result<(), StreamError> {
        loop {
            // Register interest before checking, so a release between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(StreamError::Cancelled);
            }
            if self.try_acquire() {
                return Ok(());
            }
            notified.await;
        }
    }

    /// Give a slot back.
    pub fn release(&self) {
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        self.notify.notify_waiters();
    }

    /// Change the limit. Waiters that fit under a raised limit wake up.
    pub fn set_limit(&self, limit: u32) {
        self.limit.store(limit, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn limit(&self) -> u32 {
        self.limit.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Cancel all pending and future waiters.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Tracks the newest presented cache sequence.
///
/// Zero means "nothing presented yet"; internally the value is stored
/// shifted by one so sequence 0 has no special meaning to callers.
pub struct SequenceGate(AtomicU64);

impl SequenceGate {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Record a presented sequence. Out-of-order calls keep the maximum.
    pub fn note_presented(&self, sequence: u64) {
        self.0.fetch_max(sequence + 1, Ordering::AcqRel);
    }

    /// An entry is stale if a newer-or-equal sequence was already
    /// presented.
    pub fn is_stale(&self, sequence: u64) -> bool {
        sequence < self.0.load(Ordering::Acquire)
    }
}

impl Default for SequenceGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn counter_respects_limit() {
        let gate = AdmissionGate::new(2);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());
        assert!(!gate.try_acquire());
        assert_eq!(gate.in_flight(), 2);

        gate.release();
        assert_eq!(gate.in_flight(), 1);
        assert!(gate.try_acquire());
    }

    #[test]
    fn in_flight_is_min_of_attempts_and_limit_minus_releases() {
        // After N successful tryAcquire(limit=L) and M releases:
        // in_flight = max(0, min(L, N) - M).
        let gate = AdmissionGate::new(3);
        let mut acquired = 0;
        for _ in 0..7 {
            if gate.try_acquire() {
                acquired += 1;
            }
        }
        assert_eq!(acquired, 3);
        for _ in 0..2 {
            gate.release();
        }
        assert_eq!(gate.in_flight(), 1);

        // Releases never underflow.
        gate.release();
        gate.release();
        assert_eq!(gate.in_flight(), 0);
    }

    #[test]
    fn lowering_limit_starves_new_acquisitions() {
        let gate = AdmissionGate::new(3);
        assert!(gate.try_acquire());
        assert!(gate.try_acquire());

        gate.set_limit(1);
        assert!(!gate.try_acquire());
        gate.release();
        // Still at the (new) limit of 1.
        assert!(!gate.try_acquire());
        gate.release();
        assert!(gate.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let gate = Arc::new(AdmissionGate::new(1));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        gate.release();
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.in_flight(), 1);
    }

    #[tokio::test]
    async fn raising_limit_drains_waiters() {
        let gate = Arc::new(AdmissionGate::new(1));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.set_limit(2);
        waiter.await.unwrap().unwrap();
        assert_eq!(gate.in_flight(), 2);
    }

    #[tokio::test]
    async fn close_cancels_waiters() {
        let gate = Arc::new(AdmissionGate::new(1));
        assert!(gate.try_acquire());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        gate.close();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(StreamError::Cancelled)
        ));
    }

    #[test]
    fn sequence_gate_staleness() {
        let gate = SequenceGate::new();
        assert!(!gate.is_stale(0));
        assert!(!gate.is_stale(5));

        gate.note_presented(5);
        assert!(gate.is_stale(4));
        assert!(gate.is_stale(5));
        assert!(!gate.is_stale(6));
    }

    #[test]
    fn sequence_gate_keeps_maximum() {
        let gate = SequenceGate::new();
        gate.note_presented(9);
        gate.note_presented(3);
        assert!(gate.is_stale(9));
        assert!(!gate.is_stale(10));
    }
}
