// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Rendezvous between a thread waiting for a flush and the result loop
//! that sees the worker acknowledge it.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Pending,
    Acknowledged,
    Cleared,
}

/// How long an acknowledgement nobody waits for is kept. Waiters that poll
/// in slices re-register well within this window.
pub const UNCLAIMED_ACK_RETENTION: Duration = Duration::from_secs(300);

/// One-shot event for a single flush id. Signalling twice is harmless.
struct FlushLatch {
    state: Mutex<LatchState>,
    acknowledged_at: Mutex<Option<Instant>>,
    signal: Condvar,
}

impl FlushLatch {
    fn new() -> Self {
        Self {
            state: Mutex::new(LatchState::Pending),
            acknowledged_at: Mutex::new(None),
            signal: Condvar::new(),
        }
    }

    fn set(&self, to: LatchState) {
        let mut state = self.state.lock();
        if *state == LatchState::Pending {
            *state = to;
            if to == LatchState::Acknowledged {
                *self.acknowledged_at.lock() = Some(Instant::now());
            }
            self.signal.notify_all();
        }
    }

    fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state == LatchState::Pending {
            if self.signal.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        *state == LatchState::Acknowledged
    }

    fn acknowledged_longer_than(&self, retention: Duration) -> bool {
        self.acknowledged_at
            .lock()
            .is_some_and(|at| at.elapsed() >= retention)
    }
}

pub struct FlushListener {
    awaiting_flushed: Mutex<HashMap<String, Arc<FlushLatch>>>,
    cleared: AtomicBool,
    unclaimed_ack_retention: Duration,
}

impl Default for FlushListener {
    fn default() -> Self {
        Self::with_retention(UNCLAIMED_ACK_RETENTION)
    }
}

impl FlushListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listener that forgets acknowledgements nobody claimed after
    /// `unclaimed_ack_retention`.
    pub fn with_retention(unclaimed_ack_retention: Duration) -> Self {
        Self {
            awaiting_flushed: Mutex::new(HashMap::new()),
            cleared: AtomicBool::new(false),
            unclaimed_ack_retention,
        }
    }

    /// Block until `flush_id` is acknowledged or `timeout` passes. Returns
    /// `false` on timeout and once the listener has been cleared. The id is
    /// forgotten on return either way.
    pub fn wait_for_flush(&self, flush_id: &str, timeout: Duration) -> bool {
        if self.is_cleared() {
            return false;
        }

        let latch = self.latch(flush_id);
        // A clear that raced with registration may have missed this latch.
        if self.is_cleared() {
            latch.set(LatchState::Cleared);
        }
        let acknowledged = latch.wait(timeout);
        self.awaiting_flushed.lock().remove(flush_id);
        acknowledged
    }

    /// Mark `flush_id` acknowledged, registering it if nobody waits yet.
    /// Older acknowledgements that no waiter claimed within the retention
    /// window are dropped.
    pub fn acknowledge_flush(&self, flush_id: &str) {
        let latch = {
            let mut latches = self.awaiting_flushed.lock();
            let retention = self.unclaimed_ack_retention;
            // The map holds one reference; a waiter holds another.
            latches.retain(|id, latch| {
                id == flush_id
                    || Arc::strong_count(latch) > 1
                    || !latch.acknowledged_longer_than(retention)
            });
            latches
                .entry(flush_id.to_string())
                .or_insert_with(|| Arc::new(FlushLatch::new()))
                .clone()
        };
        latch.set(LatchState::Acknowledged);
    }

    /// Release every waiter with `false` and refuse later waits. Only the
    /// first call has any effect.
    pub fn clear(&self) {
        if self
            .cleared
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let latches: Vec<_> = self.awaiting_flushed.lock().drain().map(|(_, l)| l).collect();
        for latch in latches {
            latch.set(LatchState::Cleared);
        }
    }

    pub fn is_cleared(&self) -> bool {
        self.cleared.load(Ordering::Acquire)
    }

    /// Ids currently registered, waited on or acknowledged early.
    pub fn pending_count(&self) -> usize {
        self.awaiting_flushed.lock().len()
    }

    fn latch(&self, flush_id: &str) -> Arc<FlushLatch> {
        self.awaiting_flushed
            .lock()
            .entry(flush_id.to_string())
            .or_insert_with(|| Arc::new(FlushLatch::new()))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acknowledge_before_wait() {
        let listener = FlushListener::new();
        listener.acknowledge_flush("1");
        assert_eq!(listener.pending_count(), 1);

        let start = Instant::now();
        assert!(listener.wait_for_flush("1", Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_acknowledge_after_wait() {
        let listener = Arc::new(FlushListener::new());
        let waiter = {
            let listener = listener.clone();
            std::thread::spawn(move || listener.wait_for_flush("1", Duration::from_secs(10)))
        };

        while listener.pending_count() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
        listener.acknowledge_flush("1");
        assert!(waiter.join().unwrap());
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_wait_times_out() {
        let listener = FlushListener::new();
        let start = Instant::now();
        assert!(!listener.wait_for_flush("1", Duration::from_millis(100)));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_secs(2));
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_repeated_acknowledge_is_harmless() {
        let listener = FlushListener::new();
        listener.acknowledge_flush("7");
        listener.acknowledge_flush("7");
        assert!(listener.wait_for_flush("7", Duration::from_millis(10)));
    }

    #[test]
    fn test_clear_releases_all_waiters() {
        let listener = Arc::new(FlushListener::new());
        let waiters: Vec<_> = (0..5)
            .map(|i| {
                let listener = listener.clone();
                std::thread::spawn(move || {
                    listener.wait_for_flush(&i.to_string(), Duration::from_secs(60))
                })
            })
            .collect();

        while listener.pending_count() < 5 {
            std::thread::sleep(Duration::from_millis(5));
        }
        let start = Instant::now();
        listener.clear();
        for waiter in waiters {
            assert!(!waiter.join().unwrap());
        }
        assert!(start.elapsed() < Duration::from_secs(5));

        let start = Instant::now();
        assert!(!listener.wait_for_flush("new", Duration::from_secs(60)));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(listener.is_cleared());
    }

    #[test]
    fn test_unclaimed_acknowledgements_expire() {
        let listener = FlushListener::with_retention(Duration::from_millis(20));

        // The waiter gave up before the worker answered.
        assert!(!listener.wait_for_flush("1", Duration::from_millis(1)));
        listener.acknowledge_flush("1");
        assert_eq!(listener.pending_count(), 1);

        std::thread::sleep(Duration::from_millis(40));
        listener.acknowledge_flush("2");
        assert_eq!(listener.pending_count(), 1);
        assert!(listener.wait_for_flush("2", Duration::from_millis(10)));
        assert!(!listener.wait_for_flush("1", Duration::from_millis(10)));
        assert_eq!(listener.pending_count(), 0);
    }

    #[test]
    fn test_registered_waiter_survives_pruning() {
        let listener = Arc::new(FlushListener::with_retention(Duration::ZERO));
        let waiter = {
            let listener = listener.clone();
            std::thread::spawn(move || listener.wait_for_flush("1", Duration::from_secs(10)))
        };
        while listener.pending_count() == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }

        listener.acknowledge_flush("2");
        listener.acknowledge_flush("3");
        listener.acknowledge_flush("1");
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_clear_is_idempotent() {
        let listener = FlushListener::new();
        listener.clear();
        listener.clear();
        assert!(listener.is_cleared());
        assert_eq!(listener.pending_count(), 0);
    }
}
