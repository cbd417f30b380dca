// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Renormalization of historical scores when the worker emits new
//! quantiles.

use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;
use crate::results::Quantiles;

/// Rescores results already persisted for a job.
pub trait ScoresUpdater: Send + Sync {
    fn update(&self, job_id: &str, quantiles: &Quantiles, per_partition: bool) -> Result<()>;
}

/// Accepts quantiles from the result loop without blocking it.
pub trait Renormalizer: Send + Sync {
    fn renormalize(&self, quantiles: Quantiles);

    /// Block until no renormalization is running or queued.
    fn wait_until_idle(&self);

    fn is_idle(&self) -> bool;
}

/// Renormalizer for jobs without score updating.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRenormalizer;

impl Renormalizer for NoopRenormalizer {
    fn renormalize(&self, quantiles: Quantiles) {
        tracing::trace!(
            "[{}] ignoring quantiles at {}",
            quantiles.job_id,
            quantiles.timestamp
        );
    }

    fn wait_until_idle(&self) {}

    fn is_idle(&self) -> bool {
        true
    }
}

#[derive(Default)]
struct WorkState {
    pending: Option<Quantiles>,
    running: bool,
}

struct Inner {
    job_id: String,
    per_partition: bool,
    updater: Arc<dyn ScoresUpdater>,
    state: Mutex<WorkState>,
    idle: Condvar,
}

/// Runs one update at a time on a background thread. Quantiles that
/// arrive while an update runs replace any still queued, so only the
/// newest queued quantiles are applied next.
pub struct ShortCircuitingRenormalizer {
    inner: Arc<Inner>,
}

impl ShortCircuitingRenormalizer {
    pub fn new(job_id: &str, updater: Arc<dyn ScoresUpdater>, per_partition: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                job_id: job_id.to_string(),
                per_partition,
                updater,
                state: Mutex::new(WorkState::default()),
                idle: Condvar::new(),
            }),
        }
    }
}

/// Marks the renormalizer idle if an update panics, so waiters are not
/// left blocked on a thread that no longer exists.
struct PanicGuard<'a>(&'a Inner);

impl Drop for PanicGuard<'_> {
    fn drop(&mut self) {
        if !thread::panicking() {
            return;
        }
        tracing::error!("[{}] renormalization thread panicked", self.0.job_id);
        let mut state = self.0.state.lock();
        state.pending = None;
        state.running = false;
        self.0.idle.notify_all();
    }
}

impl Inner {
    fn run(&self) {
        let _guard = PanicGuard(self);
        loop {
            let quantiles = {
                let mut state = self.state.lock();
                match state.pending.take() {
                    Some(q) => q,
                    None => {
                        state.running = false;
                        self.idle.notify_all();
                        return;
                    }
                }
            };

            tracing::debug!(
                "[{}] renormalizing with quantiles at {}",
                self.job_id,
                quantiles.timestamp
            );
            if let Err(e) = self
                .updater
                .update(&self.job_id, &quantiles, self.per_partition)
            {
                tracing::error!("[{}] renormalization failed: {}", self.job_id, e);
            }
        }
    }
}

impl Renormalizer for ShortCircuitingRenormalizer {
    fn renormalize(&self, quantiles: Quantiles) {
        let mut state = self.inner.state.lock();
        if state.pending.replace(quantiles).is_some() {
            tracing::debug!("[{}] superseded queued quantiles", self.inner.job_id);
        }
        if state.running {
            return;
        }
        state.running = true;
        drop(state);

        let inner = self.inner.clone();
        let spawned = thread::Builder::new()
            .name(format!("renormalizer-{}", self.inner.job_id))
            .spawn(move || inner.run());
        if let Err(e) = spawned {
            tracing::error!(
                "[{}] failed to start renormalization thread: {}",
                self.inner.job_id,
                e
            );
            let mut state = self.inner.state.lock();
            state.pending = None;
            state.running = false;
            self.inner.idle.notify_all();
        }
    }

    fn wait_until_idle(&self) {
        let mut state = self.inner.state.lock();
        while state.running {
            self.inner.idle.wait(&mut state);
        }
    }

    fn is_idle(&self) -> bool {
        !self.inner.state.lock().running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{Receiver, Sender, bounded};
    use std::time::Duration;

    fn quantiles(timestamp: i64) -> Quantiles {
        Quantiles {
            job_id: "j".to_string(),
            timestamp,
            quantile_state: format!("state-{}", timestamp),
        }
    }

    /// Blocks each update until the test releases it.
    struct GatedUpdater {
        seen: Mutex<Vec<i64>>,
        started: Sender<i64>,
        release: Receiver<()>,
    }

    impl ScoresUpdater for GatedUpdater {
        fn update(&self, _job_id: &str, quantiles: &Quantiles, _per_partition: bool) -> Result<()> {
            self.started.send(quantiles.timestamp).ok();
            self.release.recv().ok();
            self.seen.lock().push(quantiles.timestamp);
            Ok(())
        }
    }

    #[test]
    fn test_queued_quantiles_are_short_circuited() {
        let (started_tx, started_rx) = bounded(8);
        let (release_tx, release_rx) = bounded(8);
        let updater = Arc::new(GatedUpdater {
            seen: Mutex::new(Vec::new()),
            started: started_tx,
            release: release_rx,
        });
        let renormalizer = ShortCircuitingRenormalizer::new("j", updater.clone(), false);

        renormalizer.renormalize(quantiles(1));
        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert!(!renormalizer.is_idle());

        renormalizer.renormalize(quantiles(2));
        renormalizer.renormalize(quantiles(3));
        release_tx.send(()).unwrap();

        assert_eq!(started_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 3);
        release_tx.send(()).unwrap();

        renormalizer.wait_until_idle();
        assert!(renormalizer.is_idle());
        assert_eq!(*updater.seen.lock(), vec![1, 3]);
    }

    #[test]
    fn test_idle_without_work() {
        let (started_tx, _started_rx) = bounded(1);
        let (_release_tx, release_rx) = bounded(1);
        let updater = Arc::new(GatedUpdater {
            seen: Mutex::new(Vec::new()),
            started: started_tx,
            release: release_rx,
        });
        let renormalizer = ShortCircuitingRenormalizer::new("j", updater, true);
        renormalizer.wait_until_idle();
        assert!(renormalizer.is_idle());
        assert!(NoopRenormalizer.is_idle());
    }

    struct PanickingUpdater;

    impl ScoresUpdater for PanickingUpdater {
        fn update(&self, _job_id: &str, _quantiles: &Quantiles, _per_partition: bool) -> Result<()> {
            panic!("scores index is gone");
        }
    }

    #[test]
    fn test_panicking_update_leaves_renormalizer_idle() {
        let renormalizer = Arc::new(ShortCircuitingRenormalizer::new(
            "j",
            Arc::new(PanickingUpdater),
            false,
        ));
        renormalizer.renormalize(quantiles(1));

        let (done_tx, done_rx) = bounded(1);
        let waiter = renormalizer.clone();
        thread::spawn(move || {
            waiter.wait_until_idle();
            done_tx.send(()).ok();
        });
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(renormalizer.is_idle());

        // Later quantiles still start a fresh update thread.
        renormalizer.renormalize(quantiles(2));
        renormalizer.wait_until_idle();
        assert!(renormalizer.is_idle());
    }
}
