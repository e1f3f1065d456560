//! Bounded pool for fire-and-forget work.
//!
//! Stale-cache rebuilds and existence-filter registrations run here instead
//! of in detached tasks. The queue is bounded: when it is full a submission
//! is rejected and logged, never silently queued without limit. Every job
//! failure is logged at `error` and counted.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument, Span};

/// Error type returned by background jobs.
pub type JobError = Box<dyn std::error::Error + Send + Sync>;

type Job = BoxFuture<'static, Result<(), JobError>>;

struct Envelope {
    name: String,
    span: Span,
    job: Job,
}

/// Counters of a [`BackgroundPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PoolStats {
    /// Jobs accepted into the queue
    pub submitted: u64,
    /// Jobs refused because the queue was full or the pool was shut down
    pub rejected: u64,
    /// Jobs that returned `Ok`
    pub completed: u64,
    /// Jobs that returned `Err`
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Counters {
    fn finish(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Fixed set of worker tasks draining a bounded job queue.
pub struct BackgroundPool {
    sender: Mutex<Option<mpsc::Sender<Envelope>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for BackgroundPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundPool")
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl BackgroundPool {
    /// Spawns `workers` tasks on the current runtime sharing a queue of `capacity`.
    pub fn new(workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Envelope>(capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let handles = (0..workers.max(1))
            .map(|worker| {
                let receiver = Arc::clone(&receiver);
                let counters = Arc::clone(&counters);
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(Envelope { name, span, job }) = next else {
                            break;
                        };
                        match job.instrument(span.clone()).await {
                            Ok(()) => {
                                counters.completed.fetch_add(1, Ordering::Relaxed);
                                span.in_scope(|| debug!(worker, job = %name, "background job completed"));
                            }
                            Err(e) => {
                                counters.failed.fetch_add(1, Ordering::Relaxed);
                                span.in_scope(|| {
                                    error!(worker, job = %name, error = %e, "background job failed");
                                });
                            }
                        }
                        counters.finish();
                    }
                    debug!(worker, "background worker exited");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            counters,
        }
    }

    /// Queues a job. Returns `false` when the queue is full or the pool is shut down.
    ///
    /// The job runs inside the span that was current at submission.
    pub fn try_submit<F>(&self, name: impl Into<String>, job: F) -> bool
    where
        F: Future<Output = Result<(), JobError>> + Send + 'static,
    {
        let name = name.into();
        let guard = self.sender.lock();
        let Some(sender) = guard.as_ref() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(job = %name, "background pool is shut down, job rejected");
            return false;
        };

        self.counters.in_flight.fetch_add(1, Ordering::AcqRel);
        match sender.try_send(Envelope {
            name,
            span: Span::current(),
            job: job.boxed(),
        }) {
            Ok(()) => {
                self.counters.submitted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(e) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                self.counters.finish();
                let name = match e {
                    mpsc::error::TrySendError::Full(envelope)
                    | mpsc::error::TrySendError::Closed(envelope) => envelope.name,
                };
                warn!(job = %name, "background pool saturated, job rejected");
                false
            }
        }
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Waits until no accepted job is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.counters.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.counters.in_flight.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stops accepting jobs, lets queued jobs finish and joins the workers.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "background worker panicked");
            }
        }
        info!(stats = ?self.stats(), "background pool stopped");
    }
}
