//! Supervised background worker
//!
//! Runs fire-and-forget jobs (delayed flush timers, access-count updates).
//! Best-effort jobs go through a bounded queue and are skipped when it is
//! full. Scheduled jobs such as flush timers have their own unbounded path
//! so a burst of best-effort work can never crowd them out. Every job is
//! owned by the worker's join set, so [`Worker::shutdown`] can signal
//! sleeping jobs to wake early and then wait for all of them to finish.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, warn};

type Job = BoxFuture<'static, ()>;

#[derive(Clone)]
struct Senders {
    queued: mpsc::Sender<Job>,
    scheduled: mpsc::UnboundedSender<Job>,
}

/// Job queues drained by a single supervising task
pub struct Worker {
    senders: Mutex<Option<Senders>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl Worker {
    /// Start the supervising task. Must be called from within a tokio runtime.
    pub fn new(queue_capacity: usize) -> Self {
        let (queued, queued_rx) = mpsc::channel(queue_capacity.max(1));
        let (scheduled, scheduled_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        let supervisor = tokio::spawn(supervise(queued_rx, scheduled_rx));
        debug!(queue_capacity, "Background worker started");

        Self {
            senders: Mutex::new(Some(Senders { queued, scheduled })),
            supervisor: Mutex::new(Some(supervisor)),
            shutdown_tx,
        }
    }

    fn senders(&self) -> Option<Senders> {
        lock(&self.senders).clone()
    }

    /// Queue a job, waiting for room if the bounded queue is full.
    ///
    /// Returns false once the worker has been shut down.
    pub async fn submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.senders() {
            Some(senders) => senders.queued.send(Box::pin(job)).await.is_ok(),
            None => false,
        }
    }

    /// Queue a best-effort job without waiting.
    ///
    /// Returns false when the bounded queue is full or the worker has been
    /// shut down.
    pub fn try_submit<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Some(senders) = self.senders() else {
            return false;
        };
        match senders.queued.try_send(Box::pin(job)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("Worker queue full, job skipped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Hand over a job that must run, bypassing the bounded queue.
    ///
    /// Callers are responsible for keeping the number of scheduled jobs
    /// small (one armed timer per buffer). Returns false only once the
    /// worker has been shut down.
    pub fn schedule<F>(&self, job: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match self.senders() {
            Some(senders) => senders.scheduled.send(Box::pin(job)).is_ok(),
            None => false,
        }
    }

    /// Receiver that flips to `true` when shutdown begins.
    ///
    /// Jobs that sleep should race their sleep against this signal.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.senders).is_some()
    }

    /// Stop accepting jobs, wake sleeping jobs and wait for every queued
    /// and running job to complete. Later calls return immediately.
    pub async fn shutdown(&self) {
        let senders = lock(&self.senders).take();
        if senders.is_none() {
            return;
        }
        drop(senders);
        self.shutdown_tx.send_replace(true);

        let supervisor = lock(&self.supervisor).take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker supervisor terminated abnormally");
            }
        }
        debug!("Background worker stopped");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn supervise(
    mut queued: mpsc::Receiver<Job>,
    mut scheduled: mpsc::UnboundedReceiver<Job>,
) {
    let mut jobs = JoinSet::new();
    let (mut queued_open, mut scheduled_open) = (true, true);

    while queued_open || scheduled_open {
        tokio::select! {
            job = scheduled.recv(), if scheduled_open => match job {
                Some(job) => {
                    jobs.spawn(job);
                }
                None => scheduled_open = false,
            },
            job = queued.recv(), if queued_open => match job {
                Some(job) => {
                    jobs.spawn(job);
                }
                None => queued_open = false,
            },
            Some(result) = jobs.join_next(), if !jobs.is_empty() => {
                report(result);
            }
        }
    }

    while let Some(result) = jobs.join_next().await {
        report(result);
    }
}

fn report(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        error!(error = %e, "Background job failed");
    }
}
