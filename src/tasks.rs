//! Detached background jobs with a timeout and an error sink
//!
//! Jobs never report back to the request that submitted them; outcomes are
//! logged and counted. When every slot is busy, new immediate submissions
//! are dropped. Delayed jobs take a slot only once their delay has passed.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct BackgroundTasks {
    slots: Arc<Semaphore>,
    timeout: Duration,
    counters: Arc<Counters>,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
    /// Jobs still inside their delay; they hold no slot yet
    delayed: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl BackgroundTasks {
    pub fn new(slots: usize, timeout: Duration) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(slots.max(1))),
            timeout,
            counters: Arc::new(Counters::default()),
            handles: Arc::new(Mutex::new(Vec::new())),
            delayed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Run `job` now; returns false when it was dropped
    pub async fn submit<F>(&self, name: &'static str, doc_id: String, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let Ok(permit) = Arc::clone(&self.slots).try_acquire_owned() else {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(task = name, doc_id = %doc_id, "background slots exhausted, dropping task");
            return false;
        };
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let counters = Arc::clone(&self.counters);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            let _permit = permit;
            run_job(name, &doc_id, timeout, &counters, job).await;
        });

        let mut handles = self.handles.lock().await;
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
        true
    }

    /// Run `job` after `delay`. The job waits for a slot once the delay has
    /// passed, and its timeout starts when it gets one.
    pub async fn submit_after<F>(&self, name: &'static str, doc_id: String, delay: Duration, job: F) -> bool
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if delay.is_zero() {
            return self.submit(name, doc_id, job).await;
        }
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let slots = Arc::clone(&self.slots);
        let counters = Arc::clone(&self.counters);
        let timeout = self.timeout;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Ok(_permit) = slots.acquire_owned().await else {
                counters.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            };
            run_job(name, &doc_id, timeout, &counters, job).await;
        });

        let mut delayed = self.delayed.lock().await;
        delayed.retain(|h| !h.is_finished());
        delayed.push(handle);
        true
    }

    /// Wait for every immediate task submitted so far; delayed ones are not awaited
    pub async fn wait_idle(&self) {
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "background task panicked");
            }
        }
    }

    /// Wait for every task, delayed ones included
    pub async fn wait_all(&self) {
        let delayed: Vec<JoinHandle<()>> = std::mem::take(&mut *self.delayed.lock().await);
        for handle in delayed {
            if let Err(e) = handle.await {
                warn!(error = %e, "delayed background task panicked");
            }
        }
        self.wait_idle().await;
    }

    /// Cancel delayed tasks that have not finished; returns how many were cancelled
    pub async fn abort_delayed(&self) -> usize {
        let delayed: Vec<JoinHandle<()>> = std::mem::take(&mut *self.delayed.lock().await);
        let mut aborted = 0;
        for handle in delayed {
            if !handle.is_finished() {
                handle.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            self.counters.dropped.fetch_add(aborted as u64, Ordering::Relaxed);
        }
        aborted
    }

    pub fn stats(&self) -> TaskStats {
        TaskStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
        }
    }
}

async fn run_job<F>(name: &'static str, doc_id: &str, timeout: Duration, counters: &Counters, job: F)
where
    F: Future<Output = Result<()>>,
{
    match tokio::time::timeout(timeout, job).await {
        Ok(Ok(())) => {
            counters.completed.fetch_add(1, Ordering::Relaxed);
            debug!(task = name, doc_id = %doc_id, "background task finished");
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            warn!(task = name, doc_id = %doc_id, error = %e, "background task failed");
        }
        Err(_) => {
            counters.timed_out.fetch_add(1, Ordering::Relaxed);
            warn!(task = name, doc_id = %doc_id, timeout_ms = timeout.as_millis() as u64, "background task timed out");
        }
    }
}
