//! Bounded, de-duplicating task queue.
//!
//! Each push spawns a worker that waits for one of `concurrency` permits,
//! then runs the handler, retrying in place with linear backoff. A task whose
//! retry budget is exhausted is fatal: the queue triggers shutdown and the
//! process exits. Keys are pending from push until a worker picks the task
//! up, and pushing a pending key is a no-op.

use anyhow::Result;
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, warn};

use crate::error::FatalError;
use crate::model::Keyed;
use crate::shutdown::Shutdown;

/// Work performed for each queued item.
#[async_trait]
pub trait TaskHandler<T>: Send + Sync {
    async fn handle(&self, task: &T) -> Result<()>;
}

/// Retry budget and backoff step.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub budget: u32,
    /// Delay before retry `n` is `n × base_delay`
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

struct QueueInner<T> {
    name: &'static str,
    handler: Arc<dyn TaskHandler<T>>,
    permits: Arc<Semaphore>,
    retry: RetryPolicy,
    shutdown: Shutdown,
    pending: DashSet<String>,
    outstanding: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
    next_id: AtomicU64,
    workers: DashMap<u64, AbortHandle>,
}

/// Decrements the outstanding count when a worker ends, including on abort.
struct OutstandingGuard<T: Send + Sync + 'static> {
    inner: Arc<QueueInner<T>>,
    id: u64,
}

impl<T: Send + Sync + 'static> Drop for OutstandingGuard<T> {
    fn drop(&mut self) {
        self.inner.workers.remove(&self.id);
        if self.inner.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

/// Concurrency-limited FIFO of keyed tasks.
pub struct TaskQueue<T> {
    inner: Arc<QueueInner<T>>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> TaskQueue<T>
where
    T: Keyed + Send + Sync + 'static,
{
    pub fn new(
        name: &'static str,
        concurrency: usize,
        retry: RetryPolicy,
        handler: Arc<dyn TaskHandler<T>>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                handler,
                // FIFO: tokio's semaphore grants permits in request order
                permits: Arc::new(Semaphore::new(concurrency.max(1))),
                retry,
                shutdown,
                pending: DashSet::new(),
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(0),
                workers: DashMap::new(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// Enqueue a task. Returns false when its key is already pending or the
    /// queue is closed.
    pub fn push(&self, task: T) -> bool {
        let inner = &self.inner;
        if inner.closed.load(Ordering::SeqCst) || inner.shutdown.is_triggered() {
            return false;
        }

        let key = task.key();
        if !inner.pending.insert(key.clone()) {
            debug!(queue = inner.name, key = %key, "Task already pending");
            return false;
        }

        inner.outstanding.fetch_add(1, Ordering::SeqCst);
        let id = inner.next_id.fetch_add(1, Ordering::Relaxed);
        let guard = OutstandingGuard {
            inner: inner.clone(),
            id,
        };
        let worker_inner = inner.clone();

        let handle = tokio::spawn(async move {
            let _guard = guard;
            let Ok(_permit) = worker_inner.permits.clone().acquire_owned().await else {
                worker_inner.pending.remove(&key);
                return;
            };
            worker_inner.pending.remove(&key);
            run_with_retry(&worker_inner, task, &key).await;
        });

        inner.workers.insert(id, handle.abort_handle());
        // A worker that finished before the insert has already run its guard
        if handle.is_finished() {
            inner.workers.remove(&id);
        }
        true
    }

    /// Tasks pushed but not yet picked up by a worker.
    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    /// Tasks queued or running.
    pub fn outstanding(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0
    }

    /// Wait until every queued and in-flight task has finished.
    pub async fn drain(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_idle() {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting new tasks.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    /// Close and cancel every queued and running task.
    pub fn abort(&self) {
        self.close();
        let ids: Vec<u64> = self.inner.workers.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.workers.remove(&id) {
                handle.abort();
            }
        }
        self.inner.pending.clear();
        warn!(queue = self.inner.name, "Queue aborted");
    }
}

async fn run_with_retry<T>(inner: &QueueInner<T>, mut task: T, key: &str)
where
    T: Keyed + Send + Sync + 'static,
{
    let mut attempt: u32 = 0;
    loop {
        if inner.shutdown.is_triggered() {
            debug!(queue = inner.name, key, "Shutdown, dropping task");
            return;
        }

        let err = match inner.handler.handle(&task).await {
            Ok(()) => return,
            Err(e) => e,
        };

        attempt += 1;
        if attempt > inner.retry.budget {
            error!(
                queue = inner.name,
                key,
                attempts = attempt,
                error = %format!("{err:#}"),
                "Retry budget exhausted"
            );
            inner.shutdown.trigger_fatal(FatalError::RetryBudgetExhausted {
                queue: inner.name,
                key: key.to_string(),
                reason: format!("{err:#}"),
            });
            return;
        }

        let delay = inner.retry.delay(attempt);
        warn!(
            queue = inner.name,
            key,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %format!("{err:#}"),
            "Task failed, retrying"
        );
        task.on_retry(attempt);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.shutdown.cancelled() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Task;
    use alloy::primitives::Address;
    use parking_lot::Mutex;

    /// Records handled tasks; fails the first `failures` attempts.
    struct Recorder {
        seen: Mutex<Vec<(String, u32)>>,
        failures: AtomicUsize,
        gate: Option<Arc<Notify>>,
    }

    impl Recorder {
        fn new(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                failures: AtomicUsize::new(failures),
                gate: None,
            })
        }
    }

    #[async_trait]
    impl TaskHandler<Task> for Recorder {
        async fn handle(&self, task: &Task) -> Result<()> {
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.seen.lock().push((task.key(), task.retry_count));
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("rpc timeout");
            }
            Ok(())
        }
    }

    fn policy(budget: u32) -> RetryPolicy {
        RetryPolicy {
            budget,
            base_delay: Duration::from_millis(100),
        }
    }

    fn task(b: u8) -> Task {
        Task::estimate(Address::repeat_byte(0xaa), Address::repeat_byte(b), "test")
    }

    #[tokio::test]
    async fn test_duplicate_pending_key_is_ignored() {
        let recorder = Recorder::new(0);
        let queue: TaskQueue<Task> = TaskQueue::new("estimation", 1, policy(3), recorder.clone(), Shutdown::new());

        assert!(queue.push(task(1)));
        assert!(!queue.push(task(1)));
        assert_eq!(queue.pending_len(), 1);

        queue.drain().await;
        assert_eq!(recorder.seen.lock().len(), 1);

        // Once consumed, the key can be queued again
        assert!(queue.push(task(1)));
        queue.drain().await;
        assert_eq!(recorder.seen.lock().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_in_place_then_succeeds() {
        let recorder = Recorder::new(2);
        let shutdown = Shutdown::new();
        let queue: TaskQueue<Task> = TaskQueue::new("estimation", 2, policy(3), recorder.clone(), shutdown.clone());

        queue.push(task(1));
        queue.drain().await;

        let seen = recorder.seen.lock().clone();
        let retries: Vec<u32> = seen.iter().map(|(_, r)| *r).collect();
        assert_eq!(retries, vec![0, 1, 2]);
        assert!(!shutdown.is_triggered());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_is_fatal() {
        let recorder = Recorder::new(usize::MAX);
        let shutdown = Shutdown::new();
        let queue: TaskQueue<Task> = TaskQueue::new("sync", 1, policy(2), recorder.clone(), shutdown.clone());

        queue.push(task(1));
        queue.drain().await;

        assert_eq!(recorder.seen.lock().len(), 3);
        assert!(matches!(
            shutdown.fatal(),
            Some(FatalError::RetryBudgetExhausted { queue: "sync", .. })
        ));
        // Closed for business after shutdown
        assert!(!queue.push(task(2)));
    }

    #[tokio::test]
    async fn test_abort_cancels_blocked_workers() {
        let gate = Arc::new(Notify::new());
        let recorder = Arc::new(Recorder {
            seen: Mutex::new(Vec::new()),
            failures: AtomicUsize::new(0),
            gate: Some(gate.clone()),
        });
        let queue: TaskQueue<Task> = TaskQueue::new("estimation", 1, policy(0), recorder.clone(), Shutdown::new());

        for b in 1..=3 {
            queue.push(task(b));
        }
        tokio::task::yield_now().await;
        assert_eq!(queue.outstanding(), 3);

        queue.abort();
        tokio::time::timeout(Duration::from_secs(1), queue.drain())
            .await
            .unwrap();
        assert!(recorder.seen.lock().is_empty());
        assert!(!queue.push(task(4)));
    }
}
