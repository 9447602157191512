//! Watcher dispatch.
//!
//! Watcher invocations are queued FIFO per originator - the peer whose
//! mutation triggered them - and drained by one task per originator, so a
//! single client observes its own notifications in stamp order. A shared
//! semaphore bounds concurrency across originators.
//!
//! `set_wait` attaches a [`WaitBatch`] to its jobs and blocks until every
//! job has completed; a job whose callback is the one currently executing
//! on this task is never awaited (see [`current_callback`]), which is what
//! keeps a watcher that writes to its own path from deadlocking.

use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::Semaphore;
use tracing::trace;
use tracing::warn;

use crate::callbacks::Callback;
use crate::tree::PathTree;

tokio::task_local! {
    static CURRENT_CALLBACK: String;
}

/// GUID of the callback the current task is executing, if any.
pub fn current_callback() -> Option<String> {
    CURRENT_CALLBACK.try_with(|guid| guid.clone()).ok()
}

/// What a watcher is told.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// One leaf changed; `None` signals deletion.
    Leaf { path: String, value: Option<Bytes> },
    /// A batch changed shape (prune, set_tree) for tree-scoped watchers.
    Tree(PathTree),
}

/// Invocation seam: the engine supplies the actual call (local closure or
/// callback channel), the dispatcher supplies ordering.
#[async_trait]
pub trait WatchInvoker: Send + Sync {
    async fn invoke_watch(&self, cb: &Arc<Callback>, event: &WatchEvent);
}

/// Completion tracking for `set_wait`.
pub struct WaitBatch {
    remaining: AtomicUsize,
    notify: Notify,
}

impl WaitBatch {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(WaitBatch {
            remaining: AtomicUsize::new(count),
            notify: Notify::new(),
        })
    }

    fn complete_one(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.remaining.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// One queued watcher invocation.
pub struct Job {
    pub cb: Arc<Callback>,
    pub event: WatchEvent,
    pub batch: Option<Arc<WaitBatch>>,
}

pub struct Dispatcher {
    queues: DashMap<u64, mpsc::UnboundedSender<Job>>,
    invoker: Arc<dyn WatchInvoker>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(invoker: Arc<dyn WatchInvoker>, workers: usize) -> Self {
        Dispatcher {
            queues: DashMap::new(),
            invoker,
            semaphore: Arc::new(Semaphore::new(workers.max(1))),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// Queue jobs for one originator, preserving their order.
    pub fn enqueue(&self, originator: u64, jobs: Vec<Job>) {
        if jobs.is_empty() {
            return;
        }
        self.pending.fetch_add(jobs.len(), Ordering::AcqRel);
        let sender = self.sender_for(originator);
        for job in jobs {
            if let Err(err) = sender.send(job) {
                // Queue task is gone (shutdown); account the job as done.
                warn!(originator, "watcher queue closed, dropping job");
                if let Some(batch) = err.0.batch {
                    batch.complete_one();
                }
                self.job_done();
            }
        }
    }

    fn sender_for(&self, originator: u64) -> mpsc::UnboundedSender<Job> {
        self.queues
            .entry(originator)
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                let invoker = self.invoker.clone();
                let semaphore = self.semaphore.clone();
                let pending = self.pending.clone();
                let idle = self.idle.clone();
                tokio::spawn(drain(originator, rx, invoker, semaphore, pending, idle));
                tx
            })
            .clone()
    }

    fn job_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }

    /// Wait for the whole backlog to drain.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Drain in-flight callbacks, bounded by `limit`, then drop the queues.
    pub async fn shutdown(&self, limit: Duration) {
        if tokio::time::timeout(limit, self.wait_idle()).await.is_err() {
            warn!(
                backlog = self.pending.load(Ordering::Acquire),
                "shutdown drain expired with callbacks still queued"
            );
        }
        self.queues.clear();
    }
}

async fn drain(
    originator: u64,
    mut rx: mpsc::UnboundedReceiver<Job>,
    invoker: Arc<dyn WatchInvoker>,
    semaphore: Arc<Semaphore>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = semaphore.acquire().await else {
            return;
        };
        trace!(originator, guid = %job.cb.guid, "dispatching watcher");
        CURRENT_CALLBACK
            .scope(job.cb.guid.clone(), invoker.invoke_watch(&job.cb, &job.event))
            .await;
        drop(permit);
        if let Some(batch) = &job.batch {
            batch.complete_one();
        }
        if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            idle.notify_waiters();
        }
    }
}
