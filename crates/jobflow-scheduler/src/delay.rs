//! In-memory delay queue drained by a fixed pool of tokio workers.
//! Callbacks are ordered by deadline; nothing here survives a restart.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use jobflow_core::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A queued callback.
struct Entry {
    deadline: Instant,
    seq: u64,
    callback: BoxFuture<'static, Result<()>>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the max-heap pops the earliest deadline first.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct Shared {
    heap: Mutex<BinaryHeap<Entry>>,
    notify: Notify,
    shutdown: AtomicBool,
    seq: AtomicU64,
}

enum Next {
    Ready(Entry),
    Wait(Instant),
    Idle,
}

impl Shared {
    fn next(&self) -> Next {
        let mut heap = match self.heap.lock() {
            Ok(h) => h,
            Err(poisoned) => poisoned.into_inner(),
        };
        match heap.peek() {
            Some(entry) if entry.deadline <= Instant::now() => match heap.pop() {
                Some(entry) => Next::Ready(entry),
                None => Next::Idle,
            },
            Some(entry) => Next::Wait(entry.deadline),
            None => Next::Idle,
        }
    }
}

/// Time-ordered callback queue with a bounded worker pool.
pub struct DelayQueue {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DelayQueue {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                heap: Mutex::new(BinaryHeap::new()),
                notify: Notify::new(),
                shutdown: AtomicBool::new(false),
                seq: AtomicU64::new(0),
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Enqueue `callback` to run no earlier than now + `delay`.
    pub fn schedule<F>(&self, delay: Duration, callback: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let entry = Entry {
            deadline: Instant::now() + delay,
            seq: self.shared.seq.fetch_add(1, AtomicOrdering::Relaxed),
            callback: Box::pin(callback),
        };
        match self.shared.heap.lock() {
            Ok(mut heap) => heap.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
        self.shared.notify.notify_waiters();
    }

    /// Callbacks waiting for their deadline.
    pub fn len(&self) -> usize {
        match self.shared.heap.lock() {
            Ok(heap) => heap.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawn `worker_count` workers on the current runtime.
    /// Calling `start` on a running queue is a no-op.
    pub fn start(&self, worker_count: usize) {
        let mut workers = match self.workers.lock() {
            Ok(w) => w,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(false, AtomicOrdering::SeqCst);
        for worker_id in 0..worker_count.max(1) {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(worker_loop(worker_id, shared)));
        }
        tracing::info!("⏱️ Delay queue started with {} workers", worker_count.max(1));
    }

    /// Stop the workers and drop pending callbacks.
    /// Callbacks already executing are allowed to finish.
    pub async fn shutdown(&self) {
        self.shared.shutdown.store(true, AtomicOrdering::SeqCst);
        self.shared.notify.notify_waiters();

        let handles: Vec<JoinHandle<()>> = match self.workers.lock() {
            Ok(mut w) => w.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::warn!("⚠️ Delay worker ended abnormally: {e}");
            }
        }

        let dropped = match self.shared.heap.lock() {
            Ok(mut heap) => std::mem::take(&mut *heap).len(),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()).len(),
        };
        tracing::info!("🛑 Delay queue stopped ({} pending callbacks dropped)", dropped);
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

async fn worker_loop(worker_id: usize, shared: Arc<Shared>) {
    loop {
        // Register interest before inspecting the heap so a concurrent
        // `schedule` between the check and the wait is never missed.
        let notified = shared.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.shutdown.load(AtomicOrdering::SeqCst) {
            break;
        }

        match shared.next() {
            Next::Ready(entry) => run_callback(worker_id, entry).await,
            Next::Wait(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut notified => {}
                }
            }
            Next::Idle => notified.await,
        }
    }
    tracing::debug!("delay worker {} exiting", worker_id);
}

async fn run_callback(worker_id: usize, entry: Entry) {
    // Spawned so a panicking callback only takes down its own task.
    match tokio::spawn(entry.callback).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("⚠️ Delayed callback failed on worker {}: {e}", worker_id),
        Err(e) => tracing::error!("💥 Delayed callback panicked on worker {}: {e}", worker_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobflow_core::JobflowError;

    fn recorder() -> Arc<Mutex<Vec<u32>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[tokio::test]
    async fn test_fires_in_deadline_order() {
        let queue = DelayQueue::new();
        let fired = recorder();
        for (label, ms) in [(3u32, 90u64), (1, 10), (2, 50)] {
            let fired = Arc::clone(&fired);
            queue.schedule(Duration::from_millis(ms), async move {
                fired.lock().unwrap().push(label);
                Ok(())
            });
        }
        queue.start(1);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1, 2, 3]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_does_not_fire_early() {
        let queue = DelayQueue::new();
        queue.start(2);
        let fired = recorder();
        let f = Arc::clone(&fired);
        queue.schedule(Duration::from_millis(300), async move {
            f.lock().unwrap().push(1);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(fired.lock().unwrap().is_empty());
        assert_eq!(queue.len(), 1);
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_failing_callbacks_do_not_kill_workers() {
        let queue = DelayQueue::new();
        queue.start(1);
        queue.schedule(Duration::ZERO, async { Err::<(), _>(JobflowError::task("boom")) });
        queue.schedule(Duration::from_millis(5), async {
            if true {
                panic!("callback panic");
            }
            Ok(())
        });

        let fired = recorder();
        let f = Arc::clone(&fired);
        queue.schedule(Duration::from_millis(20), async move {
            f.lock().unwrap().push(7);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*fired.lock().unwrap(), vec![7]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_earlier_job_scheduled_later_wakes_worker() {
        let queue = DelayQueue::new();
        queue.start(1);
        let fired = recorder();
        let f = Arc::clone(&fired);
        queue.schedule(Duration::from_secs(30), async move {
            f.lock().unwrap().push(2);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        let f = Arc::clone(&fired);
        queue.schedule(Duration::from_millis(10), async move {
            f.lock().unwrap().push(1);
            Ok(())
        });
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(*fired.lock().unwrap(), vec![1]);
        queue.shutdown().await;
        assert!(queue.is_empty());
    }
}
