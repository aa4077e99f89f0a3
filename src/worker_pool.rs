//! Bounded worker pool
//!
//! N workers pull boxed tasks from a channel with capacity 2N: submission
//! applies backpressure once the queue is full, and shutdown drains whatever
//! was accepted. No task is abandoned mid-execution.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct WorkerPool {
    sender: tokio::sync::Mutex<Option<mpsc::Sender<Task>>>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one). Must run inside a tokio runtime.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let (tx, rx) = mpsc::channel::<Task>(size * 2);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..size)
            .map(|id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(worker_loop(id, rx))
            })
            .collect();

        Self { sender: tokio::sync::Mutex::new(Some(tx)), workers: std::sync::Mutex::new(workers) }
    }

    /// Queue a task, waiting for capacity when the buffer is full. Dropped
    /// silently once the pool is stopping.
    pub async fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let guard = self.sender.lock().await;
        match guard.as_ref() {
            Some(tx) => {
                if tx.send(Box::pin(task)).await.is_err() {
                    tracing::debug!("worker pool stopping, task dropped");
                }
            }
            None => tracing::debug!("worker pool stopped, task dropped"),
        }
    }

    /// Close the task channel and join every worker. Queued tasks run to
    /// completion first. Safe to call more than once.
    pub async fn stop(&self) {
        self.sender.lock().await.take();
        let handles: Vec<_> = {
            let mut workers = self.workers.lock().unwrap_or_else(|p| p.into_inner());
            workers.drain(..).collect()
        };
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "worker task panicked");
            }
        }
    }

    /// Alias for [`stop`](Self::stop); both drain and both are idempotent.
    pub async fn wait(&self) {
        self.stop().await;
    }
}

async fn worker_loop(id: usize, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>) {
    loop {
        // Hold the receiver lock only while dequeuing; execution runs
        // unlocked so workers stay concurrent.
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        match task {
            Some(task) => task.await,
            None => break,
        }
    }
    tracing::debug!(worker = id, "worker drained and exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_submitted_tasks() {
        let pool = WorkerPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..20 {
            let counter = counter.clone();
            pool.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn drains_queued_tasks_before_wait_returns() {
        let pool = WorkerPool::new(2);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..6 {
            let counter = counter.clone();
            pool.submit(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 6, "every accepted task must finish");
    }

    #[tokio::test]
    async fn submit_after_stop_is_a_silent_noop() {
        let pool = WorkerPool::new(1);
        pool.stop().await;

        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        pool.submit(async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        })
        .await;

        pool.wait().await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let pool = WorkerPool::new(2);
        pool.submit(async {}).await;
        pool.stop().await;
        pool.stop().await;
        pool.wait().await;
    }

    #[tokio::test]
    async fn full_buffer_applies_backpressure() {
        // One worker parked on a gate, buffer of two filled: the next submit
        // must not complete until the gate opens.
        let pool = Arc::new(WorkerPool::new(1));
        let gate = Arc::new(tokio::sync::Notify::new());

        let gate_clone = gate.clone();
        pool.submit(async move {
            gate_clone.notified().await;
        })
        .await;
        pool.submit(async {}).await;
        pool.submit(async {}).await;

        let pool_clone = pool.clone();
        let blocked = tokio::spawn(async move {
            pool_clone.submit(async {}).await;
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished(), "submit must block while the buffer is full");

        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(1), blocked).await.unwrap().unwrap();
        pool.wait().await;
    }

    #[tokio::test]
    async fn workers_run_concurrently() {
        let pool = WorkerPool::new(4);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for _ in 0..8 {
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            pool.submit(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(30)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
            })
            .await;
        }

        pool.wait().await;
        assert!(peak.load(Ordering::SeqCst) > 1, "pool must fan out");
        assert!(peak.load(Ordering::SeqCst) <= 4, "pool must not exceed its size");
    }
}
