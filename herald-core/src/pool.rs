//! Fixed-size worker pool for listener and callback notification.
//!
//! Transport receive paths must never run user code inline; they enqueue
//! notification tasks here. Workers pull tasks in enqueue order; two tasks
//! picked by the same worker run in order, across workers there is no
//! ordering guarantee. On shutdown, in-flight tasks finish and the queued
//! remainder is drained without being run, so blocked senders release fast.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Default number of notification workers.
pub const DEFAULT_WORKERS: usize = 5;

/// Default queue capacity; enqueue blocks when the queue is full.
pub const DEFAULT_QUEUE: usize = 256;

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub struct NotificationPool {
    tx: Mutex<Option<mpsc::Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    running: Arc<AtomicBool>,
}

impl NotificationPool {
    /// Spawns the worker tasks. Must be called inside a tokio runtime.
    pub fn new(workers: usize, queue: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Task>(queue.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let running = Arc::new(AtomicBool::new(true));

        let handles = (0..workers.max(1))
            .map(|_| {
                let rx = Arc::clone(&rx);
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    loop {
                        // Hold the receiver lock only while pulling, never
                        // while running the task.
                        let task = { rx.lock().await.recv().await };
                        match task {
                            Some(task) => {
                                if !running.load(Ordering::SeqCst) {
                                    // Draining: drop without running.
                                    continue;
                                }
                                // A panicking task must not kill the worker.
                                let _ = tokio::spawn(task).await;
                            }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            running,
        }
    }

    /// Enqueues a notification task; blocks while the queue is full.
    /// Silently dropped after shutdown.
    pub async fn enqueue(&self, task: impl Future<Output = ()> + Send + 'static) {
        let sender = self.tx.lock().unwrap().clone();
        match sender {
            Some(tx) => {
                if tx.send(Box::pin(task)).await.is_err() {
                    debug!("notification pool closed, task dropped");
                }
            }
            None => debug!("notification pool stopped, task dropped"),
        }
    }

    /// Stops accepting tasks, drains the queue and joins the workers.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        // Dropping the sender lets workers drain to the channel end.
        self.tx.lock().unwrap().take();
        let handles: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn tasks_run_and_complete() {
        let pool = NotificationPool::new(2, 16);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn panicking_task_does_not_kill_workers() {
        let pool = NotificationPool::new(1, 16);
        pool.enqueue(async { panic!("boom") }).await;
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_is_dropped() {
        let pool = NotificationPool::new(1, 4);
        pool.shutdown().await;
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let counter = Arc::clone(&counter);
            pool.enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
