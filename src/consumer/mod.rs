//! Worker-pool consumer with bounded fixed-delay retry.
//!
//! A `Consumer` owns `concurrency` workers that share one `Queue` and one
//! `MessageHandler`. Each worker pops with a bounded wait, hands the message
//! to the handler and retries failures up to `max_retries` times with a
//! fixed `retry_delay`. Exhausted messages are dropped.

mod handler;
mod options;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use futures::future::join_all;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, QueueResult};
use crate::queue::Queue;

pub use handler::MessageHandler;
pub use options::ConsumerOptions;

use worker::Worker;

struct RunningWorkers {
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

/// Held by a worker task; decrements the live count when the task ends,
/// panics included.
struct LiveWorker(Arc<AtomicUsize>);

impl Drop for LiveWorker {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Pool of workers draining one queue.
///
/// # Example
///
/// ```rust,ignore
/// let consumer = Consumer::new(queue, Arc::new(OrderHandler), ConsumerOptions::default());
/// consumer.start().await?;
/// // ...
/// consumer.stop().await?;
/// ```
pub struct Consumer {
    queue: Arc<dyn Queue>,
    handler: Arc<dyn MessageHandler>,
    options: ConsumerOptions,
    running: AtomicBool,
    live: Arc<AtomicUsize>,
    workers: Mutex<Option<RunningWorkers>>,
}

impl Consumer {
    pub fn new(queue: Arc<dyn Queue>, handler: Arc<dyn MessageHandler>, options: ConsumerOptions) -> Self {
        Self {
            queue,
            handler,
            options: options.normalized(),
            running: AtomicBool::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            workers: Mutex::new(None),
        }
    }

    /// Spawn the workers. Fails with `AlreadyRunning` if they are already up.
    pub async fn start(&self) -> QueueResult<()> {
        let mut workers = self.workers.lock().await;
        if workers.is_some() {
            return Err(QueueError::AlreadyRunning);
        }

        let shutdown = CancellationToken::new();
        let handles = (0..self.options.concurrency)
            .map(|id| {
                let worker = Worker {
                    id,
                    queue: self.queue.clone(),
                    handler: self.handler.clone(),
                    options: self.options.clone(),
                    shutdown: shutdown.child_token(),
                };
                self.live.fetch_add(1, Ordering::SeqCst);
                let live = LiveWorker(self.live.clone());
                tokio::spawn(async move {
                    let _live = live;
                    worker.run().await;
                })
            })
            .collect();

        *workers = Some(RunningWorkers { shutdown, handles });
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            queue = %self.queue.name(),
            concurrency = self.options.concurrency,
            max_retries = self.options.max_retries,
            retry_delay_ms = self.options.retry_delay.as_millis() as u64,
            "Consumer started"
        );
        Ok(())
    }

    /// Signal the workers and wait for each to finish its current message.
    ///
    /// There is no stop timeout: a handler that never returns is bounded only
    /// by `handler_timeout`. Stopping a stopped consumer is a no-op.
    pub async fn stop(&self) -> QueueResult<()> {
        let mut workers = self.workers.lock().await;
        let Some(running) = workers.take() else {
            return Ok(());
        };

        tracing::info!(queue = %self.queue.name(), "Stopping consumer");
        running.shutdown.cancel();

        for result in join_all(running.handles).await {
            if let Err(e) = result {
                tracing::error!(queue = %self.queue.name(), error = %e, "Consumer worker panicked");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        tracing::info!(queue = %self.queue.name(), "Consumer stopped");
        Ok(())
    }

    /// True from a successful `start` until `stop` completes.
    ///
    /// Workers that exit on their own, because the queue was closed, do not
    /// clear this; `active_workers` reports how many are still polling.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Worker tasks that have not exited yet.
    pub fn active_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    pub fn queue(&self) -> &Arc<dyn Queue> {
        &self.queue
    }
}

impl Drop for Consumer {
    fn drop(&mut self) {
        // Workers own clones of the queue and handler; signal them so they
        // do not outlive a consumer that was never stopped.
        if let Some(running) = self.workers.get_mut().take() {
            running.shutdown.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::queue::{MemoryBackend, Message, QueueBackend, QueueOptions};

    struct Counting {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _message: &Message) -> anyhow::Result<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    async fn setup() -> (Arc<dyn Queue>, Arc<Counting>) {
        let queue = MemoryBackend::default()
            .create_queue("consumer-test", QueueOptions::default())
            .await
            .unwrap();
        let handler = Arc::new(Counting {
            handled: AtomicUsize::new(0),
        });
        (queue, handler)
    }

    fn options(concurrency: usize) -> ConsumerOptions {
        ConsumerOptions {
            concurrency,
            poll_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(5),
            ..ConsumerOptions::default()
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue, handler, options(2));

        assert!(!consumer.is_running());
        consumer.start().await.unwrap();
        assert!(consumer.is_running());
        assert!(matches!(consumer.start().await, Err(QueueError::AlreadyRunning)));

        consumer.stop().await.unwrap();
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_stop_when_stopped_is_noop() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue, handler, options(1));

        consumer.stop().await.unwrap();
        assert!(!consumer.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue.clone(), handler.clone(), options(1));

        consumer.start().await.unwrap();
        consumer.stop().await.unwrap();
        consumer.start().await.unwrap();

        queue.push(Message::new("m1", "x")).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.handled.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_all_messages_handled_across_workers() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue.clone(), handler.clone(), options(4));
        consumer.start().await.unwrap();

        for i in 0..20 {
            queue.push(Message::new(format!("m{i}"), "x")).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while handler.handled.load(Ordering::SeqCst) < 20 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        consumer.stop().await.unwrap();
        assert_eq!(handler.handled.load(Ordering::SeqCst), 20);
        assert_eq!(queue.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_queue_ends_workers_but_not_running_state() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue.clone(), handler, options(3));

        consumer.start().await.unwrap();
        assert_eq!(consumer.active_workers(), 3);

        queue.close().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.active_workers() > 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(consumer.is_running());

        consumer.stop().await.unwrap();
        assert!(!consumer.is_running());
        assert_eq!(consumer.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_runs_one_worker() {
        let (queue, handler) = setup().await;
        let consumer = Consumer::new(queue, handler, options(0));
        assert_eq!(consumer.options().concurrency, 1);

        consumer.start().await.unwrap();
        assert_eq!(consumer.workers.lock().await.as_ref().map(|w| w.handles.len()), Some(1));
        consumer.stop().await.unwrap();
    }
}
