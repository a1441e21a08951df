//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use ara_mq::consumer::MessageHandler;
use ara_mq::queue::{Message, Queue};

/// Handler scripted to fail its first `failures` calls.
pub struct ScriptedHandler {
    failures: u32,
    fail_on_error: bool,
    handle_delay: Duration,
    pub handled: AtomicU32,
    pub errors: AtomicU32,
    pub seen: Mutex<Vec<(String, u32)>>,
}

impl ScriptedHandler {
    pub fn succeeding() -> Self {
        Self::failing(0)
    }

    pub fn failing(failures: u32) -> Self {
        Self {
            failures,
            fail_on_error: false,
            handle_delay: Duration::ZERO,
            handled: AtomicU32::new(0),
            errors: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn always_failing() -> Self {
        Self::failing(u32::MAX)
    }

    /// `on_error` also fails, which abandons the message
    pub fn with_failing_callback(mut self) -> Self {
        self.fail_on_error = true;
        self
    }

    pub fn with_handle_delay(mut self, delay: Duration) -> Self {
        self.handle_delay = delay;
        self
    }

    pub fn handled(&self) -> u32 {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u32 {
        self.errors.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler for ScriptedHandler {
    async fn handle(&self, message: &Message) -> anyhow::Result<()> {
        let call = self.handled.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().await.push((message.id.clone(), message.retry_count));
        if !self.handle_delay.is_zero() {
            tokio::time::sleep(self.handle_delay).await;
        }
        if call < self.failures {
            anyhow::bail!("scripted failure {}", call + 1);
        }
        Ok(())
    }

    async fn on_error(&self, _message: &Message, _error: &anyhow::Error) -> anyhow::Result<()> {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_error {
            anyhow::bail!("callback refused");
        }
        Ok(())
    }
}

/// Poll `condition` until it holds or `within` elapses.
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

/// Behaviour every backend shares: FIFO, non-destructive peek, size, clear
/// and close. The queue must start empty.
///
/// Peek runs before the first timed pop because an AMQP subscription
/// prefetches the head of the queue.
pub async fn assert_basic_contract(queue: Arc<dyn Queue>) {
    assert!(queue.pop().await.unwrap().is_none());

    for i in 1..=3 {
        queue
            .push(Message::new(format!("m{i}"), format!("payload-{i}")).with_header("source", "contract"))
            .await
            .unwrap();
    }
    assert_eq!(queue.size().await.unwrap(), 3);

    let peeked = queue.peek().await.unwrap().unwrap();
    assert_eq!(peeked.id, "m1");
    assert_eq!(queue.size().await.unwrap(), 3);

    let first = queue.pop_with_timeout(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(first.id, "m1");
    assert_eq!(first.data, b"payload-1".to_vec());
    assert_eq!(first.header("source"), Some("contract"));
    assert!(first.timestamp.is_some());

    let second = queue.pop_with_timeout(Duration::from_secs(1)).await.unwrap().unwrap();
    assert_eq!(second.id, "m2");

    queue.clear().await.unwrap();
    assert_eq!(queue.size().await.unwrap(), 0);

    queue.close().await.unwrap();
    assert!(queue.push(Message::new("late", "x")).await.is_err());
}
