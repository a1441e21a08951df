//! In-memory queue backend using DashMap.
//!
//! Messages live as long as the backend and are lost on restart. Delayed
//! messages are held in a release-time ordered map and only become visible
//! once their release time passes. Priority is not enforced.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::error::{QueueError, QueueResult};
use crate::metrics::QueueMetrics;
use crate::resilience::deadline_after;

use super::backend::{BackendType, Queue, QueueBackend};
use super::message::{Message, QueueOptions};

const BACKEND: &str = "memory";

/// In-memory queue backend.
///
/// Each queue name maps to one shared store; `create_queue` for a name that
/// already exists hands out a new handle onto the same store.
pub struct MemoryBackend {
    stores: DashMap<String, Arc<MemoryStore>>,
    default_options: QueueOptions,
    pop_timeout: Duration,
    connected: AtomicBool,
}

impl MemoryBackend {
    pub fn new(default_options: QueueOptions, pop_timeout: Duration) -> Self {
        Self {
            stores: DashMap::new(),
            default_options,
            pop_timeout,
            connected: AtomicBool::new(false),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(QueueOptions::default(), Duration::from_secs(1))
    }
}

#[async_trait]
impl QueueBackend for MemoryBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Memory
    }

    async fn connect(&self) -> QueueResult<()> {
        self.connected.store(true, Ordering::Release);
        tracing::info!(backend = BACKEND, "Queue backend connected");
        Ok(())
    }

    async fn disconnect(&self) -> QueueResult<()> {
        self.connected.store(false, Ordering::Release);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Always healthy: there is no broker to lose.
    async fn health_check(&self) -> QueueResult<()> {
        Ok(())
    }

    async fn create_queue(&self, name: &str, options: QueueOptions) -> QueueResult<Arc<dyn Queue>> {
        let store = self
            .stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryStore::new(options)))
            .clone();

        tracing::debug!(backend = BACKEND, queue = %name, "Queue created");

        Ok(Arc::new(MemoryQueue {
            name: name.to_string(),
            store,
            pop_timeout: self.pop_timeout,
            closed: AtomicBool::new(false),
        }))
    }

    async fn delete_queue(&self, name: &str) -> QueueResult<()> {
        if let Some((_, store)) = self.stores.remove(name) {
            store.clear().await;
            tracing::debug!(backend = BACKEND, queue = %name, "Queue deleted");
        }
        Ok(())
    }

    async fn list_queues(&self) -> QueueResult<Vec<String>> {
        let mut names: Vec<String> = self.stores.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    fn default_queue_options(&self) -> QueueOptions {
        self.default_options.clone()
    }
}

#[derive(Default)]
struct StoreState {
    ready: VecDeque<Message>,
    /// Keyed by (release time, insertion sequence) so equal release times keep push order
    delayed: BTreeMap<(Instant, u64), Message>,
    sequence: u64,
}

impl StoreState {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }

    /// Eligible delayed messages first, in release order, then FIFO.
    fn take_next(&mut self, now: Instant) -> Option<Message> {
        if let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 <= now {
                return Some(entry.remove());
            }
        }
        self.ready.pop_front()
    }

    fn peek_next(&self, now: Instant) -> Option<&Message> {
        match self.delayed.first_key_value() {
            Some(((release_at, _), message)) if *release_at <= now => Some(message),
            _ => self.ready.front(),
        }
    }

    fn next_release(&self) -> Option<Instant> {
        self.delayed.keys().next().map(|(release_at, _)| *release_at)
    }
}

struct MemoryStore {
    state: Mutex<StoreState>,
    /// Wakes waiting pops on push
    notify: Notify,
    options: QueueOptions,
}

impl MemoryStore {
    fn new(options: QueueOptions) -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            notify: Notify::new(),
            options,
        }
    }

    async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.ready.clear();
        state.delayed.clear();
    }
}

/// Handle onto one in-memory queue.
pub struct MemoryQueue {
    name: String,
    store: Arc<MemoryStore>,
    pop_timeout: Duration,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn ensure_open(&self) -> QueueResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, mut message: Message) -> QueueResult<()> {
        self.ensure_open()?;
        message.stamp();
        let delayed = message.is_delayed();

        {
            let mut state = self.store.state.lock().await;

            if let Some(max_length) = self.store.options.max_length {
                if state.len() as u64 >= max_length {
                    return Err(QueueError::QueueFull {
                        name: self.name.clone(),
                        max_length,
                    });
                }
            }

            if delayed {
                let release_at = deadline_after(message.delay);
                state.sequence += 1;
                let sequence = state.sequence;
                state.delayed.insert((release_at, sequence), message);
            } else {
                state.ready.push_back(message);
            }
        }

        // Delayed pushes also wake waiters so they re-arm on the new release time
        self.store.notify.notify_waiters();
        QueueMetrics::record_pushed(BACKEND, &self.name, delayed);
        Ok(())
    }

    async fn pop(&self) -> QueueResult<Option<Message>> {
        self.pop_with_timeout(self.pop_timeout).await
    }

    async fn pop_with_timeout(&self, timeout: Duration) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        let deadline = deadline_after(timeout);

        loop {
            // Register before checking so a push between check and wait is not missed
            let notified = self.store.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_release = {
                let mut state = self.store.state.lock().await;
                if let Some(message) = state.take_next(Instant::now()) {
                    QueueMetrics::record_popped(BACKEND, &self.name);
                    return Ok(Some(message));
                }
                state.next_release()
            };

            if Instant::now() >= deadline {
                return Ok(None);
            }

            let wake_at = next_release.map_or(deadline, |release_at| release_at.min(deadline));
            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }

            self.ensure_open()?;
        }
    }

    async fn peek(&self) -> QueueResult<Option<Message>> {
        self.ensure_open()?;
        let state = self.store.state.lock().await;
        Ok(state.peek_next(Instant::now()).cloned())
    }

    async fn size(&self) -> QueueResult<u64> {
        self.ensure_open()?;
        Ok(self.store.state.lock().await.len() as u64)
    }

    async fn clear(&self) -> QueueResult<()> {
        self.ensure_open()?;
        self.store.clear().await;
        Ok(())
    }

    async fn close(&self) -> QueueResult<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(backend = BACKEND, queue = %self.name, "Queue closed");
        }
        Ok(())
    }
}
