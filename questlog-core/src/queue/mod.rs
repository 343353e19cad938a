//! Ordered retry queue between the chain watcher and the handlers.
//!
//! Events are delivered one at a time in ascending `timestamp` order, ties
//! keeping arrival order. Every registered processor receives each event;
//! the queue only moves on once all of them accepted it or the event's
//! delivery budget ran out.
//!
//! A drain pass works in cycles: it snapshots the sorted buffer, delivers
//! those items, and starts another cycle for anything pushed meanwhile.

use crate::config::QueueConfig;
use crate::events::DomainEvent;
use crate::handlers::HandlerError;
use crate::utils::{ListenerId, Registry, backoff_delay};
use futures_util::future::{BoxFuture, join_all};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::{debug, error, warn};

pub type ProcessorFn =
    Arc<dyn Fn(DomainEvent) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;
pub type ErrorHandlerFn = Arc<dyn Fn(&DomainEvent, &HandlerError) + Send + Sync>;

struct QueueItem {
    seq: u64,
    event: DomainEvent,
    attempts: u32,
}

#[derive(Default)]
struct Buffer {
    next_seq: u64,
    items: Vec<QueueItem>,
}

struct Inner {
    config: QueueConfig,
    buffer: Mutex<Buffer>,
    processors: Mutex<Registry<ProcessorFn>>,
    error_handlers: Mutex<Registry<ErrorHandlerFn>>,
    draining: AtomicBool,
    idle: Notify,
}

/// Counts from one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub failed: usize,
}

enum Delivery {
    Delivered,
    Failed { attempts: u32, error: HandlerError },
    Discarded,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct RetryQueue {
    inner: Arc<Inner>,
}

impl RetryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                buffer: Mutex::new(Buffer::default()),
                processors: Mutex::new(Registry::new()),
                error_handlers: Mutex::new(Registry::new()),
                draining: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Register a delivery target. Processors of one event run concurrently.
    pub fn on_process<F, Fut>(&self, processor: F) -> ListenerId
    where
        F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        let processor: ProcessorFn = Arc::new(move |event| Box::pin(processor(event)));
        lock(&self.inner.processors).add(processor)
    }

    pub fn remove_processor(&self, id: ListenerId) -> bool {
        lock(&self.inner.processors).remove(id)
    }

    /// Register a handler for events dropped after a terminal failure.
    pub fn on_error<F>(&self, handler: F) -> ListenerId
    where
        F: Fn(&DomainEvent, &HandlerError) + Send + Sync + 'static,
    {
        lock(&self.inner.error_handlers).add(Arc::new(handler))
    }

    pub fn remove_error_handler(&self, id: ListenerId) -> bool {
        lock(&self.inner.error_handlers).remove(id)
    }

    pub fn len(&self) -> usize {
        lock(&self.inner.buffer).items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_draining(&self) -> bool {
        self.inner.draining.load(Ordering::Acquire)
    }

    /// Buffer an event. With auto-drain on, a drain task is spawned unless
    /// one is already running.
    ///
    /// Outside a tokio runtime the event stays buffered until [`process`]
    /// is called.
    ///
    /// [`process`]: RetryQueue::process
    pub fn push(&self, event: DomainEvent) {
        {
            let mut buffer = lock(&self.inner.buffer);
            let seq = buffer.next_seq;
            buffer.next_seq += 1;
            debug!(event = %event, seq, "Event queued");
            buffer.items.push(QueueItem {
                seq,
                event,
                attempts: 0,
            });
        }
        if self.inner.config.auto_drain && !self.is_draining() {
            self.spawn_drain();
        }
    }

    fn spawn_drain(&self) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let queue = self.clone();
                handle.spawn(async move {
                    queue.process().await;
                });
            }
            Err(_) => {
                warn!("No async runtime available, event stays buffered until drained manually");
            }
        }
    }

    /// Discard every buffered event without delivering it.
    pub fn clear(&self) -> usize {
        let discarded = std::mem::take(&mut lock(&self.inner.buffer).items).len();
        if discarded > 0 {
            warn!(discarded, "Queue cleared");
        }
        discarded
    }

    /// Run one drain pass until the buffer is empty.
    ///
    /// Returns immediately with an empty report when another drain is
    /// already running.
    pub async fn process(&self) -> DrainReport {
        if self
            .inner
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Drain already running");
            return DrainReport::default();
        }

        let mut report = DrainReport::default();
        loop {
            let cycle = self.next_cycle();
            if cycle.is_empty() {
                self.inner.draining.store(false, Ordering::Release);
                // An event pushed after the empty check saw the flag still set
                if !self.is_empty()
                    && self
                        .inner
                        .draining
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    continue;
                }
                break;
            }

            for seq in cycle {
                let Some(event) = self.event_of(seq) else {
                    continue;
                };
                match self.deliver(seq, &event).await {
                    Delivery::Delivered => report.delivered += 1,
                    Delivery::Failed { attempts, error } => {
                        self.report_failure(&event, attempts, &error);
                        report.failed += 1;
                    }
                    Delivery::Discarded => continue,
                }
                self.remove(seq);
            }
        }

        self.inner.idle.notify_waiters();
        if report != DrainReport::default() {
            debug!(
                delivered = report.delivered,
                failed = report.failed,
                "Drain finished"
            );
        }
        report
    }

    /// Wait until nothing is buffered and no drain is running, draining the
    /// buffer here if no one else is.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if !self.is_draining() {
                if self.is_empty() {
                    return;
                }
                self.process().await;
                continue;
            }
            notified.await;
        }
    }

    /// Sequence numbers of the buffered items in delivery order.
    fn next_cycle(&self) -> Vec<u64> {
        let mut buffer = lock(&self.inner.buffer);
        // Stable sort: equal timestamps keep arrival order
        buffer.items.sort_by_key(|item| item.event.timestamp);
        buffer.items.iter().map(|item| item.seq).collect()
    }

    fn event_of(&self, seq: u64) -> Option<DomainEvent> {
        lock(&self.inner.buffer)
            .items
            .iter()
            .find(|item| item.seq == seq)
            .map(|item| item.event.clone())
    }

    /// Count a delivery attempt. `None` if the item was cleared meanwhile.
    fn begin_attempt(&self, seq: u64) -> Option<u32> {
        let mut buffer = lock(&self.inner.buffer);
        let item = buffer.items.iter_mut().find(|item| item.seq == seq)?;
        item.attempts += 1;
        Some(item.attempts)
    }

    fn remove(&self, seq: u64) {
        lock(&self.inner.buffer).items.retain(|item| item.seq != seq);
    }

    async fn deliver(&self, seq: u64, event: &DomainEvent) -> Delivery {
        let max_attempts = self.inner.config.max_retries.max(1);
        loop {
            let Some(attempt) = self.begin_attempt(seq) else {
                return Delivery::Discarded;
            };
            let processors = lock(&self.inner.processors).snapshot();
            if processors.is_empty() {
                warn!(event = %event, "No processors registered, event dropped");
                return Delivery::Delivered;
            }

            let results = join_all(processors.iter().map(|processor| processor(event.clone()))).await;
            let mut errors: Vec<HandlerError> = results.into_iter().filter_map(Result::err).collect();
            if errors.is_empty() {
                return Delivery::Delivered;
            }
            // A non-retryable rejection decides the outcome
            let index = errors.iter().position(|e| !e.is_transient()).unwrap_or(0);
            let error = errors.swap_remove(index);

            if !error.is_transient() || attempt >= max_attempts {
                return Delivery::Failed {
                    attempts: attempt,
                    error,
                };
            }

            let delay = backoff_delay(self.inner.config.retry_base_delay, attempt);
            warn!(
                event = %event,
                attempt,
                max_attempts,
                retry_in = ?delay,
                error = %error,
                "Event delivery failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn report_failure(&self, event: &DomainEvent, attempts: u32, error: &HandlerError) {
        error!(
            event = %event,
            attempts,
            transient = error.is_transient(),
            error = %error,
            payload = %event.to_json(),
            "Event delivery failed permanently, dropping event"
        );
        let handlers = lock(&self.inner.error_handlers).snapshot();
        for handler in handlers {
            handler(event, error);
        }
    }
}
