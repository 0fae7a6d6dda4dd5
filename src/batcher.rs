// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Delay/capacity batching primitive.
//!
//! Items are queued synchronously into an inbox. A single worker task owns
//! the processor and hands it batches of at most `capacity` items:
//!
//! ```text
//! queue() ──▶ inbox ──┬── count >= capacity ──▶ flush now
//!                     └── first item since last flush ──▶ flush after `delay`
//!
//!                     worker task (one per Batcher)
//!                     └── process(Vec<T>) ── strictly one at a time
//! ```
//!
//! Because the processor only ever runs on the worker, flushes never overlap.

use crate::config::BatcherConfig;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, instrument, trace};

type ProcessFn<T> = Arc<dyn Fn(Vec<T>) -> BoxFuture<'static, ()> + Send + Sync>;

enum Command {
    /// The inbox changed.
    Wake,
    /// Process one batch now.
    Flush(oneshot::Sender<()>),
    /// Process until the inbox is empty.
    FlushAll(oneshot::Sender<()>),
    /// Process until the inbox is empty, then exit.
    Close,
}

struct Shared<T> {
    inbox: Mutex<VecDeque<T>>,
    capacity: usize,
}

/// Queue that hands items to a processor in batches.
///
/// Dropping the batcher closes the command channel; the worker drains what
/// is left and exits.
pub struct Batcher<T: Send + 'static> {
    name: &'static str,
    shared: Arc<Shared<T>>,
    commands: mpsc::UnboundedSender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> Batcher<T> {
    /// Create a batcher and spawn its worker. Must be called inside a tokio runtime.
    pub fn new<F, Fut>(name: &'static str, capacity: usize, delay: Duration, process: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared {
            inbox: Mutex::new(VecDeque::new()),
            capacity,
        });
        let process: ProcessFn<T> = Arc::new(move |batch| Box::pin(process(batch)));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = tokio::spawn(run_worker(name, Arc::clone(&shared), delay, process, rx));

        Self {
            name,
            shared,
            commands: tx,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Create from a [`BatcherConfig`].
    pub fn from_config<F, Fut>(name: &'static str, config: &BatcherConfig, process: F) -> Self
    where
        F: Fn(Vec<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::new(name, config.capacity, config.delay(), process)
    }

    pub fn queue(&self, item: T) {
        let len = {
            let mut inbox = self.shared.inbox.lock();
            inbox.push_back(item);
            inbox.len()
        };
        self.wake_if_needed(len, 1);
    }

    pub fn queue_all(&self, items: impl IntoIterator<Item = T>) {
        let (len, added) = {
            let mut inbox = self.shared.inbox.lock();
            let before = inbox.len();
            inbox.extend(items);
            (inbox.len(), inbox.len() - before)
        };
        if added > 0 {
            self.wake_if_needed(len, added);
        }
    }

    fn wake_if_needed(&self, len: usize, added: usize) {
        // Only the first item since a flush (schedules the delay) and reaching
        // capacity need the worker's attention.
        if len == added || len >= self.shared.capacity {
            let _ = self.commands.send(Command::Wake);
        }
    }

    /// Items queued and not yet handed to the processor.
    pub fn count(&self) -> usize {
        self.shared.inbox.lock().len()
    }

    /// Discard everything queued.
    pub fn clear(&self) {
        let dropped = {
            let mut inbox = self.shared.inbox.lock();
            let n = inbox.len();
            inbox.clear();
            n
        };
        debug!(batcher = self.name, dropped, "Batcher cleared");
    }

    /// Process up to `capacity` items now and wait for the processor.
    pub async fn flush(&self) {
        self.request(Command::Flush).await;
    }

    /// Process until the inbox is empty and wait for the processor.
    pub async fn flush_all(&self) {
        self.request(Command::FlushAll).await;
    }

    async fn request(&self, make: fn(oneshot::Sender<()>) -> Command) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(make(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Drain everything, then stop the worker.
    ///
    /// Items queued while the worker drains are processed too.
    pub async fn close(&self) {
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        if self.commands.send(Command::Close).is_err() {
            handle.abort();
        }
        let _ = handle.await;
    }
}

async fn run_worker<T: Send + 'static>(
    name: &'static str,
    shared: Arc<Shared<T>>,
    delay: Duration,
    process: ProcessFn<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut deadline: Option<Instant> = None;

    loop {
        let command = tokio::select! {
            command = commands.recv() => command,
            _ = sleep_until(deadline), if deadline.is_some() => {
                deadline = None;
                process_one(name, &shared, &process).await;
                deadline = reschedule(&shared, delay);
                continue;
            }
        };

        match command {
            Some(Command::Wake) => {
                let len = shared.inbox.lock().len();
                if len >= shared.capacity {
                    loop {
                        let remaining = shared.inbox.lock().len();
                        if remaining < shared.capacity {
                            break;
                        }
                        process_one(name, &shared, &process).await;
                    }
                    deadline = reschedule(&shared, delay);
                } else if len > 0 && deadline.is_none() {
                    deadline = Some(Instant::now() + delay);
                }
            }
            Some(Command::Flush(ack)) => {
                process_one(name, &shared, &process).await;
                deadline = reschedule(&shared, delay);
                let _ = ack.send(());
            }
            Some(Command::FlushAll(ack)) => {
                while process_one(name, &shared, &process).await > 0 {}
                deadline = None;
                let _ = ack.send(());
            }
            Some(Command::Close) | None => {
                while process_one(name, &shared, &process).await > 0 {}
                trace!(batcher = name, "Batcher worker exiting");
                return;
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    if let Some(deadline) = deadline {
        tokio::time::sleep_until(deadline).await;
    }
}

fn reschedule<T>(shared: &Shared<T>, delay: Duration) -> Option<Instant> {
    (!shared.inbox.lock().is_empty()).then(|| Instant::now() + delay)
}

/// Hand up to `capacity` items to the processor; returns how many.
#[instrument(level = "trace", skip(shared, process))]
async fn process_one<T: Send + 'static>(
    name: &'static str,
    shared: &Shared<T>,
    process: &ProcessFn<T>,
) -> usize {
    let batch: Vec<T> = {
        let mut inbox = shared.inbox.lock();
        let n = inbox.len().min(shared.capacity);
        inbox.drain(..n).collect()
    };
    let size = batch.len();
    if size > 0 {
        trace!(batcher = name, size, "Processing batch");
        crate::metrics::record_batch_size(name, size);
        process(batch).await;
    }
    size
}
