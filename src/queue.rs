//! Bounded event queue between reader threads and the consumer.
//!
//! Readers never block: when the queue is full the oldest event is evicted so
//! the consumer always sees the freshest telemetry. The consumer drains in
//! small batches on a fixed tick ([`EventPump`]).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};

use crate::config::QueueConfig;
use crate::decoder::DecodedSample;
use crate::errors::Result;

/// A sample together with its arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEvent {
    /// Monotonic arrival sequence across all producers.
    pub seq: u64,
    pub sample: DecodedSample,
}

#[derive(Debug)]
struct Inner {
    items: VecDeque<QueuedEvent>,
    next_seq: u64,
    dropped: u64,
}

/// Multi-producer, single-consumer FIFO with drop-oldest overflow.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    inner: Mutex<Inner>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                next_seq: 0,
                dropped: 0,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking producer cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a sample. Returns the evicted event when the queue was full.
    pub fn enqueue(&self, sample: DecodedSample) -> Option<QueuedEvent> {
        let mut inner = self.lock();
        let evicted = if inner.items.len() >= self.capacity {
            inner.dropped += 1;
            let dropped = inner.dropped;
            if dropped == 1 || dropped % 100 == 0 {
                warn!(
                    "event queue full ({} entries), dropping oldest event ({} dropped so far)",
                    self.capacity, dropped
                );
            }
            inner.items.pop_front()
        } else {
            None
        };

        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.items.push_back(QueuedEvent { seq, sample });
        evicted
    }

    /// Remove up to `max` events in arrival order.
    pub fn drain_batch(&self, max: usize) -> Vec<QueuedEvent> {
        let mut inner = self.lock();
        let n = max.min(inner.items.len());
        inner.items.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    /// Total events evicted because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn clear(&self) {
        self.lock().items.clear();
    }
}

/// Consumer thread that drains the queue on a fixed tick.
///
/// The handler runs on the pump thread only, which makes it the single writer
/// of whatever presentation state it updates.
pub struct EventPump {
    running: Arc<AtomicBool>,
    done_rx: mpsc::Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl EventPump {
    pub fn spawn<F>(queue: Arc<EventQueue>, config: &QueueConfig, mut handler: F) -> Result<Self>
    where
        F: FnMut(Vec<QueuedEvent>) + Send + 'static,
    {
        config.validate()?;
        let tick = config.tick();
        let batch_size = config.batch_size;
        let running = Arc::new(AtomicBool::new(true));
        let (done_tx, done_rx) = mpsc::channel();

        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("sm1-event-pump".into())
            .spawn(move || {
                let mut next_tick = Instant::now() + tick;
                while flag.load(Ordering::Acquire) {
                    let batch = queue.drain_batch(batch_size);
                    if !batch.is_empty() {
                        handler(batch);
                    }
                    let now = Instant::now();
                    if next_tick > now {
                        thread::sleep(next_tick - now);
                    }
                    next_tick += tick;
                    // Fell behind (e.g. slow handler): restart the cadence instead of bursting.
                    if next_tick < Instant::now() {
                        next_tick = Instant::now() + tick;
                    }
                }
                let _ = done_tx.send(());
            })?;

        Ok(Self {
            running,
            done_rx,
            handle: Some(handle),
        })
    }

    /// Stop the pump and wait up to `timeout` for it to exit.
    pub fn stop(mut self, timeout: Duration) {
        self.shutdown(timeout);
    }

    fn shutdown(&mut self, timeout: Duration) {
        self.running.store(false, Ordering::Release);
        let Some(handle) = self.handle.take() else {
            return;
        };
        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                debug!("event pump stopped");
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!("event pump did not stop within {:?}, detaching", timeout);
            }
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}
