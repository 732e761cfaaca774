use crate::error::QueueFull;
use crate::normalize::NormalizedRecord;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex,
};
use std::time::Duration;
use tokio::sync::mpsc;

/// Counters shared by the listener, the writer and the status logger.
///
/// Each error slot has a single writer: the listener owns `last_mqtt_error`,
/// the storage writer owns `last_store_error`.
#[derive(Debug)]
pub struct PipelineStats {
    pub received: AtomicU64,
    pub malformed: AtomicU64,
    pub enqueued: AtomicU64,
    pub dequeued: AtomicU64,
    pub dropped: AtomicU64,
    pub stored: AtomicU64,
    pub store_retries: AtomicU64,
    pub dead_lettered: AtomicU64,
    pub dead_letter_failed: AtomicU64,
    pub mqtt_connected: AtomicBool,
    /// Queue capacity, set by `channel`. Zero until a queue exists.
    pub capacity: AtomicU64,
    last_mqtt_error: Mutex<Option<String>>,
    last_store_error: Mutex<Option<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub received: u64,
    pub malformed: u64,
    pub dropped: u64,
    pub queue_depth: u64,
    pub stored: u64,
    pub store_retries: u64,
    pub dead_lettered: u64,
    pub dead_letter_failed: u64,
    pub mqtt_connected: bool,
}

impl PipelineStats {
    pub fn new() -> Self {
        Self {
            received: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            enqueued: AtomicU64::new(0),
            dequeued: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            dead_letter_failed: AtomicU64::new(0),
            mqtt_connected: AtomicBool::new(false),
            capacity: AtomicU64::new(0),
            last_mqtt_error: Mutex::new(None),
            last_store_error: Mutex::new(None),
        }
    }

    pub fn set_mqtt_connected(&self, connected: bool) {
        self.mqtt_connected.store(connected, Ordering::Relaxed);
    }

    /// Records currently buffered: total enqueued minus total dequeued.
    ///
    /// The consumer bumps `dequeued` just after the channel frees a slot, so
    /// a producer can briefly be one ahead; the result is clamped to the
    /// queue capacity.
    pub fn queue_depth(&self) -> u64 {
        let enqueued = self.enqueued.load(Ordering::SeqCst);
        let dequeued = self.dequeued.load(Ordering::SeqCst);
        let depth = enqueued.saturating_sub(dequeued);
        match self.capacity.load(Ordering::Relaxed) {
            0 => depth,
            capacity => depth.min(capacity),
        }
    }

    pub fn record_mqtt_error(&self, err: impl Into<String>) {
        set_slot(&self.last_mqtt_error, Some(err.into()));
    }

    pub fn clear_mqtt_error(&self) {
        set_slot(&self.last_mqtt_error, None);
    }

    pub fn last_mqtt_error(&self) -> Option<String> {
        read_slot(&self.last_mqtt_error)
    }

    pub fn record_store_error(&self, err: impl Into<String>) {
        set_slot(&self.last_store_error, Some(err.into()));
    }

    pub fn clear_store_error(&self) {
        set_slot(&self.last_store_error, None);
    }

    pub fn last_store_error(&self) -> Option<String> {
        read_slot(&self.last_store_error)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queue_depth: self.queue_depth(),
            stored: self.stored.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dead_letter_failed: self.dead_letter_failed.load(Ordering::Relaxed),
            mqtt_connected: self.mqtt_connected.load(Ordering::Relaxed),
        }
    }
}

fn set_slot(slot: &Mutex<Option<String>>, value: Option<String>) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

fn read_slot(slot: &Mutex<Option<String>>) -> Option<String> {
    slot.lock().ok().and_then(|guard| guard.clone())
}

impl Default for PipelineStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the bounded ingestion queue.
///
/// Full-queue policy is backpressure: `enqueue` waits up to `enqueue_timeout`
/// for a free slot, so a slow store throttles the broker callback instead of
/// losing data. Only when the wait times out is the record dropped and
/// counted in `PipelineStats::dropped`.
pub fn channel(
    capacity: usize,
    enqueue_timeout: Duration,
    stats: Arc<PipelineStats>,
) -> (QueueProducer, QueueConsumer) {
    let capacity = capacity.max(1);
    stats.capacity.store(capacity as u64, Ordering::Relaxed);
    let (tx, rx) = mpsc::channel(capacity);
    (
        QueueProducer {
            tx,
            stats: stats.clone(),
            capacity,
            enqueue_timeout,
        },
        QueueConsumer { rx, stats },
    )
}

#[derive(Clone)]
pub struct QueueProducer {
    tx: mpsc::Sender<NormalizedRecord>,
    stats: Arc<PipelineStats>,
    capacity: usize,
    enqueue_timeout: Duration,
}

impl QueueProducer {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        self.stats.clone()
    }

    /// Returns `false` when the record was not accepted (queue full past the
    /// timeout, or the consumer has gone away).
    pub async fn enqueue(&self, record: NormalizedRecord) -> bool {
        let permit = match tokio::time::timeout(self.enqueue_timeout, self.tx.reserve()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    capture_time = %record.capture_time,
                    "ingestion queue closed; dropping record"
                );
                return false;
            }
            Err(_) => {
                let dropped = self.stats.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let err = QueueFull {
                    capacity: self.capacity,
                };
                tracing::warn!(
                    error = %err,
                    timeout_ms = self.enqueue_timeout.as_millis() as u64,
                    dropped,
                    capture_time = %record.capture_time,
                    "dropping record"
                );
                return false;
            }
        };
        // Counted while the slot is reserved so depth never exceeds capacity.
        let queue_depth = (self.stats.enqueued.fetch_add(1, Ordering::SeqCst) + 1)
            .saturating_sub(self.stats.dequeued.load(Ordering::SeqCst));
        permit.send(record);
        tracing::trace!(queue_depth, "queued record");
        true
    }
}

pub struct QueueConsumer {
    rx: mpsc::Receiver<NormalizedRecord>,
    stats: Arc<PipelineStats>,
}

impl QueueConsumer {
    /// Waits for the next record. `None` once every producer is gone and the
    /// buffer is empty.
    pub async fn dequeue(&mut self) -> Option<NormalizedRecord> {
        let record = self.rx.recv().await?;
        self.stats.dequeued.fetch_add(1, Ordering::SeqCst);
        Some(record)
    }

    pub fn try_dequeue(&mut self) -> Option<NormalizedRecord> {
        let record = self.rx.try_recv().ok()?;
        self.stats.dequeued.fetch_add(1, Ordering::SeqCst);
        Some(record)
    }

    /// Refuses further enqueues; records already buffered stay dequeueable.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
