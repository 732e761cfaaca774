use crate::backoff::Backoff;
use crate::dead_letter::{DeadLetterEntry, DeadLetterSink};
use crate::error::StoreError;
use crate::normalize::NormalizedRecord;
use crate::pipeline::{PipelineStats, QueueConsumer};
use crate::store::DocumentStore;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const DRAIN_DEADLINE_REASON: &str = "drain deadline reached";

#[derive(Debug, Clone)]
pub struct WriterSettings {
    /// Total insert attempts per record, first try included.
    pub max_attempts: u32,
    pub insert_timeout: Duration,
    pub retry_base: Duration,
    pub retry_max: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterSummary {
    pub stored: u64,
    pub dead_lettered: u64,
    /// Records the dead-letter sink refused; they survive only in the error log.
    pub dead_letter_failed: u64,
}

#[derive(Debug)]
enum WriteOutcome {
    Stored,
    Failed { reason: String, attempts: u32 },
}

/// Single consumer of the ingestion queue. Owns the store connection and the
/// dead-letter sink; talks to the rest of the pipeline only through the queue.
pub struct StorageWriter<S, D> {
    store: S,
    dead_letter: D,
    settings: WriterSettings,
    stats: Arc<PipelineStats>,
}

impl<S, D> StorageWriter<S, D>
where
    S: DocumentStore,
    D: DeadLetterSink,
{
    pub fn new(store: S, dead_letter: D, settings: WriterSettings, stats: Arc<PipelineStats>) -> Self {
        Self {
            store,
            dead_letter,
            settings,
            stats,
        }
    }

    /// Drains `queue` until it is closed and empty. Once `drain_deadline`
    /// fires, pending backoff is cut short and every record not yet written
    /// goes to the dead-letter sink.
    pub async fn run(
        mut self,
        mut queue: QueueConsumer,
        drain_deadline: CancellationToken,
    ) -> WriterSummary {
        let mut summary = WriterSummary::default();

        loop {
            let record = tokio::select! {
                biased;
                _ = drain_deadline.cancelled() => break,
                next = queue.dequeue() => match next {
                    Some(record) => record,
                    None => break,
                },
            };
            self.process(record, &drain_deadline, &mut summary).await;
        }

        if drain_deadline.is_cancelled() {
            queue.close();
            let mut leftover = 0u64;
            while let Some(record) = queue.dequeue().await {
                leftover += 1;
                let routed = self
                    .route_to_dead_letter(record, DRAIN_DEADLINE_REASON.to_string(), 0)
                    .await;
                summary.count_dead_letter(routed);
            }
            if leftover > 0 {
                tracing::warn!(leftover, "drain deadline reached with records still queued");
            }
        }

        tracing::info!(
            stored = summary.stored,
            dead_lettered = summary.dead_lettered,
            dead_letter_failed = summary.dead_letter_failed,
            "storage writer stopped"
        );
        summary
    }

    async fn process(
        &mut self,
        record: NormalizedRecord,
        drain_deadline: &CancellationToken,
        summary: &mut WriterSummary,
    ) {
        match self.write(&record, drain_deadline).await {
            WriteOutcome::Stored => summary.stored += 1,
            WriteOutcome::Failed { reason, attempts } => {
                let routed = self.route_to_dead_letter(record, reason, attempts).await;
                summary.count_dead_letter(routed);
            }
        }
    }

    async fn write(
        &self,
        record: &NormalizedRecord,
        drain_deadline: &CancellationToken,
    ) -> WriteOutcome {
        let document = record.document();
        let max_attempts = self.settings.max_attempts.max(1);
        let mut backoff = Backoff::new(self.settings.retry_base, self.settings.retry_max);
        let mut attempts = 0u32;

        loop {
            if drain_deadline.is_cancelled() {
                return WriteOutcome::Failed {
                    reason: DRAIN_DEADLINE_REASON.to_string(),
                    attempts,
                };
            }

            attempts += 1;
            let result =
                match tokio::time::timeout(self.settings.insert_timeout, self.store.insert(&document))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(StoreError::Timeout(self.settings.insert_timeout)),
                };

            let err = match result {
                Ok(()) => {
                    self.stats.stored.fetch_add(1, Ordering::Relaxed);
                    self.stats.clear_store_error();
                    tracing::debug!(
                        capture_time = %document.capture_time,
                        attempts,
                        "inserted document"
                    );
                    return WriteOutcome::Stored;
                }
                Err(err) => err,
            };

            self.stats.record_store_error(err.to_string());
            if !err.is_transient() {
                tracing::warn!(error = %err, attempts, "store rejected document");
                return WriteOutcome::Failed {
                    reason: err.to_string(),
                    attempts,
                };
            }
            if attempts >= max_attempts {
                tracing::warn!(error = %err, attempts, "insert retries exhausted");
                return WriteOutcome::Failed {
                    reason: format!("retries exhausted: {err}"),
                    attempts,
                };
            }

            let delay = backoff.next_delay();
            self.stats.store_retries.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                error = %err,
                attempts,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "insert failed; retrying"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = drain_deadline.cancelled() => {
                    return WriteOutcome::Failed {
                        reason: format!("{DRAIN_DEADLINE_REASON}: {err}"),
                        attempts,
                    };
                }
            }
        }
    }

    /// Returns `true` once the entry is durably in the sink.
    async fn route_to_dead_letter(
        &mut self,
        record: NormalizedRecord,
        reason: String,
        attempts: u32,
    ) -> bool {
        let entry = DeadLetterEntry::new(record, reason, attempts);
        match self.dead_letter.append(&entry).await {
            Ok(()) => {
                let total = self.stats.dead_lettered.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(
                    reason = %entry.reason,
                    attempts,
                    total,
                    "record routed to dead-letter sink"
                );
                true
            }
            Err(err) => {
                self.stats.dead_letter_failed.fetch_add(1, Ordering::Relaxed);
                // Last resort: the log line carries the whole document.
                let document = serde_json::to_string(&entry.document()).unwrap_or_default();
                tracing::error!(
                    error = %err,
                    reason = %entry.reason,
                    attempts,
                    document = %document,
                    "failed to write dead-letter entry"
                );
                false
            }
        }
    }
}

impl WriterSummary {
    fn count_dead_letter(&mut self, routed: bool) {
        if routed {
            self.dead_lettered += 1;
        } else {
            self.dead_letter_failed += 1;
        }
    }
}
