use super::DocumentStore;
use crate::error::StoreError;
use crate::normalize::StoredDocument;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Failures {
    None,
    First(u32, StoreError),
    Always(StoreError),
}

/// In-memory document store with scriptable failures, for tests.
pub struct MemoryStore {
    documents: Mutex<Vec<StoredDocument>>,
    failures: Mutex<Failures>,
    attempts: AtomicU32,
    latency: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: Mutex::new(Vec::new()),
            failures: Mutex::new(Failures::None),
            attempts: AtomicU32::new(0),
            latency: Duration::ZERO,
        }
    }

    /// The first `count` inserts fail with `err`, later ones succeed.
    pub fn failing_first(count: u32, err: StoreError) -> Self {
        let store = Self::new();
        *store.failures.lock().expect("lock") = Failures::First(count, err);
        store
    }

    pub fn always_failing(err: StoreError) -> Self {
        let store = Self::new();
        *store.failures.lock().expect("lock") = Failures::Always(err);
        store
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn documents(&self) -> Vec<StoredDocument> {
        self.documents.lock().expect("lock").clone()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn insert(&self, document: &StoredDocument) -> Result<(), StoreError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        {
            let mut failures = self.failures.lock().expect("lock");
            match &mut *failures {
                Failures::None => {}
                Failures::Always(err) => return Err(err.clone()),
                Failures::First(remaining, err) => {
                    if *remaining > 0 {
                        *remaining -= 1;
                        return Err(err.clone());
                    }
                }
            }
        }
        self.documents.lock().expect("lock").push(document.clone());
        Ok(())
    }
}
