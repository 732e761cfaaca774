use std::time::Duration;
use thiserror::Error;

/// Inbound payload could not be turned into a reading. Counted and discarded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("payload is a JSON {0}, expected an object")]
    NotAnObject(&'static str),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("broker unreachable after {attempts} consecutive connection attempts: {last_error}")]
    ConnectCeiling { attempts: u32, last_error: String },
}

/// Storage failures split by whether another attempt can help.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("insert timed out after {0:?}")]
    Timeout(Duration),
    #[error("store rejected document: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::Rejected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("ingestion queue full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("pipeline already started")]
    AlreadyStarted,
    #[error("pipeline has been shut down and cannot be restarted")]
    Terminated,
}
