#[cfg(test)]
pub mod memory;
mod postgres;

pub use postgres::PgDocumentStore;

use crate::error::StoreError;
use crate::normalize::StoredDocument;
use async_trait::async_trait;
use std::sync::Arc;

/// The primary document store. Owned by the storage writer only.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn insert(&self, document: &StoredDocument) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: DocumentStore + ?Sized> DocumentStore for Arc<T> {
    async fn ping(&self) -> Result<(), StoreError> {
        (**self).ping().await
    }

    async fn insert(&self, document: &StoredDocument) -> Result<(), StoreError> {
        (**self).insert(document).await
    }
}
