use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use equaforge_core::{BlobRef, Filter, ForgeError, RecordId};

/// A stored binary object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub name: String,
    pub data: Vec<u8>,
}

/// Untyped document database plus blob storage.
///
/// Every write touches exactly one document or blob; nothing here spans
/// records atomically.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a JSON object and return the id assigned to it.
    async fn insert(&self, collection: &str, body: Value) -> Result<RecordId, ForgeError>;

    async fn get(&self, collection: &str, id: RecordId) -> Result<Option<Value>, ForgeError>;

    /// Documents matching every clause of `filter`, in insertion order.
    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
    ) -> Result<Vec<(RecordId, Value)>, ForgeError>;

    async fn count(&self, collection: &str, filter: &Filter) -> Result<usize, ForgeError>;

    /// Merge `patch` into the document (RFC 7396). Returns false if no such document.
    async fn update_fields(
        &self,
        collection: &str,
        id: RecordId,
        patch: Value,
    ) -> Result<bool, ForgeError>;

    /// Merge `patch` only if the document still matches `expected`. Returns
    /// false if it is missing or no longer matches.
    async fn update_fields_if(
        &self,
        collection: &str,
        id: RecordId,
        expected: &Filter,
        patch: Value,
    ) -> Result<bool, ForgeError>;

    async fn delete(&self, collection: &str, id: RecordId) -> Result<bool, ForgeError>;

    async fn put_blob(&self, name: &str, data: &[u8]) -> Result<BlobRef, ForgeError>;

    async fn get_blob(&self, blob: BlobRef) -> Result<Option<Blob>, ForgeError>;

    async fn delete_blob(&self, blob: BlobRef) -> Result<bool, ForgeError>;

    /// Time of the most recent successful write, if any.
    async fn last_write(&self) -> Result<Option<DateTime<Utc>>, ForgeError>;
}
