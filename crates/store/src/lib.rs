//! Keyed byte storage for domain records.
//!
//! The store knows nothing about policy: keys are domain names and values
//! are opaque bytes produced by `urlinfo_contracts::codec`. Writers that
//! need read-modify-write safety use the `compare_and_*` operations, which
//! compare the caller's version stamp against the stamp of the stored bytes.

use async_trait::async_trait;

mod memory;
mod postgres;

pub use memory::MemoryRecordStore;
pub use postgres::PgRecordStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("record store operation timed out")]
    Timeout,
    #[error("record store sql error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Returns whether a value was present.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// All keys, sorted.
    async fn keys(&self) -> Result<Vec<String>, StoreError>;

    /// Writes `bytes` only if the stored value still carries `expected`
    /// (`None` means the key must be absent). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        bytes: &[u8],
    ) -> Result<bool, StoreError>;

    /// Deletes the key only if the stored value still carries `expected`.
    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}
