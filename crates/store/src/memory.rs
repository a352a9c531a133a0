use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use urlinfo_contracts::codec::version_stamp;

use crate::{RecordStore, StoreError};

/// Process-local store for tests and single-node development.
#[derive(Default)]
pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn clear(&self) {
        self.records.write().await.clear();
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.records.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        self.records
            .write()
            .await
            .insert(key.to_string(), bytes.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.records.read().await.contains_key(key))
    }

    async fn keys(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.records.read().await.keys().cloned().collect())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        bytes: &[u8],
    ) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let current = records.get(key).map(|stored| version_stamp(stored));
        if current.as_deref() != expected {
            return Ok(false);
        }
        records.insert(key.to_string(), bytes.to_vec());
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &str) -> Result<bool, StoreError> {
        let mut records = self.records.write().await;
        let matches = records
            .get(key)
            .is_some_and(|stored| version_stamp(stored) == expected);
        if matches {
            records.remove(key);
        }
        Ok(matches)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn basic_operations_round_trip() {
        let store = MemoryRecordStore::new();
        assert_eq!(store.get("a").await.expect("get"), None);
        assert!(!store.exists("a").await.expect("exists"));

        store.set("b", b"2").await.expect("set");
        store.set("a", b"1").await.expect("set");
        assert_eq!(store.get("a").await.expect("get"), Some(b"1".to_vec()));
        assert_eq!(store.keys().await.expect("keys"), vec!["a", "b"]);

        assert!(store.delete("a").await.expect("delete"));
        assert!(!store.delete("a").await.expect("delete"));

        store.clear().await;
        assert!(store.keys().await.expect("keys").is_empty());
    }

    #[tokio::test]
    async fn compare_and_set_detects_concurrent_writes() {
        let store = MemoryRecordStore::new();

        assert!(store.compare_and_set("d", None, b"v1").await.expect("cas"));
        assert!(!store.compare_and_set("d", None, b"v1").await.expect("cas"));

        let v1 = version_stamp(b"v1");
        assert!(store.compare_and_set("d", Some(&v1), b"v2").await.expect("cas"));
        assert!(!store.compare_and_set("d", Some(&v1), b"v3").await.expect("cas"));
        assert_eq!(store.get("d").await.expect("get"), Some(b"v2".to_vec()));

        assert!(!store.compare_and_delete("d", &v1).await.expect("cad"));
        let v2 = version_stamp(b"v2");
        assert!(store.compare_and_delete("d", &v2).await.expect("cad"));
        assert!(!store.exists("d").await.expect("exists"));
    }
}
