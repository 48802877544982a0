//! In-memory registry for embedding and tests

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{RegistryError, ServerRecord, ServerRegistry};
use crate::vault::EncryptedSecret;

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    records: RwLock<BTreeMap<String, ServerRecord>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = ServerRecord>) -> Self {
        let registry = Self::new();
        for record in records {
            registry.insert(record);
        }
        registry
    }

    /// Insert or replace a record, returning the previous one
    pub fn insert(&self, record: ServerRecord) -> Option<ServerRecord> {
        self.records.write().insert(record.alias.clone(), record)
    }

    pub fn remove(&self, alias: &str) -> Option<ServerRecord> {
        self.records.write().remove(alias)
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl ServerRegistry for MemoryRegistry {
    async fn get(&self, alias: &str) -> Result<Option<ServerRecord>, RegistryError> {
        Ok(self.records.read().get(alias).cloned())
    }

    async fn list(&self) -> Result<Vec<ServerRecord>, RegistryError> {
        Ok(self.records.read().values().cloned().collect())
    }

    async fn update_secrets(
        &self,
        alias: &str,
        encrypted_password: Option<EncryptedSecret>,
        encrypted_key_path: Option<EncryptedSecret>,
    ) -> Result<(), RegistryError> {
        let mut records = self.records.write();
        let record = records
            .get_mut(alias)
            .ok_or_else(|| RegistryError::NotFound(alias.to_string()))?;
        record.encrypted_password = encrypted_password;
        record.encrypted_key_path = encrypted_key_path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_get_and_update() {
        let registry = MemoryRegistry::with_records([ServerRecord::new("web", "10.0.0.1", "root")]);

        let record = registry.get("web").await.unwrap().unwrap();
        assert_eq!(record.port, 22);
        assert!(!record.has_credentials());

        let secret = EncryptedSecret::from_bytes(b"v1:abc".to_vec());
        registry
            .update_secrets("web", Some(secret.clone()), None)
            .await
            .unwrap();
        let record = registry.get("web").await.unwrap().unwrap();
        assert_eq!(record.encrypted_password, Some(secret));

        assert!(registry.get("db").await.unwrap().is_none());
        assert!(matches!(
            registry.update_secrets("db", None, None).await,
            Err(RegistryError::NotFound(_))
        ));
    }
}
