//! In-memory gateways.
//!
//! Nothing is persisted; used by tests and for dry runs.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    page_keys, Identity, IdentityProvider, ListPage, MetadataGateway, MetadataRecord, ObjectMeta, RecordId,
    StorageGateway,
};

#[derive(Clone)]
struct MemoryObject {
    bytes: Vec<u8>,
    meta: ObjectMeta,
}

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    pub fn get(&self, key: &str) -> Option<(Vec<u8>, ObjectMeta)> {
        self.objects
            .lock()
            .get(key)
            .map(|obj| (obj.bytes.clone(), obj.meta.clone()))
    }
}

#[async_trait]
impl StorageGateway for MemoryStorage {
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        anyhow::ensure!(!key.is_empty(), "empty object key");
        let meta = ObjectMeta {
            url: format!("memory://{}", key),
            content_type: content_type.to_string(),
            size: bytes.len() as u64,
        };
        let url = meta.url.clone();
        self.objects.lock().insert(
            key.to_string(),
            MemoryObject {
                bytes: bytes.to_vec(),
                meta,
            },
        );
        Ok(url)
    }

    async fn list(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage> {
        let objects = self.objects.lock();
        let keys: Vec<String> = objects.keys().filter(|k| k.starts_with(prefix)).cloned().collect();
        let (page, next_cursor) = page_keys(keys, cursor, limit);
        let items = page
            .into_iter()
            .filter_map(|k| objects.get(&k).map(|obj| (k, obj.meta.clone())))
            .collect();
        Ok(ListPage { items, next_cursor })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.lock().contains_key(key))
    }
}

#[derive(Default)]
pub struct MemoryMetadata {
    records: Mutex<Vec<MetadataRecord>>,
}

impl MemoryMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<MetadataRecord> {
        self.records.lock().clone()
    }
}

#[async_trait]
impl MetadataGateway for MemoryMetadata {
    async fn insert(&self, record: MetadataRecord) -> Result<RecordId> {
        let mut records = self.records.lock();
        records.push(record);
        Ok(RecordId(format!("{:08}", records.len())))
    }
}

/// Issues a fresh anonymous uid on every sign-in.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnonymousIdentity;

#[async_trait]
impl IdentityProvider for AnonymousIdentity {
    async fn sign_in_anonymous(&self) -> Result<Identity> {
        Ok(Identity {
            uid: uuid::Uuid::new_v4().to_string(),
            anonymous: true,
        })
    }
}
