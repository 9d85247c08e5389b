//! Contracts of the external collaborators: object storage, metadata
//! records and anonymous identity.
//!
//! All gateways are `Send + Sync` and async. `memory` and `local` hold
//! the reference implementations.

pub mod local;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use local::{JsonlMetadata, LocalStorage};
pub use memory::{AnonymousIdentity, MemoryMetadata, MemoryStorage};

/// Metadata returned with a listed object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub url: String,
    pub content_type: String,
    pub size: u64,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub items: Vec<(String, ObjectMeta)>,
    /// Continuation token; `None` when the listing is exhausted.
    pub next_cursor: Option<String>,
}

/// Flat-keyed object store.
#[async_trait]
pub trait StorageGateway: Send + Sync {
    /// Store `bytes` under `key`, returning the retrieval URL.
    async fn put(&self, key: &str, bytes: &[u8], content_type: &str) -> Result<String>;

    /// List up to `limit` keys under `prefix`, newest name first (descending
    /// key order), continuing after `cursor`.
    async fn list(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage>;

    async fn exists(&self, key: &str) -> Result<bool>;
}

/// Append-only record of an uploaded image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub url: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub content_type: String,
    /// SHA-256 of the stored bytes, hex
    pub content_hash: String,
    /// Uid of the identity that uploaded it
    pub owner: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordId(pub String);

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[async_trait]
pub trait MetadataGateway: Send + Sync {
    async fn insert(&self, record: MetadataRecord) -> Result<RecordId>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub uid: String,
    pub anonymous: bool,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_in_anonymous(&self) -> Result<Identity>;
}

/// Page through `keys` (any order) the way both reference stores do:
/// descending, strictly below `cursor`, at most `limit` items.
pub(crate) fn page_keys(mut keys: Vec<String>, cursor: Option<&str>, limit: usize) -> (Vec<String>, Option<String>) {
    keys.sort_unstable_by(|a, b| b.cmp(a));
    let remaining: Vec<String> = match cursor {
        Some(c) => keys.into_iter().filter(|k| k.as_str() < c).collect(),
        None => keys,
    };
    let limit = limit.max(1);
    let more = remaining.len() > limit;
    let page: Vec<String> = remaining.into_iter().take(limit).collect();
    let next = if more { page.last().cloned() } else { None };
    (page, next)
}
