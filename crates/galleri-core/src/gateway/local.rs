//! Gateways backed by a local directory: objects as files under a root,
//! metadata as an append-only JSON-lines log.

use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use super::{page_keys, ListPage, MetadataGateway, MetadataRecord, ObjectMeta, RecordId, StorageGateway};

/// Object store rooted at a directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create the root directory if needed.
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        tokio::fs::create_dir_all(root)
            .await
            .with_context(|| format!("creating {}", root.display()))?;
        let root = tokio::fs::canonicalize(root)
            .await
            .with_context(|| format!("resolving {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.root.join(validate_key(key)?))
    }

    fn url_for(&self, path: &Path) -> String {
        format!("file://{}", path.to_string_lossy().replace('\\', "/"))
    }
}

/// Reject empty, absolute and `..` keys.
fn validate_key(key: &str) -> Result<PathBuf> {
    if key.is_empty() {
        bail!("object key cannot be empty");
    }
    let path = Path::new(key);
    if path.is_absolute() {
        bail!("object key cannot be absolute: {}", key);
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(name) => normalized.push(name),
            Component::CurDir => {}
            Component::ParentDir => bail!("object key cannot contain '..': {}", key),
            Component::RootDir | Component::Prefix(_) => {
                bail!("object key cannot contain root or prefix: {}", key)
            }
        }
    }
    if normalized.as_os_str().is_empty() {
        bail!("object key normalized to empty path: {}", key);
    }
    Ok(normalized)
}

#[async_trait]
impl StorageGateway for LocalStorage {
    async fn put(&self, key: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let path = self.object_path(key)?;
        let dir = path.parent().unwrap_or(&self.root).to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating {}", dir.display()))?;

        // Write to temp file first, then rename for atomicity
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("object");
        let temp_path = dir.join(format!(".{}.tmp", file_name));
        tokio::fs::write(&temp_path, bytes)
            .await
            .with_context(|| format!("writing {}", temp_path.display()))?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .with_context(|| format!("renaming into {}", path.display()))?;

        Ok(self.url_for(&path))
    }

    async fn list(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> Result<ListPage> {
        // Keys are flat under the prefix's directory part
        let dir_part = match prefix.rfind('/') {
            Some(pos) => &prefix[..pos],
            None => "",
        };
        let dir = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_part)?
        };

        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(ListPage::default()),
            Err(e) => return Err(e).with_context(|| format!("listing {}", dir.display())),
        };

        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if name.starts_with('.') {
                continue;
            }
            let key = if dir_part.is_empty() {
                name
            } else {
                format!("{}/{}", dir_part, name)
            };
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        let (page, next_cursor) = page_keys(keys, cursor, limit);
        let mut items = Vec::with_capacity(page.len());
        for key in page {
            let path = self.object_path(&key)?;
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            let content_type = mime_guess::from_path(&path)
                .first()
                .map(|m| m.essence_str().to_string())
                .unwrap_or_else(|| "application/octet-stream".to_string());
            let meta = ObjectMeta {
                url: self.url_for(&path),
                content_type,
                size,
            };
            items.push((key, meta));
        }

        Ok(ListPage { items, next_cursor })
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// Metadata log, one JSON record per line.
#[derive(Debug)]
pub struct JsonlMetadata {
    path: PathBuf,
    append: tokio::sync::Mutex<()>,
}

impl JsonlMetadata {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            append: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records in append order. A missing log reads as empty.
    pub async fn read_all(&self) -> Result<Vec<MetadataRecord>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("reading {}", self.path.display())),
        };
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("parsing metadata record"))
            .collect()
    }
}

#[derive(serde::Serialize)]
struct LogLine<'a> {
    id: &'a str,
    #[serde(flatten)]
    record: &'a MetadataRecord,
}

#[async_trait]
impl MetadataGateway for JsonlMetadata {
    async fn insert(&self, record: MetadataRecord) -> Result<RecordId> {
        let id = uuid::Uuid::new_v4().to_string();
        let mut line = serde_json::to_string(&LogLine { id: &id, record: &record })?;
        line.push('\n');

        let _guard = self.append.lock().await;
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        Ok(RecordId(id))
    }
}
