use std::path::Path;

use anyhow::Context;
use chrono::{DateTime, Utc};

/// MIME types of the HEIC family, which browsers cannot display directly.
const HEIC_MIME_TYPES: &[&str] = &[
    "image/heic",
    "image/heif",
    "image/heic-sequence",
    "image/heif-sequence",
];

/// Formats that can embed an EXIF capture timestamp.
const CAPTURE_METADATA_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/tiff",
    "image/webp",
    "image/heic",
    "image/heif",
];

const GENERIC_MIME: &str = "application/octet-stream";

/// A file selected for upload.
#[derive(Debug, Clone)]
pub struct MediaFile {
    /// Original file name as picked by the user
    pub name: String,
    /// Declared MIME type (may be empty)
    pub mime_type: String,
    /// Raw file contents
    pub bytes: Vec<u8>,
    /// File-system modification time, if known
    pub last_modified: Option<DateTime<Utc>>,
}

impl MediaFile {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            bytes,
            last_modified: None,
        }
    }

    pub fn with_last_modified(mut self, last_modified: DateTime<Utc>) -> Self {
        self.last_modified = Some(last_modified);
        self
    }

    /// Read a file from disk, guessing its MIME type from the extension.
    pub async fn read(path: &Path) -> anyhow::Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let meta = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file")
            .to_string();
        let mime_type = mime_guess::from_path(path)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_default();

        Ok(Self {
            name,
            mime_type,
            bytes,
            last_modified: meta.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    /// Declared MIME type, or a guess from the file name when the declared
    /// one is empty or generic.
    pub fn effective_mime(&self) -> String {
        let declared = self.mime_type.trim().to_ascii_lowercase();
        if !declared.is_empty() && declared != GENERIC_MIME {
            return declared;
        }
        if has_heic_extension(&self.name) {
            return "image/heic".to_string();
        }
        mime_guess::from_path(&self.name)
            .first()
            .map(|m| m.essence_str().to_string())
            .unwrap_or_else(|| GENERIC_MIME.to_string())
    }

    /// Whether the file needs conversion before it can be displayed.
    pub fn is_heic(&self) -> bool {
        HEIC_MIME_TYPES.contains(&self.effective_mime().as_str())
    }

    /// Whether it is worth looking for an EXIF capture tag (PNG, GIF and
    /// friends are skipped).
    pub fn carries_capture_metadata(&self) -> bool {
        CAPTURE_METADATA_MIME_TYPES.contains(&self.effective_mime().as_str())
    }
}

fn has_heic_extension(name: &str) -> bool {
    Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map_or(false, |e| e.eq_ignore_ascii_case("heic") || e.eq_ignore_ascii_case("heif"))
}
