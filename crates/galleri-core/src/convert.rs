use std::ffi::OsString;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use crate::media::MediaFile;

pub const JPEG_MIME: &str = "image/jpeg";

/// Converts image bytes between formats (`source`/`target` are MIME types).
#[async_trait]
pub trait FormatDecoder: Send + Sync {
    async fn decode(&self, bytes: &[u8], source: &str, target: &str) -> Result<Vec<u8>>;
}

/// Bytes ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayableBlob {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    /// True when the decoder produced these bytes
    pub converted: bool,
}

/// Extension a file will carry after conversion, if it changes.
pub fn converted_extension(file: &MediaFile) -> Option<&'static str> {
    file.is_heic().then_some("jpg")
}

/// HEIC goes through the decoder to JPEG; everything else passes through.
pub async fn convert(file: MediaFile, decoder: &dyn FormatDecoder) -> Result<DisplayableBlob> {
    if file.is_heic() {
        let source = file.effective_mime();
        let bytes = decoder
            .decode(&file.bytes, &source, JPEG_MIME)
            .await
            .with_context(|| format!("converting {} to JPEG", file.name))?;
        if bytes.is_empty() {
            bail!("decoder produced no output for {}", file.name);
        }
        return Ok(DisplayableBlob {
            bytes,
            mime_type: JPEG_MIME.to_string(),
            converted: true,
        });
    }

    let mime_type = file.effective_mime();
    Ok(DisplayableBlob {
        bytes: file.bytes,
        mime_type,
        converted: false,
    })
}

/// Decoder that shells out to a converter taking `<input> <output>`
/// arguments, like libheif's `heif-convert`.
#[derive(Debug, Clone)]
pub struct CommandDecoder {
    program: OsString,
}

impl CommandDecoder {
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for CommandDecoder {
    fn default() -> Self {
        Self::new("heif-convert")
    }
}

fn extension_for(mime: &str) -> &'static str {
    match mime {
        "image/jpeg" | "image/jpg" => "jpg",
        "image/png" => "png",
        "image/heif" | "image/heif-sequence" => "heif",
        _ => "heic",
    }
}

#[async_trait]
impl FormatDecoder for CommandDecoder {
    async fn decode(&self, bytes: &[u8], source: &str, target: &str) -> Result<Vec<u8>> {
        let dir = tempfile::tempdir().context("creating conversion directory")?;
        let input = dir.path().join(format!("input.{}", extension_for(source)));
        let output = dir.path().join(format!("output.{}", extension_for(target)));
        tokio::fs::write(&input, bytes).await?;

        let result = tokio::process::Command::new(&self.program)
            .arg(&input)
            .arg(&output)
            .output()
            .await
            .with_context(|| format!("running {}", self.program.to_string_lossy()))?;
        if !result.status.success() {
            bail!(
                "{} exited with {}: {}",
                self.program.to_string_lossy(),
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }

        tokio::fs::read(&output)
            .await
            .with_context(|| format!("reading {}", output.display()))
    }
}
