pub mod convert;
pub mod date;
pub mod error;
pub mod gallery;
pub mod gateway;
pub mod intake;
pub mod media;
pub mod naming;
pub mod session;

use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::Context;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use convert::{CommandDecoder, DisplayableBlob, FormatDecoder};
pub use date::exif::{CaptureTag, ExifReader, KamadakExif};
pub use date::{Clock, DateSource, FixedClock, ResolvedDate, SystemClock};
pub use error::{AuthError, GalleryError, IntakeError, IntakeErrorKind, IntakeStep};
pub use gallery::{Direction, FetchState, GalleryEntry, GalleryViewModel, LoadOutcome};
pub use intake::{IntakePipeline, IntakeReport, StoredImage};
pub use media::MediaFile;
pub use naming::CanonicalName;
pub use session::Session;

fn default_storage_prefix() -> String {
    "images/".to_string()
}

fn default_page_size() -> usize {
    12
}

fn default_decoder_program() -> String {
    "heif-convert".to_string()
}

/// What to do when a canonical name is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollisionPolicy {
    /// Report `NameCollision` for the file
    #[default]
    Fail,
    /// Step to `name(1).ext`, `name(2).ext`, ...
    Rename,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Options {
    #[serde(default = "default_storage_prefix")]
    pub storage_prefix: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default)]
    pub collision: CollisionPolicy,
    /// Upper bound for each external call; unbounded when absent.
    #[serde(default)]
    pub step_timeout_secs: Option<u64>,
    #[serde(default = "default_decoder_program")]
    pub decoder_program: String,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            storage_prefix: default_storage_prefix(),
            page_size: default_page_size(),
            collision: CollisionPolicy::default(),
            step_timeout_secs: None,
            decoder_program: default_decoder_program(),
        }
    }
}

impl Options {
    /// Load options from a JSON file. Missing fields take their defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading options from {}", path.display()))?;
        let options: Options = serde_json::from_str(&text)
            .with_context(|| format!("parsing options in {}", path.display()))?;
        anyhow::ensure!(options.page_size > 0, "page_size must be at least 1");
        Ok(options)
    }

    pub fn step_timeout(&self) -> Option<Duration> {
        self.step_timeout_secs.map(Duration::from_secs)
    }
}

/// Type alias for progress callback. The callback may borrow from the caller.
pub type ProgressCallback<'a> = dyn Fn(&str, u64, u64, &str) + Send + Sync + 'a;

/// Throttled progress reporter: emits at most every 200ms, and always on completion.
pub struct ThrottledProgress<'a> {
    inner: &'a ProgressCallback<'a>,
    last_emit: Mutex<Option<Instant>>,
}

impl<'a> ThrottledProgress<'a> {
    pub fn new(inner: &'a ProgressCallback<'a>) -> Self {
        Self {
            inner,
            last_emit: Mutex::new(None),
        }
    }

    pub fn report(&self, stage: &str, current: u64, total: u64, message: &str) {
        let is_done = current + 1 >= total;
        if !is_done {
            let mut last = self.last_emit.lock();
            if last.map_or(false, |t| t.elapsed() < Duration::from_millis(200)) {
                return;
            }
            *last = Some(Instant::now());
        }
        (self.inner)(stage, current, total, message);
    }
}
