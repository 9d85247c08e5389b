pub mod exif;

use chrono::{DateTime, Local, NaiveDate, Utc};

use self::exif::ExifReader;
use crate::media::MediaFile;

/// Where a resolved date came from, best first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DateSource {
    CaptureTag,
    LastModified,
    ProcessingTime,
}

/// Calendar date a file was taken on, as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedDate {
    pub date: NaiveDate,
    pub source: DateSource,
}

impl ResolvedDate {
    /// `YYYYMMDD`, the form used in canonical names.
    pub fn compact(&self) -> String {
        self.date.format("%Y%m%d").to_string()
    }
}

/// Source of wall-clock time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;

    fn today(&self) -> NaiveDate {
        self.now().with_timezone(&Local).date_naive()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock frozen at one instant.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Resolve the capture date of a file: EXIF capture tag, then the file's
/// modification time, then today.
pub fn resolve(file: &MediaFile, reader: &dyn ExifReader, clock: &dyn Clock) -> ResolvedDate {
    // 1. Embedded capture tag
    if file.carries_capture_metadata() {
        if let Some(dt) = exif::extract_capture_time(reader, &file.bytes) {
            return ResolvedDate {
                date: dt.date(),
                source: DateSource::CaptureTag,
            };
        }
    }

    // 2. Last-modified timestamp, in local time
    if let Some(modified) = file.last_modified {
        return ResolvedDate {
            date: modified.with_timezone(&Local).date_naive(),
            source: DateSource::LastModified,
        };
    }

    // 3. Now
    ResolvedDate {
        date: clock.today(),
        source: DateSource::ProcessingTime,
    }
}
