use std::fmt;
use std::sync::LazyLock;

use chrono::NaiveDate;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::date::ResolvedDate;

static DATE_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<date>(20|19|18)\d{2}[01]\d[0-3]\d)_").unwrap());

/// Date-prefixed, sortable name used both as storage key suffix and as
/// gallery sort key: `YYYYMMDD_<base><ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CanonicalName(String);

impl CanonicalName {
    /// Wrap an existing name without re-prefixing it (e.g. a listed key).
    pub fn from_existing(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The capture date encoded in the prefix, if any.
    pub fn sort_key(&self) -> Option<NaiveDate> {
        date_prefix(&self.0)
    }

    /// Replace the extension (`ext` without the dot).
    pub fn with_extension(&self, ext: &str) -> Self {
        let (base, _) = split_name(&self.0);
        if ext.is_empty() {
            Self(base.to_string())
        } else {
            Self(format!("{}.{}", base, ext))
        }
    }

    /// `base(n).ext`, the form used to step around a taken name.
    pub fn numbered(&self, n: u32) -> Self {
        let (base, ext) = split_name(&self.0);
        Self(format!("{}({}){}", base, n, ext))
    }

    /// Storage key under the given prefix (`images/` by default).
    pub fn storage_key(&self, prefix: &str) -> String {
        format!("{}{}", prefix, self.0)
    }
}

impl fmt::Display for CanonicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CanonicalName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Build the canonical name for a file. Names that already carry a valid
/// date prefix are kept as they are.
pub fn normalize(date: &ResolvedDate, original_name: &str) -> CanonicalName {
    let cleaned = sanitize(original_name);
    if date_prefix(&cleaned).is_some() {
        return CanonicalName(cleaned);
    }
    let (base, ext) = split_name(&cleaned);
    CanonicalName(format!("{}_{}{}", date.compact(), base, ext))
}

/// Split at the last dot into `(base, ".ext")`. A leading dot does not
/// start an extension.
pub fn split_name(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name.split_at(pos),
        _ => (name, ""),
    }
}

/// Parse a leading `YYYYMMDD_` into a date.
pub fn date_prefix(name: &str) -> Option<NaiveDate> {
    let caps = DATE_PREFIX_RE.captures(name)?;
    NaiveDate::parse_from_str(caps.name("date")?.as_str(), "%Y%m%d").ok()
}

/// NFC-normalise and flatten path separators so the name stays a single
/// key segment.
fn sanitize(name: &str) -> String {
    let normalized: String = name.trim().nfc().collect();
    let flat = normalized.replace(|c: char| c == '/' || c == '\\', "_");
    if flat.is_empty() {
        "file".to_string()
    } else {
        flat
    }
}
