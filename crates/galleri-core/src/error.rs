//! Typed errors for the intake pipeline and the gallery view model.
//!
//! Gateway calls return `anyhow::Result`; their failures are flattened
//! into messages here so the domain errors stay `Clone` and can be kept
//! in reports and view state.

use std::fmt;

/// Step of a single file's intake chain that can fail. Date resolution
/// always falls back to a date, so it has no step here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntakeStep {
    Name,
    Convert,
    Store,
    Register,
}

impl fmt::Display for IntakeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntakeStep::Name => "name",
            IntakeStep::Convert => "convert",
            IntakeStep::Store => "store",
            IntakeStep::Register => "register",
        };
        f.write_str(s)
    }
}

/// Session-level failure. While it persists, intake and page fetches are
/// refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("not signed in: sign in before uploading or browsing")]
    NotSignedIn,

    #[error("anonymous sign-in failed: {0}")]
    SignInFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IntakeErrorKind {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("storage failed: {0}")]
    Storage(String),

    /// The object was written but its record was not; the stored object is
    /// orphaned.
    #[error("metadata registration failed, '{orphaned_key}' is orphaned: {reason}")]
    Metadata { orphaned_key: String, reason: String },

    #[error("name '{0}' is already taken")]
    NameCollision(String),

    #[error("same content as '{0}' earlier in this batch")]
    DuplicateContent(String),

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Per-file failure, tagged with the file and the step it failed in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{file}: {step} step: {kind}")]
pub struct IntakeError {
    pub file: String,
    pub step: IntakeStep,
    pub kind: IntakeErrorKind,
}

impl IntakeError {
    pub fn new(file: impl Into<String>, step: IntakeStep, kind: IntakeErrorKind) -> Self {
        Self {
            file: file.into(),
            step,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GalleryError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error("listing failed: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = IntakeError::new(
            "IMG_2.heic",
            IntakeStep::Convert,
            IntakeErrorKind::Decode("bad header".to_string()),
        );
        assert_eq!(err.to_string(), "IMG_2.heic: convert step: decode failed: bad header");

        let err: GalleryError = AuthError::NotSignedIn.into();
        assert_eq!(err.to_string(), "not signed in: sign in before uploading or browsing");
    }
}
