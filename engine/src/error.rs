//! Error types for the Tidemark engine.

use crate::RecordKey;
use thiserror::Error;

/// All possible errors from the Tidemark engine.
///
/// The decision functions themselves never fail. These errors describe inputs
/// that a caller must reject before handing them to a strategy.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Metadata errors
    #[error("malformed log info for '{key}': {reason}")]
    MalformedLogInfo { key: RecordKey, reason: String },

    #[error("malformed row '{key}': {reason}")]
    MalformedRow { key: RecordKey, reason: String },

    #[error("unknown bits {bits:#x} in {field}")]
    InvalidFlags { field: &'static str, bits: u64 },

    // Planning errors
    #[error("candidate '{0}' has neither a local nor a remote row")]
    EmptyCandidate(RecordKey),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::MalformedLogInfo {
            key: "k1".into(),
            reason: "empty record identity".into(),
        };
        assert_eq!(
            err.to_string(),
            "malformed log info for 'k1': empty record identity"
        );

        let err = Error::InvalidFlags {
            field: "flags",
            bits: 0x1000,
        };
        assert_eq!(err.to_string(), "unknown bits 0x1000 in flags");

        let err = Error::EmptyCandidate("k2".into());
        assert_eq!(
            err.to_string(),
            "candidate 'k2' has neither a local nor a remote row"
        );
    }
}
