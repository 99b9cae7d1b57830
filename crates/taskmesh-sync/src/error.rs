//! Reconciliation error types.
//!
//! Every public API in this crate surfaces failures through [`SyncError`].

/// Unified error type for the taskmesh reconciliation codec.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// A wire batch or pair symbol failed JSON (de)serialization.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A serialized batch string contained characters outside the
    /// single-byte code page used for payload embedding.
    #[error("payload contains non-latin-1 character {codepoint:#x}")]
    NonLatin1 {
        /// The offending Unicode code point.
        codepoint: u32,
    },

    /// A hash accumulator field was not a valid 64-hex-digit string.
    #[error("malformed hash accumulator: {reason}")]
    MalformedChecksum { reason: String },

    /// A peeled symbol did not parse back into a single key/value pair.
    #[error("malformed pair symbol: {reason}")]
    MalformedSymbol { reason: String },
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, SyncError>;
