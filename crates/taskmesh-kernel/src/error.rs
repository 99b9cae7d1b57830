//! Kernel error types.
//!
//! All kernel subsystems surface errors through [`KernelError`], the
//! single error type returned by every public API in this crate.

/// Unified error type for the taskmesh kernel.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    // -- Bus errors ---------------------------------------------------------
    /// The bus URL could not be parsed or names an unsupported scheme.
    #[error("invalid bus url `{url}`: {reason}")]
    InvalidBusUrl { url: String, reason: String },

    /// The bus connection has been closed; no further publishes or
    /// subscribes are accepted.
    #[error("bus connection is closed")]
    BusClosed,

    /// A publish could not be delivered.
    #[error("publish to `{subject}` failed: {reason}")]
    PublishFailed { subject: String, reason: String },

    // -- Envelope errors ----------------------------------------------------
    /// A message body was not a valid envelope.
    #[error("malformed envelope: {reason}")]
    MalformedEnvelope { reason: String },

    /// The envelope header named a type this kernel does not know.
    #[error("unknown message type `{kind}`")]
    UnknownMessageType { kind: String },
}

/// Convenience alias used throughout the kernel crate.
pub type Result<T> = std::result::Result<T, KernelError>;
