//! Error kinds surfaced by the marshalling core.
//!
//! Four failure classes cross the public API boundary. Everything that can
//! fail during connection assembly (endpoint creation, configuration
//! parsing) uses `anyhow::Result` instead; the typed variants below are
//! reserved for the call path, where the caller needs to tell a stale proxy
//! apart from a transport fault or a forged identifier.

use thiserror::Error;

/// Errors raised on the marshalling call path.
#[derive(Debug, Error)]
pub enum ComError {
    /// A proxy or stub was invoked before it was bound to a connector or a
    /// local object, or its connector has already been released.
    #[error("marshall object is not initialized")]
    NotInitialized,

    /// The transport rejected a send or the frame sequence was inconsistent.
    #[error("marshalling failed: {0}")]
    Marshalling(String),

    /// An inbound frame referenced a stub index out of range or a stub whose
    /// control value did not match. Indicates a forged or stale identifier.
    #[error("marshall identifier failed the integrity check")]
    Integrity,

    /// The waiter observed cancellation through disconnect, shutdown, or an
    /// explicit timeout.
    #[error("call was cancelled before a response arrived")]
    Cancelled,
}

/// Result alias used throughout the call path.
pub type ComResult<T> = Result<T, ComError>;
