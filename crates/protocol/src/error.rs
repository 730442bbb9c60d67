//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    /// Parameter block length outside the supported range
    #[error("Invalid parameter block length: {len} (expected {min}..={max})")]
    InvalidBlockLength { len: usize, min: usize, max: usize },

    /// Buffer too small for operation
    #[error("Buffer too small: needed {needed}, got {available}")]
    BufferTooSmall { needed: usize, available: usize },

    /// Frame marker is empty or too long
    #[error("Invalid frame marker length: {len} (expected 1..={max})")]
    InvalidMarker { len: usize, max: usize },

    /// Stream format index out of range (indices are 1-based)
    #[error("Invalid {field}: {value}")]
    InvalidFormat { field: &'static str, value: u32 },
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
