//! USB and stream type definitions
//!
//! This module defines the values passed between the host stack, the capture
//! session and the async front-end: device addresses, transfer completions,
//! error conditions, link state and completed frames.

use crate::error::{ProtocolError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::NonZeroU8;

/// Bus address assigned to an attached device
///
/// Address zero means "no device" on the wire; here that case is
/// `Option<DeviceAddress>::None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress(NonZeroU8);

impl DeviceAddress {
    /// Wrap a raw address, returning `None` for zero
    pub fn new(raw: u8) -> Option<Self> {
        NonZeroU8::new(raw).map(Self)
    }

    pub fn get(self) -> u8 {
        self.0.get()
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// USB error types
///
/// Maps to libusb error codes. See rusb::Error for details.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum UsbError {
    /// Transfer timed out
    Timeout,
    /// Endpoint stalled (protocol error)
    Pipe,
    /// Device was disconnected
    NoDevice,
    /// Device or endpoint not found
    NotFound,
    /// Device or transfer queue is busy; retry later
    Busy,
    /// Buffer overflow
    Overflow,
    /// I/O error
    Io,
    /// Invalid parameter
    InvalidParam,
    /// Access denied (permissions)
    Access,
    /// Other error with message
    Other { message: String },
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout => f.write_str("timeout"),
            Self::Pipe => f.write_str("endpoint stalled"),
            Self::NoDevice => f.write_str("no device"),
            Self::NotFound => f.write_str("not found"),
            Self::Busy => f.write_str("busy"),
            Self::Overflow => f.write_str("overflow"),
            Self::Io => f.write_str("I/O error"),
            Self::InvalidParam => f.write_str("invalid parameter"),
            Self::Access => f.write_str("access denied"),
            Self::Other { message } => f.write_str(message),
        }
    }
}

impl std::error::Error for UsbError {}

/// Outcome of a finished transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferStatus {
    Success,
    Failed(UsbError),
}

impl TransferStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Completion record returned by a transfer poll
///
/// `data` holds what the device returned for IN transfers and is empty for
/// OUT transfers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferCompletion {
    pub status: TransferStatus,
    pub byte_count: usize,
    pub data: Bytes,
}

impl TransferCompletion {
    /// Successful IN completion carrying `data`
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            status: TransferStatus::Success,
            byte_count: data.len(),
            data,
        }
    }

    /// Successful OUT completion of `byte_count` bytes
    pub fn sent(byte_count: usize) -> Self {
        Self {
            status: TransferStatus::Success,
            byte_count,
            data: Bytes::new(),
        }
    }

    /// Failed completion
    pub fn failed(error: UsbError) -> Self {
        Self {
            status: TransferStatus::Failed(error),
            byte_count: 0,
            data: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Coarse view of where the capture session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkState {
    /// No device attached
    Detached,
    /// Device attached, PROBE/COMMIT in progress
    Negotiating,
    /// Isochronous stream running
    Streaming,
    /// Negotiation gave up; waiting for detach
    Failed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => f.write_str("detached"),
            Self::Negotiating => f.write_str("negotiating"),
            Self::Streaming => f.write_str("streaming"),
            Self::Failed => f.write_str("failed"),
        }
    }
}

/// Longest frame marker accepted
pub const MAX_MARKER_LEN: usize = 8;

/// Byte sequence that opens every frame in the payload stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u8>", into = "Vec<u8>")]
pub struct FrameMarker(Vec<u8>);

impl FrameMarker {
    /// JPEG SOI followed by the APP0 marker
    pub const JPEG_SOI_APP0: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

    pub fn new(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() || bytes.len() > MAX_MARKER_LEN {
            return Err(ProtocolError::InvalidMarker {
                len: bytes.len(),
                max: MAX_MARKER_LEN,
            });
        }
        Ok(Self(bytes.to_vec()))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for FrameMarker {
    fn default() -> Self {
        Self(Self::JPEG_SOI_APP0.to_vec())
    }
}

impl TryFrom<Vec<u8>> for FrameMarker {
    type Error = ProtocolError;

    fn try_from(bytes: Vec<u8>) -> Result<Self> {
        Self::new(&bytes)
    }
}

impl From<FrameMarker> for Vec<u8> {
    fn from(marker: FrameMarker) -> Self {
        marker.0
    }
}

/// A frame bracketed by two markers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedFrame {
    /// 1-based sequence number since the last reassembler reset
    pub sequence: u64,
    /// Payload bytes accumulated (headers skipped, marker included)
    pub size: usize,
    /// Raw stream bytes between the two markers, headers included
    pub raw_span: u64,
    /// Frame exceeded the buffer capacity and was cut short
    pub truncated: bool,
    /// Frame payload
    pub data: Bytes,
}

/// Reassembler counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStats {
    /// Every isochronous byte received, headers included
    pub total_bytes: u64,
    /// Markers observed
    pub markers_seen: u64,
    /// Frames delivered
    pub frames_completed: u64,
    /// Frames discarded on overflow
    pub frames_dropped: u64,
    /// Frames delivered truncated
    pub frames_truncated: u64,
    /// Offset of the most recent marker within its chunk
    pub last_boundary_offset: Option<usize>,
    /// Size of the most recently completed frame
    pub last_frame_size: Option<usize>,
}
