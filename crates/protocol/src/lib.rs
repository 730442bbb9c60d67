//! Protocol library for rust-uvc-capture
//!
//! This crate defines the video-class control vocabulary used to negotiate a
//! stream with a camera: request codes, control selectors, setup packets and
//! the probe/commit parameter block. It also carries the plain value types
//! shared by the host stack, the capture session and the front-end.
//!
//! # Example
//!
//! ```
//! use protocol::{ControlSelector, ParameterBlock, RequestCode, SetupPacket, StreamFormat};
//!
//! let mut block = ParameterBlock::new(26).unwrap();
//! block.apply(&StreamFormat::PROBE_BASELINE);
//!
//! let setup = SetupPacket::class_interface(
//!     RequestCode::SetCur,
//!     ControlSelector::Probe,
//!     1,
//!     block.len() as u16,
//! );
//! assert_eq!(setup.request_type, 0x21);
//! assert_eq!(setup.value, 0x0100);
//! ```

pub mod error;
pub mod probe;
pub mod requests;
pub mod types;

pub use error::{ProtocolError, Result};
pub use probe::{ParameterBlock, StreamFormat, UVC10_BLOCK_LEN, UVC11_BLOCK_LEN};
pub use requests::{ControlSelector, Direction, RequestCode, SetupPacket};
pub use types::{
    CompletedFrame, DeviceAddress, FrameMarker, LinkState, MAX_MARKER_LEN, StreamStats,
    TransferCompletion, TransferStatus, UsbError,
};
