//! UVC capture library
//!
//! Drives a USB video-class camera through PROBE/COMMIT negotiation, selects
//! the streaming alternate setting and reassembles JPEG frames from the
//! isochronous payload stream.
//!
//! The host stack sits behind [`usb::HostStack`]: [`usb::RusbHost`] talks to
//! real hardware through libusb and [`usb::ScriptedHost`] is an in-memory
//! camera for tests and `--simulate`.

pub mod config;
pub mod sink;
pub mod usb;

pub use config::CaptureConfig;
pub use sink::FrameSink;
pub use usb::{CaptureSession, SessionConfig, spawn_capture_worker};
