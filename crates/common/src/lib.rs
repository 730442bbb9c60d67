//! Common utilities for rust-uvc-capture
//!
//! This crate provides shared functionality for the capture front-end and the
//! capture worker thread: error handling, logging setup, the async channel
//! bridge between the two, and helpers for building synthetic isochronous
//! payloads in tests.

pub mod channel;
pub mod error;
pub mod logging;
pub mod test_utils;

pub use channel::{
    CaptureBridge, CaptureCommand, CaptureEvent, CaptureStatus, CaptureWorker,
    create_capture_bridge,
};
pub use error::{Error, Result};
pub use logging::setup_logging;
