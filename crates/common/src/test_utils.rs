//! Test utilities for rust-uvc-capture
//!
//! Builders for synthetic isochronous payloads and an async timeout helper.
//! The scripted camera behind `uvc-capture --simulate` uses the same builders.
//!
//! # Example
//!
//! ```
//! use common::test_utils::{UVC_HEADER_LEN, packetize_frames, synthetic_jpeg};
//!
//! let frame = synthetic_jpeg(100, 0);
//! let packets = packetize_frames(&[frame], 64);
//! assert_eq!(packets.len(), 2);
//! assert_eq!(packets[0].len(), UVC_HEADER_LEN + 64);
//! ```

use std::future::Future;
use std::time::Duration;

/// Default test timeout (5 seconds)
pub const DEFAULT_TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Payload header length used by the reference camera
pub const UVC_HEADER_LEN: usize = 12;

/// JPEG SOI + APP0, the default frame marker
pub const JPEG_MARKER: [u8; 4] = [0xFF, 0xD8, 0xFF, 0xE0];

/// Build a 12-byte payload header
///
/// bHeaderLength, bmHeaderInfo (EOH | PTS | SCR | EOF | FID), then zeroed
/// presentation time and source clock fields.
pub fn payload_header(frame_id: bool, end_of_frame: bool) -> [u8; UVC_HEADER_LEN] {
    let mut header = [0u8; UVC_HEADER_LEN];
    header[0] = UVC_HEADER_LEN as u8;
    header[1] = 0x80 | 0x08 | 0x04 | (u8::from(end_of_frame) << 1) | u8::from(frame_id);
    header
}

/// Prefix `body` with a payload header
pub fn isoc_packet(body: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(UVC_HEADER_LEN + body.len());
    packet.extend_from_slice(&payload_header(false, false));
    packet.extend_from_slice(body);
    packet
}

/// Synthetic JPEG image of exactly `len` bytes
///
/// Starts with the SOI/APP0 marker and ends with EOI. Filler bytes never take
/// the value 0xFF so no spurious marker can appear inside the image. `len`
/// below 6 still yields the 6-byte marker + EOI skeleton.
pub fn synthetic_jpeg(len: usize, seed: u8) -> Vec<u8> {
    let len = len.max(JPEG_MARKER.len() + 2);
    let mut image = Vec::with_capacity(len);
    image.extend_from_slice(&JPEG_MARKER);
    let filler = len - JPEG_MARKER.len() - 2;
    image.extend((0..filler).map(|i| (seed as usize + i) as u8 % 0xFE));
    image.extend_from_slice(&[0xFF, 0xD9]);
    image
}

/// Split each frame into header-prefixed packets of at most `payload_len`
/// payload bytes
///
/// Every frame starts in a fresh packet, as cameras do at frame boundaries,
/// so a marker is never split across packets. The frame-id bit toggles per
/// frame and the last packet of each frame carries the end-of-frame bit.
pub fn packetize_frames(frames: &[Vec<u8>], payload_len: usize) -> Vec<Vec<u8>> {
    let payload_len = payload_len.max(1);
    let mut packets = Vec::new();

    for (n, frame) in frames.iter().enumerate() {
        let frame_id = n % 2 == 1;
        let chunks: Vec<&[u8]> = frame.chunks(payload_len).collect();
        let last = chunks.len().saturating_sub(1);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let mut packet = Vec::with_capacity(UVC_HEADER_LEN + chunk.len());
            packet.extend_from_slice(&payload_header(frame_id, i == last));
            packet.extend_from_slice(chunk);
            packets.push(packet);
        }
    }

    packets
}

/// Timeout wrapper for async tests
///
/// Wraps an async operation with a timeout to prevent tests from hanging.
pub async fn with_timeout<T, F>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { duration })
}

/// Error returned when a test times out
#[derive(Debug)]
pub struct TimeoutError {
    /// The timeout duration that was exceeded
    pub duration: Duration,
}

impl std::fmt::Display for TimeoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Test timed out after {:?}", self.duration)
    }
}

impl std::error::Error for TimeoutError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_jpeg_shape() {
        let image = synthetic_jpeg(64, 7);
        assert_eq!(image.len(), 64);
        assert_eq!(&image[..4], &JPEG_MARKER);
        assert_eq!(&image[62..], &[0xFF, 0xD9]);
        assert!(image[4..62].iter().all(|&b| b != 0xFF));
    }

    #[test]
    fn test_packetize_frames_boundaries() {
        let frames = vec![synthetic_jpeg(100, 0), synthetic_jpeg(30, 1)];
        let packets = packetize_frames(&frames, 40);

        // 100 bytes -> 40 + 40 + 20, 30 bytes -> 30
        assert_eq!(packets.len(), 4);
        assert_eq!(&packets[0][UVC_HEADER_LEN..UVC_HEADER_LEN + 4], &JPEG_MARKER);
        assert_eq!(&packets[3][UVC_HEADER_LEN..UVC_HEADER_LEN + 4], &JPEG_MARKER);
        // EOF bit on the last packet of each frame
        assert_eq!(packets[2][1] & 0x02, 0x02);
        assert_eq!(packets[1][1] & 0x02, 0x00);
        // FID toggles between frames
        assert_eq!(packets[0][1] & 0x01, 0);
        assert_eq!(packets[3][1] & 0x01, 1);
    }

    #[tokio::test]
    async fn test_with_timeout_expires() {
        let result = with_timeout(Duration::from_millis(10), std::future::pending::<()>()).await;
        assert!(result.is_err());
    }
}
