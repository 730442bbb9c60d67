//! Probe/commit parameter block
//!
//! The payload exchanged by GET/SET requests on VS_PROBE_CONTROL and
//! VS_COMMIT_CONTROL. UVC 1.0 devices use 26 bytes, UVC 1.1 devices 34.
//!
//! ```text
//! offset  size  field
//!      0     2  bmHint
//!      2     1  bFormatIndex
//!      3     1  bFrameIndex
//!      4     4  dwFrameInterval        (100 ns units)
//!      8     2  wKeyFrameRate
//!     10     2  wPFrameRate
//!     12     2  wCompQuality
//!     14     2  wCompWindowSize
//!     16     2  wDelay
//!     18     4  dwMaxVideoFrameSize
//!     22     4  dwMaxPayloadTransferSize
//!     26     4  dwClockFrequency        (1.1 only)
//!     30     1  bmFramingInfo           (1.1 only)
//!     31     1  bPreferedVersion        (1.1 only)
//!     32     1  bMinVersion             (1.1 only)
//!     33     1  bMaxVersion             (1.1 only)
//! ```

use crate::error::{ProtocolError, Result};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Parameter block length for UVC 1.0 devices
pub const UVC10_BLOCK_LEN: usize = 26;
/// Parameter block length for UVC 1.1 devices
pub const UVC11_BLOCK_LEN: usize = 34;

const HINT: usize = 0;
const FORMAT_INDEX: usize = 2;
const FRAME_INDEX: usize = 3;
const FRAME_INTERVAL: usize = 4;
const COMP_QUALITY: usize = 12;
const MAX_VIDEO_FRAME_SIZE: usize = 18;
const MAX_PAYLOAD_TRANSFER_SIZE: usize = 22;

/// Format/frame/interval triple requested during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFormat {
    /// bFormatIndex (1-based)
    pub format_index: u8,
    /// bFrameIndex (1-based)
    pub frame_index: u8,
    /// dwFrameInterval in 100 ns units (333333 = 30 fps)
    pub frame_interval: u32,
}

impl StreamFormat {
    /// Low-resolution baseline proposed during PROBE
    pub const PROBE_BASELINE: Self = Self {
        format_index: 2,
        frame_index: 1,
        frame_interval: 333_333,
    };

    /// Target committed after PROBE (640x480, 5 fps on the reference camera)
    pub const COMMIT_TARGET: Self = Self {
        format_index: 2,
        frame_index: 1,
        frame_interval: 2_000_000,
    };

    /// Check indices are non-zero and the interval is set
    pub fn validate(&self) -> Result<()> {
        if self.format_index == 0 {
            return Err(ProtocolError::InvalidFormat {
                field: "format_index",
                value: 0,
            });
        }
        if self.frame_index == 0 {
            return Err(ProtocolError::InvalidFormat {
                field: "frame_index",
                value: 0,
            });
        }
        if self.frame_interval == 0 {
            return Err(ProtocolError::InvalidFormat {
                field: "frame_interval",
                value: 0,
            });
        }
        Ok(())
    }

    /// Frames per second implied by the interval
    pub fn frames_per_second(&self) -> f64 {
        if self.frame_interval == 0 {
            return 0.0;
        }
        10_000_000.0 / f64::from(self.frame_interval)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "format={} frame={} interval={} ({:.1} fps)",
            self.format_index,
            self.frame_index,
            self.frame_interval,
            self.frames_per_second()
        )
    }
}

/// Fixed-capacity probe/commit parameter block
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ParameterBlock {
    bytes: [u8; UVC11_BLOCK_LEN],
    len: usize,
}

impl ParameterBlock {
    /// Create a zeroed block of `len` bytes (26 or anything up to 34)
    pub fn new(len: usize) -> Result<Self> {
        if !(UVC10_BLOCK_LEN..=UVC11_BLOCK_LEN).contains(&len) {
            return Err(ProtocolError::InvalidBlockLength {
                len,
                min: UVC10_BLOCK_LEN,
                max: UVC11_BLOCK_LEN,
            });
        }
        Ok(Self {
            bytes: [0; UVC11_BLOCK_LEN],
            len,
        })
    }

    /// Build a block from a device response
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut block = Self::new(data.len().clamp(UVC10_BLOCK_LEN, UVC11_BLOCK_LEN))?;
        block.copy_from(data)?;
        Ok(block)
    }

    /// Active length in bytes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Overwrite the block in place with a device response
    ///
    /// Short responses leave the tail untouched; responses longer than the
    /// block are rejected.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.len {
            return Err(ProtocolError::BufferTooSmall {
                needed: data.len(),
                available: self.len,
            });
        }
        self.bytes[..data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Copy as much of `data` as fits, returning the number of bytes kept
    pub fn copy_prefix(&mut self, data: &[u8]) -> usize {
        let len = data.len().min(self.len);
        self.bytes[..len].copy_from_slice(&data[..len]);
        len
    }

    /// Zero every byte
    pub fn clear(&mut self) {
        self.bytes = [0; UVC11_BLOCK_LEN];
    }

    /// Zero the block then write the requested format triple
    pub fn apply(&mut self, format: &StreamFormat) {
        self.clear();
        self.bytes[FORMAT_INDEX] = format.format_index;
        self.bytes[FRAME_INDEX] = format.frame_index;
        LittleEndian::write_u32(
            &mut self.bytes[FRAME_INTERVAL..FRAME_INTERVAL + 4],
            format.frame_interval,
        );
    }

    pub fn hint(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[HINT..HINT + 2])
    }

    pub fn format_index(&self) -> u8 {
        self.bytes[FORMAT_INDEX]
    }

    pub fn frame_index(&self) -> u8 {
        self.bytes[FRAME_INDEX]
    }

    pub fn frame_interval(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[FRAME_INTERVAL..FRAME_INTERVAL + 4])
    }

    pub fn comp_quality(&self) -> u16 {
        LittleEndian::read_u16(&self.bytes[COMP_QUALITY..COMP_QUALITY + 2])
    }

    pub fn max_video_frame_size(&self) -> u32 {
        LittleEndian::read_u32(&self.bytes[MAX_VIDEO_FRAME_SIZE..MAX_VIDEO_FRAME_SIZE + 4])
    }

    pub fn max_payload_transfer_size(&self) -> u32 {
        LittleEndian::read_u32(
            &self.bytes[MAX_PAYLOAD_TRANSFER_SIZE..MAX_PAYLOAD_TRANSFER_SIZE + 4],
        )
    }

    /// The format triple currently held by the block
    pub fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            format_index: self.format_index(),
            frame_index: self.frame_index(),
            frame_interval: self.frame_interval(),
        }
    }
}

impl fmt::Debug for ParameterBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParameterBlock")
            .field("len", &self.len)
            .field("format_index", &self.format_index())
            .field("frame_index", &self.frame_index())
            .field("frame_interval", &self.frame_interval())
            .field("max_video_frame_size", &self.max_video_frame_size())
            .field("max_payload_transfer_size", &self.max_payload_transfer_size())
            .finish()
    }
}

impl fmt::Display for ParameterBlock {
    /// Hex dump, one space between bytes
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.as_bytes().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", byte)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_prefix_keeps_what_fits() {
        let mut block = ParameterBlock::new(UVC10_BLOCK_LEN).unwrap();
        assert_eq!(block.copy_prefix(&[0xAB; 40]), UVC10_BLOCK_LEN);
        assert!(block.as_bytes().iter().all(|&b| b == 0xAB));

        block.clear();
        assert_eq!(block.copy_prefix(&[1, 2]), 2);
        assert_eq!(&block.as_bytes()[..3], &[1, 2, 0]);
    }

    #[test]
    fn test_block_length_bounds() {
        assert!(ParameterBlock::new(26).is_ok());
        assert!(ParameterBlock::new(34).is_ok());
        assert!(ParameterBlock::new(25).is_err());
        assert!(ParameterBlock::new(35).is_err());
    }

    #[test]
    fn test_apply_writes_policy_bytes() {
        let mut block = ParameterBlock::new(UVC10_BLOCK_LEN).unwrap();
        block.copy_from(&[0xAA; 26]).unwrap();
        block.apply(&StreamFormat::PROBE_BASELINE);

        let bytes = block.as_bytes();
        assert_eq!(&bytes[..8], &[0x00, 0x00, 0x02, 0x01, 0x15, 0x16, 0x05, 0x00]);
        assert!(bytes[8..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_commit_target_interval_encoding() {
        let mut block = ParameterBlock::new(UVC10_BLOCK_LEN).unwrap();
        block.apply(&StreamFormat::COMMIT_TARGET);
        assert_eq!(&block.as_bytes()[4..8], &[0x80, 0x84, 0x1E, 0x00]);
        assert_eq!(block.stream_format(), StreamFormat::COMMIT_TARGET);
    }

    #[test]
    fn test_copy_from_rejects_oversized_response() {
        let mut block = ParameterBlock::new(UVC10_BLOCK_LEN).unwrap();
        assert!(block.copy_from(&[0u8; 34]).is_err());
        assert!(block.copy_from(&[1u8; 10]).is_ok());
        assert_eq!(block.hint(), 0x0101);
    }

    #[test]
    fn test_device_limits_decoding() {
        let mut raw = [0u8; 26];
        raw[18..22].copy_from_slice(&40_960u32.to_le_bytes());
        raw[22..26].copy_from_slice(&1_024u32.to_le_bytes());
        let block = ParameterBlock::from_bytes(&raw).unwrap();
        assert_eq!(block.max_video_frame_size(), 40_960);
        assert_eq!(block.max_payload_transfer_size(), 1_024);
    }

    #[test]
    fn test_stream_format_validation() {
        assert!(StreamFormat::PROBE_BASELINE.validate().is_ok());
        let bad = StreamFormat {
            format_index: 0,
            ..StreamFormat::PROBE_BASELINE
        };
        assert!(bad.validate().is_err());
        assert!((StreamFormat::PROBE_BASELINE.frames_per_second() - 30.0).abs() < 0.01);
    }

    #[test]
    fn test_display_hex_dump() {
        let mut block = ParameterBlock::new(UVC10_BLOCK_LEN).unwrap();
        block.apply(&StreamFormat::PROBE_BASELINE);
        assert!(block.to_string().starts_with("00 00 02 01 15 16 05 00"));
    }
}
