//! Frame reassembler
//!
//! Turns the isochronous payload stream into whole frames. Frames carry no
//! length prefix; a marker sequence (JPEG SOI + APP0 by default) opens every
//! frame, so a frame is complete only once the *next* marker shows up.
//! Bytes seen before the first marker are discarded.
//!
//! Each chunk starts with a fixed-size payload header. The marker scan covers
//! the whole chunk, but only bytes past the header are accumulated.

use bytes::Bytes;
use protocol::{CompletedFrame, FrameMarker, StreamStats};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// What to do with a frame that outgrew the buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Keep what fits and deliver the frame flagged as truncated
    #[default]
    Truncate,
    /// Discard the frame
    Drop,
}

/// Reassembler parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReassemblerConfig {
    pub marker: FrameMarker,
    /// Leading bytes of each chunk that are never accumulated
    pub header_len: usize,
    /// Frame buffer size in bytes
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Frames to deliver before going quiet (0 = unlimited)
    pub capture_limit: u64,
}

impl Default for ReassemblerConfig {
    fn default() -> Self {
        Self {
            marker: FrameMarker::default(),
            header_len: 12,
            capacity: 40 * 1024,
            overflow: OverflowPolicy::Truncate,
            capture_limit: 0,
        }
    }
}

/// Marker-delimited frame reassembler
pub struct FrameReassembler {
    config: ReassemblerConfig,
    /// Fixed-capacity frame buffer; only `fill` bytes are meaningful
    buffer: Vec<u8>,
    fill: usize,
    /// A marker has been seen and a frame is being accumulated
    synced: bool,
    /// Current frame lost bytes to the capacity limit
    overflowed: bool,
    /// Stream offset of the marker that opened the current frame
    frame_start: u64,
    stats: StreamStats,
}

impl FrameReassembler {
    pub fn new(config: ReassemblerConfig) -> Self {
        let buffer = vec![0u8; config.capacity];
        Self {
            config,
            buffer,
            fill: 0,
            synced: false,
            overflowed: false,
            frame_start: 0,
            stats: StreamStats::default(),
        }
    }

    pub fn config(&self) -> &ReassemblerConfig {
        &self.config
    }

    pub fn stats(&self) -> StreamStats {
        self.stats
    }

    /// Bytes accumulated for the frame in progress
    pub fn pending_len(&self) -> usize {
        self.fill
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    /// True once `capture_limit` frames have been delivered
    pub fn is_complete(&self) -> bool {
        self.config.capture_limit != 0 && self.stats.frames_completed >= self.config.capture_limit
    }

    /// Zero the buffer and every counter
    pub fn reset(&mut self) {
        self.buffer.fill(0);
        self.fill = 0;
        self.synced = false;
        self.overflowed = false;
        self.frame_start = 0;
        self.stats = StreamStats::default();
    }

    /// Consume one isochronous chunk, returning the frames it completed
    pub fn push(&mut self, chunk: &[u8]) -> Vec<CompletedFrame> {
        let base = self.stats.total_bytes;
        self.stats.total_bytes += chunk.len() as u64;

        let mut frames = Vec::new();
        if self.is_complete() {
            return frames;
        }

        // Shorter chunks are all header
        let mut cursor = self.config.header_len.min(chunk.len());

        let mut search = 0;
        while let Some(k) = self.find_marker(chunk, search) {
            if self.synced {
                if k > cursor {
                    self.append(&chunk[cursor..k]);
                }
                if let Some(frame) = self.finish_frame(base + k as u64) {
                    frames.push(frame);
                }
                if self.is_complete() {
                    self.synced = false;
                    return frames;
                }
            }
            self.start_frame(base + k as u64, k);
            cursor = k;
            search = k + self.config.marker.len();
        }

        if self.synced && cursor < chunk.len() {
            self.append(&chunk[cursor..]);
        }

        frames
    }

    fn find_marker(&self, chunk: &[u8], from: usize) -> Option<usize> {
        let marker = self.config.marker.as_bytes();
        if marker.is_empty() || chunk.len() < from + marker.len() {
            return None;
        }
        chunk[from..]
            .windows(marker.len())
            .position(|window| window == marker)
            .map(|p| p + from)
    }

    fn start_frame(&mut self, stream_offset: u64, chunk_offset: usize) {
        if !self.synced {
            debug!("Frame marker found at offset {}, synchronised", chunk_offset);
        }
        self.synced = true;
        self.fill = 0;
        self.overflowed = false;
        self.frame_start = stream_offset;
        self.stats.markers_seen += 1;
        self.stats.last_boundary_offset = Some(chunk_offset);
    }

    fn append(&mut self, data: &[u8]) {
        let room = self.config.capacity - self.fill;
        let take = data.len().min(room);
        self.buffer[self.fill..self.fill + take].copy_from_slice(&data[..take]);
        self.fill += take;

        if take < data.len() && !self.overflowed {
            self.overflowed = true;
            warn!(
                "Frame exceeds buffer capacity of {} bytes ({:?})",
                self.config.capacity, self.config.overflow
            );
        }
    }

    fn finish_frame(&mut self, stream_offset: u64) -> Option<CompletedFrame> {
        let size = self.fill;
        let raw_span = stream_offset - self.frame_start;

        if self.overflowed && self.config.overflow == OverflowPolicy::Drop {
            self.stats.frames_dropped += 1;
            debug!("Dropped oversized frame spanning {} bytes", raw_span);
            return None;
        }
        if self.overflowed {
            self.stats.frames_truncated += 1;
        }

        self.stats.frames_completed += 1;
        self.stats.last_frame_size = Some(size);
        info!(
            "Frame {} complete: {} bytes{}",
            self.stats.frames_completed,
            size,
            if self.overflowed { " (truncated)" } else { "" }
        );

        Some(CompletedFrame {
            sequence: self.stats.frames_completed,
            size,
            raw_span,
            truncated: self.overflowed,
            data: Bytes::copy_from_slice(&self.buffer[..size]),
        })
    }
}
