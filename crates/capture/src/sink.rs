//! Frame sink
//!
//! Writes completed frames to disk as `frame-<sequence>.jpg`. Runs on the
//! async side so file I/O never stalls the capture worker.

use anyhow::{Context, Result};
use protocol::CompletedFrame;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory that receives completed frames
#[derive(Debug, Clone)]
pub struct FrameSink {
    dir: PathBuf,
    written: u64,
}

impl FrameSink {
    /// Create the output directory if it does not exist yet
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create output directory: {}", dir.display()))?;
        Ok(Self { dir, written: 0 })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Frames written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn frame_path(&self, sequence: u64) -> PathBuf {
        self.dir.join(format!("frame-{:06}.jpg", sequence))
    }

    /// Write one frame and return where it went
    pub async fn write(&mut self, frame: &CompletedFrame) -> Result<PathBuf> {
        if frame.truncated {
            warn!(
                "Frame {} was truncated to {} bytes, writing it anyway",
                frame.sequence, frame.size
            );
        }

        let path = self.frame_path(frame.sequence);
        tokio::fs::write(&path, &frame.data)
            .await
            .with_context(|| format!("Failed to write frame: {}", path.display()))?;

        self.written += 1;
        debug!("Wrote {} bytes to {}", frame.size, path.display());
        Ok(path)
    }
}
