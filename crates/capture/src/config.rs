//! Capture configuration management

use crate::usb::{NegotiationPolicy, OverflowPolicy, ReassemblerConfig, SessionConfig};
use anyhow::{Context, Result, anyhow};
use protocol::{FrameMarker, MAX_MARKER_LEN, StreamFormat, UVC10_BLOCK_LEN, UVC11_BLOCK_LEN};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub capture: CaptureSettings,
    #[serde(default)]
    pub device: DeviceSettings,
    #[serde(default)]
    pub negotiation: NegotiationSettings,
    #[serde(default)]
    pub stream: StreamSettings,
}

/// Front-end behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureSettings {
    #[serde(default = "CaptureSettings::default_log_level")]
    pub log_level: String,
    /// Directory completed frames are written to (`~` is expanded)
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Sleep between worker iterations in milliseconds
    #[serde(default = "CaptureSettings::default_tick_interval")]
    pub tick_interval_ms: u64,
    /// Periodic status log interval in seconds (0 = disabled)
    #[serde(default = "CaptureSettings::default_status_interval")]
    pub status_interval_secs: u64,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
            output_dir: None,
            tick_interval_ms: Self::default_tick_interval(),
            status_interval_secs: Self::default_status_interval(),
        }
    }
}

impl CaptureSettings {
    fn default_log_level() -> String {
        "info".to_string()
    }

    fn default_tick_interval() -> u64 {
        1
    }

    fn default_status_interval() -> u64 {
        10
    }
}

/// Which camera to drive and how its streaming interface is laid out
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSettings {
    /// Vendor ID as a hex string (e.g., "0x046d")
    #[serde(default = "DeviceSettings::default_vendor_id")]
    pub vendor_id: String,
    /// Product ID as a hex string (e.g., "0x0825")
    #[serde(default = "DeviceSettings::default_product_id")]
    pub product_id: String,
    #[serde(default = "DeviceSettings::default_streaming_interface")]
    pub streaming_interface: u8,
    #[serde(default = "DeviceSettings::default_alternate_setting")]
    pub alternate_setting: u8,
    #[serde(default = "DeviceSettings::default_iso_endpoint")]
    pub iso_endpoint: u8,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            vendor_id: Self::default_vendor_id(),
            product_id: Self::default_product_id(),
            streaming_interface: Self::default_streaming_interface(),
            alternate_setting: Self::default_alternate_setting(),
            iso_endpoint: Self::default_iso_endpoint(),
        }
    }
}

impl DeviceSettings {
    fn default_vendor_id() -> String {
        "0x046d".to_string()
    }

    fn default_product_id() -> String {
        "0x0825".to_string()
    }

    fn default_streaming_interface() -> u8 {
        1
    }

    fn default_alternate_setting() -> u8 {
        6
    }

    fn default_iso_endpoint() -> u8 {
        0x81
    }
}

/// Values written during PROBE and COMMIT
///
/// These are requested as-is; the device's GET_MIN/GET_MAX answers are only
/// logged.
///
/// # Example Configuration
/// ```toml
/// [negotiation]
/// block_len = 26
/// max_restarts = 3
///
/// [negotiation.commit]
/// format_index = 2
/// frame_index = 1
/// frame_interval = 2000000  # 5 fps
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NegotiationSettings {
    /// Parameter block length: 26 (UVC 1.0) or 34 (UVC 1.1)
    #[serde(default = "NegotiationSettings::default_block_len")]
    pub block_len: usize,
    /// Ticks a request may stay outstanding (0 = wait forever)
    #[serde(default)]
    pub wait_timeout_ticks: u32,
    /// Negotiation restarts before giving up (0 = unlimited)
    #[serde(default = "NegotiationSettings::default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "NegotiationSettings::default_probe")]
    pub probe: StreamFormat,
    #[serde(default = "NegotiationSettings::default_commit")]
    pub commit: StreamFormat,
}

impl Default for NegotiationSettings {
    fn default() -> Self {
        Self {
            block_len: Self::default_block_len(),
            wait_timeout_ticks: 0,
            max_restarts: Self::default_max_restarts(),
            probe: Self::default_probe(),
            commit: Self::default_commit(),
        }
    }
}

impl NegotiationSettings {
    fn default_probe() -> StreamFormat {
        StreamFormat::PROBE_BASELINE
    }

    fn default_commit() -> StreamFormat {
        StreamFormat::COMMIT_TARGET
    }

    fn default_block_len() -> usize {
        UVC10_BLOCK_LEN
    }

    fn default_max_restarts() -> u32 {
        3
    }
}

/// Isochronous buffers and frame reassembly
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamSettings {
    #[serde(default = "StreamSettings::default_iso_buffer_count")]
    pub iso_buffer_count: usize,
    #[serde(default = "StreamSettings::default_iso_buffer_size")]
    pub iso_buffer_size: usize,
    /// Payload header bytes skipped at the start of every packet
    #[serde(default = "StreamSettings::default_header_len")]
    pub header_len: usize,
    /// Frame buffer size in bytes
    #[serde(default = "StreamSettings::default_frame_capacity")]
    pub frame_capacity: usize,
    /// Byte sequence that opens a frame
    #[serde(default)]
    pub marker: FrameMarker,
    #[serde(default)]
    pub overflow_policy: OverflowPolicy,
    /// Frames to capture before stopping (0 = unlimited)
    #[serde(default)]
    pub capture_limit: u64,
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            iso_buffer_count: Self::default_iso_buffer_count(),
            iso_buffer_size: Self::default_iso_buffer_size(),
            header_len: Self::default_header_len(),
            frame_capacity: Self::default_frame_capacity(),
            marker: FrameMarker::default(),
            overflow_policy: OverflowPolicy::default(),
            capture_limit: 0,
        }
    }
}

impl StreamSettings {
    fn default_iso_buffer_count() -> usize {
        2
    }

    fn default_iso_buffer_size() -> usize {
        1024
    }

    fn default_header_len() -> usize {
        12
    }

    fn default_frame_capacity() -> usize {
        40 * 1024
    }
}

impl CaptureConfig {
    /// Load configuration from the specified path
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = if let Some(p) = path {
            p
        } else {
            // Try standard locations in order
            let candidates = vec![
                Self::default_path(),
                PathBuf::from("/etc/uvc-capture/capture.toml"),
            ];

            candidates
                .into_iter()
                .find(|p| p.exists())
                .ok_or_else(|| anyhow!("No configuration file found, using defaults"))?
        };

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file: {}", config_path.display()))?;

        tracing::info!("Loaded configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CaptureConfig =
            toml::from_str(content).context("Failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration or return defaults if not found
    pub fn load_or_default() -> Self {
        match Self::load(None) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Failed to load config: {:#}, using defaults", e);
                Self::default()
            }
        }
    }

    /// Save configuration to the specified path
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::info!("Saved configuration to: {}", path.display());
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("uvc-capture").join("capture.toml")
        } else {
            PathBuf::from(".config/uvc-capture/capture.toml")
        }
    }

    /// Output directory with `~` and environment variables expanded
    pub fn output_dir(&self) -> Option<PathBuf> {
        self.capture
            .output_dir
            .as_deref()
            .map(|dir| PathBuf::from(shellexpand::tilde(dir).as_ref()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.capture.tick_interval_ms)
    }

    /// `None` when periodic status logging is disabled
    pub fn status_interval(&self) -> Option<Duration> {
        (self.capture.status_interval_secs > 0)
            .then(|| Duration::from_secs(self.capture.status_interval_secs))
    }

    /// Session parameters for the capture worker
    pub fn session_config(&self) -> Result<SessionConfig> {
        Ok(SessionConfig {
            vendor_id: parse_hex_id(&self.device.vendor_id, "vendor_id")?,
            product_id: parse_hex_id(&self.device.product_id, "product_id")?,
            iso_buffer_count: self.stream.iso_buffer_count,
            iso_buffer_size: self.stream.iso_buffer_size,
            negotiation: NegotiationPolicy {
                interface: self.device.streaming_interface,
                alternate_setting: self.device.alternate_setting,
                iso_endpoint: self.device.iso_endpoint,
                block_len: self.negotiation.block_len,
                probe: self.negotiation.probe,
                commit: self.negotiation.commit,
                wait_timeout_ticks: self.negotiation.wait_timeout_ticks,
                max_restarts: self.negotiation.max_restarts,
            },
            reassembler: ReassemblerConfig {
                marker: self.stream.marker.clone(),
                header_len: self.stream.header_len,
                capacity: self.stream.frame_capacity,
                overflow: self.stream.overflow_policy,
                capture_limit: self.stream.capture_limit,
            },
        })
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.capture.log_level.as_str()) {
            return Err(anyhow!(
                "Invalid log level '{}', must be one of: {}",
                self.capture.log_level,
                valid_levels.join(", ")
            ));
        }

        parse_hex_id(&self.device.vendor_id, "vendor_id")?;
        parse_hex_id(&self.device.product_id, "product_id")?;

        // IN direction bit set, endpoint number 1-15, no reserved bits
        if !(0x81..=0x8F).contains(&self.device.iso_endpoint) {
            return Err(anyhow!(
                "Invalid iso_endpoint {:#04x}, must be an IN endpoint (0x81-0x8f)",
                self.device.iso_endpoint
            ));
        }

        if self.negotiation.block_len != UVC10_BLOCK_LEN
            && self.negotiation.block_len != UVC11_BLOCK_LEN
        {
            return Err(anyhow!(
                "Invalid block_len {}, must be {} or {}",
                self.negotiation.block_len,
                UVC10_BLOCK_LEN,
                UVC11_BLOCK_LEN
            ));
        }
        self.negotiation
            .probe
            .validate()
            .context("Invalid [negotiation.probe]")?;
        self.negotiation
            .commit
            .validate()
            .context("Invalid [negotiation.commit]")?;

        if self.stream.iso_buffer_count == 0 || self.stream.iso_buffer_size == 0 {
            return Err(anyhow!(
                "iso_buffer_count and iso_buffer_size must be greater than 0"
            ));
        }
        if self.stream.marker.is_empty() || self.stream.marker.len() > MAX_MARKER_LEN {
            return Err(anyhow!("marker must be 1-{} bytes", MAX_MARKER_LEN));
        }
        if self.stream.frame_capacity == 0 {
            return Err(anyhow!("frame_capacity must be greater than 0"));
        }

        Ok(())
    }
}

/// Parse a hex ID such as "0x046d"
pub fn parse_hex_id(id: &str, name: &str) -> Result<u16> {
    let Some(hex_part) = id.strip_prefix("0x").or_else(|| id.strip_prefix("0X")) else {
        return Err(anyhow!(
            "Invalid {} '{}', must start with '0x' (e.g., '0x1234')",
            name,
            id
        ));
    };

    if hex_part.is_empty() || hex_part.len() > 4 {
        return Err(anyhow!(
            "Invalid {} '{}', hex part must be 1-4 digits",
            name,
            id
        ));
    }

    u16::from_str_radix(hex_part, 16)
        .map_err(|_| anyhow!("Invalid {} '{}', not a valid hex number", name, id))
}
