//! Integration tests for configuration parsing
//!
//! Tests capture configuration parsing, including:
//! - Minimal and full documents
//! - Defaults for omitted sections
//! - Save/load round-trip through a file
//! - Invalid configuration handling

use capture::config::CaptureConfig;
use capture::usb::OverflowPolicy;
use protocol::StreamFormat;
use std::time::Duration;

const FULL_CONFIG: &str = r#"
[capture]
log_level = "debug"
output_dir = "/tmp/frames"
tick_interval_ms = 2
status_interval_secs = 0

[device]
vendor_id = "0x1234"
product_id = "0xABCD"
streaming_interface = 2
alternate_setting = 3
iso_endpoint = 0x82

[negotiation]
block_len = 34
wait_timeout_ticks = 500
max_restarts = 0

[negotiation.probe]
format_index = 1
frame_index = 2
frame_interval = 666666

[negotiation.commit]
format_index = 1
frame_index = 3
frame_interval = 1000000

[stream]
iso_buffer_count = 4
iso_buffer_size = 3072
header_len = 2
frame_capacity = 65536
marker = [0xFF, 0xD8]
overflow_policy = "drop"
capture_limit = 10
"#;

mod parsing {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = CaptureConfig::from_toml("").unwrap();
        assert_eq!(config.capture.log_level, "info");
        assert_eq!(config.capture.tick_interval_ms, 1);
        assert_eq!(config.device.vendor_id, "0x046d");
        assert_eq!(config.device.iso_endpoint, 0x81);
        assert_eq!(config.negotiation.probe, StreamFormat::PROBE_BASELINE);
        assert_eq!(config.negotiation.max_restarts, 3);
        assert_eq!(config.stream.marker.as_bytes(), &[0xFF, 0xD8, 0xFF, 0xE0]);
        assert_eq!(config.stream.overflow_policy, OverflowPolicy::Truncate);
    }

    #[test]
    fn test_partial_section_fills_in_defaults() {
        let config = CaptureConfig::from_toml(
            r#"
[device]
alternate_setting = 5
"#,
        )
        .unwrap();
        assert_eq!(config.device.alternate_setting, 5);
        assert_eq!(config.device.streaming_interface, 1);
        assert_eq!(config.device.product_id, "0x0825");
    }

    #[test]
    fn test_full_config() {
        let config = CaptureConfig::from_toml(FULL_CONFIG).unwrap();

        assert_eq!(config.capture.log_level, "debug");
        assert_eq!(config.output_dir(), Some("/tmp/frames".into()));
        assert_eq!(config.tick_interval(), Duration::from_millis(2));
        assert_eq!(config.status_interval(), None);

        let session = config.session_config().unwrap();
        assert_eq!(session.vendor_id, 0x1234);
        assert_eq!(session.product_id, 0xABCD);
        assert_eq!(session.iso_buffer_count, 4);
        assert_eq!(session.iso_buffer_size, 3072);
        assert_eq!(session.negotiation.interface, 2);
        assert_eq!(session.negotiation.alternate_setting, 3);
        assert_eq!(session.negotiation.iso_endpoint, 0x82);
        assert_eq!(session.negotiation.block_len, 34);
        assert_eq!(session.negotiation.wait_timeout_ticks, 500);
        assert_eq!(session.negotiation.max_restarts, 0);
        assert_eq!(session.negotiation.commit.frame_index, 3);
        assert_eq!(session.negotiation.probe.frame_interval, 666_666);
        assert_eq!(session.reassembler.header_len, 2);
        assert_eq!(session.reassembler.capacity, 65536);
        assert_eq!(session.reassembler.marker.as_bytes(), &[0xFF, 0xD8]);
        assert_eq!(session.reassembler.overflow, OverflowPolicy::Drop);
        assert_eq!(session.reassembler.capture_limit, 10);
    }

    #[test]
    fn test_tilde_output_dir_is_expanded() {
        let config = CaptureConfig::from_toml(
            r#"
[capture]
output_dir = "~/frames"
"#,
        )
        .unwrap();
        let dir = config.output_dir().unwrap();
        assert!(!dir.to_string_lossy().starts_with('~'));
        assert!(dir.ends_with("frames"));
    }
}

mod invalid {
    use super::*;

    fn rejects(document: &str) {
        assert!(
            CaptureConfig::from_toml(document).is_err(),
            "accepted:\n{}",
            document
        );
    }

    #[test]
    fn test_invalid_log_level() {
        rejects("[capture]\nlog_level = \"loud\"\n");
    }

    #[test]
    fn test_invalid_hex_ids() {
        rejects("[device]\nvendor_id = \"046d\"\n");
        rejects("[device]\nproduct_id = \"0x12345\"\n");
        rejects("[device]\nvendor_id = \"0xZZZZ\"\n");
    }

    #[test]
    fn test_out_endpoint_rejected() {
        rejects("[device]\niso_endpoint = 0x01\n");
    }

    #[test]
    fn test_control_endpoint_rejected() {
        // Endpoint number 0 with the IN bit is still the control pipe
        rejects("[device]\niso_endpoint = 0x80\n");
        rejects("[device]\niso_endpoint = 0x90\n");
    }

    #[test]
    fn test_invalid_block_len() {
        rejects("[negotiation]\nblock_len = 20\n");
    }

    #[test]
    fn test_zero_format_index_rejected() {
        rejects("[negotiation.commit]\nformat_index = 0\nframe_index = 1\nframe_interval = 333333\n");
    }

    #[test]
    fn test_marker_length_limits() {
        rejects("[stream]\nmarker = []\n");
        rejects("[stream]\nmarker = [1, 2, 3, 4, 5, 6, 7, 8, 9]\n");
    }

    #[test]
    fn test_unknown_overflow_policy() {
        rejects("[stream]\noverflow_policy = \"wrap\"\n");
    }

    #[test]
    fn test_zero_buffers_rejected() {
        rejects("[stream]\niso_buffer_count = 0\n");
    }
}

mod files {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("capture.toml");

        let mut config = CaptureConfig::default();
        config.stream.capture_limit = 1;
        config.device.product_id = "0x0826".to_string();
        config.save(&path).unwrap();

        let loaded = CaptureConfig::load(Some(path)).unwrap();
        assert_eq!(loaded.stream.capture_limit, 1);
        assert_eq!(loaded.device.product_id, "0x0826");
        assert_eq!(loaded.stream.marker, config.stream.marker);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CaptureConfig::load(Some(dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn test_load_invalid_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capture.toml");
        std::fs::write(&path, "[capture]\nlog_level = 3\n").unwrap();
        assert!(CaptureConfig::load(Some(path)).is_err());
    }
}
