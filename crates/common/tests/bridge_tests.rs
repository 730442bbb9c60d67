//! Capture Bridge Integration Tests
//!
//! Tests for the async channel bridge between the Tokio runtime and the
//! capture thread.
//!
//! # Test Scenarios
//! - Command/response flow (status)
//! - Event flow from the capture thread
//! - Shutdown and disconnection
//! - Channel capacity and backpressure
//!
//! Run with: `cargo test -p common --test bridge_tests`

use bytes::Bytes;
use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{CaptureCommand, CaptureEvent, CaptureStatus, create_capture_bridge};
use protocol::{CompletedFrame, DeviceAddress, LinkState, StreamStats};
use std::thread;
use std::time::Duration;

fn address() -> DeviceAddress {
    DeviceAddress::new(3).unwrap()
}

fn streaming_status() -> CaptureStatus {
    CaptureStatus {
        address: Some(address()),
        link: LinkState::Streaming,
        state: "Streaming".to_string(),
        restarts: 1,
        stats: StreamStats {
            frames_completed: 7,
            ..StreamStats::default()
        },
    }
}

// ============================================================================
// Command Flow Tests
// ============================================================================

#[tokio::test]
async fn test_status_command_flow() {
    let (bridge, worker) = create_capture_bridge();

    let handle = thread::spawn(move || {
        let cmd = worker.recv_command().expect("Failed to receive command");
        if let CaptureCommand::GetStatus { response } = cmd {
            response.send(streaming_status()).expect("Failed to send");
            true
        } else {
            false
        }
    });

    let status = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.status())
        .await
        .expect("Timed out")
        .expect("Status request failed");
    assert_eq!(status.link, LinkState::Streaming);
    assert_eq!(status.address, Some(address()));
    assert_eq!(status.stats.frames_completed, 7);

    assert!(handle.join().unwrap());
}

#[tokio::test]
async fn test_status_fails_when_worker_drops_response() {
    let (bridge, worker) = create_capture_bridge();

    let handle = thread::spawn(move || {
        // Drop the oneshot sender without answering
        let _ = worker.recv_command();
    });

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.status())
        .await
        .expect("Timed out");
    assert!(matches!(result, Err(common::Error::Channel(_))));

    handle.join().unwrap();
}

#[test]
fn test_try_recv_command_is_non_blocking() {
    let (_bridge, worker) = create_capture_bridge();
    assert!(worker.try_recv_command().is_none());
    assert!(!worker.is_disconnected());
}

// ============================================================================
// Event Flow Tests
// ============================================================================

#[tokio::test]
async fn test_events_arrive_in_order() {
    let (bridge, worker) = create_capture_bridge();

    let handle = thread::spawn(move || {
        worker
            .send_event(CaptureEvent::DeviceAttached {
                address: address(),
                vendor_id: 0x046D,
                product_id: 0x0825,
            })
            .unwrap();
        worker
            .send_event(CaptureEvent::StreamingStarted { address: address() })
            .unwrap();
        worker
            .send_event(CaptureEvent::FrameCompleted {
                frame: CompletedFrame {
                    sequence: 1,
                    size: 4,
                    raw_span: 16,
                    truncated: false,
                    data: Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]),
                },
            })
            .unwrap();
    });

    let mut received = Vec::new();
    for _ in 0..3 {
        let event = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
            .await
            .expect("Timed out")
            .expect("Channel closed");
        received.push(event);
    }

    assert!(matches!(received[0], CaptureEvent::DeviceAttached { .. }));
    assert!(matches!(received[1], CaptureEvent::StreamingStarted { .. }));
    assert!(matches!(
        &received[2],
        CaptureEvent::FrameCompleted { frame } if frame.sequence == 1
    ));

    handle.join().unwrap();
}

#[tokio::test]
async fn test_recv_event_fails_after_worker_exit() {
    let (bridge, worker) = create_capture_bridge();
    drop(worker);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, bridge.recv_event())
        .await
        .expect("Timed out");
    assert!(result.is_err());
}

#[test]
fn test_try_recv_event() {
    let (bridge, worker) = create_capture_bridge();
    assert!(bridge.try_recv_event().is_none());

    worker
        .send_event(CaptureEvent::DeviceDetached { address: address() })
        .unwrap();
    assert!(matches!(
        bridge.try_recv_event(),
        Some(CaptureEvent::DeviceDetached { .. })
    ));
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[tokio::test]
async fn test_worker_sees_disconnect() {
    let (bridge, worker) = create_capture_bridge();

    let handle = thread::spawn(move || {
        while !worker.is_disconnected() {
            thread::sleep(Duration::from_millis(1));
        }
        worker.send_event(CaptureEvent::DeviceDetached { address: address() })
    });

    drop(bridge);
    let result = handle.join().unwrap();
    assert!(matches!(result, Err(common::Error::Channel(_))));
}

#[tokio::test]
async fn test_event_backpressure_blocks_worker() {
    let (bridge, worker) = create_capture_bridge();

    let handle = thread::spawn(move || {
        let mut sent = 0usize;
        while worker
            .send_event(CaptureEvent::StreamingStarted { address: address() })
            .is_ok()
        {
            sent += 1;
        }
        sent
    });

    // Let the worker fill the queue, then drain a few and hang up
    tokio::time::sleep(Duration::from_millis(50)).await;
    for _ in 0..10 {
        bridge.recv_event().await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(bridge);

    let sent = handle.join().unwrap();
    // Never more than capacity plus what was drained
    assert!((256..=256 + 10).contains(&sent), "sent {}", sent);
}
