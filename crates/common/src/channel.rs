//! Async channel bridge between Tokio runtime and the capture thread

use async_channel::{Receiver, Sender, bounded};
use protocol::{CompletedFrame, DeviceAddress, LinkState, StreamStats};

/// Commands from Tokio runtime to the capture thread
#[derive(Debug)]
pub enum CaptureCommand {
    /// Report current session status
    GetStatus {
        /// Channel to send response back
        response: tokio::sync::oneshot::Sender<CaptureStatus>,
    },

    /// Shutdown the capture thread gracefully
    Shutdown,
}

/// Snapshot of the capture session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStatus {
    /// Attached device, if any
    pub address: Option<DeviceAddress>,
    /// Coarse link state
    pub link: LinkState,
    /// Name of the active negotiation state
    pub state: String,
    /// Negotiation restarts since attach
    pub restarts: u32,
    /// Reassembler counters
    pub stats: StreamStats,
}

/// Events from the capture thread
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// Matching device found and negotiation started
    DeviceAttached {
        address: DeviceAddress,
        vendor_id: u16,
        product_id: u16,
    },

    /// Device went away; all session state was reset
    DeviceDetached { address: DeviceAddress },

    /// SET_INTERFACE confirmed and the first isochronous read issued
    StreamingStarted { address: DeviceAddress },

    /// A transfer failed or timed out and negotiation was restarted or abandoned
    NegotiationFailed {
        address: DeviceAddress,
        reason: String,
        /// True when the restart budget is exhausted and the session parked in Error
        fatal: bool,
    },

    /// A frame bracketed by two markers was reassembled
    FrameCompleted { frame: CompletedFrame },
}

/// Handle for Tokio runtime (async)
#[derive(Clone)]
pub struct CaptureBridge {
    cmd_tx: Sender<CaptureCommand>,
    event_rx: Receiver<CaptureEvent>,
}

impl CaptureBridge {
    /// Send a command to the capture thread
    pub async fn send_command(&self, cmd: CaptureCommand) -> crate::Result<()> {
        self.cmd_tx
            .send(cmd)
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Receive an event from the capture thread
    pub async fn recv_event(&self) -> crate::Result<CaptureEvent> {
        self.event_rx
            .recv()
            .await
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Take an event if one is already queued
    pub fn try_recv_event(&self) -> Option<CaptureEvent> {
        self.event_rx.try_recv().ok()
    }

    /// Ask the capture thread for a status snapshot
    pub async fn status(&self) -> crate::Result<CaptureStatus> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.send_command(CaptureCommand::GetStatus { response: tx })
            .await?;
        rx.await.map_err(|e| crate::Error::Channel(e.to_string()))
    }
}

/// Handle for the capture thread (blocking)
pub struct CaptureWorker {
    pub(crate) cmd_rx: Receiver<CaptureCommand>,
    /// Event sender (public for the capture thread to access)
    pub event_tx: Sender<CaptureEvent>,
}

impl CaptureWorker {
    /// Receive a command from Tokio runtime (blocking)
    pub fn recv_command(&self) -> crate::Result<CaptureCommand> {
        self.cmd_rx
            .recv_blocking()
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// Try to receive a command without blocking
    pub fn try_recv_command(&self) -> Option<CaptureCommand> {
        self.cmd_rx.try_recv().ok()
    }

    /// Send an event to Tokio runtime (blocking)
    pub fn send_event(&self, event: CaptureEvent) -> crate::Result<()> {
        self.event_tx
            .send_blocking(event)
            .map_err(|e| crate::Error::Channel(e.to_string()))
    }

    /// True once every bridge handle has been dropped
    pub fn is_disconnected(&self) -> bool {
        self.cmd_rx.is_closed()
    }
}

/// Create the channel bridge between Tokio and the capture thread
///
/// Returns (CaptureBridge for Tokio, CaptureWorker for the capture thread)
pub fn create_capture_bridge() -> (CaptureBridge, CaptureWorker) {
    let (cmd_tx, cmd_rx) = bounded(64);
    let (event_tx, event_rx) = bounded(256);

    (
        CaptureBridge { cmd_tx, event_rx },
        CaptureWorker { cmd_rx, event_tx },
    )
}
