//! Host stack seam
//!
//! The session never touches a USB controller directly. Everything it needs
//! from the host controller driver and transfer scheduler goes through
//! [`HostStack`]: device lookup, presence checks, control transfer issuance,
//! completion polling and isochronous streaming. Implementations:
//!
//! - [`RusbHost`](crate::usb::rusb_host::RusbHost): libusb via `rusb`
//! - [`ScriptedHost`](crate::usb::mock::ScriptedHost): in-memory, for tests
//!   and `--simulate`

use bytes::Bytes;
use protocol::{DeviceAddress, SetupPacket, TransferCompletion, UsbError};

/// Control endpoint number
pub const CONTROL_ENDPOINT: u8 = 0;

/// Operations consumed from the host controller stack
///
/// Every call must return promptly: issuance only enqueues, completion is
/// observed later through [`transfer_status`](HostStack::transfer_status).
pub trait HostStack {
    /// Look for an attached device matching `vendor_id`/`product_id`
    fn find_device(&mut self, vendor_id: u16, product_id: u16) -> Option<DeviceAddress>;

    /// True once the device at `address` has gone away
    fn is_detached(&mut self, address: DeviceAddress) -> bool;

    /// Enqueue a control request
    ///
    /// `data` is the OUT payload; IN requests pass an empty slice and receive
    /// their data in the completion. `Err(UsbError::Busy)` and friends mean
    /// nothing was enqueued.
    fn issue_device_request(
        &mut self,
        address: DeviceAddress,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<(), UsbError>;

    /// Poll the most recent transfer on `endpoint`
    ///
    /// Returns `None` while the transfer is still in flight (or nothing was
    /// issued). A completion is reported once.
    fn transfer_status(
        &mut self,
        address: DeviceAddress,
        endpoint: u8,
    ) -> Option<TransferCompletion>;

    /// Forget the transfer in flight on `endpoint` so another can be issued
    ///
    /// A completion that shows up later for the abandoned transfer is never
    /// reported.
    fn abandon_transfer(&mut self, address: DeviceAddress, endpoint: u8);

    /// Start (or keep) isochronous reads running on `endpoint`
    ///
    /// Payloads arrive later as [`HostEvent::IsochronousData`].
    fn read_isochronous(&mut self, address: DeviceAddress, endpoint: u8) -> Result<(), UsbError>;

    /// Allocate `count` isochronous buffers of `size` bytes
    fn create_isochronous_buffers(&mut self, count: usize, size: usize) -> Result<(), UsbError>;

    /// Run the stack's own housekeeping and collect pending events
    fn poll_events(&mut self) -> Vec<HostEvent>;
}

/// Events raised by the host stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    /// A device matching a client driver finished enumeration
    DeviceAttached { address: DeviceAddress },
    /// A device was removed
    DeviceDetached { address: DeviceAddress },
    /// One isochronous payload delivered
    IsochronousData { address: DeviceAddress, data: Bytes },
    /// A transfer finished; the session still polls for its result
    TransferDone { address: DeviceAddress, endpoint: u8 },
    /// Bus power requested / released
    VbusRequestPower,
    VbusReleasePower,
    /// Bus suspended / resumed
    Suspend,
    Resume,
    /// A hub was attached; hubs are not supported
    HubAttached,
    /// Device has no matching client driver
    UnsupportedDevice,
    /// Enumeration failed
    CannotEnumerate,
    /// Client driver failed to initialise
    ClientInitError,
    /// Host stack ran out of memory
    OutOfMemory,
    /// Bus-level error
    BusError,
    /// Should never be generated
    UnspecifiedError,
}

impl HostEvent {
    /// Human-readable description for error-class events
    pub fn error_description(&self) -> Option<&'static str> {
        match self {
            Self::HubAttached => Some("hubs are not supported"),
            Self::UnsupportedDevice => Some("device is not supported"),
            Self::CannotEnumerate => Some("cannot enumerate device"),
            Self::ClientInitError => Some("client driver initialization error"),
            Self::OutOfMemory => Some("out of heap memory"),
            Self::BusError => Some("bus error"),
            Self::UnspecifiedError => Some("unspecified"),
            _ => None,
        }
    }
}

/// Acknowledgement returned to the host stack for every event
///
/// The stack stalls on unacknowledged events, so there is no "unhandled"
/// answer: events the session has no use for are `Ignored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAck {
    Handled,
    Ignored,
}
