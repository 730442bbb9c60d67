//! Control transfer adapter
//!
//! Wraps raw request issuance into typed video-class requests. The direction
//! and request-type bits are derived from the [`RequestCode`]; callers only
//! say what they want (GET_CUR on PROBE, SET_CUR on COMMIT, ...).

use crate::usb::host::{CONTROL_ENDPOINT, HostStack};
use protocol::{
    ControlSelector, DeviceAddress, RequestCode, SetupPacket, TransferCompletion, UsbError,
};
use tracing::{debug, trace};

/// Typed view of the control pipe of one attached device
///
/// Borrowed for the duration of a tick; holds no state of its own.
pub struct ControlChannel<'a, H: HostStack + ?Sized> {
    host: &'a mut H,
    address: DeviceAddress,
}

impl<'a, H: HostStack + ?Sized> ControlChannel<'a, H> {
    pub fn new(host: &'a mut H, address: DeviceAddress) -> Self {
        Self { host, address }
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    /// Enqueue a class request on the streaming interface
    ///
    /// For SET requests the first `length` bytes of `buffer` are sent. GET
    /// requests ignore `buffer`; the device's answer arrives with the
    /// completion. Returns immediately.
    pub fn send_control_request(
        &mut self,
        request: RequestCode,
        selector: ControlSelector,
        index: u16,
        buffer: &[u8],
        length: u16,
    ) -> Result<(), UsbError> {
        let setup = SetupPacket::class_interface(request, selector, index, length);
        let payload: &[u8] = if request.is_set() {
            let len = usize::from(length).min(buffer.len());
            &buffer[..len]
        } else {
            &[]
        };

        let result = self.host.issue_device_request(self.address, setup, payload);
        match &result {
            Ok(()) => debug!(
                "{} {} issued (index={}, length={})",
                request, selector, index, length
            ),
            Err(e) => trace!("{} {} not issued: {}", request, selector, e),
        }
        result
    }

    /// Enqueue a standard SET_INTERFACE selecting `alternate_setting`
    pub fn set_interface(&mut self, interface: u8, alternate_setting: u8) -> Result<(), UsbError> {
        let setup = SetupPacket::set_interface(interface.into(), alternate_setting.into());
        let result = self.host.issue_device_request(self.address, setup, &[]);
        match &result {
            Ok(()) => debug!(
                "SET_INTERFACE issued (interface={}, alternate={})",
                interface, alternate_setting
            ),
            Err(e) => trace!("SET_INTERFACE not issued: {}", e),
        }
        result
    }

    /// Poll the control endpoint for the outstanding request
    pub fn poll_completion(&mut self) -> Option<TransferCompletion> {
        self.host.transfer_status(self.address, CONTROL_ENDPOINT)
    }

    /// Give up on the outstanding request
    pub fn abandon(&mut self) {
        trace!("Abandoning outstanding control transfer on {}", self.address);
        self.host.abandon_transfer(self.address, CONTROL_ENDPOINT);
    }

    /// Start isochronous reads on `endpoint`
    pub fn read_isochronous(&mut self, endpoint: u8) -> Result<(), UsbError> {
        self.host.read_isochronous(self.address, endpoint)
    }
}
