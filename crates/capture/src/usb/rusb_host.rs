//! libusb-backed host stack
//!
//! Implements [`HostStack`] on `rusb`. Control requests run synchronously when
//! issued and their result is staged for the next completion poll, so callers
//! still see the issue-then-poll protocol. Isochronous data is collected by
//! [`IsoStream`](crate::usb::iso::IsoStream) and surfaced from `poll_events`.

use crate::usb::device::UsbDevice;
use crate::usb::host::{CONTROL_ENDPOINT, HostEvent, HostStack};
use crate::usb::manager::{self, DeviceWatcher, PlugNotice};
use crate::usb::transfers::{execute_control, map_rusb_error};
use protocol::{DeviceAddress, SetupPacket, TransferCompletion, TransferStatus, UsbError};
use rusb::{Context, UsbContext};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Presence check period when hot-plug is unavailable
const PRESENCE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Host stack on top of libusb
pub struct RusbHost {
    context: Context,
    watcher: DeviceWatcher,
    device: Option<UsbDevice>,
    /// Device went away; cleared once the session has seen it
    gone: bool,
    staged: Option<TransferCompletion>,
    iso_buffers: Option<(usize, usize)>,
    last_presence_check: Instant,
    /// Last enumeration while looking for the camera
    last_scan: Option<Instant>,
    /// A device arrived since the last enumeration
    rescan: bool,
    /// Device that failed to open, to avoid warning on every poll
    open_failed: Option<(u8, u8)>,
}

impl RusbHost {
    pub fn new() -> Result<Self, UsbError> {
        let context = Context::new().map_err(map_rusb_error)?;
        let watcher = DeviceWatcher::new(&context);
        info!(
            "libusb host stack ready (hot-plug {})",
            if watcher.has_hotplug() {
                "enabled"
            } else {
                "unavailable"
            }
        );

        Ok(Self {
            context,
            watcher,
            device: None,
            gone: false,
            staged: None,
            iso_buffers: None,
            last_presence_check: Instant::now(),
            last_scan: None,
            rescan: false,
            open_failed: None,
        })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn open_device(&self, address: DeviceAddress) -> Option<&UsbDevice> {
        self.device.as_ref().filter(|d| d.address() == address)
    }

    fn open_device_mut(&mut self, address: DeviceAddress) -> Option<&mut UsbDevice> {
        self.device.as_mut().filter(|d| d.address() == address)
    }

    fn close_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            device.close();
        }
        self.staged = None;
        self.gone = false;
    }

    fn mark_gone(&mut self) {
        if self.device.is_some() && !self.gone {
            debug!("Device marked as gone");
            self.gone = true;
        }
    }
}

impl HostStack for RusbHost {
    fn find_device(&mut self, vendor_id: u16, product_id: u16) -> Option<DeviceAddress> {
        // Unplugged camera the session already let go of
        if self.gone {
            self.close_device();
        }

        if let Some(device) = &self.device {
            if !self.gone
                && device.vendor_id() == vendor_id
                && device.product_id() == product_id
            {
                return Some(device.address());
            }
        }

        // Enumeration is slow; rescan on arrival or periodically
        if !self.rescan
            && self
                .last_scan
                .is_some_and(|t| t.elapsed() < PRESENCE_POLL_INTERVAL)
        {
            return None;
        }
        self.last_scan = Some(Instant::now());
        self.rescan = false;

        let found = match manager::find_device(&self.context, vendor_id, product_id) {
            Ok(found) => found?,
            Err(e) => {
                trace!("Enumeration failed: {}", e);
                return None;
            }
        };

        let port = (found.bus_number(), found.address());
        self.close_device();
        match UsbDevice::open(found) {
            Ok(device) => {
                self.open_failed = None;
                let address = device.address();
                self.device = Some(device);
                Some(address)
            }
            Err(e) => {
                if self.open_failed != Some(port) {
                    warn!(
                        "Found {:04x}:{:04x} but could not open it: {}",
                        vendor_id, product_id, e
                    );
                    self.open_failed = Some(port);
                }
                None
            }
        }
    }

    fn is_detached(&mut self, address: DeviceAddress) -> bool {
        let Some((bus, port)) = self
            .open_device(address)
            .map(|d| (d.bus_number(), d.address().get()))
        else {
            return true;
        };

        if !self.gone
            && !self.watcher.has_hotplug()
            && self.last_presence_check.elapsed() >= PRESENCE_POLL_INTERVAL
        {
            self.last_presence_check = Instant::now();
            if !manager::device_present(&self.context, bus, port) {
                self.mark_gone();
            }
        }

        if self.gone {
            self.close_device();
            return true;
        }
        false
    }

    fn issue_device_request(
        &mut self,
        address: DeviceAddress,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<(), UsbError> {
        if self.gone {
            return Err(UsbError::NoDevice);
        }
        if self.staged.is_some() {
            return Err(UsbError::Busy);
        }
        let device = self.open_device_mut(address).ok_or(UsbError::NoDevice)?;

        let completion = if setup.is_set_interface() {
            // Let libusb update its own view of the interface
            match device.set_alternate_setting(setup.index as u8, setup.value as u8) {
                Ok(()) => TransferCompletion::sent(0),
                Err(UsbError::Busy) => return Err(UsbError::Busy),
                Err(e) => TransferCompletion::failed(e),
            }
        } else {
            execute_control(device.handle(), &setup, data).map_err(map_rusb_error)?
        };

        if completion.status == TransferStatus::Failed(UsbError::NoDevice) {
            self.mark_gone();
        }
        self.staged = Some(completion);
        Ok(())
    }

    fn transfer_status(
        &mut self,
        address: DeviceAddress,
        endpoint: u8,
    ) -> Option<TransferCompletion> {
        if endpoint != CONTROL_ENDPOINT || self.open_device(address).is_none() {
            return None;
        }
        self.staged.take()
    }

    fn abandon_transfer(&mut self, address: DeviceAddress, endpoint: u8) {
        // Control transfers already ran to completion on issue
        if endpoint == CONTROL_ENDPOINT && self.open_device(address).is_some() {
            self.staged = None;
        }
    }

    fn read_isochronous(&mut self, address: DeviceAddress, endpoint: u8) -> Result<(), UsbError> {
        let (count, size) = self.iso_buffers.ok_or(UsbError::InvalidParam)?;
        let context = self.context.clone();
        let device = self.open_device_mut(address).ok_or(UsbError::NoDevice)?;
        device.start_stream(&context, endpoint, count, size)
    }

    fn create_isochronous_buffers(&mut self, count: usize, size: usize) -> Result<(), UsbError> {
        if count == 0 || size == 0 {
            return Err(UsbError::InvalidParam);
        }
        self.iso_buffers = Some((count, size));
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<HostEvent> {
        let mut events = Vec::new();

        if let Err(e) = self.context.handle_events(Some(Duration::ZERO)) {
            warn!("libusb handle_events failed: {}", e);
            events.push(HostEvent::BusError);
        }

        for notice in self.watcher.take_notices() {
            match notice {
                PlugNotice::Arrived { address, .. } => {
                    self.rescan = true;
                    if let Some(address) = DeviceAddress::new(address) {
                        events.push(HostEvent::DeviceAttached { address });
                    }
                }
                PlugNotice::Left { bus, address } => {
                    let ours = self
                        .device
                        .as_ref()
                        .filter(|d| d.is_at(bus, address))
                        .map(UsbDevice::address);
                    if let Some(address) = ours {
                        // Nothing more can be done with the handle
                        self.close_device();
                        events.push(HostEvent::DeviceDetached { address });
                    }
                }
            }
        }

        let drained = self
            .device
            .as_ref()
            .and_then(|d| d.drain_stream().map(|drain| (d.address(), drain)));
        if let Some((address, drain)) = drained {
            events.extend(
                drain
                    .packets
                    .into_iter()
                    .map(|data| HostEvent::IsochronousData { address, data }),
            );
            match drain.error {
                Some(UsbError::NoDevice) => {
                    self.mark_gone();
                    events.push(HostEvent::DeviceDetached { address });
                }
                Some(e) => debug!("Isochronous transfer error: {}", e),
                None => {}
            }
        }

        events
    }
}

impl Drop for RusbHost {
    fn drop(&mut self) {
        self.close_device();
    }
}
