//! Opened camera
//!
//! Wraps a `rusb` device handle with the interfaces claimed from the kernel
//! and the isochronous stream running on it.

use crate::usb::iso::{IsoDrain, IsoStream};
use crate::usb::transfers::map_rusb_error;
use protocol::{DeviceAddress, UsbError};
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle};
use tracing::{debug, warn};

/// Camera opened for control and streaming
pub struct UsbDevice {
    device: Device<Context>,
    address: DeviceAddress,
    descriptor: DeviceDescriptor,
    handle: DeviceHandle<Context>,
    /// Interfaces claimed by us
    claimed_interfaces: Vec<u8>,
    stream: Option<IsoStream>,
}

impl UsbDevice {
    /// Open `device`, detaching kernel drivers and claiming every interface
    /// of the active configuration
    pub fn open(device: Device<Context>) -> Result<Self, UsbError> {
        let address = DeviceAddress::new(device.address()).ok_or(UsbError::NotFound)?;
        let descriptor = device.device_descriptor().map_err(map_rusb_error)?;

        let handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", address, e);
            map_rusb_error(e)
        })?;
        debug!(
            "Opened {:04x}:{:04x} at bus {} address {}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            device.bus_number(),
            address
        );

        let mut opened = Self {
            device,
            address,
            descriptor,
            handle,
            claimed_interfaces: Vec::new(),
            stream: None,
        };

        let config = opened
            .device
            .active_config_descriptor()
            .map_err(map_rusb_error)?;
        for interface in config.interfaces() {
            opened.claim(interface.number())?;
        }

        Ok(opened)
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn bus_number(&self) -> u8 {
        self.device.bus_number()
    }

    pub fn vendor_id(&self) -> u16 {
        self.descriptor.vendor_id()
    }

    pub fn product_id(&self) -> u16 {
        self.descriptor.product_id()
    }

    pub fn handle(&self) -> &DeviceHandle<Context> {
        &self.handle
    }

    /// Same physical port as a hot-plug notice
    pub fn is_at(&self, bus: u8, address: u8) -> bool {
        self.device.bus_number() == bus && self.device.address() == address
    }

    /// Select an alternate setting, claiming the interface first if needed
    pub fn set_alternate_setting(&mut self, interface: u8, setting: u8) -> Result<(), UsbError> {
        if !self.claimed_interfaces.contains(&interface) {
            self.claim(interface)?;
        }
        self.handle
            .set_alternate_setting(interface, setting)
            .map_err(map_rusb_error)?;
        debug!(
            "Interface {} switched to alternate setting {}",
            interface, setting
        );
        Ok(())
    }

    /// Bytes per isochronous packet on `endpoint`, high-bandwidth multiplier
    /// included
    ///
    /// Looks at every alternate setting of the active configuration and
    /// returns the largest size found for the endpoint.
    pub fn iso_packet_size(&self, endpoint: u8) -> Option<usize> {
        let config = self.device.active_config_descriptor().ok()?;
        config
            .interfaces()
            .flat_map(|interface| interface.descriptors())
            .flat_map(|setting| {
                setting
                    .endpoint_descriptors()
                    .filter(|ep| ep.address() == endpoint)
                    .map(|ep| {
                        let raw = usize::from(ep.max_packet_size());
                        (raw & 0x7FF) * (1 + ((raw >> 11) & 0x3))
                    })
                    .collect::<Vec<_>>()
            })
            .max()
    }

    /// Start streaming from `endpoint`; no-op when already running
    pub fn start_stream(
        &mut self,
        context: &Context,
        endpoint: u8,
        transfer_count: usize,
        buffer_size: usize,
    ) -> Result<(), UsbError> {
        if self.stream.is_some() {
            return Ok(());
        }

        let packet_len = self
            .iso_packet_size(endpoint)
            .filter(|&len| len > 0)
            .unwrap_or(buffer_size);
        let packets_per_transfer = (buffer_size / packet_len).max(1);

        let stream = IsoStream::start(
            context,
            &self.handle,
            endpoint,
            transfer_count,
            packets_per_transfer,
            packet_len,
        )?;
        self.stream = Some(stream);
        Ok(())
    }

    /// Packets received since the last call, `None` when not streaming
    pub fn drain_stream(&self) -> Option<IsoDrain> {
        self.stream.as_ref().map(IsoStream::drain)
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_some()
    }

    /// Stop streaming, release interfaces and give them back to the kernel
    pub fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            stream.stop();
        }

        for interface in self.claimed_interfaces.drain(..) {
            if let Err(e) = self.handle.release_interface(interface) {
                debug!("Failed to release interface {}: {}", interface, e);
            }
            if let Err(e) = self.handle.attach_kernel_driver(interface) {
                debug!(
                    "Could not reattach kernel driver to interface {}: {}",
                    interface, e
                );
            }
        }

        debug!("Closed device {}", self.address);
    }

    fn claim(&mut self, interface: u8) -> Result<(), UsbError> {
        match self.handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                if let Err(e) = self.handle.detach_kernel_driver(interface) {
                    warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    );
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver on interface {}: {}",
                interface, e
            ),
        }

        self.handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            map_rusb_error(e)
        })?;
        debug!("Claimed interface {}", interface);
        self.claimed_interfaces.push(interface);
        Ok(())
    }
}

impl Drop for UsbDevice {
    fn drop(&mut self) {
        self.close();
    }
}
