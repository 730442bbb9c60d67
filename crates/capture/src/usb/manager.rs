//! Device discovery and hot-plug tracking
//!
//! Enumeration helpers plus a hot-plug watcher. libusb invokes hot-plug
//! callbacks from inside `handle_events`; the callback only records a notice
//! and the host stack turns notices into events on its next poll.

use rusb::{Context, Device, Hotplug, HotplugBuilder, Registration, UsbContext};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// Plug or unplug seen by the hot-plug callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlugNotice {
    Arrived { bus: u8, address: u8 },
    Left { bus: u8, address: u8 },
}

/// Hot-plug registration and the notices it collected
pub struct DeviceWatcher {
    notices: Arc<Mutex<VecDeque<PlugNotice>>>,
    registration: Option<Registration<Context>>,
}

impl DeviceWatcher {
    /// Register for hot-plug notifications when libusb supports them
    pub fn new(context: &Context) -> Self {
        let notices = Arc::new(Mutex::new(VecDeque::new()));

        let registration = if rusb::has_hotplug() {
            let callback = HotplugCallback {
                notices: Arc::clone(&notices),
            };
            match HotplugBuilder::new()
                .enumerate(false)
                .register(context, Box::new(callback))
            {
                Ok(registration) => {
                    debug!("Hot-plug callbacks registered");
                    Some(registration)
                }
                Err(e) => {
                    warn!("Hot-plug registration failed, falling back to polling: {}", e);
                    None
                }
            }
        } else {
            debug!("libusb has no hot-plug support, falling back to polling");
            None
        };

        Self {
            notices,
            registration,
        }
    }

    pub fn has_hotplug(&self) -> bool {
        self.registration.is_some()
    }

    /// Notices received since the last call
    pub fn take_notices(&self) -> Vec<PlugNotice> {
        self.notices
            .lock()
            .map(|mut n| n.drain(..).collect())
            .unwrap_or_default()
    }
}

/// Find the first attached device with the given IDs
pub fn find_device(
    context: &Context,
    vendor_id: u16,
    product_id: u16,
) -> Result<Option<Device<Context>>, rusb::Error> {
    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
            return Ok(Some(device));
        }
    }
    Ok(None)
}

/// True while a device sits at `bus`/`address`
///
/// A failed enumeration says nothing about the device, so it counts as
/// present; the next check decides.
pub fn device_present(context: &Context, bus: u8, address: u8) -> bool {
    let ports = context
        .devices()
        .map(|list| list.iter().map(|d| (d.bus_number(), d.address())).collect::<Vec<_>>());
    port_listed(ports, bus, address)
}

fn port_listed(ports: Result<Vec<(u8, u8)>, rusb::Error>, bus: u8, address: u8) -> bool {
    match ports {
        Ok(ports) => ports.contains(&(bus, address)),
        Err(e) => {
            debug!("Enumeration failed during presence check: {}", e);
            true
        }
    }
}

/// One line of `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
    pub class: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {:04x}:{:04x}",
            self.bus, self.address, self.vendor_id, self.product_id
        )?;
        if let Some(manufacturer) = &self.manufacturer {
            write!(f, " {}", manufacturer)?;
        }
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        Ok(())
    }
}

/// Every attached device except root hubs
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>, rusb::Error> {
    let mut summaries = Vec::new();

    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        // Root hubs: Linux Foundation VID, hub class
        if descriptor.vendor_id() == 0x1d6b && descriptor.class_code() == 9 {
            continue;
        }

        // Strings need an open handle; skip them when access is denied
        let (manufacturer, product) = match device.open() {
            Ok(handle) => (
                descriptor
                    .manufacturer_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                descriptor
                    .product_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
            ),
            Err(_) => (None, None),
        };

        summaries.push(DeviceSummary {
            bus: device.bus_number(),
            address: device.address(),
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            class: descriptor.class_code(),
            manufacturer,
            product,
        });
    }

    Ok(summaries)
}

/// Hot-plug callback for rusb
///
/// Runs on whichever thread calls `handle_events`; only queues notices.
struct HotplugCallback {
    notices: Arc<Mutex<VecDeque<PlugNotice>>>,
}

impl HotplugCallback {
    fn push(&self, notice: PlugNotice) {
        if let Ok(mut notices) = self.notices.lock() {
            notices.push_back(notice);
        }
    }
}

impl<T: UsbContext> Hotplug<T> for HotplugCallback {
    fn device_arrived(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device arrived (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(PlugNotice::Arrived {
            bus: device.bus_number(),
            address: device.address(),
        });
    }

    fn device_left(&mut self, device: Device<T>) {
        debug!(
            "Hot-plug callback: device left (bus={}, addr={})",
            device.bus_number(),
            device.address()
        );
        self.push(PlugNotice::Left {
            bus: device.bus_number(),
            address: device.address(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_summary_display() {
        let summary = DeviceSummary {
            bus: 1,
            address: 4,
            vendor_id: 0x046d,
            product_id: 0x0825,
            class: 0xEF,
            manufacturer: None,
            product: Some("Webcam C270".to_string()),
        };
        assert_eq!(
            summary.to_string(),
            "Bus 001 Device 004: ID 046d:0825 Webcam C270"
        );
    }

    #[test]
    fn test_presence_from_enumeration() {
        assert!(port_listed(Ok(vec![(1, 2), (1, 4)]), 1, 4));
        assert!(!port_listed(Ok(vec![(1, 2)]), 1, 4));
        assert!(!port_listed(Ok(Vec::new()), 2, 4));
    }

    #[test]
    fn test_failed_enumeration_keeps_device_present() {
        assert!(port_listed(Err(rusb::Error::Io), 1, 4));
        assert!(port_listed(Err(rusb::Error::NoMem), 1, 4));
    }

    #[test]
    fn test_hotplug_callback_queues_notices() {
        let notices = Arc::new(Mutex::new(VecDeque::new()));
        let callback = HotplugCallback {
            notices: Arc::clone(&notices),
        };
        callback.push(PlugNotice::Left { bus: 1, address: 2 });
        assert_eq!(
            notices.lock().unwrap().pop_front(),
            Some(PlugNotice::Left { bus: 1, address: 2 })
        );
    }
}
