//! Isochronous IN streaming on libusb
//!
//! `rusb` has no isochronous API, so transfers are driven through the raw
//! libusb bindings it re-exports. A fixed ring of transfers stays in flight;
//! each completion copies its packets into a shared queue and resubmits the
//! transfer. Callbacks only run inside `handle_events`, which is called from
//! the capture thread, so the queue has a single producer and consumer.

use bytes::Bytes;
use protocol::UsbError;
use rusb::ffi::{self, constants::*};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::VecDeque;
use std::ffi::{c_int, c_uint, c_void};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Timeout of each isochronous transfer (0 = none)
const ISO_TRANSFER_TIMEOUT_MS: c_uint = 0;

/// How long teardown waits for cancelled transfers to come back
const CANCEL_DEADLINE: Duration = Duration::from_secs(1);

/// State shared with the completion callback
#[derive(Default)]
struct IsoShared {
    packets: VecDeque<Bytes>,
    in_flight: usize,
    active: bool,
    error: Option<UsbError>,
}

/// Packets drained from the stream since the last call
#[derive(Debug, Default)]
pub struct IsoDrain {
    pub packets: Vec<Bytes>,
    pub error: Option<UsbError>,
}

/// Running isochronous IN stream
///
/// Must be stopped before the device handle it was started on is closed.
pub struct IsoStream {
    context: Context,
    endpoint: u8,
    transfers: Vec<*mut ffi::libusb_transfer>,
    /// Backing memory of each transfer; never moved while transfers live
    buffers: Vec<Box<[u8]>>,
    shared: Box<Mutex<IsoShared>>,
    stopped: bool,
}

impl IsoStream {
    /// Allocate and submit `transfer_count` transfers of `packets_per_transfer`
    /// packets, `packet_len` bytes each
    pub fn start(
        context: &Context,
        handle: &DeviceHandle<Context>,
        endpoint: u8,
        transfer_count: usize,
        packets_per_transfer: usize,
        packet_len: usize,
    ) -> Result<Self, UsbError> {
        if transfer_count == 0 || packets_per_transfer == 0 || packet_len == 0 {
            return Err(UsbError::InvalidParam);
        }

        let mut stream = Self {
            context: context.clone(),
            endpoint,
            transfers: Vec::with_capacity(transfer_count),
            buffers: Vec::with_capacity(transfer_count),
            shared: Box::new(Mutex::new(IsoShared {
                active: true,
                ..IsoShared::default()
            })),
            stopped: false,
        };

        let buffer_len = packets_per_transfer * packet_len;
        let user_data = (&*stream.shared as *const Mutex<IsoShared>) as *mut c_void;

        for _ in 0..transfer_count {
            let mut buffer = vec![0u8; buffer_len].into_boxed_slice();

            // SAFETY: the transfer is fully initialised before submission; its
            // buffer and user data are owned by `stream` and outlive it.
            let transfer = unsafe { ffi::libusb_alloc_transfer(packets_per_transfer as c_int) };
            if transfer.is_null() {
                stream.stop();
                return Err(UsbError::Other {
                    message: "libusb_alloc_transfer failed".to_string(),
                });
            }

            unsafe {
                (*transfer).dev_handle = handle.as_raw();
                (*transfer).endpoint = endpoint;
                (*transfer).transfer_type = LIBUSB_TRANSFER_TYPE_ISOCHRONOUS;
                (*transfer).timeout = ISO_TRANSFER_TIMEOUT_MS;
                (*transfer).buffer = buffer.as_mut_ptr();
                (*transfer).length = buffer_len as c_int;
                (*transfer).num_iso_packets = packets_per_transfer as c_int;
                (*transfer).callback = iso_transfer_callback;
                (*transfer).user_data = user_data;

                let descriptors = (&raw mut (*transfer).iso_packet_desc)
                    as *mut ffi::libusb_iso_packet_descriptor;
                for i in 0..packets_per_transfer {
                    (*descriptors.add(i)).length = packet_len as c_uint;
                }
            }

            stream.transfers.push(transfer);
            stream.buffers.push(buffer);

            // SAFETY: see above
            let rc = unsafe { ffi::libusb_submit_transfer(transfer) };
            if rc != 0 {
                stream.stop();
                return Err(libusb_error(rc));
            }
            if let Ok(mut shared) = stream.shared.lock() {
                shared.in_flight += 1;
            }
        }

        debug!(
            "Isochronous stream on {:#04x}: {} transfers x {} packets x {} bytes",
            endpoint, transfer_count, packets_per_transfer, packet_len
        );
        Ok(stream)
    }

    pub fn endpoint(&self) -> u8 {
        self.endpoint
    }

    /// Take every packet received so far
    pub fn drain(&self) -> IsoDrain {
        match self.shared.lock() {
            Ok(mut shared) => IsoDrain {
                packets: shared.packets.drain(..).collect(),
                error: shared.error.take(),
            },
            Err(_) => IsoDrain {
                packets: Vec::new(),
                error: Some(UsbError::Other {
                    message: "isochronous state poisoned".to_string(),
                }),
            },
        }
    }

    /// True while at least one transfer is in flight
    pub fn is_running(&self) -> bool {
        self.shared
            .lock()
            .map(|s| s.active && s.in_flight > 0)
            .unwrap_or(false)
    }

    /// Cancel every transfer and free them once libusb hands them back
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Ok(mut shared) = self.shared.lock() {
            shared.active = false;
        }
        for &transfer in &self.transfers {
            // SAFETY: transfers are live until freed below
            unsafe {
                ffi::libusb_cancel_transfer(transfer);
            }
        }

        let deadline = Instant::now() + CANCEL_DEADLINE;
        while self.in_flight() > 0 && Instant::now() < deadline {
            if let Err(e) = self.context.handle_events(Some(Duration::from_millis(10))) {
                debug!("handle_events during teardown: {}", e);
            }
        }

        let remaining = self.in_flight();
        if remaining > 0 {
            // Freeing a transfer libusb still owns is undefined; leak instead
            warn!(
                "{} isochronous transfers did not complete cancellation, leaking them",
                remaining
            );
            let buffers = std::mem::take(&mut self.buffers);
            std::mem::forget(buffers);
            let shared = std::mem::replace(
                &mut self.shared,
                Box::new(Mutex::new(IsoShared::default())),
            );
            std::mem::forget(shared);
        } else {
            for &transfer in &self.transfers {
                // SAFETY: no longer in flight
                unsafe { ffi::libusb_free_transfer(transfer) };
            }
        }
        self.transfers.clear();
        debug!("Isochronous stream on {:#04x} stopped", self.endpoint);
    }

    fn in_flight(&self) -> usize {
        self.shared.lock().map(|s| s.in_flight).unwrap_or(0)
    }
}

impl Drop for IsoStream {
    fn drop(&mut self) {
        self.stop();
    }
}

extern "system" fn iso_transfer_callback(transfer: *mut ffi::libusb_transfer) {
    // SAFETY: libusb passes back a transfer allocated in `IsoStream::start`,
    // whose user data points at the stream's shared state.
    unsafe {
        let shared = &*((*transfer).user_data as *const Mutex<IsoShared>);
        let Ok(mut shared) = shared.lock() else {
            return;
        };

        let status = (*transfer).status;
        match status {
            LIBUSB_TRANSFER_COMPLETED => {
                let descriptors = (&raw const (*transfer).iso_packet_desc)
                    as *const ffi::libusb_iso_packet_descriptor;
                let mut offset = 0usize;
                for i in 0..(*transfer).num_iso_packets as usize {
                    let packet = &*descriptors.add(i);
                    if packet.status == LIBUSB_TRANSFER_COMPLETED && packet.actual_length > 0 {
                        let data = std::slice::from_raw_parts(
                            (*transfer).buffer.add(offset),
                            packet.actual_length as usize,
                        );
                        shared.packets.push_back(Bytes::copy_from_slice(data));
                    }
                    offset += packet.length as usize;
                }
            }
            LIBUSB_TRANSFER_CANCELLED => {}
            LIBUSB_TRANSFER_NO_DEVICE => {
                shared.active = false;
                shared.error = Some(UsbError::NoDevice);
            }
            _ => {
                shared.error = Some(UsbError::Io);
            }
        }

        if shared.active && status != LIBUSB_TRANSFER_CANCELLED {
            let rc = ffi::libusb_submit_transfer(transfer);
            if rc == 0 {
                return;
            }
            shared.error = Some(libusb_error(rc));
        }
        shared.in_flight = shared.in_flight.saturating_sub(1);
    }
}

/// Map a negative libusb return code
fn libusb_error(rc: c_int) -> UsbError {
    match rc {
        LIBUSB_ERROR_TIMEOUT => UsbError::Timeout,
        LIBUSB_ERROR_PIPE => UsbError::Pipe,
        LIBUSB_ERROR_NO_DEVICE => UsbError::NoDevice,
        LIBUSB_ERROR_NOT_FOUND => UsbError::NotFound,
        LIBUSB_ERROR_BUSY => UsbError::Busy,
        LIBUSB_ERROR_OVERFLOW => UsbError::Overflow,
        LIBUSB_ERROR_IO => UsbError::Io,
        LIBUSB_ERROR_INVALID_PARAM => UsbError::InvalidParam,
        LIBUSB_ERROR_ACCESS => UsbError::Access,
        other => UsbError::Other {
            message: format!("libusb error {}", other),
        },
    }
}
