//! Scripted host stack
//!
//! In-memory [`HostStack`] used by the test suites and by `--simulate`. The
//! camera answers control requests the way a cooperative device would:
//! GET_INFO reports GET/SET support, GET_CUR echoes the last SET_CUR on the
//! same selector, other GETs return a block carrying the baseline format.
//!
//! Completions are held back until the test releases them
//! ([`complete_next`](ScriptedHost::complete_next) and friends), or staged
//! right away with [`set_auto_complete`](ScriptedHost::set_auto_complete).
//! Either way they are only observed on the next poll.

use crate::usb::host::{CONTROL_ENDPOINT, HostEvent, HostStack};
use bytes::Bytes;
use common::test_utils::{UVC_HEADER_LEN, packetize_frames, synthetic_jpeg};
use protocol::{
    ControlSelector, DeviceAddress, RequestCode, SetupPacket, StreamFormat, TransferCompletion,
    UsbError,
};
use std::collections::{HashMap, VecDeque};
use tracing::trace;

/// Vendor ID of the built-in scripted camera
pub const SCRIPTED_VENDOR_ID: u16 = 0x046D;
/// Product ID of the built-in scripted camera
pub const SCRIPTED_PRODUCT_ID: u16 = 0x0825;

/// A control request as the host stack received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedRequest {
    pub address: DeviceAddress,
    pub setup: SetupPacket,
    pub data: Vec<u8>,
}

impl IssuedRequest {
    /// Class request code, `None` for SET_INTERFACE
    pub fn request(&self) -> Option<RequestCode> {
        if self.setup.is_set_interface() {
            None
        } else {
            self.setup.request_code()
        }
    }

    pub fn selector(&self) -> Option<ControlSelector> {
        self.setup.selector()
    }
}

#[derive(Debug, Clone, Copy)]
struct ScriptedDevice {
    address: DeviceAddress,
    vendor_id: u16,
    product_id: u16,
}

/// Endless stream of synthetic MJPEG frames
#[derive(Debug, Clone)]
struct FrameGenerator {
    frame_len: usize,
    seed: u8,
}

/// In-memory host stack with one scripted camera
#[derive(Debug)]
pub struct ScriptedHost {
    device: Option<ScriptedDevice>,
    auto_complete: bool,
    /// Issued control request still waiting for its completion
    outstanding: Option<IssuedRequest>,
    /// Completion ready for the next control endpoint poll
    staged: Option<TransferCompletion>,
    issue_failures: VecDeque<UsbError>,
    completion_failures: VecDeque<UsbError>,
    responses: HashMap<(RequestCode, ControlSelector), Vec<u8>>,
    last_set: HashMap<ControlSelector, Vec<u8>>,
    issued: Vec<IssuedRequest>,
    events: VecDeque<HostEvent>,
    iso_buffers: Option<(usize, usize)>,
    streaming: Option<(DeviceAddress, u8)>,
    iso_queue: VecDeque<Bytes>,
    packets_per_poll: usize,
    generator: Option<FrameGenerator>,
}

impl Default for ScriptedHost {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedHost {
    /// Host with the scripted camera already attached at address 1
    pub fn new() -> Self {
        let mut host = Self::without_device();
        host.device = DeviceAddress::new(1).map(|address| ScriptedDevice {
            address,
            vendor_id: SCRIPTED_VENDOR_ID,
            product_id: SCRIPTED_PRODUCT_ID,
        });
        host
    }

    /// Host with nothing plugged in
    pub fn without_device() -> Self {
        Self {
            device: None,
            auto_complete: false,
            outstanding: None,
            staged: None,
            issue_failures: VecDeque::new(),
            completion_failures: VecDeque::new(),
            responses: HashMap::new(),
            last_set: HashMap::new(),
            issued: Vec::new(),
            events: VecDeque::new(),
            iso_buffers: None,
            streaming: None,
            iso_queue: VecDeque::new(),
            packets_per_poll: 4,
            generator: None,
        }
    }

    /// Camera that completes everything and streams synthetic frames forever
    pub fn simulated_camera(vendor_id: u16, product_id: u16, frame_len: usize) -> Self {
        let mut host = Self::without_device();
        if let Some(address) = DeviceAddress::new(1) {
            host.attach(address, vendor_id, product_id);
        }
        host.auto_complete = true;
        host.generator = Some(FrameGenerator { frame_len, seed: 0 });
        host
    }

    /// Plug a device in
    pub fn attach(&mut self, address: DeviceAddress, vendor_id: u16, product_id: u16) {
        self.device = Some(ScriptedDevice {
            address,
            vendor_id,
            product_id,
        });
        self.events.push_back(HostEvent::DeviceAttached { address });
    }

    /// Unplug the device; in-flight transfers are lost
    pub fn detach(&mut self) {
        if let Some(device) = self.device.take() {
            self.events.push_back(HostEvent::DeviceDetached {
                address: device.address,
            });
        }
        self.outstanding = None;
        self.staged = None;
        self.streaming = None;
        self.iso_queue.clear();
        self.last_set.clear();
    }

    pub fn set_auto_complete(&mut self, enabled: bool) {
        self.auto_complete = enabled;
    }

    /// Isochronous packets handed out per `poll_events`
    pub fn set_packets_per_poll(&mut self, packets: usize) {
        self.packets_per_poll = packets.max(1);
    }

    /// Refuse the next `count` issuances with `error`
    pub fn fail_next_issues(&mut self, count: usize, error: UsbError) {
        self.issue_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Complete the next `count` control requests with `error`
    pub fn fail_next_completions(&mut self, count: usize, error: UsbError) {
        self.completion_failures
            .extend(std::iter::repeat_n(error, count));
    }

    /// Fixed answer for a GET request
    pub fn set_response(&mut self, request: RequestCode, selector: ControlSelector, data: &[u8]) {
        self.responses.insert((request, selector), data.to_vec());
    }

    /// Every request issued so far, in order
    pub fn issued(&self) -> &[IssuedRequest] {
        &self.issued
    }

    /// Request issued but not completed yet
    pub fn outstanding(&self) -> Option<&IssuedRequest> {
        self.outstanding.as_ref()
    }

    /// True once a completion is waiting to be polled
    pub fn has_staged_completion(&self) -> bool {
        self.staged.is_some()
    }

    /// Complete the outstanding request with the camera's usual answer
    pub fn complete_next(&mut self) -> bool {
        match self.outstanding.take() {
            Some(request) => {
                self.staged = Some(self.respond(&request));
                true
            }
            None => false,
        }
    }

    /// Complete the outstanding request only if it is `request` on `selector`
    pub fn complete_matching(&mut self, request: RequestCode, selector: ControlSelector) -> bool {
        let matches = self
            .outstanding
            .as_ref()
            .is_some_and(|r| r.request() == Some(request) && r.selector() == Some(selector));
        matches && self.complete_next()
    }

    /// Complete the outstanding SET_INTERFACE
    pub fn complete_set_interface(&mut self) -> bool {
        let matches = self
            .outstanding
            .as_ref()
            .is_some_and(|r| r.setup.is_set_interface());
        matches && self.complete_next()
    }

    /// Complete the outstanding request with an explicit result
    pub fn complete_control(&mut self, completion: TransferCompletion) -> bool {
        if self.outstanding.take().is_none() {
            return false;
        }
        self.staged = Some(completion);
        true
    }

    pub fn push_event(&mut self, event: HostEvent) {
        self.events.push_back(event);
    }

    /// Queue raw isochronous packets for delivery while streaming
    pub fn queue_isochronous<I>(&mut self, packets: I)
    where
        I: IntoIterator,
        I::Item: Into<Bytes>,
    {
        self.iso_queue.extend(packets.into_iter().map(Into::into));
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.is_some()
    }

    pub fn iso_buffers(&self) -> Option<(usize, usize)> {
        self.iso_buffers
    }

    fn current_address(&self) -> Option<DeviceAddress> {
        self.device.map(|d| d.address)
    }

    /// What the camera answers to `request`
    fn respond(&mut self, request: &IssuedRequest) -> TransferCompletion {
        if let Some(error) = self.completion_failures.pop_front() {
            return TransferCompletion::failed(error);
        }

        if request.setup.is_set_interface() {
            return TransferCompletion::sent(0);
        }

        let (Some(code), Some(selector)) = (request.request(), request.selector()) else {
            return TransferCompletion::failed(UsbError::Pipe);
        };

        if code.is_set() {
            self.last_set.insert(selector, request.data.clone());
            return TransferCompletion::sent(request.data.len());
        }

        if let Some(data) = self.responses.get(&(code, selector)) {
            return TransferCompletion::with_data(data.clone());
        }

        let len = usize::from(request.setup.length);
        match code {
            RequestCode::GetInfo => TransferCompletion::with_data(vec![0x03; len.min(1)]),
            RequestCode::GetCur => match self.last_set.get(&selector) {
                Some(data) => TransferCompletion::with_data(data.clone()),
                None => TransferCompletion::with_data(baseline_block(len)),
            },
            _ => TransferCompletion::with_data(baseline_block(len)),
        }
    }

    fn refill_from_generator(&mut self) {
        let Some(generator) = self.generator.as_mut() else {
            return;
        };
        let payload_len = self
            .iso_buffers
            .map(|(_, size)| size.saturating_sub(UVC_HEADER_LEN))
            .unwrap_or(1012)
            .max(1);
        let frame = synthetic_jpeg(generator.frame_len, generator.seed);
        generator.seed = generator.seed.wrapping_add(1);
        self.iso_queue.extend(
            packetize_frames(&[frame], payload_len)
                .into_iter()
                .map(Bytes::from),
        );
    }
}

/// Parameter block of `len` bytes carrying the baseline stream format
fn baseline_block(len: usize) -> Vec<u8> {
    let mut block = vec![0u8; len];
    if len >= 8 {
        let format = StreamFormat::PROBE_BASELINE;
        block[2] = format.format_index;
        block[3] = format.frame_index;
        block[4..8].copy_from_slice(&format.frame_interval.to_le_bytes());
    }
    block
}

impl HostStack for ScriptedHost {
    fn find_device(&mut self, vendor_id: u16, product_id: u16) -> Option<DeviceAddress> {
        self.device
            .filter(|d| d.vendor_id == vendor_id && d.product_id == product_id)
            .map(|d| d.address)
    }

    fn is_detached(&mut self, address: DeviceAddress) -> bool {
        self.current_address() != Some(address)
    }

    fn issue_device_request(
        &mut self,
        address: DeviceAddress,
        setup: SetupPacket,
        data: &[u8],
    ) -> Result<(), UsbError> {
        if let Some(error) = self.issue_failures.pop_front() {
            trace!("Scripted issuance failure: {}", error);
            return Err(error);
        }
        if self.current_address() != Some(address) {
            return Err(UsbError::NoDevice);
        }
        if self.outstanding.is_some() {
            return Err(UsbError::Busy);
        }

        let request = IssuedRequest {
            address,
            setup,
            data: data.to_vec(),
        };
        self.issued.push(request.clone());
        self.staged = None;
        self.outstanding = Some(request);

        if self.auto_complete {
            self.complete_next();
        }
        Ok(())
    }

    fn transfer_status(
        &mut self,
        address: DeviceAddress,
        endpoint: u8,
    ) -> Option<TransferCompletion> {
        if endpoint != CONTROL_ENDPOINT || self.current_address() != Some(address) {
            return None;
        }
        self.staged.take()
    }

    fn abandon_transfer(&mut self, address: DeviceAddress, endpoint: u8) {
        if endpoint != CONTROL_ENDPOINT || self.current_address() != Some(address) {
            return;
        }
        self.outstanding = None;
        self.staged = None;
    }

    fn read_isochronous(&mut self, address: DeviceAddress, endpoint: u8) -> Result<(), UsbError> {
        if self.current_address() != Some(address) {
            return Err(UsbError::NoDevice);
        }
        if self.iso_buffers.is_none() {
            return Err(UsbError::Other {
                message: "isochronous buffers not allocated".to_string(),
            });
        }
        self.streaming = Some((address, endpoint));
        Ok(())
    }

    fn create_isochronous_buffers(&mut self, count: usize, size: usize) -> Result<(), UsbError> {
        if count == 0 || size == 0 {
            return Err(UsbError::InvalidParam);
        }
        self.iso_buffers = Some((count, size));
        Ok(())
    }

    fn poll_events(&mut self) -> Vec<HostEvent> {
        let mut events: Vec<HostEvent> = self.events.drain(..).collect();

        if let Some((address, _)) = self.streaming {
            while self.generator.is_some() && self.iso_queue.len() < self.packets_per_poll {
                self.refill_from_generator();
            }
            for _ in 0..self.packets_per_poll {
                match self.iso_queue.pop_front() {
                    Some(data) => events.push(HostEvent::IsochronousData { address, data }),
                    None => break,
                }
            }
        }

        events
    }
}
