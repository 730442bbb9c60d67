//! Capture session
//!
//! Owns everything that lives for one attached camera: its address, the
//! negotiator and the frame reassembler. [`CaptureSession::tick`] is the
//! attach/detach monitor plus one negotiation step; host events (including
//! isochronous data) come in through [`CaptureSession::handle_event`] on the
//! same thread, so the frame buffer has a single writer.

use crate::usb::control::ControlChannel;
use crate::usb::host::{EventAck, HostEvent, HostStack};
use crate::usb::negotiation::{NegotiationPolicy, NegotiationState, Negotiator, Outcome};
use crate::usb::reassembler::{FrameReassembler, ReassemblerConfig};
use common::{CaptureEvent, CaptureStatus};
use protocol::{DeviceAddress, UsbError};
use tracing::{debug, info, trace, warn};

/// Everything a session is parametrised with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    pub iso_buffer_count: usize,
    pub iso_buffer_size: usize,
    pub negotiation: NegotiationPolicy,
    pub reassembler: ReassemblerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x046D,
            product_id: 0x0825,
            iso_buffer_count: 2,
            iso_buffer_size: 1024,
            negotiation: NegotiationPolicy::default(),
            reassembler: ReassemblerConfig::default(),
        }
    }
}

/// Single-camera capture session
pub struct CaptureSession {
    vendor_id: u16,
    product_id: u16,
    iso_buffer_count: usize,
    iso_buffer_size: usize,
    address: Option<DeviceAddress>,
    negotiator: Negotiator,
    reassembler: FrameReassembler,
    outbox: Vec<CaptureEvent>,
}

impl CaptureSession {
    pub fn new(config: SessionConfig) -> protocol::Result<Self> {
        Ok(Self {
            vendor_id: config.vendor_id,
            product_id: config.product_id,
            iso_buffer_count: config.iso_buffer_count,
            iso_buffer_size: config.iso_buffer_size,
            address: None,
            negotiator: Negotiator::new(config.negotiation)?,
            reassembler: FrameReassembler::new(config.reassembler),
            outbox: Vec::new(),
        })
    }

    /// Allocate the host stack's isochronous buffers
    pub fn initialize<H: HostStack + ?Sized>(&mut self, host: &mut H) -> Result<(), UsbError> {
        host.create_isochronous_buffers(self.iso_buffer_count, self.iso_buffer_size)?;
        debug!(
            "Allocated {} isochronous buffers of {} bytes",
            self.iso_buffer_count, self.iso_buffer_size
        );
        Ok(())
    }

    pub fn address(&self) -> Option<DeviceAddress> {
        self.address
    }

    pub fn state(&self) -> NegotiationState {
        self.negotiator.state()
    }

    pub fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    pub fn reassembler(&self) -> &FrameReassembler {
        &self.reassembler
    }

    /// True once the configured number of frames has been captured
    pub fn is_complete(&self) -> bool {
        self.reassembler.is_complete()
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<CaptureEvent> {
        std::mem::take(&mut self.outbox)
    }

    pub fn status(&self) -> CaptureStatus {
        let state = self.negotiator.state();
        CaptureStatus {
            address: self.address,
            link: state.link_state(),
            state: state.to_string(),
            restarts: self.negotiator.restarts(),
            stats: self.reassembler.stats(),
        }
    }

    /// One cooperative step: presence check, then at most one state change
    pub fn tick<H: HostStack + ?Sized>(&mut self, host: &mut H) {
        match self.address {
            Some(address) if host.is_detached(address) => {
                self.detach(address);
                return;
            }
            None if !self.negotiator.state().is_initial() => {
                warn!(
                    "No device but negotiation in {}, resetting",
                    self.negotiator.state()
                );
                self.reset();
            }
            _ => {}
        }

        match self.negotiator.state() {
            NegotiationState::Initialize => {
                self.negotiator.enter_idle();
            }
            NegotiationState::Idle => {
                if let Some(address) = host.find_device(self.vendor_id, self.product_id) {
                    info!(
                        "Device attached: {:04x}:{:04x} at address {}",
                        self.vendor_id, self.product_id, address
                    );
                    self.address = Some(address);
                    self.negotiator.begin();
                    self.outbox.push(CaptureEvent::DeviceAttached {
                        address,
                        vendor_id: self.vendor_id,
                        product_id: self.product_id,
                    });
                }
            }
            _ => {
                let Some(address) = self.address else {
                    return;
                };
                let outcome = {
                    let mut channel = ControlChannel::new(host, address);
                    self.negotiator.poll(&mut channel)
                };
                self.on_outcome(address, outcome);
            }
        }
    }

    /// Acknowledge a host event, acting on the ones that matter
    pub fn handle_event(&mut self, event: HostEvent) -> EventAck {
        match event {
            HostEvent::IsochronousData { address, data } => {
                if self.address != Some(address)
                    || self.negotiator.state() != NegotiationState::Streaming
                {
                    trace!("Isochronous data from {} ignored", address);
                    return EventAck::Ignored;
                }
                for frame in self.reassembler.push(&data) {
                    self.outbox.push(CaptureEvent::FrameCompleted { frame });
                }
                EventAck::Handled
            }
            HostEvent::DeviceDetached { address } => {
                if self.address == Some(address) {
                    self.detach(address);
                }
                EventAck::Handled
            }
            HostEvent::DeviceAttached { address } => {
                debug!("Host reports device at address {}", address);
                EventAck::Handled
            }
            HostEvent::TransferDone { address, endpoint } => {
                trace!("Transfer done on {} endpoint {:#04x}", address, endpoint);
                EventAck::Handled
            }
            HostEvent::VbusRequestPower
            | HostEvent::VbusReleasePower
            | HostEvent::Suspend
            | HostEvent::Resume => {
                debug!("Host event: {:?}", event);
                EventAck::Handled
            }
            other => {
                let description = other.error_description().unwrap_or("unknown");
                warn!("USB host error: {}", description);
                EventAck::Handled
            }
        }
    }

    fn detach(&mut self, address: DeviceAddress) {
        info!("Device {} detached", address);
        self.reset();
        self.outbox.push(CaptureEvent::DeviceDetached { address });
    }

    fn reset(&mut self) {
        self.address = None;
        self.negotiator.reset();
        self.reassembler.reset();
    }

    fn on_outcome(&mut self, address: DeviceAddress, outcome: Outcome) {
        let event = match outcome {
            Outcome::StreamingStarted => CaptureEvent::StreamingStarted { address },
            Outcome::Restarted { reason } => CaptureEvent::NegotiationFailed {
                address,
                reason,
                fatal: false,
            },
            Outcome::Failed { reason } => CaptureEvent::NegotiationFailed {
                address,
                reason,
                fatal: true,
            },
            Outcome::Unchanged | Outcome::Advanced { .. } => return,
        };
        self.outbox.push(event);
    }
}
