//! USB subsystem
//!
//! Everything that talks to the camera, bottom-up:
//! - [`host`]: the host stack seam and its events
//! - [`control`]: typed class requests on top of the seam
//! - [`negotiation`]: PROBE/COMMIT state machine
//! - [`reassembler`]: marker-delimited frame reassembly
//! - [`session`]: attach/detach monitor tying the above together
//! - [`worker`]: the dedicated thread the session runs on
//!
//! Host stacks: [`rusb_host`] drives real hardware through libusb
//! (with [`device`], [`transfers`], [`manager`] and [`iso`] underneath);
//! [`mock`] is the scripted camera used by tests and `--simulate`.

pub mod control;
pub mod device;
pub mod host;
pub mod iso;
pub mod manager;
pub mod mock;
pub mod negotiation;
pub mod reassembler;
pub mod rusb_host;
pub mod session;
pub mod transfers;
pub mod worker;

// Re-export public types
pub use control::ControlChannel;
pub use host::{CONTROL_ENDPOINT, EventAck, HostEvent, HostStack};
pub use mock::ScriptedHost;
pub use negotiation::{
    ControlStep, DeviceReport, NegotiationPolicy, NegotiationState, Negotiator, Outcome, Phase,
    StepKind,
};
pub use reassembler::{FrameReassembler, OverflowPolicy, ReassemblerConfig};
pub use rusb_host::RusbHost;
pub use session::{CaptureSession, SessionConfig};
pub use worker::{CaptureWorkerThread, spawn_capture_worker};
