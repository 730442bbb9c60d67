//! PROBE/COMMIT negotiation state machine
//!
//! One state is consumed per poll. Every control step is a pair of states:
//! `Issue(step)` enqueues the request and moves to `Wait(step)` only when the
//! host accepted it (otherwise it stays put and retries on the next poll);
//! `Wait(step)` polls the control endpoint and moves to the next step once
//! the transfer completed successfully.
//!
//! ```text
//! PROBE : GET_INFO -> GET_DEF -> GET_MIN -> GET_MAX -> GET_CUR -> SET_CUR -> GET_CUR (verify)
//! COMMIT: GET_INFO -> GET_CUR -> SET_CUR
//! then  : SET_INTERFACE -> first isochronous read -> Streaming
//! ```
//!
//! The values written before each SET_CUR come from [`NegotiationPolicy`],
//! never from what the device reported through GET_MIN/GET_MAX/GET_DEF. Those
//! answers are kept in [`DeviceReport`] for diagnostics only.

use crate::usb::control::ControlChannel;
use crate::usb::host::HostStack;
use protocol::{
    ControlSelector, LinkState, ParameterBlock, RequestCode, StreamFormat, TransferCompletion,
    UVC10_BLOCK_LEN,
};
use std::fmt;
use tracing::{debug, error, info, warn};

/// Negotiation phase, selects the control selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Probe,
    Commit,
}

impl Phase {
    pub fn selector(self) -> ControlSelector {
        match self {
            Self::Probe => ControlSelector::Probe,
            Self::Commit => ControlSelector::Commit,
        }
    }

    fn steps(self) -> &'static [StepKind] {
        match self {
            Self::Probe => &PROBE_STEPS,
            Self::Commit => &COMMIT_STEPS,
        }
    }
}

/// What a control step asks the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StepKind {
    /// GET_INFO: capability byte
    Info,
    /// GET_DEF
    Default,
    /// GET_MIN
    Minimum,
    /// GET_MAX
    Maximum,
    /// GET_CUR before applying
    Current,
    /// SET_CUR with policy values
    Apply,
    /// GET_CUR after applying
    Verify,
}

impl StepKind {
    pub fn request(self) -> RequestCode {
        match self {
            Self::Info => RequestCode::GetInfo,
            Self::Default => RequestCode::GetDef,
            Self::Minimum => RequestCode::GetMin,
            Self::Maximum => RequestCode::GetMax,
            Self::Current | Self::Verify => RequestCode::GetCur,
            Self::Apply => RequestCode::SetCur,
        }
    }
}

const PROBE_STEPS: [StepKind; 7] = [
    StepKind::Info,
    StepKind::Default,
    StepKind::Minimum,
    StepKind::Maximum,
    StepKind::Current,
    StepKind::Apply,
    StepKind::Verify,
];

const COMMIT_STEPS: [StepKind; 3] = [StepKind::Info, StepKind::Current, StepKind::Apply];

/// One request of the negotiation, with the context needed to issue it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ControlStep {
    pub phase: Phase,
    pub kind: StepKind,
}

impl ControlStep {
    /// Entry point of every negotiation
    pub const FIRST: Self = Self {
        phase: Phase::Probe,
        kind: StepKind::Info,
    };

    pub fn new(phase: Phase, kind: StepKind) -> Self {
        Self { phase, kind }
    }

    pub fn request(self) -> RequestCode {
        self.kind.request()
    }

    pub fn selector(self) -> ControlSelector {
        self.phase.selector()
    }

    /// Following step, crossing from PROBE into COMMIT; `None` after COMMIT's SET_CUR
    pub fn next(self) -> Option<Self> {
        let steps = self.phase.steps();
        let position = steps.iter().position(|&k| k == self.kind)?;
        match steps.get(position + 1) {
            Some(&kind) => Some(Self::new(self.phase, kind)),
            None if self.phase == Phase::Probe => Some(Self::new(Phase::Commit, COMMIT_STEPS[0])),
            None => None,
        }
    }

    /// Every step in negotiation order
    pub fn sequence() -> impl Iterator<Item = Self> {
        std::iter::successors(Some(Self::FIRST), |step| step.next())
    }
}

impl fmt::Display for ControlStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.request(), self.selector())?;
        if self.kind == StepKind::Verify {
            f.write_str(" (verify)")?;
        }
        Ok(())
    }
}

/// Negotiation state; exactly one is active
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NegotiationState {
    /// Just reset; becomes Idle on the next tick
    Initialize,
    /// Waiting for a matching device
    Idle,
    /// Enqueue the step's request
    Issue(ControlStep),
    /// Wait for the step's request to complete
    Wait(ControlStep),
    /// Enqueue SET_INTERFACE
    SetInterface,
    /// Wait for SET_INTERFACE to complete
    WaitSetInterface,
    /// SET_INTERFACE done; first isochronous read not yet accepted
    StartStreaming,
    /// Isochronous stream running (terminal until detach)
    Streaming,
    /// Restart budget exhausted (terminal until detach)
    Error,
}

impl NegotiationState {
    /// States allowed while no device is attached
    pub fn is_initial(self) -> bool {
        matches!(self, Self::Initialize | Self::Idle)
    }

    pub fn link_state(self) -> LinkState {
        match self {
            Self::Initialize | Self::Idle => LinkState::Detached,
            Self::Streaming => LinkState::Streaming,
            Self::Error => LinkState::Failed,
            _ => LinkState::Negotiating,
        }
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialize => f.write_str("Initialize"),
            Self::Idle => f.write_str("Idle"),
            Self::Issue(step) => write!(f, "Issue({})", step),
            Self::Wait(step) => write!(f, "Wait({})", step),
            Self::SetInterface => f.write_str("SetInterface"),
            Self::WaitSetInterface => f.write_str("WaitSetInterface"),
            Self::StartStreaming => f.write_str("StartStreaming"),
            Self::Streaming => f.write_str("Streaming"),
            Self::Error => f.write_str("Error"),
        }
    }
}

/// Fixed values the negotiation requests, whatever the device reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiationPolicy {
    /// Video streaming interface number (wIndex of class requests)
    pub interface: u8,
    /// Alternate setting selected by SET_INTERFACE
    pub alternate_setting: u8,
    /// Isochronous IN endpoint
    pub iso_endpoint: u8,
    /// Parameter block length (26 or 34)
    pub block_len: usize,
    /// Written before PROBE SET_CUR
    pub probe: StreamFormat,
    /// Written before COMMIT SET_CUR
    pub commit: StreamFormat,
    /// Polls a wait state may last before it counts as failed (0 = forever)
    pub wait_timeout_ticks: u32,
    /// Restarts allowed before parking in Error (0 = unlimited)
    pub max_restarts: u32,
}

impl Default for NegotiationPolicy {
    fn default() -> Self {
        Self {
            interface: 1,
            alternate_setting: 6,
            iso_endpoint: 0x81,
            block_len: UVC10_BLOCK_LEN,
            probe: StreamFormat::PROBE_BASELINE,
            commit: StreamFormat::COMMIT_TARGET,
            wait_timeout_ticks: 0,
            max_restarts: 3,
        }
    }
}

/// What the device answered during negotiation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceReport {
    pub probe_info: Option<u8>,
    pub commit_info: Option<u8>,
    pub default: Option<ParameterBlock>,
    pub minimum: Option<ParameterBlock>,
    pub maximum: Option<ParameterBlock>,
    pub current: Option<ParameterBlock>,
    /// PROBE GET_CUR after SET_CUR
    pub negotiated: Option<ParameterBlock>,
    /// COMMIT GET_CUR before SET_CUR
    pub commit_current: Option<ParameterBlock>,
}

/// Result of one poll
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Nothing to do, request not accepted, or transfer still in flight
    Unchanged,
    /// Moved to the next state
    Advanced {
        from: NegotiationState,
        to: NegotiationState,
    },
    /// First isochronous read accepted; now Streaming
    StreamingStarted,
    /// A transfer failed; negotiation restarted from PROBE GET_INFO
    Restarted { reason: String },
    /// A transfer failed and the restart budget is spent; now Error
    Failed { reason: String },
}

/// PROBE/COMMIT negotiator for one attached device
pub struct Negotiator {
    policy: NegotiationPolicy,
    state: NegotiationState,
    /// Live block for the PROBE phase
    probe: ParameterBlock,
    /// Live block for the COMMIT phase
    commit: ParameterBlock,
    report: DeviceReport,
    waited_ticks: u32,
    restarts: u32,
}

impl Negotiator {
    pub fn new(policy: NegotiationPolicy) -> protocol::Result<Self> {
        policy.probe.validate()?;
        policy.commit.validate()?;
        let probe = ParameterBlock::new(policy.block_len)?;
        let commit = ParameterBlock::new(policy.block_len)?;

        Ok(Self {
            policy,
            state: NegotiationState::Initialize,
            probe,
            commit,
            report: DeviceReport::default(),
            waited_ticks: 0,
            restarts: 0,
        })
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn policy(&self) -> &NegotiationPolicy {
        &self.policy
    }

    pub fn report(&self) -> &DeviceReport {
        &self.report
    }

    pub fn restarts(&self) -> u32 {
        self.restarts
    }

    /// Parameter block of `phase` as last written or read
    pub fn block(&self, phase: Phase) -> &ParameterBlock {
        match phase {
            Phase::Probe => &self.probe,
            Phase::Commit => &self.commit,
        }
    }

    /// Back to `Initialize`, forgetting everything learned from the device
    pub fn reset(&mut self) {
        self.state = NegotiationState::Initialize;
        self.probe.clear();
        self.commit.clear();
        self.report = DeviceReport::default();
        self.waited_ticks = 0;
        self.restarts = 0;
    }

    /// `Initialize` -> `Idle`
    pub fn enter_idle(&mut self) -> Outcome {
        if self.state == NegotiationState::Initialize {
            self.transition(NegotiationState::Idle)
        } else {
            Outcome::Unchanged
        }
    }

    /// Leave `Idle` for the first PROBE step once a device is attached
    pub fn begin(&mut self) -> Outcome {
        if !self.state.is_initial() {
            return Outcome::Unchanged;
        }
        self.restarts = 0;
        self.transition(NegotiationState::Issue(ControlStep::FIRST))
    }

    /// Advance at most one state
    pub fn poll<H: HostStack + ?Sized>(&mut self, channel: &mut ControlChannel<'_, H>) -> Outcome {
        match self.state {
            NegotiationState::Initialize
            | NegotiationState::Idle
            | NegotiationState::Streaming
            | NegotiationState::Error => Outcome::Unchanged,
            NegotiationState::Issue(step) => self.issue(channel, step),
            NegotiationState::Wait(step) => match channel.poll_completion() {
                None => self.keep_waiting(channel, &step.to_string()),
                Some(completion) if !completion.is_success() => {
                    self.fail(format!("{} failed: {:?}", step, completion.status))
                }
                Some(completion) => {
                    self.record(step, &completion);
                    let next = step
                        .next()
                        .map(NegotiationState::Issue)
                        .unwrap_or(NegotiationState::SetInterface);
                    self.transition(next)
                }
            },
            NegotiationState::SetInterface => {
                match channel.set_interface(self.policy.interface, self.policy.alternate_setting) {
                    Ok(()) => {
                        self.waited_ticks = 0;
                        self.transition(NegotiationState::WaitSetInterface)
                    }
                    Err(_) => Outcome::Unchanged,
                }
            }
            NegotiationState::WaitSetInterface => match channel.poll_completion() {
                None => self.keep_waiting(channel, "SET_INTERFACE"),
                Some(completion) if !completion.is_success() => {
                    self.fail(format!("SET_INTERFACE failed: {:?}", completion.status))
                }
                Some(_) => {
                    debug!(
                        "OK SET_INTERFACE (interface={}, alternate={})",
                        self.policy.interface, self.policy.alternate_setting
                    );
                    self.state = NegotiationState::StartStreaming;
                    self.start_streaming(channel)
                }
            },
            NegotiationState::StartStreaming => self.start_streaming(channel),
        }
    }

    fn issue<H: HostStack + ?Sized>(
        &mut self,
        channel: &mut ControlChannel<'_, H>,
        step: ControlStep,
    ) -> Outcome {
        let block_len = self.policy.block_len as u16;
        let result = match step.kind {
            StepKind::Info => channel.send_control_request(
                step.request(),
                step.selector(),
                self.policy.interface.into(),
                &[],
                1,
            ),
            StepKind::Apply => {
                let format = match step.phase {
                    Phase::Probe => self.policy.probe,
                    Phase::Commit => self.policy.commit,
                };
                let block = self.block_mut(step.phase);
                block.apply(&format);
                let block = *block;
                channel.send_control_request(
                    step.request(),
                    step.selector(),
                    self.policy.interface.into(),
                    block.as_bytes(),
                    block_len,
                )
            }
            _ => channel.send_control_request(
                step.request(),
                step.selector(),
                self.policy.interface.into(),
                &[],
                block_len,
            ),
        };

        match result {
            Ok(()) => {
                self.waited_ticks = 0;
                self.transition(NegotiationState::Wait(step))
            }
            // Not enqueued; same state, try again next poll
            Err(_) => Outcome::Unchanged,
        }
    }

    fn start_streaming<H: HostStack + ?Sized>(
        &mut self,
        channel: &mut ControlChannel<'_, H>,
    ) -> Outcome {
        match channel.read_isochronous(self.policy.iso_endpoint) {
            Ok(()) => {
                info!(
                    "Streaming started on endpoint {:#04x} (device {})",
                    self.policy.iso_endpoint,
                    channel.address()
                );
                self.state = NegotiationState::Streaming;
                Outcome::StreamingStarted
            }
            Err(e) => {
                debug!("Isochronous read not started yet: {}", e);
                Outcome::Unchanged
            }
        }
    }

    /// Store what a completed step returned
    fn record(&mut self, step: ControlStep, completion: &TransferCompletion) {
        debug!(
            "OK {} ({} bytes): {}",
            step,
            completion.byte_count,
            hex(&completion.data)
        );

        match step.kind {
            StepKind::Info => {
                let info = completion.data.first().copied();
                if let Some(bits) = info {
                    debug!(
                        "{} capabilities: get={} set={} autoupdate={} async={}",
                        step.selector(),
                        bits & 0x01 != 0,
                        bits & 0x02 != 0,
                        bits & 0x08 != 0,
                        bits & 0x10 != 0
                    );
                }
                match step.phase {
                    Phase::Probe => self.report.probe_info = info,
                    Phase::Commit => self.report.commit_info = info,
                }
            }
            StepKind::Apply => {}
            kind => {
                let block = self.block_mut(step.phase);
                let kept = block.copy_prefix(&completion.data);
                let snapshot = Some(*block);
                if kept < completion.data.len() {
                    warn!(
                        "{} returned {} bytes, keeping the first {}",
                        step,
                        completion.data.len(),
                        kept
                    );
                }

                match (step.phase, kind) {
                    (Phase::Probe, StepKind::Default) => self.report.default = snapshot,
                    (Phase::Probe, StepKind::Minimum) => self.report.minimum = snapshot,
                    (Phase::Probe, StepKind::Maximum) => self.report.maximum = snapshot,
                    (Phase::Probe, StepKind::Current) => self.report.current = snapshot,
                    (Phase::Probe, StepKind::Verify) => {
                        self.report.negotiated = snapshot;
                        self.check_negotiated();
                    }
                    (Phase::Commit, StepKind::Current) => self.report.commit_current = snapshot,
                    _ => {}
                }
            }
        }
    }

    /// Compare the verified PROBE block with what was requested
    fn check_negotiated(&self) {
        let got = self.probe.stream_format();
        let wanted = self.policy.probe;
        if got.format_index != wanted.format_index || got.frame_index != wanted.frame_index {
            warn!("Device adjusted PROBE: requested {}, got {}", wanted, got);
        } else if got.frame_interval != wanted.frame_interval {
            debug!(
                "Device adjusted PROBE frame interval: {} -> {}",
                wanted.frame_interval, got.frame_interval
            );
        } else {
            debug!("PROBE verified: {}", got);
        }
    }

    fn keep_waiting<H: HostStack + ?Sized>(
        &mut self,
        channel: &mut ControlChannel<'_, H>,
        what: &str,
    ) -> Outcome {
        self.waited_ticks = self.waited_ticks.saturating_add(1);
        let timeout = self.policy.wait_timeout_ticks;
        if timeout != 0 && self.waited_ticks >= timeout {
            // The host would refuse every new request while this one is pending
            channel.abandon();
            return self.fail(format!("{} timed out after {} polls", what, self.waited_ticks));
        }
        Outcome::Unchanged
    }

    fn fail(&mut self, reason: String) -> Outcome {
        self.waited_ticks = 0;
        self.restarts += 1;

        let budget = self.policy.max_restarts;
        if budget != 0 && self.restarts > budget {
            error!(
                "Negotiation abandoned after {} restarts: {}",
                budget, reason
            );
            self.state = NegotiationState::Error;
            return Outcome::Failed { reason };
        }

        warn!(
            "Restarting negotiation (attempt {}): {}",
            self.restarts, reason
        );
        self.probe.clear();
        self.commit.clear();
        self.state = NegotiationState::Issue(ControlStep::FIRST);
        Outcome::Restarted { reason }
    }

    fn transition(&mut self, to: NegotiationState) -> Outcome {
        let from = std::mem::replace(&mut self.state, to);
        debug!("Negotiation: {} -> {}", from, to);
        Outcome::Advanced { from, to }
    }

    fn block_mut(&mut self, phase: Phase) -> &mut ParameterBlock {
        match phase {
            Phase::Probe => &mut self.probe,
            Phase::Commit => &mut self.commit,
        }
    }
}

fn hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
