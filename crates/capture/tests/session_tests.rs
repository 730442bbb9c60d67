//! Capture session integration tests
//!
//! Drives a `CaptureSession` against the scripted host the same way the
//! capture worker does: host events first, then one tick.

use capture::usb::mock::{SCRIPTED_PRODUCT_ID, SCRIPTED_VENDOR_ID};
use capture::usb::{
    CaptureSession, ControlStep, HostEvent, HostStack, NegotiationPolicy, NegotiationState,
    Phase, ScriptedHost, SessionConfig, StepKind,
};
use common::CaptureEvent;
use common::test_utils::{UVC_HEADER_LEN, packetize_frames, synthetic_jpeg};
use protocol::{ControlSelector, DeviceAddress, LinkState, RequestCode, TransferCompletion, UsbError};

fn address() -> DeviceAddress {
    DeviceAddress::new(1).unwrap()
}

fn session_with(negotiation: NegotiationPolicy) -> CaptureSession {
    CaptureSession::new(SessionConfig {
        vendor_id: SCRIPTED_VENDOR_ID,
        product_id: SCRIPTED_PRODUCT_ID,
        negotiation,
        ..SessionConfig::default()
    })
    .unwrap()
}

fn session() -> CaptureSession {
    session_with(NegotiationPolicy::default())
}

/// Host events then one tick, like the worker loop
fn step(session: &mut CaptureSession, host: &mut ScriptedHost) {
    for event in host.poll_events() {
        session.handle_event(event);
    }
    session.tick(host);
}

/// Step until `done` holds, returning the number of steps taken
fn step_until<F>(session: &mut CaptureSession, host: &mut ScriptedHost, limit: usize, done: F) -> usize
where
    F: Fn(&CaptureSession) -> bool,
{
    for n in 0..limit {
        if done(session) {
            return n;
        }
        step(session, host);
    }
    assert!(done(session), "condition not reached, state {}", session.state());
    limit
}

fn auto_host() -> ScriptedHost {
    let mut host = ScriptedHost::new();
    host.set_auto_complete(true);
    host
}

const EXPECTED_ORDER: [(RequestCode, ControlSelector); 10] = [
    (RequestCode::GetInfo, ControlSelector::Probe),
    (RequestCode::GetDef, ControlSelector::Probe),
    (RequestCode::GetMin, ControlSelector::Probe),
    (RequestCode::GetMax, ControlSelector::Probe),
    (RequestCode::GetCur, ControlSelector::Probe),
    (RequestCode::SetCur, ControlSelector::Probe),
    (RequestCode::GetCur, ControlSelector::Probe),
    (RequestCode::GetInfo, ControlSelector::Commit),
    (RequestCode::GetCur, ControlSelector::Commit),
    (RequestCode::SetCur, ControlSelector::Commit),
];

#[test]
fn test_full_negotiation_issues_requests_in_order() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();

    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });

    let issued = host.issued();
    assert_eq!(issued.len(), EXPECTED_ORDER.len() + 1);
    for (request, (code, selector)) in issued.iter().zip(EXPECTED_ORDER) {
        assert_eq!(request.request(), Some(code));
        assert_eq!(request.selector(), Some(selector));
        assert_eq!(request.setup.index, 1);
        let expected_len = if code == RequestCode::GetInfo { 1 } else { 26 };
        assert_eq!(request.setup.length, expected_len);
    }

    let set_interface = &issued[EXPECTED_ORDER.len()];
    assert!(set_interface.setup.is_set_interface());
    assert_eq!(set_interface.setup.index, 1);
    assert_eq!(set_interface.setup.value, 6);

    assert!(host.is_streaming());
    assert_eq!(session.status().link, LinkState::Streaming);

    let events = session.drain_events();
    assert!(matches!(events[0], CaptureEvent::DeviceAttached { .. }));
    assert!(matches!(
        events.last(),
        Some(CaptureEvent::StreamingStarted { .. })
    ));
}

#[test]
fn test_set_cur_writes_policy_values() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();
    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });

    let sets: Vec<_> = host
        .issued()
        .iter()
        .filter(|r| r.request() == Some(RequestCode::SetCur))
        .collect();
    assert_eq!(sets.len(), 2);

    // PROBE: format 2, frame 1, 333333 x 100 ns
    assert_eq!(sets[0].data.len(), 26);
    assert_eq!(&sets[0].data[..8], &[0, 0, 2, 1, 0x15, 0x16, 0x05, 0x00]);
    // COMMIT: format 2, frame 1, 2000000 x 100 ns
    assert_eq!(&sets[1].data[..8], &[0, 0, 2, 1, 0x80, 0x84, 0x1E, 0x00]);
    assert!(sets[1].data[8..].iter().all(|&b| b == 0));

    let report = session.negotiator().report();
    assert_eq!(report.probe_info, Some(0x03));
    assert_eq!(report.commit_info, Some(0x03));
    assert_eq!(
        report.negotiated.map(|b| b.frame_interval()),
        Some(333_333)
    );
}

#[test]
fn test_attach_moves_to_first_request_in_one_tick() {
    let mut host = ScriptedHost::new();
    let mut session = session();

    session.tick(&mut host);
    assert_eq!(session.state(), NegotiationState::Idle);

    session.tick(&mut host);
    assert_eq!(session.address(), Some(address()));
    assert_eq!(
        session.state(),
        NegotiationState::Issue(ControlStep::new(Phase::Probe, StepKind::Info))
    );
    assert!(host.issued().is_empty());
}

#[test]
fn test_each_step_waits_for_its_own_completion() {
    let mut host = ScriptedHost::new();
    let mut session = session();
    session.initialize(&mut host).unwrap();

    // Initialize -> Idle -> Issue(first)
    session.tick(&mut host);
    session.tick(&mut host);

    for (n, (code, selector)) in EXPECTED_ORDER.into_iter().enumerate() {
        session.tick(&mut host);
        assert!(
            matches!(session.state(), NegotiationState::Wait(_)),
            "step {} not waiting: {}",
            n,
            session.state()
        );

        // Nothing completes: nothing moves
        for _ in 0..3 {
            session.tick(&mut host);
        }
        assert_eq!(host.issued().len(), n + 1);

        assert!(host.complete_matching(code, selector));
        session.tick(&mut host);
    }

    assert_eq!(session.state(), NegotiationState::SetInterface);
    session.tick(&mut host);
    assert_eq!(session.state(), NegotiationState::WaitSetInterface);
    assert!(host.complete_set_interface());
    session.tick(&mut host);
    assert_eq!(session.state(), NegotiationState::Streaming);
}

#[test]
fn test_out_of_order_completion_does_not_advance() {
    let mut host = ScriptedHost::new();
    let mut session = session();

    for _ in 0..3 {
        session.tick(&mut host);
    }
    let waiting = NegotiationState::Wait(ControlStep::FIRST);
    assert_eq!(session.state(), waiting);

    // A COMMIT answer while PROBE GET_INFO is outstanding is not accepted
    assert!(!host.complete_matching(RequestCode::SetCur, ControlSelector::Commit));
    assert!(!host.complete_set_interface());
    for _ in 0..5 {
        session.tick(&mut host);
    }
    assert_eq!(session.state(), waiting);
    assert_eq!(host.issued().len(), 1);
}

#[test]
fn test_busy_issuance_is_retried() {
    let mut host = ScriptedHost::new();
    host.fail_next_issues(3, UsbError::Busy);
    let mut session = session();

    session.tick(&mut host);
    session.tick(&mut host);
    let issuing = NegotiationState::Issue(ControlStep::FIRST);

    for _ in 0..3 {
        session.tick(&mut host);
        assert_eq!(session.state(), issuing);
    }
    assert!(host.issued().is_empty());

    session.tick(&mut host);
    assert_eq!(session.state(), NegotiationState::Wait(ControlStep::FIRST));
    assert_eq!(host.issued().len(), 1);
}

#[test]
fn test_completion_error_restarts_negotiation() {
    let mut host = ScriptedHost::new();
    let mut session = session();

    // Through PROBE GET_INFO and GET_DEF, then fail GET_MIN
    for _ in 0..3 {
        session.tick(&mut host);
    }
    for _ in 0..2 {
        assert!(host.complete_next());
        session.tick(&mut host);
        session.tick(&mut host);
    }
    assert_eq!(
        session.state(),
        NegotiationState::Wait(ControlStep::new(Phase::Probe, StepKind::Minimum))
    );
    assert!(host.complete_control(TransferCompletion::failed(UsbError::Pipe)));
    session.tick(&mut host);

    assert_eq!(session.state(), NegotiationState::Issue(ControlStep::FIRST));
    assert_eq!(session.negotiator().restarts(), 1);
    assert_eq!(session.address(), Some(address()));

    let events = session.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        CaptureEvent::NegotiationFailed { fatal: false, .. }
    )));
}

#[test]
fn test_restart_budget_parks_in_error_until_detach() {
    let mut host = auto_host();
    host.fail_next_completions(10, UsbError::Timeout);
    let mut session = session_with(NegotiationPolicy {
        max_restarts: 2,
        ..NegotiationPolicy::default()
    });

    step_until(&mut session, &mut host, 50, |s| {
        s.state() == NegotiationState::Error
    });
    assert_eq!(session.status().link, LinkState::Failed);
    let issued = host.issued().len();

    // Parked: no further requests
    for _ in 0..10 {
        step(&mut session, &mut host);
    }
    assert_eq!(host.issued().len(), issued);
    assert!(session.drain_events().iter().any(|e| matches!(
        e,
        CaptureEvent::NegotiationFailed { fatal: true, .. }
    )));

    host.detach();
    step(&mut session, &mut host);
    assert!(session.state().is_initial());
    assert_eq!(session.address(), None);
}

#[test]
fn test_wait_timeout_restarts() {
    let mut host = ScriptedHost::new();
    let mut session = session_with(NegotiationPolicy {
        wait_timeout_ticks: 5,
        max_restarts: 0,
        ..NegotiationPolicy::default()
    });

    for _ in 0..3 {
        session.tick(&mut host);
    }
    assert_eq!(session.state(), NegotiationState::Wait(ControlStep::FIRST));
    for _ in 0..5 {
        session.tick(&mut host);
    }
    assert_eq!(session.state(), NegotiationState::Issue(ControlStep::FIRST));
    assert_eq!(session.negotiator().restarts(), 1);
}

#[test]
fn test_silent_device_exhausts_restart_budget() {
    // Never completes anything
    let mut host = ScriptedHost::new();
    let mut session = session_with(NegotiationPolicy {
        wait_timeout_ticks: 5,
        max_restarts: 2,
        ..NegotiationPolicy::default()
    });

    step_until(&mut session, &mut host, 1000, |s| {
        s.state() == NegotiationState::Error
    });

    // First attempt plus one per restart, each refreshed after abandoning
    // the request that timed out
    let issued = host.issued();
    assert_eq!(issued.len(), 3);
    assert!(issued.iter().all(|r| {
        r.request() == Some(RequestCode::GetInfo) && r.selector() == Some(ControlSelector::Probe)
    }));
    assert!(host.outstanding().is_none());
    assert!(session.drain_events().iter().any(|e| matches!(
        e,
        CaptureEvent::NegotiationFailed { fatal: true, .. }
    )));
}

/// Every tick count from reset to well past Streaming
const DETACH_POINTS: usize = 30;

#[test]
fn test_detach_at_every_state_resets_session() {
    for ticks in 0..DETACH_POINTS {
        let mut host = auto_host();
        let mut session = session();
        session.initialize(&mut host).unwrap();
        for _ in 0..ticks {
            step(&mut session, &mut host);
        }
        let state_before = session.state();
        let was_attached = session.address().is_some();
        session.drain_events();

        host.detach();
        session.tick(&mut host);

        assert_eq!(session.address(), None, "after {} ticks", ticks);
        assert!(
            session.state().is_initial(),
            "after {} ticks ({}): {}",
            ticks,
            state_before,
            session.state()
        );
        assert_eq!(session.reassembler().pending_len(), 0);
        assert_eq!(session.status().stats.total_bytes, 0);
        assert_eq!(session.negotiator().restarts(), 0);

        let detached = session
            .drain_events()
            .iter()
            .filter(|e| matches!(e, CaptureEvent::DeviceDetached { .. }))
            .count();
        assert_eq!(detached, usize::from(was_attached), "after {} ticks", ticks);
    }
}

#[test]
fn test_detach_event_resets_session() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();
    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });

    host.detach();
    // Delivered as a host event before the tick looks at presence
    for event in host.poll_events() {
        session.handle_event(event);
    }
    assert_eq!(session.state(), NegotiationState::Initialize);
    assert_eq!(session.address(), None);
}

#[test]
fn test_repeated_detach_is_idempotent() {
    let mut host = auto_host();
    let mut session = session();
    for _ in 0..6 {
        step(&mut session, &mut host);
    }
    host.detach();
    session.tick(&mut host);
    session.drain_events();

    session.handle_event(HostEvent::DeviceDetached { address: address() });
    session.tick(&mut host);
    session.handle_event(HostEvent::DeviceDetached { address: address() });

    assert!(session.drain_events().is_empty());
    assert_eq!(session.address(), None);
    assert!(session.state().is_initial());
}

#[test]
fn test_reattach_negotiates_again() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();
    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });

    host.detach();
    step(&mut session, &mut host);
    let new_address = DeviceAddress::new(5).unwrap();
    host.attach(new_address, SCRIPTED_VENDOR_ID, SCRIPTED_PRODUCT_ID);

    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });
    assert_eq!(session.address(), Some(new_address));
    assert_eq!(host.issued().len(), 2 * (EXPECTED_ORDER.len() + 1));
}

#[test]
fn test_streamed_frames_are_reassembled() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();
    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });
    session.drain_events();

    let frames: Vec<Vec<u8>> = (0..4).map(|n| synthetic_jpeg(3000 + n * 100, n as u8)).collect();
    host.queue_isochronous(packetize_frames(&frames, 1024 - UVC_HEADER_LEN));
    for _ in 0..20 {
        step(&mut session, &mut host);
    }

    let completed: Vec<_> = session
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CaptureEvent::FrameCompleted { frame } => Some(frame),
            _ => None,
        })
        .collect();

    // The last frame has no closing marker yet
    assert_eq!(completed.len(), 3);
    for (frame, image) in completed.iter().zip(&frames) {
        assert_eq!(frame.size, image.len());
        assert_eq!(frame.data.as_ref(), image.as_slice());
        assert!(!frame.truncated);
    }
    assert_eq!(session.reassembler().pending_len(), frames[3].len());
}

#[test]
fn test_capture_limit_stops_delivery() {
    let mut host = ScriptedHost::simulated_camera(SCRIPTED_VENDOR_ID, SCRIPTED_PRODUCT_ID, 2000);
    let mut config = SessionConfig {
        vendor_id: SCRIPTED_VENDOR_ID,
        product_id: SCRIPTED_PRODUCT_ID,
        ..SessionConfig::default()
    };
    config.reassembler.capture_limit = 2;
    let mut session = CaptureSession::new(config).unwrap();
    session.initialize(&mut host).unwrap();

    step_until(&mut session, &mut host, 200, |s| s.is_complete());
    for _ in 0..20 {
        step(&mut session, &mut host);
    }

    let frames = session
        .drain_events()
        .iter()
        .filter(|e| matches!(e, CaptureEvent::FrameCompleted { .. }))
        .count();
    assert_eq!(frames, 2);
    assert_eq!(session.status().stats.frames_completed, 2);
}

#[test]
fn test_iso_data_from_other_device_ignored() {
    let mut host = auto_host();
    let mut session = session();
    session.initialize(&mut host).unwrap();
    step_until(&mut session, &mut host, 100, |s| {
        s.state() == NegotiationState::Streaming
    });

    let ack = session.handle_event(HostEvent::IsochronousData {
        address: DeviceAddress::new(9).unwrap(),
        data: bytes::Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0]),
    });
    assert_eq!(ack, capture::usb::EventAck::Ignored);
    assert_eq!(session.status().stats.total_bytes, 0);
}

#[test]
fn test_find_device_requires_matching_ids() {
    let mut host = ScriptedHost::without_device();
    host.attach(address(), 0x1234, 0x5678);
    let mut session = session();

    for _ in 0..5 {
        step(&mut session, &mut host);
    }
    assert_eq!(session.state(), NegotiationState::Idle);
    assert!(host.find_device(0x1234, 0x5678).is_some());
    assert!(host.issued().is_empty());
}
