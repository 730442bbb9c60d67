//! Capture worker thread
//!
//! Dedicated thread that owns the host stack and the capture session. Each
//! iteration:
//! 1. Answers pending commands from the Tokio runtime (non-blocking)
//! 2. Drains host stack events into the session (isochronous data included)
//! 3. Runs one session tick
//! 4. Forwards session events to the Tokio runtime
//!
//! Host events and the tick run on this one thread, so the session's frame
//! buffer never has two writers.

use crate::usb::host::{EventAck, HostStack};
use crate::usb::session::{CaptureSession, SessionConfig};
use common::{CaptureCommand, CaptureWorker};
use protocol::UsbError;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Capture worker thread state
pub struct CaptureWorkerThread<H: HostStack> {
    host: H,
    session: CaptureSession,
    worker: CaptureWorker,
    tick_interval: Duration,
}

impl<H: HostStack> CaptureWorkerThread<H> {
    /// Create the worker and allocate the host's isochronous buffers
    pub fn new(
        mut host: H,
        config: SessionConfig,
        worker: CaptureWorker,
        tick_interval: Duration,
    ) -> common::Result<Self> {
        let mut session = CaptureSession::new(config)?;
        session.initialize(&mut host)?;

        Ok(Self {
            host,
            session,
            worker,
            tick_interval,
        })
    }

    pub fn session(&self) -> &CaptureSession {
        &self.session
    }

    /// Run until Shutdown, or until every bridge handle is gone
    pub fn run(mut self) -> common::Result<()> {
        info!("Capture worker thread started");

        loop {
            match self.worker.try_recv_command() {
                Some(CaptureCommand::Shutdown) => {
                    info!("Capture worker shutting down");
                    break;
                }
                Some(cmd) => self.handle_command(cmd),
                None if self.worker.is_disconnected() => {
                    info!("Capture bridge closed, stopping worker");
                    break;
                }
                None => {}
            }

            match self.step() {
                Ok(()) => {}
                // Front-end dropped the bridge while we were forwarding events
                Err(_) if self.worker.is_disconnected() => {
                    info!("Capture bridge closed, stopping worker");
                    break;
                }
                Err(e) => return Err(e),
            }

            if !self.tick_interval.is_zero() {
                std::thread::sleep(self.tick_interval);
            }
        }

        info!("Capture worker thread stopped");
        Ok(())
    }

    /// One pass of the main loop without command handling or sleeping
    pub fn step(&mut self) -> common::Result<()> {
        for event in self.host.poll_events() {
            if self.session.handle_event(event) == EventAck::Ignored {
                trace!("Host event ignored");
            }
        }

        self.session.tick(&mut self.host);

        for event in self.session.drain_events() {
            self.worker.send_event(event)?;
        }
        Ok(())
    }

    fn handle_command(&mut self, cmd: CaptureCommand) {
        match cmd {
            CaptureCommand::GetStatus { response } => {
                let status = self.session.status();
                debug!("Status requested: {}", status.state);
                let _ = response.send(status);
            }
            CaptureCommand::Shutdown => {
                // Handled in the main loop
            }
        }
    }
}

/// Spawn the capture worker thread
///
/// The host stack is built on the new thread by `make_host`, since libusb
/// handles and in-flight transfers must stay on the thread that polls them.
pub fn spawn_capture_worker<H, F>(
    worker: CaptureWorker,
    config: SessionConfig,
    tick_interval: Duration,
    make_host: F,
) -> std::io::Result<JoinHandle<common::Result<()>>>
where
    H: HostStack,
    F: FnOnce() -> Result<H, UsbError> + Send + 'static,
{
    std::thread::Builder::new()
        .name("capture-worker".to_string())
        .spawn(move || {
            let host = make_host()?;
            CaptureWorkerThread::new(host, config, worker, tick_interval)?.run()
        })
}
