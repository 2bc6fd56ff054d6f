use crate::{
    configure_device, session_timestamp, AcquisitionDevice, AcquisitionSession, Conf, DaqError,
    Result, SessionRecord, SessionRecorder, Timing,
};
use crossbeam_channel::tick;
use log::{error, info, warn};
use std::{fmt, sync::Arc, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    Idle,
    Configured,
    Running,
    /// Finite acquisition finished on its own.
    Completed,
    /// Cut short by an operator request or a fault.
    Stopped,
}

impl AcquisitionState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Configured => "configured",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

impl fmt::Display for AcquisitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the host loop's tick callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Continue,
    StopRequested,
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub state: AcquisitionState,
    pub fault: Option<DaqError>,
    pub samples_acquired: usize,
}

/// Drives one finite acquisition from configuration to a terminal state.
///
/// `Idle → Configured → Running → Completed`, or `Running → Stopped` on an
/// operator stop or a fault. The device is stopped and closed on every exit
/// path, including drop.
pub struct StreamingAcquisitionController<D: AcquisitionDevice> {
    device: D,
    conf: Conf,
    poll_interval: Duration,
    state: AcquisitionState,
    session: Option<Arc<AcquisitionSession>>,
    released: bool,
}

impl<D: AcquisitionDevice> StreamingAcquisitionController<D> {
    pub fn new(device: D, conf: Conf) -> Self {
        let poll_interval = conf.event_interval();
        Self {
            device,
            conf,
            poll_interval,
            state: AcquisitionState::Idle,
            session: None,
            released: false,
        }
    }

    /// Poll the completion flag at `interval` instead of the redraw cadence.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn state(&self) -> AcquisitionState {
        self.state
    }

    pub fn conf(&self) -> &Conf {
        &self.conf
    }

    pub fn session(&self) -> Option<&Arc<AcquisitionSession>> {
        self.session.as_ref()
    }

    fn expect_state(&self, expected: AcquisitionState, op: &'static str) -> Result<()> {
        if self.state != expected {
            return Err(DaqError::InvalidState {
                from: self.state.as_str(),
                op,
            });
        }
        Ok(())
    }

    /// Register channels and a rising-edge finite sample clock on the device.
    pub fn configure(&mut self) -> Result<()> {
        self.expect_state(AcquisitionState::Idle, "configure")?;
        let res = self
            .conf
            .validate()
            .and_then(|_| configure_device(&mut self.device, &self.conf))
            .and_then(|_| {
                self.device.configure_timing(Timing::finite(
                    self.conf.run_settings.sample_rate,
                    self.conf.total_samples(),
                ))
            });
        if let Err(e) = res {
            error!("device configuration failed: {e}");
            self.abort();
            return Err(e);
        }

        self.session = Some(Arc::new(AcquisitionSession::from_conf(&self.conf)));
        self.state = AcquisitionState::Configured;
        info!(
            "configured {} channel(s), {} S/s, {} samples per channel in chunks of {}",
            self.conf.channels.len(),
            self.conf.run_settings.sample_rate,
            self.conf.total_samples(),
            self.conf.chunk_size()
        );
        Ok(())
    }

    /// Register both callbacks and start the device.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(AcquisitionState::Configured, "start")?;
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => return Err(DaqError::InvalidState { from: "configured", op: "start" }),
        };
        let res = self.device.reader().and_then(|reader| {
            self.device
                .register_every_n_samples(session.chunk_size(), session.chunk_handler(reader))?;
            self.device.register_done(session.done_handler())?;
            self.device.start()
        });
        if let Err(e) = res {
            error!("failed to start acquisition: {e}");
            self.abort();
            return Err(e);
        }
        self.state = AcquisitionState::Running;
        info!("acquisition started");
        Ok(())
    }

    /// Host loop: every poll interval call `on_tick`, until the device reports
    /// completion, a fault is recorded, or `on_tick` asks to stop.
    pub fn run<F>(&mut self, mut on_tick: F) -> Result<SessionOutcome>
    where
        F: FnMut(&AcquisitionSession) -> Tick,
    {
        self.expect_state(AcquisitionState::Running, "run")?;
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => return Err(DaqError::InvalidState { from: "running", op: "run" }),
        };

        let ticker = tick(self.poll_interval);
        loop {
            let _ = ticker.recv();
            if on_tick(&*session) == Tick::StopRequested {
                warn!(
                    "stop requested at {} of {} samples",
                    session.next_offset(),
                    session.total_samples()
                );
                break;
            }
            if session.should_stop() {
                break;
            }
        }
        self.stop()
    }

    /// Halt the device and settle into `Completed` or `Stopped`.
    ///
    /// Faults recorded by the callbacks are returned in the outcome rather than
    /// as an error, so the partial buffer can still be persisted.
    pub fn stop(&mut self) -> Result<SessionOutcome> {
        self.expect_state(AcquisitionState::Running, "stop")?;
        let release = self.release();

        let (fault, complete, samples_acquired) = match &self.session {
            Some(session) => (session.take_fault(), session.is_complete(), session.next_offset()),
            None => (None, false, 0),
        };
        let fault = match (fault, release) {
            (Some(fault), _) => Some(fault),
            (None, Err(e)) => Some(e),
            (None, Ok(())) => None,
        };
        self.state = if complete && fault.is_none() {
            AcquisitionState::Completed
        } else {
            AcquisitionState::Stopped
        };
        info!(
            "acquisition {} with {samples_acquired} of {} samples",
            self.state,
            self.conf.total_samples()
        );
        Ok(SessionOutcome {
            state: self.state,
            fault,
            samples_acquired,
        })
    }

    fn abort(&mut self) {
        if let Err(e) = self.release() {
            warn!("error releasing device: {e}");
        }
        self.state = AcquisitionState::Stopped;
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let stopped = self.device.stop();
        let closed = self.device.close();
        stopped.and(closed)
    }
}

impl<D: AcquisitionDevice> Drop for StreamingAcquisitionController<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("error releasing device on drop: {e}");
        }
    }
}

/// One full session: refuse duplicate names before touching the device, acquire,
/// then persist whatever is in the buffer, even after a fault.
pub fn run_session<D, F>(
    controller: &mut StreamingAcquisitionController<D>,
    recorder: &SessionRecorder,
    on_tick: F,
) -> Result<SessionOutcome>
where
    D: AcquisitionDevice,
    F: FnMut(&AcquisitionSession) -> Tick,
{
    let name = controller.conf().run_settings.session_name.clone();
    recorder.ensure_new_session(&name)?;

    controller.configure()?;
    controller.start()?;
    let outcome = controller.run(on_tick)?;

    if let Some(session) = controller.session() {
        let buffer = session.buffer();
        let written = recorder.write_session(&SessionRecord {
            name: &name,
            timestamp: session_timestamp(),
            sample_rate: session.sample_rate(),
            total_time: controller.conf().run_settings.total_time,
            channels: session.channels(),
            buffer: &buffer,
        });
        if let Err(e) = written {
            if let Some(fault) = &outcome.fault {
                error!("session '{name}' not saved; acquisition had already failed: {fault}");
            }
            return Err(e);
        }
        info!("END of case: {name}");
    }
    Ok(outcome)
}
