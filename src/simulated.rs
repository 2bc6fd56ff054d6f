//! Software stand-in for a USB analog-input device.
//!
//! Behaves like a small multifunction DAQ: `Dev<N>/ai<M>` channel names, a ±10 V
//! input range, an aggregate sample-rate ceiling and a driver thread that fires
//! the every-N and done callbacks. Faults can be injected to exercise the
//! timeout and hardware-fault paths.

use crate::{
    AcquisitionDevice, ChunkReader, DaqError, DoneCallback, DoneStatus, EveryNCallback, Result,
    SampleMode, TerminalConfig, Timing,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, warn};
use ndarray::{s, Array2};
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    f64::consts::TAU,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

const INPUT_LIMIT_V: f64 = 10.0;
const FIFO_CHUNKS: usize = 8;

/// Produces the voltage of `channel` at sample index `i`.
pub type SignalFn = Box<dyn FnMut(usize, usize) -> f64 + Send>;

#[derive(Debug, Clone)]
struct SimChannel {
    id: String,
    min: f64,
    max: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceState {
    Idle,
    Running,
    Closed,
}

pub struct SimulatedDevice {
    name: String,
    max_channels: usize,
    max_aggregate_rate: f64,
    channels: Vec<SimChannel>,
    timing: Option<Timing>,
    every_n: Option<(usize, EveryNCallback)>,
    done: Option<DoneCallback>,
    signal: Option<SignalFn>,
    pace: bool,
    stall_at: Option<usize>,
    fault_at: Option<(usize, String)>,
    fifo_tx: Sender<Array2<f64>>,
    fifo_rx: Receiver<Array2<f64>>,
    stop_flag: Arc<AtomicBool>,
    driver: Option<JoinHandle<()>>,
    state: DeviceState,
}

impl SimulatedDevice {
    pub fn new(name: &str) -> Self {
        let (fifo_tx, fifo_rx) = bounded(FIFO_CHUNKS);
        Self {
            name: name.to_string(),
            max_channels: 8,
            max_aggregate_rate: 10_000.0,
            channels: Vec::new(),
            timing: None,
            every_n: None,
            done: None,
            signal: None,
            pace: true,
            stall_at: None,
            fault_at: None,
            fifo_tx,
            fifo_rx,
            stop_flag: Arc::new(AtomicBool::new(false)),
            driver: None,
            state: DeviceState::Idle,
        }
    }

    pub fn with_max_aggregate_rate(mut self, rate: f64) -> Self {
        self.max_aggregate_rate = rate;
        self
    }

    /// Replace the default noisy sine with a deterministic generator.
    pub fn with_signal(mut self, signal: impl FnMut(usize, usize) -> f64 + Send + 'static) -> Self {
        self.signal = Some(Box::new(signal));
        self
    }

    /// When off, chunks are produced as fast as the callbacks consume them.
    pub fn pace(mut self, pace: bool) -> Self {
        self.pace = pace;
        self
    }

    /// Fire the every-N callback for chunk `k` without putting data in the FIFO.
    pub fn stall_at_chunk(mut self, k: usize) -> Self {
        self.stall_at = Some(k);
        self
    }

    /// Report a driver fault through the done callback instead of delivering chunk `k`.
    pub fn fault_at_chunk(mut self, k: usize, msg: &str) -> Self {
        self.fault_at = Some((k, msg.to_string()));
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == DeviceState::Running
    }

    fn parse_channel(&self, physical_channel: &str) -> Result<()> {
        let bad = || DaqError::config(format!("invalid physical channel '{physical_channel}'"));
        let (dev, ai) = physical_channel.split_once('/').ok_or_else(bad)?;
        if dev != self.name {
            return Err(DaqError::config(format!(
                "device '{dev}' not found (available: {})",
                self.name
            )));
        }
        let index: usize = ai.strip_prefix("ai").ok_or_else(bad)?.parse().map_err(|_| bad())?;
        if index >= self.max_channels {
            return Err(bad());
        }
        Ok(())
    }

    fn require_idle(&self, op: &'static str) -> Result<()> {
        match self.state {
            DeviceState::Idle => Ok(()),
            DeviceState::Running => Err(DaqError::InvalidState { from: "running", op }),
            DeviceState::Closed => Err(DaqError::InvalidState { from: "closed", op }),
        }
    }

    fn default_signal(channels: &[SimChannel], rate: f64) -> SignalFn {
        let ranges: Vec<(f64, f64)> = channels.iter().map(|c| (c.min, c.max)).collect();
        let mut rng = StdRng::from_os_rng();
        Box::new(move |ch, i| {
            let (min, max) = ranges[ch];
            let mid = 0.5 * (min + max);
            let span = max - min;
            let t = i as f64 / rate;
            let freq = 0.5 + 0.25 * ch as f64;
            mid + 0.3 * span * (TAU * freq * t).sin() + 0.05 * span * rng.random_range(-1.0..1.0)
        })
    }
}

impl AcquisitionDevice for SimulatedDevice {
    fn add_voltage_channel(
        &mut self,
        physical_channel: &str,
        terminal: TerminalConfig,
        min_val: f64,
        max_val: f64,
    ) -> Result<()> {
        self.require_idle("add a channel")?;
        self.parse_channel(physical_channel)?;
        if self.channels.iter().any(|c| c.id == physical_channel) {
            return Err(DaqError::config(format!(
                "physical channel '{physical_channel}' already in task"
            )));
        }
        if !(min_val < max_val) || min_val < -INPUT_LIMIT_V || max_val > INPUT_LIMIT_V {
            return Err(DaqError::config(format!(
                "{physical_channel}: unsupported input range [{min_val}, {max_val}] V"
            )));
        }
        debug!("{}: added {physical_channel} ({terminal:?}, {min_val}..{max_val} V)", self.name);
        self.channels.push(SimChannel {
            id: physical_channel.to_string(),
            min: min_val,
            max: max_val,
        });
        Ok(())
    }

    fn configure_timing(&mut self, timing: Timing) -> Result<()> {
        self.require_idle("configure timing")?;
        if self.channels.is_empty() {
            return Err(DaqError::config("no channels in task"));
        }
        let aggregate = timing.rate * self.channels.len() as f64;
        if !(timing.rate > 0.0) || aggregate > self.max_aggregate_rate {
            return Err(DaqError::config(format!(
                "aggregate rate {aggregate} S/s outside (0, {}]",
                self.max_aggregate_rate
            )));
        }
        if timing.mode == SampleMode::Finite && timing.samples_per_channel == 0 {
            return Err(DaqError::config("finite acquisition needs a sample count"));
        }
        self.timing = Some(timing);
        Ok(())
    }

    fn reader(&mut self) -> Result<Box<dyn ChunkReader>> {
        if self.channels.is_empty() {
            return Err(DaqError::config("no channels in task"));
        }
        Ok(Box::new(SimReader {
            rx: self.fifo_rx.clone(),
            n_channels: self.channels.len(),
            pending: None,
            delivered: 0,
        }))
    }

    fn register_every_n_samples(&mut self, n: usize, callback: EveryNCallback) -> Result<()> {
        self.require_idle("register a callback")?;
        if n == 0 {
            return Err(DaqError::config("every-N event needs N > 0"));
        }
        self.every_n = Some((n, callback));
        Ok(())
    }

    fn register_done(&mut self, callback: DoneCallback) -> Result<()> {
        self.require_idle("register a callback")?;
        self.done = Some(callback);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.require_idle("start")?;
        let timing = self
            .timing
            .ok_or_else(|| DaqError::config("sample clock not configured"))?;
        let signal = match self.signal.take() {
            Some(signal) => signal,
            None => Self::default_signal(&self.channels, timing.rate),
        };

        self.stop_flag.store(false, Ordering::SeqCst);
        let driver = Driver {
            channels: self.channels.clone(),
            timing,
            every_n: self.every_n.take(),
            done: self.done.take(),
            signal,
            pace: self.pace,
            stall_at: self.stall_at,
            fault_at: self.fault_at.clone(),
            fifo: self.fifo_tx.clone(),
            stop: Arc::clone(&self.stop_flag),
        };
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{name}-driver"))
            .spawn(move || driver.run())
            .map_err(|e| DaqError::HardwareFault(format!("failed to start driver thread: {e}")))?;
        self.driver = Some(handle);
        self.state = DeviceState::Running;
        debug!("{}: started {:?}", self.name, timing);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.stop_flag.store(true, Ordering::SeqCst);
        if let Some(handle) = self.driver.take() {
            if handle.join().is_err() {
                return Err(DaqError::HardwareFault("driver thread panicked".into()));
            }
        }
        self.every_n = None;
        self.done = None;
        while self.fifo_rx.try_recv().is_ok() {}
        if self.state == DeviceState::Running {
            self.state = DeviceState::Idle;
            debug!("{}: stopped", self.name);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.state == DeviceState::Closed {
            return Ok(());
        }
        let res = self.stop();
        self.state = DeviceState::Closed;
        res
    }
}

impl Drop for SimulatedDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}: error while closing: {e}", self.name);
        }
    }
}

/// State moved onto the driver thread for one run.
struct Driver {
    channels: Vec<SimChannel>,
    timing: Timing,
    every_n: Option<(usize, EveryNCallback)>,
    done: Option<DoneCallback>,
    signal: SignalFn,
    pace: bool,
    stall_at: Option<usize>,
    fault_at: Option<(usize, String)>,
    fifo: Sender<Array2<f64>>,
    stop: Arc<AtomicBool>,
}

impl Driver {
    fn run(mut self) {
        let n = self.every_n.as_ref().map_or(self.timing.samples_per_channel, |(n, _)| *n);
        let n_chunks = match self.timing.mode {
            SampleMode::Finite => self.timing.samples_per_channel / n.max(1),
            SampleMode::Continuous => usize::MAX,
        };
        let t0 = Instant::now();

        for k in 0..n_chunks {
            if self.stop.load(Ordering::SeqCst) {
                return;
            }
            if self.pace {
                let due = t0 + Duration::from_secs_f64(((k + 1) * n) as f64 / self.timing.rate);
                if let Some(wait) = due.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
                if self.stop.load(Ordering::SeqCst) {
                    return;
                }
            }
            let fault = self
                .fault_at
                .as_ref()
                .filter(|(at, _)| *at == k)
                .map(|(_, msg)| msg.clone());
            if let Some(msg) = fault {
                self.finish(DoneStatus::Fault(msg));
                return;
            }
            if self.stall_at != Some(k) {
                let chunk = self.generate(k * n, n);
                match self.fifo.try_send(chunk) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        self.finish(DoneStatus::Fault(
                            "device FIFO overflow: samples were not read fast enough".into(),
                        ));
                        return;
                    }
                    Err(TrySendError::Disconnected(_)) => return,
                }
            }
            if let Some((n, callback)) = self.every_n.as_mut() {
                if let Err(e) = callback(*n) {
                    debug!("every-N callback failed, halting driver: {e}");
                    return;
                }
            }
        }

        if self.timing.mode == SampleMode::Finite && !self.stop.load(Ordering::SeqCst) {
            self.finish(DoneStatus::Ok);
        }
    }

    fn finish(&mut self, status: DoneStatus) {
        if let Some(done) = self.done.as_mut() {
            done(status);
        }
    }

    fn generate(&mut self, first: usize, n: usize) -> Array2<f64> {
        let mut chunk = Array2::<f64>::zeros((self.channels.len(), n));
        for (ch, mut row) in chunk.outer_iter_mut().enumerate() {
            let (min, max) = (self.channels[ch].min, self.channels[ch].max);
            for (j, v) in row.iter_mut().enumerate() {
                *v = (self.signal)(ch, first + j).clamp(min, max);
            }
        }
        chunk
    }
}

struct SimReader {
    rx: Receiver<Array2<f64>>,
    n_channels: usize,
    /// Unread tail of the last chunk taken from the FIFO, and its start column.
    pending: Option<(Array2<f64>, usize)>,
    delivered: usize,
}

impl ChunkReader for SimReader {
    fn read_many(
        &mut self,
        dest: &mut Array2<f64>,
        samples_per_channel: usize,
        timeout: Duration,
    ) -> Result<()> {
        if dest.nrows() != self.n_channels || dest.ncols() < samples_per_channel {
            return Err(DaqError::config(format!(
                "read destination {:?} cannot hold {} channels x {samples_per_channel} samples",
                dest.dim(),
                self.n_channels
            )));
        }
        let deadline = Instant::now() + timeout;
        let mut filled = 0;
        while filled < samples_per_channel {
            let (chunk, start) = match self.pending.take() {
                Some(p) => p,
                None => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match self.rx.recv_timeout(left) {
                        Ok(chunk) => (chunk, 0),
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(DaqError::AcquisitionTimeout {
                                timeout,
                                offset: self.delivered,
                            })
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(DaqError::HardwareFault("device FIFO closed".into()))
                        }
                    }
                }
            };
            let available = chunk.ncols() - start;
            let take = available.min(samples_per_channel - filled);
            dest.slice_mut(s![.., filled..filled + take])
                .assign(&chunk.slice(s![.., start..start + take]));
            filled += take;
            if take < available {
                self.pending = Some((chunk, start + take));
            }
        }
        self.delivered += samples_per_channel;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn device() -> SimulatedDevice {
        SimulatedDevice::new("Dev1").pace(false)
    }

    #[test]
    fn rejects_unknown_channels_and_ranges() {
        let mut dev = device();
        let term = TerminalConfig::BalancedDifferential;
        assert!(dev.add_voltage_channel("Dev2/ai0", term, 0.0, 1.0).is_err());
        assert!(dev.add_voltage_channel("Dev1/ao0", term, 0.0, 1.0).is_err());
        assert!(dev.add_voltage_channel("Dev1/ai9", term, 0.0, 1.0).is_err());
        assert!(dev.add_voltage_channel("Dev1/ai0", term, 1.0, 0.0).is_err());
        assert!(dev.add_voltage_channel("Dev1/ai0", term, -20.0, 1.0).is_err());
        dev.add_voltage_channel("Dev1/ai0", term, 0.0, 1.0).unwrap();
        assert!(dev.add_voltage_channel("Dev1/ai0", term, 0.0, 1.0).is_err());
    }

    #[test]
    fn rejects_rates_above_aggregate_limit() {
        let mut dev = device().with_max_aggregate_rate(10_000.0);
        let term = TerminalConfig::Rse;
        dev.add_voltage_channel("Dev1/ai0", term, -1.0, 1.0).unwrap();
        dev.add_voltage_channel("Dev1/ai1", term, -1.0, 1.0).unwrap();
        assert!(dev.configure_timing(Timing::finite(10_000.0, 100)).is_err());
        assert!(dev.configure_timing(Timing::finite(5_000.0, 0)).is_err());
        dev.configure_timing(Timing::finite(5_000.0, 100)).unwrap();
    }

    #[test]
    fn delivers_every_chunk_then_done() {
        let mut dev = device().with_signal(|ch, i| (ch * 10 + i) as f64 * 0.01);
        dev.add_voltage_channel("Dev1/ai0", TerminalConfig::Rse, -5.0, 5.0)
            .unwrap();
        dev.configure_timing(Timing::finite(100.0, 6)).unwrap();

        let mut reader = dev.reader().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = Arc::clone(&seen);
        let mut scratch = Array2::<f64>::zeros((1, 3));
        dev.register_every_n_samples(
            3,
            Box::new(move |n: usize| -> Result<()> {
                reader.read_many(&mut scratch, n, Duration::from_secs(1))?;
                seen_cb.lock().unwrap().extend(scratch.iter().copied());
                Ok(())
            }),
        )
        .unwrap();
        let (done_tx, done_rx) = bounded(1);
        dev.register_done(Box::new(move |status| {
            let _ = done_tx.send(status);
        }))
        .unwrap();

        dev.start().unwrap();
        assert_eq!(
            done_rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DoneStatus::Ok
        );
        dev.stop().unwrap();

        let seen = seen.lock().unwrap();
        let expected: Vec<f64> = (0..6).map(|i| i as f64 * 0.01).collect();
        assert_eq!(*seen, expected);
    }

    #[test]
    fn stalled_chunk_times_out() {
        let mut dev = device().stall_at_chunk(0);
        dev.add_voltage_channel("Dev1/ai0", TerminalConfig::Rse, 0.0, 1.0)
            .unwrap();
        dev.configure_timing(Timing::finite(5.0, 5)).unwrap();
        let mut reader = dev.reader().unwrap();
        let (tx, rx) = bounded(1);
        let mut scratch = Array2::<f64>::zeros((1, 5));
        dev.register_every_n_samples(
            5,
            Box::new(move |n| {
                let res = reader.read_many(&mut scratch, n, Duration::from_millis(20));
                let _ = tx.send(res.is_err());
                res
            }),
        )
        .unwrap();
        dev.start().unwrap();
        assert!(dev.is_running());
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        dev.close().unwrap();
        assert!(!dev.is_running());
        assert!(dev.start().is_err());
    }

    #[test]
    fn injected_fault_reaches_done_callback() {
        let mut dev = device().fault_at_chunk(1, "input overvoltage");
        dev.add_voltage_channel("Dev1/ai0", TerminalConfig::Rse, 0.0, 1.0)
            .unwrap();
        dev.configure_timing(Timing::finite(10.0, 30)).unwrap();
        let (tx, rx) = bounded(1);
        dev.register_done(Box::new(move |status| {
            let _ = tx.send(status);
        }))
        .unwrap();
        let mut reader = dev.reader().unwrap();
        let mut scratch = Array2::<f64>::zeros((1, 10));
        dev.register_every_n_samples(
            10,
            Box::new(move |n| reader.read_many(&mut scratch, n, Duration::from_secs(1))),
        )
        .unwrap();
        dev.start().unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DoneStatus::Fault("input overvoltage".into())
        );
    }

    #[test]
    fn reader_splits_chunks_across_reads() {
        let (tx, rx) = bounded(4);
        let mut reader = SimReader {
            rx,
            n_channels: 1,
            pending: None,
            delivered: 0,
        };
        tx.send(Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap())
            .unwrap();
        let mut dest = Array2::<f64>::zeros((1, 3));
        reader.read_many(&mut dest, 3, Duration::from_millis(10)).unwrap();
        assert_eq!(dest.row(0).to_vec(), vec![1.0, 2.0, 3.0]);

        let err = reader
            .read_many(&mut dest, 3, Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, DaqError::AcquisitionTimeout { offset: 3, .. }));
    }
}
