//! The hardware acquisition API the controller drives.
//!
//! A backend registers voltage channels, configures a sample clock, hands out a
//! chunked reader and invokes two callbacks from its own execution context: one
//! every `n` samples per channel and one when the finite acquisition is over.

use crate::Result;
use ndarray::Array2;
use serde::Deserialize;
use std::time::Duration;

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TerminalConfig {
    Rse,
    Nrse,
    #[default]
    BalancedDifferential,
    PseudoDifferential,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleMode {
    /// Acquire `samples_per_channel` then halt.
    Finite,
    Continuous,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Timing {
    pub rate: f64,
    pub edge: Edge,
    pub mode: SampleMode,
    pub samples_per_channel: usize,
}

impl Timing {
    pub fn finite(rate: f64, samples_per_channel: usize) -> Self {
        Self {
            rate,
            edge: Edge::Rising,
            mode: SampleMode::Finite,
            samples_per_channel,
        }
    }
}

/// Status handed to the done callback.
#[derive(Debug, Clone, PartialEq)]
pub enum DoneStatus {
    Ok,
    Fault(String),
}

/// Invoked with the number of samples per channel now waiting in the device FIFO.
pub type EveryNCallback = Box<dyn FnMut(usize) -> Result<()> + Send>;
pub type DoneCallback = Box<dyn FnMut(DoneStatus) + Send>;

/// Interleaved multi-channel reads from the device FIFO.
pub trait ChunkReader: Send {
    /// Fill `dest[.., 0..samples_per_channel]`, one row per registered channel,
    /// waiting at most `timeout` for the data.
    fn read_many(
        &mut self,
        dest: &mut Array2<f64>,
        samples_per_channel: usize,
        timeout: Duration,
    ) -> Result<()>;
}

pub trait AcquisitionDevice {
    fn add_voltage_channel(
        &mut self,
        physical_channel: &str,
        terminal: TerminalConfig,
        min_val: f64,
        max_val: f64,
    ) -> Result<()>;

    fn configure_timing(&mut self, timing: Timing) -> Result<()>;

    fn reader(&mut self) -> Result<Box<dyn ChunkReader>>;

    fn register_every_n_samples(&mut self, n: usize, callback: EveryNCallback) -> Result<()>;

    fn register_done(&mut self, callback: DoneCallback) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Halt the acquisition and drop the registered callbacks.
    fn stop(&mut self) -> Result<()>;

    /// Release the device. Must be safe to call after `stop`.
    fn close(&mut self) -> Result<()>;
}
