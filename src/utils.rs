use crate::{AcquisitionDevice, Conf, Result};
use log::debug;
use ndarray::Array1;
use std::time::{Duration, Instant};
use time::{macros::format_description, OffsetDateTime};

/// Acquisition progress as seen from the host loop, with a rate over the
/// interval since the previous update.
#[derive(Debug)]
pub struct Progress {
    pub total_samples: usize,
    pub acquired: usize,
    pub t_begin: Instant,
    last_update: Instant,
    last_acquired: usize,
    rate: f64,
}

impl Progress {
    pub fn new(total_samples: usize) -> Self {
        let now = Instant::now();
        Progress {
            total_samples,
            acquired: 0,
            t_begin: now,
            last_update: now,
            last_acquired: 0,
            rate: 0.0,
        }
    }

    /// Record the current write cursor.
    pub fn update(&mut self, acquired: usize) {
        let now = Instant::now();
        let secs = now.duration_since(self.last_update).as_secs_f64().max(1e-6);
        self.rate = acquired.saturating_sub(self.last_acquired) as f64 / secs;
        self.acquired = acquired;
        self.last_acquired = acquired;
        self.last_update = now;
    }

    /// Samples per channel per second since the previous update.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn fraction(&self) -> f64 {
        if self.total_samples == 0 {
            return 0.0;
        }
        self.acquired as f64 / self.total_samples as f64
    }

    pub fn elapsed(&self) -> Duration {
        self.t_begin.elapsed()
    }
}

/// Add every configured channel to the device in acquisition order.
pub fn configure_device<D: AcquisitionDevice + ?Sized>(device: &mut D, config: &Conf) -> Result<()> {
    for channel in &config.channels {
        debug!(
            "adding {} as '{}' ({:?}, {}..{} V)",
            channel.device_channel_id,
            channel.label,
            channel.terminal_config,
            channel.voltage_min,
            channel.voltage_max
        );
        device.add_voltage_channel(
            &channel.device_channel_id,
            channel.terminal_config,
            channel.voltage_min,
            channel.voltage_max,
        )?;
    }
    Ok(())
}

/// `n` evenly spaced instants over `[0, total_time)`.
pub fn time_axis(total_time: f64, n: usize) -> Array1<f64> {
    if n == 0 {
        return Array1::zeros(0);
    }
    let step = total_time / n as f64;
    Array1::from_iter((0..n).map(|i| i as f64 * step))
}

/// Local wall-clock time as `YYYYMMDD_HHMMSS`, falling back to UTC when the
/// local offset cannot be determined.
pub fn session_timestamp() -> String {
    let now = OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc());
    format_timestamp(now)
}

fn format_timestamp(when: OffsetDateTime) -> String {
    let format = format_description!("[year][month][day]_[hour][minute][second]");
    when.format(&format)
        .unwrap_or_else(|_| when.unix_timestamp().to_string())
}
