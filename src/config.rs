use crate::{dataset_names, ClipRange, DaqError, Result, TerminalConfig};
use confique::Config;
use serde::Deserialize;
use std::{collections::HashSet, path::Path, time::Duration};

#[derive(Config, Debug, Clone)]
pub struct Conf {
    #[config(nested)]
    pub run_settings: RunSettings,
    pub channels: Vec<ChannelConfig>,
}

#[derive(Config, Debug, Clone)]
pub struct RunSettings {
    #[config(default = "Lab_Group")]
    pub prefix: String,
    /// Defaults to `<prefix>_Tests.h5`.
    pub store_name: Option<String>,
    pub session_name: String,
    #[config(default = 10000.0)]
    pub sample_rate: f64,
    #[config(default = 240.0)]
    pub total_time: f64,
    /// Seconds between chunk callbacks and between redraws.
    #[config(default = 1.0)]
    pub event_time: f64,
    #[config(default = 2.0)]
    pub read_timeout: f64,
    /// Live chart bounds, in calibrated units. Default `[-10, 50]`.
    pub y_min: Option<f64>,
    pub y_max: Option<f64>,
}

/// One physical analog input. Order in the config is acquisition order.
#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    pub device_channel_id: String,
    pub label: String,
    pub units: String,
    pub voltage_min: f64,
    pub voltage_max: f64,
    /// Highest degree first, constant term last.
    pub calibration_coeffs: Vec<f64>,
    pub clip_range: ClipRange,
    #[serde(default)]
    pub terminal_config: TerminalConfig,
}

impl Conf {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let conf = Conf::builder().file(path.as_ref()).load()?;
        conf.validate()?;
        Ok(conf)
    }

    pub fn store_name(&self) -> String {
        self.run_settings
            .store_name
            .clone()
            .unwrap_or_else(|| format!("{}_Tests.h5", self.run_settings.prefix))
    }

    /// Samples per channel delivered by each chunk callback.
    pub fn chunk_size(&self) -> usize {
        (self.run_settings.sample_rate * self.run_settings.event_time).round() as usize
    }

    /// Samples per channel for the whole finite acquisition.
    pub fn total_samples(&self) -> usize {
        (self.run_settings.sample_rate * self.run_settings.total_time).round() as usize
    }

    pub fn y_bounds(&self) -> [f64; 2] {
        [
            self.run_settings.y_min.unwrap_or(-10.0),
            self.run_settings.y_max.unwrap_or(50.0),
        ]
    }

    pub fn event_interval(&self) -> Duration {
        Duration::from_secs_f64(self.run_settings.event_time)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.run_settings.read_timeout)
    }

    pub fn validate(&self) -> Result<()> {
        let run = &self.run_settings;
        for (name, value) in [
            ("sample_rate", run.sample_rate),
            ("total_time", run.total_time),
            ("event_time", run.event_time),
            ("read_timeout", run.read_timeout),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(DaqError::config(format!("{name} must be positive, got {value}")));
            }
        }
        if run.session_name.trim().is_empty() {
            return Err(DaqError::config("session_name must not be empty"));
        }
        let [y_min, y_max] = self.y_bounds();
        if y_min >= y_max {
            return Err(DaqError::config("y_min must be below y_max"));
        }

        let chunk = self.chunk_size();
        let total = self.total_samples();
        if chunk == 0 {
            return Err(DaqError::config("sample_rate * event_time rounds to zero samples"));
        }
        if total % chunk != 0 {
            return Err(DaqError::config(format!(
                "total of {total} samples is not a whole number of {chunk}-sample chunks"
            )));
        }

        if self.channels.is_empty() {
            return Err(DaqError::config("no channels configured"));
        }
        let mut labels = HashSet::new();
        for ch in &self.channels {
            ch.validate()?;
            if !labels.insert(ch.label.as_str()) {
                return Err(DaqError::config(format!("duplicate channel label '{}'", ch.label)));
            }
        }
        dataset_names(&self.channels)?;
        Ok(())
    }
}

impl ChannelConfig {
    pub fn validate(&self) -> Result<()> {
        if self.device_channel_id.trim().is_empty() {
            return Err(DaqError::config("empty device channel id"));
        }
        if self.label.trim().is_empty() || self.label.contains('/') {
            return Err(DaqError::config(format!("invalid channel label '{}'", self.label)));
        }
        if self.voltage_min >= self.voltage_max {
            return Err(DaqError::config(format!(
                "{}: voltage_min {} must be below voltage_max {}",
                self.device_channel_id, self.voltage_min, self.voltage_max
            )));
        }
        if self.clip_range.lo > self.clip_range.hi {
            return Err(DaqError::config(format!(
                "{}: clip range ({}, {}) is inverted",
                self.device_channel_id, self.clip_range.lo, self.clip_range.hi
            )));
        }
        if self.calibration_coeffs.is_empty() {
            return Err(DaqError::config(format!(
                "{}: calibration polynomial has no coefficients",
                self.device_channel_id
            )));
        }
        Ok(())
    }

    /// Legend text, e.g. `hotwire [m/s]`.
    pub fn display_name(&self) -> String {
        format!("{} {}", self.label, self.units)
    }
}
