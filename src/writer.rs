use crate::{calibrate_row, time_axis, ChannelConfig, DaqError, Result, SampleBuffer};
use hdf5::{types::VarLenUnicode, File, Group};
use log::info;
use std::path::{Path, PathBuf};

/// Datasets every session group holds regardless of its channels.
pub const RESERVED_DATASETS: [&str; 3] = ["TimeStamp", "fsample", "time"];

/// Every dataset name a session with these channels will create, in write order.
///
/// Fails when two channels, or a channel and a reserved dataset, would collide.
pub fn dataset_names(channels: &[ChannelConfig]) -> Result<Vec<String>> {
    let mut names: Vec<String> = RESERVED_DATASETS.iter().map(|n| n.to_string()).collect();
    for channel in channels {
        for name in [
            format!("{}_UNITS", channel.label),
            format!("{}_VOLTS", channel.label),
            channel.label.clone(),
        ] {
            if names.contains(&name) {
                return Err(DaqError::config(format!(
                    "channel label '{}' clashes with dataset '{name}'",
                    channel.label
                )));
            }
            names.push(name);
        }
    }
    Ok(names)
}

/// Everything persisted for one session.
pub struct SessionRecord<'a> {
    pub name: &'a str,
    pub timestamp: String,
    pub sample_rate: f64,
    pub total_time: f64,
    pub channels: &'a [ChannelConfig],
    pub buffer: &'a SampleBuffer,
}

/// Appends sessions to an HDF5 store, one group per session name.
///
/// Each group holds `TimeStamp`, `fsample`, `time` and, per channel,
/// `<label>_UNITS`, `<label>_VOLTS` (raw) and `<label>` (calibrated).
/// An existing session is never overwritten.
#[derive(Debug, Clone)]
pub struct SessionRecorder {
    path: PathBuf,
}

impl SessionRecorder {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn session_exists(&self, name: &str) -> Result<bool> {
        if !self.path.exists() {
            return Ok(false);
        }
        let file = File::open(&self.path)?;
        Ok(file.link_exists(name))
    }

    pub fn ensure_new_session(&self, name: &str) -> Result<()> {
        if self.session_exists(name)? {
            return Err(self.duplicate(name));
        }
        Ok(())
    }

    fn duplicate(&self, name: &str) -> DaqError {
        DaqError::DuplicateSession {
            store: self.path.display().to_string(),
            session: name.to_string(),
        }
    }

    pub fn write_session(&self, record: &SessionRecord) -> Result<()> {
        let file = File::append(&self.path)?;
        if file.link_exists(record.name) {
            return Err(self.duplicate(record.name));
        }
        if record.channels.len() != record.buffer.n_channels() {
            return Err(DaqError::config(format!(
                "{} channel(s) configured, buffer holds {}",
                record.channels.len(),
                record.buffer.n_channels()
            )));
        }
        dataset_names(record.channels)?;
        let group = file.create_group(record.name)?;

        write_string(&group, "TimeStamp", &record.timestamp)?;
        group
            .new_dataset::<f64>()
            .shape(())
            .create("fsample")?
            .write_scalar(&record.sample_rate)?;
        let time = time_axis(record.total_time, record.buffer.total_samples());
        group.new_dataset_builder().with_data(&time).create("time")?;

        for (ch, channel) in record.channels.iter().enumerate() {
            let raw = record.buffer.read_all(ch);
            let calibrated =
                calibrate_row(raw, &channel.calibration_coeffs, channel.clip_range);

            write_string(&group, &format!("{}_UNITS", channel.label), &channel.units)?;
            group
                .new_dataset_builder()
                .with_data(raw)
                .create(format!("{}_VOLTS", channel.label).as_str())?;
            group
                .new_dataset_builder()
                .with_data(&calibrated)
                .create(channel.label.as_str())?;
        }

        file.flush()?;
        info!(
            "wrote session '{}' ({} channel(s), {} samples) to {}",
            record.name,
            record.channels.len(),
            record.buffer.next_offset(),
            self.path.display()
        );
        Ok(())
    }
}

fn write_string(group: &Group, name: &str, value: &str) -> Result<()> {
    let value: VarLenUnicode = value
        .parse()
        .map_err(|e| DaqError::config(format!("cannot store '{value}' as {name}: {e}")))?;
    group
        .new_dataset::<VarLenUnicode>()
        .shape(())
        .create(name)?
        .write_scalar(&value)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{calibrate, ClipRange, TerminalConfig};
    use ndarray::array;
    use tempfile::tempdir;

    fn hotwire() -> ChannelConfig {
        ChannelConfig {
            device_channel_id: "Dev1/ai0".into(),
            label: "hotwire".into(),
            units: "[m/s]".into(),
            voltage_min: 0.0,
            voltage_max: 1.0,
            calibration_coeffs: vec![10.0, 1.0],
            clip_range: ClipRange::new(0.0, 1.0),
            terminal_config: TerminalConfig::BalancedDifferential,
        }
    }

    fn filled_buffer() -> SampleBuffer {
        let mut buffer = SampleBuffer::new(1, 4);
        buffer.write_event(array![[-0.5, 0.2]].view()).unwrap();
        buffer
    }

    #[test]
    fn writes_session_layout() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path().join("Lab_Tests.h5"));
        let channels = vec![hotwire()];
        let buffer = filled_buffer();

        assert!(!recorder.session_exists("Central_Readings").unwrap());
        recorder
            .write_session(&SessionRecord {
                name: "Central_Readings",
                timestamp: "20211122_090507".into(),
                sample_rate: 4.0,
                total_time: 1.0,
                channels: &channels,
                buffer: &buffer,
            })
            .unwrap();
        assert!(recorder.session_exists("Central_Readings").unwrap());

        let file = File::open(recorder.path()).unwrap();
        let group = file.group("Central_Readings").unwrap();
        let ts: VarLenUnicode = group.dataset("TimeStamp").unwrap().read_scalar().unwrap();
        assert_eq!(ts.as_str(), "20211122_090507");
        let fs: f64 = group.dataset("fsample").unwrap().read_scalar().unwrap();
        assert_eq!(fs, 4.0);
        let time = group.dataset("time").unwrap().read_1d::<f64>().unwrap();
        assert_eq!(time.to_vec(), vec![0.0, 0.25, 0.5, 0.75]);

        let units: VarLenUnicode = group
            .dataset("hotwire_UNITS")
            .unwrap()
            .read_scalar()
            .unwrap();
        assert_eq!(units.as_str(), "[m/s]");
        let volts = group.dataset("hotwire_VOLTS").unwrap().read_1d::<f64>().unwrap();
        assert_eq!(volts.to_vec(), vec![-0.5, 0.2, 0.0, 0.0]);
        let speed = group.dataset("hotwire").unwrap().read_1d::<f64>().unwrap();
        let expected = calibrate(&[-0.5, 0.2, 0.0, 0.0], &[10.0, 1.0], ClipRange::new(0.0, 1.0));
        assert_eq!(speed.to_vec(), expected);
        assert_eq!(speed[0], 1.0);
    }

    #[test]
    fn clashing_labels_leave_no_partial_group() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path().join("lab.h5"));
        let mut time = hotwire();
        time.label = "time".into();
        let channels = vec![time];
        let buffer = filled_buffer();

        let res = recorder.write_session(&SessionRecord {
            name: "run1",
            timestamp: "20240101_000000".into(),
            sample_rate: 4.0,
            total_time: 1.0,
            channels: &channels,
            buffer: &buffer,
        });
        assert!(matches!(res, Err(DaqError::Configuration(_))));
        assert!(!recorder.session_exists("run1").unwrap());
    }

    #[test]
    fn channel_count_must_match_buffer() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path().join("lab.h5"));
        let channels = vec![hotwire(), ChannelConfig { label: "pitot".into(), ..hotwire() }];
        let buffer = filled_buffer();

        let res = recorder.write_session(&SessionRecord {
            name: "run1",
            timestamp: "20240101_000000".into(),
            sample_rate: 4.0,
            total_time: 1.0,
            channels: &channels,
            buffer: &buffer,
        });
        assert!(matches!(res, Err(DaqError::Configuration(_))));
        assert!(!recorder.session_exists("run1").unwrap());
    }

    #[test]
    fn dataset_names_detect_derived_clashes() {
        let mut volts = hotwire();
        volts.label = "hotwire_VOLTS".into();
        assert!(dataset_names(&[hotwire(), volts.clone()]).is_err());
        assert!(dataset_names(&[volts, hotwire()]).is_err());

        let mut other = hotwire();
        other.label = "pitot".into();
        let names = dataset_names(&[hotwire(), other]).unwrap();
        assert_eq!(names.len(), 9);
        assert_eq!(names[3], "hotwire_UNITS");
        assert_eq!(names[8], "pitot");
    }

    #[test]
    fn refuses_to_overwrite_a_session() {
        let dir = tempdir().unwrap();
        let recorder = SessionRecorder::new(dir.path().join("lab.h5"));
        let channels = vec![hotwire()];
        let buffer = filled_buffer();
        let record = SessionRecord {
            name: "run1",
            timestamp: "20240101_000000".into(),
            sample_rate: 4.0,
            total_time: 1.0,
            channels: &channels,
            buffer: &buffer,
        };

        recorder.write_session(&record).unwrap();
        assert!(matches!(
            recorder.ensure_new_session("run1"),
            Err(DaqError::DuplicateSession { .. })
        ));
        assert!(matches!(
            recorder.write_session(&record),
            Err(DaqError::DuplicateSession { .. })
        ));
        recorder.ensure_new_session("run2").unwrap();
    }
}
