use crate::{
    ChannelConfig, ChunkReader, Conf, DaqError, DoneCallback, DoneStatus, EveryNCallback, Result,
    SampleBuffer,
};
use log::{error, info, warn};
use ndarray::{s, Array2};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock, RwLockReadGuard,
    },
    time::Duration,
};

/// Runtime state of one capture, shared between the host loop and the driver callbacks.
///
/// Only the chunk callback writes the buffer and moves its cursor. The host loop
/// reads the buffer for display and polls the completion and fault flags.
#[derive(Debug)]
pub struct AcquisitionSession {
    channels: Vec<ChannelConfig>,
    sample_rate: f64,
    total_samples: usize,
    chunk_size: usize,
    read_timeout: Duration,
    buffer: RwLock<SampleBuffer>,
    completed: AtomicBool,
    faulted: AtomicBool,
    fault: Mutex<Option<DaqError>>,
}

impl AcquisitionSession {
    pub fn new(
        channels: Vec<ChannelConfig>,
        sample_rate: f64,
        total_samples: usize,
        chunk_size: usize,
        read_timeout: Duration,
    ) -> Self {
        let buffer = SampleBuffer::new(channels.len(), total_samples);
        Self {
            channels,
            sample_rate,
            total_samples,
            chunk_size,
            read_timeout,
            buffer: RwLock::new(buffer),
            completed: AtomicBool::new(false),
            faulted: AtomicBool::new(false),
            fault: Mutex::new(None),
        }
    }

    pub fn from_conf(conf: &Conf) -> Self {
        Self::new(
            conf.channels.clone(),
            conf.run_settings.sample_rate,
            conf.total_samples(),
            conf.chunk_size(),
            conf.read_timeout(),
        )
    }

    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    pub fn sample_rate(&self) -> f64 {
        self.sample_rate
    }

    pub fn total_samples(&self) -> usize {
        self.total_samples
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Read access for display and persistence. Blocks only while a chunk is being copied in.
    pub fn buffer(&self) -> RwLockReadGuard<'_, SampleBuffer> {
        self.buffer.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn next_offset(&self) -> usize {
        self.buffer().next_offset()
    }

    /// Set once the device reports the finite acquisition finished.
    pub fn is_complete(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// The host loop should stop the device.
    pub fn should_stop(&self) -> bool {
        self.is_complete() || self.is_faulted()
    }

    pub fn take_fault(&self) -> Option<DaqError> {
        self.fault
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Keep the first fault; later ones are only logged.
    fn record_fault(&self, fault: DaqError) {
        error!("acquisition fault: {fault}");
        let mut slot = self.fault.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(fault);
        }
        self.faulted.store(true, Ordering::Release);
    }

    /// Body of the every-N callback: read one chunk into `scratch`, copy every
    /// channel row into the buffer, then advance the shared cursor.
    pub fn on_chunk(
        &self,
        reader: &mut dyn ChunkReader,
        scratch: &mut Array2<f64>,
        n: usize,
    ) -> Result<()> {
        if n != self.chunk_size || n > scratch.ncols() {
            return Err(DaqError::config(format!(
                "driver delivered {n} samples per channel, expected {}",
                self.chunk_size
            )));
        }
        let offset = self.next_offset();
        reader
            .read_many(scratch, n, self.read_timeout)
            .map_err(|e| match e {
                DaqError::AcquisitionTimeout { timeout, .. } => {
                    DaqError::AcquisitionTimeout { timeout, offset }
                }
                other => other,
            })?;

        let mut buffer = self
            .buffer
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        buffer.write_event(scratch.slice(s![.., ..n]))?;
        info!("Acquired samples = {}", buffer.next_offset());
        Ok(())
    }

    /// Body of the done callback. Idempotent.
    pub fn on_done(&self, status: DoneStatus) {
        if let DoneStatus::Fault(msg) = status {
            self.record_fault(DaqError::HardwareFault(msg));
        }
        if self.completed.swap(true, Ordering::AcqRel) {
            warn!("completion reported more than once; ignoring");
        } else {
            info!("DAQ done");
        }
    }

    /// Closure registered as the every-N callback. Owns the reader and a reusable scratch block.
    pub fn chunk_handler(self: &Arc<Self>, mut reader: Box<dyn ChunkReader>) -> EveryNCallback {
        let session = Arc::clone(self);
        let mut scratch = Array2::<f64>::zeros((self.channels.len(), self.chunk_size));
        Box::new(move |n| {
            if session.is_faulted() {
                return Err(DaqError::InvalidState {
                    from: "faulted",
                    op: "read a chunk",
                });
            }
            session
                .on_chunk(reader.as_mut(), &mut scratch, n)
                .map_err(|e| {
                    let summary = DaqError::HardwareFault(format!("chunk callback aborted: {e}"));
                    session.record_fault(e);
                    summary
                })
        })
    }

    pub fn done_handler(self: &Arc<Self>) -> DoneCallback {
        let session = Arc::clone(self);
        Box::new(move |status| session.on_done(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ClipRange, TerminalConfig};
    use std::collections::VecDeque;

    /// Reader that hands out canned chunks, or times out when empty.
    struct ScriptedReader(VecDeque<Array2<f64>>);

    impl ChunkReader for ScriptedReader {
        fn read_many(&mut self, dest: &mut Array2<f64>, n: usize, timeout: Duration) -> Result<()> {
            match self.0.pop_front() {
                Some(chunk) => {
                    dest.slice_mut(s![.., ..n]).assign(&chunk);
                    Ok(())
                }
                None => Err(DaqError::AcquisitionTimeout { timeout, offset: 0 }),
            }
        }
    }

    fn channel(id: &str, label: &str) -> ChannelConfig {
        ChannelConfig {
            device_channel_id: id.into(),
            label: label.into(),
            units: "[V]".into(),
            voltage_min: -1.0,
            voltage_max: 1.0,
            calibration_coeffs: vec![1.0, 0.0],
            clip_range: ClipRange::new(-1.0, 1.0),
            terminal_config: TerminalConfig::Rse,
        }
    }

    fn session(n_channels: usize, total: usize, chunk: usize) -> Arc<AcquisitionSession> {
        let channels = (0..n_channels)
            .map(|i| channel(&format!("Dev1/ai{i}"), &format!("ch{i}")))
            .collect();
        Arc::new(AcquisitionSession::new(
            channels,
            10.0,
            total,
            chunk,
            Duration::from_millis(10),
        ))
    }

    #[test]
    fn two_channel_chunks_fill_rows_in_step() {
        let session = session(2, 4, 2);
        let reader = ScriptedReader(VecDeque::from(vec![
            ndarray::array![[0.1, 0.2], [1.1, 1.2]],
            ndarray::array![[0.3, 0.4], [1.3, 1.4]],
        ]));
        let mut on_chunk = session.chunk_handler(Box::new(reader));
        let mut on_done = session.done_handler();

        on_chunk(2).unwrap();
        assert_eq!(session.next_offset(), 2);
        assert_eq!(session.buffer().read_all(0).to_vec(), vec![0.1, 0.2, 0.0, 0.0]);
        assert_eq!(session.buffer().read_all(1).to_vec(), vec![1.1, 1.2, 0.0, 0.0]);
        assert!(!session.is_complete());

        on_chunk(2).unwrap();
        on_done(DoneStatus::Ok);
        assert_eq!(session.next_offset(), 4);
        assert_eq!(session.buffer().read_all(1).to_vec(), vec![1.1, 1.2, 1.3, 1.4]);
        assert!(session.is_complete());
        assert!(session.take_fault().is_none());
    }

    #[test]
    fn timeout_records_fault_and_keeps_buffer_zeroed() {
        let session = session(1, 5, 5);
        let mut on_chunk = session.chunk_handler(Box::new(ScriptedReader(VecDeque::new())));

        assert!(on_chunk(5).is_err());
        assert!(session.is_faulted());
        assert!(session.should_stop());
        assert!(!session.is_complete());
        assert_eq!(session.next_offset(), 0);
        assert!(session.buffer().read_all(0).iter().all(|&v| v == 0.0));
        assert!(matches!(
            session.take_fault(),
            Some(DaqError::AcquisitionTimeout { offset: 0, .. })
        ));

        // no further chunks are accepted once faulted
        assert!(on_chunk(5).is_err());
    }

    #[test]
    fn overrun_is_reported_as_capacity_exceeded() {
        let session = session(1, 2, 2);
        let reader = ScriptedReader(VecDeque::from(vec![
            ndarray::array![[1.0, 2.0]],
            ndarray::array![[3.0, 4.0]],
        ]));
        let mut on_chunk = session.chunk_handler(Box::new(reader));
        on_chunk(2).unwrap();
        assert!(on_chunk(2).is_err());
        assert_eq!(session.buffer().read_all(0).to_vec(), vec![1.0, 2.0]);
        assert!(matches!(
            session.take_fault(),
            Some(DaqError::CapacityExceeded { offset: 2, chunk: 2, capacity: 2 })
        ));
    }

    #[test]
    fn partial_chunk_is_rejected_without_moving_cursor() {
        let session = session(1, 4, 2);
        let reader = ScriptedReader(VecDeque::from(vec![ndarray::array![[0.5]]]));
        let mut on_chunk = session.chunk_handler(Box::new(reader));

        assert!(on_chunk(1).is_err());
        assert_eq!(session.next_offset(), 0);
        assert_eq!(session.next_offset() % session.chunk_size(), 0);
        assert!(session.buffer().read_all(0).iter().all(|&v| v == 0.0));
        assert!(matches!(session.take_fault(), Some(DaqError::Configuration(_))));
    }

    #[test]
    fn completion_is_idempotent() {
        let session = session(1, 2, 2);
        session.on_done(DoneStatus::Ok);
        session.on_done(DoneStatus::Ok);
        assert!(session.is_complete());
        assert!(!session.is_faulted());
    }

    #[test]
    fn driver_fault_is_kept_as_hardware_fault() {
        let session = session(1, 2, 2);
        session.on_done(DoneStatus::Fault("overvoltage on ai0".into()));
        assert!(session.should_stop());
        match session.take_fault() {
            Some(DaqError::HardwareFault(msg)) => assert_eq!(msg, "overvoltage on ai0"),
            other => panic!("unexpected fault {other:?}"),
        }
    }
}
