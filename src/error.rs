use std::time::Duration;

/// Every failure an acquisition session can surface to the operator.
///
/// Nothing here is retried. Configuration and duplicate-session errors abort
/// before the device runs; timeouts, overruns and hardware faults end a running
/// session but leave whatever was already buffered available for persistence.
#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("session '{session}' already recorded in {store}")]
    DuplicateSession { store: String, session: String },

    #[error("chunk read timed out after {timeout:?} at sample offset {offset}")]
    AcquisitionTimeout { timeout: Duration, offset: usize },

    #[error("chunk of {chunk} samples at offset {offset} exceeds buffer capacity {capacity}")]
    CapacityExceeded {
        offset: usize,
        chunk: usize,
        capacity: usize,
    },

    #[error("hardware fault: {0}")]
    HardwareFault(String),

    #[error("cannot {op} while {from}")]
    InvalidState { from: &'static str, op: &'static str },

    #[error("store error: {0}")]
    Store(#[from] hdf5::Error),

    #[error("failed to load configuration: {0}")]
    Config(#[from] confique::Error),
}

impl DaqError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// True for faults that end a running session with partial data.
    pub fn is_mid_run(&self) -> bool {
        matches!(
            self,
            Self::AcquisitionTimeout { .. } | Self::CapacityExceeded { .. } | Self::HardwareFault(_)
        )
    }
}

pub type Result<T, E = DaqError> = std::result::Result<T, E>;
