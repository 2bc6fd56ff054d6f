use crate::{DaqError, Result};
use ndarray::{s, Array2, ArrayView1, ArrayView2};

/// Pre-sized (channels × total samples) store that acquisition fills chunk by chunk.
///
/// A single write cursor is shared by every channel. Each chunk event writes the
/// same span of every row, then advances the cursor once. The cursor never
/// passes `total_samples`.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    data: Array2<f64>,
    next_offset: usize,
}

impl SampleBuffer {
    pub fn new(n_channels: usize, total_samples: usize) -> Self {
        Self {
            data: Array2::<f64>::zeros((n_channels, total_samples)),
            next_offset: 0,
        }
    }

    pub fn n_channels(&self) -> usize {
        self.data.nrows()
    }

    pub fn total_samples(&self) -> usize {
        self.data.ncols()
    }

    pub fn next_offset(&self) -> usize {
        self.next_offset
    }

    pub fn is_full(&self) -> bool {
        self.next_offset == self.total_samples()
    }

    fn check_capacity(&self, chunk: usize) -> Result<()> {
        if self.next_offset + chunk > self.total_samples() {
            return Err(DaqError::CapacityExceeded {
                offset: self.next_offset,
                chunk,
                capacity: self.total_samples(),
            });
        }
        Ok(())
    }

    /// Copy `chunk` into row `channel` starting at the cursor. The cursor does not move.
    pub fn write_chunk(&mut self, channel: usize, chunk: ArrayView1<f64>) -> Result<()> {
        if channel >= self.n_channels() {
            return Err(DaqError::config(format!(
                "channel index {channel} out of range for {} channels",
                self.n_channels()
            )));
        }
        self.check_capacity(chunk.len())?;

        let start = self.next_offset;
        self.data
            .slice_mut(s![channel, start..start + chunk.len()])
            .assign(&chunk);
        Ok(())
    }

    /// Write one chunk event: row `i` of `chunk` goes into channel `i`.
    ///
    /// Capacity is checked once up front, so a rejected event leaves every row untouched.
    pub fn write_event(&mut self, chunk: ArrayView2<f64>) -> Result<()> {
        let (channels, samples) = chunk.dim();
        if channels != self.n_channels() {
            return Err(DaqError::config(format!(
                "chunk has {channels} channels, buffer has {}",
                self.n_channels()
            )));
        }
        self.check_capacity(samples)?;
        for (ch, row) in chunk.outer_iter().enumerate() {
            self.write_chunk(ch, row)?;
        }
        self.advance(samples)
    }

    pub fn advance(&mut self, chunk: usize) -> Result<()> {
        self.check_capacity(chunk)?;
        self.next_offset += chunk;
        Ok(())
    }

    /// Full-capacity row, including trailing zeros never reached by an early-stopped session.
    ///
    /// # Panics
    ///
    /// Panics if `channel >= self.n_channels()`, like indexing a row of the underlying array.
    pub fn read_all(&self, channel: usize) -> ArrayView1<f64> {
        self.data.row(channel)
    }

    pub fn as_array(&self) -> ArrayView2<f64> {
        self.data.view()
    }
}
