//! Polynomial calibration of raw voltages into physical units.

use ndarray::{Array1, ArrayView1};
use serde::Deserialize;

/// Inclusive voltage window applied before the calibration polynomial.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(from = "(f64, f64)")]
pub struct ClipRange {
    pub lo: f64,
    pub hi: f64,
}

impl ClipRange {
    pub const fn new(lo: f64, hi: f64) -> Self {
        Self { lo, hi }
    }

    #[inline]
    pub fn apply(&self, v: f64) -> f64 {
        v.clamp(self.lo, self.hi)
    }
}

impl From<(f64, f64)> for ClipRange {
    fn from((lo, hi): (f64, f64)) -> Self {
        Self { lo, hi }
    }
}

/// Evaluate a polynomial with coefficients ordered highest degree first.
#[inline]
pub fn polyval(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().fold(0.0, |acc, &c| acc * x + c)
}

/// Clip every raw sample into `clip`, then evaluate `coeffs` on it.
///
/// Clipping first keeps the polynomial inside the sensor's valid input window,
/// so transients outside it cannot extrapolate into nonsense values.
pub fn calibrate(raw: &[f64], coeffs: &[f64], clip: ClipRange) -> Vec<f64> {
    raw.iter().map(|&v| polyval(coeffs, clip.apply(v))).collect()
}

/// Same as [`calibrate`] for one row of the sample buffer.
pub fn calibrate_row(raw: ArrayView1<f64>, coeffs: &[f64], clip: ClipRange) -> Array1<f64> {
    raw.mapv(|v| polyval(coeffs, clip.apply(v)))
}
