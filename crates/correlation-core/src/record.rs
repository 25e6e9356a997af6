use num_complex::Complex32;

use crate::baseline::StreamSpec;

/// Normalised product of one baseline for one integration and bin.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineProduct {
    pub first: StreamSpec,
    pub second: StreamSpec,
    /// Fraction of frames that contributed (1.0 when nothing was flagged).
    pub weight: f32,
    /// `fft_size + 1` spectral channels.
    pub spectrum: Vec<Complex32>,
}

/// Output of one integration period for one bin.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputRecord {
    pub slice_nr: u64,
    pub integration_nr: usize,
    pub bin: usize,
    pub baselines: Vec<BaselineProduct>,
}

impl OutputRecord {
    pub fn baseline_count(&self) -> usize {
        self.baselines.len()
    }
}
