//! Pulse-phase binning for pulsar observations.
//!
//! Bin 0 collects everything outside the on-pulse gate; the gate itself is
//! divided into `nbins` equal phase bins numbered `1..=nbins`.

use delay_model::{MICROS_PER_SECOND, Time};

/// Dispersion constant in s MHz^2 cm^3 / pc.
pub const DISPERSION_CONSTANT: f64 = 4148.808;

/// Timing model and gate of one pulsar.
#[derive(Debug, Clone, PartialEq)]
pub struct PulsarModel {
    pub period_s: f64,
    pub epoch: Time,
    /// Dispersion measure in pc / cm^3.
    pub dm: f64,
    /// Number of on-pulse bins.
    pub nbins: usize,
    /// On-pulse phase interval `[begin, end)`, both in `[0, 1]`.
    pub gate: (f64, f64),
}

/// Per-job phase folding: the timing model plus the dispersion delay of each
/// spectral channel.
#[derive(Debug, Clone)]
pub struct PulsarFolding {
    model: PulsarModel,
    channel_offsets_s: Vec<f64>,
}

impl PulsarFolding {
    /// `channel_freqs_mhz` holds the sky frequency of every spectral channel;
    /// dispersion delays are relative to the highest of them.
    pub fn new(model: PulsarModel, channel_freqs_mhz: &[f64]) -> Self {
        let f_ref = channel_freqs_mhz
            .iter()
            .copied()
            .fold(f64::MIN, f64::max);
        let channel_offsets_s = channel_freqs_mhz
            .iter()
            .map(|f| DISPERSION_CONSTANT * model.dm * (1.0 / (f * f) - 1.0 / (f_ref * f_ref)))
            .collect();
        Self {
            model,
            channel_offsets_s,
        }
    }

    /// Total number of output bins, including the off-pulse bin.
    pub fn n_bins(&self) -> usize {
        self.model.nbins + 1
    }

    /// Pulse phase in `[0, 1)` of spectral channel `channel` at time `t`.
    pub fn phase(&self, t: Time, channel: usize) -> f64 {
        let offset = self.channel_offsets_s.get(channel).copied().unwrap_or(0.0);
        let dt = (t - self.model.epoch) as f64 / MICROS_PER_SECOND as f64 - offset;
        (dt / self.model.period_s).rem_euclid(1.0)
    }

    /// Output bin of spectral channel `channel` at time `t`.
    pub fn bin_for(&self, t: Time, channel: usize) -> usize {
        let phase = self.phase(t, channel);
        let (begin, end) = self.model.gate;
        if phase < begin || phase >= end || end <= begin {
            return 0;
        }
        let bin = ((phase - begin) * self.model.nbins as f64 / (end - begin)) as usize + 1;
        bin.min(self.model.nbins)
    }
}
