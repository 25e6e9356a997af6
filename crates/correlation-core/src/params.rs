use delay_model::{MICROS_PER_SECOND, Time};

use crate::baseline::StreamSpec;
use crate::pulsar::PulsarModel;
use crate::CorrelationError;

/// Frequency layout of the channel being correlated.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelGeometry {
    /// Sky frequency of the band edge in Hz.
    pub sky_frequency: f64,
    /// Bandwidth in Hz.
    pub bandwidth: f64,
    pub upper_sideband: bool,
}

impl ChannelGeometry {
    /// Sky frequencies in MHz of the `fft_size + 1` spectral channels.
    pub fn spectral_frequencies_mhz(&self, fft_size: usize) -> Vec<f64> {
        let df = self.bandwidth / fft_size as f64;
        let sign = if self.upper_sideband { 1.0 } else { -1.0 };
        (0..=fft_size)
            .map(|k| (self.sky_frequency + sign * k as f64 * df) / 1e6)
            .collect()
    }
}

/// Everything a worker needs to correlate one job.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationParameters {
    pub slice_nr: u64,
    /// Timestamp of the first sample of every stream.
    pub start: Time,
    /// Output spectral channels; frames hold `2 * fft_size` samples.
    pub fft_size: usize,
    pub sample_rate: f64,
    pub ffts_per_integration: usize,
    pub n_integrations: usize,
    pub streams: Vec<StreamSpec>,
    pub channel: ChannelGeometry,
    pub pulsar: Option<PulsarModel>,
    /// Delay offset in seconds applied to every stream (phase-center shift).
    pub extra_delay_s: f64,
    /// Frames per stream the buffer pool can hold in flight.
    pub pool_depth: usize,
    /// Raw samples a stream may queue ahead of frame assembly.
    pub queue_limit: usize,
}

impl CorrelationParameters {
    pub fn validate(&self) -> Result<(), CorrelationError> {
        let fail = |msg: &str| Err(CorrelationError::InvalidParameters(msg.to_string()));
        if self.fft_size == 0 {
            return fail("fft_size must be positive");
        }
        if self.ffts_per_integration == 0 || self.n_integrations == 0 {
            return fail("a job needs at least one frame");
        }
        if self.streams.is_empty() {
            return fail("a job needs at least one stream");
        }
        if self.sample_rate.is_nan() || self.sample_rate <= 0.0 {
            return fail("sample_rate must be positive");
        }
        if self.pool_depth == 0 {
            return fail("pool_depth must be positive");
        }
        if self.queue_limit < self.frame_len() {
            return fail("queue_limit must hold at least one frame");
        }
        if let Some(p) = &self.pulsar {
            if p.nbins == 0 || p.period_s.is_nan() || p.period_s <= 0.0 {
                return fail("pulsar needs a positive period and at least one bin");
            }
        }
        Ok(())
    }

    pub fn frame_len(&self) -> usize {
        2 * self.fft_size
    }

    pub fn total_frames(&self) -> usize {
        self.ffts_per_integration * self.n_integrations
    }

    /// Samples each stream must deliver for the whole job.
    pub fn samples_per_stream(&self) -> usize {
        self.total_frames() * self.frame_len()
    }

    pub fn n_bins(&self) -> usize {
        self.pulsar.as_ref().map_or(1, |p| p.nbins + 1)
    }

    /// Timestamp of the first sample of frame `index`.
    pub fn frame_start(&self, index: usize) -> Time {
        let offset_s = (index * self.frame_len()) as f64 / self.sample_rate;
        self.start + (offset_s * MICROS_PER_SECOND as f64).round() as i64
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::params;
    use super::*;

    #[test]
    fn test_frame_bookkeeping() {
        let p = params(3, 8, 4);
        assert_eq!(p.frame_len(), 16);
        assert_eq!(p.samples_per_stream(), 64);
        assert_eq!(p.frame_start(2), Time::from_micros(10_000_032));
        assert_eq!(p.n_bins(), 1);
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_job() {
        let mut p = params(0, 8, 4);
        assert!(p.validate().is_err());
        p = params(2, 8, 0);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_queue_shorter_than_a_frame() {
        let mut p = params(2, 8, 4);
        p.queue_limit = p.frame_len() - 1;
        assert!(p.validate().is_err());
        p.queue_limit = p.frame_len();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_spectral_frequencies() {
        let geometry = ChannelGeometry {
            sky_frequency: 1.0e9,
            bandwidth: 8.0e6,
            upper_sideband: false,
        };
        let f = geometry.spectral_frequencies_mhz(4);
        assert_eq!(f, vec![1000.0, 998.0, 996.0, 994.0, 992.0]);
    }
}
