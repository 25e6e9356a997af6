//! Delay-correction kernel.
//!
//! The worker pipeline treats this as a pure function of a delay model and a
//! sample window: one frame of `2 * fft_size` real samples in, `fft_size + 1`
//! complex spectral channels out.

use std::f64::consts::PI;
use std::sync::Arc;

use num_complex::{Complex, Complex32};
use realfft::{RealFftPlanner, RealToComplex};

use crate::table::DelayTable;
use crate::time::{MICROS_PER_SECOND, Time};
use crate::DelayError;

/// One frame of raw samples for one station stream.
#[derive(Debug)]
pub struct SampleWindow<'a> {
    /// Timestamp of the first sample.
    pub start: Time,
    pub samples: &'a mut [f32],
    /// Samples per second.
    pub sample_rate: f64,
    /// Extra delay in seconds on top of the table, e.g. a phase-center shift.
    pub extra_delay_s: f64,
}

impl SampleWindow<'_> {
    pub fn midpoint(&self) -> Time {
        let half_us = self.samples.len() as f64 * 0.5 / self.sample_rate * MICROS_PER_SECOND as f64;
        self.start + half_us.round() as i64
    }
}

/// Produces a delay-corrected spectrum for one frame.
pub trait DelayKernel {
    /// Number of output spectral channels; spectra hold `fft_size() + 1` bins.
    fn fft_size(&self) -> usize;

    /// Writes the corrected spectrum of `window` into `spectrum`.
    ///
    /// The window's samples may be used as scratch space.
    fn correct(
        &mut self,
        model: &DelayTable,
        window: SampleWindow<'_>,
        spectrum: &mut [Complex32],
    ) -> Result<(), DelayError>;
}

/// Real-to-complex FFT followed by a fringe and fractional-delay rotation.
pub struct FftDelayKernel {
    fft_size: usize,
    /// Sky frequency of the channel edge in Hz.
    sky_frequency: f64,
    upper_sideband: bool,
    forward: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
}

impl FftDelayKernel {
    pub fn new(fft_size: usize, sky_frequency: f64, upper_sideband: bool) -> Self {
        let mut planner = RealFftPlanner::<f32>::new();
        let forward = planner.plan_fft_forward(2 * fft_size);
        let scratch = forward.make_scratch_vec();
        Self {
            fft_size,
            sky_frequency,
            upper_sideband,
            forward,
            scratch,
        }
    }

    pub fn frame_len(&self) -> usize {
        2 * self.fft_size
    }
}

impl std::fmt::Debug for FftDelayKernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FftDelayKernel")
            .field("fft_size", &self.fft_size)
            .field("sky_frequency", &self.sky_frequency)
            .field("upper_sideband", &self.upper_sideband)
            .finish()
    }
}

impl DelayKernel for FftDelayKernel {
    fn fft_size(&self) -> usize {
        self.fft_size
    }

    fn correct(
        &mut self,
        model: &DelayTable,
        window: SampleWindow<'_>,
        spectrum: &mut [Complex32],
    ) -> Result<(), DelayError> {
        if window.samples.len() != self.frame_len() {
            return Err(DelayError::FrameLength {
                expected: self.frame_len(),
                actual: window.samples.len(),
            });
        }
        if spectrum.len() != self.fft_size + 1 {
            return Err(DelayError::FrameLength {
                expected: self.fft_size + 1,
                actual: spectrum.len(),
            });
        }

        let tau = model.delay_at(window.midpoint())? + window.extra_delay_s;

        self.forward
            .process_with_scratch(window.samples, spectrum, &mut self.scratch)
            .map_err(|e| DelayError::Fft(e.to_string()))?;

        // phase = -2*pi*(f_sky + k*df)*tau, accumulated as a rotating phasor
        let df = window.sample_rate / self.frame_len() as f64;
        let df = if self.upper_sideband { df } else { -df };
        let carrier = Complex::from_polar(1.0, -2.0 * PI * self.sky_frequency * tau);
        let step = Complex::from_polar(1.0, -2.0 * PI * df * tau);

        let mut rot: Complex<f64> = carrier;
        for bin in spectrum.iter_mut() {
            let r = Complex32::new(rot.re as f32, rot.im as f32);
            *bin *= r;
            rot *= step;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_table(delay: f64) -> DelayTable {
        let rows: Vec<(Time, f64)> = (0..6)
            .map(|i| (Time::from_micros(1_000_000 + i * 1_000_000), delay))
            .collect();
        DelayTable::from_rows(&rows).unwrap()
    }

    fn window(samples: &mut [f32]) -> SampleWindow<'_> {
        SampleWindow {
            start: Time::from_micros(2_000_000),
            samples,
            sample_rate: 1024.0,
            extra_delay_s: 0.0,
        }
    }

    #[test]
    fn test_zero_input_gives_zero_spectrum() {
        let mut kernel = FftDelayKernel::new(8, 1.0e9, true);
        let mut samples = vec![0.0f32; 16];
        let mut spectrum = vec![Complex32::new(1.0, 1.0); 9];

        kernel
            .correct(&flat_table(1e-3), window(&mut samples), &mut spectrum)
            .unwrap();
        assert!(spectrum.iter().all(|c| c.norm() == 0.0));
    }

    #[test]
    fn test_zero_delay_keeps_spectrum() {
        let mut kernel = FftDelayKernel::new(4, 0.0, true);
        let mut samples = vec![1.0f32; 8];
        let mut spectrum = vec![Complex32::default(); 5];

        kernel
            .correct(&flat_table(0.0), window(&mut samples), &mut spectrum)
            .unwrap();
        assert!((spectrum[0].re - 8.0).abs() < 1e-5);
        assert!(spectrum[1..].iter().all(|c| c.norm() < 1e-5));
    }

    #[test]
    fn test_rotation_preserves_power() {
        let mut kernel = FftDelayKernel::new(8, 1.4e9, false);
        let input: Vec<f32> = (0..16).map(|i| ((i * 7) % 5) as f32 - 2.0).collect();

        let mut reference = vec![Complex32::default(); 9];
        kernel
            .correct(&flat_table(0.0), window(&mut input.clone()), &mut reference)
            .unwrap();

        let mut rotated = vec![Complex32::default(); 9];
        kernel
            .correct(&flat_table(3.3e-7), window(&mut input.clone()), &mut rotated)
            .unwrap();

        for (a, b) in reference.iter().zip(&rotated) {
            assert!((a.norm() - b.norm()).abs() < 1e-3);
        }
    }

    #[test]
    fn test_rejects_wrong_frame_length() {
        let mut kernel = FftDelayKernel::new(8, 0.0, true);
        let mut samples = vec![0.0f32; 10];
        let mut spectrum = vec![Complex32::default(); 9];
        assert_eq!(
            kernel.correct(&flat_table(0.0), window(&mut samples), &mut spectrum),
            Err(DelayError::FrameLength {
                expected: 16,
                actual: 10
            })
        );
    }

    #[test]
    fn test_out_of_range_delay() {
        let mut kernel = FftDelayKernel::new(8, 0.0, true);
        let mut samples = vec![0.0f32; 16];
        let mut spectrum = vec![Complex32::default(); 9];
        let w = SampleWindow {
            start: Time::from_micros(50_000_000),
            samples: &mut samples,
            sample_rate: 1024.0,
            extra_delay_s: 0.0,
        };
        assert!(matches!(
            kernel.correct(&flat_table(0.0), w, &mut spectrum),
            Err(DelayError::OutOfRange { .. })
        ));
    }
}
