//! # Correlation Engine
//!
//! A worker-local, cooperative pipeline of three tasklets:
//!
//! 1. [`Tasklet::FrameAssembly`] cuts one frame per stream out of the queued
//!    samples into pool slots. It only runs when every stream has a full frame
//!    queued, which keeps all streams frame-aligned.
//! 2. [`Tasklet::DelayCorrection`] runs the delay kernel on each frame.
//! 3. [`Tasklet::Correlation`] multiplies the spectra of every baseline into
//!    the accumulators and, at an integration boundary, normalises and emits
//!    one [`OutputRecord`] per bin.
//!
//! The driver never preempts: each [`CorrelationEngine::step`] runs exactly one
//! unit of work of the most downstream tasklet that has work, so buffers flow
//! back to the pool before new frames are cut.

use std::collections::VecDeque;
use std::sync::Arc;

use delay_model::{DelayKernel, DelayTable, SampleWindow};
use num_complex::Complex32;
use tracing::{debug, trace};

use crate::CorrelationError;
use crate::baseline::{Baseline, baselines};
use crate::buffer_pool::{BufferPool, BufferPoolStats, SlotId};
use crate::params::CorrelationParameters;
use crate::pulsar::PulsarFolding;
use crate::record::{BaselineProduct, OutputRecord};

/// Pipeline stages, in the order data flows through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tasklet {
    FrameAssembly,
    DelayCorrection,
    Correlation,
}

impl Tasklet {
    /// Dispatch order of the driver: downstream first.
    pub const PRIORITY: [Tasklet; 3] = [
        Tasklet::Correlation,
        Tasklet::DelayCorrection,
        Tasklet::FrameAssembly,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Tasklet::FrameAssembly => "frame_assembly",
            Tasklet::DelayCorrection => "delay_correction",
            Tasklet::Correlation => "correlation",
        }
    }
}

/// Delay model and kernel of one input stream.
pub struct StreamInput<K> {
    pub model: Arc<DelayTable>,
    pub kernel: K,
}

struct StreamState<K> {
    model: Arc<DelayTable>,
    kernel: K,
    pending: VecDeque<f32>,
    /// Samples accepted so far, including ones beyond the job window.
    received: usize,
    ended: bool,
}

#[derive(Debug)]
struct Frame {
    index: usize,
    slots: Vec<SlotId>,
    flagged: Vec<bool>,
}

pub struct CorrelationEngine<K> {
    params: CorrelationParameters,
    streams: Vec<StreamState<K>>,
    baselines: Vec<Baseline>,
    folding: Option<PulsarFolding>,
    samples: BufferPool<f32>,
    spectra: BufferPool<Complex32>,
    assembled: VecDeque<Frame>,
    corrected: VecDeque<Frame>,
    /// `[bin][baseline][fft_size + 1]`
    accumulators: Vec<Vec<Vec<Complex32>>>,
    /// Contributions per accumulator element, same shape.
    hits: Vec<Vec<Vec<u32>>>,
    bin_scratch: Vec<usize>,
    frames_assembled: usize,
    frames_in_integration: usize,
    integration_nr: usize,
    records: Vec<OutputRecord>,
}

impl<K: DelayKernel> CorrelationEngine<K> {
    pub fn new(
        params: CorrelationParameters,
        inputs: Vec<StreamInput<K>>,
    ) -> Result<Self, CorrelationError> {
        params.validate()?;
        if inputs.len() != params.streams.len() {
            return Err(CorrelationError::InvalidParameters(format!(
                "{} stream inputs for {} streams",
                inputs.len(),
                params.streams.len()
            )));
        }
        if let Some(k) = inputs.iter().find(|i| i.kernel.fft_size() != params.fft_size) {
            return Err(CorrelationError::InvalidParameters(format!(
                "kernel fft size {} does not match job fft size {}",
                k.kernel.fft_size(),
                params.fft_size
            )));
        }

        let n_streams = inputs.len();
        let n_bins = params.n_bins();
        let spectrum_len = params.fft_size + 1;
        let baselines = baselines(n_streams);
        let folding = params.pulsar.clone().map(|model| {
            PulsarFolding::new(
                model,
                &params.channel.spectral_frequencies_mhz(params.fft_size),
            )
        });

        let streams = inputs
            .into_iter()
            .map(|input| StreamState {
                model: input.model,
                kernel: input.kernel,
                pending: VecDeque::with_capacity(
                    params.queue_limit.min(params.samples_per_stream()),
                ),
                received: 0,
                ended: false,
            })
            .collect();

        debug!(
            slice_nr = params.slice_nr,
            streams = n_streams,
            baselines = baselines.len(),
            bins = n_bins,
            frames = params.total_frames(),
            "Correlation engine ready"
        );

        Ok(Self {
            samples: BufferPool::new(params.pool_depth * n_streams, params.frame_len()),
            spectra: BufferPool::new(params.pool_depth * n_streams, spectrum_len),
            accumulators: vec![
                vec![vec![Complex32::default(); spectrum_len]; baselines.len()];
                n_bins
            ],
            hits: vec![vec![vec![0; spectrum_len]; baselines.len()]; n_bins],
            bin_scratch: vec![0; spectrum_len],
            params,
            streams,
            baselines,
            folding,
            assembled: VecDeque::new(),
            corrected: VecDeque::new(),
            frames_assembled: 0,
            frames_in_integration: 0,
            integration_nr: 0,
            records: Vec::new(),
        })
    }

    pub fn params(&self) -> &CorrelationParameters {
        &self.params
    }

    pub fn baselines(&self) -> &[Baseline] {
        &self.baselines
    }

    /// Queues raw samples for `stream` and returns how many were taken.
    ///
    /// A stream holds at most `queue_limit` samples ahead of frame assembly;
    /// the caller keeps the rest until frames have been cut. Samples beyond
    /// the job window are taken and dropped.
    pub fn push_samples(
        &mut self,
        stream: usize,
        samples: &[f32],
    ) -> Result<usize, CorrelationError> {
        let needed = self.params.samples_per_stream();
        let limit = self.params.queue_limit;
        let state = self
            .streams
            .get_mut(stream)
            .ok_or(CorrelationError::UnknownStream(stream))?;
        if state.ended {
            return Err(CorrelationError::StreamClosed(stream));
        }
        let wanted = needed.saturating_sub(state.received).min(samples.len());
        let room = limit.saturating_sub(state.pending.len());
        if wanted > room {
            state.pending.extend(&samples[..room]);
            state.received += room;
            return Ok(room);
        }
        state.pending.extend(&samples[..wanted]);
        state.received += samples.len();
        Ok(samples.len())
    }

    /// Marks `stream` as exhausted; no more samples will arrive.
    pub fn end_of_stream(&mut self, stream: usize) -> Result<(), CorrelationError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or(CorrelationError::UnknownStream(stream))?;
        state.ended = true;
        Ok(())
    }

    pub fn has_work(&self, tasklet: Tasklet) -> bool {
        let n_streams = self.streams.len();
        match tasklet {
            Tasklet::FrameAssembly => {
                self.frames_assembled < self.params.total_frames()
                    && self.samples.free_slots() >= n_streams
                    && self
                        .streams
                        .iter()
                        .all(|s| s.pending.len() >= self.params.frame_len())
            }
            Tasklet::DelayCorrection => {
                !self.assembled.is_empty() && self.spectra.free_slots() >= n_streams
            }
            Tasklet::Correlation => !self.corrected.is_empty(),
        }
    }

    /// Runs one unit of work of `tasklet`. Returns `false` when it had none.
    pub fn do_task(&mut self, tasklet: Tasklet) -> Result<bool, CorrelationError> {
        if !self.has_work(tasklet) {
            return Ok(false);
        }
        trace!(tasklet = tasklet.name(), "Running tasklet");
        match tasklet {
            Tasklet::FrameAssembly => self.assemble_frame(),
            Tasklet::DelayCorrection => self.correct_frame()?,
            Tasklet::Correlation => self.correlate_frame(),
        }
        Ok(true)
    }

    /// Runs the highest-priority tasklet that has work.
    ///
    /// Returns `Ok(None)` when the pipeline is stalled waiting for input, and
    /// [`CorrelationError::StreamUnderrun`] when it is stalled on a stream
    /// that has already ended.
    pub fn step(&mut self) -> Result<Option<Tasklet>, CorrelationError> {
        for tasklet in Tasklet::PRIORITY {
            if self.do_task(tasklet)? {
                return Ok(Some(tasklet));
            }
        }
        self.check_underrun()?;
        Ok(None)
    }

    /// Steps until stalled; returns the number of tasks run.
    pub fn run_until_stalled(&mut self) -> Result<usize, CorrelationError> {
        let mut tasks = 0;
        while self.step()?.is_some() {
            tasks += 1;
        }
        Ok(tasks)
    }

    /// All integrations of the job have been emitted.
    pub fn finished(&self) -> bool {
        self.integration_nr == self.params.n_integrations
    }

    pub fn take_records(&mut self) -> Vec<OutputRecord> {
        std::mem::take(&mut self.records)
    }

    /// `(sample pool, spectrum pool)` statistics.
    pub fn pool_stats(&self) -> (BufferPoolStats, BufferPoolStats) {
        (self.samples.stats(), self.spectra.stats())
    }

    fn check_underrun(&self) -> Result<(), CorrelationError> {
        let total = self.params.total_frames();
        if self.frames_assembled >= total {
            return Ok(());
        }
        let frame_len = self.params.frame_len();
        match self
            .streams
            .iter()
            .position(|s| s.ended && s.pending.len() < frame_len)
        {
            Some(stream) => Err(CorrelationError::StreamUnderrun {
                stream,
                needed: (total - self.frames_assembled) * frame_len,
                available: self.streams[stream].pending.len(),
            }),
            None => Ok(()),
        }
    }

    fn assemble_frame(&mut self) {
        let frame_len = self.params.frame_len();
        let mut slots = Vec::with_capacity(self.streams.len());
        let mut flagged = Vec::with_capacity(self.streams.len());

        for stream in self.streams.iter_mut() {
            let Some(slot) = self.samples.acquire() else {
                break;
            };
            let buf = self.samples.get_mut(slot);
            for (dst, src) in buf.iter_mut().zip(stream.pending.drain(..frame_len)) {
                *dst = src;
            }
            // non-finite samples flag the whole frame of this stream
            let bad = buf.iter().any(|x| !x.is_finite());
            if bad {
                buf.fill(0.0);
            }
            slots.push(slot);
            flagged.push(bad);
        }

        self.assembled.push_back(Frame {
            index: self.frames_assembled,
            slots,
            flagged,
        });
        self.frames_assembled += 1;
    }

    fn correct_frame(&mut self) -> Result<(), CorrelationError> {
        let Some(frame) = self.assembled.pop_front() else {
            return Ok(());
        };
        let start = self.params.frame_start(frame.index);
        let sample_rate = self.params.sample_rate;
        let extra_delay_s = self.params.extra_delay_s;

        let mut spectrum_slots = Vec::with_capacity(frame.slots.len());
        for (idx, (stream, &slot)) in self.streams.iter_mut().zip(&frame.slots).enumerate() {
            let Some(spectrum_slot) = self.spectra.acquire() else {
                break;
            };
            let window = SampleWindow {
                start,
                samples: self.samples.get_mut(slot),
                sample_rate,
                extra_delay_s,
            };
            let result =
                stream
                    .kernel
                    .correct(&stream.model, window, self.spectra.get_mut(spectrum_slot));
            self.samples.release(slot);
            spectrum_slots.push(spectrum_slot);
            result.map_err(|source| CorrelationError::Delay {
                stream: idx,
                source,
            })?;
        }

        self.corrected.push_back(Frame {
            index: frame.index,
            slots: spectrum_slots,
            flagged: frame.flagged,
        });
        Ok(())
    }

    fn correlate_frame(&mut self) {
        let Some(frame) = self.corrected.pop_front() else {
            return;
        };

        match &self.folding {
            Some(folding) => {
                let t = self.params.frame_start(frame.index);
                for (k, bin) in self.bin_scratch.iter_mut().enumerate() {
                    *bin = folding.bin_for(t, k);
                }
            }
            None => self.bin_scratch.fill(0),
        }

        for (b, baseline) in self.baselines.iter().enumerate() {
            if frame.flagged[baseline.first] || frame.flagged[baseline.second] {
                continue;
            }
            let x = self.spectra.get(frame.slots[baseline.first]);
            let y = self.spectra.get(frame.slots[baseline.second]);
            for (k, &bin) in self.bin_scratch.iter().enumerate() {
                let product = if baseline.is_auto() {
                    Complex32::new(x[k].norm_sqr(), 0.0)
                } else {
                    x[k] * y[k].conj()
                };
                self.accumulators[bin][b][k] += product;
                self.hits[bin][b][k] += 1;
            }
        }

        for slot in frame.slots {
            self.spectra.release(slot);
        }

        self.frames_in_integration += 1;
        if self.frames_in_integration == self.params.ffts_per_integration {
            self.finish_integration();
        }
    }

    fn finish_integration(&mut self) {
        let spectrum_len = self.params.fft_size + 1;
        let full = (self.params.ffts_per_integration * spectrum_len) as f32;

        for bin in 0..self.accumulators.len() {
            let mut products = Vec::with_capacity(self.baselines.len());
            for (b, baseline) in self.baselines.iter().enumerate() {
                let acc = &mut self.accumulators[bin][b];
                let hits = &mut self.hits[bin][b];

                let spectrum: Vec<Complex32> = acc
                    .iter()
                    .zip(hits.iter())
                    .map(|(v, &n)| if n == 0 { Complex32::default() } else { *v / n as f32 })
                    .collect();
                let weight = hits.iter().map(|&n| n as u64).sum::<u64>() as f32 / full;

                acc.fill(Complex32::default());
                hits.fill(0);

                products.push(BaselineProduct {
                    first: self.params.streams[baseline.first],
                    second: self.params.streams[baseline.second],
                    weight,
                    spectrum,
                });
            }
            self.records.push(OutputRecord {
                slice_nr: self.params.slice_nr,
                integration_nr: self.integration_nr,
                bin,
                baselines: products,
            });
        }

        debug!(
            slice_nr = self.params.slice_nr,
            integration = self.integration_nr,
            bins = self.accumulators.len(),
            "Integration complete"
        );
        self.integration_nr += 1;
        self.frames_in_integration = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::test_utils::params;
    use crate::pulsar::PulsarModel;
    use delay_model::{DelayError, FftDelayKernel, Time};
    use rstest::rstest;

    /// Copies the first `fft_size + 1` samples into the spectrum.
    struct CopyKernel(usize);

    impl DelayKernel for CopyKernel {
        fn fft_size(&self) -> usize {
            self.0
        }

        fn correct(
            &mut self,
            _model: &DelayTable,
            window: SampleWindow<'_>,
            spectrum: &mut [Complex32],
        ) -> Result<(), DelayError> {
            for (dst, src) in spectrum.iter_mut().zip(window.samples.iter()) {
                *dst = Complex32::new(*src, 0.0);
            }
            Ok(())
        }
    }

    fn flat_model() -> Arc<DelayTable> {
        let rows: Vec<(Time, f64)> = (0..8)
            .map(|i| (Time::from_micros(9_000_000 + i * 1_000_000), 0.0))
            .collect();
        Arc::new(DelayTable::from_rows(&rows).unwrap())
    }

    fn copy_engine(p: CorrelationParameters) -> CorrelationEngine<CopyKernel> {
        let inputs = p
            .streams
            .iter()
            .map(|_| StreamInput {
                model: flat_model(),
                kernel: CopyKernel(p.fft_size),
            })
            .collect();
        CorrelationEngine::new(p, inputs).unwrap()
    }

    #[test]
    fn test_zero_input_gives_zero_record() {
        let p = params(3, 4, 2);
        let n = p.samples_per_stream();
        let mut engine = copy_engine(p);
        for s in 0..3 {
            engine.push_samples(s, &vec![0.0; n]).unwrap();
        }
        engine.run_until_stalled().unwrap();

        assert!(engine.finished());
        let records = engine.take_records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].slice_nr, 7);
        assert_eq!(records[0].baseline_count(), 6);
        for product in &records[0].baselines {
            assert_eq!(product.spectrum.len(), 5);
            assert_eq!(product.weight, 1.0);
            assert!(product.spectrum.iter().all(|c| *c == Complex32::default()));
        }
    }

    #[rstest]
    #[case(0, true)]
    #[case(1, false)]
    fn test_stream_ends_at_last_sample(#[case] short_by: usize, #[case] succeeds: bool) {
        let p = params(2, 4, 3);
        let n = p.samples_per_stream();
        let mut engine = copy_engine(p);
        engine.push_samples(0, &vec![1.0; n]).unwrap();
        engine.push_samples(1, &vec![1.0; n - short_by]).unwrap();
        engine.end_of_stream(0).unwrap();
        engine.end_of_stream(1).unwrap();

        let result = engine.run_until_stalled();
        if succeeds {
            assert!(result.is_ok());
            assert!(engine.finished());
        } else {
            assert_eq!(
                result,
                Err(CorrelationError::StreamUnderrun {
                    stream: 1,
                    needed: 8,
                    available: 7
                })
            );
            assert!(!engine.finished());
        }
    }

    #[test]
    fn test_stalls_until_all_streams_have_a_frame() {
        let p = params(2, 4, 1);
        let mut engine = copy_engine(p);
        engine.push_samples(0, &[1.0; 8]).unwrap();
        engine.push_samples(1, &[1.0; 5]).unwrap();

        assert!(!engine.has_work(Tasklet::FrameAssembly));
        assert_eq!(engine.step(), Ok(None));

        engine.push_samples(1, &[1.0; 3]).unwrap();
        assert_eq!(engine.step(), Ok(Some(Tasklet::FrameAssembly)));
        assert_eq!(engine.step(), Ok(Some(Tasklet::DelayCorrection)));
        assert_eq!(engine.step(), Ok(Some(Tasklet::Correlation)));
        assert!(engine.finished());
    }

    #[test]
    fn test_accumulates_products() {
        let p = params(2, 1, 2);
        let mut engine = copy_engine(p);
        // frames of 2 samples; spectrum = [s0, s1]
        engine.push_samples(0, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        engine.push_samples(1, &[2.0, 0.0, 1.0, 1.0]).unwrap();
        engine.run_until_stalled().unwrap();

        let record = engine.take_records().remove(0);
        let spectra: Vec<Vec<f32>> = record
            .baselines
            .iter()
            .map(|b| b.spectrum.iter().map(|c| c.re).collect())
            .collect();
        assert_eq!(spectra[0], vec![5.0, 10.0]);
        assert_eq!(spectra[1], vec![2.5, 0.5]);
        assert_eq!(spectra[2], vec![2.5, 2.0]);
    }

    #[test]
    fn test_identical_streams_cross_equals_auto() {
        let p = params(2, 8, 3);
        let n = p.samples_per_stream();
        let inputs = (0..2)
            .map(|_| StreamInput {
                model: flat_model(),
                kernel: FftDelayKernel::new(8, p.channel.sky_frequency, true),
            })
            .collect();
        let mut engine = CorrelationEngine::new(p, inputs).unwrap();
        let signal: Vec<f32> = (0..n).map(|i| ((i * 13) % 7) as f32 - 3.0).collect();
        engine.push_samples(0, &signal).unwrap();
        engine.push_samples(1, &signal).unwrap();
        engine.run_until_stalled().unwrap();

        let record = engine.take_records().remove(0);
        let auto = &record.baselines[0].spectrum;
        let cross = &record.baselines[2].spectrum;
        for (a, c) in auto.iter().zip(cross) {
            assert!((*a - *c).norm() <= 1e-3 * a.norm().max(1.0));
        }
    }

    #[test]
    fn test_flagged_frames_reduce_weight() {
        let p = params(2, 1, 2);
        let mut engine = copy_engine(p);
        engine.push_samples(0, &[1.0, 1.0, 1.0, 1.0]).unwrap();
        engine.push_samples(1, &[f32::NAN, 1.0, 2.0, 2.0]).unwrap();
        engine.run_until_stalled().unwrap();

        let record = engine.take_records().remove(0);
        assert_eq!(record.baselines[0].weight, 1.0);
        assert_eq!(record.baselines[1].weight, 0.5);
        assert_eq!(record.baselines[2].weight, 0.5);
        // only the unflagged frame counts
        assert_eq!(record.baselines[1].spectrum[0].re, 4.0);
        assert_eq!(record.baselines[2].spectrum[0].re, 2.0);
    }

    #[test]
    fn test_pulsar_bins() {
        let mut p = params(1, 4, 4);
        p.pulsar = Some(PulsarModel {
            period_s: 16e-6,
            epoch: p.start + -4,
            dm: 0.0,
            nbins: 2,
            gate: (0.0, 1.0),
        });
        let n = p.samples_per_stream();
        let mut engine = copy_engine(p);
        engine.push_samples(0, &vec![1.0; n]).unwrap();
        engine.run_until_stalled().unwrap();

        let records = engine.take_records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records.iter().map(|r| r.bin).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(records[0].baselines[0].weight, 0.0);
        assert_eq!(records[1].baselines[0].weight, 0.5);
        assert_eq!(records[2].baselines[0].weight, 0.5);
        assert!(records[1].baselines[0].spectrum.iter().all(|c| c.re == 1.0));
    }

    #[test]
    fn test_multiple_integrations_and_pool_bounds() {
        let mut p = params(3, 4, 2);
        p.n_integrations = 3;
        p.pool_depth = 1;
        let n = p.samples_per_stream();
        let mut engine = copy_engine(p);
        for s in 0..3 {
            engine.push_samples(s, &vec![0.5; n]).unwrap();
        }
        engine.run_until_stalled().unwrap();

        assert!(engine.finished());
        let records = engine.take_records();
        assert_eq!(
            records.iter().map(|r| r.integration_nr).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        let (samples, spectra) = engine.pool_stats();
        assert_eq!(samples.capacity, 3);
        assert!(samples.allocations <= 3);
        assert_eq!(samples.in_use, 0);
        assert_eq!(spectra.in_use, 0);
    }

    #[test]
    fn test_full_queue_defers_input_until_frames_are_cut() {
        let mut p = params(2, 4, 4);
        p.queue_limit = p.frame_len();
        let mut engine = copy_engine(p);
        let chunk = [1.0; 20];

        assert_eq!(engine.push_samples(0, &chunk).unwrap(), 8);
        assert_eq!(engine.push_samples(0, &chunk[8..]).unwrap(), 0);
        assert_eq!(engine.push_samples(1, &chunk[..8]).unwrap(), 8);

        engine.run_until_stalled().unwrap();
        assert_eq!(engine.push_samples(0, &chunk[8..]).unwrap(), 8);
        assert_eq!(engine.push_samples(1, &chunk[..8]).unwrap(), 8);
        engine.run_until_stalled().unwrap();
        for _ in 0..2 {
            for s in 0..2 {
                assert_eq!(engine.push_samples(s, &chunk[..8]).unwrap(), 8);
            }
            engine.run_until_stalled().unwrap();
        }
        assert!(engine.finished());

        // Past the job window everything is taken and dropped.
        assert_eq!(engine.push_samples(0, &chunk).unwrap(), 20);
    }

    #[test]
    fn test_push_after_end_is_rejected() {
        let mut engine = copy_engine(params(1, 4, 1));
        engine.end_of_stream(0).unwrap();
        assert_eq!(
            engine.push_samples(0, &[1.0]),
            Err(CorrelationError::StreamClosed(0))
        );
        assert_eq!(
            engine.push_samples(3, &[1.0]),
            Err(CorrelationError::UnknownStream(3))
        );
    }
}
