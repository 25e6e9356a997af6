//! Output aggregator node and the correlator output format.
//!
//! Records arrive in completion order. They are held per slice and written
//! strictly in `slice_nr` order; a failed slice is skipped and counted as
//! missing. Once every assigned slice is accounted for, the node tells the
//! scheduler it has drained.
//!
//! All multi-byte values are little-endian.
//!
//! ```text
//! global header (once per file, 58 bytes)
//! Offset  Size  Field
//! 0       4     header_size
//! 4       32    experiment name, NUL padded
//! 36      2     start year
//! 38      2     start day of year
//! 40      4     start seconds of day
//! 44      4     number of spectral channels
//! 48      4     integration time in microseconds
//! 52      1     output format version
//! 53      1     correlator version
//! 54      1     polarisation type (0 right, 1 left, 2 both)
//! 55      3     reserved
//!
//! record
//! 8     slice_nr
//! 4     integration_nr
//! 4     bin
//! 4     phase center (-1 for none)
//! 4     baseline count
//! per baseline:
//!   2 station 1, 2 station 2, 1 pol 1, 1 pol 2, 4 weight (f32),
//!   (fft_size + 1) x (re f32, im f32)
//! ```

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use correlation_core::{OutputRecord, Polarisation};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{NodeOutcome, NodeResult};
use crate::config::CorrelationConfig;
use crate::scheduler::messages::{OutputMessage, SchedulerEvent};
use crate::{Error, Result};

pub const OUTPUT_FORMAT_VERSION: u8 = 1;
pub const CORRELATOR_VERSION: u8 = 1;

const EXPERIMENT_NAME_LEN: usize = 32;

/// Run-wide header written at the start of every output file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalHeader {
    pub experiment: String,
    pub start_year: u16,
    pub start_day: u16,
    pub start_seconds: u32,
    pub number_channels: u32,
    pub integration_time_us: i32,
    pub output_format_version: u8,
    pub correlator_version: u8,
    pub polarisation_type: u8,
}

impl GlobalHeader {
    pub const SIZE: usize = 58;

    pub fn from_config(config: &CorrelationConfig) -> Result<Self> {
        let (year, day, seconds) = config
            .start
            .year_day_seconds()
            .ok_or_else(|| Error::Other(format!("start time {} out of range", config.start)))?;

        let mut right = false;
        let mut left = false;
        for channel in config.scans.iter().flat_map(|s| s.mode.channels.iter()) {
            match channel.polarisation {
                Polarisation::Right => right = true,
                Polarisation::Left => left = true,
            }
        }
        let polarisation_type = match (right, left) {
            (true, true) => 2,
            (false, true) => 1,
            _ => 0,
        };

        Ok(Self {
            experiment: config.experiment.clone(),
            start_year: year as u16,
            start_day: day as u16,
            start_seconds: seconds,
            number_channels: config.fft_size as u32,
            integration_time_us: config.integration_time_us as i32,
            output_format_version: OUTPUT_FORMAT_VERSION,
            correlator_version: CORRELATOR_VERSION,
            polarisation_type,
        })
    }

    pub fn mux<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(Self::SIZE as i32)?;
        let mut name = [0u8; EXPERIMENT_NAME_LEN];
        let bytes = self.experiment.as_bytes();
        let len = bytes.len().min(EXPERIMENT_NAME_LEN - 1);
        name[..len].copy_from_slice(&bytes[..len]);
        writer.write_all(&name)?;
        writer.write_u16::<LittleEndian>(self.start_year)?;
        writer.write_u16::<LittleEndian>(self.start_day)?;
        writer.write_u32::<LittleEndian>(self.start_seconds)?;
        writer.write_u32::<LittleEndian>(self.number_channels)?;
        writer.write_i32::<LittleEndian>(self.integration_time_us)?;
        writer.write_u8(self.output_format_version)?;
        writer.write_u8(self.correlator_version)?;
        writer.write_u8(self.polarisation_type)?;
        writer.write_all(&[0u8; 3])?;
        Ok(())
    }

    pub fn demux<R: io::Read>(reader: &mut R) -> io::Result<Self> {
        let size = reader.read_i32::<LittleEndian>()?;
        if size as usize != Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected header size {size}"),
            ));
        }
        let mut name = [0u8; EXPERIMENT_NAME_LEN];
        reader.read_exact(&mut name)?;
        let end = name.iter().position(|&b| b == 0).unwrap_or(EXPERIMENT_NAME_LEN);
        let experiment = String::from_utf8_lossy(&name[..end]).into_owned();

        let header = Self {
            experiment,
            start_year: reader.read_u16::<LittleEndian>()?,
            start_day: reader.read_u16::<LittleEndian>()?,
            start_seconds: reader.read_u32::<LittleEndian>()?,
            number_channels: reader.read_u32::<LittleEndian>()?,
            integration_time_us: reader.read_i32::<LittleEndian>()?,
            output_format_version: reader.read_u8()?,
            correlator_version: reader.read_u8()?,
            polarisation_type: reader.read_u8()?,
        };
        let mut reserved = [0u8; 3];
        reader.read_exact(&mut reserved)?;
        Ok(header)
    }
}

/// Writes one record; `phase_center` is the source index, if any.
pub fn write_record<W: Write>(
    writer: &mut W,
    phase_center: Option<usize>,
    record: &OutputRecord,
) -> io::Result<()> {
    writer.write_u64::<LittleEndian>(record.slice_nr)?;
    writer.write_u32::<LittleEndian>(record.integration_nr as u32)?;
    writer.write_u32::<LittleEndian>(record.bin as u32)?;
    writer.write_i32::<LittleEndian>(phase_center.map_or(-1, |p| p as i32))?;
    writer.write_u32::<LittleEndian>(record.baseline_count() as u32)?;
    for product in &record.baselines {
        writer.write_u16::<LittleEndian>(product.first.station as u16)?;
        writer.write_u16::<LittleEndian>(product.second.station as u16)?;
        writer.write_u8(product.first.polarisation.code())?;
        writer.write_u8(product.second.polarisation.code())?;
        writer.write_f32::<LittleEndian>(product.weight)?;
        for value in &product.spectrum {
            writer.write_f32::<LittleEndian>(value.re)?;
            writer.write_f32::<LittleEndian>(value.im)?;
        }
    }
    Ok(())
}

/// How records are split over output files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLayout {
    Single,
    /// One file per pulsar bin.
    PerBin(usize),
    /// One file per phase center, in source-index order.
    PerSource(Vec<String>),
}

impl OutputLayout {
    pub fn from_config(config: &CorrelationConfig) -> Self {
        if config.policy.pulsar_binning {
            let bins = config
                .pulsars
                .values()
                .map(|p| p.nbins + 1)
                .max()
                .unwrap_or(0)
                .max(2);
            OutputLayout::PerBin(bins)
        } else if config.policy.multi_phase_center {
            OutputLayout::PerSource(config.sources.clone())
        } else {
            OutputLayout::Single
        }
    }

    /// Output file paths: `<base>.bin<k>` per bin, `<base>_<source>` per
    /// source.
    pub fn paths(&self, base: &Path) -> Vec<PathBuf> {
        let suffixed = |suffix: String| {
            let mut name = OsString::from(base.as_os_str());
            name.push(suffix);
            PathBuf::from(name)
        };
        match self {
            OutputLayout::Single => vec![base.to_path_buf()],
            OutputLayout::PerBin(bins) => (0..*bins).map(|k| suffixed(format!(".bin{k}"))).collect(),
            OutputLayout::PerSource(sources) => {
                sources.iter().map(|s| suffixed(format!("_{s}"))).collect()
            }
        }
    }

    fn file_index(&self, phase_center: Option<usize>, record: &OutputRecord) -> usize {
        match self {
            OutputLayout::Single => 0,
            OutputLayout::PerBin(_) => record.bin,
            OutputLayout::PerSource(_) => phase_center.unwrap_or(0),
        }
    }
}

#[derive(Debug, Default)]
struct SliceBuffer {
    records: Vec<(Option<usize>, OutputRecord)>,
    /// `Some(true)` complete, `Some(false)` failed.
    outcome: Option<bool>,
}

pub struct OutputNode {
    inbox: mpsc::Receiver<OutputMessage>,
    events: mpsc::Sender<SchedulerEvent>,
    layout: OutputLayout,
    writers: Vec<BufWriter<File>>,
    slices: BTreeMap<u64, SliceBuffer>,
    next_slice: u64,
    total_slices: Option<u64>,
    written: u64,
    missing: u64,
    drained: bool,
    cancellation_token: CancellationToken,
}

impl OutputNode {
    /// Creates the output files and writes their global headers.
    pub fn create(
        config: Arc<CorrelationConfig>,
        inbox: mpsc::Receiver<OutputMessage>,
        events: mpsc::Sender<SchedulerEvent>,
        cancellation_token: CancellationToken,
    ) -> Result<Self> {
        let layout = OutputLayout::from_config(&config);
        let header = GlobalHeader::from_config(&config)?;
        let mut writers = Vec::new();
        for path in layout.paths(&config.output_file) {
            let mut writer = BufWriter::new(File::create(&path)?);
            header.mux(&mut writer)?;
            debug!(path = %path.display(), "Opened output file");
            writers.push(writer);
        }
        info!(files = writers.len(), layout = ?layout, "Output ready");

        Ok(Self {
            inbox,
            events,
            layout,
            writers,
            slices: BTreeMap::new(),
            next_slice: 0,
            total_slices: None,
            written: 0,
            missing: 0,
            drained: false,
            cancellation_token,
        })
    }

    pub async fn run(mut self) -> NodeResult {
        loop {
            tokio::select! {
                biased;
                _ = self.cancellation_token.cancelled() => {
                    self.flush()?;
                    return Ok(NodeOutcome::Cancelled);
                }
                msg = self.inbox.recv() => match msg {
                    None | Some(OutputMessage::Stop) => break,
                    Some(msg) => self.handle(msg).await?,
                }
            }
        }
        self.flush()?;
        debug!(written = self.written, missing = self.missing, "Output stopped");
        Ok(NodeOutcome::Stopped)
    }

    async fn handle(&mut self, msg: OutputMessage) -> Result<()> {
        match msg {
            OutputMessage::Record {
                phase_center,
                record,
            } => {
                if record.slice_nr < self.next_slice {
                    warn!(slice_nr = record.slice_nr, "Record of an already written slice dropped");
                } else {
                    self.slices
                        .entry(record.slice_nr)
                        .or_default()
                        .records
                        .push((phase_center, record));
                }
            }
            OutputMessage::SliceComplete { slice_nr } => self.settle(slice_nr, true),
            OutputMessage::SliceFailed { slice_nr, reason } => {
                debug!(slice_nr, "Slice failed: {}", reason);
                self.settle(slice_nr, false);
            }
            OutputMessage::Finish { total_slices } => {
                debug!(total_slices, "Scheduler finished assigning");
                self.total_slices = Some(total_slices);
            }
            OutputMessage::Stop => {}
        }
        self.write_ready()?;
        self.check_drained().await
    }

    fn settle(&mut self, slice_nr: u64, ok: bool) {
        if slice_nr < self.next_slice {
            return;
        }
        self.slices.entry(slice_nr).or_default().outcome = Some(ok);
    }

    /// Writes every settled slice at the head of the order.
    fn write_ready(&mut self) -> Result<()> {
        while let Some(entry) = self.slices.first_entry() {
            if *entry.key() != self.next_slice {
                break;
            }
            let Some(ok) = entry.get().outcome else {
                break;
            };
            let buffer = entry.remove();
            if ok {
                for (phase_center, record) in &buffer.records {
                    let index = self.layout.file_index(*phase_center, record);
                    let writer = self.writers.get_mut(index).ok_or_else(|| {
                        Error::Other(format!("no output file for record of slice {}", record.slice_nr))
                    })?;
                    write_record(writer, *phase_center, record)?;
                }
                self.written += 1;
            } else {
                self.missing += 1;
            }
            self.next_slice += 1;
        }
        Ok(())
    }

    async fn check_drained(&mut self) -> Result<()> {
        let Some(total) = self.total_slices else {
            return Ok(());
        };
        if self.drained || self.next_slice < total {
            return Ok(());
        }
        self.flush()?;
        self.drained = true;
        info!(written = self.written, missing = self.missing, "Output drained");
        self.events
            .send(SchedulerEvent::OutputDrained {
                slices_written: self.written,
                slices_missing: self.missing,
            })
            .await
            .map_err(|_| Error::node_stopped("scheduler"))
    }

    fn flush(&mut self) -> Result<()> {
        for writer in &mut self.writers {
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolarisationEntry;
    use crate::config::test_utils::{basic_control, config_from};
    use correlation_core::{BaselineProduct, StreamSpec};
    use delay_model::Complex32;
    use rstest::rstest;
    use std::io::{Cursor, Read};

    fn record(slice_nr: u64, bin: usize) -> OutputRecord {
        let spec = StreamSpec {
            station: 1,
            polarisation: Polarisation::Left,
        };
        OutputRecord {
            slice_nr,
            integration_nr: 0,
            bin,
            baselines: vec![BaselineProduct {
                first: spec,
                second: spec,
                weight: 1.0,
                spectrum: vec![Complex32::new(1.0, -1.0); 3],
            }],
        }
    }

    #[test]
    fn test_global_header_layout() {
        let config = config_from(basic_control());
        let header = GlobalHeader::from_config(&config).unwrap();
        assert_eq!(header.start_year, 2024);
        assert_eq!(header.start_day, 122);
        assert_eq!(header.start_seconds, 12 * 3600);
        assert_eq!(header.number_channels, 16);
        assert_eq!(header.integration_time_us, 1_000_000);
        assert_eq!(header.polarisation_type, 0);

        let mut bytes = Vec::new();
        header.mux(&mut bytes).unwrap();
        assert_eq!(bytes.len(), GlobalHeader::SIZE);
        assert_eq!(&bytes[4..9], b"N24L1");
        assert_eq!(GlobalHeader::demux(&mut Cursor::new(bytes)).unwrap(), header);
    }

    #[rstest]
    #[case(&[PolarisationEntry::R, PolarisationEntry::R], 0)]
    #[case(&[PolarisationEntry::L, PolarisationEntry::L], 1)]
    #[case(&[PolarisationEntry::R, PolarisationEntry::L], 2)]
    fn test_polarisation_type(#[case] pols: &[PolarisationEntry], #[case] expected: u8) {
        let mut control = basic_control();
        for (channel, pol) in control.modes[0].channels.iter_mut().zip(pols) {
            channel.polarisation = *pol;
        }
        let header = GlobalHeader::from_config(&config_from(control)).unwrap();
        assert_eq!(header.polarisation_type, expected);
    }

    #[test]
    fn test_record_layout() {
        let mut bytes = Vec::new();
        write_record(&mut bytes, Some(2), &record(9, 1)).unwrap();
        assert_eq!(bytes.len(), 24 + 10 + 3 * 8);

        let mut cursor = Cursor::new(bytes);
        assert_eq!(cursor.read_u64::<LittleEndian>().unwrap(), 9);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 0);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 2);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 1);
        assert_eq!(cursor.read_u16::<LittleEndian>().unwrap(), 1);
    }

    #[test]
    fn test_layout_paths() {
        let base = Path::new("/data/run.cor");
        assert_eq!(OutputLayout::Single.paths(base), vec![PathBuf::from("/data/run.cor")]);
        assert_eq!(
            OutputLayout::PerBin(2).paths(base),
            vec![
                PathBuf::from("/data/run.cor.bin0"),
                PathBuf::from("/data/run.cor.bin1")
            ]
        );
        assert_eq!(
            OutputLayout::PerSource(vec!["3C84".into()]).paths(base),
            vec![PathBuf::from("/data/run.cor_3C84")]
        );
    }

    #[test]
    fn test_pulsar_layout_has_at_least_two_bins() {
        let mut control = basic_control();
        control.pulsar_binning = true;
        control.pulsars.insert(
            "J1234".into(),
            crate::config::PulsarEntry {
                period: 0.5,
                epoch: control.start,
                dm: 0.0,
                nbins: 3,
                gate_begin: 0.0,
                gate_end: 1.0,
            },
        );
        assert_eq!(OutputLayout::from_config(&config_from(control)), OutputLayout::PerBin(4));
    }

    #[tokio::test]
    async fn test_writes_slices_in_order_and_skips_failed() {
        let dir = tempfile::tempdir().unwrap();
        let mut control = basic_control();
        control.output_file = dir.path().join("out.cor");
        let config = Arc::new(config_from(control));
        let (tx, rx) = mpsc::channel(16);
        let (events_tx, mut events) = mpsc::channel(4);
        let node = OutputNode::create(config.clone(), rx, events_tx, CancellationToken::new()).unwrap();
        let task = tokio::spawn(node.run());

        // completion order 2, 0, 1 (failed)
        for (slice_nr, ok) in [(2, true), (0, true), (1, false)] {
            if ok {
                tx.send(OutputMessage::Record {
                    phase_center: None,
                    record: record(slice_nr, 0),
                })
                .await
                .unwrap();
                tx.send(OutputMessage::SliceComplete { slice_nr }).await.unwrap();
            } else {
                tx.send(OutputMessage::SliceFailed {
                    slice_nr,
                    reason: "underrun".into(),
                })
                .await
                .unwrap();
            }
        }
        tx.send(OutputMessage::Finish { total_slices: 3 }).await.unwrap();

        assert!(matches!(
            events.recv().await,
            Some(SchedulerEvent::OutputDrained {
                slices_written: 2,
                slices_missing: 1
            })
        ));
        tx.send(OutputMessage::Stop).await.unwrap();
        task.await.unwrap().unwrap();

        let mut file = File::open(&config.output_file).unwrap();
        GlobalHeader::demux(&mut file).unwrap();
        let first = file.read_u64::<LittleEndian>().unwrap();
        let mut rest = Vec::new();
        file.read_to_end(&mut rest).unwrap();
        let record_len = 24 + 10 + 3 * 8;
        assert_eq!(first, 0);
        assert_eq!(rest.len(), 2 * record_len - 8);
        assert_eq!(
            Cursor::new(&rest[record_len - 8..]).read_u64::<LittleEndian>().unwrap(),
            2
        );
    }
}
