//! Validated, immutable correlation configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use correlation_core::{ChannelGeometry, Polarisation, PulsarModel};
use delay_model::{ClockModel, DelayTable, MICROS_PER_SECOND, Time};
use tracing::debug;

use super::ConfigError;
use super::control::{ControlFile, PolarisationEntry, SchedulingMode, Sideband};

/// Spacing of generated delay-table rows.
const POLYNOMIAL_STEP_US: i64 = MICROS_PER_SECOND;

/// Which job-expansion policies are active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpansionPolicy {
    pub cross_polarize: bool,
    pub pulsar_binning: bool,
    pub multi_phase_center: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Station {
    pub name: String,
    pub delay: Arc<DelayTable>,
    pub seed: u64,
    pub data_end: Option<Time>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    pub geometry: ChannelGeometry,
    pub polarisation: Polarisation,
    /// Partner channel whose job this channel owns (always a higher index).
    pub cross_channel: Option<usize>,
    /// Set on the higher channel of a pair: the channel that owns the pair.
    pub partner_of: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Mode {
    pub name: String,
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub name: String,
    pub start: Time,
    pub stop: Time,
    pub mode: Arc<Mode>,
    /// Indices into [`CorrelationConfig::stations`].
    pub stations: Vec<usize>,
    pub sources: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub experiment: String,
    pub start: Time,
    pub stop: Time,
    pub integration_time_us: i64,
    pub fft_size: usize,
    pub sample_rate: f64,
    pub ffts_per_integration: usize,
    pub workers: usize,
    pub scheduling: SchedulingMode,
    pub policy: ExpansionPolicy,
    pub connection_timeout: Duration,
    pub chunk_size: usize,
    pub pool_depth: usize,
    pub output_file: PathBuf,
    pub stations: Vec<Station>,
    pub scans: Vec<Scan>,
    pub pulsars: BTreeMap<String, PulsarModel>,
    /// Phase-center delay offsets in seconds, by source name.
    pub source_offsets: BTreeMap<String, f64>,
    /// Sorted set of every source named by a scan; the index is the
    /// phase-center number.
    pub sources: Vec<String>,
}

impl CorrelationConfig {
    /// Loads and validates a control file. Relative delay-table paths are
    /// resolved against the control file's directory.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let control = ControlFile::load(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_control(control, base)
    }

    pub fn from_control(control: ControlFile, base_dir: &Path) -> Result<Self, ConfigError> {
        let start = Time::from_datetime(&control.start);
        let stop = Time::from_datetime(&control.stop);
        if stop <= start {
            return Err(ConfigError::timing("stop must be after start"));
        }
        if control.workers == 0 {
            return Err(ConfigError::timing("at least one worker is required"));
        }
        if control.chunk_size == 0 || control.pool_depth == 0 {
            return Err(ConfigError::timing("chunk_size and pool_depth must be positive"));
        }

        let policy = ExpansionPolicy {
            cross_polarize: control.cross_polarize,
            pulsar_binning: control.pulsar_binning,
            multi_phase_center: control.multi_phase_center,
        };
        if policy.pulsar_binning && policy.multi_phase_center {
            return Err(ConfigError::ConflictingPolicies);
        }

        let (integration_time_us, ffts_per_integration) = integration_layout(&control)?;

        let modes = control
            .modes
            .iter()
            .map(|m| build_mode(m, control.sample_rate).map(|mode| (m.name.clone(), Arc::new(mode))))
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        let station_index: BTreeMap<&str, usize> = control
            .stations
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        if station_index.len() != control.stations.len() {
            return Err(ConfigError::Duplicate("station".to_string()));
        }
        if control.stations.is_empty() {
            return Err(ConfigError::timing("at least one station is required"));
        }

        let mut scans = control
            .scans
            .iter()
            .map(|entry| {
                let mode = modes
                    .get(&entry.mode)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnknownMode(entry.mode.clone()))?;
                let stations = if entry.stations.is_empty() {
                    (0..control.stations.len()).collect()
                } else {
                    entry
                        .stations
                        .iter()
                        .map(|name| {
                            station_index
                                .get(name.as_str())
                                .copied()
                                .ok_or_else(|| ConfigError::UnknownStation(name.clone()))
                        })
                        .collect::<Result<Vec<_>, _>>()?
                };
                let scan = Scan {
                    name: entry.name.clone(),
                    start: Time::from_datetime(&entry.start),
                    stop: Time::from_datetime(&entry.stop),
                    mode,
                    stations,
                    sources: entry.sources.clone(),
                };
                if scan.stop <= scan.start {
                    return Err(ConfigError::timing(format!(
                        "scan {} stops before it starts",
                        scan.name
                    )));
                }
                Ok(scan)
            })
            .collect::<Result<Vec<_>, _>>()?;
        scans.sort_by_key(|s| s.start);
        if scans.is_empty() {
            return Err(ConfigError::timing("the schedule has no scans"));
        }
        if policy.multi_phase_center
            && let Some(scan) = scans.iter().find(|s| s.sources.is_empty())
        {
            return Err(ConfigError::NoPhaseCenters(scan.name.clone()));
        }
        if let Some(pair) = scans.windows(2).find(|w| w[1].start < w[0].stop) {
            return Err(ConfigError::timing(format!(
                "scans {} and {} overlap",
                pair[0].name, pair[1].name
            )));
        }

        let pulsars = control
            .pulsars
            .iter()
            .map(|(name, p)| {
                if p.nbins == 0 || p.period <= 0.0 || p.gate_end <= p.gate_begin {
                    return Err(ConfigError::InvalidPulsar(name.clone()));
                }
                Ok((
                    name.clone(),
                    PulsarModel {
                        period_s: p.period,
                        epoch: Time::from_datetime(&p.epoch),
                        dm: p.dm,
                        nbins: p.nbins,
                        gate: (p.gate_begin, p.gate_end),
                    },
                ))
            })
            .collect::<Result<BTreeMap<_, _>, _>>()?;
        if policy.pulsar_binning && pulsars.is_empty() {
            return Err(ConfigError::UnknownPulsar(
                "pulsar binning is enabled but no pulsar is defined".to_string(),
            ));
        }

        let windows: Vec<(Time, Time)> = scans.iter().map(|s| (s.start, s.stop)).collect();
        let stations = control
            .stations
            .iter()
            .map(|entry| build_station(entry, start, &windows, base_dir))
            .collect::<Result<Vec<_>, _>>()?;

        let sources: Vec<String> = scans
            .iter()
            .flat_map(|s| s.sources.iter().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let source_offsets = control
            .sources
            .iter()
            .map(|(name, s)| (name.clone(), s.delay_offset_us / MICROS_PER_SECOND as f64))
            .collect();

        debug!(
            experiment = %control.experiment,
            scans = scans.len(),
            stations = stations.len(),
            "Validated control file"
        );

        Ok(Self {
            experiment: control.experiment,
            start,
            stop,
            integration_time_us,
            fft_size: control.fft_size,
            sample_rate: control.sample_rate,
            ffts_per_integration,
            workers: control.workers,
            scheduling: control.scheduling,
            policy,
            connection_timeout: Duration::from_secs(control.connection_timeout_secs),
            chunk_size: control.chunk_size,
            pool_depth: control.pool_depth,
            output_file: control.output_file,
            stations,
            scans,
            pulsars,
            source_offsets,
            sources,
        })
    }

    /// Samples per stream in one time slice.
    pub fn samples_per_slice(&self) -> usize {
        self.ffts_per_integration * 2 * self.fft_size
    }

    pub fn channel_count(&self) -> usize {
        self.scans
            .iter()
            .map(|s| s.mode.channels.len())
            .max()
            .unwrap_or(0)
    }

    /// Pulsar whose gate applies to `scan`: the first scan source that is a
    /// known pulsar.
    pub fn scan_pulsar(&self, scan: &Scan) -> Option<(&str, &PulsarModel)> {
        scan.sources
            .iter()
            .find_map(|s| self.pulsars.get_key_value(s.as_str()))
            .map(|(name, model)| (name.as_str(), model))
    }

    pub fn source_index(&self, name: &str) -> Option<usize> {
        self.sources.binary_search_by(|s| s.as_str().cmp(name)).ok()
    }

    pub fn source_offset(&self, name: &str) -> f64 {
        self.source_offsets.get(name).copied().unwrap_or(0.0)
    }
}

/// Integration time in microseconds and FFT frames per integration.
fn integration_layout(control: &ControlFile) -> Result<(i64, usize), ConfigError> {
    if control.fft_size == 0 || control.sample_rate <= 0.0 || control.integration_time <= 0.0 {
        return Err(ConfigError::timing(
            "fft_size, sample_rate and integration_time must be positive",
        ));
    }
    let integration_time_us = (control.integration_time * MICROS_PER_SECOND as f64).round() as i64;
    let samples = control.integration_time * control.sample_rate;
    let frame_len = 2 * control.fft_size;
    let frames = samples / frame_len as f64;
    if (frames - frames.round()).abs() > 1e-9 || frames.round() < 1.0 {
        return Err(ConfigError::timing(format!(
            "integration time of {samples} samples is not a whole number of {frame_len}-sample frames"
        )));
    }
    Ok((integration_time_us, frames.round() as usize))
}

fn build_mode(entry: &super::control::ModeEntry, sample_rate: f64) -> Result<Mode, ConfigError> {
    let index: BTreeMap<&str, usize> = entry
        .channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.name.as_str(), i))
        .collect();
    if index.len() != entry.channels.len() {
        return Err(ConfigError::Duplicate(format!("channel in mode {}", entry.name)));
    }

    let partner = |i: usize| -> Result<Option<usize>, ConfigError> {
        match &entry.channels[i].cross_channel {
            None => Ok(None),
            Some(name) => index
                .get(name.as_str())
                .copied()
                .map(Some)
                .ok_or_else(|| ConfigError::invalid_cross(&entry.name, &entry.channels[i].name, "unknown partner")),
        }
    };

    let mut channels = Vec::with_capacity(entry.channels.len());
    let mut owners: Vec<Option<usize>> = vec![None; entry.channels.len()];
    for (i, c) in entry.channels.iter().enumerate() {
        let cross_channel = match partner(i)? {
            None => None,
            Some(p) if p == i => {
                return Err(ConfigError::invalid_cross(&entry.name, &c.name, "pairs with itself"));
            }
            // the pair is owned by its lower channel
            Some(p) if p > i => {
                if let Some(owner) = owners[p] {
                    return Err(ConfigError::invalid_cross(
                        &entry.name,
                        &entry.channels[p].name,
                        format!("already paired with {}", entry.channels[owner].name),
                    ));
                }
                if partner(p)?.is_some_and(|q| q != i) {
                    return Err(ConfigError::invalid_cross(&entry.name, &c.name, "asymmetric pairing"));
                }
                owners[p] = Some(i);
                Some(p)
            }
            // a back reference to the owner is the only allowed downward link
            Some(p) => {
                if partner(p)? != Some(i) {
                    return Err(ConfigError::invalid_cross(
                        &entry.name,
                        &c.name,
                        "must point to a higher channel",
                    ));
                }
                None
            }
        };

        channels.push(Channel {
            name: c.name.clone(),
            geometry: ChannelGeometry {
                sky_frequency: c.frequency,
                bandwidth: c.bandwidth.unwrap_or(sample_rate / 2.0),
                upper_sideband: c.sideband == Sideband::Upper,
            },
            polarisation: match c.polarisation {
                PolarisationEntry::R => Polarisation::Right,
                PolarisationEntry::L => Polarisation::Left,
            },
            cross_channel,
            partner_of: None,
        });
    }
    for (p, owner) in owners.into_iter().enumerate() {
        channels[p].partner_of = owner;
    }

    Ok(Mode {
        name: entry.name.clone(),
        channels,
    })
}

fn build_station(
    entry: &super::control::StationEntry,
    global_start: Time,
    windows: &[(Time, Time)],
    base_dir: &Path,
) -> Result<Station, ConfigError> {
    let table = match &entry.delay_table {
        Some(path) => {
            let path = base_dir.join(path);
            let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Read {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            DelayTable::parse_text(&text)
        }
        None => {
            let coeffs = if entry.delay_polynomial.is_empty() {
                vec![0.0]
            } else {
                entry.delay_polynomial.clone()
            };
            DelayTable::from_polynomial(&coeffs, global_start, windows, POLYNOMIAL_STEP_US)
        }
    }
    .map_err(|source| ConfigError::DelayTable {
        station: entry.name.clone(),
        source,
    })?;

    let clock = ClockModel {
        offset_s: entry.clock_offset_us / MICROS_PER_SECOND as f64,
        rate: entry.clock_rate / MICROS_PER_SECOND as f64,
        epoch: entry
            .clock_epoch
            .as_ref()
            .map(Time::from_datetime)
            .unwrap_or(global_start),
    };

    Ok(Station {
        name: entry.name.clone(),
        delay: Arc::new(table.with_clock(clock)),
        seed: entry.seed,
        data_end: entry.data_end.as_ref().map(Time::from_datetime),
    })
}
