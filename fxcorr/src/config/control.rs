//! On-disk control file, as written by the operator.
//!
//! TOML by default, JSON when the file name ends in `.json`. The raw structs
//! here are validated into a [`super::CorrelationConfig`] before use.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ConfigError;

fn default_fft_size() -> usize {
    256
}

fn default_workers() -> usize {
    4
}

fn default_connection_timeout() -> u64 {
    30
}

fn default_chunk_size() -> usize {
    4096
}

fn default_pool_depth() -> usize {
    4
}

fn default_gate_end() -> f64 {
    1.0
}

/// Job-to-worker assignment policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchedulingMode {
    /// Workers get jobs in the order they became ready.
    #[default]
    Fifo,
    /// Strict round-robin over worker indices, reproducible across runs.
    Deterministic,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sideband {
    #[default]
    Upper,
    Lower,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolarisationEntry {
    #[default]
    R,
    L,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlFile {
    pub experiment: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    /// Seconds.
    pub integration_time: f64,
    #[serde(default = "default_fft_size")]
    pub fft_size: usize,
    /// Samples per second per stream.
    pub sample_rate: f64,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default)]
    pub scheduling: SchedulingMode,
    #[serde(default)]
    pub cross_polarize: bool,
    #[serde(default)]
    pub pulsar_binning: bool,
    #[serde(default)]
    pub multi_phase_center: bool,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
    /// Samples per data chunk sent from a station to a worker.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Frames per stream a worker keeps in flight.
    #[serde(default = "default_pool_depth")]
    pub pool_depth: usize,
    pub output_file: PathBuf,
    pub stations: Vec<StationEntry>,
    pub modes: Vec<ModeEntry>,
    pub scans: Vec<ScanEntry>,
    #[serde(default)]
    pub pulsars: BTreeMap<String, PulsarEntry>,
    #[serde(default)]
    pub sources: BTreeMap<String, SourceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationEntry {
    pub name: String,
    /// Text delay table; when absent the table is generated from
    /// `delay_polynomial`.
    #[serde(default)]
    pub delay_table: Option<PathBuf>,
    /// Coefficients in seconds, `c0 + c1 (t - start) + ...`.
    #[serde(default)]
    pub delay_polynomial: Vec<f64>,
    #[serde(default)]
    pub clock_offset_us: f64,
    /// Microseconds per second.
    #[serde(default)]
    pub clock_rate: f64,
    #[serde(default)]
    pub clock_epoch: Option<DateTime<Utc>>,
    /// Seed of the synthetic sample source.
    #[serde(default)]
    pub seed: u64,
    /// Recorded data ends here; later samples are missing.
    #[serde(default)]
    pub data_end: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeEntry {
    pub name: String,
    pub channels: Vec<ChannelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEntry {
    pub name: String,
    /// Sky frequency of the band edge in Hz.
    pub frequency: f64,
    /// Defaults to half the sample rate.
    #[serde(default)]
    pub bandwidth: Option<f64>,
    #[serde(default)]
    pub sideband: Sideband,
    #[serde(default)]
    pub polarisation: PolarisationEntry,
    /// Name of the channel holding the other polarisation of this band.
    #[serde(default)]
    pub cross_channel: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanEntry {
    pub name: String,
    pub start: DateTime<Utc>,
    pub stop: DateTime<Utc>,
    pub mode: String,
    /// Stations taking part; all stations when empty.
    #[serde(default)]
    pub stations: Vec<String>,
    #[serde(default)]
    pub sources: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PulsarEntry {
    pub period: f64,
    pub epoch: DateTime<Utc>,
    #[serde(default)]
    pub dm: f64,
    pub nbins: usize,
    #[serde(default)]
    pub gate_begin: f64,
    #[serde(default = "default_gate_end")]
    pub gate_end: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Phase-center delay offset in microseconds.
    #[serde(default)]
    pub delay_offset_us: f64,
}

impl ControlFile {
    /// Reads and parses a control file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::from_json(&text)
        } else {
            Self::from_toml(&text)
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }
}
