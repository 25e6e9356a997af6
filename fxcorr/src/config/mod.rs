//! Control-file configuration.
//!
//! [`ControlFile`] mirrors the file on disk; [`CorrelationConfig`] is the
//! validated form the scheduler and nodes share behind an `Arc`. Invalid
//! cross-channel pairings and conflicting expansion policies are rejected
//! here, before any node starts.

mod control;
mod model;

use std::path::PathBuf;

use delay_model::DelayError;
use thiserror::Error;

pub use control::{
    ChannelEntry, ControlFile, ModeEntry, PolarisationEntry, PulsarEntry, ScanEntry,
    SchedulingMode, Sideband, SourceEntry, StationEntry,
};
pub use model::{Channel, CorrelationConfig, ExpansionPolicy, Mode, Scan, Station};

/// Configuration errors; all of them are fatal at startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("failed to parse control file: {0}")]
    Parse(String),

    #[error("invalid cross channel for {channel} in mode {mode}: {reason}")]
    InvalidCrossChannel {
        mode: String,
        channel: String,
        reason: String,
    },

    #[error("pulsar binning and multiple phase centers cannot be enabled together")]
    ConflictingPolicies,

    #[error("scan {0} lists no source to use as a phase center")]
    NoPhaseCenters(String),

    #[error("unknown mode: {0}")]
    UnknownMode(String),

    #[error("unknown station: {0}")]
    UnknownStation(String),

    #[error("unknown pulsar: {0}")]
    UnknownPulsar(String),

    #[error("invalid pulsar definition: {0}")]
    InvalidPulsar(String),

    #[error("duplicate {0} name")]
    Duplicate(String),

    #[error("invalid timing: {0}")]
    Timing(String),

    #[error("delay table of station {station}: {source}")]
    DelayTable {
        station: String,
        #[source]
        source: DelayError,
    },
}

impl ConfigError {
    pub fn timing(msg: impl Into<String>) -> Self {
        Self::Timing(msg.into())
    }

    pub fn invalid_cross(mode: &str, channel: &str, reason: impl Into<String>) -> Self {
        Self::InvalidCrossChannel {
            mode: mode.to_string(),
            channel: channel.to_string(),
            reason: reason.into(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_utils::*;
    use super::*;
    use correlation_core::Polarisation;
    use std::io::Write;

    fn channel(name: &str, pol: PolarisationEntry, cross: Option<&str>) -> ChannelEntry {
        ChannelEntry {
            name: name.to_string(),
            frequency: 1.4e9,
            bandwidth: None,
            sideband: Sideband::Upper,
            polarisation: pol,
            cross_channel: cross.map(str::to_string),
        }
    }

    fn with_channels(channels: Vec<ChannelEntry>, cross: bool) -> ControlFile {
        let mut control = basic_control();
        control.cross_polarize = cross;
        control.modes[0].channels = channels;
        control
    }

    #[test]
    fn test_basic_config() {
        let config = config_from(basic_control());
        assert_eq!(config.experiment, "N24L1");
        assert_eq!(config.integration_time_us, 1_000_000);
        assert_eq!(config.ffts_per_integration, 32);
        assert_eq!(config.samples_per_slice(), 1024);
        assert_eq!(config.stations.len(), 3);
        assert_eq!(config.scans[0].stations, vec![0, 1, 2]);
        assert_eq!(config.sources, vec!["J1234".to_string()]);
        assert_eq!(config.channel_count(), 2);
        assert_eq!(config.scheduling, SchedulingMode::Fifo);
        assert_eq!(config.connection_timeout.as_secs(), 30);
        assert_eq!(config.scans[0].mode.channels[0].geometry.bandwidth, 512.0);
    }

    #[test]
    fn test_cross_channel_pairs_owned_by_lower_channel() {
        let control = with_channels(
            vec![
                channel("A", PolarisationEntry::R, Some("C")),
                channel("B", PolarisationEntry::R, None),
                channel("C", PolarisationEntry::L, Some("A")),
            ],
            true,
        );
        let config = config_from(control);
        let channels = &config.scans[0].mode.channels;

        assert_eq!(channels[0].cross_channel, Some(2));
        assert_eq!(channels[0].partner_of, None);
        assert_eq!(channels[1].cross_channel, None);
        assert_eq!(channels[2].cross_channel, None);
        assert_eq!(channels[2].partner_of, Some(0));
        assert_eq!(channels[2].polarisation, Polarisation::Left);
    }

    #[test]
    fn test_downward_cross_channel_is_rejected() {
        let control = with_channels(
            vec![
                channel("A", PolarisationEntry::R, None),
                channel("B", PolarisationEntry::L, Some("A")),
            ],
            true,
        );
        let err = CorrelationConfig::from_control(control, std::path::Path::new(".")).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidCrossChannel { ref channel, .. } if channel == "B"));
    }

    #[test]
    fn test_self_and_double_pairing_rejected() {
        let control = with_channels(vec![channel("A", PolarisationEntry::R, Some("A"))], true);
        assert!(matches!(
            CorrelationConfig::from_control(control, std::path::Path::new(".")),
            Err(ConfigError::InvalidCrossChannel { .. })
        ));

        let control = with_channels(
            vec![
                channel("A", PolarisationEntry::R, Some("C")),
                channel("B", PolarisationEntry::R, Some("C")),
                channel("C", PolarisationEntry::L, None),
            ],
            true,
        );
        assert!(matches!(
            CorrelationConfig::from_control(control, std::path::Path::new(".")),
            Err(ConfigError::InvalidCrossChannel { .. })
        ));
    }

    #[test]
    fn test_conflicting_policies() {
        let mut control = basic_control();
        control.pulsar_binning = true;
        control.multi_phase_center = true;
        assert!(matches!(
            CorrelationConfig::from_control(control, std::path::Path::new(".")),
            Err(ConfigError::ConflictingPolicies)
        ));
    }

    #[test]
    fn test_multi_phase_center_scan_needs_sources() {
        let mut control = basic_control();
        control.multi_phase_center = true;
        control.scans[0].sources.clear();
        match CorrelationConfig::from_control(control, std::path::Path::new(".")) {
            Err(ConfigError::NoPhaseCenters(scan)) => assert_eq!(scan, "No0001"),
            other => panic!("unexpected {other:?}"),
        }

        let mut control = basic_control();
        control.scans[0].sources.clear();
        assert!(CorrelationConfig::from_control(control, std::path::Path::new(".")).is_ok());
    }

    #[test]
    fn test_integration_must_hold_whole_frames() {
        let mut control = basic_control();
        control.integration_time = 0.01;
        assert!(matches!(
            CorrelationConfig::from_control(control, std::path::Path::new(".")),
            Err(ConfigError::Timing(_))
        ));
    }

    #[test]
    fn test_unknown_mode() {
        let mut control = basic_control();
        control.scans[0].mode = "nope".to_string();
        assert!(matches!(
            CorrelationConfig::from_control(control, std::path::Path::new(".")),
            Err(ConfigError::UnknownMode(m)) if m == "nope"
        ));
    }

    #[test]
    fn test_load_json_and_delay_table_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = std::fs::File::create(dir.path().join("ef.delay")).unwrap();
        // 2024-05-01T12:00:00Z = 1714564800
        for t in 1714564800..=1714564804 {
            writeln!(table, "{t} 0.001").unwrap();
        }

        let mut control = basic_control();
        control.stations[0].delay_table = Some(PathBuf::from("ef.delay"));
        let path = dir.path().join("run.json");
        std::fs::write(&path, serde_json::to_string(&control).unwrap()).unwrap();

        let config = CorrelationConfig::load(&path).unwrap();
        let delay = config.stations[0].delay.delay_at(config.start + 500_000).unwrap();
        assert!((delay - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            CorrelationConfig::load(std::path::Path::new("/nonexistent/run.toml")),
            Err(ConfigError::Read { .. })
        ));
    }
}
