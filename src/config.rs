//! Station configuration using Figment
//!
//! The station configuration is loaded exactly once at process start and then
//! shared read-only (`Arc<StationConfig>`) with every channel and transport.
//! Configuration is loaded from:
//! 1. a TOML file (`config/station.toml` by default)
//! 2. Environment variables (prefixed with `UFT_`, nested keys split on `__`)
//!
//! # Environment Variable Overrides
//!
//! ```text
//! UFT_STATION__INTERVAL=500ms
//! UFT_STATION__OVERRIDE_CHECKS=true
//! UFT_HOLD__ENABLED=true
//! ```
//!
//! # Example
//!
//! ```toml
//! [station]
//! total_slot_num = 4
//! interval = "1s"
//! mode4in1_part_numbers = ["AGIGA9822-004BCA"]
//!
//! [hold]
//! enabled = false
//! duration = "30m"
//!
//! [storage]
//! result_log = "logs"
//!
//! [[channels]]
//! id = 0
//! port = "/dev/ttyUSB0"
//! board_id = 1
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment, Provider,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::error::{AppResult, StationError};

/// Top-level station configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationConfig {
    /// Station-wide settings
    pub station: StationSettings,
    /// Optional hold phase between charge and capacitance measurement
    #[serde(default)]
    pub hold: HoldSettings,
    /// Settle delays and polling cadences used by the sequencer
    #[serde(default)]
    pub timing: TimingSettings,
    /// Where results are written
    pub storage: StorageSettings,
    /// One entry per attached fixture controller
    #[serde(default)]
    pub channels: Vec<ChannelBinding>,
}

/// Station-wide settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StationSettings {
    /// Number of physical slots per fixture controller
    #[serde(default = "default_slot_num")]
    pub total_slot_num: usize,
    /// Polling interval of the charge and discharge loops
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Skip the latest-revision check and the 4-in-1 wiring requirement
    #[serde(default)]
    pub override_checks: bool,
    /// Part numbers that must be wired as a 4-in-1 group
    #[serde(default)]
    pub mode4in1_part_numbers: Vec<String>,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Hold phase settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldSettings {
    /// Queue the HOLD phase after CHARGE
    #[serde(default)]
    pub enabled: bool,
    /// How long to keep the DUTs powered
    #[serde(default = "default_hold_duration", with = "humantime_serde")]
    pub duration: Duration,
}

impl Default for HoldSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            duration: default_hold_duration(),
        }
    }
}

/// Settle delays and poll cadences.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimingSettings {
    /// Settle time once any DUT had its supply switched on
    #[serde(default = "default_power_settle", with = "humantime_serde")]
    pub power_settle: Duration,
    /// Spacing between consecutive supply switch-ons
    #[serde(default = "default_power_on_spacing", with = "humantime_serde")]
    pub power_on_spacing: Duration,
    /// Settle time after powering DUTs off before the load is armed
    #[serde(default = "default_discharge_settle", with = "humantime_serde")]
    pub discharge_settle: Duration,
    /// Number of hardware-ready polls before a DUT is declared not ready
    #[serde(default = "default_ready_polls")]
    pub ready_polls: u32,
    /// Delay between hardware-ready polls
    #[serde(default = "default_ready_poll_delay", with = "humantime_serde")]
    pub ready_poll_delay: Duration,
    /// Delay after switching a single port of a 4-in-1 group
    #[serde(default = "default_port_switch", with = "humantime_serde")]
    pub port_switch: Duration,
    /// Delay around each shared-port input-voltage measurement
    #[serde(default = "default_shared_port_settle", with = "humantime_serde")]
    pub shared_port_settle: Duration,
    /// Settle time after committing VPD by powering the DUT off
    #[serde(default = "default_vpd_commit", with = "humantime_serde")]
    pub vpd_commit: Duration,
    /// Settle time between capacitance-measurement start and the first poll
    #[serde(default = "default_cap_start_settle", with = "humantime_serde")]
    pub cap_start_settle: Duration,
    /// Capacitance polling interval, as a multiple of the station interval
    #[serde(default = "default_cap_poll_factor")]
    pub cap_poll_factor: u32,
    /// Capacitance measurement overtime when the test item does not set one
    #[serde(default = "default_cap_overtime", with = "humantime_serde")]
    pub cap_overtime: Duration,
    /// Discharge polling delay once the fast loop is engaged
    #[serde(default = "default_fast_poll", with = "humantime_serde")]
    pub fast_poll: Duration,
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            power_settle: default_power_settle(),
            power_on_spacing: default_power_on_spacing(),
            discharge_settle: default_discharge_settle(),
            ready_polls: default_ready_polls(),
            ready_poll_delay: default_ready_poll_delay(),
            port_switch: default_port_switch(),
            shared_port_settle: default_shared_port_settle(),
            vpd_commit: default_vpd_commit(),
            cap_start_settle: default_cap_start_settle(),
            cap_poll_factor: default_cap_poll_factor(),
            cap_overtime: default_cap_overtime(),
            fast_poll: default_fast_poll(),
        }
    }
}

/// Result storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Directory receiving one XML file per DUT
    pub result_log: PathBuf,
    /// Directory of the append-only CSV archive; archival is skipped when unset
    #[serde(default)]
    pub archive_dir: Option<PathBuf>,
}

/// Binding of one channel to its fixture controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    /// Channel number, 0-7
    pub id: u8,
    /// Serial port of the fixture controller (e.g. "/dev/ttyUSB0", "COM3")
    pub port: String,
    /// Board id the controller answers to
    #[serde(default = "default_board_id")]
    pub board_id: u8,
    /// Port group; physical port = logical slot + group * 4
    #[serde(default)]
    pub group: u8,
    /// Force the wiring mode instead of taking it from the operator
    #[serde(default)]
    pub mode4in1: Option<bool>,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_slot_num() -> usize {
    4
}

fn default_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_hold_duration() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_power_settle() -> Duration {
    Duration::from_secs(5)
}

fn default_power_on_spacing() -> Duration {
    Duration::from_millis(200)
}

fn default_discharge_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_ready_polls() -> u32 {
    5
}

fn default_ready_poll_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_port_switch() -> Duration {
    Duration::from_millis(100)
}

fn default_shared_port_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_vpd_commit() -> Duration {
    Duration::from_secs(1)
}

fn default_cap_start_settle() -> Duration {
    Duration::from_secs(1)
}

fn default_cap_poll_factor() -> u32 {
    5
}

fn default_cap_overtime() -> Duration {
    Duration::from_secs(600)
}

fn default_fast_poll() -> Duration {
    Duration::from_millis(50)
}

fn default_board_id() -> u8 {
    1
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl StationConfig {
    /// Load configuration from `config/station.toml` and environment variables
    ///
    /// Configuration is loaded in this order of precedence (highest to lowest):
    /// 1. Environment variables (`UFT_` prefix)
    /// 2. the TOML file
    ///
    /// After loading, configuration is validated.
    pub fn load() -> AppResult<Self> {
        Self::load_from("config/station.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, does not match the schema,
    /// or fails [`StationConfig::validate`].
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file(path.as_ref()))
                .merge(Env::prefixed("UFT_").split("__")),
        )
    }

    /// Build a configuration from an inline TOML document (no environment overrides).
    pub fn from_toml_str(document: &str) -> AppResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::string(document)))
    }

    fn from_figment(figment: Figment) -> AppResult<Self> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// A single-channel configuration suitable for simulation and tests.
    pub fn simulated(result_log: impl Into<PathBuf>) -> Self {
        let defaults = Self {
            station: StationSettings {
                total_slot_num: default_slot_num(),
                interval: default_interval(),
                override_checks: false,
                mode4in1_part_numbers: Vec::new(),
                log_level: default_log_level(),
            },
            hold: HoldSettings::default(),
            timing: TimingSettings::default(),
            storage: StorageSettings {
                result_log: result_log.into(),
                archive_dir: None,
            },
            channels: vec![ChannelBinding {
                id: 0,
                port: "sim0".to_string(),
                board_id: default_board_id(),
                group: 0,
                mode4in1: None,
            }],
        };
        // Round-trip through figment so env overrides apply to simulations too.
        Self::with_overrides(defaults, Env::prefixed("UFT_").split("__"))
    }

    /// Merge `overrides` over `defaults`; invalid overrides are logged and dropped.
    fn with_overrides<P: Provider>(defaults: Self, overrides: P) -> Self {
        match Figment::from(Serialized::defaults(&defaults))
            .merge(overrides)
            .extract()
        {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "ignoring invalid configuration overrides");
                defaults
            }
        }
    }

    /// Validate configuration after loading
    ///
    /// Checks:
    /// - Log level is valid (trace, debug, info, warn, error)
    /// - Slot count is a non-zero multiple of 4, at most 8
    /// - Polling interval is non-zero
    /// - Channel ids are unique and 0-7
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.station.log_level.as_str()) {
            return Err(StationError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.station.log_level,
                valid_levels.join(", ")
            )));
        }

        let slots = self.station.total_slot_num;
        if slots == 0 || slots % 4 != 0 || slots > 8 {
            return Err(StationError::Configuration(format!(
                "Invalid total_slot_num {}. Must be 4 or 8",
                slots
            )));
        }

        if self.station.interval.is_zero() {
            return Err(StationError::Configuration(
                "Polling interval must be greater than zero".to_string(),
            ));
        }

        if self.timing.ready_polls == 0 || self.timing.cap_poll_factor == 0 {
            return Err(StationError::Configuration(
                "ready_polls and cap_poll_factor must be greater than zero".to_string(),
            ));
        }

        let mut ids = HashSet::new();
        for channel in &self.channels {
            if channel.id > 7 {
                return Err(StationError::Configuration(format!(
                    "Invalid channel id {}. Must be 0-7",
                    channel.id
                )));
            }
            if !ids.insert(channel.id) {
                return Err(StationError::Configuration(format!(
                    "Duplicate channel id: {}",
                    channel.id
                )));
            }
            if channel.port.is_empty() {
                return Err(StationError::Configuration(format!(
                    "Channel {}: 'port' cannot be empty",
                    channel.id
                )));
            }
        }

        Ok(())
    }

    /// Look up the binding of a channel.
    pub fn channel(&self, id: u8) -> Option<&ChannelBinding> {
        self.channels.iter().find(|c| c.id == id)
    }

    /// Whether a part number must be wired as a 4-in-1 group.
    pub fn requires_mode4in1(&self, part_number: &str) -> bool {
        self.station
            .mode4in1_part_numbers
            .iter()
            .any(|pn| pn == part_number)
    }

    /// Capacitance polling interval.
    pub fn cap_poll_interval(&self) -> Duration {
        self.station.interval * self.timing.cap_poll_factor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    const MINIMAL: &str = r#"
        [station]
        interval = "500ms"
        mode4in1_part_numbers = ["AGIGA9822-004BCA"]

        [storage]
        result_log = "logs"

        [[channels]]
        id = 0
        port = "/dev/ttyUSB0"

        [[channels]]
        id = 1
        port = "/dev/ttyUSB1"
        board_id = 2
        mode4in1 = true
    "#;

    #[test]
    fn test_minimal_document_uses_defaults() {
        let config = StationConfig::from_toml_str(MINIMAL).unwrap();
        assert_eq!(config.station.total_slot_num, 4);
        assert_eq!(config.station.interval, Duration::from_millis(500));
        assert_eq!(config.timing.power_settle, Duration::from_secs(5));
        assert_eq!(config.timing.cap_overtime, Duration::from_secs(600));
        assert_eq!(config.timing.fast_poll, Duration::from_millis(50));
        assert!(!config.hold.enabled);
        assert_eq!(config.channels.len(), 2);
        assert_eq!(config.channel(1).unwrap().mode4in1, Some(true));
        assert_eq!(config.cap_poll_interval(), Duration::from_millis(2500));
    }

    #[test]
    fn test_mode4in1_lookup_is_exact() {
        let config = StationConfig::from_toml_str(MINIMAL).unwrap();
        assert!(config.requires_mode4in1("AGIGA9822-004BCA"));
        assert!(!config.requires_mode4in1("AGIGA9822"));
    }

    #[test]
    fn test_duplicate_channel_rejected() {
        let doc = MINIMAL.replace("id = 1", "id = 0");
        let err = StationConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("Duplicate channel id"));
    }

    #[test]
    fn test_invalid_slot_count_rejected() {
        let doc = MINIMAL.replace("[station]", "[station]\ntotal_slot_num = 6");
        assert!(StationConfig::from_toml_str(&doc).is_err());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let doc = MINIMAL.replace("[station]", "[station]\nlog_level = \"loud\"");
        let err = StationConfig::from_toml_str(&doc).unwrap_err();
        assert!(err.to_string().contains("Invalid log_level"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("station.toml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = StationConfig::load_from(&path).unwrap();
        assert_eq!(config.channels[0].port, "/dev/ttyUSB0");
    }

    #[test]
    #[traced_test]
    fn test_invalid_override_keeps_defaults() {
        let defaults = StationConfig::simulated("logs");
        let overrides = Toml::string("[station]\ninterval = \"soon\"");
        let config = StationConfig::with_overrides(defaults, overrides);
        assert_eq!(config.station.interval, Duration::from_secs(1));
        assert!(logs_contain("ignoring invalid configuration overrides"));
    }

    #[test]
    fn test_override_applies() {
        let defaults = StationConfig::simulated("logs");
        let overrides = Toml::string("[timing]\nfast_poll = \"20ms\"");
        let config = StationConfig::with_overrides(defaults, overrides);
        assert_eq!(config.timing.fast_poll, Duration::from_millis(20));
    }
}
