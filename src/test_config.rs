//! Per-part-number test limits.
//!
//! The station looks up one [`TestConfig`] per loaded DUT (by part number and
//! revision) and then reads a [`PhaseConfig`] per test item from it. A test
//! item that is absent from the document is treated as disabled.
//!
//! Limits document (`limits.toml`):
//!
//! ```toml
//! [[parts]]
//! part_number = "AGIGA9822-004BCA"
//! revision = "06"
//!
//! [parts.Charge]
//! enable = true
//! stoponfail = true
//! min = 10
//! max = 120
//! threshold = "4.0V"
//! ceiling = "5.0V"
//! ```

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::{AppResult, StationError};

/// Test items a part number can configure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestItem {
    #[serde(rename = "Program_VPD")]
    ProgramVpd,
    Charge,
    #[serde(rename = "Capacitor")]
    Capacitance,
    #[serde(rename = "Check_Temp")]
    CheckTemp,
    Discharge,
    Recharge,
}

/// Limits and switches of one test item.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseConfig {
    /// Run this item at all
    #[serde(default)]
    pub enable: bool,
    /// Skip DUTs that are not in the phase's expected entry status
    #[serde(default, rename = "stoponfail")]
    pub stop_on_fail: bool,
    /// Lower limit (seconds for timed phases, raw units for capacitance/temperature)
    #[serde(default, deserialize_with = "quantity")]
    pub min: f64,
    /// Upper limit
    #[serde(default, deserialize_with = "quantity")]
    pub max: f64,
    /// Voltage threshold (V)
    #[serde(default, deserialize_with = "quantity")]
    pub threshold: f64,
    /// Voltage ceiling (V)
    #[serde(default, deserialize_with = "quantity")]
    pub ceiling: f64,
    /// Discharge load current (A)
    #[serde(default, deserialize_with = "quantity")]
    pub current: f64,
    /// Capacitance-measurement overtime (s)
    #[serde(default, deserialize_with = "optional_quantity")]
    pub overtime: Option<f64>,
    /// Treat `min`/`max` as inclusive bounds for the capacitance check
    #[serde(default)]
    pub inclusive_limits: bool,
    /// Recharge: power off and shut the DUT down once it passed
    #[serde(default)]
    pub shutdown: bool,
    /// Program VPD: flush the EEPROM write buffer instead of power-cycling
    #[serde(default)]
    pub flush_ee: bool,
    /// Discharge: verify the shutdown command after the loop
    #[serde(default)]
    pub recheck: bool,
    /// Program VPD: expected firmware version
    #[serde(default, rename = "fwver")]
    pub fw_version: Option<String>,
    /// Program VPD: identity image to write
    #[serde(default, rename = "file")]
    pub vpd_file: Option<PathBuf>,
}

impl PhaseConfig {
    /// Whether `value` lies within `[min, max]` (inclusive) or `(min, max)`.
    pub fn within_limits(&self, value: f64) -> bool {
        if self.inclusive_limits {
            self.min <= value && value <= self.max
        } else {
            self.min < value && value < self.max
        }
    }
}

/// Accepts `4.5`, `4` or unit-suffixed strings such as `"4.5V"` / `"2.0A"`.
fn quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(v) => Ok(v),
        Raw::Text(s) => parse_quantity(&s).map_err(serde::de::Error::custom),
    }
}

fn optional_quantity<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    quantity(deserializer).map(Some)
}

/// Strip a trailing unit (`V`, `A`, `s`) and parse the number.
pub fn parse_quantity(text: &str) -> Result<f64, String> {
    let trimmed = text
        .trim()
        .trim_end_matches(|c: char| matches!(c, 'v' | 'V' | 'a' | 'A' | 's' | 'S'))
        .trim();
    trimmed
        .parse()
        .map_err(|_| format!("invalid quantity '{}'", text))
}

/// All test items of one part number / revision.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestConfig {
    pub part_number: String,
    pub revision: String,
    #[serde(flatten)]
    pub items: HashMap<TestItem, PhaseConfig>,
}

impl TestConfig {
    /// Configuration of a test item; disabled when absent.
    pub fn item(&self, item: TestItem) -> PhaseConfig {
        self.items.get(&item).cloned().unwrap_or_default()
    }
}

/// Lookup of per-part test limits.
pub trait TestConfigProvider: Send + Sync {
    /// Test limits for a part number and revision.
    fn load_config(&self, part_number: &str, revision: &str) -> AppResult<TestConfig>;

    /// Latest known revision of a part number.
    fn latest_revision(&self, part_number: &str) -> AppResult<String>;
}

#[derive(Debug, Deserialize)]
struct LimitsDocument {
    #[serde(default)]
    parts: Vec<TestConfig>,
}

/// Test limits read from a TOML document.
#[derive(Debug, Clone, Default)]
pub struct TomlConfigProvider {
    parts: Vec<TestConfig>,
}

impl TomlConfigProvider {
    /// Provider over an explicit list of part configurations.
    pub fn new(parts: Vec<TestConfig>) -> Self {
        Self { parts }
    }

    /// Parse a limits document.
    pub fn from_toml_str(document: &str) -> AppResult<Self> {
        let doc: LimitsDocument = toml::from_str(document)
            .map_err(|e| StationError::Configuration(format!("limits document: {}", e)))?;
        Ok(Self::new(doc.parts))
    }

    /// Read a limits document from disk.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

impl TestConfigProvider for TomlConfigProvider {
    fn load_config(&self, part_number: &str, revision: &str) -> AppResult<TestConfig> {
        self.parts
            .iter()
            .find(|p| p.part_number == part_number && p.revision == revision)
            .cloned()
            .ok_or_else(|| StationError::MissingTestConfig {
                part_number: part_number.to_string(),
                revision: revision.to_string(),
            })
    }

    fn latest_revision(&self, part_number: &str) -> AppResult<String> {
        self.parts
            .iter()
            .filter(|p| p.part_number == part_number)
            .map(|p| p.revision.clone())
            .max_by(|a, b| compare_revisions(a, b))
            .ok_or_else(|| StationError::MissingTestConfig {
                part_number: part_number.to_string(),
                revision: "latest".to_string(),
            })
    }
}

/// Revisions compare numerically when both parse, lexically otherwise.
fn compare_revisions(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u32>(), b.parse::<u32>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}
