//! 2D barcode of a PGEM module.
//!
//! Format: `AGIGA9822-004BCA02144800000002-06`
//!
//! ```text
//! AGIGA9822 - 004 BCA  02   14  48  00000002 - 06
//! |product|   |part suffix| |vendor| |yy| |ww| |serial|  |revision|
//! ```
//!
//! The part number is the product type plus the suffix (`AGIGA9822-004BCA`).

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::StationError;

static BARCODE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(?P<pn>(?P<pt>AGIGA\d{4})-\d{3}[A-Z0-9]{3})(?P<vendor>\d{2})(?P<yy>\d{2})(?P<ww>\d{2})(?P<id>\d{8})-(?P<rev>\d{2})$",
    )
    .unwrap_or_else(|e| unreachable!("static barcode pattern: {e}"))
});

/// Parsed barcode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Barcode {
    /// Full barcode as scanned
    pub raw: String,
    /// Product type, e.g. `AGIGA9822`
    pub product_type: String,
    /// Part number, e.g. `AGIGA9822-004BCA`
    pub part_number: String,
    /// Revision, e.g. `06`
    pub revision: String,
    /// Vendor code
    pub vendor: String,
    /// Two-digit manufacturing year
    pub year: u8,
    /// Manufacturing week
    pub week: u8,
    /// Eight-digit serial
    pub serial: String,
}

impl FromStr for Barcode {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        let caps = BARCODE_RE
            .captures(raw)
            .ok_or_else(|| StationError::Barcode(raw.to_string()))?;
        let number = |name: &str| -> Result<u8, StationError> {
            caps[name]
                .parse()
                .map_err(|_| StationError::Barcode(raw.to_string()))
        };
        let week = number("ww")?;
        if week > 53 {
            return Err(StationError::Barcode(raw.to_string()));
        }
        Ok(Self {
            raw: raw.to_string(),
            product_type: caps["pt"].to_string(),
            part_number: caps["pn"].to_string(),
            revision: caps["rev"].to_string(),
            vendor: caps["vendor"].to_string(),
            year: number("yy")?,
            week,
            serial: caps["id"].to_string(),
        })
    }
}

impl fmt::Display for Barcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
