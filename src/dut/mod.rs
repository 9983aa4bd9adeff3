//! Device-under-test records.
//!
//! A [`Dut`] is created during channel initialization for every loaded slot,
//! mutated by the owning channel worker throughout the run, and handed to the
//! result sink at teardown. Failure is sticky: once a DUT is `Fail`, no later
//! status assignment can move it anywhere else, and its first fault message is
//! the one that is kept.

mod barcode;
mod family;

pub use barcode::Barcode;
pub use family::ProductFamily;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use tracing::{debug, info};

/// Test status of a single DUT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DutStatus {
    /// Waiting for the next phase; after the last phase this means "passed so far"
    Idle,
    /// Terminal pass, assigned at teardown
    Pass,
    /// Terminal failure
    Fail,
    /// In the charge or recharge loop
    Charging,
    /// Load armed, in the discharge loop
    Discharging,
    /// Identity image being written
    ProgramVpd,
    /// On-device capacitance measurement running
    CapMeasuring,
}

impl DutStatus {
    /// Numeric code used by the result store.
    pub fn code(self) -> u8 {
        match self {
            DutStatus::Idle => 0,
            DutStatus::Pass => 1,
            DutStatus::Fail => 2,
            DutStatus::Charging => 3,
            DutStatus::Discharging => 4,
            DutStatus::ProgramVpd => 5,
            DutStatus::CapMeasuring => 6,
        }
    }
}

/// Reason a DUT failed. The `Display` text is the DUT's error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DutFault {
    /// Barcode revision is older than the newest configured one
    NotLatestRevision,
    /// Present pin low, or the supply could not be switched
    ConnectionIssue,
    /// Hardware-ready bit never came up
    NotReady,
    /// Input voltage outside the supply window
    VinError,
    /// Write, read-back or commit of the identity image failed
    ProgrammingVpd,
    /// The I2C bridge did not acknowledge
    IicAccessFailed,
    TemperatureOutOfRange,
    ChargeTimeTooLong,
    /// Charged too fast or past the voltage ceiling
    ChargeTimeOrVcap,
    NoPowerOutputCap,
    NoPowerOutputVpd,
    /// The measurement did not finish within the overtime
    CapStartOverTime,
    CapOverLimits,
    /// GTG register bit1 cleared after the measurement
    GtgBitCleared,
    GtgWarning,
    GtgPinCheck,
    /// Stored image has a bad checksum or the wrong serial
    CheckingVpd,
    HwVersion,
    FwVersion,
    DischargeTimeTooLong,
    /// Output sagged below the boost voltage while draining
    BoostVoltage,
    DischargeTimeTooShort,
    /// Garnet bypass path did not follow the capacitor
    BypassVoltage,
    /// Still answering after the shutdown command
    ShutdownFunction,
    /// The fixture controller rejected a command for the DUT's slot
    FixtureCommand,
}

impl fmt::Display for DutFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            DutFault::NotLatestRevision => "Not the latest revision",
            DutFault::ConnectionIssue => "PGEM Connection Issue",
            DutFault::NotReady => "DUT is not ready.",
            DutFault::VinError => "Vin error",
            DutFault::ProgrammingVpd => "Programming VPD Fail",
            DutFault::IicAccessFailed => "IIC access failed.",
            DutFault::TemperatureOutOfRange => "Temperature out of range.",
            DutFault::ChargeTimeTooLong => "Charge Time Too Long.",
            DutFault::ChargeTimeOrVcap => "Charge Time or Vcap failed",
            DutFault::NoPowerOutputCap => "No Power output, STOP cap measure",
            DutFault::NoPowerOutputVpd => "No Power output, STOP checking VPD",
            DutFault::CapStartOverTime => "Cap start over time",
            DutFault::CapOverLimits => "Cap is over limits",
            DutFault::GtgBitCleared => "GTG.bit1 ==0 ",
            DutFault::GtgWarning => "GTG_warning != 0x00",
            DutFault::GtgPinCheck => "GTG Pin check failed",
            DutFault::CheckingVpd => "Checking VPD error.",
            DutFault::HwVersion => "HW ver error.",
            DutFault::FwVersion => "FW ver error.",
            DutFault::DischargeTimeTooLong => "Discharge Time Too Long.",
            DutFault::BoostVoltage => "Boost voltage error.",
            DutFault::DischargeTimeTooShort => "Discharge Time Too Short.",
            DutFault::BypassVoltage => "Bypass voltage error.",
            DutFault::ShutdownFunction => "Shutdown function error.",
            DutFault::FixtureCommand => "UART communication failure",
        };
        f.write_str(msg)
    }
}

/// Which polling loop produced a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleState {
    Charge,
    Discharge,
}

/// One polled sample. Appended, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cycle {
    /// Sample index within the phase (shared across the channel's DUTs)
    pub counter: u32,
    /// Wall-clock time of the sample
    pub timestamp: DateTime<Utc>,
    /// Seconds since the phase started
    pub elapsed: f64,
    /// Capacitor voltage (V)
    pub vcap: f64,
    /// Input / boost voltage (V)
    pub vin: f64,
    /// Temperature (degC)
    pub temp: f64,
    /// Loop that produced the sample
    pub state: CycleState,
}

/// A device under test and everything measured on it.
#[derive(Debug, Clone, Serialize)]
pub struct Dut {
    /// Slot index within the channel
    pub slot: usize,
    pub barcode: Barcode,
    /// Resolved from the barcode's product type
    pub family: ProductFamily,
    status: DutStatus,
    #[serde(rename = "error_message", serialize_with = "serialize_fault")]
    fault: Option<DutFault>,
    /// Seconds spent in the last charge or recharge loop
    pub charge_time: f64,
    /// Seconds spent in the discharge loop
    pub discharge_time: f64,
    /// Seconds spent waiting for the capacitance measurement
    pub capacitor_time: f64,
    pub capacitance_measured: Option<f64>,
    pub hw_version: Option<String>,
    pub fw_version: Option<String>,
    pub cable_barcode: String,
    pub capacitor_barcode: String,
    pub test_date: DateTime<Utc>,
    pub vpd_programmed: bool,
    pub cycles: Vec<Cycle>,
}

fn serialize_fault<S: Serializer>(fault: &Option<DutFault>, s: S) -> Result<S::Ok, S::Error> {
    match fault {
        Some(f) => s.serialize_str(&f.to_string()),
        None => s.serialize_str(""),
    }
}

impl Dut {
    /// Create an idle DUT for a slot.
    pub fn new(slot: usize, barcode: Barcode, family: ProductFamily) -> Self {
        Self {
            slot,
            barcode,
            family,
            status: DutStatus::Idle,
            fault: None,
            charge_time: 0.0,
            discharge_time: 0.0,
            capacitor_time: 0.0,
            capacitance_measured: None,
            hw_version: None,
            fw_version: None,
            cable_barcode: String::new(),
            capacitor_barcode: String::new(),
            test_date: Utc::now(),
            vpd_programmed: false,
            cycles: Vec::new(),
        }
    }

    /// Current test status.
    pub fn status(&self) -> DutStatus {
        self.status
    }

    /// First fault, if any.
    pub fn fault(&self) -> Option<&DutFault> {
        self.fault.as_ref()
    }

    /// Error message, empty when the DUT has not failed.
    pub fn error_message(&self) -> String {
        self.fault.as_ref().map(ToString::to_string).unwrap_or_default()
    }

    /// Failure is terminal.
    pub fn is_failed(&self) -> bool {
        self.status == DutStatus::Fail
    }

    /// Move to a non-failure status. Ignored once the DUT has failed.
    pub fn set_status(&mut self, status: DutStatus) {
        if self.status == DutStatus::Fail {
            if status != DutStatus::Fail {
                debug!(slot = self.slot, ?status, "ignoring status change of failed DUT");
            }
            return;
        }
        self.status = status;
    }

    /// Mark the DUT failed. The first fault is kept.
    pub fn fail(&mut self, fault: DutFault) {
        self.status = DutStatus::Fail;
        if self.fault.is_none() {
            info!(slot = self.slot, barcode = %self.barcode, error = %fault, "DUT failed");
            self.fault = Some(fault);
        }
    }

    /// Append a polled sample.
    pub fn record(&mut self, cycle: Cycle) {
        self.cycles.push(cycle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn dut() -> Dut {
        let bc: Barcode = "AGIGA9822-004BCA02144800000002-06".parse().unwrap();
        Dut::new(0, bc, ProductFamily::Amber)
    }

    #[test]
    #[traced_test]
    fn test_failure_is_logged_once() {
        let mut d = dut();
        d.fail(DutFault::VinError);
        d.fail(DutFault::NotReady);
        assert!(logs_contain("DUT failed"));
        assert!(logs_contain("Vin error"));
        assert!(!logs_contain("DUT is not ready."));
    }

    #[test]
    fn test_failure_is_sticky() {
        let mut d = dut();
        d.set_status(DutStatus::Charging);
        d.fail(DutFault::TemperatureOutOfRange);
        d.set_status(DutStatus::Idle);
        d.set_status(DutStatus::Pass);
        assert_eq!(d.status(), DutStatus::Fail);
    }

    #[test]
    fn test_first_fault_is_kept() {
        let mut d = dut();
        d.fail(DutFault::IicAccessFailed);
        d.fail(DutFault::ChargeTimeTooLong);
        assert_eq!(d.fault(), Some(&DutFault::IicAccessFailed));
        assert_eq!(d.error_message(), "IIC access failed.");
    }

    #[test]
    fn test_serializes_error_message() {
        let mut d = dut();
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["error_message"], "");
        d.fail(DutFault::CapOverLimits);
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["error_message"], "Cap is over limits");
        assert_eq!(json["status"], "Fail");
    }
}
