//! Per-sample verdicts of the polling phases.
//!
//! Pure functions over one sample and the phase's limits; the phase handlers
//! own all hardware side effects.

use crate::dut::{DutFault, ProductFamily};
use crate::test_config::PhaseConfig;

/// Operating temperature window (degC), inclusive.
pub const TEMPERATURE_MIN: f64 = 10.0;
pub const TEMPERATURE_MAX: f64 = 50.0;

/// Accepted input voltage while programming (V), inclusive.
pub const VIN_MIN: f64 = 10.0;
pub const VIN_MAX: f64 = 13.0;

/// Minimum boost output while discharging (V).
pub const BOOST_MIN: f64 = 4.4;

/// Bypass fault: capacitor above this voltage (V) ...
pub const BYPASS_VCAP: f64 = 5.5;
/// ... with the input lagging it by at least this much (V).
pub const BYPASS_DELTA: f64 = 0.3;

/// Fast loop engages this close above the discharge threshold (V).
pub const FAST_LOOP_MARGIN: f64 = 0.2;

pub fn temperature_in_range(temperature: f64) -> bool {
    (TEMPERATURE_MIN..=TEMPERATURE_MAX).contains(&temperature)
}

pub fn vin_in_range(vin: f64) -> bool {
    (VIN_MIN..=VIN_MAX).contains(&vin)
}

/// One charge or recharge sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChargeSample {
    pub temperature: f64,
    pub vcap: f64,
    /// Seconds since the phase started
    pub elapsed: f64,
    /// PGEMSTAT charge-complete bit
    pub charge_complete: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeVerdict {
    /// Keep polling
    Charging,
    Pass,
    Fail(DutFault),
}

/// Evaluate a charge sample, first matching rule wins:
/// temperature, overall time, then the complete-bit band check.
pub fn evaluate_charge(sample: &ChargeSample, limits: &PhaseConfig) -> ChargeVerdict {
    if !temperature_in_range(sample.temperature) {
        return ChargeVerdict::Fail(DutFault::TemperatureOutOfRange);
    }
    if sample.elapsed > limits.max {
        return ChargeVerdict::Fail(DutFault::ChargeTimeTooLong);
    }
    if !sample.charge_complete {
        return ChargeVerdict::Charging;
    }
    let vcap_ok = limits.threshold <= sample.vcap && sample.vcap < limits.ceiling;
    let time_ok = limits.min < sample.elapsed && sample.elapsed < limits.max;
    if vcap_ok && time_ok {
        ChargeVerdict::Pass
    } else {
        ChargeVerdict::Fail(DutFault::ChargeTimeOrVcap)
    }
}

/// One discharge sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DischargeSample {
    pub temperature: f64,
    pub vcap: f64,
    /// Boost output (V)
    pub vin: f64,
    /// Seconds since the load was armed
    pub elapsed: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DischargeVerdict {
    /// Keep polling
    Discharging,
    /// Threshold crossed after the minimum time; the GTG pin decides the pass
    Drained,
    Fail(DutFault),
}

/// Evaluate a discharge sample, first matching rule wins:
/// temperature, overall time, boost voltage, threshold, then the Garnet
/// bypass check while the threshold has not been crossed.
pub fn evaluate_discharge(
    sample: &DischargeSample,
    limits: &PhaseConfig,
    family: ProductFamily,
) -> DischargeVerdict {
    if !temperature_in_range(sample.temperature) {
        return DischargeVerdict::Fail(DutFault::TemperatureOutOfRange);
    }
    if sample.elapsed > limits.max {
        return DischargeVerdict::Fail(DutFault::DischargeTimeTooLong);
    }
    if sample.vin < BOOST_MIN {
        return DischargeVerdict::Fail(DutFault::BoostVoltage);
    }
    if sample.vcap < limits.threshold {
        return if sample.elapsed < limits.min {
            DischargeVerdict::Fail(DutFault::DischargeTimeTooShort)
        } else {
            DischargeVerdict::Drained
        };
    }
    if family.has_bypass_check()
        && sample.vcap > BYPASS_VCAP
        && sample.vcap - sample.vin >= BYPASS_DELTA
    {
        return DischargeVerdict::Fail(DutFault::BypassVoltage);
    }
    DischargeVerdict::Discharging
}

/// Whether a sample engages the discharge fast loop.
pub fn enters_fast_loop(vcap: f64, threshold: f64, family: ProductFamily) -> bool {
    family.has_bypass_check() && vcap <= threshold + FAST_LOOP_MARGIN
}
