//! Core library of the UFT burn-in test station.
//!
//! The station runs a fixed test sequence (VPD programming, charge,
//! capacitance measurement, VPD check, discharge, recharge) over capacitor
//! backed power-fail-protection modules seated in fixture slots. Each fixture
//! controller is driven by one independent channel sequencer.

pub mod config;
pub mod dut;
pub mod error;
pub mod hardware;
pub mod results;
pub mod sequencer;
pub mod station;
pub mod test_config;
