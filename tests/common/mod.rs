//! Shared helpers for the sequencer integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use uft_station::config::StationConfig;
use uft_station::dut::{Cycle, Dut};
use uft_station::error::{AppResult, StationError};
use uft_station::hardware::sim::SimulatedFixture;
use uft_station::hardware::ChannelHardware;
use uft_station::results::ResultSink;
use uft_station::sequencer::{Channel, Phase, SlotAssignment};
use uft_station::test_config::{PhaseConfig, TestConfig, TestItem, TomlConfigProvider};

/// Amber module, revision 06.
pub const AMBER_A: &str = "AGIGA9822-004BCA02144800000002-06";
pub const AMBER_B: &str = "AGIGA9822-004BCA02144800000003-06";
pub const AMBER_PN: &str = "AGIGA9822-004BCA";
/// Garnet module, revision 01.
pub const GARNET: &str = "AGIGA9831-001ABC02144800000004-01";
pub const GARNET_PN: &str = "AGIGA9831-001ABC";
/// Jamber module, revision 01.
pub const JAMBER: &str = "AGIGA9834-001ABC02144800000006-01";
pub const JAMBER_PN: &str = "AGIGA9834-001ABC";

/// Sink that keeps the records in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub exported: Mutex<Vec<Dut>>,
    pub archived: Mutex<Vec<(String, usize)>>,
    pub fail_archive: bool,
}

impl RecordingSink {
    pub fn failing_archive() -> Self {
        Self {
            fail_archive: true,
            ..Default::default()
        }
    }

    pub fn exported(&self) -> Vec<Dut> {
        self.exported.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResultSink for RecordingSink {
    async fn archive_and_store(&self, dut: &Dut, cycles: &[Cycle]) -> AppResult<()> {
        if self.fail_archive {
            return Err(StationError::Io(std::io::Error::other("archive offline")));
        }
        self.archived
            .lock()
            .unwrap()
            .push((dut.barcode.raw.clone(), cycles.len()));
        Ok(())
    }

    async fn export_to_file(&self, dut: &Dut) -> AppResult<PathBuf> {
        self.exported.lock().unwrap().push(dut.clone());
        Ok(PathBuf::from(format!("{}.xml", dut.barcode.raw)))
    }
}

/// Simulated single-channel configuration.
pub fn station_config() -> StationConfig {
    StationConfig::simulated("unused")
}

pub fn charge_limits() -> PhaseConfig {
    PhaseConfig {
        enable: true,
        stop_on_fail: true,
        min: 10.0,
        max: 120.0,
        threshold: 4.0,
        ceiling: 5.0,
        ..Default::default()
    }
}

pub fn discharge_limits() -> PhaseConfig {
    PhaseConfig {
        enable: true,
        stop_on_fail: true,
        min: 5.0,
        max: 60.0,
        threshold: 2.0,
        current: 0.5,
        ..Default::default()
    }
}

pub fn capacitance_limits() -> PhaseConfig {
    PhaseConfig {
        enable: true,
        stop_on_fail: true,
        min: 20.0,
        max: 40.0,
        ..Default::default()
    }
}

pub fn part(part_number: &str, revision: &str, items: &[(TestItem, PhaseConfig)]) -> TestConfig {
    TestConfig {
        part_number: part_number.to_string(),
        revision: revision.to_string(),
        items: items.iter().cloned().collect(),
    }
}

pub fn provider(parts: Vec<TestConfig>) -> Arc<TomlConfigProvider> {
    Arc::new(TomlConfigProvider::new(parts))
}

pub fn assignments(barcodes: &[&str]) -> Vec<SlotAssignment> {
    barcodes.iter().map(|b| SlotAssignment::new(*b)).collect()
}

/// Channel 0 on a simulated board.
pub async fn channel(
    config: StationConfig,
    sim: &SimulatedFixture,
    provider: Arc<TomlConfigProvider>,
    sink: Arc<RecordingSink>,
    assignments: Vec<SlotAssignment>,
    mode4in1: bool,
) -> Channel {
    let hw = ChannelHardware::simulated(sim.clone(), 1, 0).await.unwrap();
    Channel::new(
        0,
        Arc::new(config),
        hw,
        provider,
        sink,
        assignments,
        mode4in1,
    )
}

/// Queue `phases` followed by `EXIT`.
pub fn enqueue(channel: &Channel, phases: &[Phase]) {
    for phase in phases {
        channel.enqueue(*phase);
    }
    channel.enqueue(Phase::Exit);
}
