//! PROGRAM_VPD and CHECK_VPD against the simulated fixture.

mod common;

use std::path::Path;
use std::sync::Arc;

use common::*;
use tempfile::TempDir;
use uft_station::dut::DutStatus;
use uft_station::error::StationError;
use uft_station::hardware::fixture::FixtureCommand;
use uft_station::hardware::pgem::reg;
use uft_station::hardware::sim::{DutProfile, SimulatedFixture};
use uft_station::hardware::vpd::{VpdImage, VPD_SIZE};
use uft_station::sequencer::{ChannelResult, Phase};
use uft_station::test_config::{PhaseConfig, TestItem};

fn blank_image(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("vpd.bin");
    std::fs::write(&path, VpdImage::blank().as_bytes()).unwrap();
    path
}

fn program_limits(vpd_file: &Path) -> PhaseConfig {
    PhaseConfig {
        enable: true,
        stop_on_fail: true,
        vpd_file: Some(vpd_file.to_path_buf()),
        fw_version: Some("1.2".to_string()),
        ..Default::default()
    }
}

fn stamped(barcode: &str) -> VpdImage {
    let mut image = VpdImage::blank();
    image.stamp_serial(barcode);
    image
}

#[tokio::test(start_paused = true)]
async fn test_program_then_check_vpd() {
    let dir = TempDir::new().unwrap();
    let file = blank_image(&dir);
    let sim = SimulatedFixture::new();
    sim.insert(0, DutProfile::default());
    let ch = channel(
        station_config(),
        &sim,
        provider(vec![part(
            AMBER_PN,
            "06",
            &[(TestItem::ProgramVpd, program_limits(&file))],
        )]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        false,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd, Phase::CheckVpd]);

    let report = ch.run().await.unwrap();
    let dut = report.dut(0).unwrap();
    assert_eq!(dut.status(), DutStatus::Pass, "{}", dut.error_message());
    assert!(dut.vpd_programmed);
    assert_eq!(dut.hw_version.as_deref(), Some("1"));
    assert_eq!(dut.fw_version.as_deref(), Some("1.2"));

    let eeprom = sim.eeprom(0, reg::EEPROM_ADDR).unwrap();
    assert_eq!(&eeprom[..VPD_SIZE], stamped(AMBER_A).as_bytes());
    assert!(sim.commands_on(0).contains(&FixtureCommand::ResetDut));
}

#[tokio::test(start_paused = true)]
async fn test_firmware_mismatch() {
    let dir = TempDir::new().unwrap();
    let file = blank_image(&dir);
    let limits = PhaseConfig {
        fw_version: Some("2.0".to_string()),
        ..program_limits(&file)
    };
    let sim = SimulatedFixture::new();
    sim.insert(0, DutProfile::default());
    let ch = channel(
        station_config(),
        &sim,
        provider(vec![part(AMBER_PN, "06", &[(TestItem::ProgramVpd, limits)])]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        false,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd, Phase::CheckVpd]);

    let report = ch.run().await.unwrap();
    let dut = report.dut(0).unwrap();
    assert_eq!(dut.error_message(), "FW ver error.");
    assert_eq!(dut.fw_version.as_deref(), Some("1.2"));
}

#[tokio::test(start_paused = true)]
async fn test_flush_ee_commits_without_power_cycle() {
    let dir = TempDir::new().unwrap();
    let file = blank_image(&dir);
    let limits = PhaseConfig {
        flush_ee: true,
        ..program_limits(&file)
    };
    let sim = SimulatedFixture::new();
    sim.insert(0, DutProfile::default());
    let ch = channel(
        station_config(),
        &sim,
        provider(vec![part(AMBER_PN, "06", &[(TestItem::ProgramVpd, limits)])]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        false,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd]);

    let report = ch.run().await.unwrap();
    assert_eq!(report.result, ChannelResult::Pass);
    assert!(sim
        .mcu_writes(0)
        .contains(&(reg::COMMAND, reg::CMD_FLUSH_EE)));
}

#[tokio::test(start_paused = true)]
async fn test_mode4in1_programs_shared_eeproms() {
    let dir = TempDir::new().unwrap();
    let file = blank_image(&dir);
    let mut config = station_config();
    config.station.mode4in1_part_numbers = vec![AMBER_PN.to_string()];
    let sim = SimulatedFixture::new();
    sim.insert_4in1(0, DutProfile::default());
    let ch = channel(
        config,
        &sim,
        provider(vec![part(
            AMBER_PN,
            "06",
            &[(TestItem::ProgramVpd, program_limits(&file))],
        )]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        true,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd]);

    let report = ch.run().await.unwrap();
    let dut = report.dut(0).unwrap();
    assert_eq!(dut.status(), DutStatus::Pass, "{}", dut.error_message());

    let image = stamped(AMBER_A);
    for addr in reg::SHARED_EEPROM_ADDRS {
        let eeprom = sim.eeprom(0, addr).unwrap();
        assert_eq!(&eeprom[..VPD_SIZE], image.as_bytes(), "EEPROM {:#04x}", addr);
    }
    for port in 0..4 {
        assert_eq!(sim.product_type(port), Some(0x01));
    }
}

#[tokio::test(start_paused = true)]
async fn test_unseated_module_is_a_connection_issue() {
    let dir = TempDir::new().unwrap();
    let file = blank_image(&dir);
    let sim = SimulatedFixture::new();
    sim.insert(
        0,
        DutProfile {
            present: false,
            ..Default::default()
        },
    );
    let ch = channel(
        station_config(),
        &sim,
        provider(vec![part(
            AMBER_PN,
            "06",
            &[(TestItem::ProgramVpd, program_limits(&file))],
        )]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        false,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd]);

    let report = ch.run().await.unwrap();
    let dut = report.dut(0).unwrap();
    assert_eq!(dut.error_message(), "PGEM Connection Issue");
    assert!(!dut.vpd_programmed);
    assert!(!sim.commands_on(0).contains(&FixtureCommand::OutputOn));
}

#[tokio::test(start_paused = true)]
async fn test_missing_vpd_file_aborts_channel() {
    let limits = PhaseConfig {
        enable: true,
        ..Default::default()
    };
    let sim = SimulatedFixture::new();
    sim.insert(0, DutProfile::default());
    let ch = channel(
        station_config(),
        &sim,
        provider(vec![part(AMBER_PN, "06", &[(TestItem::ProgramVpd, limits)])]),
        Arc::new(RecordingSink::default()),
        assignments(&[AMBER_A]),
        false,
    )
    .await;
    enqueue(&ch, &[Phase::Init, Phase::ProgramVpd]);

    let err = ch.run().await.unwrap_err();
    assert!(matches!(err, StationError::Configuration(_)));
    assert!(!sim.power(0));
}
