//! Several channels driven by one station.

mod common;

use std::sync::Arc;

use common::*;
use tempfile::TempDir;
use uft_station::config::ChannelBinding;
use uft_station::dut::DutStatus;
use uft_station::error::StationError;
use uft_station::hardware::sim::{DutProfile, SimulatedFixture};
use uft_station::hardware::ChannelHardware;
use uft_station::results::{CsvArchive, StationSink};
use uft_station::sequencer::{ChannelResult, SlotAssignment};
use uft_station::station::{ChannelSetup, Station};
use uft_station::test_config::TestItem;

async fn setup(id: u8, board_id: u8, sim: &SimulatedFixture, barcodes: &[&str]) -> ChannelSetup {
    ChannelSetup {
        id,
        hardware: ChannelHardware::simulated(sim.clone(), board_id, 0)
            .await
            .unwrap(),
        assignments: barcodes.iter().map(|b| SlotAssignment::new(*b)).collect(),
        mode4in1: false,
    }
}

#[tokio::test(start_paused = true)]
async fn test_channels_run_independently() {
    let dir = TempDir::new().unwrap();
    let mut config = station_config();
    config.storage.result_log = dir.path().join("results");
    config.storage.archive_dir = Some(dir.path().join("archive"));
    config.channels.push(ChannelBinding {
        id: 1,
        port: "sim1".to_string(),
        board_id: 2,
        group: 0,
        mode4in1: None,
    });
    let config = Arc::new(config);

    let healthy = SimulatedFixture::new();
    healthy.insert(
        0,
        DutProfile {
            full_voltage: 4.5,
            charge_rate: 0.09,
            ..Default::default()
        },
    );
    let slow = SimulatedFixture::new();
    slow.insert(
        0,
        DutProfile {
            full_voltage: 4.5,
            charge_rate: 0.01,
            ..Default::default()
        },
    );

    let station = Station::new(
        config.clone(),
        provider(vec![part(
            AMBER_PN,
            "06",
            &[(TestItem::Charge, charge_limits())],
        )]),
        Arc::new(StationSink::new(&config.storage)),
    );
    let setups = vec![
        setup(0, 1, &healthy, &[AMBER_A]).await,
        setup(1, 2, &slow, &[AMBER_B]).await,
    ];

    let results = station.run(setups).await.unwrap();
    assert_eq!(results.len(), 2);
    let passed = results[0].as_ref().unwrap();
    assert_eq!(passed.result, ChannelResult::Pass);
    let failed = results[1].as_ref().unwrap();
    assert_eq!(failed.result, ChannelResult::Fail);
    assert_eq!(
        failed.dut(0).unwrap().error_message(),
        "Charge Time Too Long."
    );

    for report in [passed, failed] {
        assert_eq!(report.exported.len(), 1);
        assert!(report.exported[0].exists());
    }
    let archive = std::fs::read_to_string(dir.path().join("archive").join(CsvArchive::DUT_TABLE))
        .unwrap();
    assert_eq!(archive.lines().count(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_channel_does_not_stop_the_others() {
    let mut config = station_config();
    config.channels.push(ChannelBinding {
        id: 1,
        port: "sim1".to_string(),
        board_id: 2,
        group: 0,
        mode4in1: None,
    });
    let config = Arc::new(config);

    let good = SimulatedFixture::new();
    good.insert(0, DutProfile::default());
    let dead = SimulatedFixture::new();
    dead.insert(0, DutProfile::default());

    let sink = Arc::new(RecordingSink::default());
    let station = Station::new(config, provider(vec![part(AMBER_PN, "06", &[])]), sink.clone());
    let setups = vec![
        setup(0, 1, &good, &[AMBER_A]).await,
        setup(1, 2, &dead, &[AMBER_B]).await,
    ];
    dead.set_offline(true);

    let results = station.run(setups).await.unwrap();
    let report = results[0].as_ref().unwrap();
    assert_eq!(report.result, ChannelResult::Pass);
    assert_eq!(report.dut(0).unwrap().status(), DutStatus::Pass);
    assert!(results[1].is_err());
    assert_eq!(sink.exported().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_channel_is_rejected() {
    let sim = SimulatedFixture::new();
    let station = Station::new(
        Arc::new(station_config()),
        provider(Vec::new()),
        Arc::new(RecordingSink::default()),
    );
    let err = station
        .run(vec![setup(5, 1, &sim, &[]).await])
        .await
        .unwrap_err();
    assert!(matches!(err, StationError::Configuration(_)));
}

#[tokio::test(start_paused = true)]
async fn test_binding_forces_wiring_mode() {
    let mut config = station_config();
    config.channels[0].mode4in1 = Some(true);
    let station = Station::new(
        Arc::new(config),
        provider(Vec::new()),
        Arc::new(RecordingSink::default()),
    );
    let sim = SimulatedFixture::new();
    let channel = station.channel(setup(0, 1, &sim, &[]).await).unwrap();
    assert!(channel.mode4in1());
}
