//! `uft_sim`: run the production sequence against simulated fixtures.
//!
//! Every configured channel gets its own simulated fixture controller with a
//! module seated in each slot that has a barcode.
//!
//! ```bash
//! cargo run --bin uft_sim -- --limits config/limits.toml \
//!     --barcode AGIGA9822-004BCA02144800000002-06 --barcode ""
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use uft_station::config::StationConfig;
use uft_station::hardware::sim::{DutProfile, SimulatedFixture};
use uft_station::hardware::ChannelHardware;
use uft_station::results::StationSink;
use uft_station::sequencer::SlotAssignment;
use uft_station::station::{ChannelSetup, Station};
use uft_station::test_config::TomlConfigProvider;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "uft_sim")]
#[command(about = "Run the burn-in test sequence against simulated fixtures")]
struct Cli {
    /// Station configuration; a single simulated channel when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Test-limits document
    #[arg(short, long, default_value = "config/limits.toml")]
    limits: PathBuf,
    /// Module barcode per slot, in slot order ("" leaves a slot empty)
    #[arg(short, long = "barcode", required = true)]
    barcodes: Vec<String>,
    /// Wire every module as a 4-in-1 group
    #[arg(long)]
    mode4in1: bool,
    /// Result directory when running without a station configuration
    #[arg(long, default_value = "logs")]
    result_log: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => StationConfig::load_from(path)
            .with_context(|| format!("Failed to load station configuration {}", path.display()))?,
        None => StationConfig::simulated(&cli.result_log),
    };

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.station.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let provider = TomlConfigProvider::load_from(&cli.limits)
        .with_context(|| format!("Failed to load test limits {}", cli.limits.display()))?;
    let sink = StationSink::new(&config.storage);
    let config = Arc::new(config);
    let station = Station::new(config.clone(), Arc::new(provider), Arc::new(sink));

    let mut setups = Vec::with_capacity(config.channels.len());
    for binding in &config.channels {
        let mode4in1 = binding.mode4in1.unwrap_or(cli.mode4in1);
        let sim = SimulatedFixture::new();
        for (slot, barcode) in cli.barcodes.iter().enumerate() {
            if barcode.trim().is_empty() {
                continue;
            }
            let port = slot + usize::from(binding.group) * 4;
            if mode4in1 {
                sim.insert_4in1(port, DutProfile::default());
            } else {
                sim.insert(port, DutProfile::default());
            }
        }
        let hardware = ChannelHardware::simulated(sim, binding.board_id, binding.group)
            .await
            .with_context(|| format!("Failed to connect simulated fixture of channel {}", binding.id))?;
        setups.push(ChannelSetup {
            id: binding.id,
            hardware,
            assignments: cli.barcodes.iter().map(SlotAssignment::new).collect(),
            mode4in1,
        });
    }

    let mut aborted = 0;
    for result in station.run(setups).await? {
        match result {
            Ok(report) => {
                info!(channel = report.channel, result = ?report.result, "channel done");
                for dut in &report.duts {
                    println!(
                        "channel {} slot {} {} {:?} {}",
                        report.channel,
                        dut.slot,
                        dut.barcode,
                        dut.status(),
                        dut.error_message()
                    );
                }
            }
            Err(e) => {
                error!(error = %e, "channel aborted");
                aborted += 1;
            }
        }
    }
    if aborted > 0 {
        bail!("{} channel(s) aborted", aborted);
    }
    Ok(())
}
