//! EXIT: aggregate the channel result and hand the DUT records to the sink.
//!
//! Fixture commands here are best effort; only a failed export aborts.

use tracing::{info, warn};

use super::{Channel, ChannelReport, ChannelResult, Phase};
use crate::dut::DutStatus;
use crate::error::AppResult;

impl Channel {
    pub(super) async fn teardown(&mut self) -> AppResult<ChannelReport> {
        let loaded = self.duts.iter().flatten().count();
        self.result = if loaded == 0 {
            ChannelResult::Idle
        } else if self
            .duts
            .iter()
            .flatten()
            .any(|d| d.status() != DutStatus::Idle)
        {
            ChannelResult::Fail
        } else {
            ChannelResult::Pass
        };

        for slot in 0..self.duts.len() {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            if dut.status() == DutStatus::Idle {
                dut.set_status(DutStatus::Pass);
            } else {
                warn!(
                    channel = self.id,
                    slot,
                    status = ?dut.status(),
                    error = %dut.error_message(),
                    "DUT did not pass"
                );
                if let Err(e) = self.hw.fixture.led_on(slot).await {
                    warn!(channel = self.id, slot, error = %e, "failed to light fail LED");
                }
            }
        }

        // Records go to the sink even when the fixture stops answering.
        self.safe_state().await;

        let mut exported = Vec::with_capacity(loaded);
        for dut in self.duts.iter().flatten() {
            exported.push(self.sink.export_to_file(dut).await?);
            if let Err(e) = self.sink.archive_and_store(dut, &dut.cycles).await {
                warn!(channel = self.id, slot = dut.slot, error = %e, "archiving results failed");
            }
        }

        info!(channel = self.id, result = ?self.result, duts = loaded, "channel finished");
        self.publish(Some(Phase::Exit), true);
        Ok(ChannelReport {
            channel: self.id,
            result: self.result,
            duts: self.duts.iter().flatten().cloned().collect(),
            exported,
        })
    }
}
