//! CHARGE and RECHARGE polling loop.

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::limits::{self, ChargeSample, ChargeVerdict};
use super::{contain, elapsed_secs, Channel, Rig};
use crate::dut::{CycleState, DutFault, DutStatus};
use crate::error::AppResult;
use crate::test_config::TestItem;

impl Channel {
    /// Charge every gated DUT until each one passed or failed.
    ///
    /// `item` selects the limits: [`TestItem::Charge`] records a cycle per
    /// sample, [`TestItem::Recharge`] switches a passing DUT off again and
    /// optionally shuts it down.
    pub(super) async fn charge(&mut self, item: TestItem) -> AppResult<()> {
        let gated = self.gated(item, DutStatus::Idle);
        let active = self.in_status(&gated, DutStatus::Idle);
        if active.is_empty() {
            debug!(channel = self.id, ?item, "nothing to charge");
            return Ok(());
        }
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);
        let interval = self.config.station.interval;

        let mut powered = 0;
        for &slot in &active {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            if contain(dut, rig.power_on(slot).await)?.is_some() {
                dut.set_status(DutStatus::Charging);
                powered += 1;
            }
        }
        self.counter = 0;
        let start = Instant::now();
        if powered > 0 {
            sleep(self.config.timing.power_settle).await;
        }

        loop {
            let charging = self.in_status(&active, DutStatus::Charging);
            if charging.is_empty() {
                break;
            }
            for slot in charging {
                let cfg = self.phase_config(slot, item);
                self.counter += 1;
                let counter = self.counter;
                let Some(dut) = self.duts[slot].as_mut() else {
                    continue;
                };

                match contain(dut, rig.hardware_ready(slot).await)? {
                    Some(true) => {}
                    Some(false) => {
                        dut.fail(DutFault::NotReady);
                        continue;
                    }
                    None => continue,
                }
                let Some(reading) = contain(dut, rig.read(slot).await)? else {
                    continue;
                };
                let Some(status) = contain(dut, rig.pgem(slot).status().await)? else {
                    continue;
                };

                let elapsed = elapsed_secs(start);
                dut.charge_time = elapsed;
                if item == TestItem::Charge {
                    dut.record(reading.cycle(counter, elapsed, CycleState::Charge));
                }

                let sample = ChargeSample {
                    temperature: reading.temperature,
                    vcap: reading.vcap,
                    elapsed,
                    charge_complete: status.charge_complete(),
                };
                let verdict = limits::evaluate_charge(&sample, &cfg);
                debug!(
                    channel = self.id,
                    slot,
                    vcap = reading.vcap,
                    temp = reading.temperature,
                    elapsed,
                    charged = sample.charge_complete,
                    ?verdict,
                    "charge sample"
                );
                match verdict {
                    ChargeVerdict::Charging => {}
                    ChargeVerdict::Pass => {
                        info!(channel = self.id, slot, ?item, elapsed, vcap = reading.vcap, "charged");
                        if item == TestItem::Recharge {
                            if contain(dut, rig.power_off(slot).await)?.is_none() {
                                continue;
                            }
                            if cfg.shutdown
                                && contain(dut, self.hw.fixture.shutdown_dut(slot).await)?.is_none()
                            {
                                continue;
                            }
                        }
                        dut.set_status(DutStatus::Idle);
                    }
                    ChargeVerdict::Fail(fault) => {
                        warn!(channel = self.id, slot, ?item, elapsed, vcap = reading.vcap, "charge failed");
                        dut.fail(fault);
                    }
                }
            }
            if !self.in_status(&active, DutStatus::Charging).is_empty() {
                sleep(interval).await;
            }
        }
        Ok(())
    }
}
