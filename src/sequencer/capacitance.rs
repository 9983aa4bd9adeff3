//! CHECK_CAPACITANCE: on-device capacitance measurement and the GTG sweep.

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::{contain, elapsed_secs, Channel, Rig};
use crate::dut::{DutFault, DutStatus};
use crate::error::AppResult;
use crate::hardware::pgem::reg;
use crate::test_config::TestItem;

impl Channel {
    pub(super) async fn check_capacitance(&mut self) -> AppResult<()> {
        let gated = self.gated(TestItem::Capacitance, DutStatus::Idle);
        let active = self.in_status(&gated, DutStatus::Idle);
        if active.is_empty() {
            debug!(channel = self.id, "no DUT needs a capacitance measurement");
            return Ok(());
        }
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);
        let timing = &self.config.timing;
        let poll = self.config.cap_poll_interval();

        for &slot in &active {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            match contain(dut, rig.output_on(slot).await)? {
                Some(true) => {}
                Some(false) => {
                    dut.fail(DutFault::NoPowerOutputCap);
                    continue;
                }
                None => continue,
            }
            let family = dut.family;
            if contain(dut, rig.pgem(slot).start_cap_measure(family).await)?.is_some() {
                dut.set_status(DutStatus::CapMeasuring);
                info!(channel = self.id, slot, %family, "capacitance measurement started");
            }
        }

        sleep(timing.cap_start_settle).await;
        let start = Instant::now();

        loop {
            let measuring = self.in_status(&active, DutStatus::CapMeasuring);
            if measuring.is_empty() {
                break;
            }
            for slot in measuring {
                let cfg = self.phase_config(slot, TestItem::Capacitance);
                let overtime = cfg.overtime.unwrap_or(timing.cap_overtime.as_secs_f64());
                let Some(dut) = self.duts[slot].as_mut() else {
                    continue;
                };
                let pgem = rig.pgem(slot);
                let Some(status) = contain(dut, pgem.status().await)? else {
                    continue;
                };
                let Some(vcap) = contain(dut, pgem.vcap().await)? else {
                    continue;
                };
                let elapsed = elapsed_secs(start);
                dut.capacitor_time = elapsed;
                debug!(channel = self.id, slot, vcap, elapsed, stat = status.0, "capacitance poll");

                if !status.cap_measuring() {
                    let Some(value) = contain(dut, pgem.capacitance().await)? else {
                        continue;
                    };
                    dut.capacitance_measured = Some(value);
                    if cfg.within_limits(value) {
                        info!(channel = self.id, slot, capacitance = value, "capacitance ok");
                        dut.set_status(DutStatus::Idle);
                    } else {
                        warn!(
                            channel = self.id,
                            slot,
                            capacitance = value,
                            min = cfg.min,
                            max = cfg.max,
                            "capacitance out of limits"
                        );
                        dut.fail(DutFault::CapOverLimits);
                    }
                } else if elapsed > overtime {
                    dut.fail(DutFault::CapStartOverTime);
                }
            }
            if !self.in_status(&active, DutStatus::CapMeasuring).is_empty() {
                sleep(poll).await;
            }
        }

        for slot in self.in_status(&active, DutStatus::Idle) {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            let pgem = rig.pgem(slot);
            let Some(gtg) = contain(dut, pgem.gtg().await)? else {
                continue;
            };
            if gtg & reg::GTG_BIT == 0 {
                dut.fail(DutFault::GtgBitCleared);
                continue;
            }
            let Some(warning) = contain(dut, pgem.gtg_warning().await)? else {
                continue;
            };
            if warning != 0 {
                warn!(channel = self.id, slot, warning, "GTG warning raised");
                dut.fail(DutFault::GtgWarning);
                continue;
            }
            for port in rig.ports(slot) {
                match contain(dut, self.hw.fixture.gtg_pin(port).await)? {
                    Some(true) => {}
                    Some(false) => {
                        dut.fail(DutFault::GtgPinCheck);
                        break;
                    }
                    None => break,
                }
            }
        }
        Ok(())
    }
}
