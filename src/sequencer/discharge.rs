//! DISCHARGE: drain the capacitors through the electronic load.

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use super::limits::{self, DischargeSample, DischargeVerdict};
use super::{contain, elapsed_secs, Channel, Rig};
use crate::dut::{CycleState, DutFault, DutStatus};
use crate::error::AppResult;
use crate::hardware::fixture::LoadMode;
use crate::test_config::TestItem;

impl Channel {
    pub(super) async fn discharge(&mut self) -> AppResult<()> {
        let gated = self.gated(TestItem::Discharge, DutStatus::Idle);
        let active = self.in_status(&gated, DutStatus::Idle);
        if active.is_empty() {
            debug!(channel = self.id, "nothing to discharge");
            return Ok(());
        }
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);
        let timing = &self.config.timing;
        let interval = self.config.station.interval;

        for &slot in &active {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            contain(dut, rig.power_off(slot).await)?;
        }
        sleep(timing.discharge_settle).await;

        for slot in self.in_status(&active, DutStatus::Idle) {
            let cfg = self.phase_config(slot, TestItem::Discharge);
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            let mode = LoadMode::for_current(cfg.current);
            let mut armed = true;
            for port in rig.ports(slot) {
                let fixture = &self.hw.fixture;
                if contain(dut, fixture.set_load_current(port, cfg.current).await)?.is_none()
                    || contain(dut, fixture.load_on(port, mode).await)?.is_none()
                {
                    armed = false;
                    break;
                }
            }
            if armed {
                info!(channel = self.id, slot, current = cfg.current, ?mode, "load armed");
                dut.set_status(DutStatus::Discharging);
            }
        }

        self.counter = 0;
        let start = Instant::now();
        let mut fast_loop = false;

        loop {
            let discharging = self.in_status(&active, DutStatus::Discharging);
            if discharging.is_empty() {
                break;
            }
            for slot in discharging {
                let cfg = self.phase_config(slot, TestItem::Discharge);
                self.counter += 1;
                let counter = self.counter;
                let Some(dut) = self.duts[slot].as_mut() else {
                    continue;
                };
                let Some(reading) = contain(dut, rig.read(slot).await)? else {
                    contain(dut, rig.load_off(slot).await)?;
                    continue;
                };
                let elapsed = elapsed_secs(start);
                dut.discharge_time = elapsed;
                dut.record(reading.cycle(counter, elapsed, CycleState::Discharge));

                if !fast_loop && limits::enters_fast_loop(reading.vcap, cfg.threshold, dut.family) {
                    debug!(channel = self.id, slot, vcap = reading.vcap, "fast loop engaged");
                    fast_loop = true;
                }

                let sample = DischargeSample {
                    temperature: reading.temperature,
                    vcap: reading.vcap,
                    vin: reading.vin,
                    elapsed,
                };
                let verdict = limits::evaluate_discharge(&sample, &cfg, dut.family);
                debug!(
                    channel = self.id,
                    slot,
                    vcap = reading.vcap,
                    vin = reading.vin,
                    temp = reading.temperature,
                    elapsed,
                    ?verdict,
                    "discharge sample"
                );
                match verdict {
                    DischargeVerdict::Discharging => {}
                    DischargeVerdict::Drained => {
                        if contain(dut, rig.load_off(slot).await)?.is_none() {
                            continue;
                        }
                        match contain(dut, self.hw.fixture.gtg_pin(slot).await)? {
                            Some(false) => {
                                info!(channel = self.id, slot, elapsed, "discharged");
                                dut.set_status(DutStatus::Idle);
                            }
                            Some(true) => {
                                warn!(channel = self.id, slot, "GTG pin still asserted after discharge");
                                dut.fail(DutFault::GtgPinCheck);
                            }
                            None => {}
                        }
                    }
                    DischargeVerdict::Fail(fault) => {
                        warn!(channel = self.id, slot, elapsed, vcap = reading.vcap, "discharge failed");
                        dut.fail(fault);
                        contain(dut, rig.load_off(slot).await)?;
                    }
                }
            }
            if !self.in_status(&active, DutStatus::Discharging).is_empty() {
                sleep(if fast_loop { timing.fast_poll } else { interval }).await;
            }
        }

        self.recheck_shutdown(&active).await
    }

    /// A drained DUT must go silent on the bus once it is told to shut down.
    async fn recheck_shutdown(&mut self, active: &[usize]) -> AppResult<()> {
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);
        for slot in self.in_status(active, DutStatus::Idle) {
            if !self.phase_config(slot, TestItem::Discharge).recheck {
                continue;
            }
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            dut.set_status(DutStatus::Discharging);
            if contain(dut, self.hw.fixture.shutdown_dut(slot).await)?.is_none() {
                continue;
            }
            match rig.pgem(slot).vcap().await {
                Err(e) if e.is_adapter_fault() => {
                    debug!(channel = self.id, slot, "DUT shut down");
                    dut.set_status(DutStatus::Idle);
                }
                Ok(vcap) => {
                    warn!(channel = self.id, slot, vcap, "DUT still answers after shutdown");
                    dut.fail(DutFault::ShutdownFunction);
                }
                Err(e) => {
                    contain::<()>(dut, Err(e))?;
                }
            }
        }
        Ok(())
    }
}
