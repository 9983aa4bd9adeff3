//! PROGRAM_VPD: write the identity image into every DUT that asks for it.
//!
//! Steps, each over the DUTs still `Idle` (or `ProgramVpd` after step 4):
//!
//! 1. present pin on every covered port
//! 2. supply on, then settle
//! 3. hardware ready and input voltage (per shared port in 4-in-1 mode)
//! 4. write, read back and commit the image
//! 5. supply back on where the commit switched it off
//! 6. hardware ready, then reset the module
//!
//! Every transport fault here stays on the DUT, including those that would be
//! channel-fatal in the other phases.
//!
//! Without stop-on-fail the presence check still visits failed DUTs; every
//! later step only touches DUTs that are still `Idle` or being programmed.

use std::collections::BTreeSet;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::{limits, Channel, Rig};
use crate::dut::{Dut, DutFault, DutStatus};
use crate::error::{AppResult, StationError, TransportError};
use crate::hardware::pgem::reg;
use crate::hardware::vpd::VpdImage;
use crate::test_config::TestItem;

/// Record a transport fault of one PROGRAM_VPD step on the DUT.
///
/// Adapter faults read as `IicAccessFailed`, anything else as `step`.
fn contain_step<T>(
    dut: &mut Dut,
    result: Result<T, TransportError>,
    step: DutFault,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(slot = dut.slot, error = %e, fault = %step, "programming step failed");
            if e.is_adapter_fault() {
                dut.fail(DutFault::IicAccessFailed);
            } else {
                dut.fail(step);
            }
            None
        }
    }
}

impl Channel {
    pub(super) async fn program_vpd(&mut self) -> AppResult<()> {
        let active = self.gated(TestItem::ProgramVpd, DutStatus::Idle);
        if active.is_empty() {
            debug!(channel = self.id, "no DUT needs VPD programming");
            return Ok(());
        }
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);
        let timing = &self.config.timing;

        for &slot in &active {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            for port in rig.ports(slot) {
                let present = self.hw.fixture.present(port).await;
                match contain_step(dut, present, DutFault::ConnectionIssue) {
                    Some(true) => {}
                    Some(false) => {
                        warn!(channel = self.id, slot, port, "module not seated");
                        dut.fail(DutFault::ConnectionIssue);
                        break;
                    }
                    None => break,
                }
            }
        }

        let mut powered = 0;
        for slot in self.in_status(&active, DutStatus::Idle) {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            let result = self.hw.fixture.power_on(slot).await;
            if contain_step(dut, result, DutFault::ConnectionIssue).is_some() {
                powered += 1;
            }
            sleep(timing.power_on_spacing).await;
        }
        if powered > 0 {
            sleep(timing.power_settle).await;
        }

        for slot in self.in_status(&active, DutStatus::Idle) {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            match contain_step(dut, rig.hardware_ready(slot).await, DutFault::NotReady) {
                Some(true) => {}
                Some(false) => {
                    dut.fail(DutFault::NotReady);
                    continue;
                }
                None => continue,
            }

            let pgem = rig.pgem(slot);
            let Some(vin) = contain_step(dut, pgem.vin().await, DutFault::VinError) else {
                continue;
            };
            debug!(channel = self.id, slot, vin, "input voltage");
            if !limits::vin_in_range(vin) {
                dut.fail(DutFault::VinError);
                continue;
            }

            if self.mode4in1 {
                // walk the supply across the shared ports, one at a time
                for port in rig.shared_ports(slot) {
                    let result = self.hw.fixture.power_on(port).await;
                    if contain_step(dut, result, DutFault::ConnectionIssue).is_none() {
                        break;
                    }
                    sleep(timing.port_switch).await;
                    let result = self.hw.fixture.power_off(port - 1).await;
                    if contain_step(dut, result, DutFault::ConnectionIssue).is_none() {
                        break;
                    }
                    sleep(timing.shared_port_settle).await;
                    let Some(vin) = contain_step(dut, pgem.vin().await, DutFault::VinError) else {
                        break;
                    };
                    debug!(channel = self.id, slot, port, vin, "shared port input voltage");
                    if !limits::vin_in_range(vin) {
                        dut.fail(DutFault::VinError);
                        break;
                    }
                    sleep(timing.shared_port_settle).await;
                }
                if !dut.is_failed() {
                    contain_step(dut, rig.power_on(slot).await, DutFault::ConnectionIssue);
                }
            }
        }

        for slot in self.in_status(&active, DutStatus::Idle) {
            let cfg = self.phase_config(slot, TestItem::ProgramVpd);
            let Some(path) = cfg.vpd_file.as_ref() else {
                return Err(StationError::Configuration(format!(
                    "channel {}: Program_VPD is enabled but no VPD file is configured",
                    self.id
                )));
            };
            let mut image = VpdImage::load(path)?;
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            image.stamp_serial(&dut.barcode.raw);
            dut.set_status(DutStatus::ProgramVpd);
            info!(channel = self.id, slot, file = %path.display(), "programming VPD");

            let pgem = rig.pgem(slot);
            let written = pgem.write_vpd(&image).await;
            if contain_step(dut, written, DutFault::ProgrammingVpd).is_none() {
                continue;
            }
            let readback = pgem.read_vpd().await;
            let Some(readback) = contain_step(dut, readback, DutFault::ProgrammingVpd) else {
                continue;
            };
            if readback != image {
                warn!(channel = self.id, slot, "VPD read-back mismatch");
                dut.fail(DutFault::ProgrammingVpd);
                continue;
            }

            if self.mode4in1 {
                let mut acked = BTreeSet::new();
                for port in rig.shared_ports(slot) {
                    match contain_step(
                        dut,
                        rig.pgem(port).write_shared_vpd(&image).await,
                        DutFault::IicAccessFailed,
                    ) {
                        Some(Some(addr)) => {
                            debug!(channel = self.id, slot, port, addr, "shared VPD written");
                            acked.insert(addr);
                        }
                        Some(None) => {}
                        None => break,
                    }
                }
                if reg::SHARED_EEPROM_ADDRS.iter().any(|a| !acked.contains(a)) {
                    warn!(channel = self.id, slot, ?acked, "shared EEPROM missing");
                    dut.fail(DutFault::IicAccessFailed);
                    continue;
                }
            }
            dut.vpd_programmed = true;

            if cfg.flush_ee {
                contain_step(dut, pgem.flush_ee().await, DutFault::ProgrammingVpd);
            } else {
                let result = rig.power_off(slot).await;
                if contain_step(dut, result, DutFault::ProgrammingVpd).is_some() {
                    sleep(timing.vpd_commit).await;
                }
            }
        }

        let programmed = self.in_status(&active, DutStatus::ProgramVpd);
        let mut powered = 0;
        for &slot in &programmed {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            let output = rig.output_on(slot).await;
            if contain_step(dut, output, DutFault::ConnectionIssue) != Some(false) {
                continue;
            }
            let result = rig.power_on(slot).await;
            if contain_step(dut, result, DutFault::ConnectionIssue).is_some() {
                powered += 1;
            }
        }
        if powered > 0 {
            sleep(timing.power_settle).await;
        }

        for &slot in &programmed {
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            match contain_step(dut, rig.hardware_ready(slot).await, DutFault::NotReady) {
                Some(true) => {
                    let reset = self.hw.fixture.reset_dut(slot).await;
                    if contain_step(dut, reset, DutFault::NotReady).is_some() {
                        dut.set_status(DutStatus::Idle);
                        info!(channel = self.id, slot, "VPD programmed");
                    }
                }
                Some(false) => dut.fail(DutFault::NotReady),
                None => {}
            }
        }
        Ok(())
    }
}
