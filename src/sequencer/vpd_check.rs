//! CHECK_VPD and CHECK_TEMP.

use tracing::{debug, info, warn};

use super::{contain, Channel, Rig};
use crate::dut::{DutFault, DutStatus};
use crate::error::AppResult;
use crate::test_config::TestItem;

/// Hardware version reported by an unprogrammed controller.
const HW_VERSION_BLANK: u8 = 0xFF;

impl Channel {
    /// Read the identity image back and check the versions it declares.
    pub(super) async fn check_vpd(&mut self) -> AppResult<()> {
        let gated = self.gated(TestItem::ProgramVpd, DutStatus::Idle);
        let active = self.in_status(&gated, DutStatus::Idle);
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);

        for slot in active {
            let cfg = self.phase_config(slot, TestItem::ProgramVpd);
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            match contain(dut, rig.output_on(slot).await)? {
                Some(true) => {}
                Some(false) => {
                    dut.fail(DutFault::NoPowerOutputVpd);
                    continue;
                }
                None => continue,
            }

            let pgem = rig.pgem(slot);
            let Some(image) = contain(dut, pgem.read_vpd().await)? else {
                continue;
            };
            if !image.is_valid() || image.serial() != dut.barcode.raw {
                warn!(channel = self.id, slot, serial = %image.serial(), "VPD content invalid");
                dut.fail(DutFault::CheckingVpd);
                continue;
            }

            let Some(hw) = contain(dut, pgem.hw_version().await)? else {
                continue;
            };
            dut.hw_version = Some(hw.to_string());
            if hw == HW_VERSION_BLANK {
                dut.fail(DutFault::HwVersion);
                continue;
            }

            let Some(fw) = contain(dut, pgem.fw_version().await)? else {
                continue;
            };
            dut.fw_version = Some(fw.clone());
            if let Some(expected) = cfg.fw_version.as_deref() {
                if expected != fw {
                    warn!(channel = self.id, slot, %fw, expected, "unexpected firmware");
                    dut.fail(DutFault::FwVersion);
                    continue;
                }
            }
            info!(channel = self.id, slot, hw, %fw, "VPD verified");
        }
        Ok(())
    }

    /// Single temperature reading against the item's limits.
    pub(super) async fn check_temperature(&mut self) -> AppResult<()> {
        let gated = self.gated(TestItem::CheckTemp, DutStatus::Idle);
        let active = self.in_status(&gated, DutStatus::Idle);
        let rig = Rig::new(&self.hw, &self.config.timing, self.mode4in1);

        for slot in active {
            let cfg = self.phase_config(slot, TestItem::CheckTemp);
            let Some(dut) = self.duts[slot].as_mut() else {
                continue;
            };
            let Some(temperature) = contain(dut, rig.pgem(slot).temperature().await)? else {
                continue;
            };
            debug!(channel = self.id, slot, temperature, "temperature");
            if !cfg.within_limits(temperature) {
                dut.fail(DutFault::TemperatureOutOfRange);
            }
        }
        Ok(())
    }
}
