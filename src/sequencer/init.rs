//! INIT: reset the fixture and build the DUT records.

use tracing::{debug, info};

use super::{contain, Channel};
use crate::dut::{Barcode, Dut, DutFault, ProductFamily};
use crate::error::{AppResult, StationError};

impl Channel {
    pub(super) async fn init(&mut self) -> AppResult<()> {
        let slots = self.duts.len();
        if self.assignments.len() > slots {
            return Err(StationError::Configuration(format!(
                "channel {}: {} slot assignments for {} slots",
                self.id,
                self.assignments.len(),
                slots
            )));
        }

        info!(channel = self.id, slots, mode4in1 = self.mode4in1, "initializing fixture");
        for slot in 0..slots {
            self.hw.fixture.load_off(slot).await?;
            self.hw.fixture.power_off(slot).await?;
            self.hw.fixture.led_off(slot).await?;
        }

        self.duts.iter_mut().for_each(|d| *d = None);
        self.test_configs.iter_mut().for_each(|c| *c = None);

        let override_checks = self.config.station.override_checks;
        for (slot, assignment) in self.assignments.iter().enumerate() {
            if assignment.is_empty() {
                continue;
            }
            let barcode: Barcode = assignment.barcode.parse()?;
            let part_number = barcode.part_number.clone();
            info!(channel = self.id, slot, %barcode, "DUT loaded");

            let requires_4in1 = self.config.requires_mode4in1(&part_number);
            if self.mode4in1 && !requires_4in1 {
                return Err(StationError::Mode4in1Unsupported(part_number));
            }
            if !self.mode4in1 && requires_4in1 && !override_checks {
                return Err(StationError::Mode4in1Required(part_number));
            }
            if self.mode4in1 {
                self.check_group_wiring(slot)?;
            }

            let family = ProductFamily::from_product_type(&barcode.product_type)?;
            let test_config = self
                .provider
                .load_config(&part_number, &barcode.revision)?;
            let latest = self.provider.latest_revision(&part_number)?;
            debug!(channel = self.id, slot, %latest, "latest revision");

            let mut dut = Dut::new(slot, barcode, family);
            dut.cable_barcode = assignment.cable_barcode.clone();
            dut.capacitor_barcode = assignment.capacitor_barcode.clone();

            let ports = if self.mode4in1 { slot..slot + 4 } else { slot..slot + 1 };
            for port in ports {
                let result = self
                    .hw
                    .fixture
                    .set_product_type(port, family.fixture_code())
                    .await;
                if contain(&mut dut, result)?.is_none() {
                    break;
                }
            }
            if !dut.is_failed() {
                info!(channel = self.id, slot, %family, code = family.fixture_code(), "product type set");
            }
            if latest != dut.barcode.revision && !override_checks {
                dut.fail(DutFault::NotLatestRevision);
            }

            self.duts[slot] = Some(dut);
            self.test_configs[slot] = Some(test_config);
        }
        Ok(())
    }

    /// A 4-in-1 module needs an aligned group whose other slots are empty.
    fn check_group_wiring(&self, slot: usize) -> AppResult<()> {
        let slots = self.duts.len();
        if slot % 4 != 0 || slot + 4 > slots {
            return Err(StationError::Configuration(format!(
                "channel {}: 4-in-1 module in slot {} is not aligned to a group of four",
                self.id, slot
            )));
        }
        let occupied = (slot + 1..slot + 4)
            .filter(|s| self.assignments.get(*s).is_some_and(|a| !a.is_empty()))
            .collect::<Vec<_>>();
        if !occupied.is_empty() {
            return Err(StationError::Configuration(format!(
                "channel {}: slots {:?} belong to the 4-in-1 group of slot {}",
                self.id, occupied, slot
            )));
        }
        Ok(())
    }
}
