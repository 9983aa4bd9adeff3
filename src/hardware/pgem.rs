//! PGEM register map and device facade.
//!
//! A [`Pgem`] borrows the channel's [`I2cBridge`], points the pass-through at
//! one slot and exposes the DUT's measurements and status registers in
//! engineering units. Every call re-selects the slot, so a facade can be built
//! freely inside polling loops.

use crate::dut::ProductFamily;
use crate::error::TransportError;
use crate::hardware::fixture::I2cBridge;
use crate::hardware::vpd::{VpdImage, CAPACITANCE_OFFSET, VPD_SIZE};

/// Register map of the PGEM controller and EEPROM.
pub mod reg {
    /// Controller I2C address
    pub const MCU_ADDR: u8 = 0x14;
    /// EEPROM I2C address on the primary port
    pub const EEPROM_ADDR: u8 = 0x53;
    /// EEPROM addresses answering on the three shared ports of a 4-in-1 group
    pub const SHARED_EEPROM_ADDRS: [u8; 3] = [0x54, 0x55, 0x56];

    pub const GTG: u16 = 0x21;
    pub const GTG_WARNING: u16 = 0x22;
    pub const PGEMSTAT: u16 = 0x23;
    pub const VCAP: u16 = 0x30;
    pub const VIN: u16 = 0x32;
    pub const TEMPERATURE: u16 = 0x34;
    pub const HW_VERSION: u16 = 0x40;
    pub const FW_VERSION: u16 = 0x41;
    pub const COMMAND: u16 = 0x50;
    pub const EXT_COMMAND: u16 = 0x51;

    pub const CMD_START_CAP: u8 = 0x01;
    pub const CMD_FLUSH_EE: u8 = 0x10;
    pub const EXT_CMD_START_CAP: u8 = 0x02;

    pub const STAT_HW_READY: u8 = 0x01;
    pub const STAT_CHARGE_COMPLETE: u8 = 0x02;
    pub const STAT_CAP_MEASURING: u8 = 0x04;

    pub const GTG_BIT: u8 = 0x02;
}

/// Decoded PGEMSTAT register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PgemStatus(pub u8);

impl PgemStatus {
    pub fn hardware_ready(self) -> bool {
        self.0 & reg::STAT_HW_READY != 0
    }

    pub fn charge_complete(self) -> bool {
        self.0 & reg::STAT_CHARGE_COMPLETE != 0
    }

    pub fn cap_measuring(self) -> bool {
        self.0 & reg::STAT_CAP_MEASURING != 0
    }
}

/// One DUT behind the I2C pass-through.
pub struct Pgem<'a> {
    bridge: &'a dyn I2cBridge,
    slot: usize,
}

impl<'a> Pgem<'a> {
    pub fn new(bridge: &'a dyn I2cBridge, slot: usize) -> Self {
        Self { bridge, slot }
    }

    async fn read(&self, device: u8, register: u16, len: usize) -> Result<Vec<u8>, TransportError> {
        self.bridge.select_port(self.slot).await?;
        let data = self.bridge.read(device, register, len).await?;
        if data.len() != len {
            return Err(TransportError::Adapter(format!(
                "short read from {:#04x}:{:#06x}",
                device, register
            )));
        }
        Ok(data)
    }

    async fn write(&self, device: u8, register: u16, data: &[u8]) -> Result<(), TransportError> {
        self.bridge.select_port(self.slot).await?;
        self.bridge.write(device, register, data).await
    }

    async fn read_u8(&self, register: u16) -> Result<u8, TransportError> {
        Ok(self.read(reg::MCU_ADDR, register, 1).await?[0])
    }

    async fn read_millivolts(&self, register: u16) -> Result<f64, TransportError> {
        let raw = self.read(reg::MCU_ADDR, register, 2).await?;
        Ok(f64::from(u16::from_be_bytes([raw[0], raw[1]])) / 1000.0)
    }

    /// Capacitor voltage (V).
    pub async fn vcap(&self) -> Result<f64, TransportError> {
        self.read_millivolts(reg::VCAP).await
    }

    /// Input voltage; while discharging this is the boost output (V).
    pub async fn vin(&self) -> Result<f64, TransportError> {
        self.read_millivolts(reg::VIN).await
    }

    /// Board temperature (degC).
    pub async fn temperature(&self) -> Result<f64, TransportError> {
        let raw = self.read_u8(reg::TEMPERATURE).await?;
        Ok(f64::from(raw as i8))
    }

    pub async fn status(&self) -> Result<PgemStatus, TransportError> {
        self.read_u8(reg::PGEMSTAT).await.map(PgemStatus)
    }

    pub async fn hardware_ready(&self) -> Result<bool, TransportError> {
        Ok(self.status().await?.hardware_ready())
    }

    /// GTG register, bit1 set when healthy.
    pub async fn gtg(&self) -> Result<u8, TransportError> {
        self.read_u8(reg::GTG).await
    }

    pub async fn gtg_warning(&self) -> Result<u8, TransportError> {
        self.read_u8(reg::GTG_WARNING).await
    }

    /// Trigger the on-device capacitance measurement.
    pub async fn start_cap_measure(&self, family: ProductFamily) -> Result<(), TransportError> {
        if family.uses_extended_cap_start() {
            self.write(reg::MCU_ADDR, reg::EXT_COMMAND, &[reg::EXT_CMD_START_CAP])
                .await
        } else {
            self.write(reg::MCU_ADDR, reg::COMMAND, &[reg::CMD_START_CAP])
                .await
        }
    }

    /// Commit the EEPROM write buffer without a power cycle.
    pub async fn flush_ee(&self) -> Result<(), TransportError> {
        self.write(reg::MCU_ADDR, reg::COMMAND, &[reg::CMD_FLUSH_EE])
            .await
    }

    pub async fn hw_version(&self) -> Result<u8, TransportError> {
        self.read_u8(reg::HW_VERSION).await
    }

    /// Firmware version as `major.minor`.
    pub async fn fw_version(&self) -> Result<String, TransportError> {
        let raw = self.read(reg::MCU_ADDR, reg::FW_VERSION, 2).await?;
        Ok(format!("{}.{}", raw[0], raw[1]))
    }

    pub async fn write_vpd(&self, image: &VpdImage) -> Result<(), TransportError> {
        self.write(reg::EEPROM_ADDR, 0, image.as_bytes()).await
    }

    pub async fn read_vpd(&self) -> Result<VpdImage, TransportError> {
        let bytes = self.read(reg::EEPROM_ADDR, 0, VPD_SIZE).await?;
        VpdImage::from_bytes(bytes).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    /// Write the image on a shared port, trying each shared EEPROM address.
    ///
    /// Returns the address that acknowledged, or `None` when none did.
    pub async fn write_shared_vpd(&self, image: &VpdImage) -> Result<Option<u8>, TransportError> {
        for addr in reg::SHARED_EEPROM_ADDRS {
            match self.write(addr, 0, image.as_bytes()).await {
                Ok(()) => return Ok(Some(addr)),
                Err(e) if e.is_adapter_fault() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Capacitance result stored by the DUT after a measurement.
    pub async fn capacitance(&self) -> Result<f64, TransportError> {
        let raw = self.read(reg::EEPROM_ADDR, CAPACITANCE_OFFSET, 1).await?;
        Ok(f64::from(raw[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_bits() {
        let stat = PgemStatus(0b011);
        assert!(stat.hardware_ready());
        assert!(stat.charge_complete());
        assert!(!stat.cap_measuring());
        assert!(PgemStatus(0b100).cap_measuring());
    }
}
