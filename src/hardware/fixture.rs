//! Fixture controller driver
//!
//! The fixture controller is the board that fans out power, load, LED control,
//! pin sensing and an I2C pass-through to every slot of one channel.
//!
//! Protocol Overview:
//! - One request, one reply; the link never has more than one request in flight
//! - Request: command id, physical port, payload bytes
//! - Reply: echoed command id, status byte (0 = OK), payload bytes
//! - Physical port = logical slot + group * 4
//! - I2C pass-through moves one byte per command; `[device, reg_hi, reg_lo]`
//!   for reads and `[device, reg_hi, reg_lo, value]` for writes
//!
//! How bytes travel on the wire is the business of the [`CommandLink`]
//! implementation; the driver only speaks in [`Request`]/[`Reply`] pairs.
//!
//! # Example Usage
//!
//! ```no_run
//! use uft_station::hardware::fixture::{FixtureController, FixtureTransport};
//! use uft_station::hardware::sim::SimulatedFixture;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let controller = FixtureController::connect(SimulatedFixture::new(), 1, 0).await?;
//!     controller.power_on(0).await?;
//!     assert!(controller.is_power_on(0).await?);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::TransportError;

/// Firmware version the driver is written against.
pub const SUPPORTED_FIRMWARE: (u8, u8) = (1, 0);

/// Command ids understood by the fixture controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FixtureCommand {
    I2cRead,
    I2cWrite,
    PresentPin,
    GtgPin,
    OutputOn,
    OutputOff,
    OutputStatus,
    LedOn,
    LedOff,
    LoadOn,
    LoadOff,
    Version,
    ProductType,
    ResetDut,
    ShutdownDut,
    LoadCurrent,
}

impl FixtureCommand {
    /// Wire code of the command.
    pub fn code(self) -> u8 {
        match self {
            FixtureCommand::I2cRead => 0x01,
            FixtureCommand::I2cWrite => 0x02,
            FixtureCommand::PresentPin => 0x03,
            FixtureCommand::GtgPin => 0x04,
            FixtureCommand::OutputOn => 0x05,
            FixtureCommand::OutputOff => 0x06,
            FixtureCommand::OutputStatus => 0x07,
            FixtureCommand::LedOn => 0x08,
            FixtureCommand::LedOff => 0x09,
            FixtureCommand::LoadOn => 0x0A,
            FixtureCommand::LoadOff => 0x0B,
            FixtureCommand::Version => 0x0C,
            FixtureCommand::ProductType => 0x0D,
            FixtureCommand::ResetDut => 0x0E,
            FixtureCommand::ShutdownDut => 0x0F,
            FixtureCommand::LoadCurrent => 0x10,
        }
    }

    /// Decode a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        let cmd = match code {
            0x01 => FixtureCommand::I2cRead,
            0x02 => FixtureCommand::I2cWrite,
            0x03 => FixtureCommand::PresentPin,
            0x04 => FixtureCommand::GtgPin,
            0x05 => FixtureCommand::OutputOn,
            0x06 => FixtureCommand::OutputOff,
            0x07 => FixtureCommand::OutputStatus,
            0x08 => FixtureCommand::LedOn,
            0x09 => FixtureCommand::LedOff,
            0x0A => FixtureCommand::LoadOn,
            0x0B => FixtureCommand::LoadOff,
            0x0C => FixtureCommand::Version,
            0x0D => FixtureCommand::ProductType,
            0x0E => FixtureCommand::ResetDut,
            0x0F => FixtureCommand::ShutdownDut,
            0x10 => FixtureCommand::LoadCurrent,
            _ => return None,
        };
        Some(cmd)
    }

    /// Commands that tunnel to the DUT; their failures are adapter faults.
    pub fn is_i2c(self) -> bool {
        matches!(self, FixtureCommand::I2cRead | FixtureCommand::I2cWrite)
    }
}

/// A command addressed to one physical port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: FixtureCommand,
    pub port: u8,
    pub payload: Vec<u8>,
}

/// The controller's answer to a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Echo of the request's command code
    pub command: u8,
    /// 0 on success
    pub status: u8,
    pub data: Vec<u8>,
}

impl Reply {
    /// Successful reply carrying `data`.
    pub fn ok(command: FixtureCommand, data: Vec<u8>) -> Self {
        Self {
            command: command.code(),
            status: 0,
            data,
        }
    }

    /// Rejected reply.
    pub fn nack(command: FixtureCommand, status: u8) -> Self {
        Self {
            command: command.code(),
            status,
            data: Vec::new(),
        }
    }
}

/// Request/reply transport to a fixture controller.
#[async_trait]
pub trait CommandLink: Send {
    /// Send one request and wait for its reply.
    async fn transact(&mut self, request: &Request) -> Result<Reply, TransportError>;
}

/// Electronic load range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadMode {
    Low,
    High,
}

impl LoadMode {
    /// Upper end of the low range (A).
    pub const LOW_RANGE_MAX: f64 = 1.0;

    /// Range able to sink `amps`.
    pub fn for_current(amps: f64) -> Self {
        if amps <= Self::LOW_RANGE_MAX {
            LoadMode::Low
        } else {
            LoadMode::High
        }
    }
}

/// Per-slot electrical operations of the fixture.
#[async_trait]
pub trait FixtureTransport: Send + Sync {
    /// Program the slot's product-type profile.
    async fn set_product_type(&self, slot: usize, code: u8) -> Result<(), TransportError>;
    /// Set the discharge current of the slot's load (A).
    async fn set_load_current(&self, slot: usize, amps: f64) -> Result<(), TransportError>;
    async fn load_on(&self, slot: usize, mode: LoadMode) -> Result<(), TransportError>;
    async fn load_off(&self, slot: usize) -> Result<(), TransportError>;
    async fn power_on(&self, slot: usize) -> Result<(), TransportError>;
    async fn power_off(&self, slot: usize) -> Result<(), TransportError>;
    async fn is_power_on(&self, slot: usize) -> Result<bool, TransportError>;
    async fn led_on(&self, slot: usize) -> Result<(), TransportError>;
    async fn led_off(&self, slot: usize) -> Result<(), TransportError>;
    /// Whether a module is seated in the slot.
    async fn present(&self, slot: usize) -> Result<bool, TransportError>;
    /// Level of the slot's GTG pin.
    async fn gtg_pin(&self, slot: usize) -> Result<bool, TransportError>;
    async fn reset_dut(&self, slot: usize) -> Result<(), TransportError>;
    async fn shutdown_dut(&self, slot: usize) -> Result<(), TransportError>;
}

/// Register access to the DUT through the fixture's pass-through port selector.
#[async_trait]
pub trait I2cBridge: Send + Sync {
    /// Route subsequent transfers to the slot's connector.
    async fn select_port(&self, slot: usize) -> Result<(), TransportError>;
    /// Read `len` bytes starting at `register` of `device`.
    async fn read(&self, device: u8, register: u16, len: usize) -> Result<Vec<u8>, TransportError>;
    /// Write `data` starting at `register` of `device`.
    async fn write(&self, device: u8, register: u16, data: &[u8]) -> Result<(), TransportError>;
}

/// Driver for one fixture controller.
///
/// Implements both [`FixtureTransport`] and [`I2cBridge`]; share it behind an
/// `Arc` to hand both views to a channel.
pub struct FixtureController<L: CommandLink> {
    /// Link protected by Mutex for exclusive access during transactions
    link: Mutex<L>,
    board_id: u8,
    group: u8,
    /// Slot the I2C pass-through currently points at
    selected: AtomicUsize,
    firmware: (u8, u8),
}

impl<L: CommandLink> FixtureController<L> {
    /// Open a controller and verify its firmware version.
    ///
    /// # Errors
    /// Returns a protocol error when the firmware is not [`SUPPORTED_FIRMWARE`].
    pub async fn connect(mut link: L, board_id: u8, group: u8) -> Result<Self, TransportError> {
        let request = Request {
            command: FixtureCommand::Version,
            port: 0,
            payload: Vec::new(),
        };
        let reply = link.transact(&request).await?;
        let data = check_reply(&request, reply)?;
        let firmware = match data.as_slice() {
            [major, minor, ..] => (*major, *minor),
            _ => {
                return Err(TransportError::Protocol(
                    "version reply too short".to_string(),
                ))
            }
        };
        if firmware != SUPPORTED_FIRMWARE {
            return Err(TransportError::Protocol(format!(
                "Wrong fixture firmware version: {}.{}",
                firmware.0, firmware.1
            )));
        }
        debug!(board_id, group, "fixture controller firmware {}.{}", firmware.0, firmware.1);

        Ok(Self {
            link: Mutex::new(link),
            board_id,
            group,
            selected: AtomicUsize::new(0),
            firmware,
        })
    }

    pub fn board_id(&self) -> u8 {
        self.board_id
    }

    pub fn firmware(&self) -> (u8, u8) {
        self.firmware
    }

    fn port(&self, slot: usize) -> Result<u8, TransportError> {
        u8::try_from(slot + usize::from(self.group) * 4)
            .map_err(|_| TransportError::Protocol(format!("slot {} out of range", slot)))
    }

    /// Send one command and return the reply payload.
    async fn execute(
        &self,
        command: FixtureCommand,
        slot: usize,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>, TransportError> {
        let request = Request {
            command,
            port: self.port(slot)?,
            payload,
        };
        trace!(board = self.board_id, ?command, port = request.port, payload = ?request.payload, "fixture request");
        let reply = {
            let mut link = self.link.lock().await;
            link.transact(&request).await?
        };
        trace!(board = self.board_id, ?command, status = reply.status, data = ?reply.data, "fixture reply");
        check_reply(&request, reply)
    }

    async fn flag(&self, command: FixtureCommand, slot: usize) -> Result<u8, TransportError> {
        let data = self.execute(command, slot, Vec::new()).await?;
        data.first().copied().ok_or_else(|| {
            TransportError::Protocol(format!("{:?} reply carries no data", command))
        })
    }

    fn selected_slot(&self) -> usize {
        self.selected.load(Ordering::Relaxed)
    }
}

fn check_reply(request: &Request, reply: Reply) -> Result<Vec<u8>, TransportError> {
    let command = request.command;
    if command.is_i2c() {
        if reply.command != command.code() || reply.status != 0 {
            return Err(TransportError::Adapter(format!(
                "{:?} on port {} failed (status {:#04x})",
                command, request.port, reply.status
            )));
        }
    } else {
        if reply.command != command.code() {
            return Err(TransportError::Protocol(format!(
                "{:?} answered with command {:#04x}",
                command, reply.command
            )));
        }
        if reply.status != 0 {
            return Err(TransportError::Communication(format!(
                "{:?} on port {} rejected (status {:#04x})",
                command, request.port, reply.status
            )));
        }
    }
    Ok(reply.data)
}

fn register_bytes(register: u16) -> [u8; 2] {
    register.to_be_bytes()
}

#[async_trait]
impl<L: CommandLink + 'static> FixtureTransport for FixtureController<L> {
    async fn set_product_type(&self, slot: usize, code: u8) -> Result<(), TransportError> {
        self.execute(FixtureCommand::ProductType, slot, vec![code])
            .await
            .map(|_| ())
    }

    async fn set_load_current(&self, slot: usize, amps: f64) -> Result<(), TransportError> {
        if !(0.0..=65.535).contains(&amps) {
            return Err(TransportError::Protocol(format!(
                "load current {} A out of range",
                amps
            )));
        }
        let milliamps = (amps * 1000.0).round() as u16;
        self.execute(
            FixtureCommand::LoadCurrent,
            slot,
            milliamps.to_be_bytes().to_vec(),
        )
        .await
        .map(|_| ())
    }

    async fn load_on(&self, slot: usize, mode: LoadMode) -> Result<(), TransportError> {
        let mode = match mode {
            LoadMode::Low => 0x00,
            LoadMode::High => 0x01,
        };
        self.execute(FixtureCommand::LoadOn, slot, vec![mode])
            .await
            .map(|_| ())
    }

    async fn load_off(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::LoadOff, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn power_on(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::OutputOn, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn power_off(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::OutputOff, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn is_power_on(&self, slot: usize) -> Result<bool, TransportError> {
        Ok(self.flag(FixtureCommand::OutputStatus, slot).await? != 0)
    }

    async fn led_on(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::LedOn, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn led_off(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::LedOff, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn present(&self, slot: usize) -> Result<bool, TransportError> {
        // Present pin is active low.
        Ok(self.flag(FixtureCommand::PresentPin, slot).await? == 0)
    }

    async fn gtg_pin(&self, slot: usize) -> Result<bool, TransportError> {
        Ok(self.flag(FixtureCommand::GtgPin, slot).await? == 1)
    }

    async fn reset_dut(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::ResetDut, slot, Vec::new())
            .await
            .map(|_| ())
    }

    async fn shutdown_dut(&self, slot: usize) -> Result<(), TransportError> {
        self.execute(FixtureCommand::ShutdownDut, slot, Vec::new())
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl<L: CommandLink + 'static> I2cBridge for FixtureController<L> {
    async fn select_port(&self, slot: usize) -> Result<(), TransportError> {
        self.port(slot)?;
        self.selected.store(slot, Ordering::Relaxed);
        Ok(())
    }

    async fn read(&self, device: u8, register: u16, len: usize) -> Result<Vec<u8>, TransportError> {
        let slot = self.selected_slot();
        let mut out = Vec::with_capacity(len);
        for offset in 0..len {
            let reg = register_bytes(register.wrapping_add(offset as u16));
            let data = self
                .execute(FixtureCommand::I2cRead, slot, vec![device, reg[0], reg[1]])
                .await?;
            let byte = data.first().copied().ok_or_else(|| {
                TransportError::Adapter(format!("empty read from device {:#04x}", device))
            })?;
            out.push(byte);
        }
        Ok(out)
    }

    async fn write(&self, device: u8, register: u16, data: &[u8]) -> Result<(), TransportError> {
        let slot = self.selected_slot();
        for (offset, value) in data.iter().enumerate() {
            let reg = register_bytes(register.wrapping_add(offset as u16));
            self.execute(
                FixtureCommand::I2cWrite,
                slot,
                vec![device, reg[0], reg[1], *value],
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Link that replays canned replies and records requests.
    struct ScriptedLink {
        replies: VecDeque<Reply>,
        requests: Vec<Request>,
    }

    impl ScriptedLink {
        fn new(replies: Vec<Reply>) -> Self {
            let mut all = vec![Reply::ok(FixtureCommand::Version, vec![1, 0])];
            all.extend(replies);
            Self {
                replies: all.into(),
                requests: Vec::new(),
            }
        }
    }

    #[async_trait]
    impl CommandLink for ScriptedLink {
        async fn transact(&mut self, request: &Request) -> Result<Reply, TransportError> {
            self.requests.push(request.clone());
            self.replies
                .pop_front()
                .ok_or_else(|| TransportError::Communication("no reply".into()))
        }
    }

    #[test]
    fn test_load_range_selection() {
        assert_eq!(LoadMode::for_current(0.5), LoadMode::Low);
        assert_eq!(LoadMode::for_current(1.0), LoadMode::Low);
        assert_eq!(LoadMode::for_current(2.5), LoadMode::High);
    }

    #[test]
    fn test_command_codes_round_trip() {
        for code in 0x01..=0x10 {
            let cmd = FixtureCommand::from_code(code).unwrap();
            assert_eq!(cmd.code(), code);
        }
        assert!(FixtureCommand::from_code(0x11).is_none());
    }

    #[tokio::test]
    async fn test_rejects_wrong_firmware() {
        let mut link = ScriptedLink::new(vec![]);
        link.replies[0] = Reply::ok(FixtureCommand::Version, vec![2, 3]);
        let err = FixtureController::connect(link, 1, 0).await.err().unwrap();
        assert_eq!(
            err,
            TransportError::Protocol("Wrong fixture firmware version: 2.3".into())
        );
    }

    #[tokio::test]
    async fn test_present_pin_is_active_low() {
        let link = ScriptedLink::new(vec![
            Reply::ok(FixtureCommand::PresentPin, vec![0]),
            Reply::ok(FixtureCommand::PresentPin, vec![1]),
        ]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        assert!(fixture.present(0).await.unwrap());
        assert!(!fixture.present(0).await.unwrap());
    }

    #[tokio::test]
    async fn test_group_offsets_port() {
        let link = ScriptedLink::new(vec![Reply::ok(FixtureCommand::OutputOn, vec![])]);
        let fixture = FixtureController::connect(link, 2, 1).await.unwrap();
        fixture.power_on(2).await.unwrap();
        let link = fixture.link.lock().await;
        assert_eq!(link.requests[1].port, 6);
        assert_eq!(link.requests[1].command, FixtureCommand::OutputOn);
    }

    #[tokio::test]
    async fn test_i2c_nack_is_adapter_fault() {
        let link = ScriptedLink::new(vec![Reply::nack(FixtureCommand::I2cRead, 0x01)]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        let err = fixture.read(0x14, 0x23, 1).await.unwrap_err();
        assert!(err.is_adapter_fault());
    }

    #[tokio::test]
    async fn test_command_nack_is_communication_fault() {
        let link = ScriptedLink::new(vec![Reply::nack(FixtureCommand::LedOn, 0x02)]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        let err = fixture.led_on(0).await.unwrap_err();
        assert!(matches!(err, TransportError::Communication(_)));
    }

    #[tokio::test]
    async fn test_echo_mismatch_is_protocol_error() {
        let link = ScriptedLink::new(vec![Reply::ok(FixtureCommand::LedOff, vec![])]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        let err = fixture.led_on(0).await.unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_multi_byte_read_walks_registers() {
        let link = ScriptedLink::new(vec![
            Reply::ok(FixtureCommand::I2cRead, vec![0x12]),
            Reply::ok(FixtureCommand::I2cRead, vec![0x34]),
        ]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        fixture.select_port(3).await.unwrap();
        let data = fixture.read(0x53, 0x00FF, 2).await.unwrap();
        assert_eq!(data, vec![0x12, 0x34]);
        let link = fixture.link.lock().await;
        assert_eq!(link.requests[1].payload, vec![0x53, 0x00, 0xFF]);
        assert_eq!(link.requests[2].payload, vec![0x53, 0x01, 0x00]);
        assert_eq!(link.requests[2].port, 3);
    }

    #[tokio::test]
    async fn test_load_current_encoding() {
        let link = ScriptedLink::new(vec![Reply::ok(FixtureCommand::LoadCurrent, vec![])]);
        let fixture = FixtureController::connect(link, 1, 0).await.unwrap();
        fixture.set_load_current(1, 2.0).await.unwrap();
        let link = fixture.link.lock().await;
        assert_eq!(link.requests[1].payload, 2000u16.to_be_bytes().to_vec());
    }
}
