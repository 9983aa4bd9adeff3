//! Simulated fixture controller
//!
//! Provides a fixture controller plus PGEM modules for running the sequencer
//! without hardware. The simulation implements [`CommandLink`], so it sits
//! below the real [`FixtureController`](super::fixture::FixtureController)
//! driver and exercises the full command path.
//!
//! Electrical state is advanced lazily from `tokio::time::Instant`, which makes
//! the simulation deterministic under `#[tokio::test(start_paused = true)]`.
//!
//! # Model
//!
//! - Capacitor charges linearly while any covered port is powered and drains
//!   linearly while a load is armed and no port is powered
//! - The controller answers I2C while powered or while the capacitor is above
//!   the boost cut-off, unless it was shut down
//! - The GTG pin follows the capacitor voltage
//! - A capacitance measurement takes a fixed time and stores its result in the
//!   EEPROM at `0x100`
//!
//! # Example
//!
//! ```rust,ignore
//! let sim = SimulatedFixture::new();
//! sim.insert(0, DutProfile::default());
//! let controller = FixtureController::connect(sim.clone(), 1, 0).await?;
//! ```

use async_trait::async_trait;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::TransportError;
use crate::hardware::fixture::{CommandLink, FixtureCommand, Reply, Request, SUPPORTED_FIRMWARE};
use crate::hardware::pgem::reg;
use crate::hardware::vpd::CAPACITANCE_OFFSET;

/// Number of physical ports on a simulated board (two groups of four).
pub const SIM_PORTS: usize = 8;

const EEPROM_SIZE: usize = 0x200;
const STATUS_NACK: u8 = 0x01;

/// Electrical and firmware behaviour of one simulated module.
#[derive(Debug, Clone)]
pub struct DutProfile {
    /// Capacitor voltage at which charging stops (V)
    pub full_voltage: f64,
    /// Charge slope (V/s)
    pub charge_rate: f64,
    /// Discharge slope with the load armed (V/s)
    pub discharge_rate: f64,
    /// Capacitor voltage when the module is inserted (V)
    pub initial_vcap: f64,
    /// Input voltage reported while powered (V)
    pub supply_voltage: f64,
    /// Boost output while running from the capacitor (V)
    pub boost_voltage: f64,
    /// Capacitor voltage below which the module browns out (V)
    pub boost_cutoff: f64,
    /// Above the boost voltage the input follows the capacitor
    pub bypass_ok: bool,
    /// Temperature (degC)
    pub temperature: f64,
    /// Temperature changes, in seconds since the module was first powered
    pub temperature_steps: Vec<(f64, f64)>,
    /// PGEMSTAT hardware-ready bit
    pub ready: bool,
    pub present: bool,
    /// GTG register bit1
    pub gtg_bit: bool,
    pub gtg_warning: u8,
    /// Drive the GTG pin at all
    pub gtg_pin: bool,
    /// Capacitor voltage above which the GTG pin is asserted (V)
    pub gtg_level: f64,
    /// Value stored at EEPROM `0x100` after a capacitance measurement
    pub capacitance: u8,
    pub cap_measure_time: Duration,
    pub hw_version: u8,
    pub fw_version: (u8, u8),
    /// The controller powers down on the shutdown command
    pub honours_shutdown: bool,
    /// I2C never acknowledges
    pub i2c_fault: bool,
    /// Peak-to-peak noise added to voltage readings (V)
    pub noise: f64,
}

impl Default for DutProfile {
    fn default() -> Self {
        Self {
            full_voltage: 4.8,
            charge_rate: 0.1,
            discharge_rate: 0.5,
            initial_vcap: 0.0,
            supply_voltage: 12.0,
            boost_voltage: 5.0,
            boost_cutoff: 1.0,
            bypass_ok: true,
            temperature: 25.0,
            temperature_steps: Vec::new(),
            ready: true,
            present: true,
            gtg_bit: true,
            gtg_warning: 0,
            gtg_pin: true,
            gtg_level: 4.0,
            capacitance: 30,
            cap_measure_time: Duration::from_secs(20),
            hw_version: 1,
            fw_version: (1, 2),
            honours_shutdown: true,
            i2c_fault: false,
            noise: 0.0,
        }
    }
}

#[derive(Debug, Default, Clone)]
struct SimPort {
    power: bool,
    load: bool,
    load_current_ma: u16,
    led: bool,
    product_type: Option<u8>,
    /// Module wired to this port
    dut: Option<usize>,
    /// EEPROM address answering on this port when it is a shared port
    shared_addr: Option<u8>,
}

#[derive(Debug)]
struct SimDut {
    profile: DutProfile,
    /// Physical ports, primary first
    ports: Vec<usize>,
    vcap: f64,
    last_update: Instant,
    first_powered: Option<Instant>,
    shut_down: bool,
    cap_started: Option<Instant>,
    eeproms: HashMap<u8, Vec<u8>>,
    mcu_writes: Vec<(u16, u8)>,
}

impl SimDut {
    fn alive(&self, powered: bool) -> bool {
        !self.shut_down
            && !self.profile.i2c_fault
            && (powered || self.vcap >= self.profile.boost_cutoff)
    }

    fn temperature(&self, now: Instant) -> f64 {
        let since = self
            .first_powered
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.profile
            .temperature_steps
            .iter()
            .filter(|(from, _)| *from <= since)
            .last()
            .map(|(_, t)| *t)
            .unwrap_or(self.profile.temperature)
    }
}

#[derive(Debug)]
struct SimBoard {
    firmware: (u8, u8),
    offline: bool,
    /// Commands the controller rejects on one port
    rejected: HashSet<(usize, FixtureCommand)>,
    ports: Vec<SimPort>,
    duts: Vec<SimDut>,
    log: Vec<(FixtureCommand, u8)>,
}

impl SimBoard {
    fn powered(&self, dut: usize) -> bool {
        self.duts[dut].ports.iter().any(|p| self.ports[*p].power)
    }

    fn loaded(&self, dut: usize) -> bool {
        self.duts[dut].ports.iter().any(|p| self.ports[*p].load)
    }

    /// Bring every module's state up to `now`.
    fn advance(&mut self, now: Instant) {
        for idx in 0..self.duts.len() {
            let powered = self.powered(idx);
            let loaded = self.loaded(idx);
            let dut = &mut self.duts[idx];
            let dt = now.duration_since(dut.last_update).as_secs_f64();
            dut.last_update = now;

            if powered {
                dut.vcap = (dut.vcap + dut.profile.charge_rate * dt).min(dut.profile.full_voltage);
            } else if loaded {
                dut.vcap = (dut.vcap - dut.profile.discharge_rate * dt).max(0.0);
            }

            if let Some(started) = dut.cap_started {
                if now.duration_since(started) >= dut.profile.cap_measure_time {
                    dut.cap_started = None;
                    let value = dut.profile.capacitance;
                    if let Some(eeprom) = dut.eeproms.get_mut(&reg::EEPROM_ADDR) {
                        eeprom[usize::from(CAPACITANCE_OFFSET)] = value;
                    }
                }
            }
        }
    }

    fn set_power(&mut self, port: usize, on: bool, now: Instant) {
        let was_powered = self.ports[port].dut.map(|d| self.powered(d));
        self.ports[port].power = on;
        if let (Some(dut), Some(false)) = (self.ports[port].dut, was_powered) {
            if on {
                let dut = &mut self.duts[dut];
                dut.shut_down = false;
                dut.first_powered.get_or_insert(now);
            }
        }
    }

    fn handle(&mut self, request: &Request) -> Reply {
        let now = Instant::now();
        self.advance(now);
        self.log.push((request.command, request.port));

        let command = request.command;
        let port = usize::from(request.port);
        if port >= SIM_PORTS || self.rejected.contains(&(port, command)) {
            return Reply::nack(command, STATUS_NACK);
        }

        match command {
            FixtureCommand::Version => Reply::ok(command, vec![self.firmware.0, self.firmware.1]),
            FixtureCommand::I2cRead | FixtureCommand::I2cWrite => self.i2c(port, request),
            FixtureCommand::PresentPin => {
                let present = self.ports[port]
                    .dut
                    .map(|d| self.duts[d].profile.present)
                    .unwrap_or(false);
                // active low
                Reply::ok(command, vec![u8::from(!present)])
            }
            FixtureCommand::GtgPin => {
                let asserted = self.ports[port].dut.is_some_and(|d| {
                    let powered = self.powered(d);
                    let dut = &self.duts[d];
                    dut.alive(powered) && dut.profile.gtg_pin && dut.vcap >= dut.profile.gtg_level
                });
                Reply::ok(command, vec![u8::from(asserted)])
            }
            FixtureCommand::OutputOn => {
                self.set_power(port, true, now);
                Reply::ok(command, vec![])
            }
            FixtureCommand::OutputOff => {
                self.set_power(port, false, now);
                Reply::ok(command, vec![])
            }
            FixtureCommand::OutputStatus => {
                Reply::ok(command, vec![u8::from(self.ports[port].power)])
            }
            FixtureCommand::LedOn => {
                self.ports[port].led = true;
                Reply::ok(command, vec![])
            }
            FixtureCommand::LedOff => {
                self.ports[port].led = false;
                Reply::ok(command, vec![])
            }
            FixtureCommand::LoadOn => {
                self.ports[port].load = true;
                Reply::ok(command, vec![])
            }
            FixtureCommand::LoadOff => {
                self.ports[port].load = false;
                Reply::ok(command, vec![])
            }
            FixtureCommand::ProductType => match request.payload.first() {
                Some(code) if *code <= 0x02 => {
                    self.ports[port].product_type = Some(*code);
                    Reply::ok(command, vec![])
                }
                _ => Reply::nack(command, STATUS_NACK),
            },
            FixtureCommand::LoadCurrent => match request.payload.as_slice() {
                [hi, lo] => {
                    self.ports[port].load_current_ma = u16::from_be_bytes([*hi, *lo]);
                    Reply::ok(command, vec![])
                }
                _ => Reply::nack(command, STATUS_NACK),
            },
            FixtureCommand::ResetDut => Reply::ok(command, vec![]),
            FixtureCommand::ShutdownDut => {
                if let Some(d) = self.ports[port].dut {
                    let dut = &mut self.duts[d];
                    if dut.profile.honours_shutdown {
                        dut.shut_down = true;
                    }
                }
                Reply::ok(command, vec![])
            }
        }
    }

    fn i2c(&mut self, port: usize, request: &Request) -> Reply {
        let command = request.command;
        let Some(d) = self.ports[port].dut else {
            return Reply::nack(command, STATUS_NACK);
        };
        let powered = self.powered(d);
        let primary = self.duts[d].ports.first() == Some(&port);
        let shared_addr = self.ports[port].shared_addr;
        let dut = &mut self.duts[d];
        if !dut.alive(powered) {
            return Reply::nack(command, STATUS_NACK);
        }

        let (device, register) = match request.payload.as_slice() {
            [device, hi, lo, ..] => (*device, u16::from_be_bytes([*hi, *lo])),
            _ => return Reply::nack(command, STATUS_NACK),
        };
        let reachable = if primary {
            device == reg::MCU_ADDR || device == reg::EEPROM_ADDR
        } else {
            Some(device) == shared_addr
        };
        if !reachable {
            return Reply::nack(command, STATUS_NACK);
        }

        if device == reg::MCU_ADDR {
            return match command {
                FixtureCommand::I2cRead => {
                    let now = dut.last_update;
                    let value = mcu_register(dut, powered, register, now);
                    Reply::ok(command, vec![value])
                }
                _ => {
                    let value = request.payload.get(3).copied().unwrap_or(0);
                    dut.mcu_writes.push((register, value));
                    match (register, value) {
                        (reg::COMMAND, reg::CMD_START_CAP)
                        | (reg::EXT_COMMAND, reg::EXT_CMD_START_CAP) => {
                            dut.cap_started = Some(dut.last_update);
                        }
                        _ => {}
                    }
                    Reply::ok(command, vec![])
                }
            };
        }

        let eeprom = dut
            .eeproms
            .entry(device)
            .or_insert_with(|| vec![0xFF; EEPROM_SIZE]);
        let offset = usize::from(register);
        if offset >= eeprom.len() {
            return Reply::nack(command, STATUS_NACK);
        }
        match command {
            FixtureCommand::I2cRead => Reply::ok(command, vec![eeprom[offset]]),
            _ => {
                eeprom[offset] = request.payload.get(3).copied().unwrap_or(0xFF);
                Reply::ok(command, vec![])
            }
        }
    }
}

fn mcu_register(dut: &SimDut, powered: bool, register: u16, now: Instant) -> u8 {
    let profile = &dut.profile;
    let noisy = |v: f64| {
        if profile.noise > 0.0 {
            v + rand::thread_rng().gen_range(-profile.noise / 2.0..=profile.noise / 2.0)
        } else {
            v
        }
    };
    let vin = if powered {
        profile.supply_voltage
    } else if profile.bypass_ok && dut.vcap > profile.boost_voltage {
        dut.vcap - 0.1
    } else {
        profile.boost_voltage
    };
    let millivolts = |v: f64| ((v.max(0.0) * 1000.0).round() as u16).to_be_bytes();

    match register {
        r if r == reg::GTG => {
            if profile.gtg_bit {
                reg::GTG_BIT
            } else {
                0
            }
        }
        r if r == reg::GTG_WARNING => profile.gtg_warning,
        r if r == reg::PGEMSTAT => {
            let mut stat = 0;
            if profile.ready {
                stat |= reg::STAT_HW_READY;
            }
            if powered && dut.vcap >= profile.full_voltage {
                stat |= reg::STAT_CHARGE_COMPLETE;
            }
            if dut.cap_started.is_some() {
                stat |= reg::STAT_CAP_MEASURING;
            }
            stat
        }
        r if r == reg::VCAP => millivolts(noisy(dut.vcap))[0],
        r if r == reg::VCAP + 1 => millivolts(noisy(dut.vcap))[1],
        r if r == reg::VIN => millivolts(noisy(vin))[0],
        r if r == reg::VIN + 1 => millivolts(noisy(vin))[1],
        r if r == reg::TEMPERATURE => dut.temperature(now).round() as i8 as u8,
        r if r == reg::HW_VERSION => profile.hw_version,
        r if r == reg::FW_VERSION => profile.fw_version.0,
        r if r == reg::FW_VERSION + 1 => profile.fw_version.1,
        _ => 0,
    }
}

/// Simulated fixture controller board.
///
/// Clones share the same board, so a test can keep one handle for inspection
/// while the driver owns another.
#[derive(Debug, Clone)]
pub struct SimulatedFixture {
    board: Arc<Mutex<SimBoard>>,
}

impl SimulatedFixture {
    /// Empty board with supported firmware.
    pub fn new() -> Self {
        Self {
            board: Arc::new(Mutex::new(SimBoard {
                firmware: SUPPORTED_FIRMWARE,
                offline: false,
                rejected: HashSet::new(),
                ports: vec![SimPort::default(); SIM_PORTS],
                duts: Vec::new(),
                log: Vec::new(),
            })),
        }
    }

    fn board(&self) -> MutexGuard<'_, SimBoard> {
        self.board.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Report a different firmware version.
    pub fn with_firmware(self, major: u8, minor: u8) -> Self {
        self.board().firmware = (major, minor);
        self
    }

    fn add_dut(&self, ports: Vec<usize>, shared: &[u8], profile: DutProfile) {
        let mut board = self.board();
        let idx = board.duts.len();
        let mut eeproms = HashMap::new();
        eeproms.insert(reg::EEPROM_ADDR, vec![0xFF; EEPROM_SIZE]);
        for addr in shared {
            eeproms.insert(*addr, vec![0xFF; EEPROM_SIZE]);
        }
        for (i, port) in ports.iter().enumerate() {
            board.ports[*port].dut = Some(idx);
            board.ports[*port].shared_addr = i.checked_sub(1).and_then(|s| shared.get(s).copied());
        }
        board.duts.push(SimDut {
            vcap: profile.initial_vcap,
            profile,
            ports,
            last_update: Instant::now(),
            first_powered: None,
            shut_down: false,
            cap_started: None,
            eeproms,
            mcu_writes: Vec::new(),
        });
    }

    /// Seat a module on one physical port.
    pub fn insert(&self, port: usize, profile: DutProfile) {
        self.add_dut(vec![port], &[], profile);
    }

    /// Seat a 4-in-1 module on `port..port + 4`.
    ///
    /// The shared EEPROMs answer out of order, the way production cables do.
    pub fn insert_4in1(&self, port: usize, profile: DutProfile) {
        self.add_dut(
            (port..port + 4).collect(),
            &[0x55, 0x54, 0x56],
            profile,
        );
    }

    /// Stop answering altogether, as a disconnected controller would.
    pub fn set_offline(&self, offline: bool) {
        self.board().offline = offline;
    }

    /// Make the controller reject `command` on `port`.
    pub fn reject(&self, port: usize, command: FixtureCommand, rejected: bool) {
        let mut board = self.board();
        if rejected {
            board.rejected.insert((port, command));
        } else {
            board.rejected.remove(&(port, command));
        }
    }

    /// Break or restore the I2C path of the module on `port`.
    pub fn set_i2c_fault(&self, port: usize, fault: bool) {
        let mut board = self.board();
        if let Some(d) = board.ports[port].dut {
            board.duts[d].profile.i2c_fault = fault;
        }
    }

    pub fn vcap(&self, port: usize) -> Option<f64> {
        let mut board = self.board();
        board.advance(Instant::now());
        board.ports[port].dut.map(|d| board.duts[d].vcap)
    }

    pub fn power(&self, port: usize) -> bool {
        self.board().ports[port].power
    }

    pub fn load(&self, port: usize) -> bool {
        self.board().ports[port].load
    }

    pub fn led(&self, port: usize) -> bool {
        self.board().ports[port].led
    }

    pub fn load_current_ma(&self, port: usize) -> u16 {
        self.board().ports[port].load_current_ma
    }

    pub fn product_type(&self, port: usize) -> Option<u8> {
        self.board().ports[port].product_type
    }

    /// EEPROM contents of the module on `port` at I2C address `device`.
    pub fn eeprom(&self, port: usize, device: u8) -> Option<Vec<u8>> {
        let board = self.board();
        let d = board.ports[port].dut?;
        board.duts[d].eeproms.get(&device).cloned()
    }

    /// Controller register writes of the module on `port`.
    pub fn mcu_writes(&self, port: usize) -> Vec<(u16, u8)> {
        let board = self.board();
        board.ports[port]
            .dut
            .map(|d| board.duts[d].mcu_writes.clone())
            .unwrap_or_default()
    }

    /// Every command sent so far.
    pub fn commands(&self) -> Vec<(FixtureCommand, u8)> {
        self.board().log.clone()
    }

    /// Commands sent to one physical port.
    pub fn commands_on(&self, port: usize) -> Vec<FixtureCommand> {
        self.board()
            .log
            .iter()
            .filter(|(_, p)| usize::from(*p) == port)
            .map(|(c, _)| *c)
            .collect()
    }
}

impl Default for SimulatedFixture {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandLink for SimulatedFixture {
    async fn transact(&mut self, request: &Request) -> Result<Reply, TransportError> {
        let mut board = self.board();
        if board.offline {
            board.log.push((request.command, request.port));
            return Err(TransportError::Link(format!(
                "board does not answer {:?}",
                request.command
            )));
        }
        Ok(board.handle(request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::fixture::{FixtureController, FixtureTransport, I2cBridge, LoadMode};
    use crate::hardware::pgem::Pgem;

    #[tokio::test(start_paused = true)]
    async fn test_charges_while_powered() {
        let sim = SimulatedFixture::new();
        sim.insert(0, DutProfile::default());
        let fixture = FixtureController::connect(sim.clone(), 1, 0).await.unwrap();

        fixture.power_on(0).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        let pgem = Pgem::new(&fixture, 0);
        let vcap = pgem.vcap().await.unwrap();
        assert!((vcap - 1.0).abs() < 1e-3, "vcap {vcap}");
        assert_eq!(pgem.vin().await.unwrap(), 12.0);
        assert!(!pgem.status().await.unwrap().charge_complete());

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(pgem.status().await.unwrap().charge_complete());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unpowered_module_does_not_answer() {
        let sim = SimulatedFixture::new();
        sim.insert(0, DutProfile::default());
        let fixture = FixtureController::connect(sim, 1, 0).await.unwrap();
        let err = Pgem::new(&fixture, 0).vcap().await.unwrap_err();
        assert!(err.is_adapter_fault());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_silences_bus() {
        let sim = SimulatedFixture::new();
        sim.insert(
            1,
            DutProfile {
                initial_vcap: 4.8,
                ..Default::default()
            },
        );
        let fixture = FixtureController::connect(sim, 1, 0).await.unwrap();
        let pgem = Pgem::new(&fixture, 1);
        assert!(pgem.vcap().await.is_ok());
        fixture.shutdown_dut(1).await.unwrap();
        assert!(pgem.vcap().await.unwrap_err().is_adapter_fault());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_ports_answer_at_own_address() {
        let sim = SimulatedFixture::new();
        sim.insert_4in1(0, DutProfile::default());
        let fixture = FixtureController::connect(sim.clone(), 1, 0).await.unwrap();
        fixture.power_on(0).await.unwrap();

        fixture.select_port(1).await.unwrap();
        assert!(fixture.read(reg::EEPROM_ADDR, 0, 1).await.is_err());
        assert!(fixture.read(0x55, 0, 1).await.is_ok());
        assert_eq!(sim.eeprom(2, 0x54).map(|e| e.len()), Some(EEPROM_SIZE));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacitance_measurement_completes() {
        let sim = SimulatedFixture::new();
        sim.insert(0, DutProfile::default());
        let fixture = FixtureController::connect(sim.clone(), 1, 0).await.unwrap();
        fixture.power_on(0).await.unwrap();
        let pgem = Pgem::new(&fixture, 0);

        pgem.start_cap_measure(crate::dut::ProductFamily::Amber)
            .await
            .unwrap();
        assert!(pgem.status().await.unwrap().cap_measuring());
        tokio::time::sleep(Duration::from_secs(21)).await;
        assert!(!pgem.status().await.unwrap().cap_measuring());
        assert_eq!(pgem.capacitance().await.unwrap(), 30.0);
        assert_eq!(sim.mcu_writes(0), vec![(reg::COMMAND, reg::CMD_START_CAP)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_offline_board_rejects_commands() {
        let sim = SimulatedFixture::new();
        let fixture = FixtureController::connect(sim.clone(), 1, 0).await.unwrap();
        sim.set_offline(true);
        let err = fixture.led_on(0).await.unwrap_err();
        assert!(matches!(err, TransportError::Link(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_command_is_per_port() {
        let sim = SimulatedFixture::new();
        let fixture = FixtureController::connect(sim.clone(), 1, 0).await.unwrap();
        sim.reject(1, FixtureCommand::LoadOn, true);
        let err = fixture.load_on(1, LoadMode::Low).await.unwrap_err();
        assert!(matches!(err, TransportError::Communication(_)));
        fixture.load_on(0, LoadMode::Low).await.unwrap();
        assert!(sim.load(0));
    }
}
