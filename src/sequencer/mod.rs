//! Channel test sequencer
//!
//! One [`Channel`] drives up to four DUTs on one fixture controller through
//! the phase sequence
//!
//! ```text
//! INIT → PROGRAM_VPD → CHARGE → [HOLD] → CHECK_CAPACITANCE → CHECK_VPD → DISCHARGE → RECHARGE → EXIT
//! ```
//!
//! Phases are tokens on a [`PhaseQueue`]. A single worker task pops one token,
//! runs the phase to completion (including its polling loop) and blocks for the
//! next one. Within a phase, DUTs are polled round-robin by that same task; there
//! is no per-DUT task.
//!
//! ## Failure containment
//!
//! - A DUT fault (limit violation, timeout, I2C adapter fault on its slot) is
//!   recorded on the [`Dut`] and the phase moves on to the next slot.
//! - Any other error unwinds the phase handler with `?`. The worker then drops
//!   the remaining tokens, drives the fixture to a safe state, publishes
//!   [`ChannelResult::Aborted`] and returns the error to whoever joins it.
//!
//! ## Cancellation
//!
//! [`ChannelHandle::quit`] clears the pending tokens and queues `EXIT`. The
//! running phase is never interrupted; teardown runs once it completes.

mod capacitance;
mod charge;
mod discharge;
mod init;
pub mod limits;
mod program;
mod teardown;
mod vpd_check;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};

use crate::config::{StationConfig, TimingSettings};
use crate::dut::{Cycle, CycleState, Dut, DutFault, DutStatus};
use crate::error::{AppResult, StationError, TransportError};
use crate::hardware::pgem::Pgem;
use crate::hardware::ChannelHardware;
use crate::results::ResultSink;
use crate::test_config::{PhaseConfig, TestConfig, TestConfigProvider, TestItem};

/// Sequencer phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Init,
    ProgramVpd,
    Charge,
    Hold,
    CheckCapacitance,
    CheckVpd,
    /// Standalone temperature check; not part of the default sequence
    CheckTemp,
    Discharge,
    Recharge,
    Exit,
}

impl Phase {
    /// Progress contributed by the phase; a full run adds up to 100.
    pub fn weight(self) -> u32 {
        match self {
            Phase::Init => 20,
            Phase::ProgramVpd => 5,
            Phase::Charge => 20,
            Phase::CheckCapacitance => 30,
            Phase::CheckVpd => 5,
            Phase::Discharge => 15,
            Phase::Recharge => 5,
            Phase::Hold | Phase::CheckTemp | Phase::Exit => 0,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "INIT",
            Phase::ProgramVpd => "PROGRAM_VPD",
            Phase::Charge => "CHARGE",
            Phase::Hold => "HOLD",
            Phase::CheckCapacitance => "CHECK_CAPACITANCE",
            Phase::CheckVpd => "CHECK_VPD",
            Phase::CheckTemp => "CHECK_TEMP",
            Phase::Discharge => "DISCHARGE",
            Phase::Recharge => "RECHARGE",
            Phase::Exit => "EXIT",
        };
        f.write_str(name)
    }
}

/// Aggregate result of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelResult {
    /// Nothing was tested
    Idle,
    Running,
    Pass,
    Fail,
    /// A phase raised a channel-fatal error; results are incomplete
    Aborted,
}

/// Snapshot published on every phase transition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelStatus {
    pub channel: u8,
    pub phase: Option<Phase>,
    pub progress: u32,
    pub result: ChannelResult,
    pub exited: bool,
}

/// Blocking work queue of phase tokens.
#[derive(Debug, Default)]
pub struct PhaseQueue {
    pending: std::sync::Mutex<VecDeque<Phase>>,
    notify: Notify,
}

impl PhaseQueue {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, VecDeque<Phase>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a token and wake the worker.
    pub fn push(&self, phase: Phase) {
        self.pending().push_back(phase);
        self.notify.notify_one();
    }

    /// Wait for the next phase token.
    pub async fn pop(&self) -> Phase {
        loop {
            let next = self.pending().pop_front();
            if let Some(phase) = next {
                return phase;
            }
            self.notify.notified().await;
        }
    }

    /// Drop every pending token. Does not queue `EXIT`.
    pub fn clear(&self) {
        self.pending().clear();
    }

    /// Drop every pending token and queue `EXIT`.
    pub fn quit(&self) {
        let mut pending = self.pending();
        pending.clear();
        pending.push_back(Phase::Exit);
        drop(pending);
        self.notify.notify_one();
    }

    /// Number of pending tokens.
    pub fn len(&self) -> usize {
        self.pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending().is_empty()
    }
}

/// What the operator loaded into one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotAssignment {
    /// Module barcode; blank means the slot is empty
    pub barcode: String,
    #[serde(default)]
    pub cable_barcode: String,
    #[serde(default)]
    pub capacitor_barcode: String,
}

impl SlotAssignment {
    pub fn new(barcode: impl Into<String>) -> Self {
        Self {
            barcode: barcode.into(),
            ..Default::default()
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_cable(mut self, cable_barcode: impl Into<String>) -> Self {
        self.cable_barcode = cable_barcode.into();
        self
    }

    pub fn with_capacitor(mut self, capacitor_barcode: impl Into<String>) -> Self {
        self.capacitor_barcode = capacitor_barcode.into();
        self
    }

    pub fn is_empty(&self) -> bool {
        self.barcode.trim().is_empty()
    }
}

/// Outcome of a channel run that reached teardown.
#[derive(Debug, Clone)]
pub struct ChannelReport {
    pub channel: u8,
    pub result: ChannelResult,
    /// Final DUT records, in slot order
    pub duts: Vec<Dut>,
    /// Exported result files
    pub exported: Vec<PathBuf>,
}

impl ChannelReport {
    pub fn dut(&self, slot: usize) -> Option<&Dut> {
        self.duts.iter().find(|d| d.slot == slot)
    }
}

/// Handle to a spawned channel worker.
pub struct ChannelHandle {
    id: u8,
    queue: Arc<PhaseQueue>,
    status: watch::Receiver<ChannelStatus>,
    task: JoinHandle<AppResult<ChannelReport>>,
}

impl ChannelHandle {
    /// Channel number.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Queue an extra phase behind the pending ones.
    pub fn enqueue(&self, phase: Phase) {
        self.queue.push(phase);
    }

    /// Abandon the pending phases and tear down once the current one completes.
    pub fn quit(&self) {
        info!(channel = self.id, "quit requested");
        self.queue.quit();
    }

    /// Latest published status.
    pub fn status(&self) -> ChannelStatus {
        self.status.borrow().clone()
    }

    /// Subscribe to status updates.
    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status.clone()
    }

    /// Wait for the worker to finish.
    pub async fn join(self) -> AppResult<ChannelReport> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => {
                error!(channel = self.id, error = %e, "channel task panicked");
                Err(StationError::ChannelAborted(self.id))
            }
        }
    }
}

/// Hardware sequencing helpers shared by the phase handlers.
///
/// Built from the immutable fields of a [`Channel`] so handlers can hold a
/// `Rig` while mutating DUT records.
pub(crate) struct Rig<'a> {
    hw: &'a ChannelHardware,
    timing: &'a TimingSettings,
    mode4in1: bool,
}

impl<'a> Rig<'a> {
    fn new(hw: &'a ChannelHardware, timing: &'a TimingSettings, mode4in1: bool) -> Self {
        Self {
            hw,
            timing,
            mode4in1,
        }
    }

    /// Physical slots covered by the DUT in `slot`.
    fn ports(&self, slot: usize) -> Range<usize> {
        if self.mode4in1 {
            slot..slot + 4
        } else {
            slot..slot + 1
        }
    }

    /// Shared ports of a 4-in-1 group; empty otherwise.
    fn shared_ports(&self, slot: usize) -> Range<usize> {
        let ports = self.ports(slot);
        ports.start + 1..ports.end
    }

    fn pgem(&self, slot: usize) -> Pgem<'a> {
        self.hw.pgem(slot)
    }

    async fn power_on(&self, slot: usize) -> Result<(), TransportError> {
        for port in self.ports(slot) {
            self.hw.fixture.power_on(port).await?;
            sleep(self.timing.port_switch).await;
        }
        Ok(())
    }

    async fn power_off(&self, slot: usize) -> Result<(), TransportError> {
        for port in self.ports(slot) {
            self.hw.fixture.power_off(port).await?;
        }
        Ok(())
    }

    async fn load_off(&self, slot: usize) -> Result<(), TransportError> {
        for port in self.ports(slot) {
            self.hw.fixture.load_off(port).await?;
        }
        Ok(())
    }

    /// Whether the supply output is on for every covered port.
    async fn output_on(&self, slot: usize) -> Result<bool, TransportError> {
        for port in self.ports(slot) {
            if !self.hw.fixture.is_power_on(port).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Input voltage, temperature and capacitor voltage of one module.
    async fn read(&self, slot: usize) -> Result<Reading, TransportError> {
        let pgem = self.pgem(slot);
        Ok(Reading {
            vin: pgem.vin().await?,
            temperature: pgem.temperature().await?,
            vcap: pgem.vcap().await?,
        })
    }

    /// Poll the hardware-ready bit.
    async fn hardware_ready(&self, slot: usize) -> Result<bool, TransportError> {
        let pgem = self.pgem(slot);
        for _ in 0..self.timing.ready_polls {
            if pgem.hardware_ready().await? {
                return Ok(true);
            }
            sleep(self.timing.ready_poll_delay).await;
        }
        Ok(false)
    }
}

/// One round of analog readings.
#[derive(Debug, Clone, Copy)]
struct Reading {
    vin: f64,
    temperature: f64,
    vcap: f64,
}

impl Reading {
    fn cycle(self, counter: u32, elapsed: f64, state: CycleState) -> Cycle {
        Cycle {
            counter,
            timestamp: Utc::now(),
            elapsed,
            vcap: self.vcap,
            vin: self.vin,
            temp: self.temperature,
            state,
        }
    }
}

/// Keep a fault of the DUT's own slot on the DUT; link and protocol faults
/// are channel-fatal.
fn contain<T>(dut: &mut Dut, result: Result<T, TransportError>) -> AppResult<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_adapter_fault() => {
            warn!(slot = dut.slot, error = %e, "IIC access failed");
            dut.fail(DutFault::IicAccessFailed);
            Ok(None)
        }
        Err(e) if e.is_slot_fault() => {
            warn!(slot = dut.slot, error = %e, "fixture command rejected");
            dut.fail(DutFault::FixtureCommand);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

/// Seconds since `start`.
fn elapsed_secs(start: Instant) -> f64 {
    start.elapsed().as_secs_f64()
}

/// Per-channel test sequencer.
pub struct Channel {
    id: u8,
    config: Arc<StationConfig>,
    hw: ChannelHardware,
    provider: Arc<dyn TestConfigProvider>,
    sink: Arc<dyn ResultSink>,
    /// Operator input per slot
    assignments: Vec<SlotAssignment>,
    mode4in1: bool,
    duts: Vec<Option<Dut>>,
    test_configs: Vec<Option<TestConfig>>,
    queue: Arc<PhaseQueue>,
    progress: u32,
    result: ChannelResult,
    /// Sample index of the running polling phase
    counter: u32,
    status_tx: watch::Sender<ChannelStatus>,
}

impl Channel {
    pub fn new(
        id: u8,
        config: Arc<StationConfig>,
        hw: ChannelHardware,
        provider: Arc<dyn TestConfigProvider>,
        sink: Arc<dyn ResultSink>,
        assignments: Vec<SlotAssignment>,
        mode4in1: bool,
    ) -> Self {
        let slots = config.station.total_slot_num;
        let (status_tx, _) = watch::channel(ChannelStatus {
            channel: id,
            phase: None,
            progress: 0,
            result: ChannelResult::Idle,
            exited: false,
        });
        Self {
            id,
            config,
            hw,
            provider,
            sink,
            assignments,
            mode4in1,
            duts: (0..slots).map(|_| None).collect(),
            test_configs: vec![None; slots],
            queue: Arc::new(PhaseQueue::new()),
            progress: 0,
            result: ChannelResult::Idle,
            counter: 0,
            status_tx,
        }
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn mode4in1(&self) -> bool {
        self.mode4in1
    }

    /// Queue a phase.
    pub fn enqueue(&self, phase: Phase) {
        self.queue.push(phase);
    }

    /// Queue the full production sequence.
    pub fn auto_test(&self) {
        let mut sequence = vec![Phase::Init, Phase::ProgramVpd, Phase::Charge];
        if self.config.hold.enabled {
            sequence.push(Phase::Hold);
        }
        sequence.extend([
            Phase::CheckCapacitance,
            Phase::CheckVpd,
            Phase::Discharge,
            Phase::Recharge,
            Phase::Exit,
        ]);
        for phase in sequence {
            self.queue.push(phase);
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelStatus> {
        self.status_tx.subscribe()
    }

    /// Start the worker task.
    pub fn spawn(self) -> ChannelHandle {
        let id = self.id;
        let queue = self.queue.clone();
        let status = self.status_tx.subscribe();
        let task = tokio::spawn(self.run());
        ChannelHandle {
            id,
            queue,
            status,
            task,
        }
    }

    /// Worker loop: pop a phase, run it, repeat until `EXIT`.
    pub async fn run(mut self) -> AppResult<ChannelReport> {
        info!(channel = self.id, mode4in1 = self.mode4in1, "channel started");
        self.result = ChannelResult::Running;
        self.publish(None, false);

        loop {
            let phase = self.queue.pop().await;
            if phase == Phase::Exit {
                return match self.teardown().await {
                    Ok(report) => Ok(report),
                    Err(err) => {
                        error!(channel = self.id, error = %err, "teardown failed");
                        self.result = ChannelResult::Aborted;
                        self.publish(Some(Phase::Exit), true);
                        Err(err)
                    }
                };
            }

            info!(channel = self.id, %phase, "phase started");
            self.publish(Some(phase), false);
            if let Err(err) = self.execute(phase).await {
                error!(channel = self.id, %phase, error = %err, "phase failed, channel aborted");
                self.queue.clear();
                self.safe_state().await;
                self.result = ChannelResult::Aborted;
                self.publish(Some(phase), true);
                return Err(err);
            }
            self.progress += phase.weight();
            info!(channel = self.id, %phase, progress = self.progress, "phase finished");
            self.publish(Some(phase), false);
        }
    }

    async fn execute(&mut self, phase: Phase) -> AppResult<()> {
        match phase {
            Phase::Init => self.init().await,
            Phase::ProgramVpd => self.program_vpd().await,
            Phase::Charge => self.charge(TestItem::Charge).await,
            Phase::Hold => self.hold().await,
            Phase::CheckCapacitance => self.check_capacitance().await,
            Phase::CheckVpd => self.check_vpd().await,
            Phase::CheckTemp => self.check_temperature().await,
            Phase::Discharge => self.discharge().await,
            Phase::Recharge => self.charge(TestItem::Recharge).await,
            Phase::Exit => Ok(()),
        }
    }

    fn publish(&self, phase: Option<Phase>, exited: bool) {
        self.status_tx.send_replace(ChannelStatus {
            channel: self.id,
            phase,
            progress: self.progress,
            result: self.result,
            exited,
        });
    }

    /// Limits of a test item for the DUT in `slot`.
    fn phase_config(&self, slot: usize, item: TestItem) -> PhaseConfig {
        self.test_configs
            .get(slot)
            .and_then(Option::as_ref)
            .map(|c| c.item(item))
            .unwrap_or_default()
    }

    /// Slots whose DUT passes both gates of a phase: the item is enabled, and
    /// with stop-on-fail the DUT is in the `expected` status.
    fn gated(&self, item: TestItem, expected: DutStatus) -> Vec<usize> {
        self.duts
            .iter()
            .enumerate()
            .filter_map(|(slot, dut)| {
                let dut = dut.as_ref()?;
                let cfg = self.phase_config(slot, item);
                if !cfg.enable {
                    return None;
                }
                if cfg.stop_on_fail && dut.status() != expected {
                    return None;
                }
                Some(slot)
            })
            .collect()
    }

    /// Slots of `candidates` whose DUT is currently in `status`.
    fn in_status(&self, candidates: &[usize], status: DutStatus) -> Vec<usize> {
        candidates
            .iter()
            .copied()
            .filter(|slot| {
                self.duts[*slot]
                    .as_ref()
                    .is_some_and(|d| d.status() == status)
            })
            .collect()
    }

    /// Keep the supply on for `duration`.
    async fn hold(&mut self) -> AppResult<()> {
        let duration = self.config.hold.duration;
        info!(channel = self.id, ?duration, "holding power on");
        let start = Instant::now();
        while start.elapsed() <= duration {
            sleep(self.config.station.interval).await;
        }
        Ok(())
    }

    /// Outputs and loads off on every slot; errors are only logged.
    async fn safe_state(&self) {
        for slot in 0..self.duts.len() {
            if let Err(e) = self.hw.fixture.load_off(slot).await {
                warn!(channel = self.id, slot, error = %e, "failed to switch load off");
            }
            if let Err(e) = self.hw.fixture.power_off(slot).await {
                warn!(channel = self.id, slot, error = %e, "failed to switch output off");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_sequence_weights_total_100() {
        let total: u32 = [
            Phase::Init,
            Phase::ProgramVpd,
            Phase::Charge,
            Phase::Hold,
            Phase::CheckCapacitance,
            Phase::CheckVpd,
            Phase::Discharge,
            Phase::Recharge,
            Phase::Exit,
        ]
        .iter()
        .map(|p| p.weight())
        .sum();
        assert_eq!(total, 100);
    }

    #[tokio::test]
    async fn test_queue_is_fifo() {
        let queue = PhaseQueue::new();
        queue.push(Phase::Init);
        queue.push(Phase::Charge);
        assert_eq!(queue.pop().await, Phase::Init);
        assert_eq!(queue.pop().await, Phase::Charge);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_quit_replaces_pending_with_exit() {
        let queue = PhaseQueue::new();
        queue.push(Phase::Charge);
        queue.push(Phase::Discharge);
        queue.quit();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await, Phase::Exit);
    }

    #[tokio::test]
    async fn test_pop_waits_for_push() {
        let queue = Arc::new(PhaseQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(Phase::Hold);
        assert_eq!(waiter.await.unwrap(), Phase::Hold);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::CheckCapacitance.to_string(), "CHECK_CAPACITANCE");
        assert_eq!(Phase::ProgramVpd.to_string(), "PROGRAM_VPD");
    }
}
