//! Hardware access for one test channel.
//!
//! - [`fixture`]: fixture-controller driver and the per-slot traits
//! - [`pgem`]: DUT register map and facade over the I2C pass-through
//! - [`vpd`]: identity image model
//! - [`sim`]: simulated controller and modules

pub mod fixture;
pub mod pgem;
pub mod sim;
pub mod vpd;

use std::sync::Arc;

use crate::error::TransportError;
use fixture::{CommandLink, FixtureController, FixtureTransport, I2cBridge};
use pgem::Pgem;
use sim::SimulatedFixture;

/// The transport pair a channel drives, bound 1:1 to one fixture controller.
#[derive(Clone)]
pub struct ChannelHardware {
    pub fixture: Arc<dyn FixtureTransport>,
    pub bridge: Arc<dyn I2cBridge>,
}

impl ChannelHardware {
    pub fn new(fixture: Arc<dyn FixtureTransport>, bridge: Arc<dyn I2cBridge>) -> Self {
        Self { fixture, bridge }
    }

    /// Both views of a single controller.
    pub fn from_controller<L: CommandLink + 'static>(controller: FixtureController<L>) -> Self {
        let controller = Arc::new(controller);
        Self {
            fixture: controller.clone(),
            bridge: controller,
        }
    }

    /// Connect to a simulated board.
    pub async fn simulated(
        sim: SimulatedFixture,
        board_id: u8,
        group: u8,
    ) -> Result<Self, TransportError> {
        let controller = FixtureController::connect(sim, board_id, group).await?;
        Ok(Self::from_controller(controller))
    }

    /// Register facade of the module in `slot`.
    pub fn pgem(&self, slot: usize) -> Pgem<'_> {
        Pgem::new(self.bridge.as_ref(), slot)
    }
}
