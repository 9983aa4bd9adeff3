//! Station-level orchestration.
//!
//! A station drives one [`Channel`] per configured fixture controller. Channels
//! share nothing but the read-only configuration, the limits provider and the
//! result sink, so they run as independent tokio tasks and are joined at the
//! end.

use futures::future::join_all;
use std::sync::Arc;
use tracing::info;

use crate::config::StationConfig;
use crate::error::{AppResult, StationError};
use crate::hardware::ChannelHardware;
use crate::results::ResultSink;
use crate::sequencer::{Channel, ChannelHandle, ChannelReport, SlotAssignment};
use crate::test_config::TestConfigProvider;

/// What the operator started on one channel.
pub struct ChannelSetup {
    pub id: u8,
    pub hardware: ChannelHardware,
    pub assignments: Vec<SlotAssignment>,
    /// Wiring mode chosen by the operator; a `mode4in1` in the channel binding wins
    pub mode4in1: bool,
}

pub struct Station {
    config: Arc<StationConfig>,
    provider: Arc<dyn TestConfigProvider>,
    sink: Arc<dyn ResultSink>,
}

impl Station {
    pub fn new(
        config: Arc<StationConfig>,
        provider: Arc<dyn TestConfigProvider>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        Self {
            config,
            provider,
            sink,
        }
    }

    pub fn config(&self) -> &StationConfig {
        &self.config
    }

    /// Build the sequencer of a configured channel.
    pub fn channel(&self, setup: ChannelSetup) -> AppResult<Channel> {
        let binding = self.config.channel(setup.id).ok_or_else(|| {
            StationError::Configuration(format!("channel {} is not configured", setup.id))
        })?;
        let mode4in1 = binding.mode4in1.unwrap_or(setup.mode4in1);
        Ok(Channel::new(
            setup.id,
            self.config.clone(),
            setup.hardware,
            self.provider.clone(),
            self.sink.clone(),
            setup.assignments,
            mode4in1,
        ))
    }

    /// Queue the production sequence on every channel and start the workers.
    pub fn start(&self, setups: Vec<ChannelSetup>) -> AppResult<Vec<ChannelHandle>> {
        let channels = setups
            .into_iter()
            .map(|setup| self.channel(setup))
            .collect::<AppResult<Vec<_>>>()?;
        info!(channels = channels.len(), "starting station");
        Ok(channels
            .into_iter()
            .map(|channel| {
                channel.auto_test();
                channel.spawn()
            })
            .collect())
    }

    /// Wait for every channel. Results come back in handle order; one aborted
    /// channel does not affect the others.
    pub async fn join(handles: Vec<ChannelHandle>) -> Vec<AppResult<ChannelReport>> {
        join_all(handles.into_iter().map(ChannelHandle::join)).await
    }

    /// Run the production sequence on every channel to completion.
    pub async fn run(&self, setups: Vec<ChannelSetup>) -> AppResult<Vec<AppResult<ChannelReport>>> {
        let handles = self.start(setups)?;
        Ok(Self::join(handles).await)
    }
}
