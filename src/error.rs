//! Custom error types for the station controller.
//!
//! Two severities are kept strictly apart:
//!
//! - **Channel-fatal** errors are `StationError` values. They unwind a phase
//!   handler through `?`, abort the remaining queued phases of that channel and
//!   surface to whoever joined the channel task.
//! - **Per-DUT** faults are never errors at this level. They are recorded on the
//!   DUT itself as a [`DutFault`](crate::dut::DutFault) and the sequencer moves on
//!   to the next slot.
//!
//! `TransportError` sits between the two: it is what the fixture driver returns,
//! and the sequencer decides per call site whether it is contained on the DUT
//! (I2C adapter faults) or converted into a `StationError` with `?`.
//!
//! ## Error Hierarchy
//!
//! - **`Config`**: figment failed to read or extract the station configuration.
//! - **`Configuration`**: semantic problems in otherwise well-formed configuration
//!   (duplicate channel ids, zero interval, ...) and in test-limit documents.
//! - **`Transport`**: a fixture-controller fault that was not contained per DUT.
//! - **`Barcode`**, **`UnknownProductType`**, **`Mode4in1*`**: rejected slot
//!   assignments detected during channel initialization.
//! - **`Export`**: the mandatory XML export of results failed.
//! - **`Archive`**: appending to the CSV archive failed; teardown only logs it.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, StationError>;

/// Channel-fatal error type.
#[derive(Error, Debug)]
pub enum StationError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Malformed barcode '{0}'")]
    Barcode(String),

    #[error("Unknown product type '{0}'")]
    UnknownProductType(String),

    #[error("This partnumber {0} does not support Mode4in1")]
    Mode4in1Unsupported(String),

    #[error("This partnumber {0} NEED Mode4in1")]
    Mode4in1Required(String),

    #[error("No test configuration for {part_number} revision {revision}")]
    MissingTestConfig {
        part_number: String,
        revision: String,
    },

    #[error("Result export failed: {0}")]
    Export(String),

    #[error("Result archive error: {0}")]
    Archive(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Channel {0} aborted")]
    ChannelAborted(u8),
}

impl From<figment::Error> for StationError {
    fn from(err: figment::Error) -> Self {
        StationError::Config(Box::new(err))
    }
}

/// Faults raised by the fixture-controller link and its I2C pass-through.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The I2C pass-through to the DUT did not acknowledge. Retryable per DUT.
    #[error("I2C adapter fault: {0}")]
    Adapter(String),

    /// The fixture controller rejected a command for one port.
    #[error("UART communication failure: {0}")]
    Communication(String),

    /// The fixture controller is unreachable; affects every slot on the board.
    #[error("Fixture link down: {0}")]
    Link(String),

    /// The reply was structurally wrong (bad echo, short payload, wrong firmware).
    #[error("Fixture protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether this fault is the I2C adapter condition the sequencer contains per DUT.
    pub fn is_adapter_fault(&self) -> bool {
        matches!(self, TransportError::Adapter(_))
    }

    /// Whether this fault stays with the slot it was raised for.
    pub fn is_slot_fault(&self) -> bool {
        matches!(
            self,
            TransportError::Adapter(_) | TransportError::Communication(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StationError::Mode4in1Required("AGIGA9822-004BCA".to_string());
        assert_eq!(
            err.to_string(),
            "This partnumber AGIGA9822-004BCA NEED Mode4in1"
        );
    }

    #[test]
    fn test_transport_error_converts() {
        let err: StationError = TransportError::Protocol("short reply".into()).into();
        assert!(err.to_string().contains("short reply"));
    }

    #[test]
    fn test_adapter_fault_classification() {
        assert!(TransportError::Adapter("nack".into()).is_adapter_fault());
        assert!(!TransportError::Communication("nack".into()).is_adapter_fault());
        assert!(!TransportError::Protocol("echo".into()).is_adapter_fault());
    }

    #[test]
    fn test_slot_fault_classification() {
        assert!(TransportError::Adapter("nack".into()).is_slot_fault());
        assert!(TransportError::Communication("nack".into()).is_slot_fault());
        assert!(!TransportError::Link("timeout".into()).is_slot_fault());
        assert!(!TransportError::Protocol("echo".into()).is_slot_fault());
    }
}
