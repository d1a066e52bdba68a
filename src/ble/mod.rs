//! BLE client layer for the UART echo test
//!
//! Provides the GATT client abstraction consumed by the echo core, typed
//! device events, GATT identifiers for the UART service, and an in-process
//! simulated peripheral for testing without hardware.

pub mod events;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

/// Failures reported by the underlying BLE stack.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("BLE stack not initialized")]
    NotInitialized,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Peer disconnected")]
    Disconnected,
}
