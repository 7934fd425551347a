//! BLE transport layer
//!
//! Provides the transport adapter trait the session controller drives,
//! an in-process simulated peer for testing and dry runs, the target
//! device's GATT layout, and (behind `ble-central`) a btleplug-backed
//! transport for real hardware.

#[cfg(feature = "ble-central")]
pub mod central;
pub mod gatt;
pub mod simulated;
pub mod transport;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("GATT error: {0}")]
    GattError(String),

    #[error("Service {0} not found on peer")]
    ServiceNotFound(String),

    #[error("Characteristic {0} not found on peer")]
    CharacteristicNotFound(String),

    #[error("Invalid BLE address: {0}")]
    InvalidAddress(String),

    #[error("No BLE adapter available")]
    NoAdapter,

    #[error("Peer disconnected")]
    Disconnected,

    #[error("Operation timed out")]
    Timeout,
}
