// gattprobe - Resilient BLE GATT session controller

pub mod ble;
pub mod campaign;
pub mod event_log;
pub mod extract;
pub mod scan;
pub mod session;

pub use ble::transport::{BleAddress, BleTransport};
pub use ble::BleError;
pub use event_log::{EventKind, EventLog};
pub use session::{SessionConfig, SessionController, SessionDuration};
