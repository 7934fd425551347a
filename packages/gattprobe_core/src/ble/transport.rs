//! BLE transport trait definitions and core types
//!
//! Defines the abstract single-peer transport that both the simulated
//! peer and the btleplug central conform to. Every operation may fail and
//! the link may drop at any time; the session controller is the only
//! caller.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::BleError;

/// A 6-byte BLE device address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BleAddress(pub [u8; 6]);

impl FromStr for BleAddress {
    type Err = BleError;

    /// Parses `AA:BB:CC:DD:EE:FF` (case insensitive, `-` also accepted).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(BleError::InvalidAddress(s.to_string()));
        }
        let mut bytes = [0u8; 6];
        for (slot, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 {
                return Err(BleError::InvalidAddress(s.to_string()));
            }
            *slot = u8::from_str_radix(part, 16)
                .map_err(|_| BleError::InvalidAddress(s.to_string()))?;
        }
        Ok(BleAddress(bytes))
    }
}

impl fmt::Display for BleAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// The two GATT characteristics the toolkit talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelId {
    /// Write characteristic that accepts device commands.
    Command,
    /// Notify characteristic that reports device state.
    Notify,
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelId::Command => write!(f, "command"),
            ChannelId::Notify => write!(f, "notify"),
        }
    }
}

/// Whether a write waits for the peer's ATT acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// A notification pushed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: ChannelId,
    pub data: Vec<u8>,
}

/// Where a transport delivers notifications, in arrival order.
pub type NotificationSink = mpsc::UnboundedSender<Notification>;

/// A logical connection to exactly one BLE peer.
#[async_trait]
pub trait BleTransport: Send + Sync {
    /// Open the link to `address`, giving up after `timeout`.
    async fn connect(&mut self, address: &BleAddress, timeout: Duration) -> Result<(), BleError>;

    /// Check whether the link is still up.
    async fn is_connected(&self) -> bool;

    /// Write `data` to `channel`.
    async fn write(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError>;

    /// Start forwarding notifications from `channel` into `sink`.
    async fn subscribe(&mut self, channel: ChannelId, sink: NotificationSink)
        -> Result<(), BleError>;

    /// Close the link. Safe to call when already disconnected.
    async fn disconnect(&mut self) -> Result<(), BleError>;

    /// Get the current RSSI (if supported).
    async fn rssi(&self) -> Option<i16>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        let addr: BleAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(addr, BleAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");

        let dashed: BleAddress = "EC-E3-34-B2-E0-C2".parse().unwrap();
        assert_eq!(dashed.to_string(), "EC:E3:34:B2:E0:C2");
    }

    #[test]
    fn test_parse_address_rejects_garbage() {
        assert!("AA:BB:CC:DD:EE".parse::<BleAddress>().is_err());
        assert!("AA:BB:CC:DD:EE:GG".parse::<BleAddress>().is_err());
        assert!("AAA:BB:CC:DD:EE:F".parse::<BleAddress>().is_err());
        assert!("".parse::<BleAddress>().is_err());
    }
}
