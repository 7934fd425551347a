//! GATT layout and command format of the target device
//!
//! The device exposes one primary service with a write characteristic
//! for 4-byte commands and a notify characteristic for state reports.
//! No pairing or authentication is required to use either.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::transport::ChannelId;
use crate::scan::{CharProperty, CharacteristicProfile, ServiceProfile};

/// Primary device service UUID.
pub const SERVICE_UUID: Uuid = Uuid::from_u128(0x4fafc201_1fb5_459e_8fcc_c5c9c331914b);

/// Characteristic UUID accepting command writes.
pub const COMMAND_CHAR_UUID: Uuid = Uuid::from_u128(0xbeb5483e_36e1_4688_b7f5_ea07361b26a8);

/// Characteristic UUID emitting state notifications.
pub const NOTIFY_CHAR_UUID: Uuid = Uuid::from_u128(0xbeb5483f_36e1_4688_b7f5_ea07361b26a8);

/// Generic Access service present on every peripheral.
pub const GENERIC_ACCESS_UUID: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);

/// Device Name characteristic of the Generic Access service.
pub const DEVICE_NAME_CHAR_UUID: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);

/// Resolve the characteristic UUID backing a logical channel.
pub fn characteristic_uuid(channel: ChannelId) -> Uuid {
    match channel {
        ChannelId::Command => COMMAND_CHAR_UUID,
        ChannelId::Notify => NOTIFY_CHAR_UUID,
    }
}

/// The GATT table the device firmware serves.
pub fn device_services() -> Vec<ServiceProfile> {
    vec![
        ServiceProfile {
            uuid: GENERIC_ACCESS_UUID.to_string(),
            characteristics: vec![CharacteristicProfile::new(
                DEVICE_NAME_CHAR_UUID.to_string(),
                vec![CharProperty::Read],
            )],
        },
        ServiceProfile {
            uuid: SERVICE_UUID.to_string(),
            characteristics: vec![
                CharacteristicProfile::new(
                    COMMAND_CHAR_UUID.to_string(),
                    vec![CharProperty::Write],
                ),
                CharacteristicProfile::new(
                    NOTIFY_CHAR_UUID.to_string(),
                    vec![CharProperty::Notify],
                ),
            ],
        },
    ]
}

/// Opcode bytes understood by the device firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Opcode {
    SetMode,
    SetLed,
    SetBrightness,
    SetTimer,
    Reset,
    AuthRequest,
}

impl Opcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Opcode::SetMode),
            0x02 => Some(Opcode::SetLed),
            0x03 => Some(Opcode::SetBrightness),
            0x04 => Some(Opcode::SetTimer),
            0x05 => Some(Opcode::Reset),
            0x10 => Some(Opcode::AuthRequest),
            _ => None,
        }
    }

    pub fn byte(&self) -> u8 {
        match self {
            Opcode::SetMode => 0x01,
            Opcode::SetLed => 0x02,
            Opcode::SetBrightness => 0x03,
            Opcode::SetTimer => 0x04,
            Opcode::Reset => 0x05,
            Opcode::AuthRequest => 0x10,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Opcode::SetMode => "SET_MODE",
            Opcode::SetLed => "SET_LED",
            Opcode::SetBrightness => "SET_BRIGHTNESS",
            Opcode::SetTimer => "SET_TIMER",
            Opcode::Reset => "RESET",
            Opcode::AuthRequest => "AUTH_REQUEST",
        }
    }
}

/// A named byte payload destined for the command characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    /// Stable identifier, e.g. `hijack-turbo` or `Overflow_64B`.
    pub id: String,
    /// Raw bytes written to the characteristic.
    pub payload: Vec<u8>,
    /// Human-readable description for logs and reports.
    pub description: String,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            payload: payload.into(),
            description: description.into(),
        }
    }

    /// Lower-case hex of the full payload.
    pub fn payload_hex(&self) -> String {
        hex::encode(&self.payload)
    }

    /// Hex of at most the first 32 bytes, with a trailing `...` when cut.
    pub fn preview(&self) -> String {
        let shown = &self.payload[..self.payload.len().min(32)];
        let mut preview = hex::encode(shown);
        if self.payload.len() > 32 {
            preview.push_str("...");
        }
        preview
    }
}

/// No-op written periodically to keep the link from idling out.
pub fn keep_alive_command() -> CommandSpec {
    CommandSpec::new("keep-alive", [0xFF, 0x00, 0x00, 0x00], "No-op keep-alive write")
}

/// Printable-ASCII rendering of bytes, `.` for everything else.
pub fn ascii_preview(data: &[u8]) -> String {
    data.iter()
        .map(|&b| if (32..=126).contains(&b) { b as char } else { '.' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opcode_round_trip() {
        for byte in [0x01, 0x02, 0x03, 0x04, 0x05, 0x10] {
            let op = Opcode::from_byte(byte).unwrap();
            assert_eq!(op.byte(), byte);
        }
        assert_eq!(Opcode::from_byte(0xFF), None);
        assert_eq!(Opcode::from_byte(0x10).unwrap().name(), "AUTH_REQUEST");
    }

    #[test]
    fn test_characteristic_uuids() {
        assert_eq!(
            characteristic_uuid(ChannelId::Command).to_string(),
            "beb5483e-36e1-4688-b7f5-ea07361b26a8"
        );
        assert_eq!(
            SERVICE_UUID.to_string(),
            "4fafc201-1fb5-459e-8fcc-c5c9c331914b"
        );
    }

    #[test]
    fn test_device_services_expose_unauthenticated_channels() {
        let services = device_services();
        let device = services
            .iter()
            .find(|s| s.uuid == SERVICE_UUID.to_string())
            .unwrap();
        assert!(device.characteristics[0].is_writable());
        assert!(device.characteristics[1].notifies());
        assert!(services.iter().all(|s| s.characteristics.iter().all(|c| !c.command_response)));
    }

    #[test]
    fn test_preview_truncates() {
        let long = CommandSpec::new("long", vec![0x41; 64], "");
        assert_eq!(long.preview(), format!("{}...", "41".repeat(32)));

        let short = keep_alive_command();
        assert_eq!(short.preview(), "ff000000");
        assert_eq!(ascii_preview(b"A\x00B"), "A.B");
    }
}
