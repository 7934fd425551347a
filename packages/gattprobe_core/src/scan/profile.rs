//! Advertisement and GATT profile records

use std::collections::BTreeMap;

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};

use crate::ble::transport::BleAddress;
use crate::extract::Severity;

fn address_as_text<S: Serializer>(address: &BleAddress, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_str(address)
}

/// A device heard during a scan window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredDevice {
    #[serde(serialize_with = "address_as_text")]
    pub address: BleAddress,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    /// Company identifier to hex payload.
    pub manufacturer_data: BTreeMap<u16, String>,
    pub service_uuids: Vec<String>,
    pub seen_at: DateTime<Local>,
}

impl DiscoveredDevice {
    pub fn new(address: BleAddress, name: Option<String>, rssi: Option<i16>) -> Self {
        Self {
            address,
            name,
            rssi,
            manufacturer_data: BTreeMap::new(),
            service_uuids: Vec::new(),
            seen_at: Local::now(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("Unknown")
    }
}

/// GATT characteristic property bits the scanner cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CharProperty {
    Read,
    Write,
    WriteWithoutResponse,
    Notify,
    Indicate,
}

/// Access an unauthenticated client gets to a characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    Read,
    Write,
    Notify,
    Indicate,
}

/// Collapse properties into permissions; either write flavour is `WRITE`.
pub fn permissions(properties: &[CharProperty]) -> Vec<Permission> {
    let mut granted: Vec<Permission> = properties
        .iter()
        .map(|p| match p {
            CharProperty::Read => Permission::Read,
            CharProperty::Write | CharProperty::WriteWithoutResponse => Permission::Write,
            CharProperty::Notify => Permission::Notify,
            CharProperty::Indicate => Permission::Indicate,
        })
        .collect();
    granted.sort();
    granted.dedup();
    granted
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicProfile {
    pub uuid: String,
    pub properties: Vec<CharProperty>,
    pub permissions: Vec<Permission>,
    /// Writable and notifying: a command/response channel open to anyone.
    pub command_response: bool,
}

impl CharacteristicProfile {
    pub fn new(uuid: impl Into<String>, properties: Vec<CharProperty>) -> Self {
        let permissions = permissions(&properties);
        let command_response = permissions.contains(&Permission::Write)
            && properties.contains(&CharProperty::Notify);
        Self {
            uuid: uuid.into(),
            properties,
            permissions,
            command_response,
        }
    }

    pub fn is_writable(&self) -> bool {
        self.permissions.contains(&Permission::Write)
    }

    pub fn notifies(&self) -> bool {
        self.permissions.contains(&Permission::Notify)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceProfile {
    pub uuid: String,
    pub characteristics: Vec<CharacteristicProfile>,
}

/// A weakness evidenced by a device's advertisement or GATT table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanFinding {
    pub id: &'static str,
    pub severity: Severity,
    pub description: String,
}

/// Judge one enumerated device.
///
/// * `VULN-01` writable characteristics with no authentication in front.
/// * `VULN-02` notify characteristics anyone can subscribe to.
/// * `VULN-03` an ESP32 name, a platform with weak default BLE security.
pub fn assess_device(device: &DiscoveredDevice, services: &[ServiceProfile]) -> Vec<ScanFinding> {
    let characteristics = || services.iter().flat_map(|s| s.characteristics.iter());
    let writable = characteristics().filter(|c| c.is_writable()).count();
    let notifying = characteristics().filter(|c| c.notifies()).count();

    let mut findings = Vec::new();
    if writable > 0 {
        findings.push(ScanFinding {
            id: "VULN-01",
            severity: Severity::High,
            description: format!(
                "Found {} writable characteristic(s) - No authentication detected",
                writable
            ),
        });
    }
    if notifying > 0 {
        findings.push(ScanFinding {
            id: "VULN-02",
            severity: Severity::Medium,
            description: format!(
                "Found {} notify characteristic(s) - Passive sniffing possible",
                notifying
            ),
        });
    }
    if device.display_name().contains("ESP32") {
        findings.push(ScanFinding {
            id: "VULN-03",
            severity: Severity::Medium,
            description: "ESP32 device - Known for weak BLE security implementations".to_string(),
        });
    }
    findings
}

/// Enumeration result and verdict for one target.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceAnalysis {
    pub device: DiscoveredDevice,
    pub services: Vec<ServiceProfile>,
    pub findings: Vec<ScanFinding>,
}

impl DeviceAnalysis {
    pub fn new(device: DiscoveredDevice, services: Vec<ServiceProfile>) -> Self {
        let findings = assess_device(&device, &services);
        Self {
            device,
            services,
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: Option<&str>) -> DiscoveredDevice {
        let address = BleAddress([0xEC, 0xE3, 0x34, 0xB2, 0xE0, 0xC2]);
        DiscoveredDevice::new(address, name.map(String::from), Some(-61))
    }

    #[test]
    fn test_permissions_merge_write_flavours() {
        let perms = permissions(&[
            CharProperty::Notify,
            CharProperty::WriteWithoutResponse,
            CharProperty::Write,
            CharProperty::Read,
        ]);
        assert_eq!(perms, vec![Permission::Read, Permission::Write, Permission::Notify]);
    }

    #[test]
    fn test_command_response_flag() {
        let both = CharacteristicProfile::new("c", vec![CharProperty::Write, CharProperty::Notify]);
        assert!(both.command_response);

        let write_only = CharacteristicProfile::new("c", vec![CharProperty::Write]);
        assert!(!write_only.command_response);

        let indicate =
            CharacteristicProfile::new("c", vec![CharProperty::Write, CharProperty::Indicate]);
        assert!(!indicate.command_response);
    }

    #[test]
    fn test_findings_for_open_esp32() {
        let services = vec![ServiceProfile {
            uuid: "s".to_string(),
            characteristics: vec![
                CharacteristicProfile::new("cmd", vec![CharProperty::Write]),
                CharacteristicProfile::new("state", vec![CharProperty::Notify]),
            ],
        }];
        let analysis = DeviceAnalysis::new(device(Some("ESP32_P1")), services);
        let ids: Vec<&str> = analysis.findings.iter().map(|f| f.id).collect();
        assert_eq!(ids, vec!["VULN-01", "VULN-02", "VULN-03"]);
        assert!(analysis.findings[0].description.starts_with("Found 1 writable"));
    }

    #[test]
    fn test_no_findings_for_read_only_device() {
        let services = vec![ServiceProfile {
            uuid: "s".to_string(),
            characteristics: vec![CharacteristicProfile::new("name", vec![CharProperty::Read])],
        }];
        assert!(assess_device(&device(None), &services).is_empty());
        assert_eq!(device(None).display_name(), "Unknown");
    }

    #[test]
    fn test_device_serializes_address_as_text() {
        let value = serde_json::to_value(device(Some("IoT-Lamp"))).unwrap();
        assert_eq!(value["address"], "EC:E3:34:B2:E0:C2");
        assert_eq!(value["name"], "IoT-Lamp");
        assert_eq!(value["rssi"], -61);
    }
}
