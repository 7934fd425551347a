//! Real BLE central transport backed by btleplug
//!
//! Only built with the `ble-central` feature. Uses the first adapter the
//! platform reports and locates the peer by scanning for its address. The
//! same adapter serves reconnaissance scans and GATT enumeration.

use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CharPropFlags, Characteristic, Manager as _, Peripheral as _, ScanFilter,
    WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures_util::StreamExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::gatt::{characteristic_uuid, SERVICE_UUID};
use super::transport::{
    BleAddress, BleTransport, ChannelId, Notification, NotificationSink, WriteMode,
};
use super::BleError;
use crate::scan::{
    BleScanner, CharProperty, CharacteristicProfile, DiscoveredDevice, ServiceProfile,
};

const SCAN_POLL: Duration = Duration::from_millis(250);

fn gatt_error(e: btleplug::Error) -> BleError {
    BleError::GattError(e.to_string())
}

fn connection_error(e: btleplug::Error) -> BleError {
    BleError::ConnectionError(e.to_string())
}

/// A btleplug peripheral connection.
pub struct BtleplugTransport {
    adapter: Adapter,
    peripheral: Option<Peripheral>,
    command: Option<Characteristic>,
    notify: Option<Characteristic>,
    forwarder: Option<JoinHandle<()>>,
}

impl BtleplugTransport {
    /// Open the first available adapter.
    pub async fn new() -> Result<Self, BleError> {
        let manager = Manager::new().await.map_err(connection_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(connection_error)?
            .into_iter()
            .next()
            .ok_or(BleError::NoAdapter)?;
        if let Ok(info) = adapter.adapter_info().await {
            log::info!("Using BLE adapter {}", info);
        }
        Ok(Self {
            adapter,
            peripheral: None,
            command: None,
            notify: None,
            forwarder: None,
        })
    }

    async fn find(&self, address: &BleAddress, timeout: Duration) -> Result<Peripheral, BleError> {
        let target = BDAddr::from(address.0);
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(connection_error)?;

        let deadline = Instant::now() + timeout;
        let found = loop {
            let peripherals = self.adapter.peripherals().await.map_err(connection_error)?;
            if let Some(peripheral) = peripherals.into_iter().find(|p| p.address() == target) {
                break Ok(peripheral);
            }
            if Instant::now() >= deadline {
                break Err(BleError::Timeout);
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("Failed to stop scan cleanly: {}", e);
        }
        found
    }

    fn stop_forwarding(&mut self) {
        if let Some(task) = self.forwarder.take() {
            task.abort();
        }
    }

    fn characteristic(
        &self,
        channel: ChannelId,
    ) -> Result<(&Peripheral, &Characteristic), BleError> {
        let peripheral = self.peripheral.as_ref().ok_or(BleError::Disconnected)?;
        let characteristic = match channel {
            ChannelId::Command => self.command.as_ref(),
            ChannelId::Notify => self.notify.as_ref(),
        }
        .ok_or_else(|| BleError::CharacteristicNotFound(characteristic_uuid(channel).to_string()))?;
        Ok((peripheral, characteristic))
    }
}

fn char_properties(flags: CharPropFlags) -> Vec<CharProperty> {
    [
        (CharPropFlags::READ, CharProperty::Read),
        (CharPropFlags::WRITE, CharProperty::Write),
        (CharPropFlags::WRITE_WITHOUT_RESPONSE, CharProperty::WriteWithoutResponse),
        (CharPropFlags::NOTIFY, CharProperty::Notify),
        (CharPropFlags::INDICATE, CharProperty::Indicate),
    ]
    .into_iter()
    .filter(|(flag, _)| flags.contains(*flag))
    .map(|(_, property)| property)
    .collect()
}

#[async_trait]
impl BleScanner for BtleplugTransport {
    async fn scan(&mut self, window: Duration) -> Result<Vec<DiscoveredDevice>, BleError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(connection_error)?;
        tokio::time::sleep(window).await;
        if let Err(e) = self.adapter.stop_scan().await {
            log::debug!("Failed to stop scan cleanly: {}", e);
        }

        let mut heard = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(connection_error)? {
            let Ok(Some(props)) = peripheral.properties().await else {
                continue;
            };
            let mut device = DiscoveredDevice::new(
                BleAddress(props.address.into_inner()),
                props.local_name,
                props.rssi,
            );
            device.manufacturer_data = props
                .manufacturer_data
                .into_iter()
                .map(|(company, data)| (company, hex::encode(data)))
                .collect();
            device.service_uuids = props.services.iter().map(|u| u.to_string()).collect();
            heard.push(device);
        }
        Ok(heard)
    }

    async fn enumerate(
        &mut self,
        address: &BleAddress,
        timeout: Duration,
    ) -> Result<Vec<ServiceProfile>, BleError> {
        let peripheral = self.find(address, timeout).await?;
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| BleError::Timeout)?
            .map_err(connection_error)?;

        let discovered = peripheral.discover_services().await.map_err(gatt_error);
        let services = peripheral
            .services()
            .into_iter()
            .map(|service| ServiceProfile {
                uuid: service.uuid.to_string(),
                characteristics: service
                    .characteristics
                    .iter()
                    .map(|c| {
                        let properties = char_properties(c.properties);
                        CharacteristicProfile::new(c.uuid.to_string(), properties)
                    })
                    .collect(),
            })
            .collect();

        if let Err(e) = peripheral.disconnect().await {
            log::debug!("Failed to disconnect after enumeration: {}", e);
        }
        discovered.map(|()| services)
    }
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn connect(&mut self, address: &BleAddress, timeout: Duration) -> Result<(), BleError> {
        self.stop_forwarding();
        let peripheral = self.find(address, timeout).await?;

        if !peripheral.is_connected().await.map_err(connection_error)? {
            peripheral.connect().await.map_err(connection_error)?;
        }
        peripheral.discover_services().await.map_err(gatt_error)?;

        if !peripheral.services().iter().any(|s| s.uuid == SERVICE_UUID) {
            return Err(BleError::ServiceNotFound(SERVICE_UUID.to_string()));
        }
        let characteristics = peripheral.characteristics();
        let lookup = |channel: ChannelId| {
            let uuid = characteristic_uuid(channel);
            characteristics
                .iter()
                .find(|c| c.uuid == uuid)
                .cloned()
                .ok_or_else(|| BleError::CharacteristicNotFound(uuid.to_string()))
        };
        self.command = Some(lookup(ChannelId::Command)?);
        self.notify = lookup(ChannelId::Notify).ok();
        self.peripheral = Some(peripheral);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        match &self.peripheral {
            Some(peripheral) => peripheral.is_connected().await.unwrap_or(false),
            None => false,
        }
    }

    async fn write(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        if channel != ChannelId::Command {
            return Err(BleError::GattError(format!("{} channel is not writable", channel)));
        }
        let (peripheral, characteristic) = self.characteristic(channel)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(characteristic, data, write_type)
            .await
            .map_err(gatt_error)
    }

    async fn subscribe(
        &mut self,
        channel: ChannelId,
        sink: NotificationSink,
    ) -> Result<(), BleError> {
        let (peripheral, characteristic) = self.characteristic(channel)?;
        peripheral.subscribe(characteristic).await.map_err(gatt_error)?;
        let mut stream = peripheral.notifications().await.map_err(gatt_error)?;
        let uuid = characteristic.uuid;

        self.stop_forwarding();
        self.forwarder = Some(tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                let forwarded = sink.send(Notification {
                    channel,
                    data: notification.value,
                });
                if forwarded.is_err() {
                    break;
                }
            }
        }));
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.stop_forwarding();
        if let Some(peripheral) = &self.peripheral {
            if peripheral.is_connected().await.unwrap_or(false) {
                peripheral.disconnect().await.map_err(connection_error)?;
            }
        }
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        let peripheral = self.peripheral.as_ref()?;
        peripheral.properties().await.ok().flatten().and_then(|p| p.rssi)
    }
}
