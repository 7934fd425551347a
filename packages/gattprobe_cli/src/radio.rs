// Radio selection: the simulated peer, or the host's BLE adapter opened on
// first use.

use anyhow::{anyhow, Result};

use gattprobe::ble::simulated::SimPeripheral;
use gattprobe::scan::BleScanner;
use gattprobe::BleTransport;

/// Something that can both scan and carry a session.
trait Device: BleTransport + BleScanner {
    fn as_scanner(&mut self) -> &mut dyn BleScanner;

    fn into_transport(self: Box<Self>) -> Box<dyn BleTransport>;
}

impl<T: BleTransport + BleScanner + 'static> Device for T {
    fn as_scanner(&mut self) -> &mut dyn BleScanner {
        self
    }

    fn into_transport(self: Box<Self>) -> Box<dyn BleTransport> {
        self
    }
}

pub struct Radio {
    device: Option<Box<dyn Device>>,
}

impl Radio {
    pub fn simulated(peer: SimPeripheral) -> Self {
        log::warn!("[*] Using the simulated peer, nothing goes over the air");
        Self {
            device: Some(Box::new(peer)),
        }
    }

    /// The host adapter. Nothing is opened until a command needs it.
    pub fn hardware() -> Self {
        Self { device: None }
    }

    async fn device(&mut self) -> Result<&mut Box<dyn Device>> {
        if self.device.is_none() {
            self.device = Some(open_central().await?);
        }
        self.device
            .as_mut()
            .ok_or_else(|| anyhow!("No BLE radio available"))
    }

    pub async fn scanner(&mut self) -> Result<&mut dyn BleScanner> {
        Ok(self.device().await?.as_scanner())
    }

    /// Hand the radio over to a session controller.
    pub async fn into_transport(mut self) -> Result<Box<dyn BleTransport>> {
        self.device().await?;
        self.device
            .take()
            .map(|device| device.into_transport())
            .ok_or_else(|| anyhow!("No BLE radio available"))
    }
}

#[cfg(feature = "ble-central")]
async fn open_central() -> Result<Box<dyn Device>> {
    use anyhow::Context;

    let transport = gattprobe::ble::central::BtleplugTransport::new()
        .await
        .context("Failed to open a BLE adapter")?;
    Ok(Box::new(transport))
}

#[cfg(not(feature = "ble-central"))]
async fn open_central() -> Result<Box<dyn Device>> {
    anyhow::bail!(
        "Built without BLE support; rebuild with --features ble-central or pass --simulate"
    )
}
