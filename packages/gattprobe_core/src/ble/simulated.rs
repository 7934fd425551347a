//! In-process simulated peer
//!
//! `SimPeripheral` implements `BleTransport` against a scripted device
//! instead of a radio. A cloned `SimHandle` lets tests (and `--simulate`
//! runs) drop the link, make the peer unreachable, arm crash triggers and
//! inspect every call the controller made. The peer also answers scans and
//! GATT enumeration, alongside any scripted bystander devices. All timing
//! uses tokio time, so paused clocks advance instantly in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::gatt::{device_services, SERVICE_UUID};
use super::transport::{
    BleAddress, BleTransport, ChannelId, Notification, NotificationSink, WriteMode,
};
use super::BleError;
use crate::scan::{BleScanner, DiscoveredDevice, ServiceProfile};

/// Advertised name of a fresh simulated peer.
pub const SIM_DEVICE_NAME: &str = "ESP32_P1";

/// Signal strength the simulated peer reports.
const SIM_RSSI: i16 = -50;

/// Scripted behaviour of the simulated device.
#[derive(Debug, Clone)]
struct SimBehaviour {
    /// Advertised local name, if any.
    name: Option<String>,
    /// Other devices heard during a scan.
    bystanders: Vec<DiscoveredDevice>,
    /// Remaining connect attempts that fail before one succeeds.
    failing_connects: usize,
    /// Every connect attempt fails while set.
    unreachable: bool,
    /// Connect stalls forever, so only the caller's timeout ends it.
    hang_on_connect: bool,
    /// Link drops this long after each successful connect.
    drop_every: Option<Duration>,
    /// Writes of these exact payloads crash the device.
    crash_triggers: Vec<Vec<u8>>,
    /// Writes of these exact payloads are rejected by the peer.
    reject_triggers: Vec<Vec<u8>>,
    /// Writes of these exact payloads fail because the link drops mid-write.
    sever_triggers: Vec<Vec<u8>>,
    /// Writes of these exact payloads crash the device for good.
    brick_triggers: Vec<Vec<u8>>,
    /// Subscriptions fail while set.
    subscribe_fails: bool,
    /// Notifications emitted in reply to specific payloads.
    responses: HashMap<Vec<u8>, Vec<u8>>,
}

impl Default for SimBehaviour {
    fn default() -> Self {
        Self {
            name: Some(SIM_DEVICE_NAME.to_string()),
            bystanders: Vec::new(),
            failing_connects: 0,
            unreachable: false,
            hang_on_connect: false,
            drop_every: None,
            crash_triggers: Vec::new(),
            reject_triggers: Vec::new(),
            sever_triggers: Vec::new(),
            brick_triggers: Vec::new(),
            subscribe_fails: false,
            responses: HashMap::new(),
        }
    }
}

/// One recorded write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub channel: ChannelId,
    pub data: Vec<u8>,
    pub mode: WriteMode,
}

#[derive(Debug)]
struct SimLink {
    connected: AtomicBool,
    connected_at: Mutex<Option<Instant>>,
    behaviour: Mutex<SimBehaviour>,
    sink: Mutex<Option<NotificationSink>>,
    writes: Mutex<Vec<RecordedWrite>>,
    connect_attempts: AtomicUsize,
    disconnect_calls: AtomicUsize,
    subscribe_calls: AtomicUsize,
    status_queries: AtomicUsize,
    scans: AtomicUsize,
    enumerations: AtomicUsize,
}

/// Lock a std mutex, recovering the data if a test thread panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimLink {
    fn live(&self) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            return false;
        }
        let drop_every = lock(&self.behaviour).drop_every;
        if let (Some(interval), Some(since)) = (drop_every, *lock(&self.connected_at)) {
            if since.elapsed() >= interval {
                self.connected.store(false, Ordering::SeqCst);
                return false;
            }
        }
        true
    }

    fn notify(&self, channel: ChannelId, data: Vec<u8>) {
        if let Some(sink) = lock(&self.sink).as_ref() {
            let _ = sink.send(Notification { channel, data });
        }
    }
}

/// A simulated single-connection BLE peripheral.
pub struct SimPeripheral {
    address: BleAddress,
    link: Arc<SimLink>,
}

/// Test-side control over a `SimPeripheral`.
#[derive(Clone)]
pub struct SimHandle {
    link: Arc<SimLink>,
}

impl SimPeripheral {
    /// Create a cooperative peer at `address` plus a handle to script it.
    pub fn new(address: BleAddress) -> (Self, SimHandle) {
        let link = Arc::new(SimLink {
            connected: AtomicBool::new(false),
            connected_at: Mutex::new(None),
            behaviour: Mutex::new(SimBehaviour::default()),
            sink: Mutex::new(None),
            writes: Mutex::new(Vec::new()),
            connect_attempts: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            subscribe_calls: AtomicUsize::new(0),
            status_queries: AtomicUsize::new(0),
            scans: AtomicUsize::new(0),
            enumerations: AtomicUsize::new(0),
        });
        let handle = SimHandle {
            link: Arc::clone(&link),
        };
        (Self { address, link }, handle)
    }
}

impl SimHandle {
    /// Drop the link right now, as if the peer reset.
    pub fn drop_link(&self) {
        self.link.connected.store(false, Ordering::SeqCst);
    }

    /// Make every subsequent connect attempt fail (or succeed again).
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.link.behaviour).unreachable = unreachable;
    }

    /// Fail the next `count` connect attempts.
    pub fn fail_next_connects(&self, count: usize) {
        lock(&self.link.behaviour).failing_connects = count;
    }

    /// Make connect attempts hang until the caller times out.
    pub fn hang_on_connect(&self, hang: bool) {
        lock(&self.link.behaviour).hang_on_connect = hang;
    }

    /// Drop the link `interval` after every successful connect.
    pub fn drop_every(&self, interval: Duration) {
        lock(&self.link.behaviour).drop_every = Some(interval);
    }

    /// Crash (drop the link) whenever exactly `payload` is written.
    pub fn crash_on(&self, payload: impl Into<Vec<u8>>) {
        lock(&self.link.behaviour).crash_triggers.push(payload.into());
    }

    /// Crash whenever exactly `payload` is written and stay unreachable.
    pub fn brick_on(&self, payload: impl Into<Vec<u8>>) {
        lock(&self.link.behaviour).brick_triggers.push(payload.into());
    }

    /// Reject writes of exactly `payload` with a GATT error.
    pub fn reject_on(&self, payload: impl Into<Vec<u8>>) {
        lock(&self.link.behaviour).reject_triggers.push(payload.into());
    }

    /// Drop the link in the middle of writing exactly `payload`, failing the write.
    pub fn sever_on(&self, payload: impl Into<Vec<u8>>) {
        lock(&self.link.behaviour).sever_triggers.push(payload.into());
    }

    /// Make notification subscriptions fail.
    pub fn fail_subscriptions(&self, fail: bool) {
        lock(&self.link.behaviour).subscribe_fails = fail;
    }

    /// Emit `response` on the notify channel whenever `trigger` is written.
    pub fn respond_to(&self, trigger: impl Into<Vec<u8>>, response: impl Into<Vec<u8>>) {
        lock(&self.link.behaviour)
            .responses
            .insert(trigger.into(), response.into());
    }

    /// Change (or clear) the advertised name.
    pub fn set_name(&self, name: Option<&str>) {
        lock(&self.link.behaviour).name = name.map(String::from);
    }

    /// Add another device that shows up in scans but cannot be connected.
    pub fn add_bystander(&self, address: BleAddress, name: Option<&str>, rssi: i16) {
        lock(&self.link.behaviour)
            .bystanders
            .push(DiscoveredDevice::new(address, name.map(String::from), Some(rssi)));
    }

    /// Push an unsolicited notification to the subscriber, if any.
    pub fn push_notification(&self, data: impl Into<Vec<u8>>) {
        self.link.notify(ChannelId::Notify, data.into());
    }

    pub fn connect_attempts(&self) -> usize {
        self.link.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.link.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn subscribe_calls(&self) -> usize {
        self.link.subscribe_calls.load(Ordering::SeqCst)
    }

    pub fn status_queries(&self) -> usize {
        self.link.status_queries.load(Ordering::SeqCst)
    }

    pub fn scans(&self) -> usize {
        self.link.scans.load(Ordering::SeqCst)
    }

    pub fn enumerations(&self) -> usize {
        self.link.enumerations.load(Ordering::SeqCst)
    }

    /// Every write the peer has seen, in order.
    pub fn writes(&self) -> Vec<RecordedWrite> {
        lock(&self.link.writes).clone()
    }

    /// Total number of transport operations issued against the peer.
    pub fn total_calls(&self) -> usize {
        self.connect_attempts()
            + self.disconnect_calls()
            + self.subscribe_calls()
            + self.status_queries()
            + self.scans()
            + self.enumerations()
            + lock(&self.link.writes).len()
    }

    /// Whether the simulated link is currently up.
    pub fn is_linked(&self) -> bool {
        self.link.live()
    }
}

#[async_trait]
impl BleTransport for SimPeripheral {
    async fn connect(&mut self, address: &BleAddress, timeout: Duration) -> Result<(), BleError> {
        self.link.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let hang = lock(&self.link.behaviour).hang_on_connect;
        if hang {
            tokio::time::sleep(timeout).await;
            return Err(BleError::Timeout);
        }
        if address != &self.address {
            return Err(BleError::ConnectionError(format!("No peripheral at {}", address)));
        }
        {
            let mut behaviour = lock(&self.link.behaviour);
            if behaviour.unreachable {
                return Err(BleError::ConnectionError(format!("{} is not advertising", address)));
            }
            if behaviour.failing_connects > 0 {
                behaviour.failing_connects -= 1;
                return Err(BleError::ConnectionError(format!("{} refused connection", address)));
            }
        }
        *lock(&self.link.connected_at) = Some(Instant::now());
        self.link.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn is_connected(&self) -> bool {
        self.link.status_queries.fetch_add(1, Ordering::SeqCst);
        self.link.live()
    }

    async fn write(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        mode: WriteMode,
    ) -> Result<(), BleError> {
        lock(&self.link.writes).push(RecordedWrite {
            channel,
            data: data.to_vec(),
            mode,
        });
        if !self.link.live() {
            return Err(BleError::Disconnected);
        }
        if channel != ChannelId::Command {
            return Err(BleError::GattError(format!("{} channel is not writable", channel)));
        }
        let (rejected, severed, crashes, response) = {
            let mut behaviour = lock(&self.link.behaviour);
            let matches = |triggers: &[Vec<u8>]| triggers.iter().any(|t| t.as_slice() == data);
            let bricked = matches(&behaviour.brick_triggers);
            if bricked {
                behaviour.unreachable = true;
            }
            (
                matches(&behaviour.reject_triggers),
                matches(&behaviour.sever_triggers),
                bricked || matches(&behaviour.crash_triggers),
                behaviour.responses.get(data).cloned(),
            )
        };
        if severed {
            self.link.connected.store(false, Ordering::SeqCst);
            return Err(BleError::Disconnected);
        }
        if rejected {
            return Err(BleError::GattError("write rejected by peer".to_string()));
        }
        if crashes {
            self.link.connected.store(false, Ordering::SeqCst);
            return Ok(());
        }
        if let Some(response) = response {
            self.link.notify(ChannelId::Notify, response);
        }
        Ok(())
    }

    async fn subscribe(
        &mut self,
        channel: ChannelId,
        sink: NotificationSink,
    ) -> Result<(), BleError> {
        self.link.subscribe_calls.fetch_add(1, Ordering::SeqCst);
        if lock(&self.link.behaviour).subscribe_fails {
            return Err(BleError::GattError("notifications not permitted".to_string()));
        }
        if channel != ChannelId::Notify {
            return Err(BleError::GattError(format!("{} channel does not notify", channel)));
        }
        *lock(&self.link.sink) = Some(sink);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), BleError> {
        self.link.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        self.link.connected.store(false, Ordering::SeqCst);
        *lock(&self.link.sink) = None;
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        Some(SIM_RSSI)
    }
}

#[async_trait]
impl BleScanner for SimPeripheral {
    /// The peer advertises only while reachable and not holding a link.
    async fn scan(&mut self, window: Duration) -> Result<Vec<DiscoveredDevice>, BleError> {
        self.link.scans.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(window).await;

        let behaviour = lock(&self.link.behaviour).clone();
        let mut heard = Vec::new();
        if !behaviour.unreachable && !self.link.live() {
            let mut device = DiscoveredDevice::new(self.address, behaviour.name, Some(SIM_RSSI));
            device.service_uuids.push(SERVICE_UUID.to_string());
            heard.push(device);
        }
        heard.extend(behaviour.bystanders);
        Ok(heard)
    }

    async fn enumerate(
        &mut self,
        address: &BleAddress,
        timeout: Duration,
    ) -> Result<Vec<ServiceProfile>, BleError> {
        self.link.enumerations.fetch_add(1, Ordering::SeqCst);
        let (unreachable, hang) = {
            let behaviour = lock(&self.link.behaviour);
            (behaviour.unreachable, behaviour.hang_on_connect)
        };
        if hang {
            tokio::time::sleep(timeout).await;
            return Err(BleError::Timeout);
        }
        if address != &self.address {
            return Err(BleError::ConnectionError(format!("No peripheral at {}", address)));
        }
        if unreachable {
            return Err(BleError::ConnectionError(format!("{} is not advertising", address)));
        }
        if self.link.live() {
            let reason = format!("{} has no free connection slot", address);
            return Err(BleError::ConnectionError(reason));
        }
        Ok(device_services())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn addr() -> BleAddress {
        BleAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        assert!(peer.is_connected().await);

        peer.disconnect().await.unwrap();
        assert!(!peer.is_connected().await);
        assert_eq!(handle.connect_attempts(), 1);
        assert_eq!(handle.disconnect_calls(), 1);
    }

    #[tokio::test]
    async fn test_wrong_address_is_refused() {
        let (mut peer, _handle) = SimPeripheral::new(addr());
        let other = BleAddress([0x01; 6]);
        let result = peer.connect(&other, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(BleError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_failing_connects_then_success() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.fail_next_connects(2);
        assert!(peer.connect(&addr(), Duration::from_secs(1)).await.is_err());
        assert!(peer.connect(&addr(), Duration::from_secs(1)).await.is_err());
        assert!(peer.connect(&addr(), Duration::from_secs(1)).await.is_ok());
        assert_eq!(handle.connect_attempts(), 3);
    }

    #[tokio::test]
    async fn test_crash_trigger_drops_link() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.crash_on(vec![0x41; 4]);
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();

        peer.write(ChannelId::Command, &[0x01, 0x00, 0x00, 0x00], WriteMode::WithoutResponse)
            .await
            .unwrap();
        assert!(peer.is_connected().await);

        peer.write(ChannelId::Command, &[0x41; 4], WriteMode::WithoutResponse)
            .await
            .unwrap();
        assert!(!peer.is_connected().await);
        assert_eq!(handle.writes().len(), 2);
    }

    #[tokio::test]
    async fn test_response_is_delivered_to_sink() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.respond_to(vec![0xFE, 0x00, 0x00, 0x00], vec![0x01, 0x02]);
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        peer.subscribe(ChannelId::Notify, tx).await.unwrap();
        peer.write(ChannelId::Command, &[0xFE, 0x00, 0x00, 0x00], WriteMode::WithResponse)
            .await
            .unwrap();

        let notification = rx.recv().await.unwrap();
        assert_eq!(notification.channel, ChannelId::Notify);
        assert_eq!(notification.data, vec![0x01, 0x02]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_drop_uses_virtual_time() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.drop_every(Duration::from_secs(10));
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert!(peer.is_connected().await);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!peer.is_connected().await);

        // The timer restarts on every successful connect.
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        assert!(peer.is_connected().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_connect_times_out() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.hang_on_connect(true);
        let before = Instant::now();
        let result = peer.connect(&addr(), Duration::from_secs(15)).await;
        assert_eq!(result, Err(BleError::Timeout));
        assert_eq!(before.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_severed_write_fails_and_drops() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.sever_on(vec![0x42]);
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        let result = peer
            .write(ChannelId::Command, &[0x42], WriteMode::WithoutResponse)
            .await;
        assert_eq!(result, Err(BleError::Disconnected));
        assert!(!handle.is_linked());
    }

    #[tokio::test]
    async fn test_bricked_peer_stays_down() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.brick_on(vec![0xDE, 0xAD]);
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        peer.write(ChannelId::Command, &[0xDE, 0xAD], WriteMode::WithoutResponse)
            .await
            .unwrap();
        assert!(!peer.is_connected().await);
        assert!(peer.connect(&addr(), Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_lists_peer_and_bystanders() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        handle.add_bystander(BleAddress([0x11; 6]), Some("Headphones"), -80);
        let before = Instant::now();

        let heard = peer.scan(Duration::from_secs(10)).await.unwrap();
        assert_eq!(before.elapsed(), Duration::from_secs(10));
        assert_eq!(heard.len(), 2);
        assert_eq!(heard[0].address, addr());
        assert_eq!(heard[0].name.as_deref(), Some(SIM_DEVICE_NAME));
        assert_eq!(heard[1].display_name(), "Headphones");
        assert_eq!(handle.scans(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connected_peer_stops_advertising() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        assert!(peer.scan(Duration::from_secs(1)).await.unwrap().is_empty());
        let taken = peer.enumerate(&addr(), Duration::from_secs(1)).await;
        assert!(matches!(taken, Err(BleError::ConnectionError(_))));

        handle.drop_link();
        handle.set_name(None);
        let heard = peer.scan(Duration::from_secs(1)).await.unwrap();
        assert_eq!(heard[0].display_name(), "Unknown");
    }

    #[tokio::test]
    async fn test_enumerate_returns_device_table() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        let services = peer.enumerate(&addr(), Duration::from_secs(15)).await.unwrap();
        assert_eq!(services, device_services());
        assert_eq!(handle.enumerations(), 1);
        assert_eq!(handle.connect_attempts(), 0);

        handle.set_unreachable(true);
        assert!(peer.enumerate(&addr(), Duration::from_secs(15)).await.is_err());
        assert!(peer.enumerate(&BleAddress([0x01; 6]), Duration::from_secs(15)).await.is_err());
    }

    #[tokio::test]
    async fn test_write_after_drop_fails() {
        let (mut peer, handle) = SimPeripheral::new(addr());
        peer.connect(&addr(), Duration::from_secs(1)).await.unwrap();
        handle.drop_link();
        let result = peer
            .write(ChannelId::Command, &[0x01], WriteMode::WithoutResponse)
            .await;
        assert_eq!(result, Err(BleError::Disconnected));
    }
}
