//! Scripted in-memory DVB peripheral.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dvb_core::{gatt, Characteristic};
use tokio::sync::broadcast;
use tracing::debug;

use crate::adapter::{
    CharacteristicProperties, DeviceTarget, GattHealthSnapshot, GattTransport, LinkEvent,
    NotificationSink, TransportError, WriteMode,
};
use crate::discovery::{with_discovery_retry, DiscoveryRetry};

/// Hook run for every accepted write, with mutable access to the peripheral.
pub type WriteResponder = Box<dyn FnMut(&mut SimPeripheral, Characteristic, &[u8]) + Send>;

#[derive(Debug, Default)]
struct SimCharacteristic {
    properties: CharacteristicProperties,
    reads: VecDeque<Vec<u8>>,
    value: Vec<u8>,
    failing_reads: u32,
}

/// Mutable peripheral state reachable from tests and write responders.
#[derive(Debug, Default)]
pub struct SimPeripheral {
    characteristics: HashMap<Characteristic, SimCharacteristic>,
    sink: Option<NotificationSink>,
    writes: Vec<(Characteristic, Vec<u8>, WriteMode)>,
    health: GattHealthSnapshot,
}

impl SimPeripheral {
    pub fn add_characteristic(
        &mut self,
        characteristic: Characteristic,
        properties: CharacteristicProperties,
    ) {
        self.characteristics
            .entry(characteristic)
            .or_default()
            .properties = properties;
    }

    /// Queues a one-shot read result ahead of the steady value.
    pub fn queue_read(&mut self, characteristic: Characteristic, bytes: impl Into<Vec<u8>>) {
        self.characteristics
            .entry(characteristic)
            .or_default()
            .reads
            .push_back(bytes.into());
    }

    /// Sets the value returned once the read queue is empty.
    pub fn set_value(&mut self, characteristic: Characteristic, bytes: impl Into<Vec<u8>>) {
        self.characteristics
            .entry(characteristic)
            .or_default()
            .value = bytes.into();
    }

    pub fn fail_reads(&mut self, characteristic: Characteristic, count: u32) {
        self.characteristics
            .entry(characteristic)
            .or_default()
            .failing_reads = count;
    }

    /// Pushes a notification chunk to the current subscriber.
    pub fn notify(&mut self, bytes: impl Into<Vec<u8>>) -> bool {
        let delivered = self
            .sink
            .as_ref()
            .is_some_and(|sink| sink.send(bytes.into()).is_ok());
        if delivered {
            self.health.notifications += 1;
        }
        delivered
    }
}

struct SimState {
    peripheral: SimPeripheral,
    responder: Option<WriteResponder>,
    connected: bool,
    connect_calls: u32,
    failing_connects: u32,
    failing_discoveries: u32,
    name: String,
    mtu: Option<usize>,
}

/// Scripted peripheral implementing [`GattTransport`].
///
/// Clones share state, so a test can keep one handle while a session owns
/// another.
#[derive(Clone)]
pub struct SimulatedGatt {
    state: Arc<Mutex<SimState>>,
    link: broadcast::Sender<LinkEvent>,
    retry: DiscoveryRetry,
}

impl Default for SimulatedGatt {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedGatt {
    /// Creates an empty peripheral with no characteristics.
    pub fn new() -> Self {
        let (link, _) = broadcast::channel(16);
        Self {
            state: Arc::new(Mutex::new(SimState {
                peripheral: SimPeripheral::default(),
                responder: None,
                connected: false,
                connect_calls: 0,
                failing_connects: 0,
                failing_discoveries: 0,
                name: "DVB-SIM".to_string(),
                mtu: None,
            })),
            link,
            retry: DiscoveryRetry::default(),
        }
    }

    /// Creates a peripheral exposing the full DVB characteristic table.
    pub fn dvb_unit() -> Self {
        let sim = Self::new();
        sim.with_peripheral(|p| {
            for characteristic in gatt::ALL {
                let properties = match characteristic {
                    gatt::SMP => CharacteristicProperties::SMP,
                    gatt::SHORT_NAME
                    | gatt::SERVER_REGISTRATION
                    | gatt::SENSOR_SETTING
                    | gatt::FILE_REQUEST => CharacteristicProperties::READ_WRITE,
                    _ => CharacteristicProperties::READ_ONLY,
                };
                p.add_characteristic(characteristic, properties);
            }
        });
        sim
    }

    pub fn with_retry(mut self, retry: DiscoveryRetry) -> Self {
        self.retry = retry;
        self
    }

    pub fn set_mtu(&self, mtu: usize) {
        self.lock().mtu = Some(mtu);
    }

    pub fn set_name(&self, name: impl Into<String>) {
        self.lock().name = name.into();
    }

    /// Runs `f` against the peripheral state.
    pub fn with_peripheral<R>(&self, f: impl FnOnce(&mut SimPeripheral) -> R) -> R {
        f(&mut self.lock().peripheral)
    }

    pub fn queue_read(&self, characteristic: Characteristic, bytes: impl Into<Vec<u8>>) {
        self.with_peripheral(|p| p.queue_read(characteristic, bytes));
    }

    pub fn set_value(&self, characteristic: Characteristic, bytes: impl Into<Vec<u8>>) {
        self.with_peripheral(|p| p.set_value(characteristic, bytes));
    }

    pub fn fail_reads(&self, characteristic: Characteristic, count: u32) {
        self.with_peripheral(|p| p.fail_reads(characteristic, count));
    }

    pub fn notify(&self, bytes: impl Into<Vec<u8>>) -> bool {
        self.with_peripheral(|p| p.notify(bytes))
    }

    /// Installs a hook run after every accepted write.
    pub fn set_write_responder(
        &self,
        responder: impl FnMut(&mut SimPeripheral, Characteristic, &[u8]) + Send + 'static,
    ) {
        self.lock().responder = Some(Box::new(responder));
    }

    /// Makes the next `count` connect calls fail.
    pub fn fail_connects(&self, count: u32) {
        self.lock().failing_connects = count;
    }

    /// Makes the next `count` service resolutions fail.
    pub fn fail_discoveries(&self, count: u32) {
        self.lock().failing_discoveries = count;
    }

    /// Simulates the remote side dropping the link.
    pub fn drop_link(&self) {
        {
            let mut state = self.lock();
            state.connected = false;
            state.peripheral.sink = None;
        }
        let _ = self.link.send(LinkEvent::Disconnected);
    }

    pub fn is_connected(&self) -> bool {
        self.lock().connected
    }

    pub fn connect_calls(&self) -> u32 {
        self.lock().connect_calls
    }

    /// Drains all captured writes.
    pub fn take_writes(&self) -> Vec<(Characteristic, Vec<u8>, WriteMode)> {
        std::mem::take(&mut self.lock().peripheral.writes)
    }

    /// Returns captured payloads written to `characteristic` without draining.
    pub fn writes_to(&self, characteristic: Characteristic) -> Vec<Vec<u8>> {
        self.lock()
            .peripheral
            .writes
            .iter()
            .filter(|(c, _, _)| *c == characteristic)
            .map(|(_, bytes, _)| bytes.clone())
            .collect()
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn resolve_services(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        if state.failing_discoveries > 0 {
            state.failing_discoveries -= 1;
            return Err(TransportError::Io("service not found".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl GattTransport for SimulatedGatt {
    async fn connect(&self, target: &DeviceTarget) -> Result<(), TransportError> {
        let name = {
            let mut state = self.lock();
            state.connect_calls += 1;
            state.peripheral.health.connect_attempts += 1;
            if state.failing_connects > 0 {
                state.failing_connects -= 1;
                state.peripheral.health.last_error = Some("connect refused".to_string());
                return Err(TransportError::Connection("connect refused".to_string()));
            }
            state.name.clone()
        };
        if !target.matches(Some(&name), "00:00:00:00:00:00") {
            return Err(TransportError::Connection(format!(
                "no device matching {:?}",
                target.name_prefix
            )));
        }
        with_discovery_retry(self.retry, "dvb services", || self.resolve_services()).await?;
        self.lock().connected = true;
        debug!(name, "simulated peripheral connected");
        let _ = self.link.send(LinkEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let mut state = self.lock();
        state.connected = false;
        state.peripheral.sink = None;
        Ok(())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let peripheral = &mut state.peripheral;
        let Some(entry) = peripheral.characteristics.get_mut(&characteristic) else {
            peripheral.health.reads_err += 1;
            return Err(TransportError::CharacteristicUnavailable(characteristic.uuid));
        };
        if entry.failing_reads > 0 {
            entry.failing_reads -= 1;
            peripheral.health.reads_err += 1;
            return Err(TransportError::Io("read failed".to_string()));
        }
        let value = entry
            .reads
            .pop_front()
            .unwrap_or_else(|| entry.value.clone());
        peripheral.health.reads_ok += 1;
        Ok(value)
    }

    async fn write(
        &self,
        characteristic: Characteristic,
        bytes: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            state.peripheral.health.writes_err += 1;
            return Err(TransportError::NotConnected);
        }
        let properties = state
            .peripheral
            .characteristics
            .get(&characteristic)
            .map(|entry| entry.properties);
        let rejection = match properties {
            None => Some(TransportError::CharacteristicUnavailable(characteristic.uuid)),
            Some(props) if props.preferred_write_mode().is_none() => {
                Some(TransportError::WriteNotSupported(characteristic.uuid))
            }
            Some(_) => None,
        };
        if let Some(err) = rejection {
            state.peripheral.health.writes_err += 1;
            return Err(err);
        }
        state
            .peripheral
            .writes
            .push((characteristic, bytes.to_vec(), mode));
        state.peripheral.health.writes_ok += 1;

        let state = &mut *state;
        if let Some(responder) = state.responder.as_mut() {
            responder(&mut state.peripheral, characteristic, bytes);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        let mut state = self.lock();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        match state.peripheral.characteristics.get(&characteristic) {
            Some(entry) if entry.properties.notify => {
                state.peripheral.sink = Some(sink);
                Ok(())
            }
            _ => Err(TransportError::CharacteristicUnavailable(characteristic.uuid)),
        }
    }

    fn properties(
        &self,
        characteristic: Characteristic,
    ) -> Result<CharacteristicProperties, TransportError> {
        self.lock()
            .peripheral
            .characteristics
            .get(&characteristic)
            .map(|entry| entry.properties)
            .ok_or(TransportError::CharacteristicUnavailable(characteristic.uuid))
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    fn device_name(&self) -> Option<String> {
        let state = self.lock();
        state.connected.then(|| state.name.clone())
    }

    fn mtu_hint(&self) -> Option<usize> {
        self.lock().mtu
    }

    fn health_snapshot(&self) -> GattHealthSnapshot {
        self.lock().peripheral.health.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn reads_drain_queue_then_fall_back_to_value() {
        let sim = SimulatedGatt::dvb_unit();
        sim.connect(&DeviceTarget::default())
            .await
            .expect("connect should succeed");
        sim.queue_read(gatt::LIST_FILES, b"a.bin;10".to_vec());
        sim.set_value(gatt::LIST_FILES, Vec::new());

        assert_eq!(
            sim.read(gatt::LIST_FILES).await.expect("first read"),
            b"a.bin;10"
        );
        assert!(sim
            .read(gatt::LIST_FILES)
            .await
            .expect("second read")
            .is_empty());
    }

    #[tokio::test]
    async fn io_requires_connection() {
        let sim = SimulatedGatt::dvb_unit();
        assert_eq!(
            sim.read(gatt::SERIAL_NUMBER).await,
            Err(TransportError::NotConnected)
        );
        assert_eq!(
            sim.write(gatt::SMP, &[0], WriteMode::WithoutResponse).await,
            Err(TransportError::NotConnected)
        );
    }

    #[tokio::test]
    async fn responder_can_answer_writes_with_notifications() {
        let sim = SimulatedGatt::dvb_unit();
        sim.set_write_responder(|peripheral, characteristic, bytes| {
            if characteristic == gatt::SMP {
                peripheral.notify(bytes.to_vec());
            }
        });
        sim.connect(&DeviceTarget::default())
            .await
            .expect("connect should succeed");
        let (tx, mut rx) = mpsc::unbounded_channel();
        sim.subscribe(gatt::SMP, tx).await.expect("subscribe");
        sim.write(gatt::SMP, &[1, 2, 3], WriteMode::WithoutResponse)
            .await
            .expect("write");

        assert_eq!(rx.recv().await, Some(vec![1, 2, 3]));
        assert_eq!(sim.writes_to(gatt::SMP), vec![vec![1, 2, 3]]);
        assert_eq!(sim.health_snapshot().notifications, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_discovery_failures_are_retried() {
        let sim = SimulatedGatt::dvb_unit();
        sim.fail_discoveries(2);
        sim.connect(&DeviceTarget::default())
            .await
            .expect("third resolution should succeed");
        assert!(sim.is_connected());
    }

    #[tokio::test]
    async fn drop_link_emits_disconnected() {
        let sim = SimulatedGatt::dvb_unit();
        let mut events = sim.link_events();
        sim.connect(&DeviceTarget::default())
            .await
            .expect("connect should succeed");
        sim.drop_link();
        assert_eq!(events.recv().await.expect("event"), LinkEvent::Connected);
        assert_eq!(events.recv().await.expect("event"), LinkEvent::Disconnected);
        assert!(!sim.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn custom_retry_policy_bounds_discovery() {
        let single = SimulatedGatt::dvb_unit().with_retry(DiscoveryRetry {
            attempts: 1,
            delay: Duration::from_secs(5),
        });
        single.fail_discoveries(1);
        assert!(matches!(
            single.connect(&DeviceTarget::default()).await,
            Err(TransportError::Connection(_))
        ));
        assert!(!single.is_connected());

        let patient = SimulatedGatt::dvb_unit().with_retry(DiscoveryRetry {
            attempts: 4,
            delay: Duration::from_millis(250),
        });
        patient.fail_discoveries(3);
        let started = tokio::time::Instant::now();
        patient
            .connect(&DeviceTarget::default())
            .await
            .expect("fourth resolution should succeed");
        assert_eq!(started.elapsed(), Duration::from_millis(750));
    }

    #[tokio::test]
    async fn advertised_name_drives_prefix_matching() {
        let sim = SimulatedGatt::dvb_unit();
        sim.set_name("Speaker-01");
        assert!(matches!(
            sim.connect(&DeviceTarget::default()).await,
            Err(TransportError::Connection(_))
        ));

        sim.set_name("DVB-0042");
        sim.connect(&DeviceTarget::default())
            .await
            .expect("renamed unit should match");
        assert_eq!(sim.device_name().as_deref(), Some("DVB-0042"));
    }

    #[tokio::test]
    async fn unknown_prefix_is_rejected() {
        let sim = SimulatedGatt::dvb_unit();
        let target = DeviceTarget {
            name_prefix: "XYZ".to_string(),
            address: None,
        };
        assert!(matches!(
            sim.connect(&target).await,
            Err(TransportError::Connection(_))
        ));
    }
}
