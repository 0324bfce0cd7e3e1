use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use dvb_core::{gatt, Characteristic};
use dvb_transport::{
    with_discovery_retry, CharacteristicProperties, DeviceTarget, GattHealthSnapshot,
    GattTransport, LinkEvent, NotificationSink, TransportError, WriteMode,
};
use futures_util::StreamExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::{select_device, BleGattConfig, BleSetupError, ScannedDevice};

type ResolvedCharacteristics = HashMap<Characteristic, btleplug::api::Characteristic>;

struct ActiveLink {
    peripheral: Peripheral,
    name: Option<String>,
    characteristics: ResolvedCharacteristics,
    tasks: Vec<JoinHandle<()>>,
}

impl ActiveLink {
    fn lookup(
        &self,
        characteristic: Characteristic,
    ) -> Result<(Peripheral, btleplug::api::Characteristic), TransportError> {
        self.characteristics
            .get(&characteristic)
            .map(|resolved| (self.peripheral.clone(), resolved.clone()))
            .ok_or(TransportError::CharacteristicUnavailable(characteristic.uuid))
    }
}

#[derive(Debug, Default)]
struct Counters {
    connect_attempts: AtomicU64,
    writes_ok: AtomicU64,
    writes_err: AtomicU64,
    reads_ok: AtomicU64,
    reads_err: AtomicU64,
    notifications: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// `GattTransport` backed by the host BLE stack.
pub struct BtleplugGatt {
    config: BleGattConfig,
    adapter: Adapter,
    link: broadcast::Sender<LinkEvent>,
    active: Mutex<Option<ActiveLink>>,
    counters: Arc<Counters>,
    last_error: Mutex<Option<String>>,
}

impl BtleplugGatt {
    /// Opens the first BLE adapter on the host.
    pub async fn new(config: BleGattConfig) -> Result<Self, BleSetupError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleSetupError::ManagerUnavailable(e.to_string()))?;
        let adapter = manager
            .adapters()
            .await
            .map_err(|e| BleSetupError::ManagerUnavailable(e.to_string()))?
            .into_iter()
            .next()
            .ok_or(BleSetupError::AdapterUnavailable)?;
        let (link, _) = broadcast::channel(16);
        Ok(Self {
            config,
            adapter,
            link,
            active: Mutex::new(None),
            counters: Arc::new(Counters::default()),
            last_error: Mutex::new(None),
        })
    }

    /// Scans for the configured timeout and returns every device matching
    /// `target`.
    pub async fn discover(
        &self,
        target: &DeviceTarget,
    ) -> Result<Vec<ScannedDevice>, TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(io_error)?;
        tokio::time::sleep(self.config.scan_timeout).await;
        let mut found = Vec::new();
        for peripheral in self.adapter.peripherals().await.map_err(io_error)? {
            let device = describe(&peripheral).await;
            if device.matches(target) {
                found.push(device);
            }
        }
        let _ = self.adapter.stop_scan().await;
        Ok(found)
    }

    /// Scans until the deadline, or until a pinned address shows up, and
    /// picks the strongest matching unit seen.
    async fn find_peripheral(
        &self,
        target: &DeviceTarget,
    ) -> Result<(Peripheral, Option<String>), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let deadline = Instant::now() + self.config.scan_timeout;
        let mut seen: HashMap<String, (ScannedDevice, Peripheral)> = HashMap::new();
        loop {
            for peripheral in self.adapter.peripherals().await.map_err(io_error)? {
                let device = describe(&peripheral).await;
                if device.matches(target) {
                    seen.insert(device.address.clone(), (device, peripheral));
                }
            }
            let pinned_found = target.address.is_some() && !seen.is_empty();
            if pinned_found || Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.config.scan_poll_interval).await;
        }
        let _ = self.adapter.stop_scan().await;

        let candidates: Vec<ScannedDevice> =
            seen.values().map(|(device, _)| device.clone()).collect();
        let chosen = select_device(target, &candidates).map(|device| device.address.clone());
        let Some((device, peripheral)) = chosen.and_then(|address| seen.remove(&address)) else {
            return Err(TransportError::Connection(format!(
                "no device matching prefix {:?} within {:?}",
                target.name_prefix, self.config.scan_timeout
            )));
        };
        info!(
            address = %device.address,
            rssi = ?device.rssi,
            candidates = candidates.len(),
            "unit selected"
        );
        Ok((peripheral, device.name))
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveLink>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lookup(
        &self,
        characteristic: Characteristic,
    ) -> Result<(Peripheral, btleplug::api::Characteristic), TransportError> {
        self.active()
            .as_ref()
            .ok_or(TransportError::NotConnected)?
            .lookup(characteristic)
    }

    fn record_error(&self, err: &TransportError) {
        *self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(err.to_string());
    }
}

fn io_error(err: btleplug::Error) -> TransportError {
    TransportError::Io(err.to_string())
}

async fn describe(peripheral: &Peripheral) -> ScannedDevice {
    let properties = peripheral.properties().await.ok().flatten();
    ScannedDevice {
        name: properties.as_ref().and_then(|p| p.local_name.clone()),
        address: peripheral.address().to_string(),
        rssi: properties.and_then(|p| p.rssi),
    }
}

async fn resolve_characteristics(
    peripheral: &Peripheral,
) -> Result<ResolvedCharacteristics, TransportError> {
    peripheral.discover_services().await.map_err(io_error)?;
    let discovered = peripheral.characteristics();
    for service in gatt::REQUIRED_SERVICES {
        if !discovered.iter().any(|c| c.service_uuid == service) {
            return Err(TransportError::Io(format!("service {service} not found")));
        }
    }
    let resolved: ResolvedCharacteristics = discovered
        .into_iter()
        .filter_map(|c| {
            let key = Characteristic::new(c.service_uuid, c.uuid);
            gatt::ALL.contains(&key).then_some((key, c))
        })
        .collect();
    if !resolved.contains_key(&gatt::SMP) {
        return Err(TransportError::CharacteristicUnavailable(gatt::SMP.uuid));
    }
    Ok(resolved)
}

async fn watch_link(
    mut events: std::pin::Pin<Box<dyn futures_util::Stream<Item = CentralEvent> + Send>>,
    id: PeripheralId,
    link: broadcast::Sender<LinkEvent>,
) {
    while let Some(event) = events.next().await {
        if let CentralEvent::DeviceDisconnected(gone) = event {
            if gone == id {
                info!(peripheral = ?id, "link dropped by peer");
                let _ = link.send(LinkEvent::Disconnected);
                return;
            }
        }
    }
}

#[async_trait]
impl GattTransport for BtleplugGatt {
    async fn connect(&self, target: &DeviceTarget) -> Result<(), TransportError> {
        bump(&self.counters.connect_attempts);
        self.disconnect().await?;

        let (peripheral, name) = self.find_peripheral(target).await?;
        info!(name = ?name, address = %peripheral.address(), "connecting");
        if let Err(err) = peripheral.connect().await {
            let err = TransportError::Connection(err.to_string());
            self.record_error(&err);
            return Err(err);
        }

        let resolved = with_discovery_retry(self.config.discovery, "dvb services", || {
            resolve_characteristics(&peripheral)
        })
        .await;
        let characteristics = match resolved {
            Ok(characteristics) => characteristics,
            Err(err) => {
                self.record_error(&err);
                let _ = peripheral.disconnect().await;
                return Err(err);
            }
        };
        debug!(count = characteristics.len(), "characteristics resolved");

        let events = self.adapter.events().await.map_err(io_error)?;
        let watcher = tokio::spawn(watch_link(events, peripheral.id(), self.link.clone()));
        *self.active() = Some(ActiveLink {
            peripheral,
            name,
            characteristics,
            tasks: vec![watcher],
        });
        let _ = self.link.send(LinkEvent::Connected);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let active = self.active().take();
        let Some(active) = active else {
            return Ok(());
        };
        for task in &active.tasks {
            task.abort();
        }
        if active.peripheral.is_connected().await.unwrap_or(false) {
            active.peripheral.disconnect().await.map_err(io_error)?;
        }
        Ok(())
    }

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, TransportError> {
        let (peripheral, resolved) = self.lookup(characteristic)?;
        match peripheral.read(&resolved).await {
            Ok(value) => {
                bump(&self.counters.reads_ok);
                Ok(value)
            }
            Err(err) => {
                bump(&self.counters.reads_err);
                let err = io_error(err);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    async fn write(
        &self,
        characteristic: Characteristic,
        bytes: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError> {
        let (peripheral, resolved) = self.lookup(characteristic)?;
        let write_type = match mode {
            WriteMode::WithResponse => WriteType::WithResponse,
            WriteMode::WithoutResponse => WriteType::WithoutResponse,
        };
        match peripheral.write(&resolved, bytes, write_type).await {
            Ok(()) => {
                bump(&self.counters.writes_ok);
                Ok(())
            }
            Err(err) => {
                bump(&self.counters.writes_err);
                let err = io_error(err);
                self.record_error(&err);
                Err(err)
            }
        }
    }

    async fn subscribe(
        &self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), TransportError> {
        let (peripheral, resolved) = self.lookup(characteristic)?;
        peripheral.subscribe(&resolved).await.map_err(io_error)?;
        let mut notifications = peripheral.notifications().await.map_err(io_error)?;
        let counters = self.counters.clone();
        let uuid = characteristic.uuid;
        let task = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                bump(&counters.notifications);
                if sink.send(notification.value).is_err() {
                    break;
                }
            }
        });
        match self.active().as_mut() {
            Some(active) => active.tasks.push(task),
            None => {
                warn!("link closed while subscribing");
                task.abort();
                return Err(TransportError::NotConnected);
            }
        }
        Ok(())
    }

    fn properties(
        &self,
        characteristic: Characteristic,
    ) -> Result<CharacteristicProperties, TransportError> {
        let (_, resolved) = self.lookup(characteristic)?;
        let flags = resolved.properties;
        Ok(CharacteristicProperties {
            read: flags.contains(CharPropFlags::READ),
            write: flags.contains(CharPropFlags::WRITE),
            write_without_response: flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE),
            notify: flags.contains(CharPropFlags::NOTIFY),
        })
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link.subscribe()
    }

    fn device_name(&self) -> Option<String> {
        self.active().as_ref().and_then(|active| active.name.clone())
    }

    fn mtu_hint(&self) -> Option<usize> {
        Some(self.config.mtu)
    }

    fn health_snapshot(&self) -> GattHealthSnapshot {
        GattHealthSnapshot {
            connect_attempts: self.counters.connect_attempts.load(Ordering::Relaxed),
            writes_ok: self.counters.writes_ok.load(Ordering::Relaxed),
            writes_err: self.counters.writes_err.load(Ordering::Relaxed),
            reads_ok: self.counters.reads_ok.load(Ordering::Relaxed),
            reads_err: self.counters.reads_err.load(Ordering::Relaxed),
            notifications: self.counters.notifications.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }
}
