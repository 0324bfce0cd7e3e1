use async_trait::async_trait;
use dvb_core::Characteristic;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

/// Name prefix advertised by DVB units.
pub const DEFAULT_NAME_PREFIX: &str = "DVB";

/// Errors surfaced by GATT adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Device selection, link establishment or service resolution failed.
    #[error("connection failed: {0}")]
    Connection(String),
    /// The characteristic was not resolved on the connected device.
    #[error("characteristic {0} unavailable")]
    CharacteristicUnavailable(Uuid),
    /// No link is established.
    #[error("not connected")]
    NotConnected,
    /// The characteristic advertises neither write mode.
    #[error("characteristic {0} does not support writes")]
    WriteNotSupported(Uuid),
    /// Stack-level read/write/subscribe failure.
    #[error("io error: {0}")]
    Io(String),
}

/// GATT write flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    WithResponse,
    WithoutResponse,
}

/// Capability flags of a resolved characteristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CharacteristicProperties {
    pub read: bool,
    pub write: bool,
    pub write_without_response: bool,
    pub notify: bool,
}

impl CharacteristicProperties {
    pub const READ_ONLY: Self = Self {
        read: true,
        write: false,
        write_without_response: false,
        notify: false,
    };
    pub const READ_WRITE: Self = Self {
        read: true,
        write: true,
        write_without_response: true,
        notify: false,
    };
    pub const SMP: Self = Self {
        read: false,
        write: false,
        write_without_response: true,
        notify: true,
    };

    /// Prefers write-without-response when both modes are advertised.
    pub fn preferred_write_mode(&self) -> Option<WriteMode> {
        if self.write_without_response {
            Some(WriteMode::WithoutResponse)
        } else if self.write {
            Some(WriteMode::WithResponse)
        } else {
            None
        }
    }
}

/// Link lifecycle notifications raised by the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    /// The link dropped without a local `disconnect` call.
    Disconnected,
}

/// Which device to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTarget {
    /// Advertised local name prefix.
    pub name_prefix: String,
    /// Platform address or identifier; overrides the name prefix when set.
    pub address: Option<String>,
}

impl Default for DeviceTarget {
    fn default() -> Self {
        Self {
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            address: None,
        }
    }
}

impl DeviceTarget {
    pub fn matches(&self, name: Option<&str>, address: &str) -> bool {
        match &self.address {
            Some(wanted) => wanted.eq_ignore_ascii_case(address),
            None => name.is_some_and(|name| name.starts_with(&self.name_prefix)),
        }
    }
}

/// Receives raw notification chunks for a subscribed characteristic.
pub type NotificationSink = mpsc::UnboundedSender<Vec<u8>>;

/// Coarse per-adapter health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GattHealthSnapshot {
    pub connect_attempts: u64,
    pub writes_ok: u64,
    pub writes_err: u64,
    pub reads_ok: u64,
    pub reads_err: u64,
    pub notifications: u64,
    pub last_error: Option<String>,
}

/// Async GATT contract used by the device session.
#[async_trait]
pub trait GattTransport: Send + Sync + 'static {
    /// Selects the target, connects and resolves the required services.
    async fn connect(&self, target: &DeviceTarget) -> Result<(), TransportError>;

    /// Drops the link. Calling it while disconnected is a no-op.
    async fn disconnect(&self) -> Result<(), TransportError>;

    async fn read(&self, characteristic: Characteristic) -> Result<Vec<u8>, TransportError>;

    async fn write(
        &self,
        characteristic: Characteristic,
        bytes: &[u8],
        mode: WriteMode,
    ) -> Result<(), TransportError>;

    /// Starts forwarding notifications of `characteristic` into `sink`.
    async fn subscribe(
        &self,
        characteristic: Characteristic,
        sink: NotificationSink,
    ) -> Result<(), TransportError>;

    fn properties(
        &self,
        characteristic: Characteristic,
    ) -> Result<CharacteristicProperties, TransportError>;

    /// Subscribes to link lifecycle events.
    fn link_events(&self) -> broadcast::Receiver<LinkEvent>;

    /// Local name of the connected device, if known.
    fn device_name(&self) -> Option<String> {
        None
    }

    /// Negotiated ATT MTU, when the stack exposes it.
    fn mtu_hint(&self) -> Option<usize> {
        None
    }

    fn health_snapshot(&self) -> GattHealthSnapshot {
        GattHealthSnapshot::default()
    }
}
