//! Transport abstractions for DVB units.
//!
//! The device session only depends on the GATT adapter trait defined in
//! this crate. A scripted in-memory peripheral is provided for tests and
//! offline runs.

pub mod adapter;
pub mod discovery;
pub mod memory;

pub use adapter::{
    CharacteristicProperties, DeviceTarget, GattHealthSnapshot, GattTransport, LinkEvent,
    NotificationSink, TransportError, WriteMode,
};
pub use discovery::{with_discovery_retry, DiscoveryRetry};
pub use memory::{SimPeripheral, SimulatedGatt};
