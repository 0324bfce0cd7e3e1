//! Bluetooth LE GATT adapter for DVB units.
//!
//! Device selection and scan configuration live here. Enable the
//! `btleplug` feature for the hardware backend implementing
//! `dvb_transport::GattTransport`.

use std::time::Duration;

use dvb_transport::{DeviceTarget, DiscoveryRetry};
use thiserror::Error;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

#[cfg(feature = "btleplug")]
pub use btleplug_backend::BtleplugGatt;

/// Default ATT MTU assumed when the stack does not report one.
pub const DEFAULT_MTU: usize = 140;

#[derive(Debug, Clone)]
pub struct BleGattConfig {
    /// How long a scan collects candidates before the strongest is chosen.
    pub scan_timeout: Duration,
    /// Interval between peripheral list polls while scanning.
    pub scan_poll_interval: Duration,
    pub discovery: DiscoveryRetry,
    pub mtu: usize,
}

impl Default for BleGattConfig {
    fn default() -> Self {
        Self {
            scan_timeout: Duration::from_secs(10),
            scan_poll_interval: Duration::from_millis(250),
            discovery: DiscoveryRetry::default(),
            mtu: DEFAULT_MTU,
        }
    }
}

/// Errors raised before a GATT link exists.
#[derive(Debug, Error)]
pub enum BleSetupError {
    /// No BLE manager could be created on this host.
    #[error("bluetooth manager unavailable: {0}")]
    ManagerUnavailable(String),
    /// The host exposes no BLE adapter.
    #[error("no bluetooth adapter found")]
    AdapterUnavailable,
}

/// A peripheral seen during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: Option<String>,
    pub address: String,
    pub rssi: Option<i16>,
}

impl ScannedDevice {
    pub fn matches(&self, target: &DeviceTarget) -> bool {
        target.matches(self.name.as_deref(), &self.address)
    }
}

/// Picks the strongest matching device.
pub fn select_device<'a>(
    target: &DeviceTarget,
    devices: &'a [ScannedDevice],
) -> Option<&'a ScannedDevice> {
    devices
        .iter()
        .filter(|device| device.matches(target))
        .max_by_key(|device| device.rssi.unwrap_or(i16::MIN))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: Option<&str>, address: &str, rssi: Option<i16>) -> ScannedDevice {
        ScannedDevice {
            name: name.map(str::to_string),
            address: address.to_string(),
            rssi,
        }
    }

    #[test]
    fn default_config_uses_dvb_link_timings() {
        let config = BleGattConfig::default();
        assert_eq!(config.scan_timeout, Duration::from_secs(10));
        assert_eq!(config.discovery.attempts, 3);
        assert_eq!(config.discovery.delay, Duration::from_millis(500));
        assert_eq!(config.mtu, 140);
    }

    #[test]
    fn selection_prefers_strongest_matching_signal() {
        let devices = vec![
            device(Some("DVB-0001"), "AA:00:00:00:00:01", Some(-80)),
            device(Some("Speaker"), "AA:00:00:00:00:02", Some(-30)),
            device(Some("DVB-0003"), "AA:00:00:00:00:03", Some(-50)),
            device(None, "AA:00:00:00:00:04", Some(-20)),
        ];
        let chosen = select_device(&DeviceTarget::default(), &devices).expect("a DVB unit");
        assert_eq!(chosen.address, "AA:00:00:00:00:03");
    }

    #[test]
    fn pinned_address_overrides_name_prefix() {
        let devices = vec![
            device(Some("DVB-0001"), "AA:00:00:00:00:01", Some(-40)),
            device(Some("Renamed"), "AA:00:00:00:00:09", None),
        ];
        let target = DeviceTarget {
            address: Some("aa:00:00:00:00:09".to_string()),
            ..DeviceTarget::default()
        };
        let chosen = select_device(&target, &devices).expect("pinned unit");
        assert_eq!(chosen.name.as_deref(), Some("Renamed"));
    }

    #[test]
    fn unit_without_signal_reading_loses_to_measured_one() {
        let devices = vec![
            device(Some("DVB-0001"), "AA:00:00:00:00:01", None),
            device(Some("DVB-0002"), "AA:00:00:00:00:02", Some(-95)),
        ];
        let chosen = select_device(&DeviceTarget::default(), &devices).expect("a DVB unit");
        assert_eq!(chosen.address, "AA:00:00:00:00:02");
    }

    #[test]
    fn no_match_yields_none() {
        let devices = vec![device(Some("Speaker"), "AA", Some(-10))];
        assert!(select_device(&DeviceTarget::default(), &devices).is_none());
    }
}
