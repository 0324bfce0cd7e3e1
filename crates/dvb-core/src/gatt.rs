//! GATT service and characteristic table for DVB units.
//!
//! Every characteristic is addressed by its owning service plus its own
//! UUID; note the vendor service shares its UUID with the serial number
//! characteristic.

use std::fmt;

use uuid::Uuid;

/// SMP (mcumgr) service.
pub const SMP_SERVICE: Uuid = Uuid::from_u128(0x8d53dc1d_1db7_4cd3_868b_8a527460aa84);
/// Standard Device Information service.
pub const DEVICE_INFO_SERVICE: Uuid = Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
/// DVB vendor service.
pub const DVB_SERVICE: Uuid = Uuid::from_u128(0xdbd00001_ff30_40a5_9ceb_a17358d31999);

/// Services that must resolve before a connection is usable.
pub const REQUIRED_SERVICES: [Uuid; 3] = [SMP_SERVICE, DEVICE_INFO_SERVICE, DVB_SERVICE];

/// A characteristic addressed by `(service, characteristic)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

impl Characteristic {
    pub const fn new(service: Uuid, uuid: Uuid) -> Self {
        Self { service, uuid }
    }

    const fn dvb(suffix: u128) -> Self {
        Self::new(
            DVB_SERVICE,
            Uuid::from_u128((suffix << 96) | 0x0000_ff30_40a5_9ceb_a17358d31999),
        )
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.uuid)
    }
}

/// SMP request/notification channel.
pub const SMP: Characteristic = Characteristic::new(
    SMP_SERVICE,
    Uuid::from_u128(0xda2e7828_fbce_4e01_ae9e_261174997c48),
);
pub const FIRMWARE_REVISION: Characteristic = Characteristic::new(
    DEVICE_INFO_SERVICE,
    Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb),
);
pub const HARDWARE_REVISION: Characteristic = Characteristic::new(
    DEVICE_INFO_SERVICE,
    Uuid::from_u128(0x00002a27_0000_1000_8000_00805f9b34fb),
);
/// Device serial, also the input of the registration challenge.
pub const SERIAL_NUMBER: Characteristic = Characteristic::dvb(0xdbd00001);
pub const SHORT_NAME: Characteristic = Characteristic::dvb(0xdbd00002);
pub const DEVICE_UID: Characteristic = Characteristic::dvb(0xdbd00003);
/// Challenge nonce in, truncated signature out.
pub const SERVER_REGISTRATION: Characteristic = Characteristic::dvb(0xdbd00006);
pub const SENSOR_SETTING: Characteristic = Characteristic::dvb(0xdbd00007);
pub const MANUFACTURER_SERIAL: Characteristic = Characteristic::dvb(0xdbd00008);
/// Directory listing; each read yields one `name;length` record.
pub const LIST_FILES: Characteristic = Characteristic::dvb(0xdbd00010);
pub const FILE_REQUEST: Characteristic = Characteristic::dvb(0xdbd00011);
pub const FILE_RESPONSE: Characteristic = Characteristic::dvb(0xdbd00012);
/// Reading this characteristic erases device storage.
pub const FORMAT_STORAGE: Characteristic = Characteristic::dvb(0xdbd00013);

/// Every characteristic a DVB unit exposes.
pub const ALL: [Characteristic; 13] = [
    SMP,
    FIRMWARE_REVISION,
    HARDWARE_REVISION,
    SERIAL_NUMBER,
    SHORT_NAME,
    DEVICE_UID,
    SERVER_REGISTRATION,
    SENSOR_SETTING,
    MANUFACTURER_SERIAL,
    LIST_FILES,
    FILE_REQUEST,
    FILE_RESPONSE,
    FORMAT_STORAGE,
];

/// Single-byte commands written to the sensor setting characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorCommand {
    CalibrateAccelerometer = 0x10,
    CalibrateMagnetometer = 0x11,
    HardwareTest = 0x20,
}

impl SensorCommand {
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_characteristics_expand_to_full_uuids() {
        assert_eq!(
            SERIAL_NUMBER.uuid.to_string(),
            "dbd00001-ff30-40a5-9ceb-a17358d31999"
        );
        assert_eq!(
            FORMAT_STORAGE.uuid.to_string(),
            "dbd00013-ff30-40a5-9ceb-a17358d31999"
        );
        assert_eq!(SERIAL_NUMBER.uuid, DVB_SERVICE);
    }

    #[test]
    fn standard_characteristics_use_bluetooth_base_uuid() {
        assert_eq!(
            FIRMWARE_REVISION.uuid.to_string(),
            "00002a26-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            SMP.uuid.to_string(),
            "da2e7828-fbce-4e01-ae9e-261174997c48"
        );
    }

    #[test]
    fn characteristic_table_has_no_duplicates() {
        let mut all = ALL.to_vec();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), ALL.len());
    }

    #[test]
    fn sensor_commands_match_wire_bytes() {
        assert_eq!(SensorCommand::CalibrateAccelerometer.as_byte(), 0x10);
        assert_eq!(SensorCommand::CalibrateMagnetometer.as_byte(), 0x11);
        assert_eq!(SensorCommand::HardwareTest.as_byte(), 0x20);
    }
}
