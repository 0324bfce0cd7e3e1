//! Device information reads and the cached [`DeviceInfo`] snapshot.

use dvb_core::{gatt, Characteristic};
use dvb_transport::{GattTransport, WriteMode};
use tracing::{error, info, warn};

use crate::error::DeviceError;
use crate::session::{DeviceSession, LinkState};

/// Informational values cached on the session. Cleared on disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceInfo {
    pub short_name: Option<String>,
    pub serial_number: Option<String>,
    pub manufacturer_serial: Option<String>,
    pub hardware_version: Option<String>,
    pub firmware_version: Option<String>,
    pub device_uid: Option<String>,
}

/// Decodes a text characteristic, dropping trailing NUL padding.
fn decode_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string()
}

impl<T: GattTransport> DeviceSession<T> {
    /// Populates the file catalog and every informational field in a fixed
    /// order. Individual failures are logged and the sequence continues.
    pub async fn set_device_info(&self) {
        if self.link_state() != LinkState::Connected {
            error!("device is not connected, cannot read device info");
            return;
        }
        self.list_files().await;
        if let Err(err) = self.read_short_name().await {
            warn!(error = %err, "reading short name failed");
        }
        if let Err(err) = self.read_device_serial().await {
            warn!(error = %err, "reading serial number failed");
        }
        if let Err(err) = self.read_hardware_version().await {
            warn!(error = %err, "reading hardware version failed");
        }
        if let Err(err) = self.read_firmware_version().await {
            warn!(error = %err, "reading firmware version failed");
        }
        if let Err(err) = self.read_device_uid().await {
            warn!(error = %err, "reading device uid failed");
        }
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.inner.state().info.clone()
    }

    pub fn short_name(&self) -> Option<String> {
        self.inner.state().info.short_name.clone()
    }

    pub fn serial_number(&self) -> Option<String> {
        self.inner.state().info.serial_number.clone()
    }

    pub fn manufacturer_serial(&self) -> Option<String> {
        self.inner.state().info.manufacturer_serial.clone()
    }

    pub fn hardware_version(&self) -> Option<String> {
        self.inner.state().info.hardware_version.clone()
    }

    pub fn firmware_version(&self) -> Option<String> {
        self.inner.state().info.firmware_version.clone()
    }

    pub fn device_uid(&self) -> Option<String> {
        self.inner.state().info.device_uid.clone()
    }

    pub async fn read_short_name(&self) -> Result<String, DeviceError> {
        let name = self.read_text(gatt::SHORT_NAME, |info, v| info.short_name = v).await?;
        info!(short_name = %name, "short name");
        Ok(name)
    }

    /// Writes a new short name (with response) and caches it.
    pub async fn write_short_name(&self, name: &str) -> Result<(), DeviceError> {
        self.inner.ensure_connected()?;
        let epoch = self.inner.current_epoch();
        self.inner
            .transport
            .write(gatt::SHORT_NAME, name.as_bytes(), WriteMode::WithResponse)
            .await?;
        self.remember(epoch, |info| info.short_name = Some(name.to_string()));
        info!(short_name = name, "short name updated");
        Ok(())
    }

    /// Reads the device serial. Blank values are rejected.
    pub async fn read_device_serial(&self) -> Result<String, DeviceError> {
        self.read_required(gatt::SERIAL_NUMBER, "device serial", |info, v| {
            info.serial_number = v
        })
        .await
    }

    pub async fn read_manufacturer_serial(&self) -> Result<String, DeviceError> {
        self.read_required(gatt::MANUFACTURER_SERIAL, "manufacturer serial", |info, v| {
            info.manufacturer_serial = v
        })
        .await
    }

    pub async fn read_hardware_version(&self) -> Result<String, DeviceError> {
        let version = self
            .read_text(gatt::HARDWARE_REVISION, |info, v| info.hardware_version = v)
            .await?;
        info!(hardware = %version, "hardware version");
        Ok(version)
    }

    pub async fn read_firmware_version(&self) -> Result<String, DeviceError> {
        let version = self
            .read_text(gatt::FIRMWARE_REVISION, |info, v| info.firmware_version = v)
            .await?;
        info!(firmware = %version, "firmware version");
        Ok(version)
    }

    pub async fn read_device_uid(&self) -> Result<String, DeviceError> {
        let uid = self.read_text(gatt::DEVICE_UID, |info, v| info.device_uid = v).await?;
        info!(uid = %uid, "device uid");
        Ok(uid)
    }

    async fn read_text(
        &self,
        characteristic: Characteristic,
        store: impl FnOnce(&mut DeviceInfo, Option<String>) + Send,
    ) -> Result<String, DeviceError> {
        let epoch = self.inner.current_epoch();
        let bytes = self.inner.read_characteristic(characteristic).await?;
        let text = decode_text(&bytes);
        self.remember(epoch, |info| store(info, Some(text.clone())));
        Ok(text)
    }

    async fn read_required(
        &self,
        characteristic: Characteristic,
        what: &'static str,
        store: impl FnOnce(&mut DeviceInfo, Option<String>) + Send,
    ) -> Result<String, DeviceError> {
        let epoch = self.inner.current_epoch();
        let bytes = self.inner.read_characteristic(characteristic).await?;
        let text = decode_text(&bytes);
        if text.trim().is_empty() {
            return Err(DeviceError::EmptyValue(what));
        }
        info!(what, value = %text, "serial read");
        self.remember(epoch, |info| store(info, Some(text.clone())));
        Ok(text)
    }

    /// Caches into the snapshot unless the connection changed meanwhile.
    fn remember(&self, epoch: u64, update: impl FnOnce(&mut DeviceInfo)) {
        let mut state = self.inner.state();
        if state.epoch == epoch {
            update(&mut state.info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_nul_padding_is_dropped() {
        assert_eq!(decode_text(b"DVB-0042\0\0\0"), "DVB-0042");
        assert_eq!(decode_text(b"\0\0"), "");
    }

    #[test]
    fn invalid_utf8_is_replaced() {
        assert_eq!(decode_text(&[b'v', 0xff]), "v\u{fffd}");
    }

    #[test]
    fn default_info_is_empty() {
        let info = DeviceInfo::default();
        assert!(info.serial_number.is_none());
        assert!(info.short_name.is_none());
    }
}
