//! Registration challenge and sensor commands.

use dvb_core::challenge::{signature_matches, NONCE_LEN, SIGNATURE_LEN};
use dvb_core::{calculate_signature, gatt, Nonce, SensorCommand};
use dvb_transport::GattTransport;
use rand::rngs::OsRng;
use rand::RngCore;
use tracing::{error, info, warn};

use crate::error::DeviceError;
use crate::session::DeviceSession;

impl<T: GattTransport> DeviceSession<T> {
    /// Challenges the unit with a random nonce and checks its signature.
    ///
    /// `Ok(false)` means the unit answered and the answer was wrong. Transport
    /// failures and a missing serial are errors.
    pub async fn verify_device(&self) -> Result<bool, DeviceError> {
        let serial = self.read_device_serial().await?;
        let mut nonce: Nonce = [0; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let expected = calculate_signature(&self.inner.config.mac_key, &serial, &nonce);

        self.inner
            .write_auxiliary(gatt::SERVER_REGISTRATION, &nonce)
            .await?;
        tokio::time::sleep(self.inner.config.verification_settle_delay).await;
        let response = self
            .inner
            .read_characteristic(gatt::SERVER_REGISTRATION)
            .await?;
        info!(
            nonce = %hex::encode(nonce),
            expected = %hex::encode(expected),
            received = %hex::encode(&response),
            "registration challenge"
        );

        if response.len() != SIGNATURE_LEN {
            error!(len = response.len(), "signature response has wrong length");
            return Ok(false);
        }
        let matches = signature_matches(&expected, &response);
        if !matches {
            warn!("signature mismatch");
        }
        Ok(matches)
    }

    pub async fn calibrate_accelerometer(&self) -> Result<(), DeviceError> {
        self.sensor_command(SensorCommand::CalibrateAccelerometer)
            .await
    }

    pub async fn calibrate_magnetometer(&self) -> Result<(), DeviceError> {
        self.sensor_command(SensorCommand::CalibrateMagnetometer)
            .await
    }

    pub async fn test_hardware(&self) -> Result<(), DeviceError> {
        self.sensor_command(SensorCommand::HardwareTest).await
    }

    async fn sensor_command(&self, command: SensorCommand) -> Result<(), DeviceError> {
        self.inner
            .write_auxiliary(gatt::SENSOR_SETTING, &[command.as_byte()])
            .await?;
        info!(?command, "sensor command sent");
        Ok(())
    }
}
