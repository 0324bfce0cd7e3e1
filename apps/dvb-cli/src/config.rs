use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use dvb_core::{CoreError, MacKey};
use dvb_device::DeviceConfig;
use dvb_transport::{DeviceTarget, DiscoveryRetry};
use dvb_transport_ble::BleGattConfig;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct CliConfig {
    pub name_prefix: String,
    pub address: Option<String>,
    pub mtu: usize,
    #[serde(with = "humantime_serde")]
    pub scan_timeout: Duration,
    pub discovery_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub discovery_delay: Duration,
    pub max_reconnect_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    pub download_chunk_size: usize,
    #[serde(with = "humantime_serde")]
    pub download_retry_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub verification_settle_delay: Duration,
    /// How long SMP commands wait for the device's reply.
    #[serde(with = "humantime_serde")]
    pub response_timeout: Duration,
    /// 16-byte registration key, hex encoded.
    pub mac_key: String,
}

impl CliConfig {
    /// Defaults, then the optional TOML file, then `DVB_*` variables.
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let device = DeviceConfig::default();
        let mut builder = Config::builder()
            .set_default("name_prefix", dvb_transport::adapter::DEFAULT_NAME_PREFIX)?
            .set_default("address", None::<String>)?
            .set_default("mtu", device.mtu as i64)?
            .set_default("scan_timeout", "10s")?
            .set_default("discovery_attempts", 3)?
            .set_default("discovery_delay", "500ms")?
            .set_default("max_reconnect_attempts", i64::from(device.max_reconnect_attempts))?
            .set_default("reconnect_delay", "2s")?
            .set_default("download_chunk_size", device.download_chunk_size as i64)?
            .set_default("download_retry_delay", "500ms")?
            .set_default("verification_settle_delay", "500ms")?
            .set_default("response_timeout", "5s")?
            .set_default("mac_key", hex::encode(MacKey::DEVELOPMENT.as_bytes()))?;

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path));
        }
        builder = builder.add_source(Environment::with_prefix("DVB").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn target(&self) -> DeviceTarget {
        DeviceTarget {
            name_prefix: self.name_prefix.clone(),
            address: self.address.clone(),
        }
    }

    pub fn device_config(&self) -> Result<DeviceConfig, CoreError> {
        Ok(DeviceConfig {
            mtu: self.mtu,
            max_reconnect_attempts: self.max_reconnect_attempts,
            reconnect_delay: self.reconnect_delay,
            download_chunk_size: self.download_chunk_size,
            download_retry_delay: self.download_retry_delay,
            verification_settle_delay: self.verification_settle_delay,
            mac_key: MacKey::from_hex(&self.mac_key)?,
            ..DeviceConfig::default()
        })
    }

    pub fn transport_config(&self) -> BleGattConfig {
        BleGattConfig {
            scan_timeout: self.scan_timeout,
            discovery: DiscoveryRetry {
                attempts: self.discovery_attempts,
                delay: self.discovery_delay,
            },
            mtu: self.mtu,
            ..BleGattConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_env<F>(vars: &[(&str, &str)], test: F)
    where
        F: FnOnce(),
    {
        let _guard = ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut old = Vec::new();
        for (k, v) in vars {
            old.push((k.to_string(), env::var(k).ok()));
            env::set_var(k, v);
        }

        test();

        for (k, maybe_old) in old {
            match maybe_old {
                Some(val) => env::set_var(k, val),
                None => env::remove_var(k),
            }
        }
    }

    #[test]
    fn defaults_are_applied() {
        with_env(&[], || {
            let cfg = CliConfig::new(None).expect("defaults should build");
            assert_eq!(cfg.name_prefix, "DVB");
            assert!(cfg.address.is_none());
            assert_eq!(cfg.mtu, 140);
            assert_eq!(cfg.scan_timeout, Duration::from_secs(10));
            assert_eq!(cfg.discovery_attempts, 3);
            assert_eq!(cfg.reconnect_delay, Duration::from_secs(2));
            assert_eq!(cfg.download_chunk_size, 65_536);
            assert_eq!(cfg.mac_key, "00112233445566778899aabbccddeeff");

            let device = cfg.device_config().expect("default key should parse");
            assert_eq!(device.mac_key, MacKey::DEVELOPMENT);
            assert_eq!(device.max_reconnect_attempts, 5);
            assert_eq!(cfg.transport_config().discovery, DiscoveryRetry::default());
        });
    }

    #[test]
    fn env_vars_override_defaults() {
        with_env(
            &[
                ("DVB_NAME_PREFIX", "BENCH"),
                ("DVB_MTU", "247"),
                ("DVB_RECONNECT_DELAY", "750ms"),
                ("DVB_ADDRESS", "AA:BB:CC:DD:EE:FF"),
            ],
            || {
                let cfg = CliConfig::new(None).expect("env config should build");
                assert_eq!(cfg.name_prefix, "BENCH");
                assert_eq!(cfg.mtu, 247);
                assert_eq!(cfg.reconnect_delay, Duration::from_millis(750));
                assert_eq!(
                    cfg.target(),
                    DeviceTarget {
                        name_prefix: "BENCH".to_string(),
                        address: Some("AA:BB:CC:DD:EE:FF".to_string()),
                    }
                );
            },
        );
    }

    #[test]
    fn file_values_sit_between_defaults_and_env() {
        use std::io::Write;

        let mut tmp = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("temp file");
        writeln!(
            tmp,
            r#"
name_prefix = "LAB"
scan_timeout = "30s"
max_reconnect_attempts = 9
"#
        )
        .expect("write to temp file");

        with_env(&[("DVB_MAX_RECONNECT_ATTEMPTS", "2")], || {
            let cfg = CliConfig::new(Some(PathBuf::from(tmp.path()))).expect("load config");
            assert_eq!(cfg.name_prefix, "LAB");
            assert_eq!(cfg.scan_timeout, Duration::from_secs(30));
            assert_eq!(cfg.max_reconnect_attempts, 2);
            assert_eq!(cfg.transport_config().scan_timeout, Duration::from_secs(30));
        });
    }

    #[test]
    fn malformed_mac_key_is_rejected() {
        with_env(&[("DVB_MAC_KEY", "not-hex")], || {
            let cfg = CliConfig::new(None).expect("config should build");
            assert!(cfg.device_config().is_err());
        });
    }
}
