use std::time::Duration;

use dvb_core::MacKey;

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// ATT MTU used to size upload chunks when the transport reports none.
    pub mtu: usize,
    /// Reconnect attempts after an unexpected link loss.
    pub max_reconnect_attempts: u32,
    /// Delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Bytes requested per file request during downloads.
    pub download_chunk_size: usize,
    /// Delay before retrying a failed download step.
    pub download_retry_delay: Duration,
    /// Wait between writing a challenge nonce and reading the signature.
    pub verification_settle_delay: Duration,
    /// Key shared with the unit for registration challenges.
    pub mac_key: MacKey,
    /// Capacity of the event broadcast channel.
    pub event_capacity: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mtu: 140,
            max_reconnect_attempts: 5,
            reconnect_delay: Duration::from_millis(2000),
            download_chunk_size: 64 * 1024,
            download_retry_delay: Duration::from_millis(500),
            verification_settle_delay: Duration::from_millis(500),
            mac_key: MacKey::default(),
            event_capacity: 256,
        }
    }
}
