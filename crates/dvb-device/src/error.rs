use dvb_codec::CodecError;
use dvb_transport::TransportError;
use thiserror::Error;

/// Errors returned by device session operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    /// The session has no established link.
    #[error("device is not connected")]
    NotConnected,
    /// A second upload was requested while one is running.
    #[error("an upload is already in progress")]
    UploadAlreadyInProgress,
    /// A characteristic returned an empty or whitespace-only value.
    #[error("{0} is empty")]
    EmptyValue(&'static str),
    /// The MTU leaves no room for upload data.
    #[error("mtu {mtu} is too small for upload chunks")]
    MtuTooSmall { mtu: usize },
    /// The operation was interrupted by a disconnect.
    #[error("operation cancelled by disconnect")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_messages_are_stable() {
        assert_eq!(
            DeviceError::EmptyValue("device serial").to_string(),
            "device serial is empty"
        );
        assert_eq!(
            DeviceError::from(TransportError::NotConnected).to_string(),
            "transport error: not connected"
        );
        assert_eq!(
            DeviceError::MtuTooSmall { mtu: 40 }.to_string(),
            "mtu 40 is too small for upload chunks"
        );
    }
}
