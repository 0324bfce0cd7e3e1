//! SMP command table and inbound frame routing.

use dvb_codec::frame::{text_map, OP_READ, OP_WRITE};
use dvb_codec::{Frame, Value};

use crate::events::InboundMessage;

pub const GROUP_OS: u16 = 0;
pub const GROUP_IMAGE: u16 = 1;

pub const OS_ECHO: u8 = 0;
pub const OS_RESET: u8 = 5;
pub const IMAGE_STATE: u8 = 0;
pub const IMAGE_UPLOAD: u8 = 1;
pub const IMAGE_ERASE: u8 = 5;

/// Outbound SMP requests.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Reset,
    Echo(String),
    ImageState,
    /// Erases the standby slot.
    ImageErase,
    /// Marks `hash` for a one-shot test boot.
    ImageTest { hash: Vec<u8> },
    /// Marks `hash` as permanent.
    ImageConfirm { hash: Vec<u8> },
    /// Pre-built `{data, off[, len, sha]}` envelope.
    UploadChunk(Value),
}

impl Command {
    pub fn op(&self) -> u8 {
        match self {
            Command::ImageState => OP_READ,
            _ => OP_WRITE,
        }
    }

    pub fn group(&self) -> u16 {
        match self {
            Command::Reset | Command::Echo(_) => GROUP_OS,
            _ => GROUP_IMAGE,
        }
    }

    pub fn id(&self) -> u8 {
        match self {
            Command::Reset => OS_RESET,
            Command::Echo(_) => OS_ECHO,
            Command::ImageState | Command::ImageTest { .. } | Command::ImageConfirm { .. } => {
                IMAGE_STATE
            }
            Command::ImageErase => IMAGE_ERASE,
            Command::UploadChunk(_) => IMAGE_UPLOAD,
        }
    }

    pub fn body(&self) -> Option<Value> {
        match self {
            Command::Reset | Command::ImageState => None,
            Command::Echo(message) => Some(text_map([("d", Value::Text(message.clone()))])),
            Command::ImageErase => Some(Value::Map(Vec::new())),
            Command::ImageTest { hash } => Some(image_state_body(hash, false)),
            Command::ImageConfirm { hash } => Some(image_state_body(hash, true)),
            Command::UploadChunk(envelope) => Some(envelope.clone()),
        }
    }
}

fn image_state_body(hash: &[u8], confirm: bool) -> Value {
    text_map([
        ("hash", Value::Bytes(hash.to_vec())),
        ("confirm", Value::Bool(confirm)),
    ])
}

/// Where an inbound frame goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    /// Upload acknowledgment carrying the device's next expected offset.
    UploadAck { off: usize },
    /// Upload response with a failing result code.
    UploadRejected { rc: i128 },
    /// Everything else, handed to subscribers verbatim.
    Forward(InboundMessage),
}

/// Classifies `frame`. Upload responses are only consumed while an upload
/// is running; an acknowledgment without a non-zero `off` is forwarded.
pub fn route(frame: Frame, upload_active: bool) -> Route {
    let is_upload_response =
        frame.header.group == GROUP_IMAGE && frame.header.id == IMAGE_UPLOAD;
    if !(is_upload_response && upload_active) {
        return Route::Forward(frame.into());
    }
    match frame.int_field("rc") {
        Some(rc) if rc != 0 => return Route::UploadRejected { rc },
        _ => {}
    }
    match frame.int_field("off").and_then(|off| usize::try_from(off).ok()) {
        Some(off) if off > 0 => Route::UploadAck { off },
        _ => Route::Forward(frame.into()),
    }
}
