use dvb_codec::{Frame, Value};
use tokio::sync::broadcast;

/// A decoded SMP frame not consumed internally.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub op: u8,
    pub group: u16,
    pub id: u8,
    pub seq: u8,
    /// Declared body length from the header.
    pub length: u16,
    pub body: Option<Value>,
}

impl From<Frame> for InboundMessage {
    fn from(frame: Frame) -> Self {
        Self {
            op: frame.header.op,
            group: frame.header.group,
            id: frame.header.id,
            seq: frame.header.seq,
            length: frame.header.len,
            body: frame.body,
        }
    }
}

/// How an upload ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// Every byte was acknowledged.
    Completed,
    /// The device answered with a non-zero `rc`.
    Rejected { rc: i128 },
    /// A chunk could not be sent.
    Failed(String),
}

/// Session notifications delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connecting,
    Connected,
    Disconnected,
    Message(InboundMessage),
    /// Percentage of the image sent, reported before each chunk.
    UploadProgress { percentage: u8 },
    UploadFinished(UploadOutcome),
}

/// Broadcast fan-out of [`DeviceEvent`]s. Emitting with no subscribers is
/// not an error.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DeviceEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: DeviceEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_emit_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.emit(DeviceEvent::Connecting);
        bus.emit(DeviceEvent::Connected);
        assert_eq!(rx.recv().await.expect("event"), DeviceEvent::Connecting);
        assert_eq!(rx.recv().await.expect("event"), DeviceEvent::Connected);
    }

    #[test]
    fn emitting_without_subscribers_is_silent() {
        EventBus::new(1).emit(DeviceEvent::Disconnected);
    }
}
