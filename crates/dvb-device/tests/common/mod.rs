#![allow(dead_code)]

use std::time::Duration;

use dvb_codec::frame::{encode_frame, text_map, OP_WRITE_RSP};
use dvb_codec::{decode_frame, Frame, Value};
use dvb_core::gatt;
use dvb_device::{DeviceConfig, DeviceEvent, DeviceSession};
use dvb_transport::{DeviceTarget, SimulatedGatt};
use tokio::sync::broadcast;

pub type SimSession = DeviceSession<SimulatedGatt>;

pub fn session_with(sim: &SimulatedGatt, config: DeviceConfig) -> SimSession {
    DeviceSession::new(sim.clone(), DeviceTarget::default(), config)
}

pub fn session(sim: &SimulatedGatt) -> SimSession {
    session_with(sim, DeviceConfig::default())
}

/// Connects and consumes the `Connecting`/`Connected` pair.
pub async fn connected(
    sim: &SimulatedGatt,
    config: DeviceConfig,
) -> (SimSession, broadcast::Receiver<DeviceEvent>) {
    let session = session_with(sim, config);
    let mut events = session.subscribe();
    session.connect().await.expect("connect should succeed");
    assert_eq!(next_event(&mut events).await, DeviceEvent::Connecting);
    assert_eq!(next_event(&mut events).await, DeviceEvent::Connected);
    (session, events)
}

pub async fn next_event(events: &mut broadcast::Receiver<DeviceEvent>) -> DeviceEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("event should arrive in time")
        .expect("event bus should stay open")
}

/// Returns every event already queued without waiting.
pub fn drain(events: &mut broadcast::Receiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was not met in time");
}

pub fn smp_frames(sim: &SimulatedGatt) -> Vec<Frame> {
    sim.writes_to(gatt::SMP)
        .iter()
        .map(|bytes| decode_frame(bytes).expect("written frame should decode"))
        .collect()
}

pub fn bytes_field(frame: &Frame, key: &str) -> Vec<u8> {
    match frame.field(key) {
        Some(Value::Bytes(bytes)) => bytes.clone(),
        other => panic!("{key} should be a byte string, got {other:?}"),
    }
}

pub fn upload_response(rc: i64, off: Option<u64>) -> Vec<u8> {
    let mut entries = vec![("rc", Value::Integer(rc.into()))];
    if let Some(off) = off {
        entries.push(("off", Value::Integer(off.into())));
    }
    encode_frame(OP_WRITE_RSP, 1, 1, 0, Some(&text_map(entries)))
        .expect("upload response should encode")
}

pub fn test_image(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Answers every upload chunk with an acknowledgment for the bytes it
/// carried.
pub fn auto_ack(sim: &SimulatedGatt) {
    sim.set_write_responder(|peripheral, characteristic, bytes| {
        if characteristic != gatt::SMP {
            return;
        }
        let Ok(frame) = decode_frame(bytes) else {
            return;
        };
        if (frame.header.group, frame.header.id) != (1, 1) {
            return;
        }
        let off = frame.int_field("off").unwrap_or_default() as u64;
        let sent = bytes_field(&frame, "data").len() as u64;
        peripheral.notify(upload_response(0, Some(off + sent)));
    });
}
