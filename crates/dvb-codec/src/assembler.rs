use bytes::{Bytes, BytesMut};

use crate::frame::{declared_body_len, FRAME_HEADER_LEN};

/// Reassembles SMP frames from notification chunks.
///
/// Chunks may split a frame anywhere or carry several frames back to back.
/// Complete frames are returned in arrival order and any remainder stays
/// buffered for the next chunk.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    buffer: BytesMut,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while self.buffer.len() >= FRAME_HEADER_LEN {
            let Some(body_len) = declared_body_len(&self.buffer) else {
                break;
            };
            let total = FRAME_HEADER_LEN + body_len;
            if self.buffer.len() < total {
                break;
            }
            frames.push(self.buffer.split_to(total).freeze());
        }
        frames
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }
}
