//! Firmware upload state machine.
//!
//! Chunks are sized so that header, CBOR envelope and data fit the MTU. The
//! offset advances optimistically after each sent chunk and is overwritten
//! by every accepted device acknowledgment.

use dvb_codec::frame::{encode_body, text_map};
use dvb_codec::{Value, FRAME_HEADER_LEN};
use dvb_core::hash::sha256_32;
use dvb_transport::{GattTransport, TransportError};
use tracing::{debug, info, warn};

use crate::command::Command;
use crate::error::DeviceError;
use crate::events::{DeviceEvent, UploadOutcome};
use crate::session::{DeviceSession, Inner, LinkState};

pub use dvb_codec::image::{image_info, ImageInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    Uploading,
}

/// Snapshot of the running upload for UI polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadStatus {
    pub phase: UploadPhase,
    pub slot: Option<u32>,
    pub offset: usize,
    pub total: usize,
    pub percentage: u8,
}

impl UploadStatus {
    pub fn idle() -> Self {
        Self {
            phase: UploadPhase::Idle,
            slot: None,
            offset: 0,
            total: 0,
            percentage: 0,
        }
    }

    pub fn in_progress(&self) -> bool {
        self.phase == UploadPhase::Uploading
    }
}

/// One chunk ready to send.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ChunkPlan {
    pub(crate) percentage: u8,
    pub(crate) offset: usize,
    pub(crate) len: usize,
    pub(crate) envelope: Value,
}

#[derive(Debug, Clone)]
pub(crate) struct UploadSession {
    image: Vec<u8>,
    /// Target slot. Kept for status reporting; not part of the wire body.
    slot: u32,
    sha: [u8; 32],
    offset: usize,
    /// Highest acknowledged offset.
    acked: usize,
}

impl UploadSession {
    pub(crate) fn new(image: Vec<u8>, slot: u32) -> Self {
        let sha = sha256_32(&image);
        Self {
            image,
            slot,
            sha,
            offset: 0,
            acked: 0,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.offset >= self.image.len()
    }

    pub(crate) fn percentage(&self) -> u8 {
        if self.image.is_empty() {
            return 100;
        }
        let pct = self.offset.min(self.image.len()) * 100 / self.image.len();
        pct as u8
    }

    fn envelope(&self, data: &[u8]) -> Value {
        let mut entries = vec![
            ("data", Value::Bytes(data.to_vec())),
            ("off", Value::Integer((self.offset as u64).into())),
        ];
        if self.offset == 0 {
            entries.push(("len", Value::Integer((self.image.len() as u64).into())));
            entries.push(("sha", Value::Bytes(self.sha.to_vec())));
        }
        text_map(entries)
    }

    /// Sizes the next chunk for `mtu`. Overhead is measured on the envelope
    /// with empty data.
    pub(crate) fn plan_next(&self, mtu: usize) -> Result<ChunkPlan, DeviceError> {
        let overhead = encode_body(&self.envelope(&[]))?.len() + FRAME_HEADER_LEN;
        let room = mtu
            .checked_sub(overhead)
            .filter(|room| *room > 0)
            .ok_or(DeviceError::MtuTooSmall { mtu })?;
        let end = (self.offset + room).min(self.image.len());
        let data = &self.image[self.offset..end];
        Ok(ChunkPlan {
            percentage: self.percentage(),
            offset: self.offset,
            len: data.len(),
            envelope: self.envelope(data),
        })
    }

    /// Optimistic advance after a sent chunk. Ignored when an acknowledgment
    /// already moved the offset.
    pub(crate) fn advance(&mut self, sent_offset: usize, len: usize) {
        if self.offset == sent_offset {
            self.offset += len;
        }
    }

    /// Applies a device acknowledgment. Offsets below the highest accepted
    /// one are stale and return `false`.
    pub(crate) fn acknowledge(&mut self, off: usize) -> bool {
        if off < self.acked {
            return false;
        }
        self.acked = off;
        self.offset = off;
        true
    }

    pub(crate) fn status(&self) -> UploadStatus {
        UploadStatus {
            phase: UploadPhase::Uploading,
            slot: Some(self.slot),
            offset: self.offset,
            total: self.image.len(),
            percentage: self.percentage(),
        }
    }
}

enum Step {
    Complete,
    Abort(String),
    Send(ChunkPlan),
}

impl<T: GattTransport> Inner<T> {
    /// Sends the chunk at the current offset, or finishes the upload once
    /// every byte is acknowledged. Does nothing without an active upload.
    pub(crate) async fn send_next_chunk(&self) {
        let step = {
            let mut state = self.state();
            let mtu = state.mtu;
            let Some(upload) = state.upload.as_mut() else {
                return;
            };
            if upload.is_complete() {
                state.upload = None;
                Step::Complete
            } else {
                match upload.plan_next(mtu) {
                    Ok(plan) => Step::Send(plan),
                    Err(err) => {
                        state.upload = None;
                        Step::Abort(err.to_string())
                    }
                }
            }
        };

        let plan = match step {
            Step::Complete => {
                info!("upload complete");
                self.events
                    .emit(DeviceEvent::UploadFinished(UploadOutcome::Completed));
                return;
            }
            Step::Abort(reason) => {
                warn!(reason = %reason, "upload aborted");
                self.events
                    .emit(DeviceEvent::UploadFinished(UploadOutcome::Failed(reason)));
                return;
            }
            Step::Send(plan) => plan,
        };

        self.events.emit(DeviceEvent::UploadProgress {
            percentage: plan.percentage,
        });
        debug!(offset = plan.offset, len = plan.len, "sending upload chunk");
        match self.send_command(&Command::UploadChunk(plan.envelope)).await {
            Ok(()) => {
                if let Some(upload) = self.state().upload.as_mut() {
                    upload.advance(plan.offset, plan.len);
                }
            }
            Err(DeviceError::NotConnected)
            | Err(DeviceError::Transport(TransportError::NotConnected)) => {
                info!(offset = plan.offset, "link down, upload resumes on reconnect");
            }
            Err(err) => {
                warn!(offset = plan.offset, error = %err, "upload chunk failed");
                if self.state().upload.take().is_some() {
                    self.events
                        .emit(DeviceEvent::UploadFinished(UploadOutcome::Failed(
                            err.to_string(),
                        )));
                }
            }
        }
    }
}

impl<T: GattTransport> DeviceSession<T> {
    /// Starts uploading `image` and sends the first chunk. Progress and the
    /// outcome arrive on the event bus.
    pub async fn start_upload(&self, image: Vec<u8>, slot: u32) -> Result<(), DeviceError> {
        let total = image.len();
        {
            let mut state = self.inner.state();
            if state.upload.is_some() {
                return Err(DeviceError::UploadAlreadyInProgress);
            }
            if state.link != LinkState::Connected {
                return Err(DeviceError::NotConnected);
            }
            state.upload = Some(UploadSession::new(image, slot));
        }
        info!(total, slot, "upload started");
        self.inner.send_next_chunk().await;
        Ok(())
    }

    pub fn upload_status(&self) -> UploadStatus {
        self.inner
            .state()
            .upload
            .as_ref()
            .map_or_else(UploadStatus::idle, UploadSession::status)
    }

    pub fn is_uploading(&self) -> bool {
        self.inner.state().upload.is_some()
    }
}
