//! Device session lifecycle.
//!
//! One session owns one transport. Outbound frames are serialized through
//! an async mutex that also owns the sequence counter. Inbound notification
//! chunks flow through a channel into a pump task that exclusively owns the
//! frame assembler. A link watcher turns unexpected disconnects into a
//! bounded reconnect loop.
//!
//! Every connection carries an epoch. User `connect`/`disconnect` and final
//! teardown bump it, and background tasks holding an older epoch stand down
//! without side effects.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use dvb_codec::{decode_frame, encode_frame, Frame, FrameAssembler};
use dvb_core::{gatt, Characteristic};
use dvb_transport::{
    DeviceTarget, GattHealthSnapshot, GattTransport, LinkEvent, TransportError, WriteMode,
};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::command::{route, Command, Route};
use crate::config::DeviceConfig;
use crate::error::DeviceError;
use crate::events::{DeviceEvent, EventBus, UploadOutcome};
use crate::files::FileEntry;
use crate::info::DeviceInfo;
use crate::upload::UploadSession;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
    /// Link lost unexpectedly; background attempts are running.
    Reconnecting,
}

pub(crate) struct SessionState {
    pub(crate) link: LinkState,
    pub(crate) epoch: u64,
    user_disconnect: bool,
    reconnect_attempts: u32,
    pub(crate) mtu: usize,
    pub(crate) info: DeviceInfo,
    pub(crate) catalog: Vec<FileEntry>,
    pub(crate) upload: Option<UploadSession>,
    pump: Option<JoinHandle<()>>,
    watcher: Option<JoinHandle<()>>,
}

impl SessionState {
    fn new(mtu: usize) -> Self {
        Self {
            link: LinkState::Disconnected,
            epoch: 0,
            user_disconnect: false,
            reconnect_attempts: 0,
            mtu,
            info: DeviceInfo::default(),
            catalog: Vec::new(),
            upload: None,
            pump: None,
            watcher: None,
        }
    }

    fn clear_device_scope(&mut self) {
        self.info = DeviceInfo::default();
        self.catalog.clear();
        self.upload = None;
    }

    fn take_tasks(&mut self) -> [Option<JoinHandle<()>>; 2] {
        [self.pump.take(), self.watcher.take()]
    }
}

enum Commit {
    Connected { resume_upload: bool },
    Superseded { release: bool },
}

fn abort_all(tasks: [Option<JoinHandle<()>>; 2]) {
    for task in tasks.into_iter().flatten() {
        task.abort();
    }
}

pub(crate) struct Inner<T> {
    pub(crate) transport: T,
    pub(crate) config: DeviceConfig,
    target: DeviceTarget,
    pub(crate) events: EventBus,
    state: Mutex<SessionState>,
    /// Serializes SMP writes; holds the next sequence number.
    writer: AsyncMutex<u8>,
    /// Publishes the current epoch so sleeping loops can stand down.
    cancel: watch::Sender<u64>,
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        abort_all(state.take_tasks());
    }
}

/// A connection to one DVB unit.
///
/// Clones share the same session.
pub struct DeviceSession<T> {
    pub(crate) inner: Arc<Inner<T>>,
}

impl<T> Clone for DeviceSession<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: GattTransport> DeviceSession<T> {
    pub fn new(transport: T, target: DeviceTarget, config: DeviceConfig) -> Self {
        let (cancel, _) = watch::channel(0);
        let events = EventBus::new(config.event_capacity);
        let state = Mutex::new(SessionState::new(config.mtu));
        Self {
            inner: Arc::new(Inner {
                transport,
                config,
                target,
                events,
                state,
                writer: AsyncMutex::new(0),
                cancel,
            }),
        }
    }

    /// Subscribes to session events. Events emitted earlier are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.inner.events.subscribe()
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn link_state(&self) -> LinkState {
        self.inner.state().link
    }

    pub fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state().reconnect_attempts
    }

    pub fn mtu(&self) -> usize {
        self.inner.state().mtu
    }

    pub fn device_name(&self) -> Option<String> {
        self.inner.transport.device_name()
    }

    pub fn health(&self) -> GattHealthSnapshot {
        self.inner.transport.health_snapshot()
    }

    /// Sequence number the next outbound frame will carry.
    pub async fn next_sequence(&self) -> u8 {
        *self.inner.writer.lock().await
    }

    /// Connects, subscribes to SMP notifications and resumes any upload
    /// left running by a previous connection.
    ///
    /// On failure the partial connection is torn down, subscribers see
    /// `Disconnected`, and the error is returned.
    pub async fn connect(&self) -> Result<(), DeviceError> {
        let epoch = {
            let mut state = self.inner.state();
            match state.link {
                LinkState::Connected => return Ok(()),
                LinkState::Connecting => {
                    return Err(TransportError::Connection(
                        "connection already in progress".to_string(),
                    )
                    .into())
                }
                LinkState::Disconnected | LinkState::Reconnecting => {}
            }
            state.user_disconnect = false;
            state.epoch += 1;
            state.link = LinkState::Connecting;
            state.reconnect_attempts = 0;
            state.epoch
        };
        self.inner.cancel.send_replace(epoch);
        info!(prefix = %self.inner.target.name_prefix, "connecting");

        match self.inner.establish(epoch).await {
            Ok(()) => Ok(()),
            Err(err) => {
                error!(error = %err, "connect failed");
                self.inner.teardown(epoch).await;
                Err(err)
            }
        }
    }

    /// Drops the link, stops any reconnect or download loop and clears
    /// device-scoped state. Calling it while disconnected is a no-op.
    pub async fn disconnect(&self) -> Result<(), DeviceError> {
        let (was_active, tasks, epoch) = {
            let mut state = self.inner.state();
            state.user_disconnect = true;
            state.epoch += 1;
            let was_active = state.link != LinkState::Disconnected;
            state.link = LinkState::Disconnected;
            state.reconnect_attempts = 0;
            state.clear_device_scope();
            (was_active, state.take_tasks(), state.epoch)
        };
        self.inner.cancel.send_replace(epoch);
        abort_all(tasks);
        let result = self.inner.transport.disconnect().await;
        if was_active {
            info!("disconnected");
            self.inner.events.emit(DeviceEvent::Disconnected);
        }
        result.map_err(DeviceError::from)
    }

    pub async fn send_command(&self, command: Command) -> Result<(), DeviceError> {
        self.inner.send_command(&command).await
    }

    pub async fn reset_device(&self) -> Result<(), DeviceError> {
        self.send_command(Command::Reset).await
    }

    pub async fn echo(&self, message: impl Into<String>) -> Result<(), DeviceError> {
        self.send_command(Command::Echo(message.into())).await
    }

    pub async fn query_image_state(&self) -> Result<(), DeviceError> {
        self.send_command(Command::ImageState).await
    }

    pub async fn erase_image(&self) -> Result<(), DeviceError> {
        self.send_command(Command::ImageErase).await
    }

    pub async fn test_image(&self, hash: &[u8]) -> Result<(), DeviceError> {
        self.send_command(Command::ImageTest {
            hash: hash.to_vec(),
        })
        .await
    }

    pub async fn confirm_image(&self, hash: &[u8]) -> Result<(), DeviceError> {
        self.send_command(Command::ImageConfirm {
            hash: hash.to_vec(),
        })
        .await
    }
}

impl<T: GattTransport> Inner<T> {
    pub(crate) fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), DeviceError> {
        if self.state().link == LinkState::Connected {
            Ok(())
        } else {
            Err(DeviceError::NotConnected)
        }
    }

    pub(crate) fn current_epoch(&self) -> u64 {
        self.state().epoch
    }

    /// Encodes and writes one frame, advancing the sequence counter only
    /// after the write succeeds.
    pub(crate) async fn send_command(&self, command: &Command) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        let body = command.body();
        let mut seq = self.writer.lock().await;
        let frame = encode_frame(command.op(), command.group(), command.id(), *seq, body.as_ref())?;
        self.transport
            .write(gatt::SMP, &frame, WriteMode::WithoutResponse)
            .await?;
        debug!(
            op = command.op(),
            group = command.group(),
            id = command.id(),
            seq = *seq,
            len = frame.len(),
            "frame sent"
        );
        *seq = seq.wrapping_add(1);
        Ok(())
    }

    pub(crate) async fn read_characteristic(
        &self,
        characteristic: Characteristic,
    ) -> Result<Vec<u8>, DeviceError> {
        self.ensure_connected()?;
        let value = self.transport.read(characteristic).await?;
        debug!(%characteristic, value = %hex::encode(&value), "read");
        Ok(value)
    }

    /// Writes to an auxiliary characteristic using the preferred write mode.
    pub(crate) async fn write_auxiliary(
        &self,
        characteristic: Characteristic,
        bytes: &[u8],
    ) -> Result<(), DeviceError> {
        self.ensure_connected()?;
        let mode = self
            .transport
            .properties(characteristic)?
            .preferred_write_mode()
            .ok_or(TransportError::WriteNotSupported(characteristic.uuid))?;
        self.transport.write(characteristic, bytes, mode).await?;
        debug!(%characteristic, value = %hex::encode(bytes), ?mode, "wrote");
        Ok(())
    }

    /// Sleeps for `delay` unless `epoch` is superseded first. Returns
    /// `false` when cancelled.
    pub(crate) async fn sleep_unless_cancelled(&self, epoch: u64, delay: Duration) -> bool {
        let mut cancel = self.cancel.subscribe();
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = superseded(&mut cancel, epoch) => false,
        }
    }

    async fn establish(self: &Arc<Self>, epoch: u64) -> Result<(), DeviceError> {
        let link_events = self.transport.link_events();
        self.transport.connect(&self.target).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        if let Err(err) = self.transport.subscribe(gatt::SMP, tx).await {
            let _ = self.transport.disconnect().await;
            return Err(err.into());
        }

        let commit = {
            let mut state = self.state();
            if state.epoch != epoch || state.user_disconnect {
                // A newer connect owns the link unless the user asked to drop it.
                Commit::Superseded {
                    release: state.user_disconnect || state.link == LinkState::Disconnected,
                }
            } else {
                abort_all(state.take_tasks());
                state.pump = Some(spawn_pump(Arc::downgrade(self), rx));
                state.watcher = Some(spawn_link_watcher(
                    Arc::downgrade(self),
                    link_events,
                    epoch,
                ));
                state.link = LinkState::Connected;
                state.reconnect_attempts = 0;
                if let Some(mtu) = self.transport.mtu_hint() {
                    state.mtu = mtu;
                }
                Commit::Connected {
                    resume_upload: state.upload.is_some(),
                }
            }
        };
        let resume_upload = match commit {
            Commit::Connected { resume_upload } => resume_upload,
            Commit::Superseded { release } => {
                debug!(release, "connection superseded");
                if release {
                    let _ = self.transport.disconnect().await;
                }
                return Err(DeviceError::Cancelled);
            }
        };

        self.events.emit(DeviceEvent::Connecting);
        self.events.emit(DeviceEvent::Connected);
        info!(name = ?self.transport.device_name(), "connected");
        if resume_upload {
            info!("resuming upload");
            self.send_next_chunk().await;
        }
        Ok(())
    }

    /// Full teardown for `epoch`; a no-op once the epoch is superseded.
    async fn teardown(&self, epoch: u64) {
        let (tasks, next_epoch) = {
            let mut state = self.state();
            if state.epoch != epoch {
                return;
            }
            state.epoch += 1;
            state.link = LinkState::Disconnected;
            state.reconnect_attempts = 0;
            state.clear_device_scope();
            (state.take_tasks(), state.epoch)
        };
        self.cancel.send_replace(next_epoch);
        abort_all(tasks);
        let _ = self.transport.disconnect().await;
        self.events.emit(DeviceEvent::Disconnected);
    }

    async fn handle_frame(&self, frame: Frame) {
        let upload_active = self.state().upload.is_some();
        match route(frame, upload_active) {
            Route::UploadAck { off } => {
                let accepted = self
                    .state()
                    .upload
                    .as_mut()
                    .is_some_and(|upload| upload.acknowledge(off));
                if accepted {
                    self.send_next_chunk().await;
                } else {
                    debug!(off, "ignoring stale upload acknowledgment");
                }
            }
            Route::UploadRejected { rc } => {
                if self.state().upload.take().is_some() {
                    warn!(rc, "device rejected upload");
                    self.events
                        .emit(DeviceEvent::UploadFinished(UploadOutcome::Rejected { rc }));
                }
            }
            Route::Forward(message) => {
                debug!(
                    op = message.op,
                    group = message.group,
                    id = message.id,
                    seq = message.seq,
                    "message received"
                );
                self.events.emit(DeviceEvent::Message(message));
            }
        }
    }

    fn handle_link_loss(self: &Arc<Self>, epoch: u64) {
        {
            let mut state = self.state();
            if state.epoch != epoch || state.user_disconnect || state.link != LinkState::Connected
            {
                debug!("ignoring link loss of superseded connection");
                return;
            }
            state.link = LinkState::Reconnecting;
            state.reconnect_attempts = 0;
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            // Dropping our own handle detaches the watcher; it exits below.
            state.watcher = None;
        }
        warn!("link lost, reconnecting");
        spawn_reconnect(Arc::clone(self), epoch);
    }

    async fn reconnect_loop(self: Arc<Self>, epoch: u64) {
        let max_attempts = self.config.max_reconnect_attempts;
        loop {
            let attempt = {
                let mut state = self.state();
                if state.epoch != epoch || state.user_disconnect {
                    debug!("reconnect cancelled");
                    return;
                }
                if state.reconnect_attempts >= max_attempts {
                    None
                } else {
                    state.reconnect_attempts += 1;
                    Some(state.reconnect_attempts)
                }
            };
            let Some(attempt) = attempt else {
                error!(attempts = max_attempts, "max reconnection attempts reached");
                self.teardown(epoch).await;
                return;
            };

            info!(attempt, max_attempts, "reconnect attempt");
            match self.establish(epoch).await {
                Ok(()) => {
                    info!(attempt, "reconnected");
                    return;
                }
                Err(DeviceError::Cancelled) => return,
                Err(err) => {
                    warn!(attempt, error = %err, "reconnect attempt failed");
                    if self.current_epoch() == epoch {
                        let _ = self.transport.disconnect().await;
                    }
                }
            }

            if !self
                .sleep_unless_cancelled(epoch, self.config.reconnect_delay)
                .await
            {
                debug!("reconnect cancelled");
                return;
            }
        }
    }
}

async fn superseded(cancel: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *cancel.borrow_and_update() != epoch {
            return;
        }
        if cancel.changed().await.is_err() {
            return;
        }
    }
}

fn spawn_pump<T: GattTransport>(
    inner: Weak<Inner<T>>,
    mut notifications: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut assembler = FrameAssembler::new();
        while let Some(chunk) = notifications.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            for raw in assembler.feed(&chunk) {
                match decode_frame(&raw) {
                    Ok(frame) => inner.handle_frame(frame).await,
                    Err(err) => {
                        warn!(error = %err, frame = %hex::encode(&raw), "dropping malformed frame")
                    }
                }
            }
        }
        debug!("notification pump stopped");
    })
}

fn spawn_link_watcher<T: GattTransport>(
    inner: Weak<Inner<T>>,
    mut events: broadcast::Receiver<LinkEvent>,
    epoch: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(LinkEvent::Disconnected) => break,
                Ok(LinkEvent::Connected) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return,
            }
        }
        if let Some(inner) = inner.upgrade() {
            inner.handle_link_loss(epoch);
        }
    })
}

fn spawn_reconnect<T: GattTransport>(inner: Arc<Inner<T>>, epoch: u64) {
    tokio::spawn(inner.reconnect_loop(epoch));
}
