//! Link Service Module
//!
//! A single task owns the transport, the link state, the characteristic
//! registry, the transfer slot and the op queue. Callers talk to it through a
//! cloneable [`LinkHandle`].
//!
//! Between two link operations the actor drains its inbox (requests, then
//! notifications) before running the next queued op, so requests are answered
//! (`Busy`, `NotReady`, ...) while a transfer is in flight and dispatcher
//! commands interleave with transfer steps.
//!
//! While an acquisition waits on a notification a deadline of `ack_timeout`
//! is armed. It is re-armed by every image command acknowledgment.

use crate::domain::models::{
    AppEvent, ConnectionStatus, MessageSeverity, StatusMessage, UploadProgress,
};
use crate::domain::settings::Settings;
use crate::infrastructure::bluetooth::acquisition::{Acquired, AcquisitionAction, ImageTransfer};
use crate::infrastructure::bluetooth::command::PendingCommand;
use crate::infrastructure::bluetooth::connection::{
    ConnectionConfig, LinkManager, LinkOp, LinkProgress, LinkReply, LinkState,
};
use crate::infrastructure::bluetooth::error::{
    CommandError, LinkError, OpFailure, TransferError,
};
use crate::infrastructure::bluetooth::protocol::{self, Channel, ImageCommand};
use crate::infrastructure::bluetooth::registry::ChannelMap;
use crate::infrastructure::bluetooth::transport::{
    GattTransport, Notification, NotificationStream, TransportError,
};
use crate::infrastructure::bluetooth::upload::{chunk_count, ChunkedTransfer, UploadStep};
use futures::StreamExt;
use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Retry policy for upload data writes
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub connection: ConnectionConfig,
    /// Bounds device lookup and service discovery
    pub connect_timeout: Duration,
    /// Bounds every other link operation
    pub ack_timeout: Duration,
    pub default_chunk_size: usize,
    pub max_image_size: usize,
    pub write_retry: RetryPolicy,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            connect_timeout: Duration::from_secs(15),
            ack_timeout: Duration::from_secs(3),
            default_chunk_size: protocol::DEFAULT_CHUNK_SIZE,
            max_image_size: 2 * 1024 * 1024,
            write_retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(50),
            },
        }
    }
}

impl LinkConfig {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            connection: ConnectionConfig {
                channel_map: ChannelMap::from_settings(&settings.ble)?,
                requested_mtu: settings.ble.requested_mtu,
            },
            connect_timeout: Duration::from_millis(settings.ble.connect_timeout_ms),
            ack_timeout: Duration::from_millis(settings.ble.ack_timeout_ms),
            default_chunk_size: settings.transfer.default_chunk_size,
            max_image_size: settings.transfer.max_image_size,
            write_retry: RetryPolicy {
                max_attempts: settings.transfer.write_retry_attempts.max(1),
                backoff: Duration::from_millis(settings.transfer.write_retry_backoff_ms),
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub destination: String,
    pub bytes: usize,
    pub chunks: usize,
}

/// Point-in-time view of the link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub att_mtu: u16,
    pub channels: usize,
    pub transfer_active: bool,
    pub device_id: Option<String>,
}

impl LinkSnapshot {
    fn closed() -> Self {
        Self {
            state: LinkState::Disconnected,
            att_mtu: protocol::DEFAULT_ATT_MTU,
            channels: 0,
            transfer_active: false,
            device_id: None,
        }
    }
}

enum Request {
    Connect {
        device_id: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    Disconnect {
        reply: oneshot::Sender<bool>,
    },
    Upload {
        destination: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<UploadReport, TransferError>>,
    },
    Acquire {
        reply: oneshot::Sender<Result<Acquired, TransferError>>,
    },
    Command {
        command: PendingCommand,
        reply: oneshot::Sender<Result<(), CommandError>>,
    },
    Battery {
        reply: oneshot::Sender<Result<u8, CommandError>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<LinkSnapshot>,
    },
}

/// Handle to the link actor. Cheap to clone.
#[derive(Clone)]
pub struct LinkHandle {
    requests: mpsc::UnboundedSender<Request>,
}

impl LinkHandle {
    /// Bring the link to `Ready`.
    pub async fn connect(&self, device_id: &str) -> Result<(), LinkError> {
        let device_id = device_id.to_string();
        self.call(
            |reply| Request::Connect { device_id, reply },
            Err(LinkError::NotConnected),
        )
        .await
    }

    /// Close the link. Returns false when it was already disconnected.
    pub async fn disconnect(&self) -> bool {
        self.call(|reply| Request::Disconnect { reply }, false).await
    }

    /// Push `payload` to `destination` on the glasses.
    pub async fn upload(
        &self,
        destination: &str,
        payload: Vec<u8>,
    ) -> Result<UploadReport, TransferError> {
        let destination = destination.to_string();
        self.call(
            |reply| Request::Upload {
                destination,
                payload,
                reply,
            },
            Err(TransferError::NotReady),
        )
        .await
    }

    /// Capture a frame on the glasses and pull it back.
    pub async fn acquire_image(&self) -> Result<Acquired, TransferError> {
        self.call(|reply| Request::Acquire { reply }, Err(TransferError::NotReady))
            .await
    }

    pub async fn send_command(&self, command: PendingCommand) -> Result<(), CommandError> {
        self.call(
            |reply| Request::Command { command, reply },
            Err(CommandError::NotReady),
        )
        .await
    }

    /// Battery level in percent.
    pub async fn battery(&self) -> Result<u8, CommandError> {
        self.call(|reply| Request::Battery { reply }, Err(CommandError::NotReady))
            .await
    }

    /// Abort the active transfer, if any.
    pub async fn cancel_transfer(&self) -> bool {
        self.call(|reply| Request::Cancel { reply }, false).await
    }

    pub async fn snapshot(&self) -> LinkSnapshot {
        self.call(|reply| Request::Snapshot { reply }, LinkSnapshot::closed())
            .await
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request, closed: T) -> T {
        let (reply, response) = oneshot::channel();
        if self.requests.send(make(reply)).is_err() {
            return closed;
        }
        response.await.unwrap_or(closed)
    }
}

enum ActiveTransfer {
    Upload {
        transfer: ChunkedTransfer,
        reply: oneshot::Sender<Result<UploadReport, TransferError>>,
    },
    Acquisition {
        transfer: ImageTransfer,
        reply: oneshot::Sender<Result<Acquired, TransferError>>,
    },
}

struct CommandJob {
    name: String,
    /// Command-in write still owed after the argument write
    then: Option<(Uuid, Vec<u8>)>,
    reply: oneshot::Sender<Result<(), CommandError>>,
}

enum AcquisitionOp {
    Write(ImageCommand),
    ReadLength,
}

/// One link operation waiting for its turn
enum Queued {
    Link(LinkOp),
    Upload(UploadStep),
    Acquisition(AcquisitionOp),
    Command {
        uuid: Uuid,
        value: Vec<u8>,
        job: CommandJob,
    },
    Battery {
        uuid: Uuid,
        reply: oneshot::Sender<Result<u8, CommandError>>,
    },
}

pub struct LinkService<T: GattTransport> {
    transport: T,
    config: LinkConfig,
    link: LinkManager,
    slot: Option<ActiveTransfer>,
    ops: VecDeque<Queued>,
    /// Argument commands held back while an upload's file name is pending on the device
    deferred: VecDeque<Queued>,
    notifications: Option<NotificationStream>,
    /// When the awaited `image_ready` or image chunk is overdue
    deadline: Option<Instant>,
    pending_connect: Option<oneshot::Sender<Result<(), LinkError>>>,
    event_sender: mpsc::UnboundedSender<AppEvent>,
}

impl<T: GattTransport + 'static> LinkService<T> {
    /// Start the actor on the current runtime.
    pub fn spawn(
        transport: T,
        config: LinkConfig,
        event_sender: mpsc::UnboundedSender<AppEvent>,
    ) -> (LinkHandle, JoinHandle<()>) {
        let (requests, inbox) = mpsc::unbounded_channel();
        let service = Self {
            transport,
            link: LinkManager::new(config.connection.clone()),
            config,
            slot: None,
            ops: VecDeque::new(),
            deferred: VecDeque::new(),
            notifications: None,
            deadline: None,
            pending_connect: None,
            event_sender,
        };
        let task = tokio::spawn(service.run(inbox));
        (LinkHandle { requests }, task)
    }

    async fn run(mut self, mut inbox: mpsc::UnboundedReceiver<Request>) {
        info!("Link service started");
        loop {
            tokio::select! {
                biased;
                request = inbox.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => break,
                },
                notification = next_notification(&mut self.notifications) => match notification {
                    Some(notification) => self.on_notification(notification),
                    None => self.on_link_lost().await,
                },
                _ = sleep_until(self.deadline) => self.on_acquisition_deadline(),
                _ = std::future::ready(()), if !self.ops.is_empty() => self.run_next_op().await,
            }
        }
        self.teardown().await;
        info!("Link service stopped");
    }

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Connect { device_id, reply } => match self.link.begin_connect(&device_id) {
                Ok(op) => {
                    self.pending_connect = Some(reply);
                    self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Connecting));
                    self.send_log(
                        format!("Connecting to {}...", device_id),
                        MessageSeverity::Info,
                    );
                    self.ops.push_back(Queued::Link(op));
                }
                Err(e) => {
                    debug!("Connect rejected: {}", e);
                    let _ = reply.send(Err(e));
                }
            },
            Request::Disconnect { reply } => {
                let was_connected = self.teardown().await;
                if was_connected {
                    info!("Disconnected from device");
                    self.send_log("Disconnected from device", MessageSeverity::Info);
                }
                let _ = reply.send(was_connected);
            }
            Request::Upload {
                destination,
                payload,
                reply,
            } => self.start_upload(destination, payload, reply),
            Request::Acquire { reply } => self.start_acquisition(reply),
            Request::Command { command, reply } => self.queue_command(command, reply),
            Request::Battery { reply } => {
                if !self.link.is_ready() {
                    let _ = reply.send(Err(CommandError::NotReady));
                    return;
                }
                match self.uuid_of(Channel::Battery) {
                    Some(uuid) => self.ops.push_back(Queued::Battery { uuid, reply }),
                    None => {
                        let _ = reply.send(Err(CommandError::ChannelUnavailable(Channel::Battery)));
                    }
                }
            }
            Request::Cancel { reply } => {
                let cancelled = self.abort_transfer();
                if cancelled {
                    self.send_log("Transfer cancelled", MessageSeverity::Warning);
                }
                let _ = reply.send(cancelled);
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(LinkSnapshot {
                    state: self.link.state(),
                    att_mtu: self.link.att_mtu(),
                    channels: self.link.registry().len(),
                    transfer_active: self.slot.is_some(),
                    device_id: self.link.device_id().map(str::to_string),
                });
            }
        }
    }

    fn start_upload(
        &mut self,
        destination: String,
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<UploadReport, TransferError>>,
    ) {
        if !self.link.is_ready() {
            let _ = reply.send(Err(TransferError::NotReady));
            return;
        }
        if self.slot.is_some() {
            debug!("Upload to {} rejected: transfer slot busy", destination);
            let _ = reply.send(Err(TransferError::Busy));
            return;
        }

        let chunk_size = self.link.chunk_size(self.config.default_chunk_size);
        let mut transfer = match ChunkedTransfer::new(destination, payload, chunk_size) {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!("Upload rejected: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
        };

        info!(
            "Uploading {} bytes to {} in {} chunks of {}",
            transfer.total(),
            transfer.destination(),
            chunk_count(transfer.total(), chunk_size),
            chunk_size
        );
        let first = transfer.begin();
        self.slot = Some(ActiveTransfer::Upload { transfer, reply });
        if let Some(step) = first {
            self.ops.push_back(Queued::Upload(step));
        }
    }

    fn start_acquisition(&mut self, reply: oneshot::Sender<Result<Acquired, TransferError>>) {
        if !self.link.is_ready() {
            let _ = reply.send(Err(TransferError::NotReady));
            return;
        }
        if self.slot.is_some() {
            debug!("Image request rejected: transfer slot busy");
            let _ = reply.send(Err(TransferError::Busy));
            return;
        }

        debug!("Requesting image from the glasses");
        let mut transfer = ImageTransfer::new(self.config.max_image_size);
        let action = transfer.begin();
        self.slot = Some(ActiveTransfer::Acquisition { transfer, reply });
        self.apply_acquisition(action);
    }

    fn queue_command(
        &mut self,
        command: PendingCommand,
        reply: oneshot::Sender<Result<(), CommandError>>,
    ) {
        if !self.link.is_ready() {
            let _ = reply.send(Err(CommandError::NotReady));
            return;
        }
        let Some(command_uuid) = self.uuid_of(Channel::CommandIn) else {
            let _ = reply.send(Err(CommandError::ChannelUnavailable(Channel::CommandIn)));
            return;
        };

        let PendingCommand { name, argument } = command;
        let command_bytes = name.clone().into_bytes();
        match argument {
            Some(argument) => {
                let Some(name_uuid) = self.uuid_of(Channel::FileName) else {
                    let _ = reply.send(Err(CommandError::ChannelUnavailable(Channel::FileName)));
                    return;
                };
                debug!("Queueing command {} ({})", name, argument);
                let queued = Queued::Command {
                    uuid: name_uuid,
                    value: argument.into_bytes(),
                    job: CommandJob {
                        name,
                        then: Some((command_uuid, command_bytes)),
                        reply,
                    },
                };
                if self.upload_in_preamble() {
                    debug!("Holding command until the upload has started");
                    self.deferred.push_back(queued);
                } else {
                    self.ops.push_back(queued);
                }
            }
            None => {
                debug!("Queueing command {}", name);
                self.ops.push_back(Queued::Command {
                    uuid: command_uuid,
                    value: command_bytes,
                    job: CommandJob {
                        name,
                        then: None,
                        reply,
                    },
                });
            }
        }
    }

    async fn run_next_op(&mut self) {
        let Some(queued) = self.ops.pop_front() else {
            return;
        };

        match queued {
            Queued::Link(op) => {
                let reply = self.execute_link(op).await;
                self.on_link_reply(reply).await;
            }
            Queued::Upload(step) => {
                let retry = matches!(step, UploadStep::Data(_));
                let result = match self.uuid_of(step.channel()) {
                    Some(uuid) => self.write(uuid, step.into_bytes(), retry).await,
                    None => Err(OpFailure::Transport(TransportError::NotConnected)),
                };
                self.on_upload_written(result);
            }
            Queued::Acquisition(AcquisitionOp::Write(command)) => {
                let result = match self.uuid_of(Channel::ImageCommand) {
                    Some(uuid) => self.write(uuid, command.as_bytes().to_vec(), false).await,
                    None => Err(OpFailure::Transport(TransportError::NotConnected)),
                };
                self.on_image_command_written(result);
            }
            Queued::Acquisition(AcquisitionOp::ReadLength) => {
                let result = match self.uuid_of(Channel::ImageLength) {
                    Some(uuid) => self.read(uuid).await,
                    None => Err(OpFailure::Transport(TransportError::NotConnected)),
                };
                self.on_image_length(result);
            }
            Queued::Command { uuid, value, job } => {
                let result = self.write(uuid, value, false).await;
                self.on_command_written(job, result);
            }
            Queued::Battery { uuid, reply } => {
                let level = match self.read(uuid).await {
                    Ok(raw) => protocol::parse_battery(&raw).ok_or_else(|| {
                        CommandError::ReadFailed(format!("unexpected battery value {:?}", raw))
                    }),
                    Err(e) => Err(CommandError::ReadFailed(e.to_string())),
                };
                let _ = reply.send(level);
            }
        }
    }

    async fn execute_link(&mut self, op: LinkOp) -> Result<LinkReply, OpFailure> {
        let ack = self.config.ack_timeout;
        let slow = self.config.connect_timeout;
        match op {
            LinkOp::Open(device_id) => timed(slow, self.transport.connect(&device_id))
                .await
                .map(|_| LinkReply::Opened),
            LinkOp::RequestMtu(mtu) => timed(ack, self.transport.request_mtu(mtu))
                .await
                .map(LinkReply::Mtu),
            LinkOp::Discover => timed(slow, self.transport.discover())
                .await
                .map(LinkReply::Discovered),
            LinkOp::Subscribe(uuid) => timed(ack, self.transport.subscribe(uuid))
                .await
                .map(|_| LinkReply::Subscribed),
            LinkOp::Listen => {
                let stream = timed(ack, self.transport.notifications()).await?;
                self.notifications = Some(stream);
                Ok(LinkReply::Listening)
            }
        }
    }

    async fn on_link_reply(&mut self, reply: Result<LinkReply, OpFailure>) {
        match self.link.on_reply(reply) {
            LinkProgress::Next(op) => self.ops.push_back(Queued::Link(op)),
            LinkProgress::Ready => {
                self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Ready));
                self.send_log("Connected to glasses", MessageSeverity::Success);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            LinkProgress::Failed(err) => {
                error!("Connection failed: {}", err);
                self.notifications = None;
                self.ops.retain(|queued| !matches!(queued, Queued::Link(_)));
                if let Err(e) = timed(self.config.ack_timeout, self.transport.disconnect()).await
                {
                    debug!("Closing after a failed connect: {}", e);
                }
                self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Error));
                self.send_log(format!("Connection failed: {}", err), MessageSeverity::Error);
                if let Some(reply) = self.pending_connect.take() {
                    let _ = reply.send(Err(err));
                }
            }
        }
    }

    fn on_upload_written(&mut self, result: Result<(), OpFailure>) {
        enum Outcome {
            Next(UploadStep, Option<UploadProgress>),
            Finished(Result<UploadReport, TransferError>),
        }

        let outcome = match self.slot.as_mut() {
            Some(ActiveTransfer::Upload { transfer, .. }) => match result {
                Ok(()) => {
                    let before = transfer.cursor();
                    match transfer.on_ack() {
                        Some(step) => {
                            let progress = (transfer.cursor() != before).then(|| UploadProgress {
                                destination: transfer.destination().to_string(),
                                sent: transfer.cursor(),
                                total: transfer.total(),
                            });
                            Outcome::Next(step, progress)
                        }
                        None => Outcome::Finished(Ok(UploadReport {
                            destination: transfer.destination().to_string(),
                            bytes: transfer.total(),
                            chunks: chunk_count(transfer.total(), transfer.chunk_size()),
                        })),
                    }
                }
                Err(e) => Outcome::Finished(Err(transfer.fail(e.to_string()))),
            },
            _ => {
                debug!("Dropping upload acknowledgment without an active upload");
                return;
            }
        };

        match outcome {
            Outcome::Next(step, progress) => {
                if let Some(progress) = progress {
                    trace!("Uploaded {}/{} bytes", progress.sent, progress.total);
                    self.publish(AppEvent::UploadProgress(progress));
                }
                self.ops.push_back(Queued::Upload(step));
            }
            Outcome::Finished(result) => self.finish_upload(result),
        }
        self.release_deferred();
    }

    fn finish_upload(&mut self, result: Result<UploadReport, TransferError>) {
        match self.slot.take() {
            Some(ActiveTransfer::Upload { reply, .. }) => {
                match &result {
                    Ok(report) => {
                        info!("Upload of {} complete ({} bytes)", report.destination, report.bytes);
                        self.send_log(
                            format!("Uploaded {}", report.destination),
                            MessageSeverity::Success,
                        );
                    }
                    Err(e) => {
                        error!("Upload failed: {}", e);
                        self.send_log(format!("Upload failed: {}", e), MessageSeverity::Error);
                    }
                }
                let _ = reply.send(result);
            }
            other => self.slot = other,
        }
    }

    fn on_image_command_written(&mut self, result: Result<(), OpFailure>) {
        let (action, awaits_device) = match self.slot.as_mut() {
            Some(ActiveTransfer::Acquisition { transfer, .. }) => match result {
                Ok(()) => {
                    let action = transfer.on_command_written();
                    (action, transfer.awaits_device())
                }
                Err(e) => {
                    let err = transfer.fail(e.to_string());
                    self.finish_acquisition(Err(err));
                    return;
                }
            },
            _ => return,
        };
        if awaits_device {
            self.deadline = Some(Instant::now() + self.config.ack_timeout);
        }
        self.apply_acquisition(action);
    }

    fn on_acquisition_deadline(&mut self) {
        self.deadline = None;
        let action = match self.slot.as_mut() {
            Some(ActiveTransfer::Acquisition { transfer, .. }) => transfer.on_deadline(),
            _ => return,
        };
        self.apply_acquisition(action);
    }

    fn on_image_length(&mut self, result: Result<Vec<u8>, OpFailure>) {
        let action = match self.slot.as_mut() {
            Some(ActiveTransfer::Acquisition { transfer, .. }) => match result {
                Ok(raw) => transfer.on_length(&raw),
                Err(e) => {
                    let err = transfer.fail(e.to_string());
                    self.finish_acquisition(Err(err));
                    return;
                }
            },
            _ => return,
        };
        self.apply_acquisition(action);
    }

    fn apply_acquisition(&mut self, action: AcquisitionAction) {
        if !matches!(action, AcquisitionAction::Wait) {
            self.deadline = None;
        }
        match action {
            AcquisitionAction::Write(command) => self
                .ops
                .push_back(Queued::Acquisition(AcquisitionOp::Write(command))),
            AcquisitionAction::ReadLength => self
                .ops
                .push_back(Queued::Acquisition(AcquisitionOp::ReadLength)),
            AcquisitionAction::Wait => {}
            AcquisitionAction::Finish(result) => {
                self.finish_acquisition(result.map_err(TransferError::from))
            }
        }
    }

    fn finish_acquisition(&mut self, result: Result<Acquired, TransferError>) {
        match self.slot.take() {
            Some(ActiveTransfer::Acquisition { reply, .. }) => {
                self.deadline = None;
                // Steps of the finished acquisition that are still queued are void
                self.ops
                    .retain(|queued| !matches!(queued, Queued::Acquisition(_)));
                match &result {
                    Ok(Acquired::Image(image)) => {
                        info!(
                            "Image received: {} bytes (jpeg valid: {})",
                            image.data.len(),
                            image.jpeg_valid
                        );
                        self.publish(AppEvent::ImageReceived(image.summary()));
                    }
                    Ok(Acquired::Empty) => debug!("Glasses had no image"),
                    Err(e) => {
                        error!("Image acquisition failed: {}", e);
                        self.send_log(format!("Image transfer failed: {}", e), MessageSeverity::Error);
                    }
                }
                let _ = reply.send(result);
            }
            other => self.slot = other,
        }
    }

    fn on_command_written(&mut self, mut job: CommandJob, result: Result<(), OpFailure>) {
        match result {
            Ok(()) => match job.then.take() {
                Some((uuid, value)) => self.ops.push_front(Queued::Command { uuid, value, job }),
                None => {
                    info!("Command {} sent", job.name);
                    let _ = job.reply.send(Ok(()));
                }
            },
            Err(e) => {
                warn!("Command {} failed: {}", job.name, e);
                let _ = job.reply.send(Err(CommandError::WriteFailed(e.to_string())));
            }
        }
    }

    fn on_notification(&mut self, notification: Notification) {
        match self.link.registry().channel_for(notification.uuid) {
            Some(Channel::ImageData) => {
                let action = match self.slot.as_mut() {
                    Some(ActiveTransfer::Acquisition { transfer, .. }) => {
                        transfer.on_data(&notification.value)
                    }
                    _ => {
                        trace!(
                            "Ignoring {} image bytes without an active acquisition",
                            notification.value.len()
                        );
                        return;
                    }
                };
                self.apply_acquisition(action);
            }
            Some(Channel::StatusNotify) => {
                let Some(status) = protocol::parse_status(&notification.value) else {
                    return;
                };
                debug!("Device status: {}", status.as_str());
                if let Some(ActiveTransfer::Acquisition { transfer, .. }) = self.slot.as_mut() {
                    let action = transfer.on_status(&status);
                    self.apply_acquisition(action);
                }
                self.publish(AppEvent::DeviceStatus(status));
            }
            other => debug!(
                "Unrouted notification from {} ({:?})",
                notification.uuid, other
            ),
        }
    }

    async fn on_link_lost(&mut self) {
        warn!("Link to the glasses lost");
        self.notifications = None;
        if self.teardown().await {
            self.send_log("Glasses disconnected", MessageSeverity::Warning);
        }
    }

    /// Drop everything tied to the connection. Returns false when the link
    /// was already disconnected.
    async fn teardown(&mut self) -> bool {
        let was_connected = self.link.reset();
        self.notifications = None;
        self.abort_transfer();

        for queued in self.ops.drain(..).chain(self.deferred.drain(..)) {
            match queued {
                Queued::Command { job, .. } => {
                    let _ = job.reply.send(Err(CommandError::NotReady));
                }
                Queued::Battery { reply, .. } => {
                    let _ = reply.send(Err(CommandError::NotReady));
                }
                Queued::Link(_) | Queued::Upload(_) | Queued::Acquisition(_) => {}
            }
        }
        if let Some(reply) = self.pending_connect.take() {
            let _ = reply.send(Err(LinkError::NotConnected));
        }

        if was_connected {
            if let Err(e) = timed(self.config.ack_timeout, self.transport.disconnect()).await {
                warn!("Error while closing the connection: {}", e);
            }
            self.publish(AppEvent::ConnectionStatus(ConnectionStatus::Disconnected));
        }
        was_connected
    }

    fn abort_transfer(&mut self) -> bool {
        self.deadline = None;
        let aborted = match self.slot.take() {
            Some(ActiveTransfer::Upload { transfer, reply }) => {
                warn!("Aborting upload to {} at {} bytes", transfer.destination(), transfer.cursor());
                let _ = reply.send(Err(TransferError::Aborted));
                true
            }
            Some(ActiveTransfer::Acquisition { transfer, reply }) => {
                warn!("Aborting image transfer at {} bytes", transfer.received());
                let _ = reply.send(Err(TransferError::Aborted));
                true
            }
            None => false,
        };
        self.ops
            .retain(|queued| !matches!(queued, Queued::Upload(_) | Queued::Acquisition(_)));
        self.release_deferred();
        aborted
    }

    fn upload_in_preamble(&self) -> bool {
        matches!(&self.slot, Some(ActiveTransfer::Upload { transfer, .. }) if transfer.in_preamble())
    }

    fn release_deferred(&mut self) {
        if self.upload_in_preamble() {
            return;
        }
        while let Some(queued) = self.deferred.pop_front() {
            self.ops.push_back(queued);
        }
    }

    fn uuid_of(&self, channel: Channel) -> Option<Uuid> {
        self.link.registry().get(channel).map(|handle| handle.uuid)
    }

    async fn write(&mut self, uuid: Uuid, value: Vec<u8>, retry: bool) -> Result<(), OpFailure> {
        let attempts = if retry {
            self.config.write_retry.max_attempts.max(1)
        } else {
            1
        };

        let mut last = OpFailure::Timeout;
        for attempt in 1..=attempts {
            match timed(self.config.ack_timeout, self.transport.write(uuid, &value)).await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
            if attempt < attempts {
                warn!("Write attempt {}/{} failed: {}", attempt, attempts, last);
                tokio::time::sleep(self.config.write_retry.backoff * attempt).await;
            }
        }
        Err(last)
    }

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, OpFailure> {
        timed(self.config.ack_timeout, self.transport.read(uuid)).await
    }

    fn publish(&self, event: AppEvent) {
        let _ = self.event_sender.send(event);
    }

    fn send_log(&self, message: impl Into<String>, severity: MessageSeverity) {
        self.publish(AppEvent::LogMessage(StatusMessage {
            message: message.into(),
            severity,
        }));
    }
}

async fn timed<T>(
    limit: Duration,
    operation: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, OpFailure> {
    match tokio::time::timeout(limit, operation).await {
        Ok(result) => result.map_err(OpFailure::from),
        Err(_) => Err(OpFailure::Timeout),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Notification> {
    match stream {
        Some(stream) => stream.next().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::DeviceStatus;
    use crate::infrastructure::bluetooth::error::{AcquisitionError, LinkStep, TransferStep};
    use crate::infrastructure::bluetooth::protocol::{
        DeviceCommand, BATTERY_UUID, COMMAND_IN_UUID, FILE_CONTROL_UUID, FILE_DATA_UUID,
        FILE_NAME_UUID, IMAGE_COMMAND_UUID, IMAGE_LENGTH_UUID,
    };
    use crate::infrastructure::bluetooth::testing::{jpeg_image, FakeConfig, FakeGlasses, FakeMonitor};

    fn start(fake: FakeConfig) -> (LinkHandle, FakeMonitor, mpsc::UnboundedReceiver<AppEvent>) {
        start_with(fake, LinkConfig::default())
    }

    fn start_with(
        fake: FakeConfig,
        config: LinkConfig,
    ) -> (LinkHandle, FakeMonitor, mpsc::UnboundedReceiver<AppEvent>) {
        let (glasses, monitor) = FakeGlasses::new(fake);
        let (event_sender, events) = mpsc::unbounded_channel();
        let (handle, _task) = LinkService::spawn(glasses, config, event_sender);
        (handle, monitor, events)
    }

    async fn ready(fake: FakeConfig) -> (LinkHandle, FakeMonitor, mpsc::UnboundedReceiver<AppEvent>) {
        let (handle, monitor, events) = start(fake);
        handle.connect("AR_GLASS").await.unwrap();
        (handle, monitor, events)
    }

    fn file_writes(monitor: &FakeMonitor) -> Vec<(Uuid, Vec<u8>)> {
        monitor
            .writes()
            .into_iter()
            .filter(|(uuid, _)| [FILE_NAME_UUID, FILE_DATA_UUID, FILE_CONTROL_UUID].contains(uuid))
            .collect()
    }

    #[tokio::test]
    async fn test_connect_reaches_ready() {
        let (handle, monitor, mut events) = ready(FakeConfig::default()).await;

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.state, LinkState::Ready);
        assert_eq!(snapshot.channels, 9);
        assert_eq!(snapshot.att_mtu, 512);
        assert_eq!(snapshot.device_id.as_deref(), Some("AR_GLASS"));
        assert_eq!(monitor.connects(), 1);

        assert!(matches!(
            events.recv().await,
            Some(AppEvent::ConnectionStatus(ConnectionStatus::Connecting))
        ));

        assert_eq!(handle.connect("AR_GLASS").await, Err(LinkError::AlreadyReady));
    }

    #[tokio::test]
    async fn test_connect_missing_channel() {
        let (handle, monitor, _events) = start(FakeConfig {
            missing: vec![COMMAND_IN_UUID],
            ..Default::default()
        });

        assert_eq!(
            handle.connect("AR_GLASS").await,
            Err(LinkError::ChannelMissing(Channel::CommandIn))
        );
        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.state, LinkState::Disconnected);
        assert_eq!(snapshot.channels, 0);
        assert_eq!(monitor.disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_device() {
        let (handle, _monitor, _events) = start(FakeConfig::default());
        match handle.connect("missing").await {
            Err(LinkError::Transport { step, .. }) => assert_eq!(step, LinkStep::Open),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_connect_subscribe_timeout() {
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (handle, _monitor, _events) = start_with(
            FakeConfig {
                stall_subscribe: true,
                ..Default::default()
            },
            config,
        );

        assert_eq!(
            handle.connect("AR_GLASS").await,
            Err(LinkError::AcknowledgmentTimeout(LinkStep::EnableImageNotifications))
        );
        assert_eq!(handle.snapshot().await.state, LinkState::Disconnected);
    }

    #[tokio::test]
    async fn test_rejected_mtu_shrinks_chunks() {
        let (handle, monitor, _events) = ready(FakeConfig {
            reject_mtu: true,
            ..Default::default()
        })
        .await;
        assert_eq!(handle.snapshot().await.att_mtu, 23);

        let report = handle.upload("/sdcard/novel/a.txt", vec![7; 50]).await.unwrap();
        assert_eq!(report.chunks, 3);
        let chunks: Vec<usize> = monitor.writes_to(FILE_DATA_UUID).iter().map(Vec::len).collect();
        assert_eq!(chunks, vec![20, 20, 10]);
    }

    #[tokio::test]
    async fn test_upload_wire_sequence() {
        let (handle, monitor, mut events) = ready(FakeConfig::default()).await;
        let payload: Vec<u8> = (0..1000).map(|i| (i % 256) as u8).collect();

        let report = handle
            .upload("/sdcard/novel/book.txt", payload.clone())
            .await
            .unwrap();
        assert_eq!(
            report,
            UploadReport {
                destination: "/sdcard/novel/book.txt".to_string(),
                bytes: 1000,
                chunks: 3,
            }
        );

        assert_eq!(
            file_writes(&monitor),
            vec![
                (FILE_NAME_UUID, b"/sdcard/novel/book.txt".to_vec()),
                (FILE_DATA_UUID, payload[..400].to_vec()),
                (FILE_CONTROL_UUID, b"start".to_vec()),
                (FILE_DATA_UUID, payload[400..800].to_vec()),
                (FILE_CONTROL_UUID, b"update".to_vec()),
                (FILE_DATA_UUID, payload[800..].to_vec()),
                (FILE_CONTROL_UUID, b"update".to_vec()),
                (FILE_CONTROL_UUID, b"end".to_vec()),
            ]
        );

        let mut progress = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let AppEvent::UploadProgress(p) = event {
                progress.push(p.sent);
            }
        }
        assert_eq!(progress, vec![400, 800, 1000]);
    }

    #[tokio::test]
    async fn test_requests_before_ready() {
        let (handle, _monitor, _events) = start(FakeConfig::default());

        assert_eq!(
            handle.upload("/sdcard/a", vec![1]).await,
            Err(TransferError::NotReady)
        );
        assert_eq!(handle.acquire_image().await, Err(TransferError::NotReady));
        assert_eq!(
            handle.send_command(PendingCommand::new(DeviceCommand::VolUp)).await,
            Err(CommandError::NotReady)
        );
        assert_eq!(handle.battery().await, Err(CommandError::NotReady));
    }

    #[tokio::test]
    async fn test_empty_upload_rejected() {
        let (handle, monitor, _events) = ready(FakeConfig::default()).await;
        assert_eq!(
            handle.upload("/sdcard/a", Vec::new()).await,
            Err(TransferError::EmptyPayload)
        );
        assert!(file_writes(&monitor).is_empty());
    }

    #[tokio::test]
    async fn test_second_transfer_is_busy() {
        let (handle, monitor, _events) = ready(FakeConfig {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        let payload = vec![3u8; 4000];
        let uploader = handle.clone();
        let first = tokio::spawn(async move { uploader.upload("/sdcard/music/a.mp3", payload).await });
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert_eq!(
            handle.upload("/sdcard/music/b.mp3", vec![1; 10]).await,
            Err(TransferError::Busy)
        );
        assert_eq!(handle.acquire_image().await, Err(TransferError::Busy));
        assert!(handle.snapshot().await.transfer_active);

        let report = first.await.unwrap().unwrap();
        assert_eq!(report.chunks, 10);

        let writes = file_writes(&monitor);
        assert_eq!(writes.len(), 1 + 10 + 1 + 9 + 1);
        assert_eq!(writes[0], (FILE_NAME_UUID, b"/sdcard/music/a.mp3".to_vec()));
        assert_eq!(monitor.count_writes(FILE_NAME_UUID, b"/sdcard/music/b.mp3"), 0);
    }

    #[tokio::test]
    async fn test_chunk_write_retried() {
        // attempt 0 is the name, attempt 1 the first chunk
        let (handle, monitor, _events) = ready(FakeConfig {
            fail_writes: vec![1],
            ..Default::default()
        })
        .await;

        handle.upload("/sdcard/a", vec![9; 100]).await.unwrap();
        assert_eq!(monitor.writes_to(FILE_DATA_UUID), vec![vec![9; 100]]);
    }

    #[tokio::test]
    async fn test_write_failure_reports_step() {
        // name, chunk 1, start, then chunk 2 fails on every attempt
        let (handle, monitor, _events) = ready(FakeConfig {
            fail_writes: vec![3, 4, 5],
            ..Default::default()
        })
        .await;

        match handle.upload("/sdcard/a", vec![1; 900]).await {
            Err(TransferError::WriteFailed {
                step, bytes_sent, ..
            }) => {
                assert_eq!(step, TransferStep::Chunk);
                assert_eq!(bytes_sent, 400);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(!handle.snapshot().await.transfer_active);
        assert_eq!(monitor.count_writes(FILE_CONTROL_UUID, b"end"), 0);

        // slot was released
        handle.upload("/sdcard/b", vec![1; 10]).await.unwrap();
    }

    #[tokio::test]
    async fn test_acquire_in_four_notifications() {
        let image = jpeg_image(1024);
        let (handle, monitor, _events) = ready(FakeConfig {
            image: image.clone(),
            image_chunk: 256,
            send_image_end: false,
            ..Default::default()
        })
        .await;

        match handle.acquire_image().await.unwrap() {
            Acquired::Image(captured) => {
                assert_eq!(captured.data, image);
                assert!(captured.jpeg_valid);
                assert!(!captured.short_circuited);
            }
            Acquired::Empty => panic!("expected an image"),
        }
        assert_eq!(monitor.count_writes(IMAGE_COMMAND_UUID, b"takeimage"), 1);
        assert_eq!(monitor.count_writes(IMAGE_COMMAND_UUID, b"getimage"), 4);
    }

    #[tokio::test]
    async fn test_acquire_ignores_trailing_end_status() {
        let image = jpeg_image(1000);
        let (handle, _monitor, mut events) = ready(FakeConfig {
            image: image.clone(),
            ..Default::default()
        })
        .await;

        match handle.acquire_image().await.unwrap() {
            Acquired::Image(captured) => assert_eq!(captured.data.len(), 1000),
            Acquired::Empty => panic!("expected an image"),
        }

        // the image_end following the last chunk is only forwarded as a status
        let image_end_seen = async {
            while let Some(event) = events.recv().await {
                if let AppEvent::DeviceStatus(DeviceStatus::ImageEnd) = event {
                    return true;
                }
            }
            false
        };
        assert!(tokio::time::timeout(Duration::from_secs(1), image_end_seen)
            .await
            .unwrap());
        assert!(!handle.snapshot().await.transfer_active);
    }

    #[tokio::test]
    async fn test_acquire_empty() {
        let (handle, monitor, _events) = ready(FakeConfig::default()).await;

        assert_eq!(handle.acquire_image().await, Ok(Acquired::Empty));
        assert_eq!(monitor.reads_of(IMAGE_LENGTH_UUID), 1);
        assert_eq!(monitor.count_writes(IMAGE_COMMAND_UUID, b"getimage"), 0);
    }

    #[tokio::test]
    async fn test_duplicate_ready_reads_length_once() {
        let (handle, monitor, _events) = ready(FakeConfig {
            image: jpeg_image(600),
            ready_repeats: 2,
            ..Default::default()
        })
        .await;

        assert!(matches!(handle.acquire_image().await, Ok(Acquired::Image(_))));
        assert_eq!(monitor.reads_of(IMAGE_LENGTH_UUID), 1);
    }

    #[tokio::test]
    async fn test_acquire_without_ready_reads_length_after_deadline() {
        let image = jpeg_image(800);
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (handle, monitor, _events) = start_with(
            FakeConfig {
                image: image.clone(),
                ready_repeats: 0,
                ..Default::default()
            },
            config,
        );
        handle.connect("AR_GLASS").await.unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(2), handle.acquire_image())
            .await
            .unwrap();
        match acquired.unwrap() {
            Acquired::Image(captured) => assert_eq!(captured.data, image),
            Acquired::Empty => panic!("expected an image"),
        }
        assert_eq!(monitor.reads_of(IMAGE_LENGTH_UUID), 1);
        assert!(!handle.snapshot().await.transfer_active);
        assert!(matches!(handle.acquire_image().await, Ok(Acquired::Image(_))));
    }

    #[tokio::test]
    async fn test_missing_chunk_fails_and_releases_slot() {
        let config = LinkConfig {
            ack_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let (handle, monitor, _events) = start_with(
            FakeConfig {
                image: jpeg_image(800),
                drop_chunks: vec![1],
                ..Default::default()
            },
            config,
        );
        handle.connect("AR_GLASS").await.unwrap();

        let acquired = tokio::time::timeout(Duration::from_secs(2), handle.acquire_image())
            .await
            .unwrap();
        assert_eq!(
            acquired,
            Err(TransferError::Acquisition(AcquisitionError::DataTimeout {
                received: 400,
                declared: 800,
            }))
        );
        assert!(!handle.snapshot().await.transfer_active);
        assert_eq!(monitor.count_writes(IMAGE_COMMAND_UUID, b"getimage"), 2);

        // later requests are served normally
        match handle.acquire_image().await.unwrap() {
            Acquired::Image(captured) => assert_eq!(captured.data.len(), 800),
            Acquired::Empty => panic!("expected an image"),
        }
    }

    #[tokio::test]
    async fn test_declared_size_over_limit() {
        let config = LinkConfig {
            max_image_size: 100,
            ..Default::default()
        };
        let (handle, _monitor, _events) = start_with(
            FakeConfig {
                image: jpeg_image(500),
                ..Default::default()
            },
            config,
        );
        handle.connect("AR_GLASS").await.unwrap();

        assert_eq!(
            handle.acquire_image().await,
            Err(TransferError::Acquisition(
                AcquisitionError::DeclaredSizeInvalid {
                    declared: 500,
                    limit: 100,
                }
            ))
        );
        assert!(!handle.snapshot().await.transfer_active);
    }

    #[tokio::test]
    async fn test_command_with_argument() {
        let (handle, monitor, _events) = ready(FakeConfig::default()).await;

        handle
            .send_command(PendingCommand::with_argument(
                DeviceCommand::DisplayTxt,
                "/novel/a.txt",
            ))
            .await
            .unwrap();
        handle
            .send_command(PendingCommand::new(DeviceCommand::NextPage))
            .await
            .unwrap();

        assert_eq!(
            monitor.writes(),
            vec![
                (FILE_NAME_UUID, b"/novel/a.txt".to_vec()),
                (COMMAND_IN_UUID, b"display_txt".to_vec()),
                (COMMAND_IN_UUID, b"next_page".to_vec()),
            ]
        );
    }

    #[tokio::test]
    async fn test_command_waits_for_upload_start() {
        let (handle, monitor, _events) = ready(FakeConfig {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        let uploader = handle.clone();
        let upload = tokio::spawn(async move { uploader.upload("/sdcard/music/a.mp3", vec![5; 1200]).await });
        tokio::time::sleep(Duration::from_millis(5)).await;

        handle
            .send_command(PendingCommand::with_argument(
                DeviceCommand::PlayMp3,
                "/music/b.mp3",
            ))
            .await
            .unwrap();
        upload.await.unwrap().unwrap();

        let writes = monitor.writes();
        let position = |uuid: Uuid, value: &[u8]| {
            writes
                .iter()
                .position(|(u, v)| *u == uuid && v.as_slice() == value)
                .unwrap()
        };
        let start = position(FILE_CONTROL_UUID, b"start");
        let argument = position(FILE_NAME_UUID, b"/music/b.mp3");
        let command = position(COMMAND_IN_UUID, b"play_mp3");
        assert!(argument > start);
        assert_eq!(command, argument + 1);
        assert_eq!(monitor.writes_to(FILE_DATA_UUID).len(), 3);
    }

    #[tokio::test]
    async fn test_battery() {
        let (handle, monitor, _events) = ready(FakeConfig::default()).await;
        assert_eq!(handle.battery().await, Ok(87));
        assert_eq!(monitor.reads_of(BATTERY_UUID), 1);
    }

    #[tokio::test]
    async fn test_battery_channel_optional() {
        let (handle, _monitor, _events) = ready(FakeConfig {
            missing: vec![BATTERY_UUID],
            ..Default::default()
        })
        .await;
        assert_eq!(
            handle.battery().await,
            Err(CommandError::ChannelUnavailable(Channel::Battery))
        );
    }

    #[tokio::test]
    async fn test_disconnect_aborts_and_is_idempotent() {
        let (handle, monitor, _events) = ready(FakeConfig {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        let uploader = handle.clone();
        let upload = tokio::spawn(async move { uploader.upload("/sdcard/a", vec![0; 4000]).await });
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(handle.disconnect().await);
        assert_eq!(upload.await.unwrap(), Err(TransferError::Aborted));

        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.state, LinkState::Disconnected);
        assert_eq!(snapshot.channels, 0);
        assert!(!snapshot.transfer_active);

        assert!(!handle.disconnect().await);
        assert_eq!(monitor.disconnects(), 1);

        // and the link can be brought up again
        handle.connect("AR_GLASS").await.unwrap();
        assert_eq!(monitor.connects(), 2);
    }

    #[tokio::test]
    async fn test_disconnect_during_connect() {
        let (handle, monitor, _events) = start(FakeConfig::default());

        // both requests are in the inbox before the first link op runs
        let (connected, was_connected) =
            tokio::join!(handle.connect("AR_GLASS"), handle.disconnect());

        assert_eq!(connected, Err(LinkError::NotConnected));
        assert!(was_connected);
        let snapshot = handle.snapshot().await;
        assert_eq!(snapshot.state, LinkState::Disconnected);
        assert_eq!(snapshot.channels, 0);
        assert_eq!(snapshot.device_id, None);
        assert_eq!(monitor.connects(), 0);
        assert_eq!(monitor.disconnects(), 1);

        // the queued open was dropped with the rest of the attempt
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(monitor.connects(), 0);
        handle.connect("AR_GLASS").await.unwrap();
        assert_eq!(monitor.connects(), 1);
    }

    #[tokio::test]
    async fn test_cancel_releases_slot() {
        let (handle, _monitor, _events) = ready(FakeConfig {
            write_delay: Duration::from_millis(10),
            ..Default::default()
        })
        .await;

        let uploader = handle.clone();
        let upload = tokio::spawn(async move { uploader.upload("/sdcard/a", vec![0; 4000]).await });
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(handle.cancel_transfer().await);
        assert_eq!(upload.await.unwrap(), Err(TransferError::Aborted));
        assert!(!handle.cancel_transfer().await);
        assert_eq!(handle.snapshot().await.state, LinkState::Ready);
    }

    #[tokio::test]
    async fn test_link_loss_resets() {
        let (handle, monitor, mut events) = ready(FakeConfig::default()).await;
        monitor.drop_link();

        let disconnected = async {
            while let Some(event) = events.recv().await {
                if let AppEvent::ConnectionStatus(ConnectionStatus::Disconnected) = event {
                    return true;
                }
            }
            false
        };
        assert!(tokio::time::timeout(Duration::from_secs(1), disconnected)
            .await
            .unwrap());
        assert_eq!(handle.snapshot().await.state, LinkState::Disconnected);
        assert_eq!(
            handle.upload("/sdcard/a", vec![1]).await,
            Err(TransferError::NotReady)
        );
    }

    #[tokio::test]
    async fn test_status_forwarded() {
        let (_handle, monitor, mut events) = ready(FakeConfig::default()).await;
        monitor.push_status("ai_work");

        let forwarded = async {
            while let Some(event) = events.recv().await {
                if let AppEvent::DeviceStatus(status) = event {
                    return Some(status);
                }
            }
            None
        };
        let status = tokio::time::timeout(Duration::from_secs(1), forwarded)
            .await
            .unwrap();
        assert_eq!(status, Some(DeviceStatus::AiWork));
    }
}
