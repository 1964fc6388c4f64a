//! BLE Connection Module
//!
//! Link lifecycle of the glasses. [`LinkManager`] is the connect sequence as a
//! state machine: it hands out one [`LinkOp`] at a time and advances only when
//! that op's reply comes back.
//!
//! ```text
//! Disconnected -> Connecting -> NegotiatingCapacity -> DiscoveringChannels
//!     -> EnablingNotification(ImageData) -> EnablingNotification(Status) -> Ready
//! ```

use crate::infrastructure::bluetooth::error::{LinkError, LinkStep, OpFailure};
use crate::infrastructure::bluetooth::protocol::{self, Channel, DEFAULT_ATT_MTU};
use crate::infrastructure::bluetooth::registry::{ChannelMap, CharacteristicRegistry};
use crate::infrastructure::bluetooth::transport::{DiscoveredCharacteristic, TransportError};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationStep {
    ImageData,
    Status,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    NegotiatingCapacity,
    DiscoveringChannels,
    EnablingNotification(NotificationStep),
    Ready,
}

/// Transport operation requested by the connect sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOp {
    Open(String),
    RequestMtu(u16),
    Discover,
    Subscribe(Uuid),
    Listen,
}

#[derive(Debug)]
pub enum LinkReply {
    Opened,
    Mtu(u16),
    Discovered(Vec<DiscoveredCharacteristic>),
    Subscribed,
    Listening,
}

#[derive(Debug, PartialEq, Eq)]
pub enum LinkProgress {
    Next(LinkOp),
    Ready,
    Failed(LinkError),
}

/// Configuration for connection behavior
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub channel_map: ChannelMap,
    pub requested_mtu: u16,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            channel_map: ChannelMap::default(),
            requested_mtu: protocol::REQUESTED_ATT_MTU,
        }
    }
}

#[derive(Debug)]
pub struct LinkManager {
    config: ConnectionConfig,
    state: LinkState,
    registry: CharacteristicRegistry,
    att_mtu: u16,
    awaiting_stream: bool,
    device_id: Option<String>,
}

impl LinkManager {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            state: LinkState::Disconnected,
            registry: CharacteristicRegistry::default(),
            att_mtu: DEFAULT_ATT_MTU,
            awaiting_stream: false,
            device_id: None,
        }
    }

    /// Start the connect sequence; only valid while disconnected.
    pub fn begin_connect(&mut self, device_id: &str) -> Result<LinkOp, LinkError> {
        match self.state {
            LinkState::Disconnected => {}
            LinkState::Ready => return Err(LinkError::AlreadyReady),
            _ => return Err(LinkError::AlreadyConnecting),
        }

        info!("Connecting to {}", device_id);
        self.state = LinkState::Connecting;
        self.att_mtu = DEFAULT_ATT_MTU;
        self.device_id = Some(device_id.to_string());
        Ok(LinkOp::Open(device_id.to_string()))
    }

    /// Feed the reply of the op handed out last.
    pub fn on_reply(&mut self, reply: Result<LinkReply, OpFailure>) -> LinkProgress {
        let step = match self.step() {
            Some(step) => step,
            None => {
                debug!("Ignoring link reply in state {:?}", self.state);
                return LinkProgress::Failed(LinkError::NotConnected);
            }
        };

        match (self.state, reply) {
            (LinkState::Connecting, Ok(LinkReply::Opened)) => {
                self.state = LinkState::NegotiatingCapacity;
                LinkProgress::Next(LinkOp::RequestMtu(self.config.requested_mtu))
            }
            (LinkState::NegotiatingCapacity, Ok(LinkReply::Mtu(mtu))) => {
                info!("ATT MTU negotiated: {}", mtu);
                self.att_mtu = mtu.max(DEFAULT_ATT_MTU);
                self.state = LinkState::DiscoveringChannels;
                LinkProgress::Next(LinkOp::Discover)
            }
            (
                LinkState::NegotiatingCapacity,
                Err(OpFailure::Transport(TransportError::MtuRejected)),
            ) => {
                warn!("MTU request rejected, using the default of {}", DEFAULT_ATT_MTU);
                self.att_mtu = DEFAULT_ATT_MTU;
                self.state = LinkState::DiscoveringChannels;
                LinkProgress::Next(LinkOp::Discover)
            }
            (LinkState::NegotiatingCapacity, Err(OpFailure::Transport(e))) => {
                self.fail(LinkError::NegotiationFailed(e.to_string()))
            }
            (LinkState::DiscoveringChannels, Ok(LinkReply::Discovered(found))) => {
                debug!("Discovered {} characteristics", found.len());
                if let Err(e) = self.registry.populate(&self.config.channel_map, &found) {
                    return self.fail(e);
                }
                self.state = LinkState::EnablingNotification(NotificationStep::ImageData);
                LinkProgress::Next(LinkOp::Subscribe(
                    self.config.channel_map.uuid(Channel::ImageData),
                ))
            }
            (
                LinkState::EnablingNotification(NotificationStep::ImageData),
                Ok(LinkReply::Subscribed),
            ) => {
                self.state = LinkState::EnablingNotification(NotificationStep::Status);
                LinkProgress::Next(LinkOp::Subscribe(
                    self.config.channel_map.uuid(Channel::StatusNotify),
                ))
            }
            (
                LinkState::EnablingNotification(NotificationStep::Status),
                Ok(LinkReply::Subscribed),
            ) if !self.awaiting_stream => {
                self.awaiting_stream = true;
                LinkProgress::Next(LinkOp::Listen)
            }
            (LinkState::EnablingNotification(NotificationStep::Status), Ok(LinkReply::Listening))
                if self.awaiting_stream =>
            {
                self.awaiting_stream = false;
                self.state = LinkState::Ready;
                info!("Link ready (ATT MTU {})", self.att_mtu);
                LinkProgress::Ready
            }
            (_, Err(OpFailure::Timeout)) => self.fail(LinkError::AcknowledgmentTimeout(step)),
            (_, Err(OpFailure::Transport(e))) => self.fail(LinkError::Transport {
                step,
                message: e.to_string(),
            }),
            (state, Ok(reply)) => self.fail(LinkError::Transport {
                step,
                message: format!("unexpected {:?} in {:?}", reply, state),
            }),
        }
    }

    /// Forget the connection. Returns false when already disconnected.
    pub fn reset(&mut self) -> bool {
        if self.state == LinkState::Disconnected {
            return false;
        }
        self.state = LinkState::Disconnected;
        self.device_id = None;
        self.registry.clear();
        self.att_mtu = DEFAULT_ATT_MTU;
        self.awaiting_stream = false;
        true
    }

    /// Connect step in progress
    pub fn step(&self) -> Option<LinkStep> {
        match self.state {
            LinkState::Connecting => Some(LinkStep::Open),
            LinkState::NegotiatingCapacity => Some(LinkStep::NegotiateCapacity),
            LinkState::DiscoveringChannels => Some(LinkStep::DiscoverChannels),
            LinkState::EnablingNotification(NotificationStep::ImageData) => {
                Some(LinkStep::EnableImageNotifications)
            }
            LinkState::EnablingNotification(NotificationStep::Status) if self.awaiting_stream => {
                Some(LinkStep::Listen)
            }
            LinkState::EnablingNotification(NotificationStep::Status) => {
                Some(LinkStep::EnableStatusNotifications)
            }
            LinkState::Disconnected | LinkState::Ready => None,
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn registry(&self) -> &CharacteristicRegistry {
        &self.registry
    }

    pub fn att_mtu(&self) -> u16 {
        self.att_mtu
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    /// Upload chunk size for a transfer starting now.
    pub fn chunk_size(&self, configured: usize) -> usize {
        protocol::chunk_size_for(self.att_mtu, configured)
    }

    fn fail(&mut self, err: LinkError) -> LinkProgress {
        warn!("Connect sequence failed: {}", err);
        self.reset();
        LinkProgress::Failed(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::bluetooth::protocol::{IMAGE_DATA_UUID, STATUS_NOTIFY_UUID};

    fn all_characteristics() -> Vec<DiscoveredCharacteristic> {
        Channel::ALL
            .into_iter()
            .map(|c| DiscoveredCharacteristic {
                uuid: c.default_uuid(),
                service_uuid: Uuid::nil(),
            })
            .collect()
    }

    fn connect_to_ready(link: &mut LinkManager, mtu: Result<LinkReply, OpFailure>) {
        assert_eq!(
            link.begin_connect("AR_GLASS").unwrap(),
            LinkOp::Open("AR_GLASS".to_string())
        );
        assert_eq!(
            link.on_reply(Ok(LinkReply::Opened)),
            LinkProgress::Next(LinkOp::RequestMtu(512))
        );
        assert_eq!(link.on_reply(mtu), LinkProgress::Next(LinkOp::Discover));
        assert_eq!(
            link.on_reply(Ok(LinkReply::Discovered(all_characteristics()))),
            LinkProgress::Next(LinkOp::Subscribe(IMAGE_DATA_UUID))
        );
        assert_eq!(
            link.state(),
            LinkState::EnablingNotification(NotificationStep::ImageData)
        );
        assert_eq!(
            link.on_reply(Ok(LinkReply::Subscribed)),
            LinkProgress::Next(LinkOp::Subscribe(STATUS_NOTIFY_UUID))
        );
        assert_eq!(
            link.on_reply(Ok(LinkReply::Subscribed)),
            LinkProgress::Next(LinkOp::Listen)
        );
        assert_eq!(link.on_reply(Ok(LinkReply::Listening)), LinkProgress::Ready);
    }

    #[test]
    fn test_connect_sequence() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        connect_to_ready(&mut link, Ok(LinkReply::Mtu(512)));

        assert!(link.is_ready());
        assert_eq!(link.registry().len(), 9);
        assert_eq!(link.chunk_size(400), 400);
        assert_eq!(link.begin_connect("x"), Err(LinkError::AlreadyReady));
    }

    #[test]
    fn test_rejected_mtu_falls_back() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        connect_to_ready(
            &mut link,
            Err(OpFailure::Transport(TransportError::MtuRejected)),
        );

        assert_eq!(link.att_mtu(), 23);
        assert_eq!(link.chunk_size(400), 20);
    }

    #[test]
    fn test_negotiation_transport_failure_is_fatal() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        link.begin_connect("AR_GLASS").unwrap();
        link.on_reply(Ok(LinkReply::Opened));

        let progress = link.on_reply(Err(OpFailure::Transport(TransportError::NotConnected)));
        assert_eq!(
            progress,
            LinkProgress::Failed(LinkError::NegotiationFailed("not connected".to_string()))
        );
        assert_eq!(link.state(), LinkState::Disconnected);
    }

    #[test]
    fn test_second_connect_while_connecting() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        link.begin_connect("AR_GLASS").unwrap();
        assert_eq!(link.begin_connect("AR_GLASS"), Err(LinkError::AlreadyConnecting));
    }

    #[test]
    fn test_missing_channel_resets() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        link.begin_connect("AR_GLASS").unwrap();
        link.on_reply(Ok(LinkReply::Opened));
        link.on_reply(Ok(LinkReply::Mtu(247)));

        let partial: Vec<_> = all_characteristics()
            .into_iter()
            .filter(|c| c.uuid != STATUS_NOTIFY_UUID)
            .collect();
        assert_eq!(
            link.on_reply(Ok(LinkReply::Discovered(partial))),
            LinkProgress::Failed(LinkError::ChannelMissing(Channel::StatusNotify))
        );
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.registry().is_empty());
    }

    #[test]
    fn test_timeout_reports_step() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        link.begin_connect("AR_GLASS").unwrap();
        link.on_reply(Ok(LinkReply::Opened));
        link.on_reply(Ok(LinkReply::Mtu(512)));
        link.on_reply(Ok(LinkReply::Discovered(all_characteristics())));

        assert_eq!(
            link.on_reply(Err(OpFailure::Timeout)),
            LinkProgress::Failed(LinkError::AcknowledgmentTimeout(
                LinkStep::EnableImageNotifications
            ))
        );
    }

    #[test]
    fn test_reset_is_idempotent() {
        let mut link = LinkManager::new(ConnectionConfig::default());
        assert!(!link.reset());

        connect_to_ready(&mut link, Ok(LinkReply::Mtu(512)));
        assert!(link.reset());
        assert_eq!(link.state(), LinkState::Disconnected);
        assert!(link.registry().is_empty());
        assert!(!link.reset());
        assert_eq!(link.state(), LinkState::Disconnected);
    }
}
