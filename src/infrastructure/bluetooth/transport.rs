//! GATT transport seam.
//!
//! The link actor drives a [`GattTransport`]; the production implementation
//! sits on btleplug, tests use an in-memory fake of the glasses.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use uuid::Uuid;

/// A characteristic reported by service discovery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
}

/// A value pushed by the device on a subscribed characteristic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub uuid: Uuid,
    pub value: Vec<u8>,
}

/// All notifications of the connected peripheral. Ends when the link drops.
pub type NotificationStream = BoxStream<'static, Notification>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("device {0} not found")]
    DeviceNotFound(String),
    #[error("not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    UnknownCharacteristic(Uuid),
    #[error("peer rejected the MTU request")]
    MtuRejected,
    #[error("{0}")]
    Ble(String),
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::NotConnected => Self::NotConnected,
            btleplug::Error::DeviceNotFound => Self::DeviceNotFound("peripheral".to_string()),
            other => Self::Ble(other.to_string()),
        }
    }
}

#[async_trait]
pub trait GattTransport: Send {
    /// Find and connect to the device (id or advertised name).
    async fn connect(&mut self, device_id: &str) -> Result<(), TransportError>;

    /// Ask for a larger ATT MTU; returns the MTU in effect.
    async fn request_mtu(&mut self, mtu: u16) -> Result<u16, TransportError>;

    async fn discover(&mut self) -> Result<Vec<DiscoveredCharacteristic>, TransportError>;

    /// Enable notifications (writes the CCCD) and wait for the acknowledgment.
    async fn subscribe(&mut self, uuid: Uuid) -> Result<(), TransportError>;

    async fn notifications(&mut self) -> Result<NotificationStream, TransportError>;

    /// Write with response.
    async fn write(&mut self, uuid: Uuid, value: &[u8]) -> Result<(), TransportError>;

    async fn read(&mut self, uuid: Uuid) -> Result<Vec<u8>, TransportError>;

    async fn disconnect(&mut self) -> Result<(), TransportError>;
}
