//! Error types of the link engine.

use crate::infrastructure::bluetooth::protocol::Channel;
use crate::infrastructure::bluetooth::transport::TransportError;
use std::fmt;
use thiserror::Error;

/// Steps of the connect sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkStep {
    Open,
    NegotiateCapacity,
    DiscoverChannels,
    EnableImageNotifications,
    EnableStatusNotifications,
    Listen,
}

impl fmt::Display for LinkStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open connection",
            Self::NegotiateCapacity => "capacity negotiation",
            Self::DiscoverChannels => "channel discovery",
            Self::EnableImageNotifications => "image-data notification",
            Self::EnableStatusNotifications => "status notification",
            Self::Listen => "notification stream",
        };
        f.write_str(name)
    }
}

/// Link operations performed on behalf of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStep {
    Name,
    FirstChunk,
    Start,
    Chunk,
    Update,
    End,
    TakeImage,
    ReadLength,
    GetImage,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Name => "name",
            Self::FirstChunk => "first chunk",
            Self::Start => "start",
            Self::Chunk => "chunk",
            Self::Update => "update",
            Self::End => "end",
            Self::TakeImage => "takeimage",
            Self::ReadLength => "length read",
            Self::GetImage => "getimage",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link is not connected")]
    NotConnected,
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
    #[error("link is already ready")]
    AlreadyReady,
    #[error("capacity negotiation failed: {0}")]
    NegotiationFailed(String),
    #[error("device does not expose the {0} channel")]
    ChannelMissing(Channel),
    #[error("no acknowledgment during {0}")]
    AcknowledgmentTimeout(LinkStep),
    #[error("{step} failed: {message}")]
    Transport { step: LinkStep, message: String },
}

impl LinkError {
    /// Connect step this error was raised in, if any
    pub fn step(&self) -> Option<LinkStep> {
        match self {
            Self::NegotiationFailed(_) => Some(LinkStep::NegotiateCapacity),
            Self::ChannelMissing(_) => Some(LinkStep::DiscoverChannels),
            Self::AcknowledgmentTimeout(step) => Some(*step),
            Self::Transport { step, .. } => Some(*step),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("device declared an image of {declared} bytes (limit {limit})")]
    DeclaredSizeInvalid { declared: usize, limit: usize },
    #[error("device reported no image")]
    DeviceReportedEmpty,
    #[error("device reported a camera error")]
    DeviceReportedError,
    #[error("device stopped sending image data at {received} of {declared} bytes")]
    DataTimeout { received: usize, declared: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("another transfer is in progress")]
    Busy,
    #[error("link is not ready")]
    NotReady,
    #[error("{step} failed after {bytes_sent} bytes: {reason}")]
    WriteFailed {
        step: TransferStep,
        bytes_sent: usize,
        reason: String,
    },
    #[error("transfer aborted")]
    Aborted,
    #[error("payload is empty")]
    EmptyPayload,
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("link is not ready")]
    NotReady,
    #[error("device does not expose the {0} channel")]
    ChannelUnavailable(Channel),
    #[error("command write failed: {0}")]
    WriteFailed(String),
    #[error("read failed: {0}")]
    ReadFailed(String),
}

/// Why a single link operation did not complete
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OpFailure {
    #[error("no acknowledgment before the deadline")]
    Timeout,
    #[error(transparent)]
    Transport(#[from] TransportError),
}
