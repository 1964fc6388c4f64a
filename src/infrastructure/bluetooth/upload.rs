//! Chunked Upload Engine
//!
//! Sans-IO state machine for pushing a file to the glasses:
//!
//! ```text
//! name -> chunk 1 -> start -> (chunk i -> update)* -> end
//! ```
//!
//! Every step is emitted only after the previous write was acknowledged.

use crate::infrastructure::bluetooth::error::{TransferError, TransferStep};
use crate::infrastructure::bluetooth::protocol::{Channel, FileControl};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Idle,
    SendingName,
    SendingFirstChunk,
    SendingStart,
    SendingChunk,
    SendingUpdate,
    SendingEnd,
    Done,
    Failed,
}

/// One write the link must perform next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadStep {
    Name(String),
    Data(Vec<u8>),
    Control(FileControl),
}

impl UploadStep {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Name(_) => Channel::FileName,
            Self::Data(_) => Channel::FileData,
            Self::Control(_) => Channel::FileControl,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Name(name) => name.into_bytes(),
            Self::Data(data) => data,
            Self::Control(marker) => marker.as_bytes().to_vec(),
        }
    }
}

/// Number of chunks a payload of `len` bytes is split into.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

#[derive(Debug)]
pub struct ChunkedTransfer {
    destination: String,
    payload: Vec<u8>,
    chunk_size: usize,
    cursor: usize,
    in_flight: usize,
    phase: UploadPhase,
}

impl ChunkedTransfer {
    pub fn new(
        destination: impl Into<String>,
        payload: Vec<u8>,
        chunk_size: usize,
    ) -> Result<Self, TransferError> {
        if payload.is_empty() {
            return Err(TransferError::EmptyPayload);
        }
        Ok(Self {
            destination: destination.into(),
            payload,
            chunk_size: chunk_size.max(1),
            cursor: 0,
            in_flight: 0,
            phase: UploadPhase::Idle,
        })
    }

    /// First step of the sequence: the destination name.
    pub fn begin(&mut self) -> Option<UploadStep> {
        if self.phase != UploadPhase::Idle {
            return None;
        }
        self.phase = UploadPhase::SendingName;
        Some(UploadStep::Name(self.destination.clone()))
    }

    /// The previous step was acknowledged; returns the next one, or `None`
    /// once `end` has been acknowledged.
    pub fn on_ack(&mut self) -> Option<UploadStep> {
        match self.phase {
            UploadPhase::SendingName => Some(self.next_chunk(UploadPhase::SendingFirstChunk)),
            UploadPhase::SendingFirstChunk => {
                self.commit_chunk();
                self.phase = UploadPhase::SendingStart;
                Some(UploadStep::Control(FileControl::Start))
            }
            UploadPhase::SendingChunk => {
                self.commit_chunk();
                self.phase = UploadPhase::SendingUpdate;
                Some(UploadStep::Control(FileControl::Update))
            }
            UploadPhase::SendingStart | UploadPhase::SendingUpdate => {
                if self.cursor < self.payload.len() {
                    Some(self.next_chunk(UploadPhase::SendingChunk))
                } else {
                    self.phase = UploadPhase::SendingEnd;
                    Some(UploadStep::Control(FileControl::End))
                }
            }
            UploadPhase::SendingEnd => {
                self.phase = UploadPhase::Done;
                None
            }
            UploadPhase::Idle | UploadPhase::Done | UploadPhase::Failed => None,
        }
    }

    /// The current step could not be written.
    pub fn fail(&mut self, reason: impl Into<String>) -> TransferError {
        let step = self.current_step().unwrap_or(TransferStep::Name);
        self.phase = UploadPhase::Failed;
        TransferError::WriteFailed {
            step,
            bytes_sent: self.cursor,
            reason: reason.into(),
        }
    }

    /// Step awaiting acknowledgment
    pub fn current_step(&self) -> Option<TransferStep> {
        match self.phase {
            UploadPhase::SendingName => Some(TransferStep::Name),
            UploadPhase::SendingFirstChunk => Some(TransferStep::FirstChunk),
            UploadPhase::SendingStart => Some(TransferStep::Start),
            UploadPhase::SendingChunk => Some(TransferStep::Chunk),
            UploadPhase::SendingUpdate => Some(TransferStep::Update),
            UploadPhase::SendingEnd => Some(TransferStep::End),
            _ => None,
        }
    }

    /// Whether the destination name is already on the device but `start`
    /// has not been acknowledged yet.
    pub fn in_preamble(&self) -> bool {
        matches!(
            self.phase,
            UploadPhase::SendingName | UploadPhase::SendingFirstChunk | UploadPhase::SendingStart
        )
    }

    pub fn phase(&self) -> UploadPhase {
        self.phase
    }

    /// Acknowledged payload bytes
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.payload.len()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn is_done(&self) -> bool {
        self.phase == UploadPhase::Done
    }

    fn next_chunk(&mut self, phase: UploadPhase) -> UploadStep {
        let end = (self.cursor + self.chunk_size).min(self.payload.len());
        self.in_flight = end - self.cursor;
        self.phase = phase;
        UploadStep::Data(self.payload[self.cursor..end].to_vec())
    }

    fn commit_chunk(&mut self) {
        self.cursor += self.in_flight;
        self.in_flight = 0;
    }
}
