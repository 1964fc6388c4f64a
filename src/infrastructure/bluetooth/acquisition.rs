//! Image Acquisition Engine
//!
//! Sans-IO state machine pulling a captured frame from the glasses. The
//! length is only known after `image_ready`; the frame then arrives one
//! notification per `getimage`.
//!
//! Waits on the device are bounded by the link: when no `image_ready` shows
//! up in time the length is read anyway (firmware that rewinds silently on
//! `takeimage`), when a data notification is missing the transfer fails.
//!
//! ```text
//! Idle -> CommandSent -> AwaitingReady -> LengthRequested -> Receiving -> Complete
//!                                                 |              |
//!                                                 +-> Empty      +-> (image_end/empty/error)
//! ```

use crate::domain::models::{CapturedImage, DeviceStatus};
use crate::infrastructure::bluetooth::error::{AcquisitionError, TransferError, TransferStep};
use crate::infrastructure::bluetooth::protocol::{self, ImageCommand};
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionPhase {
    Idle,
    CommandSent,
    AwaitingReady,
    LengthRequested,
    Receiving,
    Complete,
    Empty,
    DeviceError,
}

/// Outcome of a successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquired {
    Image(CapturedImage),
    /// The device had no frame (declared length 0)
    Empty,
}

/// What the link must do next for the acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquisitionAction {
    Write(ImageCommand),
    ReadLength,
    Wait,
    Finish(Result<Acquired, AcquisitionError>),
}

#[derive(Debug)]
pub struct ImageTransfer {
    declared_size: usize,
    buffer: Vec<u8>,
    received: usize,
    max_size: usize,
    phase: AcquisitionPhase,
}

impl ImageTransfer {
    pub fn new(max_size: usize) -> Self {
        Self {
            declared_size: 0,
            buffer: Vec::new(),
            received: 0,
            max_size,
            phase: AcquisitionPhase::Idle,
        }
    }

    pub fn begin(&mut self) -> AcquisitionAction {
        if self.phase != AcquisitionPhase::Idle {
            return AcquisitionAction::Wait;
        }
        self.phase = AcquisitionPhase::CommandSent;
        AcquisitionAction::Write(ImageCommand::TakeImage)
    }

    /// A `takeimage`/`getimage` write was acknowledged.
    pub fn on_command_written(&mut self) -> AcquisitionAction {
        if self.phase == AcquisitionPhase::CommandSent {
            self.phase = AcquisitionPhase::AwaitingReady;
        }
        AcquisitionAction::Wait
    }

    pub fn on_status(&mut self, status: &DeviceStatus) -> AcquisitionAction {
        use AcquisitionPhase::*;

        match (self.phase, status) {
            (AwaitingReady, DeviceStatus::ImageReady) => {
                self.phase = LengthRequested;
                AcquisitionAction::ReadLength
            }
            (_, DeviceStatus::ImageReady) => {
                debug!("Ignoring image_ready in phase {:?}", self.phase);
                AcquisitionAction::Wait
            }
            (Receiving, DeviceStatus::ImageEnd) => {
                if self.received < self.declared_size {
                    warn!(
                        "Device ended the image at {} of {} bytes",
                        self.received, self.declared_size
                    );
                }
                self.complete(true)
            }
            (AwaitingReady | LengthRequested | Receiving, DeviceStatus::ImageEmpty) => {
                self.phase = Empty;
                AcquisitionAction::Finish(Err(AcquisitionError::DeviceReportedEmpty))
            }
            (AwaitingReady | LengthRequested | Receiving, DeviceStatus::ImageError) => {
                self.phase = DeviceError;
                AcquisitionAction::Finish(Err(AcquisitionError::DeviceReportedError))
            }
            _ => AcquisitionAction::Wait,
        }
    }

    /// The device did not answer the last command in time.
    pub fn on_deadline(&mut self) -> AcquisitionAction {
        match self.phase {
            AcquisitionPhase::AwaitingReady => {
                warn!("No image_ready from the glasses, reading the length anyway");
                self.phase = AcquisitionPhase::LengthRequested;
                AcquisitionAction::ReadLength
            }
            AcquisitionPhase::Receiving => {
                warn!(
                    "Image data stalled at {} of {} bytes",
                    self.received, self.declared_size
                );
                self.phase = AcquisitionPhase::DeviceError;
                AcquisitionAction::Finish(Err(AcquisitionError::DataTimeout {
                    received: self.received,
                    declared: self.declared_size,
                }))
            }
            _ => AcquisitionAction::Wait,
        }
    }

    /// Waiting on a notification rather than on a write or read.
    pub fn awaits_device(&self) -> bool {
        matches!(
            self.phase,
            AcquisitionPhase::AwaitingReady | AcquisitionPhase::Receiving
        )
    }

    /// Result of reading the image-length channel.
    pub fn on_length(&mut self, raw: &[u8]) -> AcquisitionAction {
        if self.phase != AcquisitionPhase::LengthRequested {
            debug!("Ignoring image length in phase {:?}", self.phase);
            return AcquisitionAction::Wait;
        }

        let declared = protocol::decode_image_length(raw) as usize;
        debug!("Device declared an image of {} bytes", declared);

        if declared == 0 {
            self.phase = AcquisitionPhase::Empty;
            return AcquisitionAction::Finish(Ok(Acquired::Empty));
        }
        if declared > self.max_size {
            self.phase = AcquisitionPhase::DeviceError;
            return AcquisitionAction::Finish(Err(AcquisitionError::DeclaredSizeInvalid {
                declared,
                limit: self.max_size,
            }));
        }

        self.declared_size = declared;
        self.buffer = vec![0; declared];
        self.received = 0;
        self.phase = AcquisitionPhase::Receiving;
        AcquisitionAction::Write(ImageCommand::GetImage)
    }

    /// One image-data notification.
    pub fn on_data(&mut self, chunk: &[u8]) -> AcquisitionAction {
        if self.phase != AcquisitionPhase::Receiving {
            trace!("Ignoring {} image bytes in phase {:?}", chunk.len(), self.phase);
            return AcquisitionAction::Wait;
        }

        let room = self.declared_size - self.received;
        let take = chunk.len().min(room);
        if take < chunk.len() {
            warn!(
                "Discarding {} image bytes beyond the declared size",
                chunk.len() - take
            );
        }
        self.buffer[self.received..self.received + take].copy_from_slice(&chunk[..take]);
        self.received += take;
        trace!("Image {}/{} bytes", self.received, self.declared_size);

        if self.received == self.declared_size {
            self.complete(false)
        } else {
            AcquisitionAction::Write(ImageCommand::GetImage)
        }
    }

    /// The current command or read could not be performed.
    pub fn fail(&mut self, reason: impl Into<String>) -> TransferError {
        let step = match self.phase {
            AcquisitionPhase::LengthRequested => TransferStep::ReadLength,
            AcquisitionPhase::Receiving => TransferStep::GetImage,
            _ => TransferStep::TakeImage,
        };
        self.phase = AcquisitionPhase::DeviceError;
        TransferError::WriteFailed {
            step,
            bytes_sent: self.received,
            reason: reason.into(),
        }
    }

    pub fn phase(&self) -> AcquisitionPhase {
        self.phase
    }

    pub fn received(&self) -> usize {
        self.received
    }

    pub fn declared_size(&self) -> usize {
        self.declared_size
    }

    fn complete(&mut self, short_circuited: bool) -> AcquisitionAction {
        self.phase = AcquisitionPhase::Complete;
        let mut data = std::mem::take(&mut self.buffer);
        data.truncate(self.received);

        let jpeg_valid = protocol::is_well_formed_jpeg(&data);
        if !jpeg_valid {
            warn!("Received image is not a well-formed JPEG ({} bytes)", data.len());
        }

        AcquisitionAction::Finish(Ok(Acquired::Image(CapturedImage {
            data,
            declared_size: self.declared_size,
            jpeg_valid,
            short_circuited,
        })))
    }
}
