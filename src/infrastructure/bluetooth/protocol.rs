//! AR Glass GATT Protocol
//!
//! Channel UUIDs, control markers, status strings and the command vocabulary
//! understood by the glasses firmware.

use crate::domain::models::DeviceStatus;
use std::fmt;
use uuid::Uuid;

/// Advertised name of the glasses
pub const DEVICE_NAME: &str = "AR_GLASS";

/// File transfer service (name, data, control)
pub const FILE_SERVICE_UUID: Uuid = Uuid::from_u128(0xaabb0100_0000_1000_8000_00805f9b34fb);
pub const FILE_DATA_UUID: Uuid = Uuid::from_u128(0xaabb0101_0000_1000_8000_00805f9b34fb);
pub const FILE_CONTROL_UUID: Uuid = Uuid::from_u128(0xaabb0102_0000_1000_8000_00805f9b34fb);
pub const FILE_NAME_UUID: Uuid = Uuid::from_u128(0xaabb0103_0000_1000_8000_00805f9b34fb);

/// Camera service (length, command, data)
pub const IMAGE_SERVICE_UUID: Uuid = Uuid::from_u128(0xaabb0200_0000_1000_8000_00805f9b34fb);
pub const IMAGE_LENGTH_UUID: Uuid = Uuid::from_u128(0xaabb0201_0000_1000_8000_00805f9b34fb);
pub const IMAGE_COMMAND_UUID: Uuid = Uuid::from_u128(0xaabb0202_0000_1000_8000_00805f9b34fb);
pub const IMAGE_DATA_UUID: Uuid = Uuid::from_u128(0xaabb0203_0000_1000_8000_00805f9b34fb);

/// Misc data service (battery, command in, status notify)
pub const DATA_SERVICE_UUID: Uuid = Uuid::from_u128(0xaabb0300_0000_1000_8000_00805f9b34fb);
pub const BATTERY_UUID: Uuid = Uuid::from_u128(0xaabb0301_0000_1000_8000_00805f9b34fb);
pub const COMMAND_IN_UUID: Uuid = Uuid::from_u128(0xaabb0302_0000_1000_8000_00805f9b34fb);
pub const STATUS_NOTIFY_UUID: Uuid = Uuid::from_u128(0xaabb0303_0000_1000_8000_00805f9b34fb);

/// ATT MTU requested right after connecting
pub const REQUESTED_ATT_MTU: u16 = 512;
/// ATT MTU every peer supports
pub const DEFAULT_ATT_MTU: u16 = 23;
/// Opcode + handle bytes of an ATT write
pub const ATT_WRITE_OVERHEAD: usize = 3;
/// Upload chunk size the firmware is tuned for
pub const DEFAULT_CHUNK_SIZE: usize = 400;

/// Logical channels of the glasses' GATT table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    FileName,
    FileData,
    FileControl,
    ImageLength,
    ImageCommand,
    ImageData,
    CommandIn,
    StatusNotify,
    Battery,
}

impl Channel {
    /// Channels that must exist for the link to become ready
    pub const REQUIRED: [Channel; 8] = [
        Channel::FileName,
        Channel::FileData,
        Channel::FileControl,
        Channel::ImageLength,
        Channel::ImageCommand,
        Channel::ImageData,
        Channel::CommandIn,
        Channel::StatusNotify,
    ];

    pub const ALL: [Channel; 9] = [
        Channel::FileName,
        Channel::FileData,
        Channel::FileControl,
        Channel::ImageLength,
        Channel::ImageCommand,
        Channel::ImageData,
        Channel::CommandIn,
        Channel::StatusNotify,
        Channel::Battery,
    ];

    pub fn is_required(&self) -> bool {
        !matches!(self, Channel::Battery)
    }

    pub fn default_uuid(&self) -> Uuid {
        match self {
            Self::FileName => FILE_NAME_UUID,
            Self::FileData => FILE_DATA_UUID,
            Self::FileControl => FILE_CONTROL_UUID,
            Self::ImageLength => IMAGE_LENGTH_UUID,
            Self::ImageCommand => IMAGE_COMMAND_UUID,
            Self::ImageData => IMAGE_DATA_UUID,
            Self::CommandIn => COMMAND_IN_UUID,
            Self::StatusNotify => STATUS_NOTIFY_UUID,
            Self::Battery => BATTERY_UUID,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::FileName => "file-name",
            Self::FileData => "file-data",
            Self::FileControl => "file-control",
            Self::ImageLength => "image-length",
            Self::ImageCommand => "image-command",
            Self::ImageData => "image-data",
            Self::CommandIn => "command-in",
            Self::StatusNotify => "status-notify",
            Self::Battery => "battery",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Markers written to the file-control channel around upload data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileControl {
    /// Open the destination file; the first chunk is already in the data characteristic
    Start,
    /// Append the data characteristic's current value
    Update,
    /// Close the destination file
    End,
}

impl FileControl {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Update => "update",
            Self::End => "end",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

/// Camera commands written to the image-command channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCommand {
    /// Capture a new frame and rewind the read cursor
    TakeImage,
    /// Push the next image chunk as a notification
    GetImage,
}

impl ImageCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TakeImage => "takeimage",
            Self::GetImage => "getimage",
        }
    }

    pub fn as_bytes(&self) -> &'static [u8] {
        self.as_str().as_bytes()
    }
}

/// Commands understood on the command-in channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    DeleteFile,
    DeleteJson,
    PlayMp3,
    StopMp3,
    DisplayTxt,
    DisplayJson,
    NextPage,
    PrePage,
    VolUp,
    VolDown,
    SetPower,
}

impl DeviceCommand {
    pub const ALL: [DeviceCommand; 11] = [
        DeviceCommand::DeleteFile,
        DeviceCommand::DeleteJson,
        DeviceCommand::PlayMp3,
        DeviceCommand::StopMp3,
        DeviceCommand::DisplayTxt,
        DeviceCommand::DisplayJson,
        DeviceCommand::NextPage,
        DeviceCommand::PrePage,
        DeviceCommand::VolUp,
        DeviceCommand::VolDown,
        DeviceCommand::SetPower,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DeleteFile => "delete_file",
            Self::DeleteJson => "delete_json",
            Self::PlayMp3 => "play_mp3",
            Self::StopMp3 => "stop_mp3",
            Self::DisplayTxt => "display_txt",
            Self::DisplayJson => "display_json",
            Self::NextPage => "next_page",
            Self::PrePage => "pre_page",
            Self::VolUp => "vol_up",
            Self::VolDown => "vol_down",
            Self::SetPower => "set_power",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decode a status notification. Empty payloads carry no status.
pub fn parse_status(bytes: &[u8]) -> Option<DeviceStatus> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_matches(|c: char| c == '\0' || c.is_whitespace());
    if text.is_empty() {
        return None;
    }

    Some(match text {
        "image_ready" => DeviceStatus::ImageReady,
        "image_end" => DeviceStatus::ImageEnd,
        "image_empty" => DeviceStatus::ImageEmpty,
        "image_error" => DeviceStatus::ImageError,
        "ai_work" => DeviceStatus::AiWork,
        other => DeviceStatus::Other(other.to_string()),
    })
}

/// Decode the image-length characteristic.
///
/// The length is a u32 little-endian in the first four bytes; shorter reads
/// mean no image is available.
pub fn decode_image_length(bytes: &[u8]) -> u32 {
    match bytes.get(..4) {
        Some(&[b0, b1, b2, b3]) => u32::from_le_bytes([b0, b1, b2, b3]),
        _ => 0,
    }
}

/// Decode the battery characteristic (ASCII decimal percentage).
pub fn parse_battery(bytes: &[u8]) -> Option<u8> {
    let text = String::from_utf8_lossy(bytes);
    let level: u8 = text.trim_matches(|c: char| c == '\0' || c.is_whitespace()).parse().ok()?;
    (level <= 100).then_some(level)
}

/// Largest payload a single write may carry for the given ATT MTU.
pub fn write_capacity(att_mtu: u16) -> usize {
    (att_mtu as usize).saturating_sub(ATT_WRITE_OVERHEAD).max(1)
}

/// Upload chunk size: the configured size capped by what one write can carry.
pub fn chunk_size_for(att_mtu: u16, configured: usize) -> usize {
    configured.max(1).min(write_capacity(att_mtu))
}

/// JPEG framing check: SOI at the start and EOI at the end.
pub fn is_well_formed_jpeg(data: &[u8]) -> bool {
    data.len() >= 4 && data.starts_with(&[0xFF, 0xD8]) && data.ends_with(&[0xFF, 0xD9])
}
