use serde::{Deserialize, Serialize};

/// Events published by the link actor and the orchestrator.
#[derive(Debug, Clone)]
pub enum AppEvent {
    DeviceFound(ScannedDevice),
    ConnectionStatus(ConnectionStatus),
    LogMessage(StatusMessage),
    UploadProgress(UploadProgress),
    ImageReceived(ImageSummary),
    /// Status text pushed by the glasses on the status channel
    DeviceStatus(DeviceStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Ready,
    Error,
}

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub message: String,
    pub severity: MessageSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSeverity {
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedDevice {
    pub name: String,
    /// Platform peripheral id (MAC on Linux/Windows, UUID on macOS)
    pub address: String,
    pub signal_strength: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadProgress {
    pub destination: String,
    pub sent: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSummary {
    pub size: usize,
    pub jpeg_valid: bool,
}

/// Status strings the glasses push on the status-notify channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceStatus {
    ImageReady,
    ImageEnd,
    ImageEmpty,
    ImageError,
    /// The wearer asked for a capture-and-analyze job from the glasses
    AiWork,
    Other(String),
}

impl DeviceStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::ImageReady => "image_ready",
            Self::ImageEnd => "image_end",
            Self::ImageEmpty => "image_empty",
            Self::ImageError => "image_error",
            Self::AiWork => "ai_work",
            Self::Other(text) => text,
        }
    }
}

/// Image pulled from the glasses camera.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedImage {
    pub data: Vec<u8>,
    pub declared_size: usize,
    /// Starts with FF D8 and ends with FF D9; advisory only
    pub jpeg_valid: bool,
    /// The device ended the stream before the declared size was reached
    pub short_circuited: bool,
}

impl CapturedImage {
    pub fn summary(&self) -> ImageSummary {
        ImageSummary {
            size: self.data.len(),
            jpeg_valid: self.jpeg_valid,
        }
    }
}

/// Where an uploaded file lands on the glasses' storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Music,
    Novel,
}

impl FileKind {
    pub fn directory(&self) -> &'static str {
        match self {
            Self::Music => "/sdcard/music",
            Self::Novel => "/sdcard/novel",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Music => "mp3",
            Self::Novel => "txt",
        }
    }

    /// Guess the kind from a file extension (case-insensitive).
    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "mp3" => Some(Self::Music),
            "txt" => Some(Self::Novel),
            _ => None,
        }
    }

    pub fn destination(&self, file_name: &str) -> String {
        format!("{}/{}", self.directory(), file_name)
    }
}

/// Destination of an analysis answer on the glasses.
pub fn answer_destination(answer_id: &str) -> String {
    format!("/sdcard/an/{}.json", answer_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_kind_destinations() {
        assert_eq!(
            FileKind::Music.destination("song.mp3"),
            "/sdcard/music/song.mp3"
        );
        assert_eq!(
            FileKind::Novel.destination("book.txt"),
            "/sdcard/novel/book.txt"
        );
        assert_eq!(FileKind::from_extension("MP3"), Some(FileKind::Music));
        assert_eq!(FileKind::from_extension("jpg"), None);
    }

    #[test]
    fn test_answer_destination() {
        assert_eq!(answer_destination("abc"), "/sdcard/an/abc.json");
    }
}
