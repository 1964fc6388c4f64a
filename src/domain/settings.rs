use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_true")]
    pub file_logging_enabled: bool,
    #[serde(default = "default_true")]
    pub console_logging_enabled: bool,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_prefix")]
    pub file_name_prefix: String,
    #[serde(default = "default_false")]
    pub show_file_line: bool,
    #[serde(default = "default_false")]
    pub show_thread_ids: bool,
    #[serde(default = "default_true")]
    pub show_target: bool,
    #[serde(default = "default_true")]
    pub ansi_colors: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String, // "daily", "hourly", "minutely", "never"
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_level(),
            file_logging_enabled: default_true(),
            console_logging_enabled: default_true(),
            log_dir: default_log_dir(),
            file_name_prefix: default_prefix(),
            show_file_line: default_false(),
            show_thread_ids: default_false(),
            show_target: default_true(),
            ansi_colors: default_true(),
            rotation: default_rotation(),
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_true() -> bool {
    true
}
fn default_false() -> bool {
    false
}
fn default_log_dir() -> String {
    "logs".to_string()
}
fn default_prefix() -> String {
    "ar_glass".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}

/// GATT layout and link timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BleSettings {
    /// Advertised name used when no explicit device is given
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_scan_timeout_ms")]
    pub scan_timeout_ms: u64,
    #[serde(default = "default_requested_mtu")]
    pub requested_mtu: u16,
    /// MTU reported when the platform stack negotiates on its own
    #[serde(default = "default_assumed_mtu")]
    pub assumed_mtu: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_false")]
    pub debug_show_all_devices: bool,

    #[serde(default = "default_file_data_uuid")]
    pub file_data_uuid: String,
    #[serde(default = "default_file_control_uuid")]
    pub file_control_uuid: String,
    #[serde(default = "default_file_name_uuid")]
    pub file_name_uuid: String,
    #[serde(default = "default_image_length_uuid")]
    pub image_length_uuid: String,
    #[serde(default = "default_image_command_uuid")]
    pub image_command_uuid: String,
    #[serde(default = "default_image_data_uuid")]
    pub image_data_uuid: String,
    #[serde(default = "default_battery_uuid")]
    pub battery_uuid: String,
    #[serde(default = "default_command_in_uuid")]
    pub command_in_uuid: String,
    #[serde(default = "default_status_notify_uuid")]
    pub status_notify_uuid: String,
}

impl Default for BleSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            scan_timeout_ms: default_scan_timeout_ms(),
            requested_mtu: default_requested_mtu(),
            assumed_mtu: default_assumed_mtu(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ack_timeout_ms: default_ack_timeout_ms(),
            debug_show_all_devices: false,
            file_data_uuid: default_file_data_uuid(),
            file_control_uuid: default_file_control_uuid(),
            file_name_uuid: default_file_name_uuid(),
            image_length_uuid: default_image_length_uuid(),
            image_command_uuid: default_image_command_uuid(),
            image_data_uuid: default_image_data_uuid(),
            battery_uuid: default_battery_uuid(),
            command_in_uuid: default_command_in_uuid(),
            status_notify_uuid: default_status_notify_uuid(),
        }
    }
}

fn default_device_name() -> String {
    "AR_GLASS".to_string()
}
fn default_scan_timeout_ms() -> u64 {
    5000
}
fn default_requested_mtu() -> u16 {
    512
}
fn default_assumed_mtu() -> u16 {
    512
}
fn default_connect_timeout_ms() -> u64 {
    15000
}
fn default_ack_timeout_ms() -> u64 {
    3000
}
fn default_file_data_uuid() -> String {
    "aabb0101-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_file_control_uuid() -> String {
    "aabb0102-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_file_name_uuid() -> String {
    "aabb0103-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_image_length_uuid() -> String {
    "aabb0201-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_image_command_uuid() -> String {
    "aabb0202-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_image_data_uuid() -> String {
    "aabb0203-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_battery_uuid() -> String {
    "aabb0301-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_command_in_uuid() -> String {
    "aabb0302-0000-1000-8000-00805f9b34fb".to_string()
}
fn default_status_notify_uuid() -> String {
    "aabb0303-0000-1000-8000-00805f9b34fb".to_string()
}

/// Chunking limits for both transfer directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub default_chunk_size: usize,
    /// Largest image length the glasses may declare
    #[serde(default = "default_max_image_size")]
    pub max_image_size: usize,
    #[serde(default = "default_write_retry_attempts")]
    pub write_retry_attempts: u32,
    #[serde(default = "default_write_retry_backoff_ms")]
    pub write_retry_backoff_ms: u64,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            default_chunk_size: default_chunk_size(),
            max_image_size: default_max_image_size(),
            write_retry_attempts: default_write_retry_attempts(),
            write_retry_backoff_ms: default_write_retry_backoff_ms(),
        }
    }
}

fn default_chunk_size() -> usize {
    400
}
fn default_max_image_size() -> usize {
    2 * 1024 * 1024
}
fn default_write_retry_attempts() -> u32 {
    3
}
fn default_write_retry_backoff_ms() -> u64 {
    50
}

/// Background behavior of the headless companion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompanionSettings {
    #[serde(default = "default_true")]
    pub idle_poll_enabled: bool,
    #[serde(default = "default_idle_poll_interval_ms")]
    pub idle_poll_interval_ms: u64,
    /// Oldest idle-poll frames are dropped beyond this many
    #[serde(default = "default_max_buffered_frames")]
    pub max_buffered_frames: usize,
    #[serde(default = "default_command_poll_interval_ms")]
    pub command_poll_interval_ms: u64,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Subject used when the glasses trigger a job on their own
    #[serde(default = "default_subject")]
    pub default_subject: String,
    #[serde(default)]
    pub prompts_file: Option<String>,
}

impl Default for CompanionSettings {
    fn default() -> Self {
        Self {
            idle_poll_enabled: default_true(),
            idle_poll_interval_ms: default_idle_poll_interval_ms(),
            max_buffered_frames: default_max_buffered_frames(),
            command_poll_interval_ms: default_command_poll_interval_ms(),
            client_id: default_client_id(),
            default_subject: default_subject(),
            prompts_file: None,
        }
    }
}

fn default_idle_poll_interval_ms() -> u64 {
    2000
}
fn default_max_buffered_frames() -> usize {
    8
}
fn default_command_poll_interval_ms() -> u64 {
    2000
}
fn default_client_id() -> String {
    "AR_glass_client".to_string()
}
fn default_subject() -> String {
    "physics".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub log_settings: LogSettings,
    #[serde(default)]
    pub ble: BleSettings,
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub companion: CompanionSettings,
    #[serde(default)]
    pub last_connected_device: Option<String>,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::load_or_default(settings_path))
    }

    /// Open settings stored at an explicit path (falls back to defaults when unreadable).
    pub fn load_or_default(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                if settings_path.exists() {
                    tracing::warn!(
                        "Could not read settings from {}: {}. Using defaults.",
                        settings_path.display(),
                        e
                    );
                }
                Settings::default()
            }
        };

        Self {
            settings,
            settings_path,
        }
    }

    fn get_settings_path() -> anyhow::Result<PathBuf> {
        let mut path = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        path.push("ArGlassCompanion");
        fs::create_dir_all(&path)?;
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(&self.settings)?;
        fs::write(&self.settings_path, json)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.settings_path
    }

    pub fn get(&self) -> &Settings {
        &self.settings
    }

    pub fn get_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn remember_device(&mut self, device_id: &str) -> anyhow::Result<()> {
        if self.settings.last_connected_device.as_deref() != Some(device_id) {
            self.settings.last_connected_device = Some(device_id.to_string());
            self.save()?;
        }
        Ok(())
    }
}
