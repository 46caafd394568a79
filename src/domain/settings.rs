use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSettings {
    #[serde(default = "default_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_false")]
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
            file_logging_enabled: default_false(),
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

/// Settings for discovering and talking to the LED controller board
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkSettings {
    /// Name of the already-paired device to connect to (exact match)
    #[serde(default = "default_device_name")]
    pub device_name: String,
    /// Delay before retrying a failed connection attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Settling time the board needs between commands
    #[serde(default = "default_command_pacing_ms")]
    pub command_pacing_ms: u64,
    /// How long the writer waits for work per loop iteration
    #[serde(default = "default_writer_poll_ms")]
    pub writer_poll_ms: u64,
    /// RFCOMM TTY bound to the serial port service (Linux)
    #[serde(default = "default_rfcomm_device")]
    pub rfcomm_device: String,
    /// Line speed set on the RFCOMM TTY (Linux)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// BlueZ paired device store (Linux)
    #[serde(default = "default_bluez_storage_dir")]
    pub bluez_storage_dir: String,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            retry_delay_ms: default_retry_delay_ms(),
            command_pacing_ms: default_command_pacing_ms(),
            writer_poll_ms: default_writer_poll_ms(),
            rfcomm_device: default_rfcomm_device(),
            baud_rate: default_baud_rate(),
            bluez_storage_dir: default_bluez_storage_dir(),
        }
    }
}

impl LinkSettings {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn command_pacing(&self) -> Duration {
        Duration::from_millis(self.command_pacing_ms)
    }

    pub fn writer_poll(&self) -> Duration {
        Duration::from_millis(self.writer_poll_ms)
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
    "led_link".to_string()
}
fn default_rotation() -> String {
    "daily".to_string()
}
fn default_device_name() -> String {
    "HC-06".to_string()
}
fn default_retry_delay_ms() -> u64 {
    3000
}
fn default_command_pacing_ms() -> u64 {
    100
}
fn default_writer_poll_ms() -> u64 {
    1000
}
fn default_rfcomm_device() -> String {
    "/dev/rfcomm0".to_string()
}
fn default_baud_rate() -> u32 {
    9600
}
fn default_bluez_storage_dir() -> String {
    "/var/lib/bluetooth".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub link: LinkSettings,

    // Logging Settings
    #[serde(default)]
    pub log_settings: LogSettings,
}

pub struct SettingsService {
    settings: Settings,
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new() -> anyhow::Result<Self> {
        let settings_path = Self::get_settings_path()?;
        Ok(Self::from_path(settings_path))
    }

    /// Load settings from an explicit file, falling back to defaults if it
    /// is missing or unreadable
    pub fn from_path(settings_path: PathBuf) -> Self {
        let settings = match Self::load_from_file(&settings_path) {
            Ok(settings) => settings,
            Err(e) => {
                tracing::debug!(
                    "Using default settings ({}): {}",
                    settings_path.display(),
                    e
                );
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
        path.push("LedController");
        path.push("settings.json");
        Ok(path)
    }

    fn load_from_file(path: &Path) -> anyhow::Result<Settings> {
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        Ok(settings)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        if let Some(dir) = self.settings_path.parent() {
            fs::create_dir_all(dir)?;
        }
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

    /// Write the current settings out if no settings file exists yet, so
    /// there is a file to edit. Returns whether a file was written.
    pub fn save_if_missing(&self) -> anyhow::Result<bool> {
        if self.settings_path.exists() {
            return Ok(false);
        }
        self.save()?;
        Ok(true)
    }

    /// Remember a different board name; the service picks it up on its
    /// next start
    pub fn set_device_name(&mut self, name: &str) -> anyhow::Result<()> {
        if self.settings.link.device_name != name {
            self.settings.link.device_name = name.to_string();
            self.save()?;
        }
        Ok(())
    }
}
