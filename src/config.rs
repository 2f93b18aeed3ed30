//! Configuration loading and types for pcmcast
//!
//! Configuration is loaded in layers:
//! 1. Built-in defaults
//! 2. Config file (~/.config/pcmcast/config.toml)
//! 3. Environment variables (PCMCAST_*)
//! 4. CLI arguments (highest priority)

use crate::error::PcmcastError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file content
pub const DEFAULT_CONFIG: &str = r#"# pcmcast Configuration
#
# Location: ~/.config/pcmcast/config.toml
# All settings can be overridden via CLI flags

[server]
# Address and port of the control surface (WebSocket at /ws)
host = "0.0.0.0"
port = 3000

[devices]
# Periodically re-read the ALSA PCM list to pick up hot-plugged devices.
# Disabling this only saves work, nothing else changes.
local_scan = true

# Seconds between local rescans
scan_interval_secs = 10

# Where the kernel lists PCM devices
# pcm_list = "/proc/asound/pcm"

[capture]
# Program that reads from an input device and writes raw PCM to stdout.
# It is always invoked with: -D <device> -c 2 -f S16_LE -r 44100 -t raw
program = "arecord"
# extra_args = ["--buffer-time=100000"]

[playback]
# Program that reads raw PCM from stdin and plays it on a local device.
# It is always invoked with: -D <device> -c 2 -f S16_LE -r 44100 -t raw
program = "aplay"
# extra_args = []

[streaming]
# Program started once per network receiver. PCM is written to its stdin.
# Placeholders: {host}, {port}, {volume} (0-100), {stereo} (true/false)
command = ["raop_play", "-p", "{port}", "-v", "{volume}", "{host}", "-"]

# Optional command used to change the volume of a running receiver.
# Without it, volume is only applied when a receiver is started.
# volume_command = ["raop_volume", "{host}", "{port}", "{volume}"]

# Receivers announced at startup. Receivers sharing a group are driven
# together as one stereo output.
# [[streaming.receivers]]
# name = "Kitchen left"
# host = "192.168.1.20"
# port = 7000
# group = "Kitchen"

[bluetooth]
# Offer connected Bluetooth devices (via bluealsa) as inputs
enabled = false
poll_interval_secs = 15

[session]
# What happens when a second browser connects while one is in control:
# - last_connected: the newest connection takes over (default)
# - first_keeps: control stays until the owner disconnects or someone takes over
takeover = "last_connected"

# Initial volume for network receivers (0-100)
default_volume = 50
"#;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub devices: DevicesConfig,

    #[serde(default = "default_capture")]
    pub capture: ProgramConfig,

    #[serde(default = "default_playback")]
    pub playback: ProgramConfig,

    #[serde(default)]
    pub streaming: StreamingConfig,

    #[serde(default)]
    pub bluetooth: BluetoothConfig,

    #[serde(default)]
    pub session: SessionConfig,
}

/// Control surface listener
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Local device discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevicesConfig {
    /// Re-read the PCM list periodically
    #[serde(default = "default_true")]
    pub local_scan: bool,

    #[serde(default = "default_scan_interval")]
    pub scan_interval_secs: u64,

    /// Kernel PCM listing
    #[serde(default = "default_pcm_list")]
    pub pcm_list: PathBuf,
}

/// An external PCM program (capture or playback)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProgramConfig {
    pub program: String,

    #[serde(default)]
    pub extra_args: Vec<String>,
}

/// Network receivers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StreamingConfig {
    /// Command template started per receiver
    #[serde(default = "default_streaming_command")]
    pub command: Vec<String>,

    /// Optional command template to change volume of a running receiver
    #[serde(default)]
    pub volume_command: Vec<String>,

    /// Statically declared receivers
    #[serde(default)]
    pub receivers: Vec<ReceiverConfig>,
}

/// A statically declared network receiver
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ReceiverConfig {
    pub name: String,
    pub host: String,
    pub port: u16,

    /// Stereo group name, shared by the left and right speaker
    #[serde(default)]
    pub group: Option<String>,
}

/// Bluetooth input discovery
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BluetoothConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_bluetooth_interval")]
    pub poll_interval_secs: u64,
}

/// Control ownership and shared session values
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub takeover: TakeoverPolicy,

    #[serde(default = "default_volume")]
    pub default_volume: u8,
}

/// What a new connection does to an existing owner
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TakeoverPolicy {
    /// The newest connection becomes owner (default)
    #[default]
    LastConnected,
    /// The owner keeps control until it disconnects or someone takes over
    FirstKeeps,
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_scan_interval() -> u64 {
    10
}

fn default_pcm_list() -> PathBuf {
    PathBuf::from("/proc/asound/pcm")
}

fn default_capture() -> ProgramConfig {
    ProgramConfig {
        program: "arecord".to_string(),
        extra_args: vec![],
    }
}

fn default_playback() -> ProgramConfig {
    ProgramConfig {
        program: "aplay".to_string(),
        extra_args: vec![],
    }
}

fn default_streaming_command() -> Vec<String> {
    ["raop_play", "-p", "{port}", "-v", "{volume}", "{host}", "-"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_bluetooth_interval() -> u64 {
    15
}

fn default_volume() -> u8 {
    50
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            local_scan: true,
            scan_interval_secs: default_scan_interval(),
            pcm_list: default_pcm_list(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            devices: DevicesConfig::default(),
            capture: default_capture(),
            playback: default_playback(),
            streaming: StreamingConfig::default(),
            bluetooth: BluetoothConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            command: default_streaming_command(),
            volume_command: vec![],
            receivers: vec![],
        }
    }
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            poll_interval_secs: default_bluetooth_interval(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            takeover: TakeoverPolicy::default(),
            default_volume: default_volume(),
        }
    }
}

impl Config {
    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "pcmcast")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Directory for runtime files such as the instance lock
    pub fn runtime_dir() -> PathBuf {
        std::env::var("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
            .join("pcmcast")
    }

    /// Address the control server binds to
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Load configuration from file, with defaults for missing values
pub fn load_config(path: Option<&Path>) -> Result<Config, PcmcastError> {
    let mut config = Config::default();

    let config_path = path.map(PathBuf::from).or_else(Config::default_path);

    if let Some(ref path) = config_path {
        if path.exists() {
            tracing::debug!("Loading config from {:?}", path);
            let contents = std::fs::read_to_string(path)
                .map_err(|e| PcmcastError::Config(format!("Failed to read config: {}", e)))?;

            config = toml::from_str(&contents)
                .map_err(|e| PcmcastError::Config(format!("Invalid config: {}", e)))?;
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
        }
    }

    apply_env(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

/// Override values from PCMCAST_* environment variables
fn apply_env(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), PcmcastError> {
    if let Some(value) = var("PCMCAST_NO_LOCAL_SCAN") {
        if is_truthy(&value) {
            config.devices.local_scan = false;
        }
    }
    if let Some(port) = var("PCMCAST_PORT") {
        config.server.port = port
            .trim()
            .parse()
            .map_err(|_| PcmcastError::Config(format!("PCMCAST_PORT is not a port: {:?}", port)))?;
    }
    if let Some(host) = var("PCMCAST_HOST") {
        config.server.host = host;
    }
    Ok(())
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
