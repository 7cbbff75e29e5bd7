//! Configuration management

use anyhow::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::devices::matrix::MatrixConfiguration;

#[derive(Debug, Deserialize)]
pub struct Config {
    /// The active matrix switcher (at most one system-wide)
    #[serde(default)]
    pub matrix: Option<MatrixConfiguration>,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub cec: CecConfig,

    #[serde(default)]
    pub ir: IrConfig,
}

/// Matrix client behaviour (timeouts and acknowledgement strictness)
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_tcp_timeout_ms")]
    pub tcp_timeout_ms: u64,
    #[serde(default = "default_udp_timeout_ms")]
    pub udp_timeout_ms: u64,
    /// When false, a non-empty reply without OK/ERR counts as success
    #[serde(default)]
    pub require_ok: bool,
}

fn default_tcp_timeout_ms() -> u64 {
    10_000
}

fn default_udp_timeout_ms() -> u64 {
    5_000
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            tcp_timeout_ms: default_tcp_timeout_ms(),
            udp_timeout_ms: default_udp_timeout_ms(),
            require_ok: false,
        }
    }
}

impl RoutingConfig {
    pub fn tcp_timeout(&self) -> Duration {
        Duration::from_millis(self.tcp_timeout_ms)
    }

    pub fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CecConfig {
    #[serde(default = "default_cec_binary")]
    pub binary: String,
    /// Adapter used when a target does not name one
    #[serde(default)]
    pub device_number: Option<u8>,
    #[serde(default = "default_cec_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_cec_status_timeout_ms")]
    pub status_timeout_ms: u64,
    #[serde(default = "default_digit_delay_ms")]
    pub digit_delay_ms: u64,
    #[serde(default = "default_enter_settle_ms")]
    pub enter_settle_ms: u64,
}

fn default_cec_binary() -> String {
    "cec-client".to_string()
}

fn default_cec_command_timeout_ms() -> u64 {
    15_000
}

fn default_cec_status_timeout_ms() -> u64 {
    5_000
}

fn default_digit_delay_ms() -> u64 {
    150
}

fn default_enter_settle_ms() -> u64 {
    500
}

impl Default for CecConfig {
    fn default() -> Self {
        Self {
            binary: default_cec_binary(),
            device_number: None,
            command_timeout_ms: default_cec_command_timeout_ms(),
            status_timeout_ms: default_cec_status_timeout_ms(),
            digit_delay_ms: default_digit_delay_ms(),
            enter_settle_ms: default_enter_settle_ms(),
        }
    }
}

impl CecConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn digit_delay(&self) -> Duration {
        Duration::from_millis(self.digit_delay_ms)
    }

    pub fn enter_settle(&self) -> Duration {
        Duration::from_millis(self.enter_settle_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IrConfig {
    /// TCP port used when a blaster address has no explicit port
    #[serde(default = "default_ir_port")]
    pub port: u16,
    #[serde(default = "default_ir_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Long on purpose: someone has to walk over and press the remote button
    #[serde(default = "default_ir_learn_timeout_ms")]
    pub learn_timeout_ms: u64,
    #[serde(default = "default_ir_send_timeout_ms")]
    pub send_timeout_ms: u64,
    /// Pause between codes of a multi-key IR sequence (channel digits)
    #[serde(default = "default_ir_key_delay_ms")]
    pub key_delay_ms: u64,
}

fn default_ir_port() -> u16 {
    4998
}

fn default_ir_connect_timeout_ms() -> u64 {
    5_000
}

fn default_ir_learn_timeout_ms() -> u64 {
    60_000
}

fn default_ir_send_timeout_ms() -> u64 {
    5_000
}

fn default_ir_key_delay_ms() -> u64 {
    300
}

impl Default for IrConfig {
    fn default() -> Self {
        Self {
            port: default_ir_port(),
            connect_timeout_ms: default_ir_connect_timeout_ms(),
            learn_timeout_ms: default_ir_learn_timeout_ms(),
            send_timeout_ms: default_ir_send_timeout_ms(),
            key_delay_ms: default_ir_key_delay_ms(),
        }
    }
}

impl IrConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn learn_timeout(&self) -> Duration {
        Duration::from_millis(self.learn_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn key_delay(&self) -> Duration {
        Duration::from_millis(self.key_delay_ms)
    }
}

/// Get config directory (AVC_CONFIG_DIR, XDG_CONFIG_HOME or platform default)
pub fn get_config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("AVC_CONFIG_DIR") {
        return PathBuf::from(dir);
    }

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join("Library/Application Support/venue-av-control");
        }
    }

    #[cfg(target_os = "linux")]
    {
        if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
            return PathBuf::from(xdg).join("venue-av-control");
        }
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(".config/venue-av-control");
        }
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("APPDATA") {
            return PathBuf::from(appdata).join("venue-av-control");
        }
    }

    // Fallback to current directory
    PathBuf::from(".")
}

pub fn load_config() -> Result<Config> {
    let config_dir = get_config_dir();

    let mut builder = ::config::Config::builder()
        // Load from config file if it exists
        .add_source(
            ::config::File::with_name(&config_dir.join("config").to_string_lossy()).required(false),
        )
        // Override with environment variables (AVC_CEC__BINARY, AVC_IR__PORT, etc.)
        .add_source(
            ::config::Environment::with_prefix("AVC")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    // Legacy MATRIX_HOST/MATRIX_PORT env vars (set by older installer scripts)
    if let Ok(host) = std::env::var("MATRIX_HOST") {
        builder = builder.set_override("matrix.address", host)?;
    }
    if let Ok(port) = std::env::var("MATRIX_PORT") {
        if let Ok(port_num) = port.parse::<u16>() {
            builder = builder.set_override("matrix.tcp_port", port_num as i64)?;
        }
    }

    let config = builder.build()?;

    Ok(config.try_deserialize()?)
}
