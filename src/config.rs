//! Agent configuration (ambient concern; spec.md §1 scopes config loading out
//! of the CORE but a runnable binary still needs somewhere to load reader
//! preferences and retry tuning from). TOML via `serde`, following
//! `sholiday-musicbox`'s `config.rs` shape: a `from_reader` constructor over
//! a raw `Deserialize` struct, all tuning fields optional and defaulting to
//! the canonical constants of spec.md §6.

use std::io::Read;
use std::net::IpAddr;
use std::time::Duration;

use serde::Deserialize;

use crate::lifecycle;
use crate::reader_loop::Mode;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    ParseToml(#[from] toml::de::Error),
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
enum RawMode {
    #[default]
    ReadWrite,
    ReadOnly,
    WriteOnly,
}

impl From<RawMode> for Mode {
    fn from(raw: RawMode) -> Mode {
        match raw {
            RawMode::ReadWrite => Mode::ReadWrite,
            RawMode::ReadOnly => Mode::ReadOnly,
            RawMode::WriteOnly => Mode::WriteOnly,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RawConfig {
    #[serde(default)]
    reader: Option<String>,
    #[serde(default)]
    mode: RawMode,
    #[serde(default)]
    max_retries: Option<u32>,
    #[serde(default)]
    base_delay_ms: Option<u64>,
    #[serde(default)]
    max_reconnect_tries: Option<u32>,
    #[serde(default)]
    reconnect_delay_ms: Option<u64>,
    #[serde(default)]
    device_check_interval_ms: Option<u64>,
    #[serde(default)]
    device_enum_retries: Option<u32>,
    #[serde(default)]
    device_error_cooldown_secs: Option<u64>,
    #[serde(default)]
    max_retries_cooldown_secs: Option<u64>,
    #[serde(default)]
    ws_bind_addr: Option<IpAddr>,
    #[serde(default)]
    ws_port: Option<u16>,
}

const DEFAULT_WS_BIND_ADDR: IpAddr = IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1));
const DEFAULT_WS_PORT: u16 = 3500;

/// Tuning knobs for the Lifecycle Manager. Missing fields default to the
/// canonical constants spec.md §6 names.
#[derive(Debug, Clone, Copy)]
pub struct RetryTuning {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_reconnect_tries: u32,
    pub reconnect_delay: Duration,
    pub device_check_interval: Duration,
    pub device_enum_retries: u32,
    pub device_error_cooldown: Duration,
    pub max_retries_cooldown: Duration,
}

impl Default for RetryTuning {
    fn default() -> Self {
        Self {
            max_retries: lifecycle::MAX_RETRIES,
            base_delay: lifecycle::BASE_DELAY,
            max_reconnect_tries: lifecycle::MAX_RECONNECT_TRIES,
            reconnect_delay: lifecycle::RECONNECT_DELAY,
            device_check_interval: lifecycle::DEVICE_CHECK_INTERVAL,
            device_enum_retries: lifecycle::DEVICE_ENUM_RETRIES,
            device_error_cooldown: lifecycle::DEVICE_ERROR_COOLDOWN_PERIOD,
            max_retries_cooldown: lifecycle::MAX_RETRIES_COOLDOWN_PERIOD,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Empty means autoselect the first filtered reader (spec.md §4.B).
    pub reader: String,
    pub mode: Mode,
    pub tuning: RetryTuning,
    pub ws_bind_addr: IpAddr,
    pub ws_port: u16,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            reader: String::new(),
            mode: Mode::ReadWrite,
            tuning: RetryTuning::default(),
            ws_bind_addr: DEFAULT_WS_BIND_ADDR,
            ws_port: DEFAULT_WS_PORT,
        }
    }
}

impl AgentConfig {
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buffer = String::new();
        reader.read_to_string(&mut buffer)?;
        let raw: RawConfig = toml::from_str(&buffer)?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawConfig) -> Self {
        let defaults = RetryTuning::default();
        Self {
            reader: raw.reader.unwrap_or_default(),
            mode: raw.mode.into(),
            tuning: RetryTuning {
                max_retries: raw.max_retries.unwrap_or(defaults.max_retries),
                base_delay: raw.base_delay_ms.map(Duration::from_millis).unwrap_or(defaults.base_delay),
                max_reconnect_tries: raw.max_reconnect_tries.unwrap_or(defaults.max_reconnect_tries),
                reconnect_delay: raw
                    .reconnect_delay_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.reconnect_delay),
                device_check_interval: raw
                    .device_check_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.device_check_interval),
                device_enum_retries: raw.device_enum_retries.unwrap_or(defaults.device_enum_retries),
                device_error_cooldown: raw
                    .device_error_cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.device_error_cooldown),
                max_retries_cooldown: raw
                    .max_retries_cooldown_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.max_retries_cooldown),
            },
            ws_bind_addr: raw.ws_bind_addr.unwrap_or(DEFAULT_WS_BIND_ADDR),
            ws_port: raw.ws_port.unwrap_or(DEFAULT_WS_PORT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_canonical_defaults() {
        let config = AgentConfig::from_reader("".as_bytes()).unwrap();
        assert_eq!(config.reader, "");
        assert_eq!(config.mode, Mode::ReadWrite);
        assert_eq!(config.tuning.max_retries, lifecycle::MAX_RETRIES);
        assert_eq!(config.ws_port, DEFAULT_WS_PORT);
    }

    #[test]
    fn overrides_are_applied() {
        let toml = r#"
            reader = "ACS ACR122U"
            mode = "read_only"
            max_retries = 3
            base_delay_ms = 250
            ws_port = 9000
        "#;
        let config = AgentConfig::from_reader(toml.as_bytes()).unwrap();
        assert_eq!(config.reader, "ACS ACR122U");
        assert_eq!(config.mode, Mode::ReadOnly);
        assert_eq!(config.tuning.max_retries, 3);
        assert_eq!(config.tuning.base_delay, Duration::from_millis(250));
        assert_eq!(config.ws_port, 9000);
    }

    #[test]
    fn malformed_toml_is_rejected() {
        assert!(AgentConfig::from_reader("not = [valid".as_bytes()).is_err());
    }
}
