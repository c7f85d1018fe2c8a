// SPDX-License-Identifier: GPL-3.0-only
//! Policy and timing configuration
//!
//! All constants of the reconciliation loop live in one [`Config`] value that
//! is built once at startup and handed to the service. An optional KDL file
//! can override any of them:
//!
//! ```kdl
//! cap-width 1920
//! cap-height 1080
//! cap-rate-hz 30.5
//! poll-interval-ms 5000
//! query-timeout-ms 5000
//! hotplug-settle-ms 1000
//! randr-command "xrandr --display :0"
//! hotplug #true
//! ```

use std::path::PathBuf;
use std::time::Duration;

use kdl::{KdlDocument, KdlValue};
use thiserror::Error;

pub const APPID: &str = "display-mode-keeper";
pub const CONFIG_ENV: &str = "DISPLAY_MODE_KEEPER_CONFIG";

/// Mode selection limits
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Policy {
    pub cap_width: u32,
    pub cap_height: u32,
    pub cap_rate_hz: f64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            cap_width: 1920,
            cap_height: 1080,
            cap_rate_hz: 30.5,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub policy: Policy,
    /// Period of the reconciliation poll
    pub poll_interval: Duration,
    /// Upper bound for every external tool invocation
    pub query_timeout: Duration,
    /// Delay after a hotplug notification before the outputs are queried
    pub hotplug_settle: Duration,
    /// Command line of the display configuration tool, used for both query
    /// and apply; split on whitespace
    pub randr_command: String,
    /// Whether to listen for udev hotplug events at all
    pub hotplug: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            policy: Policy::default(),
            poll_interval: Duration::from_millis(5000),
            query_timeout: Duration::from_millis(5000),
            hotplug_settle: Duration::from_millis(1000),
            randr_command: "xrandr".to_string(),
            hotplug: true,
        }
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid KDL: {0}")]
    Kdl(#[from] kdl::KdlError),

    #[error("`{node}` expects {expected}")]
    InvalidValue {
        node: String,
        expected: &'static str,
    },

    #[error("failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Config {
    /// Location of the config file, honouring the override variable
    pub fn path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|dir| dir.join(APPID).join("config.kdl"))
    }

    /// Load the config file, falling back to defaults when it is missing
    pub fn load() -> Result<Self, ConfigError> {
        let Some(path) = Self::path() else {
            warn!("No config directory available, using default policy");
            return Ok(Self::default());
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                info!("Loading config from {}", path.display());
                Self::from_kdl(&text)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read { path, source }),
        }
    }

    /// Parse a KDL document; nodes that are absent keep their defaults
    pub fn from_kdl(text: &str) -> Result<Self, ConfigError> {
        let doc: KdlDocument = text.parse()?;
        let mut config = Self::default();

        for node in doc.nodes() {
            let name = node.name().value();
            let value = node
                .entries()
                .iter()
                .find(|entry| entry.name().is_none())
                .map(|entry| entry.value());

            match name {
                "cap-width" => config.policy.cap_width = positive_u32(name, value)?,
                "cap-height" => config.policy.cap_height = positive_u32(name, value)?,
                "cap-rate-hz" => config.policy.cap_rate_hz = positive_f64(name, value)?,
                "poll-interval-ms" => config.poll_interval = millis(name, value)?,
                "query-timeout-ms" => config.query_timeout = millis(name, value)?,
                "hotplug-settle-ms" => {
                    // zero is allowed here: no settle delay
                    let ms = integer(name, value, "a non-negative integer")?;
                    config.hotplug_settle = Duration::from_millis(ms);
                }
                "randr-command" => {
                    config.randr_command = value
                        .and_then(KdlValue::as_string)
                        .filter(|s| !s.trim().is_empty())
                        .ok_or_else(|| invalid(name, "a non-empty string"))?
                        .to_string();
                }
                "hotplug" => {
                    config.hotplug = value
                        .and_then(KdlValue::as_bool)
                        .ok_or_else(|| invalid(name, "#true or #false"))?;
                }
                other => warn!("Ignoring unknown config node `{}`", other),
            }
        }

        Ok(config)
    }
}

fn invalid(node: &str, expected: &'static str) -> ConfigError {
    ConfigError::InvalidValue {
        node: node.to_string(),
        expected,
    }
}

fn integer(node: &str, value: Option<&KdlValue>, expected: &'static str) -> Result<u64, ConfigError> {
    value
        .and_then(KdlValue::as_integer)
        .and_then(|v| u64::try_from(v).ok())
        .ok_or_else(|| invalid(node, expected))
}

fn positive_u32(node: &str, value: Option<&KdlValue>) -> Result<u32, ConfigError> {
    integer(node, value, "a positive integer")
        .ok()
        .and_then(|v| u32::try_from(v).ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| invalid(node, "a positive integer"))
}

fn positive_f64(node: &str, value: Option<&KdlValue>) -> Result<f64, ConfigError> {
    value
        .and_then(|v| v.as_float().or_else(|| v.as_integer().map(|i| i as f64)))
        .filter(|v| v.is_finite() && *v > 0.0)
        .ok_or_else(|| invalid(node, "a positive number"))
}

fn millis(node: &str, value: Option<&KdlValue>) -> Result<Duration, ConfigError> {
    let ms = integer(node, value, "a positive number of milliseconds")?;
    if ms == 0 {
        return Err(invalid(node, "a positive number of milliseconds"));
    }
    Ok(Duration::from_millis(ms))
}
