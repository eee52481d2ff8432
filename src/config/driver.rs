//! Driver configuration
//!
//! Every field has a default, so an empty JSON object is a valid config.
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::serial::protocol::{MAX_MOVE_LENGTH_MM, MAX_MOVE_SPEED, MIN_DRYER_TEMPERATURE};

pub const DEFAULT_BAUD: u32 = 115_200;

/// Where to find the unit: a fixed device path or `auto` discovery
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SerialSelector {
    #[default]
    Auto,
    Path(String),
}

impl From<String> for SerialSelector {
    fn from(value: String) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("auto") {
            SerialSelector::Auto
        } else {
            SerialSelector::Path(trimmed.to_string())
        }
    }
}

impl From<SerialSelector> for String {
    fn from(value: SerialSelector) -> Self {
        match value {
            SerialSelector::Auto => "auto".to_string(),
            SerialSelector::Path(path) => path,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    /// Connect attempts per connect sequence before `Failed`; also the
    /// number of link losses tolerated within `window_secs`
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub window_secs: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 5_000,
            window_secs: 60,
        }
    }
}

impl ReconnectPolicy {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AceConfig {
    pub serial: SerialSelector,
    pub baud: u32,
    pub feed_speed: u32,
    pub retract_speed: u32,
    pub toolchange_retract_length: u32,
    pub park_hit_count: u32,
    pub max_dryer_temperature: u16,
    pub max_dryer_duration_minutes: u32,
    pub dryer_fan_speed: u32,
    pub disable_assist_after_toolchange: bool,
    pub response_timeout_ms: u64,
    /// 0 disables the background status poll
    pub status_poll_interval_ms: u64,
    pub park_timeout_ms: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for AceConfig {
    fn default() -> Self {
        Self {
            serial: SerialSelector::Auto,
            baud: DEFAULT_BAUD,
            feed_speed: 50,
            retract_speed: 50,
            toolchange_retract_length: 100,
            park_hit_count: 5,
            max_dryer_temperature: 55,
            max_dryer_duration_minutes: 1440,
            dryer_fan_speed: 7000,
            disable_assist_after_toolchange: true,
            response_timeout_ms: 2_000,
            status_poll_interval_ms: 250,
            park_timeout_ms: 60_000,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("reconnect.max_delay_ms ({max}) is below reconnect.base_delay_ms ({base})")]
    BackoffInverted { base: u64, max: u64 },
}

fn non_zero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn within(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange { field, value, min, max });
    }
    Ok(())
}

impl AceConfig {
    pub fn from_json_str(text: &str) -> anyhow::Result<Self> {
        let config: AceConfig = serde_json::from_str(text).context("Failed to parse ACE config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read ACE config {}", path.display()))?;
        Self::from_json_str(&text).with_context(|| format!("Invalid ACE config {}", path.display()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("baud", self.baud as u64)?;
        within("feed_speed", self.feed_speed as u64, 1, MAX_MOVE_SPEED as u64)?;
        within("retract_speed", self.retract_speed as u64, 1, MAX_MOVE_SPEED as u64)?;
        within(
            "toolchange_retract_length",
            self.toolchange_retract_length as u64,
            1,
            MAX_MOVE_LENGTH_MM as u64,
        )?;
        non_zero("park_hit_count", self.park_hit_count as u64)?;
        within(
            "max_dryer_temperature",
            self.max_dryer_temperature as u64,
            MIN_DRYER_TEMPERATURE as u64,
            u16::MAX as u64,
        )?;
        non_zero("max_dryer_duration_minutes", self.max_dryer_duration_minutes as u64)?;
        non_zero("response_timeout_ms", self.response_timeout_ms)?;
        non_zero("park_timeout_ms", self.park_timeout_ms)?;
        non_zero("reconnect.max_attempts", self.reconnect.max_attempts as u64)?;
        if self.reconnect.max_delay_ms < self.reconnect.base_delay_ms {
            return Err(ConfigError::BackoffInverted {
                base: self.reconnect.base_delay_ms,
                max: self.reconnect.max_delay_ms,
            });
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn status_poll_interval(&self) -> Option<Duration> {
        (self.status_poll_interval_ms > 0).then(|| Duration::from_millis(self.status_poll_interval_ms))
    }

    pub fn park_timeout(&self) -> Duration {
        Duration::from_millis(self.park_timeout_ms)
    }
}
