pub mod manager;
pub mod models;

pub use manager::{ConnectMode, LinkManager};
pub use models::*;

use std::time::Duration;

use crate::serial::protocol::{FrameError, ParamError};
use crate::serial::SerialError;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No ACE device found (by-id, USB id, description and conventional paths all failed)")]
    DeviceNotFound,

    #[error("Connection to the ACE unit was lost")]
    ConnectionLost,

    #[error("Could not connect after {attempts} attempts ({reason}); check the cable and power-cycle the unit")]
    ConnectFailed { attempts: u32, reason: String },

    /// Listed for completeness; the reader drops corrupt frames and counts
    /// them in `MetricsSnapshot::corrupt_frames` instead of failing a request.
    #[error("Corrupt frame: {0}")]
    CorruptFrame(FrameError),

    #[error("No reply to {method} within {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(#[from] ParamError),

    #[error("Unit reported error {code}: {message}")]
    DeviceFault { code: i64, message: String },

    #[error("Slot {0} is empty")]
    SlotEmpty(u8),

    #[error("Serial communication error: {0}")]
    SerialError(#[from] SerialError),
}

impl DeviceError {
    /// Needs an operator (replug, power-cycle) rather than a retry
    pub fn is_terminal(&self) -> bool {
        matches!(self, DeviceError::ConnectFailed { .. })
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DeviceError::ConnectionLost
                | DeviceError::ConnectFailed { .. }
                | DeviceError::DeviceNotFound
                | DeviceError::SerialError(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
