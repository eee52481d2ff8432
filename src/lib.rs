//! Driver for ACE filament dryer/feeder units on a USB serial link.
//!
//! [`commands::AceDriver`] is the async operation surface and
//! [`blocking::AceClient`] wraps it for synchronous hosts. Both are built on
//! [`device::LinkManager`], which owns the connection and its reader and
//! writer tasks.

pub mod blocking;
pub mod commands;
pub mod config;
pub mod device;
pub mod serial;

pub use blocking::AceClient;
pub use commands::{AceDriver, Operation, OperationOutput};
pub use config::AceConfig;
pub use device::{ConnectionState, DeviceError, DeviceMode, DeviceStatus};
pub use serial::protocol::{Port, ToolSelection};
