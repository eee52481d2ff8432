pub mod driver;

pub use driver::{AceConfig, ConfigError, ReconnectPolicy, SerialSelector, DEFAULT_BAUD};
