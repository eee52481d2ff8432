pub mod reader;
pub mod types;
pub mod writer;

pub use types::{CorrelationKey, LinkEvent, LinkShared, MetricsSnapshot, PendingRequest, RequestIds};
