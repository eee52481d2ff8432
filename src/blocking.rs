//! Synchronous facade for hosts that have no async executor of their own.
//!
//! Each call parks the calling thread until the operation resolves; the
//! reader, writer and supervisor tasks keep running on the owned runtime's
//! worker threads in the meantime.
use std::sync::Arc;

use serde_json::Value;
use tokio::runtime::Runtime;

use crate::commands::{AceDriver, DryingStarted, MoveOutcome, Operation, OperationOutput, ParkOutcome, ToolChangeOutcome};
use crate::config::AceConfig;
use crate::device::{ConnectionState, DeviceError, DeviceInfo, DeviceStatus, FilamentLookup, Result};
use crate::serial::protocol::{Port, Response};
use crate::serial::unified::MetricsSnapshot;
use crate::serial::Connector;

pub struct AceClient {
    driver: AceDriver,
    runtime: Runtime,
}

impl AceClient {
    pub fn new(config: AceConfig) -> Result<Self> {
        let runtime = build_runtime()?;
        let driver = {
            let _guard = runtime.enter();
            AceDriver::new(config)
        };
        Ok(Self { driver, runtime })
    }

    pub fn with_connector(config: AceConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let runtime = build_runtime()?;
        let driver = {
            let _guard = runtime.enter();
            AceDriver::with_connector(config, connector)
        };
        Ok(Self { driver, runtime })
    }

    pub fn driver(&self) -> &AceDriver {
        &self.driver
    }

    pub fn connect(&self) -> Result<()> {
        self.runtime.block_on(self.driver.connect())
    }

    pub fn reconnect(&self) -> Result<()> {
        self.runtime.block_on(self.driver.reconnect())
    }

    pub fn disconnect(&self) {
        self.runtime.block_on(self.driver.disconnect())
    }

    pub fn link_state(&self) -> ConnectionState {
        self.driver.link_state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.driver.metrics()
    }

    pub fn cached_status(&self) -> DeviceStatus {
        self.driver.cached_status()
    }

    pub fn status(&self) -> Result<DeviceStatus> {
        self.runtime.block_on(self.driver.status())
    }

    pub fn start_drying(&self, temperature: i32, duration_minutes: i32) -> Result<DryingStarted> {
        self.runtime.block_on(self.driver.start_drying(temperature, duration_minutes))
    }

    pub fn stop_drying(&self) -> Result<()> {
        self.runtime.block_on(self.driver.stop_drying())
    }

    pub fn enable_feed_assist(&self, port: i32) -> Result<Port> {
        self.runtime.block_on(self.driver.enable_feed_assist(port))
    }

    pub fn disable_feed_assist(&self, port: Option<i32>) -> Result<Port> {
        self.runtime.block_on(self.driver.disable_feed_assist(port))
    }

    pub fn feed(&self, port: i32, length: i32, speed: Option<i32>) -> Result<MoveOutcome> {
        self.runtime.block_on(self.driver.feed(port, length, speed))
    }

    pub fn retract(&self, port: i32, length: i32, speed: Option<i32>) -> Result<MoveOutcome> {
        self.runtime.block_on(self.driver.retract(port, length, speed))
    }

    pub fn park_to_toolhead(&self, port: i32) -> Result<ParkOutcome> {
        self.runtime.block_on(self.driver.park_to_toolhead(port))
    }

    pub fn change_tool(&self, tool: i32) -> Result<ToolChangeOutcome> {
        self.runtime.block_on(self.driver.change_tool(tool))
    }

    pub fn filament_info(&self, port: i32) -> Result<FilamentLookup> {
        self.runtime.block_on(self.driver.filament_info(port))
    }

    pub fn debug_probe(&self) -> Result<DeviceInfo> {
        self.runtime.block_on(self.driver.debug_probe())
    }

    pub fn debug_request(&self, method: &str, params: Value) -> Result<Response> {
        self.runtime.block_on(self.driver.debug_request(method, params))
    }

    pub fn acknowledge_fault(&self) -> Result<bool> {
        self.runtime.block_on(self.driver.acknowledge_fault())
    }

    pub fn execute(&self, operation: Operation) -> Result<OperationOutput> {
        self.runtime.block_on(self.driver.execute(operation))
    }
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("ace-link")
        .enable_all()
        .build()
        .map_err(|e| DeviceError::SerialError(e.into()))
}
