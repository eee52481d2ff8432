use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};

use crate::config::AceConfig;
use crate::device::{
    ConnectionState, DeviceError, DeviceInfo, DeviceStatus, FilamentLookup, LinkManager, OperationKind, Result,
};
use crate::serial::protocol::{Command, DryingParams, MoveParams, Port, Response, ToolSelection};
use crate::serial::unified::MetricsSnapshot;
use crate::serial::{Connector, SerialConnector};

/// Extra settle time after a move's nominal duration
const MOVE_SETTLE: Duration = Duration::from_millis(100);
const FALLBACK_POLL: Duration = Duration::from_millis(250);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryingStarted {
    pub temperature: u16,
    pub duration_minutes: u32,
    pub fan_speed: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveOutcome {
    pub port: Port,
    pub requested_mm: u32,
    /// Length the unit reports having moved, when it reports one
    pub moved_mm: Option<u32>,
    pub speed: u32,
    pub expected_duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParkOutcome {
    pub port: Port,
    pub assist_count: u32,
    pub status_reports: u32,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolChangeOutcome {
    pub previous: ToolSelection,
    pub current: ToolSelection,
    /// False when the requested tool was already active
    pub changed: bool,
    pub retracted: Option<MoveOutcome>,
    pub parked: Option<ParkOutcome>,
}

/// Operator-level request, as dispatched by a host command table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum Operation {
    Status,
    StartDrying { temperature: i32, duration_minutes: i32 },
    StopDrying,
    EnableFeedAssist { port: i32 },
    DisableFeedAssist { port: Option<i32> },
    Feed { port: i32, length: i32, speed: Option<i32> },
    Retract { port: i32, length: i32, speed: Option<i32> },
    ParkToToolhead { port: i32 },
    ChangeTool { tool: i32 },
    FilamentInfo { port: i32 },
    DebugProbe,
    DebugRequest { method: String, #[serde(default)] params: Value },
    AcknowledgeFault,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Status(DeviceStatus),
    Drying(DryingStarted),
    DryingStopped,
    FeedAssist(Port),
    Moved(MoveOutcome),
    Parked(ParkOutcome),
    ToolChanged(ToolChangeOutcome),
    Filament(FilamentLookup),
    Info(DeviceInfo),
    Raw(Response),
    Acknowledged(bool),
}

/// The operation surface of the driver
pub struct AceDriver {
    link: LinkManager,
    park_lock: tokio::sync::Mutex<()>,
    tool_lock: tokio::sync::Mutex<()>,
}

impl AceDriver {
    /// Driver on the real serial port. Must be called inside a tokio runtime.
    pub fn new(config: AceConfig) -> Self {
        let connector = Arc::new(SerialConnector::new(config.serial.clone()));
        Self::with_connector(config, connector)
    }

    pub fn with_connector(config: AceConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            link: LinkManager::new(config, connector),
            park_lock: tokio::sync::Mutex::new(()),
            tool_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn link(&self) -> &LinkManager {
        &self.link
    }

    fn config(&self) -> &AceConfig {
        self.link.config()
    }

    pub async fn connect(&self) -> Result<()> {
        self.link.connect().await
    }

    pub async fn reconnect(&self) -> Result<()> {
        self.link.reconnect().await
    }

    pub async fn disconnect(&self) {
        self.link.disconnect().await
    }

    pub async fn locate(&self) -> Result<String> {
        self.link.locate().await
    }

    pub fn link_state(&self) -> ConnectionState {
        self.link.state()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.link.metrics()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.link.subscribe_status()
    }

    /// Last known status, no device I/O
    pub fn cached_status(&self) -> DeviceStatus {
        self.link.status()
    }

    /// Send and map a non-zero reply code to `DeviceFault`
    async fn call(&self, command: Command) -> Result<Response> {
        let response = self.link.request(command).await?;
        if !response.is_ok() {
            return Err(DeviceError::DeviceFault {
                code: response.code,
                message: response.message().to_string(),
            });
        }
        Ok(response)
    }

    /// Fresh status read from the unit
    pub async fn status(&self) -> Result<DeviceStatus> {
        self.call(Command::GetStatus).await?;
        Ok(self.link.status())
    }

    pub async fn start_drying(&self, temperature: i32, duration_minutes: i32) -> Result<DryingStarted> {
        let config = self.config();
        let params = DryingParams::new(
            temperature,
            duration_minutes,
            config.max_dryer_temperature,
            config.max_dryer_duration_minutes,
            config.dryer_fan_speed,
        )?;
        self.call(Command::StartDrying(params)).await?;
        log::info!("Drying started at {}C for {} min", params.temperature, params.duration_minutes);
        Ok(DryingStarted {
            temperature: params.temperature,
            duration_minutes: params.duration_minutes,
            fan_speed: params.fan_speed,
        })
    }

    pub async fn stop_drying(&self) -> Result<()> {
        self.call(Command::StopDrying).await?;
        log::info!("Drying stopped");
        Ok(())
    }

    pub async fn enable_feed_assist(&self, port: i32) -> Result<Port> {
        let port = Port::new(port)?;
        self.call(Command::StartFeedAssist(port)).await?;
        log::info!("Feed assist enabled for slot {}", port);
        Ok(port)
    }

    /// `None` targets the port feed assist was last enabled on
    pub async fn disable_feed_assist(&self, port: Option<i32>) -> Result<Port> {
        let port = match port {
            Some(index) => Port::new(index)?,
            None => match self.link.status().feed_assist_port {
                Some(port) => port,
                None => Port::new(-1)?,
            },
        };
        self.call(Command::StopFeedAssist(port)).await?;
        log::info!("Feed assist disabled for slot {}", port);
        Ok(port)
    }

    pub async fn feed(&self, port: i32, length: i32, speed: Option<i32>) -> Result<MoveOutcome> {
        let speed = speed.unwrap_or(self.config().feed_speed as i32);
        let params = MoveParams::new(port, length, speed)?;
        let response = self.call(Command::Feed(params)).await?;
        Ok(move_outcome(&params, &response))
    }

    pub async fn retract(&self, port: i32, length: i32, speed: Option<i32>) -> Result<MoveOutcome> {
        let speed = speed.unwrap_or(self.config().retract_speed as i32);
        let params = MoveParams::new(port, length, speed)?;
        let response = self.call(Command::Retract(params)).await?;
        Ok(move_outcome(&params, &response))
    }

    pub async fn filament_info(&self, port: i32) -> Result<FilamentLookup> {
        let port = Port::new(port)?;
        self.call(Command::FilamentInfo(port)).await?;
        Ok(self
            .link
            .status()
            .slot(port)
            .filament
            .clone()
            .unwrap_or(FilamentLookup::NoTag))
    }

    pub async fn debug_probe(&self) -> Result<DeviceInfo> {
        let response = self.call(Command::GetInfo).await?;
        Ok(DeviceInfo::from_result(response.result.as_ref()))
    }

    /// Arbitrary method; the raw reply is returned whatever its code
    pub async fn debug_request(&self, method: &str, params: Value) -> Result<Response> {
        let command = Command::raw(method, params)?;
        self.link.request(command).await
    }

    /// Re-read status and clear a sticky fault if the unit is healthy.
    /// Returns whether the fault is gone.
    pub async fn acknowledge_fault(&self) -> Result<bool> {
        self.link.request(Command::AcknowledgeFault).await?;
        let cleared = self.link.status().fault.is_none();
        if cleared {
            log::info!("Fault acknowledged");
        }
        Ok(cleared)
    }

    pub async fn park_to_toolhead(&self, port: i32) -> Result<ParkOutcome> {
        let port = Port::new(port)?;
        self.park(port).await
    }

    /// Feed with assist until the assist counter stops moving for
    /// `park_hit_count` consecutive status reports.
    async fn park(&self, port: Port) -> Result<ParkOutcome> {
        let _parking = self.park_lock.lock().await;
        let hit_target = self.config().park_hit_count;
        let park_timeout = self.config().park_timeout();
        let poll = self.config().status_poll_interval().unwrap_or(FALLBACK_POLL);

        let status = self.status().await?;
        if !status.slot(port).is_ready() {
            return Err(DeviceError::SlotEmpty(port.index()));
        }

        let mut updates = self.link.subscribe_status();
        let mut last_seq = updates.borrow_and_update().report_seq;
        let started = Instant::now();
        let started_at = Utc::now();
        let deadline = started + park_timeout;

        self.call(Command::StartFeedAssist(port)).await?;
        log::info!("Parking slot {} to toolhead", port);

        let mut last_count = 0u32;
        let mut hits = 0u32;
        let mut reports = 0u32;

        loop {
            if Instant::now() >= deadline {
                self.stop_assist_quietly(port).await;
                return Err(DeviceError::Timeout {
                    method: "park_to_toolhead".to_string(),
                    timeout: park_timeout,
                });
            }

            if tokio::time::timeout(poll * 2, updates.changed()).await.is_err() {
                // no status arrived on its own, ask for one
                if let Err(e) = self.status().await {
                    if e.is_connectivity() {
                        return Err(e);
                    }
                }
            }

            let (seq, ready, count, fault) = {
                let snapshot = updates.borrow_and_update();
                (
                    snapshot.report_seq,
                    snapshot.ready,
                    snapshot.feed_assist_count,
                    snapshot.fault.clone(),
                )
            };

            if let Some(fault) = fault.filter(|f| f.at >= started_at) {
                self.stop_assist_quietly(port).await;
                return Err(DeviceError::DeviceFault {
                    code: fault.code,
                    message: fault.message,
                });
            }
            if seq == last_seq {
                continue;
            }
            last_seq = seq;
            if !ready {
                continue;
            }
            reports += 1;

            if count > last_count {
                last_count = count;
                hits = 0;
            } else {
                hits += 1;
                if hits >= hit_target {
                    break;
                }
            }
        }

        self.call(Command::StopFeedAssist(port)).await?;
        log::info!("Parked slot {} to toolhead with assist count {}", port, last_count);
        Ok(ParkOutcome {
            port,
            assist_count: last_count,
            status_reports: reports,
            elapsed: started.elapsed(),
        })
    }

    async fn stop_assist_quietly(&self, port: Port) {
        if let Err(e) = self.call(Command::StopFeedAssist(port)).await {
            log::warn!("Failed to stop feed assist on slot {}: {}", port, e);
        }
    }

    /// Wait for a status report taken after now that says the unit is ready
    async fn wait_until_ready(&self, timeout: Duration) -> Result<()> {
        let poll = self.config().status_poll_interval().unwrap_or(FALLBACK_POLL);
        let deadline = Instant::now() + timeout;
        let mut updates = self.link.subscribe_status();
        let seq = updates.borrow_and_update().report_seq;

        loop {
            {
                let snapshot = updates.borrow_and_update();
                if snapshot.report_seq > seq && snapshot.ready {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(DeviceError::Timeout {
                    method: "wait_until_ready".to_string(),
                    timeout,
                });
            }
            if timeout_at(deadline.min(Instant::now() + poll * 2), updates.changed())
                .await
                .is_err()
            {
                self.call(Command::GetStatus).await?;
            }
        }
    }

    /// `tool = -1` unloads and selects nothing
    pub async fn change_tool(&self, tool: i32) -> Result<ToolChangeOutcome> {
        let target = ToolSelection::from_index(tool)?;
        let _changing = self.tool_lock.lock().await;

        let previous = self.link.status().active_tool;
        if previous == target {
            log::info!("Tool already set to {}", target.index());
            return Ok(ToolChangeOutcome {
                previous,
                current: target,
                changed: false,
                retracted: None,
                parked: None,
            });
        }

        let status = self.status().await?;
        if let Some(port) = target.port() {
            if !status.slot(port).is_ready() {
                return Err(DeviceError::SlotEmpty(port.index()));
            }
        }

        log::info!("Changing tool {} -> {}", previous.index(), target.index());
        let _operation = self.link.track_operation(OperationKind::ToolChanging);
        let config = self.config().clone();

        let retracted = match previous.port() {
            Some(loaded) => {
                let outcome = self
                    .retract(
                        loaded.index() as i32,
                        config.toolchange_retract_length as i32,
                        Some(config.retract_speed as i32),
                    )
                    .await?;
                tokio::time::sleep(outcome.expected_duration + MOVE_SETTLE).await;
                self.wait_until_ready(config.park_timeout()).await?;
                self.link.update_status(|s| s.set_active_tool(ToolSelection::None));
                Some(outcome)
            }
            None => None,
        };

        let parked = match target.port() {
            Some(port) => {
                let outcome = self.park(port).await?;
                if !config.disable_assist_after_toolchange {
                    self.call(Command::StartFeedAssist(port)).await?;
                }
                Some(outcome)
            }
            None => None,
        };

        self.link.update_status(|s| s.set_active_tool(target));
        log::info!("Tool changed to {}", target.index());
        Ok(ToolChangeOutcome {
            previous,
            current: target,
            changed: true,
            retracted,
            parked,
        })
    }

    /// Exhaustive dispatch of an operator request
    pub async fn execute(&self, operation: Operation) -> Result<OperationOutput> {
        Ok(match operation {
            Operation::Status => OperationOutput::Status(self.status().await?),
            Operation::StartDrying {
                temperature,
                duration_minutes,
            } => OperationOutput::Drying(self.start_drying(temperature, duration_minutes).await?),
            Operation::StopDrying => {
                self.stop_drying().await?;
                OperationOutput::DryingStopped
            }
            Operation::EnableFeedAssist { port } => OperationOutput::FeedAssist(self.enable_feed_assist(port).await?),
            Operation::DisableFeedAssist { port } => {
                OperationOutput::FeedAssist(self.disable_feed_assist(port).await?)
            }
            Operation::Feed { port, length, speed } => OperationOutput::Moved(self.feed(port, length, speed).await?),
            Operation::Retract { port, length, speed } => {
                OperationOutput::Moved(self.retract(port, length, speed).await?)
            }
            Operation::ParkToToolhead { port } => OperationOutput::Parked(self.park_to_toolhead(port).await?),
            Operation::ChangeTool { tool } => OperationOutput::ToolChanged(self.change_tool(tool).await?),
            Operation::FilamentInfo { port } => OperationOutput::Filament(self.filament_info(port).await?),
            Operation::DebugProbe => OperationOutput::Info(self.debug_probe().await?),
            Operation::DebugRequest { method, params } => {
                OperationOutput::Raw(self.debug_request(&method, params).await?)
            }
            Operation::AcknowledgeFault => OperationOutput::Acknowledged(self.acknowledge_fault().await?),
        })
    }
}

fn move_outcome(params: &MoveParams, response: &Response) -> MoveOutcome {
    let moved_mm = response
        .result
        .as_ref()
        .and_then(|r| r.get("length"))
        .and_then(Value::as_u64)
        .map(|v| v as u32);
    MoveOutcome {
        port: params.port,
        requested_mm: params.length,
        moved_mm,
        speed: params.speed,
        expected_duration: params.expected_duration(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn operation_parses_from_json() {
        let op: Operation = serde_json::from_value(json!({"operation": "feed", "port": 1, "length": 20, "speed": null})).unwrap();
        assert_eq!(
            op,
            Operation::Feed {
                port: 1,
                length: 20,
                speed: None
            }
        );
        let op: Operation = serde_json::from_value(json!({"operation": "change_tool", "tool": -1})).unwrap();
        assert_eq!(op, Operation::ChangeTool { tool: -1 });
        let op: Operation = serde_json::from_value(json!({"operation": "debug_request", "method": "get_info"})).unwrap();
        assert_eq!(
            op,
            Operation::DebugRequest {
                method: "get_info".into(),
                params: Value::Null
            }
        );
    }

    #[test]
    fn move_outcome_reads_reported_length() {
        let params = MoveParams::new(0, 50, 25).unwrap();
        let response = Response {
            id: Some(1),
            code: 0,
            msg: None,
            result: Some(json!({"length": 48})),
        };
        let outcome = move_outcome(&params, &response);
        assert_eq!(outcome.moved_mm, Some(48));
        assert_eq!(outcome.expected_duration, Duration::from_secs(2));

        let bare = Response::default();
        assert_eq!(move_outcome(&params, &bare).moved_mm, None);
    }

    #[tokio::test]
    async fn invalid_parameters_never_touch_the_link() {
        let driver = AceDriver::new(AceConfig::default());
        assert!(matches!(driver.feed(4, 10, None).await, Err(DeviceError::InvalidParameter(_))));
        assert!(matches!(driver.feed(0, 0, None).await, Err(DeviceError::InvalidParameter(_))));
        assert!(matches!(driver.start_drying(80, 10).await, Err(DeviceError::InvalidParameter(_))));
        assert!(matches!(driver.start_drying(45, 0).await, Err(DeviceError::InvalidParameter(_))));
        assert!(matches!(driver.change_tool(5).await, Err(DeviceError::InvalidParameter(_))));
        assert!(matches!(driver.disable_feed_assist(None).await, Err(DeviceError::InvalidParameter(_))));
        assert_eq!(driver.metrics().frames_written, 0);
    }

    #[tokio::test]
    async fn requests_fail_fast_when_never_connected() {
        let driver = AceDriver::new(AceConfig::default());
        assert!(matches!(driver.stop_drying().await, Err(DeviceError::ConnectionLost)));
    }
}
