use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::serial::protocol::{Command, Port, Response, StatusReport, ToolSelection, SLOT_COUNT};

/// Link connection state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Retry budget exhausted; needs an explicit reconnect
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum DeviceMode {
    #[default]
    Idle,
    Drying,
    Feeding,
    Retracting,
    ToolChanging,
    Error,
}

/// Long running operations that put the unit in a motion mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Feeding,
    Retracting,
    ToolChanging,
}

impl From<OperationKind> for DeviceMode {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Feeding => DeviceMode::Feeding,
            OperationKind::Retracting => DeviceMode::Retracting,
            OperationKind::ToolChanging => DeviceMode::ToolChanging,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DryerState {
    pub active: bool,
    pub current_temp: f32,
    pub target_temp: u16,
    pub duration_minutes: u32,
    pub remaining_seconds: u32,
    pub fan_speed: u32,
}

impl DryerState {
    pub fn remaining_minutes(&self) -> u32 {
        self.remaining_seconds.div_ceil(60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum SlotState {
    #[default]
    Empty,
    Ready,
    Other(String),
}

impl SlotState {
    pub fn from_wire(status: &str) -> Self {
        match status {
            "ready" => SlotState::Ready,
            "empty" | "" => SlotState::Empty,
            other => SlotState::Other(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TemperatureRange {
    #[serde(default)]
    pub min: i32,
    #[serde(default)]
    pub max: i32,
}

/// Fields read from a slot's RFID tag, passed through undecoded
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FilamentInfo {
    #[serde(default)]
    pub sku: String,
    #[serde(default)]
    pub brand: String,
    #[serde(default, rename = "type")]
    pub material: String,
    #[serde(default)]
    pub color: Vec<u8>,
    #[serde(default)]
    pub extruder_temp: Option<TemperatureRange>,
    #[serde(default)]
    pub hotbed_temp: Option<TemperatureRange>,
    #[serde(default)]
    pub diameter: Option<f32>,
    #[serde(skip)]
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum FilamentLookup {
    Tag(FilamentInfo),
    NoTag,
}

impl FilamentLookup {
    /// A missing, empty or unidentifiable result means no tag is present
    pub fn from_result(result: Option<&Value>) -> Self {
        let Some(value) = result.filter(|v| v.as_object().is_some_and(|o| !o.is_empty())) else {
            return FilamentLookup::NoTag;
        };
        match serde_json::from_value::<FilamentInfo>(value.clone()) {
            Ok(mut info) if !info.sku.is_empty() || !info.material.is_empty() => {
                info.raw = value.clone();
                FilamentLookup::Tag(info)
            }
            _ => FilamentLookup::NoTag,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SlotStatus {
    pub index: u8,
    pub state: SlotState,
    pub sku: String,
    pub material: String,
    pub color: [u8; 3],
    pub feed_assist: bool,
    pub filament: Option<FilamentLookup>,
}

impl SlotStatus {
    fn new(index: u8) -> Self {
        Self {
            index,
            ..Default::default()
        }
    }

    pub fn is_ready(&self) -> bool {
        self.state == SlotState::Ready
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceFault {
    pub code: i64,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Result of `get_info`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct DeviceInfo {
    pub model: String,
    pub firmware: String,
    pub hardware: Option<String>,
    pub serial: Option<String>,
    pub raw: Value,
}

impl DeviceInfo {
    pub fn from_result(result: Option<&Value>) -> Self {
        let text = |key: &str| {
            result
                .and_then(|r| r.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        };
        Self {
            model: text("model").unwrap_or_else(|| "Unknown".to_string()),
            firmware: text("firmware").unwrap_or_else(|| "Unknown".to_string()),
            hardware: text("hardware"),
            serial: text("serial").or_else(|| text("id")),
            raw: result.cloned().unwrap_or(Value::Null),
        }
    }
}

/// Last known state of the unit. Written by the reader task; callers get
/// cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceStatus {
    pub mode: DeviceMode,
    /// The unit reported `ready` (not busy)
    pub ready: bool,
    /// At least one status report arrived on the current connection
    pub synced: bool,
    pub device_state: String,
    pub temperature: f32,
    pub dryer: DryerState,
    pub enable_rfid: bool,
    pub feed_assist_count: u32,
    pub cont_assist_time: f64,
    pub slots: Vec<SlotStatus>,
    pub feed_assist_port: Option<Port>,
    pub active_tool: ToolSelection,
    pub fault: Option<DeviceFault>,
    pub info: Option<DeviceInfo>,
    pub in_flight: Vec<OperationKind>,
    pub report_seq: u64,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for DeviceStatus {
    fn default() -> Self {
        Self {
            mode: DeviceMode::Idle,
            ready: false,
            synced: false,
            device_state: String::new(),
            temperature: 0.0,
            dryer: DryerState::default(),
            enable_rfid: false,
            feed_assist_count: 0,
            cont_assist_time: 0.0,
            slots: (0..SLOT_COUNT as u8).map(SlotStatus::new).collect(),
            feed_assist_port: None,
            active_tool: ToolSelection::None,
            fault: None,
            info: None,
            in_flight: Vec::new(),
            report_seq: 0,
            updated_at: None,
        }
    }
}

impl DeviceStatus {
    pub fn slot(&self, port: Port) -> &SlotStatus {
        &self.slots[port.index() as usize]
    }

    fn slot_mut(&mut self, port: Port) -> &mut SlotStatus {
        &mut self.slots[port.index() as usize]
    }

    pub fn error_code(&self) -> Option<i64> {
        self.fault.as_ref().map(|f| f.code)
    }

    /// Fold a full status report into the snapshot
    pub fn apply_report(&mut self, report: &StatusReport) {
        self.device_state = report.status.clone();
        self.ready = report.status == "ready";
        self.temperature = report.temp;
        self.enable_rfid = report.enable_rfid != 0;
        self.feed_assist_count = report.feed_assist_count;
        self.cont_assist_time = report.cont_assist_time;

        self.dryer.active = report.dryer.status == "drying";
        self.dryer.current_temp = report.temp;
        self.dryer.target_temp = report.dryer.target_temp;
        self.dryer.duration_minutes = report.dryer.duration / 60;
        self.dryer.remaining_seconds = if self.dryer.active { report.dryer.remain_time } else { 0 };
        self.dryer.fan_speed = report.fan_speed;

        for slot in &report.slots {
            let Some(target) = self.slots.get_mut(slot.index as usize) else {
                log::debug!("Ignoring status for unknown slot {}", slot.index);
                continue;
            };
            target.state = SlotState::from_wire(&slot.status);
            target.sku = slot.sku.clone();
            target.material = slot.material.clone();
            let mut color = [0u8; 3];
            for (dst, src) in color.iter_mut().zip(&slot.color) {
                *dst = *src;
            }
            target.color = color;
            if target.state == SlotState::Empty {
                target.filament = None;
            }
        }

        if let Some(code) = report.err_code.filter(|c| *c != 0) {
            self.record_fault(code, &format!("Unit reported error code {}", code));
        }

        self.synced = true;
        self.report_seq += 1;
        self.updated_at = Some(Utc::now());
        self.refresh_mode();
    }

    /// Fold the reply to `command` into the snapshot
    pub fn apply_response(&mut self, command: &Command, response: &Response) {
        if !response.is_ok() {
            // raw debug requests hand the code back to the caller as is
            if !matches!(command, Command::Raw { .. }) {
                self.record_fault(response.code, response.message());
            }
            return;
        }

        match command {
            Command::GetStatus | Command::Raw { .. } => {
                if let Some(report) = response.status_report() {
                    self.apply_report(&report);
                }
            }
            Command::AcknowledgeFault => {
                if let Some(report) = response.status_report() {
                    let healthy = report.err_code.unwrap_or(0) == 0;
                    self.apply_report(&report);
                    if healthy {
                        self.fault = None;
                    }
                }
            }
            Command::GetInfo => {
                self.info = Some(DeviceInfo::from_result(response.result.as_ref()));
            }
            Command::StartDrying(params) => {
                self.dryer.active = true;
                self.dryer.target_temp = params.temperature;
                self.dryer.duration_minutes = params.duration_minutes;
                self.dryer.remaining_seconds = params.duration_minutes * 60;
                self.dryer.fan_speed = params.fan_speed;
            }
            Command::StopDrying => {
                self.dryer.active = false;
                self.dryer.remaining_seconds = 0;
            }
            Command::StartFeedAssist(port) => {
                self.slot_mut(*port).feed_assist = true;
                self.feed_assist_port = Some(*port);
            }
            Command::StopFeedAssist(port) => {
                self.slot_mut(*port).feed_assist = false;
                if self.feed_assist_port == Some(*port) {
                    self.feed_assist_port = None;
                }
            }
            Command::FilamentInfo(port) => {
                self.slot_mut(*port).filament = Some(FilamentLookup::from_result(response.result.as_ref()));
            }
            Command::Feed(_) | Command::Retract(_) => {}
        }

        self.updated_at = Some(Utc::now());
        self.refresh_mode();
    }

    /// Sticky until acknowledged
    pub fn record_fault(&mut self, code: i64, message: &str) {
        log::error!("ACE fault {}: {}", code, message);
        self.fault = Some(DeviceFault {
            code,
            message: message.to_string(),
            at: Utc::now(),
        });
        self.refresh_mode();
    }

    pub fn begin_operation(&mut self, kind: OperationKind) {
        self.in_flight.push(kind);
        self.refresh_mode();
    }

    pub fn finish_operation(&mut self, kind: OperationKind) {
        if let Some(pos) = self.in_flight.iter().rposition(|k| *k == kind) {
            self.in_flight.remove(pos);
        }
        self.refresh_mode();
    }

    pub fn set_active_tool(&mut self, tool: ToolSelection) {
        self.active_tool = tool;
        self.updated_at = Some(Utc::now());
    }

    /// Forget hardware state from the previous connection. The active tool
    /// and any unacknowledged fault carry over.
    pub fn begin_session(&mut self) {
        let fresh = DeviceStatus {
            active_tool: self.active_tool,
            fault: self.fault.take(),
            report_seq: self.report_seq,
            ..DeviceStatus::default()
        };
        *self = fresh;
        self.refresh_mode();
    }

    fn refresh_mode(&mut self) {
        self.mode = if self.fault.is_some() {
            DeviceMode::Error
        } else if self.in_flight.contains(&OperationKind::ToolChanging) {
            DeviceMode::ToolChanging
        } else if let Some(kind) = self.in_flight.last() {
            (*kind).into()
        } else if self.dryer.active {
            DeviceMode::Drying
        } else {
            DeviceMode::Idle
        };
    }
}
