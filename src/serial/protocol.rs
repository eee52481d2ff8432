//! ACE wire protocol
//!
//! Frame layout: `FF AA | len:u16le | payload | crc:u16le | FE`. The payload is
//! a JSON object; requests carry `id`, `method` and optional `params`, replies
//! echo the `id` and carry `code`, `msg` and `result`. The checksum is the
//! unit's CRC-16 over the payload.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::unified::types::CorrelationKey;
use super::{Result, SerialError};
use crate::device::models::OperationKind;

pub const FRAME_START: [u8; 2] = [0xFF, 0xAA];
pub const FRAME_END: u8 = 0xFE;
const HEADER_LEN: usize = 4;
const TRAILER_LEN: usize = 3;
pub const MAX_PAYLOAD_LEN: usize = 4096;

pub const SLOT_COUNT: usize = 4;
pub const MIN_DRYER_TEMPERATURE: i32 = 20;
pub const MAX_MOVE_LENGTH_MM: i32 = 5000;
pub const MAX_MOVE_SPEED: i32 = 1000;

/// CRC-16 as computed by the unit's firmware (MCRF4XX: init 0xFFFF,
/// reflected 0x1021, no final xor).
pub fn crc16(buf: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in buf {
        let mut data = byte ^ (crc & 0xFF) as u8;
        data ^= (data & 0x0F) << 4;
        let data = data as u16;
        crc = ((data << 8) | (crc >> 8)) ^ (data >> 4) ^ (data << 3);
    }
    crc
}

/// Why a frame was thrown away
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame does not start with FF AA")]
    MissingStart,

    #[error("declared payload length {0} exceeds the frame limit")]
    Oversize(usize),

    #[error("expected end marker FE, found {0:#04X}")]
    BadTerminator(u8),

    #[error("checksum mismatch: frame carries {expected:#06X}, payload hashes to {actual:#06X}")]
    ChecksumMismatch { expected: u16, actual: u16 },

    #[error("frame is incomplete")]
    Incomplete,

    #[error("frame header abandoned: a complete frame arrived before its declared length")]
    Abandoned,

    #[error("payload is not a valid message: {0}")]
    Payload(String),
}

/// A frame that passed length, terminator and checksum validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub payload: Vec<u8>,
    pub checksum: u16,
}

impl Packet {
    pub fn response(&self) -> std::result::Result<Response, FrameError> {
        serde_json::from_slice(&self.payload).map_err(|e| FrameError::Payload(e.to_string()))
    }
}

pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(SerialError::PayloadTooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len() + TRAILER_LEN);
    frame.extend_from_slice(&FRAME_START);
    frame.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&crc16(payload).to_le_bytes());
    frame.push(FRAME_END);
    Ok(frame)
}

enum Scan {
    Complete(Packet, usize),
    NeedMore,
    Corrupt(FrameError),
}

/// Inspect a buffer that begins with the start marker
fn scan_frame(buf: &[u8]) -> Scan {
    if buf.len() < HEADER_LEN {
        return Scan::NeedMore;
    }

    let len = u16::from_le_bytes([buf[2], buf[3]]) as usize;
    if len > MAX_PAYLOAD_LEN {
        return Scan::Corrupt(FrameError::Oversize(len));
    }

    let total = HEADER_LEN + len + TRAILER_LEN;
    if buf.len() < total {
        return Scan::NeedMore;
    }

    let payload = &buf[HEADER_LEN..HEADER_LEN + len];
    let expected = u16::from_le_bytes([buf[HEADER_LEN + len], buf[HEADER_LEN + len + 1]]);
    let terminator = buf[total - 1];

    if terminator != FRAME_END {
        return Scan::Corrupt(FrameError::BadTerminator(terminator));
    }

    let actual = crc16(payload);
    if actual != expected {
        return Scan::Corrupt(FrameError::ChecksumMismatch { expected, actual });
    }

    Scan::Complete(
        Packet {
            payload: payload.to_vec(),
            checksum: expected,
        },
        total,
    )
}

/// Decode exactly one frame
pub fn decode_frame(bytes: &[u8]) -> std::result::Result<Packet, FrameError> {
    if !bytes.starts_with(&FRAME_START) {
        return Err(FrameError::MissingStart);
    }
    match scan_frame(bytes) {
        Scan::Complete(packet, _) => Ok(packet),
        Scan::NeedMore => Err(FrameError::Incomplete),
        Scan::Corrupt(e) => Err(e),
    }
}

fn find_start(buf: &[u8]) -> Option<usize> {
    buf.windows(FRAME_START.len()).position(|w| w == FRAME_START)
}

/// Incremental decoder fed with whatever the port hands us
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
    corrupt_frames: u64,
    noise_bytes: u64,
    last_error: Option<FrameError>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `bytes` and return every complete, valid frame now available.
    /// Corrupt frames are dropped and counted, never returned as errors.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Packet> {
        self.buffer.extend_from_slice(bytes);
        let mut packets = Vec::new();

        loop {
            match find_start(&self.buffer) {
                Some(0) => {}
                Some(pos) => {
                    self.noise_bytes += pos as u64;
                    self.buffer.drain(..pos);
                }
                None => {
                    // a trailing FF may be the first half of the next marker
                    let keep = usize::from(self.buffer.last() == Some(&FRAME_START[0]));
                    let drop = self.buffer.len() - keep;
                    self.noise_bytes += drop as u64;
                    self.buffer.drain(..drop);
                    break;
                }
            }

            match scan_frame(&self.buffer) {
                Scan::Complete(packet, consumed) => {
                    self.buffer.drain(..consumed);
                    packets.push(packet);
                }
                Scan::NeedMore => match self.later_complete_frame() {
                    // a header-like run of noise must not hold back frames behind it
                    Some(pos) => {
                        log::debug!(
                            "Abandoning stalled frame header after a complete frame at offset {}: {}",
                            pos,
                            hex::encode(&self.buffer[..pos.min(64)])
                        );
                        self.corrupt_frames += 1;
                        self.last_error = Some(FrameError::Abandoned);
                        self.buffer.drain(..pos);
                    }
                    None => break,
                },
                Scan::Corrupt(error) => {
                    log::debug!(
                        "Dropping corrupt ACE frame ({}): {}",
                        error,
                        hex::encode(&self.buffer[..self.buffer.len().min(64)])
                    );
                    self.corrupt_frames += 1;
                    self.last_error = Some(error);
                    // skip this marker, the next scan resynchronises
                    self.buffer.drain(..FRAME_START.len());
                }
            }
        }

        packets
    }

    /// Offset of the first later start marker that begins a fully valid frame
    fn later_complete_frame(&self) -> Option<usize> {
        let mut from = 1;
        while let Some(offset) = find_start(&self.buffer[from..]) {
            let pos = from + offset;
            if let Scan::Complete(..) = scan_frame(&self.buffer[pos..]) {
                return Some(pos);
            }
            from = pos + 1;
        }
        None
    }

    pub fn corrupt_frames(&self) -> u64 {
        self.corrupt_frames
    }

    pub fn noise_bytes(&self) -> u64 {
        self.noise_bytes
    }

    pub fn last_error(&self) -> Option<&FrameError> {
        self.last_error.as_ref()
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Opcodes understood by the unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    GetStatus,
    GetInfo,
    Drying,
    DryingStop,
    StartFeedAssist,
    StopFeedAssist,
    FeedFilament,
    UnwindFilament,
    GetFilamentInfo,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GetStatus => "get_status",
            Method::GetInfo => "get_info",
            Method::Drying => "drying",
            Method::DryingStop => "drying_stop",
            Method::StartFeedAssist => "start_feed_assist",
            Method::StopFeedAssist => "stop_feed_assist",
            Method::FeedFilament => "feed_filament",
            Method::UnwindFilament => "unwind_filament",
            Method::GetFilamentInfo => "get_filament_info",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParamError {
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        name: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    #[error("method name must not be empty")]
    EmptyMethod,

    #[error("params must be a JSON object")]
    ParamsNotObject,
}

fn check_range(name: &'static str, value: i64, min: i64, max: i64) -> std::result::Result<(), ParamError> {
    if value < min || value > max {
        return Err(ParamError::OutOfRange { name, value, min, max });
    }
    Ok(())
}

/// Feed port index, always within `0..SLOT_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Port(u8);

impl Port {
    pub fn new(index: i32) -> std::result::Result<Self, ParamError> {
        check_range("port", index as i64, 0, SLOT_COUNT as i64 - 1)?;
        Ok(Self(index as u8))
    }

    pub fn index(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tool selection for a tool change. `-1` on the operator surface maps to
/// `None` (unload, nothing selected).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSelection {
    #[default]
    None,
    Slot(Port),
}

impl ToolSelection {
    pub fn from_index(tool: i32) -> std::result::Result<Self, ParamError> {
        if tool == -1 {
            return Ok(ToolSelection::None);
        }
        check_range("tool", tool as i64, -1, SLOT_COUNT as i64 - 1)?;
        Ok(ToolSelection::Slot(Port(tool as u8)))
    }

    pub fn index(self) -> i32 {
        match self {
            ToolSelection::None => -1,
            ToolSelection::Slot(port) => port.index() as i32,
        }
    }

    pub fn port(self) -> Option<Port> {
        match self {
            ToolSelection::None => None,
            ToolSelection::Slot(port) => Some(port),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DryingParams {
    pub temperature: u16,
    pub duration_minutes: u32,
    pub fan_speed: u32,
}

impl DryingParams {
    pub fn new(
        temperature: i32,
        duration_minutes: i32,
        max_temperature: u16,
        max_duration_minutes: u32,
        fan_speed: u32,
    ) -> std::result::Result<Self, ParamError> {
        check_range(
            "temperature",
            temperature as i64,
            MIN_DRYER_TEMPERATURE as i64,
            max_temperature as i64,
        )?;
        check_range("duration", duration_minutes as i64, 1, max_duration_minutes as i64)?;
        Ok(Self {
            temperature: temperature as u16,
            duration_minutes: duration_minutes as u32,
            fan_speed,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveParams {
    pub port: Port,
    pub length: u32,
    pub speed: u32,
}

impl MoveParams {
    pub fn new(port: i32, length: i32, speed: i32) -> std::result::Result<Self, ParamError> {
        let port = Port::new(port)?;
        check_range("length", length as i64, 1, MAX_MOVE_LENGTH_MM as i64)?;
        check_range("speed", speed as i64, 1, MAX_MOVE_SPEED as i64)?;
        Ok(Self {
            port,
            length: length as u32,
            speed: speed as u32,
        })
    }

    /// Time the unit needs for the move at the requested speed
    pub fn expected_duration(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.length as f64 / self.speed as f64)
    }
}

/// Every request the driver can put on the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    GetStatus,
    /// Status read that clears a sticky fault when the unit reports healthy
    AcknowledgeFault,
    GetInfo,
    StartDrying(DryingParams),
    StopDrying,
    StartFeedAssist(Port),
    StopFeedAssist(Port),
    Feed(MoveParams),
    Retract(MoveParams),
    FilamentInfo(Port),
    Raw { method: String, params: Option<Value> },
}

impl Command {
    pub fn raw(method: &str, params: Value) -> std::result::Result<Self, ParamError> {
        if method.trim().is_empty() {
            return Err(ParamError::EmptyMethod);
        }
        let params = match params {
            Value::Null => None,
            Value::Object(_) => Some(params),
            _ => return Err(ParamError::ParamsNotObject),
        };
        Ok(Command::Raw {
            method: method.trim().to_string(),
            params,
        })
    }

    pub fn method(&self) -> Option<Method> {
        Some(match self {
            Command::GetStatus | Command::AcknowledgeFault => Method::GetStatus,
            Command::GetInfo => Method::GetInfo,
            Command::StartDrying(_) => Method::Drying,
            Command::StopDrying => Method::DryingStop,
            Command::StartFeedAssist(_) => Method::StartFeedAssist,
            Command::StopFeedAssist(_) => Method::StopFeedAssist,
            Command::Feed(_) => Method::FeedFilament,
            Command::Retract(_) => Method::UnwindFilament,
            Command::FilamentInfo(_) => Method::GetFilamentInfo,
            Command::Raw { .. } => return None,
        })
    }

    pub fn method_name(&self) -> &str {
        match self {
            Command::Raw { method, .. } => method,
            other => other.method().map(|m| m.as_str()).unwrap_or_default(),
        }
    }

    pub fn port(&self) -> Option<Port> {
        match self {
            Command::StartFeedAssist(port) | Command::StopFeedAssist(port) | Command::FilamentInfo(port) => {
                Some(*port)
            }
            Command::Feed(params) | Command::Retract(params) => Some(params.port),
            _ => None,
        }
    }

    pub fn params(&self) -> Option<Value> {
        match self {
            Command::GetStatus | Command::AcknowledgeFault | Command::GetInfo | Command::StopDrying => None,
            Command::StartDrying(p) => Some(json!({
                "temp": p.temperature,
                "fan_speed": p.fan_speed,
                "duration": p.duration_minutes * 60,
            })),
            Command::StartFeedAssist(port) | Command::StopFeedAssist(port) | Command::FilamentInfo(port) => {
                Some(json!({ "index": port.index() }))
            }
            Command::Feed(p) | Command::Retract(p) => Some(json!({
                "index": p.port.index(),
                "length": p.length,
                "speed": p.speed,
            })),
            Command::Raw { params, .. } => params.clone(),
        }
    }

    /// Opcode plus port: at most one request per key is on the wire
    pub fn key(&self) -> CorrelationKey {
        CorrelationKey::new(self.method_name(), self.port().map(Port::index))
    }

    /// Long running motion this request represents, if any
    pub fn operation(&self) -> Option<OperationKind> {
        match self {
            Command::Feed(_) => Some(OperationKind::Feeding),
            Command::Retract(_) => Some(OperationKind::Retracting),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u32,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: u32, command: &Command) -> Self {
        Self {
            id,
            method: command.method_name().to_string(),
            params: command.params(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let payload = serde_json::to_vec(self)?;
        encode_frame(&payload)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<u32>,
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: Option<String>,
    #[serde(default)]
    pub result: Option<Value>,
}

impl Response {
    pub fn is_ok(&self) -> bool {
        self.code == 0
    }

    pub fn message(&self) -> &str {
        self.msg.as_deref().unwrap_or("Unknown error")
    }

    pub fn status_report(&self) -> Option<StatusReport> {
        StatusReport::from_value(self.result.as_ref()?)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DryerReport {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub target_temp: u16,
    /// seconds
    #[serde(default)]
    pub duration: u32,
    /// seconds
    #[serde(default)]
    pub remain_time: u32,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlotReport {
    pub index: u8,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default, rename = "type")]
    pub material: String,
    #[serde(default)]
    pub color: Vec<u8>,
}

/// The `result` object of `get_status`
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    #[serde(default)]
    pub dryer: DryerReport,
    #[serde(default)]
    pub temp: f32,
    #[serde(default)]
    pub enable_rfid: u8,
    #[serde(default)]
    pub fan_speed: u32,
    #[serde(default)]
    pub feed_assist_count: u32,
    #[serde(default)]
    pub cont_assist_time: f64,
    pub slots: Vec<SlotReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err_code: Option<i64>,
}

impl StatusReport {
    /// Parse a status object; anything without `status` and `slots` is not one
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn stream_strategy() -> impl Strategy<Value = Vec<u8>> {
        let frame = prop::collection::vec(any::<u8>(), 0..64).prop_map(|payload| encode_frame(&payload).unwrap());
        let noise = prop::collection::vec(any::<u8>(), 0..8);
        prop::collection::vec((noise, frame, any::<bool>()), 1..6).prop_map(|parts| {
            let mut stream = Vec::new();
            for (noise, mut frame, corrupt) in parts {
                stream.extend_from_slice(&noise);
                if corrupt {
                    let at = frame.len() - 2;
                    frame[at] ^= 0xA5;
                }
                stream.extend_from_slice(&frame);
            }
            stream
        })
    }

    proptest! {
        #[test]
        fn chunk_boundaries_do_not_change_output(
            stream in stream_strategy(),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut whole = FrameDecoder::new();
            let expected = whole.feed(&stream);

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut chunked = FrameDecoder::new();
            let mut actual = Vec::new();
            for pair in points.windows(2) {
                actual.extend(chunked.feed(&stream[pair[0]..pair[1]]));
            }

            prop_assert_eq!(actual, expected);
            prop_assert_eq!(chunked.corrupt_frames(), whole.corrupt_frames());
        }

        #[test]
        fn header_like_noise_prefix_is_skipped(
            declared in 1024u16..=4096,
            payloads in prop::collection::vec(prop::collection::vec(0u8..0x80, 0..64), 1..6),
            cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..12),
        ) {
            let mut stream = vec![0xFF, 0xAA];
            stream.extend_from_slice(&declared.to_le_bytes());
            for payload in &payloads {
                stream.extend_from_slice(&encode_frame(payload).unwrap());
            }

            let mut points: Vec<usize> = cuts.iter().map(|i| i.index(stream.len() + 1)).collect();
            points.push(0);
            points.push(stream.len());
            points.sort_unstable();
            points.dedup();

            let mut decoder = FrameDecoder::new();
            let mut decoded = Vec::new();
            for pair in points.windows(2) {
                decoded.extend(decoder.feed(&stream[pair[0]..pair[1]]).into_iter().map(|p| p.payload));
            }

            prop_assert_eq!(decoded, payloads);
            prop_assert_eq!(decoder.buffered(), 0);
        }

        #[test]
        fn valid_frames_always_decode(payload in prop::collection::vec(any::<u8>(), 0..256)) {
            let frame = encode_frame(&payload).unwrap();
            let mut decoder = FrameDecoder::new();
            let packets = decoder.feed(&frame);
            prop_assert_eq!(packets.len(), 1);
            prop_assert_eq!(&packets[0].payload, &payload);
        }
    }
}
