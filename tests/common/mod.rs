//! In-memory ACE unit for integration tests
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ace_link::config::{AceConfig, ReconnectPolicy};
use ace_link::serial::protocol::{encode_frame, FrameDecoder};
use ace_link::serial::{BoxedLink, Connector, SerialError};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

pub const FAKE_PATH: &str = "/dev/fake-ace";

type SharedWriter = Arc<tokio::sync::Mutex<WriteHalf<DuplexStream>>>;

pub fn test_config() -> AceConfig {
    AceConfig {
        response_timeout_ms: 300,
        status_poll_interval_ms: 20,
        park_hit_count: 2,
        park_timeout_ms: 3_000,
        toolchange_retract_length: 10,
        retract_speed: 100,
        feed_speed: 100,
        reconnect: ReconnectPolicy {
            max_attempts: 3,
            base_delay_ms: 5,
            max_delay_ms: 20,
            window_secs: 60,
        },
        ..AceConfig::default()
    }
}

/// Firmware-side state of the fake unit
pub struct DeviceState {
    pub slots: [&'static str; 4],
    pub dryer_on: bool,
    pub target_temp: u64,
    pub duration_secs: u64,
    pub busy_ticks: u32,
    pub assist_port: Option<u64>,
    pub assist_ticks: u32,
    pub feed_assist_count: u32,
    pub err_code: Option<i64>,
    pub silent: HashSet<String>,
    pub delays: HashMap<String, Duration>,
    pub failures: HashMap<String, (i64, String)>,
    pub corrupt_next: bool,
    pub received: Vec<Value>,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            slots: ["ready", "empty", "ready", "ready"],
            dryer_on: false,
            target_temp: 0,
            duration_secs: 0,
            busy_ticks: 0,
            assist_port: None,
            assist_ticks: 0,
            feed_assist_count: 0,
            err_code: None,
            silent: HashSet::new(),
            delays: HashMap::new(),
            failures: HashMap::new(),
            corrupt_next: false,
            received: Vec::new(),
        }
    }
}

impl DeviceState {
    fn status_result(&mut self) -> Value {
        // the assist counter climbs while filament is still moving
        if self.assist_port.is_some() && self.assist_ticks > 0 {
            self.assist_ticks -= 1;
            self.feed_assist_count += 1;
        }
        let status = if self.busy_ticks > 0 {
            self.busy_ticks -= 1;
            "busy"
        } else {
            "ready"
        };
        let slots: Vec<Value> = self
            .slots
            .iter()
            .enumerate()
            .map(|(index, state)| {
                json!({"index": index, "status": state, "sku": "", "type": "PLA", "color": [10, 20, 30]})
            })
            .collect();
        let mut value = json!({
            "status": status,
            "dryer": {
                "status": if self.dryer_on { "drying" } else { "stop" },
                "target_temp": self.target_temp,
                "duration": self.duration_secs,
                "remain_time": if self.dryer_on { self.duration_secs } else { 0 },
            },
            "temp": 30,
            "enable_rfid": 1,
            "fan_speed": 7000,
            "feed_assist_count": self.feed_assist_count,
            "cont_assist_time": 0.0,
            "slots": slots,
        });
        if let Some(code) = self.err_code {
            value["err_code"] = json!(code);
        }
        value
    }

    fn reply(&mut self, request: &Value) -> Option<Value> {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = &request["params"];

        if self.silent.contains(&method) {
            return None;
        }
        if let Some((code, msg)) = self.failures.get(&method) {
            return Some(json!({"id": id, "code": code, "msg": msg}));
        }

        let index = params["index"].as_u64().unwrap_or(0);
        let result = match method.as_str() {
            "get_status" => self.status_result(),
            "get_info" => json!({"model": "Anycubic Color Engine Pro", "firmware": "V1.3.84"}),
            "drying" => {
                self.dryer_on = true;
                self.target_temp = params["temp"].as_u64().unwrap_or(0);
                self.duration_secs = params["duration"].as_u64().unwrap_or(0);
                json!({})
            }
            "drying_stop" => {
                self.dryer_on = false;
                json!({})
            }
            "start_feed_assist" => {
                self.assist_port = Some(index);
                self.assist_ticks = 3;
                json!({})
            }
            "stop_feed_assist" => {
                self.assist_port = None;
                json!({})
            }
            "feed_filament" => json!({"length": params["length"]}),
            "unwind_filament" => {
                self.busy_ticks = 2;
                json!({"length": params["length"]})
            }
            "get_filament_info" => {
                if self.slots[index as usize] == "ready" {
                    json!({
                        "sku": "AHPLBK-101",
                        "brand": "Anycubic",
                        "type": "PLA",
                        "color": [0, 0, 0],
                        "extruder_temp": {"min": 190, "max": 230}
                    })
                } else {
                    json!({})
                }
            }
            other => return Some(json!({"id": id, "code": 1, "msg": format!("unknown method {}", other)})),
        };
        Some(json!({"id": id, "code": 0, "msg": "success", "result": result}))
    }
}

struct LiveLink {
    task: JoinHandle<()>,
    writer: SharedWriter,
}

/// Fake unit plus the connector that hands out links to it
#[derive(Clone)]
pub struct FakeAce {
    pub state: Arc<Mutex<DeviceState>>,
    link: Arc<Mutex<Option<LiveLink>>>,
    opens: Arc<AtomicU32>,
    fail_opens: Arc<AtomicU32>,
    missing: Arc<AtomicBool>,
}

impl FakeAce {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(DeviceState::default())),
            link: Arc::new(Mutex::new(None)),
            opens: Arc::new(AtomicU32::new(0)),
            fail_opens: Arc::new(AtomicU32::new(0)),
            missing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn fail_next_opens(&self, count: u32) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    pub fn set_missing(&self, missing: bool) {
        self.missing.store(missing, Ordering::SeqCst);
    }

    /// Yank the cable: the host sees EOF on its side of the link
    pub fn drop_link(&self) {
        if let Some(live) = self.link.lock().take() {
            live.task.abort();
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut DeviceState) -> R) -> R {
        f(&mut self.state.lock())
    }

    pub fn received(&self, method: &str) -> Vec<Value> {
        self.state
            .lock()
            .received
            .iter()
            .filter(|r| r["method"] == method)
            .cloned()
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.received(method).len()
    }

    /// Methods in arrival order, status polls left out
    pub fn commands(&self) -> Vec<String> {
        self.state
            .lock()
            .received
            .iter()
            .filter_map(|r| r["method"].as_str())
            .filter(|m| *m != "get_status")
            .map(str::to_string)
            .collect()
    }

    /// Unsolicited status frame without an id
    pub async fn push_status(&self) {
        let writer = self.link.lock().as_ref().map(|live| live.writer.clone());
        let Some(writer) = writer else {
            return;
        };
        let result = self.state.lock().status_result();
        let frame = frame(&json!({"code": 0, "msg": "success", "result": result}));
        let _ = writer.lock().await.write_all(&frame).await;
    }
}

fn frame(value: &Value) -> Vec<u8> {
    encode_frame(&serde_json::to_vec(value).expect("serialize")).expect("frame")
}

#[async_trait]
impl Connector for FakeAce {
    async fn resolve(&self) -> Result<String, SerialError> {
        if self.missing.load(Ordering::SeqCst) {
            return Err(SerialError::NoDevice);
        }
        Ok(FAKE_PATH.to_string())
    }

    async fn open(&self, path: &str, _baud: u32) -> Result<BoxedLink, SerialError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let pending_failures = self.fail_opens.load(Ordering::SeqCst);
        if pending_failures > 0 {
            self.fail_opens.store(pending_failures - 1, Ordering::SeqCst);
            return Err(SerialError::ConnectionFailed(format!("{}: device busy", path)));
        }

        let (host, device) = tokio::io::duplex(16 * 1024);
        let (reader, writer) = tokio::io::split(device);
        let writer: SharedWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let task = tokio::spawn(serve(reader, writer.clone(), self.state.clone()));
        if let Some(old) = self.link.lock().replace(LiveLink { task, writer }) {
            old.task.abort();
        }
        Ok(Box::new(host))
    }
}

async fn serve(mut reader: ReadHalf<DuplexStream>, writer: SharedWriter, state: Arc<Mutex<DeviceState>>) {
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 1024];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        for packet in decoder.feed(&buf[..n]) {
            let Ok(request) = serde_json::from_slice::<Value>(&packet.payload) else {
                continue;
            };

            let (reply, delay, corrupt) = {
                let mut s = state.lock();
                s.received.push(request.clone());
                let reply = s.reply(&request);
                let method = request["method"].as_str().unwrap_or_default();
                let delay = s.delays.get(method).copied();
                let corrupt = std::mem::take(&mut s.corrupt_next) && reply.is_some();
                (reply, delay, corrupt)
            };
            let Some(reply) = reply else {
                continue;
            };

            let mut bytes = Vec::new();
            if corrupt {
                let mut bad = frame(&json!({"id": 0, "code": 0, "msg": "garbled"}));
                let crc_at = bad.len() - 2;
                bad[crc_at] ^= 0xFF;
                bytes.extend_from_slice(b"\x00\x13");
                bytes.extend_from_slice(&bad);
            }
            bytes.extend_from_slice(&frame(&reply));

            match delay {
                Some(delay) => {
                    let writer = writer.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let _ = writer.lock().await.write_all(&bytes).await;
                    });
                }
                None => {
                    // split the reply so the host sees partial frames
                    let (head, tail) = bytes.split_at(bytes.len() / 2);
                    let mut w = writer.lock().await;
                    if w.write_all(head).await.is_err() || w.write_all(tail).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Poll `check` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
