use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};

use super::models::{ConnectionState, DeviceStatus, OperationKind};
use super::{DeviceError, Result};
use crate::config::{AceConfig, ReconnectPolicy};
use crate::serial::protocol::{Command, Request, Response};
use crate::serial::unified::reader::reader_task;
use crate::serial::unified::types::{KeyGates, LinkEvent, LinkShared, MetricsSnapshot, OutboundFrame, PendingRequest};
use crate::serial::unified::writer::{writer_task, WriterContext};
use crate::serial::unified::RequestIds;
use crate::serial::{BoxedLink, Connector, SerialError};

const OUTBOUND_CAPACITY: usize = 32;

/// Delay before retry `attempt` (1-based): base * 2^(attempt-1), capped
pub fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let shift = attempt.saturating_sub(1).min(30);
    let delay = policy.base_delay_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(delay.min(policy.max_delay_ms))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectMode {
    /// Operator asked for it; runs even from `Failed`
    Explicit,
    /// Triggered by an I/O failure; never leaves `Failed`
    Automatic,
}

struct Session {
    generation: u64,
    outbound: mpsc::Sender<OutboundFrame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    port: String,
    connected_at: DateTime<Utc>,
}

impl Session {
    fn abort(self) {
        self.reader.abort();
        self.writer.abort();
    }
}

/// Recent session losses, used to detect a flapping link
#[derive(Default)]
struct LossWindow {
    losses: VecDeque<std::time::Instant>,
}

impl LossWindow {
    fn record(&mut self, window: Duration) -> usize {
        let now = std::time::Instant::now();
        self.losses.push_back(now);
        while let Some(first) = self.losses.front() {
            if now.duration_since(*first) > window {
                self.losses.pop_front();
            } else {
                break;
            }
        }
        self.losses.len()
    }

    fn reset(&mut self) {
        self.losses.clear();
    }
}

struct LinkInner {
    connector: Arc<dyn Connector>,
    config: AceConfig,
    shared: Arc<LinkShared>,
    ids: Arc<RequestIds>,
    gates: KeyGates,
    state: watch::Sender<ConnectionState>,
    session: Mutex<Option<Session>>,
    generation: AtomicU64,
    connect_lock: tokio::sync::Mutex<()>,
    /// Completed connect runs, lets lock waiters see that one finished
    connect_runs: AtomicU64,
    losses: Mutex<LossWindow>,
    last_failure: Mutex<Option<(u32, String)>>,
    reconnecting: AtomicBool,
    closing: AtomicBool,
    events: mpsc::UnboundedSender<LinkEvent>,
}

impl Drop for LinkInner {
    fn drop(&mut self) {
        if let Some(session) = self.session.get_mut().take() {
            session.abort();
        }
    }
}

/// Owns the serial connection and the reader/writer tasks bound to it.
///
/// Cloning is cheap; all clones drive the same link. Must be created inside
/// a tokio runtime.
#[derive(Clone)]
pub struct LinkManager {
    inner: Arc<LinkInner>,
}

impl LinkManager {
    pub fn new(config: AceConfig, connector: Arc<dyn Connector>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let inner = Arc::new(LinkInner {
            connector,
            config,
            shared: Arc::new(LinkShared::new()),
            ids: Arc::new(RequestIds::default()),
            gates: KeyGates::default(),
            state,
            session: Mutex::new(None),
            generation: AtomicU64::new(0),
            connect_lock: tokio::sync::Mutex::new(()),
            connect_runs: AtomicU64::new(0),
            losses: Mutex::new(LossWindow::default()),
            last_failure: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            events: events_tx,
        });
        spawn_supervisor(Arc::downgrade(&inner), events_rx);
        Self { inner }
    }

    pub fn config(&self) -> &AceConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    pub fn port_name(&self) -> Option<String> {
        self.inner.session.lock().as_ref().map(|s| s.port.clone())
    }

    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.inner.session.lock().as_ref().map(|s| s.connected_at)
    }

    pub fn status(&self) -> DeviceStatus {
        self.inner.shared.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.inner.shared.status.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.shared.metrics.borrow().clone()
    }

    pub fn subscribe_metrics(&self) -> watch::Receiver<MetricsSnapshot> {
        self.inner.shared.metrics.subscribe()
    }

    /// Mark a long running operation for the lifetime of the guard
    pub fn track_operation(&self, kind: OperationKind) -> OperationGuard {
        OperationGuard::new(self.inner.shared.clone(), kind)
    }

    pub(crate) fn update_status(&self, f: impl FnOnce(&mut DeviceStatus)) {
        self.inner.shared.status.send_modify(f);
    }

    pub async fn connect(&self) -> Result<()> {
        self.establish(ConnectMode::Explicit).await
    }

    /// Tear down whatever is open and connect again with a fresh attempt
    /// budget
    pub async fn reconnect(&self) -> Result<()> {
        self.teardown(None, "reconnect requested");
        self.establish(ConnectMode::Explicit).await
    }

    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let _flight = self.inner.connect_lock.lock().await;
        if self.teardown(None, "disconnect requested") {
            log::info!("Disconnected from ACE");
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Single-flight connect. A caller that waited while another connect
    /// run finished gets that run's outcome instead of starting its own.
    pub async fn establish(&self, mode: ConnectMode) -> Result<()> {
        if mode == ConnectMode::Explicit {
            self.inner.closing.store(false, Ordering::SeqCst);
        }
        let observed = self.inner.connect_runs.load(Ordering::SeqCst);
        let _flight = self.inner.connect_lock.lock().await;

        if self.inner.connect_runs.load(Ordering::SeqCst) != observed {
            return self.settled_outcome();
        }
        if self.is_connected() {
            return Ok(());
        }
        if mode == ConnectMode::Automatic && self.state() == ConnectionState::Failed {
            return Err(self.failed_error());
        }

        let outcome = self.run_attempts(mode).await;
        self.inner.connect_runs.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    /// Outcome of the connect run that finished last, read from the state
    /// it left behind
    fn settled_outcome(&self) -> Result<()> {
        match self.state() {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Failed => Err(self.failed_error()),
            ConnectionState::Connecting | ConnectionState::Disconnected => Err(DeviceError::ConnectionLost),
        }
    }

    async fn run_attempts(&self, mode: ConnectMode) -> Result<()> {
        if mode == ConnectMode::Explicit {
            self.inner.losses.lock().reset();
        }

        self.set_state(ConnectionState::Connecting);
        let policy = self.inner.config.reconnect.clone();
        let mut last_error = String::new();

        for attempt in 1..=policy.max_attempts {
            if self.inner.closing.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnected);
                return Err(DeviceError::ConnectionLost);
            }

            match self.open_session().await {
                Ok(port) => {
                    self.inner.last_failure.lock().take();
                    self.set_state(ConnectionState::Connected);
                    log::info!("Connected to ACE at {} (attempt {})", port, attempt);
                    self.spawn_info_probe();
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Connection attempt {} of {} failed: {}", attempt, policy.max_attempts, e);
                    last_error = e.to_string();
                    if attempt < policy.max_attempts {
                        let delay = backoff_delay(&policy, attempt);
                        log::debug!("Retrying in {:?}", delay);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        log::error!(
            "Giving up on ACE after {} attempts: {}. Replug or power-cycle the unit and reconnect.",
            policy.max_attempts,
            last_error
        );
        *self.inner.last_failure.lock() = Some((policy.max_attempts, last_error));
        self.set_state(ConnectionState::Failed);
        Err(self.failed_error())
    }

    /// Resolve the device path without opening it
    pub async fn locate(&self) -> Result<String> {
        self.inner.connector.resolve().await.map_err(|e| match e {
            SerialError::NoDevice => DeviceError::DeviceNotFound,
            other => DeviceError::SerialError(other),
        })
    }

    async fn open_session(&self) -> Result<String> {
        let path = self.locate().await?;
        log::info!("Opening {} at {} baud", path, self.inner.config.baud);
        let link = self.inner.connector.open(&path, self.inner.config.baud).await?;
        self.start_session(path.clone(), link);
        Ok(path)
    }

    fn start_session(&self, port: String, link: BoxedLink) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (read_half, write_half) = tokio::io::split(link);
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);

        self.inner.shared.status.send_modify(DeviceStatus::begin_session);

        let reader = tokio::spawn(reader_task(
            read_half,
            self.inner.shared.clone(),
            self.inner.events.clone(),
            generation,
        ));
        let writer = tokio::spawn(writer_task(
            write_half,
            outbound_rx,
            WriterContext {
                shared: self.inner.shared.clone(),
                ids: self.inner.ids.clone(),
                events: self.inner.events.clone(),
                generation,
                poll_interval: self.inner.config.status_poll_interval(),
            },
        ));

        *self.inner.session.lock() = Some(Session {
            generation,
            outbound,
            reader,
            writer,
            port,
            connected_at: Utc::now(),
        });
    }

    fn spawn_info_probe(&self) {
        let link = self.clone();
        tokio::spawn(async move {
            match link.request(Command::GetInfo).await {
                Ok(response) if response.is_ok() => {
                    let info = link.status().info.unwrap_or_default();
                    log::info!("Connected {} {}", info.model, info.firmware);
                }
                Ok(response) => log::warn!("get_info failed: {}", response.message()),
                Err(e) => log::warn!("get_info failed: {}", e),
            }
        });
    }

    /// Close the session (only if it is still `generation`, when given) and
    /// fail everything pending on it. Returns false when there was nothing
    /// to tear down.
    fn teardown(&self, generation: Option<u64>, reason: &str) -> bool {
        let session = {
            let mut slot = self.inner.session.lock();
            let stale = match (slot.as_ref(), generation) {
                (None, _) => true,
                (Some(live), Some(expected)) => live.generation != expected,
                (Some(_), None) => false,
            };
            if stale {
                return false;
            }
            slot.take()
        };
        let Some(session) = session else {
            return false;
        };

        log::info!("Closing link {} (generation {}): {}", session.port, session.generation, reason);
        session.abort();

        let orphaned = self.inner.shared.pending.lock().drain();
        if !orphaned.is_empty() {
            log::warn!("Failing {} in-flight request(s) after link loss", orphaned.len());
        }
        for request in orphaned {
            let _ = request.responder.send(Err(DeviceError::ConnectionLost));
        }

        self.set_state(ConnectionState::Disconnected);
        true
    }

    async fn handle_event(&self, event: LinkEvent) {
        match event {
            LinkEvent::IoFailure {
                generation,
                origin,
                reason,
            } => {
                self.inner.reconnecting.store(true, Ordering::SeqCst);
                if self.teardown(Some(generation), &format!("{} failed: {}", origin, reason)) {
                    self.inner.shared.update_metrics(|m| {
                        m.reconnects += 1;
                        m.last_error = Some(reason.clone());
                    });
                    self.recover().await;
                }
                self.inner.reconnecting.store(false, Ordering::SeqCst);
            }
        }
    }

    async fn recover(&self) {
        if self.inner.closing.load(Ordering::SeqCst) {
            return;
        }

        let policy = &self.inner.config.reconnect;
        let losses = self.inner.losses.lock().record(policy.window());
        if losses > policy.max_attempts as usize {
            let reason = format!("link dropped {} times within {:?}", losses, policy.window());
            log::error!("ACE link is flapping ({}); automatic reconnect stopped", reason);
            *self.inner.last_failure.lock() = Some((losses as u32, reason));
            self.set_state(ConnectionState::Failed);
            return;
        }

        if let Err(e) = self.establish(ConnectMode::Automatic).await {
            log::error!("Automatic reconnect failed: {}", e);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            log::debug!("Link state {:?} -> {:?}", previous, state);
        }
    }

    fn failed_error(&self) -> DeviceError {
        match self.inner.last_failure.lock().clone() {
            Some((attempts, reason)) => DeviceError::ConnectFailed { attempts, reason },
            None => DeviceError::ConnectFailed {
                attempts: 0,
                reason: "link is in the failed state".to_string(),
            },
        }
    }

    /// Wait (bounded) for a usable link. Fails fast when nothing is trying
    /// to bring one up.
    async fn wait_for_link(&self, deadline: Instant) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            match current {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Failed => return Err(self.failed_error()),
                ConnectionState::Connecting => {}
                ConnectionState::Disconnected if self.inner.reconnecting.load(Ordering::SeqCst) => {}
                ConnectionState::Disconnected => return Err(DeviceError::ConnectionLost),
            }
            match timeout_at(deadline, state.changed()).await {
                Ok(Ok(())) => {}
                _ => return Err(DeviceError::ConnectionLost),
            }
        }
    }

    fn try_register(&self, request: PendingRequest) -> std::result::Result<mpsc::Sender<OutboundFrame>, PendingRequest> {
        let session = self.inner.session.lock();
        match session.as_ref() {
            Some(live) => {
                self.inner.shared.pending.lock().insert(request);
                Ok(live.outbound.clone())
            }
            None => Err(request),
        }
    }

    /// Send `command` and wait for its correlated reply. A reply with a
    /// non-zero code is still returned as `Ok`; callers decide.
    pub async fn request(&self, command: Command) -> Result<Response> {
        let timeout = self.inner.config.response_timeout();
        let deadline = Instant::now() + timeout;
        let key = command.key();
        let method = command.method_name().to_string();

        let _gate = match timeout_at(deadline, self.inner.gates.acquire(&key)).await {
            Ok(gate) => gate,
            Err(_) => return Err(self.timed_out(&method, timeout)),
        };
        let _operation = command.operation().map(|kind| self.track_operation(kind));

        let (id, mut rx, sender, bytes) = loop {
            self.wait_for_link(deadline).await?;

            let id = self.inner.ids.next();
            let bytes = Request::new(id, &command).encode()?;
            let (tx, rx) = oneshot::channel();
            let pending = PendingRequest {
                id,
                key: key.clone(),
                command: command.clone(),
                started: std::time::Instant::now(),
                responder: tx,
            };
            match self.try_register(pending) {
                Ok(sender) => break (id, rx, sender, bytes),
                // the session went away between the state check and here
                Err(_) => tokio::task::yield_now().await,
            }
        };

        log::debug!("-> {} id={} ({})", method, id, key);
        match timeout_at(deadline, sender.send(OutboundFrame { id, bytes })).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.inner.shared.pending.lock().take(id);
                return Err(DeviceError::ConnectionLost);
            }
            Err(_) => {
                self.inner.shared.pending.lock().take(id);
                return Err(self.timed_out(&method, timeout));
            }
        }

        match timeout_at(deadline, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeviceError::ConnectionLost),
            Err(_) => {
                if self.inner.shared.pending.lock().take(id).is_some() {
                    log::warn!("{} id={} timed out after {:?}", method, id, timeout);
                    Err(self.timed_out(&method, timeout))
                } else {
                    // resolved between the deadline and the lock
                    rx.try_recv().unwrap_or_else(|_| Err(DeviceError::ConnectionLost))
                }
            }
        }
    }

    fn timed_out(&self, method: &str, timeout: Duration) -> DeviceError {
        self.inner.shared.update_metrics(|m| {
            m.command_timeouts += 1;
            m.last_error = Some(format!("{} timed out", method));
        });
        DeviceError::Timeout {
            method: method.to_string(),
            timeout,
        }
    }
}

/// RAII marker for an in-flight operation in `DeviceStatus`
pub struct OperationGuard {
    shared: Arc<LinkShared>,
    kind: OperationKind,
}

impl OperationGuard {
    fn new(shared: Arc<LinkShared>, kind: OperationKind) -> Self {
        shared.status.send_modify(|s| s.begin_operation(kind));
        Self { shared, kind }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let kind = self.kind;
        self.shared.status.send_modify(|s| s.finish_operation(kind));
    }
}

fn spawn_supervisor(link: Weak<LinkInner>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let Some(inner) = link.upgrade() else {
                break;
            };
            LinkManager { inner }.handle_event(event).await;
        }
        log::debug!("Link supervisor stopped");
    });
}
