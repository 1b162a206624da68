//! Device session engine.
//!
//! One session pairs one device descriptor with one socket and one background
//! task. The task owns everything mutable: the socket, the transport state,
//! the reassembly buffers, and the unsupported-query set. User-facing calls
//! enqueue work over a bounded channel and never touch the socket.
//!
//! Lifecycle:
//!
//! ```text
//! Idle --open()--> Connecting --tcp established--> Authenticating
//! Authenticating --handshake ok (v3) or skip (v2)--> Ready
//! Ready --refresh timer / user command--> Ready
//! Ready --socket error / heartbeat timeout--> Reconnecting
//! Reconnecting --backoff elapsed--> Connecting
//! any --close()--> Closed
//! ```
//!
//! A failed handshake is terminal: the task exits and the caller must reopen.
//! Every other failure tears the socket down and retries after a backoff.

use std::collections::HashSet;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{Credentials, SessionConfig};
use crate::core::codec::{Frame, FrameType, TransportState};
use crate::core::packet::{self, PacketKind};
use crate::error::{constants, LanError, Result};
use crate::protocol::appliance::{ApplianceAdapter, StatusMap, StatusValue, KEY_AVAILABLE};
use crate::protocol::handshake;
use crate::protocol::message::{ApplianceMessage, MessageType, MAX_BODY_LEN};
use crate::service::dispatcher::{ObserverId, StatusDispatcher};
use crate::utils::timeout::{
    CONNECT_TIMEOUT, HEARTBEAT_IDLE_TICKS, RECONNECT_BACKOFF, RESPONSE_TIMEOUT, TICK_INTERVAL,
};

/// Capacity of the user-command queue.
const COMMAND_QUEUE_CAPACITY: usize = 32;

enum Command {
    Send {
        message_type: u8,
        body: Vec<u8>,
        done: oneshot::Sender<Result<()>>,
    },
    Refresh {
        done: Option<oneshot::Sender<Result<()>>>,
    },
    SetIp {
        ip: IpAddr,
    },
}

enum Event {
    Cancelled,
    Command(Option<Command>),
    Read(io::Result<usize>),
    Tick,
}

/// State shared between the session handle and its background task.
struct Shared {
    ready: AtomicBool,
    available: AtomicBool,
    device_protocol: AtomicU8,
    last_status: StdMutex<StatusMap>,
}

struct Running {
    cmd_tx: mpsc::Sender<Command>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Handle to one appliance session.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct DeviceSession {
    config: SessionConfig,
    credentials: Option<Credentials>,
    adapter: Arc<dyn ApplianceAdapter>,
    dispatcher: Arc<StatusDispatcher>,
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl DeviceSession {
    /// Create a session for `config` driving `adapter`.
    ///
    /// # Errors
    /// `LanError::Config` when the config fails validation or its credentials
    /// do not decode.
    pub fn new(config: SessionConfig, adapter: Arc<dyn ApplianceAdapter>) -> Result<Self> {
        config.validate_strict()?;
        let credentials = config.credentials()?;
        let device_protocol = config.protocol;

        Ok(Self {
            config,
            credentials,
            adapter,
            dispatcher: Arc::new(StatusDispatcher::new()),
            shared: Arc::new(Shared {
                ready: AtomicBool::new(false),
                available: AtomicBool::new(false),
                device_protocol: AtomicU8::new(device_protocol),
                last_status: StdMutex::new(StatusMap::new()),
            }),
            running: Mutex::new(None),
        })
    }

    /// Display name from the config.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Whether the device is currently reachable.
    pub fn available(&self) -> bool {
        self.shared.available.load(Ordering::Acquire)
    }

    /// Device protocol version, as learned from the capability query.
    pub fn device_protocol(&self) -> u8 {
        self.shared.device_protocol.load(Ordering::Acquire)
    }

    /// Snapshot of the most recent status values.
    pub fn last_status(&self) -> StatusMap {
        self.shared
            .last_status
            .lock()
            .map(|status| status.clone())
            .unwrap_or_default()
    }

    /// Start the background task. Idempotent; a session whose task has
    /// already exited (terminal auth failure) is restarted.
    pub async fn open(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Ok(());
            }
        }

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let cancel = CancellationToken::new();
        let ip = self
            .config
            .ip
            .parse::<IpAddr>()
            .map_err(|e| LanError::Config(e.to_string()))?;

        let worker = SessionWorker {
            config: self.config.clone(),
            credentials: self.credentials.clone(),
            adapter: self.adapter.clone(),
            dispatcher: self.dispatcher.clone(),
            shared: self.shared.clone(),
            cmd_rx,
            cancel: cancel.clone(),
            state: TransportState::new(),
            ip,
            unsupported: HashSet::new(),
            pending_refresh: None,
            v2_buffer: Vec::new(),
        };
        let task = tokio::spawn(worker.run());

        *running = Some(Running {
            cmd_tx,
            cancel,
            task,
        });
        Ok(())
    }

    /// Stop the background task, release the socket, and notify observers
    /// that the device is unavailable. Idempotent.
    pub async fn close(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            running.cancel.cancel();
            if let Err(e) = running.task.await {
                warn!(device = %self.config.name, error = %e, "session task panicked");
            }
        }
    }

    /// Send one appliance command.
    ///
    /// # Errors
    /// `LanError::Framing` when the body does not fit a message;
    /// `LanError::NotConnected` unless the session is in its Ready state.
    /// Commands enqueued just before `close()` may never be transmitted.
    pub async fn send_command(&self, message_type: u8, body: Vec<u8>) -> Result<()> {
        if body.len() > MAX_BODY_LEN {
            return Err(LanError::Framing(constants::ERR_OVERSIZED_MESSAGE));
        }
        if !self.shared.ready.load(Ordering::Acquire) {
            return Err(LanError::NotConnected);
        }
        let tx = self.command_sender().await?;
        let (done_tx, done_rx) = oneshot::channel();
        tx.send(Command::Send {
            message_type,
            body,
            done: done_tx,
        })
        .await
        .map_err(|_| LanError::Closed)?;
        done_rx.await.map_err(|_| LanError::Closed)?
    }

    /// Trigger a status refresh.
    ///
    /// With `wait`, blocks until any response parses or the response window
    /// elapses; queries that never answer are marked unsupported and skipped
    /// on later refreshes.
    ///
    /// # Errors
    /// `LanError::ResponseTimeout` when `wait` expires; `LanError::RefreshFailed`
    /// when every known query is already marked unsupported.
    pub async fn refresh_status(&self, wait: bool) -> Result<()> {
        let tx = self.command_sender().await?;
        if wait {
            let (done_tx, done_rx) = oneshot::channel();
            tx.send(Command::Refresh {
                done: Some(done_tx),
            })
            .await
            .map_err(|_| LanError::Closed)?;
            match tokio::time::timeout(RESPONSE_TIMEOUT, done_rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(LanError::Closed),
                Err(_) => Err(LanError::ResponseTimeout),
            }
        } else {
            tx.send(Command::Refresh { done: None })
                .await
                .map_err(|_| LanError::Closed)?;
            Ok(())
        }
    }

    /// Point the session at a new address. A changed address tears the
    /// connection down; the next connect uses the new one.
    pub async fn set_ip(&self, ip: IpAddr) -> Result<()> {
        let tx = self.command_sender().await?;
        tx.send(Command::SetIp { ip })
            .await
            .map_err(|_| LanError::Closed)
    }

    /// Register an observer for status updates and availability changes.
    /// Callbacks run synchronously on the session task and must not block.
    pub fn register_observer<F>(&self, observer: F) -> Result<ObserverId>
    where
        F: Fn(&StatusMap) + Send + Sync + 'static,
    {
        self.dispatcher.register(observer)
    }

    /// Remove a previously registered observer.
    pub fn unregister_observer(&self, id: ObserverId) -> Result<bool> {
        self.dispatcher.unregister(id)
    }

    async fn command_sender(&self) -> Result<mpsc::Sender<Command>> {
        self.running
            .lock()
            .await
            .as_ref()
            .map(|running| running.cmd_tx.clone())
            .ok_or(LanError::NotConnected)
    }
}

struct PendingRefresh {
    done: Option<oneshot::Sender<Result<()>>>,
    expires: Instant,
    query_ids: Vec<u16>,
}

struct SessionWorker {
    config: SessionConfig,
    credentials: Option<Credentials>,
    adapter: Arc<dyn ApplianceAdapter>,
    dispatcher: Arc<StatusDispatcher>,
    shared: Arc<Shared>,
    cmd_rx: mpsc::Receiver<Command>,
    cancel: CancellationToken,
    state: TransportState,
    ip: IpAddr,
    unsupported: HashSet<u16>,
    pending_refresh: Option<PendingRefresh>,
    v2_buffer: Vec<u8>,
}

impl SessionWorker {
    #[instrument(skip_all, fields(device = %self.config.name))]
    async fn run(mut self) {
        info!("session started");
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.connect_and_serve().await {
                Ok(()) => break,
                Err(LanError::Auth(reason)) => {
                    error!(%reason, "authentication failed, closing session");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "connection lost, reconnecting");
                }
            }

            self.teardown(LanError::ConnectionClosed);
            if !self.backoff().await {
                break;
            }
        }

        self.teardown(LanError::Closed);
        info!("session closed");
    }

    async fn connect_and_serve(&mut self) -> Result<()> {
        let addr = SocketAddr::new(self.ip, self.config.port);
        debug!(%addr, "connecting");

        let connect = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(addr));
        let mut stream = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            result = connect => match result {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => return Err(LanError::Connect(e.to_string())),
                Err(_) => return Err(LanError::Connect("connect timed out".to_string())),
            },
        };
        let _ = stream.set_nodelay(true);

        if self.config.protocol == 3 {
            let credentials = self
                .credentials
                .as_ref()
                .ok_or_else(|| LanError::Auth(constants::ERR_MISSING_CREDENTIALS.to_string()))?
                .clone();
            handshake::authenticate(
                &mut stream,
                &mut self.state,
                &credentials.token,
                &credentials.key,
            )
            .await?;
        }

        info!("device connected");
        let (rd, wr) = stream.into_split();
        self.serve(rd, wr).await
    }

    async fn serve(&mut self, mut rd: OwnedReadHalf, mut wr: OwnedWriteHalf) -> Result<()> {
        self.shared.ready.store(true, Ordering::Release);
        self.set_available(true);

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut idle_ticks: u32 = 0;
        let mut since_refresh: u64 = 0;
        let mut since_heartbeat: u64 = 0;
        let mut buf = vec![0u8; 4096];

        // Prime observers with fresh state instead of waiting a full cycle.
        match self.send_refresh(&mut wr, None).await {
            Ok(()) | Err(LanError::RefreshFailed) => {}
            Err(e) => {
                self.shared.ready.store(false, Ordering::Release);
                return Err(e);
            }
        }

        let result = loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => Event::Cancelled,
                cmd = self.cmd_rx.recv() => Event::Command(cmd),
                read = rd.read(&mut buf) => Event::Read(read),
                _ = tick.tick() => Event::Tick,
            };

            match event {
                Event::Cancelled => break Ok(()),
                Event::Command(None) => break Ok(()),
                Event::Command(Some(cmd)) => {
                    if let Err(e) = self.handle_command(cmd, &mut wr).await {
                        break Err(e);
                    }
                }
                Event::Read(Ok(0)) => break Err(LanError::ConnectionClosed),
                Event::Read(Ok(n)) => match self.handle_inbound_chunk(&buf[..n]) {
                    Ok(true) => idle_ticks = 0,
                    Ok(false) => {}
                    Err(e) => break Err(e),
                },
                Event::Read(Err(e)) => break Err(LanError::Io(e)),
                Event::Tick => {
                    idle_ticks += 1;
                    since_refresh += 1;
                    since_heartbeat += 1;

                    if idle_ticks >= HEARTBEAT_IDLE_TICKS {
                        break Err(LanError::HeartbeatTimeout);
                    }
                    self.expire_pending_refresh();

                    if since_heartbeat >= self.config.heartbeat_interval.as_secs() {
                        since_heartbeat = 0;
                        if let Err(e) = self.send_heartbeat(&mut wr).await {
                            break Err(e);
                        }
                    }
                    if since_refresh >= self.config.refresh_interval.as_secs() {
                        since_refresh = 0;
                        match self.send_refresh(&mut wr, None).await {
                            Ok(()) | Err(LanError::RefreshFailed) => {}
                            Err(e) => break Err(e),
                        }
                    }
                }
            }
        };

        self.shared.ready.store(false, Ordering::Release);
        result
    }

    async fn handle_command(&mut self, cmd: Command, wr: &mut OwnedWriteHalf) -> Result<()> {
        match cmd {
            Command::Send {
                message_type,
                body,
                done,
            } => {
                let message = ApplianceMessage::new(
                    self.adapter.appliance_type(),
                    self.shared.device_protocol.load(Ordering::Acquire),
                    message_type,
                    body,
                );
                match self.write_message(wr, &message).await {
                    Ok(()) => {
                        let _ = done.send(Ok(()));
                        Ok(())
                    }
                    Err(e) => {
                        let _ = done.send(Err(mirror(&e)));
                        Err(e)
                    }
                }
            }
            Command::Refresh { done } => match self.send_refresh(wr, done).await {
                Ok(()) | Err(LanError::RefreshFailed) => Ok(()),
                Err(e) => Err(e),
            },
            Command::SetIp { ip } => {
                if ip != self.ip {
                    info!(%ip, "device address changed, reconnecting");
                    self.ip = ip;
                    return Err(LanError::ConnectionClosed);
                }
                Ok(())
            }
        }
    }

    /// Send every supported status query and arm the response window.
    async fn send_refresh(
        &mut self,
        wr: &mut OwnedWriteHalf,
        done: Option<oneshot::Sender<Result<()>>>,
    ) -> Result<()> {
        let mut queries = vec![ApplianceMessage::query_appliance(
            self.adapter.appliance_type(),
            self.shared.device_protocol.load(Ordering::Acquire),
        )];
        queries.extend(self.adapter.build_queries());
        queries.retain(|q| !self.unsupported.contains(&q.query_id()));

        if queries.is_empty() {
            debug!("every refresh query is marked unsupported");
            if let Some(done) = done {
                let _ = done.send(Err(LanError::RefreshFailed));
            }
            return Err(LanError::RefreshFailed);
        }

        let query_ids: Vec<u16> = queries.iter().map(ApplianceMessage::query_id).collect();
        for query in &queries {
            if let Err(e) = self.write_message(wr, query).await {
                if let Some(done) = done {
                    let _ = done.send(Err(mirror(&e)));
                }
                return Err(e);
            }
        }

        self.fail_pending(LanError::ResponseTimeout);
        self.pending_refresh = Some(PendingRefresh {
            done,
            expires: Instant::now() + RESPONSE_TIMEOUT,
            query_ids,
        });
        Ok(())
    }

    async fn send_heartbeat(&mut self, wr: &mut OwnedWriteHalf) -> Result<()> {
        let wire = self.wrap(&[0x00], PacketKind::Plain)?;
        wr.write_all(&wire).await?;
        debug!("heartbeat sent");
        Ok(())
    }

    async fn write_message(
        &mut self,
        wr: &mut OwnedWriteHalf,
        message: &ApplianceMessage,
    ) -> Result<()> {
        let wire = self.wrap(&message.to_bytes()?, PacketKind::Encrypted)?;
        wr.write_all(&wire).await?;
        Ok(())
    }

    /// Envelope a command and, for protocol v3, frame it for the transport.
    fn wrap(&mut self, command: &[u8], kind: PacketKind) -> Result<Vec<u8>> {
        let envelope = packet::build(self.config.device_id, command, kind);
        if self.config.protocol == 3 {
            self.state.encode_frame(&envelope, FrameType::EncryptedRequest)
        } else {
            Ok(envelope)
        }
    }

    /// Feed received bytes through the codec; returns whether anything
    /// parsed. Any error drops the socket.
    fn handle_inbound_chunk(&mut self, bytes: &[u8]) -> Result<bool> {
        let mut parsed = false;
        if self.config.protocol == 3 {
            self.state.feed(bytes);
            for frame in self.state.decode_stream()? {
                match frame {
                    Frame::Error => return Err(LanError::DeviceError),
                    Frame::Message(body) => {
                        if body == b"ERROR" {
                            return Err(LanError::DeviceError);
                        }
                        self.handle_envelope(&body)?;
                        parsed = true;
                    }
                }
            }
        } else {
            self.v2_buffer.extend_from_slice(bytes);
            for envelope in packet::split_v2_stream(&mut self.v2_buffer)? {
                self.handle_envelope(&envelope)?;
                parsed = true;
            }
        }
        Ok(parsed)
    }

    fn handle_envelope(&mut self, raw: &[u8]) -> Result<()> {
        let inner = packet::parse(raw)?;
        let message = ApplianceMessage::parse(&inner.body)?;
        if message.kind() == Some(MessageType::QueryAppliance) {
            self.shared
                .device_protocol
                .store(message.protocol_version, Ordering::Release);
            debug!(
                version = message.protocol_version,
                "device protocol version learned"
            );
        } else {
            let status = self.adapter.process_message(&inner.body);
            if !status.is_empty() {
                self.publish(status);
            }
        }

        self.resolve_pending_refresh();
        Ok(())
    }

    /// Merge into the snapshot and fan out, always stamped available.
    fn publish(&self, mut status: StatusMap) {
        status.insert(KEY_AVAILABLE.to_string(), StatusValue::Bool(true));
        if let Ok(mut last) = self.shared.last_status.lock() {
            last.extend(status.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.dispatcher.broadcast(&status);
    }

    fn set_available(&self, available: bool) {
        let previous = self.shared.available.swap(available, Ordering::AcqRel);
        if previous != available {
            let mut status = StatusMap::new();
            status.insert(KEY_AVAILABLE.to_string(), StatusValue::Bool(available));
            if let Ok(mut last) = self.shared.last_status.lock() {
                last.insert(KEY_AVAILABLE.to_string(), StatusValue::Bool(available));
            }
            self.dispatcher.broadcast(&status);
        }
    }

    fn resolve_pending_refresh(&mut self) {
        if let Some(pending) = self.pending_refresh.take() {
            if let Some(done) = pending.done {
                let _ = done.send(Ok(()));
            }
        }
    }

    /// Give up on an armed response window, marking its queries unsupported.
    fn expire_pending_refresh(&mut self) {
        let expired = self
            .pending_refresh
            .as_ref()
            .is_some_and(|p| Instant::now() >= p.expires);
        if !expired {
            return;
        }
        if let Some(pending) = self.pending_refresh.take() {
            warn!(
                queries = pending.query_ids.len(),
                "refresh went unanswered, marking queries unsupported"
            );
            self.unsupported.extend(pending.query_ids.iter().copied());
            if let Some(done) = pending.done {
                let _ = done.send(Err(LanError::ResponseTimeout));
            }
        }
    }

    fn fail_pending(&mut self, error: LanError) {
        if let Some(pending) = self.pending_refresh.take() {
            if let Some(done) = pending.done {
                let _ = done.send(Err(error));
            }
        }
    }

    fn teardown(&mut self, pending_error: LanError) {
        self.shared.ready.store(false, Ordering::Release);
        self.set_available(false);
        self.state.reset();
        self.v2_buffer.clear();
        self.fail_pending(pending_error);
    }

    /// Wait out the reconnect backoff, still answering user commands.
    /// Returns false when the session should stop.
    async fn backoff(&mut self) -> bool {
        let sleep = tokio::time::sleep(RECONNECT_BACKOFF);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = &mut sleep => return true,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return false,
                    Some(Command::SetIp { ip }) => {
                        if ip != self.ip {
                            info!(%ip, "device address changed");
                            self.ip = ip;
                        }
                    }
                    Some(Command::Send { done, .. }) => {
                        let _ = done.send(Err(LanError::NotConnected));
                    }
                    Some(Command::Refresh { done }) => {
                        if let Some(done) = done {
                            let _ = done.send(Err(LanError::NotConnected));
                        }
                    }
                },
            }
        }
    }
}

/// Recreate an error for the command's reply channel; the original is
/// propagated to the reconnect logic. I/O details collapse into
/// `ConnectionClosed` because `io::Error` does not clone.
fn mirror(e: &LanError) -> LanError {
    match e {
        LanError::Integrity(m) => LanError::Integrity(m),
        LanError::Framing(m) => LanError::Framing(m),
        LanError::NotConnected => LanError::NotConnected,
        LanError::RefreshFailed => LanError::RefreshFailed,
        LanError::ResponseTimeout => LanError::ResponseTimeout,
        LanError::DeviceError => LanError::DeviceError,
        _ => LanError::ConnectionClosed,
    }
}
