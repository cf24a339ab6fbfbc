//! ServiceConnection - one worker process and its loopback socket.
//!
//! Flow:
//! 1. Look up the capability's executables, bind a random loopback port
//! 2. Launch the first executable that starts, port as its first argument
//! 3. Accept exactly one loopback peer, flush frames queued before it arrived
//! 4. Reassemble inbound frames and deliver them to observers by session id
//! 5. On process exit or socket close: broadcast a failure that latches

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::SinkExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::{Mutex, mpsc};
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::DelimitedJsonCodec;
use crate::bridge::protocol::{Command, Frame, PageId, ProtocolError, SessionId};
use crate::bridge::transport::{PortExhausted, bind_loopback, is_loopback_peer};
use crate::config::BrokerConfig;
use crate::registry::{RegistryError, WorkerRegistry};
use crate::sync::lock;

const READ_CHUNK_SIZE: usize = 8 * 1024;
const EXIT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Receiving end for responses addressed to one observer.
pub type Observer = mpsc::UnboundedSender<Command>;

/// Identity of one connection instance.
///
/// A capability torn down and started again gets a new id, so stale failure
/// notices can be told apart from the live connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    NotStarted,
    /// Worker launched, waiting for it to connect.
    Starting,
    Connected,
    Failed,
    ShuttingDown,
}

#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("worker configuration for '{service}' unavailable: {source}")]
    Configuration {
        service: String,
        #[source]
        source: RegistryError,
    },
    #[error("could not allocate a port for '{service}': {source}")]
    PortExhausted {
        service: String,
        #[source]
        source: PortExhausted,
    },
    #[error("no executable could be launched for '{service}': {reason}")]
    Launch { service: String, reason: String },
}

impl StartError {
    pub fn service(&self) -> &str {
        match self {
            Self::Configuration { service, .. }
            | Self::PortExhausted { service, .. }
            | Self::Launch { service, .. } => service,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("worker socket write failed: {0}")]
    Write(#[source] std::io::Error),
    #[error("worker socket read failed: {0}")]
    Read(#[source] std::io::Error),
}

struct Shared {
    state: ConnectionState,
    observers: HashMap<PageId, Observer>,
    /// Latched broadcast failure, replayed to every later observer.
    failure: Option<Command>,
    port: Option<u16>,
}

struct Inbound {
    buffer: BytesMut,
    codec: DelimitedJsonCodec<Frame>,
}

struct Outbound {
    writer: Option<FramedWrite<OwnedWriteHalf, DelimitedJsonCodec<Frame>>>,
    /// Frames sent before the worker connected, in send order.
    queued: VecDeque<Frame>,
}

enum Exit {
    Cancelled,
    ProcessExited(std::io::Result<std::process::ExitStatus>),
    Disconnected(String),
}

pub struct ServiceConnection {
    id: ConnectionId,
    service: String,
    shared: StdMutex<Shared>,
    inbound: StdMutex<Inbound>,
    outbound: Mutex<Outbound>,
    cancel: CancellationToken,
}

impl ServiceConnection {
    pub fn new(service: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::new(),
            service: service.into(),
            shared: StdMutex::new(Shared {
                state: ConnectionState::NotStarted,
                observers: HashMap::new(),
                failure: None,
                port: None,
            }),
            inbound: StdMutex::new(Inbound {
                buffer: BytesMut::new(),
                codec: DelimitedJsonCodec::new(),
            }),
            outbound: Mutex::new(Outbound {
                writer: None,
                queued: VecDeque::new(),
            }),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared).state
    }

    /// Port the worker was told to connect to, once started.
    pub fn port(&self) -> Option<u16> {
        lock(&self.shared).port
    }

    /// Launch the worker and begin listening for its connection.
    ///
    /// Launching is synchronous; the connection itself arrives later. On error
    /// the connection is `Failed` and every observer, present or future,
    /// receives one `failed-service` response naming the capability. Calling
    /// this on a connection that already left `NotStarted` does nothing.
    pub fn start(
        self: &Arc<Self>,
        registry: &dyn WorkerRegistry,
        config: &BrokerConfig,
    ) -> Result<(), StartError> {
        {
            let mut shared = lock(&self.shared);
            if shared.state != ConnectionState::NotStarted {
                tracing::debug!(service = %self.service, state = ?shared.state, "Start ignored");
                return Ok(());
            }
            shared.state = ConnectionState::Starting;
        }

        match self.launch(registry, config) {
            Ok((listener, child, port)) => {
                lock(&self.shared).port = Some(port);
                let connection = Arc::clone(self);
                tokio::spawn(async move {
                    connection.supervise(listener, child).await;
                });
                Ok(())
            }
            Err(e) => {
                tracing::warn!(service = %self.service, error = %e, "Worker start failed");
                self.broadcast(Command::failed_service(&self.service, e.to_string()));
                Err(e)
            }
        }
    }

    fn launch(
        &self,
        registry: &dyn WorkerRegistry,
        config: &BrokerConfig,
    ) -> Result<(TcpListener, Child, u16), StartError> {
        let commands =
            registry
                .lookup(&self.service)
                .map_err(|source| StartError::Configuration {
                    service: self.service.clone(),
                    source,
                })?;

        let (listener, port) =
            bind_loopback(config.port_range.clone(), config.port_attempts).map_err(|source| {
                StartError::PortExhausted {
                    service: self.service.clone(),
                    source,
                }
            })?;

        let mut last_error = None;
        for candidate in &commands {
            let spawned = ProcessCommand::new(&candidate.program)
                .arg(port.to_string())
                .args(&candidate.args)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn();
            match spawned {
                Ok(child) => {
                    tracing::info!(
                        service = %self.service,
                        program = %candidate.program.display(),
                        port,
                        pid = ?child.id(),
                        "Launched worker"
                    );
                    return Ok((listener, child, port));
                }
                Err(e) => {
                    tracing::warn!(
                        service = %self.service,
                        program = %candidate.program.display(),
                        error = %e,
                        "Worker executable failed to launch"
                    );
                    last_error = Some(format!("{}: {}", candidate.program.display(), e));
                }
            }
        }

        Err(StartError::Launch {
            service: self.service.clone(),
            reason: last_error.unwrap_or_else(|| "no executables configured".to_string()),
        })
    }

    async fn supervise(self: Arc<Self>, listener: TcpListener, mut child: Child) {
        let serve = self.serve(listener);
        tokio::pin!(serve);

        let mut exit = tokio::select! {
            biased;

            _ = self.cancel.cancelled() => Exit::Cancelled,
            reason = &mut serve => Exit::Disconnected(reason),
            status = child.wait() => Exit::ProcessExited(status),
        };

        // A connected worker's last frames are still in the socket when its exit is seen.
        if matches!(exit, Exit::ProcessExited(_)) && self.state() == ConnectionState::Connected {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => exit = Exit::Cancelled,
                drained = tokio::time::timeout(EXIT_DRAIN_TIMEOUT, &mut serve) => {
                    if let Ok(reason) = drained {
                        exit = Exit::Disconnected(reason);
                    }
                }
            }
        }

        match exit {
            Exit::Cancelled => {
                if let Err(e) = child.start_kill() {
                    tracing::debug!(service = %self.service, error = %e, "Worker already exited");
                }
                let _ = child.wait().await;
                tracing::debug!(service = %self.service, "Worker stopped");
            }
            Exit::ProcessExited(status) => {
                let description = match status {
                    Ok(status) => format!("worker process exited ({status})"),
                    Err(e) => format!("failed to wait for worker: {e}"),
                };
                self.fail(description).await;
            }
            Exit::Disconnected(reason) => {
                self.fail(reason).await;
            }
        }
    }

    /// Accept the worker, then pump its bytes until the socket ends.
    async fn serve(&self, listener: TcpListener) -> String {
        let (read_half, write_half) = loop {
            match listener.accept().await {
                Ok((stream, peer)) if is_loopback_peer(&peer) => {
                    tracing::info!(service = %self.service, %peer, "Worker connected");
                    break stream.into_split();
                }
                Ok((_stream, peer)) => {
                    tracing::warn!(service = %self.service, %peer, "Rejected non-loopback worker connection");
                }
                Err(e) => return format!("worker listener failed: {e}"),
            }
        };

        if let Err(e) = self.establish(write_half).await {
            return e.to_string();
        }

        tokio::select! {
            reason = self.read_loop(read_half) => reason,
            () = self.reject_extra(&listener) => "worker listener closed".to_string(),
        }
    }

    /// Close every connection attempt after the first.
    async fn reject_extra(&self, listener: &TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    tracing::warn!(service = %self.service, %peer, "Rejected additional worker connection");
                    drop(stream);
                }
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "Listener stopped accepting");
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    async fn establish(&self, write_half: OwnedWriteHalf) -> Result<(), TransportError> {
        let mut outbound = self.outbound.lock().await;
        let mut writer = FramedWrite::new(write_half, DelimitedJsonCodec::new());

        let queued = outbound.queued.len();
        for frame in outbound.queued.drain(..) {
            writer.feed(frame).await.map_err(TransportError::Write)?;
        }
        writer.flush().await.map_err(TransportError::Write)?;
        outbound.writer = Some(writer);

        let mut shared = lock(&self.shared);
        if shared.state == ConnectionState::Starting {
            shared.state = ConnectionState::Connected;
        }
        tracing::debug!(service = %self.service, queued, "Flushed queued frames");
        Ok(())
    }

    async fn read_loop(&self, mut reader: OwnedReadHalf) -> String {
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => return "worker closed the connection".to_string(),
                Ok(n) => {
                    self.on_bytes(&chunk[..n]);
                }
                Err(e) => return TransportError::Read(e).to_string(),
            }
        }
    }

    async fn fail(&self, description: String) {
        let latched = lock(&self.shared).failure.is_some();
        if self.cancel.is_cancelled() || latched {
            tracing::debug!(service = %self.service, %description, "Worker gone after failure");
            self.outbound.lock().await.writer = None;
            return;
        }
        tracing::warn!(service = %self.service, %description, "Worker connection failed");
        self.broadcast(Command::failed_service(&self.service, description));
        self.outbound.lock().await.writer = None;
    }

    /// Feed bytes read from the worker socket.
    ///
    /// Every complete frame is decoded and dispatched; the undelimited tail
    /// stays buffered. Frames are collected before any observer runs, so an
    /// observer may call back into this connection. Undecodable frames are
    /// skipped and returned.
    pub fn on_bytes(&self, chunk: &[u8]) -> Vec<ProtocolError> {
        let decoded = {
            let mut inbound = lock(&self.inbound);
            let Inbound { buffer, codec } = &mut *inbound;
            buffer.extend_from_slice(chunk);

            let mut decoded = Vec::new();
            loop {
                match codec.decode(buffer) {
                    Ok(Some(item)) => decoded.push(item),
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(service = %self.service, error = %e, "Frame decoder failed");
                        break;
                    }
                }
            }
            decoded
        };

        let mut malformed = Vec::new();
        for item in decoded {
            match item {
                Ok(frame) => self.dispatch(frame),
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "Dropping undecodable frame");
                    malformed.push(e);
                }
            }
        }
        malformed
    }

    fn dispatch(&self, frame: Frame) {
        match frame.page_id {
            PageId::Broadcast => self.broadcast(frame.cmd),
            PageId::Session(session) => {
                let observer = lock(&self.shared).observers.get(&frame.page_id).cloned();
                match observer {
                    Some(observer) => notify(&self.service, frame.page_id, &observer, frame.cmd),
                    None => {
                        tracing::debug!(service = %self.service, %session, "No observer for frame");
                    }
                }
            }
        }
    }

    /// Deliver `cmd` to every observer and latch it as this connection's failure.
    fn broadcast(&self, mut cmd: Command) {
        if cmd.service.is_none() {
            cmd.service = Some(self.service.clone());
        }

        let observers: Vec<(PageId, Observer)> = {
            let mut shared = lock(&self.shared);
            if shared.state != ConnectionState::ShuttingDown {
                shared.state = ConnectionState::Failed;
            }
            shared.failure = Some(cmd.clone());
            shared
                .observers
                .iter()
                .map(|(page_id, observer)| (*page_id, observer.clone()))
                .collect()
        };

        for (page_id, observer) in observers {
            notify(&self.service, page_id, &observer, cmd.clone());
        }
    }

    /// Register `observer`, replacing any previous one for `page_id`.
    ///
    /// Returns the number of registered observers. If the connection has
    /// already failed the observer immediately receives the failure.
    pub fn add_observer(&self, page_id: impl Into<PageId>, observer: Observer) -> usize {
        let page_id = page_id.into();
        let (count, failure) = {
            let mut shared = lock(&self.shared);
            shared.observers.insert(page_id, observer.clone());
            (shared.observers.len(), shared.failure.clone())
        };
        if let Some(failure) = failure {
            notify(&self.service, page_id, &observer, failure);
        }
        count
    }

    /// Returns the number of observers left.
    pub fn remove_observer(&self, page_id: impl Into<PageId>) -> usize {
        let mut shared = lock(&self.shared);
        shared.observers.remove(&page_id.into());
        shared.observers.len()
    }

    pub fn has_observer(&self, page_id: impl Into<PageId>) -> bool {
        lock(&self.shared).observers.contains_key(&page_id.into())
    }

    pub fn observer_count(&self) -> usize {
        lock(&self.shared).observers.len()
    }

    /// Frame `cmd` for `session` and write it, or queue it until the worker
    /// connects. Commands sent after a failure are dropped.
    pub async fn send(&self, session: SessionId, cmd: Command) -> Result<(), TransportError> {
        let frame = Frame::new(session, cmd);
        let mut outbound = self.outbound.lock().await;
        match outbound.writer.as_mut() {
            Some(writer) => {
                writer.send(frame).await.map_err(TransportError::Write)?;
                tracing::trace!(service = %self.service, %session, "Sent frame");
            }
            None => match self.state() {
                ConnectionState::Failed | ConnectionState::ShuttingDown => {
                    tracing::debug!(service = %self.service, %session, "Connection down, dropping command");
                }
                _ => outbound.queued.push_back(frame),
            },
        }
        Ok(())
    }

    /// Bytes held back waiting for a delimiter.
    pub fn pending_bytes(&self) -> usize {
        lock(&self.inbound).buffer.len()
    }

    pub async fn queued_frames(&self) -> usize {
        self.outbound.lock().await.queued.len()
    }

    #[cfg(test)]
    pub(crate) async fn queued_commands(&self) -> Vec<Command> {
        let outbound = self.outbound.lock().await;
        outbound.queued.iter().map(|frame| frame.cmd.clone()).collect()
    }

    /// Stop the worker and close its socket. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        {
            let mut shared = lock(&self.shared);
            shared.state = ConnectionState::ShuttingDown;
            shared.observers.clear();
        }
        self.cancel.cancel();

        {
            let mut outbound = self.outbound.lock().await;
            if let Some(mut writer) = outbound.writer.take()
                && let Err(e) = writer.close().await
            {
                tracing::debug!(service = %self.service, error = %e, "Worker socket close failed");
            }
            outbound.queued.clear();
        }

        let mut inbound = lock(&self.inbound);
        inbound.buffer.clear();
        inbound.codec.reset();
        tracing::debug!(service = %self.service, connection = %self.id, "Connection shut down");
    }
}

fn notify(service: &str, page_id: PageId, observer: &Observer, cmd: Command) {
    if observer.send(cmd).is_err() {
        tracing::debug!(service, %page_id, "Observer gone, response dropped");
    }
}
