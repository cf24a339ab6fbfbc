//! RequestRouter - the per-session side of the broker.
//!
//! Decodes command text from the session, annotates URL-bearing commands
//! from the cache, forwards them to the capability's worker and turns worker
//! responses back into text for the session.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::bridge::protocol::{Action, Command, ProtocolError, RequestId, SessionId};
use crate::broker::ServiceBroker;
use crate::cache::{CacheGate, CacheObserver, CacheResolution, CacheState};
use crate::connection::{Observer, TransportError};
use crate::sync::lock;

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct RequestRouter {
    session: SessionId,
    broker: Arc<ServiceBroker>,
    gate: Arc<CacheGate>,
    /// Serialized responses for the session.
    inbound: mpsc::UnboundedSender<String>,
    responses: Observer,
    resolutions: CacheObserver,
    started: Mutex<HashSet<String>>,
    /// Forwarded commands awaiting their cache resolution.
    deferred: Mutex<HashMap<RequestId, Command>>,
    closed: AtomicBool,
    /// Held across deferral and forwarding so a `deferred-result` never
    /// reaches the worker ahead of the command it follows.
    send_order: tokio::sync::Mutex<()>,
}

impl RequestRouter {
    pub fn new(
        session: SessionId,
        broker: Arc<ServiceBroker>,
        gate: Arc<CacheGate>,
        inbound: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (responses, responses_rx) = mpsc::unbounded_channel();
        let (resolutions, resolutions_rx) = mpsc::unbounded_channel();
        let router = Arc::new(Self {
            session,
            broker,
            gate,
            inbound,
            responses,
            resolutions,
            started: Mutex::new(HashSet::new()),
            deferred: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            send_order: tokio::sync::Mutex::new(()),
        });

        tokio::spawn(pump_responses(Arc::downgrade(&router), responses_rx));
        tokio::spawn(pump_resolutions(Arc::downgrade(&router), resolutions_rx));
        router
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn started_services(&self) -> Vec<String> {
        let mut services: Vec<String> = lock(&self.started).iter().cloned().collect();
        services.sort();
        services
    }

    pub fn deferred_count(&self) -> usize {
        lock(&self.deferred).len()
    }

    /// Handle one command text written by the session.
    pub async fn on_outgoing_command(&self, raw: &str) -> Result<(), RouterError> {
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(session_id = %self.session, "Session closed, command dropped");
            return Ok(());
        }

        let mut cmd = Command::parse(raw)?;
        let Some(service) = cmd.service.clone() else {
            tracing::warn!(session_id = %self.session, action = %cmd.action, "Command names no service, dropped");
            return Ok(());
        };

        if cmd.action == Action::StartService {
            match self
                .broker
                .start_service(self.session, &service, self.responses.clone())
            {
                Ok(observers) => {
                    lock(&self.started).insert(service.clone());
                    tracing::debug!(session_id = %self.session, service = %service, observers, "Service started for session");
                }
                Err(e) => {
                    tracing::warn!(session_id = %self.session, service = %service, error = %e, "Service start failed");
                    self.deliver(&Command::failed_service(e.service(), e.to_string()));
                    return Ok(());
                }
            }
        }

        let _order = self.send_order.lock().await;
        if let Some(url) = cmd.url.clone() {
            match self.gate.probe(&url) {
                CacheState::Ok(path) => {
                    cmd.filename = Some(path.to_string_lossy().into_owned());
                }
                CacheState::Uncacheable => {}
                CacheState::Missing => {
                    self.defer(&mut cmd, |observer| self.gate.fetch(&url, observer));
                }
                CacheState::Pending => {
                    self.defer(&mut cmd, |observer| self.gate.monitor(&url, observer));
                }
            }
        }

        self.broker.send(self.session, &service, cmd).await?;
        Ok(())
    }

    /// Mark `cmd` deferred and keep a copy for the follow-up.
    fn defer(&self, cmd: &mut Command, register: impl FnOnce(CacheObserver) -> RequestId) {
        let mut deferred = lock(&self.deferred);
        let request_id = register(self.resolutions.clone());
        cmd.deferred = Some(request_id);
        deferred.insert(request_id, cmd.clone());
        tracing::debug!(session_id = %self.session, %request_id, "Command deferred on cache");
    }

    async fn on_resolution(&self, resolution: CacheResolution) {
        let Some(mut cmd) = lock(&self.deferred).remove(&resolution.request_id) else {
            tracing::debug!(request_id = %resolution.request_id, "Resolution for unknown request");
            return;
        };
        if self.closed.load(Ordering::Acquire) {
            tracing::debug!(session_id = %self.session, request_id = %resolution.request_id, "Session closed, deferred result dropped");
            return;
        }
        let Some(service) = cmd.service.clone() else {
            return;
        };

        cmd.action = Action::DeferredResult;
        cmd.filename = resolution
            .filename
            .map(|path| path.to_string_lossy().into_owned());
        cmd.invalid = Some(resolution.invalid);
        let _order = self.send_order.lock().await;
        if let Err(e) = self.broker.send(self.session, &service, cmd).await {
            tracing::warn!(session_id = %self.session, service = %service, error = %e, "Deferred result not delivered");
        }
    }

    /// Handle a response from a worker addressed to this session.
    pub async fn on_incoming_response(&self, cmd: Command) {
        if cmd.action.ends_service()
            && let Some(service) = cmd.service.as_deref()
        {
            lock(&self.started).remove(service);
            self.broker.stop_service(self.session, service).await;
        }
        self.deliver(&cmd);
    }

    fn deliver(&self, cmd: &Command) {
        match cmd.to_json() {
            Ok(json) => {
                if self.inbound.send(json).is_err() {
                    tracing::debug!(session_id = %self.session, "Session inbound closed, response dropped");
                }
            }
            Err(e) => {
                tracing::error!(session_id = %self.session, error = %e, "Response could not be encoded");
            }
        }
    }

    /// Stop every capability this session started. Later commands and
    /// deferred results are dropped.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        let services: Vec<String> = lock(&self.started).drain().collect();
        for service in services {
            self.broker.stop_service(self.session, &service).await;
        }
        tracing::debug!(session_id = %self.session, "Router shut down");
    }
}

async fn pump_responses(router: Weak<RequestRouter>, mut rx: mpsc::UnboundedReceiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        let Some(router) = router.upgrade() else {
            break;
        };
        router.on_incoming_response(cmd).await;
    }
}

async fn pump_resolutions(
    router: Weak<RequestRouter>,
    mut rx: mpsc::UnboundedReceiver<CacheResolution>,
) {
    while let Some(resolution) = rx.recv().await {
        let Some(router) = router.upgrade() else {
            break;
        };
        router.on_resolution(resolution).await;
    }
}
