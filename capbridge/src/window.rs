//! HostWindow - the broker context of one host window.
//!
//! Owns the window's [`ServiceBroker`] and [`CacheGate`] and hands out one
//! [`SessionHandle`] per content document. Dropping the window without
//! calling [`HostWindow::shutdown`] leaves workers running until their
//! connections are dropped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::access::{MemoryPermissionStore, Permission, PermissionStore, origin_key};
use crate::bridge::protocol::SessionId;
use crate::broker::ServiceBroker;
use crate::cache::{CacheBackend, CacheGate};
use crate::config::BrokerConfig;
use crate::registry::WorkerRegistry;
use crate::router::{RequestRouter, RouterError};
use crate::sync::lock;

#[derive(Debug, thiserror::Error)]
pub enum WindowError {
    #[error("origin {0} is denied")]
    AccessDenied(String),
    #[error("origin {0} cannot be granted capabilities")]
    InvalidOrigin(String),
    #[error("unknown session {0}")]
    UnknownSession(SessionId),
    #[error(transparent)]
    Router(#[from] RouterError),
}

pub struct HostWindow {
    broker: Arc<ServiceBroker>,
    gate: Arc<CacheGate>,
    permissions: Arc<dyn PermissionStore>,
    next_session: AtomicU64,
    sessions: Mutex<HashMap<SessionId, Arc<RequestRouter>>>,
}

impl HostWindow {
    pub fn new(
        config: BrokerConfig,
        registry: Arc<dyn WorkerRegistry>,
        cache: Arc<dyn CacheBackend>,
    ) -> Self {
        let gate = CacheGate::new(cache, &config);
        Self {
            broker: ServiceBroker::new(registry, config),
            gate,
            permissions: Arc::new(MemoryPermissionStore::new()),
            next_session: AtomicU64::new(0),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_permissions(mut self, permissions: Arc<dyn PermissionStore>) -> Self {
        self.permissions = permissions;
        self
    }

    pub fn broker(&self) -> &Arc<ServiceBroker> {
        &self.broker
    }

    pub fn gate(&self) -> &Arc<CacheGate> {
        &self.gate
    }

    pub fn permissions(&self) -> &Arc<dyn PermissionStore> {
        &self.permissions
    }

    /// Attach a session for a document loaded from `origin`.
    pub fn open_session(&self, origin: &str) -> Result<SessionHandle, WindowError> {
        let key = origin_key(origin).ok_or_else(|| WindowError::InvalidOrigin(origin.to_string()))?;
        if self.permissions.get(&key) == Permission::Denied {
            tracing::info!(origin = %key, "Session refused for denied origin");
            return Err(WindowError::AccessDenied(key));
        }

        let session = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));
        let (tx, inbound) = mpsc::unbounded_channel();
        let router = RequestRouter::new(
            session,
            Arc::clone(&self.broker),
            Arc::clone(&self.gate),
            tx,
        );
        lock(&self.sessions).insert(session, Arc::clone(&router));
        tracing::info!(session_id = %session, origin = %key, "Session opened");

        Ok(SessionHandle {
            id: session,
            router,
            inbound,
        })
    }

    /// Route command text for `session`.
    pub async fn submit(&self, session: SessionId, raw: &str) -> Result<(), WindowError> {
        let router = lock(&self.sessions)
            .get(&session)
            .cloned()
            .ok_or(WindowError::UnknownSession(session))?;
        router.on_outgoing_command(raw).await?;
        Ok(())
    }

    /// Detach `session`, stopping every capability it started.
    pub async fn close_session(&self, session: SessionId) {
        let router = lock(&self.sessions).remove(&session);
        match router {
            Some(router) => {
                router.shutdown().await;
                tracing::info!(session_id = %session, "Session closed");
            }
            None => tracing::debug!(session_id = %session, "Close for unknown session ignored"),
        }
    }

    pub fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub async fn shutdown(&self) {
        let routers: Vec<_> = lock(&self.sessions).drain().map(|(_, r)| r).collect();
        for router in routers {
            router.shutdown().await;
        }
        self.broker.shutdown_all().await;
        tracing::info!("Host window shut down");
    }
}

/// Content-facing end of one session.
pub struct SessionHandle {
    id: SessionId,
    router: Arc<RequestRouter>,
    inbound: mpsc::UnboundedReceiver<String>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub async fn submit(&self, raw: &str) -> Result<(), RouterError> {
        self.router.on_outgoing_command(raw).await
    }

    /// Next serialized response. None once the session is gone.
    pub async fn recv(&mut self) -> Option<String> {
        self.inbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.inbound.try_recv().ok()
    }
}
