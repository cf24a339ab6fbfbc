//! ServiceBroker - shares one worker connection per capability across sessions.
//!
//! The broker registers its own observer under the broadcast id on every
//! connection it creates and counts it as a consumer: a connection is torn
//! down once only that observer remains.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;

use crate::bridge::protocol::{Command, PageId, SessionId};
use crate::config::BrokerConfig;
use crate::connection::{ConnectionId, Observer, ServiceConnection, StartError, TransportError};
use crate::registry::WorkerRegistry;
use crate::sync::lock;

pub struct ServiceBroker {
    this: Weak<Self>,
    registry: Arc<dyn WorkerRegistry>,
    config: BrokerConfig,
    active: Mutex<HashMap<String, Arc<ServiceConnection>>>,
}

impl ServiceBroker {
    pub fn new(registry: Arc<dyn WorkerRegistry>, config: BrokerConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            registry,
            config,
            active: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register `observer` for `session` on the connection for `service`,
    /// launching the worker if the capability is not active.
    ///
    /// Returns the connection's observer count, the broker's own included.
    /// A connection that fails to start is not kept.
    pub fn start_service(
        &self,
        session: SessionId,
        service: &str,
        observer: Observer,
    ) -> Result<usize, StartError> {
        let connection = {
            let mut active = lock(&self.active);
            match active.get(service) {
                Some(connection) => Arc::clone(connection),
                None => {
                    let connection = ServiceConnection::new(service);
                    connection.start(self.registry.as_ref(), &self.config)?;
                    self.watch(&connection);
                    active.insert(service.to_string(), Arc::clone(&connection));
                    tracing::info!(
                        service,
                        connection = %connection.id(),
                        port = ?connection.port(),
                        "Service connection started"
                    );
                    connection
                }
            }
        };

        let count = connection.add_observer(session, observer);
        tracing::debug!(service, session_id = %session, observers = count, "Session registered");
        Ok(count)
    }

    /// Listen for the first broadcast failure of `connection`.
    fn watch(&self, connection: &Arc<ServiceConnection>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        connection.add_observer(PageId::Broadcast, tx);

        let broker = self.this.clone();
        let service = connection.service().to_string();
        let id = connection.id();
        tokio::spawn(async move {
            if rx.recv().await.is_none() {
                return;
            }
            if let Some(broker) = broker.upgrade() {
                broker.on_broker_failure(&service, id).await;
            }
        });
    }

    /// Drop `session` from `service`, tearing the connection down when no
    /// session is left. No-op for inactive capabilities or unknown sessions.
    pub async fn stop_service(&self, session: SessionId, service: &str) {
        let connection = {
            let mut active = lock(&self.active);
            let Some(connection) = active.get(service).cloned() else {
                tracing::debug!(service, session_id = %session, "Stop for inactive service ignored");
                return;
            };
            if !connection.has_observer(session) {
                tracing::debug!(service, session_id = %session, "Stop from unregistered session ignored");
                return;
            }

            let remaining = connection.remove_observer(session);
            if remaining > 1 {
                tracing::debug!(service, session_id = %session, remaining, "Session unregistered");
                return;
            }
            active.remove(service);
            connection
        };

        connection.shutdown().await;
        tracing::info!(service, connection = %connection.id(), "Service connection stopped");
    }

    /// Forward `cmd` to the worker for `service`. Dropped when inactive.
    pub async fn send(
        &self,
        session: SessionId,
        service: &str,
        cmd: Command,
    ) -> Result<(), TransportError> {
        let connection = lock(&self.active).get(service).cloned();
        match connection {
            Some(connection) => connection.send(session, cmd).await,
            None => {
                tracing::debug!(service, session_id = %session, action = %cmd.action, "Service inactive, dropping command");
                Ok(())
            }
        }
    }

    /// Deregister and tear down the failed connection `id`.
    ///
    /// A notice for a connection that was already replaced is ignored.
    pub async fn on_broker_failure(&self, service: &str, id: ConnectionId) {
        let removed = {
            let mut active = lock(&self.active);
            match active.get(service) {
                Some(connection) if connection.id() == id => active.remove(service),
                _ => None,
            }
        };

        match removed {
            Some(connection) => {
                tracing::warn!(service, connection = %id, "Deregistering failed connection");
                connection.shutdown().await;
            }
            None => {
                tracing::debug!(service, connection = %id, "Failure for stale connection ignored");
            }
        }
    }

    pub fn is_active(&self, service: &str) -> bool {
        lock(&self.active).contains_key(service)
    }

    pub fn connection(&self, service: &str) -> Option<Arc<ServiceConnection>> {
        lock(&self.active).get(service).cloned()
    }

    pub fn active_services(&self) -> Vec<String> {
        let mut services: Vec<String> = lock(&self.active).keys().cloned().collect();
        services.sort();
        services
    }

    /// Tear down every connection regardless of remaining sessions.
    pub async fn shutdown_all(&self) {
        let connections: Vec<_> = lock(&self.active).drain().map(|(_, c)| c).collect();
        for connection in connections {
            connection.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::Action;
    use crate::connection::ConnectionState;
    use crate::registry::{StaticRegistry, WorkerCommand};

    /// `sleep <port> 60` never connects and stays alive until killed.
    fn sleeper_broker() -> Arc<ServiceBroker> {
        let registry = StaticRegistry::new()
            .with_service("speech", [WorkerCommand::new("sleep").with_args(["60"])])
            .with_service("audio", [WorkerCommand::new("/nonexistent/audio")]);
        ServiceBroker::new(Arc::new(registry), BrokerConfig::default())
    }

    fn observer() -> Observer {
        mpsc::unbounded_channel().0
    }

    #[tokio::test]
    async fn sessions_share_one_connection() {
        let broker = sleeper_broker();
        assert_eq!(
            broker.start_service(SessionId::new(1), "speech", observer()).unwrap(),
            2
        );
        let first = broker.connection("speech").unwrap();
        assert_eq!(
            broker.start_service(SessionId::new(2), "speech", observer()).unwrap(),
            3
        );
        assert_eq!(broker.connection("speech").unwrap().id(), first.id());

        broker.stop_service(SessionId::new(1), "speech").await;
        assert!(broker.is_active("speech"));

        broker.stop_service(SessionId::new(2), "speech").await;
        assert!(!broker.is_active("speech"));
        assert_eq!(first.state(), ConnectionState::ShuttingDown);

        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn restart_builds_fresh_connection() {
        let broker = sleeper_broker();
        broker.start_service(SessionId::new(1), "speech", observer()).unwrap();
        let first = broker.connection("speech").unwrap().id();
        broker.stop_service(SessionId::new(1), "speech").await;

        broker.start_service(SessionId::new(1), "speech", observer()).unwrap();
        assert_ne!(broker.connection("speech").unwrap().id(), first);

        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn stop_without_start_is_noop() {
        let broker = sleeper_broker();
        broker.stop_service(SessionId::new(1), "speech").await;

        broker.start_service(SessionId::new(1), "speech", observer()).unwrap();
        broker.stop_service(SessionId::new(9), "speech").await;
        assert!(broker.is_active("speech"));
        assert_eq!(broker.connection("speech").unwrap().observer_count(), 2);

        broker.shutdown_all().await;
    }

    #[tokio::test]
    async fn failed_start_is_not_kept() {
        let broker = sleeper_broker();
        let err = broker
            .start_service(SessionId::new(1), "audio", observer())
            .unwrap_err();
        assert!(matches!(err, StartError::Launch { .. }));
        assert_eq!(err.service(), "audio");
        assert!(!broker.is_active("audio"));
        assert!(broker.active_services().is_empty());
    }

    #[tokio::test]
    async fn send_to_inactive_service_is_dropped() {
        let broker = sleeper_broker();
        broker
            .send(SessionId::new(1), "speech", Command::new("say"))
            .await
            .unwrap();
        assert!(!broker.is_active("speech"));
    }

    #[tokio::test]
    async fn failure_of_replaced_connection_is_ignored() {
        let broker = sleeper_broker();
        broker.start_service(SessionId::new(1), "speech", observer()).unwrap();
        let live = broker.connection("speech").unwrap();

        broker.on_broker_failure("speech", ConnectionId::new()).await;
        assert!(broker.is_active("speech"));

        broker.on_broker_failure("speech", live.id()).await;
        assert!(!broker.is_active("speech"));
        assert_eq!(live.state(), ConnectionState::ShuttingDown);
    }

    #[tokio::test]
    async fn broadcast_failure_deregisters() {
        let broker = sleeper_broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.start_service(SessionId::new(1), "speech", tx).unwrap();
        let connection = broker.connection("speech").unwrap();

        let mut bytes = serde_json::to_vec(&crate::bridge::protocol::Frame::broadcast(
            Command::new(Action::FailedService).with_description("unsupported"),
        ))
        .unwrap();
        bytes.push(crate::bridge::protocol::DELIMITER);
        connection.on_bytes(&bytes);

        let cmd = rx.recv().await.unwrap();
        assert_eq!(cmd.action, Action::FailedService);
        assert_eq!(cmd.service.as_deref(), Some("speech"));

        for _ in 0..100 {
            if !broker.is_active("speech") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!broker.is_active("speech"));
    }
}
