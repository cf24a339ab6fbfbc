//! Worker side of the socket protocol - runs inside a capability process.
//!
//! The broker launches the worker with the port to connect back to. The worker
//! keeps per-session started state and passes everything else to a
//! [`ServiceHandler`]. Every response it sends carries the service name.
//!
//! A worker that cannot serve its capability at all calls [`report_failure`]
//! instead of [`Worker::run`]; the broker then fails every session using it.

use std::collections::HashSet;
use std::io;
use std::net::Ipv4Addr;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::bridge::codec::DelimitedJsonCodec;
use crate::bridge::protocol::{Action, Command, Frame, PageId, SessionId};

pub const ALREADY_STARTED: &str = "Service already started.";
pub const NOT_STARTED: &str = "Service not started.";

/// Capability implementation driven by [`Worker`].
pub trait ServiceHandler: Send {
    /// Reply for a session starting the service. Extra fields set here reach
    /// the session with the `started-service` response.
    fn on_start(&mut self, _session: SessionId, _cmd: &Command) -> Command {
        Command::new(Action::StartedService)
    }

    fn on_stop(&mut self, _session: SessionId, _cmd: &Command) {}

    /// Handle a command from a started session, returning its responses.
    fn handle(&mut self, session: SessionId, cmd: Command) -> Vec<Command>;
}

pub struct Worker<H> {
    service: String,
    handler: H,
    started: HashSet<SessionId>,
}

impl<H: ServiceHandler> Worker<H> {
    pub fn new(service: impl Into<String>, handler: H) -> Self {
        Self {
            service: service.into(),
            handler,
            started: HashSet::new(),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn is_started(&self, session: SessionId) -> bool {
        self.started.contains(&session)
    }

    /// Apply one command from `session` and return the stamped responses.
    pub fn dispatch(&mut self, session: SessionId, cmd: Command) -> Vec<Command> {
        let mut replies = match cmd.action {
            Action::StartService if self.started.contains(&session) => {
                vec![Command::new(Action::FailedService).with_description(ALREADY_STARTED)]
            }
            Action::StartService => {
                let reply = self.handler.on_start(session, &cmd);
                self.started.insert(session);
                tracing::debug!(service = %self.service, session_id = %session, "Session started");
                vec![reply]
            }
            Action::StopService if !self.started.contains(&session) => {
                vec![Command::new(Action::FailedService).with_description(NOT_STARTED)]
            }
            Action::StopService => {
                self.handler.on_stop(session, &cmd);
                self.started.remove(&session);
                tracing::debug!(service = %self.service, session_id = %session, "Session stopped");
                vec![Command::new(Action::StoppedService)]
            }
            _ if self.started.contains(&session) => self.handler.handle(session, cmd),
            _ => {
                tracing::debug!(service = %self.service, session_id = %session, action = %cmd.action, "Command before start dropped");
                Vec::new()
            }
        };

        for reply in &mut replies {
            reply.service = Some(self.service.clone());
        }
        replies
    }

    /// Connect to the broker on `port` and serve until it closes the socket.
    pub async fn run(mut self, port: u16) -> io::Result<()> {
        let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
        tracing::info!(service = %self.service, port, "Connected to broker");
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, DelimitedJsonCodec::<Frame>::new());
        let mut writer = FramedWrite::new(write_half, DelimitedJsonCodec::<Frame>::new());

        while let Some(item) = reader.next().await {
            let frame = match item? {
                Ok(frame) => frame,
                Err(e) => {
                    tracing::warn!(service = %self.service, error = %e, "Skipping undecodable frame");
                    continue;
                }
            };
            let PageId::Session(session) = frame.page_id else {
                tracing::debug!(service = %self.service, "Ignoring broadcast frame");
                continue;
            };

            for reply in self.dispatch(session, frame.cmd) {
                writer.feed(Frame::new(session, reply)).await?;
            }
            writer.flush().await?;
        }

        tracing::info!(service = %self.service, "Broker closed the connection");
        Ok(())
    }
}

/// Tell the broker on `port` that this capability cannot run here.
pub async fn report_failure(port: u16, description: &str) -> io::Result<()> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await?;
    let mut writer = FramedWrite::new(stream, DelimitedJsonCodec::<Frame>::new());
    writer
        .send(Frame::broadcast(
            Command::new(Action::FailedService).with_description(description),
        ))
        .await?;
    writer.close().await?;
    tracing::info!(port, description, "Reported service failure");
    Ok(())
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    struct Upper;

    impl ServiceHandler for Upper {
        fn on_start(&mut self, _session: SessionId, _cmd: &Command) -> Command {
            Command::new(Action::StartedService).with_field("extension", "upper")
        }

        fn handle(&mut self, _session: SessionId, cmd: Command) -> Vec<Command> {
            let text = cmd
                .field("text")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_uppercase();
            vec![Command::new("shout").with_field("text", text)]
        }
    }

    fn start() -> Command {
        Command::new(Action::StartService)
    }

    #[test]
    fn start_and_stop_per_session() {
        let mut worker = Worker::new("upper", Upper);
        let s1 = SessionId::new(1);

        let replies = worker.dispatch(s1, start());
        assert_eq!(replies[0].action, Action::StartedService);
        assert_eq!(replies[0].field("extension"), Some(&serde_json::json!("upper")));
        assert_eq!(replies[0].service.as_deref(), Some("upper"));

        let replies = worker.dispatch(s1, start());
        assert_eq!(replies[0].action, Action::FailedService);
        assert_eq!(replies[0].description.as_deref(), Some(ALREADY_STARTED));

        let replies = worker.dispatch(s1, Command::new(Action::StopService));
        assert_eq!(replies[0].action, Action::StoppedService);
        assert!(!worker.is_started(s1));

        let replies = worker.dispatch(s1, Command::new(Action::StopService));
        assert_eq!(replies[0].description.as_deref(), Some(NOT_STARTED));
    }

    #[test]
    fn commands_need_a_started_session() {
        let mut worker = Worker::new("upper", Upper);
        let s2 = SessionId::new(2);
        let say = Command::new("say").with_field("text", "hi");

        assert!(worker.dispatch(s2, say.clone()).is_empty());
        worker.dispatch(s2, start());
        let replies = worker.dispatch(s2, say);
        assert_eq!(replies[0].field("text"), Some(&serde_json::json!("HI")));
        assert_eq!(replies[0].service.as_deref(), Some("upper"));
    }

    #[tokio::test]
    async fn run_answers_over_the_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let worker = tokio::spawn(Worker::new("upper", Upper).run(port));

        let (stream, _) = listener.accept().await.unwrap();
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, DelimitedJsonCodec::<Frame>::new());
        let mut writer = FramedWrite::new(write_half, DelimitedJsonCodec::<Frame>::new());

        writer.send(Frame::new(SessionId::new(4), start())).await.unwrap();
        writer
            .send(Frame::new(
                SessionId::new(4),
                Command::new("say").with_field("text", "hey"),
            ))
            .await
            .unwrap();

        let started = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(started.page_id, PageId::Session(SessionId::new(4)));
        assert_eq!(started.cmd.action, Action::StartedService);
        let shout = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(shout.cmd.field("text"), Some(&serde_json::json!("HEY")));

        drop(writer);
        drop(reader);
        worker.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failure_report_is_a_broadcast() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let report = tokio::spawn(async move { report_failure(port, "unsupported").await });

        let (stream, _) = listener.accept().await.unwrap();
        let mut reader = FramedRead::new(stream, DelimitedJsonCodec::<Frame>::new());
        let frame = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(frame.page_id, PageId::Broadcast);
        assert_eq!(frame.cmd.action, Action::FailedService);
        assert_eq!(frame.cmd.description.as_deref(), Some("unsupported"));
        report.await.unwrap().unwrap();
    }
}
