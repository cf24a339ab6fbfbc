//! Wire types shared by the broker and its worker processes.
//!
//! A frame is `{"page_id": <session id | "*">, "cmd": <command>}` followed by
//! [`DELIMITER`]. Commands are open records keyed by `action`; the fields the
//! broker itself inspects are typed, everything else rides along in `extra`.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Frame terminator (ASCII end-of-text). serde_json escapes every control
/// character inside strings, so it never appears in encoded frame text.
pub const DELIMITER: u8 = 0x03;

/// Identifier of one content session within a host window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Address of a frame: one session, or every observer of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPageId", into = "RawPageId")]
pub enum PageId {
    Session(SessionId),
    /// The reserved `"*"` id. Frames sent to it are failures that latch.
    Broadcast,
}

impl From<SessionId> for PageId {
    fn from(id: SessionId) -> Self {
        Self::Session(id)
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Session(id) => write!(f, "{id}"),
            Self::Broadcast => f.write_str(BROADCAST_ID),
        }
    }
}

const BROADCAST_ID: &str = "*";

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum RawPageId {
    Session(u64),
    Named(String),
}

impl TryFrom<RawPageId> for PageId {
    type Error = String;

    fn try_from(raw: RawPageId) -> Result<Self, Self::Error> {
        match raw {
            RawPageId::Session(id) => Ok(Self::Session(SessionId(id))),
            RawPageId::Named(name) if name == BROADCAST_ID => Ok(Self::Broadcast),
            RawPageId::Named(name) => Err(format!("invalid page id '{name}'")),
        }
    }
}

impl From<PageId> for RawPageId {
    fn from(id: PageId) -> Self {
        match id {
            PageId::Session(id) => Self::Session(id.0),
            PageId::Broadcast => Self::Named(BROADCAST_ID.to_string()),
        }
    }
}

/// Identifier handed out by the cache gate for one deferred resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(u64);

impl RequestId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Command verbs the broker acts on. Anything else is carried verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Action {
    StartService,
    StopService,
    StartedService,
    StoppedService,
    FailedService,
    DeferredResult,
    Other(String),
}

impl Action {
    pub fn as_str(&self) -> &str {
        match self {
            Self::StartService => "start-service",
            Self::StopService => "stop-service",
            Self::StartedService => "started-service",
            Self::StoppedService => "stopped-service",
            Self::FailedService => "failed-service",
            Self::DeferredResult => "deferred-result",
            Self::Other(name) => name,
        }
    }

    /// True for responses after which the session no longer uses the service.
    pub fn ends_service(&self) -> bool {
        matches!(self, Self::StoppedService | Self::FailedService)
    }
}

impl From<String> for Action {
    fn from(name: String) -> Self {
        match name.as_str() {
            "start-service" => Self::StartService,
            "stop-service" => Self::StopService,
            "started-service" => Self::StartedService,
            "stopped-service" => Self::StoppedService,
            "failed-service" => Self::FailedService,
            "deferred-result" => Self::DeferredResult,
            _ => Self::Other(name),
        }
    }
}

impl From<&str> for Action {
    fn from(name: &str) -> Self {
        Self::from(name.to_string())
    }
}

impl From<Action> for String {
    fn from(action: Action) -> Self {
        match action {
            Action::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One command or response record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub action: Action,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deferred: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fields only the worker understands (`text`, `name`, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Command {
    pub fn new(action: impl Into<Action>) -> Self {
        Self {
            action: action.into(),
            service: None,
            channel: None,
            url: None,
            filename: None,
            deferred: None,
            invalid: None,
            description: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Failure response for `service`, produced locally or by a worker.
    pub fn failed_service(service: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(Action::FailedService)
            .with_service(service)
            .with_description(description)
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn field(&self, key: &str) -> Option<&serde_json::Value> {
        self.extra.get(key)
    }

    /// Decode command text received from a content session.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(raw).map_err(ProtocolError::Command)
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Command)
    }
}

/// One unit on the worker socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub page_id: PageId,
    pub cmd: Command,
}

impl Frame {
    pub fn new(page_id: impl Into<PageId>, cmd: Command) -> Self {
        Self {
            page_id: page_id.into(),
            cmd,
        }
    }

    pub fn broadcast(cmd: Command) -> Self {
        Self {
            page_id: PageId::Broadcast,
            cmd,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("undecodable frame: {0}")]
    Frame(#[source] serde_json::Error),
    #[error("undecodable command: {0}")]
    Command(#[source] serde_json::Error),
}
