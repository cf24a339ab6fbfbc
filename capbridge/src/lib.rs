//! capbridge: broker between sandboxed content sessions and local
//! capability worker processes.

mod sync;

pub mod access;
pub mod bridge;
pub mod broker;
pub mod cache;
pub mod config;
pub mod connection;
pub mod registry;
pub mod router;
pub mod window;
pub mod worker;

pub use access::{MemoryPermissionStore, Permission, PermissionStore, origin_key};
pub use bridge::protocol::{Action, Command, Frame, PageId, ProtocolError, RequestId, SessionId};
pub use broker::ServiceBroker;
pub use cache::{
    CacheBackend, CacheError, CacheGate, CacheResolution, CacheState, DiskCache, EntryCondition,
};
pub use config::BrokerConfig;
pub use connection::{ConnectionId, ConnectionState, ServiceConnection, StartError, TransportError};
pub use registry::{FileRegistry, RegistryError, StaticRegistry, WorkerCommand, WorkerRegistry};
pub use router::{RequestRouter, RouterError};
pub use window::{HostWindow, SessionHandle, WindowError};
pub use worker::{ServiceHandler, Worker, report_failure};
