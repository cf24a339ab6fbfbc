//! Local resource cache in front of workers.
//!
//! [`CacheGate`] runs the probe/fetch/monitor handshake for URLs carried by
//! commands; a [`CacheBackend`] is the cache it asks. [`DiskCache`] is the
//! directory-backed backend.

use std::path::PathBuf;

use async_trait::async_trait;

mod disk;
mod gate;

pub use disk::DiskCache;
pub use gate::{CacheGate, CacheObserver, CacheResolution, CacheState};

/// What a backend knows about one URL right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryCondition {
    /// Stored on disk at this path.
    Ready(PathBuf),
    /// A download or revalidation is in progress.
    Validating,
    Absent,
    /// The URL can never be served from disk.
    NotDiskBacked,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("no cache entry for {0}")]
    NotCached(String),
    #[error("unsupported url {0}")]
    UnsupportedUrl(String),
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Called on every probe; must not wait on the network or on a
    /// download. A single metadata lookup for a local file is allowed.
    fn condition(&self, url: &str) -> Result<EntryCondition, CacheError>;

    /// Download `url` into the cache and return the response status.
    /// Local resources report status 0.
    async fn fetch(&self, url: &str) -> Result<u16, CacheError>;

    /// Local path of the stored entry for `url`.
    async fn open_entry(&self, url: &str) -> Result<PathBuf, CacheError>;
}
