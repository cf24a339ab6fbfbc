//! CacheGate - probe/fetch/monitor state machine over a [`CacheBackend`].
//!
//! Every fetch and monitor registration gets a fresh [`RequestId`] and stays
//! in the pending set until it is resolved. Resolution notifies exactly once:
//! the completing fetch's own observer first, then every monitor registered
//! for the same URL. Monitors of other URLs stay pending.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{CacheBackend, EntryCondition};
use crate::bridge::protocol::RequestId;
use crate::config::BrokerConfig;
use crate::sync::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheState {
    /// Cached locally at this path.
    Ok(PathBuf),
    /// Not cached; a fetch is needed.
    Missing,
    /// A fetch or validation is already running.
    Pending,
    /// Never cacheable.
    Uncacheable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheResolution {
    pub request_id: RequestId,
    pub url: String,
    /// None when the resource could not be stored or opened.
    pub filename: Option<PathBuf>,
    /// True only when the network fetch itself failed.
    pub invalid: bool,
}

pub type CacheObserver = mpsc::UnboundedSender<CacheResolution>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Fetch,
    Monitor,
}

struct PendingRequest {
    request_id: RequestId,
    url: String,
    observer: CacheObserver,
    kind: RequestKind,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    pending: Vec<PendingRequest>,
    /// URLs whose backend validation is being polled.
    polling: HashSet<String>,
}

impl Inner {
    fn allocate(&mut self) -> RequestId {
        self.next_id += 1;
        RequestId::new(self.next_id)
    }

    fn is_fetching(&self, url: &str) -> bool {
        self.pending
            .iter()
            .any(|p| p.kind == RequestKind::Fetch && p.url == url)
    }

    /// Remove `own` (if given) and every monitor of `url`, in that order.
    fn drain(&mut self, own: Option<RequestId>, url: &str) -> Vec<PendingRequest> {
        let mut resolved = Vec::new();
        if let Some(own) = own
            && let Some(index) = self.pending.iter().position(|p| p.request_id == own)
        {
            resolved.push(self.pending.remove(index));
        }

        let (monitors, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| p.kind == RequestKind::Monitor && p.url == url);
        self.pending = rest;
        resolved.extend(monitors);
        resolved
    }
}

pub struct CacheGate {
    this: Weak<Self>,
    backend: Arc<dyn CacheBackend>,
    poll_interval: Duration,
    validation_timeout: Duration,
    inner: Mutex<Inner>,
}

impl CacheGate {
    pub fn new(backend: Arc<dyn CacheBackend>, config: &BrokerConfig) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            poll_interval: config.validation_poll_interval,
            validation_timeout: config.validation_timeout,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Classify `url` without blocking. Backend errors read as uncacheable.
    pub fn probe(&self, url: &str) -> CacheState {
        if lock(&self.inner).is_fetching(url) {
            return CacheState::Pending;
        }
        match self.backend.condition(url) {
            Ok(EntryCondition::Ready(path)) => CacheState::Ok(path),
            Ok(EntryCondition::Validating) => CacheState::Pending,
            Ok(EntryCondition::Absent) => CacheState::Missing,
            Ok(EntryCondition::NotDiskBacked) => CacheState::Uncacheable,
            Err(e) => {
                tracing::debug!(url, error = %e, "Cache probe failed, treating as uncacheable");
                CacheState::Uncacheable
            }
        }
    }

    /// Start fetching `url`. `observer` receives exactly one resolution.
    pub fn fetch(&self, url: &str, observer: CacheObserver) -> RequestId {
        let request_id = {
            let mut inner = lock(&self.inner);
            let request_id = inner.allocate();
            inner.pending.push(PendingRequest {
                request_id,
                url: url.to_string(),
                observer,
                kind: RequestKind::Fetch,
            });
            request_id
        };
        tracing::debug!(url, %request_id, "Fetching into cache");

        if let Some(gate) = self.this.upgrade() {
            let url = url.to_string();
            tokio::spawn(async move {
                gate.run_fetch(url, request_id).await;
            });
        }
        request_id
    }

    /// Wait for the fetch or validation already running for `url`.
    pub fn monitor(&self, url: &str, observer: CacheObserver) -> RequestId {
        let (request_id, start_polling) = {
            let mut inner = lock(&self.inner);
            let request_id = inner.allocate();
            let fetching = inner.is_fetching(url);
            inner.pending.push(PendingRequest {
                request_id,
                url: url.to_string(),
                observer,
                kind: RequestKind::Monitor,
            });
            (request_id, !fetching && inner.polling.insert(url.to_string()))
        };
        tracing::debug!(url, %request_id, "Monitoring cache entry");

        if start_polling && let Some(gate) = self.this.upgrade() {
            let url = url.to_string();
            tokio::spawn(async move {
                gate.poll_validation(url).await;
            });
        }
        request_id
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    async fn run_fetch(self: Arc<Self>, url: String, request_id: RequestId) {
        let (filename, invalid) = match self.backend.fetch(&url).await {
            Ok(status) if status == 200 || status == 0 => (self.open(&url).await, false),
            Ok(status) => {
                tracing::debug!(url = %url, status, "Fetch unsuccessful");
                (None, true)
            }
            Err(e) => {
                tracing::warn!(url = %url, error = %e, "Fetch failed");
                (None, true)
            }
        };
        let resolved = lock(&self.inner).drain(Some(request_id), &url);
        notify_all(resolved, filename, invalid);
    }

    /// Resolve monitors of a URL the backend reports as validating.
    async fn poll_validation(self: Arc<Self>, url: String) {
        let deadline = Instant::now() + self.validation_timeout;
        let filename = loop {
            tokio::time::sleep(self.poll_interval).await;

            {
                let mut inner = lock(&self.inner);
                if inner.is_fetching(&url) {
                    inner.polling.remove(&url);
                    tracing::debug!(url = %url, "Fetch took over validation");
                    return;
                }
            }
            match self.backend.condition(&url) {
                Ok(EntryCondition::Validating) if Instant::now() < deadline => continue,
                Ok(EntryCondition::Validating) => {
                    tracing::warn!(url = %url, "Cache validation timed out");
                    break None;
                }
                _ => break self.open(&url).await,
            }
        };

        let resolved = {
            let mut inner = lock(&self.inner);
            inner.polling.remove(&url);
            inner.drain(None, &url)
        };
        notify_all(resolved, filename, false);
    }

    async fn open(&self, url: &str) -> Option<PathBuf> {
        match self.backend.open_entry(url).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::debug!(url, error = %e, "Cache entry unavailable");
                None
            }
        }
    }
}

fn notify_all(requests: Vec<PendingRequest>, filename: Option<PathBuf>, invalid: bool) {
    for request in requests {
        let resolution = CacheResolution {
            request_id: request.request_id,
            url: request.url,
            filename: filename.clone(),
            invalid,
        };
        if request.observer.send(resolution).is_err() {
            tracing::debug!(request_id = %request.request_id, "Cache observer gone");
        }
    }
}
