//! Directory-backed cache.
//!
//! Remote (`http`/`https`) entries are stored under a name derived from the
//! URL (uuid v5) keeping the original extension, so workers can sniff the
//! format. `file` URLs are their own entry.
//!
//! Stored remote entries are indexed in memory (seeded from the directory on
//! open) so probing a remote URL never touches the filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashSet;
use reqwest::Url;

use super::{CacheBackend, CacheError, EntryCondition};

const MAX_EXTENSION_LEN: usize = 8;

enum Source {
    Remote(PathBuf),
    Local(PathBuf),
    Unsupported,
}

pub struct DiskCache {
    dir: PathBuf,
    client: reqwest::Client,
    /// URLs with a download running.
    in_flight: DashSet<String>,
    /// Entry paths present in `dir`.
    stored: DashSet<PathBuf>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        let stored = DashSet::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let is_partial = entry.file_name().to_string_lossy().starts_with('.');
            if !is_partial && entry.file_type()?.is_file() {
                stored.insert(entry.path());
            }
        }
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| CacheError::Fetch(e.to_string()))?;
        tracing::debug!(dir = %dir.display(), entries = stored.len(), "Opened disk cache");
        Ok(Self {
            dir,
            client,
            in_flight: DashSet::new(),
            stored,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, url: &Url) -> PathBuf {
        let name = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, url.as_str().as_bytes());
        match extension(url) {
            Some(ext) => self.dir.join(format!("{name}.{ext}")),
            None => self.dir.join(name.to_string()),
        }
    }

    fn source(&self, url: &str) -> Result<Source, CacheError> {
        let parsed = Url::parse(url).map_err(|_| CacheError::UnsupportedUrl(url.to_string()))?;
        Ok(match parsed.scheme() {
            "http" | "https" => Source::Remote(self.entry_path(&parsed)),
            "file" => match parsed.to_file_path() {
                Ok(path) => Source::Local(path),
                Err(()) => Source::Unsupported,
            },
            _ => Source::Unsupported,
        })
    }

    async fn download(&self, url: &str, entry: &Path) -> Result<u16, CacheError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CacheError::Fetch(e.to_string()))?;
        let status = response.status().as_u16();
        if status != 200 {
            return Ok(status);
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| CacheError::Fetch(e.to_string()))?;
        if let Err(e) = self.store(entry, &body).await {
            tracing::warn!(url, error = %e, "Fetched resource could not be cached");
        } else {
            tracing::debug!(url, entry = %entry.display(), size_bytes = body.len(), "Cached resource");
        }
        Ok(status)
    }

    async fn store(&self, entry: &Path, body: &[u8]) -> std::io::Result<()> {
        let partial = self.dir.join(format!(".{}.part", uuid::Uuid::new_v4()));
        tokio::fs::write(&partial, body).await?;
        if let Err(e) = tokio::fs::rename(&partial, entry).await {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
        self.stored.insert(entry.to_path_buf());
        Ok(())
    }
}

/// Short alphanumeric extension of the URL's last path segment.
fn extension(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    if ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

struct InFlight<'a> {
    set: &'a DashSet<String>,
    url: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.url);
    }
}

#[async_trait]
impl CacheBackend for DiskCache {
    fn condition(&self, url: &str) -> Result<EntryCondition, CacheError> {
        if self.in_flight.contains(url) {
            return Ok(EntryCondition::Validating);
        }
        Ok(match self.source(url)? {
            Source::Remote(path) if self.stored.contains(&path) => EntryCondition::Ready(path),
            Source::Local(path) if path.is_file() => EntryCondition::Ready(path),
            Source::Remote(_) | Source::Local(_) => EntryCondition::Absent,
            Source::Unsupported => EntryCondition::NotDiskBacked,
        })
    }

    async fn fetch(&self, url: &str) -> Result<u16, CacheError> {
        match self.source(url)? {
            Source::Remote(entry) => {
                self.in_flight.insert(url.to_string());
                let _guard = InFlight {
                    set: &self.in_flight,
                    url: url.to_string(),
                };
                self.download(url, &entry).await
            }
            Source::Local(path) => {
                tokio::fs::metadata(&path).await?;
                Ok(0)
            }
            Source::Unsupported => Err(CacheError::UnsupportedUrl(url.to_string())),
        }
    }

    async fn open_entry(&self, url: &str) -> Result<PathBuf, CacheError> {
        match self.source(url)? {
            Source::Remote(path) | Source::Local(path) => {
                match tokio::fs::metadata(&path).await {
                    Ok(meta) if meta.is_file() => Ok(path),
                    _ => {
                        self.stored.remove(&path);
                        Err(CacheError::NotCached(url.to_string()))
                    }
                }
            }
            Source::Unsupported => Err(CacheError::UnsupportedUrl(url.to_string())),
        }
    }
}
