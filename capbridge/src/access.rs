//! Per-origin permission lookup.

use dashmap::DashMap;
use reqwest::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    Allowed,
    Denied,
    Unset,
}

/// Key/value table of origin permissions, keyed by [`origin_key`].
pub trait PermissionStore: Send + Sync {
    fn get(&self, key: &str) -> Permission;
    fn set(&self, key: &str, permission: Permission);
    fn clear(&self, key: &str);
}

#[derive(Debug, Default)]
pub struct MemoryPermissionStore {
    entries: DashMap<String, Permission>,
}

impl MemoryPermissionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PermissionStore for MemoryPermissionStore {
    fn get(&self, key: &str) -> Permission {
        self.entries
            .get(key)
            .map(|entry| *entry.value())
            .unwrap_or(Permission::Unset)
    }

    fn set(&self, key: &str, permission: Permission) {
        match permission {
            Permission::Unset => {
                self.entries.remove(key);
            }
            permission => {
                self.entries.insert(key.to_string(), permission);
            }
        }
    }

    fn clear(&self, key: &str) {
        self.entries.remove(key);
    }
}

/// `scheme://host[:port]` for `url`; the port only when it is not the
/// scheme's default. None for URLs without a host.
pub fn origin_key(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    let host = url.host_str()?;
    Some(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}
