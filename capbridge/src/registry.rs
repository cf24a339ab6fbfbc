//! Worker executable lookup by capability name.
//!
//! The broker launches `program <port> <args...>`: the allocated loopback port
//! is always the first argument, configured arguments follow.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// One candidate executable for a capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown capability '{0}'")]
    UnknownService(String),
    #[error("no executables configured for '{0}'")]
    NoExecutables(String),
    #[error("failed to read worker config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse worker config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Source of worker executables, tried in order until one launches.
pub trait WorkerRegistry: Send + Sync {
    fn lookup(&self, service: &str) -> Result<Vec<WorkerCommand>, RegistryError>;
}

fn select(
    services: &HashMap<String, Vec<WorkerCommand>>,
    service: &str,
) -> Result<Vec<WorkerCommand>, RegistryError> {
    match services.get(service) {
        None => Err(RegistryError::UnknownService(service.to_string())),
        Some(commands) if commands.is_empty() => {
            Err(RegistryError::NoExecutables(service.to_string()))
        }
        Some(commands) => Ok(commands.clone()),
    }
}

/// In-memory registry.
#[derive(Debug, Clone, Default)]
pub struct StaticRegistry {
    services: HashMap<String, Vec<WorkerCommand>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(
        mut self,
        service: impl Into<String>,
        commands: impl IntoIterator<Item = WorkerCommand>,
    ) -> Self {
        self.services
            .insert(service.into(), commands.into_iter().collect());
        self
    }
}

impl WorkerRegistry for StaticRegistry {
    fn lookup(&self, service: &str) -> Result<Vec<WorkerCommand>, RegistryError> {
        select(&self.services, service)
    }
}

/// Registry backed by a JSON file of the form
/// `{"speech": [{"program": "/usr/lib/speechd", "args": ["speech"]}]}`.
///
/// The file is re-read on every lookup so edits apply to the next start.
#[derive(Debug, Clone)]
pub struct FileRegistry {
    path: PathBuf,
}

impl FileRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, Vec<WorkerCommand>>, RegistryError> {
        let text = std::fs::read_to_string(&self.path).map_err(|source| RegistryError::Read {
            path: self.path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| RegistryError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

impl WorkerRegistry for FileRegistry {
    fn lookup(&self, service: &str) -> Result<Vec<WorkerCommand>, RegistryError> {
        let services = self.load()?;
        tracing::debug!(path = %self.path.display(), service, "Loaded worker config");
        select(&services, service)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_lookup() {
        let registry = StaticRegistry::new()
            .with_service("speech", [WorkerCommand::new("/bin/speechd").with_args(["speech"])])
            .with_service("audio", Vec::<WorkerCommand>::new());

        let commands = registry.lookup("speech").unwrap();
        assert_eq!(commands[0].program, PathBuf::from("/bin/speechd"));
        assert_eq!(commands[0].args, vec!["speech".to_string()]);

        assert!(matches!(
            registry.lookup("audio"),
            Err(RegistryError::NoExecutables(_))
        ));
        assert!(matches!(
            registry.lookup("video"),
            Err(RegistryError::UnknownService(_))
        ));
    }

    #[test]
    fn file_lookup_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("workers.json");
        std::fs::write(
            &path,
            r#"{"speech": [{"program": "first", "args": ["a"]}, {"program": "second"}]}"#,
        )
        .unwrap();

        let commands = FileRegistry::new(&path).lookup("speech").unwrap();
        let programs: Vec<_> = commands.iter().map(|c| c.program.clone()).collect();
        assert_eq!(programs, vec![PathBuf::from("first"), PathBuf::from("second")]);
        assert!(commands[1].args.is_empty());
    }

    #[test]
    fn unreadable_and_unparseable_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing = FileRegistry::new(dir.path().join("nope.json"));
        assert!(matches!(
            missing.lookup("speech"),
            Err(RegistryError::Read { .. })
        ));

        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            FileRegistry::new(&path).lookup("speech"),
            Err(RegistryError::Parse { .. })
        ));
    }
}
