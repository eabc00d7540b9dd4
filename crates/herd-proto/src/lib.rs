//! Messages exchanged between the coordinator and a spawned herd child.
//! Kept free of runtime code so both ends (and any future tooling) can
//! share the definitions without pulling in tokio.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered key/value options a daemon applies before it starts.
///
/// Insertion order is preserved; setting an existing key replaces its value
/// in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings(Vec<(String, String)>);

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.0.iter_mut().find(|(existing, _)| *existing == key) {
            Some(entry) => entry.1 = value,
            None => self.0.push((key, value)),
        }
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonSpec {
    pub settings: Settings,
    /// Directory wiped before the daemon starts, if any.
    #[serde(default)]
    pub scratch_dir: Option<String>,
}

impl DaemonSpec {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            scratch_dir: None,
        }
    }

    pub fn with_scratch_dir(mut self, dir: impl Into<String>) -> Self {
        self.scratch_dir = Some(dir.into());
        self
    }
}

/// A remote startup step. Executed in place by the child's dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    /// Format and start the storage metadata service (master).
    StorageInit(DaemonSpec),
    /// Start the compute coordinator (master).
    ComputeInit(DaemonSpec),
    /// Start a per-machine storage node (worker).
    StorageStart(DaemonSpec),
    /// Start a per-machine compute node (worker).
    ComputeStart(DaemonSpec),
}

impl Operation {
    pub fn spec(&self) -> &DaemonSpec {
        match self {
            Operation::StorageInit(spec)
            | Operation::ComputeInit(spec)
            | Operation::StorageStart(spec)
            | Operation::ComputeStart(spec) => spec,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Operation::StorageInit(_) => "storage-init",
            Operation::ComputeInit(_) => "compute-init",
            Operation::StorageStart(_) => "storage-start",
            Operation::ComputeStart(_) => "compute-start",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    Ping,
    EnumerateCandidates,
    Execute(Operation),
}

impl Request {
    pub fn label(&self) -> &'static str {
        match self {
            Request::Ping => "ping",
            Request::EnumerateCandidates => "enumerate-candidates",
            Request::Execute(op) => op.label(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    pub message: String,
}

impl RemoteFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Pong,
    Candidates(Vec<String>),
    Done,
    Failed(RemoteFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitMode {
    /// The caller blocks until the remote side answers.
    Await,
    /// Fire-and-forget; the answer is only logged.
    Detach,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope<T> {
    pub id: u64,
    pub mode: SubmitMode,
    pub body: T,
}

/// Largest frame either side accepts.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
