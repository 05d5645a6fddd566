//! Lifecycle Error Types

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Status probe failures other than "server is not running"
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("node {node}: cannot inspect {}: {source}", path.display())]
    Io {
        node: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("node {node}: {} exists but is not a directory", path.display())]
    NotADirectory { node: String, path: PathBuf },

    #[error("node {node}: failed to run status command: {source}")]
    Command {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("node {node}: status check failed ({status}): {output}")]
    Status {
        node: String,
        status: String,
        output: String,
    },
}

/// Precondition and execution failures of create/start/stop/destroy
#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("node {node}: storage area already exists at {}", path.display())]
    AlreadyExists { node: String, path: PathBuf },

    #[error("node {node}: no storage area at {}", path.display())]
    NotCreated { node: String, path: PathBuf },

    #[error("node {node}: server is already running")]
    AlreadyRunning { node: String },

    #[error("node {node}: server is not running")]
    NotRunning { node: String },

    #[error("node {node}: cannot destroy a running server")]
    StillRunning { node: String },

    #[error("node {node}: initdb failed ({status}): {output}")]
    InitializationFailed {
        node: String,
        status: String,
        output: String,
    },

    #[error("node {node}: failed to launch server: {source}")]
    LaunchFailed {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("node {node}: failed to run stop command: {source}")]
    StopFailed {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("node {node}: failed to remove storage area: {source}")]
    DestroyFailed {
        node: String,
        #[source]
        source: io::Error,
    },

    #[error("node {node}: server not running after {waited:?}")]
    NotReady { node: String, waited: Duration },

    #[error("storage area {} is registered twice (nodes {first} and {second})", path.display())]
    DuplicateStorageArea {
        path: PathBuf,
        first: String,
        second: String,
    },

    #[error(transparent)]
    Probe(#[from] ProbeError),
}

impl ProbeError {
    pub fn code(&self) -> &'static str {
        match self {
            ProbeError::Io { .. } => "PROBE_IO",
            ProbeError::NotADirectory { .. } => "PROBE_NOT_A_DIRECTORY",
            ProbeError::Command { .. } => "PROBE_COMMAND",
            ProbeError::Status { .. } => "PROBE_STATUS",
        }
    }
}

impl LifecycleError {
    pub fn code(&self) -> &'static str {
        match self {
            LifecycleError::AlreadyExists { .. } => "ALREADY_EXISTS",
            LifecycleError::NotCreated { .. } => "NOT_CREATED",
            LifecycleError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            LifecycleError::NotRunning { .. } => "NOT_RUNNING",
            LifecycleError::StillRunning { .. } => "STILL_RUNNING",
            LifecycleError::InitializationFailed { .. } => "INITIALIZATION_FAILED",
            LifecycleError::LaunchFailed { .. } => "LAUNCH_FAILED",
            LifecycleError::StopFailed { .. } => "STOP_FAILED",
            LifecycleError::DestroyFailed { .. } => "DESTROY_FAILED",
            LifecycleError::NotReady { .. } => "NOT_READY",
            LifecycleError::DuplicateStorageArea { .. } => "DUPLICATE_STORAGE_AREA",
            LifecycleError::Probe(e) => e.code(),
        }
    }

    pub fn is_probe(&self) -> bool {
        matches!(self, LifecycleError::Probe(_))
    }
}
