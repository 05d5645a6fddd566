//! Crate-level error type

use thiserror::Error;

use crate::config::ConfigError;
use crate::db::{ConnectionError, DbError, SchemaError};
use crate::node::LifecycleError;
use crate::twopc::{RecoveryError, TransferFailure};

#[derive(Error, Debug)]
pub enum RelocateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transfer(#[from] TransferFailure),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("unknown node {0}")]
    UnknownNode(String),

    #[error("task failed: {0}")]
    Task(String),
}

impl From<DbError> for RelocateError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Connection(e) => RelocateError::Connection(e),
            DbError::Schema(e) => RelocateError::Schema(e),
        }
    }
}

impl From<tokio::task::JoinError> for RelocateError {
    fn from(err: tokio::task::JoinError) -> Self {
        RelocateError::Task(err.to_string())
    }
}

impl RelocateError {
    pub fn code(&self) -> &'static str {
        match self {
            RelocateError::Config(_) => "CONFIG_ERROR",
            RelocateError::Lifecycle(e) => e.code(),
            RelocateError::Connection(e) => e.code(),
            RelocateError::Schema(e) => e.code(),
            RelocateError::Transfer(e) => e.code(),
            RelocateError::Recovery(e) => e.code(),
            RelocateError::UnknownNode(_) => "UNKNOWN_NODE",
            RelocateError::Task(_) => "TASK_FAILED",
        }
    }

    /// Participants may disagree; operator action needed
    pub fn is_divergence(&self) -> bool {
        matches!(self, RelocateError::Transfer(f) if f.is_divergence())
    }
}
