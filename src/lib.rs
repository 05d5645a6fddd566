//! pg_relocate - all-or-nothing data relocation between two PostgreSQL servers
//!
//! Manages two local server instances and moves a table's rows from one to
//! the other inside a single two-phase commit.
//!
//! # Modules
//!
//! - [`node`] - server lifecycle (initdb / pg_ctl)
//! - [`db`] - connections and schema bootstrap
//! - [`twopc`] - two-phase commit coordinator, participants, recovery
//! - [`relocation`] - end-to-end flow over both nodes
//! - [`command`] - explicit commands and the dispatcher
//! - [`config`] - YAML configuration
//! - [`logging`] - tracing setup

pub mod command;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod node;
pub mod relocation;
pub mod twopc;

// Convenient re-exports at crate root
pub use command::{Cli, Command, Dispatcher, NodeAction, NodeOutcome, Report};
pub use config::{AppConfig, ConfigError};
pub use error::RelocateError;
pub use node::{LifecycleError, NodeState, NodeStatus, ProcessHost, StatusClassifier};
pub use relocation::{Relocation, RelocationReport};
pub use twopc::{
    CoordinatorError, Decision, TransferFailure, TransferOutcome, TransferReport,
    TwoPhaseCommitCoordinator,
};
