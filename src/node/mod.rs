//! Node Lifecycle
//!
//! Manages the server process behind each participant.
//!
//! # State Machine
//!
//! ```text
//! ABSENT → CREATED → RUNNING ⇄ STOPPED
//!    ↑        │                  │
//!    └────────┴──── destroy ─────┘
//! ```
//!
//! A running node can never be destroyed. Every transition takes `&mut Node`,
//! and the only way to get one is through the [`NodeRegistry`] lock, so two
//! tasks can never transition the same storage area at once.

pub mod control;
pub mod error;
pub mod host;
pub mod registry;
pub mod status;

use serde::Serialize;
use std::fmt;
use std::path::Path;

use crate::config::NodeConfig;

pub use control::{CommandOutput, ControlTool, PgCtl};
pub use error::{LifecycleError, ProbeError};
pub use host::ProcessHost;
pub use registry::{NodeRegistry, SharedNode};
pub use status::StatusClassifier;

/// Result of a status probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    Running,
    Stopped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Running => "RUNNING",
            NodeStatus::Stopped => "STOPPED",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Last observed lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Absent,
    Created,
    Running,
    Stopped,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Absent => "ABSENT",
            NodeState::Created => "CREATED",
            NodeState::Running => "RUNNING",
            NodeState::Stopped => "STOPPED",
        }
    }

    /// Only a non-running storage area may be removed
    #[inline]
    pub fn is_destroyable(&self) -> bool {
        matches!(self, NodeState::Created | NodeState::Stopped)
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl From<NodeStatus> for NodeState {
    fn from(status: NodeStatus) -> Self {
        match status {
            NodeStatus::Running => NodeState::Running,
            NodeStatus::Stopped => NodeState::Stopped,
        }
    }
}

/// One database server instance
#[derive(Debug)]
pub struct Node {
    config: NodeConfig,
    state: NodeState,
}

impl Node {
    pub(crate) fn new(config: NodeConfig) -> Self {
        Self {
            config,
            state: NodeState::Absent,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn data_dir(&self) -> &Path {
        &self.config.data_dir
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    pub fn port(&self) -> u16 {
        self.config.port
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: NodeState) {
        self.state = state;
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}:{}, {})",
            self.config.name,
            self.config.host,
            self.config.port,
            self.config.data_dir.display()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destroyable_states() {
        assert!(NodeState::Created.is_destroyable());
        assert!(NodeState::Stopped.is_destroyable());
        assert!(!NodeState::Running.is_destroyable());
        assert!(!NodeState::Absent.is_destroyable());
    }

    #[test]
    fn test_status_to_state() {
        assert_eq!(NodeState::from(NodeStatus::Running), NodeState::Running);
        assert_eq!(NodeState::from(NodeStatus::Stopped), NodeState::Stopped);
        assert_eq!(NodeStatus::Stopped.to_string(), "STOPPED");
    }
}
