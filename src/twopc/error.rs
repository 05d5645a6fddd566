//! 2PC Error Types

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use super::state::BranchState;
use crate::db::error::sqlstate;
use super::types::{BranchId, BranchRole};

/// Protocol step in which a failure happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Begin,
    Prepare,
    Commit,
    Rollback,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Begin => "BEGIN",
            Phase::Prepare => "PREPARE",
            Phase::Commit => "COMMIT",
            Phase::Rollback => "ROLLBACK",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure reported by a single participant call
#[derive(Error, Debug)]
pub enum ParticipantError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Rejected(String),

    #[error("prepared transaction {0} does not exist")]
    UnknownBranch(String),
}

impl ParticipantError {
    /// The server has no prepared transaction under the given gid
    /// (SQLSTATE 42704 for `COMMIT/ROLLBACK PREPARED`)
    pub fn is_unknown_branch(&self) -> bool {
        match self {
            ParticipantError::UnknownBranch(_) => true,
            ParticipantError::Database(e) => sqlstate(e).as_deref() == Some("42704"),
            _ => false,
        }
    }
}

/// Row read/write failure while moving data between branches
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("reading rows from {node} failed: {cause}")]
    Read {
        node: String,
        #[source]
        cause: ParticipantError,
    },

    #[error("inserting id {id} into {node} failed: {cause}")]
    Write {
        node: String,
        id: i32,
        #[source]
        cause: ParticipantError,
    },
}

/// Begin/prepare/commit/rollback failure on one branch
#[derive(Error, Debug)]
#[error("{phase} failed on {role} branch {gid} (node {node}): {cause}")]
pub struct ProtocolError {
    pub phase: Phase,
    pub role: BranchRole,
    pub node: String,
    pub gid: BranchId,
    #[source]
    pub cause: ParticipantError,
}

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid transition on {role} branch {gid}: {from} -> {to}")]
    InvalidTransition {
        role: BranchRole,
        gid: BranchId,
        from: BranchState,
        to: BranchState,
    },

    /// A failure left a branch committed or with an unknown outcome, so
    /// the participants disagree or may disagree. Needs operator resolution.
    #[error(
        "PARTIAL COMMIT: committed [{}], in doubt [{}]: {cause}",
        join_gids(.committed),
        join_gids(.in_doubt)
    )]
    Divergence {
        committed: Vec<BranchId>,
        in_doubt: Vec<BranchId>,
        #[source]
        cause: Box<CoordinatorError>,
    },
}

fn join_gids(gids: &[BranchId]) -> String {
    gids.iter()
        .map(BranchId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

impl CoordinatorError {
    pub fn code(&self) -> &'static str {
        match self {
            CoordinatorError::Transfer(_) => "TRANSFER_FAILED",
            CoordinatorError::Protocol(e) => match e.phase {
                Phase::Begin => "BEGIN_FAILED",
                Phase::Prepare => "PREPARE_FAILED",
                Phase::Commit => "COMMIT_FAILED",
                Phase::Rollback => "ROLLBACK_FAILED",
            },
            CoordinatorError::InvalidTransition { .. } => "INVALID_STATE_TRANSITION",
            CoordinatorError::Divergence { .. } => "PARTIAL_COMMIT",
        }
    }

    #[inline]
    pub fn is_divergence(&self) -> bool {
        matches!(self, CoordinatorError::Divergence { .. })
    }

    /// Phase of the protocol error at the root of this failure, if any
    pub fn phase(&self) -> Option<Phase> {
        match self {
            CoordinatorError::Protocol(e) => Some(e.phase),
            CoordinatorError::Divergence { cause, .. } => cause.phase(),
            _ => None,
        }
    }
}

/// Final view of one branch, for reports and failures
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchSnapshot {
    pub role: BranchRole,
    pub node: String,
    pub gid: BranchId,
    pub state: BranchState,
}

impl fmt::Display for BranchSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}={}", self.role, self.node, self.gid, self.state)
    }
}

/// A failed coordinator run, with where both branches ended up
#[derive(Error, Debug)]
#[error("{error} [{source_branch}; {target_branch}]")]
pub struct TransferFailure {
    #[source]
    pub error: CoordinatorError,
    pub source_branch: BranchSnapshot,
    pub target_branch: BranchSnapshot,
}

impl TransferFailure {
    pub fn code(&self) -> &'static str {
        self.error.code()
    }

    pub fn is_divergence(&self) -> bool {
        self.error.is_divergence()
    }

    /// Both branches reached ABORTED
    pub fn fully_aborted(&self) -> bool {
        self.source_branch.state == BranchState::Aborted
            && self.target_branch.state == BranchState::Aborted
    }
}

/// Failures of the in-doubt inspection/resolution pass
#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("node {node}: listing prepared transactions failed: {source}")]
    Query {
        node: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("node {node}: resolving {gid} failed: {source}")]
    Resolve {
        node: String,
        gid: BranchId,
        #[source]
        source: sqlx::Error,
    },

    #[error("no connection to node {node} for {gid}")]
    NoConnection { node: String, gid: BranchId },
}

impl RecoveryError {
    pub fn code(&self) -> &'static str {
        match self {
            RecoveryError::Query { .. } => "RECOVERY_QUERY_FAILED",
            RecoveryError::Resolve { .. } => "RECOVERY_RESOLVE_FAILED",
            RecoveryError::NoConnection { .. } => "RECOVERY_NO_CONNECTION",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twopc::types::OperationId;

    fn protocol(phase: Phase) -> ProtocolError {
        ProtocolError {
            phase,
            role: BranchRole::Target,
            node: "B".to_string(),
            gid: BranchId::new("relocate", OperationId::new(), BranchRole::Target),
            cause: ParticipantError::Rejected("boom".to_string()),
        }
    }

    #[test]
    fn test_protocol_error_names_phase_branch_and_node() {
        let msg = protocol(Phase::Prepare).to_string();
        assert!(msg.starts_with("PREPARE failed on TARGET branch relocate_"));
        assert!(msg.contains("(node B): boom"));
    }

    #[test]
    fn test_codes_by_phase() {
        assert_eq!(
            CoordinatorError::from(protocol(Phase::Commit)).code(),
            "COMMIT_FAILED"
        );
        assert_eq!(
            CoordinatorError::from(protocol(Phase::Begin)).code(),
            "BEGIN_FAILED"
        );
    }

    #[test]
    fn test_unknown_branch_detection() {
        assert!(ParticipantError::UnknownBranch("relocate_x_src".into()).is_unknown_branch());
        assert!(!ParticipantError::Timeout(Duration::from_millis(5)).is_unknown_branch());
        assert!(!ParticipantError::Rejected("boom".into()).is_unknown_branch());
    }

    #[test]
    fn test_divergence_is_distinguishable() {
        let cause = CoordinatorError::from(protocol(Phase::Commit));
        let gid = BranchId::new("relocate", OperationId::new(), BranchRole::Source);
        let err = CoordinatorError::Divergence {
            committed: vec![gid.clone()],
            in_doubt: vec![],
            cause: Box::new(cause),
        };

        assert!(err.is_divergence());
        assert_eq!(err.code(), "PARTIAL_COMMIT");
        assert_eq!(err.phase(), Some(Phase::Commit));
        assert!(err.to_string().starts_with("PARTIAL COMMIT: committed ["));
        assert!(err.to_string().contains(gid.as_str()));
    }
}
