//! In-doubt branch recovery
//!
//! Finds prepared transactions this tool left behind (gids carrying the
//! configured prefix) and settles them on operator request. The source is
//! always committed before the target, which decides what is safe:
//!
//! | prepared branches | meaning                              | resolution              |
//! |-------------------|--------------------------------------|-------------------------|
//! | src + dst         | no COMMIT PREPARED issued            | SafeToRollback          |
//! | src only          | target already rolled back           | SafeToRollback          |
//! | dst only          | source committed, or was rolled back | NeedsOperatorDecision   |
//!
//! Operations with a branch prepared less than the configured minimum age
//! ago may still be driven by a live run and are left out. Nothing runs
//! automatically.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

use super::error::RecoveryError;
use super::postgres::finish_prepared;
use super::types::{BranchId, BranchRole, OperationId};
use crate::db::ConnectionHandle;

/// One prepared transaction found on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InDoubtBranch {
    pub node: String,
    pub gid: BranchId,
    pub operation_id: OperationId,
    pub role: BranchRole,
    pub prepared_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resolution {
    SafeToRollback,
    NeedsOperatorDecision,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resolution::SafeToRollback => write!(f, "SAFE_TO_ROLLBACK"),
            Resolution::NeedsOperatorDecision => write!(f, "NEEDS_OPERATOR_DECISION"),
        }
    }
}

/// All in-doubt branches of one relocation run
#[derive(Debug, Clone, Serialize)]
pub struct InDoubtOperation {
    pub operation_id: OperationId,
    pub branches: Vec<InDoubtBranch>,
    pub resolution: Resolution,
}

/// Operator's verdict for branches that need one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Decision {
    Commit,
    Rollback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionAction {
    Committed,
    RolledBack,
    /// Needs a decision and none was given
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResolvedBranch {
    pub node: String,
    pub gid: BranchId,
    pub action: ResolutionAction,
}

/// Prepared transactions in the connected database whose gid carries `prefix`
pub async fn list_in_doubt(
    handle: &mut ConnectionHandle,
    prefix: &str,
) -> Result<Vec<InDoubtBranch>, RecoveryError> {
    let node = handle.node().to_string();
    let rows: Vec<(String, Option<DateTime<Utc>>)> = sqlx::query_as(
        "SELECT gid, prepared FROM pg_prepared_xacts \
         WHERE database = current_database() AND left(gid, length($1)) = $1 \
         ORDER BY prepared",
    )
    .bind(prefix)
    .fetch_all(handle.conn())
    .await
    .map_err(|source| RecoveryError::Query {
        node: node.clone(),
        source,
    })?;

    let branches = rows
        .into_iter()
        .filter_map(|(gid, prepared_at)| {
            let parsed = BranchId::parse(&gid, prefix);
            if parsed.is_none() {
                warn!(node = %node, gid = %gid, "Ignoring foreign prepared transaction");
            }
            let (gid, operation_id, role) = parsed?;
            Some(InDoubtBranch {
                node: node.clone(),
                gid,
                operation_id,
                role,
                prepared_at,
            })
        })
        .collect();
    Ok(branches)
}

/// Group branches by operation and decide what is safe
pub fn classify(branches: Vec<InDoubtBranch>) -> Vec<InDoubtOperation> {
    let mut by_op: BTreeMap<OperationId, Vec<InDoubtBranch>> = BTreeMap::new();
    for branch in branches {
        by_op.entry(branch.operation_id).or_default().push(branch);
    }

    by_op
        .into_iter()
        .map(|(operation_id, branches)| {
            let source_prepared = branches.iter().any(|b| b.role == BranchRole::Source);
            let resolution = if source_prepared {
                Resolution::SafeToRollback
            } else {
                Resolution::NeedsOperatorDecision
            };
            InDoubtOperation {
                operation_id,
                branches,
                resolution,
            }
        })
        .collect()
}

/// Operations whose newest branch was prepared at least `min_age` before
/// `now`. A branch without a timestamp counts as old.
pub fn older_than(
    operations: Vec<InDoubtOperation>,
    min_age: Duration,
    now: DateTime<Utc>,
) -> Vec<InDoubtOperation> {
    operations
        .into_iter()
        .filter(|op| {
            let youngest = op
                .branches
                .iter()
                .filter_map(|b| b.prepared_at)
                .map(|at| (now - at).to_std().unwrap_or_default())
                .min();
            match youngest {
                Some(age) if age < min_age => {
                    info!(
                        op_id = %op.operation_id,
                        age_ms = age.as_millis() as u64,
                        "Skipping recently prepared operation"
                    );
                    false
                }
                _ => true,
            }
        })
        .collect()
}

/// What `resolve` would do with one branch
pub fn planned_action(resolution: Resolution, decision: Option<Decision>) -> ResolutionAction {
    match (resolution, decision) {
        (Resolution::SafeToRollback, _) => ResolutionAction::RolledBack,
        (Resolution::NeedsOperatorDecision, Some(Decision::Commit)) => ResolutionAction::Committed,
        (Resolution::NeedsOperatorDecision, Some(Decision::Rollback)) => {
            ResolutionAction::RolledBack
        }
        (Resolution::NeedsOperatorDecision, None) => ResolutionAction::Skipped,
    }
}

/// Settle `operations` over `handles` (one per node, matched by node name)
pub async fn resolve(
    handles: &mut [ConnectionHandle],
    operations: &[InDoubtOperation],
    decision: Option<Decision>,
) -> Result<Vec<ResolvedBranch>, RecoveryError> {
    let mut resolved = Vec::new();

    for op in operations {
        let action = planned_action(op.resolution, decision);
        for branch in &op.branches {
            if action != ResolutionAction::Skipped {
                let handle = handles
                    .iter_mut()
                    .find(|h| h.node() == branch.node)
                    .ok_or_else(|| RecoveryError::NoConnection {
                        node: branch.node.clone(),
                        gid: branch.gid.clone(),
                    })?;
                let commit = action == ResolutionAction::Committed;
                finish_prepared(handle.conn(), &branch.gid, commit)
                    .await
                    .map_err(|source| RecoveryError::Resolve {
                        node: branch.node.clone(),
                        gid: branch.gid.clone(),
                        source,
                    })?;
            }

            info!(
                op_id = %op.operation_id,
                node = %branch.node,
                gid = %branch.gid,
                resolution = %op.resolution,
                action = ?action,
                "In-doubt branch handled"
            );
            resolved.push(ResolvedBranch {
                node: branch.node.clone(),
                gid: branch.gid.clone(),
                action,
            });
        }
    }
    Ok(resolved)
}
