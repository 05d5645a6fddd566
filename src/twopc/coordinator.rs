//! Two-Phase Commit Coordinator
//!
//! Drives one relocation across exactly two participants:
//!
//! ```text
//! BEGIN src → BEGIN dst → move rows → PREPARE src → PREPARE dst
//!     → COMMIT PREPARED src → COMMIT PREPARED dst → purge src
//! ```
//!
//! Any failure before the first `COMMIT PREPARED` aborts both branches.
//! After it, or when a branch cannot be confirmed rolled back, a failure is
//! reported as [`CoordinatorError::Divergence`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::branch::{TransactionBranch, bounded};
use super::error::{BranchSnapshot, CoordinatorError, TransferFailure};
use super::participant::Participant;
use super::pipeline::TransferPipeline;
use super::state::BranchState;
use super::types::{BranchId, BranchRole, OperationId};
use crate::config::TransferConfig;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub phase_timeout: Duration,
    /// Roll both branches back right after PREPARE, as if the coordinator
    /// died before deciding.
    pub simulate_crash: bool,
    pub purge_source: bool,
    pub branch_prefix: String,
}

impl CoordinatorOptions {
    pub fn from_config(config: &TransferConfig, simulate_crash: bool) -> Self {
        Self {
            phase_timeout: config.phase_timeout(),
            simulate_crash,
            purge_source: config.purge_source,
            branch_prefix: config.branch_prefix.clone(),
        }
    }
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default(), false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransferOutcome {
    Committed,
    CrashSimulated,
}

impl fmt::Display for TransferOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferOutcome::Committed => write!(f, "COMMITTED"),
            TransferOutcome::CrashSimulated => write!(f, "CRASH_SIMULATED"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferReport {
    pub operation_id: OperationId,
    pub outcome: TransferOutcome,
    pub moved_ids: Vec<i32>,
    pub source: BranchSnapshot,
    pub target: BranchSnapshot,
    pub source_purged: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl TransferReport {
    pub fn moved(&self) -> usize {
        self.moved_ids.len()
    }
}

pub struct TwoPhaseCommitCoordinator {
    options: CoordinatorOptions,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(options: CoordinatorOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    /// Relocate every row from `source` to `target` atomically.
    pub async fn run(
        &self,
        source: Box<dyn Participant>,
        target: Box<dyn Participant>,
    ) -> Result<TransferReport, TransferFailure> {
        let operation_id = OperationId::new();
        let started_at = Utc::now();
        let prefix = &self.options.branch_prefix;
        let limit = self.options.phase_timeout;

        let mut src = TransactionBranch::new(
            BranchRole::Source,
            BranchId::new(prefix, operation_id, BranchRole::Source),
            limit,
            source,
        );
        let mut dst = TransactionBranch::new(
            BranchRole::Target,
            BranchId::new(prefix, operation_id, BranchRole::Target),
            limit,
            target,
        );

        info!(
            op_id = %operation_id,
            source = %src.node(),
            target = %dst.node(),
            src_gid = %src.gid(),
            dst_gid = %dst.gid(),
            "Relocation started"
        );

        let moved_ids = match self.prepare_phase(&mut src, &mut dst).await {
            Ok(ids) => ids,
            Err(e) => {
                Self::abort_all(&mut src, &mut dst).await;
                let e = match Self::unsettled(&src, &dst) {
                    (committed, in_doubt) if committed.is_empty() && in_doubt.is_empty() => {
                        warn!(op_id = %operation_id, code = e.code(), error = %e, "Relocation aborted");
                        e
                    }
                    (committed, in_doubt) => {
                        error!(
                            op_id = %operation_id,
                            source = %src.snapshot(),
                            target = %dst.snapshot(),
                            error = %e,
                            "Prepare outcome unknown, operator recovery required"
                        );
                        CoordinatorError::Divergence {
                            committed,
                            in_doubt,
                            cause: Box::new(e),
                        }
                    }
                };
                return Err(Self::failure(e, &src, &dst));
            }
        };

        if self.options.simulate_crash {
            warn!(op_id = %operation_id, "Simulating coordinator crash after PREPARE");
            let src_abort = src.abort().await;
            let dst_abort = dst.abort().await;
            if let Err(e) = src_abort.and(dst_abort) {
                error!(op_id = %operation_id, error = %e, "ROLLBACK PREPARED failed");
                return Err(Self::failure(e, &src, &dst));
            }
            return Ok(self.report(
                operation_id,
                TransferOutcome::CrashSimulated,
                moved_ids,
                &src,
                &dst,
                false,
                started_at,
            ));
        }

        if let Err(e) = self.commit_phase(&mut src, &mut dst).await {
            if e.is_divergence() {
                error!(
                    op_id = %operation_id,
                    source = %src.snapshot(),
                    target = %dst.snapshot(),
                    error = %e,
                    "PARTIAL COMMIT: participants diverged, operator recovery required"
                );
            } else {
                warn!(op_id = %operation_id, error = %e, "Commit failed, both branches rolled back");
            }
            return Err(Self::failure(e, &src, &dst));
        }

        let source_purged = self.options.purge_source && Self::purge(&mut src).await;

        info!(
            op_id = %operation_id,
            moved = moved_ids.len(),
            source_purged,
            "Relocation committed"
        );
        Ok(self.report(
            operation_id,
            TransferOutcome::Committed,
            moved_ids,
            &src,
            &dst,
            source_purged,
            started_at,
        ))
    }

    /// Steps up to and including PREPARE on both branches
    async fn prepare_phase(
        &self,
        src: &mut TransactionBranch,
        dst: &mut TransactionBranch,
    ) -> Result<Vec<i32>, CoordinatorError> {
        src.begin().await?;
        dst.begin().await?;

        let moved = TransferPipeline::run(src, dst).await?;
        debug!(rows = moved.len(), "Rows staged on target");

        src.prepare().await?;
        dst.prepare().await?;
        Ok(moved)
    }

    async fn commit_phase(
        &self,
        src: &mut TransactionBranch,
        dst: &mut TransactionBranch,
    ) -> Result<(), CoordinatorError> {
        if let Err(cause) = src.commit().await {
            // The source's fate is unknown if its rollback fails too
            Self::abort_all(src, dst).await;
            return match Self::unsettled(src, dst) {
                (committed, in_doubt) if committed.is_empty() && in_doubt.is_empty() => Err(cause),
                (committed, in_doubt) => Err(CoordinatorError::Divergence {
                    committed,
                    in_doubt,
                    cause: Box::new(cause),
                }),
            };
        }

        // Rolling the target back now would lose the rows; leave it prepared.
        if let Err(cause) = dst.commit().await {
            let (committed, in_doubt) = Self::unsettled(src, dst);
            return Err(CoordinatorError::Divergence {
                committed,
                in_doubt,
                cause: Box::new(cause),
            });
        }
        Ok(())
    }

    /// Committed and still-prepared gids across both branches
    fn unsettled(
        src: &TransactionBranch,
        dst: &TransactionBranch,
    ) -> (Vec<BranchId>, Vec<BranchId>) {
        let mut committed = Vec::new();
        let mut in_doubt = Vec::new();
        for branch in [src, dst] {
            match branch.state() {
                BranchState::Committed => committed.push(branch.gid().clone()),
                BranchState::Prepared => in_doubt.push(branch.gid().clone()),
                _ => {}
            }
        }
        (committed, in_doubt)
    }

    /// Best-effort abort of every non-terminal branch
    async fn abort_all(src: &mut TransactionBranch, dst: &mut TransactionBranch) {
        for branch in [src, dst] {
            if branch.state().is_terminal() {
                continue;
            }
            if let Err(e) = branch.abort().await {
                error!(
                    role = %branch.role(),
                    gid = %branch.gid(),
                    node = %branch.node(),
                    state = %branch.state(),
                    error = %e,
                    "Abort failed, branch left in doubt"
                );
            }
        }
    }

    async fn purge(src: &mut TransactionBranch) -> bool {
        let limit = src.timeout();
        match bounded(limit, src.participant().purge()).await {
            Ok(()) => {
                info!(node = %src.node(), "Source table dropped");
                true
            }
            Err(e) => {
                warn!(node = %src.node(), error = %e, "Source purge failed");
                false
            }
        }
    }

    fn failure(
        error: CoordinatorError,
        src: &TransactionBranch,
        dst: &TransactionBranch,
    ) -> TransferFailure {
        TransferFailure {
            error,
            source_branch: src.snapshot(),
            target_branch: dst.snapshot(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        operation_id: OperationId,
        outcome: TransferOutcome,
        moved_ids: Vec<i32>,
        src: &TransactionBranch,
        dst: &TransactionBranch,
        source_purged: bool,
        started_at: DateTime<Utc>,
    ) -> TransferReport {
        TransferReport {
            operation_id,
            outcome,
            moved_ids,
            source: src.snapshot(),
            target: dst.snapshot(),
            source_purged,
            started_at,
            finished_at: Utc::now(),
        }
    }
}
