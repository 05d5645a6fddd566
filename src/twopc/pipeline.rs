//! Transfer pipeline
//!
//! Streams rows out of the source branch and into the target branch, one
//! at a time, so memory use does not grow with the table.

use futures::StreamExt;
use tracing::debug;

use super::branch::{TransactionBranch, bounded};
use super::error::{CoordinatorError, TransferError};
use super::state::BranchState;

pub struct TransferPipeline;

impl TransferPipeline {
    /// Move every source row into the target. Both branches must be ACTIVE.
    /// Returns the moved ids in read order.
    pub async fn run(
        source: &mut TransactionBranch,
        target: &mut TransactionBranch,
    ) -> Result<Vec<i32>, CoordinatorError> {
        for branch in [&*source, &*target] {
            if branch.state() != BranchState::Active {
                return Err(CoordinatorError::InvalidTransition {
                    role: branch.role(),
                    gid: branch.gid().clone(),
                    from: branch.state(),
                    to: BranchState::Active,
                });
            }
        }

        let source_node = source.node().to_string();
        let target_node = target.node().to_string();
        let source_limit = source.timeout();
        let target_limit = target.timeout();

        let mut moved = Vec::new();
        let mut rows = source.participant().drain_records();

        loop {
            let next = bounded(source_limit, async { rows.next().await.transpose() })
                .await
                .map_err(|cause| TransferError::Read {
                    node: source_node.clone(),
                    cause,
                })?;
            let Some(record) = next else { break };

            bounded(target_limit, target.participant().stage_insert(&record))
                .await
                .map_err(|cause| TransferError::Write {
                    node: target_node.clone(),
                    id: record.id,
                    cause,
                })?;

            debug!(id = record.id, from = %source_node, to = %target_node, "Row staged");
            moved.push(record.id);
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twopc::participant::{FailPoint, MockParticipant};
    use crate::twopc::types::{BranchId, BranchRole, OperationId};
    use std::time::Duration;

    fn pair(src: MockParticipant, dst: MockParticipant) -> (TransactionBranch, TransactionBranch) {
        let op = OperationId::new();
        let limit = Duration::from_millis(200);
        (
            TransactionBranch::new(
                BranchRole::Source,
                BranchId::new("relocate", op, BranchRole::Source),
                limit,
                Box::new(src),
            ),
            TransactionBranch::new(
                BranchRole::Target,
                BranchId::new("relocate", op, BranchRole::Target),
                limit,
                Box::new(dst),
            ),
        )
    }

    #[tokio::test]
    async fn test_moves_all_rows_in_order() {
        let (mut s, mut t) = pair(MockParticipant::seeded("A", 5), MockParticipant::new("B"));
        s.begin().await.unwrap();
        t.begin().await.unwrap();

        let ids = TransferPipeline::run(&mut s, &mut t).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_empty_source_moves_nothing() {
        let (mut s, mut t) = pair(MockParticipant::new("A"), MockParticipant::new("B"));
        s.begin().await.unwrap();
        t.begin().await.unwrap();

        assert!(TransferPipeline::run(&mut s, &mut t).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_requires_active_branches() {
        let (mut s, mut t) = pair(MockParticipant::seeded("A", 1), MockParticipant::new("B"));
        s.begin().await.unwrap();

        let err = TransferPipeline::run(&mut s, &mut t).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_STATE_TRANSITION");
    }

    #[tokio::test]
    async fn test_read_failure_names_source() {
        let (mut s, mut t) = pair(
            MockParticipant::seeded("A", 5).fail_read_after(2),
            MockParticipant::new("B"),
        );
        s.begin().await.unwrap();
        t.begin().await.unwrap();

        let err = TransferPipeline::run(&mut s, &mut t).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Transfer(TransferError::Read { ref node, .. }) if node == "A"
        ));
    }

    #[tokio::test]
    async fn test_write_failure_names_row() {
        let (mut s, mut t) = pair(
            MockParticipant::seeded("A", 3),
            MockParticipant::new("B").fail_at(FailPoint::Write),
        );
        s.begin().await.unwrap();
        t.begin().await.unwrap();

        let err = TransferPipeline::run(&mut s, &mut t).await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Transfer(TransferError::Write { id: 1, .. })
        ));
    }
}
