//! Participants
//!
//! A participant is one server's side of the relocation, reached over a
//! single connection. The coordinator owns the branch state machine; the
//! participant only executes statements.

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::error::ParticipantError;
use super::types::{BranchId, TransferRecord};

#[async_trait]
pub trait Participant: Send {
    /// Node name for logging and errors
    fn node(&self) -> &str;

    /// Open a transaction (`BEGIN`)
    async fn begin(&mut self) -> Result<(), ParticipantError>;

    /// Remove all rows inside the open transaction and stream them back,
    /// one row at a time (`DELETE ... RETURNING`).
    fn drain_records(&mut self) -> BoxStream<'_, Result<TransferRecord, ParticipantError>>;

    /// Insert one row, keeping its id, inside the open transaction
    async fn stage_insert(&mut self, record: &TransferRecord) -> Result<(), ParticipantError>;

    /// `PREPARE TRANSACTION`
    async fn prepare(&mut self, gid: &BranchId) -> Result<(), ParticipantError>;

    /// `COMMIT PREPARED`
    async fn commit_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError>;

    /// `ROLLBACK PREPARED`
    async fn rollback_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError>;

    /// `ROLLBACK` of the open transaction
    async fn rollback(&mut self) -> Result<(), ParticipantError>;

    /// Drop the now-empty source structure after a committed relocation
    async fn purge(&mut self) -> Result<(), ParticipantError>;
}

/// In-memory participant for testing
///
/// Models a server with committed rows, one session transaction, and a
/// table of prepared transactions, so tests can assert on what each side
/// would durably hold.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum FailPoint {
        Begin,
        Write,
        Prepare,
        Commit,
        RollbackPrepared,
        Rollback,
        Purge,
        /// Commit never answers
        HangCommit,
        /// Prepare is applied on the server but never acknowledged
        HangAfterPrepare,
    }

    #[derive(Debug, Default, Clone)]
    struct Staged {
        deletes: Vec<i32>,
        inserts: Vec<TransferRecord>,
    }

    /// Server-side state shared between a participant and the test
    #[derive(Debug, Default)]
    pub struct MockServer {
        committed: BTreeMap<i32, String>,
        table_exists: bool,
        prepared: HashMap<String, Staged>,
        calls: Vec<String>,
        fail: HashSet<FailPoint>,
        /// Fail the read after this many rows were streamed
        fail_read_after: Option<usize>,
    }

    impl MockServer {
        pub fn rows(&self) -> Vec<TransferRecord> {
            self.committed
                .iter()
                .map(|(id, v)| TransferRecord::new(*id, v.clone()))
                .collect()
        }

        pub fn row_count(&self) -> usize {
            self.committed.len()
        }

        pub fn table_exists(&self) -> bool {
            self.table_exists
        }

        pub fn prepared_gids(&self) -> Vec<String> {
            self.prepared.keys().cloned().collect()
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.clone()
        }

        pub fn called(&self, op: &str) -> bool {
            self.calls.iter().any(|c| c == op)
        }
    }

    pub type SharedServer = Arc<Mutex<MockServer>>;

    pub struct MockParticipant {
        node: String,
        server: SharedServer,
        active: Option<Staged>,
    }

    impl MockParticipant {
        pub fn new(node: &str) -> Self {
            let server = MockServer {
                table_exists: true,
                ..MockServer::default()
            };
            Self {
                node: node.to_string(),
                server: Arc::new(Mutex::new(server)),
                active: None,
            }
        }

        /// Participant whose table holds `Value 1 ..= Value n`
        pub fn seeded(node: &str, n: i32) -> Self {
            let p = Self::new(node);
            {
                let mut server = p.server.lock().unwrap();
                for i in 1..=n {
                    server.committed.insert(i, format!("Value {}", i));
                }
            }
            p
        }

        pub fn server(&self) -> SharedServer {
            self.server.clone()
        }

        pub fn fail_at(self, point: FailPoint) -> Self {
            self.server.lock().unwrap().fail.insert(point);
            self
        }

        pub fn fail_read_after(self, rows: usize) -> Self {
            self.server.lock().unwrap().fail_read_after = Some(rows);
            self
        }

        /// Record the call, then report whether it is scripted to fail
        fn enter(&self, op: &str, point: FailPoint) -> Result<(), ParticipantError> {
            let mut server = self.server.lock().unwrap();
            server.calls.push(op.to_string());
            if server.fail.contains(&point) {
                Err(ParticipantError::Rejected(format!("injected {} failure", op)))
            } else {
                Ok(())
            }
        }

        fn active_mut(&mut self) -> Result<&mut Staged, ParticipantError> {
            self.active
                .as_mut()
                .ok_or_else(|| ParticipantError::Rejected("no transaction in progress".into()))
        }
    }

    #[async_trait]
    impl Participant for MockParticipant {
        fn node(&self) -> &str {
            &self.node
        }

        async fn begin(&mut self) -> Result<(), ParticipantError> {
            self.enter("begin", FailPoint::Begin)?;
            self.active = Some(Staged::default());
            Ok(())
        }

        fn drain_records(&mut self) -> BoxStream<'_, Result<TransferRecord, ParticipantError>> {
            let (rows, fail_after) = {
                let mut server = self.server.lock().unwrap();
                server.calls.push("drain".to_string());
                (server.rows(), server.fail_read_after)
            };

            let mut items: Vec<Result<TransferRecord, ParticipantError>> = Vec::new();
            match self.active.as_mut() {
                None => items.push(Err(ParticipantError::Rejected(
                    "no transaction in progress".into(),
                ))),
                Some(staged) => {
                    for (i, row) in rows.into_iter().enumerate() {
                        if fail_after == Some(i) {
                            items.push(Err(ParticipantError::Rejected(
                                "injected read failure".into(),
                            )));
                            break;
                        }
                        staged.deletes.push(row.id);
                        items.push(Ok(row));
                    }
                }
            }
            Box::pin(futures::stream::iter(items))
        }

        async fn stage_insert(&mut self, record: &TransferRecord) -> Result<(), ParticipantError> {
            self.enter("insert", FailPoint::Write)?;
            let duplicate = self.server.lock().unwrap().committed.contains_key(&record.id);
            let staged = self.active_mut()?;
            if duplicate || staged.inserts.iter().any(|r| r.id == record.id) {
                return Err(ParticipantError::Rejected(format!(
                    "duplicate key value violates unique constraint (id)={}",
                    record.id
                )));
            }
            staged.inserts.push(record.clone());
            Ok(())
        }

        async fn prepare(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
            // A failed PREPARE still ends the session transaction
            let staged = self.active.take();
            self.enter("prepare", FailPoint::Prepare)?;
            let staged = staged
                .ok_or_else(|| ParticipantError::Rejected("no transaction in progress".into()))?;
            let hang = {
                let mut server = self.server.lock().unwrap();
                server.prepared.insert(gid.as_str().to_string(), staged);
                server.fail.contains(&FailPoint::HangAfterPrepare)
            };
            if hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(())
        }

        async fn commit_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
            let hang = self.server.lock().unwrap().fail.contains(&FailPoint::HangCommit);
            if hang {
                self.server.lock().unwrap().calls.push("commit".to_string());
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.enter("commit", FailPoint::Commit)?;

            let mut server = self.server.lock().unwrap();
            let staged = server
                .prepared
                .remove(gid.as_str())
                .ok_or_else(|| ParticipantError::UnknownBranch(gid.to_string()))?;
            for id in staged.deletes {
                server.committed.remove(&id);
            }
            for record in staged.inserts {
                server.committed.insert(record.id, record.value);
            }
            Ok(())
        }

        async fn rollback_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
            self.enter("rollback_prepared", FailPoint::RollbackPrepared)?;
            self.server
                .lock()
                .unwrap()
                .prepared
                .remove(gid.as_str())
                .map(|_| ())
                .ok_or_else(|| ParticipantError::UnknownBranch(gid.to_string()))
        }

        async fn rollback(&mut self) -> Result<(), ParticipantError> {
            self.enter("rollback", FailPoint::Rollback)?;
            self.active = None;
            Ok(())
        }

        async fn purge(&mut self) -> Result<(), ParticipantError> {
            self.enter("purge", FailPoint::Purge)?;
            self.server.lock().unwrap().table_exists = false;
            Ok(())
        }
    }
}

#[cfg(test)]
pub use mock::{FailPoint, MockParticipant};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::twopc::types::{BranchRole, OperationId};
    use futures::StreamExt;

    #[tokio::test]
    async fn test_mock_changes_are_invisible_until_commit() {
        let mut p = MockParticipant::seeded("A", 3);
        let server = p.server();
        let gid = BranchId::new("relocate", OperationId::new(), BranchRole::Source);

        p.begin().await.unwrap();
        let drained: Vec<_> = p.drain_records().collect().await;
        assert_eq!(drained.len(), 3);
        p.prepare(&gid).await.unwrap();
        assert_eq!(server.lock().unwrap().row_count(), 3);

        p.commit_prepared(&gid).await.unwrap();
        assert_eq!(server.lock().unwrap().row_count(), 0);
    }

    #[tokio::test]
    async fn test_mock_failed_prepare_discards_transaction() {
        let mut p = MockParticipant::seeded("A", 1).fail_at(FailPoint::Prepare);
        let gid = BranchId::new("relocate", OperationId::new(), BranchRole::Source);

        p.begin().await.unwrap();
        assert!(p.prepare(&gid).await.is_err());
        assert!(p.server().lock().unwrap().prepared_gids().is_empty());
        let err = p.commit_prepared(&gid).await.unwrap_err();
        assert!(err.is_unknown_branch());
    }

    #[tokio::test]
    async fn test_mock_rejects_duplicate_ids() {
        let mut p = MockParticipant::seeded("B", 1);
        p.begin().await.unwrap();
        let err = p
            .stage_insert(&TransferRecord::new(1, "again"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("duplicate key"));
    }
}
