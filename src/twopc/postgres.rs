//! PostgreSQL participant
//!
//! Drives one branch over a dedicated connection with `PREPARE TRANSACTION`
//! and friends. Transaction control statements are unparameterized and never
//! cached; row statements are parameterized.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use sqlx::postgres::PgConnection;
use tracing::debug;

use super::error::ParticipantError;
use super::participant::Participant;
use super::types::{BranchId, TransferRecord};
use crate::db::ConnectionHandle;
use crate::db::schema::validate_identifier;

pub struct PgParticipant {
    handle: ConnectionHandle,
    drain_sql: String,
    insert_sql: String,
    purge_sql: String,
}

impl PgParticipant {
    /// `table` must be a plain identifier; it is interpolated into SQL.
    pub fn new(handle: ConnectionHandle, table: &str) -> Result<Self, crate::db::SchemaError> {
        validate_identifier(table)?;
        Ok(Self {
            handle,
            drain_sql: format!("DELETE FROM {} RETURNING id, value", table),
            insert_sql: format!("INSERT INTO {} (id, value) VALUES ($1, $2)", table),
            purge_sql: format!("DROP TABLE IF EXISTS {}", table),
        })
    }

    async fn simple(&mut self, sql: &str) -> Result<(), ParticipantError> {
        debug!(node = %self.handle.node(), sql, "Executing");
        sqlx::query(sql)
            .persistent(false)
            .execute(self.handle.conn()).await?;
        Ok(())
    }
}

/// `COMMIT PREPARED` / `ROLLBACK PREPARED` for `gid` on any connection.
/// Prepared transactions are not bound to the session that prepared them.
pub(crate) async fn finish_prepared(
    conn: &mut PgConnection,
    gid: &BranchId,
    commit: bool,
) -> Result<(), sqlx::Error> {
    let verb = if commit { "COMMIT" } else { "ROLLBACK" };
    let sql = format!("{} PREPARED {}", verb, gid.to_sql_literal());
    sqlx::query(&sql).persistent(false).execute(conn).await?;
    Ok(())
}

#[async_trait]
impl Participant for PgParticipant {
    fn node(&self) -> &str {
        self.handle.node()
    }

    async fn begin(&mut self) -> Result<(), ParticipantError> {
        self.simple("BEGIN").await
    }

    fn drain_records(&mut self) -> BoxStream<'_, Result<TransferRecord, ParticipantError>> {
        sqlx::query_as::<_, (i32, Option<String>)>(&self.drain_sql)
            .fetch(self.handle.conn())
            .map(|row| match row {
                Ok((id, Some(value))) => Ok(TransferRecord { id, value }),
                Ok((id, None)) => Err(ParticipantError::Rejected(format!(
                    "row id {} has a NULL value",
                    id
                ))),
                Err(e) => Err(ParticipantError::Database(e)),
            })
            .boxed()
    }

    async fn stage_insert(&mut self, record: &TransferRecord) -> Result<(), ParticipantError> {
        sqlx::query(&self.insert_sql)
            .bind(record.id)
            .bind(&record.value)
            .execute(self.handle.conn())
            .await?;
        Ok(())
    }

    async fn prepare(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
        let sql = format!("PREPARE TRANSACTION {}", gid.to_sql_literal());
        self.simple(&sql).await
    }

    async fn commit_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
        finish_prepared(self.handle.conn(), gid, true).await?;
        Ok(())
    }

    async fn rollback_prepared(&mut self, gid: &BranchId) -> Result<(), ParticipantError> {
        finish_prepared(self.handle.conn(), gid, false).await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), ParticipantError> {
        self.simple("ROLLBACK").await
    }

    async fn purge(&mut self) -> Result<(), ParticipantError> {
        let sql = self.purge_sql.clone();
        self.simple(&sql).await
    }
}
