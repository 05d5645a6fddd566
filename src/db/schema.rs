//! Schema Bootstrapper
//!
//! Database/table creation, demo seeding and the prepared-transaction
//! setting on one participant.

use serde::Serialize;
use std::time::Duration;
use tracing::{debug, info};

use super::connection::{ConnectionFactory, ConnectionHandle, ConnectionParams};
use super::error::{DbError, SchemaError, sqlstate};
use crate::config::ControlConfig;

/// `duplicate_database`
const SQLSTATE_DUPLICATE_DATABASE: &str = "42P04";
/// `undefined_table`
const SQLSTATE_UNDEFINED_TABLE: &str = "42P01";

/// Postgres truncates identifiers longer than this
const MAX_IDENTIFIER_LEN: usize = 63;

/// Accept only plain lowercase-safe identifiers so names can be formatted
/// into DDL without quoting.
pub fn validate_identifier(name: &str) -> Result<(), SchemaError> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(first) => {
            (first.is_ascii_alphabetic() || first == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
                && name.len() <= MAX_IDENTIFIER_LEN
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            name: name.to_string(),
        })
    }
}

/// What bootstrap did on one node
#[derive(Debug, Clone, Serialize)]
pub struct BootstrapSummary {
    pub node: String,
    pub database_created: bool,
    pub seeded_rows: u32,
    pub row_count: i64,
}

/// Ensures the relocation database and table exist on a participant
#[derive(Debug, Clone)]
pub struct SchemaBootstrapper {
    database: String,
    table: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl SchemaBootstrapper {
    pub fn new(database: &str, table: &str) -> Result<Self, SchemaError> {
        validate_identifier(database)?;
        validate_identifier(table)?;
        let control = ControlConfig::default();
        Ok(Self {
            database: database.to_string(),
            table: table.to_string(),
            ready_timeout: control.ready_timeout(),
            poll_interval: control.poll_interval(),
        })
    }

    /// How long [`Self::bootstrap`] waits for a just-started server
    pub fn wait_ready(self, timeout: Duration, interval: Duration) -> Self {
        Self {
            ready_timeout: timeout,
            poll_interval: interval,
            ..self
        }
    }

    pub async fn database_exists(&self, handle: &mut ConnectionHandle) -> Result<bool, SchemaError> {
        let node = handle.node().to_string();
        sqlx::query_scalar::<_, bool>("SELECT EXISTS(SELECT 1 FROM pg_database WHERE datname = $1)")
            .bind(&self.database)
            .fetch_one(handle.conn())
            .await
            .map_err(|source| SchemaError::Statement {
                node,
                stage: "database lookup",
                source,
            })
    }

    /// `CREATE DATABASE`. Not idempotent: a second call fails with
    /// `AlreadyExists`. Check [`Self::database_exists`] first when needed.
    pub async fn ensure_database(&self, handle: &mut ConnectionHandle) -> Result<(), SchemaError> {
        let node = handle.node().to_string();
        let sql = format!("CREATE DATABASE {}", self.database);
        match sqlx::query(&sql).persistent(false).execute(handle.conn()).await {
            Ok(_) => {
                info!(node = %node, database = %self.database, "Database created");
                Ok(())
            }
            Err(e) if sqlstate(&e).as_deref() == Some(SQLSTATE_DUPLICATE_DATABASE) => {
                Err(SchemaError::AlreadyExists {
                    node,
                    database: self.database.clone(),
                })
            }
            Err(source) => Err(SchemaError::Statement {
                node,
                stage: "create database",
                source,
            }),
        }
    }

    /// `CREATE TABLE IF NOT EXISTS`; safe to rerun
    pub async fn ensure_schema(&self, handle: &mut ConnectionHandle) -> Result<(), SchemaError> {
        let node = handle.node().to_string();
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (id SERIAL PRIMARY KEY, value VARCHAR(100))",
            self.table
        );
        sqlx::query(&sql)
            .persistent(false)
            .execute(handle.conn())
            .await
            .map_err(|source| SchemaError::Statement {
                node: node.clone(),
                stage: "create table",
                source,
            })?;
        debug!(node = %node, table = %self.table, "Table ensured");
        Ok(())
    }

    /// Row count, or `None` when the table does not exist
    pub async fn count_records(
        &self,
        handle: &mut ConnectionHandle,
    ) -> Result<Option<i64>, SchemaError> {
        let node = handle.node().to_string();
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        match sqlx::query_scalar::<_, i64>(&sql)
            .fetch_one(handle.conn())
            .await
        {
            Ok(count) => Ok(Some(count)),
            Err(e) if sqlstate(&e).as_deref() == Some(SQLSTATE_UNDEFINED_TABLE) => Ok(None),
            Err(source) => Err(SchemaError::Statement {
                node,
                stage: "count rows",
                source,
            }),
        }
    }

    /// Fill an empty table with `Value 1 ..= Value <count>`. A table that
    /// already holds rows is left untouched. Returns rows inserted.
    pub async fn seed_records(
        &self,
        handle: &mut ConnectionHandle,
        count: u32,
    ) -> Result<u32, SchemaError> {
        if count == 0 || self.count_records(handle).await?.unwrap_or(0) > 0 {
            return Ok(0);
        }

        let node = handle.node().to_string();
        let sql = format!("INSERT INTO {} (value) VALUES ($1)", self.table);
        for i in 1..=count {
            sqlx::query(&sql)
                .bind(format!("Value {}", i))
                .execute(handle.conn())
                .await
                .map_err(|source| SchemaError::Statement {
                    node: node.clone(),
                    stage: "seed rows",
                    source,
                })?;
        }
        info!(node = %node, table = %self.table, rows = count, "Table seeded");
        Ok(count)
    }

    /// Connect to the maintenance database (waiting until the server accepts
    /// connections), create the relocation database if missing, then ensure
    /// the table and seed rows when asked.
    pub async fn bootstrap(
        &self,
        maintenance: &ConnectionParams,
        seed_rows: u32,
    ) -> Result<BootstrapSummary, DbError> {
        let mut admin =
            ConnectionFactory::connect_when_ready(maintenance, self.ready_timeout, self.poll_interval)
                .await?;
        let database_created = if self.database_exists(&mut admin).await? {
            false
        } else {
            self.ensure_database(&mut admin).await?;
            true
        };
        admin.close().await;

        let params = maintenance.with_database(&self.database);
        let mut handle = ConnectionFactory::connect(&params).await?;
        self.ensure_schema(&mut handle).await?;
        let seeded_rows = self.seed_records(&mut handle, seed_rows).await?;
        let row_count = self.count_records(&mut handle).await?.unwrap_or(0);
        handle.close().await;

        Ok(BootstrapSummary {
            node: maintenance.node.clone(),
            database_created,
            seeded_rows,
            row_count,
        })
    }
}

/// Raise `max_prepared_transactions` to at least `wanted`. Returns `true`
/// when the setting was changed; it only takes effect after a restart.
pub async fn enable_prepared_transactions(
    handle: &mut ConnectionHandle,
    wanted: u32,
) -> Result<bool, SchemaError> {
    let node = handle.node().to_string();
    let current: String = sqlx::query_scalar("SHOW max_prepared_transactions")
        .fetch_one(handle.conn())
        .await
        .map_err(|source| SchemaError::Statement {
            node: node.clone(),
            stage: "show max_prepared_transactions",
            source,
        })?;
    let current: u32 = current
        .trim()
        .parse()
        .map_err(|_| SchemaError::UnexpectedSetting {
            node: node.clone(),
            value: current.clone(),
        })?;

    if current >= wanted {
        debug!(node = %node, current, "Prepared transactions already enabled");
        return Ok(false);
    }

    let sql = format!("ALTER SYSTEM SET max_prepared_transactions = {}", wanted);
    sqlx::query(&sql)
        .persistent(false)
        .execute(handle.conn())
        .await
        .map_err(|source| SchemaError::Statement {
            node: node.clone(),
            stage: "alter system",
            source,
        })?;
    info!(
        node = %node,
        from = current,
        to = wanted,
        "max_prepared_transactions raised, restart required"
    );
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, NodeConfig};
    use crate::db::error::ConnectionError;
    use std::path::PathBuf;

    #[test]
    fn test_identifier_validation() {
        assert!(validate_identifier("data").is_ok());
        assert!(validate_identifier("_relocation_2").is_ok());

        for bad in ["", "1data", "data; DROP TABLE x", "da-ta", "\"data\"", "naïve"] {
            assert!(
                matches!(
                    validate_identifier(bad),
                    Err(SchemaError::InvalidIdentifier { .. })
                ),
                "{bad:?} should be rejected"
            );
        }
        assert!(validate_identifier(&"a".repeat(64)).is_err());
        assert!(validate_identifier(&"a".repeat(63)).is_ok());
    }

    #[tokio::test]
    async fn test_bootstrap_waits_for_server() {
        // Nothing listens on a port that was just released
        let port = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port();
        let node = NodeConfig {
            name: "A".to_string(),
            data_dir: PathBuf::from("/unused"),
            host: "127.0.0.1".to_string(),
            port,
        };
        let params = ConnectionParams::for_node(&node, &ConnectionConfig::default(), "postgres");
        let boot = SchemaBootstrapper::new("relocation", "data")
            .unwrap()
            .wait_ready(Duration::from_millis(300), Duration::from_millis(50));

        let err = boot.bootstrap(&params, 9).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::Connection(ConnectionError::NotReady { .. })
        ));
    }

    #[test]
    fn test_bootstrapper_rejects_bad_names() {
        assert!(SchemaBootstrapper::new("relocation", "data").is_ok());
        assert!(SchemaBootstrapper::new("relocation", "data x").is_err());
        assert!(SchemaBootstrapper::new("", "data").is_err());
    }
}
