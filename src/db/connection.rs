//! Connection Factory
//!
//! One `PgConnection` per handle. Dropping a handle closes the socket, so a
//! connection never outlives the operation that opened it.

use sqlx::postgres::{PgConnectOptions, PgConnection, PgSslMode};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use super::error::ConnectionError;
use crate::config::{ConnectionConfig, NodeConfig};

/// Everything needed to reach one database on one node
#[derive(Debug, Clone)]
pub struct ConnectionParams {
    pub node: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub ssl_mode: String,
    pub database: String,
    pub connect_timeout: Duration,
}

impl ConnectionParams {
    pub fn for_node(node: &NodeConfig, conn: &ConnectionConfig, database: &str) -> Self {
        Self {
            node: node.name.clone(),
            host: node.host.clone(),
            port: node.port,
            user: conn.user.clone(),
            password: conn.password.clone().filter(|p| !p.is_empty()),
            ssl_mode: conn.ssl_mode.clone(),
            database: database.to_string(),
            connect_timeout: Duration::from_millis(conn.connect_timeout_ms),
        }
    }

    /// Same server, different database
    pub fn with_database(&self, database: &str) -> Self {
        Self {
            database: database.to_string(),
            ..self.clone()
        }
    }

    fn options(&self) -> Result<PgConnectOptions, ConnectionError> {
        let ssl_mode: PgSslMode = self.ssl_mode.parse().map_err(|_| {
            ConnectionError::InvalidSslMode {
                node: self.node.clone(),
                value: self.ssl_mode.clone(),
            }
        })?;

        let mut options = PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .username(&self.user)
            .database(&self.database)
            .ssl_mode(ssl_mode);
        if let Some(password) = &self.password {
            options = options.password(password);
        }
        Ok(options)
    }
}

/// A live connection scoped to one operation
#[derive(Debug)]
pub struct ConnectionHandle {
    node: String,
    conn: PgConnection,
}

impl ConnectionHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }

    pub async fn health_check(&mut self) -> Result<(), sqlx::Error> {
        self.conn.ping().await
    }

    /// Graceful close. Dropping the handle also releases the connection.
    pub async fn close(self) {
        let node = self.node;
        if let Err(e) = self.conn.close().await {
            debug!(node = %node, error = %e, "Connection close failed");
        }
    }
}

pub struct ConnectionFactory;

impl ConnectionFactory {
    pub async fn connect(params: &ConnectionParams) -> Result<ConnectionHandle, ConnectionError> {
        let options = params.options()?;
        let connect_err = |source: sqlx::Error| ConnectionError::Connect {
            node: params.node.clone(),
            database: params.database.clone(),
            source,
        };

        let conn = match tokio::time::timeout(params.connect_timeout, options.connect()).await {
            Ok(result) => result.map_err(connect_err)?,
            Err(_) => {
                return Err(connect_err(sqlx::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect timed out after {:?}", params.connect_timeout),
                ))));
            }
        };

        debug!(
            node = %params.node,
            host = %params.host,
            port = params.port,
            database = %params.database,
            "Connected"
        );
        Ok(ConnectionHandle {
            node: params.node.clone(),
            conn,
        })
    }

    /// Retry `connect` until the server accepts connections. A freshly
    /// launched server reports running before it listens.
    pub async fn connect_when_ready(
        params: &ConnectionParams,
        timeout: Duration,
        interval: Duration,
    ) -> Result<ConnectionHandle, ConnectionError> {
        let started = Instant::now();
        loop {
            match Self::connect(params).await {
                Ok(handle) => {
                    info!(
                        node = %params.node,
                        waited_ms = started.elapsed().as_millis() as u64,
                        "Server accepting connections"
                    );
                    return Ok(handle);
                }
                Err(e @ ConnectionError::InvalidSslMode { .. }) => return Err(e),
                Err(e) if started.elapsed() >= timeout => {
                    return Err(ConnectionError::NotReady {
                        node: params.node.clone(),
                        waited: started.elapsed(),
                        last_error: e.to_string(),
                    });
                }
                Err(e) => {
                    debug!(node = %params.node, error = %e, "Server not ready yet");
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }
}
