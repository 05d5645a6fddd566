//! Connection and schema error types

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("node {node}: connection to {database} failed: {source}")]
    Connect {
        node: String,
        database: String,
        #[source]
        source: sqlx::Error,
    },

    #[error("node {node}: server did not accept connections within {waited:?}: {last_error}")]
    NotReady {
        node: String,
        waited: Duration,
        last_error: String,
    },

    #[error("node {node}: invalid ssl_mode {value:?}")]
    InvalidSslMode { node: String, value: String },
}

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("node {node}: database {database} already exists")]
    AlreadyExists { node: String, database: String },

    #[error("invalid SQL identifier {name:?}")]
    InvalidIdentifier { name: String },

    #[error("node {node}: {stage} failed: {source}")]
    Statement {
        node: String,
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("node {node}: unexpected max_prepared_transactions value {value:?}")]
    UnexpectedSetting { node: String, value: String },
}

/// Either side of a bootstrap run
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl ConnectionError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectionError::Connect { .. } => "CONNECTION_FAILED",
            ConnectionError::NotReady { .. } => "CONNECTION_NOT_READY",
            ConnectionError::InvalidSslMode { .. } => "INVALID_SSL_MODE",
        }
    }
}

impl SchemaError {
    pub fn code(&self) -> &'static str {
        match self {
            SchemaError::AlreadyExists { .. } => "DATABASE_ALREADY_EXISTS",
            SchemaError::InvalidIdentifier { .. } => "INVALID_IDENTIFIER",
            SchemaError::Statement { .. } => "SCHEMA_STATEMENT_FAILED",
            SchemaError::UnexpectedSetting { .. } => "UNEXPECTED_SETTING",
        }
    }
}

/// SQLSTATE of a database-side error, if any
pub(crate) fn sqlstate(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) => db.code().map(|c| c.into_owned()),
        _ => None,
    }
}
