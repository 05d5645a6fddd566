//! Database connection management
//!
//! - [`connection`] - per-operation connections to one node
//! - [`schema`] - database/table bootstrap and server settings

pub mod connection;
pub mod error;
pub mod schema;

pub use connection::{ConnectionFactory, ConnectionHandle, ConnectionParams};
pub use error::{ConnectionError, DbError, SchemaError};
pub use schema::{BootstrapSummary, SchemaBootstrapper, enable_prepared_transactions};
