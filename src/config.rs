use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config yaml: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_file")]
    pub log_file: String,
    #[serde(default)]
    pub use_json: bool,
    #[serde(default = "default_rotation")]
    pub rotation: String,
    pub nodes: NodesConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub control: ControlConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> String {
    "./logs".to_string()
}

fn default_log_file() -> String {
    "pg_relocate.log".to_string()
}

fn default_rotation() -> String {
    "never".to_string()
}

/// The two managed instances. `a` is the transfer source, `b` the target.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct NodesConfig {
    pub a: NodeConfig,
    pub b: NodeConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    pub data_dir: PathBuf,
    #[serde(default = "default_host")]
    pub host: String,
    pub port: u16,
}

fn default_host() -> String {
    "localhost".to_string()
}

/// Credentials shared by both nodes.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ConnectionConfig {
    pub user: String,
    pub password: Option<String>,
    /// One of `disable`, `allow`, `prefer`, `require`, `verify-ca`, `verify-full`
    pub ssl_mode: String,
    /// Database used before the relocation database exists
    pub maintenance_db: String,
    pub connect_timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            user: "postgres".to_string(),
            password: None,
            ssl_mode: "disable".to_string(),
            maintenance_db: "postgres".to_string(),
            connect_timeout_ms: 5_000,
        }
    }
}

/// `initdb` / `pg_ctl` invocation settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    pub initdb: String,
    pub pg_ctl: String,
    pub superuser: String,
    /// Phrases in `pg_ctl status` output that mean "server is not running".
    /// Locale dependent, so every locale in use needs an entry.
    pub not_running_markers: Vec<String>,
    pub ready_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            initdb: "initdb".to_string(),
            pg_ctl: "pg_ctl".to_string(),
            superuser: "postgres".to_string(),
            not_running_markers: vec![
                "no server running".to_string(),
                "сервер не работает".to_string(),
            ],
            ready_timeout_ms: 30_000,
            poll_interval_ms: 250,
        }
    }
}

impl ControlConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TransferConfig {
    pub database: String,
    pub table: String,
    /// Rows seeded into an empty source table before transfer (0 = no seeding)
    pub seed_rows: u32,
    /// Drop the source table once both branches committed
    pub purge_source: bool,
    /// Upper bound for each participant call during the 2PC run
    pub phase_timeout_ms: u64,
    pub branch_prefix: String,
    pub enable_prepared_transactions: bool,
    pub max_prepared_transactions: u32,
    /// Prepared branches younger than this may belong to a live run and
    /// are left alone by `in-doubt` / `resolve`
    pub recovery_min_age_ms: u64,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            database: "relocation".to_string(),
            table: "data".to_string(),
            seed_rows: 9,
            purge_source: true,
            phase_timeout_ms: 10_000,
            branch_prefix: "relocate".to_string(),
            enable_prepared_transactions: true,
            max_prepared_transactions: 8,
            recovery_min_age_ms: 60_000,
        }
    }
}

impl TransferConfig {
    pub fn phase_timeout(&self) -> Duration {
        Duration::from_millis(self.phase_timeout_ms)
    }

    pub fn recovery_min_age(&self) -> Duration {
        Duration::from_millis(self.recovery_min_age_ms)
    }
}

impl AppConfig {
    /// Load `config/<env>.yaml`
    pub fn load(env: &str) -> Result<Self, ConfigError> {
        let config_path = format!("config/{}.yaml", env);
        Self::from_file(&config_path)
    }

    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let (a, b) = (&self.nodes.a, &self.nodes.b);
        if a.name.is_empty() || a.name == b.name {
            return Err(ConfigError::Invalid(format!(
                "node names must be distinct and non-empty: {:?}, {:?}",
                a.name, b.name
            )));
        }
        if a.data_dir == b.data_dir {
            return Err(ConfigError::Invalid(format!(
                "nodes {} and {} share storage area {}",
                a.name,
                b.name,
                a.data_dir.display()
            )));
        }
        if a.host == b.host && a.port == b.port {
            return Err(ConfigError::Invalid(format!(
                "nodes {} and {} both listen on {}:{}",
                a.name, b.name, a.host, a.port
            )));
        }
        if self.transfer.branch_prefix.is_empty()
            || !self
                .transfer
                .branch_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::Invalid(format!(
                "branch_prefix must be non-empty [A-Za-z0-9_]: {:?}",
                self.transfer.branch_prefix
            )));
        }
        // A live run keeps its branches prepared for at most three bounded
        // calls (PREPARE dst, COMMIT PREPARED src, COMMIT PREPARED dst)
        let live_window = self.transfer.phase_timeout_ms.saturating_mul(3);
        if self.transfer.recovery_min_age_ms < live_window {
            return Err(ConfigError::Invalid(format!(
                "recovery_min_age_ms ({}) must be at least 3 x phase_timeout_ms ({})",
                self.transfer.recovery_min_age_ms, self.transfer.phase_timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
nodes:
  a:
    name: "A"
    data_dir: "/tmp/relocate/server_a"
    port: 33555
  b:
    name: "B"
    data_dir: "/tmp/relocate/server_b"
    port: 33556
"#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();

        assert_eq!(config.nodes.a.host, "localhost");
        assert_eq!(config.nodes.b.port, 33556);
        assert_eq!(config.connection.user, "postgres");
        assert!(config.connection.password.is_none());
        assert_eq!(config.connection.ssl_mode, "disable");
        assert_eq!(config.control.superuser, "postgres");
        assert_eq!(config.transfer.table, "data");
        assert_eq!(config.transfer.seed_rows, 9);
        assert!(config.transfer.purge_source);
        assert_eq!(config.rotation, "never");
    }

    #[test]
    fn test_full_config_deserialize() {
        let yaml = r#"
log_level: "debug"
log_dir: "./logs"
log_file: "relocate.log"
use_json: true
rotation: "daily"
nodes:
  a:
    name: "A"
    data_dir: "/srv/pg/a"
    host: "127.0.0.1"
    port: 40001
  b:
    name: "B"
    data_dir: "/srv/pg/b"
    host: "127.0.0.1"
    port: 40002
connection:
  user: "admin"
  password: "secret"
  ssl_mode: "require"
control:
  pg_ctl: "/usr/lib/postgresql/16/bin/pg_ctl"
  not_running_markers: ["kein Server läuft"]
transfer:
  database: "inventory"
  phase_timeout_ms: 2500
  purge_source: false
"#;

        let config = AppConfig::from_yaml(yaml).unwrap();

        assert!(config.use_json);
        assert_eq!(config.connection.password.as_deref(), Some("secret"));
        assert_eq!(config.connection.maintenance_db, "postgres");
        assert_eq!(config.control.pg_ctl, "/usr/lib/postgresql/16/bin/pg_ctl");
        assert_eq!(config.control.initdb, "initdb");
        assert_eq!(config.control.not_running_markers, vec!["kein Server läuft"]);
        assert_eq!(config.transfer.database, "inventory");
        assert_eq!(config.transfer.phase_timeout(), Duration::from_millis(2500));
        assert!(!config.transfer.purge_source);
    }

    #[test]
    fn test_shared_storage_area_rejected() {
        let yaml = MINIMAL.replace("server_b", "server_a");
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_duplicate_node_names_rejected() {
        let yaml = MINIMAL.replace("name: \"B\"", "name: \"A\"");
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_bad_branch_prefix_rejected() {
        let yaml = format!("{}transfer:\n  branch_prefix: \"x'; --\"\n", MINIMAL);
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_recovery_min_age_must_cover_live_run() {
        let config = AppConfig::from_yaml(MINIMAL).unwrap();
        assert_eq!(config.transfer.recovery_min_age(), Duration::from_secs(60));

        let yaml = format!(
            "{}transfer:\n  phase_timeout_ms: 10000\n  recovery_min_age_ms: 20000\n",
            MINIMAL
        );
        let err = AppConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = AppConfig::from_file("config/does-not-exist.yaml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
