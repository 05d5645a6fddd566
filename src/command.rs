//! Commands and Dispatcher
//!
//! One explicit [`Command`] per invocation. Node commands run against every
//! registered node concurrently; a failure on one node is reported next to
//! the other node's result and never cancels it.

use clap::{Parser, Subcommand};
use futures::future::join_all;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::error::RelocateError;
use crate::node::{ControlTool, LifecycleError, Node, NodeRegistry, PgCtl, ProcessHost, SharedNode};
use crate::relocation::{Relocation, RelocationReport};
use crate::twopc::{Decision, InDoubtOperation, ResolvedBranch};

/// Two managed PostgreSQL servers and an all-or-nothing relocation of a
/// table's rows from A to B.
#[derive(Parser, Debug)]
#[command(name = "pg_relocate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration environment, read from `config/<env>.yaml`
    #[arg(short, long, default_value = "dev", global = true)]
    pub env: String,

    /// Print the report as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Lifecycle action applied to each node
#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeAction {
    /// Report whether each storage area is present
    Exists,
    /// Initialize missing storage areas
    Create,
    /// Remove stopped storage areas
    Destroy,
    /// Launch both servers and wait until they run
    Start,
    /// Stop both servers
    Stop,
    /// Probe both servers
    Status,
}

impl NodeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeAction::Exists => "exists",
            NodeAction::Create => "create",
            NodeAction::Destroy => "destroy",
            NodeAction::Start => "start",
            NodeAction::Stop => "stop",
            NodeAction::Status => "status",
        }
    }
}

impl fmt::Display for NodeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    #[command(flatten)]
    Node(NodeAction),

    /// Move every row from A to B in one two-phase commit
    Transfer {
        /// Roll both branches back right after PREPARE
        #[arg(long)]
        simulate_crash: bool,
    },

    /// List prepared branches left behind by interrupted runs
    InDoubt,

    /// Settle in-doubt branches
    Resolve {
        /// Commit branches whose source already committed
        #[arg(long, conflicts_with = "rollback")]
        commit: bool,

        /// Roll back branches whose source already committed
        #[arg(long)]
        rollback: bool,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Node(action) => action.as_str(),
            Command::Transfer { .. } => "transfer",
            Command::InDoubt => "in-doubt",
            Command::Resolve { .. } => "resolve",
        }
    }

    /// `resolve` with the given operator decision
    pub fn resolve(decision: Option<Decision>) -> Self {
        Command::Resolve {
            commit: decision == Some(Decision::Commit),
            rollback: decision == Some(Decision::Rollback),
        }
    }
}

fn decision(commit: bool, rollback: bool) -> Option<Decision> {
    match (commit, rollback) {
        (true, _) => Some(Decision::Commit),
        (_, true) => Some(Decision::Rollback),
        _ => None,
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Result of a node command on one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeOutcome {
    pub node: String,
    pub ok: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "report", rename_all = "snake_case")]
pub enum Report {
    Nodes {
        action: NodeAction,
        outcomes: Vec<NodeOutcome>,
    },
    Transfer(RelocationReport),
    InDoubt {
        operations: Vec<InDoubtOperation>,
    },
    Resolved {
        branches: Vec<ResolvedBranch>,
    },
}

impl Report {
    /// False when any node reported an error
    pub fn all_ok(&self) -> bool {
        match self {
            Report::Nodes { outcomes, .. } => outcomes.iter().all(|o| o.ok),
            _ => true,
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Report::Nodes { action, outcomes } => {
                for o in outcomes {
                    match o.error_code {
                        None => writeln!(f, "[{}] {}: {}", o.node, action, o.detail)?,
                        Some(code) => {
                            writeln!(f, "[{}] {} failed ({}): {}", o.node, action, code, o.detail)?
                        }
                    }
                }
                Ok(())
            }
            Report::Transfer(r) => {
                for node in &r.restarted {
                    writeln!(f, "[{}] restarted to enable prepared transactions", node)?;
                }
                for b in &r.bootstrap {
                    writeln!(
                        f,
                        "[{}] database created: {}, seeded: {}, rows: {}",
                        b.node, b.database_created, b.seeded_rows, b.row_count
                    )?;
                }
                let t = &r.transfer;
                writeln!(f, "operation {}: {}", t.operation_id, t.outcome)?;
                writeln!(f, "  moved {} record(s): {:?}", t.moved(), t.moved_ids)?;
                writeln!(f, "  {}", t.source)?;
                writeln!(f, "  {}", t.target)?;
                writeln!(f, "  source purged: {}", t.source_purged)
            }
            Report::InDoubt { operations } => {
                if operations.is_empty() {
                    return writeln!(f, "no in-doubt branches");
                }
                for op in operations {
                    writeln!(f, "operation {}: {}", op.operation_id, op.resolution)?;
                    for b in &op.branches {
                        writeln!(f, "  [{}] {} {}", b.node, b.role, b.gid)?;
                    }
                }
                Ok(())
            }
            Report::Resolved { branches } => {
                if branches.is_empty() {
                    return writeln!(f, "nothing to resolve");
                }
                for b in branches {
                    writeln!(f, "[{}] {}: {:?}", b.node, b.gid, b.action)?;
                }
                Ok(())
            }
        }
    }
}

/// Routes commands to lifecycle or relocation logic
pub struct Dispatcher {
    config: AppConfig,
    registry: NodeRegistry,
    host: ProcessHost,
}

impl Dispatcher {
    pub fn new(config: AppConfig, control: Arc<dyn ControlTool>) -> Result<Self, RelocateError> {
        let registry = NodeRegistry::from_pair(&config.nodes)?;
        let host = ProcessHost::new(control, &config.control);
        Ok(Self {
            config,
            registry,
            host,
        })
    }

    /// Dispatcher driving the configured `initdb`/`pg_ctl`
    pub fn from_config(config: AppConfig) -> Result<Self, RelocateError> {
        let control = PgCtl::new(config.control.initdb.clone(), config.control.pg_ctl.clone());
        Self::new(config, Arc::new(control))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub async fn dispatch(&self, command: Command) -> Result<Report, RelocateError> {
        info!(command = %command, "Dispatching");
        let relocation = Relocation::new(&self.config, &self.registry, &self.host);

        match command {
            Command::Transfer { simulate_crash } => {
                Ok(Report::Transfer(relocation.run(simulate_crash).await?))
            }
            Command::InDoubt => Ok(Report::InDoubt {
                operations: relocation.in_doubt().await?,
            }),
            Command::Resolve { commit, rollback } => Ok(Report::Resolved {
                branches: relocation.resolve(decision(commit, rollback)).await?,
            }),
            Command::Node(action) => {
                let outcomes =
                    join_all(self.registry.nodes().map(|n| self.run_on_node(action, n))).await;
                Ok(Report::Nodes { action, outcomes })
            }
        }
    }

    async fn run_on_node(&self, action: NodeAction, node: &SharedNode) -> NodeOutcome {
        let mut node = node.lock().await;
        let result = self.apply(action, &mut node).await;
        match result {
            Ok(detail) => NodeOutcome {
                node: node.name().to_string(),
                ok: true,
                detail,
                error_code: None,
            },
            Err(e) => {
                warn!(
                    node = %node.name(),
                    action = %action,
                    code = e.code(),
                    error = %e,
                    "Node command failed"
                );
                NodeOutcome {
                    node: node.name().to_string(),
                    ok: false,
                    detail: e.to_string(),
                    error_code: Some(e.code()),
                }
            }
        }
    }

    async fn apply(&self, action: NodeAction, node: &mut Node) -> Result<String, LifecycleError> {
        let host = &self.host;
        match action {
            NodeAction::Exists => Ok(if host.exists(node).await? {
                format!("storage area present at {}", node.data_dir().display())
            } else {
                "no storage area".to_string()
            }),
            NodeAction::Create => {
                if host.exists(node).await? {
                    return Ok("storage area already exists, skipped".to_string());
                }
                host.create(node).await?;
                Ok(format!("created at {}", node.data_dir().display()))
            }
            NodeAction::Destroy => {
                host.destroy(node).await?;
                Ok("destroyed".to_string())
            }
            NodeAction::Start => {
                host.start(node).await?;
                host.wait_until_running(node).await?;
                Ok(format!("running on port {}", node.port()))
            }
            NodeAction::Stop => {
                host.stop(node).await?;
                Ok("stopped".to_string())
            }
            NodeAction::Status => Ok(host.status(node).await?.to_string()),
        }
    }
}
