//! End-to-end relocation
//!
//! ```text
//! ensure running (A ∥ B) → max_prepared_transactions (+ restart)
//!     → bootstrap (spawn A, spawn B, join) → 2PC transfer A → B
//! ```
//!
//! Both node locks are held for the whole run, so no lifecycle command can
//! stop a participant under the coordinator.

use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::{
    BootstrapSummary, ConnectionFactory, ConnectionHandle, ConnectionParams, SchemaBootstrapper,
    enable_prepared_transactions,
};
use crate::error::RelocateError;
use crate::node::{Node, NodeRegistry, ProcessHost, SharedNode};
use crate::twopc::recovery::{self, Decision, InDoubtOperation, ResolvedBranch};
use crate::twopc::{CoordinatorOptions, PgParticipant, TransferReport, TwoPhaseCommitCoordinator};

#[derive(Debug, Clone, Serialize)]
pub struct RelocationReport {
    /// Nodes restarted to apply `max_prepared_transactions`
    pub restarted: Vec<String>,
    pub bootstrap: Vec<BootstrapSummary>,
    pub transfer: TransferReport,
}

pub struct Relocation<'a> {
    config: &'a AppConfig,
    registry: &'a NodeRegistry,
    host: &'a ProcessHost,
}

impl<'a> Relocation<'a> {
    pub fn new(config: &'a AppConfig, registry: &'a NodeRegistry, host: &'a ProcessHost) -> Self {
        Self {
            config,
            registry,
            host,
        }
    }

    fn node(&self, name: &str) -> Result<SharedNode, RelocateError> {
        self.registry
            .get(name)
            .ok_or_else(|| RelocateError::UnknownNode(name.to_string()))
    }

    fn params(&self, node: &Node, database: &str) -> ConnectionParams {
        ConnectionParams::for_node(node.config(), &self.config.connection, database)
    }

    /// Move every row from node `a` to node `b`
    pub async fn run(&self, simulate_crash: bool) -> Result<RelocationReport, RelocateError> {
        let source = self.node(&self.config.nodes.a.name)?;
        let target = self.node(&self.config.nodes.b.name)?;
        // Fixed lock order: source, then target
        let mut source = source.lock().await;
        let mut target = target.lock().await;

        tokio::try_join!(
            self.host.ensure_running(&mut source),
            self.host.ensure_running(&mut target)
        )?;

        let mut restarted = Vec::new();
        if self.config.transfer.enable_prepared_transactions {
            let (src_restarted, dst_restarted) = tokio::try_join!(
                self.enable_prepared(&mut source),
                self.enable_prepared(&mut target)
            )?;
            for (node, was_restarted) in [(&*source, src_restarted), (&*target, dst_restarted)] {
                if was_restarted {
                    restarted.push(node.name().to_string());
                }
            }
        }

        let bootstrap = self.bootstrap(&source, &target).await?;

        let transfer = &self.config.transfer;
        let src_conn = self.connect(&source, &transfer.database).await?;
        let dst_conn = self.connect(&target, &transfer.database).await?;
        let options = CoordinatorOptions::from_config(transfer, simulate_crash);
        let coordinator = TwoPhaseCommitCoordinator::new(options);
        let report = coordinator
            .run(
                Box::new(PgParticipant::new(src_conn, &transfer.table)?),
                Box::new(PgParticipant::new(dst_conn, &transfer.table)?),
            )
            .await?;

        Ok(RelocationReport {
            restarted,
            bootstrap,
            transfer: report,
        })
    }

    /// Raise `max_prepared_transactions` and restart when needed
    async fn enable_prepared(&self, node: &mut Node) -> Result<bool, RelocateError> {
        let control = &self.config.control;
        let params = self.params(node, &self.config.connection.maintenance_db);
        let mut handle = ConnectionFactory::connect_when_ready(
            &params,
            control.ready_timeout(),
            control.poll_interval(),
        )
        .await?;
        let changed = enable_prepared_transactions(
            &mut handle,
            self.config.transfer.max_prepared_transactions,
        )
        .await;
        handle.close().await;

        if !changed? {
            return Ok(false);
        }
        info!(node = %node.name(), "Restarting to apply max_prepared_transactions");
        self.host.restart(node).await?;
        let handle = ConnectionFactory::connect_when_ready(
            &params,
            control.ready_timeout(),
            control.poll_interval(),
        )
        .await?;
        handle.close().await;
        Ok(true)
    }

    /// Bootstrap both nodes as separate tasks; both must succeed
    async fn bootstrap(
        &self,
        source: &Node,
        target: &Node,
    ) -> Result<Vec<BootstrapSummary>, RelocateError> {
        let transfer = &self.config.transfer;
        let control = &self.config.control;
        let boot = SchemaBootstrapper::new(&transfer.database, &transfer.table)?
            .wait_ready(control.ready_timeout(), control.poll_interval());
        let maintenance = &self.config.connection.maintenance_db;

        let src_task = {
            let boot = boot.clone();
            let params = self.params(source, maintenance);
            let seed_rows = transfer.seed_rows;
            tokio::spawn(async move { boot.bootstrap(&params, seed_rows).await })
        };
        let dst_task = {
            let params = self.params(target, maintenance);
            tokio::spawn(async move { boot.bootstrap(&params, 0).await })
        };

        let (src, dst) = tokio::join!(src_task, dst_task);
        let summaries = vec![src??, dst??];
        for s in &summaries {
            info!(
                node = %s.node,
                database_created = s.database_created,
                seeded = s.seeded_rows,
                rows = s.row_count,
                "Bootstrap finished"
            );
        }
        Ok(summaries)
    }

    async fn connect(&self, node: &Node, database: &str) -> Result<ConnectionHandle, RelocateError> {
        Ok(ConnectionFactory::connect(&self.params(node, database)).await?)
    }

    /// Connections to the relocation database on every node
    async fn connect_all(&self) -> Result<Vec<ConnectionHandle>, RelocateError> {
        let mut handles = Vec::new();
        for config in self.registry.configs() {
            let params = ConnectionParams::for_node(
                config,
                &self.config.connection,
                &self.config.transfer.database,
            );
            handles.push(ConnectionFactory::connect(&params).await?);
        }
        Ok(handles)
    }

    /// Prepared branches left behind by earlier runs, grouped per operation.
    /// Operations prepared more recently than `recovery_min_age_ms` are
    /// left out.
    pub async fn in_doubt(&self) -> Result<Vec<InDoubtOperation>, RelocateError> {
        let mut handles = self.connect_all().await?;
        let operations = self.list(&mut handles).await;
        for handle in handles {
            handle.close().await;
        }
        operations
    }

    async fn list(
        &self,
        handles: &mut [ConnectionHandle],
    ) -> Result<Vec<InDoubtOperation>, RelocateError> {
        let prefix = &self.config.transfer.branch_prefix;
        let mut branches = Vec::new();
        for handle in handles.iter_mut() {
            branches.extend(recovery::list_in_doubt(handle, prefix).await?);
        }
        let operations = recovery::older_than(
            recovery::classify(branches),
            self.config.transfer.recovery_min_age(),
            Utc::now(),
        );
        if !operations.is_empty() {
            warn!(count = operations.len(), "In-doubt operations found");
        }
        Ok(operations)
    }

    /// Settle in-doubt branches. Target-only leftovers need `decision`.
    /// Holds both node locks, like [`Self::run`].
    pub async fn resolve(
        &self,
        decision: Option<Decision>,
    ) -> Result<Vec<ResolvedBranch>, RelocateError> {
        let source = self.node(&self.config.nodes.a.name)?;
        let target = self.node(&self.config.nodes.b.name)?;
        let _source = source.lock().await;
        let _target = target.lock().await;

        let mut handles = self.connect_all().await?;
        let result = match self.list(&mut handles).await {
            Ok(operations) => recovery::resolve(&mut handles, &operations, decision)
                .await
                .map_err(RelocateError::from),
            Err(e) => Err(e),
        };
        for handle in handles {
            handle.close().await;
        }
        result
    }
}
