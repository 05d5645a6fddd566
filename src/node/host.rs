//! Process Host
//!
//! Create/start/stop/status/destroy for one storage area.

use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::control::ControlTool;
use super::error::{LifecycleError, ProbeError};
use super::status::StatusClassifier;
use super::{Node, NodeState, NodeStatus};
use crate::config::ControlConfig;

pub struct ProcessHost {
    control: Arc<dyn ControlTool>,
    classifier: StatusClassifier,
    superuser: String,
    ready_timeout: Duration,
    poll_interval: Duration,
}

impl ProcessHost {
    pub fn new(control: Arc<dyn ControlTool>, config: &ControlConfig) -> Self {
        Self {
            control,
            classifier: StatusClassifier::new(config.not_running_markers.clone()),
            superuser: config.superuser.clone(),
            ready_timeout: config.ready_timeout(),
            poll_interval: config.poll_interval(),
        }
    }

    /// Initialize a new storage area at the node's path
    pub async fn create(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.exists(node).await? {
            return Err(LifecycleError::AlreadyExists {
                node: node.name().to_string(),
                path: node.data_dir().to_path_buf(),
            });
        }

        let output = self
            .control
            .init(node.data_dir(), &self.superuser)
            .await
            .map_err(|e| LifecycleError::InitializationFailed {
                node: node.name().to_string(),
                status: "not launched".to_string(),
                output: e.to_string(),
            })?;

        if !output.success {
            return Err(LifecycleError::InitializationFailed {
                node: node.name().to_string(),
                status: output.status_label(),
                output: output.text,
            });
        }

        node.set_state(NodeState::Created);
        info!(node = %node.name(), path = %node.data_dir().display(), "Storage area created");
        Ok(())
    }

    /// Whether a storage area directory is present. Never fails on a
    /// missing path; anything other than a directory at the path is a
    /// probe error.
    pub async fn exists(&self, node: &Node) -> Result<bool, ProbeError> {
        match tokio::fs::metadata(node.data_dir()).await {
            Ok(meta) if meta.is_dir() => Ok(true),
            Ok(_) => Err(ProbeError::NotADirectory {
                node: node.name().to_string(),
                path: node.data_dir().to_path_buf(),
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(ProbeError::Io {
                node: node.name().to_string(),
                path: node.data_dir().to_path_buf(),
                source,
            }),
        }
    }

    pub async fn status(&self, node: &mut Node) -> Result<NodeStatus, LifecycleError> {
        self.require_created(node).await?;

        let output = self
            .control
            .status(node.data_dir())
            .await
            .map_err(|source| ProbeError::Command {
                node: node.name().to_string(),
                source,
            })?;

        match self.classifier.classify(&output) {
            Some(status) => {
                node.set_state(status.into());
                debug!(node = %node.name(), status = %status, "Status probed");
                Ok(status)
            }
            None => Err(ProbeError::Status {
                node: node.name().to_string(),
                status: output.status_label(),
                output: output.text,
            }
            .into()),
        }
    }

    /// Spawn the server. Returns once the process is launched, not once it
    /// accepts connections; see [`Self::wait_until_running`].
    pub async fn start(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.status(node).await? == NodeStatus::Running {
            return Err(LifecycleError::AlreadyRunning {
                node: node.name().to_string(),
            });
        }

        self.control
            .launch(node.data_dir(), node.port())
            .map_err(|source| LifecycleError::LaunchFailed {
                node: node.name().to_string(),
                source,
            })?;

        node.set_state(NodeState::Running);
        info!(node = %node.name(), host = %node.host(), port = node.port(), "Server launched");
        Ok(())
    }

    pub async fn stop(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.status(node).await? == NodeStatus::Stopped {
            return Err(LifecycleError::NotRunning {
                node: node.name().to_string(),
            });
        }

        let output = self
            .control
            .stop(node.data_dir())
            .await
            .map_err(|source| LifecycleError::StopFailed {
                node: node.name().to_string(),
                source,
            })?;

        // The server may already be on its way down
        if !output.success {
            warn!(
                node = %node.name(),
                status = %output.status_label(),
                output = %output.text,
                "Stop command reported failure"
            );
        }

        node.set_state(NodeState::Stopped);
        info!(node = %node.name(), host = %node.host(), port = node.port(), "Server stopped");
        Ok(())
    }

    /// Recursively remove the storage area
    pub async fn destroy(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.status(node).await? == NodeStatus::Running {
            return Err(LifecycleError::StillRunning {
                node: node.name().to_string(),
            });
        }
        debug_assert!(node.state().is_destroyable());

        tokio::fs::remove_dir_all(node.data_dir())
            .await
            .map_err(|source| LifecycleError::DestroyFailed {
                node: node.name().to_string(),
                source,
            })?;

        node.set_state(NodeState::Absent);
        info!(node = %node.name(), path = %node.data_dir().display(), "Storage area removed");
        Ok(())
    }

    /// Poll `status` until the server reports running
    pub async fn wait_until_running(&self, node: &mut Node) -> Result<(), LifecycleError> {
        let started = Instant::now();
        loop {
            if self.status(node).await? == NodeStatus::Running {
                return Ok(());
            }
            if started.elapsed() >= self.ready_timeout {
                return Err(LifecycleError::NotReady {
                    node: node.name().to_string(),
                    waited: started.elapsed(),
                });
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Start the node if it is stopped, then wait for it
    pub async fn ensure_running(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.status(node).await? == NodeStatus::Running {
            return Ok(());
        }
        self.start(node).await?;
        self.wait_until_running(node).await
    }

    /// Stop (when running) and start again, e.g. to apply postmaster settings
    pub async fn restart(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if self.status(node).await? == NodeStatus::Running {
            self.stop(node).await?;
        }
        self.start(node).await?;
        self.wait_until_running(node).await
    }

    async fn require_created(&self, node: &mut Node) -> Result<(), LifecycleError> {
        if !self.exists(node).await? {
            node.set_state(NodeState::Absent);
            return Err(LifecycleError::NotCreated {
                node: node.name().to_string(),
                path: node.data_dir().to_path_buf(),
            });
        }
        Ok(())
    }
}
