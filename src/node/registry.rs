//! Node Registry
//!
//! Owns the single `Node` for each storage area.

use std::sync::Arc;
use tokio::sync::Mutex;

use super::error::LifecycleError;
use super::Node;
use crate::config::{NodeConfig, NodesConfig};

/// Exclusive-access handle to one node
pub type SharedNode = Arc<Mutex<Node>>;

#[derive(Debug)]
pub struct NodeRegistry {
    nodes: Vec<(NodeConfig, SharedNode)>,
}

impl NodeRegistry {
    pub fn new(configs: impl IntoIterator<Item = NodeConfig>) -> Result<Self, LifecycleError> {
        let mut nodes: Vec<(NodeConfig, SharedNode)> = Vec::new();
        for config in configs {
            if let Some((existing, _)) = nodes.iter().find(|(c, _)| c.data_dir == config.data_dir)
            {
                return Err(LifecycleError::DuplicateStorageArea {
                    path: config.data_dir.clone(),
                    first: existing.name.clone(),
                    second: config.name.clone(),
                });
            }
            let node = Arc::new(Mutex::new(Node::new(config.clone())));
            nodes.push((config, node));
        }
        Ok(Self { nodes })
    }

    /// Registry for the configured source/target pair
    pub fn from_pair(config: &NodesConfig) -> Result<Self, LifecycleError> {
        Self::new([config.a.clone(), config.b.clone()])
    }

    pub fn get(&self, name: &str) -> Option<SharedNode> {
        self.nodes
            .iter()
            .find(|(c, _)| c.name == name)
            .map(|(_, n)| n.clone())
    }

    /// Static config of every node, in registration order. Readable without
    /// taking any node lock.
    pub fn configs(&self) -> impl Iterator<Item = &NodeConfig> {
        self.nodes.iter().map(|(c, _)| c)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SharedNode> {
        self.nodes.iter().map(|(_, n)| n)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
