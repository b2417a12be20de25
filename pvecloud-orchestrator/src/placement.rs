use std::sync::Arc;

use pvecloud_common::{CloudError, Result};
use pvecloud_providers::{Hypervisor, NodeStatus};

/// Picks the cluster node a new instance is cloned onto.
///
/// The hypervisor has no placement of its own, so every call lists the nodes
/// and scores the ones with enough headroom. Nothing is cached: capacity
/// changes with every clone.
#[derive(Clone)]
pub struct NodeSelector {
    hypervisor: Arc<dyn Hypervisor>,
    coeff: f64,
}

impl NodeSelector {
    /// `coeff` is the number of free bytes worth one free core.
    pub fn new(hypervisor: Arc<dyn Hypervisor>, coeff: f64) -> Self {
        Self { hypervisor, coeff }
    }

    pub async fn select(&self, min_cpu: i32, min_ram_bytes: u64) -> Result<String> {
        let nodes = self.hypervisor.list_nodes().await?;
        match pick_best_node(&nodes, min_cpu, min_ram_bytes, self.coeff) {
            Some(node) => {
                tracing::info!(
                    "[Placement] selected node {} for cpus={} ram_bytes={}",
                    node.node,
                    min_cpu,
                    min_ram_bytes
                );
                Ok(node.node.clone())
            }
            None => {
                tracing::warn!(
                    "⚠️ [Placement] no node among {} can host cpus={} ram_bytes={}",
                    nodes.len(),
                    min_cpu,
                    min_ram_bytes
                );
                Err(CloudError::NoCapacity {
                    cpus: min_cpu,
                    ram_bytes: min_ram_bytes,
                })
            }
        }
    }
}

pub fn free_cpu(node: &NodeStatus) -> f64 {
    node.maxcpu - node.cpu
}

pub fn free_mem(node: &NodeStatus) -> u64 {
    node.maxmem.saturating_sub(node.mem)
}

pub fn score(node: &NodeStatus, coeff: f64) -> f64 {
    free_cpu(node) + free_mem(node) as f64 / coeff
}

/// Highest-scoring node with strictly more free cpu and memory than asked.
/// Ties keep the node listed first.
pub fn pick_best_node(
    nodes: &[NodeStatus],
    min_cpu: i32,
    min_ram_bytes: u64,
    coeff: f64,
) -> Option<&NodeStatus> {
    let mut best: Option<(&NodeStatus, f64)> = None;
    for node in nodes {
        if free_cpu(node) <= f64::from(min_cpu) || free_mem(node) <= min_ram_bytes {
            continue;
        }
        let s = score(node, coeff);
        match best {
            Some((_, top)) if s <= top => {}
            _ => best = Some((node, s)),
        }
    }
    best.map(|(node, _)| node)
}
