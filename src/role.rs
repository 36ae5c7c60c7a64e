//! Who an agent is for a given session.
//!
//! Every agent takes part in every session as a plain node agent. The
//! agent on the node the session originates from additionally acts as the
//! source: it alone may flip `AgentsReady` and `Terminate` to True, and the
//! writes that do so take the [`Authority`] only a source role carries.

use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use log::{debug, warn};
use crate::data::Source;

/// Cluster facts an agent cannot learn from the session record.
#[async_trait]
pub trait Cluster: Send + Sync {
    async fn node_count(&self) -> Result<u32>;

    async fn pod_node(&self, namespace: &str, pod: &str) -> Result<Option<String>>;
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Role {
    Node,
    Source(Authority),
}

/// Permission to write the source-only coordination signals, together
/// with the readiness threshold captured when the session started.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Authority {
    expected: Option<u32>,
}

impl Authority {
    pub fn expected(&self) -> Option<u32> {
        self.expected
    }
}

impl Role {
    pub fn is_source(&self) -> bool {
        matches!(self, Self::Source(_))
    }

    /// Decides this node's role. A lookup failure while locating the
    /// source pod is returned to the caller; a failure counting nodes
    /// still yields a source role, one that can never declare readiness.
    pub async fn resolve(source: &Source, node: &str, cluster: &dyn Cluster) -> Result<Self> {
        if !is_source(source, node, cluster).await? {
            return Ok(Self::Node);
        }

        let expected = match cluster.node_count().await {
            Ok(0)     => {
                warn!("cluster reports no nodes");
                None
            }
            Ok(count) => Some(count),
            Err(e)    => {
                warn!("unable to count cluster nodes: {:?}", e);
                None
            }
        };

        Ok(Self::Source(Authority { expected }))
    }
}

async fn is_source(source: &Source, node: &str, cluster: &dyn Cluster) -> Result<bool> {
    if let Some(name) = source.node() {
        return Ok(name == node);
    }

    if let Some(pod) = source.pod() {
        let namespace = source.namespace().unwrap_or("default");
        let located = cluster.pod_node(namespace, pod).await?;
        debug!("pod {}/{} runs on {:?}", namespace, pod, located);
        return Ok(located.as_deref() == Some(node));
    }

    Ok(false)
}

/// Pins the node count, leaving pod lookups to the wrapped cluster.
pub struct Pinned {
    nodes: u32,
    inner: Option<Arc<dyn Cluster>>,
}

impl Pinned {
    pub fn new(nodes: u32, inner: Option<Arc<dyn Cluster>>) -> Self {
        Self { nodes, inner }
    }
}

#[async_trait]
impl Cluster for Pinned {
    async fn node_count(&self) -> Result<u32> {
        Ok(self.nodes)
    }

    async fn pod_node(&self, namespace: &str, pod: &str) -> Result<Option<String>> {
        match &self.inner {
            Some(inner) => inner.pod_node(namespace, pod).await,
            None        => Ok(None),
        }
    }
}
