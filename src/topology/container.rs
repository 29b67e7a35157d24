use crate::topology::config::{TopologyConfig, TopologyKind};
use crate::topology::node::Node;
use std::sync::atomic::{AtomicBool, Ordering};

/// A parsed bucket topology as held by the provider.
///
/// Immutable once installed, apart from the `not_updating` flag and the
/// partition masters corrected through [`TopologyConfig::found_incorrect_master`].
#[derive(Debug)]
pub struct ClusterTopology {
    name: String,
    config: TopologyConfig,
    streaming_uri: Option<String>,
    nodes: Vec<Node>,
    not_updating: AtomicBool,
}

impl ClusterTopology {
    pub fn new(
        name: impl Into<String>,
        config: TopologyConfig,
        streaming_uri: Option<String>,
        nodes: Vec<Node>,
    ) -> Self {
        Self {
            name: name.into(),
            config,
            streaming_uri,
            nodes,
            not_updating: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TopologyConfig {
        &self.config
    }

    pub fn kind(&self) -> TopologyKind {
        self.config.kind()
    }

    pub fn streaming_uri(&self) -> Option<&str> {
        self.streaming_uri.as_deref()
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn revision(&self) -> u64 {
        self.config.revision()
    }

    pub fn is_tainted(&self) -> bool {
        self.config.is_tainted()
    }

    /// Flags the topology as no longer monitored. A flagged topology must be
    /// resynchronised before it is trusted again.
    pub fn mark_not_updating(&self) {
        self.not_updating.store(true, Ordering::Release);
    }

    pub fn is_not_updating(&self) -> bool {
        self.not_updating.load(Ordering::Acquire)
    }
}
