// ============================================================================
// clustertopo Library
// ============================================================================

//! Cluster topology discovery and partition routing for a partitioned
//! document store, plus a generic retry/backoff layer.
//!
//! # Examples
//!
//! ```
//! use clustertopo::{PartitionLocator, TopologyParser};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = r#"{
//!     "name": "default",
//!     "nodes": [{"hostname": "10.0.0.1:8091", "ports": {"direct": 11210}}],
//!     "partitionServerMap": {
//!         "hashAlgorithm": "CRC",
//!         "numReplicas": 0,
//!         "serverList": ["10.0.0.1:11210"],
//!         "partitionMap": [[0], [0], [0], [0]]
//!     }
//! }"#;
//! let topology = Arc::new(TopologyParser::new().parse(raw)?);
//! let locator = PartitionLocator::new(topology)?;
//! assert_eq!(locator.primary("user::42")?.as_deref(), Some("10.0.0.1:11210"));
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod locator;
pub mod parser;
pub mod prelude;
pub mod provider;
pub mod retry;
pub mod store;
pub mod topology;

pub use core::{Result, TopologyError};
pub use locator::PartitionLocator;
pub use parser::TopologyParser;
pub use provider::{
    ChannelKind, ConfigurationProvider, ProviderConfig, ProviderStats, TopologyProvider,
};
pub use retry::{Delay, Retry, RetryBuilder, RetryError, RetryFilter, TimeUnit};
pub use store::{ApplyOutcome, SubscriptionId, TopologyListener, TopologyStore};
pub use topology::{
    ClusterTopology, HashAlgorithm, Node, NodeStatus, Partition, TopologyConfig, TopologyKind,
};
