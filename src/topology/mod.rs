pub mod config;
pub mod container;
pub mod hash;
pub mod node;
pub mod partition;

pub use config::{
    MAX_PARTITIONS, PartitionedConfig, RingConfig, TopologyConfig, TopologyDifference,
    TopologyKind,
};
pub use container::ClusterTopology;
pub use hash::HashAlgorithm;
pub use node::{Node, NodeStatus};
pub use partition::{MAX_REPLICAS, Partition, UNASSIGNED};
