use crate::core::{Result, TopologyError};
use crate::topology::hash::HashAlgorithm;
use crate::topology::node::host_part;
use crate::topology::partition::{MAX_REPLICAS, Partition, UNASSIGNED};
use std::collections::HashSet;
use std::sync::Arc;

/// Largest partition count a partitioned topology may declare.
pub const MAX_PARTITIONS: usize = 65_536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopologyKind {
    /// Document store: keys hash into a fixed set of partitions.
    Partitioned,
    /// Simple ring of servers without partitions or replicas.
    Ring,
}

/// Result of comparing two topologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopologyDifference {
    /// The ordered server list differs.
    pub sequence_changed: bool,
    /// Partitions whose master moved. `None` when the two topologies are not
    /// both partitioned with the same partition count.
    pub partition_changes: Option<usize>,
}

impl TopologyDifference {
    pub fn is_empty(&self) -> bool {
        !self.sequence_changed && self.partition_changes == Some(0)
    }
}

/// Partition map of a document-store bucket.
#[derive(Debug, Clone)]
pub struct PartitionedConfig {
    hash: HashAlgorithm,
    replicas_count: usize,
    mask: u32,
    servers: Vec<String>,
    partitions: Vec<Arc<Partition>>,
    couch_servers: Vec<String>,
    rest_endpoints: Vec<String>,
    active_hosts: HashSet<String>,
    tainted: bool,
    revision: u64,
}

impl PartitionedConfig {
    /// Creates a validated partition map.
    ///
    /// The partition count must be a non-zero power of two no larger than
    /// [`MAX_PARTITIONS`]. The server list must be non-empty and addressable
    /// by an `i16` server index. Each partition must sit at its own index.
    pub fn new(
        hash: HashAlgorithm,
        replicas_count: usize,
        servers: Vec<String>,
        partitions: Vec<Arc<Partition>>,
    ) -> Result<Self> {
        if replicas_count > MAX_REPLICAS {
            return Err(TopologyError::Parse(format!(
                "replica count {} exceeds the maximum of {}",
                replicas_count, MAX_REPLICAS
            )));
        }
        if servers.is_empty() {
            return Err(TopologyError::Parse("server list is empty".to_string()));
        }
        if servers.len() > i16::MAX as usize {
            return Err(TopologyError::Parse(format!(
                "server list of {} exceeds the maximum of {}",
                servers.len(),
                i16::MAX
            )));
        }
        let count = partitions.len();
        if count == 0 || !count.is_power_of_two() {
            return Err(TopologyError::Parse(format!(
                "partition count {} is not a non-zero power of two",
                count
            )));
        }
        if count > MAX_PARTITIONS {
            return Err(TopologyError::Parse(format!(
                "partition count {} exceeds the maximum of {}",
                count, MAX_PARTITIONS
            )));
        }

        let mut active_hosts = HashSet::new();
        for (index, partition) in partitions.iter().enumerate() {
            if partition.index() != index {
                return Err(TopologyError::Parse(format!(
                    "partition {} is stored at position {}",
                    partition.index(),
                    index
                )));
            }
            let master = partition.master();
            if master == UNASSIGNED {
                continue;
            }
            match servers.get(master as usize) {
                Some(server) => {
                    active_hosts.insert(host_part(server).to_string());
                }
                None => {
                    return Err(TopologyError::Parse(format!(
                        "master index {} is outside the server list of {}",
                        master,
                        servers.len()
                    )));
                }
            }
        }

        Ok(Self {
            hash,
            replicas_count,
            mask: (count - 1) as u32,
            servers,
            partitions,
            couch_servers: Vec::new(),
            rest_endpoints: Vec::new(),
            active_hosts,
            tainted: false,
            revision: 0,
        })
    }

    pub fn with_couch_servers(mut self, couch_servers: Vec<String>) -> Self {
        self.couch_servers = couch_servers;
        self
    }

    pub fn with_rest_endpoints(mut self, rest_endpoints: Vec<String>) -> Self {
        self.rest_endpoints = rest_endpoints;
        self
    }

    pub fn with_tainted(mut self, tainted: bool) -> Self {
        self.tainted = tainted;
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn hash_algorithm(&self) -> HashAlgorithm {
        self.hash
    }

    pub fn replicas_count(&self) -> usize {
        self.replicas_count
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn partitions(&self) -> &[Arc<Partition>] {
        &self.partitions
    }

    pub fn partition(&self, index: usize) -> Option<&Arc<Partition>> {
        self.partitions.get(index)
    }

    /// `hash(key) & (partition_count - 1)`.
    pub fn partition_for(&self, key: &str) -> u32 {
        self.hash.hash(key) & self.mask
    }

    pub fn master(&self, partition: usize) -> Result<i16> {
        Ok(self.partition_at(partition)?.master())
    }

    pub fn replica(&self, partition: usize, replica: usize) -> Result<i16> {
        if replica >= MAX_REPLICAS {
            return Err(TopologyError::InvalidArgument(format!(
                "replica index {} is out of range",
                replica
            )));
        }
        Ok(self.partition_at(partition)?.replica(replica))
    }

    /// Moves the master of `partition` off `wrong_server` after a misroute.
    ///
    /// When the mapped master still equals `wrong_server`, the next server in
    /// the list becomes master. Returns the master in effect afterwards.
    pub fn found_incorrect_master(&self, partition: usize, wrong_server: i16) -> Result<i16> {
        let entry = self.partition_at(partition)?;
        let server_count = i16::try_from(self.servers.len()).map_err(|_| {
            TopologyError::InvalidArgument(format!(
                "server list of {} is not addressable",
                self.servers.len()
            ))
        })?;
        if wrong_server >= 0 && entry.master() == wrong_server {
            let next = (wrong_server + 1) % server_count;
            entry.replace_master(wrong_server, next);
        }
        Ok(entry.master())
    }

    /// True if `host` masters at least one partition.
    pub fn node_has_active_partitions(&self, host: &str) -> bool {
        self.active_hosts.contains(host_part(host))
    }

    fn partition_at(&self, partition: usize) -> Result<&Arc<Partition>> {
        self.partitions.get(partition).ok_or_else(|| {
            TopologyError::InvalidArgument(format!(
                "partition {} is out of range (count {})",
                partition,
                self.partitions.len()
            ))
        })
    }
}

/// Server list of a non-partitioned ring bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingConfig {
    servers: Vec<String>,
    rest_endpoints: Vec<String>,
    revision: u64,
}

impl RingConfig {
    pub fn new(servers: Vec<String>) -> Result<Self> {
        if servers.is_empty() {
            return Err(TopologyError::Parse("server list is empty".to_string()));
        }
        Ok(Self {
            servers,
            rest_endpoints: Vec::new(),
            revision: 0,
        })
    }

    pub fn with_rest_endpoints(mut self, rest_endpoints: Vec<String>) -> Self {
        self.rest_endpoints = rest_endpoints;
        self
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }
}

/// Topology payload of a bucket, either partitioned or ring.
#[derive(Debug, Clone)]
pub enum TopologyConfig {
    Partitioned(PartitionedConfig),
    Ring(RingConfig),
}

impl TopologyConfig {
    pub fn kind(&self) -> TopologyKind {
        match self {
            Self::Partitioned(_) => TopologyKind::Partitioned,
            Self::Ring(_) => TopologyKind::Ring,
        }
    }

    pub fn as_partitioned(&self) -> Result<&PartitionedConfig> {
        match self {
            Self::Partitioned(config) => Ok(config),
            Self::Ring(_) => Err(TopologyError::UnsupportedOperation(
                "ring topologies have no partitions".to_string(),
            )),
        }
    }

    pub fn servers(&self) -> &[String] {
        match self {
            Self::Partitioned(config) => &config.servers,
            Self::Ring(config) => &config.servers,
        }
    }

    pub fn server_count(&self) -> usize {
        self.servers().len()
    }

    pub fn server(&self, index: usize) -> Result<&str> {
        let servers = self.servers();
        servers.get(index).map(String::as_str).ok_or_else(|| {
            TopologyError::InvalidArgument(format!(
                "server index {} is out of range (count {})",
                index,
                servers.len()
            ))
        })
    }

    pub fn rest_endpoints(&self) -> &[String] {
        match self {
            Self::Partitioned(config) => &config.rest_endpoints,
            Self::Ring(config) => &config.rest_endpoints,
        }
    }

    /// View endpoints. Ring topologies have none.
    pub fn couch_servers(&self) -> &[String] {
        match self {
            Self::Partitioned(config) => &config.couch_servers,
            Self::Ring(_) => &[],
        }
    }

    pub fn is_tainted(&self) -> bool {
        match self {
            Self::Partitioned(config) => config.tainted,
            Self::Ring(_) => false,
        }
    }

    /// Revision of the document; `0` means unversioned.
    pub fn revision(&self) -> u64 {
        match self {
            Self::Partitioned(config) => config.revision,
            Self::Ring(config) => config.revision,
        }
    }

    pub fn hash_algorithm(&self) -> Result<HashAlgorithm> {
        Ok(self.as_partitioned()?.hash_algorithm())
    }

    pub fn replicas_count(&self) -> Result<usize> {
        Ok(self.as_partitioned()?.replicas_count())
    }

    pub fn partition_count(&self) -> Result<usize> {
        Ok(self.as_partitioned()?.partition_count())
    }

    pub fn partitions(&self) -> Result<&[Arc<Partition>]> {
        Ok(self.as_partitioned()?.partitions())
    }

    pub fn partition_for(&self, key: &str) -> Result<u32> {
        Ok(self.as_partitioned()?.partition_for(key))
    }

    pub fn master(&self, partition: usize) -> Result<i16> {
        self.as_partitioned()?.master(partition)
    }

    pub fn replica(&self, partition: usize, replica: usize) -> Result<i16> {
        self.as_partitioned()?.replica(partition, replica)
    }

    pub fn found_incorrect_master(&self, partition: usize, wrong_server: i16) -> Result<i16> {
        self.as_partitioned()?
            .found_incorrect_master(partition, wrong_server)
    }

    pub fn node_has_active_partitions(&self, host: &str) -> Result<bool> {
        Ok(self.as_partitioned()?.node_has_active_partitions(host))
    }

    /// Compares this topology with `other`.
    ///
    /// The server sequence is compared positionally. Master changes are only
    /// counted when `other` is also partitioned with the same partition count.
    pub fn difference(&self, other: &TopologyConfig) -> TopologyDifference {
        let sequence_changed = self.servers() != other.servers();
        let partition_changes = match (self, other) {
            (Self::Partitioned(mine), Self::Partitioned(theirs))
                if mine.partition_count() == theirs.partition_count() =>
            {
                Some(
                    mine.partitions
                        .iter()
                        .zip(theirs.partitions.iter())
                        .filter(|(a, b)| a.master() != b.master())
                        .count(),
                )
            }
            _ => None,
        };
        TopologyDifference {
            sequence_changed,
            partition_changes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn servers(count: usize) -> Vec<String> {
        (0..count).map(|i| format!("10.0.0.{}:11210", i + 1)).collect()
    }

    fn partitions(rows: &[[i16; 2]]) -> Vec<Arc<Partition>> {
        rows.iter()
            .enumerate()
            .map(|(index, row)| Arc::new(Partition::from_row(index, row)))
            .collect()
    }

    fn sample() -> PartitionedConfig {
        PartitionedConfig::new(
            HashAlgorithm::Crc,
            1,
            servers(2),
            partitions(&[[0, 1], [1, 0], [0, 1], [1, 0]]),
        )
        .expect("valid config")
    }

    #[test]
    fn test_rejects_non_power_of_two_partition_count() {
        let err = PartitionedConfig::new(
            HashAlgorithm::Crc,
            1,
            servers(2),
            partitions(&[[0, 1], [1, 0], [0, 1]]),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_rejects_empty_partitions_and_servers() {
        assert!(PartitionedConfig::new(HashAlgorithm::Crc, 0, servers(1), Vec::new()).is_err());
        assert!(
            PartitionedConfig::new(HashAlgorithm::Crc, 0, Vec::new(), partitions(&[[0, -1]]))
                .is_err()
        );
    }

    #[test]
    fn test_rejects_too_many_replicas() {
        let err =
            PartitionedConfig::new(HashAlgorithm::Crc, 4, servers(1), partitions(&[[0, -1]]))
                .unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_rejects_server_list_beyond_index_range() {
        let limit = i16::MAX as usize;
        let err = PartitionedConfig::new(
            HashAlgorithm::Crc,
            0,
            servers(limit + 1),
            partitions(&[[0, -1]]),
        )
        .unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));

        let config =
            PartitionedConfig::new(HashAlgorithm::Crc, 0, servers(limit), partitions(&[[0, -1]]))
                .unwrap();
        let last = (limit - 1) as i16;
        config.partition(0).unwrap().set_master(last);
        assert_eq!(config.found_incorrect_master(0, last).unwrap(), 0);
    }

    #[test]
    fn test_rejects_partition_out_of_position() {
        let misplaced = vec![
            Arc::new(Partition::from_row(1, &[0, -1])),
            Arc::new(Partition::from_row(0, &[0, -1])),
        ];
        let err =
            PartitionedConfig::new(HashAlgorithm::Crc, 0, servers(1), misplaced).unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_partition_for_uses_mask() {
        let config = sample();
        for key in ["a", "b", "user::1", "order::99"] {
            let expected = HashAlgorithm::Crc.hash(key) & 3;
            assert_eq!(config.partition_for(key), expected);
            assert!(config.partition_for(key) < 4);
        }
    }

    #[test]
    fn test_found_incorrect_master_advances_once() {
        let config = sample();
        assert_eq!(config.found_incorrect_master(0, 0).unwrap(), 1);
        assert_eq!(config.master(0).unwrap(), 1);
        // Reporting the old master again does not move it further.
        assert_eq!(config.found_incorrect_master(0, 0).unwrap(), 1);
        assert_eq!(config.found_incorrect_master(0, 1).unwrap(), 0);
    }

    #[test]
    fn test_node_has_active_partitions() {
        let config = PartitionedConfig::new(
            HashAlgorithm::Crc,
            1,
            servers(3),
            partitions(&[[0, 1], [1, 0]]),
        )
        .unwrap();
        assert!(config.node_has_active_partitions("10.0.0.1"));
        assert!(config.node_has_active_partitions("10.0.0.2:8091"));
        assert!(!config.node_has_active_partitions("10.0.0.3"));
    }

    #[test]
    fn test_ring_rejects_partition_queries() {
        let ring = TopologyConfig::Ring(RingConfig::new(servers(2)).unwrap());
        assert!(matches!(
            ring.partition_for("key"),
            Err(TopologyError::UnsupportedOperation(_))
        ));
        assert!(matches!(
            ring.replica(0, 0),
            Err(TopologyError::UnsupportedOperation(_))
        ));
        assert!(!ring.is_tainted());
    }

    #[test]
    fn test_difference_against_self_is_empty() {
        let config = TopologyConfig::Partitioned(sample());
        let diff = config.difference(&config);
        assert!(diff.is_empty());
    }

    #[test]
    fn test_difference_counts_master_changes() {
        let before = TopologyConfig::Partitioned(sample());
        let after = TopologyConfig::Partitioned(
            PartitionedConfig::new(
                HashAlgorithm::Crc,
                1,
                servers(2),
                partitions(&[[1, 0], [1, 0], [1, 0], [1, 0]]),
            )
            .unwrap(),
        );
        let diff = before.difference(&after);
        assert!(!diff.sequence_changed);
        assert_eq!(diff.partition_changes, Some(2));

        let ring = TopologyConfig::Ring(RingConfig::new(servers(3)).unwrap());
        let diff = before.difference(&ring);
        assert!(diff.sequence_changed);
        assert_eq!(diff.partition_changes, None);
    }
}
