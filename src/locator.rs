use crate::core::{Result, TopologyError};
use crate::store::TopologyListener;
use crate::topology::{ClusterTopology, TopologyKind, UNASSIGNED};
use arc_swap::ArcSwap;
use log::{debug, warn};
use std::sync::Arc;

/// Resolves keys to server addresses against a partitioned topology.
///
/// Holds a snapshot that is only swapped when an update actually moves
/// something: the server sequence, a partition master, or the set of view
/// endpoints.
pub struct PartitionLocator {
    snapshot: ArcSwap<ClusterTopology>,
}

impl PartitionLocator {
    pub fn new(topology: Arc<ClusterTopology>) -> Result<Self> {
        ensure_partitioned(&topology)?;
        Ok(Self {
            snapshot: ArcSwap::new(topology),
        })
    }

    pub fn topology(&self) -> Arc<ClusterTopology> {
        self.snapshot.load_full()
    }

    pub fn partition_index(&self, key: &str) -> Result<u32> {
        self.snapshot.load().config().partition_for(key)
    }

    /// Address of the master for `key`, or `None` while the partition has no
    /// master assigned.
    pub fn primary(&self, key: &str) -> Result<Option<String>> {
        let topology = self.snapshot.load();
        let config = topology.config();
        let partition = config.partition_for(key)? as usize;
        let master = config.master(partition)?;
        if master == UNASSIGNED {
            warn!(
                "no master for partition {} (key '{}'); the cluster may be rebalancing",
                partition, key
            );
            return Ok(None);
        }
        Ok(Some(config.server(master as usize)?.to_string()))
    }

    /// Address of replica `index` for `key`. An unassigned replica is an error.
    pub fn replica(&self, key: &str, index: usize) -> Result<String> {
        let topology = self.snapshot.load();
        let config = topology.config();
        let partition = config.partition_for(key)? as usize;
        let server = config.replica(partition, index)?;
        if server == UNASSIGNED {
            return Err(TopologyError::InvalidArgument(format!(
                "no replica {} for partition {}",
                index, partition
            )));
        }
        Ok(config.server(server as usize)?.to_string())
    }

    pub fn server_by_index(&self, index: usize) -> Result<String> {
        Ok(self.snapshot.load().config().server(index)?.to_string())
    }

    /// Another server to try for `key` after the ones in `exclude` failed.
    ///
    /// Replicas of the key's partition are preferred, then any other server
    /// in list order.
    pub fn alternative(&self, key: &str, exclude: &[String]) -> Result<Option<String>> {
        let topology = self.snapshot.load();
        let config = topology.config();
        let partition = config.partition_for(key)? as usize;
        let servers = config.servers();
        let excluded = |server: &String| exclude.iter().any(|other| other == server);

        let replicas = config.partitions()?[partition].replicas().to_vec();
        let from_replicas = replicas
            .into_iter()
            .filter(|&index| index != UNASSIGNED)
            .filter_map(|index| servers.get(index as usize))
            .find(|server| !excluded(*server));
        if let Some(server) = from_replicas {
            return Ok(Some(server.clone()));
        }
        Ok(servers.iter().find(|server| !excluded(*server)).cloned())
    }

    /// Records that `wrong_server` rejected `key` and returns the master
    /// now in effect for it.
    pub fn report_misroute(&self, key: &str, wrong_server: &str) -> Result<Option<String>> {
        let topology = self.snapshot.load();
        let config = topology.config();
        let partition = config.partition_for(key)? as usize;
        let Some(index) = config.servers().iter().position(|s| s == wrong_server) else {
            return Err(TopologyError::InvalidArgument(format!(
                "unknown server {}",
                wrong_server
            )));
        };
        let wrong_index = i16::try_from(index).map_err(|_| {
            TopologyError::InvalidArgument(format!(
                "server {} at position {} is not addressable",
                wrong_server, index
            ))
        })?;
        let master = config.found_incorrect_master(partition, wrong_index)?;
        debug!(
            "misroute on partition {}: master moved from {} to {}",
            partition, index, master
        );
        if master == UNASSIGNED {
            return Ok(None);
        }
        Ok(Some(config.server(master as usize)?.to_string()))
    }

    /// Swaps in `next` when it differs significantly. Returns whether the
    /// snapshot changed.
    pub fn update(&self, next: Arc<ClusterTopology>) -> Result<bool> {
        ensure_partitioned(&next)?;
        let current = self.snapshot.load();
        let difference = current.config().difference(next.config());
        let significant = difference.sequence_changed
            || difference.partition_changes != Some(0)
            || current.config().couch_servers().len() != next.config().couch_servers().len();
        if significant {
            debug!(
                "locator updated for '{}' ({:?})",
                next.name(),
                difference
            );
            self.snapshot.store(next);
        }
        Ok(significant)
    }
}

impl TopologyListener for PartitionLocator {
    fn reconfigure(&self, topology: &Arc<ClusterTopology>) {
        if let Err(err) = self.update(Arc::clone(topology)) {
            warn!("ignoring topology '{}': {}", topology.name(), err);
        }
    }
}

fn ensure_partitioned(topology: &ClusterTopology) -> Result<()> {
    match topology.kind() {
        TopologyKind::Partitioned => Ok(()),
        TopologyKind::Ring => Err(TopologyError::UnsupportedOperation(format!(
            "topology '{}' has no partition map",
            topology.name()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TopologyParser;

    fn topology(map: &str, couch: bool) -> Arc<ClusterTopology> {
        let couch = if couch {
            r#","couchApiBase":"http://a:8092/b""#
        } else {
            ""
        };
        let raw = format!(
            r#"{{"name":"b","nodes":[{{"hostname":"a:8091","ports":{{}}{}}}],
                "partitionServerMap":{{"hashAlgorithm":"CRC","numReplicas":1,
                "serverList":["s0:11210","s1:11210","s2:11210"],"partitionMap":{}}}}}"#,
            couch, map
        );
        Arc::new(TopologyParser::new().parse(&raw).unwrap())
    }

    fn key_for(locator: &PartitionLocator, partition: u32) -> String {
        (0..10_000)
            .map(|i| format!("key-{}", i))
            .find(|key| locator.partition_index(key).unwrap() == partition)
            .unwrap()
    }

    #[test]
    fn test_primary_and_replica() {
        let locator = PartitionLocator::new(topology("[[0,1],[1,2],[2,-1],[-1,0]]", false)).unwrap();
        let key = key_for(&locator, 1);
        assert_eq!(locator.primary(&key).unwrap().as_deref(), Some("s1:11210"));
        assert_eq!(locator.replica(&key, 0).unwrap(), "s2:11210");

        let key = key_for(&locator, 2);
        assert!(locator.replica(&key, 0).is_err());

        let key = key_for(&locator, 3);
        assert_eq!(locator.primary(&key).unwrap(), None);
        assert_eq!(locator.server_by_index(2).unwrap(), "s2:11210");
    }

    #[test]
    fn test_alternative_prefers_replica() {
        let locator = PartitionLocator::new(topology("[[0,1],[1,2],[2,-1],[-1,0]]", false)).unwrap();
        let key = key_for(&locator, 0);
        let alt = locator.alternative(&key, &["s0:11210".to_string()]).unwrap();
        assert_eq!(alt.as_deref(), Some("s1:11210"));
        let alt = locator
            .alternative(&key, &["s0:11210".to_string(), "s1:11210".to_string()])
            .unwrap();
        assert_eq!(alt.as_deref(), Some("s2:11210"));
    }

    #[test]
    fn test_report_misroute_moves_master() {
        let locator = PartitionLocator::new(topology("[[0,1],[1,2],[2,-1],[-1,0]]", false)).unwrap();
        let key = key_for(&locator, 0);
        let next = locator.report_misroute(&key, "s0:11210").unwrap();
        assert_eq!(next.as_deref(), Some("s1:11210"));
        assert_eq!(locator.primary(&key).unwrap().as_deref(), Some("s1:11210"));
    }

    #[test]
    fn test_report_misroute_on_last_addressable_server_wraps() {
        let servers: Vec<String> = (0..i16::MAX as usize)
            .map(|i| format!("s{}:11210", i))
            .collect();
        let last = servers[servers.len() - 1].clone();
        let raw = serde_json::json!({
            "name": "b",
            "nodes": [{"hostname": "a:8091", "ports": {}}],
            "partitionServerMap": {
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": servers, "partitionMap": [[i16::MAX - 1]]
            }
        })
        .to_string();
        let topology = Arc::new(TopologyParser::new().parse(&raw).unwrap());
        let locator = PartitionLocator::new(topology).unwrap();

        assert_eq!(locator.primary("any").unwrap(), Some(last.clone()));
        let next = locator.report_misroute("any", &last).unwrap();
        assert_eq!(next.as_deref(), Some("s0:11210"));
    }

    #[test]
    fn test_update_only_on_significant_change() {
        let locator = PartitionLocator::new(topology("[[0,1],[1,2],[2,-1],[-1,0]]", false)).unwrap();
        assert!(!locator.update(topology("[[0,2],[1,2],[2,-1],[-1,0]]", false)).unwrap());
        assert!(locator.update(topology("[[1,2],[1,2],[2,-1],[-1,0]]", false)).unwrap());
        assert!(locator.update(topology("[[1,2],[1,2],[2,-1],[-1,0]]", true)).unwrap());
    }
}
