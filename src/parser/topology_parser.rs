// ============================================================================
// src/parser/topology_parser.rs - raw JSON document -> ClusterTopology
// ============================================================================

use crate::core::{Result, TopologyError};
use crate::parser::raw::{RawDocument, RawNode, RawServerMap};
use crate::topology::{
    ClusterTopology, HashAlgorithm, MAX_PARTITIONS, MAX_REPLICAS, Node, NodeStatus, Partition,
    PartitionedConfig, RingConfig, TopologyConfig, UNASSIGNED,
};
use log::{debug, warn};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Bucket name assumed when a document does not carry one.
pub const DEFAULT_BUCKET_NAME: &str = "default";

/// Port name carrying the data-service port of ring nodes.
pub const DIRECT_PORT: &str = "direct";

/// Turns topology documents into [`ClusterTopology`] values.
///
/// A document with a `partitionServerMap` is parsed as a partitioned
/// topology, anything else as a ring of servers.
#[derive(Debug, Default, Clone, Copy)]
pub struct TopologyParser;

impl TopologyParser {
    pub fn new() -> Self {
        Self
    }

    pub fn parse(&self, raw: &str) -> Result<ClusterTopology> {
        self.parse_with_previous(raw, None)
    }

    /// Parses `raw`, reusing partitions of `previous` whose master and
    /// replicas did not change.
    pub fn parse_with_previous(
        &self,
        raw: &str,
        previous: Option<&ClusterTopology>,
    ) -> Result<ClusterTopology> {
        let document: RawDocument = serde_json::from_str(raw)?;
        self.convert_document(document, previous)
    }

    fn convert_document(
        &self,
        document: RawDocument,
        previous: Option<&ClusterTopology>,
    ) -> Result<ClusterTopology> {
        let name = document
            .name
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| DEFAULT_BUCKET_NAME.to_string());
        if document.nodes.is_empty() {
            return Err(TopologyError::Parse("node list is empty".to_string()));
        }
        let revision = document.rev.unwrap_or(0);
        let nodes = self.convert_nodes(&document.nodes)?;
        let rest_endpoints = nodes
            .iter()
            .map(|node| format!("http://{}/pools", node.hostname))
            .collect::<Vec<_>>();

        let config = match document.partition_server_map {
            Some(map) => {
                let previous_config = previous
                    .filter(|topology| topology.name() == name)
                    .and_then(|topology| topology.config().as_partitioned().ok());
                let tainted = document
                    .tainted
                    .unwrap_or(map.partition_map_forward.is_some());
                let couch_servers = self.convert_couch_servers(&document.nodes)?;
                let config = self
                    .convert_partitioned(map, previous_config)?
                    .with_couch_servers(couch_servers)
                    .with_rest_endpoints(rest_endpoints)
                    .with_tainted(tainted)
                    .with_revision(revision);
                TopologyConfig::Partitioned(config)
            }
            None => {
                let config = self
                    .convert_ring(&nodes)?
                    .with_rest_endpoints(rest_endpoints)
                    .with_revision(revision);
                TopologyConfig::Ring(config)
            }
        };

        debug!(
            "parsed {:?} topology '{}' rev {} with {} servers",
            config.kind(),
            name,
            revision,
            config.server_count()
        );
        Ok(ClusterTopology::new(
            name,
            config,
            document.streaming_uri,
            nodes,
        ))
    }

    fn convert_partitioned(
        &self,
        map: RawServerMap,
        previous: Option<&PartitionedConfig>,
    ) -> Result<PartitionedConfig> {
        let hash = HashAlgorithm::lookup(&map.hash_algorithm).ok_or_else(|| {
            TopologyError::Parse(format!(
                "unhandled hash algorithm type: {}",
                map.hash_algorithm
            ))
        })?;
        if map.num_replicas > MAX_REPLICAS {
            return Err(TopologyError::Parse(format!(
                "expected at most {} replicas, got {}",
                MAX_REPLICAS, map.num_replicas
            )));
        }
        if map.server_list.is_empty() {
            return Err(TopologyError::Parse("server list is empty".to_string()));
        }
        if map.server_list.len() > i16::MAX as usize {
            return Err(TopologyError::Parse(format!(
                "server list of {} exceeds the maximum of {}",
                map.server_list.len(),
                i16::MAX
            )));
        }
        let count = map.partition_map.len();
        if count == 0 || !count.is_power_of_two() || count > MAX_PARTITIONS {
            return Err(TopologyError::Parse(format!(
                "number of partitions must be a power of two, > 0 and <= {} (got {})",
                MAX_PARTITIONS, count
            )));
        }

        let reusable = previous.filter(|config| config.partition_count() == count);
        let server_count = map.server_list.len();
        let mut partitions = Vec::with_capacity(count);
        let mut reused = 0usize;
        for (index, row) in map.partition_map.iter().enumerate() {
            let row = self.convert_row(index, row, server_count)?;
            match reusable
                .and_then(|config| config.partition(index))
                .filter(|old| old.same_assignment(&row))
            {
                Some(old) => {
                    reused += 1;
                    partitions.push(Arc::clone(old));
                }
                None => partitions.push(Arc::new(Partition::from_row(index, &row))),
            }
        }
        if reusable.is_some() {
            debug!("reused {} of {} partitions", reused, count);
        }

        PartitionedConfig::new(hash, map.num_replicas, map.server_list, partitions)
    }

    fn convert_row(&self, index: usize, row: &[i64], server_count: usize) -> Result<Vec<i16>> {
        if row.is_empty() || row.len() > MAX_REPLICAS + 1 {
            return Err(TopologyError::Parse(format!(
                "partition {} has {} entries, expected 1 to {}",
                index,
                row.len(),
                MAX_REPLICAS + 1
            )));
        }
        row.iter()
            .map(|&server| {
                let assigned = usize::try_from(server).is_ok_and(|server| server < server_count);
                match i16::try_from(server) {
                    Ok(server) if assigned || server == UNASSIGNED => Ok(server),
                    _ => Err(TopologyError::Parse(format!(
                        "partition {} references server {} outside a list of {}",
                        index, server, server_count
                    ))),
                }
            })
            .collect()
    }

    fn convert_ring(&self, nodes: &[Node]) -> Result<RingConfig> {
        let servers = nodes
            .iter()
            .map(|node| {
                node.port(DIRECT_PORT)
                    .map(|port| format!("{}:{}", node.host(), port))
                    .ok_or_else(|| {
                        TopologyError::Parse(format!(
                            "node {} has no '{}' port",
                            node.hostname, DIRECT_PORT
                        ))
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        RingConfig::new(servers)
    }

    fn convert_nodes(&self, raw: &[RawNode]) -> Result<Vec<Node>> {
        raw.iter()
            .map(|node| {
                let hostname = node
                    .hostname
                    .clone()
                    .filter(|hostname| !hostname.is_empty())
                    .ok_or_else(|| TopologyError::Parse("node without hostname".to_string()))?;
                let status = node
                    .status
                    .as_deref()
                    .map(NodeStatus::parse)
                    .unwrap_or_default();
                let ports = self.convert_ports(&hostname, &node.ports)?;
                Ok(Node::new(status, hostname, ports))
            })
            .collect()
    }

    fn convert_ports(
        &self,
        hostname: &str,
        raw: &BTreeMap<String, Value>,
    ) -> Result<BTreeMap<String, u16>> {
        let mut ports = BTreeMap::new();
        for (service, value) in raw {
            let port = match value {
                Value::Number(number) => number.as_u64().and_then(|n| u16::try_from(n).ok()),
                Value::String(text) if text.is_empty() => continue,
                Value::String(text) => text.parse::<u16>().ok(),
                Value::Null => continue,
                _ => None,
            };
            match port {
                Some(port) => {
                    ports.insert(service.clone(), port);
                }
                None => {
                    return Err(TopologyError::Parse(format!(
                        "node {} has an invalid '{}' port: {}",
                        hostname, service, value
                    )));
                }
            }
        }
        Ok(ports)
    }

    fn convert_couch_servers(&self, raw: &[RawNode]) -> Result<Vec<String>> {
        let mut servers = Vec::new();
        for base in raw.iter().filter_map(|node| node.couch_api_base.as_deref()) {
            if !(base.starts_with("http://") || base.starts_with("https://")) {
                warn!("rejecting couchApiBase '{}'", base);
                return Err(TopologyError::Parse(format!(
                    "bad couchApiBase URL: {}",
                    base
                )));
            }
            servers.push(base.to_string());
        }
        Ok(servers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RING: &str = r#"{
        "name": "cache",
        "nodes": [
            {"hostname": "10.0.0.1:8091", "ports": {"direct": 11211, "proxy": "11212"}},
            {"hostname": "10.0.0.2:8091", "ports": {"direct": 11211}}
        ]
    }"#;

    #[test]
    fn test_ring_servers_use_direct_port() {
        let topology = TopologyParser::new().parse(RING).unwrap();
        assert_eq!(topology.name(), "cache");
        assert_eq!(
            topology.config().servers(),
            &["10.0.0.1:11211".to_string(), "10.0.0.2:11211".to_string()]
        );
        assert_eq!(
            topology.config().rest_endpoints()[0],
            "http://10.0.0.1:8091/pools"
        );
        assert_eq!(topology.nodes()[0].port("proxy"), Some(11212));
        assert!(topology.streaming_uri().is_none());
    }

    #[test]
    fn test_ring_without_direct_port_fails() {
        let raw = r#"{"nodes": [{"hostname": "a:8091", "ports": {"proxy": 1}}]}"#;
        let err = TopologyParser::new().parse(raw).unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_row_outside_server_list_fails() {
        let raw = r#"{
            "nodes": [{"hostname": "a:8091", "ports": {}}],
            "partitionServerMap": {
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": ["a:11210"], "partitionMap": [[0], [3]]
            }
        }"#;
        let err = TopologyParser::new().parse(raw).unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_oversized_server_list_is_rejected_before_narrowing() {
        let servers: Vec<String> = (0..=i16::MAX as usize + 1)
            .map(|i| format!("10.{}.{}.1:11210", i / 256, i % 256))
            .collect();
        let raw = serde_json::json!({
            "nodes": [{"hostname": "10.0.0.1:8091", "ports": {}}],
            "partitionServerMap": {
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": servers, "partitionMap": [[i16::MAX as i64 + 1]]
            }
        })
        .to_string();
        let err = TopologyParser::new().parse(&raw).unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }

    #[test]
    fn test_partitions_carry_their_position() {
        let raw = r#"{
            "nodes": [{"hostname": "a:8091", "ports": {}}],
            "partitionServerMap": {
                "hashAlgorithm": "CRC", "numReplicas": 0,
                "serverList": ["a:11210"], "partitionMap": [[0], [-1], [0], [0]]
            }
        }"#;
        let topology = TopologyParser::new().parse(raw).unwrap();
        let TopologyConfig::Partitioned(config) = topology.config() else {
            panic!("expected a partitioned topology");
        };
        for (position, partition) in config.partitions().iter().enumerate() {
            assert_eq!(partition.index(), position);
        }
        assert_eq!(config.partition(1).unwrap().master(), UNASSIGNED);
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = TopologyParser::new().parse("{not json").unwrap_err();
        assert!(matches!(err, TopologyError::Parse(_)));
    }
}
