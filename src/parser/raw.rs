// ============================================================================
// src/parser/raw.rs - wire shape of a topology document
// ============================================================================

use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawDocument {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub streaming_uri: Option<String>,
    #[serde(default)]
    pub nodes: Vec<RawNode>,
    #[serde(default)]
    pub partition_server_map: Option<RawServerMap>,
    #[serde(default)]
    pub rev: Option<u64>,
    #[serde(default)]
    pub tainted: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawServerMap {
    pub hash_algorithm: String,
    pub num_replicas: usize,
    pub server_list: Vec<String>,
    pub partition_map: Vec<Vec<i64>>,
    /// Present while a rebalance is in flight.
    #[serde(default)]
    pub partition_map_forward: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawNode {
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    /// Port values arrive as numbers or numeric strings.
    #[serde(default)]
    pub ports: BTreeMap<String, Value>,
    #[serde(default)]
    pub couch_api_base: Option<String>,
}
