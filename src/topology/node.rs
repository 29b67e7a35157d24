use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Health reported by the cluster for a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    #[default]
    Healthy,
    Warmup,
    Unhealthy,
}

impl NodeStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "warmup" => Self::Warmup,
            "unhealthy" => Self::Unhealthy,
            _ => Self::Healthy,
        }
    }
}

/// A cluster member as described by the topology document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub status: NodeStatus,
    /// `host:port` of the management interface.
    pub hostname: String,
    /// Service name to port, e.g. `direct` or `proxy`.
    pub ports: BTreeMap<String, u16>,
}

impl Node {
    pub fn new(status: NodeStatus, hostname: impl Into<String>, ports: BTreeMap<String, u16>) -> Self {
        Self {
            status,
            hostname: hostname.into(),
            ports,
        }
    }

    pub fn port(&self, service: &str) -> Option<u16> {
        self.ports.get(service).copied()
    }

    /// Host part of `hostname`, without the management port.
    pub fn host(&self) -> &str {
        host_part(&self.hostname)
    }
}

/// Strips a trailing `:port` from an address. Bracketed IPv6 literals keep
/// their brackets.
pub fn host_part(address: &str) -> &str {
    if address.starts_with('[') {
        return match address.find(']') {
            Some(end) => &address[..=end],
            None => address,
        };
    }
    match address.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => {
            host
        }
        _ => address,
    }
}
