//! Topology discovery over the binary data channel.

use crate::core::{Result, TopologyError};
use crate::parser::TopologyParser;
use crate::provider::config::ProviderConfig;
use crate::topology::ClusterTopology;
use crate::topology::node::host_part;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{Level, event};

/// Placeholder the cluster uses for "the address you reached me on".
pub const HOST_WILDCARD: &str = "$HOST";

/// One node's answer to a broadcast topology request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CarrierConfigReply {
    /// `host:port` of the answering node
    pub responder: String,
    /// `None` when the node failed the request
    pub payload: Option<String>,
}

impl CarrierConfigReply {
    pub fn ok(responder: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            responder: responder.into(),
            payload: Some(payload.into()),
        }
    }

    pub fn failed(responder: impl Into<String>) -> Self {
        Self {
            responder: responder.into(),
            payload: None,
        }
    }
}

/// An open binary connection able to serve topology requests.
#[async_trait]
pub trait CarrierConnection: Send + Sync {
    /// `host:port` this connection was opened to
    fn remote(&self) -> &str;

    async fn authenticate(&self, bucket: &str, password: &str) -> Result<()>;

    /// Broadcasts a topology request to every node on the connection.
    async fn fetch_configs(&self) -> Result<Vec<CarrierConfigReply>>;

    /// Cheap round trip used as a liveness probe.
    async fn noop(&self) -> Result<()>;

    /// Resolves once the connection is lost.
    async fn closed(&self);

    async fn close(&self);
}

#[async_trait]
pub trait CarrierConnector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn CarrierConnection>>;
}

/// Connector for deployments without a binary transport; every connect fails
/// so bootstrap falls through to HTTP.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledCarrier;

#[async_trait]
impl CarrierConnector for DisabledCarrier {
    async fn connect(&self, address: &str) -> Result<Arc<dyn CarrierConnection>> {
        Err(TopologyError::Transport(format!(
            "no carrier transport available for {}",
            address
        )))
    }
}

/// Replaces [`HOST_WILDCARD`] with the host the reply came from.
pub fn substitute_wildcards(payload: &str, responder: &str) -> String {
    payload.replace(HOST_WILDCARD, host_part(responder))
}

/// Host of a seed such as `http://10.0.0.1:8091/pools`.
pub fn seed_host(seed: &str) -> Option<&str> {
    let without_scheme = seed
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(seed);
    let authority = without_scheme.split('/').next().unwrap_or_default();
    let host = host_part(authority);
    (!host.is_empty()).then_some(host)
}

/// Fetches, substitutes and parses a topology over `connection`. The first
/// successful reply wins.
pub async fn fetch_carrier_topology(
    connection: &dyn CarrierConnection,
    parser: &TopologyParser,
    previous: Option<&ClusterTopology>,
    operation_timeout: Duration,
) -> Result<ClusterTopology> {
    let replies = timeout(operation_timeout, connection.fetch_configs()).await??;
    let (responder, payload) = replies
        .into_iter()
        .find_map(|reply| reply.payload.map(|payload| (reply.responder, payload)))
        .ok_or_else(|| {
            TopologyError::Transport(format!(
                "no node on {} returned a topology",
                connection.remote()
            ))
        })?;
    let raw = substitute_wildcards(&payload, &responder);
    parser.parse_with_previous(&raw, previous)
}

/// Tries every seed in turn until one yields a connection and a topology.
pub async fn open_carrier(
    connector: &dyn CarrierConnector,
    seeds: &[String],
    config: &ProviderConfig,
    parser: &TopologyParser,
    previous: Option<&ClusterTopology>,
) -> Result<(Arc<dyn CarrierConnection>, ClusterTopology)> {
    let mut last_error =
        TopologyError::Transport("no seed is reachable over the carrier channel".to_string());
    for seed in seeds {
        let Some(host) = seed_host(seed) else {
            continue;
        };
        let address = format!("{}:{}", host, config.carrier_port);
        match open_carrier_node(connector, &address, config, parser, previous).await {
            Ok(opened) => return Ok(opened),
            Err(err) => {
                event!(Level::DEBUG, %address, error = %err, "carrier bootstrap failed, trying next node");
                last_error = err;
            }
        }
    }
    Err(last_error)
}

async fn open_carrier_node(
    connector: &dyn CarrierConnector,
    address: &str,
    config: &ProviderConfig,
    parser: &TopologyParser,
    previous: Option<&ClusterTopology>,
) -> Result<(Arc<dyn CarrierConnection>, ClusterTopology)> {
    let connection = timeout(config.connect_timeout_duration(), connector.connect(address)).await??;
    let attempt = async {
        if config.requires_auth() {
            timeout(
                config.operation_timeout_duration(),
                connection.authenticate(&config.bucket, &config.password),
            )
            .await??;
        }
        fetch_carrier_topology(
            connection.as_ref(),
            parser,
            previous,
            config.operation_timeout_duration(),
        )
        .await
    };
    match attempt.await {
        Ok(topology) => Ok((connection, topology)),
        Err(err) => {
            connection.close().await;
            Err(err)
        }
    }
}

/// An installed carrier channel plus its watcher tasks.
pub struct CarrierChannel {
    connection: Arc<dyn CarrierConnection>,
    lost: AtomicBool,
    closed: AtomicBool,
    missed_probes: AtomicU32,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl CarrierChannel {
    pub fn new(connection: Arc<dyn CarrierConnection>) -> Self {
        Self {
            connection,
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            missed_probes: AtomicU32::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn connection(&self) -> &dyn CarrierConnection {
        self.connection.as_ref()
    }

    pub fn remote(&self) -> &str {
        self.connection.remote()
    }

    pub fn mark_lost(&self) {
        self.lost.store(true, Ordering::Release);
    }

    pub fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// True while the handle can still serve requests.
    pub fn is_usable(&self) -> bool {
        !self.is_lost() && !self.is_closed()
    }

    /// Counts a failed probe and returns the consecutive total.
    pub fn record_missed_probe(&self) -> u32 {
        self.missed_probes.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn reset_missed_probes(&self) {
        self.missed_probes.store(0, Ordering::Release);
    }

    pub fn missed_probes(&self) -> u32 {
        self.missed_probes.load(Ordering::Acquire)
    }

    pub(crate) fn attach_tasks(&self, handles: Vec<JoinHandle<()>>) {
        let mut tasks = match self.tasks.lock() {
            Ok(tasks) => tasks,
            Err(poisoned) => poisoned.into_inner(),
        };
        if self.is_closed() {
            handles.iter().for_each(JoinHandle::abort);
            return;
        }
        tasks.extend(handles);
    }

    /// Stops the watchers and closes the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = {
            let mut tasks = match self.tasks.lock() {
                Ok(tasks) => tasks,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::take(&mut *tasks)
        };
        handles.iter().for_each(JoinHandle::abort);
        self.connection.close().await;
    }
}
