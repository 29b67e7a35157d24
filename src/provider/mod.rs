//! Keeps a bucket's topology current.
//!
//! The provider bootstraps over the carrier channel when it can and falls back
//! to the REST interface otherwise. Once a channel is active, background tasks
//! keep the installed topology fresh:
//!
//! - carrier: a connection-loss watcher, a liveness probe, and a poller that
//!   refetches while the topology is tainted;
//! - HTTP: a task draining the streaming endpoint, and a reconnect loop with
//!   linear backoff when the stream is lost.
//!
//! Every task observes the provider's shutdown signal and holds only a weak
//! reference to it, so dropping the provider stops them too.

pub mod carrier;
pub mod config;
pub mod http;
pub mod in_memory;

pub use carrier::{
    CarrierChannel, CarrierConfigReply, CarrierConnection, CarrierConnector, DisabledCarrier,
    HOST_WILDCARD,
};
pub use config::{
    ANONYMOUS_BUCKET, DEFAULT_CARRIER_PORT, DEFAULT_HTTP_PORT, NodeOrder, ProviderConfig,
};
pub use http::{
    HttpConfigSource, HttpSession, HttpSourceFactory, ReqwestConfigSource, ReqwestSourceFactory,
};
pub use in_memory::{InMemoryCarrier, InMemoryHttp};

use crate::core::{Result, TopologyError};
use crate::parser::TopologyParser;
use crate::retry::{Delay, MAX_ATTEMPTS_LIMIT, RetryBuilder, RetryScheduler, TimeUnit};
use crate::store::{ApplyOutcome, SubscriptionId, TopologyListener, TopologyStore};
use crate::topology::ClusterTopology;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use futures::stream::BoxStream;
use rand::seq::SliceRandom;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{Instrument, Level, event, info_span};

// ============================================================================
// Public surface
// ============================================================================

/// Which channel currently feeds the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Unbootstrapped,
    Carrier,
    Http,
    Shutdown,
}

/// Counters describing what the provider has done so far.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProviderStats {
    pub bootstraps: u64,
    pub applied: u64,
    pub stale: u64,
    pub not_updating: u64,
    pub invalid: u64,
    pub poller_starts: u64,
    pub http_reconnects: u64,
    pub carrier_refreshes: u64,
}

/// Source of the current topology for the rest of the client.
#[async_trait]
pub trait TopologyProvider: Send + Sync {
    /// Discovers the topology from scratch, carrier first, then HTTP.
    async fn bootstrap(&self) -> Result<Arc<ClusterTopology>>;

    /// The installed topology, bootstrapping on first use.
    async fn topology(&self) -> Result<Arc<ClusterTopology>>;

    /// The installed topology, if any. Never blocks.
    fn current(&self) -> Option<Arc<ClusterTopology>>;

    fn set_topology(&self, topology: Arc<ClusterTopology>) -> ApplyOutcome;

    /// Parses and applies a raw document. Parse failures leave the installed
    /// topology in place.
    fn set_raw_topology(&self, raw: &str) -> ApplyOutcome;

    /// Called when the installed topology is suspected to be stale, e.g. after
    /// a misrouted request.
    async fn signal_outdated(&self);

    fn subscribe(&self, listener: Arc<dyn TopologyListener>) -> Result<SubscriptionId>;

    fn unsubscribe(&self, id: SubscriptionId) -> Result<bool>;

    /// Stops every background task and closes the active channel. Idempotent.
    async fn shutdown(&self);
}

/// Default [`TopologyProvider`] over injected carrier and HTTP transports.
#[derive(Clone)]
pub struct ConfigurationProvider {
    inner: Arc<ProviderInner>,
}

impl ConfigurationProvider {
    pub fn new(
        config: ProviderConfig,
        carrier: Arc<dyn CarrierConnector>,
        http: Arc<dyn HttpSourceFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, _) = watch::channel(false);
        let seeds = config.seeds.clone();
        Ok(Self {
            inner: Arc::new(ProviderInner {
                parser: TopologyParser::new(),
                store: TopologyStore::new(),
                seeds: Mutex::new(seeds),
                state: RwLock::new(ChannelState::Unbootstrapped),
                carrier,
                http,
                polling_active: AtomicBool::new(false),
                http_refresh_active: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                shutdown_tx,
                bootstrap_lock: tokio::sync::Mutex::new(()),
                bootstrap_generation: AtomicU64::new(0),
                stats: StatsCounters::default(),
                config,
            }),
        })
    }

    /// HTTP-only provider backed by reqwest.
    pub fn with_defaults(config: ProviderConfig) -> Result<Self> {
        let http = ReqwestSourceFactory::new(
            config.connect_timeout_duration(),
            config.operation_timeout_duration(),
        )?;
        Self::new(config, Arc::new(DisabledCarrier), Arc::new(http))
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    pub fn channel_kind(&self) -> ChannelKind {
        self.inner.channel().kind()
    }

    /// Current seed endpoints, refreshed from every applied topology.
    pub fn seeds(&self) -> Vec<String> {
        self.inner.seeds()
    }

    pub fn stats(&self) -> ProviderStats {
        self.inner.stats.snapshot()
    }

    /// True while the tainted-topology poller runs.
    pub fn is_polling(&self) -> bool {
        self.inner.polling_active.load(Ordering::Acquire)
    }

    /// True while the HTTP reconnect loop runs.
    pub fn is_reconnecting(&self) -> bool {
        self.inner.http_refresh_active.load(Ordering::Acquire)
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_shutdown()
    }

    pub fn subscriber_count(&self) -> Result<usize> {
        self.inner.store.subscriber_count()
    }
}

#[async_trait]
impl TopologyProvider for ConfigurationProvider {
    async fn bootstrap(&self) -> Result<Arc<ClusterTopology>> {
        self.inner.bootstrap().await
    }

    async fn topology(&self) -> Result<Arc<ClusterTopology>> {
        match self.inner.store.current() {
            Some(topology) => Ok(topology),
            None => self.inner.bootstrap().await,
        }
    }

    fn current(&self) -> Option<Arc<ClusterTopology>> {
        self.inner.store.current()
    }

    fn set_topology(&self, topology: Arc<ClusterTopology>) -> ApplyOutcome {
        self.inner.set_topology(topology)
    }

    fn set_raw_topology(&self, raw: &str) -> ApplyOutcome {
        self.inner.set_raw_topology(raw)
    }

    async fn signal_outdated(&self) {
        self.inner.signal_outdated().await
    }

    fn subscribe(&self, listener: Arc<dyn TopologyListener>) -> Result<SubscriptionId> {
        if self.inner.is_shutdown() {
            return Err(TopologyError::Shutdown);
        }
        self.inner.store.subscribe(listener)
    }

    fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        self.inner.store.unsubscribe(id)
    }

    async fn shutdown(&self) {
        self.inner.shutdown().await
    }
}

// ============================================================================
// Channel state
// ============================================================================

#[derive(Clone)]
enum ChannelState {
    Unbootstrapped,
    CarrierActive(Arc<CarrierChannel>),
    HttpActive(Arc<HttpSession>),
    Shutdown,
}

impl ChannelState {
    fn kind(&self) -> ChannelKind {
        match self {
            Self::Unbootstrapped => ChannelKind::Unbootstrapped,
            Self::CarrierActive(_) => ChannelKind::Carrier,
            Self::HttpActive(_) => ChannelKind::Http,
            Self::Shutdown => ChannelKind::Shutdown,
        }
    }

    async fn close(self) {
        match self {
            Self::CarrierActive(channel) => channel.close().await,
            Self::HttpActive(session) => session.close(),
            Self::Unbootstrapped | Self::Shutdown => {}
        }
    }
}

#[derive(Default)]
struct StatsCounters {
    bootstraps: AtomicU64,
    applied: AtomicU64,
    stale: AtomicU64,
    not_updating: AtomicU64,
    invalid: AtomicU64,
    poller_starts: AtomicU64,
    http_reconnects: AtomicU64,
    carrier_refreshes: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            bootstraps: self.bootstraps.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            not_updating: self.not_updating.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            poller_starts: self.poller_starts.load(Ordering::Relaxed),
            http_reconnects: self.http_reconnects.load(Ordering::Relaxed),
            carrier_refreshes: self.carrier_refreshes.load(Ordering::Relaxed),
        }
    }
}

struct ProviderInner {
    config: ProviderConfig,
    parser: TopologyParser,
    store: TopologyStore,
    seeds: Mutex<Vec<String>>,
    // never held across an await
    state: RwLock<ChannelState>,
    carrier: Arc<dyn CarrierConnector>,
    http: Arc<dyn HttpSourceFactory>,
    polling_active: AtomicBool,
    http_refresh_active: AtomicBool,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    bootstrap_lock: tokio::sync::Mutex<()>,
    bootstrap_generation: AtomicU64,
    stats: StatsCounters,
}

fn polling_flag(inner: &ProviderInner) -> &AtomicBool {
    &inner.polling_active
}

fn http_refresh_flag(inner: &ProviderInner) -> &AtomicBool {
    &inner.http_refresh_active
}

impl ProviderInner {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn read_state(&self) -> RwLockReadGuard<'_, ChannelState> {
        match self.state.read() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, ChannelState> {
        match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_seeds(&self) -> MutexGuard<'_, Vec<String>> {
        match self.seeds.lock() {
            Ok(seeds) => seeds,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn channel(&self) -> ChannelState {
        self.read_state().clone()
    }

    fn seeds(&self) -> Vec<String> {
        self.lock_seeds().clone()
    }

    /// Installs `next` and hands back the previous state for closing.
    fn transition(&self, next: ChannelState) -> Result<ChannelState> {
        let mut state = self.write_state();
        if self.is_shutdown() || matches!(*state, ChannelState::Shutdown) {
            return Err(TopologyError::Shutdown);
        }
        Ok(std::mem::replace(&mut *state, next))
    }

    fn require_current(&self) -> Result<Arc<ClusterTopology>> {
        self.store.current().ok_or_else(|| {
            TopologyError::Configuration(format!(
                "no usable topology for bucket '{}'",
                self.config.bucket
            ))
        })
    }

    fn spawn_signal_outdated(self: &Arc<Self>) {
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(signal_outdated_task(Arc::clone(self)));
            }
            Err(_) => event!(Level::DEBUG, "no runtime available to refresh the topology"),
        }
    }

    // ========================================================================
    // Bootstrap
    // ========================================================================

    async fn bootstrap(self: &Arc<Self>) -> Result<Arc<ClusterTopology>> {
        let span = info_span!("bootstrap", bucket = %self.config.bucket);
        self.bootstrap_serialized().instrument(span).await
    }

    async fn bootstrap_serialized(self: &Arc<Self>) -> Result<Arc<ClusterTopology>> {
        if self.is_shutdown() {
            return Err(TopologyError::Shutdown);
        }
        let observed = self.bootstrap_generation.load(Ordering::Acquire);
        let _guard = self.bootstrap_lock.lock().await;
        if self.is_shutdown() {
            return Err(TopologyError::Shutdown);
        }

        // Another caller finished a bootstrap while this one waited.
        if self.bootstrap_generation.load(Ordering::Acquire) != observed {
            let active = matches!(
                self.channel().kind(),
                ChannelKind::Carrier | ChannelKind::Http
            );
            if let (true, Some(current)) = (active, self.store.current()) {
                return Ok(current);
            }
        }

        StatsCounters::bump(&self.stats.bootstraps);
        let previous = self.transition(ChannelState::Unbootstrapped)?;
        previous.close().await;

        let mut failures = Vec::new();
        if !self.config.disable_carrier_bootstrap {
            match self.bootstrap_carrier().await {
                Ok(topology) => return Ok(self.bootstrapped(topology)),
                Err(TopologyError::Shutdown) => return Err(TopologyError::Shutdown),
                Err(err) => {
                    event!(Level::WARN, error = %err, "carrier bootstrap failed");
                    failures.push(format!("carrier: {}", err));
                }
            }
        }
        if !self.config.disable_http_bootstrap {
            match self.bootstrap_http().await {
                Ok(topology) => return Ok(self.bootstrapped(topology)),
                Err(TopologyError::Shutdown) => return Err(TopologyError::Shutdown),
                Err(err) => {
                    event!(Level::WARN, error = %err, "HTTP bootstrap failed");
                    failures.push(format!("http: {}", err));
                }
            }
        }

        Err(TopologyError::Configuration(format!(
            "could not bootstrap bucket '{}': {}",
            self.config.bucket,
            failures.join("; ")
        )))
    }

    fn bootstrapped(&self, topology: Arc<ClusterTopology>) -> Arc<ClusterTopology> {
        self.bootstrap_generation.fetch_add(1, Ordering::AcqRel);
        topology
    }

    async fn bootstrap_carrier(self: &Arc<Self>) -> Result<Arc<ClusterTopology>> {
        let seeds = self.seeds();
        let previous = self.store.current();
        let (connection, topology) = carrier::open_carrier(
            self.carrier.as_ref(),
            &seeds,
            &self.config,
            &self.parser,
            previous.as_deref(),
        )
        .await?;

        let channel = Arc::new(CarrierChannel::new(connection));
        if let Err(err) = self.transition(ChannelState::CarrierActive(Arc::clone(&channel))) {
            channel.close().await;
            return Err(err);
        }
        self.start_carrier_watchers(&channel);
        event!(Level::INFO, remote = channel.remote(), "carrier channel established");

        self.set_topology(Arc::new(topology));
        self.require_current()
    }

    fn start_carrier_watchers(self: &Arc<Self>, channel: &Arc<CarrierChannel>) {
        let loss = tokio::spawn(loss_watch_task(
            Arc::downgrade(self),
            Arc::clone(channel),
            self.shutdown_tx.subscribe(),
        ));
        let liveness = tokio::spawn(liveness_task(
            Arc::downgrade(self),
            Arc::downgrade(channel),
            self.shutdown_tx.subscribe(),
        ));
        channel.attach_tasks(vec![loss, liveness]);
    }

    async fn bootstrap_http(self: &Arc<Self>) -> Result<Arc<ClusterTopology>> {
        let seeds = self.seeds();
        let source = self
            .http
            .create(&seeds, &self.config.bucket, &self.config.password)?;
        let raw = timeout(self.config.operation_timeout_duration(), source.fetch()).await??;
        let previous = self.store.current();
        let topology = self.parser.parse_with_previous(&raw, previous.as_deref())?;

        let session = Arc::new(HttpSession::new(source));
        if let Err(err) = self.transition(ChannelState::HttpActive(Arc::clone(&session))) {
            session.close();
            return Err(err);
        }
        event!(Level::INFO, "HTTP channel established");

        self.set_topology(Arc::new(topology));
        self.monitor_stream(&session).await;
        self.require_current()
    }

    async fn open_stream(
        &self,
        session: &HttpSession,
    ) -> Result<BoxStream<'static, Result<String>>> {
        timeout(
            self.config.operation_timeout_duration(),
            session.source().stream(),
        )
        .await?
    }

    async fn monitor_stream(self: &Arc<Self>, session: &Arc<HttpSession>) {
        match self.open_stream(session).await {
            Ok(stream) => session.attach(tokio::spawn(stream_task(
                Arc::downgrade(self),
                Arc::downgrade(session),
                stream,
            ))),
            Err(err) => {
                event!(Level::WARN, error = %err, "could not subscribe to the topology stream");
                if let Some(current) = self.store.current() {
                    current.mark_not_updating();
                }
                self.schedule_http_reconnect();
            }
        }
    }

    // ========================================================================
    // Applying topologies
    // ========================================================================

    fn set_topology(self: &Arc<Self>, topology: Arc<ClusterTopology>) -> ApplyOutcome {
        if self.is_shutdown() {
            return ApplyOutcome::Shutdown;
        }
        if topology.is_not_updating() {
            StatsCounters::bump(&self.stats.not_updating);
            event!(Level::DEBUG, "received a topology that is no longer updating");
            self.spawn_signal_outdated();
            return ApplyOutcome::NotUpdating;
        }

        let outcome = self
            .store
            .apply(Arc::clone(&topology))
            .unwrap_or_else(|err| ApplyOutcome::Invalid(err.to_string()));
        match &outcome {
            ApplyOutcome::Applied => {
                StatsCounters::bump(&self.stats.applied);
                event!(
                    Level::INFO,
                    bucket = topology.name(),
                    revision = topology.revision(),
                    tainted = topology.is_tainted(),
                    "topology applied"
                );
                if let ChannelState::CarrierActive(channel) = self.channel() {
                    channel.reset_missed_probes();
                }
                self.update_seeds(&topology);
                if let Err(err) = self.store.notify_subscribers() {
                    event!(Level::WARN, error = %err, "failed to notify topology subscribers");
                }
                self.manage_tainted(&topology);
            }
            ApplyOutcome::Stale { revision, current } => {
                StatsCounters::bump(&self.stats.stale);
                event!(Level::DEBUG, revision, current, "ignoring stale topology");
            }
            ApplyOutcome::NotUpdating => StatsCounters::bump(&self.stats.not_updating),
            ApplyOutcome::Invalid(reason) => {
                StatsCounters::bump(&self.stats.invalid);
                event!(Level::WARN, %reason, "topology rejected");
            }
            ApplyOutcome::Shutdown => {}
        }
        outcome
    }

    fn set_raw_topology(self: &Arc<Self>, raw: &str) -> ApplyOutcome {
        if self.is_shutdown() {
            return ApplyOutcome::Shutdown;
        }
        let previous = self.store.current();
        match self.parser.parse_with_previous(raw, previous.as_deref()) {
            Ok(topology) => self.set_topology(Arc::new(topology)),
            Err(err) => {
                StatsCounters::bump(&self.stats.invalid);
                event!(Level::WARN, error = %err, "discarding unparseable topology");
                ApplyOutcome::Invalid(err.to_string())
            }
        }
    }

    /// Replaces the seeds with the topology's REST endpoints when the set
    /// differs.
    fn update_seeds(&self, topology: &ClusterTopology) {
        let endpoints = topology.config().rest_endpoints();
        if endpoints.is_empty() {
            return;
        }
        let mut seeds = self.lock_seeds();
        let unchanged = seeds.len() == endpoints.len() && {
            let known: HashSet<&String> = seeds.iter().collect();
            endpoints.iter().all(|endpoint| known.contains(endpoint))
        };
        if unchanged {
            return;
        }
        let mut next = endpoints.to_vec();
        if self.config.node_order == NodeOrder::Shuffled {
            next.shuffle(&mut rand::thread_rng());
        }
        *seeds = next;
    }

    fn should_poll(&self) -> bool {
        !self.is_shutdown()
            && self.channel().kind() == ChannelKind::Carrier
            && self
                .store
                .current()
                .is_some_and(|current| current.is_tainted())
    }

    /// Starts the tainted poller unless one is already running.
    fn manage_tainted(self: &Arc<Self>, topology: &ClusterTopology) {
        if !topology.is_tainted() || self.channel().kind() != ChannelKind::Carrier {
            return;
        }
        if self
            .polling_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                StatsCounters::bump(&self.stats.poller_starts);
                event!(Level::INFO, bucket = topology.name(), "topology is tainted, starting poller");
                handle.spawn(poller_task(
                    Arc::downgrade(self),
                    self.shutdown_tx.subscribe(),
                ));
            }
            Err(_) => self.polling_active.store(false, Ordering::Release),
        }
    }

    // ========================================================================
    // Refresh
    // ========================================================================

    async fn signal_outdated(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }
        match self.channel() {
            ChannelState::CarrierActive(channel) => {
                let span = info_span!("carrier_refresh", remote = channel.remote());
                self.refresh_carrier(channel).instrument(span).await
            }
            ChannelState::HttpActive(_) => self.schedule_http_reconnect(),
            ChannelState::Unbootstrapped => {
                if let Err(err) = self.bootstrap().await {
                    event!(Level::WARN, error = %err, "bootstrap after outdated signal failed");
                }
            }
            ChannelState::Shutdown => {}
        }
    }

    async fn refresh_carrier(self: &Arc<Self>, channel: Arc<CarrierChannel>) {
        if channel.is_usable() {
            StatsCounters::bump(&self.stats.carrier_refreshes);
            let previous = self.store.current();
            match carrier::fetch_carrier_topology(
                channel.connection(),
                &self.parser,
                previous.as_deref(),
                self.config.operation_timeout_duration(),
            )
            .await
            {
                Ok(topology) => {
                    self.set_topology(Arc::new(topology));
                    return;
                }
                Err(err) => {
                    event!(Level::DEBUG, error = %err, "carrier refresh failed, bootstrapping")
                }
            }
        }
        if let Err(err) = self.bootstrap().await {
            event!(Level::WARN, error = %err, "bootstrap after carrier refresh failed");
        }
    }

    fn schedule_http_reconnect(self: &Arc<Self>) {
        if self.is_shutdown() {
            return;
        }
        if self
            .http_refresh_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(http_reconnect_task(
                    Arc::downgrade(self),
                    self.shutdown_tx.subscribe(),
                ));
            }
            Err(_) => self.http_refresh_active.store(false, Ordering::Release),
        }
    }

    /// One reconnect attempt: fetch, subscribe, then swap the session in.
    async fn reconnect_http_once(self: &Arc<Self>) -> Result<()> {
        if self.is_shutdown() {
            return Err(TopologyError::Shutdown);
        }
        if self.channel().kind() != ChannelKind::Http {
            return Ok(());
        }
        StatsCounters::bump(&self.stats.http_reconnects);

        let seeds = self.seeds();
        let source = self
            .http
            .create(&seeds, &self.config.bucket, &self.config.password)?;
        let raw = timeout(self.config.operation_timeout_duration(), source.fetch()).await??;
        let session = Arc::new(HttpSession::new(source));
        let stream = self.open_stream(&session).await?;

        let Some(previous) = self.swap_http_session(&session) else {
            session.close();
            return Ok(());
        };
        session.attach(tokio::spawn(stream_task(
            Arc::downgrade(self),
            Arc::downgrade(&session),
            stream,
        )));
        previous.close().await;
        self.set_raw_topology(&raw);
        Ok(())
    }

    fn swap_http_session(&self, session: &Arc<HttpSession>) -> Option<ChannelState> {
        let mut state = self.write_state();
        match *state {
            ChannelState::HttpActive(_) if !self.is_shutdown() => Some(std::mem::replace(
                &mut *state,
                ChannelState::HttpActive(Arc::clone(session)),
            )),
            _ => None,
        }
    }

    async fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Err(err) = self.store.clear_subscribers() {
            event!(Level::WARN, error = %err, "failed to clear topology subscribers");
        }
        let previous = std::mem::replace(&mut *self.write_state(), ChannelState::Shutdown);
        previous.close().await;
        event!(Level::INFO, bucket = %self.config.bucket, "configuration provider shut down");
    }
}

// ============================================================================
// Background tasks
// ============================================================================

/// Resolves once shutdown is signalled or the provider is gone.
async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    loop {
        let signalled = *shutdown.borrow_and_update();
        if signalled || shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `duration`. False when shutdown interrupted the sleep.
async fn pause(shutdown: &mut watch::Receiver<bool>, duration: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => true,
        _ = stopped(shutdown) => false,
    }
}

/// Clears one of the provider's loop flags on every exit path.
struct FlagReset {
    inner: Weak<ProviderInner>,
    flag: fn(&ProviderInner) -> &AtomicBool,
    armed: bool,
}

impl FlagReset {
    fn new(inner: Weak<ProviderInner>, flag: fn(&ProviderInner) -> &AtomicBool) -> Self {
        Self {
            inner,
            flag,
            armed: true,
        }
    }

    fn release(&mut self) {
        if !std::mem::replace(&mut self.armed, false) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            (self.flag)(&inner).store(false, Ordering::Release);
        }
    }
}

impl Drop for FlagReset {
    fn drop(&mut self) {
        self.release();
    }
}

/// Timer for the reconnect loop that wakes early on shutdown.
struct ShutdownAwareScheduler {
    shutdown: watch::Receiver<bool>,
}

impl RetryScheduler for ShutdownAwareScheduler {
    fn delay(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let mut shutdown = self.shutdown.clone();
        async move {
            pause(&mut shutdown, duration).await;
        }
        .boxed()
    }
}

fn signal_outdated_task(inner: Arc<ProviderInner>) -> BoxFuture<'static, ()> {
    async move { inner.signal_outdated().await }.boxed()
}

fn poller_task(
    inner: Weak<ProviderInner>,
    mut shutdown: watch::Receiver<bool>,
) -> BoxFuture<'static, ()> {
    async move {
        let mut reset = FlagReset::new(inner.clone(), polling_flag);
        let Some(interval) = inner
            .upgrade()
            .map(|provider| provider.config.tainted_poll_interval_duration())
        else {
            return;
        };

        loop {
            let Some(provider) = inner.upgrade() else {
                return;
            };
            if !provider.should_poll() {
                break;
            }
            provider.signal_outdated().await;
            drop(provider);
            if !pause(&mut shutdown, interval).await {
                return;
            }
        }

        reset.release();
        let Some(provider) = inner.upgrade() else {
            return;
        };
        event!(Level::INFO, "topology no longer tainted, poller stopped");
        // A tainted topology may have landed between the last check and the reset.
        if let Some(current) = provider.store.current() {
            provider.manage_tainted(&current);
        }
    }
    .boxed()
}

fn http_reconnect_task(
    inner: Weak<ProviderInner>,
    shutdown: watch::Receiver<bool>,
) -> BoxFuture<'static, ()> {
    async move {
        let _reset = FlagReset::new(inner.clone(), http_refresh_flag);
        let Some((base, max)) = inner.upgrade().map(|provider| {
            (
                provider.config.http_reconnect_base_ms,
                provider.config.http_reconnect_max_ms,
            )
        }) else {
            return;
        };

        let retry = RetryBuilder::all_but(|err: &TopologyError| {
            matches!(err, TopologyError::Shutdown)
        })
        .max(MAX_ATTEMPTS_LIMIT)
        .delay(Delay::linear_with(
            TimeUnit::Milliseconds,
            max,
            0,
            base as f64,
        ))
        .scheduler(Arc::new(ShutdownAwareScheduler { shutdown }))
        .do_on_retry(|attempt: u32, err: &TopologyError, delay: u64, _unit: TimeUnit| {
            event!(Level::WARN, attempt, delay_ms = delay, error = %err, "HTTP reconnect failed");
        })
        .build();

        let result = retry
            .retry(|| {
                let inner = inner.clone();
                async move {
                    match inner.upgrade() {
                        Some(provider) => provider.reconnect_http_once().await,
                        None => Err(TopologyError::Shutdown),
                    }
                }
            })
            .instrument(info_span!("http_reconnect"))
            .await;
        match result {
            Ok(()) => event!(Level::INFO, "HTTP topology stream re-established"),
            Err(err) => {
                let cause = err.into_cause();
                event!(Level::DEBUG, error = %cause, "HTTP reconnect loop stopped");
            }
        }
    }
    .boxed()
}

fn loss_watch_task(
    inner: Weak<ProviderInner>,
    channel: Arc<CarrierChannel>,
    mut shutdown: watch::Receiver<bool>,
) -> BoxFuture<'static, ()> {
    async move {
        let lost = tokio::select! {
            _ = channel.connection().closed() => true,
            _ = stopped(&mut shutdown) => false,
        };
        if !lost || channel.is_closed() {
            return;
        }
        let Some(provider) = inner.upgrade() else {
            return;
        };
        channel.mark_lost();
        event!(Level::WARN, remote = channel.remote(), "carrier connection lost");
        if let Some(current) = provider.store.current() {
            current.mark_not_updating();
        }
        provider.spawn_signal_outdated();
    }
    .boxed()
}

fn liveness_task(
    inner: Weak<ProviderInner>,
    channel: Weak<CarrierChannel>,
    mut shutdown: watch::Receiver<bool>,
) -> BoxFuture<'static, ()> {
    async move {
        let Some((interval, probe_timeout, threshold)) = inner.upgrade().map(|provider| {
            (
                provider.config.liveness_interval_duration(),
                provider.config.operation_timeout_duration(),
                provider.config.liveness_miss_threshold,
            )
        }) else {
            return;
        };

        loop {
            if !pause(&mut shutdown, interval).await {
                return;
            }
            let Some(channel) = channel.upgrade() else {
                return;
            };
            if !channel.is_usable() {
                return;
            }
            if let Ok(Ok(())) = timeout(probe_timeout, channel.connection().noop()).await {
                channel.reset_missed_probes();
                continue;
            }
            let missed = channel.record_missed_probe();
            event!(Level::DEBUG, remote = channel.remote(), missed, "liveness probe missed");
            if missed < threshold {
                continue;
            }
            channel.reset_missed_probes();
            let Some(provider) = inner.upgrade() else {
                return;
            };
            event!(Level::WARN, remote = channel.remote(), "carrier stopped answering, refreshing topology");
            provider.spawn_signal_outdated();
        }
    }
    .boxed()
}

fn stream_task(
    inner: Weak<ProviderInner>,
    session: Weak<HttpSession>,
    mut stream: BoxStream<'static, Result<String>>,
) -> BoxFuture<'static, ()> {
    async move {
        while let Some(item) = stream.next().await {
            let Some(provider) = inner.upgrade() else {
                return;
            };
            match item {
                Ok(raw) => {
                    provider.set_raw_topology(&raw);
                }
                Err(TopologyError::Parse(reason)) => {
                    StatsCounters::bump(&provider.stats.invalid);
                    event!(Level::WARN, %reason, "discarding undecodable streamed topology");
                }
                Err(err) => {
                    event!(Level::DEBUG, error = %err, "topology stream failed");
                    break;
                }
            }
        }

        let Some(provider) = inner.upgrade() else {
            return;
        };
        let closed = session.upgrade().is_none_or(|session| session.is_closed());
        if closed || provider.is_shutdown() {
            return;
        }
        event!(Level::WARN, "topology stream lost, reconnecting");
        if let Some(current) = provider.store.current() {
            current.mark_not_updating();
        }
        provider.schedule_http_reconnect();
    }
    .boxed()
}
