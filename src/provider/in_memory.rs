//! In-process carrier and HTTP endpoints.
//!
//! Both doubles share their state between clones, so a test keeps one handle
//! to script the cluster while the provider holds another.

use crate::core::{Result, TopologyError};
use crate::provider::carrier::{CarrierConfigReply, CarrierConnection, CarrierConnector};
use crate::provider::http::{HttpConfigSource, HttpSourceFactory};
use async_trait::async_trait;
use futures::channel::mpsc::{self, UnboundedSender};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ============================================================================
// Carrier
// ============================================================================

struct CarrierState {
    reachable: HashSet<String>,
    payload: Option<String>,
    replies: Option<Vec<CarrierConfigReply>>,
    password: Option<String>,
    fetch_ok: bool,
    noop_ok: bool,
}

struct CarrierShared {
    state: Mutex<CarrierState>,
    generation: watch::Sender<u64>,
    connects: AtomicUsize,
    auths: AtomicUsize,
    fetches: AtomicUsize,
    noops: AtomicUsize,
}

/// A scripted cluster reachable over the carrier channel.
#[derive(Clone)]
pub struct InMemoryCarrier {
    shared: Arc<CarrierShared>,
}

impl Default for InMemoryCarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCarrier {
    pub fn new() -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            shared: Arc::new(CarrierShared {
                state: Mutex::new(CarrierState {
                    reachable: HashSet::new(),
                    payload: None,
                    replies: None,
                    password: None,
                    fetch_ok: true,
                    noop_ok: true,
                }),
                generation,
                connects: AtomicUsize::new(0),
                auths: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                noops: AtomicUsize::new(0),
            }),
        }
    }

    /// Accepts connections to `address` (`host:port`).
    pub fn allow(&self, address: impl Into<String>) -> &Self {
        lock(&self.shared.state).reachable.insert(address.into());
        self
    }

    pub fn refuse(&self, address: &str) -> &Self {
        lock(&self.shared.state).reachable.remove(address);
        self
    }

    /// Document every node answers with; `$HOST` is left for the client to
    /// substitute.
    pub fn set_payload(&self, payload: impl Into<String>) -> &Self {
        lock(&self.shared.state).payload = Some(payload.into());
        self
    }

    /// Overrides the broadcast answer with explicit per-node replies.
    pub fn set_replies(&self, replies: Vec<CarrierConfigReply>) -> &Self {
        lock(&self.shared.state).replies = Some(replies);
        self
    }

    pub fn require_password(&self, password: impl Into<String>) -> &Self {
        lock(&self.shared.state).password = Some(password.into());
        self
    }

    pub fn set_fetch_ok(&self, ok: bool) -> &Self {
        lock(&self.shared.state).fetch_ok = ok;
        self
    }

    pub fn set_noop_ok(&self, ok: bool) -> &Self {
        lock(&self.shared.state).noop_ok = ok;
        self
    }

    /// Severs every connection opened so far. Later connects are unaffected.
    pub fn drop_connections(&self) {
        self.shared.generation.send_modify(|generation| *generation += 1);
    }

    pub fn connects(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    pub fn auths(&self) -> usize {
        self.shared.auths.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn noops(&self) -> usize {
        self.shared.noops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CarrierConnector for InMemoryCarrier {
    async fn connect(&self, address: &str) -> Result<Arc<dyn CarrierConnection>> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        if !lock(&self.shared.state).reachable.contains(address) {
            return Err(TopologyError::Transport(format!(
                "connection to {} refused",
                address
            )));
        }
        Ok(Arc::new(InMemoryCarrierConnection {
            remote: address.to_string(),
            generation: *self.shared.generation.borrow(),
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One connection into an [`InMemoryCarrier`].
pub struct InMemoryCarrierConnection {
    remote: String,
    generation: u64,
    shared: Arc<CarrierShared>,
    closed: AtomicBool,
}

impl InMemoryCarrierConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TopologyError::Transport(format!(
                "connection to {} is closed",
                self.remote
            )));
        }
        if *self.shared.generation.borrow() != self.generation {
            return Err(TopologyError::Transport(format!(
                "connection to {} was reset",
                self.remote
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl CarrierConnection for InMemoryCarrierConnection {
    fn remote(&self) -> &str {
        &self.remote
    }

    async fn authenticate(&self, _bucket: &str, password: &str) -> Result<()> {
        self.shared.auths.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        match lock(&self.shared.state).password.as_deref() {
            Some(expected) if expected != password => Err(TopologyError::Transport(
                "authentication failed".to_string(),
            )),
            _ => Ok(()),
        }
    }

    async fn fetch_configs(&self) -> Result<Vec<CarrierConfigReply>> {
        self.shared.fetches.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        let state = lock(&self.shared.state);
        if !state.fetch_ok {
            return Err(TopologyError::Transport(format!(
                "topology request to {} failed",
                self.remote
            )));
        }
        if let Some(replies) = &state.replies {
            return Ok(replies.clone());
        }
        Ok(vec![match &state.payload {
            Some(payload) => CarrierConfigReply::ok(self.remote.clone(), payload.clone()),
            None => CarrierConfigReply::failed(self.remote.clone()),
        }])
    }

    async fn noop(&self) -> Result<()> {
        self.shared.noops.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        if lock(&self.shared.state).noop_ok {
            Ok(())
        } else {
            Err(TopologyError::Transport(format!(
                "no-op to {} timed out",
                self.remote
            )))
        }
    }

    async fn closed(&self) {
        let mut generation = self.shared.generation.subscribe();
        let own = self.generation;
        let reset = generation
            .wait_for(|current| *current != own)
            .await
            .map(|_| ())
            .is_ok();
        if !reset {
            futures::future::pending::<()>().await;
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// HTTP
// ============================================================================

struct HttpShared {
    document: Mutex<Option<String>>,
    streams: Mutex<Vec<UnboundedSender<Result<String>>>>,
    fetch_ok: AtomicBool,
    stream_ok: AtomicBool,
    creates: AtomicUsize,
    fetches: AtomicUsize,
    subscriptions: AtomicUsize,
}

/// A scripted REST endpoint. Pushed documents reach every open stream.
#[derive(Clone)]
pub struct InMemoryHttp {
    shared: Arc<HttpShared>,
}

impl Default for InMemoryHttp {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryHttp {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(HttpShared {
                document: Mutex::new(None),
                streams: Mutex::new(Vec::new()),
                fetch_ok: AtomicBool::new(true),
                stream_ok: AtomicBool::new(true),
                creates: AtomicUsize::new(0),
                fetches: AtomicUsize::new(0),
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Sets the document served by `fetch` without notifying streams.
    pub fn set_document(&self, raw: impl Into<String>) -> &Self {
        *lock(&self.shared.document) = Some(raw.into());
        self
    }

    /// Sets the document and sends it down every open stream.
    pub fn push(&self, raw: impl Into<String>) {
        let raw = raw.into();
        *lock(&self.shared.document) = Some(raw.clone());
        lock(&self.shared.streams).retain(|stream| stream.unbounded_send(Ok(raw.clone())).is_ok());
    }

    /// Ends every open stream, as if the server closed the connections.
    pub fn break_streams(&self) {
        lock(&self.shared.streams).clear();
    }

    pub fn set_fetch_ok(&self, ok: bool) -> &Self {
        self.shared.fetch_ok.store(ok, Ordering::SeqCst);
        self
    }

    pub fn set_stream_ok(&self, ok: bool) -> &Self {
        self.shared.stream_ok.store(ok, Ordering::SeqCst);
        self
    }

    pub fn open_streams(&self) -> usize {
        let mut streams = lock(&self.shared.streams);
        streams.retain(|stream| !stream.is_closed());
        streams.len()
    }

    pub fn creates(&self) -> usize {
        self.shared.creates.load(Ordering::SeqCst)
    }

    pub fn fetches(&self) -> usize {
        self.shared.fetches.load(Ordering::SeqCst)
    }

    pub fn subscriptions(&self) -> usize {
        self.shared.subscriptions.load(Ordering::SeqCst)
    }
}

impl HttpSourceFactory for InMemoryHttp {
    fn create(
        &self,
        _seeds: &[String],
        _bucket: &str,
        _password: &str,
    ) -> Result<Arc<dyn HttpConfigSource>> {
        self.shared.creates.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(InMemoryHttpSource {
            shared: Arc::clone(&self.shared),
        }))
    }
}

pub struct InMemoryHttpSource {
    shared: Arc<HttpShared>,
}

#[async_trait]
impl HttpConfigSource for InMemoryHttpSource {
    async fn fetch(&self) -> Result<String> {
        self.shared.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.shared.fetch_ok.load(Ordering::SeqCst) {
            return Err(TopologyError::Transport("bucket fetch failed".to_string()));
        }
        lock(&self.shared.document)
            .clone()
            .ok_or_else(|| TopologyError::Transport("bucket not found".to_string()))
    }

    async fn stream(&self) -> Result<BoxStream<'static, Result<String>>> {
        self.shared.subscriptions.fetch_add(1, Ordering::SeqCst);
        if !self.shared.stream_ok.load(Ordering::SeqCst) {
            return Err(TopologyError::Transport(
                "streaming endpoint unavailable".to_string(),
            ));
        }
        let (sender, receiver) = mpsc::unbounded();
        lock(&self.shared.streams).push(sender);
        Ok(receiver.boxed())
    }
}
