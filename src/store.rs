use crate::core::Result;
use crate::topology::{ClusterTopology, TopologyKind};
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Handle returned by [`TopologyStore::subscribe`].
pub type SubscriptionId = u64;

/// Receives every topology the store installs.
///
/// Listeners run synchronously on the thread that applied the update and
/// must not block.
pub trait TopologyListener: Send + Sync {
    fn reconfigure(&self, topology: &Arc<ClusterTopology>);
}

/// What happened to a topology handed to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Installed as the current topology.
    Applied,
    /// Dropped because a newer (or equal) revision is already installed.
    Stale { revision: u64, current: u64 },
    /// Dropped because the topology is flagged `not_updating`.
    NotUpdating,
    /// Dropped because it failed to parse or validate.
    Invalid(String),
    /// Dropped because the provider is shut down.
    Shutdown,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied)
    }
}

/// Atomically swapped holder of the current topology plus its listeners.
///
/// Reads never block. Writers serialise on the revision gate so updates
/// arriving from several channels can never be installed out of order.
pub struct TopologyStore {
    current: ArcSwapOption<ClusterTopology>,
    last_revision: Mutex<u64>,
    subscribers: RwLock<Vec<(SubscriptionId, Arc<dyn TopologyListener>)>>,
    next_id: AtomicU64,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self {
            current: ArcSwapOption::empty(),
            last_revision: Mutex::new(0),
            subscribers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn current(&self) -> Option<Arc<ClusterTopology>> {
        self.current.load_full()
    }

    pub fn last_revision(&self) -> Result<u64> {
        Ok(*self.last_revision.lock()?)
    }

    /// Installs `topology` unless it is flagged, stale, or changes the
    /// partition count of the installed topology of the same name.
    ///
    /// Revision `0` is unversioned and always applies. An equal revision is
    /// accepted only to replace a topology flagged `not_updating`.
    pub fn apply(&self, topology: Arc<ClusterTopology>) -> Result<ApplyOutcome> {
        if topology.is_not_updating() {
            return Ok(ApplyOutcome::NotUpdating);
        }

        let mut last = self.last_revision.lock()?;
        let current = self.current.load_full();
        let revision = topology.revision();
        if revision > 0 {
            let resync = current
                .as_ref()
                .map(|installed| installed.is_not_updating())
                .unwrap_or(true);
            if revision < *last || (revision == *last && !resync) {
                return Ok(ApplyOutcome::Stale {
                    revision,
                    current: *last,
                });
            }
        }

        if let Some(installed) = current.as_ref() {
            if let Some(reason) = partition_count_change(installed, &topology) {
                return Ok(ApplyOutcome::Invalid(reason));
            }
        }

        self.current.store(Some(topology));
        if revision > 0 {
            *last = revision;
        }
        Ok(ApplyOutcome::Applied)
    }

    pub fn subscribe(&self, listener: Arc<dyn TopologyListener>) -> Result<SubscriptionId> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write()?.push((id, listener));
        Ok(id)
    }

    /// Returns false when `id` was not subscribed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Result<bool> {
        let mut subscribers = self.subscribers.write()?;
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        Ok(subscribers.len() != before)
    }

    pub fn subscriber_count(&self) -> Result<usize> {
        Ok(self.subscribers.read()?.len())
    }

    pub fn clear_subscribers(&self) -> Result<()> {
        self.subscribers.write()?.clear();
        Ok(())
    }

    /// Hands the current topology to every listener in subscription order.
    ///
    /// Iterates a snapshot so listeners may subscribe or unsubscribe while
    /// being notified.
    pub fn notify_subscribers(&self) -> Result<usize> {
        let Some(topology) = self.current() else {
            return Ok(0);
        };
        let snapshot: Vec<Arc<dyn TopologyListener>> = self
            .subscribers
            .read()?
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in &snapshot {
            listener.reconfigure(&topology);
        }
        Ok(snapshot.len())
    }
}

impl Default for TopologyStore {
    fn default() -> Self {
        Self::new()
    }
}

fn partition_count_change(installed: &ClusterTopology, next: &ClusterTopology) -> Option<String> {
    if installed.name() != next.name()
        || installed.kind() != TopologyKind::Partitioned
        || next.kind() != TopologyKind::Partitioned
    {
        return None;
    }
    let before = installed.config().partition_count().ok()?;
    let after = next.config().partition_count().ok()?;
    (before != after).then(|| {
        format!(
            "partition count of '{}' changed from {} to {}",
            next.name(),
            before,
            after
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::TopologyParser;
    use std::sync::Mutex as StdMutex;

    fn topology(rev: u64, partitions: usize) -> Arc<ClusterTopology> {
        let rows = vec!["[0]"; partitions].join(",");
        let raw = format!(
            r#"{{"name":"b","rev":{},"nodes":[{{"hostname":"a:8091","ports":{{}}}}],
                "partitionServerMap":{{"hashAlgorithm":"CRC","numReplicas":0,
                "serverList":["a:11210"],"partitionMap":[{}]}}}}"#,
            rev, rows
        );
        Arc::new(TopologyParser::new().parse(&raw).unwrap())
    }

    #[derive(Default)]
    struct Recorder {
        seen: StdMutex<Vec<u64>>,
    }

    impl TopologyListener for Recorder {
        fn reconfigure(&self, topology: &Arc<ClusterTopology>) {
            self.seen.lock().unwrap().push(topology.revision());
        }
    }

    #[test]
    fn test_revision_gate_keeps_newest() {
        let store = TopologyStore::new();
        assert_eq!(store.apply(topology(5, 4)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(
            store.apply(topology(3, 4)).unwrap(),
            ApplyOutcome::Stale {
                revision: 3,
                current: 5
            }
        );
        assert!(matches!(
            store.apply(topology(5, 4)).unwrap(),
            ApplyOutcome::Stale { .. }
        ));
        assert_eq!(store.current().unwrap().revision(), 5);
        assert_eq!(store.apply(topology(0, 4)).unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.last_revision().unwrap(), 5);
    }

    #[test]
    fn test_equal_revision_replaces_flagged_topology() {
        let store = TopologyStore::new();
        store.apply(topology(7, 4)).unwrap();
        store.current().unwrap().mark_not_updating();
        assert_eq!(store.apply(topology(7, 4)).unwrap(), ApplyOutcome::Applied);
        assert!(!store.current().unwrap().is_not_updating());
    }

    #[test]
    fn test_flagged_topology_is_never_applied() {
        let store = TopologyStore::new();
        let flagged = topology(1, 4);
        flagged.mark_not_updating();
        assert_eq!(store.apply(flagged).unwrap(), ApplyOutcome::NotUpdating);
        assert!(store.current().is_none());
    }

    #[test]
    fn test_partition_count_cannot_change() {
        let store = TopologyStore::new();
        store.apply(topology(1, 4)).unwrap();
        assert!(matches!(
            store.apply(topology(2, 8)).unwrap(),
            ApplyOutcome::Invalid(_)
        ));
        assert_eq!(store.current().unwrap().revision(), 1);
    }

    #[test]
    fn test_notify_in_subscription_order_and_unsubscribe() {
        let store = TopologyStore::new();
        let first = Arc::new(Recorder::default());
        let second = Arc::new(Recorder::default());
        let first_id = store.subscribe(first.clone()).unwrap();
        store.subscribe(second.clone()).unwrap();

        store.apply(topology(1, 4)).unwrap();
        assert_eq!(store.notify_subscribers().unwrap(), 2);
        assert!(store.unsubscribe(first_id).unwrap());
        assert!(!store.unsubscribe(first_id).unwrap());

        store.apply(topology(2, 4)).unwrap();
        store.notify_subscribers().unwrap();
        assert_eq!(*first.seen.lock().unwrap(), vec![1]);
        assert_eq!(*second.seen.lock().unwrap(), vec![1, 2]);
    }
}
