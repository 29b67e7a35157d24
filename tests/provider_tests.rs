/// Configuration provider tests over the in-memory transports
///
/// Run with: cargo test --test provider_tests
use clustertopo::provider::{
    ChannelKind, ConfigurationProvider, InMemoryCarrier, InMemoryHttp, NodeOrder,
    ProviderConfig, TopologyProvider,
};
use clustertopo::{
    ApplyOutcome, ClusterTopology, PartitionLocator, TopologyError, TopologyListener,
    TopologyParser,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SEED: &str = "http://127.0.0.1:8091/pools";
const CARRIER_ADDRESS: &str = "127.0.0.1:11210";

fn document(rev: u64, tainted: bool) -> String {
    document_with_rows(rev, tainted, "[0],[0],[0],[0]")
}

fn document_with_rows(rev: u64, tainted: bool, rows: &str) -> String {
    format!(
        r#"{{
            "name": "default",
            "rev": {rev},
            "tainted": {tainted},
            "nodes": [
                {{"hostname": "127.0.0.1:8091", "ports": {{"direct": 11210}}}},
                {{"hostname": "127.0.0.2:8091", "ports": {{"direct": 11210}}}}
            ],
            "partitionServerMap": {{
                "hashAlgorithm": "CRC",
                "numReplicas": 0,
                "serverList": ["127.0.0.1:11210", "127.0.0.2:11210"],
                "partitionMap": [{rows}]
            }}
        }}"#
    )
}

/// The carrier sends `$HOST` for the node that answered.
fn carrier_document(rev: u64, tainted: bool) -> String {
    document(rev, tainted).replacen("127.0.0.1", "$HOST", 2)
}

fn config() -> ProviderConfig {
    ProviderConfig::new(vec![SEED.to_string()], "default", "")
        .node_order(NodeOrder::Ordered)
        .tainted_poll_interval(Duration::from_millis(100))
        .http_reconnect_backoff(Duration::from_millis(100), Duration::from_secs(1))
}

fn provider(config: ProviderConfig) -> (ConfigurationProvider, InMemoryCarrier, InMemoryHttp) {
    let carrier = InMemoryCarrier::new();
    let http = InMemoryHttp::new();
    let provider =
        ConfigurationProvider::new(config, Arc::new(carrier.clone()), Arc::new(http.clone()))
            .unwrap();
    (provider, carrier, http)
}

fn revision(provider: &ConfigurationProvider) -> u64 {
    provider.current().map(|topology| topology.revision()).unwrap_or(0)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[derive(Default)]
struct Recorder {
    revisions: Mutex<Vec<u64>>,
}

impl Recorder {
    fn revisions(&self) -> Vec<u64> {
        self.revisions.lock().unwrap().clone()
    }
}

impl TopologyListener for Recorder {
    fn reconfigure(&self, topology: &Arc<ClusterTopology>) {
        self.revisions.lock().unwrap().push(topology.revision());
    }
}

#[tokio::test(start_paused = true)]
async fn test_carrier_bootstrap_substitutes_host() {
    let (provider, carrier, http) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, false));

    let topology = provider.bootstrap().await.unwrap();

    assert_eq!(provider.channel_kind(), ChannelKind::Carrier);
    assert_eq!(topology.revision(), 1);
    assert_eq!(topology.config().server(0).unwrap(), "127.0.0.1:11210");
    assert_eq!(
        provider.seeds(),
        vec![SEED.to_string(), "http://127.0.0.2:8091/pools".to_string()]
    );
    assert_eq!(carrier.auths(), 0);
    assert_eq!(http.creates(), 0);
    assert_eq!(provider.stats().bootstraps, 1);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_named_bucket_authenticates() {
    let config = config().bucket("orders").password("secret");
    let (provider, carrier, _) = provider(config);
    carrier
        .allow(CARRIER_ADDRESS)
        .require_password("secret")
        .set_payload(carrier_document(1, false));

    provider.bootstrap().await.unwrap();
    assert_eq!(carrier.auths(), 1);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_falls_back_to_http_and_follows_stream() {
    let (provider, carrier, http) = provider(config());
    http.set_document(document(2, false));

    provider.bootstrap().await.unwrap();

    assert_eq!(provider.channel_kind(), ChannelKind::Http);
    assert_eq!(carrier.connects(), 1);
    assert_eq!(revision(&provider), 2);
    eventually("stream subscription", || http.open_streams() == 1).await;

    http.push(document(3, false));
    eventually("pushed revision", || revision(&provider) == 3).await;

    // Stale pushes are dropped.
    http.push(document(1, false));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(revision(&provider), 3);
    assert!(provider.stats().stale >= 1);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_both_channels_failing_is_a_configuration_error() {
    let (provider, _, _) = provider(config());

    let err = provider.bootstrap().await.unwrap_err();
    assert!(matches!(err, TopologyError::Configuration(_)));
    assert_eq!(provider.channel_kind(), ChannelKind::Unbootstrapped);
    assert!(matches!(
        provider.topology().await,
        Err(TopologyError::Configuration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_topology_bootstraps_on_first_use_only() {
    let (provider, carrier, _) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(4, false));

    let first = provider.topology().await.unwrap();
    let second = provider.topology().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(carrier.connects(), 1);

    provider.shutdown().await;
}

#[tokio::test]
async fn test_revisions_never_go_backwards() {
    let (provider, _, _) = provider(config());

    assert_eq!(provider.set_raw_topology(&document(5, false)), ApplyOutcome::Applied);
    assert_eq!(
        provider.set_raw_topology(&document(3, false)),
        ApplyOutcome::Stale {
            revision: 3,
            current: 5
        }
    );
    assert_eq!(revision(&provider), 5);
    assert!(provider.set_raw_topology(&document(7, false)).is_applied());
    assert_eq!(revision(&provider), 7);

    let changed_count = document_with_rows(8, false, "[0],[1]");
    assert!(matches!(
        provider.set_raw_topology(&changed_count),
        ApplyOutcome::Invalid(_)
    ));
    assert_eq!(revision(&provider), 7);
}

#[tokio::test]
async fn test_flagged_topology_is_not_applied() {
    let (provider, _, _) = provider(config());
    let topology = TopologyParser::new().parse(&document(9, false)).unwrap();
    topology.mark_not_updating();

    assert_eq!(
        provider.set_topology(Arc::new(topology)),
        ApplyOutcome::NotUpdating
    );
    assert!(provider.current().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_tainted_poller_starts_once_and_stops_when_clean() {
    let (provider, carrier, _) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, true));

    provider.bootstrap().await.unwrap();
    assert!(provider.is_polling());

    assert!(provider.set_raw_topology(&document(2, true)).is_applied());
    assert!(provider.set_raw_topology(&document(3, true)).is_applied());
    assert_eq!(provider.stats().poller_starts, 1);

    carrier.set_payload(carrier_document(10, false));
    eventually("poller to stop", || !provider.is_polling()).await;

    assert_eq!(provider.stats().poller_starts, 1);
    assert_eq!(revision(&provider), 10);
    assert!(!provider.current().unwrap().is_tainted());
    assert!(carrier.fetches() >= 2);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_connection_loss_resynchronises() {
    let (provider, carrier, _) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(6, false));
    provider.bootstrap().await.unwrap();

    carrier.drop_connections();
    eventually("reconnect after loss", || {
        carrier.connects() == 2
            && provider
                .current()
                .is_some_and(|current| !current.is_not_updating())
    })
    .await;

    // Same revision, accepted because the old topology stopped updating.
    assert_eq!(revision(&provider), 6);
    assert_eq!(provider.channel_kind(), ChannelKind::Carrier);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_missed_probes_refresh_over_same_connection() {
    let config = config().liveness(Duration::from_millis(100), 3);
    let (provider, carrier, _) = provider(config);
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, false));
    provider.bootstrap().await.unwrap();

    carrier.set_noop_ok(false).set_payload(carrier_document(2, false));
    eventually("refresh after missed probes", || revision(&provider) == 2).await;

    assert!(carrier.noops() >= 3);
    assert_eq!(carrier.connects(), 1);
    assert!(provider.stats().carrier_refreshes >= 1);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_stream_reconnects_with_backoff() {
    let config = config().disable_carrier_bootstrap(true);
    let (provider, carrier, http) = provider(config);
    http.set_document(document(2, false));
    provider.bootstrap().await.unwrap();
    eventually("stream subscription", || http.open_streams() == 1).await;

    http.set_stream_ok(false);
    http.break_streams();
    eventually("failed reconnects", || http.subscriptions() >= 3).await;
    assert!(provider.is_reconnecting());
    assert!(provider.current().unwrap().is_not_updating());

    http.set_stream_ok(true);
    eventually("reconnect", || {
        !provider.is_reconnecting() && http.open_streams() == 1
    })
    .await;
    assert!(!provider.current().unwrap().is_not_updating());
    assert!(provider.stats().http_reconnects >= 3);
    assert_eq!(carrier.connects(), 0);

    http.push(document(4, false));
    eventually("pushed revision", || revision(&provider) == 4).await;

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outdated_carrier_refreshes_over_same_connection() {
    let (provider, carrier, _) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, false));
    provider.bootstrap().await.unwrap();

    carrier.set_payload(carrier_document(2, false));
    provider.signal_outdated().await;

    assert_eq!(revision(&provider), 2);
    assert_eq!(provider.channel_kind(), ChannelKind::Carrier);
    assert_eq!(carrier.connects(), 1);
    assert_eq!(carrier.fetches(), 2);
    assert_eq!(provider.stats().carrier_refreshes, 1);
    assert_eq!(provider.stats().bootstraps, 1);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outdated_carrier_bootstraps_when_refresh_fails() {
    let (provider, carrier, http) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, false));
    provider.bootstrap().await.unwrap();

    carrier.set_fetch_ok(false);
    http.set_document(document(3, false));
    provider.signal_outdated().await;

    // Refresh fetch, then a fresh connect per seed before falling back to HTTP.
    assert_eq!(carrier.fetches(), 3);
    assert_eq!(carrier.connects(), 3);
    assert_eq!(provider.stats().carrier_refreshes, 1);
    assert_eq!(provider.stats().bootstraps, 2);
    assert_eq!(provider.channel_kind(), ChannelKind::Http);
    assert_eq!(revision(&provider), 3);

    provider.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_outdated_http_runs_single_reconnect() {
    let config = config().disable_carrier_bootstrap(true);
    let (provider, _, http) = provider(config);
    http.set_document(document(2, false));
    provider.bootstrap().await.unwrap();
    eventually("stream subscription", || http.open_streams() == 1).await;
    let creates = http.creates();

    http.set_stream_ok(false);
    for _ in 0..5 {
        provider.signal_outdated().await;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(provider.is_reconnecting());
    assert_eq!(http.creates() - creates, 1);

    for _ in 0..5 {
        provider.signal_outdated().await;
    }
    http.set_stream_ok(true);
    eventually("reconnect", || !provider.is_reconnecting()).await;

    // One failed attempt, one successful; the repeated signals joined them.
    assert_eq!(http.creates() - creates, 2);
    assert_eq!(provider.stats().http_reconnects, 2);
    eventually("replacement stream", || http.open_streams() == 1).await;
    assert_eq!(revision(&provider), 2);

    provider.shutdown().await;
}

#[tokio::test]
async fn test_subscribers_notified_until_removed() {
    let (provider, _, _) = provider(config());
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let first_id = provider.subscribe(first.clone()).unwrap();
    provider.subscribe(second.clone()).unwrap();

    provider.set_raw_topology(&document(1, false));
    assert!(provider.unsubscribe(first_id).unwrap());
    assert!(!provider.unsubscribe(first_id).unwrap());
    provider.set_raw_topology(&document(2, false));
    provider.set_raw_topology(&document(2, false));

    assert_eq!(first.revisions(), vec![1]);
    assert_eq!(second.revisions(), vec![1, 2]);

    provider.shutdown().await;
    assert_eq!(provider.subscriber_count().unwrap(), 0);
    assert!(matches!(
        provider.subscribe(first),
        Err(TopologyError::Shutdown)
    ));
}

#[tokio::test]
async fn test_locator_follows_provider_updates() {
    let (provider, _, _) = provider(config());
    provider.set_raw_topology(&document(1, false));
    let locator = Arc::new(PartitionLocator::new(provider.current().unwrap()).unwrap());
    provider.subscribe(locator.clone()).unwrap();

    provider.set_raw_topology(&document_with_rows(2, false, "[1],[1],[1],[1]"));

    assert_eq!(locator.topology().revision(), 2);
    assert_eq!(
        locator.primary("any-key").unwrap().as_deref(),
        Some("127.0.0.2:11210")
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_is_terminal() {
    let (provider, carrier, _) = provider(config());
    carrier.allow(CARRIER_ADDRESS).set_payload(carrier_document(1, true));
    provider.bootstrap().await.unwrap();
    assert!(provider.is_polling());

    provider.shutdown().await;
    provider.shutdown().await;
    assert_eq!(provider.channel_kind(), ChannelKind::Shutdown);
    eventually("poller to observe shutdown", || !provider.is_polling()).await;

    provider.signal_outdated().await;
    carrier.drop_connections();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(carrier.connects(), 1);
    assert!(matches!(
        provider.bootstrap().await,
        Err(TopologyError::Shutdown)
    ));
}
