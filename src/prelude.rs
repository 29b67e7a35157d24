//! Recommended imports grouped by the layer they serve.
//!
//! `routing` is enough for code that only maps keys to servers.
//! `provider` adds the moving parts that keep the topology current.

pub mod routing {
    //! Read-only view of a topology.
    pub use crate::{
        ClusterTopology, HashAlgorithm, PartitionLocator, TopologyConfig, TopologyKind,
        TopologyParser,
    };
}

pub mod provider {
    //! Bootstrap, refresh and subscription.
    pub use crate::provider::{
        CarrierConnection, CarrierConnector, ChannelKind, ConfigurationProvider,
        HttpConfigSource, HttpSourceFactory, NodeOrder, ProviderConfig, TopologyProvider,
    };
    pub use crate::store::{ApplyOutcome, TopologyListener};
}

pub mod retry {
    //! Retrying fallible async operations.
    pub use crate::retry::{Delay, Retry, RetryBuilder, RetryError, RetryFilter, TimeUnit};
}
