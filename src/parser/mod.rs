mod raw;
pub mod topology_parser;

pub use topology_parser::{DEFAULT_BUCKET_NAME, DIRECT_PORT, TopologyParser};
