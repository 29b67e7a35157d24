use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use clustertopo::provider::{ConfigurationProvider, ProviderConfig, TopologyProvider};
use clustertopo::{ClusterTopology, PartitionLocator, TopologyKind, TopologyParser};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "topology-tool")]
#[command(about = "Developer tooling for cluster topology documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Summarise a topology document
    Inspect {
        #[arg(long)]
        file: PathBuf,
    },
    /// Show where a key is routed
    Locate {
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        key: String,
    },
    /// Compare two topology documents
    Diff {
        #[arg(long)]
        from: PathBuf,
        #[arg(long)]
        to: PathBuf,
    },
    /// Bootstrap against a live cluster over HTTP and print the topology
    Fetch {
        #[arg(long, required = true)]
        seed: Vec<String>,
        #[arg(long, default_value = "default")]
        bucket: String,
        #[arg(long, default_value = "")]
        password: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Inspect { file } => {
            let topology = load(&file)?;
            print_json(&summary(&topology))
        }
        Command::Locate { file, key } => locate(&file, &key),
        Command::Diff { from, to } => diff(&from, &to),
        Command::Fetch {
            seed,
            bucket,
            password,
        } => fetch(seed, &bucket, &password).await,
    }
}

fn load(path: &Path) -> Result<ClusterTopology> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    TopologyParser::new()
        .parse(&raw)
        .with_context(|| format!("failed to parse '{}'", path.display()))
}

fn summary(topology: &ClusterTopology) -> serde_json::Value {
    let config = topology.config();
    let mut value = json!({
        "name": topology.name(),
        "kind": match topology.kind() {
            TopologyKind::Partitioned => "partitioned",
            TopologyKind::Ring => "ring",
        },
        "revision": topology.revision(),
        "tainted": topology.is_tainted(),
        "servers": config.servers(),
        "rest_endpoints": config.rest_endpoints(),
        "nodes": topology
            .nodes()
            .iter()
            .map(|node| json!({ "hostname": node.hostname, "status": format!("{:?}", node.status) }))
            .collect::<Vec<_>>(),
    });
    if let (Ok(partitions), Ok(replicas), Ok(hash)) = (
        config.partition_count(),
        config.replicas_count(),
        config.hash_algorithm(),
    ) {
        value["partitions"] = json!(partitions);
        value["replicas"] = json!(replicas);
        value["hash_algorithm"] = json!(hash.name());
    }
    value
}

fn locate(file: &Path, key: &str) -> Result<()> {
    let topology = Arc::new(load(file)?);
    let replicas = topology.config().replicas_count()?;
    let locator = PartitionLocator::new(topology)?;
    let replica_servers: Vec<Option<String>> = (0..replicas)
        .map(|index| locator.replica(key, index).ok())
        .collect();
    print_json(&json!({
        "key": key,
        "partition": locator.partition_index(key)?,
        "primary": locator.primary(key)?,
        "replicas": replica_servers,
    }))
}

fn diff(from: &Path, to: &Path) -> Result<()> {
    let before = load(from)?;
    let after = load(to)?;
    let difference = before.config().difference(after.config());
    print_json(&json!({
        "revision": { "from": before.revision(), "to": after.revision() },
        "sequence_changed": difference.sequence_changed,
        "partition_changes": difference.partition_changes,
        "unchanged": difference.is_empty(),
    }))
}

async fn fetch(seeds: Vec<String>, bucket: &str, password: &str) -> Result<()> {
    let seeds = seeds
        .into_iter()
        .map(|seed| {
            if seed.contains("://") {
                seed
            } else {
                format!("http://{}/pools", seed)
            }
        })
        .collect();
    let config = ProviderConfig::new(seeds, bucket, password).disable_carrier_bootstrap(true);
    let provider = ConfigurationProvider::with_defaults(config)?;
    let result = provider.bootstrap().await;
    provider.shutdown().await;
    let topology = result.map_err(|err| anyhow!("bootstrap failed: {}", err))?;
    print_json(&summary(&topology))
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
