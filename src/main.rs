use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tidemark::processor::{Processing, ProcessorError, ResolvedEntry, processor_fn, reducer_fn};
use tidemark::{ClusterConfig, InvokeResult, LocalCluster, TidemarkConfig, TidemarkNode};

#[derive(Parser, Debug)]
#[command(name = "tidemark", about = "Runs a demo MVCC workload on an in-process cluster")]
struct Args {
    /// Optional JSON config file; command line sizes are ignored when given.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of simulated nodes.
    #[arg(long, default_value_t = 3)]
    nodes: u32,

    /// Number of partitions.
    #[arg(long, default_value_t = 16)]
    partitions: u32,

    /// Number of keys to seed.
    #[arg(long, default_value_t = 100)]
    keys: usize,

    /// Kill this node between the bulk update and the commit.
    #[arg(long)]
    kill_node: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => TidemarkConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => TidemarkConfig::new(
            0,
            ClusterConfig {
                nodes: args.nodes,
                partition_count: args.partitions,
                ..ClusterConfig::default()
            },
        ),
    };
    config.validate()?;
    info!("starting Tidemark demo with config {:?}", config);

    let cluster = Arc::new(LocalCluster::new(&config.cluster));
    let node = TidemarkNode::new(config, cluster.clone());
    let accounts = node.cache("accounts");
    let manager = node.transaction_manager();

    let seed = manager.begin_default().await?;
    for i in 0..args.keys {
        accounts.put(&seed, &format!("account-{i}"), 100u64.to_be_bytes().to_vec()).await?;
    }
    manager.commit(&seed).await?;
    info!(keys = args.keys, "seeded accounts");

    let update = manager.begin_default().await?;
    let add_interest = processor_fn(|entry: &mut ResolvedEntry| {
        let balance = decode(entry.value())?;
        entry.set_value((balance + balance / 10).to_be_bytes().to_vec());
        Ok(Some(1u64.to_be_bytes().to_vec()))
    });
    let count = reducer_fn(|partials| {
        let mut total = 0u64;
        for partial in &partials {
            total += decode(Some(partial))?;
        }
        Ok(Some(total.to_be_bytes().to_vec()))
    });
    let keys: Vec<String> = (0..args.keys).map(|i| format!("account-{i}")).collect();
    let updated = accounts
        .invoke_all(
            &update,
            keys,
            Processing::Reducing {
                processor: add_interest,
                reducer: count,
            },
        )
        .await?;
    if let InvokeResult::Reduced(Some(total)) = &updated {
        info!(updated = decode(Some(total))?, "interest applied");
    }

    if let Some(victim) = args.kill_node {
        let moved = cluster.kill_node(victim).await?;
        info!(node = victim, moved = moved.len(), "killed node before commit");
    }
    manager.commit(&update).await?;

    let check = manager.begin_default().await?;
    let balance = accounts.get(&check, &"account-0".to_string()).await?;
    info!(balance = decode(balance.as_ref())?, "account-0 after commit");
    manager.commit(&check).await?;
    Ok(())
}

fn decode(value: Option<&Vec<u8>>) -> Result<u64, ProcessorError> {
    let bytes = value.ok_or_else(|| ProcessorError::new("missing balance"))?;
    let raw: [u8; 8] = bytes
        .as_slice()
        .try_into()
        .map_err(|_| ProcessorError::new("balance is not a u64"))?;
    Ok(u64::from_be_bytes(raw))
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
