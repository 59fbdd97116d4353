use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tidemark::{
    ClusterConfig, IsolationLevel, LocalCluster, MvccCache, MvccError, TidemarkConfig,
    TidemarkNode, TransactionConfig, TransactionManager,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{info, warn};

const CACHE_NAME: &str = "bench";
const VALUE_SIZE_BYTES: usize = 128;

#[derive(Clone, Debug)]
pub struct WorkloadConfig {
    pub transactions: usize,
    pub ops_per_txn: usize,
    /// Share of operations that are reads, in percent.
    pub read_percent: u32,
    pub keys: usize,
    pub threads: usize,
    pub nodes: u32,
    pub partitions: u32,
    pub isolation: IsolationLevel,
    /// Open transactions older than this are expired by a background sweeper.
    pub max_age: Duration,
    pub kill: Option<KillPlan>,
}

#[derive(Clone, Debug)]
pub struct KillPlan {
    /// Transaction index at which the node is killed.
    pub at_txn: usize,
    pub node: u32,
}

#[derive(Clone, Debug)]
pub struct RunMeasurement {
    pub duration: Duration,
    pub ops: usize,
    pub commits: usize,
    pub conflicts: usize,
    pub expired: usize,
    pub failures: usize,
}

#[derive(Default)]
struct Counters {
    claimed: AtomicUsize,
    ops: AtomicUsize,
    commits: AtomicUsize,
    conflicts: AtomicUsize,
    expired: AtomicUsize,
    failures: AtomicUsize,
    killed: AtomicBool,
}

enum TxnOutcome {
    Committed,
    Conflict,
    Expired,
}

pub async fn run_workload(plan: &WorkloadConfig, run_idx: usize) -> Result<RunMeasurement> {
    if plan.transactions == 0 || plan.ops_per_txn == 0 {
        return Err(anyhow!("transactions and ops per transaction must be non-zero"));
    }
    if plan.keys == 0 {
        return Err(anyhow!("key space must be non-empty"));
    }

    let config = TidemarkConfig::new(
        0,
        ClusterConfig {
            nodes: plan.nodes,
            partition_count: plan.partitions,
            ..ClusterConfig::default()
        },
    )
    .with_transactions(TransactionConfig {
        max_age_ms: plan.max_age.as_millis() as u64,
        default_isolation: plan.isolation,
        ..TransactionConfig::default()
    });
    config.validate()?;

    let cluster = Arc::new(LocalCluster::new(&config.cluster));
    let node = TidemarkNode::new(config, cluster.clone());
    let cache = node.cache(CACHE_NAME);
    let manager = node.transaction_manager().clone();

    seed(&manager, &cache, plan.keys).await?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let max_age = manager.config().max_age();
    let sweeper = tokio::spawn(expire_loop(manager.clone(), max_age, stop_rx));

    let counters = Arc::new(Counters::default());
    let start = Instant::now();
    let mut handles = Vec::with_capacity(plan.threads.max(1));
    for worker in 0..plan.threads.max(1) {
        let plan = plan.clone();
        let manager = manager.clone();
        let cache = cache.clone();
        let cluster = cluster.clone();
        let counters = counters.clone();
        let seed = (run_idx as u64) << 32 | worker as u64;
        handles.push(tokio::spawn(async move {
            let mut rng = StdRng::seed_from_u64(seed);
            loop {
                let idx = counters.claimed.fetch_add(1, Ordering::SeqCst);
                if idx >= plan.transactions {
                    break;
                }
                if let Some(kill) = &plan.kill
                    && idx >= kill.at_txn
                    && !counters.killed.swap(true, Ordering::SeqCst)
                {
                    match cluster.kill_node(kill.node).await {
                        Ok(moved) => info!(node = kill.node, moved = moved.len(), "killed node"),
                        Err(err) => warn!(node = kill.node, error = %err, "kill failed"),
                    }
                }

                match run_transaction(&plan, &manager, &cache, &mut rng, &counters).await {
                    Ok(TxnOutcome::Committed) => counters.commits.fetch_add(1, Ordering::SeqCst),
                    Ok(TxnOutcome::Conflict) => counters.conflicts.fetch_add(1, Ordering::SeqCst),
                    Ok(TxnOutcome::Expired) => counters.expired.fetch_add(1, Ordering::SeqCst),
                    Err(err) => {
                        warn!(error = %err, "transaction failed");
                        counters.failures.fetch_add(1, Ordering::SeqCst)
                    }
                };
            }
        }));
    }

    for handle in handles {
        handle.await?;
    }
    let duration = start.elapsed();
    let _ = stop_tx.send(true);
    sweeper.await?;

    Ok(RunMeasurement {
        duration,
        ops: counters.ops.load(Ordering::SeqCst),
        commits: counters.commits.load(Ordering::SeqCst),
        conflicts: counters.conflicts.load(Ordering::SeqCst),
        expired: counters.expired.load(Ordering::SeqCst),
        failures: counters.failures.load(Ordering::SeqCst),
    })
}

async fn seed(
    manager: &TransactionManager<LocalCluster>,
    cache: &MvccCache<LocalCluster>,
    keys: usize,
) -> Result<()> {
    let txn = manager.begin(IsolationLevel::ReadProhibited, false).await?;
    for idx in 0..keys {
        cache.put(&txn, &key_name(idx), vec![0u8; VALUE_SIZE_BYTES]).await?;
    }
    manager.commit(&txn).await?;
    Ok(())
}

async fn run_transaction(
    plan: &WorkloadConfig,
    manager: &TransactionManager<LocalCluster>,
    cache: &MvccCache<LocalCluster>,
    rng: &mut StdRng,
    counters: &Counters,
) -> Result<TxnOutcome, MvccError> {
    let txn = manager.begin_default().await?;
    for _ in 0..plan.ops_per_txn {
        let key = key_name(rng.gen_range(0..plan.keys));
        let outcome = if rng.gen_range(0..100) < plan.read_percent {
            cache.get(&txn, &key).await.map(|_| ())
        } else {
            let mut value = vec![0u8; VALUE_SIZE_BYTES];
            rng.fill(&mut value[..]);
            cache.put(&txn, &key, value).await.map(|_| ())
        };
        counters.ops.fetch_add(1, Ordering::SeqCst);

        match outcome {
            Ok(()) => {}
            Err(MvccError::FutureRead { .. }) => {
                manager.rollback(&txn).await?;
                return Ok(TxnOutcome::Conflict);
            }
            Err(MvccError::TransactionExpired(_)) => {
                manager.rollback(&txn).await?;
                return Ok(TxnOutcome::Expired);
            }
            Err(err) => {
                manager.rollback(&txn).await?;
                return Err(err);
            }
        }
    }

    match manager.commit(&txn).await {
        Ok(()) => Ok(TxnOutcome::Committed),
        // Expired between its last operation and the commit.
        Err(MvccError::Transaction(_)) => {
            manager.rollback(&txn).await?;
            Ok(TxnOutcome::Expired)
        }
        Err(err) => Err(err),
    }
}

/// Expiry policy: waits between transactions are only bounded by expiry, so
/// deadlocked transactions are released here.
async fn expire_loop(
    manager: Arc<TransactionManager<LocalCluster>>,
    max_age: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let period = (max_age / 2).max(Duration::from_millis(1));
    loop {
        tokio::select! {
            _ = sleep(period) => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
            }
        }
        match manager.expire_stale(max_age).await {
            Ok(expired) if !expired.is_empty() => {
                info!(expired = expired.len(), "expired stale transactions")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "expiry sweep failed"),
        }
    }
}

fn key_name(idx: usize) -> String {
    format!("key-{idx:06}")
}
