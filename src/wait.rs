//! Suspending a caller until an uncommitted version resolves.

use tracing::debug;

use crate::error::{MvccError, Result};
use crate::processor::transform;
use crate::substrate::{ChangeFilter, ListenerEvent, ProcStatus, Substrate};
use crate::types::{Key, TransactionId, VersionedKey};

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The awaited version was committed or rolled back.
    Resolved,
    /// The waiting transaction itself was force-expired.
    CallerExpired,
}

/// Wait until `awaited` in `cache` is committed or removed, or until the
/// status record of `caller` moves to rolling back.
///
/// Both listeners are registered before the first check, so a commit that
/// lands between the caller's blocked transform and this call is still
/// observed. Listeners deregister when the function returns.
pub async fn wait_for_commit<S: Substrate>(
    substrate: &S,
    cache: &str,
    awaited: &VersionedKey<Key>,
    caller: TransactionId,
) -> Result<WaitOutcome> {
    let mut version_listener = substrate.subscribe(ChangeFilter::Version {
        cache: cache.to_string(),
        version: awaited.clone(),
    });
    let mut status_listener = substrate.subscribe(ChangeFilter::Status(caller));
    debug!(%awaited, %caller, cache, "waiting for commit");

    loop {
        if let Some(outcome) = check(substrate, cache, awaited, caller).await? {
            debug!(%awaited, %caller, ?outcome, "wait finished");
            return Ok(outcome);
        }

        let event = tokio::select! {
            event = version_listener.recv() => event,
            event = status_listener.recv() => event,
        };
        match event {
            ListenerEvent::Changed(_) | ListenerEvent::Lagged => continue,
            ListenerEvent::Closed => {
                return Err(MvccError::Unavailable(
                    "change feed closed while waiting for commit".to_string(),
                ));
            }
        }
    }
}

async fn check<S: Substrate>(
    substrate: &S,
    cache: &str,
    awaited: &VersionedKey<Key>,
    caller: TransactionId,
) -> Result<Option<WaitOutcome>> {
    let partition = substrate.partition_for_key(&awaited.key);
    let resolved = substrate
        .transform(partition, |data| transform::is_resolved(data, cache, awaited))
        .await?;
    if resolved {
        return Ok(Some(WaitOutcome::Resolved));
    }

    let partition = substrate.partition_for_txn(&caller);
    let status = substrate
        .transform(partition, move |data| {
            data.status(&caller).map(|record| record.proc_status)
        })
        .await?;
    Ok((status == Some(ProcStatus::RollingBack)).then_some(WaitOutcome::CallerExpired))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::mvcc::VersionRecord;
    use crate::mvcc::Payload;
    use crate::substrate::{LocalCluster, TxnStatusRecord};

    fn ts(millis: u64) -> TransactionId {
        TransactionId::new(millis, 0, 0)
    }

    async fn seed_uncommitted(cluster: &LocalCluster, version: &VersionedKey<Key>) {
        let partition = cluster.partition_for_key(&version.key);
        let version = version.clone();
        cluster
            .transform(partition, move |data| {
                data.cache_mut("c").insert_version(
                    version,
                    VersionRecord::uncommitted(Payload::Value(b"v".to_vec())),
                );
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn already_committed_returns_immediately() {
        let cluster = LocalCluster::with_nodes(2, 4);
        let awaited = VersionedKey::new("k".to_string(), ts(1));
        let outcome = wait_for_commit(&cluster, "c", &awaited, ts(2)).await.unwrap();
        assert_eq!(outcome, WaitOutcome::Resolved);
        assert_eq!(cluster.active_listeners(), 0);
    }

    #[tokio::test]
    async fn resolves_when_version_commits() {
        let cluster = Arc::new(LocalCluster::with_nodes(2, 4));
        let awaited = VersionedKey::new("k".to_string(), ts(1));
        seed_uncommitted(&cluster, &awaited).await;

        let waiter = {
            let cluster = cluster.clone();
            let awaited = awaited.clone();
            tokio::spawn(async move { wait_for_commit(&*cluster, "c", &awaited, ts(2)).await })
        };
        while cluster.active_listeners() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let partition = cluster.partition_for_key(&awaited.key);
        let version = awaited.clone();
        cluster
            .transform(partition, move |data| transform::commit_mark(data, "c", &version))
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::Resolved);
        assert_eq!(cluster.active_listeners(), 0);
    }

    #[tokio::test]
    async fn caller_expiry_releases_the_wait() {
        let cluster = Arc::new(LocalCluster::with_nodes(1, 4));
        let awaited = VersionedKey::new("k".to_string(), ts(1));
        seed_uncommitted(&cluster, &awaited).await;
        let caller = ts(5);
        let status_partition = cluster.partition_for_txn(&caller);
        cluster
            .transform(status_partition, move |data| {
                data.insert_status(caller, TxnStatusRecord::open(5))
            })
            .await
            .unwrap();

        let waiter = {
            let cluster = cluster.clone();
            let awaited = awaited.clone();
            tokio::spawn(async move { wait_for_commit(&*cluster, "c", &awaited, caller).await })
        };
        while cluster.active_listeners() < 2 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cluster
            .transform(status_partition, move |data| {
                data.set_status(caller, ProcStatus::RollingBack)
            })
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), WaitOutcome::CallerExpired);
        assert_eq!(cluster.active_listeners(), 0);
    }
}
