//! Bounded parallel execution of partitions.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use case_ingest_core::models::PartitionWorkItem;
use case_ingest_core::partition::Partitions;

/// Runs `worker` once per partition with at most `concurrency` in flight.
///
/// Results are keyed by partition key. A failing or panicking partition
/// yields an `Err` for its key and does not stop the others.
pub async fn run_partitions<T, F, Fut>(
    partitions: Partitions,
    concurrency: usize,
    worker: F,
) -> BTreeMap<String, Result<T>>
where
    T: Send + 'static,
    F: Fn(String, PartitionWorkItem) -> Fut,
    Fut: Future<Output = Result<T>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut join_set = JoinSet::new();
    let mut results = BTreeMap::new();
    let mut pending_keys = Vec::with_capacity(partitions.len());

    for (key, item) in partitions {
        let permit_source = semaphore.clone();
        let fut = worker(key.clone(), item);
        pending_keys.push(key.clone());
        join_set.spawn(async move {
            let _permit = match permit_source.acquire_owned().await {
                Ok(p) => p,
                Err(e) => return (key, Err(anyhow!("partition semaphore closed: {}", e))),
            };
            (key, fut.await)
        });
    }

    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((key, result)) => {
                if let Err(ref e) = result {
                    tracing::warn!(partition = %key, error = %format!("{:#}", e), "partition failed");
                }
                results.insert(key, result);
            }
            Err(e) => tracing::error!(error = %e, "partition task panicked"),
        }
    }

    for key in pending_keys {
        results
            .entry(key)
            .or_insert_with(|| Err(anyhow!("partition task did not complete")));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn partitions(n: usize) -> Partitions {
        (0..n)
            .map(|i| (format!("case-{}", i), PartitionWorkItem::for_case(&i.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn failures_do_not_stop_other_partitions() {
        let results = run_partitions(partitions(4), 2, |_key, item| async move {
            if item.case_id == "2" {
                anyhow::bail!("materials service down");
            }
            Ok(item.case_id)
        })
        .await;
        assert_eq!(results.len(), 4);
        assert!(results["case-2"].is_err());
        assert_eq!(results["case-3"].as_ref().unwrap(), "3");
    }

    #[tokio::test]
    async fn concurrency_is_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let results = run_partitions(partitions(8), 3, |_key, _item| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
        assert_eq!(results.len(), 8);
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn panicking_partition_is_reported() {
        let results = run_partitions(partitions(2), 2, |key, _item| async move {
            if key == "case-0" {
                panic!("boom");
            }
            Ok(())
        })
        .await;
        assert!(results["case-0"].is_err());
        assert!(results["case-1"].is_ok());
    }
}
