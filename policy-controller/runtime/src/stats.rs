use crate::reconcile::stats::{AllowlistStats, Receiver};
use tracing::{debug, info, warn};

/// Writes allowlist statistics as structured log events until shutdown is
/// signaled or every sender is dropped.
///
/// Each record is emitted with the `egress::stats` target so that it may be
/// routed separately from operational logs.
pub(crate) async fn run(mut rx: Receiver, drain: drain::Watch) {
    let shutdown = drain.signaled();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _handle = &mut shutdown => {
                debug!("Shutdown signaled");
                return;
            }

            stats = rx.recv() => match stats {
                Some(stats) => write(&stats),
                None => {
                    debug!("Statistics senders dropped");
                    return;
                }
            },
        }
    }
}

fn write(stats: &AllowlistStats) {
    match serde_json::to_string(stats) {
        Ok(record) => info!(
            target: "egress::stats",
            ns = %stats.namespace,
            pod = %stats.pod_name,
            %record,
            "Egress allowlist granted"
        ),
        Err(error) => warn!(%error, pod = %stats.pod_name, "Failed to encode statistics"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{ResolvedAllow, Workload},
        reconcile::{stats, Phase, PodSnapshot},
    };
    use maplit::btreemap;
    use prometheus_client::metrics::counter::Counter;
    use tokio::time::Duration;

    fn record() -> AllowlistStats {
        let pod = PodSnapshot {
            name: "task-0".to_string(),
            namespace: "ns-0".to_string(),
            labels: btreemap! { "dag_id".to_string() => "nightly".to_string() },
            annotations: btreemap! {},
            phase: Phase::Pending,
            created: None,
            service_account: None,
        };
        let workload = Workload::classify(&pod.labels).unwrap();
        AllowlistStats::new(&pod, &workload, ResolvedAllow::default())
    }

    #[tokio::test]
    async fn stops_when_senders_drop() {
        let dropped = Counter::default();
        let (tx, rx) = stats::channel(4, Duration::from_millis(50), dropped.clone());
        let (_signal, watch) = drain::channel();
        let task = tokio::spawn(run(rx, watch));

        tx.record(record()).await;
        tx.record(record()).await;
        drop(tx);

        task.await.expect("writer must not panic");
        assert_eq!(dropped.get(), 0);
    }

    #[tokio::test]
    async fn stops_on_shutdown() {
        let (tx, rx) = stats::channel(4, Duration::from_millis(50), Counter::default());
        let (signal, watch) = drain::channel();
        let task = tokio::spawn(run(rx, watch));

        signal.drain().await;
        task.await.expect("writer must not panic");

        // Records sent after shutdown are dropped rather than blocking.
        tx.record(record()).await;
    }
}
