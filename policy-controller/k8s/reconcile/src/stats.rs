//! Hands allowlist statistics off to a background writer.
//!
//! Recording never fails and never blocks admission for longer than the
//! configured send timeout: when the queue stays full the record is dropped.

use crate::{k8s::Time, reconcile::PodSnapshot};
use egress_policy_controller_core::{ResolvedAllow, Workload};
use prometheus_client::metrics::counter::Counter;
use serde::Serialize;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    time::Duration,
};

const JUPYTERHUB: &str = "jupyterhub";
const AIRFLOW: &str = "airflow";

/// A record of the egress a pod was granted.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AllowlistStats {
    pub pod_name: String,
    pub namespace: String,
    pub service: &'static str,
    pub team: String,
    pub allowlist: ResolvedAllow,
    pub created: Option<Time>,
}

#[derive(Clone, Debug)]
pub struct Sender {
    tx: mpsc::Sender<AllowlistStats>,
    send_timeout: Duration,
    dropped: Counter,
}

pub type Receiver = mpsc::Receiver<AllowlistStats>;

pub fn channel(capacity: usize, send_timeout: Duration, dropped: Counter) -> (Sender, Receiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let tx = Sender {
        tx,
        send_timeout,
        dropped,
    };
    (tx, rx)
}

// === impl AllowlistStats ===

impl AllowlistStats {
    pub fn new(pod: &PodSnapshot, workload: &Workload, allowlist: ResolvedAllow) -> Self {
        let label = |key: &str| pod.labels.get(key).map(String::as_str);

        let service = if label("app") == Some(JUPYTERHUB) {
            JUPYTERHUB
        } else if label("release") == Some(AIRFLOW) || workload.is_batch_task() {
            AIRFLOW
        } else {
            ""
        };

        let team = label("team")
            .map(str::to_string)
            .or_else(|| pod.service_account.clone())
            .unwrap_or_default();

        Self {
            pod_name: pod.name.clone(),
            namespace: pod.namespace.clone(),
            service,
            team,
            allowlist,
            created: pod.created.clone(),
        }
    }
}

// === impl Sender ===

impl Sender {
    pub async fn record(&self, stats: AllowlistStats) {
        let stats = match self.tx.try_send(stats) {
            Ok(()) => return,
            Err(TrySendError::Closed(_)) => {
                tracing::debug!("Statistics writer has stopped");
                self.dropped.inc();
                return;
            }
            Err(TrySendError::Full(stats)) => stats,
        };

        if self.tx.send_timeout(stats, self.send_timeout).await.is_err() {
            tracing::warn!(timeout = ?self.send_timeout, "Statistics queue is full; dropping record");
            self.dropped.inc();
        }
    }
}
