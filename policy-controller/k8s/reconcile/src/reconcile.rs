//! Applies pod admission events to the cluster's egress policies.
//!
//! A managed pod's allowlist is enforced by two objects named after the pod:
//! a `NetworkPolicy` for IP destinations and an `FQDNNetworkPolicy` for
//! hostnames. The FQDN policy controller materializes the latter as another
//! `NetworkPolicy`, which admission briefly waits for before letting the pod
//! start. Both objects are removed once the pod is deleted or terminates.

use crate::{
    k8s::{FQDNNetworkPolicy, NetworkPolicy, Pod, ResourceExt, Time},
    metrics::Metrics,
    stats::{self, AllowlistStats},
    store::{PolicyStore, StoreError},
    synth,
};
use egress_policy_controller_core::{
    resolve, workload::ALLOWLIST_ANNOTATION, AliasTable, ResolveError, ResolvedAllow, Workload,
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct Reconciler<S> {
    store: S,
    aliases: Arc<AliasTable>,
    params: Params,
    stats: stats::Sender,
    metrics: Metrics,
}

#[derive(Copy, Clone, Debug)]
pub struct Params {
    /// The maximum number of attempts to apply an FQDN policy.
    pub fqdn_attempts: u32,

    /// Attempt `i` is followed by a delay of `i * fqdn_backoff`.
    pub fqdn_backoff: Duration,

    /// How long to wait for an FQDN policy's `NetworkPolicy` to appear.
    pub confirm_timeout: Duration,

    /// Bounds the handling of a single admission event.
    pub deadline: Duration,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    Create,
    Update,
    Delete,
    Other,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Phase {
    Pending,
    Succeeded,
    Failed,
    Other,
}

/// The parts of a pod that admission decisions are based on.
#[derive(Clone, Debug, PartialEq)]
pub struct PodSnapshot {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub phase: Phase,
    pub created: Option<Time>,
    pub service_account: Option<String>,
}

#[derive(Clone, Debug)]
pub struct AdmissionEvent {
    pub operation: Operation,
    pub pod: PodSnapshot,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error("failed to apply NetworkPolicy {name}: {source}")]
    IpPolicy {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("failed to apply FQDNNetworkPolicy {name} after {attempts} attempts: {source}")]
    FqdnPolicy {
        name: String,
        attempts: u32,
        #[source]
        source: StoreError,
    },

    #[error("failed to delete {kind} {name}: {source}")]
    Delete {
        kind: &'static str,
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("egress policies were not reconciled within {0:?}")]
    DeadlineExceeded(Duration),
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum Action {
    Apply,
    Remove,
}

// === impl Reconciler ===

impl<S: PolicyStore> Reconciler<S> {
    pub fn new(
        store: S,
        aliases: Arc<AliasTable>,
        params: Params,
        stats: stats::Sender,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            aliases,
            params,
            stats,
            metrics,
        }
    }

    /// Handles a single admission event.
    ///
    /// Failing to establish a pod's egress policies denies the pod. Failing to
    /// remove them never does: the pod is already going away, so the failure
    /// is returned as a warning instead.
    pub async fn admit(&self, event: AdmissionEvent) -> Decision {
        let AdmissionEvent { operation, pod } = event;
        let decision = self.decide(operation, &pod).await;
        self.metrics.decision(operation.as_str(), decision.allowed);
        decision
    }

    async fn decide(&self, operation: Operation, pod: &PodSnapshot) -> Decision {
        let Some(workload) = Workload::classify(&pod.labels) else {
            debug!("Pod is not managed");
            return Decision::allow();
        };

        let Some(allowlist) = pod.annotations.get(ALLOWLIST_ANNOTATION) else {
            debug!("Pod has no allowlist");
            return Decision::allow();
        };

        let action = match operation {
            Operation::Delete => Action::Remove,
            _ if pod.phase.is_terminal() => Action::Remove,
            Operation::Create => Action::Apply,
            Operation::Update | Operation::Other => {
                debug!(?operation, "Ignoring operation");
                return Decision::allow();
            }
        };

        match action {
            Action::Apply => {
                let apply = self.apply(pod, &workload, allowlist);
                let error = match time::timeout(self.params.deadline, apply).await {
                    Ok(Ok(())) => return Decision::allow(),
                    Ok(Err(error)) => error,
                    Err(_) => ReconcileError::DeadlineExceeded(self.params.deadline),
                };
                warn!(%error, "Denying pod");

                // A denied pod never gets a Delete admission, so anything
                // written before the failure must be removed now. This runs
                // outside the deadline so it cannot be cut short.
                if !matches!(error, ReconcileError::Resolve(_)) {
                    if let Err(error) = self.remove(pod).await {
                        error!(
                            ns = %pod.namespace,
                            name = %pod.name,
                            %error,
                            "Failed to roll back egress policies of denied pod"
                        );
                    }
                }
                Decision::deny(error)
            }

            Action::Remove => {
                let remove = self.remove(pod);
                let result = match time::timeout(self.params.deadline, remove).await {
                    Ok(result) => result,
                    Err(_) => Err(ReconcileError::DeadlineExceeded(self.params.deadline)),
                };
                match result {
                    Ok(()) => Decision::allow(),
                    Err(error) => {
                        warn!(%error, "Failed to remove egress policies");
                        Decision::allow().with_warning(error)
                    }
                }
            }
        }
    }

    async fn apply(
        &self,
        pod: &PodSnapshot,
        workload: &Workload,
        allowlist: &str,
    ) -> Result<(), ReconcileError> {
        let allow = resolve(allowlist, &self.aliases)?;
        if allow.is_empty() {
            info!(%allowlist, "Allowlist has no valid destinations");
            return Ok(());
        }

        let selector = workload.selector();

        // A policy left over from an earlier admission of the same pod name
        // must not keep granting egress the allowlist no longer names.
        let name = synth::ip_policy_name(&pod.name);
        match synth::ip_policy_spec(&selector, &allow.ip) {
            Some(spec) => {
                let policy = synth::network_policy(&pod.namespace, name, spec);
                self.apply_ip_policy(policy).await?;
            }
            None => self.delete_ip_policy(&pod.namespace, name).await?,
        }

        let name = synth::fqdn_policy_name(&pod.name);
        match synth::fqdn_policy_spec(&selector, &allow.fqdn) {
            Some(spec) => {
                let policy = synth::fqdn_network_policy(&pod.namespace, name.clone(), spec);
                self.apply_fqdn_policy(policy).await?;
                self.confirm(&pod.namespace, &name).await;
            }
            None => self.delete_fqdn_policy(&pod.namespace, name).await?,
        }

        self.record(pod, workload, allow).await;
        Ok(())
    }

    /// Creates the IP policy, replacing it if it already exists.
    async fn apply_ip_policy(&self, mut policy: NetworkPolicy) -> Result<(), ReconcileError> {
        let name = policy.name_any();
        let error = |source| ReconcileError::IpPolicy {
            name: name.clone(),
            source,
        };

        match self.store.create_ip_policy(&policy).await {
            Ok(_) => {
                info!(%name, "Created NetworkPolicy");
                return Ok(());
            }
            Err(StoreError::Conflict(_)) => {}
            Err(source) => return Err(error(source)),
        }

        let ns = policy.namespace().unwrap_or_default();
        match self.store.get_ip_policy(&ns, &name).await.map_err(error)? {
            Some(current) => {
                policy.metadata.resource_version = current.metadata.resource_version;
                self.store
                    .replace_ip_policy(&policy)
                    .await
                    .map_err(error)?;
                info!(%name, "Updated NetworkPolicy");
            }
            None => {
                self.store.create_ip_policy(&policy).await.map_err(error)?;
                info!(%name, "Created NetworkPolicy");
            }
        }
        Ok(())
    }

    /// Creates or replaces the FQDN policy, retrying transient failures with a
    /// linear backoff.
    async fn apply_fqdn_policy(&self, policy: FQDNNetworkPolicy) -> Result<(), ReconcileError> {
        let attempts = self.params.fqdn_attempts.max(1);
        let mut attempt = 1;
        loop {
            self.metrics.fqdn_policy_attempts.inc();
            let error = match self.try_apply_fqdn_policy(&policy).await {
                Ok(()) => return Ok(()),
                Err(error) => error,
            };

            if !error.is_transient() || attempt >= attempts {
                return Err(ReconcileError::FqdnPolicy {
                    name: policy.name_any(),
                    attempts: attempt,
                    source: error,
                });
            }

            let backoff = self.params.fqdn_backoff * attempt;
            warn!(name = %policy.name_any(), %error, attempt, ?backoff, "Failed to apply FQDNNetworkPolicy");
            time::sleep(backoff).await;
            attempt += 1;
        }
    }

    async fn try_apply_fqdn_policy(&self, policy: &FQDNNetworkPolicy) -> Result<(), StoreError> {
        let ns = policy.namespace().unwrap_or_default();
        let name = policy.name_any();
        match self.store.get_fqdn_policy(&ns, &name).await? {
            Some(current) => {
                let mut policy = policy.clone();
                policy.metadata.resource_version = current.metadata.resource_version;
                self.store.replace_fqdn_policy(&policy).await?;
                info!(%name, "Updated FQDNNetworkPolicy");
            }
            None => {
                self.store.create_fqdn_policy(policy).await?;
                info!(%name, "Created FQDNNetworkPolicy");
            }
        }
        Ok(())
    }

    /// Waits for the FQDN policy controller to materialize its policy. Slow
    /// propagation is tolerated, so a timeout is only logged.
    async fn confirm(&self, ns: &str, name: &str) {
        let timeout = self.params.confirm_timeout;
        if self.store.watch_ip_policy_exists(ns, name, timeout).await {
            debug!(%name, "NetworkPolicy for FQDNNetworkPolicy exists");
            return;
        }
        self.metrics.confirmation_timeouts.inc();
        warn!(%name, ?timeout, "NetworkPolicy for FQDNNetworkPolicy was not observed; proceeding");
    }

    async fn record(&self, pod: &PodSnapshot, workload: &Workload, allow: ResolvedAllow) {
        self.stats
            .record(AllowlistStats::new(pod, workload, allow))
            .await;
    }

    /// Deletes both policies. Policies that do not exist are ignored, and
    /// deleting the IP policy is attempted even if deleting the FQDN policy
    /// failed.
    async fn remove(&self, pod: &PodSnapshot) -> Result<(), ReconcileError> {
        let ns = &pod.namespace;
        let fqdn = self
            .delete_fqdn_policy(ns, synth::fqdn_policy_name(&pod.name))
            .await;
        let ip = self
            .delete_ip_policy(ns, synth::ip_policy_name(&pod.name))
            .await;
        fqdn.and(ip)
    }

    async fn delete_ip_policy(&self, ns: &str, name: String) -> Result<(), ReconcileError> {
        match self.store.delete_ip_policy(ns, &name).await {
            Ok(()) => {
                info!(%name, "Deleted NetworkPolicy");
                Ok(())
            }
            Err(source) => ignore_missing("NetworkPolicy", name, source),
        }
    }

    async fn delete_fqdn_policy(&self, ns: &str, name: String) -> Result<(), ReconcileError> {
        match self.store.delete_fqdn_policy(ns, &name).await {
            Ok(()) => {
                info!(%name, "Deleted FQDNNetworkPolicy");
                Ok(())
            }
            Err(source) => ignore_missing("FQDNNetworkPolicy", name, source),
        }
    }
}

/// A policy that is already gone, or that is concurrently being changed by
/// another admission for the same pod name, needs no further deletion.
fn ignore_missing(
    kind: &'static str,
    name: String,
    source: StoreError,
) -> Result<(), ReconcileError> {
    match source {
        StoreError::NotFound => {
            debug!(%name, "{kind} does not exist");
            Ok(())
        }
        StoreError::Conflict(error) => {
            info!(%name, %error, "Ignoring conflicting deletion of {kind}");
            Ok(())
        }
        source => Err(ReconcileError::Delete { kind, name, source }),
    }
}

// === impl Operation ===

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Other => "other",
        }
    }
}

// === impl Phase ===

impl Phase {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl From<Option<&str>> for Phase {
    fn from(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => Self::Pending,
            Some("Succeeded") => Self::Succeeded,
            Some("Failed") => Self::Failed,
            _ => Self::Other,
        }
    }
}

// === impl PodSnapshot ===

impl From<Pod> for PodSnapshot {
    fn from(pod: Pod) -> Self {
        let phase = Phase::from(pod.status.as_ref().and_then(|s| s.phase.as_deref()));
        let service_account = pod
            .spec
            .as_ref()
            .and_then(|s| s.service_account_name.clone());
        let Pod { metadata, .. } = pod;
        Self {
            name: metadata.name.unwrap_or_default(),
            namespace: metadata.namespace.unwrap_or_default(),
            labels: metadata.labels.unwrap_or_default(),
            annotations: metadata.annotations.unwrap_or_default(),
            phase,
            created: metadata.creation_timestamp,
            service_account,
        }
    }
}

// === impl Decision ===

impl Decision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            ..Default::default()
        }
    }

    pub fn deny(reason: impl ToString) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            warnings: vec![],
        }
    }

    pub fn with_warning(mut self, warning: impl ToString) -> Self {
        self.warnings.push(warning.to_string());
        self
    }
}
