//! Classification of admitted pods into the workloads egress policies are
//! managed for.

use std::collections::BTreeMap;

/// The annotation holding a pod's egress allowlist.
pub const ALLOWLIST_ANNOTATION: &str = "allowlist";

pub const COMPONENT_LABEL: &str = "component";
pub const NOTEBOOK_COMPONENT: &str = "singleuser-server";
pub const NOTEBOOK_USER_LABEL: &str = "hub.jupyter.org/username";

pub const DAG_ID_LABEL: &str = "dag_id";
pub const RUN_ID_LABEL: &str = "run_id";
pub const TASK_ID_LABEL: &str = "task_id";

/// A pod that egress policies are managed for.
///
/// Each variant carries the labels identifying the logical unit the pod
/// belongs to. Policies select every pod in that unit, so retries of a batch
/// task (or a restarted notebook server) inherit the same egress rules.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Workload {
    /// A user's interactive notebook server.
    Notebook { component: String, user: String },

    /// A single task of a batch pipeline run.
    BatchTask {
        dag_id: String,
        run_id: String,
        task_id: String,
    },
}

// === impl Workload ===

impl Workload {
    /// Classifies a pod by its labels, returning `None` for pods that are not
    /// managed.
    ///
    /// Notebook servers are recognized by their component label; batch tasks
    /// by the presence of a DAG id. Labels that make up the selector but are
    /// missing from the pod are treated as empty.
    pub fn classify(labels: &BTreeMap<String, String>) -> Option<Self> {
        let label = |key: &str| labels.get(key).cloned().unwrap_or_default();

        if labels.get(COMPONENT_LABEL).map(String::as_str) == Some(NOTEBOOK_COMPONENT) {
            return Some(Self::Notebook {
                component: NOTEBOOK_COMPONENT.to_string(),
                user: label(NOTEBOOK_USER_LABEL),
            });
        }

        if labels.contains_key(DAG_ID_LABEL) {
            return Some(Self::BatchTask {
                dag_id: label(DAG_ID_LABEL),
                run_id: label(RUN_ID_LABEL),
                task_id: label(TASK_ID_LABEL),
            });
        }

        None
    }

    /// The label match that scopes a policy to this workload's pods.
    pub fn selector(&self) -> BTreeMap<String, String> {
        match self {
            Self::Notebook { component, user } => [
                (COMPONENT_LABEL, component),
                (NOTEBOOK_USER_LABEL, user),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),

            Self::BatchTask {
                dag_id,
                run_id,
                task_id,
            } => [
                (DAG_ID_LABEL, dag_id),
                (RUN_ID_LABEL, run_id),
                (TASK_ID_LABEL, task_id),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
        }
    }

    pub fn is_batch_task(&self) -> bool {
        matches!(self, Self::BatchTask { .. })
    }
}
