use crate::k8s::{
    Api, Client, DeleteParams, FQDNNetworkPolicy, NetworkPolicy, PostParams, ResourceExt,
};
use kube::runtime::wait::await_condition;
use std::time::Duration;
use thiserror::Error;

/// The cluster operations the reconciler depends on.
///
/// Policies are addressed by namespace and name; the objects passed to
/// `create` and `replace` carry both in their metadata. `replace` requires the
/// object's resource version to match the stored object's.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync {
    async fn get_ip_policy(&self, ns: &str, name: &str)
        -> Result<Option<NetworkPolicy>, StoreError>;

    async fn create_ip_policy(&self, policy: &NetworkPolicy) -> Result<NetworkPolicy, StoreError>;

    async fn replace_ip_policy(&self, policy: &NetworkPolicy)
        -> Result<NetworkPolicy, StoreError>;

    async fn delete_ip_policy(&self, ns: &str, name: &str) -> Result<(), StoreError>;

    async fn get_fqdn_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<FQDNNetworkPolicy>, StoreError>;

    async fn create_fqdn_policy(
        &self,
        policy: &FQDNNetworkPolicy,
    ) -> Result<FQDNNetworkPolicy, StoreError>;

    async fn replace_fqdn_policy(
        &self,
        policy: &FQDNNetworkPolicy,
    ) -> Result<FQDNNetworkPolicy, StoreError>;

    async fn delete_fqdn_policy(&self, ns: &str, name: &str) -> Result<(), StoreError>;

    /// Waits up to `timeout` for a `NetworkPolicy` to exist, returning false if
    /// it was not observed in time.
    async fn watch_ip_policy_exists(&self, ns: &str, name: &str, timeout: Duration) -> bool;
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("API server unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Api(String),
}

/// A [`PolicyStore`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

// === impl StoreError ===

impl StoreError {
    /// Indicates whether the failed request may succeed if it is retried
    /// against freshly read state.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Api(_))
    }
}

impl From<kube::Error> for StoreError {
    fn from(error: kube::Error) -> Self {
        match &error {
            kube::Error::Api(rsp) => match rsp.code {
                404 => Self::NotFound,
                409 => Self::Conflict(rsp.message.clone()),
                429 | 500..=599 => Self::Unavailable(error.to_string()),
                _ => Self::Api(error.to_string()),
            },
            kube::Error::HyperError(_) | kube::Error::Service(_) => {
                Self::Unavailable(error.to_string())
            }
            _ => Self::Api(error.to_string()),
        }
    }
}

// === impl KubeStore ===

impl KubeStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, ns: &str) -> Api<K>
    where
        K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), ns)
    }
}

fn namespace<K: ResourceExt>(obj: &K) -> String {
    obj.namespace().unwrap_or_default()
}

#[async_trait::async_trait]
impl PolicyStore for KubeStore {
    async fn get_ip_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<NetworkPolicy>, StoreError> {
        Ok(self.api::<NetworkPolicy>(ns).get_opt(name).await?)
    }

    async fn create_ip_policy(&self, policy: &NetworkPolicy) -> Result<NetworkPolicy, StoreError> {
        let api = self.api::<NetworkPolicy>(&namespace(policy));
        Ok(api.create(&PostParams::default(), policy).await?)
    }

    async fn replace_ip_policy(
        &self,
        policy: &NetworkPolicy,
    ) -> Result<NetworkPolicy, StoreError> {
        let api = self.api::<NetworkPolicy>(&namespace(policy));
        Ok(api
            .replace(&policy.name_any(), &PostParams::default(), policy)
            .await?)
    }

    async fn delete_ip_policy(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        self.api::<NetworkPolicy>(ns)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn get_fqdn_policy(
        &self,
        ns: &str,
        name: &str,
    ) -> Result<Option<FQDNNetworkPolicy>, StoreError> {
        Ok(self.api::<FQDNNetworkPolicy>(ns).get_opt(name).await?)
    }

    async fn create_fqdn_policy(
        &self,
        policy: &FQDNNetworkPolicy,
    ) -> Result<FQDNNetworkPolicy, StoreError> {
        let api = self.api::<FQDNNetworkPolicy>(&namespace(policy));
        Ok(api.create(&PostParams::default(), policy).await?)
    }

    async fn replace_fqdn_policy(
        &self,
        policy: &FQDNNetworkPolicy,
    ) -> Result<FQDNNetworkPolicy, StoreError> {
        let api = self.api::<FQDNNetworkPolicy>(&namespace(policy));
        Ok(api
            .replace(&policy.name_any(), &PostParams::default(), policy)
            .await?)
    }

    async fn delete_fqdn_policy(&self, ns: &str, name: &str) -> Result<(), StoreError> {
        self.api::<FQDNNetworkPolicy>(ns)
            .delete(name, &DeleteParams::default())
            .await?;
        Ok(())
    }

    async fn watch_ip_policy_exists(&self, ns: &str, name: &str, timeout: Duration) -> bool {
        let exists = await_condition(
            self.api::<NetworkPolicy>(ns),
            name,
            |policy: Option<&NetworkPolicy>| policy.is_some(),
        );
        match tokio::time::timeout(timeout, exists).await {
            Ok(Ok(_)) => true,
            Ok(Err(error)) => {
                tracing::warn!(%ns, %name, %error, "Failed to watch NetworkPolicy");
                false
            }
            Err(_) => false,
        }
    }
}
