use async_trait::async_trait;
use tokio::sync::mpsc;
use trawl_core::Error;

use crate::spec::KubernetesTarget;

/// One address behind a cluster service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceAddress {
    /// Stable pod hostname; only set for stateful workloads.
    pub hostname: Option<String>,
    pub ip: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryEvent {
    /// The full current address list of the service.
    Updated(Vec<ServiceAddress>),
    /// The registry could not produce a list; endpoint reads fail until the next update.
    Failed(String),
}

/// The cluster service registry.
///
/// Implementations watch one service and push a [`RegistryEvent`] whenever its address list
/// changes. Dropping the receiver ends the watch.
#[async_trait]
pub trait ServiceRegistry: Send + Sync + 'static {
    async fn watch(
        &self,
        target: &KubernetesTarget,
    ) -> Result<mpsc::Receiver<RegistryEvent>, Error>;
}
