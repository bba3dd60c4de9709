use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use trawl_core::Error;

use crate::discovery::{RegistryEvent, ServiceRegistry};
use crate::ring::{Endpoint, HashRing};
use crate::spec::{EndpointSpec, KubernetesTarget};
use crate::EndpointError;

/// Routes keys to endpoints.
///
/// A static map never changes. A dynamic map is fed by a discovery task: the first read waits until
/// discovery has reported once, every successful report replaces the ring wholesale, and a failed
/// report makes reads fail until the next successful one. Reads never block writers for longer than
/// it takes to clone an `Arc`.
///
/// Dynamic constructors spawn their discovery task and must be called inside a tokio runtime. The
/// task is aborted when the last clone of the map is dropped.
#[derive(Clone, Debug)]
pub struct EndpointMap {
    inner: Arc<Inner>,
    ready_timeout: Option<Duration>,
}

#[derive(Debug)]
enum Inner {
    Static(Arc<HashRing>),
    Dynamic(Dynamic),
}

#[derive(Debug)]
struct Dynamic {
    shared: Arc<Shared>,
    task: AbortHandle,
}

impl Drop for Dynamic {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug)]
struct Shared {
    state: RwLock<State>,
    ready: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct State {
    ring: Arc<HashRing>,
    error: Option<Error>,
}

/// Write side of a dynamic map, owned by the discovery task.
struct Updater {
    shared: Arc<Shared>,
}

impl Updater {
    fn apply(&self, update: Result<Vec<Endpoint>, Error>) {
        match update {
            Ok(endpoints) => {
                let ring = Arc::new(HashRing::new(endpoints));
                tracing::info!(
                    target: "trawl.endpoint",
                    endpoints = ring.len(),
                    "endpoint set updated"
                );
                let mut state = self.shared.state.write();
                state.ring = ring;
                state.error = None;
            }
            Err(err) => {
                tracing::warn!(target: "trawl.endpoint", error = %err, "endpoint discovery failed");
                self.shared.state.write().error = Some(err);
            }
        }
        self.shared.ready.send_replace(true);
    }

    fn closed(&self) {
        if !*self.shared.ready.borrow() {
            self.apply(Err(Error::discovery(
                "endpoint discovery ended before producing endpoints",
            )));
        } else {
            tracing::debug!(target: "trawl.endpoint", "endpoint discovery stream ended");
        }
    }
}

impl EndpointMap {
    /// A map over a fixed endpoint list.
    pub fn static_list<I, E>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<Endpoint>,
    {
        Self {
            inner: Arc::new(Inner::Static(Arc::new(HashRing::new(endpoints)))),
            ready_timeout: None,
        }
    }

    /// Builds a map from an endpoint configuration string.
    ///
    /// A `k8s+` spec needs `registry` to discover the service's pods; any other spec is parsed as a
    /// static list.
    pub fn from_spec(
        spec: &str,
        registry: Option<Arc<dyn ServiceRegistry>>,
    ) -> Result<Self, EndpointError> {
        match EndpointSpec::parse(spec)? {
            EndpointSpec::Static(endpoints) => Ok(Self::static_list(endpoints)),
            EndpointSpec::Kubernetes(target) => {
                let registry =
                    registry.ok_or_else(|| EndpointError::MissingRegistry(spec.to_owned()))?;
                Ok(Self::from_registry(target, registry))
            }
        }
    }

    pub fn from_registry(target: KubernetesTarget, registry: Arc<dyn ServiceRegistry>) -> Self {
        Self::spawn_dynamic(|updater| async move {
            match registry.watch(&target).await {
                Ok(mut events) => {
                    while let Some(event) = events.recv().await {
                        let update = match event {
                            RegistryEvent::Updated(addrs) => Ok(addrs
                                .iter()
                                .filter_map(|addr| target.endpoint_for(addr))
                                .collect()),
                            RegistryEvent::Failed(message) => Err(Error::discovery(message)),
                        };
                        updater.apply(update);
                    }
                }
                Err(err) => updater.apply(Err(err)),
            }
            updater.closed();
        })
    }

    /// A map that follows a configuration value holding the endpoint list.
    pub fn from_watch(mut endpoints: watch::Receiver<Vec<String>>) -> Self {
        Self::spawn_dynamic(|updater| async move {
            loop {
                let current: Vec<Endpoint> = endpoints
                    .borrow_and_update()
                    .iter()
                    .map(|addr| Endpoint::new(addr.as_str()))
                    .collect();
                updater.apply(Ok(current));
                if endpoints.changed().await.is_err() {
                    break;
                }
            }
            updater.closed();
        })
    }

    /// A map fed by arbitrary discovery updates.
    pub fn from_discovery(mut updates: mpsc::Receiver<Result<Vec<Endpoint>, Error>>) -> Self {
        Self::spawn_dynamic(|updater| async move {
            while let Some(update) = updates.recv().await {
                updater.apply(update);
            }
            updater.closed();
        })
    }

    fn spawn_dynamic<F, Fut>(discover: F) -> Self
    where
        F: FnOnce(Updater) -> Fut,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            state: RwLock::new(State::default()),
            ready,
        });
        let updater = Updater {
            shared: Arc::clone(&shared),
        };
        let task = tokio::spawn(discover(updater)).abort_handle();
        Self {
            inner: Arc::new(Inner::Dynamic(Dynamic { shared, task })),
            ready_timeout: None,
        }
    }

    /// Bounds how long the first read waits for discovery; `Discovery` errors are returned after.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = Some(timeout);
        self
    }

    pub fn is_static(&self) -> bool {
        matches!(*self.inner, Inner::Static(_))
    }

    /// The current ring, waiting for the first discovery report if needed.
    pub async fn snapshot(&self) -> Result<Arc<HashRing>, Error> {
        let dynamic = match &*self.inner {
            Inner::Static(ring) => return Ok(Arc::clone(ring)),
            Inner::Dynamic(dynamic) => dynamic,
        };

        let mut ready = dynamic.shared.ready.subscribe();
        if !*ready.borrow_and_update() {
            let wait = ready.wait_for(|ready| *ready);
            let waited = match self.ready_timeout {
                Some(timeout) => tokio::time::timeout(timeout, wait).await.map_err(|_| {
                    Error::discovery(format!("endpoints not discovered after {timeout:?}"))
                })?,
                None => wait.await,
            };
            waited.map_err(|_| Error::discovery("endpoint discovery stopped"))?;
        }

        let state = dynamic.shared.state.read();
        match &state.error {
            Some(err) => Err(err.clone()),
            None => Ok(Arc::clone(&state.ring)),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Endpoint, Error> {
        self.snapshot().await?.get(key)
    }

    pub async fn get_n(&self, key: &str, n: usize) -> Result<Vec<Endpoint>, Error> {
        self.snapshot().await?.get_n(key, n)
    }

    /// Resolves a batch of keys against one consistent snapshot of the endpoint set.
    pub async fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> Result<Vec<Endpoint>, Error> {
        let ring = self.snapshot().await?;
        keys.iter().map(|key| ring.get(key.as_ref())).collect()
    }

    pub async fn endpoints(&self) -> Result<Vec<Endpoint>, Error> {
        Ok(self.snapshot().await?.endpoints())
    }
}
