//! Consistent routing of keys onto a changing set of backend endpoints.
//!
//! [`EndpointMap`] assigns every key (typically `"<repo>@<commit>"`) to one of a set of endpoints
//! using rendezvous hashing, so that adding or removing an endpoint only moves the keys owned by
//! that endpoint. The set is either fixed at construction or kept current by a discovery task.

mod discovery;
mod map;
mod ring;
mod spec;

pub use discovery::{RegistryEvent, ServiceAddress, ServiceRegistry};
pub use map::EndpointMap;
pub use ring::{Endpoint, HashRing};
pub use spec::{EndpointSpec, KubernetesTarget, ServiceKind};

use trawl_core::Error;

#[derive(Debug, thiserror::Error)]
pub enum EndpointError {
    #[error("invalid endpoint spec {spec:?}: {reason}")]
    InvalidSpec { spec: String, reason: String },
    #[error("endpoint spec {0:?} needs a service registry")]
    MissingRegistry(String),
}

impl From<EndpointError> for Error {
    fn from(err: EndpointError) -> Self {
        Error::config(err.to_string())
    }
}
