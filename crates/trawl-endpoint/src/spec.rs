use url::Url;

use crate::discovery::ServiceAddress;
use crate::ring::Endpoint;
use crate::EndpointError;

const K8S_PREFIX: &str = "k8s+";

/// How the pods backing a cluster service are addressed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServiceKind {
    /// Pods are addressed by IP.
    #[default]
    Endpoints,
    /// Pods have stable hostnames under the service (`<pod>.<service>`).
    StatefulSet,
}

/// A service in the cluster registry whose pods are the endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubernetesTarget {
    pub scheme: String,
    pub service: String,
    pub namespace: Option<String>,
    pub port: Option<u16>,
    /// Path appended to every endpoint URL; empty or starting with `/`.
    pub path: String,
    pub kind: ServiceKind,
}

impl KubernetesTarget {
    /// The endpoint URL for one address of the service, or `None` if the address lacks the field
    /// this service kind is addressed by.
    pub fn endpoint_for(&self, addr: &ServiceAddress) -> Option<Endpoint> {
        let host = match self.kind {
            ServiceKind::StatefulSet => {
                let hostname = addr.hostname.as_deref().filter(|h| !h.is_empty())?;
                format!("{hostname}.{}", self.service)
            }
            ServiceKind::Endpoints => {
                if addr.ip.is_empty() {
                    return None;
                }
                addr.ip.clone()
            }
        };
        let port = self.port.map(|port| format!(":{port}")).unwrap_or_default();
        Some(Endpoint::new(format!(
            "{}://{host}{port}{}",
            self.scheme, self.path
        )))
    }
}

/// Parsed form of an endpoint configuration string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointSpec {
    /// A space-separated list of addresses.
    Static(Vec<Endpoint>),
    /// `k8s+<scheme>://<service>[.<namespace>][:<port>][/<path>][?kind=sts|endpoints]`
    Kubernetes(KubernetesTarget),
}

impl EndpointSpec {
    pub fn parse(spec: &str) -> Result<Self, EndpointError> {
        let spec = spec.trim();
        let Some(rest) = spec.strip_prefix(K8S_PREFIX) else {
            return Ok(EndpointSpec::Static(
                spec.split_whitespace().map(Endpoint::from).collect(),
            ));
        };

        let invalid = |reason: String| EndpointError::InvalidSpec {
            spec: spec.to_owned(),
            reason,
        };
        let url = Url::parse(rest).map_err(|err| invalid(err.to_string()))?;
        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| invalid("missing service name".to_owned()))?;
        let (service, namespace) = match host.split_once('.') {
            Some((service, namespace)) => (service.to_owned(), Some(namespace.to_owned())),
            None => (host.to_owned(), None),
        };

        let mut kind = ServiceKind::default();
        for (key, value) in url.query_pairs() {
            match (key.as_ref(), value.as_ref()) {
                ("kind", "sts" | "statefulset") => kind = ServiceKind::StatefulSet,
                ("kind", "endpoints" | "") => kind = ServiceKind::Endpoints,
                ("kind", other) => return Err(invalid(format!("unknown service kind {other:?}"))),
                _ => {}
            }
        }

        let path = match url.path() {
            "/" | "" => String::new(),
            path => path.to_owned(),
        };

        Ok(EndpointSpec::Kubernetes(KubernetesTarget {
            scheme: url.scheme().to_owned(),
            service,
            namespace,
            port: url.port(),
            path,
            kind,
        }))
    }
}
