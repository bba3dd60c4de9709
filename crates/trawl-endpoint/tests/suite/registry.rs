use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use trawl_core::{Error, ErrorKind};
use trawl_endpoint::{
    Endpoint, EndpointMap, KubernetesTarget, RegistryEvent, ServiceAddress, ServiceRegistry,
};

/// Hands out one pre-filled event channel per watch call.
struct FakeRegistry {
    events: Mutex<Option<mpsc::Receiver<RegistryEvent>>>,
    watched: Mutex<Vec<KubernetesTarget>>,
}

#[async_trait]
impl ServiceRegistry for FakeRegistry {
    async fn watch(&self, target: &KubernetesTarget) -> Result<mpsc::Receiver<RegistryEvent>, Error> {
        self.watched.lock().push(target.clone());
        self.events
            .lock()
            .take()
            .ok_or_else(|| Error::discovery("already watching"))
    }
}

fn pod(name: &str, ip: &str) -> ServiceAddress {
    ServiceAddress {
        hostname: Some(name.to_owned()),
        ip: ip.to_owned(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn statefulset_spec_discovers_pod_hostnames() -> Result<()> {
    let (tx, rx) = mpsc::channel(4);
    let registry = Arc::new(FakeRegistry {
        events: Mutex::new(Some(rx)),
        watched: Mutex::new(Vec::new()),
    });
    let dyn_registry: Arc<dyn ServiceRegistry> = registry.clone();
    let map = EndpointMap::from_spec("k8s+http://searcher:3181?kind=sts", Some(dyn_registry))?;

    let reader = {
        let map = map.clone();
        tokio::spawn(async move { map.endpoints().await })
    };
    tx.send(RegistryEvent::Updated(vec![
        pod("searcher-1", "10.0.0.2"),
        pod("searcher-0", "10.0.0.1"),
    ]))
    .await?;

    let endpoints = reader.await??;
    assert_eq!(
        endpoints,
        vec![
            Endpoint::new("http://searcher-0.searcher:3181"),
            Endpoint::new("http://searcher-1.searcher:3181"),
        ]
    );
    assert_eq!(registry.watched.lock()[0].service, "searcher");

    tx.send(RegistryEvent::Failed("watch expired".to_owned())).await?;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(map.get("r@c").await.unwrap_err().kind(), ErrorKind::Discovery);
    Ok(())
}

#[tokio::test]
async fn k8s_spec_without_registry_is_rejected() {
    assert!(EndpointMap::from_spec("k8s+http://searcher:3181", None).is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watch_source_rebuilds_ring_on_change() -> Result<()> {
    let (tx, rx) = watch::channel(vec!["http://a:1".to_owned()]);
    let map = EndpointMap::from_watch(rx);
    assert_eq!(map.endpoints().await?, vec![Endpoint::new("http://a:1")]);

    tx.send(vec!["http://a:1".to_owned(), "http://b:1".to_owned()])?;
    let mut len = 0;
    for _ in 0..200 {
        len = map.endpoints().await?.len();
        if len == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(len, 2);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn get_many_waits_for_discovery_and_agrees_with_get() -> Result<()> {
    let (tx, rx) = mpsc::channel(4);
    let map = EndpointMap::from_discovery(rx);
    let keys = ["repo-a@sha1", "repo-b@sha2", "repo-c@sha3", "repo-a@sha1"];

    let batch = {
        let map = map.clone();
        tokio::spawn(async move { map.get_many(&keys).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!batch.is_finished(), "lookups must wait for the first discovery update");

    tx.send(Ok(vec![Endpoint::new("a"), Endpoint::new("b"), Endpoint::new("c")]))
        .await?;
    let routed = tokio::time::timeout(Duration::from_secs(5), batch).await???;

    assert_eq!(routed.len(), keys.len());
    for (key, endpoint) in keys.iter().zip(&routed) {
        assert_eq!(&map.get(key).await?, endpoint, "{key}");
    }
    assert_eq!(routed[0], routed[3]);
    Ok(())
}
