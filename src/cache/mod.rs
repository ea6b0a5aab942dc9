use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::Api;
use kube::client::Client;
use kube::runtime::watcher;
use kube::runtime::{WatchStreamExt, watcher::Config};
use serde::de::DeserializeOwned;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::resource::GenericResource;

/// Capacity of the translator buffer between the watchers and the cache
/// drain. A full buffer blocks the watcher; this is the designed
/// back-pressure surface.
pub const TRANSLATOR_BUFFER_SIZE: usize = 128;

/// Buffer operations produced by the watchers
#[derive(Debug, Clone)]
pub enum WatchOp {
    Put(GenericResource),
    Delete(String),
    /// Emitted after a (re)list completes: entries of `kind` whose keys
    /// are absent from `keys` are dropped from the cache
    Retain {
        kind: &'static str,
        keys: HashSet<String>,
    },
}

/// Shared index of managed workloads keyed by `kind/namespace/name`.
/// Single writer (the translator drain), many readers; readers only ever
/// see fully written resources.
#[derive(Clone, Default)]
pub struct ResourceCache {
    inner: Arc<RwLock<HashMap<String, GenericResource>>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, identifier: &str) -> Option<GenericResource> {
        self.inner.read().await.get(identifier).cloned()
    }

    /// Snapshot of all cached resources
    pub async fn values(&self) -> Vec<GenericResource> {
        self.inner.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    async fn apply(&self, op: WatchOp) {
        match op {
            WatchOp::Put(resource) => {
                let key = resource.identifier();
                let mut inner = self.inner.write().await;

                // Discard stale deltas: observation of a resource's
                // version must be monotonic
                if let Some(existing) = inner.get(&key)
                    && is_stale(existing.resource_version(), resource.resource_version())
                {
                    debug!("discarding stale delta for {}", key);
                    return;
                }

                inner.insert(key, resource);
            },
            WatchOp::Delete(key) => {
                self.inner.write().await.remove(&key);
            },
            WatchOp::Retain { kind, keys } => {
                let prefix = format!("{}/", kind);
                let mut inner = self.inner.write().await;
                inner.retain(|key, _| !key.starts_with(&prefix) || keys.contains(key));
            },
        }
    }
}

fn is_stale(existing: Option<String>, incoming: Option<String>) -> bool {
    match (
        existing.and_then(|v| v.parse::<u64>().ok()),
        incoming.and_then(|v| v.parse::<u64>().ok()),
    ) {
        (Some(existing), Some(incoming)) => incoming < existing,
        _ => false,
    }
}

/// Create the bounded translator channel
pub fn translator_channel() -> (mpsc::Sender<WatchOp>, mpsc::Receiver<WatchOp>) {
    mpsc::channel(TRANSLATOR_BUFFER_SIZE)
}

/// Consume buffer operations and apply them to the cache
pub fn spawn_drain(
    cache: ResourceCache,
    mut rx: mpsc::Receiver<WatchOp>,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("cache drain stopping");
                    return;
                },
                op = rx.recv() => match op {
                    Some(op) => cache.apply(op).await,
                    None => {
                        warn!("translator channel closed, cache drain stopping");
                        return;
                    },
                },
            }
        }
    })
}

/// Subscribes to list/watch streams for every supported workload kind and
/// feeds translated events into the cache drain.
pub struct WatchManager {
    client: Client,
    tx: mpsc::Sender<WatchOp>,
}

impl WatchManager {
    pub fn new(client: Client, tx: mpsc::Sender<WatchOp>) -> Self {
        Self { client, tx }
    }

    pub fn start(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        info!("starting workload watchers");
        vec![
            spawn_watcher::<Deployment>(
                Api::all(self.client.clone()),
                "deployment",
                self.tx.clone(),
                token.clone(),
            ),
            spawn_watcher::<StatefulSet>(
                Api::all(self.client.clone()),
                "statefulset",
                self.tx.clone(),
                token.clone(),
            ),
            spawn_watcher::<DaemonSet>(
                Api::all(self.client.clone()),
                "daemonset",
                self.tx.clone(),
                token.clone(),
            ),
            spawn_watcher::<CronJob>(
                Api::all(self.client.clone()),
                "cronjob",
                self.tx.clone(),
                token.clone(),
            ),
            spawn_watcher::<Job>(
                Api::all(self.client.clone()),
                "job",
                self.tx.clone(),
                token,
            ),
        ]
    }
}

fn spawn_watcher<K>(
    api: Api<K>,
    kind: &'static str,
    tx: mpsc::Sender<WatchOp>,
    token: CancellationToken,
) -> JoinHandle<()>
where
    K: kube::Resource + Clone + DeserializeOwned + Debug + Send + 'static,
    GenericResource: From<K>,
{
    tokio::spawn(async move {
        // The watcher behaves as a restartable sequence: on stream error
        // it re-lists and resumes deltas with backoff
        let mut stream = watcher(api, Config::default()).default_backoff().boxed();
        let mut relist_keys: Option<HashSet<String>> = None;

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => {
                    debug!("{} watcher stopping", kind);
                    return;
                },
                event = stream.try_next() => event,
            };

            match event {
                Ok(Some(watcher::Event::Init)) => {
                    debug!("{} watcher (re)listing", kind);
                    relist_keys = Some(HashSet::new());
                },
                Ok(Some(watcher::Event::InitApply(object))) => {
                    let resource = GenericResource::from(object);
                    if let Some(keys) = relist_keys.as_mut() {
                        keys.insert(resource.identifier());
                    }
                    if tx.send(WatchOp::Put(resource)).await.is_err() {
                        return;
                    }
                },
                Ok(Some(watcher::Event::InitDone)) => {
                    if let Some(keys) = relist_keys.take()
                        && tx.send(WatchOp::Retain { kind, keys }).await.is_err()
                    {
                        return;
                    }
                    debug!("{} watcher list complete", kind);
                },
                Ok(Some(watcher::Event::Apply(object))) => {
                    let resource = GenericResource::from(object);
                    if tx.send(WatchOp::Put(resource)).await.is_err() {
                        return;
                    }
                },
                Ok(Some(watcher::Event::Delete(object))) => {
                    let resource = GenericResource::from(object);
                    if tx.send(WatchOp::Delete(resource.identifier())).await.is_err() {
                        return;
                    }
                },
                Ok(None) => {
                    warn!("{} watch stream ended", kind);
                    return;
                },
                Err(e) => {
                    error!("{} watch stream error: {}", kind, e);
                    tokio::time::sleep(Duration::from_secs(1)).await;
                },
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::fixtures::deployment;
    use k8s_openapi::api::apps::v1::Deployment;

    fn with_resource_version(resource: GenericResource, version: &str) -> GenericResource {
        // Rebuild through the concrete type to adjust metadata
        match resource.workload() {
            crate::resource::Workload::Deployment(inner) => {
                let mut inner: Deployment = inner.clone();
                inner.metadata.resource_version = Some(version.to_string());
                GenericResource::from(inner)
            },
            _ => unreachable!("fixture is a deployment"),
        }
    }

    #[tokio::test]
    async fn test_every_put_becomes_visible() {
        let cache = ResourceCache::new();
        let (tx, rx) = translator_channel();
        let token = CancellationToken::new();
        let drain = spawn_drain(cache.clone(), rx, token.clone());

        for n in 0..10 {
            let resource = deployment(&format!("wd-{}", n), "default", "nginx:1.25", &[]);
            tx.send(WatchOp::Put(resource)).await.unwrap();
        }
        drop(tx);
        drain.await.unwrap();

        assert_eq!(cache.len().await, 10);
        assert!(cache.get("deployment/default/wd-3").await.is_some());
        token.cancel();
    }

    #[tokio::test]
    async fn test_delete_then_add_recreates_entry() {
        let cache = ResourceCache::new();

        let resource = deployment("wd-main", "default", "nginx:1.25", &[]);
        let key = resource.identifier();

        cache.apply(WatchOp::Put(resource.clone())).await;
        assert!(cache.get(&key).await.is_some());

        cache.apply(WatchOp::Delete(key.clone())).await;
        assert!(cache.get(&key).await.is_none());

        cache.apply(WatchOp::Put(resource)).await;
        assert!(cache.get(&key).await.is_some());
    }

    #[tokio::test]
    async fn test_stale_deltas_are_discarded() {
        let cache = ResourceCache::new();

        let fresh = with_resource_version(
            deployment("wd-main", "default", "nginx:1.26", &[]),
            "20",
        );
        let stale = with_resource_version(
            deployment("wd-main", "default", "nginx:1.25", &[]),
            "10",
        );
        let key = fresh.identifier();

        cache.apply(WatchOp::Put(fresh)).await;
        cache.apply(WatchOp::Put(stale)).await;

        let cached = cache.get(&key).await.unwrap();
        assert_eq!(cached.resource_version(), Some("20".to_string()));
        assert_eq!(cached.containers()[0].image.as_deref(), Some("nginx:1.26"));
    }

    #[tokio::test]
    async fn test_retain_drops_unlisted_entries_of_kind() {
        let cache = ResourceCache::new();

        let kept = deployment("wd-kept", "default", "nginx:1.25", &[]);
        let dropped = deployment("wd-gone", "default", "nginx:1.25", &[]);
        let kept_key = kept.identifier();
        let dropped_key = dropped.identifier();

        cache.apply(WatchOp::Put(kept)).await;
        cache.apply(WatchOp::Put(dropped)).await;

        let mut keys = HashSet::new();
        keys.insert(kept_key.clone());
        cache
            .apply(WatchOp::Retain {
                kind: "deployment",
                keys,
            })
            .await;

        assert!(cache.get(&kept_key).await.is_some());
        assert!(cache.get(&dropped_key).await.is_none());
    }
}
