// Shared fixtures for integration tests: a deployment builder, a
// recording orchestrator implementer and a fully wired kubernetes
// provider against a temp-dir store and a manual clock.

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

use quilla::approvals::DefaultManager;
use quilla::audit::AuditLogger;
use quilla::cache::{ResourceCache, WatchOp, spawn_drain, translator_channel};
use quilla::clock::ManualClock;
use quilla::models::{Event, Repository};
use quilla::notifications::Sender;
use quilla::provider::kubernetes::{Implementer, ImplementerError, KubernetesProvider};
use quilla::resource::GenericResource;
use quilla::store::Store;

/// Deployment with one container and the given quilla metadata
pub fn deployment(
    name: &str,
    namespace: &str,
    image: &str,
    metadata: &[(&str, &str)],
) -> GenericResource {
    let annotations: BTreeMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    let deployment = Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            annotations: Some(annotations),
            resource_version: Some("1".to_string()),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta::default()),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: "app".to_string(),
                        image: Some(image.to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    };

    GenericResource::from(deployment)
}

pub fn event(name: &str, tag: &str) -> Event {
    Event::new(
        Repository {
            host: String::new(),
            name: name.to_string(),
            tag: tag.to_string(),
            digest: None,
        },
        "test",
    )
}

/// Records every write instead of talking to an orchestrator
#[derive(Default)]
pub struct MockImplementer {
    pub updates: Mutex<Vec<GenericResource>>,
}

#[async_trait::async_trait]
impl Implementer for MockImplementer {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<GenericResource> {
        anyhow::bail!(
            "mock implementer has no resource {}/{}/{}",
            kind,
            namespace,
            name
        )
    }

    async fn update(&self, resource: &GenericResource) -> Result<(), ImplementerError> {
        self.updates.lock().unwrap().push(resource.clone());
        Ok(())
    }
}

impl MockImplementer {
    pub fn update_count(&self) -> usize {
        self.updates.lock().unwrap().len()
    }

    pub fn last_update(&self) -> Option<GenericResource> {
        self.updates.lock().unwrap().last().cloned()
    }
}

pub struct Harness {
    pub cache: ResourceCache,
    pub provider: KubernetesProvider,
    pub implementer: Arc<MockImplementer>,
    pub approvals: Arc<DefaultManager>,
    pub audit: Arc<AuditLogger>,
    pub clock: ManualClock,
    _dir: tempfile::TempDir,
}

pub fn start_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 10, 0, 0).unwrap()
}

/// Wire a kubernetes provider against in-memory fakes
pub fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(dir.path()).unwrap());
    let clock = ManualClock::new(start_time());
    let audit = Arc::new(AuditLogger::new(store.clone(), Arc::new(clock.clone())));
    let approvals =
        Arc::new(DefaultManager::open(store, Arc::new(clock.clone()), audit.clone()).unwrap());
    let implementer = Arc::new(MockImplementer::default());
    let cache = ResourceCache::new();

    let provider = KubernetesProvider::new(
        cache.clone(),
        implementer.clone(),
        approvals.clone(),
        Sender::disabled(),
        audit.clone(),
        Arc::new(clock.clone()),
        "@every 1m".to_string(),
    );

    Harness {
        cache,
        provider,
        implementer,
        approvals,
        audit,
        clock,
        _dir: dir,
    }
}

/// Feed resources through the translator buffer into the cache
pub async fn seed_cache(cache: &ResourceCache, resources: Vec<GenericResource>) {
    let (tx, rx) = translator_channel();
    let token = CancellationToken::new();
    let drain = spawn_drain(cache.clone(), rx, token);

    for resource in resources {
        tx.send(WatchOp::Put(resource)).await.unwrap();
    }
    drop(tx);
    drain.await.unwrap();
}
