use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::models::{Event, Repository};
use crate::provider::Providers;

/// How often the manager rescans tracked images for new registries
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

/// Transport for registries that push events to a topic. The
/// implementation blocks inside `subscribe` for the lifetime of the
/// subscription, submitting decoded events to the providers.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    async fn subscribe(&self, topic: &str, subscription: &str) -> Result<()>;
}

/// Push payload published by the registry: fully-qualified tag and digest
/// references
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushPayload {
    pub action: String,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub tag: String,
}

/// Decode a push payload into an event. Only `INSERT` actions with a
/// tagged reference produce one.
pub fn decode_push_payload(payload: &PushPayload) -> Option<Event> {
    if payload.action != "INSERT" || payload.tag.is_empty() {
        return None;
    }

    let reference = crate::image::Reference::parse(&payload.tag).ok()?;
    let digest = payload
        .digest
        .split_once('@')
        .map(|(_, digest)| digest.to_string());

    Some(Event::new(
        Repository {
            host: reference.registry().to_string(),
            name: reference.repository().to_string(),
            tag: reference.tag().to_string(),
            digest,
        },
        "pubsub",
    ))
}

/// Subscription name for a `(cluster, project, uri)` triple. Unique per
/// cluster so that multiple controller replicas each receive every event,
/// deterministic so restarts resume the same subscription.
pub fn subscription_name(cluster_name: &str, project_id: &str, uri: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cluster_name.as_bytes());
    hasher.update(project_id.as_bytes());
    hasher.update(uri.as_bytes());
    let suffix = hex::encode(&hasher.finalize()[..4]);

    format!(
        "quilla-{}-{}-{}",
        sanitize(cluster_name),
        sanitize(project_id),
        suffix
    )
}

fn sanitize(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Registries whose events arrive over the pub/sub topic
pub fn is_push_capable_registry(registry: &str) -> bool {
    registry.ends_with("gcr.io") || registry.ends_with("docker.pkg.dev")
}

/// Maintains one subscription per registry URI seen among tracked
/// images. Subscriptions that terminate are removed and re-created on
/// the next scan.
pub struct SubscriptionManager {
    providers: Providers,
    client: Arc<dyn Subscriber>,
    cluster_name: String,
    project_id: String,
    subscriptions: Mutex<HashMap<String, CancellationToken>>,
}

impl SubscriptionManager {
    pub fn new(
        providers: Providers,
        client: Arc<dyn Subscriber>,
        cluster_name: String,
        project_id: String,
    ) -> Self {
        Self {
            providers,
            client,
            cluster_name,
            project_id,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn start(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!("pubsub manager started");
            let mut tick = tokio::time::interval(SCAN_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("pubsub manager stopping");
                        let mut subscriptions = self.subscriptions.lock().await;
                        for (_, child) in subscriptions.drain() {
                            child.cancel();
                        }
                        return;
                    },
                    _ = tick.tick() => {
                        if let Err(e) = self.scan(&token).await {
                            error!("pubsub scan failed: {}", e);
                        }
                    },
                }
            }
        })
    }

    async fn scan(self: &Arc<Self>, token: &CancellationToken) -> Result<()> {
        let tracked = self.providers.tracked_images().await;

        for image in tracked {
            let registry = image.image.registry();
            if !is_push_capable_registry(registry) {
                debug!("registry {} does not push events, skipping", registry);
                continue;
            }
            self.ensure_subscription(registry.to_string(), token).await;
        }
        Ok(())
    }

    async fn ensure_subscription(self: &Arc<Self>, uri: String, token: &CancellationToken) {
        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(&uri) {
            return;
        }

        let child = token.child_token();
        subscriptions.insert(uri.clone(), child.clone());

        let name = subscription_name(&self.cluster_name, &self.project_id, &uri);
        info!("creating subscription {} for {}", name, uri);

        let manager = self.clone();
        tokio::spawn(async move {
            let subscribe = manager.client.subscribe(&uri, &name);
            tokio::select! {
                _ = child.cancelled() => {},
                result = subscribe => {
                    if let Err(e) = result {
                        error!("subscription {} for {} failed: {}", name, uri, e);
                    }
                },
            }

            // Drop the entry so the next scan can re-create it
            let mut subscriptions = manager.subscriptions.lock().await;
            subscriptions.remove(&uri);
        });
    }

    /// Handle one decoded push message
    pub async fn handle_payload(&self, payload: &PushPayload) {
        if let Some(event) = decode_push_payload(payload) {
            debug!("pubsub event for {}", event.repository);
            self.providers.submit_all(event).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_push_payload() {
        let payload = PushPayload {
            action: "INSERT".to_string(),
            digest: "gcr.io/project/app@sha256:25a0d4".to_string(),
            tag: "gcr.io/project/app:1.2.3".to_string(),
        };

        let event = decode_push_payload(&payload).unwrap();
        assert_eq!(event.repository.host, "gcr.io");
        assert_eq!(event.repository.name, "project/app");
        assert_eq!(event.repository.tag, "1.2.3");
        assert_eq!(event.repository.digest.as_deref(), Some("sha256:25a0d4"));
        assert_eq!(event.trigger_name, "pubsub");
    }

    #[test]
    fn test_decode_ignores_untagged_and_deletes() {
        let untagged = PushPayload {
            action: "INSERT".to_string(),
            digest: "gcr.io/project/app@sha256:25a0d4".to_string(),
            tag: String::new(),
        };
        assert!(decode_push_payload(&untagged).is_none());

        let delete = PushPayload {
            action: "DELETE".to_string(),
            digest: String::new(),
            tag: "gcr.io/project/app:1.2.3".to_string(),
        };
        assert!(decode_push_payload(&delete).is_none());
    }

    #[test]
    fn test_subscription_name_deterministic_and_cluster_scoped() {
        let one = subscription_name("production", "my-project", "gcr.io");
        let again = subscription_name("production", "my-project", "gcr.io");
        assert_eq!(one, again);

        // Each cluster needs its own subscription to see every event
        let other = subscription_name("staging", "my-project", "gcr.io");
        assert_ne!(one, other);

        assert!(one.starts_with("quilla-production-my-project-"));
    }

    #[test]
    fn test_subscription_name_sanitizes() {
        let name = subscription_name("prod/eu", "my.project", "gcr.io");
        assert!(name.starts_with("quilla-prod-eu-my-project-"));
    }

    #[test]
    fn test_push_capable_registries() {
        assert!(is_push_capable_registry("gcr.io"));
        assert!(is_push_capable_registry("eu.gcr.io"));
        assert!(is_push_capable_registry("europe-docker.pkg.dev"));
        assert!(!is_push_capable_registry("index.docker.io"));
        assert!(!is_push_capable_registry("quay.io"));
    }
}
