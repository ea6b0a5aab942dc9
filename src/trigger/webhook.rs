use anyhow::Result;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::models::{Event, Repository};
use crate::provider::Providers;

/// Registry-native notification envelope (distribution spec)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeWebhook {
    pub events: Vec<NativeEvent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeEvent {
    pub action: String,
    pub target: NativeTarget,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NativeTarget {
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

/// Docker Hub webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubWebhook {
    pub push_data: DockerHubPushData,
    pub repository: DockerHubRepository,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubPushData {
    pub tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerHubRepository {
    pub repo_name: String,
}

/// Quay webhook payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuayWebhook {
    pub name: String,
    pub repository: String,
    pub docker_url: String,
    #[serde(default)]
    pub updated_tags: Vec<String>,
}

/// Generic webhook payload: `{name, tag[, digest]}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericWebhook {
    pub name: String,
    pub tag: String,
    #[serde(default)]
    pub digest: Option<String>,
}

/// Split `[host/]name` into an explicit registry host and repository name
fn split_registry(repository: &str) -> (String, String) {
    if let Some((head, rest)) = repository.split_once('/')
        && (head.contains('.') || head.contains(':') || head == "localhost")
    {
        return (head.to_string(), rest.to_string());
    }
    (String::new(), repository.to_string())
}

/// Events extracted from a native envelope: one per pushed tag
pub fn native_events(payload: &NativeWebhook) -> Vec<Event> {
    let mut events = Vec::new();
    for entry in &payload.events {
        if entry.action != "push" {
            continue;
        }
        let tag = match &entry.target.tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => continue,
        };

        let (host, name) = split_registry(&entry.target.repository);
        events.push(Event::new(
            Repository {
                host,
                name,
                tag,
                digest: entry.target.digest.clone(),
            },
            "native-webhook",
        ));
    }
    events
}

pub fn dockerhub_event(payload: &DockerHubWebhook) -> Option<Event> {
    if payload.push_data.tag.is_empty() || payload.repository.repo_name.is_empty() {
        return None;
    }
    Some(Event::new(
        Repository {
            host: String::new(),
            name: payload.repository.repo_name.clone(),
            tag: payload.push_data.tag.clone(),
            digest: None,
        },
        "dockerhub-webhook",
    ))
}

/// Events extracted from a Quay payload: one per updated tag
pub fn quay_events(payload: &QuayWebhook) -> Vec<Event> {
    if payload.docker_url.is_empty() {
        return Vec::new();
    }
    let (host, name) = split_registry(&payload.docker_url);

    payload
        .updated_tags
        .iter()
        .filter(|tag| !tag.is_empty())
        .map(|tag| {
            Event::new(
                Repository {
                    host: host.clone(),
                    name: name.clone(),
                    tag: tag.clone(),
                    digest: None,
                },
                "quay-webhook",
            )
        })
        .collect()
}

pub fn generic_event(payload: &GenericWebhook) -> Option<Event> {
    if payload.name.is_empty() || payload.tag.is_empty() {
        return None;
    }
    let (host, name) = split_registry(&payload.name);
    Some(Event::new(
        Repository {
            host,
            name,
            tag: payload.tag.clone(),
            digest: payload.digest.clone(),
        },
        "webhook",
    ))
}

#[derive(Clone)]
struct WebhookState {
    providers: Providers,
}

/// Build the webhook router: one endpoint per vendor dialect plus the
/// generic one
pub fn router(providers: Providers) -> Router {
    Router::new()
        .route("/v1/webhooks/native", post(handle_native))
        .route("/v1/webhooks/dockerhub", post(handle_dockerhub))
        .route("/v1/webhooks/quay", post(handle_quay))
        .route("/v1/webhooks/registry", post(handle_generic))
        .route("/healthz", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(WebhookState { providers })
}

pub async fn start_webhook_server(
    addr: &str,
    providers: Providers,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    let app = router(providers);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("webhook server listening on {}", addr);

    let handle = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("webhook server stopped: {}", e);
        }
    });

    Ok(handle)
}

async fn submit_events(state: &WebhookState, events: Vec<Event>) -> (StatusCode, &'static str) {
    if events.is_empty() {
        return (StatusCode::BAD_REQUEST, "no events in payload");
    }

    for event in events {
        debug!("webhook event for {}", event.repository);
        state.providers.submit_all(event).await;
        metrics::WEBHOOK_EVENTS_PROCESSED.inc();
    }
    (StatusCode::OK, "ok")
}

async fn handle_native(
    State(state): State<WebhookState>,
    payload: Result<Json<NativeWebhook>, JsonRejection>,
) -> impl IntoResponse {
    metrics::WEBHOOK_EVENTS_TOTAL.inc();
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("malformed native webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid payload");
        },
    };
    submit_events(&state, native_events(&payload)).await
}

async fn handle_dockerhub(
    State(state): State<WebhookState>,
    payload: Result<Json<DockerHubWebhook>, JsonRejection>,
) -> impl IntoResponse {
    metrics::WEBHOOK_EVENTS_TOTAL.inc();
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("malformed dockerhub webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid payload");
        },
    };
    submit_events(&state, dockerhub_event(&payload).into_iter().collect()).await
}

async fn handle_quay(
    State(state): State<WebhookState>,
    payload: Result<Json<QuayWebhook>, JsonRejection>,
) -> impl IntoResponse {
    metrics::WEBHOOK_EVENTS_TOTAL.inc();
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("malformed quay webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid payload");
        },
    };
    submit_events(&state, quay_events(&payload)).await
}

async fn handle_generic(
    State(state): State<WebhookState>,
    payload: Result<Json<GenericWebhook>, JsonRejection>,
) -> impl IntoResponse {
    metrics::WEBHOOK_EVENTS_TOTAL.inc();
    let Json(payload) = match payload {
        Ok(payload) => payload,
        Err(e) => {
            warn!("malformed webhook payload: {}", e);
            return (StatusCode::BAD_REQUEST, "invalid payload");
        },
    };
    submit_events(&state, generic_event(&payload).into_iter().collect()).await
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_split_registry() {
        assert_eq!(
            split_registry("nginx"),
            (String::new(), "nginx".to_string())
        );
        assert_eq!(
            split_registry("karolisr/webhook-demo"),
            (String::new(), "karolisr/webhook-demo".to_string())
        );
        assert_eq!(
            split_registry("gcr.io/project/image"),
            ("gcr.io".to_string(), "project/image".to_string())
        );
        assert_eq!(
            split_registry("localhost:5000/image"),
            ("localhost:5000".to_string(), "image".to_string())
        );
    }

    #[test]
    fn test_native_events() {
        let payload: NativeWebhook = serde_json::from_value(json!({
            "events": [
                {
                    "action": "push",
                    "target": {
                        "repository": "registry.example.com/app",
                        "tag": "1.2.3",
                        "digest": "sha256:25a0d4"
                    }
                },
                {
                    "action": "pull",
                    "target": {"repository": "registry.example.com/app", "tag": "1.2.3"}
                },
                {
                    "action": "push",
                    "target": {"repository": "registry.example.com/untagged"}
                }
            ]
        }))
        .unwrap();

        let events = native_events(&payload);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].repository.host, "registry.example.com");
        assert_eq!(events[0].repository.name, "app");
        assert_eq!(events[0].repository.tag, "1.2.3");
        assert_eq!(events[0].repository.digest.as_deref(), Some("sha256:25a0d4"));
    }

    #[test]
    fn test_dockerhub_event() {
        let payload: DockerHubWebhook = serde_json::from_value(json!({
            "push_data": {"tag": "0.0.11"},
            "repository": {"repo_name": "karolisr/webhook-demo"}
        }))
        .unwrap();

        let event = dockerhub_event(&payload).unwrap();
        assert_eq!(event.repository.host, "");
        assert_eq!(event.repository.name, "karolisr/webhook-demo");
        assert_eq!(event.repository.tag, "0.0.11");

        let empty: DockerHubWebhook = serde_json::from_value(json!({
            "push_data": {"tag": ""},
            "repository": {"repo_name": "karolisr/webhook-demo"}
        }))
        .unwrap();
        assert!(dockerhub_event(&empty).is_none());
    }

    #[test]
    fn test_quay_events_one_per_tag() {
        let payload: QuayWebhook = serde_json::from_value(json!({
            "name": "repository",
            "repository": "mynamespace/repository",
            "docker_url": "quay.io/mynamespace/repository",
            "updated_tags": ["latest", "1.2.3"]
        }))
        .unwrap();

        let events = quay_events(&payload);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].repository.host, "quay.io");
        assert_eq!(events[0].repository.name, "mynamespace/repository");
        assert_eq!(events[0].repository.tag, "latest");
        assert_eq!(events[1].repository.tag, "1.2.3");
    }

    #[test]
    fn test_quay_events_empty_tags() {
        let payload: QuayWebhook = serde_json::from_value(json!({
            "name": "repository",
            "repository": "mynamespace/repository",
            "docker_url": "quay.io/mynamespace/repository",
            "updated_tags": []
        }))
        .unwrap();

        assert!(quay_events(&payload).is_empty());
    }

    #[test]
    fn test_generic_event() {
        let payload: GenericWebhook = serde_json::from_value(json!({
            "name": "gcr.io/project/app",
            "tag": "1.2.3"
        }))
        .unwrap();

        let event = generic_event(&payload).unwrap();
        assert_eq!(event.repository.host, "gcr.io");
        assert_eq!(event.repository.name, "project/app");
        assert_eq!(event.repository.tag, "1.2.3");

        let missing_tag: GenericWebhook =
            serde_json::from_value(json!({"name": "app", "tag": ""})).unwrap();
        assert!(generic_event(&missing_tag).is_none());
    }
}
