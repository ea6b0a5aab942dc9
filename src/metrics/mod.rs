use anyhow::Result;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use lazy_static::lazy_static;
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Webhook metrics
    pub static ref WEBHOOK_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "quilla_webhook_requests_total",
        "Total number of webhook requests received"
    ).unwrap();

    pub static ref WEBHOOK_EVENTS_PROCESSED: IntCounter = IntCounter::new(
        "quilla_webhook_events_processed_total",
        "Total number of webhook events accepted and submitted"
    ).unwrap();

    // Poll trigger metrics
    pub static ref POLL_SCANS_TOTAL: IntCounter = IntCounter::new(
        "quilla_poll_scans_total",
        "Total number of tracked image reconcile passes"
    ).unwrap();

    pub static ref POLL_WATCHERS: IntGauge = IntGauge::new(
        "quilla_poll_watchers",
        "Number of live registry watchers"
    ).unwrap();

    pub static ref POLL_EVENTS_TOTAL: IntCounter = IntCounter::new(
        "quilla_poll_events_total",
        "Total number of events emitted by registry watchers"
    ).unwrap();

    pub static ref REGISTRY_ERRORS_TOTAL: IntCounter = IntCounter::new(
        "quilla_registry_errors_total",
        "Total number of failed registry operations"
    ).unwrap();

    // Update metrics
    pub static ref UPDATES_APPLIED_TOTAL: IntCounter = IntCounter::new(
        "quilla_updates_applied_total",
        "Total number of updates successfully applied"
    ).unwrap();

    pub static ref UPDATES_FAILED_TOTAL: IntCounter = IntCounter::new(
        "quilla_updates_failed_total",
        "Total number of updates that failed to apply"
    ).unwrap();

    // Approval metrics
    pub static ref APPROVALS_CREATED_TOTAL: IntCounter = IntCounter::new(
        "quilla_approvals_created_total",
        "Total number of approval requests created"
    ).unwrap();

    pub static ref APPROVALS_APPROVED_TOTAL: IntCounter = IntCounter::new(
        "quilla_approvals_approved_total",
        "Total number of approvals that reached quorum"
    ).unwrap();

    pub static ref APPROVALS_REJECTED_TOTAL: IntCounter = IntCounter::new(
        "quilla_approvals_rejected_total",
        "Total number of rejected approvals"
    ).unwrap();

    pub static ref APPROVALS_EXPIRED_TOTAL: IntCounter = IntCounter::new(
        "quilla_approvals_expired_total",
        "Total number of approvals archived by the expiry sweeper"
    ).unwrap();

    /// Current count of non-archived, non-rejected approvals
    pub static ref APPROVALS_PENDING: IntGauge = IntGauge::new(
        "quilla_approvals_pending",
        "Number of approvals currently awaiting votes"
    ).unwrap();

    // Notification metrics
    pub static ref NOTIFICATIONS_SENT_TOTAL: IntCounter = IntCounter::new(
        "quilla_notifications_sent_total",
        "Total number of notifications delivered to sinks"
    ).unwrap();

    pub static ref NOTIFICATIONS_FAILED_TOTAL: IntCounter = IntCounter::new(
        "quilla_notifications_failed_total",
        "Total number of notifications dropped after delivery retries"
    ).unwrap();
}

/// Register all collectors. Safe to call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(WEBHOOK_EVENTS_TOTAL.clone()),
        Box::new(WEBHOOK_EVENTS_PROCESSED.clone()),
        Box::new(POLL_SCANS_TOTAL.clone()),
        Box::new(POLL_WATCHERS.clone()),
        Box::new(POLL_EVENTS_TOTAL.clone()),
        Box::new(REGISTRY_ERRORS_TOTAL.clone()),
        Box::new(UPDATES_APPLIED_TOTAL.clone()),
        Box::new(UPDATES_FAILED_TOTAL.clone()),
        Box::new(APPROVALS_CREATED_TOTAL.clone()),
        Box::new(APPROVALS_APPROVED_TOTAL.clone()),
        Box::new(APPROVALS_REJECTED_TOTAL.clone()),
        Box::new(APPROVALS_EXPIRED_TOTAL.clone()),
        Box::new(APPROVALS_PENDING.clone()),
        Box::new(NOTIFICATIONS_SENT_TOTAL.clone()),
        Box::new(NOTIFICATIONS_FAILED_TOTAL.clone()),
    ];

    for collector in collectors {
        if let Err(e) = REGISTRY.register(collector) {
            warn!("failed to register metric: {}", e);
        }
    }
}

async fn serve_metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        warn!("failed to encode metrics: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "OK")
}

pub async fn start_metrics_server(
    addr: &str,
    token: CancellationToken,
) -> Result<JoinHandle<()>> {
    register_metrics();

    let app = Router::new()
        .route("/metrics", get(serve_metrics))
        .route("/healthz", get(health_check));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("metrics server listening on {}", addr);

    let handle = tokio::spawn(async move {
        let shutdown = async move { token.cancelled().await };
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
        {
            warn!("metrics server stopped: {}", e);
        }
    });

    Ok(handle)
}
