use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use quilla::approvals::DefaultManager;
use quilla::audit::AuditLogger;
use quilla::cache::{ResourceCache, WatchManager, spawn_drain, translator_channel};
use quilla::clock::system_clock;
use quilla::config::Config;
use quilla::metrics;
use quilla::notifications::{SenderBuilder, WebhookSink, WebhookSinkConfig};
use quilla::provider::kubernetes::{KubeImplementer, KubernetesProvider};
use quilla::provider::{Provider, Providers};
use quilla::registry::credentials::KubernetesSecretsHelper;
use quilla::registry::{CredentialsChain, RegistryClient};
use quilla::store::Store;
use quilla::trigger::poll::PollManager;
use quilla::trigger::webhook::start_webhook_server;

/// Grace period for in-flight dispatches on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "quilla=info,kube=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting quilla");

    let config = Config::from_env();
    let clock = system_clock();
    let shutdown = CancellationToken::new();
    let mut handles = Vec::new();

    // Metrics endpoint
    handles.push(metrics::start_metrics_server(&config.metrics_addr, shutdown.clone()).await?);

    // Durable store, audit log and approvals
    let store = Arc::new(Store::open(&config.data_dir)?);
    let audit = Arc::new(AuditLogger::new(store.clone(), clock.clone()));
    let approvals = Arc::new(DefaultManager::open(
        store.clone(),
        clock.clone(),
        audit.clone(),
    )?);
    handles.push(approvals.clone().spawn_expiry_sweeper(shutdown.clone()));

    // Notification sinks are assembled once at startup
    let mut sender_builder = SenderBuilder::new(config.notification_level);
    if let Some(endpoint) = &config.webhook_endpoint {
        let sink = WebhookSink::new(WebhookSinkConfig {
            endpoint: endpoint.clone(),
            secret: config.webhook_secret.clone(),
        })?;
        sender_builder = sender_builder.register(Box::new(sink));
    }
    let sender = sender_builder.build();

    // Resource cache fed by the workload watchers
    let client = kube::Client::try_default().await?;
    let cache = ResourceCache::new();
    let (translator_tx, translator_rx) = translator_channel();
    handles.push(spawn_drain(cache.clone(), translator_rx, shutdown.clone()));
    handles.extend(WatchManager::new(client.clone(), translator_tx).start(shutdown.clone()));

    // Kubernetes provider
    let implementer = Arc::new(KubeImplementer::new(client.clone()));
    let kubernetes = Arc::new(KubernetesProvider::new(
        cache.clone(),
        implementer,
        approvals.clone(),
        sender.clone(),
        audit.clone(),
        clock.clone(),
        config.poll_default_schedule.clone(),
    ));
    handles.push(kubernetes.start(shutdown.clone()).await);

    let providers = Providers::new(vec![kubernetes.clone() as Arc<dyn Provider>]);

    // Webhook trigger
    handles.push(
        start_webhook_server(&config.webhook_addr, providers.clone(), shutdown.clone()).await?,
    );

    // Poll trigger
    if config.poll_enabled {
        let credentials = Arc::new(
            CredentialsChain::new().register(Box::new(KubernetesSecretsHelper::new(client))),
        );
        let poller = Arc::new(PollManager::new(
            providers.clone(),
            Arc::new(RegistryClient::new()),
            credentials,
            config.poll_default_schedule.clone(),
        ));
        handles.push(poller.start(shutdown.clone()));
    } else {
        info!("poll trigger disabled");
    }

    if config.project_id.is_some() {
        // The pub/sub transport ships as an external adapter; the manager
        // in quilla::trigger::pubsub is wired where one is available
        warn!("PROJECT_ID is set but no pub/sub transport is configured");
    }

    info!("quilla is running");

    // Wait for a shutdown signal, then give in-flight work a grace period
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination signal received"),
    }

    shutdown.cancel();
    let drain_all = async {
        for handle in handles {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain_all).await.is_err() {
        warn!("shutdown grace period elapsed, exiting");
    }

    info!("quilla stopped");
    Ok(())
}
