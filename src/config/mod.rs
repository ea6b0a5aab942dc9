use std::path::PathBuf;
use tracing::warn;

use crate::models::{Level, annotations};

/// Environment-driven settings. The core reads environment variables in
/// this one place.
#[derive(Debug, Clone)]
pub struct Config {
    /// Webhook trigger listen address
    pub webhook_addr: String,
    /// Metrics listen address
    pub metrics_addr: String,
    /// Directory for the durable store (approvals, audit)
    pub data_dir: PathBuf,
    /// Poll trigger enablement; on unless `POLL` is `0` or `false`
    pub poll_enabled: bool,
    /// Default watcher schedule, `@every <duration>` form
    pub poll_default_schedule: String,
    /// Cluster name used to derive pub/sub subscription names
    pub cluster_name: String,
    /// Project id for pub/sub subscriptions; unset disables the trigger
    pub project_id: Option<String>,
    /// Minimum notification level fanned out to sinks
    pub notification_level: Level,
    /// Webhook notification sink endpoint; unset disables the sink
    pub webhook_endpoint: Option<String>,
    /// Shared secret for signing webhook sink payloads
    pub webhook_secret: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            webhook_addr: "0.0.0.0:9300".to_string(),
            metrics_addr: "0.0.0.0:9500".to_string(),
            data_dir: PathBuf::from("/var/lib/quilla"),
            poll_enabled: true,
            poll_default_schedule: annotations::POLL_DEFAULT_SCHEDULE.to_string(),
            cluster_name: "quilla".to_string(),
            project_id: None,
            notification_level: Level::Info,
            webhook_endpoint: None,
            webhook_secret: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            webhook_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.webhook_addr),
            metrics_addr: std::env::var("METRICS_ADDR").unwrap_or(defaults.metrics_addr),
            data_dir: std::env::var("DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            poll_enabled: poll_enabled(std::env::var("POLL").ok().as_deref()),
            poll_default_schedule: std::env::var("POLL_DEFAULTSCHEDULE")
                .unwrap_or(defaults.poll_default_schedule),
            cluster_name: std::env::var("CLUSTER_NAME").unwrap_or(defaults.cluster_name),
            project_id: std::env::var("PROJECT_ID").ok().filter(|v| !v.is_empty()),
            notification_level: std::env::var("NOTIFICATION_LEVEL")
                .ok()
                .and_then(|v| match v.parse() {
                    Ok(level) => Some(level),
                    Err(e) => {
                        warn!("{}, using {}", e, defaults.notification_level);
                        None
                    },
                })
                .unwrap_or(defaults.notification_level),
            webhook_endpoint: std::env::var("WEBHOOK_ENDPOINT")
                .ok()
                .filter(|v| !v.is_empty()),
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok().filter(|v| !v.is_empty()),
        }
    }
}

/// The poll trigger runs unless explicitly switched off.
fn poll_enabled(value: Option<&str>) -> bool {
    !matches!(value, Some("0") | Some("false"))
}
