use anyhow::{Result, anyhow};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{EVENT_INBOX_SIZE, Provider};
use crate::approvals::{ApprovalError, ApprovalStatus, Manager, NewApproval};
use crate::audit::AuditLogger;
use crate::clock::Clock;
use crate::image::{self, Reference};
use crate::metrics;
use crate::models::{
    Event, EventNotification, Level, NotificationKind, Repository, TrackedImage, TriggerKind,
    annotations,
};
use crate::notifications::Sender;
use crate::policy::Policy;

pub const PROVIDER_NAME: &str = "helm";

/// A deployed chart release as the release manager reports it
#[derive(Debug, Clone)]
pub struct Release {
    pub name: String,
    pub namespace: String,
    /// Effective chart values
    pub values: serde_json::Value,
}

/// Release manager surface: enumerate releases and apply value overrides
#[async_trait::async_trait]
pub trait ReleaseImplementer: Send + Sync {
    async fn list_releases(&self) -> Result<Vec<Release>>;

    /// Upgrade a release with `path=value` overrides
    async fn update_release(
        &self,
        namespace: &str,
        name: &str,
        values: &BTreeMap<String, String>,
    ) -> Result<()>;
}

fn default_match_pre_release() -> bool {
    true
}

/// The `quilla:` block of a chart's values
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartConfig {
    pub policy: String,
    #[serde(default)]
    pub match_tag: bool,
    #[serde(default = "default_match_pre_release")]
    pub match_pre_release: bool,
    #[serde(default)]
    pub trigger: String,
    #[serde(default)]
    pub poll_schedule: String,
    #[serde(default)]
    pub approvals: u32,
    #[serde(default)]
    pub approval_deadline: Option<i64>,
    #[serde(default)]
    pub images: Vec<ImageDetails>,
    #[serde(default)]
    pub notification_channels: Vec<String>,
}

impl ChartConfig {
    pub fn policy(&self) -> Policy {
        match Policy::parse(&self.policy, self.match_tag, self.match_pre_release) {
            Ok(policy) => policy,
            Err(e) => {
                warn!("invalid chart policy {:?}: {}", self.policy, e);
                Policy::None
            },
        }
    }
}

/// Value paths describing where one image lives in the chart values
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageDetails {
    /// Path to the repository value; holds the tag too when no tag path
    /// is configured
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
    #[serde(default)]
    pub release_notes: Option<String>,
    #[serde(default)]
    pub image_pull_secret: Option<String>,
}

/// A decided release upgrade: value overrides keyed by dotted path
#[derive(Debug, Clone)]
pub struct ReleasePlan {
    pub namespace: String,
    pub name: String,
    pub values: BTreeMap<String, String>,
    pub current_version: String,
    pub new_version: String,
    pub release_notes: Vec<String>,
    pub channels: Vec<String>,
    pub approvals_required: u32,
    pub approval_deadline_hours: i64,
    pub empty_config: bool,
}

impl ReleasePlan {
    pub fn delta(&self) -> String {
        format!("{} -> {}", self.current_version, self.new_version)
    }

    fn values_summary(&self) -> String {
        self.values
            .iter()
            .map(|(path, value)| format!("{}={}", path, value))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Decode a release's values.yaml text into the value tree the planner
/// traverses
pub fn parse_values_yaml(raw: &str) -> Result<serde_json::Value> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_yaml::from_str(raw).map_err(|e| anyhow!("failed to parse release values: {}", e))
}

/// Look a dotted path up in chart values
pub fn value_at_path(values: &serde_json::Value, path: &str) -> Option<String> {
    let mut current = values;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    match current {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Extract the `quilla` config block from chart values
pub fn chart_config(values: &serde_json::Value) -> Option<ChartConfig> {
    let block = values.get("quilla")?;
    match serde_json::from_value(block.clone()) {
        Ok(config) => Some(config),
        Err(e) => {
            warn!("failed to decode chart quilla config: {}", e);
            None
        },
    }
}

/// Decide whether a release is impacted by the event, and how to mutate
/// its values. Pure given the release snapshot.
pub fn check_release(repo: &Repository, release: &Release) -> Result<Option<ReleasePlan>> {
    let config = match chart_config(&release.values) {
        Some(config) => config,
        None => return Ok(None),
    };

    let policy = config.policy();
    if matches!(policy, Policy::None) {
        return Ok(None);
    }

    let event_ref = Reference::parse(&repo.to_string())
        .map_err(|e| anyhow!("failed to parse event repository: {}", e))?;

    let mut plan = ReleasePlan {
        namespace: release.namespace.clone(),
        name: release.name.clone(),
        values: BTreeMap::new(),
        current_version: String::new(),
        new_version: String::new(),
        release_notes: Vec::new(),
        channels: config.notification_channels.clone(),
        approvals_required: config.approvals,
        approval_deadline_hours: config
            .approval_deadline
            .unwrap_or(annotations::APPROVAL_DEADLINE_DEFAULT_HOURS),
        empty_config: release.values.is_null(),
    };
    let mut impacted = false;

    for details in &config.images {
        let repository_value = match value_at_path(&release.values, &details.repository) {
            Some(value) => value,
            None => {
                warn!(
                    "release {}/{} has no value at {:?}",
                    release.namespace, release.name, details.repository
                );
                continue;
            },
        };

        let tag_value = details
            .tag
            .as_ref()
            .and_then(|path| value_at_path(&release.values, path));

        let raw_image = match &tag_value {
            Some(tag) => format!("{}:{}", repository_value, tag),
            None => repository_value.clone(),
        };

        let current_ref = match Reference::parse(&raw_image) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(
                    "failed to parse chart image {:?} for release {}/{}: {}",
                    raw_image, release.namespace, release.name, e
                );
                continue;
            },
        };

        if current_ref != event_ref {
            debug!(
                "chart image {} does not match event {}, ignoring",
                current_ref.remote(),
                event_ref.remote()
            );
            continue;
        }

        match policy.should_update(current_ref.tag(), &repo.tag) {
            Ok(true) => {},
            Ok(false) => {
                debug!(
                    "policy {} ignoring release {}/{} ({} -> {})",
                    policy.name(),
                    release.namespace,
                    release.name,
                    current_ref.tag(),
                    repo.tag
                );
                continue;
            },
            Err(e) => {
                warn!(
                    "policy {} failed for release {}/{}: {}",
                    policy.name(),
                    release.namespace,
                    release.name,
                    e
                );
                continue;
            },
        }

        if let Some(digest_path) = &details.digest
            && let Some(digest) = &repo.digest
        {
            plan.values.insert(digest_path.clone(), digest.clone());
        }

        // Split charts get only the tag rewritten; combined ones get the
        // full image string, preserving its original form
        match &details.tag {
            Some(tag_path) => {
                plan.values.insert(tag_path.clone(), repo.tag.clone());
            },
            None => {
                plan.values.insert(
                    details.repository.clone(),
                    image::with_tag(&repository_value, &repo.tag),
                );
            },
        }

        plan.current_version = current_ref.tag().to_string();
        plan.new_version = repo.tag.clone();
        if let Some(notes) = &details.release_notes {
            plan.release_notes.push(notes.clone());
        }
        impacted = true;
    }

    Ok(if impacted { Some(plan) } else { None })
}

/// The Helm dispatcher, mirroring the Kubernetes provider: bounded
/// inbox, serial consumer, approvals gate, notifications and audit.
pub struct HelmProvider {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    worker: Arc<Worker>,
}

struct Worker {
    implementer: Arc<dyn ReleaseImplementer>,
    approvals: Arc<dyn Manager>,
    sender: Sender,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    default_schedule: String,
}

impl HelmProvider {
    pub fn new(
        implementer: Arc<dyn ReleaseImplementer>,
        approvals: Arc<dyn Manager>,
        sender: Sender,
        audit: Arc<AuditLogger>,
        clock: Arc<dyn Clock>,
        default_schedule: String,
    ) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_INBOX_SIZE);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            worker: Arc::new(Worker {
                implementer,
                approvals,
                sender,
                audit,
                clock,
                default_schedule,
            }),
        }
    }

    pub async fn start(&self, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("helm provider already started");
        let worker = self.worker.clone();

        tokio::spawn(async move {
            info!("helm provider started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("helm provider stopping");
                        return;
                    },
                    event = rx.recv() => match event {
                        Some(event) => worker.process_event(&event).await,
                        None => {
                            warn!("helm provider inbox closed");
                            return;
                        },
                    },
                }
            }
        })
    }

    pub async fn process_event(&self, event: &Event) {
        self.worker.process_event(event).await;
    }
}

#[async_trait::async_trait]
impl Provider for HelmProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn submit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("helm provider inbox closed"))
    }

    async fn tracked_images(&self) -> Result<Vec<TrackedImage>> {
        self.worker.tracked_images().await
    }
}

enum Gate {
    Open,
    Approved(String),
    Skip,
}

impl Worker {
    async fn process_event(&self, event: &Event) {
        self.notify(
            NotificationKind::PreProviderSubmit,
            Level::Debug,
            "provider",
            PROVIDER_NAME,
            &format!("received event for {}", event.repository),
            Vec::new(),
        );

        let releases = match self.implementer.list_releases().await {
            Ok(releases) => releases,
            Err(e) => {
                error!("failed to list releases: {}", e);
                return;
            },
        };

        for release in &releases {
            let plan = match check_release(&event.repository, release) {
                Ok(Some(plan)) => plan,
                Ok(None) => continue,
                Err(e) => {
                    error!(
                        "failed to check release {}/{}: {}",
                        release.namespace, release.name, e
                    );
                    continue;
                },
            };

            match self.check_approval(event, &plan).await {
                Gate::Open => self.dispatch(&plan, None).await,
                Gate::Approved(identifier) => self.dispatch(&plan, Some(identifier)).await,
                Gate::Skip => {},
            }
        }
    }

    fn release_identifier(plan: &ReleasePlan) -> String {
        format!("chart/{}/{}", plan.namespace, plan.name)
    }

    async fn check_approval(&self, event: &Event, plan: &ReleasePlan) -> Gate {
        if plan.approvals_required == 0 {
            return Gate::Open;
        }

        let now = self.clock.now();
        let resource_identifier = Self::release_identifier(plan);
        let identifier = format!(
            "{}/{}:{}",
            PROVIDER_NAME, resource_identifier, plan.new_version
        );

        let existing = match self.approvals.get(&identifier).await {
            Ok(existing) => existing,
            Err(e) => {
                error!("failed to look up approval {}: {}", identifier, e);
                return Gate::Skip;
            },
        };

        if let Some(approval) = existing {
            return match approval.status(now) {
                ApprovalStatus::Approved => Gate::Approved(identifier),
                ApprovalStatus::Pending => {
                    self.notify(
                        NotificationKind::PreReleaseUpdate,
                        Level::Info,
                        "chart",
                        &resource_identifier,
                        &format!(
                            "release update {} awaiting approvals: {}/{} votes",
                            plan.delta(),
                            approval.votes_received(),
                            approval.votes_required
                        ),
                        plan.channels.clone(),
                    );
                    Gate::Skip
                },
                ApprovalStatus::Rejected => {
                    self.notify(
                        NotificationKind::UpdateRejected,
                        Level::Warn,
                        "chart",
                        &resource_identifier,
                        &format!("release update {} was rejected", plan.delta()),
                        plan.channels.clone(),
                    );
                    Gate::Skip
                },
                ApprovalStatus::Expired | ApprovalStatus::Archived => {
                    self.notify(
                        NotificationKind::UpdateExpired,
                        Level::Warn,
                        "chart",
                        &resource_identifier,
                        &format!("approval for release update {} expired", plan.delta()),
                        plan.channels.clone(),
                    );
                    Gate::Skip
                },
            };
        }

        let request = NewApproval {
            identifier: identifier.clone(),
            event: event.clone(),
            message: format!("{} update {}", resource_identifier, plan.delta()),
            current_version: plan.current_version.clone(),
            new_version: plan.new_version.clone(),
            votes_required: plan.approvals_required,
            deadline: now + chrono::Duration::hours(plan.approval_deadline_hours),
        };

        match self.approvals.create(request).await {
            Ok(approval) => {
                self.notify(
                    NotificationKind::PreReleaseUpdate,
                    Level::Info,
                    "chart",
                    &resource_identifier,
                    &format!(
                        "release update {} requires {} approvals before dispatch",
                        plan.delta(),
                        approval.votes_required
                    ),
                    plan.channels.clone(),
                );
            },
            Err(ApprovalError::Collision(_)) => {
                debug!("approval {} already exists", identifier);
            },
            Err(e) => error!("failed to create approval {}: {}", identifier, e),
        }
        Gate::Skip
    }

    async fn dispatch(&self, plan: &ReleasePlan, approval_identifier: Option<String>) {
        let identifier = Self::release_identifier(plan);

        self.notify(
            NotificationKind::PreReleaseUpdate,
            Level::Debug,
            "chart",
            &identifier,
            &format!(
                "preparing to update release {}/{} {} ({})",
                plan.namespace,
                plan.name,
                plan.delta(),
                plan.values_summary()
            ),
            plan.channels.clone(),
        );

        if let Err(e) = self
            .implementer
            .update_release(&plan.namespace, &plan.name, &plan.values)
            .await
        {
            error!(
                "failed to update release {}/{}: {}",
                plan.namespace, plan.name, e
            );
            metrics::UPDATES_FAILED_TOTAL.inc();
            self.notify(
                NotificationKind::ReleaseUpdate,
                Level::Error,
                "chart",
                &identifier,
                &format!(
                    "release update failed {}/{} {} ({}): {}",
                    plan.namespace,
                    plan.name,
                    plan.delta(),
                    plan.values_summary(),
                    e
                ),
                plan.channels.clone(),
            );
            return;
        }

        info!(
            "updated release {}/{} ({})",
            plan.namespace,
            plan.name,
            plan.delta()
        );
        metrics::UPDATES_APPLIED_TOTAL.inc();

        let mut message = format!(
            "successfully updated release {}/{} {} ({})",
            plan.namespace,
            plan.name,
            plan.delta(),
            plan.values_summary()
        );
        if !plan.release_notes.is_empty() {
            message.push_str(&format!(", release notes: {}", plan.release_notes.join(", ")));
        }
        self.notify(
            NotificationKind::ReleaseUpdate,
            Level::Success,
            "chart",
            &identifier,
            &message,
            plan.channels.clone(),
        );

        let mut metadata = HashMap::new();
        metadata.insert("provider".to_string(), PROVIDER_NAME.to_string());
        metadata.insert("currentVersion".to_string(), plan.current_version.clone());
        metadata.insert("newVersion".to_string(), plan.new_version.clone());
        self.audit.record(
            "release update",
            "chart",
            &identifier,
            &message,
            Level::Success,
            metadata,
        );

        if let Some(approval_identifier) = approval_identifier
            && let Err(e) = self.approvals.archive(&approval_identifier).await
        {
            warn!(
                "failed to archive approval {} after dispatch: {}",
                approval_identifier, e
            );
        }
    }

    async fn tracked_images(&self) -> Result<Vec<TrackedImage>> {
        let releases = self.implementer.list_releases().await?;
        let mut images = Vec::new();
        let mut seen = HashSet::new();

        for release in &releases {
            let config = match chart_config(&release.values) {
                Some(config) => config,
                None => continue,
            };
            let policy = config.policy();
            if matches!(policy, Policy::None) {
                continue;
            }

            let trigger: TriggerKind = config.trigger.parse().unwrap_or_default();
            let schedule = if config.poll_schedule.is_empty() {
                self.default_schedule.clone()
            } else {
                config.poll_schedule.clone()
            };

            for details in &config.images {
                let repository_value =
                    match value_at_path(&release.values, &details.repository) {
                        Some(value) => value,
                        None => continue,
                    };
                let tag_value = details
                    .tag
                    .as_ref()
                    .and_then(|path| value_at_path(&release.values, path));

                let raw_image = match &tag_value {
                    Some(tag) => format!("{}:{}", repository_value, tag),
                    None => repository_value,
                };

                let reference = match Reference::parse(&raw_image) {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!("failed to parse chart image {:?}: {}", raw_image, e);
                        continue;
                    },
                };

                let key = format!("{}:{}|{}", reference.remote(), reference.tag(), schedule);
                if !seen.insert(key) {
                    continue;
                }

                images.push(TrackedImage {
                    image: reference,
                    policy: policy.clone(),
                    trigger,
                    poll_schedule: schedule.clone(),
                    namespace: release.namespace.clone(),
                    secrets: details.image_pull_secret.iter().cloned().collect(),
                    provider: PROVIDER_NAME.to_string(),
                    meta: HashMap::new(),
                });
            }
        }

        Ok(images)
    }

    fn notify(
        &self,
        kind: NotificationKind,
        level: Level,
        resource_kind: &str,
        identifier: &str,
        message: &str,
        channels: Vec<String>,
    ) {
        self.sender.send(EventNotification {
            name: kind.to_string(),
            message: message.to_string(),
            created_at: self.clock.now(),
            kind,
            level,
            resource_kind: resource_kind.to_string(),
            identifier: identifier.to_string(),
            channels,
            metadata: HashMap::new(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn release(values: serde_json::Value) -> Release {
        Release {
            name: "webhook-demo".to_string(),
            namespace: "default".to_string(),
            values,
        }
    }

    fn repo(name: &str, tag: &str) -> Repository {
        Repository {
            host: String::new(),
            name: name.to_string(),
            tag: tag.to_string(),
            digest: None,
        }
    }

    #[test]
    fn test_parse_values_yaml() {
        let values = parse_values_yaml(
            "image:\n  repository: karolisr/webhook-demo\n  tag: 0.0.10\n",
        )
        .unwrap();
        assert_eq!(
            value_at_path(&values, "image.repository").as_deref(),
            Some("karolisr/webhook-demo")
        );

        assert!(parse_values_yaml("").unwrap().is_null());
        assert!(parse_values_yaml("{invalid").is_err());
    }

    #[test]
    fn test_value_at_path() {
        let values = json!({"image": {"repository": "karolisr/webhook-demo", "tag": "0.0.10"}});
        assert_eq!(
            value_at_path(&values, "image.repository").as_deref(),
            Some("karolisr/webhook-demo")
        );
        assert_eq!(value_at_path(&values, "image.tag").as_deref(), Some("0.0.10"));
        assert!(value_at_path(&values, "image.digest").is_none());
        assert!(value_at_path(&values, "missing.path").is_none());
    }

    #[test]
    fn test_check_release_split_repository_and_tag() {
        let release = release(json!({
            "quilla": {
                "policy": "all",
                "trigger": "poll",
                "images": [
                    {"repository": "image.repository", "tag": "image.tag"}
                ]
            },
            "image": {"repository": "karolisr/webhook-demo", "tag": "0.0.10"}
        }));

        let plan = check_release(&repo("karolisr/webhook-demo", "0.0.11"), &release)
            .unwrap()
            .unwrap();
        assert_eq!(plan.current_version, "0.0.10");
        assert_eq!(plan.new_version, "0.0.11");
        assert_eq!(plan.values.get("image.tag").map(String::as_str), Some("0.0.11"));
        assert!(!plan.values.contains_key("image.repository"));
    }

    #[test]
    fn test_check_release_combined_image_value() {
        let release = release(json!({
            "quilla": {
                "policy": "all",
                "images": [
                    {"repository": "image.repository"}
                ]
            },
            "image": {"repository": "karolisr/webhook-demo:0.0.10"}
        }));

        let plan = check_release(&repo("karolisr/webhook-demo", "0.0.11"), &release)
            .unwrap()
            .unwrap();
        assert_eq!(
            plan.values.get("image.repository").map(String::as_str),
            Some("karolisr/webhook-demo:0.0.11")
        );
    }

    #[test]
    fn test_check_release_digest_path() {
        let release = release(json!({
            "quilla": {
                "policy": "all",
                "images": [
                    {"repository": "image.repository", "tag": "image.tag", "digest": "image.digest"}
                ]
            },
            "image": {"repository": "karolisr/webhook-demo", "tag": "0.0.10"}
        }));

        let mut repository = repo("karolisr/webhook-demo", "0.0.11");
        repository.digest = Some("sha256:25a0d4".to_string());

        let plan = check_release(&repository, &release).unwrap().unwrap();
        assert_eq!(
            plan.values.get("image.digest").map(String::as_str),
            Some("sha256:25a0d4")
        );
    }

    #[test]
    fn test_check_release_ignores_policy_mismatch() {
        let release = release(json!({
            "quilla": {
                "policy": "patch",
                "images": [
                    {"repository": "image.repository", "tag": "image.tag"}
                ]
            },
            "image": {"repository": "karolisr/webhook-demo", "tag": "1.2.3"}
        }));

        // Minor jump is out of a patch policy's reach
        let plan = check_release(&repo("karolisr/webhook-demo", "1.3.0"), &release).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_check_release_without_config() {
        let release = release(json!({
            "image": {"repository": "karolisr/webhook-demo", "tag": "0.0.10"}
        }));
        let plan = check_release(&repo("karolisr/webhook-demo", "0.0.11"), &release).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_check_release_different_repository() {
        let release = release(json!({
            "quilla": {
                "policy": "all",
                "images": [
                    {"repository": "image.repository", "tag": "image.tag"}
                ]
            },
            "image": {"repository": "karolisr/webhook-demo", "tag": "0.0.10"}
        }));

        let plan = check_release(&repo("other/image", "0.0.11"), &release).unwrap();
        assert!(plan.is_none());
    }

    #[test]
    fn test_chart_config_approvals() {
        let values = json!({
            "quilla": {
                "policy": "major",
                "approvals": 2,
                "approvalDeadline": 4,
                "notificationChannels": ["releases"]
            }
        });

        let config = chart_config(&values).unwrap();
        assert_eq!(config.approvals, 2);
        assert_eq!(config.approval_deadline, Some(4));
        assert_eq!(config.notification_channels, vec!["releases"]);
        assert!(config.match_pre_release);
    }
}
