use anyhow::{Result, anyhow};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use kube::api::{Api, PostParams};
use kube::client::Client;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub mod planner;

pub use planner::{Mutation, UpdatePlan, apply_mutations, create_plans};

use super::{EVENT_INBOX_SIZE, Provider};
use crate::approvals::{ApprovalError, ApprovalStatus, Manager, NewApproval};
use crate::audit::AuditLogger;
use crate::cache::ResourceCache;
use crate::clock::Clock;
use crate::image::Reference;
use crate::metrics;
use crate::models::{Event, EventNotification, Level, NotificationKind, TrackedImage};
use crate::notifications::Sender;
use crate::policy::Policy;
use crate::resource::{GenericResource, Workload};

pub const PROVIDER_NAME: &str = "kubernetes";

#[derive(Debug, Error)]
pub enum ImplementerError {
    /// The write lost an optimistic-concurrency race; re-read and retry
    #[error("resource version conflict")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Orchestrator write surface. The concrete client serialises updates by
/// pattern-matching the workload variant.
#[async_trait::async_trait]
pub trait Implementer: Send + Sync {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<GenericResource>;
    async fn update(&self, resource: &GenericResource) -> Result<(), ImplementerError>;
}

/// Kubernetes API backed implementer
pub struct KubeImplementer {
    client: Client,
}

impl KubeImplementer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn map_error(e: kube::Error) -> ImplementerError {
        if let kube::Error::Api(response) = &e
            && response.code == 409
        {
            return ImplementerError::Conflict;
        }
        ImplementerError::Other(e.into())
    }
}

#[async_trait::async_trait]
impl Implementer for KubeImplementer {
    async fn get(&self, kind: &str, namespace: &str, name: &str) -> Result<GenericResource> {
        let resource = match kind {
            "deployment" => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
                GenericResource::from(api.get(name).await?)
            },
            "statefulset" => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
                GenericResource::from(api.get(name).await?)
            },
            "daemonset" => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
                GenericResource::from(api.get(name).await?)
            },
            "cronjob" => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), namespace);
                GenericResource::from(api.get(name).await?)
            },
            "job" => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
                GenericResource::from(api.get(name).await?)
            },
            other => return Err(anyhow!("unsupported workload kind {:?}", other)),
        };
        Ok(resource)
    }

    async fn update(&self, resource: &GenericResource) -> Result<(), ImplementerError> {
        let namespace = resource.namespace();
        let name = resource.name();
        let params = PostParams::default();

        match resource.workload() {
            Workload::Deployment(workload) => {
                let api: Api<Deployment> = Api::namespaced(self.client.clone(), &namespace);
                api.replace(&name, &params, workload)
                    .await
                    .map_err(Self::map_error)?;
            },
            Workload::StatefulSet(workload) => {
                let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), &namespace);
                api.replace(&name, &params, workload)
                    .await
                    .map_err(Self::map_error)?;
            },
            Workload::DaemonSet(workload) => {
                let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), &namespace);
                api.replace(&name, &params, workload)
                    .await
                    .map_err(Self::map_error)?;
            },
            Workload::CronJob(workload) => {
                let api: Api<CronJob> = Api::namespaced(self.client.clone(), &namespace);
                api.replace(&name, &params, workload)
                    .await
                    .map_err(Self::map_error)?;
            },
            Workload::Job(workload) => {
                let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
                api.replace(&name, &params, workload)
                    .await
                    .map_err(Self::map_error)?;
            },
        }
        Ok(())
    }
}

/// The Kubernetes dispatcher: a bounded inbox, a serial consumer, and the
/// planner / approval / notification / audit coordination around each
/// event.
pub struct KubernetesProvider {
    tx: mpsc::Sender<Event>,
    rx: Mutex<Option<mpsc::Receiver<Event>>>,
    worker: Arc<Worker>,
}

struct Worker {
    cache: ResourceCache,
    implementer: Arc<dyn Implementer>,
    approvals: Arc<dyn Manager>,
    sender: Sender,
    audit: Arc<AuditLogger>,
    clock: Arc<dyn Clock>,
    default_schedule: String,
}

impl KubernetesProvider {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cache: ResourceCache,
        implementer: Arc<dyn Implementer>,
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
                cache,
                implementer,
                approvals,
                sender,
                audit,
                clock,
                default_schedule,
            }),
        }
    }

    /// Start the serial consumer. Events are processed one at a time.
    pub async fn start(&self, token: CancellationToken) -> JoinHandle<()> {
        let mut rx = self
            .rx
            .lock()
            .await
            .take()
            .expect("kubernetes provider already started");
        let worker = self.worker.clone();

        tokio::spawn(async move {
            info!("kubernetes provider started");
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("kubernetes provider stopping");
                        return;
                    },
                    event = rx.recv() => match event {
                        Some(event) => worker.process_event(&event).await,
                        None => {
                            warn!("kubernetes provider inbox closed");
                            return;
                        },
                    },
                }
            }
        })
    }

    /// Process a single event inline; the consumer calls this per event
    pub async fn process_event(&self, event: &Event) {
        self.worker.process_event(event).await;
    }
}

#[async_trait::async_trait]
impl Provider for KubernetesProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn submit(&self, event: Event) -> Result<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| anyhow!("kubernetes provider inbox closed"))
    }

    async fn tracked_images(&self) -> Result<Vec<TrackedImage>> {
        Ok(self.worker.tracked_images().await)
    }
}

/// Outcome of the approval gate for one plan
enum Gate {
    /// No approvals required
    Open,
    /// Approved; carries the identifier to archive after dispatch
    Approved(String),
    /// Not dispatchable this cycle
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

        let resources = self.cache.values().await;
        let plans = create_plans(event, &resources, self.clock.now());
        debug!(
            "event for {} produced {} plans from {} resources",
            event.repository,
            plans.len(),
            resources.len()
        );

        for plan in plans {
            match self.check_approval(event, &plan).await {
                Gate::Open => self.dispatch(&plan, None).await,
                Gate::Approved(identifier) => self.dispatch(&plan, Some(identifier)).await,
                Gate::Skip => {},
            }
        }
    }

    /// Decide whether a plan may be dispatched now. Creates the approval
    /// record on first sight and reports terminal outcomes.
    async fn check_approval(&self, event: &Event, plan: &UpdatePlan) -> Gate {
        let required = plan.resource.required_approvals();
        if required == 0 {
            return Gate::Open;
        }

        let now = self.clock.now();
        let identifier = format!(
            "{}/{}:{}",
            PROVIDER_NAME,
            plan.resource.identifier(),
            plan.new_version
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
                        NotificationKind::PreDeploymentUpdate,
                        Level::Info,
                        plan.resource.kind(),
                        &plan.resource.identifier(),
                        &format!(
                            "update {} awaiting approvals: {}/{} votes",
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
                        plan.resource.kind(),
                        &plan.resource.identifier(),
                        &format!("update {} was rejected", plan.delta()),
                        plan.channels.clone(),
                    );
                    Gate::Skip
                },
                ApprovalStatus::Expired | ApprovalStatus::Archived => {
                    self.notify(
                        NotificationKind::UpdateExpired,
                        Level::Warn,
                        plan.resource.kind(),
                        &plan.resource.identifier(),
                        &format!("approval for update {} expired", plan.delta()),
                        plan.channels.clone(),
                    );
                    Gate::Skip
                },
            };
        }

        let deadline = now + chrono::Duration::hours(plan.resource.approval_deadline_hours());
        let request = NewApproval {
            identifier: identifier.clone(),
            event: event.clone(),
            message: format!(
                "{} update {}",
                plan.resource.identifier(),
                plan.delta()
            ),
            current_version: plan.current_version.clone(),
            new_version: plan.new_version.clone(),
            votes_required: required,
            deadline,
        };

        match self.approvals.create(request).await {
            Ok(approval) => {
                self.notify(
                    NotificationKind::PreDeploymentUpdate,
                    Level::Info,
                    plan.resource.kind(),
                    &plan.resource.identifier(),
                    &format!(
                        "update {} requires {} approvals before dispatch",
                        plan.delta(),
                        approval.votes_required
                    ),
                    plan.channels.clone(),
                );
            },
            Err(ApprovalError::Collision(_)) => {
                // Raced another event for the same target; it will gate
                debug!("approval {} already exists", identifier);
            },
            Err(e) => error!("failed to create approval {}: {}", identifier, e),
        }
        Gate::Skip
    }

    async fn dispatch(&self, plan: &UpdatePlan, approval_identifier: Option<String>) {
        let identifier = plan.resource.identifier();

        self.notify(
            NotificationKind::PreDeploymentUpdate,
            Level::Debug,
            plan.resource.kind(),
            &identifier,
            &format!("preparing to update {} ({})", identifier, plan.delta()),
            plan.channels.clone(),
        );

        if let Err(e) = self.write(plan).await {
            error!("failed to update {}: {}", identifier, e);
            metrics::UPDATES_FAILED_TOTAL.inc();
            self.notify(
                NotificationKind::DeploymentUpdate,
                Level::Error,
                plan.resource.kind(),
                &identifier,
                &format!("update {} ({}) failed: {}", identifier, plan.delta(), e),
                plan.channels.clone(),
            );
            // No in-cycle retry; the next event or poll re-evaluates
            return;
        }

        info!("updated {} ({})", identifier, plan.delta());
        metrics::UPDATES_APPLIED_TOTAL.inc();

        let mut message = format!("successfully updated {} ({})", identifier, plan.delta());
        if let Some(notes) = &plan.release_notes {
            message.push_str(&format!(", release notes: {}", notes));
        }
        self.notify(
            NotificationKind::DeploymentUpdate,
            Level::Success,
            plan.resource.kind(),
            &identifier,
            &message,
            plan.channels.clone(),
        );

        let mut metadata = HashMap::new();
        metadata.insert("provider".to_string(), PROVIDER_NAME.to_string());
        metadata.insert("currentVersion".to_string(), plan.current_version.clone());
        metadata.insert("newVersion".to_string(), plan.new_version.clone());
        self.audit.record(
            "deployment update",
            plan.resource.kind(),
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

    /// Write the plan's resource; a conflict forces one fresh read and a
    /// single retry.
    async fn write(&self, plan: &UpdatePlan) -> Result<()> {
        match self.implementer.update(&plan.resource).await {
            Ok(()) => Ok(()),
            Err(ImplementerError::Conflict) => {
                warn!(
                    "conflict while updating {}, retrying against a fresh read",
                    plan.resource.identifier()
                );
                let mut fresh = self
                    .implementer
                    .get(
                        plan.resource.kind(),
                        &plan.resource.namespace(),
                        &plan.resource.name(),
                    )
                    .await?;
                apply_mutations(&mut fresh, &plan.mutations)?;
                self.implementer
                    .update(&fresh)
                    .await
                    .map_err(|e| anyhow!("retry after conflict failed: {}", e))
            },
            Err(ImplementerError::Other(e)) => Err(e),
        }
    }

    /// Tracked images for the poller: every container image on a
    /// resource with a policy, deduplicated by image and schedule.
    async fn tracked_images(&self) -> Vec<TrackedImage> {
        let mut images = Vec::new();
        let mut seen = HashSet::new();

        for resource in self.cache.values().await {
            let policy = Policy::from_metadata(resource.labels(), resource.annotations());
            if matches!(policy, Policy::None) {
                continue;
            }

            let schedule = resource.poll_schedule(&self.default_schedule);
            let secrets = resource.image_pull_secrets();

            let mut raw_images: Vec<&str> = resource
                .containers()
                .iter()
                .filter_map(|c| c.image.as_deref())
                .collect();
            if resource.init_containers_enabled() {
                raw_images.extend(
                    resource
                        .init_containers()
                        .iter()
                        .filter_map(|c| c.image.as_deref()),
                );
            }

            for raw in raw_images {
                let reference = match Reference::parse(raw) {
                    Ok(reference) => reference,
                    Err(e) => {
                        warn!("failed to parse tracked image {:?}: {}", raw, e);
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
                    trigger: resource.trigger(),
                    poll_schedule: schedule.clone(),
                    namespace: resource.namespace(),
                    secrets: secrets.clone(),
                    provider: PROVIDER_NAME.to_string(),
                    meta: HashMap::new(),
                });
            }
        }

        images
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
