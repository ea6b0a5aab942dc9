use anyhow::{Result, anyhow};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, PodSpec, PodTemplateSpec};
use kube::ResourceExt;
use std::collections::BTreeMap;

use crate::models::{TriggerKind, annotations, metadata_value};

/// The workload kinds quilla manages, as a closed union. The dispatcher
/// and the orchestrator client pattern-match the variant instead of
/// downcasting.
#[derive(Debug, Clone)]
pub enum Workload {
    Deployment(Deployment),
    StatefulSet(StatefulSet),
    DaemonSet(DaemonSet),
    CronJob(CronJob),
    Job(Job),
}

/// A watched workload with uniform access to metadata, containers and
/// the pod template. Created by the watcher, mutated only on the
/// planner/dispatcher path.
#[derive(Debug, Clone)]
pub struct GenericResource {
    workload: Workload,
}

impl GenericResource {
    pub fn new(workload: Workload) -> Self {
        Self { workload }
    }

    pub fn workload(&self) -> &Workload {
        &self.workload
    }

    pub fn kind(&self) -> &'static str {
        match &self.workload {
            Workload::Deployment(_) => "deployment",
            Workload::StatefulSet(_) => "statefulset",
            Workload::DaemonSet(_) => "daemonset",
            Workload::CronJob(_) => "cronjob",
            Workload::Job(_) => "job",
        }
    }

    pub fn name(&self) -> String {
        match &self.workload {
            Workload::Deployment(w) => w.name_any(),
            Workload::StatefulSet(w) => w.name_any(),
            Workload::DaemonSet(w) => w.name_any(),
            Workload::CronJob(w) => w.name_any(),
            Workload::Job(w) => w.name_any(),
        }
    }

    pub fn namespace(&self) -> String {
        let namespace = match &self.workload {
            Workload::Deployment(w) => w.namespace(),
            Workload::StatefulSet(w) => w.namespace(),
            Workload::DaemonSet(w) => w.namespace(),
            Workload::CronJob(w) => w.namespace(),
            Workload::Job(w) => w.namespace(),
        };
        namespace.unwrap_or_else(|| "default".to_string())
    }

    /// `kind/namespace/name`, the cache key and audit identifier
    pub fn identifier(&self) -> String {
        format!("{}/{}/{}", self.kind(), self.namespace(), self.name())
    }

    pub fn resource_version(&self) -> Option<String> {
        match &self.workload {
            Workload::Deployment(w) => w.resource_version(),
            Workload::StatefulSet(w) => w.resource_version(),
            Workload::DaemonSet(w) => w.resource_version(),
            Workload::CronJob(w) => w.resource_version(),
            Workload::Job(w) => w.resource_version(),
        }
    }

    pub fn labels(&self) -> &BTreeMap<String, String> {
        match &self.workload {
            Workload::Deployment(w) => w.labels(),
            Workload::StatefulSet(w) => w.labels(),
            Workload::DaemonSet(w) => w.labels(),
            Workload::CronJob(w) => w.labels(),
            Workload::Job(w) => w.labels(),
        }
    }

    pub fn annotations(&self) -> &BTreeMap<String, String> {
        match &self.workload {
            Workload::Deployment(w) => w.annotations(),
            Workload::StatefulSet(w) => w.annotations(),
            Workload::DaemonSet(w) => w.annotations(),
            Workload::CronJob(w) => w.annotations(),
            Workload::Job(w) => w.annotations(),
        }
    }

    fn pod_template(&self) -> Option<&PodTemplateSpec> {
        match &self.workload {
            Workload::Deployment(w) => w.spec.as_ref().map(|s| &s.template),
            Workload::StatefulSet(w) => w.spec.as_ref().map(|s| &s.template),
            Workload::DaemonSet(w) => w.spec.as_ref().map(|s| &s.template),
            Workload::CronJob(w) => w
                .spec
                .as_ref()
                .and_then(|s| s.job_template.spec.as_ref())
                .map(|s| &s.template),
            Workload::Job(w) => w.spec.as_ref().map(|s| &s.template),
        }
    }

    fn pod_template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        match &mut self.workload {
            Workload::Deployment(w) => w.spec.as_mut().map(|s| &mut s.template),
            Workload::StatefulSet(w) => w.spec.as_mut().map(|s| &mut s.template),
            Workload::DaemonSet(w) => w.spec.as_mut().map(|s| &mut s.template),
            Workload::CronJob(w) => w
                .spec
                .as_mut()
                .and_then(|s| s.job_template.spec.as_mut())
                .map(|s| &mut s.template),
            Workload::Job(w) => w.spec.as_mut().map(|s| &mut s.template),
        }
    }

    fn pod_spec(&self) -> Option<&PodSpec> {
        self.pod_template().and_then(|t| t.spec.as_ref())
    }

    pub fn containers(&self) -> &[Container] {
        self.pod_spec()
            .map(|s| s.containers.as_slice())
            .unwrap_or(&[])
    }

    pub fn init_containers(&self) -> &[Container] {
        self.pod_spec()
            .and_then(|s| s.init_containers.as_deref())
            .unwrap_or(&[])
    }

    /// Set the image of a (init) container by index
    pub fn set_container_image(&mut self, init: bool, index: usize, image: &str) -> Result<()> {
        let identifier = self.identifier();
        let spec = self
            .pod_template_mut()
            .and_then(|t| t.spec.as_mut())
            .ok_or_else(|| anyhow!("{} has no pod spec", identifier))?;

        let containers = if init {
            spec.init_containers
                .as_mut()
                .ok_or_else(|| anyhow!("{} has no init containers", identifier))?
        } else {
            &mut spec.containers
        };

        let container = containers
            .get_mut(index)
            .ok_or_else(|| anyhow!("{} has no container at index {}", identifier, index))?;
        container.image = Some(image.to_string());
        Ok(())
    }

    /// Stamp a pod template annotation. Rewriting the template metadata
    /// is what makes the orchestrator re-roll even when images are
    /// unchanged.
    pub fn set_template_annotation(&mut self, key: &str, value: &str) -> Result<()> {
        let identifier = self.identifier();
        let template = self
            .pod_template_mut()
            .ok_or_else(|| anyhow!("{} has no pod template", identifier))?;

        template
            .metadata
            .get_or_insert_default()
            .annotations
            .get_or_insert_default()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    pub fn template_annotation(&self, key: &str) -> Option<&str> {
        self.pod_template()
            .and_then(|t| t.metadata.as_ref())
            .and_then(|m| m.annotations.as_ref())
            .and_then(|a| a.get(key))
            .map(String::as_str)
    }

    /// Minimum approval votes required before dispatch; 0 disables gating
    pub fn required_approvals(&self) -> u32 {
        metadata_value(self.labels(), self.annotations(), annotations::APPROVALS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }

    pub fn approval_deadline_hours(&self) -> i64 {
        metadata_value(
            self.labels(),
            self.annotations(),
            annotations::APPROVAL_DEADLINE,
        )
        .and_then(|v| v.parse().ok())
        .unwrap_or(annotations::APPROVAL_DEADLINE_DEFAULT_HOURS)
    }

    pub fn init_containers_enabled(&self) -> bool {
        metadata_value(
            self.labels(),
            self.annotations(),
            annotations::INIT_CONTAINERS,
        )
        .map(|v| v == "true")
        .unwrap_or(false)
    }

    pub fn trigger(&self) -> TriggerKind {
        metadata_value(self.labels(), self.annotations(), annotations::TRIGGER)
            .map(|v| v.parse().unwrap_or_default())
            .unwrap_or_default()
    }

    pub fn poll_schedule(&self, default: &str) -> String {
        metadata_value(
            self.labels(),
            self.annotations(),
            annotations::POLL_SCHEDULE,
        )
        .unwrap_or(default)
        .to_string()
    }

    /// Secrets to try for registry credentials: the imagePullSecret
    /// annotation first, then the pod spec's imagePullSecrets
    pub fn image_pull_secrets(&self) -> Vec<String> {
        let mut secrets = Vec::new();

        if let Some(name) = metadata_value(
            self.labels(),
            self.annotations(),
            annotations::IMAGE_PULL_SECRET,
        ) {
            secrets.push(name.to_string());
        }

        if let Some(spec) = self.pod_spec()
            && let Some(references) = &spec.image_pull_secrets
        {
            for reference in references {
                if !secrets.contains(&reference.name) {
                    secrets.push(reference.name.clone());
                }
            }
        }

        secrets
    }
}

impl From<Deployment> for GenericResource {
    fn from(workload: Deployment) -> Self {
        Self::new(Workload::Deployment(workload))
    }
}

impl From<StatefulSet> for GenericResource {
    fn from(workload: StatefulSet) -> Self {
        Self::new(Workload::StatefulSet(workload))
    }
}

impl From<DaemonSet> for GenericResource {
    fn from(workload: DaemonSet) -> Self {
        Self::new(Workload::DaemonSet(workload))
    }
}

impl From<CronJob> for GenericResource {
    fn from(workload: CronJob) -> Self {
        Self::new(Workload::CronJob(workload))
    }
}

impl From<Job> for GenericResource {
    fn from(workload: Job) -> Self {
        Self::new(Workload::Job(workload))
    }
}

#[cfg(test)]
pub mod fixtures {
    use super::*;
    use k8s_openapi::api::apps::v1::DeploymentSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    /// Deployment with one container, for planner and cache tests
    pub fn deployment(
        name: &str,
        namespace: &str,
        image: &str,
        metadata: &[(&str, &str)],
    ) -> GenericResource {
        deployment_with_containers(name, namespace, &[("app", image)], metadata)
    }

    pub fn deployment_with_containers(
        name: &str,
        namespace: &str,
        containers: &[(&str, &str)],
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
                        containers: containers
                            .iter()
                            .map(|(container_name, image)| Container {
                                name: container_name.to_string(),
                                image: Some(image.to_string()),
                                ..Default::default()
                            })
                            .collect(),
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        GenericResource::from(deployment)
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::deployment;
    use super::*;
    use crate::models::annotations as keys;

    #[test]
    fn test_identifier() {
        let resource = deployment("wd-main", "default", "nginx:1.25", &[]);
        assert_eq!(resource.kind(), "deployment");
        assert_eq!(resource.identifier(), "deployment/default/wd-main");
    }

    #[test]
    fn test_container_access_and_mutation() {
        let mut resource = deployment("wd-main", "default", "nginx:1.25", &[]);
        assert_eq!(resource.containers().len(), 1);
        assert_eq!(
            resource.containers()[0].image.as_deref(),
            Some("nginx:1.25")
        );

        resource.set_container_image(false, 0, "nginx:1.26").unwrap();
        assert_eq!(
            resource.containers()[0].image.as_deref(),
            Some("nginx:1.26")
        );

        assert!(resource.set_container_image(false, 3, "nginx:1.26").is_err());
        assert!(resource.set_container_image(true, 0, "nginx:1.26").is_err());
    }

    #[test]
    fn test_template_annotation_stamping() {
        let mut resource = deployment("wd-main", "default", "nginx:1.25", &[]);
        assert!(resource.template_annotation(keys::UPDATE_TIME).is_none());

        resource
            .set_template_annotation(keys::UPDATE_TIME, "2025-06-01T10:00:00Z")
            .unwrap();
        assert_eq!(
            resource.template_annotation(keys::UPDATE_TIME),
            Some("2025-06-01T10:00:00Z")
        );
    }

    #[test]
    fn test_approval_metadata() {
        let resource = deployment(
            "wd-main",
            "default",
            "nginx:1.25",
            &[(keys::APPROVALS, "2"), (keys::APPROVAL_DEADLINE, "4")],
        );
        assert_eq!(resource.required_approvals(), 2);
        assert_eq!(resource.approval_deadline_hours(), 4);

        let defaults = deployment("wd-main", "default", "nginx:1.25", &[]);
        assert_eq!(defaults.required_approvals(), 0);
        assert_eq!(
            defaults.approval_deadline_hours(),
            keys::APPROVAL_DEADLINE_DEFAULT_HOURS
        );
    }

    #[test]
    fn test_trigger_and_schedule() {
        let resource = deployment(
            "wd-main",
            "default",
            "nginx:1.25",
            &[(keys::TRIGGER, "poll"), (keys::POLL_SCHEDULE, "@every 5m")],
        );
        assert_eq!(resource.trigger(), TriggerKind::Poll);
        assert_eq!(resource.poll_schedule("@every 1m"), "@every 5m");

        let defaults = deployment("wd-main", "default", "nginx:1.25", &[]);
        assert_eq!(defaults.trigger(), TriggerKind::Default);
        assert_eq!(defaults.poll_schedule("@every 1m"), "@every 1m");
    }

    #[test]
    fn test_image_pull_secrets_annotation() {
        let resource = deployment(
            "wd-main",
            "default",
            "private.example.com/app:1.0",
            &[(keys::IMAGE_PULL_SECRET, "registry-creds")],
        );
        assert_eq!(resource.image_pull_secrets(), vec!["registry-creds"]);
    }
}
