use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::image::{self, Reference};
use crate::models::{Event, annotations, parse_notification_channels};
use crate::policy::Policy;
use crate::resource::GenericResource;

/// A single field change applied to a workload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    ContainerImage {
        init: bool,
        index: usize,
        image: String,
    },
    TemplateAnnotation { key: String, value: String },
}

/// A decided but not yet applied set of mutations for one resource.
/// Generated fresh per event and never mutated after dispatch.
#[derive(Debug, Clone)]
pub struct UpdatePlan {
    /// Mutated copy of the cached resource, ready to write
    pub resource: GenericResource,
    pub mutations: Vec<Mutation>,
    pub current_version: String,
    pub new_version: String,
    pub release_notes: Option<String>,
    pub channels: Vec<String>,
}

impl UpdatePlan {
    /// `current -> new` delta for messages
    pub fn delta(&self) -> String {
        format!("{} -> {}", self.current_version, self.new_version)
    }
}

/// Re-apply a plan's mutations to a freshly read resource, used when an
/// optimistic-concurrency conflict forces a second attempt.
pub fn apply_mutations(
    resource: &mut GenericResource,
    mutations: &[Mutation],
) -> anyhow::Result<()> {
    for mutation in mutations {
        match mutation {
            Mutation::ContainerImage { init, index, image } => {
                resource.set_container_image(*init, *index, image)?;
            },
            Mutation::TemplateAnnotation { key, value } => {
                resource.set_template_annotation(key, value)?;
            },
        }
    }
    Ok(())
}

/// Compute update plans for an event against a snapshot of the resource
/// cache. Pure given its inputs: the clock timestamp is the only stamp.
pub fn create_plans(
    event: &Event,
    resources: &[GenericResource],
    now: DateTime<Utc>,
) -> Vec<UpdatePlan> {
    let event_ref = match Reference::parse(&event.repository.to_string()) {
        Ok(reference) => reference,
        Err(e) => {
            warn!(
                "failed to parse event repository {:?}: {}",
                event.repository.to_string(),
                e
            );
            return Vec::new();
        },
    };

    let mut plans = Vec::new();

    for resource in resources {
        let policy = Policy::from_metadata(resource.labels(), resource.annotations());
        if matches!(policy, Policy::None) {
            continue;
        }

        if let Some(plan) = plan_resource(resource, &policy, event, &event_ref, now) {
            plans.push(plan);
        }
    }

    plans
}

fn plan_resource(
    resource: &GenericResource,
    policy: &Policy,
    event: &Event,
    event_ref: &Reference,
    now: DateTime<Utc>,
) -> Option<UpdatePlan> {
    let mut mutations = Vec::new();
    let mut current_version = None;

    let mut containers: Vec<(bool, usize, &k8s_openapi::api::core::v1::Container)> = resource
        .containers()
        .iter()
        .enumerate()
        .map(|(index, container)| (false, index, container))
        .collect();
    if resource.init_containers_enabled() {
        containers.extend(
            resource
                .init_containers()
                .iter()
                .enumerate()
                .map(|(index, container)| (true, index, container)),
        );
    }

    for (init, index, container) in containers {
        let raw_image = match container.image.as_deref() {
            Some(image) => image,
            None => continue,
        };

        let current_ref = match Reference::parse(raw_image) {
            Ok(reference) => reference,
            Err(e) => {
                warn!("failed to parse container image {:?}: {}", raw_image, e);
                continue;
            },
        };

        // Repository identity comparison ignores tags
        if &current_ref != event_ref {
            continue;
        }

        match policy.should_update(current_ref.tag(), &event.repository.tag) {
            Ok(true) => {},
            Ok(false) => {
                debug!(
                    "policy {} does not allow {} -> {} for {}",
                    policy.name(),
                    current_ref.tag(),
                    event.repository.tag,
                    resource.identifier()
                );
                continue;
            },
            Err(e) => {
                debug!(
                    "policy {} failed for {} on tag {:?}: {}",
                    policy.name(),
                    resource.identifier(),
                    event.repository.tag,
                    e
                );
                continue;
            },
        }

        // Preserve the original registry and namespace form of the image
        let new_image = image::with_tag(raw_image, &event.repository.tag);
        mutations.push(Mutation::ContainerImage {
            init,
            index,
            image: new_image,
        });
        current_version.get_or_insert_with(|| current_ref.tag().to_string());
    }

    if mutations.is_empty() {
        return None;
    }

    // Stamp the pod template so the orchestrator re-rolls even when the
    // image string is unchanged (force with matchTag)
    mutations.push(Mutation::TemplateAnnotation {
        key: annotations::UPDATE_TIME.to_string(),
        value: now.to_rfc3339(),
    });
    if let Some(digest) = &event.repository.digest {
        mutations.push(Mutation::TemplateAnnotation {
            key: annotations::DIGEST.to_string(),
            value: digest.clone(),
        });
    }

    let mut updated = resource.clone();
    if let Err(e) = apply_mutations(&mut updated, &mutations) {
        warn!("failed to mutate {}: {}", resource.identifier(), e);
        return None;
    }

    Some(UpdatePlan {
        resource: updated,
        mutations,
        current_version: current_version.unwrap_or_default(),
        new_version: event.repository.tag.clone(),
        release_notes: resource
            .annotations()
            .get(annotations::RELEASE_NOTES)
            .cloned(),
        channels: parse_notification_channels(resource.annotations()),
    })
}
