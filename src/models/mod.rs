use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::image::Reference;
use crate::policy::Policy;

/// Metadata keys recognised on managed resources. Annotations take
/// precedence over labels wherever both are checked.
pub mod annotations {
    /// Update policy selector: `all|major|minor|patch|force|glob:<pat>|regexp:<pat>|none`
    pub const POLICY: &str = "quilla.sh/policy";

    /// Trigger type: `default|poll|approval`
    pub const TRIGGER: &str = "quilla.sh/trigger";

    /// Custom polling schedule, defaults to `@every 1m`
    pub const POLL_SCHEDULE: &str = "quilla.sh/pollSchedule";

    /// Require tag equality before force updating
    pub const MATCH_TAG: &str = "quilla.sh/matchTag";
    /// Legacy spelling of MATCH_TAG, still accepted
    pub const MATCH_TAG_LEGACY: &str = "quilla.sh/match-tag";

    /// Pre-release matching for SemVer policies, defaults to true
    pub const MATCH_PRE_RELEASE: &str = "quilla.sh/matchPreRelease";

    /// Track init containers as well, defaults to false
    pub const INIT_CONTAINERS: &str = "quilla.sh/initContainers";

    /// Minimum required approval votes
    pub const APPROVALS: &str = "quilla.sh/approvals";

    /// Approval deadline in hours
    pub const APPROVAL_DEADLINE: &str = "quilla.sh/approvalDeadline";

    /// Comma-separated notification channel overrides
    pub const NOTIFY: &str = "quilla.sh/notify";

    /// Release notes URL passed on with notifications
    pub const RELEASE_NOTES: &str = "quilla.sh/releaseNotes";

    /// Name of the image pull secret to use for registry credentials
    pub const IMAGE_PULL_SECRET: &str = "quilla.sh/imagePullSecret";

    /// Written by the system on each dispatch
    pub const UPDATE_TIME: &str = "quilla.sh/update-time";

    /// Written by the system when the event carries a digest
    pub const DIGEST: &str = "quilla.sh/digest";

    pub const APPROVAL_DEADLINE_DEFAULT_HOURS: i64 = 24;
    pub const POLL_DEFAULT_SCHEDULE: &str = "@every 1m";
}

/// Look a key up in annotations first, then labels.
pub fn metadata_value<'a>(
    labels: &'a std::collections::BTreeMap<String, String>,
    annotations_map: &'a std::collections::BTreeMap<String, String>,
    key: &str,
) -> Option<&'a str> {
    annotations_map
        .get(key)
        .or_else(|| labels.get(key))
        .map(String::as_str)
}

/// Parse the `notify` annotation into channel names.
pub fn parse_notification_channels(
    annotations_map: &std::collections::BTreeMap<String, String>,
) -> Vec<String> {
    annotations_map
        .get(annotations::NOTIFY)
        .map(|raw| {
            raw.split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Repository fields an event cares about
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    #[serde(default)]
    pub host: String,
    pub name: String,
    #[serde(default)]
    pub tag: String,
    /// Optional digest field
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl fmt::Display for Repository {
    /// Gives the `[host/]team/repo[:tag]` identifier
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.host.is_empty() {
            write!(f, "{}/", self.host)?;
        }
        write!(f, "{}", self.name)?;
        if !self.tag.is_empty() {
            write!(f, ":{}", self.tag)?;
        }
        Ok(())
    }
}

/// Normalised "this repository now has this tag/digest" notice, the
/// currency between trigger sources and providers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub repository: Repository,
    pub created_at: DateTime<Utc>,
    /// Optional field to identify the trigger
    #[serde(default)]
    pub trigger_name: String,
}

impl Event {
    pub fn new(repository: Repository, trigger_name: &str) -> Self {
        Self {
            repository,
            created_at: Utc::now(),
            trigger_name: trigger_name.to_string(),
        }
    }
}

/// Trigger types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    /// Wait for external triggers (webhooks, pub/sub)
    #[default]
    Default,
    /// Set up registry watchers for the affected repositories
    Poll,
    /// Fulfilled approval requests trigger events
    Approval,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Default => write!(f, "default"),
            TriggerKind::Poll => write!(f, "poll"),
            TriggerKind::Approval => write!(f, "approval"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = std::convert::Infallible;

    /// Unrecognised trigger values fall back to the default trigger
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "poll" => TriggerKind::Poll,
            "approval" => TriggerKind::Approval,
            _ => TriggerKind::Default,
        })
    }
}

/// An image registered as interesting because a managed resource
/// currently uses it. Produced by providers, consumed by the poller.
#[derive(Debug, Clone)]
pub struct TrackedImage {
    pub image: Reference,
    pub policy: Policy,
    pub trigger: TriggerKind,
    pub poll_schedule: String,
    pub namespace: String,
    pub secrets: Vec<String>,
    pub provider: String,
    pub meta: HashMap<String, String>,
}

/// Notification types emitted by providers and the approval workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum NotificationKind {
    PreProviderSubmit,
    PostProviderSubmit,
    PreDeploymentUpdate,
    DeploymentUpdate,
    PreReleaseUpdate,
    ReleaseUpdate,
    SystemEvent,
    UpdateApproved,
    UpdateRejected,
    UpdateExpired,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::PreProviderSubmit => "pre provider submit",
            NotificationKind::PostProviderSubmit => "post provider submit",
            NotificationKind::PreDeploymentUpdate => "preparing deployment update",
            NotificationKind::DeploymentUpdate => "deployment update",
            NotificationKind::PreReleaseUpdate => "preparing release update",
            NotificationKind::ReleaseUpdate => "release update",
            NotificationKind::SystemEvent => "system event",
            NotificationKind::UpdateApproved => "update approved",
            NotificationKind::UpdateRejected => "update rejected",
            NotificationKind::UpdateExpired => "update expired",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Error)]
#[error("not a valid notification level: {0:?}")]
pub struct ParseLevelError(String);

/// Notification levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Debug,
    #[default]
    Info,
    Success,
    Warn,
    Error,
    Fatal,
}

impl Level {
    /// Color used when rendering events
    pub fn color(&self) -> &'static str {
        match self {
            Level::Error => "#F44336",
            Level::Info => "#2196F3",
            Level::Success => "#00C853",
            Level::Fatal => "#B71C1C",
            Level::Warn => "#FF9800",
            Level::Debug => "#9E9E9E",
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Success => "success",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for Level {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Level::Debug),
            "info" => Ok(Level::Info),
            "success" => Ok(Level::Success),
            "warn" | "warning" => Ok(Level::Warn),
            "error" => Ok(Level::Error),
            "fatal" => Ok(Level::Fatal),
            other => Err(ParseLevelError(other.to_string())),
        }
    }
}

/// Notification used for sending through the bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub level: Level,
    pub resource_kind: String,
    pub identifier: String,
    /// Optional channel overrides applied per resource
    #[serde(skip)]
    pub channels: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_repository_display() {
        let repo = Repository {
            host: "gcr.io".to_string(),
            name: "project/app".to_string(),
            tag: "1.2.3".to_string(),
            digest: None,
        };
        assert_eq!(repo.to_string(), "gcr.io/project/app:1.2.3");

        let hub = Repository {
            host: String::new(),
            name: "karolisr/webhook-demo".to_string(),
            tag: "latest".to_string(),
            digest: None,
        };
        assert_eq!(hub.to_string(), "karolisr/webhook-demo:latest");
    }

    #[test]
    fn test_metadata_value_annotation_beats_label() {
        let mut labels = BTreeMap::new();
        labels.insert(annotations::POLICY.to_string(), "minor".to_string());
        let mut ann = BTreeMap::new();
        ann.insert(annotations::POLICY.to_string(), "patch".to_string());

        assert_eq!(
            metadata_value(&labels, &ann, annotations::POLICY),
            Some("patch")
        );

        let empty = BTreeMap::new();
        assert_eq!(
            metadata_value(&labels, &empty, annotations::POLICY),
            Some("minor")
        );
        assert_eq!(metadata_value(&empty, &empty, annotations::POLICY), None);
    }

    #[test]
    fn test_parse_notification_channels() {
        let mut ann = BTreeMap::new();
        ann.insert(
            annotations::NOTIFY.to_string(),
            "deployments, releases".to_string(),
        );
        assert_eq!(
            parse_notification_channels(&ann),
            vec!["deployments".to_string(), "releases".to_string()]
        );

        assert!(parse_notification_channels(&BTreeMap::new()).is_empty());
    }

    #[test]
    fn test_trigger_kind_parsing() {
        assert_eq!("poll".parse::<TriggerKind>().unwrap(), TriggerKind::Poll);
        assert_eq!(
            "approval".parse::<TriggerKind>().unwrap(),
            TriggerKind::Approval
        );
        assert_eq!("".parse::<TriggerKind>().unwrap(), TriggerKind::Default);
        assert_eq!(
            "anything".parse::<TriggerKind>().unwrap(),
            TriggerKind::Default
        );
    }

    #[test]
    fn test_level_ordering_and_parsing() {
        assert!(Level::Debug < Level::Info);
        assert!(Level::Info < Level::Success);
        assert!(Level::Error > Level::Warn);

        assert_eq!("warning".parse::<Level>().unwrap(), Level::Warn);
        assert_eq!("SUCCESS".parse::<Level>().unwrap(), Level::Success);
        assert!("verbose".parse::<Level>().is_err());
    }
}
