use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::audit::AuditLogger;
use crate::clock::Clock;
use crate::metrics;
use crate::models::{Event, Level};
use crate::store::Store;

const BUCKET: &str = "approvals";

/// How often the expiry sweeper checks deadlines
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("approval {0:?} not found")]
    NotFound(String),
    #[error("an active approval already exists for {0:?}")]
    Collision(String),
    #[error("approval {identifier:?} is {status} and no longer accepts votes")]
    Terminal {
        identifier: String,
        status: ApprovalStatus,
    },
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Archived,
}

impl std::fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
            ApprovalStatus::Expired => "expired",
            ApprovalStatus::Archived => "archived",
        };
        write!(f, "{}", s)
    }
}

/// A durable voting record gating one update plan. The identifier is
/// unique among non-archived approvals and carries the target version as
/// its last `:`-separated segment.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub identifier: String,
    pub event: Event,
    pub message: String,
    pub current_version: String,
    pub new_version: String,
    pub votes_required: u32,
    pub voters: BTreeSet<String>,
    pub rejected: bool,
    pub archived: bool,
    pub deadline: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Approval {
    /// Vote count is always derived from the voter set
    pub fn votes_received(&self) -> u32 {
        self.voters.len() as u32
    }

    pub fn status(&self, now: DateTime<Utc>) -> ApprovalStatus {
        if self.archived {
            ApprovalStatus::Archived
        } else if self.rejected {
            ApprovalStatus::Rejected
        } else if self.deadline < now {
            ApprovalStatus::Expired
        } else if self.votes_received() >= self.votes_required {
            ApprovalStatus::Approved
        } else {
            ApprovalStatus::Pending
        }
    }

    /// `current -> new` delta for messages
    pub fn delta(&self) -> String {
        format!("{} -> {}", self.current_version, self.new_version)
    }
}

/// Request to open a new approval
#[derive(Debug, Clone)]
pub struct NewApproval {
    pub identifier: String,
    pub event: Event,
    pub message: String,
    pub current_version: String,
    pub new_version: String,
    pub votes_required: u32,
    pub deadline: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub include_archived: bool,
    pub identifier_prefix: Option<String>,
}

/// Durable store of pending approvals with voting, rejection, expiry and
/// archival. Knows nothing about providers; the dispatcher coordinates.
#[async_trait::async_trait]
pub trait Manager: Send + Sync {
    /// Open an approval. Fails with `Collision` when an active record for
    /// the identifier exists, unless the request raises `votes_required`
    /// (idempotent upgrade). An active record for the same resource but an
    /// older target version is archived and superseded.
    async fn create(&self, request: NewApproval) -> Result<Approval, ApprovalError>;

    async fn get(&self, identifier: &str) -> Result<Option<Approval>, ApprovalError>;

    /// Add a user's vote. Idempotent per user.
    async fn vote(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError>;

    /// Reject, terminally, regardless of vote count.
    async fn reject(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError>;

    /// Archive a record, removing it from the active set.
    async fn archive(&self, identifier: &str) -> Result<(), ApprovalError>;

    /// Snapshot-consistent listing.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Approval>, ApprovalError>;

    /// Count of non-archived, non-rejected approvals.
    async fn pending_count(&self) -> usize;
}

pub struct DefaultManager {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLogger>,
    active: Mutex<HashMap<String, Approval>>,
}

impl DefaultManager {
    /// Load the active set from the store so approvals survive restarts.
    pub fn open(
        store: Arc<Store>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLogger>,
    ) -> Result<Self, ApprovalError> {
        let mut active = HashMap::new();
        let records: Vec<(String, Approval)> = store.list(BUCKET)?;
        for (_, approval) in records {
            if !approval.archived {
                active.insert(approval.identifier.clone(), approval);
            }
        }
        info!("approvals manager loaded {} active records", active.len());

        Ok(Self {
            store,
            clock,
            audit,
            active: Mutex::new(active),
        })
    }

    fn persist(&self, approval: &Approval) -> Result<(), ApprovalError> {
        self.store.put(BUCKET, &approval.id, approval)?;
        Ok(())
    }

    fn audit_mutation(&self, kind: &str, approval: &Approval, level: Level) {
        self.audit.record(
            kind,
            "approval",
            &approval.identifier,
            &format!("{} ({})", kind, approval.delta()),
            level,
            HashMap::new(),
        );
    }

    async fn update_pending_gauge(&self) {
        let count = self.pending_count().await;
        metrics::APPROVALS_PENDING.set(count as i64);
    }

    /// Archive every record whose deadline has passed. Returns the
    /// identifiers that were transitioned.
    pub async fn sweep_expired(&self) -> Result<Vec<String>, ApprovalError> {
        let now = self.clock.now();
        let mut expired = Vec::new();

        {
            let mut active = self.active.lock().await;
            let identifiers: Vec<String> = active
                .values()
                .filter(|a| a.deadline < now && !a.archived)
                .map(|a| a.identifier.clone())
                .collect();

            for identifier in identifiers {
                if let Some(mut approval) = active.remove(&identifier) {
                    approval.archived = true;
                    approval.updated_at = now;
                    self.persist(&approval)?;
                    self.audit_mutation("approval expired", &approval, Level::Warn);
                    metrics::APPROVALS_EXPIRED_TOTAL.inc();
                    expired.push(identifier);
                }
            }
        }

        if !expired.is_empty() {
            info!("archived {} expired approvals", expired.len());
        }
        self.update_pending_gauge().await;
        Ok(expired)
    }

    /// Run the expiry sweeper on a fixed tick until cancelled.
    pub fn spawn_expiry_sweeper(
        self: Arc<Self>,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(SWEEP_INTERVAL);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("approval sweeper stopping");
                        return;
                    },
                    _ = tick.tick() => {
                        if let Err(e) = self.sweep_expired().await {
                            warn!("approval expiry sweep failed: {}", e);
                        }
                    },
                }
            }
        })
    }
}

/// Identifier without the trailing `:version` segment, shared by all
/// approvals for the same resource
fn base_identifier(identifier: &str) -> &str {
    identifier
        .rsplit_once(':')
        .map(|(base, _)| base)
        .unwrap_or(identifier)
}

#[async_trait::async_trait]
impl Manager for DefaultManager {
    async fn create(&self, request: NewApproval) -> Result<Approval, ApprovalError> {
        let now = self.clock.now();
        let mut active = self.active.lock().await;

        if let Some(existing) = active.get_mut(&request.identifier) {
            if request.votes_required > existing.votes_required {
                debug!(
                    "raising required votes for {} from {} to {}",
                    existing.identifier, existing.votes_required, request.votes_required
                );
                existing.votes_required = request.votes_required;
                existing.updated_at = now;
                let updated = existing.clone();
                self.persist(&updated)?;
                self.audit_mutation("approval updated", &updated, Level::Info);
                return Ok(updated);
            }
            return Err(ApprovalError::Collision(request.identifier));
        }

        // A newer target version supersedes any active approval for the
        // same resource
        let base = base_identifier(&request.identifier).to_string();
        let superseded: Vec<String> = active
            .values()
            .filter(|a| base_identifier(&a.identifier) == base)
            .map(|a| a.identifier.clone())
            .collect();
        for identifier in superseded {
            if let Some(mut old) = active.remove(&identifier) {
                info!(
                    "superseding approval {} with {}",
                    old.identifier, request.identifier
                );
                old.archived = true;
                old.updated_at = now;
                self.persist(&old)?;
                self.audit_mutation("approval superseded", &old, Level::Info);
            }
        }

        let approval = Approval {
            id: Uuid::new_v4().to_string(),
            identifier: request.identifier.clone(),
            event: request.event,
            message: request.message,
            current_version: request.current_version,
            new_version: request.new_version,
            votes_required: request.votes_required,
            voters: BTreeSet::new(),
            rejected: false,
            archived: false,
            deadline: request.deadline,
            created_at: now,
            updated_at: now,
        };

        self.persist(&approval)?;
        active.insert(approval.identifier.clone(), approval.clone());
        drop(active);

        info!(
            "approval created: {} requires {} votes",
            approval.identifier, approval.votes_required
        );
        self.audit_mutation("approval created", &approval, Level::Info);
        metrics::APPROVALS_CREATED_TOTAL.inc();
        self.update_pending_gauge().await;
        Ok(approval)
    }

    async fn get(&self, identifier: &str) -> Result<Option<Approval>, ApprovalError> {
        let active = self.active.lock().await;
        Ok(active.get(identifier).cloned())
    }

    async fn vote(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError> {
        let now = self.clock.now();
        let mut active = self.active.lock().await;

        let approval = active
            .get_mut(identifier)
            .ok_or_else(|| ApprovalError::NotFound(identifier.to_string()))?;

        match approval.status(now) {
            ApprovalStatus::Rejected | ApprovalStatus::Expired | ApprovalStatus::Archived => {
                return Err(ApprovalError::Terminal {
                    identifier: identifier.to_string(),
                    status: approval.status(now),
                });
            },
            ApprovalStatus::Pending | ApprovalStatus::Approved => {},
        }

        // A second vote by the same user does not change the count
        if approval.voters.insert(voter.to_string()) {
            approval.updated_at = now;
            let updated = approval.clone();
            drop(active);

            self.persist(&updated)?;
            info!(
                "vote by {:?} on {}: {}/{} votes",
                voter,
                updated.identifier,
                updated.votes_received(),
                updated.votes_required
            );
            self.audit_mutation("approval vote", &updated, Level::Info);
            if updated.status(now) == ApprovalStatus::Approved {
                metrics::APPROVALS_APPROVED_TOTAL.inc();
            }
            Ok(updated)
        } else {
            debug!("duplicate vote by {:?} on {}", voter, identifier);
            Ok(approval.clone())
        }
    }

    async fn reject(&self, identifier: &str, voter: &str) -> Result<Approval, ApprovalError> {
        let now = self.clock.now();
        let mut active = self.active.lock().await;

        let approval = active
            .get_mut(identifier)
            .ok_or_else(|| ApprovalError::NotFound(identifier.to_string()))?;

        approval.rejected = true;
        approval.updated_at = now;
        let updated = approval.clone();
        drop(active);

        self.persist(&updated)?;
        warn!("approval {} rejected by {:?}", updated.identifier, voter);
        self.audit_mutation("approval rejected", &updated, Level::Warn);
        metrics::APPROVALS_REJECTED_TOTAL.inc();
        self.update_pending_gauge().await;
        Ok(updated)
    }

    async fn archive(&self, identifier: &str) -> Result<(), ApprovalError> {
        let now = self.clock.now();
        let mut active = self.active.lock().await;

        let mut approval = active
            .remove(identifier)
            .ok_or_else(|| ApprovalError::NotFound(identifier.to_string()))?;
        drop(active);

        approval.archived = true;
        approval.updated_at = now;
        self.persist(&approval)?;
        self.audit_mutation("approval archived", &approval, Level::Info);
        self.update_pending_gauge().await;
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Approval>, ApprovalError> {
        let mut approvals: Vec<Approval> = if filter.include_archived {
            let records: Vec<(String, Approval)> = self.store.list(BUCKET)?;
            records.into_iter().map(|(_, a)| a).collect()
        } else {
            let active = self.active.lock().await;
            active.values().cloned().collect()
        };

        if let Some(prefix) = &filter.identifier_prefix {
            approvals.retain(|a| a.identifier.starts_with(prefix.as_str()));
        }

        approvals.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(approvals)
    }

    async fn pending_count(&self) -> usize {
        let active = self.active.lock().await;
        active.values().filter(|a| !a.rejected).count()
    }
}
