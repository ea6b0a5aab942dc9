use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::clock::Clock;
use crate::models::Level;
use crate::store::Store;

const BUCKET: &str = "audit";

/// Append-only record of dispatched updates, approval mutations and
/// system events. The source of truth for operator post-mortems.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub kind: String,
    pub resource_kind: String,
    pub identifier: String,
    pub message: String,
    pub level: Level,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// Filter for audit queries; all fields are optional and combine with AND
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub identifier_prefix: Option<String>,
    pub limit: Option<usize>,
}

pub struct AuditLogger {
    store: Arc<Store>,
    clock: Arc<dyn Clock>,
}

impl AuditLogger {
    pub fn new(store: Arc<Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a record. Audit failures are logged and swallowed so they
    /// never abort the operation being recorded.
    pub fn record(
        &self,
        kind: &str,
        resource_kind: &str,
        identifier: &str,
        message: &str,
        level: Level,
        metadata: HashMap<String, String>,
    ) {
        let created_at = self.clock.now();
        let record = AuditRecord {
            id: Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            resource_kind: resource_kind.to_string(),
            identifier: identifier.to_string(),
            message: message.to_string(),
            level,
            metadata,
            created_at,
        };

        // Keys order by creation time so bucket order is log order
        let key = format!("{}/{}", created_at.to_rfc3339(), record.id);
        if let Err(e) = self.store.put(BUCKET, &key, &record) {
            warn!("failed to append audit record for {}: {}", identifier, e);
        }
    }

    /// Records matching the query, oldest first.
    pub fn query(&self, query: &AuditQuery) -> Result<Vec<AuditRecord>> {
        let records: Vec<(String, AuditRecord)> = self.store.list(BUCKET)?;

        let mut matching: Vec<AuditRecord> = records
            .into_iter()
            .map(|(_, record)| record)
            .filter(|record| {
                if let Some(since) = query.since
                    && record.created_at < since
                {
                    return false;
                }
                if let Some(until) = query.until
                    && record.created_at > until
                {
                    return false;
                }
                if let Some(prefix) = &query.identifier_prefix
                    && !record.identifier.starts_with(prefix.as_str())
                {
                    return false;
                }
                true
            })
            .collect();

        if let Some(limit) = query.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}
