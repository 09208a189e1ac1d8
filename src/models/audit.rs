use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One forwarded call, as written to the audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardRecord {
    pub request_id: Uuid,
    pub target: String,
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub caller_id: Option<String>,
    pub caller_role: Option<String>,
    /// `None` when no downstream response arrived.
    pub status: Option<u16>,
    pub outcome: ForwardOutcome,
    pub processing_ms: u64,
    pub cache_hit: bool,
    pub cache_key: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardOutcome {
    /// A downstream response was relayed, whatever its status.
    Relayed,
    /// Served from the response cache without a downstream call.
    Cached,
    /// Failed in the gateway; carries the error kind.
    Failed(String),
}

impl ForwardOutcome {
    pub fn label(&self) -> &str {
        match self {
            ForwardOutcome::Relayed => "relayed",
            ForwardOutcome::Cached => "cached",
            ForwardOutcome::Failed(kind) => kind.as_str(),
        }
    }
}

/// Request volume over a trailing window, from the persisted audit trail.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageStats {
    pub total_requests: i64,
    pub period_days: i64,
    pub method_breakdown: BTreeMap<String, i64>,
    pub status_breakdown: BTreeMap<String, i64>,
}
