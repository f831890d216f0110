//! Storage-owned record shapes for the stage-change audit chain.

use canvass_types::VolunteerId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event submitted for appending to the stage audit chain.
///
/// The reason tag is the system's only audit trail and is preserved
/// verbatim (`auto:<from>-><to>`, `approved:<capability>`, `manual:<verb>`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageAuditAppend {
    pub timestamp: DateTime<Utc>,
    pub volunteer: VolunteerId,
    pub from_stage: String,
    pub to_stage: String,
    pub reason: String,
    pub locked: bool,
}

/// Canonical stored audit record, hash-linked to its predecessor.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageAuditRecord {
    pub event_id: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub volunteer: VolunteerId,
    pub from_stage: String,
    pub to_stage: String,
    pub reason: String,
    pub locked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    pub hash: String,
}
