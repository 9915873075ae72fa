//! nexus_audit_spec
//!
//! Strongly-typed tamper-evident audit entry for the NEXUS gateway.
//! Mirrors the data model in spec section 3 ("Audit entry"):
//! `{id, tenant_id, actor_id?, event, resource, resource_id?, details, ip?,
//!   created_at, prev_hash, entry_hash}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Fields a caller supplies when appending a new entry. `id`, `created_at`,
/// `prev_hash` and `entry_hash` are filled in by the appender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntryInput {
    pub tenant_id: String,
    #[serde(default)]
    pub actor_id: Option<String>,
    pub event: String,
    pub resource: String,
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default = "default_details")]
    pub details: serde_json::Value,
    #[serde(default)]
    pub ip: Option<String>,
}

fn default_details() -> serde_json::Value {
    serde_json::json!({})
}

/// A fully-formed, persisted audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub tenant_id: String,
    pub actor_id: Option<String>,
    pub event: String,
    pub resource: String,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub prev_hash: String,
    pub entry_hash: String,
}

/// The subset of `AuditEntry` that feeds the hash: everything except
/// `entry_hash` itself. Field order here does not matter for the hash
/// (canonicalization sorts keys), but the field set must exactly mirror
/// `AuditEntry` minus `entry_hash` or the chain becomes unverifiable.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntryUnsigned<'a> {
    pub id: &'a Uuid,
    pub tenant_id: &'a str,
    pub actor_id: &'a Option<String>,
    pub event: &'a str,
    pub resource: &'a str,
    pub resource_id: &'a Option<String>,
    pub details: &'a serde_json::Value,
    pub ip: &'a Option<String>,
    pub created_at: DateTime<Utc>,
    pub prev_hash: &'a str,
}

impl AuditEntry {
    pub fn unsigned(&self) -> AuditEntryUnsigned<'_> {
        AuditEntryUnsigned {
            id: &self.id,
            tenant_id: &self.tenant_id,
            actor_id: &self.actor_id,
            event: &self.event,
            resource: &self.resource,
            resource_id: &self.resource_id,
            details: &self.details,
            ip: &self.ip,
            created_at: self.created_at,
            prev_hash: &self.prev_hash,
        }
    }
}

/// Event names the orchestrator itself emits. External callers may log other
/// event strings; these are just the ones the core produces.
pub mod events {
    pub const INFERENCE_COMPLETED: &str = "inference.completed";
    pub const INFERENCE_FAILED: &str = "inference.failed";
}
