//! Sync domain models: domains, per-domain field mappings and record projections.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::errors::Error;

/// Field name to value map used for both remote documents and local rows.
pub type FieldMap = serde_json::Map<String, Value>;

/// Canonical list of domains that participate in remote/local reconciliation.
pub const SYNC_DOMAINS: [SyncDomain; 3] =
    [SyncDomain::Employee, SyncDomain::Permit, SyncDomain::Presence];

/// A reconciled entity family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDomain {
    Employee,
    Permit,
    Presence,
}

impl SyncDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Employee => "employee",
            Self::Permit => "permit",
            Self::Presence => "presence",
        }
    }

    /// Remote collection name.
    pub fn collection(&self) -> &'static str {
        match self {
            Self::Employee => "employees",
            Self::Permit => "permits",
            Self::Presence => "presences",
        }
    }

    /// Local table name.
    pub fn table_name(&self) -> &'static str {
        self.collection()
    }

    pub fn from_collection(collection: &str) -> Option<Self> {
        SYNC_DOMAINS
            .iter()
            .copied()
            .find(|domain| domain.collection() == collection)
    }
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncDomain {
    type Err = Error;

    /// Accepts both the singular domain name and the collection name.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        SYNC_DOMAINS
            .iter()
            .copied()
            .find(|domain| domain.as_str() == normalized || domain.collection() == normalized)
            .ok_or_else(|| Error::UnknownDomain(value.to_string()))
    }
}

/// What the periodic full scan does with a remote record that has no local row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingLocalPolicy {
    /// Create the local row (full-sync domains).
    Create,
    /// Skip the record and report it as `not_found` (event-driven domains).
    ReportNotFound,
}

/// Value transform applied when copying a remote field into a local column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldTransform {
    Identity,
    Trim,
    Lowercase,
    /// Keeps the `YYYY-MM-DD` prefix of RFC 3339 timestamps.
    DateOnly,
}

impl FieldTransform {
    pub fn apply(&self, value: &Value) -> Value {
        match (self, value) {
            (Self::Identity, v) => v.clone(),
            (Self::Trim, Value::String(s)) => Value::String(s.trim().to_string()),
            (Self::Lowercase, Value::String(s)) => Value::String(s.trim().to_lowercase()),
            (Self::DateOnly, Value::String(s)) => {
                let trimmed = s.trim();
                match chrono::DateTime::parse_from_rfc3339(trimmed) {
                    Ok(dt) => Value::String(dt.format("%Y-%m-%d").to_string()),
                    Err(_) => Value::String(trimmed.chars().take(10).collect()),
                }
            }
            (_, v) => v.clone(),
        }
    }
}

/// One `(remote_key, local_key, transform)` entry of a domain's mapping table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub remote_key: &'static str,
    pub local_key: &'static str,
    pub transform: FieldTransform,
    /// Whether the field participates in change detection.
    pub compared: bool,
}

impl FieldMapping {
    pub const fn new(
        remote_key: &'static str,
        local_key: &'static str,
        transform: FieldTransform,
    ) -> Self {
        Self {
            remote_key,
            local_key,
            transform,
            compared: true,
        }
    }

    /// Copied on create but ignored when diffing.
    pub const fn copy_only(
        remote_key: &'static str,
        local_key: &'static str,
        transform: FieldTransform,
    ) -> Self {
        Self {
            remote_key,
            local_key,
            transform,
            compared: false,
        }
    }
}

const EMPLOYEE_FIELDS: &[FieldMapping] = &[
    FieldMapping::new("name", "name", FieldTransform::Trim),
    FieldMapping::new("nip", "nip", FieldTransform::Trim),
    FieldMapping::new("email", "email", FieldTransform::Lowercase),
    FieldMapping::new("phone_number", "phone", FieldTransform::Trim),
    FieldMapping::new("position", "position", FieldTransform::Trim),
    FieldMapping::new("department", "department", FieldTransform::Trim),
    FieldMapping::new("status", "status", FieldTransform::Lowercase),
];

const PERMIT_FIELDS: &[FieldMapping] = &[
    FieldMapping::new("employee_id", "employee_stable_id", FieldTransform::Trim),
    FieldMapping::new("permit_type", "permit_type", FieldTransform::Lowercase),
    FieldMapping::new("start_date", "start_date", FieldTransform::DateOnly),
    FieldMapping::new("end_date", "end_date", FieldTransform::DateOnly),
    FieldMapping::new("reason", "reason", FieldTransform::Trim),
    FieldMapping::new("status", "status", FieldTransform::Lowercase),
    FieldMapping::copy_only("submitted_at", "submitted_at", FieldTransform::Identity),
];

const PRESENCE_FIELDS: &[FieldMapping] = &[
    FieldMapping::new("employee_id", "employee_stable_id", FieldTransform::Trim),
    FieldMapping::new("date", "presence_date", FieldTransform::DateOnly),
    FieldMapping::new("check_in", "check_in", FieldTransform::Identity),
    FieldMapping::new("check_out", "check_out", FieldTransform::Identity),
    FieldMapping::new("status", "status", FieldTransform::Lowercase),
];

/// Static description of how one domain is reconciled.
#[derive(Debug, Clone)]
pub struct DomainSpec {
    pub domain: SyncDomain,
    pub mappings: &'static [FieldMapping],
    pub missing_local: MissingLocalPolicy,
    /// Local column flipped on soft removal.
    pub status_column: &'static str,
    pub inactive_status: &'static str,
}

impl DomainSpec {
    pub fn for_domain(domain: SyncDomain) -> Self {
        match domain {
            SyncDomain::Employee => Self {
                domain,
                mappings: EMPLOYEE_FIELDS,
                missing_local: MissingLocalPolicy::Create,
                status_column: "status",
                inactive_status: "non-aktif",
            },
            SyncDomain::Permit => Self {
                domain,
                mappings: PERMIT_FIELDS,
                missing_local: MissingLocalPolicy::ReportNotFound,
                status_column: "status",
                inactive_status: "dibatalkan",
            },
            SyncDomain::Presence => Self {
                domain,
                mappings: PRESENCE_FIELDS,
                missing_local: MissingLocalPolicy::ReportNotFound,
                status_column: "status",
                inactive_status: "dihapus",
            },
        }
    }

    /// Remote keys requested for a minimal projection.
    pub fn remote_projection(&self) -> Vec<&'static str> {
        self.mappings.iter().map(|m| m.remote_key).collect()
    }

    /// Projects remote fields onto local columns. Absent remote keys are omitted.
    pub fn map_remote_fields(&self, remote: &FieldMap) -> FieldMap {
        let mut mapped = FieldMap::new();
        for mapping in self.mappings {
            if let Some(value) = remote.get(mapping.remote_key) {
                mapped.insert(
                    mapping.local_key.to_string(),
                    normalize_value(&mapping.transform.apply(value)),
                );
            }
        }
        mapped
    }

    /// Projects local columns back onto remote field names.
    pub fn map_local_fields(&self, local: &FieldMap) -> FieldMap {
        let mut mapped = FieldMap::new();
        for mapping in self.mappings {
            if let Some(value) = local.get(mapping.local_key) {
                mapped.insert(mapping.remote_key.to_string(), value.clone());
            }
        }
        mapped
    }

    /// Field-level diff restricted to compared mappings. Returns the local
    /// columns whose values must change, already mapped and normalized.
    pub fn diff(&self, local: &FieldMap, remote: &FieldMap) -> FieldMap {
        let mut changes = FieldMap::new();
        for mapping in self.mappings.iter().filter(|m| m.compared) {
            let Some(remote_value) = remote.get(mapping.remote_key) else {
                continue;
            };
            let incoming = normalize_value(&mapping.transform.apply(remote_value));
            let current = local.get(mapping.local_key).unwrap_or(&Value::Null);
            if !values_equivalent(current, &incoming) {
                changes.insert(mapping.local_key.to_string(), incoming);
            }
        }
        changes
    }

    pub fn is_inactive(&self, local: &FieldMap) -> bool {
        local
            .get(self.status_column)
            .and_then(Value::as_str)
            .map(|status| status == self.inactive_status)
            .unwrap_or(false)
    }
}

/// Coalesces empty and whitespace-only strings into `null`.
pub fn normalize_value(value: &Value) -> Value {
    match value {
        Value::String(s) if s.trim().is_empty() => Value::Null,
        other => other.clone(),
    }
}

/// Loose equality used by change detection: `""` equals `null`, and scalar
/// values compare by their textual form so `1` equals `"1"`.
pub fn values_equivalent(left: &Value, right: &Value) -> bool {
    let left = normalize_value(left);
    let right = normalize_value(right);
    match (&left, &right) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        (Value::String(a), Value::String(b)) => a == b,
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => {
            left == right
        }
        _ => scalar_text(&left) == scalar_text(&right),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Bool(true) => "1".to_string(),
        Value::Bool(false) => "0".to_string(),
        other => other.to_string(),
    }
}

/// Coerces a JSON value to the string form used in push data payloads.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// A document read from the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    /// Document id, the cross-store stable id. `None` when the document carried no id.
    pub id: Option<String>,
    pub fields: FieldMap,
}

impl RemoteRecord {
    pub fn new(id: impl Into<String>, fields: FieldMap) -> Self {
        Self {
            id: Some(id.into()),
            fields,
        }
    }

    pub fn stable_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// A row owned by the local store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalRow {
    /// Local surrogate key.
    pub local_id: i64,
    pub stable_id: String,
    pub fields: FieldMap,
}

/// Domain-agnostic projection of one entity across both stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncedDomainRecord {
    pub domain: SyncDomain,
    pub stable_id: String,
    pub fields: FieldMap,
    pub local_ref: Option<i64>,
    /// Remote document id. Lookup only.
    pub remote_ref: Option<String>,
}

impl SyncedDomainRecord {
    pub fn from_local(domain: SyncDomain, row: &LocalRow) -> Self {
        Self {
            domain,
            stable_id: row.stable_id.clone(),
            fields: row.fields.clone(),
            local_ref: Some(row.local_id),
            remote_ref: Some(row.stable_id.clone()),
        }
    }
}
