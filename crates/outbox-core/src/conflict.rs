//! Conflict detection between local and remote copies of an entity.
//!
//! Detection is pure: the same inputs always produce the same findings in
//! the same order (version, timestamp, checksum, then fields sorted by name).

use std::collections::{BTreeSet, HashSet};

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::config::EngineConfig;
use crate::models::{ConflictFinding, ConflictType, Severity, SuggestedResolution};

/// Changes closer together than this are treated as concurrent
pub const CONCURRENT_WINDOW_MS: i64 = 1000;

const ID_FIELD: &str = "id";
const VERSION_FIELD: &str = "version";
const TIMESTAMP_FIELDS: [&str; 4] = ["updated_at", "updatedAt", "modified_at", "modifiedAt"];
const CREATED_FIELDS: [&str; 2] = ["created_at", "createdAt"];

/// Compares entity versions and classifies divergence
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    critical_fields: HashSet<String>,
    important_fields: HashSet<String>,
}

impl ConflictDetector {
    pub fn new(
        critical_fields: impl IntoIterator<Item = String>,
        important_fields: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            critical_fields: critical_fields.into_iter().collect(),
            important_fields: important_fields.into_iter().collect(),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.critical_fields.iter().cloned(),
            config.important_fields.iter().cloned(),
        )
    }

    /// Compare `local` and `remote`, using `original` for field-level checks
    pub fn detect_conflicts(
        &self,
        local: &Value,
        remote: &Value,
        original: Option<&Value>,
    ) -> Vec<ConflictFinding> {
        let mut findings = Vec::new();

        if let Some(finding) = version_finding(local, remote) {
            findings.push(finding);
        }
        if let Some(finding) = timestamp_finding(local, remote) {
            findings.push(finding);
        }
        if let Some(finding) = checksum_finding(local, remote) {
            findings.push(finding);
        }
        if let Some(original) = original {
            findings.extend(self.field_findings(local, remote, original));
        }

        findings
    }

    fn field_findings(
        &self,
        local: &Value,
        remote: &Value,
        original: &Value,
    ) -> Vec<ConflictFinding> {
        let fields: BTreeSet<&String> = object_keys(local)
            .chain(object_keys(remote))
            .filter(|field| !is_metadata_field(field))
            .collect();

        fields
            .into_iter()
            .filter_map(|field| {
                let local_value = field_value(local, field);
                let remote_value = field_value(remote, field);
                let original_value = field_value(original, field);

                let conflicting = local_value != original_value
                    && remote_value != original_value
                    && local_value != remote_value;
                conflicting.then(|| ConflictFinding {
                    conflict_type: ConflictType::ConcurrentField,
                    field: Some(field.clone()),
                    local_value: local_value.clone(),
                    remote_value: remote_value.clone(),
                    severity: self.field_severity(field),
                    description: format!("Field '{field}' was changed locally and remotely"),
                })
            })
            .collect()
    }

    fn field_severity(&self, field: &str) -> Severity {
        if self.critical_fields.contains(field) {
            Severity::High
        } else if self.important_fields.contains(field) {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

fn version_finding(local: &Value, remote: &Value) -> Option<ConflictFinding> {
    let local_version = local.get(VERSION_FIELD)?.as_i64()?;
    let remote_version = remote.get(VERSION_FIELD)?.as_i64()?;
    if local_version == remote_version {
        return None;
    }

    let severity = if remote_version > local_version {
        Severity::High
    } else {
        Severity::Medium
    };
    Some(ConflictFinding {
        conflict_type: ConflictType::Version,
        field: Some(VERSION_FIELD.to_string()),
        local_value: Value::from(local_version),
        remote_value: Value::from(remote_version),
        severity,
        description: format!("Version mismatch: local {local_version}, remote {remote_version}"),
    })
}

fn timestamp_finding(local: &Value, remote: &Value) -> Option<ConflictFinding> {
    let (field, local_time) = timestamp_of(local)?;
    let (_, remote_time) = timestamp_of(remote)?;
    let delta = (local_time - remote_time).abs();

    let (conflict_type, severity, description) = if delta < CONCURRENT_WINDOW_MS {
        if delta == 0 {
            return None;
        }
        (
            ConflictType::Concurrent,
            Severity::Medium,
            format!("Both copies changed within {delta}ms of each other"),
        )
    } else if remote_time > local_time {
        (
            ConflictType::Timestamp,
            Severity::Low,
            format!("Remote copy is newer by {delta}ms"),
        )
    } else {
        return None;
    };

    Some(ConflictFinding {
        conflict_type,
        field: Some(field.to_string()),
        local_value: Value::from(local_time),
        remote_value: Value::from(remote_time),
        severity,
        description,
    })
}

fn checksum_finding(local: &Value, remote: &Value) -> Option<ConflictFinding> {
    let local_checksum = content_checksum(local);
    let remote_checksum = content_checksum(remote);
    (local_checksum != remote_checksum).then(|| ConflictFinding {
        conflict_type: ConflictType::Checksum,
        field: None,
        local_value: Value::String(local_checksum),
        remote_value: Value::String(remote_checksum),
        severity: Severity::High,
        description: "Record content differs".to_string(),
    })
}

/// Hex SHA-256 over a record's content, ignoring id, version and timestamps.
///
/// Object keys serialize in sorted order, so equal content hashes equally.
pub fn content_checksum(value: &Value) -> String {
    let content = match value {
        Value::Object(fields) => Value::Object(
            fields
                .iter()
                .filter(|(field, _)| !is_metadata_field(field))
                .map(|(field, value)| (field.clone(), value.clone()))
                .collect::<Map<String, Value>>(),
        ),
        other => other.clone(),
    };

    let mut hasher = Sha256::new();
    hasher.update(content.to_string().as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Last-modified time of a record in Unix ms.
///
/// Accepts integer milliseconds or RFC 3339 strings.
pub fn timestamp_of(value: &Value) -> Option<(&'static str, i64)> {
    TIMESTAMP_FIELDS.iter().find_map(|field| {
        let millis = match value.get(*field)? {
            Value::Number(number) => number.as_i64()?,
            Value::String(text) => chrono::DateTime::parse_from_rfc3339(text)
                .ok()?
                .timestamp_millis(),
            _ => return None,
        };
        Some((*field, millis))
    })
}

/// Whether a field is bookkeeping rather than record content
pub fn is_metadata_field(field: &str) -> bool {
    field == ID_FIELD
        || field == VERSION_FIELD
        || TIMESTAMP_FIELDS.contains(&field)
        || CREATED_FIELDS.contains(&field)
}

fn object_keys(value: &Value) -> impl Iterator<Item = &String> {
    value.as_object().into_iter().flat_map(Map::keys)
}

fn field_value<'a>(value: &'a Value, field: &str) -> &'a Value {
    value.get(field).unwrap_or(&Value::Null)
}

/// Whether findings may be settled without asking the user
pub fn can_auto_resolve(findings: &[ConflictFinding]) -> bool {
    let any_high = findings
        .iter()
        .any(|finding| finding.severity == Severity::High);
    let medium_count = findings
        .iter()
        .filter(|finding| finding.severity == Severity::Medium)
        .count();
    !any_high && medium_count <= 1
}

/// Recommend a resolution for a set of findings
pub fn suggest_resolution(findings: &[ConflictFinding]) -> SuggestedResolution {
    if findings
        .iter()
        .all(|finding| finding.severity == Severity::Low)
    {
        return SuggestedResolution::AutoMerge;
    }
    if findings.iter().all(|finding| {
        matches!(
            finding.conflict_type,
            ConflictType::Timestamp | ConflictType::Concurrent
        )
    }) {
        return SuggestedResolution::RemoteWins;
    }
    SuggestedResolution::Manual
}
