//! Kollect core types shared by the watchers, the store and the relay.

#![forbid(unsafe_code)]

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Resource kinds mirrored by the agent.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Node,
    Pod,
    Service,
    Secret,
    Namespace,
    CronJob,
}

impl ResourceKind {
    /// Every kind, in the order baselines are reported.
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Node,
        ResourceKind::Pod,
        ResourceKind::Service,
        ResourceKind::Secret,
        ResourceKind::Namespace,
        ResourceKind::CronJob,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Node => "Node",
            ResourceKind::Pod => "Pod",
            ResourceKind::Service => "Service",
            ResourceKind::Secret => "Secret",
            ResourceKind::Namespace => "Namespace",
            ResourceKind::CronJob => "CronJob",
        }
    }

    /// Cluster-scoped kinds ignore any namespace restriction.
    pub fn namespaced(&self) -> bool {
        !matches!(self, ResourceKind::Node | ResourceKind::Namespace)
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("{kind} object has neither metadata.name nor metadata.generateName")]
    MissingIdentity { kind: ResourceKind },
    #[error("{kind} object is not a JSON object")]
    NotAnObject { kind: ResourceKind },
    #[error("unexpected {kind} watch item: {detail}")]
    UnexpectedItem { kind: ResourceKind, detail: String },
    #[error("{kind} watch stream error: {detail}")]
    Stream { kind: ResourceKind, detail: String },
}

/// Latest known state of one resource instance.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub kind: ResourceKind,
    pub name: String,
    pub generate_name: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    /// Wire payload (stripped and shaped per kind)
    pub payload: serde_json::Value,
}

impl Snapshot {
    /// Build a snapshot from the raw JSON of a cluster object.
    pub fn from_raw(kind: ResourceKind, mut raw: serde_json::Value) -> Result<Self, CoreError> {
        if !raw.is_object() {
            return Err(CoreError::NotAnObject { kind });
        }
        let meta = raw.get("metadata");
        let text = |field: &str| {
            meta.and_then(|m| m.get(field))
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };
        let name = text("name").unwrap_or_default();
        let generate_name = text("generateName");
        if name.is_empty() && generate_name.is_none() {
            return Err(CoreError::MissingIdentity { kind });
        }
        let created_at = text("creationTimestamp")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        if cfg!(feature = "strip-managed-fields") {
            strip_managed_fields(&mut raw);
        }
        let payload = shape(kind, &name, raw);
        Ok(Self { kind, name, generate_name, created_at, payload })
    }

    /// Name the mirror stores this snapshot under: `name`, or the
    /// `generateName` hint while the final name is not yet known.
    pub fn identity(&self) -> &str {
        if self.name.is_empty() {
            self.generate_name.as_deref().unwrap_or("")
        } else {
            &self.name
        }
    }
}

/// Drop server-populated provenance metadata.
pub fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn shape(kind: ResourceKind, name: &str, raw: serde_json::Value) -> serde_json::Value {
    match kind {
        // Nodes report their status inline next to the name.
        ResourceKind::Node => {
            let mut out = serde_json::Map::new();
            if let Some(serde_json::Value::Object(status)) = raw.get("status") {
                out.extend(status.clone());
            }
            out.insert("name".into(), serde_json::Value::String(name.to_string()));
            serde_json::Value::Object(out)
        }
        _ => raw,
    }
}

/// One item read from a list+watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedEvent {
    Added(Snapshot),
    Modified(Snapshot),
    Deleted(Snapshot),
    /// Resource-version checkpoint only
    Bookmark,
    /// Server-side ERROR event
    Error(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "Created",
            Action::Updated => "Updated",
            Action::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum Payload {
    Object(serde_json::Value),
    Name(String),
    /// Serialized as `null`
    Empty,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ChangeRecord {
    pub kind: ResourceKind,
    pub action: Action,
    pub payload: Payload,
}

impl ChangeRecord {
    pub fn created(snap: &Snapshot) -> Self {
        Self { kind: snap.kind, action: Action::Created, payload: Payload::Object(snap.payload.clone()) }
    }

    pub fn updated(snap: &Snapshot) -> Self {
        Self { kind: snap.kind, action: Action::Updated, payload: Payload::Object(snap.payload.clone()) }
    }

    /// Update for a resource the mirror had no slot for.
    pub fn updated_unmatched(kind: ResourceKind) -> Self {
        Self { kind, action: Action::Updated, payload: Payload::Empty }
    }

    pub fn deleted(kind: ResourceKind, removed: Option<String>) -> Self {
        let payload = match removed {
            Some(name) => Payload::Name(name),
            None => Payload::Empty,
        };
        Self { kind, action: Action::Deleted, payload }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClusterInfo {
    pub version: String,
}

impl ClusterInfo {
    pub const UNKNOWN_VERSION: &'static str = "Unknown";
}

impl Default for ClusterInfo {
    fn default() -> Self {
        Self { version: Self::UNKNOWN_VERSION.to_string() }
    }
}

/// One transmission unit sent to the collector.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportBatch {
    /// Records represent a full baseline rather than a delta
    pub first_report: bool,
    pub cluster_name: String,
    pub cluster_version: String,
    pub records: Vec<ChangeRecord>,
}

pub mod prelude {
    pub use super::{
        Action, ChangeRecord, ClusterInfo, CoreError, ObservedEvent, Payload, ReportBatch, ResourceKind, Snapshot,
    };
}
