//! Core types for declarative resource reconciliation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Raw desired configuration as authored by the user (top-level field -> value)
pub type RawConfig = serde_json::Map<String, Value>;

/// Normalized, defaulted and validated desired state.
///
/// Keys are top-level field paths. Equality is deep and structural:
/// arrays compare element-wise in order, objects compare as maps.
pub type CanonicalConfig = BTreeMap<String, Value>;

/// Identity of a live remote resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub resource_type: String,
    /// Project or equivalent owning scope
    pub scope: String,
    pub name: String,
}

impl ResourceIdentity {
    pub fn new(
        resource_type: impl Into<String>,
        scope: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            resource_type: resource_type.into(),
            scope: scope.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.resource_type, self.scope, self.name)
    }
}

/// Where a resource will be created. The name is absent when the remote
/// assigns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CreateTarget {
    pub resource_type: String,
    pub scope: String,
    pub name: Option<String>,
}

impl CreateTarget {
    /// The full identity, if the name is already known.
    pub fn identity(&self) -> Option<ResourceIdentity> {
        self.name
            .as_ref()
            .map(|n| ResourceIdentity::new(&self.resource_type, &self.scope, n))
    }
}

impl fmt::Display for CreateTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.resource_type,
            self.scope,
            self.name.as_deref().unwrap_or("<server-assigned>")
        )
    }
}

/// Kind of change the diff engine asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
    /// Local-only change; never reaches the remote
    Noop,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
            Self::Noop => "NOOP",
        };
        f.write_str(s)
    }
}

/// A single step of a reconciliation plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeOperation {
    pub kind: OperationKind,
    /// Field paths touched (the update mask for UPDATE)
    pub fields: Vec<String>,
    /// Document sent to the remote (local values for NOOP)
    pub payload: CanonicalConfig,
    /// Whether the remote answers with a long-running operation handle
    pub requires_polling: bool,
}

impl ChangeOperation {
    pub fn is_remote(&self) -> bool {
        self.kind != OperationKind::Noop
    }
}

/// Last observed state of a remote resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveState {
    pub identity: ResourceIdentity,
    pub attributes: CanonicalConfig,
    /// Version used for optimistic-conflict detection
    pub fingerprint: String,
    pub observed_at: DateTime<Utc>,
}

impl LiveState {
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.attributes.get(field).filter(|v| !v.is_null())
    }
}

/// Compute a fingerprint for a set of remote attributes.
///
/// Used when the remote does not supply its own etag.
pub fn fingerprint(attributes: &CanonicalConfig) -> String {
    // BTreeMap and serde_json::Map (without preserve_order) serialize sorted
    let bytes = serde_json::to_vec(attributes).unwrap_or_default();
    blake3::hash(&bytes).to_hex()[..16].to_string()
}

/// Lifecycle phase of a resource instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Absent,
    Creating,
    Present,
    Updating,
    Deleting,
}

/// Event driving a [`Phase`] transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseEvent {
    Begin(OperationKind),
    Succeeded,
    Failed,
    /// Remote state observed directly (read/import)
    Observed { exists: bool },
}

impl Phase {
    /// Compute the next phase, or `None` if the transition is not allowed.
    pub fn advance(self, event: PhaseEvent) -> Option<Phase> {
        use OperationKind as K;
        use Phase::*;
        match (self, event) {
            (Absent, PhaseEvent::Begin(K::Create)) => Some(Creating),
            (Present, PhaseEvent::Begin(K::Update)) => Some(Updating),
            (Present, PhaseEvent::Begin(K::Noop)) => Some(Present),
            (Present, PhaseEvent::Begin(K::Delete)) => Some(Deleting),
            (Creating, PhaseEvent::Succeeded) => Some(Present),
            (Creating, PhaseEvent::Failed) => Some(Absent),
            (Updating, PhaseEvent::Succeeded | PhaseEvent::Failed) => Some(Present),
            (Deleting, PhaseEvent::Succeeded) => Some(Absent),
            (Deleting, PhaseEvent::Failed) => Some(Present),
            (Absent | Present, PhaseEvent::Observed { exists }) => {
                Some(if exists { Present } else { Absent })
            }
            _ => None,
        }
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, Self::Creating | Self::Updating | Self::Deleting)
    }
}
