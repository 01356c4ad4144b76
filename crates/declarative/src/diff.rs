//! Diff engine - canonical desired state vs last known live state

use crate::error::ValidationError;
use crate::schema::{Schema, UpdateRoute};
use crate::types::{CanonicalConfig, ChangeOperation, LiveState, OperationKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single field whose desired value differs from live state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

/// Fields that differ between desired and live state, in schema order.
///
/// Output-only fields are ignored, and so are computed fields the desired
/// state leaves to the server.
pub fn field_changes(schema: &Schema, desired: &CanonicalConfig, live: &LiveState) -> Vec<FieldChange> {
    schema
        .fields
        .iter()
        .filter(|spec| !spec.output_only)
        .filter_map(|spec| {
            let after = desired.get(&spec.name).filter(|v| !v.is_null());
            if after.is_none() && spec.computed {
                return None;
            }
            let before = live.get(&spec.name);
            (before != after).then(|| FieldChange {
                field: spec.name.clone(),
                before: before.cloned(),
                after: after.cloned(),
            })
        })
        .collect()
}

/// Document sent to the remote: every desired field except local-only ones
fn remote_payload(schema: &Schema, desired: &CanonicalConfig) -> CanonicalConfig {
    desired
        .iter()
        .filter(|(name, _)| schema.field(name).is_some_and(|f| !f.is_local_only()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Compute the ordered operations that bring `live` to `desired`.
///
/// - No live state: a single CREATE.
/// - Live state: one UPDATE for all shared-route fields, one UPDATE per
///   separate-call tag, then a NOOP for local-only fields.
/// - Equal states: no operations.
///
/// Changing an immutable field is an error, never an UPDATE.
pub fn diff(
    schema: &Schema,
    desired: &CanonicalConfig,
    live: Option<&LiveState>,
) -> Result<Vec<ChangeOperation>, ValidationError> {
    let Some(live) = live else {
        let payload = remote_payload(schema, desired);
        return Ok(vec![ChangeOperation {
            kind: OperationKind::Create,
            fields: payload.keys().cloned().collect(),
            payload,
            requires_polling: schema.long_running,
        }]);
    };

    let changes = field_changes(schema, desired, live);

    let immutable: Vec<String> = changes
        .iter()
        .filter(|c| schema.field(&c.field).is_some_and(|f| f.immutable))
        .map(|c| c.field.clone())
        .collect();
    if !immutable.is_empty() {
        return Err(ValidationError::ImmutableFieldChanged { fields: immutable });
    }

    let mut shared = Vec::new();
    let mut separate: Vec<(&'static str, Vec<String>)> = Vec::new();
    let mut local = Vec::new();
    for change in changes {
        let route = schema
            .field(&change.field)
            .map_or(UpdateRoute::Shared, |f| f.update);
        match route {
            UpdateRoute::Shared => shared.push(change.field),
            UpdateRoute::Separate(tag) => match separate.iter_mut().find(|(t, _)| *t == tag) {
                Some((_, fields)) => fields.push(change.field),
                None => separate.push((tag, vec![change.field])),
            },
            UpdateRoute::LocalOnly => local.push(change.field),
        }
    }

    let mut ops = Vec::new();
    if !shared.is_empty() || !separate.is_empty() {
        let payload = remote_payload(schema, desired);
        if !shared.is_empty() {
            ops.push(ChangeOperation {
                kind: OperationKind::Update,
                fields: shared,
                payload: payload.clone(),
                requires_polling: schema.long_running,
            });
        }
        for (_, fields) in separate {
            ops.push(ChangeOperation {
                kind: OperationKind::Update,
                fields,
                payload: payload.clone(),
                requires_polling: schema.long_running,
            });
        }
    }
    if !local.is_empty() {
        let payload = local
            .iter()
            .filter_map(|f| desired.get(f).map(|v| (f.clone(), v.clone())))
            .collect();
        ops.push(ChangeOperation {
            kind: OperationKind::Noop,
            fields: local,
            payload,
            requires_polling: false,
        });
    }

    Ok(ops)
}

/// The explicit delete request for a resource type
pub fn delete_operation(schema: &Schema) -> ChangeOperation {
    ChangeOperation {
        kind: OperationKind::Delete,
        fields: Vec::new(),
        payload: CanonicalConfig::new(),
        requires_polling: schema.long_running,
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub creates: usize,
    pub updates: usize,
    pub deletes: usize,
    pub local_only: usize,
}

impl DiffSummary {
    /// Create a summary from a list of operations
    pub fn from_operations(ops: &[ChangeOperation]) -> Self {
        let mut summary = Self::default();
        for op in ops {
            summary.add(op);
        }
        summary
    }

    pub fn add(&mut self, op: &ChangeOperation) {
        match op.kind {
            OperationKind::Create => self.creates += 1,
            OperationKind::Update => self.updates += 1,
            OperationKind::Delete => self.deletes += 1,
            OperationKind::Noop => self.local_only += 1,
        }
    }

    /// Number of operations that reach the remote
    pub fn remote_calls(&self) -> usize {
        self.creates + self.updates + self.deletes
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.remote_calls() + self.local_only > 0
    }
}
