//! Schema registry - per resource type field declarations
//!
//! A [`Schema`] lists every field a resource type accepts, which fields are
//! mutually exclusive ([`FieldGroup`]), which are immutable after creation,
//! which the server computes, and which exist only locally.

use crate::error::{Error, Result, SchemaError};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Typed nested sub-configurations, validated by [`crate::specs`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecKind {
    Autoscaling,
    Schedule,
    Notification,
    TransferOptions,
    GcsData,
    PosixData,
}

/// Value shape of a field
#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    String,
    Enum(&'static [&'static str]),
    Integer { min: i64, max: i64 },
    Bool,
    /// String-to-string map merged with provider default labels
    Labels,
    Object(SpecKind),
}

/// How a changed field reaches the remote
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateRoute {
    /// Batched into the single whole-resource patch
    Shared,
    /// Needs its own remote call, one per tag
    Separate(&'static str),
    /// Virtual field: recorded locally, never sent
    LocalOnly,
}

/// Declaration of a single top-level field
#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    pub default: Option<Value>,
    pub required: bool,
    pub immutable: bool,
    /// Server fills the value when the user omits it
    pub computed: bool,
    /// Reported by the server, never accepted from the user
    pub output_only: bool,
    pub update: UpdateRoute,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            kind,
            default: None,
            required: false,
            immutable: false,
            computed: false,
            output_only: false,
            update: UpdateRoute::Shared,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn computed(mut self) -> Self {
        self.computed = true;
        self
    }

    pub fn output_only(mut self) -> Self {
        self.output_only = true;
        self.computed = true;
        self
    }

    pub fn default_value(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }

    pub fn separate_call(mut self, tag: &'static str) -> Self {
        self.update = UpdateRoute::Separate(tag);
        self
    }

    pub fn local_only(mut self) -> Self {
        self.update = UpdateRoute::LocalOnly;
        self
    }

    pub fn is_local_only(&self) -> bool {
        self.update == UpdateRoute::LocalOnly
    }
}

/// A named set of mutually exclusive top-level fields
#[derive(Debug, Clone)]
pub struct FieldGroup {
    pub name: String,
    pub members: Vec<String>,
    /// Exactly one member must be present
    pub required: bool,
    /// Non-member fields whose presence also satisfies `required`
    pub satisfied_by: Vec<String>,
    /// Member injected when the user sets none
    pub implicit_default: Option<(String, Value)>,
}

impl FieldGroup {
    pub fn exclusive(name: impl Into<String>, members: &[&str]) -> Self {
        Self {
            name: name.into(),
            members: members.iter().map(|m| (*m).to_string()).collect(),
            required: false,
            satisfied_by: Vec::new(),
            implicit_default: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn satisfied_by(mut self, fields: &[&str]) -> Self {
        self.satisfied_by = fields.iter().map(|f| (*f).to_string()).collect();
        self
    }

    pub fn implicit_default(mut self, field: impl Into<String>, value: Value) -> Self {
        self.implicit_default = Some((field.into(), value));
        self
    }

    pub fn contains(&self, field: &str) -> bool {
        self.members.iter().any(|m| m == field)
    }
}

/// Whether the user or the remote chooses the resource name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NameAssignment {
    Required,
    ServerAssigned,
}

/// Where the identity of a resource comes from in its config
#[derive(Debug, Clone)]
pub struct IdentityFields {
    pub name_field: String,
    pub scope_field: String,
    pub assignment: NameAssignment,
    /// Regex the name must match, when the user supplies one
    pub name_pattern: Option<&'static str>,
}

/// Full declaration of a resource type
#[derive(Debug, Clone)]
pub struct Schema {
    pub resource_type: String,
    pub fields: Vec<FieldSpec>,
    pub groups: Vec<FieldGroup>,
    pub identity: IdentityFields,
    /// Whether mutating calls answer with long-running operations
    pub long_running: bool,
}

impl Schema {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn group_of(&self, field: &str) -> Option<&FieldGroup> {
        self.groups.iter().find(|g| g.contains(field))
    }

    /// Fields that exist only locally
    pub fn local_only_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_local_only())
    }

    /// Check the declaration is internally consistent.
    pub fn validate(&self) -> std::result::Result<(), SchemaError> {
        let rt = || self.resource_type.clone();
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SchemaError::DuplicateField {
                    resource_type: rt(),
                    field: field.name.clone(),
                });
            }
        }

        for group in &self.groups {
            for member in &group.members {
                let Some(spec) = self.field(member) else {
                    return Err(SchemaError::UndeclaredMember {
                        resource_type: rt(),
                        group: group.name.clone(),
                        field: member.clone(),
                    });
                };
                if spec.default.is_some() {
                    return Err(SchemaError::GroupMemberDefault {
                        resource_type: rt(),
                        group: group.name.clone(),
                        field: member.clone(),
                    });
                }
            }
            for field in &group.satisfied_by {
                if self.field(field).is_none() {
                    return Err(SchemaError::UndeclaredMember {
                        resource_type: rt(),
                        group: group.name.clone(),
                        field: field.clone(),
                    });
                }
            }
            if let Some((field, _)) = &group.implicit_default
                && !group.contains(field)
            {
                return Err(SchemaError::ImplicitDefaultOutsideGroup {
                    resource_type: rt(),
                    group: group.name.clone(),
                    field: field.clone(),
                });
            }
        }

        for field in self.local_only_fields() {
            if field.immutable || self.group_of(&field.name).is_some() {
                return Err(SchemaError::LocalOnlyConstraint {
                    resource_type: rt(),
                    field: field.name.clone(),
                });
            }
        }

        for name in [&self.identity.name_field, &self.identity.scope_field] {
            if self.field(name).is_none() {
                return Err(SchemaError::UndeclaredMember {
                    resource_type: rt(),
                    group: "identity".into(),
                    field: name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Process-wide, read-mostly lookup table of schemas by resource type
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: RwLock<HashMap<String, Arc<Schema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a schema after validating it.
    pub fn register(&self, schema: Schema) -> Result<()> {
        schema.validate()?;
        log::debug!("Registered schema {}", schema.resource_type);
        self.schemas
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(schema.resource_type.clone(), Arc::new(schema));
        Ok(())
    }

    /// Look up the schema for a resource type
    pub fn describe(&self, resource_type: &str) -> Result<Arc<Schema>> {
        self.schemas
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(resource_type)
            .cloned()
            .ok_or_else(|| Error::UnknownResourceType(resource_type.to_string()))
    }

    /// Registered resource types, sorted
    pub fn resource_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .schemas
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        types.sort();
        types
    }
}
