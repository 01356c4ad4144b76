//! Config normalizer - raw desired config to canonical desired state
//!
//! Normalization is pure and deterministic: reject unknown fields, check
//! value shapes, enforce field-group exclusivity on explicit input only,
//! fill defaults, merge provider labels, then canonicalize nested specs.

use crate::error::ValidationError;
use crate::schema::{FieldKind, FieldSpec, NameAssignment, Schema};
use crate::specs;
use crate::types::{CanonicalConfig, LiveState, RawConfig};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{LazyLock, PoisonError, RwLock};

/// Compiled name patterns, keyed by the schema's pattern string
static NAME_PATTERNS: LazyLock<RwLock<HashMap<&'static str, Regex>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

fn name_regex(pattern: &'static str) -> Result<Regex, regex::Error> {
    if let Some(re) = NAME_PATTERNS
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .get(pattern)
    {
        return Ok(re.clone());
    }
    let re = Regex::new(pattern)?;
    NAME_PATTERNS
        .write()
        .unwrap_or_else(PoisonError::into_inner)
        .insert(pattern, re.clone());
    Ok(re)
}

/// Provider-level inputs that fill gaps in a raw config
#[derive(Debug, Clone, Default)]
pub struct NormalizeOptions {
    /// Scope (project) used when the config does not name one
    pub default_scope: Option<String>,
    /// Labels merged under every `Labels` field; user keys win
    pub default_labels: BTreeMap<String, String>,
}

/// Produce the canonical desired state for `raw`.
pub fn normalize(
    schema: &Schema,
    raw: &RawConfig,
    options: &NormalizeOptions,
) -> Result<CanonicalConfig, ValidationError> {
    let mut out = CanonicalConfig::new();

    // Explicit user input only; null means absent
    for (name, value) in raw.iter().filter(|(_, v)| !v.is_null()) {
        let spec = schema
            .field(name)
            .ok_or_else(|| ValidationError::UnknownField {
                resource_type: schema.resource_type.clone(),
                field: name.clone(),
            })?;
        if spec.output_only {
            return Err(ValidationError::invalid(name, "field is output-only"));
        }
        out.insert(name.clone(), check_value(spec, value)?);
    }

    for group in &schema.groups {
        let present: Vec<String> = group
            .members
            .iter()
            .filter(|m| out.contains_key(m.as_str()))
            .cloned()
            .collect();
        if present.len() > 1 {
            return Err(ValidationError::ExclusiveFieldConflict {
                group: group.name.clone(),
                fields: present,
            });
        }
        if present.is_empty() && group.required {
            let satisfied = group
                .satisfied_by
                .iter()
                .any(|f| out.contains_key(f.as_str()));
            if !satisfied {
                match &group.implicit_default {
                    Some((field, value)) => {
                        out.insert(field.clone(), value.clone());
                    }
                    None => {
                        return Err(ValidationError::MissingRequiredField {
                            group: group.name.clone(),
                        });
                    }
                }
            }
        }
    }

    let identity = &schema.identity;
    if !out.contains_key(&identity.scope_field) {
        match &options.default_scope {
            Some(scope) => {
                out.insert(identity.scope_field.clone(), Value::String(scope.clone()));
            }
            None => {
                return Err(ValidationError::MissingField {
                    field: identity.scope_field.clone(),
                });
            }
        }
    }
    match out.get(&identity.name_field).and_then(Value::as_str) {
        Some(name) => {
            if let Some(pattern) = identity.name_pattern {
                let re = name_regex(pattern)
                    .map_err(|e| ValidationError::invalid(&identity.name_field, e.to_string()))?;
                if !re.is_match(name) {
                    return Err(ValidationError::invalid(
                        &identity.name_field,
                        format!("{name:?} does not match {pattern}"),
                    ));
                }
            }
        }
        None if identity.assignment == NameAssignment::Required => {
            return Err(ValidationError::MissingField {
                field: identity.name_field.clone(),
            });
        }
        None => {}
    }

    for spec in &schema.fields {
        if spec.required && !out.contains_key(&spec.name) {
            return Err(ValidationError::MissingField {
                field: spec.name.clone(),
            });
        }
    }

    for spec in &schema.fields {
        if let Some(default) = &spec.default
            && !out.contains_key(&spec.name)
        {
            out.insert(spec.name.clone(), default.clone());
        }
        if spec.kind == FieldKind::Labels && !options.default_labels.is_empty() {
            let mut merged: Map<String, Value> = options
                .default_labels
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect();
            if let Some(Value::Object(user)) = out.get(&spec.name) {
                merged.extend(user.clone());
            }
            out.insert(spec.name.clone(), Value::Object(merged));
        }
    }

    Ok(out)
}

/// Check one explicit value against its declared kind, returning it in
/// canonical form.
fn check_value(spec: &FieldSpec, value: &Value) -> Result<Value, ValidationError> {
    let field = spec.name.as_str();
    match &spec.kind {
        FieldKind::String => match value {
            Value::String(_) => Ok(value.clone()),
            _ => Err(ValidationError::invalid(field, "expected a string")),
        },
        FieldKind::Enum(allowed) => match value.as_str() {
            Some(s) if allowed.contains(&s) => Ok(value.clone()),
            _ => Err(ValidationError::invalid(
                field,
                format!("expected one of {}", allowed.join(", ")),
            )),
        },
        FieldKind::Integer { min, max } => match value.as_i64() {
            Some(n) if (*min..=*max).contains(&n) => Ok(Value::from(n)),
            Some(n) => Err(ValidationError::invalid(
                field,
                format!("{n} is outside {min}..={max}"),
            )),
            None => Err(ValidationError::invalid(field, "expected an integer")),
        },
        // "true"/"false" strings are accepted the way HCL coerces them
        FieldKind::Bool => match value {
            Value::Bool(_) => Ok(value.clone()),
            Value::String(s) if s == "true" => Ok(Value::Bool(true)),
            Value::String(s) if s == "false" => Ok(Value::Bool(false)),
            _ => Err(ValidationError::invalid(field, "expected a boolean")),
        },
        FieldKind::Labels => match value {
            Value::Object(map) if map.values().all(Value::is_string) => Ok(value.clone()),
            _ => Err(ValidationError::invalid(field, "expected a map of strings")),
        },
        FieldKind::Object(kind) => specs::canonicalize(*kind, field, value),
    }
}

/// Rebuild a raw config from live state, as an import would see it.
///
/// Output-only fields are dropped. Within each field group, server-computed
/// members are dropped when a user-settable member is present; otherwise
/// only the first present member (declaration order) is kept.
pub fn derive_config(schema: &Schema, live: &LiveState) -> RawConfig {
    let mut raw: RawConfig = live
        .attributes
        .iter()
        .filter(|(name, value)| {
            !value.is_null() && schema.field(name).is_some_and(|f| !f.output_only)
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    for group in &schema.groups {
        let present: Vec<&String> = group
            .members
            .iter()
            .filter(|m| raw.contains_key(m.as_str()))
            .collect();
        if present.len() <= 1 {
            continue;
        }
        let settable: Vec<&String> = present
            .iter()
            .copied()
            .filter(|m| schema.field(m).is_some_and(|f| !f.computed))
            .collect();
        let keep: Vec<&String> = if settable.is_empty() {
            vec![present[0]]
        } else {
            settable
        };
        for member in present {
            if !keep.contains(&member) {
                raw.remove(member.as_str());
            }
        }
    }

    raw
}
