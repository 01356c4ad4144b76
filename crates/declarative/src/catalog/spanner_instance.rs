//! `spanner_instance` - a database instance with fixed or autoscaled compute

use crate::schema::{
    FieldGroup, FieldKind, FieldSpec, IdentityFields, NameAssignment, Schema, SpecKind,
};
use crate::transport::memory::TypeBehavior;
use crate::types::CanonicalConfig;
use serde_json::{Value, json};

pub const RESOURCE_TYPE: &str = "spanner_instance";

/// Compute capacity is set one way only
pub const COMPUTE_GROUP: &str = "compute";

pub fn schema() -> Schema {
    Schema {
        resource_type: RESOURCE_TYPE.into(),
        fields: vec![
            FieldSpec::new("name", FieldKind::String).immutable().computed(),
            FieldSpec::new("project", FieldKind::String).immutable(),
            FieldSpec::new("config", FieldKind::String).required().immutable(),
            FieldSpec::new("display_name", FieldKind::String).required(),
            FieldSpec::new("processing_units", FieldKind::Integer { min: 100, max: 1_000_000 })
                .computed(),
            FieldSpec::new("num_nodes", FieldKind::Integer { min: 1, max: 1_000 }).computed(),
            FieldSpec::new("autoscaling_config", FieldKind::Object(SpecKind::Autoscaling)),
            FieldSpec::new("instance_type", FieldKind::Enum(&["PROVISIONED", "FREE_INSTANCE"]))
                .computed(),
            FieldSpec::new(
                "edition",
                FieldKind::Enum(&["STANDARD", "ENTERPRISE", "ENTERPRISE_PLUS"]),
            )
            .computed()
            .separate_call("edition"),
            FieldSpec::new(
                "default_backup_schedule_type",
                FieldKind::Enum(&["NONE", "AUTOMATIC"]),
            )
            .computed(),
            FieldSpec::new("labels", FieldKind::Labels),
            FieldSpec::new("force_destroy", FieldKind::Bool)
                .default_value(json!(false))
                .local_only(),
            FieldSpec::new("state", FieldKind::String).output_only(),
        ],
        groups: vec![
            FieldGroup::exclusive(
                COMPUTE_GROUP,
                &["processing_units", "num_nodes", "autoscaling_config"],
            )
            .required()
            .satisfied_by(&["instance_type"]),
        ],
        identity: IdentityFields {
            name_field: "name".into(),
            scope_field: "project".into(),
            assignment: NameAssignment::ServerAssigned,
            name_pattern: Some("^[a-z][-a-z0-9]*[a-z0-9]$"),
        },
        long_running: true,
    }
}

pub fn behavior() -> TypeBehavior {
    TypeBehavior {
        name_field: "name",
        generate_name: Some(|n| format!("instance-{n:06}")),
        on_write: Some(on_write),
        synchronous: false,
    }
}

fn set_nodes(attributes: &mut CanonicalConfig, nodes: u64) {
    attributes.insert("num_nodes".into(), json!(nodes));
    attributes.insert("processing_units".into(), json!(nodes * 1000));
}

fn set_processing_units(attributes: &mut CanonicalConfig, units: u64) {
    attributes.insert("processing_units".into(), json!(units));
    if units % 1000 == 0 {
        attributes.insert("num_nodes".into(), json!(units / 1000));
    } else {
        attributes.remove("num_nodes");
    }
}

/// Converge compute fields the way the service reports them: an autoscaled
/// instance runs at its minimum, and nodes and processing units mirror each
/// other.
fn on_write(attributes: &mut CanonicalConfig, written: &[String]) {
    let wrote = |field: &str| written.iter().any(|w| w == field);
    let limits = attributes
        .get("autoscaling_config")
        .and_then(|a| a.get("autoscaling_limits"))
        .cloned();

    if let Some(limits) = limits {
        if let Some(nodes) = limits.get("min_nodes").and_then(Value::as_u64) {
            set_nodes(attributes, nodes);
        } else if let Some(units) = limits.get("min_processing_units").and_then(Value::as_u64) {
            set_processing_units(attributes, units);
        }
    } else if wrote("num_nodes") {
        if let Some(nodes) = attributes.get("num_nodes").and_then(Value::as_u64) {
            set_nodes(attributes, nodes);
        }
    } else if wrote("processing_units")
        && let Some(units) = attributes.get("processing_units").and_then(Value::as_u64)
    {
        set_processing_units(attributes, units);
    }

    let has_compute = attributes.contains_key("processing_units");
    attributes
        .entry("instance_type".to_string())
        .or_insert_with(|| json!(if has_compute { "PROVISIONED" } else { "FREE_INSTANCE" }));
    attributes
        .entry("edition".to_string())
        .or_insert_with(|| json!("STANDARD"));
    attributes
        .entry("default_backup_schedule_type".to_string())
        .or_insert_with(|| json!("AUTOMATIC"));
    attributes.insert("state".into(), json!("READY"));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::normalize::{NormalizeOptions, normalize};

    fn opts() -> NormalizeOptions {
        NormalizeOptions {
            default_scope: Some("my-project".into()),
            ..Default::default()
        }
    }

    fn raw(value: Value) -> crate::types::RawConfig {
        value.as_object().cloned().unwrap()
    }

    fn base(extra: Value) -> crate::types::RawConfig {
        let mut config = raw(json!({
            "name": "my-instance",
            "config": "regional-us-central1",
            "display_name": "My Instance",
        }));
        config.extend(raw(extra));
        config
    }

    #[test]
    fn test_compute_required() {
        let err = normalize(&schema(), &base(json!({})), &opts()).unwrap_err();
        assert_eq!(
            err,
            ValidationError::MissingRequiredField {
                group: COMPUTE_GROUP.into()
            }
        );
    }

    #[test]
    fn test_free_instance_needs_no_compute() {
        let desired = normalize(
            &schema(),
            &base(json!({"instance_type": "FREE_INSTANCE"})),
            &opts(),
        )
        .unwrap();
        assert!(!desired.contains_key("num_nodes"));
        assert_eq!(desired["force_destroy"], json!(false));
        assert_eq!(desired["project"], json!("my-project"));
    }

    #[test]
    fn test_nodes_and_units_conflict() {
        let err = normalize(
            &schema(),
            &base(json!({"num_nodes": 1, "processing_units": 1000})),
            &opts(),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ValidationError::ExclusiveFieldConflict {
                group: COMPUTE_GROUP.into(),
                fields: vec!["processing_units".into(), "num_nodes".into()],
            }
        );
    }

    #[test]
    fn test_override_unit_mismatch() {
        let err = normalize(
            &schema(),
            &base(json!({"autoscaling_config": {
                "autoscaling_limits": {"min_nodes": 1, "max_nodes": 2},
                "autoscaling_targets": {
                    "high_priority_cpu_utilization_percent": 65,
                    "storage_utilization_percent": 95
                },
                "asymmetric_autoscaling_options": [{
                    "replica_selection": {"location": "us-central1"},
                    "overrides": {"autoscaling_limits": {
                        "min_processing_units": 1000, "max_processing_units": 2000
                    }}
                }]
            }})),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::UnitMismatch { .. }));
    }

    #[test]
    fn test_name_pattern() {
        let err = normalize(
            &schema(),
            &base(json!({"name": "Bad_Name", "num_nodes": 1})),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidFieldValue { field, .. } if field == "name"));
    }

    #[test]
    fn test_force_destroy_string() {
        let desired = normalize(
            &schema(),
            &base(json!({"num_nodes": 1, "force_destroy": "true"})),
            &opts(),
        )
        .unwrap();
        assert_eq!(desired["force_destroy"], json!(true));
    }

    #[test]
    fn test_server_mirrors_compute() {
        let mut attrs: CanonicalConfig = [("processing_units".to_string(), json!(2000))]
            .into_iter()
            .collect();
        on_write(&mut attrs, &["processing_units".into()]);
        assert_eq!(attrs["num_nodes"], json!(2));
        assert_eq!(attrs["instance_type"], json!("PROVISIONED"));

        attrs.insert("processing_units".into(), json!(300));
        on_write(&mut attrs, &["processing_units".into()]);
        assert!(!attrs.contains_key("num_nodes"));
        assert_eq!(attrs["state"], json!("READY"));
    }
}
