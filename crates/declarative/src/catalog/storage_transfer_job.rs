//! `storage_transfer_job` - a scheduled copy between buckets or filesystems
//!
//! The job name is assigned by the service. Source and sink are each one of
//! a Cloud Storage bucket or a POSIX filesystem.

use crate::schema::{
    FieldGroup, FieldKind, FieldSpec, IdentityFields, NameAssignment, Schema, SpecKind,
};
use crate::transport::memory::TypeBehavior;
use crate::types::CanonicalConfig;
use serde_json::{Value, json};

pub const RESOURCE_TYPE: &str = "storage_transfer_job";

pub fn schema() -> Schema {
    Schema {
        resource_type: RESOURCE_TYPE.into(),
        fields: vec![
            FieldSpec::new("name", FieldKind::String).immutable().computed(),
            FieldSpec::new("project", FieldKind::String).immutable(),
            FieldSpec::new("description", FieldKind::String).required(),
            FieldSpec::new("status", FieldKind::Enum(&["ENABLED", "DISABLED", "DELETED"]))
                .default_value(json!("ENABLED")),
            FieldSpec::new("gcs_data_source", FieldKind::Object(SpecKind::GcsData)),
            FieldSpec::new("posix_data_source", FieldKind::Object(SpecKind::PosixData)),
            FieldSpec::new("gcs_data_sink", FieldKind::Object(SpecKind::GcsData)),
            FieldSpec::new("posix_data_sink", FieldKind::Object(SpecKind::PosixData)),
            FieldSpec::new("transfer_options", FieldKind::Object(SpecKind::TransferOptions)),
            FieldSpec::new("schedule", FieldKind::Object(SpecKind::Schedule)),
            FieldSpec::new("notification_config", FieldKind::Object(SpecKind::Notification)),
            FieldSpec::new("creation_time", FieldKind::String).output_only(),
            FieldSpec::new("last_modification_time", FieldKind::String).output_only(),
        ],
        groups: vec![
            FieldGroup::exclusive("source", &["gcs_data_source", "posix_data_source"]).required(),
            FieldGroup::exclusive("sink", &["gcs_data_sink", "posix_data_sink"]).required(),
        ],
        identity: IdentityFields {
            name_field: "name".into(),
            scope_field: "project".into(),
            assignment: NameAssignment::ServerAssigned,
            name_pattern: Some("^transferJobs/[A-Za-z0-9_.~-]+$"),
        },
        long_running: false,
    }
}

pub fn behavior() -> TypeBehavior {
    TypeBehavior {
        name_field: "name",
        generate_name: Some(|n| format!("transferJobs/{n}")),
        on_write: Some(on_write),
        synchronous: true,
    }
}

fn on_write(attributes: &mut CanonicalConfig, _written: &[String]) {
    let now = Value::String(chrono::Utc::now().to_rfc3339());
    attributes
        .entry("creation_time".to_string())
        .or_insert_with(|| now.clone());
    attributes.insert("last_modification_time".into(), now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use crate::error::ValidationError;
    use crate::normalize::{NormalizeOptions, normalize};
    use crate::types::{LiveState, RawConfig, ResourceIdentity, fingerprint};

    fn opts() -> NormalizeOptions {
        NormalizeOptions {
            default_scope: Some("my-project".into()),
            ..Default::default()
        }
    }

    fn job(extra: Value) -> RawConfig {
        let mut config = json!({
            "description": "nightly copy",
            "gcs_data_source": {"bucket_name": "src", "path": "foo/bar/"},
            "gcs_data_sink": {"bucket_name": "dst", "path": "foo/bar/"},
        })
        .as_object()
        .cloned()
        .unwrap();
        config.extend(extra.as_object().cloned().unwrap());
        config
    }

    fn schedule(end: Option<Value>, repeat: Option<&str>) -> Value {
        let mut s = json!({
            "schedule_start_date": {"year": 2018, "month": 10, "day": 1},
            "start_time_of_day": {"hours": 0, "minutes": 30, "seconds": 0, "nanos": 0},
        });
        if let Some(end) = end {
            s["schedule_end_date"] = end;
        }
        if let Some(repeat) = repeat {
            s["repeat_interval"] = json!(repeat);
        }
        s
    }

    #[test]
    fn test_minimal_job() {
        let desired = normalize(&schema(), &job(json!({})), &opts()).unwrap();
        assert_eq!(desired["status"], json!("ENABLED"));
        assert!(!desired.contains_key("name"));
    }

    #[test]
    fn test_two_sources_conflict() {
        let err = normalize(
            &schema(),
            &job(json!({"posix_data_source": {"root_directory": "/data"}})),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ExclusiveFieldConflict { group, .. } if group == "source"));
    }

    #[test]
    fn test_schedule_variants() {
        let end = json!({"year": 2019, "month": 10, "day": 1});
        for s in [
            schedule(Some(end.clone()), Some("604800s")),
            schedule(None, Some("604800s")),
            schedule(Some(end), None),
            schedule(None, None),
        ] {
            normalize(&schema(), &job(json!({"schedule": s})), &opts()).unwrap();
        }

        let backwards = schedule(Some(json!({"year": 2017, "month": 1, "day": 1})), None);
        let err = normalize(&schema(), &job(json!({"schedule": backwards})), &opts()).unwrap_err();
        assert!(matches!(err, ValidationError::InvalidSchedule { .. }));
    }

    #[test]
    fn test_event_type_order_is_not_a_change() {
        let notification = |types: Value| {
            json!({"notification_config": {
                "pubsub_topic": "projects/my-project/topics/jobs",
                "event_types": types,
                "payload_format": "JSON",
            }})
        };
        let a = normalize(
            &schema(),
            &job(notification(json!(["TRANSFER_OPERATION_FAILED", "TRANSFER_OPERATION_SUCCESS"]))),
            &opts(),
        )
        .unwrap();
        let b = normalize(
            &schema(),
            &job(notification(json!(["TRANSFER_OPERATION_SUCCESS", "TRANSFER_OPERATION_FAILED"]))),
            &opts(),
        )
        .unwrap();

        let live = LiveState {
            identity: ResourceIdentity::new(RESOURCE_TYPE, "my-project", "transferJobs/1"),
            fingerprint: fingerprint(&a),
            attributes: a,
            observed_at: chrono::Utc::now(),
        };
        assert!(diff(&schema(), &b, Some(&live)).unwrap().is_empty());
    }

    #[test]
    fn test_delete_flags_conflict() {
        let err = normalize(
            &schema(),
            &job(json!({"transfer_options": {
                "delete_objects_unique_in_sink": true,
                "delete_objects_from_source_after_transfer": true,
            }})),
            &opts(),
        )
        .unwrap_err();
        assert!(matches!(err, ValidationError::ExclusiveFieldConflict { .. }));
    }

    #[test]
    fn test_transfer_options_steps_apply() {
        use crate::context::CallContext;
        use crate::executor::Executor;
        use crate::reconciler::Reconciler;
        use crate::store::StateStore;
        use crate::transport::memory::MemoryTransport;
        use std::sync::Arc;

        let transport = Arc::new(crate::catalog::emulate(MemoryTransport::new().with_polls(0)));
        let reconciler = Reconciler::new(
            Arc::new(crate::catalog::registry().unwrap()),
            Executor::new(transport),
            Arc::new(StateStore::new()),
        )
        .with_options(opts());
        let ctx = CallContext::new();

        let (id, _) = reconciler.create(&schema(), &job(json!({})), &ctx).unwrap();
        for (overwrite, unique_in_sink, from_source, when) in [
            (false, false, false, "ALWAYS"),
            (true, true, false, "NEVER"),
            (true, false, true, "DIFFERENT"),
        ] {
            let options = json!({"transfer_options": {
                "overwrite_objects_already_existing_in_sink": overwrite,
                "delete_objects_unique_in_sink": unique_in_sink,
                "delete_objects_from_source_after_transfer": from_source,
                "overwrite_when": when,
            }});
            normalize(&schema(), &job(options.clone()), &opts()).unwrap();

            let live = reconciler.update(&id, &job(options), &ctx).unwrap();
            assert_eq!(live.attributes["transfer_options"]["overwrite_when"], json!(when));
            assert_eq!(
                live.attributes["transfer_options"]["delete_objects_unique_in_sink"],
                json!(unique_in_sink)
            );
        }
    }

    #[test]
    fn test_server_stamps_times() {
        let mut attrs = CanonicalConfig::new();
        on_write(&mut attrs, &[]);
        let created = attrs["creation_time"].clone();
        on_write(&mut attrs, &["description".into()]);
        assert_eq!(attrs["creation_time"], created);
        assert!(attrs.contains_key("last_modification_time"));
    }
}
