//! Typed nested sub-configurations
//!
//! Object-valued fields are parsed into these types, checked for semantic
//! rules (unit consistency, schedule ordering, nested exclusivity) and
//! written back in canonical form.

use crate::error::ValidationError;
use crate::schema::SpecKind;
use chrono::NaiveDate;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::LazyLock;

// ============================================================================
// Autoscaling
// ============================================================================

/// Unit compute limits are expressed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitUnit {
    Nodes,
    ProcessingUnits,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nodes: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_processing_units: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_processing_units: Option<u32>,
}

impl ScalingLimits {
    /// Determine the single unit these limits use and check min <= max.
    pub fn unit(&self, field: &str) -> Result<LimitUnit, ValidationError> {
        let nodes = (self.min_nodes, self.max_nodes);
        let units = (self.min_processing_units, self.max_processing_units);
        let any_nodes = nodes.0.is_some() || nodes.1.is_some();
        let any_units = units.0.is_some() || units.1.is_some();

        let (unit, min, max) = match (any_nodes, any_units) {
            (true, true) => {
                return Err(ValidationError::UnitMismatch {
                    field: field.to_string(),
                    detail: "limits mix nodes and processing units".into(),
                });
            }
            (false, false) => {
                return Err(ValidationError::invalid(field, "min and max limits are required"));
            }
            (true, false) => (LimitUnit::Nodes, nodes.0, nodes.1),
            (false, true) => (LimitUnit::ProcessingUnits, units.0, units.1),
        };

        let (Some(min), Some(max)) = (min, max) else {
            return Err(ValidationError::invalid(
                field,
                "both min and max must be set in the same unit",
            ));
        };
        if min > max {
            return Err(ValidationError::invalid(
                field,
                format!("min ({min}) is greater than max ({max})"),
            ));
        }
        Ok(unit)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScalingTargets {
    pub high_priority_cpu_utilization_percent: u32,
    pub storage_utilization_percent: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicaSelection {
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OverrideLimits {
    pub autoscaling_limits: ScalingLimits,
}

/// Per-replica exception to the uniform limits
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AsymmetricOverride {
    pub replica_selection: ReplicaSelection,
    pub overrides: OverrideLimits,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoscalingSpec {
    pub autoscaling_limits: ScalingLimits,
    pub autoscaling_targets: ScalingTargets,
    /// Order is significant
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub asymmetric_autoscaling_options: Vec<AsymmetricOverride>,
}

impl AutoscalingSpec {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        let unit = self.autoscaling_limits.unit(&format!("{field}.autoscaling_limits"))?;

        let targets = &self.autoscaling_targets;
        if !(10..=90).contains(&targets.high_priority_cpu_utilization_percent) {
            return Err(ValidationError::invalid(
                format!("{field}.autoscaling_targets.high_priority_cpu_utilization_percent"),
                "must be between 10 and 90",
            ));
        }
        if !(10..=99).contains(&targets.storage_utilization_percent) {
            return Err(ValidationError::invalid(
                format!("{field}.autoscaling_targets.storage_utilization_percent"),
                "must be between 10 and 99",
            ));
        }

        let mut locations = HashSet::new();
        for (i, option) in self.asymmetric_autoscaling_options.iter().enumerate() {
            let path = format!("{field}.asymmetric_autoscaling_options[{i}]");
            let location = &option.replica_selection.location;
            if location.is_empty() {
                return Err(ValidationError::invalid(
                    format!("{path}.replica_selection.location"),
                    "must not be empty",
                ));
            }
            if !locations.insert(location.as_str()) {
                return Err(ValidationError::invalid(
                    path,
                    format!("duplicate override for location {location}"),
                ));
            }
            let override_unit = option
                .overrides
                .autoscaling_limits
                .unit(&format!("{path}.overrides.autoscaling_limits"))?;
            if override_unit != unit {
                return Err(ValidationError::UnitMismatch {
                    field: path,
                    detail: format!(
                        "override uses {override_unit:?} but instance limits use {unit:?}"
                    ),
                });
            }
        }
        Ok(())
    }
}

// ============================================================================
// Schedule
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Date {
    pub year: i32,
    pub month: u32,
    pub day: u32,
}

impl Date {
    pub fn to_naive(self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeOfDay {
    pub hours: u32,
    pub minutes: u32,
    #[serde(default)]
    pub seconds: u32,
    #[serde(default)]
    pub nanos: u32,
}

static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)(?:\.(\d{1,9}))?s$").expect("valid duration regex"));

/// Run window and recurrence of a transfer job.
///
/// No end date means the job runs once; no repeat interval means no
/// recurrence. Either may be omitted independently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScheduleSpec {
    pub schedule_start_date: Date,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_end_date: Option<Date>,
    pub start_time_of_day: TimeOfDay,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
}

impl ScheduleSpec {
    fn validate(&mut self) -> Result<(), ValidationError> {
        let start = self.schedule_start_date.to_naive().ok_or_else(|| {
            ValidationError::InvalidSchedule {
                reason: format!("start date {:?} does not exist", self.schedule_start_date),
            }
        })?;

        if let Some(end) = self.schedule_end_date {
            let end = end.to_naive().ok_or_else(|| ValidationError::InvalidSchedule {
                reason: format!("end date {end:?} does not exist"),
            })?;
            if end < start {
                return Err(ValidationError::InvalidSchedule {
                    reason: format!("end date {end} is before start date {start}"),
                });
            }
        }

        let t = self.start_time_of_day;
        if t.hours > 23 || t.minutes > 59 || t.seconds > 59 || t.nanos > 999_999_999 {
            return Err(ValidationError::InvalidSchedule {
                reason: format!(
                    "start time {:02}:{:02}:{:02}.{} is out of range",
                    t.hours, t.minutes, t.seconds, t.nanos
                ),
            });
        }

        if let Some(interval) = &self.repeat_interval {
            self.repeat_interval = Some(canonical_duration(interval)?);
        }
        Ok(())
    }
}

/// Canonicalize a `"<seconds>[.<frac>]s"` duration, rejecting zero.
fn canonical_duration(raw: &str) -> Result<String, ValidationError> {
    let caps = DURATION_RE
        .captures(raw.trim())
        .ok_or_else(|| ValidationError::InvalidSchedule {
            reason: format!("repeat interval {raw:?} is not a duration like \"86400s\""),
        })?;
    let secs = caps[1].trim_start_matches('0');
    let frac = caps.get(2).map_or("", |m| m.as_str()).trim_end_matches('0');
    if secs.is_empty() && frac.is_empty() {
        return Err(ValidationError::InvalidSchedule {
            reason: "repeat interval must be positive".into(),
        });
    }
    let secs = if secs.is_empty() { "0" } else { secs };
    Ok(if frac.is_empty() {
        format!("{secs}s")
    } else {
        format!("{secs}.{frac}s")
    })
}

// ============================================================================
// Notification
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    TransferOperationSuccess,
    TransferOperationFailed,
    TransferOperationAborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PayloadFormat {
    None,
    Json,
}

static TOPIC_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^projects/[^/]+/topics/[^/]+$").expect("valid topic regex"));

/// Pub/Sub notifications for a transfer job.
///
/// Omitting `event_types` means all event types. The set is stored sorted,
/// so listing the same types in another order is not a change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotificationSpec {
    pub pubsub_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_types: Option<BTreeSet<EventType>>,
    pub payload_format: PayloadFormat,
}

impl NotificationSpec {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if !TOPIC_RE.is_match(&self.pubsub_topic) {
            return Err(ValidationError::invalid(
                format!("{field}.pubsub_topic"),
                "expected projects/{project}/topics/{topic}",
            ));
        }
        if self.event_types.as_ref().is_some_and(BTreeSet::is_empty) {
            return Err(ValidationError::invalid(
                format!("{field}.event_types"),
                "must not be empty when present",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Transfer options and endpoints
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OverwriteWhen {
    Different,
    Never,
    Always,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferOptions {
    #[serde(default)]
    pub overwrite_objects_already_existing_in_sink: bool,
    #[serde(default)]
    pub delete_objects_unique_in_sink: bool,
    #[serde(default)]
    pub delete_objects_from_source_after_transfer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite_when: Option<OverwriteWhen>,
}

impl TransferOptions {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if self.delete_objects_unique_in_sink && self.delete_objects_from_source_after_transfer {
            return Err(ValidationError::ExclusiveFieldConflict {
                group: format!("{field}.deletion"),
                fields: vec![
                    "delete_objects_unique_in_sink".into(),
                    "delete_objects_from_source_after_transfer".into(),
                ],
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GcsData {
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl GcsData {
    fn validate(&mut self, field: &str) -> Result<(), ValidationError> {
        if self.bucket_name.is_empty() {
            return Err(ValidationError::invalid(
                format!("{field}.bucket_name"),
                "must not be empty",
            ));
        }
        if self.path.as_deref() == Some("") {
            self.path = None;
        }
        if let Some(path) = &self.path
            && (path.starts_with('/') || !path.ends_with('/'))
        {
            return Err(ValidationError::invalid(
                format!("{field}.path"),
                "must be relative and end with '/'",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PosixData {
    pub root_directory: String,
}

impl PosixData {
    fn validate(&self, field: &str) -> Result<(), ValidationError> {
        if !self.root_directory.starts_with('/') {
            return Err(ValidationError::invalid(
                format!("{field}.root_directory"),
                "must be an absolute path",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Dispatch
// ============================================================================

fn parse<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, ValidationError> {
    T::deserialize(value).map_err(|e| ValidationError::invalid(field, e.to_string()))
}

fn to_value<T: Serialize>(field: &str, spec: &T) -> Result<Value, ValidationError> {
    serde_json::to_value(spec).map_err(|e| ValidationError::invalid(field, e.to_string()))
}

/// Parse, validate and re-serialize a nested value in canonical form.
pub fn canonicalize(kind: SpecKind, field: &str, value: &Value) -> Result<Value, ValidationError> {
    match kind {
        SpecKind::Autoscaling => {
            let spec: AutoscalingSpec = parse(field, value)?;
            spec.validate(field)?;
            to_value(field, &spec)
        }
        SpecKind::Schedule => {
            let mut spec: ScheduleSpec = parse(field, value)?;
            spec.validate()?;
            to_value(field, &spec)
        }
        SpecKind::Notification => {
            let spec: NotificationSpec = parse(field, value)?;
            spec.validate(field)?;
            to_value(field, &spec)
        }
        SpecKind::TransferOptions => {
            let spec: TransferOptions = parse(field, value)?;
            spec.validate(field)?;
            to_value(field, &spec)
        }
        SpecKind::GcsData => {
            let mut spec: GcsData = parse(field, value)?;
            spec.validate(field)?;
            to_value(field, &spec)
        }
        SpecKind::PosixData => {
            let spec: PosixData = parse(field, value)?;
            spec.validate(field)?;
            to_value(field, &spec)
        }
    }
}
