//! Reconciler - normalize, diff, execute and record, per resource instance
//!
//! Each mutating entry point holds the identity's lock from the moment it
//! reads recorded state until the new state is recorded, so two callers
//! never interleave writes to the same resource. Different identities
//! proceed in parallel.

use crate::context::{CallContext, Deadline};
use crate::diff::{FieldChange, delete_operation, diff, field_changes};
use crate::error::{Error, Result, ValidationError};
use crate::executor::{Executor, Outcome, Target};
use crate::normalize::{NormalizeOptions, normalize};
use crate::schema::{Schema, SchemaRegistry};
use crate::store::StateStore;
use crate::types::{
    CanonicalConfig, ChangeOperation, CreateTarget, LiveState, OperationKind, Phase, PhaseEvent,
    RawConfig, ResourceIdentity,
};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Operations that would bring one resource to its desired state
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub target: CreateTarget,
    pub desired: CanonicalConfig,
    /// Recorded state the plan was computed against
    pub live: Option<LiveState>,
    pub operations: Vec<ChangeOperation>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Result of [`Reconciler::apply`]
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub identity: ResourceIdentity,
    pub live: LiveState,
    pub operations: Vec<ChangeOperation>,
}

/// Drives resources through their lifecycle
#[derive(Debug)]
pub struct Reconciler {
    registry: Arc<SchemaRegistry>,
    executor: Executor,
    store: Arc<StateStore>,
    options: NormalizeOptions,
    phases: Mutex<HashMap<ResourceIdentity, Phase>>,
}

impl Reconciler {
    pub fn new(registry: Arc<SchemaRegistry>, executor: Executor, store: Arc<StateStore>) -> Self {
        Self {
            registry,
            executor,
            store,
            options: NormalizeOptions::default(),
            phases: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: NormalizeOptions) -> Self {
        self.options = options;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Normalize a raw config for `schema` with this reconciler's defaults
    pub fn normalize(&self, schema: &Schema, raw: &RawConfig) -> Result<CanonicalConfig> {
        Ok(normalize(schema, raw, &self.options)?)
    }

    /// Compute the operations `apply` would run, without running them
    pub fn plan(&self, schema: &Schema, raw: &RawConfig) -> Result<Plan> {
        self.plan_desired(schema, raw, None)
    }

    /// Like [`Reconciler::plan`], but a config without a name resolves
    /// through `address` to the resource an earlier [`Reconciler::apply_at`]
    /// created for it.
    pub fn plan_at(&self, address: &str, schema: &Schema, raw: &RawConfig) -> Result<Plan> {
        self.plan_desired(schema, raw, Some(address))
    }

    fn plan_desired(&self, schema: &Schema, raw: &RawConfig, address: Option<&str>) -> Result<Plan> {
        let (desired, target) = self.desired_target(schema, raw, address)?;
        let live = target.identity().and_then(|id| self.store.get(&id));
        let operations = diff(schema, &desired, live.as_ref())?;
        Ok(Plan {
            target,
            desired,
            live,
            operations,
        })
    }

    /// Create a resource that must not exist yet
    pub fn create(
        &self,
        schema: &Schema,
        raw: &RawConfig,
        ctx: &CallContext,
    ) -> Result<(ResourceIdentity, LiveState)> {
        let desired = self.normalize(schema, raw)?;
        let target = create_target(schema, &desired)?;
        let deadline = Deadline::start(ctx, self.executor.clock());

        let live = match target.identity() {
            Some(identity) => {
                let _guard = self.store.lock(&identity);
                if self.store.contains(&identity) {
                    return Err(Error::AlreadyExists(identity.to_string()));
                }
                self.create_locked(schema, &target, &desired, &deadline)?
            }
            // Name comes back from the remote; nothing to contend on yet
            None => self.create_locked(schema, &target, &desired, &deadline)?,
        };
        Ok((live.identity.clone(), live))
    }

    /// Refresh recorded state from the remote
    pub fn read(&self, identity: &ResourceIdentity, ctx: &CallContext) -> Result<LiveState> {
        let schema = self.registry.describe(&identity.resource_type)?;
        let _guard = self.store.lock(identity);
        let deadline = Deadline::start(ctx, self.executor.clock());
        let prior = self.store.get(identity);

        match self.executor.fetch_within(identity, &deadline) {
            Ok(mut live) => {
                let source = prior.map(|p| p.attributes).unwrap_or_default();
                overlay_local(&schema, &mut live, &source);
                self.store.put(live.clone())?;
                self.observe(identity, true);
                Ok(live)
            }
            Err(Error::NotFound(id)) => {
                if self.store.remove(identity)?.is_some() {
                    log::warn!("{identity} no longer exists remotely");
                }
                self.observe(identity, false);
                Err(Error::NotFound(id))
            }
            Err(e) => Err(e),
        }
    }

    /// Bring an existing resource to the desired config
    pub fn update(&self, identity: &ResourceIdentity, raw: &RawConfig, ctx: &CallContext) -> Result<LiveState> {
        let schema = self.registry.describe(&identity.resource_type)?;
        let desired = self.normalize(&schema, &with_identity(&schema, identity, raw))?;
        let deadline = Deadline::start(ctx, self.executor.clock());

        let _guard = self.store.lock(identity);
        let live = self
            .store
            .get(identity)
            .ok_or_else(|| Error::NotFound(identity.clone()))?;
        self.update_locked(&schema, live, &desired, &deadline)
            .map(|(live, _)| live)
    }

    /// Delete a resource. Deleting one that is already gone succeeds.
    pub fn delete(&self, identity: &ResourceIdentity, ctx: &CallContext) -> Result<()> {
        let schema = self.registry.describe(&identity.resource_type)?;
        let _guard = self.store.lock(identity);
        let deadline = Deadline::start(ctx, self.executor.clock());
        let live = self.store.get(identity);
        let op = delete_operation(&schema);

        let target = match &live {
            Some(live) => {
                self.begin(identity, OperationKind::Delete)?;
                Target::Existing(live)
            }
            None => Target::Known(identity),
        };

        match self.executor.run(target, &op, &deadline) {
            Ok(_) => {
                self.store.remove(identity)?;
                self.set_phase(identity, Phase::Absent);
                Ok(())
            }
            Err(e) => {
                if live.is_some() {
                    self.finish(identity, PhaseEvent::Failed);
                }
                Err(e)
            }
        }
    }

    /// Start managing a resource that already exists remotely
    pub fn import(&self, identity: &ResourceIdentity, ctx: &CallContext) -> Result<LiveState> {
        let schema = self.registry.describe(&identity.resource_type)?;
        let _guard = self.store.lock(identity);
        if self.store.contains(identity) {
            return Err(Error::AlreadyExists(identity.to_string()));
        }
        let deadline = Deadline::start(ctx, self.executor.clock());

        let mut live = self.executor.fetch_within(identity, &deadline)?;
        overlay_local(&schema, &mut live, &CanonicalConfig::new());
        self.store.put(live.clone())?;
        self.observe(identity, true);
        log::info!("Imported {identity}");
        Ok(live)
    }

    /// Create the resource if it is not recorded, otherwise update it
    pub fn apply(&self, schema: &Schema, raw: &RawConfig, ctx: &CallContext) -> Result<Applied> {
        self.apply_desired(schema, raw, None, ctx)
    }

    /// Apply a config known to the caller by `address`.
    ///
    /// A config without a name updates the resource bound to `address`
    /// when there is one. Otherwise the remote assigns a name on create and
    /// the new identity is bound to `address`, so the next apply converges
    /// instead of creating again.
    pub fn apply_at(
        &self,
        address: &str,
        schema: &Schema,
        raw: &RawConfig,
        ctx: &CallContext,
    ) -> Result<Applied> {
        self.apply_desired(schema, raw, Some(address), ctx)
    }

    fn apply_desired(
        &self,
        schema: &Schema,
        raw: &RawConfig,
        address: Option<&str>,
        ctx: &CallContext,
    ) -> Result<Applied> {
        let (desired, target) = self.desired_target(schema, raw, address)?;
        let deadline = Deadline::start(ctx, self.executor.clock());

        let Some(identity) = target.identity() else {
            let operations = diff(schema, &desired, None)?;
            let live = self.create_locked(schema, &target, &desired, &deadline)?;
            if let Some(address) = address {
                self.store.bind(address, &live.identity)?;
            }
            return Ok(Applied {
                identity: live.identity.clone(),
                live,
                operations,
            });
        };

        let _guard = self.store.lock(&identity);
        match self.store.get(&identity) {
            Some(live) => {
                let (live, operations) = self.update_locked(schema, live, &desired, &deadline)?;
                Ok(Applied {
                    identity,
                    live,
                    operations,
                })
            }
            None => {
                let operations = diff(schema, &desired, None)?;
                let live = self.create_locked(schema, &target, &desired, &deadline)?;
                if let Some(address) = address {
                    self.store.bind(address, &identity)?;
                }
                Ok(Applied {
                    identity,
                    live,
                    operations,
                })
            }
        }
    }

    /// Fields where the remote has moved away from the recorded state.
    ///
    /// Local-only fields are not compared. Recorded state is left as is.
    pub fn detect_drift(&self, identity: &ResourceIdentity, ctx: &CallContext) -> Result<Vec<FieldChange>> {
        let schema = self.registry.describe(&identity.resource_type)?;
        let recorded = self
            .store
            .get(identity)
            .ok_or_else(|| Error::NotFound(identity.clone()))?;
        let remote = self.executor.fetch(identity, ctx)?;

        let expected: CanonicalConfig = recorded
            .attributes
            .into_iter()
            .filter(|(name, _)| schema.field(name).is_some_and(|f| !f.is_local_only()))
            .collect();
        let drift = field_changes(&schema, &expected, &remote);
        for change in &drift {
            log::warn!("{identity}: `{}` drifted", change.field);
        }
        Ok(drift)
    }

    /// Lifecycle phase of a resource
    pub fn phase(&self, identity: &ResourceIdentity) -> Phase {
        let phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        self.current_phase(&phases, identity)
    }

    /// Normalized config and where it lives. An unnamed config takes the
    /// name of the recorded resource bound to `address` in the same scope.
    fn desired_target(
        &self,
        schema: &Schema,
        raw: &RawConfig,
        address: Option<&str>,
    ) -> Result<(CanonicalConfig, CreateTarget)> {
        let mut desired = self.normalize(schema, raw)?;
        let mut target = create_target(schema, &desired)?;
        if target.name.is_some() {
            return Ok((desired, target));
        }

        let bound = address.and_then(|a| self.store.resolve(a)).filter(|id| {
            id.resource_type == target.resource_type && id.scope == target.scope
        });
        if let Some(identity) = bound {
            log::debug!("{} resolves to {identity}", address.unwrap_or_default());
            desired.insert(
                schema.identity.name_field.clone(),
                Value::String(identity.name.clone()),
            );
            target.name = Some(identity.name);
        }
        Ok((desired, target))
    }

    fn create_locked(
        &self,
        schema: &Schema,
        target: &CreateTarget,
        desired: &CanonicalConfig,
        deadline: &Deadline<'_>,
    ) -> Result<LiveState> {
        let ops = diff(schema, desired, None)?;
        let known = target.identity();
        if let Some(identity) = &known {
            self.begin(identity, OperationKind::Create)?;
        }

        let mut created = None;
        for op in &ops {
            match self.executor.run(Target::New(target), op, deadline) {
                Ok(Outcome::Live(live)) => created = Some(live),
                Ok(_) => {}
                Err(e) => {
                    if let Some(identity) = &known {
                        self.finish(identity, PhaseEvent::Failed);
                    }
                    return Err(e);
                }
            }
        }

        let mut live = created.ok_or_else(|| Error::IndeterminateState {
            target: target.to_string(),
            detail: "create returned no live state".into(),
        })?;
        overlay_local(schema, &mut live, desired);
        self.store.put(live.clone())?;
        match &known {
            Some(identity) => self.finish(identity, PhaseEvent::Succeeded),
            None => self.set_phase(&live.identity, Phase::Present),
        }
        Ok(live)
    }

    fn update_locked(
        &self,
        schema: &Schema,
        live: LiveState,
        desired: &CanonicalConfig,
        deadline: &Deadline<'_>,
    ) -> Result<(LiveState, Vec<ChangeOperation>)> {
        let identity = live.identity.clone();
        let ops = diff(schema, desired, Some(&live))?;
        if ops.is_empty() {
            log::debug!("{identity} is up to date");
            return Ok((live, ops));
        }

        let mut current = live;
        for op in &ops {
            self.begin(&identity, op.kind)?;
            match self.executor.run(Target::Existing(&current), op, deadline) {
                Ok(Outcome::Live(mut next)) => {
                    overlay_local(schema, &mut next, desired);
                    current = next;
                }
                Ok(Outcome::Local) => {
                    current.attributes.extend(op.payload.clone());
                }
                Ok(Outcome::Deleted) => {}
                Err(e) => {
                    if let Error::OperationFailed {
                        refreshed: Some(state),
                        ..
                    } = &e
                    {
                        let mut state = (**state).clone();
                        overlay_local(schema, &mut state, &current.attributes);
                        self.store.put(state)?;
                    }
                    self.finish(&identity, PhaseEvent::Failed);
                    return Err(e);
                }
            }
            self.store.put(current.clone())?;
            if op.is_remote() {
                self.finish(&identity, PhaseEvent::Succeeded);
            }
        }
        Ok((current, ops))
    }

    fn current_phase(&self, phases: &HashMap<ResourceIdentity, Phase>, identity: &ResourceIdentity) -> Phase {
        phases.get(identity).copied().unwrap_or_else(|| {
            if self.store.contains(identity) {
                Phase::Present
            } else {
                Phase::Absent
            }
        })
    }

    fn begin(&self, identity: &ResourceIdentity, kind: OperationKind) -> Result<()> {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current_phase(&phases, identity);
        let next = current
            .advance(PhaseEvent::Begin(kind))
            .ok_or_else(|| Error::InvalidOperation {
                kind,
                target: format!("{identity} in phase {current:?}"),
            })?;
        log::debug!("{identity}: {current:?} -> {next:?}");
        phases.insert(identity.clone(), next);
        Ok(())
    }

    fn finish(&self, identity: &ResourceIdentity, event: PhaseEvent) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        let current = self.current_phase(&phases, identity);
        match current.advance(event) {
            Some(next) => {
                log::debug!("{identity}: {current:?} -> {next:?}");
                record_phase(&mut phases, identity, next);
            }
            None => log::warn!("{identity}: ignoring {event:?} in phase {current:?}"),
        }
    }

    fn observe(&self, identity: &ResourceIdentity, exists: bool) {
        self.finish(identity, PhaseEvent::Observed { exists });
    }

    fn set_phase(&self, identity: &ResourceIdentity, phase: Phase) {
        let mut phases = self.phases.lock().unwrap_or_else(PoisonError::into_inner);
        record_phase(&mut phases, identity, phase);
    }
}

/// Absent is the fallback for identities without an entry, so it is never
/// stored.
fn record_phase(phases: &mut HashMap<ResourceIdentity, Phase>, identity: &ResourceIdentity, phase: Phase) {
    if phase == Phase::Absent {
        phases.remove(identity);
    } else {
        phases.insert(identity.clone(), phase);
    }
}

/// Where a normalized config would be created
fn create_target(
    schema: &Schema,
    desired: &CanonicalConfig,
) -> std::result::Result<CreateTarget, ValidationError> {
    let ids = &schema.identity;
    let scope = desired
        .get(&ids.scope_field)
        .and_then(Value::as_str)
        .ok_or_else(|| ValidationError::MissingField {
            field: ids.scope_field.clone(),
        })?;
    Ok(CreateTarget {
        resource_type: schema.resource_type.clone(),
        scope: scope.to_string(),
        name: desired
            .get(&ids.name_field)
            .and_then(Value::as_str)
            .map(String::from),
    })
}

/// Fill identity fields the raw config leaves out
fn with_identity(schema: &Schema, identity: &ResourceIdentity, raw: &RawConfig) -> RawConfig {
    let mut raw = raw.clone();
    for (field, value) in [
        (&schema.identity.name_field, &identity.name),
        (&schema.identity.scope_field, &identity.scope),
    ] {
        if raw.get(field).is_none_or(Value::is_null) {
            raw.insert(field.clone(), Value::String(value.clone()));
        }
    }
    raw
}

/// Carry local-only values into fetched state, which never has them.
///
/// Values come from `source` when present there, otherwise from the
/// field's default.
fn overlay_local(schema: &Schema, live: &mut LiveState, source: &CanonicalConfig) {
    for field in schema.local_only_fields() {
        match source.get(&field.name).or(field.default.as_ref()) {
            Some(value) => {
                live.attributes.insert(field.name.clone(), value.clone());
            }
            None => {
                live.attributes.remove(&field.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, spanner_instance};
    use crate::context::{CancellationToken, ManualClock};
    use crate::error::{CancelReason, RemoteError, RemoteErrorKind};
    use crate::normalize::derive_config;
    use crate::schema::tests::widget_schema;
    use crate::transport::Request;
    use crate::transport::memory::{Fault, MemoryTransport};
    use serde_json::json;
    use std::time::Duration;

    struct Harness {
        transport: Arc<MemoryTransport>,
        reconciler: Reconciler,
    }

    fn harness(transport: MemoryTransport) -> Harness {
        let registry = catalog::registry().unwrap();
        registry.register(widget_schema()).unwrap();
        let transport = Arc::new(catalog::emulate(transport));
        let executor = Executor::new(transport.clone()).with_clock(Arc::new(ManualClock::new()));
        let reconciler = Reconciler::new(Arc::new(registry), executor, Arc::new(StateStore::new()))
            .with_options(NormalizeOptions {
                default_scope: Some("my-project".into()),
                ..Default::default()
            });
        Harness {
            transport,
            reconciler,
        }
    }

    fn raw(value: Value) -> RawConfig {
        value.as_object().cloned().unwrap()
    }

    fn instance(compute: Value) -> RawConfig {
        let mut config = raw(json!({
            "name": "my-instance",
            "config": "regional-us-central1",
            "display_name": "My Instance",
        }));
        config.extend(raw(compute));
        config
    }

    fn autoscaling(overrides: Value) -> Value {
        json!({"autoscaling_config": {
            "autoscaling_limits": {"min_processing_units": 1000, "max_processing_units": 2000},
            "autoscaling_targets": {
                "high_priority_cpu_utilization_percent": 65,
                "storage_utilization_percent": 95
            },
            "asymmetric_autoscaling_options": overrides,
        }})
    }

    fn region(location: &str) -> Value {
        json!({
            "replica_selection": {"location": location},
            "overrides": {"autoscaling_limits": {
                "min_processing_units": 1000, "max_processing_units": 3000
            }}
        })
    }

    #[test]
    fn test_compute_group_switch_scenario() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();

        let plan = h
            .reconciler
            .plan(&schema, &instance(json!({"processing_units": 100})))
            .unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].kind, OperationKind::Create);

        let (id, live) = h
            .reconciler
            .create(&schema, &instance(json!({"processing_units": 100})), &ctx)
            .unwrap();
        assert_eq!(live.attributes["processing_units"], json!(100));
        assert_eq!(h.reconciler.phase(&id), Phase::Present);

        let scaled = h
            .reconciler
            .apply(&schema, &instance(autoscaling(json!([]))), &ctx)
            .unwrap();
        assert_eq!(scaled.operations.len(), 1);
        assert_eq!(scaled.operations[0].kind, OperationKind::Update);
        assert_eq!(scaled.operations[0].fields, vec!["autoscaling_config".to_string()]);
        assert_eq!(scaled.live.attributes["processing_units"], json!(1000));

        let back = h
            .reconciler
            .apply(&schema, &instance(json!({"processing_units": 100})), &ctx)
            .unwrap();
        assert_eq!(back.operations.len(), 1);
        assert_eq!(back.operations[0].kind, OperationKind::Update);
        assert_eq!(back.live.attributes["processing_units"], json!(100));
        assert!(!back.live.attributes.contains_key("autoscaling_config"));

        // converged
        let again = h
            .reconciler
            .plan(&schema, &instance(json!({"processing_units": 100})))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn test_override_reorder_is_a_change() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let first = instance(autoscaling(json!([region("us-east1"), region("us-west1")])));
        let swapped = instance(autoscaling(json!([region("us-west1"), region("us-east1")])));

        h.reconciler.create(&schema, &first, &ctx).unwrap();
        let plan = h.reconciler.plan(&schema, &swapped).unwrap();
        assert_eq!(plan.operations.len(), 1);
        assert_eq!(plan.operations[0].fields, vec!["autoscaling_config".to_string()]);
    }

    #[test]
    fn test_immutable_change_never_reaches_remote() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap();

        let mut moved = instance(json!({"num_nodes": 1}));
        moved.insert("config".into(), json!("regional-europe-west1"));
        let err = h.reconciler.update(&id, &moved, &ctx).unwrap_err();
        assert!(matches!(
            err.as_validation(),
            Some(ValidationError::ImmutableFieldChanged { fields }) if fields == &["config".to_string()]
        ));
        assert_eq!(h.transport.call_count(), 1);
    }

    #[test]
    fn test_import_round_trip_has_no_drift() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(
                &schema,
                &instance(autoscaling(json!([region("us-east1")]))),
                &ctx,
            )
            .unwrap();

        // a second engine that has never seen the resource
        let registry = catalog::registry().unwrap();
        let other = Reconciler::new(
            Arc::new(registry),
            Executor::new(h.transport.clone()).with_clock(Arc::new(ManualClock::new())),
            Arc::new(StateStore::new()),
        );
        let live = other.import(&id, &ctx).unwrap();
        assert_eq!(live.attributes["force_destroy"], json!(false));

        let derived = derive_config(&schema, &live);
        let desired = other.normalize(&schema, &derived).unwrap();
        assert!(diff(&schema, &desired, Some(&live)).unwrap().is_empty());

        assert!(matches!(
            other.import(&id, &ctx).unwrap_err(),
            Error::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_delete_twice_succeeds() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap();

        h.reconciler.delete(&id, &ctx).unwrap();
        assert_eq!(h.reconciler.phase(&id), Phase::Absent);
        assert!(h.reconciler.phases.lock().unwrap().is_empty());
        h.reconciler.delete(&id, &ctx).unwrap();
        assert_eq!(h.reconciler.phase(&id), Phase::Absent);
        assert!(h.reconciler.store().get(&id).is_none());

        let deletes = h
            .transport
            .requests()
            .into_iter()
            .filter(|r| matches!(r, Request::Delete { .. }))
            .count();
        assert_eq!(deletes, 2);
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let h = harness(MemoryTransport::new());
        let id = ResourceIdentity::new(spanner_instance::RESOURCE_TYPE, "my-project", "nope");
        let err = h.reconciler.read(&id, &CallContext::new()).unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        assert!(h.reconciler.phases.lock().unwrap().is_empty());
        assert!(matches!(
            h.reconciler.import(&id, &CallContext::new()).unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[test]
    fn test_virtual_field_toggle_is_local() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap();

        let live = h
            .reconciler
            .update(&id, &instance(json!({"num_nodes": 1, "force_destroy": true})), &ctx)
            .unwrap();
        assert_eq!(live.attributes["force_destroy"], json!(true));
        assert_eq!(h.transport.call_count(), 1);

        // survives a refresh from the remote
        let refreshed = h.reconciler.read(&id, &ctx).unwrap();
        assert_eq!(refreshed.attributes["force_destroy"], json!(true));
    }

    #[test]
    fn test_edition_uses_separate_call() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap();

        let live = h
            .reconciler
            .update(
                &id,
                &instance(json!({"num_nodes": 2, "edition": "ENTERPRISE"})),
                &ctx,
            )
            .unwrap();
        assert_eq!(live.attributes["edition"], json!("ENTERPRISE"));
        assert_eq!(live.attributes["num_nodes"], json!(2));

        let masks: Vec<Vec<String>> = h
            .transport
            .requests()
            .into_iter()
            .filter_map(|r| match r {
                Request::Patch { update_mask, .. } => Some(update_mask),
                _ => None,
            })
            .collect();
        assert_eq!(masks, vec![vec!["num_nodes".to_string()], vec!["edition".to_string()]]);
    }

    #[test]
    fn test_autogenerated_name() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let mut config = instance(json!({"num_nodes": 1}));
        config.remove("name");

        let (id, live) = h
            .reconciler
            .create(&schema, &config, &CallContext::new())
            .unwrap();
        assert_eq!(id.name, "instance-000001");
        assert_eq!(live.attributes["name"], json!("instance-000001"));
        assert_eq!(h.reconciler.phase(&id), Phase::Present);

        // later updates work without repeating the name
        config.insert("display_name".into(), json!("Renamed"));
        let live = h.reconciler.update(&id, &config, &CallContext::new()).unwrap();
        assert_eq!(live.attributes["display_name"], json!("Renamed"));
    }

    #[test]
    fn test_create_existing_is_already_exists() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        h.reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap();
        let err = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &ctx)
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn test_failed_create_returns_to_absent() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        h.transport.inject(Fault::Operation(RemoteError::new(
            RemoteErrorKind::Permanent,
            "quota exceeded",
        )));
        let err = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &CallContext::new())
            .unwrap_err();
        assert!(matches!(err, Error::OperationFailed { .. }));

        let id = ResourceIdentity::new(spanner_instance::RESOURCE_TYPE, "my-project", "my-instance");
        assert_eq!(h.reconciler.phase(&id), Phase::Absent);
        assert!(h.reconciler.store().get(&id).is_none());
    }

    #[test]
    fn test_failed_update_records_refreshed_state() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1, "force_destroy": true})), &ctx)
            .unwrap();
        // changed out of band
        h.transport.mutate(&id, |attrs| {
            attrs.insert("display_name".into(), json!("Changed"));
        });
        h.transport.inject(Fault::Operation(RemoteError::new(
            RemoteErrorKind::Permanent,
            "invalid",
        )));

        let err = h
            .reconciler
            .update(&id, &instance(json!({"num_nodes": 3, "force_destroy": true})), &ctx)
            .unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));

        // re-read, then the failed operation surfaces with refreshed state
        h.reconciler.read(&id, &ctx).unwrap();
        let err = h
            .reconciler
            .update(&id, &instance(json!({"num_nodes": 3, "force_destroy": true})), &ctx)
            .unwrap_err();
        assert!(matches!(err, Error::OperationFailed { refreshed: Some(_), .. }));
        assert_eq!(h.reconciler.phase(&id), Phase::Present);
        let recorded = h.reconciler.store().get(&id).unwrap();
        assert_eq!(recorded.attributes["num_nodes"], json!(1));
        assert_eq!(recorded.attributes["force_destroy"], json!(true));
    }

    #[test]
    fn test_cancelled_update() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1})), &CallContext::new())
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .reconciler
            .update(&id, &instance(json!({"num_nodes": 2})), &CallContext::with_cancel(token))
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled { reason: CancelReason::Requested, .. }));
        assert_eq!(h.reconciler.phase(&id), Phase::Present);
    }

    #[test]
    fn test_detect_drift() {
        let h = harness(MemoryTransport::new());
        let schema = spanner_instance::schema();
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(&schema, &instance(json!({"num_nodes": 1, "force_destroy": true})), &ctx)
            .unwrap();
        assert!(h.reconciler.detect_drift(&id, &ctx).unwrap().is_empty());

        h.transport.mutate(&id, |attrs| {
            attrs.insert("display_name".into(), json!("Changed"));
        });
        let drift = h.reconciler.detect_drift(&id, &ctx).unwrap();
        assert_eq!(drift.len(), 1);
        assert_eq!(drift[0].field, "display_name");
    }

    #[test]
    fn test_concurrent_updates_serialized() {
        let h = harness(MemoryTransport::new().with_call_delay(Duration::from_millis(10)));
        let ctx = CallContext::new();
        let (id, _) = h
            .reconciler
            .create(
                &widget_schema(),
                &raw(json!({"name": "w1", "region": "us", "size": 1})),
                &ctx,
            )
            .unwrap();

        std::thread::scope(|s| {
            for size in [2, 3, 4, 5] {
                let h = &h;
                let id = &id;
                s.spawn(move || {
                    let config = raw(json!({"name": "w1", "region": "us", "size": size}));
                    h.reconciler.update(id, &config, &CallContext::new()).unwrap();
                });
            }
        });
        // without the identity lock, stale fingerprints would conflict
        assert_eq!(h.transport.max_in_flight(), 1);
        assert_eq!(h.transport.call_count(), 5);
    }

    #[test]
    fn test_different_identities_in_parallel() {
        let h = harness(MemoryTransport::new());
        let ctx = CallContext::new();
        std::thread::scope(|s| {
            for name in ["a", "b", "c"] {
                let h = &h;
                let ctx = &ctx;
                s.spawn(move || {
                    let config = raw(json!({"name": name, "region": "us"}));
                    h.reconciler.apply(&widget_schema(), &config, ctx).unwrap();
                });
            }
        });
        assert_eq!(h.reconciler.store().len(), 3);
    }

    #[test]
    fn test_transfer_job_lifecycle() {
        let h = harness(MemoryTransport::new());
        let schema = catalog::storage_transfer_job::schema();
        let ctx = CallContext::new();
        let job = raw(json!({
            "description": "nightly copy",
            "gcs_data_source": {"bucket_name": "src", "path": "foo/bar/"},
            "gcs_data_sink": {"bucket_name": "dst", "path": "foo/bar/"},
            "notification_config": {
                "pubsub_topic": "projects/my-project/topics/jobs",
                "payload_format": "NONE"
            }
        }));

        let (id, live) = h.reconciler.create(&schema, &job, &ctx).unwrap();
        assert!(id.name.starts_with("transferJobs/"));
        assert!(live.attributes.contains_key("creation_time"));
        assert!(!live.attributes["notification_config"]
            .as_object()
            .unwrap()
            .contains_key("event_types"));

        let mut scheduled = job.clone();
        scheduled.insert(
            "schedule".into(),
            json!({
                "schedule_start_date": {"year": 2018, "month": 10, "day": 1},
                "start_time_of_day": {"hours": 0, "minutes": 30},
                "repeat_interval": "604800.000s"
            }),
        );
        let live = h.reconciler.update(&id, &scheduled, &ctx).unwrap();
        assert_eq!(live.attributes["schedule"]["repeat_interval"], json!("604800s"));

        // server timestamps never show up as changes
        scheduled.insert("name".into(), json!(id.name.clone()));
        assert!(h.reconciler.plan(&schema, &scheduled).unwrap().is_empty());
    }

    fn nightly_job() -> RawConfig {
        raw(json!({
            "description": "nightly copy",
            "gcs_data_source": {"bucket_name": "src"},
            "gcs_data_sink": {"bucket_name": "dst"}
        }))
    }

    #[test]
    fn test_apply_at_converges_for_server_named() {
        let h = harness(MemoryTransport::new());
        let schema = catalog::storage_transfer_job::schema();
        let ctx = CallContext::new();
        let job = nightly_job();

        let first = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &job, &ctx)
            .unwrap();
        assert_eq!(first.operations[0].kind, OperationKind::Create);
        assert!(first.identity.name.starts_with("transferJobs/"));

        assert!(h
            .reconciler
            .plan_at("storage_transfer_job.nightly", &schema, &job)
            .unwrap()
            .is_empty());
        let second = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &job, &ctx)
            .unwrap();
        assert!(second.operations.is_empty());
        assert_eq!(second.identity, first.identity);
        assert_eq!(h.reconciler.store().len(), 1);

        // changes go to the bound job
        let mut renamed = job.clone();
        renamed.insert("description".into(), json!("weekly copy"));
        let third = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &renamed, &ctx)
            .unwrap();
        assert_eq!(third.operations[0].kind, OperationKind::Update);
        assert_eq!(third.identity, first.identity);
        assert_eq!(h.reconciler.store().len(), 1);

        // a plain apply has no address to go by
        let unbound = h.reconciler.apply(&schema, &job, &ctx).unwrap();
        assert_ne!(unbound.identity, first.identity);
        assert_eq!(h.reconciler.store().len(), 2);
    }

    #[test]
    fn test_apply_at_after_delete_creates_again() {
        let h = harness(MemoryTransport::new());
        let schema = catalog::storage_transfer_job::schema();
        let ctx = CallContext::new();
        let job = nightly_job();

        let first = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &job, &ctx)
            .unwrap();
        h.reconciler.delete(&first.identity, &ctx).unwrap();
        assert!(h.reconciler.store().resolve("storage_transfer_job.nightly").is_none());

        let again = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &job, &ctx)
            .unwrap();
        assert_eq!(again.operations[0].kind, OperationKind::Create);
        assert_ne!(again.identity, first.identity);
        assert_eq!(
            h.reconciler.store().resolve("storage_transfer_job.nightly"),
            Some(again.identity)
        );
    }

    #[test]
    fn test_apply_at_ignores_binding_in_other_scope() {
        let h = harness(MemoryTransport::new());
        let schema = catalog::storage_transfer_job::schema();
        let ctx = CallContext::new();
        let first = h
            .reconciler
            .apply_at("storage_transfer_job.nightly", &schema, &nightly_job(), &ctx)
            .unwrap();

        let mut elsewhere = nightly_job();
        elsewhere.insert("project".into(), json!("other-project"));
        let plan = h
            .reconciler
            .plan_at("storage_transfer_job.nightly", &schema, &elsewhere)
            .unwrap();
        assert_eq!(plan.operations[0].kind, OperationKind::Create);
        assert_eq!(plan.target.scope, "other-project");
        assert_ne!(plan.target.scope, first.identity.scope);
    }
}
