//! In-memory emulated remote
//!
//! Keeps resources in a map, answers mutating calls with long-running
//! operations that finish after a configurable number of polls, and lets
//! tests script faults. Per-type [`TypeBehavior`] fills server-computed
//! fields the way the real API would.

use super::{CallResponse, OperationHandle, OperationStatus, RemoteResource, Request, Transport};
use crate::error::{RemoteError, RemoteErrorKind};
use crate::types::{CanonicalConfig, ResourceIdentity, fingerprint};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Server-side rewrite after a write lands. Receives the written fields.
pub type ServerHook = fn(&mut CanonicalConfig, &[String]);

/// Builds a server-assigned name from a sequence number
pub type NameGenerator = fn(u64) -> String;

/// How the emulated server treats one resource type
#[derive(Debug, Clone, Copy)]
pub struct TypeBehavior {
    /// Attribute that holds the resource name
    pub name_field: &'static str,
    pub generate_name: Option<NameGenerator>,
    pub on_write: Option<ServerHook>,
    /// Writes complete in the call itself, without an operation handle
    pub synchronous: bool,
}

impl Default for TypeBehavior {
    fn default() -> Self {
        Self {
            name_field: "name",
            generate_name: None,
            on_write: None,
            synchronous: false,
        }
    }
}

/// A scripted failure, consumed by the first matching request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Returned by the next `call`
    Call(RemoteError),
    /// Returned by the next `poll`
    Poll(RemoteError),
    /// Returned by the next `fetch`
    Fetch(RemoteError),
    /// The next started operation ends in this failure without effect
    Operation(RemoteError),
}

/// What a finished operation does to the resource map
#[derive(Debug)]
enum Effect {
    Write {
        identity: ResourceIdentity,
        attributes: CanonicalConfig,
    },
    Remove(ResourceIdentity),
}

#[derive(Debug)]
struct PendingOperation {
    remaining_polls: u32,
    effect: Effect,
    failure: Option<RemoteError>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: BTreeMap<ResourceIdentity, CanonicalConfig>,
    operations: HashMap<String, PendingOperation>,
    next_id: u64,
    faults: VecDeque<Fault>,
    requests: Vec<Request>,
}

impl Inner {
    fn take_fault(&mut self, matches: impl Fn(&Fault) -> bool) -> Option<Fault> {
        let pos = self.faults.iter().position(matches)?;
        self.faults.remove(pos)
    }

    fn apply(&mut self, effect: Effect) {
        match effect {
            Effect::Write {
                identity,
                attributes,
            } => {
                self.resources.insert(identity, attributes);
            }
            Effect::Remove(identity) => {
                self.resources.remove(&identity);
            }
        }
    }
}

/// Serializable contents of a [`MemoryTransport`]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub resources: Vec<StoredResource>,
    pub next_id: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredResource {
    pub identity: ResourceIdentity,
    pub attributes: CanonicalConfig,
}

/// Thread-safe emulated remote
#[derive(Debug, Default)]
pub struct MemoryTransport {
    inner: Mutex<Inner>,
    behaviors: HashMap<String, TypeBehavior>,
    /// `None` completes writes synchronously, without an operation handle
    polls_before_done: Option<u32>,
    call_delay: Duration,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MemoryTransport {
    /// Long-running writes that finish on the second poll
    pub fn new() -> Self {
        Self {
            polls_before_done: Some(1),
            ..Self::default()
        }
    }

    /// Writes take effect immediately and return no operation handle
    pub fn synchronous() -> Self {
        Self::default()
    }

    /// Number of `Pending` answers before an operation is done
    #[must_use]
    pub fn with_polls(mut self, polls: u32) -> Self {
        self.polls_before_done = Some(polls);
        self
    }

    #[must_use]
    pub fn with_behavior(mut self, resource_type: impl Into<String>, behavior: TypeBehavior) -> Self {
        self.behaviors.insert(resource_type.into(), behavior);
        self
    }

    /// Hold every `call` for `delay`, so overlapping calls are observable
    #[must_use]
    pub fn with_call_delay(mut self, delay: Duration) -> Self {
        self.call_delay = delay;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn behavior(&self, resource_type: &str) -> TypeBehavior {
        self.behaviors.get(resource_type).copied().unwrap_or_default()
    }

    /// Queue a failure for the next matching request
    pub fn inject(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    /// Place a resource directly, as if created outside the engine
    pub fn insert(&self, identity: ResourceIdentity, attributes: CanonicalConfig) {
        self.lock().resources.insert(identity, attributes);
    }

    /// Change a resource out of band. Returns false if it does not exist.
    pub fn mutate(&self, identity: &ResourceIdentity, f: impl FnOnce(&mut CanonicalConfig)) -> bool {
        match self.lock().resources.get_mut(identity) {
            Some(attributes) => {
                f(attributes);
                true
            }
            None => false,
        }
    }

    pub fn resource(&self, identity: &ResourceIdentity) -> Option<CanonicalConfig> {
        self.lock().resources.get(identity).cloned()
    }

    /// Every mutating request received, in order
    pub fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub fn call_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Highest number of `call`s observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> MemorySnapshot {
        let inner = self.lock();
        MemorySnapshot {
            resources: inner
                .resources
                .iter()
                .map(|(identity, attributes)| StoredResource {
                    identity: identity.clone(),
                    attributes: attributes.clone(),
                })
                .collect(),
            next_id: inner.next_id,
        }
    }

    pub fn restore(&self, snapshot: MemorySnapshot) {
        let mut inner = self.lock();
        inner.resources = snapshot
            .resources
            .into_iter()
            .map(|r| (r.identity, r.attributes))
            .collect();
        inner.next_id = snapshot.next_id;
        inner.operations.clear();
    }

    fn plan_effect(&self, inner: &mut Inner, request: &Request) -> Result<(ResourceIdentity, Effect), RemoteError> {
        match request {
            Request::Create { target, payload } => {
                let behavior = self.behavior(&target.resource_type);
                let name = match (&target.name, behavior.generate_name) {
                    (Some(name), _) => name.clone(),
                    (None, Some(generate)) => {
                        inner.next_id += 1;
                        generate(inner.next_id)
                    }
                    (None, None) => {
                        return Err(RemoteError::new(
                            RemoteErrorKind::FailedPrecondition,
                            format!("{} requires a name", target.resource_type),
                        ));
                    }
                };
                let identity = ResourceIdentity::new(&target.resource_type, &target.scope, name);
                let pending_create = inner.operations.values().any(|op| {
                    matches!(&op.effect, Effect::Write { identity: id, .. } if *id == identity)
                });
                if inner.resources.contains_key(&identity) || pending_create {
                    return Err(RemoteError::new(
                        RemoteErrorKind::AlreadyExists,
                        format!("{identity} already exists"),
                    ));
                }

                let mut attributes = payload.clone();
                attributes.insert(
                    behavior.name_field.to_string(),
                    Value::String(identity.name.clone()),
                );
                let written: Vec<String> = payload.keys().cloned().collect();
                if let Some(hook) = behavior.on_write {
                    hook(&mut attributes, &written);
                }
                Ok((
                    identity.clone(),
                    Effect::Write {
                        identity,
                        attributes,
                    },
                ))
            }
            Request::Patch {
                identity,
                payload,
                update_mask,
                fingerprint: expected,
            } => {
                let current = inner
                    .resources
                    .get(identity)
                    .ok_or_else(|| RemoteError::not_found(format!("{identity} not found")))?;
                if let Some(expected) = expected
                    && *expected != fingerprint(current)
                {
                    return Err(RemoteError::new(
                        RemoteErrorKind::Conflict,
                        format!("{identity} was modified concurrently"),
                    ));
                }

                let mut attributes = current.clone();
                for field in update_mask {
                    match payload.get(field) {
                        Some(value) => {
                            attributes.insert(field.clone(), value.clone());
                        }
                        None => {
                            attributes.remove(field);
                        }
                    }
                }
                if let Some(hook) = self.behavior(&identity.resource_type).on_write {
                    hook(&mut attributes, update_mask);
                }
                Ok((
                    identity.clone(),
                    Effect::Write {
                        identity: identity.clone(),
                        attributes,
                    },
                ))
            }
            Request::Delete { identity } => {
                if !inner.resources.contains_key(identity) {
                    return Err(RemoteError::not_found(format!("{identity} not found")));
                }
                Ok((identity.clone(), Effect::Remove(identity.clone())))
            }
        }
    }
}

impl Transport for MemoryTransport {
    fn call(&self, request: &Request) -> Result<CallResponse, RemoteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlight(&self.in_flight);
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            std::thread::sleep(self.call_delay);
        }

        let mut inner = self.lock();
        inner.requests.push(request.clone());
        if let Some(Fault::Call(err)) = inner.take_fault(|f| matches!(f, Fault::Call(_))) {
            log::debug!("memory: injected {} failure for {}", request.method(), request.target());
            return Err(err);
        }

        let (identity, effect) = self.plan_effect(&mut inner, request)?;
        let failure = match inner.take_fault(|f| matches!(f, Fault::Operation(_))) {
            Some(Fault::Operation(err)) => Some(err),
            _ => None,
        };

        let polls = if self.behavior(request.resource_type()).synchronous {
            None
        } else {
            self.polls_before_done
        };
        match polls {
            None => {
                if let Some(err) = failure {
                    return Err(err);
                }
                inner.apply(effect);
                Ok(CallResponse {
                    identity,
                    operation: None,
                })
            }
            Some(polls) => {
                inner.next_id += 1;
                let name = format!("operations/{}-{}", request.method(), inner.next_id);
                inner.operations.insert(
                    name.clone(),
                    PendingOperation {
                        remaining_polls: polls,
                        effect,
                        failure,
                    },
                );
                Ok(CallResponse {
                    identity,
                    operation: Some(OperationHandle { name }),
                })
            }
        }
    }

    fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus, RemoteError> {
        let mut inner = self.lock();
        if let Some(Fault::Poll(err)) = inner.take_fault(|f| matches!(f, Fault::Poll(_))) {
            return Err(err);
        }

        let pending = inner
            .operations
            .get_mut(&operation.name)
            .ok_or_else(|| RemoteError::not_found(format!("operation {operation} not found")))?;
        if pending.remaining_polls > 0 {
            pending.remaining_polls -= 1;
            return Ok(OperationStatus::Pending);
        }

        let Some(done) = inner.operations.remove(&operation.name) else {
            return Err(RemoteError::not_found(format!("operation {operation} not found")));
        };
        match done.failure {
            Some(err) => Ok(OperationStatus::Failed(err)),
            None => {
                inner.apply(done.effect);
                Ok(OperationStatus::Done)
            }
        }
    }

    fn fetch(&self, identity: &ResourceIdentity) -> Result<RemoteResource, RemoteError> {
        let mut inner = self.lock();
        if let Some(Fault::Fetch(err)) = inner.take_fault(|f| matches!(f, Fault::Fetch(_))) {
            return Err(err);
        }
        let attributes = inner
            .resources
            .get(identity)
            .cloned()
            .ok_or_else(|| RemoteError::not_found(format!("{identity} not found")))?;
        Ok(RemoteResource {
            identity: identity.clone(),
            etag: Some(fingerprint(&attributes)),
            attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CreateTarget;
    use serde_json::json;

    fn config(value: Value) -> CanonicalConfig {
        serde_json::from_value(value).unwrap()
    }

    fn create(name: Option<&str>) -> Request {
        Request::Create {
            target: CreateTarget {
                resource_type: "widget".into(),
                scope: "proj".into(),
                name: name.map(String::from),
            },
            payload: config(json!({"size": 2})),
        }
    }

    fn finish(transport: &MemoryTransport, handle: &OperationHandle) -> OperationStatus {
        loop {
            match transport.poll(handle).unwrap() {
                OperationStatus::Pending => continue,
                other => return other,
            }
        }
    }

    #[test]
    fn test_create_lands_after_polls() {
        let transport = MemoryTransport::new().with_polls(2);
        let response = transport.call(&create(Some("w1"))).unwrap();
        let handle = response.operation.unwrap();
        let id = ResourceIdentity::new("widget", "proj", "w1");

        assert_eq!(transport.poll(&handle).unwrap(), OperationStatus::Pending);
        assert!(transport.fetch(&id).is_err());
        assert_eq!(transport.poll(&handle).unwrap(), OperationStatus::Pending);
        assert_eq!(transport.poll(&handle).unwrap(), OperationStatus::Done);

        let remote = transport.fetch(&id).unwrap();
        assert_eq!(remote.attributes["name"], json!("w1"));
        assert_eq!(remote.etag, Some(fingerprint(&remote.attributes)));
    }

    #[test]
    fn test_server_assigned_name() {
        let transport = MemoryTransport::synchronous().with_behavior(
            "widget",
            TypeBehavior {
                generate_name: Some(|n| format!("widgets/{n}")),
                ..Default::default()
            },
        );
        let response = transport.call(&create(None)).unwrap();
        assert_eq!(response.identity.name, "widgets/1");
        assert!(response.operation.is_none());

        let err = MemoryTransport::synchronous().call(&create(None)).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::FailedPrecondition);
    }

    #[test]
    fn test_patch_fingerprint_conflict() {
        let transport = MemoryTransport::synchronous();
        transport.call(&create(Some("w1"))).unwrap();
        let id = ResourceIdentity::new("widget", "proj", "w1");
        let patch = Request::Patch {
            identity: id.clone(),
            payload: config(json!({"size": 5})),
            update_mask: vec!["size".into()],
            fingerprint: Some("stale".into()),
        };
        let err = transport.call(&patch).unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::Conflict);
        assert_eq!(transport.resource(&id).unwrap()["size"], json!(2));
    }

    #[test]
    fn test_patch_clears_masked_field() {
        let transport = MemoryTransport::synchronous();
        transport.call(&create(Some("w1"))).unwrap();
        let id = ResourceIdentity::new("widget", "proj", "w1");
        transport
            .call(&Request::Patch {
                identity: id.clone(),
                payload: config(json!({"units": 300})),
                update_mask: vec!["size".into(), "units".into()],
                fingerprint: None,
            })
            .unwrap();
        let attrs = transport.resource(&id).unwrap();
        assert!(!attrs.contains_key("size"));
        assert_eq!(attrs["units"], json!(300));
    }

    #[test]
    fn test_scripted_faults() {
        let transport = MemoryTransport::new();
        transport.inject(Fault::Call(RemoteError::transient("503")));
        transport.inject(Fault::Operation(RemoteError::new(
            RemoteErrorKind::Permanent,
            "quota",
        )));

        assert!(transport.call(&create(Some("w1"))).unwrap_err().is_transient());
        let handle = transport.call(&create(Some("w1"))).unwrap().operation.unwrap();
        assert!(matches!(finish(&transport, &handle), OperationStatus::Failed(_)));
        assert!(transport.resource(&ResourceIdentity::new("widget", "proj", "w1")).is_none());
        assert_eq!(transport.call_count(), 2);
    }

    #[test]
    fn test_delete_missing_is_not_found() {
        let transport = MemoryTransport::new();
        let err = transport
            .call(&Request::Delete {
                identity: ResourceIdentity::new("widget", "proj", "gone"),
            })
            .unwrap_err();
        assert_eq!(err.kind, RemoteErrorKind::NotFound);
    }

    #[test]
    fn test_snapshot_restore() {
        let transport = MemoryTransport::synchronous();
        transport.call(&create(Some("w1"))).unwrap();
        let snapshot = transport.snapshot();
        let json = serde_json::to_string(&snapshot).unwrap();

        let other = MemoryTransport::synchronous();
        other.restore(serde_json::from_str(&json).unwrap());
        assert!(other.fetch(&ResourceIdentity::new("widget", "proj", "w1")).is_ok());
    }
}
