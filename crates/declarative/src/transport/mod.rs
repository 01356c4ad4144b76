//! Remote transport - the seam between the engine and a cloud API
//!
//! The engine never speaks HTTP or RPC itself. A [`Transport`] issues the
//! mutating call, reports on long-running operations, and reads back the
//! live resource. [`memory::MemoryTransport`] is an in-process emulation.

pub mod memory;

use crate::error::RemoteError;
use crate::types::{CanonicalConfig, CreateTarget, ResourceIdentity};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A mutating remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Request {
    Create {
        target: CreateTarget,
        payload: CanonicalConfig,
    },
    /// Whole-resource patch restricted to `update_mask`.
    ///
    /// A mask field absent from `payload` is cleared. When `fingerprint` is
    /// set the remote rejects the patch with a conflict if the resource
    /// changed since that version.
    Patch {
        identity: ResourceIdentity,
        payload: CanonicalConfig,
        update_mask: Vec<String>,
        fingerprint: Option<String>,
    },
    Delete {
        identity: ResourceIdentity,
    },
}

impl Request {
    /// Human-readable target of the request, for logs and errors
    pub fn target(&self) -> String {
        match self {
            Self::Create { target, .. } => target.to_string(),
            Self::Patch { identity, .. } | Self::Delete { identity } => identity.to_string(),
        }
    }

    pub fn resource_type(&self) -> &str {
        match self {
            Self::Create { target, .. } => &target.resource_type,
            Self::Patch { identity, .. } | Self::Delete { identity } => &identity.resource_type,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Patch { .. } => "patch",
            Self::Delete { .. } => "delete",
        }
    }
}

/// Opaque reference to a long-running remote operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OperationHandle {
    pub name: String,
}

impl fmt::Display for OperationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Immediate answer to a mutating call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallResponse {
    /// Identity of the affected resource, including a server-assigned name
    pub identity: ResourceIdentity,
    /// Present when completion must be polled
    pub operation: Option<OperationHandle>,
}

/// Progress of a long-running operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationStatus {
    Pending,
    Done,
    Failed(RemoteError),
}

/// A resource as the remote reports it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteResource {
    pub identity: ResourceIdentity,
    pub attributes: CanonicalConfig,
    /// Remote-supplied version tag, if the API has one
    pub etag: Option<String>,
}

/// Client for a remote resource API.
///
/// Implementations must be safe to share across threads; the engine issues
/// calls for different identities concurrently.
pub trait Transport: Send + Sync {
    fn call(&self, request: &Request) -> Result<CallResponse, RemoteError>;

    fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus, RemoteError>;

    fn fetch(&self, identity: &ResourceIdentity) -> Result<RemoteResource, RemoteError>;
}

impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    fn call(&self, request: &Request) -> Result<CallResponse, RemoteError> {
        (**self).call(request)
    }

    fn poll(&self, operation: &OperationHandle) -> Result<OperationStatus, RemoteError> {
        (**self).poll(operation)
    }

    fn fetch(&self, identity: &ResourceIdentity) -> Result<RemoteResource, RemoteError> {
        (**self).fetch(identity)
    }
}
