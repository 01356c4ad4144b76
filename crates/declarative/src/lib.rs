//! # Declarative
//!
//! Declarative reconciliation of remote resources.
//!
//! A user states the desired configuration of a resource. The engine
//! normalizes it against the resource type's schema, diffs it against the
//! last known live state, and issues the create, update or delete calls
//! that converge the remote, waiting on long-running operations as needed.
//!
//! ## Core Concepts
//!
//! - **Schema**: Fields, constraints and exclusive groups of a resource type
//! - **CanonicalConfig**: Desired state after validation and defaulting
//! - **ChangeOperation**: One remote call (or local-only update) in a diff
//! - **LiveState**: What the remote last reported for a resource
//! - **Reconciler**: Create, read, update, delete and import per identity
//!
//! ## Example
//!
//! ```ignore
//! use declarative::{catalog, CallContext, Executor, Reconciler, StateStore};
//! use declarative::transport::memory::MemoryTransport;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(catalog::registry()?);
//! let transport = Arc::new(catalog::emulate(MemoryTransport::new()));
//! let reconciler = Reconciler::new(registry, Executor::new(transport), Arc::new(StateStore::new()));
//!
//! let schema = reconciler.registry().describe("spanner_instance")?;
//! let config = serde_json::json!({
//!     "name": "main",
//!     "project": "my-project",
//!     "config": "regional-us-central1",
//!     "display_name": "Main",
//!     "num_nodes": 1,
//! });
//! let applied = reconciler.apply(&schema, config.as_object().unwrap(), &CallContext::new())?;
//! ```
//!
//! ## Transport
//!
//! Remote calls go through the [`Transport`] trait. The crate ships an
//! in-memory emulation ([`transport::memory::MemoryTransport`]) that the
//! tests and the CLI's simulated mode use; the built-in types in
//! [`catalog`] teach it how their server fills computed fields.

pub mod catalog;
pub mod config;
pub mod context;
pub mod diff;
pub mod error;
pub mod executor;
pub mod normalize;
pub mod reconciler;
pub mod retry;
pub mod schema;
pub mod specs;
pub mod store;
pub mod transport;
pub mod types;

// Re-export main types at crate root
pub use config::EngineConfig;
pub use context::{CallContext, CancellationToken, Clock, ManualClock, SystemClock};
pub use diff::{DiffSummary, FieldChange, delete_operation, diff, field_changes};
pub use error::{
    CancelReason, Error, ErrorCategory, RemoteError, RemoteErrorKind, Result, SchemaError,
    ValidationError,
};
pub use executor::{Executor, ExecutorConfig, Outcome, Target};
pub use normalize::{NormalizeOptions, derive_config, normalize};
pub use reconciler::{Applied, Plan, Reconciler};
pub use retry::RetryConfig;
pub use schema::{
    FieldGroup, FieldKind, FieldSpec, IdentityFields, NameAssignment, Schema, SchemaRegistry,
    SpecKind, UpdateRoute,
};
pub use store::{IdentityGuard, StateStore};
pub use transport::Transport;
pub use types::{
    CanonicalConfig, ChangeOperation, CreateTarget, LiveState, OperationKind, Phase, PhaseEvent,
    RawConfig, ResourceIdentity, fingerprint,
};
