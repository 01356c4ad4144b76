//! Built-in resource types
//!
//! Each module declares a [`Schema`] and the [`TypeBehavior`] the emulated
//! remote uses to fill in server-computed fields for that type.

pub mod spanner_instance;
pub mod storage_transfer_job;

use crate::error::Result;
use crate::schema::{Schema, SchemaRegistry};
use crate::transport::memory::{MemoryTransport, TypeBehavior};

/// Every built-in schema
pub fn schemas() -> Vec<Schema> {
    vec![spanner_instance::schema(), storage_transfer_job::schema()]
}

/// A registry holding every built-in schema
pub fn registry() -> Result<SchemaRegistry> {
    let registry = SchemaRegistry::new();
    for schema in schemas() {
        registry.register(schema)?;
    }
    Ok(registry)
}

/// Emulated server behavior per built-in type
pub fn behaviors() -> Vec<(&'static str, TypeBehavior)> {
    vec![
        (spanner_instance::RESOURCE_TYPE, spanner_instance::behavior()),
        (storage_transfer_job::RESOURCE_TYPE, storage_transfer_job::behavior()),
    ]
}

/// Teach an emulated remote how the built-in types behave
pub fn emulate(transport: MemoryTransport) -> MemoryTransport {
    behaviors()
        .into_iter()
        .fold(transport, |t, (resource_type, behavior)| t.with_behavior(resource_type, behavior))
}
