//! Execution engine for converge
//!
//! The engine wires the reconciler to the emulated remote and orchestrates:
//! 1. Planning - Normalize and diff every resource in a manifest
//! 2. Diffing - Render the operations for review
//! 3. Executing - Apply resources in parallel

pub mod differ;
pub mod executor;
pub mod planner;

pub use executor::{ExecuteOptions, execute};
pub use planner::{Planned, plan_manifest};

use crate::config::AppConfig;
use crate::state::{RemoteFile, open_store};
use anyhow::{Context as AnyhowContext, Result};
use declarative::transport::memory::MemoryTransport;
use declarative::{
    CallContext, EngineConfig, Executor, Reconciler, ResourceIdentity, Schema, catalog,
};
use std::path::Path;
use std::sync::Arc;

/// A reconciler bound to on-disk state and the emulated remote
#[derive(Debug)]
pub struct Engine {
    pub reconciler: Reconciler,
    transport: Arc<MemoryTransport>,
    remote: RemoteFile,
    config: EngineConfig,
}

impl Engine {
    pub fn open(config: &AppConfig, state: Option<&Path>, remote: Option<&Path>) -> Result<Self> {
        let state_path = config.state_path(state)?;
        let remote = RemoteFile::new(config.remote_path(remote)?);
        log::debug!(
            "State: {}, remote: {}",
            state_path.display(),
            remote.path().display()
        );

        // Operations finish on their first poll
        let transport = Arc::new(catalog::emulate(MemoryTransport::new().with_polls(0)));
        remote.load_into(&transport)?;

        let registry = catalog::registry().context("Failed to register built-in types")?;
        let executor =
            Executor::new(transport.clone()).with_config(config.engine.executor_config());
        let reconciler = Reconciler::new(
            Arc::new(registry),
            executor,
            Arc::new(open_store(&state_path)?),
        )
        .with_options(config.engine.normalize_options());

        Ok(Self {
            reconciler,
            transport,
            remote,
            config: config.engine.clone(),
        })
    }

    pub fn schema(&self, resource_type: &str) -> Result<Arc<Schema>> {
        Ok(self.reconciler.registry().describe(resource_type)?)
    }

    /// Schema for the type an identity names
    pub fn schema_of(&self, identity: &ResourceIdentity) -> Result<Arc<Schema>> {
        self.schema(&identity.resource_type)
    }

    /// A fresh context carrying the configured timeout
    pub fn call_context(&self) -> CallContext {
        self.config.call_context()
    }

    /// Persist the emulated remote after mutating commands
    pub fn save_remote(&self) -> Result<()> {
        self.remote.save(&self.transport)
    }
}
