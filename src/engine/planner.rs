//! Execution planner - one plan per manifest resource

use super::Engine;
use crate::manifest::{Manifest, ResourceDecl};
use anyhow::Result;
use declarative::{Plan, RawConfig, Schema};
use std::sync::Arc;

/// A manifest resource with its computed plan, or why it has none
#[derive(Debug)]
pub struct Planned {
    pub label: String,
    /// Where the manifest declares it, see [`Manifest::addresses`]
    pub address: String,
    pub schema: Option<Arc<Schema>>,
    pub raw: RawConfig,
    pub plan: Result<Plan>,
}

impl Planned {
    pub fn has_changes(&self) -> bool {
        self.plan.as_ref().is_ok_and(|p| !p.is_empty())
    }

    pub fn is_invalid(&self) -> bool {
        self.plan.is_err()
    }
}

/// Plan every resource. Invalid resources carry their error and do not
/// stop the rest from being planned.
pub fn plan_manifest(engine: &Engine, manifest: &Manifest) -> Vec<Planned> {
    manifest
        .resources
        .iter()
        .zip(manifest.addresses())
        .map(|(decl, address)| plan_one(engine, decl, address))
        .collect()
}

fn plan_one(engine: &Engine, decl: &ResourceDecl, address: String) -> Planned {
    let label = decl.label();
    let schema = match engine.schema(&decl.resource_type) {
        Ok(schema) => schema,
        Err(e) => {
            return Planned {
                label,
                address,
                schema: None,
                raw: decl.config.clone(),
                plan: Err(e),
            };
        }
    };

    let (raw, plan) = match decl.raw_config(&schema) {
        Ok(raw) => {
            let plan = engine
                .reconciler
                .plan_at(&address, &schema, &raw)
                .map_err(Into::into);
            (raw, plan)
        }
        Err(e) => (decl.config.clone(), Err(e.into())),
    };
    let label = plan
        .as_ref()
        .ok()
        .and_then(|p| p.target.identity())
        .map_or(label, |id| id.to_string());

    Planned {
        label,
        address,
        schema: Some(schema),
        raw,
        plan,
    }
}
